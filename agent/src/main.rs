//! Agent entry point (§4.3): dial each configured server in turn over mTLS,
//! multiplex the connection with this peer playing the *acceptor* role, and
//! dispatch every inbound stream to its protocol handler. Reconnects with a
//! fixed backoff on any failure, matching the reference implementation's
//! agent main loop.

mod handlers;
mod interfaces;
mod proxy;
mod redirector;
mod udp;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use service::mux::{Multiplex, Role};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::proxy::Dialer;
use crate::redirector::Redirectors;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// CLI surface for the agent binary (§4.3, §10).
#[derive(Parser, Debug, Clone)]
#[command(name = "ligolo-agent", version, about = "Pivoting proxy agent")]
struct Cli {
    /// One or more "host:port" addresses of a ligolo-server's agent-facing
    /// listener. Tried in order on every reconnect attempt.
    #[arg(long = "server", required = true)]
    servers: Vec<String>,

    /// Alias this agent reports in `InfoReply`; defaults to the hostname.
    #[arg(long)]
    alias: Option<String>,

    /// PEM certificate chain identifying this agent to the server.
    #[arg(long, default_value = "agent.crt")]
    cert: String,

    /// PEM private key matching `--cert`.
    #[arg(long, default_value = "agent.key")]
    key: String,

    /// PEM CA certificate used to verify the server's certificate.
    #[arg(long, default_value = "ca.crt")]
    ca: String,

    /// Route outbound `ConnectRequest` dials through an HTTP(S) CONNECT
    /// proxy at this "host:port" instead of dialing directly.
    #[arg(long, conflicts_with = "socks5_proxy")]
    http_proxy: Option<String>,

    /// Route outbound `ConnectRequest` dials through a SOCKS5 proxy at this
    /// "host:port" instead of dialing directly.
    #[arg(long, conflicts_with = "http_proxy")]
    socks5_proxy: Option<String>,

    /// -v, -vv, -vvv raise log verbosity from Info to Debug to Trace.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn level(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    simple_logger::SimpleLogger::new().with_level(level(cli.verbose)).init()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let alias = cli.alias.clone().unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
    let dialer = if let Some(proxy) = cli.http_proxy.clone() {
        Dialer::HttpConnect { proxy }
    } else if let Some(proxy) = cli.socks5_proxy.clone() {
        Dialer::Socks5 { proxy }
    } else {
        Dialer::Direct
    };

    let tls_config = Arc::new(build_tls_config(&cli)?);

    loop {
        for server in &cli.servers {
            match connect_once(server, tls_config.clone(), &alias, dialer.clone()).await {
                Ok(()) => log::info!("agent: session with {server} ended, reconnecting"),
                Err(err) => log::warn!("agent: could not reach {server}: {err}"),
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn build_tls_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let certs = CertificateDer::pem_file_iter(&cli.cert)?.collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(&cli.key)?;

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(&cli.ca)?.collect::<Result<Vec<_>, _>>()? {
        roots.add(cert)?;
    }

    let config = ClientConfig::builder().with_root_certificates(roots).with_client_auth_cert(certs, key)?;
    Ok(config)
}

/// Dial `server`, run the multiplex session until it ends, and return once
/// it is no longer alive. Never returns `Err` for a clean disconnect — only
/// for failures to establish the session in the first place.
async fn connect_once(server: &str, tls_config: Arc<ClientConfig>, alias: &str, dialer: Dialer) -> anyhow::Result<()> {
    let tcp = TcpStream::connect(server).await?;
    tcp.set_nodelay(true)?;

    let connector = TlsConnector::from(tls_config);
    let domain = ServerName::try_from(server.split(':').next().unwrap_or(server).to_string())?;
    let tls = connector.connect(domain, tcp).await?;

    log::info!("agent: connected to {server}");

    // The agent plays the multiplex acceptor role; the server opens every
    // stream (§4.2/§4.3's role inversion).
    let mut multiplex = Multiplex::new(tls, Role::Acceptor);
    let redirectors = Redirectors::new();

    while let Some(stream) = multiplex.accept().await {
        let alias = alias.to_string();
        let dialer = dialer.clone();
        let redirectors = redirectors.clone();
        let opener = multiplex.opener();
        tokio::spawn(async move {
            handlers::handle(stream, &alias, dialer, redirectors, opener).await;
        });
    }

    Ok(())
}
