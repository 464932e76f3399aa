//! Operator gRPC control plane (§6). One `LigoloOperator` service, reachable
//! only over the same mTLS pattern the agent-facing listener uses — a
//! manual handshake plus CRL check ahead of tonic, rather than tonic's own
//! `ServerTlsConfig::client_ca_root`, so both listeners share one revocation
//! path (`tls::check_not_revoked`) instead of two.

pub mod proto {
    tonic::include_proto!("ligolo.server");
}

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use ipnet::IpNet;
use service::redirector::Redirector as ServiceRedirector;
use service::route::Route;
use service::session::registry::RouteAddError;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::{Connected, Server};
use tonic::{Request, Response, Status};

use crate::events::{self, Event};
use crate::pki;
use crate::state::{OperatorRecord, State};
use crate::tls;

use self::proto::ligolo_operator_server::{LigoloOperator, LigoloOperatorServer};
use self::proto::{
    AddOperatorRequest, AddRedirectorRequest, AddRouteRequest, CertificateInfo, CertificateList, Empty,
    GenerateAgentRequest, GenerateAgentResponse, NetInterface as ProtoNetInterface, Operator, OperatorCertificate,
    OperatorList, OperatorName, RelayRequest, RemoveRedirectorRequest, RemoveRouteRequest, RenameSessionRequest,
    Route as ProtoRoute, Redirector as ProtoRedirector, Session as ProtoSession, SessionId, SessionList,
};

/// The mTLS thumbprint a gRPC call arrived over, carried into the handler via
/// tonic's [`Connected`] extension mechanism — the operator analogue of the
/// thumbprint `server::handle_connection` reads straight off the rustls
/// session for agent connections.
#[derive(Debug, Clone)]
struct PeerIdentity {
    thumbprint: String,
}

/// A TLS stream already authenticated and CRL-checked by [`run`]'s accept
/// loop, tagged with the peer identity tonic hands back to every handler.
struct AuthenticatedStream {
    inner: tokio_rustls::server::TlsStream<TcpStream>,
    identity: PeerIdentity,
}

impl Connected for AuthenticatedStream {
    type ConnectInfo = PeerIdentity;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.identity.clone()
    }
}

impl AsyncRead for AuthenticatedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for AuthenticatedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Bind `state.config.operator_addr` and serve the `LigoloOperator` service
/// until the process is killed.
pub async fn run(state: Arc<State>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(state.config.operator_addr).await?;
    let acceptor = tls::acceptor(&state.ca, &state.identity)?;
    log::info!("operator listener bound on {}", state.config.operator_addr);

    let (tx, rx) = mpsc::channel::<std::io::Result<AuthenticatedStream>>(16);

    let accept_state = state.clone();
    tokio::spawn(async move {
        loop {
            let (tcp, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("operator listener: accept failed: {err}");
                    continue;
                }
            };

            let state = accept_state.clone();
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(err) = accept_one(state, acceptor, tx, tcp, peer).await {
                    log::warn!("operator {peer}: rejected: {err}");
                }
            });
        }
    });

    Server::builder()
        .add_service(LigoloOperatorServer::new(RpcService { state }))
        .serve_with_incoming(ReceiverStream::new(rx))
        .await?;

    Ok(())
}

async fn accept_one(
    state: Arc<State>,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<std::io::Result<AuthenticatedStream>>,
    tcp: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    tcp.set_nodelay(true)?;
    let tls_stream = acceptor.accept(tcp).await?;

    let thumbprint = {
        let (_, connection) = tls_stream.get_ref();
        let crl = state.crl.read();
        tls::check_not_revoked(connection, &crl)?;
        tls::peer_thumbprint(connection).ok_or_else(|| anyhow::anyhow!("no peer certificate"))?
    };

    log::debug!("operator {peer}: authenticated as {thumbprint}");
    let _ = tx.send(Ok(AuthenticatedStream { inner: tls_stream, identity: PeerIdentity { thumbprint } })).await;
    Ok(())
}

struct RpcService {
    state: Arc<State>,
}

fn peer_identity<T>(request: &Request<T>) -> Result<PeerIdentity, Status> {
    request
        .extensions()
        .get::<PeerIdentity>()
        .cloned()
        .ok_or_else(|| Status::unauthenticated("no peer identity on connection"))
}

async fn find_operator(state: &State, thumbprint: &str) -> Result<OperatorRecord, Status> {
    state
        .operators
        .get_all()
        .await
        .map_err(|err| Status::internal(err.to_string()))?
        .into_iter()
        .find(|operator| operator.certificate.thumbprint == thumbprint)
        .ok_or_else(|| Status::unauthenticated("certificate does not belong to a known operator"))
}

/// Resolve the calling operator and require their `is_admin` flag, for the
/// operator-roster RPCs (§6, §11).
async fn require_admin<T>(state: &State, request: &Request<T>) -> Result<OperatorRecord, Status> {
    let identity = peer_identity(request)?;
    let operator = find_operator(state, &identity.thumbprint).await?;
    if !operator.is_admin {
        return Err(Status::permission_denied("operator is not an admin"));
    }
    Ok(operator)
}

fn wire_transport(proto: &str) -> Result<codec::Transport, Status> {
    match proto {
        "tcp" => Ok(codec::Transport::Tcp),
        "udp" => Ok(codec::Transport::Udp),
        other => Err(Status::invalid_argument(format!("unknown transport {other:?}, expected tcp or udp"))),
    }
}

fn transport_str(transport: codec::Transport) -> &'static str {
    match transport {
        codec::Transport::Tcp => "tcp",
        codec::Transport::Udp => "udp",
    }
}

fn proto_interface(iface: &codec::NetInterface) -> ProtoNetInterface {
    ProtoNetInterface {
        index: iface.index,
        mtu: iface.mtu,
        name: iface.name.clone(),
        hardware_addr: iface.hardware_addr.clone(),
        flags: iface.flags,
        addresses: iface.addresses.clone(),
    }
}

fn proto_route(route: &Route) -> ProtoRoute {
    ProtoRoute { cidr: route.cidr.to_string(), is_loopback: route.is_loopback }
}

fn proto_redirector(redirector: &ServiceRedirector) -> ProtoRedirector {
    ProtoRedirector {
        id: redirector.id.clone(),
        proto: transport_str(redirector.proto).to_string(),
        from: redirector.from.clone(),
        to: redirector.to.clone(),
    }
}

fn proto_session(session: &service::session::Session) -> ProtoSession {
    ProtoSession {
        id: session.id.clone(),
        alias: session.alias.clone(),
        is_connected: session.is_connected,
        is_relaying: session.is_relaying(),
        hostname: session.hostname.clone(),
        interfaces: session.interfaces.iter().map(proto_interface).collect(),
        routes: session.routes.iter().map(proto_route).collect(),
        redirectors: session.redirectors.iter().map(proto_redirector).collect(),
        first_seen: crate::state::unix_time(session.first_seen),
        last_seen: crate::state::unix_time(session.last_seen),
    }
}

fn route_add_err(err: RouteAddError) -> Status {
    match err {
        RouteAddError::NotFound => Status::not_found("session not found"),
        RouteAddError::Overlap { owner, existing } => {
            Status::already_exists(format!("overlaps route {} already owned by session {owner}", existing.cidr))
        }
    }
}

/// Re-apply `id`'s current route set to its OS routing table if it is
/// currently relaying (§4.4, §4.6). A route mutation RPC that arrives while
/// a relay is active must take effect immediately, not just in storage.
fn reapply_routes_if_relaying(state: &State, id: &str) {
    let Some(netstack) = state.registry.with(id, |session| session.relay_netstack()).flatten() else {
        return;
    };
    let routes = state.registry.with(id, |session| session.routes.clone()).unwrap_or_default();
    netstack.apply_routes(&routes);
}

#[tonic::async_trait]
impl LigoloOperator for RpcService {
    async fn list_sessions(&self, request: Request<Empty>) -> Result<Response<SessionList>, Status> {
        peer_identity(&request)?;
        let sessions = self
            .state
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| self.state.registry.with(&id, proto_session))
            .collect();
        Ok(Response::new(SessionList { sessions }))
    }

    async fn rename_session(&self, request: Request<RenameSessionRequest>) -> Result<Response<Empty>, Status> {
        peer_identity(&request)?;
        let RenameSessionRequest { id, alias } = request.into_inner();
        self.state
            .registry
            .with_mut(&id, |session| session.alias = alias)
            .ok_or_else(|| Status::not_found("session not found"))?;
        let _ = self.state.persist_session(&id).await;
        Ok(Response::new(Empty {}))
    }

    async fn kill_session(&self, request: Request<SessionId>) -> Result<Response<Empty>, Status> {
        peer_identity(&request)?;
        let id = request.into_inner().id;
        if !self.state.registry.contains(&id) {
            return Err(Status::not_found("session not found"));
        }
        crate::server::disconnect(&self.state, &id).await;
        self.state.registry.remove(&id);
        let _ = self.state.sessions.remove(&id).await;
        events::publish(Event::new("session.killed", &id, ""));
        Ok(Response::new(Empty {}))
    }

    async fn add_route(&self, request: Request<AddRouteRequest>) -> Result<Response<Empty>, Status> {
        peer_identity(&request)?;
        let inner = request.into_inner();
        let cidr: IpNet = inner.cidr.parse().map_err(|_| Status::invalid_argument("invalid CIDR"))?;

        self.state
            .registry
            .add_route(&inner.session_id, Route::new(cidr, inner.is_loopback), inner.force)
            .map_err(route_add_err)?;

        reapply_routes_if_relaying(&self.state, &inner.session_id);
        let _ = self.state.persist_session(&inner.session_id).await;
        events::publish(Event::new("route.added", &inner.session_id, &cidr.to_string()));
        Ok(Response::new(Empty {}))
    }

    async fn remove_route(&self, request: Request<RemoveRouteRequest>) -> Result<Response<Empty>, Status> {
        peer_identity(&request)?;
        let inner = request.into_inner();
        let cidr: IpNet = inner.cidr.parse().map_err(|_| Status::invalid_argument("invalid CIDR"))?;

        self.state
            .registry
            .with_mut(&inner.session_id, |session| session.remove_route(cidr))
            .ok_or_else(|| Status::not_found("session not found"))?;

        reapply_routes_if_relaying(&self.state, &inner.session_id);
        let _ = self.state.persist_session(&inner.session_id).await;
        events::publish(Event::new("route.removed", &inner.session_id, &cidr.to_string()));
        Ok(Response::new(Empty {}))
    }

    async fn add_redirector(&self, request: Request<AddRedirectorRequest>) -> Result<Response<Empty>, Status> {
        peer_identity(&request)?;
        let inner = request.into_inner();
        let proto = wire_transport(&inner.proto)?;
        let redirector = ServiceRedirector::new(proto, inner.from.clone(), inner.to.clone());

        let opener =
            self.state.registry.with(&inner.session_id, |session| session.opener()).flatten();

        if let Some(mut opener) = opener {
            crate::server::add_redirector_remote(&mut opener, &redirector)
                .await
                .map_err(|err| Status::unavailable(err.to_string()))?;
        }

        self.state
            .registry
            .with_mut(&inner.session_id, |session| session.add_redirector(redirector.clone()))
            .ok_or_else(|| Status::not_found("session not found"))?;

        let _ = self.state.persist_session(&inner.session_id).await;
        events::publish(Event::new("redirector.added", &inner.session_id, &redirector.id));
        Ok(Response::new(Empty {}))
    }

    async fn remove_redirector(&self, request: Request<RemoveRedirectorRequest>) -> Result<Response<Empty>, Status> {
        peer_identity(&request)?;
        let inner = request.into_inner();

        let opener =
            self.state.registry.with(&inner.session_id, |session| session.opener()).flatten();

        if let Some(mut opener) = opener {
            crate::server::remove_redirector_remote(&mut opener, &inner.redirector_id)
                .await
                .map_err(|err| Status::unavailable(err.to_string()))?;
        }

        self.state
            .registry
            .with_mut(&inner.session_id, |session| session.remove_redirector(&inner.redirector_id))
            .ok_or_else(|| Status::not_found("session not found"))?;

        let _ = self.state.persist_session(&inner.session_id).await;
        events::publish(Event::new("redirector.removed", &inner.session_id, &inner.redirector_id));
        Ok(Response::new(Empty {}))
    }

    async fn start_relay(&self, request: Request<RelayRequest>) -> Result<Response<Empty>, Status> {
        peer_identity(&request)?;
        let inner = request.into_inner();
        if !self.state.registry.contains(&inner.session_id) {
            return Err(Status::not_found("session not found"));
        }

        let max_connection =
            if inner.max_connection == 0 { self.state.config.max_connection } else { inner.max_connection as usize };
        let max_inflight =
            if inner.max_inflight == 0 { self.state.config.max_inflight } else { inner.max_inflight as usize };

        crate::server::start_relay(&self.state, &inner.session_id, max_connection, max_inflight)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        let _ = self.state.persist_session(&inner.session_id).await;
        events::publish(Event::new("relay.started", &inner.session_id, ""));
        Ok(Response::new(Empty {}))
    }

    async fn stop_relay(&self, request: Request<SessionId>) -> Result<Response<Empty>, Status> {
        peer_identity(&request)?;
        let id = request.into_inner().id;
        if !self.state.registry.contains(&id) {
            return Err(Status::not_found("session not found"));
        }

        crate::server::stop_relay(&self.state, &id).await.map_err(|err| Status::internal(err.to_string()))?;
        events::publish(Event::new("relay.stopped", &id, ""));
        Ok(Response::new(Empty {}))
    }

    async fn generate_agent(
        &self,
        request: Request<GenerateAgentRequest>,
    ) -> Result<Response<GenerateAgentResponse>, Status> {
        peer_identity(&request)?;
        // Agent-binary generation requires an external toolchain collaborator
        // (cross-compiling and, optionally, obfuscating a Go binary) this
        // build does not carry (§11 Non-goals). The RPC still exists on the
        // wire so an operator client gets a clean "unavailable" rather than
        // a transport error.
        Ok(Response::new(GenerateAgentResponse {
            available: false,
            message: "agent generation is not available on this server build".to_string(),
            binary: Vec::new(),
        }))
    }

    async fn list_operators(&self, request: Request<Empty>) -> Result<Response<OperatorList>, Status> {
        peer_identity(&request)?;
        let operators = self
            .state
            .operators
            .get_all()
            .await
            .map_err(|err| Status::internal(err.to_string()))?
            .into_iter()
            .map(|record| Operator { name: record.name, is_admin: record.is_admin, is_online: false })
            .collect();
        Ok(Response::new(OperatorList { operators }))
    }

    async fn add_operator(
        &self,
        request: Request<AddOperatorRequest>,
    ) -> Result<Response<OperatorCertificate>, Status> {
        require_admin(&self.state, &request).await?;
        let inner = request.into_inner();

        if self.state.operators.get(&inner.name).await.map_err(|err| Status::internal(err.to_string()))?.is_some() {
            return Err(Status::already_exists("operator already exists"));
        }

        let certificate = pki::issue(&self.state.ca, &inner.name).map_err(|err| Status::internal(err.to_string()))?;
        let record = OperatorRecord { name: inner.name.clone(), is_admin: inner.is_admin, certificate: certificate.clone() };
        self.state.operators.set(&inner.name, &record).await.map_err(|err| Status::internal(err.to_string()))?;

        events::publish(Event::new("operator.added", "", &inner.name));
        Ok(Response::new(OperatorCertificate {
            name: inner.name,
            ca: self.state.ca.certificate_der.clone(),
            certificate: certificate.certificate_der,
            key: certificate.key_der,
        }))
    }

    async fn remove_operator(&self, request: Request<OperatorName>) -> Result<Response<Empty>, Status> {
        require_admin(&self.state, &request).await?;
        let name = request.into_inner().name;

        let record = self
            .state
            .operators
            .get(&name)
            .await
            .map_err(|err| Status::internal(err.to_string()))?
            .ok_or_else(|| Status::not_found("operator not found"))?;

        self.state
            .revoke(record.certificate.thumbprint, format!("operator {name} removed"))
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        self.state.operators.remove(&name).await.map_err(|err| Status::internal(err.to_string()))?;

        events::publish(Event::new("operator.removed", "", &name));
        Ok(Response::new(Empty {}))
    }

    async fn list_certificates(&self, request: Request<Empty>) -> Result<Response<CertificateList>, Status> {
        peer_identity(&request)?;
        let crl = self.state.crl.read();

        let mut certificates = vec![CertificateInfo {
            name: self.state.ca.name.clone(),
            thumbprint: self.state.ca.thumbprint.clone(),
            revoked: crl.is_revoked(&self.state.ca.thumbprint),
        }];

        for operator in
            self.state.operators.get_all().await.map_err(|err| Status::internal(err.to_string()))?
        {
            certificates.push(CertificateInfo {
                name: operator.name,
                thumbprint: operator.certificate.thumbprint.clone(),
                revoked: crl.is_revoked(&operator.certificate.thumbprint),
            });
        }

        Ok(Response::new(CertificateList { certificates }))
    }

    async fn regenerate_certificate(
        &self,
        request: Request<OperatorName>,
    ) -> Result<Response<OperatorCertificate>, Status> {
        let identity = peer_identity(&request)?;
        let name = request.into_inner().name;

        let mut record = self
            .state
            .operators
            .get(&name)
            .await
            .map_err(|err| Status::internal(err.to_string()))?
            .ok_or_else(|| Status::not_found("operator not found"))?;

        // An operator may regenerate their own certificate; regenerating
        // someone else's requires admin (§11).
        if record.certificate.thumbprint != identity.thumbprint {
            require_admin(&self.state, &request).await?;
        }

        let old_thumbprint = record.certificate.thumbprint.clone();
        let certificate = pki::issue(&self.state.ca, &name).map_err(|err| Status::internal(err.to_string()))?;
        record.certificate = certificate.clone();
        self.state.operators.set(&name, &record).await.map_err(|err| Status::internal(err.to_string()))?;
        self.state
            .revoke(old_thumbprint, format!("operator {name} regenerated their certificate"))
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        events::publish(Event::new("operator.regenerated", "", &name));
        Ok(Response::new(OperatorCertificate {
            name,
            ca: self.state.ca.certificate_der.clone(),
            certificate: certificate.certificate_der,
            key: certificate.key_der,
        }))
    }

    type EventStreamStream = Pin<Box<dyn Stream<Item = Result<proto::Event, Status>> + Send + 'static>>;

    async fn event_stream(&self, request: Request<Empty>) -> Result<Response<Self::EventStreamStream>, Status> {
        peer_identity(&request)?;
        use tokio_stream::StreamExt;

        let stream = events::subscribe().filter_map(|event| {
            event.ok().map(|event| {
                Ok(proto::Event {
                    timestamp: event.timestamp,
                    kind: event.kind,
                    session_id: event.session_id,
                    detail: event.detail,
                })
            })
        });

        Ok(Response::new(Box::pin(stream)))
    }
}
