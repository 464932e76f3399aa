//! mTLS listener configuration (§10, §11). Both the agent-facing and the
//! operator-facing listeners require a client certificate signed by our own
//! CA; CA-chain verification is delegated to rustls's
//! [`rustls::server::WebPkiClientVerifier`] rather than a hand-rolled
//! verifier, since the only thing we need beyond "signed by our CA" is a
//! revocation check, and that's cheaper done once after the handshake than
//! inside the verifier trait.

use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ServerConfig, WebPkiClientVerifier};
use tokio_rustls::TlsAcceptor;

use crate::pki::{Certificate, Crl, thumbprint};

/// Build a `TlsAcceptor` that terminates mTLS using `identity`'s
/// certificate/key and accepts only clients whose certificate chains to
/// `ca`. Used for both the agent-facing listener and the operator-facing
/// gRPC listener; they share one CA, so the same function builds both.
pub fn acceptor(ca: &Certificate, identity: &Certificate) -> anyhow::Result<TlsAcceptor> {
    let mut roots = RootCertStore::empty();
    roots.add(CertificateDer::from(ca.certificate_der.clone()))?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;

    let cert_chain = vec![CertificateDer::from(identity.certificate_der.clone())];
    let key = PrivateKeyDer::try_from(identity.key_der.clone()).map_err(|e| anyhow::anyhow!("invalid key der: {e}"))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Thumbprint of the leaf certificate a `tokio_rustls` server-side TLS
/// stream authenticated with, if any. `None` only when the handshake
/// somehow completed without a client certificate, which the verifier
/// above never allows, but the API returns an `Option` so we check anyway.
pub fn peer_thumbprint(connection: &rustls::ServerConnection) -> Option<String> {
    connection.peer_certificates()?.first().map(|der| thumbprint(der))
}

/// Reject a handshake whose peer certificate has been revoked. Call this
/// right after accepting, before trusting anything else about the
/// connection.
pub fn check_not_revoked(connection: &rustls::ServerConnection, crl: &Crl) -> anyhow::Result<()> {
    let thumbprint = peer_thumbprint(connection).ok_or_else(|| anyhow::anyhow!("no peer certificate"))?;
    if crl.is_revoked(&thumbprint) {
        anyhow::bail!("certificate {thumbprint} is revoked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{generate_ca, issue};

    #[test]
    fn acceptor_builds_from_issued_certificate() {
        let ca = generate_ca().unwrap();
        let leaf = issue(&ca, "agent-1").unwrap();
        acceptor(&ca, &leaf).unwrap();
    }

    #[test]
    fn check_not_revoked_rejects_known_thumbprint() {
        let ca = generate_ca().unwrap();
        let mut crl = Crl::default();
        crl.revoke(ca.thumbprint.clone(), "test".into());
        assert!(crl.is_revoked(&ca.thumbprint));
    }
}
