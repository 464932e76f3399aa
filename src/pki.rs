//! Certificate/CA/CRL management (§10, §11). Mirrors the reference
//! implementation's `internal/certificate` and `internal/crl` packages: a
//! self-signed CA generated on first run, a leaf certificate issued per
//! operator (and one for the server's own agent-facing listener), and a
//! revocation list consulted on every mTLS handshake. Peer verification is
//! manual — thumbprints against the CRL — rather than relying on the
//! system trust store, since every peer here is one of ours.

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose};
use sha1::{Digest, Sha1};

/// A certificate plus the key that generated it, carried together since
/// every consumer needs both (mTLS config, storage, thumbprinting).
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct Certificate {
    pub name: String,
    pub certificate_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub thumbprint: String,
}

impl Certificate {
    pub fn certificate_pem(&self) -> String {
        pem_block("CERTIFICATE", &self.certificate_der)
    }

    pub fn key_pem(&self) -> String {
        pem_block("PRIVATE KEY", &self.key_der)
    }
}

/// Hex-encoded SHA-1 over the DER certificate, matching the reference
/// implementation's thumbprint derivation (§11).
pub fn thumbprint(der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(der);
    hex::encode(hasher.finalize())
}

fn pem_block(label: &str, der: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// Generate a fresh self-signed CA. Called once, on first run, when no CA
/// record exists in storage yet.
pub fn generate_ca() -> anyhow::Result<Certificate> {
    let key_pair = KeyPair::generate()?;
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "ligolo-ca");
        dn
    };

    let cert = params.self_signed(&key_pair)?;
    let certificate_der = cert.der().to_vec();
    let key_der = key_pair.serialize_der();
    let thumbprint = thumbprint(&certificate_der);

    Ok(Certificate { name: "ca".to_string(), certificate_der, key_der, thumbprint })
}

/// Issue a leaf certificate signed by `ca`, for an operator or an agent's
/// mTLS identity.
pub fn issue(ca: &Certificate, name: &str) -> anyhow::Result<Certificate> {
    let ca_key = KeyPair::from_der_and_sign_algo(&rcgen::PKCS8_ECDSA_P256_SHA256, ca.key_der.as_slice().into())
        .or_else(|_| KeyPair::try_from(ca.key_der.clone()))?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let leaf_key = KeyPair::generate()?;
    let mut leaf_params = CertificateParams::new(vec![name.to_string()])?;
    leaf_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        dn
    };
    leaf_params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];

    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key)?;
    let certificate_der = leaf_cert.der().to_vec();
    let key_der = leaf_key.serialize_der();
    let thumbprint = thumbprint(&certificate_der);

    Ok(Certificate { name: name.to_string(), certificate_der, key_der, thumbprint })
}

/// One CRL entry: a thumbprint that must no longer be accepted on any mTLS
/// handshake, with the reason it was revoked (§11).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RevokedCertificate {
    pub thumbprint: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Crl {
    pub revoked: Vec<RevokedCertificate>,
}

impl Crl {
    pub fn is_revoked(&self, thumbprint: &str) -> bool {
        self.revoked.iter().any(|entry| entry.thumbprint == thumbprint)
    }

    pub fn revoke(&mut self, thumbprint: String, reason: String) {
        if !self.is_revoked(&thumbprint) {
            self.revoked.push(RevokedCertificate { thumbprint, reason });
        }
    }
}
