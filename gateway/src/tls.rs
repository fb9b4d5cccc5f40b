//! TLS material loading and peer identity extraction.
//!
//! Both listeners share one `rustls::ServerConfig`: the overlay-CA-signed
//! server certificate plus mandatory client certificate verification
//! against that same CA. The verified leaf certificate's subject Common
//! Name is the authorization key everywhere else in the gateway.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use x509_parser::prelude::*;

use crate::error::{GatewayError, Result};

/// Paths to the PEM files the gateway needs: its own certificate chain and
/// key, and the overlay CA used to verify client certificates.
#[derive(Debug, Clone, clap::Args)]
pub struct TlsFiles {
    /// Server certificate (PEM), signed by the overlay CA
    #[arg(long = "cert-file", default_value = "/opt/zerotrust-dns/certs/server.crt")]
    pub cert_path: PathBuf,

    /// Server private key (PEM)
    #[arg(long = "key-file", default_value = "/opt/zerotrust-dns/certs/server.key")]
    pub key_path: PathBuf,

    /// Overlay CA certificate (PEM) client certificates must chain to
    #[arg(long = "ca-file", default_value = "/opt/zerotrust-dns/certs/ca.crt")]
    pub ca_path: PathBuf,
}

impl TlsFiles {
    /// Build the shared server-side TLS configuration: present the server
    /// certificate, require a client certificate chained to the CA.
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        let certs = load_certificates(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let mut roots = rustls::RootCertStore::empty();
        for ca_cert in load_certificates(&self.ca_path)? {
            roots.add(ca_cert)?;
        }

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| GatewayError::tls_error(&err.to_string()))?;

        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;

        Ok(config)
    }
}

/// Load a PEM certificate chain.
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(file)).collect::<std::io::Result<_>>()?;

    if certs.is_empty() {
        return Err(GatewayError::tls_error(&format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load a PEM private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?.ok_or_else(|| {
        GatewayError::tls_error(&format!("no private key found in {}", path.display()))
    })
}

/// Extract the subject Common Name from a DER-encoded certificate.
///
/// Fails closed: a certificate without a non-empty CN yields an error, it
/// never authorizes as the empty identity.
pub fn extract_common_name(der_cert: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(der_cert)
        .map_err(|err| GatewayError::auth_error(&format!("certificate parse error: {}", err)))?;

    let result = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .filter(|cn| !cn.is_empty())
        .ok_or_else(|| GatewayError::auth_error("certificate has no Common Name"));
    result
}

/// The Common Name of the verified peer certificate on an accepted
/// connection, if the handshake produced one.
pub fn peer_common_name(connection: &rustls::ServerConnection) -> Result<String> {
    let leaf = connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| GatewayError::auth_error("peer presented no certificate"))?;

    extract_common_name(leaf.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Helper: build a self-signed X.509 cert with the given CN.
    fn build_test_cert(cn: &str) -> Vec<u8> {
        use rcgen::{CertificateParams, DnType, KeyPair};

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, cn);

        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        cert.der().to_vec()
    }

    // Helper: build a cert whose subject carries only an Organization.
    fn build_cert_without_cn() -> Vec<u8> {
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Client-test");
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        cert.der().to_vec()
    }

    #[test]
    fn extracts_common_name() {
        let der = build_test_cert("c0001");
        assert_eq!(extract_common_name(&der).unwrap(), "c0001");
    }

    #[test]
    fn rejects_certificate_without_common_name() {
        let der = build_cert_without_cn();
        assert!(extract_common_name(&der).is_err());
    }

    #[test]
    fn rejects_invalid_der() {
        assert!(extract_common_name(b"not a certificate").is_err());
    }
}
