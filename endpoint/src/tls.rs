//! Client-side mTLS configuration built from the installer package.

use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::{CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE};
use crate::error::{EndpointError, Result};

/// Build the TLS client configuration: the packaged CA is the only trusted
/// root, and the endpoint certificate/key pair is presented on every
/// connection.
pub fn client_config(package_dir: &Path) -> Result<rustls::ClientConfig> {
    let cert_text = std::fs::read_to_string(package_dir.join(CLIENT_CERT_FILE))?;
    if cert_text.contains("CERTIFICATE REQUEST") {
        return Err(EndpointError::tls_error(
            "endpoint.crt is a CSR, not a signed certificate; regenerate the package",
        ));
    }

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_text.as_bytes()))
            .collect::<std::io::Result<_>>()?;
    if certs.is_empty() {
        return Err(EndpointError::tls_error(&format!(
            "no certificate found in {}",
            CLIENT_CERT_FILE
        )));
    }

    let key_bytes = std::fs::read(package_dir.join(CLIENT_KEY_FILE))?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(key_bytes.as_slice()))?.ok_or_else(
            || EndpointError::tls_error(&format!("no private key found in {}", CLIENT_KEY_FILE)),
        )?;

    let ca_bytes = std::fs::read(package_dir.join(CA_CERT_FILE))?;
    let mut roots = rustls::RootCertStore::empty();
    for ca_cert in rustls_pemfile::certs(&mut BufReader::new(ca_bytes.as_slice())) {
        roots.add(ca_cert?)?;
    }
    if roots.is_empty() {
        return Err(EndpointError::tls_error(&format!(
            "no CA certificate found in {}",
            CA_CERT_FILE
        )));
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;

    Ok(config)
}
