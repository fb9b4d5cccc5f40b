//! Signed configuration token loading and verification.
//!
//! Every installer package carries `config.zt`, an RS256-signed token
//! minted by the provisioning console. Its single `data` claim holds the
//! JSON-encoded endpoint configuration. The signature is verified against
//! the RSA public key inside the packaged CA certificate, so a package is
//! only usable against the overlay that issued it.

use std::collections::HashSet;
use std::path::Path;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{EndpointError, Result};

pub const CONFIG_TOKEN_FILE: &str = "config.zt";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const CLIENT_CERT_FILE: &str = "endpoint.crt";
pub const CLIENT_KEY_FILE: &str = "endpoint.key";

/// The kind of identity this endpoint was provisioned as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Client,
    Service,
}

/// The payload carried inside the signed token's `data` claim.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// DoT resolver address, `<ip>:<port>`
    pub server: String,
    /// Routing proxy address, `<ip>:<port>`
    pub proxy: String,
    /// TLS name the resolver certificate is verified against
    pub server_name: String,
    #[serde(rename = "type")]
    pub kind: EndpointKind,
    /// Zone suffixes a service endpoint is advertised under
    #[serde(default)]
    pub domains: Vec<String>,
    /// ISO-8601 expiry of the token
    pub expires: String,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    data: String,
}

impl EndpointConfig {
    /// Split the configured `server` value into its host and port parts.
    pub fn server_addr(&self) -> Result<(String, u16)> {
        split_host_port(&self.server)
    }
}

/// Verify that every file the installer package must contain is present,
/// reporting all missing ones at once.
pub fn check_package_files(package_dir: &Path) -> Result<()> {
    let missing: Vec<&str> = [
        CONFIG_TOKEN_FILE,
        CA_CERT_FILE,
        CLIENT_CERT_FILE,
        CLIENT_KEY_FILE,
    ]
    .into_iter()
    .filter(|file| !package_dir.join(file).exists())
    .collect();

    if missing.is_empty() {
        return Ok(());
    }

    Err(EndpointError::package_error(&format!(
        "missing required files: {} (extract all files from the downloaded package)",
        missing.join(", ")
    )))
}

/// Load `config.zt` from the package directory and verify it against the
/// packaged CA certificate.
pub fn load_config(package_dir: &Path) -> Result<EndpointConfig> {
    let token = std::fs::read_to_string(package_dir.join(CONFIG_TOKEN_FILE))?;
    let ca_pem = std::fs::read(package_dir.join(CA_CERT_FILE))?;

    verify_token(token.trim(), &ca_pem)
}

/// Verify the token signature, decode the `data` claim and refuse expired
/// tokens.
pub fn verify_token(token: &str, ca_pem: &[u8]) -> Result<EndpointConfig> {
    let decoding_key = ca_decoding_key(ca_pem)?;

    // The expiry lives inside the data payload, not in a standard claim.
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.required_spec_claims = HashSet::new();

    let token_data = jsonwebtoken::decode::<TokenClaims>(token, &decoding_key, &validation)?;
    let config: EndpointConfig = serde_json::from_str(&token_data.claims.data)?;

    let expires = parse_expiry(&config.expires)?;
    if expires < chrono::Utc::now() {
        return Err(EndpointError::token_error(&format!(
            "configuration token expired at {}",
            config.expires
        )));
    }

    Ok(config)
}

/// Extract the RSA public key from the CA certificate PEM as a decoding
/// key for signature verification.
fn ca_decoding_key(ca_pem: &[u8]) -> Result<DecodingKey> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(ca_pem)
        .map_err(|err| EndpointError::token_error(&format!("unreadable CA certificate: {}", err)))?;
    let ca_cert = pem
        .parse_x509()
        .map_err(|err| EndpointError::token_error(&format!("invalid CA certificate: {}", err)))?;

    // The subjectPublicKey BIT STRING of an RSA certificate is the PKCS#1
    // RSAPublicKey structure jsonwebtoken expects.
    let spki = ca_cert.public_key();
    Ok(DecodingKey::from_rsa_der(&spki.subject_public_key.data))
}

fn parse_expiry(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    if let Ok(stamp) = chrono::DateTime::parse_from_rfc3339(value) {
        return Ok(stamp.with_timezone(&chrono::Utc));
    }

    // The console writes naive ISO-8601 timestamps; treat them as UTC.
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|err| {
            EndpointError::token_error(&format!("invalid expires timestamp {:?}: {}", value, err))
        })
}

fn split_host_port(value: &str) -> Result<(String, u16)> {
    let (host, port) = value.rsplit_once(':').ok_or_else(|| {
        EndpointError::package_error(&format!("address {:?} is missing a port", value))
    })?;

    let port = port.parse::<u16>().map_err(|_| {
        EndpointError::package_error(&format!("address {:?} has an invalid port", value))
    })?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_client_payload() {
        let config: EndpointConfig = serde_json::from_str(
            r#"{
                "server": "192.0.2.1:853",
                "proxy": "192.0.2.1:8443",
                "server_name": "dns-server",
                "type": "client",
                "expires": "2099-01-01T00:00:00"
            }"#,
        )
        .unwrap();

        assert_eq!(config.kind, EndpointKind::Client);
        assert!(config.domains.is_empty());
        assert_eq!(config.server_addr().unwrap(), ("192.0.2.1".to_string(), 853));
    }

    #[test]
    fn deserializes_service_payload_with_domains() {
        let config: EndpointConfig = serde_json::from_str(
            r#"{
                "server": "192.0.2.1:853",
                "proxy": "192.0.2.1:8443",
                "server_name": "dns-server",
                "type": "service",
                "domains": ["acme.internal"],
                "expires": "2099-01-01T00:00:00+00:00"
            }"#,
        )
        .unwrap();

        assert_eq!(config.kind, EndpointKind::Service);
        assert_eq!(config.domains, vec!["acme.internal".to_string()]);
    }

    #[test]
    fn parses_both_expiry_shapes() {
        assert!(parse_expiry("2099-01-01T00:00:00+00:00").is_ok());
        assert!(parse_expiry("2099-01-01T00:00:00Z").is_ok());
        assert!(parse_expiry("2099-01-01T00:00:00.123456").is_ok());
        assert!(parse_expiry("next tuesday").is_err());
    }

    #[test]
    fn expired_timestamps_compare_in_the_past() {
        let expired = parse_expiry("2001-01-01T00:00:00").unwrap();
        assert!(expired < chrono::Utc::now());
    }

    #[test]
    fn rejects_addresses_without_a_port() {
        assert!(split_host_port("192.0.2.1").is_err());
        assert!(split_host_port("192.0.2.1:dns").is_err());
        assert_eq!(
            split_host_port("192.0.2.1:853").unwrap(),
            ("192.0.2.1".to_string(), 853)
        );
    }
}
