//! Public DoH upstream used for every query the registry is not
//! authoritative for.

use std::time::Duration;

use crate::error::Result;

const DNS_MESSAGE_MIME: &str = "application/dns-message";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Thin client around the configured DoH resolver. Queries go out as
/// `application/dns-message` POST bodies and the response body comes back
/// untouched, so callers relay exactly what the upstream produced.
pub struct DohClient {
    http: reqwest::Client,
    url: String,
}

impl DohClient {
    pub fn new(url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;

        Ok(Self { http, url })
    }

    /// Forward a raw DNS query and return the upstream's raw answer.
    ///
    /// # Errors
    /// Transport failures, timeouts and non-success statuses all surface as
    /// an `UpstreamError`; the caller closes the client connection.
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_MIME)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE_MIME)
            .body(query.to_vec())
            .send()
            .await?
            .error_for_status()?;

        Ok(response.bytes().await?.to_vec())
    }
}
