//! Local DNS proxy: receives plain UDP queries from the OS stub resolver
//! and pushes them through the overlay's DNS-over-TLS resolver.
//!
//! Datagrams are treated as opaque DNS messages; the resolver does all the
//! deciding. Service endpoints short-circuit through a public resolver
//! first so their own upstream traffic does not loop through the overlay
//! for names the overlay will never answer.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;

use crate::config::{EndpointConfig, EndpointKind};
use crate::error::{EndpointError, Result};

pub const PUBLIC_RESOLVER: &str = "1.1.1.1:53";
const PUBLIC_TIMEOUT: Duration = Duration::from_secs(2);
const SERVER_TIMEOUT: Duration = Duration::from_secs(5);

/// A DNS header is 12 bytes; anything longer carries at least a question
/// or an answer and counts as a usable response.
const DNS_HEADER_LEN: usize = 12;

const MAX_DATAGRAM: usize = 65536;

/// The long-running local proxy.
pub struct DnsProxy {
    config: EndpointConfig,
    connector: TlsConnector,
    server_host: String,
    server_port: u16,
    server_name: ServerName<'static>,
}

impl DnsProxy {
    pub fn new(config: EndpointConfig, tls_config: rustls::ClientConfig) -> Result<Self> {
        let (server_host, server_port) = config.server_addr()?;
        let server_name = ServerName::try_from(config.server_name.clone())?;

        Ok(Self {
            config,
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_host,
            server_port,
            server_name,
        })
    }

    /// Bind the local UDP socket and serve queries until the process ends.
    /// Each datagram is handled in its own task.
    pub async fn run(self) -> Result<()> {
        let socket = Arc::new(bind_local_dns().await?);
        let proxy = Arc::new(self);
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, client_addr) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(err) => {
                    log::error!("Error receiving query: {}", err);
                    continue;
                }
            };

            let query = buffer[..len].to_vec();
            let proxy = proxy.clone();
            let socket = socket.clone();

            tokio::spawn(async move {
                proxy.handle_query(socket, query, client_addr).await;
            });
        }
    }

    async fn handle_query(
        &self,
        socket: Arc<UdpSocket>,
        query: Vec<u8>,
        client_addr: std::net::SocketAddr,
    ) {
        if let Ok(message) = hickory_proto::op::Message::from_vec(&query) {
            if let Some(question) = message.queries().first() {
                log::debug!(
                    "Query from {} for {} {}",
                    client_addr,
                    question.name(),
                    question.query_type()
                );
            }
        }

        // Service endpoints try the public resolver first; everything it
        // answers never needs the overlay.
        if self.config.kind == EndpointKind::Service {
            if let Some(response) = try_public_dns(&query).await {
                if let Err(err) = socket.send_to(&response, client_addr).await {
                    log::error!("Error replying to {}: {}", client_addr, err);
                }
                return;
            }
        }

        match self.forward_to_server(&query).await {
            Ok(response) => {
                if let Err(err) = socket.send_to(&response, client_addr).await {
                    log::error!("Error replying to {}: {}", client_addr, err);
                }
            }
            Err(err) => log::error!("Failed to forward query: {}", err),
        }
    }

    /// One short-lived DoT session per query: connect, handshake, exchange
    /// a single length-prefixed message pair.
    async fn forward_to_server(&self, query: &[u8]) -> Result<Vec<u8>> {
        let tcp = tokio::time::timeout(
            SERVER_TIMEOUT,
            TcpStream::connect((self.server_host.as_str(), self.server_port)),
        )
        .await
        .map_err(|_| EndpointError::dns_error("connection to server timed out"))??;

        let mut tls_stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;

        let response = exchange(&mut tls_stream, query).await?;
        let _ = tls_stream.shutdown().await;

        Ok(response)
    }
}

/// Write one length-prefixed query and read one length-prefixed reply.
async fn exchange<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if query.len() > u16::MAX as usize {
        return Err(EndpointError::dns_error("query exceeds DoT frame size"));
    }

    stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
    stream.write_all(query).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let response_len = u16::from_be_bytes(len_buf) as usize;

    let mut response = vec![0u8; response_len];
    stream.read_exact(&mut response).await?;

    Ok(response)
}

/// Bind the local listener, preferring the real DNS port and falling back
/// when the process lacks the privilege for it.
async fn bind_local_dns() -> Result<UdpSocket> {
    match UdpSocket::bind("127.0.0.1:53").await {
        Ok(socket) => {
            log::info!("Local DNS listening on 127.0.0.1:53");
            Ok(socket)
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            log::warn!(
                "Permission denied on port 53, using port 5353 (run as root or grant CAP_NET_BIND_SERVICE for port 53)"
            );
            let socket = UdpSocket::bind("127.0.0.1:5353").await?;
            log::info!("Local DNS listening on 127.0.0.1:5353");
            Ok(socket)
        }
        Err(err) => Err(err.into()),
    }
}

/// Try the public resolver; a response is only usable when it carries more
/// than a bare header.
async fn try_public_dns(query: &[u8]) -> Option<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect(PUBLIC_RESOLVER).await.ok()?;
    socket.send(query).await.ok()?;

    let mut buffer = vec![0u8; 512];
    let len = tokio::time::timeout(PUBLIC_TIMEOUT, socket.recv(&mut buffer))
        .await
        .ok()?
        .ok()?;

    is_usable_response(&buffer[..len]).then(|| buffer[..len].to_vec())
}

fn is_usable_response(response: &[u8]) -> bool {
    response.len() > DNS_HEADER_LEN
}
