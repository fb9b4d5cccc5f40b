//! mTLS routing proxy: terminate the client's TLS session, find the
//! virtual host in the first request, splice to the registered backend.
//!
//! The proxy never rewrites payload. After its own handshake it forwards
//! bytes verbatim in both directions, so invariantly the backend sees the
//! peeked bytes exactly once, in order, followed by everything else the
//! client sends.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::error::Result;
use crate::registry::{Registry, RouteLookup};

/// The only application-layer error a caller ever sees.
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\nNo route to service\r\n";

/// The proxy refuses to buffer more than this before it knows where the
/// connection is going.
const PEEK_LIMIT: usize = 8 * 1024;
const PEEK_DEADLINE: Duration = Duration::from_secs(5);
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

/// Accept loop for the proxy port; one independent task per connection.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::error!("Error accepting proxy connection: {}", err);
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let registry = registry.clone();

                tokio::spawn(async move {
                    if let Err(err) = handle_connection(acceptor, registry, stream).await {
                        log::warn!("Proxy connection from {} closed: {}", peer_addr, err);
                    }
                });
            }
            _ = shutdown.changed() => {
                log::info!("Proxy listener stopping");
                break;
            }
        }
    }
}

/// Drive one connection through peek, dispatch and splice.
///
/// Every failure before the splice emits at most the fixed 502 line; a
/// connection that produced no bytes at all is closed silently.
async fn handle_connection(
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    stream: TcpStream,
) -> Result<()> {
    let mut tls_stream = acceptor.accept(stream).await?;
    let cn = crate::tls::peer_common_name(tls_stream.get_ref().1)?;

    // The snapshot taken here serves the whole connection.
    let snapshot = registry.snapshot();
    if snapshot.identity(&cn).is_none() {
        log::warn!("Rejecting proxy connection from unknown identity {}", cn);
        return Ok(());
    }

    let peeked = peek_request(&mut tls_stream).await?;
    if peeked.is_empty() {
        log::debug!("Proxy connection from {} sent no request bytes", cn);
        return Ok(());
    }

    let host = match find_host_header(&peeked) {
        Some(host) => host,
        None => {
            log::warn!("No Host header within peek window from {}", cn);
            return refuse(&mut tls_stream).await;
        }
    };

    let route = match snapshot.route_for_host(&cn, &host) {
        RouteLookup::Route(route) => route,
        RouteLookup::Denied => {
            log::warn!("Identity {} is not allowed to reach {}", cn, host);
            return refuse(&mut tls_stream).await;
        }
        RouteLookup::NoRoute => {
            log::warn!("No route registered for host {}", host);
            return refuse(&mut tls_stream).await;
        }
    };

    let backend = tokio::time::timeout(
        CONNECT_DEADLINE,
        TcpStream::connect((route.host.as_str(), route.port)),
    )
    .await;
    let mut backend = match backend {
        Ok(Ok(backend)) => backend,
        Ok(Err(err)) => {
            log::error!(
                "Backend {}:{} for {} unreachable: {}",
                route.host,
                route.port,
                host,
                err
            );
            return refuse(&mut tls_stream).await;
        }
        Err(_) => {
            log::error!(
                "Backend {}:{} for {} did not accept within {:?}",
                route.host,
                route.port,
                host,
                CONNECT_DEADLINE
            );
            return refuse(&mut tls_stream).await;
        }
    };

    log::info!("Routing {} for {} to {}:{}", host, cn, route.host, route.port);

    let (to_backend, to_client) = splice(&mut tls_stream, &mut backend, &peeked).await?;
    log::debug!(
        "Connection for {} finished: {} bytes to backend, {} bytes to client",
        host,
        to_backend,
        to_client
    );

    Ok(())
}

/// Read the start of the request, up to 8 KiB or 5 seconds, stopping as
/// soon as a `Host:` header (or a complete header block without one) is in
/// the buffer. Short reads accumulate; EOF and the deadline end the phase
/// with whatever arrived.
async fn peek_request<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; PEEK_LIMIT];
    let mut filled = 0;
    let deadline = tokio::time::Instant::now() + PEEK_DEADLINE;

    while filled < PEEK_LIMIT {
        let read = match tokio::time::timeout_at(deadline, stream.read(&mut buffer[filled..])).await
        {
            Ok(read) => read?,
            Err(_) => break,
        };
        if read == 0 {
            break;
        }
        filled += read;

        if find_host_header(&buffer[..filled]).is_some() || headers_complete(&buffer[..filled]) {
            break;
        }
    }

    buffer.truncate(filled);
    Ok(buffer)
}

fn headers_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|window| window == b"\r\n\r\n")
}

/// First case-insensitive `Host:` header in the buffered bytes, lowercased
/// and with an optional `:port` suffix stripped. Scanning stops at the end
/// of the header block so body bytes can never supply a host.
pub(crate) fn find_host_header(buf: &[u8]) -> Option<String> {
    for line in buf.split(|byte| *byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"host:") {
            let value = String::from_utf8_lossy(&line[5..]);
            let value = value.trim();
            if value.is_empty() {
                return None;
            }
            return Some(strip_port(value).to_ascii_lowercase());
        }
    }

    None
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Send the fixed 502 line and close.
async fn refuse<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(BAD_GATEWAY).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Replay the peeked bytes to the backend, then pump both directions until
/// either side finishes. A half-close lets the other direction drain before
/// everything shuts down; neither socket is left half-open.
async fn splice<C, B>(client: &mut C, backend: &mut B, peeked: &[u8]) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    backend.write_all(peeked).await?;
    let (copied_to_backend, copied_to_client) = tokio::io::copy_bidirectional(client, backend).await?;
    Ok((copied_to_backend + peeked.len() as u64, copied_to_client))
}
