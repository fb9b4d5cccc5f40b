//! DNS-over-TLS resolver for authenticated overlay endpoints.
//!
//! RFC 7858 framing over the shared mTLS listener: every message carries a
//! two-byte big-endian length prefix, and one connection may issue any
//! number of sequential queries. Names inside a zone the caller is allowed
//! to resolve are answered authoritatively; everything else is relayed to
//! the public DoH upstream byte-for-byte.
//!
//! Authoritative `A` answers always carry the proxy's public address. The
//! real backend address never appears in a DNS reply; reaching the backend
//! is the routing proxy's job.

use std::net::Ipv4Addr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::{A, CNAME};
use hickory_proto::rr::{Name, RData, Record};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::error::{GatewayError, Result};
use crate::registry::{self, NameLookup, RecordKind, Registry, Snapshot};
use crate::upstream::DohClient;

const ANSWER_TTL: u32 = 60;

/// How a single query was handled.
enum QueryOutcome {
    /// The registry was authoritative; the serialized reply is ready.
    Answered(Vec<u8>),
    /// Not authoritative (or caller unauthorized); relay to the upstream.
    Forward,
}

/// Accept loop for the DoT port. Each accepted connection runs as its own
/// task so a slow or stuck peer never blocks the others.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    upstream: Arc<DohClient>,
    proxy_addr: Ipv4Addr,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::error!("Error accepting DoT connection: {}", err);
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let registry = registry.clone();
                let upstream = upstream.clone();

                tokio::spawn(async move {
                    if let Err(err) =
                        handle_connection(acceptor, registry, upstream, proxy_addr, stream).await
                    {
                        log::warn!("DoT connection from {} closed: {}", peer_addr, err);
                    }
                });
            }
            _ = shutdown.changed() => {
                log::info!("DoT listener stopping");
                break;
            }
        }
    }
}

/// Serve one authenticated connection until the peer closes or errors.
///
/// The handshake either produces a client certificate chained to the
/// overlay CA or fails outright; after it, a CN missing from the identity
/// table closes the connection without any protocol reply.
async fn handle_connection(
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    upstream: Arc<DohClient>,
    proxy_addr: Ipv4Addr,
    stream: TcpStream,
) -> Result<()> {
    let mut tls_stream = acceptor.accept(stream).await?;
    let cn = crate::tls::peer_common_name(tls_stream.get_ref().1)?;

    if registry.snapshot().identity(&cn).is_none() {
        log::warn!("Rejecting DoT connection from unknown identity {}", cn);
        return Ok(());
    }
    log::debug!("DoT session established for {}", cn);

    loop {
        let mut len_buf = [0u8; 2];
        match tls_stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }

        let query_len = u16::from_be_bytes(len_buf) as usize;
        if query_len == 0 {
            return Err(GatewayError::dns_error("zero-length DNS message"));
        }

        let mut query_buf = vec![0u8; query_len];
        tls_stream.read_exact(&mut query_buf).await?;

        // One snapshot per query: the decision for this message is
        // internally consistent even while a reload lands.
        let snapshot = registry.snapshot();
        let reply = match answer_query(&snapshot, &cn, &query_buf, proxy_addr)? {
            QueryOutcome::Answered(reply) => reply,
            QueryOutcome::Forward => upstream.forward(&query_buf).await?,
        };

        if reply.len() > u16::MAX as usize {
            return Err(GatewayError::dns_error("reply exceeds DoT frame size"));
        }

        tls_stream
            .write_all(&(reply.len() as u16).to_be_bytes())
            .await?;
        tls_stream.write_all(&reply).await?;
        tls_stream.flush().await?;
    }

    Ok(())
}

/// Decide one query against the registry snapshot.
///
/// Authoritative replies carry exactly one answer record: an `A` with the
/// proxy's public address, or a `CNAME` with a trailing dot appended to the
/// stored target when absent. Unauthorized callers and names outside every
/// zone fall through to the upstream, indistinguishably.
fn answer_query(
    snapshot: &Snapshot,
    cn: &str,
    raw_query: &[u8],
    proxy_addr: Ipv4Addr,
) -> Result<QueryOutcome> {
    let request = Message::from_vec(raw_query)?;
    let query = request
        .queries()
        .first()
        .ok_or_else(|| GatewayError::dns_error("query carries no question"))?
        .clone();

    let qname = registry::normalize_name(&query.name().to_utf8());

    let rdata = match snapshot.resolve_name(cn, &qname) {
        NameLookup::Match(zone_match) => {
            log::debug!(
                "Authoritative answer for {} {} in zone {} (label {})",
                cn,
                qname,
                zone_match.suffix,
                zone_match.label
            );

            match zone_match.record.kind {
                RecordKind::A => RData::A(A(proxy_addr)),
                RecordKind::Cname => {
                    let mut target = zone_match.record.rdata.clone();
                    if !target.ends_with('.') {
                        target.push('.');
                    }
                    RData::CNAME(CNAME(Name::from_utf8(&target)?))
                }
            }
        }
        NameLookup::Unauthorized => {
            log::debug!("{} not authorized for {}, forwarding upstream", cn, qname);
            return Ok(QueryOutcome::Forward);
        }
        NameLookup::NotInAnyZone => {
            log::debug!("Not authoritative for {}, forwarding upstream", qname);
            return Ok(QueryOutcome::Forward);
        }
    };

    let answer = Record::from_rdata(query.name().clone(), ANSWER_TTL, rdata);

    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(false);
    response.add_query(query);
    response.add_answer(answer);

    Ok(QueryOutcome::Answered(response.to_vec()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::RecordType;
    use std::collections::HashMap;

    const PROXY_ADDR: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

    fn test_snapshot() -> Snapshot {
        Snapshot::build_for_tests(
            serde_json::from_str(
                r#"{
                    "c0001": {"type": "client", "name": "laptop"},
                    "c0002": {"type": "client", "name": "other"},
                    "s0001": {"type": "service", "name": "acme web"}
                }"#,
            )
            .unwrap(),
            serde_json::from_str(
                r#"{
                    "acme.internal": {
                        "records": {"@": "A 10.0.0.5", "web": "CNAME backend.corp"},
                        "service_cn": "s0001",
                        "allowed_endpoints": ["c0001"]
                    }
                }"#,
            )
            .unwrap(),
            HashMap::new(),
        )
    }

    fn query_bytes(name: &str) -> Vec<u8> {
        let mut message = Message::new();
        message
            .set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(
            Name::from_utf8(name).unwrap(),
            RecordType::A,
        ));
        message.to_vec().unwrap()
    }

    fn answered(outcome: QueryOutcome) -> Message {
        match outcome {
            QueryOutcome::Answered(bytes) => Message::from_vec(&bytes).unwrap(),
            QueryOutcome::Forward => panic!("expected an authoritative answer"),
        }
    }

    #[test]
    fn apex_a_answer_points_at_the_proxy() {
        let snapshot = test_snapshot();
        let outcome =
            answer_query(&snapshot, "c0001", &query_bytes("acme.internal."), PROXY_ADDR).unwrap();

        let response = answered(outcome);
        assert_eq!(response.id(), 4242);
        assert!(response.authoritative());
        assert_eq!(response.answers().len(), 1);

        let record = &response.answers()[0];
        assert_eq!(record.ttl(), ANSWER_TTL);
        // The zone stores the backend address; the reply must not leak it.
        match record.data() {
            RData::A(a) => assert_eq!(a.0, PROXY_ADDR),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn undefined_label_falls_back_to_apex() {
        let snapshot = test_snapshot();
        let outcome = answer_query(
            &snapshot,
            "c0001",
            &query_bytes("api.acme.internal."),
            PROXY_ADDR,
        )
        .unwrap();

        let response = answered(outcome);
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            RData::A(a) => assert_eq!(a.0, PROXY_ADDR),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn cname_answer_gains_a_trailing_dot() {
        let snapshot = test_snapshot();
        let outcome = answer_query(
            &snapshot,
            "c0001",
            &query_bytes("web.acme.internal."),
            PROXY_ADDR,
        )
        .unwrap();

        let response = answered(outcome);
        match response.answers()[0].data() {
            RData::CNAME(cname) => assert_eq!(cname.0.to_utf8(), "backend.corp."),
            other => panic!("expected CNAME record, got {:?}", other),
        }
    }

    #[test]
    fn unauthorized_identity_falls_through_to_upstream() {
        let snapshot = test_snapshot();
        let outcome =
            answer_query(&snapshot, "c0002", &query_bytes("acme.internal."), PROXY_ADDR).unwrap();
        assert!(matches!(outcome, QueryOutcome::Forward));
    }

    #[test]
    fn public_names_fall_through_to_upstream() {
        let snapshot = test_snapshot();
        let outcome =
            answer_query(&snapshot, "c0001", &query_bytes("example.com."), PROXY_ADDR).unwrap();
        assert!(matches!(outcome, QueryOutcome::Forward));
    }

    #[test]
    fn malformed_queries_are_fatal_for_the_connection() {
        let snapshot = test_snapshot();
        assert!(answer_query(&snapshot, "c0001", b"\x00\x01trash", PROXY_ADDR).is_err());
    }
}
