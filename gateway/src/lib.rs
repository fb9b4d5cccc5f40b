//! Gateway library for the zero-trust DNS overlay.
//!
//! This crate provides the pieces used by the `gateway` binary:
//! - The `registry` module owns the identity, zone and route tables the
//!   provisioning console persists as JSON, published as atomic snapshots.
//! - The `dot` module serves DNS-over-TLS to authenticated endpoints,
//!   answering from authorized zones and relaying everything else to the
//!   public DoH upstream.
//! - The `proxy` module terminates mTLS, finds the virtual host in the
//!   first request and splices the connection to the registered backend.
//! - The `tls` and `upstream` modules carry the shared TLS configuration
//!   and the DoH client both listeners depend on.
//!
//! Design notes:
//! - Handlers never share mutable state; they clone an `Arc<Snapshot>` from
//!   the registry and keep it for the request they are serving.
//! - Every accepted connection runs in its own task; an error is fatal for
//!   that connection only.

pub mod dot;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod tls;
pub mod upstream;
