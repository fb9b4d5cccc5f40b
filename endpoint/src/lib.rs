//! Endpoint library for the zero-trust DNS overlay.
//!
//! This crate provides the pieces used by the `endpoint` binary:
//! - The `config` module loads and verifies the RS256-signed configuration
//!   token shipped in the installer package.
//! - The `tls` module builds the mTLS client configuration from the
//!   packaged certificate, key and CA.
//! - The `dns_proxy` module binds the local UDP DNS socket and forwards
//!   queries to the overlay resolver over DNS-over-TLS.

pub mod config;
pub mod dns_proxy;
pub mod error;
pub mod tls;
