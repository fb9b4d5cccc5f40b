//! Endpoint binary entrypoint.
//!
//! Loads the installer package from the configured directory, verifies the
//! signed configuration token against the packaged CA, then runs the local
//! DNS proxy until interrupted. The binary is intentionally a thin
//! wrapper: package checks, token verification and the proxy loop live in
//! the `endpoint` library crate.

use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;

use endpoint::config::EndpointKind;
use endpoint::dns_proxy::DnsProxy;

#[derive(clap::Parser)]
#[command(version)]
pub struct Cli {
    /// Directory containing config.zt, ca.crt, endpoint.crt and endpoint.key
    #[arg(long = "package-dir", default_value = ".")]
    pub package_dir: PathBuf,
}

#[tokio::main]
async fn main() -> endpoint::error::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let cli_args = Cli::parse();
    log::info!("ZeroTrust DNS Endpoint starting...");

    endpoint::config::check_package_files(&cli_args.package_dir)?;
    let config = endpoint::config::load_config(&cli_args.package_dir)?;
    let tls_config = endpoint::tls::client_config(&cli_args.package_dir)?;

    let endpoint_kind = match config.kind {
        EndpointKind::Client => "CLIENT",
        EndpointKind::Service => "SERVICE",
    };
    log::info!(
        "ZeroTrust {} Endpoint Active -> {}",
        endpoint_kind,
        config.server
    );
    log::info!("Service proxy available at: {}", config.proxy);
    if !config.domains.is_empty() {
        log::info!("Authorized domains: {}", config.domains.join(", "));
    }

    DnsProxy::new(config, tls_config)?.run().await
}
