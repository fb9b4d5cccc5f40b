//! Gateway binary entrypoint.
//!
//! Parses CLI arguments, loads the registry and TLS material, then runs the
//! two listeners (DoT resolver and routing proxy) until a shutdown signal
//! arrives. Only initialization failures terminate the process; once the
//! listeners are up, errors stay local to the connection that observed
//! them.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use tokio_rustls::TlsAcceptor;

use gateway::registry::Registry;
use gateway::upstream::DohClient;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(clap::Parser)]
#[command(version)]
pub struct Cli {
    /// Address the DNS-over-TLS resolver listens on
    #[arg(long = "dot-listen", default_value = "0.0.0.0:853")]
    pub dot_listen: std::net::SocketAddr,

    /// Address the routing proxy listens on
    #[arg(long = "proxy-listen", default_value = "0.0.0.0:8443")]
    pub proxy_listen: std::net::SocketAddr,

    /// Public IPv4 address of the routing proxy, returned in every
    /// authoritative A answer
    #[arg(long = "proxy-public-ip")]
    pub proxy_public_ip: Ipv4Addr,

    /// Directory holding endpoints.json, zones.json and routes.json
    #[arg(long = "data-dir", default_value = "/opt/zerotrust-dns/data")]
    pub data_dir: PathBuf,

    /// DoH resolver queries outside the private zones are forwarded to
    #[arg(
        long = "doh-upstream",
        default_value = "https://cloudflare-dns.com/dns-query"
    )]
    pub doh_upstream: String,

    /// Seconds between checks of the registry files for changes
    #[arg(long = "reload-interval", default_value_t = 5)]
    pub reload_interval: u64,

    #[command(flatten)]
    pub tls: gateway::tls::TlsFiles,
}

#[tokio::main]
async fn main() -> gateway::error::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let cli_args = Cli::parse();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let registry = Arc::new(Registry::load(cli_args.data_dir.clone())?);
    let upstream = Arc::new(DohClient::new(cli_args.doh_upstream.clone())?);
    let acceptor = TlsAcceptor::from(Arc::new(cli_args.tls.server_config()?));

    let dot_listener = tokio::net::TcpListener::bind(cli_args.dot_listen).await?;
    log::info!("DoT resolver listening on {}", cli_args.dot_listen);
    let proxy_listener = tokio::net::TcpListener::bind(cli_args.proxy_listen).await?;
    log::info!("Routing proxy listening on {}", cli_args.proxy_listen);
    log::info!(
        "Private A answers will point at {}",
        cli_args.proxy_public_ip
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(gateway::registry::run_reloader(
        registry.clone(),
        Duration::from_secs(cli_args.reload_interval),
        shutdown_rx.clone(),
    ));
    tokio::spawn(gateway::dot::serve(
        dot_listener,
        acceptor.clone(),
        registry.clone(),
        upstream,
        cli_args.proxy_public_ip,
        shutdown_rx.clone(),
    ));
    tokio::spawn(gateway::proxy::serve(
        proxy_listener,
        acceptor,
        registry,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    Ok(())
}
