//! rascsi-proxy binary entry point.
//!
//! Listens for engine clients and forwards to the real engine.

use clap::Parser;
use tracing::{error, info};

use rascsi_proxy::{Cli, PluginRegistry, ProxyServer};

fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = rascsi_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "rascsi-proxy starting");

    if cli.forwards_to_self() {
        error!(port = cli.port, "Upstream port equals listen port on this host");
        eprintln!("rascsi-proxy: --upstream-port must differ from --port");
        std::process::exit(2);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("rascsi-proxy: failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(&cli)) {
        error!(error = %e, "Proxy failed");
        eprintln!("rascsi-proxy: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> rascsi_core::Result<()> {
    let plugins = match &cli.plugin_dir {
        Some(dir) => PluginRegistry::discover(dir).await,
        None => PluginRegistry::new(),
    };
    for name in plugins.names() {
        info!(plugin = name, "Plugin found");
    }
    plugins.init_all().await;

    let server = ProxyServer::bind(cli.socket_addr(), cli.upstream(), plugins).await?;
    server.run().await
}
