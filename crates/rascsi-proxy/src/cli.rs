//! Proxy CLI implementation.
//!
//! Provides command-line argument parsing for the RaSCSI proxy.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use rascsi_control::SocketTransport;
use rascsi_core::constants::{DEFAULT_ENGINE_HOST, DEFAULT_PROXY_PORT, DEFAULT_PROXY_UPSTREAM_PORT};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for rascsi_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => rascsi_core::LogFormat::Text,
            CliLogFormat::Json => rascsi_core::LogFormat::Json,
        }
    }
}

/// rascsi-proxy - transparent proxy with lifecycle plugins.
#[derive(Debug, Parser)]
#[command(
    name = "rascsi-proxy",
    version,
    about = "rascsi-proxy - transparent RaSCSI protocol proxy with lifecycle plugins"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0", env = "RASCSI_PROXY_BIND")]
    pub bind_addr: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PROXY_PORT, env = "RASCSI_PROXY_PORT")]
    pub port: u16,

    /// Engine host to forward to
    #[arg(long = "upstream-host", default_value = DEFAULT_ENGINE_HOST, env = "RASCSI_HOST")]
    pub upstream_host: String,

    /// Engine port to forward to
    #[arg(
        long = "upstream-port",
        default_value_t = DEFAULT_PROXY_UPSTREAM_PORT,
        env = "RASCSI_UPSTREAM_PORT"
    )]
    pub upstream_port: u16,

    /// Directory of plugin manifests (*.toml)
    #[arg(long = "plugin-dir", value_name = "DIR", env = "RASCSI_PROXY_PLUGIN_DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// Get the socket address to listen on.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Transport to the engine being proxied.
    pub fn upstream(&self) -> SocketTransport {
        SocketTransport::new(self.upstream_host.clone(), self.upstream_port)
    }

    /// Whether listening would loop back into the proxy itself.
    pub fn forwards_to_self(&self) -> bool {
        let local = matches!(self.upstream_host.as_str(), "localhost" | "127.0.0.1" | "::1");
        local && self.upstream_port == self.port
    }
}
