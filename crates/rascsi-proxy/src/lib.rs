//! rascsi-proxy: transparent proxy in front of the RaSCSI engine.
//!
//! Provides:
//! - The proxy server speaking the engine wire protocol to clients
//! - Lifecycle plugins notified around attach, insert, detach and eject
//! - Built-in automount and exec plugins, discovered from TOML manifests

pub mod cli;
pub mod plugin;
pub mod server;

pub use cli::Cli;
pub use plugin::{DeviceEvent, Hook, Plugin, PluginManifest, PluginRegistry};
pub use server::{ProxyServer, handle_connection};
