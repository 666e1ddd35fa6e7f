//! Connection and directory settings for control plane components.

use std::path::PathBuf;

use crate::constants::{DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT};
use crate::paths::default_cfg_dir;

/// Default locale passed to the engine.
pub const DEFAULT_LOCALE: &str = "en";

/// Settings shared by the engine client and the file manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSettings {
    /// Engine host name or address.
    pub host: String,
    /// Engine TCP port.
    pub port: u16,
    /// Authentication token sent with every command, if any.
    pub token: Option<String>,
    /// Locale for engine-generated messages.
    pub locale: String,
    /// Directory holding configuration snapshots and properties sidecars.
    pub cfg_dir: PathBuf,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_ENGINE_HOST.to_string(),
            port: DEFAULT_ENGINE_PORT,
            token: None,
            locale: DEFAULT_LOCALE.to_string(),
            cfg_dir: default_cfg_dir(),
        }
    }
}

impl ControlSettings {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the token; an empty string clears it.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_cfg_dir(mut self, cfg_dir: impl Into<PathBuf>) -> Self {
        self.cfg_dir = cfg_dir.into();
        self
    }

    /// `host:port` for log messages and connects.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = ControlSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 6868);
        assert_eq!(settings.token, None);
        assert_eq!(settings.locale, "en");
        assert!(settings.cfg_dir.ends_with(".config/rascsi"));
    }

    #[test]
    fn builder_methods() {
        let settings = ControlSettings::default()
            .with_host("pi.local")
            .with_port(7000)
            .with_token(Some("secret".into()))
            .with_locale("de")
            .with_cfg_dir("/tmp/cfg");
        assert_eq!(settings.endpoint(), "pi.local:7000");
        assert_eq!(settings.token.as_deref(), Some("secret"));
        assert_eq!(settings.locale, "de");
        assert_eq!(settings.cfg_dir, PathBuf::from("/tmp/cfg"));
    }

    #[test]
    fn empty_token_means_none() {
        let settings = ControlSettings::default().with_token(Some(String::new()));
        assert_eq!(settings.token, None);
    }
}
