//! Run an external program for every hook.
//!
//! The program is invoked as `<program> [args..] <hook> <id> <type> <path>`
//! with a bounded wait. A non-zero exit fails the hook.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use rascsi_core::{Error, Result};
use rascsi_files::process;

use super::{DeviceEvent, Hook, Plugin};

fn default_timeout_secs() -> u64 {
    10
}

/// `kind = "exec"` manifest settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub program: PathBuf,
    /// Leading arguments placed before the hook arguments.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

pub struct ExecPlugin {
    name: String,
    config: ExecConfig,
}

impl ExecPlugin {
    pub fn new(fallback_name: &str, config: ExecConfig) -> Self {
        let name = config.name.clone().unwrap_or_else(|| fallback_name.to_string());
        Self { name, config }
    }

    async fn invoke(&self, hook: Hook, event: &DeviceEvent) -> Result<()> {
        let mut args = self.config.args.clone();
        args.extend([
            hook.as_str().to_string(),
            event.id.to_string(),
            event.device_type.clone(),
            event.path.display().to_string(),
        ]);
        let program = self.config.program.display().to_string();
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let output = process::run_checked(&program, &args, None, timeout).await?;
        debug!(plugin = %self.name, hook = hook.as_str(), output = %output.stdout.trim(), "Hook program finished");
        Ok(())
    }
}

#[async_trait]
impl Plugin for ExecPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init_hook(&self) -> Result<()> {
        let program = &self.config.program;
        // Bare names are resolved through PATH at spawn time.
        if program.components().count() > 1 && !tokio::fs::try_exists(program).await.unwrap_or(false) {
            return Err(Error::invalid_argument(format!(
                "hook program {} does not exist",
                program.display()
            )));
        }
        info!(plugin = %self.name, program = %program.display(), "Exec plugin ready");
        Ok(())
    }

    async fn attach_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.invoke(Hook::Attach, event).await
    }

    async fn insert_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.invoke(Hook::Insert, event).await
    }

    async fn detach_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.invoke(Hook::Detach, event).await
    }

    async fn eject_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.invoke(Hook::Eject, event).await
    }
}
