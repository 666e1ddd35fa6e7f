//! Mount images on the host while the engine is not using them.
//!
//! On detach or eject, an image with a `<image><automount_extension>` file
//! declaring `mount_options` is mounted at
//! `<automount_directory>/<image file name>`. On attach or insert that mount
//! is lazily unmounted and its directory removed, so the engine and the host
//! never write the same filesystem at once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use rascsi_core::constants::UTILITY_TIMEOUT;
use rascsi_core::{Error, Result};
use rascsi_files::json::decode_latin1;
use rascsi_files::process;

use super::{DeviceEvent, Plugin};

/// Key of the per-image file that enables mounting.
const MOUNT_OPTIONS_KEY: &str = "mount_options";

fn default_extension() -> String {
    ".automount".to_string()
}

fn default_sudo() -> String {
    "sudo".to_string()
}

fn default_mount() -> String {
    "mount".to_string()
}

fn default_umount() -> String {
    "umount".to_string()
}

/// `kind = "automount"` manifest settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AutomountConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub automount_directory: PathBuf,
    #[serde(default = "default_extension")]
    pub automount_extension: String,
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default = "default_sudo")]
    pub sudo: String,
    #[serde(default = "default_mount")]
    pub mount: String,
    #[serde(default = "default_umount")]
    pub umount: String,
}

impl AutomountConfig {
    pub fn new(automount_directory: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            automount_directory: automount_directory.into(),
            automount_extension: default_extension(),
            use_sudo: false,
            sudo: default_sudo(),
            mount: default_mount(),
            umount: default_umount(),
        }
    }
}

pub struct AutomountPlugin {
    name: String,
    config: AutomountConfig,
}

impl AutomountPlugin {
    pub fn new(fallback_name: &str, config: AutomountConfig) -> Self {
        let name = config.name.clone().unwrap_or_else(|| fallback_name.to_string());
        Self { name, config }
    }

    /// `<automount_directory>/<image file name>`.
    pub fn mount_point(&self, image: &Path) -> Option<PathBuf> {
        image
            .file_name()
            .map(|file| self.config.automount_directory.join(file))
    }

    fn options_file(&self, image: &Path) -> PathBuf {
        PathBuf::from(format!("{}{}", image.display(), self.config.automount_extension))
    }

    async fn run(&self, program: &str, mut args: Vec<String>) -> Result<()> {
        let program = if self.config.use_sudo {
            args.insert(0, program.to_string());
            self.config.sudo.as_str()
        } else {
            program
        };
        process::run_checked(program, &args, None, UTILITY_TIMEOUT).await?;
        Ok(())
    }

    async fn mount(&self, image: &Path) -> Result<()> {
        let options_file = self.options_file(image);
        let bytes = match tokio::fs::read(&options_file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %options_file.display(), "No automount file, not mounting");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let settings = parse_image_settings(&decode_latin1(&bytes));
        let Some(options) = settings.get(MOUNT_OPTIONS_KEY) else {
            warn!(path = %options_file.display(), "Automount file has no mount_options, not mounting");
            return Ok(());
        };

        let mount_point = self
            .mount_point(image)
            .ok_or_else(|| Error::invalid_argument(format!("no file name in {}", image.display())))?;
        tokio::fs::create_dir_all(&mount_point).await?;

        let mut args = Vec::new();
        if !options.is_empty() {
            args.push("-o".to_string());
            args.push(options.clone());
        }
        args.push(image.display().to_string());
        args.push(mount_point.display().to_string());
        self.run(&self.config.mount, args).await?;

        info!(image = %image.display(), mount_point = %mount_point.display(), "Mounted image");
        Ok(())
    }

    async fn unmount(&self, image: &Path) -> Result<()> {
        let Some(mount_point) = self.mount_point(image) else {
            return Ok(());
        };
        if !tokio::fs::try_exists(&mount_point).await.unwrap_or(false) {
            debug!(mount_point = %mount_point.display(), "Not mounted");
            return Ok(());
        }

        if !is_empty_dir(&mount_point).await? {
            let args = vec!["-l".to_string(), mount_point.display().to_string()];
            self.run(&self.config.umount, args).await?;
            info!(image = %image.display(), mount_point = %mount_point.display(), "Unmounted image");
        }
        tokio::fs::remove_dir(&mount_point).await?;
        Ok(())
    }
}

#[async_trait]
impl Plugin for AutomountPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init_hook(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.automount_directory).await?;
        info!(
            plugin = %self.name,
            dir = %self.config.automount_directory.display(),
            sudo = self.config.use_sudo,
            "Automount ready"
        );
        Ok(())
    }

    async fn attach_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.unmount(&event.path).await
    }

    async fn insert_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.unmount(&event.path).await
    }

    async fn detach_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.mount(&event.path).await
    }

    async fn eject_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.mount(&event.path).await
    }
}

/// `key = value` (or `key: value`) lines; `#` and `;` start comments.
fn parse_image_settings(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let split = line.find(['=', ':'])?;
            let (key, value) = line.split_at(split);
            Some((key.trim().to_string(), value[1..].trim().to_string()))
        })
        .collect()
}

async fn is_empty_dir(dir: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}
