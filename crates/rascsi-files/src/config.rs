//! Configuration snapshots.
//!
//! A snapshot captures the attached devices, the reserved ids with their
//! memos, and the engine version. Two on-disk shapes are understood:
//!
//! - current: `{"version": .., "devices": [..], "reserved_ids": [..]}`
//! - legacy: a bare device array using `un` for the unit
//!
//! Saving always writes the current shape.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use rascsi_control::{AttachRequest, DeviceInfo, parse_device_type};
use rascsi_core::constants::ENGINE_DEFAULT_VENDOR;
use rascsi_core::{Envelope, Error, Result, ReturnCode};

use crate::json;
use crate::manager::FileManager;
use crate::properties::{remove_partial, write_json_file};

/// Persisted configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub version: String,
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub reserved_ids: Vec<ReservedEntry>,
}

/// One attached device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: u32,
    #[serde(default, alias = "un")]
    pub unit: u32,
    pub device_type: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub block_size: Option<u32>,
}

/// A reserved id and why it is held.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedEntry {
    #[serde(serialize_with = "id_as_string", deserialize_with = "id_from_any")]
    pub id: u32,
    #[serde(default)]
    pub memo: String,
}

fn id_as_string<S: serde::Serializer>(id: &u32, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&id.to_string())
}

fn id_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AnyId {
        Int(u32),
        Str(String),
    }
    match AnyId::deserialize(deserializer)? {
        AnyId::Int(id) => Ok(id),
        AnyId::Str(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl DeviceEntry {
    /// Stable form of a live device: volatile fields dropped, engine
    /// defaults and empty values nulled.
    pub fn from_device(device: &DeviceInfo) -> Self {
        let engine_default = device.vendor == ENGINE_DEFAULT_VENDOR;
        let identity = |value: &str| {
            if engine_default || value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        };
        Self {
            id: device.id,
            unit: device.unit,
            device_type: device.device_type.clone(),
            image: (!device.image.is_empty()).then(|| device.image.clone()),
            params: device.params.clone(),
            vendor: identity(&device.vendor),
            product: identity(&device.product),
            revision: identity(&device.revision),
            block_size: (device.block_size != 0).then_some(device.block_size),
        }
    }

    /// Attach request that recreates this device.
    pub fn to_request(&self) -> Result<AttachRequest> {
        let mut request = AttachRequest::new()
            .with_unit(self.unit)
            .with_type(parse_device_type(&self.device_type)?);
        request.params = self.params.clone();
        if let Some(image) = self.image.as_deref().filter(|image| !image.is_empty()) {
            request = request.with_file(image);
        }
        request.vendor = self.vendor.clone();
        request.product = self.product.clone();
        request.revision = self.revision.clone();
        request.block_size = self.block_size;
        Ok(request)
    }
}

/// Parsed snapshot text with the shape it came in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedConfig {
    Current(ConfigSnapshot),
    Legacy(Vec<DeviceEntry>),
}

/// Recognize either snapshot shape.
pub fn parse_config(text: &str) -> Result<LoadedConfig> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(invalid_format)?;
    match value {
        serde_json::Value::Object(_) => serde_json::from_value(value)
            .map(LoadedConfig::Current)
            .map_err(invalid_format),
        serde_json::Value::Array(_) => serde_json::from_value(value)
            .map(LoadedConfig::Legacy)
            .map_err(invalid_format),
        other => Err(Error::InvalidConfigFormat {
            message: format!("unexpected top-level JSON {}", json_kind(&other)),
        }),
    }
}

fn invalid_format(e: serde_json::Error) -> Error {
    Error::InvalidConfigFormat {
        message: e.to_string(),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl FileManager {
    /// Capture the live configuration into `<cfg_dir>/<name>`.
    pub async fn write_config(&self, name: &str) -> Envelope {
        let target = match self.cfg_path(name) {
            Ok(path) => path,
            Err(e) => return Envelope::from_error(&e),
        };
        let shown_path = target.display().to_string();

        let result = async {
            let snapshot = self.snapshot().await?;
            write_json_file(&target, &snapshot).await
        };
        match result.await {
            Ok(()) => {
                info!(path = %shown_path, "Saved configuration");
                Envelope::success(ReturnCode::WriteConfigSuccess).with_param("target_path", shown_path)
            }
            Err(e) => {
                warn!(path = %shown_path, error = %e, "Could not save configuration");
                remove_partial(&target).await;
                Envelope::from_error(&e)
                    .with_return_code(ReturnCode::WriteConfigCouldNotWrite)
                    .with_param("target_path", shown_path)
            }
        }
    }

    /// Current devices, reservations and version as a snapshot.
    pub async fn snapshot(&self) -> Result<ConfigSnapshot> {
        let version = self.client().version().await?;
        let devices = self
            .client()
            .list_devices(None, None)
            .await?
            .iter()
            .map(DeviceEntry::from_device)
            .collect();
        let memos = self.reservations().snapshot();
        let reserved_ids = self
            .client()
            .reserved_ids()
            .await?
            .into_iter()
            .map(|id| ReservedEntry {
                id,
                memo: memos.get(id as usize).cloned().unwrap_or_default(),
            })
            .collect();
        Ok(ConfigSnapshot {
            version,
            devices,
            reserved_ids,
        })
    }

    /// Replace the live configuration with `<cfg_dir>/<name>`.
    ///
    /// Detaches everything, re-reserves, then attaches in snapshot order.
    /// A legacy snapshot has no reservations and leaves the current ones
    /// and their memos in place. The first failing step ends the load;
    /// earlier steps are not undone.
    pub async fn read_config(&self, name: &str) -> Envelope {
        let source = match self.cfg_path(name) {
            Ok(path) => path,
            Err(e) => return Envelope::from_error(&e),
        };

        let loaded = match read_snapshot(&source).await {
            Ok(loaded) => loaded,
            Err(e @ Error::InvalidConfigFormat { .. }) => {
                warn!(path = %source.display(), error = %e, "Invalid configuration file");
                return Envelope::from_error(&e).with_param("file_name", name);
            }
            Err(e) => {
                warn!(path = %source.display(), error = %e, "Could not read configuration");
                return Envelope::from_error(&e)
                    .with_return_code(ReturnCode::ReadConfigCouldNotRead)
                    .with_param("file_name", name);
            }
        };
        let applied = match &loaded {
            LoadedConfig::Current(snapshot) => self.apply_snapshot(snapshot).await,
            LoadedConfig::Legacy(devices) => {
                warn!(path = %source.display(), "Loading deprecated configuration format; save again to upgrade");
                self.apply_legacy(devices).await
            }
        };

        match applied {
            Ok(()) => {
                info!(path = %source.display(), "Loaded configuration");
                Envelope::success(ReturnCode::ReadConfigSuccess).with_param("file_name", name)
            }
            Err(e) => Envelope::from_error(&e).with_param("file_name", name),
        }
    }

    async fn apply_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        self.client().detach_all().await?;
        self.reservations().clear_all();

        let ids: Vec<u32> = snapshot.reserved_ids.iter().map(|entry| entry.id).collect();
        self.client().reserve_ids(&ids).await?;
        for entry in &snapshot.reserved_ids {
            self.reservations().set(entry.id, entry.memo.clone())?;
        }

        self.attach_entries(&snapshot.devices).await
    }

    async fn apply_legacy(&self, devices: &[DeviceEntry]) -> Result<()> {
        self.client().detach_all().await?;
        self.attach_entries(devices).await
    }

    async fn attach_entries(&self, devices: &[DeviceEntry]) -> Result<()> {
        for device in devices {
            let request = device.to_request()?;
            self.client().attach(device.id, &request).await?;
        }
        Ok(())
    }
}

async fn read_snapshot(path: &Path) -> Result<LoadedConfig> {
    let bytes = tokio::fs::read(path).await?;
    parse_config(&json::decode_latin1(&bytes))
}
