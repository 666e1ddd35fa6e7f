//! Typed views over engine results.
//!
//! The protobuf messages stay the wire contract; these structs are what the
//! rest of the control plane and the CLI work with.

use std::collections::BTreeMap;

use rascsi_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::proto::{
    PbDevice, PbDeviceProperties, PbDeviceStatus, PbDeviceType, PbImageFilesInfo, PbServerInfo,
};

// ============================================================================
// Device types
// ============================================================================

/// Parse a four-letter tag such as `SCHD` (case-insensitive).
pub fn parse_device_type(tag: &str) -> Result<PbDeviceType> {
    let upper = tag.trim().to_ascii_uppercase();
    match PbDeviceType::from_str_name(&upper) {
        Some(PbDeviceType::Undefined) | None => Err(Error::invalid_argument(format!(
            "unknown device type '{}'",
            tag
        ))),
        Some(device_type) => Ok(device_type),
    }
}

/// Tag for a raw enum value, e.g. `2` -> `SCHD`.
pub fn device_type_name(raw: i32) -> String {
    PbDeviceType::try_from(raw)
        .map(|t| t.as_str_name().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Capabilities of one device type, as announced by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTypeInfo {
    pub removable: bool,
    pub supports_file: bool,
    pub params: BTreeMap<String, String>,
    pub block_sizes: Vec<u32>,
}

impl From<&PbDeviceProperties> for DeviceTypeInfo {
    fn from(props: &PbDeviceProperties) -> Self {
        Self {
            removable: props.removable,
            supports_file: props.supports_file,
            params: props.default_params.clone(),
            block_sizes: props.block_sizes.clone(),
        }
    }
}

// ============================================================================
// Attach routing
// ============================================================================

/// Wire operation chosen for an attach request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachRoute {
    /// Create a new device.
    Attach,
    /// Load media into the removable device already in the slot.
    Insert,
    /// Both types are removable but differ; nothing may be sent.
    Mismatch {
        requested: PbDeviceType,
        current: PbDeviceType,
    },
}

/// Decide between ATTACH and INSERT.
///
/// INSERT is chosen only when the slot already holds a removable device and
/// the request names the same removable type. Two different removable types
/// never trigger an implicit detach.
pub fn route_attach(
    current: Option<PbDeviceType>,
    requested: Option<PbDeviceType>,
    removable: &[PbDeviceType],
) -> AttachRoute {
    match (current, requested) {
        (Some(current), Some(requested))
            if removable.contains(&current) && removable.contains(&requested) =>
        {
            if current == requested {
                AttachRoute::Insert
            } else {
                AttachRoute::Mismatch { requested, current }
            }
        }
        _ => AttachRoute::Attach,
    }
}

/// Everything a caller may specify when attaching a device.
///
/// Only non-empty fields go on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachRequest {
    pub unit: Option<u32>,
    pub device_type: Option<PbDeviceType>,
    pub params: BTreeMap<String, String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub revision: Option<String>,
    pub block_size: Option<u32>,
}

impl AttachRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, unit: u32) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_type(mut self, device_type: PbDeviceType) -> Self {
        self.device_type = Some(device_type);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Shorthand for the `file` parameter.
    pub fn with_file(self, file: impl Into<String>) -> Self {
        self.with_param("file", file)
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Image file named in the request, if any.
    pub fn file(&self) -> Option<&str> {
        self.params
            .get("file")
            .map(String::as_str)
            .filter(|f| !f.is_empty())
    }
}

/// Result of an attach call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachOutcome {
    /// True when the request was routed to INSERT.
    pub inserted: bool,
    pub message: String,
}

// ============================================================================
// Devices
// ============================================================================

/// Compose the status string from flags that the device is capable of.
///
/// Order is fixed: Read-Only, Write-Protected, No Media, Locked.
pub fn status_string(props: &PbDeviceProperties, status: &PbDeviceStatus) -> String {
    let mut parts = Vec::new();
    if props.read_only {
        parts.push("Read-Only");
    }
    if status.protected && props.protectable {
        parts.push("Write-Protected");
    }
    if status.removed && props.removable {
        parts.push("No Media");
    }
    if status.locked && props.lockable {
        parts.push("Locked");
    }
    parts.join(", ")
}

/// One attached device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u32,
    pub unit: u32,
    pub device_type: String,
    pub status: String,
    /// Image path as reported by the engine.
    pub image: String,
    /// Image path relative to the images directory.
    pub file: String,
    pub params: BTreeMap<String, String>,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub block_size: u32,
    pub size: u64,
}

impl DeviceInfo {
    pub fn from_pb(device: &PbDevice, images_dir: &str) -> Self {
        let props = device.properties.clone().unwrap_or_default();
        let status = device.status.clone().unwrap_or_default();
        let image = device
            .file
            .as_ref()
            .map(|f| f.name.clone())
            .unwrap_or_default();
        let prefix = format!("{}/", images_dir.trim_end_matches('/'));
        let file = image
            .strip_prefix(prefix.as_str())
            .unwrap_or(image.as_str())
            .to_string();
        let block_size = device.block_size.max(0) as u32;

        Self {
            id: device.id.max(0) as u32,
            unit: device.unit.max(0) as u32,
            device_type: device_type_name(device.r#type),
            status: status_string(&props, &status),
            file,
            image,
            params: device.params.clone(),
            vendor: device.vendor.clone(),
            product: device.product.clone(),
            revision: device.revision.clone(),
            block_size,
            size: device.block_count.saturating_mul(u64::from(block_size)),
        }
    }
}

// ============================================================================
// Server information
// ============================================================================

/// Summary of `SERVER_INFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub log_levels: Vec<String>,
    pub current_log_level: String,
    pub reserved_ids: Vec<u32>,
    pub image_dir: String,
    pub scan_depth: i32,
    /// File suffixes the engine maps to each device type.
    pub schd: Vec<String>,
    pub scrm: Vec<String>,
    pub scmo: Vec<String>,
    pub sccd: Vec<String>,
}

/// `major.minor.patch`.
pub fn format_version(major: i32, minor: i32, patch: i32) -> String {
    format!("{}.{}.{}", major, minor, patch)
}

impl From<&PbServerInfo> for ServerInfo {
    fn from(info: &PbServerInfo) -> Self {
        let version = info
            .version_info
            .as_ref()
            .map(|v| format_version(v.major_version, v.minor_version, v.patch_version))
            .unwrap_or_default();
        let log = info.log_level_info.clone().unwrap_or_default();
        let images = info.image_files_info.clone().unwrap_or_default();

        let mut summary = Self {
            version,
            log_levels: log.log_levels,
            current_log_level: log.current_log_level,
            reserved_ids: info
                .reserved_ids_info
                .as_ref()
                .map(|r| r.ids.iter().map(|&id| id.max(0) as u32).collect())
                .unwrap_or_default(),
            image_dir: images.default_image_folder,
            scan_depth: images.depth,
            ..Default::default()
        };

        if let Some(mapping) = &info.mapping_info {
            for (suffix, raw) in &mapping.mapping {
                let bucket = match PbDeviceType::try_from(*raw) {
                    Ok(PbDeviceType::Schd) => &mut summary.schd,
                    Ok(PbDeviceType::Scrm) => &mut summary.scrm,
                    Ok(PbDeviceType::Scmo) => &mut summary.scmo,
                    Ok(PbDeviceType::Sccd) => &mut summary.sccd,
                    _ => continue,
                };
                bucket.push(suffix.clone());
            }
        }

        summary
    }
}

/// One entry of the engine's image listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFileEntry {
    pub name: String,
    pub detected_type: String,
    pub size: u64,
    pub read_only: bool,
}

/// Summary of `DEFAULT_IMAGE_FILES_INFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFilesInfo {
    pub images_dir: String,
    pub image_files: Vec<ImageFileEntry>,
    pub scan_depth: i32,
}

impl From<&PbImageFilesInfo> for ImageFilesInfo {
    fn from(info: &PbImageFilesInfo) -> Self {
        Self {
            images_dir: info.default_image_folder.clone(),
            image_files: info
                .image_files
                .iter()
                .map(|f| ImageFileEntry {
                    name: f.name.clone(),
                    detected_type: device_type_name(f.r#type),
                    size: f.size,
                    read_only: f.read_only,
                })
                .collect(),
            scan_depth: info.depth,
        }
    }
}

// ============================================================================
// Misc
// ============================================================================

/// Engine-initiated shutdown modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Halt the host.
    System,
    /// Reboot the host.
    Reboot,
    /// Stop only the engine process.
    Process,
}

impl ShutdownMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownMode::System => "system",
            ShutdownMode::Reboot => "reboot",
            ShutdownMode::Process => "process",
        }
    }
}

impl std::str::FromStr for ShutdownMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(ShutdownMode::System),
            "reboot" => Ok(ShutdownMode::Reboot),
            "process" => Ok(ShutdownMode::Process),
            other => Err(Error::invalid_argument(format!(
                "unknown shutdown mode '{}'",
                other
            ))),
        }
    }
}

/// Whether the engine demands a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub token_required: bool,
    pub message: String,
}
