//! Drive properties sidecars.
//!
//! A properties file is a JSON record with canonical drive identity, stored
//! in the configuration directory as `<image name>.properties`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rascsi_control::AttachRequest;
use rascsi_core::{Envelope, Result, ReturnCode};

use crate::json;
use crate::manager::FileManager;

/// Drive identity and geometry hints applied on attach.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

impl Properties {
    /// Read and parse a sidecar.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_str(&json::decode_latin1(&bytes))?)
    }

    /// Copy fields the request leaves unset.
    pub fn fill_request(&self, request: &mut AttachRequest) {
        if request.vendor.is_none() {
            request.vendor = self.vendor.clone();
        }
        if request.product.is_none() {
            request.product = self.product.clone();
        }
        if request.revision.is_none() {
            request.revision = self.revision.clone();
        }
        if request.block_size.is_none() {
            request.block_size = self.block_size;
        }
    }
}

/// Payload of [`FileManager::read_drive_properties`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveProperties {
    pub conf: Properties,
    pub file_path: String,
}

impl FileManager {
    /// Write `conf` to `<cfg_dir>/<name>`.
    pub async fn write_drive_properties(&self, name: &str, conf: &Properties) -> Envelope {
        let target = match self.cfg_path(name) {
            Ok(path) => path,
            Err(e) => return Envelope::from_error(&e),
        };
        let shown_path = target.display().to_string();

        match write_json_file(&target, conf).await {
            Ok(()) => {
                info!(path = %shown_path, "Wrote drive properties");
                Envelope::success(ReturnCode::WriteDrivePropsSuccess).with_param("target_path", shown_path)
            }
            Err(e) => {
                warn!(path = %shown_path, error = %e, "Could not write drive properties");
                remove_partial(&target).await;
                Envelope::from_error(&e)
                    .with_return_code(ReturnCode::WriteDrivePropsCouldNotWrite)
                    .with_param("target_path", shown_path)
            }
        }
    }

    /// Read `<cfg_dir>/<path>`.
    pub async fn read_drive_properties(&self, path: &str) -> Envelope<DriveProperties> {
        let source = match self.cfg_path(path) {
            Ok(path) => path,
            Err(e) => return Envelope::from_error(&e),
        };
        let shown_path = source.display().to_string();

        match Properties::load(&source).await {
            Ok(conf) => Envelope::success(ReturnCode::ReadDrivePropsSuccess)
                .with_param("file_path", &shown_path)
                .with_data(DriveProperties {
                    conf,
                    file_path: shown_path,
                }),
            Err(e) => {
                warn!(path = %shown_path, error = %e, "Could not read drive properties");
                Envelope::from_error(&e)
                    .with_return_code(ReturnCode::ReadDrivePropsCouldNotRead)
                    .with_param("file_path", shown_path)
            }
        }
    }
}

/// Serialize `value` as indented ASCII JSON into `target`, creating parents.
pub(crate) async fn write_json_file<T: Serialize>(target: &Path, value: &T) -> Result<()> {
    let text = json::to_string_indented(value)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, text).await?;
    Ok(())
}

/// Best-effort removal of a half-written file.
pub(crate) async fn remove_partial(target: &Path) {
    match tokio::fs::remove_file(target).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %target.display(), error = %e, "Could not remove partial file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_request_only_sets_missing_fields() {
        let props = Properties {
            vendor: Some("QUANTUM".into()),
            product: Some("FIREBALL".into()),
            revision: Some("1.0".into()),
            block_size: Some(512),
            ..Default::default()
        };
        let mut request = AttachRequest::new().with_vendor("SEAGATE");
        props.fill_request(&mut request);
        assert_eq!(request.vendor.as_deref(), Some("SEAGATE"));
        assert_eq!(request.product.as_deref(), Some("FIREBALL"));
        assert_eq!(request.revision.as_deref(), Some("1.0"));
        assert_eq!(request.block_size, Some(512));
    }

    #[tokio::test]
    async fn write_then_load_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/disk.hds.properties");
        let props = Properties {
            vendor: Some("DEC".into()),
            product: Some("RZ55".into()),
            revision: Some("0700".into()),
            block_size: Some(512),
            size: Some(332_000_000),
            file_type: Some("hds".into()),
        };
        write_json_file(&path, &props).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"vendor\": \"DEC\""));
        assert_eq!(Properties::load(&path).await.unwrap(), props);
    }
}
