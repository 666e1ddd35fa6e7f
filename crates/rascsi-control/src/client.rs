//! Engine client: the semantic command layer over the socket transport.
//!
//! Every call opens one connection, sends one command and decodes one
//! result. A result with `status = false` becomes
//! [`Error::EngineRejected`] carrying the engine's message verbatim. The
//! token and locale configured on the client are attached to every command
//! except the authentication check.

use std::collections::BTreeMap;

use rascsi_core::constants::BUS_ID_COUNT;
use rascsi_core::{ControlSettings, Error, Result};
use tracing::{debug, info, warn};

use crate::proto::{PbCommand, PbDeviceDefinition, PbDeviceType, PbOperation, PbResult};
use crate::protocol::{CommandBuilder, decode_result, encode_command, format_command};
use crate::transport::SocketTransport;
use crate::types::{
    AttachOutcome, AttachRequest, AttachRoute, AuthStatus, DeviceInfo, DeviceTypeInfo,
    ImageFilesInfo, ServerInfo, ShutdownMode, device_type_name, format_version, route_attach,
};

/// Prefix of the engine's reply to `DEVICES_INFO` for an unoccupied slot.
const NO_DEVICE_REPLY: &str = "No device for ID ";

/// Client for the engine command socket.
#[derive(Debug, Clone)]
pub struct EngineClient {
    transport: SocketTransport,
    token: Option<String>,
    locale: String,
}

impl EngineClient {
    pub fn new(transport: SocketTransport) -> Self {
        Self {
            transport,
            token: None,
            locale: rascsi_core::settings::DEFAULT_LOCALE.to_string(),
        }
    }

    pub fn from_settings(settings: &ControlSettings) -> Self {
        Self::new(SocketTransport::new(settings.host.clone(), settings.port))
            .with_token(settings.token.clone())
            .with_locale(settings.locale.clone())
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn transport(&self) -> &SocketTransport {
        &self.transport
    }

    /// Command builder preloaded with token and locale.
    pub fn command(&self, operation: PbOperation) -> CommandBuilder {
        CommandBuilder::new(operation)
            .token(self.token.as_deref())
            .locale(&self.locale)
    }

    /// Send a command and decode the result without looking at `status`.
    pub async fn send_command(&self, cmd: &PbCommand) -> Result<PbResult> {
        debug!("{}", format_command(cmd));
        let payload = encode_command(cmd)?;
        let response = self.transport.send(&payload).await?;
        decode_result(&response)
    }

    /// Send a command and turn `status = false` into an error.
    pub async fn execute(&self, cmd: &PbCommand) -> Result<PbResult> {
        let result = self.send_command(cmd).await?;
        extract_result(result)
    }

    // ========================================================================
    // Information
    // ========================================================================

    pub async fn server_info(&self) -> Result<ServerInfo> {
        let result = self.execute(&self.command(PbOperation::ServerInfo).build()).await?;
        Ok(result
            .server_info
            .as_ref()
            .map(ServerInfo::from)
            .unwrap_or_default())
    }

    /// Engine version as `major.minor.patch`.
    pub async fn version(&self) -> Result<String> {
        let result = self.execute(&self.command(PbOperation::VersionInfo).build()).await?;
        let v = result.version_info.unwrap_or_default();
        Ok(format_version(v.major_version, v.minor_version, v.patch_version))
    }

    pub async fn reserved_ids(&self) -> Result<Vec<u32>> {
        let result = self
            .execute(&self.command(PbOperation::ReservedIdsInfo).build())
            .await?;
        Ok(result
            .reserved_ids_info
            .map(|r| r.ids.into_iter().map(|id| id.max(0) as u32).collect())
            .unwrap_or_default())
    }

    pub async fn network_interfaces(&self) -> Result<Vec<String>> {
        let result = self
            .execute(&self.command(PbOperation::NetworkInterfacesInfo).build())
            .await?;
        Ok(result
            .network_interfaces_info
            .map(|n| n.name)
            .unwrap_or_default())
    }

    /// Map of device type tag to its capabilities.
    pub async fn device_types(&self) -> Result<BTreeMap<String, DeviceTypeInfo>> {
        let result = self
            .execute(&self.command(PbOperation::DeviceTypesInfo).build())
            .await?;
        Ok(result
            .device_types_info
            .map(|info| {
                info.properties
                    .iter()
                    .map(|entry| {
                        let props = entry.properties.clone().unwrap_or_default();
                        (device_type_name(entry.r#type), DeviceTypeInfo::from(&props))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Device types whose media can be inserted and ejected.
    pub async fn removable_device_types(&self) -> Result<Vec<PbDeviceType>> {
        let result = self
            .execute(&self.command(PbOperation::DeviceTypesInfo).build())
            .await?;
        Ok(result
            .device_types_info
            .map(|info| {
                info.properties
                    .iter()
                    .filter(|entry| entry.properties.as_ref().is_some_and(|p| p.removable))
                    .filter_map(|entry| PbDeviceType::try_from(entry.r#type).ok())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn image_files_info(&self) -> Result<ImageFilesInfo> {
        let result = self
            .execute(&self.command(PbOperation::DefaultImageFilesInfo).build())
            .await?;
        Ok(result
            .image_files_info
            .as_ref()
            .map(ImageFilesInfo::from)
            .unwrap_or_default())
    }

    /// Attached devices, optionally narrowed to one id (and unit).
    ///
    /// An empty slot yields an empty list rather than an error.
    pub async fn list_devices(&self, id: Option<u32>, unit: Option<u32>) -> Result<Vec<DeviceInfo>> {
        let mut builder = self.command(PbOperation::DevicesInfo);
        if let Some(id) = id {
            builder = builder.slot(id, unit);
        }
        let result = self.send_command(&builder.build()).await?;

        if !result.status {
            if result.msg.starts_with(NO_DEVICE_REPLY) {
                debug!(id = ?id, unit = ?unit, message = %result.msg, "Slot is empty");
                return Ok(Vec::new());
            }
            return Err(Error::rejected(result.msg));
        }
        let devices = result
            .devices_info
            .map(|d| d.devices)
            .unwrap_or_default();
        if devices.is_empty() {
            return Ok(Vec::new());
        }

        let images_dir = self.image_files_info().await?.images_dir;
        Ok(devices
            .iter()
            .map(|device| DeviceInfo::from_pb(device, &images_dir))
            .collect())
    }

    /// Whether the engine requires a token; sent without one.
    pub async fn auth_check(&self) -> Result<AuthStatus> {
        let cmd = CommandBuilder::new(PbOperation::CheckAuthentication).build();
        let result = self.send_command(&cmd).await?;
        Ok(AuthStatus {
            token_required: !result.status,
            message: result.msg,
        })
    }

    // ========================================================================
    // Device lifecycle
    // ========================================================================

    /// Attach a device, or insert media into a matching removable device.
    pub async fn attach(&self, id: u32, request: &AttachRequest) -> Result<AttachOutcome> {
        check_id(id)?;

        let current = self
            .list_devices(Some(id), request.unit)
            .await?
            .first()
            .and_then(|d| crate::types::parse_device_type(&d.device_type).ok());
        let removable = self.removable_device_types().await?;

        let route = route_attach(current, request.device_type, &removable);
        let mut device = PbDeviceDefinition {
            id: id as i32,
            unit: request.unit.unwrap_or(0) as i32,
            params: request.params.clone(),
            ..Default::default()
        };
        if let Some(device_type) = request.device_type {
            device.set_type(device_type);
        }

        let operation = match route {
            AttachRoute::Mismatch { requested, current } => {
                warn!(
                    id,
                    requested = requested.as_str_name(),
                    current = current.as_str_name(),
                    "refusing to replace removable device of another type"
                );
                return Err(Error::TypeMismatch {
                    requested: requested.as_str_name().to_string(),
                    current: current.as_str_name().to_string(),
                });
            }
            AttachRoute::Insert => PbOperation::Insert,
            AttachRoute::Attach => {
                device.vendor = request.vendor.clone().unwrap_or_default();
                device.product = request.product.clone().unwrap_or_default();
                device.revision = request.revision.clone().unwrap_or_default();
                device.block_size = request.block_size.unwrap_or(0) as i32;
                PbOperation::Attach
            }
        };

        let cmd = self.command(operation).device(device).build();
        let result = self.execute(&cmd).await?;
        info!(id, operation = operation.as_str_name(), "device attached");
        Ok(AttachOutcome {
            inserted: operation == PbOperation::Insert,
            message: result.msg,
        })
    }

    async fn slot_command(&self, operation: PbOperation, id: u32, unit: Option<u32>) -> Result<String> {
        check_id(id)?;
        let cmd = self.command(operation).slot(id, unit).build();
        let result = self.execute(&cmd).await?;
        debug!(id, unit, operation = operation.as_str_name(), "slot command accepted");
        Ok(result.msg)
    }

    pub async fn detach(&self, id: u32, unit: Option<u32>) -> Result<String> {
        self.slot_command(PbOperation::Detach, id, unit).await
    }

    pub async fn detach_all(&self) -> Result<String> {
        let result = self.execute(&self.command(PbOperation::DetachAll).build()).await?;
        Ok(result.msg)
    }

    pub async fn eject(&self, id: u32, unit: Option<u32>) -> Result<String> {
        self.slot_command(PbOperation::Eject, id, unit).await
    }

    pub async fn protect(&self, id: u32, unit: Option<u32>) -> Result<String> {
        self.slot_command(PbOperation::Protect, id, unit).await
    }

    pub async fn unprotect(&self, id: u32, unit: Option<u32>) -> Result<String> {
        self.slot_command(PbOperation::Unprotect, id, unit).await
    }

    pub async fn start(&self, id: u32, unit: Option<u32>) -> Result<String> {
        self.slot_command(PbOperation::Start, id, unit).await
    }

    pub async fn stop(&self, id: u32, unit: Option<u32>) -> Result<String> {
        self.slot_command(PbOperation::Stop, id, unit).await
    }

    /// Replace the engine's reservation set.
    pub async fn reserve_ids(&self, ids: &[u32]) -> Result<String> {
        for &id in ids {
            check_id(id)?;
        }
        let joined = ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let cmd = self.command(PbOperation::ReserveIds).param("ids", joined).build();
        Ok(self.execute(&cmd).await?.msg)
    }

    // ========================================================================
    // Engine administration
    // ========================================================================

    pub async fn set_log_level(&self, level: &str) -> Result<String> {
        if level.is_empty() {
            return Err(Error::invalid_argument("log level must not be empty"));
        }
        let cmd = self.command(PbOperation::LogLevel).param("level", level).build();
        Ok(self.execute(&cmd).await?.msg)
    }

    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<String> {
        let cmd = self
            .command(PbOperation::ShutDown)
            .param("mode", mode.as_str())
            .build();
        Ok(self.execute(&cmd).await?.msg)
    }

    pub async fn set_default_folder(&self, folder: &str) -> Result<String> {
        let cmd = self
            .command(PbOperation::DefaultFolder)
            .param("folder", folder)
            .build();
        Ok(self.execute(&cmd).await?.msg)
    }

    // ========================================================================
    // Engine-side image operations
    // ========================================================================

    pub async fn create_image(&self, file: &str, size: u64, read_only: bool) -> Result<String> {
        let cmd = self
            .command(PbOperation::CreateImage)
            .param("file", file)
            .param("size", size.to_string())
            .param("read_only", read_only.to_string())
            .build();
        Ok(self.execute(&cmd).await?.msg)
    }

    pub async fn delete_image(&self, file: &str) -> Result<String> {
        let cmd = self.command(PbOperation::DeleteImage).param("file", file).build();
        Ok(self.execute(&cmd).await?.msg)
    }

    pub async fn rename_image(&self, from: &str, to: &str) -> Result<String> {
        let cmd = self
            .command(PbOperation::RenameImage)
            .param("from", from)
            .param("to", to)
            .build();
        Ok(self.execute(&cmd).await?.msg)
    }

    pub async fn copy_image(&self, from: &str, to: &str, read_only: bool) -> Result<String> {
        let cmd = self
            .command(PbOperation::CopyImage)
            .param("from", from)
            .param("to", to)
            .param("read_only", read_only.to_string())
            .build();
        Ok(self.execute(&cmd).await?.msg)
    }

    pub async fn protect_image(&self, file: &str) -> Result<String> {
        let cmd = self.command(PbOperation::ProtectImage).param("file", file).build();
        Ok(self.execute(&cmd).await?.msg)
    }

    pub async fn unprotect_image(&self, file: &str) -> Result<String> {
        let cmd = self
            .command(PbOperation::UnprotectImage)
            .param("file", file)
            .build();
        Ok(self.execute(&cmd).await?.msg)
    }
}

/// Map `status = false` onto [`Error::EngineRejected`].
pub fn extract_result(result: PbResult) -> Result<PbResult> {
    if result.status {
        Ok(result)
    } else {
        Err(Error::rejected(result.msg))
    }
}

fn check_id(id: u32) -> Result<()> {
    if id as usize >= BUS_ID_COUNT {
        return Err(Error::invalid_argument(format!(
            "bus id {} out of range 0..{}",
            id,
            BUS_ID_COUNT - 1
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rascsi_core::ErrorKind;

    #[test]
    fn extract_result_passes_status_true() {
        let result = PbResult {
            status: true,
            msg: "ok".into(),
            ..Default::default()
        };
        assert_eq!(extract_result(result).unwrap().msg, "ok");
    }

    #[test]
    fn extract_result_rejects_with_engine_message() {
        let result = PbResult {
            status: false,
            msg: "Duplicate ID 1".into(),
            ..Default::default()
        };
        let err = extract_result(result).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineRejected);
        assert_eq!(err.to_string(), "Duplicate ID 1");
    }

    #[test]
    fn commands_carry_token_and_locale() {
        let client = EngineClient::new(SocketTransport::new("localhost", 6868))
            .with_token(Some("secret".into()))
            .with_locale("fr");
        let cmd = client.command(PbOperation::DetachAll).build();
        assert_eq!(cmd.params["token"], "secret");
        assert_eq!(cmd.params["locale"], "fr");
    }

    #[tokio::test]
    async fn invalid_ids_fail_before_any_io() {
        // Nothing listens on port 1; an attempted connect would surface as
        // TransportUnavailable instead.
        let client = EngineClient::new(SocketTransport::new("127.0.0.1", 1).with_retries(0));
        let err = client.detach(8, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = client.reserve_ids(&[1, 9]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = client.attach(12, &AttachRequest::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn settings_flow_into_client() {
        let settings = ControlSettings::default()
            .with_host("10.0.0.5")
            .with_port(7000)
            .with_token(Some("t".into()));
        let client = EngineClient::from_settings(&settings);
        assert_eq!(client.transport().endpoint(), "10.0.0.5:7000");
        assert_eq!(client.command(PbOperation::ServerInfo).build().params["token"], "t");
    }
}
