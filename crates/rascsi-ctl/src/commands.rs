//! Subcommand execution.
//!
//! Every subcommand produces an [`Envelope`]. Engine client calls return
//! plain results and are wrapped here; file-manager operations already
//! report envelopes with their return codes and parameters.

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use rascsi_control::DeviceInfo;
use rascsi_core::{Envelope, Result};
use rascsi_files::{FileManager, RunningEnv, host};

use crate::cli::{
    Command, ConfigAction, EngineImageAction, ImageAction, PowerAction, PropertiesAction,
};

const SYSCTL_CONF: &str = "/etc/sysctl.conf";

/// Rendered result of one subcommand.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub envelope: Envelope<Value>,
    /// Human-readable rendering printed after the JSON, if any.
    pub table: Option<String>,
}

impl Output {
    pub fn from_envelope<T: Serialize>(mut envelope: Envelope<T>) -> Result<Self> {
        let data = envelope.data.take().map(serde_json::to_value).transpose()?;
        let mut envelope = envelope.map(|_| Value::Null);
        envelope.data = data;
        Ok(Self {
            envelope,
            table: None,
        })
    }

    fn with_table(mut self, table: String) -> Self {
        self.table = Some(table);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.envelope.ok
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.envelope)?)
    }
}

/// Host summary for the `host` subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReport {
    pub ip: Option<String>,
    pub hostname: String,
    pub environment: RunningEnv,
    pub summary: String,
    pub netatalk_running: bool,
    pub macproxy_running: bool,
    pub ip_forwarding: bool,
}

pub async fn execute(manager: &FileManager, command: &Command) -> Result<Output> {
    let client = manager.client();
    debug!(command = ?command, "Executing");

    match command {
        Command::Info => Output::from_envelope(Envelope::from(client.server_info().await)),
        Command::Version => Output::from_envelope(Envelope::from(client.version().await)),
        Command::List(args) => {
            let devices = client.list_devices(args.id, args.unit).await;
            let table = devices.as_ref().ok().map(|d| device_table(d));
            let output = Output::from_envelope(Envelope::from(devices))?;
            Ok(match table {
                Some(table) => output.with_table(table),
                None => output,
            })
        }
        Command::Attach(args) => {
            let envelope = match args.request() {
                Ok(request) => manager.attach_image(args.id, request).await,
                Err(e) => Envelope::from_error(&e),
            };
            Output::from_envelope(envelope)
        }
        Command::Detach(slot) => Output::from_envelope(Envelope::from(client.detach(slot.id, slot.unit).await)),
        Command::Eject(slot) => Output::from_envelope(Envelope::from(client.eject(slot.id, slot.unit).await)),
        Command::Protect(slot) => Output::from_envelope(Envelope::from(client.protect(slot.id, slot.unit).await)),
        Command::Unprotect(slot) => {
            Output::from_envelope(Envelope::from(client.unprotect(slot.id, slot.unit).await))
        }
        Command::Start(slot) => Output::from_envelope(Envelope::from(client.start(slot.id, slot.unit).await)),
        Command::Stop(slot) => Output::from_envelope(Envelope::from(client.stop(slot.id, slot.unit).await)),
        Command::DetachAll => Output::from_envelope(Envelope::from(client.detach_all().await)),
        Command::Reserve(args) => Output::from_envelope(manager.reserve_id(args.id, &args.memo).await),
        Command::Release(args) => Output::from_envelope(manager.release_id(args.id).await),
        Command::Reserved => Output::from_envelope(Envelope::from(client.reserved_ids().await)),
        Command::LogLevel(args) => Output::from_envelope(Envelope::from(client.set_log_level(&args.level).await)),
        Command::Shutdown(args) => Output::from_envelope(Envelope::from(client.shutdown(args.mode).await)),
        Command::AuthCheck => Output::from_envelope(Envelope::from(client.auth_check().await)),
        Command::DeviceTypes => Output::from_envelope(Envelope::from(client.device_types().await)),
        Command::Interfaces => Output::from_envelope(Envelope::from(client.network_interfaces().await)),
        Command::DefaultFolder(args) => {
            Output::from_envelope(Envelope::from(client.set_default_folder(&args.folder).await))
        }
        Command::EngineImage(cmd) => {
            let result = match &cmd.action {
                EngineImageAction::Create { file, size, read_only } => {
                    client.create_image(file, *size, *read_only).await
                }
                EngineImageAction::Delete { file } => client.delete_image(file).await,
                EngineImageAction::Rename { from, to } => client.rename_image(from, to).await,
                EngineImageAction::Copy { from, to, read_only } => client.copy_image(from, to, *read_only).await,
                EngineImageAction::Protect { file } => client.protect_image(file).await,
                EngineImageAction::Unprotect { file } => client.unprotect_image(file).await,
            };
            Output::from_envelope(Envelope::from(result))
        }

        Command::Images => Output::from_envelope(manager.list_images().await),
        Command::Config(cmd) => match &cmd.action {
            ConfigAction::Save { name } => Output::from_envelope(manager.write_config(name).await),
            ConfigAction::Load { name } => Output::from_envelope(manager.read_config(name).await),
            ConfigAction::List => Output::from_envelope(manager.list_config_files().await),
        },
        Command::Image(cmd) => match &cmd.action {
            ImageAction::Create { path, size, overwrite } => {
                Output::from_envelope(manager.create_empty_image(path, *size, *overwrite).await)
            }
            ImageAction::Rename { src, dst, overwrite } => {
                Output::from_envelope(manager.rename_file(src, dst, *overwrite).await)
            }
            ImageAction::Copy { src, dst, overwrite } => {
                Output::from_envelope(manager.copy_file(src, dst, *overwrite).await)
            }
            ImageAction::Delete { path } => Output::from_envelope(manager.delete_file(path).await),
            ImageAction::Extract {
                archive,
                members,
                move_properties,
            } => Output::from_envelope(manager.extract_image(archive, members, *move_properties).await),
            ImageAction::Inspect { archive } => Output::from_envelope(manager.inspect_archive(archive).await),
            ImageAction::Subdirs { dir } => Output::from_envelope(manager.list_subdirs(dir).await),
        },
        Command::Properties(cmd) => match &cmd.action {
            PropertiesAction::Read { path } => Output::from_envelope(manager.read_drive_properties(path).await),
            PropertiesAction::Write(args) => {
                Output::from_envelope(manager.write_drive_properties(&args.name, &args.properties()).await)
            }
        },
        Command::Partition(args) => {
            Output::from_envelope(manager.partition_disk(&args.file, &args.volume, args.format).await)
        }
        Command::FormatHfs(args) => {
            Output::from_envelope(manager.format_hfs(&args.file, &args.volume, &args.driver).await)
        }
        Command::FormatFat(args) => {
            Output::from_envelope(manager.format_fat(&args.file, &args.volume, args.fat_size).await)
        }
        Command::Download(args) => Output::from_envelope(manager.download_to_dir(&args.url, &args.dir).await),
        Command::DownloadIso(args) => {
            Output::from_envelope(manager.download_file_to_iso(&args.url, &args.iso_args).await)
        }

        Command::Host => Output::from_envelope(Envelope::from(host_report().await)),
        Command::DiskSpace(args) => {
            let result = async {
                let path = match &args.path {
                    Some(path) => path.clone(),
                    None => manager.images_dir().await?,
                };
                host::disk_space(&path)
            };
            Output::from_envelope(Envelope::from(result.await))
        }
        Command::Logs(args) => {
            Output::from_envelope(Envelope::from(host::get_logs(args.lines, args.unit.as_deref()).await))
        }
        Command::Diskinfo(args) => Output::from_envelope(Envelope::from(host::get_diskinfo(&args.path).await)),
        Command::Manpage(args) => Output::from_envelope(Envelope::from(host::get_manpage(&args.path).await)),
        Command::Power(args) => {
            let result = match args.action {
                PowerAction::Reboot => host::reboot().await,
                PowerAction::Shutdown => host::shutdown().await,
            };
            Output::from_envelope(Envelope::from(result))
        }
    }
}

async fn host_report() -> Result<HostReport> {
    let (ip, hostname) = host::ip_and_host().await;
    let environment = host::running_env().await?;
    Ok(HostReport {
        ip: ip.map(|ip| ip.to_string()),
        hostname,
        summary: environment.summary(),
        environment,
        netatalk_running: host::running_proc("afpd").await? > 0,
        macproxy_running: host::running_proc("macproxy").await? > 0,
        ip_forwarding: host::introspect_file(Path::new(SYSCTL_CONF), r"net\.ipv4\.ip_forward=1$").await?,
    })
}

/// Fixed-width device listing.
pub fn device_table(devices: &[DeviceInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<3} {:<3} {:<5} {:<28} {:<32} {}",
        "ID", "LUN", "TYPE", "STATUS", "FILE", "PRODUCT"
    );
    if devices.is_empty() {
        out.push_str("No devices attached\n");
        return out;
    }
    for device in devices {
        let product = [&device.vendor, &device.product, &device.revision]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(
            out,
            "{:<3} {:<3} {:<5} {:<28} {:<32} {}",
            device.id, device.unit, device.device_type, device.status, device.file, product
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rascsi_core::{Error, ErrorKind, ReturnCode};

    #[test]
    fn envelope_payload_becomes_json() {
        let envelope = Envelope::success(ReturnCode::WriteFileSuccess)
            .with_param("target_path", "disk.hds")
            .with_data(vec![1u32, 2]);
        let output = Output::from_envelope(envelope).unwrap();
        assert!(output.is_ok());
        assert_eq!(output.envelope.data, Some(serde_json::json!([1, 2])));

        let json: Value = serde_json::from_str(&output.to_json().unwrap()).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["parameters"]["target_path"], "disk.hds");
    }

    #[test]
    fn failures_keep_code_and_message() {
        let envelope: Envelope<String> = Envelope::from(Err(Error::rejected("No device for ID 6, unit 0")));
        let output = Output::from_envelope(envelope).unwrap();
        assert!(!output.is_ok());
        assert_eq!(output.envelope.code, Some(ErrorKind::EngineRejected));
        assert_eq!(output.envelope.data, None);
        assert_eq!(output.envelope.message.as_deref(), Some("No device for ID 6, unit 0"));
    }

    #[test]
    fn table_lists_devices() {
        let devices = vec![
            DeviceInfo {
                id: 1,
                unit: 0,
                device_type: "SCHD".into(),
                file: "boot.hds".into(),
                vendor: "QUANTUM".into(),
                product: "FIREBALL".into(),
                revision: "1.0".into(),
                ..Default::default()
            },
            DeviceInfo {
                id: 3,
                unit: 0,
                device_type: "SCCD".into(),
                status: "Removable".into(),
                ..Default::default()
            },
        ];
        let table = device_table(&devices);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID  LUN TYPE"));
        assert!(lines[1].starts_with("1   0   SCHD"));
        assert!(lines[1].contains("boot.hds"));
        assert!(lines[1].ends_with("QUANTUM FIREBALL 1.0"));
        assert!(lines[2].contains("Removable"));
    }

    #[test]
    fn empty_table_says_so() {
        let table = device_table(&[]);
        assert!(table.ends_with("No devices attached\n"));
    }
}
