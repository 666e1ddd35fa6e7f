//! Operator CLI argument parsing.
//!
//! Command groups:
//! - engine: `info`, `list`, `attach`, `detach`, `reserve`, `shutdown`, ...
//! - engine-side images: `engine-image create|delete|rename|copy|protect|unprotect`
//! - file manager: `images`, `config`, `image`, `properties`, `partition`,
//!   `format-hfs`, `format-fat`, `download`, `download-iso`
//! - host: `host`, `disk-space`, `logs`, `diskinfo`, `manpage`, `power`

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use rascsi_control::{AttachRequest, ShutdownMode, parse_device_type};
use rascsi_core::constants::{BUS_ID_COUNT, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT};
use rascsi_core::settings::DEFAULT_LOCALE;
use rascsi_core::{ControlSettings, Result};
use rascsi_files::{DiskFormat, FatSize, Properties};

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

/// rascsi-ctl - control a RaSCSI engine and its image store.
#[derive(Debug, Parser)]
#[command(
    name = "rascsi-ctl",
    version,
    about = "rascsi-ctl - control a RaSCSI engine and manage its images"
)]
pub struct Cli {
    /// Engine host
    #[arg(long, default_value = DEFAULT_ENGINE_HOST, env = "RASCSI_HOST")]
    pub host: String,

    /// Engine port
    #[arg(short = 'p', long, default_value_t = DEFAULT_ENGINE_PORT, env = "RASCSI_PORT")]
    pub port: u16,

    /// Authentication token
    #[arg(long, env = "RASCSI_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Locale for engine messages
    #[arg(long, default_value = DEFAULT_LOCALE)]
    pub locale: String,

    /// Configuration directory (snapshots and properties files)
    #[arg(long = "cfg-dir", value_name = "DIR", env = "RASCSI_CFG_DIR")]
    pub cfg_dir: Option<PathBuf>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Connection and directory settings from the global options.
    pub fn settings(&self) -> ControlSettings {
        let settings = ControlSettings::default()
            .with_host(self.host.clone())
            .with_port(self.port)
            .with_token(self.token.clone())
            .with_locale(self.locale.clone());
        match &self.cfg_dir {
            Some(dir) => settings.with_cfg_dir(dir.clone()),
            None => settings,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Engine version, log levels, image folder and reserved IDs
    Info,
    /// Engine version string
    Version,
    /// Attached devices
    List(ListArgs),
    /// Attach a device, or insert media into a removable one
    Attach(AttachArgs),
    /// Detach a device
    Detach(SlotArgs),
    /// Eject removable media
    Eject(SlotArgs),
    /// Write-protect a device
    Protect(SlotArgs),
    /// Remove write protection from a device
    Unprotect(SlotArgs),
    /// Start a device
    Start(SlotArgs),
    /// Stop a device
    Stop(SlotArgs),
    /// Detach every device
    DetachAll,
    /// Reserve a SCSI ID with a memo
    Reserve(ReserveArgs),
    /// Release a reserved SCSI ID
    Release(IdArgs),
    /// Currently reserved IDs
    Reserved,
    /// Set the engine log level
    LogLevel(LogLevelArgs),
    /// Shut down the engine or the host
    Shutdown(ShutdownArgs),
    /// Whether the engine requires a token
    AuthCheck,
    /// Device types and their capabilities
    DeviceTypes,
    /// Network interfaces usable by network devices
    Interfaces,
    /// Change the engine's default image folder
    DefaultFolder(FolderArgs),
    /// Image operations performed by the engine itself
    EngineImage(EngineImageCommand),

    /// Images in the image folder, with properties and archive contents
    Images,
    /// Configuration snapshots
    Config(ConfigCommand),
    /// Image files in the image folder
    Image(ImageCommand),
    /// Drive properties files
    Properties(PropertiesCommand),
    /// Partition an image
    Partition(PartitionArgs),
    /// Format the first partition as HFS
    FormatHfs(FormatHfsArgs),
    /// Format the first partition as FAT
    FormatFat(FormatFatArgs),
    /// Download a file into the image folder
    Download(DownloadArgs),
    /// Download a file and wrap it in a new ISO image
    DownloadIso(DownloadIsoArgs),

    /// Host address, name and environment
    Host,
    /// Free space on the filesystem holding the image folder
    DiskSpace(DiskSpaceArgs),
    /// System journal
    Logs(LogsArgs),
    /// Partition and filesystem summary of an image
    Diskinfo(PathArgs),
    /// HTML rendering of a man page
    Manpage(PathArgs),
    /// Reboot or halt the host
    Power(PowerArgs),
}

/// Optional device filter.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only this SCSI ID
    #[arg(long, value_parser = parse_bus_id)]
    pub id: Option<u32>,

    /// Only this unit (LUN)
    #[arg(long, requires = "id")]
    pub unit: Option<u32>,
}

/// Device slot.
#[derive(Debug, Args)]
pub struct SlotArgs {
    /// SCSI ID
    #[arg(value_parser = parse_bus_id)]
    pub id: u32,

    /// Unit (LUN)
    #[arg(short = 'u', long)]
    pub unit: Option<u32>,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    /// SCSI ID
    #[arg(value_parser = parse_bus_id)]
    pub id: u32,
}

#[derive(Debug, Args)]
pub struct AttachArgs {
    /// SCSI ID
    #[arg(value_parser = parse_bus_id)]
    pub id: u32,

    /// Unit (LUN)
    #[arg(short = 'u', long)]
    pub unit: Option<u32>,

    /// Device type (SCHD, SCRM, SCCD, SCBR, ...)
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub device_type: Option<String>,

    /// Image file, relative to the image folder or absolute
    #[arg(short = 'f', long)]
    pub file: Option<String>,

    /// Extra device parameters
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    #[arg(long)]
    pub vendor: Option<String>,

    #[arg(long)]
    pub product: Option<String>,

    #[arg(long)]
    pub revision: Option<String>,

    /// Sector size in bytes
    #[arg(long = "block-size")]
    pub block_size: Option<u32>,
}

impl AttachArgs {
    pub fn request(&self) -> Result<AttachRequest> {
        let mut request = AttachRequest::new();
        request.unit = self.unit;
        if let Some(tag) = &self.device_type {
            request = request.with_type(parse_device_type(tag)?);
        }
        for (key, value) in &self.params {
            request = request.with_param(key.clone(), value.clone());
        }
        if let Some(file) = &self.file {
            request = request.with_file(file.clone());
        }
        request.vendor = self.vendor.clone();
        request.product = self.product.clone();
        request.revision = self.revision.clone();
        request.block_size = self.block_size;
        Ok(request)
    }
}

#[derive(Debug, Args)]
pub struct ReserveArgs {
    /// SCSI ID
    #[arg(value_parser = parse_bus_id)]
    pub id: u32,

    /// Why the ID is reserved
    #[arg(short = 'm', long, default_value = "")]
    pub memo: String,
}

#[derive(Debug, Args)]
pub struct LogLevelArgs {
    /// trace, debug, info, warn, err, critical or off
    pub level: String,
}

#[derive(Debug, Args)]
pub struct ShutdownArgs {
    /// system, reboot or process
    #[arg(value_parser = parse_shutdown_mode)]
    pub mode: ShutdownMode,
}

#[derive(Debug, Args)]
pub struct FolderArgs {
    pub folder: String,
}

// =============================================================================
// Engine-side image operations
// =============================================================================

#[derive(Debug, Args)]
pub struct EngineImageCommand {
    #[command(subcommand)]
    pub action: EngineImageAction,
}

#[derive(Debug, Subcommand)]
pub enum EngineImageAction {
    /// Create an image file of the given size
    Create {
        file: String,
        size: u64,
        #[arg(long = "read-only")]
        read_only: bool,
    },
    /// Delete an image file
    Delete { file: String },
    /// Rename an image file
    Rename { from: String, to: String },
    /// Copy an image file
    Copy {
        from: String,
        to: String,
        #[arg(long = "read-only")]
        read_only: bool,
    },
    /// Make an image file read-only
    Protect { file: String },
    /// Make an image file writable
    Unprotect { file: String },
}

// =============================================================================
// File manager
// =============================================================================

#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Save attached devices and reservations
    Save { name: String },
    /// Replace attached devices and reservations with a snapshot
    Load { name: String },
    /// Saved snapshots
    List,
}

#[derive(Debug, Args)]
pub struct ImageCommand {
    #[command(subcommand)]
    pub action: ImageAction,
}

#[derive(Debug, Subcommand)]
pub enum ImageAction {
    /// Create an empty image file
    Create {
        path: String,
        size: u64,
        #[arg(long)]
        overwrite: bool,
    },
    /// Rename an image file and its properties file
    Rename {
        src: String,
        dst: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Copy an image file and its properties file
    Copy {
        src: String,
        dst: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Delete an image file and its properties file
    Delete { path: String },
    /// Extract members of an archive into the image folder
    Extract {
        archive: String,
        #[arg(required = true)]
        members: Vec<String>,
        /// Move extracted properties files to the configuration directory
        #[arg(long = "move-properties")]
        move_properties: bool,
    },
    /// List the members of an archive
    Inspect { archive: String },
    /// Subdirectories of a folder in the image folder
    Subdirs {
        #[arg(default_value = "")]
        dir: String,
    },
}

#[derive(Debug, Args)]
pub struct PropertiesCommand {
    #[command(subcommand)]
    pub action: PropertiesAction,
}

#[derive(Debug, Subcommand)]
pub enum PropertiesAction {
    /// Read a properties file
    Read { path: String },
    /// Write a properties file into the configuration directory
    Write(PropertiesWriteArgs),
}

#[derive(Debug, Args)]
pub struct PropertiesWriteArgs {
    /// File name, usually `<image>.properties`
    pub name: String,

    #[arg(long)]
    pub vendor: Option<String>,

    #[arg(long)]
    pub product: Option<String>,

    #[arg(long)]
    pub revision: Option<String>,

    #[arg(long = "block-size")]
    pub block_size: Option<u32>,

    #[arg(long)]
    pub size: Option<u64>,

    #[arg(long = "file-type")]
    pub file_type: Option<String>,
}

impl PropertiesWriteArgs {
    pub fn properties(&self) -> Properties {
        Properties {
            vendor: self.vendor.clone(),
            product: self.product.clone(),
            revision: self.revision.clone(),
            block_size: self.block_size,
            size: self.size,
            file_type: self.file_type.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct PartitionArgs {
    pub file: String,
    pub volume: String,
    /// hfs or fat
    #[arg(long, default_value = "hfs", value_parser = parse_disk_format)]
    pub format: DiskFormat,
}

#[derive(Debug, Args)]
pub struct FormatHfsArgs {
    pub file: String,
    pub volume: String,
    /// Driver image written ahead of the partition
    #[arg(long, value_name = "PATH")]
    pub driver: PathBuf,
}

#[derive(Debug, Args)]
pub struct FormatFatArgs {
    pub file: String,
    pub volume: String,
    /// 12, 16 or 32
    #[arg(long = "fat-size", default_value = "16", value_parser = parse_fat_size)]
    pub fat_size: FatSize,
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    pub url: String,
    /// Destination folder relative to the image folder
    #[arg(long, default_value = "")]
    pub dir: String,
}

#[derive(Debug, Args)]
pub struct DownloadIsoArgs {
    pub url: String,
    /// Extra `genisoimage` arguments
    #[arg(last = true)]
    pub iso_args: Vec<String>,
}

// =============================================================================
// Host
// =============================================================================

#[derive(Debug, Args)]
pub struct DiskSpaceArgs {
    /// Filesystem to measure (default: the image folder)
    pub path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct LogsArgs {
    /// Last N lines
    #[arg(short = 'n', long)]
    pub lines: Option<u32>,

    /// systemd unit
    #[arg(long)]
    pub unit: Option<String>,
}

#[derive(Debug, Args)]
pub struct PathArgs {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PowerAction {
    Reboot,
    Shutdown,
}

#[derive(Debug, Args)]
pub struct PowerArgs {
    pub action: PowerAction,
}

// =============================================================================
// Value parsers
// =============================================================================

pub fn parse_bus_id(s: &str) -> std::result::Result<u32, String> {
    let id: u32 = s.parse().map_err(|e| format!("invalid SCSI ID: {}", e))?;
    if id as usize >= BUS_ID_COUNT {
        return Err(format!("SCSI ID must be 0-{}", BUS_ID_COUNT - 1));
    }
    Ok(id)
}

pub fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| "parameter must be in KEY=VALUE form".to_string())?;
    if key.is_empty() {
        return Err("parameter key must not be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_shutdown_mode(s: &str) -> std::result::Result<ShutdownMode, String> {
    s.parse().map_err(|e: rascsi_core::Error| e.to_string())
}

fn parse_disk_format(s: &str) -> std::result::Result<DiskFormat, String> {
    s.parse().map_err(|e: rascsi_core::Error| e.to_string())
}

fn parse_fat_size(s: &str) -> std::result::Result<FatSize, String> {
    let bits: u8 = s.parse().map_err(|e| format!("invalid FAT size: {}", e))?;
    FatSize::try_from(bits).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rascsi_control::proto::PbDeviceType;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_defaults() {
        let cli = Cli::try_parse_from(["rascsi-ctl", "info"]).unwrap();
        let settings = cli.settings();
        assert_eq!(settings.endpoint(), "localhost:6868");
        assert_eq!(settings.locale, "en");
        assert!(matches!(cli.command, Command::Info));
    }

    #[test]
    fn global_overrides() {
        let cli = Cli::try_parse_from([
            "rascsi-ctl",
            "--host",
            "pi.local",
            "-p",
            "7000",
            "--token",
            "secret",
            "--cfg-dir",
            "/tmp/cfg",
            "-vv",
            "version",
        ])
        .unwrap();
        let settings = cli.settings();
        assert_eq!(settings.endpoint(), "pi.local:7000");
        assert_eq!(settings.token.as_deref(), Some("secret"));
        assert_eq!(settings.cfg_dir, PathBuf::from("/tmp/cfg"));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn attach_builds_request() {
        let cli = Cli::try_parse_from([
            "rascsi-ctl",
            "attach",
            "3",
            "-t",
            "schd",
            "-f",
            "disk.hds",
            "--param",
            "interface=eth0",
            "--vendor",
            "QUANTUM",
            "--block-size",
            "512",
        ])
        .unwrap();
        let Command::Attach(args) = cli.command else {
            panic!("expected attach");
        };
        let request = args.request().unwrap();
        assert_eq!(args.id, 3);
        assert_eq!(request.device_type, Some(PbDeviceType::Schd));
        assert_eq!(request.file(), Some("disk.hds"));
        assert_eq!(request.params.get("interface").map(String::as_str), Some("eth0"));
        assert_eq!(request.vendor.as_deref(), Some("QUANTUM"));
        assert_eq!(request.block_size, Some(512));
    }

    #[test]
    fn unknown_device_type_is_rejected_at_request_time() {
        let cli = Cli::try_parse_from(["rascsi-ctl", "attach", "1", "-t", "floppy"]).unwrap();
        let Command::Attach(args) = cli.command else {
            panic!("expected attach");
        };
        assert!(args.request().is_err());
    }

    #[test]
    fn bus_ids_are_bounded() {
        assert!(Cli::try_parse_from(["rascsi-ctl", "detach", "7"]).is_ok());
        assert!(Cli::try_parse_from(["rascsi-ctl", "detach", "8"]).is_err());
        assert!(Cli::try_parse_from(["rascsi-ctl", "list", "--unit", "1"]).is_err());
    }

    #[test]
    fn key_value_parsing() {
        assert_eq!(parse_key_value("a=b=c").unwrap(), ("a".into(), "b=c".into()));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn nested_subcommands() {
        let cli = Cli::try_parse_from(["rascsi-ctl", "config", "save", "default"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config(ConfigCommand { action: ConfigAction::Save { ref name } }) if name == "default"
        ));

        let cli = Cli::try_parse_from(["rascsi-ctl", "image", "extract", "a.zip", "x.hds", "--move-properties"])
            .unwrap();
        let Command::Image(ImageCommand {
            action: ImageAction::Extract { members, move_properties, .. },
        }) = cli.command
        else {
            panic!("expected image extract");
        };
        assert_eq!(members, vec!["x.hds".to_string()]);
        assert!(move_properties);

        assert!(Cli::try_parse_from(["rascsi-ctl", "image", "extract", "a.zip"]).is_err());
    }

    #[test]
    fn typed_values() {
        let cli = Cli::try_parse_from(["rascsi-ctl", "shutdown", "reboot"]).unwrap();
        assert!(matches!(cli.command, Command::Shutdown(ShutdownArgs { mode: ShutdownMode::Reboot })));
        assert!(Cli::try_parse_from(["rascsi-ctl", "shutdown", "later"]).is_err());

        let cli = Cli::try_parse_from(["rascsi-ctl", "format-fat", "d.hda", "VOL", "--fat-size", "32"]).unwrap();
        assert!(matches!(cli.command, Command::FormatFat(FormatFatArgs { fat_size: FatSize::Fat32, .. })));
        assert!(Cli::try_parse_from(["rascsi-ctl", "format-fat", "d.hda", "VOL", "--fat-size", "8"]).is_err());

        let cli = Cli::try_parse_from(["rascsi-ctl", "partition", "d.hda", "VOL", "--format", "fat"]).unwrap();
        assert!(matches!(cli.command, Command::Partition(PartitionArgs { format: DiskFormat::Fat, .. })));
    }

    #[test]
    fn download_iso_passes_trailing_args() {
        let cli = Cli::try_parse_from([
            "rascsi-ctl",
            "download-iso",
            "http://example.com/app.sit",
            "--",
            "-hfs",
            "-V",
            "APP",
        ])
        .unwrap();
        let Command::DownloadIso(args) = cli.command else {
            panic!("expected download-iso");
        };
        assert_eq!(args.iso_args, vec!["-hfs", "-V", "APP"]);
    }
}
