//! Host system adapters.
//!
//! Thin wrappers over the operating system and a handful of utilities.
//! Tool-backed adapters report the exit code with stdout on success and
//! stderr otherwise.

use std::net::IpAddr;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use rascsi_core::constants::UTILITY_TIMEOUT;
use rascsi_core::{Error, Result};

use crate::json::decode_latin1;
use crate::process;

const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";
const DMI_SYS_VENDOR: &str = "/sys/devices/virtual/dmi/id/sys_vendor";
const DMI_PRODUCT_NAME: &str = "/sys/devices/virtual/dmi/id/product_name";
const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Non-routable address used to learn the outbound interface.
const PROBE_ADDR: &str = "10.255.255.255:1";

/// Exit code and the relevant output stream of a utility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub rc: i32,
    pub text: String,
}

impl From<process::CommandOutput> for ToolOutput {
    fn from(output: process::CommandOutput) -> Self {
        Self {
            rc: output.code,
            text: output.text().to_string(),
        }
    }
}

/// Filesystem capacity in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpace {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Hardware and kernel description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningEnv {
    pub hardware: String,
    pub system: String,
    pub release: String,
    pub machine: String,
}

impl RunningEnv {
    /// `"<hardware>, <system> <release> <machine>"`
    pub fn summary(&self) -> String {
        format!(
            "{}, {} {} {}",
            self.hardware, self.system, self.release, self.machine
        )
    }
}

/// Outbound IP address (if any route exists) and host name.
pub async fn ip_and_host() -> (Option<IpAddr>, String) {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let ip = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(PROBE_ADDR).await?;
        Ok::<_, std::io::Error>(socket.local_addr()?.ip())
    }
    .await
    .map_err(|e| debug!(error = %e, "No outbound address"))
    .ok()
    .filter(|ip| !ip.is_unspecified());

    (ip, host)
}

/// Number of `pattern` matches across the process table.
pub async fn running_proc(pattern: &str) -> Result<usize> {
    let re = Regex::new(pattern).map_err(|e| Error::invalid_argument(e.to_string()))?;
    let table = match process::run_checked("ps", &process::args(["aux"]), None, UTILITY_TIMEOUT).await {
        Ok(out) => out.stdout,
        Err(e) => {
            warn!(error = %e, "Could not list processes");
            String::new()
        }
    };
    Ok(re.find_iter(table.trim()).count())
}

/// Capacity of the filesystem holding `path`.
pub fn disk_space(path: &Path) -> Result<DiskSpace> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    let fragment = stat.fragment_size() as u64;
    let blocks = stat.blocks() as u64;
    Ok(DiskSpace {
        total: blocks * fragment,
        used: blocks.saturating_sub(stat.blocks_free() as u64) * fragment,
        free: stat.blocks_available() as u64 * fragment,
    })
}

/// Whether any line of `path` starts with a match of `pattern`.
///
/// The file is read as ISO-8859-1; unreadable files never match.
pub async fn introspect_file(path: &Path, pattern: &str) -> Result<bool> {
    let re = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| Error::invalid_argument(e.to_string()))?;
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read file");
            return Ok(false);
        }
    };
    Ok(decode_latin1(&bytes).lines().any(|line| re.is_match(line)))
}

/// Journal entries, optionally limited to the last `lines` of one `unit`.
pub async fn get_logs(lines: Option<u32>, unit: Option<&str>) -> Result<ToolOutput> {
    let mut args = Vec::new();
    if let Some(lines) = lines.filter(|n| *n > 0) {
        args.push("-n".to_string());
        args.push(lines.to_string());
    }
    if let Some(unit) = unit.filter(|u| !u.is_empty()) {
        args.push("-u".to_string());
        args.push(unit.to_string());
    }
    Ok(process::run("journalctl", &args, None, UTILITY_TIMEOUT).await?.into())
}

/// Partition and filesystem summary of an image file.
pub async fn get_diskinfo(path: &Path) -> Result<ToolOutput> {
    let args = vec![path.display().to_string()];
    Ok(process::run("disktype", &args, None, UTILITY_TIMEOUT).await?.into())
}

/// HTML rendering of a man page.
pub async fn get_manpage(path: &Path) -> Result<ToolOutput> {
    let args = process::args([path.display().to_string(), "-M".to_string(), "/".to_string()]);
    Ok(process::run("man2html", &args, None, UTILITY_TIMEOUT).await?.into())
}

pub async fn reboot() -> Result<ToolOutput> {
    Ok(process::run("sudo", &process::args(["reboot"]), None, UTILITY_TIMEOUT).await?.into())
}

pub async fn shutdown() -> Result<ToolOutput> {
    let args = process::args(["shutdown", "-h", "now"]);
    Ok(process::run("sudo", &args, None, UTILITY_TIMEOUT).await?.into())
}

/// Describe the hardware and kernel.
pub async fn running_env() -> Result<RunningEnv> {
    let uts = nix::sys::utsname::uname().map_err(std::io::Error::from)?;
    Ok(RunningEnv {
        hardware: hardware_model().await,
        system: uts.sysname().to_string_lossy().into_owned(),
        release: uts.release().to_string_lossy().into_owned(),
        machine: uts.machine().to_string_lossy().into_owned(),
    })
}

/// Device-tree model, else DMI vendor and product, else a placeholder.
async fn hardware_model() -> String {
    if let Ok(model) = tokio::fs::read(DEVICE_TREE_MODEL).await {
        return clean_firmware_string(&model);
    }
    let vendor = tokio::fs::read(DMI_SYS_VENDOR).await;
    let product = tokio::fs::read(DMI_PRODUCT_NAME).await;
    match (vendor, product) {
        (Ok(vendor), Ok(product)) => format!(
            "{} {}",
            clean_firmware_string(&vendor),
            clean_firmware_string(&product)
        ),
        _ => UNKNOWN_DEVICE.to_string(),
    }
}

/// Firmware strings may carry trailing NULs and newlines.
fn clean_firmware_string(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\0', '\n', ' '])
        .to_string()
}
