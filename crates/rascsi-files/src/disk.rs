//! Partitioning and filesystem initialization of image files.
//!
//! All three operations delete the image when the external tool fails, so a
//! half-initialized disk never lingers in the image directory.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rascsi_core::constants::{PARTITION_TIMEOUT, UTILITY_TIMEOUT};
use rascsi_core::{Envelope, Error, Result};

use crate::manager::FileManager;
use crate::process;

/// Partition map flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiskFormat {
    Hfs,
    Fat,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Hfs => "HFS",
            DiskFormat::Fat => "FAT",
        }
    }

    /// Interactive partitioner driven for this format.
    pub fn partitioner(&self) -> &'static str {
        match self {
            DiskFormat::Hfs => "hfdisk",
            DiskFormat::Fat => "fdisk",
        }
    }
}

impl std::str::FromStr for DiskFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HFS" => Ok(DiskFormat::Hfs),
            "FAT" => Ok(DiskFormat::Fat),
            _ => Err(Error::invalid_argument(format!("unknown disk format {:?}", s))),
        }
    }
}

/// FAT variant passed to `mkfs.fat -F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatSize {
    Fat12,
    Fat16,
    Fat32,
}

impl FatSize {
    pub fn bits(&self) -> u8 {
        match self {
            FatSize::Fat12 => 12,
            FatSize::Fat16 => 16,
            FatSize::Fat32 => 32,
        }
    }
}

impl TryFrom<u8> for FatSize {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            12 => Ok(FatSize::Fat12),
            16 => Ok(FatSize::Fat16),
            32 => Ok(FatSize::Fat32),
            other => Err(Error::invalid_argument(format!(
                "FAT size must be 12, 16 or 32, got {}",
                other
            ))),
        }
    }
}

/// Keystrokes fed to the partitioner, one entry per line.
pub fn partition_script(format: DiskFormat, volume: &str) -> Vec<String> {
    let lines: Vec<&str> = match format {
        // Driver partition of 32 blocks, then HFS over the rest.
        DiskFormat::Hfs => vec![
            "i",
            "",
            "C",
            "",
            "32",
            "Driver_Partition",
            "Apple_Driver",
            "C",
            "",
            "",
            volume,
            "Apple_HFS",
            "w",
            "y",
            "p",
        ],
        // DOS label, one primary partition, W95 FAT32 type.
        DiskFormat::Fat => vec!["o", "n", "p", "", "", "", "t", "b", "w"],
    };
    lines.into_iter().map(str::to_string).collect()
}

/// Loop device name from `kpartx -av` output.
pub fn parse_loop_device(stdout: &str) -> Option<String> {
    let re = Regex::new(r"(loop\d\D\d)").ok()?;
    re.captures(stdout).map(|caps| caps[1].to_string())
}

impl FileManager {
    /// Write a partition map to an image in the image directory.
    pub async fn partition_disk(&self, file: &str, volume: &str, format: DiskFormat) -> Envelope {
        let result = async {
            let path = self.image_path(file).await?;
            let script = partition_script(format, volume).join("\n") + "\n";
            let args = vec![path.display().to_string()];
            let output = process::run(format.partitioner(), &args, Some(script.as_bytes()), PARTITION_TIMEOUT);
            match output.await {
                Ok(out) if out.success() => {
                    info!(path = %path.display(), format = format.as_str(), "Partitioned disk");
                    Ok(())
                }
                Ok(out) => {
                    discard_image(&path).await;
                    Err(Error::CommandFailure {
                        program: format.partitioner().to_string(),
                        stderr: out.stderr,
                    })
                }
                Err(e) => {
                    discard_image(&path).await;
                    Err(e)
                }
            }
        };
        Envelope::from(result.await)
    }

    /// Inject driver blocks and initialize an HFS volume.
    pub async fn format_hfs(&self, file: &str, volume: &str, driver_path: &Path) -> Envelope {
        let result = async {
            let path = self.image_path(file).await?;
            let target = path.display().to_string();

            let dd = process::args([
                format!("if={}", driver_path.display()),
                format!("of={}", target),
                "seek=64".to_string(),
                "count=32".to_string(),
                "bs=512".to_string(),
                "conv=notrunc".to_string(),
            ]);
            if let Err(e) = process::run_checked("dd", &dd, None, UTILITY_TIMEOUT).await {
                discard_image(&path).await;
                return Err(e);
            }

            let hformat = process::args(["-l".to_string(), volume.to_string(), target, "1".to_string()]);
            match process::run_checked("hformat", &hformat, None, UTILITY_TIMEOUT).await {
                Ok(out) => {
                    info!(path = %path.display(), volume, output = %out.stdout.trim(), "Formatted HFS volume");
                    Ok(())
                }
                Err(e) => {
                    discard_image(&path).await;
                    Err(e)
                }
            }
        };
        Envelope::from(result.await)
    }

    /// Map the image's partitions, create a FAT filesystem, unmap.
    pub async fn format_fat(&self, file: &str, volume: &str, size: FatSize) -> Envelope {
        let result = async {
            let path = self.image_path(file).await?;
            let target = path.display().to_string();

            let kpartx = process::args(["-av".to_string(), target.clone()]);
            let mapped = match process::run_checked("kpartx", &kpartx, None, UTILITY_TIMEOUT).await {
                Ok(out) => out,
                Err(e) => {
                    discard_image(&path).await;
                    return Err(e);
                }
            };
            let Some(loop_device) = parse_loop_device(&mapped.stdout) else {
                unmap(&target).await;
                discard_image(&path).await;
                return Err(Error::CommandFailure {
                    program: "kpartx".to_string(),
                    stderr: format!("no loop device in output: {}", mapped.stdout.trim()),
                });
            };

            let mkfs = process::args([
                "-v".to_string(),
                "-F".to_string(),
                size.bits().to_string(),
                "-n".to_string(),
                volume.to_string(),
                format!("/dev/mapper/{}", loop_device),
            ]);
            let formatted = process::run_checked("mkfs.fat", &mkfs, None, UTILITY_TIMEOUT).await;
            unmap(&target).await;

            match formatted {
                Ok(out) => {
                    info!(
                        path = %path.display(),
                        volume,
                        fat = size.bits(),
                        output = %out.stdout.trim(),
                        "Formatted FAT volume"
                    );
                    Ok(())
                }
                Err(e) => {
                    discard_image(&path).await;
                    Err(e)
                }
            }
        };
        Envelope::from(result.await)
    }
}

/// Remove a loop mapping; failures are only logged.
async fn unmap(target: &str) {
    let args = process::args(["-dv".to_string(), target.to_string()]);
    if let Err(e) = process::run_checked("kpartx", &args, None, UTILITY_TIMEOUT).await {
        warn!(path = target, error = %e, "Could not remove loop mapping");
    }
}

async fn discard_image(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "Deleted image after failure"),
        Err(e) => warn!(path = %path.display(), error = %e, "Could not delete image after failure"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hfs_script_names_the_volume() {
        let script = partition_script(DiskFormat::Hfs, "Macintosh HD");
        assert_eq!(script.len(), 15);
        assert_eq!(script[0], "i");
        assert_eq!(script[4], "32");
        assert_eq!(script[10], "Macintosh HD");
        assert_eq!(script[11], "Apple_HFS");
        assert_eq!(&script[12..], ["w", "y", "p"]);
    }

    #[test]
    fn fat_script_is_fixed() {
        let script = partition_script(DiskFormat::Fat, "ignored");
        assert_eq!(script, ["o", "n", "p", "", "", "", "t", "b", "w"]);
    }

    #[test]
    fn loop_device_is_found() {
        let out = "add map loop0p1 (254:0): 0 20480 linear 7:0 2048\n";
        assert_eq!(parse_loop_device(out).as_deref(), Some("loop0p1"));
        assert_eq!(parse_loop_device("nothing here"), None);
    }

    #[test]
    fn format_and_fat_parsing() {
        assert_eq!("hfs".parse::<DiskFormat>().unwrap(), DiskFormat::Hfs);
        assert_eq!(DiskFormat::Fat.partitioner(), "fdisk");
        assert!("ntfs".parse::<DiskFormat>().is_err());
        assert_eq!(FatSize::try_from(16).unwrap().bits(), 16);
        assert!(FatSize::try_from(8).is_err());
    }
}
