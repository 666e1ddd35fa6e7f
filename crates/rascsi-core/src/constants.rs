//! Protocol and filesystem constants for the RaSCSI control plane.

use std::time::Duration;

// =============================================================================
// Wire Protocol Constants
// =============================================================================

/// Magic prefix sent ahead of every request frame.
pub const PROTOCOL_MAGIC: &[u8; 6] = b"RASCSI";

/// Length of the little-endian frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound for a single frame payload (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest single socket read while assembling a response.
pub const READ_CHUNK_SIZE: usize = 2048;

/// Default engine port.
pub const DEFAULT_ENGINE_PORT: u16 = 6868;

/// Default proxy listen port.
pub const DEFAULT_PROXY_PORT: u16 = 6868;

/// Default upstream engine port when running behind the proxy.
pub const DEFAULT_PROXY_UPSTREAM_PORT: u16 = 6869;

/// Default engine host.
pub const DEFAULT_ENGINE_HOST: &str = "localhost";

// =============================================================================
// Timing Constants
// =============================================================================

/// Additional connect attempts after the first one fails.
pub const CONNECT_RETRIES: u32 = 20;

/// Pause between connect attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Bound on partitioning tool runs.
pub const PARTITION_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on formatting and small utility runs.
pub const UTILITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on archive tool runs.
pub const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Bound on ISO generation.
pub const ISO_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Device Constants
// =============================================================================

/// Number of SCSI bus ids (0..=7).
pub const BUS_ID_COUNT: usize = 8;

/// Highest addressable logical unit.
pub const MAX_UNIT: u32 = 31;

/// Vendor string the engine reports for devices using its built-in defaults.
pub const ENGINE_DEFAULT_VENDOR: &str = "RaSCSI";

// =============================================================================
// Filesystem Constants
// =============================================================================

/// Product directory name under `${HOME}/.config`.
pub const PRODUCT_DIR: &str = "rascsi";

/// Suffix (without dot) of configuration snapshots.
pub const CONFIG_FILE_SUFFIX: &str = "json";

/// Suffix (without dot) of properties sidecars.
pub const PROPERTIES_SUFFIX: &str = "properties";

/// Suffixes (lowercase, without dot) treated as archives.
pub const ARCHIVE_FILE_SUFFIXES: &[&str] = &["zip", "sit", "tar", "gz", "7z"];

/// Directory names never listed as image subdirectories.
pub const EXCLUDED_SUBDIRS: &[&str] = &[
    "Network Trash Folder",
    "Temporary Items",
    "TheVolumeSettingsFolder",
];

/// Member whose presence marks a MacZip archive that must not be unpacked.
pub const MACZIP_SENTINEL: &str = "XtraStuf.mac";

/// HTTP download buffer size.
pub const DOWNLOAD_CHUNK_SIZE: usize = 8 * 1024;

/// User agent sent with downloads.
pub const DOWNLOAD_USER_AGENT: &str = "Mozilla/5.0";
