//! Image, archive and configuration management for RaSCSI.
//!
//! [`FileManager`] is the entry point. Its operations work on paths rooted
//! under the engine's image directory and the control-plane configuration
//! directory, and report [`rascsi_core::Envelope`]s.
//!
//! - [`storage`]: listings and plain file operations
//! - [`config`]: configuration snapshots
//! - [`properties`]: drive properties sidecars
//! - [`archive`]: archive inspection and extraction
//! - [`disk`]: partitioning and formatting
//! - [`download`]: HTTP downloads and ISO wrapping
//! - [`host`]: host system adapters

pub mod archive;
pub mod config;
pub mod disk;
pub mod download;
pub mod host;
pub mod json;
pub mod manager;
pub mod process;
pub mod properties;
pub mod storage;

pub use archive::{ArchiveInfo, ArchiveMember, ExtractOutcome, ExtractResult, ExtractedMember, ForkOutput};
pub use config::{ConfigSnapshot, DeviceEntry, LoadedConfig, ReservedEntry, parse_config};
pub use disk::{DiskFormat, FatSize};
pub use download::IsoOutcome;
pub use host::{DiskSpace, RunningEnv, ToolOutput};
pub use manager::{FileManager, ImageListing};
pub use properties::{DriveProperties, Properties};
