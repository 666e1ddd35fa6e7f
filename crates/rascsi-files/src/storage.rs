//! Plain file operations under the image and configuration directories.
//!
//! Paths given by callers are relative and validated before any filesystem
//! access. When an image moves, its properties sidecar in the configuration
//! directory follows it.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use rascsi_core::constants::{CONFIG_FILE_SUFFIX, EXCLUDED_SUBDIRS};
use rascsi_core::{Envelope, ErrorKind, Result, ReturnCode};

use crate::manager::FileManager;

impl FileManager {
    // =========================================================================
    // Listings
    // =========================================================================

    /// Configuration snapshot names under the configuration directory.
    pub async fn list_config_files(&self) -> Envelope<Vec<String>> {
        Envelope::from(list_files_with_suffix(self.cfg_dir(), CONFIG_FILE_SUFFIX).await)
    }

    /// Sorted subdirectories of `dir` (relative to the image directory).
    pub async fn list_subdirs(&self, dir: &str) -> Envelope<Vec<String>> {
        let result = async {
            let root = if dir.is_empty() {
                self.images_dir().await?
            } else {
                self.image_path(dir).await?
            };
            list_subdirs(&root).await
        };
        Envelope::from(result.await)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Remove an image file.
    pub async fn delete_file(&self, path: &str) -> Envelope {
        let target = match self.image_path(path).await {
            Ok(target) => target,
            Err(e) => return Envelope::from_error(&e),
        };
        let shown_path = target.display().to_string();

        match fs::remove_file(&target).await {
            Ok(()) => {
                info!(path = %shown_path, "Deleted file");
                self.follow_sidecar(path, None).await;
                Envelope::success(ReturnCode::DeleteFileSuccess).with_param("file_path", shown_path)
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Envelope::failure(ErrorKind::IoFailure)
                .with_return_code(ReturnCode::DeleteFileNotFound)
                .with_message(e.to_string())
                .with_param("file_path", shown_path),
            Err(e) => {
                warn!(path = %shown_path, error = %e, "Could not delete file");
                Envelope::failure(ErrorKind::IoFailure)
                    .with_return_code(ReturnCode::DeleteFileUnableToDelete)
                    .with_message(e.to_string())
                    .with_param("file_path", shown_path)
            }
        }
    }

    /// Move an image, creating the destination's parent directory.
    pub async fn rename_file(&self, src: &str, dst: &str, overwrite: bool) -> Envelope {
        let (source, target) = match self.resolve_pair(src, dst).await {
            Ok(pair) => pair,
            Err(e) => return Envelope::from_error(&e),
        };
        let shown_path = target.display().to_string();

        if !overwrite && exists(&target).await {
            return Envelope::failure(ErrorKind::IoFailure)
                .with_return_code(ReturnCode::RenameFileCouldNotOverwrite)
                .with_param("target_path", shown_path);
        }

        match move_file(&source, &target).await {
            Ok(()) => {
                info!(from = %source.display(), to = %shown_path, "Renamed file");
                self.follow_sidecar(src, Some((dst, SidecarOp::Move))).await;
                Envelope::success(ReturnCode::RenameFileSuccess).with_param("target_path", shown_path)
            }
            Err(e) => {
                warn!(from = %source.display(), to = %shown_path, error = %e, "Could not rename file");
                Envelope::from_error(&e)
                    .with_return_code(ReturnCode::RenameFileUnableToMove)
                    .with_param("target_path", shown_path)
            }
        }
    }

    /// Byte copy with the same overwrite policy as [`FileManager::rename_file`].
    pub async fn copy_file(&self, src: &str, dst: &str, overwrite: bool) -> Envelope {
        let (source, target) = match self.resolve_pair(src, dst).await {
            Ok(pair) => pair,
            Err(e) => return Envelope::from_error(&e),
        };
        let shown_path = target.display().to_string();

        if !overwrite && exists(&target).await {
            return Envelope::failure(ErrorKind::IoFailure)
                .with_return_code(ReturnCode::WriteFileCouldNotOverwrite)
                .with_param("target_path", shown_path);
        }

        match copy_file(&source, &target).await {
            Ok(()) => {
                info!(from = %source.display(), to = %shown_path, "Copied file");
                self.follow_sidecar(src, Some((dst, SidecarOp::Copy))).await;
                Envelope::success(ReturnCode::WriteFileSuccess).with_param("target_path", shown_path)
            }
            Err(e) => {
                warn!(from = %source.display(), to = %shown_path, error = %e, "Could not copy file");
                Envelope::from_error(&e)
                    .with_return_code(ReturnCode::WriteFileCouldNotWrite)
                    .with_param("target_path", shown_path)
            }
        }
    }

    /// Create a sparse file of exactly `size` bytes.
    pub async fn create_empty_image(&self, path: &str, size: u64, overwrite: bool) -> Envelope {
        let target = match self.image_path(path).await {
            Ok(target) => target,
            Err(e) => return Envelope::from_error(&e),
        };
        let shown_path = target.display().to_string();

        if !overwrite && exists(&target).await {
            return Envelope::failure(ErrorKind::IoFailure)
                .with_return_code(ReturnCode::WriteFileCouldNotOverwrite)
                .with_param("target_path", shown_path);
        }

        match create_sparse(&target, size).await {
            Ok(()) => {
                info!(path = %shown_path, size, "Created empty image");
                Envelope::success(ReturnCode::WriteFileSuccess).with_param("target_path", shown_path)
            }
            Err(e) => {
                warn!(path = %shown_path, error = %e, "Could not create image");
                Envelope::from_error(&e)
                    .with_return_code(ReturnCode::WriteFileCouldNotWrite)
                    .with_param("target_path", shown_path)
            }
        }
    }

    async fn resolve_pair(&self, src: &str, dst: &str) -> Result<(PathBuf, PathBuf)> {
        rascsi_core::validate_relative_path(src)?;
        rascsi_core::validate_relative_path(dst)?;
        let root = self.images_dir().await?;
        Ok((root.join(src), root.join(dst)))
    }

    /// Apply an image move, copy or delete to its properties sidecar.
    ///
    /// Sidecars are keyed by the image name relative to the image
    /// directory, so `games/disk.hds` and `disk.hds` never share one.
    /// Sidecar trouble never fails the image operation.
    async fn follow_sidecar(&self, source: &str, dest: Option<(&str, SidecarOp)>) {
        let from = self.properties_path_for(source);
        if !exists(&from).await {
            return;
        }
        let result = match dest {
            None => fs::remove_file(&from).await.map_err(Into::into),
            Some((target, op)) => {
                let to = self.properties_path_for(target);
                match op {
                    SidecarOp::Move => move_file(&from, &to).await,
                    SidecarOp::Copy => copy_file(&from, &to).await,
                }
            }
        };
        match result {
            Ok(()) => debug!(path = %from.display(), "Updated properties sidecar"),
            Err(e) => warn!(path = %from.display(), error = %e, "Could not update properties sidecar"),
        }
    }
}

#[derive(Clone, Copy)]
enum SidecarOp {
    Move,
    Copy,
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Rename, falling back to copy and delete across filesystems.
pub(crate) async fn move_file(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(source, target).await {
        Ok(()) => Ok(()),
        Err(e) if crosses_devices(&e) => {
            debug!(from = %source.display(), to = %target.display(), "Cross-device move, copying");
            fs::copy(source, target).await?;
            fs::remove_file(source).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn crosses_devices(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(Errno::EXDEV as i32)
}

async fn copy_file(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::copy(source, target).await?;
    Ok(())
}

async fn create_sparse(target: &Path, size: u64) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(target).await?;
    if size > 0 {
        file.seek(std::io::SeekFrom::Start(size - 1)).await?;
        file.write_all(&[0]).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Names of files under `dir` (recursively) ending in `.suffix`, sorted.
pub async fn list_files_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<String>> {
    let wanted = format!(".{}", suffix);
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound && current == dir => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if name.ends_with(&wanted) {
                found.push(name);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Subdirectory paths under `root`, relative to it and sorted.
///
/// Dot-prefixed directories and the platform metadata folders in
/// [`EXCLUDED_SUBDIRS`] are skipped along with everything beneath them.
pub async fn list_subdirs(root: &Path) -> Result<Vec<String>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || EXCLUDED_SUBDIRS.contains(&name.as_str()) {
                continue;
            }
            let path = entry.path();
            if let Ok(relative) = path.strip_prefix(root) {
                found.push(relative.to_string_lossy().into_owned());
            }
            pending.push(path);
        }
    }

    found.sort();
    Ok(found)
}
