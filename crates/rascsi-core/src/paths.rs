//! Path safety and well-known directories.

use std::path::{Component, Path, PathBuf};

use crate::constants::PRODUCT_DIR;
use crate::{Error, Result};

/// Reject caller-supplied paths that are absolute or contain `..`.
///
/// Runs before any filesystem access. Returns the path unchanged on success.
pub fn validate_relative_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let unsafe_component = path.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if path.is_absolute() || unsafe_component {
        return Err(Error::InvalidPath {
            path: path.to_path_buf(),
        });
    }
    Ok(path.to_path_buf())
}

/// Join a validated relative path onto `root`.
pub fn resolve_under(root: &Path, relative: impl AsRef<Path>) -> Result<PathBuf> {
    Ok(root.join(validate_relative_path(relative)?))
}

/// `${HOME}/.config/rascsi`, falling back to `./.config/rascsi` without a home.
pub fn default_cfg_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(PRODUCT_DIR)
}

/// File name component as a string, or the empty string.
pub fn file_name_str(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
