//! Archive inspection and extraction through The Unarchiver tools.
//!
//! `lsar -json` provides structured listings. `unar` has no machine-readable
//! mode, so its per-member progress lines are parsed; anything unrecognized
//! is an [`Error::ArchiveOutputUnparseable`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rascsi_core::constants::{ARCHIVE_TIMEOUT, PROPERTIES_SUFFIX};
use rascsi_core::{Envelope, Error, Result, ReturnCode};

use crate::manager::FileManager;
use crate::process;
use crate::storage::move_file;

/// Entries kept by [`ArchiveCache`].
const CACHE_CAPACITY: usize = 32;

const UNAR_SUCCESS: &str = r#"^Successfully extracted to "(?P<destination>.+)"\.$"#;
const UNAR_NO_FILES: &str = "No files extracted.";
const UNAR_MEMBER: &str = r"^ {2}(?P<path>.+). \(((?P<size>\d+) B)?(?P<types>(dir)?(, )?(rsrc)?)\)\.\.\. (?P<status>[A-Z]+)\.$";

// =============================================================================
// Types
// =============================================================================

/// How resource forks are written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkOutput {
    /// `<name>.rsrc`
    Visible,
    /// `._<name>`
    Hidden,
}

impl ForkOutput {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForkOutput::Visible => "visible",
            ForkOutput::Hidden => "hidden",
        }
    }
}

impl std::str::FromStr for ForkOutput {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "visible" => Ok(ForkOutput::Visible),
            "hidden" => Ok(ForkOutput::Hidden),
            other => Err(Error::invalid_argument(format!(
                "fork output must be visible or hidden, got {:?}",
                other
            ))),
        }
    }
}

/// A member as listed by `lsar`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMember {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub is_resource_fork: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_properties_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_properties_file: Option<String>,
}

/// Archive format and members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub format: String,
    pub members: Vec<ArchiveMember>,
}

/// A member written (or skipped) by `unar`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedMember {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub is_resource_fork: bool,
    pub absolute_path: String,
}

/// Members placed in the output directory, and those whose target existed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractResult {
    pub extracted: Vec<ExtractedMember>,
    pub skipped: Vec<ExtractedMember>,
}

/// Result of moving one extracted properties file into the config directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertiesMove {
    pub status: bool,
    pub name: String,
    pub path: String,
}

/// Payload of [`FileManager::extract_image`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractOutcome {
    pub extracted: Vec<ExtractedMember>,
    pub skipped: Vec<ExtractedMember>,
    pub properties_files_moved: Vec<PropertiesMove>,
}

// =============================================================================
// Parsing
// =============================================================================

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::invalid_argument(e.to_string()))
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Map `lsar -json` output onto [`ArchiveInfo`].
pub fn parse_lsar_output(stdout: &str) -> Result<ArchiveInfo> {
    let value: serde_json::Value =
        serde_json::from_str(stdout).map_err(|e| Error::ArchiveOutputUnparseable {
            message: format!("Unable to read JSON output from lsar: {}", e),
        })?;

    let format = value["lsarFormatName"].as_str().unwrap_or_default().to_string();
    let members = value["lsarContents"]
        .as_array()
        .map(|contents| {
            contents
                .iter()
                .map(|raw| {
                    let path = raw["XADFileName"].as_str().unwrap_or_default().to_string();
                    ArchiveMember {
                        name: file_name(&path),
                        size: raw["XADFileSize"].as_u64().unwrap_or(0),
                        is_dir: raw["XADIsDirectory"].as_bool().unwrap_or(false),
                        is_resource_fork: raw["XADIsResourceFork"].as_bool().unwrap_or(false),
                        path,
                        is_properties_file: false,
                        related_properties_file: None,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ArchiveInfo { format, members })
}

/// Members worth showing: no directories or forks, with sidecar relations marked.
pub fn visible_members(members: &[ArchiveMember]) -> Vec<ArchiveMember> {
    let suffix = format!(".{}", PROPERTIES_SUFFIX);
    let properties: Vec<&str> = members
        .iter()
        .map(|m| m.path.as_str())
        .filter(|path| path.ends_with(PROPERTIES_SUFFIX))
        .collect();

    members
        .iter()
        .filter(|m| !m.is_dir && !m.is_resource_fork)
        .map(|m| {
            let mut member = m.clone();
            let lower = member.path.to_ascii_lowercase();
            if lower.ends_with(&suffix) {
                member.is_properties_file = true;
            } else {
                let related = format!("{}{}", member.path, suffix);
                if properties.contains(&related.as_str()) {
                    member.related_properties_file = Some(related);
                }
            }
            member
        })
        .collect()
}

/// Parse `unar` progress output into members located under `tmp_dir`.
///
/// The first line names the archive, the last reports the outcome. Fork
/// members are dropped when no fork output was requested, and renamed to the
/// tool's convention otherwise.
pub fn parse_unar_output(
    stdout: &str,
    tmp_dir: &Path,
    fork: Option<ForkOutput>,
) -> Result<Vec<ExtractedMember>> {
    let lines: Vec<&str> = stdout.trim_end_matches('\n').split('\n').collect();
    let last = lines.last().copied().unwrap_or_default();

    if last == UNAR_NO_FILES {
        return Err(Error::NoFilesExtracted);
    }
    if !compile(UNAR_SUCCESS)?.is_match(last) {
        return Err(Error::ArchiveOutputUnparseable {
            message: last.to_string(),
        });
    }

    let member_re = compile(UNAR_MEMBER)?;
    let body = lines.get(1..lines.len().saturating_sub(1)).unwrap_or(&[]);
    let mut members = Vec::with_capacity(body.len());

    for line in body {
        let caps = member_re
            .captures(line)
            .ok_or_else(|| Error::ArchiveOutputUnparseable {
                message: format!("Unexpected output: {}", line),
            })?;
        let path = caps["path"].to_string();
        let types: Vec<&str> = caps
            .name("types")
            .map(|m| m.as_str())
            .unwrap_or_default()
            .split(", ")
            .filter(|t| !t.is_empty())
            .collect();

        let mut member = ExtractedMember {
            name: file_name(&path),
            size: caps
                .name("size")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0),
            is_dir: types.contains(&"dir"),
            is_resource_fork: false,
            absolute_path: tmp_dir.join(&path).display().to_string(),
            path,
        };

        if types.contains(&"rsrc") {
            let Some(fork) = fork else {
                continue;
            };
            member.is_resource_fork = true;
            member.name = match fork {
                ForkOutput::Hidden => format!("._{}", member.name),
                ForkOutput::Visible => format!("{}.rsrc", member.name),
            };
            let parent = Path::new(&member.path)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            member.path = parent.join(&member.name).display().to_string();
            member.absolute_path = tmp_dir.join(&member.path).display().to_string();
        }

        debug!(path = %member.path, absolute = %member.absolute_path, "Extracted member");
        members.push(member);
    }

    Ok(members)
}

// =============================================================================
// Tool invocation
// =============================================================================

fn archive_failure(e: Error) -> Error {
    match e {
        Error::Timeout { .. } => e,
        other => Error::ArchiveCommandFailure {
            message: other.to_string(),
        },
    }
}

/// List an archive's members with `lsar`.
pub async fn inspect_archive(path: &Path) -> Result<ArchiveInfo> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        )));
    }
    let args = process::args(["-json".to_string(), "--".to_string(), path.display().to_string()]);
    let output = process::run("lsar", &args, None, ARCHIVE_TIMEOUT)
        .await
        .map_err(archive_failure)?;
    if !output.success() {
        return Err(Error::ArchiveCommandFailure {
            message: format!("Non-zero return code: {}", output.code),
        });
    }
    parse_lsar_output(&output.stdout)
}

/// Extract `members` (everything when empty) of `archive` into `output_dir`.
///
/// Members are unpacked into a private directory inside `output_dir` first,
/// then moved into place in path order. Existing targets are never
/// overwritten; those members are reported as skipped.
pub async fn extract_archive(
    archive: &Path,
    members: &[String],
    output_dir: &Path,
    fork: Option<ForkOutput>,
) -> Result<ExtractResult> {
    let output_dir = tokio::fs::canonicalize(output_dir).await?;
    if !tokio::fs::metadata(&output_dir).await?.is_dir() {
        return Err(Error::invalid_argument(format!(
            "{} is not a directory",
            output_dir.display()
        )));
    }

    let tmp = tempfile::Builder::new()
        .prefix(".unar-")
        .tempdir_in(&output_dir)?;

    let mut args = process::args([
        "-output-directory".to_string(),
        tmp.path().display().to_string(),
        "-force-skip".to_string(),
        "-no-directory".to_string(),
    ]);
    if let Some(fork) = fork {
        args.push("-forks".to_string());
        args.push(fork.as_str().to_string());
    }
    args.push("--".to_string());
    args.push(archive.display().to_string());
    args.extend(members.iter().map(|member| regex::escape(member)));

    let output = process::run("unar", &args, None, ARCHIVE_TIMEOUT)
        .await
        .map_err(archive_failure)?;
    if !output.success() {
        return Err(Error::ArchiveCommandFailure {
            message: format!("Non-zero return code: {}", output.code),
        });
    }

    let extracted = parse_unar_output(&output.stdout, tmp.path(), fork)?;
    place_members(extracted, &output_dir).await
}

/// Move unpacked members into `output_dir`, skipping existing targets.
pub async fn place_members(mut members: Vec<ExtractedMember>, output_dir: &Path) -> Result<ExtractResult> {
    members.sort_by(|a, b| a.path.cmp(&b.path));
    let mut result = ExtractResult::default();

    for mut member in members {
        let source = PathBuf::from(&member.absolute_path);
        let target = output_dir.join(&member.path);
        member.absolute_path = target.display().to_string();

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            info!(path = %target.display(), "Skipping member, target already exists");
            result.skipped.push(member);
            continue;
        }

        if member.is_dir {
            tokio::fs::create_dir_all(&target).await?;
        } else {
            move_file(&source, &target).await?;
        }
        result.extracted.push(member);
    }

    Ok(result)
}

// =============================================================================
// Cache
// =============================================================================

type CacheKey = (PathBuf, u64, Option<SystemTime>);

/// Bounded memo of archive listings keyed on path, size and mtime.
#[derive(Default)]
pub struct ArchiveCache {
    entries: Mutex<VecDeque<(CacheKey, ArchiveInfo)>>,
}

impl ArchiveCache {
    /// Inspect `path`, reusing a listing while the file is unchanged.
    pub async fn inspect(&self, path: &Path) -> Result<ArchiveInfo> {
        let meta = tokio::fs::metadata(path).await?;
        let key: CacheKey = (path.to_path_buf(), meta.len(), meta.modified().ok());

        if let Some(info) = self.lookup(&key) {
            debug!(path = %path.display(), "Archive listing cache hit");
            return Ok(info);
        }

        let info = inspect_archive(path).await?;
        self.insert(key, info.clone());
        Ok(info)
    }

    fn lookup(&self, key: &CacheKey) -> Option<ArchiveInfo> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let position = entries.iter().position(|(k, _)| k == key)?;
        let entry = entries.remove(position)?;
        let info = entry.1.clone();
        entries.push_back(entry);
        Some(info)
    }

    fn insert(&self, key: CacheKey, info: ArchiveInfo) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|(k, _)| k.0 != key.0);
        if entries.len() >= CACHE_CAPACITY {
            entries.pop_front();
        }
        entries.push_back((key, info));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// File manager operation
// =============================================================================

impl FileManager {
    /// Extract `members` of an archive in the image directory.
    ///
    /// With `move_properties_to_cfg`, extracted `*.properties` files are moved
    /// into the configuration directory.
    pub async fn extract_image(
        &self,
        archive: &str,
        members: &[String],
        move_properties_to_cfg: bool,
    ) -> Envelope<ExtractOutcome> {
        Envelope::flatten(self.extract_image_inner(archive, members, move_properties_to_cfg).await)
    }

    async fn extract_image_inner(
        &self,
        archive: &str,
        members: &[String],
        move_properties_to_cfg: bool,
    ) -> Result<Envelope<ExtractOutcome>> {
        rascsi_core::validate_relative_path(archive)?;
        if members.is_empty() {
            return Err(Error::NoFilesSpecified);
        }

        let images_dir = self.images_dir().await?;
        let result = extract_archive(&images_dir.join(archive), members, &images_dir, None).await?;

        let suffix = format!(".{}", PROPERTIES_SUFFIX);
        let mut moved = Vec::new();
        if move_properties_to_cfg {
            for file in result.extracted.iter().filter(|f| f.name.ends_with(&suffix)) {
                let target = self.cfg_dir().join(&file.name);
                let status = match move_file(Path::new(&file.absolute_path), &target).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(path = %file.absolute_path, error = %e, "Could not move properties file");
                        false
                    }
                };
                moved.push(PropertiesMove {
                    status,
                    name: file.path.clone(),
                    path: target.display().to_string(),
                });
            }
        }

        info!(archive, count = result.extracted.len(), "Extracted archive members");
        Ok(Envelope::success(ReturnCode::ExtractImageSuccess)
            .with_param("count", result.extracted.len())
            .with_data(ExtractOutcome {
                extracted: result.extracted,
                skipped: result.skipped,
                properties_files_moved: moved,
            }))
    }

    /// Archive listing through the manager's cache.
    pub async fn inspect_archive(&self, archive: &str) -> Envelope<ArchiveInfo> {
        let result = async {
            let path = self.image_path(archive).await?;
            self.archive_cache().inspect(&path).await
        };
        Envelope::from(result.await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSAR_JSON: &str = r#"{
        "lsarFormatName": "Zip",
        "lsarContents": [
            {"XADFileName": "Games", "XADIsDirectory": true},
            {"XADFileName": "Games/disk.hds", "XADFileSize": 1048576},
            {"XADFileName": "Games/disk.hds.properties", "XADFileSize": 90},
            {"XADFileName": "Games/Icon\r", "XADFileSize": 300, "XADIsResourceFork": true},
            {"XADFileName": "readme.txt", "XADFileSize": 12}
        ]
    }"#;

    fn unar_output() -> String {
        [
            "disk.zip: Zip",
            "  Games  (dir)... OK.",
            "  Games/disk.hds  (1048576 B)... OK.",
            "  Games/app  (12 B, rsrc)... OK.",
            "Successfully extracted to \"/tmp/out\".",
            "",
        ]
        .join("\n")
    }

    #[test]
    fn lsar_members_are_mapped() {
        let info = parse_lsar_output(LSAR_JSON).unwrap();
        assert_eq!(info.format, "Zip");
        assert_eq!(info.members.len(), 5);
        assert!(info.members[0].is_dir);
        assert_eq!(info.members[1].name, "disk.hds");
        assert_eq!(info.members[1].size, 1048576);
        assert!(info.members[3].is_resource_fork);
    }

    #[test]
    fn lsar_garbage_is_unparseable() {
        let err = parse_lsar_output("lsar: cannot open").unwrap_err();
        assert!(matches!(err, Error::ArchiveOutputUnparseable { .. }));
    }

    #[test]
    fn visible_members_hide_dirs_and_forks() {
        let info = parse_lsar_output(LSAR_JSON).unwrap();
        let visible = visible_members(&info.members);
        let paths: Vec<_> = visible.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["Games/disk.hds", "Games/disk.hds.properties", "readme.txt"]);
        assert_eq!(
            visible[0].related_properties_file.as_deref(),
            Some("Games/disk.hds.properties")
        );
        assert!(visible[1].is_properties_file);
        assert!(!visible[2].is_properties_file);
        assert!(visible[2].related_properties_file.is_none());
    }

    #[test]
    fn unar_output_without_forks() {
        let members = parse_unar_output(&unar_output(), Path::new("/tmp/x"), None).unwrap();
        assert_eq!(members.len(), 2);
        assert!(members[0].is_dir);
        assert_eq!(members[1].path, "Games/disk.hds");
        assert_eq!(members[1].size, 1048576);
        assert_eq!(members[1].absolute_path, "/tmp/x/Games/disk.hds");
    }

    #[test]
    fn unar_output_fork_naming() {
        let visible = parse_unar_output(&unar_output(), Path::new("/t"), Some(ForkOutput::Visible)).unwrap();
        let fork = &visible[2];
        assert!(fork.is_resource_fork);
        assert_eq!(fork.name, "app.rsrc");
        assert_eq!(fork.path, "Games/app.rsrc");
        assert_eq!(fork.size, 12);

        let hidden = parse_unar_output(&unar_output(), Path::new("/t"), Some(ForkOutput::Hidden)).unwrap();
        assert_eq!(hidden[2].name, "._app");
        assert_eq!(hidden[2].absolute_path, "/t/Games/._app");
    }

    #[test]
    fn unar_no_files_and_garbage() {
        let err = parse_unar_output("x.zip: Zip\nNo files extracted.\n", Path::new("/t"), None).unwrap_err();
        assert!(matches!(err, Error::NoFilesExtracted));

        let err = parse_unar_output("x.zip: Zip\nSomething odd\n", Path::new("/t"), None).unwrap_err();
        assert!(matches!(err, Error::ArchiveOutputUnparseable { .. }));

        let bad_member = "x.zip: Zip\n  weird line\nSuccessfully extracted to \"/t\".\n";
        let err = parse_unar_output(bad_member, Path::new("/t"), None).unwrap_err();
        assert!(err.to_string().contains("weird line"));
    }

    #[tokio::test]
    async fn place_members_skips_existing_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("Games")).unwrap();
        std::fs::write(tmp.path().join("Games/a.hds"), b"new").unwrap();
        std::fs::write(tmp.path().join("b.hds"), b"new").unwrap();
        std::fs::write(out.path().join("b.hds"), b"old").unwrap();

        let member = |path: &str, is_dir: bool| ExtractedMember {
            name: file_name(path),
            path: path.to_string(),
            size: 3,
            is_dir,
            is_resource_fork: false,
            absolute_path: tmp.path().join(path).display().to_string(),
        };
        let result = place_members(
            vec![member("b.hds", false), member("Games/a.hds", false), member("Games", true)],
            out.path(),
        )
        .await
        .unwrap();

        let extracted: Vec<_> = result.extracted.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(extracted, vec!["Games", "Games/a.hds"]);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(std::fs::read(out.path().join("b.hds")).unwrap(), b"old");
        assert_eq!(std::fs::read(out.path().join("Games/a.hds")).unwrap(), b"new");
    }

    #[test]
    fn fork_output_parses() {
        assert_eq!("hidden".parse::<ForkOutput>().unwrap(), ForkOutput::Hidden);
        assert!("both".parse::<ForkOutput>().is_err());
    }
}
