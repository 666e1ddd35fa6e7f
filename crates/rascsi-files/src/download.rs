//! HTTP downloads into the image directory.

use std::path::Path;

use futures::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use rascsi_core::constants::{DOWNLOAD_CHUNK_SIZE, DOWNLOAD_USER_AGENT, ISO_TIMEOUT, MACZIP_SENTINEL};
use rascsi_core::{Envelope, Error, Result, ReturnCode};

use crate::archive::{extract_archive, inspect_archive};
use crate::manager::{FileManager, is_archive_name};
use crate::process;

/// Characters left unescaped in download URLs besides alphanumerics.
const URL_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/')
    .remove(b':')
    .remove(b'?')
    .remove(b'&');

/// Client used for all downloads. Redirects are followed by default.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(DOWNLOAD_USER_AGENT)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

/// Escape everything outside the safe set.
pub fn quote_url(url: &str) -> String {
    utf8_percent_encode(url, URL_SAFE).to_string()
}

/// Last path segment of `url`, decoded.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let name = percent_decode_str(segment).decode_utf8_lossy().into_owned();
    (!name.is_empty()).then_some(name)
}

/// Stream `url` into `dest`.
///
/// Data lands in a `.part` file next to `dest`, renamed once complete.
pub async fn download_url(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64> {
    info!(url, dest = %dest.display(), "Downloading");

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Http {
            message: e.to_string(),
        })?;
    debug!(
        status = %response.status(),
        content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE),
        "Download response"
    );

    let partial = dest.with_extension(match dest.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_string(),
    });
    let file = tokio::fs::File::create(&partial).await?;
    let mut writer = BufWriter::with_capacity(DOWNLOAD_CHUNK_SIZE, file);
    let mut written: u64 = 0;

    let mut stream = response.bytes_stream();
    let streamed: Result<()> = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Http {
                message: e.to_string(),
            })?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = streamed {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    tokio::fs::rename(&partial, dest).await?;

    debug!(bytes = written, dest = %dest.display(), "Download complete");
    Ok(written)
}

/// Payload of [`FileManager::download_file_to_iso`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IsoOutcome {
    pub file_name: String,
}

impl FileManager {
    /// Download `url` into `save_dir` (relative to the image directory).
    pub async fn download_to_dir(&self, url: &str, save_dir: &str) -> Envelope {
        let result = async {
            let dir = if save_dir.is_empty() {
                self.images_dir().await?
            } else {
                self.image_path(save_dir).await?
            };
            let file_name = file_name_from_url(url)
                .ok_or_else(|| Error::invalid_argument(format!("no file name in URL {}", url)))?;
            download_url(self.http(), &quote_url(url), &dir.join(&file_name)).await?;
            Ok::<_, Error>((file_name, dir))
        };

        match result.await {
            Ok((file_name, dir)) => Envelope::success(ReturnCode::DownloadToDirSuccess)
                .with_param("file_name", file_name)
                .with_param("save_dir", dir.display()),
            Err(e) => {
                warn!(url, error = %e, "Download failed");
                Envelope::from_error(&e)
            }
        }
    }

    /// Download `url`, wrap it in an ISO image with `genisoimage`.
    ///
    /// Archives are unpacked first unless they carry Mac metadata that
    /// unpacking would lose.
    pub async fn download_file_to_iso(&self, url: &str, iso_args: &[String]) -> Envelope<IsoOutcome> {
        Envelope::flatten(self.download_file_to_iso_inner(url, iso_args).await)
    }

    async fn download_file_to_iso_inner(&self, url: &str, iso_args: &[String]) -> Result<Envelope<IsoOutcome>> {
        let images_dir = self.images_dir().await?;
        let file_name = file_name_from_url(url)
            .ok_or_else(|| Error::invalid_argument(format!("no file name in URL {}", url)))?;
        let iso_path = images_dir.join(format!("{}.iso", file_name));

        let tmp = tempfile::tempdir()?;
        let downloaded = tmp.path().join(&file_name);
        download_url(self.http(), &quote_url(url), &downloaded).await?;
        info!(file = %file_name, tmp = %tmp.path().display(), "Downloaded for ISO");

        if is_archive_name(&file_name) {
            unpack_for_iso(&downloaded, tmp.path()).await;
        }

        let mut args = iso_args.to_vec();
        args.push("-o".to_string());
        args.push(iso_path.display().to_string());
        args.push(tmp.path().display().to_string());
        process::run_checked("genisoimage", &args, None, ISO_TIMEOUT).await?;

        let iso_name = rascsi_core::paths::file_name_str(&iso_path);
        info!(iso = %iso_name, "Created ISO image");
        Ok(Envelope::success(ReturnCode::DownloadFileToIsoSuccess)
            .with_param("value", iso_args.join(" "))
            .with_param("file_name", &iso_name)
            .with_data(IsoOutcome { file_name: iso_name }))
    }
}

/// Unpack a downloaded archive in place; leave it untouched on any trouble.
async fn unpack_for_iso(archive: &Path, dir: &Path) {
    match inspect_archive(archive).await {
        Ok(info) if info.members.iter().any(|m| m.path.contains(MACZIP_SENTINEL)) => {
            info!(path = %archive.display(), "MacZip archive, keeping it packed");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(path = %archive.display(), error = %e, "Could not inspect downloaded archive");
            return;
        }
    }

    match extract_archive(archive, &[], dir, None).await {
        Ok(result) => {
            info!(path = %archive.display(), count = result.extracted.len(), "Unpacked archive");
            if let Err(e) = tokio::fs::remove_file(archive).await {
                warn!(path = %archive.display(), error = %e, "Could not remove unpacked archive");
            }
        }
        Err(e) => warn!(path = %archive.display(), error = %e, "Could not unpack archive"),
    }
}
