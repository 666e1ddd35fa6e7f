//! File manager composition root.
//!
//! [`FileManager`] owns the engine client, the configuration directory and
//! the shared reservation store. Its operations are spread over the sibling
//! modules, one `impl FileManager` block per concern.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rascsi_control::{AttachOutcome, AttachRequest, EngineClient};
use rascsi_core::constants::{ARCHIVE_FILE_SUFFIXES, BUS_ID_COUNT, PROPERTIES_SUFFIX};
use rascsi_core::paths::resolve_under;
use rascsi_core::{ControlSettings, Envelope, Error, ReservationStore, Result};

use crate::archive::{ArchiveCache, ArchiveMember};
use crate::properties::Properties;

/// Image, archive and configuration operations against one engine.
#[derive(Clone)]
pub struct FileManager {
    client: EngineClient,
    cfg_dir: PathBuf,
    reservations: ReservationStore,
    archive_cache: Arc<ArchiveCache>,
    http: reqwest::Client,
}

/// One entry of [`FileManager::list_images`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageListing {
    pub name: String,
    pub size: u64,
    pub detected_type: String,
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archive_contents: Vec<ArchiveMember>,
}

impl FileManager {
    /// Create a manager. `reservations` is shared with whoever renders status.
    pub fn new(client: EngineClient, cfg_dir: impl Into<PathBuf>, reservations: ReservationStore) -> Self {
        Self {
            client,
            cfg_dir: cfg_dir.into(),
            reservations,
            archive_cache: Arc::new(ArchiveCache::default()),
            http: crate::download::http_client(),
        }
    }

    /// Build the client and manager from control-plane settings.
    pub fn from_settings(settings: &ControlSettings, reservations: ReservationStore) -> Self {
        Self::new(
            EngineClient::from_settings(settings),
            settings.cfg_dir.clone(),
            reservations,
        )
    }

    pub fn client(&self) -> &EngineClient {
        &self.client
    }

    pub fn cfg_dir(&self) -> &Path {
        &self.cfg_dir
    }

    pub fn reservations(&self) -> &ReservationStore {
        &self.reservations
    }

    pub(crate) fn archive_cache(&self) -> &ArchiveCache {
        &self.archive_cache
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Image directory as currently reported by the engine.
    pub async fn images_dir(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.client.image_files_info().await?.images_dir))
    }

    /// Resolve a caller path under the image directory.
    pub(crate) async fn image_path(&self, relative: &str) -> Result<PathBuf> {
        // Validate before the engine round trip.
        rascsi_core::validate_relative_path(relative)?;
        resolve_under(&self.images_dir().await?, relative)
    }

    /// Resolve a caller path under the configuration directory.
    pub(crate) fn cfg_path(&self, relative: &str) -> Result<PathBuf> {
        resolve_under(&self.cfg_dir, relative)
    }

    /// Sidecar location for an image file name.
    pub fn properties_path_for(&self, image_name: &str) -> PathBuf {
        self.cfg_dir
            .join(format!("{}.{}", image_name, PROPERTIES_SUFFIX))
    }

    // =========================================================================
    // Image listing
    // =========================================================================

    /// Engine image listing enriched with sidecars and archive contents.
    pub async fn list_images(&self) -> Envelope<Vec<ImageListing>> {
        Envelope::flatten(self.list_images_inner().await)
    }

    async fn list_images_inner(&self) -> Result<Envelope<Vec<ImageListing>>> {
        let info = self.client.image_files_info().await?;
        let images_dir = PathBuf::from(&info.images_dir);
        let mut listings = Vec::with_capacity(info.image_files.len());

        for file in info.image_files {
            let properties = match Properties::load(&self.properties_path_for(&file.name)).await {
                Ok(props) => Some(props),
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    debug!(name = %file.name, error = %e, "Ignoring unreadable properties");
                    None
                }
            };

            let archive_contents = if is_archive_name(&file.name) {
                match self.archive_cache.inspect(&images_dir.join(&file.name)).await {
                    Ok(info) => crate::archive::visible_members(&info.members),
                    Err(e) => {
                        debug!(name = %file.name, error = %e, "Archive inspection failed");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            listings.push(ImageListing {
                name: file.name,
                size: file.size,
                detected_type: file.detected_type,
                read_only: file.read_only,
                properties,
                archive_contents,
            });
        }

        Ok(Envelope::ok().with_data(listings))
    }

    // =========================================================================
    // Attach with properties
    // =========================================================================

    /// Attach, filling unset drive identity fields from the image's sidecar.
    pub async fn attach_image(&self, id: u32, request: AttachRequest) -> Envelope<AttachOutcome> {
        Envelope::flatten(self.attach_image_inner(id, request).await)
    }

    async fn attach_image_inner(&self, id: u32, mut request: AttachRequest) -> Result<Envelope<AttachOutcome>> {
        if let Some(file) = request.file().map(str::to_owned) {
            let sidecar = self.properties_path_for(&file);
            if tokio::fs::try_exists(&sidecar).await.unwrap_or(false) {
                let props = Properties::load(&sidecar).await?;
                debug!(id, file = %file, "Applying drive properties");
                props.fill_request(&mut request);
            }
        }
        let outcome = self.client.attach(id, &request).await?;
        Ok(Envelope::ok().with_data(outcome))
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    /// Reserve `id` on the engine and remember why.
    pub async fn reserve_id(&self, id: u32, memo: &str) -> Envelope {
        Envelope::flatten(self.reserve_id_inner(id, memo).await)
    }

    async fn reserve_id_inner(&self, id: u32, memo: &str) -> Result<Envelope> {
        check_bus_id(id)?;
        let mut ids: BTreeSet<u32> = self.client.reserved_ids().await?.into_iter().collect();
        ids.insert(id);
        let ids: Vec<u32> = ids.into_iter().collect();
        self.client.reserve_ids(&ids).await?;
        self.reservations.set(id, memo)?;
        info!(id, memo, "Reserved id");
        Ok(Envelope::ok().with_param("id", id).with_param("memo", memo))
    }

    /// Release `id` on the engine and clear its memo.
    pub async fn release_id(&self, id: u32) -> Envelope {
        Envelope::flatten(self.release_id_inner(id).await)
    }

    async fn release_id_inner(&self, id: u32) -> Result<Envelope> {
        check_bus_id(id)?;
        let ids: Vec<u32> = self
            .client
            .reserved_ids()
            .await?
            .into_iter()
            .filter(|reserved| *reserved != id)
            .collect();
        self.client.reserve_ids(&ids).await?;
        self.reservations.clear(id)?;
        info!(id, "Released id");
        Ok(Envelope::ok().with_param("id", id))
    }
}

fn check_bus_id(id: u32) -> Result<()> {
    if id as usize >= BUS_ID_COUNT {
        return Err(Error::invalid_argument(format!(
            "bus id {} out of range 0..{}",
            id, BUS_ID_COUNT
        )));
    }
    Ok(())
}

/// Whether a file name carries one of the archive suffixes.
pub fn is_archive_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ARCHIVE_FILE_SUFFIXES.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
