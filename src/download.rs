use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cache::{CacheIndex, CacheMode};
use crate::domain::{Checksum, ChecksumKind, DownloadRecord, RemoteRef, Scene, SceneId};
use crate::error::TerraError;
use crate::fs_util;
use crate::pool::{BatchReport, ItemStatus, WorkerPool};
use crate::store::{CatalogStore, SceneFilter, SceneOrder, SceneUpdate};
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub download_root: PathBuf,
    pub cache_mode: CacheMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Placed from a local cache root without touching the network.
    CacheHit,
    Fetched,
    /// The final file was already on disk and verified.
    AlreadyPresent,
    /// Bytes arrived but failed verification; the scene stays pending.
    Rejected,
    Skipped,
}

impl DownloadOutcome {
    fn status(&self) -> ItemStatus {
        match self {
            DownloadOutcome::Skipped => ItemStatus::Skipped,
            DownloadOutcome::Rejected => ItemStatus::Failed,
            _ => ItemStatus::Succeeded,
        }
    }

    pub fn is_downloaded(self) -> bool {
        matches!(
            self,
            DownloadOutcome::CacheHit | DownloadOutcome::Fetched | DownloadOutcome::AlreadyPresent
        )
    }
}

struct Verification {
    matches: bool,
    digest: Checksum,
    size: u64,
}

pub struct DownloadManager<T: Transport> {
    store: CatalogStore,
    transport: T,
    cache: CacheIndex,
    settings: DownloadSettings,
}

impl<T: Transport> DownloadManager<T> {
    pub fn new(
        store: CatalogStore,
        transport: T,
        cache: CacheIndex,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            store,
            transport,
            cache,
            settings,
        }
    }

    pub fn scene_dir(&self, scene: &Scene) -> PathBuf {
        self.settings.download_root.join(scene.dir_name())
    }

    pub fn download_one(&self, scene: &Scene) -> Result<DownloadOutcome, TerraError> {
        if scene.download.done || scene.invalid {
            return Ok(DownloadOutcome::Skipped);
        }
        let dir = self.scene_dir(scene);
        fs::create_dir_all(&dir)
            .map_err(|err| TerraError::Filesystem(format!("{}: {err}", dir.display())))?;
        let final_path = dir.join(&scene.remote.filename);
        let started_at = Utc::now();

        if let Some(cached) = self.cache.lookup(&scene.remote.filename) {
            debug!(scene = scene.id, cached = %cached.display(), "cache hit");
            self.cache
                .materialize(cached, &final_path, self.settings.cache_mode)?;
            let checked = verify(&final_path, &scene.remote)?;
            if checked.matches {
                self.mark_downloaded(scene, started_at, &final_path, checked)?;
                return Ok(DownloadOutcome::CacheHit);
            }
            warn!(scene = scene.id, cached = %cached.display(), "cached copy failed verification; fetching");
            remove_file(&final_path)?;
        }

        if final_path.is_file() {
            let checked = verify(&final_path, &scene.remote)?;
            if checked.matches {
                info!(scene = scene.id, "existing file verified; recording download");
                self.mark_downloaded(scene, started_at, &final_path, checked)?;
                return Ok(DownloadOutcome::AlreadyPresent);
            }
            warn!(scene = scene.id, path = %final_path.display(), "existing file failed verification; refetching");
            remove_file(&final_path)?;
        }

        let part_path = dir.join(format!("{}.part", scene.remote.filename));
        let on_disk = fs::metadata(&part_path).map(|m| m.len()).unwrap_or(0);
        let complete = scene.remote.size.is_some_and(|size| on_disk >= size);
        if complete {
            debug!(scene = scene.id, bytes = on_disk, "partial file already complete; verifying");
        } else {
            let received = self
                .transport
                .fetch(&scene.remote.url, &part_path, on_disk)?;
            debug!(scene = scene.id, bytes = received, "transfer finished");
        }

        let checked = verify(&part_path, &scene.remote)?;
        if !checked.matches {
            warn!(
                scene = scene.id,
                expected = ?scene.remote.checksum,
                actual = %checked.digest,
                "download failed verification; discarding"
            );
            remove_file(&part_path)?;
            return Ok(DownloadOutcome::Rejected);
        }
        fs::rename(&part_path, &final_path)
            .map_err(|err| TerraError::Filesystem(format!("{}: {err}", final_path.display())))?;
        self.mark_downloaded(scene, started_at, &final_path, checked)?;
        Ok(DownloadOutcome::Fetched)
    }

    fn mark_downloaded(
        &self,
        scene: &Scene,
        started_at: chrono::DateTime<Utc>,
        path: &Path,
        checked: Verification,
    ) -> Result<(), TerraError> {
        let record = DownloadRecord {
            started_at: Some(started_at),
            ended_at: Some(Utc::now()),
            done: true,
            local_path: Some(path.display().to_string()),
            checksum: Some(checked.digest),
            size: Some(checked.size),
        };
        self.store
            .update_scene(scene.id, &SceneUpdate::Downloaded(record))
    }

    /// Downloads every pending scene. Per-scene failures are counted; a
    /// broken catalog aborts with the first invariant error.
    pub fn download_all(&self, n_workers: usize) -> Result<BatchReport, TerraError> {
        let scenes = self
            .store
            .find(&SceneFilter::pending_download(), SceneOrder::AcquiredAsc)?;
        info!(provider = %self.store.provider(), scenes = scenes.len(), "downloading pending scenes");
        let pool = WorkerPool::new(n_workers)?;
        let results = pool.run_scenes(scenes, |scene| scene.id, |scene| self.download_one(&scene));
        BatchReport::from_results("download", results, DownloadOutcome::status)
    }

    /// Downloads one scene by id if it is still pending. `Ok(false)` when no
    /// pending scene has that id or its bytes did not verify.
    pub fn download_single(&self, id: SceneId) -> Result<bool, TerraError> {
        let filter = SceneFilter::pending_download().with_id(id);
        let Some(scene) = self.store.find_one(&filter)? else {
            info!(provider = %self.store.provider(), scene = id, "no pending scene with this id");
            return Ok(false);
        };
        Ok(self.download_one(&scene)?.is_downloaded())
    }
}

fn verify(path: &Path, remote: &RemoteRef) -> Result<Verification, TerraError> {
    let size = fs::metadata(path)
        .map(|m| m.len())
        .map_err(|err| TerraError::Filesystem(format!("{}: {err}", path.display())))?;
    let kind = remote
        .checksum
        .as_ref()
        .map(Checksum::kind)
        .unwrap_or(ChecksumKind::Md5);
    let digest = fs_util::file_digest(path, kind)?;
    let matches = match (&remote.checksum, remote.size) {
        (Some(expected), _) => expected == &digest,
        (None, Some(expected)) => expected == size,
        (None, None) => true,
    };
    Ok(Verification {
        matches,
        digest,
        size,
    })
}

fn remove_file(path: &Path) -> Result<(), TerraError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TerraError::Filesystem(format!("{}: {err}", path.display()))),
    }
}
