use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{info, warn};

use crate::ard::{ArdConverter, ArdDispatcher, ArdOutcome, ArdSettings};
use crate::cache::CacheIndex;
use crate::config::ProviderConfig;
use crate::discovery::{CatalogQuery, Discovery, DiscoveryReport, PurgeReport};
use crate::domain::{PluginRun, Scene, SceneId, SceneState};
use crate::download::{DownloadManager, DownloadSettings};
use crate::error::TerraError;
use crate::plugins::{PluginRunner, SceneAnalysis};
use crate::pool::{BatchReport, ItemStatus, WorkerPool};
use crate::store::{CatalogStore, CatalogSummary, ImportResult, ResetScope, SceneFilter, SceneOrder};
use crate::transport::Transport;
use crate::usage::{UsageFlags, UsageLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Download,
    Ard,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub provider: String,
    pub stage: String,
    #[serde(flatten)]
    pub batch: BatchReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct SceneProcessReport {
    pub scene: SceneId,
    pub state: SceneState,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginReport {
    pub provider: String,
    pub plugin: String,
    pub completed: usize,
    pub succeeded: usize,
    pub errored: usize,
    pub runs: Vec<PluginRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminReport {
    pub provider: String,
    pub action: String,
    pub affected: usize,
}

/// Provider-scoped orchestration of the pipeline stages. Each stage call is
/// wrapped in start/end usage entries.
pub struct Pipeline<Q: CatalogQuery, T: Transport, C: ArdConverter> {
    provider: ProviderConfig,
    store: CatalogStore,
    usage: UsageLog,
    query: Q,
    transport: T,
    converter: C,
    plugins: PluginRunner,
    workers: usize,
}

impl<Q, T, C> Pipeline<Q, T, C>
where
    Q: CatalogQuery,
    T: Transport,
    C: ArdConverter,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: ProviderConfig,
        store: CatalogStore,
        usage: UsageLog,
        query: Q,
        transport: T,
        converter: C,
        plugins: PluginRunner,
        workers: usize,
    ) -> Self {
        Self {
            provider,
            store,
            usage,
            query,
            transport,
            converter,
            plugins,
            workers: workers.max(1),
        }
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    fn logged<R, F, G>(&self, description: &str, stage: F, flags: G) -> Result<R, TerraError>
    where
        F: FnOnce() -> Result<R, TerraError>,
        G: FnOnce(&R) -> UsageFlags,
    {
        let name = &self.provider.name;
        self.usage
            .record(name, &format!("Start: {description}"), UsageFlags::start_block());
        let result = stage();
        match &result {
            Ok(value) => self.usage.record(name, description, flags(value)),
            Err(err) => warn!(provider = %name, stage = description, error = %err, "stage failed"),
        }
        self.usage
            .record(name, &format!("End: {description}"), UsageFlags::end_block());
        result
    }

    fn discovery(&self) -> Discovery<'_, Q> {
        Discovery::new(
            &self.store,
            &self.query,
            self.provider.start_date,
            &self.provider.regions,
        )
    }

    fn download_manager(&self) -> Result<DownloadManager<&T>, TerraError> {
        let cache = CacheIndex::build(&self.provider.cache.dirs, &self.provider.cache.extension)?;
        Ok(DownloadManager::new(
            self.store.clone(),
            &self.transport,
            cache,
            DownloadSettings {
                download_root: self.provider.download_root.clone().into_std_path_buf(),
                cache_mode: self.provider.cache.mode,
            },
        ))
    }

    fn ard_dispatcher(&self) -> Result<ArdDispatcher<&C>, TerraError> {
        let ard = self.provider.ard.as_ref().ok_or_else(|| {
            TerraError::ConfigInvalid(format!("provider {} has no ard section", self.provider.name))
        })?;
        Ok(ArdDispatcher::new(
            self.store.clone(),
            &self.converter,
            ArdSettings {
                ard_root: ard.root.clone().into_std_path_buf(),
                work_root: ard.work.clone().into_std_path_buf(),
                tmp_root: ard.tmp.clone().into_std_path_buf(),
                file_pattern: ard.file_pattern.clone(),
                reprojection: ard.reprojection,
            },
        ))
    }

    fn stage_report(&self, stage: &str, batch: BatchReport) -> StageReport {
        StageReport {
            provider: self.provider.name.to_string(),
            stage: stage.to_string(),
            batch,
        }
    }

    pub fn discover(&self, from_start: bool) -> Result<DiscoveryReport, TerraError> {
        self.logged(
            "Checked for availability of new scenes",
            || self.discovery().check_new(from_start),
            |report| UsageFlags {
                updated_db: true,
                new_scenes: !report.inserted.is_empty(),
                ..UsageFlags::default()
            },
        )
    }

    pub fn purge(&self) -> Result<PurgeReport, TerraError> {
        self.logged(
            "Removed scenes outside the configured regions",
            || self.discovery().purge_non_intersecting(),
            |report| UsageFlags {
                updated_db: !report.removed.is_empty(),
                ..UsageFlags::default()
            },
        )
    }

    pub fn download_all(&self) -> Result<StageReport, TerraError> {
        let batch = self.logged(
            "Downloaded available scenes",
            || self.download_manager()?.download_all(self.workers),
            |batch| UsageFlags {
                updated_db: batch.succeeded > 0,
                downloaded: batch.succeeded > 0,
                ..UsageFlags::default()
            },
        )?;
        Ok(self.stage_report("download", batch))
    }

    pub fn download_single(&self, id: SceneId) -> Result<bool, TerraError> {
        self.logged(
            &format!("Downloaded scene {id}"),
            || self.download_manager()?.download_single(id),
            |done| UsageFlags {
                updated_db: *done,
                downloaded: *done,
                ..UsageFlags::default()
            },
        )
    }

    pub fn convert_all(&self) -> Result<StageReport, TerraError> {
        let batch = self.logged(
            "Converted downloaded scenes to ARD",
            || self.ard_dispatcher()?.convert_all(self.workers),
            |batch| UsageFlags {
                updated_db: batch.succeeded > 0,
                converted: batch.succeeded > 0,
                ..UsageFlags::default()
            },
        )?;
        Ok(self.stage_report("ard", batch))
    }

    pub fn convert_single(&self, id: SceneId) -> Result<bool, TerraError> {
        self.logged(
            &format!("Converted scene {id} to ARD"),
            || self.ard_dispatcher()?.convert_single(id),
            |done| UsageFlags {
                updated_db: *done,
                converted: *done,
                ..UsageFlags::default()
            },
        )
    }

    pub fn analyze_all(&self) -> Result<StageReport, TerraError> {
        let batch = self.logged(
            "Ran analysis plugins",
            || self.plugins.run_all(self.workers),
            |batch| UsageFlags {
                updated_db: batch.attempted > 0,
                analysed: batch.succeeded > 0,
                ..UsageFlags::default()
            },
        )?;
        Ok(self.stage_report("analyze", batch))
    }

    /// `Ok(None)` when the scene is not ARD-ready.
    pub fn analyze_single(&self, id: SceneId) -> Result<Option<SceneAnalysis>, TerraError> {
        let filter = SceneFilter::ard_ready().with_id(id);
        let Some(scene) = self.store.find_one(&filter)? else {
            info!(provider = %self.provider.name, scene = id, "scene is not ready for analysis");
            return Ok(None);
        };
        self.logged(
            &format!("Ran analysis plugins on scene {id}"),
            || self.plugins.run_one(&scene).map(Some),
            |summary| UsageFlags {
                analysed: summary.is_some_and(|s| s.performed > 0),
                ..UsageFlags::default()
            },
        )
    }

    pub fn scene_needs_processing(&self, scene: &Scene) -> Result<bool, TerraError> {
        if scene.invalid {
            return Ok(false);
        }
        if !scene.download.done {
            return Ok(true);
        }
        if !scene.ard.done {
            return Ok(self.provider.ard.is_some());
        }
        self.plugins.scene_needs_analysis(scene)
    }

    pub fn scenes_needing_processing(&self) -> Result<Vec<SceneId>, TerraError> {
        let filter = SceneFilter {
            invalid: Some(false),
            ..SceneFilter::default()
        };
        let mut ids = Vec::new();
        for scene in self.store.find(&filter, SceneOrder::AcquiredAsc)? {
            if self.scene_needs_processing(&scene)? {
                ids.push(scene.id);
            }
        }
        Ok(ids)
    }

    /// Takes one scene as far through the pipeline as it will go now.
    pub fn process_scene(&self, id: SceneId) -> Result<SceneProcessReport, TerraError> {
        let downloads = self.download_manager()?;
        let ard = self.ard_dispatcher().ok();
        self.process_with(id, &downloads, ard.as_ref())
    }

    fn process_with(
        &self,
        id: SceneId,
        downloads: &DownloadManager<&T>,
        ard: Option<&ArdDispatcher<&C>>,
    ) -> Result<SceneProcessReport, TerraError> {
        let plugin_names = self.plugins.plugin_names();
        let mut scene = self.store.get_scene(id)?;
        let report = |scene: &Scene| SceneProcessReport {
            scene: id,
            state: scene.state(&plugin_names),
        };
        if scene.invalid {
            return Ok(report(&scene));
        }
        if !scene.download.done {
            if !downloads.download_one(&scene)?.is_downloaded() {
                return Ok(report(&scene));
            }
            scene = self.store.get_scene(id)?;
        }
        if !scene.ard.done {
            let Some(ard) = ard else {
                return Ok(report(&scene));
            };
            if ard.convert_one(&scene)? == ArdOutcome::Skipped {
                return Ok(report(&scene));
            }
            scene = self.store.get_scene(id)?;
        }
        self.plugins.run_one(&scene)?;
        let scene = self.store.get_scene(id)?;
        Ok(report(&scene))
    }

    /// Runs every scene that still has work through all remaining stages.
    pub fn process_all(&self) -> Result<StageReport, TerraError> {
        let batch = self.logged(
            "Processed scenes through all stages",
            || {
                let ids = self.scenes_needing_processing()?;
                let downloads = self.download_manager()?;
                let ard = self.ard_dispatcher().ok();
                let final_state = if self.provider.ard.is_none() {
                    SceneState::Downloaded
                } else {
                    SceneState::Analyzed
                };
                let pool = WorkerPool::new(self.workers)?;
                let results =
                    pool.run_scenes(ids, |id| *id, |id| self.process_with(id, &downloads, ard.as_ref()));
                BatchReport::from_results("process", results, |report| {
                    if report.state == final_state {
                        ItemStatus::Succeeded
                    } else {
                        ItemStatus::Failed
                    }
                })
            },
            |batch| UsageFlags {
                updated_db: batch.attempted > 0,
                downloaded: batch.succeeded > 0,
                converted: batch.succeeded > 0,
                analysed: batch.succeeded > 0,
                ..UsageFlags::default()
            },
        )?;
        Ok(self.stage_report("process", batch))
    }

    /// Discovery followed by every per-scene stage, each logged separately.
    pub fn run_all_stages(&self, from_start: bool) -> Result<Vec<StageReport>, TerraError> {
        let discovered = self.discover(from_start)?;
        info!(provider = %self.provider.name, inserted = discovered.inserted.len(), "discovery done");
        let mut reports = vec![self.download_all()?];
        if self.provider.ard.is_some() {
            reports.push(self.convert_all()?);
        }
        reports.push(self.analyze_all()?);
        Ok(reports)
    }

    pub fn status(&self) -> Result<CatalogSummary, TerraError> {
        self.store.summary(&self.plugins.plugin_names())
    }

    pub fn plugin_report(&self, plugin: &str) -> Result<PluginReport, TerraError> {
        let runs = self.store.plugin_runs_for(plugin)?;
        Ok(PluginReport {
            provider: self.provider.name.to_string(),
            plugin: plugin.to_string(),
            completed: runs.iter().filter(|r| r.completed).count(),
            succeeded: runs.iter().filter(|r| r.success).count(),
            errored: runs.iter().filter(|r| r.error).count(),
            runs,
        })
    }

    pub fn reset_scene(&self, id: SceneId, scope: ResetScope) -> Result<AdminReport, TerraError> {
        self.store.reset_scene(id, scope)?;
        self.usage.record(
            &self.provider.name,
            &format!("Reset scene {id}"),
            UsageFlags {
                updated_db: true,
                ..UsageFlags::default()
            },
        );
        Ok(self.admin("reset", 1))
    }

    pub fn reset_analysis(
        &self,
        plugins: Option<&[String]>,
        scene: Option<SceneId>,
    ) -> Result<AdminReport, TerraError> {
        let removed = self.plugins.reset_analysis(plugins, scene)?;
        Ok(self.admin("reset-analysis", removed))
    }

    pub fn archive(&self, new_root: Option<&Utf8Path>) -> Result<AdminReport, TerraError> {
        let touched = self.store.mark_downloads_archived(new_root)?;
        Ok(self.admin("archive", touched))
    }

    pub fn relocate(&self, kind: PathKind, from: &str, to: &str) -> Result<AdminReport, TerraError> {
        let touched = match kind {
            PathKind::Download => self.store.rewrite_download_paths(from, to)?,
            PathKind::Ard => self.store.rewrite_ard_paths(from, to)?,
        };
        Ok(self.admin("relocate", touched))
    }

    pub fn export(&self, path: &Utf8Path) -> Result<AdminReport, TerraError> {
        let count = self.store.export_json(path)?;
        Ok(self.admin("export", count))
    }

    pub fn import(
        &self,
        path: &Utf8Path,
        replace: &BTreeMap<String, String>,
    ) -> Result<ImportResult, TerraError> {
        let result = self.store.import_json(path, replace)?;
        self.usage.record(
            &self.provider.name,
            "Imported scenes from export",
            UsageFlags {
                updated_db: result.imported > 0,
                new_scenes: result.imported > 0,
                ..UsageFlags::default()
            },
        );
        Ok(result)
    }

    fn admin(&self, action: &str, affected: usize) -> AdminReport {
        AdminReport {
            provider: self.provider.name.to_string(),
            action: action.to_string(),
            affected,
        }
    }
}
