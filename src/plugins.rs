use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::domain::{ExtendedInfo, PluginRunFields, ProviderName, Scene, SceneId};
use crate::error::TerraError;
use crate::fs_util;
use crate::pool::{BatchReport, ItemStatus, WorkerPool, panic_message};
use crate::store::{CatalogStore, SceneFilter, SceneOrder};

/// Read-only view of the pipeline handed to every plugin call.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub provider: ProviderName,
    pub download_root: PathBuf,
    pub ard_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginOutcome {
    pub success: bool,
    /// Stored under `extended_info[<plugin name>]`; `true` when absent.
    pub output: Option<Value>,
}

impl PluginOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
        }
    }
}

pub trait AnalysisPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn set_params(&mut self, _params: &Value) -> Result<(), TerraError> {
        Ok(())
    }

    /// `prior` holds the outputs of plugins that already ran on this scene.
    fn perform(
        &self,
        scene: &Scene,
        ctx: &PipelineContext,
        prior: &ExtendedInfo,
    ) -> Result<PluginOutcome, TerraError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

pub type PluginFactory = Box<dyn Fn() -> Box<dyn AnalysisPlugin> + Send + Sync>;

#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ArdInventoryPlugin::NAME, || Box::new(ArdInventoryPlugin::default()));
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn AnalysisPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiates the configured plugins in order, passing each its params.
    pub fn resolve(&self, configs: &[PluginConfig]) -> Result<Vec<Box<dyn AnalysisPlugin>>, TerraError> {
        let mut seen = HashSet::new();
        configs
            .iter()
            .map(|config| {
                if !seen.insert(config.name.as_str()) {
                    return Err(TerraError::ConfigInvalid(format!(
                        "plugin {} configured twice",
                        config.name
                    )));
                }
                let factory = self
                    .factories
                    .get(&config.name)
                    .ok_or_else(|| TerraError::UnknownPlugin(config.name.clone()))?;
                let mut plugin = factory();
                if !config.params.is_null() {
                    plugin.set_params(&config.params)?;
                }
                Ok(plugin)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SceneAnalysis {
    pub performed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SceneAnalysis {
    fn status(&self) -> ItemStatus {
        if self.failed > 0 {
            ItemStatus::Failed
        } else if self.performed > 0 {
            ItemStatus::Succeeded
        } else {
            ItemStatus::Skipped
        }
    }
}

pub struct PluginRunner {
    store: CatalogStore,
    plugins: Vec<Box<dyn AnalysisPlugin>>,
    ctx: PipelineContext,
}

impl PluginRunner {
    pub fn new(store: CatalogStore, plugins: Vec<Box<dyn AnalysisPlugin>>, ctx: PipelineContext) -> Self {
        Self {
            store,
            plugins,
            ctx,
        }
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Valid ARD-ready scenes missing a completed run of a configured plugin.
    pub fn scenes_needing_analysis(&self) -> Result<Vec<Scene>, TerraError> {
        if self.plugins.is_empty() {
            return Ok(Vec::new());
        }
        let completed = self.store.completed_plugins()?;
        let scenes = self
            .store
            .find(&SceneFilter::ard_ready(), SceneOrder::AcquiredAsc)?;
        Ok(scenes
            .into_iter()
            .filter(|scene| {
                let done = completed.get(&scene.id);
                self.plugins
                    .iter()
                    .any(|p| !done.is_some_and(|names| names.contains(p.name())))
            })
            .collect())
    }

    pub fn scene_needs_analysis(&self, scene: &Scene) -> Result<bool, TerraError> {
        if self.plugins.is_empty() || !scene.ard.done || scene.invalid {
            return Ok(false);
        }
        let done = self.completed_for(scene.id)?;
        Ok(self.plugins.iter().any(|p| !done.contains(p.name())))
    }

    fn completed_for(&self, scene_id: SceneId) -> Result<HashSet<String>, TerraError> {
        Ok(self
            .store
            .plugin_runs(scene_id)?
            .into_iter()
            .filter(|run| run.completed)
            .map(|run| run.plugin)
            .collect())
    }

    /// Runs every configured plugin that has not completed on `scene`. A
    /// plugin error or panic is recorded against that plugin and the next
    /// one still runs.
    pub fn run_one(&self, scene: &Scene) -> Result<SceneAnalysis, TerraError> {
        let mut summary = SceneAnalysis::default();
        if !scene.ard.done || scene.invalid {
            summary.skipped = self.plugins.len();
            return Ok(summary);
        }
        let done = self.completed_for(scene.id)?;
        let mut prior = scene.extended_info.clone();

        for plugin in &self.plugins {
            let name = plugin.name();
            if done.contains(name) {
                summary.skipped += 1;
                continue;
            }
            let started_at = Some(Utc::now());
            self.store.upsert_plugin_run(
                scene.id,
                name,
                &PluginRunFields {
                    started_at,
                    ..PluginRunFields::default()
                },
            )?;
            debug!(scene = scene.id, plugin = name, "running plugin");

            let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                plugin.perform(scene, &self.ctx, &prior)
            }));
            let failure = match attempt {
                Ok(Ok(outcome)) => {
                    let value = outcome.output.unwrap_or(Value::Bool(true));
                    let fields = PluginRunFields {
                        started_at,
                        ended_at: Some(Utc::now()),
                        completed: true,
                        success: outcome.success,
                        error: false,
                        output: Some(value.clone()),
                    };
                    self.store
                        .record_plugin_result(scene.id, name, &fields, Some(&value))?;
                    prior.insert(name.to_string(), value);
                    summary.performed += 1;
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            warn!(scene = scene.id, plugin = name, error = %failure, "plugin failed");
            let fields = PluginRunFields {
                started_at,
                ended_at: Some(Utc::now()),
                completed: false,
                success: false,
                error: true,
                output: Some(json!({ "error": failure })),
            };
            self.store.upsert_plugin_run(scene.id, name, &fields)?;
            summary.failed += 1;
        }
        Ok(summary)
    }

    pub fn run_all(&self, n_workers: usize) -> Result<BatchReport, TerraError> {
        let scenes = self.scenes_needing_analysis()?;
        info!(provider = %self.store.provider(), scenes = scenes.len(), "running analysis plugins");
        let pool = WorkerPool::new(n_workers)?;
        let results = pool.run_scenes(scenes, |scene| scene.id, |scene| self.run_one(&scene));
        BatchReport::from_results("analysis", results, SceneAnalysis::status)
    }

    pub fn reset_analysis(
        &self,
        plugins: Option<&[String]>,
        scene_id: Option<SceneId>,
    ) -> Result<usize, TerraError> {
        let removed = self.store.reset_analysis(plugins, scene_id)?;
        info!(provider = %self.store.provider(), removed, "plugin results reset");
        Ok(removed)
    }
}


/// Lists the files of a scene's ARD product with their sizes.
#[derive(Debug, Clone)]
pub struct ArdInventoryPlugin {
    pattern: String,
}

impl ArdInventoryPlugin {
    pub const NAME: &'static str = "ard_inventory";
}

impl Default for ArdInventoryPlugin {
    fn default() -> Self {
        Self {
            pattern: "*".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InventoryParams {
    #[serde(default)]
    pattern: Option<String>,
}

impl AnalysisPlugin for ArdInventoryPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn set_params(&mut self, params: &Value) -> Result<(), TerraError> {
        let params: InventoryParams = serde_json::from_value(params.clone())
            .map_err(|err| TerraError::ConfigInvalid(format!("{}: {err}", Self::NAME)))?;
        if let Some(pattern) = params.pattern {
            fs_util::wildcard_regex(&pattern)?;
            self.pattern = pattern;
        }
        Ok(())
    }

    fn perform(
        &self,
        scene: &Scene,
        _ctx: &PipelineContext,
        _prior: &ExtendedInfo,
    ) -> Result<PluginOutcome, TerraError> {
        let product = scene.ard.product_path.as_deref().ok_or_else(|| {
            TerraError::MissingInput(format!("scene {} has no ARD product", scene.id))
        })?;
        let product = Path::new(product);
        let mut files = Vec::new();
        let mut total: u64 = 0;
        for path in fs_util::find_by_pattern(product, &self.pattern)? {
            let size = std::fs::metadata(&path)
                .map(|m| m.len())
                .map_err(|err| TerraError::Filesystem(format!("{}: {err}", path.display())))?;
            total += size;
            let name = path
                .strip_prefix(product)
                .unwrap_or(&path)
                .display()
                .to_string();
            files.push(json!({ "name": name, "size": size }));
        }
        Ok(PluginOutcome::ok(json!({
            "files": files,
            "total_bytes": total,
        })))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn resolve_rejects_unknown_and_duplicate() {
        let registry = PluginRegistry::with_builtin();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["ard_inventory"]);

        let unknown = PluginConfig {
            name: "ndvi".to_string(),
            params: Value::Null,
        };
        assert_matches!(
            registry.resolve(&[unknown]).err(),
            Some(TerraError::UnknownPlugin(_))
        );

        let inventory = PluginConfig {
            name: "ard_inventory".to_string(),
            params: json!({ "pattern": "*.tif" }),
        };
        assert_matches!(
            registry.resolve(&[inventory.clone(), inventory]).err(),
            Some(TerraError::ConfigInvalid(_))
        );
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| -> u8 { panic!("boom {}", 7) }).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");
    }
}
