use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{ArdRecord, BBox, Scene, SceneId};
use crate::error::TerraError;
use crate::fs_util;
use crate::pool::{BatchReport, ItemStatus, WorkerPool};
use crate::store::{CatalogStore, SceneFilter, SceneOrder, SceneUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reprojection {
    pub epsg: u32,
    pub resolution: f64,
}

/// Everything a converter needs for one scene. Directories exist and are
/// empty when the job is handed over.
#[derive(Debug)]
pub struct ConversionJob<'a> {
    pub scene: &'a Scene,
    pub input: PathBuf,
    pub work_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub reprojection: Option<Reprojection>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionOutput {
    /// Product files to move into the ARD tree.
    pub outputs: Vec<PathBuf>,
    pub footprints: Vec<BBox>,
}

pub trait ArdConverter: Send + Sync {
    fn convert(&self, job: &ConversionJob<'_>) -> Result<ConversionOutput, TerraError>;
}

impl<C: ArdConverter + ?Sized> ArdConverter for &C {
    fn convert(&self, job: &ConversionJob<'_>) -> Result<ConversionOutput, TerraError> {
        (**self).convert(job)
    }
}

#[derive(Debug, Clone)]
pub struct ArdSettings {
    pub ard_root: PathBuf,
    pub work_root: PathBuf,
    pub tmp_root: PathBuf,
    /// Wildcard naming the input artifact inside a scene's download dir.
    pub file_pattern: String,
    pub reprojection: Option<Reprojection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArdOutcome {
    Converted,
    Skipped,
}

pub struct ArdDispatcher<C: ArdConverter> {
    store: CatalogStore,
    converter: C,
    settings: ArdSettings,
}

impl<C: ArdConverter> ArdDispatcher<C> {
    pub fn new(store: CatalogStore, converter: C, settings: ArdSettings) -> Self {
        Self {
            store,
            converter,
            settings,
        }
    }

    pub fn convert_one(&self, scene: &Scene) -> Result<ArdOutcome, TerraError> {
        if !scene.download.done || scene.ard.done || scene.invalid {
            return Ok(ArdOutcome::Skipped);
        }
        let dir_name = scene.dir_name();
        let work_dir = self.settings.work_root.join(&dir_name);
        let tmp_dir = self.settings.tmp_root.join(&dir_name);
        let result = self.convert_in(scene, &work_dir, &tmp_dir);
        for dir in [&work_dir, &tmp_dir] {
            if let Err(err) = fs_util::remove_dir_if_exists(dir) {
                warn!(scene = scene.id, error = %err, "failed to clean up scratch dir");
            }
        }
        result
    }

    fn convert_in(&self, scene: &Scene, work_dir: &Path, tmp_dir: &Path) -> Result<ArdOutcome, TerraError> {
        let started_at = Utc::now();
        for dir in [work_dir, tmp_dir] {
            fs_util::remove_dir_if_exists(dir)?;
            create_dir(dir)?;
        }
        let output_dir = work_dir.join("out");
        create_dir(&output_dir)?;

        let input = self.locate_input(scene, work_dir)?;
        debug!(scene = scene.id, input = %input.display(), "converting to ARD");
        let job = ConversionJob {
            scene,
            input,
            work_dir: work_dir.to_path_buf(),
            tmp_dir: tmp_dir.to_path_buf(),
            output_dir,
            reprojection: self.settings.reprojection,
        };
        let output = self.converter.convert(&job)?;
        if output.outputs.is_empty() {
            return Err(TerraError::Conversion(format!(
                "converter produced no outputs for scene {}",
                scene.id
            )));
        }

        let product_dir = self.settings.ard_root.join(scene.dir_name());
        create_dir(&product_dir)?;
        for file in &output.outputs {
            let name = file.file_name().ok_or_else(|| {
                TerraError::Conversion(format!("output without file name: {}", file.display()))
            })?;
            move_file(file, &product_dir.join(name))?;
        }

        let record = ArdRecord {
            started_at: Some(started_at),
            ended_at: Some(Utc::now()),
            done: true,
            product_path: Some(product_dir.display().to_string()),
        };
        let bbox = BBox::union_all(&output.footprints);
        self.store
            .update_scene(scene.id, &SceneUpdate::ArdReady { record, bbox })?;
        info!(scene = scene.id, product = %product_dir.display(), "ARD product ready");
        Ok(ArdOutcome::Converted)
    }

    /// Exactly one file in the download dir must match the pattern. When
    /// nothing matches but the download is a zip, it is unpacked into the
    /// work dir and the pattern is applied there.
    fn locate_input(&self, scene: &Scene, work_dir: &Path) -> Result<PathBuf, TerraError> {
        let local = scene
            .download
            .local_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| TerraError::MissingInput(format!("scene {} has no download path", scene.id)))?;
        let download_dir = if local.is_dir() {
            local.clone()
        } else {
            local
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| TerraError::MissingInput(local.display().to_string()))?
        };

        let pattern = &self.settings.file_pattern;
        let mut matches = fs_util::find_by_pattern(&download_dir, pattern)?;
        if matches.is_empty() {
            let zips: Vec<PathBuf> = fs_util::find_by_pattern(&download_dir, "*.zip")?;
            if !zips.is_empty() {
                let extract_dir = work_dir.join("extracted");
                for zip in &zips {
                    fs_util::extract_zip(zip, &extract_dir)?;
                }
                matches = fs_util::find_by_pattern(&extract_dir, pattern)?;
            }
        }
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(TerraError::MissingInput(format!(
                "no file matching {pattern} in {}",
                download_dir.display()
            ))),
            n => Err(TerraError::MissingInput(format!(
                "{n} files match {pattern} in {}; expected one",
                download_dir.display()
            ))),
        }
    }

    pub fn convert_all(&self, n_workers: usize) -> Result<BatchReport, TerraError> {
        let scenes = self
            .store
            .find(&SceneFilter::pending_ard(), SceneOrder::AcquiredAsc)?;
        info!(provider = %self.store.provider(), scenes = scenes.len(), "converting scenes to ARD");
        let pool = WorkerPool::new(n_workers)?;
        let results = pool.run_scenes(scenes, |scene| scene.id, |scene| self.convert_one(&scene));
        BatchReport::from_results("ard", results, |outcome| match outcome {
            ArdOutcome::Converted => ItemStatus::Succeeded,
            ArdOutcome::Skipped => ItemStatus::Skipped,
        })
    }

    /// `Ok(false)` when no scene with this id is waiting for conversion.
    pub fn convert_single(&self, id: SceneId) -> Result<bool, TerraError> {
        let filter = SceneFilter::pending_ard().with_id(id);
        let Some(scene) = self.store.find_one(&filter)? else {
            info!(provider = %self.store.provider(), scene = id, "no scene awaiting ARD with this id");
            return Ok(false);
        };
        Ok(self.convert_one(&scene)? == ArdOutcome::Converted)
    }
}

fn create_dir(path: &Path) -> Result<(), TerraError> {
    fs::create_dir_all(path).map_err(|err| TerraError::Filesystem(format!("{}: {err}", path.display())))
}

fn move_file(src: &Path, dest: &Path) -> Result<(), TerraError> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    // Different filesystem.
    fs_util::copy_file_atomic(src, dest)?;
    fs::remove_file(src).map_err(|err| TerraError::Filesystem(format!("{}: {err}", src.display())))
}

/// Runs an external program per scene. Arguments are templates over
/// `{input}`, `{output}`, `{tmp}`, `{work}`, `{epsg}` and `{resolution}`.
/// Files matching `output_pattern` under the output dir become the product;
/// a `footprint.json` holding a bbox there is read as the footprint.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: PathBuf,
    args: Vec<String>,
    output_pattern: String,
}

impl CommandConverter {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, output_pattern: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            output_pattern: output_pattern.into(),
        }
    }

    /// Resolves a bare program name against `PATH`.
    pub fn from_path(name: &str, args: Vec<String>, output_pattern: impl Into<String>) -> Result<Self, TerraError> {
        let candidate = Path::new(name);
        let program = if candidate.components().count() > 1 {
            candidate.to_path_buf()
        } else {
            find_in_path(name).ok_or_else(|| TerraError::MissingTool(name.to_string()))?
        };
        Ok(Self::new(program, args, output_pattern))
    }

    fn render_args(&self, job: &ConversionJob<'_>) -> Vec<String> {
        let epsg = job.reprojection.map(|r| r.epsg.to_string()).unwrap_or_default();
        let resolution = job
            .reprojection
            .map(|r| r.resolution.to_string())
            .unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &job.input.display().to_string())
                    .replace("{output}", &job.output_dir.display().to_string())
                    .replace("{tmp}", &job.tmp_dir.display().to_string())
                    .replace("{work}", &job.work_dir.display().to_string())
                    .replace("{epsg}", &epsg)
                    .replace("{resolution}", &resolution)
            })
            .collect()
    }

    fn run_cmd(&self, args: &[String], cwd: &Path) -> Result<(), TerraError> {
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|err| TerraError::Conversion(format!("{}: {err}", self.program.display())))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {} ({})", self.program.display(), output.status)
        } else {
            stderr
        };
        Err(TerraError::Conversion(message))
    }
}

impl ArdConverter for CommandConverter {
    fn convert(&self, job: &ConversionJob<'_>) -> Result<ConversionOutput, TerraError> {
        let args = self.render_args(job);
        self.run_cmd(&args, &job.work_dir)?;
        let outputs = fs_util::find_by_pattern(&job.output_dir, &self.output_pattern)?;
        let footprint_path = job.output_dir.join("footprint.json");
        let footprints = if footprint_path.is_file() {
            let raw = fs::read(&footprint_path)
                .map_err(|err| TerraError::Filesystem(format!("{}: {err}", footprint_path.display())))?;
            let bbox: BBox = serde_json::from_slice(&raw)?;
            vec![BBox::new(bbox.north, bbox.south, bbox.east, bbox.west)?]
        } else {
            Vec::new()
        };
        Ok(ConversionOutput {
            outputs,
            footprints,
        })
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| [dir.join(format!("{name}.exe")), dir.join(name)])
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::Value;

    use super::*;
    use crate::domain::{DownloadRecord, RemoteRef};

    fn scene() -> Scene {
        let ts = Utc.with_ymd_and_hms(2021, 3, 4, 0, 0, 0).unwrap();
        Scene {
            provider: "gedi".parse().unwrap(),
            id: 3,
            natural_id: "N1".to_string(),
            acquired_at: ts,
            bbox: None,
            remote: RemoteRef {
                url: "https://example.org/N1.h5".to_string(),
                filename: "N1.h5".to_string(),
                checksum: None,
                size: None,
            },
            query_at: ts,
            download: DownloadRecord::default(),
            ard: ArdRecord::default(),
            invalid: false,
            archived: false,
            extended_info: Default::default(),
            extra: Value::Null,
        }
    }

    #[test]
    fn renders_argument_template() {
        let converter = CommandConverter::new(
            "/usr/bin/convert-ard",
            vec![
                "--in={input}".to_string(),
                "{output}".to_string(),
                "-t_srs".to_string(),
                "EPSG:{epsg}".to_string(),
                "-tr={resolution}".to_string(),
            ],
            "*.tif",
        );
        let scene = scene();
        let job = ConversionJob {
            scene: &scene,
            input: PathBuf::from("/dl/N1_3/N1.h5"),
            work_dir: PathBuf::from("/work/N1_3"),
            tmp_dir: PathBuf::from("/tmp/N1_3"),
            output_dir: PathBuf::from("/work/N1_3/out"),
            reprojection: Some(Reprojection {
                epsg: 32630,
                resolution: 25.0,
            }),
        };
        assert_eq!(
            converter.render_args(&job),
            vec!["--in=/dl/N1_3/N1.h5", "/work/N1_3/out", "-t_srs", "EPSG:32630", "-tr=25"]
        );
    }
}
