use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use terra_dm::ard::{ArdConverter, ArdDispatcher, ArdOutcome, ArdSettings, ConversionJob, ConversionOutput};
use terra_dm::domain::{BBox, DownloadRecord, NewScene, RemoteRef};
use terra_dm::error::TerraError;
use terra_dm::store::{CatalogStore, SceneUpdate};

/// Writes one product file per call and reports the given footprints.
#[derive(Default)]
struct MockConverter {
    footprints: Vec<BBox>,
    fail: bool,
    inputs: Mutex<Vec<PathBuf>>,
}

impl ArdConverter for MockConverter {
    fn convert(&self, job: &ConversionJob<'_>) -> Result<ConversionOutput, TerraError> {
        self.inputs.lock().unwrap().push(job.input.clone());
        assert!(job.work_dir.is_dir() && job.tmp_dir.is_dir());
        if self.fail {
            return Err(TerraError::Conversion("gdal exploded".to_string()));
        }
        let product = job.output_dir.join(format!("{}_ard.tif", job.scene.natural_id));
        fs::write(&product, b"tif").unwrap();
        Ok(ConversionOutput {
            outputs: vec![product],
            footprints: self.footprints.clone(),
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: CatalogStore,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Utf8PathBuf::from_path_buf(dir.path().join("catalog.sqlite")).unwrap();
        let store = CatalogStore::open(db, "sentinel2".parse().unwrap()).unwrap();
        let root = dir.path().to_path_buf();
        Self {
            _dir: dir,
            store,
            root,
        }
    }

    /// Inserts a scene and marks it downloaded with `files` in its dir.
    fn downloaded_scene(&self, natural_id: &str, files: &[(&str, &[u8])]) -> i64 {
        let acquired = Utc.with_ymd_and_hms(2022, 7, 1, 0, 0, 0).unwrap();
        let id = self
            .store
            .insert_scenes(&[NewScene {
                natural_id: natural_id.to_string(),
                acquired_at: acquired,
                bbox: None,
                remote: RemoteRef {
                    url: format!("https://example.org/{natural_id}.zip"),
                    filename: files[0].0.to_string(),
                    checksum: None,
                    size: None,
                },
                query_at: acquired,
                extra: Value::Null,
            }])
            .unwrap()[0];
        let dir = self.root.join("raw").join(format!("{natural_id}_{id}"));
        fs::create_dir_all(&dir).unwrap();
        for (name, body) in files {
            fs::write(dir.join(name), body).unwrap();
        }
        self.store
            .update_scene(
                id,
                &SceneUpdate::Downloaded(DownloadRecord {
                    done: true,
                    local_path: Some(dir.join(files[0].0).display().to_string()),
                    ..DownloadRecord::default()
                }),
            )
            .unwrap();
        id
    }

    fn dispatcher<'a>(&self, converter: &'a MockConverter, pattern: &str) -> ArdDispatcher<&'a MockConverter> {
        ArdDispatcher::new(
            self.store.clone(),
            converter,
            ArdSettings {
                ard_root: self.root.join("ard"),
                work_root: self.root.join("work"),
                tmp_root: self.root.join("tmp"),
                file_pattern: pattern.to_string(),
                reprojection: None,
            },
        )
    }
}

fn zip_with(path: &Path, entries: &[(&str, &[u8])]) -> Vec<u8> {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, body) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(body).unwrap();
    }
    zip.finish().unwrap();
    fs::read(path).unwrap()
}

#[test]
fn converts_and_records_union_footprint() {
    let fx = Fixture::new();
    let id = fx.downloaded_scene("T31UFQ", &[("T31UFQ.SAFE.tif", b"raw")]);
    let converter = MockConverter {
        footprints: vec![
            BBox::new(50.0, 49.0, 3.0, 2.0).unwrap(),
            BBox::new(49.5, 48.0, 4.0, 2.5).unwrap(),
        ],
        ..MockConverter::default()
    };

    assert!(fx.dispatcher(&converter, "*.tif").convert_single(id).unwrap());
    let scene = fx.store.get_scene(id).unwrap();
    assert!(scene.ard.done);
    let product = PathBuf::from(scene.ard.product_path.unwrap());
    assert_eq!(product, fx.root.join("ard").join("T31UFQ_0"));
    assert!(product.join("T31UFQ_ard.tif").is_file());
    assert_eq!(scene.bbox, Some(BBox::new(50.0, 48.0, 4.0, 2.0).unwrap()));
    assert!(!fx.root.join("work").join("T31UFQ_0").exists());
    assert!(!fx.root.join("tmp").join("T31UFQ_0").exists());
}

#[test]
fn converter_failure_leaves_scene_pending_and_cleans_scratch() {
    let fx = Fixture::new();
    let id = fx.downloaded_scene("T31UFQ", &[("T31UFQ.tif", b"raw")]);
    let converter = MockConverter {
        fail: true,
        ..MockConverter::default()
    };

    let report = fx.dispatcher(&converter, "*.tif").convert_all(1).unwrap();
    assert_eq!(report.failed, 1);
    assert!(!fx.store.get_scene(id).unwrap().ard.done);
    assert!(!fx.root.join("work").join("T31UFQ_0").exists());
}

#[test]
fn ambiguous_or_missing_input_is_an_error() {
    let fx = Fixture::new();
    let two = fx.downloaded_scene("A", &[("A_1.tif", b"x"), ("A_2.tif", b"y")]);
    let none = fx.downloaded_scene("B", &[("B.h5", b"x")]);
    let converter = MockConverter::default();
    let dispatcher = fx.dispatcher(&converter, "*.tif");

    let scene = fx.store.get_scene(two).unwrap();
    assert_matches!(dispatcher.convert_one(&scene), Err(TerraError::MissingInput(_)));
    let scene = fx.store.get_scene(none).unwrap();
    assert_matches!(dispatcher.convert_one(&scene), Err(TerraError::MissingInput(_)));
    assert!(converter.inputs.lock().unwrap().is_empty());
}

#[test]
fn zipped_download_is_unpacked_for_input() {
    let fx = Fixture::new();
    let staging = tempfile::tempdir().unwrap();
    let archive = zip_with(
        &staging.path().join("S2.zip"),
        &[("S2.SAFE/GRANULE/B04.jp2", b"red"), ("S2.SAFE/manifest.xml", b"<m/>")],
    );
    let id = fx.downloaded_scene("S2", &[("S2.zip", &archive)]);
    let converter = MockConverter::default();

    assert!(fx.dispatcher(&converter, "*B04.jp2").convert_single(id).unwrap());
    let inputs = converter.inputs.lock().unwrap();
    assert_eq!(inputs.len(), 1);
    assert!(inputs[0].ends_with("B04.jp2"));
}

#[test]
fn only_downloaded_unconverted_scenes_are_dispatched() {
    let fx = Fixture::new();
    let id = fx.downloaded_scene("A", &[("A.tif", b"x")]);
    let converter = MockConverter::default();
    let dispatcher = fx.dispatcher(&converter, "*.tif");

    assert!(dispatcher.convert_single(id).unwrap());
    assert!(!dispatcher.convert_single(id).unwrap());
    let scene = fx.store.get_scene(id).unwrap();
    assert_eq!(dispatcher.convert_one(&scene).unwrap(), ArdOutcome::Skipped);
    assert_eq!(converter.inputs.lock().unwrap().len(), 1);
}
