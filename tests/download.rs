use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use terra_dm::ard::{ArdConverter, ArdDispatcher, ArdOutcome, ArdSettings, ConversionJob, ConversionOutput};
use terra_dm::cache::{CacheIndex, CacheMode};
use terra_dm::domain::{Checksum, ChecksumKind, NewScene, RemoteRef};
use terra_dm::download::{DownloadManager, DownloadOutcome, DownloadSettings};
use terra_dm::error::TerraError;
use terra_dm::store::CatalogStore;
use terra_dm::transport::Transport;

const PAYLOAD: &[u8] = b"hello world";
const PAYLOAD_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

/// Serves in-memory payloads by URL. With `cut_after` set, the next call
/// writes only that many bytes and then fails, like a dropped connection.
#[derive(Default)]
struct MockTransport {
    payloads: HashMap<String, Vec<u8>>,
    cut_after: Mutex<Option<usize>>,
    calls: Mutex<Vec<(String, u64)>>,
}

impl MockTransport {
    fn serving(url: &str, body: &[u8]) -> Self {
        Self {
            payloads: HashMap::from([(url.to_string(), body.to_vec())]),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn fetch(&self, url: &str, dest: &Path, resume_from: u64) -> Result<u64, TerraError> {
        self.calls.lock().unwrap().push((url.to_string(), resume_from));
        let body = self
            .payloads
            .get(url)
            .ok_or_else(|| TerraError::ProviderStatus {
                status: 404,
                message: url.to_string(),
            })?;
        let start = usize::try_from(resume_from).unwrap().min(body.len());
        let mut rest = &body[start..];
        let cut = self.cut_after.lock().unwrap().take();
        if let Some(cut) = cut {
            rest = &rest[..cut.min(rest.len())];
        }
        let mut file = OpenOptions::new().create(true).append(true).open(dest).unwrap();
        file.write_all(rest).unwrap();
        if cut.is_some() {
            return Err(TerraError::Transfer("connection reset".to_string()));
        }
        Ok(fs::metadata(dest).unwrap().len())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: CatalogStore,
    root: PathBuf,
    cache_root: PathBuf,
}

fn fixture(remotes: &[(&str, Option<Checksum>, Option<u64>)]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Utf8PathBuf::from_path_buf(dir.path().join("catalog.sqlite")).unwrap();
    let store = CatalogStore::open(db, "gedi".parse().unwrap()).unwrap();
    let acquired = Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).unwrap();
    let rows: Vec<NewScene> = remotes
        .iter()
        .map(|(name, checksum, size)| NewScene {
            natural_id: name.to_string(),
            acquired_at: acquired,
            bbox: None,
            remote: RemoteRef {
                url: format!("https://example.org/{name}.h5"),
                filename: format!("{name}.h5"),
                checksum: checksum.clone(),
                size: *size,
            },
            query_at: acquired,
            extra: Value::Null,
        })
        .collect();
    store.insert_scenes(&rows).unwrap();
    let root = dir.path().join("raw");
    let cache_root = dir.path().join("cache");
    fs::create_dir_all(&cache_root).unwrap();
    Fixture {
        store,
        root,
        cache_root,
        _dir: dir,
    }
}

fn manager<'a>(fx: &Fixture, transport: &'a MockTransport) -> DownloadManager<&'a MockTransport> {
    let cache = CacheIndex::build(&[fx.cache_root.as_path()], ".h5").unwrap();
    DownloadManager::new(
        fx.store.clone(),
        transport,
        cache,
        DownloadSettings {
            download_root: fx.root.clone(),
            cache_mode: CacheMode::Copy,
        },
    )
}

fn md5() -> Option<Checksum> {
    Some(Checksum::new(ChecksumKind::Md5, PAYLOAD_MD5).unwrap())
}

#[test]
fn fetches_verifies_and_records() {
    let fx = fixture(&[("S1", md5(), None)]);
    let transport = MockTransport::serving("https://example.org/S1.h5", PAYLOAD);
    let report = manager(&fx, &transport).download_all(1).unwrap();
    assert_eq!(report.succeeded, 1);

    let scene = fx.store.get_scene(0).unwrap();
    assert!(scene.download.done);
    let local = PathBuf::from(scene.download.local_path.unwrap());
    assert_eq!(local, fx.root.join("S1_0").join("S1.h5"));
    assert_eq!(fs::read(&local).unwrap(), PAYLOAD);
    assert!(!fx.root.join("S1_0").join("S1.h5.part").exists());
    assert_eq!(scene.download.checksum, md5());
    assert_eq!(scene.download.size, Some(PAYLOAD.len() as u64));
}

#[test]
fn interrupted_transfer_resumes_from_partial_bytes() {
    let fx = fixture(&[("S1", md5(), Some(PAYLOAD.len() as u64))]);
    let transport = MockTransport::serving("https://example.org/S1.h5", PAYLOAD);
    *transport.cut_after.lock().unwrap() = Some(5);

    let first = manager(&fx, &transport).download_all(1).unwrap();
    assert_eq!(first.failed, 1);
    assert!(!fx.store.get_scene(0).unwrap().download.done);
    let part = fx.root.join("S1_0").join("S1.h5.part");
    assert_eq!(fs::metadata(&part).unwrap().len(), 5);

    let second = manager(&fx, &transport).download_all(1).unwrap();
    assert_eq!(second.succeeded, 1);
    assert_eq!(transport.calls().last().unwrap().1, 5);
    assert!(fx.store.get_scene(0).unwrap().download.done);
}

#[test]
fn complete_partial_file_is_finalised_without_network() {
    let fx = fixture(&[("S1", None, Some(PAYLOAD.len() as u64))]);
    let dir = fx.root.join("S1_0");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("S1.h5.part"), PAYLOAD).unwrap();

    let transport = MockTransport::default();
    let scene = fx.store.get_scene(0).unwrap();
    let outcome = manager(&fx, &transport).download_one(&scene).unwrap();
    assert_eq!(outcome, DownloadOutcome::Fetched);
    assert!(transport.calls().is_empty());
    assert!(dir.join("S1.h5").is_file());
}

#[test]
fn checksum_mismatch_is_rejected_and_discarded() {
    let wrong = Checksum::new(ChecksumKind::Md5, "00000000000000000000000000000000").unwrap();
    let fx = fixture(&[("S1", Some(wrong), None)]);
    let transport = MockTransport::serving("https://example.org/S1.h5", PAYLOAD);
    let scene = fx.store.get_scene(0).unwrap();

    let outcome = manager(&fx, &transport).download_one(&scene).unwrap();
    assert_eq!(outcome, DownloadOutcome::Rejected);
    assert!(!fx.store.get_scene(0).unwrap().download.done);
    assert!(!fx.root.join("S1_0").join("S1.h5.part").exists());
    assert!(!fx.root.join("S1_0").join("S1.h5").exists());
}

#[test]
fn cache_hit_skips_the_network() {
    let fx = fixture(&[("S1", md5(), None)]);
    fs::write(fx.cache_root.join("S1.h5"), PAYLOAD).unwrap();
    let transport = MockTransport::default();
    let scene = fx.store.get_scene(0).unwrap();

    let outcome = manager(&fx, &transport).download_one(&scene).unwrap();
    assert_eq!(outcome, DownloadOutcome::CacheHit);
    assert!(transport.calls().is_empty());
    assert!(fx.store.get_scene(0).unwrap().download.done);
}

#[test]
fn corrupt_cache_entry_falls_back_to_fetch() {
    let fx = fixture(&[("S1", md5(), None)]);
    fs::write(fx.cache_root.join("S1.h5"), b"stale bytes").unwrap();
    let transport = MockTransport::serving("https://example.org/S1.h5", PAYLOAD);
    let scene = fx.store.get_scene(0).unwrap();

    let outcome = manager(&fx, &transport).download_one(&scene).unwrap();
    assert_eq!(outcome, DownloadOutcome::Fetched);
    assert_eq!(transport.calls().len(), 1);
}

#[test]
fn verified_file_on_disk_is_recorded() {
    let fx = fixture(&[("S1", md5(), None)]);
    let dir = fx.root.join("S1_0");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("S1.h5"), PAYLOAD).unwrap();
    let transport = MockTransport::default();
    let scene = fx.store.get_scene(0).unwrap();

    let outcome = manager(&fx, &transport).download_one(&scene).unwrap();
    assert_eq!(outcome, DownloadOutcome::AlreadyPresent);
    assert!(transport.calls().is_empty());
}

#[test]
fn single_download_of_unknown_or_finished_scene_is_false() {
    let fx = fixture(&[("S1", md5(), None), ("S2", None, None)]);
    let transport = MockTransport::serving("https://example.org/S1.h5", PAYLOAD);
    let downloads = manager(&fx, &transport);

    assert!(!downloads.download_single(42).unwrap());
    assert!(downloads.download_single(0).unwrap());
    assert!(!downloads.download_single(0).unwrap());
    assert_eq!(transport.calls().len(), 1);
}

#[test]
fn parallel_workers_download_every_scene() {
    let names = ["S1", "S2", "S3", "S4", "S5"];
    let remotes: Vec<_> = names.iter().map(|n| (*n, md5(), None)).collect();
    let fx = fixture(&remotes);
    let mut transport = MockTransport::default();
    for name in names {
        transport
            .payloads
            .insert(format!("https://example.org/{name}.h5"), PAYLOAD.to_vec());
    }

    let report = manager(&fx, &transport).download_all(3).unwrap();
    assert_eq!(report.attempted, 5);
    assert_eq!(report.succeeded, 5);
    assert_eq!(fx.store.summary::<&str>(&[]).unwrap().downloaded, 5);
}

struct CopyConverter;

impl ArdConverter for CopyConverter {
    fn convert(&self, job: &ConversionJob<'_>) -> Result<ConversionOutput, TerraError> {
        let out = job.output_dir.join("product.tif");
        fs::copy(&job.input, &out).unwrap();
        Ok(ConversionOutput {
            outputs: vec![out],
            footprints: Vec::new(),
        })
    }
}

#[cfg(unix)]
#[test]
fn symlinked_cache_hit_can_be_converted() {
    let fx = fixture(&[("X", md5(), None)]);
    // The cache root itself holds a link into a shared archive.
    let archive = fx.cache_root.parent().unwrap().join("archive");
    fs::create_dir_all(&archive).unwrap();
    fs::write(archive.join("X.h5"), PAYLOAD).unwrap();
    std::os::unix::fs::symlink(archive.join("X.h5"), fx.cache_root.join("X.h5")).unwrap();

    let transport = MockTransport::default();
    let manager = DownloadManager::new(
        fx.store.clone(),
        &transport,
        CacheIndex::build(&[fx.cache_root.as_path()], ".h5").unwrap(),
        DownloadSettings {
            download_root: fx.root.clone(),
            cache_mode: CacheMode::Symlink,
        },
    );
    let scene = fx.store.get_scene(0).unwrap();
    assert_eq!(manager.download_one(&scene).unwrap(), DownloadOutcome::CacheHit);
    assert!(transport.calls().is_empty());
    let placed = fx.root.join("X_0").join("X.h5");
    assert!(fs::symlink_metadata(&placed).unwrap().file_type().is_symlink());

    let work = fx.root.parent().unwrap().to_path_buf();
    let dispatcher = ArdDispatcher::new(
        fx.store.clone(),
        CopyConverter,
        ArdSettings {
            ard_root: work.join("ard"),
            work_root: work.join("work"),
            tmp_root: work.join("tmp"),
            file_pattern: "*.h5".to_string(),
            reprojection: None,
        },
    );
    let scene = fx.store.get_scene(0).unwrap();
    assert_eq!(dispatcher.convert_one(&scene).unwrap(), ArdOutcome::Converted);
    let scene = fx.store.get_scene(0).unwrap();
    assert!(scene.ard.done);
    let product = PathBuf::from(scene.ard.product_path.unwrap());
    assert_eq!(fs::read(product.join("product.tif")).unwrap(), PAYLOAD);
}
