use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use terra_dm::discovery::{Candidate, CatalogQuery, Discovery};
use terra_dm::domain::{BBox, DownloadRecord, RemoteRef};
use terra_dm::error::TerraError;
use terra_dm::store::{CatalogStore, SceneFilter, SceneOrder, SceneUpdate};

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 3, d, 0, 0, 0).unwrap()
}

fn candidate(natural_id: &str, d: u32, bbox: Option<BBox>) -> Candidate {
    Candidate {
        natural_id: natural_id.to_string(),
        acquired_at: day(d),
        bbox,
        remote: RemoteRef {
            url: format!("https://example.org/{natural_id}.h5"),
            filename: format!("{natural_id}.h5"),
            checksum: None,
            size: None,
        },
        extra: Value::Null,
    }
}

fn bbox(north: f64, south: f64, east: f64, west: f64) -> BBox {
    BBox::new(north, south, east, west).unwrap()
}

/// Serves a fixed product list, honouring `since` and `bounds` the way a
/// provider catalog would, and records each call.
#[derive(Default)]
struct MockCatalog {
    products: Vec<Candidate>,
    calls: Mutex<Vec<(DateTime<Utc>, Option<BBox>)>>,
    fail: bool,
}

impl CatalogQuery for MockCatalog {
    fn query(&self, since: DateTime<Utc>, bounds: Option<&BBox>) -> Result<Vec<Candidate>, TerraError> {
        self.calls.lock().unwrap().push((since, bounds.copied()));
        if self.fail {
            return Err(TerraError::ProviderStatus {
                status: 503,
                message: "catalog offline".to_string(),
            });
        }
        Ok(self
            .products
            .iter()
            .filter(|c| c.acquired_at >= since)
            .filter(|c| match (bounds, c.bbox) {
                (Some(region), Some(footprint)) => region.intersects(&footprint),
                _ => true,
            })
            .cloned()
            .collect())
    }
}

fn open_store(dir: &tempfile::TempDir) -> CatalogStore {
    let db = Utf8PathBuf::from_path_buf(dir.path().join("catalog.sqlite")).unwrap();
    CatalogStore::open(db, "gedi".parse().unwrap()).unwrap()
}

#[test]
fn first_run_starts_at_configured_date_and_sorts_by_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let catalog = MockCatalog {
        products: vec![candidate("C", 9, None), candidate("A", 2, None), candidate("B", 5, None)],
        ..MockCatalog::default()
    };
    let discovery = Discovery::new(&store, &catalog, day(1), &[]);

    let report = discovery.check_new(false).unwrap();
    assert_eq!(report.since, Some(day(1)));
    assert_eq!(report.inserted, vec![0, 1, 2]);
    let names: Vec<_> = store
        .find(&SceneFilter::all(), SceneOrder::IdAsc)
        .unwrap()
        .into_iter()
        .map(|s| s.natural_id)
        .collect();
    assert_eq!(names, vec!["A", "B", "C"]);
}

#[test]
fn rerun_uses_watermark_and_inserts_nothing_twice() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let catalog = MockCatalog {
        products: vec![candidate("A", 2, None), candidate("B", 5, None)],
        ..MockCatalog::default()
    };
    let discovery = Discovery::new(&store, &catalog, day(1), &[]);
    discovery.check_new(false).unwrap();

    let again = discovery.check_new(false).unwrap();
    assert_eq!(again.since, Some(day(5)));
    assert_eq!(again.candidates, 1);
    assert!(again.inserted.is_empty());

    let from_start = discovery.check_new(true).unwrap();
    assert_eq!(from_start.since, Some(day(1)));
    assert!(from_start.inserted.is_empty());
    assert_eq!(store.count(&SceneFilter::all()).unwrap(), 2);
}

#[test]
fn products_sharing_the_watermark_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let first = MockCatalog {
        products: vec![candidate("A", 5, None)],
        ..MockCatalog::default()
    };
    Discovery::new(&store, &first, day(1), &[]).check_new(false).unwrap();

    let late = MockCatalog {
        products: vec![candidate("A", 5, None), candidate("A2", 5, None), candidate("B", 6, None)],
        ..MockCatalog::default()
    };
    let report = Discovery::new(&store, &late, day(1), &[]).check_new(false).unwrap();
    assert_eq!(report.inserted, vec![1, 2]);
    assert!(store.find_by_natural_id("A2").unwrap().is_some());
}

#[test]
fn regions_are_queried_separately_and_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let regions = [bbox(10.0, 0.0, 10.0, 0.0), bbox(10.0, 0.0, 20.0, 5.0)];
    let catalog = MockCatalog {
        products: vec![
            candidate("both", 2, Some(bbox(8.0, 2.0, 8.0, 6.0))),
            candidate("west", 3, Some(bbox(8.0, 2.0, 2.0, 1.0))),
            candidate("far", 4, Some(bbox(60.0, 50.0, 60.0, 50.0))),
        ],
        ..MockCatalog::default()
    };
    let report = Discovery::new(&store, &catalog, day(1), &regions)
        .check_new(false)
        .unwrap();

    assert_eq!(catalog.calls.lock().unwrap().len(), 2);
    assert_eq!(report.candidates, 3);
    assert_eq!(report.inserted.len(), 2);
    assert!(store.find_by_natural_id("far").unwrap().is_none());
}

#[test]
fn provider_errors_propagate_without_inserting() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let catalog = MockCatalog {
        products: vec![candidate("A", 2, None)],
        fail: true,
        ..MockCatalog::default()
    };
    let result = Discovery::new(&store, &catalog, day(1), &[]).check_new(false);
    assert_matches!(result, Err(TerraError::ProviderStatus { status: 503, .. }));
    assert_eq!(store.count(&SceneFilter::all()).unwrap(), 0);
}

#[test]
fn purge_removes_only_undownloaded_scenes_outside_regions() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let everywhere = MockCatalog {
        products: vec![
            candidate("inside", 2, Some(bbox(5.0, 1.0, 5.0, 1.0))),
            candidate("outside", 3, Some(bbox(60.0, 50.0, 60.0, 50.0))),
            candidate("outside-kept", 4, Some(bbox(60.0, 50.0, 60.0, 50.0))),
            candidate("no-footprint", 5, None),
        ],
        ..MockCatalog::default()
    };
    Discovery::new(&store, &everywhere, day(1), &[])
        .check_new(false)
        .unwrap();
    let kept = store.find_by_natural_id("outside-kept").unwrap().unwrap();
    store
        .update_scene(
            kept.id,
            &SceneUpdate::Downloaded(DownloadRecord {
                done: true,
                local_path: Some("/raw/x".to_string()),
                ..DownloadRecord::default()
            }),
        )
        .unwrap();

    let regions = [bbox(10.0, 0.0, 10.0, 0.0)];
    let report = Discovery::new(&store, &everywhere, day(1), &regions)
        .purge_non_intersecting()
        .unwrap();
    assert_eq!(report.checked, 3);
    assert_eq!(report.removed, vec![1]);
    assert_eq!(report.without_bbox, vec![3]);
    assert!(store.find_by_natural_id("outside").unwrap().is_none());
    assert!(store.find_by_natural_id("outside-kept").unwrap().is_some());
    assert!(store.find_by_natural_id("no-footprint").unwrap().is_some());

    assert_eq!(store.next_id().unwrap(), 4);
}
