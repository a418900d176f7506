use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::{BBox, Checksum, NewScene, RemoteRef, SceneId};
use crate::error::TerraError;
use crate::store::{CatalogStore, SceneFilter, SceneOrder};

/// A product reported by a provider catalog, not yet in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub natural_id: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub bbox: Option<BBox>,
    pub remote: RemoteRef,
    #[serde(default)]
    pub extra: Value,
}

/// Provider-side catalog search. Implementations return every product
/// acquired at or after `since` within `bounds` (anywhere when `None`).
pub trait CatalogQuery: Send + Sync {
    fn query(&self, since: DateTime<Utc>, bounds: Option<&BBox>) -> Result<Vec<Candidate>, TerraError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub provider: String,
    pub since: Option<DateTime<Utc>>,
    pub candidates: usize,
    pub inserted: Vec<SceneId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub checked: usize,
    pub removed: Vec<SceneId>,
    pub without_bbox: Vec<SceneId>,
}

pub struct Discovery<'a, Q: CatalogQuery> {
    store: &'a CatalogStore,
    query: &'a Q,
    start_date: DateTime<Utc>,
    regions: &'a [BBox],
}

impl<'a, Q: CatalogQuery> Discovery<'a, Q> {
    pub fn new(
        store: &'a CatalogStore,
        query: &'a Q,
        start_date: DateTime<Utc>,
        regions: &'a [BBox],
    ) -> Self {
        Self {
            store,
            query,
            start_date,
            regions,
        }
    }

    /// Queries from the catalog watermark (or the configured start date when
    /// the catalog is empty or `from_start` is set) and inserts the products
    /// not seen before.
    pub fn check_new(&self, from_start: bool) -> Result<DiscoveryReport, TerraError> {
        let watermark = if from_start { None } else { self.store.watermark()? };
        let since = watermark.unwrap_or(self.start_date);
        info!(provider = %self.store.provider(), since = %since, "querying for new scenes");

        let mut candidates = Vec::new();
        if self.regions.is_empty() {
            candidates.extend(self.query.query(since, None)?);
        } else {
            for region in self.regions {
                candidates.extend(self.query.query(since, Some(region))?);
            }
        }
        let found = candidates.len();

        let mut seen = self.store.existing_natural_ids()?;
        let mut fresh: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.acquired_at >= since)
            .filter(|c| seen.insert(c.natural_id.clone()))
            .collect();
        fresh.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at).then(a.natural_id.cmp(&b.natural_id)));

        let query_at = Utc::now();
        let rows: Vec<NewScene> = fresh
            .into_iter()
            .map(|c| NewScene {
                natural_id: c.natural_id,
                acquired_at: c.acquired_at,
                bbox: c.bbox,
                remote: c.remote,
                query_at,
                extra: c.extra,
            })
            .collect();
        let inserted = self.store.insert_scenes(&rows)?;
        info!(provider = %self.store.provider(), found, inserted = inserted.len(), "discovery finished");

        Ok(DiscoveryReport {
            provider: self.store.provider().to_string(),
            since: Some(since),
            candidates: found,
            inserted,
        })
    }

    /// Removes not-yet-downloaded scenes whose footprint misses every
    /// configured region. Scenes without a footprint are kept.
    pub fn purge_non_intersecting(&self) -> Result<PurgeReport, TerraError> {
        let mut report = PurgeReport::default();
        if self.regions.is_empty() {
            debug!(provider = %self.store.provider(), "no regions configured; nothing to purge");
            return Ok(report);
        }
        let filter = SceneFilter {
            downloaded: Some(false),
            ..SceneFilter::default()
        };
        let scenes = self.store.find(&filter, SceneOrder::AcquiredAsc)?;
        report.checked = scenes.len();
        for scene in scenes {
            match scene.bbox {
                None => {
                    warn!(scene = scene.id, "scene has no footprint; keeping it");
                    report.without_bbox.push(scene.id);
                }
                Some(bbox) if !self.regions.iter().any(|r| r.intersects(&bbox)) => {
                    report.removed.push(scene.id);
                }
                Some(_) => {}
            }
        }
        let removed = self.store.delete_scenes(&report.removed)?;
        info!(provider = %self.store.provider(), removed, "spatial purge finished");
        Ok(report)
    }
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    data: Vec<FeedItem>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    natural_id: String,
    acquired_at: DateTime<Utc>,
    url: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    bbox: Option<BBox>,
    #[serde(default)]
    extra: Value,
}

impl FeedItem {
    fn into_candidate(self) -> Result<Candidate, TerraError> {
        let filename = match self.filename {
            Some(name) => name,
            None => self
                .url
                .rsplit('/')
                .next()
                .filter(|segment| !segment.is_empty())
                .map(|segment| segment.split('?').next().unwrap_or(segment).to_string())
                .ok_or_else(|| TerraError::ProviderHttp(format!("cannot name file for {}", self.url)))?,
        };
        let checksum = self
            .checksum
            .as_deref()
            .map(str::parse::<Checksum>)
            .transpose()?;
        Ok(Candidate {
            natural_id: self.natural_id,
            acquired_at: self.acquired_at,
            bbox: self.bbox,
            remote: RemoteRef {
                url: self.url,
                filename,
                checksum,
                size: self.size,
            },
            extra: self.extra,
        })
    }
}

/// Catalog client for providers that publish a JSON feed of the form
/// `{"data": [{"natural_id", "acquired_at", "url", ...}]}`, filtered by
/// `since` and `bbox=west,south,east,north` query parameters.
pub struct HttpFeedProvider {
    client: Client,
    feed_url: String,
}

impl HttpFeedProvider {
    pub fn new(feed_url: impl Into<String>, timeout: Duration) -> Result<Self, TerraError> {
        let client = Client::builder()
            .user_agent(format!("terra-dm/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| TerraError::ProviderHttp(err.to_string()))?;
        Ok(Self {
            client,
            feed_url: feed_url.into(),
        })
    }
}

impl CatalogQuery for HttpFeedProvider {
    fn query(&self, since: DateTime<Utc>, bounds: Option<&BBox>) -> Result<Vec<Candidate>, TerraError> {
        let mut params = vec![("since", since.to_rfc3339())];
        if let Some(b) = bounds {
            params.push(("bbox", format!("{},{},{},{}", b.west, b.south, b.east, b.north)));
        }
        debug!(url = %self.feed_url, ?params, "querying feed");
        let response = self
            .client
            .get(&self.feed_url)
            .query(&params)
            .send()
            .map_err(|err| TerraError::ProviderHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "feed request failed".to_string());
            return Err(TerraError::ProviderStatus { status, message });
        }
        let feed: FeedResponse = response
            .json()
            .map_err(|err| TerraError::ProviderHttp(err.to_string()))?;
        feed.data.into_iter().map(FeedItem::into_candidate).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_item_names_file_from_url() {
        let item: FeedItem = serde_json::from_value(serde_json::json!({
            "natural_id": "GEDI02_B_2020001",
            "acquired_at": "2020-01-02T00:00:00Z",
            "url": "https://example.org/data/GEDI02_B_2020001.h5?token=x",
            "checksum": "d41d8cd98f00b204e9800998ecf8427e"
        }))
        .unwrap();
        let candidate = item.into_candidate().unwrap();
        assert_eq!(candidate.remote.filename, "GEDI02_B_2020001.h5");
        assert!(candidate.remote.checksum.is_some());
        assert!(candidate.bbox.is_none());
    }
}
