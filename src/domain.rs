use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TerraError;

pub type SceneId = i64;

/// Plugin outputs keyed by plugin name.
pub type ExtendedInfo = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderName(String);

impl ProviderName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProviderName {
    type Err = TerraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid {
            return Err(TerraError::InvalidProvider(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for ProviderName {
    type Error = TerraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderName> for String {
    fn from(value: ProviderName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    Md5,
    Sha256,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Md5 => write!(f, "md5"),
            ChecksumKind::Sha256 => write!(f, "sha256"),
        }
    }
}

/// Hex digest tagged with its algorithm, written as `md5:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    kind: ChecksumKind,
    hex: String,
}

impl Checksum {
    pub fn new(kind: ChecksumKind, hex: &str) -> Result<Self, TerraError> {
        let hex = hex.trim().to_lowercase();
        let expected_len = match kind {
            ChecksumKind::Md5 => 32,
            ChecksumKind::Sha256 => 64,
        };
        if hex.len() != expected_len || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(TerraError::InvalidChecksum(format!("{kind}:{hex}")));
        }
        Ok(Self { kind, hex })
    }

    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.hex)
    }
}

impl FromStr for Checksum {
    type Err = TerraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed.split_once(':') {
            Some(("md5", hex)) => Self::new(ChecksumKind::Md5, hex),
            Some(("sha256", hex)) => Self::new(ChecksumKind::Sha256, hex),
            Some(_) => Err(TerraError::InvalidChecksum(value.to_string())),
            // Bare digests are what most providers publish; the length decides.
            None if trimmed.len() == 64 => Self::new(ChecksumKind::Sha256, trimmed),
            None => Self::new(ChecksumKind::Md5, trimmed),
        }
    }
}

impl TryFrom<String> for Checksum {
    type Error = TerraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}

/// Geographic bounds in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BBox {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Result<Self, TerraError> {
        let in_range = (-90.0..=90.0).contains(&north)
            && (-90.0..=90.0).contains(&south)
            && (-180.0..=180.0).contains(&east)
            && (-180.0..=180.0).contains(&west);
        if !in_range || north < south || east < west {
            return Err(TerraError::InvalidBbox(format!(
                "north={north} south={south} east={east} west={west}"
            )));
        }
        Ok(Self {
            north,
            south,
            east,
            west,
        })
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            north: self.north.max(other.north),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            west: self.west.min(other.west),
        }
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }

    pub fn union_all<'a, I>(boxes: I) -> Option<BBox>
    where
        I: IntoIterator<Item = &'a BBox>,
    {
        boxes
            .into_iter()
            .fold(None, |acc: Option<BBox>, bbox| match acc {
                Some(acc) => Some(acc.union(bbox)),
                None => Some(*bbox),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub checksum: Option<Checksum>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub done: bool,
    pub local_path: Option<String>,
    pub checksum: Option<Checksum>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArdRecord {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub done: bool,
    pub product_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub provider: ProviderName,
    pub id: SceneId,
    pub natural_id: String,
    pub acquired_at: DateTime<Utc>,
    pub bbox: Option<BBox>,
    pub remote: RemoteRef,
    pub query_at: DateTime<Utc>,
    pub download: DownloadRecord,
    pub ard: ArdRecord,
    pub invalid: bool,
    pub archived: bool,
    pub extended_info: ExtendedInfo,
    /// Provider-specific attributes that have no column of their own.
    pub extra: Value,
}

impl Scene {
    /// Directory name shared by the download and ARD trees.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.natural_id, self.id)
    }

    pub fn state<S: AsRef<str>>(&self, plugins: &[S]) -> SceneState {
        if self.invalid {
            return SceneState::Invalid;
        }
        if !self.download.done {
            return SceneState::Pending;
        }
        if !self.ard.done {
            return SceneState::Downloaded;
        }
        let analysed = plugins
            .iter()
            .all(|name| self.extended_info.contains_key(name.as_ref()));
        if analysed {
            SceneState::Analyzed
        } else {
            SceneState::ArdReady
        }
    }
}

/// A scene as produced by discovery, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewScene {
    pub natural_id: String,
    pub acquired_at: DateTime<Utc>,
    pub bbox: Option<BBox>,
    pub remote: RemoteRef,
    pub query_at: DateTime<Utc>,
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneState {
    Pending,
    Downloaded,
    ArdReady,
    Analyzed,
    Invalid,
}

impl fmt::Display for SceneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SceneState::Pending => "pending",
            SceneState::Downloaded => "downloaded",
            SceneState::ArdReady => "ard_ready",
            SceneState::Analyzed => "analyzed",
            SceneState::Invalid => "invalid",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRun {
    pub scene_id: SceneId,
    pub plugin: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub success: bool,
    pub error: bool,
    pub output: Option<Value>,
}

/// Mutable fields of a plugin run, written by `upsert_plugin_run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginRunFields {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub success: bool,
    pub error: bool,
    pub output: Option<Value>,
}

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(value: &str) -> Result<DateTime<Utc>, TerraError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| TerraError::Storage(format!("bad timestamp {value}: {err}")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_provider_name() {
        let name: ProviderName = " Sentinel2 ".parse().unwrap();
        assert_eq!(name.as_str(), "sentinel2");

        let err = "gedi/l2".parse::<ProviderName>().unwrap_err();
        assert_matches!(err, TerraError::InvalidProvider(_));
    }

    #[test]
    fn parse_checksum_forms() {
        let tagged: Checksum = "md5:D41D8CD98F00B204E9800998ECF8427E".parse().unwrap();
        assert_eq!(tagged.kind(), ChecksumKind::Md5);
        assert_eq!(tagged.hex(), "d41d8cd98f00b204e9800998ecf8427e");

        let bare: Checksum = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse()
            .unwrap();
        assert_eq!(bare.kind(), ChecksumKind::Sha256);

        let err = "crc32:1234".parse::<Checksum>().unwrap_err();
        assert_matches!(err, TerraError::InvalidChecksum(_));
    }

    #[test]
    fn bbox_union_and_intersection() {
        let a = BBox::new(10.0, 0.0, 10.0, 0.0).unwrap();
        let b = BBox::new(20.0, 5.0, 30.0, 5.0).unwrap();
        let c = BBox::new(-10.0, -20.0, -10.0, -20.0).unwrap();

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(
            BBox::union_all([&a, &b, &c]).unwrap(),
            BBox::new(20.0, -20.0, 30.0, -20.0).unwrap()
        );
        assert!(BBox::union_all(std::iter::empty()).is_none());
        assert_matches!(
            BBox::new(0.0, 10.0, 0.0, 0.0),
            Err(TerraError::InvalidBbox(_))
        );
    }
}
