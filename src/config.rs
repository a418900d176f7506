use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDate, Utc};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ard::Reprojection;
use crate::cache::CacheMode;
use crate::domain::{BBox, ProviderName};
use crate::error::TerraError;
use crate::plugins::PluginConfig;
use crate::transport::{Credentials, TransportOptions};

pub const DEFAULT_CONFIG_FILE: &str = "terra-dm.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProviderEntry {
    pub name: String,
    pub start_date: String,
    pub download_root: String,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub regions: Vec<BBox>,
    #[serde(default)]
    pub ard: Option<ArdEntry>,
    #[serde(default)]
    pub cache: Option<CacheEntry>,
    #[serde(default)]
    pub transport: Option<TransportEntry>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ArdEntry {
    pub root: String,
    #[serde(default)]
    pub work: Option<String>,
    #[serde(default)]
    pub tmp: Option<String>,
    #[serde(default)]
    pub file_pattern: Option<String>,
    #[serde(default)]
    pub reprojection: Option<Reprojection>,
    #[serde(default)]
    pub command: Option<CommandEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommandEntry {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_output_pattern")]
    pub output_pattern: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CacheEntry {
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub mode: Option<CacheMode>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TransportEntry {
    #[serde(default)]
    pub retries: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Names of environment variables holding the credentials.
    #[serde(default)]
    pub username_env: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PluginEntry {
    Shorthand(String),
    Detailed(PluginConfig),
}

#[derive(Debug, Clone)]
pub struct ArdConfig {
    pub root: Utf8PathBuf,
    pub work: Utf8PathBuf,
    pub tmp: Utf8PathBuf,
    pub file_pattern: String,
    pub reprojection: Option<Reprojection>,
    pub command: Option<CommandEntry>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dirs: Vec<Utf8PathBuf>,
    pub extension: String,
    pub mode: CacheMode,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: ProviderName,
    pub start_date: DateTime<Utc>,
    pub download_root: Utf8PathBuf,
    pub feed_url: Option<String>,
    pub regions: Vec<BBox>,
    pub ard: Option<ArdConfig>,
    pub cache: CacheConfig,
    pub transport: TransportOptions,
    pub plugins: Vec<PluginConfig>,
}

impl ProviderConfig {
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub path: Option<PathBuf>,
    pub database: Utf8PathBuf,
    pub workers: usize,
    pub providers: Vec<ProviderConfig>,
}

impl ResolvedConfig {
    pub fn provider(&self, name: &str) -> Result<&ProviderConfig, TerraError> {
        let wanted: ProviderName = name.parse()?;
        self.providers
            .iter()
            .find(|p| p.name == wanted)
            .ok_or_else(|| TerraError::UnknownProvider(name.to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, TerraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(TerraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| TerraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| TerraError::ConfigParse(err.to_string()))?;

        let mut resolved = Self::resolve_config(config)?;
        resolved.path = Some(config_path);
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, TerraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(TerraError::ConfigInvalid(format!(
                "unsupported schema_version {schema_version}"
            )));
        }
        let database = match config.database {
            Some(path) => Utf8PathBuf::from(path),
            None => default_database()?,
        };
        let workers = config.workers.unwrap_or(1).max(1);

        let providers = config
            .providers
            .into_iter()
            .map(resolve_provider)
            .collect::<Result<Vec<_>, TerraError>>()?;

        let mut names: Vec<&ProviderName> = providers.iter().map(|p| &p.name).collect();
        names.sort();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(TerraError::ConfigInvalid(format!(
                "provider {} configured twice",
                pair[0]
            )));
        }

        Ok(ResolvedConfig {
            schema_version,
            path: None,
            database,
            workers,
            providers,
        })
    }
}

fn resolve_provider(entry: ProviderEntry) -> Result<ProviderConfig, TerraError> {
    let name: ProviderName = entry.name.parse()?;
    let start_date = parse_start_date(&entry.start_date)?;
    let regions = entry
        .regions
        .iter()
        .map(|b| BBox::new(b.north, b.south, b.east, b.west))
        .collect::<Result<Vec<_>, _>>()?;

    let ard = entry.ard.map(|ard| {
        let root = Utf8PathBuf::from(ard.root);
        ArdConfig {
            work: ard.work.map(Utf8PathBuf::from).unwrap_or_else(|| root.join("work")),
            tmp: ard.tmp.map(Utf8PathBuf::from).unwrap_or_else(|| root.join("tmp")),
            file_pattern: ard.file_pattern.unwrap_or_else(|| "*".to_string()),
            reprojection: ard.reprojection,
            command: ard.command,
            root,
        }
    });

    let cache = entry.cache.unwrap_or_default();
    let cache = CacheConfig {
        dirs: cache.dirs.into_iter().map(Utf8PathBuf::from).collect(),
        extension: cache.extension.unwrap_or_default(),
        mode: cache.mode.unwrap_or_default(),
    };

    let transport_entry = entry.transport.unwrap_or_default();
    let mut transport = TransportOptions::default();
    if let Some(retries) = transport_entry.retries {
        transport.retries = retries;
    }
    if let Some(secs) = transport_entry.timeout_secs {
        transport.timeout = Duration::from_secs(secs);
    }
    transport.credentials = resolve_credentials(
        transport_entry.username_env.as_deref(),
        transport_entry.password_env.as_deref(),
    )?;

    let plugins = entry
        .plugins
        .into_iter()
        .map(|plugin| match plugin {
            PluginEntry::Shorthand(name) => PluginConfig {
                name,
                params: Value::Null,
            },
            PluginEntry::Detailed(config) => config,
        })
        .collect();

    Ok(ProviderConfig {
        name,
        start_date,
        download_root: Utf8PathBuf::from(entry.download_root),
        feed_url: entry.feed_url,
        regions,
        ard,
        cache,
        transport,
        plugins,
    })
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
pub fn parse_start_date(value: &str) -> Result<DateTime<Utc>, TerraError> {
    if let Ok(date) = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d") {
        if let Some(ts) = date.and_hms_opt(0, 0, 0) {
            return Ok(ts.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(value.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| TerraError::ConfigInvalid(format!("bad start_date {value}")))
}

fn resolve_credentials(
    username_env: Option<&str>,
    password_env: Option<&str>,
) -> Result<Option<Credentials>, TerraError> {
    match (username_env, password_env) {
        (None, None) => Ok(None),
        (Some(user_var), Some(pass_var)) => {
            let username = read_env(user_var)?;
            let password = read_env(pass_var)?;
            Ok(Some(Credentials { username, password }))
        }
        _ => Err(TerraError::ConfigInvalid(
            "username_env and password_env must be set together".to_string(),
        )),
    }
}

fn read_env(var: &str) -> Result<String, TerraError> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| TerraError::ConfigInvalid(format!("environment variable {var} is not set")))
}

fn default_database() -> Result<Utf8PathBuf, TerraError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_dir().join("terra-dm").join("catalog.sqlite")).ok()
        })
        .ok_or_else(|| TerraError::Filesystem("unable to resolve data directory".to_string()))
}

fn default_output_pattern() -> String {
    "*".to_string()
}
