use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TerraError {
    #[error("invalid provider name: {0}")]
    InvalidProvider(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("invalid bounding box: {0}")]
    InvalidBbox(String),

    #[error("missing config file terra-dm.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("catalog store error: {0}")]
    Storage(String),

    #[error("scene {id} not found in {provider} catalog")]
    #[diagnostic(help("the catalog changed underneath the running stage; re-run once it is consistent"))]
    SceneNotFound { provider: String, id: i64 },

    #[error("{count} scenes share id {id} in {provider} catalog")]
    #[diagnostic(help("scene ids must be unique per provider; the catalog is corrupt"))]
    DuplicateScene {
        provider: String,
        id: i64,
        count: usize,
    },

    #[error("provider request failed: {0}")]
    ProviderHttp(String),

    #[error("provider returned status {status}: {message}")]
    ProviderStatus { status: u16, message: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("input artifact not found: {0}")]
    MissingInput(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("ARD conversion failed: {0}")]
    Conversion(String),

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("plugin {name} failed: {message}")]
    Plugin { name: String, message: String },

    #[error("worker panicked on scene {scene}: {message}")]
    WorkerPanic { scene: i64, message: String },

    #[error("timed out waiting for lock {0}")]
    LockTimeout(PathBuf),

    #[error("failed to encode catalog data: {0}")]
    Serialization(String),
}

impl TerraError {
    /// Errors that mean the catalog no longer matches its own invariants.
    /// Stages abort the batch on these instead of counting them per item.
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            TerraError::SceneNotFound { .. } | TerraError::DuplicateScene { .. }
        )
    }
}

impl From<rusqlite::Error> for TerraError {
    fn from(err: rusqlite::Error) -> Self {
        TerraError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for TerraError {
    fn from(err: serde_json::Error) -> Self {
        TerraError::Serialization(err.to_string())
    }
}
