use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TerraError;
use crate::fs_util;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Copy,
    Symlink,
}

/// Filename → path of previously downloaded files found under the local
/// cache roots. Built once per download run.
#[derive(Debug, Clone, Default)]
pub struct CacheIndex {
    files: HashMap<String, PathBuf>,
}

impl CacheIndex {
    /// Indexes files under `roots` whose name ends with `extension` (any file
    /// when empty). Missing roots are skipped; the first root wins on
    /// duplicate names.
    pub fn build<P: AsRef<Path>>(roots: &[P], extension: &str) -> Result<Self, TerraError> {
        let mut files = HashMap::new();
        for root in roots {
            let root = root.as_ref();
            if !root.is_dir() {
                warn!(root = %root.display(), "cache root missing; skipping");
                continue;
            }
            for path in fs_util::walk_files(root)? {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !extension.is_empty() && !name.ends_with(extension) {
                    continue;
                }
                files.entry(name.to_string()).or_insert(path);
            }
        }
        debug!(files = files.len(), "cache index built");
        Ok(Self { files })
    }

    pub fn lookup(&self, filename: &str) -> Option<&Path> {
        self.files.get(filename).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Places the cached file at `dest` using `mode`.
    pub fn materialize(&self, cached: &Path, dest: &Path, mode: CacheMode) -> Result<(), TerraError> {
        match mode {
            CacheMode::Copy => fs_util::copy_file_atomic(cached, dest),
            CacheMode::Symlink => fs_util::symlink_file(cached, dest),
        }
    }
}
