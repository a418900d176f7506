use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params,
    params_from_iter,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{
    ArdRecord, BBox, Checksum, DownloadRecord, ExtendedInfo, NewScene, PluginRun,
    PluginRunFields, ProviderName, RemoteRef, Scene, SceneId, SceneState, format_ts, parse_ts,
};
use crate::error::TerraError;

pub const CATALOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scenes (
    provider TEXT NOT NULL,
    id INTEGER NOT NULL,
    natural_id TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    north REAL,
    south REAL,
    east REAL,
    west REAL,
    remote_url TEXT NOT NULL,
    remote_filename TEXT NOT NULL,
    remote_checksum TEXT,
    remote_size INTEGER,
    query_at TEXT NOT NULL,
    download_started_at TEXT,
    download_ended_at TEXT,
    downloaded INTEGER NOT NULL DEFAULT 0,
    download_path TEXT,
    download_checksum TEXT,
    download_size INTEGER,
    ard_started_at TEXT,
    ard_ended_at TEXT,
    ard_done INTEGER NOT NULL DEFAULT 0,
    ard_path TEXT,
    invalid INTEGER NOT NULL DEFAULT 0,
    archived INTEGER NOT NULL DEFAULT 0,
    extended_info TEXT NOT NULL DEFAULT '{}',
    extra TEXT NOT NULL DEFAULT 'null',
    PRIMARY KEY (provider, id),
    UNIQUE (provider, natural_id)
);
CREATE INDEX IF NOT EXISTS scenes_by_acquired ON scenes (provider, acquired_at);
CREATE TABLE IF NOT EXISTS scene_counters (
    provider TEXT PRIMARY KEY,
    next_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS plugin_runs (
    provider TEXT NOT NULL,
    scene_id INTEGER NOT NULL,
    plugin TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    completed INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    error INTEGER NOT NULL DEFAULT 0,
    output TEXT,
    PRIMARY KEY (provider, scene_id, plugin),
    FOREIGN KEY (provider, scene_id) REFERENCES scenes (provider, id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS usage_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    logged_at TEXT NOT NULL,
    provider TEXT NOT NULL,
    description TEXT NOT NULL,
    updated_db INTEGER NOT NULL DEFAULT 0,
    new_scenes INTEGER NOT NULL DEFAULT 0,
    downloaded INTEGER NOT NULL DEFAULT 0,
    converted INTEGER NOT NULL DEFAULT 0,
    analysed INTEGER NOT NULL DEFAULT 0,
    start_block INTEGER NOT NULL DEFAULT 0,
    end_block INTEGER NOT NULL DEFAULT 0
);
";

const SCENE_COLUMNS: &str = "provider, id, natural_id, acquired_at, north, south, east, west, \
    remote_url, remote_filename, remote_checksum, remote_size, query_at, \
    download_started_at, download_ended_at, downloaded, download_path, download_checksum, \
    download_size, ard_started_at, ard_ended_at, ard_done, ard_path, invalid, archived, \
    extended_info, extra";

const PLUGIN_RUN_COLUMNS: &str =
    "scene_id, plugin, started_at, ended_at, completed, success, error, output";

pub fn connect(db_path: &Utf8Path) -> Result<Connection, TerraError> {
    let conn = Connection::open(db_path.as_std_path())?;
    conn.busy_timeout(Duration::from_secs(30))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

pub fn initialize(db_path: &Utf8Path) -> Result<(), TerraError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_str().is_empty() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| TerraError::Filesystem(err.to_string()))?;
        }
    }
    let conn = connect(db_path)?;
    conn.execute_batch(CATALOG_SCHEMA)?;
    Ok(())
}

/// Typed predicate over the scene table. `None` fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneFilter {
    pub id: Option<SceneId>,
    pub downloaded: Option<bool>,
    pub ard: Option<bool>,
    pub invalid: Option<bool>,
    pub archived: Option<bool>,
    pub acquired_from: Option<DateTime<Utc>>,
    pub acquired_to: Option<DateTime<Utc>>,
}

impl SceneFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: SceneId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn pending_download() -> Self {
        Self {
            downloaded: Some(false),
            invalid: Some(false),
            ..Self::default()
        }
    }

    pub fn pending_ard() -> Self {
        Self {
            downloaded: Some(true),
            ard: Some(false),
            invalid: Some(false),
            ..Self::default()
        }
    }

    pub fn ard_ready() -> Self {
        Self {
            ard: Some(true),
            invalid: Some(false),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: SceneId) -> Self {
        self.id = Some(id);
        self
    }

    fn where_clause(&self, provider: &ProviderName) -> (String, Vec<SqlValue>) {
        let mut clauses = vec!["provider = ?".to_string()];
        let mut values = vec![SqlValue::Text(provider.as_str().to_string())];
        if let Some(id) = self.id {
            clauses.push("id = ?".to_string());
            values.push(SqlValue::Integer(id));
        }
        let flags = [
            ("downloaded", self.downloaded),
            ("ard_done", self.ard),
            ("invalid", self.invalid),
            ("archived", self.archived),
        ];
        for (column, flag) in flags {
            if let Some(flag) = flag {
                clauses.push(format!("{column} = ?"));
                values.push(SqlValue::Integer(i64::from(flag)));
            }
        }
        if let Some(from) = &self.acquired_from {
            clauses.push("acquired_at >= ?".to_string());
            values.push(SqlValue::Text(format_ts(from)));
        }
        if let Some(to) = &self.acquired_to {
            clauses.push("acquired_at <= ?".to_string());
            values.push(SqlValue::Text(format_ts(to)));
        }
        (clauses.join(" AND "), values)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SceneOrder {
    #[default]
    AcquiredAsc,
    AcquiredDesc,
    IdAsc,
}

/// Row window for paged queries. `limit: None` returns everything after
/// `offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    fn sql(self) -> String {
        match (self.limit, self.offset) {
            (None, 0) => String::new(),
            (None, offset) => format!(" LIMIT -1 OFFSET {offset}"),
            (Some(limit), offset) => format!(" LIMIT {limit} OFFSET {offset}"),
        }
    }
}

impl SceneOrder {
    fn sql(self) -> &'static str {
        match self {
            SceneOrder::AcquiredAsc => "acquired_at ASC, id ASC",
            SceneOrder::AcquiredDesc => "acquired_at DESC, id DESC",
            SceneOrder::IdAsc => "id ASC",
        }
    }
}

/// Partial updates a stage may apply to one scene. None of them clears a
/// done flag; that is left to [`CatalogStore::reset_scene`].
#[derive(Debug, Clone, PartialEq)]
pub enum SceneUpdate {
    Downloaded(DownloadRecord),
    ArdReady {
        record: ArdRecord,
        bbox: Option<BBox>,
    },
    Bbox(BBox),
    Invalid,
    Archived {
        local_path: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetScope {
    pub download: bool,
    pub invalid: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub provider: String,
    pub total: usize,
    pub pending: usize,
    pub downloaded: usize,
    pub ard_ready: usize,
    pub analyzed: usize,
    pub invalid: usize,
    pub archived: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogExport {
    pub provider: ProviderName,
    pub exported_at: DateTime<Utc>,
    pub scenes: Vec<Scene>,
    pub plugin_runs: Vec<PluginRun>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportResult {
    pub imported: usize,
    pub skipped: usize,
}

/// Provider-scoped view over the catalog database. Every call opens its
/// own short-lived connection, so a store is cheap to clone into workers.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    db_path: Utf8PathBuf,
    provider: ProviderName,
}

impl CatalogStore {
    pub fn open(db_path: impl Into<Utf8PathBuf>, provider: ProviderName) -> Result<Self, TerraError> {
        let db_path = db_path.into();
        initialize(&db_path)?;
        Ok(Self { db_path, provider })
    }

    pub fn provider(&self) -> &ProviderName {
        &self.provider
    }

    pub fn db_path(&self) -> &Utf8Path {
        &self.db_path
    }

    /// Same database, different provider scope.
    pub fn for_provider(&self, provider: ProviderName) -> Self {
        Self {
            db_path: self.db_path.clone(),
            provider,
        }
    }

    fn with_conn<F, R>(&self, op: &str, f: F) -> Result<R, TerraError>
    where
        F: FnOnce(&mut Connection) -> Result<R, TerraError>,
    {
        debug!(provider = %self.provider, op, "catalog session");
        let mut conn = connect(&self.db_path)?;
        f(&mut conn)
    }

    pub fn next_id(&self) -> Result<SceneId, TerraError> {
        self.with_conn("next_id", |conn| next_id_in(conn, &self.provider))
    }

    /// Inserts the batch atomically, assigning consecutive ids from
    /// [`CatalogStore::next_id`] inside the same write transaction.
    pub fn insert_scenes(&self, rows: &[NewScene]) -> Result<Vec<SceneId>, TerraError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn("insert_scenes", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut next = next_id_in(&tx, &self.provider)?;
            let mut ids = Vec::with_capacity(rows.len());
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO scenes (provider, id, natural_id, acquired_at, north, south, east, west, \
                     remote_url, remote_filename, remote_checksum, remote_size, query_at, extra) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )?;
                for row in rows {
                    stmt.execute(params![
                        self.provider.as_str(),
                        next,
                        row.natural_id,
                        format_ts(&row.acquired_at),
                        row.bbox.map(|b| b.north),
                        row.bbox.map(|b| b.south),
                        row.bbox.map(|b| b.east),
                        row.bbox.map(|b| b.west),
                        row.remote.url,
                        row.remote.filename,
                        row.remote.checksum.as_ref().map(|c| c.to_string()),
                        row.remote.size.map(size_to_sql),
                        format_ts(&row.query_at),
                        serde_json::to_string(&row.extra)?,
                    ])?;
                    ids.push(next);
                    next += 1;
                }
            }
            bump_counter(&tx, &self.provider, next)?;
            tx.commit()?;
            Ok(ids)
        })
    }

    pub fn find(&self, filter: &SceneFilter, order: SceneOrder) -> Result<Vec<Scene>, TerraError> {
        self.find_page(filter, order, Page::default())
    }

    pub fn find_page(
        &self,
        filter: &SceneFilter,
        order: SceneOrder,
        page: Page,
    ) -> Result<Vec<Scene>, TerraError> {
        self.with_conn("find", |conn| find_in(conn, &self.provider, filter, order, page))
    }

    pub fn count(&self, filter: &SceneFilter) -> Result<usize, TerraError> {
        self.with_conn("count", |conn| {
            let (clause, values) = filter.where_clause(&self.provider);
            let sql = format!("SELECT COUNT(*) FROM scenes WHERE {clause}");
            let count: i64 = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }

    /// Looks a scene up by id with a filter applied. More than one row is a
    /// broken catalog and is reported as such.
    pub fn find_one(&self, filter: &SceneFilter) -> Result<Option<Scene>, TerraError> {
        let mut scenes = self.find(filter, SceneOrder::IdAsc)?;
        match scenes.len() {
            0 => Ok(None),
            1 => Ok(scenes.pop()),
            count => Err(TerraError::DuplicateScene {
                provider: self.provider.to_string(),
                id: filter.id.unwrap_or_default(),
                count,
            }),
        }
    }

    pub fn get_scene(&self, id: SceneId) -> Result<Scene, TerraError> {
        self.find_one(&SceneFilter::by_id(id))?
            .ok_or_else(|| self.not_found(id))
    }

    pub fn find_by_natural_id(&self, natural_id: &str) -> Result<Option<Scene>, TerraError> {
        self.with_conn("find_by_natural_id", |conn| {
            let sql = format!(
                "SELECT {SCENE_COLUMNS} FROM scenes WHERE provider = ?1 AND natural_id = ?2"
            );
            let row = conn
                .query_row(&sql, params![self.provider.as_str(), natural_id], SceneRow::read)
                .optional()?;
            row.map(Scene::try_from).transpose()
        })
    }

    pub fn existing_natural_ids(&self) -> Result<HashSet<String>, TerraError> {
        self.with_conn("existing_natural_ids", |conn| {
            let mut stmt = conn.prepare("SELECT natural_id FROM scenes WHERE provider = ?1")?;
            let rows = stmt.query_map(params![self.provider.as_str()], |row| row.get(0))?;
            Ok(rows.collect::<Result<HashSet<String>, _>>()?)
        })
    }

    /// Latest acquisition time in the catalog, the discovery watermark.
    pub fn watermark(&self) -> Result<Option<DateTime<Utc>>, TerraError> {
        self.with_conn("watermark", |conn| {
            let value: Option<String> = conn.query_row(
                "SELECT MAX(acquired_at) FROM scenes WHERE provider = ?1",
                params![self.provider.as_str()],
                |row| row.get(0),
            )?;
            value.as_deref().map(parse_ts).transpose()
        })
    }

    pub fn update_scene(&self, id: SceneId, mutation: &SceneUpdate) -> Result<(), TerraError> {
        self.with_conn("update_scene", |conn| {
            let provider = self.provider.as_str();
            let changed = match mutation {
                SceneUpdate::Downloaded(record) => conn.execute(
                    "UPDATE scenes SET downloaded = 1, download_started_at = ?3, download_ended_at = ?4, \
                     download_path = ?5, download_checksum = ?6, download_size = ?7 \
                     WHERE provider = ?1 AND id = ?2",
                    params![
                        provider,
                        id,
                        record.started_at.as_ref().map(format_ts),
                        record.ended_at.as_ref().map(format_ts),
                        record.local_path,
                        record.checksum.as_ref().map(|c| c.to_string()),
                        record.size.map(size_to_sql),
                    ],
                )?,
                SceneUpdate::ArdReady { record, bbox } => {
                    let changed = conn.execute(
                        "UPDATE scenes SET ard_done = 1, ard_started_at = ?3, ard_ended_at = ?4, \
                         ard_path = ?5 WHERE provider = ?1 AND id = ?2",
                        params![
                            provider,
                            id,
                            record.started_at.as_ref().map(format_ts),
                            record.ended_at.as_ref().map(format_ts),
                            record.product_path,
                        ],
                    )?;
                    if let Some(bbox) = bbox {
                        write_bbox(conn, provider, id, bbox)?;
                    }
                    changed
                }
                SceneUpdate::Bbox(bbox) => write_bbox(conn, provider, id, bbox)?,
                SceneUpdate::Invalid => conn.execute(
                    "UPDATE scenes SET invalid = 1 WHERE provider = ?1 AND id = ?2",
                    params![provider, id],
                )?,
                SceneUpdate::Archived { local_path } => conn.execute(
                    "UPDATE scenes SET archived = 1, download_path = COALESCE(?3, download_path) \
                     WHERE provider = ?1 AND id = ?2",
                    params![provider, id, local_path],
                )?,
            };
            if changed == 0 {
                return Err(self.not_found(id));
            }
            Ok(())
        })
    }

    pub fn upsert_plugin_run(
        &self,
        scene_id: SceneId,
        plugin: &str,
        fields: &PluginRunFields,
    ) -> Result<(), TerraError> {
        self.with_conn("upsert_plugin_run", |conn| {
            upsert_run_in(conn, &self.provider, scene_id, plugin, fields)
        })
    }

    /// Stores a plugin's run row and, when given, its output under
    /// `extended_info[plugin]`, in one transaction.
    pub fn record_plugin_result(
        &self,
        scene_id: SceneId,
        plugin: &str,
        fields: &PluginRunFields,
        extended: Option<&Value>,
    ) -> Result<(), TerraError> {
        self.with_conn("record_plugin_result", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(value) = extended {
                let mut info = read_extended_info(&tx, &self.provider, scene_id)?
                    .ok_or_else(|| self.not_found(scene_id))?;
                info.insert(plugin.to_string(), value.clone());
                write_extended_info(&tx, &self.provider, scene_id, &info)?;
            }
            upsert_run_in(&tx, &self.provider, scene_id, plugin, fields)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn plugin_runs(&self, scene_id: SceneId) -> Result<Vec<PluginRun>, TerraError> {
        self.with_conn("plugin_runs", |conn| {
            let sql = format!(
                "SELECT {PLUGIN_RUN_COLUMNS} FROM plugin_runs WHERE provider = ?1 AND scene_id = ?2 \
                 ORDER BY plugin"
            );
            query_runs(conn, &sql, params![self.provider.as_str(), scene_id])
        })
    }

    pub fn plugin_runs_for(&self, plugin: &str) -> Result<Vec<PluginRun>, TerraError> {
        self.with_conn("plugin_runs_for", |conn| {
            let sql = format!(
                "SELECT {PLUGIN_RUN_COLUMNS} FROM plugin_runs WHERE provider = ?1 AND plugin = ?2 \
                 ORDER BY scene_id"
            );
            query_runs(conn, &sql, params![self.provider.as_str(), plugin])
        })
    }

    /// Completed plugin names per scene.
    pub fn completed_plugins(&self) -> Result<HashMap<SceneId, HashSet<String>>, TerraError> {
        self.with_conn("completed_plugins", |conn| {
            let mut stmt = conn.prepare(
                "SELECT scene_id, plugin FROM plugin_runs WHERE provider = ?1 AND completed = 1",
            )?;
            let rows = stmt.query_map(params![self.provider.as_str()], |row| {
                Ok((row.get::<_, SceneId>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out: HashMap<SceneId, HashSet<String>> = HashMap::new();
            for row in rows {
                let (scene_id, plugin) = row?;
                out.entry(scene_id).or_default().insert(plugin);
            }
            Ok(out)
        })
    }

    /// Forgets plugin results. `plugins = None` means every plugin and
    /// `scene_id = None` every scene. Returns the number of run rows removed.
    pub fn reset_analysis(
        &self,
        plugins: Option<&[String]>,
        scene_id: Option<SceneId>,
    ) -> Result<usize, TerraError> {
        self.with_conn("reset_analysis", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut clauses = vec!["provider = ?".to_string()];
            let mut values = vec![SqlValue::Text(self.provider.as_str().to_string())];
            if let Some(scene_id) = scene_id {
                clauses.push("scene_id = ?".to_string());
                values.push(SqlValue::Integer(scene_id));
            }
            if let Some(plugins) = plugins {
                if plugins.is_empty() {
                    return Ok(0);
                }
                let marks = vec!["?"; plugins.len()].join(", ");
                clauses.push(format!("plugin IN ({marks})"));
                values.extend(plugins.iter().map(|p| SqlValue::Text(p.clone())));
            }
            let sql = format!("DELETE FROM plugin_runs WHERE {}", clauses.join(" AND "));
            let removed = tx.execute(&sql, params_from_iter(values))?;

            let targets: Vec<SceneId> = match scene_id {
                Some(id) => vec![id],
                None => {
                    let mut stmt = tx.prepare("SELECT id FROM scenes WHERE provider = ?1")?;
                    let ids = stmt
                        .query_map(params![self.provider.as_str()], |row| row.get(0))?
                        .collect::<Result<Vec<SceneId>, _>>()?;
                    ids
                }
            };
            for id in targets {
                let Some(mut info) = read_extended_info(&tx, &self.provider, id)? else {
                    continue;
                };
                match plugins {
                    Some(plugins) => {
                        for plugin in plugins {
                            info.remove(plugin);
                        }
                    }
                    None => info.clear(),
                }
                write_extended_info(&tx, &self.provider, id, &info)?;
            }
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Moves a scene back in the lifecycle. ARD and plugin state are always
    /// cleared; download and invalid flags only when the scope asks for it.
    pub fn reset_scene(&self, id: SceneId, scope: ResetScope) -> Result<(), TerraError> {
        self.with_conn("reset_scene", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let provider = self.provider.as_str();
            let changed = tx.execute(
                "UPDATE scenes SET ard_done = 0, ard_started_at = NULL, ard_ended_at = NULL, \
                 ard_path = NULL, extended_info = '{}' WHERE provider = ?1 AND id = ?2",
                params![provider, id],
            )?;
            if changed == 0 {
                return Err(self.not_found(id));
            }
            tx.execute(
                "DELETE FROM plugin_runs WHERE provider = ?1 AND scene_id = ?2",
                params![provider, id],
            )?;
            if scope.download {
                tx.execute(
                    "UPDATE scenes SET downloaded = 0, download_started_at = NULL, \
                     download_ended_at = NULL, download_path = NULL, download_checksum = NULL, \
                     download_size = NULL, archived = 0 WHERE provider = ?1 AND id = ?2",
                    params![provider, id],
                )?;
            }
            if scope.invalid {
                tx.execute(
                    "UPDATE scenes SET invalid = 0 WHERE provider = ?1 AND id = ?2",
                    params![provider, id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Rewrites the `from` prefix of stored download paths. Returns the
    /// number of scenes touched.
    pub fn rewrite_download_paths(&self, from: &str, to: &str) -> Result<usize, TerraError> {
        self.rewrite_paths("download_path", from, to)
    }

    pub fn rewrite_ard_paths(&self, from: &str, to: &str) -> Result<usize, TerraError> {
        self.rewrite_paths("ard_path", from, to)
    }

    fn rewrite_paths(&self, column: &str, from: &str, to: &str) -> Result<usize, TerraError> {
        self.with_conn("rewrite_paths", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let select = format!(
                "SELECT id, {column} FROM scenes WHERE provider = ?1 AND {column} IS NOT NULL"
            );
            let rows: Vec<(SceneId, String)> = {
                let mut stmt = tx.prepare(&select)?;
                let rows = stmt
                    .query_map(params![self.provider.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            let update =
                format!("UPDATE scenes SET {column} = ?3 WHERE provider = ?1 AND id = ?2");
            let mut touched = 0;
            for (id, path) in rows {
                if let Some(rest) = path.strip_prefix(from) {
                    tx.execute(&update, params![self.provider.as_str(), id, format!("{to}{rest}")])?;
                    touched += 1;
                }
            }
            tx.commit()?;
            Ok(touched)
        })
    }

    /// Flags every downloaded scene as archived. With `new_root` the stored
    /// download path is re-pointed at `<new_root>/<last path component>`.
    pub fn mark_downloads_archived(&self, new_root: Option<&Utf8Path>) -> Result<usize, TerraError> {
        let filter = SceneFilter {
            downloaded: Some(true),
            archived: Some(false),
            ..SceneFilter::default()
        };
        let scenes = self.find(&filter, SceneOrder::IdAsc)?;
        let mut touched = 0;
        for scene in scenes {
            let local_path = match (new_root, scene.download.local_path.as_deref()) {
                (Some(root), Some(old)) => Utf8Path::new(old)
                    .file_name()
                    .map(|name| root.join(name).to_string()),
                _ => None,
            };
            self.update_scene(scene.id, &SceneUpdate::Archived { local_path })?;
            touched += 1;
        }
        Ok(touched)
    }

    pub fn query_intersecting(&self, bbox: &BBox) -> Result<Vec<Scene>, TerraError> {
        let scenes = self.find(&SceneFilter::all(), SceneOrder::AcquiredAsc)?;
        Ok(scenes
            .into_iter()
            .filter(|scene| scene.bbox.map(|b| b.intersects(bbox)).unwrap_or(false))
            .collect())
    }

    /// Removes scenes outright. Only the pre-download spatial purge uses this;
    /// ids are never handed out again.
    pub fn delete_scenes(&self, ids: &[SceneId]) -> Result<usize, TerraError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_conn("delete_scenes", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let next = next_id_in(&tx, &self.provider)?;
            bump_counter(&tx, &self.provider, next)?;
            let mut removed = 0;
            for id in ids {
                removed += tx.execute(
                    "DELETE FROM scenes WHERE provider = ?1 AND id = ?2",
                    params![self.provider.as_str(), id],
                )?;
            }
            tx.commit()?;
            Ok(removed)
        })
    }

    pub fn summary<S: AsRef<str>>(&self, plugins: &[S]) -> Result<CatalogSummary, TerraError> {
        let scenes = self.find(&SceneFilter::all(), SceneOrder::IdAsc)?;
        let mut summary = CatalogSummary {
            provider: self.provider.to_string(),
            total: scenes.len(),
            ..CatalogSummary::default()
        };
        for scene in &scenes {
            if scene.archived {
                summary.archived += 1;
            }
            match scene.state(plugins) {
                SceneState::Pending => summary.pending += 1,
                SceneState::Downloaded => summary.downloaded += 1,
                SceneState::ArdReady => summary.ard_ready += 1,
                SceneState::Analyzed => summary.analyzed += 1,
                SceneState::Invalid => summary.invalid += 1,
            }
        }
        Ok(summary)
    }

    /// Scenes acquired within `[from, to]`, oldest first. `valid_only` drops
    /// scenes flagged invalid.
    pub fn query_acquired_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        valid_only: bool,
        page: Page,
    ) -> Result<Vec<Scene>, TerraError> {
        self.find_page(&acquired_filter(from, to, valid_only), SceneOrder::AcquiredAsc, page)
    }

    pub fn count_acquired_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        valid_only: bool,
    ) -> Result<usize, TerraError> {
        self.count(&acquired_filter(from, to, valid_only))
    }

    pub fn export_json(&self, path: &Utf8Path) -> Result<usize, TerraError> {
        let export = self.export_catalog()?;
        let body = serde_json::to_vec_pretty(&export)?;
        let parent = path.parent().filter(|p| !p.as_str().is_empty());
        if let Some(parent) = parent {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| TerraError::Filesystem(format!("create {parent}: {err}")))?;
        }
        fs::write(path.as_std_path(), body)
            .map_err(|err| TerraError::Filesystem(format!("write {path}: {err}")))?;
        Ok(export.scenes.len())
    }

    pub fn import_json(
        &self,
        path: &Utf8Path,
        replace: &BTreeMap<String, String>,
    ) -> Result<ImportResult, TerraError> {
        let body = fs::read(path.as_std_path())
            .map_err(|err| TerraError::Filesystem(format!("read {path}: {err}")))?;
        let export: CatalogExport = serde_json::from_slice(&body)?;
        if &export.provider != self.provider() {
            return Err(TerraError::UnknownProvider(format!(
                "export is for {} but the store is scoped to {}",
                export.provider, self.provider
            )));
        }
        self.import_catalog(&export, replace)
    }

    pub fn export_catalog(&self) -> Result<CatalogExport, TerraError> {
        let scenes = self.find(&SceneFilter::all(), SceneOrder::IdAsc)?;
        let plugin_runs = self.with_conn("export_runs", |conn| {
            let sql = format!(
                "SELECT {PLUGIN_RUN_COLUMNS} FROM plugin_runs WHERE provider = ?1 \
                 ORDER BY scene_id, plugin"
            );
            query_runs(conn, &sql, params![self.provider.as_str()])
        })?;
        Ok(CatalogExport {
            provider: self.provider.clone(),
            exported_at: Utc::now(),
            scenes,
            plugin_runs,
        })
    }

    /// Loads an export, keeping its ids. Scenes whose natural id is already
    /// catalogued are skipped along with their plugin runs. Path prefixes in
    /// `replace` are rewritten on the way in.
    pub fn import_catalog(
        &self,
        export: &CatalogExport,
        replace: &BTreeMap<String, String>,
    ) -> Result<ImportResult, TerraError> {
        self.with_conn("import", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut result = ImportResult::default();
            let mut imported_ids = HashSet::new();
            for scene in &export.scenes {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM scenes WHERE provider = ?1 AND (natural_id = ?2 OR id = ?3)",
                        params![self.provider.as_str(), scene.natural_id, scene.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    result.skipped += 1;
                    continue;
                }
                let mut scene = scene.clone();
                scene.download.local_path =
                    scene.download.local_path.map(|p| replace_prefix(&p, replace));
                scene.ard.product_path = scene.ard.product_path.map(|p| replace_prefix(&p, replace));
                insert_full_scene(&tx, &self.provider, &scene)?;
                imported_ids.insert(scene.id);
                result.imported += 1;
            }
            for run in export.plugin_runs.iter().filter(|r| imported_ids.contains(&r.scene_id)) {
                let fields = PluginRunFields {
                    started_at: run.started_at,
                    ended_at: run.ended_at,
                    completed: run.completed,
                    success: run.success,
                    error: run.error,
                    output: run.output.clone(),
                };
                upsert_run_in(&tx, &self.provider, run.scene_id, &run.plugin, &fields)?;
            }
            let next = next_id_in(&tx, &self.provider)?;
            bump_counter(&tx, &self.provider, next)?;
            tx.commit()?;
            Ok(result)
        })
    }

    fn not_found(&self, id: SceneId) -> TerraError {
        TerraError::SceneNotFound {
            provider: self.provider.to_string(),
            id,
        }
    }
}

fn next_id_in(conn: &Connection, provider: &ProviderName) -> Result<SceneId, TerraError> {
    let max_id: Option<i64> = conn.query_row(
        "SELECT MAX(id) FROM scenes WHERE provider = ?1",
        params![provider.as_str()],
        |row| row.get(0),
    )?;
    let counter: Option<i64> = conn
        .query_row(
            "SELECT next_id FROM scene_counters WHERE provider = ?1",
            params![provider.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let from_rows = max_id.map(|id| id + 1).unwrap_or(0);
    Ok(from_rows.max(counter.unwrap_or(0)))
}

fn bump_counter(tx: &Transaction<'_>, provider: &ProviderName, next: SceneId) -> Result<(), TerraError> {
    tx.execute(
        "INSERT INTO scene_counters (provider, next_id) VALUES (?1, ?2) \
         ON CONFLICT(provider) DO UPDATE SET next_id = MAX(next_id, excluded.next_id)",
        params![provider.as_str(), next],
    )?;
    Ok(())
}

fn acquired_filter(from: DateTime<Utc>, to: DateTime<Utc>, valid_only: bool) -> SceneFilter {
    SceneFilter {
        acquired_from: Some(from),
        acquired_to: Some(to),
        invalid: valid_only.then_some(false),
        ..SceneFilter::default()
    }
}

fn find_in(
    conn: &Connection,
    provider: &ProviderName,
    filter: &SceneFilter,
    order: SceneOrder,
    page: Page,
) -> Result<Vec<Scene>, TerraError> {
    let (clause, values) = filter.where_clause(provider);
    let sql = format!(
        "SELECT {SCENE_COLUMNS} FROM scenes WHERE {clause} ORDER BY {}{}",
        order.sql(),
        page.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), SceneRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(Scene::try_from).collect()
}

fn write_bbox(conn: &Connection, provider: &str, id: SceneId, bbox: &BBox) -> Result<usize, TerraError> {
    Ok(conn.execute(
        "UPDATE scenes SET north = ?3, south = ?4, east = ?5, west = ?6 \
         WHERE provider = ?1 AND id = ?2",
        params![provider, id, bbox.north, bbox.south, bbox.east, bbox.west],
    )?)
}

fn read_extended_info(
    conn: &Connection,
    provider: &ProviderName,
    id: SceneId,
) -> Result<Option<ExtendedInfo>, TerraError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT extended_info FROM scenes WHERE provider = ?1 AND id = ?2",
            params![provider.as_str(), id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|raw| parse_extended_info(&raw)).transpose()
}

fn write_extended_info(
    conn: &Connection,
    provider: &ProviderName,
    id: SceneId,
    info: &ExtendedInfo,
) -> Result<(), TerraError> {
    conn.execute(
        "UPDATE scenes SET extended_info = ?3 WHERE provider = ?1 AND id = ?2",
        params![provider.as_str(), id, serde_json::to_string(info)?],
    )?;
    Ok(())
}

fn upsert_run_in(
    conn: &Connection,
    provider: &ProviderName,
    scene_id: SceneId,
    plugin: &str,
    fields: &PluginRunFields,
) -> Result<(), TerraError> {
    let output = fields
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO plugin_runs (provider, scene_id, plugin, started_at, ended_at, completed, \
         success, error, output) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         ON CONFLICT(provider, scene_id, plugin) DO UPDATE SET started_at = excluded.started_at, \
         ended_at = excluded.ended_at, completed = excluded.completed, success = excluded.success, \
         error = excluded.error, output = excluded.output",
        params![
            provider.as_str(),
            scene_id,
            plugin,
            fields.started_at.as_ref().map(format_ts),
            fields.ended_at.as_ref().map(format_ts),
            fields.completed,
            fields.success,
            fields.error,
            output,
        ],
    )
    .map_err(|err| match err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            TerraError::SceneNotFound {
                provider: provider.to_string(),
                id: scene_id,
            }
        }
        other => TerraError::from(other),
    })?;
    Ok(())
}

fn query_runs<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<PluginRun>, TerraError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, SceneId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(
            |(scene_id, plugin, started, ended, completed, success, error, output)| {
                Ok(PluginRun {
                    scene_id,
                    plugin,
                    started_at: started.as_deref().map(parse_ts).transpose()?,
                    ended_at: ended.as_deref().map(parse_ts).transpose()?,
                    completed,
                    success,
                    error,
                    output: output
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()?,
                })
            },
        )
        .collect()
}

fn insert_full_scene(
    tx: &Transaction<'_>,
    provider: &ProviderName,
    scene: &Scene,
) -> Result<(), TerraError> {
    let sql = format!(
        "INSERT INTO scenes ({SCENE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)"
    );
    tx.execute(
        &sql,
        params![
            provider.as_str(),
            scene.id,
            scene.natural_id,
            format_ts(&scene.acquired_at),
            scene.bbox.map(|b| b.north),
            scene.bbox.map(|b| b.south),
            scene.bbox.map(|b| b.east),
            scene.bbox.map(|b| b.west),
            scene.remote.url,
            scene.remote.filename,
            scene.remote.checksum.as_ref().map(|c| c.to_string()),
            scene.remote.size.map(size_to_sql),
            format_ts(&scene.query_at),
            scene.download.started_at.as_ref().map(format_ts),
            scene.download.ended_at.as_ref().map(format_ts),
            scene.download.done,
            scene.download.local_path,
            scene.download.checksum.as_ref().map(|c| c.to_string()),
            scene.download.size.map(size_to_sql),
            scene.ard.started_at.as_ref().map(format_ts),
            scene.ard.ended_at.as_ref().map(format_ts),
            scene.ard.done,
            scene.ard.product_path,
            scene.invalid,
            scene.archived,
            serde_json::to_string(&scene.extended_info)?,
            serde_json::to_string(&scene.extra)?,
        ],
    )?;
    Ok(())
}

fn replace_prefix(path: &str, replace: &BTreeMap<String, String>) -> String {
    for (from, to) in replace {
        if let Some(rest) = path.strip_prefix(from.as_str()) {
            return format!("{to}{rest}");
        }
    }
    path.to_string()
}

fn parse_extended_info(raw: &str) -> Result<ExtendedInfo, TerraError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(ExtendedInfo::new()),
        other => Err(TerraError::Storage(format!(
            "extended_info is not a JSON object: {other}"
        ))),
    }
}

fn size_to_sql(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn size_from_sql(size: Option<i64>) -> Option<u64> {
    size.and_then(|value| u64::try_from(value).ok())
}

/// Column values as SQLite hands them back, before parsing.
struct SceneRow {
    provider: String,
    id: SceneId,
    natural_id: String,
    acquired_at: String,
    bounds: [Option<f64>; 4],
    remote_url: String,
    remote_filename: String,
    remote_checksum: Option<String>,
    remote_size: Option<i64>,
    query_at: String,
    download_started_at: Option<String>,
    download_ended_at: Option<String>,
    downloaded: bool,
    download_path: Option<String>,
    download_checksum: Option<String>,
    download_size: Option<i64>,
    ard_started_at: Option<String>,
    ard_ended_at: Option<String>,
    ard_done: bool,
    ard_path: Option<String>,
    invalid: bool,
    archived: bool,
    extended_info: String,
    extra: String,
}

impl SceneRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            provider: row.get(0)?,
            id: row.get(1)?,
            natural_id: row.get(2)?,
            acquired_at: row.get(3)?,
            bounds: [row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?],
            remote_url: row.get(8)?,
            remote_filename: row.get(9)?,
            remote_checksum: row.get(10)?,
            remote_size: row.get(11)?,
            query_at: row.get(12)?,
            download_started_at: row.get(13)?,
            download_ended_at: row.get(14)?,
            downloaded: row.get(15)?,
            download_path: row.get(16)?,
            download_checksum: row.get(17)?,
            download_size: row.get(18)?,
            ard_started_at: row.get(19)?,
            ard_ended_at: row.get(20)?,
            ard_done: row.get(21)?,
            ard_path: row.get(22)?,
            invalid: row.get(23)?,
            archived: row.get(24)?,
            extended_info: row.get(25)?,
            extra: row.get(26)?,
        })
    }
}

impl TryFrom<SceneRow> for Scene {
    type Error = TerraError;

    fn try_from(row: SceneRow) -> Result<Self, Self::Error> {
        let bbox = match row.bounds {
            [Some(north), Some(south), Some(east), Some(west)] => Some(BBox {
                north,
                south,
                east,
                west,
            }),
            _ => None,
        };
        let parse_opt = |value: Option<String>| value.as_deref().map(parse_ts).transpose();
        let parse_checksum = |value: Option<String>| {
            value
                .as_deref()
                .map(str::parse::<Checksum>)
                .transpose()
        };
        Ok(Scene {
            provider: row.provider.parse()?,
            id: row.id,
            natural_id: row.natural_id,
            acquired_at: parse_ts(&row.acquired_at)?,
            bbox,
            remote: RemoteRef {
                url: row.remote_url,
                filename: row.remote_filename,
                checksum: parse_checksum(row.remote_checksum)?,
                size: size_from_sql(row.remote_size),
            },
            query_at: parse_ts(&row.query_at)?,
            download: DownloadRecord {
                started_at: parse_opt(row.download_started_at)?,
                ended_at: parse_opt(row.download_ended_at)?,
                done: row.downloaded,
                local_path: row.download_path,
                checksum: parse_checksum(row.download_checksum)?,
                size: size_from_sql(row.download_size),
            },
            ard: ArdRecord {
                started_at: parse_opt(row.ard_started_at)?,
                ended_at: parse_opt(row.ard_ended_at)?,
                done: row.ard_done,
                product_path: row.ard_path,
            },
            invalid: row.invalid,
            archived: row.archived,
            extended_info: parse_extended_info(&row.extended_info)?,
            extra: serde_json::from_str(&row.extra)?,
        })
    }
}
