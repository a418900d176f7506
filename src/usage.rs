use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::warn;

use crate::domain::{ProviderName, format_ts, parse_ts};
use crate::error::TerraError;
use crate::store;

/// Flags describing what a stage did, written alongside its description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageFlags {
    pub updated_db: bool,
    pub new_scenes: bool,
    pub downloaded: bool,
    pub converted: bool,
    pub analysed: bool,
    pub start_block: bool,
    pub end_block: bool,
}

impl UsageFlags {
    pub fn start_block() -> Self {
        Self {
            start_block: true,
            ..Self::default()
        }
    }

    pub fn end_block() -> Self {
        Self {
            end_block: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEntry {
    pub id: i64,
    pub logged_at: DateTime<Utc>,
    pub provider: String,
    pub description: String,
    pub flags: UsageFlags,
}

/// Append-only audit trail of pipeline activity. Writing to it never fails a
/// stage: problems are logged and dropped.
#[derive(Debug, Clone)]
pub struct UsageLog {
    db_path: Utf8PathBuf,
}

impl UsageLog {
    pub fn open(db_path: impl Into<Utf8PathBuf>) -> Result<Self, TerraError> {
        let db_path = db_path.into();
        store::initialize(&db_path)?;
        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Utf8Path {
        &self.db_path
    }

    pub fn record(&self, provider: &ProviderName, description: &str, flags: UsageFlags) {
        if let Err(err) = self.try_record(provider, description, flags) {
            warn!(provider = %provider, description, error = %err, "failed to write usage log");
        }
    }

    fn try_record(
        &self,
        provider: &ProviderName,
        description: &str,
        flags: UsageFlags,
    ) -> Result<(), TerraError> {
        let conn = store::connect(&self.db_path)?;
        conn.execute(
            "INSERT INTO usage_log (logged_at, provider, description, updated_db, new_scenes, \
             downloaded, converted, analysed, start_block, end_block) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                format_ts(&Utc::now()),
                provider.as_str(),
                description,
                flags.updated_db,
                flags.new_scenes,
                flags.downloaded,
                flags.converted,
                flags.analysed,
                flags.start_block,
                flags.end_block,
            ],
        )?;
        Ok(())
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Result<Vec<UsageEntry>, TerraError> {
        let conn = store::connect(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, logged_at, provider, description, updated_db, new_scenes, downloaded, \
             converted, analysed, start_block, end_block FROM usage_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    UsageFlags {
                        updated_db: row.get(4)?,
                        new_scenes: row.get(5)?,
                        downloaded: row.get(6)?,
                        converted: row.get(7)?,
                        analysed: row.get(8)?,
                        start_block: row.get(9)?,
                        end_block: row.get(10)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, logged_at, provider, description, flags)| {
                Ok(UsageEntry {
                    id,
                    logged_at: parse_ts(&logged_at)?,
                    provider,
                    description,
                    flags,
                })
            })
            .collect()
    }
}
