use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::error::StoreError;
use crate::sqlite::configure_connection;
use crate::types::{DownloadId, DownloadState, Progress, Stage};

const STATE_SCHEMA: &str = include_str!("../../../sql/downloads.sql");

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct StateStoreBuilder {
    path: Option<PathBuf>,
}

impl Default for StateStoreBuilder {
    fn default() -> Self {
        Self { path: None }
    }
}

impl StateStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> Result<StateStore> {
        let path = self
            .path
            .ok_or_else(|| StoreError::NotFound("state store path not configured".to_string()))?;
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        configure_connection(&conn)?;
        conn.execute_batch(STATE_SCHEMA)?;
        Ok(StateStore { path })
    }
}

/// Persists [`DownloadState`], keyed by `id` with secondary indexes on
/// `url`, `updatedAt`, `createdAt` per §6.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn builder() -> StateStoreBuilder {
        StateStoreBuilder::new()
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        StateStoreBuilder::new().path(path).build()
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        configure_connection(&conn)?;
        Ok(conn)
    }

    pub fn upsert(&self, state: &DownloadState) -> Result<()> {
        let conn = self.connect()?;
        let metadata_json = serde_json::to_string(&state.metadata)
            .map_err(|err| StoreError::NotFound(format!("metadata serialization failed: {err}")))?;
        conn.execute(
            "INSERT INTO downloads (\n\
                id, url, created_at, updated_at, metadata_json, stage,\n\
                downloaded, total, percentage, speed, message, error,\n\
                segments_collected, local_path, chrome_download_id\n\
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)\n\
             ON CONFLICT(id) DO UPDATE SET\n\
                url = excluded.url,\n\
                updated_at = excluded.updated_at,\n\
                metadata_json = excluded.metadata_json,\n\
                stage = excluded.stage,\n\
                downloaded = excluded.downloaded,\n\
                total = excluded.total,\n\
                percentage = excluded.percentage,\n\
                speed = excluded.speed,\n\
                message = excluded.message,\n\
                error = excluded.error,\n\
                segments_collected = excluded.segments_collected,\n\
                local_path = excluded.local_path,\n\
                chrome_download_id = excluded.chrome_download_id",
            params![
                state.id.as_str(),
                state.url,
                state.created_at.to_rfc3339(),
                state.updated_at.map(|ts| ts.to_rfc3339()),
                metadata_json,
                state.stage.as_str(),
                state.progress.downloaded as i64,
                state.progress.total as i64,
                state.progress.percentage,
                state.progress.speed,
                state.progress.message,
                state.progress.error,
                state.progress.segments_collected.map(|v| v as i64),
                state.local_path,
                state.chrome_download_id,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &DownloadId) -> Result<Option<DownloadState>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT * FROM downloads WHERE id = ?1",
            params![id.as_str()],
            row_to_state,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn delete(&self, id: &DownloadId) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM downloads WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<DownloadState> {
    let metadata_json: Option<String> = row.get("metadata_json")?;
    let metadata = metadata_json
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let stage: String = row.get("stage")?;
    Ok(DownloadState {
        id: DownloadId::new(row.get::<_, String>("id")?),
        url: row.get("url")?,
        created_at: parse_timestamp(row.get("created_at")?)?,
        updated_at: row
            .get::<_, Option<String>>("updated_at")?
            .map(|raw| parse_timestamp(raw))
            .transpose()?,
        metadata,
        stage: stage.parse().unwrap_or(Stage::Failed),
        progress: Progress {
            downloaded: row.get::<_, i64>("downloaded")? as u64,
            total: row.get::<_, i64>("total")? as u64,
            percentage: row.get("percentage")?,
            speed: row.get("speed")?,
            message: row.get("message")?,
            error: row.get("error")?,
            segments_collected: row
                .get::<_, Option<i64>>("segments_collected")?
                .map(|v| v as u64),
        },
        local_path: row.get("local_path")?,
        chrome_download_id: row.get("chrome_download_id")?,
    })
}

fn parse_timestamp(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                0,
                "timestamp".to_string(),
                rusqlite::types::Type::Text,
            )
        })
}
