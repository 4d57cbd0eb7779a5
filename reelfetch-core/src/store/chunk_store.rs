use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};

use crate::error::StoreError;
use crate::sqlite::configure_connection;

const CHUNK_SCHEMA: &str = include_str!("../../../sql/chunks.sql");

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct ChunkStoreBuilder {
    path: Option<PathBuf>,
}

impl Default for ChunkStoreBuilder {
    fn default() -> Self {
        Self { path: None }
    }
}

impl ChunkStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> Result<ChunkStore> {
        let path = self
            .path
            .ok_or_else(|| StoreError::NotFound("chunk store path not configured".to_string()))?;
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        configure_connection(&conn)?;
        conn.execute_batch(CHUNK_SCHEMA)?;
        Ok(ChunkStore { path })
    }
}

/// Durable key-value store of `(downloadId, index) -> bytes`, backed by a
/// WAL-mode SQLite database. Operations mirror §4.D exactly.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    path: PathBuf,
}

impl ChunkStore {
    pub fn builder() -> ChunkStoreBuilder {
        ChunkStoreBuilder::new()
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        ChunkStoreBuilder::new().path(path).build()
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        configure_connection(&conn)?;
        Ok(conn)
    }

    /// Overwrite-safe put; atomic per key via `INSERT ... ON CONFLICT`.
    pub fn put(&self, download_id: &str, index: usize, bytes: &[u8]) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO chunks (download_id, idx, bytes) VALUES (?1, ?2, ?3)\n\
             ON CONFLICT(download_id, idx) DO UPDATE SET bytes = excluded.bytes",
            params![download_id, index as i64, bytes],
        )?;
        Ok(())
    }

    /// Single cursor scan over `[start_idx, start_idx + length)`, returned
    /// in ascending index order.
    pub fn get_range(
        &self,
        download_id: &str,
        start_idx: usize,
        length: usize,
    ) -> Result<BTreeMap<usize, Vec<u8>>> {
        let conn = self.connect()?;
        let end_idx = start_idx + length;
        let mut stmt = conn.prepare(
            "SELECT idx, bytes FROM chunks\n\
             WHERE download_id = ?1 AND idx >= ?2 AND idx < ?3\n\
             ORDER BY idx ASC",
        )?;
        let rows = stmt.query_map(params![download_id, start_idx as i64, end_idx as i64], |row| {
            let idx: i64 = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            Ok((idx as usize, bytes))
        })?;
        let mut map = BTreeMap::new();
        for row in rows {
            let (idx, bytes) = row?;
            map.insert(idx, bytes);
        }
        Ok(map)
    }

    pub fn count(&self, download_id: &str) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE download_id = ?1",
            params![download_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Cursor-scan delete of every chunk belonging to `download_id`.
    pub fn delete_all(&self, download_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM chunks WHERE download_id = ?1",
            params![download_id],
        )?;
        Ok(())
    }

    pub fn list_download_ids(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT DISTINCT download_id FROM chunks")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("chunks.sqlite3")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_range_round_trips_in_order() {
        let (_dir, store) = temp_store();
        store.put("dl1", 0, b"aaa").unwrap();
        store.put("dl1", 2, b"ccc").unwrap();
        store.put("dl1", 1, b"bbb").unwrap();
        let range = store.get_range("dl1", 0, 3).unwrap();
        let ordered: Vec<_> = range.into_iter().collect();
        assert_eq!(ordered[0], (0, b"aaa".to_vec()));
        assert_eq!(ordered[1], (1, b"bbb".to_vec()));
        assert_eq!(ordered[2], (2, b"ccc".to_vec()));
    }

    #[test]
    fn put_is_overwrite_safe() {
        let (_dir, store) = temp_store();
        store.put("dl1", 0, b"first").unwrap();
        store.put("dl1", 0, b"second").unwrap();
        assert_eq!(store.count("dl1").unwrap(), 1);
        let range = store.get_range("dl1", 0, 1).unwrap();
        assert_eq!(range.get(&0).unwrap(), b"second");
    }

    #[test]
    fn delete_all_removes_only_that_download() {
        let (_dir, store) = temp_store();
        store.put("dl1", 0, b"x").unwrap();
        store.put("dl2", 0, b"y").unwrap();
        store.delete_all("dl1").unwrap();
        assert_eq!(store.count("dl1").unwrap(), 0);
        assert_eq!(store.count("dl2").unwrap(), 1);
    }

    #[test]
    fn list_download_ids_returns_distinct_partitions() {
        let (_dir, store) = temp_store();
        store.put("dl1", 0, b"x").unwrap();
        store.put("dl1", 1, b"x").unwrap();
        store.put("dl2", 0, b"y").unwrap();
        let mut ids = store.list_download_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["dl1".to_string(), "dl2".to_string()]);
    }
}
