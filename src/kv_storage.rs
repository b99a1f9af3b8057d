//! Hybrid metadata-index-plus-blob store on a single directory.
//!
//! `KvStorage` is thread-*compatible*, not thread-*safe*: every method takes
//! `&mut self` for mutating operations and assumes a single caller at a
//! time. Concurrency discipline (one mutex per cache, async dispatch) is
//! layered on top by [`crate::disk::DiskCache`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::StorageMode;
use crate::error::{CacheError, Result};
use crate::serializer::{DefaultFilenameDeriver, FilenameDeriver, SharedFilenameDeriver};

const PAGE_SIZE: usize = 16;
const MANIFEST_FORMAT_VERSION: u32 = 1;

/// A metadata row. Exactly one of `filename`/`inline_data` is `Some`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub filename: Option<String>,
    pub size: u32,
    pub inline_data: Option<Vec<u8>>,
    pub modification_time: i64,
    pub last_access_time: i64,
    pub extended_data: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    mode: u8,
    inline_threshold: u64,
}

fn mode_tag(mode: StorageMode) -> u8 {
    match mode {
        StorageMode::File => 0,
        StorageMode::Inline => 1,
        StorageMode::Mixed => 2,
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn index_err(e: impl std::error::Error + Send + Sync + 'static) -> CacheError {
    CacheError::Index { source: e.into() }
}

pub struct KvStorage {
    conn: Connection,
    root: PathBuf,
    data_dir: PathBuf,
    trash_dir: PathBuf,
    dirty_marker: PathBuf,
    mode: StorageMode,
    inline_threshold: u64,
    filename_deriver: SharedFilenameDeriver,
}

impl KvStorage {
    pub fn open(root: impl AsRef<Path>, mode: StorageMode, inline_threshold: u64) -> Result<Self> {
        Self::open_with_deriver(root, mode, inline_threshold, std::sync::Arc::new(DefaultFilenameDeriver))
    }

    pub fn open_with_deriver(
        root: impl AsRef<Path>,
        mode: StorageMode,
        inline_threshold: u64,
        filename_deriver: SharedFilenameDeriver,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let data_dir = root.join("data");
        let trash_dir = root.join("trash");
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&trash_dir)?;

        let dirty_marker = root.join(".dirty");
        let was_dirty = dirty_marker.exists();

        let conn = Connection::open(root.join("index.db")).map_err(index_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS items (
                key               TEXT PRIMARY KEY,
                filename          TEXT,
                size              INTEGER NOT NULL,
                inline_data       BLOB,
                modification_time INTEGER NOT NULL,
                last_access_time  INTEGER NOT NULL,
                extended_data     BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_items_last_access ON items(last_access_time);
            CREATE INDEX IF NOT EXISTS idx_items_size ON items(size);",
        )
        .map_err(index_err)?;

        let mut storage = Self {
            conn,
            root,
            data_dir,
            trash_dir,
            dirty_marker,
            mode,
            inline_threshold,
            filename_deriver,
        };

        storage.open_or_validate_manifest()?;

        if was_dirty {
            info!(root = %storage.root.display(), "dirty marker present, running reconciliation");
            storage.reconcile()?;
        }

        Ok(storage)
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest")
    }

    fn open_or_validate_manifest(&mut self) -> Result<()> {
        let path = self.manifest_path();
        if let Ok(bytes) = fs::read(&path) {
            let manifest: Manifest = rmp_serde::from_slice(&bytes).map_err(|source| CacheError::Deserialization { source })?;
            if manifest.format_version != MANIFEST_FORMAT_VERSION {
                return Err(CacheError::InvalidArgument("store manifest format version is not supported"));
            }
            if manifest.mode != mode_tag(self.mode) {
                return Err(CacheError::InvalidArgument(
                    "store was created with a different storage mode",
                ));
            }
            // inline_threshold may legitimately change across opens in mixed
            // mode; only the mode itself is a hard compatibility constraint.
            Ok(())
        } else {
            let manifest = Manifest {
                format_version: MANIFEST_FORMAT_VERSION,
                mode: mode_tag(self.mode),
                inline_threshold: self.inline_threshold,
            };
            let bytes = rmp_serde::to_vec(&manifest).map_err(|source| CacheError::Serialization { source })?;
            fs::write(&path, bytes)?;
            Ok(())
        }
    }

    fn touch_dirty_marker(&self) -> Result<()> {
        if !self.dirty_marker.exists() {
            fs::write(&self.dirty_marker, b"")?;
        }
        Ok(())
    }

    /// Clears the dirty marker. Call on a graceful shutdown; skipping this
    /// (e.g. on a crash) is exactly what makes the next `open` mandatory-
    /// reconcile.
    pub fn close(self) -> Result<()> {
        if self.dirty_marker.exists() {
            fs::remove_file(&self.dirty_marker)?;
        }
        Ok(())
    }

    /// Restores the invariant that index rows and data files correspond
    /// one-to-one: purge rows pointing at missing files, trash files no row
    /// references.
    pub fn reconcile(&mut self) -> Result<()> {
        let mut referenced: HashSet<String> = HashSet::new();
        let mut missing_keys: Vec<String> = Vec::new();

        {
            let mut stmt = self
                .conn
                .prepare("SELECT key, filename FROM items WHERE filename IS NOT NULL")
                .map_err(index_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(index_err)?;
            for row in rows {
                let (key, filename) = row.map_err(index_err)?;
                if self.data_dir.join(&filename).is_file() {
                    referenced.insert(filename);
                } else {
                    missing_keys.push(key);
                }
            }
        }

        if !missing_keys.is_empty() {
            warn!(count = missing_keys.len(), "purging rows with missing backing files");
            self.remove_items(&missing_keys)?;
        }

        let mut orphans = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.data_dir) {
            for entry in entries.flatten() {
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !referenced.contains(&name) {
                    orphans.push(name);
                }
            }
        }

        if !orphans.is_empty() {
            info!(count = orphans.len(), "trashing orphan blob files");
            for name in orphans {
                let _ = self.trash_file(&name);
            }
        }

        Ok(())
    }

    fn trash_file(&self, filename: &str) -> Result<()> {
        let src = self.data_dir.join(filename);
        if !src.exists() {
            return Ok(());
        }
        let dest = self.trash_dir.join(format!("{}-{}", uuid::Uuid::new_v4(), filename));
        fs::rename(src, dest)?;
        Ok(())
    }

    /// Empties every file currently sitting in the trash directory. Meant
    /// to be called periodically by a background sweeper; failures to
    /// remove an individual entry are logged and left for the next sweep.
    pub fn sweep_trash(&self) -> Result<usize> {
        let mut removed = 0;
        let entries = match fs::read_dir(&self.trash_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(error) => warn!(path = %path.display(), %error, "failed to sweep trash entry, retrying next sweep"),
            }
        }
        Ok(removed)
    }

    fn write_blob(&self, filename: &str, value: &[u8]) -> Result<()> {
        let tmp = self.data_dir.join(format!(".{}-{}.tmp", uuid::Uuid::new_v4(), filename));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, self.data_dir.join(filename))?;
        Ok(())
    }

    /// Writes `value` under `key`. If `filename` is `Some`, the value is
    /// always stored out-of-line under that name regardless of storage
    /// mode. `extended` carries caller-opaque metadata; passing `None`
    /// preserves whatever was already stored for the key.
    pub fn save(&mut self, key: &str, value: &[u8], filename: Option<&str>, extended: Option<&[u8]>) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        self.touch_dirty_marker()?;

        let now = now_unix();
        let (stored_filename, inline_data): (Option<String>, Option<Vec<u8>>) = if let Some(explicit) = filename {
            self.write_blob(explicit, value)?;
            (Some(explicit.to_string()), None)
        } else if matches!(self.mode, StorageMode::Inline)
            || (matches!(self.mode, StorageMode::Mixed) && (value.len() as u64) <= self.inline_threshold)
        {
            (None, Some(value.to_vec()))
        } else {
            let derived = self.filename_deriver.derive(key);
            self.write_blob(&derived, value)?;
            (Some(derived), None)
        };

        let upserted = self
            .conn
            .execute(
                "INSERT INTO items (key, filename, size, inline_data, modification_time, last_access_time, extended_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                    filename = excluded.filename,
                    size = excluded.size,
                    inline_data = excluded.inline_data,
                    modification_time = excluded.modification_time,
                    last_access_time = excluded.last_access_time,
                    extended_data = COALESCE(excluded.extended_data, items.extended_data)",
                params![key, stored_filename, value.len() as u32, inline_data, now, extended],
            )
            .map_err(index_err);

        if let Err(error) = upserted {
            // the blob we just wrote has no referencing row now; don't leave
            // it for the next open's reconciliation pass to clean up.
            if let Some(filename) = &stored_filename {
                let _ = self.trash_file(filename);
            }
            return Err(error);
        }

        Ok(true)
    }

    fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
        Ok(Item {
            key: row.get(0)?,
            filename: row.get(1)?,
            size: row.get(2)?,
            inline_data: row.get(3)?,
            modification_time: row.get(4)?,
            last_access_time: row.get(5)?,
            extended_data: row.get(6)?,
        })
    }

    const SELECT_COLUMNS: &'static str =
        "key, filename, size, inline_data, modification_time, last_access_time, extended_data";

    /// Metadata lookup; does not refresh `last_access_time` (use
    /// [`Self::get_value`] for that).
    pub fn get(&self, key: &str) -> Result<Option<Item>> {
        if key.is_empty() {
            return Ok(None);
        }
        self.conn
            .query_row(
                &format!("SELECT {} FROM items WHERE key = ?1", Self::SELECT_COLUMNS),
                params![key],
                Self::row_to_item,
            )
            .optional()
            .map_err(index_err)
    }

    /// Resolves the value bytes for `key`, reading the backing file if the
    /// row isn't stored inline, and refreshes `last_access_time`.
    pub fn get_value(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(item) = self.get(key)? else {
            return Ok(None);
        };

        let bytes = if let Some(data) = item.inline_data {
            data
        } else if let Some(filename) = &item.filename {
            fs::read(self.data_dir.join(filename))?
        } else {
            return Ok(None);
        };

        let now = now_unix();
        self.conn
            .execute("UPDATE items SET last_access_time = ?1 WHERE key = ?2", params![now, key])
            .map_err(index_err)?;

        Ok(Some(bytes))
    }

    pub fn remove(&mut self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let Some(item) = self.get(key)? else {
            return Ok(false);
        };
        self.conn.execute("DELETE FROM items WHERE key = ?1", params![key]).map_err(index_err)?;
        if let Some(filename) = item.filename {
            self.trash_file(&filename)?;
        }
        Ok(true)
    }

    pub fn remove_items(&mut self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    pub fn remove_all_below_size(&mut self, size: u32) -> Result<u64> {
        let keys = self.keys_matching("size < ?1", params![size])?;
        let count = keys.len() as u64;
        self.remove_items(&keys)?;
        Ok(count)
    }

    pub fn remove_all_before_time(&mut self, time: i64) -> Result<u64> {
        let keys = self.keys_matching("last_access_time < ?1", params![time])?;
        let count = keys.len() as u64;
        self.remove_items(&keys)?;
        Ok(count)
    }

    fn keys_matching(&self, predicate: &str, params: impl rusqlite::Params) -> Result<Vec<String>> {
        let sql = format!("SELECT key FROM items WHERE {}", predicate);
        let mut stmt = self.conn.prepare(&sql).map_err(index_err)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0)).map_err(index_err)?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(index_err)?);
        }
        Ok(keys)
    }

    fn next_page(&self, limit: usize) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM items ORDER BY last_access_time ASC LIMIT ?1",
            Self::SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(index_err)?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_item).map_err(index_err)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(index_err)?);
        }
        Ok(items)
    }

    pub fn item_count(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get::<_, i64>(0))
            .map(|v| v as u64)
            .map_err(index_err)
    }

    pub fn item_size_sum(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COALESCE(SUM(size), 0) FROM items", [], |row| row.get::<_, i64>(0))
            .map(|v| v as u64)
            .map_err(index_err)
    }

    /// Evicts least-recently-used items, one page at a time, until
    /// `item_size_sum() <= target`.
    pub fn remove_items_to_fit_size(&mut self, target: u64) -> Result<u64> {
        let mut removed = 0u64;
        while self.item_size_sum()? > target {
            let page = self.next_page(PAGE_SIZE)?;
            if page.is_empty() {
                break;
            }
            let keys: Vec<String> = page.into_iter().map(|item| item.key).collect();
            removed += keys.len() as u64;
            self.remove_items(&keys)?;
        }
        Ok(removed)
    }

    /// Evicts least-recently-used items, one page at a time, until
    /// `item_count() <= target`.
    pub fn remove_items_to_fit_count(&mut self, target: u64) -> Result<u64> {
        let mut removed = 0u64;
        while self.item_count()? > target {
            let page = self.next_page(PAGE_SIZE)?;
            if page.is_empty() {
                break;
            }
            let keys: Vec<String> = page.into_iter().map(|item| item.key).collect();
            removed += keys.len() as u64;
            self.remove_items(&keys)?;
        }
        Ok(removed)
    }

    pub fn enumerate_items_with_size_greater_than(&self, size: u32) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM items WHERE size > ?1 ORDER BY last_access_time ASC",
            Self::SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(index_err)?;
        let rows = stmt.query_map(params![size], Self::row_to_item).map_err(index_err)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(index_err)?);
        }
        Ok(items)
    }

    pub fn enumerate_items_accessed_before(&self, time: i64) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM items WHERE last_access_time < ?1 ORDER BY last_access_time ASC",
            Self::SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(index_err)?;
        let rows = stmt.query_map(params![time], Self::row_to_item).map_err(index_err)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(index_err)?);
        }
        Ok(items)
    }

    /// Short-circuits a row-by-row wipe: renames the whole blob directory
    /// into trash and recreates an empty one, then bulk-deletes the index
    /// rows in one statement. `progress_cb`/`end_cb` still fire once each
    /// so callers relying on the progress-reporting contract keep working.
    pub fn remove_all(
        &mut self,
        mut progress_cb: Option<&mut dyn FnMut(u64, u64)>,
        mut end_cb: Option<&mut dyn FnMut(bool)>,
    ) -> Result<()> {
        let total = self.item_count()?;

        let outcome = (|| -> Result<()> {
            if self.data_dir.exists() {
                let dest = self.trash_dir.join(uuid::Uuid::new_v4().to_string());
                fs::rename(&self.data_dir, &dest)?;
            }
            fs::create_dir_all(&self.data_dir)?;
            self.conn.execute("DELETE FROM items", []).map_err(index_err)?;
            Ok(())
        })();

        if outcome.is_ok() {
            if let Some(cb) = progress_cb.as_deref_mut() {
                cb(total, total);
            }
        }
        if let Some(cb) = end_cb.as_deref_mut() {
            cb(outcome.is_err());
        }
        outcome
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn trash_dir(&self) -> &Path {
        &self.trash_dir
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn open(mode: StorageMode) -> (KvStorage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = KvStorage::open(dir.path(), mode, 20_480).unwrap();
        (storage, dir)
    }

    #[test]
    fn save_and_get_value_round_trips_inline() {
        let (mut storage, _dir) = open(StorageMode::Mixed);
        assert!(storage.save("k", b"hello", None, None).unwrap());
        let item = storage.get("k").unwrap().unwrap();
        assert!(item.inline_data.is_some());
        assert!(item.filename.is_none());
        assert_eq!(storage.get_value("k").unwrap().unwrap(), b"hello");
    }

    #[test]
    fn inline_threshold_boundary() {
        let (mut storage, _dir) = open(StorageMode::Mixed);
        let at_threshold = vec![0u8; 20_480];
        let over_threshold = vec![0u8; 20_481];

        storage.save("at", &at_threshold, None, None).unwrap();
        let at_item = storage.get("at").unwrap().unwrap();
        assert!(at_item.filename.is_none());
        assert!(at_item.inline_data.is_some());

        storage.save("over", &over_threshold, None, None).unwrap();
        let over_item = storage.get("over").unwrap().unwrap();
        assert!(over_item.filename.is_some());
        assert!(over_item.inline_data.is_none());
    }

    #[test]
    fn remove_moves_file_to_trash_not_unlink() {
        let (mut storage, _dir) = open(StorageMode::File);
        storage.save("k", b"payload", None, None).unwrap();
        let item = storage.get("k").unwrap().unwrap();
        let filename = item.filename.unwrap();
        assert!(storage.data_dir().join(&filename).exists());

        storage.remove("k").unwrap();
        assert!(!storage.data_dir().join(&filename).exists());
        assert_eq!(storage.sweep_trash().unwrap(), 1);
    }

    #[test]
    fn empty_key_is_a_no_op() {
        let (mut storage, _dir) = open(StorageMode::Mixed);
        assert!(!storage.save("", b"x", None, None).unwrap());
        assert!(storage.get("").unwrap().is_none());
        assert!(!storage.remove("").unwrap());
    }

    #[test]
    fn remove_items_to_fit_count_evicts_oldest_first() {
        let (mut storage, _dir) = open(StorageMode::Mixed);
        for key in ["a", "b", "c", "d"] {
            storage.save(key, key.as_bytes(), None, None).unwrap();
        }
        let removed = storage.remove_items_to_fit_count(2).unwrap();
        assert_eq!(removed, 2);
        assert!(storage.get("a").unwrap().is_none());
        assert!(storage.get("b").unwrap().is_none());
        assert!(storage.get("c").unwrap().is_some());
        assert!(storage.get("d").unwrap().is_some());
    }

    #[test]
    fn remove_all_wipes_rows_and_files() {
        let (mut storage, _dir) = open(StorageMode::File);
        for key in ["a", "b", "c"] {
            storage.save(key, key.as_bytes(), None, None).unwrap();
        }
        let mut progress_calls = Vec::new();
        let mut ended_with_error = None;
        storage
            .remove_all(Some(&mut |removed, total| progress_calls.push((removed, total))), Some(&mut |err| ended_with_error = Some(err)))
            .unwrap();

        assert_eq!(storage.item_count().unwrap(), 0);
        assert_eq!(progress_calls, vec![(3, 3)]);
        assert_eq!(ended_with_error, Some(false));
    }

    #[test]
    fn reopening_with_a_different_mode_is_rejected() {
        let dir = tempdir().unwrap();
        KvStorage::open(dir.path(), StorageMode::File, 20_480).unwrap();
        let reopened = KvStorage::open(dir.path(), StorageMode::Inline, 20_480);
        assert!(matches!(reopened, Err(CacheError::InvalidArgument(_))));
    }

    #[test]
    fn reconciliation_purges_rows_with_missing_files_and_trashes_orphans() {
        let dir = tempdir().unwrap();
        {
            let mut storage = KvStorage::open(dir.path(), StorageMode::File, 20_480).unwrap();
            storage.save("k", b"payload", None, None).unwrap();
            // don't close(): leaves the dirty marker behind
        }

        // simulate an orphan file with no backing row, and a row with a
        // missing file, then reopen and reconcile.
        let orphan_path = dir.path().join("data").join("orphan-blob");
        fs::write(&orphan_path, b"orphan").unwrap();

        let mut storage = KvStorage::open(dir.path(), StorageMode::File, 20_480).unwrap();
        assert!(storage.get("k").unwrap().is_some());
        assert!(!orphan_path.exists());
        assert_eq!(storage.sweep_trash().unwrap(), 1);
    }
}
