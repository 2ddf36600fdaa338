//! The persistent job catalog.
//!
//! One SQLite database backs three tables: `directory` (one row per
//! discovered file, doubling as the first-loop work queue), `hash_table`
//! (deduplicated perceptual hash strings with reference counts), and
//! `dif_table` (one row per compared pair). Only the orchestrator thread
//! touches the catalog; workers communicate through channels, which keeps
//! every operation here single-writer.
//!
//! The work-queue and result-store concerns share the `directory` table but
//! stay separate in the API: claim/reset for the queue, record/fetch/query
//! for results.

use rusqlite::{Connection, params};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("catalog operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("hash string missing from hash table: {0}")]
    HashMiss(String),
}

/// A file discovered by the walker, ready for insertion.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub allowed: bool,
    pub size: i64,
    /// Creation/modification timestamp in seconds.
    pub created: f64,
}

/// A queued file handed to the first loop. `success` is already marked
/// claimed (-2) by the time the caller sees this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedFile {
    pub key: i64,
    pub path: PathBuf,
}

/// A successful first-loop result ready to be recorded.
#[derive(Debug, Clone)]
pub struct PreprocessRow {
    pub key: i64,
    pub px: i64,
    pub py: i64,
    /// Hash-table keys for the four rotations, when hashing ran.
    pub hashes: Option<[i64; 4]>,
}

/// Which optional columns a block fetch should materialize.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowFields {
    pub paths: bool,
    pub hashes: bool,
    pub dims: bool,
}

/// A contiguous window of directory rows ordered by key.
///
/// Optional vectors run parallel to `keys`; hash entries are `None` for
/// rows that failed the first loop.
#[derive(Debug, Default)]
pub struct BlockRows {
    pub keys: Vec<i64>,
    pub paths: Option<Vec<PathBuf>>,
    pub hashes: Option<Vec<Option<[i64; 4]>>>,
    pub dims: Option<Vec<(i64, i64)>>,
}

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        info!(target: "store", path = %path.display(), "catalog_opened");
        Ok(Self { conn })
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    // ---------------------------------------------------------------------
    // Schema
    // ---------------------------------------------------------------------

    fn directory_schema(table: &str) -> String {
        format!(
            "CREATE TABLE {table} (\
             key INTEGER PRIMARY KEY AUTOINCREMENT, \
             path TEXT, \
             filename TEXT, \
             error TEXT, \
             success INTEGER DEFAULT -1 CHECK ({table}.success IN (-2, -1, 0, 1)), \
             px INTEGER DEFAULT -1 CHECK ({table}.px >= -1), \
             py INTEGER DEFAULT -1 CHECK ({table}.py >= -1), \
             allowed INTEGER DEFAULT 0 CHECK ({table}.allowed IN (0, 1)), \
             file_size INTEGER DEFAULT -1 CHECK ({table}.file_size >= -1), \
             created REAL DEFAULT -1 CHECK ({table}.created >= -1), \
             dir_index INTEGER DEFAULT -1 CHECK ({table}.dir_index >= -1), \
             part_b INTEGER DEFAULT 0 CHECK ({table}.part_b IN (0, 1)), \
             hash_0 INTEGER, \
             hash_90 INTEGER, \
             hash_180 INTEGER, \
             hash_270 INTEGER, \
             UNIQUE (path, part_b))"
        )
    }

    pub fn create_directory_table(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(&Self::directory_schema("directory"))?;
        self.create_directory_indexes()?;
        Ok(())
    }

    fn create_directory_indexes(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE INDEX directory_key_index ON directory (key); \
             CREATE INDEX directory_partition_index ON directory (part_b); \
             CREATE INDEX directory_success_index ON directory (success); \
             CREATE INDEX directory_size_created_index ON directory (file_size, created); \
             CREATE INDEX directory_hash_0_index ON directory (hash_0); \
             CREATE INDEX directory_hash_90_index ON directory (hash_90); \
             CREATE INDEX directory_hash_180_index ON directory (hash_180); \
             CREATE INDEX directory_hash_270_index ON directory (hash_270);",
        )?;
        Ok(())
    }

    fn drop_directory_indexes(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "DROP INDEX IF EXISTS directory_key_index; \
             DROP INDEX IF EXISTS directory_partition_index; \
             DROP INDEX IF EXISTS directory_success_index; \
             DROP INDEX IF EXISTS directory_size_created_index; \
             DROP INDEX IF EXISTS directory_hash_0_index; \
             DROP INDEX IF EXISTS directory_hash_90_index; \
             DROP INDEX IF EXISTS directory_hash_180_index; \
             DROP INDEX IF EXISTS directory_hash_270_index;",
        )?;
        Ok(())
    }

    pub fn directory_table_exists(&self) -> Result<bool, StoreError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'directory'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(found.is_some())
    }

    pub fn drop_directory_table(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS directory; DROP TABLE IF EXISTS directory_temp;",
        )?;
        Ok(())
    }

    pub fn create_hash_table(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE hash_table (\
             key INTEGER PRIMARY KEY AUTOINCREMENT, \
             hash TEXT UNIQUE, \
             count INTEGER CHECK (hash_table.count >= 0)); \
             CREATE INDEX hash_table_index ON hash_table (hash);",
        )?;
        Ok(())
    }

    pub fn hash_table_exists(&self) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'hash_table'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn create_diff_table(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE dif_table (\
             key INTEGER PRIMARY KEY AUTOINCREMENT, \
             key_a INTEGER NOT NULL, \
             key_b INTEGER NOT NULL, \
             dif REAL CHECK (dif_table.dif >= -1) DEFAULT -1, \
             success INT CHECK (dif_table.success IN (-1, 0, 1, 2, 3)) DEFAULT -1, \
             error TEXT, \
             UNIQUE (key_a, key_b)); \
             CREATE INDEX dif_table_key_index ON dif_table (key); \
             CREATE INDEX dif_table_pair_index ON dif_table (key_a, key_b);",
        )?;
        Ok(())
    }

    pub fn diff_table_exists(&self) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'dif_table'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ---------------------------------------------------------------------
    // Directory table: indexing
    // ---------------------------------------------------------------------

    /// Insert a batch of walked files for one root.
    pub fn bulk_insert_files(
        &mut self,
        entries: &[FileEntry],
        part_b: bool,
        dir_index: i64,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO directory (path, filename, allowed, file_size, created, dir_index, part_b) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for entry in entries {
                let path = entry.path.to_string_lossy().into_owned();
                let filename = entry
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                stmt.execute(params![
                    path,
                    filename,
                    entry.allowed as i64,
                    entry.size,
                    entry.created,
                    dir_index,
                    part_b as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Rebuild the directory table with dense zero-indexed keys: partition
    /// A's allowed rows first, then partition B's allowed rows, then
    /// everything disallowed. The dense layout is what lets the comparison
    /// plan address rows by contiguous key windows.
    pub fn repopulate_directory_table(&mut self) -> Result<(), StoreError> {
        const COLUMNS: &str = "path, filename, error, success, px, py, allowed, \
                               file_size, created, dir_index, part_b, \
                               hash_0, hash_90, hash_180, hash_270";

        self.conn.execute_batch(&Self::directory_schema("directory_temp"))?;
        self.conn.execute(
            &format!(
                "INSERT INTO directory_temp ({COLUMNS}) \
                 SELECT {COLUMNS} FROM directory \
                 WHERE part_b = 0 AND allowed = 1 ORDER BY key"
            ),
            [],
        )?;
        self.conn.execute(
            &format!(
                "INSERT INTO directory_temp ({COLUMNS}) \
                 SELECT {COLUMNS} FROM directory \
                 WHERE part_b = 1 AND allowed = 1 ORDER BY key"
            ),
            [],
        )?;
        self.conn.execute(
            &format!(
                "INSERT INTO directory_temp ({COLUMNS}) \
                 SELECT {COLUMNS} FROM directory \
                 WHERE allowed = 0 ORDER BY part_b, key"
            ),
            [],
        )?;
        // Zero-index the keys; rows are visited in ascending rowid order so
        // each update moves a key into a slot that is already free.
        self.conn.execute(
            "UPDATE directory_temp \
             SET key = key - (SELECT MIN(key) FROM directory_temp)",
            [],
        )?;
        self.conn.execute("DROP TABLE directory", [])?;
        self.conn
            .execute("ALTER TABLE directory_temp RENAME TO directory", [])?;
        self.drop_directory_indexes()?;
        self.create_directory_indexes()?;
        debug!(target: "store", "directory_repopulated");
        Ok(())
    }

    pub fn partition_count(&self, part_b: bool, only_allowed: bool) -> Result<usize, StoreError> {
        let stmt = if only_allowed {
            "SELECT COUNT(*) FROM directory WHERE part_b = ?1 AND allowed = 1"
        } else {
            "SELECT COUNT(*) FROM directory WHERE part_b = ?1"
        };
        let count: i64 = self
            .conn
            .query_row(stmt, params![part_b as i64], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ---------------------------------------------------------------------
    // Directory table: first-loop work queue
    // ---------------------------------------------------------------------

    /// Claim up to `n` queued rows, marking them in-flight. Atomic and
    /// ordered by key so a resumed run claims deterministically.
    pub fn claim_batch(&mut self, n: usize) -> Result<Vec<ClaimedFile>, StoreError> {
        let tx = self.conn.transaction()?;
        let mut claimed = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT key, path FROM directory \
                 WHERE success = -1 AND allowed = 1 ORDER BY key LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![n as i64], |row| {
                Ok(ClaimedFile {
                    key: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                })
            })?;
            for row in rows {
                claimed.push(row?);
            }
            let mut update = tx.prepare("UPDATE directory SET success = -2 WHERE key = ?1")?;
            for file in &claimed {
                update.execute(params![file.key])?;
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Requeue rows a previous run claimed but never finished.
    pub fn reset_claimed(&self) -> Result<usize, StoreError> {
        let reset = self
            .conn
            .execute("UPDATE directory SET success = -1 WHERE success = -2", [])?;
        if reset > 0 {
            info!(target: "store", reset, "claimed_rows_requeued");
        }
        Ok(reset)
    }

    /// Record first-loop failures: the row becomes terminal with its error.
    pub fn record_preprocess_errors(
        &mut self,
        rows: &[(i64, String)],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE directory SET error = ?1, success = 0 WHERE key = ?2")?;
            for (key, error) in rows {
                stmt.execute(params![error, key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Record first-loop successes, with resolved hash keys when hashing ran.
    pub fn record_preprocess_success(
        &mut self,
        rows: &[PreprocessRow],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut with_hash = tx.prepare(
                "UPDATE directory SET px = ?1, py = ?2, \
                 hash_0 = ?3, hash_90 = ?4, hash_180 = ?5, hash_270 = ?6, \
                 success = 1 WHERE key = ?7",
            )?;
            let mut without_hash =
                tx.prepare("UPDATE directory SET px = ?1, py = ?2, success = 1 WHERE key = ?3")?;
            for row in rows {
                match row.hashes {
                    Some([h0, h90, h180, h270]) => {
                        with_hash.execute(params![row.px, row.py, h0, h90, h180, h270, row.key])?;
                    }
                    None => {
                        without_hash.execute(params![row.px, row.py, row.key])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Rows an interrupted or finished first loop left in each state.
    pub fn success_state_counts(&self) -> Result<HashMap<i64, usize>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT success, COUNT(*) FROM directory GROUP BY success")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (state, count) = row?;
            out.insert(state, count as usize);
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Hash table
    // ---------------------------------------------------------------------

    /// Insert hash strings, bumping the reference count on collision. The
    /// count is how cross-rotation matches become plain key equality.
    pub fn upsert_hashes(&mut self, hashes: &[String]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO hash_table (hash, count) VALUES (?1, 1) \
                 ON CONFLICT(hash) DO UPDATE SET count = count + 1",
            )?;
            for hash in hashes {
                stmt.execute(params![hash])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Resolve hash strings to their table keys. Every string must already
    /// be upserted; a miss is a catalog invariant violation.
    pub fn hash_lookup(
        &self,
        hashes: &HashSet<String>,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM hash_table WHERE hash = ?1")?;
        let mut out = HashMap::with_capacity(hashes.len());
        for hash in hashes {
            let key: Option<i64> = stmt
                .query_row(params![hash], |row| row.get(0))
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            match key {
                Some(key) => {
                    out.insert(hash.clone(), key);
                }
                None => return Err(StoreError::HashMiss(hash.clone())),
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Directory table: second-loop row windows
    // ---------------------------------------------------------------------

    /// Fetch a contiguous window of rows starting at `start`, ordered by
    /// key. Dense keys make `key >= start LIMIT len` exactly the window the
    /// block plan asked for.
    pub fn fetch_block_rows(
        &self,
        start: usize,
        len: usize,
        fields: RowFields,
    ) -> Result<BlockRows, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, path, hash_0, hash_90, hash_180, hash_270, px, py \
             FROM directory WHERE key >= ?1 ORDER BY key LIMIT ?2",
        )?;
        let mut rows = BlockRows {
            keys: Vec::with_capacity(len),
            paths: fields.paths.then(|| Vec::with_capacity(len)),
            hashes: fields.hashes.then(|| Vec::with_capacity(len)),
            dims: fields.dims.then(|| Vec::with_capacity(len)),
        };
        let mut query = stmt.query(params![start as i64, len as i64])?;
        while let Some(row) = query.next()? {
            rows.keys.push(row.get(0)?);
            if let Some(paths) = rows.paths.as_mut() {
                paths.push(PathBuf::from(row.get::<_, String>(1)?));
            }
            if let Some(hashes) = rows.hashes.as_mut() {
                let quad = (
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                );
                hashes.push(match quad {
                    (Some(h0), Some(h90), Some(h180), Some(h270)) => Some([h0, h90, h180, h270]),
                    _ => None,
                });
            }
            if let Some(dims) = rows.dims.as_mut() {
                dims.push((row.get(6)?, row.get(7)?));
            }
        }
        Ok(rows)
    }

    // ---------------------------------------------------------------------
    // Diff table
    // ---------------------------------------------------------------------

    /// Insert computed and short-circuited pair outcomes. Replayed pairs
    /// from a resumed run hit the unique index and are dropped.
    pub fn insert_diff_success(
        &mut self,
        rows: &[(i64, i64, i64, f32)],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO dif_table (key_a, key_b, success, dif) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(key_a, key_b) DO NOTHING",
            )?;
            for (key_a, key_b, code, dif) in rows {
                stmt.execute(params![key_a, key_b, code, dif])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert per-pair failures with their captured error text.
    pub fn insert_diff_errors(&mut self, rows: &[(i64, i64, String)]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO dif_table (key_a, key_b, success, dif, error) \
                 VALUES (?1, ?2, 0, -1, ?3) \
                 ON CONFLICT(key_a, key_b) DO NOTHING",
            )?;
            for (key_a, key_b, error) in rows {
                stmt.execute(params![key_a, key_b, error])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn diff_row_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM dif_table", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// All diff rows ordered by pair, for summaries and consistency checks.
    pub fn diff_rows(&self) -> Result<Vec<(i64, i64, i64, f32)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT key_a, key_b, success, dif FROM dif_table ORDER BY key_a, key_b",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All pairs below the threshold, ordered by `(key_a, key_b)`.
    pub fn duplicate_pairs(
        &self,
        delta: f32,
        include_hash_match: bool,
    ) -> Result<Vec<(String, String, f32)>, StoreError> {
        let stmt = if include_hash_match {
            "SELECT a.path, b.path, d.dif \
             FROM dif_table AS d \
             JOIN directory AS a ON a.key = d.key_a \
             JOIN directory AS b ON b.key = d.key_b \
             WHERE d.dif < ?1 AND d.success IN (1, 2) ORDER BY d.key_a, d.key_b"
        } else {
            "SELECT a.path, b.path, d.dif \
             FROM dif_table AS d \
             JOIN directory AS a ON a.key = d.key_a \
             JOIN directory AS b ON b.key = d.key_b \
             WHERE d.dif < ?1 AND d.success = 1 ORDER BY d.key_a, d.key_b"
        };
        let mut prepared = self.conn.prepare(stmt)?;
        let rows = prepared.query_map(params![delta], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Pairs below the threshold grouped into clusters around a shared
    /// anchor (the `key_a` side, or `key_b` when `group_a` is false).
    pub fn clusters(
        &self,
        delta: f32,
        group_a: bool,
        include_hash_match: bool,
    ) -> Result<Vec<(String, Vec<(String, f32)>)>, StoreError> {
        let success = if include_hash_match {
            "d.success IN (1, 2)"
        } else {
            "d.success = 1"
        };
        let order = if group_a {
            "ORDER BY d.key_a, d.key_b"
        } else {
            "ORDER BY d.key_b, d.key_a"
        };
        let stmt = format!(
            "SELECT a.path, b.path, d.dif \
             FROM dif_table AS d \
             JOIN directory AS a ON a.key = d.key_a \
             JOIN directory AS b ON b.key = d.key_b \
             WHERE d.dif < ?1 AND {success} {order}"
        );
        let mut prepared = self.conn.prepare(&stmt)?;
        let rows = prepared.query_map(params![delta], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f32>(2)?,
            ))
        })?;

        let mut out: Vec<(String, Vec<(String, f32)>)> = Vec::new();
        for row in rows {
            let (path_a, path_b, dif) = row?;
            let (anchor, peer) = if group_a {
                (path_a, path_b)
            } else {
                (path_b, path_a)
            };
            let same_anchor = out.last().is_some_and(|(head, _)| *head == anchor);
            if same_anchor {
                if let Some((_, members)) = out.last_mut() {
                    members.push((peer, dif));
                }
            } else {
                out.push((anchor, vec![(peer, dif)]));
            }
        }
        Ok(out)
    }

    /// Delete every diff row strictly above the threshold.
    pub fn drop_diff_above(&self, threshold: f32) -> Result<usize, StoreError> {
        let dropped = self
            .conn
            .execute("DELETE FROM dif_table WHERE dif > ?1", params![threshold])?;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with_files(specs: &[(&str, bool, bool)]) -> Catalog {
        // specs: (path, allowed, part_b)
        let mut cat = Catalog::open_in_memory().unwrap();
        cat.create_directory_table().unwrap();
        for (path, allowed, part_b) in specs {
            cat.bulk_insert_files(
                &[FileEntry {
                    path: PathBuf::from(path),
                    allowed: *allowed,
                    size: 100,
                    created: 1.0,
                }],
                *part_b,
                0,
            )
            .unwrap();
        }
        cat
    }

    fn directory_keys(cat: &Catalog, part_b: bool, allowed: bool) -> Vec<i64> {
        let mut stmt = cat
            .conn
            .prepare("SELECT key FROM directory WHERE part_b = ?1 AND allowed = ?2 ORDER BY key")
            .unwrap();
        let rows = stmt
            .query_map(params![part_b as i64, allowed as i64], |row| row.get(0))
            .unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn repopulation_yields_dense_partitioned_keys() {
        let mut cat = catalog_with_files(&[
            ("/b/one.png", true, true),
            ("/a/one.png", true, false),
            ("/a/skip.txt", false, false),
            ("/b/two.png", true, true),
            ("/a/two.png", true, false),
        ]);
        cat.repopulate_directory_table().unwrap();

        // Partition A allowed rows first, then B, then disallowed.
        assert_eq!(directory_keys(&cat, false, true), vec![0, 1]);
        assert_eq!(directory_keys(&cat, true, true), vec![2, 3]);
        assert_eq!(directory_keys(&cat, false, false), vec![4]);
        assert_eq!(cat.partition_count(false, true).unwrap(), 2);
        assert_eq!(cat.partition_count(true, true).unwrap(), 2);
        assert_eq!(cat.partition_count(false, false).unwrap(), 3);
    }

    #[test]
    fn claim_batch_marks_rows_and_orders_by_key() {
        let mut cat = catalog_with_files(&[
            ("/a/1.png", true, false),
            ("/a/2.png", true, false),
            ("/a/skip.txt", false, false),
            ("/a/3.png", true, false),
        ]);
        cat.repopulate_directory_table().unwrap();

        let first = cat.claim_batch(2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].key, 0);
        assert_eq!(first[1].key, 1);

        // Claimed rows are not handed out twice; disallowed rows never are.
        let second = cat.claim_batch(10).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key, 2);
        assert!(cat.claim_batch(10).unwrap().is_empty());

        let states = cat.success_state_counts().unwrap();
        assert_eq!(states.get(&-2), Some(&3));
        assert_eq!(states.get(&-1), Some(&1));
    }

    #[test]
    fn reset_claimed_requeues_interrupted_rows() {
        let mut cat = catalog_with_files(&[
            ("/a/1.png", true, false),
            ("/a/2.png", true, false),
        ]);
        cat.repopulate_directory_table().unwrap();

        let claimed = cat.claim_batch(2).unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(cat.reset_claimed().unwrap(), 2);

        // The same rows come back in the same order: resume converges with
        // no duplicates.
        let reclaimed = cat.claim_batch(2).unwrap();
        assert_eq!(reclaimed, claimed);
    }

    #[test]
    fn preprocess_results_round_trip_with_hashes() {
        let mut cat = catalog_with_files(&[
            ("/a/ok.png", true, false),
            ("/a/bad.png", true, false),
        ]);
        cat.repopulate_directory_table().unwrap();
        cat.create_hash_table().unwrap();
        cat.claim_batch(2).unwrap();

        let hashes: Vec<String> = ["h0", "h90", "h180", "h270"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cat.upsert_hashes(&hashes).unwrap();
        let lookup = cat
            .hash_lookup(&hashes.iter().cloned().collect())
            .unwrap();

        cat.record_preprocess_success(&[PreprocessRow {
            key: 0,
            px: 640,
            py: 480,
            hashes: Some([
                lookup["h0"],
                lookup["h90"],
                lookup["h180"],
                lookup["h270"],
            ]),
        }])
        .unwrap();
        cat.record_preprocess_errors(&[(1, "decode failed".to_string())])
            .unwrap();

        let states = cat.success_state_counts().unwrap();
        assert_eq!(states.get(&1), Some(&1));
        assert_eq!(states.get(&0), Some(&1));

        let rows = cat
            .fetch_block_rows(0, 2, RowFields { paths: true, hashes: true, dims: true })
            .unwrap();
        assert_eq!(rows.keys, vec![0, 1]);
        assert_eq!(rows.dims.as_ref().unwrap()[0], (640, 480));
        assert!(rows.hashes.as_ref().unwrap()[0].is_some());
        // The failed row never got hashes.
        assert!(rows.hashes.as_ref().unwrap()[1].is_none());
    }

    #[test]
    fn hash_upsert_increments_reference_counts() {
        let mut cat = Catalog::open_in_memory().unwrap();
        cat.create_hash_table().unwrap();
        cat.upsert_hashes(&["same".into(), "same".into(), "other".into()])
            .unwrap();

        let count: i64 = cat
            .conn
            .query_row(
                "SELECT count FROM hash_table WHERE hash = 'same'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);

        let missing: HashSet<String> = ["nope".to_string()].into_iter().collect();
        assert!(matches!(
            cat.hash_lookup(&missing),
            Err(StoreError::HashMiss(_))
        ));
    }

    fn seeded_diff_catalog() -> Catalog {
        let mut cat = catalog_with_files(&[
            ("/a/0.png", true, false),
            ("/a/1.png", true, false),
            ("/a/2.png", true, false),
        ]);
        cat.repopulate_directory_table().unwrap();
        cat.create_diff_table().unwrap();
        cat.insert_diff_success(&[
            (0, 1, 1, 0.5),
            (0, 2, 1, 3.0),
            (1, 2, 2, 0.0),
        ])
        .unwrap();
        cat
    }

    #[test]
    fn duplicate_pairs_filter_by_threshold_and_hash_match() {
        let cat = seeded_diff_catalog();

        let strict = cat.duplicate_pairs(1.0, false).unwrap();
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].0, "/a/0.png");
        assert_eq!(strict[0].1, "/a/1.png");

        let with_hash = cat.duplicate_pairs(1.0, true).unwrap();
        assert_eq!(with_hash.len(), 2);

        // Threshold monotonicity: a wider delta is a superset.
        let wide = cat.duplicate_pairs(10.0, false).unwrap();
        assert_eq!(wide.len(), 2);
        assert!(strict.iter().all(|p| wide.contains(p)));
    }

    #[test]
    fn pair_conflicts_are_ignored_on_replay() {
        let mut cat = seeded_diff_catalog();
        // A resumed run re-submits the same pair with a different value; the
        // first write wins.
        cat.insert_diff_success(&[(0, 1, 1, 99.0)]).unwrap();
        cat.insert_diff_errors(&[(0, 2, "late error".into())]).unwrap();

        let rows = cat.diff_rows().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (0, 1, 1, 0.5));
        assert_eq!(rows[1], (0, 2, 1, 3.0));
    }

    #[test]
    fn drop_diff_keeps_rows_at_or_below_threshold() {
        let cat = seeded_diff_catalog();
        let dropped = cat.drop_diff_above(0.5).unwrap();
        assert_eq!(dropped, 1);
        let rows = cat.diff_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.3 <= 0.5));
    }

    #[test]
    fn clusters_group_contiguous_anchors() {
        let cat = seeded_diff_catalog();
        let clusters = cat.clusters(10.0, true, true).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].0, "/a/0.png");
        assert_eq!(clusters[0].1.len(), 2);
        assert_eq!(clusters[1].0, "/a/1.png");
        assert_eq!(clusters[1].1, vec![("/a/2.png".to_string(), 0.0)]);

        // Grouping by the other side anchors on key_b instead.
        let by_b = cat.clusters(10.0, false, true).unwrap();
        assert_eq!(by_b[0].0, "/a/1.png");
        assert_eq!(by_b[1].0, "/a/2.png");
        assert_eq!(by_b[1].1.len(), 2);
    }

    #[test]
    fn block_row_fetch_clips_at_table_end() {
        let mut cat = catalog_with_files(&[
            ("/a/0.png", true, false),
            ("/a/1.png", true, false),
        ]);
        cat.repopulate_directory_table().unwrap();
        let rows = cat.fetch_block_rows(1, 5, RowFields::default()).unwrap();
        assert_eq!(rows.keys, vec![1]);
        assert!(rows.paths.is_none());
    }

    #[test]
    fn table_existence_checks() {
        let cat = Catalog::open_in_memory().unwrap();
        assert!(!cat.directory_table_exists().unwrap());
        assert!(!cat.diff_table_exists().unwrap());
        assert!(!cat.hash_table_exists().unwrap());
        cat.create_directory_table().unwrap();
        cat.create_diff_table().unwrap();
        cat.create_hash_table().unwrap();
        assert!(cat.directory_table_exists().unwrap());
        assert!(cat.diff_table_exists().unwrap());
        assert!(cat.hash_table_exists().unwrap());

        cat.drop_directory_table().unwrap();
        assert!(!cat.directory_table_exists().unwrap());
    }

    #[test]
    fn catalog_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("catalog.db");
        {
            let mut cat = Catalog::open(&db).unwrap();
            cat.create_directory_table().unwrap();
            cat.bulk_insert_files(
                &[FileEntry {
                    path: PathBuf::from("/a/x.png"),
                    allowed: true,
                    size: 42,
                    created: 7.0,
                }],
                false,
                0,
            )
            .unwrap();
        }
        let cat = Catalog::open(&db).unwrap();
        assert_eq!(cat.partition_count(false, true).unwrap(), 1);
    }
}
