//! ID mapping table
//!
//! Persistent, append-only record of what has already been converted:
//! revision -> commit hash and `(file id, revision)` -> entry hash, with the
//! reverse lookups. A synchronization call works against a [`MapWriter`]
//! which stages new entries and only writes them through once delivery has
//! succeeded.

use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{StorageError, StorageResult};
use crate::native::{FileId, RevisionId};
use crate::object::{ObjectId, ObjectKind};

/// What a foreign hash was produced from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedObject {
    Commit(RevisionId),
    Entry {
        kind: ObjectKind,
        file_id: FileId,
        revision: RevisionId,
    },
}

/// Staged mapping entries, in recording order
#[derive(Debug, Clone, Default)]
pub struct MapBatch {
    pub commits: Vec<(RevisionId, ObjectId)>,
    pub entries: Vec<(FileId, RevisionId, ObjectKind, ObjectId)>,
}

impl MapBatch {
    pub fn len(&self) -> usize {
        self.commits.len() + self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.entries.is_empty()
    }
}

/// Storage behind an [`IdMap`]
pub trait MapBackend: Send {
    fn lookup_commit(&self, revision: &RevisionId) -> StorageResult<Option<ObjectId>>;

    fn lookup_revision(&self, sha: &ObjectId) -> StorageResult<Option<RevisionId>>;

    fn lookup_entry(&self, file_id: &FileId, revision: &RevisionId)
    -> StorageResult<Option<(ObjectKind, ObjectId)>>;

    /// Reverse lookup of any recorded hash
    fn lookup_object(&self, sha: &ObjectId) -> StorageResult<Option<MappedObject>>;

    /// Write a batch atomically. Existing keys are left untouched.
    fn apply(&mut self, batch: &MapBatch) -> StorageResult<()>;

    fn revision_count(&self) -> StorageResult<usize>;
}

/// Mapping table held in memory
#[derive(Debug, Default)]
pub struct MemoryMap {
    commits: HashMap<RevisionId, ObjectId>,
    revisions: HashMap<ObjectId, RevisionId>,
    entries: HashMap<(FileId, RevisionId), (ObjectKind, ObjectId)>,
    objects: HashMap<ObjectId, MappedObject>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MapBackend for MemoryMap {
    fn lookup_commit(&self, revision: &RevisionId) -> StorageResult<Option<ObjectId>> {
        Ok(self.commits.get(revision).copied())
    }

    fn lookup_revision(&self, sha: &ObjectId) -> StorageResult<Option<RevisionId>> {
        Ok(self.revisions.get(sha).cloned())
    }

    fn lookup_entry(
        &self,
        file_id: &FileId,
        revision: &RevisionId,
    ) -> StorageResult<Option<(ObjectKind, ObjectId)>> {
        Ok(self.entries.get(&(file_id.clone(), revision.clone())).copied())
    }

    fn lookup_object(&self, sha: &ObjectId) -> StorageResult<Option<MappedObject>> {
        if let Some(revision) = self.revisions.get(sha) {
            return Ok(Some(MappedObject::Commit(revision.clone())));
        }
        Ok(self.objects.get(sha).cloned())
    }

    fn apply(&mut self, batch: &MapBatch) -> StorageResult<()> {
        for (revision, sha) in &batch.commits {
            if !self.commits.contains_key(revision) {
                self.commits.insert(revision.clone(), *sha);
                self.revisions.entry(*sha).or_insert_with(|| revision.clone());
            }
        }
        for (file_id, revision, kind, sha) in &batch.entries {
            let key = (file_id.clone(), revision.clone());
            if !self.entries.contains_key(&key) {
                self.entries.insert(key, (*kind, *sha));
                self.objects.entry(*sha).or_insert_with(|| MappedObject::Entry {
                    kind: *kind,
                    file_id: file_id.clone(),
                    revision: revision.clone(),
                });
            }
        }
        Ok(())
    }

    fn revision_count(&self) -> StorageResult<usize> {
        Ok(self.commits.len())
    }
}

fn column_oid(bytes: Vec<u8>) -> StorageResult<ObjectId> {
    ObjectId::from_slice(&bytes)
        .ok_or_else(|| StorageError::Database(format!("bad hash length {}", bytes.len())))
}

fn column_kind(code: i64) -> StorageResult<ObjectKind> {
    u8::try_from(code)
        .ok()
        .and_then(ObjectKind::from_code)
        .ok_or_else(|| StorageError::Database(format!("bad object kind {}", code)))
}

/// Mapping table in an SQLite database (WAL mode)
pub struct SqliteMap {
    conn: Connection,
}

impl SqliteMap {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS commits (
                revision TEXT PRIMARY KEY,
                sha BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS commits_sha ON commits (sha);
            CREATE TABLE IF NOT EXISTS entries (
                file_id TEXT NOT NULL,
                revision TEXT NOT NULL,
                kind INTEGER NOT NULL,
                sha BLOB NOT NULL,
                PRIMARY KEY (file_id, revision)
            );
            CREATE INDEX IF NOT EXISTS entries_sha ON entries (sha);",
        )?;
        Ok(Self { conn })
    }
}

impl MapBackend for SqliteMap {
    fn lookup_commit(&self, revision: &RevisionId) -> StorageResult<Option<ObjectId>> {
        let mut stmt = self.conn.prepare_cached("SELECT sha FROM commits WHERE revision = ?1")?;
        let sha: Option<Vec<u8>> = stmt
            .query_row(rusqlite::params![revision.as_str()], |r| r.get(0))
            .optional()?;
        sha.map(column_oid).transpose()
    }

    fn lookup_revision(&self, sha: &ObjectId) -> StorageResult<Option<RevisionId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT revision FROM commits WHERE sha = ?1 ORDER BY rowid LIMIT 1")?;
        let revision: Option<String> = stmt
            .query_row(rusqlite::params![sha.as_bytes().as_slice()], |r| r.get(0))
            .optional()?;
        Ok(revision.map(RevisionId::from))
    }

    fn lookup_entry(
        &self,
        file_id: &FileId,
        revision: &RevisionId,
    ) -> StorageResult<Option<(ObjectKind, ObjectId)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT kind, sha FROM entries WHERE file_id = ?1 AND revision = ?2")?;
        let row: Option<(i64, Vec<u8>)> = stmt
            .query_row(rusqlite::params![file_id.as_str(), revision.as_str()], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .optional()?;
        match row {
            Some((kind, sha)) => Ok(Some((column_kind(kind)?, column_oid(sha)?))),
            None => Ok(None),
        }
    }

    fn lookup_object(&self, sha: &ObjectId) -> StorageResult<Option<MappedObject>> {
        if let Some(revision) = self.lookup_revision(sha)? {
            return Ok(Some(MappedObject::Commit(revision)));
        }
        let mut stmt = self.conn.prepare_cached(
            "SELECT kind, file_id, revision FROM entries WHERE sha = ?1 ORDER BY rowid LIMIT 1",
        )?;
        let row: Option<(i64, String, String)> = stmt
            .query_row(rusqlite::params![sha.as_bytes().as_slice()], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .optional()?;
        match row {
            Some((kind, file_id, revision)) => Ok(Some(MappedObject::Entry {
                kind: column_kind(kind)?,
                file_id: FileId::new(file_id),
                revision: RevisionId::from(revision),
            })),
            None => Ok(None),
        }
    }

    fn apply(&mut self, batch: &MapBatch) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut commit_stmt =
                tx.prepare_cached("INSERT OR IGNORE INTO commits (revision, sha) VALUES (?1, ?2)")?;
            for (revision, sha) in &batch.commits {
                commit_stmt.execute(rusqlite::params![revision.as_str(), sha.as_bytes().as_slice()])?;
            }
            let mut entry_stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO entries (file_id, revision, kind, sha) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (file_id, revision, kind, sha) in &batch.entries {
                entry_stmt.execute(rusqlite::params![
                    file_id.as_str(),
                    revision.as_str(),
                    kind.code() as i64,
                    sha.as_bytes().as_slice()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn revision_count(&self) -> StorageResult<usize> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM commits", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

/// Shared handle on a mapping table
#[derive(Clone)]
pub struct IdMap {
    backend: Arc<Mutex<Box<dyn MapBackend>>>,
}

impl IdMap {
    pub fn new(backend: Box<dyn MapBackend>) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryMap::new()))
    }

    pub fn open_sqlite(path: &Path) -> StorageResult<Self> {
        Ok(Self::new(Box::new(SqliteMap::open(path)?)))
    }

    /// Take the write guard. Held for the whole synchronization call.
    pub fn lock(&self) -> StorageResult<MapWriter<'_>> {
        let backend = self
            .backend
            .lock()
            .map_err(|_| StorageError::Backend("mapping table lock poisoned".to_string()))?;
        Ok(MapWriter {
            backend,
            batch: MapBatch::default(),
            commits: HashMap::new(),
            entries: HashMap::new(),
            objects: HashMap::new(),
        })
    }

    pub fn lookup_commit(&self, revision: &RevisionId) -> StorageResult<Option<ObjectId>> {
        self.lock()?.lookup_commit(revision)
    }

    pub fn lookup_object(&self, sha: &ObjectId) -> StorageResult<Option<MappedObject>> {
        self.lock()?.lookup_object(sha)
    }

    pub fn revision_count(&self) -> StorageResult<usize> {
        self.lock()?.backend.revision_count()
    }
}

/// Exclusive view on the mapping table with a staging overlay.
///
/// Lookups see staged entries first. Dropping the writer without calling
/// [`MapWriter::commit`] discards everything staged.
pub struct MapWriter<'a> {
    backend: MutexGuard<'a, Box<dyn MapBackend>>,
    batch: MapBatch,
    commits: HashMap<RevisionId, ObjectId>,
    entries: HashMap<(FileId, RevisionId), (ObjectKind, ObjectId)>,
    objects: HashMap<ObjectId, MappedObject>,
}

impl MapWriter<'_> {
    pub fn lookup_commit(&self, revision: &RevisionId) -> StorageResult<Option<ObjectId>> {
        if let Some(sha) = self.commits.get(revision) {
            return Ok(Some(*sha));
        }
        self.backend.lookup_commit(revision)
    }

    pub fn lookup_revision(&self, sha: &ObjectId) -> StorageResult<Option<RevisionId>> {
        if let Some(MappedObject::Commit(revision)) = self.objects.get(sha) {
            return Ok(Some(revision.clone()));
        }
        self.backend.lookup_revision(sha)
    }

    pub fn lookup_entry(
        &self,
        file_id: &FileId,
        revision: &RevisionId,
    ) -> StorageResult<Option<(ObjectKind, ObjectId)>> {
        if let Some(found) = self.entries.get(&(file_id.clone(), revision.clone())) {
            return Ok(Some(*found));
        }
        self.backend.lookup_entry(file_id, revision)
    }

    pub fn lookup_object(&self, sha: &ObjectId) -> StorageResult<Option<MappedObject>> {
        if let Some(found) = self.backend.lookup_object(sha)? {
            return Ok(Some(found));
        }
        Ok(self.objects.get(sha).cloned())
    }

    pub fn record_commit(&mut self, revision: RevisionId, sha: ObjectId) {
        if self.commits.insert(revision.clone(), sha).is_none() {
            self.objects
                .entry(sha)
                .or_insert_with(|| MappedObject::Commit(revision.clone()));
            self.batch.commits.push((revision, sha));
        }
    }

    pub fn record_entry(&mut self, file_id: FileId, revision: RevisionId, kind: ObjectKind, sha: ObjectId) {
        let key = (file_id.clone(), revision.clone());
        if self.entries.insert(key, (kind, sha)).is_none() {
            self.objects.entry(sha).or_insert_with(|| MappedObject::Entry {
                kind,
                file_id: file_id.clone(),
                revision: revision.clone(),
            });
            self.batch.entries.push((file_id, revision, kind, sha));
        }
    }

    /// Number of staged entries
    pub fn staged(&self) -> usize {
        self.batch.len()
    }

    /// Write the staged entries through and release the table
    pub fn commit(mut self) -> StorageResult<usize> {
        let batch = std::mem::take(&mut self.batch);
        self.backend.apply(&batch)?;
        tracing::debug!(
            commits = batch.commits.len(),
            entries = batch.entries.len(),
            "mapping table updated"
        );
        Ok(batch.len())
    }
}

impl Drop for MapWriter<'_> {
    fn drop(&mut self) {
        if !self.batch.is_empty() {
            tracing::debug!(staged = self.batch.len(), "discarding staged mapping entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn oid(n: u8) -> ObjectId {
        ObjectId::new([n; 32])
    }

    fn exercise(map: &IdMap) {
        let a = RevisionId::new("A");
        let f = FileId::new("file:x");
        {
            let mut w = map.lock().unwrap();
            w.record_commit(a.clone(), oid(1));
            w.record_entry(f.clone(), a.clone(), ObjectKind::Blob, oid(2));
            assert_eq!(w.lookup_commit(&a).unwrap(), Some(oid(1)));
            assert_eq!(w.lookup_revision(&oid(1)).unwrap(), Some(a.clone()));
            assert_eq!(w.staged(), 2);
            // dropped without commit
        }
        assert_eq!(map.lookup_commit(&a).unwrap(), None);
        assert_eq!(map.revision_count().unwrap(), 0);

        let mut w = map.lock().unwrap();
        w.record_commit(a.clone(), oid(1));
        w.record_entry(f.clone(), a.clone(), ObjectKind::Blob, oid(2));
        assert_eq!(w.commit().unwrap(), 2);

        assert_eq!(map.lookup_commit(&a).unwrap(), Some(oid(1)));
        assert_eq!(map.lookup_object(&oid(1)).unwrap(), Some(MappedObject::Commit(a.clone())));
        assert_eq!(
            map.lookup_object(&oid(2)).unwrap(),
            Some(MappedObject::Entry {
                kind: ObjectKind::Blob,
                file_id: f.clone(),
                revision: a.clone()
            })
        );
        let w = map.lock().unwrap();
        assert_eq!(w.lookup_entry(&f, &a).unwrap(), Some((ObjectKind::Blob, oid(2))));
        assert_eq!(w.lookup_object(&oid(9)).unwrap(), None);
    }

    #[test]
    fn test_memory_map_staging() {
        exercise(&IdMap::in_memory());
    }

    #[test]
    fn test_sqlite_map_staging() {
        let dir = TempDir::new().unwrap();
        exercise(&IdMap::open_sqlite(&dir.path().join("map.sqlite")).unwrap());
    }

    #[test]
    fn test_sqlite_map_persists_and_ignores_rewrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.sqlite");
        {
            let map = IdMap::open_sqlite(&path).unwrap();
            let mut w = map.lock().unwrap();
            w.record_commit(RevisionId::new("A"), oid(1));
            w.commit().unwrap();
        }
        let map = IdMap::open_sqlite(&path).unwrap();
        let mut w = map.lock().unwrap();
        w.record_commit(RevisionId::new("A"), oid(7));
        w.commit().unwrap();
        assert_eq!(map.lookup_commit(&RevisionId::new("A")).unwrap(), Some(oid(1)));
        assert_eq!(map.revision_count().unwrap(), 1);
    }
}
