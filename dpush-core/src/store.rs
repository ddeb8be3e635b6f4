//! Destination object databases
//!
//! An [`ObjectDatabase`] holds foreign objects plus a ref map. Objects are
//! content addressed, so inserting one twice is a no-op and objects written
//! by a failed call are harmless: nothing references them until refs move.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use fjall::{Database, KeyspaceCreateOptions};
use tracing::debug;

use crate::error::{Result, StorageError, StorageResult};
use crate::object::{Object, ObjectId};

/// Ref name -> commit hash
pub type RefMap = BTreeMap<String, ObjectId>;

/// Item type of an object stream; the path is informational
pub type StreamItem = Result<(Object, Option<String>)>;

pub trait ObjectDatabase {
    fn contains(&self, id: &ObjectId) -> StorageResult<bool>;

    fn get(&self, id: &ObjectId) -> StorageResult<Object>;

    /// Insert every object of `objects`, stopping at the first error.
    ///
    /// Returns the number of objects that were not stored before.
    fn add_objects(&mut self, objects: &mut dyn Iterator<Item = StreamItem>) -> Result<usize>;

    fn refs(&self) -> StorageResult<RefMap>;

    /// Apply all updates at once
    fn update_refs(&mut self, updates: &RefMap) -> StorageResult<()>;

    fn set_ref(&mut self, name: &str, id: ObjectId) -> StorageResult<()> {
        let mut updates = RefMap::new();
        updates.insert(name.to_string(), id);
        self.update_refs(&updates)
    }
}

/// Object database held in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryObjectDb {
    objects: HashMap<ObjectId, Object>,
    refs: RefMap,
}

impl MemoryObjectDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectDatabase for MemoryObjectDb {
    fn contains(&self, id: &ObjectId) -> StorageResult<bool> {
        Ok(self.objects.contains_key(id))
    }

    fn get(&self, id: &ObjectId) -> StorageResult<Object> {
        self.objects.get(id).cloned().ok_or(StorageError::NotFound(*id))
    }

    fn add_objects(&mut self, objects: &mut dyn Iterator<Item = StreamItem>) -> Result<usize> {
        let mut added = 0;
        for item in objects {
            let (object, _path) = item?;
            let id = object.id();
            if !self.objects.contains_key(&id) {
                self.objects.insert(id, object);
                added += 1;
            }
        }
        Ok(added)
    }

    fn refs(&self) -> StorageResult<RefMap> {
        Ok(self.refs.clone())
    }

    fn update_refs(&mut self, updates: &RefMap) -> StorageResult<()> {
        self.refs.extend(updates.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }
}

/// Object database on disk: objects in a Fjall keyspace, refs in `refs.json`
pub struct FjallObjectDb {
    db: Database,
    objects: fjall::Keyspace,
    refs_path: PathBuf,
    refs: RefMap,
}

impl FjallObjectDb {
    /// Open or create the database below `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        fs::create_dir_all(path)?;

        let db = Database::builder(path.join("objects"))
            .open()
            .map_err(|e| StorageError::Database(format!("Failed to open object store: {}", e)))?;

        let objects = db
            .keyspace("objects", || KeyspaceCreateOptions::default())
            .map_err(|e| StorageError::Database(format!("Failed to open objects keyspace: {}", e)))?;

        let refs_path = path.join("refs.json");
        let refs = if refs_path.exists() {
            serde_json::from_str(&fs::read_to_string(&refs_path)?)?
        } else {
            RefMap::new()
        };

        Ok(Self {
            db,
            objects,
            refs_path,
            refs,
        })
    }

    /// Persist data to disk
    pub fn persist(&self) -> StorageResult<()> {
        self.db
            .persist(fjall::PersistMode::SyncAll)
            .map_err(|e| StorageError::Database(format!("Failed to persist: {}", e)))?;
        Ok(())
    }

    fn write_refs(&self, refs: &RefMap) -> StorageResult<()> {
        let data = serde_json::to_string_pretty(refs)?;
        let tmp_path = self.refs_path.with_extension("tmp");
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &self.refs_path)?;
        Ok(())
    }
}

impl ObjectDatabase for FjallObjectDb {
    fn contains(&self, id: &ObjectId) -> StorageResult<bool> {
        let key = id.to_hex();
        Ok(self
            .objects
            .get(key.as_bytes())
            .map_err(|e| StorageError::Database(format!("Exists check failed: {}", e)))?
            .is_some())
    }

    fn get(&self, id: &ObjectId) -> StorageResult<Object> {
        let key = id.to_hex();
        let data = self
            .objects
            .get(key.as_bytes())
            .map_err(|e| StorageError::Database(format!("Get failed: {}", e)))?
            .ok_or(StorageError::NotFound(*id))?;
        let bytes: &[u8] = data.as_ref();
        Ok(Object::from_bytes(bytes)?)
    }

    fn add_objects(&mut self, objects: &mut dyn Iterator<Item = StreamItem>) -> Result<usize> {
        let mut added = 0;
        for item in objects {
            let (object, _path) = item?;
            let id = object.id();
            if self.contains(&id)? {
                continue;
            }
            let data = object.to_bytes().map_err(StorageError::from)?;
            self.objects
                .insert(id.to_hex().as_bytes(), &data[..])
                .map_err(|e| StorageError::Database(format!("Put failed: {}", e)))?;
            added += 1;
        }
        self.persist()?;
        debug!(added, "objects stored");
        Ok(added)
    }

    fn refs(&self) -> StorageResult<RefMap> {
        Ok(self.refs.clone())
    }

    fn update_refs(&mut self, updates: &RefMap) -> StorageResult<()> {
        let mut refs = self.refs.clone();
        refs.extend(updates.iter().map(|(k, v)| (k.clone(), *v)));
        self.write_refs(&refs)?;
        self.refs = refs;
        Ok(())
    }
}
