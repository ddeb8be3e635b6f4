//! Native history model
//!
//! Revisions carry an inventory: a tree of entries keyed by stable file ids,
//! each remembering the revision that last modified it. A directory's
//! last-modified revision changes whenever anything below it changes, so
//! `(file id, revision)` pins down an entry's content.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::graph::Graph;

/// The "no history" revision.
pub const NULL_REVISION: &str = "null:";

/// File id of every inventory root.
pub const ROOT_FILE_ID: &str = "TREE_ROOT";

/// Opaque native revision identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn null() -> Self {
        Self(NULL_REVISION.to_string())
    }

    pub fn is_null(&self) -> bool {
        self.0 == NULL_REVISION
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RevisionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable identity of a path across revisions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn root() -> Self {
        Self(ROOT_FILE_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors raised by a native history store
#[derive(Debug, thiserror::Error)]
pub enum NativeError {
    #[error("no such revision: {0}")]
    NoSuchRevision(RevisionId),

    #[error("no text for {file_id} at {revision}")]
    NoSuchFile { file_id: FileId, revision: RevisionId },

    #[error("invalid inventory: {0}")]
    InvalidInventory(String),

    #[error("revision {0} already exists")]
    DuplicateRevision(RevisionId),
}

/// Native commit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    /// Ordered; may name ghosts
    pub parent_ids: Vec<RevisionId>,
    pub committer: String,
    pub message: String,
    /// Unix seconds
    pub timestamp: i64,
    /// Offset from UTC in minutes
    pub timezone: i32,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File { executable: bool },
    Directory,
    Symlink { target: String },
}

impl EntryKind {
    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::File { .. } => "file",
            EntryKind::Directory => "directory",
            EntryKind::Symlink { .. } => "symlink",
        }
    }
}

/// One path's state in a revision's inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub file_id: FileId,
    pub name: String,
    pub parent_id: Option<FileId>,
    pub kind: EntryKind,
    /// Revision that last modified this entry
    pub revision: RevisionId,
    /// Child name -> file id, directories only
    #[serde(default)]
    pub children: BTreeMap<String, FileId>,
}

impl InventoryEntry {
    pub fn new(
        file_id: FileId,
        name: impl Into<String>,
        parent_id: Option<FileId>,
        kind: EntryKind,
        revision: RevisionId,
    ) -> Self {
        Self {
            file_id,
            name: name.into(),
            parent_id,
            kind,
            revision,
            children: BTreeMap::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Path -> entry mapping of a single revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    revision_id: RevisionId,
    root_id: FileId,
    entries: HashMap<FileId, InventoryEntry>,
}

impl Inventory {
    /// Create an inventory holding only `root`
    pub fn new(revision_id: RevisionId, root: InventoryEntry) -> Result<Self, NativeError> {
        if !root.is_root() || !root.is_directory() {
            return Err(NativeError::InvalidInventory(format!(
                "root {} must be a directory without parent",
                root.file_id
            )));
        }
        let root_id = root.file_id.clone();
        let mut entries = HashMap::new();
        entries.insert(root_id.clone(), root);
        Ok(Self {
            revision_id,
            root_id,
            entries,
        })
    }

    /// Add an entry below an existing directory
    pub fn add(&mut self, mut entry: InventoryEntry) -> Result<(), NativeError> {
        let parent_id = entry.parent_id.clone().ok_or_else(|| {
            NativeError::InvalidInventory(format!("{} has no parent", entry.file_id))
        })?;
        if self.entries.contains_key(&entry.file_id) {
            return Err(NativeError::InvalidInventory(format!(
                "duplicate file id {}",
                entry.file_id
            )));
        }
        let parent = self.entries.get_mut(&parent_id).ok_or_else(|| {
            NativeError::InvalidInventory(format!("unknown parent {} for {}", parent_id, entry.name))
        })?;
        if !parent.is_directory() {
            return Err(NativeError::InvalidInventory(format!(
                "parent {} of {} is not a directory",
                parent_id, entry.name
            )));
        }
        if parent.children.contains_key(&entry.name) {
            return Err(NativeError::InvalidInventory(format!(
                "{} already has a child named {}",
                parent_id, entry.name
            )));
        }
        parent.children.insert(entry.name.clone(), entry.file_id.clone());
        entry.children.clear();
        self.entries.insert(entry.file_id.clone(), entry);
        Ok(())
    }

    pub fn revision_id(&self) -> &RevisionId {
        &self.revision_id
    }

    pub fn root(&self) -> &InventoryEntry {
        &self.entries[&self.root_id]
    }

    pub fn get(&self, file_id: &FileId) -> Option<&InventoryEntry> {
        self.entries.get(file_id)
    }

    /// Children of a directory entry, in name order
    pub fn children<'a>(&'a self, entry: &'a InventoryEntry) -> impl Iterator<Item = &'a InventoryEntry> + 'a {
        entry.children.values().filter_map(move |id| self.entries.get(id))
    }

    /// Slash-separated path of an entry; the root is the empty string
    pub fn id2path(&self, file_id: &FileId) -> Result<String, NativeError> {
        let mut names = Vec::new();
        let mut current = self.entries.get(file_id);
        while let Some(entry) = current {
            match &entry.parent_id {
                Some(parent) => {
                    names.push(entry.name.as_str());
                    current = self.entries.get(parent);
                    if current.is_none() {
                        return Err(NativeError::InvalidInventory(format!(
                            "dangling parent {} of {}",
                            parent, entry.file_id
                        )));
                    }
                }
                None => {
                    names.reverse();
                    return Ok(names.join("/"));
                }
            }
        }
        Err(NativeError::InvalidInventory(format!("unknown file id {}", file_id)))
    }

    /// Number of entries, root included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }
}

/// Read access to a native revision history.
pub trait HistoryStore {
    fn get_revision(&self, revision_id: &RevisionId) -> Result<Revision, NativeError>;

    fn get_inventory(&self, revision_id: &RevisionId) -> Result<Arc<Inventory>, NativeError>;

    /// Content of a file (or symlink target) as of the entry's last-modified revision
    fn get_file_text(&self, file_id: &FileId, revision: &RevisionId) -> Result<Vec<u8>, NativeError>;

    /// Parents of each requested revision; ghosts and `null:` are left out.
    fn get_parent_map(&self, revision_ids: &[RevisionId]) -> HashMap<RevisionId, Vec<RevisionId>> {
        revision_ids
            .iter()
            .filter(|id| !id.is_null())
            .filter_map(|id| {
                self.get_revision(id)
                    .ok()
                    .map(|rev| (id.clone(), rev.parent_ids))
            })
            .collect()
    }

    fn has_revision(&self, revision_id: &RevisionId) -> bool {
        revision_id.is_null() || self.get_revision(revision_id).is_ok()
    }

    fn get_graph(&self) -> Graph<'_>
    where
        Self: Sized,
    {
        Graph::new(self)
    }
}
