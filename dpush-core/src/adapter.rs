//! Native -> foreign object conversion
//!
//! Computes the content hash of inventory entries (directories recursively),
//! materializes the corresponding objects and builds commits. Every hash
//! computed is staged in the mapping table so unchanged entries are never
//! hashed twice.

use crate::error::{Result, SyncError};
use crate::mapping::{MapWriter, MappedObject};
use crate::native::{EntryKind, HistoryStore, Inventory, InventoryEntry, Revision, RevisionId};
use crate::object::{Blob, Commit, Object, ObjectId, ObjectKind, Tree, TreeEntry, mode};

/// Prefix of native revision ids derived from a foreign commit hash
pub const FOREIGN_REVISION_PREFIX: &str = "dpush-v1:";

/// Native id a foreign commit would get if it were brought back
pub fn foreign_revision_id(sha: &ObjectId) -> RevisionId {
    RevisionId::new(format!("{}{}", FOREIGN_REVISION_PREFIX, sha.to_hex()))
}

fn entry_mode(kind: &EntryKind) -> u32 {
    match kind {
        EntryKind::File { executable: true } => mode::EXECUTABLE,
        EntryKind::File { executable: false } => mode::FILE,
        EntryKind::Symlink { .. } => mode::SYMLINK,
        EntryKind::Directory => mode::DIRECTORY,
    }
}

/// Object-store view of a native history
#[derive(Clone, Copy)]
pub struct SourceObjects<'a> {
    history: &'a dyn HistoryStore,
}

impl<'a> SourceObjects<'a> {
    pub fn new(history: &'a dyn HistoryStore) -> Self {
        Self { history }
    }

    pub fn history(&self) -> &'a dyn HistoryStore {
        self.history
    }

    /// Hash of an entry, or `None` for an empty directory below the root.
    pub fn entry_hash(
        &self,
        map: &mut MapWriter<'_>,
        inventory: &Inventory,
        entry: &InventoryEntry,
    ) -> Result<Option<ObjectId>> {
        if let Some((_, sha)) = map.lookup_entry(&entry.file_id, &entry.revision)? {
            return Ok(Some(sha));
        }
        let (kind, sha) = match &entry.kind {
            EntryKind::Directory => {
                let tree = self.directory_tree(map, inventory, entry)?;
                if tree.is_empty() && !entry.is_root() {
                    return Ok(None);
                }
                (ObjectKind::Tree, tree.id())
            }
            _ => (ObjectKind::Blob, self.entry_blob(entry)?.id()),
        };
        map.record_entry(entry.file_id.clone(), entry.revision.clone(), kind, sha);
        Ok(Some(sha))
    }

    /// Tree object for a directory; empty subdirectories are left out
    pub fn directory_tree(
        &self,
        map: &mut MapWriter<'_>,
        inventory: &Inventory,
        entry: &InventoryEntry,
    ) -> Result<Tree> {
        let mut tree = Tree::new();
        for child in inventory.children(entry) {
            if let Some(id) = self.entry_hash(map, inventory, child)? {
                let kind = if child.is_directory() {
                    ObjectKind::Tree
                } else {
                    ObjectKind::Blob
                };
                tree.insert(TreeEntry::new(child.name.clone(), id, kind, entry_mode(&child.kind)));
            }
        }
        Ok(tree)
    }

    fn entry_blob(&self, entry: &InventoryEntry) -> Result<Blob> {
        match &entry.kind {
            EntryKind::Symlink { target } => Ok(Blob::new(target.as_bytes().to_vec())),
            EntryKind::File { .. } => Ok(Blob::new(
                self.history.get_file_text(&entry.file_id, &entry.revision)?,
            )),
            EntryKind::Directory => Err(SyncError::Inconsistency(format!(
                "{} is a directory, not a blob",
                entry.file_id
            ))),
        }
    }

    /// Materialize the blob of a file or symlink entry
    pub fn entry_object(&self, entry: &InventoryEntry) -> Result<Object> {
        self.entry_blob(entry).map(Object::Blob)
    }

    /// Build the commit for `revision`. Every non-null parent must already be mapped.
    pub fn commit_object(&self, map: &MapWriter<'_>, revision: &Revision, tree_id: ObjectId) -> Result<Commit> {
        let mut parents = Vec::with_capacity(revision.parent_ids.len());
        for parent in revision.parent_ids.iter().filter(|p| !p.is_null()) {
            match map.lookup_commit(parent)? {
                Some(sha) => parents.push(sha),
                None => {
                    return Err(SyncError::UnresolvedParent {
                        revision: revision.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }
        Ok(Commit::new(
            tree_id,
            parents,
            revision.committer.clone(),
            revision.message.clone(),
            revision.timestamp,
            revision.timezone,
        ))
    }

    /// What a foreign hash was produced from, if it is known
    pub fn lookup_git_sha(&self, map: &MapWriter<'_>, sha: &ObjectId) -> Result<Option<MappedObject>> {
        Ok(map.lookup_object(sha)?)
    }

    /// Commit hash of an already converted revision
    pub fn lookup_revision_hash(&self, map: &MapWriter<'_>, revision: &RevisionId) -> Result<ObjectId> {
        map.lookup_commit(revision)?
            .ok_or_else(|| SyncError::NotMapped(revision.clone()))
    }
}
