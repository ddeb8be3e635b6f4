//! Missing-object resolution and emission
//!
//! [`MissingObjects`] walks the inventories of the revisions being pushed and
//! queues every object the destination does not have yet. Directories are
//! turned into trees right away; file contents are only read when the
//! [`ObjectStream`] reaches them.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::adapter::SourceObjects;
use crate::error::{Result, SyncError};
use crate::mapping::MapWriter;
use crate::native::{FileId, HistoryStore, Inventory, InventoryEntry, RevisionId};
use crate::object::{Object, ObjectId};
use crate::progress::Progress;

/// A file entry whose blob has not been read yet
#[derive(Debug, Clone)]
pub struct EntryDescriptor {
    pub entry: InventoryEntry,
    pub inventory: Arc<Inventory>,
}

#[derive(Debug, Clone)]
pub enum Pending {
    Resolved(Object),
    Deferred(EntryDescriptor),
}

/// Collects the objects needed to reproduce a set of revisions
pub struct MissingObjects<'a> {
    source: SourceObjects<'a>,
    map: MapWriter<'a>,
    revids: HashSet<RevisionId>,
    sent: HashSet<ObjectId>,
    pending: Vec<(Pending, Option<String>)>,
}

impl<'a> MissingObjects<'a> {
    pub fn new(history: &'a dyn HistoryStore, map: MapWriter<'a>) -> Self {
        Self {
            source: SourceObjects::new(history),
            map,
            revids: HashSet::new(),
            sent: HashSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn map(&self) -> &MapWriter<'a> {
        &self.map
    }

    pub fn source(&self) -> SourceObjects<'a> {
        self.source
    }

    /// Number of queued objects
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue the objects of `revisions`, which must be ordered parents first.
    ///
    /// Returns the commit hash of every revision, in the same order.
    pub fn import_revisions(
        &mut self,
        revisions: &[RevisionId],
        progress: &dyn Progress,
    ) -> Result<Vec<(RevisionId, ObjectId)>> {
        self.revids.extend(revisions.iter().cloned());
        let mut out = Vec::with_capacity(revisions.len());
        for (i, revision) in revisions.iter().enumerate() {
            if progress.is_interrupted() {
                return Err(SyncError::Interrupted);
            }
            progress.update("pushing revisions", i, Some(revisions.len()));
            let sha = self.import_revision(revision)?;
            out.push((revision.clone(), sha));
        }
        Ok(out)
    }

    /// Queue everything `revision` introduces and stage its commit hash
    pub fn import_revision(&mut self, revision_id: &RevisionId) -> Result<ObjectId> {
        let history = self.source.history();
        let inventory = history.get_inventory(revision_id)?;
        let revision = history.get_revision(revision_id)?;

        let mut root_hash = None;
        let mut stack: Vec<FileId> = vec![inventory.root().file_id.clone()];
        while let Some(file_id) = stack.pop() {
            let entry = inventory.get(&file_id).ok_or_else(|| {
                SyncError::Inconsistency(format!("{} missing from inventory of {}", file_id, revision_id))
            })?;
            let hash = self.source.entry_hash(&mut self.map, &inventory, entry)?;
            if entry.is_root() {
                root_hash = hash;
            }
            let Some(hash) = hash else { continue };
            // Unchanged by the revisions being pushed: already at the destination.
            if self.sent.contains(&hash) || !self.revids.contains(&entry.revision) {
                continue;
            }
            let path = inventory.id2path(&file_id)?;
            if entry.is_directory() {
                let tree = self.source.directory_tree(&mut self.map, &inventory, entry)?;
                self.pending.push((Pending::Resolved(Object::Tree(tree)), Some(path)));
                stack.extend(inventory.children(entry).map(|c| c.file_id.clone()).collect::<Vec<_>>().into_iter().rev());
            } else {
                self.pending.push((
                    Pending::Deferred(EntryDescriptor {
                        entry: entry.clone(),
                        inventory: Arc::clone(&inventory),
                    }),
                    Some(path),
                ));
            }
            self.sent.insert(hash);
        }

        let tree_id = root_hash.ok_or_else(|| {
            SyncError::Inconsistency(format!("no root tree for revision {}", revision_id))
        })?;
        let commit = self.source.commit_object(&self.map, &revision, tree_id)?;
        let sha = commit.id();
        if self.sent.insert(sha) {
            self.pending.push((Pending::Resolved(Object::Commit(commit)), None));
        }
        self.map.record_commit(revision_id.clone(), sha);
        debug!(revision = %revision_id, commit = %sha.short(), queued = self.pending.len(), "revision resolved");
        Ok(sha)
    }

    /// Hand the queue over to a one-shot stream, keeping the staged mapping
    pub fn into_stream(self, progress: &'a dyn Progress) -> (ObjectStream<'a>, MapWriter<'a>) {
        let total = self.pending.len();
        let stream = ObjectStream {
            source: self.source,
            queue: self.pending.into(),
            total,
            progress,
        };
        (stream, self.map)
    }
}

/// Lazy, ordered emission of the queued objects
pub struct ObjectStream<'a> {
    source: SourceObjects<'a>,
    queue: VecDeque<(Pending, Option<String>)>,
    total: usize,
    progress: &'a dyn Progress,
}

impl ObjectStream<'_> {
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for ObjectStream<'_> {
    type Item = Result<(Object, Option<String>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (pending, path) = self.queue.pop_front()?;
        self.progress
            .update("writing pack objects", self.total - self.queue.len(), Some(self.total));
        let object = match pending {
            Pending::Resolved(object) => Ok(object),
            Pending::Deferred(descriptor) => self.source.entry_object(&descriptor.entry),
        };
        Some(object.map(|o| (o, path)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.queue.len(), Some(self.queue.len()))
    }
}

impl ExactSizeIterator for ObjectStream<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{CommitSpec, MemoryHistory};
    use crate::mapping::IdMap;
    use crate::object::ObjectKind;
    use crate::progress::{Discard, LogProgress};

    fn rev(s: &str) -> RevisionId {
        RevisionId::new(s)
    }

    #[test]
    fn test_second_revision_sends_only_changes() {
        let mut h = MemoryHistory::new();
        let a = CommitSpec::new("A").file("x", "1").file("lib/y", "2");
        h.commit(a.clone()).unwrap();
        h.commit(CommitSpec::new("B").parent("A").files_from(&a).file("x", "3"))
            .unwrap();

        let map = IdMap::in_memory();
        let mut missing = MissingObjects::new(&h, map.lock().unwrap());
        let shas = missing.import_revisions(&[rev("A"), rev("B")], &Discard).unwrap();
        assert_eq!(shas.len(), 2);

        let (stream, _writer) = missing.into_stream(&Discard);
        assert_eq!(stream.len(), 8);
        let objects: Vec<_> = stream.map(|r| r.unwrap()).collect();
        let kinds: Vec<_> = objects.iter().map(|(o, _)| o.kind()).collect();
        // A: root, lib, y, x, commit; B: root, x, commit
        assert_eq!(
            kinds.iter().filter(|k| **k == ObjectKind::Commit).count(),
            2
        );
        assert_eq!(kinds.iter().filter(|k| **k == ObjectKind::Blob).count(), 3);
        assert_eq!(objects[0].1.as_deref(), Some(""));
        assert_eq!(objects.last().unwrap().0.id(), shas[1].1);
    }

    #[test]
    fn test_unchanged_entries_outside_set_are_skipped() {
        let mut h = MemoryHistory::new();
        let a = CommitSpec::new("A").file("x", "1").file("y", "2");
        h.commit(a.clone()).unwrap();
        h.commit(CommitSpec::new("B").parent("A").files_from(&a).file("x", "3"))
            .unwrap();

        let map = IdMap::in_memory();
        let mut writer = map.lock().unwrap();
        writer.record_commit(rev("A"), ObjectId::new([1; 32]));
        let mut missing = MissingObjects::new(&h, writer);
        missing.import_revisions(&[rev("B")], &Discard).unwrap();
        // root tree, x, commit; y belongs to A
        assert_eq!(missing.len(), 3);
    }

    #[test]
    fn test_identical_content_sent_once() {
        let mut h = MemoryHistory::new();
        h.commit(CommitSpec::new("A").file("a", "same").file("b", "same"))
            .unwrap();
        let map = IdMap::in_memory();
        let mut missing = MissingObjects::new(&h, map.lock().unwrap());
        missing.import_revisions(&[rev("A")], &Discard).unwrap();
        // root tree, one blob, commit
        assert_eq!(missing.len(), 3);
    }

    #[test]
    fn test_unmapped_parent_is_fatal() {
        let mut h = MemoryHistory::new();
        h.commit(CommitSpec::new("A").file("x", "1")).unwrap();
        h.commit(CommitSpec::new("B").parent("A").file("x", "2")).unwrap();
        let map = IdMap::in_memory();
        let mut missing = MissingObjects::new(&h, map.lock().unwrap());
        assert!(matches!(
            missing.import_revisions(&[rev("B")], &Discard),
            Err(SyncError::UnresolvedParent { .. })
        ));
    }

    #[test]
    fn test_interrupted_between_revisions() {
        let mut h = MemoryHistory::new();
        h.commit(CommitSpec::new("A").file("x", "1")).unwrap();
        let progress = LogProgress::new();
        progress.interrupt();
        let map = IdMap::in_memory();
        let mut missing = MissingObjects::new(&h, map.lock().unwrap());
        assert!(matches!(
            missing.import_revisions(&[rev("A")], &progress),
            Err(SyncError::Interrupted)
        ));
        assert!(missing.is_empty());
    }
}
