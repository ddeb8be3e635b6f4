//! In-memory native history
//!
//! Commits are described by their full tree state (path -> file). When a
//! commit is added the inventory is built and every entry keeps the
//! last-modified revision of an identical entry in one of the parents, so
//! unchanged files and subtrees point back at the revision that introduced
//! them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::native::{
    EntryKind, FileId, HistoryStore, Inventory, InventoryEntry, NativeError, Revision, RevisionId,
};

fn default_committer() -> String {
    "dpush <dpush@localhost>".to_string()
}

/// State of one path in a [`CommitSpec`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileSpec {
    /// Plain, non-executable file
    Text(String),
    Entry {
        #[serde(default)]
        content: String,
        #[serde(default)]
        executable: bool,
        #[serde(default)]
        symlink: Option<String>,
    },
}

impl FileSpec {
    fn kind(&self) -> EntryKind {
        match self {
            FileSpec::Text(_) => EntryKind::File { executable: false },
            FileSpec::Entry {
                symlink: Some(target),
                ..
            } => EntryKind::Symlink {
                target: target.clone(),
            },
            FileSpec::Entry { executable, .. } => EntryKind::File {
                executable: *executable,
            },
        }
    }

    fn content(&self) -> &[u8] {
        match self {
            FileSpec::Text(text) => text.as_bytes(),
            FileSpec::Entry {
                symlink: Some(target),
                ..
            } => target.as_bytes(),
            FileSpec::Entry { content, .. } => content.as_bytes(),
        }
    }
}

/// Description of a revision to add to a [`MemoryHistory`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSpec {
    pub id: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default = "default_committer")]
    pub committer: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub timezone: i32,
    /// Complete tree state of the revision
    #[serde(default)]
    pub files: BTreeMap<String, FileSpec>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl CommitSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parents: Vec::new(),
            committer: default_committer(),
            message: String::new(),
            timestamp: 0,
            timezone: 0,
            files: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn parent(mut self, id: impl Into<String>) -> Self {
        self.parents.push(id.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), FileSpec::Text(content.into()));
        self
    }

    pub fn executable(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(
            path.into(),
            FileSpec::Entry {
                content: content.into(),
                executable: true,
                symlink: None,
            },
        );
        self
    }

    pub fn symlink(mut self, path: impl Into<String>, target: impl Into<String>) -> Self {
        self.files.insert(
            path.into(),
            FileSpec::Entry {
                content: String::new(),
                executable: false,
                symlink: Some(target.into()),
            },
        );
        self
    }

    /// Copy the tree state of another spec (handy for "same as parent plus ...")
    pub fn files_from(mut self, other: &CommitSpec) -> Self {
        self.files.extend(other.files.clone());
        self
    }

    pub fn remove(mut self, path: &str) -> Self {
        self.files.remove(path);
        self
    }
}

/// JSON history description: commits in the order they are added
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryScript {
    pub commits: Vec<CommitSpec>,
}

/// Native history kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryHistory {
    revisions: HashMap<RevisionId, Revision>,
    inventories: HashMap<RevisionId, Arc<Inventory>>,
    texts: HashMap<(FileId, RevisionId), Vec<u8>>,
}

fn file_id_for(path: &str, directory: bool) -> FileId {
    if path.is_empty() {
        FileId::root()
    } else if directory {
        FileId::new(format!("dir:{}", path))
    } else {
        FileId::new(format!("file:{}", path))
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a history from a script, adding commits in order
    pub fn from_script(script: &HistoryScript) -> Result<Self, NativeError> {
        let mut history = Self::new();
        for spec in &script.commits {
            history.commit(spec.clone())?;
        }
        Ok(history)
    }

    /// Load a JSON history script from disk
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read history from {:?}", path))?;
        let script: HistoryScript =
            serde_json::from_str(&data).with_context(|| "Failed to parse history JSON")?;
        Ok(Self::from_script(&script)?)
    }

    pub fn revision_count(&self) -> usize {
        self.revisions.len()
    }

    /// Add a revision. Parents missing from this history become ghosts.
    pub fn commit(&mut self, spec: CommitSpec) -> Result<RevisionId, NativeError> {
        let revision_id = RevisionId::new(spec.id.clone());
        if revision_id.is_null() || self.revisions.contains_key(&revision_id) {
            return Err(NativeError::DuplicateRevision(revision_id));
        }
        let parent_ids: Vec<RevisionId> = spec.parents.iter().map(|p| RevisionId::new(p.as_str())).collect();
        let parent_invs: Vec<Arc<Inventory>> = parent_ids
            .iter()
            .filter_map(|p| self.inventories.get(p).cloned())
            .collect();

        // Collect directories and validate paths.
        let mut directories: BTreeSet<String> = BTreeSet::new();
        directories.insert(String::new());
        for path in spec.files.keys() {
            if path.is_empty() || path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
                return Err(NativeError::InvalidInventory(format!("invalid path {:?}", path)));
            }
            let mut dir = split_path(path).0;
            while !dir.is_empty() {
                directories.insert(dir.to_string());
                dir = split_path(dir).0;
            }
        }
        if let Some(clash) = spec.files.keys().find(|p| directories.contains(p.as_str())) {
            return Err(NativeError::InvalidInventory(format!(
                "{} is both a file and a directory",
                clash
            )));
        }

        let mut entries: BTreeMap<String, InventoryEntry> = BTreeMap::new();
        let mut new_texts = Vec::new();

        for (path, file) in &spec.files {
            let (dir, name) = split_path(path);
            let file_id = file_id_for(path, false);
            let parent_id = file_id_for(dir, true);
            let kind = file.kind();
            let content = file.content();
            let unchanged = parent_invs.iter().find_map(|inv| {
                let old = inv.get(&file_id)?;
                let same = old.name == name
                    && old.parent_id.as_ref() == Some(&parent_id)
                    && old.kind == kind
                    && self
                        .texts
                        .get(&(file_id.clone(), old.revision.clone()))
                        .is_some_and(|t| t.as_slice() == content);
                same.then(|| old.revision.clone())
            });
            let entry_revision = match unchanged {
                Some(r) => r,
                None => {
                    new_texts.push(((file_id.clone(), revision_id.clone()), content.to_vec()));
                    revision_id.clone()
                }
            };
            entries.insert(
                path.clone(),
                InventoryEntry::new(file_id, name, Some(parent_id), kind, entry_revision),
            );
        }

        // Directories bottom-up, so child revisions are settled first.
        let mut by_depth: Vec<&String> = directories.iter().collect();
        by_depth.sort_by_key(|d| std::cmp::Reverse(depth(d)));
        for dir in by_depth {
            let file_id = file_id_for(dir, true);
            let (parent, name) = split_path(dir);
            let parent_id = if dir.is_empty() {
                None
            } else {
                Some(file_id_for(parent, true))
            };
            let prefix = if dir.is_empty() {
                String::new()
            } else {
                format!("{}/", dir)
            };
            let children: BTreeMap<&str, (&FileId, &RevisionId)> = entries
                .iter()
                .filter(|(p, _)| {
                    p.starts_with(&prefix) && !p[prefix.len()..].contains('/') && p.len() > prefix.len()
                })
                .map(|(_, e)| (e.name.as_str(), (&e.file_id, &e.revision)))
                .collect();

            let unchanged = parent_invs.iter().find_map(|inv| {
                let old = inv.get(&file_id)?;
                if old.name != name || old.parent_id != parent_id || !old.is_directory() {
                    return None;
                }
                let old_children: BTreeMap<&str, (&FileId, &RevisionId)> = inv
                    .children(old)
                    .map(|c| (c.name.as_str(), (&c.file_id, &c.revision)))
                    .collect();
                (old_children == children).then(|| old.revision.clone())
            });
            let entry_revision = unchanged.unwrap_or_else(|| revision_id.clone());
            entries.insert(
                dir.clone(),
                InventoryEntry::new(file_id, name, parent_id, EntryKind::Directory, entry_revision),
            );
        }

        // Parents sort before their children, so insertion order is valid.
        let mut ordered = entries.into_iter();
        let root = match ordered.next() {
            Some((path, entry)) if path.is_empty() => entry,
            _ => return Err(NativeError::InvalidInventory("missing root".to_string())),
        };
        let mut inventory = Inventory::new(revision_id.clone(), root)?;
        for (_, entry) in ordered {
            inventory.add(entry)?;
        }

        self.texts.extend(new_texts);
        self.inventories.insert(revision_id.clone(), Arc::new(inventory));
        self.revisions.insert(
            revision_id.clone(),
            Revision {
                id: revision_id.clone(),
                parent_ids,
                committer: spec.committer,
                message: spec.message,
                timestamp: spec.timestamp,
                timezone: spec.timezone,
                properties: spec.properties,
            },
        );
        tracing::debug!(revision = %revision_id, "added revision");
        Ok(revision_id)
    }
}

impl HistoryStore for MemoryHistory {
    fn get_revision(&self, revision_id: &RevisionId) -> Result<Revision, NativeError> {
        self.revisions
            .get(revision_id)
            .cloned()
            .ok_or_else(|| NativeError::NoSuchRevision(revision_id.clone()))
    }

    fn get_inventory(&self, revision_id: &RevisionId) -> Result<Arc<Inventory>, NativeError> {
        self.inventories
            .get(revision_id)
            .cloned()
            .ok_or_else(|| NativeError::NoSuchRevision(revision_id.clone()))
    }

    fn get_file_text(&self, file_id: &FileId, revision: &RevisionId) -> Result<Vec<u8>, NativeError> {
        self.texts
            .get(&(file_id.clone(), revision.clone()))
            .cloned()
            .ok_or_else(|| NativeError::NoSuchFile {
                file_id: file_id.clone(),
                revision: revision.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> RevisionId {
        RevisionId::new(s)
    }

    #[test]
    fn test_unchanged_entries_keep_revision() {
        let mut history = MemoryHistory::new();
        let a = CommitSpec::new("A").file("x", "1").file("lib/util.rs", "u");
        history.commit(a.clone()).unwrap();
        history
            .commit(CommitSpec::new("B").parent("A").files_from(&a).file("x", "2"))
            .unwrap();

        let inv = history.get_inventory(&rev("B")).unwrap();
        let x = inv.get(&FileId::new("file:x")).unwrap();
        let util = inv.get(&FileId::new("file:lib/util.rs")).unwrap();
        let lib = inv.get(&FileId::new("dir:lib")).unwrap();
        assert_eq!(x.revision, rev("B"));
        assert_eq!(util.revision, rev("A"));
        assert_eq!(lib.revision, rev("A"));
        assert_eq!(inv.root().revision, rev("B"));
        assert_eq!(history.get_file_text(&util.file_id, &util.revision).unwrap(), b"u");
    }

    #[test]
    fn test_directory_revision_follows_subtree() {
        let mut history = MemoryHistory::new();
        let a = CommitSpec::new("A").file("a/b/c", "1").file("top", "t");
        history.commit(a.clone()).unwrap();
        history
            .commit(CommitSpec::new("B").parent("A").files_from(&a).file("a/b/c", "2"))
            .unwrap();

        let inv = history.get_inventory(&rev("B")).unwrap();
        assert_eq!(inv.get(&FileId::new("dir:a")).unwrap().revision, rev("B"));
        assert_eq!(inv.get(&FileId::new("dir:a/b")).unwrap().revision, rev("B"));
        assert_eq!(inv.get(&FileId::new("file:top")).unwrap().revision, rev("A"));
    }

    #[test]
    fn test_mode_change_is_a_modification() {
        let mut history = MemoryHistory::new();
        history.commit(CommitSpec::new("A").file("run", "x")).unwrap();
        history
            .commit(CommitSpec::new("B").parent("A").executable("run", "x"))
            .unwrap();
        let inv = history.get_inventory(&rev("B")).unwrap();
        assert_eq!(inv.get(&FileId::new("file:run")).unwrap().revision, rev("B"));
    }

    #[test]
    fn test_ghost_parent_is_recorded() {
        let mut history = MemoryHistory::new();
        history
            .commit(CommitSpec::new("B").parent("ghost").file("x", "1"))
            .unwrap();
        let revision = history.get_revision(&rev("B")).unwrap();
        assert_eq!(revision.parent_ids, vec![rev("ghost")]);
        assert!(!history.has_revision(&rev("ghost")));
        let parents = history.get_parent_map(&[rev("B"), rev("ghost")]);
        assert_eq!(parents.len(), 1);
    }

    #[test]
    fn test_rejects_invalid_trees() {
        let mut history = MemoryHistory::new();
        assert!(history
            .commit(CommitSpec::new("A").file("a", "1").file("a/b", "2"))
            .is_err());
        assert!(history.commit(CommitSpec::new("B").file("a//b", "1")).is_err());
        history.commit(CommitSpec::new("C")).unwrap();
        assert!(matches!(
            history.commit(CommitSpec::new("C")),
            Err(NativeError::DuplicateRevision(_))
        ));
    }

    #[test]
    fn test_script_from_json() {
        let json = r##"{"commits": [
            {"id": "A", "message": "init", "files": {"x": "1", "bin/run": {"content": "#!", "executable": true}}},
            {"id": "B", "parents": ["A"], "files": {"x": "1", "link": {"symlink": "x"}}}
        ]}"##;
        let script: HistoryScript = serde_json::from_str(json).unwrap();
        let history = MemoryHistory::from_script(&script).unwrap();
        assert_eq!(history.revision_count(), 2);
        let inv = history.get_inventory(&rev("B")).unwrap();
        assert_eq!(
            inv.get(&FileId::new("file:link")).unwrap().kind,
            EntryKind::Symlink { target: "x".into() }
        );
        assert_eq!(inv.get(&FileId::new("file:x")).unwrap().revision, rev("A"));
    }
}
