//! Foreign object model for dpush
//!
//! Content-addressable Blob, Tree and Commit objects. Every object is
//! identified by the SHA-256 digest of its canonical encoding
//! (`"<kind> <len>\0<body>"`), so the same logical content always yields the
//! same id, whichever revision or path it was reached from.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Tree entry modes
pub mod mode {
    pub const FILE: u32 = 0o100644;
    pub const EXECUTABLE: u32 = 0o100755;
    pub const SYMLINK: u32 = 0o120000;
    pub const DIRECTORY: u32 = 0o040000;
}

/// Unique identifier for any foreign object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Hash an object body under its kind header without concatenating them.
    pub fn hash_object(kind: ObjectKind, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(header(kind, body.len()));
        hasher.update(body);
        Self(hasher.finalize().into())
    }

    /// Build an id from a byte slice, which must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated hex form used in log output
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// Hex in JSON, raw bytes in bincode.
impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

fn header(kind: ObjectKind, len: usize) -> Vec<u8> {
    format!("{} {}\0", kind.as_str(), len).into_bytes()
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    /// Numeric tag used by the pack format and the mapping database
    pub fn code(&self) -> u8 {
        match self {
            ObjectKind::Blob => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Commit => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ObjectKind::Blob),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Commit),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File content object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Raw content data
    pub data: Vec<u8>,
}

impl Blob {
    /// Create a new blob from data
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::hash_object(ObjectKind::Blob, &self.data)
    }
}

/// Directory tree entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Name of the entry
    pub name: String,
    /// Object ID (points to Blob or Tree)
    pub id: ObjectId,
    /// Entry type
    pub kind: ObjectKind,
    /// Entry mode, see [`mode`]
    pub mode: u32,
}

impl TreeEntry {
    /// Create a new tree entry
    pub fn new(name: String, id: ObjectId, kind: ObjectKind, mode: u32) -> Self {
        Self {
            name,
            id,
            kind,
            mode,
        }
    }
}

/// Directory object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Sorted entries for deterministic hashing
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Add or update an entry
    pub fn insert(&mut self, entry: TreeEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    /// Get an entry
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    /// Canonical body: `<octal mode> <name>\0<32 byte id>` per entry, in name order
    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for entry in self.entries.values() {
            body.extend_from_slice(format!("{:o} {}\0", entry.mode, entry.name).as_bytes());
            body.extend_from_slice(entry.id.as_bytes());
        }
        body
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::hash_object(ObjectKind::Tree, &self.encode_body())
    }
}

/// Commit object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Tree object ID for this revision
    pub tree_id: ObjectId,
    /// Parent commit IDs (empty for initial commit)
    pub parents: Vec<ObjectId>,
    /// Author name
    pub author: String,
    /// Commit message
    pub message: String,
    /// Commit timestamp (Unix seconds)
    pub timestamp: i64,
    /// Timezone offset in minutes
    pub tz_offset: i32,
}

impl Commit {
    /// Create a new commit
    pub fn new(
        tree_id: ObjectId,
        parents: Vec<ObjectId>,
        author: String,
        message: String,
        timestamp: i64,
        tz_offset: i32,
    ) -> Self {
        Self {
            tree_id,
            parents,
            author,
            message,
            timestamp,
            tz_offset,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = format!("tree {}\n", self.tree_id);
        for parent in &self.parents {
            body.push_str(&format!("parent {}\n", parent));
        }
        body.push_str(&format!(
            "author {} {} {}\n\n",
            self.author,
            self.timestamp,
            format_tz(self.tz_offset)
        ));
        body.push_str(&self.message);
        body.into_bytes()
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::hash_object(ObjectKind::Commit, &self.encode_body())
    }
}

fn format_tz(offset_minutes: i32) -> String {
    let sign = if offset_minutes < 0 { '-' } else { '+' };
    let abs = offset_minutes.unsigned_abs();
    format!("{}{:02}{:02}", sign, abs / 60, abs % 60)
}

/// Generic object that can be any type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Object {
    Blob(Blob),
    Tree(Tree),
    Commit(Commit),
}

impl Object {
    /// Get the object ID
    pub fn id(&self) -> ObjectId {
        match self {
            Object::Blob(blob) => blob.id(),
            Object::Tree(tree) => tree.id(),
            Object::Commit(commit) => commit.id(),
        }
    }

    /// Get the object kind
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Blob(_) => ObjectKind::Blob,
            Object::Tree(_) => ObjectKind::Tree,
            Object::Commit(_) => ObjectKind::Commit,
        }
    }

    /// Full canonical encoding, header included
    pub fn encode(&self) -> Vec<u8> {
        let body = match self {
            Object::Blob(blob) => blob.data.clone(),
            Object::Tree(tree) => tree.encode_body(),
            Object::Commit(commit) => commit.encode_body(),
        };
        let mut out = header(self.kind(), body.len());
        out.extend_from_slice(&body);
        out
    }

    /// Serialize to the storage format
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from the storage format
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn as_commit(&self) -> Option<&Commit> {
        match self {
            Object::Commit(commit) => Some(commit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_roundtrip() {
        let bytes = [42u8; 32];
        let id = ObjectId::new(bytes);
        let hex = id.to_hex();
        let id2 = ObjectId::from_hex(&hex).unwrap();
        assert_eq!(id, id2);
        assert!(ObjectId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_blob_id_includes_header() {
        let blob = Blob::new(b"hello world".to_vec());
        assert_ne!(blob.id(), ObjectId::from_data(b"hello world"));
        assert_eq!(blob.id(), ObjectId::from_data(b"blob 11\0hello world"));
        assert_eq!(Object::Blob(blob.clone()).id(), ObjectId::from_data(&Object::Blob(blob).encode()));
    }

    #[test]
    fn test_tree_id_ignores_insertion_order() {
        let a = TreeEntry::new("a".into(), Blob::new(b"1".to_vec()).id(), ObjectKind::Blob, mode::FILE);
        let b = TreeEntry::new("b".into(), Blob::new(b"2".to_vec()).id(), ObjectKind::Blob, mode::EXECUTABLE);

        let mut first = Tree::new();
        first.insert(a.clone());
        first.insert(b.clone());
        let mut second = Tree::new();
        second.insert(b);
        second.insert(a);

        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn test_tree_mode_changes_id() {
        let id = Blob::new(b"#!/bin/sh".to_vec()).id();
        let mut plain = Tree::new();
        plain.insert(TreeEntry::new("run".into(), id, ObjectKind::Blob, mode::FILE));
        let mut exec = Tree::new();
        exec.insert(TreeEntry::new("run".into(), id, ObjectKind::Blob, mode::EXECUTABLE));
        assert_ne!(plain.id(), exec.id());
    }

    #[test]
    fn test_commit_parent_order_matters() {
        let tree = Tree::new().id();
        let p1 = ObjectId::new([1u8; 32]);
        let p2 = ObjectId::new([2u8; 32]);
        let c1 = Commit::new(tree, vec![p1, p2], "a".into(), "m".into(), 10, 60);
        let c2 = Commit::new(tree, vec![p2, p1], "a".into(), "m".into(), 10, 60);
        assert_ne!(c1.id(), c2.id());
        assert!(String::from_utf8(c1.encode_body()).unwrap().contains("author a 10 +0100"));
    }

    #[test]
    fn test_storage_roundtrip_keeps_id() {
        let commit = Commit::new(
            ObjectId::new([1u8; 32]),
            vec![ObjectId::new([2u8; 32])],
            "Test Author".to_string(),
            "Test message".to_string(),
            1234567890,
            -330,
        );
        let object = Object::Commit(commit);
        let bytes = object.to_bytes().unwrap();
        let decoded = Object::from_bytes(&bytes).unwrap();
        assert_eq!(object.id(), decoded.id());
    }

    #[test]
    fn test_object_id_json_is_hex() {
        let id = Blob::new(b"x".to_vec()).id();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
