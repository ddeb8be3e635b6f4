//! dpush core library
//!
//! One-directional history push from a native revision/inventory repository
//! into a foreign content-addressed object repository:
//! - Foreign object model (Blob, Tree, Commit) and canonical hashing
//! - Native history model and an in-memory history store
//! - ID mapping table (in-memory and SQLite, WAL mode)
//! - Ancestry walk, missing-object resolution and lazy emission
//! - Destination object databases (in-memory and Fjall LSM-tree)
//! - Streaming pack codec, loopback and HTTP peers
//! - Local and remote delivery strategies
//! - Push configuration and push log

pub mod adapter;
pub mod config;
pub mod error;
pub mod graph;
pub mod history;
pub mod log;
pub mod mapping;
pub mod missing;
pub mod native;
pub mod object;
pub mod pack;
pub mod peer;
pub mod progress;
pub mod push;
pub mod store;

pub use adapter::{SourceObjects, foreign_revision_id};
pub use config::PushConfig;
pub use error::{Result, StorageError, StorageResult, SyncError};
pub use graph::{Graph, MissingRevisions};
pub use history::{CommitSpec, FileSpec, HistoryScript, MemoryHistory};
pub use log::{PushLog, PushLogEntry};
pub use mapping::{IdMap, MapWriter, MappedObject};
pub use missing::{MissingObjects, ObjectStream};
pub use native::{FileId, HistoryStore, Inventory, InventoryEntry, NativeError, Revision, RevisionId};
pub use object::{Blob, Commit, Object, ObjectId, ObjectKind, Tree, TreeEntry};
pub use pack::{PackError, PackReader, PackWriter};
pub use peer::{HttpPeer, LocalPeer, PushReport, PushSession, RefUpdate, RemotePeer};
pub use progress::{Discard, LogProgress, Progress};
pub use push::{Destination, Location, PushOutcome, RepositoryFormat, Strategy, Synchronizer};
pub use store::{FjallObjectDb, MemoryObjectDb, ObjectDatabase, RefMap};
