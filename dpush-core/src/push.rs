//! Pushing native history into a foreign repository
//!
//! [`Synchronizer::push`] picks a delivery strategy for the destination:
//! a local object database gets a bulk insert, a remote peer gets a
//! negotiated pack. Either way the staged mapping entries are only written
//! once the destination has accepted the objects.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adapter::{SourceObjects, foreign_revision_id};
use crate::error::{Result, SyncError};
use crate::graph::{Graph, MissingRevisions};
use crate::mapping::{IdMap, MapWriter, MappedObject};
use crate::missing::MissingObjects;
use crate::native::{HistoryStore, RevisionId};
use crate::object::ObjectId;
use crate::peer::{PackSink, PushSession, RemotePeer};
use crate::progress::Progress;
use crate::store::{ObjectDatabase, RefMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryFormat {
    /// Revision/inventory history
    Native,
    /// Content-addressed object graph
    Foreign,
}

impl std::fmt::Display for RepositoryFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepositoryFormat::Native => f.write_str("native"),
            RepositoryFormat::Foreign => f.write_str("foreign"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Bulk insert into an object database we can write directly
    LocalPush,
    /// Negotiate with a peer, then stream a pack
    RemotePush,
}

impl Strategy {
    /// Only native -> foreign is supported.
    pub fn select(source: RepositoryFormat, target: RepositoryFormat, location: Location) -> Result<Self> {
        match (source, target) {
            (RepositoryFormat::Native, RepositoryFormat::Foreign) => Ok(match location {
                Location::Local => Strategy::LocalPush,
                Location::Remote => Strategy::RemotePush,
            }),
            (RepositoryFormat::Foreign, RepositoryFormat::Native) => Err(SyncError::UnsupportedDirection {
                from: source,
                to: target,
            }),
            _ => Err(SyncError::Unsupported(format!(
                "{} to {} needs no conversion",
                source, target
            ))),
        }
    }
}

/// Where a push goes
pub enum Destination<'d> {
    Local(&'d mut dyn ObjectDatabase),
    Remote(&'d mut dyn RemotePeer),
}

impl Destination<'_> {
    pub fn location(&self) -> Location {
        match self {
            Destination::Local(_) => Location::Local,
            Destination::Remote(_) => Location::Remote,
        }
    }
}

/// Result of a push
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    /// Converted revisions with their commit hash, parents first
    pub revisions: Vec<(RevisionId, ObjectId)>,
    /// Native id -> id the revision would have if fetched back
    pub revidmap: BTreeMap<RevisionId, RevisionId>,
    /// Refs now pointing at the pushed commits
    pub refs: RefMap,
    /// Ref name -> reason, remote pushes only
    pub rejected: BTreeMap<String, String>,
    /// Objects transferred
    pub objects: usize,
    pub ghosts: Vec<RevisionId>,
}

impl PushOutcome {
    fn new(revisions: Vec<(RevisionId, ObjectId)>, ghosts: Vec<RevisionId>) -> Self {
        let revidmap = revisions
            .iter()
            .map(|(revision, sha)| (revision.clone(), foreign_revision_id(sha)))
            .collect();
        Self {
            revisions,
            revidmap,
            ghosts,
            ..Self::default()
        }
    }
}

fn ref_heads(refs: &BTreeMap<String, RevisionId>) -> Vec<RevisionId> {
    let mut heads: Vec<RevisionId> = Vec::new();
    for revision in refs.values() {
        if !heads.contains(revision) {
            heads.push(revision.clone());
        }
    }
    heads
}

fn ref_targets(
    source: SourceObjects<'_>,
    map: &MapWriter<'_>,
    refs: &BTreeMap<String, RevisionId>,
) -> Result<RefMap> {
    let mut targets = RefMap::new();
    for (name, revision) in refs {
        targets.insert(name.clone(), source.lookup_revision_hash(map, revision)?);
    }
    Ok(targets)
}

/// Ships the objects of a push to its destination
pub trait Delivery {
    fn deliver(
        &mut self,
        sync: &Synchronizer<'_>,
        refs: &BTreeMap<String, RevisionId>,
        progress: &dyn Progress,
    ) -> Result<PushOutcome>;
}

/// Bulk insert, then mapping, then refs
pub struct LocalDelivery<'d> {
    db: &'d mut dyn ObjectDatabase,
}

impl<'d> LocalDelivery<'d> {
    pub fn new(db: &'d mut dyn ObjectDatabase) -> Self {
        Self { db }
    }
}

impl Delivery for LocalDelivery<'_> {
    fn deliver(
        &mut self,
        sync: &Synchronizer<'_>,
        refs: &BTreeMap<String, RevisionId>,
        progress: &dyn Progress,
    ) -> Result<PushOutcome> {
        let writer = sync.idmap.lock()?;
        let db = &*self.db;
        let MissingRevisions { revisions, ghosts } = Graph::new(sync.history).find_missing(
            &ref_heads(refs),
            |revision| match writer.lookup_commit(revision)? {
                Some(sha) => Ok(db.contains(&sha)?),
                None => Ok(false),
            },
            progress,
        )?;
        info!(revisions = revisions.len(), "pushing to local object database");

        let mut objects = MissingObjects::new(sync.history, writer);
        let pushed = objects.import_revisions(&revisions, progress)?;
        let (mut stream, writer) = objects.into_stream(progress);
        let total = stream.len();
        self.db.add_objects(&mut stream)?;
        let targets = ref_targets(SourceObjects::new(sync.history), &writer, refs)?;

        writer.commit()?;
        self.db.update_refs(&targets)?;

        let mut outcome = PushOutcome::new(pushed, ghosts);
        outcome.refs = targets;
        outcome.objects = total;
        Ok(outcome)
    }
}

enum SessionState<'a> {
    Idle(MapWriter<'a>),
    Resolved(MissingObjects<'a>),
    Sent(MapWriter<'a>),
    Closed,
}

/// Pusher side of a remote negotiation
struct RemoteSession<'a> {
    history: &'a dyn HistoryStore,
    refs: &'a BTreeMap<String, RevisionId>,
    progress: &'a dyn Progress,
    state: SessionState<'a>,
    revisions: Vec<(RevisionId, ObjectId)>,
    ghosts: Vec<RevisionId>,
    wants: RefMap,
    sent: usize,
}

impl<'a> RemoteSession<'a> {
    fn take_state(&mut self) -> SessionState<'a> {
        std::mem::replace(&mut self.state, SessionState::Closed)
    }

    /// Staged mapping once the exchange is over
    fn finish(mut self) -> Result<MapWriter<'a>> {
        match self.take_state() {
            SessionState::Sent(writer) => Ok(writer),
            SessionState::Resolved(objects) if objects.is_empty() => Ok(objects.into_stream(self.progress).1),
            _ => Err(SyncError::Inconsistency("peer ended the push before taking the pack".to_string())),
        }
    }
}

impl PushSession for RemoteSession<'_> {
    fn determine_wants(&mut self, advertised: &RefMap) -> Result<RefMap> {
        let SessionState::Idle(writer) = self.take_state() else {
            return Err(SyncError::Inconsistency("wants already determined".to_string()));
        };

        let source = SourceObjects::new(self.history);
        let mut present_heads = Vec::new();
        for sha in advertised.values() {
            if let Some(MappedObject::Commit(revision)) = source.lookup_git_sha(&writer, sha)? {
                present_heads.push(revision);
            }
        }
        let graph = Graph::new(self.history);
        let present = graph.ancestry_closure(&present_heads);
        debug!(advertised = advertised.len(), present = present.len(), "remote refs mapped");

        let missing = graph.find_missing(&ref_heads(self.refs), |r| Ok(present.contains(r)), self.progress)?;
        info!(revisions = missing.revisions.len(), "pushing to remote peer");

        let mut objects = MissingObjects::new(self.history, writer);
        self.revisions = objects.import_revisions(&missing.revisions, self.progress)?;
        self.ghosts = missing.ghosts;
        self.wants = ref_targets(source, objects.map(), self.refs)?;
        self.state = SessionState::Resolved(objects);
        Ok(self.wants.clone())
    }

    fn object_count(&self) -> usize {
        match &self.state {
            SessionState::Resolved(objects) => objects.len(),
            _ => 0,
        }
    }

    fn generate_pack(&mut self, sink: &mut dyn PackSink) -> Result<usize> {
        let SessionState::Resolved(objects) = self.take_state() else {
            return Err(SyncError::Inconsistency("pack requested before wants".to_string()));
        };
        let (stream, writer) = objects.into_stream(self.progress);
        let mut written = 0;
        for item in stream {
            let (object, _path) = item?;
            sink.write_object(&object)?;
            written += 1;
        }
        self.state = SessionState::Sent(writer);
        self.sent = written;
        Ok(written)
    }
}

/// Negotiated pack transfer; mapping committed only if the peer accepts
pub struct RemoteDelivery<'d> {
    peer: &'d mut dyn RemotePeer,
}

impl<'d> RemoteDelivery<'d> {
    pub fn new(peer: &'d mut dyn RemotePeer) -> Self {
        Self { peer }
    }
}

impl Delivery for RemoteDelivery<'_> {
    fn deliver(
        &mut self,
        sync: &Synchronizer<'_>,
        refs: &BTreeMap<String, RevisionId>,
        progress: &dyn Progress,
    ) -> Result<PushOutcome> {
        let mut session = RemoteSession {
            history: sync.history,
            refs,
            progress,
            state: SessionState::Idle(sync.idmap.lock()?),
            revisions: Vec::new(),
            ghosts: Vec::new(),
            wants: RefMap::new(),
            sent: 0,
        };
        let report = self.peer.send_pack(&mut session)?;

        let revisions = std::mem::take(&mut session.revisions);
        let ghosts = std::mem::take(&mut session.ghosts);
        let wants = std::mem::take(&mut session.wants);
        let objects = session.sent;
        let writer = session.finish()?;

        if report.is_success() {
            writer.commit()?;
        } else {
            warn!(rejected = ?report.rejected, "peer rejected the push");
        }

        let mut outcome = PushOutcome::new(revisions, ghosts);
        outcome.refs = wants
            .into_iter()
            .filter(|(name, _)| !report.rejected.contains_key(name))
            .collect();
        outcome.rejected = report.rejected;
        outcome.objects = objects;
        Ok(outcome)
    }
}

/// Entry point of a native -> foreign push
pub struct Synchronizer<'a> {
    history: &'a dyn HistoryStore,
    idmap: &'a IdMap,
}

impl<'a> Synchronizer<'a> {
    pub fn new(history: &'a dyn HistoryStore, idmap: &'a IdMap) -> Self {
        Self { history, idmap }
    }

    /// Push the ancestry of every ref target and point the refs at the result.
    pub fn push(
        &self,
        destination: Destination<'_>,
        refs: &BTreeMap<String, RevisionId>,
        progress: &dyn Progress,
    ) -> Result<PushOutcome> {
        let strategy = Strategy::select(RepositoryFormat::Native, RepositoryFormat::Foreign, destination.location())?;
        let started = Instant::now();
        let outcome = match destination {
            Destination::Local(db) => LocalDelivery::new(db).deliver(self, refs, progress),
            Destination::Remote(peer) => RemoteDelivery::new(peer).deliver(self, refs, progress),
        }?;
        info!(
            ?strategy,
            revisions = outcome.revisions.len(),
            objects = outcome.objects,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "push complete"
        );
        Ok(outcome)
    }

    pub fn push_local(
        &self,
        db: &mut dyn ObjectDatabase,
        refs: &BTreeMap<String, RevisionId>,
        progress: &dyn Progress,
    ) -> Result<PushOutcome> {
        self.push(Destination::Local(db), refs, progress)
    }

    pub fn push_remote(
        &self,
        peer: &mut dyn RemotePeer,
        refs: &BTreeMap<String, RevisionId>,
        progress: &dyn Progress,
    ) -> Result<PushOutcome> {
        self.push(Destination::Remote(peer), refs, progress)
    }

    /// Bringing foreign history back is not supported.
    pub fn fetch(&self, location: Location) -> Result<PushOutcome> {
        let strategy = Strategy::select(RepositoryFormat::Foreign, RepositoryFormat::Native, location)?;
        Err(SyncError::Unsupported(format!("{:?} of foreign history", strategy)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_select() {
        assert_eq!(
            Strategy::select(RepositoryFormat::Native, RepositoryFormat::Foreign, Location::Local).unwrap(),
            Strategy::LocalPush
        );
        assert_eq!(
            Strategy::select(RepositoryFormat::Native, RepositoryFormat::Foreign, Location::Remote).unwrap(),
            Strategy::RemotePush
        );
        assert!(matches!(
            Strategy::select(RepositoryFormat::Foreign, RepositoryFormat::Native, Location::Local),
            Err(SyncError::UnsupportedDirection {
                from: RepositoryFormat::Foreign,
                to: RepositoryFormat::Native
            })
        ));
        assert!(matches!(
            Strategy::select(RepositoryFormat::Native, RepositoryFormat::Native, Location::Local),
            Err(SyncError::Unsupported(_))
        ));
    }

    #[test]
    fn test_fetch_is_unsupported() {
        let history = crate::history::MemoryHistory::new();
        let idmap = IdMap::in_memory();
        let sync = Synchronizer::new(&history, &idmap);
        assert!(matches!(
            sync.fetch(Location::Remote),
            Err(SyncError::UnsupportedDirection { .. })
        ));
    }

    #[test]
    fn test_ref_heads_dedup() {
        let mut refs = BTreeMap::new();
        refs.insert("a".to_string(), RevisionId::new("X"));
        refs.insert("b".to_string(), RevisionId::new("X"));
        refs.insert("c".to_string(), RevisionId::new("Y"));
        assert_eq!(ref_heads(&refs), vec![RevisionId::new("X"), RevisionId::new("Y")]);
    }
}
