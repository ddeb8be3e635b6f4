//! Remote peers
//!
//! A push against a peer is negotiate-then-transfer: the peer advertises its
//! refs, the [`PushSession`] answers with the refs it wants set, and the peer
//! then pulls a pack of the missing objects out of the session.
//!
//! The request sent to a peer is one JSON line with the ref updates followed
//! by the pack stream.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::{BufRead, Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError, SyncError};
use crate::object::{Object, ObjectId};
use crate::pack::{PackError, PackReader, PackWriter};
use crate::store::{ObjectDatabase, RefMap};

/// One ref change requested from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefUpdate {
    pub name: String,
    /// Value the pusher believes the ref has; `None` creates it
    pub old: Option<ObjectId>,
    pub new: ObjectId,
}

/// Peer's answer to a push
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub updated: RefMap,
    /// Ref name -> reason
    pub rejected: BTreeMap<String, String>,
}

impl PushReport {
    pub fn is_success(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Destination of generated pack objects
pub trait PackSink {
    fn write_object(&mut self, object: &Object) -> std::result::Result<(), PackError>;
}

impl<W: Write> PackSink for PackWriter<W> {
    fn write_object(&mut self, object: &Object) -> std::result::Result<(), PackError> {
        PackWriter::write_object(self, object)
    }
}

/// Pusher side of a negotiation
pub trait PushSession {
    /// Given the peer's refs, resolve what is missing and return the refs to set.
    fn determine_wants(&mut self, advertised: &RefMap) -> Result<RefMap>;

    /// Number of objects [`PushSession::generate_pack`] will write
    fn object_count(&self) -> usize;

    /// Stream the missing objects; may only be called once
    fn generate_pack(&mut self, sink: &mut dyn PackSink) -> Result<usize>;
}

pub trait RemotePeer {
    fn send_pack(&mut self, session: &mut dyn PushSession) -> Result<PushReport>;
}

/// Ref commands for `wants`, leaving out refs that already have the wanted value
pub fn ref_commands(advertised: &RefMap, wants: &RefMap) -> Vec<RefUpdate> {
    wants
        .iter()
        .filter(|(name, new)| advertised.get(*name) != Some(*new))
        .map(|(name, new)| RefUpdate {
            name: name.clone(),
            old: advertised.get(name).copied(),
            new: *new,
        })
        .collect()
}

/// Encode a push request: the command line, then the pack
pub fn write_push_request<W: Write>(
    mut out: W,
    commands: &[RefUpdate],
    session: &mut dyn PushSession,
    level: i32,
) -> Result<W> {
    serde_json::to_writer(&mut out, commands).map_err(|e| SyncError::Transport(e.to_string()))?;
    out.write_all(b"\n").map_err(PackError::from)?;

    let count = u32::try_from(session.object_count())
        .map_err(|_| SyncError::Unsupported("too many objects for one pack".to_string()))?;
    let mut writer = PackWriter::new(out, count, level)?;
    session.generate_pack(&mut writer)?;
    let (out, summary) = writer.finish()?;
    debug!(objects = summary.objects, bytes = summary.bytes, "pack written");
    Ok(out)
}

fn is_ancestor<D: ObjectDatabase + ?Sized>(db: &D, ancestor: &ObjectId, descendant: &ObjectId) -> Result<bool> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*descendant]);
    while let Some(id) = queue.pop_front() {
        if id == *ancestor {
            return Ok(true);
        }
        if !seen.insert(id) {
            continue;
        }
        match db.get(&id) {
            Ok(object) => {
                if let Some(commit) = object.as_commit() {
                    queue.extend(commit.parents.iter().copied());
                }
            }
            // History below a shallow point is simply not there.
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

fn check_command<D: ObjectDatabase + ?Sized>(db: &D, current: &RefMap, command: &RefUpdate) -> Result<Option<String>> {
    if !db.contains(&command.new)? || db.get(&command.new)?.as_commit().is_none() {
        return Ok(Some(format!("{} is not a commit", command.new.short())));
    }
    let existing = current.get(&command.name);
    if existing != command.old.as_ref() {
        return Ok(Some("stale old value".to_string()));
    }
    if let Some(old) = existing {
        if !is_ancestor(db, old, &command.new)? {
            return Ok(Some("non-fast-forward".to_string()));
        }
    }
    Ok(None)
}

/// Receive side: store the pack, then apply every ref update or none.
pub fn receive_pack<D: ObjectDatabase + ?Sized, R: Read>(
    db: &mut D,
    commands: &[RefUpdate],
    pack: R,
) -> Result<PushReport> {
    let reader = PackReader::new(pack)?;
    let mut objects = reader.map(|r| r.map(|o| (o, None::<String>)).map_err(SyncError::from));
    let added = db.add_objects(&mut objects)?;

    let current = db.refs()?;
    let mut report = PushReport::default();
    for command in commands {
        if let Some(reason) = check_command(db, &current, command)? {
            report.rejected.insert(command.name.clone(), reason);
        }
    }
    if !report.rejected.is_empty() {
        for command in commands {
            report
                .rejected
                .entry(command.name.clone())
                .or_insert_with(|| "atomic push failed".to_string());
        }
        warn!(rejected = report.rejected.len(), "push rejected");
        return Ok(report);
    }

    let updates: RefMap = commands.iter().map(|c| (c.name.clone(), c.new)).collect();
    db.update_refs(&updates)?;
    info!(objects = added, refs = updates.len(), "push received");
    report.updated = updates;
    Ok(report)
}

/// Decode a push request and apply it to `db`
pub fn handle_push_request<D: ObjectDatabase + ?Sized, R: BufRead>(db: &mut D, mut request: R) -> Result<PushReport> {
    let mut line = String::new();
    request.read_line(&mut line).map_err(PackError::from)?;
    let commands: Vec<RefUpdate> =
        serde_json::from_str(line.trim_end()).map_err(|e| SyncError::Transport(format!("bad ref commands: {}", e)))?;
    receive_pack(db, &commands, request)
}

/// Peer served in-process from an object database.
///
/// The request still goes through the wire encoding.
pub struct LocalPeer<D: ObjectDatabase> {
    db: D,
    level: i32,
}

impl<D: ObjectDatabase> LocalPeer<D> {
    pub fn new(db: D) -> Self {
        Self { db, level: 3 }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn into_inner(self) -> D {
        self.db
    }
}

impl<D: ObjectDatabase> RemotePeer for LocalPeer<D> {
    fn send_pack(&mut self, session: &mut dyn PushSession) -> Result<PushReport> {
        let advertised = self.db.refs()?;
        let wants = session.determine_wants(&advertised)?;
        let commands = ref_commands(&advertised, &wants);
        let request = write_push_request(Vec::new(), &commands, session, self.level)?;
        handle_push_request(&mut self.db, &request[..])
    }
}

/// Peer reached over HTTP: `GET {url}/refs`, `POST {url}/receive-pack`
pub struct HttpPeer {
    url: String,
    client: reqwest::blocking::Client,
    level: i32,
}

impl HttpPeer {
    pub fn new(url: &str, timeout: Duration, level: i32) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            level,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn advertised_refs(&self) -> Result<RefMap> {
        let url = format!("{}/refs", self.url);
        let response = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Transport(format!("GET {} failed: {}", url, e)))?;
        response
            .json::<RefMap>()
            .map_err(|e| SyncError::Transport(format!("bad refs from {}: {}", url, e)))
    }
}

impl RemotePeer for HttpPeer {
    fn send_pack(&mut self, session: &mut dyn PushSession) -> Result<PushReport> {
        let advertised = self.advertised_refs()?;
        let wants = session.determine_wants(&advertised)?;
        let commands = ref_commands(&advertised, &wants);

        let url = format!("{}/receive-pack", self.url);
        let (body, pipe) = std::io::pipe().map_err(PackError::from)?;
        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-dpush-pack")
            .body(reqwest::blocking::Body::new(body));
        let uploader = std::thread::spawn(move || {
            request
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.json::<PushReport>())
        });

        // The pipe is closed when the writer is dropped, ending the body.
        let written = write_push_request(pipe, &commands, session, self.level).map(drop);
        let response = uploader
            .join()
            .map_err(|_| SyncError::Transport("uploader thread panicked".to_string()))?;
        // A failed upload breaks the pipe, so its error explains the write error.
        let report = response.map_err(|e| SyncError::Transport(format!("POST {} failed: {}", url, e)))?;
        written?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Blob, Commit, Tree};
    use crate::store::MemoryObjectDb;

    /// Session that pushes a fixed list of objects
    struct FixedSession {
        wants: RefMap,
        objects: Vec<Object>,
    }

    impl PushSession for FixedSession {
        fn determine_wants(&mut self, _advertised: &RefMap) -> Result<RefMap> {
            Ok(self.wants.clone())
        }

        fn object_count(&self) -> usize {
            self.objects.len()
        }

        fn generate_pack(&mut self, sink: &mut dyn PackSink) -> Result<usize> {
            for object in &self.objects {
                sink.write_object(object)?;
            }
            Ok(self.objects.len())
        }
    }

    fn commit(parents: Vec<ObjectId>, message: &str) -> Commit {
        Commit::new(Tree::new().id(), parents, "me".into(), message.into(), 0, 0)
    }

    fn session(name: &str, commits: &[&Commit]) -> FixedSession {
        let mut objects = vec![Object::Tree(Tree::new())];
        objects.extend(commits.iter().map(|c| Object::Commit((*c).clone())));
        let mut wants = RefMap::new();
        if let Some(last) = commits.last() {
            wants.insert(name.to_string(), last.id());
        }
        FixedSession { wants, objects }
    }

    #[test]
    fn test_local_peer_updates_refs() {
        let c1 = commit(vec![], "one");
        let c2 = commit(vec![c1.id()], "two");
        let mut peer = LocalPeer::new(MemoryObjectDb::new());

        let report = peer.send_pack(&mut session("refs/heads/main", &[&c1])).unwrap();
        assert!(report.is_success());
        assert_eq!(report.updated.get("refs/heads/main"), Some(&c1.id()));

        let report = peer.send_pack(&mut session("refs/heads/main", &[&c2])).unwrap();
        assert!(report.is_success());
        assert_eq!(peer.db().refs().unwrap().get("refs/heads/main"), Some(&c2.id()));
    }

    #[test]
    fn test_non_fast_forward_rejected() {
        let c1 = commit(vec![], "one");
        let other = commit(vec![], "other");
        let mut peer = LocalPeer::new(MemoryObjectDb::new());
        peer.send_pack(&mut session("refs/heads/main", &[&c1])).unwrap();

        let report = peer.send_pack(&mut session("refs/heads/main", &[&other])).unwrap();
        assert_eq!(
            report.rejected.get("refs/heads/main").map(String::as_str),
            Some("non-fast-forward")
        );
        assert_eq!(peer.db().refs().unwrap().get("refs/heads/main"), Some(&c1.id()));
    }

    #[test]
    fn test_rejection_is_atomic() {
        let c1 = commit(vec![], "one");
        let mut db = MemoryObjectDb::new();
        let commands = vec![
            RefUpdate {
                name: "refs/heads/a".into(),
                old: None,
                new: c1.id(),
            },
            RefUpdate {
                name: "refs/heads/b".into(),
                old: None,
                new: Blob::new(b"x".to_vec()).id(),
            },
        ];
        let mut s = session("unused", &[&c1]);
        let request = write_push_request(Vec::new(), &commands, &mut s, 1).unwrap();
        let report = handle_push_request(&mut db, &request[..]).unwrap();
        assert!(report.updated.is_empty());
        assert_eq!(report.rejected.len(), 2);
        assert!(db.refs().unwrap().is_empty());
        // objects are kept even though no ref moved
        assert!(db.contains(&c1.id()).unwrap());
    }

    #[test]
    fn test_ref_commands_skip_unchanged() {
        let id = ObjectId::new([1; 32]);
        let mut advertised = RefMap::new();
        advertised.insert("a".into(), id);
        let mut wants = advertised.clone();
        wants.insert("b".into(), id);
        let commands = ref_commands(&advertised, &wants);
        assert_eq!(
            commands,
            vec![RefUpdate {
                name: "b".into(),
                old: None,
                new: id
            }]
        );
    }

    fn read_headers(stream: &mut std::net::TcpStream) {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") && stream.read(&mut byte).unwrap() == 1 {
            head.push(byte[0]);
        }
    }

    #[test]
    fn test_http_upload_failure_is_reported() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = std::thread::spawn(move || {
            let (mut refs, _) = listener.accept().unwrap();
            read_headers(&mut refs);
            refs.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                .unwrap();
            drop(refs);
            // Refuse the pack without reading its body.
            let (mut upload, _) = listener.accept().unwrap();
            read_headers(&mut upload);
            let _ = upload.write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        });

        // Incompressible, larger than a pipe buffer
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let data: Vec<u8> = (0..512 * 1024)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let mut session = FixedSession {
            wants: RefMap::new(),
            objects: vec![Object::Blob(Blob::new(data))],
        };

        let mut peer = HttpPeer::new(&url, Duration::from_secs(10), 1).unwrap();
        match peer.send_pack(&mut session) {
            Err(SyncError::Transport(message)) => assert!(message.starts_with("POST"), "{}", message),
            other => panic!("expected a transport error, got {:?}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_garbage_request_is_an_error() {
        let mut db = MemoryObjectDb::new();
        assert!(handle_push_request(&mut db, &b"not json\n"[..]).is_err());
        assert!(handle_push_request(&mut db, &b"[]\nDPCKgarbage"[..]).is_err());
    }
}
