//! dpush: push native history into a foreign object repository.
//!
//! Supports:
//! - Push into a local object database (push)
//! - Push to an HTTP peer (push-remote)
//! - Ref and hash inspection (refs, lookup)
//! - Destination setup (init)
//! - Push log (log)
//!
//! # Usage
//!
//! ```bash
//! # Record the peer URL once
//! dpush init /srv/state --url http://mirror/repo
//!
//! # Push the ancestry of revision C and point refs/heads/master at it
//! dpush push --history history.json --dest /srv/mirror --ref refs/heads/master=C
//!
//! # Push to a peer, keeping the mapping table in /srv/state
//! dpush push-remote --history history.json --dest /srv/state --url http://mirror/repo -r C
//!
//! # Show refs, decode a hash, view the push log
//! dpush refs /srv/mirror
//! dpush lookup /srv/mirror 3f2a...
//! dpush log /srv/mirror
//! ```

mod push_log;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dpush_core::log::{PushLog, PushLogEntry};
use dpush_core::{
    FjallObjectDb, HttpPeer, IdMap, Location, LogProgress, MappedObject, MemoryHistory, ObjectDatabase,
    ObjectId, PushConfig, PushOutcome, RevisionId, Synchronizer,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "dpush")]
#[command(author = "dpush Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Push native revision history into a content-addressed repository")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the destination config
    Init {
        /// Destination directory
        dest: PathBuf,
        /// Peer URL for push-remote
        #[arg(short, long)]
        url: Option<String>,
        /// Ref updated by --revision
        #[arg(long)]
        default_ref: Option<String>,
    },

    /// Push into a local object database
    Push {
        /// JSON history script
        #[arg(long)]
        history: PathBuf,
        /// Destination directory
        #[arg(short, long)]
        dest: PathBuf,
        /// Ref to update, as NAME=REVISION (repeatable)
        #[arg(long = "ref", value_name = "NAME=REVISION")]
        refs: Vec<String>,
        /// Revision for the default ref
        #[arg(short = 'r', long)]
        revision: Option<String>,
    },

    /// Push to a remote peer over HTTP
    #[command(name = "push-remote")]
    PushRemote {
        /// JSON history script
        #[arg(long)]
        history: PathBuf,
        /// Directory holding the config, mapping table and push log
        #[arg(short, long)]
        dest: PathBuf,
        /// Peer URL (default: remote_url from the config)
        #[arg(short, long)]
        url: Option<String>,
        /// Ref to update, as NAME=REVISION (repeatable)
        #[arg(long = "ref", value_name = "NAME=REVISION")]
        refs: Vec<String>,
        /// Revision for the default ref
        #[arg(short = 'r', long)]
        revision: Option<String>,
    },

    /// List the refs of a local destination
    Refs {
        /// Destination directory
        dest: PathBuf,
    },

    /// Show which revision or file a foreign hash was produced from
    Lookup {
        /// Destination directory
        dest: PathBuf,
        /// Hex object hash
        sha: String,
    },

    /// View the push log
    Log {
        /// Destination directory
        dest: PathBuf,
        /// Only show the last N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Fetch foreign history back into the native model (not supported)
    Pull {
        /// Source URL or directory
        source: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("dpush=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            dest,
            url,
            default_ref,
        } => cmd_init(&dest, url, default_ref),

        Commands::Push {
            history,
            dest,
            refs,
            revision,
        } => cmd_push(&history, &dest, &refs, revision),

        Commands::PushRemote {
            history,
            dest,
            url,
            refs,
            revision,
        } => cmd_push_remote(&history, &dest, url, &refs, revision),

        Commands::Refs { dest } => cmd_refs(&dest),

        Commands::Lookup { dest, sha } => cmd_lookup(&dest, &sha),

        Commands::Log { dest, limit } => push_log::print_push_log(&dest, limit, &mut std::io::stdout()),

        Commands::Pull { source } => cmd_pull(&source),
    }
}

/// Parse `NAME=REVISION` arguments, falling back to the default ref.
fn parse_refs(
    args: &[String],
    revision: Option<String>,
    config: &PushConfig,
) -> Result<BTreeMap<String, RevisionId>> {
    let mut refs = BTreeMap::new();
    for arg in args {
        let (name, rev) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("expected NAME=REVISION, got {:?}", arg))?;
        if name.is_empty() || rev.is_empty() {
            bail!("expected NAME=REVISION, got {:?}", arg);
        }
        refs.insert(name.to_string(), RevisionId::new(rev));
    }
    if let Some(rev) = revision {
        refs.insert(config.default_ref.clone(), RevisionId::new(rev));
    }
    if refs.is_empty() {
        bail!("nothing to push: give --ref NAME=REVISION or --revision");
    }
    Ok(refs)
}

fn record(dest: &Path, target: &str, started: Instant, result: &dpush_core::Result<PushOutcome>) -> Result<()> {
    let mut entry = PushLogEntry::new(target);
    entry.duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(outcome) => {
            entry.revisions = outcome.revisions.len();
            entry.objects = outcome.objects;
            entry.refs = outcome.refs.len();
            entry.success = outcome.rejected.is_empty();
            if !outcome.rejected.is_empty() {
                entry.error = Some(format!("{} refs rejected", outcome.rejected.len()));
            }
        }
        Err(e) => entry.error = Some(e.to_string()),
    }
    PushLog::new(dest).append(&entry)
}

fn print_outcome(outcome: &PushOutcome) {
    println!("\nPush completed:");
    println!("  Revisions: {}", outcome.revisions.len());
    println!("  Objects:   {}", outcome.objects);
    for (name, sha) in &outcome.refs {
        println!("  {} -> {}", name, sha);
    }
    for (name, reason) in &outcome.rejected {
        println!("  {} rejected: {}", name, reason);
    }
    if !outcome.ghosts.is_empty() {
        println!("  Ghosts:    {}", outcome.ghosts.len());
    }
}

/// Progress whose interrupt flag is raised by Ctrl-C
fn interruptible_progress() -> LogProgress {
    let progress = LogProgress::new();
    let handle = progress.interrupt_handle();
    if let Err(e) = ctrlc::set_handler(move || handle.store(true, Ordering::SeqCst)) {
        warn!("failed to set Ctrl-C handler: {}", e);
    }
    progress
}

fn cmd_init(dest: &Path, url: Option<String>, default_ref: Option<String>) -> Result<()> {
    let mut config = PushConfig::load(dest)?;
    if url.is_some() {
        config.remote_url = url;
    }
    if let Some(name) = default_ref {
        config.default_ref = name;
    }
    config.save(dest)?;
    println!("Initialized {}", dest.display());
    Ok(())
}

fn cmd_push(history: &Path, dest: &Path, ref_args: &[String], revision: Option<String>) -> Result<()> {
    let config = PushConfig::load(dest)?;
    debug!(?config, "loaded config");
    let refs = parse_refs(ref_args, revision, &config)?;
    let history = MemoryHistory::load(history)?;
    std::fs::create_dir_all(dest)?;
    let idmap = IdMap::open_sqlite(&config.mapping_path(dest)).context("Failed to open mapping table")?;
    let mut db = FjallObjectDb::open(&config.object_path(dest)).context("Failed to open object database")?;

    println!("Pushing to {}...", dest.display());
    let started = Instant::now();
    let result = Synchronizer::new(&history, &idmap).push_local(&mut db, &refs, &interruptible_progress());
    record(dest, &dest.display().to_string(), started, &result)?;

    let outcome = result?;
    print_outcome(&outcome);
    Ok(())
}

fn cmd_push_remote(
    history: &Path,
    dest: &Path,
    url: Option<String>,
    ref_args: &[String],
    revision: Option<String>,
) -> Result<()> {
    let config = PushConfig::load(dest)?;
    let url = url
        .or_else(|| config.remote_url.clone())
        .ok_or_else(|| anyhow!("no peer URL given and none configured"))?;
    let refs = parse_refs(ref_args, revision, &config)?;
    let history = MemoryHistory::load(history)?;
    std::fs::create_dir_all(dest)?;
    let idmap = IdMap::open_sqlite(&config.mapping_path(dest)).context("Failed to open mapping table")?;
    let mut peer = HttpPeer::new(&url, config.http_timeout(), config.compression_level)?;

    println!("Pushing to {}...", url);
    let started = Instant::now();
    let result = Synchronizer::new(&history, &idmap).push_remote(&mut peer, &refs, &interruptible_progress());
    record(dest, &url, started, &result)?;

    let outcome = result?;
    print_outcome(&outcome);
    if !outcome.rejected.is_empty() {
        bail!("peer rejected {} refs", outcome.rejected.len());
    }
    Ok(())
}

fn cmd_refs(dest: &Path) -> Result<()> {
    let config = PushConfig::load(dest)?;
    let db = FjallObjectDb::open(&config.object_path(dest))?;
    let refs = db.refs()?;
    if refs.is_empty() {
        println!("No refs.");
    }
    for (name, sha) in refs {
        println!("{} {}", sha, name);
    }
    Ok(())
}

fn cmd_lookup(dest: &Path, sha: &str) -> Result<()> {
    let config = PushConfig::load(dest)?;
    let sha: ObjectId = sha.parse().with_context(|| format!("invalid hash {:?}", sha))?;
    let idmap = IdMap::open_sqlite(&config.mapping_path(dest))?;
    match idmap.lookup_object(&sha)? {
        Some(MappedObject::Commit(revision)) => println!("commit {} from revision {}", sha, revision),
        Some(MappedObject::Entry {
            kind,
            file_id,
            revision,
        }) => println!("{} {} from {} at revision {}", kind, sha, file_id, revision),
        None => bail!("{} is not known to this destination", sha),
    }
    Ok(())
}

fn cmd_pull(source: &str) -> Result<()> {
    let history = MemoryHistory::new();
    let idmap = IdMap::in_memory();
    let location = if source.starts_with("http://") || source.starts_with("https://") {
        Location::Remote
    } else {
        Location::Local
    };
    Synchronizer::new(&history, &idmap).fetch(location)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpush_core::{CommitSpec, MemoryObjectDb, SyncError};

    #[test]
    fn test_parse_refs() {
        let config = PushConfig::default();
        let refs = parse_refs(&["refs/heads/a=X".to_string()], Some("Y".to_string()), &config).unwrap();
        assert_eq!(refs.get("refs/heads/a"), Some(&RevisionId::new("X")));
        assert_eq!(refs.get("refs/heads/master"), Some(&RevisionId::new("Y")));
    }

    #[test]
    fn test_parse_refs_rejects_bad_input() {
        let config = PushConfig::default();
        assert!(parse_refs(&["nope".to_string()], None, &config).is_err());
        assert!(parse_refs(&["=X".to_string()], None, &config).is_err());
        assert!(parse_refs(&[], None, &config).is_err());
    }

    #[test]
    fn test_init_writes_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        cmd_init(tmp.path(), Some("http://mirror/repo".to_string()), None).unwrap();
        cmd_init(tmp.path(), None, Some("refs/heads/main".to_string())).unwrap();
        let config = PushConfig::load(tmp.path()).unwrap();
        assert_eq!(config.remote_url.as_deref(), Some("http://mirror/repo"));
        assert_eq!(config.default_ref, "refs/heads/main");
    }

    #[test]
    fn test_interrupt_stops_push() {
        let mut history = MemoryHistory::new();
        history.commit(CommitSpec::new("A").file("x", "1")).unwrap();
        let idmap = IdMap::in_memory();
        let mut db = MemoryObjectDb::new();
        let progress = interruptible_progress();
        progress.interrupt_handle().store(true, Ordering::SeqCst);

        let refs = parse_refs(&[], Some("A".to_string()), &PushConfig::default()).unwrap();
        let result = Synchronizer::new(&history, &idmap).push_local(&mut db, &refs, &progress);
        assert!(matches!(result, Err(SyncError::Interrupted)));
        assert!(db.is_empty());
    }

    #[test]
    fn test_pull_is_unsupported() {
        let err = cmd_pull("http://mirror/repo").unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
