//! Ancestry walker
//!
//! Finds the revisions that still have to be converted and orders them so
//! every parent comes before its children.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::error::Result;
use crate::native::{HistoryStore, RevisionId};
use crate::progress::Progress;

/// Revisions to synchronize, parents first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingRevisions {
    pub revisions: Vec<RevisionId>,
    /// Referenced but absent from the history; assumed present at the destination
    pub ghosts: Vec<RevisionId>,
}

/// Read-only view over the revision graph of a history store
pub struct Graph<'a> {
    store: &'a dyn HistoryStore,
}

impl<'a> Graph<'a> {
    pub fn new(store: &'a dyn HistoryStore) -> Self {
        Self { store }
    }

    /// Breadth-first walk from `stop` over every ancestor.
    ///
    /// Yields each revision once with its parents, or `None` for ghosts.
    /// `null:` is never yielded.
    pub fn iter_ancestry(&self, stop: &[RevisionId]) -> Vec<(RevisionId, Option<Vec<RevisionId>>)> {
        let mut seen: HashSet<RevisionId> = HashSet::new();
        let mut pending: VecDeque<RevisionId> = VecDeque::new();
        for id in stop {
            if !id.is_null() && seen.insert(id.clone()) {
                pending.push_back(id.clone());
            }
        }

        let mut out = Vec::new();
        while !pending.is_empty() {
            let batch: Vec<RevisionId> = pending.drain(..).collect();
            let parent_map = self.store.get_parent_map(&batch);
            for id in batch {
                match parent_map.get(&id) {
                    Some(parents) => {
                        for parent in parents {
                            if !parent.is_null() && seen.insert(parent.clone()) {
                                pending.push_back(parent.clone());
                            }
                        }
                        out.push((id, Some(parents.clone())));
                    }
                    None => out.push((id, None)),
                }
            }
        }
        out
    }

    /// Every non-ghost revision reachable from `heads`, heads included
    pub fn ancestry_closure(&self, heads: &[RevisionId]) -> HashSet<RevisionId> {
        self.iter_ancestry(heads)
            .into_iter()
            .filter_map(|(id, parents)| parents.map(|_| id))
            .collect()
    }

    /// Order `revisions` so that ancestors come first
    pub fn topo_sort(&self, revisions: &[RevisionId]) -> Vec<RevisionId> {
        let parent_map: HashMap<RevisionId, Vec<RevisionId>> = self
            .iter_ancestry(revisions)
            .into_iter()
            .filter_map(|(id, parents)| parents.map(|p| (id, p)))
            .collect();
        topo_sort(&parent_map, revisions)
    }

    /// Ancestors of `stop` for which `already_present` is false, parents first.
    ///
    /// Ghosts are reported but never requested: they are treated as already
    /// available at the destination.
    pub fn find_missing<F>(
        &self,
        stop: &[RevisionId],
        mut already_present: F,
        progress: &dyn Progress,
    ) -> Result<MissingRevisions>
    where
        F: FnMut(&RevisionId) -> Result<bool>,
    {
        let ancestry = self.iter_ancestry(stop);
        let total = ancestry.len();
        let mut parent_map = HashMap::with_capacity(total);
        let mut wanted = Vec::new();
        let mut ghosts = Vec::new();

        for (i, (id, parents)) in ancestry.into_iter().enumerate() {
            progress.update("finding revisions", i, Some(total));
            match parents {
                None => {
                    warn!(revision = %id, "ghost revision, assuming it is present at the destination");
                    ghosts.push(id);
                }
                Some(parents) => {
                    if !already_present(&id)? {
                        wanted.push(id.clone());
                    }
                    parent_map.insert(id, parents);
                }
            }
        }

        let revisions = topo_sort(&parent_map, &wanted);
        debug!(missing = revisions.len(), ghosts = ghosts.len(), "ancestry walk done");
        Ok(MissingRevisions { revisions, ghosts })
    }
}

/// Depth-first post-order over `parents`, keeping only `revisions`.
///
/// Traversal passes through revisions outside the requested set so that
/// indirect ancestry is respected. Output is stable for a fixed input.
pub fn topo_sort(parents: &HashMap<RevisionId, Vec<RevisionId>>, revisions: &[RevisionId]) -> Vec<RevisionId> {
    let wanted: HashSet<&RevisionId> = revisions.iter().collect();
    let mut visited: HashSet<RevisionId> = HashSet::new();
    let mut out = Vec::with_capacity(revisions.len());

    for start in revisions {
        if !visited.insert(start.clone()) {
            continue;
        }
        let mut stack: Vec<(RevisionId, usize)> = vec![(start.clone(), 0)];
        while let Some((node, idx)) = stack.last_mut() {
            let next = parents.get(&*node).and_then(|ps| ps.get(*idx)).cloned();
            *idx += 1;
            match next {
                Some(parent) => {
                    if !parent.is_null() && visited.insert(parent.clone()) {
                        stack.push((parent, 0));
                    }
                }
                None => {
                    if let Some((done, _)) = stack.pop() {
                        if wanted.contains(&done) {
                            out.push(done);
                        }
                    }
                }
            }
        }
    }
    out
}
