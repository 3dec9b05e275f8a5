// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! History repository trait and the in-memory implementation.
//!
//! The history is the cold tier: committed, immutable states addressed by
//! root digest. The engine only ever reads it through [`HistoryReader`] and
//! only ever extends it through [`HistoryRepository::checkpoint`]. This
//! module defines the trait seam (so a disk- or network-backed store can be
//! swapped in) and a content-addressed in-memory implementation for local
//! use and tests.
//!
//! Root digests are Blake2b-256 over the canonical encoding of the persisted
//! state, so identical logical states have identical roots regardless of the
//! process that committed them.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::SpaceError;
use crate::hot_store::HotStoreSnapshot;
use crate::ident::{canonical_bytes, make_root_hash, StateRoot};
use crate::types::{ChannelBound, ContinuationBound, DataBound, Datum, PatternBound, WaitingContinuation};

/// Read-only view of one committed state.
///
/// Concurrent readers are allowed; no mutation is possible through this
/// interface. A reader stays valid (and keeps answering for its root) even
/// after the repository commits further roots.
pub trait HistoryReader<C, P, A, K>: Send + Sync {
    /// The root this reader answers for.
    fn root(&self) -> StateRoot;

    /// Returns the committed data on `channel`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures from the backing tier.
    fn data(&self, channel: &C) -> Result<Vec<Datum<A>>, SpaceError>;

    /// Returns the committed continuations waiting on `channels`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures from the backing tier.
    fn continuations(&self, channels: &[C]) -> Result<Vec<WaitingContinuation<P, K>>, SpaceError>;

    /// Returns the committed join tuples `channel` participates in.
    ///
    /// # Errors
    ///
    /// Propagates storage failures from the backing tier.
    fn joins(&self, channel: &C) -> Result<Vec<Vec<C>>, SpaceError>;
}

/// Repository of committed states.
pub trait HistoryRepository<C, P, A, K>: Send + Sync {
    /// Returns a reader for the state at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`SpaceError::UnknownRoot`] when `root` was never committed.
    fn reader(&self, root: StateRoot) -> Result<Arc<dyn HistoryReader<C, P, A, K>>, SpaceError>;

    /// Materializes a hot-store overlay into a new committed state on top of
    /// `base` and returns its root.
    ///
    /// Installed rows in `changes` are a process-local concern and must not
    /// serialize into the committed state.
    ///
    /// # Errors
    ///
    /// Returns [`SpaceError::UnknownRoot`] when `base` was never committed,
    /// or a codec error when the state cannot be canonically encoded.
    fn checkpoint(
        &self,
        base: StateRoot,
        changes: &HotStoreSnapshot<C, P, A, K>,
    ) -> Result<StateRoot, SpaceError>;

    /// The canonical empty state's root. Always committed.
    fn empty_root(&self) -> StateRoot;
}

// One committed state. Empty entries are normalized away before hashing so
// that logically equal states encode identically.
#[derive(Clone, Debug, Serialize)]
struct PersistedState<C: Ord, P, A, K> {
    data: BTreeMap<C, Vec<Datum<A>>>,
    continuations: BTreeMap<Vec<C>, Vec<WaitingContinuation<P, K>>>,
    joins: BTreeMap<C, Vec<Vec<C>>>,
}

impl<C: Ord, P, A, K> Default for PersistedState<C, P, A, K> {
    fn default() -> Self {
        Self {
            data: BTreeMap::new(),
            continuations: BTreeMap::new(),
            joins: BTreeMap::new(),
        }
    }
}

struct InMemoryReader<C: Ord, P, A, K> {
    root: StateRoot,
    state: Arc<PersistedState<C, P, A, K>>,
}

impl<C, P, A, K> HistoryReader<C, P, A, K> for InMemoryReader<C, P, A, K>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    K: ContinuationBound,
{
    fn root(&self) -> StateRoot {
        self.root
    }

    fn data(&self, channel: &C) -> Result<Vec<Datum<A>>, SpaceError> {
        Ok(self.state.data.get(channel).cloned().unwrap_or_default())
    }

    fn continuations(&self, channels: &[C]) -> Result<Vec<WaitingContinuation<P, K>>, SpaceError> {
        Ok(self
            .state
            .continuations
            .get(channels)
            .cloned()
            .unwrap_or_default())
    }

    fn joins(&self, channel: &C) -> Result<Vec<Vec<C>>, SpaceError> {
        Ok(self.state.joins.get(channel).cloned().unwrap_or_default())
    }
}

/// Content-addressed in-memory history.
///
/// Committed states are kept in a map keyed by root digest. This is the
/// simplest repository suitable for tests and single-process scenarios; a
/// production deployment would substitute a persistent implementation of the
/// same trait.
pub struct InMemoryHistory<C: Ord, P, A, K> {
    states: Mutex<HashMap<StateRoot, Arc<PersistedState<C, P, A, K>>>>,
    empty_root: StateRoot,
}

impl<C, P, A, K> InMemoryHistory<C, P, A, K>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    K: ContinuationBound,
{
    /// Creates a repository holding only the canonical empty state.
    ///
    /// # Errors
    ///
    /// Returns a codec error when the empty state cannot be encoded, which
    /// indicates a broken `Serialize` implementation on the type parameters.
    pub fn new() -> Result<Self, SpaceError> {
        let empty = Arc::new(PersistedState::default());
        let empty_root = root_of(&empty)?;
        let mut states = HashMap::new();
        states.insert(empty_root, empty);
        Ok(Self {
            states: Mutex::new(states),
            empty_root,
        })
    }
}

fn root_of<C, P, A, K>(state: &PersistedState<C, P, A, K>) -> Result<StateRoot, SpaceError>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    K: ContinuationBound,
{
    let bytes = canonical_bytes(state)?;
    Ok(make_root_hash(&bytes))
}

impl<C, P, A, K> HistoryRepository<C, P, A, K> for InMemoryHistory<C, P, A, K>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    K: ContinuationBound,
{
    fn reader(&self, root: StateRoot) -> Result<Arc<dyn HistoryReader<C, P, A, K>>, SpaceError> {
        let state = self
            .states
            .lock()
            .get(&root)
            .cloned()
            .ok_or(SpaceError::UnknownRoot(root))?;
        Ok(Arc::new(InMemoryReader { root, state }))
    }

    fn checkpoint(
        &self,
        base: StateRoot,
        changes: &HotStoreSnapshot<C, P, A, K>,
    ) -> Result<StateRoot, SpaceError> {
        let base_state = self
            .states
            .lock()
            .get(&base)
            .cloned()
            .ok_or(SpaceError::UnknownRoot(base))?;

        // A touched key's cached value is the full effective list, so the
        // overlay replaces wholesale; empty lists delete the key.
        let mut next: PersistedState<C, P, A, K> = (*base_state).clone();
        for (channel, data) in &changes.data {
            if data.is_empty() {
                next.data.remove(channel);
            } else {
                next.data.insert(channel.clone(), data.clone());
            }
        }
        for (channels, continuations) in &changes.continuations {
            if continuations.is_empty() {
                next.continuations.remove(channels);
            } else {
                next.continuations
                    .insert(channels.clone(), continuations.clone());
            }
        }
        for (channel, joins) in &changes.joins {
            if joins.is_empty() {
                next.joins.remove(channel);
            } else {
                next.joins.insert(channel.clone(), joins.clone());
            }
        }

        let state = Arc::new(next);
        let root = root_of(&state)?;
        self.states.lock().insert(root, state);
        Ok(root)
    }

    fn empty_root(&self) -> StateRoot {
        self.empty_root
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::event::ProduceEvent;
    use crate::ident::{KeyHash, ProduceRef};

    type Repo = InMemoryHistory<String, String, i32, String>;

    fn datum(value: i32) -> Datum<i32> {
        Datum::new(
            value,
            false,
            ProduceEvent {
                channel: KeyHash([0u8; 32]),
                reference: ProduceRef([value as u8; 32]),
                persistent: false,
            },
        )
    }

    fn snapshot_with_datum(channel: &str, value: i32) -> HotStoreSnapshot<String, String, i32, String> {
        let mut snapshot = HotStoreSnapshot::default();
        snapshot.data.insert(channel.to_owned(), vec![datum(value)]);
        snapshot
    }

    #[test]
    fn empty_root_is_always_readable() {
        let repo = Repo::new().unwrap();
        let reader = repo.reader(repo.empty_root()).unwrap();
        assert_eq!(reader.root(), repo.empty_root());
        assert!(reader.data(&"c".to_owned()).unwrap().is_empty());
    }

    #[test]
    fn unknown_root_is_an_error() {
        let repo = Repo::new().unwrap();
        let bogus = StateRoot([7u8; 32]);
        assert!(matches!(
            repo.reader(bogus),
            Err(SpaceError::UnknownRoot(r)) if r == bogus
        ));
    }

    #[test]
    fn checkpoint_commits_the_overlay() {
        let repo = Repo::new().unwrap();
        let root = repo
            .checkpoint(repo.empty_root(), &snapshot_with_datum("c", 42))
            .unwrap();
        assert_ne!(root, repo.empty_root());

        let reader = repo.reader(root).unwrap();
        let data = reader.data(&"c".to_owned()).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].a, 42);
    }

    #[test]
    fn identical_states_share_a_root() {
        let repo = Repo::new().unwrap();
        let a = repo
            .checkpoint(repo.empty_root(), &snapshot_with_datum("c", 1))
            .unwrap();
        let b = repo
            .checkpoint(repo.empty_root(), &snapshot_with_datum("c", 1))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn emptied_keys_return_to_the_empty_root() {
        let repo = Repo::new().unwrap();
        let root = repo
            .checkpoint(repo.empty_root(), &snapshot_with_datum("c", 1))
            .unwrap();

        // Overlay that empties the channel again.
        let mut emptied: HotStoreSnapshot<String, String, i32, String> = HotStoreSnapshot::default();
        emptied.data.insert("c".to_owned(), Vec::new());
        let back = repo.checkpoint(root, &emptied).unwrap();
        assert_eq!(back, repo.empty_root());
    }

    #[test]
    fn installed_rows_do_not_reach_the_root() {
        let repo = Repo::new().unwrap();
        let mut snapshot: HotStoreSnapshot<String, String, i32, String> = HotStoreSnapshot::default();
        snapshot.installed_joins.insert(
            "c".to_owned(),
            vec![vec!["c".to_owned(), "d".to_owned()]],
        );
        let root = repo.checkpoint(repo.empty_root(), &snapshot).unwrap();
        assert_eq!(root, repo.empty_root());
    }
}
