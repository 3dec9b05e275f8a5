// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hot store: the mutable in-memory overlay on top of a history reader.
//!
//! The hot store is the staging tier. Reads fall through to the history for
//! untouched keys; the first mutation of a key merges the history value so
//! the cache always holds the full effective list for every touched key.
//! That makes the overlay faithful (effective value = history value plus
//! delta) and makes checkpointing a wholesale key replacement.
//!
//! Index stability: the indices handed out by [`HotStore::get_data`] and
//! [`HotStore::get_continuations`] stay valid for the duration of one engine
//! operation because the engine removes entries in strictly descending index
//! order. This is a load-bearing invariant; removal helpers verify bounds
//! and report corruption instead of panicking.
//!
//! Installed continuations and joins live in separate regions. They behave
//! like stored entries for matching but are excluded from checkpoints and
//! from `to_map`, and they are re-applied by the engine on every reset.
use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::SpaceError;
use crate::history::HistoryReader;
use crate::types::{ChannelBound, ContinuationBound, DataBound, Datum, PatternBound, WaitingContinuation};

/// Complete copy of a hot-store overlay, captured for soft checkpoints and
/// consumed by history checkpoints.
#[derive(Clone, Debug)]
pub struct HotStoreSnapshot<C, P, A, K> {
    /// Touched data keys and their effective lists.
    pub data: BTreeMap<C, Vec<Datum<A>>>,
    /// Touched continuation keys and their effective lists.
    pub continuations: BTreeMap<Vec<C>, Vec<WaitingContinuation<P, K>>>,
    /// Installed continuations (one slot per key).
    pub installed_continuations: BTreeMap<Vec<C>, WaitingContinuation<P, K>>,
    /// Touched join keys and their effective lists.
    pub joins: BTreeMap<C, Vec<Vec<C>>>,
    /// Installed joins.
    pub installed_joins: BTreeMap<C, Vec<Vec<C>>>,
}

impl<C, P, A, K> Default for HotStoreSnapshot<C, P, A, K> {
    fn default() -> Self {
        Self {
            data: BTreeMap::new(),
            continuations: BTreeMap::new(),
            installed_continuations: BTreeMap::new(),
            joins: BTreeMap::new(),
            installed_joins: BTreeMap::new(),
        }
    }
}

/// One row of the materialized overlay view returned by [`HotStore::to_map`].
#[derive(Clone, Debug)]
pub struct StoreRow<P, A, K> {
    /// Data stored under the row's key.
    pub data: Vec<Datum<A>>,
    /// Continuations waiting under the row's key.
    pub continuations: Vec<WaitingContinuation<P, K>>,
}

/// Mutable overlay over a [`HistoryReader`].
///
/// Writers must hold the key lock for every channel they touch; the engine
/// guarantees this. Concurrent readers outside the engine see a consistent
/// overlay because writes replace whole lists and indices are stable within
/// an operation.
pub struct HotStore<C, P, A, K> {
    history: Arc<dyn HistoryReader<C, P, A, K>>,
    data: DashMap<C, Vec<Datum<A>>>,
    continuations: DashMap<Vec<C>, Vec<WaitingContinuation<P, K>>>,
    installed_continuations: DashMap<Vec<C>, WaitingContinuation<P, K>>,
    joins: DashMap<C, Vec<Vec<C>>>,
    installed_joins: DashMap<C, Vec<Vec<C>>>,
}

impl<C, P, A, K> HotStore<C, P, A, K>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    K: ContinuationBound,
{
    /// Creates an empty overlay on top of `history`.
    #[must_use]
    pub fn new(history: Arc<dyn HistoryReader<C, P, A, K>>) -> Self {
        Self {
            history,
            data: DashMap::new(),
            continuations: DashMap::new(),
            installed_continuations: DashMap::new(),
            joins: DashMap::new(),
            installed_joins: DashMap::new(),
        }
    }

    /// Rebuilds an overlay from a prior snapshot on top of `history`.
    ///
    /// Used by `revert_to_soft_checkpoint`: the snapshot's touched keys and
    /// installed regions are restored verbatim.
    #[must_use]
    pub fn from_snapshot(
        history: Arc<dyn HistoryReader<C, P, A, K>>,
        snapshot: &HotStoreSnapshot<C, P, A, K>,
    ) -> Self {
        let store = Self::new(history);
        for (channel, data) in &snapshot.data {
            store.data.insert(channel.clone(), data.clone());
        }
        for (channels, continuations) in &snapshot.continuations {
            store
                .continuations
                .insert(channels.clone(), continuations.clone());
        }
        for (channels, installed) in &snapshot.installed_continuations {
            store
                .installed_continuations
                .insert(channels.clone(), installed.clone());
        }
        for (channel, joins) in &snapshot.joins {
            store.joins.insert(channel.clone(), joins.clone());
        }
        for (channel, joins) in &snapshot.installed_joins {
            store.installed_joins.insert(channel.clone(), joins.clone());
        }
        store
    }

    /// The history reader this overlay reads through to.
    #[must_use]
    pub fn history(&self) -> &Arc<dyn HistoryReader<C, P, A, K>> {
        &self.history
    }

    fn cached_or_history_data(&self, channel: &C) -> Result<Vec<Datum<A>>, SpaceError> {
        if let Some(cached) = self.data.get(channel) {
            return Ok(cached.value().clone());
        }
        self.history.data(channel)
    }

    fn cached_or_history_continuations(
        &self,
        channels: &[C],
    ) -> Result<Vec<WaitingContinuation<P, K>>, SpaceError> {
        if let Some(cached) = self.continuations.get(channels) {
            return Ok(cached.value().clone());
        }
        self.history.continuations(channels)
    }

    fn cached_or_history_joins(&self, channel: &C) -> Result<Vec<Vec<C>>, SpaceError> {
        if let Some(cached) = self.joins.get(channel) {
            return Ok(cached.value().clone());
        }
        self.history.joins(channel)
    }

    /// Returns the effective data on `channel`.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn get_data(&self, channel: &C) -> Result<Vec<Datum<A>>, SpaceError> {
        self.cached_or_history_data(channel)
    }

    /// Returns the effective continuations waiting on `channels`: the
    /// installed continuation (if any) first, then stored ones.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn get_continuations(
        &self,
        channels: &[C],
    ) -> Result<Vec<WaitingContinuation<P, K>>, SpaceError> {
        let mut out: Vec<WaitingContinuation<P, K>> = Vec::new();
        if let Some(installed) = self.installed_continuations.get(channels) {
            out.push(installed.value().clone());
        }
        out.extend(self.cached_or_history_continuations(channels)?);
        Ok(out)
    }

    /// Returns the effective join tuples `channel` participates in:
    /// installed joins first, then stored ones.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn get_joins(&self, channel: &C) -> Result<Vec<Vec<C>>, SpaceError> {
        let mut out: Vec<Vec<C>> = self
            .installed_joins
            .get(channel)
            .map(|joins| joins.value().clone())
            .unwrap_or_default();
        for join in self.cached_or_history_joins(channel)? {
            if !out.contains(&join) {
                out.push(join);
            }
        }
        Ok(out)
    }

    /// Appends `datum` to `channel`'s sequence, merging the history value on
    /// first touch.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn put_datum(&self, channel: &C, datum: Datum<A>) -> Result<(), SpaceError> {
        let mut list = self.cached_or_history_data(channel)?;
        list.push(datum);
        self.data.insert(channel.clone(), list);
        Ok(())
    }

    /// Prepends `continuation` to the stored continuations at `channels`.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn put_continuation(
        &self,
        channels: &[C],
        continuation: WaitingContinuation<P, K>,
    ) -> Result<(), SpaceError> {
        let mut list = self.cached_or_history_continuations(channels)?;
        list.insert(0, continuation);
        self.continuations.insert(channels.to_vec(), list);
        Ok(())
    }

    /// Ensures `channels` is present in `channel`'s join list; newest first,
    /// deduplicated against both the stored and installed regions.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn put_join(&self, channel: &C, channels: &[C]) -> Result<(), SpaceError> {
        let installed = self
            .installed_joins
            .get(channel)
            .map(|joins| joins.value().clone())
            .unwrap_or_default();
        let mut list = self.cached_or_history_joins(channel)?;
        if !list.iter().any(|j| j == channels) && !installed.iter().any(|j| j == channels) {
            list.insert(0, channels.to_vec());
        }
        self.joins.insert(channel.clone(), list);
        Ok(())
    }

    /// Installs `continuation` at `channels`. Installed continuations match
    /// like stored ones but never serialize into a checkpoint.
    pub fn install_continuation(&self, channels: &[C], continuation: WaitingContinuation<P, K>) {
        self.installed_continuations
            .insert(channels.to_vec(), continuation);
    }

    /// Installs the join tuple `channels` for `channel`.
    pub fn install_join(&self, channel: &C, channels: &[C]) {
        let mut entry = self
            .installed_joins
            .entry(channel.clone())
            .or_default();
        if !entry.iter().any(|j| j == channels) {
            entry.insert(0, channels.to_vec());
        }
    }

    /// Removes the datum at stable index `index` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`SpaceError::InternalCorruption`] when the index does not
    /// name a stored datum; propagates history read failures.
    pub fn remove_datum(&self, channel: &C, index: usize) -> Result<(), SpaceError> {
        let mut list = self.cached_or_history_data(channel)?;
        if index >= list.len() {
            return Err(SpaceError::InternalCorruption("datum index out of bounds"));
        }
        list.remove(index);
        self.data.insert(channel.clone(), list);
        Ok(())
    }

    /// Removes the continuation at stable index `index` on `channels`.
    ///
    /// Indices are positions in the [`HotStore::get_continuations`] view, so
    /// index 0 names the installed continuation when one exists; removing it
    /// is corruption (installed continuations are permanent by construction).
    ///
    /// # Errors
    ///
    /// Returns [`SpaceError::InternalCorruption`] for installed or
    /// out-of-bounds indices; propagates history read failures.
    pub fn remove_continuation(&self, channels: &[C], index: usize) -> Result<(), SpaceError> {
        let installed = usize::from(self.installed_continuations.contains_key(channels));
        if index < installed {
            return Err(SpaceError::InternalCorruption(
                "installed continuations cannot be removed",
            ));
        }
        let stored_index = index - installed;
        let mut list = self.cached_or_history_continuations(channels)?;
        if stored_index >= list.len() {
            return Err(SpaceError::InternalCorruption(
                "continuation index out of bounds",
            ));
        }
        list.remove(stored_index);
        self.continuations.insert(channels.to_vec(), list);
        Ok(())
    }

    /// Removes the join tuple `channels` from `channel`'s stored join list,
    /// unless a continuation still waits on `channels`.
    ///
    /// The conditional keeps join/continuation symmetry through matches on
    /// persistent continuations: while a continuation remains at the key,
    /// the join must remain reachable.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn remove_join(&self, channel: &C, channels: &[C]) -> Result<(), SpaceError> {
        if !self.get_continuations(channels)?.is_empty() {
            return Ok(());
        }
        let mut list = self.cached_or_history_joins(channel)?;
        if let Some(position) = list.iter().position(|j| j == channels) {
            list.remove(position);
            self.joins.insert(channel.clone(), list);
        }
        Ok(())
    }

    /// Captures the complete overlay: every touched key and both installed
    /// regions.
    #[must_use]
    pub fn snapshot(&self) -> HotStoreSnapshot<C, P, A, K> {
        let mut snapshot = HotStoreSnapshot::default();
        for entry in &self.data {
            snapshot.data.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in &self.continuations {
            snapshot
                .continuations
                .insert(entry.key().clone(), entry.value().clone());
        }
        for entry in &self.installed_continuations {
            snapshot
                .installed_continuations
                .insert(entry.key().clone(), entry.value().clone());
        }
        for entry in &self.joins {
            snapshot.joins.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in &self.installed_joins {
            snapshot
                .installed_joins
                .insert(entry.key().clone(), entry.value().clone());
        }
        snapshot
    }

    /// Materializes the overlay into rows keyed by channel tuple: data under
    /// singleton keys, continuations under their registration keys. Installed
    /// rows and emptied keys are omitted.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<Vec<C>, StoreRow<P, A, K>> {
        let mut map: BTreeMap<Vec<C>, StoreRow<P, A, K>> = BTreeMap::new();
        for entry in &self.data {
            if entry.value().is_empty() {
                continue;
            }
            let row = map.entry(vec![entry.key().clone()]).or_insert_with(empty_row);
            row.data = entry.value().clone();
        }
        for entry in &self.continuations {
            if entry.value().is_empty() {
                continue;
            }
            let row = map.entry(entry.key().clone()).or_insert_with(empty_row);
            row.continuations = entry.value().clone();
        }
        map
    }
}

fn empty_row<P, A, K>() -> StoreRow<P, A, K> {
    StoreRow {
        data: Vec::new(),
        continuations: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::BTreeSet;

    use super::*;
    use crate::event::{ConsumeEvent, ProduceEvent};
    use crate::history::{HistoryRepository, InMemoryHistory};
    use crate::ident::{ConsumeRef, KeyHash, ProduceRef};

    type Store = HotStore<String, String, i32, String>;

    fn datum(value: i32, persist: bool) -> Datum<i32> {
        Datum::new(
            value,
            persist,
            ProduceEvent {
                channel: KeyHash([0u8; 32]),
                reference: ProduceRef([value as u8; 32]),
                persistent: persist,
            },
        )
    }

    fn continuation(tag: &str) -> WaitingContinuation<String, String> {
        WaitingContinuation {
            patterns: vec!["*".to_owned()],
            continuation: tag.to_owned(),
            persist: false,
            peeks: BTreeSet::new(),
            source: ConsumeEvent {
                channels: vec![KeyHash([0u8; 32])],
                reference: ConsumeRef([9u8; 32]),
                persistent: false,
            },
        }
    }

    fn empty_store() -> Store {
        let repo: InMemoryHistory<String, String, i32, String> = InMemoryHistory::new().unwrap();
        let reader = repo.reader(repo.empty_root()).unwrap();
        HotStore::new(reader)
    }

    fn store_over_history(value: i32) -> Store {
        let repo: InMemoryHistory<String, String, i32, String> = InMemoryHistory::new().unwrap();
        let mut snapshot = HotStoreSnapshot::default();
        snapshot.data.insert("c".to_owned(), vec![datum(value, false)]);
        let root = repo.checkpoint(repo.empty_root(), &snapshot).unwrap();
        HotStore::new(repo.reader(root).unwrap())
    }

    #[test]
    fn reads_fall_through_to_history() {
        let store = store_over_history(7);
        let data = store.get_data(&"c".to_owned()).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].a, 7);
    }

    #[test]
    fn first_mutation_merges_the_history_value() {
        let store = store_over_history(7);
        store.put_datum(&"c".to_owned(), datum(8, false)).unwrap();
        let data = store.get_data(&"c".to_owned()).unwrap();
        assert_eq!(data.iter().map(|d| d.a).collect::<Vec<_>>(), vec![7, 8]);
    }

    #[test]
    fn remove_datum_is_index_stable() {
        let store = empty_store();
        let channel = "c".to_owned();
        for value in 0..3 {
            store.put_datum(&channel, datum(value, false)).unwrap();
        }
        // Remove indices 2 then 0 (descending): index 0 stays valid.
        store.remove_datum(&channel, 2).unwrap();
        store.remove_datum(&channel, 0).unwrap();
        let data = store.get_data(&channel).unwrap();
        assert_eq!(data.iter().map(|d| d.a).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn remove_datum_out_of_bounds_is_corruption() {
        let store = empty_store();
        let err = store.remove_datum(&"c".to_owned(), 0).unwrap_err();
        assert!(matches!(err, SpaceError::InternalCorruption(_)));
    }

    #[test]
    fn installed_continuation_is_first_and_unremovable() {
        let store = empty_store();
        let key = vec!["a".to_owned(), "b".to_owned()];
        store.install_continuation(&key, continuation("installed"));
        store.put_continuation(&key, continuation("stored")).unwrap();

        let view = store.get_continuations(&key).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].continuation, "installed");

        let err = store.remove_continuation(&key, 0).unwrap_err();
        assert!(matches!(err, SpaceError::InternalCorruption(_)));
        store.remove_continuation(&key, 1).unwrap();
        assert_eq!(store.get_continuations(&key).unwrap().len(), 1);
    }

    #[test]
    fn put_join_deduplicates() {
        let store = empty_store();
        let channel = "a".to_owned();
        let key = vec!["a".to_owned(), "b".to_owned()];
        store.put_join(&channel, &key).unwrap();
        store.put_join(&channel, &key).unwrap();
        assert_eq!(store.get_joins(&channel).unwrap().len(), 1);
    }

    #[test]
    fn remove_join_is_blocked_by_waiting_continuations() {
        let store = empty_store();
        let channel = "a".to_owned();
        let key = vec!["a".to_owned(), "b".to_owned()];
        store.put_join(&channel, &key).unwrap();
        store.put_continuation(&key, continuation("k")).unwrap();

        store.remove_join(&channel, &key).unwrap();
        assert_eq!(store.get_joins(&channel).unwrap().len(), 1);

        store.remove_continuation(&key, 0).unwrap();
        store.remove_join(&channel, &key).unwrap();
        assert!(store.get_joins(&channel).unwrap().is_empty());
    }

    #[test]
    fn snapshot_round_trips_through_from_snapshot() {
        let store = empty_store();
        let channel = "c".to_owned();
        store.put_datum(&channel, datum(1, true)).unwrap();
        store.install_join(&channel, &[channel.clone()]);

        let snapshot = store.snapshot();
        let repo: InMemoryHistory<String, String, i32, String> = InMemoryHistory::new().unwrap();
        let restored = HotStore::from_snapshot(repo.reader(repo.empty_root()).unwrap(), &snapshot);

        assert_eq!(restored.get_data(&channel).unwrap().len(), 1);
        assert_eq!(restored.get_joins(&channel).unwrap().len(), 1);
    }

    #[test]
    fn to_map_omits_installed_and_empty_rows() {
        let store = empty_store();
        let channel = "c".to_owned();
        store.put_datum(&channel, datum(1, false)).unwrap();
        store.remove_datum(&channel, 0).unwrap();
        store.install_continuation(&[channel.clone()], continuation("installed"));
        assert!(store.to_map().is_empty());
    }
}
