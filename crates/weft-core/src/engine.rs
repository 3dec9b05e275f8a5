// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The tuplespace engine: produce, consume, install, checkpoints, replay.
//!
//! One [`TupleSpace`] is one session over a history root. Operations run on
//! caller threads; each serializes on the stable hashes of the channels it
//! touches, so operations with disjoint key sets proceed in parallel.
//!
//! Commit discipline, per operation:
//! 1. validate arguments (before any lock),
//! 2. acquire the key set (two-phase for produce: the join-induced sibling
//!    set is discovered while the producer's own channel is already held),
//! 3. run the matcher over candidates,
//! 4. once the match is final: append to the event log, then mutate the hot
//!    store in strictly descending datum-index order.
//!
//! Nothing is written before step 4, so a failing matcher or store aborts
//! the operation with no partial state.
//!
//! Lock order is `state` (read for ops, write for reset/checkpoint paths),
//! then key locks, then the journal or installs mutex; it is never reversed.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::error::SpaceError;
use crate::event::{CommEvent, ConsumeEvent, Event, Journal, ProduceEvent};
use crate::history::HistoryRepository;
use crate::hot_store::{HotStore, StoreRow};
use crate::ident::{make_channel_hash, make_consume_ref, make_produce_ref, KeyHash, ProduceRef, StateRoot};
use crate::key_lock::KeyLocks;
use crate::matching::{
    extract_data_candidates, extract_first_match, shuffled_pool, shuffled_with_index,
    ConsumeCandidate, IndexedData, Matcher,
};
use crate::replay::{EventRef, ReplayIndex};
use crate::telemetry::{NullSpaceTelemetry, SpaceTelemetry};
use crate::types::{
    ChannelBound, Checkpoint, ConsumeResult, ContResult, ContinuationBound, DataBound, Datum,
    Install, PatternBound, ProduceResult, RowResult, SoftCheckpoint, WaitingContinuation,
};

// The swap point: the hot store and its history reader are replaced together
// on reset and checkpoint, behind an exclusive write lock.
struct SessionState<C, P, A, K> {
    root: StateRoot,
    store: HotStore<C, P, A, K>,
}

/// Fluent builder for [`TupleSpace`] instances.
///
/// History repository and matcher are required; telemetry defaults to
/// [`NullSpaceTelemetry`] and the metrics source label to `"tuplespace"`.
pub struct SpaceBuilder<C, P, A, K, R, M> {
    history: R,
    matcher: M,
    telemetry: Arc<dyn SpaceTelemetry>,
    source: String,
    _marker: std::marker::PhantomData<(C, P, A, K)>,
}

impl<C, P, A, K, R, M> SpaceBuilder<C, P, A, K, R, M>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    K: ContinuationBound,
    R: HistoryRepository<C, P, A, K>,
    M: Matcher<P, A>,
{
    /// Creates a builder over `history` with the supplied matcher.
    pub fn new(history: R, matcher: M) -> Self {
        Self {
            history,
            matcher,
            telemetry: Arc::new(NullSpaceTelemetry),
            source: "tuplespace".to_owned(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Installs a telemetry sink.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn SpaceTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Sets the metrics source label passed to the telemetry sink.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Builds the engine over the history's empty root.
    ///
    /// # Errors
    ///
    /// Propagates repository failures while opening the empty root.
    pub fn build(self) -> Result<TupleSpace<C, P, A, K, R, M>, SpaceError> {
        let root = self.history.empty_root();
        let reader = self.history.reader(root)?;
        Ok(TupleSpace {
            history: self.history,
            matcher: self.matcher,
            state: RwLock::new(SessionState {
                root,
                store: HotStore::new(reader),
            }),
            locks: KeyLocks::new(),
            journal: Mutex::new(Journal::default()),
            installs: Mutex::new(BTreeMap::new()),
            replay: Mutex::new(None),
            telemetry: self.telemetry,
            source: self.source,
        })
    }
}

/// A concurrent tuplespace session.
///
/// Producers publish data on channels; consumers register pattern tuples
/// with a continuation. Whenever a data tuple satisfies a registered pattern
/// tuple the engine atomically removes the matched entries (subject to
/// persistence and peek flags), records a COMM event, and hands the
/// continuation back to the caller.
pub struct TupleSpace<C, P, A, K, R, M> {
    history: R,
    matcher: M,
    state: RwLock<SessionState<C, P, A, K>>,
    locks: KeyLocks,
    journal: Mutex<Journal>,
    installs: Mutex<BTreeMap<Vec<C>, Install<P, K>>>,
    replay: Mutex<Option<ReplayIndex>>,
    telemetry: Arc<dyn SpaceTelemetry>,
    source: String,
}

impl<C, P, A, K, R, M> TupleSpace<C, P, A, K, R, M>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    K: ContinuationBound,
    R: HistoryRepository<C, P, A, K>,
    M: Matcher<P, A>,
{
    /// Shorthand for [`SpaceBuilder::new`].
    pub fn builder(history: R, matcher: M) -> SpaceBuilder<C, P, A, K, R, M> {
        SpaceBuilder::new(history, matcher)
    }

    // ========================================================================
    // Produce / consume / install
    // ========================================================================

    /// Registers `patterns` over `channels` with a continuation.
    ///
    /// Returns `Some` when currently stored data satisfies every pattern: the
    /// matched data is withdrawn (subject to persistence and `peeks`) and the
    /// continuation is handed back. Returns `None` when no match exists; the
    /// continuation is then stored to await future produces.
    ///
    /// `peeks` holds channel positions whose matched datum must be retained
    /// even on a non-persistent match.
    ///
    /// # Errors
    ///
    /// Argument validation errors surface before any lock is taken; matcher
    /// and store failures abort the operation with no state change; replay
    /// divergence surfaces when rigged.
    pub fn consume(
        &self,
        channels: Vec<C>,
        patterns: Vec<P>,
        continuation: K,
        persist: bool,
        peeks: BTreeSet<usize>,
    ) -> Result<Option<ConsumeResult<C, P, A, K>>, SpaceError> {
        let started = Instant::now();
        if channels.is_empty() {
            return Err(SpaceError::EmptyChannels);
        }
        if channels.len() != patterns.len() {
            return Err(SpaceError::ArityMismatch {
                channels: channels.len(),
                patterns: patterns.len(),
            });
        }
        if let Some(&index) = peeks.iter().find(|&&index| index >= channels.len()) {
            return Err(SpaceError::InvalidPeek {
                index,
                arity: channels.len(),
            });
        }

        let mut ordered_hashes = Vec::with_capacity(channels.len());
        for channel in &channels {
            ordered_hashes.push(make_channel_hash(channel)?);
        }
        let keys: BTreeSet<KeyHash> = ordered_hashes.iter().copied().collect();
        let reference = make_consume_ref(&channels, &patterns, &continuation, persist)?;
        let consume_event = ConsumeEvent {
            channels: ordered_hashes,
            reference,
            persistent: persist,
        };

        let state = self.state.read();
        let result = self.locks.with_keys(&keys, || {
            let mut replay_guard = self.replay.lock();
            if let Some(rig) = replay_guard.as_mut() {
                self.replay_consume(
                    rig,
                    &state.store,
                    channels,
                    patterns,
                    continuation,
                    persist,
                    peeks,
                    consume_event,
                )
            } else {
                drop(replay_guard);
                self.live_consume(
                    &state.store,
                    channels,
                    patterns,
                    continuation,
                    persist,
                    peeks,
                    consume_event,
                )
            }
        })?;
        drop(state);
        self.telemetry
            .on_consume(&self.source, result.is_some(), started.elapsed());
        Ok(result)
    }

    /// Publishes `data` on `channel`.
    ///
    /// Returns `Some` when the datum completes a waiting continuation's
    /// tuple: the continuation is withdrawn (unless persistent) and handed
    /// back with the full matched row tuple. Returns `None` when nothing
    /// matched; the datum is then stored.
    ///
    /// The lock set expands in two phases: the producer's own channel first,
    /// then every channel of every join the channel participates in, so a
    /// concurrent consumer on a sibling channel cannot commit an
    /// inconsistent match.
    ///
    /// # Errors
    ///
    /// Matcher and store failures abort the operation with no state change;
    /// replay divergence surfaces when rigged.
    pub fn produce(
        &self,
        channel: C,
        data: A,
        persist: bool,
    ) -> Result<Option<ProduceResult<C, P, A, K>>, SpaceError> {
        let started = Instant::now();
        let channel_hash = make_channel_hash(&channel)?;
        let reference = make_produce_ref(&channel, &data, persist)?;
        let produce_event = ProduceEvent {
            channel: channel_hash,
            reference,
            persistent: persist,
        };

        let initial: BTreeSet<KeyHash> = std::iter::once(channel_hash).collect();
        let state = self.state.read();
        let result = self.locks.with_expansion(
            &initial,
            || {
                let mut keys = BTreeSet::new();
                for join in state.store.get_joins(&channel)? {
                    for sibling in &join {
                        keys.insert(make_channel_hash(sibling)?);
                    }
                }
                Ok(keys)
            },
            || {
                let mut replay_guard = self.replay.lock();
                if let Some(rig) = replay_guard.as_mut() {
                    self.replay_produce(rig, &state.store, &channel, data, persist, produce_event)
                } else {
                    drop(replay_guard);
                    self.live_produce(&state.store, &channel, data, persist, produce_event)
                }
            },
        )?;
        drop(state);
        self.telemetry
            .on_produce(&self.source, result.is_some(), started.elapsed());
        Ok(result)
    }

    /// Registers an always-persistent continuation that survives resets.
    ///
    /// Installs are a startup configuration mechanism: they live outside the
    /// event log, are excluded from checkpoints, and are re-applied by
    /// [`TupleSpace::reset`]. Finding matching data already present is a
    /// permanent configuration error. Returns `None` on success.
    ///
    /// # Errors
    ///
    /// [`SpaceError::InstallAfterStartup`] when stored data already matches;
    /// argument validation and store failures as for `consume`.
    pub fn install(
        &self,
        channels: Vec<C>,
        patterns: Vec<P>,
        continuation: K,
    ) -> Result<Option<(K, Vec<A>)>, SpaceError> {
        if channels.is_empty() {
            return Err(SpaceError::EmptyChannels);
        }
        if channels.len() != patterns.len() {
            return Err(SpaceError::ArityMismatch {
                channels: channels.len(),
                patterns: patterns.len(),
            });
        }

        let mut keys = BTreeSet::new();
        for channel in &channels {
            keys.insert(make_channel_hash(channel)?);
        }

        let state = self.state.read();
        self.locks.with_keys(&keys, || {
            self.install_binding(&state.store, &channels, &patterns, &continuation)
        })?;
        drop(state);

        self.installs.lock().insert(
            channels,
            Install {
                patterns,
                continuation,
            },
        );
        self.telemetry.on_install(&self.source);
        Ok(None)
    }

    // ========================================================================
    // Session control
    // ========================================================================

    /// Rebinds the session onto the state at `root`: fresh hot store, drained
    /// journal, pruned lock manager, installs re-applied.
    ///
    /// # Errors
    ///
    /// [`SpaceError::UnknownRoot`] when `root` was never committed;
    /// [`SpaceError::InstallAfterStartup`] when the new root already holds
    /// data matching an install.
    pub fn reset(&self, root: StateRoot) -> Result<(), SpaceError> {
        let reader = self.history.reader(root)?;
        let mut state = self.state.write();
        state.root = root;
        state.store = HotStore::new(reader);
        self.journal.lock().drain();
        self.locks.clean_up();
        self.restore_installs(&state.store)?;
        drop(state);
        self.telemetry.on_reset(&self.source);
        Ok(())
    }

    /// Equivalent to `reset(empty_root)`.
    ///
    /// # Errors
    ///
    /// As for [`TupleSpace::reset`].
    pub fn clear(&self) -> Result<(), SpaceError> {
        self.reset(self.history.empty_root())
    }

    /// Atomically snapshots the hot store and drains the event log and the
    /// produce counter. The session continues, in-session clean, atop the
    /// same history root.
    pub fn create_soft_checkpoint(&self) -> SoftCheckpoint<C, P, A, K> {
        let state = self.state.write();
        let cache_snapshot = state.store.snapshot();
        let (log, produce_counter) = self.journal.lock().drain();
        drop(state);
        SoftCheckpoint {
            cache_snapshot,
            log,
            produce_counter,
        }
    }

    /// Rebuilds the session from a soft checkpoint taken atop the current
    /// history root: hot store, event log, and produce counter are restored
    /// exactly.
    ///
    /// # Errors
    ///
    /// Propagates repository failures while re-opening the current root.
    pub fn revert_to_soft_checkpoint(
        &self,
        checkpoint: SoftCheckpoint<C, P, A, K>,
    ) -> Result<(), SpaceError> {
        let mut state = self.state.write();
        let reader = self.history.reader(state.root)?;
        state.store = HotStore::from_snapshot(reader, &checkpoint.cache_snapshot);
        let mut journal = self.journal.lock();
        journal.log = checkpoint.log;
        journal.produce_counter = checkpoint.produce_counter;
        drop(journal);
        drop(state);
        self.telemetry.on_revert_soft_checkpoint(&self.source);
        Ok(())
    }

    /// Materializes the hot-store delta into a new history root and rebinds
    /// the session onto it with a fresh hot store and a drained event log.
    ///
    /// The produce counter deliberately survives; only soft operations and
    /// reset drain it.
    ///
    /// # Errors
    ///
    /// Propagates repository failures; [`SpaceError::InstallAfterStartup`]
    /// when re-applying installs finds matching committed data.
    pub fn create_checkpoint(&self) -> Result<Checkpoint, SpaceError> {
        let mut state = self.state.write();
        let changes = state.store.snapshot();
        let root = self.history.checkpoint(state.root, &changes)?;
        let log = self.journal.lock().drain_log();
        let reader = self.history.reader(root)?;
        state.root = root;
        state.store = HotStore::new(reader);
        self.restore_installs(&state.store)?;
        Ok(Checkpoint { root, log })
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Loads a recorded event log for replay. Until [`TupleSpace::unrig`],
    /// every operation must reproduce the rigged communications exactly.
    pub fn rig(&self, log: &[Event]) {
        *self.replay.lock() = Some(ReplayIndex::from_log(log));
    }

    /// Returns the session to live execution.
    pub fn unrig(&self) {
        *self.replay.lock() = None;
    }

    /// Asserts that every rigged communication was reproduced.
    ///
    /// # Errors
    ///
    /// [`SpaceError::NotRigged`] without a rigged log;
    /// [`SpaceError::LeftoverReplayData`] when rigged COMM events remain.
    pub fn check_replay_data(&self) -> Result<(), SpaceError> {
        match self.replay.lock().as_ref() {
            None => Err(SpaceError::NotRigged),
            Some(rig) => {
                let count = rig.remaining();
                if count == 0 {
                    Ok(())
                } else {
                    Err(SpaceError::LeftoverReplayData { count })
                }
            }
        }
    }

    // ========================================================================
    // Read side
    // ========================================================================

    /// Returns the effective data on `channel`.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn get_data(&self, channel: &C) -> Result<Vec<Datum<A>>, SpaceError> {
        self.state.read().store.get_data(channel)
    }

    /// Returns the effective continuations waiting on `channels`.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn get_waiting_continuations(
        &self,
        channels: &[C],
    ) -> Result<Vec<WaitingContinuation<P, K>>, SpaceError> {
        self.state.read().store.get_continuations(channels)
    }

    /// Returns the join tuples `channel` participates in.
    ///
    /// # Errors
    ///
    /// Propagates history read failures.
    pub fn get_joins(&self, channel: &C) -> Result<Vec<Vec<C>>, SpaceError> {
        self.state.read().store.get_joins(channel)
    }

    /// Materializes the hot-store overlay as rows keyed by channel tuple.
    pub fn to_map(&self) -> BTreeMap<Vec<C>, StoreRow<P, A, K>> {
        self.state.read().store.to_map()
    }

    /// The history root this session currently overlays.
    pub fn current_root(&self) -> StateRoot {
        self.state.read().root
    }

    // ========================================================================
    // Live paths
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn live_consume(
        &self,
        store: &HotStore<C, P, A, K>,
        channels: Vec<C>,
        patterns: Vec<P>,
        continuation: K,
        persist: bool,
        peeks: BTreeSet<usize>,
        consume_event: ConsumeEvent,
    ) -> Result<Option<ConsumeResult<C, P, A, K>>, SpaceError> {
        let mut pools: HashMap<C, IndexedData<A>> = HashMap::new();
        for channel in &channels {
            if !pools.contains_key(channel) {
                pools.insert(channel.clone(), shuffled_pool(&store.get_data(channel)?, None));
            }
        }

        match extract_data_candidates(&self.matcher, &channels, &patterns, &mut pools)? {
            None => {
                self.journal
                    .lock()
                    .record(Event::Consume(consume_event.clone()));
                self.store_continuation(
                    store,
                    &channels,
                    patterns,
                    continuation,
                    persist,
                    peeks,
                    consume_event,
                )?;
                Ok(None)
            }
            Some(candidates) => {
                {
                    let mut journal = self.journal.lock();
                    for candidate in &candidates {
                        journal.bump(candidate.datum.source.reference);
                    }
                    let mut times_repeated = BTreeMap::new();
                    for candidate in &candidates {
                        times_repeated.insert(
                            candidate.datum.source.reference,
                            journal.count(&candidate.datum.source.reference),
                        );
                    }
                    journal.record(Event::Comm(CommEvent {
                        consume: consume_event.clone(),
                        produces: candidates
                            .iter()
                            .map(|candidate| candidate.datum.source.clone())
                            .collect(),
                        peeks: peeks.clone(),
                        times_repeated,
                    }));
                }
                if persist {
                    self.store_continuation(
                        store,
                        &channels,
                        patterns.clone(),
                        continuation.clone(),
                        persist,
                        peeks.clone(),
                        consume_event,
                    )?;
                }
                remove_matched_data(store, &candidates, &peeks)?;
                let rows = build_rows(&candidates, &peeks);
                Ok(Some((
                    ContResult {
                        continuation,
                        persistent: persist,
                        channels,
                        patterns,
                        peek: !peeks.is_empty(),
                    },
                    rows,
                )))
            }
        }
    }

    fn live_produce(
        &self,
        store: &HotStore<C, P, A, K>,
        channel: &C,
        data: A,
        persist: bool,
        produce_event: ProduceEvent,
    ) -> Result<Option<ProduceResult<C, P, A, K>>, SpaceError> {
        let fresh = Datum::new(data, persist, produce_event.clone());
        let joins = store.get_joins(channel)?;

        for join in &joins {
            let continuations = shuffled_with_index(&store.get_continuations(join)?);
            let mut pools: HashMap<C, IndexedData<A>> = HashMap::new();
            for sibling in join {
                if !pools.contains_key(sibling) {
                    let spliced = (sibling == channel).then(|| fresh.clone());
                    pools.insert(sibling.clone(), shuffled_pool(&store.get_data(sibling)?, spliced));
                }
            }
            if let Some(candidate) =
                extract_first_match(&self.matcher, join, &continuations, &pools)?
            {
                {
                    let mut journal = self.journal.lock();
                    for dc in &candidate.data_candidates {
                        if dc.index.is_some() {
                            journal.bump(dc.datum.source.reference);
                        }
                    }
                    let mut times_repeated = BTreeMap::new();
                    for dc in &candidate.data_candidates {
                        times_repeated.insert(
                            dc.datum.source.reference,
                            journal.count(&dc.datum.source.reference),
                        );
                    }
                    journal.record(Event::Comm(CommEvent {
                        consume: candidate.continuation.source.clone(),
                        produces: candidate
                            .data_candidates
                            .iter()
                            .map(|dc| dc.datum.source.clone())
                            .collect(),
                        peeks: candidate.continuation.peeks.clone(),
                        times_repeated,
                    }));
                }
                self.settle_produce(
                    store,
                    channel,
                    &fresh,
                    &candidate.channels,
                    &candidate.continuation,
                    candidate.continuation_index,
                    &candidate.data_candidates,
                )?;
                let rows = build_rows(&candidate.data_candidates, &candidate.continuation.peeks);
                let wc = candidate.continuation;
                return Ok(Some((
                    ContResult {
                        continuation: wc.continuation,
                        persistent: wc.persist,
                        channels: candidate.channels,
                        patterns: wc.patterns,
                        peek: !wc.peeks.is_empty(),
                    },
                    rows,
                )));
            }
        }

        self.journal.lock().record(Event::Produce(produce_event));
        store.put_datum(channel, fresh)?;
        Ok(None)
    }

    // ========================================================================
    // Replay paths
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn replay_consume(
        &self,
        rig: &mut ReplayIndex,
        store: &HotStore<C, P, A, K>,
        channels: Vec<C>,
        patterns: Vec<P>,
        continuation: K,
        persist: bool,
        peeks: BTreeSet<usize>,
        consume_event: ConsumeEvent,
    ) -> Result<Option<ConsumeResult<C, P, A, K>>, SpaceError> {
        let entries = rig.comms_for(&EventRef::Consume(consume_event.reference));
        if entries.is_empty() {
            let mut pools = self.ordered_pools(store, &channels, None)?;
            if extract_data_candidates(&self.matcher, &channels, &patterns, &mut pools)?.is_some() {
                return Err(SpaceError::ReplayDivergence(
                    "consume found a match the rigged log does not record".to_owned(),
                ));
            }
            self.store_continuation(
                store,
                &channels,
                patterns,
                continuation,
                persist,
                peeks,
                consume_event,
            )?;
            return Ok(None);
        }

        for comm in entries {
            if comm.peeks != peeks {
                continue;
            }
            if let Some(candidates) =
                self.extract_rigged(store, &channels, &patterns, &comm, None)?
            {
                {
                    let mut journal = self.journal.lock();
                    if !counters_agree(&journal, &candidates, &comm) {
                        continue;
                    }
                    for candidate in &candidates {
                        if candidate.index.is_some() {
                            journal.bump(candidate.datum.source.reference);
                        }
                    }
                }
                rig.remove(&comm);
                if persist {
                    self.store_continuation(
                        store,
                        &channels,
                        patterns.clone(),
                        continuation.clone(),
                        persist,
                        peeks.clone(),
                        consume_event,
                    )?;
                }
                remove_matched_data(store, &candidates, &peeks)?;
                let rows = build_rows(&candidates, &peeks);
                return Ok(Some((
                    ContResult {
                        continuation,
                        persistent: persist,
                        channels,
                        patterns,
                        peek: !peeks.is_empty(),
                    },
                    rows,
                )));
            }
        }

        self.store_continuation(
            store,
            &channels,
            patterns,
            continuation,
            persist,
            peeks,
            consume_event,
        )?;
        Ok(None)
    }

    fn replay_produce(
        &self,
        rig: &mut ReplayIndex,
        store: &HotStore<C, P, A, K>,
        channel: &C,
        data: A,
        persist: bool,
        produce_event: ProduceEvent,
    ) -> Result<Option<ProduceResult<C, P, A, K>>, SpaceError> {
        let fresh = Datum::new(data, persist, produce_event.clone());
        let joins = store.get_joins(channel)?;

        // First preference: reproduce a communication rigged under this
        // produce's own reference.
        let own = rig.comms_for(&EventRef::Produce(produce_event.reference));
        for comm in &own {
            if let Some(result) = self.try_rigged_produce(rig, store, comm, channel, &fresh, &joins)? {
                return Ok(Some(result));
            }
        }

        // No own communication was satisfiable. If the live matcher would
        // still commit, the communication must be rigged under some waiting
        // consume's reference (the producer's channel was resolved from a
        // stored structural twin in the recorded run); anything else is
        // divergence.
        let mut live_match = false;
        for join in &joins {
            let continuations: Vec<(usize, WaitingContinuation<P, K>)> = store
                .get_continuations(join)?
                .into_iter()
                .enumerate()
                .collect();
            let pools = self.ordered_pools(store, join, Some((channel, &fresh)))?;
            if extract_first_match(&self.matcher, join, &continuations, &pools)?.is_some() {
                live_match = true;
                break;
            }
        }
        if live_match {
            for join in &joins {
                for wc in store.get_continuations(join)? {
                    let by_consume = rig.comms_for(&EventRef::Consume(wc.source.reference));
                    for comm in &by_consume {
                        if let Some(result) =
                            self.try_rigged_produce(rig, store, comm, channel, &fresh, &joins)?
                        {
                            return Ok(Some(result));
                        }
                    }
                }
            }
            return Err(SpaceError::ReplayDivergence(
                "produce found a match the rigged log does not record".to_owned(),
            ));
        }

        store.put_datum(channel, fresh)?;
        Ok(None)
    }

    // Attempts to reproduce one rigged communication from a produce: locate
    // the recorded consume among the join's continuations, extract the
    // steered data assignment, and commit when the repeat counters agree.
    fn try_rigged_produce(
        &self,
        rig: &mut ReplayIndex,
        store: &HotStore<C, P, A, K>,
        comm: &CommEvent,
        channel: &C,
        fresh: &Datum<A>,
        joins: &[Vec<C>],
    ) -> Result<Option<ProduceResult<C, P, A, K>>, SpaceError> {
        for join in joins {
            let continuations = store.get_continuations(join)?;
            let Some(continuation_index) = continuations
                .iter()
                .position(|wc| wc.source == comm.consume)
            else {
                continue;
            };
            let wc = continuations[continuation_index].clone();
            let Some(candidates) =
                self.extract_rigged(store, join, &wc.patterns, comm, Some((channel, fresh)))?
            else {
                continue;
            };
            {
                let mut journal = self.journal.lock();
                if !counters_agree(&journal, &candidates, comm) {
                    continue;
                }
                for candidate in &candidates {
                    if candidate.index.is_some() {
                        journal.bump(candidate.datum.source.reference);
                    }
                }
            }
            rig.remove(comm);
            self.settle_produce(store, channel, fresh, join, &wc, continuation_index, &candidates)?;
            let rows = build_rows(&candidates, &wc.peeks);
            return Ok(Some((
                ContResult {
                    continuation: wc.continuation,
                    persistent: wc.persist,
                    channels: join.clone(),
                    patterns: wc.patterns,
                    peek: !wc.peeks.is_empty(),
                },
                rows,
            )));
        }
        Ok(None)
    }

    // ========================================================================
    // Shared internals
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn store_continuation(
        &self,
        store: &HotStore<C, P, A, K>,
        channels: &[C],
        patterns: Vec<P>,
        continuation: K,
        persist: bool,
        peeks: BTreeSet<usize>,
        source: ConsumeEvent,
    ) -> Result<(), SpaceError> {
        store.put_continuation(
            channels,
            WaitingContinuation {
                patterns,
                continuation,
                persist,
                peeks,
                source,
            },
        )?;
        for channel in distinct(channels) {
            store.put_join(channel, channels)?;
        }
        Ok(())
    }

    // Post-journal mutations of a produce-side commit. The fresh datum is
    // stored when persistent or peeked, or when the match resolved the
    // producer's channel from an already stored structural twin.
    #[allow(clippy::too_many_arguments)]
    fn settle_produce(
        &self,
        store: &HotStore<C, P, A, K>,
        channel: &C,
        fresh: &Datum<A>,
        channels: &[C],
        wc: &WaitingContinuation<P, K>,
        continuation_index: usize,
        candidates: &[ConsumeCandidate<C, A>],
    ) -> Result<(), SpaceError> {
        if !wc.persist {
            store.remove_continuation(channels, continuation_index)?;
        }
        for sibling in distinct(channels) {
            store.remove_join(sibling, channels)?;
        }
        remove_matched_data(store, candidates, &wc.peeks)?;
        match candidates.iter().find(|dc| dc.index.is_none()) {
            Some(dc) => {
                if fresh.persist || wc.peeks.contains(&dc.position) {
                    store.put_datum(channel, fresh.clone())?;
                }
            }
            None => store.put_datum(channel, fresh.clone())?,
        }
        Ok(())
    }

    fn install_binding(
        &self,
        store: &HotStore<C, P, A, K>,
        channels: &[C],
        patterns: &[P],
        continuation: &K,
    ) -> Result<(), SpaceError> {
        let reference = make_consume_ref(channels, patterns, continuation, true)?;
        let mut hashes = Vec::with_capacity(channels.len());
        for channel in channels {
            hashes.push(make_channel_hash(channel)?);
        }

        let mut pools = self.ordered_pools(store, channels, None)?;
        if extract_data_candidates(&self.matcher, channels, patterns, &mut pools)?.is_some() {
            return Err(SpaceError::InstallAfterStartup);
        }

        store.install_continuation(
            channels,
            WaitingContinuation {
                patterns: patterns.to_vec(),
                continuation: continuation.clone(),
                persist: true,
                peeks: BTreeSet::new(),
                source: ConsumeEvent {
                    channels: hashes,
                    reference,
                    persistent: true,
                },
            },
        );
        for channel in distinct(channels) {
            store.install_join(channel, channels);
        }
        Ok(())
    }

    fn restore_installs(&self, store: &HotStore<C, P, A, K>) -> Result<(), SpaceError> {
        let installs = self.installs.lock();
        for (channels, install) in installs.iter() {
            self.install_binding(store, channels, &install.patterns, &install.continuation)?;
        }
        Ok(())
    }

    fn ordered_pools(
        &self,
        store: &HotStore<C, P, A, K>,
        channels: &[C],
        fresh: Option<(&C, &Datum<A>)>,
    ) -> Result<HashMap<C, IndexedData<A>>, SpaceError> {
        let mut pools: HashMap<C, IndexedData<A>> = HashMap::new();
        for channel in channels {
            if pools.contains_key(channel) {
                continue;
            }
            let mut pool: IndexedData<A> = store
                .get_data(channel)?
                .into_iter()
                .enumerate()
                .map(|(index, datum)| (Some(index), datum))
                .collect();
            if let Some((fresh_channel, fresh_datum)) = fresh {
                if fresh_channel == channel {
                    pool.push((None, fresh_datum.clone()));
                }
            }
            pools.insert(channel.clone(), pool);
        }
        Ok(pools)
    }

    // Per-position steered extraction: position i must be satisfied by a
    // datum whose source equals the rigged COMM's produce at i, and the
    // matcher must still accept the pair.
    fn extract_rigged(
        &self,
        store: &HotStore<C, P, A, K>,
        channels: &[C],
        patterns: &[P],
        comm: &CommEvent,
        fresh: Option<(&C, &Datum<A>)>,
    ) -> Result<Option<Vec<ConsumeCandidate<C, A>>>, SpaceError> {
        if comm.produces.len() != channels.len() || patterns.len() != channels.len() {
            return Ok(None);
        }
        let mut pools = self.ordered_pools(store, channels, fresh)?;
        let mut found = Vec::with_capacity(channels.len());
        for (position, (channel, pattern)) in channels.iter().zip(patterns.iter()).enumerate() {
            let want = &comm.produces[position];
            let pool = pools
                .get_mut(channel)
                .ok_or(SpaceError::InternalCorruption("missing candidate pool"))?;

            let mut selected: Option<(usize, A)> = None;
            for (slot, (_, datum)) in pool.iter().enumerate() {
                if datum.source == *want {
                    if let Some(rewritten) = self.matcher.try_match(pattern, &datum.a)? {
                        selected = Some((slot, rewritten));
                        break;
                    }
                }
            }
            let Some((slot, rewritten)) = selected else {
                return Ok(None);
            };
            let (index, datum) = pool.remove(slot);
            found.push(ConsumeCandidate {
                channel: channel.clone(),
                position,
                datum,
                rewritten,
                index,
            });
        }
        Ok(Some(found))
    }
}

// Removes matched stored data in strictly descending index order, skipping
// persistent and peeked entries. The in-flight datum (index None) is never
// stored at this point and needs no removal.
fn remove_matched_data<C, P, A, K>(
    store: &HotStore<C, P, A, K>,
    candidates: &[ConsumeCandidate<C, A>],
    peeks: &BTreeSet<usize>,
) -> Result<(), SpaceError>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    K: ContinuationBound,
{
    let mut stored: Vec<&ConsumeCandidate<C, A>> = candidates
        .iter()
        .filter(|candidate| candidate.index.is_some())
        .collect();
    stored.sort_by(|a, b| b.index.cmp(&a.index));
    for candidate in stored {
        if candidate.datum.persist || peeks.contains(&candidate.position) {
            continue;
        }
        if let Some(index) = candidate.index {
            store.remove_datum(&candidate.channel, index)?;
        }
    }
    Ok(())
}

fn build_rows<C: Clone, A: Clone>(
    candidates: &[ConsumeCandidate<C, A>],
    peeks: &BTreeSet<usize>,
) -> Vec<RowResult<C, A>> {
    candidates
        .iter()
        .map(|candidate| RowResult {
            channel: candidate.channel.clone(),
            matched_datum: candidate.rewritten.clone(),
            removed: !candidate.datum.persist && !peeks.contains(&candidate.position),
            persistent: candidate.datum.persist,
        })
        .collect()
}

fn counters_agree<C, A>(
    journal: &Journal,
    candidates: &[ConsumeCandidate<C, A>],
    comm: &CommEvent,
) -> bool {
    let mut counts: BTreeMap<ProduceRef, u32> = BTreeMap::new();
    for candidate in candidates {
        let reference = candidate.datum.source.reference;
        counts
            .entry(reference)
            .or_insert_with(|| journal.count(&reference));
    }
    for candidate in candidates {
        if candidate.index.is_some() {
            if let Some(count) = counts.get_mut(&candidate.datum.source.reference) {
                *count += 1;
            }
        }
    }
    counts == comm.times_repeated
}

fn distinct<T: Eq + std::hash::Hash>(items: &[T]) -> Vec<&T> {
    let mut seen: HashSet<&T> = HashSet::new();
    items.iter().filter(|item| seen.insert(*item)).collect()
}
