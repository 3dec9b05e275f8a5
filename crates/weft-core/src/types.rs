// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Core data model: bound aliases, stored rows, and operation results.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::hash::Hash as StdHash;

use serde::Serialize;

use crate::event::{ConsumeEvent, Event, ProduceEvent};
use crate::hot_store::HotStoreSnapshot;
use crate::ident::{ProduceRef, StateRoot};

/// Bound alias for channel types.
///
/// Channels are opaque to the engine. Equality and ordering must agree with
/// the canonical encoding: two channels are the same channel iff their
/// encodings match.
pub trait ChannelBound:
    Clone + Eq + Ord + StdHash + Serialize + Send + Sync + 'static
{
}
impl<T> ChannelBound for T where T: Clone + Eq + Ord + StdHash + Serialize + Send + Sync + 'static {}

/// Bound alias for pattern types. Patterns are interpreted only by the
/// pluggable matcher; the engine never inspects them.
pub trait PatternBound: Clone + Serialize + Send + Sync + 'static {}
impl<T> PatternBound for T where T: Clone + Serialize + Send + Sync + 'static {}

/// Bound alias for datum payload types.
pub trait DataBound: Clone + Serialize + Send + Sync + 'static {}
impl<T> DataBound for T where T: Clone + Serialize + Send + Sync + 'static {}

/// Bound alias for continuation payload types.
pub trait ContinuationBound: Clone + Serialize + Send + Sync + 'static {}
impl<T> ContinuationBound for T where T: Clone + Serialize + Send + Sync + 'static {}

/// A produced payload stored on a channel.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct Datum<A> {
    /// The payload itself.
    pub a: A,
    /// Whether the datum survives a match.
    pub persist: bool,
    /// The produce event that created this datum.
    pub source: ProduceEvent,
}

impl<A> Datum<A> {
    /// Creates a datum from its payload, persistence flag, and source event.
    pub fn new(a: A, persist: bool, source: ProduceEvent) -> Self {
        Self { a, persist, source }
    }
}

/// A continuation awaiting data on a tuple of channels.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct WaitingContinuation<P, K> {
    /// One pattern per channel of the key, in key order.
    pub patterns: Vec<P>,
    /// The payload delivered on match.
    pub continuation: K,
    /// Whether the continuation survives a match.
    pub persist: bool,
    /// Channel positions whose matched datum must be retained on match.
    pub peeks: BTreeSet<usize>,
    /// The consume event that registered this continuation.
    pub source: ConsumeEvent,
}

/// The continuation half of a successful operation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ContResult<C, P, K> {
    /// The continuation payload handed back to the caller.
    pub continuation: K,
    /// Whether the matched continuation was persistent.
    pub persistent: bool,
    /// The channel tuple the continuation was registered on.
    pub channels: Vec<C>,
    /// The patterns the continuation was registered with.
    pub patterns: Vec<P>,
    /// True when the continuation was registered with a non-empty peek set.
    pub peek: bool,
}

/// One matched datum row of a successful operation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RowResult<C, A> {
    /// The channel this row's datum was matched on.
    pub channel: C,
    /// The datum delivered to the continuation, as rewritten by the matcher.
    pub matched_datum: A,
    /// True when the datum was consumed; false when peek semantics or
    /// persistence retained it.
    pub removed: bool,
    /// Whether the matched datum was persistent.
    pub persistent: bool,
}

/// Result of a successful `consume`: the continuation and one row per
/// channel of the consume's key.
pub type ConsumeResult<C, P, A, K> = (ContResult<C, P, K>, Vec<RowResult<C, A>>);

/// Result of a successful `produce`. Same shape as [`ConsumeResult`]: the
/// woken continuation and the full row tuple that satisfied it.
pub type ProduceResult<C, P, A, K> = (ContResult<C, P, K>, Vec<RowResult<C, A>>);

/// A pre-registered, always-persistent continuation re-applied on every reset.
#[derive(Clone, Debug)]
pub struct Install<P, K> {
    /// One pattern per channel of the install's key.
    pub patterns: Vec<P>,
    /// The continuation payload.
    pub continuation: K,
}

/// In-memory snapshot of a session: the hot-store overlay, the event log,
/// and the produce counter. Revertible within the process; never persisted.
#[derive(Clone, Debug)]
pub struct SoftCheckpoint<C, P, A, K> {
    /// Complete copy of the hot-store overlay at snapshot time.
    pub cache_snapshot: HotStoreSnapshot<C, P, A, K>,
    /// The event log drained from the session.
    pub log: Vec<Event>,
    /// The produce counter drained from the session.
    pub produce_counter: BTreeMap<ProduceRef, u32>,
}

/// A persisted checkpoint: the new history root and the event log that led
/// to it.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    /// Root of the newly persisted state.
    pub root: StateRoot,
    /// Event log of the session that produced the root.
    pub log: Vec<Event>,
}
