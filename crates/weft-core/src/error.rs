// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error types emitted by the tuplespace.
use thiserror::Error;

use crate::ident::StateRoot;

/// Errors emitted by the engine, the hot store, the history repository, and
/// the replay machinery.
///
/// All errors are value-returned. An operation that fails commits nothing:
/// event-log appends and hot-store mutations happen only after the match for
/// that operation is final.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpaceError {
    /// `consume` or `install` was called with an empty channel tuple.
    #[error("channels must not be empty")]
    EmptyChannels,

    /// The channel and pattern tuples differ in length.
    #[error("channel/pattern arity mismatch: {channels} channels, {patterns} patterns")]
    ArityMismatch {
        /// Number of channels supplied.
        channels: usize,
        /// Number of patterns supplied.
        patterns: usize,
    },

    /// A peek index does not name a position in the channel tuple.
    #[error("peek index {index} out of range for {arity} channels")]
    InvalidPeek {
        /// The offending index.
        index: usize,
        /// The arity of the channel tuple.
        arity: usize,
    },

    /// The pluggable matcher reported a failure; the operation was aborted
    /// with no state change.
    #[error("matcher failure: {0}")]
    Matcher(String),

    /// The requested history root is not present in the repository.
    #[error("unknown history root: {0:?}")]
    UnknownRoot(StateRoot),

    /// A value could not be canonically encoded for hashing or persistence.
    #[error("canonical encoding failed: {0}")]
    Codec(String),

    /// `install` found matching data already present. Installs are a startup
    /// configuration mechanism; a match at install time is a permanent
    /// configuration error.
    #[error("installing can be done only on startup")]
    InstallAfterStartup,

    /// Replay produced a commit the rigged log does not contain.
    #[error("replay diverged: {0}")]
    ReplayDivergence(String),

    /// `check_replay_data` found rigged communication events that were never
    /// re-executed.
    #[error("leftover replay data: {count} unmatched communication events")]
    LeftoverReplayData {
        /// Number of rigged COMM entries that remain.
        count: usize,
    },

    /// A replay-only operation was invoked without a rigged log.
    #[error("no replay log rigged")]
    NotRigged,

    /// Internal invariant violated (engine state corruption).
    #[error("internal invariant violated: {0}")]
    InternalCorruption(&'static str),
}
