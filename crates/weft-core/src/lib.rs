// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! weft-core: typed concurrent tuplespace engine.
//!
//! A tuplespace is a content-addressed associative store: producers publish
//! typed data on channels, consumers register pattern tuples over channel
//! tuples together with a continuation, and whenever a data tuple satisfies
//! a registered pattern tuple the space atomically withdraws the matched
//! entries, records a communication event, and hands the continuation back.
//! The engine layers a transactional in-memory hot store over an immutable
//! history, supports persistent producers and consumers, peek semantics,
//! multi-channel joins, soft and hard checkpoints, and deterministic replay
//! of recorded event logs.
//!
//! # Protocol Determinism
//!
//! `weft-core` enforces strict determinism for all addressable artifacts
//! (channel hashes, structural event references, history roots).
//!
//! - **Canonical encoding:** deterministic CBOR via `ciborium`. Two values
//!   are the same entity iff their canonical encodings match.
//! - **Hashing:** Blake2b-256 with domain-separated prefixes; lock
//!   acquisition order is lexicographic over the digest.
//! - **Replay:** live match selection shuffles with a per-operation RNG;
//!   replay is steered by the rigged COMM multimap and uses no RNG at all.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod engine;
mod error;
mod event;
mod history;
mod hot_store;
mod ident;
mod key_lock;
mod matching;
mod replay;
mod telemetry;
mod types;

// Re-exports for stable public API
pub use engine::{SpaceBuilder, TupleSpace};
pub use error::SpaceError;
pub use event::{CommEvent, ConsumeEvent, Event, Journal, ProduceEvent};
pub use history::{HistoryReader, HistoryRepository, InMemoryHistory};
pub use hot_store::{HotStore, HotStoreSnapshot, StoreRow};
pub use ident::{
    canonical_bytes, make_channel_hash, make_consume_ref, make_produce_ref, ConsumeRef, Hash,
    KeyHash, ProduceRef, StateRoot,
};
pub use key_lock::KeyLocks;
pub use matching::Matcher;
pub use telemetry::{NullSpaceTelemetry, SpaceTelemetry};
pub use types::{
    ChannelBound, Checkpoint, ConsumeResult, ContResult, ContinuationBound, DataBound, Datum,
    Install, PatternBound, ProduceResult, RowResult, SoftCheckpoint, WaitingContinuation,
};
