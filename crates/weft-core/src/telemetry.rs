// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Telemetry sink trait for observability without coupling to I/O.
//!
//! The engine emits operation counters and timings through this trait and
//! lets adapters decide what to do with them (logging, metrics transport,
//! nothing). The `source` argument is the metrics label prefix configured at
//! construction; adapters typically emit `{source}.comm.produce`,
//! `{source}.comm.consume`, the matching `-time` timers, `{source}.reset`,
//! and `{source}.revert-soft-checkpoint` from these callbacks.
//!
//! All methods have default no-op implementations, so adapters implement
//! only the events they care about.
use std::time::Duration;

/// Telemetry sink for observing engine operations.
pub trait SpaceTelemetry: Send + Sync {
    /// Called after every `produce` with whether it committed a
    /// communication and how long the operation took.
    fn on_produce(&self, _source: &str, _matched: bool, _elapsed: Duration) {}

    /// Called after every `consume` with whether it committed a
    /// communication and how long the operation took.
    fn on_consume(&self, _source: &str, _matched: bool, _elapsed: Duration) {}

    /// Called after every successful `install`.
    fn on_install(&self, _source: &str) {}

    /// Called after every `reset` (including `clear`).
    fn on_reset(&self, _source: &str) {}

    /// Called after every `revert_to_soft_checkpoint`.
    fn on_revert_soft_checkpoint(&self, _source: &str) {}
}

/// A no-op telemetry sink that discards all events.
///
/// This is the default when no telemetry is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSpaceTelemetry;

impl SpaceTelemetry for NullSpaceTelemetry {}
