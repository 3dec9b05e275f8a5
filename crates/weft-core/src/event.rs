// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Logical events and the per-session journal.
//!
//! The journal is the session's ordered record of `Produce`, `Consume`, and
//! `Comm` events together with the produce repeat counter. Both live behind a
//! single mutex in the engine so that soft-checkpoint drains are atomic with
//! respect to in-flight operations.
//!
//! Events carry structural references only (stable hashes), never payloads:
//! a recorded log is meaningful across processes and across store rebuilds.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ident::{ConsumeRef, KeyHash, ProduceRef};

/// Record of one `produce` call.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ProduceEvent {
    /// Stable hash of the channel the datum was published on.
    pub channel: KeyHash,
    /// Structural reference of the produce.
    pub reference: ProduceRef,
    /// Whether the datum survives a match.
    pub persistent: bool,
}

/// Record of one `consume` call.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ConsumeEvent {
    /// Stable hashes of the channel tuple, in call order.
    pub channels: Vec<KeyHash>,
    /// Structural reference of the consume.
    pub reference: ConsumeRef,
    /// Whether the continuation survives a match.
    pub persistent: bool,
}

/// Record of one communication: a consume matched against a tuple of
/// produces, with the peeked positions and the repeat counters of every
/// matched produce at commit time.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CommEvent {
    /// The matched consume.
    pub consume: ConsumeEvent,
    /// The matched produces, one per channel position of the consume.
    pub produces: Vec<ProduceEvent>,
    /// Channel positions whose datum was retained by peek semantics.
    pub peeks: BTreeSet<usize>,
    /// Repeat counter of each matched produce at the time of this commit.
    ///
    /// Replay uses these counts to disambiguate structurally identical
    /// produces issued more than once in a session.
    pub times_repeated: BTreeMap<ProduceRef, u32>,
}

/// One entry of the session event log.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Event {
    /// A communication committed by `produce` or `consume`.
    Comm(CommEvent),
    /// A `produce` that stored its datum without matching.
    Produce(ProduceEvent),
    /// A `consume` that stored its continuation without matching.
    Consume(ConsumeEvent),
}

/// Session journal: the ordered event log plus the produce repeat counter.
///
/// `produce_counter[p]` equals the number of COMM events in which `p` was
/// matched since the journal was last drained (reset or soft checkpoint).
/// `create_checkpoint` drains the log but deliberately leaves the counter in
/// place; only soft operations and reset clear it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Journal {
    /// Ordered logical events of the current session, oldest first.
    pub log: Vec<Event>,
    /// Per-produce COMM participation counts since the last drain.
    pub produce_counter: BTreeMap<ProduceRef, u32>,
}

impl Journal {
    /// Appends an event to the log.
    pub fn record(&mut self, event: Event) {
        self.log.push(event);
    }

    /// Increments the repeat counter for `reference` and returns the new count.
    pub fn bump(&mut self, reference: ProduceRef) -> u32 {
        let count = self.produce_counter.entry(reference).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the current repeat count for `reference` (zero when absent).
    #[must_use]
    pub fn count(&self, reference: &ProduceRef) -> u32 {
        self.produce_counter.get(reference).copied().unwrap_or(0)
    }

    /// Removes and returns the event log, leaving the counter untouched.
    pub fn drain_log(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.log)
    }

    /// Removes and returns both the event log and the counter.
    pub fn drain(&mut self) -> (Vec<Event>, BTreeMap<ProduceRef, u32>) {
        (
            std::mem::take(&mut self.log),
            std::mem::take(&mut self.produce_counter),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(byte: u8) -> ProduceRef {
        ProduceRef([byte; 32])
    }

    #[test]
    fn bump_counts_from_zero() {
        let mut journal = Journal::default();
        assert_eq!(journal.count(&reference(1)), 0);
        assert_eq!(journal.bump(reference(1)), 1);
        assert_eq!(journal.bump(reference(1)), 2);
        assert_eq!(journal.count(&reference(1)), 2);
    }

    #[test]
    fn drain_log_preserves_counter() {
        let mut journal = Journal::default();
        journal.bump(reference(1));
        journal.record(Event::Produce(ProduceEvent {
            channel: crate::ident::KeyHash([0u8; 32]),
            reference: reference(1),
            persistent: false,
        }));

        let log = journal.drain_log();
        assert_eq!(log.len(), 1);
        assert!(journal.log.is_empty());
        assert_eq!(journal.count(&reference(1)), 1);
    }

    #[test]
    fn drain_clears_both_slots() {
        let mut journal = Journal::default();
        journal.bump(reference(2));
        journal.record(Event::Consume(ConsumeEvent {
            channels: vec![crate::ident::KeyHash([0u8; 32])],
            reference: crate::ident::ConsumeRef([2u8; 32]),
            persistent: true,
        }));

        let (log, counter) = journal.drain();
        assert_eq!(log.len(), 1);
        assert_eq!(counter.len(), 1);
        assert!(journal.log.is_empty());
        assert!(journal.produce_counter.is_empty());
    }
}
