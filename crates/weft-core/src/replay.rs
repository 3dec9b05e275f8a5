// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Replay rig: the index that steers deterministic re-execution.
//!
//! Rigging a recorded event log builds a multimap from every produce and
//! consume reference to the COMM events it participated in. During replay
//! the engine commits a communication only when it reproduces one of the
//! rigged entries exactly (same consume, same produce per position, same
//! repeat counts), removing the entry as it goes. Whatever remains after the
//! session is divergence.
use std::collections::HashMap;

use crate::event::{CommEvent, Event};
use crate::ident::{ConsumeRef, ProduceRef};

/// Reference of a logged operation, used as the rig lookup key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum EventRef {
    /// A produce reference.
    Produce(ProduceRef),
    /// A consume reference.
    Consume(ConsumeRef),
}

fn participant_refs(comm: &CommEvent) -> Vec<EventRef> {
    let mut refs = vec![EventRef::Consume(comm.consume.reference)];
    for produce in &comm.produces {
        let reference = EventRef::Produce(produce.reference);
        if !refs.contains(&reference) {
            refs.push(reference);
        }
    }
    refs
}

/// Multimap from operation references to the rigged COMM events they must
/// reproduce.
#[derive(Debug, Default)]
pub(crate) struct ReplayIndex {
    entries: HashMap<EventRef, Vec<CommEvent>>,
}

impl ReplayIndex {
    /// Builds the rig from a recorded log. Only COMM entries steer replay;
    /// plain produce and consume entries re-derive from re-execution.
    pub(crate) fn from_log(log: &[Event]) -> Self {
        let mut index = Self::default();
        for event in log {
            if let Event::Comm(comm) = event {
                for reference in participant_refs(comm) {
                    index.entries.entry(reference).or_default().push(comm.clone());
                }
            }
        }
        index
    }

    /// Returns the rigged COMM events for `reference`, oldest first.
    pub(crate) fn comms_for(&self, reference: &EventRef) -> Vec<CommEvent> {
        self.entries.get(reference).cloned().unwrap_or_default()
    }

    /// Removes one occurrence of `comm` from every participating reference.
    pub(crate) fn remove(&mut self, comm: &CommEvent) {
        for reference in participant_refs(comm) {
            if let Some(list) = self.entries.get_mut(&reference) {
                if let Some(position) = list.iter().position(|entry| entry == comm) {
                    list.remove(position);
                }
                if list.is_empty() {
                    self.entries.remove(&reference);
                }
            }
        }
    }

    /// Number of rigged communications that have not been reproduced yet.
    ///
    /// Every COMM is indexed under exactly one consume reference, so the
    /// count sums over those entries only.
    pub(crate) fn remaining(&self) -> usize {
        self.entries
            .iter()
            .filter(|(reference, _)| matches!(reference, EventRef::Consume(_)))
            .map(|(_, comms)| comms.len())
            .sum()
    }
}
