// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Two-step per-hash lock manager.
//!
//! Every engine operation serializes on the stable hashes of the channels it
//! touches. A consume knows its full key set up front; a produce knows only
//! its own channel and must discover the join-induced siblings after that
//! channel is already held (the sibling set is data-dependent). The manager
//! therefore supports a two-phase acquisition: phase A takes an initial set,
//! a discovery callback runs under mutual exclusion, and phase B extends the
//! held set to the union.
//!
//! Deadlock avoidance: keys are ordered lexicographically over the digest.
//! Blocking acquisition only ever happens in ascending order from an empty
//! held set, or on keys strictly above everything currently held. When an
//! extension would need a key below the held maximum, the new keys are taken
//! with try-acquisition; on failure everything is released and the full
//! union is re-acquired in ascending order, after which discovery re-runs
//! (the join data may have changed while nothing was held). A blocked thread
//! thus always waits on a key greater than every key it holds, which
//! excludes wait cycles.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::SpaceError;
use crate::ident::KeyHash;

// One logical mutex per key, created lazily. A slot outlives its map entry:
// waiters hold an `Arc` and are notified through it even if the manager map
// was pruned in between (pruning only happens while the session is quiesced).
struct KeySlot {
    busy: Mutex<bool>,
    available: Condvar,
}

impl KeySlot {
    fn new() -> Self {
        Self {
            busy: Mutex::new(false),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.available.wait(&mut busy);
        }
        *busy = true;
    }

    fn try_acquire(&self) -> bool {
        let mut busy = self.busy.lock();
        if *busy {
            false
        } else {
            *busy = true;
            true
        }
    }

    fn release(&self) {
        let mut busy = self.busy.lock();
        *busy = false;
        drop(busy);
        self.available.notify_one();
    }

    fn is_busy(&self) -> bool {
        *self.busy.lock()
    }
}

/// Lock manager over stable channel hashes.
pub struct KeyLocks {
    slots: Mutex<HashMap<KeyHash, Arc<KeySlot>>>,
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyLocks {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: KeyHash) -> Arc<KeySlot> {
        self.slots
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(KeySlot::new()))
            .clone()
    }

    /// Runs `body` while holding every key in `keys`, acquired in ascending
    /// order.
    pub fn with_keys<T>(&self, keys: &BTreeSet<KeyHash>, body: impl FnOnce() -> T) -> T {
        let held = HeldKeys::acquire(self, keys);
        let out = body();
        drop(held);
        out
    }

    /// Two-phase acquisition: holds `initial`, runs `discover` under mutual
    /// exclusion to learn the data-dependent extra keys, extends the held
    /// set to the union, then runs `body` while holding everything.
    ///
    /// `discover` may run more than once: whenever extension required a full
    /// release and re-acquisition, the discovered set is recomputed and
    /// re-validated against the held set before `body` runs.
    ///
    /// # Errors
    ///
    /// Propagates errors from `discover` and `body`; the held set is
    /// released in every case.
    pub fn with_expansion<T, F, G>(
        &self,
        initial: &BTreeSet<KeyHash>,
        mut discover: F,
        body: G,
    ) -> Result<T, SpaceError>
    where
        F: FnMut() -> Result<BTreeSet<KeyHash>, SpaceError>,
        G: FnOnce() -> Result<T, SpaceError>,
    {
        let mut body = Some(body);
        let mut held = HeldKeys::acquire(self, initial);
        loop {
            let extra = discover()?;
            let mut union = initial.clone();
            union.extend(extra);
            if held.covers(&union) || held.extend_to(&union) {
                let Some(run) = body.take() else {
                    return Err(SpaceError::InternalCorruption("expansion body ran twice"));
                };
                return run();
            }
            // Everything was released and the union re-acquired from
            // scratch; the discovery inputs may have changed meanwhile.
        }
    }

    /// Discards slots that are not currently held.
    ///
    /// Callers must quiesce the session first (no operation in flight);
    /// the engine runs this from `reset`, which excludes all operations.
    pub fn clean_up(&self) {
        self.slots.lock().retain(|_, slot| slot.is_busy());
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}

// The set of keys an operation currently holds. Releases everything on drop.
struct HeldKeys<'a> {
    locks: &'a KeyLocks,
    held: BTreeMap<KeyHash, Arc<KeySlot>>,
}

impl<'a> HeldKeys<'a> {
    fn acquire(locks: &'a KeyLocks, keys: &BTreeSet<KeyHash>) -> Self {
        let mut held = BTreeMap::new();
        for key in keys {
            let slot = locks.slot(*key);
            slot.acquire();
            held.insert(*key, slot);
        }
        Self { locks, held }
    }

    fn covers(&self, keys: &BTreeSet<KeyHash>) -> bool {
        keys.iter().all(|key| self.held.contains_key(key))
    }

    // Grows the held set to `target`. Returns true when the extension kept
    // every previously held key; returns false when it had to release
    // everything and re-acquire `target` from scratch (callers must then
    // re-validate whatever they read under the old held set).
    fn extend_to(&mut self, target: &BTreeSet<KeyHash>) -> bool {
        let new_keys: Vec<KeyHash> = target
            .iter()
            .filter(|key| !self.held.contains_key(*key))
            .copied()
            .collect();
        let max_held = self.held.keys().next_back().copied();

        let ascending_only = match max_held {
            Some(max) => new_keys.iter().all(|key| *key > max),
            None => true,
        };

        if ascending_only {
            for key in new_keys {
                let slot = self.locks.slot(key);
                slot.acquire();
                self.held.insert(key, slot);
            }
            return true;
        }

        // Out-of-order extension: never block below the held maximum.
        let mut acquired: Vec<(KeyHash, Arc<KeySlot>)> = Vec::new();
        for key in &new_keys {
            let slot = self.locks.slot(*key);
            if slot.try_acquire() {
                acquired.push((*key, slot));
            } else {
                for (_, taken) in acquired {
                    taken.release();
                }
                self.release_all();
                for key in target {
                    let slot = self.locks.slot(*key);
                    slot.acquire();
                    self.held.insert(*key, slot);
                }
                return false;
            }
        }
        for (key, slot) in acquired {
            self.held.insert(key, slot);
        }
        true
    }

    fn release_all(&mut self) {
        for slot in self.held.values() {
            slot.release();
        }
        self.held.clear();
    }
}

impl Drop for HeldKeys<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}
