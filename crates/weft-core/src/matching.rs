// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pluggable matcher interface and the candidate extraction driver.
//!
//! The engine never inspects patterns. A [`Matcher`] decides per
//! (pattern, datum) pair whether the pair matches and may rewrite the datum
//! into the value delivered to the continuation. The driver turns per-pair
//! decisions into whole-tuple candidates:
//!
//! - consume side: one candidate per pattern, drawn from per-channel pools
//!   so a datum never satisfies two patterns of the same tuple;
//! - produce side: scan waiting continuations, first fully satisfiable one
//!   wins.
//!
//! Candidate pools are indexed. `Some(i)` is a stable store index scheduled
//! for removal on commit; `None` marks the datum produced by the current
//! call, which is consumed in place and never stored.
use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::error::SpaceError;
use crate::types::{ChannelBound, ContinuationBound, DataBound, Datum, PatternBound, WaitingContinuation};

/// Decides whether a pattern matches a datum.
///
/// Implementations must be purely functional: no side effects on the store,
/// and the same inputs always produce the same answer. A `Some` result
/// carries the datum as rewritten for delivery (commonly the datum itself).
pub trait Matcher<P, A>: Send + Sync {
    /// Returns the rewritten datum when `pattern` matches `datum`.
    ///
    /// # Errors
    ///
    /// A matcher failure aborts the surrounding operation with no state
    /// change.
    fn try_match(&self, pattern: &P, datum: &A) -> Result<Option<A>, SpaceError>;
}

/// Per-channel candidate pool: data with their stable store indices.
pub(crate) type IndexedData<A> = Vec<(Option<usize>, Datum<A>)>;

/// One selected datum of a consume-side match.
#[derive(Clone, Debug)]
pub(crate) struct ConsumeCandidate<C, A> {
    /// The channel the datum was selected on.
    pub channel: C,
    /// Position of that channel in the consume's channel tuple.
    pub position: usize,
    /// The stored datum as selected.
    pub datum: Datum<A>,
    /// The matcher's rewritten delivery value.
    pub rewritten: A,
    /// Stable store index, or `None` for the in-flight produced datum.
    pub index: Option<usize>,
}

/// A produce-side match: the continuation to wake and the full data tuple
/// that satisfies it.
#[derive(Clone, Debug)]
pub(crate) struct ProduceCandidate<C, P, A, K> {
    /// The join tuple the continuation is registered on.
    pub channels: Vec<C>,
    /// The matched continuation.
    pub continuation: WaitingContinuation<P, K>,
    /// Stable index of the continuation in the store view.
    pub continuation_index: usize,
    /// One selected datum per channel position.
    pub data_candidates: Vec<ConsumeCandidate<C, A>>,
}

/// Clones `items` into an `(original_index, item)` list in random order.
pub(crate) fn shuffled_with_index<T: Clone>(items: &[T]) -> Vec<(usize, T)> {
    let mut indexed: Vec<(usize, T)> = items.iter().cloned().enumerate().collect();
    indexed.shuffle(&mut thread_rng());
    indexed
}

/// Clones a datum list into a shuffled candidate pool with stable indices,
/// splicing in the producer's in-flight datum (index `None`) when given.
pub(crate) fn shuffled_pool<A: Clone>(data: &[Datum<A>], fresh: Option<Datum<A>>) -> IndexedData<A> {
    let mut pool: IndexedData<A> = data
        .iter()
        .enumerate()
        .map(|(index, datum)| (Some(index), datum.clone()))
        .collect();
    if let Some(datum) = fresh {
        pool.push((None, datum));
    }
    pool.shuffle(&mut thread_rng());
    pool
}

/// Attempts to select one datum per (channel, pattern) pair.
///
/// Patterns are processed in input order; for each, the first matching entry
/// of the channel's pool wins and is withdrawn from the pool, so a repeated
/// channel draws distinct data for its patterns. Any pattern without a match
/// aborts the whole tuple.
///
/// # Errors
///
/// Propagates matcher failures; reports corruption when a stored
/// continuation's arity disagrees with its key.
pub(crate) fn extract_data_candidates<C, P, A, M>(
    matcher: &M,
    channels: &[C],
    patterns: &[P],
    pools: &mut HashMap<C, IndexedData<A>>,
) -> Result<Option<Vec<ConsumeCandidate<C, A>>>, SpaceError>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    M: Matcher<P, A>,
{
    if channels.len() != patterns.len() {
        return Err(SpaceError::InternalCorruption(
            "stored continuation arity disagrees with its key",
        ));
    }

    let mut found: Vec<ConsumeCandidate<C, A>> = Vec::with_capacity(channels.len());
    for (position, (channel, pattern)) in channels.iter().zip(patterns.iter()).enumerate() {
        let pool = pools
            .get_mut(channel)
            .ok_or(SpaceError::InternalCorruption("missing candidate pool"))?;

        let mut selected: Option<(usize, A)> = None;
        for (slot, (_, datum)) in pool.iter().enumerate() {
            if let Some(rewritten) = matcher.try_match(pattern, &datum.a)? {
                selected = Some((slot, rewritten));
                break;
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

/// Scans waiting continuations in the given order and returns the first one
/// whose patterns are fully satisfiable from `pools`.
///
/// Each attempt works on a fresh copy of the pools, so a failed continuation
/// does not starve later ones of candidates.
///
/// # Errors
///
/// Propagates matcher failures and pool corruption.
pub(crate) fn extract_first_match<C, P, A, K, M>(
    matcher: &M,
    channels: &[C],
    continuations: &[(usize, WaitingContinuation<P, K>)],
    pools: &HashMap<C, IndexedData<A>>,
) -> Result<Option<ProduceCandidate<C, P, A, K>>, SpaceError>
where
    C: ChannelBound,
    P: PatternBound,
    A: DataBound,
    K: ContinuationBound,
    M: Matcher<P, A>,
{
    for (index, continuation) in continuations {
        let mut working = pools.clone();
        if let Some(data_candidates) =
            extract_data_candidates(matcher, channels, &continuation.patterns, &mut working)?
        {
            return Ok(Some(ProduceCandidate {
                channels: channels.to_vec(),
                continuation: continuation.clone(),
                continuation_index: *index,
                data_candidates,
            }));
        }
    }
    Ok(None)
}
