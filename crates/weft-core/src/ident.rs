// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier and stable hashing utilities.
//!
//! Every addressable entity in the tuplespace (channels, produce and consume
//! references, history roots) is named by a 256-bit Blake2b digest over a
//! canonical byte encoding. The encoding is deterministic CBOR, so two values
//! hash identically iff their canonical encodings match, independent of
//! in-memory ordering or the process that produced them.
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::error::SpaceError;

/// Canonical 256-bit digest used throughout the engine for addressing
/// channels, structural event references, and history roots.
pub type Hash = [u8; 32];

type Blake2b256 = Blake2b<U32>;

/// Stable hash of a channel's canonical encoding.
///
/// `KeyHash` is the unit of lock granularity and the storage index for a
/// channel. Ordering is lexicographic over the 32 raw bytes; the lock manager
/// acquires keys in exactly this order.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct KeyHash(pub Hash);

impl KeyHash {
    /// Returns the canonical byte representation of this hash.
    #[must_use]
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

/// Identifier of a persisted history root.
///
/// A `StateRoot` addresses one committed, immutable state in the history
/// repository. The engine overlays its hot store on the state named by the
/// current root and swaps roots on `reset` and `create_checkpoint`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct StateRoot(pub Hash);

impl StateRoot {
    /// Returns the canonical byte representation of this root.
    #[must_use]
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

/// Structural reference to a produce: `Blake2b-256("produce:" || channel || data || persist)`.
///
/// References are structural, not identity-based, so a replay in another
/// process or atop a rebuilt store resolves the same produce to the same
/// reference.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ProduceRef(pub Hash);

impl ProduceRef {
    /// Returns the canonical byte representation of this reference.
    #[must_use]
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

/// Structural reference to a consume: `Blake2b-256("consume:" || channels || patterns || k || persist)`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ConsumeRef(pub Hash);

impl ConsumeRef {
    /// Returns the canonical byte representation of this reference.
    #[must_use]
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

/// Serializes `value` into its canonical byte encoding (deterministic CBOR).
///
/// # Errors
///
/// Returns [`SpaceError::Codec`] when the value cannot be encoded.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SpaceError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| SpaceError::Codec(format!("{e:?}")))?;
    Ok(out)
}

fn hash_with_domain(domain: &[u8], parts: &[&[u8]]) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Produces the stable, domain-separated hash (prefix `b"chan:"`) of a channel.
///
/// # Errors
///
/// Returns [`SpaceError::Codec`] when the channel cannot be canonically encoded.
pub fn make_channel_hash<C: Serialize>(channel: &C) -> Result<KeyHash, SpaceError> {
    let bytes = canonical_bytes(channel)?;
    Ok(KeyHash(hash_with_domain(b"chan:", &[&bytes])))
}

/// Produces the structural reference (prefix `b"produce:"`) of a produce.
///
/// # Errors
///
/// Returns [`SpaceError::Codec`] when an argument cannot be canonically encoded.
pub fn make_produce_ref<C: Serialize, A: Serialize>(
    channel: &C,
    data: &A,
    persist: bool,
) -> Result<ProduceRef, SpaceError> {
    let channel_bytes = canonical_bytes(channel)?;
    let data_bytes = canonical_bytes(data)?;
    let persist_byte = [u8::from(persist)];
    Ok(ProduceRef(hash_with_domain(
        b"produce:",
        &[&channel_bytes, &data_bytes, &persist_byte],
    )))
}

/// Produces the structural reference (prefix `b"consume:"`) of a consume.
///
/// # Errors
///
/// Returns [`SpaceError::Codec`] when an argument cannot be canonically encoded.
pub fn make_consume_ref<C: Serialize, P: Serialize, K: Serialize>(
    channels: &[C],
    patterns: &[P],
    continuation: &K,
    persist: bool,
) -> Result<ConsumeRef, SpaceError> {
    let channel_bytes = canonical_bytes(channels)?;
    let pattern_bytes = canonical_bytes(patterns)?;
    let continuation_bytes = canonical_bytes(continuation)?;
    let persist_byte = [u8::from(persist)];
    Ok(ConsumeRef(hash_with_domain(
        b"consume:",
        &[
            &channel_bytes,
            &pattern_bytes,
            &continuation_bytes,
            &persist_byte,
        ],
    )))
}

/// Produces the root digest (prefix `b"root:"`) of a canonically encoded
/// persisted state.
pub(crate) fn make_root_hash(state_bytes: &[u8]) -> StateRoot {
    StateRoot(hash_with_domain(b"root:", &[state_bytes]))
}
