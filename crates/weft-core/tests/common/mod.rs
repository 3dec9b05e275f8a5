// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared fixtures: an integer tuplespace over string channels with a
//! wildcard-or-equality matcher.
#![allow(dead_code)]

use std::collections::BTreeSet;

use serde::Serialize;
use weft_core::{InMemoryHistory, Matcher, SpaceError, TupleSpace};

/// Test pattern language: match anything, or match one exact value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Pat {
    /// Matches every datum.
    Wild,
    /// Matches exactly this value.
    Eq(i32),
}

/// Matcher for [`Pat`] over `i32` data. Delivers the datum unchanged.
pub struct IntMatch;

impl Matcher<Pat, i32> for IntMatch {
    fn try_match(&self, pattern: &Pat, datum: &i32) -> Result<Option<i32>, SpaceError> {
        match pattern {
            Pat::Wild => Ok(Some(*datum)),
            Pat::Eq(value) if value == datum => Ok(Some(*datum)),
            Pat::Eq(_) => Ok(None),
        }
    }
}

/// The space type every integration test drives.
pub type Space =
    TupleSpace<String, Pat, i32, String, InMemoryHistory<String, Pat, i32, String>, IntMatch>;

/// Builds a fresh space over an empty in-memory history.
pub fn new_space() -> Space {
    let history = InMemoryHistory::new().expect("empty state must encode");
    TupleSpace::builder(history, IntMatch)
        .source("test.space")
        .build()
        .expect("engine must build over the empty root")
}

/// Owned channel vector from string literals.
pub fn chans(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_owned()).collect()
}

/// Peek set from positions.
pub fn peeks(positions: &[usize]) -> BTreeSet<usize> {
    positions.iter().copied().collect()
}

/// The empty peek set.
pub fn no_peeks() -> BTreeSet<usize> {
    BTreeSet::new()
}
