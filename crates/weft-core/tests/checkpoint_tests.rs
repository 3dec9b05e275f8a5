// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Checkpoint semantics: soft round-trips, hard commits, reset idempotence,
//! and the produce-counter drain rules.

mod common;
use common::{chans, new_space, no_peeks, Pat};

use weft_core::{make_produce_ref, Event};

#[test]
fn soft_checkpoint_round_trip_restores_everything() {
    let space = new_space();

    assert!(space.produce("a".to_owned(), 1, false).expect("produce").is_none());
    assert!(space
        .consume(chans(&["b"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .is_none());

    let saved = space.create_soft_checkpoint();
    assert_eq!(saved.log.len(), 2, "one produce and one consume recorded");

    // Diverge: consume the datum, fire the continuation, produce more.
    space
        .consume(chans(&["a"]), vec![Pat::Wild], "k2".to_owned(), false, no_peeks())
        .expect("consume")
        .expect("matches the stored datum");
    space
        .produce("b".to_owned(), 9, false)
        .expect("produce")
        .expect("fires the waiting continuation");
    assert!(space.produce("c".to_owned(), 3, false).expect("produce").is_none());

    space
        .revert_to_soft_checkpoint(saved.clone())
        .expect("revert");

    // The overlay, log, and counter are back byte for byte.
    let data = space.get_data(&"a".to_owned()).expect("read");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].a, 1);
    assert_eq!(
        space
            .get_waiting_continuations(&chans(&["b"]))
            .expect("read")
            .len(),
        1
    );
    assert!(space.get_data(&"c".to_owned()).expect("read").is_empty());

    let again = space.create_soft_checkpoint();
    assert_eq!(again.log, saved.log);
    assert_eq!(again.produce_counter, saved.produce_counter);
    assert_eq!(again.cache_snapshot.data, saved.cache_snapshot.data);
    assert_eq!(
        again.cache_snapshot.continuations,
        saved.cache_snapshot.continuations
    );
    assert_eq!(again.cache_snapshot.joins, saved.cache_snapshot.joins);
}

#[test]
fn soft_checkpoint_drains_the_session_log() {
    let space = new_space();
    assert!(space.produce("a".to_owned(), 1, false).expect("produce").is_none());

    let first = space.create_soft_checkpoint();
    assert_eq!(first.log.len(), 1);

    let second = space.create_soft_checkpoint();
    assert!(second.log.is_empty());
    assert!(second.produce_counter.is_empty());
}

#[test]
fn checkpoint_commits_the_overlay_and_reads_through() {
    let space = new_space();

    assert!(space.produce("a".to_owned(), 5, false).expect("produce").is_none());
    let checkpoint = space.create_checkpoint().expect("checkpoint");
    assert!(matches!(checkpoint.log[0], Event::Produce(_)));

    // The fresh hot store reads the datum through the new root.
    let data = space.get_data(&"a".to_owned()).expect("read");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].a, 5);

    // Consume it, then come back to the committed root.
    space
        .consume(chans(&["a"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .expect("match");
    assert!(space.get_data(&"a".to_owned()).expect("read").is_empty());

    space.reset(checkpoint.root).expect("reset");
    assert_eq!(space.get_data(&"a".to_owned()).expect("read").len(), 1);
}

#[test]
fn waiting_continuations_and_joins_are_committed_too() {
    let space = new_space();

    assert!(space
        .consume(
            chans(&["a", "b"]),
            vec![Pat::Wild, Pat::Wild],
            "k".to_owned(),
            false,
            no_peeks(),
        )
        .expect("consume")
        .is_none());

    let checkpoint = space.create_checkpoint().expect("checkpoint");
    space.reset(checkpoint.root).expect("reset");

    assert_eq!(
        space
            .get_waiting_continuations(&chans(&["a", "b"]))
            .expect("read")
            .len(),
        1
    );
    assert_eq!(
        space.get_joins(&"a".to_owned()).expect("read"),
        vec![chans(&["a", "b"])]
    );

    // The committed continuation still fires.
    assert!(space.produce("a".to_owned(), 1, false).expect("produce").is_none());
    assert!(space.produce("b".to_owned(), 2, false).expect("produce").expect("match").1.len() == 2);
}

#[test]
fn identical_sessions_commit_identical_roots() {
    let left = new_space();
    let right = new_space();
    for space in [&left, &right] {
        assert!(space.produce("a".to_owned(), 1, true).expect("produce").is_none());
        assert!(space
            .consume(chans(&["b"]), vec![Pat::Eq(2)], "k".to_owned(), false, no_peeks())
            .expect("consume")
            .is_none());
    }
    assert_eq!(
        left.create_checkpoint().expect("checkpoint").root,
        right.create_checkpoint().expect("checkpoint").root
    );
}

#[test]
fn reset_is_idempotent() {
    let space = new_space();

    assert!(space.produce("a".to_owned(), 1, false).expect("produce").is_none());
    let checkpoint = space.create_checkpoint().expect("checkpoint");

    assert!(space.produce("b".to_owned(), 2, false).expect("produce").is_none());
    space.reset(checkpoint.root).expect("first reset");
    let first = space.to_map();
    space.reset(checkpoint.root).expect("second reset");
    let second = space.to_map();

    assert_eq!(first.len(), second.len());
    assert!(space.get_data(&"b".to_owned()).expect("read").is_empty());
    assert_eq!(space.get_data(&"a".to_owned()).expect("read").len(), 1);
}

#[test]
fn clear_is_idempotent() {
    let space = new_space();

    assert!(space.produce("a".to_owned(), 1, false).expect("produce").is_none());
    space.clear().expect("clear");
    let root_after_first = space.current_root();
    space.clear().expect("clear again");

    assert_eq!(space.current_root(), root_after_first);
    assert!(space.get_data(&"a".to_owned()).expect("read").is_empty());
    assert!(space.create_soft_checkpoint().log.is_empty());
}

#[test]
fn produce_counter_survives_hard_checkpoints_only() {
    let space = new_space();

    let reference = make_produce_ref(&"c".to_owned(), &7, true).expect("ref");

    assert!(space.produce("c".to_owned(), 7, true).expect("produce").is_none());
    space
        .consume(chans(&["c"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .expect("first match");

    space.create_checkpoint().expect("checkpoint");

    space
        .consume(chans(&["c"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .expect("second match, against the committed persistent datum");

    let soft = space.create_soft_checkpoint();
    assert_eq!(
        soft.produce_counter.get(&reference).copied(),
        Some(2),
        "the counter accumulated across the hard checkpoint"
    );

    // Soft operations drain it.
    space
        .consume(chans(&["c"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .expect("third match");
    let after_drain = space.create_soft_checkpoint();
    assert_eq!(after_drain.produce_counter.get(&reference).copied(), Some(1));
}
