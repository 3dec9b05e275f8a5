// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Replay: rigged re-execution, divergence detection, leftover accounting.

mod common;
use common::{chans, new_space, no_peeks, peeks, Pat};

use weft_core::{Event, SpaceError};

#[test]
fn a_recorded_session_replays_to_the_same_root() {
    let space = new_space();

    // Record: a two-channel join completed by two produces.
    assert!(space
        .consume(
            chans(&["c1", "c2"]),
            vec![Pat::Wild, Pat::Wild],
            "k".to_owned(),
            false,
            no_peeks(),
        )
        .expect("consume")
        .is_none());
    assert!(space.produce("c1".to_owned(), 1, false).expect("produce").is_none());
    assert!(space
        .produce("c2".to_owned(), 2, false)
        .expect("produce")
        .is_some());
    // A persistent bystander so the committed root is non-trivial.
    assert!(space.produce("c3".to_owned(), 7, true).expect("produce").is_none());

    let recorded = space.create_checkpoint().expect("checkpoint");

    // Replay the same calls against a clean space.
    space.clear().expect("clear");
    space.rig(&recorded.log);

    assert!(space
        .consume(
            chans(&["c1", "c2"]),
            vec![Pat::Wild, Pat::Wild],
            "k".to_owned(),
            false,
            no_peeks(),
        )
        .expect("replayed consume")
        .is_none());
    assert!(space
        .produce("c1".to_owned(), 1, false)
        .expect("replayed produce")
        .is_none());
    let replayed = space
        .produce("c2".to_owned(), 2, false)
        .expect("replayed produce")
        .expect("the rigged communication commits");
    assert_eq!(replayed.0.continuation, "k");
    assert!(space
        .produce("c3".to_owned(), 7, true)
        .expect("replayed produce")
        .is_none());

    space.check_replay_data().expect("no rigged entries remain");
    space.unrig();
    assert_eq!(
        space.create_checkpoint().expect("checkpoint").root,
        recorded.root,
        "replay reproduced the committed state"
    );
}

#[test]
fn an_alternative_produce_is_divergence() {
    let space = new_space();

    // Record a session where the produce matches immediately.
    assert!(space
        .consume(chans(&["a"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .is_none());
    assert!(space.produce("a".to_owned(), 1, false).expect("produce").is_some());
    let recorded = space.create_checkpoint().expect("checkpoint");

    space.clear().expect("clear");
    space.rig(&recorded.log);

    assert!(space
        .consume(chans(&["a"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("replayed consume")
        .is_none());

    // The wildcard continuation would match 42, but no rigged COMM records
    // that communication.
    let err = space
        .produce("a".to_owned(), 42, false)
        .expect_err("unrecorded match is divergence");
    assert!(matches!(err, SpaceError::ReplayDivergence(_)));
}

#[test]
fn skipping_a_recorded_produce_leaves_replay_data_behind() {
    let space = new_space();

    assert!(space
        .consume(
            chans(&["c1", "c2"]),
            vec![Pat::Wild, Pat::Wild],
            "k".to_owned(),
            false,
            no_peeks(),
        )
        .expect("consume")
        .is_none());
    assert!(space.produce("c1".to_owned(), 1, false).expect("produce").is_none());
    assert!(space.produce("c2".to_owned(), 2, false).expect("produce").is_some());
    let recorded = space.create_checkpoint().expect("checkpoint");

    space.clear().expect("clear");
    space.rig(&recorded.log);

    assert!(space
        .consume(
            chans(&["c1", "c2"]),
            vec![Pat::Wild, Pat::Wild],
            "k".to_owned(),
            false,
            no_peeks(),
        )
        .expect("replayed consume")
        .is_none());
    // produce(c1, 99) instead of the recorded produce(c1, 1): it cannot
    // enable a match (c2 is still empty), so it stores quietly.
    assert!(space
        .produce("c1".to_owned(), 99, false)
        .expect("off-script produce stores")
        .is_none());
    // The recorded second produce cannot find its partner datum.
    assert!(space
        .produce("c2".to_owned(), 2, false)
        .expect("recorded produce stores")
        .is_none());

    let err = space.check_replay_data().expect_err("one COMM was never reproduced");
    assert_eq!(err, SpaceError::LeftoverReplayData { count: 1 });
}

#[test]
fn repeated_identical_produces_replay_in_order() {
    let space = new_space();

    // Two structurally identical produces and two identical consumes: the
    // repeat counters inside each COMM disambiguate them.
    assert!(space.produce("c".to_owned(), 1, false).expect("produce").is_none());
    assert!(space.produce("c".to_owned(), 1, false).expect("produce").is_none());
    assert!(space
        .consume(chans(&["c"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .is_some());
    assert!(space
        .consume(chans(&["c"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .is_some());
    let recorded = space.create_checkpoint().expect("checkpoint");

    space.clear().expect("clear");
    space.rig(&recorded.log);

    assert!(space.produce("c".to_owned(), 1, false).expect("produce").is_none());
    assert!(space.produce("c".to_owned(), 1, false).expect("produce").is_none());
    assert!(space
        .consume(chans(&["c"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .is_some());
    assert!(space
        .consume(chans(&["c"]), vec![Pat::Wild], "k".to_owned(), false, no_peeks())
        .expect("consume")
        .is_some());

    space.check_replay_data().expect("both communications reproduced");
}

#[test]
fn peeked_communications_replay_faithfully() {
    let space = new_space();

    assert!(space
        .consume(chans(&["c"]), vec![Pat::Wild], "k".to_owned(), false, peeks(&[0]))
        .expect("consume")
        .is_none());
    assert!(space.produce("c".to_owned(), 5, false).expect("produce").is_some());
    let recorded = space.create_checkpoint().expect("checkpoint");

    space.clear().expect("clear");
    space.rig(&recorded.log);

    assert!(space
        .consume(chans(&["c"]), vec![Pat::Wild], "k".to_owned(), false, peeks(&[0]))
        .expect("replayed consume")
        .is_none());
    let (_, rows) = space
        .produce("c".to_owned(), 5, false)
        .expect("replayed produce")
        .expect("rigged match");
    assert!(!rows[0].removed);

    space.check_replay_data().expect("clean replay");
    assert_eq!(
        space.get_data(&"c".to_owned()).expect("read").len(),
        1,
        "the peeked datum was retained during replay too"
    );
}

#[test]
fn replay_logs_no_new_events() {
    let space = new_space();

    assert!(space.produce("a".to_owned(), 1, false).expect("produce").is_none());
    let recorded = space.create_checkpoint().expect("checkpoint");
    assert!(matches!(recorded.log[..], [Event::Produce(_)]));

    space.clear().expect("clear");
    space.rig(&recorded.log);
    assert!(space.produce("a".to_owned(), 1, false).expect("produce").is_none());

    let soft = space.create_soft_checkpoint();
    assert!(soft.log.is_empty(), "rigged operations do not re-log");
}

#[test]
fn check_replay_data_requires_a_rig() {
    let space = new_space();
    assert_eq!(
        space.check_replay_data().expect_err("nothing rigged"),
        SpaceError::NotRigged
    );
}
