mod common;

use common::{event, event_numbers, max_count, metadata, option, tombstone, CHUNK_SIZE};
use scavenger::{
    point::SCAVENGE_POINTS_STREAM, state::TOMBSTONE_EVENT_NUMBER, Progress, ScavengeStage,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn simple_tombstone() {
    let log = common::log();
    log.append(metadata("$$ab-1", 0, 0, max_count(1))).unwrap();
    log.append(event("ab-1", 0, 1)).unwrap();
    log.append(event("ab-1", 1, 2)).unwrap();
    log.append(tombstone("ab-1", 3)).unwrap();
    log.complete_chunk().unwrap();

    let option = option().threshold(1000).unsafe_ignore_hard_deletes(true);
    let scavenger = common::scavenger(common::in_memory_state(), &log, &option);
    let progress = scavenger.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(progress, Progress::Completed);
    assert!(event_numbers(&log, "ab-1").is_empty());
    assert!(event_numbers(&log, "$$ab-1").is_empty());
    assert_eq!(event_numbers(&log, SCAVENGE_POINTS_STREAM), vec![0]);

    let state = scavenger.state();
    let checkpoint = state.try_get_checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.stage(), ScavengeStage::Done);
    assert_eq!(checkpoint.scavenge_point().threshold(), 1000);
    assert!(state.try_get_original_stream_data("ab-1").unwrap().is_none());
    assert!(state.try_get_metastream_data("$$ab-1").unwrap().is_none());
}

#[tokio::test]
async fn tombstone_then_normal_scavenge_then_unsafe_hard_deletes() {
    let log = common::log();
    log.append(metadata("$$ab-1", 0, 0, max_count(1))).unwrap();
    log.append(event("ab-1", 0, 1)).unwrap();
    log.append(event("ab-1", 1, 2)).unwrap();
    log.append(tombstone("ab-1", 3)).unwrap();
    log.complete_chunk().unwrap();

    let scavenger = common::scavenger(common::in_memory_state(), &log, &option());
    scavenger.run(&CancellationToken::new()).await.unwrap();

    // only the tombstone is kept
    assert_eq!(event_numbers(&log, "ab-1"), vec![TOMBSTONE_EVENT_NUMBER]);
    assert!(event_numbers(&log, "$$ab-1").is_empty());
    let state = scavenger.into_state();
    assert!(state.try_get_original_stream_data("ab-1").unwrap().is_some());

    let option = option().unsafe_ignore_hard_deletes(true);
    let scavenger = common::scavenger(state, &log, &option);
    scavenger.run(&CancellationToken::new()).await.unwrap();

    assert!(event_numbers(&log, "ab-1").is_empty());
    assert_eq!(event_numbers(&log, SCAVENGE_POINTS_STREAM), vec![0, 1]);
    let state = scavenger.state();
    let checkpoint = state.try_get_checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.to_string(), "Done SP-1");
    assert!(state.try_get_original_stream_data("ab-1").unwrap().is_none());
    assert!(state.try_get_metastream_data("$$ab-1").unwrap().is_none());
}

#[tokio::test]
async fn normal_scavenge_then_tombstone_then_unsafe_hard_deletes() {
    let log = common::log();
    log.append(metadata("$$ab-1", 0, 0, max_count(1))).unwrap();
    log.append(event("ab-1", 0, 1)).unwrap();
    log.append(event("ab-1", 1, 2)).unwrap();
    log.complete_chunk().unwrap();

    let scavenger = common::scavenger(common::in_memory_state(), &log, &option());
    scavenger.run(&CancellationToken::new()).await.unwrap();

    // max count 1 keeps the metadata and the last event
    assert_eq!(event_numbers(&log, "ab-1"), vec![1]);
    assert_eq!(event_numbers(&log, "$$ab-1"), vec![0]);

    // seal SP-0's chunk, then tombstone in a chunk of its own
    log.complete_chunk().unwrap();
    let tombstone_position = log.append(tombstone("ab-1", 4)).unwrap();
    assert_eq!(tombstone_position, 2 * CHUNK_SIZE);
    log.complete_chunk().unwrap();

    let option = option().unsafe_ignore_hard_deletes(true);
    let scavenger = common::scavenger(scavenger.into_state(), &log, &option);
    scavenger.run(&CancellationToken::new()).await.unwrap();

    assert!(event_numbers(&log, "$$ab-1").is_empty());
    assert!(event_numbers(&log, "ab-1").is_empty());
    assert_eq!(event_numbers(&log, SCAVENGE_POINTS_STREAM), vec![0, 1]);
    let state = scavenger.state();
    assert!(state.try_get_original_stream_data("ab-1").unwrap().is_none());
    assert!(state.try_get_metastream_data("$$ab-1").unwrap().is_none());
}
