//! Backpressure under a slow subscriber, covering spec scenario 6: a
//! flooded output queue evicts only the lagging subscriber, never the
//! events meant for others.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tycostream::cache::SourceCache;
use tycostream::error::PipelineError;
use tycostream::subscriber;
use tycostream_protocol::{ApiEvent, ColumnValue, Frontier, Key, ProjectionMode, Row, RowEvent, RowKind};

const EVENT_COUNT: u64 = 1000;
const SLOW_QUEUE_CAPACITY: usize = 8;

fn update(value: u64, frontier: u64) -> RowEvent {
    let mut m = BTreeMap::new();
    m.insert("id".to_owned(), ColumnValue::Integer(1));
    m.insert("value".to_owned(), ColumnValue::BigInt(value as i128));
    RowEvent {
        kind: RowKind::Update,
        key: Key("1".into()),
        row_after: Row(m),
        changed_fields: Some(std::collections::HashSet::from(["value".to_owned()])),
        frontier_token: Frontier(frontier),
    }
}

#[tokio::test]
async fn slow_subscriber_is_evicted_without_affecting_other_subscribers() {
    let cache = std::sync::Arc::new(SourceCache::new("id"));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let (fast_tx, mut fast_rx) = mpsc::channel::<Result<ApiEvent, PipelineError>>(2 * EVENT_COUNT as usize);
    let fast_task = tokio::spawn(subscriber::run(
        cache.clone(),
        None,
        ProjectionMode::FullRow,
        false,
        2 * EVENT_COUNT as usize,
        fast_tx,
        shutdown_rx.clone(),
    ));

    let (slow_tx, mut slow_rx) = mpsc::channel::<Result<ApiEvent, PipelineError>>(SLOW_QUEUE_CAPACITY);
    let slow_task = tokio::spawn(subscriber::run(
        cache.clone(),
        None,
        ProjectionMode::FullRow,
        false,
        SLOW_QUEUE_CAPACITY,
        slow_tx,
        shutdown_rx,
    ));

    // register both subscribers before the flood starts.
    tokio::task::yield_now().await;

    // emitted faster than either subscriber task gets a chance to drain,
    // since nothing here awaits between applies.
    for i in 0..EVENT_COUNT {
        cache.apply(update(i, i + 1));
    }

    // drain the slow subscriber until its channel closes (eviction) or it
    // reports the terminal error; it must never see all 1000 events.
    let mut slow_received = 0usize;
    let mut slow_saw_lagged = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(2), slow_rx.recv()).await {
            Ok(Some(Ok(_))) => slow_received += 1,
            Ok(Some(Err(PipelineError::SubscriberLagged))) => {
                slow_saw_lagged = true;
                break;
            }
            Ok(Some(Err(other))) => panic!("unexpected terminal error: {other:?}"),
            Ok(None) => break,
            Err(_) => panic!("slow subscriber never resolved"),
        }
    }
    assert!(slow_saw_lagged, "slow subscriber should end with SubscriberLagged");
    assert!(
        slow_received < EVENT_COUNT as usize,
        "slow subscriber should be evicted well before draining all {EVENT_COUNT} events, got {slow_received}"
    );

    // the fast subscriber's own queues were sized to hold the whole flood,
    // so it must see every event regardless of the slow one's eviction.
    let mut fast_received = 0usize;
    while fast_received < EVENT_COUNT as usize {
        match tokio::time::timeout(Duration::from_secs(2), fast_rx.recv()).await {
            Ok(Some(Ok(_))) => fast_received += 1,
            other => panic!("fast subscriber stalled after {fast_received} events: {other:?}"),
        }
    }
    assert_eq!(fast_received, EVENT_COUNT as usize);

    drop(cache);
    let _ = slow_task.await;
    fast_task.abort();
}
