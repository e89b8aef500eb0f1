//! Cache discard and subscriber resync on upstream reconnect, covering
//! spec §4.2's "Failure semantics": a lost cursor must not let a
//! subscriber silently keep trusting rows the cache can no longer vouch
//! for. Drives `SourceCache::reset_and_resync_all` directly the same way
//! `slow_subscriber.rs` drives eviction directly — `upstream::handler` is
//! the only piece that needs a live Postgres-wire connection, and this
//! exercises the cache/subscriber side of what it calls on reconnect.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tycostream::cache::SourceCache;
use tycostream::error::PipelineError;
use tycostream::subscriber;
use tycostream_protocol::{ApiEvent, ColumnValue, Frontier, Key, ProjectionMode, Row, RowEvent, RowKind};

fn insert_event(id: i32, frontier: u64) -> RowEvent {
    let mut m = BTreeMap::new();
    m.insert("id".to_owned(), ColumnValue::Integer(id));
    RowEvent {
        kind: RowKind::Insert,
        key: Key(id.to_string()),
        row_after: Row(m),
        changed_fields: None,
        frontier_token: Frontier(frontier),
    }
}

#[tokio::test]
async fn reconnect_discards_the_cache_and_resyncs_every_attached_subscriber() {
    let cache = std::sync::Arc::new(SourceCache::new("id"));
    cache.apply(insert_event(1, 1));
    cache.advance_frontier(Frontier(1));

    let (tx_a, mut rx_a) = mpsc::channel::<Result<ApiEvent, PipelineError>>(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let task_a = tokio::spawn(subscriber::run(
        cache.clone(),
        None,
        ProjectionMode::FullRow,
        true,
        16,
        tx_a,
        shutdown_rx.clone(),
    ));

    let (tx_b, mut rx_b) = mpsc::channel::<Result<ApiEvent, PipelineError>>(16);
    let task_b = tokio::spawn(subscriber::run(
        cache.clone(),
        None,
        ProjectionMode::FullRow,
        true,
        16,
        tx_b,
        shutdown_rx,
    ));

    // both should see the pre-existing row as a snapshot insert.
    let a_snapshot = rx_a.recv().await.unwrap().unwrap();
    assert_eq!(a_snapshot.kind, RowKind::Insert);
    let b_snapshot = rx_b.recv().await.unwrap().unwrap();
    assert_eq!(b_snapshot.kind, RowKind::Insert);

    assert!(cache.is_ready());

    // simulates what `upstream::handler::run` does on the Transient ->
    // reconnect path.
    cache.reset_and_resync_all();

    assert!(!cache.is_ready());

    let a_result = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
        .await
        .expect("subscriber a never resolved after reset");
    assert_eq!(a_result, Some(Err(PipelineError::UpstreamResync)));

    let b_result = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
        .await
        .expect("subscriber b never resolved after reset");
    assert_eq!(b_result, Some(Err(PipelineError::UpstreamResync)));

    let _ = task_a.await;
    let _ = task_b.await;

    // a fresh subscriber sees an empty, not-yet-ready cache, the way a
    // rebuilt-from-scratch snapshot would start.
    let (tx_c, mut rx_c) = mpsc::channel::<Result<ApiEvent, PipelineError>>(4);
    let (_shutdown_tx2, shutdown_rx2) = watch::channel(false);
    let task_c = tokio::spawn(subscriber::run(cache.clone(), None, ProjectionMode::FullRow, true, 4, tx_c, shutdown_rx2));
    tokio::task::yield_now().await;
    cache.apply(insert_event(2, 2));
    let c_event = rx_c.recv().await.unwrap().unwrap();
    assert_eq!(c_event.kind, RowKind::Insert);
    assert_eq!(c_event.row.get("id"), Some(&ColumnValue::Integer(2)));

    task_c.abort();
}
