//! End-to-end row lifecycle: fake upstream diffs -> coalescer -> source
//! cache -> subscriber pipeline, covering spec scenarios 1 and 3.
//!
//! The fake upstream here is the coalescer fed by hand-built diffs instead
//! of a real `SUBSCRIBE` cursor — `upstream::handler` owns the only piece
//! that actually needs a live Postgres-wire connection, and is exercised
//! separately by its own state-machine unit tests.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, watch};
use tycostream::cache::SourceCache;
use tycostream::subscriber;
use tycostream::upstream::wire::{Coalescer, Diff};
use tycostream_protocol::{ApiEvent, ColumnValue, Frontier, ProjectionMode, Row, RowKind};

fn row(id: i32, value: i32) -> Row {
    let mut m = BTreeMap::new();
    m.insert("id".to_owned(), ColumnValue::Integer(id));
    m.insert("value".to_owned(), ColumnValue::Integer(value));
    Row(m)
}

/// Push one timestamp's worth of diffs through a coalescer and apply the
/// resulting events to the cache, the same sequence `upstream::handler`
/// runs per fetched batch.
fn apply_batch(cache: &SourceCache, coalescer: &mut Coalescer, ts: i64, diffs: Vec<Diff>) {
    for diff in diffs {
        coalescer.push(diff);
    }
    let events = coalescer.drain(Frontier(ts as u64), |key| cache.contains(key));
    for event in events {
        cache.apply(event);
    }
    cache.advance_frontier(Frontier(ts as u64));
}

#[tokio::test]
async fn basic_insert_update_delete() {
    let cache = std::sync::Arc::new(SourceCache::new("id"));
    let mut coalescer = Coalescer::new("id");
    let (tx, mut rx) = mpsc::channel::<Result<ApiEvent, tycostream::error::PipelineError>>(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sub_task = tokio::spawn(subscriber::run(cache.clone(), None, ProjectionMode::FullRow, true, 8, tx, shutdown_rx));

    // give the subscriber task a chance to register before t=1 lands.
    tokio::task::yield_now().await;

    apply_batch(&cache, &mut coalescer, 1, vec![Diff { timestamp: 1, sign: 1, row: row(1, 100) }]);
    apply_batch(
        &cache,
        &mut coalescer,
        2,
        vec![
            Diff { timestamp: 2, sign: -1, row: row(1, 100) },
            Diff { timestamp: 2, sign: 1, row: row(1, 200) },
        ],
    );
    apply_batch(&cache, &mut coalescer, 3, vec![Diff { timestamp: 3, sign: -1, row: row(1, 200) }]);

    let insert = rx.recv().await.unwrap().unwrap();
    assert_eq!(insert.kind, RowKind::Insert);
    assert_eq!(insert.row.get("value"), Some(&ColumnValue::Integer(100)));

    let update = rx.recv().await.unwrap().unwrap();
    assert_eq!(update.kind, RowKind::Update);
    assert_eq!(update.row.get("value"), Some(&ColumnValue::Integer(200)));
    assert_eq!(update.changed_fields.unwrap(), std::collections::HashSet::from(["value".to_owned()]));

    let delete = rx.recv().await.unwrap().unwrap();
    assert_eq!(delete.kind, RowKind::Delete);
    assert_eq!(delete.row.0.len(), 1);

    sub_task.abort();
}

#[tokio::test]
async fn late_joiner_receives_one_snapshot_insert_per_key_then_live_tail() {
    let cache = std::sync::Arc::new(SourceCache::new("id"));
    let mut coalescer = Coalescer::new("id");

    for id in 1..=3 {
        apply_batch(&cache, &mut coalescer, id as i64, vec![Diff { timestamp: id as i64, sign: 1, row: row(id, id * 10) }]);
    }

    let (tx, mut rx) = mpsc::channel::<Result<ApiEvent, tycostream::error::PipelineError>>(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sub_task = tokio::spawn(subscriber::run(cache.clone(), None, ProjectionMode::FullRow, true, 16, tx, shutdown_rx));

    let mut seen_keys = std::collections::HashSet::new();
    for _ in 0..3 {
        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.kind, RowKind::Insert);
        let id = match event.row.get("id").unwrap() {
            ColumnValue::Integer(v) => *v,
            other => panic!("unexpected id column: {other:?}"),
        };
        assert!(seen_keys.insert(id), "snapshot insert for key {id} delivered more than once");
    }

    apply_batch(&cache, &mut coalescer, 4, vec![Diff { timestamp: 4, sign: 1, row: row(4, 40) }]);
    let live_insert = rx.recv().await.unwrap().unwrap();
    assert_eq!(live_insert.kind, RowKind::Insert);
    assert_eq!(live_insert.row.get("id"), Some(&ColumnValue::Integer(4)));

    sub_task.abort();
}
