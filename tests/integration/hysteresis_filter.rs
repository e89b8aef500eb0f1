//! Filter hysteresis and Delta-mode projection, covering spec scenarios 2
//! and 4, driven through the real subscriber pipeline against a live cache.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, watch};
use tycostream::cache::SourceCache;
use tycostream::filter::Filter;
use tycostream::subscriber;
use tycostream_protocol::{ApiEvent, ColumnValue, CompareOp, Frontier, Predicate, ProjectionMode, Row, RowEvent, RowKind};

fn row(id: i32, value: i32) -> Row {
    let mut m = BTreeMap::new();
    m.insert("id".to_owned(), ColumnValue::Integer(id));
    m.insert("value".to_owned(), ColumnValue::Integer(value));
    Row(m)
}

fn update(id: i32, value: i32, frontier: u64) -> RowEvent {
    RowEvent {
        kind: RowKind::Update,
        key: tycostream_protocol::Key(id.to_string()),
        row_after: row(id, value),
        changed_fields: Some(std::collections::HashSet::from(["value".to_owned()])),
        frontier_token: Frontier(frontier),
    }
}

fn insert(id: i32, value: i32, frontier: u64) -> RowEvent {
    RowEvent {
        kind: RowKind::Insert,
        key: tycostream_protocol::Key(id.to_string()),
        row_after: row(id, value),
        changed_fields: None,
        frontier_token: Frontier(frontier),
    }
}

#[tokio::test]
async fn hysteresis_band_suppresses_updates_between_thresholds() {
    let cache = std::sync::Arc::new(SourceCache::new("id"));
    let filter = Filter::new(
        Predicate::Compare { column: "value".into(), op: CompareOp::Ge, literal: ColumnValue::Integer(100) },
        Some(Predicate::Compare { column: "value".into(), op: CompareOp::Lt, literal: ColumnValue::Integer(95) }),
    );

    let (tx, mut rx) = mpsc::channel::<Result<ApiEvent, tycostream::error::PipelineError>>(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sub_task = tokio::spawn(subscriber::run(cache.clone(), Some(filter), ProjectionMode::FullRow, true, 16, tx, shutdown_rx));
    tokio::task::yield_now().await;

    cache.apply(insert(1, 100, 1));
    cache.apply(update(1, 97, 2));
    cache.apply(update(1, 94, 3));
    cache.apply(update(1, 99, 4));
    cache.apply(update(1, 101, 5));

    let e1 = rx.recv().await.unwrap().unwrap();
    assert_eq!(e1.kind, RowKind::Insert);
    assert_eq!(e1.row.get("value"), Some(&ColumnValue::Integer(100)));

    let e2 = rx.recv().await.unwrap().unwrap();
    assert_eq!(e2.kind, RowKind::Update);
    assert_eq!(e2.row.get("value"), Some(&ColumnValue::Integer(97)));

    let e3 = rx.recv().await.unwrap().unwrap();
    assert_eq!(e3.kind, RowKind::Delete);

    // value=99 falls in the neutral band (>=95, <100): membership stays
    // false, nothing is delivered.
    let e4 = rx.recv().await.unwrap().unwrap();
    assert_eq!(e4.kind, RowKind::Insert);
    assert_eq!(e4.row.get("value"), Some(&ColumnValue::Integer(101)));

    sub_task.abort();
}

#[tokio::test]
async fn delta_mode_update_carries_only_pk_and_changed_fields() {
    let cache = std::sync::Arc::new(SourceCache::new("id"));
    cache.apply(insert(1, 100, 1));
    cache.advance_frontier(Frontier(1));

    let (tx, mut rx) = mpsc::channel::<Result<ApiEvent, tycostream::error::PipelineError>>(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sub_task = tokio::spawn(subscriber::run(cache.clone(), None, ProjectionMode::Delta, false, 8, tx, shutdown_rx));
    tokio::task::yield_now().await;

    cache.apply(update(1, 200, 2));

    let event = rx.recv().await.unwrap().unwrap();
    assert_eq!(event.kind, RowKind::Update);
    assert_eq!(event.changed_fields, Some(std::collections::HashSet::from(["value".to_owned()])));
    assert_eq!(event.row.0.len(), 2);
    assert_eq!(event.row.get("id"), Some(&ColumnValue::Integer(1)));
    assert_eq!(event.row.get("value"), Some(&ColumnValue::Integer(200)));

    sub_task.abort();
}
