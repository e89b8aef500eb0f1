//! Subscriber pipeline (§4.4): filter membership, hysteresis-driven
//! synthesis of entry/exit row events, and Delta/FullRow projection.
//!
//! One task runs per open subscription. It owns the atomic snapshot+live
//! handoff from [`SourceCache`], then folds every subsequent [`RowEvent`]
//! through the optional filter before projecting it to the wire shape the
//! client asked for.

use tokio::sync::{mpsc, watch};
use tycostream_protocol::{ApiEvent, Row, RowEvent, RowKind, ProjectionMode};

use crate::cache::SourceCache;
use crate::error::PipelineError;
use crate::filter::{Filter, MembershipTracker, Transition};

/// Run one subscription to completion. Returns when the client disconnects,
/// the subscriber's queue overflows and it is evicted, the upstream handler
/// discards the cache out from under it (`UpstreamResync`), or the process
/// is shutting down (`SourceShutdown`, §9).
pub async fn run(
    cache: std::sync::Arc<SourceCache>,
    filter: Option<Filter>,
    mode: ProjectionMode,
    include_snapshot: bool,
    queue_capacity: usize,
    out_tx: mpsc::Sender<Result<ApiEvent, PipelineError>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let pk_column = cache.pk_column().to_owned();
    let (initial_rows, _frontier, subscriber_id, mut rx) = cache.snapshot_and_subscribe(queue_capacity);

    let mut tracker = MembershipTracker::new();
    if !seed_and_emit_snapshot(&pk_column, &filter, &mut tracker, mode, include_snapshot, initial_rows, &out_tx).await
    {
        cache.unsubscribe(subscriber_id);
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    if let Some(api_event) = process_event(&pk_column, &filter, &mut tracker, mode, event) {
                        if out_tx.send(Ok(api_event)).await.is_err() {
                            break;
                        }
                    }
                }
                None => {
                    let was_resync = cache.unsubscribe(subscriber_id);
                    let err = if was_resync { PipelineError::UpstreamResync } else { PipelineError::SubscriberLagged };
                    let _ = out_tx.send(Err(err)).await;
                    return;
                }
            },
            changed = shutdown.changed() => {
                let _ = changed;
                if *shutdown.borrow() {
                    let _ = out_tx.send(Err(PipelineError::SourceShutdown)).await;
                    break;
                }
            }
        }
    }

    cache.unsubscribe(subscriber_id);
}

/// Seed the membership tracker from the snapshot and, when requested, emit
/// each row already inside the filter as a synthesized Insert. Returns
/// `false` if the client disconnected mid-snapshot.
async fn seed_and_emit_snapshot(
    pk_column: &str,
    filter: &Option<Filter>,
    tracker: &mut MembershipTracker,
    mode: ProjectionMode,
    include_snapshot: bool,
    rows: Vec<Row>,
    out_tx: &mpsc::Sender<Result<ApiEvent, PipelineError>>,
) -> bool {
    for row in rows {
        let key = row.key(pk_column);
        let inside = match filter {
            Some(f) => {
                tracker.observe(f, &key, Some(&row));
                tracker.is_member(&key)
            }
            None => true,
        };
        if inside && include_snapshot {
            let event = ApiEvent {
                kind: RowKind::Insert,
                row,
                changed_fields: None,
            };
            if out_tx.send(Ok(event)).await.is_err() {
                return false;
            }
        }
    }
    true
}

/// Fold one raw cache event through the filter (if any) and project it.
/// Returns `None` when the event produces nothing visible to this
/// subscriber — e.g. an update outside the filter, or one whose changed
/// fields can't affect membership and whose key isn't currently a member.
fn process_event(
    pk_column: &str,
    filter: &Option<Filter>,
    tracker: &mut MembershipTracker,
    mode: ProjectionMode,
    event: RowEvent,
) -> Option<ApiEvent> {
    let Some(filter) = filter else {
        return Some(project(pk_column, mode, event));
    };

    if let RowEvent { kind: RowKind::Update, changed_fields: Some(changed), .. } = &event {
        if !filter.may_be_affected_by(changed) {
            return if tracker.is_member(&event.key) {
                Some(project(pk_column, mode, event))
            } else {
                None
            };
        }
    }

    // A reborn key (§4.4): an Insert for a key the tracker still thinks is a
    // member means the row was deleted and recreated upstream between
    // events this subscriber never saw separated. The hysteresis band only
    // applies to Updates against a row it has tracked continuously, so this
    // bypasses it and evaluates `match` alone.
    if event.kind == RowKind::Insert && tracker.is_member(&event.key) {
        return if filter.matches(&event.row_after) {
            Some(ApiEvent {
                kind: RowKind::Update,
                row: event.row_after,
                changed_fields: None,
            })
        } else {
            tracker.remove(&event.key);
            Some(ApiEvent {
                kind: RowKind::Delete,
                row: event.row_after.only_key(pk_column),
                changed_fields: None,
            })
        };
    }

    let row_for_membership = match event.kind {
        RowKind::Delete => None,
        _ => Some(&event.row_after),
    };
    let transition = tracker.observe(filter, &event.key, row_for_membership);

    match transition {
        Some(Transition::Entered) => Some(ApiEvent {
            kind: RowKind::Insert,
            row: event.row_after,
            changed_fields: None,
        }),
        Some(Transition::Left) => Some(ApiEvent {
            kind: RowKind::Delete,
            row: event.row_after.only_key(pk_column),
            changed_fields: None,
        }),
        None if tracker.is_member(&event.key) && event.kind != RowKind::Delete => {
            Some(project(pk_column, mode, event))
        }
        None => None,
    }
}

/// Apply the subscription's projection mode to an event already known to be
/// visible. A synthesized Insert never reaches here (callers short-circuit
/// it above); a raw Insert from upstream always carries the full row since
/// there is no prior state to diff against.
fn project(pk_column: &str, mode: ProjectionMode, event: RowEvent) -> ApiEvent {
    match (mode, event.kind) {
        (_, RowKind::Insert) => ApiEvent {
            kind: RowKind::Insert,
            row: event.row_after,
            changed_fields: None,
        },
        (ProjectionMode::FullRow, kind) => ApiEvent {
            kind,
            row: event.row_after,
            changed_fields: None,
        },
        (ProjectionMode::Delta, RowKind::Update) => {
            let fields = event.changed_fields.unwrap_or_default();
            let row = event.row_after.project(pk_column, &fields);
            ApiEvent {
                kind: RowKind::Update,
                row,
                changed_fields: Some(fields),
            }
        }
        (ProjectionMode::Delta, RowKind::Delete) => ApiEvent {
            kind: RowKind::Delete,
            row: event.row_after.only_key(pk_column),
            changed_fields: None,
        },
    }
}
