//! Trigger engine (§4.5): a filter subscription in live-only mode whose
//! transitions fire webhooks instead of row events. It reuses the exact
//! membership/hysteresis machinery subscriber filters use — entering the
//! filter is FIRE, leaving it is CLEAR — against a bounded webhook queue
//! instead of a per-subscriber row queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::error;
use tycostream_protocol::{RowKind, TriggerEventType, WebhookPayload};

use crate::cache::SourceCache;
use crate::config::TriggerSpec;
use crate::error::TriggerOverflow;
use crate::filter::{Filter, MembershipTracker, Transition};
use crate::webhook;

/// How long a shutting-down trigger waits for its webhook sender to drain
/// the queue before abandoning whatever is left in flight (§9).
const SHUTDOWN_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Run one trigger to completion. Returns `Err` only when its outbound
/// webhook queue overflowed and the trigger was disposed; a clean source or
/// process shutdown returns `Ok(())` after draining queued webhooks for up
/// to [`SHUTDOWN_DRAIN_GRACE`].
pub async fn run(
    spec: TriggerSpec,
    cache: Arc<SourceCache>,
    queue_capacity: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<(), TriggerOverflow> {
    let filter = Filter::new(spec.r#match, spec.unmatch);
    let (_frontier, subscriber_id, mut rx) = cache.subscribe_live(queue_capacity);

    let (out_tx, out_rx) = mpsc::channel(queue_capacity);
    let sender = tokio::spawn(webhook::run_sender(
        spec.name.clone(),
        spec.webhook_url.clone(),
        spec.retry,
        out_rx,
    ));

    let result = drive(&spec.name, &filter, &mut rx, &out_tx, shutdown).await;

    cache.unsubscribe(subscriber_id);
    drop(out_tx);
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN_GRACE, sender).await;
    result
}

async fn drive(
    name: &str,
    filter: &Filter,
    rx: &mut mpsc::Receiver<tycostream_protocol::RowEvent>,
    out_tx: &mpsc::Sender<WebhookPayload>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TriggerOverflow> {
    let mut tracker = MembershipTracker::new();

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            changed = shutdown.changed() => {
                let _ = changed;
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        let Some(event) = event else {
            return Ok(());
        };

        let row_for_membership = match event.kind {
            RowKind::Delete => None,
            _ => Some(&event.row_after),
        };
        let transition = tracker.observe(filter, &event.key, row_for_membership);

        let payload = match transition {
            Some(Transition::Entered) => Some(WebhookPayload {
                event_type: TriggerEventType::Fire,
                trigger_name: name.to_owned(),
                timestamp: Utc::now(),
                data: Some(event.row_after),
            }),
            Some(Transition::Left) => Some(WebhookPayload {
                event_type: TriggerEventType::Clear,
                trigger_name: name.to_owned(),
                timestamp: Utc::now(),
                data: None,
            }),
            None => None,
        };

        if let Some(payload) = payload {
            if out_tx.try_send(payload).is_err() {
                error!(trigger = name, "webhook queue overflowed, disposing trigger");
                return Err(TriggerOverflow { trigger_name: name.to_owned() });
            }
        }
    }
}
