//! Upstream protocol handler (§4.2, §9): one task per configured source,
//! owning the single writer side of its [`SourceCache`].
//!
//! Connecting -> Snapshotting -> Live is one continuous `SUBSCRIBE` cursor:
//! Materialize doesn't distinguish the initial burst from the live tail on
//! the wire, only the first progress row marks the snapshot complete. On any
//! transient failure or idle timeout the handler drops the cursor and loops
//! back to Connecting with exponential backoff and jitter, the way the
//! uplink session in this codebase's forwarder reconnects after a dropped
//! WebSocket — just against a Postgres wire protocol instead.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio_postgres::NoTls;
use tracing::{error, info, warn};
use tycostream_protocol::Frontier;

use crate::cache::SourceCache;
use crate::config::SourceSpec;
use crate::error::UpstreamError;
use crate::upstream::wire::{Coalescer, WireEvent, decode_row};

/// Drive one source's upstream connection until `shutdown` fires or a fatal
/// error is hit. Never returns early on a transient error; it reconnects.
pub async fn run(spec: SourceSpec, cache: Arc<SourceCache>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = spec.upstream.reconnect_initial_backoff;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match run_once(&spec, &cache, &mut shutdown).await {
            Ok(()) => return,
            Err(UpstreamError::Fatal(reason)) => {
                error!(source = %spec.schema.name, %reason, "fatal upstream error, source disabled");
                return;
            }
            Err(UpstreamError::Transient(reason)) => {
                let delay = jittered(backoff);
                warn!(
                    source = %spec.schema.name,
                    %reason,
                    delay_ms = delay.as_millis() as u64,
                    "upstream connection lost, reconnecting"
                );
                // The cursor is gone; nothing the cache currently holds, nor
                // any subscriber's idea of "already seen", can be trusted
                // against whatever snapshot the reconnect produces (§4.2).
                cache.reset_and_resync_all();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
                backoff = (backoff * 2).min(spec.upstream.reconnect_max_backoff);
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.01))
}

async fn run_once(
    spec: &SourceSpec,
    cache: &Arc<SourceCache>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), UpstreamError> {
    let (client, connection) = tokio_postgres::connect(&spec.upstream.dsn, NoTls)
        .await
        .map_err(|e| UpstreamError::Transient(format!("connect: {e}")))?;

    let source_name = spec.schema.name.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(source = %source_name, error = %e, "upstream connection task ended");
        }
    });

    client
        .batch_execute("BEGIN")
        .await
        .map_err(|e| UpstreamError::Transient(format!("begin: {e}")))?;
    client
        .batch_execute(&format!(
            "DECLARE cur CURSOR FOR SUBSCRIBE TO {} WITH (PROGRESS)",
            spec.upstream.relation
        ))
        .await
        .map_err(|e| UpstreamError::Fatal(format!("declaring subscribe cursor: {e}")))?;

    info!(source = %spec.schema.name, relation = %spec.upstream.relation, "subscribed to upstream relation");

    let mut coalescer = Coalescer::new(&spec.schema.primary_key_column);
    let fetch_sql = format!("FETCH {} FROM cur", spec.upstream.fetch_size);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                let _ = changed;
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            () = tokio::time::sleep(spec.upstream.idle_timeout) => {
                return Err(UpstreamError::Transient("idle timeout exceeded".into()));
            }
            result = client.query(fetch_sql.as_str(), &[]) => {
                let rows = result.map_err(|e| UpstreamError::Transient(format!("fetch: {e}")))?;
                for pg_row in &rows {
                    match decode_row(pg_row, &spec.schema)? {
                        WireEvent::Progress { timestamp } => {
                            let frontier = Frontier(timestamp.max(0) as u64);
                            let events = coalescer.drain(frontier, |key| cache.contains(key));
                            for event in events {
                                cache.apply(event);
                            }
                            cache.advance_frontier(frontier);
                        }
                        WireEvent::Diff(diff) => coalescer.push(diff),
                    }
                }
            }
        }
    }
}
