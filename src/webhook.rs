//! Webhook delivery (§4.5): a bounded outbound queue per trigger, drained
//! by a task that POSTs each payload with retry, exponential backoff, and
//! jitter. Delivery is at-least-once per payload within the retry budget —
//! once attempts are exhausted the payload is dropped and logged, the
//! trigger itself is not disposed (only a full queue disposes a trigger,
//! see `trigger.rs`).

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tycostream_protocol::WebhookPayload;

use crate::config::RetryConfig;

pub async fn run_sender(
    trigger_name: String,
    webhook_url: String,
    retry: RetryConfig,
    mut queue: mpsc::Receiver<WebhookPayload>,
) {
    let client = reqwest::Client::new();
    while let Some(payload) = queue.recv().await {
        deliver(&client, &webhook_url, &retry, &trigger_name, payload).await;
    }
}

async fn deliver(
    client: &reqwest::Client,
    url: &str,
    retry: &RetryConfig,
    trigger_name: &str,
    payload: WebhookPayload,
) {
    let mut backoff = retry.initial_backoff;

    for attempt in 1..=retry.max_attempts {
        match client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(trigger = trigger_name, attempt, "webhook delivered");
                return;
            }
            Ok(response) => {
                warn!(trigger = trigger_name, attempt, status = %response.status(), "webhook rejected");
            }
            Err(error) => {
                warn!(trigger = trigger_name, attempt, %error, "webhook delivery failed");
            }
        }

        if attempt == retry.max_attempts {
            warn!(trigger = trigger_name, "webhook retries exhausted, dropping payload");
            return;
        }

        tokio::time::sleep(jittered(backoff)).await;
        backoff = (backoff * 2).min(retry.max_backoff);
    }
}

fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.01))
}
