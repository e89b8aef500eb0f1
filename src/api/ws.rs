//! Subscription WebSocket handler and trigger registration route (§6).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use futures_util::SinkExt;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tycostream_protocol::{ApiTerminalError, FilterSpec, Source, SubscribeRequest, TriggerRegisterRequest};

use crate::api::AppState;
use crate::config::{RetryConfig, TriggerSpec};
use crate::filter::Filter;
use crate::{subscriber, trigger};

pub async fn subscribe_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let request = match recv_subscribe_request(&mut socket).await {
        Some(r) => r,
        None => return,
    };

    let Some(cache) = state.sources.get(&request.source).cloned() else {
        warn!(source = %request.source, "subscribe request for unknown source");
        let _ = socket.close().await;
        return;
    };

    let Ok(source_schema) = state.schema.lookup(&request.source) else {
        warn!(source = %request.source, "subscribe request for source missing from schema registry");
        let _ = socket.close().await;
        return;
    };
    if let Some(filter_spec) = &request.filter {
        if let Err(unknown_column) = validate_filter_columns(filter_spec, source_schema) {
            warn!(source = %request.source, column = %unknown_column, "filter references unknown column");
            let _ = socket.close().await;
            return;
        }
    }

    let filter = request.filter.map(|f| Filter::new(f.r#match, f.unmatch));
    let (tx, mut rx) = mpsc::channel(state.subscriber_queue_capacity);
    let queue_capacity = state.subscriber_queue_capacity;
    let task = tokio::spawn(subscriber::run(
        cache,
        filter,
        request.mode,
        request.include_snapshot,
        queue_capacity,
        tx,
        state.shutdown.clone(),
    ));

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(api_event)) => {
                        if send_json(&mut socket, &api_event).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        let terminal = ApiTerminalError { code: err.code(), message: err.to_string() };
                        let _ = send_json(&mut socket, &terminal).await;
                        break;
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    task.abort();
}

/// `Err` carries the first unknown column name found, for logging.
fn validate_filter_columns(filter: &FilterSpec, source: &Source) -> Result<(), String> {
    let mut columns = filter.r#match.dependent_columns();
    if let Some(unmatch) = &filter.unmatch {
        columns.extend(unmatch.dependent_columns());
    }
    for column in columns {
        if source.column(&column).is_none() {
            return Err(column);
        }
    }
    Ok(())
}

async fn recv_subscribe_request(socket: &mut WebSocket) -> Option<SubscribeRequest> {
    match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
            Ok(request) => Some(request),
            Err(error) => {
                warn!(%error, "malformed subscribe request");
                None
            }
        },
        _ => None,
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).expect("api wire types always serialize");
    socket.send(Message::Text(json.into())).await
}

/// Register a trigger at runtime, spawning its engine task in the
/// background. A trigger disposed by queue overflow just stops; it is not
/// re-registered automatically.
pub async fn register_trigger(
    State(state): State<AppState>,
    Json(request): Json<TriggerRegisterRequest>,
) -> impl IntoResponse {
    let Some(cache) = state.sources.get(&request.source).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown source").into_response();
    };

    let spec = TriggerSpec {
        name: request.name.clone(),
        source: request.source,
        r#match: request.r#match,
        unmatch: request.unmatch,
        webhook_url: request.webhook_url,
        retry: RetryConfig::default(),
    };
    let queue_capacity = state.trigger_queue_capacity;
    let shutdown = state.shutdown.clone();

    tokio::spawn(async move {
        info!(trigger = %spec.name, "trigger registered");
        if let Err(overflow) = trigger::run(spec, cache, queue_capacity, shutdown).await {
            warn!(trigger = %overflow.trigger_name, "trigger disposed after webhook queue overflow");
        }
    });

    StatusCode::ACCEPTED.into_response()
}
