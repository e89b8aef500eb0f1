use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tycostream::api::{self, AppState};
use tycostream::cache::SourceCache;
use tycostream::config::{self, Cli};
use tycostream::schema::SchemaRegistry;
use tycostream::{trigger, upstream};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let gateway_config = config::load_from_path(&cli.config).unwrap_or_else(|error| {
        eprintln!("failed to load config from {}: {error}", cli.config.display());
        std::process::exit(1);
    });
    let schema = Arc::new(SchemaRegistry::new(&gateway_config));

    let mut sources = HashMap::new();
    for source_spec in &gateway_config.sources {
        sources.insert(
            source_spec.schema.name.clone(),
            Arc::new(SourceCache::new(source_spec.schema.primary_key_column.clone())),
        );
    }
    let sources = Arc::new(sources);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut upstream_handles = Vec::new();
    for source_spec in gateway_config.sources.clone() {
        let cache = sources.get(&source_spec.schema.name).unwrap().clone();
        let rx = shutdown_rx.clone();
        upstream_handles.push(tokio::spawn(upstream::run(source_spec, cache, rx)));
    }

    let mut trigger_handles = Vec::new();
    for trigger_spec in gateway_config.triggers.clone() {
        let Some(cache) = sources.get(&trigger_spec.source).cloned() else {
            continue;
        };
        let rx = shutdown_rx.clone();
        trigger_handles.push(tokio::spawn(async move {
            if let Err(overflow) = trigger::run(trigger_spec, cache, 256, rx).await {
                tracing::warn!(trigger = %overflow.trigger_name, "trigger disposed at startup config");
            }
        }));
    }

    let state = AppState {
        sources,
        schema,
        subscriber_queue_capacity: 1024,
        trigger_queue_capacity: 256,
        shutdown: shutdown_rx,
    };
    let router = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(&cli.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %cli.bind_addr, "tycostream listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .expect("server error");

    for handle in upstream_handles {
        let _ = handle.await;
    }
    for handle in trigger_handles {
        let _ = handle.await;
    }
    info!("tycostream shut down gracefully");
}

/// Waits for Ctrl+C or SIGTERM, then flips `shutdown_tx` before returning.
/// This has to happen before axum's own graceful-shutdown wait resolves:
/// axum only stops *accepting new* connections on this future's return and
/// then waits for already-open ones (including every open subscriber
/// WebSocket) to close on their own — they only do that once they observe
/// `shutdown_tx` (§9's "orderly shutdown cancels all subscribers first").
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }

    let _ = shutdown_tx.send(true);
}
