//! Error taxonomy (§7).
//!
//! Every terminal error a subscriber or trigger can see carries a code and a
//! human-readable message; nothing here is silently swallowed.

use thiserror::Error;
use tycostream_protocol::TerminalErrorCode;

/// Failure loading and validating the schema registry (§4.1). Fatal,
/// startup-only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("schema error in source {source_name:?}{}: {reason}", column.as_ref().map(|c| format!(" column {c:?}")).unwrap_or_default())]
pub struct SchemaError {
    pub source_name: Option<String>,
    pub column: Option<String>,
    pub reason: String,
}

impl SchemaError {
    pub fn new(source: impl Into<Option<String>>, reason: impl Into<String>) -> Self {
        SchemaError {
            source_name: source.into(),
            column: None,
            reason: reason.into(),
        }
    }

    pub fn column(source: impl Into<String>, column: impl Into<String>, reason: impl Into<String>) -> Self {
        SchemaError {
            source_name: Some(source.into()),
            column: Some(column.into()),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the upstream protocol handler (§4.2, §7).
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection drop, decode hiccup, or idle timeout. Recovered by
    /// reconnect; never surfaced directly to subscribers.
    #[error("transient upstream error: {0}")]
    Transient(String),
    /// Unrecognized wire format for a declared column type, or
    /// authentication failure. Fatal to the source.
    #[error("fatal upstream error: {0}")]
    Fatal(String),
}

/// Terminal errors a subscription pipeline can end with (§6, §7). Maps
/// 1:1 onto the wire-level `TerminalErrorCode`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("upstream resync in progress, re-subscribe for a fresh snapshot")]
    UpstreamResync,
    #[error("subscriber fell behind and was disconnected")]
    SubscriberLagged,
    #[error("source is shutting down")]
    SourceShutdown,
}

impl PipelineError {
    pub fn code(&self) -> TerminalErrorCode {
        match self {
            PipelineError::UpstreamResync => TerminalErrorCode::UpstreamResync,
            PipelineError::SubscriberLagged => TerminalErrorCode::SubscriberLagged,
            PipelineError::SourceShutdown => TerminalErrorCode::SourceShutdown,
        }
    }
}

/// A trigger's outbound webhook queue overflowed. The trigger is disposed;
/// the source is unaffected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("trigger {trigger_name:?} webhook queue overflowed and was disposed")]
pub struct TriggerOverflow {
    pub trigger_name: String,
}
