//! YAML source-schema loader and CLI (§6's schema loader collaborator,
//! expanded here since a runnable binary needs one).
//!
//! Validation mirrors the `Raw* -> validated` two-pass pattern used for the
//! teacher's forwarder config, swapped from TOML to YAML and from reader
//! targets to source/upstream descriptors.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tycostream_protocol::{ColumnDef, Source};

use crate::error::SchemaError;

/// `tycostream` — streaming gateway in front of a Materialize/PostgreSQL
/// `SUBSCRIBE` source.
#[derive(Debug, Parser)]
#[command(name = "tycostream", version)]
pub struct Cli {
    /// Path to the source-schema YAML file.
    #[arg(long, short = 'c', default_value = "/etc/tycostream/sources.yaml")]
    pub config: PathBuf,

    /// Override the log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Address the subscription API listens on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind_addr: String,
}

/// One configured source: its immutable schema plus the knobs governing its
/// upstream protocol handler.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub schema: Source,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// PostgreSQL/Materialize connection string.
    pub dsn: String,
    /// The relation (view/table) name passed to `SUBSCRIBE`.
    pub relation: String,
    /// Rows requested per `FETCH`.
    pub fetch_size: u32,
    /// Idle liveness timeout (§4.2, §9); exceeding it triggers a reconnect.
    pub idle_timeout: Duration,
    /// Initial reconnect backoff.
    pub reconnect_initial_backoff: Duration,
    /// Reconnect backoff cap.
    pub reconnect_max_backoff: Duration,
    /// Per-subscriber output queue capacity (§4.6).
    pub queue_capacity: usize,
}

/// A trigger registered statically at startup (§4.5). Triggers may also be
/// registered at runtime through the API; this is the config-driven path.
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    pub name: String,
    pub source: String,
    pub r#match: tycostream_protocol::Predicate,
    pub unmatch: Option<tycostream_protocol::Predicate>,
    pub webhook_url: String,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub sources: Vec<SourceSpec>,
    pub triggers: Vec<TriggerSpec>,
    /// Named enums columns may reference by `enum_ref` (§4.1), keyed by name
    /// to the allowed string values. Purely descriptive for this core, same
    /// as `ColumnDef::enum_ref` itself — enforcement of a row's actual
    /// values against its enum is a schema-loader-only concern.
    pub enums: HashMap<String, Vec<String>>,
}

impl GatewayConfig {
    pub fn source(&self, name: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| s.schema.name == name)
    }
}

// ---------------------------------------------------------------------------
// Raw YAML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    sources: Vec<RawSource>,
    #[serde(default)]
    triggers: Vec<RawTrigger>,
    #[serde(default)]
    enums: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    name: String,
    primary_key: String,
    columns: Vec<RawColumn>,
    dsn: String,
    #[serde(default)]
    relation: Option<String>,
    #[serde(default)]
    fetch_size: Option<u32>,
    #[serde(default)]
    idle_timeout_secs: Option<u64>,
    #[serde(default)]
    reconnect_initial_backoff_ms: Option<u64>,
    #[serde(default)]
    reconnect_max_backoff_secs: Option<u64>,
    #[serde(default)]
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    name: String,
    r#type: tycostream_protocol::DataType,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    r#enum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTrigger {
    name: String,
    source: String,
    r#match: tycostream_protocol::Predicate,
    #[serde(default)]
    unmatch: Option<tycostream_protocol::Predicate>,
    webhook_url: String,
    #[serde(default)]
    max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_from_path(path: &Path) -> Result<GatewayConfig, SchemaError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SchemaError::new(None, format!("reading config file '{}': {e}", path.display()))
    })?;
    load_from_str(&text)
}

pub fn load_from_str(yaml: &str) -> Result<GatewayConfig, SchemaError> {
    let raw: RawConfig =
        serde_yaml::from_str(yaml).map_err(|e| SchemaError::new(None, format!("parsing YAML: {e}")))?;

    if raw.sources.is_empty() {
        return Err(SchemaError::new(None, "at least one source must be configured"));
    }

    let mut seen_names = HashSet::new();
    let mut sources = Vec::with_capacity(raw.sources.len());
    for raw_source in raw.sources {
        if !seen_names.insert(raw_source.name.clone()) {
            return Err(SchemaError::new(
                raw_source.name.clone(),
                "duplicate source name",
            ));
        }
        sources.push(validate_source(raw_source, &raw.enums)?);
    }

    let mut triggers = Vec::with_capacity(raw.triggers.len());
    let mut seen_trigger_names: HashSet<(String, String)> = HashSet::new();
    for raw_trigger in raw.triggers {
        let source_spec = sources
            .iter()
            .find(|s| s.schema.name == raw_trigger.source)
            .ok_or_else(|| {
                SchemaError::new(
                    raw_trigger.source.clone(),
                    format!("trigger '{}' references unknown source", raw_trigger.name),
                )
            })?;
        if !seen_trigger_names.insert((raw_trigger.source.clone(), raw_trigger.name.clone())) {
            return Err(SchemaError::new(
                raw_trigger.source.clone(),
                format!("duplicate trigger name '{}' for this source", raw_trigger.name),
            ));
        }
        validate_predicate_columns(&raw_trigger.r#match, &source_spec.schema)?;
        if let Some(unmatch) = &raw_trigger.unmatch {
            validate_predicate_columns(unmatch, &source_spec.schema)?;
        }
        triggers.push(TriggerSpec {
            name: raw_trigger.name,
            source: raw_trigger.source,
            r#match: raw_trigger.r#match,
            unmatch: raw_trigger.unmatch,
            webhook_url: raw_trigger.webhook_url,
            retry: RetryConfig {
                max_attempts: raw_trigger.max_attempts.unwrap_or_default().max(1),
                ..RetryConfig::default()
            },
        });
    }

    Ok(GatewayConfig { sources, triggers, enums: raw.enums })
}

fn validate_source(raw: RawSource, enums: &HashMap<String, Vec<String>>) -> Result<SourceSpec, SchemaError> {
    if raw.columns.is_empty() {
        return Err(SchemaError::new(raw.name, "source must declare at least one column"));
    }

    let mut seen_columns = HashSet::new();
    let mut columns = Vec::with_capacity(raw.columns.len());
    for col in raw.columns {
        if !seen_columns.insert(col.name.clone()) {
            return Err(SchemaError::column(raw.name.clone(), col.name, "duplicate column"));
        }
        if let Some(enum_ref) = &col.r#enum {
            if !enums.contains_key(enum_ref) {
                return Err(SchemaError::column(
                    raw.name.clone(),
                    col.name,
                    format!("references undeclared enum '{enum_ref}'"),
                ));
            }
        }
        columns.push(ColumnDef {
            name: col.name,
            data_type: col.r#type,
            nullable: col.nullable,
            enum_ref: col.r#enum,
        });
    }

    if !columns.iter().any(|c| c.name == raw.primary_key) {
        return Err(SchemaError::new(
            raw.name,
            format!("primary key column '{}' not found among declared columns", raw.primary_key),
        ));
    }

    let schema = Source {
        name: raw.name.clone(),
        primary_key_column: raw.primary_key,
        columns,
    };

    let upstream = UpstreamConfig {
        dsn: raw.dsn,
        relation: raw.relation.unwrap_or_else(|| raw.name.clone()),
        fetch_size: raw.fetch_size.unwrap_or(1000),
        idle_timeout: Duration::from_secs(raw.idle_timeout_secs.unwrap_or(60)),
        reconnect_initial_backoff: Duration::from_millis(raw.reconnect_initial_backoff_ms.unwrap_or(200)),
        reconnect_max_backoff: Duration::from_secs(raw.reconnect_max_backoff_secs.unwrap_or(30)),
        queue_capacity: raw.queue_capacity.unwrap_or(1024),
    };

    Ok(SourceSpec { schema, upstream })
}

fn validate_predicate_columns(
    predicate: &tycostream_protocol::Predicate,
    source: &Source,
) -> Result<(), SchemaError> {
    for column in predicate.dependent_columns() {
        if source.column(&column).is_none() {
            return Err(SchemaError::column(
                source.name.clone(),
                column,
                "predicate references unknown column",
            ));
        }
    }
    Ok(())
}
