// tycostream-protocol: data model and wire types shared between the
// streaming core and its external collaborators (the subscription API
// transport, the webhook sink, the schema loader).
//
// Nothing in here touches I/O; it is the vocabulary the rest of the crate
// is built on.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod value;
pub use value::ColumnValue;

// ---------------------------------------------------------------------------
// Schema model (§3, §4.1)
// ---------------------------------------------------------------------------

/// The fixed column type taxonomy a source's schema is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    BigInt,
    Float,
    String,
    Uuid,
    Timestamp,
    Date,
    Time,
    Boolean,
    Json,
    Array,
}

/// One column of a source, as declared in the schema registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
    /// Name of an enum binding this column's string values are drawn from,
    /// if any. Purely descriptive for this core; enforcement is the schema
    /// loader's concern.
    #[serde(default)]
    pub enum_ref: Option<String>,
}

/// Immutable descriptor for one upstream source. Produced by the schema
/// registry at load time and never mutated afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub primary_key_column: String,
    pub columns: Vec<ColumnDef>,
}

impl Source {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> &ColumnDef {
        self.column(&self.primary_key_column)
            .expect("schema registry validates the primary key exists at load time")
    }
}

// ---------------------------------------------------------------------------
// Rows (§3)
// ---------------------------------------------------------------------------

/// A row's primary-key value, reduced to a hashable/orderable key.
///
/// The cache and every membership map are keyed on this rather than on
/// `ColumnValue` directly, since `ColumnValue::Float` has no total order.
/// Keys derived from non-numeric/non-string primary keys use the value's
/// canonical string form, which is stable for every type in the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(pub String);

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable row: a mapping from column name to typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row(pub std::collections::BTreeMap<String, ColumnValue>);

impl Row {
    pub fn new() -> Self {
        Row(std::collections::BTreeMap::new())
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.0.get(column)
    }

    pub fn key(&self, pk_column: &str) -> Key {
        Key(self
            .0
            .get(pk_column)
            .map(ColumnValue::canonical_key)
            .unwrap_or_default())
    }

    /// Columns whose value differs between `self` (pre-state) and `other`
    /// (post-state), excluding `exclude` (normally the primary key).
    pub fn diff(&self, other: &Row, exclude: &str) -> HashSet<String> {
        let mut changed = HashSet::new();
        for (col, new_val) in &other.0 {
            if col == exclude {
                continue;
            }
            match self.0.get(col) {
                Some(old_val) if old_val == new_val => {}
                _ => {
                    changed.insert(col.clone());
                }
            }
        }
        for col in self.0.keys() {
            if col != exclude && !other.0.contains_key(col) {
                changed.insert(col.clone());
            }
        }
        changed
    }

    /// A projection containing only `pk_column` plus `fields`.
    pub fn project(&self, pk_column: &str, fields: &HashSet<String>) -> Row {
        let mut out = std::collections::BTreeMap::new();
        if let Some(pk) = self.0.get(pk_column) {
            out.insert(pk_column.to_owned(), pk.clone());
        }
        for field in fields {
            if let Some(v) = self.0.get(field) {
                out.insert(field.clone(), v.clone());
            }
        }
        Row(out)
    }

    pub fn only_key(&self, pk_column: &str) -> Row {
        let mut out = std::collections::BTreeMap::new();
        if let Some(pk) = self.0.get(pk_column) {
            out.insert(pk_column.to_owned(), pk.clone());
        }
        Row(out)
    }
}

impl Default for Row {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Row events (§3, §4.2)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Insert,
    Update,
    Delete,
}

/// An opaque, monotonically non-decreasing marker attached by the upstream
/// protocol handler. Delimits the snapshot from the live tail (§4.2, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Frontier(pub u64);

impl Frontier {
    pub const MIN: Frontier = Frontier(0);
}

impl fmt::Display for Frontier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logical row-level change, already coalesced per §4.2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    pub kind: RowKind,
    pub key: Key,
    pub row_after: Row,
    /// Populated only for `Update`; the primary key is never included.
    pub changed_fields: Option<HashSet<String>>,
    pub frontier_token: Frontier,
}

// ---------------------------------------------------------------------------
// Filter predicates (§4.4, §9)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A row-local boolean predicate tree. Pure and side-effect free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    Compare {
        column: String,
        op: CompareOp,
        literal: ColumnValue,
    },
}

impl Predicate {
    /// Evaluate against a row. Missing or null columns make a `Compare`
    /// false rather than erroring — a predicate never panics on a partial
    /// row (e.g. a delete's row_after carrying only the key).
    pub fn evaluate(&self, row: &Row) -> bool {
        match self {
            Predicate::And(a, b) => a.evaluate(row) && b.evaluate(row),
            Predicate::Or(a, b) => a.evaluate(row) || b.evaluate(row),
            Predicate::Not(p) => !p.evaluate(row),
            Predicate::Compare { column, op, literal } => match row.get(column) {
                Some(value) => value.compare(op, literal),
                None => false,
            },
        }
    }

    /// The set of columns this predicate reads, used to skip re-evaluation
    /// when an update's changed fields are disjoint from it (§4.4).
    pub fn dependent_columns(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut HashSet<String>) {
        match self {
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Predicate::Not(p) => p.collect_columns(out),
            Predicate::Compare { column, .. } => {
                out.insert(column.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription API contract (§6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMode {
    FullRow,
    Delta,
}

/// A filter as carried over the wire: a match predicate plus an optional
/// unmatch predicate (§4.4's hysteresis band).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub r#match: Predicate,
    #[serde(default)]
    pub unmatch: Option<Predicate>,
}

/// Control frame opening a subscription over the API transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub source: String,
    #[serde(default)]
    pub filter: Option<FilterSpec>,
    pub mode: ProjectionMode,
    pub include_snapshot: bool,
}

/// One event delivered to an API subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEvent {
    pub kind: RowKind,
    pub row: Row,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<HashSet<String>>,
}

/// Terminal error codes a subscription stream can end with (§6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalErrorCode {
    UpstreamResync,
    SubscriberLagged,
    SourceShutdown,
}

impl fmt::Display for TerminalErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalErrorCode::UpstreamResync => "UPSTREAM_RESYNC",
            TerminalErrorCode::SubscriberLagged => "SUBSCRIBER_LAGGED",
            TerminalErrorCode::SourceShutdown => "SOURCE_SHUTDOWN",
        };
        write!(f, "{s}")
    }
}

/// Frame sent down an API stream when it ends abnormally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiTerminalError {
    pub code: TerminalErrorCode,
    pub message: String,
}

/// Request to register a trigger (§4.5, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegisterRequest {
    pub name: String,
    pub source: String,
    pub r#match: Predicate,
    #[serde(default)]
    pub unmatch: Option<Predicate>,
    pub webhook_url: String,
}

// ---------------------------------------------------------------------------
// Webhook payload (§4.5, §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerEventType {
    Fire,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_type: TriggerEventType,
    pub trigger_name: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: Option<Row>,
}
