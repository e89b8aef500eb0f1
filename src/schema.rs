//! Schema registry (§4.1).
//!
//! Schemas are resolved once at startup from [`crate::config::GatewayConfig`]
//! and never mutate afterward; every other module borrows `Source`s from
//! here rather than holding its own copy.

use std::collections::HashMap;

use tycostream_protocol::Source;

use crate::config::GatewayConfig;
use crate::error::SchemaError;

#[derive(Debug)]
pub struct SchemaRegistry {
    sources: HashMap<String, Source>,
}

impl SchemaRegistry {
    /// Build a registry from a loaded config. `GatewayConfig` has already
    /// validated each source in isolation (§4.1's per-source checks); this
    /// just indexes them for lookup.
    pub fn new(config: &GatewayConfig) -> Self {
        let sources = config
            .sources
            .iter()
            .map(|spec| (spec.schema.name.clone(), spec.schema.clone()))
            .collect();
        SchemaRegistry { sources }
    }

    pub fn lookup(&self, name: &str) -> Result<&Source, SchemaError> {
        self.sources
            .get(name)
            .ok_or_else(|| SchemaError::new(name.to_owned(), "no such source"))
    }

    pub fn all_sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }
}
