//! tycostream: a read-only streaming gateway in front of Materialize/
//! PostgreSQL `SUBSCRIBE` views, fanning out live filterable per-client row
//! streams and firing webhooks on filter membership transitions.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod schema;
pub mod subscriber;
pub mod trigger;
pub mod upstream;
pub mod webhook;
