//! Upstream protocol handling: decoding `SUBSCRIBE` wire output and driving
//! the per-source reconnect state machine (§4.2, §9).

pub mod handler;
pub mod wire;

pub use handler::run;
