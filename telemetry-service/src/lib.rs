pub mod channel;
pub mod config;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod query_api;
pub mod retry;
pub mod simulation;
pub mod sinks;
pub mod transform;

pub use pipeline::{Envelope, Pipeline};
