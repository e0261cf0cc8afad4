//! HTTP API: job submission, retry, status, and the per-user realtime stream.

pub mod app;
pub mod context;
pub mod middleware;
