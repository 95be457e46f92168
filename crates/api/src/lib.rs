//! HTTP API: the bridge-facing surface over `finadvisor-ai`.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
