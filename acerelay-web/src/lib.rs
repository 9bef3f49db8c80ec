//! Acerelay Web - Streaming and probe API server
//!
//! Serves multiplexed engine streams to HTTP clients and exposes probe
//! history, metrics and channel quality rankings as JSON.

pub mod handlers;
pub mod server;

// Re-export main types
pub use server::{AppState, ServerError, build_router, run_server, serve};
