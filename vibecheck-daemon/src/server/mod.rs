//! HTTP server for the vibecheck daemon.
//!
//! Provides:
//! - Health, integration and status checks
//! - Analysis submission
//! - Result retrieval (record, findings, fixes, graph views, chains, blast
//!   radius, tool calls)
//! - A WebSocket stream of live events per analysis

mod http;
pub mod state;
mod websocket;

pub use http::create_router;
pub use state::AppState;
