//! vibecheck daemon library.
//!
//! This library provides:
//! - The analysis pipeline engine and its stages
//! - Capability providers (reasoning, classification, research) with
//!   ordered fallback and audit logging
//! - Storage (DuckDB graph backend, audit sink, analysis repository)
//! - Per-analysis live event broadcasting
//! - The HTTP/WebSocket surface

pub mod audit;
pub mod capability;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod server;
pub mod storage;
