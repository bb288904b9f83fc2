//! Vibecheck Core - domain model and local analysis for repository audits.
//!
//! This crate holds everything an audit run computes without talking to the
//! outside world. The daemon crate wraps it with external capabilities,
//! persistence and event streaming.
//!
//! # Features
//!
//! - **Metadata ingestion**: gitignore-aware parallel walk, line counts, manifest parsing
//! - **Finding aggregation**: merge per-stage findings into one canonical list
//! - **Health scoring**: deterministic 0-100 score with letter grade and breakdown
//! - **Knowledge graph**: directory/file/package/finding/CVE/fix graph with stable ids
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use vibecheck_core::{graph, scanner, score};
//!
//! let metadata = scanner::ingest(Path::new("."), &scanner::IngestOptions::default()).unwrap();
//! let findings = score::merge(vec![Vec::new()]);
//! let health = score::score(&findings, &metadata.stats);
//! let graph = graph::build_graph(&metadata, &findings, &[]);
//! println!("{} ({}) - {} nodes", health.overall, health.letter_grade, graph.node_count());
//! ```

pub mod graph;
pub mod scanner;
pub mod score;
pub mod types;

pub use graph::{
    build_graph, ChainStep, Graph, GraphEdge, GraphNode, GraphPersistence, GraphView,
    VulnerabilityChain,
};
pub use score::{merge, score, FindingsSummary, HealthScore};
pub use types::*;

/// Version of the vibecheck core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
