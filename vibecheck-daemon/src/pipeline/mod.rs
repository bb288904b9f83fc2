//! The analysis pipeline.
//!
//! [`Engine`] drives an analysis through cloning, mapping, analysis and
//! completion. Stage logic lives in [`stages`]; provider access goes
//! through [`crate::capability`].

mod clone;
mod engine;
mod persist;
pub mod stages;

pub use clone::{Cloner, GitCloner};
pub use engine::{Engine, EngineDeps, Submission, EVENT_ERROR_CHARS, MAX_ERROR_CHARS};
pub use persist::persist_graph;
