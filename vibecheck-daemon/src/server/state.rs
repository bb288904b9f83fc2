//! Shared application state for the server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::audit::AuditSink;
use crate::events::Broadcaster;
use crate::pipeline::Engine;
use crate::storage::AnalysisRepository;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Pipeline engine accepting submissions
    pub engine: Engine,
    /// Audit records, read back by the tool-call listing
    pub audit_sink: Arc<dyn AuditSink>,
    /// Server start time
    pub start_time: Instant,
    /// Open WebSocket connections
    pub ws_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(engine: Engine, audit_sink: Arc<dyn AuditSink>) -> Self {
        Self {
            engine,
            audit_sink,
            start_time: Instant::now(),
            ws_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn repository(&self) -> &Arc<dyn AnalysisRepository> {
        self.engine.repository()
    }

    pub fn events(&self) -> &Arc<Broadcaster> {
        self.engine.events()
    }

    pub fn ws_connect(&self) {
        self.ws_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn ws_disconnect(&self) {
        self.ws_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}
