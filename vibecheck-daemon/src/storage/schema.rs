//! DuckDB schema for the vibecheck store.

/// SQL schema for creating the store tables.
pub const SCHEMA_SQL: &str = r#"
-- Knowledge graph, scoped per analysis
CREATE TABLE IF NOT EXISTS graph_nodes (
    analysis_id VARCHAR NOT NULL,
    id VARCHAR NOT NULL,
    type VARCHAR NOT NULL,
    label VARCHAR NOT NULL,
    path VARCHAR,
    version VARCHAR,
    severity VARCHAR,
    finding_count INTEGER DEFAULT 0,
    properties JSON,
    PRIMARY KEY (analysis_id, id)
);

CREATE TABLE IF NOT EXISTS graph_edges (
    analysis_id VARCHAR NOT NULL,
    id VARCHAR NOT NULL,
    source_id VARCHAR NOT NULL,
    target_id VARCHAR NOT NULL,
    type VARCHAR NOT NULL,
    is_vulnerability_chain BOOLEAN DEFAULT FALSE,
    chain_id VARCHAR,
    PRIMARY KEY (analysis_id, id)
);

-- Append-only audit trail of capability invocations
CREATE TABLE IF NOT EXISTS tool_calls (
    id VARCHAR PRIMARY KEY,
    analysis_id VARCHAR NOT NULL,
    tool_name VARCHAR NOT NULL,
    step_name VARCHAR NOT NULL,
    endpoint VARCHAR NOT NULL,
    request_payload JSON,
    response_payload JSON,
    latency_ms BIGINT DEFAULT 0,
    status VARCHAR NOT NULL,
    error_message VARCHAR,
    created_at VARCHAR NOT NULL
);

-- Analysis records, stored whole
CREATE TABLE IF NOT EXISTS analyses (
    analysis_id VARCHAR PRIMARY KEY,
    status VARCHAR NOT NULL,
    record JSON NOT NULL,
    updated_at VARCHAR NOT NULL
);

-- Metadata table: schema version
CREATE TABLE IF NOT EXISTS metadata (
    key VARCHAR PRIMARY KEY,
    value VARCHAR
);

CREATE INDEX IF NOT EXISTS idx_graph_edges_source ON graph_edges(analysis_id, source_id);
CREATE INDEX IF NOT EXISTS idx_tool_calls_analysis ON tool_calls(analysis_id);
CREATE INDEX IF NOT EXISTS idx_analyses_status ON analyses(status);
"#;

/// Schema version stored in `metadata`.
pub const SCHEMA_VERSION: &str = "1.0.0";
