//! Knowledge graph model and builder.
//!
//! Converts ingested repository metadata plus the merged findings and fixes
//! into a node/edge graph:
//!
//! ```text
//! dir:/ -contains-> dir:src -contains-> file:src/app.py <-affects- finding:F1 -has_cve-> cve:CVE-..
//!                                                                     ^
//!                                                   fix:X1 -resolves--'
//! pkg:<name>   (one per declared dependency)
//! ```
//!
//! Node and edge ids are derived from logical identity only (a path, a
//! package name, a finding id), so building the same inputs twice yields
//! the same ids and re-persisting is an idempotent upsert.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

use crate::types::{BlastRadius, Dependency, FileEntry, Finding, Fix, RepoMetadata, Severity};

/// Id of the synthetic root directory.
pub const ROOT_NODE_ID: &str = "dir:/";

/// Hops followed when sizing the reach of a chain.
pub const CHAIN_REACH_DEPTH: usize = 3;

/// Types of nodes in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Directory,
    File,
    Package,
    Finding,
    Cve,
    Fix,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Directory => "directory",
            NodeType::File => "file",
            NodeType::Package => "package",
            NodeType::Finding => "finding",
            NodeType::Cve => "cve",
            NodeType::Fix => "fix",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "directory" => Some(NodeType::Directory),
            "file" => Some(NodeType::File),
            "package" => Some(NodeType::Package),
            "finding" => Some(NodeType::Finding),
            "cve" => Some(NodeType::Cve),
            "fix" => Some(NodeType::Fix),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Types of relationships between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Directory→Directory, Directory→File
    Contains,
    Imports,
    DependsOn,
    Calls,
    /// Finding→File
    Affects,
    /// Finding→CVE
    HasCve,
    /// Fix→Finding
    Resolves,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Contains => "contains",
            EdgeType::Imports => "imports",
            EdgeType::DependsOn => "depends_on",
            EdgeType::Calls => "calls",
            EdgeType::Affects => "affects",
            EdgeType::HasCve => "has_cve",
            EdgeType::Resolves => "resolves",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "contains" => Some(EdgeType::Contains),
            "imports" => Some(EdgeType::Imports),
            "depends_on" => Some(EdgeType::DependsOn),
            "calls" => Some(EdgeType::Calls),
            "affects" => Some(EdgeType::Affects),
            "has_cve" => Some(EdgeType::HasCve),
            "resolves" => Some(EdgeType::Resolves),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    pub path: Option<String>,
    pub version: Option<String>,
    pub severity: Option<Severity>,
    pub finding_count: u32,
    /// Additional properties (language, line count, priority, ...)
    pub properties: Option<serde_json::Value>,
}

impl GraphNode {
    pub fn new(id: String, node_type: NodeType, label: impl Into<String>) -> Self {
        Self {
            id,
            node_type,
            label: label.into(),
            path: None,
            version: None,
            severity: None,
            finding_count: 0,
            properties: None,
        }
    }

    /// Set properties on the node.
    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// An edge (relationship) in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub is_vulnerability_chain: bool,
    pub chain_id: Option<String>,
}

impl GraphEdge {
    /// Create a new edge. The id is a function of its endpoints and type.
    pub fn new(source: &str, target: &str, edge_type: EdgeType) -> Self {
        Self {
            id: format!("edge:{}:{}:{}", source, edge_type.as_str(), target),
            source: source.to_string(),
            target: target.to_string(),
            edge_type,
            is_vulnerability_chain: false,
            chain_id: None,
        }
    }

    /// Mark the edge as part of a vulnerability chain.
    pub fn in_chain(mut self, chain_id: &str) -> Self {
        self.is_vulnerability_chain = true;
        self.chain_id = Some(chain_id.to_string());
        self
    }
}

/// How a built graph was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GraphPersistence {
    /// Written incrementally to the graph backend.
    #[serde(rename_all = "camelCase")]
    Backend {
        nodes_written: u32,
        edges_written: u32,
        failed_writes: u32,
    },
    /// Backend unreachable; the node/edge list lives only in the analysis record.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("duplicate edge id: {0}")]
    DuplicateEdge(String),
    #[error("edge {edge} references missing node {node}")]
    DanglingEdge { edge: String, node: String },
}

/// Edge subset a client asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphView {
    /// Directory tree only.
    Structure,
    /// Code and package relationships.
    Dependencies,
    /// Every edge.
    Vulnerabilities,
}

impl GraphView {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphView::Structure => "structure",
            GraphView::Dependencies => "dependencies",
            GraphView::Vulnerabilities => "vulnerabilities",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "structure" => Some(GraphView::Structure),
            "dependencies" => Some(GraphView::Dependencies),
            "vulnerabilities" => Some(GraphView::Vulnerabilities),
            _ => None,
        }
    }

    pub fn keeps(&self, edge_type: EdgeType) -> bool {
        match self {
            GraphView::Structure => edge_type == EdgeType::Contains,
            GraphView::Dependencies => matches!(
                edge_type,
                EdgeType::Imports | EdgeType::DependsOn | EdgeType::Calls
            ),
            GraphView::Vulnerabilities => true,
        }
    }

    /// Layout hint for renderers: `(algorithm, direction)`.
    pub fn layout(&self) -> (&'static str, &'static str) {
        match self {
            GraphView::Structure => ("dagre", "TB"),
            GraphView::Dependencies | GraphView::Vulnerabilities => ("cose-bilkent", ""),
        }
    }
}

impl fmt::Display for GraphView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One finding along a vulnerability chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStep {
    #[serde(rename = "type")]
    pub step_type: String,
    pub node: String,
    pub file: Option<String>,
    pub cve: Option<String>,
    pub description: String,
}

/// Findings linked by a shared chain id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityChain {
    pub id: String,
    pub severity: Severity,
    pub description: String,
    pub steps: Vec<ChainStep>,
    pub blast_radius: BlastRadius,
    /// Fix resolving the most chain members; empty when none does.
    pub keystone_fix: String,
    pub finding_ids: Vec<String>,
}

/// A built knowledge graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Graph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    /// Direct children of a directory via `contains` edges, in build order.
    pub fn children(&self, id: &str) -> Vec<&GraphNode> {
        self.edges
            .iter()
            .filter(|e| e.edge_type == EdgeType::Contains && e.source == id)
            .filter_map(|e| self.node(&e.target))
            .collect()
    }

    /// All nodes with only the edges `view` keeps.
    pub fn view(&self, view: GraphView) -> Graph {
        Graph {
            nodes: self.nodes.clone(),
            edges: self
                .edges
                .iter()
                .filter(|e| view.keeps(e.edge_type))
                .cloned()
                .collect(),
        }
    }

    /// Nodes reachable from `starts` over outgoing edges within `depth`
    /// hops. The starts themselves are excluded.
    fn reach<'a>(&'a self, starts: &[&'a str], depth: usize) -> HashSet<&'a str> {
        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            outgoing.entry(edge.source.as_str()).or_default().push(edge.target.as_str());
        }

        let mut seen: HashSet<&str> = starts.iter().copied().collect();
        let mut reached = HashSet::new();
        let mut queue: VecDeque<(&str, usize)> = starts.iter().map(|s| (*s, 0)).collect();
        while let Some((id, hops)) = queue.pop_front() {
            if hops == depth {
                continue;
            }
            for &next in outgoing.get(id).into_iter().flatten() {
                if seen.insert(next) {
                    reached.insert(next);
                    queue.push_back((next, hops + 1));
                }
            }
        }
        reached
    }

    fn radius_of(&self, reached: &HashSet<&str>) -> BlastRadius {
        let files_affected = reached
            .iter()
            .filter_map(|id| self.node(id))
            .filter(|n| n.node_type == NodeType::File)
            .count();
        BlastRadius {
            files_affected: files_affected as u32,
            ..Default::default()
        }
    }

    /// Files reachable from `node_id` within `depth` hops. `None` for an
    /// unknown node.
    ///
    /// The graph has no function or endpoint nodes, so only
    /// `files_affected` is ever non-zero.
    pub fn blast_radius(&self, node_id: &str, depth: usize) -> Option<BlastRadius> {
        if !self.has_node(node_id) {
            return None;
        }
        Some(self.radius_of(&self.reach(&[node_id], depth)))
    }

    /// Vulnerability chains, one per chain id on the edges, ordered by id.
    pub fn chains(&self) -> Vec<VulnerabilityChain> {
        let mut members: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in self.edges.iter().filter(|e| e.is_vulnerability_chain) {
            let Some(chain_id) = edge.chain_id.as_deref() else {
                continue;
            };
            let ids = members.entry(chain_id).or_default();
            let is_finding = self
                .node(&edge.source)
                .is_some_and(|n| n.node_type == NodeType::Finding);
            if is_finding && !ids.contains(&edge.source.as_str()) {
                ids.push(edge.source.as_str());
            }
        }

        members
            .into_iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(chain_id, ids)| self.chain(chain_id, &ids))
            .collect()
    }

    fn chain(&self, chain_id: &str, ids: &[&str]) -> VulnerabilityChain {
        let findings: Vec<&GraphNode> = ids.iter().filter_map(|id| self.node(id)).collect();
        let severity = findings
            .iter()
            .filter_map(|n| n.severity)
            .max()
            .unwrap_or(Severity::Info);

        let target_of = |source: &str, edge_type: EdgeType| {
            self.edges
                .iter()
                .find(|e| e.source == source && e.edge_type == edge_type)
                .and_then(|e| self.node(&e.target))
        };
        let steps: Vec<ChainStep> = findings
            .iter()
            .map(|n| ChainStep {
                step_type: n
                    .properties
                    .as_ref()
                    .and_then(|p| p.get("type"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("finding")
                    .to_string(),
                node: n.id.clone(),
                file: target_of(&n.id, EdgeType::Affects).and_then(|f| f.path.clone()),
                cve: target_of(&n.id, EdgeType::HasCve).map(|c| c.label.clone()),
                description: n.label.clone(),
            })
            .collect();

        // Fix nodes that resolve the most members, first in build order on ties.
        let mut keystone: Option<(&str, usize)> = None;
        for fix in self.nodes.iter().filter(|n| n.node_type == NodeType::Fix) {
            let resolved = self
                .edges
                .iter()
                .filter(|e| {
                    e.source == fix.id
                        && e.edge_type == EdgeType::Resolves
                        && ids.contains(&e.target.as_str())
                })
                .count();
            if resolved > 0 && keystone.map_or(true, |(_, best)| resolved > best) {
                keystone = Some((fix.id.as_str(), resolved));
            }
        }

        VulnerabilityChain {
            id: chain_id.to_string(),
            severity,
            description: findings
                .iter()
                .map(|n| n.label.as_str())
                .collect::<Vec<_>>()
                .join(" -> "),
            steps,
            blast_radius: self.radius_of(&self.reach(ids, CHAIN_REACH_DEPTH)),
            keystone_fix: keystone
                .map(|(id, _)| id.trim_start_matches("fix:").to_string())
                .unwrap_or_default(),
            finding_ids: ids
                .iter()
                .map(|id| id.trim_start_matches("finding:").to_string())
                .collect(),
        }
    }

    /// Check that ids are unique and every edge endpoint exists.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut node_ids = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }
        let mut edge_ids = HashSet::with_capacity(self.edges.len());
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(GraphError::DuplicateEdge(edge.id.clone()));
            }
            for endpoint in [&edge.source, &edge.target] {
                if !node_ids.contains(endpoint.as_str()) {
                    return Err(GraphError::DanglingEdge {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Build the knowledge graph for one analysis.
pub fn build_graph(metadata: &RepoMetadata, findings: &[Finding], fixes: &[Fix]) -> Graph {
    let mut builder = GraphBuilder::new(findings);
    for file in &metadata.files {
        builder.add_file(file);
    }
    for dependency in &metadata.dependencies {
        builder.add_package(dependency);
    }
    for finding in findings {
        builder.add_finding(finding);
    }
    for fix in fixes {
        builder.add_fix(fix);
    }
    builder.finish()
}

/// Per-file rollup of the findings that reference it.
#[derive(Debug, Clone, Copy)]
struct FileHits {
    count: u32,
    worst: Severity,
}

/// Incremental graph builder.
///
/// Keeps a memoized directory path → node id index so each directory in a
/// file's parent chain is materialized exactly once.
pub struct GraphBuilder {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    node_index: HashMap<String, usize>,
    edge_ids: HashSet<String>,
    directories: HashMap<String, String>,
    file_hits: HashMap<String, FileHits>,
}

impl GraphBuilder {
    /// Start a graph with its synthetic root. `findings` are only used to
    /// annotate file and directory nodes with counts and worst severity.
    pub fn new(findings: &[Finding]) -> Self {
        let mut file_hits: HashMap<String, FileHits> = HashMap::new();
        for finding in findings {
            let unique: HashSet<String> = finding
                .location
                .files
                .iter()
                .filter_map(|p| normalize_path(p))
                .collect();
            for path in unique {
                file_hits
                    .entry(path)
                    .and_modify(|hits| {
                        hits.count += 1;
                        hits.worst = hits.worst.max(finding.severity);
                    })
                    .or_insert(FileHits {
                        count: 1,
                        worst: finding.severity,
                    });
            }
        }

        let mut builder = Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            node_index: HashMap::new(),
            edge_ids: HashSet::new(),
            directories: HashMap::new(),
            file_hits,
        };
        let mut root = GraphNode::new(ROOT_NODE_ID.to_string(), NodeType::Directory, "/");
        root.path = Some("/".to_string());
        builder.push_node(root);
        builder.directories.insert(String::new(), ROOT_NODE_ID.to_string());
        builder
    }

    fn push_node(&mut self, node: GraphNode) -> bool {
        if self.node_index.contains_key(&node.id) {
            return false;
        }
        self.node_index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        true
    }

    fn push_edge(&mut self, edge: GraphEdge) {
        if self.node_index.contains_key(&edge.source)
            && self.node_index.contains_key(&edge.target)
            && self.edge_ids.insert(edge.id.clone())
        {
            self.edges.push(edge);
        }
    }

    /// Materialize a directory and its parent chain, returning its node id.
    fn ensure_directory(&mut self, path: &str) -> String {
        if let Some(id) = self.directories.get(path) {
            return id.clone();
        }
        let (parent_path, name) = split_parent(path);
        let parent_id = self.ensure_directory(parent_path);

        let id = format!("dir:{}", path);
        let mut node = GraphNode::new(id.clone(), NodeType::Directory, name);
        node.path = Some(path.to_string());
        self.push_node(node);
        self.push_edge(GraphEdge::new(&parent_id, &id, EdgeType::Contains));
        self.directories.insert(path.to_string(), id.clone());
        id
    }

    /// Add a file node under its directory chain. Returns the file node id,
    /// or `None` for an empty path.
    pub fn add_file(&mut self, file: &FileEntry) -> Option<String> {
        let path = normalize_path(&file.path)?;
        let id = format!("file:{}", path);
        if self.node_index.contains_key(&id) {
            return Some(id);
        }

        let (parent_path, name) = split_parent(&path);
        let parent_id = self.ensure_directory(parent_path);

        let mut node = GraphNode::new(id.clone(), NodeType::File, name).with_properties(
            serde_json::json!({
                "language": file.language,
                "lines": file.lines,
                "category": file.category,
            }),
        );
        node.path = Some(path.clone());
        if let Some(hits) = self.file_hits.get(&path).copied() {
            node.finding_count = hits.count;
            node.severity = Some(hits.worst);
            self.roll_up(parent_path, hits);
        }
        self.push_node(node);
        self.push_edge(GraphEdge::new(&parent_id, &id, EdgeType::Contains));
        Some(id)
    }

    /// Propagate a file's finding count to every ancestor directory.
    fn roll_up(&mut self, dir_path: &str, hits: FileHits) {
        let mut current = Some(dir_path);
        while let Some(path) = current {
            if let Some(idx) = self
                .directories
                .get(path)
                .and_then(|id| self.node_index.get(id))
                .copied()
            {
                let node = &mut self.nodes[idx];
                node.finding_count += hits.count;
                node.severity = Some(node.severity.map_or(hits.worst, |s| s.max(hits.worst)));
            }
            current = if path.is_empty() {
                None
            } else {
                Some(split_parent(path).0)
            };
        }
    }

    /// Add a package node for a declared dependency.
    pub fn add_package(&mut self, dependency: &Dependency) {
        let name = dependency.name.trim();
        if name.is_empty() {
            return;
        }
        let mut node = GraphNode::new(
            format!("pkg:{}", name),
            NodeType::Package,
            format!("{}@{}", name, dependency.version),
        )
        .with_properties(serde_json::json!({
            "isDev": dependency.is_dev,
            "manifest": dependency.manifest,
        }));
        node.version = Some(dependency.version.clone());
        self.push_node(node);
    }

    /// Add a finding node, its `affects` edges and, when it carries a CVE
    /// reference, the CVE node and `has_cve` edge.
    pub fn add_finding(&mut self, finding: &Finding) {
        if !finding.is_well_formed() {
            return;
        }
        let id = format!("finding:{}", finding.id);
        let mut node = GraphNode::new(id.clone(), NodeType::Finding, finding.title.clone())
            .with_properties(serde_json::json!({
                "type": finding.finding_type,
                "agent": finding.agent,
                "confidence": finding.confidence,
            }));
        node.severity = Some(finding.severity);
        node.finding_count = 1;
        if !self.push_node(node) {
            // Duplicate id from another stage: the node already carries its edges.
            return;
        }

        let chain = finding.chain_ids.first().cloned();
        for path in &finding.location.files {
            let Some(path) = normalize_path(path) else {
                continue;
            };
            let file_id = format!("file:{}", path);
            if !self.node_index.contains_key(&file_id) {
                // Referenced but outside the (capped) inventory.
                self.add_file(&FileEntry::new(path, "", 0));
            }
            let mut edge = GraphEdge::new(&id, &file_id, EdgeType::Affects);
            if let Some(chain_id) = &chain {
                edge = edge.in_chain(chain_id);
            }
            self.push_edge(edge);
        }

        if let Some(cve) = finding.cve.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            let cve = cve.to_uppercase();
            let cve_id = format!("cve:{}", cve);
            let mut cve_node = GraphNode::new(cve_id.clone(), NodeType::Cve, cve);
            cve_node.severity = Some(finding.severity);
            self.push_node(cve_node);
            self.push_edge(GraphEdge::new(&id, &cve_id, EdgeType::HasCve));
        }
    }

    /// Add a fix node and a `resolves` edge to every known finding it addresses.
    pub fn add_fix(&mut self, fix: &Fix) {
        let id = format!("fix:{}", fix.id);
        let mut node = GraphNode::new(id.clone(), NodeType::Fix, fix.title.clone())
            .with_properties(serde_json::json!({
                "priority": fix.priority,
                "type": fix.fix_type,
            }));
        node.severity = Some(fix.severity);
        self.push_node(node);
        for finding_id in &fix.findings_resolved {
            self.push_edge(GraphEdge::new(
                &id,
                &format!("finding:{}", finding_id),
                EdgeType::Resolves,
            ));
        }
    }

    pub fn finish(self) -> Graph {
        Graph {
            nodes: self.nodes,
            edges: self.edges,
        }
    }
}

/// Normalize a repository-relative path: forward slashes, no leading `./`
/// or `/`, no empty segments. `None` when nothing is left.
fn normalize_path(path: &str) -> Option<String> {
    let cleaned: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.join("/"))
    }
}

/// `a/b/c` -> (`a/b`, `c`); `c` -> (``, `c`).
fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FixDocumentation;

    fn metadata() -> RepoMetadata {
        RepoMetadata {
            files: vec![
                FileEntry::new("src/api/routes.py", "Python", 120),
                FileEntry::new("src/api/models.py", "Python", 80),
                FileEntry::new("README.md", "", 10),
            ],
            dependencies: vec![
                Dependency::new("flask", "2.0.1", false),
                Dependency::new("pytest", "7.0", true),
            ],
            ..Default::default()
        }
    }

    fn fix(id: &str, resolves: &[&str]) -> Fix {
        Fix {
            id: id.to_string(),
            priority: 1,
            title: "Upgrade flask".to_string(),
            severity: Severity::Critical,
            fix_type: "dependency_upgrade".to_string(),
            estimated_effort: String::new(),
            findings_resolved: resolves.iter().map(|s| s.to_string()).collect(),
            documentation: FixDocumentation::default(),
        }
    }

    #[test]
    fn test_directory_chain_is_materialized_once() {
        let graph = build_graph(&metadata(), &[], &[]);
        graph.validate().unwrap();

        let dirs: Vec<&str> = graph
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Directory)
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(dirs, vec![ROOT_NODE_ID, "dir:src", "dir:src/api"]);

        let root_children: Vec<&str> = graph.children(ROOT_NODE_ID).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(root_children, vec!["dir:src", "file:README.md"]);
        assert_eq!(graph.children("dir:src/api").len(), 2);
    }

    #[test]
    fn test_packages_have_no_edges() {
        let graph = build_graph(&metadata(), &[], &[]);
        let pkg = graph.node("pkg:flask").unwrap();
        assert_eq!(pkg.label, "flask@2.0.1");
        assert_eq!(pkg.version.as_deref(), Some("2.0.1"));
        assert!(graph
            .edges
            .iter()
            .all(|e| !e.source.starts_with("pkg:") && !e.target.starts_with("pkg:")));
    }

    #[test]
    fn test_findings_affect_files_and_link_cves() {
        let findings = vec![
            Finding::new("F1", "dependency_vulnerability", Severity::Critical, "security", "RCE in flask")
                .with_files(vec!["src/api/routes.py".into()])
                .with_cve("cve-2023-30861"),
            Finding::new("F2", "code_smell", Severity::Warning, "quality", "God function")
                .with_files(vec!["src/api/routes.py".into(), "./src/api/models.py".into()]),
        ];
        let graph = build_graph(&metadata(), &findings, &[]);
        graph.validate().unwrap();

        let routes = graph.node("file:src/api/routes.py").unwrap();
        assert_eq!(routes.finding_count, 2);
        assert_eq!(routes.severity, Some(Severity::Critical));
        assert_eq!(graph.node("dir:src").unwrap().finding_count, 3);
        assert_eq!(graph.node(ROOT_NODE_ID).unwrap().finding_count, 3);

        assert!(graph.node("cve:CVE-2023-30861").is_some());
        assert!(graph
            .edges
            .iter()
            .any(|e| e.edge_type == EdgeType::HasCve && e.source == "finding:F1"));
        let affects = graph
            .edges
            .iter()
            .filter(|e| e.edge_type == EdgeType::Affects)
            .count();
        assert_eq!(affects, 3);
    }

    #[test]
    fn test_finding_on_unknown_file_materializes_its_chain() {
        let findings = vec![Finding::new("F9", "secret", Severity::Critical, "security", "Key")
            .with_files(vec!["config/prod/secrets.yml".into()])];
        let graph = build_graph(&metadata(), &findings, &[]);
        graph.validate().unwrap();
        assert!(graph.has_node("dir:config/prod"));
        assert!(graph.has_node("file:config/prod/secrets.yml"));
    }

    #[test]
    fn test_duplicate_finding_ids_collapse_to_one_node() {
        let findings = vec![
            Finding::new("dup", "a", Severity::Info, "x", "first"),
            Finding::new("dup", "b", Severity::Critical, "y", "second"),
        ];
        let graph = build_graph(&metadata(), &findings, &[]);
        graph.validate().unwrap();
        let dup_nodes = graph.nodes.iter().filter(|n| n.id == "finding:dup").count();
        assert_eq!(dup_nodes, 1);
        assert_eq!(graph.node("finding:dup").unwrap().label, "first");
    }

    #[test]
    fn test_fix_resolves_only_known_findings() {
        let findings = vec![Finding::new("F1", "t", Severity::Critical, "security", "x")];
        let graph = build_graph(&metadata(), &findings, &[fix("X1", &["F1", "ghost"])]);
        graph.validate().unwrap();
        let resolves: Vec<&GraphEdge> = graph
            .edges
            .iter()
            .filter(|e| e.edge_type == EdgeType::Resolves)
            .collect();
        assert_eq!(resolves.len(), 1);
        assert_eq!(resolves[0].target, "finding:F1");
    }

    #[test]
    fn test_chain_membership_marks_affects_edges() {
        let findings = vec![Finding::new("F1", "t", Severity::Critical, "security", "x")
            .with_files(vec!["README.md".into()])
            .with_chain("chain-1")];
        let graph = build_graph(&metadata(), &findings, &[]);
        let edge = graph
            .edges
            .iter()
            .find(|e| e.edge_type == EdgeType::Affects)
            .unwrap();
        assert!(edge.is_vulnerability_chain);
        assert_eq!(edge.chain_id.as_deref(), Some("chain-1"));
    }

    fn chained_findings() -> Vec<Finding> {
        vec![
            Finding::new("F1", "dependency_vulnerability", Severity::Critical, "security", "RCE")
                .with_files(vec!["src/api/routes.py".into()])
                .with_cve("CVE-2023-30861")
                .with_chain("chain-a"),
            Finding::new("F2", "injection", Severity::Warning, "pattern", "Tainted query")
                .with_files(vec!["src/api/models.py".into()])
                .with_chain("chain-a"),
            Finding::new("F3", "code_smell", Severity::Info, "quality", "Magic number")
                .with_files(vec!["README.md".into()]),
        ]
    }

    #[test]
    fn test_views_filter_edges_but_keep_nodes() {
        let graph = build_graph(&metadata(), &chained_findings(), &[fix("X1", &["F1"])]);

        let structure = graph.view(GraphView::Structure);
        assert_eq!(structure.node_count(), graph.node_count());
        assert!(structure.edges.iter().all(|e| e.edge_type == EdgeType::Contains));
        assert!(!structure.edges.is_empty());

        // No import or call edges are built yet.
        assert!(graph.view(GraphView::Dependencies).edges.is_empty());
        assert_eq!(graph.view(GraphView::Vulnerabilities), graph);

        assert_eq!(GraphView::parse(" Structure "), Some(GraphView::Structure));
        assert_eq!(GraphView::parse("layers"), None);
        assert_eq!(GraphView::Structure.layout(), ("dagre", "TB"));
        assert_eq!(GraphView::Dependencies.layout().0, "cose-bilkent");
    }

    #[test]
    fn test_blast_radius_counts_files_within_depth() {
        let graph = build_graph(&metadata(), &chained_findings(), &[fix("X1", &["F1", "F2"])]);

        let from_src = graph.blast_radius("dir:src", 1).unwrap();
        assert_eq!(from_src.files_affected, 0);
        let from_src = graph.blast_radius("dir:src", 2).unwrap();
        assert_eq!(from_src.files_affected, 2);
        assert_eq!(graph.blast_radius(ROOT_NODE_ID, 6).unwrap().files_affected, 3);

        // fix -> finding -> file
        assert_eq!(graph.blast_radius("fix:X1", 1).unwrap().files_affected, 0);
        assert_eq!(graph.blast_radius("fix:X1", 2).unwrap().files_affected, 2);

        assert!(graph.blast_radius("file:nope", 3).is_none());
    }

    #[test]
    fn test_chains_group_findings_by_chain_id() {
        let fixes = vec![fix("X1", &["F2"]), fix("X2", &["F1", "F2"])];
        let graph = build_graph(&metadata(), &chained_findings(), &fixes);

        let chains = graph.chains();
        assert_eq!(chains.len(), 1);
        let chain = &chains[0];
        assert_eq!(chain.id, "chain-a");
        assert_eq!(chain.finding_ids, vec!["F1", "F2"]);
        assert_eq!(chain.severity, Severity::Critical);
        assert_eq!(chain.keystone_fix, "X2");
        assert_eq!(chain.blast_radius.files_affected, 2);
        assert_eq!(chain.description, "RCE -> Tainted query");

        assert_eq!(chain.steps[0].step_type, "dependency_vulnerability");
        assert_eq!(chain.steps[0].file.as_deref(), Some("src/api/routes.py"));
        assert_eq!(chain.steps[0].cve.as_deref(), Some("CVE-2023-30861"));
        assert_eq!(chain.steps[1].cve, None);
    }

    #[test]
    fn test_unchained_graph_has_no_chains() {
        let findings = vec![Finding::new("F1", "t", Severity::Critical, "security", "x")
            .with_files(vec!["README.md".into()])];
        assert!(build_graph(&metadata(), &findings, &[]).chains().is_empty());
    }

    #[test]
    fn test_validate_reports_dangling_edge() {
        let mut graph = build_graph(&metadata(), &[], &[]);
        graph
            .edges
            .push(GraphEdge::new(ROOT_NODE_ID, "file:missing", EdgeType::Contains));
        assert!(matches!(
            graph.validate(),
            Err(GraphError::DanglingEdge { .. })
        ));
    }

    #[test]
    fn test_edge_type_roundtrip() {
        for et in [
            EdgeType::Contains,
            EdgeType::Imports,
            EdgeType::DependsOn,
            EdgeType::Calls,
            EdgeType::Affects,
            EdgeType::HasCve,
            EdgeType::Resolves,
        ] {
            assert_eq!(EdgeType::parse(et.as_str()), Some(et));
        }
    }
}
