//! Subgraph exporter
//!
//! Extracts a BFS-bounded neighbourhood and serializes it as JSON, Cypher
//! `CREATE` statements or GraphML.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};

use super::edge::Edge;
use super::node::Node;
use super::store::GraphStore;
use super::traversal::GraphTraversal;

/// Keys written from node fields; same-named properties are not repeated
const RESERVED_NODE_KEYS: [&str; 4] = ["id", "node_type", "label", "content"];

/// Export serialization format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Cypher,
    Graphml,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cypher => "cypher",
            Self::Graphml => "graphml",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cypher" => Ok(Self::Cypher),
            "graphml" => Ok(Self::Graphml),
            other => Err(Error::validation(format!(
                "unknown export format '{}', expected json, cypher or graphml",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Size of an extracted subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub depth: usize,
}

/// The JSON export document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphDocument {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub stats: ExportStats,
}

impl SubgraphDocument {
    /// Parse a document produced by a JSON export
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Extracted subgraph together with its serialized form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphExport {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub stats: ExportStats,
    pub format: ExportFormat,
    pub export: String,
}

/// Subgraph extraction over a [`GraphStore`]
#[derive(Clone)]
pub struct SubgraphExporter {
    traversal: GraphTraversal,
}

impl SubgraphExporter {
    pub fn new(store: GraphStore) -> Self {
        Self {
            traversal: GraphTraversal::new(store),
        }
    }

    /// Gather the neighbourhood of `root_ids` and serialize it
    ///
    /// With `include_node_types`, nodes of other types are dropped together
    /// with every edge that would lose an endpoint.
    pub async fn extract_subgraph(
        &self,
        root_ids: &[String],
        depth: usize,
        include_node_types: Option<&[String]>,
        format: ExportFormat,
    ) -> Result<SubgraphExport> {
        if root_ids.is_empty() {
            return Err(Error::validation("at least one root node id is required"));
        }

        let context = self.traversal.get_graph_context(root_ids, depth).await?;
        let (nodes, edges) = filter_by_type(context.nodes, context.edges, include_node_types);

        let stats = ExportStats {
            node_count: nodes.len(),
            edge_count: edges.len(),
            depth,
        };

        let export = match format {
            ExportFormat::Json => serde_json::to_string_pretty(&SubgraphDocument {
                nodes: nodes.clone(),
                edges: edges.clone(),
                stats,
            })?,
            ExportFormat::Cypher => to_cypher(&nodes, &edges),
            ExportFormat::Graphml => to_graphml(&nodes, &edges),
        };

        info!(
            roots = root_ids.len(),
            depth,
            %format,
            nodes = stats.node_count,
            edges = stats.edge_count,
            "Subgraph exported"
        );

        Ok(SubgraphExport {
            nodes,
            edges,
            stats,
            format,
            export,
        })
    }
}

fn filter_by_type(nodes: Vec<Node>, edges: Vec<Edge>, include: Option<&[String]>) -> (Vec<Node>, Vec<Edge>) {
    let Some(types) = include.filter(|types| !types.is_empty()) else {
        return (nodes, edges);
    };

    let nodes: Vec<Node> = nodes
        .into_iter()
        .filter(|n| types.iter().any(|t| t == &n.node_type))
        .collect();
    let kept: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let edges = edges
        .into_iter()
        .filter(|e| kept.contains(e.source_id.as_str()) && kept.contains(e.target_id.as_str()))
        .collect();
    (nodes, edges)
}

// ========== Cypher ==========

/// Render nodes then edges as replayable Cypher statements
pub fn to_cypher(nodes: &[Node], edges: &[Edge]) -> String {
    let mut out = String::new();

    for node in nodes {
        let mut fields = vec![
            format!("id: {}", cypher_string(&node.id)),
            format!("node_type: {}", cypher_string(&node.node_type)),
            format!("label: {}", cypher_string(&node.label)),
        ];
        if let Some(content) = &node.content {
            fields.push(format!("content: {}", cypher_string(content)));
        }
        for (key, value) in &node.properties {
            if !RESERVED_NODE_KEYS.contains(&key.as_str()) {
                fields.push(format!("{}: {}", cypher_ident(key), cypher_value(value)));
            }
        }
        let _ = writeln!(out, "CREATE (:{} {{{}}});", cypher_ident(&node.node_type), fields.join(", "));
    }

    for edge in edges {
        let properties = if edge.properties.is_empty() {
            String::new()
        } else {
            let fields: Vec<String> = edge
                .properties
                .iter()
                .map(|(key, value)| format!("{}: {}", cypher_ident(key), cypher_value(value)))
                .collect();
            format!(" {{{}}}", fields.join(", "))
        };
        let _ = writeln!(
            out,
            "MATCH (a {{id: {}}}), (b {{id: {}}}) CREATE (a)-[:{}{}]->(b);",
            cypher_string(&edge.source_id),
            cypher_string(&edge.target_id),
            cypher_ident(&edge.edge_type),
            properties
        );
    }

    out
}

/// Backtick-quoted identifier
fn cypher_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Single-quoted string literal
fn cypher_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

/// Cypher literal for a property value
///
/// Cypher properties only hold scalars and homogeneous scalar lists. Maps,
/// nested lists and mixed-kind lists are written as their JSON text.
fn cypher_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => cypher_string(s),
        Value::Array(items) if is_homogeneous_scalar_list(items) => {
            let items: Vec<String> = items.iter().map(cypher_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Array(_) | Value::Object(_) => cypher_string(&value.to_string()),
    }
}

#[derive(PartialEq)]
enum ScalarKind {
    Bool,
    Number,
    String,
}

fn scalar_kind(value: &Value) -> Option<ScalarKind> {
    match value {
        Value::Bool(_) => Some(ScalarKind::Bool),
        Value::Number(_) => Some(ScalarKind::Number),
        Value::String(_) => Some(ScalarKind::String),
        _ => None,
    }
}

fn is_homogeneous_scalar_list(items: &[Value]) -> bool {
    let Some((first, rest)) = items.split_first() else {
        return true;
    };
    match scalar_kind(first) {
        Some(kind) => rest.iter().all(|item| scalar_kind(item).as_ref() == Some(&kind)),
        None => false,
    }
}

// ========== GraphML ==========

/// Render a well-formed GraphML document
pub fn to_graphml(nodes: &[Node], edges: &[Edge]) -> String {
    let node_keys: BTreeSet<&str> = nodes
        .iter()
        .flat_map(|n| n.properties.keys().map(String::as_str))
        .filter(|k| !RESERVED_NODE_KEYS.contains(k))
        .collect();
    let edge_keys: BTreeSet<&str> = edges
        .iter()
        .flat_map(|e| e.properties.keys().map(String::as_str))
        .collect();

    let node_key_ids: BTreeMap<&str, String> = node_keys
        .iter()
        .enumerate()
        .map(|(i, key)| (*key, format!("np{}", i)))
        .collect();
    let edge_key_ids: BTreeMap<&str, String> = edge_keys
        .iter()
        .enumerate()
        .map(|(i, key)| (*key, format!("ep{}", i)))
        .collect();

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");
    for (id, name) in [("node_type", "node_type"), ("label", "label"), ("content", "content")] {
        let _ = writeln!(
            out,
            "  <key id=\"{}\" for=\"node\" attr.name=\"{}\" attr.type=\"string\"/>",
            id, name
        );
    }
    for (name, id) in &node_key_ids {
        let _ = writeln!(
            out,
            "  <key id=\"{}\" for=\"node\" attr.name=\"{}\" attr.type=\"string\"/>",
            id,
            xml_escape(name)
        );
    }
    out.push_str("  <key id=\"edge_type\" for=\"edge\" attr.name=\"edge_type\" attr.type=\"string\"/>\n");
    for (name, id) in &edge_key_ids {
        let _ = writeln!(
            out,
            "  <key id=\"{}\" for=\"edge\" attr.name=\"{}\" attr.type=\"string\"/>",
            id,
            xml_escape(name)
        );
    }

    out.push_str("  <graph id=\"subgraph\" edgedefault=\"directed\">\n");
    for node in nodes {
        let _ = writeln!(out, "    <node id=\"{}\">", xml_escape(&node.id));
        write_data(&mut out, "node_type", &node.node_type);
        write_data(&mut out, "label", &node.label);
        if let Some(content) = &node.content {
            write_data(&mut out, "content", content);
        }
        for (key, value) in &node.properties {
            if let Some(id) = node_key_ids.get(key.as_str()) {
                write_data(&mut out, id, &graphml_value(value));
            }
        }
        out.push_str("    </node>\n");
    }
    for (index, edge) in edges.iter().enumerate() {
        let _ = writeln!(
            out,
            "    <edge id=\"e{}\" source=\"{}\" target=\"{}\">",
            index,
            xml_escape(&edge.source_id),
            xml_escape(&edge.target_id)
        );
        write_data(&mut out, "edge_type", &edge.edge_type);
        for (key, value) in &edge.properties {
            if let Some(id) = edge_key_ids.get(key.as_str()) {
                write_data(&mut out, id, &graphml_value(value));
            }
        }
        out.push_str("    </edge>\n");
    }
    out.push_str("  </graph>\n</graphml>\n");
    out
}

fn write_data(out: &mut String, key: &str, value: &str) {
    let _ = writeln!(out, "      <data key=\"{}\">{}</data>", key, xml_escape(value));
}

fn graphml_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Escape text for XML content and attribute values
fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if (c as u32) < 0x20 && !matches!(c, '\n' | '\r' | '\t') => out.push(' '),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{EdgeInput, NodeInput};
    use crate::test_support::memory_store;
    use serde_json::json;

    async fn exporter() -> SubgraphExporter {
        let store = memory_store().await;
        store
            .append_graph(
                vec![
                    NodeInput::new("a", "Concept", "A").with_property("tags", json!(["x", "y"])),
                    NodeInput::new("b", "Concept", "B's \"quoted\"").with_property("meta", json!({"k": 1})),
                    NodeInput::new("f", "File", "main.rs <entry>"),
                    NodeInput::new("far", "Concept", "Far"),
                ],
                vec![
                    EdgeInput::new("a", "b", "RELATED_TO").with_property("weight", 0.5),
                    EdgeInput::new("b", "f", "MENTIONS"),
                    EdgeInput::new("f", "far", "LINK"),
                ],
            )
            .await
            .unwrap();
        SubgraphExporter::new(store)
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(ExportFormat::parse("GraphML").unwrap(), ExportFormat::Graphml);
        assert_eq!(ExportFormat::parse("cypher").unwrap(), ExportFormat::Cypher);
        assert_eq!(ExportFormat::parse("dot").unwrap_err().code(), "E100");
    }

    #[test]
    fn test_cypher_value_literals() {
        assert_eq!(cypher_value(&json!("it's")), "'it\\'s'");
        assert_eq!(cypher_value(&json!(3)), "3");
        assert_eq!(cypher_value(&json!(null)), "null");
        assert_eq!(cypher_value(&json!(["x", "y"])), "['x', 'y']");
        assert_eq!(cypher_value(&json!([1, 2.5])), "[1, 2.5]");
        assert_eq!(cypher_value(&json!([])), "[]");
        assert_eq!(cypher_value(&json!({"k": 1})), "'{\"k\":1}'");
        assert_eq!(cypher_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_mixed_kind_lists_fall_back_to_json_text() {
        assert_eq!(cypher_value(&json!([1, "a"])), r#"'[1,"a"]'"#);
        assert_eq!(cypher_value(&json!([true, 0])), "'[true,0]'");
        assert_eq!(cypher_value(&json!([null, "a"])), r#"'[null,"a"]'"#);

        let node = Node::new("n", "Concept", "N").with_property("tags", json!([1, "a"]));
        let cypher = to_cypher(&[node], &[]);
        assert!(cypher.contains("`tags`: '[1,"));
        assert!(!cypher.contains("[1, 'a']"));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b & \"c\""), "a&lt;b &amp; &quot;c&quot;");
    }

    #[tokio::test]
    async fn test_json_export_respects_depth() {
        let exporter = exporter().await;
        let export = exporter
            .extract_subgraph(&["a".to_string()], 2, None, ExportFormat::Json)
            .await
            .unwrap();

        assert_eq!(export.stats, ExportStats { node_count: 3, edge_count: 2, depth: 2 });

        let document = SubgraphDocument::from_json(&export.export).unwrap();
        assert_eq!(document.nodes.len(), 3);
        assert_eq!(document.edges.len(), 2);
        assert_eq!(document.stats, export.stats);
    }

    #[tokio::test]
    async fn test_type_filter_drops_dangling_edges() {
        let exporter = exporter().await;
        let types = vec!["Concept".to_string()];
        let export = exporter
            .extract_subgraph(&["a".to_string()], 3, Some(&types), ExportFormat::Json)
            .await
            .unwrap();

        let ids: Vec<&str> = export.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "far"]);
        assert_eq!(export.edges.len(), 1);
        assert_eq!(export.edges[0].edge_type, "RELATED_TO");
    }

    #[tokio::test]
    async fn test_cypher_export_orders_nodes_before_edges() {
        let exporter = exporter().await;
        let export = exporter
            .extract_subgraph(&["a".to_string()], 1, None, ExportFormat::Cypher)
            .await
            .unwrap();

        let lines: Vec<&str> = export.export.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("CREATE (:`Concept` {id: 'a'"));
        assert!(lines[0].contains("`tags`: ['x', 'y']"));
        assert!(lines[1].contains("label: 'B\\'s \"quoted\"'"));
        assert!(lines[1].contains("`meta`: '{\"k\":1}'"));
        assert_eq!(
            lines[2],
            "MATCH (a {id: 'a'}), (b {id: 'b'}) CREATE (a)-[:`RELATED_TO` {`weight`: 0.5}]->(b);"
        );
    }

    #[tokio::test]
    async fn test_graphml_export_is_escaped() {
        let exporter = exporter().await;
        let export = exporter
            .extract_subgraph(&["f".to_string()], 1, None, ExportFormat::Graphml)
            .await
            .unwrap();

        let xml = &export.export;
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<data key=\"label\">main.rs &lt;entry&gt;</data>"));
        assert!(xml.contains("B&apos;s &quot;quoted&quot;"));
        assert_eq!(xml.matches("<node ").count(), 3);
        assert_eq!(xml.matches("<edge ").count(), 2);
        assert!(xml.trim_end().ends_with("</graphml>"));
    }

    #[tokio::test]
    async fn test_empty_roots_rejected() {
        let exporter = exporter().await;
        let err = exporter
            .extract_subgraph(&[], 1, None, ExportFormat::Json)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E100");
    }
}
