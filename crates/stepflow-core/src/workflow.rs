//! Workflow graph model: nodes, edges and seed variables.
//!
//! This is the interchange document shared with the visual editor. Fields
//! the core does not understand (layout hints, editor metadata) are kept
//! in `extra` maps so that a load/save cycle is lossless.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowError, Result};
use crate::types::ContextMap;

/// Node types understood by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Start,
    End,
    Action,
    Decision,
    Loop,
    Delay,
    Annotation,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Action => "action",
            Self::Decision => "decision",
            Self::Loop => "loop",
            Self::Delay => "delay",
            Self::Annotation => "annotation",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a step's external process fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
}

/// Loop iteration count as written in the document: a number, or a string
/// holding either a number or the name of a context variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Iterations {
    Count(i64),
    Text(String),
}

/// How a loop count should be obtained at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationSource<'a> {
    Literal(i64),
    Variable(&'a str),
}

impl Iterations {
    pub fn source(&self) -> IterationSource<'_> {
        match self {
            Self::Count(n) => IterationSource::Literal(*n),
            Self::Text(s) => match s.trim().parse::<i64>() {
                Ok(n) => IterationSource::Literal(n),
                Err(_) => IterationSource::Variable(s.trim()),
            },
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(s) if s.trim().is_empty())
    }
}

/// A node in the workflow graph.
///
/// One flat shape covers every node type; type-specific fields are
/// optional and checked by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeType,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,

    // action / loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    // decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(rename = "truePath", default, skip_serializing_if = "Option::is_none")]
    pub true_path: Option<String>,
    #[serde(rename = "falsePath", default, skip_serializing_if = "Option::is_none")]
    pub false_path: Option<String>,

    // loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<Iterations>,
    #[serde(rename = "loopVar", default, skip_serializing_if = "Option::is_none")]
    pub loop_var: Option<String>,

    // delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<serde_json::Number>,

    // common
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    #[serde(rename = "timeoutSecs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    /// Layout hint from the editor. Opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,

    /// Fields this version does not model, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_loop_var() -> &'static str {
    "item"
}

fn default_delay_seconds() -> f64 {
    5.0
}

impl Node {
    /// Create a node with only identity fields set.
    pub fn new(id: impl Into<String>, kind: NodeType) -> Self {
        Self {
            id: id.into(),
            kind,
            label: String::new(),
            script: None,
            condition: None,
            true_path: None,
            false_path: None,
            iterations: None,
            loop_var: None,
            delay_seconds: None,
            enabled: None,
            on_error: None,
            timeout_secs: None,
            output_variable: None,
            position: None,
            extra: Map::new(),
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::End)
    }

    pub fn action(id: impl Into<String>, script: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeType::Action);
        node.script = Some(script.into());
        node
    }

    pub fn decision(
        id: impl Into<String>,
        condition: impl Into<String>,
        true_path: impl Into<String>,
        false_path: impl Into<String>,
    ) -> Self {
        let mut node = Self::new(id, NodeType::Decision);
        node.condition = Some(condition.into());
        node.true_path = Some(true_path.into());
        node.false_path = Some(false_path.into());
        node
    }

    pub fn looping(
        id: impl Into<String>,
        script: impl Into<String>,
        iterations: Iterations,
        loop_var: impl Into<String>,
    ) -> Self {
        let mut node = Self::new(id, NodeType::Loop);
        node.script = Some(script.into());
        node.iterations = Some(iterations);
        node.loop_var = Some(loop_var.into());
        node
    }

    pub fn delay(id: impl Into<String>, seconds: f64) -> Self {
        let mut node = Self::new(id, NodeType::Delay);
        node.delay_seconds = serde_json::Number::from_f64(seconds);
        node
    }

    /// Set the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = Some(on_error);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_output_variable(mut self, name: impl Into<String>) -> Self {
        self.output_variable = Some(name.into());
        self
    }

    /// Label for display, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn on_error(&self) -> OnError {
        self.on_error.unwrap_or_default()
    }

    pub fn loop_var(&self) -> &str {
        self.loop_var
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(default_loop_var())
    }

    pub fn delay_seconds(&self) -> f64 {
        self.delay_seconds
            .as_ref()
            .and_then(|n| n.as_f64())
            .unwrap_or_else(default_delay_seconds)
    }

    /// The script, if set and non-blank.
    pub fn script(&self) -> Option<&str> {
        non_blank(self.script.as_deref())
    }

    /// The condition, if set and non-blank.
    pub fn condition(&self) -> Option<&str> {
        non_blank(self.condition.as_deref())
    }

    pub fn true_path(&self) -> Option<&str> {
        non_blank(self.true_path.as_deref())
    }

    pub fn false_path(&self) -> Option<&str> {
        non_blank(self.false_path.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// A linear connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            extra: Map::new(),
        }
    }
}

/// A complete workflow document.
///
/// Deserializing goes through `WorkflowDocument` so the node index is
/// always built and duplicate ids are always rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "WorkflowDocument")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: String,
    nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub variables: ContextMap,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

/// Workflow JSON as written on disk, before the node index exists.
#[derive(Deserialize)]
struct WorkflowDocument {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default)]
    variables: ContextMap,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<WorkflowDocument> for Workflow {
    type Error = FlowError;

    fn try_from(doc: WorkflowDocument) -> Result<Self> {
        let mut workflow = Self {
            id: doc.id,
            name: doc.name,
            description: doc.description,
            nodes: doc.nodes,
            edges: doc.edges,
            variables: doc.variables,
            extra: doc.extra,
            index: HashMap::new(),
        };
        workflow.reindex()?;
        Ok(workflow)
    }
}

impl Workflow {
    /// Create an empty workflow.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: ContextMap::new(),
            extra: Map::new(),
            index: HashMap::new(),
        }
    }

    /// Parse a workflow document from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let doc: WorkflowDocument = serde_json::from_str(json)?;
        Workflow::try_from(doc)
    }

    /// Load a workflow document from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Workflow(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// Serialize back to pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save the workflow document to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    fn reindex(&mut self) -> Result<()> {
        self.index.clear();
        for (pos, node) in self.nodes.iter().enumerate() {
            if self.index.insert(node.id.clone(), pos).is_some() {
                return Err(FlowError::Workflow(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        Ok(())
    }

    /// Add a node; ids must be unique.
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.index.contains_key(&node.id) {
            return Err(FlowError::Workflow(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Builder-style [`add_node`](Self::add_node). Panics on duplicate ids.
    pub fn with_node(mut self, node: Node) -> Self {
        if let Err(e) = self.add_node(node) {
            panic!("{}", e);
        }
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&pos| &self.nodes[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Targets of the linear edges leaving `id`, in declaration order.
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &str> + '_ {
        let id = id.to_string();
        self.edges
            .iter()
            .filter(move |e| e.from == id)
            .map(|e| e.to.as_str())
    }

    /// The linear continuation of `id` (first outgoing edge).
    pub fn next_node(&self, id: &str) -> Option<&str> {
        self.outgoing(id).next()
    }

    /// Every node `id` can transfer control to: branch targets for a
    /// decision node, edge targets otherwise.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        match self.node(id) {
            Some(node) if node.kind == NodeType::Decision => node
                .true_path()
                .into_iter()
                .chain(node.false_path())
                .collect(),
            Some(_) => self.outgoing(id).collect(),
            None => Vec::new(),
        }
    }

    /// Whether any edge or branch leads into `id`.
    pub fn has_incoming(&self, id: &str) -> bool {
        self.edges.iter().any(|e| e.to == id)
            || self.nodes.iter().any(|n| {
                n.kind == NodeType::Decision
                    && (n.true_path() == Some(id) || n.false_path() == Some(id))
            })
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().filter(|n| n.kind == NodeType::Start)
    }
}

impl PartialEq for Workflow {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.description == other.description
            && self.nodes == other.nodes
            && self.edges == other.edges
            && self.variables == other.variables
            && self.extra == other.extra
    }
}
