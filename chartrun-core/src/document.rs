//! Statechart documents.
//!
//! Documents arrive as canonical scjson trees (the JSON rendering of SCXML):
//!
//! ```json
//! {
//!   "initial": ["idle"],
//!   "state": [
//!     {"id": "idle", "transition": [{"event": "start", "target": ["running"]}]},
//!     {"id": "running", "onentry": [{"log": [{"label": "enter", "expr": "'running'"}]}]}
//!   ]
//! }
//! ```
//!
//! The tree is deserialised once, then flattened into an arena of [`Node`]s
//! in document pre-order so that a [`NodeId`] comparison is a document-order
//! comparison.

use crate::error::CoreError;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Index of a node in the document arena.
pub type NodeId = usize;

/// History depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Shallow,
    Deep,
}

/// The kind of a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    State,
    Parallel,
    Final,
    History(HistoryKind),
}

impl NodeKind {
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::State => "state",
            NodeKind::Parallel => "parallel",
            NodeKind::Final => "final",
            NodeKind::History(_) => "history",
        }
    }
}

/// A transition.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    /// Event tokens; empty for eventless transitions.
    pub events: Vec<String>,
    pub cond: Option<String>,
    pub targets: Vec<String>,
    /// `type="internal"`.
    pub internal: bool,
    pub body: Vec<Action>,
}

impl Transition {
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether an event token matches the name (`*` matches everything).
    pub fn matches(&self, name: &str) -> bool {
        self.events.iter().any(|t| t == name || t == "*")
    }
}

/// Executable content.
#[derive(Debug, Clone)]
pub enum Action {
    Log {
        label: Option<String>,
        expr: Option<String>,
    },
    Assign {
        location: String,
        expr: Option<String>,
    },
    Raise {
        event: String,
    },
    Send(SendAction),
    Cancel {
        sendid: Option<String>,
        sendidexpr: Option<String>,
    },
    Foreach {
        array: String,
        item: String,
        index: String,
        body: Vec<Action>,
    },
    If {
        branches: Vec<Branch>,
        otherwise: Vec<Action>,
    },
    Script {
        source: String,
    },
}

/// One `if` / `elseif` arm.
#[derive(Debug, Clone)]
pub struct Branch {
    pub cond: String,
    pub body: Vec<Action>,
}

/// `<send>`.
#[derive(Debug, Clone, Default)]
pub struct SendAction {
    pub event: Option<String>,
    pub eventexpr: Option<String>,
    pub target: Option<String>,
    pub targetexpr: Option<String>,
    pub id: Option<String>,
    pub idlocation: Option<String>,
    pub delay: Option<String>,
    pub delayexpr: Option<String>,
    pub namelist: Vec<String>,
    pub params: Vec<Param>,
    pub content: Option<Content>,
}

/// `<param>`.
#[derive(Debug, Clone, Default)]
pub struct Param {
    pub name: String,
    pub expr: Option<String>,
    pub location: Option<String>,
}

/// `<content>`: either an expression or an inline value.
#[derive(Debug, Clone, Default)]
pub struct Content {
    pub expr: Option<String>,
    pub value: Value,
}

/// `<invoke>`.
#[derive(Debug, Clone, Default)]
pub struct InvokeDef {
    pub id: Option<String>,
    pub idlocation: Option<String>,
    pub kind: Option<String>,
    pub src: Option<String>,
    pub srcexpr: Option<String>,
    pub namelist: Vec<String>,
    pub params: Vec<Param>,
    pub content: Option<Content>,
    pub autoforward: bool,
    pub finalize: Vec<Action>,
}

impl InvokeDef {
    /// Whether the invoke spawns a child statechart.
    pub fn is_scxml(&self) -> bool {
        match self.kind.as_deref() {
            None | Some("") | Some("scxml") => true,
            Some(t) => {
                let t = t.trim_end_matches('/');
                t.ends_with("#SCXML") || t.ends_with("/scxml")
            }
        }
    }
}

/// `<data>`.
#[derive(Debug, Clone, Default)]
pub struct DataDef {
    pub id: String,
    pub expr: Option<String>,
    pub src: Option<String>,
    pub content: Value,
}

/// `<donedata>` of a final state.
#[derive(Debug, Clone, Default)]
pub struct DoneData {
    pub params: Vec<Param>,
    pub content: Option<Content>,
}

/// A state, parallel, final or history node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub depth: usize,
    /// Child nodes: states, parallels and finals, then histories.
    pub children: Vec<NodeId>,
    /// Initial tokens (`initial` attribute or `<initial>` transition).
    pub initial: Vec<String>,
    pub transitions: Vec<Transition>,
    pub onentry: Vec<Vec<Action>>,
    pub onexit: Vec<Vec<Action>>,
    pub invokes: Vec<InvokeDef>,
    pub datamodel: Vec<DataDef>,
    pub donedata: Option<DoneData>,
}

/// An indexed statechart document.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    ids: HashMap<String, NodeId>,
    top_level: Vec<NodeId>,
    initial: Vec<String>,
    datamodel: Vec<DataDef>,
    scripts: Vec<String>,
    name: Option<String>,
    duplicates: Vec<String>,
    base_dir: Option<PathBuf>,
}

impl Document {
    /// Builds a document from a canonical scjson tree.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        if !value.is_object() {
            return Err(CoreError::InvalidDocument {
                reason: "document root must be an object".to_string(),
            });
        }
        let raw: RawScxml =
            serde_json::from_value(value.clone()).map_err(|e| CoreError::InvalidDocument {
                reason: e.to_string(),
            })?;
        Ok(Self::from_raw(raw))
    }

    /// Builds a document from scjson text.
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value)
    }

    fn from_raw(raw: RawScxml) -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            ids: HashMap::new(),
            top_level: Vec::new(),
            initial: raw.initial,
            datamodel: convert_datamodel(&raw.datamodel),
            scripts: raw.script.iter().map(|s| text_of(&s.content)).collect(),
            name: raw.name,
            duplicates: Vec::new(),
            base_dir: None,
        };

        for child in &raw.state {
            let id = doc.index_state(child, NodeKind::State, None, 0);
            doc.top_level.push(id);
        }
        for child in &raw.parallel {
            let id = doc.index_state(child, NodeKind::Parallel, None, 0);
            doc.top_level.push(id);
        }
        for child in &raw.finals {
            let id = doc.index_state(child, NodeKind::Final, None, 0);
            doc.top_level.push(id);
        }

        doc
    }

    fn index_state(
        &mut self,
        raw: &RawState,
        kind: NodeKind,
        parent: Option<NodeId>,
        depth: usize,
    ) -> NodeId {
        let node_id = self.nodes.len();
        let id = raw
            .id
            .clone()
            .unwrap_or_else(|| format!("__{}{}", kind.tag(), node_id));

        let initial = if !raw.initial_attribute.is_empty() {
            raw.initial_attribute.clone()
        } else {
            raw.initial.iter().flat_map(RawInitial::targets).collect()
        };

        self.nodes.push(Node {
            id: id.clone(),
            kind,
            parent,
            depth,
            children: Vec::new(),
            initial,
            transitions: raw.transition.iter().map(convert_transition).collect(),
            onentry: raw.onentry.iter().map(convert_block).collect(),
            onexit: raw.onexit.iter().map(convert_block).collect(),
            invokes: raw.invoke.iter().map(convert_invoke).collect(),
            datamodel: convert_datamodel(&raw.datamodel),
            donedata: raw.donedata.first().map(|d| DoneData {
                params: d.param.iter().map(convert_param).collect(),
                content: d.content.first().map(convert_content),
            }),
        });
        self.register_id(id, node_id);

        let mut children = Vec::new();
        for child in &raw.state {
            children.push(self.index_state(child, NodeKind::State, Some(node_id), depth + 1));
        }
        for child in &raw.parallel {
            children.push(self.index_state(child, NodeKind::Parallel, Some(node_id), depth + 1));
        }
        for child in &raw.finals {
            children.push(self.index_state(child, NodeKind::Final, Some(node_id), depth + 1));
        }
        for history in &raw.history {
            children.push(self.index_history(history, node_id, depth + 1));
        }
        self.nodes[node_id].children = children;

        node_id
    }

    fn index_history(&mut self, raw: &RawHistory, parent: NodeId, depth: usize) -> NodeId {
        let node_id = self.nodes.len();
        let id = raw
            .id
            .clone()
            .unwrap_or_else(|| format!("__history{}", node_id));
        let kind = match raw.type_value.as_deref() {
            Some("deep") => HistoryKind::Deep,
            _ => HistoryKind::Shallow,
        };

        self.nodes.push(Node {
            id: id.clone(),
            kind: NodeKind::History(kind),
            parent: Some(parent),
            depth,
            children: Vec::new(),
            initial: Vec::new(),
            transitions: raw.transition.iter().map(convert_transition).collect(),
            onentry: Vec::new(),
            onexit: Vec::new(),
            invokes: Vec::new(),
            datamodel: Vec::new(),
            donedata: None,
        });
        self.register_id(id, node_id);

        node_id
    }

    fn register_id(&mut self, id: String, node_id: NodeId) {
        if self.ids.insert(id.clone(), node_id).is_some() {
            tracing::warn!("duplicate state id '{}': later declaration wins", id);
            self.duplicates.push(id);
        }
    }

    /// Sets the directory external `src` references resolve against.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate()
    }

    /// Looks up a node by its state id.
    pub fn lookup(&self, id: &str) -> Option<NodeId> {
        self.ids.get(id).copied()
    }

    pub fn id_of(&self, node: NodeId) -> &str {
        &self.nodes[node].id
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].parent
    }

    pub fn kind(&self, node: NodeId) -> NodeKind {
        self.nodes[node].kind
    }

    /// Top-level states in declaration order.
    pub fn top_level(&self) -> &[NodeId] {
        &self.top_level
    }

    /// Root `initial` tokens.
    pub fn initial(&self) -> &[String] {
        &self.initial
    }

    /// Root datamodel.
    pub fn datamodel(&self) -> &[DataDef] {
        &self.datamodel
    }

    /// Root `<script>` bodies.
    pub fn scripts(&self) -> &[String] {
        &self.scripts
    }

    /// Ids declared more than once.
    pub fn duplicate_ids(&self) -> &[String] {
        &self.duplicates
    }

    /// Child states (state, parallel, final), excluding history pseudostates.
    pub fn state_children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[node]
            .children
            .iter()
            .copied()
            .filter(|&c| !matches!(self.nodes[c].kind, NodeKind::History(_)))
    }

    /// A node without child states.
    pub fn is_leaf(&self, node: NodeId) -> bool {
        !matches!(self.nodes[node].kind, NodeKind::History(_))
            && self.state_children(node).next().is_none()
    }

    /// Sorted ids of the states reported by leaf-only traces: states and
    /// finals without `<state>` or `<parallel>` children.
    ///
    /// Unlike [`is_leaf`](Self::is_leaf), final children do not count, so a
    /// state holding only finals is listed alongside those finals.
    pub fn leaf_ids(&self) -> Vec<String> {
        let mut leaves: Vec<String> = self
            .nodes()
            .filter(|(id, node)| {
                !matches!(node.kind, NodeKind::History(_))
                    && !node.children.iter().any(|&c| {
                        matches!(self.nodes[c].kind, NodeKind::State | NodeKind::Parallel)
                    })
            })
            .map(|(_, node)| node.id.clone())
            .collect();
        leaves.sort();
        leaves.dedup();
        leaves
    }

    /// The node and its ancestors, leaf to root.
    pub fn ancestors(&self, node: NodeId) -> Ancestors<'_> {
        Ancestors {
            doc: self,
            next: Some(node),
        }
    }

    /// Whether `node` lies strictly below `ancestor`.
    pub fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        self.ancestors(node).skip(1).any(|a| a == ancestor)
    }

    /// Lowest common ancestor, inclusive of both nodes. `None` is the
    /// document root.
    pub fn lca(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let chain: Vec<NodeId> = self.ancestors(a).collect();
        self.ancestors(b).find(|x| chain.contains(x))
    }

    /// Path from just below `pivot` down to `target`, shallow to deep.
    pub fn path_down(&self, pivot: Option<NodeId>, target: NodeId) -> Vec<NodeId> {
        let mut path: Vec<NodeId> = self
            .ancestors(target)
            .take_while(|&a| Some(a) != pivot)
            .collect();
        path.reverse();
        path
    }
}

/// Iterator over a node and its ancestors.
pub struct Ancestors<'a> {
    doc: &'a Document,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.next?;
        self.next = self.doc.nodes[current].parent;
        Some(current)
    }
}

/// Flattens `<content>`-style values into text.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(text_of).collect::<Vec<_>>().join("\n"),
        Value::Object(map) => map.get("content").map(text_of).unwrap_or_default(),
        other => other.to_string(),
    }
}

fn convert_transition(raw: &RawTransition) -> Transition {
    Transition {
        events: raw.event.clone(),
        cond: raw.cond.clone().filter(|c| !c.trim().is_empty()),
        targets: raw.target.clone(),
        internal: raw.type_value.as_deref() == Some("internal"),
        body: convert_block(&raw.body),
    }
}

fn convert_block(raw: &RawBlock) -> Vec<Action> {
    let mut actions = Vec::new();

    for log in &raw.log {
        actions.push(Action::Log {
            label: log.label.clone(),
            expr: log.expr.clone(),
        });
    }
    for assign in &raw.assign {
        if let Some(location) = &assign.location {
            actions.push(Action::Assign {
                location: location.clone(),
                expr: assign.expr.clone(),
            });
        }
    }
    for raise in raw.raise_value.iter().chain(raw.raise.iter()) {
        if let Some(event) = raise.event_name() {
            actions.push(Action::Raise { event });
        }
    }
    for send in &raw.send {
        actions.push(Action::Send(SendAction {
            event: send.event.clone(),
            eventexpr: send.eventexpr.clone(),
            target: send.target.clone(),
            targetexpr: send.targetexpr.clone(),
            id: send.id.clone(),
            idlocation: send.idlocation.clone(),
            delay: send.delay.clone(),
            delayexpr: send.delayexpr.clone(),
            namelist: send.namelist.clone(),
            params: send.param.iter().map(convert_param).collect(),
            content: send.content.first().map(convert_content),
        }));
    }
    for cancel in &raw.cancel {
        actions.push(Action::Cancel {
            sendid: cancel.sendid.clone(),
            sendidexpr: cancel.sendidexpr.clone(),
        });
    }
    for foreach in &raw.foreach {
        actions.push(Action::Foreach {
            array: foreach.array.clone().unwrap_or_default(),
            item: foreach.item.clone().unwrap_or_else(|| "item".to_string()),
            index: foreach.index.clone().unwrap_or_else(|| "index".to_string()),
            body: convert_block(&foreach.body),
        });
    }
    for cond in &raw.if_value {
        let mut branches = vec![Branch {
            cond: cond.cond.clone().unwrap_or_default(),
            body: convert_block(&cond.body),
        }];
        for elseif in &cond.elseif {
            branches.push(Branch {
                cond: elseif.cond.clone().unwrap_or_default(),
                body: convert_block(&elseif.body),
            });
        }
        let otherwise = cond.else_value.iter().flat_map(convert_block).collect();
        actions.push(Action::If {
            branches,
            otherwise,
        });
    }
    for script in &raw.script {
        actions.push(Action::Script {
            source: text_of(&script.content),
        });
    }

    actions
}

fn convert_invoke(raw: &RawInvoke) -> InvokeDef {
    InvokeDef {
        id: raw.id.clone(),
        idlocation: raw.idlocation.clone(),
        kind: raw.type_value.clone(),
        src: raw.src.clone(),
        srcexpr: raw.srcexpr.clone(),
        namelist: raw.namelist.clone(),
        params: raw.param.iter().map(convert_param).collect(),
        content: raw.content.first().map(convert_content),
        autoforward: match &raw.autoforward {
            Value::Bool(b) => *b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        },
        finalize: raw.finalize.iter().flat_map(convert_block).collect(),
    }
}

fn convert_param(raw: &RawParam) -> Param {
    Param {
        name: raw.name.clone().unwrap_or_default(),
        expr: raw.expr.clone(),
        location: raw.location.clone(),
    }
}

fn convert_content(raw: &RawContent) -> Content {
    Content {
        expr: raw.expr.clone(),
        value: raw.content.clone(),
    }
}

fn convert_datamodel(raw: &[RawDatamodel]) -> Vec<DataDef> {
    raw.iter()
        .flat_map(|dm| dm.data.iter())
        .filter_map(|d| {
            d.id.as_ref().map(|id| DataDef {
                id: id.clone(),
                expr: d.expr.clone(),
                src: d.src.clone(),
                content: d.content.clone(),
            })
        })
        .collect()
}

// ============================================================================
// Raw scjson shapes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawScxml {
    #[serde(deserialize_with = "one_or_many")]
    state: Vec<RawState>,
    #[serde(deserialize_with = "one_or_many")]
    parallel: Vec<RawState>,
    #[serde(rename = "final", deserialize_with = "one_or_many")]
    finals: Vec<RawState>,
    #[serde(deserialize_with = "one_or_many")]
    datamodel: Vec<RawDatamodel>,
    #[serde(deserialize_with = "one_or_many")]
    script: Vec<RawScript>,
    #[serde(deserialize_with = "tokens")]
    initial: Vec<String>,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawState {
    id: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    state: Vec<RawState>,
    #[serde(deserialize_with = "one_or_many")]
    parallel: Vec<RawState>,
    #[serde(rename = "final", deserialize_with = "one_or_many")]
    finals: Vec<RawState>,
    #[serde(deserialize_with = "one_or_many")]
    history: Vec<RawHistory>,
    #[serde(deserialize_with = "one_or_many")]
    transition: Vec<RawTransition>,
    #[serde(deserialize_with = "one_or_many")]
    initial: Vec<RawInitial>,
    #[serde(deserialize_with = "tokens")]
    initial_attribute: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    onentry: Vec<RawBlock>,
    #[serde(deserialize_with = "one_or_many")]
    onexit: Vec<RawBlock>,
    #[serde(deserialize_with = "one_or_many")]
    invoke: Vec<RawInvoke>,
    #[serde(deserialize_with = "one_or_many")]
    datamodel: Vec<RawDatamodel>,
    #[serde(deserialize_with = "one_or_many")]
    donedata: Vec<RawDonedata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawHistory {
    id: Option<String>,
    type_value: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    transition: Vec<RawTransition>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInitial {
    Token(String),
    Element {
        #[serde(default, deserialize_with = "one_or_many")]
        transition: Vec<RawTransition>,
    },
}

impl RawInitial {
    fn targets(&self) -> Vec<String> {
        match self {
            RawInitial::Token(t) => t.split_whitespace().map(str::to_string).collect(),
            RawInitial::Element { transition } => {
                transition.iter().flat_map(|t| t.target.clone()).collect()
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTransition {
    #[serde(deserialize_with = "tokens")]
    event: Vec<String>,
    cond: Option<String>,
    #[serde(deserialize_with = "tokens")]
    target: Vec<String>,
    type_value: Option<String>,
    #[serde(flatten)]
    body: RawBlock,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBlock {
    #[serde(deserialize_with = "one_or_many")]
    log: Vec<RawLog>,
    #[serde(deserialize_with = "one_or_many")]
    assign: Vec<RawAssign>,
    #[serde(deserialize_with = "one_or_many")]
    raise_value: Vec<RawRaise>,
    #[serde(deserialize_with = "one_or_many")]
    raise: Vec<RawRaise>,
    #[serde(deserialize_with = "one_or_many")]
    send: Vec<RawSend>,
    #[serde(deserialize_with = "one_or_many")]
    cancel: Vec<RawCancel>,
    #[serde(deserialize_with = "one_or_many")]
    foreach: Vec<RawForeach>,
    #[serde(deserialize_with = "one_or_many")]
    if_value: Vec<RawIf>,
    #[serde(deserialize_with = "one_or_many")]
    script: Vec<RawScript>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLog {
    label: Option<String>,
    expr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAssign {
    location: Option<String>,
    expr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRaise {
    Name(String),
    Element {
        #[serde(default)]
        event: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
}

impl RawRaise {
    fn event_name(&self) -> Option<String> {
        match self {
            RawRaise::Name(name) => Some(name.clone()),
            RawRaise::Element { event, name } => event.clone().or_else(|| name.clone()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSend {
    event: Option<String>,
    eventexpr: Option<String>,
    target: Option<String>,
    targetexpr: Option<String>,
    id: Option<String>,
    idlocation: Option<String>,
    delay: Option<String>,
    delayexpr: Option<String>,
    #[serde(deserialize_with = "tokens")]
    namelist: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    param: Vec<RawParam>,
    #[serde(deserialize_with = "one_or_many")]
    content: Vec<RawContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCancel {
    sendid: Option<String>,
    sendidexpr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawForeach {
    array: Option<String>,
    item: Option<String>,
    index: Option<String>,
    #[serde(flatten)]
    body: RawBlock,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIf {
    cond: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    elseif: Vec<RawElseIf>,
    #[serde(deserialize_with = "one_or_many")]
    else_value: Vec<RawBlock>,
    #[serde(flatten)]
    body: RawBlock,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawElseIf {
    cond: Option<String>,
    #[serde(flatten)]
    body: RawBlock,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawScript {
    src: Option<String>,
    content: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawParam {
    name: Option<String>,
    expr: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawContent {
    expr: Option<String>,
    content: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInvoke {
    id: Option<String>,
    idlocation: Option<String>,
    type_value: Option<String>,
    src: Option<String>,
    srcexpr: Option<String>,
    #[serde(deserialize_with = "tokens")]
    namelist: Vec<String>,
    autoforward: Value,
    #[serde(deserialize_with = "one_or_many")]
    param: Vec<RawParam>,
    #[serde(deserialize_with = "one_or_many")]
    content: Vec<RawContent>,
    #[serde(deserialize_with = "one_or_many")]
    finalize: Vec<RawBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDatamodel {
    #[serde(deserialize_with = "one_or_many")]
    data: Vec<RawData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawData {
    id: Option<String>,
    expr: Option<String>,
    src: Option<String>,
    content: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDonedata {
    #[serde(deserialize_with = "one_or_many")]
    param: Vec<RawParam>,
    #[serde(deserialize_with = "one_or_many")]
    content: Vec<RawContent>,
}

/// Accepts a single element, an array of elements, or null.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
        None => Vec::new(),
    })
}

/// Accepts a whitespace-separated string or an array of strings.
fn tokens<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct TokensVisitor;

    impl<'de> Visitor<'de> for TokensVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut tokens = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                tokens.extend(s.split_whitespace().map(str::to_string));
            }
            Ok(tokens)
        }
    }

    deserializer.deserialize_any(TokensVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "name": "sample",
            "initial": "main",
            "datamodel": [{"data": [{"id": "count", "expr": "0"}]}],
            "state": [
                {
                    "id": "main",
                    "initial_attribute": ["b"],
                    "state": [
                        {"id": "a"},
                        {"id": "b", "state": [{"id": "b1"}, {"id": "b2"}]}
                    ],
                    "history": [{"id": "h", "type_value": "deep"}],
                    "transition": [{"event": "go stop", "target": "done", "cond": "count > 1"}]
                },
                {
                    "id": "split",
                    "parallel": [{
                        "id": "p",
                        "state": [
                            {"id": "r1", "state": [{"id": "r1a"}], "final": [{"id": "r1f"}]},
                            {"id": "r2"}
                        ]
                    }]
                }
            ],
            "final": [{"id": "done"}]
        })
    }

    #[test]
    fn test_index_nodes() {
        let doc = Document::from_value(&sample()).unwrap();

        assert_eq!(doc.name(), Some("sample"));
        assert_eq!(doc.initial(), &["main".to_string()]);
        assert_eq!(doc.datamodel().len(), 1);

        let main = doc.lookup("main").unwrap();
        let b1 = doc.lookup("b1").unwrap();
        let b = doc.lookup("b").unwrap();
        assert_eq!(doc.parent(b1), Some(b));
        assert_eq!(doc.parent(b), Some(main));
        assert_eq!(doc.parent(main), None);
        assert_eq!(doc.node(main).initial, vec!["b".to_string()]);
        assert_eq!(doc.node(b1).depth, 2);

        let p = doc.lookup("p").unwrap();
        assert_eq!(doc.kind(p), NodeKind::Parallel);
        assert_eq!(doc.kind(doc.lookup("done").unwrap()), NodeKind::Final);
        assert_eq!(
            doc.kind(doc.lookup("h").unwrap()),
            NodeKind::History(HistoryKind::Deep)
        );
    }

    #[test]
    fn test_document_order() {
        let doc = Document::from_value(&sample()).unwrap();
        let order: Vec<&str> = doc.nodes().map(|(_, n)| n.id.as_str()).collect();
        assert_eq!(
            order,
            vec!["main", "a", "b", "b1", "b2", "h", "split", "p", "r1", "r1a", "r1f", "r2", "done"]
        );
    }

    #[test]
    fn test_leaves() {
        let doc = Document::from_value(&sample()).unwrap();
        assert_eq!(
            doc.leaf_ids(),
            vec!["a", "b1", "b2", "done", "r1a", "r1f", "r2"]
        );
        // History pseudostates are never leaves
        assert!(!doc.is_leaf(doc.lookup("h").unwrap()));
        assert!(!doc.is_leaf(doc.lookup("r1").unwrap()));
    }

    #[test]
    fn test_leaf_ids_ignore_final_children() {
        let doc = Document::from_value(&json!({
            "state": [
                {"id": "job", "final": [{"id": "ok"}, {"id": "failed"}]},
                {"id": "idle"}
            ]
        }))
        .unwrap();

        // Structurally compound, but listed for leaf-only output
        assert!(!doc.is_leaf(doc.lookup("job").unwrap()));
        assert_eq!(doc.leaf_ids(), vec!["failed", "idle", "job", "ok"]);
    }

    #[test]
    fn test_transition_tokens() {
        let doc = Document::from_value(&sample()).unwrap();
        let main = doc.node(doc.lookup("main").unwrap());
        let t = &main.transitions[0];
        assert_eq!(t.events, vec!["go", "stop"]);
        assert_eq!(t.targets, vec!["done"]);
        assert!(t.matches("stop"));
        assert!(!t.matches("halt"));
        assert!(!t.is_eventless());
    }

    #[test]
    fn test_lca_and_paths() {
        let doc = Document::from_value(&sample()).unwrap();
        let a = doc.lookup("a").unwrap();
        let b1 = doc.lookup("b1").unwrap();
        let main = doc.lookup("main").unwrap();
        let r2 = doc.lookup("r2").unwrap();

        assert_eq!(doc.lca(a, b1), Some(main));
        assert_eq!(doc.lca(b1, b1), Some(b1));
        assert_eq!(doc.lca(a, r2), None);
        assert!(doc.is_descendant(b1, main));
        assert!(!doc.is_descendant(main, main));

        let path: Vec<&str> = doc
            .path_down(Some(main), b1)
            .into_iter()
            .map(|n| doc.id_of(n))
            .collect();
        assert_eq!(path, vec!["b", "b1"]);

        let path: Vec<&str> = doc
            .path_down(None, r2)
            .into_iter()
            .map(|n| doc.id_of(n))
            .collect();
        assert_eq!(path, vec!["split", "p", "r2"]);
    }

    #[test]
    fn test_duplicate_ids_last_wins() {
        let doc = Document::from_value(&json!({
            "state": [
                {"id": "x", "state": [{"id": "dup"}]},
                {"id": "dup"}
            ]
        }))
        .unwrap();

        assert_eq!(doc.duplicate_ids(), &["dup".to_string()]);
        let dup = doc.lookup("dup").unwrap();
        assert_eq!(doc.parent(dup), None);
    }

    #[test]
    fn test_anonymous_states_get_ids() {
        let doc = Document::from_value(&json!({"state": [{"state": [{"id": "inner"}]}]})).unwrap();
        let inner = doc.lookup("inner").unwrap();
        let outer = doc.parent(inner).unwrap();
        assert_eq!(doc.id_of(outer), "__state0");
    }

    #[test]
    fn test_single_objects_accepted_as_lists() {
        let doc = Document::from_value(&json!({
            "state": {
                "id": "only",
                "onentry": {"log": {"label": "hi", "expr": "1"}},
                "transition": {"event": "e", "target": "only"}
            }
        }))
        .unwrap();

        let only = doc.node(doc.lookup("only").unwrap());
        assert_eq!(only.onentry.len(), 1);
        assert!(matches!(only.onentry[0][0], Action::Log { .. }));
        assert_eq!(only.transitions.len(), 1);
    }

    #[test]
    fn test_block_order() {
        let doc = Document::from_value(&json!({
            "state": [{
                "id": "s",
                "onentry": [{
                    "if_value": [{"cond": "x", "raise_value": [{"event": "yes"}],
                                  "else_value": {"raise_value": [{"event": "no"}]}}],
                    "raise_value": [{"event": "r"}],
                    "assign": [{"location": "x", "expr": "1"}],
                    "log": [{"expr": "x"}]
                }]
            }]
        }))
        .unwrap();

        let block = &doc.node(doc.lookup("s").unwrap()).onentry[0];
        assert!(matches!(block[0], Action::Log { .. }));
        assert!(matches!(block[1], Action::Assign { .. }));
        assert!(matches!(block[2], Action::Raise { .. }));
        match &block[3] {
            Action::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 1);
                assert_eq!(otherwise.len(), 1);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_document() {
        assert!(matches!(
            Document::from_value(&json!([1, 2])),
            Err(CoreError::InvalidDocument { .. })
        ));
        assert!(matches!(
            Document::from_value(&json!({"state": [{"id": 5}]})),
            Err(CoreError::InvalidDocument { .. })
        ));
    }

    #[test]
    fn test_invoke_types() {
        let mut invoke = InvokeDef::default();
        assert!(invoke.is_scxml());
        invoke.kind = Some("http://www.w3.org/TR/scxml/".to_string());
        assert!(invoke.is_scxml());
        invoke.kind = Some("http://www.w3.org/TR/scxml".to_string());
        assert!(invoke.is_scxml());
        invoke.kind = Some("http://www.w3.org/TR/scxml/#SCXMLEventProcessor".to_string());
        assert!(!invoke.is_scxml());
        invoke.kind = Some("mock:immediate".to_string());
        assert!(!invoke.is_scxml());
    }
}
