//! Statechart interpreter - configuration, microsteps and the event loop.

use crate::document::{
    Action, Content, DataDef, Document, HistoryKind, NodeId, NodeKind, Param, SendAction,
};
use crate::events::{
    parse_delay, Event, EventQueue, SendTarget, TimerList, ERROR_EXECUTION, INVOKE_COMPLETE,
};
use crate::expr::{assign_path, condition_holds, Expr, Scope};
use crate::invoke::{child_document, InvocationRecord, InvokeStatus};
use crate::loader::load_value;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Iteration caps that keep cyclic charts from spinning forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Eventless microsteps per settle.
    pub max_eventless: usize,
    /// Internal events drained per macrostep.
    pub max_internal: usize,
    /// Nesting depth of invoked child statecharts.
    pub max_invoke_depth: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_eventless: 100,
            max_internal: 100,
            max_invoke_depth: 16,
        }
    }
}

/// Which cap was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    EventlessLimit,
    InternalLimit,
    InvokeDepthLimit,
}

/// A non-fatal condition recorded while processing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Event being processed when the cap was hit.
    pub event: Option<String>,
    pub limit: usize,
}

/// A transition taken during a macrostep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FiredTransition {
    pub source: String,
    pub targets: Vec<String>,
    /// Triggering event; `None` for eventless transitions.
    pub event: Option<String>,
    pub cond: Option<String>,
}

/// Everything that happened while processing one external event (or the
/// initial entry).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroStep {
    pub fired_transitions: Vec<FiredTransition>,
    pub entered_states: Vec<String>,
    pub exited_states: Vec<String>,
    /// Active leaf states in document order.
    pub configuration: Vec<String>,
    pub action_log: Vec<String>,
    /// Top-level data model keys written during the step, with final values.
    pub datamodel_delta: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct StepLog {
    fired: Vec<FiredTransition>,
    entered: Vec<String>,
    exited: Vec<String>,
    actions: Vec<String>,
    touched: BTreeSet<String>,
}

/// A running statechart.
///
/// Each interpreter owns its configuration, history, data model, queues and
/// invocations. Child interpreters live inside their parent's invocation
/// records and talk back through an outbox.
#[derive(Debug)]
pub struct Interpreter {
    doc: Arc<Document>,
    limits: EngineLimits,

    /// Active leaves.
    configuration: BTreeSet<NodeId>,
    shallow_history: HashMap<NodeId, Vec<NodeId>>,
    deep_history: HashMap<NodeId, Vec<NodeId>>,
    data: Map<String, Value>,

    queue: EventQueue,
    timers: TimerList,
    invocations: Vec<InvocationRecord>,
    outbox: Vec<Event>,
    has_parent: bool,
    /// Number of invoking ancestors.
    depth: usize,

    /// States whose `done.state` event was already raised since entry.
    completed: HashSet<NodeId>,
    current_event: Option<Event>,
    diagnostics: Vec<Diagnostic>,
    log: StepLog,

    invoke_seq: usize,
    send_seq: usize,
    started: bool,
    halted: bool,
}

impl Interpreter {
    /// Creates an interpreter with default limits. The data model is
    /// initialised immediately; call [`start`](Self::start) to enter the
    /// initial configuration.
    pub fn new(doc: Document) -> Self {
        Self::with_limits(doc, EngineLimits::default())
    }

    pub fn with_limits(doc: Document, limits: EngineLimits) -> Self {
        let mut interpreter = Self {
            doc: Arc::new(doc),
            limits,
            configuration: BTreeSet::new(),
            shallow_history: HashMap::new(),
            deep_history: HashMap::new(),
            data: Map::new(),
            queue: EventQueue::new(),
            timers: TimerList::new(),
            invocations: Vec::new(),
            outbox: Vec::new(),
            has_parent: false,
            depth: 0,
            completed: HashSet::new(),
            current_event: None,
            diagnostics: Vec::new(),
            log: StepLog::default(),
            invoke_seq: 0,
            send_seq: 0,
            started: false,
            halted: false,
        };
        interpreter.init_datamodel();
        interpreter
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Enters the initial configuration and runs it to quiescence (step 0).
    pub fn start(&mut self) -> MacroStep {
        self.log = StepLog::default();
        if self.started {
            tracing::warn!("interpreter already started");
            return self.finish_step();
        }
        self.started = true;

        let doc = Arc::clone(&self.doc);
        for script in doc.scripts() {
            self.run_script(script);
        }

        let entry = doc.initial_entry();
        self.enter_states(&entry);
        self.settle(0);
        self.drain();

        self.finish_step()
    }

    /// Processes one external event: its transitions, the eventless cascade
    /// and every internal event that follows, as a single macrostep.
    ///
    /// Starts the interpreter first if needed; that step is discarded.
    pub fn process(&mut self, event: Event) -> MacroStep {
        if !self.started {
            self.start();
        }
        self.log = StepLog::default();
        if self.halted {
            return self.finish_step();
        }

        tracing::debug!("processing event '{}'", event.name);
        self.autoforward(&event);
        self.handle_event(event);
        self.drain();

        self.finish_step()
    }

    /// Advances the logical clock, moving due timers to their targets.
    /// Children advance with their parent.
    pub fn advance_time(&mut self, seconds: f64) {
        for (target, event) in self.timers.advance(seconds) {
            self.dispatch(target, event, 0.0);
        }

        for index in 0..self.invocations.len() {
            if !self.invocations[index].accepts_events() {
                continue;
            }
            if let Some(child) = self.invocations[index].child.as_mut() {
                child.advance_time(seconds);
                child.run_pending();
            }
            self.collect_outbox(index);
        }
    }

    /// Active leaf ids in document order.
    pub fn configuration(&self) -> Vec<String> {
        self.configuration
            .iter()
            .map(|&n| self.doc.id_of(n).to_string())
            .collect()
    }

    pub fn is_in_state(&self, id: &str) -> bool {
        self.doc
            .lookup(id)
            .is_some_and(|node| self.is_node_active(node))
    }

    pub fn datamodel(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn invocations(&self) -> &[InvocationRecord] {
        &self.invocations
    }

    /// Caps hit so far, including those reported by invoked children.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Whether a top-level final state was reached.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Logical time in seconds.
    pub fn now(&self) -> f64 {
        self.timers.now()
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.outbox)
    }

    /// Drains events that arrived outside a macrostep (due timers of a
    /// child) as a macrostep of their own.
    fn run_pending(&mut self) {
        if !self.started || self.halted || self.queue.is_empty() {
            return;
        }
        self.log = StepLog::default();
        self.drain();
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    fn handle_event(&mut self, event: Event) {
        if event.name == INVOKE_COMPLETE {
            if let Some(id) = event.invokeid.as_deref() {
                self.complete_invocation(id);
            }
            return;
        }

        let mut mark = self.queue.len();
        let name = event.name.clone();
        self.current_event = Some(event);

        // The event keeps selecting until nothing new is enabled for it.
        // A transition fires at most once per occurrence.
        let mut fired: HashSet<(NodeId, usize)> = HashSet::new();
        loop {
            let mut selected = self.select(Some(&name));
            selected.retain(|t| !fired.contains(t));
            if selected.is_empty() {
                break;
            }
            fired.extend(selected.iter().copied());
            self.microstep(&selected, Some(&name));
            mark += self.settle(mark);
        }
        if fired.is_empty() {
            tracing::trace!("no transition for '{}'", name);
        }
    }

    /// Applies eventless transitions to quiescence, then queues completion
    /// events at `mark`, ahead of anything queued since. Returns how many
    /// were queued.
    fn settle(&mut self, mark: usize) -> usize {
        let mut rounds = 0;
        while !self.halted {
            let selected = self.select(None);
            if selected.is_empty() {
                break;
            }
            if rounds >= self.limits.max_eventless {
                self.report(DiagnosticKind::EventlessLimit, self.limits.max_eventless);
                break;
            }
            self.microstep(&selected, None);
            rounds += 1;
        }

        let completions = self.detect_completion();
        let count = completions.len();
        for (offset, event) in completions.into_iter().enumerate() {
            self.queue.insert(mark + offset, event);
        }
        count
    }

    fn drain(&mut self) {
        let mut handled = 0;
        while !self.halted && !self.queue.is_empty() {
            if handled >= self.limits.max_internal {
                self.report(DiagnosticKind::InternalLimit, self.limits.max_internal);
                break;
            }
            if let Some(event) = self.queue.pop() {
                tracing::trace!("internal event '{}'", event.name);
                self.handle_event(event);
            }
            handled += 1;
        }
    }

    fn report(&mut self, kind: DiagnosticKind, limit: usize) {
        let event = self.current_event.as_ref().map(|e| e.name.clone());
        tracing::warn!(
            "{:?} of {} reached while processing {}",
            kind,
            limit,
            event.as_deref().unwrap_or("initial entry")
        );
        self.diagnostics.push(Diagnostic { kind, event, limit });
    }

    fn finish_step(&mut self) -> MacroStep {
        let log = std::mem::take(&mut self.log);
        let datamodel_delta = log
            .touched
            .into_iter()
            .map(|key| {
                let value = self.data.get(&key).cloned().unwrap_or(Value::Null);
                (key, value)
            })
            .collect();

        MacroStep {
            fired_transitions: log.fired,
            entered_states: log.entered,
            exited_states: log.exited,
            configuration: self.configuration(),
            action_log: log.actions,
            datamodel_delta,
        }
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Finds enabled transitions, one per active leaf, then drops any whose
    /// source is a proper ancestor of another candidate's source.
    fn select(&self, event: Option<&str>) -> Vec<(NodeId, usize)> {
        if self.halted {
            return Vec::new();
        }

        let mut candidates: Vec<(NodeId, usize)> = Vec::new();
        for &leaf in &self.configuration {
            'walk: for node in self.doc.ancestors(leaf) {
                for (index, transition) in self.doc.node(node).transitions.iter().enumerate() {
                    let matches = match event {
                        None => transition.is_eventless(),
                        Some(name) => !transition.is_eventless() && transition.matches(name),
                    };
                    if matches && condition_holds(transition.cond.as_deref(), self) {
                        if !candidates.contains(&(node, index)) {
                            candidates.push((node, index));
                        }
                        break 'walk;
                    }
                }
            }
        }

        let sources: Vec<NodeId> = candidates.iter().map(|&(source, _)| source).collect();
        candidates.retain(|&(source, _)| {
            !sources
                .iter()
                .any(|&other| self.doc.is_descendant(other, source))
        });
        candidates
    }

    // =========================================================================
    // Microstep
    // =========================================================================

    fn microstep(&mut self, selected: &[(NodeId, usize)], cause: Option<&str>) {
        let doc = Arc::clone(&self.doc);
        let active = self.active_states();

        let mut plans: Vec<(NodeId, usize, Vec<NodeId>, Option<NodeId>)> = Vec::new();
        let mut exit_set = BTreeSet::new();
        for &(source, index) in selected {
            let transition = &doc.node(source).transitions[index];
            let targets: Vec<NodeId> = transition
                .targets
                .iter()
                .filter_map(|id| {
                    let found = doc.lookup(id);
                    if found.is_none() {
                        tracing::warn!("transition target '{}' does not exist", id);
                    }
                    found
                })
                .collect();
            if targets.is_empty() {
                plans.push((source, index, targets, None));
                continue;
            }

            let pivot = self.pivot(source, transition.internal, &targets);
            exit_set.extend(
                active
                    .iter()
                    .copied()
                    .filter(|&s| pivot.map_or(true, |p| doc.is_descendant(s, p))),
            );
            plans.push((source, index, targets, pivot));
        }

        tracing::debug!(
            "microstep on {}: {} transition(s), {} exit(s)",
            cause.unwrap_or("<eventless>"),
            plans.len(),
            exit_set.len()
        );

        self.record_history(&exit_set, &active);
        for &state in exit_set.iter().rev() {
            self.exit_state(state);
        }

        for (source, index, _, _) in &plans {
            let transition = &doc.node(*source).transitions[*index];
            self.log.fired.push(FiredTransition {
                source: doc.id_of(*source).to_string(),
                targets: transition.targets.clone(),
                event: cause.map(str::to_string),
                cond: transition.cond.clone(),
            });
            self.run_actions(&transition.body);
        }

        let remaining: BTreeSet<NodeId> = active.difference(&exit_set).copied().collect();
        let mut entry = BTreeSet::new();
        for (_, _, targets, pivot) in &plans {
            if targets.is_empty() {
                continue;
            }
            for &target in targets {
                self.add_entry_path(*pivot, target, &mut entry);
            }
        }
        entry.retain(|n| !remaining.contains(n));
        doc.complete_entry(&mut entry, &remaining);
        self.enter_states(&entry);
    }

    /// The state below which a transition exits and enters. `None` is the
    /// document root.
    fn pivot(&self, source: NodeId, internal: bool, targets: &[NodeId]) -> Option<NodeId> {
        let doc = &self.doc;
        if internal
            && doc.kind(source) == NodeKind::State
            && targets.iter().all(|&t| doc.is_descendant(t, source))
        {
            return Some(source);
        }

        let depth = |n: Option<NodeId>| n.map_or(-1, |n| doc.node(n).depth as isize);
        let mut pivot = targets
            .iter()
            .map(|&t| doc.lca(source, t))
            .min_by_key(|&lca| depth(lca))
            .flatten();

        // External transitions leave the pivot itself when it is an endpoint
        if let Some(p) = pivot {
            if p == source || targets.contains(&p) {
                pivot = doc.parent(p);
            }
        }
        // Parallel regions are never exited one at a time
        while let Some(p) = pivot {
            if doc.kind(p) != NodeKind::Parallel {
                break;
            }
            pivot = doc.parent(p);
        }
        pivot
    }

    fn add_entry_path(&self, pivot: Option<NodeId>, target: NodeId, entry: &mut BTreeSet<NodeId>) {
        let doc = &self.doc;
        let NodeKind::History(kind) = doc.kind(target) else {
            entry.extend(doc.path_down(pivot, target));
            return;
        };
        let Some(parent) = doc.parent(target) else {
            return;
        };

        let table = match kind {
            HistoryKind::Shallow => &self.shallow_history,
            HistoryKind::Deep => &self.deep_history,
        };
        let restored = match table.get(&parent).filter(|states| !states.is_empty()) {
            Some(states) => states.clone(),
            None => {
                let defaults = doc.history_default(target);
                if defaults.is_empty() {
                    doc.default_targets(parent)
                } else {
                    defaults
                }
            }
        };

        for node in restored {
            entry.extend(doc.path_down(pivot, node));
        }
    }

    /// Records history for exited compound states from the configuration
    /// as it stood before the microstep.
    fn record_history(&mut self, exit_set: &BTreeSet<NodeId>, active: &BTreeSet<NodeId>) {
        let doc = Arc::clone(&self.doc);
        for &state in exit_set {
            if doc.is_leaf(state) {
                continue;
            }
            let shallow: Vec<NodeId> = doc
                .state_children(state)
                .filter(|child| active.contains(child))
                .collect();
            let deep: Vec<NodeId> = self
                .configuration
                .iter()
                .copied()
                .filter(|&leaf| doc.is_descendant(leaf, state))
                .collect();
            self.shallow_history.insert(state, shallow);
            self.deep_history.insert(state, deep);
        }
    }

    fn exit_state(&mut self, state: NodeId) {
        let doc = Arc::clone(&self.doc);
        let node = doc.node(state);

        for block in &node.onexit {
            self.run_actions(block);
        }
        self.cancel_invocations(state);

        self.configuration.remove(&state);
        self.completed.remove(&state);
        self.log.exited.push(node.id.clone());
    }

    /// Enters states in document order, then starts their invocations.
    fn enter_states(&mut self, entry: &BTreeSet<NodeId>) {
        let doc = Arc::clone(&self.doc);

        for &state in entry {
            let node = doc.node(state);
            if matches!(node.kind, NodeKind::History(_)) {
                continue;
            }
            if doc.is_leaf(state) {
                self.configuration.insert(state);
            }
            self.log.entered.push(node.id.clone());
            for block in &node.onentry {
                self.run_actions(block);
            }
            if node.kind == NodeKind::Final && node.parent.is_none() {
                tracing::debug!("reached top-level final '{}'", node.id);
                self.halted = true;
            }
        }

        for &state in entry {
            if !doc.node(state).invokes.is_empty() {
                self.start_invocations(state);
            }
        }
    }

    fn active_states(&self) -> BTreeSet<NodeId> {
        self.configuration
            .iter()
            .flat_map(|&leaf| self.doc.ancestors(leaf))
            .collect()
    }

    fn is_node_active(&self, node: NodeId) -> bool {
        self.configuration
            .iter()
            .any(|&leaf| leaf == node || self.doc.is_descendant(leaf, node))
    }

    /// `done.state.<id>` events for states that completed since entry,
    /// deepest first.
    fn detect_completion(&mut self) -> Vec<Event> {
        let doc = Arc::clone(&self.doc);
        let active = self.active_states();
        let is_active_final = |n: NodeId| doc.kind(n) == NodeKind::Final && active.contains(&n);

        let mut done: Vec<(usize, Event)> = Vec::new();
        for &node in &active {
            if self.completed.contains(&node) || doc.is_leaf(node) {
                continue;
            }
            let data = match doc.kind(node) {
                NodeKind::State => doc
                    .state_children(node)
                    .find(|&c| is_active_final(c))
                    .map(|f| self.done_data(f)),
                NodeKind::Parallel => {
                    let complete = doc.state_children(node).all(|region| {
                        is_active_final(region) || doc.state_children(region).any(is_active_final)
                    });
                    complete.then_some(Value::Null)
                }
                _ => None,
            };
            if let Some(data) = data {
                self.completed.insert(node);
                let event = Event::new(format!("done.state.{}", doc.id_of(node))).with_data(data);
                done.push((doc.node(node).depth, event));
            }
        }

        done.sort_by_key(|(depth, _)| Reverse(*depth));
        done.into_iter().map(|(_, event)| event).collect()
    }

    fn done_data(&self, final_state: NodeId) -> Value {
        match &self.doc.node(final_state).donedata {
            Some(donedata) => self.payload(&donedata.params, &[], donedata.content.as_ref()),
            None => Value::Null,
        }
    }

    // =========================================================================
    // Invocations
    // =========================================================================

    fn start_invocations(&mut self, state: NodeId) {
        let doc = Arc::clone(&self.doc);

        for (index, def) in doc.node(state).invokes.iter().enumerate() {
            let id = match &def.id {
                Some(id) => id.clone(),
                None => {
                    let id = format!("{}.invoke{}", doc.id_of(state), self.invoke_seq);
                    self.invoke_seq += 1;
                    id
                }
            };
            if let Some(location) = &def.idlocation {
                self.assign(location, Value::String(id.clone()));
            }

            let child = if def.is_scxml() {
                let limit = self.limits.max_invoke_depth;
                let spawned = if self.depth >= limit {
                    self.report(DiagnosticKind::InvokeDepthLimit, limit);
                    Err(format!("nesting depth limit of {} reached", limit))
                } else {
                    self.spawn_child(state, index).map_err(|e| e.to_string())
                };
                match spawned {
                    Ok(child) => Some(Box::new(child)),
                    Err(reason) => {
                        let err = CoreError::Invoke {
                            invoke_id: id.clone(),
                            reason,
                        };
                        tracing::warn!("{}", err);
                        self.queue.push(
                            Event::new(ERROR_EXECUTION)
                                .with_data(json!({ "invokeid": id, "reason": err.to_string() }))
                                .with_invokeid(id.clone()),
                        );
                        None
                    }
                }
            } else {
                None
            };

            tracing::debug!("starting invocation '{}' in '{}'", id, doc.id_of(state));
            self.invocations.push(InvocationRecord {
                id: id.clone(),
                owner: state,
                index,
                status: InvokeStatus::Active,
                autoforward: def.autoforward,
                child,
            });

            let record = self.invocations.len() - 1;
            if let Some(child) = self.invocations[record].child.as_mut() {
                child.start();
            }
            self.collect_outbox(record);
            self.queue
                .push(Event::new(INVOKE_COMPLETE).with_invokeid(id));
        }
    }

    fn spawn_child(&self, state: NodeId, index: usize) -> Result<Interpreter, CoreError> {
        let def = &self.doc.node(state).invokes[index];
        let doc = child_document(def, self, self.doc.base_dir())?;

        let mut child = Interpreter::with_limits(doc, self.limits);
        child.has_parent = true;
        child.depth = self.depth + 1;
        for name in &def.namelist {
            child.data.insert(name.clone(), self.eval(name));
        }
        for param in &def.params {
            child.data.insert(param.name.clone(), self.param_value(param));
        }
        Ok(child)
    }

    fn complete_invocation(&mut self, id: &str) {
        let Some(index) = self
            .invocations
            .iter()
            .rposition(|r| r.id == id && r.is_active())
        else {
            tracing::trace!("invocation '{}' is no longer active", id);
            return;
        };

        self.run_finalize(index);
        self.invocations[index].status = InvokeStatus::Done;
        self.queue
            .push(Event::new(format!("done.invoke.{}", id)).with_invokeid(id));
        self.queue.push(Event::new("done.invoke").with_invokeid(id));
    }

    fn cancel_invocations(&mut self, owner: NodeId) {
        for index in 0..self.invocations.len() {
            if self.invocations[index].owner == owner && self.invocations[index].is_active() {
                tracing::debug!("canceling invocation '{}'", self.invocations[index].id);
                self.invocations[index].status = InvokeStatus::Canceled;
                self.run_finalize(index);
            }
        }
    }

    fn run_finalize(&mut self, index: usize) {
        let doc = Arc::clone(&self.doc);
        let record = &self.invocations[index];
        let finalize = &doc.node(record.owner).invokes[record.index].finalize;
        self.run_actions(finalize);
    }

    /// Moves a child's `#_parent` events into this interpreter's queue and
    /// its diagnostics into ours.
    fn collect_outbox(&mut self, index: usize) {
        let record = &mut self.invocations[index];
        let Some(child) = record.child.as_mut() else {
            return;
        };
        let id = record.id.clone();
        let outbox = child.take_outbox();
        let diagnostics = std::mem::take(&mut child.diagnostics);
        for event in outbox {
            self.queue.push(event.with_invokeid(id.clone()));
        }
        self.diagnostics.extend(diagnostics);
    }

    fn autoforward(&mut self, event: &Event) {
        for index in 0..self.invocations.len() {
            let record = &mut self.invocations[index];
            if !record.autoforward || !record.accepts_events() {
                continue;
            }
            if let Some(child) = record.child.as_mut() {
                child.process(event.clone());
            }
            self.collect_outbox(index);
        }
    }

    // =========================================================================
    // Send routing
    // =========================================================================

    fn dispatch(&mut self, target: SendTarget, event: Event, delay: f64) {
        match target {
            SendTarget::Internal if delay > 0.0 => {
                self.timers.schedule(delay, SendTarget::Internal, event)
            }
            SendTarget::Internal => self.queue.push(event),
            SendTarget::Parent if !self.has_parent => {
                self.queue
                    .push(Event::communication_error(&event.name, "#_parent"));
            }
            SendTarget::Parent if delay > 0.0 => {
                self.timers.schedule(delay, SendTarget::Parent, event)
            }
            SendTarget::Parent => self.outbox.push(event),
            SendTarget::Invocation(id) => self.deliver_to_invocation(&id, event, delay),
            SendTarget::Unsupported(target) => {
                tracing::debug!("unsupported send target '{}'", target);
                self.queue
                    .push(Event::communication_error(&event.name, &target));
            }
        }
    }

    fn deliver_to_invocation(&mut self, id: &str, event: Event, delay: f64) {
        let Some(index) = self
            .invocations
            .iter()
            .rposition(|r| r.id == id && r.accepts_events())
        else {
            self.queue
                .push(Event::communication_error(&event.name, &format!("#_{}", id)));
            return;
        };

        if let Some(child) = self.invocations[index].child.as_mut() {
            if delay > 0.0 {
                child.timers.schedule(delay, SendTarget::Internal, event);
            } else {
                child.process(event);
            }
        }
        self.collect_outbox(index);
    }

    // =========================================================================
    // Executable content
    // =========================================================================

    fn run_actions(&mut self, actions: &[Action]) {
        for action in actions {
            self.run_action(action);
        }
    }

    fn run_action(&mut self, action: &Action) {
        match action {
            Action::Log { label, expr } => {
                let value = expr.as_deref().map(|e| self.eval(e)).unwrap_or(Value::Null);
                let entry = format!("{}:{}", label.as_deref().unwrap_or("log"), render(&value));
                tracing::debug!("log {}", entry);
                self.log.actions.push(entry);
            }
            Action::Assign { location, expr } => {
                let value = match expr.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
                    Some(expr) => self.eval(expr),
                    None => increment(&self.eval(location)),
                };
                self.assign(location, value);
            }
            Action::Raise { event } => self.queue.push(Event::new(event.clone())),
            Action::Send(send) => self.execute_send(send),
            Action::Cancel { sendid, sendidexpr } => {
                let id = match (sendid, sendidexpr) {
                    (Some(id), _) => Some(id.clone()),
                    (None, Some(expr)) => Some(render(&self.eval(expr))),
                    (None, None) => None,
                };
                if let Some(id) = id {
                    let removed = self.timers.cancel(&id);
                    tracing::debug!("canceled {} timer(s) for '{}'", removed, id);
                }
            }
            Action::Foreach {
                array,
                item,
                index,
                body,
            } => self.run_foreach(array, item, index, body),
            Action::If {
                branches,
                otherwise,
            } => {
                let chosen = branches
                    .iter()
                    .find(|b| condition_holds(Some(b.cond.as_str()), self))
                    .map(|b| &b.body)
                    .unwrap_or(otherwise);
                self.run_actions(chosen);
            }
            Action::Script { source } => self.run_script(source),
        }
    }

    fn run_foreach(&mut self, array: &str, item: &str, index: &str, body: &[Action]) {
        let items = match self.eval(array) {
            Value::Array(items) => items,
            Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
            Value::Null => Vec::new(),
            scalar => vec![scalar],
        };

        let saved_item = self.data.get(item).cloned();
        let saved_index = self.data.get(index).cloned();
        for (i, value) in items.into_iter().enumerate() {
            self.data.insert(item.to_string(), value);
            self.data.insert(index.to_string(), Value::from(i));
            self.run_actions(body);
        }
        restore(&mut self.data, item, saved_item);
        restore(&mut self.data, index, saved_index);
    }

    /// Runs `location = expr` statements separated by `;` or newlines.
    fn run_script(&mut self, source: &str) {
        for statement in source.split([';', '\n']) {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            match split_assignment(statement) {
                Some((location, expr)) => {
                    let value = self.eval(&expr);
                    self.assign(location, value);
                }
                None => tracing::debug!("ignoring script statement '{}'", statement),
            }
        }
    }

    fn execute_send(&mut self, send: &SendAction) {
        let name = match (&send.event, &send.eventexpr) {
            (Some(event), _) => event.clone(),
            (None, Some(expr)) => render(&self.eval(expr)),
            (None, None) => String::new(),
        };
        if name.is_empty() {
            self.queue.push(
                Event::new(ERROR_EXECUTION).with_data(json!({ "reason": "send without event" })),
            );
            return;
        }

        let target = match (&send.target, &send.targetexpr) {
            (Some(target), _) => Some(target.clone()),
            (None, Some(expr)) => Some(render(&self.eval(expr))),
            (None, None) => None,
        };
        let delay = match (&send.delay, &send.delayexpr) {
            (Some(delay), _) => parse_delay(delay),
            (None, Some(expr)) => parse_delay(&render(&self.eval(expr))),
            (None, None) => 0.0,
        };

        let sendid = match (&send.id, &send.idlocation) {
            (Some(id), _) => Some(id.clone()),
            (None, Some(location)) => {
                let id = format!("send{}", self.send_seq);
                self.send_seq += 1;
                self.assign(location, Value::String(id.clone()));
                Some(id)
            }
            (None, None) => None,
        };

        let data = self.payload(&send.params, &send.namelist, send.content.as_ref());
        let event = Event::new(name).with_data(data).with_sendid(sendid);
        self.dispatch(SendTarget::parse(target.as_deref()), event, delay);
    }

    /// Builds an event payload from `<content>`, or from `namelist` and
    /// `<param>` values.
    fn payload(&self, params: &[Param], namelist: &[String], content: Option<&Content>) -> Value {
        if let Some(content) = content {
            return match &content.expr {
                Some(expr) => self.eval(expr),
                None => content.value.clone(),
            };
        }

        let mut data = Map::new();
        for name in namelist {
            data.insert(name.clone(), self.eval(name));
        }
        for param in params {
            data.insert(param.name.clone(), self.param_value(param));
        }
        if data.is_empty() {
            Value::Null
        } else {
            Value::Object(data)
        }
    }

    fn param_value(&self, param: &Param) -> Value {
        match (&param.expr, &param.location) {
            (Some(expr), _) => self.eval(expr),
            (None, Some(location)) => self.eval(location),
            (None, None) => Value::Null,
        }
    }

    fn eval(&self, text: &str) -> Value {
        Expr::parse_value(text).evaluate(self)
    }

    fn assign(&mut self, location: &str, value: Value) {
        match assign_path(&mut self.data, location, value) {
            Some(key) => {
                self.log.touched.insert(key);
            }
            None => tracing::warn!("cannot assign to '{}'", location),
        }
    }

    // =========================================================================
    // Data model
    // =========================================================================

    fn init_datamodel(&mut self) {
        let doc = Arc::clone(&self.doc);
        let defs = doc
            .datamodel()
            .iter()
            .chain(doc.nodes().flat_map(|(_, node)| node.datamodel.iter()));
        for def in defs {
            let value = self.data_value(def);
            self.data.insert(def.id.clone(), value);
        }
    }

    fn data_value(&mut self, def: &DataDef) -> Value {
        if let Some(expr) = &def.expr {
            return self.eval(expr);
        }
        if let Some(src) = &def.src {
            return match load_value(src, self.doc.base_dir()) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!("data '{}' could not be loaded: {}", def.id, err);
                    self.queue.push(
                        Event::new(ERROR_EXECUTION)
                            .with_data(json!({ "data": def.id, "reason": err.to_string() })),
                    );
                    Value::Null
                }
            };
        }
        match &def.content {
            Value::String(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
            other => other.clone(),
        }
    }
}

impl Scope for Interpreter {
    fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    fn event(&self) -> Option<&Event> {
        self.current_event.as_ref()
    }

    fn is_active(&self, state: &str) -> bool {
        self.is_in_state(state)
    }
}

/// Renders a value for logs and string contexts.
fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn increment(current: &Value) -> Value {
    match current {
        Value::Number(n) => match n.as_i64().and_then(|i| i.checked_add(1)) {
            Some(i) => Value::from(i),
            None => Value::from(n.as_f64().unwrap_or(0.0) + 1.0),
        },
        _ => Value::from(1),
    }
}

fn restore(data: &mut Map<String, Value>, key: &str, saved: Option<Value>) {
    match saved {
        Some(value) => {
            data.insert(key.to_string(), value);
        }
        None => {
            data.remove(key);
        }
    }
}

/// Splits `loc = expr` (or `loc += n`) into location and expression.
fn split_assignment(statement: &str) -> Option<(&str, String)> {
    let bytes = statement.as_bytes();
    let eq = (0..bytes.len()).find(|&i| {
        bytes[i] == b'='
            && bytes.get(i + 1) != Some(&b'=')
            && !(i > 0 && matches!(bytes[i - 1], b'=' | b'!' | b'<' | b'>'))
    })?;

    let rhs = statement[eq + 1..].trim();
    match statement[..eq].trim_end().strip_suffix('+') {
        Some(location) => {
            let location = location.trim();
            (!location.is_empty()).then(|| (location, format!("{} + {}", location, rhs)))
        }
        None => {
            let location = statement[..eq].trim();
            (!location.is_empty()).then(|| (location, rhs.to_string()))
        }
    }
}
