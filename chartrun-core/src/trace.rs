//! JSONL trace emission.
//!
//! One record per processed event, preceded by a step 0 record describing
//! the initial configuration:
//!
//! ```text
//! {"step":0,"event":null,"firedTransitions":[],"enteredStates":["A"],...}
//! {"step":1,"event":{"name":"e1","data":null},"firedTransitions":[...],...}
//! ```

use crate::document::Document;
use crate::error::CoreError;
use crate::events::Event;
use crate::interpreter::{EngineLimits, FiredTransition, Interpreter, MacroStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::io::{BufRead, Write};

/// Output shaping for a trace run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceOptions {
    /// Report only leaf states in state lists.
    pub leaf_only: bool,
    pub omit_actions: bool,
    pub omit_delta: bool,
    pub omit_transitions: bool,
    /// Seconds to advance the clock before the first event.
    pub advance_time: f64,
    /// Stop after this many event steps.
    pub max_steps: Option<u64>,
    /// Keep transition conditions instead of nulling them.
    pub keep_cond: bool,
    /// Blank step 0 delta and transitions.
    pub strip_step0_noise: bool,
    /// Blank step 0 entered and exited states.
    pub strip_step0_states: bool,
}

/// The event a record was produced for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub name: String,
    pub data: Value,
}

/// One line of trace output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    pub step: u64,
    pub event: Option<TraceEvent>,
    pub fired_transitions: Vec<FiredTransition>,
    pub entered_states: Vec<String>,
    pub exited_states: Vec<String>,
    pub configuration: Vec<String>,
    pub action_log: Vec<String>,
    pub datamodel_delta: BTreeMap<String, Value>,
}

impl TraceStep {
    fn new(step: u64, event: Option<TraceEvent>, macrostep: MacroStep) -> Self {
        Self {
            step,
            event,
            fired_transitions: macrostep.fired_transitions,
            entered_states: macrostep.entered_states,
            exited_states: macrostep.exited_states,
            configuration: macrostep.configuration,
            action_log: macrostep.action_log,
            datamodel_delta: macrostep.datamodel_delta,
        }
    }
}

/// Drives an interpreter from a JSONL event stream.
pub struct TraceRunner {
    interpreter: Interpreter,
    options: TraceOptions,
    leaves: HashSet<String>,
}

impl TraceRunner {
    pub fn new(doc: Document, options: TraceOptions) -> Self {
        Self::with_limits(doc, EngineLimits::default(), options)
    }

    pub fn with_limits(doc: Document, limits: EngineLimits, options: TraceOptions) -> Self {
        let leaves = doc.leaf_ids().into_iter().collect();
        Self {
            interpreter: Interpreter::with_limits(doc, limits),
            options,
            leaves,
        }
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn options(&self) -> &TraceOptions {
        &self.options
    }

    /// Writes step 0, then one record per event line. Returns the number
    /// of records written.
    ///
    /// Blank, malformed and nameless lines are skipped. A line of the form
    /// `{"advance_time": secs}` advances the clock without producing a
    /// record.
    pub fn run<R: BufRead, W: Write>(&mut self, events: R, mut sink: W) -> Result<u64, CoreError> {
        let initial = self.interpreter.start();
        let mut record = TraceStep::new(0, None, initial);
        if self.options.strip_step0_noise {
            record.datamodel_delta.clear();
            record.fired_transitions.clear();
        }
        if self.options.strip_step0_states {
            record.entered_states.clear();
            record.exited_states.clear();
        }
        self.emit(&mut sink, record)?;
        let mut written = 1;

        if self.options.advance_time > 0.0 {
            self.interpreter.advance_time(self.options.advance_time);
        }

        let mut step_no: u64 = 1;
        for line in events.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let message: Value = match serde_json::from_str(line) {
                Ok(message) => message,
                Err(err) => {
                    tracing::debug!("skipping malformed event line: {}", err);
                    continue;
                }
            };

            if let Some(seconds) = message.get("advance_time") {
                match as_seconds(seconds) {
                    Some(seconds) => self.interpreter.advance_time(seconds),
                    None => tracing::debug!("ignoring advance_time of {}", seconds),
                }
                continue;
            }

            if self.options.max_steps.is_some_and(|max| step_no > max) {
                break;
            }

            let Some(name) = event_name(&message) else {
                tracing::debug!("skipping event line without a name");
                continue;
            };
            let data = message.get("data").cloned().unwrap_or(Value::Null);

            let event = Event::new(name.clone()).with_data(data.clone());
            let macrostep = self.interpreter.process(event);
            self.emit(&mut sink, TraceStep::new(step_no, Some(TraceEvent { name, data }), macrostep))?;

            step_no += 1;
            written += 1;
        }

        sink.flush()?;
        Ok(written)
    }

    fn emit<W: Write>(&self, sink: &mut W, mut record: TraceStep) -> Result<(), CoreError> {
        if self.options.leaf_only {
            for states in [
                &mut record.configuration,
                &mut record.entered_states,
                &mut record.exited_states,
            ] {
                states.retain(|id| self.leaves.contains(id));
            }
        }
        if self.options.omit_actions {
            record.action_log.clear();
        }
        if self.options.omit_delta {
            record.datamodel_delta.clear();
        }
        if self.options.omit_transitions {
            record.fired_transitions.clear();
        }
        if !self.options.keep_cond {
            for fired in &mut record.fired_transitions {
                fired.cond = None;
            }
        }

        serde_json::to_writer(&mut *sink, &record)?;
        sink.write_all(b"\n")?;
        Ok(())
    }
}

fn event_name(message: &Value) -> Option<String> {
    let name = [message.get("event"), message.get("name")]
        .into_iter()
        .flatten()
        .find(|v| !matches!(v, Value::Null | Value::Bool(false)))?;
    Some(match name {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn as_seconds(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
