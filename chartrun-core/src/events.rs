//! Events, the internal queue, delayed-send timers and send routing.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;

/// Control event that completes an invocation out of band.
pub const INVOKE_COMPLETE: &str = "__invoke_complete";

/// Raised when a `<send>` cannot be delivered.
pub const ERROR_COMMUNICATION: &str = "error.communication";

/// Raised when executable content or an invoke fails.
pub const ERROR_EXECUTION: &str = "error.execution";

/// A statechart event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name.
    pub name: String,

    /// Event payload.
    #[serde(default)]
    pub data: Value,

    /// Invocation the event originated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invokeid: Option<String>,

    /// Send id of the `<send>` that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sendid: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
            invokeid: None,
            sendid: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_invokeid(mut self, invokeid: impl Into<String>) -> Self {
        self.invokeid = Some(invokeid.into());
        self
    }

    pub fn with_sendid(mut self, sendid: Option<String>) -> Self {
        self.sendid = sendid;
        self
    }

    /// The `_event` object visible to expressions.
    pub fn to_value(&self) -> Value {
        let mut value = json!({ "name": self.name, "data": self.data });
        if let Some(invokeid) = &self.invokeid {
            value["invokeid"] = Value::String(invokeid.clone());
        }
        if let Some(sendid) = &self.sendid {
            value["sendid"] = Value::String(sendid.clone());
        }
        value
    }

    /// Builds the `error.communication` event for an undeliverable send.
    pub fn communication_error(event: &str, target: &str) -> Self {
        Event::new(ERROR_COMMUNICATION).with_data(json!({ "event": event, "target": target }))
    }
}

/// FIFO queue of internal events.
#[derive(Debug, Default, Clone)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Inserts an event at a queue position, clamped to the queue length.
    pub fn insert(&mut self, index: usize, event: Event) {
        let index = index.min(self.events.len());
        self.events.insert(index, event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Timer {
    fire_at: f64,
    seq: u64,
    target: SendTarget,
    event: Event,
}

/// Pending delayed sends on a logical clock.
#[derive(Debug, Default, Clone)]
pub struct TimerList {
    now: f64,
    next_seq: u64,
    timers: Vec<Timer>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current logical time in seconds.
    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Schedules an event for `target`, `delay` seconds from now.
    pub fn schedule(&mut self, delay: f64, target: SendTarget, event: Event) {
        let fire_at = self.now + delay.max(0.0);
        let seq = self.next_seq;
        self.next_seq += 1;

        // Timers stay sorted by (fire_at, seq)
        let pos = self
            .timers
            .partition_point(|t| t.fire_at < fire_at || (t.fire_at == fire_at && t.seq < seq));
        self.timers.insert(
            pos,
            Timer {
                fire_at,
                seq,
                target,
                event,
            },
        );
    }

    /// Advances the clock and returns the due events in firing order.
    pub fn advance(&mut self, seconds: f64) -> Vec<(SendTarget, Event)> {
        if seconds.is_finite() && seconds > 0.0 {
            self.now += seconds;
        }
        let due = self
            .timers
            .partition_point(|t| t.fire_at <= self.now + f64::EPSILON);
        self.timers
            .drain(..due)
            .map(|t| (t.target, t.event))
            .collect()
    }

    /// Removes pending timers carrying the given send id.
    pub fn cancel(&mut self, sendid: &str) -> usize {
        let before = self.timers.len();
        self.timers
            .retain(|t| t.event.sendid.as_deref() != Some(sendid));
        before - self.timers.len()
    }
}

/// Where a `<send>` is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// This interpreter's internal queue.
    Internal,
    /// The invoking parent interpreter.
    Parent,
    /// A child invocation by id.
    Invocation(String),
    /// Anything else.
    Unsupported(String),
}

impl SendTarget {
    pub fn parse(target: Option<&str>) -> Self {
        match target.map(str::trim) {
            None | Some("") | Some("#_internal") | Some("internal") => SendTarget::Internal,
            Some("#_parent") => SendTarget::Parent,
            Some(t) => match t.strip_prefix("#_") {
                Some(id) if !id.is_empty() => SendTarget::Invocation(id.to_string()),
                _ => SendTarget::Unsupported(t.to_string()),
            },
        }
    }
}

/// Parses a delay string (`<number>(ms|s)`, seconds when unitless).
/// Unparseable delays count as zero.
pub fn parse_delay(delay: &str) -> f64 {
    let delay = delay.trim();
    let (number, scale) = if let Some(ms) = delay.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(s) = delay.strip_suffix('s') {
        (s, 1.0)
    } else {
        (delay, 1.0)
    };
    number
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && *n > 0.0)
        .map(|n| n * scale)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo_and_insert() {
        let mut queue = EventQueue::new();
        queue.push(Event::new("a"));
        queue.push(Event::new("b"));
        queue.insert(1, Event::new("done"));
        queue.insert(99, Event::new("last"));

        let names: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "done", "b", "last"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_timers_fire_in_time_order() {
        let mut timers = TimerList::new();
        timers.schedule(2.0, SendTarget::Internal, Event::new("late"));
        timers.schedule(1.0, SendTarget::Internal, Event::new("early"));
        timers.schedule(1.0, SendTarget::Parent, Event::new("early2"));

        assert!(timers.advance(0.5).is_empty());
        let fired = timers.advance(0.5);
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].1.name, "early");
        assert_eq!(fired[1], (SendTarget::Parent, Event::new("early2")));
        assert_eq!(timers.len(), 1);

        let fired: Vec<_> = timers.advance(5.0).into_iter().map(|(_, e)| e.name).collect();
        assert_eq!(fired, vec!["late"]);
        assert!((timers.now() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_timer_cancel() {
        let mut timers = TimerList::new();
        let a = Event::new("a").with_sendid(Some("s1".into()));
        let b = Event::new("b").with_sendid(Some("s2".into()));
        timers.schedule(1.0, SendTarget::Internal, a);
        timers.schedule(1.0, SendTarget::Internal, b);
        assert_eq!(timers.cancel("s1"), 1);
        assert_eq!(timers.cancel("missing"), 0);

        let fired: Vec<_> = timers.advance(1.0).into_iter().map(|(_, e)| e.name).collect();
        assert_eq!(fired, vec!["b"]);
    }

    #[test]
    fn test_negative_advance_is_ignored() {
        let mut timers = TimerList::new();
        timers.advance(-3.0);
        assert_eq!(timers.now(), 0.0);
    }

    #[test]
    fn test_send_target_parsing() {
        assert_eq!(SendTarget::parse(None), SendTarget::Internal);
        assert_eq!(SendTarget::parse(Some("#_internal")), SendTarget::Internal);
        assert_eq!(SendTarget::parse(Some("internal")), SendTarget::Internal);
        assert_eq!(SendTarget::parse(Some("#_parent")), SendTarget::Parent);
        assert_eq!(
            SendTarget::parse(Some("#_child1")),
            SendTarget::Invocation("child1".into())
        );
        assert_eq!(
            SendTarget::parse(Some("http://example.com")),
            SendTarget::Unsupported("http://example.com".into())
        );
        assert_eq!(
            SendTarget::parse(Some("#_")),
            SendTarget::Unsupported("#_".into())
        );
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("2s"), 2.0);
        assert_eq!(parse_delay("500ms"), 0.5);
        assert_eq!(parse_delay("3"), 3.0);
        assert_eq!(parse_delay(" 1.5s "), 1.5);
        assert_eq!(parse_delay("0s"), 0.0);
        assert_eq!(parse_delay("soon"), 0.0);
        assert_eq!(parse_delay(""), 0.0);
    }

    #[test]
    fn test_event_value() {
        let event = Event::new("go")
            .with_data(json!({"n": 1}))
            .with_invokeid("child");
        assert_eq!(
            event.to_value(),
            json!({"name": "go", "data": {"n": 1}, "invokeid": "child"})
        );
    }
}
