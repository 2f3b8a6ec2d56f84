//! # chartrun-core
//!
//! Statechart interpreter for chartrun.
//!
//! This crate provides:
//! - scjson document indexing and initial configuration resolution
//! - Transition selection, conflict resolution and microstep execution
//! - Shallow/deep history and completion (`done.state.*`) events
//! - Invocations of child statecharts, delayed sends and send routing
//! - A small expression/condition evaluator
//! - JSONL trace emission

pub mod document;
pub mod error;
pub mod events;
pub mod expr;
pub mod interpreter;
pub mod invoke;
pub mod loader;
mod resolver;
pub mod trace;

pub use document::{Document, NodeId, NodeKind};
pub use error::CoreError;
pub use events::{Event, SendTarget};
pub use interpreter::{
    Diagnostic, DiagnosticKind, EngineLimits, FiredTransition, Interpreter, MacroStep,
};
pub use invoke::{InvocationRecord, InvokeStatus};
pub use loader::{load_document, DocumentConverter};
pub use trace::{TraceOptions, TraceRunner, TraceStep};
