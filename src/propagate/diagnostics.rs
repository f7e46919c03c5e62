use std::cell::RefCell;
use std::fmt;

use rustc_hash::FxHashSet;

use crate::graph::{Graph, OpId};

/// Verbosity of per-operator diagnostics emitted during propagation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Don't show any diagnostics.
    Off,
    /// Report only operators that were skipped or could not be resolved.
    #[default]
    Warn,
    /// Also report every update made by a rule.
    Info,
}

/// Diagnostic reporter for a single propagation run.
///
/// Messages are emitted as `tracing` events with the operator's name
/// attached as the `op` field.
pub struct Diagnostics {
    /// Operators against which diagnostics have been reported at the `Warn`
    /// level or higher.
    warned_ops: RefCell<FxHashSet<OpId>>,
    level: DiagnosticLevel,
}

impl Diagnostics {
    pub fn new(level: DiagnosticLevel) -> Self {
        Self {
            warned_ops: RefCell::new(FxHashSet::default()),
            level,
        }
    }

    /// Return true if diagnostic messages are enabled at a given level.
    pub fn enabled(&self, level: DiagnosticLevel) -> bool {
        self.level >= level
    }

    /// Log a message for an operator at the [`Info`](DiagnosticLevel::Info)
    /// level.
    pub fn info(&self, graph: &Graph, op: OpId, message: fmt::Arguments<'_>) {
        if !self.enabled(DiagnosticLevel::Info) {
            return;
        }
        tracing::info!(op = op_name(graph, op), "{}", message);
    }

    /// Log a message for an operator at the [`Warn`](DiagnosticLevel::Warn)
    /// level.
    ///
    /// Only the first warning for each operator is reported.
    pub fn warn(&self, graph: &Graph, op: OpId, message: fmt::Arguments<'_>) {
        if !self.enabled(DiagnosticLevel::Warn) || !self.warned_ops.borrow_mut().insert(op) {
            return;
        }
        tracing::warn!(op = op_name(graph, op), "{}", message);
    }

    /// Return the number of operators which have been warned about.
    pub fn warned_count(&self) -> usize {
        self.warned_ops.borrow().len()
    }
}

fn op_name(graph: &Graph, op: OpId) -> &str {
    graph.op(op).map(|op| op.name()).unwrap_or_default()
}
