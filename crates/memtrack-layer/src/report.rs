//! Diagnostic delivery and per-call verdicts.

use memtrack_protocol::{Diagnostic, Severity};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Receives every diagnostic at or above the configured minimum severity.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: &Diagnostic);
}

/// Emits diagnostics as log events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, d: &Diagnostic) {
        match d.severity {
            Severity::Info => info!(kind = %d.kind, "{}", d.message),
            Severity::Warning => warn!(kind = %d.kind, "{}", d.message),
            Severity::Error => error!(kind = %d.kind, "{}", d.message),
            Severity::Fatal => error!(kind = %d.kind, fatal = true, "{}", d.message),
        }
    }
}

/// Keeps diagnostics in memory. Used by the replay tool and tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    collected: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything collected so far.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.collected.lock())
    }

    pub fn len(&self) -> usize {
        self.collected.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, d: &Diagnostic) {
        debug!("collected {}", d);
        self.collected.lock().push(d.clone());
    }
}

/// Outcome of validating one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub diagnostics: Vec<Diagnostic>,
    /// The dispatch layer should not forward the call to the driver
    pub skip_call: bool,
}

impl Verdict {
    pub fn pass() -> Self {
        Self::default()
    }

    /// No diagnostic of error severity or above.
    pub fn passed(&self) -> bool {
        !self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn has(&self, kind: memtrack_protocol::ErrorKind) -> bool {
        self.diagnostics.iter().any(|d| d.kind == kind)
    }

    pub(crate) fn merge(&mut self, other: Verdict) {
        self.skip_call |= other.skip_call;
        self.diagnostics.extend(other.diagnostics);
    }
}
