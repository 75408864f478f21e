use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handle::Handle;

/// Category of a reported violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Handle unknown or of the wrong kind
    InvalidObject,
    /// Command buffer used outside its legal state
    InvalidCB,
    /// Object not in the state the call requires
    InvalidState,
    /// Non-sparse bindings are immutable
    RebindObject,
    /// Removing a binding that does not exist
    ClearEmptyBindings,
    /// Binding lookup found nothing where at least one was expected
    MissingMemBindings,
    /// Generic bind-time failure
    MemoryBindingError,
    /// Memory freed while bindings or command buffer references remain
    FreedMemRef,
    /// Allocation never freed before its device was destroyed
    MemoryLeak,
    /// Reset or destroy of a command buffer whose submission has not retired
    ResetCbWhileInFlight,
    /// Fence reused or reset before its work retired
    InvalidFenceState,
    /// Create-time usage does not allow the requested use
    InvalidUsageFlag,
    /// Mapped range does not fit the allocation
    InvalidMap,
    /// Tracker bookkeeping is inconsistent; results for the session are unreliable
    InternalError,
}

impl ErrorKind {
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::InternalError => Severity::Fatal,
            ErrorKind::ClearEmptyBindings | ErrorKind::MissingMemBindings | ErrorKind::MemoryLeak => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// Halts validation for the affected session
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// One reported violation, handed to the reporting collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Offending objects, most relevant first
    pub objects: Vec<Handle>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, objects: Vec<Handle>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            objects,
            message: message.into(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity >= Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.message)
    }
}
