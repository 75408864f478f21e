use memtrack_protocol::{Diagnostic, ErrorKind, Handle};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A tracking violation. Each variant maps onto one reported [`ErrorKind`]
/// and carries the handles the diagnostic should name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackError {
    #[error("invalid {handle}: {detail}")]
    InvalidObject { handle: Handle, detail: String },

    #[error("{command_buffer}: {detail}")]
    InvalidCommandBuffer { command_buffer: Handle, detail: String },

    #[error("{handle}: {detail}")]
    InvalidState { handle: Handle, detail: String },

    #[error("{resource} is already bound to {current}; cannot bind to {requested} (non-sparse bindings are immutable)")]
    Rebind {
        resource: Handle,
        current: Handle,
        requested: Handle,
    },

    #[error("{resource} has no binding to clear{}", on_memory(.memory))]
    ClearEmptyBindings {
        resource: Handle,
        memory: Option<Handle>,
    },

    #[error("no memory bindings found for {handle}")]
    MissingBindings { handle: Handle },

    #[error("binding {resource} to {memory} failed: {detail}")]
    Binding {
        resource: Handle,
        memory: Handle,
        detail: String,
    },

    #[error("{memory} freed with {} outstanding reference(s): bindings [{}], command buffers [{}]",
        total(.bindings, .command_buffers), join(.bindings), join(.command_buffers))]
    FreedMemRef {
        memory: Handle,
        bindings: Vec<Handle>,
        command_buffers: Vec<Handle>,
    },

    #[error("{memory} ({size} bytes) was not freed before {device} was destroyed")]
    MemoryLeak {
        memory: Handle,
        device: Handle,
        size: u64,
    },

    #[error("work submitted with [{}] has not retired", join(.command_buffers))]
    ResetWhileInFlight { command_buffers: Vec<Handle> },

    #[error("{fence}: {detail}")]
    InvalidFenceState { fence: Handle, detail: String },

    #[error("{resource}: {detail}")]
    InvalidUsage { resource: Handle, detail: String },

    #[error("{memory}: {detail}")]
    InvalidMap { memory: Handle, detail: String },

    #[error("internal tracker error: {detail}")]
    Internal { objects: Vec<Handle>, detail: String },
}

impl TrackError {
    pub fn invalid_object(handle: Handle, detail: impl Into<String>) -> Self {
        TrackError::InvalidObject { handle, detail: detail.into() }
    }

    pub fn internal(objects: &[Handle], detail: impl Into<String>) -> Self {
        TrackError::Internal {
            objects: objects.to_vec(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackError::InvalidObject { .. } => ErrorKind::InvalidObject,
            TrackError::InvalidCommandBuffer { .. } => ErrorKind::InvalidCB,
            TrackError::InvalidState { .. } => ErrorKind::InvalidState,
            TrackError::Rebind { .. } => ErrorKind::RebindObject,
            TrackError::ClearEmptyBindings { .. } => ErrorKind::ClearEmptyBindings,
            TrackError::MissingBindings { .. } => ErrorKind::MissingMemBindings,
            TrackError::Binding { .. } => ErrorKind::MemoryBindingError,
            TrackError::FreedMemRef { .. } => ErrorKind::FreedMemRef,
            TrackError::MemoryLeak { .. } => ErrorKind::MemoryLeak,
            TrackError::ResetWhileInFlight { .. } => ErrorKind::ResetCbWhileInFlight,
            TrackError::InvalidFenceState { .. } => ErrorKind::InvalidFenceState,
            TrackError::InvalidUsage { .. } => ErrorKind::InvalidUsageFlag,
            TrackError::InvalidMap { .. } => ErrorKind::InvalidMap,
            TrackError::Internal { .. } => ErrorKind::InternalError,
        }
    }

    /// Handles named by this error, most relevant first.
    pub fn objects(&self) -> Vec<Handle> {
        match self {
            TrackError::InvalidObject { handle, .. }
            | TrackError::InvalidState { handle, .. }
            | TrackError::MissingBindings { handle } => vec![*handle],
            TrackError::InvalidCommandBuffer { command_buffer, .. } => vec![*command_buffer],
            TrackError::Rebind { resource, current, requested } => vec![*resource, *current, *requested],
            TrackError::ClearEmptyBindings { resource, memory } => {
                std::iter::once(*resource).chain(*memory).collect()
            }
            TrackError::Binding { resource, memory, .. } => vec![*resource, *memory],
            TrackError::FreedMemRef { memory, bindings, command_buffers } => std::iter::once(*memory)
                .chain(bindings.iter().copied())
                .chain(command_buffers.iter().copied())
                .collect(),
            TrackError::MemoryLeak { memory, device, .. } => vec![*memory, *device],
            TrackError::ResetWhileInFlight { command_buffers } => command_buffers.clone(),
            TrackError::InvalidFenceState { fence, .. } => vec![*fence],
            TrackError::InvalidUsage { resource, .. } => vec![*resource],
            TrackError::InvalidMap { memory, .. } => vec![*memory],
            TrackError::Internal { objects, .. } => objects.clone(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TrackError::Internal { .. })
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(self.kind(), self.objects(), self.to_string())
    }
}

impl From<TrackError> for Diagnostic {
    fn from(err: TrackError) -> Self {
        err.to_diagnostic()
    }
}

fn total(bindings: &[Handle], command_buffers: &[Handle]) -> usize {
    bindings.len() + command_buffers.len()
}

fn join(handles: &[Handle]) -> String {
    handles
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn on_memory(memory: &Option<Handle>) -> String {
    match memory {
        Some(m) => format!(" on {}", m),
        None => String::new(),
    }
}
