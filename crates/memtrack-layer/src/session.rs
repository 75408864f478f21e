use std::sync::atomic::{AtomicBool, Ordering};

use memtrack_protocol::Handle;
use parking_lot::{Mutex, MutexGuard};

use crate::binding::ResourceTracker;
use crate::command::CommandTracker;
use crate::memory::MemoryTracker;
use crate::sync::QueueTracker;

/// Per-device tracking state.
/// Each tracker has its own lock; callers go through [`DeviceSession::lock`]
/// so the locks are always taken in the same order.
pub struct DeviceSession {
    pub device: Handle,
    memory: Mutex<MemoryTracker>,
    resources: Mutex<ResourceTracker>,
    commands: Mutex<CommandTracker>,
    queues: Mutex<QueueTracker>,
    /// Set after an internal error; tracking for the device stops
    halted: AtomicBool,
}

/// All four trackers of a session, locked memory → resources → commands → queues.
pub struct SessionGuard<'a> {
    pub memory: MutexGuard<'a, MemoryTracker>,
    pub resources: MutexGuard<'a, ResourceTracker>,
    pub commands: MutexGuard<'a, CommandTracker>,
    pub queues: MutexGuard<'a, QueueTracker>,
}

impl DeviceSession {
    pub fn new(device: Handle) -> Self {
        Self {
            device,
            memory: Mutex::new(MemoryTracker::new()),
            resources: Mutex::new(ResourceTracker::new()),
            commands: Mutex::new(CommandTracker::new()),
            queues: Mutex::new(QueueTracker::new()),
            halted: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SessionGuard<'_> {
        let memory = self.memory.lock();
        let resources = self.resources.lock();
        let commands = self.commands.lock();
        let queues = self.queues.lock();
        SessionGuard {
            memory,
            resources,
            commands,
            queues,
        }
    }

    /// Only the queue tracker, for read-only fence queries.
    pub fn queues(&self) -> MutexGuard<'_, QueueTracker> {
        self.queues.lock()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }
}
