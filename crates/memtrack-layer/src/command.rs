//! Command pool and command buffer tracking.
//!
//! A command buffer moves `Initial -> Recording -> Executable`, and back to
//! `Initial` on reset (explicit, implicit through begin, or on retirement of
//! a one-time-submit buffer). While recording it collects the memory objects
//! its commands touch; those references are held until the buffer is reset
//! or destroyed, which is refused while its last submission is in flight.

use std::collections::BTreeSet;
use std::fmt;

use memtrack_core::{HandleRegistry, TrackError};
use memtrack_protocol::flags::{CommandBufferUsage, CommandPoolFlags};
use memtrack_protocol::{Handle, ObjectKind};
use tracing::debug;

use crate::memory::MemoryTracker;
use crate::sync::QueueTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

impl fmt::Display for CommandBufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandBufferState::Initial => "initial",
            CommandBufferState::Recording => "recording",
            CommandBufferState::Executable => "executable",
        };
        f.write_str(s)
    }
}

/// Where and when a command buffer was last submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub queue: Handle,
    pub sequence: u64,
    pub fence: Option<Handle>,
}

#[derive(Debug, Clone)]
pub struct CommandBuffer {
    pub pool: Handle,
    state: CommandBufferState,
    usage: CommandBufferUsage,
    memory_refs: BTreeSet<Handle>,
    last_submission: Option<Submission>,
}

impl CommandBuffer {
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn usage(&self) -> CommandBufferUsage {
        self.usage
    }

    pub fn memory_refs(&self) -> &BTreeSet<Handle> {
        &self.memory_refs
    }

    pub fn last_submission(&self) -> Option<Submission> {
        self.last_submission
    }

    /// Drop every memory reference this buffer holds.
    fn release_references(&mut self, command_buffer: Handle, memory: &mut MemoryTracker) -> Result<(), TrackError> {
        for mem in std::mem::take(&mut self.memory_refs) {
            memory.remove_command_buffer_ref(mem, command_buffer).map_err(|e| {
                TrackError::internal(&[command_buffer, mem], format!(
                    "releasing {} reference from {}: {}",
                    mem, command_buffer, e
                ))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CommandPool {
    pub flags: CommandPoolFlags,
    buffers: BTreeSet<Handle>,
}

impl CommandPool {
    pub fn buffers(&self) -> &BTreeSet<Handle> {
        &self.buffers
    }
}

/// Owner of command pool and command buffer records.
#[derive(Debug)]
pub struct CommandTracker {
    pools: HandleRegistry<CommandPool>,
    buffers: HandleRegistry<CommandBuffer>,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self {
            pools: HandleRegistry::new(ObjectKind::CommandPool),
            buffers: HandleRegistry::new(ObjectKind::CommandBuffer),
        }
    }

    // ── Pools ───────────────────────────────────────────────

    pub fn create_pool(&mut self, pool: Handle, flags: CommandPoolFlags) -> Result<(), TrackError> {
        self.pools.register(
            pool,
            CommandPool {
                flags,
                buffers: BTreeSet::new(),
            },
        )?;
        debug!("created {} ({:?})", pool, flags);
        Ok(())
    }

    pub fn pool(&self, pool: Handle) -> Result<&CommandPool, TrackError> {
        self.pools.lookup(pool)
    }

    /// Destroy a pool and every buffer it owns. Aborts untouched if any
    /// owned buffer is still in flight. Returns the destroyed buffers.
    pub fn destroy_pool(
        &mut self,
        pool: Handle,
        queues: &QueueTracker,
        memory: &mut MemoryTracker,
    ) -> Result<Vec<Handle>, TrackError> {
        let owned: Vec<Handle> = self.pools.lookup(pool)?.buffers.iter().copied().collect();
        self.ensure_retired(&owned, queues)?;

        for cb in &owned {
            self.destroy(*cb, queues, memory)?;
        }
        self.pools.unregister(pool)?;
        debug!("destroyed {} and {} command buffer(s)", pool, owned.len());
        Ok(owned)
    }

    /// Reset every buffer a pool owns. Aborts untouched if any is in flight.
    pub fn reset_pool(
        &mut self,
        pool: Handle,
        queues: &QueueTracker,
        memory: &mut MemoryTracker,
    ) -> Result<(), TrackError> {
        let owned: Vec<Handle> = self.pools.lookup(pool)?.buffers.iter().copied().collect();
        self.ensure_retired(&owned, queues)?;

        for cb in &owned {
            self.reset(*cb, queues, memory)?;
        }
        Ok(())
    }

    // ── Buffers ─────────────────────────────────────────────

    /// Register freshly allocated buffers in `pool`.
    pub fn allocate(&mut self, pool: Handle, command_buffers: &[Handle]) -> Result<(), TrackError> {
        self.pools.lookup(pool)?;
        ensure_distinct(command_buffers)?;
        for cb in command_buffers {
            if self.buffers.contains(*cb) {
                return Err(TrackError::invalid_object(*cb, "handle is already registered"));
            }
        }

        for cb in command_buffers {
            self.buffers.register(
                *cb,
                CommandBuffer {
                    pool,
                    state: CommandBufferState::Initial,
                    usage: CommandBufferUsage::empty(),
                    memory_refs: BTreeSet::new(),
                    last_submission: None,
                },
            )?;
        }
        self.pools.lookup_mut(pool)?.buffers.extend(command_buffers.iter().copied());
        debug!("allocated {} command buffer(s) from {}", command_buffers.len(), pool);
        Ok(())
    }

    /// Free buffers back to `pool`. Every buffer must belong to the pool, be
    /// listed once and not be in flight; otherwise nothing is freed.
    pub fn free(
        &mut self,
        pool: Handle,
        command_buffers: &[Handle],
        queues: &QueueTracker,
        memory: &mut MemoryTracker,
    ) -> Result<(), TrackError> {
        let owner = self.pools.lookup(pool)?;
        for cb in command_buffers {
            if !owner.buffers.contains(cb) {
                return Err(TrackError::invalid_object(*cb, format!("not allocated from {}", pool)));
            }
        }
        ensure_distinct(command_buffers)?;
        self.ensure_retired(command_buffers, queues)?;

        for cb in command_buffers {
            self.destroy(*cb, queues, memory)?;
        }
        Ok(())
    }

    pub fn get(&self, command_buffer: Handle) -> Result<&CommandBuffer, TrackError> {
        self.buffers.lookup(command_buffer)
    }

    pub fn contains(&self, command_buffer: Handle) -> bool {
        self.buffers.contains(command_buffer)
    }

    /// Start recording. An executable buffer may be re-recorded only when its
    /// pool allows individual resets; the implicit reset obeys the in-flight rule.
    pub fn begin(
        &mut self,
        command_buffer: Handle,
        usage: CommandBufferUsage,
        queues: &QueueTracker,
        memory: &mut MemoryTracker,
    ) -> Result<(), TrackError> {
        let cb = self.buffers.lookup(command_buffer)?;
        match cb.state {
            CommandBufferState::Initial => {}
            CommandBufferState::Recording => {
                return Err(TrackError::InvalidState {
                    handle: command_buffer,
                    detail: "begin called while already recording".to_string(),
                });
            }
            CommandBufferState::Executable => {
                let pool = self.pools.lookup(cb.pool)?;
                if !pool.flags.contains(CommandPoolFlags::RESET_COMMAND_BUFFER) {
                    return Err(TrackError::InvalidState {
                        handle: command_buffer,
                        detail: format!(
                            "begin on an executable command buffer whose {} lacks RESET_COMMAND_BUFFER; reset it first",
                            cb.pool
                        ),
                    });
                }
                self.ensure_retired(&[command_buffer], queues)?;
            }
        }

        let cb = self.buffers.lookup_mut(command_buffer)?;
        cb.release_references(command_buffer, memory)?;
        cb.state = CommandBufferState::Recording;
        cb.usage = usage;
        cb.last_submission = None;
        debug!("{} began recording", command_buffer);
        Ok(())
    }

    /// Fail unless `command_buffer` is recording.
    pub fn check_recording(&self, command_buffer: Handle) -> Result<(), TrackError> {
        let cb = self.buffers.lookup(command_buffer)?;
        if cb.state != CommandBufferState::Recording {
            return Err(TrackError::InvalidCommandBuffer {
                command_buffer,
                detail: format!("commands may only be recorded while recording, state is {}", cb.state),
            });
        }
        Ok(())
    }

    /// Note that a command recorded into `command_buffer` touches `mem`.
    pub fn record_memory_reference(
        &mut self,
        command_buffer: Handle,
        mem: Handle,
        memory: &mut MemoryTracker,
    ) -> Result<(), TrackError> {
        self.check_recording(command_buffer)?;
        memory.add_command_buffer_ref(mem, command_buffer)?;
        self.buffers.lookup_mut(command_buffer)?.memory_refs.insert(mem);
        Ok(())
    }

    pub fn end(&mut self, command_buffer: Handle) -> Result<(), TrackError> {
        let cb = self.buffers.lookup_mut(command_buffer)?;
        if cb.state != CommandBufferState::Recording {
            return Err(TrackError::InvalidCommandBuffer {
                command_buffer,
                detail: format!("end called on a command buffer that is {}", cb.state),
            });
        }
        cb.state = CommandBufferState::Executable;
        debug!("{} ended recording with {} memory reference(s)", command_buffer, cb.memory_refs.len());
        Ok(())
    }

    /// Return to `Initial`, releasing all memory references.
    pub fn reset(
        &mut self,
        command_buffer: Handle,
        queues: &QueueTracker,
        memory: &mut MemoryTracker,
    ) -> Result<(), TrackError> {
        self.buffers.lookup(command_buffer)?;
        self.ensure_retired(&[command_buffer], queues)?;

        let cb = self.buffers.lookup_mut(command_buffer)?;
        cb.release_references(command_buffer, memory)?;
        cb.state = CommandBufferState::Initial;
        cb.usage = CommandBufferUsage::empty();
        cb.last_submission = None;
        debug!("{} reset", command_buffer);
        Ok(())
    }

    /// Destroy a single buffer, releasing its references and pool membership.
    pub fn destroy(
        &mut self,
        command_buffer: Handle,
        queues: &QueueTracker,
        memory: &mut MemoryTracker,
    ) -> Result<(), TrackError> {
        self.buffers.lookup(command_buffer)?;
        self.ensure_retired(&[command_buffer], queues)?;

        let mut cb = self.buffers.unregister(command_buffer)?;
        cb.release_references(command_buffer, memory)?;
        if let Ok(pool) = self.pools.lookup_mut(cb.pool) {
            pool.buffers.remove(&command_buffer);
        }
        debug!("destroyed {}", command_buffer);
        Ok(())
    }

    /// Fail unless `command_buffer` may be submitted now.
    pub fn check_submittable(&self, command_buffer: Handle, queues: &QueueTracker) -> Result<(), TrackError> {
        let cb = self.buffers.lookup(command_buffer)?;
        if cb.state != CommandBufferState::Executable {
            return Err(TrackError::InvalidCommandBuffer {
                command_buffer,
                detail: format!("submitted while {}; it must be recorded and ended first", cb.state),
            });
        }
        if let Some(submission) = cb.last_submission {
            if !cb.usage.contains(CommandBufferUsage::SIMULTANEOUS_USE) && !queues.is_retired(&submission) {
                return Err(TrackError::InvalidCommandBuffer {
                    command_buffer,
                    detail: format!(
                        "already in flight as submission {} on {} and not begun with SIMULTANEOUS_USE",
                        submission.sequence, submission.queue
                    ),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn mark_submitted(&mut self, command_buffer: Handle, submission: Submission) -> Result<(), TrackError> {
        self.buffers.lookup_mut(command_buffer)?.last_submission = Some(submission);
        Ok(())
    }

    /// Called when submission `sequence` containing `command_buffer` retires.
    /// One-time-submit buffers return to `Initial` and release their references.
    pub(crate) fn on_retired(
        &mut self,
        command_buffer: Handle,
        sequence: u64,
        memory: &mut MemoryTracker,
    ) -> Result<(), TrackError> {
        let Ok(cb) = self.buffers.lookup_mut(command_buffer) else {
            return Err(TrackError::internal(&[command_buffer], format!(
                "retired submission {} names unknown {}",
                sequence, command_buffer
            )));
        };
        let latest = cb.last_submission.map(|s| s.sequence) == Some(sequence);
        if latest
            && cb.state == CommandBufferState::Executable
            && cb.usage.contains(CommandBufferUsage::ONE_TIME_SUBMIT)
        {
            cb.release_references(command_buffer, memory)?;
            cb.state = CommandBufferState::Initial;
            cb.usage = CommandBufferUsage::empty();
            cb.last_submission = None;
            debug!("one-time-submit {} returned to initial on retirement", command_buffer);
        }
        Ok(())
    }

    /// Buffers among `command_buffers` whose last submission has not retired.
    pub fn in_flight(&self, command_buffers: &[Handle], queues: &QueueTracker) -> Vec<Handle> {
        command_buffers
            .iter()
            .copied()
            .filter(|cb| {
                self.buffers
                    .lookup(*cb)
                    .ok()
                    .and_then(|record| record.last_submission)
                    .is_some_and(|s| !queues.is_retired(&s))
            })
            .collect()
    }

    fn ensure_retired(&self, command_buffers: &[Handle], queues: &QueueTracker) -> Result<(), TrackError> {
        let blockers = self.in_flight(command_buffers, queues);
        if !blockers.is_empty() {
            return Err(TrackError::ResetWhileInFlight { command_buffers: blockers });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject a handle list that names the same command buffer twice.
pub(crate) fn ensure_distinct(command_buffers: &[Handle]) -> Result<(), TrackError> {
    let mut seen = BTreeSet::new();
    for cb in command_buffers {
        if !seen.insert(*cb) {
            return Err(TrackError::invalid_object(*cb, "listed more than once"));
        }
    }
    Ok(())
}
