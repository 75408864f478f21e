//! Queue, fence and semaphore tracking.
//!
//! Every queue submission gets the next sequence id of its queue. Work is
//! retired strictly in submission order when the driver reports completion;
//! a fence is signaled once its sequence id is at or below its queue's
//! retired id.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use memtrack_core::{HandleRegistry, TrackError};
use memtrack_protocol::calls::SubmitBatch;
use memtrack_protocol::{Completion, Diagnostic, Handle, ObjectKind, Severity};
use tracing::debug;

use crate::command::{CommandTracker, Submission};
use crate::memory::MemoryTracker;

/// The work of one submit call. All of it retires together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub sequence: u64,
    pub command_buffers: Vec<Handle>,
    pub fence: Option<Handle>,
    /// Semaphores the batch waits on; unset again once it retires
    pub wait_semaphores: Vec<Handle>,
    /// Memory referenced by the batch's command buffers at submit time
    pub memory: BTreeSet<Handle>,
}

#[derive(Debug, Default)]
pub struct Queue {
    last_submitted: u64,
    last_retired: u64,
    in_flight: VecDeque<Batch>,
    /// Memory referenced by in-flight work, with the number of batches holding it
    memory_refs: BTreeMap<Handle, usize>,
}

impl Queue {
    pub fn last_submitted(&self) -> u64 {
        self.last_submitted
    }

    pub fn last_retired(&self) -> u64 {
        self.last_retired
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &Batch> {
        self.in_flight.iter()
    }

    pub fn in_flight_memory(&self) -> Vec<Handle> {
        self.memory_refs.keys().copied().collect()
    }

    pub fn is_retired(&self, sequence: u64) -> bool {
        sequence <= self.last_retired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Unsignaled,
    Signaled,
    /// Submitted; not yet observed retired
    InUse,
}

#[derive(Debug, Clone)]
pub struct Fence {
    state: FenceState,
    queue: Option<Handle>,
    sequence: u64,
}

impl Fence {
    pub fn state(&self) -> FenceState {
        self.state
    }

    /// `(queue, sequence)` of the submission this fence is waiting for.
    pub fn submission(&self) -> Option<(Handle, u64)> {
        match (self.state, self.queue) {
            (FenceState::InUse, Some(queue)) => Some((queue, self.sequence)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreState {
    Unset,
    Signaled,
    Wait,
}

#[derive(Debug, Clone)]
pub struct Semaphore {
    state: SemaphoreState,
}

impl Semaphore {
    pub fn state(&self) -> SemaphoreState {
        self.state
    }
}

/// Owner of queue, fence and semaphore records of one device.
#[derive(Debug)]
pub struct QueueTracker {
    queues: HandleRegistry<Queue>,
    fences: HandleRegistry<Fence>,
    semaphores: HandleRegistry<Semaphore>,
}

impl QueueTracker {
    pub fn new() -> Self {
        Self {
            queues: HandleRegistry::new(ObjectKind::Queue),
            fences: HandleRegistry::new(ObjectKind::Fence),
            semaphores: HandleRegistry::new(ObjectKind::Semaphore),
        }
    }

    // ── Queues ──────────────────────────────────────────────

    /// Track a queue. Retrieving the same queue again is not an error.
    pub fn add_queue(&mut self, queue: Handle) -> Result<bool, TrackError> {
        if self.queues.contains(queue) {
            return Ok(false);
        }
        self.queues.register(queue, Queue::default())?;
        debug!("tracking {}", queue);
        Ok(true)
    }

    pub fn queue(&self, queue: Handle) -> Result<&Queue, TrackError> {
        self.queues.lookup(queue)
    }

    pub fn queues(&self) -> Vec<Handle> {
        self.queues.handles()
    }

    /// Whether `submission` has retired. Submissions to a queue that is no
    /// longer tracked count as retired.
    pub fn is_retired(&self, submission: &Submission) -> bool {
        self.queues
            .lookup(submission.queue)
            .map(|q| q.is_retired(submission.sequence))
            .unwrap_or(true)
    }

    /// Validate and record a queue submission. All batches share one sequence
    /// id. Returns that id.
    pub fn submit(
        &mut self,
        queue: Handle,
        submits: &[SubmitBatch],
        fence: Option<Handle>,
        commands: &mut CommandTracker,
        warnings: &mut Vec<Diagnostic>,
    ) -> Result<u64, TrackError> {
        let q = self.queues.lookup(queue)?;
        let sequence = q.last_submitted + 1;

        if let Some(fence) = fence {
            self.check_fence_submittable(fence)?;
        }

        let command_buffers: Vec<Handle> = submits.iter().flat_map(|s| s.command_buffers.iter().copied()).collect();
        for cb in &command_buffers {
            commands.check_submittable(*cb, self)?;
        }

        for submit in submits {
            for sem in &submit.wait_semaphores {
                let state = self.semaphores.lookup(*sem)?.state;
                if state == SemaphoreState::Wait {
                    return Err(TrackError::InvalidState {
                        handle: *sem,
                        detail: "already waited on by an unretired submission".to_string(),
                    });
                }
                if state != SemaphoreState::Signaled {
                    warnings.push(
                        Diagnostic::from(TrackError::InvalidState {
                            handle: *sem,
                            detail: "waited on without a pending signal".to_string(),
                        })
                        .with_severity(Severity::Warning),
                    );
                }
            }
            for sem in &submit.signal_semaphores {
                let state = self.semaphores.lookup(*sem)?.state;
                if state == SemaphoreState::Signaled {
                    return Err(TrackError::InvalidState {
                        handle: *sem,
                        detail: "signaled again before any wait consumed the pending signal".to_string(),
                    });
                }
            }
        }

        // ── commit ──
        let mut memory = BTreeSet::new();
        for cb in &command_buffers {
            memory.extend(commands.get(*cb)?.memory_refs().iter().copied());
            commands.mark_submitted(*cb, Submission { queue, sequence, fence })?;
        }
        for submit in submits {
            for sem in &submit.wait_semaphores {
                self.semaphores.lookup_mut(*sem)?.state = SemaphoreState::Wait;
            }
            for sem in &submit.signal_semaphores {
                self.semaphores.lookup_mut(*sem)?.state = SemaphoreState::Signaled;
            }
        }
        if let Some(fence) = fence {
            let f = self.fences.lookup_mut(fence)?;
            f.state = FenceState::InUse;
            f.queue = Some(queue);
            f.sequence = sequence;
        }

        let q = self.queues.lookup_mut(queue)?;
        for mem in &memory {
            *q.memory_refs.entry(*mem).or_insert(0) += 1;
        }
        q.last_submitted = sequence;
        q.in_flight.push_back(Batch {
            sequence,
            command_buffers,
            fence,
            wait_semaphores: submits.iter().flat_map(|s| s.wait_semaphores.iter().copied()).collect(),
            memory,
        });
        debug!("submission {} on {} ({} in flight)", sequence, queue, q.in_flight.len());
        Ok(sequence)
    }

    /// Retire everything on `queue` up to and including `sequence`.
    ///
    /// The retired id only moves forward and never past the last submission;
    /// a report that breaks either rule means completion tracking is out of
    /// sync and leaves the queue untouched.
    pub fn retire_up_to(
        &mut self,
        queue: Handle,
        sequence: u64,
        commands: &mut CommandTracker,
        memory: &mut MemoryTracker,
    ) -> Result<Vec<Batch>, TrackError> {
        let q = self.queues.lookup(queue)?;
        if sequence < q.last_retired {
            return Err(TrackError::internal(&[queue], format!(
                "{} retire to {} is behind the already retired id {}",
                queue, sequence, q.last_retired
            )));
        }
        if sequence > q.last_submitted {
            return Err(TrackError::internal(&[queue], format!(
                "{} retire to {} is ahead of the last submitted id {}",
                queue, sequence, q.last_submitted
            )));
        }

        let q = self.queues.lookup_mut(queue)?;
        let mut retired = Vec::new();
        while q.in_flight.front().is_some_and(|b| b.sequence <= sequence) {
            if let Some(batch) = q.in_flight.pop_front() {
                for mem in &batch.memory {
                    if let Some(count) = q.memory_refs.get_mut(mem) {
                        *count -= 1;
                        if *count == 0 {
                            q.memory_refs.remove(mem);
                        }
                    }
                }
                retired.push(batch);
            }
        }
        q.last_retired = sequence;

        for batch in &retired {
            if let Some(fence) = batch.fence {
                if let Ok(f) = self.fences.lookup_mut(fence) {
                    if f.state == FenceState::InUse && f.sequence == batch.sequence {
                        f.state = FenceState::Signaled;
                    }
                }
            }
            for sem in &batch.wait_semaphores {
                if let Ok(s) = self.semaphores.lookup_mut(*sem) {
                    if s.state == SemaphoreState::Wait {
                        s.state = SemaphoreState::Unset;
                    }
                }
            }
            for cb in &batch.command_buffers {
                commands.on_retired(*cb, batch.sequence, memory)?;
            }
        }
        if !retired.is_empty() {
            debug!("{} retired {} submission(s) up to {}", queue, retired.len(), sequence);
        }
        Ok(retired)
    }

    /// Completion that retires everything submitted to `queue` so far.
    pub fn idle_completion(&self, queue: Handle) -> Result<Completion, TrackError> {
        let q = self.queues.lookup(queue)?;
        Ok(Completion {
            queue,
            sequence: q.last_submitted,
        })
    }

    // ── Fences ──────────────────────────────────────────────

    pub fn create_fence(&mut self, fence: Handle, signaled: bool) -> Result<(), TrackError> {
        let state = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        self.fences.register(
            fence,
            Fence {
                state,
                queue: None,
                sequence: 0,
            },
        )?;
        debug!("created {} ({:?})", fence, state);
        Ok(())
    }

    pub fn fence(&self, fence: Handle) -> Result<&Fence, TrackError> {
        self.fences.lookup(fence)
    }

    pub fn destroy_fence(&mut self, fence: Handle) -> Result<(), TrackError> {
        if self.fence_in_flight(fence)? {
            return Err(TrackError::InvalidFenceState {
                fence,
                detail: "destroyed while its submission has not retired".to_string(),
            });
        }
        self.fences.unregister(fence)?;
        debug!("destroyed {}", fence);
        Ok(())
    }

    /// Reset fences to unsignaled. Nothing is reset if any fence is still in flight.
    pub fn reset_fences(&mut self, fences: &[Handle], warnings: &mut Vec<Diagnostic>) -> Result<(), TrackError> {
        for fence in fences {
            if self.fence_in_flight(*fence)? {
                return Err(TrackError::InvalidFenceState {
                    fence: *fence,
                    detail: "reset while its submission has not retired".to_string(),
                });
            }
        }

        for fence in fences {
            let f = self.fences.lookup_mut(*fence)?;
            if f.state == FenceState::Unsignaled {
                warnings.push(
                    Diagnostic::from(TrackError::InvalidFenceState {
                        fence: *fence,
                        detail: "reset while already unsignaled".to_string(),
                    })
                    .with_severity(Severity::Warning),
                );
            }
            f.state = FenceState::Unsignaled;
            f.queue = None;
            f.sequence = 0;
        }
        Ok(())
    }

    /// Whether `fence` is signaled, resolved against its queue's retired id.
    /// Never changes tracker state.
    pub fn fence_status(&self, fence: Handle) -> Result<bool, TrackError> {
        let f = self.fences.lookup(fence)?;
        Ok(match f.state {
            FenceState::Signaled => true,
            FenceState::Unsignaled => false,
            FenceState::InUse => match f.queue {
                Some(queue) => self.queues.lookup(queue)?.is_retired(f.sequence),
                None => false,
            },
        })
    }

    /// Completion implied by observing `fence` signaled, if it guards a submission.
    pub fn fence_completion(&self, fence: Handle) -> Result<Option<Completion>, TrackError> {
        Ok(self
            .fences
            .lookup(fence)?
            .submission()
            .map(|(queue, sequence)| Completion { queue, sequence }))
    }

    fn fence_in_flight(&self, fence: Handle) -> Result<bool, TrackError> {
        let f = self.fences.lookup(fence)?;
        match f.submission() {
            Some((queue, sequence)) => Ok(!self.queues.lookup(queue)?.is_retired(sequence)),
            None => Ok(false),
        }
    }

    fn check_fence_submittable(&self, fence: Handle) -> Result<(), TrackError> {
        let f = self.fences.lookup(fence)?;
        if self.fence_in_flight(fence)? {
            return Err(TrackError::InvalidFenceState {
                fence,
                detail: format!("already associated with unretired submission {}", f.sequence),
            });
        }
        if f.state == FenceState::Signaled {
            return Err(TrackError::InvalidFenceState {
                fence,
                detail: "submitted in the signaled state; reset it before reuse".to_string(),
            });
        }
        Ok(())
    }

    // ── Semaphores ──────────────────────────────────────────

    pub fn create_semaphore(&mut self, semaphore: Handle) -> Result<(), TrackError> {
        self.semaphores.register(
            semaphore,
            Semaphore {
                state: SemaphoreState::Unset,
            },
        )
    }

    pub fn semaphore(&self, semaphore: Handle) -> Result<&Semaphore, TrackError> {
        self.semaphores.lookup(semaphore)
    }

    pub fn destroy_semaphore(&mut self, semaphore: Handle) -> Result<(), TrackError> {
        if self.semaphores.lookup(semaphore)?.state == SemaphoreState::Wait {
            return Err(TrackError::InvalidState {
                handle: semaphore,
                detail: "destroyed while a queue is waiting on it".to_string(),
            });
        }
        self.semaphores.unregister(semaphore)?;
        Ok(())
    }
}

impl Default for QueueTracker {
    fn default() -> Self {
        Self::new()
    }
}
