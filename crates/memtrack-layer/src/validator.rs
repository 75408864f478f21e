//! Entry points for the dispatch layer.
//!
//! Every intercepted call goes through [`ValidationLayer::pre_call`] before it
//! reaches the driver and [`ValidationLayer::post_call`] after. Calls that
//! create objects are recorded in `post_call` once the driver has returned the
//! handle; every other call is validated and, when it passes, applied in
//! `pre_call`. Driver completions arrive on a channel and are drained at the
//! start of every call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use memtrack_core::{MemtrackConfig, TrackError};
use memtrack_protocol::calls::SparseBind;
use memtrack_protocol::{Call, CallResult, Completion, Diagnostic, Handle, ObjectKind, RecordedCommand};
use tracing::{debug, error, info};

use crate::binding::{Binding, ResourceTracker};
use crate::command::{ensure_distinct, CommandTracker};
use crate::memory::MemoryTracker;
use crate::report::{DiagnosticSink, TracingSink, Verdict};
use crate::session::{DeviceSession, SessionGuard};
use crate::sync::Batch;

pub struct ValidationLayer {
    config: MemtrackConfig,
    sessions: DashMap<Handle, Arc<DeviceSession>>,
    /// Queue, command buffer and memory handles to the device that owns them
    owners: DashMap<Handle, Handle>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    sink: Arc<dyn DiagnosticSink>,
}

impl ValidationLayer {
    pub fn new(config: MemtrackConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: MemtrackConfig, sink: Arc<dyn DiagnosticSink>) -> Self {
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            sessions: DashMap::new(),
            owners: DashMap::new(),
            completion_tx,
            completion_rx,
            sink,
        }
    }

    pub fn config(&self) -> &MemtrackConfig {
        &self.config
    }

    /// Handle for driver-side completion reporting.
    pub fn completion_sender(&self) -> Sender<Completion> {
        self.completion_tx.clone()
    }

    pub fn session(&self, device: Handle) -> Option<Arc<DeviceSession>> {
        self.sessions.get(&device).map(|s| Arc::clone(s.value()))
    }

    pub fn device_count(&self) -> usize {
        self.sessions.len()
    }

    // ── Call hooks ──────────────────────────────────────────

    /// Validate `call` before it is forwarded to the driver.
    pub fn pre_call(&self, call: &Call) -> Verdict {
        let mut verdict = self.process_completions();

        let outcome = match call {
            Call::CreateDevice { device } => {
                let checked = if device.kind != ObjectKind::Device {
                    Err(TrackError::invalid_object(*device, "expected a device handle"))
                } else if self.sessions.contains_key(device) {
                    Err(TrackError::invalid_object(*device, "device is already tracked"))
                } else {
                    Ok(())
                };
                verdict.merge(self.conclude(None, checked, Vec::new()));
                return verdict;
            }
            Call::DestroyDevice { device } => {
                verdict.merge(self.destroy_device(*device));
                return verdict;
            }
            _ => self.session_for(call),
        };

        let session = match outcome {
            Ok(session) => session,
            Err(err) => {
                verdict.merge(self.conclude(None, Err(err), Vec::new()));
                return verdict;
            }
        };
        if session.is_halted() {
            return verdict;
        }

        let mut warnings = Vec::new();
        let result = {
            let mut guard = session.lock();
            self.validate(session.device, &mut guard, call, &mut warnings)
        };
        debug!("pre {}: {}", call.name(), if result.is_ok() { "ok" } else { "rejected" });
        verdict.merge(self.conclude(Some(&session), result, warnings));
        verdict
    }

    /// Record the effects of `call` after the driver returned `result`.
    pub fn post_call(&self, call: &Call, result: CallResult) -> Verdict {
        if result != CallResult::Success {
            return Verdict::pass();
        }

        if let Call::CreateDevice { device } = call {
            if device.kind == ObjectKind::Device && !self.sessions.contains_key(device) {
                self.sessions.insert(*device, Arc::new(DeviceSession::new(*device)));
                info!("tracking {}", device);
            }
            return Verdict::pass();
        }
        if let Call::DestroyDevice { .. } = call {
            return Verdict::pass();
        }

        let session = match self.session_for(call) {
            Ok(session) => session,
            Err(err) => return self.conclude(None, Err(err), Vec::new()),
        };
        if session.is_halted() {
            return Verdict::pass();
        }

        let (outcome, completions) = {
            let mut guard = session.lock();
            self.record(&session, &mut guard, call)
        };

        let mut verdict = self.conclude(Some(&session), outcome, Vec::new());
        for completion in completions {
            // The receiver lives as long as `self`, so this cannot fail.
            let _ = self.completion_tx.send(completion);
        }
        verdict.merge(self.process_completions());
        verdict
    }

    // ── Completion and fence queries ────────────────────────

    /// Apply every completion waiting on the channel.
    pub fn process_completions(&self) -> Verdict {
        let mut verdict = Verdict::pass();
        while let Ok(completion) = self.completion_rx.try_recv() {
            verdict.merge(self.apply_completion(completion));
        }
        verdict
    }

    /// Retire work on `queue` up to and including `sequence`.
    pub fn retire_up_to(&self, queue: Handle, sequence: u64) -> Result<Vec<Batch>, TrackError> {
        let session = self.owning_session(queue)?;
        if session.is_halted() {
            return Ok(Vec::new());
        }
        let result = {
            let mut guard = session.lock();
            let SessionGuard {
                memory,
                commands,
                queues,
                ..
            } = &mut guard;
            queues.retire_up_to(queue, sequence, commands, memory)
        };
        if let Err(err) = &result {
            self.conclude(Some(&session), Err(err.clone()), Vec::new());
        }
        result
    }

    /// Whether `fence` has signaled, from tracker state alone.
    pub fn fence_status(&self, device: Handle, fence: Handle) -> Result<bool, TrackError> {
        self.process_completions();
        let session = self.device_session(device)?;
        let queues = session.queues();
        queues.fence_status(fence)
    }

    /// Block until `fence` signals or `timeout` passes. No tracker lock is
    /// held while waiting, so submissions and completions on other threads
    /// proceed. Returns whether the fence signaled.
    pub fn wait_fence(&self, device: Handle, fence: Handle, timeout: Duration) -> Result<bool, TrackError> {
        // No deadline when the timeout does not fit in an Instant
        let deadline = Instant::now().checked_add(timeout);
        let poll = self.config.fence.poll_interval();
        loop {
            if self.fence_status(device, fence)? {
                return Ok(true);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            match self.completion_rx.recv_timeout(slice) {
                Ok(completion) => {
                    self.apply_completion(completion);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return self.fence_status(device, fence),
            }
        }
    }

    fn apply_completion(&self, completion: Completion) -> Verdict {
        let session = match self.owning_session(completion.queue) {
            Ok(session) => session,
            Err(err) => return self.conclude(None, Err(err), Vec::new()),
        };
        if session.is_halted() {
            return Verdict::pass();
        }
        let result = {
            let mut guard = session.lock();
            let SessionGuard {
                memory,
                commands,
                queues,
                ..
            } = &mut guard;
            queues
                .retire_up_to(completion.queue, completion.sequence, commands, memory)
                .map(|_| ())
        };
        self.conclude(Some(&session), result, Vec::new())
    }

    // ── Session lookup ──────────────────────────────────────

    fn device_session(&self, device: Handle) -> Result<Arc<DeviceSession>, TrackError> {
        self.session(device)
            .ok_or_else(|| TrackError::invalid_object(device, "device is not tracked"))
    }

    fn owning_session(&self, handle: Handle) -> Result<Arc<DeviceSession>, TrackError> {
        let device = self
            .owners
            .get(&handle)
            .map(|d| *d.value())
            .ok_or_else(|| TrackError::invalid_object(handle, "not owned by any tracked device"))?;
        self.device_session(device)
    }

    fn session_for(&self, call: &Call) -> Result<Arc<DeviceSession>, TrackError> {
        match call {
            Call::QueueBindSparse { queue, .. } | Call::QueueSubmit { queue, .. } | Call::QueueWaitIdle { queue } => {
                self.owning_session(*queue)
            }
            Call::BeginCommandBuffer { command_buffer, .. }
            | Call::EndCommandBuffer { command_buffer }
            | Call::ResetCommandBuffer { command_buffer }
            | Call::RecordCommand { command_buffer, .. } => self.owning_session(*command_buffer),
            Call::CreateDevice { device }
            | Call::DestroyDevice { device }
            | Call::GetDeviceQueue { device, .. }
            | Call::DeviceWaitIdle { device }
            | Call::AllocateMemory { device, .. }
            | Call::FreeMemory { device, .. }
            | Call::MapMemory { device, .. }
            | Call::UnmapMemory { device, .. }
            | Call::CreateBuffer { device, .. }
            | Call::CreateImage { device, .. }
            | Call::DestroyBuffer { device, .. }
            | Call::DestroyImage { device, .. }
            | Call::BindBufferMemory { device, .. }
            | Call::BindImageMemory { device, .. }
            | Call::UnbindMemory { device, .. }
            | Call::CreateSwapchain { device, .. }
            | Call::DestroySwapchain { device, .. }
            | Call::CreateCommandPool { device, .. }
            | Call::DestroyCommandPool { device, .. }
            | Call::ResetCommandPool { device, .. }
            | Call::AllocateCommandBuffers { device, .. }
            | Call::FreeCommandBuffers { device, .. }
            | Call::CreateFence { device, .. }
            | Call::DestroyFence { device, .. }
            | Call::ResetFences { device, .. }
            | Call::GetFenceStatus { device, .. }
            | Call::WaitForFences { device, .. }
            | Call::CreateSemaphore { device, .. }
            | Call::DestroySemaphore { device, .. } => self.device_session(*device),
        }
    }

    /// Memory allocated on another device can never back `resource`.
    fn check_memory_device(&self, resource: Handle, memory: Handle, device: Handle) -> Result<(), TrackError> {
        match self.owners.get(&memory).map(|d| *d.value()) {
            Some(owner) if owner != device => Err(TrackError::Binding {
                resource,
                memory,
                detail: format!("memory was allocated on {}, not {}", owner, device),
            }),
            _ => Ok(()),
        }
    }

    fn destroy_device(&self, device: Handle) -> Verdict {
        let Some((_, session)) = self.sessions.remove(&device) else {
            return self.conclude(
                None,
                Err(TrackError::invalid_object(device, "device is not tracked")),
                Vec::new(),
            );
        };
        self.owners.retain(|_, owner| *owner != device);

        let leaks: Vec<Diagnostic> = if session.is_halted() {
            Vec::new()
        } else {
            let mut guard = session.lock();
            guard.memory.leaks_for_device(device).into_iter().map(Diagnostic::from).collect()
        };
        info!("stopped tracking {} ({} leaked allocation(s))", device, leaks.len());
        self.conclude(None, Ok(()), leaks)
    }

    // ── Validation ──────────────────────────────────────────

    /// Check `call` and apply it when every check passes.
    fn validate(
        &self,
        device: Handle,
        guard: &mut SessionGuard<'_>,
        call: &Call,
        warnings: &mut Vec<Diagnostic>,
    ) -> Result<(), TrackError> {
        let SessionGuard {
            memory,
            resources,
            commands,
            queues,
        } = guard;

        match call {
            Call::CreateDevice { .. } | Call::DestroyDevice { .. } => Ok(()),
            Call::GetDeviceQueue { queue, .. } => expect_kind(*queue, ObjectKind::Queue),
            Call::DeviceWaitIdle { .. } => Ok(()),

            Call::AllocateMemory { memory: mem, .. } => expect_new(memory.contains(*mem), *mem),
            Call::FreeMemory { memory: mem, .. } => {
                memory.free(*mem)?;
                self.owners.remove(mem);
                Ok(())
            }
            Call::MapMemory {
                memory: mem,
                offset,
                size,
                ..
            } => memory.map(*mem, *offset, *size).map(|_| ()),
            Call::UnmapMemory { memory: mem, .. } => memory.unmap(*mem).map(|_| ()),

            Call::CreateBuffer { buffer, .. } => {
                expect_kind(*buffer, ObjectKind::Buffer)?;
                expect_new(resources.contains(*buffer), *buffer)
            }
            Call::CreateImage { image, .. } => {
                expect_kind(*image, ObjectKind::Image)?;
                expect_new(resources.contains(*image), *image)
            }
            Call::DestroyBuffer { buffer, .. } => {
                expect_kind(*buffer, ObjectKind::Buffer)?;
                resources.destroy(memory, *buffer).map(|_| ())
            }
            Call::DestroyImage { image, .. } => {
                expect_kind(*image, ObjectKind::Image)?;
                resources.destroy(memory, *image).map(|_| ())
            }
            Call::BindBufferMemory {
                buffer,
                memory: mem,
                offset,
                ..
            } => {
                self.check_memory_device(*buffer, *mem, device)?;
                resources.bind(memory, *buffer, *mem, *offset, ObjectKind::Buffer)
            }
            Call::BindImageMemory {
                image,
                memory: mem,
                offset,
                ..
            } => {
                self.check_memory_device(*image, *mem, device)?;
                resources.bind(memory, *image, *mem, *offset, ObjectKind::Image)
            }
            Call::UnbindMemory { resource, .. } => resources.unbind(memory, *resource).map(|_| ()),
            Call::QueueBindSparse { queue, binds } => {
                queues.queue(*queue)?;
                for bind in binds {
                    if let Some(mem) = bind.memory {
                        self.check_memory_device(bind.resource, mem, device)?;
                    }
                }
                bind_sparse(resources, memory, binds)
            }

            Call::CreateSwapchain { swapchain, .. } => {
                expect_kind(*swapchain, ObjectKind::Swapchain)?;
                Ok(())
            }
            Call::DestroySwapchain { swapchain, .. } => resources.destroy_swapchain(*swapchain).map(|_| ()),

            Call::CreateCommandPool { pool, .. } => expect_kind(*pool, ObjectKind::CommandPool),
            Call::DestroyCommandPool { pool, .. } => {
                let freed = commands.destroy_pool(*pool, queues, memory)?;
                for cb in freed {
                    self.owners.remove(&cb);
                }
                Ok(())
            }
            Call::ResetCommandPool { pool, .. } => commands.reset_pool(*pool, queues, memory),
            Call::AllocateCommandBuffers {
                pool, command_buffers, ..
            } => {
                commands.pool(*pool)?;
                ensure_distinct(command_buffers)?;
                for cb in command_buffers {
                    expect_kind(*cb, ObjectKind::CommandBuffer)?;
                    expect_new(commands.contains(*cb), *cb)?;
                }
                Ok(())
            }
            Call::FreeCommandBuffers {
                pool, command_buffers, ..
            } => {
                commands.free(*pool, command_buffers, queues, memory)?;
                for cb in command_buffers {
                    self.owners.remove(cb);
                }
                Ok(())
            }
            Call::BeginCommandBuffer { command_buffer, flags } => {
                commands.begin(*command_buffer, *flags, queues, memory)
            }
            Call::EndCommandBuffer { command_buffer } => commands.end(*command_buffer),
            Call::ResetCommandBuffer { command_buffer } => commands.reset(*command_buffer, queues, memory),
            Call::RecordCommand {
                command_buffer,
                command,
            } => record_command(memory, resources, commands, *command_buffer, command, warnings),

            Call::CreateFence { fence, .. } => expect_kind(*fence, ObjectKind::Fence),
            Call::DestroyFence { fence, .. } => queues.destroy_fence(*fence),
            Call::ResetFences { fences, .. } => queues.reset_fences(fences, warnings),
            Call::GetFenceStatus { fence, .. } => queues.fence(*fence).map(|_| ()),
            Call::WaitForFences { fences, .. } => {
                for fence in fences {
                    queues.fence(*fence)?;
                }
                Ok(())
            }
            Call::CreateSemaphore { semaphore, .. } => expect_kind(*semaphore, ObjectKind::Semaphore),
            Call::DestroySemaphore { semaphore, .. } => queues.destroy_semaphore(*semaphore),
            Call::QueueSubmit { queue, submits, fence } => queues
                .submit(*queue, submits, *fence, commands, warnings)
                .map(|_| ()),
            Call::QueueWaitIdle { queue } => queues.queue(*queue).map(|_| ()),
        }
    }

    /// Record objects created by a successful call and collect the
    /// completions a successful wait or query implies.
    fn record(
        &self,
        session: &DeviceSession,
        guard: &mut SessionGuard<'_>,
        call: &Call,
    ) -> (Result<(), TrackError>, Vec<Completion>) {
        let SessionGuard {
            memory,
            resources,
            commands,
            queues,
        } = guard;
        let device = session.device;
        let mut completions = Vec::new();

        let outcome = match call {
            Call::GetDeviceQueue { queue, .. } => queues.add_queue(*queue).map(|added| {
                if added {
                    self.owners.insert(*queue, device);
                }
            }),
            Call::AllocateMemory { memory: mem, info, .. } => memory.allocate(*mem, device, info.clone()).map(|()| {
                self.owners.insert(*mem, device);
            }),
            Call::CreateBuffer { buffer, info, .. } => resources.create_buffer(*buffer, info.clone()),
            Call::CreateImage { image, info, .. } => resources.create_image(*image, info.clone()),
            Call::CreateSwapchain {
                swapchain,
                images,
                image_usage,
                ..
            } => resources.create_swapchain(*swapchain, images, *image_usage),
            Call::CreateCommandPool { pool, flags, .. } => commands.create_pool(*pool, *flags),
            Call::AllocateCommandBuffers {
                pool, command_buffers, ..
            } => commands.allocate(*pool, command_buffers).map(|()| {
                for cb in command_buffers {
                    self.owners.insert(*cb, device);
                }
            }),
            Call::CreateFence { fence, signaled, .. } => queues.create_fence(*fence, *signaled),
            Call::CreateSemaphore { semaphore, .. } => queues.create_semaphore(*semaphore),

            Call::GetFenceStatus { fence, .. } => queues.fence_completion(*fence).map(|c| completions.extend(c)),
            Call::WaitForFences { fences, wait_all, .. } if *wait_all || fences.len() == 1 => {
                fences.iter().try_for_each(|fence| {
                    queues.fence_completion(*fence).map(|c| completions.extend(c))
                })
            }
            Call::QueueWaitIdle { queue } => queues.idle_completion(*queue).map(|c| completions.push(c)),
            Call::DeviceWaitIdle { .. } => queues
                .queues()
                .into_iter()
                .try_for_each(|queue| queues.idle_completion(queue).map(|c| completions.push(c))),
            _ => Ok(()),
        };
        (outcome, completions)
    }

    /// Turn a validation outcome into a verdict, report it and halt the
    /// session on internal errors.
    fn conclude(
        &self,
        session: Option<&DeviceSession>,
        outcome: Result<(), TrackError>,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Verdict {
        if let Err(err) = outcome {
            if err.is_fatal() && self.config.validation.halt_on_internal_error {
                if let Some(session) = session {
                    error!("halting validation of {}: {}", session.device, err);
                    session.halt();
                }
            }
            diagnostics.push(err.into());
        }

        let min = self.config.validation.min_severity;
        for d in diagnostics.iter().filter(|d| d.severity >= min) {
            self.sink.report(d);
        }
        let skip_call = self.config.validation.suppress_on_error && diagnostics.iter().any(Diagnostic::is_error);
        Verdict { diagnostics, skip_call }
    }
}

// ── Helpers ─────────────────────────────────────────────────

/// Validate a recorded command and add a memory reference for every bound
/// resource it touches.
fn record_command(
    memory: &mut MemoryTracker,
    resources: &ResourceTracker,
    commands: &mut CommandTracker,
    command_buffer: Handle,
    command: &RecordedCommand,
    warnings: &mut Vec<Diagnostic>,
) -> Result<(), TrackError> {
    commands.check_recording(command_buffer)?;
    let uses = command.resource_uses();
    for u in &uses {
        resources.require_usage(u.resource, u.usage)?;
    }

    let mut touched = Vec::new();
    for u in &uses {
        match resources.get(u.resource)?.binding() {
            Binding::Memory { memory: mem, .. } => touched.push(mem),
            Binding::Unbound => warnings.push(Diagnostic::from(TrackError::MissingBindings { handle: u.resource })),
            Binding::Swapchain(_) => {}
        }
    }
    for mem in touched {
        commands.record_memory_reference(command_buffer, mem, memory)?;
    }
    Ok(())
}

/// Apply a batch of sparse binds in order. Every bind is checked against the
/// state left by the binds before it, and none is applied unless all pass.
fn bind_sparse(
    resources: &mut ResourceTracker,
    memory: &mut MemoryTracker,
    binds: &[SparseBind],
) -> Result<(), TrackError> {
    // Whether each resource is bound after the binds checked so far
    let mut bound: BTreeMap<Handle, bool> = BTreeMap::new();
    for bind in binds {
        let record = resources.get(bind.resource)?;
        if !record.is_sparse() {
            return Err(TrackError::InvalidState {
                handle: bind.resource,
                detail: "sparse binding of a resource created without sparse residency".to_string(),
            });
        }
        let is_bound = *bound
            .entry(bind.resource)
            .or_insert(record.binding() != Binding::Unbound);
        match bind.memory {
            Some(mem) => {
                resources.check_bind(memory, bind.resource, mem, bind.offset, bind.resource.kind)?;
                bound.insert(bind.resource, true);
            }
            None if !is_bound => {
                return Err(TrackError::ClearEmptyBindings {
                    resource: bind.resource,
                    memory: None,
                });
            }
            None => {
                bound.insert(bind.resource, false);
            }
        }
    }

    for bind in binds {
        match bind.memory {
            Some(mem) => resources.bind(memory, bind.resource, mem, bind.offset, bind.resource.kind)?,
            None => {
                resources.unbind(memory, bind.resource)?;
            }
        }
    }
    Ok(())
}

fn expect_kind(handle: Handle, kind: ObjectKind) -> Result<(), TrackError> {
    if handle.kind != kind {
        return Err(TrackError::invalid_object(handle, format!("expected a {} handle", kind)));
    }
    if handle.is_null() {
        return Err(TrackError::invalid_object(handle, "null handle"));
    }
    Ok(())
}

fn expect_new(exists: bool, handle: Handle) -> Result<(), TrackError> {
    if exists {
        return Err(TrackError::invalid_object(handle, "handle is already registered"));
    }
    Ok(())
}
