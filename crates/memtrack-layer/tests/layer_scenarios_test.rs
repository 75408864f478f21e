//! Integration test: ValidationLayer
//!
//! End-to-end call sequences through the pre/post hooks, the completion
//! channel and fence waits.
//!
//! Run with: MEMTRACK_LOG=debug cargo test --test layer_scenarios_test -- --nocapture

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use memtrack_core::MemtrackConfig;
use memtrack_layer::{CollectingSink, ValidationLayer, Verdict};
use memtrack_protocol::calls::{
    AllocationInfo, BufferCreateInfo, ImageCreateInfo, SparseBind, SubmitBatch,
};
use memtrack_protocol::flags::{
    BufferUsage, CommandBufferUsage, CommandPoolFlags, ImageUsage, MemoryProperties,
};
use memtrack_protocol::{
    Call, CallResult, Completion, ErrorKind, Handle, RecordedCommand, Severity,
};

const DEVICE: Handle = Handle::device(1);
const QUEUE: Handle = Handle::queue(2);
const POOL: Handle = Handle::command_pool(3);
const CB1: Handle = Handle::command_buffer(4);
const FENCE: Handle = Handle::fence(5);
const MEM: Handle = Handle::memory(0x10);
const MEM2: Handle = Handle::memory(0x11);
const SRC: Handle = Handle::buffer(0x20);
const DST: Handle = Handle::buffer(0x21);

struct Harness {
    layer: ValidationLayer,
    sink: Arc<CollectingSink>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(MemtrackConfig::default())
    }

    fn with_config(config: MemtrackConfig) -> Self {
        memtrack_common::init_logging_with("warn");
        let sink = Arc::new(CollectingSink::new());
        let layer = ValidationLayer::with_sink(config, sink.clone());
        Self { layer, sink }
    }

    /// Run `call` through both hooks; the driver is assumed to succeed.
    fn call(&self, call: Call) -> Verdict {
        let pre = self.layer.pre_call(&call);
        if pre.skip_call {
            return pre;
        }
        let post = self.layer.post_call(&call, CallResult::Success);
        let mut diagnostics = pre.diagnostics;
        diagnostics.extend(post.diagnostics);
        Verdict {
            diagnostics,
            skip_call: post.skip_call,
        }
    }

    /// Run `call` and require that it raised nothing.
    fn ok(&self, call: Call) {
        let name = call.name();
        let verdict = self.call(call);
        assert!(verdict.diagnostics.is_empty(), "{} raised {:?}", name, verdict.diagnostics);
    }

    fn expect(&self, call: Call, kind: ErrorKind) -> Verdict {
        let verdict = self.call(call);
        assert!(verdict.has(kind), "expected {:?}, got {:?}", kind, verdict.diagnostics);
        verdict
    }

    /// Device with one queue, one pool and one command buffer.
    fn device(&self) {
        self.ok(Call::CreateDevice { device: DEVICE });
        self.ok(Call::GetDeviceQueue {
            device: DEVICE,
            queue: QUEUE,
        });
        self.ok(Call::CreateCommandPool {
            device: DEVICE,
            pool: POOL,
            flags: CommandPoolFlags::empty(),
        });
        self.ok(Call::AllocateCommandBuffers {
            device: DEVICE,
            pool: POOL,
            command_buffers: vec![CB1],
        });
        self.ok(Call::CreateFence {
            device: DEVICE,
            fence: FENCE,
            signaled: false,
        });
    }

    fn allocate(&self, memory: Handle, size: u64, properties: MemoryProperties) {
        self.ok(Call::AllocateMemory {
            device: DEVICE,
            memory,
            info: AllocationInfo {
                size,
                memory_type_index: 0,
                properties,
            },
        });
    }

    fn buffer(&self, buffer: Handle, size: u64, usage: BufferUsage) {
        self.ok(Call::CreateBuffer {
            device: DEVICE,
            buffer,
            info: BufferCreateInfo {
                size,
                usage,
                sparse: false,
            },
        });
    }

    fn bind(&self, buffer: Handle, memory: Handle, offset: u64) -> Verdict {
        self.call(Call::BindBufferMemory {
            device: DEVICE,
            buffer,
            memory,
            offset,
        })
    }

    /// SRC and DST bound into MEM, CB1 recorded with a copy between them.
    fn recorded_copy(&self) {
        self.allocate(MEM, 4096, MemoryProperties::DEVICE_LOCAL);
        self.buffer(SRC, 1024, BufferUsage::TRANSFER_SRC);
        self.buffer(DST, 1024, BufferUsage::TRANSFER_DST);
        assert!(self.bind(SRC, MEM, 0).diagnostics.is_empty());
        assert!(self.bind(DST, MEM, 1024).diagnostics.is_empty());
        self.ok(Call::BeginCommandBuffer {
            command_buffer: CB1,
            flags: CommandBufferUsage::empty(),
        });
        self.ok(Call::RecordCommand {
            command_buffer: CB1,
            command: RecordedCommand::CopyBuffer { src: SRC, dst: DST },
        });
        self.ok(Call::EndCommandBuffer { command_buffer: CB1 });
    }

    fn submit(&self, fence: Option<Handle>) -> Verdict {
        self.call(Call::QueueSubmit {
            queue: QUEUE,
            submits: vec![SubmitBatch {
                command_buffers: vec![CB1],
                ..Default::default()
            }],
            fence,
        })
    }

    fn refcount(&self, memory: Handle) -> u32 {
        let session = self.layer.session(DEVICE).unwrap();
        let guard = session.lock();
        guard.memory.get(memory).unwrap().ref_count()
    }

    fn memory_command_buffers(&self, memory: Handle) -> Vec<Handle> {
        let session = self.layer.session(DEVICE).unwrap();
        let guard = session.lock();
        guard.memory.get(memory).unwrap().command_buffers().iter().copied().collect()
    }
}

#[test]
fn test_allocate_bind_unbind_free() {
    let h = Harness::new();
    h.device();
    h.allocate(MEM, 4096, MemoryProperties::DEVICE_LOCAL);
    h.buffer(SRC, 1024, BufferUsage::TRANSFER_SRC);

    assert!(h.bind(SRC, MEM, 0).passed());
    assert_eq!(h.refcount(MEM), 1);
    h.ok(Call::UnbindMemory {
        device: DEVICE,
        resource: SRC,
    });
    assert_eq!(h.refcount(MEM), 0);
    h.ok(Call::FreeMemory {
        device: DEVICE,
        memory: MEM,
    });

    let verdict = h.call(Call::DestroyDevice { device: DEVICE });
    assert!(verdict.diagnostics.is_empty());
    assert_eq!(h.layer.device_count(), 0);
    assert!(h.sink.is_empty());
}

#[test]
fn test_map_scenario() {
    let h = Harness::new();
    h.device();
    h.allocate(MEM, 1024, MemoryProperties::HOST_VISIBLE);

    let verdict = h.expect(
        Call::MapMemory {
            device: DEVICE,
            memory: MEM,
            offset: 0,
            size: 2048,
        },
        ErrorKind::InvalidMap,
    );
    assert!(verdict.skip_call);

    h.ok(Call::MapMemory {
        device: DEVICE,
        memory: MEM,
        offset: 0,
        size: 512,
    });
    h.ok(Call::UnmapMemory {
        device: DEVICE,
        memory: MEM,
    });
    h.ok(Call::FreeMemory {
        device: DEVICE,
        memory: MEM,
    });
}

#[test]
fn test_rebind_scenario() {
    let h = Harness::new();
    h.device();
    h.allocate(MEM, 4096, MemoryProperties::DEVICE_LOCAL);
    h.allocate(MEM2, 4096, MemoryProperties::DEVICE_LOCAL);
    h.buffer(SRC, 1024, BufferUsage::TRANSFER_SRC);

    assert!(h.bind(SRC, MEM, 0).passed());
    let verdict = h.bind(SRC, MEM2, 0);
    assert!(verdict.has(ErrorKind::RebindObject));
    assert!(verdict.skip_call);
    assert_eq!(h.refcount(MEM), 1);
    assert_eq!(h.refcount(MEM2), 0);

    h.ok(Call::UnbindMemory {
        device: DEVICE,
        resource: SRC,
    });
    assert!(h.bind(SRC, MEM2, 0).passed());
    assert_eq!(h.refcount(MEM2), 1);
}

#[test]
fn test_free_referenced_memory_keeps_record() {
    let h = Harness::new();
    h.device();
    h.recorded_copy();

    let verdict = h.expect(
        Call::FreeMemory {
            device: DEVICE,
            memory: MEM,
        },
        ErrorKind::FreedMemRef,
    );
    assert!(verdict.skip_call);
    // Two bindings and one command buffer reference
    assert_eq!(h.refcount(MEM), 3);
    let d = &verdict.diagnostics[0];
    assert_eq!(d.objects[0], MEM);
    assert!(d.objects.contains(&CB1));
}

#[test]
fn test_reset_in_flight_command_buffer_scenario() {
    let h = Harness::new();
    h.device();
    h.recorded_copy();
    assert_eq!(h.memory_command_buffers(MEM), vec![CB1]);

    assert!(h.submit(Some(FENCE)).passed());

    let verdict = h.expect(Call::ResetCommandBuffer { command_buffer: CB1 }, ErrorKind::ResetCbWhileInFlight);
    assert!(verdict.skip_call);
    assert_eq!(h.memory_command_buffers(MEM), vec![CB1]);

    let retired = h.layer.retire_up_to(QUEUE, 1).unwrap();
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].command_buffers, vec![CB1]);

    h.ok(Call::ResetCommandBuffer { command_buffer: CB1 });
    assert!(h.memory_command_buffers(MEM).is_empty());
    assert_eq!(h.refcount(MEM), 2);
}

#[test]
fn test_completion_channel_retires_work() {
    let h = Harness::new();
    h.device();
    h.recorded_copy();
    h.submit(Some(FENCE));
    assert!(!h.layer.fence_status(DEVICE, FENCE).unwrap());

    h.layer
        .completion_sender()
        .send(Completion {
            queue: QUEUE,
            sequence: 1,
        })
        .unwrap();

    // Drained at the start of the next call
    h.ok(Call::ResetCommandBuffer { command_buffer: CB1 });
    assert!(h.layer.fence_status(DEVICE, FENCE).unwrap());
}

#[test]
fn test_wait_for_fences_success_retires_submission() {
    let h = Harness::new();
    h.device();
    h.recorded_copy();
    h.submit(Some(FENCE));

    let wait = Call::WaitForFences {
        device: DEVICE,
        fences: vec![FENCE],
        wait_all: true,
    };
    // A timed-out wait observes nothing
    assert!(h.layer.pre_call(&wait).passed());
    h.layer.post_call(&wait, CallResult::NotReady);
    assert!(!h.layer.fence_status(DEVICE, FENCE).unwrap());

    h.ok(wait);
    assert!(h.layer.fence_status(DEVICE, FENCE).unwrap());
    h.ok(Call::ResetFences {
        device: DEVICE,
        fences: vec![FENCE],
    });
}

#[test]
fn test_device_wait_idle_retires_every_queue() {
    let h = Harness::new();
    h.device();
    h.recorded_copy();
    h.submit(Some(FENCE));

    h.ok(Call::DeviceWaitIdle { device: DEVICE });
    h.ok(Call::FreeCommandBuffers {
        device: DEVICE,
        pool: POOL,
        command_buffers: vec![CB1],
    });
    assert!(h.memory_command_buffers(MEM).is_empty());

    // Freed buffers are no longer known to the layer
    h.expect(Call::EndCommandBuffer { command_buffer: CB1 }, ErrorKind::InvalidObject);
}

#[test]
fn test_wait_fence_sees_completion_from_another_thread() {
    let h = Harness::new();
    h.device();
    h.recorded_copy();
    h.submit(Some(FENCE));

    let sender = h.layer.completion_sender();
    let driver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        sender
            .send(Completion {
                queue: QUEUE,
                sequence: 1,
            })
            .unwrap();
    });

    assert!(h.layer.wait_fence(DEVICE, FENCE, Duration::from_secs(5)).unwrap());
    driver.join().unwrap();
}

#[test]
fn test_wait_fence_times_out() {
    let h = Harness::new();
    h.device();
    h.recorded_copy();
    h.submit(Some(FENCE));

    assert!(!h.layer.wait_fence(DEVICE, FENCE, Duration::from_millis(15)).unwrap());
    assert_eq!(
        h.layer.wait_fence(DEVICE, Handle::fence(99), Duration::ZERO).unwrap_err().kind(),
        ErrorKind::InvalidObject
    );
}

#[test]
fn test_wait_fence_without_deadline() {
    let h = Harness::new();
    h.device();
    let signaled = Handle::fence(6);
    h.ok(Call::CreateFence {
        device: DEVICE,
        fence: signaled,
        signaled: true,
    });
    assert!(h.layer.wait_fence(DEVICE, signaled, Duration::MAX).unwrap());

    h.recorded_copy();
    h.submit(Some(FENCE));
    h.layer
        .completion_sender()
        .send(Completion {
            queue: QUEUE,
            sequence: 1,
        })
        .unwrap();
    assert!(h.layer.wait_fence(DEVICE, FENCE, Duration::MAX).unwrap());
}

#[test]
fn test_internal_error_halts_session() {
    let h = Harness::new();
    h.device();
    h.recorded_copy();
    h.submit(None);
    h.layer.retire_up_to(QUEUE, 1).unwrap();

    let err = h.layer.retire_up_to(QUEUE, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InternalError);
    let reported = h.sink.take();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].severity, Severity::Fatal);

    let session = h.layer.session(DEVICE).unwrap();
    assert!(session.is_halted());
    assert_eq!(session.lock().queues.queue(QUEUE).unwrap().last_retired(), 1);

    // Validation for the device has stopped
    let verdict = h.call(Call::FreeMemory {
        device: DEVICE,
        memory: MEM,
    });
    assert!(verdict.diagnostics.is_empty());
    assert!(!verdict.skip_call);
}

#[test]
fn test_memory_leak_reported_on_device_destroy() {
    let h = Harness::new();
    h.device();
    h.allocate(MEM, 4096, MemoryProperties::DEVICE_LOCAL);
    h.allocate(MEM2, 512, MemoryProperties::DEVICE_LOCAL);
    h.ok(Call::FreeMemory {
        device: DEVICE,
        memory: MEM2,
    });

    let verdict = h.call(Call::DestroyDevice { device: DEVICE });
    assert_eq!(verdict.diagnostics.len(), 1);
    let leak = &verdict.diagnostics[0];
    assert_eq!(leak.kind, ErrorKind::MemoryLeak);
    assert_eq!(leak.severity, Severity::Warning);
    assert_eq!(leak.objects, vec![MEM, DEVICE]);
    assert!(!verdict.skip_call);

    // Every handle of the device is gone with it
    h.expect(Call::QueueWaitIdle { queue: QUEUE }, ErrorKind::InvalidObject);
    h.expect(
        Call::AllocateMemory {
            device: DEVICE,
            memory: MEM,
            info: AllocationInfo {
                size: 1,
                memory_type_index: 0,
                properties: MemoryProperties::empty(),
            },
        },
        ErrorKind::InvalidObject,
    );
}

#[test]
fn test_record_command_usage_and_bindings() {
    let h = Harness::new();
    h.device();
    h.allocate(MEM, 4096, MemoryProperties::DEVICE_LOCAL);
    h.buffer(SRC, 1024, BufferUsage::TRANSFER_DST);
    h.buffer(DST, 1024, BufferUsage::TRANSFER_DST);
    h.ok(Call::BeginCommandBuffer {
        command_buffer: CB1,
        flags: CommandBufferUsage::empty(),
    });

    // SRC was not created for transfer reads
    h.expect(
        Call::RecordCommand {
            command_buffer: CB1,
            command: RecordedCommand::CopyBuffer { src: SRC, dst: DST },
        },
        ErrorKind::InvalidUsageFlag,
    );

    // DST is not bound: recorded with a warning, no reference added
    let verdict = h.call(Call::RecordCommand {
        command_buffer: CB1,
        command: RecordedCommand::FillBuffer { buffer: DST },
    });
    assert!(verdict.has(ErrorKind::MissingMemBindings));
    assert!(verdict.passed());
    assert!(!verdict.skip_call);

    assert!(h.bind(DST, MEM, 0).passed());
    h.ok(Call::RecordCommand {
        command_buffer: CB1,
        command: RecordedCommand::FillBuffer { buffer: DST },
    });
    assert_eq!(h.memory_command_buffers(MEM), vec![CB1]);
}

#[test]
fn test_record_requires_recording_state() {
    let h = Harness::new();
    h.device();
    h.allocate(MEM, 4096, MemoryProperties::DEVICE_LOCAL);
    h.buffer(DST, 1024, BufferUsage::TRANSFER_DST);

    h.expect(
        Call::RecordCommand {
            command_buffer: CB1,
            command: RecordedCommand::FillBuffer { buffer: DST },
        },
        ErrorKind::InvalidCB,
    );
}

#[test]
fn test_swapchain_images_add_no_memory_references() {
    let h = Harness::new();
    h.device();
    h.allocate(MEM, 1 << 20, MemoryProperties::DEVICE_LOCAL);
    let swapchain = Handle::swapchain(7);
    let presentable = Handle::image(70);
    let staging = Handle::image(71);

    h.ok(Call::CreateSwapchain {
        device: DEVICE,
        swapchain,
        images: vec![presentable],
        image_usage: ImageUsage::TRANSFER_DST | ImageUsage::COLOR_ATTACHMENT,
    });
    h.ok(Call::CreateImage {
        device: DEVICE,
        image: staging,
        info: ImageCreateInfo {
            extent: [64, 64, 1],
            memory_size: 16384,
            usage: ImageUsage::TRANSFER_SRC,
            sparse: false,
        },
    });
    h.ok(Call::BindImageMemory {
        device: DEVICE,
        image: staging,
        memory: MEM,
        offset: 0,
    });

    h.ok(Call::BeginCommandBuffer {
        command_buffer: CB1,
        flags: CommandBufferUsage::ONE_TIME_SUBMIT,
    });
    h.ok(Call::RecordCommand {
        command_buffer: CB1,
        command: RecordedCommand::BlitImage {
            src: staging,
            dst: presentable,
        },
    });
    h.ok(Call::EndCommandBuffer { command_buffer: CB1 });
    assert_eq!(h.refcount(MEM), 2);

    h.expect(
        Call::DestroyImage {
            device: DEVICE,
            image: presentable,
        },
        ErrorKind::InvalidObject,
    );
    h.ok(Call::DestroySwapchain {
        device: DEVICE,
        swapchain,
    });
}

#[test]
fn test_sparse_binds_apply_together() {
    let h = Harness::new();
    h.device();
    h.allocate(MEM, 4096, MemoryProperties::DEVICE_LOCAL);
    h.allocate(MEM2, 4096, MemoryProperties::DEVICE_LOCAL);
    let sparse = Handle::buffer(0x30);
    h.ok(Call::CreateBuffer {
        device: DEVICE,
        buffer: sparse,
        info: BufferCreateInfo {
            size: 2048,
            usage: BufferUsage::STORAGE_BUFFER,
            sparse: true,
        },
    });
    h.buffer(SRC, 1024, BufferUsage::TRANSFER_SRC);

    h.ok(Call::QueueBindSparse {
        queue: QUEUE,
        binds: vec![SparseBind {
            resource: sparse,
            memory: Some(MEM),
            offset: 0,
        }],
    });
    h.ok(Call::QueueBindSparse {
        queue: QUEUE,
        binds: vec![SparseBind {
            resource: sparse,
            memory: Some(MEM2),
            offset: 1024,
        }],
    });
    assert_eq!(h.refcount(MEM), 0);
    assert_eq!(h.refcount(MEM2), 1);

    // A non-sparse resource in the batch rejects every bind in it
    h.expect(
        Call::QueueBindSparse {
            queue: QUEUE,
            binds: vec![
                SparseBind {
                    resource: sparse,
                    memory: None,
                    offset: 0,
                },
                SparseBind {
                    resource: SRC,
                    memory: Some(MEM),
                    offset: 0,
                },
            ],
        },
        ErrorKind::InvalidState,
    );
    assert_eq!(h.refcount(MEM2), 1);

    h.ok(Call::QueueBindSparse {
        queue: QUEUE,
        binds: vec![SparseBind {
            resource: sparse,
            memory: None,
            offset: 0,
        }],
    });
    assert_eq!(h.refcount(MEM2), 0);
}

#[test]
fn test_sparse_binds_check_in_order() {
    let h = Harness::new();
    h.device();
    h.allocate(MEM, 4096, MemoryProperties::DEVICE_LOCAL);
    let sparse = Handle::buffer(0x30);
    h.ok(Call::CreateBuffer {
        device: DEVICE,
        buffer: sparse,
        info: BufferCreateInfo {
            size: 1024,
            usage: BufferUsage::STORAGE_BUFFER,
            sparse: true,
        },
    });
    let bind = SparseBind {
        resource: sparse,
        memory: Some(MEM),
        offset: 0,
    };
    let unbind = SparseBind {
        resource: sparse,
        memory: None,
        offset: 0,
    };

    // Bound by the first entry, so the second may clear it
    h.ok(Call::QueueBindSparse {
        queue: QUEUE,
        binds: vec![bind.clone(), unbind.clone()],
    });
    assert_eq!(h.refcount(MEM), 0);

    h.ok(Call::QueueBindSparse {
        queue: QUEUE,
        binds: vec![bind],
    });
    // The second clear finds nothing bound, so neither is applied
    h.expect(
        Call::QueueBindSparse {
            queue: QUEUE,
            binds: vec![unbind.clone(), unbind],
        },
        ErrorKind::ClearEmptyBindings,
    );
    assert_eq!(h.refcount(MEM), 1);
}

#[test]
fn test_free_command_buffers_with_repeated_handle() {
    let h = Harness::new();
    h.device();
    let cb2 = Handle::command_buffer(0x40);
    h.ok(Call::AllocateCommandBuffers {
        device: DEVICE,
        pool: POOL,
        command_buffers: vec![cb2],
    });

    h.expect(
        Call::FreeCommandBuffers {
            device: DEVICE,
            pool: POOL,
            command_buffers: vec![cb2, CB1, cb2],
        },
        ErrorKind::InvalidObject,
    );
    h.ok(Call::BeginCommandBuffer {
        command_buffer: CB1,
        flags: CommandBufferUsage::empty(),
    });
    h.ok(Call::BeginCommandBuffer {
        command_buffer: cb2,
        flags: CommandBufferUsage::empty(),
    });
}

#[test]
fn test_unknown_device_and_duplicate_handles() {
    let h = Harness::new();
    h.expect(
        Call::CreateBuffer {
            device: DEVICE,
            buffer: SRC,
            info: BufferCreateInfo {
                size: 16,
                usage: BufferUsage::TRANSFER_SRC,
                sparse: false,
            },
        },
        ErrorKind::InvalidObject,
    );

    h.device();
    h.expect(Call::CreateDevice { device: DEVICE }, ErrorKind::InvalidObject);
    h.allocate(MEM, 64, MemoryProperties::DEVICE_LOCAL);
    h.expect(
        Call::AllocateMemory {
            device: DEVICE,
            memory: MEM,
            info: AllocationInfo {
                size: 64,
                memory_type_index: 0,
                properties: MemoryProperties::DEVICE_LOCAL,
            },
        },
        ErrorKind::InvalidObject,
    );
    h.expect(
        Call::DestroyBuffer {
            device: DEVICE,
            buffer: Handle::image(0x20),
        },
        ErrorKind::InvalidObject,
    );
}

#[test]
fn test_failed_creation_is_not_tracked() {
    let h = Harness::new();
    h.device();
    let call = Call::AllocateMemory {
        device: DEVICE,
        memory: MEM,
        info: AllocationInfo {
            size: 64,
            memory_type_index: 0,
            properties: MemoryProperties::DEVICE_LOCAL,
        },
    };
    assert!(h.layer.pre_call(&call).passed());
    h.layer.post_call(&call, CallResult::Failure);

    h.expect(
        Call::FreeMemory {
            device: DEVICE,
            memory: MEM,
        },
        ErrorKind::InvalidObject,
    );
}

#[test]
fn test_memory_from_another_device_cannot_be_bound() {
    let h = Harness::new();
    h.device();
    h.buffer(SRC, 64, BufferUsage::TRANSFER_SRC);

    let other = Handle::device(7);
    h.ok(Call::CreateDevice { device: other });
    h.ok(Call::AllocateMemory {
        device: other,
        memory: MEM,
        info: AllocationInfo {
            size: 4096,
            memory_type_index: 0,
            properties: MemoryProperties::DEVICE_LOCAL,
        },
    });

    h.expect(
        Call::BindBufferMemory {
            device: DEVICE,
            buffer: SRC,
            memory: MEM,
            offset: 0,
        },
        ErrorKind::MemoryBindingError,
    );
    assert_eq!(h.layer.session(other).unwrap().lock().memory.get(MEM).unwrap().ref_count(), 0);

    h.ok(Call::FreeMemory {
        device: other,
        memory: MEM,
    });
    h.ok(Call::DestroyDevice { device: other });
}

#[test]
fn test_min_severity_filters_sink_only() {
    let mut config = MemtrackConfig::default();
    config.validation.min_severity = Severity::Error;
    config.validation.suppress_on_error = false;
    let h = Harness::with_config(config);
    assert_eq!(h.layer.config().validation.min_severity, Severity::Error);
    h.device();
    h.allocate(MEM, 64, MemoryProperties::DEVICE_LOCAL);
    h.buffer(SRC, 16, BufferUsage::TRANSFER_SRC);

    // Warning: verdict carries it, sink does not
    let verdict = h.call(Call::UnbindMemory {
        device: DEVICE,
        resource: SRC,
    });
    assert!(verdict.has(ErrorKind::ClearEmptyBindings));
    assert!(h.sink.is_empty());

    // Error: reported, but the call is not suppressed
    let verdict = h.bind(SRC, Handle::memory(0x99), 0);
    assert!(!verdict.passed());
    assert!(!verdict.skip_call);
    assert_eq!(h.sink.take().len(), 1);
}

#[test]
fn test_devices_validate_independently_across_threads() {
    let h = Arc::new(Harness::new());
    let workers: Vec<_> = (1..=4u64)
        .map(|n| {
            let h = Arc::clone(&h);
            thread::spawn(move || {
                let device = Handle::device(n);
                h.ok(Call::CreateDevice { device });
                for i in 0..50u64 {
                    let memory = Handle::memory(n * 1000 + i);
                    let buffer = Handle::buffer(n * 1000 + i);
                    h.ok(Call::AllocateMemory {
                        device,
                        memory,
                        info: AllocationInfo {
                            size: 256,
                            memory_type_index: 0,
                            properties: MemoryProperties::DEVICE_LOCAL,
                        },
                    });
                    h.ok(Call::CreateBuffer {
                        device,
                        buffer,
                        info: BufferCreateInfo {
                            size: 256,
                            usage: BufferUsage::STORAGE_BUFFER,
                            sparse: false,
                        },
                    });
                    h.ok(Call::BindBufferMemory {
                        device,
                        buffer,
                        memory,
                        offset: 0,
                    });
                    h.ok(Call::DestroyBuffer { device, buffer });
                    h.ok(Call::FreeMemory { device, memory });
                }
                h.ok(Call::DestroyDevice { device });
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(h.layer.device_count(), 0);
    assert!(h.sink.is_empty());
}
