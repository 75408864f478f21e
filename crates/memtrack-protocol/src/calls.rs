use serde::{Deserialize, Serialize};

use crate::flags::{
    BufferUsage, CommandBufferUsage, CommandPoolFlags, ImageUsage, MemoryProperties,
};
use crate::handle::Handle;

// ============================================================================
// Create-time parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub size: u64,
    #[serde(default)]
    pub memory_type_index: u32,
    #[serde(default)]
    pub properties: MemoryProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferCreateInfo {
    pub size: u64,
    pub usage: BufferUsage,
    #[serde(default)]
    pub sparse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCreateInfo {
    pub extent: [u32; 3],
    /// Bytes of backing memory the image requires
    pub memory_size: u64,
    pub usage: ImageUsage,
    #[serde(default)]
    pub sparse: bool,
}

/// Create parameters of a bindable resource, tagged by resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceInfo {
    Buffer(BufferCreateInfo),
    Image(ImageCreateInfo),
}

impl ResourceInfo {
    /// Bytes of memory a binding must cover.
    pub fn memory_size(&self) -> u64 {
        match self {
            ResourceInfo::Buffer(info) => info.size,
            ResourceInfo::Image(info) => info.memory_size,
        }
    }

    pub fn is_sparse(&self) -> bool {
        match self {
            ResourceInfo::Buffer(info) => info.sparse,
            ResourceInfo::Image(info) => info.sparse,
        }
    }

    pub fn has_usage(&self) -> bool {
        match self {
            ResourceInfo::Buffer(info) => !info.usage.is_empty(),
            ResourceInfo::Image(info) => !info.usage.is_empty(),
        }
    }
}

// ============================================================================
// Recorded commands
// ============================================================================

/// Usage bit(s) a recorded command needs on one of its resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredUsage {
    Buffer(BufferUsage),
    Image(ImageUsage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUse {
    pub resource: Handle,
    pub usage: RequiredUsage,
}

impl ResourceUse {
    fn buffer(resource: Handle, usage: BufferUsage) -> Self {
        Self { resource, usage: RequiredUsage::Buffer(usage) }
    }

    fn image(resource: Handle, usage: ImageUsage) -> Self {
        Self { resource, usage: RequiredUsage::Image(usage) }
    }
}

/// A command recorded into a command buffer that touches bound memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordedCommand {
    CopyBuffer { src: Handle, dst: Handle },
    CopyImage { src: Handle, dst: Handle },
    BlitImage { src: Handle, dst: Handle },
    ResolveImage { src: Handle, dst: Handle },
    CopyBufferToImage { src: Handle, dst: Handle },
    CopyImageToBuffer { src: Handle, dst: Handle },
    FillBuffer { buffer: Handle },
    UpdateBuffer { buffer: Handle },
    ClearColorImage { image: Handle },
    ClearDepthStencilImage { image: Handle },
    BindVertexBuffers { buffers: Vec<Handle> },
    BindIndexBuffer { buffer: Handle },
    DrawIndirect { buffer: Handle },
    DrawIndexedIndirect { buffer: Handle },
    DispatchIndirect { buffer: Handle },
}

impl RecordedCommand {
    /// Every resource this command touches with the usage it requires.
    pub fn resource_uses(&self) -> Vec<ResourceUse> {
        use RecordedCommand::*;
        match self {
            CopyBuffer { src, dst } => vec![
                ResourceUse::buffer(*src, BufferUsage::TRANSFER_SRC),
                ResourceUse::buffer(*dst, BufferUsage::TRANSFER_DST),
            ],
            CopyImage { src, dst } | BlitImage { src, dst } => vec![
                ResourceUse::image(*src, ImageUsage::TRANSFER_SRC),
                ResourceUse::image(*dst, ImageUsage::TRANSFER_DST),
            ],
            ResolveImage { src, dst } => vec![
                ResourceUse::image(*src, ImageUsage::empty()),
                ResourceUse::image(*dst, ImageUsage::empty()),
            ],
            CopyBufferToImage { src, dst } => vec![
                ResourceUse::buffer(*src, BufferUsage::TRANSFER_SRC),
                ResourceUse::image(*dst, ImageUsage::TRANSFER_DST),
            ],
            CopyImageToBuffer { src, dst } => vec![
                ResourceUse::image(*src, ImageUsage::TRANSFER_SRC),
                ResourceUse::buffer(*dst, BufferUsage::TRANSFER_DST),
            ],
            FillBuffer { buffer } | UpdateBuffer { buffer } => {
                vec![ResourceUse::buffer(*buffer, BufferUsage::TRANSFER_DST)]
            }
            ClearColorImage { image } | ClearDepthStencilImage { image } => {
                vec![ResourceUse::image(*image, ImageUsage::TRANSFER_DST)]
            }
            BindVertexBuffers { buffers } => buffers
                .iter()
                .map(|b| ResourceUse::buffer(*b, BufferUsage::VERTEX_BUFFER))
                .collect(),
            BindIndexBuffer { buffer } => {
                vec![ResourceUse::buffer(*buffer, BufferUsage::INDEX_BUFFER)]
            }
            DrawIndirect { buffer } | DrawIndexedIndirect { buffer } | DispatchIndirect { buffer } => {
                vec![ResourceUse::buffer(*buffer, BufferUsage::INDIRECT_BUFFER)]
            }
        }
    }

    pub fn name(&self) -> &'static str {
        use RecordedCommand::*;
        match self {
            CopyBuffer { .. } => "CmdCopyBuffer",
            CopyImage { .. } => "CmdCopyImage",
            BlitImage { .. } => "CmdBlitImage",
            ResolveImage { .. } => "CmdResolveImage",
            CopyBufferToImage { .. } => "CmdCopyBufferToImage",
            CopyImageToBuffer { .. } => "CmdCopyImageToBuffer",
            FillBuffer { .. } => "CmdFillBuffer",
            UpdateBuffer { .. } => "CmdUpdateBuffer",
            ClearColorImage { .. } => "CmdClearColorImage",
            ClearDepthStencilImage { .. } => "CmdClearDepthStencilImage",
            BindVertexBuffers { .. } => "CmdBindVertexBuffers",
            BindIndexBuffer { .. } => "CmdBindIndexBuffer",
            DrawIndirect { .. } => "CmdDrawIndirect",
            DrawIndexedIndirect { .. } => "CmdDrawIndexedIndirect",
            DispatchIndirect { .. } => "CmdDispatchIndirect",
        }
    }
}

// ============================================================================
// Submission
// ============================================================================

/// One submit info within a queue submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBatch {
    #[serde(default)]
    pub wait_semaphores: Vec<Handle>,
    #[serde(default)]
    pub command_buffers: Vec<Handle>,
    #[serde(default)]
    pub signal_semaphores: Vec<Handle>,
}

/// A sparse (re)binding; `memory: None` releases the resource's binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseBind {
    pub resource: Handle,
    pub memory: Option<Handle>,
    #[serde(default)]
    pub offset: u64,
}

// ============================================================================
// Intercepted calls
// ============================================================================

/// An intercepted API call. Creation calls carry the handle the driver returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Call {
    // ── Device ──────────────────────────────────────────────
    CreateDevice { device: Handle },
    DestroyDevice { device: Handle },
    GetDeviceQueue { device: Handle, queue: Handle },
    DeviceWaitIdle { device: Handle },

    // ── Memory ──────────────────────────────────────────────
    AllocateMemory { device: Handle, memory: Handle, info: AllocationInfo },
    FreeMemory { device: Handle, memory: Handle },
    MapMemory { device: Handle, memory: Handle, offset: u64, size: u64 },
    UnmapMemory { device: Handle, memory: Handle },

    // ── Resources ───────────────────────────────────────────
    CreateBuffer { device: Handle, buffer: Handle, info: BufferCreateInfo },
    CreateImage { device: Handle, image: Handle, info: ImageCreateInfo },
    DestroyBuffer { device: Handle, buffer: Handle },
    DestroyImage { device: Handle, image: Handle },
    BindBufferMemory { device: Handle, buffer: Handle, memory: Handle, offset: u64 },
    BindImageMemory { device: Handle, image: Handle, memory: Handle, offset: u64 },
    UnbindMemory { device: Handle, resource: Handle },
    QueueBindSparse { queue: Handle, binds: Vec<SparseBind> },

    // ── Swapchain ───────────────────────────────────────────
    CreateSwapchain {
        device: Handle,
        swapchain: Handle,
        images: Vec<Handle>,
        #[serde(default)]
        image_usage: ImageUsage,
    },
    DestroySwapchain { device: Handle, swapchain: Handle },

    // ── Command pools and buffers ───────────────────────────
    CreateCommandPool { device: Handle, pool: Handle, flags: CommandPoolFlags },
    DestroyCommandPool { device: Handle, pool: Handle },
    ResetCommandPool { device: Handle, pool: Handle },
    AllocateCommandBuffers { device: Handle, pool: Handle, command_buffers: Vec<Handle> },
    FreeCommandBuffers { device: Handle, pool: Handle, command_buffers: Vec<Handle> },
    BeginCommandBuffer { command_buffer: Handle, flags: CommandBufferUsage },
    EndCommandBuffer { command_buffer: Handle },
    ResetCommandBuffer { command_buffer: Handle },
    RecordCommand { command_buffer: Handle, command: RecordedCommand },

    // ── Synchronization ─────────────────────────────────────
    CreateFence { device: Handle, fence: Handle, signaled: bool },
    DestroyFence { device: Handle, fence: Handle },
    ResetFences { device: Handle, fences: Vec<Handle> },
    GetFenceStatus { device: Handle, fence: Handle },
    WaitForFences { device: Handle, fences: Vec<Handle>, wait_all: bool },
    CreateSemaphore { device: Handle, semaphore: Handle },
    DestroySemaphore { device: Handle, semaphore: Handle },
    QueueSubmit { queue: Handle, submits: Vec<SubmitBatch>, fence: Option<Handle> },
    QueueWaitIdle { queue: Handle },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::CreateDevice { .. } => "CreateDevice",
            Call::DestroyDevice { .. } => "DestroyDevice",
            Call::GetDeviceQueue { .. } => "GetDeviceQueue",
            Call::DeviceWaitIdle { .. } => "DeviceWaitIdle",
            Call::AllocateMemory { .. } => "AllocateMemory",
            Call::FreeMemory { .. } => "FreeMemory",
            Call::MapMemory { .. } => "MapMemory",
            Call::UnmapMemory { .. } => "UnmapMemory",
            Call::CreateBuffer { .. } => "CreateBuffer",
            Call::CreateImage { .. } => "CreateImage",
            Call::DestroyBuffer { .. } => "DestroyBuffer",
            Call::DestroyImage { .. } => "DestroyImage",
            Call::BindBufferMemory { .. } => "BindBufferMemory",
            Call::BindImageMemory { .. } => "BindImageMemory",
            Call::UnbindMemory { .. } => "UnbindMemory",
            Call::QueueBindSparse { .. } => "QueueBindSparse",
            Call::CreateSwapchain { .. } => "CreateSwapchain",
            Call::DestroySwapchain { .. } => "DestroySwapchain",
            Call::CreateCommandPool { .. } => "CreateCommandPool",
            Call::DestroyCommandPool { .. } => "DestroyCommandPool",
            Call::ResetCommandPool { .. } => "ResetCommandPool",
            Call::AllocateCommandBuffers { .. } => "AllocateCommandBuffers",
            Call::FreeCommandBuffers { .. } => "FreeCommandBuffers",
            Call::BeginCommandBuffer { .. } => "BeginCommandBuffer",
            Call::EndCommandBuffer { .. } => "EndCommandBuffer",
            Call::ResetCommandBuffer { .. } => "ResetCommandBuffer",
            Call::RecordCommand { command, .. } => command.name(),
            Call::CreateFence { .. } => "CreateFence",
            Call::DestroyFence { .. } => "DestroyFence",
            Call::ResetFences { .. } => "ResetFences",
            Call::GetFenceStatus { .. } => "GetFenceStatus",
            Call::WaitForFences { .. } => "WaitForFences",
            Call::CreateSemaphore { .. } => "CreateSemaphore",
            Call::DestroySemaphore { .. } => "DestroySemaphore",
            Call::QueueSubmit { .. } => "QueueSubmit",
            Call::QueueWaitIdle { .. } => "QueueWaitIdle",
        }
    }
}

/// Driver result reported to the post-call hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResult {
    #[default]
    Success,
    /// Fence queries and waits that did not observe completion
    NotReady,
    Failure,
}

/// Completion report from the driver: everything on `queue` up to and
/// including `sequence` has finished executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub queue: Handle,
    pub sequence: u64,
}
