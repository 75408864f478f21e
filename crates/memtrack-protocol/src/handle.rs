use std::fmt;

use serde::{Deserialize, Serialize};

/// A client-visible object handle.
/// Identity is the `(raw, kind)` pair: two kinds may legally reuse a raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    /// Opaque value handed out by the driver
    pub raw: u64,
    /// Object kind tag used for lookup and validation
    pub kind: ObjectKind,
}

impl Handle {
    pub const fn new(raw: u64, kind: ObjectKind) -> Self {
        Self { raw, kind }
    }

    /// Create a null handle of the given kind.
    pub const fn null(kind: ObjectKind) -> Self {
        Self { raw: 0, kind }
    }

    pub fn is_null(&self) -> bool {
        self.raw == 0
    }

    pub const fn device(raw: u64) -> Self {
        Self::new(raw, ObjectKind::Device)
    }

    pub const fn memory(raw: u64) -> Self {
        Self::new(raw, ObjectKind::DeviceMemory)
    }

    pub const fn buffer(raw: u64) -> Self {
        Self::new(raw, ObjectKind::Buffer)
    }

    pub const fn image(raw: u64) -> Self {
        Self::new(raw, ObjectKind::Image)
    }

    pub const fn command_buffer(raw: u64) -> Self {
        Self::new(raw, ObjectKind::CommandBuffer)
    }

    pub const fn command_pool(raw: u64) -> Self {
        Self::new(raw, ObjectKind::CommandPool)
    }

    pub const fn queue(raw: u64) -> Self {
        Self::new(raw, ObjectKind::Queue)
    }

    pub const fn fence(raw: u64) -> Self {
        Self::new(raw, ObjectKind::Fence)
    }

    pub const fn semaphore(raw: u64) -> Self {
        Self::new(raw, ObjectKind::Semaphore)
    }

    pub const fn swapchain(raw: u64) -> Self {
        Self::new(raw, ObjectKind::Swapchain)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:#x}", self.kind, self.raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Device,
    DeviceMemory,
    Buffer,
    Image,
    CommandBuffer,
    CommandPool,
    Queue,
    Fence,
    Semaphore,
    Swapchain,
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Device => "device",
            ObjectKind::DeviceMemory => "memory",
            ObjectKind::Buffer => "buffer",
            ObjectKind::Image => "image",
            ObjectKind::CommandBuffer => "command buffer",
            ObjectKind::CommandPool => "command pool",
            ObjectKind::Queue => "queue",
            ObjectKind::Fence => "fence",
            ObjectKind::Semaphore => "semaphore",
            ObjectKind::Swapchain => "swapchain",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_raw_value_different_kinds_are_distinct() {
        let buffer = Handle::buffer(7);
        let image = Handle::image(7);
        assert_ne!(buffer, image);
        assert_eq!(buffer.raw, image.raw);
    }

    #[test]
    fn display_names_kind_and_value() {
        assert_eq!(Handle::memory(0x20).to_string(), "memory 0x20");
        assert_eq!(Handle::command_buffer(1).to_string(), "command buffer 0x1");
    }
}
