//! Create-time and begin-time flag sets carried by intercepted calls.
//! Serialized as `"A | B"` strings in human-readable formats.

use serde::{Deserialize, Serialize};

/// Map size meaning "from offset to the end of the allocation".
pub const WHOLE_SIZE: u64 = u64::MAX;

bitflags::bitflags! {
    /// Property flags of the memory type an allocation was made from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL     = 0b0000_0001;
        const HOST_VISIBLE     = 0b0000_0010;
        const HOST_COHERENT    = 0b0000_0100;
        const HOST_CACHED      = 0b0000_1000;
        const LAZILY_ALLOCATED = 0b0001_0000;
    }
}

bitflags::bitflags! {
    /// Operations a buffer was created to allow.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC         = 0b0000_0000_0001;
        const TRANSFER_DST         = 0b0000_0000_0010;
        const UNIFORM_TEXEL_BUFFER = 0b0000_0000_0100;
        const STORAGE_TEXEL_BUFFER = 0b0000_0000_1000;
        const UNIFORM_BUFFER       = 0b0000_0001_0000;
        const STORAGE_BUFFER       = 0b0000_0010_0000;
        const INDEX_BUFFER         = 0b0000_0100_0000;
        const VERTEX_BUFFER        = 0b0000_1000_0000;
        const INDIRECT_BUFFER      = 0b0001_0000_0000;
    }
}

bitflags::bitflags! {
    /// Operations an image was created to allow.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC             = 0b0000_0001;
        const TRANSFER_DST             = 0b0000_0010;
        const SAMPLED                  = 0b0000_0100;
        const STORAGE                  = 0b0000_1000;
        const COLOR_ATTACHMENT         = 0b0001_0000;
        const DEPTH_STENCIL_ATTACHMENT = 0b0010_0000;
        const TRANSIENT_ATTACHMENT     = 0b0100_0000;
        const INPUT_ATTACHMENT         = 0b1000_0000;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CommandPoolFlags: u32 {
        const TRANSIENT            = 0b0001;
        /// Buffers from this pool may be reset individually or implicitly by begin.
        const RESET_COMMAND_BUFFER = 0b0010;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CommandBufferUsage: u32 {
        /// Recorded once, submitted once; returns to the initial state when retired.
        const ONE_TIME_SUBMIT      = 0b0001;
        const RENDER_PASS_CONTINUE = 0b0010;
        const SIMULTANEOUS_USE     = 0b0100;
    }
}

macro_rules! empty_default {
    ($($flags:ty),*) => {
        $(
            impl Default for $flags {
                fn default() -> Self {
                    Self::empty()
                }
            }
        )*
    };
}

empty_default!(MemoryProperties, BufferUsage, ImageUsage, CommandPoolFlags, CommandBufferUsage);
