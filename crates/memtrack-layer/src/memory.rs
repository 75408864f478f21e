//! Device memory tracking: allocation records, mapped ranges and the
//! reference counts that decide when an allocation may be freed.

use std::collections::BTreeSet;

use memtrack_core::{HandleRegistry, TrackError};
use memtrack_protocol::calls::AllocationInfo;
use memtrack_protocol::flags::{MemoryProperties, WHOLE_SIZE};
use memtrack_protocol::{Handle, ObjectKind};
use tracing::{debug, warn};

/// A mapped sub-range of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub offset: u64,
    pub size: u64,
}

/// Tracking record for one device memory allocation.
///
/// `ref_count` is kept explicitly and must always equal
/// `bindings.len() + command_buffers.len()`.
#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub device: Handle,
    pub info: AllocationInfo,
    mapped: Option<MemRange>,
    ref_count: u32,
    /// Buffers and images bound to this memory
    bindings: BTreeSet<Handle>,
    /// Command buffers whose recorded commands touch this memory
    command_buffers: BTreeSet<Handle>,
}

impl MemoryObject {
    fn new(device: Handle, info: AllocationInfo) -> Self {
        Self {
            device,
            info,
            mapped: None,
            ref_count: 0,
            bindings: BTreeSet::new(),
            command_buffers: BTreeSet::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn properties(&self) -> MemoryProperties {
        self.info.properties
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn mapped_range(&self) -> Option<MemRange> {
        self.mapped
    }

    pub fn bound_resources(&self) -> &BTreeSet<Handle> {
        &self.bindings
    }

    pub fn command_buffers(&self) -> &BTreeSet<Handle> {
        &self.command_buffers
    }

    fn check_ref_count(&self, memory: Handle) -> Result<(), TrackError> {
        let links = self.bindings.len() + self.command_buffers.len();
        if self.ref_count as usize != links {
            return Err(TrackError::internal(&[memory], format!(
                "{} has refcount {} but {} outstanding links",
                memory, self.ref_count, links
            )));
        }
        Ok(())
    }

    fn increment(&mut self, memory: Handle) -> Result<u32, TrackError> {
        self.ref_count = self
            .ref_count
            .checked_add(1)
            .ok_or_else(|| TrackError::internal(&[memory], format!("{} refcount overflow", memory)))?;
        Ok(self.ref_count)
    }

    fn decrement(&mut self, memory: Handle) -> Result<u32, TrackError> {
        self.ref_count = self
            .ref_count
            .checked_sub(1)
            .ok_or_else(|| TrackError::internal(&[memory], format!("{} refcount dropped below zero", memory)))?;
        Ok(self.ref_count)
    }
}

/// Owner of every [`MemoryObject`] of one device.
#[derive(Debug)]
pub struct MemoryTracker {
    objects: HandleRegistry<MemoryObject>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self {
            objects: HandleRegistry::new(ObjectKind::DeviceMemory),
        }
    }

    /// Record a new allocation with a zero reference count.
    pub fn allocate(&mut self, memory: Handle, device: Handle, info: AllocationInfo) -> Result<(), TrackError> {
        let size = info.size;
        self.objects.register(memory, MemoryObject::new(device, info))?;
        debug!("allocated {} bytes of device memory on {}: {}", size, device, memory);
        Ok(())
    }

    /// Remove an allocation whose reference count is zero.
    ///
    /// With outstanding references every remaining binding and command buffer
    /// reference is logged and the record is kept.
    pub fn free(&mut self, memory: Handle) -> Result<MemoryObject, TrackError> {
        let obj = self.objects.lookup(memory)?;
        obj.check_ref_count(memory)?;

        if obj.ref_count > 0 {
            for resource in &obj.bindings {
                warn!("{} freed while still bound to {}", memory, resource);
            }
            for cb in &obj.command_buffers {
                warn!("{} freed while still referenced by {}", memory, cb);
            }
            return Err(TrackError::FreedMemRef {
                memory,
                bindings: obj.bindings.iter().copied().collect(),
                command_buffers: obj.command_buffers.iter().copied().collect(),
            });
        }

        let obj = self.objects.unregister(memory)?;
        if let Some(range) = obj.mapped {
            debug!("{} freed while mapped at {}+{}; mapping dropped", memory, range.offset, range.size);
        }
        debug!("freed device memory: {}", memory);
        Ok(obj)
    }

    /// Map `size` bytes at `offset`. [`WHOLE_SIZE`] maps to the end of the allocation.
    pub fn map(&mut self, memory: Handle, offset: u64, size: u64) -> Result<MemRange, TrackError> {
        let obj = self.objects.lookup_mut(memory)?;

        if !obj.properties().contains(MemoryProperties::HOST_VISIBLE) {
            return Err(TrackError::InvalidState {
                handle: memory,
                detail: "mapping memory that is not host-visible".to_string(),
            });
        }
        if let Some(current) = obj.mapped {
            return Err(TrackError::InvalidMap {
                memory,
                detail: format!(
                    "already mapped at offset {} size {}; unmap before mapping again",
                    current.offset, current.size
                ),
            });
        }
        if size == 0 {
            return Err(TrackError::InvalidMap {
                memory,
                detail: "mapped size must be greater than zero".to_string(),
            });
        }
        let alloc_size = obj.size();
        if offset >= alloc_size {
            return Err(TrackError::InvalidMap {
                memory,
                detail: format!("offset {} is past the end of the {}-byte allocation", offset, alloc_size),
            });
        }
        let size = if size == WHOLE_SIZE { alloc_size - offset } else { size };
        match offset.checked_add(size) {
            Some(end) if end <= alloc_size => {}
            _ => {
                return Err(TrackError::InvalidMap {
                    memory,
                    detail: format!(
                        "range (offset {}, size {}) exceeds the {}-byte allocation",
                        offset, size, alloc_size
                    ),
                });
            }
        }

        let range = MemRange { offset, size };
        obj.mapped = Some(range);
        debug!("mapped {} at {}+{}", memory, offset, size);
        Ok(range)
    }

    pub fn unmap(&mut self, memory: Handle) -> Result<MemRange, TrackError> {
        let obj = self.objects.lookup_mut(memory)?;
        obj.mapped.take().ok_or_else(|| TrackError::InvalidMap {
            memory,
            detail: "unmapping memory that is not mapped".to_string(),
        })
    }

    /// Record that `resource` is bound to `memory`. Returns the new refcount.
    pub fn add_binding(&mut self, memory: Handle, resource: Handle) -> Result<u32, TrackError> {
        let obj = self.objects.lookup_mut(memory)?;
        if !obj.bindings.insert(resource) {
            return Err(TrackError::internal(&[memory, resource], format!(
                "{} is already recorded as bound to {}",
                resource, memory
            )));
        }
        obj.increment(memory)
    }

    /// Drop the `resource` binding from `memory`. Returns the new refcount.
    pub fn remove_binding(&mut self, memory: Handle, resource: Handle) -> Result<u32, TrackError> {
        let obj = self.objects.lookup_mut(memory)?;
        if !obj.bindings.remove(&resource) {
            return Err(TrackError::ClearEmptyBindings {
                resource,
                memory: Some(memory),
            });
        }
        obj.decrement(memory)
    }

    /// Record that `command_buffer` references `memory`.
    /// A repeated reference from the same command buffer is not counted twice.
    pub fn add_command_buffer_ref(&mut self, memory: Handle, command_buffer: Handle) -> Result<u32, TrackError> {
        let obj = self.objects.lookup_mut(memory)?;
        if !obj.command_buffers.insert(command_buffer) {
            return Ok(obj.ref_count);
        }
        obj.increment(memory)
    }

    pub fn remove_command_buffer_ref(&mut self, memory: Handle, command_buffer: Handle) -> Result<u32, TrackError> {
        let obj = self.objects.lookup_mut(memory)?;
        if !obj.command_buffers.remove(&command_buffer) {
            return Err(TrackError::ClearEmptyBindings {
                resource: command_buffer,
                memory: Some(memory),
            });
        }
        obj.decrement(memory)
    }

    /// Resources bound to `memory`. An empty set is reported, since callers
    /// only ask when they expect at least one binding.
    pub fn bindings(&self, memory: Handle) -> Result<&BTreeSet<Handle>, TrackError> {
        let obj = self.objects.lookup(memory)?;
        if obj.bindings.is_empty() {
            return Err(TrackError::MissingBindings { handle: memory });
        }
        Ok(&obj.bindings)
    }

    pub fn get(&self, memory: Handle) -> Result<&MemoryObject, TrackError> {
        self.objects.lookup(memory)
    }

    pub fn contains(&self, memory: Handle) -> bool {
        self.objects.contains(memory)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Remove every allocation still held on `device`, reporting each as a leak.
    pub fn leaks_for_device(&mut self, device: Handle) -> Vec<TrackError> {
        self.objects
            .drain_where(|obj| obj.device == device)
            .into_iter()
            .map(|(memory, obj)| {
                warn!("{} ({} bytes) leaked by {}", memory, obj.size(), device);
                TrackError::MemoryLeak {
                    memory,
                    device,
                    size: obj.size(),
                }
            })
            .collect()
    }

    /// Check the refcount invariant on every record.
    pub fn verify(&self) -> Result<(), TrackError> {
        for (memory, obj) in self.objects.iter() {
            obj.check_ref_count(memory)?;
        }
        Ok(())
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}
