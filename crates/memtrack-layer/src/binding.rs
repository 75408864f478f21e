//! Buffer/image records and the bind, unbind and destroy transitions that
//! keep them consistent with the memory tracker.

use memtrack_core::{HandleRegistry, TrackError};
use memtrack_protocol::calls::{BufferCreateInfo, ImageCreateInfo, RequiredUsage, ResourceInfo};
use memtrack_protocol::flags::{ImageUsage, MemoryProperties};
use memtrack_protocol::{Handle, ObjectKind};
use tracing::debug;

use crate::memory::MemoryTracker;

/// What a resource's memory currently comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Unbound,
    Memory { memory: Handle, offset: u64 },
    /// Presentable image whose memory belongs to a swapchain
    Swapchain(Handle),
}

#[derive(Debug, Clone)]
pub struct BoundResource {
    pub info: ResourceInfo,
    binding: Binding,
}

impl BoundResource {
    pub fn binding(&self) -> Binding {
        self.binding
    }

    /// The memory object this resource is bound to, if any.
    pub fn memory(&self) -> Option<Handle> {
        match self.binding {
            Binding::Memory { memory, .. } => Some(memory),
            _ => None,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.info.is_sparse()
    }
}

#[derive(Debug, Clone)]
pub struct Swapchain {
    pub images: Vec<Handle>,
}

/// Owner of buffer, image and swapchain records.
#[derive(Debug)]
pub struct ResourceTracker {
    buffers: HandleRegistry<BoundResource>,
    images: HandleRegistry<BoundResource>,
    swapchains: HandleRegistry<Swapchain>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self {
            buffers: HandleRegistry::new(ObjectKind::Buffer),
            images: HandleRegistry::new(ObjectKind::Image),
            swapchains: HandleRegistry::new(ObjectKind::Swapchain),
        }
    }

    fn table(&self, resource: Handle) -> Result<&HandleRegistry<BoundResource>, TrackError> {
        match resource.kind {
            ObjectKind::Buffer => Ok(&self.buffers),
            ObjectKind::Image => Ok(&self.images),
            _ => Err(TrackError::invalid_object(resource, "expected a buffer or image")),
        }
    }

    fn table_mut(&mut self, resource: Handle) -> Result<&mut HandleRegistry<BoundResource>, TrackError> {
        match resource.kind {
            ObjectKind::Buffer => Ok(&mut self.buffers),
            ObjectKind::Image => Ok(&mut self.images),
            _ => Err(TrackError::invalid_object(resource, "expected a buffer or image")),
        }
    }

    pub fn create_buffer(&mut self, buffer: Handle, info: BufferCreateInfo) -> Result<(), TrackError> {
        let record = BoundResource {
            info: ResourceInfo::Buffer(info),
            binding: Binding::Unbound,
        };
        self.buffers.register(buffer, record)?;
        debug!("created {}", buffer);
        Ok(())
    }

    pub fn create_image(&mut self, image: Handle, info: ImageCreateInfo) -> Result<(), TrackError> {
        let record = BoundResource {
            info: ResourceInfo::Image(info),
            binding: Binding::Unbound,
        };
        self.images.register(image, record)?;
        debug!("created {}", image);
        Ok(())
    }

    pub fn get(&self, resource: Handle) -> Result<&BoundResource, TrackError> {
        self.table(resource)?.lookup(resource)
    }

    pub fn contains(&self, resource: Handle) -> bool {
        self.buffers.contains(resource) || self.images.contains(resource)
    }

    /// Bind `resource` (which must be of `kind`) to `memory` at `offset`.
    ///
    /// Every check runs before the first mutation. A sparse resource that is
    /// already bound has its previous binding released first.
    pub fn bind(
        &mut self,
        memory_tracker: &mut MemoryTracker,
        resource: Handle,
        memory: Handle,
        offset: u64,
        kind: ObjectKind,
    ) -> Result<(), TrackError> {
        let previous = self.check_bind(memory_tracker, resource, memory, offset, kind)?;

        if let Some(previous) = previous {
            if previous != memory {
                memory_tracker
                    .remove_binding(previous, resource)
                    .map_err(|e| inconsistent(resource, e))?;
            }
        }
        if previous != Some(memory) {
            memory_tracker.add_binding(memory, resource)?;
        }
        self.table_mut(resource)?.lookup_mut(resource)?.binding = Binding::Memory { memory, offset };
        debug!("bound {} to {} at offset {}", resource, memory, offset);
        Ok(())
    }

    /// Run every bind check without changing anything. Returns the memory a
    /// sparse resource is currently bound to.
    pub fn check_bind(
        &self,
        memory_tracker: &MemoryTracker,
        resource: Handle,
        memory: Handle,
        offset: u64,
        kind: ObjectKind,
    ) -> Result<Option<Handle>, TrackError> {
        if resource.kind != kind {
            return Err(TrackError::invalid_object(resource, format!("expected a {} handle", kind)));
        }
        let record = self.get(resource)?;
        let mem = memory_tracker.get(memory)?;

        let previous = match record.binding {
            Binding::Swapchain(swapchain) => {
                return Err(TrackError::Rebind {
                    resource,
                    current: swapchain,
                    requested: memory,
                });
            }
            Binding::Memory { memory: current, .. } if !record.is_sparse() => {
                return Err(TrackError::Rebind {
                    resource,
                    current,
                    requested: memory,
                });
            }
            Binding::Memory { memory: current, .. } => Some(current),
            Binding::Unbound => None,
        };

        check_bind_usage(resource, &record.info, mem.properties())?;

        let required = record.info.memory_size();
        match offset.checked_add(required) {
            Some(end) if end <= mem.size() => Ok(previous),
            _ => Err(TrackError::Binding {
                resource,
                memory,
                detail: format!(
                    "{} bytes at offset {} do not fit the {}-byte allocation",
                    required,
                    offset,
                    mem.size()
                ),
            }),
        }
    }

    /// Release `resource`'s memory binding, returning the memory it was bound to.
    pub fn unbind(&mut self, memory_tracker: &mut MemoryTracker, resource: Handle) -> Result<Handle, TrackError> {
        let record = self.table_mut(resource)?.lookup_mut(resource)?;
        match record.binding {
            Binding::Memory { memory, .. } => {
                memory_tracker
                    .remove_binding(memory, resource)
                    .map_err(|e| inconsistent(resource, e))?;
                record.binding = Binding::Unbound;
                debug!("unbound {} from {}", resource, memory);
                Ok(memory)
            }
            Binding::Unbound => Err(TrackError::ClearEmptyBindings { resource, memory: None }),
            Binding::Swapchain(swapchain) => Err(TrackError::invalid_object(
                resource,
                format!("presentable image owned by {}", swapchain),
            )),
        }
    }

    /// Destroy a buffer or image, unbinding it first when bound.
    pub fn destroy(&mut self, memory_tracker: &mut MemoryTracker, resource: Handle) -> Result<BoundResource, TrackError> {
        let binding = self.get(resource)?.binding;
        match binding {
            Binding::Swapchain(swapchain) => {
                return Err(TrackError::invalid_object(
                    resource,
                    format!("presentable image owned by {} cannot be destroyed directly", swapchain),
                ));
            }
            Binding::Memory { .. } => {
                self.unbind(memory_tracker, resource)?;
            }
            Binding::Unbound => {}
        }
        let record = self.table_mut(resource)?.unregister(resource)?;
        debug!("destroyed {}", resource);
        Ok(record)
    }

    /// Check that `resource` was created with the usage a recorded command needs.
    pub fn require_usage(&self, resource: Handle, usage: RequiredUsage) -> Result<(), TrackError> {
        let record = self.get(resource)?;
        match (&record.info, usage) {
            (ResourceInfo::Buffer(info), RequiredUsage::Buffer(required)) => {
                if !info.usage.contains(required) {
                    return Err(TrackError::InvalidUsage {
                        resource,
                        detail: format!("requires {:?} but was created with {:?}", required, info.usage),
                    });
                }
            }
            (ResourceInfo::Image(info), RequiredUsage::Image(required)) => {
                if !info.usage.contains(required) {
                    return Err(TrackError::InvalidUsage {
                        resource,
                        detail: format!("requires {:?} but was created with {:?}", required, info.usage),
                    });
                }
            }
            (ResourceInfo::Buffer(_), RequiredUsage::Image(_)) => {
                return Err(TrackError::invalid_object(resource, "expected an image"));
            }
            (ResourceInfo::Image(_), RequiredUsage::Buffer(_)) => {
                return Err(TrackError::invalid_object(resource, "expected a buffer"));
            }
        }
        Ok(())
    }

    // ── Swapchains ──────────────────────────────────────────

    /// Register a swapchain and its presentable images, which are bound to the
    /// swapchain from creation and never to client memory.
    pub fn create_swapchain(&mut self, swapchain: Handle, images: &[Handle], usage: ImageUsage) -> Result<(), TrackError> {
        if self.swapchains.contains(swapchain) {
            return Err(TrackError::invalid_object(swapchain, "handle is already registered"));
        }
        for image in images {
            if image.kind != ObjectKind::Image || self.images.contains(*image) {
                return Err(TrackError::invalid_object(*image, "presentable image handle is already in use"));
            }
        }

        self.swapchains.register(swapchain, Swapchain { images: images.to_vec() })?;
        for image in images {
            let record = BoundResource {
                info: ResourceInfo::Image(ImageCreateInfo {
                    extent: [0, 0, 1],
                    memory_size: 0,
                    usage,
                    sparse: false,
                }),
                binding: Binding::Swapchain(swapchain),
            };
            self.images.register(*image, record)?;
        }
        debug!("created {} with {} images", swapchain, images.len());
        Ok(())
    }

    /// Destroy a swapchain and the images it owns.
    pub fn destroy_swapchain(&mut self, swapchain: Handle) -> Result<Vec<Handle>, TrackError> {
        let chain = self.swapchains.unregister(swapchain)?;
        for image in &chain.images {
            self.images.unregister(*image).map_err(|e| inconsistent(*image, e))?;
        }
        debug!("destroyed {}", swapchain);
        Ok(chain.images)
    }

    pub fn len(&self) -> usize {
        self.buffers.len() + self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Create-time usage must allow binding to memory with these properties.
fn check_bind_usage(resource: Handle, info: &ResourceInfo, properties: MemoryProperties) -> Result<(), TrackError> {
    if !info.has_usage() {
        return Err(TrackError::InvalidUsage {
            resource,
            detail: "created with no usage flags; it cannot be bound".to_string(),
        });
    }
    if properties.contains(MemoryProperties::LAZILY_ALLOCATED) {
        match info {
            ResourceInfo::Buffer(_) => {
                return Err(TrackError::InvalidUsage {
                    resource,
                    detail: "buffers cannot be bound to lazily allocated memory".to_string(),
                });
            }
            ResourceInfo::Image(image) if !image.usage.contains(ImageUsage::TRANSIENT_ATTACHMENT) => {
                return Err(TrackError::InvalidUsage {
                    resource,
                    detail: "lazily allocated memory requires TRANSIENT_ATTACHMENT usage".to_string(),
                });
            }
            ResourceInfo::Image(_) => {}
        }
    }
    Ok(())
}

/// A binding recorded on one side but missing on the other.
fn inconsistent(resource: Handle, err: TrackError) -> TrackError {
    match err {
        TrackError::ClearEmptyBindings { .. } | TrackError::InvalidObject { .. } => {
            TrackError::internal(&[resource], format!("binding bookkeeping for {} is inconsistent: {}", resource, err))
        }
        other => other,
    }
}
