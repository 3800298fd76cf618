//! The resource factory.
//!
//! A [`Device`] owns the chosen [`Backend`], the four descriptor heaps and
//! memory counters. Every resource, view, fence and recorder holds an
//! `Arc<Device>`, so the backend outlives everything created from it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::acceleration::{AccelerationStructure, AccelerationStructureInputs};
use crate::backend::{AdapterInfo, Backend};
use crate::command::CommandRecorder;
use crate::descriptor::{DescriptorHeap, DescriptorHeapKind};
use crate::error::RhiResult;
use crate::footprint::{CopyAlignment, MipFootprint, compute_footprints};
use crate::pipeline::{Pipeline, PipelineDesc};
use crate::queue::{Queue, QueueKind};
use crate::resource::{Buffer, BufferDesc, BufferKind, ResourceRef, Texture, TextureDesc};
use crate::sync::Fence;
use crate::view::{Sampler, SamplerDesc, View, ViewDesc};

/// Device creation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDesc {
    pub shader_resource_heap_capacity: u32,
    pub sampler_heap_capacity: u32,
    pub render_target_heap_capacity: u32,
    pub depth_target_heap_capacity: u32,
    pub fence_timeout: Duration,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            shader_resource_heap_capacity: 1_000_000,
            sampler_heap_capacity: 2048,
            render_target_heap_capacity: 2048,
            depth_target_heap_capacity: 2048,
            fence_timeout: Duration::from_secs(10),
        }
    }
}

impl DeviceDesc {
    fn capacity(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::ShaderResource => self.shader_resource_heap_capacity,
            DescriptorHeapKind::Sampler => self.sampler_heap_capacity,
            DescriptorHeapKind::RenderTarget => self.render_target_heap_capacity,
            DescriptorHeapKind::DepthTarget => self.depth_target_heap_capacity,
        }
    }
}

/// Snapshot of device memory owned by live resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub buffers: u64,
    pub buffer_bytes: u64,
    pub textures: u64,
    pub texture_bytes: u64,
}

impl MemoryStats {
    pub fn total_bytes(&self) -> u64 {
        self.buffer_bytes + self.texture_bytes
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryCounters {
    buffers: AtomicU64,
    buffer_bytes: AtomicU64,
    textures: AtomicU64,
    texture_bytes: AtomicU64,
}

impl MemoryCounters {
    pub(crate) fn add_buffer(&self, bytes: u64) {
        self.buffers.fetch_add(1, Ordering::Relaxed);
        self.buffer_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn remove_buffer(&self, bytes: u64) {
        self.buffers.fetch_sub(1, Ordering::Relaxed);
        self.buffer_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_texture(&self, bytes: u64) {
        self.textures.fetch_add(1, Ordering::Relaxed);
        self.texture_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn remove_texture(&self, bytes: u64) {
        self.textures.fetch_sub(1, Ordering::Relaxed);
        self.texture_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            buffers: self.buffers.load(Ordering::Relaxed),
            buffer_bytes: self.buffer_bytes.load(Ordering::Relaxed),
            textures: self.textures.load(Ordering::Relaxed),
            texture_bytes: self.texture_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Resource factory bound to one backend.
pub struct Device {
    backend: Arc<dyn Backend>,
    adapter: AdapterInfo,
    heaps: [Arc<DescriptorHeap>; 4],
    desc: DeviceDesc,
    memory: MemoryCounters,
}

impl Device {
    /// Creates the device and its descriptor heaps.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if a heap cannot be created.
    pub fn new(backend: Arc<dyn Backend>, desc: DeviceDesc) -> RhiResult<Arc<Self>> {
        let adapter = backend.adapter_info();
        info!(
            "Creating device on {} ({}, {})",
            adapter.name, adapter.backend, adapter.device_type
        );

        let heap = |kind: DescriptorHeapKind| -> RhiResult<Arc<DescriptorHeap>> {
            let requested = desc.capacity(kind);
            let info = backend.create_descriptor_heap(kind, requested)?;
            if info.capacity < requested {
                warn!(
                    "{} clamped from {} to {} descriptors",
                    kind.name(),
                    requested,
                    info.capacity
                );
            }
            Ok(DescriptorHeap::new(kind, info))
        };
        let heaps = [
            heap(DescriptorHeapKind::ShaderResource)?,
            heap(DescriptorHeapKind::Sampler)?,
            heap(DescriptorHeapKind::RenderTarget)?,
            heap(DescriptorHeapKind::DepthTarget)?,
        ];

        Ok(Arc::new(Self {
            backend,
            adapter,
            heaps,
            desc,
            memory: MemoryCounters::default(),
        }))
    }

    /// The backend driving this device.
    #[inline]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    #[inline]
    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    /// The heap of `kind`.
    #[inline]
    pub fn heap(&self, kind: DescriptorHeapKind) -> &Arc<DescriptorHeap> {
        &self.heaps[kind.index()]
    }

    /// Longest a fence wait may block.
    #[inline]
    pub fn fence_timeout(&self) -> Duration {
        self.desc.fence_timeout
    }

    #[inline]
    pub fn copy_alignment(&self) -> CopyAlignment {
        self.backend.copy_alignment()
    }

    /// Per-mip footprints of `desc` and the buffer size they need.
    pub fn texture_footprints(&self, desc: &TextureDesc) -> (Vec<MipFootprint>, u64) {
        compute_footprints(desc, self.copy_alignment())
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.snapshot()
    }

    pub(crate) fn memory(&self) -> &MemoryCounters {
        &self.memory
    }

    /// Creates a buffer of `size` bytes with element `stride` (0 if untyped).
    pub fn create_buffer(
        self: &Arc<Self>,
        size: u64,
        stride: u32,
        kind: BufferKind,
        name: &str,
    ) -> RhiResult<Arc<Buffer>> {
        Buffer::new(
            self,
            BufferDesc {
                name: name.to_string(),
                size,
                stride,
                kind,
            },
        )
    }

    pub fn create_texture(self: &Arc<Self>, desc: TextureDesc) -> RhiResult<Arc<Texture>> {
        Texture::new(self, desc)
    }

    pub fn create_view(
        self: &Arc<Self>,
        resource: impl Into<ResourceRef>,
        desc: ViewDesc,
    ) -> RhiResult<Arc<View>> {
        View::new(self, resource.into(), desc)
    }

    pub fn create_sampler(self: &Arc<Self>, desc: SamplerDesc) -> RhiResult<Arc<Sampler>> {
        Sampler::new(self, desc)
    }

    pub fn create_pipeline(self: &Arc<Self>, desc: &PipelineDesc) -> RhiResult<Arc<Pipeline>> {
        Pipeline::new(self, desc)
    }

    pub fn create_acceleration_structure(
        self: &Arc<Self>,
        inputs: AccelerationStructureInputs,
        name: &str,
    ) -> RhiResult<Arc<AccelerationStructure>> {
        AccelerationStructure::new(self, inputs, name)
    }

    pub fn create_fence(self: &Arc<Self>, name: &str) -> RhiResult<Fence> {
        Fence::new(self, name)
    }

    pub fn create_queue(self: &Arc<Self>, kind: QueueKind) -> Arc<Queue> {
        Queue::new(self, kind)
    }

    pub fn create_recorder(self: &Arc<Self>, queue: QueueKind, name: &str) -> RhiResult<CommandRecorder> {
        CommandRecorder::new(self, queue, name)
    }

    /// Blocks until all submitted work has finished.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.backend.wait_idle()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("adapter", &self.adapter.name)
            .field("backend", &self.adapter.backend)
            .finish()
    }
}
