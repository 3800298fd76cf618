//! CPU emulation of a GPU backend.
//!
//! Every device object lives in host memory behind one lock. Recorded command
//! lists are lowered to a small op list and executed on the calling thread,
//! either at submit time ([`ExecutionMode::Immediate`]) or lazily when a fence
//! wait needs them ([`ExecutionMode::Deferred`]). Deferred mode keeps the queue
//! timeline observable: work stays pending until the CPU waits on it.

mod executor;
mod memory;

use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::acceleration::{
    AccelerationStructureInputs, AccelerationStructureKind, AccelerationStructureSizes,
};
use crate::backend::{
    AdapterInfo, Backend, DescriptorHeapInfo, RawAccelerationStructure, RawBuffer,
    RawCommandList, RawFence, RawPipeline, RawResource, RawSampler, RawTexture, RawView,
    RawViewDesc,
};
use crate::command::Command;
use crate::descriptor::{DescriptorHandle, DescriptorHeapKind};
use crate::error::{RhiError, RhiResult};
use crate::footprint::{CopyAlignment, align_up, compute_footprints};
use crate::pipeline::PipelineDesc;
use crate::queue::QueueKind;
use crate::resource::{BufferDesc, TextureDesc, TextureUsage};
use crate::surface::{PresentStatus, RawSwapchain, SurfaceTarget, SwapchainDesc};
use crate::view::SamplerDesc;

use executor::{Memory, Op, SoftBuffer, SoftTexture};

pub use executor::{ACCELERATION_STRUCTURE_MAGIC, ExecutionStats};

/// Base of the fake addresses handed out for acceleration structures.
const ACCELERATION_STRUCTURE_ADDRESS_BASE: u64 = 0xA5_0000_0000;

/// Upper bound on any one descriptor heap.
const MAX_HEAP_CAPACITY: u32 = 1_000_000;

/// When submitted work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Lists execute inside `submit`; fences signal immediately.
    #[default]
    Immediate,
    /// Lists and signals queue up and run only when a fence wait needs them.
    Deferred,
}

/// Construction parameters for [`SoftwareBackend`].
#[derive(Debug, Clone, Copy)]
pub struct SoftwareConfig {
    pub execution: ExecutionMode,
    pub copy_alignment: CopyAlignment,
    /// Reported as the adapter's device-local memory.
    pub dedicated_memory: u64,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::Immediate,
            copy_alignment: CopyAlignment {
                row_pitch: 256,
                placement: 512,
            },
            dedicated_memory: 512 * 1024 * 1024,
        }
    }
}

impl SoftwareConfig {
    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }
}

/// Snapshot of backend activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub submissions: u64,
    pub presents: u64,
    pub executed: ExecutionStats,
    /// Device objects currently alive, swapchain images included.
    pub live_objects: usize,
}

struct SoftList {
    queue: QueueKind,
    name: String,
    ops: Vec<Op>,
}

enum Pending {
    Execute { list: String, ops: Vec<Op> },
    Signal { fence: RawFence, value: u64 },
}

#[derive(Default)]
struct State {
    buffers: HashMap<u64, SoftBuffer>,
    textures: HashMap<u64, SoftTexture>,
    views: HashMap<u64, RawViewDesc>,
    samplers: HashSet<u64>,
    pipelines: HashSet<u64>,
    accels: HashMap<u64, RawBuffer>,
    fences: HashMap<u64, u64>,
    lists: HashMap<u64, SoftList>,
    pending: VecDeque<Pending>,
    executed: ExecutionStats,
    submissions: u64,
    presents: u64,
    lost: Option<String>,
    hung: bool,
}

impl State {
    fn live_objects(&self) -> usize {
        self.buffers.len()
            + self.textures.len()
            + self.views.len()
            + self.samplers.len()
            + self.pipelines.len()
            + self.accels.len()
            + self.fences.len()
            + self.lists.len()
    }

    fn check_alive(&self) -> RhiResult<()> {
        match &self.lost {
            Some(reason) => Err(RhiError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn run(&mut self, list: &str, ops: &[Op]) -> RhiResult<()> {
        let memory = Memory {
            buffers: &self.buffers,
            textures: &self.textures,
        };
        for op in ops {
            if let Err(e) = memory.execute(op, &mut self.executed) {
                error!("Command list '{}' faulted: {}", list, e);
                self.lost = Some(e.to_string());
                return Err(e);
            }
        }
        self.executed.lists += 1;
        trace!("Executed command list '{}' ({} ops)", list, ops.len());
        Ok(())
    }

    fn signal(&mut self, fence: RawFence, value: u64) -> RhiResult<()> {
        let current = self
            .fences
            .get_mut(&fence.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("fence {}", fence.0)))?;
        *current = (*current).max(value);
        Ok(())
    }

    /// Retires the oldest pending item. Returns false when nothing is pending.
    fn step(&mut self) -> RhiResult<bool> {
        self.check_alive()?;
        if self.hung {
            return Ok(false);
        }
        match self.pending.pop_front() {
            Some(Pending::Execute { list, ops }) => self.run(&list, &ops)?,
            Some(Pending::Signal { fence, value }) => self.signal(fence, value)?,
            None => return Ok(false),
        }
        Ok(true)
    }
}

struct Inner {
    config: SoftwareConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> RhiResult<MutexGuard<'_, State>> {
        Ok(self.state.lock()?)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<RawTexture> {
        let id = self.next_id();
        self.lock()?
            .textures
            .insert(id, SoftTexture::new(desc.clone()));
        Ok(RawTexture(id))
    }

    fn destroy_texture(&self, texture: RawTexture) {
        if let Ok(mut state) = self.state.lock()
            && state.textures.remove(&texture.0).is_none()
        {
            warn!("Destroying unknown texture {}", texture.0);
        }
    }
}

/// A [`Backend`] that runs on the CPU.
///
/// Cloning shares the same emulated device.
#[derive(Clone)]
pub struct SoftwareBackend {
    inner: Arc<Inner>,
}

impl SoftwareBackend {
    pub fn new(config: SoftwareConfig) -> Self {
        info!(
            "Software backend ready ({:?} execution, row pitch {}, placement {})",
            config.execution, config.copy_alignment.row_pitch, config.copy_alignment.placement
        );
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Backend with deferred execution, for exercising frame pacing.
    pub fn deferred() -> Self {
        Self::new(SoftwareConfig::default().with_execution(ExecutionMode::Deferred))
    }

    pub fn config(&self) -> &SoftwareConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> SoftwareStats {
        match self.inner.state.lock() {
            Ok(state) => SoftwareStats {
                submissions: state.submissions,
                presents: state.presents,
                executed: state.executed,
                live_objects: state.live_objects(),
            },
            Err(_) => SoftwareStats::default(),
        }
    }

    /// Number of queued lists and signals not yet retired.
    pub fn pending_work(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.pending.len())
            .unwrap_or(0)
    }

    /// Retires up to `count` pending items, as if the GPU made progress.
    /// Returns how many were retired.
    pub fn advance(&self, count: usize) -> RhiResult<usize> {
        let mut state = self.inner.lock()?;
        let mut retired = 0;
        while retired < count && state.step()? {
            retired += 1;
        }
        Ok(retired)
    }

    /// Puts the device into the lost state; every later queue operation fails.
    pub fn simulate_device_loss(&self, reason: &str) {
        if let Ok(mut state) = self.inner.state.lock() {
            error!("Simulated device loss: {}", reason);
            state.lost = Some(reason.to_owned());
            state.pending.clear();
        }
    }

    /// Stops (or resumes) retiring pending work, so waits run into their timeout.
    pub fn simulate_hang(&self, hung: bool) {
        if let Ok(mut state) = self.inner.state.lock() {
            warn!("Software queue {}", if hung { "hung" } else { "resumed" });
            state.hung = hung;
        }
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new(SoftwareConfig::default())
    }
}

impl Backend for SoftwareBackend {
    fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "Keel Software Device".to_owned(),
            backend: "software",
            device_type: "cpu",
            dedicated_memory: self.inner.config.dedicated_memory,
            ray_tracing: true,
        }
    }

    fn copy_alignment(&self) -> CopyAlignment {
        self.inner.config.copy_alignment
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> RhiResult<DescriptorHeapInfo> {
        let tag = (kind.index() as u64) + 1;
        Ok(DescriptorHeapInfo {
            capacity: capacity.min(MAX_HEAP_CAPACITY),
            cpu_base: tag << 40,
            gpu_base: kind.is_shader_visible().then_some(tag << 48),
            increment: 32,
        })
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<RawBuffer> {
        let size = usize::try_from(desc.size).map_err(|_| RhiError::ResourceExhausted {
            heap: "host memory",
            capacity: u32::MAX,
        })?;
        let id = self.inner.next_id();
        self.inner.lock()?.buffers.insert(
            id,
            SoftBuffer {
                memory: memory::HostMemory::zeroed(size),
                size: desc.size,
                host_visible: desc.kind.is_host_visible(),
            },
        );
        Ok(RawBuffer(id))
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        if let Ok(mut state) = self.inner.state.lock()
            && state.buffers.remove(&buffer.0).is_none()
        {
            warn!("Destroying unknown buffer {}", buffer.0);
        }
    }

    fn map_buffer(&self, buffer: RawBuffer) -> RhiResult<NonNull<u8>> {
        let state = self.inner.lock()?;
        let soft = state
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        if !soft.host_visible {
            return Err(RhiError::Unsupported(format!(
                "buffer {} is not host visible",
                buffer.0
            )));
        }
        Ok(soft.memory.ptr())
    }

    fn unmap_buffer(&self, _buffer: RawBuffer) {}

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<(RawTexture, u64)> {
        let (_, size) = compute_footprints(desc, self.inner.config.copy_alignment);
        let raw = self.inner.create_texture(desc)?;
        Ok((raw, size))
    }

    fn destroy_texture(&self, texture: RawTexture) {
        self.inner.destroy_texture(texture);
    }

    fn create_view(&self, desc: &RawViewDesc, slot: &DescriptorHandle) -> RhiResult<RawView> {
        let mut state = self.inner.lock()?;
        let exists = match desc.resource {
            RawResource::Buffer(b) => state.buffers.contains_key(&b.0),
            RawResource::Texture(t) => state.textures.contains_key(&t.0),
        };
        if !exists {
            return Err(RhiError::InvalidHandle(format!(
                "view of destroyed {:?}",
                desc.resource
            )));
        }
        let id = self.inner.next_id();
        state.views.insert(id, *desc);
        trace!(
            "View {} -> {:?} slot {} ({:?})",
            id,
            desc.resource,
            slot.index(),
            desc.kind
        );
        Ok(RawView(id))
    }

    fn destroy_view(&self, view: RawView) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.views.remove(&view.0);
        }
    }

    fn create_sampler(&self, _desc: &SamplerDesc, _slot: &DescriptorHandle) -> RhiResult<RawSampler> {
        let id = self.inner.next_id();
        self.inner.lock()?.samplers.insert(id);
        Ok(RawSampler(id))
    }

    fn destroy_sampler(&self, sampler: RawSampler) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.samplers.remove(&sampler.0);
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<RawPipeline> {
        let id = self.inner.next_id();
        self.inner.lock()?.pipelines.insert(id);
        debug!("Software pipeline '{}' ({:?})", desc.name(), desc.kind());
        Ok(RawPipeline(id))
    }

    fn destroy_pipeline(&self, pipeline: RawPipeline) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.pipelines.remove(&pipeline.0);
        }
    }

    fn acceleration_structure_sizes(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> RhiResult<AccelerationStructureSizes> {
        let primitives = u64::from(inputs.primitive_count());
        Ok(AccelerationStructureSizes {
            result: align_up(256 + 64 * primitives, 256),
            scratch: align_up(128 + 32 * primitives, 256),
        })
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        result: RawBuffer,
        size: u64,
    ) -> RhiResult<RawAccelerationStructure> {
        let mut state = self.inner.lock()?;
        let buffer = state
            .buffers
            .get(&result.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {}", result.0)))?;
        if buffer.size < size {
            return Err(RhiError::contract(format!(
                "{kind:?} acceleration structure needs {size} bytes, buffer has {}",
                buffer.size
            )));
        }
        let id = self.inner.next_id();
        state.accels.insert(id, result);
        Ok(RawAccelerationStructure(id))
    }

    fn acceleration_structure_address(&self, accel: RawAccelerationStructure) -> u64 {
        ACCELERATION_STRUCTURE_ADDRESS_BASE + (accel.0 << 8)
    }

    fn destroy_acceleration_structure(&self, accel: RawAccelerationStructure) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.accels.remove(&accel.0);
        }
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<RawFence> {
        let id = self.inner.next_id();
        self.inner.lock()?.fences.insert(id, initial_value);
        Ok(RawFence(id))
    }

    fn destroy_fence(&self, fence: RawFence) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.fences.remove(&fence.0);
        }
    }

    fn fence_completed_value(&self, fence: RawFence) -> RhiResult<u64> {
        let state = self.inner.lock()?;
        state.check_alive()?;
        state
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("fence {}", fence.0)))
    }

    /// The emulated queue only progresses while someone waits on it, so a
    /// value that draining cannot reach times out without sleeping.
    fn wait_fence(&self, fence: RawFence, value: u64, timeout: Duration) -> RhiResult<()> {
        let mut state = self.inner.lock()?;
        loop {
            state.check_alive()?;
            let completed = state
                .fences
                .get(&fence.0)
                .copied()
                .ok_or_else(|| RhiError::InvalidHandle(format!("fence {}", fence.0)))?;
            if completed >= value {
                return Ok(());
            }
            if !state.step()? {
                warn!(
                    "Fence {} stuck at {} waiting for {} ({:?} budget)",
                    fence.0, completed, value, timeout
                );
                return Err(RhiError::FenceTimeout { value, completed });
            }
        }
    }

    fn create_command_list(&self, queue: QueueKind, name: &str) -> RhiResult<RawCommandList> {
        let id = self.inner.next_id();
        self.inner.lock()?.lists.insert(
            id,
            SoftList {
                queue,
                name: name.to_owned(),
                ops: Vec::new(),
            },
        );
        Ok(RawCommandList(id))
    }

    fn destroy_command_list(&self, list: RawCommandList) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.lists.remove(&list.0);
        }
    }

    fn reset_command_list(&self, list: RawCommandList) -> RhiResult<()> {
        let mut state = self.inner.lock()?;
        let soft = state
            .lists
            .get_mut(&list.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("command list {}", list.0)))?;
        soft.ops.clear();
        Ok(())
    }

    fn encode_command_list(&self, list: RawCommandList, commands: &[Command]) -> RhiResult<()> {
        let ops = executor::encode(commands);
        let mut state = self.inner.lock()?;
        let soft = state
            .lists
            .get_mut(&list.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("command list {}", list.0)))?;
        soft.ops = ops;
        Ok(())
    }

    fn submit(&self, queue: QueueKind, lists: &[RawCommandList]) -> RhiResult<()> {
        let mut state = self.inner.lock()?;
        state.check_alive()?;

        let mut batch = Vec::with_capacity(lists.len());
        for list in lists {
            let soft = state
                .lists
                .get(&list.0)
                .ok_or_else(|| RhiError::InvalidHandle(format!("command list {}", list.0)))?;
            if soft.queue != queue {
                return Err(RhiError::contract(format!(
                    "{:?} list '{}' submitted to {:?} queue",
                    soft.queue, soft.name, queue
                )));
            }
            batch.push((soft.name.clone(), soft.ops.clone()));
        }

        state.submissions += 1;
        for (name, ops) in batch {
            match self.inner.config.execution {
                ExecutionMode::Immediate => state.run(&name, &ops)?,
                ExecutionMode::Deferred => state.pending.push_back(Pending::Execute { list: name, ops }),
            }
        }
        Ok(())
    }

    fn signal_fence(&self, _queue: QueueKind, fence: RawFence, value: u64) -> RhiResult<()> {
        let mut state = self.inner.lock()?;
        state.check_alive()?;
        match self.inner.config.execution {
            ExecutionMode::Immediate if state.pending.is_empty() => state.signal(fence, value),
            _ => {
                state.pending.push_back(Pending::Signal { fence, value });
                Ok(())
            }
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.inner.lock()?;
        while state.step()? {}
        if state.hung && !state.pending.is_empty() {
            return Err(RhiError::DeviceLost(format!(
                "queue hung with {} items pending",
                state.pending.len()
            )));
        }
        Ok(())
    }

    fn create_swapchain(
        &self,
        target: &SurfaceTarget,
        desc: &SwapchainDesc,
    ) -> RhiResult<Box<dyn RawSwapchain>> {
        match target {
            SurfaceTarget::Offscreen => {}
            #[cfg(feature = "vulkan")]
            SurfaceTarget::Vulkan(_) => {
                return Err(RhiError::Unsupported(
                    "software backend cannot present to a window surface".into(),
                ));
            }
        }
        let mut swapchain = SoftwareSwapchain {
            inner: Arc::clone(&self.inner),
            desc: *desc,
            images: Vec::new(),
            next: 0,
        };
        swapchain.create_images()?;
        Ok(Box::new(swapchain))
    }
}

/// Offscreen images rotated in order.
struct SoftwareSwapchain {
    inner: Arc<Inner>,
    desc: SwapchainDesc,
    images: Vec<RawTexture>,
    next: u32,
}

impl SoftwareSwapchain {
    fn create_images(&mut self) -> RhiResult<()> {
        for index in 0..self.desc.image_count {
            let desc = TextureDesc::new(
                format!("swapchain image {index}"),
                self.desc.width,
                self.desc.height,
                self.desc.format,
            )
            .with_usage(TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC | TextureUsage::COPY_DST);
            let raw = self.inner.create_texture(&desc)?;
            self.images.push(raw);
        }
        self.next = 0;
        Ok(())
    }

    fn destroy_images(&mut self) {
        for raw in self.images.drain(..) {
            self.inner.destroy_texture(raw);
        }
    }
}

impl RawSwapchain for SoftwareSwapchain {
    fn images(&self) -> Vec<RawTexture> {
        self.images.clone()
    }

    fn desc(&self) -> SwapchainDesc {
        self.desc
    }

    fn acquire(&mut self) -> RhiResult<u32> {
        self.inner.lock()?.check_alive()?;
        let index = self.next;
        self.next = (self.next + 1) % self.desc.image_count.max(1);
        Ok(index)
    }

    fn present(&mut self, index: u32, _vsync: bool) -> RhiResult<PresentStatus> {
        let mut state = self.inner.lock()?;
        state.check_alive()?;
        state.presents += 1;
        trace!("Presented swapchain image {}", index);
        Ok(PresentStatus::Presented)
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.destroy_images();
        self.desc.width = width;
        self.desc.height = height;
        self.create_images()
    }
}

impl Drop for SoftwareSwapchain {
    fn drop(&mut self) {
        self.destroy_images();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::resource::BufferKind;

    fn buffer_desc(size: u64, kind: BufferKind) -> BufferDesc {
        BufferDesc {
            name: "test".into(),
            size,
            stride: 0,
            kind,
        }
    }

    #[test]
    fn test_descriptor_heap_addresses() {
        let backend = SoftwareBackend::default();
        let srv = backend
            .create_descriptor_heap(DescriptorHeapKind::ShaderResource, 16)
            .unwrap();
        let rtv = backend
            .create_descriptor_heap(DescriptorHeapKind::RenderTarget, 16)
            .unwrap();
        assert_eq!(srv.capacity, 16);
        assert!(srv.gpu_base.is_some());
        assert!(rtv.gpu_base.is_none());
        assert_ne!(srv.cpu_base, rtv.cpu_base);
    }

    #[test]
    fn test_map_requires_host_visible() {
        let backend = SoftwareBackend::default();
        let gpu = backend.create_buffer(&buffer_desc(64, BufferKind::Vertex)).unwrap();
        let staging = backend.create_buffer(&buffer_desc(64, BufferKind::Staging)).unwrap();
        assert!(matches!(backend.map_buffer(gpu), Err(RhiError::Unsupported(_))));
        assert!(backend.map_buffer(staging).is_ok());
        backend.destroy_buffer(gpu);
        backend.destroy_buffer(staging);
        assert_eq!(backend.stats().live_objects, 0);
    }

    #[test]
    fn test_immediate_signal_completes() {
        let backend = SoftwareBackend::default();
        let fence = backend.create_fence(0).unwrap();
        backend.signal_fence(QueueKind::Graphics, fence, 4).unwrap();
        assert_eq!(backend.fence_completed_value(fence).unwrap(), 4);
    }

    #[test]
    fn test_deferred_signal_waits_for_drain() {
        let backend = SoftwareBackend::deferred();
        let fence = backend.create_fence(0).unwrap();
        backend.signal_fence(QueueKind::Graphics, fence, 1).unwrap();
        backend.signal_fence(QueueKind::Graphics, fence, 2).unwrap();
        assert_eq!(backend.fence_completed_value(fence).unwrap(), 0);
        assert_eq!(backend.pending_work(), 2);

        assert_eq!(backend.advance(1).unwrap(), 1);
        assert_eq!(backend.fence_completed_value(fence).unwrap(), 1);

        backend.wait_fence(fence, 2, Duration::from_secs(1)).unwrap();
        assert_eq!(backend.pending_work(), 0);
    }

    #[test]
    fn test_unreachable_value_times_out() {
        let backend = SoftwareBackend::deferred();
        let fence = backend.create_fence(0).unwrap();
        backend.signal_fence(QueueKind::Graphics, fence, 1).unwrap();
        let err = backend
            .wait_fence(fence, 5, Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, RhiError::FenceTimeout { value: 5, completed: 1 }));
    }

    #[test]
    fn test_hang_then_loss() {
        let backend = SoftwareBackend::deferred();
        let fence = backend.create_fence(0).unwrap();
        backend.signal_fence(QueueKind::Graphics, fence, 1).unwrap();
        backend.simulate_hang(true);
        assert!(matches!(
            backend.wait_fence(fence, 1, Duration::from_millis(1)),
            Err(RhiError::FenceTimeout { .. })
        ));

        backend.simulate_device_loss("test");
        assert!(matches!(
            backend.fence_completed_value(fence),
            Err(RhiError::DeviceLost(_))
        ));
        assert!(backend.submit(QueueKind::Graphics, &[]).is_err());
    }

    #[test]
    fn test_texture_size_uses_footprints() {
        let backend = SoftwareBackend::default();
        let desc = TextureDesc::new("t", 3, 2, Format::Rgba8Unorm);
        let (raw, size) = backend.create_texture(&desc).unwrap();
        // Each 12-byte row is padded to the 256-byte pitch.
        assert_eq!(size, 2 * 256);
        backend.destroy_texture(raw);
    }

    #[test]
    fn test_swapchain_rotates_images() {
        let backend = SoftwareBackend::default();
        let desc = SwapchainDesc {
            width: 4,
            height: 4,
            image_count: 3,
            format: Format::Bgra8Unorm,
            vsync: true,
        };
        let mut swapchain = backend
            .create_swapchain(&SurfaceTarget::Offscreen, &desc)
            .unwrap();
        assert_eq!(swapchain.images().len(), 3);
        let order: Vec<u32> = (0..4).map(|_| swapchain.acquire().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 0]);
        assert_eq!(swapchain.present(0, true).unwrap(), PresentStatus::Presented);
        assert_eq!(backend.stats().presents, 1);

        swapchain.resize(8, 8).unwrap();
        assert_eq!(swapchain.desc().width, 8);
        assert_eq!(backend.stats().live_objects, 3);
        drop(swapchain);
        assert_eq!(backend.stats().live_objects, 0);
    }
}
