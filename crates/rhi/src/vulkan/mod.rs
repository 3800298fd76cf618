//! Vulkan 1.3 backend.
//!
//! Built on `ash` and `gpu-allocator`. The core's concepts map as follows:
//!
//! | Core                     | Vulkan                                              |
//! |--------------------------|-----------------------------------------------------|
//! | shader-visible heaps     | one update-after-bind descriptor set (bindless)     |
//! | CPU-only heaps           | index bookkeeping only; attachments use image views |
//! | fence                    | timeline semaphore                                  |
//! | queue kinds              | the graphics queue                                  |
//! | transitions              | `vkCmdPipelineBarrier2` image/buffer barriers       |
//! | render targets           | dynamic rendering                                   |
//!
//! Objects the core destroys are parked until the GPU has passed the last
//! submission that could reference them.

mod acceleration;
mod adapter;
mod conv;
mod descriptors;
mod device;
mod encoder;
mod instance;
mod pipeline;
mod resources;
mod swapchain;
mod sync;

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info, warn};

use crate::acceleration::{AccelerationStructureInputs, AccelerationStructureKind, AccelerationStructureSizes};
use crate::backend::{
    AdapterInfo, Backend, DescriptorHeapInfo, RawAccelerationStructure, RawBuffer, RawCommandList,
    RawFence, RawPipeline, RawResource, RawSampler, RawTexture, RawView, RawViewDesc,
};
use crate::command::Command;
use crate::descriptor::{DescriptorHandle, DescriptorHeapKind};
use crate::error::{RhiError, RhiResult};
use crate::footprint::CopyAlignment;
use crate::format::Format;
use crate::pipeline::PipelineDesc;
use crate::queue::QueueKind;
use crate::resource::{BufferDesc, TextureDesc};
use crate::surface::{RawSwapchain, SurfaceTarget, SwapchainDesc};
use crate::view::{SamplerDesc, ViewDimension, ViewKind};

use acceleration::VkAccelerationStructure;
use adapter::PresentTarget;
use descriptors::{BindlessSet, DescriptorWrite};
use device::LogicalDevice;
use encoder::{EncodeContext, VkCommandList};
use instance::Instance;
use pipeline::VkPipeline;
use resources::{VkBuffer, VkImage};
use sync::{Garbage, RetireQueue, device_error};

/// Creates a `VkSurfaceKHR` for the backend's instance.
///
/// Called once during construction, after the instance exists and before an
/// adapter is chosen, so adapter selection can require presentation support.
pub type SurfaceFactory<'a> = &'a dyn Fn(&ash::Entry, &ash::Instance) -> RhiResult<vk::SurfaceKHR>;

/// Construction parameters for [`VulkanBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VulkanConfig {
    /// Enables the Khronos validation layer when installed.
    pub validation: bool,
    /// Upper bound on bindless shader-resource descriptors.
    pub resource_capacity: u32,
    /// Upper bound on bindless samplers.
    pub sampler_capacity: u32,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            resource_capacity: 500_000,
            sampler_capacity: 2048,
        }
    }
}

struct VkView {
    /// `None` for buffer views, which live only in the descriptor set.
    image_view: Option<vk::ImageView>,
    resource: RawResource,
    base_mip: u32,
}

/// Every live object, keyed by the ids handed to the core.
#[derive(Default)]
pub(crate) struct Objects {
    buffers: HashMap<u64, VkBuffer>,
    images: HashMap<u64, VkImage>,
    views: HashMap<u64, VkView>,
    samplers: HashMap<u64, vk::Sampler>,
    pipelines: HashMap<u64, VkPipeline>,
    accels: HashMap<u64, VkAccelerationStructure>,
    fences: HashMap<u64, vk::Semaphore>,
    lists: HashMap<u64, VkCommandList>,
}

struct Submissions {
    /// Internal timeline counting queue submissions.
    timeline: vk::Semaphore,
    submitted: u64,
    retire: RetireQueue,
    /// Acquire semaphores the next submission must wait on.
    acquire_waits: Vec<vk::Semaphore>,
}

/// State shared by the backend and its swapchains.
pub(crate) struct Shared {
    objects: Mutex<Objects>,
    submissions: Mutex<Submissions>,
    next_id: AtomicU64,
    descriptors: BindlessSet,
    labels: Option<ash::ext::debug_utils::Device>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    surface_loader: Option<ash::khr::surface::Instance>,
    surface: Option<vk::SurfaceKHR>,
    adapter: AdapterInfo,
    copy_alignment: CopyAlignment,
    ray_tracing: bool,
    // Declared last: dropped after everything above, device before instance.
    device: LogicalDevice,
    instance: Instance,
}

impl Shared {
    #[inline]
    pub(crate) fn device(&self) -> &LogicalDevice {
        &self.device
    }

    #[inline]
    pub(crate) fn swapchain_loader(&self) -> Option<&ash::khr::swapchain::Device> {
        self.swapchain_loader.as_ref()
    }

    #[inline]
    pub(crate) fn surface_loader(&self) -> Option<&ash::khr::surface::Instance> {
        self.surface_loader.as_ref()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn objects(&self) -> RhiResult<MutexGuard<'_, Objects>> {
        Ok(self.objects.lock()?)
    }

    fn submissions(&self) -> RhiResult<MutexGuard<'_, Submissions>> {
        Ok(self.submissions.lock()?)
    }

    /// Parks `garbage` until the latest submission has completed.
    fn retire(&self, garbage: Garbage) {
        match self.submissions.lock() {
            Ok(mut submissions) => {
                let submitted = submissions.submitted;
                submissions.retire.push(submitted, garbage);
            }
            Err(_) => error!("Submission lock poisoned; leaking a device object"),
        }
    }

    /// Destroys everything the GPU has finished with.
    fn collect(&self, submissions: &mut Submissions) -> RhiResult<()> {
        let completed = sync::timeline_value(self.device.handle(), submissions.timeline)?;
        for garbage in submissions.retire.take_ready(completed) {
            garbage.destroy(&self.device);
        }
        Ok(())
    }

    pub(crate) fn register_image(&self, image: VkImage) -> RawTexture {
        let id = self.next_id();
        match self.objects.lock() {
            Ok(mut objects) => {
                objects.images.insert(id, image);
            }
            Err(_) => error!("Object lock poisoned; swapchain image {} unregistered", id),
        }
        RawTexture(id)
    }

    /// Forgets a swapchain image without destroying it.
    pub(crate) fn unregister_image(&self, texture: RawTexture) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.images.remove(&texture.0);
        }
    }

    pub(crate) fn create_texture(&self, desc: &TextureDesc) -> RhiResult<(RawTexture, u64)> {
        let image = resources::create_image(&self.device, desc)?;
        let size = image.allocation.as_ref().map_or(0, |a| a.size());
        let id = self.next_id();
        self.objects()?.images.insert(id, image);
        Ok((RawTexture(id), size))
    }

    pub(crate) fn destroy_texture(&self, texture: RawTexture) {
        let image = self.objects.lock().ok().and_then(|mut o| o.images.remove(&texture.0));
        if let Some(image) = image {
            self.retire(Garbage::Image(image));
        }
    }

    pub(crate) fn push_acquire_wait(&self, semaphore: vk::Semaphore) -> RhiResult<()> {
        self.submissions()?.acquire_waits.push(semaphore);
        Ok(())
    }

    /// Signals a binary semaphore after all previously submitted work.
    pub(crate) fn signal_binary(&self, semaphore: vk::Semaphore) -> RhiResult<()> {
        let mut submissions = self.submissions()?;
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        self.queue_submit(&mut submissions, &[], &signals)
    }

    /// One `vkQueueSubmit2`, consuming pending acquire waits and advancing the
    /// internal timeline.
    fn queue_submit(
        &self,
        submissions: &mut Submissions,
        command_buffers: &[vk::CommandBufferSubmitInfo<'_>],
        extra_signals: &[vk::SemaphoreSubmitInfo<'_>],
    ) -> RhiResult<()> {
        let waits: Vec<vk::SemaphoreSubmitInfo> = submissions
            .acquire_waits
            .iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let value = submissions.submitted + 1;
        let mut signals = vec![vk::SemaphoreSubmitInfo::default()
            .semaphore(submissions.timeline)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        signals.extend_from_slice(extra_signals);

        let info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(command_buffers)
            .signal_semaphore_infos(&signals);
        // SAFETY: every command buffer is executable and every semaphore live.
        unsafe {
            self.device
                .handle()
                .queue_submit2(self.device.queue(), &[info], vk::Fence::null())
        }
        .map_err(device_error)?;

        submissions.acquire_waits.clear();
        submissions.submitted = value;
        self.collect(submissions)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        // SAFETY: no other thread records into queue-owned objects during the wait.
        unsafe { self.device.handle().device_wait_idle() }.map_err(device_error)?;
        let mut submissions = self.submissions()?;
        self.collect(&mut submissions)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // SAFETY: the backend is going away; nothing else can submit.
        if let Err(e) = unsafe { self.device.handle().device_wait_idle() } {
            error!("device_wait_idle failed during teardown: {:?}", e);
        }

        let mut garbage = Vec::new();
        if let Ok(submissions) = self.submissions.get_mut() {
            garbage.extend(submissions.retire.take_all());
            garbage.push(Garbage::Semaphore(submissions.timeline));
        }
        if let Ok(objects) = self.objects.get_mut() {
            let leaked = objects.buffers.len() + objects.images.len() + objects.views.len();
            if leaked > 0 {
                warn!("{} device objects still alive at teardown", leaked);
            }
            garbage.extend(objects.lists.drain().map(|(_, l)| Garbage::CommandPool(l.pool)));
            garbage.extend(objects.fences.drain().map(|(_, s)| Garbage::Semaphore(s)));
            garbage.extend(objects.views.drain().filter_map(|(_, v)| v.image_view.map(Garbage::ImageView)));
            garbage.extend(objects.samplers.drain().map(|(_, s)| Garbage::Sampler(s)));
            garbage.extend(objects.pipelines.drain().map(|(_, p)| Garbage::Pipeline(p.pipeline)));
            garbage.extend(objects.accels.drain().map(|(_, a)| Garbage::AccelerationStructure(a.handle)));
            garbage.extend(objects.buffers.drain().map(|(_, b)| Garbage::Buffer(b)));
            garbage.extend(objects.images.drain().map(|(_, i)| Garbage::Image(i)));
        }
        for item in garbage {
            item.destroy(&self.device);
        }
        self.descriptors.destroy(self.device.handle());

        if let (Some(loader), Some(surface)) = (&self.surface_loader, self.surface) {
            // SAFETY: every swapchain holds an Arc to this object, so none is left.
            unsafe { loader.destroy_surface(surface, None) };
        }
        info!("Vulkan backend destroyed");
    }
}

/// The Vulkan implementation of [`Backend`].
#[derive(Clone)]
pub struct VulkanBackend {
    shared: Arc<Shared>,
}

impl VulkanBackend {
    /// Creates a headless backend.
    pub fn new(config: &VulkanConfig) -> RhiResult<Self> {
        Self::with_surface(config, None)
    }

    /// Creates a backend that owns a window surface made by `surface_factory`.
    ///
    /// The surface is then available through [`VulkanBackend::surface`] for
    /// [`SurfaceTarget::Vulkan`].
    pub fn with_surface(config: &VulkanConfig, surface_factory: Option<SurfaceFactory<'_>>) -> RhiResult<Self> {
        let presentable = surface_factory.is_some();
        let instance = Instance::new(config.validation, presentable)?;

        let surface_loader =
            presentable.then(|| ash::khr::surface::Instance::new(instance.entry(), instance.handle()));
        let surface = match surface_factory {
            Some(factory) => Some(factory(instance.entry(), instance.handle())?),
            None => None,
        };

        match Self::create(config, instance, surface_loader.clone(), surface) {
            Ok(backend) => Ok(backend),
            Err((instance, e)) => {
                if let (Some(loader), Some(surface)) = (surface_loader, surface) {
                    // SAFETY: nothing was created from the surface.
                    unsafe { loader.destroy_surface(surface, None) };
                }
                drop(instance);
                Err(e)
            }
        }
    }

    fn create(
        config: &VulkanConfig,
        instance: Instance,
        surface_loader: Option<ash::khr::surface::Instance>,
        surface: Option<vk::SurfaceKHR>,
    ) -> Result<Self, (Instance, RhiError)> {
        let present = match (&surface_loader, surface) {
            (Some(loader), Some(surface)) => Some(PresentTarget { surface, loader }),
            _ => None,
        };
        let adapter = match adapter::select_adapter(instance.handle(), present.as_ref()) {
            Ok(adapter) => adapter,
            Err(e) => return Err((instance, e)),
        };
        let device = match LogicalDevice::new(&instance, &adapter, surface.is_some()) {
            Ok(device) => device,
            Err(e) => return Err((instance, e)),
        };

        let resource_capacity = config.resource_capacity.min(adapter.max_bindless_resources);
        let sampler_capacity = config.sampler_capacity.min(adapter.max_bindless_samplers);
        let descriptors =
            match BindlessSet::new(device.handle(), resource_capacity, sampler_capacity, adapter.ray_tracing) {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    drop(device);
                    return Err((instance, e));
                }
            };
        let timeline = match sync::create_timeline(device.handle(), 0) {
            Ok(timeline) => timeline,
            Err(e) => {
                descriptors.destroy(device.handle());
                drop(device);
                return Err((instance, e));
            }
        };

        let limits = adapter.properties.limits;
        let copy_alignment = CopyAlignment {
            row_pitch: limits.optimal_buffer_copy_row_pitch_alignment.max(256),
            placement: limits.optimal_buffer_copy_offset_alignment.max(512),
        };
        let adapter_info = AdapterInfo {
            name: adapter.name(),
            backend: "vulkan",
            device_type: adapter.device_type_name(),
            dedicated_memory: adapter.device_local_memory(),
            ray_tracing: adapter.ray_tracing,
        };
        let labels = instance
            .has_validation()
            .then(|| ash::ext::debug_utils::Device::new(instance.handle(), device.handle()));
        let swapchain_loader = surface
            .is_some()
            .then(|| ash::khr::swapchain::Device::new(instance.handle(), device.handle()));

        info!(
            "Vulkan backend on {} ({}, {} MB, ray tracing {})",
            adapter_info.name,
            adapter_info.device_type,
            adapter_info.dedicated_memory / (1024 * 1024),
            if adapter.ray_tracing { "on" } else { "off" }
        );

        Ok(Self {
            shared: Arc::new(Shared {
                objects: Mutex::new(Objects::default()),
                submissions: Mutex::new(Submissions {
                    timeline,
                    submitted: 0,
                    retire: RetireQueue::default(),
                    acquire_waits: Vec::new(),
                }),
                next_id: AtomicU64::new(1),
                descriptors,
                labels,
                swapchain_loader,
                surface_loader,
                surface,
                adapter: adapter_info,
                copy_alignment,
                ray_tracing: adapter.ray_tracing,
                device,
                instance,
            }),
        })
    }

    /// The surface created at construction, if any.
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.shared.surface
    }

    /// Objects waiting for the GPU before they can be destroyed.
    pub fn pending_destructions(&self) -> usize {
        self.shared
            .submissions
            .lock()
            .map_or(0, |submissions| submissions.retire.len())
    }

    fn with_object<T>(&self, f: impl FnOnce(&mut Objects) -> Option<T>) -> Option<T> {
        match self.shared.objects.lock() {
            Ok(mut objects) => f(&mut objects),
            Err(_) => {
                error!("Object lock poisoned");
                None
            }
        }
    }
}

impl Backend for VulkanBackend {
    fn adapter_info(&self) -> AdapterInfo {
        self.shared.adapter.clone()
    }

    fn copy_alignment(&self) -> CopyAlignment {
        self.shared.copy_alignment
    }

    fn create_descriptor_heap(&self, kind: DescriptorHeapKind, capacity: u32) -> RhiResult<DescriptorHeapInfo> {
        let available = match kind {
            DescriptorHeapKind::ShaderResource => self.shared.descriptors.resource_capacity(),
            DescriptorHeapKind::Sampler => self.shared.descriptors.sampler_capacity(),
            DescriptorHeapKind::RenderTarget | DescriptorHeapKind::DepthTarget => capacity,
        };
        if available < capacity {
            warn!(
                "{} clamped from {} to {} by device limits",
                kind.name(),
                capacity,
                available
            );
        }
        // Descriptors are addressed by array element; there are no descriptor pointers.
        Ok(DescriptorHeapInfo {
            capacity: capacity.min(available),
            cpu_base: 0,
            gpu_base: kind.is_shader_visible().then_some(0),
            increment: 1,
        })
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<RawBuffer> {
        let buffer = resources::create_buffer(&self.shared.device, desc, self.shared.ray_tracing)?;
        let id = self.shared.next_id();
        self.shared.objects()?.buffers.insert(id, buffer);
        Ok(RawBuffer(id))
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        if let Some(buffer) = self.with_object(|o| o.buffers.remove(&buffer.0)) {
            self.shared.retire(Garbage::Buffer(buffer));
        }
    }

    fn map_buffer(&self, buffer: RawBuffer) -> RhiResult<NonNull<u8>> {
        let objects = self.shared.objects()?;
        let vk_buffer = objects
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        vk_buffer
            .allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .map(|ptr| ptr.cast::<u8>())
            .ok_or_else(|| RhiError::Unsupported("mapping a buffer without host-visible memory".into()))
    }

    // Host-visible allocations stay persistently mapped.
    fn unmap_buffer(&self, _buffer: RawBuffer) {}

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<(RawTexture, u64)> {
        self.shared.create_texture(desc)
    }

    fn destroy_texture(&self, texture: RawTexture) {
        self.shared.destroy_texture(texture);
    }

    fn create_view(&self, desc: &RawViewDesc, slot: &DescriptorHandle) -> RhiResult<RawView> {
        let device = self.shared.device.handle();
        let descriptors = &self.shared.descriptors;
        let mut objects = self.shared.objects()?;

        let image_view = match desc.resource {
            RawResource::Texture(texture) => {
                let image = objects
                    .images
                    .get(&texture.0)
                    .ok_or_else(|| RhiError::InvalidHandle(format!("texture {}", texture.0)))?;
                let view = resources::create_image_view(device, image.image, desc.format, desc.base_mip, desc.mip_count)?;
                match desc.kind {
                    ViewKind::ShaderRead => descriptors.write(device, slot.index(), DescriptorWrite::SampledImage(view)),
                    ViewKind::UnorderedAccess => {
                        descriptors.write(device, slot.index(), DescriptorWrite::StorageImage(view))
                    }
                    ViewKind::RenderTarget | ViewKind::DepthTarget => {}
                }
                Some(view)
            }
            RawResource::Buffer(buffer) => {
                let write = if desc.dimension == ViewDimension::AccelerationStructure {
                    let accel = objects
                        .accels
                        .values()
                        .find(|a| a.buffer == buffer.0)
                        .ok_or_else(|| RhiError::InvalidHandle(format!("no acceleration structure in buffer {}", buffer.0)))?;
                    DescriptorWrite::AccelerationStructure(accel.handle)
                } else {
                    let vk_buffer = objects
                        .buffers
                        .get(&buffer.0)
                        .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {}", buffer.0)))?;
                    DescriptorWrite::StorageBuffer {
                        buffer: vk_buffer.buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    }
                };
                descriptors.write(device, slot.index(), write);
                None
            }
        };

        let id = self.shared.next_id();
        objects.views.insert(
            id,
            VkView {
                image_view,
                resource: desc.resource,
                base_mip: desc.base_mip,
            },
        );
        Ok(RawView(id))
    }

    fn destroy_view(&self, view: RawView) {
        if let Some(image_view) = self.with_object(|o| o.views.remove(&view.0)).and_then(|v| v.image_view) {
            self.shared.retire(Garbage::ImageView(image_view));
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc, slot: &DescriptorHandle) -> RhiResult<RawSampler> {
        let device = self.shared.device.handle();
        let sampler = resources::create_sampler(device, desc)?;
        self.shared
            .descriptors
            .write(device, slot.index(), DescriptorWrite::Sampler(sampler));
        let id = self.shared.next_id();
        self.shared.objects()?.samplers.insert(id, sampler);
        Ok(RawSampler(id))
    }

    fn destroy_sampler(&self, sampler: RawSampler) {
        if let Some(sampler) = self.with_object(|o| o.samplers.remove(&sampler.0)) {
            self.shared.retire(Garbage::Sampler(sampler));
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<RawPipeline> {
        let pipeline = pipeline::create_pipeline(
            self.shared.device.handle(),
            self.shared.descriptors.pipeline_layout(),
            desc,
        )?;
        let id = self.shared.next_id();
        self.shared.objects()?.pipelines.insert(id, pipeline);
        Ok(RawPipeline(id))
    }

    fn destroy_pipeline(&self, pipeline: RawPipeline) {
        if let Some(pipeline) = self.with_object(|o| o.pipelines.remove(&pipeline.0)) {
            self.shared.retire(Garbage::Pipeline(pipeline.pipeline));
        }
    }

    fn acceleration_structure_sizes(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> RhiResult<AccelerationStructureSizes> {
        let loader = self
            .shared
            .device
            .acceleration()
            .ok_or_else(|| RhiError::Unsupported("acceleration structures on this adapter".into()))?;
        Ok(acceleration::build_sizes(loader, inputs))
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        result: RawBuffer,
        size: u64,
    ) -> RhiResult<RawAccelerationStructure> {
        let loader = self
            .shared
            .device
            .acceleration()
            .ok_or_else(|| RhiError::Unsupported("acceleration structures on this adapter".into()))?;
        let mut objects = self.shared.objects()?;
        let buffer = objects
            .buffers
            .get(&result.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {}", result.0)))?
            .buffer;
        let accel = acceleration::create(loader, kind, buffer, result.0, size)?;
        let id = self.shared.next_id();
        objects.accels.insert(id, accel);
        Ok(RawAccelerationStructure(id))
    }

    fn acceleration_structure_address(&self, accel: RawAccelerationStructure) -> u64 {
        self.with_object(|o| o.accels.get(&accel.0).map(|a| a.address))
            .unwrap_or(0)
    }

    fn destroy_acceleration_structure(&self, accel: RawAccelerationStructure) {
        if let Some(accel) = self.with_object(|o| o.accels.remove(&accel.0)) {
            self.shared.retire(Garbage::AccelerationStructure(accel.handle));
        }
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<RawFence> {
        let semaphore = sync::create_timeline(self.shared.device.handle(), initial_value)?;
        let id = self.shared.next_id();
        self.shared.objects()?.fences.insert(id, semaphore);
        Ok(RawFence(id))
    }

    fn destroy_fence(&self, fence: RawFence) {
        if let Some(semaphore) = self.with_object(|o| o.fences.remove(&fence.0)) {
            self.shared.retire(Garbage::Semaphore(semaphore));
        }
    }

    fn fence_completed_value(&self, fence: RawFence) -> RhiResult<u64> {
        let semaphore = self.fence(fence)?;
        sync::timeline_value(self.shared.device.handle(), semaphore)
    }

    fn wait_fence(&self, fence: RawFence, value: u64, timeout: Duration) -> RhiResult<()> {
        let semaphore = self.fence(fence)?;
        sync::wait_timeline(self.shared.device.handle(), semaphore, value, timeout)
    }

    fn create_command_list(&self, queue: QueueKind, name: &str) -> RhiResult<RawCommandList> {
        let list = VkCommandList::new(
            self.shared.device.handle(),
            self.shared.device.queue_family(),
            queue,
            name,
        )?;
        let id = self.shared.next_id();
        self.shared.objects()?.lists.insert(id, list);
        Ok(RawCommandList(id))
    }

    fn destroy_command_list(&self, list: RawCommandList) {
        if let Some(list) = self.with_object(|o| o.lists.remove(&list.0)) {
            self.shared.retire(Garbage::CommandPool(list.pool));
        }
    }

    fn reset_command_list(&self, list: RawCommandList) -> RhiResult<()> {
        let objects = self.shared.objects()?;
        objects
            .lists
            .get(&list.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("command list {}", list.0)))?
            .reset(self.shared.device.handle())
    }

    fn encode_command_list(&self, list: RawCommandList, commands: &[Command]) -> RhiResult<()> {
        let ctx = EncodeContext {
            device: &self.shared.device,
            pipeline_layout: self.shared.descriptors.pipeline_layout(),
            descriptor_set: self.shared.descriptors.set(),
            labels: self.shared.labels.as_ref(),
        };
        let mut objects = self.shared.objects()?;
        // Taken out so the encoder can borrow the rest of the table mutably.
        let vk_list = objects
            .lists
            .remove(&list.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("command list {}", list.0)))?;
        let result = encoder::encode(&ctx, &mut objects, &vk_list, commands);
        objects.lists.insert(list.0, vk_list);
        result
    }

    fn submit(&self, queue: QueueKind, lists: &[RawCommandList]) -> RhiResult<()> {
        let command_buffers = {
            let objects = self.shared.objects()?;
            lists
                .iter()
                .map(|list| {
                    let vk_list = objects
                        .lists
                        .get(&list.0)
                        .ok_or_else(|| RhiError::InvalidHandle(format!("command list {}", list.0)))?;
                    if vk_list.queue != queue {
                        return Err(RhiError::contract(format!(
                            "{:?} list '{}' submitted to the {:?} queue",
                            vk_list.queue, vk_list.name, queue
                        )));
                    }
                    Ok(vk::CommandBufferSubmitInfo::default().command_buffer(vk_list.buffer))
                })
                .collect::<RhiResult<Vec<_>>>()?
        };
        let mut submissions = self.shared.submissions()?;
        self.shared.queue_submit(&mut submissions, &command_buffers, &[])?;
        debug!(
            "Submitted {} list(s) to {:?} as submission {}",
            lists.len(),
            queue,
            submissions.submitted
        );
        Ok(())
    }

    fn signal_fence(&self, _queue: QueueKind, fence: RawFence, value: u64) -> RhiResult<()> {
        let semaphore = self.fence(fence)?;
        let signal = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let mut submissions = self.shared.submissions()?;
        self.shared.queue_submit(&mut submissions, &[], &signal)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.shared.wait_idle()
    }

    fn create_swapchain(&self, target: &SurfaceTarget, desc: &SwapchainDesc) -> RhiResult<Box<dyn RawSwapchain>> {
        match target {
            SurfaceTarget::Offscreen => Ok(Box::new(swapchain::OffscreenSwapchain::new(
                Arc::clone(&self.shared),
                desc,
            )?)),
            SurfaceTarget::Vulkan(surface) => {
                if self.shared.surface != Some(*surface) {
                    return Err(RhiError::SurfaceError(
                        "surface was not created through this backend".into(),
                    ));
                }
                Ok(Box::new(swapchain::VulkanSwapchain::new(
                    Arc::clone(&self.shared),
                    *surface,
                    desc,
                )?))
            }
        }
    }
}

impl VulkanBackend {
    fn fence(&self, fence: RawFence) -> RhiResult<vk::Semaphore> {
        self.shared
            .objects()?
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("fence {}", fence.0)))
    }
}

/// Formats a backbuffer may use.
pub fn is_presentable_format(format: Format) -> bool {
    matches!(
        format,
        Format::Bgra8Srgb | Format::Bgra8Unorm | Format::Rgba8Srgb | Format::Rgba8Unorm | Format::Rgba16Float
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VulkanBackend>();
    }

    #[test]
    fn test_presentable_formats_round_trip_through_vk() {
        for format in [Format::Bgra8Srgb, Format::Bgra8Unorm, Format::Rgba8Srgb, Format::Rgba16Float] {
            assert!(is_presentable_format(format));
            assert_eq!(conv::format_from_vk(conv::format(format)), format);
        }
        assert!(!is_presentable_format(Format::D32Float));
    }

    #[test]
    fn test_headless_backend() {
        let backend = match VulkanBackend::new(&VulkanConfig {
            validation: false,
            ..Default::default()
        }) {
            Ok(backend) => backend,
            Err(RhiError::LoadingError(_) | RhiError::NoSuitableGpu) => {
                eprintln!("Skipping: no Vulkan 1.3 device");
                return;
            }
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(backend.adapter_info().backend, "vulkan");
        let fence = backend.create_fence(0).unwrap();
        backend.signal_fence(QueueKind::Graphics, fence, 3).unwrap();
        backend
            .wait_fence(fence, 3, Duration::from_secs(5))
            .unwrap();
        assert!(backend.fence_completed_value(fence).unwrap() >= 3);
        backend.destroy_fence(fence);
        backend.wait_idle().unwrap();
        assert_eq!(backend.pending_destructions(), 0);
    }
}
