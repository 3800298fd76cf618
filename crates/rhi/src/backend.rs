//! The seam between the resource core and a GPU API.
//!
//! Everything above this trait (heaps, resources, views, recorders, fences,
//! queues, surfaces) is API-independent and owns the policy: state tracking,
//! barrier elision, lifetime, pacing. A [`Backend`] only turns already-validated
//! requests into API objects, addressed by plain integer handles.

use std::ptr::NonNull;
use std::time::Duration;

use crate::acceleration::{AccelerationStructureInputs, AccelerationStructureKind, AccelerationStructureSizes};
use crate::command::Command;
use crate::descriptor::{DescriptorHandle, DescriptorHeapKind};
use crate::error::RhiResult;
use crate::footprint::CopyAlignment;
use crate::format::Format;
use crate::pipeline::PipelineDesc;
use crate::queue::QueueKind;
use crate::resource::{BufferDesc, TextureDesc};
use crate::surface::{RawSwapchain, SurfaceTarget, SwapchainDesc};
use crate::view::{SamplerDesc, ViewDimension, ViewKind};

macro_rules! raw_handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

raw_handles!(
    /// Backend buffer id.
    RawBuffer,
    /// Backend texture id.
    RawTexture,
    /// Backend view id.
    RawView,
    /// Backend sampler id.
    RawSampler,
    /// Backend pipeline id.
    RawPipeline,
    /// Backend acceleration structure id.
    RawAccelerationStructure,
    /// Backend timeline fence id.
    RawFence,
    /// Backend command list id.
    RawCommandList,
);

/// A backend resource of either kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawResource {
    Buffer(RawBuffer),
    Texture(RawTexture),
}

/// Where a descriptor heap lives, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    /// Number of slots actually available (may be clamped by device limits).
    pub capacity: u32,
    /// CPU address of slot 0.
    pub cpu_base: u64,
    /// GPU address of slot 0, for shader-visible heaps.
    pub gpu_base: Option<u64>,
    /// Distance between consecutive slots.
    pub increment: u64,
}

/// Fully resolved view request handed to [`Backend::create_view`].
#[derive(Debug, Clone, Copy)]
pub struct RawViewDesc {
    pub resource: RawResource,
    pub kind: ViewKind,
    pub dimension: ViewDimension,
    /// Resolved format (never `Unknown` for textures).
    pub format: Format,
    /// First mip visible through the view.
    pub base_mip: u32,
    /// Number of mips visible through the view.
    pub mip_count: u32,
    /// Element count for buffer views.
    pub element_count: u64,
    /// Element stride for buffer views; 0 for raw views.
    pub stride: u32,
}

/// Description of the adapter a backend runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub backend: &'static str,
    pub device_type: &'static str,
    /// Device-local memory in bytes.
    pub dedicated_memory: u64,
    pub ray_tracing: bool,
}

/// An API implementation the core can drive.
///
/// Handles passed in are always ones this backend returned and has not yet
/// destroyed; the core guarantees every `create_*` is paired with exactly one
/// `destroy_*`.
pub trait Backend: Send + Sync {
    /// Describes the adapter chosen at construction.
    fn adapter_info(&self) -> AdapterInfo;

    /// Alignment rules for buffer/texture copies.
    fn copy_alignment(&self) -> CopyAlignment;

    /// Creates storage for a descriptor heap.
    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> RhiResult<DescriptorHeapInfo>;

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<RawBuffer>;
    fn destroy_buffer(&self, buffer: RawBuffer);

    /// Maps a host-visible buffer. The pointer stays valid until `unmap_buffer`.
    fn map_buffer(&self, buffer: RawBuffer) -> RhiResult<NonNull<u8>>;
    fn unmap_buffer(&self, buffer: RawBuffer);

    /// Creates a texture and returns it with its allocation size in bytes.
    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<(RawTexture, u64)>;
    fn destroy_texture(&self, texture: RawTexture);

    /// Creates a view and writes it into `slot`.
    fn create_view(&self, desc: &RawViewDesc, slot: &DescriptorHandle) -> RhiResult<RawView>;
    fn destroy_view(&self, view: RawView);

    fn create_sampler(&self, desc: &SamplerDesc, slot: &DescriptorHandle) -> RhiResult<RawSampler>;
    fn destroy_sampler(&self, sampler: RawSampler);

    fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<RawPipeline>;
    fn destroy_pipeline(&self, pipeline: RawPipeline);

    /// Result and scratch sizes needed to build an acceleration structure.
    fn acceleration_structure_sizes(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> RhiResult<AccelerationStructureSizes>;
    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        result: RawBuffer,
        size: u64,
    ) -> RhiResult<RawAccelerationStructure>;
    /// GPU address used to reference a bottom-level structure from instances.
    fn acceleration_structure_address(&self, accel: RawAccelerationStructure) -> u64;
    fn destroy_acceleration_structure(&self, accel: RawAccelerationStructure);

    fn create_fence(&self, initial_value: u64) -> RhiResult<RawFence>;
    fn destroy_fence(&self, fence: RawFence);
    fn fence_completed_value(&self, fence: RawFence) -> RhiResult<u64>;
    /// Blocks until the fence reaches `value` or `timeout` elapses.
    fn wait_fence(&self, fence: RawFence, value: u64, timeout: Duration) -> RhiResult<()>;

    fn create_command_list(&self, queue: QueueKind, name: &str) -> RhiResult<RawCommandList>;
    fn destroy_command_list(&self, list: RawCommandList);
    fn reset_command_list(&self, list: RawCommandList) -> RhiResult<()>;
    /// Translates recorded commands into the command list.
    fn encode_command_list(&self, list: RawCommandList, commands: &[Command]) -> RhiResult<()>;

    /// Appends command lists to the queue's timeline in order.
    fn submit(&self, queue: QueueKind, lists: &[RawCommandList]) -> RhiResult<()>;
    /// Advances `fence` to `value` once prior work on `queue` completes.
    fn signal_fence(&self, queue: QueueKind, fence: RawFence, value: u64) -> RhiResult<()>;
    /// Blocks until all submitted work has finished.
    fn wait_idle(&self) -> RhiResult<()>;

    fn create_swapchain(
        &self,
        target: &SurfaceTarget,
        desc: &SwapchainDesc,
    ) -> RhiResult<Box<dyn RawSwapchain>>;
}
