//! Typed descriptors bound to resources, and samplers.
//!
//! A [`View`] exclusively owns one descriptor slot and holds its resource
//! through an `Arc`. Creating a view never changes the resource's access
//! state. Dropping the view destroys the backend object and then returns
//! the slot to its heap.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{RawSampler, RawView, RawViewDesc};
use crate::descriptor::{DescriptorHandle, DescriptorHeapKind};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::format::Format;
use crate::resource::{BufferKind, Resource, ResourceRef, TextureUsage};

/// What a view lets the GPU do with its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    ShaderRead,
    UnorderedAccess,
    RenderTarget,
    DepthTarget,
}

impl ViewKind {
    /// The heap this kind of view lives in.
    pub fn heap(self) -> DescriptorHeapKind {
        match self {
            ViewKind::ShaderRead | ViewKind::UnorderedAccess => DescriptorHeapKind::ShaderResource,
            ViewKind::RenderTarget => DescriptorHeapKind::RenderTarget,
            ViewKind::DepthTarget => DescriptorHeapKind::DepthTarget,
        }
    }
}

/// How the view interprets its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDimension {
    Buffer,
    Texture2D,
    AccelerationStructure,
}

/// View creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewDesc {
    pub kind: ViewKind,
    pub dimension: ViewDimension,
    /// `Format::Unknown` uses the resource's format.
    pub format: Format,
    /// `None` exposes every mip (shader reads only).
    pub mip: Option<u32>,
    /// Array slice; textures are single-layer so this must be 0.
    pub slice: u32,
}

impl ViewDesc {
    pub fn new(kind: ViewKind, dimension: ViewDimension) -> Self {
        Self {
            kind,
            dimension,
            format: Format::Unknown,
            mip: None,
            slice: 0,
        }
    }

    pub fn shader_read(dimension: ViewDimension) -> Self {
        Self::new(ViewKind::ShaderRead, dimension)
    }

    pub fn unordered_access(dimension: ViewDimension) -> Self {
        Self::new(ViewKind::UnorderedAccess, dimension)
    }

    pub fn render_target() -> Self {
        Self::new(ViewKind::RenderTarget, ViewDimension::Texture2D)
    }

    pub fn depth_target() -> Self {
        Self::new(ViewKind::DepthTarget, ViewDimension::Texture2D)
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_mip(mut self, mip: u32) -> Self {
        self.mip = Some(mip);
        self
    }

    pub fn with_slice(mut self, slice: u32) -> Self {
        self.slice = slice;
        self
    }
}

/// A typed descriptor over a resource.
pub struct View {
    device: Arc<Device>,
    resource: ResourceRef,
    raw: RawView,
    desc: ViewDesc,
    format: Format,
    // Dropped after `raw` is destroyed in `Drop::drop`.
    handle: DescriptorHandle,
}

impl View {
    /// Creates a view. Prefer [`Device::create_view`].
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ContractViolation`] when the view does not fit
    /// the resource, [`RhiError::ResourceExhausted`] when the heap is full.
    pub fn new(device: &Arc<Device>, resource: ResourceRef, desc: ViewDesc) -> RhiResult<Arc<Self>> {
        let raw_desc = resolve(&resource, &desc)?;
        let handle = device.heap(desc.kind.heap()).allocate()?;
        let raw = device.backend().create_view(&raw_desc, &handle)?;

        debug!(
            "Created {:?} view of '{}' at {} index {}",
            desc.kind,
            resource.as_resource().name(),
            handle.heap_kind().name(),
            handle.index()
        );

        Ok(Arc::new(Self {
            device: Arc::clone(device),
            resource,
            raw,
            desc,
            format: raw_desc.format,
            handle,
        }))
    }

    /// The viewed resource.
    #[inline]
    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    /// The owned descriptor slot.
    #[inline]
    pub fn descriptor(&self) -> &DescriptorHandle {
        &self.handle
    }

    /// Bindless index of the view inside its heap.
    #[inline]
    pub fn index(&self) -> u32 {
        self.handle.index()
    }

    #[inline]
    pub fn kind(&self) -> ViewKind {
        self.desc.kind
    }

    #[inline]
    pub fn dimension(&self) -> ViewDimension {
        self.desc.dimension
    }

    /// Resolved format.
    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    #[inline]
    pub fn mip(&self) -> Option<u32> {
        self.desc.mip
    }

    #[inline]
    pub fn raw(&self) -> RawView {
        self.raw
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.device.backend().destroy_view(self.raw);
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("resource", &self.resource.as_resource().name())
            .field("kind", &self.desc.kind)
            .field("index", &self.handle.index())
            .finish()
    }
}

/// Checks `desc` against `resource` and fills in everything the backend needs.
fn resolve(resource: &ResourceRef, desc: &ViewDesc) -> RhiResult<RawViewDesc> {
    let name = resource.as_resource().name();
    if desc.slice != 0 {
        return Err(RhiError::contract(format!(
            "view of '{}' requests slice {} of a single-layer resource",
            name, desc.slice
        )));
    }

    match resource {
        ResourceRef::Buffer(buffer) => {
            if matches!(desc.kind, ViewKind::RenderTarget | ViewKind::DepthTarget) {
                return Err(RhiError::contract(format!(
                    "buffer '{}' cannot be a {:?}",
                    name, desc.kind
                )));
            }
            match desc.dimension {
                ViewDimension::Buffer => {}
                ViewDimension::AccelerationStructure => {
                    if buffer.kind() != BufferKind::AccelerationStructure
                        || desc.kind != ViewKind::ShaderRead
                    {
                        return Err(RhiError::contract(format!(
                            "acceleration structure view needs a shader-read view of an acceleration structure buffer, got '{}'",
                            name
                        )));
                    }
                }
                ViewDimension::Texture2D => {
                    return Err(RhiError::contract(format!(
                        "buffer '{}' viewed as a texture",
                        name
                    )));
                }
            }
            if desc.kind == ViewKind::UnorderedAccess && buffer.kind() != BufferKind::Storage {
                return Err(RhiError::contract(format!(
                    "unordered access needs a storage buffer, '{}' is {}",
                    name,
                    buffer.kind().name()
                )));
            }

            let stride = buffer.stride();
            let element_count = if stride > 0 {
                buffer.size() / u64::from(stride)
            } else {
                buffer.size() / 4
            };

            Ok(RawViewDesc {
                resource: resource.raw(),
                kind: desc.kind,
                dimension: desc.dimension,
                format: desc.format,
                base_mip: 0,
                mip_count: 1,
                element_count,
                stride,
            })
        }
        ResourceRef::Texture(texture) => {
            if desc.dimension != ViewDimension::Texture2D {
                return Err(RhiError::contract(format!(
                    "texture '{}' viewed as {:?}",
                    name, desc.dimension
                )));
            }
            let tex = texture.desc();
            let required = match desc.kind {
                ViewKind::ShaderRead => TextureUsage::SHADER_READ,
                ViewKind::UnorderedAccess => TextureUsage::STORAGE,
                ViewKind::RenderTarget => TextureUsage::RENDER_TARGET,
                ViewKind::DepthTarget => TextureUsage::DEPTH_TARGET,
            };
            if !tex.usage.contains(required) {
                return Err(RhiError::contract(format!(
                    "texture '{}' was not created with {:?} usage",
                    name, required
                )));
            }

            let (base_mip, mip_count) = match (desc.mip, desc.kind) {
                (Some(mip), _) if mip >= tex.mip_levels => {
                    return Err(RhiError::contract(format!(
                        "mip {} out of range for '{}' ({} mips)",
                        mip, name, tex.mip_levels
                    )));
                }
                (Some(mip), _) => (mip, 1),
                (None, ViewKind::ShaderRead) => (0, tex.mip_levels),
                (None, _) => (0, 1),
            };

            let format = desc.format.or(tex.format);
            if format.is_depth() != tex.format.is_depth() {
                return Err(RhiError::contract(format!(
                    "format override {:?} is incompatible with '{}' ({:?})",
                    format, name, tex.format
                )));
            }

            Ok(RawViewDesc {
                resource: resource.raw(),
                kind: desc.kind,
                dimension: desc.dimension,
                format,
                base_mip,
                mip_count,
                element_count: 0,
                stride: 0,
            })
        }
    }
}

/// Texture filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

/// Texture coordinate addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

/// Depth comparison function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    GreaterEqual,
    Always,
}

/// Sampler creation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub mip_filter: Filter,
    pub address: AddressMode,
    pub max_anisotropy: u32,
    /// Comparison sampler for shadow lookups.
    pub compare: Option<CompareOp>,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address: AddressMode::Wrap,
            max_anisotropy: 1,
            compare: None,
            max_lod: 1000.0,
        }
    }
}

/// A sampler occupying one slot of the sampler heap.
pub struct Sampler {
    device: Arc<Device>,
    raw: RawSampler,
    desc: SamplerDesc,
    handle: DescriptorHandle,
}

impl Sampler {
    /// Creates a sampler. Prefer [`Device::create_sampler`].
    pub fn new(device: &Arc<Device>, desc: SamplerDesc) -> RhiResult<Arc<Self>> {
        if desc.max_anisotropy == 0 || desc.max_anisotropy > 16 {
            return Err(RhiError::contract(format!(
                "max_anisotropy must be in 1..=16, got {}",
                desc.max_anisotropy
            )));
        }
        let handle = device.heap(DescriptorHeapKind::Sampler).allocate()?;
        let raw = device.backend().create_sampler(&desc, &handle)?;
        debug!("Created sampler at index {}", handle.index());

        Ok(Arc::new(Self {
            device: Arc::clone(device),
            raw,
            desc,
            handle,
        }))
    }

    /// Bindless index in the sampler heap.
    #[inline]
    pub fn index(&self) -> u32 {
        self.handle.index()
    }

    #[inline]
    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }

    #[inline]
    pub fn raw(&self) -> RawSampler {
        self.raw
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.backend().destroy_sampler(self.raw);
    }
}
