//! GPU buffers and textures.
//!
//! Both kinds implement [`Resource`]: a byte size, a stride, a debug name,
//! tags, and the one current [`AccessState`] the command recorder consults
//! before inserting barriers. Resources start in [`AccessState::Common`]
//! (presentation backbuffers start in [`AccessState::Present`]).
//!
//! Host-visible buffers are written through a scoped [`BufferMapping`]
//! that unmaps on every exit path.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keel_rhi::device::Device;
//! use keel_rhi::resource::BufferKind;
//!
//! # fn example(device: Arc<Device>) -> Result<(), keel_rhi::RhiError> {
//! let staging = device.create_buffer(64, 0, BufferKind::Staging, "staging")?;
//! staging.write(0, &[0xAB; 64])?;
//! # Ok(())
//! # }
//! ```

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::backend::{RawBuffer, RawResource, RawTexture};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::format::Format;
use crate::state::{AccessState, StateCell};

bitflags! {
    /// Categories a resource belongs to, for statistics and debugging.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceTags: u32 {
        const MODEL_GEOMETRY = 1 << 0;
        const MODEL_TEXTURE = 1 << 1;
        const SHADER_PASS_IO = 1 << 2;
        const SHADER_PASS_RESOURCE = 1 << 3;
        const GPU_READBACK = 1 << 4;
    }
}

bitflags! {
    /// Ways a texture may be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SHADER_READ = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_TARGET = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
    }
}

/// Common interface of buffers and textures.
pub trait Resource: Send + Sync {
    /// Debug name.
    fn name(&self) -> &str;
    /// Size in bytes.
    fn size(&self) -> u64;
    /// Element stride in bytes, 0 if untyped.
    fn stride(&self) -> u32;
    /// Current access state.
    fn state(&self) -> AccessState;
    /// Tags attached to the resource.
    fn tags(&self) -> ResourceTags;
    /// Adds tags.
    fn add_tags(&self, tags: ResourceTags);
}

/// Intended use of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Vertex data, also readable through shader views
    Vertex,
    /// Index data
    Index,
    /// Constants updated from the CPU every frame
    Constant,
    /// General-purpose GPU storage
    Storage,
    /// CPU-writable upload memory
    Staging,
    /// CPU-readable download memory
    Readback,
    /// Acceleration structure storage
    AccelerationStructure,
    /// Acceleration structure build scratch
    Scratch,
}

impl BufferKind {
    /// Returns true if the CPU can map the buffer.
    pub fn is_host_visible(self) -> bool {
        matches!(
            self,
            BufferKind::Constant | BufferKind::Staging | BufferKind::Readback
        )
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferKind::Vertex => "vertex",
            BufferKind::Index => "index",
            BufferKind::Constant => "constant",
            BufferKind::Storage => "storage",
            BufferKind::Staging => "staging",
            BufferKind::Readback => "readback",
            BufferKind::AccelerationStructure => "acceleration structure",
            BufferKind::Scratch => "scratch",
        }
    }
}

/// Creation parameters of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub stride: u32,
    pub kind: BufferKind,
}

/// GPU buffer.
pub struct Buffer {
    device: Arc<Device>,
    raw: RawBuffer,
    desc: BufferDesc,
    state: StateCell,
    tags: AtomicU32,
    mapped: AtomicBool,
}

impl Buffer {
    /// Creates a buffer. Prefer [`Device::create_buffer`].
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ContractViolation`] for a zero size, or the
    /// backend's allocation error.
    pub fn new(device: &Arc<Device>, desc: BufferDesc) -> RhiResult<Arc<Self>> {
        if desc.size == 0 {
            return Err(RhiError::contract(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }
        if desc.stride > 0 && desc.size % u64::from(desc.stride) != 0 {
            warn!(
                "Buffer '{}' size {} is not a multiple of stride {}",
                desc.name, desc.size, desc.stride
            );
        }

        let raw = device.backend().create_buffer(&desc)?;
        device.memory().add_buffer(desc.size);

        debug!(
            "Created {} buffer '{}' ({} bytes)",
            desc.kind.name(),
            desc.name,
            desc.size
        );

        Ok(Arc::new(Self {
            device: Arc::clone(device),
            raw,
            desc,
            state: StateCell::new(AccessState::Common),
            tags: AtomicU32::new(0),
            mapped: AtomicBool::new(false),
        }))
    }

    /// Returns the buffer kind.
    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.desc.kind
    }

    /// Returns the creation parameters.
    #[inline]
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Returns the backend handle.
    #[inline]
    pub fn raw(&self) -> RawBuffer {
        self.raw
    }

    /// Maps the buffer for CPU access.
    ///
    /// The mapping is released when the returned guard drops.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ContractViolation`] if the buffer is GPU-only or
    /// already mapped.
    pub fn map(&self) -> RhiResult<BufferMapping<'_>> {
        if !self.desc.kind.is_host_visible() {
            return Err(RhiError::contract(format!(
                "cannot map {} buffer '{}'",
                self.desc.kind.name(),
                self.desc.name
            )));
        }
        if self
            .mapped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RhiError::contract(format!(
                "buffer '{}' is already mapped",
                self.desc.name
            )));
        }

        match self.device.backend().map_buffer(self.raw) {
            Ok(ptr) => Ok(BufferMapping {
                buffer: self,
                ptr,
                len: self.desc.size as usize,
            }),
            Err(e) => {
                self.mapped.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Copies `data` into the buffer at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be mapped or the range is out of bounds.
    pub fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.check_range(offset, data.len() as u64)?;
        let mut mapping = self.map()?;
        let start = offset as usize;
        mapping.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copies a typed slice into the buffer at `offset`.
    pub fn write_slice<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> RhiResult<()> {
        self.write(offset, bytemuck::cast_slice(data))
    }

    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be mapped or the range is out of bounds.
    pub fn read(&self, offset: u64, len: u64) -> RhiResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let mapping = self.map()?;
        let start = offset as usize;
        Ok(mapping.as_slice()[start..start + len as usize].to_vec())
    }

    fn check_range(&self, offset: u64, len: u64) -> RhiResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.desc.size => Ok(()),
            _ => Err(RhiError::contract(format!(
                "range {}+{} exceeds buffer '{}' of {} bytes",
                offset, len, self.desc.name, self.desc.size
            ))),
        }
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }
}

impl Resource for Buffer {
    fn name(&self) -> &str {
        &self.desc.name
    }

    fn size(&self) -> u64 {
        self.desc.size
    }

    fn stride(&self) -> u32 {
        self.desc.stride
    }

    fn state(&self) -> AccessState {
        self.state.get()
    }

    fn tags(&self) -> ResourceTags {
        ResourceTags::from_bits_truncate(self.tags.load(Ordering::Relaxed))
    }

    fn add_tags(&self, tags: ResourceTags) {
        self.tags.fetch_or(tags.bits(), Ordering::Relaxed);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.backend().destroy_buffer(self.raw);
        self.device.memory().remove_buffer(self.desc.size);
        debug!("Destroyed buffer '{}'", self.desc.name);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.desc.name)
            .field("kind", &self.desc.kind)
            .field("size", &self.desc.size)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Scoped CPU mapping of a host-visible buffer.
pub struct BufferMapping<'a> {
    buffer: &'a Buffer,
    ptr: NonNull<u8>,
    len: usize,
}

impl BufferMapping<'_> {
    /// Mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the backend keeps `len` bytes mapped at `ptr` until unmap,
        // and the `mapped` flag guarantees this guard is the only accessor.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mapped bytes, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` makes the borrow unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for BufferMapping<'_> {
    fn drop(&mut self) {
        self.buffer.device.backend().unmap_buffer(self.buffer.raw);
        self.buffer.mapped.store(false, Ordering::Release);
    }
}

/// Creation parameters of a 2D texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: Format,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// A single-mip, sampleable, copyable texture.
    pub fn new(name: impl Into<String>, width: u32, height: u32, format: Format) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            mip_levels: 1,
            format,
            usage: TextureUsage::SHADER_READ | TextureUsage::COPY_SRC | TextureUsage::COPY_DST,
        }
    }

    /// Sets the mip count.
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Replaces the usage flags.
    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Number of mips in a full chain for this extent.
    pub fn max_mip_levels(&self) -> u32 {
        32 - self.width.max(self.height).max(1).leading_zeros()
    }

    /// Checks the description is creatable.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ContractViolation`] naming the first problem.
    pub fn validate(&self) -> RhiResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RhiError::contract(format!(
                "texture '{}' has zero extent {}x{}",
                self.name, self.width, self.height
            )));
        }
        if self.format == Format::Unknown {
            return Err(RhiError::contract(format!(
                "texture '{}' has no format",
                self.name
            )));
        }
        if self.mip_levels == 0 || self.mip_levels > self.max_mip_levels() {
            return Err(RhiError::contract(format!(
                "texture '{}' requests {} mips, at most {} fit",
                self.name,
                self.mip_levels,
                self.max_mip_levels()
            )));
        }
        if self.usage.contains(TextureUsage::DEPTH_TARGET) != self.format.is_depth() {
            return Err(RhiError::contract(format!(
                "texture '{}': depth usage requires a depth format and vice versa",
                self.name
            )));
        }
        if self.usage.contains(TextureUsage::RENDER_TARGET) && self.format.is_depth() {
            return Err(RhiError::contract(format!(
                "texture '{}': depth format cannot be a render target",
                self.name
            )));
        }
        Ok(())
    }
}

/// GPU texture.
pub struct Texture {
    device: Arc<Device>,
    raw: RawTexture,
    desc: TextureDesc,
    size: u64,
    state: StateCell,
    tags: AtomicU32,
    external: bool,
}

impl Texture {
    /// Creates a texture. Prefer [`Device::create_texture`].
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ContractViolation`] for an invalid description, or
    /// the backend's allocation error.
    pub fn new(device: &Arc<Device>, desc: TextureDesc) -> RhiResult<Arc<Self>> {
        desc.validate()?;
        let (raw, size) = device.backend().create_texture(&desc)?;
        device.memory().add_texture(size);

        debug!(
            "Created texture '{}' {}x{} {:?} ({} mips, {} bytes)",
            desc.name, desc.width, desc.height, desc.format, desc.mip_levels, size
        );

        Ok(Arc::new(Self {
            device: Arc::clone(device),
            raw,
            desc,
            size,
            state: StateCell::new(AccessState::Common),
            tags: AtomicU32::new(0),
            external: false,
        }))
    }

    /// Wraps a texture owned by a presentation engine.
    pub(crate) fn from_external(
        device: &Arc<Device>,
        raw: RawTexture,
        desc: TextureDesc,
        initial: AccessState,
    ) -> Arc<Self> {
        let size = u64::from(desc.width) * u64::from(desc.height) * u64::from(desc.format.bytes_per_texel());
        Arc::new(Self {
            device: Arc::clone(device),
            raw,
            desc,
            size,
            state: StateCell::new(initial),
            tags: AtomicU32::new(ResourceTags::SHADER_PASS_IO.bits()),
            external: true,
        })
    }

    /// Returns the creation parameters.
    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.desc.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.desc.height
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.desc.format
    }

    /// Returns the backend handle.
    #[inline]
    pub fn raw(&self) -> RawTexture {
        self.raw
    }

    /// Returns true if the texture belongs to a presentation engine.
    #[inline]
    pub fn is_external(&self) -> bool {
        self.external
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }
}

impl Resource for Texture {
    fn name(&self) -> &str {
        &self.desc.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn stride(&self) -> u32 {
        self.desc.format.bytes_per_texel()
    }

    fn state(&self) -> AccessState {
        self.state.get()
    }

    fn tags(&self) -> ResourceTags {
        ResourceTags::from_bits_truncate(self.tags.load(Ordering::Relaxed))
    }

    fn add_tags(&self, tags: ResourceTags) {
        self.tags.fetch_or(tags.bits(), Ordering::Relaxed);
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if self.external {
            return;
        }
        self.device.backend().destroy_texture(self.raw);
        self.device.memory().remove_texture(self.size);
        debug!("Destroyed texture '{}'", self.desc.name);
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("name", &self.desc.name)
            .field("extent", &(self.desc.width, self.desc.height))
            .field("format", &self.desc.format)
            .field("state", &self.state.get())
            .finish()
    }
}

/// A shared reference to either kind of resource.
#[derive(Debug, Clone)]
pub enum ResourceRef {
    Buffer(Arc<Buffer>),
    Texture(Arc<Texture>),
}

impl ResourceRef {
    /// Returns the resource through its common interface.
    pub fn as_resource(&self) -> &dyn Resource {
        match self {
            ResourceRef::Buffer(buffer) => buffer.as_ref(),
            ResourceRef::Texture(texture) => texture.as_ref(),
        }
    }

    /// Returns the backend handle.
    pub fn raw(&self) -> RawResource {
        match self {
            ResourceRef::Buffer(buffer) => RawResource::Buffer(buffer.raw()),
            ResourceRef::Texture(texture) => RawResource::Texture(texture.raw()),
        }
    }

    /// Current access state.
    pub fn state(&self) -> AccessState {
        self.state_cell().get()
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        match self {
            ResourceRef::Buffer(buffer) => buffer.state_cell(),
            ResourceRef::Texture(texture) => texture.state_cell(),
        }
    }
}

impl From<&Arc<Buffer>> for ResourceRef {
    fn from(buffer: &Arc<Buffer>) -> Self {
        ResourceRef::Buffer(Arc::clone(buffer))
    }
}

impl From<Arc<Buffer>> for ResourceRef {
    fn from(buffer: Arc<Buffer>) -> Self {
        ResourceRef::Buffer(buffer)
    }
}

impl From<&Arc<Texture>> for ResourceRef {
    fn from(texture: &Arc<Texture>) -> Self {
        ResourceRef::Texture(Arc::clone(texture))
    }
}

impl From<Arc<Texture>> for ResourceRef {
    fn from(texture: Arc<Texture>) -> Self {
        ResourceRef::Texture(texture)
    }
}

impl From<&ResourceRef> for ResourceRef {
    fn from(resource: &ResourceRef) -> Self {
        resource.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_visibility() {
        assert!(BufferKind::Staging.is_host_visible());
        assert!(BufferKind::Readback.is_host_visible());
        assert!(BufferKind::Constant.is_host_visible());
        assert!(!BufferKind::Storage.is_host_visible());
        assert!(!BufferKind::Vertex.is_host_visible());
        assert!(!BufferKind::Scratch.is_host_visible());
    }

    #[test]
    fn test_max_mip_levels() {
        assert_eq!(TextureDesc::new("t", 1, 1, Format::R8Unorm).max_mip_levels(), 1);
        assert_eq!(TextureDesc::new("t", 256, 16, Format::R8Unorm).max_mip_levels(), 9);
        assert_eq!(TextureDesc::new("t", 3, 5, Format::R8Unorm).max_mip_levels(), 3);
    }

    #[test]
    fn test_texture_desc_validation() {
        assert!(TextureDesc::new("ok", 4, 4, Format::Rgba8Unorm).validate().is_ok());
        assert!(TextureDesc::new("empty", 0, 4, Format::Rgba8Unorm).validate().is_err());
        assert!(TextureDesc::new("unknown", 4, 4, Format::Unknown).validate().is_err());
        assert!(
            TextureDesc::new("mips", 4, 4, Format::Rgba8Unorm)
                .with_mip_levels(4)
                .validate()
                .is_err()
        );
        assert!(
            TextureDesc::new("depth", 4, 4, Format::D32Float)
                .with_usage(TextureUsage::DEPTH_TARGET)
                .validate()
                .is_ok()
        );
        assert!(
            TextureDesc::new("depth as color", 4, 4, Format::D32Float)
                .with_usage(TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_TARGET)
                .validate()
                .is_err()
        );
        assert!(
            TextureDesc::new("color as depth", 4, 4, Format::Rgba8Unorm)
                .with_usage(TextureUsage::DEPTH_TARGET)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_tags_combine() {
        let tags = ResourceTags::MODEL_GEOMETRY | ResourceTags::GPU_READBACK;
        assert!(tags.contains(ResourceTags::GPU_READBACK));
        assert!(!tags.contains(ResourceTags::MODEL_TEXTURE));
    }
}
