//! Buffers, images, image views and samplers backed by gpu-allocator.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::error::{RhiError, RhiResult};
use crate::format::Format;
use crate::resource::{BufferDesc, BufferKind, TextureDesc, TextureUsage};
use crate::view::{AddressMode, CompareOp, Filter, SamplerDesc};
use crate::vulkan::conv;
use crate::vulkan::device::LogicalDevice;

/// Vulkan usage flags for a buffer kind.
pub(crate) fn buffer_usage(kind: BufferKind, ray_tracing: bool) -> vk::BufferUsageFlags {
    use vk::BufferUsageFlags as U;

    let build_input = if ray_tracing {
        U::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
    } else {
        U::empty()
    };
    let usage = match kind {
        BufferKind::Vertex => U::STORAGE_BUFFER | U::TRANSFER_DST | U::TRANSFER_SRC | build_input,
        BufferKind::Index => {
            U::INDEX_BUFFER | U::STORAGE_BUFFER | U::TRANSFER_DST | U::TRANSFER_SRC | build_input
        }
        BufferKind::Constant => U::UNIFORM_BUFFER | U::STORAGE_BUFFER | U::TRANSFER_DST,
        BufferKind::Storage => U::STORAGE_BUFFER | U::TRANSFER_DST | U::TRANSFER_SRC | build_input,
        BufferKind::Staging => U::TRANSFER_SRC | build_input,
        BufferKind::Readback => U::TRANSFER_DST,
        BufferKind::AccelerationStructure => U::ACCELERATION_STRUCTURE_STORAGE_KHR,
        BufferKind::Scratch => U::STORAGE_BUFFER,
    };
    usage | U::SHADER_DEVICE_ADDRESS
}

/// Where a buffer kind's memory lives.
pub(crate) fn memory_location(kind: BufferKind) -> MemoryLocation {
    match kind {
        BufferKind::Staging | BufferKind::Constant => MemoryLocation::CpuToGpu,
        BufferKind::Readback => MemoryLocation::GpuToCpu,
        _ => MemoryLocation::GpuOnly,
    }
}

pub(crate) fn image_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    for (bit, vk_bit) in [
        (TextureUsage::SHADER_READ, vk::ImageUsageFlags::SAMPLED),
        (TextureUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
        (TextureUsage::RENDER_TARGET, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (TextureUsage::DEPTH_TARGET, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        (TextureUsage::COPY_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (TextureUsage::COPY_DST, vk::ImageUsageFlags::TRANSFER_DST),
    ] {
        if usage.contains(bit) {
            flags |= vk_bit;
        }
    }
    flags
}

pub(crate) struct VkBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub address: u64,
}

pub(crate) struct VkImage {
    pub image: vk::Image,
    /// `None` for swapchain images.
    pub allocation: Option<Allocation>,
    pub format: Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    /// Whether any command has touched the image; the first barrier discards.
    pub initialized: bool,
}

impl VkImage {
    pub(crate) fn external(image: vk::Image, format: Format, extent: vk::Extent2D) -> Self {
        Self {
            image,
            allocation: None,
            format,
            extent,
            mip_levels: 1,
            initialized: false,
        }
    }

    pub(crate) fn aspect(&self) -> vk::ImageAspectFlags {
        conv::aspect(self.format)
    }
}

pub(crate) fn create_buffer(device: &LogicalDevice, desc: &BufferDesc, ray_tracing: bool) -> RhiResult<VkBuffer> {
    let info = vk::BufferCreateInfo::default()
        .size(desc.size)
        .usage(buffer_usage(desc.kind, ray_tracing))
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let raw = device.handle();
    // SAFETY: valid create info; the buffer is destroyed in `destroy_buffer`.
    let buffer = unsafe { raw.create_buffer(&info, None)? };
    // SAFETY: the buffer was just created on this device.
    let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };

    let allocation = device
        .allocator()
        .lock()?
        .allocate(&AllocationCreateDesc {
            name: &desc.name,
            requirements,
            location: memory_location(desc.kind),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            // SAFETY: unbound and unused.
            unsafe { raw.destroy_buffer(buffer, None) };
            return Err(e.into());
        }
    };
    // SAFETY: the allocation satisfies the buffer's requirements.
    unsafe { raw.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())? };

    let address = device.buffer_address(buffer);
    debug!(
        "VkBuffer '{}' {} bytes in {:?}",
        desc.name,
        desc.size,
        memory_location(desc.kind)
    );
    Ok(VkBuffer {
        buffer,
        allocation: Some(allocation),
        size: desc.size,
        address,
    })
}

pub(crate) fn destroy_buffer(device: &LogicalDevice, mut buffer: VkBuffer) {
    if let Some(allocation) = buffer.allocation.take() {
        match device.allocator().lock() {
            Ok(mut allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    error!("Failed to free buffer memory: {}", e);
                }
            }
            Err(_) => error!("Allocator lock poisoned; leaking buffer memory"),
        }
    }
    // SAFETY: the GPU no longer uses the buffer (deferred destruction).
    unsafe { device.handle().destroy_buffer(buffer.buffer, None) };
}

pub(crate) fn create_image(device: &LogicalDevice, desc: &TextureDesc) -> RhiResult<VkImage> {
    let extent = vk::Extent2D {
        width: desc.width,
        height: desc.height,
    };
    let info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(conv::format(desc.format))
        .extent(vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        })
        .mip_levels(desc.mip_levels)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(image_usage(desc.usage))
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let raw = device.handle();
    // SAFETY: valid create info; destroyed in `destroy_image`.
    let image = unsafe { raw.create_image(&info, None)? };
    // SAFETY: the image was just created on this device.
    let requirements = unsafe { raw.get_image_memory_requirements(image) };

    let allocation = device
        .allocator()
        .lock()?
        .allocate(&AllocationCreateDesc {
            name: &desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            // SAFETY: unbound and unused.
            unsafe { raw.destroy_image(image, None) };
            return Err(e.into());
        }
    };
    // SAFETY: the allocation satisfies the image's requirements.
    unsafe { raw.bind_image_memory(image, allocation.memory(), allocation.offset())? };

    Ok(VkImage {
        image,
        allocation: Some(allocation),
        format: desc.format,
        extent,
        mip_levels: desc.mip_levels,
        initialized: false,
    })
}

/// Frees an owned image. Swapchain images are left to the swapchain.
pub(crate) fn destroy_image(device: &LogicalDevice, mut image: VkImage) {
    let Some(allocation) = image.allocation.take() else {
        return;
    };
    match device.allocator().lock() {
        Ok(mut allocator) => {
            if let Err(e) = allocator.free(allocation) {
                error!("Failed to free image memory: {}", e);
            }
        }
        Err(_) => error!("Allocator lock poisoned; leaking image memory"),
    }
    // SAFETY: the GPU no longer uses the image (deferred destruction).
    unsafe { device.handle().destroy_image(image.image, None) };
}

pub(crate) fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: Format,
    base_mip: u32,
    mip_count: u32,
) -> RhiResult<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(conv::format(format))
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(conv::aspect(format))
                .base_mip_level(base_mip)
                .level_count(mip_count)
                .base_array_layer(0)
                .layer_count(1),
        );
    // SAFETY: the image is live; the view is destroyed with its RawView.
    unsafe { device.create_image_view(&info, None) }
        .map_err(|e| RhiError::InvalidHandle(format!("image view creation failed: {e:?}")))
}

fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

fn mipmap_mode(filter: Filter) -> vk::SamplerMipmapMode {
    match filter {
        Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub(crate) fn create_sampler(device: &ash::Device, desc: &SamplerDesc) -> RhiResult<vk::Sampler> {
    let address = address_mode(desc.address);
    let mut info = vk::SamplerCreateInfo::default()
        .mag_filter(filter(desc.filter))
        .min_filter(filter(desc.filter))
        .mipmap_mode(mipmap_mode(desc.mip_filter))
        .address_mode_u(address)
        .address_mode_v(address)
        .address_mode_w(address)
        .anisotropy_enable(desc.max_anisotropy > 1)
        .max_anisotropy(desc.max_anisotropy as f32)
        .min_lod(0.0)
        .max_lod(desc.max_lod)
        .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
    if let Some(op) = desc.compare {
        info = info.compare_enable(true).compare_op(compare_op(op));
    }
    // SAFETY: valid create info; destroyed with its RawSampler.
    Ok(unsafe { device.create_sampler(&info, None)? })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_visible_kinds_are_mappable() {
        for kind in [
            BufferKind::Vertex,
            BufferKind::Index,
            BufferKind::Constant,
            BufferKind::Storage,
            BufferKind::Staging,
            BufferKind::Readback,
            BufferKind::AccelerationStructure,
            BufferKind::Scratch,
        ] {
            let host = memory_location(kind) != MemoryLocation::GpuOnly;
            assert_eq!(host, kind.is_host_visible(), "{}", kind.name());
        }
    }

    #[test]
    fn test_buffer_usage() {
        assert!(buffer_usage(BufferKind::Index, false).contains(vk::BufferUsageFlags::INDEX_BUFFER));
        assert!(buffer_usage(BufferKind::Staging, false).contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(
            !buffer_usage(BufferKind::Vertex, false)
                .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR)
        );
        assert!(
            buffer_usage(BufferKind::Vertex, true)
                .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR)
        );
        for kind in [BufferKind::Scratch, BufferKind::AccelerationStructure] {
            assert!(buffer_usage(kind, true).contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        }
    }

    #[test]
    fn test_image_usage() {
        let usage = image_usage(TextureUsage::SHADER_READ | TextureUsage::COPY_DST);
        assert_eq!(
            usage,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST
        );
    }
}
