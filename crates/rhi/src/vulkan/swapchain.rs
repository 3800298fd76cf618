//! Swapchains for the Vulkan backend.
//!
//! [`VulkanSwapchain`] wraps a `VkSwapchainKHR` on the backend-owned surface;
//! [`OffscreenSwapchain`] rotates through ordinary images for headless runs.
//! Both register their images in the backend's object table so recorded
//! commands can address them like any other texture.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::backend::RawTexture;
use crate::error::{RhiError, RhiResult};
use crate::resource::{TextureDesc, TextureUsage};
use crate::surface::{PresentStatus, RawSwapchain, SwapchainDesc};
use crate::vulkan::Shared;
use crate::vulkan::conv;
use crate::vulkan::resources::VkImage;
use crate::vulkan::sync::{create_binary, device_error};

/// What a surface supports, queried once per (re)creation.
#[derive(Debug, Clone)]
pub(crate) struct SwapchainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    pub(crate) fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        // SAFETY: the surface and physical device are live for the backend's lifetime.
        let (capabilities, formats, present_modes) = unsafe {
            (
                surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?,
                surface_loader.get_physical_device_surface_formats(physical_device, surface)?,
                surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?,
            )
        };
        debug!(
            "Swapchain support: {} formats, {} present modes, image count {}-{}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count,
            if capabilities.max_image_count == 0 {
                "unlimited".to_string()
            } else {
                capabilities.max_image_count.to_string()
            }
        );
        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    #[inline]
    pub(crate) fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Picks `preferred` if the surface offers it in sRGB-nonlinear, else the
/// usual BGRA8 sRGB/UNORM choices, else whatever comes first.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR], preferred: vk::Format) -> vk::SurfaceFormatKHR {
    let find = |format: vk::Format| {
        formats
            .iter()
            .find(|f| f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .copied()
    };
    if let Some(format) = find(preferred) {
        return format;
    }
    if let Some(format) = find(vk::Format::B8G8R8A8_SRGB).or_else(|| find(vk::Format::B8G8R8A8_UNORM)) {
        warn!("Surface lacks {:?}, using {:?}", preferred, format.format);
        return format;
    }
    warn!("Using first available surface format: {:?}", formats[0].format);
    formats[0]
}

/// FIFO when vsync is on. Otherwise MAILBOX, then IMMEDIATE, then FIFO
/// (which is always available).
fn choose_present_mode(present_modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync {
        for mode in [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE] {
            if present_modes.contains(&mode) {
                return mode;
            }
        }
    }
    vk::PresentModeKHR::FIFO
}

/// The surface's current extent if it dictates one, else the request clamped to its limits.
fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// The requested count clamped to the surface limits (`max == 0` means unbounded).
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

pub(crate) struct VulkanSwapchain {
    shared: Arc<Shared>,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    desc: SwapchainDesc,
    images: Vec<RawTexture>,
    /// Ring of acquire semaphores; one more than the image count.
    acquire: Vec<vk::Semaphore>,
    next_acquire: usize,
    /// Signaled by the last submission before presenting image `i`.
    render_finished: Vec<vk::Semaphore>,
}

impl VulkanSwapchain {
    pub(crate) fn new(shared: Arc<Shared>, surface: vk::SurfaceKHR, desc: &SwapchainDesc) -> RhiResult<Self> {
        let mut swapchain = Self {
            shared,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            desc: *desc,
            images: Vec::new(),
            acquire: Vec::new(),
            next_acquire: 0,
            render_finished: Vec::new(),
        };
        swapchain.create(desc.width, desc.height)?;
        Ok(swapchain)
    }

    fn loader(&self) -> RhiResult<&ash::khr::swapchain::Device> {
        self.shared
            .swapchain_loader()
            .ok_or_else(|| RhiError::Unsupported("backend was created without presentation".into()))
    }

    fn create(&mut self, width: u32, height: u32) -> RhiResult<()> {
        let surface_loader = self
            .shared
            .surface_loader()
            .ok_or_else(|| RhiError::Unsupported("backend was created without presentation".into()))?;
        let support = SwapchainSupportDetails::query(
            self.shared.device().physical_device(),
            self.surface,
            surface_loader,
        )?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "inadequate swapchain support (no formats or present modes)".into(),
            ));
        }

        let surface_format = choose_surface_format(&support.formats, conv::format(self.desc.format));
        let present_mode = choose_present_mode(&support.present_modes, self.desc.vsync);
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = determine_image_count(&support.capabilities, self.desc.image_count);

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let loader = self.loader()?;
        // SAFETY: the old swapchain (if any) is retired by this call and destroyed below.
        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };
        // SAFETY: the swapchain was just created.
        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                // SAFETY: no image of the new swapchain was handed out.
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };
        if old_swapchain != vk::SwapchainKHR::null() {
            // SAFETY: the caller drained the GPU before resizing.
            unsafe { loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;

        let format = conv::format_from_vk(surface_format.format);
        self.images = images
            .into_iter()
            .map(|image| self.shared.register_image(VkImage::external(image, format, extent)))
            .collect();

        let device = self.shared.device().handle();
        while self.render_finished.len() < self.images.len() {
            self.render_finished.push(create_binary(device)?);
        }
        while self.acquire.len() < self.images.len() + 1 {
            self.acquire.push(create_binary(device)?);
        }

        self.desc = SwapchainDesc {
            width: extent.width,
            height: extent.height,
            image_count: self.images.len() as u32,
            format,
            vsync: self.desc.vsync,
        };
        info!(
            "Swapchain {}x{} {:?} ({:?}, {:?}), {} images",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            self.images.len()
        );
        Ok(())
    }

    fn release_images(&mut self) {
        for image in self.images.drain(..) {
            self.shared.unregister_image(image);
        }
    }
}

impl RawSwapchain for VulkanSwapchain {
    fn images(&self) -> Vec<RawTexture> {
        self.images.clone()
    }

    fn desc(&self) -> SwapchainDesc {
        self.desc
    }

    fn acquire(&mut self) -> RhiResult<u32> {
        let semaphore = self.acquire[self.next_acquire % self.acquire.len()];
        self.next_acquire += 1;
        let loader = self.loader()?;
        // SAFETY: the semaphore is unsignaled; its previous wait was submitted a full ring ago.
        match unsafe { loader.acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null()) } {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("Acquired image {} from a suboptimal swapchain", index);
                }
                self.shared.push_acquire_wait(semaphore)?;
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RhiError::SwapchainError(
                "swapchain out of date; resize before acquiring".into(),
            )),
            Err(e) => Err(device_error(e)),
        }
    }

    fn present(&mut self, index: u32, vsync: bool) -> RhiResult<PresentStatus> {
        let render_finished = *self
            .render_finished
            .get(index as usize)
            .ok_or_else(|| RhiError::SwapchainError(format!("present of unknown image {index}")))?;
        self.shared.signal_binary(render_finished)?;

        let waits = [render_finished];
        let swapchains = [self.swapchain];
        let indices = [index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let loader = self.loader()?;
        // SAFETY: the image was acquired and its last use was submitted before the signal above.
        let status = match unsafe { loader.queue_present(self.shared.device().present_queue(), &info) } {
            Ok(false) => PresentStatus::Presented,
            Ok(true) => PresentStatus::Suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => PresentStatus::OutOfDate,
            Err(e) => return Err(device_error(e)),
        };

        // A present mode change needs a new swapchain; report it like a stale surface.
        if vsync != self.desc.vsync && status == PresentStatus::Presented {
            self.desc.vsync = vsync;
            return Ok(PresentStatus::Suboptimal);
        }
        Ok(status)
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.shared.wait_idle()?;
        self.release_images();
        self.create(width, height)
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        if let Err(e) = self.shared.wait_idle() {
            warn!("Swapchain teardown without a drained device: {}", e);
        }
        self.release_images();
        let device = self.shared.device().handle();
        // SAFETY: the device is idle, so no semaphore or image is in use.
        unsafe {
            for semaphore in self.acquire.drain(..).chain(self.render_finished.drain(..)) {
                device.destroy_semaphore(semaphore, None);
            }
            if let Some(loader) = self.shared.swapchain_loader() {
                loader.destroy_swapchain(self.swapchain, None);
            }
        }
        debug!("Swapchain destroyed");
    }
}

/// Backend-owned images that are never shown.
pub(crate) struct OffscreenSwapchain {
    shared: Arc<Shared>,
    desc: SwapchainDesc,
    images: Vec<RawTexture>,
    next: u32,
}

impl OffscreenSwapchain {
    pub(crate) fn new(shared: Arc<Shared>, desc: &SwapchainDesc) -> RhiResult<Self> {
        let mut swapchain = Self {
            shared,
            desc: *desc,
            images: Vec::new(),
            next: 0,
        };
        swapchain.create_images()?;
        info!(
            "Offscreen swapchain {}x{} {:?}, {} images",
            desc.width, desc.height, desc.format, desc.image_count
        );
        Ok(swapchain)
    }

    fn create_images(&mut self) -> RhiResult<()> {
        for index in 0..self.desc.image_count {
            let desc = TextureDesc::new(
                format!("offscreen backbuffer {index}"),
                self.desc.width,
                self.desc.height,
                self.desc.format,
            )
            .with_usage(TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC | TextureUsage::COPY_DST);
            let (raw, _) = self.shared.create_texture(&desc)?;
            self.images.push(raw);
        }
        Ok(())
    }

    fn destroy_images(&mut self) {
        for image in self.images.drain(..) {
            self.shared.destroy_texture(image);
        }
    }
}

impl RawSwapchain for OffscreenSwapchain {
    fn images(&self) -> Vec<RawTexture> {
        self.images.clone()
    }

    fn desc(&self) -> SwapchainDesc {
        self.desc
    }

    fn acquire(&mut self) -> RhiResult<u32> {
        let index = self.next;
        self.next = (self.next + 1) % self.desc.image_count;
        Ok(index)
    }

    fn present(&mut self, _index: u32, _vsync: bool) -> RhiResult<PresentStatus> {
        Ok(PresentStatus::Presented)
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.destroy_images();
        self.desc.width = width;
        self.desc.height = height;
        self.next = 0;
        self.create_images()
    }
}

impl Drop for OffscreenSwapchain {
    fn drop(&mut self) {
        self.destroy_images();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srgb(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_choose_surface_format_honors_request() {
        let formats = [
            srgb(vk::Format::R8G8B8A8_UNORM),
            srgb(vk::Format::B8G8R8A8_SRGB),
            srgb(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats, vk::Format::B8G8R8A8_UNORM).format,
            vk::Format::B8G8R8A8_UNORM
        );
        assert_eq!(
            choose_surface_format(&formats, vk::Format::R16G16B16A16_SFLOAT).format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn test_choose_surface_format_fallback() {
        let formats = [srgb(vk::Format::R8G8B8A8_UNORM)];
        assert_eq!(
            choose_surface_format(&formats, vk::Format::B8G8R8A8_SRGB).format,
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn test_choose_present_mode() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_choose_extent_uses_current() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 800, 600);
        assert_eq!((extent.width, extent.height), (1920, 1080));
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 2000,
                height: 2000,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 3000, 50);
        assert_eq!((extent.width, extent.height), (2000, 100));
        let extent = choose_extent(&capabilities, 800, 600);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_determine_image_count() {
        let bounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&bounded, 4), 3);
        assert_eq!(determine_image_count(&bounded, 1), 2);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&unbounded, 5), 5);
    }

    #[test]
    fn test_swapchain_support_details_is_adequate() {
        let details = |formats: usize, modes: usize| SwapchainSupportDetails {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default(); formats],
            present_modes: vec![vk::PresentModeKHR::FIFO; modes],
        };
        assert!(details(1, 1).is_adequate());
        assert!(!details(0, 1).is_adequate());
        assert!(!details(1, 0).is_adequate());
    }
}
