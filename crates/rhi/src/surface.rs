//! The presentation engine.
//!
//! A [`Surface`] owns a backend swapchain, wraps each of its images as an
//! external [`Texture`] in [`AccessState::Present`], and keeps one
//! render-target [`View`] per image.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::RawTexture;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::format::Format;
use crate::resource::{Texture, TextureDesc, TextureUsage};
use crate::state::AccessState;
use crate::view::{View, ViewDesc};

/// What a swapchain presents to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceTarget {
    /// Backend-owned images that are never shown; used for headless runs.
    Offscreen,
    /// A window surface created by the caller from the backend's instance.
    #[cfg(feature = "vulkan")]
    Vulkan(ash::vk::SurfaceKHR),
}

/// Requested (or, when returned by a backend, actual) swapchain shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    pub format: Format,
    pub vsync: bool,
}

/// Result of a present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// Not presented; the swapchain must be resized.
    OutOfDate,
}

impl PresentStatus {
    /// Returns true if the caller should resize before the next frame.
    pub fn needs_resize(self) -> bool {
        !matches!(self, PresentStatus::Presented)
    }
}

/// Backend half of a swapchain.
pub trait RawSwapchain: Send {
    /// Images in index order.
    fn images(&self) -> Vec<RawTexture>;
    /// Actual shape.
    fn desc(&self) -> SwapchainDesc;
    /// Acquires the next image and returns its index.
    fn acquire(&mut self) -> RhiResult<u32>;
    /// Presents image `index` after all previously submitted work.
    fn present(&mut self, index: u32, vsync: bool) -> RhiResult<PresentStatus>;
    /// Recreates the images at a new extent.
    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()>;
}

/// Backbuffers plus acquire/present.
pub struct Surface {
    device: Arc<Device>,
    raw: Box<dyn RawSwapchain>,
    backbuffers: Vec<Arc<Texture>>,
    views: Vec<Arc<View>>,
    current: Option<u32>,
}

impl Surface {
    /// Creates a swapchain for `target`.
    pub fn new(device: &Arc<Device>, target: SurfaceTarget, desc: SwapchainDesc) -> RhiResult<Self> {
        if desc.image_count == 0 {
            return Err(RhiError::SwapchainError("image count must be nonzero".into()));
        }
        let raw = device.backend().create_swapchain(&target, &desc)?;
        let mut surface = Self {
            device: Arc::clone(device),
            raw,
            backbuffers: Vec::new(),
            views: Vec::new(),
            current: None,
        };
        surface.wrap_images()?;

        let actual = surface.raw.desc();
        info!(
            "Created surface {}x{} {:?} with {} images",
            actual.width, actual.height, actual.format, actual.image_count
        );
        if actual.image_count != desc.image_count {
            warn!(
                "Requested {} backbuffers, presentation engine gave {}",
                desc.image_count, actual.image_count
            );
        }
        Ok(surface)
    }

    fn wrap_images(&mut self) -> RhiResult<()> {
        let desc = self.raw.desc();
        self.views.clear();
        self.backbuffers.clear();

        for (index, raw) in self.raw.images().into_iter().enumerate() {
            let texture = Texture::from_external(
                &self.device,
                raw,
                TextureDesc::new(format!("backbuffer {index}"), desc.width, desc.height, desc.format)
                    .with_usage(TextureUsage::RENDER_TARGET | TextureUsage::COPY_DST),
                AccessState::Present,
            );
            let view = View::new(&self.device, (&texture).into(), ViewDesc::render_target())?;
            self.backbuffers.push(texture);
            self.views.push(view);
        }
        Ok(())
    }

    /// Acquires the next backbuffer and returns its index.
    pub fn acquire(&mut self) -> RhiResult<u32> {
        if let Some(index) = self.current {
            return Err(RhiError::contract(format!(
                "backbuffer {} acquired twice without present",
                index
            )));
        }
        let index = self.raw.acquire()?;
        if index as usize >= self.backbuffers.len() {
            return Err(RhiError::SwapchainError(format!(
                "presentation engine returned image {} of {}",
                index,
                self.backbuffers.len()
            )));
        }
        self.current = Some(index);
        Ok(index)
    }

    /// Index of the acquired backbuffer, if any.
    pub fn current_index(&self) -> Option<u32> {
        self.current
    }

    /// Presents the acquired backbuffer. Does not wait for the GPU.
    pub fn present(&mut self, vsync: bool) -> RhiResult<PresentStatus> {
        let index = self
            .current
            .take()
            .ok_or_else(|| RhiError::contract("present without an acquired backbuffer"))?;
        self.raw.present(index, vsync)
    }

    /// Recreates the backbuffers. The caller must have drained the GPU.
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        if width == 0 || height == 0 {
            return Err(RhiError::SwapchainError(format!(
                "cannot resize to {width}x{height}"
            )));
        }
        self.views.clear();
        self.backbuffers.clear();
        self.current = None;
        self.raw.resize(width, height)?;
        self.wrap_images()?;
        info!("Resized surface to {}x{}", width, height);
        Ok(())
    }

    pub fn backbuffer(&self, index: u32) -> Option<&Arc<Texture>> {
        self.backbuffers.get(index as usize)
    }

    pub fn backbuffer_view(&self, index: u32) -> Option<&Arc<View>> {
        self.views.get(index as usize)
    }

    pub fn image_count(&self) -> u32 {
        self.backbuffers.len() as u32
    }

    pub fn extent(&self) -> (u32, u32) {
        let desc = self.raw.desc();
        (desc.width, desc.height)
    }

    pub fn format(&self) -> Format {
        self.raw.desc().format
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // Views must release their backend objects before the images go away.
        self.views.clear();
        self.backbuffers.clear();
    }
}
