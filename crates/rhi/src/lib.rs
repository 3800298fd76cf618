//! GPU resource and synchronization core (Render Hardware Interface).
//!
//! This crate owns everything that must reason about concurrent CPU/GPU
//! execution:
//! - Descriptor heaps with O(1) slot allocation
//! - Buffers and textures with tracked access states
//! - Views owning descriptor slots
//! - Command recording with barrier elision
//! - Timeline fences and FIFO queues
//! - Presentation surfaces
//!
//! The API-specific work happens behind the [`Backend`] trait. Two backends
//! ship with the crate: [`software::SoftwareBackend`], a CPU emulation used
//! for tests and headless runs, and `vulkan::VulkanBackend` (feature
//! `vulkan`).

mod error;

pub mod acceleration;
pub mod backend;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod footprint;
pub mod format;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod software;
pub mod state;
pub mod surface;
pub mod sync;
pub mod view;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use backend::Backend;
pub use command::{CommandRecorder, RecorderState, Viewport};
pub use device::{Device, DeviceDesc};
pub use error::{RhiError, RhiResult};
pub use format::Format;
pub use queue::{Queue, QueueKind};
pub use state::{AccessState, BarrierOutcome};
pub use surface::{PresentStatus, Surface, SurfaceTarget};
pub use sync::Fence;

#[cfg(feature = "vulkan")]
pub use ash::vk;
