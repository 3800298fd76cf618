//! Frame pacing and uploads on top of the keel RHI.
//!
//! This crate provides the verbs client code drives each frame:
//! - [`FrameScheduler`]: acquire a frame, record, submit, present
//! - [`Uploader`]: stage buffers, textures and acceleration-structure builds
//! - [`FrameStats`]: counters logged while frames run

mod frame;
mod scheduler;
mod stats;
mod uploader;

pub use frame::{Frame, FramePhase};
pub use scheduler::{BACKBUFFER_FORMAT, FrameScheduler};
pub use stats::{FrameStats, STATS_LOG_INTERVAL};
pub use uploader::{ImageData, Uploader};

use keel_core::RendererConfig;
use keel_rhi::DeviceDesc;

/// Device parameters derived from a renderer configuration.
pub fn device_desc(config: &RendererConfig) -> DeviceDesc {
    DeviceDesc {
        shader_resource_heap_capacity: config.shader_resource_heap_capacity,
        sampler_heap_capacity: config.sampler_heap_capacity,
        render_target_heap_capacity: config.render_target_heap_capacity,
        depth_target_heap_capacity: config.depth_target_heap_capacity,
        fence_timeout: config.fence_timeout,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_device_desc_follows_config() {
        let config = RendererConfig::default()
            .with_heap_capacities(64, 8, 4, 2)
            .with_fence_timeout(Duration::from_millis(250));
        let desc = device_desc(&config);
        assert_eq!(desc.shader_resource_heap_capacity, 64);
        assert_eq!(desc.sampler_heap_capacity, 8);
        assert_eq!(desc.render_target_heap_capacity, 4);
        assert_eq!(desc.depth_target_heap_capacity, 2);
        assert_eq!(desc.fence_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_defaults_match_device_defaults() {
        assert_eq!(device_desc(&RendererConfig::default()), DeviceDesc::default());
    }
}
