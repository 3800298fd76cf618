//! Renderer configuration.
//!
//! [`RendererConfig`] collects every tunable of the resource core in one
//! place: frame pacing depth, descriptor heap capacities, the fence timeout
//! that turns a stalled GPU into a device-lost error, and surface defaults.
//! Values come from [`Default`], the `with_*` builders, or the environment
//! via [`RendererConfig::from_env`].

use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound accepted for `frames_in_flight`.
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

/// Configuration shared by the device, the frame scheduler and the uploader.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Capacity of the shader-visible CBV/SRV/UAV heap.
    pub shader_resource_heap_capacity: u32,
    /// Capacity of the shader-visible sampler heap.
    pub sampler_heap_capacity: u32,
    /// Capacity of the render-target heap.
    pub render_target_heap_capacity: u32,
    /// Capacity of the depth-target heap.
    pub depth_target_heap_capacity: u32,
    /// Longest a fence wait may block before the device is considered lost.
    pub fence_timeout: Duration,
    /// Enable API validation layers.
    pub validation: bool,
    /// Present with vertical sync.
    pub vsync: bool,
    /// Initial surface width in pixels.
    pub width: u32,
    /// Initial surface height in pixels.
    pub height: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            shader_resource_heap_capacity: 1_000_000,
            sampler_heap_capacity: 2048,
            render_target_heap_capacity: 2048,
            depth_target_heap_capacity: 2048,
            fence_timeout: Duration::from_secs(10),
            validation: cfg!(debug_assertions),
            vsync: true,
            width: 1280,
            height: 720,
        }
    }
}

impl RendererConfig {
    /// Sets the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Sets all four descriptor heap capacities at once.
    pub fn with_heap_capacities(
        mut self,
        shader_resource: u32,
        sampler: u32,
        render_target: u32,
        depth_target: u32,
    ) -> Self {
        self.shader_resource_heap_capacity = shader_resource;
        self.sampler_heap_capacity = sampler;
        self.render_target_heap_capacity = render_target;
        self.depth_target_heap_capacity = depth_target;
        self
    }

    /// Sets the fence timeout.
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Enables or disables validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Enables or disables vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Sets the initial surface extent.
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Builds a configuration from defaults overridden by environment variables.
    ///
    /// Recognized variables:
    /// - `KEEL_FRAMES_IN_FLIGHT` (integer)
    /// - `KEEL_VSYNC` (`true`/`false`/`1`/`0`)
    /// - `KEEL_VALIDATION` (`true`/`false`/`1`/`0`)
    /// - `KEEL_FENCE_TIMEOUT_MS` (integer milliseconds)
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEnv`] if a variable is set but unparsable, or
    /// [`Error::Config`] if the resulting configuration fails validation.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(frames) = env_value("KEEL_FRAMES_IN_FLIGHT", |v| v.parse::<usize>().ok())? {
            config.frames_in_flight = frames;
        }
        if let Some(vsync) = env_value("KEEL_VSYNC", parse_bool)? {
            config.vsync = vsync;
        }
        if let Some(validation) = env_value("KEEL_VALIDATION", parse_bool)? {
            config.validation = validation;
        }
        if let Some(ms) = env_value("KEEL_FENCE_TIMEOUT_MS", |v| v.parse::<u64>().ok())? {
            config.fence_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={}, got {}",
                MAX_FRAMES_IN_FLIGHT, self.frames_in_flight
            )));
        }

        let heaps = [
            ("shader_resource_heap_capacity", self.shader_resource_heap_capacity),
            ("sampler_heap_capacity", self.sampler_heap_capacity),
            ("render_target_heap_capacity", self.render_target_heap_capacity),
            ("depth_target_heap_capacity", self.depth_target_heap_capacity),
        ];
        if let Some((name, _)) = heaps.iter().find(|(_, capacity)| *capacity == 0) {
            return Err(Error::Config(format!("{name} must be nonzero")));
        }

        if self.fence_timeout.is_zero() {
            return Err(Error::Config("fence_timeout must be nonzero".to_string()));
        }

        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "surface extent must be nonzero, got {}x{}",
                self.width, self.height
            )));
        }

        Ok(())
    }
}

fn env_value<T>(key: &'static str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => parse(value.trim())
            .map(Some)
            .ok_or(Error::InvalidEnv { key, value }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 4] = [
        "KEEL_FRAMES_IN_FLIGHT",
        "KEEL_VSYNC",
        "KEEL_VALIDATION",
        "KEEL_FENCE_TIMEOUT_MS",
    ];

    fn clear_env() {
        for key in KEYS {
            // SAFETY: env tests are serialized with #[serial].
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn test_default_is_valid() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.shader_resource_heap_capacity, 1_000_000);
        assert_eq!(config.sampler_heap_capacity, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = RendererConfig::default()
            .with_frames_in_flight(2)
            .with_heap_capacities(64, 8, 8, 4)
            .with_vsync(false)
            .with_extent(640, 480);
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.depth_target_heap_capacity, 4);
        assert!(!config.vsync);
        assert_eq!((config.width, config.height), (640, 480));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_frames = RendererConfig::default().with_frames_in_flight(0);
        assert!(matches!(zero_frames.validate(), Err(Error::Config(_))));

        let too_many = RendererConfig::default().with_frames_in_flight(MAX_FRAMES_IN_FLIGHT + 1);
        assert!(too_many.validate().is_err());

        let empty_heap = RendererConfig::default().with_heap_capacities(16, 0, 16, 16);
        let err = empty_heap.validate().unwrap_err();
        assert!(err.to_string().contains("sampler_heap_capacity"));

        let no_timeout = RendererConfig::default().with_fence_timeout(Duration::ZERO);
        assert!(no_timeout.validate().is_err());

        let no_extent = RendererConfig::default().with_extent(0, 720);
        assert!(no_extent.validate().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        // SAFETY: env tests are serialized with #[serial].
        unsafe {
            std::env::set_var("KEEL_FRAMES_IN_FLIGHT", "2");
            std::env::set_var("KEEL_VSYNC", "off");
            std::env::set_var("KEEL_FENCE_TIMEOUT_MS", "250");
        }

        let config = RendererConfig::from_env().unwrap();
        assert_eq!(config.frames_in_flight, 2);
        assert!(!config.vsync);
        assert_eq!(config.fence_timeout, Duration::from_millis(250));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        // SAFETY: env tests are serialized with #[serial].
        unsafe { std::env::set_var("KEEL_FRAMES_IN_FLIGHT", "three") };

        let result = RendererConfig::from_env();
        assert!(matches!(
            result,
            Err(Error::InvalidEnv { key: "KEEL_FRAMES_IN_FLIGHT", .. })
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_validates() {
        clear_env();
        // SAFETY: env tests are serialized with #[serial].
        unsafe { std::env::set_var("KEEL_FRAMES_IN_FLIGHT", "0") };

        assert!(matches!(RendererConfig::from_env(), Err(Error::Config(_))));
        clear_env();
    }
}
