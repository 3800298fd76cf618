//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
///
/// Variants fall into the classes callers need to tell apart:
/// exhaustion (recoverable), device-level failures (fatal, see
/// [`RhiError::is_fatal`]) and caller-contract violations.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[cfg(feature = "vulkan")]
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[cfg(feature = "vulkan")]
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// A fixed-capacity pool (descriptor heap, staging memory) has no room left
    #[error("{heap} exhausted (capacity {capacity})")]
    ResourceExhausted { heap: &'static str, capacity: u32 },

    /// The device stopped making progress or was removed
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// A fence wait exceeded the configured timeout
    #[error("Fence wait for value {value} timed out (completed {completed})")]
    FenceTimeout { value: u64, completed: u64 },

    /// The caller broke an API contract (wrong state, wrong phase, double free)
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// The backend or adapter does not support the requested feature
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A lock guarding shared RHI state was poisoned by a panicking thread
    #[error("Poisoned lock: {0}")]
    Poisoned(&'static str),

    /// Shader module error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

impl RhiError {
    /// Returns true for device-level failures that must not be retried.
    ///
    /// Callers are expected to log and terminate on a fatal error; the core
    /// never attempts to recover from one.
    pub fn is_fatal(&self) -> bool {
        match self {
            RhiError::DeviceLost(_)
            | RhiError::FenceTimeout { .. }
            | RhiError::NoSuitableGpu
            | RhiError::Poisoned(_) => true,
            #[cfg(feature = "vulkan")]
            RhiError::VulkanError(result) => matches!(
                *result,
                ash::vk::Result::ERROR_DEVICE_LOST
                    | ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                    | ash::vk::Result::ERROR_INITIALIZATION_FAILED
            ),
            #[cfg(feature = "vulkan")]
            RhiError::LoadingError(_) => true,
            _ => false,
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("Contract violation: {}", message);
        RhiError::ContractViolation(message)
    }
}

impl<T> From<std::sync::PoisonError<T>> for RhiError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        RhiError::Poisoned("rhi state")
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RhiError::DeviceLost("hung".into()).is_fatal());
        assert!(RhiError::FenceTimeout { value: 4, completed: 2 }.is_fatal());
        assert!(
            !RhiError::ResourceExhausted {
                heap: "sampler heap",
                capacity: 2048
            }
            .is_fatal()
        );
        assert!(!RhiError::ContractViolation("copy without barrier".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = RhiError::ResourceExhausted {
            heap: "render target heap",
            capacity: 8,
        };
        assert_eq!(err.to_string(), "render target heap exhausted (capacity 8)");
    }
}
