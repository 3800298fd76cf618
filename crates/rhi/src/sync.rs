//! Timeline fences.
//!
//! A [`Fence`] is a monotonically increasing counter advanced by the GPU.
//! The CPU asks a queue to move it forward with [`Fence::signal`] and blocks
//! on it with [`Fence::wait`]. A wait that does not complete within the
//! device's fence timeout is reported as a fatal device loss.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error, trace};

use crate::backend::RawFence;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::queue::Queue;

/// GPU-completion counter.
pub struct Fence {
    device: Arc<Device>,
    raw: RawFence,
    name: String,
    last_signaled: AtomicU64,
}

impl Fence {
    /// Creates a fence whose completed value starts at zero.
    pub fn new(device: &Arc<Device>, name: &str) -> RhiResult<Self> {
        let raw = device.backend().create_fence(0)?;
        debug!("Created fence '{}'", name);
        Ok(Self {
            device: Arc::clone(device),
            raw,
            name: name.to_string(),
            last_signaled: AtomicU64::new(0),
        })
    }

    /// Asks `queue` to advance the fence to `value` once all work submitted
    /// before this call completes.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ContractViolation`] if `value` does not exceed the
    /// last signaled value.
    pub fn signal(&self, queue: &Queue, value: u64) -> RhiResult<()> {
        let last = self.last_signaled.load(Ordering::Acquire);
        if value <= last {
            return Err(RhiError::contract(format!(
                "fence '{}' signaled with {} after {}",
                self.name, value, last
            )));
        }
        self.device
            .backend()
            .signal_fence(queue.kind(), self.raw, value)?;
        self.last_signaled.store(value, Ordering::Release);
        trace!("Fence '{}' signal {} on {:?}", self.name, value, queue.kind());
        Ok(())
    }

    /// Highest value the GPU has confirmed.
    pub fn completed_value(&self) -> RhiResult<u64> {
        self.device.backend().fence_completed_value(self.raw)
    }

    /// Returns true if the GPU has reached `value`.
    pub fn is_complete(&self, value: u64) -> RhiResult<bool> {
        Ok(self.completed_value()? >= value)
    }

    /// Last value passed to [`Fence::signal`].
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    /// Blocks until the GPU reaches `value`.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`RhiError::FenceTimeout`] or [`RhiError::DeviceLost`]
    /// if the value is not reached within the device's fence timeout.
    pub fn wait(&self, value: u64) -> RhiResult<()> {
        if self.is_complete(value)? {
            return Ok(());
        }
        if value > self.last_signaled() {
            return Err(RhiError::contract(format!(
                "waiting on fence '{}' for {} which was never signaled (last {})",
                self.name,
                value,
                self.last_signaled()
            )));
        }

        let timeout = self.device.fence_timeout();
        self.device
            .backend()
            .wait_fence(self.raw, value, timeout)
            .inspect_err(|e| {
                error!(
                    "Fence '{}' wait for {} failed after {:?}: {}",
                    self.name, value, timeout, e
                )
            })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn raw(&self) -> RawFence {
        self.raw
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.backend().destroy_fence(self.raw);
        debug!("Destroyed fence '{}'", self.name);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("name", &self.name)
            .field("last_signaled", &self.last_signaled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_fence_is_send_sync() {
        assert_send_sync::<Fence>();
    }

    #[test]
    fn test_fence_timeout_is_fatal() {
        let err = RhiError::FenceTimeout {
            value: 3,
            completed: 1,
        };
        assert!(err.is_fatal());
    }
}
