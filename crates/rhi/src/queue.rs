//! GPU work queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::backend::RawCommandList;
use crate::command::{CommandRecorder, RecorderState};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Type of GPU queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Draws, dispatches, copies and presents
    Graphics,
    /// Dispatches and copies
    Compute,
    /// Copies only
    Copy,
}

/// A FIFO submission timeline.
///
/// Recorders submitted to one queue execute in submission order.
pub struct Queue {
    device: Arc<Device>,
    kind: QueueKind,
    submissions: AtomicU64,
}

impl Queue {
    pub fn new(device: &Arc<Device>, kind: QueueKind) -> Arc<Self> {
        Arc::new(Self {
            device: Arc::clone(device),
            kind,
            submissions: AtomicU64::new(0),
        })
    }

    /// Hands closed recorders to the GPU in order.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ContractViolation`] if a recorder is still open or
    /// was created for another queue kind.
    pub fn submit(&self, recorders: &[&CommandRecorder]) -> RhiResult<()> {
        let mut lists: Vec<RawCommandList> = Vec::with_capacity(recorders.len());
        for recorder in recorders {
            if recorder.state() != RecorderState::Closed {
                return Err(RhiError::contract(format!(
                    "submitting recorder '{}' in state {:?}",
                    recorder.name(),
                    recorder.state()
                )));
            }
            if recorder.queue() != self.kind {
                return Err(RhiError::contract(format!(
                    "{:?} recorder '{}' submitted to {:?} queue",
                    recorder.queue(),
                    recorder.name(),
                    self.kind
                )));
            }
            lists.push(recorder.raw());
        }
        if lists.is_empty() {
            return Ok(());
        }

        self.device.backend().submit(self.kind, &lists)?;
        let count = self.submissions.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(
            "{:?} queue submission #{} with {} list(s)",
            self.kind,
            count,
            lists.len()
        );
        Ok(())
    }

    /// Blocks until every submission on the device has completed.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.device.backend().wait_idle()
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Number of non-empty submissions made so far.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}
