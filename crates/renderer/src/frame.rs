//! The per-frame handle returned by the scheduler.

use std::sync::Arc;

use keel_rhi::CommandRecorder;
use keel_rhi::resource::Texture;
use keel_rhi::view::View;

/// Where the scheduler is in the frame protocol.
///
/// ```text
/// Idle --acquire_frame--> FrameAcquired --submit--> Recorded --end_frame--> Submitted --present--> Idle
///                              |                                   ^
///                              +------------- end_frame -----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    FrameAcquired,
    Recorded,
    Submitted,
}

/// One frame of work: the acquired backbuffer and the slot's recorder.
///
/// Produced by [`FrameScheduler::acquire_frame`](crate::FrameScheduler::acquire_frame)
/// and handed back through [`FrameScheduler::end_frame`](crate::FrameScheduler::end_frame).
/// The recorder is already begun. Dropping a frame instead of ending it
/// abandons it; its recorded transitions are undone.
pub struct Frame {
    pub(crate) slot: u32,
    /// Tells the scheduler whether this frame is still alive.
    pub(crate) lease: Arc<()>,
    pub(crate) backbuffer: Arc<Texture>,
    pub(crate) backbuffer_view: Arc<View>,
    pub(crate) recorder: CommandRecorder,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl Frame {
    /// Slot (and backbuffer) index of this frame.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The backbuffer, in `Present` state until the client transitions it.
    #[inline]
    pub fn backbuffer(&self) -> &Arc<Texture> {
        &self.backbuffer
    }

    /// Render-target view of the backbuffer.
    #[inline]
    pub fn backbuffer_view(&self) -> &Arc<View> {
        &self.backbuffer_view
    }

    /// The recorder for this frame's commands.
    #[inline]
    pub fn recorder(&mut self) -> &mut CommandRecorder {
        &mut self.recorder
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("slot", &self.slot)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("recorder", &self.recorder)
            .finish()
    }
}
