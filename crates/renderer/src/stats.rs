//! Frame statistics.

use std::time::Duration;

use keel_rhi::command::RecorderStats;
use tracing::debug;

/// How often, in frames, the statistics are logged.
pub const STATS_LOG_INTERVAL: u64 = 60;

/// Counters accumulated by the frame scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    /// Frames presented.
    pub frames: u64,
    /// Acquisitions that had to block on a slot's fence.
    pub fence_waits: u64,
    /// Time spent blocked in those waits.
    pub fence_wait_time: Duration,
    pub draws: u64,
    pub dispatches: u64,
    /// Transitions and UAV barriers recorded.
    pub barriers_emitted: u64,
    /// Barrier requests that needed nothing.
    pub barriers_elided: u64,
    /// Device memory owned by live resources at the last frame.
    pub memory_bytes: u64,
}

impl FrameStats {
    pub(crate) fn record(&mut self, recorder: RecorderStats) {
        self.draws += u64::from(recorder.draws);
        self.dispatches += u64::from(recorder.dispatches);
        self.barriers_emitted += u64::from(recorder.transitions + recorder.uav_barriers);
        self.barriers_elided += u64::from(recorder.elided_barriers);
    }

    pub(crate) fn record_wait(&mut self, waited: Duration) {
        self.fence_waits += 1;
        self.fence_wait_time += waited;
    }

    /// Average time blocked per fence wait.
    pub fn average_wait(&self) -> Duration {
        if self.fence_waits == 0 {
            return Duration::ZERO;
        }
        self.fence_wait_time / self.fence_waits as u32
    }

    pub(crate) fn log_periodically(&self) {
        if self.frames == 0 || self.frames % STATS_LOG_INTERVAL != 0 {
            return;
        }
        debug!(
            "Frame {}: {} draws, {} dispatches, {} barriers ({} elided), {} fence waits (avg {:?}), {:.1} MB in use",
            self.frames,
            self.draws,
            self.dispatches,
            self.barriers_emitted,
            self.barriers_elided,
            self.fence_waits,
            self.average_wait(),
            self.memory_bytes as f64 / (1024.0 * 1024.0)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates_barriers() {
        let mut stats = FrameStats::default();
        stats.record(RecorderStats {
            draws: 2,
            dispatches: 1,
            transitions: 3,
            uav_barriers: 1,
            elided_barriers: 5,
            copies: 0,
        });
        assert_eq!(stats.draws, 2);
        assert_eq!(stats.barriers_emitted, 4);
        assert_eq!(stats.barriers_elided, 5);
    }

    #[test]
    fn test_average_wait() {
        let mut stats = FrameStats::default();
        assert_eq!(stats.average_wait(), Duration::ZERO);
        stats.record_wait(Duration::from_millis(2));
        stats.record_wait(Duration::from_millis(4));
        assert_eq!(stats.average_wait(), Duration::from_millis(3));
    }
}
