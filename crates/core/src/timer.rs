//! Wall-clock timing for frame pacing and fence waits.

use std::time::{Duration, Instant};

/// Measures frame-to-frame deltas and keeps their running average.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
    ticks: u64,
    ticked: Duration,
}

impl Timer {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            ticks: 0,
            ticked: Duration::ZERO,
        }
    }

    /// Runs `f` and returns its result together with how long it took.
    pub fn measure<R>(f: impl FnOnce() -> R) -> (R, Duration) {
        let start = Instant::now();
        let result = f();
        (result, start.elapsed())
    }

    /// Time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time since the previous `tick()` (or creation).
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.ticks += 1;
        self.ticked += delta;
        delta
    }

    /// Mean of every delta returned by `tick()`; zero before the first.
    pub fn average_tick(&self) -> Duration {
        match u32::try_from(self.ticks) {
            Ok(0) => Duration::ZERO,
            Ok(ticks) => self.ticked / ticks,
            Err(_) => self.ticked.div_f64(self.ticks as f64),
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_returns_result() {
        let (value, elapsed) = Timer::measure(|| 21 * 2);
        assert_eq!(value, 42);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_tick_accumulates_average() {
        let mut timer = Timer::new();
        assert_eq!(timer.average_tick(), Duration::ZERO);

        std::thread::sleep(Duration::from_millis(2));
        let first = timer.tick();
        let second = timer.tick();
        assert!(first >= Duration::from_millis(2));
        assert_eq!(timer.average_tick(), (first + second) / 2);
        assert!(timer.elapsed() >= first);
    }
}
