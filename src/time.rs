//! Simulation clock.
//!
//! [`Time`] turns raw frame deltas into the `time`/`delta_time` values the
//! engine uploads each frame. Elapsed time is accumulated from scaled deltas,
//! so pausing or changing the time scale never makes it jump.
//!
//! ```ignore
//! let mut time = Time::new();
//! loop {
//!     let delta = time.tick();          // measures the wall clock
//!     engine.update(delta)?;
//! }
//! ```

use std::time::{Duration, Instant};

/// Elapsed/delta clock with pause, time scale and fixed-delta mode.
#[derive(Debug, Clone)]
pub struct Time {
    last_tick: Instant,
    elapsed: f64,
    delta: f32,
    frame: u64,
    /// Exponentially smoothed frames per second.
    fps: f32,
    paused: bool,
    fixed_delta: Option<f32>,
    time_scale: f32,
    /// Longest raw delta accepted, so a stalled frame cannot teleport entities.
    max_delta: f32,
}

impl Time {
    pub fn new() -> Self {
        Self {
            last_tick: Instant::now(),
            elapsed: 0.0,
            delta: 0.0,
            frame: 0,
            fps: 0.0,
            paused: false,
            fixed_delta: None,
            time_scale: 1.0,
            max_delta: 0.25,
        }
    }

    pub fn with_fixed_delta(mut self, delta: f32) -> Self {
        self.fixed_delta = Some(delta.max(0.0));
        self
    }

    pub fn with_time_scale(mut self, scale: f32) -> Self {
        self.set_time_scale(scale);
        self
    }

    pub fn with_max_delta(mut self, max_delta: f32) -> Self {
        self.max_delta = max_delta.max(0.0);
        self
    }

    /// Measure the wall clock since the previous tick and advance by it.
    ///
    /// Returns the effective delta in seconds.
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        let raw = now.duration_since(self.last_tick).as_secs_f32();
        self.last_tick = now;
        if raw > 0.0 {
            let instant = 1.0 / raw;
            self.fps = if self.fps == 0.0 {
                instant
            } else {
                self.fps * 0.9 + instant * 0.1
            };
        }
        self.advance(raw)
    }

    /// Advance by a caller-supplied raw delta.
    ///
    /// Returns the effective delta: zero while paused, otherwise the fixed
    /// delta (if set) or the clamped raw delta, times the time scale.
    pub fn advance(&mut self, raw_delta: f32) -> f32 {
        self.frame += 1;
        if self.paused {
            self.delta = 0.0;
            return 0.0;
        }
        let base = self
            .fixed_delta
            .unwrap_or_else(|| raw_delta.clamp(0.0, self.max_delta));
        self.delta = base * self.time_scale;
        self.elapsed += self.delta as f64;
        self.delta
    }

    /// Scaled seconds since start, excluding pauses.
    #[inline]
    pub fn elapsed(&self) -> f32 {
        self.elapsed as f32
    }

    #[inline]
    pub fn delta(&self) -> f32 {
        self.delta
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[inline]
    pub fn fps(&self) -> f32 {
        self.fps
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[inline]
    pub fn time_scale(&self) -> f32 {
        self.time_scale
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.last_tick = Instant::now();
        }
    }

    pub fn toggle_pause(&mut self) {
        if self.paused {
            self.resume();
        } else {
            self.pause();
        }
    }

    /// Use a constant delta for deterministic stepping, or `None` for real time.
    pub fn set_fixed_delta(&mut self, delta: Option<f32>) {
        self.fixed_delta = delta.map(|d| d.max(0.0));
    }

    /// Set the speed multiplier. Negative values clamp to zero.
    pub fn set_time_scale(&mut self, scale: f32) {
        self.time_scale = scale.max(0.0);
    }

    pub fn reset(&mut self) {
        self.last_tick = Instant::now();
        self.elapsed = 0.0;
        self.delta = 0.0;
        self.frame = 0;
        self.fps = 0.0;
        self.paused = false;
    }

    pub fn elapsed_duration(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed)
    }
}

impl Default for Time {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_time_new() {
        let time = Time::new();
        assert_eq!(time.frame(), 0);
        assert!(!time.is_paused());
        assert_eq!(time.time_scale(), 1.0);
    }

    #[test]
    fn test_tick_measures_wall_clock() {
        let mut time = Time::new();
        thread::sleep(Duration::from_millis(10));
        let delta = time.tick();

        assert!(delta > 0.0);
        assert_eq!(time.elapsed(), delta);
        assert_eq!(time.frame(), 1);
        assert!(time.fps() > 0.0);
    }

    #[test]
    fn test_pause_freezes_elapsed() {
        let mut time = Time::new();
        time.advance(0.1);
        time.pause();

        let before = time.elapsed();
        assert_eq!(time.advance(0.1), 0.0);
        assert_eq!(time.elapsed(), before);

        time.resume();
        time.advance(0.1);
        assert!((time.elapsed() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_time_scale() {
        let mut time = Time::new().with_time_scale(2.0);
        assert!((time.advance(0.1) - 0.2).abs() < 1e-6);

        time.set_time_scale(-1.0);
        assert_eq!(time.time_scale(), 0.0);
        assert_eq!(time.advance(0.1), 0.0);
    }

    #[test]
    fn test_fixed_delta_ignores_raw_delta() {
        let mut time = Time::new().with_fixed_delta(1.0 / 60.0);
        let delta = time.advance(3.0);
        assert!((delta - 1.0 / 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_stalled_frames_are_clamped() {
        let mut time = Time::new().with_max_delta(0.1);
        assert!((time.advance(5.0) - 0.1).abs() < 1e-6);
    }
}
