use std::cell::Cell;
use std::rc::Rc;

/// Millisecond wall clock used for frame-rate telemetry.
pub trait Clock {
    fn now_millis(&self) -> f64;
}

/// Monotonic time since the clock was created.
pub struct SystemClock {
    start: instant::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: instant::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Hand-advanced clock; clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    millis: Rc<Cell<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, millis: f64) {
        self.millis.set(millis);
    }

    pub fn advance(&self, millis: f64) {
        self.millis.set(self.millis.get() + millis);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> f64 {
        self.millis.get()
    }
}

/// Frames per second, recomputed each time the wall-clock second changes.
#[derive(Debug, Default)]
pub struct FrameRateCounter {
    frames: u32,
    window_start: Option<f64>,
    fps: f32,
}

impl FrameRateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_drawn(&mut self, now_millis: f64) {
        let Some(start) = self.window_start else {
            self.window_start = Some(now_millis);
            self.frames = 1;
            return;
        };
        if (now_millis / 1000.0).floor() != (start / 1000.0).floor() {
            let elapsed = now_millis - start;
            if elapsed > 0.0 {
                self.fps = ((self.frames as f64 / elapsed * 10000.0).round() / 10.0) as f32;
            }
            self.window_start = Some(now_millis);
            self.frames = 1;
        } else {
            self.frames += 1;
        }
    }

    pub fn frames_per_second(&self) -> f32 {
        self.fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_updates_when_the_second_rolls_over() {
        let mut counter = FrameRateCounter::new();
        for frame in 0..10 {
            counter.frame_drawn(frame as f64 * 100.0);
        }
        assert_eq!(counter.frames_per_second(), 0.0);
        counter.frame_drawn(1000.0);
        assert_eq!(counter.frames_per_second(), 10.0);
    }

    #[test]
    fn rate_is_rounded_to_one_decimal() {
        let mut counter = FrameRateCounter::new();
        counter.frame_drawn(0.0);
        counter.frame_drawn(500.0);
        counter.frame_drawn(700.0);
        counter.frame_drawn(1500.0);
        // 3 frames over 1500 ms.
        assert_eq!(counter.frames_per_second(), 2.0);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let view = clock.clone();
        clock.advance(250.0);
        assert_eq!(view.now_millis(), 250.0);
    }
}
