use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::TimeMode;

/// Snapshot of the time state supplied to the shader uniforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSample {
    /// Elapsed time in seconds (`iTime`).
    pub seconds: f32,
    /// 1-based running frame count (`iFrame`).
    pub frame_index: u64,
}

impl TimeSample {
    pub fn new(seconds: f32, frame_index: u64) -> Self {
        Self {
            seconds,
            frame_index,
        }
    }
}

/// Abstraction over where time values originate from.
pub trait TimeSource {
    /// Produces the time sample for `frame_index`, observed at `now`.
    fn sample(&mut self, frame_index: u64, now: Instant) -> TimeSample;
}

/// Time source backed by the monotonic clock, anchored at the first frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicTimeSource {
    origin: Option<Instant>,
}

impl MonotonicTimeSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeSource for MonotonicTimeSource {
    fn sample(&mut self, frame_index: u64, now: Instant) -> TimeSample {
        let origin = *self.origin.get_or_insert(now);
        let elapsed = now.saturating_duration_since(origin);
        TimeSample::new(elapsed.as_secs_f32(), frame_index)
    }
}

/// Time source that advances by a fixed step per frame.
#[derive(Debug, Clone, Copy)]
pub struct FixedStepTimeSource {
    fps: f32,
}

impl FixedStepTimeSource {
    pub fn new(fps: f32) -> Self {
        Self { fps }
    }
}

impl TimeSource for FixedStepTimeSource {
    fn sample(&mut self, frame_index: u64, _now: Instant) -> TimeSample {
        let seconds = frame_index.saturating_sub(1) as f64 / f64::from(self.fps);
        TimeSample::new(seconds as f32, frame_index)
    }
}

pub type BoxedTimeSource = Box<dyn TimeSource>;

/// Builds the time source matching the configured mode.
pub fn time_source_for_mode(mode: TimeMode) -> BoxedTimeSource {
    match mode {
        TimeMode::Monotonic => Box::new(MonotonicTimeSource::new()),
        TimeMode::FixedStep { fps } => Box::new(FixedStepTimeSource::new(fps)),
    }
}

/// Shared flag raised by fatal GPU callbacks; checked at the top of the loop.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Whether the readback ring has filled yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Fewer than `ring_depth` frames issued; nothing is old enough to read.
    Warmup,
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    /// 1-based frame count.
    pub index: u64,
    pub phase: LoopPhase,
}

/// Drives the frame counter and decides when the loop stops.
#[derive(Debug)]
pub struct FrameLoop {
    max_frames: Option<u64>,
    ring_depth: u64,
    frame_count: u64,
    abort: AbortFlag,
}

impl FrameLoop {
    pub fn new(max_frames: Option<u64>, ring_depth: usize, abort: AbortFlag) -> Self {
        Self {
            max_frames,
            ring_depth: ring_depth as u64,
            frame_count: 0,
            abort,
        }
    }

    /// Advances to the next frame, or returns `None` once the budget is spent
    /// or the abort flag is up.
    pub fn next_frame(&mut self) -> Option<FrameTick> {
        if self.abort.is_raised() {
            return None;
        }
        if self.max_frames.is_some_and(|max| self.frame_count >= max) {
            return None;
        }
        self.frame_count += 1;
        let phase = if self.frame_count < self.ring_depth {
            LoopPhase::Warmup
        } else {
            LoopPhase::Steady
        };
        Some(FrameTick {
            index: self.frame_count,
            phase,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn aborted(&self) -> bool {
        self.abort.is_raised()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReport {
    pub frames: u32,
    pub seconds: f32,
    pub fps: f32,
}

/// Counts frames over rolling windows of wall time.
#[derive(Debug)]
pub struct FpsCounter {
    interval: Duration,
    window_start: Option<Instant>,
    frames: u32,
}

impl FpsCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            frames: 0,
        }
    }

    /// Opens the first window; later calls are no-ops.
    pub fn start(&mut self, now: Instant) {
        self.window_start.get_or_insert(now);
    }

    /// Records a finished frame and closes the window once `interval` passed.
    pub fn record(&mut self, now: Instant) -> Option<FpsReport> {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.interval {
            return None;
        }
        let seconds = elapsed.as_secs_f32();
        let report = FpsReport {
            frames: self.frames,
            seconds,
            fps: self.frames as f32 / seconds,
        };
        self.window_start = Some(now);
        self.frames = 0;
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_yields_no_frames() {
        let mut frames = FrameLoop::new(Some(0), 3, AbortFlag::new());
        assert!(frames.next_frame().is_none());
        assert_eq!(frames.frame_count(), 0);
    }

    #[test]
    fn phases_switch_at_ring_depth() {
        let mut frames = FrameLoop::new(Some(5), 3, AbortFlag::new());
        let ticks: Vec<_> = std::iter::from_fn(|| frames.next_frame()).collect();
        let indices: Vec<_> = ticks.iter().map(|tick| tick.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert_eq!(ticks[0].phase, LoopPhase::Warmup);
        assert_eq!(ticks[1].phase, LoopPhase::Warmup);
        assert_eq!(ticks[2].phase, LoopPhase::Steady);
        assert_eq!(ticks[4].phase, LoopPhase::Steady);
    }

    #[test]
    fn abort_stops_unbounded_loop() {
        let abort = AbortFlag::new();
        let mut frames = FrameLoop::new(None, 3, abort.clone());
        assert!(frames.next_frame().is_some());
        assert!(frames.next_frame().is_some());
        abort.raise();
        assert!(frames.next_frame().is_none());
        assert!(frames.aborted());
        assert_eq!(frames.frame_count(), 2);
    }

    #[test]
    fn monotonic_time_starts_at_first_frame() {
        let mut source = MonotonicTimeSource::new();
        let origin = Instant::now();
        let first = source.sample(1, origin);
        assert_eq!(first.seconds, 0.0);
        let later = source.sample(2, origin + Duration::from_millis(500));
        assert!((later.seconds - 0.5).abs() < 1e-4);
        assert_eq!(later.frame_index, 2);
    }

    #[test]
    fn fixed_step_is_wall_clock_independent() {
        let mut source = FixedStepTimeSource::new(60.0);
        let now = Instant::now();
        assert_eq!(source.sample(1, now).seconds, 0.0);
        assert!((source.sample(61, now).seconds - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fps_counter_reports_per_window() {
        let mut counter = FpsCounter::new(Duration::from_secs(5));
        let start = Instant::now();
        counter.start(start);
        for frame in 1..10 {
            assert!(counter
                .record(start + Duration::from_millis(500 * frame))
                .is_none());
        }
        let report = counter
            .record(start + Duration::from_secs(5))
            .expect("window closed");
        assert_eq!(report.frames, 10);
        assert!((report.fps - 2.0).abs() < 1e-3);
        assert!(counter.record(start + Duration::from_secs(6)).is_none());
    }
}
