//! Headless renderer for ShaderToy-style fragment shaders.
//!
//! Frames are drawn into an offscreen texture and, when capture is enabled,
//! copied into a ring of transfer buffers that is read back a few frames
//! later so the CPU never waits on the copy it just queued:
//!
//! ```text
//!   toyframe CLI
//!        │ RendererConfig
//!        ▼
//!   Renderer::run ──▶ FrameLoop ──▶ RenderSession::render_frame()
//!                                     │ draw + copy into slot f % N
//!                                     └─▶ map slot (f + 1) % N ──▶ FrameSink
//! ```
//!
//! Effect code that defines `mainImage` is wrapped with a prelude declaring
//! `iTime`, `iResolution`, and `iFrame`; complete programs are compiled as-is.
//! Captured frames are written as linear PNG files named after the shader.

mod compile;
mod gpu;
mod runtime;
mod sink;
mod types;

use std::time::Instant;

use anyhow::Result;

pub use compile::{
    assemble_fragment, AssembledFragment, ProgramError, UniformReflection, BUILTIN_EFFECT,
    ENTRY_MARKER, HEADER, TRAILER,
};
pub use gpu::{
    padded_row_bytes, AdapterProfile, Collection, ReadbackError, ReadbackStats, RenderSession,
    RingSchedule, RunSummary, UniformBindings, UniformLocation, UniformSlot, UniformValues,
};
pub use runtime::{
    time_source_for_mode, AbortFlag, BoxedTimeSource, FixedStepTimeSource, FpsCounter, FpsReport,
    FrameLoop, FrameTick, LoopPhase, MonotonicTimeSource, TimeSample, TimeSource,
};
pub use sink::{frame_file_name, write_linear_png, FramePixels, FrameSink, PngSequenceSink, SinkError};
pub use types::{
    BackendChoice, GpuErrorPolicy, OutputSpec, RenderSize, RendererConfig, ShaderSource, TimeMode,
    BUILTIN_SHADER_STEM, DEFAULT_FPS_INTERVAL, DEFAULT_RING_DEPTH, DEFAULT_SIZE, MIN_RING_DEPTH,
};

/// Entry point that runs the frame loop for one configuration.
pub struct Renderer {
    config: RendererConfig,
    abort: AbortFlag,
}

impl Renderer {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            config,
            abort: AbortFlag::new(),
        }
    }

    /// Handle that stops the loop at the next frame boundary when raised.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Renders until the frame budget is spent or the loop is aborted.
    ///
    /// Fails if the device cannot be created or the shader does not build.
    /// Per-frame readback problems are logged and counted in the summary.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.config.validate()?;
        if self.config.max_frames == Some(0) {
            tracing::info!("frame budget is zero; nothing to render");
            return Ok(RunSummary::default());
        }

        let mut session = RenderSession::new(&self.config, self.abort.clone())?;
        let mut frames = FrameLoop::new(
            self.config.max_frames,
            self.config.ring_depth,
            self.abort.clone(),
        );
        let mut fps = FpsCounter::new(self.config.fps_interval);
        fps.start(Instant::now());

        while let Some(tick) = frames.next_frame() {
            session.render_frame(tick, Instant::now());
            if let Some(report) = fps.record(Instant::now()) {
                tracing::info!(
                    frames = report.frames,
                    seconds = format_args!("{:.3}", report.seconds),
                    fps = format_args!("{:.3}", report.fps),
                    "frame rate"
                );
            }
        }

        let aborted = frames.aborted();
        if aborted {
            tracing::warn!(frame = frames.frame_count(), "render loop aborted");
        }
        if let Some(stats) = session.readback_stats() {
            tracing::debug!(
                copies = stats.copies,
                collected = stats.collected,
                skipped = stats.skipped,
                "readback ring before shutdown"
            );
        }
        let mut summary = session.finish(self.config.drain_on_exit);
        summary.aborted = aborted;
        Ok(summary)
    }
}
