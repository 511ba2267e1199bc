use std::time::Instant;

use anyhow::{Context as AnyhowContext, Result};

use crate::compile::BUILTIN_EFFECT;
use crate::runtime::{time_source_for_mode, AbortFlag, BoxedTimeSource, FrameTick};
use crate::sink::{FrameSink, PngSequenceSink};
use crate::types::{RendererConfig, ShaderSource};

use super::context::{AdapterProfile, HeadlessContext};
use super::draw::encode_draw;
use super::pipeline::GpuProgram;
use super::readback::{ReadbackStats, TransferRing};
use super::target::RenderTarget;
use super::uniforms::{UniformSlot, UniformValues};

/// Totals reported once the session has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_drawn: u64,
    pub frames_written: u64,
    pub frames_skipped: u64,
    pub fence_stalls: u64,
    /// Adapter the frames were rendered on; `None` when no device was created.
    pub adapter: Option<AdapterProfile>,
    /// The loop stopped because of a GPU error or device loss.
    pub aborted: bool,
}

struct Capture {
    ring: TransferRing,
    sink: Box<dyn FrameSink>,
}

/// Everything a run owns on the GPU: device, render target, linked program,
/// and the readback ring when frames are captured.
pub struct RenderSession {
    context: HeadlessContext,
    target: RenderTarget,
    program: GpuProgram,
    capture: Option<Capture>,
    time: BoxedTimeSource,
    frames_drawn: u64,
    frames_written: u64,
}

impl RenderSession {
    /// Creates the headless device and links the configured shader. Frames
    /// are written as PNG files when `config.output` is set.
    pub fn new(config: &RendererConfig, abort: AbortFlag) -> Result<Self> {
        let sink = config
            .output
            .as_ref()
            .map(|spec| Box::new(PngSequenceSink::new(spec)) as Box<dyn FrameSink>);
        Self::with_sink(config, abort, sink)
    }

    /// Like [`RenderSession::new`] but hands collected frames to `sink`
    /// instead of the configured PNG directory.
    pub fn with_sink(
        config: &RendererConfig,
        abort: AbortFlag,
        sink: Option<Box<dyn FrameSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let context = HeadlessContext::new(config.backend, config.size, config.gpu_errors, abort)?;
        let target = RenderTarget::new(&context.device, config.size);

        let effect = match &config.shader {
            ShaderSource::Builtin => BUILTIN_EFFECT,
            ShaderSource::File { code, .. } => code.as_str(),
        };
        let program = GpuProgram::link(&context.device, effect).with_context(|| match &config.shader {
            ShaderSource::Builtin => "failed to build the built-in shader".to_string(),
            ShaderSource::File { path, .. } => {
                format!("failed to build shader {}", path.display())
            }
        })?;

        let capture = sink.map(|sink| Capture {
            ring: TransferRing::new(config.ring_depth, config.size),
            sink,
        });
        tracing::info!(
            size = %config.size,
            ring_depth = config.ring_depth,
            capture = capture.is_some(),
            "render session ready"
        );

        Ok(Self {
            context,
            target,
            program,
            capture,
            time: time_source_for_mode(config.time_mode),
            frames_drawn: 0,
            frames_written: 0,
        })
    }

    /// Whether the linked program reads `slot`.
    pub fn uses_uniform(&self, slot: UniformSlot) -> bool {
        self.program.bindings.location(slot).is_some()
    }

    /// Draws one frame, queues its copy, and collects the oldest copy that
    /// is due. Readback problems are logged and skip the affected frame.
    pub fn render_frame(&mut self, tick: FrameTick, now: Instant) {
        let device = &self.context.device;
        let queue = &self.context.queue;

        let sample = self.time.sample(tick.index, now);
        let values = UniformValues::new(sample, self.target.size);
        tracing::trace!(frame = tick.index, time = sample.seconds, phase = ?tick.phase, "drawing");

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("frame encoder"),
        });
        encode_draw(&mut encoder, queue, &self.program, &self.target, &values);

        let copy_slot = self.capture.as_mut().and_then(|capture| {
            capture
                .ring
                .encode_copy(device, &mut encoder, &self.target, tick.index)
                .inspect_err(|err| {
                    tracing::warn!(frame = tick.index, error = %err, "skipping frame copy");
                })
                .ok()
        });

        let submission = queue.submit(Some(encoder.finish()));
        self.frames_drawn += 1;

        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        if let Some(slot) = copy_slot {
            capture.ring.mark_submitted(queue, slot, submission);
        }
        match capture.ring.collect(device, tick.index, capture.sink.as_mut()) {
            Ok(Some(_)) => self.frames_written += 1,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(frame = tick.index, error = %err, "skipping frame readback");
            }
        }
    }

    /// Optionally collects the copies still in flight, then waits for the
    /// device to go idle before the resources are released.
    pub fn finish(mut self, drain: bool) -> RunSummary {
        if let Some(capture) = self.capture.as_mut() {
            if drain {
                for result in capture.ring.drain(&self.context.device, capture.sink.as_mut()) {
                    match result {
                        Ok(Some(_)) => self.frames_written += 1,
                        Ok(None) => {}
                        Err(err) => tracing::warn!(error = %err, "skipping drained frame"),
                    }
                }
            }
        }
        self.context.wait_idle();

        let stats = self
            .capture
            .as_ref()
            .map(|capture| capture.ring.stats())
            .unwrap_or_default();
        RunSummary {
            frames_drawn: self.frames_drawn,
            frames_written: self.frames_written,
            frames_skipped: stats.skipped,
            fence_stalls: stats.fence_stalls,
            adapter: Some(self.context.adapter_profile.clone()),
            aborted: false,
        }
    }

    /// Ring counters so far; `None` when frames are not captured.
    pub fn readback_stats(&self) -> Option<ReadbackStats> {
        self.capture.as_ref().map(|capture| capture.ring.stats())
    }
}
