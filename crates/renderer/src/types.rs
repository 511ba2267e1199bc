use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Default render target size, matching a 1080p capture.
pub const DEFAULT_SIZE: (u32, u32) = (1920, 1080);

/// Default depth of the transfer-buffer ring.
pub const DEFAULT_RING_DEPTH: usize = 3;

/// Smallest ring that still overlaps a copy with a collection.
pub const MIN_RING_DEPTH: usize = 2;

/// Default window over which frame rate is averaged.
pub const DEFAULT_FPS_INTERVAL: Duration = Duration::from_secs(5);

/// Stem used for output files when the built-in shader is rendered.
pub const BUILTIN_SHADER_STEM: &str = "frame";

/// Fixed pixel dimensions of the offscreen render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            anyhow::bail!("render size must be greater than zero (got {width}x{height})");
        }
        Ok(Self { width, height })
    }
}

impl Default for RenderSize {
    fn default() -> Self {
        Self {
            width: DEFAULT_SIZE.0,
            height: DEFAULT_SIZE.1,
        }
    }
}

impl fmt::Display for RenderSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// GPU backend the headless context should be created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// OpenGL through EGL; needs no window system.
    #[default]
    Gl,
    Vulkan,
    Metal,
    Dx12,
    /// Let wgpu pick whichever backend offers an adapter first.
    All,
}

impl BackendChoice {
    pub(crate) fn to_wgpu(self) -> wgpu::Backends {
        match self {
            BackendChoice::Gl => wgpu::Backends::GL,
            BackendChoice::Vulkan => wgpu::Backends::VULKAN,
            BackendChoice::Metal => wgpu::Backends::METAL,
            BackendChoice::Dx12 => wgpu::Backends::DX12,
            BackendChoice::All => wgpu::Backends::all(),
        }
    }
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendChoice::Gl => f.write_str("gl"),
            BackendChoice::Vulkan => f.write_str("vulkan"),
            BackendChoice::Metal => f.write_str("metal"),
            BackendChoice::Dx12 => f.write_str("dx12"),
            BackendChoice::All => f.write_str("all"),
        }
    }
}

/// How errors raised asynchronously by the graphics API are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuErrorPolicy {
    /// Log at debug level and keep rendering.
    Ignore,
    /// Log at warn level and keep rendering.
    #[default]
    Warn,
    /// Log at error level and stop the render loop at the next frame boundary.
    Abort,
}

impl fmt::Display for GpuErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuErrorPolicy::Ignore => f.write_str("ignore"),
            GpuErrorPolicy::Warn => f.write_str("warn"),
            GpuErrorPolicy::Abort => f.write_str("abort"),
        }
    }
}

/// Where the fragment shader text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    /// The built-in animated gradient.
    Builtin,
    /// User supplied effect code, already read from disk.
    File { path: PathBuf, code: String },
}

impl ShaderSource {
    /// Stem used when naming captured frames.
    ///
    /// The stem is the file name up to its first `.`, so `waves.frag.glsl`
    /// becomes `waves`.
    pub fn stem(&self) -> String {
        match self {
            ShaderSource::Builtin => BUILTIN_SHADER_STEM.to_string(),
            ShaderSource::File { path, .. } => path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.split('.').next().unwrap_or(name))
                .filter(|stem| !stem.is_empty())
                .unwrap_or(BUILTIN_SHADER_STEM)
                .to_string(),
        }
    }
}

/// Destination for captured frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    /// Existing directory the PNG files are written into.
    pub directory: PathBuf,
    /// File name prefix; frames are named `<stem>_%04d.png`.
    pub stem: String,
}

/// How `iTime` advances between frames.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TimeMode {
    /// Seconds elapsed on the monotonic clock since the first frame.
    #[default]
    Monotonic,
    /// Fixed increments of `1 / fps` per frame, independent of wall time.
    FixedStep { fps: f32 },
}

/// Immutable configuration passed to the renderer at start-up.
///
/// `RendererConfig` mirrors CLI flags: which shader to compile, how large the
/// offscreen target is, how deep the readback ring runs, and where (if
/// anywhere) captured frames go.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Render target size in pixels.
    pub size: RenderSize,
    /// Fragment shader to render.
    pub shader: ShaderSource,
    /// Stop after this many frames; `None` renders until aborted.
    pub max_frames: Option<u64>,
    /// Capture destination; `None` disables readback entirely.
    pub output: Option<OutputSpec>,
    /// Number of transfer buffers in the readback ring.
    pub ring_depth: usize,
    /// Backend used to create the headless device.
    pub backend: BackendChoice,
    /// Reaction to asynchronous graphics API errors.
    pub gpu_errors: GpuErrorPolicy,
    /// Window over which FPS is reported.
    pub fps_interval: Duration,
    /// Source of `iTime`.
    pub time_mode: TimeMode,
    /// Collect frames still in flight when the loop ends.
    pub drain_on_exit: bool,
}

impl RendererConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ring_depth < MIN_RING_DEPTH {
            anyhow::bail!(
                "ring depth must be at least {MIN_RING_DEPTH} (got {})",
                self.ring_depth
            );
        }
        if let TimeMode::FixedStep { fps } = self.time_mode {
            if !(fps.is_finite() && fps > 0.0) {
                anyhow::bail!("fixed time step needs a positive fps (got {fps})");
            }
        }
        if self.fps_interval.is_zero() {
            anyhow::bail!("fps interval must be non-zero");
        }
        Ok(())
    }
}

impl Default for RendererConfig {
    /// Built-in shader, 1080p, unbounded, no capture.
    fn default() -> Self {
        Self {
            size: RenderSize::default(),
            shader: ShaderSource::Builtin,
            max_frames: None,
            output: None,
            ring_depth: DEFAULT_RING_DEPTH,
            backend: BackendChoice::default(),
            gpu_errors: GpuErrorPolicy::default(),
            fps_interval: DEFAULT_FPS_INTERVAL,
            time_mode: TimeMode::default(),
            drain_on_exit: false,
        }
    }
}
