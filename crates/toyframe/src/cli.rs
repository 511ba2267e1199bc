use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use renderer::{BackendChoice, GpuErrorPolicy, RenderSize};

/// Options left unset fall back to the `--config` file, then to built-in
/// defaults.
#[derive(Parser, Debug)]
#[command(
    name = "toyframe",
    author,
    version,
    about = "Render a ShaderToy-style fragment shader offscreen and capture frames as linear PNGs",
    after_help = "Only a single render pass is supported."
)]
pub struct Cli {
    /// Stop after rendering N frames (default: run until interrupted).
    #[arg(long, value_name = "N")]
    pub max_frames: Option<u64>,

    /// Write captured frames into DIR; created when missing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Fragment shader defining `void mainImage(out vec4, in vec2)`.
    #[arg(long = "fs", value_name = "PATH")]
    pub fragment_shader: Option<PathBuf>,

    /// Render target size (default 1920x1080).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<RenderSize>,

    /// Number of transfer buffers between a frame's copy and its readback.
    #[arg(long, value_name = "N")]
    pub ring_depth: Option<usize>,

    /// Graphics backend: `gl` (EGL, default), `vulkan`, `metal`, `dx12`, or `all`.
    #[arg(long, value_name = "BACKEND", value_parser = parse_backend)]
    pub backend: Option<BackendChoice>,

    /// Reaction to asynchronous GPU errors: `ignore`, `warn` (default), or `abort`.
    #[arg(long, value_name = "POLICY", value_parser = parse_gpu_errors)]
    pub gpu_errors: Option<GpuErrorPolicy>,

    /// Window over which the frame rate is reported (e.g. `5s`, `500ms`).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub fps_interval: Option<Duration>,

    /// Advance `iTime` by 1/FPS per frame instead of following the wall clock.
    #[arg(long, value_name = "FPS")]
    pub fixed_fps: Option<f32>,

    /// Collect the frames still in flight when the loop stops.
    #[arg(long)]
    pub drain: bool,

    /// TOML file supplying defaults for the options above.
    #[arg(long, env = "TOYFRAME_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<RenderSize, String> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{value}'; expected WIDTHxHEIGHT"))?;
    let width = w
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid width '{}'", w.trim()))?;
    let height = h
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid height '{}'", h.trim()))?;
    RenderSize::new(width, height).map_err(|err| err.to_string())
}

pub fn parse_backend(value: &str) -> Result<BackendChoice, String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "gl" | "gles" | "egl" | "opengl" => Ok(BackendChoice::Gl),
        "vulkan" | "vk" => Ok(BackendChoice::Vulkan),
        "metal" => Ok(BackendChoice::Metal),
        "dx12" | "d3d12" => Ok(BackendChoice::Dx12),
        "all" | "auto" => Ok(BackendChoice::All),
        "" => Err("backend must not be empty".to_string()),
        other => Err(format!(
            "unknown backend '{other}'; expected gl, vulkan, metal, dx12, or all"
        )),
    }
}

pub fn parse_gpu_errors(value: &str) -> Result<GpuErrorPolicy, String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "ignore" | "off" => Ok(GpuErrorPolicy::Ignore),
        "warn" => Ok(GpuErrorPolicy::Warn),
        "abort" | "fatal" => Ok(GpuErrorPolicy::Abort),
        other => Err(format!(
            "unknown GPU error policy '{other}'; expected ignore, warn, or abort"
        )),
    }
}

pub fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value.trim())
        .map_err(|err| format!("invalid duration '{value}': {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("1280x720").unwrap(), RenderSize::new(1280, 720).unwrap());
        assert_eq!(parse_size(" 64X32 ").unwrap(), RenderSize::new(64, 32).unwrap());
        assert!(parse_size("0x720").is_err());
        assert!(parse_size("1280").is_err());
        assert!(parse_size("wide x tall").is_err());
    }

    #[test]
    fn parses_backends_and_policies() {
        assert_eq!(parse_backend("GL").unwrap(), BackendChoice::Gl);
        assert_eq!(parse_backend("vk").unwrap(), BackendChoice::Vulkan);
        assert!(parse_backend("glide").is_err());
        assert_eq!(parse_gpu_errors("abort").unwrap(), GpuErrorPolicy::Abort);
        assert!(parse_gpu_errors("panic").is_err());
    }

    #[test]
    fn parses_full_command_line() {
        let cli = Cli::try_parse_from([
            "toyframe",
            "--max-frames=10",
            "--output-dir=out",
            "--fs=plasma.frag",
            "--size=320x200",
            "--ring-depth=4",
            "--backend=vulkan",
            "--gpu-errors=ignore",
            "--fps-interval=250ms",
            "--fixed-fps=30",
            "--drain",
        ])
        .unwrap();
        assert_eq!(cli.max_frames, Some(10));
        assert_eq!(cli.output_dir, Some(PathBuf::from("out")));
        assert_eq!(cli.fragment_shader, Some(PathBuf::from("plasma.frag")));
        assert_eq!(cli.size, Some(RenderSize::new(320, 200).unwrap()));
        assert_eq!(cli.ring_depth, Some(4));
        assert_eq!(cli.backend, Some(BackendChoice::Vulkan));
        assert_eq!(cli.gpu_errors, Some(GpuErrorPolicy::Ignore));
        assert_eq!(cli.fps_interval, Some(Duration::from_millis(250)));
        assert_eq!(cli.fixed_fps, Some(30.0));
        assert!(cli.drain);
    }

    #[test]
    fn rejects_malformed_frame_budget() {
        assert!(Cli::try_parse_from(["toyframe", "--max-frames=-1"]).is_err());
        assert!(Cli::try_parse_from(["toyframe", "--size=big"]).is_err());
    }
}
