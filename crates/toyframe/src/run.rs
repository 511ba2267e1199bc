use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use renderer::{OutputSpec, Renderer, RendererConfig, ShaderSource, TimeMode, ENTRY_MARKER};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::{FileConfig, Settings};

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn run(cli: Cli) -> Result<()> {
    let file = match cli.config.as_deref() {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(&cli, file)?;
    let config = build_renderer_config(&settings)?;
    config.validate()?;

    tracing::info!(
        size = %config.size,
        shader = %config.shader.stem(),
        max_frames = ?config.max_frames,
        output = ?config.output.as_ref().map(|spec| spec.directory.display().to_string()),
        ring_depth = config.ring_depth,
        backend = %config.backend,
        gpu_errors = %config.gpu_errors,
        "starting toyframe"
    );

    let summary = Renderer::new(config).run()?;
    tracing::info!(
        adapter = summary.adapter.as_ref().map_or("none", |adapter| adapter.name.as_str()),
        drawn = summary.frames_drawn,
        written = summary.frames_written,
        skipped = summary.frames_skipped,
        fence_stalls = summary.fence_stalls,
        "render finished"
    );
    if summary.aborted {
        anyhow::bail!("render loop stopped by a GPU error");
    }
    Ok(())
}

/// Checks the output directory and shader file, returning the config the
/// renderer runs with. Nothing here touches the GPU.
pub fn build_renderer_config(settings: &Settings) -> Result<RendererConfig> {
    let output_dir = settings
        .output_dir
        .as_deref()
        .map(prepare_output_dir)
        .transpose()?;
    let shader = load_shader(settings.fragment_shader.as_deref())?;
    let output = output_dir.map(|directory| OutputSpec {
        directory,
        stem: shader.stem(),
    });

    Ok(RendererConfig {
        size: settings.size,
        shader,
        max_frames: settings.max_frames,
        output,
        ring_depth: settings.ring_depth,
        backend: settings.backend,
        gpu_errors: settings.gpu_errors,
        fps_interval: settings.fps_interval,
        time_mode: match settings.fixed_fps {
            Some(fps) => TimeMode::FixedStep { fps },
            None => TimeMode::Monotonic,
        },
        drain_on_exit: settings.drain,
    })
}

fn prepare_output_dir(dir: &Path) -> Result<PathBuf> {
    if dir.exists() {
        if !dir.is_dir() {
            anyhow::bail!("output path is not a directory: {}", dir.display());
        }
    } else {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        tracing::info!(dir = %dir.display(), "created output directory");
    }
    Ok(dir.to_path_buf())
}

fn load_shader(path: Option<&Path>) -> Result<ShaderSource> {
    let Some(path) = path else {
        return Ok(ShaderSource::Builtin);
    };
    let code = fs::read_to_string(path)
        .with_context(|| format!("failed to read fragment shader {}", path.display()))?;
    if !code.contains(ENTRY_MARKER) {
        anyhow::bail!(
            "fragment shader {} does not contain '{ENTRY_MARKER}'",
            path.display()
        );
    }
    Ok(ShaderSource::File {
        path: path.to_path_buf(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn settings(args: &[&str]) -> Settings {
        let mut argv = vec!["toyframe"];
        argv.extend_from_slice(args);
        Settings::resolve(&Cli::try_parse_from(argv).unwrap(), FileConfig::default()).unwrap()
    }

    #[test]
    fn builtin_shader_names_frames_after_default_stem() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("frames");
        let config =
            build_renderer_config(&settings(&[&format!("--output-dir={}", out.display())]))
                .unwrap();
        assert!(out.is_dir());
        assert_eq!(config.shader, ShaderSource::Builtin);
        assert_eq!(config.output.unwrap().stem, "frame");
    }

    #[test]
    fn shader_file_supplies_stem() {
        let dir = tempdir().unwrap();
        let shader = dir.path().join("plasma.toy.frag");
        fs::write(&shader, "void mainImage(out vec4 c, in vec2 p) { c = vec4(1.0); }\n").unwrap();
        let config = build_renderer_config(&settings(&[
            &format!("--fs={}", shader.display()),
            &format!("--output-dir={}", dir.path().display()),
            "--fixed-fps=30",
        ]))
        .unwrap();
        assert_eq!(config.output.unwrap().stem, "plasma");
        assert_eq!(config.time_mode, TimeMode::FixedStep { fps: 30.0 });
    }

    #[test]
    fn shader_without_entry_point_is_rejected() {
        let dir = tempdir().unwrap();
        let shader = dir.path().join("main.frag");
        fs::write(&shader, "void main() {}\n").unwrap();
        let err = build_renderer_config(&settings(&[&format!("--fs={}", shader.display())]))
            .unwrap_err();
        assert!(err.to_string().contains("void mainImage"));
    }

    #[test]
    fn file_in_place_of_output_dir_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("taken");
        fs::write(&file, "").unwrap();
        let err = build_renderer_config(&settings(&[&format!("--output-dir={}", file.display())]))
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn missing_shader_is_rejected() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.frag");
        assert!(
            build_renderer_config(&settings(&[&format!("--fs={}", missing.display())])).is_err()
        );
    }
}
