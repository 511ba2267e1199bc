//! Optional TOML file that supplies defaults for the command-line options.
//!
//! ```toml
//! max_frames = 600
//! output_dir = "frames"
//! fs = "shaders/plasma.frag"
//! size = "1280x720"
//! ring_depth = 3
//! backend = "gl"
//! gpu_errors = "warn"
//! fps_interval = "5s"
//! fixed_fps = 60.0
//! drain = true
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use renderer::{
    BackendChoice, GpuErrorPolicy, RenderSize, DEFAULT_FPS_INTERVAL, DEFAULT_RING_DEPTH,
};
use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::cli::{self, Cli};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub max_frames: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub fs: Option<PathBuf>,
    pub size: Option<String>,
    pub ring_depth: Option<usize>,
    pub backend: Option<String>,
    pub gpu_errors: Option<String>,
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    pub fps_interval: Option<Duration>,
    pub fixed_fps: Option<f32>,
    pub drain: Option<bool>,
}

impl FileConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        for path in [&mut self.output_dir, &mut self.fs].into_iter().flatten() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

/// Options after merging the command line over the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub max_frames: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub fragment_shader: Option<PathBuf>,
    pub size: RenderSize,
    pub ring_depth: usize,
    pub backend: BackendChoice,
    pub gpu_errors: GpuErrorPolicy,
    pub fps_interval: Duration,
    pub fixed_fps: Option<f32>,
    pub drain: bool,
}

impl Settings {
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let size = match (cli.size, file.size.as_deref()) {
            (Some(size), _) => size,
            (None, Some(text)) => cli::parse_size(text).map_err(ConfigError::Invalid)?,
            (None, None) => RenderSize::default(),
        };
        let backend = match (cli.backend, file.backend.as_deref()) {
            (Some(backend), _) => backend,
            (None, Some(text)) => cli::parse_backend(text).map_err(ConfigError::Invalid)?,
            (None, None) => BackendChoice::default(),
        };
        let gpu_errors = match (cli.gpu_errors, file.gpu_errors.as_deref()) {
            (Some(policy), _) => policy,
            (None, Some(text)) => cli::parse_gpu_errors(text).map_err(ConfigError::Invalid)?,
            (None, None) => GpuErrorPolicy::default(),
        };

        Ok(Self {
            max_frames: cli.max_frames.or(file.max_frames),
            output_dir: cli.output_dir.clone().or(file.output_dir),
            fragment_shader: cli.fragment_shader.clone().or(file.fs),
            size,
            ring_depth: cli.ring_depth.or(file.ring_depth).unwrap_or(DEFAULT_RING_DEPTH),
            backend,
            gpu_errors,
            fps_interval: cli
                .fps_interval
                .or(file.fps_interval)
                .unwrap_or(DEFAULT_FPS_INTERVAL),
            fixed_fps: cli.fixed_fps.or(file.fixed_fps),
            drain: cli.drain || file.drain.unwrap_or(false),
        })
    }
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u64::try_from(v)
                .map(|secs| Some(Duration::from_secs(secs)))
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Duration::try_from_secs_f64(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration {v}: {err}")))
        }
    }

    deserializer.deserialize_any(Visitor)
}
