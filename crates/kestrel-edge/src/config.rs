//! Pipeline configuration.
//!
//! Read once at startup; the driver's behaviour is a function of these flags
//! and its collaborators. Loaded from TOML, with optional environment
//! overrides:
//!
//! ```toml
//! mode = "continuous"        # or "inference_only"
//! instrumentation = false
//!
//! [arena]
//! base_bytes = 82944
//! scratch_bytes = 40960
//!
//! [input]
//! cols = 96
//! rows = 96
//! channels = 1
//!
//! [model]
//! path = "person_detect.kstl"
//! ```

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arena::MemoryCaps;
use crate::runtime::{SessionOptions, DEFAULT_ARENA_BYTES};

/// Whether the driver pulls frames from the image source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Capture, infer, respond, forever.
    #[default]
    Continuous,
    /// No capture; frames are supplied by the caller (benchmarking).
    InferenceOnly,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Continuous => "continuous",
            RunMode::InferenceOnly => "inference_only",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "continuous" => Some(RunMode::Continuous),
            "inference_only" | "cli_only" => Some(RunMode::InferenceOnly),
            _ => None,
        }
    }
}

/// Arena sizing: `base_bytes` for the model's tensors plus an optional
/// platform scratch allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaConfig {
    #[serde(default = "default_base_bytes")]
    pub base_bytes: usize,

    /// Extra accelerator scratch; zero on targets that need none.
    #[serde(default)]
    pub scratch_bytes: usize,

    /// Restrict the arena to internal memory.
    #[serde(default = "default_internal")]
    pub internal: bool,
}

impl ArenaConfig {
    pub fn total_bytes(&self) -> usize {
        self.base_bytes + self.scratch_bytes
    }

    pub fn caps(&self) -> MemoryCaps {
        if self.internal {
            MemoryCaps::INTERNAL_8BIT
        } else {
            MemoryCaps::ANY_8BIT
        }
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            base_bytes: default_base_bytes(),
            scratch_bytes: 0,
            internal: default_internal(),
        }
    }
}

/// Frame geometry the model expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_side")]
    pub cols: usize,
    #[serde(default = "default_side")]
    pub rows: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
}

impl InputConfig {
    /// Samples in one raw frame.
    pub fn sample_count(&self) -> usize {
        self.cols * self.rows * self.channels
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            cols: default_side(),
            rows: default_side(),
            channels: default_channels(),
        }
    }
}

/// Where the model comes from when it isn't embedded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: RunMode,

    /// Per-kernel timing and energy reports.
    #[serde(default)]
    pub instrumentation: bool,

    #[serde(default)]
    pub arena: ArenaConfig,

    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub model: ModelConfig,
}

fn default_base_bytes() -> usize {
    DEFAULT_ARENA_BYTES
}

fn default_internal() -> bool {
    true
}

fn default_side() -> usize {
    96
}

fn default_channels() -> usize {
    1
}

impl PipelineConfig {
    /// Load from a TOML file. Missing files and parse errors are returned,
    /// never replaced by defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse { path: Some(path.to_path_buf()), message },
            other => other,
        })
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse { path: None, message: e.to_string() })
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Apply `KESTREL_*` environment overrides. Unparseable values are
    /// ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("KESTREL_MODE") {
            match RunMode::from_str(&val) {
                Some(mode) => self.mode = mode,
                None => tracing::warn!("ignoring KESTREL_MODE={:?}", val),
            }
        }
        if let Ok(val) = env::var("KESTREL_INSTRUMENTATION") {
            match parse_flag(&val) {
                Some(b) => self.instrumentation = b,
                None => tracing::warn!("ignoring KESTREL_INSTRUMENTATION={:?}", val),
            }
        }
        if let Ok(val) = env::var("KESTREL_ARENA_BASE_BYTES") {
            match val.trim().parse::<usize>() {
                Ok(n) => self.arena.base_bytes = n,
                Err(_) => tracing::warn!("ignoring KESTREL_ARENA_BASE_BYTES={:?}", val),
            }
        }
        if let Ok(val) = env::var("KESTREL_ARENA_SCRATCH_BYTES") {
            match val.trim().parse::<usize>() {
                Ok(n) => self.arena.scratch_bytes = n,
                Err(_) => tracing::warn!("ignoring KESTREL_ARENA_SCRATCH_BYTES={:?}", val),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena.base_bytes == 0 {
            return Err(ConfigError::Invalid("arena.base_bytes must be greater than 0".into()));
        }
        if self.arena.base_bytes.checked_add(self.arena.scratch_bytes).is_none() {
            return Err(ConfigError::Invalid("arena size overflows".into()));
        }
        if self.input.sample_count() == 0 {
            return Err(ConfigError::Invalid(format!(
                "input geometry {}x{}x{} has no samples",
                self.input.cols, self.input.rows, self.input.channels
            )));
        }
        Ok(())
    }

    /// Session settings derived from this configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::new(self.arena.total_bytes())
            .with_caps(self.arena.caps())
            .with_profiling(self.instrumentation)
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Configuration failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {message}", .path.display())]
    Read { path: PathBuf, message: String },

    #[error("failed to parse config{}: {message}", .path.as_ref().map(|p| format!(" '{}'", p.display())).unwrap_or_default())]
    Parse { path: Option<PathBuf>, message: String },

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
