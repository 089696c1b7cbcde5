// Configuration file support

use crate::backend::ModelVersion;
use crate::generation::{GenerationParams, ModelArchitecture, DEFAULT_STRENGTH};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtelierConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub generation: GenerationDefaults,
    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where generated images, thumbnails and metadata sidecars go
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationDefaults {
    /// Unset means the model family default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f64>,

    #[serde(default = "default_sampler")]
    pub sampler: String,

    #[serde(default = "default_scheduler")]
    pub scheduler: String,

    #[serde(default)]
    pub negative_prompt: String,

    #[serde(default = "default_clip_skip")]
    pub clip_skip: u32,

    /// Strength applied when a conditioned mode is entered with none set
    #[serde(default = "default_strength")]
    pub default_strength: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub version: ModelVersion,

    #[serde(default)]
    pub use_cpu: bool,
}

// Defaults

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_sampler() -> String {
    "dpmpp_2m".to_string()
}

fn default_scheduler() -> String {
    "karras".to_string()
}

fn default_clip_skip() -> u32 {
    1
}

fn default_strength() -> f64 {
    DEFAULT_STRENGTH
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            steps: None,
            cfg_scale: None,
            sampler: default_sampler(),
            scheduler: default_scheduler(),
            negative_prompt: String::new(),
            clip_skip: default_clip_skip(),
            default_strength: default_strength(),
        }
    }
}

impl AtelierConfig {
    /// Default location: `<config dir>/atelier/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("atelier").join("config.toml"))
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AtelierConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Load from `path`, or the default location; a missing file yields defaults
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            Self::from_file(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Initial params for a new session: model family defaults, then configured values
    pub fn initial_params(&self, architecture: ModelArchitecture) -> GenerationParams {
        let defaults = &self.generation;
        let mut params = GenerationParams::default();
        params.reset_to_defaults(architecture);
        if let Some(steps) = defaults.steps {
            params.steps = steps;
        }
        if let Some(cfg_scale) = defaults.cfg_scale {
            params.cfg_scale = cfg_scale;
        }
        params.sampler = defaults.sampler.clone();
        params.scheduler = defaults.scheduler.clone();
        params.negative_prompt = defaults.negative_prompt.clone();
        params.clip_skip = defaults.clip_skip;
        params
    }
}
