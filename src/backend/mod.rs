// Candle backend: CLIP prompt encoders and the Stable Diffusion runtime

mod clip;
mod stable_diffusion;

pub use clip::ClipTextEncoder;
pub use stable_diffusion::StableDiffusionBackend;

use crate::generation::scheduler::{OverrideValue, SchedulerConfig};
use crate::generation::ModelArchitecture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable Diffusion model variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVersion {
    /// Stable Diffusion v1.5
    #[default]
    V1_5,
    /// Stable Diffusion v2.1
    V2_1,
    /// Stable Diffusion XL 1.0
    Xl,
    /// SDXL Turbo (single-step distilled)
    Turbo,
}

impl ModelVersion {
    pub fn repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "runwayml/stable-diffusion-v1-5",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
            Self::Xl => "stabilityai/stable-diffusion-xl-base-1.0",
            Self::Turbo => "stabilityai/sdxl-turbo",
        }
    }

    pub fn architecture(&self) -> ModelArchitecture {
        match self {
            Self::V1_5 | Self::V2_1 => ModelArchitecture::SingleEncoder,
            Self::Xl | Self::Turbo => ModelArchitecture::DualEncoder,
        }
    }

    /// VAE latent scale factor
    pub fn vae_scale(&self) -> f64 {
        match self {
            Self::Xl | Self::Turbo => 0.13025,
            _ => 0.18215,
        }
    }

    /// Tokenizer repo for the first text encoder
    pub fn tokenizer_repo(&self) -> &'static str {
        match self {
            Self::V1_5 | Self::V2_1 => "openai/clip-vit-base-patch32",
            Self::Xl | Self::Turbo => "openai/clip-vit-large-patch14",
        }
    }

    /// Tokenizer repo for the pooled second encoder
    pub fn tokenizer_2_repo(&self) -> Option<&'static str> {
        match self {
            Self::Xl | Self::Turbo => Some("laion/CLIP-ViT-bigG-14-laion2B-39B-b160k"),
            _ => None,
        }
    }

    /// Scheduler config the model was trained with; catalog overrides go on top
    pub fn base_scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::new();
        config.insert("num_train_timesteps".into(), OverrideValue::Int(1000));
        config.insert("beta_start".into(), OverrideValue::Float(0.00085));
        config.insert("beta_end".into(), OverrideValue::Float(0.012));
        config.insert("beta_schedule".into(), "scaled_linear".into());
        config.insert("steps_offset".into(), OverrideValue::Int(1));
        let prediction_type = match self {
            Self::V2_1 => "v_prediction",
            _ => "epsilon",
        };
        config.insert("prediction_type".into(), prediction_type.into());
        let spacing = match self {
            Self::Turbo => "trailing",
            _ => "leading",
        };
        config.insert("timestep_spacing".into(), spacing.into());
        config
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.repo())
    }
}
