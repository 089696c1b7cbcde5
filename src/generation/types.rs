// Core types for generation sessions

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Strength applied when a conditioned mode becomes active with no user value
pub const DEFAULT_STRENGTH: f64 = 0.8;

pub const MAX_UPSCALE_FACTOR: f64 = 4.0;

/// Deepest CLIP skip; CLIP ViT-L has 12 encoder layers
pub const MAX_CLIP_SKIP: u32 = 12;

/// Longest side an upscale request may produce
pub const MAX_UPSCALE_SIDE: u32 = 4096;

/// Generation mode selected by the user
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Txt2Img,
    Img2Img,
    Inpaint,
    Upscale,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Txt2Img => "txt2img",
            GenerationMode::Img2Img => "img2img",
            GenerationMode::Inpaint => "inpaint",
            GenerationMode::Upscale => "upscale",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            GenerationMode::Txt2Img => "Text to Image",
            GenerationMode::Img2Img => "Image to Image",
            GenerationMode::Inpaint => "Inpainting",
            GenerationMode::Upscale => "Upscale",
        }
    }

    /// Modes that need an init image and use `strength`
    pub fn is_conditioned(&self) -> bool {
        !matches!(self, GenerationMode::Txt2Img)
    }

    /// Modes that pick up the last txt2img output when entered from txt2img
    pub fn accepts_hand_off(&self) -> bool {
        matches!(self, GenerationMode::Img2Img | GenerationMode::Inpaint)
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "txt2img" | "t2i" => Ok(GenerationMode::Txt2Img),
            "img2img" | "i2i" => Ok(GenerationMode::Img2Img),
            "inpaint" => Ok(GenerationMode::Inpaint),
            "upscale" => Ok(GenerationMode::Upscale),
            other => Err(Error::InvalidParameters(format!(
                "unknown generation mode '{}'",
                other
            ))),
        }
    }
}

/// Text-encoder topology of a model family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelArchitecture {
    /// One CLIP text encoder (SD 1.x / 2.x)
    SingleEncoder,
    /// Two text encoders, the second one pooled (SDXL)
    DualEncoder,
}

/// Parameters for one generation request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,

    #[serde(default)]
    pub negative_prompt: String,

    /// Number of denoising steps
    pub steps: u32,

    /// Classifier-free guidance scale
    pub cfg_scale: f64,

    /// Sampler name, resolved through the scheduler catalog
    pub sampler: String,

    /// Scheduler variant name (karras, exponential, ...)
    pub scheduler: String,

    /// Width in pixels (multiple of 8)
    pub width: u32,

    /// Height in pixels (multiple of 8)
    pub height: u32,

    /// Denoising strength for conditioned modes, unset until defaulted or chosen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,

    #[serde(default = "default_clip_skip")]
    pub clip_skip: u32,

    /// Random seed (None for random)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Scale applied to the init image in upscale mode
    #[serde(default = "default_upscale_factor")]
    pub upscale_factor: f64,
}

fn default_clip_skip() -> u32 {
    1
}

fn default_batch_size() -> u32 {
    1
}

fn default_upscale_factor() -> f64 {
    2.0
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 20,
            cfg_scale: 7.0,
            sampler: "dpmpp_2m".to_string(),
            scheduler: "karras".to_string(),
            width: 512,
            height: 512,
            strength: None,
            clip_skip: default_clip_skip(),
            seed: None,
            batch_size: default_batch_size(),
            upscale_factor: default_upscale_factor(),
        }
    }
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }

    pub fn with_sampler(mut self, sampler: impl Into<String>, scheduler: impl Into<String>) -> Self {
        self.sampler = sampler.into();
        self.scheduler = scheduler.into();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = Some(strength);
        self
    }

    /// Reset geometry and sampling defaults for a model family
    pub fn reset_to_defaults(&mut self, architecture: ModelArchitecture) {
        match architecture {
            ModelArchitecture::DualEncoder => {
                self.width = 1024;
                self.height = 1024;
                self.steps = 28;
                self.cfg_scale = 7.0;
            }
            ModelArchitecture::SingleEncoder => {
                self.width = 512;
                self.height = 512;
                self.steps = 20;
                self.cfg_scale = 7.0;
                self.scheduler = "karras".to_string();
            }
        }
    }

    /// Strength used when the request is assembled
    pub fn effective_strength(&self) -> f64 {
        self.strength.unwrap_or(DEFAULT_STRENGTH)
    }

    /// Check ranges and model alignment before anything is submitted
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.steps == 0 || self.steps > 100 {
            errors.push(format!("steps must be between 1 and 100, got {}", self.steps));
        }
        if !(self.cfg_scale > 0.0 && self.cfg_scale <= 30.0) {
            errors.push(format!("cfg scale must be in (0, 30], got {}", self.cfg_scale));
        }
        if self.width == 0 || self.width % 8 != 0 {
            errors.push(format!("width must be a positive multiple of 8, got {}", self.width));
        }
        if self.height == 0 || self.height % 8 != 0 {
            errors.push(format!("height must be a positive multiple of 8, got {}", self.height));
        }
        if let Some(strength) = self.strength {
            if !(0.0..=1.0).contains(&strength) {
                errors.push(format!("strength must be in [0, 1], got {}", strength));
            }
        }
        if !(1..=MAX_CLIP_SKIP).contains(&self.clip_skip) {
            errors.push(format!(
                "clip skip must be between 1 and {}, got {}",
                MAX_CLIP_SKIP, self.clip_skip
            ));
        }
        if self.batch_size == 0 {
            errors.push("batch size must be at least 1".to_string());
        }
        if !(1.0..=MAX_UPSCALE_FACTOR).contains(&self.upscale_factor) {
            errors.push(format!(
                "upscale factor must be in [1, {}], got {}",
                MAX_UPSCALE_FACTOR, self.upscale_factor
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidParameters(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("img2img".parse::<GenerationMode>().unwrap(), GenerationMode::Img2Img);
        assert_eq!(" Inpaint ".parse::<GenerationMode>().unwrap(), GenerationMode::Inpaint);
        assert!("outpaint".parse::<GenerationMode>().is_err());
    }

    #[test]
    fn test_mode_serde_names() {
        let json = serde_json::to_string(&GenerationMode::Txt2Img).unwrap();
        assert_eq!(json, "\"txt2img\"");
        let mode: GenerationMode = serde_json::from_str("\"upscale\"").unwrap();
        assert_eq!(mode, GenerationMode::Upscale);
    }

    #[test]
    fn test_conditioned_modes() {
        assert!(!GenerationMode::Txt2Img.is_conditioned());
        assert!(GenerationMode::Img2Img.is_conditioned());
        assert!(GenerationMode::Inpaint.is_conditioned());
        assert!(GenerationMode::Upscale.is_conditioned());
        assert!(!GenerationMode::Upscale.accepts_hand_off());
    }

    #[test]
    fn test_default_params_are_valid() {
        let params = GenerationParams::new("a lighthouse at dusk");
        assert!(params.validate().is_ok());
        assert_eq!(params.strength, None);
        assert_eq!(params.clip_skip, 1);
        assert_eq!(params.effective_strength(), DEFAULT_STRENGTH);
    }

    #[test]
    fn test_validation_collects_errors() {
        let params = GenerationParams {
            steps: 0,
            width: 500,
            strength: Some(1.5),
            clip_skip: 13,
            ..GenerationParams::default()
        };
        match params.validate() {
            Err(Error::InvalidParameters(msg)) => {
                assert!(msg.contains("clip skip"));
                assert!(msg.contains("steps"));
                assert!(msg.contains("width"));
                assert!(msg.contains("strength"));
            }
            other => panic!("expected InvalidParameters, got {:?}", other),
        }
    }

    #[test]
    fn test_upscale_factor_bounds() {
        for factor in [0.5, 4.5, f64::INFINITY, f64::NAN] {
            let params = GenerationParams {
                upscale_factor: factor,
                ..GenerationParams::default()
            };
            assert!(params.validate().is_err(), "factor {} accepted", factor);
        }
        let params = GenerationParams {
            upscale_factor: MAX_UPSCALE_FACTOR,
            ..GenerationParams::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_reset_to_defaults() {
        let mut params = GenerationParams::default();
        params.reset_to_defaults(ModelArchitecture::DualEncoder);
        assert_eq!((params.width, params.height, params.steps), (1024, 1024, 28));

        params.scheduler = "normal".to_string();
        params.reset_to_defaults(ModelArchitecture::SingleEncoder);
        assert_eq!((params.width, params.height, params.steps), (512, 512, 20));
        assert_eq!(params.scheduler, "karras");
    }

    #[test]
    fn test_params_deserialize_with_defaults() {
        let json = r#"{
            "prompt": "a cat",
            "steps": 25,
            "cfg_scale": 6.5,
            "sampler": "euler_a",
            "scheduler": "normal",
            "width": 768,
            "height": 512
        }"#;
        let params: GenerationParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.clip_skip, 1);
        assert_eq!(params.batch_size, 1);
        assert_eq!(params.strength, None);
        assert!(params.negative_prompt.is_empty());
    }
}
