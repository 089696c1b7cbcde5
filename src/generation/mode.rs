// Generation mode state machine and history

use super::store::SavedImage;
use super::types::{GenerationMode, GenerationParams, ModelArchitecture, DEFAULT_STRENGTH};
use crate::{Error, Result};
use chrono::{DateTime, Local};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

/// Outcome of a mode transition, turned into notifications by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: GenerationMode,
    pub to: GenerationMode,
    /// The last txt2img output was copied into the init image
    pub handed_off: bool,
    /// `strength` was unset and got the default value
    pub strength_defaulted: bool,
}

/// One completed generation, immutable once recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    #[serde(skip)]
    pub images: Vec<RgbImage>,
    pub params: GenerationParams,
    pub seed: u64,
    pub model: String,
    pub created_at: DateTime<Local>,
    pub artifacts: Vec<SavedImage>,
}

/// Everything the completion callback needs to know about a finished run
#[derive(Debug, Clone)]
pub struct CompletedGeneration {
    pub images: Vec<RgbImage>,
    /// Snapshot of the params the request was assembled from
    pub params: GenerationParams,
    pub seed: u64,
    pub model: String,
    pub artifacts: Vec<SavedImage>,
}

/// Mode, conditioning inputs, active params and history of one session
#[derive(Debug, Clone)]
pub struct ModeState {
    current_mode: GenerationMode,
    previous_mode: Option<GenerationMode>,
    init_image: Option<RgbImage>,
    mask: Option<GrayImage>,
    last_generated_image: Option<RgbImage>,
    last_batch: Vec<RgbImage>,
    history: Vec<HistoryEntry>,
    params: GenerationParams,
    default_strength: f64,
    next_history_id: u64,
}

impl ModeState {
    pub fn new(initial_mode: GenerationMode, params: GenerationParams) -> Self {
        Self {
            current_mode: initial_mode,
            previous_mode: None,
            init_image: None,
            mask: None,
            last_generated_image: None,
            last_batch: Vec::new(),
            history: Vec::new(),
            params,
            default_strength: DEFAULT_STRENGTH,
            next_history_id: 1,
        }
    }

    pub fn with_default_strength(mut self, strength: f64) -> Self {
        self.default_strength = strength;
        self
    }

    pub fn current_mode(&self) -> GenerationMode {
        self.current_mode
    }

    pub fn previous_mode(&self) -> Option<GenerationMode> {
        self.previous_mode
    }

    pub fn init_image(&self) -> Option<&RgbImage> {
        self.init_image.as_ref()
    }

    pub fn mask(&self) -> Option<&GrayImage> {
        self.mask.as_ref()
    }

    pub fn last_generated_image(&self) -> Option<&RgbImage> {
        self.last_generated_image.as_ref()
    }

    pub fn last_batch(&self) -> &[RgbImage] {
        &self.last_batch
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut GenerationParams {
        &mut self.params
    }

    /// Switch modes, handing off the last txt2img output and defaulting strength
    pub fn transition(&mut self, new_mode: GenerationMode) -> Transition {
        let from = self.current_mode;

        let mut handed_off = false;
        if from == GenerationMode::Txt2Img && new_mode.accepts_hand_off() {
            if let Some(image) = &self.last_generated_image {
                self.init_image = Some(image.clone());
                handed_off = true;
            }
        }

        self.previous_mode = Some(from);
        self.current_mode = new_mode;

        let mut strength_defaulted = false;
        if new_mode.is_conditioned() && self.params.strength.is_none() {
            self.params.strength = Some(self.default_strength);
            strength_defaulted = true;
        }

        tracing::debug!(
            "Mode {} -> {} (hand-off: {}, strength defaulted: {})",
            from,
            new_mode,
            handed_off,
            strength_defaulted
        );

        Transition {
            from,
            to: new_mode,
            handed_off,
            strength_defaulted,
        }
    }

    /// Record a finished run; an empty batch changes nothing
    pub fn on_generation_complete(&mut self, completed: CompletedGeneration) -> Option<&HistoryEntry> {
        let first = completed.images.first()?.clone();

        self.last_generated_image = Some(first);
        self.last_batch = completed.images.clone();

        let id = self.next_history_id;
        self.next_history_id += 1;
        self.history.push(HistoryEntry {
            id,
            images: completed.images,
            params: completed.params,
            seed: completed.seed,
            model: completed.model,
            created_at: Local::now(),
            artifacts: completed.artifacts,
        });
        self.history.last()
    }

    /// Copy a history entry's params back into the active params
    pub fn restore_from_history(&mut self, id: u64) -> Result<()> {
        let entry = self
            .history
            .iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| Error::InvalidParameters(format!("no history entry with id {}", id)))?;
        self.params = entry.params.clone();
        Ok(())
    }

    /// History as pretty JSON; pixels are left out, saved artifacts point at them
    pub fn history_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.history)?)
    }

    pub fn reset_params_for(&mut self, architecture: ModelArchitecture) {
        self.params.reset_to_defaults(architecture);
    }

    pub fn set_init_image(&mut self, image: RgbImage) {
        self.init_image = Some(image);
    }

    pub fn clear_init_image(&mut self) {
        self.init_image = None;
    }

    pub fn set_mask(&mut self, mask: GrayImage) {
        self.mask = Some(mask);
    }

    pub fn clear_mask(&mut self) {
        self.mask = None;
    }
}

impl Default for ModeState {
    fn default() -> Self {
        Self::new(GenerationMode::Txt2Img, GenerationParams::default())
    }
}

/// Decode uploaded bytes (png, jpeg, webp, ...) into an RGB buffer
pub fn decode_upload(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_rgb8())
}

/// Decode an uploaded mask; white marks the region to repaint
pub fn decode_mask(bytes: &[u8]) -> Result<GrayImage> {
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_luma8())
}
