// Request assembly from encodings, scheduler and params

use super::encoding::EncodingResult;
use super::mode::ModeState;
use super::scheduler::SchedulerSpec;
use super::types::{GenerationMode, GenerationParams, MAX_UPSCALE_SIDE};
use crate::{Error, Result};
use candle_core::Tensor;
use image::{GrayImage, RgbImage};

/// Pooled embeddings of dual-encoder models
#[derive(Debug, Clone)]
pub struct PooledEmbeddings {
    pub prompt: Tensor,
    pub negative: Tensor,
}

/// Image conditioning for img2img, inpaint and upscale
#[derive(Debug, Clone)]
pub struct Conditioning {
    pub init_image: RgbImage,
    pub strength: f64,
    /// Inpaint only; white pixels are repainted
    pub mask: Option<GrayImage>,
    /// Upscale only
    pub upscale_factor: Option<f64>,
}

/// Fully assembled request handed to the inference runtime
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub mode: GenerationMode,
    pub prompt_embeds: Tensor,
    pub negative_prompt_embeds: Tensor,
    pub pooled: Option<PooledEmbeddings>,
    pub scheduler: SchedulerSpec,
    pub steps: u32,
    pub guidance_scale: f64,
    pub width: u32,
    pub height: u32,
    pub seed: Option<u64>,
    pub batch_size: u32,
    pub conditioning: Option<Conditioning>,
}

/// Owned copy of everything a request needs, taken while the state is locked
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub mode: GenerationMode,
    pub params: GenerationParams,
    pub init_image: Option<RgbImage>,
    pub mask: Option<GrayImage>,
}

impl RequestSnapshot {
    /// Capture the state, failing early when a conditioned mode lacks its input
    pub fn capture(state: &ModeState) -> Result<Self> {
        let mode = state.current_mode();
        check_conditioning(mode, state.init_image())?;
        Ok(Self {
            mode,
            params: state.params().clone(),
            init_image: if mode.is_conditioned() {
                state.init_image().cloned()
            } else {
                None
            },
            mask: if mode == GenerationMode::Inpaint {
                state.mask().cloned()
            } else {
                None
            },
        })
    }
}

/// Conditioned modes need an init image before anything is encoded
pub fn check_conditioning(mode: GenerationMode, init_image: Option<&RgbImage>) -> Result<()> {
    if mode.is_conditioned() && init_image.is_none() {
        return Err(Error::Configuration(format!(
            "{} requires an init image",
            mode.display_name()
        )));
    }
    Ok(())
}

/// Build the runtime request. Performs no numerical work.
pub fn assemble(
    encoding: EncodingResult,
    scheduler: SchedulerSpec,
    snapshot: RequestSnapshot,
) -> Result<InferenceRequest> {
    let RequestSnapshot {
        mode,
        params,
        init_image,
        mask,
    } = snapshot;

    let (prompt_embeds, negative_prompt_embeds, pooled) = match encoding {
        EncodingResult::Single {
            prompt_embeds,
            negative_prompt_embeds,
        } => (prompt_embeds, negative_prompt_embeds, None),
        EncodingResult::Dual {
            prompt_embeds,
            negative_prompt_embeds,
            pooled_prompt_embeds,
            negative_pooled_prompt_embeds,
        } => (
            prompt_embeds,
            negative_prompt_embeds,
            Some(PooledEmbeddings {
                prompt: pooled_prompt_embeds,
                negative: negative_pooled_prompt_embeds,
            }),
        ),
    };

    let mut width = params.width;
    let mut height = params.height;

    let conditioning = if mode.is_conditioned() {
        let init_image = init_image.ok_or_else(|| {
            Error::Configuration(format!("{} requires an init image", mode.display_name()))
        })?;

        let upscale_factor = if mode == GenerationMode::Upscale {
            let (w, h) = upscaled_size(init_image.dimensions(), params.upscale_factor);
            if w.max(h) > MAX_UPSCALE_SIDE {
                return Err(Error::Configuration(format!(
                    "upscaled size {}x{} exceeds {} pixels per side",
                    w, h, MAX_UPSCALE_SIDE
                )));
            }
            width = w;
            height = h;
            Some(params.upscale_factor)
        } else {
            None
        };

        if mode == GenerationMode::Inpaint && mask.is_none() {
            tracing::warn!("Inpaint request without a mask, the whole image will be repainted");
        }

        Some(Conditioning {
            init_image,
            strength: params.effective_strength(),
            mask: if mode == GenerationMode::Inpaint { mask } else { None },
            upscale_factor,
        })
    } else {
        None
    };

    Ok(InferenceRequest {
        mode,
        prompt_embeds,
        negative_prompt_embeds,
        pooled,
        scheduler,
        steps: params.steps,
        guidance_scale: params.cfg_scale,
        width,
        height,
        seed: params.seed,
        batch_size: params.batch_size,
        conditioning,
    })
}

/// Scale image dimensions, rounded down to a multiple of 8
pub fn upscaled_size((width, height): (u32, u32), factor: f64) -> (u32, u32) {
    let align = |v: u32| {
        let scaled = (v as f64 * factor) as u32;
        (scaled / 8 * 8).max(8)
    };
    (align(width), align(height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::scheduler;
    use candle_core::{DType, Device};
    use image::Luma;

    fn single_encoding() -> EncodingResult {
        EncodingResult::Single {
            prompt_embeds: Tensor::ones((1, 77, 768), DType::F32, &Device::Cpu).unwrap(),
            negative_prompt_embeds: Tensor::zeros((1, 77, 768), DType::F32, &Device::Cpu).unwrap(),
        }
    }

    fn dual_encoding() -> EncodingResult {
        EncodingResult::Dual {
            prompt_embeds: Tensor::ones((1, 77, 2048), DType::F32, &Device::Cpu).unwrap(),
            negative_prompt_embeds: Tensor::zeros((1, 77, 2048), DType::F32, &Device::Cpu).unwrap(),
            pooled_prompt_embeds: Tensor::ones((1, 1280), DType::F32, &Device::Cpu).unwrap(),
            negative_pooled_prompt_embeds: Tensor::zeros((1, 1280), DType::F32, &Device::Cpu)
                .unwrap(),
        }
    }

    fn snapshot(mode: GenerationMode) -> RequestSnapshot {
        RequestSnapshot {
            mode,
            params: GenerationParams::new("a quiet forest"),
            init_image: None,
            mask: None,
        }
    }

    #[test]
    fn test_txt2img_request() {
        let request = assemble(
            single_encoding(),
            scheduler::resolve("euler", "normal", None),
            snapshot(GenerationMode::Txt2Img),
        )
        .unwrap();
        assert!(request.pooled.is_none());
        assert!(request.conditioning.is_none());
        assert_eq!((request.width, request.height), (512, 512));
        assert_eq!(request.steps, 20);
    }

    #[test]
    fn test_dual_encoding_carries_pooled() {
        let request = assemble(
            dual_encoding(),
            scheduler::resolve("euler", "normal", None),
            snapshot(GenerationMode::Txt2Img),
        )
        .unwrap();
        let pooled = request.pooled.unwrap();
        assert_eq!(pooled.prompt.dims(), &[1, 1280]);
    }

    #[test]
    fn test_conditioned_mode_without_init_image() {
        for mode in [
            GenerationMode::Img2Img,
            GenerationMode::Inpaint,
            GenerationMode::Upscale,
        ] {
            let result = assemble(
                single_encoding(),
                scheduler::resolve("euler", "normal", None),
                snapshot(mode),
            );
            assert!(matches!(result, Err(Error::Configuration(_))), "{}", mode);
            assert!(check_conditioning(mode, None).is_err());
        }
        assert!(check_conditioning(GenerationMode::Txt2Img, None).is_ok());
    }

    #[test]
    fn test_inpaint_carries_mask() {
        let mut snap = snapshot(GenerationMode::Inpaint);
        snap.init_image = Some(RgbImage::new(64, 64));
        snap.mask = Some(GrayImage::from_pixel(64, 64, Luma([255])));
        snap.params.strength = Some(0.6);

        let request = assemble(
            single_encoding(),
            scheduler::resolve("ddim", "normal", None),
            snap,
        )
        .unwrap();
        let conditioning = request.conditioning.unwrap();
        assert!(conditioning.mask.is_some());
        assert_eq!(conditioning.strength, 0.6);
        assert!(conditioning.upscale_factor.is_none());
    }

    #[test]
    fn test_img2img_drops_mask_and_defaults_strength() {
        let mut snap = snapshot(GenerationMode::Img2Img);
        snap.init_image = Some(RgbImage::new(64, 64));
        snap.mask = Some(GrayImage::new(64, 64));

        let request = assemble(
            single_encoding(),
            scheduler::resolve("ddim", "normal", None),
            snap,
        )
        .unwrap();
        let conditioning = request.conditioning.unwrap();
        assert!(conditioning.mask.is_none());
        assert_eq!(conditioning.strength, 0.8);
    }

    #[test]
    fn test_upscale_sets_output_size() {
        let mut snap = snapshot(GenerationMode::Upscale);
        snap.init_image = Some(RgbImage::new(300, 200));
        snap.params.upscale_factor = 2.0;

        let request = assemble(
            single_encoding(),
            scheduler::resolve("euler", "normal", None),
            snap,
        )
        .unwrap();
        assert_eq!((request.width, request.height), (600, 400));
        assert_eq!(request.conditioning.unwrap().upscale_factor, Some(2.0));
    }

    #[test]
    fn test_upscale_output_is_capped() {
        let mut snap = snapshot(GenerationMode::Upscale);
        snap.init_image = Some(RgbImage::new(1600, 1200));
        snap.params.upscale_factor = 3.0;
        let err = assemble(
            single_encoding(),
            scheduler::resolve("euler_a", "normal", None),
            snap,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_upscaled_size_alignment() {
        assert_eq!(upscaled_size((100, 75), 1.5), (144, 112));
        assert_eq!(upscaled_size((4, 4), 1.0), (8, 8));
    }

    #[test]
    fn test_snapshot_capture() {
        let mut state = ModeState::default();
        state.set_mask(GrayImage::new(8, 8));
        let snap = RequestSnapshot::capture(&state).unwrap();
        assert!(snap.mask.is_none());

        state.transition(GenerationMode::Inpaint);
        assert!(matches!(
            RequestSnapshot::capture(&state),
            Err(Error::Configuration(_))
        ));

        state.set_init_image(RgbImage::new(8, 8));
        let snap = RequestSnapshot::capture(&state).unwrap();
        assert!(snap.init_image.is_some());
        assert!(snap.mask.is_some());
    }
}
