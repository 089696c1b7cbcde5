// Stable Diffusion runtime using Candle

use super::clip::ClipTextEncoder;
use super::ModelVersion;
use crate::generation::encoding::{PooledTextEncoder, TextConditioner, TextEncoder};
use crate::generation::request::{Conditioning, InferenceRequest};
use crate::generation::runtime::{InferenceFailure, InferenceOutput, InferenceRuntime};
use crate::generation::scheduler::{OverrideValue, SchedulerAlgorithm, SchedulerSpec};
use crate::{Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{BetaSchedule, PredictionType, Scheduler, SchedulerConfig, TimestepSpacing},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use std::path::PathBuf;

/// Init latents plus the latent-resolution mask for inpainting
struct InitLatents {
    latents: Tensor,
    strength: f64,
    /// (repaint, keep), both 1x1xHxW
    mask: Option<(Tensor, Tensor)>,
}

/// Loaded Stable Diffusion model: text encoders, UNet and VAE
pub struct StableDiffusionBackend {
    version: ModelVersion,
    name: String,
    device: Device,
    dtype: DType,
    text_encoder: ClipTextEncoder,
    text_encoder_2: Option<ClipTextEncoder>,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl StableDiffusionBackend {
    /// Download (or reuse cached) weights and build every component
    pub fn load(version: ModelVersion, use_cpu: bool) -> Result<Self> {
        let device = if use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)?
        };

        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };

        tracing::info!("Loading {} on {:?} ({:?})", version, device, dtype);
        let sd_config = sd_config(version);
        let api = hf_hub::api::sync::Api::new().map_err(|e| Error::HfHub(e.to_string()))?;
        let files = ModelFiles {
            api: &api,
            version,
            dtype,
        };

        tracing::info!("Loading CLIP text encoder");
        let text_encoder = ClipTextEncoder::load(
            &sd_config.clip,
            files.fetch(version.tokenizer_repo(), "tokenizer.json")?,
            files.weights("text_encoder/model")?,
            &device,
            dtype,
        )?;

        let text_encoder_2 = match (&sd_config.clip2, version.tokenizer_2_repo()) {
            (Some(clip2), Some(tokenizer_repo)) => {
                tracing::info!("Loading second CLIP text encoder");
                Some(ClipTextEncoder::load(
                    clip2,
                    files.fetch(tokenizer_repo, "tokenizer.json")?,
                    files.weights("text_encoder_2/model")?,
                    &device,
                    dtype,
                )?)
            }
            _ => None,
        };

        tracing::info!("Loading VAE");
        let vae_weights = if dtype == DType::F16
            && matches!(version, ModelVersion::Xl | ModelVersion::Turbo)
        {
            tracing::info!("Using SDXL VAE fp16 fix from madebyollin");
            files.fetch("madebyollin/sdxl-vae-fp16-fix", "diffusion_pytorch_model.safetensors")?
        } else {
            files.weights("vae/diffusion_pytorch_model")?
        };
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .map_err(|e| Error::ModelLoading(format!("VAE: {}", e)))?;

        tracing::info!("Loading UNet");
        let unet = sd_config
            .build_unet(
                files.weights("unet/diffusion_pytorch_model")?,
                &device,
                4, // standard latent channels
                false,
                dtype,
            )
            .map_err(|e| Error::ModelLoading(format!("UNet: {}", e)))?;

        Ok(Self {
            version,
            name: version.repo().to_string(),
            device,
            dtype,
            text_encoder,
            text_encoder_2,
            vae,
            unet,
        })
    }

    fn generate(&self, request: InferenceRequest) -> Result<InferenceOutput> {
        if request.width % 8 != 0 || request.height % 8 != 0 {
            return Err(Error::InvalidParameters(
                "Width and height must be multiples of 8".into(),
            ));
        }

        let seed = request.seed.unwrap_or_else(rand::random);
        tracing::info!("Using seed: {}", seed);
        self.device.set_seed(seed)?;

        let use_guidance = request.guidance_scale > 1.0;
        let text_embeddings = if use_guidance {
            Tensor::cat(&[&request.negative_prompt_embeds, &request.prompt_embeds], 0)?
        } else {
            request.prompt_embeds.clone()
        }
        .to_device(&self.device)?
        .to_dtype(self.dtype)?;

        if request.pooled.is_some() {
            tracing::debug!("Pooled embeddings are not consumed by the candle UNet");
        }

        let width = request.width as usize;
        let height = request.height as usize;
        let init = match &request.conditioning {
            Some(conditioning) => Some(self.prepare_init(conditioning, width, height)?),
            None => None,
        };

        let mut images = Vec::with_capacity(request.batch_size as usize);
        for index in 0..request.batch_size {
            tracing::info!("Generating image {}/{}", index + 1, request.batch_size);
            let latents = self.denoise(&request, &text_embeddings, init.as_ref(), use_guidance)?;
            images.push(self.decode(&latents)?);
        }

        tracing::info!("Image generation complete!");
        Ok(InferenceOutput { images, seed })
    }

    fn prepare_init(&self, conditioning: &Conditioning, width: usize, height: usize) -> Result<InitLatents> {
        if let Some(factor) = conditioning.upscale_factor {
            tracing::info!("Upscaling init image x{} to {}x{}", factor, width, height);
        }

        let image = resize_rgb(&conditioning.init_image, width as u32, height as u32);
        let pixels = image_to_tensor(&image, &self.device)?.to_dtype(self.dtype)?;

        tracing::info!("Encoding init image");
        let latents = (self.vae.encode(&pixels)?.sample()? * self.version.vae_scale())?;

        let mask = match &conditioning.mask {
            Some(mask) => {
                let repaint = mask_to_latent(mask, width / 8, height / 8, &self.device)?
                    .to_dtype(self.dtype)?;
                let keep = repaint.affine(-1.0, 1.0)?;
                Some((repaint, keep))
            }
            None => None,
        };

        Ok(InitLatents {
            latents,
            strength: conditioning.strength,
            mask,
        })
    }

    fn denoise(
        &self,
        request: &InferenceRequest,
        text_embeddings: &Tensor,
        init: Option<&InitLatents>,
        use_guidance: bool,
    ) -> Result<Tensor> {
        let n_steps = request.steps as usize;
        let mut scheduler = build_scheduler(&request.scheduler, n_steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let noise = Tensor::randn(
            0f32,
            1f32,
            (1, 4, request.height as usize / 8, request.width as usize / 8),
            &self.device,
        )?
        .to_dtype(self.dtype)?;

        let t_start = match init {
            Some(init) => n_steps.saturating_sub((n_steps as f64 * init.strength) as usize),
            None => 0,
        };

        let mut latents = match init {
            Some(init) if t_start < timesteps.len() => {
                scheduler.add_noise(&init.latents, noise.clone(), timesteps[t_start])?
            }
            Some(init) => init.latents.clone(),
            None => (&noise * scheduler.init_noise_sigma())?,
        };

        tracing::info!("Running diffusion for {} steps", timesteps.len().saturating_sub(t_start));
        for (step_idx, &timestep) in timesteps.iter().enumerate() {
            if step_idx < t_start {
                continue;
            }
            tracing::debug!("Step {}/{}", step_idx + 1, timesteps.len());

            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };

            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;

            let noise_pred = self
                .unet
                .forward(&latent_model_input, timestep as f64, text_embeddings)?;

            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * request.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;

            // Inpainting keeps the unmasked region pinned to the (re-noised) init latents
            if let Some(InitLatents {
                latents: init_latents,
                mask: Some((repaint, keep)),
                ..
            }) = init
            {
                let known = match timesteps.get(step_idx + 1) {
                    Some(&next) => scheduler.add_noise(init_latents, noise.clone(), next)?,
                    None => init_latents.clone(),
                };
                latents = (known.broadcast_mul(keep)? + latents.broadcast_mul(repaint)?)?;
            }
        }

        Ok(latents)
    }

    fn decode(&self, latents: &Tensor) -> Result<RgbImage> {
        tracing::info!("Decoding latents to image");
        let image = self.vae.decode(&(latents / self.version.vae_scale())?)?;
        let image = ((image / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;

        let (_, _, height, width) = image.dims4()?;
        let data = image.i(0)?.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;

        RgbImage::from_raw(width as u32, height as u32, data)
            .ok_or_else(|| Error::ImageProcessing("decoded buffer has the wrong size".into()))
    }
}

impl TextConditioner for StableDiffusionBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn text_encoder(&self) -> &dyn TextEncoder {
        &self.text_encoder
    }

    fn text_encoder_2(&self) -> Option<&dyn PooledTextEncoder> {
        self.text_encoder_2
            .as_ref()
            .map(|encoder| encoder as &dyn PooledTextEncoder)
    }
}

impl InferenceRuntime for StableDiffusionBackend {
    fn model_name(&self) -> String {
        self.name.clone()
    }

    fn run(&self, request: InferenceRequest) -> std::result::Result<InferenceOutput, InferenceFailure> {
        tracing::info!("Generating {} with Stable Diffusion {:?}", request.mode, self.version);
        self.generate(request).map_err(InferenceFailure::from)
    }
}

fn sd_config(version: ModelVersion) -> StableDiffusionConfig {
    match version {
        ModelVersion::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
        ModelVersion::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        ModelVersion::Xl => StableDiffusionConfig::sdxl(None, None, None),
        ModelVersion::Turbo => StableDiffusionConfig::sdxl_turbo(None, None, None),
    }
}

/// Hub access for one model repo
struct ModelFiles<'a> {
    api: &'a hf_hub::api::sync::Api,
    version: ModelVersion,
    dtype: DType,
}

impl ModelFiles<'_> {
    fn fetch(&self, repo: &str, filename: &str) -> Result<PathBuf> {
        tracing::debug!("Fetching {} from {}", filename, repo);
        self.api
            .model(repo.to_string())
            .get(filename)
            .map_err(|e| Error::HfHub(format!("{}/{}: {}", repo, filename, e)))
    }

    /// Safetensors weights, preferring fp16 when running in half precision
    fn weights(&self, stem: &str) -> Result<PathBuf> {
        let repo = self.version.repo();
        if self.dtype == DType::F16 {
            match self.fetch(repo, &format!("{}.fp16.safetensors", stem)) {
                Ok(path) => return Ok(path),
                Err(_) => tracing::warn!("fp16 weights for {} not found, falling back to fp32", stem),
            }
        }
        self.fetch(repo, &format!("{}.safetensors", stem))
    }
}

/// Build a candle scheduler from a resolved spec.
///
/// Candle ships DDIM and Euler ancestral integrators; other algorithm
/// families run on DDIM with the requested beta and spacing settings.
fn build_scheduler(spec: &SchedulerSpec, steps: usize) -> Result<Box<dyn Scheduler>> {
    for key in ["use_karras_sigmas", "algorithm_type", "solver_order"] {
        if let Some(value) = spec.get(key) {
            tracing::debug!("Scheduler option {}={} has no candle equivalent", key, value);
        }
    }

    let float = |key: &str, default: f64| spec.get(key).and_then(OverrideValue::as_f64).unwrap_or(default);
    let int = |key: &str, default: usize| {
        spec.get(key)
            .and_then(OverrideValue::as_i64)
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(default)
    };

    let beta_start = float("beta_start", 0.00085);
    let beta_end = float("beta_end", 0.012);
    let steps_offset = int("steps_offset", 1);
    let train_timesteps = int("num_train_timesteps", 1000);

    match spec.algorithm {
        SchedulerAlgorithm::EulerAncestralDiscrete => EulerAncestralDiscreteSchedulerConfig {
            beta_start,
            beta_end,
            beta_schedule: beta_schedule(spec),
            steps_offset,
            prediction_type: prediction_type(spec),
            train_timesteps,
            timestep_spacing: timestep_spacing(spec),
            ..Default::default()
        }
        .build(steps)
        .map_err(Error::from),
        algorithm => {
            if algorithm != SchedulerAlgorithm::Ddim {
                tracing::debug!("Running {} on the DDIM integrator", algorithm);
            }
            DDIMSchedulerConfig {
                beta_start,
                beta_end,
                beta_schedule: beta_schedule(spec),
                steps_offset,
                prediction_type: prediction_type(spec),
                train_timesteps,
                timestep_spacing: timestep_spacing(spec),
                ..Default::default()
            }
            .build(steps)
            .map_err(Error::from)
        }
    }
}

fn beta_schedule(spec: &SchedulerSpec) -> BetaSchedule {
    match spec.beta_schedule() {
        Some("linear") => BetaSchedule::Linear,
        Some("squaredcos_cap_v2") => BetaSchedule::SquaredcosCapV2,
        Some("scaled_linear") | None => BetaSchedule::ScaledLinear,
        Some(other) => {
            tracing::debug!("Beta schedule '{}' unavailable, using scaled_linear", other);
            BetaSchedule::ScaledLinear
        }
    }
}

fn prediction_type(spec: &SchedulerSpec) -> PredictionType {
    match spec.get("prediction_type").and_then(OverrideValue::as_str) {
        Some("v_prediction") => PredictionType::VPrediction,
        Some("sample") => PredictionType::Sample,
        _ => PredictionType::Epsilon,
    }
}

fn timestep_spacing(spec: &SchedulerSpec) -> TimestepSpacing {
    match spec.timestep_spacing() {
        Some("linspace") => TimestepSpacing::Linspace,
        Some("trailing") => TimestepSpacing::Trailing,
        _ => TimestepSpacing::Leading,
    }
}

fn resize_rgb(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image.clone()
    } else {
        image::imageops::resize(image, width, height, FilterType::Lanczos3)
    }
}

/// RGB image to a 1x3xHxW tensor in [-1, 1]
fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let tensor = Tensor::from_vec(image.as_raw().clone(), (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// Mask at latent resolution as a 1x1xHxW tensor in [0, 1]
fn mask_to_latent(mask: &GrayImage, width: usize, height: usize, device: &Device) -> Result<Tensor> {
    let resized = image::imageops::resize(mask, width as u32, height as u32, FilterType::Triangle);
    let tensor = Tensor::from_vec(resized.into_raw(), (height, width), device)?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?
        .reshape((1, 1, height, width))?;
    Ok(tensor)
}
