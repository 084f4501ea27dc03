//! Latent U-Net sampling (text-to-image and image-to-image).

use candle::{DType, Tensor};
use candle_transformers::models::stable_diffusion::ddim::DDIMSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::SchedulerConfig;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;

use crate::ensemble::UnetEnsemble;
use crate::error::{Error, Result};

use super::{PromptEncoding, SamplingParams};

/// Latent scaling factor of the SD-1.5 family VAE.
const LATENT_SCALE: f64 = 0.18215;

/// U-Net denoising over a 4-channel latent space, with classifier-free
/// guidance by batch doubling.
pub struct LatentUnetBackend {
    unet: UnetEnsemble,
    vae: AutoEncoderKL,
    ddim_config: DDIMSchedulerConfig,
    height: usize,
    width: usize,
    device: candle::Device,
    dtype: DType,
}

impl LatentUnetBackend {
    pub fn new(
        unet: UnetEnsemble,
        vae: AutoEncoderKL,
        height: usize,
        width: usize,
        device: candle::Device,
        dtype: DType,
    ) -> Self {
        Self {
            unet,
            vae,
            ddim_config: DDIMSchedulerConfig::default(),
            height,
            width,
            device,
            dtype,
        }
    }

    pub fn sample(
        &self,
        encoding: &PromptEncoding,
        params: &SamplingParams,
        img2img: bool,
    ) -> Result<Tensor> {
        let mut scheduler = self.ddim_config.build(params.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let batch_size = params.out_image_count;
        let latent_height = self.height / 8;
        let latent_width = self.width / 8;

        let use_guidance = params.guidance_scale > 1.0 && encoding.negative_embeddings.is_some();
        let embeddings = if use_guidance {
            let negative = encoding.negative_embeddings.as_ref().unwrap();
            Tensor::cat(&[negative, &encoding.embeddings], 0)?
        } else {
            encoding.embeddings.clone()
        };
        let embeddings = embeddings.to_dtype(self.dtype)?;

        let (mut latents, start_step) = if img2img {
            let init = params.init_latents.as_ref().ok_or_else(|| {
                Error::input("image-to-image sampling requires an initial latent tensor")
            })?;
            let init = init.to_device(&self.device)?.to_dtype(DType::F32)?;
            let init = if init.dim(0)? == batch_size {
                init
            } else {
                init.repeat((batch_size, 1, 1, 1))?
            };

            let strength = params.strength.clamp(0.0, 1.0);
            let start_step = params.num_inference_steps
                - (strength * params.num_inference_steps as f64) as usize;
            let start_step = start_step.min(timesteps.len().saturating_sub(1));
            tracing::debug!(strength, start_step, "image-to-image schedule start");

            let noise = init.randn_like(0.0, 1.0)?;
            let latents = scheduler.add_noise(&init, noise, timesteps[start_step])?;
            (latents, start_step)
        } else {
            // `strength` is deliberately ignored here.
            let latents = Tensor::randn(
                0f32,
                1f32,
                (batch_size, 4, latent_height, latent_width),
                &self.device,
            )?;
            let latents = (latents * scheduler.init_noise_sigma())?;
            (latents, 0)
        };
        latents = latents.to_dtype(self.dtype)?;

        for (step_index, &timestep) in timesteps.iter().enumerate() {
            if step_index < start_step {
                continue;
            }
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;

            let noise_pred = self.unet.forward(&latent_input, timestep as f64, &embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let images = self.vae.decode(&(latents / LATENT_SCALE)?)?;
        let images = ((images / 2.0)? + 0.5)?.clamp(0f32, 1f32)?;
        Ok(images.to_dtype(DType::F32)?)
    }
}
