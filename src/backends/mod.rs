//! Backend-dispatching generation.
//!
//! The diffusion backends differ in conditioning signature: the latent
//! U-Net family takes a single embedding stream with classifier-free
//! guidance by batch doubling; the flow-transformer backends take dual
//! embedding+pooled streams, one of them with a distilled guidance embedding
//! instead of a negative stream. This module normalizes those signatures
//! behind one closed dispatch enum; branch selection is exhaustive over the
//! declared backend kinds and unknown kinds never get past configuration
//! parsing.

mod flow_transformer;
mod latent_unet;
mod scheduler;

pub use flow_transformer::{FlowMatchBackend, GuidanceDistilledBackend};
pub use latent_unet::LatentUnetBackend;
pub use scheduler::FlowMatchEulerScheduler;

use candle::Tensor;

use crate::config::BackendKind;
use crate::error::{Error, Result};

/// Backend-native conditioning tensors for one prompt.
///
/// `embeddings` is `[B, seq, D]`; the optional streams are present exactly
/// when the backend's signature asks for them.
pub struct PromptEncoding {
    pub embeddings: Tensor,
    pub negative_embeddings: Option<Tensor>,
    pub pooled: Option<Tensor>,
    pub negative_pooled: Option<Tensor>,
}

impl PromptEncoding {
    /// Replicate every stream across the requested output batch size.
    pub fn repeat(&self, count: usize) -> Result<Self> {
        let repeat_seq = |t: &Tensor| t.repeat((count, 1, 1));
        let repeat_pooled = |t: &Tensor| t.repeat((count, 1));
        Ok(Self {
            embeddings: repeat_seq(&self.embeddings)?,
            negative_embeddings: self
                .negative_embeddings
                .as_ref()
                .map(repeat_seq)
                .transpose()?,
            pooled: self.pooled.as_ref().map(repeat_pooled).transpose()?,
            negative_pooled: self
                .negative_pooled
                .as_ref()
                .map(repeat_pooled)
                .transpose()?,
        })
    }
}

/// Sampler arguments shared by every backend branch.
pub struct SamplingParams {
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub out_image_count: usize,
    /// Initial latent tensor; required by the image-to-image branch.
    pub init_latents: Option<Tensor>,
    /// Fraction of the noise-step schedule applied in image-to-image mode.
    /// A documented no-op for the pure text-to-image branches.
    pub strength: f64,
}

/// The loaded sampler, one variant per declared backend kind.
pub enum DiffusionBackend {
    LatentUnetText2Img(LatentUnetBackend),
    LatentUnetImg2Img(LatentUnetBackend),
    FlowTransformerV1(FlowMatchBackend),
    FlowTransformerV2(GuidanceDistilledBackend),
    /// No sampler loaded; prompt encoding and identity preparation only.
    EncoderOnly,
}

impl DiffusionBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::LatentUnetText2Img(_) => BackendKind::LatentUnetText2Img,
            Self::LatentUnetImg2Img(_) => BackendKind::LatentUnetImg2Img,
            Self::FlowTransformerV1(_) => BackendKind::FlowTransformerV1,
            Self::FlowTransformerV2(_) => BackendKind::FlowTransformerV2,
            Self::EncoderOnly => BackendKind::EncoderOnly,
        }
    }

    /// Run the sampler and decode to RGB images `[B, 3, H, W]` in `[0, 1]`.
    ///
    /// `encoding` must already be replicated across the output batch size.
    pub fn sample(&self, encoding: &PromptEncoding, params: &SamplingParams) -> Result<Tensor> {
        match self {
            Self::LatentUnetText2Img(backend) => backend.sample(encoding, params, false),
            Self::LatentUnetImg2Img(backend) => backend.sample(encoding, params, true),
            Self::FlowTransformerV1(backend) => backend.sample(encoding, params),
            Self::FlowTransformerV2(backend) => backend.sample(encoding, params),
            Self::EncoderOnly => Err(Error::config(
                "an encoder-only pipeline cannot generate images",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    #[test]
    fn encoding_repeat_replicates_all_streams() {
        let device = Device::Cpu;
        let encoding = PromptEncoding {
            embeddings: Tensor::zeros((1, 7, 4), DType::F32, &device).unwrap(),
            negative_embeddings: Some(Tensor::zeros((1, 7, 4), DType::F32, &device).unwrap()),
            pooled: Some(Tensor::zeros((1, 4), DType::F32, &device).unwrap()),
            negative_pooled: None,
        };
        let repeated = encoding.repeat(3).unwrap();
        assert_eq!(repeated.embeddings.dims(), &[3, 7, 4]);
        assert_eq!(repeated.negative_embeddings.unwrap().dims(), &[3, 7, 4]);
        assert_eq!(repeated.pooled.unwrap().dims(), &[3, 4]);
        assert!(repeated.negative_pooled.is_none());
    }

    #[test]
    fn encoder_only_sampling_is_config_error() {
        let encoding = PromptEncoding {
            embeddings: Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap(),
            negative_embeddings: None,
            pooled: None,
            negative_pooled: None,
        };
        let params = SamplingParams {
            num_inference_steps: 1,
            guidance_scale: 1.0,
            out_image_count: 1,
            init_latents: None,
            strength: 0.8,
        };
        let err = DiffusionBackend::EncoderOnly
            .sample(&encoding, &params)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
