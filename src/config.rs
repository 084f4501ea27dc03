//! Pipeline and encoder configuration.
//!
//! Everything here is validated at construction time. Unknown backend kinds
//! and inconsistent encoder specs are rejected before any model weight is
//! loaded, so generation-time code only ever sees closed enums.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default negative prompt, tuned for face-subject generation.
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "flaws in the eyes, flaws in the face, lowres, non-HDRi, low quality, worst quality, \
     artifacts, noise, text, watermark, glitch, mutated, ugly, disfigured, hands, \
     partially rendered objects, partially rendered eyes, deformed eyeballs, cross-eyed, \
     blurry, mutation, duplicate, out of frame, cropped, mutilated, bad anatomy, deformed, \
     bad proportions, nude, naked, nsfw, topless, bare breasts";

/// Where an encoder's placeholder tokens go in the composed prompt.
///
/// This is a fixed per-encoder-type policy, not user-configurable: some
/// identity signals condition best when read first, others when read last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPlacement {
    Prefix,
    Suffix,
}

/// Identity-encoder families understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Arc2Face,
    #[serde(rename = "consistentid")]
    ConsistentId,
}

impl EncoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arc2Face => "arc2face",
            Self::ConsistentId => "consistentID",
        }
    }

    /// Number of pseudo-token embedding rows the encoder produces per subject.
    pub fn default_num_id_vectors(&self) -> usize {
        match self {
            Self::Arc2Face => 16,
            Self::ConsistentId => 4,
        }
    }

    /// Capability scale substituted when a spec asks for the backend default.
    pub fn default_output_scale(&self) -> f64 {
        match self {
            Self::Arc2Face => 6.0,
            Self::ConsistentId => 1.0,
        }
    }

    /// Arc2Face embeddings condition best at the start of the prompt,
    /// ConsistentID embeddings at the end.
    pub fn placement(&self) -> PromptPlacement {
        match self {
            Self::Arc2Face => PromptPlacement::Prefix,
            Self::ConsistentId => PromptPlacement::Suffix,
        }
    }

    /// Whether the encoder produces a native anti-identity signal for
    /// negative-prompt blending. Absence is not an error; callers substitute
    /// zero rows of matching shape.
    pub fn has_native_negative(&self) -> bool {
        match self {
            Self::Arc2Face => false,
            Self::ConsistentId => true,
        }
    }
}

impl FromStr for EncoderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "arc2face" => Ok(Self::Arc2Face),
            "consistentid" => Ok(Self::ConsistentId),
            _ => Err(Error::config(format!("unknown identity encoder type: {s:?}"))),
        }
    }
}

impl std::fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured identity encoder. Immutable after construction.
#[derive(Debug, Clone)]
pub struct IdentityEncoderSpec {
    pub kind: EncoderKind,
    pub checkpoint_path: PathBuf,
    pub num_id_vectors: usize,
    /// Capability scale applied to the encoder's output embeddings.
    /// `-1.0` selects the kind's documented default.
    pub output_scale: f64,
}

impl IdentityEncoderSpec {
    pub fn new(kind: EncoderKind, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            checkpoint_path: checkpoint_path.into(),
            num_id_vectors: kind.default_num_id_vectors(),
            output_scale: -1.0,
        }
    }

    pub fn with_output_scale(mut self, scale: f64) -> Self {
        self.output_scale = scale;
        self
    }

    pub fn with_num_id_vectors(mut self, n: usize) -> Self {
        self.num_id_vectors = n;
        self
    }

    /// The scale actually applied at inference time: `-1` resolves to the
    /// kind default, anything else is used as-is (no normalization).
    pub fn effective_scale(&self) -> f64 {
        if self.output_scale < 0.0 {
            self.kind.default_output_scale()
        } else {
            self.output_scale
        }
    }
}

/// Diffusion sampling architecture. Determines the conditioning call
/// signature the generator uses; validated exhaustively at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Latent U-Net, text-to-image.
    LatentUnetText2Img,
    /// Latent U-Net, image-to-image (strength-scheduled start).
    LatentUnetImg2Img,
    /// Rectified-flow MMDiT with dual embedding+pooled conditioning streams.
    FlowTransformerV1,
    /// Rectified-flow transformer with distilled guidance, no negative stream.
    FlowTransformerV2,
    /// Prompt/identity encoding only; no sampler is loaded.
    EncoderOnly,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LatentUnetText2Img => "latent-unet-txt2img",
            Self::LatentUnetImg2Img => "latent-unet-img2img",
            Self::FlowTransformerV1 => "flow-transformer-v1",
            Self::FlowTransformerV2 => "flow-transformer-v2",
            Self::EncoderOnly => "encoder-only",
        }
    }

    /// Default pretrained bundle for the backend, used when the pipeline
    /// config does not name a base model.
    pub fn default_base_model(&self) -> Option<&'static str> {
        match self {
            Self::LatentUnetText2Img | Self::LatentUnetImg2Img | Self::EncoderOnly => {
                Some("stable-diffusion-v1-5/stable-diffusion-v1-5")
            }
            Self::FlowTransformerV1 => Some("stabilityai/stable-diffusion-3-medium-diffusers"),
            Self::FlowTransformerV2 => Some("black-forest-labs/FLUX.1-schnell"),
        }
    }

    /// Whether the backend consumes a negative conditioning stream.
    pub fn supports_negative_prompt(&self) -> bool {
        !matches!(self, Self::FlowTransformerV2)
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "latent-unet-txt2img" => Ok(Self::LatentUnetText2Img),
            "latent-unet-img2img" => Ok(Self::LatentUnetImg2Img),
            "flow-transformer-v1" => Ok(Self::FlowTransformerV1),
            "flow-transformer-v2" => Ok(Self::FlowTransformerV2),
            "encoder-only" => Ok(Self::EncoderOnly),
            _ => Err(Error::config(format!("unknown backend kind: {s:?}"))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline construction parameters. Immutable after the pipeline is built.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub backend_kind: BackendKind,
    /// Local diffusers-layout directory or a hub repository id.
    /// `None` selects the backend kind's default bundle.
    pub base_model: Option<String>,
    /// Alternate VAE checkpoint (e.g. a face-detail finetune).
    pub vae_override: Option<PathBuf>,
    /// Alternate text-encoder weights (e.g. a prompt-following finetune).
    pub text_encoder_override: Option<PathBuf>,
    /// Replacement for the main U-Net; may be in a legacy checkpoint format.
    pub main_unet_path: Option<PathBuf>,
    /// Extra U-Nets ensembled with the main one, with their mixing weights.
    pub extra_unet_paths: Vec<PathBuf>,
    pub extra_unet_weights: Vec<f64>,
    /// The subject word removed from raw prompts and replaced by placeholder
    /// tokens. Short and unusual on purpose; a word that also occurs as
    /// natural English in prompts will be stripped from them.
    pub subject_placeholder: String,
    pub num_inference_steps: usize,
    /// Default negative prompt; `None` selects [`DEFAULT_NEGATIVE_PROMPT`].
    pub negative_prompt: Option<String>,
    /// Overwrite the tail of the negative-prompt embedding with the
    /// encoders' anti-identity rows. Degrades output quality in practice,
    /// so it is off by default, but stays reachable for experimentation.
    pub blend_negative_identity: bool,
    pub height: usize,
    pub width: usize,
}

impl PipelineConfig {
    pub fn new(backend_kind: BackendKind) -> Self {
        Self {
            backend_kind,
            base_model: None,
            vae_override: None,
            text_encoder_override: None,
            main_unet_path: None,
            extra_unet_paths: Vec::new(),
            extra_unet_weights: Vec::new(),
            subject_placeholder: "z".to_string(),
            num_inference_steps: 50,
            negative_prompt: None,
            blend_negative_identity: false,
            height: 512,
            width: 512,
        }
    }

    pub fn negative_prompt(&self) -> &str {
        self.negative_prompt
            .as_deref()
            .unwrap_or(DEFAULT_NEGATIVE_PROMPT)
    }

    pub fn validate(&self) -> Result<()> {
        if self.subject_placeholder.is_empty() {
            return Err(Error::config("subject placeholder must not be empty"));
        }
        if self.extra_unet_paths.len() != self.extra_unet_weights.len() {
            return Err(Error::config(format!(
                "{} extra U-Net paths but {} weights",
                self.extra_unet_paths.len(),
                self.extra_unet_weights.len()
            )));
        }
        if self.height % 8 != 0 || self.width % 8 != 0 {
            return Err(Error::config(format!(
                "height ({}) and width ({}) must be divisible by 8",
                self.height, self.width
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trips() {
        for kind in [
            BackendKind::LatentUnetText2Img,
            BackendKind::LatentUnetImg2Img,
            BackendKind::FlowTransformerV1,
            BackendKind::FlowTransformerV2,
            BackendKind::EncoderOnly,
        ] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_backend_kind_is_config_error() {
        let err = "latent-unet-txt3img".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("latent-unet-txt3img"));
    }

    #[test]
    fn default_scale_resolution() {
        let spec = IdentityEncoderSpec::new(EncoderKind::Arc2Face, "ckpt.safetensors");
        assert_eq!(spec.effective_scale(), 6.0);

        let spec = IdentityEncoderSpec::new(EncoderKind::ConsistentId, "ckpt.safetensors");
        assert_eq!(spec.effective_scale(), 1.0);

        let spec = IdentityEncoderSpec::new(EncoderKind::Arc2Face, "ckpt.safetensors")
            .with_output_scale(2.5);
        assert_eq!(spec.effective_scale(), 2.5);
    }

    #[test]
    fn encoder_kind_parsing_is_case_insensitive() {
        assert_eq!(
            "consistentID".parse::<EncoderKind>().unwrap(),
            EncoderKind::ConsistentId
        );
        assert_eq!(
            "Arc2Face".parse::<EncoderKind>().unwrap(),
            EncoderKind::Arc2Face
        );
        assert!("arcface".parse::<EncoderKind>().is_err());
    }

    #[test]
    fn mismatched_ensemble_weights_rejected() {
        let mut cfg = PipelineConfig::new(BackendKind::LatentUnetText2Img);
        cfg.extra_unet_paths = vec![PathBuf::from("a.safetensors")];
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
