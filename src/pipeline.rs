//! The personalization pipeline.
//!
//! Construction wires everything together once: identity encoder adapters,
//! the patched text encoder, the vocabulary patch, the prompt composer and
//! the diffusion backend. After that, [`SubjectPipeline::prepare_subject_embeddings`]
//! runs once per subject image set, and composition plus generation can run
//! repeatedly for many prompts without recomputing identity embeddings.
//!
//! Everything is single-threaded and blocking; the pipeline exclusively owns
//! its text encoder and no failure below is retried.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::flux;
use candle_transformers::models::mmdit::model::{Config as MmditConfig, MMDiT};
use candle_transformers::models::stable_diffusion::unet_2d::{
    UNet2DConditionModel, UNet2DConditionModelConfig,
};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};

use crate::backends::{
    DiffusionBackend, FlowMatchBackend, GuidanceDistilledBackend, LatentUnetBackend,
    PromptEncoding, SamplingParams,
};
use crate::checkpoint::{load_tensor_map, load_unet_state_dict, LegacyUnetConverter};
use crate::compose::PromptComposer;
use crate::config::{BackendKind, EncoderKind, IdentityEncoderSpec, PipelineConfig};
use crate::encoders::{
    collect_identity_embeddings, create_identity_encoder, FaceEmbedder, IdentityEmbeddingBatch,
    IdentityEncoder, IdentityRequest, PrecomputedFaceEmbedder,
};
use crate::ensemble::UnetEnsemble;
use crate::error::{Error, Result};
use crate::text_encoder::{
    pad_long_context_prompt, LongContextEncoder, SubjectTextEncoder, TextEncoderConfig,
};
use crate::vocab::{PlaceholderTokenSet, VocabularyPatch};

/// Hub repository carrying the CLIP tokenizer definition.
const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

const T5_REPO: &str = "google/t5-v1_1-xxl";
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const T5_TOKENIZER_FILE: &str = "t5-v1_1-xxl.tokenizer.json";

/// Long-context token budget for the dual-stream backends.
const LONG_CONTEXT_TOKENS: usize = 256;

/// A local diffusers-layout directory or a hub repository id.
struct ModelSource {
    spec: String,
}

impl ModelSource {
    fn new(spec: String) -> Self {
        Self { spec }
    }

    fn get(&self, api: &hf_hub::api::sync::Api, relative: &str) -> Result<PathBuf> {
        let local = Path::new(&self.spec);
        if local.is_dir() {
            let file = local.join(relative);
            if file.is_file() {
                Ok(file)
            } else {
                Err(Error::config(format!(
                    "{relative} not found under local model directory {}",
                    local.display()
                )))
            }
        } else {
            let repo = api.repo(hf_hub::Repo::model(self.spec.clone()));
            Ok(repo.get(relative)?)
        }
    }
}

/// One generation call's arguments.
pub struct GenerationRequest {
    pub prompt: String,
    /// Overrides the pipeline's default negative prompt.
    pub negative_prompt: Option<String>,
    pub guidance_scale: f64,
    pub out_image_count: usize,
    /// Initial latent tensor, consumed by the image-to-image branch.
    pub init_latents: Option<Tensor>,
    /// Reference-image strength for image-to-image; ignored by the
    /// text-to-image branches.
    pub strength: f64,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            guidance_scale: 4.0,
            out_image_count: 4,
            init_latents: None,
            strength: 0.8,
            seed: None,
        }
    }
}

/// A diffusion pipeline personalized with per-subject identity embeddings.
pub struct SubjectPipeline {
    config: PipelineConfig,
    encoders: Vec<Box<dyn IdentityEncoder>>,
    text_encoder: SubjectTextEncoder,
    long_context: Option<LongContextEncoder>,
    token_set: PlaceholderTokenSet,
    patch: VocabularyPatch,
    composer: PromptComposer,
    backend: DiffusionBackend,
    /// Anti-identity rows retained from the last preparation, with their
    /// per-encoder partition for blending alignment.
    negative_identity: Option<(Tensor, Vec<usize>)>,
    device: Device,
}

impl SubjectPipeline {
    /// Build a pipeline with the default collaborators: precomputed face
    /// embeddings from safetensors sidecars and no legacy U-Net converter.
    pub fn new(
        config: PipelineConfig,
        specs: Vec<IdentityEncoderSpec>,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        let face_embedder = Arc::new(PrecomputedFaceEmbedder::new(device.clone()));
        Self::with_collaborators(config, specs, face_embedder, None, device, dtype)
    }

    pub fn with_collaborators(
        config: PipelineConfig,
        specs: Vec<IdentityEncoderSpec>,
        face_embedder: Arc<dyn FaceEmbedder>,
        legacy_converter: Option<&dyn LegacyUnetConverter>,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        if specs.is_empty() {
            return Err(Error::config(
                "at least one identity encoder spec is required",
            ));
        }

        let api = hf_hub::api::sync::Api::new()?;
        let base_spec = config
            .base_model
            .clone()
            .or_else(|| config.backend_kind.default_base_model().map(str::to_string))
            .ok_or_else(|| {
                Error::config(format!(
                    "backend kind {} has no default base model; set one explicitly",
                    config.backend_kind
                ))
            })?;
        let base = ModelSource::new(base_spec);

        tracing::info!(
            backend = %config.backend_kind,
            base_model = base.spec.as_str(),
            "building subject pipeline"
        );

        let encoders: Vec<Box<dyn IdentityEncoder>> = specs
            .iter()
            .map(|spec| create_identity_encoder(spec, face_embedder.clone(), &device))
            .collect::<Result<_>>()?;

        // The text encoder runs in F32 for numerical precision; conditioning
        // tensors are converted to the sampler dtype downstream.
        let tokenizer_path = api
            .repo(hf_hub::Repo::model(CLIP_TOKENIZER_REPO.to_string()))
            .get("tokenizer.json")?;
        let text_encoder_weights = match &config.text_encoder_override {
            Some(path) => path.clone(),
            None => base.get(&api, "text_encoder/model.safetensors")?,
        };
        let mut text_encoder = SubjectTextEncoder::from_files(
            &tokenizer_path,
            &text_encoder_weights,
            TextEncoderConfig::sd15(),
            &device,
            DType::F32,
        )?;

        let token_set = PlaceholderTokenSet::new(&specs, &config.subject_placeholder)?;
        let patch = VocabularyPatch::install(text_encoder.tokenizer_mut(), &token_set)?;
        text_encoder.extend(&patch)?;

        let encoder_kinds: Vec<EncoderKind> = specs.iter().map(|s| s.kind).collect();
        let composer =
            PromptComposer::new(&config.subject_placeholder, &encoder_kinds, &token_set)?;

        let backend = match config.backend_kind {
            BackendKind::LatentUnetText2Img => DiffusionBackend::LatentUnetText2Img(
                build_latent_unet(&config, &base, &api, legacy_converter, &device, dtype)?,
            ),
            BackendKind::LatentUnetImg2Img => DiffusionBackend::LatentUnetImg2Img(
                build_latent_unet(&config, &base, &api, legacy_converter, &device, dtype)?,
            ),
            BackendKind::FlowTransformerV1 => DiffusionBackend::FlowTransformerV1(
                build_flow_match(&config, &base, &api, &device, dtype)?,
            ),
            BackendKind::FlowTransformerV2 => DiffusionBackend::FlowTransformerV2(
                build_guidance_distilled(&config, &base, &api, &device, dtype)?,
            ),
            BackendKind::EncoderOnly => {
                // No sampler: the pipeline only encodes prompts and
                // identities, keeping memory for the models that matter.
                tracing::info!("encoder-only pipeline: U-Net and VAE are not loaded");
                DiffusionBackend::EncoderOnly
            }
        };

        let long_context = match config.backend_kind {
            BackendKind::FlowTransformerV1 | BackendKind::FlowTransformerV2 => {
                Some(load_long_context(&api, &device)?)
            }
            _ => None,
        };

        Ok(Self {
            config,
            encoders,
            text_encoder,
            long_context,
            token_set,
            patch,
            composer,
            backend,
            negative_identity: None,
            device,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn placeholder_tokens(&self) -> &PlaceholderTokenSet {
        &self.token_set
    }

    pub fn vocabulary_patch(&self) -> &VocabularyPatch {
        &self.patch
    }

    /// The text encoder, exposed for encoder-only use and for reading the
    /// injected rows back through the patch.
    pub fn text_encoder(&self) -> &SubjectTextEncoder {
        &self.text_encoder
    }

    /// Compose the prompt string that will reach the tokenizer.
    pub fn compose_prompt(&self, raw_prompt: &str) -> String {
        self.composer.compose(raw_prompt)
    }

    /// Run every identity encoder for one subject, inject the resulting
    /// rows into the text encoder, and retain the anti-identity batch for
    /// negative blending.
    ///
    /// Safe to call repeatedly: a new subject simply overwrites the same
    /// vocabulary rows.
    pub fn prepare_subject_embeddings(
        &mut self,
        request: &IdentityRequest,
        noise_level: f64,
    ) -> Result<IdentityEmbeddingBatch> {
        let batch = collect_identity_embeddings(&self.encoders, request, noise_level)?;
        if batch.total_rows() != self.patch.len() {
            return Err(Error::Shape {
                context: "identity batch vs vocabulary patch",
                expected: self.patch.len(),
                actual: batch.total_rows(),
            });
        }

        self.text_encoder.ensure_device(&self.device)?;
        self.text_encoder
            .inject_subject_embeddings(&self.patch, &batch.subject)?;
        self.negative_identity = Some((batch.negative.clone(), batch.rows_per_encoder.clone()));

        tracing::info!(
            rows = batch.total_rows(),
            tokens = self.token_set.joined_str(),
            "prepared subject embeddings"
        );
        Ok(batch)
    }

    /// Encode a raw prompt (and negative prompt) into the backend-native
    /// conditioning streams.
    pub fn encode_prompt(
        &mut self,
        raw_prompt: &str,
        negative_prompt: Option<&str>,
    ) -> Result<PromptEncoding> {
        let composed = self.composer.compose(raw_prompt);
        tracing::debug!(prompt = composed.as_str(), "composed prompt");
        let negative = negative_prompt
            .unwrap_or_else(|| self.config.negative_prompt())
            .to_string();

        self.text_encoder.ensure_device(&self.device)?;

        match self.backend.kind() {
            BackendKind::LatentUnetText2Img
            | BackendKind::LatentUnetImg2Img
            | BackendKind::EncoderOnly => {
                let embeddings = self.text_encoder.encode(&composed)?;
                let negative_embeddings = self.text_encoder.encode(&negative)?;
                Ok(PromptEncoding {
                    embeddings,
                    negative_embeddings: Some(negative_embeddings),
                    pooled: None,
                    negative_pooled: None,
                })
            }
            BackendKind::FlowTransformerV1 => {
                let (clip_states, pooled) = self.text_encoder.encode_with_pooled(&composed)?;
                let (neg_clip_states, neg_pooled) =
                    self.text_encoder.encode_with_pooled(&negative)?;

                let long = self.long_context.as_mut().ok_or_else(|| {
                    Error::config("flow-transformer-v1 pipeline has no long-context encoder")
                })?;
                let long_states =
                    long.encode(&pad_long_context_prompt(&composed, long.max_tokens()))?;
                let neg_long_states =
                    long.encode(&pad_long_context_prompt(&negative, long.max_tokens()))?;

                Ok(PromptEncoding {
                    embeddings: join_dual_stream(&clip_states, &long_states)?,
                    negative_embeddings: Some(join_dual_stream(
                        &neg_clip_states,
                        &neg_long_states,
                    )?),
                    pooled: Some(pooled),
                    negative_pooled: Some(neg_pooled),
                })
            }
            BackendKind::FlowTransformerV2 => {
                // No negative stream: guidance is distilled into the model.
                let (_clip_states, pooled) = self.text_encoder.encode_with_pooled(&composed)?;
                let long = self.long_context.as_mut().ok_or_else(|| {
                    Error::config("flow-transformer-v2 pipeline has no long-context encoder")
                })?;
                let long_states =
                    long.encode(&pad_long_context_prompt(&composed, long.max_tokens()))?;
                Ok(PromptEncoding {
                    embeddings: long_states,
                    negative_embeddings: None,
                    pooled: Some(pooled),
                    negative_pooled: None,
                })
            }
        }
    }

    /// Overwrite the tail of the negative-prompt embedding with the
    /// retained anti-identity rows, one segment per encoder in declaration
    /// order. The alignment is keyed by the per-encoder row partition, not
    /// raw tensor offsets, so a changed vector count fails loudly instead
    /// of silently misaligning.
    fn blend_negative_identity(&self, encoding: &mut PromptEncoding) -> Result<()> {
        let Some((negative_rows, rows_per_encoder)) = &self.negative_identity else {
            return Ok(());
        };
        let Some(negative) = encoding.negative_embeddings.as_ref() else {
            return Ok(());
        };

        let (batch, seq_len, _dim) = negative.dims3()?;
        let partition_total: usize = rows_per_encoder.iter().sum();
        if partition_total != negative_rows.dim(0)? {
            return Err(Error::Shape {
                context: "negative identity partition",
                expected: negative_rows.dim(0)?,
                actual: partition_total,
            });
        }
        if partition_total > seq_len {
            return Err(Error::Shape {
                context: "negative embedding blending",
                expected: seq_len,
                actual: partition_total,
            });
        }

        let rows = negative_rows
            .to_device(negative.device())?
            .to_dtype(negative.dtype())?
            .unsqueeze(0)?;
        let rows = if batch > 1 {
            rows.repeat((batch, 1, 1))?
        } else {
            rows
        };
        let head = negative.narrow(1, 0, seq_len - partition_total)?;
        encoding.negative_embeddings = Some(Tensor::cat(&[&head, &rows], 1)?);

        tracing::debug!(
            rows = partition_total,
            encoders = rows_per_encoder.len(),
            "blended anti-identity rows into the negative embedding"
        );
        Ok(())
    }

    /// Generate a batch of images for one prompt. Returns `[3, H, W]` RGB
    /// tensors in `[0, 1]`, one per requested output.
    pub fn generate(&mut self, request: &GenerationRequest) -> Result<Vec<Tensor>> {
        if let Some(seed) = request.seed {
            if !matches!(self.device, Device::Cpu) {
                self.device.set_seed(seed)?;
            }
        }

        let mut encoding =
            self.encode_prompt(&request.prompt, request.negative_prompt.as_deref())?;
        if self.config.blend_negative_identity {
            self.blend_negative_identity(&mut encoding)?;
        }
        let encoding = encoding.repeat(request.out_image_count)?;

        let params = SamplingParams {
            num_inference_steps: self.config.num_inference_steps,
            guidance_scale: request.guidance_scale,
            out_image_count: request.out_image_count,
            init_latents: request.init_latents.clone(),
            strength: request.strength,
        };
        let images = self.backend.sample(&encoding, &params)?;

        let batch = images.dim(0)?;
        (0..batch).map(|i| Ok(images.i(i)?)).collect()
    }
}

/// Zero-pad the short-context states up to the long-context width, then
/// concatenate the two streams along the sequence axis.
fn join_dual_stream(clip_states: &Tensor, long_states: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, clip_dim) = clip_states.dims3()?;
    let (_long_batch, _long_seq, long_dim) = long_states.dims3()?;
    if long_dim < clip_dim {
        return Err(Error::Shape {
            context: "dual-stream context width",
            expected: clip_dim,
            actual: long_dim,
        });
    }
    let clip_states = if long_dim > clip_dim {
        let zeros = Tensor::zeros(
            (batch, seq_len, long_dim - clip_dim),
            clip_states.dtype(),
            clip_states.device(),
        )?;
        Tensor::cat(&[clip_states, &zeros], 2)?
    } else {
        clip_states.clone()
    };
    Ok(Tensor::cat(&[&clip_states, long_states], 1)?)
}

fn build_latent_unet(
    config: &PipelineConfig,
    base: &ModelSource,
    api: &hf_hub::api::sync::Api,
    legacy_converter: Option<&dyn LegacyUnetConverter>,
    device: &Device,
    dtype: DType,
) -> Result<LatentUnetBackend> {
    let unet_config = UNet2DConditionModelConfig::default();
    let use_flash_attn = cfg!(feature = "flash-attn");

    let main_unet = match &config.main_unet_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "replacing the main U-Net");
            let tensors = load_unet_state_dict(path, device, legacy_converter)?;
            let vb = VarBuilder::from_tensors(tensors, dtype, device);
            UNet2DConditionModel::new(vb, 4, 4, use_flash_attn, unet_config.clone())?
        }
        None => {
            let file = base.get(api, "unet/diffusion_pytorch_model.safetensors")?;
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? };
            UNet2DConditionModel::new(vb, 4, 4, use_flash_attn, unet_config.clone())?
        }
    };

    let unet = if config.extra_unet_paths.is_empty() {
        UnetEnsemble::single(main_unet)
    } else {
        let mut members = vec![main_unet];
        let mut weights = vec![1.0];
        for (path, weight) in config
            .extra_unet_paths
            .iter()
            .zip(config.extra_unet_weights.iter())
        {
            let tensors = load_unet_state_dict(path, device, legacy_converter)?;
            let vb = VarBuilder::from_tensors(tensors, dtype, device);
            members.push(UNet2DConditionModel::new(
                vb,
                4,
                4,
                use_flash_attn,
                unet_config.clone(),
            )?);
            weights.push(*weight);
        }
        tracing::info!(members = members.len(), "built U-Net ensemble");
        UnetEnsemble::new(members, weights)?
    };

    let vae_config = AutoEncoderKLConfig::default();
    let vae = match &config.vae_override {
        Some(path) => {
            tracing::info!(path = %path.display(), "replacing the VAE");
            let tensors = load_tensor_map(path, device)?;
            let vb = VarBuilder::from_tensors(tensors, dtype, device);
            AutoEncoderKL::new(vb, 3, 3, vae_config)?
        }
        None => {
            let file = base.get(api, "vae/diffusion_pytorch_model.safetensors")?;
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? };
            AutoEncoderKL::new(vb, 3, 3, vae_config)?
        }
    };

    Ok(LatentUnetBackend::new(
        unet,
        vae,
        config.height,
        config.width,
        device.clone(),
        dtype,
    ))
}

fn build_flow_match(
    config: &PipelineConfig,
    base: &ModelSource,
    api: &hf_hub::api::sync::Api,
    device: &Device,
    dtype: DType,
) -> Result<FlowMatchBackend> {
    let file = base.get(api, "transformer/diffusion_pytorch_model.safetensors")?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? };
    let mmdit = MMDiT::new(
        &MmditConfig::sd3_medium(),
        cfg!(feature = "flash-attn"),
        vb,
    )?;

    let vae_config = AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 16,
        norm_num_groups: 32,
        use_quant_conv: false,
        use_post_quant_conv: false,
    };
    let vae_file = base.get(api, "vae/diffusion_pytorch_model.safetensors")?;
    let vae_vb = unsafe { VarBuilder::from_mmaped_safetensors(&[vae_file], DType::F32, device)? };
    let vae = AutoEncoderKL::new(vae_vb, 3, 3, vae_config)?;

    Ok(FlowMatchBackend::new(
        mmdit,
        vae,
        config.height,
        config.width,
        device.clone(),
        dtype,
    ))
}

fn build_guidance_distilled(
    config: &PipelineConfig,
    base: &ModelSource,
    api: &hf_hub::api::sync::Api,
    device: &Device,
    dtype: DType,
) -> Result<GuidanceDistilledBackend> {
    let file = base.get(api, "flux1-schnell.safetensors")?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? };
    let model = flux::model::Flux::new(&flux::model::Config::schnell(), vb)?;

    let ae_file = base.get(api, "ae.safetensors")?;
    let ae_vb = unsafe { VarBuilder::from_mmaped_safetensors(&[ae_file], dtype, device)? };
    let autoencoder =
        flux::autoencoder::AutoEncoder::new(&flux::autoencoder::Config::schnell(), ae_vb)?;

    Ok(GuidanceDistilledBackend::new(
        model,
        autoencoder,
        config.height,
        config.width,
        device.clone(),
        dtype,
    ))
}

fn load_long_context(api: &hf_hub::api::sync::Api, device: &Device) -> Result<LongContextEncoder> {
    let repo = api.repo(hf_hub::Repo::model(T5_REPO.to_string()));
    let config_path = repo.get("config.json")?;
    let weights_path = repo.get("model.safetensors")?;
    let tokenizer_path = api
        .repo(hf_hub::Repo::model(T5_TOKENIZER_REPO.to_string()))
        .get(T5_TOKENIZER_FILE)?;
    // F32 like the short-context encoder; samplers convert downstream.
    LongContextEncoder::from_files(
        &tokenizer_path,
        &config_path,
        &weights_path,
        LONG_CONTEXT_TOKENS,
        device,
        DType::F32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_dual_stream_pads_and_concatenates() {
        let device = Device::Cpu;
        let clip = Tensor::ones((1, 4, 8), DType::F32, &device).unwrap();
        let long = Tensor::ones((1, 6, 12), DType::F32, &device).unwrap();
        let joined = join_dual_stream(&clip, &long).unwrap();
        assert_eq!(joined.dims(), &[1, 10, 12]);

        // The padded tail of the short stream is zero.
        let padded_tail: Vec<f32> = joined
            .narrow(1, 0, 4)
            .unwrap()
            .narrow(2, 8, 4)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(padded_tail.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn join_dual_stream_rejects_narrow_long_stream() {
        let device = Device::Cpu;
        let clip = Tensor::ones((1, 4, 12), DType::F32, &device).unwrap();
        let long = Tensor::ones((1, 6, 8), DType::F32, &device).unwrap();
        assert!(matches!(
            join_dual_stream(&clip, &long),
            Err(Error::Shape { .. })
        ));
    }

    #[test]
    fn generation_request_defaults() {
        let request = GenerationRequest::new("a z at the beach");
        assert_eq!(request.guidance_scale, 4.0);
        assert_eq!(request.out_image_count, 4);
        assert_eq!(request.strength, 0.8);
        assert!(request.negative_prompt.is_none());
    }
}
