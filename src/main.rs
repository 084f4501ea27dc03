//! Subject-personalized image generation CLI.
//!
//! # Usage
//!
//! ```bash
//! # Text-to-image with a precomputed face embedding
//! cargo run --release -- \
//!     --backend latent-unet-txt2img \
//!     --encoder arc2face=models/arc2face.safetensors \
//!     --encoder consistentid=models/consistentid.safetensors:2.0 \
//!     --face-embedding subject.safetensors \
//!     --prompt "a z in the jungle" \
//!     --output subject.png
//!
//! # Random pseudo-identity on the flow backend
//! cargo run --release -- \
//!     --backend flow-transformer-v2 \
//!     --encoder arc2face=models/arc2face.safetensors \
//!     --random-identity \
//!     --prompt "portrait of a z, studio lighting"
//! ```

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use candle::{DType, Device, Tensor};
use clap::Parser;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;

use idprompt::encoders::IdentityRequest;
use idprompt::{
    BackendKind, EncoderKind, GenerationRequest, IdentityEncoderSpec, PipelineConfig,
    SubjectPipeline,
};

#[derive(Parser)]
#[command(
    name = "idprompt",
    about = "Subject-personalized diffusion image generation",
    version
)]
struct Cli {
    /// Backend kind: latent-unet-txt2img, latent-unet-img2img,
    /// flow-transformer-v1, flow-transformer-v2 or encoder-only.
    #[arg(long, default_value = "latent-unet-txt2img")]
    backend: String,

    /// Base model: a local diffusers-layout directory or a hub repo id.
    #[arg(long)]
    base_model: Option<String>,

    /// Identity encoder spec, repeatable: `kind=checkpoint[:scale]`.
    #[arg(long = "encoder", required = true)]
    encoders: Vec<String>,

    /// Subject face images (paired with offline-extracted embeddings).
    #[arg(long = "subject-image")]
    subject_images: Vec<PathBuf>,

    /// Precomputed raw face-recognition embedding (safetensors).
    #[arg(long)]
    face_embedding: Option<PathBuf>,

    /// Synthesize a random pseudo-identity instead of extracting one.
    #[arg(long)]
    random_identity: bool,

    /// Noise level applied to the identity signal before projection.
    #[arg(long, default_value_t = 0.0)]
    noise_level: f64,

    /// The prompt; the subject word is replaced by placeholder tokens.
    #[arg(long, default_value = "portrait of a z")]
    prompt: String,

    /// Negative prompt override.
    #[arg(long)]
    negative_prompt: Option<String>,

    /// Subject placeholder word.
    #[arg(long, default_value = "z")]
    subject: String,

    /// Guidance scale.
    #[arg(long, default_value_t = 4.0)]
    guidance_scale: f64,

    /// Number of denoising steps.
    #[arg(long, default_value_t = 50)]
    num_inference_steps: usize,

    /// Number of output images.
    #[arg(long, default_value_t = 4)]
    count: usize,

    /// Image height (must be divisible by 8).
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Image width (must be divisible by 8).
    #[arg(long, default_value_t = 512)]
    width: usize,

    /// Reference strength for image-to-image (0 = keep, 1 = regenerate).
    #[arg(long, default_value_t = 0.8)]
    strength: f64,

    /// Initial latent tensor for image-to-image (safetensors, key `latents`).
    #[arg(long)]
    init_latents: Option<PathBuf>,

    /// Alternate VAE checkpoint.
    #[arg(long)]
    vae: Option<PathBuf>,

    /// Alternate text encoder weights.
    #[arg(long)]
    text_encoder: Option<PathBuf>,

    /// Replacement main U-Net checkpoint.
    #[arg(long)]
    main_unet: Option<PathBuf>,

    /// Extra ensemble U-Net checkpoints, repeatable.
    #[arg(long = "extra-unet")]
    extra_unets: Vec<PathBuf>,

    /// Mixing weights for the extra U-Nets, one per `--extra-unet`.
    #[arg(long = "unet-weight")]
    unet_weights: Vec<f64>,

    /// Blend anti-identity rows into the negative prompt embedding.
    #[arg(long)]
    blend_negative_identity: bool,

    /// Random seed for reproducibility.
    #[arg(long)]
    seed: Option<u64>,

    /// Run on CPU instead of GPU.
    #[arg(long)]
    cpu: bool,

    /// Use F32 instead of the device half-precision default.
    #[arg(long)]
    use_f32: bool,

    /// Enable Chrome tracing profiler output.
    #[arg(long)]
    tracing: bool,

    /// Output filename; multiple images get an index suffix.
    #[arg(long, default_value = "idprompt.png")]
    output: String,
}

/// Parse one `kind=checkpoint[:scale]` encoder argument.
fn parse_encoder_spec(arg: &str) -> Result<IdentityEncoderSpec> {
    let (kind, rest) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected kind=checkpoint[:scale], got {arg:?}"))?;
    let kind = EncoderKind::from_str(kind)?;
    let (checkpoint, scale) = match rest.rsplit_once(':') {
        Some((path, scale)) if scale.parse::<f64>().is_ok() => {
            (path, scale.parse::<f64>().unwrap())
        }
        _ => (rest, -1.0),
    };
    Ok(IdentityEncoderSpec::new(kind, checkpoint).with_output_scale(scale))
}

fn setup_tracing(enabled: bool) -> Option<tracing_chrome::FlushGuard> {
    if enabled {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "idprompt=info".into()),
            )
            .init();
        None
    }
}

fn setup_device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Save a `[3, H, W]` tensor in `[0, 1]` as a PNG.
fn save_image(image: &Tensor, path: &str) -> Result<()> {
    let image = (image.clamp(0f32, 1f32)? * 255.0)?.to_dtype(DType::U8)?;
    let (channels, height, width) = image.dims3()?;
    if channels != 3 {
        return Err(anyhow!("expected an RGB image, got {channels} channels"));
    }
    let pixels = image
        .permute((1, 2, 0))?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let buffer: image::ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| anyhow!("image buffer size mismatch"))?;
    buffer.save(path)?;
    Ok(())
}

fn output_path(template: &str, index: usize, count: usize) -> String {
    if count <= 1 {
        return template.to_string();
    }
    match template.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{index}.{ext}"),
        None => format!("{template}-{index}"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_tracing(cli.tracing);

    let backend_kind = BackendKind::from_str(&cli.backend)?;
    let device = setup_device(cli.cpu)?;
    let dtype = if cli.use_f32 || matches!(device, Device::Cpu) {
        DType::F32
    } else {
        DType::F16
    };
    if let Some(seed) = cli.seed {
        if !matches!(device, Device::Cpu) {
            device.set_seed(seed)?;
        }
    }

    println!("idprompt — subject-personalized generation");
    println!("Backend: {backend_kind}, device: {device:?}, dtype: {dtype:?}");

    let specs = cli
        .encoders
        .iter()
        .map(|arg| parse_encoder_spec(arg))
        .collect::<Result<Vec<_>>>()?;

    let mut config = PipelineConfig::new(backend_kind);
    config.base_model = cli.base_model;
    config.vae_override = cli.vae;
    config.text_encoder_override = cli.text_encoder;
    config.main_unet_path = cli.main_unet;
    config.extra_unet_paths = cli.extra_unets;
    config.extra_unet_weights = cli.unet_weights;
    config.subject_placeholder = cli.subject;
    config.num_inference_steps = cli.num_inference_steps;
    config.negative_prompt = cli.negative_prompt.clone();
    config.blend_negative_identity = cli.blend_negative_identity;
    config.height = cli.height;
    config.width = cli.width;

    println!("\n[1/4] Loading pipeline...");
    let mut pipeline = SubjectPipeline::new(config, specs, device.clone(), dtype)?;
    println!("  Placeholder tokens: {}", pipeline.placeholder_tokens().joined_str());

    println!("\n[2/4] Preparing subject embeddings...");
    let identity = if cli.random_identity {
        IdentityRequest::random()
    } else if let Some(path) = &cli.face_embedding {
        let tensors = idprompt::checkpoint::load_tensor_map(path, &device)?;
        let embedding = tensors
            .get("face_embedding")
            .or_else(|| tensors.values().next())
            .ok_or_else(|| anyhow!("{} holds no tensors", path.display()))?;
        IdentityRequest::from_face_embedding(embedding.clone())
    } else {
        IdentityRequest::from_images(cli.subject_images.clone())
    };
    let batch = pipeline.prepare_subject_embeddings(&identity, cli.noise_level)?;
    println!("  Injected {} identity rows", batch.total_rows());

    println!("\n[3/4] Generating...");
    println!("  Prompt: {}", cli.prompt);
    println!("  Composed: {}", pipeline.compose_prompt(&cli.prompt));

    let init_latents = match &cli.init_latents {
        Some(path) => {
            let tensors = idprompt::checkpoint::load_tensor_map(path, &device)?;
            Some(
                tensors
                    .get("latents")
                    .ok_or_else(|| anyhow!("{} has no `latents` tensor", path.display()))?
                    .clone(),
            )
        }
        None => None,
    };

    let request = GenerationRequest {
        prompt: cli.prompt,
        negative_prompt: cli.negative_prompt,
        guidance_scale: cli.guidance_scale,
        out_image_count: cli.count,
        init_latents,
        strength: cli.strength,
        seed: cli.seed,
    };
    let images = pipeline.generate(&request)?;

    println!("\n[4/4] Saving {} image(s)...", images.len());
    for (index, image) in images.iter().enumerate() {
        let path = output_path(&cli.output, index, images.len());
        save_image(image, &path)?;
        println!("  {path}");
    }

    Ok(())
}
