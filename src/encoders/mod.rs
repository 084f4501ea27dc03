//! Identity encoder adapters.
//!
//! Each adapter wraps one face-identity-to-embedding backend and produces a
//! fixed-size block of pseudo-token embedding rows per subject, plus an
//! optional anti-identity block for negative-prompt blending. Face
//! detection/recognition itself is a collaborator behind [`FaceEmbedder`];
//! adapters only project its output into the text encoder's embedding space.

mod arc2face;
mod consistent_id;

pub use arc2face::Arc2FaceEncoder;
pub use consistent_id::ConsistentIdEncoder;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle::{DType, Device, Tensor, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};

use crate::checkpoint::load_tensor_map;
use crate::config::{EncoderKind, IdentityEncoderSpec};
use crate::error::{Error, Result};

/// The identity source for one embedding-generation call.
///
/// Exactly one source must be active: image paths, a precomputed raw
/// face-recognition embedding, or a synthesized random identity.
#[derive(Debug, Clone, Default)]
pub struct IdentityRequest {
    pub image_paths: Option<Vec<PathBuf>>,
    pub face_embedding: Option<Tensor>,
    pub gen_random: bool,
}

impl IdentityRequest {
    pub fn from_images(paths: Vec<PathBuf>) -> Self {
        Self {
            image_paths: Some(paths),
            ..Default::default()
        }
    }

    pub fn from_face_embedding(embedding: Tensor) -> Self {
        Self {
            face_embedding: Some(embedding),
            ..Default::default()
        }
    }

    /// Synthesize a pseudo-identity, bypassing face extraction entirely.
    /// Useful for sampling diversity and for testing.
    pub fn random() -> Self {
        Self {
            gen_random: true,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.gen_random {
            return Ok(());
        }
        match (&self.image_paths, &self.face_embedding) {
            (Some(_), Some(_)) => Err(Error::input(
                "image paths and a raw face embedding are mutually exclusive",
            )),
            (None, None) => Err(Error::input(
                "an identity source is required: image paths, a raw face embedding, \
                 or a random identity",
            )),
            (Some(paths), None) if paths.is_empty() => {
                Err(Error::input("the image path list is empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Subject embeddings produced by one adapter.
pub struct IdentityEmbeddings {
    /// `[num_id_vectors, D]` rows destined for the vocabulary patch.
    pub subject: Tensor,
    /// Anti-identity rows of the same shape, when the backend has a natural
    /// negative signal. `None` is not an error; callers substitute zeros.
    pub negative: Option<Tensor>,
}

/// One face-identity-to-embedding backend.
pub trait IdentityEncoder {
    fn kind(&self) -> EncoderKind;

    fn num_id_vectors(&self) -> usize;

    /// The capability scale resolved at construction and applied to every
    /// embedding this encoder produces.
    fn output_scale(&self) -> f64;

    /// `noise_level` perturbs the extracted identity signal before
    /// projection; pass 0 at inference.
    fn generate_embeddings(
        &self,
        request: &IdentityRequest,
        noise_level: f64,
    ) -> Result<IdentityEmbeddings>;
}

/// Face-recognition collaborator: images in, one raw id embedding out.
pub trait FaceEmbedder: Send + Sync {
    /// Embed the subject from one or more face images, returning a single
    /// `[id_dim]` vector (multiple images are averaged by the implementation).
    fn embed(&self, image_paths: &[PathBuf]) -> Result<Tensor>;
}

/// Reads face embeddings extracted offline into safetensors sidecars:
/// `subject.png` is resolved to `subject.safetensors` holding a
/// `face_embedding` tensor.
pub struct PrecomputedFaceEmbedder {
    device: Device,
}

impl PrecomputedFaceEmbedder {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        match path.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => path.to_path_buf(),
            _ => path.with_extension("safetensors"),
        }
    }
}

impl FaceEmbedder for PrecomputedFaceEmbedder {
    fn embed(&self, image_paths: &[PathBuf]) -> Result<Tensor> {
        if image_paths.is_empty() {
            return Err(Error::input("the image path list is empty"));
        }
        let mut embeddings = Vec::with_capacity(image_paths.len());
        for path in image_paths {
            let sidecar = Self::sidecar_path(path);
            let tensors = load_tensor_map(&sidecar, &self.device)?;
            let embedding = tensors.get("face_embedding").ok_or_else(|| {
                Error::config(format!(
                    "{} has no `face_embedding` tensor",
                    sidecar.display()
                ))
            })?;
            embeddings.push(embedding.flatten_all()?.to_dtype(DType::F32)?);
        }
        let stacked = Tensor::stack(&embeddings, 0)?;
        Ok(stacked.mean(0)?)
    }
}

/// Projection head mapping a raw id vector into `num_id_vectors` rows of the
/// text encoder's embedding space. Loaded from the adapter checkpoint under
/// the `id_projector` sub-module.
pub(crate) struct IdProjector {
    proj_in: Linear,
    proj_out: Linear,
    norm: LayerNorm,
    num_id_vectors: usize,
    embed_dim: usize,
}

impl IdProjector {
    pub(crate) fn new(
        id_dim: usize,
        hidden_dim: usize,
        num_id_vectors: usize,
        embed_dim: usize,
        vb: VarBuilder,
    ) -> candle::Result<Self> {
        Ok(Self {
            proj_in: linear(id_dim, hidden_dim, vb.pp("proj_in"))?,
            proj_out: linear(hidden_dim, num_id_vectors * embed_dim, vb.pp("proj_out"))?,
            norm: layer_norm(embed_dim, 1e-5, vb.pp("norm"))?,
            num_id_vectors,
            embed_dim,
        })
    }

    /// `[1, id_dim]` in, `[num_id_vectors, embed_dim]` out.
    pub(crate) fn forward(&self, id_embedding: &Tensor) -> candle::Result<Tensor> {
        let xs = self.proj_in.forward(id_embedding)?.gelu()?;
        let xs = self.proj_out.forward(&xs)?;
        let xs = xs.reshape((self.num_id_vectors, self.embed_dim))?;
        self.norm.forward(&xs)
    }
}

/// Unit-normalize each row of `xs`.
pub(crate) fn normalize_rows(xs: &Tensor) -> candle::Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    xs.broadcast_div(&norm)
}

/// Resolve a request into one normalized `[1, id_dim]` identity vector,
/// optionally perturbed by `noise_level`.
pub(crate) fn resolve_id_embedding(
    request: &IdentityRequest,
    face_embedder: &dyn FaceEmbedder,
    id_dim: usize,
    noise_level: f64,
    device: &Device,
) -> Result<Tensor> {
    request.validate()?;

    let id = if request.gen_random {
        Tensor::randn(0f32, 1f32, (1, id_dim), device)?
    } else if let Some(raw) = &request.face_embedding {
        let raw = raw.to_device(device)?.to_dtype(DType::F32)?;
        let raw = match raw.rank() {
            1 => raw.unsqueeze(0)?,
            _ => raw,
        };
        let (_count, dim) = raw.dims2()?;
        if dim != id_dim {
            return Err(Error::Shape {
                context: "raw face embedding width",
                expected: id_dim,
                actual: dim,
            });
        }
        // Multiple embeddings for one subject are averaged.
        raw.mean_keepdim(0)?
    } else {
        let paths = request.image_paths.as_deref().unwrap_or(&[]);
        let embedded = face_embedder.embed(paths)?;
        let dim = embedded.elem_count();
        if dim != id_dim {
            return Err(Error::Shape {
                context: "face embedder output width",
                expected: id_dim,
                actual: dim,
            });
        }
        embedded.reshape((1, id_dim))?
    };

    let id = normalize_rows(&id)?;
    if noise_level > 0.0 {
        let noise = (id.randn_like(0.0, 1.0)? * noise_level)?;
        Ok(normalize_rows(&(id + noise)?)?)
    } else {
        Ok(id)
    }
}

/// Build the adapter for one encoder spec.
pub fn create_identity_encoder(
    spec: &IdentityEncoderSpec,
    face_embedder: Arc<dyn FaceEmbedder>,
    device: &Device,
) -> Result<Box<dyn IdentityEncoder>> {
    let encoder: Box<dyn IdentityEncoder> = match spec.kind {
        EncoderKind::Arc2Face => Box::new(Arc2FaceEncoder::load(spec, face_embedder, device)?),
        EncoderKind::ConsistentId => {
            Box::new(ConsistentIdEncoder::load(spec, face_embedder, device)?)
        }
    };
    tracing::info!(
        kind = %spec.kind,
        num_id_vectors = encoder.num_id_vectors(),
        output_scale = encoder.output_scale(),
        "loaded identity encoder"
    );
    Ok(encoder)
}

/// The per-subject embedding batch: every configured encoder's rows
/// concatenated in declaration order, with an equal-shaped negative batch.
///
/// Produced fresh per subject image set; immutable once produced. The
/// injector consumes `subject`; `negative` and `rows_per_encoder` stay
/// around for negative-prompt blending, which aligns segments by encoder
/// rather than by raw tensor offsets.
#[derive(Debug)]
pub struct IdentityEmbeddingBatch {
    pub subject: Tensor,
    pub negative: Tensor,
    pub rows_per_encoder: Vec<usize>,
}

impl IdentityEmbeddingBatch {
    pub fn total_rows(&self) -> usize {
        self.rows_per_encoder.iter().sum()
    }
}

/// Run every adapter and assemble the batch, zero-filling negatives for
/// encoders without a native anti-identity signal.
pub fn collect_identity_embeddings(
    encoders: &[Box<dyn IdentityEncoder>],
    request: &IdentityRequest,
    noise_level: f64,
) -> Result<IdentityEmbeddingBatch> {
    if encoders.is_empty() {
        return Err(Error::config("no identity encoders are configured"));
    }

    let mut subject_blocks = Vec::with_capacity(encoders.len());
    let mut negative_blocks = Vec::with_capacity(encoders.len());
    let mut rows_per_encoder = Vec::with_capacity(encoders.len());

    for encoder in encoders {
        let embeddings = encoder.generate_embeddings(request, noise_level)?;
        let rows = embeddings.subject.dim(0)?;
        if rows != encoder.num_id_vectors() {
            return Err(Error::Shape {
                context: "identity embedding rows",
                expected: encoder.num_id_vectors(),
                actual: rows,
            });
        }
        let negative = match embeddings.negative {
            Some(negative) => negative,
            None => embeddings.subject.zeros_like()?,
        };
        rows_per_encoder.push(rows);
        subject_blocks.push(embeddings.subject);
        negative_blocks.push(negative);
    }

    Ok(IdentityEmbeddingBatch {
        subject: Tensor::cat(&subject_blocks, 0)?,
        negative: Tensor::cat(&negative_blocks, 0)?,
        rows_per_encoder,
    })
}
