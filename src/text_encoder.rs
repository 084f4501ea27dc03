//! CLIP-family text encoder with a patchable vocabulary.
//!
//! The upstream conditioning encoders ship with a fixed-size token embedding
//! table, but subject personalization has to append placeholder rows to that
//! table at runtime and overwrite them with freshly computed identity
//! embeddings. This module therefore owns the full text-encoder forward pass
//! and exposes the embedding table as a first-class, resizable value:
//!
//! - [`SubjectTextEncoder::extend`] grows the table for an installed
//!   [`VocabularyPatch`] (once; a second extension is a configuration error),
//! - [`SubjectTextEncoder::inject_subject_embeddings`] overwrites the patch
//!   rows, detached from any autograd graph; re-injection for a new subject
//!   is a normal, supported operation,
//! - [`SubjectTextEncoder::embedding_rows`] reads the rows back through the
//!   same patch, so table offsets are derived in exactly one place.
//!
//! Weight names follow the diffusers `text_encoder/model.safetensors` layout
//! (`text_model.embeddings.token_embedding.weight`, ...), so stock
//! checkpoints load unmodified.

use candle::{DType, Device, IndexOp, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, Module, VarBuilder};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::error::{Error, Result};
use crate::vocab::{grow_embedding_table, read_embedding_rows, splice_embedding_rows, VocabularyPatch};

/// End-of-text marker doubling as the padding token in CLIP vocabularies.
const EOT_TOKEN: &str = "<|endoftext|>";

/// Text encoder hyperparameters, deserializable from a diffusers
/// `text_encoder/config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TextEncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
}

impl TextEncoderConfig {
    /// The SD-1.5 family CLIP ViT-L/14 text encoder.
    pub fn sd15() -> Self {
        Self {
            vocab_size: 49408,
            hidden_size: 768,
            intermediate_size: 3072,
            max_position_embeddings: 77,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        }
    }
}

fn quick_gelu(xs: &Tensor) -> candle::Result<Tensor> {
    xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?)?
}

#[derive(Debug)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &TextEncoderConfig, vb: VarBuilder) -> candle::Result<Self> {
        let embed_dim = cfg.hidden_size;
        let num_heads = cfg.num_attention_heads;
        let head_dim = embed_dim / num_heads;
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> candle::Result<Tensor> {
        let (b, seq_len, embed_dim) = xs.dims3()?;
        let shape = (b, seq_len, self.num_heads, self.head_dim);

        let q = self.q_proj.forward(xs)?.reshape(shape)?.transpose(1, 2)?.contiguous()?;
        let k = self.k_proj.forward(xs)?.reshape(shape)?.transpose(1, 2)?.contiguous()?;
        let v = self.v_proj.forward(xs)?.reshape(shape)?.transpose(1, 2)?.contiguous()?;

        let attn = (q.matmul(&k.t()?)? * self.scale)?;
        let attn = attn.broadcast_add(mask)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, embed_dim))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(cfg: &TextEncoderConfig, vb: VarBuilder) -> candle::Result<Self> {
        Ok(Self {
            fc1: linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?,
            fc2: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        self.fc2.forward(&quick_gelu(&self.fc1.forward(xs)?)?)
    }
}

#[derive(Debug)]
struct EncoderLayer {
    self_attn: Attention,
    layer_norm1: LayerNorm,
    mlp: Mlp,
    layer_norm2: LayerNorm,
}

impl EncoderLayer {
    fn new(cfg: &TextEncoderConfig, vb: VarBuilder) -> candle::Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            layer_norm1: layer_norm(cfg.hidden_size, 1e-5, vb.pp("layer_norm1"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            layer_norm2: layer_norm(cfg.hidden_size, 1e-5, vb.pp("layer_norm2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> candle::Result<Tensor> {
        let residual = xs;
        let xs = self.self_attn.forward(&self.layer_norm1.forward(xs)?, mask)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let ys = self.mlp.forward(&self.layer_norm2.forward(&xs)?)?;
        ys + residual
    }
}

fn causal_attention_mask(seq_len: usize, device: &Device, dtype: DType) -> candle::Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)
}

/// The frozen conditioning encoder whose vocabulary this crate patches.
///
/// Exclusively owned by the pipeline instance that created it; concurrent
/// pipelines must not share one.
pub struct SubjectTextEncoder {
    tokenizer: Tokenizer,
    token_embedding: Embedding,
    position_embedding: Tensor,
    layers: Vec<EncoderLayer>,
    final_layer_norm: LayerNorm,
    config: TextEncoderConfig,
    pad_token_id: u32,
    vocab_rows: usize,
    extended: bool,
    device: Device,
    dtype: DType,
}

impl SubjectTextEncoder {
    pub fn new(
        tokenizer: Tokenizer,
        cfg: TextEncoderConfig,
        vb: VarBuilder,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vs = vb.pp("text_model");
        let token_embedding = embedding(cfg.vocab_size, cfg.hidden_size, vs.pp("embeddings.token_embedding"))?;
        let position_embedding = vs.pp("embeddings.position_embedding").get(
            (cfg.max_position_embeddings, cfg.hidden_size),
            "weight",
        )?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::new(&cfg, vs.pp(format!("encoder.layers.{i}"))))
            .collect::<candle::Result<Vec<_>>>()?;
        let final_layer_norm = layer_norm(cfg.hidden_size, 1e-5, vs.pp("final_layer_norm"))?;

        let pad_token_id = tokenizer.token_to_id(EOT_TOKEN).unwrap_or(0);

        Ok(Self {
            tokenizer,
            token_embedding,
            position_embedding,
            layers,
            final_layer_norm,
            vocab_rows: cfg.vocab_size,
            config: cfg,
            pad_token_id,
            extended: false,
            device: device.clone(),
            dtype,
        })
    }

    /// Load tokenizer and weights from local files.
    pub fn from_files(
        tokenizer_path: &std::path::Path,
        weights_path: &std::path::Path,
        cfg: TextEncoderConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(Error::tokenizer)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };
        Self::new(tokenizer, cfg, vb, device, dtype)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn tokenizer_mut(&mut self) -> &mut Tokenizer {
        &mut self.tokenizer
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    pub fn max_tokens(&self) -> usize {
        self.config.max_position_embeddings
    }

    /// Current number of rows in the token embedding table.
    pub fn vocab_rows(&self) -> usize {
        self.vocab_rows
    }

    /// Grow the embedding table for an installed vocabulary patch.
    ///
    /// The appended rows are zero placeholders until an injection runs;
    /// encoding placeholder tokens before that produces undefined
    /// conditioning, not a crash. Calling this twice is a configuration
    /// error by design.
    pub fn extend(&mut self, patch: &VocabularyPatch) -> Result<()> {
        if self.extended {
            return Err(Error::config(
                "text encoder vocabulary is already extended; \
                 build a fresh pipeline instead of re-initializing this one",
            ));
        }
        if patch.first_row() != self.vocab_rows {
            return Err(Error::config(format!(
                "tokenizer and embedding table are out of sync: patch starts at row {} \
                 but the table has {} rows",
                patch.first_row(),
                self.vocab_rows
            )));
        }

        let table = grow_embedding_table(self.token_embedding.embeddings(), patch.len())?;
        let old_rows = self.vocab_rows;
        self.vocab_rows += patch.len();
        self.token_embedding = Embedding::new(table, self.config.hidden_size);
        self.extended = true;

        tracing::info!(
            old_rows,
            new_rows = self.vocab_rows,
            "resized text encoder token embedding table"
        );
        Ok(())
    }

    /// Overwrite the patch rows with freshly computed identity embeddings.
    ///
    /// The rows are detached before the write so the patched table never
    /// creates a backward-pass dependency on the identity encoders. A
    /// mismatched row count fails with a shape error and leaves the table
    /// unmodified.
    pub fn inject_subject_embeddings(
        &mut self,
        patch: &VocabularyPatch,
        subject_embeddings: &Tensor,
    ) -> Result<()> {
        let (rows, _dim) = subject_embeddings.dims2()?;
        if rows != patch.len() {
            return Err(Error::Shape {
                context: "subject embedding injection",
                expected: patch.len(),
                actual: rows,
            });
        }

        let rows_t = subject_embeddings
            .detach()
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let table = splice_embedding_rows(
            self.token_embedding.embeddings(),
            patch.first_row(),
            &rows_t,
        )?;
        self.token_embedding = Embedding::new(table, self.config.hidden_size);

        tracing::debug!(
            rows = patch.len(),
            first_row = patch.first_row(),
            "injected subject embeddings into the text encoder"
        );
        Ok(())
    }

    /// Read the patch rows back out of the table.
    pub fn embedding_rows(&self, patch: &VocabularyPatch) -> Result<Tensor> {
        read_embedding_rows(
            self.token_embedding.embeddings(),
            patch.first_row(),
            patch.len(),
        )
    }

    /// Re-place the patchable table on `device` if a bulk transfer left it
    /// behind on host memory.
    pub fn ensure_device(&mut self, device: &Device) -> Result<()> {
        if self.token_embedding.embeddings().device().same_device(device) {
            return Ok(());
        }
        tracing::warn!("text encoder embedding table found off-device, re-placing before use");
        let table = self.token_embedding.embeddings().to_device(device)?;
        self.token_embedding = Embedding::new(table, self.config.hidden_size);
        self.position_embedding = self.position_embedding.to_device(device)?;
        self.device = device.clone();
        Ok(())
    }

    /// Tokenize, pad to the position budget, and report the EOS position.
    fn tokenize(&self, text: &str) -> Result<(Vec<u32>, usize)> {
        let encoding = self.tokenizer.encode(text, true).map_err(Error::tokenizer)?;
        let mut tokens = encoding.get_ids().to_vec();
        let budget = self.config.max_position_embeddings;
        if tokens.len() > budget {
            tracing::warn!(
                tokens = tokens.len(),
                budget,
                "prompt exceeds the position budget, truncating"
            );
            tokens.truncate(budget);
        }
        let eos_position = tokens.len().saturating_sub(1);
        while tokens.len() < budget {
            tokens.push(self.pad_token_id);
        }
        Ok((tokens, eos_position))
    }

    fn embed(&self, token_ids: &Tensor) -> candle::Result<Tensor> {
        let seq_len = token_ids.dim(1)?;
        let token_embeds = self.token_embedding.forward(token_ids)?;
        let position_embeds = self.position_embedding.narrow(0, 0, seq_len)?.unsqueeze(0)?;
        token_embeds.broadcast_add(&position_embeds)
    }

    /// Run the full encoder stack, returning the final (normed) hidden
    /// states and the penultimate-layer hidden states.
    fn forward_all(&self, token_ids: &Tensor) -> candle::Result<(Tensor, Tensor)> {
        let seq_len = token_ids.dim(1)?;
        let mask = causal_attention_mask(seq_len, token_ids.device(), self.dtype)?;

        let mut xs = self.embed(token_ids)?;
        let mut penultimate = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if i + 1 == self.layers.len() {
                penultimate = xs.clone();
            }
            xs = layer.forward(&xs, &mask)?;
        }
        let final_states = self.final_layer_norm.forward(&xs)?;
        Ok((final_states, penultimate))
    }

    /// Encode a composed prompt into conditioning states `[1, budget, D]`.
    pub fn encode(&self, text: &str) -> Result<Tensor> {
        let (tokens, _eos) = self.tokenize(text)?;
        let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let (final_states, _penultimate) = self.forward_all(&input)?;
        Ok(final_states)
    }

    /// Encode for dual-stream backends: penultimate hidden states plus the
    /// EOS-pooled final state `([1, budget, D], [1, D])`.
    pub fn encode_with_pooled(&self, text: &str) -> Result<(Tensor, Tensor)> {
        let (tokens, eos_position) = self.tokenize(text)?;
        let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let (final_states, penultimate) = self.forward_all(&input)?;
        let pooled = final_states.i((.., eos_position, ..))?;
        Ok((penultimate, pooled))
    }
}

/// Long-context sequence encoder for the dual-stream backends.
///
/// The flow transformers pair the patched CLIP encoder with a T5-family
/// encoder whose token budget far exceeds CLIP's. The placeholder tokens are
/// not installed here; they pass through as ordinary word pieces, which is
/// why composed prompts are padded with a fixed filler to reach the budget
/// rather than with placeholders.
pub struct LongContextEncoder {
    model: candle_transformers::models::t5::T5EncoderModel,
    tokenizer: Tokenizer,
    max_tokens: usize,
    device: Device,
}

impl LongContextEncoder {
    pub fn new(
        model: candle_transformers::models::t5::T5EncoderModel,
        tokenizer: Tokenizer,
        max_tokens: usize,
        device: Device,
    ) -> Self {
        Self {
            model,
            tokenizer,
            max_tokens,
            device,
        }
    }

    pub fn from_files(
        tokenizer_path: &std::path::Path,
        config_path: &std::path::Path,
        weights_path: &std::path::Path,
        max_tokens: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(Error::tokenizer)?;
        let config: candle_transformers::models::t5::Config =
            serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };
        let model = candle_transformers::models::t5::T5EncoderModel::load(vb, &config)?;
        Ok(Self::new(model, tokenizer, max_tokens, device.clone()))
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Encode to `[1, max_tokens, D]`, truncating or padding with the T5
    /// pad id.
    pub fn encode(&mut self, text: &str) -> Result<Tensor> {
        let encoding = self.tokenizer.encode(text, true).map_err(Error::tokenizer)?;
        let mut tokens = encoding.get_ids().to_vec();
        tokens.resize(self.max_tokens, 0);
        let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&input)?)
    }
}

/// Pad a composed prompt towards the long-context token budget by appending
/// a fixed `", "` filler. The filler never expresses a placeholder token.
pub fn pad_long_context_prompt(prompt: &str, filler_count: usize) -> String {
    let mut padded = String::with_capacity(prompt.len() + filler_count * 2);
    padded.push_str(prompt);
    for _ in 0..filler_count {
        padded.push_str(", ");
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncoderKind, IdentityEncoderSpec};
    use crate::vocab::PlaceholderTokenSet;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    const WORDS: &[&str] = &["<|endoftext|>", "a", "z", "in", "the", "jungle", "portrait", "of"];

    fn test_tokenizer() -> Tokenizer {
        let vocab: HashMap<String, u32> = WORDS
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token(EOT_TOKEN.to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer
    }

    fn tiny_config() -> TextEncoderConfig {
        TextEncoderConfig {
            vocab_size: WORDS.len(),
            hidden_size: 8,
            intermediate_size: 16,
            max_position_embeddings: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
        }
    }

    fn tiny_encoder() -> SubjectTextEncoder {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        SubjectTextEncoder::new(test_tokenizer(), tiny_config(), vb, &device, DType::F32).unwrap()
    }

    fn install_patch(
        encoder: &mut SubjectTextEncoder,
        counts: &[(EncoderKind, usize)],
    ) -> VocabularyPatch {
        let specs: Vec<IdentityEncoderSpec> = counts
            .iter()
            .map(|(kind, n)| {
                IdentityEncoderSpec::new(*kind, "unused.safetensors").with_num_id_vectors(*n)
            })
            .collect();
        let set = PlaceholderTokenSet::new(&specs, "z").unwrap();
        VocabularyPatch::install(encoder.tokenizer_mut(), &set).unwrap()
    }

    #[test]
    fn extend_then_inject_and_read_back() {
        let mut encoder = tiny_encoder();
        let patch = install_patch(
            &mut encoder,
            &[(EncoderKind::Arc2Face, 3), (EncoderKind::ConsistentId, 2)],
        );
        assert_eq!(patch.first_row(), WORDS.len());
        encoder.extend(&patch).unwrap();
        assert_eq!(encoder.vocab_rows(), WORDS.len() + 5);

        let rows: Vec<f32> = (0..5 * 8).map(|v| v as f32).collect();
        let subject = Tensor::from_vec(rows.clone(), (5, 8), &Device::Cpu).unwrap();
        encoder.inject_subject_embeddings(&patch, &subject).unwrap();

        let read: Vec<f32> = encoder
            .embedding_rows(&patch)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(read, rows);
    }

    #[test]
    fn reinjection_overwrites_same_rows() {
        let mut encoder = tiny_encoder();
        let patch = install_patch(&mut encoder, &[(EncoderKind::Arc2Face, 2)]);
        encoder.extend(&patch).unwrap();

        let first = Tensor::ones((2, 8), DType::F32, &Device::Cpu).unwrap();
        encoder.inject_subject_embeddings(&patch, &first).unwrap();
        let second = (Tensor::ones((2, 8), DType::F32, &Device::Cpu).unwrap() * 3.0).unwrap();
        encoder.inject_subject_embeddings(&patch, &second).unwrap();

        let read: Vec<f32> = encoder
            .embedding_rows(&patch)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(read.iter().all(|v| *v == 3.0));
    }

    #[test]
    fn extend_twice_is_config_error() {
        let mut encoder = tiny_encoder();
        let patch = install_patch(&mut encoder, &[(EncoderKind::Arc2Face, 2)]);
        encoder.extend(&patch).unwrap();
        let err = encoder.extend(&patch).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn inject_row_mismatch_leaves_table_unmodified() {
        let mut encoder = tiny_encoder();
        let patch = install_patch(&mut encoder, &[(EncoderKind::Arc2Face, 4)]);
        encoder.extend(&patch).unwrap();

        let short = Tensor::ones((3, 8), DType::F32, &Device::Cpu).unwrap();
        let err = encoder.inject_subject_embeddings(&patch, &short).unwrap_err();
        assert!(matches!(
            err,
            Error::Shape {
                expected: 4,
                actual: 3,
                ..
            }
        ));

        // Rows still hold their placeholder zeros.
        let read: Vec<f32> = encoder
            .embedding_rows(&patch)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(read.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn long_context_filler_never_contains_placeholders() {
        let padded = pad_long_context_prompt("z_0_0 on a beach", 256);
        assert!(padded.starts_with("z_0_0 on a beach"));
        let filler = &padded["z_0_0 on a beach".len()..];
        assert_eq!(filler.len(), 256 * 2);
        assert!(!filler.contains("z_"));
        assert!(filler.chars().all(|c| c == ',' || c == ' '));
    }

    #[test]
    fn encode_shapes() {
        let mut encoder = tiny_encoder();
        let patch = install_patch(&mut encoder, &[(EncoderKind::Arc2Face, 2)]);
        encoder.extend(&patch).unwrap();

        let states = encoder.encode("z_0_0 z_0_1 a portrait").unwrap();
        assert_eq!(states.dims(), &[1, 16, 8]);

        let (penultimate, pooled) = encoder.encode_with_pooled("a portrait of z_0_0").unwrap();
        assert_eq!(penultimate.dims(), &[1, 16, 8]);
        assert_eq!(pooled.dims(), &[1, 8]);
    }
}
