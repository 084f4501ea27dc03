//! Placeholder-token allocation and the vocabulary patch.
//!
//! Identity embeddings ride through the backend's native text-conditioning
//! path as synthetic vocabulary entries. For encoders `i` producing `k_i`
//! id vectors each, we allocate tokens `"{subject}_{i}_{j}"` and append them
//! to the tokenizer; the text encoder's embedding table grows by the same
//! count and the [`VocabularyPatch`] records the token-id-to-row mapping so
//! nobody re-derives table offsets.
//!
//! Extension is deliberately not idempotent: installing the same patch twice
//! always fails the duplicate-token check, which guards against accidental
//! re-initialization of a live pipeline.

use candle::Tensor;
use tokenizers::{AddedToken, Tokenizer};

use crate::config::IdentityEncoderSpec;
use crate::error::{Error, Result};

/// The ordered placeholder tokens for all configured encoders, partitioned
/// by encoder index. Created once at initialization.
#[derive(Debug, Clone)]
pub struct PlaceholderTokenSet {
    tokens: Vec<String>,
    per_encoder: Vec<Vec<String>>,
    per_encoder_strs: Vec<String>,
    joined: String,
}

impl PlaceholderTokenSet {
    pub fn new(specs: &[IdentityEncoderSpec], subject_placeholder: &str) -> Result<Self> {
        let total: usize = specs.iter().map(|s| s.num_id_vectors).sum();
        if total < 1 {
            return Err(Error::config(format!(
                "total identity vector count must be at least 1, got {total}"
            )));
        }

        let mut tokens = Vec::with_capacity(total);
        let mut per_encoder = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let encoder_tokens: Vec<String> = (0..spec.num_id_vectors)
                .map(|j| format!("{subject_placeholder}_{i}_{j}"))
                .collect();
            tokens.extend(encoder_tokens.iter().cloned());
            per_encoder.push(encoder_tokens);
        }

        let per_encoder_strs: Vec<String> = per_encoder.iter().map(|ts| ts.join(" ")).collect();
        let joined = per_encoder_strs.join(" | ");

        Ok(Self {
            tokens,
            per_encoder,
            per_encoder_strs,
            joined,
        })
    }

    /// All tokens, flattened in encoder-declaration order.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn num_encoders(&self) -> usize {
        self.per_encoder.len()
    }

    /// The tokens belonging to encoder `i`.
    pub fn encoder_tokens(&self, i: usize) -> &[String] {
        &self.per_encoder[i]
    }

    /// Encoder `i`'s tokens as a single space-joined prompt fragment.
    pub fn encoder_tokens_str(&self, i: usize) -> &str {
        &self.per_encoder_strs[i]
    }

    /// All encoders' fragments joined for display.
    pub fn joined_str(&self) -> &str {
        &self.joined
    }
}

/// The installed mapping from placeholder token ids to embedding-table rows.
///
/// The embedding row index of each placeholder token is its token id; the
/// rows form one contiguous block appended by the table resize, in
/// [`PlaceholderTokenSet`] order. Built once; both the injector and any
/// embedding reader go through this value.
#[derive(Debug, Clone)]
pub struct VocabularyPatch {
    token_ids: Vec<u32>,
    first_row: usize,
}

impl VocabularyPatch {
    /// Add the placeholder tokens to the tokenizer and record their ids.
    ///
    /// Fails with a configuration error if any token already exists in the
    /// vocabulary: the count of tokens actually added must equal the count
    /// requested, and a mismatch means the subject placeholder is ambiguous.
    pub fn install(tokenizer: &mut Tokenizer, token_set: &PlaceholderTokenSet) -> Result<Self> {
        let duplicates: Vec<&str> = token_set
            .tokens()
            .iter()
            .filter(|t| tokenizer.token_to_id(t).is_some())
            .map(|t| t.as_str())
            .collect();
        if !duplicates.is_empty() {
            return Err(Error::config(format!(
                "the tokenizer already contains placeholder token(s) {:?}; \
                 pass a subject placeholder that is not already in the vocabulary",
                duplicates.join(" ")
            )));
        }

        let added_tokens: Vec<AddedToken> = token_set
            .tokens()
            .iter()
            .map(|t| AddedToken::from(t.clone(), false))
            .collect();
        let num_added = tokenizer.add_tokens(&added_tokens);
        if num_added != token_set.len() {
            return Err(Error::config(format!(
                "requested {} placeholder tokens ({}) but the tokenizer added {num_added}",
                token_set.len(),
                token_set.joined_str(),
            )));
        }

        let token_ids: Vec<u32> = token_set
            .tokens()
            .iter()
            .map(|t| {
                tokenizer.token_to_id(t).ok_or_else(|| {
                    Error::config(format!("placeholder token {t:?} missing after insertion"))
                })
            })
            .collect::<Result<_>>()?;

        // The resize appends one contiguous block of rows, so ids must be
        // consecutive for the id-to-row identity to hold.
        let first = token_ids[0];
        for (offset, id) in token_ids.iter().enumerate() {
            if *id != first + offset as u32 {
                return Err(Error::config(format!(
                    "placeholder token ids are not contiguous (id {id} at offset {offset}, \
                     expected {})",
                    first + offset as u32
                )));
            }
        }

        tracing::info!(
            count = num_added,
            tokens = token_set.joined_str(),
            first_id = first,
            "added placeholder tokens to the tokenizer"
        );

        Ok(Self {
            token_ids,
            first_row: first as usize,
        })
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// First embedding-table row of the patch's contiguous block.
    pub fn first_row(&self) -> usize {
        self.first_row
    }
}

/// Append `extra` zero rows to an embedding table. The new rows are
/// placeholders; reading them before injection yields undefined conditioning,
/// not a crash.
pub fn grow_embedding_table(table: &Tensor, extra: usize) -> Result<Tensor> {
    let (_rows, dim) = table.dims2()?;
    let zeros = Tensor::zeros((extra, dim), table.dtype(), table.device())?;
    Ok(Tensor::cat(&[table, &zeros], 0)?)
}

/// Return a copy of `table` with `rows` written at `first_row..first_row+n`.
///
/// Validates every shape before touching anything, so a failed call leaves
/// the caller's table unmodified.
pub fn splice_embedding_rows(table: &Tensor, first_row: usize, rows: &Tensor) -> Result<Tensor> {
    let (total, dim) = table.dims2()?;
    let (n, row_dim) = rows.dims2()?;
    if row_dim != dim {
        return Err(Error::Shape {
            context: "embedding row width",
            expected: dim,
            actual: row_dim,
        });
    }
    if first_row + n > total {
        return Err(Error::Shape {
            context: "embedding table rows",
            expected: total,
            actual: first_row + n,
        });
    }

    let mut pieces: Vec<Tensor> = Vec::with_capacity(3);
    if first_row > 0 {
        pieces.push(table.narrow(0, 0, first_row)?);
    }
    pieces.push(rows.clone());
    let tail_start = first_row + n;
    if tail_start < total {
        pieces.push(table.narrow(0, tail_start, total - tail_start)?);
    }
    Ok(Tensor::cat(&pieces, 0)?)
}

/// Read the `n` rows starting at `first_row` back out of the table.
pub fn read_embedding_rows(table: &Tensor, first_row: usize, n: usize) -> Result<Tensor> {
    Ok(table.narrow(0, first_row, n)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderKind;
    use candle::{DType, Device};

    fn specs(counts: &[(EncoderKind, usize)]) -> Vec<IdentityEncoderSpec> {
        counts
            .iter()
            .map(|(kind, n)| {
                IdentityEncoderSpec::new(*kind, "unused.safetensors").with_num_id_vectors(*n)
            })
            .collect()
    }

    #[test]
    fn token_set_layout() {
        let specs = specs(&[(EncoderKind::Arc2Face, 16), (EncoderKind::ConsistentId, 4)]);
        let set = PlaceholderTokenSet::new(&specs, "z").unwrap();
        assert_eq!(set.len(), 20);
        assert_eq!(set.tokens()[0], "z_0_0");
        assert_eq!(set.tokens()[15], "z_0_15");
        assert_eq!(set.tokens()[16], "z_1_0");
        assert_eq!(set.tokens()[19], "z_1_3");
        assert!(set.encoder_tokens_str(0).starts_with("z_0_0 z_0_1"));
        assert_eq!(set.encoder_tokens_str(1), "z_1_0 z_1_1 z_1_2 z_1_3");
        assert!(set.joined_str().contains(" | "));
    }

    #[test]
    fn zero_total_vectors_is_config_error() {
        let specs = specs(&[(EncoderKind::Arc2Face, 0), (EncoderKind::ConsistentId, 0)]);
        let err = PlaceholderTokenSet::new(&specs, "z").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn grow_appends_zero_rows() {
        let device = Device::Cpu;
        let table = Tensor::ones((3, 4), DType::F32, &device).unwrap();
        let grown = grow_embedding_table(&table, 2).unwrap();
        assert_eq!(grown.dims(), &[5, 4]);
        let tail: Vec<f32> = grown
            .narrow(0, 3, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(tail.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn splice_writes_exact_rows() {
        let device = Device::Cpu;
        let table = Tensor::zeros((6, 3), DType::F32, &device).unwrap();
        let rows = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6.], (2, 3), &device).unwrap();
        let patched = splice_embedding_rows(&table, 4, &rows).unwrap();
        assert_eq!(patched.dims(), &[6, 3]);

        let read: Vec<f32> = read_embedding_rows(&patched, 4, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(read, vec![1., 2., 3., 4., 5., 6.]);

        // Preceding rows untouched.
        let head: Vec<f32> = patched
            .narrow(0, 0, 4)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(head.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn splice_rejects_row_overflow() {
        let device = Device::Cpu;
        let table = Tensor::zeros((4, 3), DType::F32, &device).unwrap();
        let rows = Tensor::zeros((3, 3), DType::F32, &device).unwrap();
        let err = splice_embedding_rows(&table, 2, &rows).unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
    }

    #[test]
    fn splice_rejects_width_mismatch() {
        let device = Device::Cpu;
        let table = Tensor::zeros((4, 3), DType::F32, &device).unwrap();
        let rows = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
        let err = splice_embedding_rows(&table, 0, &rows).unwrap_err();
        assert!(matches!(
            err,
            Error::Shape {
                expected: 3,
                actual: 2,
                ..
            }
        ));
    }
}
