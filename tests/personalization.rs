//! End-to-end vocabulary and composition scenario: two identity encoders
//! (16 + 4 id vectors), subject word `z`, a real tokenizer, and a tiny
//! CPU text encoder.

use std::collections::HashMap;

use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::Tokenizer;

use idprompt::compose::PromptComposer;
use idprompt::config::{EncoderKind, IdentityEncoderSpec};
use idprompt::text_encoder::{SubjectTextEncoder, TextEncoderConfig};
use idprompt::vocab::{PlaceholderTokenSet, VocabularyPatch};
use idprompt::Error;

const WORDS: &[&str] = &[
    "<|endoftext|>",
    "a",
    "an",
    "the",
    "z",
    "in",
    "jungle",
    "portrait",
    "of",
];

const HIDDEN: usize = 8;

fn base_tokenizer() -> Tokenizer {
    let vocab: HashMap<String, u32> = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), i as u32))
        .collect();
    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("<|endoftext|>".to_string())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace {}));
    tokenizer
}

fn tiny_encoder() -> SubjectTextEncoder {
    let device = Device::Cpu;
    let cfg = TextEncoderConfig {
        vocab_size: WORDS.len(),
        hidden_size: HIDDEN,
        intermediate_size: 2 * HIDDEN,
        max_position_embeddings: 32,
        num_hidden_layers: 2,
        num_attention_heads: 2,
    };
    let vb = VarBuilder::zeros(DType::F32, &device);
    SubjectTextEncoder::new(base_tokenizer(), cfg, vb, &device, DType::F32).unwrap()
}

fn two_encoder_specs() -> Vec<IdentityEncoderSpec> {
    vec![
        IdentityEncoderSpec::new(EncoderKind::Arc2Face, "arc2face.safetensors"),
        IdentityEncoderSpec::new(EncoderKind::ConsistentId, "consistentid.safetensors"),
    ]
}

#[test]
fn two_encoder_scenario_composes_and_injects() {
    let specs = two_encoder_specs();
    let mut encoder = tiny_encoder();

    // 16 + 4 placeholder tokens land behind the base vocabulary.
    let token_set = PlaceholderTokenSet::new(&specs, "z").unwrap();
    assert_eq!(token_set.len(), 20);
    let patch = VocabularyPatch::install(encoder.tokenizer_mut(), &token_set).unwrap();
    assert_eq!(patch.first_row(), WORDS.len());
    assert_eq!(patch.token_ids().len(), 20);

    encoder.extend(&patch).unwrap();
    assert_eq!(encoder.vocab_rows(), WORDS.len() + 20);

    // Composition surrounds the surviving literal text.
    let kinds: Vec<EncoderKind> = specs.iter().map(|s| s.kind).collect();
    let composer = PromptComposer::new("z", &kinds, &token_set).unwrap();
    let composed = composer.compose("a z in the jungle");
    let words: Vec<&str> = composed.split_whitespace().collect();
    assert_eq!(words.len(), 23);
    for j in 0..16 {
        assert_eq!(words[j], format!("z_0_{j}"));
    }
    assert_eq!(&words[16..19], &["in", "the", "jungle"]);
    for j in 0..4 {
        assert_eq!(words[19 + j], format!("z_1_{j}"));
    }

    // The composed prompt tokenizes onto the patch rows, in order.
    let encoding = encoder.tokenizer().encode(composed.as_str(), true).unwrap();
    let ids = encoding.get_ids();
    assert_eq!(&ids[..16], &patch.token_ids()[..16]);
    assert_eq!(&ids[19..23], &patch.token_ids()[16..20]);

    // Injection lands row-for-row and reads back exactly.
    let values: Vec<f32> = (0..20 * HIDDEN).map(|v| v as f32 * 0.25).collect();
    let subject = Tensor::from_vec(values.clone(), (20, HIDDEN), &Device::Cpu).unwrap();
    encoder.inject_subject_embeddings(&patch, &subject).unwrap();
    let read: Vec<f32> = encoder
        .embedding_rows(&patch)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(read, values);

    // The patched encoder still produces well-formed conditioning.
    let states = encoder.encode(&composed).unwrap();
    assert_eq!(states.dims(), &[1, 32, HIDDEN]);
}

#[test]
fn installing_the_same_patch_twice_fails() {
    let specs = two_encoder_specs();
    let token_set = PlaceholderTokenSet::new(&specs, "z").unwrap();

    let mut tokenizer = base_tokenizer();
    VocabularyPatch::install(&mut tokenizer, &token_set).unwrap();
    let err = VocabularyPatch::install(&mut tokenizer, &token_set).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    // The duplicate token is named in the message.
    assert!(err.to_string().contains("z_0_0"));
}

#[test]
fn subject_word_colliding_with_vocabulary_tokens_fails() {
    // A tokenizer that already carries `z_0_0` rejects the patch.
    let specs = vec![IdentityEncoderSpec::new(
        EncoderKind::Arc2Face,
        "arc2face.safetensors",
    )];
    let token_set = PlaceholderTokenSet::new(&specs, "z").unwrap();

    let mut vocab: HashMap<String, u32> = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), i as u32))
        .collect();
    vocab.insert("z_0_0".to_string(), vocab.len() as u32);
    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("<|endoftext|>".to_string())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace {}));

    let err = VocabularyPatch::install(&mut tokenizer, &token_set).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("z_0_0"));
}

#[test]
fn injection_mismatch_is_rejected_with_counts() {
    let specs = two_encoder_specs();
    let mut encoder = tiny_encoder();
    let token_set = PlaceholderTokenSet::new(&specs, "z").unwrap();
    let patch = VocabularyPatch::install(encoder.tokenizer_mut(), &token_set).unwrap();
    encoder.extend(&patch).unwrap();

    // 20 placeholder ids, 19 embedding rows.
    let short = Tensor::zeros((19, HIDDEN), DType::F32, &Device::Cpu).unwrap();
    let err = encoder.inject_subject_embeddings(&patch, &short).unwrap_err();
    match err {
        Error::Shape {
            expected, actual, ..
        } => {
            assert_eq!(expected, 20);
            assert_eq!(actual, 19);
        }
        other => panic!("expected a shape error, got {other}"),
    }
}
