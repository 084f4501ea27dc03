//! Prompt composition.
//!
//! Rewrites a raw user prompt for a personalized subject: the bare subject
//! word (and any leading article) is removed, and each encoder's
//! placeholder-token fragment is inserted at the position its identity
//! signal conditions best from.
//!
//! Composition is a pure function of the raw prompt and the configured
//! encoders: identical inputs always produce the identical string.
//!
//! Known fragility, inherited and intentionally left in place: removal
//! matches the subject word at word boundaries, so a subject placeholder
//! that also occurs as a natural English word elsewhere in the prompt will
//! be stripped from it. Pick a short, unusual placeholder.

use regex::Regex;

use crate::config::{EncoderKind, PromptPlacement};
use crate::error::{Error, Result};
use crate::vocab::PlaceholderTokenSet;

/// Rewrites raw prompts into placeholder-bearing composed prompts.
#[derive(Debug)]
pub struct PromptComposer {
    /// Matches `a z`, `an z`, `the z` with an optional trailing comma.
    articled_subject: Regex,
    /// Matches a bare `z` with an optional trailing comma.
    bare_subject: Regex,
    /// Per-encoder placeholder fragments with their placement policy,
    /// in encoder-declaration order.
    insertions: Vec<(PromptPlacement, String)>,
}

impl PromptComposer {
    pub fn new(
        subject_placeholder: &str,
        encoder_kinds: &[EncoderKind],
        token_set: &PlaceholderTokenSet,
    ) -> Result<Self> {
        if encoder_kinds.len() != token_set.num_encoders() {
            return Err(Error::Shape {
                context: "composer encoder count",
                expected: token_set.num_encoders(),
                actual: encoder_kinds.len(),
            });
        }

        let subject = regex::escape(subject_placeholder);
        let articled_subject = Regex::new(&format!(r"\b(?:a|an|the)\s+{subject}\b,?"))
            .map_err(|e| Error::config(format!("invalid subject placeholder pattern: {e}")))?;
        let bare_subject = Regex::new(&format!(r"\b{subject}\b,?"))
            .map_err(|e| Error::config(format!("invalid subject placeholder pattern: {e}")))?;

        let insertions = encoder_kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| (kind.placement(), token_set.encoder_tokens_str(i).to_string()))
            .collect();

        Ok(Self {
            articled_subject,
            bare_subject,
            insertions,
        })
    }

    /// Compose the prompt that actually reaches the tokenizer.
    ///
    /// An empty raw prompt is valid and yields the placeholder fragments
    /// alone.
    pub fn compose(&self, raw_prompt: &str) -> String {
        let stripped = self.articled_subject.replace_all(raw_prompt, "");
        let stripped = self.bare_subject.replace_all(&stripped, "");

        let mut prompt = stripped.into_owned();
        for (placement, fragment) in &self.insertions {
            prompt = match placement {
                PromptPlacement::Prefix => format!("{fragment} {prompt}"),
                PromptPlacement::Suffix => format!("{prompt} {fragment}"),
            };
        }

        // Removal and insertion both leave stray spaces behind.
        prompt.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}
