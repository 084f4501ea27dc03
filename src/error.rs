use thiserror::Error;

/// Errors surfaced by the personalization pipeline.
///
/// Nothing here is recovered locally: every failure aborts the current call
/// and carries enough context (which check failed, expected vs. actual
/// counts, the offending value) to diagnose without re-running internals.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or inconsistent configuration: unknown backend kind, duplicate
    /// placeholder tokens, zero identity vectors, unreadable checkpoints.
    #[error("configuration error: {0}")]
    Config(String),

    /// Mutually-exclusive or missing identity-source arguments.
    #[error("input error: {0}")]
    Input(String),

    /// Row-count or token-count mismatch during injection or blending.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    Shape {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_shape() {
        let e = Error::Shape {
            context: "subject embedding injection",
            expected: 20,
            actual: 19,
        };
        assert_eq!(
            e.to_string(),
            "shape mismatch in subject embedding injection: expected 20, got 19"
        );
    }

    #[test]
    fn error_display_config() {
        let e = Error::config("duplicate placeholder token \"z_0_0\"");
        assert_eq!(
            e.to_string(),
            "configuration error: duplicate placeholder token \"z_0_0\""
        );
    }
}
