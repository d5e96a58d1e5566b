//! Crate-wide error type.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Message of a `tokenizers::Error`.
    #[error("tokenizer: {0}")]
    Tokenizer(String),

    /// WAV decoding, empty signals and other DSP input problems.
    #[error("audio: {0}")]
    Audio(String),

    #[error("config: {0}")]
    Config(String),

    /// A tensor did not have the shape an operation requires.
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),

    /// A feature name no extractor or encoder knows about.
    #[error("unknown feature type: {0}")]
    UnknownFeature(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(error.to_string())
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        match error {
            hound::Error::IoError(io) => Error::Io(io),
            other => Error::Audio(other.to_string()),
        }
    }
}

impl Error {
    /// `UnsupportedShape` naming the operation and the offending dims.
    pub(crate) fn shape(op: &str, dims: &[usize]) -> Self {
        Error::UnsupportedShape(format!("{op}: got {dims:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_names_op_and_dims() {
        let err = Error::shape("conv stack", &[2, 3]);
        assert_eq!(err.to_string(), "unsupported shape: conv stack: got [2, 3]");
    }

    #[test]
    fn test_hound_io_errors_stay_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.wav");
        assert!(matches!(Error::from(hound::Error::IoError(io)), Error::Io(_)));
        assert!(matches!(Error::from(hound::Error::Unsupported), Error::Audio(_)));
    }
}
