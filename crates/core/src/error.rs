use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("corrupt image: {0}")]
    CorruptImage(String),

    #[error("page render failed: {0}")]
    RenderFailed(String),

    #[error("OCR failed: {0}")]
    OcrFailed(String),

    #[error("{engine} is not available: {details}")]
    EngineUnavailable { engine: String, details: String },
}

impl ExtractError {
    /// Errors that no later document can recover from.
    pub fn is_configuration_fatal(&self) -> bool {
        matches!(self, ExtractError::EngineUnavailable { .. })
    }
}

pub type Result<T, E = ExtractError> = std::result::Result<T, E>;
