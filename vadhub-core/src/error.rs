use thiserror::Error;

/// All errors produced by vadhub-core.
#[derive(Debug, Error)]
pub enum VadError {
    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("invalid audio data format: {0}")]
    Decode(String),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VadError>;
