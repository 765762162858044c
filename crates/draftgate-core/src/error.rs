use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Artifact serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
