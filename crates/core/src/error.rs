use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unsupported region: '{0}'")]
    InvalidRegion(String),

    #[error("Invalid player handle: {0}")]
    InvalidHandle(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}
