use thiserror::Error;

#[derive(Error, Debug)]
pub enum MentorError {
    #[error("API request failed: {0}")]
    ApiRequest(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Graph store error: {0}")]
    GraphStore(String),

    #[error("Similarity store error: {0}")]
    SimilarityStore(String),

    #[error("Session store error: {0}")]
    SessionStore(String),

    #[error("No graph connection became available within {0:?}")]
    PoolTimeout(std::time::Duration),

    #[error("Generation timed out after {0:?}")]
    GenerationTimeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MentorError>;
