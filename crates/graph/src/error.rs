#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("HTTP error: {status} - {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),
}

impl From<reqwest::Error> for GraphError {
    fn from(e: reqwest::Error) -> Self {
        GraphError::Transport(e.to_string())
    }
}
