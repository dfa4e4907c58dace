use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("client has been stopped")]
    Closed,

    #[error("client not initialised: {0}")]
    NotInitialised(String),
}

impl ClientError {
    /// Network failures, 5xx and 429 are worth another attempt; other statuses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(_) => true,
            ClientError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
