use thiserror::Error;

/// Errors raised by the network side of the tracker
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = TrackError> = std::result::Result<T, E>;
