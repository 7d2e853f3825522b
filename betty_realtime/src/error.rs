use thiserror::Error;

/// A non-successful HTTP response from the backend.
#[derive(Error, Debug)]
#[error("request to {url} failed with {status}: {body}")]
pub struct ResponseError {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// A frame from the realtime socket that could not be understood.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected binary frame ({0} bytes)")]
    Binary(usize),
}
