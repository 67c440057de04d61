use thiserror::Error;

/// Terminal failures of one download session.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to launch downloader: {0}")]
    Launch(#[from] std::io::Error),

    /// Non-zero subprocess exit; `detail` is the last error-like line
    /// captured from its output, kept verbatim for diagnosis.
    #[error("downloader exited with code {code}. Error: {detail}")]
    Process { code: i32, detail: String },

    #[error("download cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Invalid YouTube URL")]
    InvalidUrl,

    #[error("failed to launch downloader: {0}")]
    Launch(#[from] std::io::Error),

    #[error("metadata fetch failed: {0}")]
    Tool(String),

    #[error("no valid video metadata found")]
    NoMetadata,
}
