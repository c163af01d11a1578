use std::path::PathBuf;

/// Conditions that end the whole run. Anything not listed here is handled per record.
#[derive(thiserror::Error, Debug)]
pub enum FatalError {
    #[error("insufficient space at {destination}: need {required} bytes but only {available} available")]
    InsufficientSpace {
        destination: String,
        required: u64,
        available: u64,
    },
    #[error("could not determine free capacity at {destination}: {reason}")]
    CapacityUnknown { destination: String, reason: String },
    #[error("storage quota exceeded or insufficient permissions: {0}")]
    QuotaExhausted(String),
    #[error("destination {op} failed for {name}: {source}")]
    Destination {
        op: &'static str,
        name: String,
        #[source]
        source: DestinationError,
    },
    #[error("failed compositing overlay {member}: {reason}")]
    OverlayComposite { member: String, reason: String },
    #[error("failed compositing image {member}: {reason}")]
    ImageComposite { member: String, reason: String },
    #[error("{tool} is required to composite overlays onto {member} but was not found")]
    ToolMissing { tool: &'static str, member: String },
    #[error("{tool} failed overlaying {overlay} onto {member}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        member: String,
        overlay: String,
        stderr: String,
    },
}

/// Errors raised by a storage backend.
#[derive(thiserror::Error, Debug)]
pub enum DestinationError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("remote request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected remote response: {0}")]
    Response(String),
}

impl DestinationError {
    /// Whether the failure looks like exhausted storage quota or missing permission.
    pub fn is_quota_exhausted(&self) -> bool {
        match self {
            DestinationError::Status { status, message } => {
                *status == 403
                    || *status == 507
                    || ["storageQuotaExceeded", "dailyLimitExceeded", "insufficientStorage"]
                        .iter()
                        .any(|marker| message.contains(marker))
            }
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DestinationError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures that cost a single record (or a single archive group) its output.
#[derive(thiserror::Error, Debug)]
pub enum ItemError {
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("download returned HTTP {0}")]
    HttpStatus(u16),
    #[error("failed to open archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("failed reading archive member {member}: {source}")]
    Member {
        member: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error in working directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FatalError>;
