//! Provenance embedding: EXIF for JPEG, a freeform atom for MP4/MOV, and a per-file
//! stream as the last resort. Every failure here is logged and swallowed.

pub mod exif;
pub mod mp4;
pub mod stream;

use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::record::RecordMetadata;

#[derive(thiserror::Error, Debug)]
pub enum EmbedError {
    #[error("no in-file metadata format for extension {0:?}")]
    UnsupportedFormat(String),
    #[error("nothing to write")]
    NothingToWrite,
    #[error("malformed container: {0}")]
    Container(String),
    #[error("exif error: {0}")]
    Exif(#[from] ::exif::Error),
    #[error("failed to serialize metadata: {0}")]
    Json(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn normalized_extension(extension: &str) -> String {
    extension.trim_start_matches('.').to_ascii_lowercase()
}

/// Try the in-file strategies that apply to `extension`, returning rewritten bytes.
pub fn embed_bytes(
    bytes: &[u8],
    extension: &str,
    meta: &RecordMetadata,
    taken: Option<NaiveDateTime>,
) -> Result<Vec<u8>, EmbedError> {
    match normalized_extension(extension).as_str() {
        "jpg" | "jpeg" => exif::embed_jpeg(bytes, meta.coordinates(), taken),
        "mp4" | "mov" | "m4v" => {
            let payload = serde_json::to_vec(meta)?;
            mp4::embed_freeform(bytes, &payload)
        }
        other => Err(EmbedError::UnsupportedFormat(other.to_string())),
    }
}

/// Embed into a file already on disk. Falls back to a per-file stream when the
/// format has no in-file slot or the rewrite fails. Returns whether anything stuck.
pub fn embed_file(path: &Path, meta: &RecordMetadata, taken: Option<NaiveDateTime>) -> bool {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    let in_file = fs::read(path)
        .map_err(EmbedError::from)
        .and_then(|bytes| embed_bytes(&bytes, extension, meta, taken))
        .and_then(|updated| fs::write(path, updated).map_err(EmbedError::from));

    match in_file {
        Ok(()) => return true,
        Err(EmbedError::UnsupportedFormat(_)) | Err(EmbedError::NothingToWrite) => {
            debug!(file = %path.display(), "no in-file metadata slot, using side stream");
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed embedding metadata in file, using side stream");
        }
    }

    let written = serde_json::to_vec(meta)
        .map_err(EmbedError::from)
        .and_then(|payload| stream::write_side_stream(path, &payload).map_err(EmbedError::from));
    match written {
        Ok(()) => true,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed writing metadata into file or side stream");
            false
        }
    }
}
