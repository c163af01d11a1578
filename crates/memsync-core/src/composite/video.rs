use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use image::ImageFormat;
use tracing::{debug, warn};

use super::{CompositeResult, OverlayLayer};
use crate::error::{FatalError, ItemError};

pub const TOOL_NAME: &str = "ffmpeg";

const OVERLAY_FILTER: &str = "[1:v][0:v]scale2ref[ov][base];[base][ov]overlay=0:0";
const MAX_STDERR: usize = 4000;

/// Burns overlay layers into a video with an external ffmpeg, one overlay per pass.
#[derive(Debug, Clone, Default)]
pub struct VideoCompositor {
    tool: Option<PathBuf>,
    work_root: Option<PathBuf>,
}

impl VideoCompositor {
    /// Use an explicit tool path, or look `ffmpeg` up on PATH.
    pub fn discover(configured: Option<&Path>) -> Self {
        let tool = match configured {
            Some(path) => Some(path.to_path_buf()),
            None => which::which(TOOL_NAME).ok(),
        };
        match &tool {
            Some(path) => debug!(tool = %path.display(), "video compositing tool located"),
            None => debug!("{} not found on PATH", TOOL_NAME),
        }
        Self {
            tool,
            work_root: None,
        }
    }

    pub fn with_tool(tool: Option<PathBuf>) -> Self {
        Self {
            tool,
            work_root: None,
        }
    }

    /// Create per-record working directories under `root` instead of the system temp dir.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    pub fn is_available(&self) -> bool {
        self.tool.is_some()
    }

    /// Apply overlays in order; step *i*'s output is step *i+1*'s input.
    ///
    /// An overlay that does not decode as an image is skipped. A tool failure ends the run.
    /// The working directory is removed however this returns.
    pub fn composite(
        &self,
        main_name: &str,
        main_extension: &str,
        main_bytes: &[u8],
        overlays: &[OverlayLayer],
    ) -> Result<Result<CompositeResult, ItemError>, FatalError> {
        let extension = format!(".{}", main_extension);
        if overlays.is_empty() {
            return Ok(Ok(CompositeResult {
                bytes: main_bytes.to_vec(),
                extension,
            }));
        }

        let tool = self.tool.as_deref().ok_or_else(|| FatalError::ToolMissing {
            tool: TOOL_NAME,
            member: main_name.to_string(),
        })?;

        let workdir = match self.make_workdir() {
            Ok(dir) => dir,
            Err(e) => return Ok(Err(e.into())),
        };

        let main_path = workdir.path().join(format!("main{}", extension));
        if let Err(e) = fs::write(&main_path, main_bytes) {
            return Ok(Err(e.into()));
        }

        let final_path = overlays
            .iter()
            .enumerate()
            .try_fold(main_path, |current, (step, overlay)| -> Result<PathBuf, FatalError> {
                let Some(layer_path) = normalize_overlay(workdir.path(), step, overlay) else {
                    return Ok(current);
                };
                let out = workdir.path().join(format!("out_{}{}", step, extension));
                run_overlay_step(tool, &current, &layer_path, &out).map_err(|stderr| {
                    FatalError::ToolFailed {
                        tool: TOOL_NAME,
                        member: main_name.to_string(),
                        overlay: overlay.name.clone(),
                        stderr,
                    }
                })?;
                Ok(out)
            })?;

        Ok(fs::read(&final_path)
            .map(|bytes| CompositeResult { bytes, extension })
            .map_err(ItemError::from))
    }

    fn make_workdir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("memsync_");
        match &self.work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }
}

/// Decode the overlay and re-save it as an RGBA PNG the tool can read reliably.
fn normalize_overlay(workdir: &Path, step: usize, overlay: &OverlayLayer) -> Option<PathBuf> {
    let layer = match image::load_from_memory(&overlay.bytes) {
        Ok(img) => img.to_rgba8(),
        Err(e) => {
            warn!(member = %overlay.name, error = %e, "failed to decode overlay as image, skipping it");
            return None;
        }
    };
    let path = workdir.join(format!("overlay_{}.png", step));
    if let Err(e) = layer.save_with_format(&path, ImageFormat::Png) {
        warn!(member = %overlay.name, error = %e, "failed to stage overlay, skipping it");
        return None;
    }
    Some(path)
}

fn run_overlay_step(tool: &Path, input: &Path, overlay: &Path, output: &Path) -> Result<(), String> {
    let result = Command::new(tool)
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-i")
        .arg(overlay)
        .args(["-filter_complex", OVERLAY_FILTER, "-c:v", "libx264", "-c:a", "copy"])
        .arg(output)
        .output()
        .map_err(|e| e.to_string())?;

    if result.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&result.stderr);
    let tail_start = stderr
        .char_indices()
        .rev()
        .nth(MAX_STDERR)
        .map(|(i, _)| i)
        .unwrap_or(0);
    Err(format!("{} ({})", stderr[tail_start..].trim(), result.status))
}
