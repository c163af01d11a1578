use tracing::{debug, warn};

use crate::archive::{self, Bundle, MemberGroup, MemberKind};
use crate::composite::still::composite_image;
use crate::composite::video::VideoCompositor;
use crate::composite::{CompositeResult, OverlayLayer};
use crate::download::{self, Fetcher};
use crate::error::{FatalError, Result};
use crate::guard;
use crate::record::Record;
use crate::sync::{CommitOutcome, SyncManager};

/// Turns one record into committed files: download, unpack, composite, hand off.
pub struct BundleProcessor {
    fetcher: Box<dyn Fetcher>,
    sync: SyncManager,
    video: VideoCompositor,
}

impl BundleProcessor {
    pub fn new(fetcher: Box<dyn Fetcher>, sync: SyncManager, video: VideoCompositor) -> Self {
        Self { fetcher, sync, video }
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    /// Process a single record. Per-record problems are logged and yield no outcomes;
    /// only run-fatal conditions come back as `Err`.
    pub fn process(&mut self, record: &Record) -> Result<Vec<CommitOutcome>> {
        let Some(url) = record.download_url.as_deref().filter(|u| !u.is_empty()) else {
            debug!(prefix = %record.prefix, "record has no download url");
            return Ok(Vec::new());
        };

        let payload = match self.fetcher.fetch(url) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(url, error = %e, "download failed");
                return Ok(Vec::new());
            }
        };
        let content_type = payload.content_type.as_deref();

        if !archive::is_archive(&payload.bytes, content_type, url) {
            let name = format!("{}{}", record.prefix, download::plain_extension(url, content_type));
            return Ok(vec![self.deliver(&name, &payload.bytes, record)?]);
        }

        let mut bundle = match Bundle::open(&payload.bytes) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(url, error = %e, "payload looked like an archive but could not be opened");
                return Ok(Vec::new());
            }
        };
        let groups = bundle.groups();
        if groups.is_empty() {
            warn!(url, "archive has no main member");
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(groups.len());
        for group in &groups {
            let Some(result) = self.render_group(&mut bundle, group)? else {
                continue;
            };
            let name = if outcomes.is_empty() {
                format!("{}{}", record.prefix, result.extension)
            } else {
                format!("{}_{}{}", record.prefix, outcomes.len(), result.extension)
            };
            outcomes.push(self.deliver(&name, &result.bytes, record)?);
        }
        Ok(outcomes)
    }

    /// Produce the final bytes for one group, or None when only this group is lost.
    ///
    /// An unreadable main costs only its group. Once a main is in hand, failing to read an
    /// overlay or to composite a still ends the run.
    fn render_group(&self, bundle: &mut Bundle<'_>, group: &MemberGroup) -> Result<Option<CompositeResult>> {
        let main = &group.main;
        let main_bytes = match bundle.read(main) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(member = %main.name, error = %e, "failed reading main member, skipping group");
                return Ok(None);
            }
        };

        match main.member.kind {
            MemberKind::Image => {
                let overlays = self.read_overlays(bundle, group)?;
                let result = composite_image(&main.name, &main.member.extension, &main_bytes, &overlays)?;
                Ok(Some(result))
            }
            MemberKind::Video => {
                let overlays = self.read_overlays(bundle, group)?;
                match self
                    .video
                    .composite(&main.name, &main.member.extension, &main_bytes, &overlays)?
                {
                    Ok(result) => Ok(Some(result)),
                    Err(e) => {
                        warn!(member = %main.name, error = %e, "failed compositing video, skipping group");
                        Ok(None)
                    }
                }
            }
            MemberKind::OtherUnsupported => {
                warn!(member = %main.name, "unsupported main member, skipping group");
                Ok(None)
            }
        }
    }

    /// Pull overlay bytes in archive order; an overlay that cannot be read ends the run.
    fn read_overlays(&self, bundle: &mut Bundle<'_>, group: &MemberGroup) -> Result<Vec<OverlayLayer>> {
        group
            .overlays
            .iter()
            .map(|entry| -> Result<OverlayLayer> {
                let bytes = bundle.read(entry).map_err(|e| FatalError::OverlayComposite {
                    member: entry.name.clone(),
                    reason: e.to_string(),
                })?;
                Ok(OverlayLayer {
                    name: entry.name.clone(),
                    bytes,
                })
            })
            .collect()
    }

    fn deliver(&mut self, name: &str, bytes: &[u8], record: &Record) -> Result<CommitOutcome> {
        guard::ensure_capacity(self.sync.destination(), bytes.len() as u64)?;
        self.sync.commit(name, bytes, record)
    }
}
