use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::LazyLock;

use encoding_rs::SHIFT_JIS;
use regex::Regex;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;
use zip::ZipArchive;

use crate::error::ItemError;

static ROLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.+?)-(?:main|overlay)").unwrap());

const ARCHIVE_CONTENT_TYPES: &[&str] = &["application/zip", "application/x-zip-compressed"];
/// Upper bound on the buffer reserved from a member's declared size
const MAX_PREALLOC: u64 = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Main,
    Overlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Image,
    Video,
    OtherUnsupported,
}

/// What a single archive entry is, judged from its name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Text preceding the `-main` / `-overlay` marker
    pub base_name: String,
    pub role: MemberRole,
    pub kind: MemberKind,
    /// Lowercased extension without the dot
    pub extension: String,
}

impl ArchiveMember {
    /// Only PNG carries the transparency an overlay needs.
    pub fn supports_alpha(&self) -> bool {
        self.extension == "png"
    }

    fn accepted(&self) -> bool {
        match self.role {
            MemberRole::Main => matches!(self.kind, MemberKind::Image | MemberKind::Video),
            MemberRole::Overlay => self.kind == MemberKind::Image && self.supports_alpha(),
        }
    }
}

fn kind_for_extension(ext: &str) -> MemberKind {
    match ext {
        "jpg" | "jpeg" | "png" => MemberKind::Image,
        "mp4" | "mov" => MemberKind::Video,
        _ => MemberKind::OtherUnsupported,
    }
}

/// Classify an archive entry by name. Returns None when the name carries no role marker.
pub fn classify(member_name: &str) -> Option<ArchiveMember> {
    let file_name: String = Path::new(member_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(member_name)
        .nfc()
        .collect();
    let path = Path::new(&file_name);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(&file_name);

    let base_name = ROLE_RE.captures(stem)?.get(1)?.as_str().to_string();
    let role = if stem.to_lowercase().contains("-main") {
        MemberRole::Main
    } else {
        MemberRole::Overlay
    };

    Some(ArchiveMember {
        base_name,
        role,
        kind: kind_for_extension(&extension),
        extension,
    })
}

/// A main member and its overlays, as entry indices into the archive.
#[derive(Debug, Clone)]
pub struct MemberGroup {
    pub base_name: String,
    pub main: GroupEntry,
    pub overlays: Vec<GroupEntry>,
}

#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub index: usize,
    pub name: String,
    pub member: ArchiveMember,
}

/// Decode an entry name, trying UTF-8 first, then Shift_JIS
fn decode_member_name(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }

    let (decoded, _, had_errors) = SHIFT_JIS.decode(raw);
    if !had_errors {
        return decoded.into_owned();
    }

    String::from_utf8_lossy(raw).into_owned()
}

/// Decide whether a payload is a zip bundle. The byte probe runs last and is authoritative.
pub fn is_archive(bytes: &[u8], content_type: Option<&str>, url: &str) -> bool {
    let declared = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .is_some_and(|ct| ARCHIVE_CONTENT_TYPES.contains(&ct.as_str()));
    if declared || url.to_ascii_lowercase().ends_with(".zip") {
        return true;
    }
    ZipArchive::new(Cursor::new(bytes)).is_ok()
}

/// In-memory view over a downloaded bundle.
pub struct Bundle<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
}

impl<'a> Bundle<'a> {
    pub fn open(bytes: &'a [u8]) -> Result<Self, ItemError> {
        Ok(Self {
            archive: ZipArchive::new(Cursor::new(bytes))?,
        })
    }

    /// Entry names in archive order, directories excluded.
    pub fn member_names(&mut self) -> Vec<(usize, String)> {
        let mut names = Vec::with_capacity(self.archive.len());
        for i in 0..self.archive.len() {
            let entry = match self.archive.by_index_raw(i) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(index = i, error = %e, "unreadable archive entry header, skipping it");
                    continue;
                }
            };
            if entry.is_dir() {
                continue;
            }
            names.push((i, decode_member_name(entry.name_raw())));
        }
        names
    }

    /// Pair mains with overlays by base name, in order of each main's first appearance.
    pub fn groups(&mut self) -> Vec<MemberGroup> {
        let mut mains: Vec<GroupEntry> = Vec::new();
        let mut overlays: Vec<GroupEntry> = Vec::new();

        for (index, name) in self.member_names() {
            let Some(member) = classify(&name) else {
                debug!(member = %name, "ignoring archive member without role marker");
                continue;
            };
            if !member.accepted() {
                debug!(member = %name, "ignoring unsupported archive member");
                continue;
            }
            let entry = GroupEntry { index, name, member };
            match entry.member.role {
                MemberRole::Main => {
                    if let Some(existing) = mains
                        .iter_mut()
                        .find(|m| m.member.base_name == entry.member.base_name)
                    {
                        debug!(member = %entry.name, replaced = %existing.name, "duplicate main member");
                        *existing = entry;
                    } else {
                        mains.push(entry);
                    }
                }
                MemberRole::Overlay => overlays.push(entry),
            }
        }

        for orphan in overlays
            .iter()
            .filter(|o| !mains.iter().any(|m| m.member.base_name == o.member.base_name))
        {
            warn!(member = %orphan.name, "overlay has no main member, skipping");
        }

        mains
            .into_iter()
            .map(|main| {
                let base_name = main.member.base_name.clone();
                let group_overlays = overlays
                    .iter()
                    .filter(|o| o.member.base_name == base_name)
                    .cloned()
                    .collect();
                MemberGroup {
                    base_name,
                    main,
                    overlays: group_overlays,
                }
            })
            .collect()
    }

    pub fn read(&mut self, entry: &GroupEntry) -> Result<Vec<u8>, ItemError> {
        let mut file = self.archive.by_index(entry.index)?;
        let mut bytes = Vec::with_capacity(file.size().min(MAX_PREALLOC) as usize);
        file.read_to_end(&mut bytes).map_err(|source| ItemError::Member {
            member: entry.name.clone(),
            source,
        })?;
        Ok(bytes)
    }
}
