use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::sync::CommitOutcome;

/// Source URL -> every outcome produced from it during the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunReport {
    entries: BTreeMap<String, Vec<CommitOutcome>>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append outcomes for `url`; a URL seen twice accumulates.
    pub fn record(&mut self, url: &str, outcomes: Vec<CommitOutcome>) {
        self.entries.entry(url.to_string()).or_default().extend(outcomes);
    }

    pub fn get(&self, url: &str) -> Option<&[CommitOutcome]> {
        self.entries.get(url).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Write the report as pretty JSON via a temp file in the same directory, then rename.
pub fn write_report(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let file = fs::File::create(&tmp_path)?;
    serde_json::to_writer_pretty(file, report)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
