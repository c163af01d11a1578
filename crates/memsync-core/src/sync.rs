use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::destination::{Destination, DestinationIndex};
use crate::error::{FatalError, Result};
use crate::record::Record;

/// What to do when the target name already exists at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Skip,
    Overwrite,
    /// Drop records whose prefix already appears at the destination before the run starts
    New,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(ConflictPolicy::Skip),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "new" => Ok(ConflictPolicy::New),
            other => Err(format!("unknown conflict policy {:?} (expected skip, overwrite or new)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CommitOutcome {
    Committed {
        name: String,
        location: String,
        size: u64,
        sha256: String,
        metadata_embedded: bool,
    },
    Skipped {
        name: String,
        reason: String,
        existing: Vec<String>,
    },
}

impl CommitOutcome {
    pub fn name(&self) -> &str {
        match self {
            CommitOutcome::Committed { name, .. } | CommitOutcome::Skipped { name, .. } => name,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }
}

/// Owns the destination session and the run's view of what already exists there.
pub struct SyncManager {
    destination: Box<dyn Destination>,
    policy: ConflictPolicy,
    index: DestinationIndex,
}

impl SyncManager {
    /// Snapshot the destination once; the index is maintained incrementally afterwards.
    pub fn open(mut destination: Box<dyn Destination>, policy: ConflictPolicy) -> Result<Self> {
        let index = destination.snapshot().map_err(|source| FatalError::Destination {
            op: "list",
            name: destination.describe(),
            source,
        })?;
        info!(destination = %destination.describe(), existing = index.len(), ?policy, "destination opened");
        Ok(Self {
            destination,
            policy,
            index,
        })
    }

    pub fn destination(&self) -> &dyn Destination {
        self.destination.as_ref()
    }

    pub fn index(&self) -> &DestinationIndex {
        &self.index
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Split off records whose prefix already matches an existing name (`new` policy only).
    /// Returns the records to process and how many were dropped.
    pub fn retain_new(&self, records: Vec<Record>) -> (Vec<Record>, usize) {
        if self.policy != ConflictPolicy::New {
            return (records, 0);
        }
        let before = records.len();
        let kept: Vec<Record> = records
            .into_iter()
            .filter(|r| {
                let seen = self.index.any_starts_with(&r.prefix);
                if seen {
                    debug!(prefix = %r.prefix, "already present at destination, dropping from run");
                }
                !seen
            })
            .collect();
        let dropped = before - kept.len();
        (kept, dropped)
    }

    /// Place `bytes` under `name`, honouring the conflict policy.
    pub fn commit(&mut self, name: &str, bytes: &[u8], record: &Record) -> Result<CommitOutcome> {
        if self.index.contains(name) {
            match self.policy {
                ConflictPolicy::Skip | ConflictPolicy::New => {
                    debug!(name, "exists, skipping");
                    return Ok(CommitOutcome::Skipped {
                        name: name.to_string(),
                        reason: "exists".to_string(),
                        existing: self.index.get(name).to_vec(),
                    });
                }
                ConflictPolicy::Overwrite => {
                    for location in self.index.get(name).to_vec() {
                        self.destination
                            .delete(name, &location)
                            .map_err(|source| FatalError::Destination {
                                op: "delete",
                                name: name.to_string(),
                                source,
                            })?;
                        debug!(name, %location, "removed previous entry");
                    }
                    self.index.remove(name);
                }
            }
        }

        let written = self.destination.write(name, bytes, record).map_err(|source| {
            if source.is_quota_exhausted() {
                FatalError::QuotaExhausted(format!("{}: {}", name, source))
            } else {
                FatalError::Destination {
                    op: "write",
                    name: name.to_string(),
                    source,
                }
            }
        })?;
        self.index.insert(name, written.location.clone());
        info!(name, location = %written.location, size = bytes.len(), "saved");

        Ok(CommitOutcome::Committed {
            name: name.to_string(),
            location: written.location,
            size: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(bytes)),
            metadata_embedded: written.metadata_embedded,
        })
    }
}
