use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{Capacity, Destination, DestinationIndex, Written};
use crate::error::DestinationError;
use crate::metadata;
use crate::record::Record;

type FreeSpaceProbe = Box<dyn Fn(&Path) -> io::Result<Option<u64>>>;

/// A directory on the local filesystem.
pub struct LocalDestination {
    dir: PathBuf,
    free_space: FreeSpaceProbe,
}

impl LocalDestination {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, DestinationError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| DestinationError::io(&dir, e))?;
        Ok(Self {
            dir,
            free_space: Box::new(disk_free_space),
        })
    }

    /// Replace the free-space lookup (tests, or filesystems sysinfo cannot see).
    pub fn with_free_space(mut self, probe: impl Fn(&Path) -> io::Result<Option<u64>> + 'static) -> Self {
        self.free_space = Box::new(probe);
        self
    }
}

/// Available bytes on the mounted disk that holds `dir` (longest matching mount point).
pub fn disk_free_space(dir: &Path) -> io::Result<Option<u64>> {
    let target = dir.canonicalize()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    Ok(disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space()))
}

impl Destination for LocalDestination {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn snapshot(&mut self) -> Result<DestinationIndex, DestinationError> {
        let mut index = DestinationIndex::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| DestinationError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| DestinationError::io(&self.dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                index.insert(name, path.display().to_string());
            }
        }
        Ok(index)
    }

    fn capacity(&self) -> Result<Capacity, DestinationError> {
        let free = (self.free_space)(&self.dir).map_err(|e| DestinationError::io(&self.dir, e))?;
        Ok(Capacity::FreeSpace(free))
    }

    fn write(&mut self, name: &str, bytes: &[u8], record: &Record) -> Result<Written, DestinationError> {
        let path = self.dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DestinationError::io(parent, e))?;
        }
        fs::write(&path, bytes).map_err(|e| DestinationError::io(&path, e))?;

        let taken = record.parsed_date();
        let metadata_embedded = metadata::embed_file(&path, &record.metadata(), taken);

        match taken {
            // Export dates are UTC
            Some(dt) => {
                let ft = filetime::FileTime::from_unix_time(dt.and_utc().timestamp(), 0);
                if let Err(e) = filetime::set_file_mtime(&path, ft) {
                    warn!(file = %path.display(), error = %e, "failed setting modification time");
                }
            }
            None => debug!(file = %path.display(), date = %record.date, "unparseable record date, leaving mtime"),
        }

        Ok(Written {
            location: path.display().to_string(),
            metadata_embedded,
        })
    }

    fn delete(&mut self, _name: &str, location: &str) -> Result<(), DestinationError> {
        match fs::remove_file(location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DestinationError::io(location, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MediaType;

    fn record() -> Record {
        Record {
            date: "2020-02-03 04:05:06 UTC".into(),
            media_type: MediaType::Image,
            location: String::new(),
            download_url: Some("https://example.com/a".into()),
            prefix: "2020-02-03".into(),
        }
    }

    #[test]
    fn test_snapshot_lists_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let mut dest = LocalDestination::new(dir.path()).unwrap();
        let index = dest.snapshot().unwrap();
        assert!(index.contains("a.jpg"));
        assert!(!index.contains("sub"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_write_sets_mtime_from_record_date() {
        let dir = tempfile::tempdir().unwrap();
        let mut dest = LocalDestination::new(dir.path().join("out")).unwrap();
        let written = dest.write("x.bin", b"payload", &record()).unwrap();

        assert_eq!(fs::read(&written.location).unwrap(), b"payload");
        let meta = fs::metadata(&written.location).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        let expected = chrono::NaiveDate::from_ymd_opt(2020, 2, 3)
            .unwrap()
            .and_hms_opt(4, 5, 6)
            .unwrap()
            .and_utc()
            .timestamp();
        assert_eq!(mtime.unix_seconds(), expected);
    }

    #[test]
    fn test_capacity_uses_probe() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalDestination::new(dir.path()).unwrap().with_free_space(|_| Ok(Some(42)));
        assert_eq!(dest.capacity().unwrap(), Capacity::FreeSpace(Some(42)));
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut dest = LocalDestination::new(dir.path()).unwrap();
        let missing = dir.path().join("nope.jpg");
        assert!(dest.delete("nope.jpg", &missing.display().to_string()).is_ok());
    }
}
