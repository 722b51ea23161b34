// Persisted lineage state
//
// One line per (subvolume, remote) key, text-based like the rest of the
// state directory:
//
//   # snapvault lineage v1
//   <subvolume> <remote> <host> <timestamp>
//
// Rewritten as a whole on every change (temp file, fsync, rename). A line
// that does not parse is an error, never skipped.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use super::LineageKey;
use crate::error::{Error, LineageError, PersistenceError};
use crate::snapshot::{format_timestamp, is_valid_name, parse_timestamp, SnapshotRef};

pub type LineageMap = HashMap<LineageKey, SnapshotRef>;

/// Create `dir` (and missing parents) readable by the owner only.
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
        builder.mode(0o700);
        builder.create(dir)?;
        // An existing directory keeps its mode under `create`.
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
    }
    #[cfg(not(unix))]
    builder.create(dir)
}

/// Options for state files: created with mode 0600.
pub(crate) fn private_file_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

/// Lineage file plus the exclusive lock guarding the state directory.
#[derive(Debug)]
pub struct LineageFile {
    path: PathBuf,
    // Held for the lifetime of the tracker; released on drop.
    _lock: File,
}

impl LineageFile {
    /// Format version
    const FORMAT_VERSION: &'static str = "v1";

    pub const FILE_NAME: &'static str = "lineage.lst";
    pub const LOCK_NAME: &'static str = "lineage.lock";

    /// Lock the state directory and load the current records.
    pub fn open(state_dir: &Path) -> Result<(Self, LineageMap), Error> {
        create_private_dir(state_dir).map_err(|e| PersistenceError::io(state_dir, e))?;

        let lock_path = state_dir.join(Self::LOCK_NAME);
        let lock = private_file_options()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| PersistenceError::io(&lock_path, e))?;
        lock.try_lock_exclusive()
            .map_err(|_| PersistenceError::Locked(lock_path.clone()))?;

        let path = state_dir.join(Self::FILE_NAME);
        let records = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            HashMap::new()
        };

        Ok((Self { path, _lock: lock }, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the records without taking the lock, e.g. while a daemon owns
    /// the directory. Saves are atomic renames, so a read never sees a
    /// half-written file.
    pub fn load(state_dir: &Path) -> Result<LineageMap, Error> {
        let path = state_dir.join(Self::FILE_NAME);
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Ok(HashMap::new())
        }
    }

    fn load_from_file(path: &Path) -> Result<LineageMap, Error> {
        let file = File::open(path).map_err(|e| PersistenceError::io(path, e))?;
        let reader = BufReader::new(file);
        let mut records = HashMap::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| PersistenceError::io(path, e))?;
            let line = line.trim();

            // Skip comments and blank lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, snapshot) = parse_line(line).map_err(|reason| LineageError::Corrupted {
                line: idx + 1,
                reason,
            })?;
            if records.insert(key.clone(), snapshot).is_some() {
                return Err(LineageError::Corrupted {
                    line: idx + 1,
                    reason: format!("duplicate record for {}", key),
                }
                .into());
            }
        }

        Ok(records)
    }

    /// Replace the file with `records` (atomic write).
    pub fn save(&self, records: &LineageMap) -> Result<(), PersistenceError> {
        let temp_file = self.path.with_extension("tmp");
        let io_err = |e| PersistenceError::io(&temp_file, e);

        {
            let mut file = private_file_options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_file)
                .map_err(io_err)?;

            writeln!(file, "# snapvault lineage {}", Self::FORMAT_VERSION).map_err(io_err)?;

            // Sorted for deterministic output
            let mut entries: Vec<_> = records.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            for (key, snapshot) in entries {
                writeln!(
                    file,
                    "{} {} {} {}",
                    key.subvolume,
                    key.remote,
                    snapshot.host(),
                    format_timestamp(&snapshot.taken())
                )
                .map_err(io_err)?;
            }

            file.sync_all().map_err(io_err)?;
        }

        // Atomic rename
        fs::rename(&temp_file, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        if let Some(dir) = self.path.parent() {
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

fn parse_line(line: &str) -> Result<(LineageKey, SnapshotRef), String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let [subvolume, remote, host, ts] = parts.as_slice() else {
        return Err(format!("expected 4 fields, found {}", parts.len()));
    };
    for name in [subvolume, remote, host] {
        if !is_valid_name(name) {
            return Err(format!("invalid name {:?}", name));
        }
    }
    let taken = parse_timestamp(ts).map_err(|e| e.to_string())?;

    Ok((
        LineageKey::new(*subvolume, *remote),
        SnapshotRef::new(*host, *subvolume, taken),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snap(ts: &str) -> SnapshotRef {
        SnapshotRef::new("alpha", "home", parse_timestamp(ts).unwrap())
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let mut records = HashMap::new();
        records.insert(LineageKey::new("home", "backup01"), snap("20240101000000"));
        records.insert(LineageKey::new("home", "backup02"), snap("20240102000000"));

        {
            let (file, loaded) = LineageFile::open(tmp.path()).unwrap();
            assert!(loaded.is_empty());
            file.save(&records).unwrap();
        }

        let (_file, loaded) = LineageFile::open(tmp.path()).unwrap();
        assert_eq!(loaded, records);

        let text = fs::read_to_string(tmp.path().join(LineageFile::FILE_NAME)).unwrap();
        assert!(text.starts_with("# snapvault lineage v1\n"));
        assert!(text.contains("home backup01 alpha 20240101000000"));
    }

    #[test]
    fn test_corrupted_line_is_an_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(LineageFile::FILE_NAME),
            "# snapvault lineage v1\nhome backup01 alpha 20240101000000\nhome backup02 alpha\n",
        )
        .unwrap();

        let err = LineageFile::open(tmp.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::Lineage(LineageError::Corrupted { line: 3, .. })
        ));
    }

    #[test]
    fn test_bad_timestamp_is_an_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(LineageFile::FILE_NAME),
            "home backup01 alpha 2024-01-01\n",
        )
        .unwrap();
        assert!(matches!(
            LineageFile::open(tmp.path()),
            Err(Error::Lineage(LineageError::Corrupted { line: 1, .. }))
        ));
    }

    #[test]
    fn test_duplicate_key_is_an_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(LineageFile::FILE_NAME),
            "home backup01 alpha 20240101000000\nhome backup01 alpha 20240102000000\n",
        )
        .unwrap();
        assert!(LineageFile::open(tmp.path()).is_err());
    }

    #[test]
    fn test_state_dir_is_locked() {
        let tmp = TempDir::new().unwrap();
        let (_held, _) = LineageFile::open(tmp.path()).unwrap();
        assert!(matches!(
            LineageFile::open(tmp.path()),
            Err(Error::Persistence(PersistenceError::Locked(_)))
        ));
    }

    #[test]
    fn test_load_while_locked() {
        let tmp = TempDir::new().unwrap();
        let mut records = HashMap::new();
        records.insert(LineageKey::new("home", "backup01"), snap("20240101000000"));

        let (held, _) = LineageFile::open(tmp.path()).unwrap();
        held.save(&records).unwrap();
        assert_eq!(LineageFile::load(tmp.path()).unwrap(), records);
        assert!(LineageFile::load(&tmp.path().join("missing")).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_state_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("state").join("initiated");
        let mut records = HashMap::new();
        records.insert(LineageKey::new("home", "backup01"), snap("20240101000000"));
        let (file, _) = LineageFile::open(&dir).unwrap();
        file.save(&records).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&dir), 0o700);
        assert_eq!(mode(&dir.join(LineageFile::FILE_NAME)), 0o600);
        assert_eq!(mode(&dir.join(LineageFile::LOCK_NAME)), 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_state_dir_is_tightened() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("served");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();

        let _held = LineageFile::open(&dir).unwrap();
        assert_eq!(fs::metadata(&dir).unwrap().permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn test_stale_temp_file_ignored() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("lineage.tmp"), "garbage from a crash").unwrap();
        let (_file, loaded) = LineageFile::open(tmp.path()).unwrap();
        assert!(loaded.is_empty());
    }
}
