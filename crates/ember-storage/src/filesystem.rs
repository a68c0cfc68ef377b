//! Directory-backed storage: one JSON file per session.
//!
//! A session `id` is stored at `{dir}/{prefix}{id}.json`. Writes go to a
//! temporary file that is synced and then renamed over the target, so a
//! crash never leaves a half-written session behind.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use ember_session::{Storage, Values};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Result, StorageError};

const EXTENSION: &str = ".json";
const TMP_SUFFIX: &str = ".tmp";

/// Storage that keeps each session in its own file.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    prefix: String,
    /// Serializes writers so concurrent saves never share a temp file.
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    ///
    /// Only files named `{prefix}*.json` belong to this store, so several
    /// stores can share a directory under different prefixes.
    pub fn new(dir: impl AsRef<Path>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let prefix = prefix.into();
        debug!(dir = %dir.display(), prefix = %prefix, "File session storage opened");
        Ok(Self {
            dir,
            prefix,
            write_lock: Mutex::new(()),
        })
    }

    /// Storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Path of the file holding `id`.
    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self
            .dir
            .join(format!("{}{}{}", self.prefix, id, EXTENSION)))
    }

    fn write_values(&self, id: &str, values: &Values) -> Result<()> {
        let path = self.path_for(id)?;
        let bytes = serde_json::to_vec(values)?;

        let mut tmp_name = path.clone().into_os_string();
        tmp_name.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp_name);

        let _guard = self.write_lock.lock();
        let result = (|| -> Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result?;

        trace!(session_id = %id, bytes = bytes.len(), "Session file written");
        Ok(())
    }

    fn read_values(&self, id: &str) -> Result<Option<Values>> {
        let path = self.path_for(id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(file = ?entry.path(), "Skipping session file with non UTF-8 name");
                continue;
            };
            let id = name
                .strip_prefix(self.prefix.as_str())
                .and_then(|rest| rest.strip_suffix(EXTENSION));
            match id {
                Some(id) if validate_id(id).is_ok() => ids.push(id.to_string()),
                _ => {}
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                trace!(session_id = %id, "Session file removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Storage for FileStorage {
    fn save(&self, id: &str, values: &Values) -> ember_session::Result<()> {
        Ok(self.write_values(id, values)?)
    }

    fn read(&self, id: &str) -> ember_session::Result<Option<Values>> {
        Ok(self.read_values(id)?)
    }

    fn list(&self) -> ember_session::Result<Vec<String>> {
        Ok(self.list_ids()?)
    }

    fn delete(&self, id: &str) -> ember_session::Result<()> {
        Ok(self.remove(id)?)
    }
}

/// Reject ids that would escape the directory or make an unreadable name.
fn validate_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if bad {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), "sess_").unwrap();
        (dir, storage)
    }

    fn values(pairs: &[(&str, serde_json::Value)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_save_and_read() {
        let (_dir, storage) = setup();
        let saved = values(&[
            ("ct", json!(1_700_000_000_000_000_000i64)),
            ("cart", json!({"items": [1, 2, 3]})),
        ]);
        storage.save("abc", &saved).unwrap();

        assert_eq!(storage.read("abc").unwrap(), Some(saved));
        assert!(storage.dir().join("sess_abc.json").exists());
    }

    #[test]
    fn test_read_missing() {
        let (_dir, storage) = setup();
        assert!(storage.read("nope").unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_without_leftovers() {
        let (dir, storage) = setup();
        storage.save("abc", &values(&[("v", json!(1))])).unwrap();
        storage.save("abc", &values(&[("v", json!(2))])).unwrap();

        let loaded = storage.read("abc").unwrap().unwrap();
        assert_eq!(loaded.get("v"), Some(&json!(2)));

        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_list_filters_by_prefix_and_extension() {
        let (dir, storage) = setup();
        storage.save("b", &Values::new()).unwrap();
        storage.save("a", &Values::new()).unwrap();

        fs::write(dir.path().join("other_c.json"), "{}").unwrap();
        fs::write(dir.path().join("sess_d.txt"), "{}").unwrap();
        fs::write(dir.path().join("sess_e.json.tmp"), "{}").unwrap();
        fs::create_dir(dir.path().join("sess_f.json")).unwrap();

        assert_eq!(storage.list().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_stores_share_directory_by_prefix() {
        let dir = TempDir::new().unwrap();
        let first = FileStorage::new(dir.path(), "one_").unwrap();
        let second = FileStorage::new(dir.path(), "two_").unwrap();

        first.save("x", &values(&[("n", json!(1))])).unwrap();
        second.save("x", &values(&[("n", json!(2))])).unwrap();

        assert_eq!(first.list().unwrap(), vec!["x"]);
        assert_eq!(first.read("x").unwrap().unwrap().get("n"), Some(&json!(1)));
        assert_eq!(second.read("x").unwrap().unwrap().get("n"), Some(&json!(2)));
    }

    #[test]
    fn test_delete() {
        let (_dir, storage) = setup();
        storage.save("abc", &Values::new()).unwrap();

        storage.delete("abc").unwrap();
        assert!(storage.read("abc").unwrap().is_none());

        // Deleting again is fine
        storage.delete("abc").unwrap();
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let storage = FileStorage::new(&nested, "").unwrap();

        storage.save("s", &Values::new()).unwrap();
        assert!(nested.join("s.json").exists());
        assert_eq!(storage.list().unwrap(), vec!["s"]);
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let (_dir, storage) = setup();
        for id in ["", ".", "..", "../evil", "a/b", "a\\b", "nul\0"] {
            let err = storage.save(id, &Values::new()).unwrap_err();
            assert!(
                matches!(err, ember_session::Error::Storage(ref msg) if msg.contains("Invalid session id")),
                "id {id:?} gave {err:?}"
            );
            assert!(storage.read(id).is_err());
            assert!(storage.delete(id).is_err());
        }
    }

    #[test]
    fn test_dotted_ids_accepted() {
        let (dir, storage) = setup();
        for id in ["a..b", "v1.2", "..x"] {
            storage.save(id, &Values::new()).unwrap();
            assert!(storage.read(id).unwrap().is_some());
        }
        assert!(dir.path().join("sess_a..b.json").exists());
        assert_eq!(storage.prefix(), "sess_");
        assert_eq!(storage.list().unwrap(), vec!["..x", "a..b", "v1.2"]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let (dir, storage) = setup();
        fs::write(dir.path().join("sess_bad.json"), "not json").unwrap();

        let err = storage.read("bad").unwrap_err();
        assert!(matches!(err, ember_session::Error::Storage(_)));
    }
}
