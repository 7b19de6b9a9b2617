use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{JsonStore, StoreError};

const VALUE_EXTENSION: &str = "json";
const TMP_EXTENSION: &str = "tmp";

/// A JSON store kept as a directory with one file per key.
///
/// A write only touches its own key's file. It goes to a uniquely named
/// temporary sibling first and is renamed into place, so a crash leaves either
/// the old or the new value. Reads are served from memory.
#[derive(Debug)]
pub struct FileJsonStore {
    dir: PathBuf,
    data: DashMap<String, Value>,
}

impl FileJsonStore {
    /// Open the store in `dir`, creating the directory if it does not exist.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let data = DashMap::new();

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let extension = path.extension().and_then(|e| e.to_str());
            if extension == Some(TMP_EXTENSION) {
                // Left behind by an interrupted write.
                fs::remove_file(&path)?;
                continue;
            }
            if extension != Some(VALUE_EXTENSION) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
            else {
                tracing::warn!(path = %path.display(), "Skipping file with undecodable name");
                continue;
            };
            let value: Value = serde_json::from_slice(&fs::read(&path)?)?;
            data.insert(key, value);
        }

        tracing::info!(dir = %dir.display(), keys = data.len(), "Opened JSON store");
        Ok(Self { dir, data })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{VALUE_EXTENSION}", encode_key(key)))
    }

    fn write_value(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let target = self.value_path(key);
        let tmp = self
            .dir
            .join(format!("{}.{}.{TMP_EXTENSION}", encode_key(key), Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec(value)?)?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Keys carry '/' and other characters that are not safe in file names, so
/// everything outside `[A-Za-z0-9_-]` is written as `%XX`.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn decode_key(name: &str) -> Option<String> {
    let raw = name.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).ok()
}

impl JsonStore for FileJsonStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.write_value(key, &value)?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.value_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.data.remove(key).is_some())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.data.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use serde_json::json;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        let store = FileJsonStore::open(&path).unwrap();
        store.set("commit_tests_repo/a", json!([1, 2, 3])).unwrap();
        store.set("b", json!("x")).unwrap();
        assert!(store.delete("b").unwrap());
        assert!(!store.delete("b").unwrap());
        drop(store);

        let reopened = FileJsonStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("commit_tests_repo/a").unwrap(),
            Some(json!([1, 2, 3]))
        );
        assert!(!reopened.exists("b").unwrap());
    }

    #[test]
    fn each_key_is_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJsonStore::open(dir.path()).unwrap();
        store.set("branch_is_deep_test_repo/master", json!(true)).unwrap();
        store.set("test_1", json!({"a": 1})).unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "branch_is_deep_test_repo%2Fmaster.json".to_string(),
                "test_1.json".to_string(),
            ]
        );
    }

    #[test]
    fn concurrent_writers_do_not_clobber_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileJsonStore::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|writer| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        store.set(&format!("test_{writer}_{i}"), json!(i)).unwrap();
                        store.set("shared", json!(writer)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = FileJsonStore::open(dir.path()).unwrap();
        for writer in 0..8 {
            for i in 0..20 {
                assert_eq!(
                    reopened.get(&format!("test_{writer}_{i}")).unwrap(),
                    Some(json!(i))
                );
            }
        }
        assert!(reopened.get("shared").unwrap().is_some());
        assert!(fs::read_dir(dir.path()).unwrap().all(|entry| {
            entry.unwrap().path().extension().and_then(|e| e.to_str()) == Some(VALUE_EXTENSION)
        }));
    }

    #[test]
    fn leftover_temporaries_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test_1.json"), b"{\"a\": 1}").unwrap();
        fs::write(dir.path().join("test_1.0000.tmp"), b"{\"a\"").unwrap();

        let store = FileJsonStore::open(dir.path()).unwrap();
        assert_eq!(store.get("test_1").unwrap(), Some(json!({"a": 1})));
        assert!(!dir.path().join("test_1.0000.tmp").exists());
    }

    #[test]
    fn corrupt_value_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test_1.json"), b"not json").unwrap();
        assert!(matches!(
            FileJsonStore::open(dir.path()),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn key_encoding_round_trips_unsafe_characters() {
        let key = "commit_test_definitions_repo/a.b c%";
        let encoded = encode_key(key);
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('.'));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        assert_eq!(decode_key("bad%zz"), None);
    }
}
