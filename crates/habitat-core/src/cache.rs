//! Content-keyed stage artifacts.
//!
//! Each artifact `<name>` in the data directory has a sidecar `<name>.key`
//! holding the SHA-256 of the stage name, its parameters and its upstream keys.
//! A stage is recomputed when the artifact is absent, its key differs, or the
//! store was opened with `force`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, SdmError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<P: Serialize + ?Sized>(stage: &str, params: &P, upstream: &[&CacheKey]) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(stage.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(params)?);
        for key in upstream {
            hasher.update([0u8]);
            hasher.update(key.0.as_bytes());
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

pub struct ArtifactStore {
    dir: PathBuf,
    force: bool,
}

impl ArtifactStore {
    pub fn open(dir: impl Into<PathBuf>, force: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| SdmError::io(&dir, e))?;
        Ok(Self { dir, force })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.key"))
    }

    /// The next `get_or_compute` for this artifact will load rather than compute.
    pub fn will_reuse(&self, name: &str, key: &CacheKey) -> bool {
        !self.force && self.is_current(name, key)
    }

    /// Artifact exists and was written under `key`.
    pub fn is_current(&self, name: &str, key: &CacheKey) -> bool {
        self.path(name).is_file()
            && fs::read_to_string(self.key_path(name)).is_ok_and(|k| k.trim() == key.as_str())
    }

    /// Reload the artifact when current, otherwise compute, save and stamp it.
    pub fn get_or_compute<T>(
        &self,
        name: &str,
        key: &CacheKey,
        load: impl FnOnce(&Path) -> Result<T>,
        save: impl FnOnce(&T, &Path) -> Result<()>,
        compute: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let path = self.path(name);
        if self.will_reuse(name, key) {
            debug!("cache hit: {name} [{key}]");
            return load(&path);
        }

        let value = compute()?;
        let key_path = self.key_path(name);
        // An interrupted write must not leave a stale key next to a partial artifact.
        if key_path.exists() {
            fs::remove_file(&key_path).map_err(|e| SdmError::io(&key_path, e))?;
        }
        save(&value, &path)?;
        fs::write(&key_path, key.as_str()).map_err(|e| SdmError::io(&key_path, e))?;
        info!("wrote {} [{key}]", path.display());
        Ok(value)
    }

    pub fn json<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        key: &CacheKey,
        compute: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.get_or_compute(name, key, load_json, save_json, compute)
    }

    pub fn csv<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        key: &CacheKey,
        compute: impl FnOnce() -> Result<Vec<T>>,
    ) -> Result<Vec<T>> {
        self.get_or_compute(name, key, load_csv_rows, |rows, path| save_csv_rows(rows.as_slice(), path), compute)
    }
}

pub fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).map_err(|e| SdmError::io(path, e))
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| SdmError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| SdmError::corrupt(path, e))
}

pub fn save_csv_rows<T: Serialize>(rows: &[T], path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush().map_err(|e| SdmError::io(path, e))
}

pub fn load_csv_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = csv::Reader::from_path(path)?;
    rdr.deserialize()
        .collect::<std::result::Result<Vec<T>, _>>()
        .map_err(|e| SdmError::corrupt(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::cell::Cell;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: usize,
        name: Option<String>,
    }

    #[test]
    fn key_depends_on_stage_params_and_upstream() {
        let up = CacheKey::new("a", &1, &[]).unwrap();
        let k = CacheKey::new("b", &0.7, &[&up]).unwrap();
        assert_eq!(k, CacheKey::new("b", &0.7, &[&up]).unwrap());
        assert_ne!(k, CacheKey::new("c", &0.7, &[&up]).unwrap());
        assert_ne!(k, CacheKey::new("b", &0.8, &[&up]).unwrap());
        assert_ne!(k, CacheKey::new("b", &0.7, &[]).unwrap());
        assert_eq!(k.as_str().len(), 64);
    }

    #[test]
    fn current_artifact_is_reused_without_compute() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path(), false).unwrap();
        let key = CacheKey::new("s", &"p", &[]).unwrap();
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            Ok(vec![1, 2, 3])
        };
        assert_eq!(store.json("v.json", &key, compute).unwrap(), vec![1, 2, 3]);
        let again: Vec<i32> = store.json("v.json", &key, || panic!("must not recompute")).unwrap();
        assert_eq!(again, vec![1, 2, 3]);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn changed_key_or_force_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path(), false).unwrap();
        let k1 = CacheKey::new("s", &1, &[]).unwrap();
        let k2 = CacheKey::new("s", &2, &[]).unwrap();
        store.json("v.json", &k1, || Ok(1)).unwrap();
        assert_eq!(store.json("v.json", &k2, || Ok(2)).unwrap(), 2);
        assert!(store.is_current("v.json", &k2));
        assert!(!store.is_current("v.json", &k1));

        let forced = ArtifactStore::open(dir.path(), true).unwrap();
        assert_eq!(forced.json("v.json", &k2, || Ok(3)).unwrap(), 3);
        assert_eq!(store.json("v.json", &k2, || Ok(4)).unwrap(), 3);
    }

    #[test]
    fn corrupt_artifact_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path(), false).unwrap();
        let key = CacheKey::new("s", &(), &[]).unwrap();
        store.json("v.json", &key, || Ok(vec![1.5])).unwrap();
        fs::write(store.path("v.json"), "{not json").unwrap();
        let err = store.json::<Vec<f64>>("v.json", &key, || Ok(vec![])).unwrap_err();
        assert!(matches!(err, SdmError::CorruptArtifact { .. }));
    }

    #[test]
    fn csv_rows_round_trip_with_empty_options() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path(), false).unwrap();
        let key = CacheKey::new("rows", &(), &[]).unwrap();
        let rows = vec![Row { id: 1, name: Some("x".into()) }, Row { id: 2, name: None }];
        store.csv("rows.csv", &key, || Ok(rows)).unwrap();
        let back: Vec<Row> = store.csv("rows.csv", &key, || panic!("must not recompute")).unwrap();
        assert_eq!(back[1], Row { id: 2, name: None });
        assert_eq!(back.len(), 2);
    }
}
