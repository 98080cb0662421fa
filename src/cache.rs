//! The build cache owned by the orchestrator.
//!
//! One entry per source file, keyed by path: a content fingerprint plus,
//! for optimized assets, the path of the generated output. Entries are
//! updated on every successful transform and evicted when the source file
//! is deleted, so a later re-add of the same path is treated as novel.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::hash::Hash32;

/// Where the manifest is persisted between runs.
pub const CACHE_FILE: &str = ".cache/fingerprints.bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Hash32,
    /// Generated file recorded for this source, if any. Used by the watch
    /// coordinator to delete the output when the source disappears.
    pub output: Option<Utf8PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BuildCache {
    entries: HashMap<Utf8PathBuf, CacheEntry>,
}

impl BuildCache {
    /// Load the persisted manifest, starting fresh when none exists.
    pub fn load(path: &Utf8Path) -> Result<Self, CacheError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let file = BufReader::new(File::open(path)?);
        ciborium::from_reader(file).map_err(|e| CacheError::Decode(e.to_string()))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), CacheError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = BufWriter::new(File::create(path)?);
        ciborium::into_writer(self, file).map_err(|e| CacheError::Encode(e.to_string()))
    }

    /// Fingerprint a source file and record it. Returns `true` when the
    /// file is new or its content changed since the recorded fingerprint.
    pub fn update(&mut self, path: &Utf8Path) -> Result<bool, CacheError> {
        let fingerprint = Hash32::hash_file(path.as_std_path())?;

        match self.entries.get_mut(path) {
            Some(entry) if entry.fingerprint == fingerprint => Ok(false),
            Some(entry) => {
                entry.fingerprint = fingerprint;
                Ok(true)
            }
            None => {
                self.entries.insert(
                    path.to_owned(),
                    CacheEntry {
                        fingerprint,
                        output: None,
                    },
                );
                Ok(true)
            }
        }
    }

    /// Remember the generated file for a source, typically the optimized
    /// image written by the images transform.
    pub fn record_output(&mut self, source: &Utf8Path, output: impl Into<Utf8PathBuf>) {
        if let Some(entry) = self.entries.get_mut(source) {
            entry.output = Some(output.into());
        }
    }

    /// Remove the entry for a deleted source. The returned entry carries
    /// the recorded output path so the caller can delete the generated
    /// file as well.
    pub fn evict(&mut self, path: &Utf8Path) -> Option<CacheEntry> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &Utf8Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn fingerprint_of(&self, path: &Utf8Path) -> Option<Hash32> {
        self.entries.get(path).map(|entry| entry.fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Utf8Path, name: &str, content: &[u8]) -> Utf8PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn update_reports_novel_then_stable() {
        let (_guard, dir) = tempdir();
        let source = write_file(&dir, "logo.png", b"png bytes");

        let mut cache = BuildCache::default();
        assert!(cache.update(&source).unwrap());
        assert!(!cache.update(&source).unwrap());

        write_file(&dir, "logo.png", b"different bytes");
        assert!(cache.update(&source).unwrap());
    }

    #[test]
    fn evict_returns_recorded_output() {
        let (_guard, dir) = tempdir();
        let source = write_file(&dir, "logo.png", b"png bytes");

        let mut cache = BuildCache::default();
        cache.update(&source).unwrap();
        cache.record_output(&source, dir.join("build/images/logo.png"));

        let entry = cache.evict(&source).unwrap();
        assert_eq!(entry.output.unwrap(), dir.join("build/images/logo.png"));
        assert!(!cache.contains(&source));

        // A re-added file with the same name is novel again.
        assert!(cache.update(&source).unwrap());
    }

    #[test]
    fn manifest_survives_a_round_trip() {
        let (_guard, dir) = tempdir();
        let source = write_file(&dir, "logo.png", b"png bytes");
        let manifest = dir.join(".cache/fingerprints.bin");

        let mut cache = BuildCache::default();
        cache.update(&source).unwrap();
        cache.save(&manifest).unwrap();

        let loaded = BuildCache::load(&manifest).unwrap();
        assert_eq!(loaded.fingerprint_of(&source), cache.fingerprint_of(&source));

        // The file on disk didn't change, so the loaded cache sees it as
        // fresh.
        let mut loaded = loaded;
        assert!(!loaded.update(&source).unwrap());
    }

    #[test]
    fn missing_manifest_loads_empty() {
        let (_guard, dir) = tempdir();
        let cache = BuildCache::load(&dir.join("absent.bin")).unwrap();
        assert!(cache.is_empty());
    }
}
