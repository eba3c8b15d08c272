//! Disk-backed blob cache keyed by URL.
//!
//! - SHA256 cache keys over the URL with its fragment removed
//! - Path layout: `{root}/{namespace}/{first2}/{keyhex}.bin` plus a `.json` sidecar
//! - Atomic writes (temp + rename)
//! - Read failures are misses; a miss never blocks correctness
//!
//! The namespace plays the role of a cache version: bumping it and calling
//! [`BlobCache::purge_other_versions`] drops everything stored by older builds.
//!
//! # Access Paths
//!
//! Model artifacts are too large to hold in memory, so the downloader streams
//! them through [`BlobCache::writer`] and checks hits with [`BlobCache::meta`]
//! and [`BlobCache::path_for`]. Small assets go through the whole-body API
//! instead: [`BlobCache::get`], [`BlobCache::put`], [`BlobCache::remove`], and
//! the cache-first [`BlobCache::fetch_or_populate`]. Both paths share one
//! entry format, so either can read what the other wrote.

mod fetch;

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

pub use fetch::{Fetched, Source};

/// Namespace used when the caller does not pick one.
pub const DEFAULT_NAMESPACE: &str = "hearth-v1";

/// Sidecar format version.
const ENTRY_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Sidecar metadata stored next to each blob.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntryMeta {
    pub version: u32,
    pub url: String,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub stored_at: u64,
}

#[derive(Debug, Clone)]
pub struct BlobCache {
    root: PathBuf,
    namespace: String,
}

impl BlobCache {
    /// Open (creating if needed) the cache at `root` under `namespace`.
    pub fn open(root: impl Into<PathBuf>, namespace: impl Into<String>) -> Result<Self, CacheError> {
        let cache = Self {
            root: root.into(),
            namespace: namespace.into(),
        };
        let dir = cache.dir();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        Ok(cache)
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Directory holding this namespace's entries.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.namespace)
    }

    /// Metadata for a cached URL, if a valid entry exists.
    #[must_use]
    pub fn meta(&self, url: &Url) -> Option<EntryMeta> {
        let key = cache_key(url);
        let (blob, sidecar) = self.entry_paths(&key);
        let meta: EntryMeta = serde_json::from_str(&fs::read_to_string(&sidecar).ok()?).ok()?;

        let on_disk = fs::metadata(&blob).ok()?.len();
        if meta.version != ENTRY_VERSION || meta.url != canonical(url).as_str() || meta.size != on_disk {
            tracing::debug!(url = %url, "Dropping stale cache entry");
            remove_quietly(&blob);
            remove_quietly(&sidecar);
            return None;
        }
        Some(meta)
    }

    /// Path of the cached blob, if present and valid.
    #[must_use]
    pub fn path_for(&self, url: &Url) -> Option<PathBuf> {
        self.meta(url)?;
        Some(self.entry_paths(&cache_key(url)).0)
    }

    /// Cached bytes for `url`. Any read failure is a miss.
    #[must_use]
    pub fn get(&self, url: &Url) -> Option<Vec<u8>> {
        let path = self.path_for(url)?;
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::debug!(path = %path.display(), "Cache read failed, treating as miss: {err}");
                None
            }
        }
    }

    /// Store `bytes` for `url`, replacing any previous entry.
    pub fn put(&self, url: &Url, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        let mut writer = self.writer(url)?;
        writer.write_chunk(bytes)?;
        writer.commit()
    }

    /// Start a streaming write. Nothing becomes visible until [`BlobWriter::commit`];
    /// dropping the writer discards the partial file.
    pub fn writer(&self, url: &Url) -> Result<BlobWriter, CacheError> {
        let key = cache_key(url);
        let (blob, sidecar) = self.entry_paths(&key);
        if let Some(parent) = blob.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        let temp = blob.with_extension("tmp");
        let file = File::create(&temp).map_err(|e| CacheError::io(&temp, e))?;
        Ok(BlobWriter {
            url: canonical(url).to_string(),
            file: Some(file),
            temp,
            blob,
            sidecar,
            written: 0,
        })
    }

    /// Remove the entry for `url`. Returns whether one existed.
    pub fn remove(&self, url: &Url) -> Result<bool, CacheError> {
        let (blob, sidecar) = self.entry_paths(&cache_key(url));
        let existed = blob.exists();
        for path in [&blob, &sidecar] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }
        Ok(existed)
    }

    /// Delete every namespace under the root except the current one.
    ///
    /// Returns the number of namespaces removed.
    pub fn purge_other_versions(&self) -> Result<usize, CacheError> {
        let entries = fs::read_dir(&self.root).map_err(|e| CacheError::io(&self.root, e))?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || entry.file_name() == self.namespace.as_str() {
                continue;
            }
            fs::remove_dir_all(&path).map_err(|e| CacheError::io(&path, e))?;
            tracing::info!(namespace = %entry.file_name().to_string_lossy(), "Purged stale cache namespace");
            removed += 1;
        }
        Ok(removed)
    }

    /// Layout: `{root}/{namespace}/{first2}/{keyhex}.{bin,json}`
    fn entry_paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let prefix = key.get(..2).unwrap_or("00");
        let base = self.dir().join(prefix);
        (base.join(format!("{key}.bin")), base.join(format!("{key}.json")))
    }
}

/// In-progress cache write, see [`BlobCache::writer`].
#[derive(Debug)]
pub struct BlobWriter {
    url: String,
    file: Option<File>,
    temp: PathBuf,
    blob: PathBuf,
    sidecar: PathBuf,
    written: u64,
}

impl BlobWriter {
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).map_err(|e| CacheError::io(&self.temp, e))?;
            self.written += chunk.len() as u64;
        }
        Ok(())
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, then atomically publish the blob and its sidecar.
    pub fn commit(mut self) -> Result<PathBuf, CacheError> {
        if let Some(mut file) = self.file.take() {
            file.flush().map_err(|e| CacheError::io(&self.temp, e))?;
        }
        fs::rename(&self.temp, &self.blob).map_err(|e| CacheError::io(&self.blob, e))?;

        let meta = EntryMeta {
            version: ENTRY_VERSION,
            url: self.url.clone(),
            size: self.written,
            stored_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let sidecar_temp = self.sidecar.with_extension("json.tmp");
        fs::write(&sidecar_temp, serde_json::to_vec_pretty(&meta)?)
            .map_err(|e| CacheError::io(&sidecar_temp, e))?;
        fs::rename(&sidecar_temp, &self.sidecar).map_err(|e| CacheError::io(&self.sidecar, e))?;
        Ok(self.blob.clone())
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            remove_quietly(&self.temp);
        }
    }
}

/// SHA256 of the URL with its fragment removed, as lowercase hex.
#[must_use]
pub fn cache_key(url: &Url) -> String {
    let digest = Sha256::digest(canonical(url).as_str().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn canonical(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

fn remove_quietly(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn cache_key_ignores_fragment() {
        assert_eq!(
            cache_key(&url("https://hub.test/a/b#x")),
            cache_key(&url("https://hub.test/a/b#y"))
        );
        assert_ne!(
            cache_key(&url("https://hub.test/a/b")),
            cache_key(&url("https://hub.test/a/c"))
        );
        assert_eq!(cache_key(&url("https://hub.test/")).len(), 64);
    }

    #[test]
    fn entry_path_layout() {
        let temp = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(temp.path(), "ns").unwrap();
        let key = cache_key(&url("https://hub.test/model.onnx"));
        let (blob, sidecar) = cache.entry_paths(&key);

        assert_eq!(blob.parent().unwrap().file_name().unwrap(), &key[..2]);
        assert_eq!(blob.extension().unwrap(), "bin");
        assert_eq!(sidecar.extension().unwrap(), "json");
        assert!(blob.starts_with(temp.path().join("ns")));
    }

    #[test]
    fn put_then_get() {
        let temp = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(temp.path(), "ns").unwrap();
        let target = url("https://hub.test/config.json");

        assert_eq!(cache.get(&target), None);
        cache.put(&target, b"{}").unwrap();
        assert_eq!(cache.get(&target).as_deref(), Some(&b"{}"[..]));
        assert_eq!(cache.meta(&target).unwrap().size, 2);
    }

    #[test]
    fn streamed_entry_is_readable_whole() {
        let temp = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(temp.path(), "ns").unwrap();
        let target = url("https://hub.test/onnx/model.onnx");

        let mut writer = cache.writer(&target).unwrap();
        writer.write_chunk(b"ab").unwrap();
        writer.write_chunk(b"cd").unwrap();
        let path = writer.commit().unwrap();

        assert_eq!(cache.path_for(&target), Some(path));
        assert_eq!(cache.get(&target).as_deref(), Some(&b"abcd"[..]));
    }

    #[test]
    fn dropped_writer_leaves_no_entry() {
        let temp = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(temp.path(), "ns").unwrap();
        let target = url("https://hub.test/big.onnx");

        let mut writer = cache.writer(&target).unwrap();
        writer.write_chunk(b"partial").unwrap();
        drop(writer);

        assert_eq!(cache.get(&target), None);
        let key = cache_key(&target);
        assert!(!cache.entry_paths(&key).0.with_extension("tmp").exists());
    }

    #[test]
    fn corrupted_sidecar_is_a_miss() {
        let temp = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(temp.path(), "ns").unwrap();
        let target = url("https://hub.test/tokenizer.json");
        cache.put(&target, b"tokens").unwrap();

        let (_, sidecar) = cache.entry_paths(&cache_key(&target));
        fs::write(&sidecar, "not json").unwrap();
        assert_eq!(cache.get(&target), None);
    }

    #[test]
    fn truncated_blob_is_a_miss() {
        let temp = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(temp.path(), "ns").unwrap();
        let target = url("https://hub.test/model.onnx");
        cache.put(&target, b"0123456789").unwrap();

        let (blob, sidecar) = cache.entry_paths(&cache_key(&target));
        fs::write(&blob, b"0123").unwrap();
        assert_eq!(cache.get(&target), None);
        assert!(!sidecar.exists());
    }

    #[test]
    fn remove_reports_presence() {
        let temp = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(temp.path(), "ns").unwrap();
        let target = url("https://hub.test/x");
        assert!(!cache.remove(&target).unwrap());
        cache.put(&target, b"x").unwrap();
        assert!(cache.remove(&target).unwrap());
        assert_eq!(cache.get(&target), None);
    }

    #[test]
    fn purge_keeps_only_current_namespace() {
        let temp = tempfile::tempdir().unwrap();
        let old = BlobCache::open(temp.path(), "hearth-v0").unwrap();
        old.put(&url("https://hub.test/x"), b"old").unwrap();
        let current = BlobCache::open(temp.path(), "hearth-v1").unwrap();
        current.put(&url("https://hub.test/x"), b"new").unwrap();

        assert_eq!(current.purge_other_versions().unwrap(), 1);
        assert!(!temp.path().join("hearth-v0").exists());
        assert_eq!(
            current.get(&url("https://hub.test/x")).as_deref(),
            Some(&b"new"[..])
        );
    }
}
