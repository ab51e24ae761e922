#![forbid(unsafe_code)]

//! The catalog of known videos, persisted as a single JSON array.
//!
//! `CatalogStore` is the raw file layer. `Catalog` wraps it behind a mutex so
//! every read-modify-write runs to completion before the next one starts; two
//! concurrent adds can no longer overwrite each other.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Number;
use tracing::debug;

/// One row of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEntry {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnail_local: Option<String>,
    pub url: String,
    /// Kept as a raw JSON number so integer and fractional durations survive a
    /// rewrite untouched.
    #[serde(default)]
    pub duration: Option<Number>,
    /// Filename under the videos directory, set once a download completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_file: Option<String>,
}

impl VideoEntry {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }

    /// `m:ss` or `h:mm:ss`, `None` when the duration is unknown.
    pub fn duration_text(&self) -> Option<String> {
        let seconds = self.duration.as_ref()?.as_f64()?;
        if !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        let total = seconds.round() as u64;
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let secs = total % 60;
        Some(if hours > 0 {
            format!("{hours}:{minutes:02}:{secs:02}")
        } else {
            format!("{minutes}:{secs:02}")
        })
    }
}

/// File-backed storage for the entry list.
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry. A missing file is an empty catalog; a malformed one
    /// is an error.
    pub fn load(&self) -> Result<Vec<VideoEntry>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }

    /// Replaces the whole document. The previous file stays intact until the
    /// new one has been fully written.
    pub fn save(&self, entries: &[VideoEntry]) -> Result<()> {
        write_json_atomic(&self.path, &entries)
    }
}

/// Result of [`Catalog::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// Single owner of the catalog file. All mutations are serialized.
pub struct Catalog {
    store: Mutex<CatalogStore>,
}

impl Catalog {
    pub fn new(store: CatalogStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(CatalogStore::new(path))
    }

    pub fn entries(&self) -> Result<Vec<VideoEntry>> {
        self.store.lock().load()
    }

    pub fn get(&self, id: &str) -> Result<Option<VideoEntry>> {
        Ok(self.entries()?.into_iter().find(|entry| entry.id == id))
    }

    /// Appends `entry`, or replaces the entry with the same id in place. A
    /// recorded `local_file` survives the replacement when the new entry has
    /// none.
    pub fn upsert(&self, mut entry: VideoEntry) -> Result<Upsert> {
        let store = self.store.lock();
        let mut entries = store.load()?;
        let outcome = match entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => {
                if entry.local_file.is_none() {
                    entry.local_file = existing.local_file.take();
                }
                *existing = entry;
                Upsert::Replaced
            }
            None => {
                entries.push(entry);
                Upsert::Inserted
            }
        };
        store.save(&entries)?;
        debug!(path = %store.path().display(), ?outcome, "catalog updated");
        Ok(outcome)
    }

    /// Links a downloaded file to its entry. Returns `false` when no entry has
    /// that id.
    pub fn record_local_file(&self, id: &str, filename: &str) -> Result<bool> {
        let store = self.store.lock();
        let mut entries = store.load()?;
        let Some(entry) = entries.iter_mut().find(|entry| entry.id == id) else {
            return Ok(false);
        };
        if entry.local_file.as_deref() == Some(filename) {
            return Ok(true);
        }
        entry.local_file = Some(filename.to_string());
        store.save(&entries)?;
        Ok(true)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
