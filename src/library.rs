#![forbid(unsafe_code)]

//! Finds the local media file that belongs to a catalog entry.

use std::path::{Component, Path};

use crate::{catalog::VideoEntry, downloads::MEDIA_EXTENSION};

/// True when `name` is exactly one normal path component, so joining it onto
/// a directory cannot leave that directory.
pub fn is_single_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

/// Prefers the filename recorded on the entry; entries downloaded before that
/// field existed are matched by scanning the videos directory.
pub async fn locate_media(videos_dir: &Path, entry: &VideoEntry) -> Option<String> {
    if let Some(recorded) = entry.local_file.as_deref()
        && tokio::fs::try_exists(videos_dir.join(recorded))
            .await
            .unwrap_or(false)
    {
        return Some(recorded.to_string());
    }
    find_local_file(videos_dir, &entry.id).await
}

/// Returns an `.mp4` whose name contains `id`. Names ending in exactly
/// `_<id>.mp4` win over other matches; ties go to the first in sorted order.
pub async fn find_local_file(videos_dir: &Path, id: &str) -> Option<String> {
    if id.is_empty() {
        return None;
    }
    let mut entries = tokio::fs::read_dir(videos_dir).await.ok()?;
    let suffix = format!(".{MEDIA_EXTENSION}");
    let exact = format!("_{id}{suffix}");
    let mut exact_matches = Vec::new();
    let mut candidates = Vec::new();

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.ends_with(&exact) {
            exact_matches.push(name);
        } else if name.contains(id) && name.ends_with(&suffix) {
            candidates.push(name);
        }
    }

    let pool = if exact_matches.is_empty() {
        candidates
    } else {
        exact_matches
    };
    pool.into_iter().min()
}
