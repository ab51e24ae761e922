#![forbid(unsafe_code)]

//! Download orchestration: quality tiers, output naming and deduplication of
//! concurrent requests for the same file.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::{
    catalog::Catalog,
    library::is_single_segment,
    ytdlp::{ExtractError, Extractor},
};

pub const DEFAULT_QUALITY: &str = "720";
pub const MEDIA_EXTENSION: &str = "mp4";

const MSG_DOWNLOADED: &str = "Video downloaded successfully";
const MSG_ALREADY_DOWNLOADED: &str = "Video already downloaded";

/// Height cap requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    P144,
    P360,
    P480,
    P720,
    P1080,
    Best,
}

impl Quality {
    /// Unknown values select [`Quality::Best`].
    pub fn parse(value: &str) -> Self {
        value
            .trim()
            .trim_end_matches(['p', 'P'])
            .parse()
            .map_or(Self::Best, Self::from_height)
    }

    pub fn from_height(height: u64) -> Self {
        match height {
            144 => Self::P144,
            360 => Self::P360,
            480 => Self::P480,
            720 => Self::P720,
            1080 => Self::P1080,
            _ => Self::Best,
        }
    }

    /// The yt-dlp `--format` expression for this tier.
    pub fn format_selector(self) -> &'static str {
        match self {
            Self::P144 => "bestvideo[height<=144]+bestaudio/best[height<=144]",
            Self::P360 => "bestvideo[height<=360]+bestaudio/best[height<=360]",
            Self::P480 => "bestvideo[height<=480]+bestaudio/best[height<=480]",
            Self::P720 => "bestvideo[height<=720]+bestaudio/best[height<=720]",
            Self::P1080 => "bestvideo[height<=1080]+bestaudio/best[height<=1080]",
            Self::Best => "bestvideo+bestaudio/best",
        }
    }
}

/// `<title>_<id>.mp4` with every character of the title except alphanumerics,
/// spaces, `-` and `_` removed and trailing whitespace trimmed.
pub fn media_filename(title: Option<&str>, id: &str) -> String {
    let safe_title: String = title
        .unwrap_or("video")
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    format!("{}_{id}.{MEDIA_EXTENSION}", safe_title.trim_end())
}

/// What `/download/mp4` reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl DownloadOutcome {
    fn completed(filename: String, message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            filename: Some(filename),
        }
    }

    fn failed(err: &ExtractError) -> Self {
        Self {
            success: false,
            message: format!("Download failed: {err}"),
            filename: None,
        }
    }
}

/// Runs downloads and links finished files to the catalog. Cloning is cheap;
/// clones share the in-flight registry.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

struct DownloaderInner {
    extractor: Arc<dyn Extractor>,
    catalog: Arc<Catalog>,
    videos_dir: PathBuf,
    in_flight: InFlight,
}

/// A resolved request waiting for its destination slot.
struct Job {
    url: String,
    id: String,
    filename: String,
    selector: &'static str,
}

impl Downloader {
    pub fn new(extractor: Arc<dyn Extractor>, catalog: Arc<Catalog>, videos_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(DownloaderInner {
                extractor,
                catalog,
                videos_dir,
                in_flight: InFlight::default(),
            }),
        }
    }

    pub fn videos_dir(&self) -> &Path {
        &self.inner.videos_dir
    }

    pub async fn download(&self, url: &str, quality: Quality) -> DownloadOutcome {
        match self.try_download(url, quality).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(url, "download failed: {err}");
                DownloadOutcome::failed(&err)
            }
        }
    }

    async fn try_download(
        &self,
        url: &str,
        quality: Quality,
    ) -> Result<DownloadOutcome, ExtractError> {
        let extractor = self.inner.extractor.clone();
        let owned_url = url.to_string();
        let info = tokio::task::spawn_blocking(move || extractor.resolve(&owned_url))
            .await
            .map_err(|err| ExtractError::Failed(format!("metadata task aborted: {err}")))??;

        let filename = media_filename(info.title.as_deref(), &info.id);
        if !is_single_segment(&filename) {
            return Err(ExtractError::InvalidOutput(format!(
                "video id {:?} cannot be used as a filename",
                info.id
            )));
        }
        let job = Job {
            url: url.to_string(),
            id: info.id,
            filename,
            selector: quality.format_selector(),
        };

        // The slot is taken inside a detached task so that a caller giving up
        // does not release it while yt-dlp is still writing the file.
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(job).await })
            .await
            .map_err(|err| ExtractError::Failed(format!("download task aborted: {err}")))?
    }
}

impl DownloaderInner {
    async fn run(&self, job: Job) -> Result<DownloadOutcome, ExtractError> {
        let path = self.videos_dir.join(&job.filename);
        // Concurrent requests for the same file queue here; whoever comes
        // second finds the finished file below.
        let _slot = self.in_flight.enter(&path).await;

        if tokio::fs::try_exists(&path).await? {
            self.link_to_catalog(&job.id, &job.filename).await;
            return Ok(DownloadOutcome::completed(job.filename, MSG_ALREADY_DOWNLOADED));
        }

        tokio::fs::create_dir_all(&self.videos_dir).await?;
        info!(
            url = %job.url,
            id = %job.id,
            selector = job.selector,
            file = %job.filename,
            "downloading"
        );

        let extractor = self.extractor.clone();
        let url = job.url.clone();
        let selector = job.selector;
        tokio::task::spawn_blocking(move || extractor.download(&url, selector, &path))
            .await
            .map_err(|err| ExtractError::Failed(format!("download task aborted: {err}")))??;

        self.link_to_catalog(&job.id, &job.filename).await;
        info!(id = %job.id, file = %job.filename, "download finished");
        Ok(DownloadOutcome::completed(job.filename, MSG_DOWNLOADED))
    }

    async fn link_to_catalog(&self, id: &str, filename: &str) {
        let catalog = self.catalog.clone();
        let id_owned = id.to_string();
        let filename_owned = filename.to_string();
        let result = tokio::task::spawn_blocking(move || {
            catalog.record_local_file(&id_owned, &filename_owned)
        })
        .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(id, "could not record downloaded file: {err:#}"),
            Err(err) => warn!(id, "could not record downloaded file: {err}"),
        }
    }
}

/// Per-destination locks for downloads currently running.
#[derive(Default)]
struct InFlight {
    slots: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl InFlight {
    async fn enter(&self, path: &Path) -> InFlightGuard<'_> {
        let slot = self
            .slots
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        let guard = slot.clone().lock_owned().await;
        InFlightGuard {
            registry: self,
            path: path.to_path_buf(),
            slot,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

struct InFlightGuard<'a> {
    registry: &'a InFlight,
    path: PathBuf,
    slot: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.registry.slots.lock();
        // Only the registry and this guard still hold the slot: nobody waits.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::VideoEntry;
    use crate::ytdlp::VideoInfo;
    use std::{
        fs,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeExtractor {
        resolves: AtomicUsize,
        downloads: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        fail_download: bool,
        delay: Option<Duration>,
    }

    impl Extractor for FakeExtractor {
        fn resolve(&self, url: &str) -> Result<VideoInfo, ExtractError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            if url.contains("unsupported") {
                return Err(ExtractError::UnsupportedSource(format!("Unsupported URL: {url}")));
            }
            Ok(VideoInfo {
                id: "abc123".into(),
                title: Some("My: Video!".into()),
                thumbnail: None,
                duration: None,
            })
        }

        fn download(
            &self,
            _url: &str,
            format: &str,
            destination: &Path,
        ) -> Result<(), ExtractError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail_download {
                return Err(ExtractError::FormatUnavailable(format.to_string()));
            }
            fs::write(destination, format)?;
            Ok(())
        }
    }

    fn downloader(
        dir: &Path,
        extractor: Arc<FakeExtractor>,
    ) -> (Downloader, Arc<Catalog>) {
        let catalog = Arc::new(Catalog::open(dir.join("data.json")));
        (
            Downloader::new(extractor, catalog.clone(), dir.join("videos")),
            catalog,
        )
    }

    #[test]
    fn filename_strips_punctuation_and_trailing_space() {
        assert_eq!(
            media_filename(Some("My: Video!"), "abc123"),
            "My Video_abc123.mp4"
        );
        assert_eq!(media_filename(None, "x"), "video_x.mp4");
        assert_eq!(
            media_filename(Some("a/b\\c - d_e   "), "id"),
            "abc - d_e_id.mp4"
        );
    }

    #[test]
    fn quality_maps_to_height_capped_selector() {
        assert_eq!(
            Quality::parse("1080").format_selector(),
            "bestvideo[height<=1080]+bestaudio/best[height<=1080]"
        );
        assert_eq!(Quality::parse("480p"), Quality::P480);
        assert_eq!(Quality::parse(DEFAULT_QUALITY), Quality::P720);
        assert_eq!(
            Quality::parse("4k").format_selector(),
            "bestvideo+bestaudio/best"
        );
        assert_eq!(Quality::parse(""), Quality::Best);
        assert_eq!(Quality::from_height(360), Quality::P360);
        assert_eq!(Quality::from_height(721), Quality::Best);
    }

    #[tokio::test]
    async fn second_download_short_circuits() {
        let dir = tempdir().unwrap();
        let extractor = Arc::new(FakeExtractor::default());
        let (downloader, _) = downloader(dir.path(), extractor.clone());

        let first = downloader
            .download("https://example.test/v", Quality::P1080)
            .await;
        assert!(first.success);
        assert_eq!(first.message, MSG_DOWNLOADED);
        assert_eq!(first.filename.as_deref(), Some("My Video_abc123.mp4"));
        let written = fs::read_to_string(dir.path().join("videos/My Video_abc123.mp4")).unwrap();
        assert_eq!(written, Quality::P1080.format_selector());

        let second = downloader
            .download("https://example.test/v", Quality::P1080)
            .await;
        assert!(second.success);
        assert_eq!(second.message, MSG_ALREADY_DOWNLOADED);
        assert_eq!(extractor.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.resolves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_download() {
        let dir = tempdir().unwrap();
        let extractor = Arc::new(FakeExtractor {
            delay: Some(Duration::from_millis(200)),
            ..FakeExtractor::default()
        });
        let (downloader, _) = downloader(dir.path(), extractor.clone());

        let (a, b) = tokio::join!(
            downloader.download("https://example.test/v", Quality::P720),
            downloader.download("https://example.test/v", Quality::P720),
        );
        assert!(a.success && b.success);
        assert_eq!(extractor.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.max_active.load(Ordering::SeqCst), 1);
        let mut messages = vec![a.message, b.message];
        messages.sort();
        assert_eq!(messages, vec![MSG_ALREADY_DOWNLOADED, MSG_DOWNLOADED]);
        assert_eq!(downloader.inner.in_flight.len(), 0);
    }

    fn listed_entry() -> VideoEntry {
        VideoEntry {
            id: "abc123".into(),
            title: Some("My: Video!".into()),
            thumbnail: None,
            thumbnail_local: None,
            url: "https://example.test/v".into(),
            duration: None,
            local_file: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_request_keeps_its_slot_until_the_download_ends() {
        let dir = tempdir().unwrap();
        let extractor = Arc::new(FakeExtractor {
            delay: Some(Duration::from_millis(600)),
            ..FakeExtractor::default()
        });
        let (downloader, catalog) = downloader(dir.path(), extractor.clone());
        catalog.upsert(listed_entry()).unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            downloader.download("https://example.test/v", Quality::P720),
        )
        .await;
        assert!(abandoned.is_err());

        let retry = downloader
            .download("https://example.test/v", Quality::P720)
            .await;
        assert!(retry.success);
        assert_eq!(retry.message, MSG_ALREADY_DOWNLOADED);
        assert_eq!(extractor.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.max_active.load(Ordering::SeqCst), 1);
        let entry = catalog.get("abc123").unwrap().unwrap();
        assert_eq!(entry.local_file.as_deref(), Some("My Video_abc123.mp4"));
        assert_eq!(downloader.inner.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn completed_download_is_linked_to_entry() {
        let dir = tempdir().unwrap();
        let (downloader, catalog) = downloader(dir.path(), Arc::new(FakeExtractor::default()));
        catalog.upsert(listed_entry()).unwrap();

        downloader
            .download("https://example.test/v", Quality::Best)
            .await;
        let entry = catalog.get("abc123").unwrap().unwrap();
        assert_eq!(entry.local_file.as_deref(), Some("My Video_abc123.mp4"));
    }

    #[tokio::test]
    async fn resolution_failure_is_reported() {
        let dir = tempdir().unwrap();
        let extractor = Arc::new(FakeExtractor::default());
        let (downloader, _) = downloader(dir.path(), extractor.clone());

        let outcome = downloader
            .download("https://unsupported.test/v", Quality::P720)
            .await;
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("Download failed: unsupported source"));
        assert_eq!(outcome.filename, None);
        assert_eq!(extractor.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn download_failure_leaves_no_registry_slot() {
        let dir = tempdir().unwrap();
        let extractor = Arc::new(FakeExtractor {
            fail_download: true,
            ..FakeExtractor::default()
        });
        let (downloader, _) = downloader(dir.path(), extractor);

        let outcome = downloader
            .download("https://example.test/v", Quality::P144)
            .await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("format is not available"));
        assert_eq!(downloader.inner.in_flight.len(), 0);
    }

    #[test]
    fn outcome_omits_missing_filename() {
        let json = serde_json::to_value(DownloadOutcome::failed(&ExtractError::Failed(
            "boom".into(),
        )))
        .unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Download failed: extractor failed: boom");
        assert!(json.get("filename").is_none());
    }
}
