#![forbid(unsafe_code)]

//! Thin wrapper around the `yt-dlp` executable.
//!
//! Everything the server needs from the extractor goes through the
//! [`Extractor`] trait: resolving metadata for a URL and downloading a chosen
//! format into a single muxed MP4. Failures are classified from yt-dlp's exit
//! status and stderr so callers can tell a dead network apart from an
//! unsupported site.

use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

use serde::Deserialize;
use serde_json::Number;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
    #[error("requested format is not available: {0}")]
    FormatUnavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected extractor output: {0}")]
    InvalidOutput(String),
    #[error("extractor failed: {0}")]
    Failed(String),
}

/// The subset of `--dump-single-json` output the catalog keeps.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<Number>,
}

pub trait Extractor: Send + Sync {
    /// Fetches metadata for `url` without downloading any media.
    fn resolve(&self, url: &str) -> Result<VideoInfo, ExtractError>;

    /// Downloads `url` using the `format` selector and muxes the result into an
    /// MP4 at `destination`.
    fn download(&self, url: &str, format: &str, destination: &Path) -> Result<(), ExtractError>;
}

pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("--no-warnings").arg("--no-progress");
        command
    }
}

impl Extractor for YtDlp {
    fn resolve(&self, url: &str) -> Result<VideoInfo, ExtractError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--")
            .arg(url);

        debug!(url, "resolving metadata");
        let output = command.output()?;
        ensure_success(&output)?;

        serde_json::from_slice(&output.stdout)
            .map_err(|err| ExtractError::InvalidOutput(err.to_string()))
    }

    fn download(&self, url: &str, format: &str, destination: &Path) -> Result<(), ExtractError> {
        let mut command = self.command();
        command
            .arg("--quiet")
            .arg("--format")
            .arg(format)
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--output")
            .arg(destination)
            .arg("--")
            .arg(url);

        debug!(url, format, destination = %destination.display(), "starting download");
        let output = command.output()?;
        ensure_success(&output)
    }
}

fn ensure_success(output: &Output) -> Result<(), ExtractError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!(status = %output.status, stderr = %stderr.trim(), "yt-dlp failed");
    Err(classify_failure(&stderr, &output.status.to_string()))
}

/// Maps yt-dlp's error text onto [`ExtractError`]. Unknown messages end up in
/// [`ExtractError::Failed`] carrying the last error line.
pub fn classify_failure(stderr: &str, status: &str) -> ExtractError {
    let message = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.strip_prefix("ERROR:").unwrap_or(line).trim().to_string())
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"));
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("unsupported url") || lower.contains("is not a valid url") {
        ExtractError::UnsupportedSource(message)
    } else if lower.contains("requested format is not available")
        || lower.contains("format is not available")
    {
        ExtractError::FormatUnavailable(message)
    } else if [
        "unable to download webpage",
        "urlopen error",
        "timed out",
        "name or service not known",
        "temporary failure in name resolution",
        "connection refused",
        "connection reset",
        "network is unreachable",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        ExtractError::Network(message)
    } else {
        ExtractError::Failed(message)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};
    use tempfile::tempdir;

    fn install_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp");
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn resolve_parses_metadata_json() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"echo '{"id":"abc123","title":"My: Video!","thumbnail":"https://i.test/abc/hq.webp","duration":93,"formats":[]}'"#,
        );

        let info = YtDlp::new(stub).resolve("https://example.test/v").unwrap();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.title.as_deref(), Some("My: Video!"));
        assert_eq!(info.thumbnail.as_deref(), Some("https://i.test/abc/hq.webp"));
        assert_eq!(info.duration, Some(Number::from(93)));
    }

    #[test]
    fn resolve_tolerates_missing_optional_fields() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), r#"echo '{"id":"only-id"}'"#);
        let info = YtDlp::new(stub).resolve("https://example.test/v").unwrap();
        assert_eq!(info.title, None);
        assert_eq!(info.duration, None);
    }

    #[test]
    fn resolve_reports_unsupported_source() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "echo 'ERROR: Unsupported URL: https://nope.test' >&2\nexit 1\n",
        );
        let err = YtDlp::new(stub).resolve("https://nope.test").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedSource(_)), "{err:?}");
        assert!(err.to_string().contains("Unsupported URL"));
    }

    #[test]
    fn resolve_rejects_garbage_output() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "echo 'not json'\n");
        let err = YtDlp::new(stub).resolve("https://example.test/v").unwrap_err();
        assert!(matches!(err, ExtractError::InvalidOutput(_)));
    }

    #[test]
    fn missing_executable_is_io_error() {
        let dir = tempdir().unwrap();
        let err = YtDlp::new(dir.path().join("absent"))
            .resolve("https://example.test/v")
            .unwrap_err();
        assert!(matches!(err, ExtractError::Io(_)));
    }

    #[test]
    fn download_passes_format_and_output() {
        let dir = tempdir().unwrap();
        let args_log = dir.path().join("args.txt");
        let stub = install_stub(
            dir.path(),
            &format!(
                r#"printf '%s\n' "$@" > '{log}'
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf 'mp4' > "$out"
"#,
                log = args_log.display()
            ),
        );

        let destination = dir.path().join("Clip_abc.mp4");
        YtDlp::new(stub)
            .download("https://example.test/v", "bestvideo+bestaudio/best", &destination)
            .unwrap();

        assert_eq!(fs::read(&destination).unwrap(), b"mp4");
        let args = fs::read_to_string(&args_log).unwrap();
        let args: Vec<&str> = args.lines().collect();
        let format_pos = args.iter().position(|arg| *arg == "--format").unwrap();
        assert_eq!(args[format_pos + 1], "bestvideo+bestaudio/best");
        let merge_pos = args
            .iter()
            .position(|arg| *arg == "--merge-output-format")
            .unwrap();
        assert_eq!(args[merge_pos + 1], "mp4");
        assert_eq!(args.last(), Some(&"https://example.test/v"));
    }

    #[test]
    fn classify_failure_recognizes_categories() {
        assert!(matches!(
            classify_failure("ERROR: Requested format is not available", "exit status: 1"),
            ExtractError::FormatUnavailable(_)
        ));
        assert!(matches!(
            classify_failure(
                "ERROR: [youtube] x: Unable to download webpage: <urlopen error timed out>",
                "exit status: 1"
            ),
            ExtractError::Network(_)
        ));
        match classify_failure("", "exit status: 2") {
            ExtractError::Failed(message) => assert!(message.contains("exit status: 2")),
            other => panic!("unexpected {other:?}"),
        }
        match classify_failure("WARNING: a\nERROR: something odd\n", "exit status: 1") {
            ExtractError::Failed(message) => assert_eq!(message, "something odd"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
