#![forbid(unsafe_code)]

//! Best-effort local caching of remote thumbnails.

use std::{
    fs,
    io::Read,
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};
use url::Url;

use crate::library::is_single_segment;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ThumbnailFetcher {
    dir: PathBuf,
    agent: ureq::Agent,
}

impl ThumbnailFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_timeout(dir, FETCH_TIMEOUT)
    }

    pub fn with_timeout(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    /// Downloads `remote_url` to `<dir>/<id>.<ext>` and returns the filename.
    /// Never fails: any problem is logged and yields `None`.
    pub fn fetch(&self, remote_url: &str, id: &str) -> Option<String> {
        match self.try_fetch(remote_url, id) {
            Ok(filename) => {
                debug!(id, filename = %filename, "thumbnail cached");
                Some(filename)
            }
            Err(err) => {
                warn!(id, url = remote_url, "thumbnail download failed: {err:#}");
                None
            }
        }
    }

    fn try_fetch(&self, remote_url: &str, id: &str) -> Result<String> {
        let filename = format!("{id}{}", thumbnail_extension(remote_url));
        if !is_single_segment(&filename) {
            bail!("refusing to write thumbnail for id {id:?}");
        }

        let response = self
            .agent
            .get(remote_url)
            .call()
            .with_context(|| format!("requesting {remote_url}"))?;
        if response.status() != 200 {
            bail!("unexpected status {}", response.status());
        }
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .context("reading thumbnail body")?;

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(&filename);
        fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
        Ok(filename)
    }
}

/// Picks the local extension by looking for `.webp` or `.png` in the URL path.
/// The query string and fragment are not inspected.
pub fn thumbnail_extension(remote_url: &str) -> &'static str {
    let path = match Url::parse(remote_url) {
        Ok(url) => url.path().to_string(),
        Err(_) => remote_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    if path.contains(".webp") {
        ".webp"
    } else if path.contains(".png") {
        ".png"
    } else {
        ".jpg"
    }
}
