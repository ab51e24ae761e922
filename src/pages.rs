#![forbid(unsafe_code)]

//! Server-rendered HTML for the catalog listing and the player page.

use url::Url;

use crate::{catalog::VideoEntry, downloads::DEFAULT_QUALITY};

const QUALITIES: [&str; 5] = ["144", "360", "480", "720", "1080"];

const STYLE: &str = r#"
body { font-family: system-ui, sans-serif; margin: 0 auto; max-width: 960px; padding: 1rem; background: #111; color: #eee; }
a { color: inherit; }
form.add { display: flex; gap: .5rem; margin-bottom: 1.5rem; }
form.add input { flex: 1; padding: .5rem; }
ul.grid { list-style: none; padding: 0; display: grid; grid-template-columns: repeat(auto-fill, minmax(220px, 1fr)); gap: 1rem; }
ul.grid img { width: 100%; aspect-ratio: 16 / 9; object-fit: cover; background: #333; }
.duration { color: #aaa; font-size: .85rem; }
video { width: 100%; background: #000; }
"#;

const DOWNLOAD_SCRIPT: &str = r#"
document.getElementById('download').addEventListener('submit', async (event) => {
  event.preventDefault();
  const form = event.target;
  const status = document.getElementById('status');
  status.textContent = 'Downloading…';
  try {
    const response = await fetch('/download/mp4', {
      method: 'POST',
      headers: { 'Content-Type': 'application/json' },
      body: JSON.stringify({ url: form.dataset.url, quality: form.quality.value }),
    });
    const result = await response.json();
    status.textContent = result.message;
    if (result.success) { window.location.reload(); }
  } catch (err) {
    status.textContent = String(err);
  }
});
"#;

pub fn render_index(entries: &[VideoEntry]) -> String {
    let mut items = String::new();
    for entry in entries {
        let thumb = match entry.thumbnail_local.as_deref() {
            Some(local) => format!(r#"<img src="{}" alt="">"#, escape(&file_href("thumbs", local))),
            None => match entry.thumbnail.as_deref() {
                Some(remote) => format!(r#"<img src="{}" alt="">"#, escape(remote)),
                None => r#"<img alt="">"#.to_string(),
            },
        };
        let duration = entry
            .duration_text()
            .map(|text| format!(r#"<span class="duration">{text}</span>"#))
            .unwrap_or_default();
        items.push_str(&format!(
            r#"<li><a href="{href}">{thumb}<div>{title}</div></a>{duration}</li>"#,
            href = escape(&file_href("video", &entry.id)),
            title = escape(entry.display_title()),
        ));
    }

    let body = format!(
        r#"<h1>vidshelf</h1>
<form class="add" method="post" action="/add">
<input type="url" name="url" placeholder="Video URL" required>
<button type="submit">Add</button>
</form>
<ul class="grid">{items}</ul>"#
    );
    layout("vidshelf", &body)
}

/// `media_file` is the local filename to play, if one was found.
pub fn render_watch(entry: &VideoEntry, media_file: Option<&str>) -> String {
    let player = match media_file {
        Some(file) => format!(
            r#"<video controls preload="metadata" src="{}"></video>"#,
            escape(&file_href("videos", file))
        ),
        None => {
            let options: String = QUALITIES
                .iter()
                .map(|quality| {
                    let selected = if *quality == DEFAULT_QUALITY {
                        " selected"
                    } else {
                        ""
                    };
                    format!(r#"<option value="{quality}"{selected}>{quality}p</option>"#)
                })
                .collect();
            format!(
                r#"<p>This video has not been downloaded yet.</p>
<form id="download" data-url="{url}">
<select name="quality">{options}<option value="best">best</option></select>
<button type="submit">Download MP4</button>
<span id="status"></span>
</form>
<script>{DOWNLOAD_SCRIPT}</script>"#,
                url = escape(&entry.url),
            )
        }
    };
    let duration = entry
        .duration_text()
        .map(|text| format!(r#"<p class="duration">{text}</p>"#))
        .unwrap_or_default();

    let body = format!(
        r#"<p><a href="/">&larr; Back</a></p>
<h1>{title}</h1>
{player}
{duration}
<p><a href="{source}" rel="noreferrer">Source</a></p>"#,
        title = escape(entry.display_title()),
        source = escape(&entry.url),
    );
    layout(entry.display_title(), &body)
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{}</title>
<style>{STYLE}</style>
</head>
<body>
{body}
</body>
</html>
"#,
        escape(title)
    )
}

/// Builds `/<route>/<name>` with `name` percent-encoded as one path segment.
fn file_href(route: &str, name: &str) -> String {
    let Ok(mut url) = Url::parse("http://localhost/") else {
        return format!("/{route}/{name}");
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(route).push(name);
    }
    url.path().to_string()
}

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
