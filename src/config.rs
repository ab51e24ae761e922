#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATA_ROOT: &str = ".";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_YTDLP: &str = "yt-dlp";

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp: PathBuf,
}

/// Values passed on the command line. They win over the environment and the
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: Overrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_settings(file_vars, |key| env::var(key).ok(), overrides))
}

fn build_settings(
    file_vars: HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: Overrides,
) -> Settings {
    let layers = EnvLayers {
        file: file_vars,
        env: env_lookup,
    };
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| layers.get("VIDSHELF_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    Settings {
        data_root: overrides
            .data_root
            .or_else(|| layers.path("VIDSHELF_DATA_ROOT"))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT)),
        host,
        port: overrides
            .port
            .or_else(|| layers.port("VIDSHELF_PORT"))
            .unwrap_or(DEFAULT_PORT),
        ytdlp: overrides
            .ytdlp
            .or_else(|| layers.path("VIDSHELF_YTDLP"))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP)),
    }
}

/// The process environment over the `.env` file. Blank values count as unset
/// in both layers.
struct EnvLayers<F> {
    file: HashMap<String, String>,
    env: F,
}

impl<F: Fn(&str) -> Option<String>> EnvLayers<F> {
    fn get(&self, key: &str) -> Option<String> {
        let present = |value: &str| {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        };
        (self.env)(key)
            .and_then(|value| present(&value))
            .or_else(|| self.file.get(key).and_then(|value| present(value)))
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }

    /// Unparseable ports are treated as unset.
    fn port(&self, key: &str) -> Option<u16> {
        self.get(key)?.parse().ok()
    }
}

/// Reads `KEY=value` pairs from a dotenv-style file. A missing file yields
/// no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().filter_map(parse_env_line).collect()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Accepts an optional `export ` prefix and single or double quotes. An
/// unquoted value ends at ` #`.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let raw = raw.trim();
    let value = ['"', '\'']
        .iter()
        .find_map(|quote| raw.strip_prefix(*quote)?.strip_suffix(*quote))
        .unwrap_or_else(|| raw.split(" #").next().unwrap_or_default().trim_end());
    Some((key.to_string(), value.to_string()))
}
