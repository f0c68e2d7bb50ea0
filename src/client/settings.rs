//! Shared server settings, persisted so that later clients reuse a
//! running server instead of launching another one.
//!
//! Plain `key=value` text:
//!
//! ```text
//! server.uri=http://localhost:41733
//! server.access.token=5f0c...
//! server.client.read.timeout=60
//! server.idle.timeout.minutes=60
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ClientError;

pub const SETTINGS_FILE: &str = "test-resources.properties";
pub const PORT_FILE: &str = "test-resources.port";

const KEY_URI: &str = "server.uri";
const KEY_TOKEN: &str = "server.access.token";
const KEY_READ_TIMEOUT: &str = "server.client.read.timeout";
const KEY_IDLE_TIMEOUT: &str = "server.idle.timeout.minutes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub port: u16,
    pub access_token: Option<String>,
    /// Transport read timeout, whole seconds on disk.
    pub client_read_timeout: Option<Duration>,
    pub idle_timeout_minutes: Option<u32>,
}

impl ServerSettings {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            access_token: None,
            client_read_timeout: None,
            idle_timeout_minutes: None,
        }
    }

    pub fn uri(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(SETTINGS_FILE)
    }

    /// Read the settings file in `dir`. A missing file is `Ok(None)`.
    pub async fn read(dir: &Path) -> Result<Option<Self>, ClientError> {
        let path = Self::path(dir);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Self::parse(&text)
                .map(Some)
                .map_err(|message| ClientError::Settings { path, message }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the settings file in `dir`, replacing any previous one
    /// atomically.
    pub async fn write(&self, dir: &Path) -> Result<(), ClientError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = Self::path(dir);
        let tmp = path.with_extension("properties.tmp");
        tokio::fs::write(&tmp, self.render()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), port = self.port, "settings written");
        Ok(())
    }

    /// Delete the settings file in `dir`. Returns whether one existed.
    pub async fn delete(dir: &Path) -> Result<bool, ClientError> {
        match tokio::fs::remove_file(Self::path(dir)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{KEY_URI}={}", self.uri());
        if let Some(token) = &self.access_token {
            let _ = writeln!(out, "{KEY_TOKEN}={token}");
        }
        if let Some(timeout) = self.client_read_timeout {
            let _ = writeln!(out, "{KEY_READ_TIMEOUT}={}", timeout.as_secs());
        }
        if let Some(minutes) = self.idle_timeout_minutes {
            let _ = writeln!(out, "{KEY_IDLE_TIMEOUT}={minutes}");
        }
        out
    }

    fn parse(text: &str) -> Result<Self, String> {
        let mut port = None;
        let mut settings = Self::new(0);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = split_entry(line) else {
                continue;
            };
            match key.as_str() {
                KEY_URI => port = Some(port_of(&value)?),
                KEY_TOKEN => settings.access_token = Some(value).filter(|v| !v.is_empty()),
                KEY_READ_TIMEOUT => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| format!("{KEY_READ_TIMEOUT}: not a number: {value:?}"))?;
                    settings.client_read_timeout = Some(Duration::from_secs(secs));
                }
                KEY_IDLE_TIMEOUT => {
                    let minutes = value
                        .parse()
                        .map_err(|_| format!("{KEY_IDLE_TIMEOUT}: not a number: {value:?}"))?;
                    settings.idle_timeout_minutes = Some(minutes);
                }
                _ => {}
            }
        }
        settings.port = port.ok_or_else(|| format!("missing {KEY_URI}"))?;
        Ok(settings)
    }
}

/// Split `key=value` (or `key:value`), undoing backslash escapes.
fn split_entry(line: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut chars = line.chars();
    let mut separated = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => key.extend(chars.next()),
            '=' | ':' => {
                separated = true;
                break;
            }
            c => key.push(c),
        }
    }
    if !separated {
        return None;
    }
    let mut value = String::new();
    let mut chars = chars.as_str().trim_start().chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => value.extend(chars.next()),
            c => value.push(c),
        }
    }
    Some((key.trim().to_string(), value.trim_end().to_string()))
}

fn port_of(uri: &str) -> Result<u16, String> {
    let authority = uri
        .split_once("://")
        .map_or(uri, |(_, rest)| rest)
        .split('/')
        .next()
        .unwrap_or_default();
    authority
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| format!("{KEY_URI}: no port in {uri:?}"))
}

/// Default settings directory: `$TESTRESD_SETTINGS_DIR`, else
/// `$HOME/.testresd/shared`.
pub fn default_settings_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("TESTRESD_SETTINGS_DIR").filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|home| PathBuf::from(home).join(".testresd").join("shared"))
}
