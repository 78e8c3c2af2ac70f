//! Durable storage for the OAuth2 token triple.
//!
//! The token file is the only state that survives a restart. Reads fail soft
//! (a missing or corrupt file yields empty credentials), writes fail loud.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ExporterError, Result};

/// Access token, refresh token and absolute expiry (fractional Unix seconds).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<f64>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.expires_at.is_none()
    }
}

/// JSON token file at a fixed path.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the token file. Never fails.
    pub fn load(&self) -> Credentials {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    log::info!(
                        "No existing token file found at {}, will create a new one upon refresh",
                        self.path.display()
                    );
                } else {
                    log::info!(
                        "Token file {} unreadable ({}), will create a new one upon refresh",
                        self.path.display(),
                        e
                    );
                }
                return Credentials::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(credentials) => credentials,
            Err(e) => {
                log::info!(
                    "Token file {} is not valid JSON ({}), will create a new one upon refresh",
                    self.path.display(),
                    e
                );
                Credentials::default()
            }
        }
    }

    /// Atomically replace the token file.
    ///
    /// Writes a sibling temp file with 0600 permissions, then renames it over
    /// the target so a reader never sees a half-written file.
    pub fn save(&self, credentials: &Credentials) -> Result<()> {
        let json = serde_json::to_string_pretty(credentials)
            .map_err(|e| ExporterError::CredentialStore(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.write_error(e))?;
        }

        let tmp_path = self.tmp_path();
        write_private(&tmp_path, json.as_bytes()).map_err(|e| self.write_error(e))?;
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(self.write_error(e));
        }

        log::debug!("Saved tokens to {}", self.path.display());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "token.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_error(&self, e: std::io::Error) -> ExporterError {
        ExporterError::CredentialStore(format!(
            "failed to write token file {}: {}",
            self.path.display(),
            e
        ))
    }
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)?;
    }

    Ok(())
}
