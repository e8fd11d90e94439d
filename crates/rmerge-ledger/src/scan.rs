//! Filesystem scanning for downloaded assets.
//!
//! Downloads are laid out as `<root>/<account>/<folder>/<file>`, where the
//! folder is usually a date (`2024-05-01` or `20240501`) and the file stem
//! ends with the asset identifier, optionally prefixed by a capture
//! timestamp (`2024-05-01_10-00-00_UTC_<id>.mp4`).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use rmerge_models::asset::{validate_account, validate_identifier};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};

/// File extensions recognized as video assets.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "webm", "m4v"];

static IDENTIFIER_RE: OnceLock<Regex> = OnceLock::new();

fn identifier_regex() -> &'static Regex {
    IDENTIFIER_RE.get_or_init(|| {
        Regex::new(
            r"^(?:\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}(?:_UTC)?_)?(?P<id>[A-Za-z0-9_-]+)$",
        )
        .expect("identifier regex is valid")
    })
}

/// Extract an asset identifier from a file stem.
pub fn identifier_from_stem(stem: &str) -> Option<String> {
    let id = identifier_regex().captures(stem)?.name("id")?.as_str();
    validate_identifier(id).ok()?;
    Some(id.to_string())
}

/// Parse the date a folder name starts with, if any.
pub fn folder_date(folder: &str) -> Option<NaiveDate> {
    if let Some(date) = folder
        .get(..10)
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    {
        return Some(date);
    }
    folder
        .get(..8)
        .filter(|s| s.chars().all(|c| c.is_ascii_digit()))
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y%m%d").ok())
}

/// Which part of the download history a reconciliation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    /// Folders (or files) within the configured recent window
    #[default]
    Recent,
    /// Everything under the account directory
    Full,
}

/// One asset file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedAsset {
    pub identifier: String,
    pub path: PathBuf,
    /// Folder relative to the account directory, empty for top-level files
    pub source_folder: String,
    pub modified: DateTime<Utc>,
}

/// Scans account download directories for asset files.
#[derive(Debug, Clone)]
pub struct AssetScanner {
    downloads_root: PathBuf,
    recent_days: u32,
}

impl AssetScanner {
    pub fn new(downloads_root: impl Into<PathBuf>, recent_days: u32) -> Self {
        Self {
            downloads_root: downloads_root.into(),
            recent_days,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(&config.downloads_root, config.sync_recent_days)
    }

    pub fn downloads_root(&self) -> &Path {
        &self.downloads_root
    }

    /// Directory holding an account's downloads.
    pub fn account_dir(&self, account: &str) -> LedgerResult<PathBuf> {
        validate_account(account)?;
        Ok(self.downloads_root.join(account))
    }

    /// Folder of `path` relative to the account directory.
    pub fn source_folder_of(&self, account: &str, path: &Path) -> Option<String> {
        let dir = self.account_dir(account).ok()?;
        let relative = path.strip_prefix(&dir).ok()?;
        let parent = relative.parent()?;
        Some(parent.to_string_lossy().into_owned())
    }

    /// Scan an account directory.
    ///
    /// A missing account directory yields no assets. Results are ordered by
    /// path.
    pub fn scan(
        &self,
        account: &str,
        scope: SyncScope,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<ScannedAsset>> {
        let dir = self.account_dir(account)?;
        if !dir.is_dir() {
            debug!(account = account, "No download directory at {}", dir.display());
            return Ok(Vec::new());
        }

        let cutoff = now - Duration::days(i64::from(self.recent_days));
        let mut assets = Vec::new();

        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry.file_name()));

        for entry in walker {
            let entry = entry.map_err(|e| LedgerError::scan(e.to_string()))?;
            if !entry.file_type().is_file() || !is_video(entry.path()) {
                continue;
            }

            let Some(identifier) = entry
                .path()
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(identifier_from_stem)
            else {
                continue;
            };

            let source_folder = if entry.depth() == 2 {
                entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            } else {
                String::new()
            };

            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or(now);

            if scope == SyncScope::Recent {
                let recent = match folder_date(&source_folder) {
                    Some(date) => date >= cutoff.date_naive(),
                    None => modified >= cutoff,
                };
                if !recent {
                    continue;
                }
            }

            assets.push(ScannedAsset {
                identifier,
                path: entry.into_path(),
                source_folder,
                modified,
            });
        }

        Ok(assets)
    }

    /// Find the file for an identifier anywhere in the account's history.
    pub fn find(&self, account: &str, identifier: &str) -> LedgerResult<Option<ScannedAsset>> {
        Ok(self
            .scan(account, SyncScope::Full, Utc::now())?
            .into_iter()
            .find(|asset| asset.identifier == identifier))
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
