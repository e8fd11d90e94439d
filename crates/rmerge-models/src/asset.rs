//! Assets and account/identifier validation.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Maximum length of an account name or asset identifier.
pub const MAX_NAME_LEN: usize = 128;

/// Errors returned by name validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error("empty {0}")]
    Empty(&'static str),

    #[error("{kind} too long ({len} > {MAX_NAME_LEN})")]
    TooLong { kind: &'static str, len: usize },

    #[error("invalid character {ch:?} in {kind}")]
    InvalidChar { kind: &'static str, ch: char },

    #[error("reserved {0} name")]
    Reserved(&'static str),
}

/// A single media file plus its stable per-account identifier.
///
/// Assets are immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Asset {
    /// Shortcode uniquely naming the asset within its account
    pub identifier: String,
    /// Absolute path of the media file
    pub path: PathBuf,
    /// When the asset was first seen
    pub discovered_at: DateTime<Utc>,
    /// Owning account
    pub account: String,
}

impl Asset {
    /// Create a new asset, validating account and identifier.
    pub fn new(
        account: impl Into<String>,
        identifier: impl Into<String>,
        path: impl Into<PathBuf>,
        discovered_at: DateTime<Utc>,
    ) -> Result<Self, AssetError> {
        let account = account.into();
        let identifier = identifier.into();
        validate_account(&account)?;
        validate_identifier(&identifier)?;

        Ok(Self {
            identifier,
            path: path.into(),
            discovered_at,
            account,
        })
    }
}

/// Validate an account name.
///
/// Account names become directory and document names, so only
/// `[A-Za-z0-9._-]` is accepted.
pub fn validate_account(account: &str) -> Result<(), AssetError> {
    validate_name("account", account)
}

/// Validate an asset identifier (shortcode).
pub fn validate_identifier(identifier: &str) -> Result<(), AssetError> {
    validate_name("identifier", identifier)
}

fn validate_name(kind: &'static str, value: &str) -> Result<(), AssetError> {
    if value.is_empty() {
        return Err(AssetError::Empty(kind));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(AssetError::TooLong {
            kind,
            len: value.len(),
        });
    }
    if value == "." || value == ".." {
        return Err(AssetError::Reserved(kind));
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(AssetError::InvalidChar { kind, ch });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_account("some.account_01").is_ok());
        assert!(validate_identifier("CxY-1_aB").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert_eq!(validate_account(""), Err(AssetError::Empty("account")));
        assert_eq!(validate_account(".."), Err(AssetError::Reserved("account")));
        assert!(matches!(
            validate_identifier("a/b"),
            Err(AssetError::InvalidChar { ch: '/', .. })
        ));
        assert!(matches!(
            validate_identifier(&"x".repeat(MAX_NAME_LEN + 1)),
            Err(AssetError::TooLong { .. })
        ));
    }

    #[test]
    fn test_asset_new_validates() {
        let now = Utc::now();
        assert!(Asset::new("acct", "abc", "/tmp/abc.mp4", now).is_ok());
        assert!(Asset::new("acct/..", "abc", "/tmp/abc.mp4", now).is_err());
    }
}
