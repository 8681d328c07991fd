//! Configuration management for the exporter.
//!
//! Provides centralized configuration options for controlling:
//! - Concurrent export limits
//! - Credential, token and registry file locations
//! - Sheets API endpoint and request timeout
//! - Failure reporting

use crate::error::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Name of the per-user directory holding credentials and the registry.
pub const APP_DIR_NAME: &str = ".gsheet_downloader";

/// How the Sheets API renders cell values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueRenderOption {
    /// Values as displayed in the browser, always strings.
    FormattedValue,
    /// Raw numbers and booleans.
    #[default]
    UnformattedValue,
    /// Formulas instead of their results.
    Formula,
}

impl ValueRenderOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FormattedValue => "FORMATTED_VALUE",
            Self::UnformattedValue => "UNFORMATTED_VALUE",
            Self::Formula => "FORMULA",
        }
    }
}

/// Configuration for the spreadsheet exporter.
///
/// Every field has a default, so a settings file only needs the keys it
/// overrides.
///
/// # Examples
///
/// ```
/// use gsheet_export::Config;
///
/// let config = Config::default();
/// assert!(config.max_concurrent_exports.is_none());
/// assert!(config.credentials_path.ends_with("credentials.json"));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on simultaneously running export jobs; `None` starts all at once.
    pub max_concurrent_exports: Option<usize>,
    pub output_dir: Option<PathBuf>,
    pub credentials_path: PathBuf,
    pub token_path: PathBuf,
    pub registry_path: PathBuf,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub value_render_option: ValueRenderOption,
    /// Append failed jobs to `failed_exports.csv` in the output directory.
    pub failure_report: bool,
    /// Allow the browser consent flow when no usable token is cached.
    pub interactive_auth: bool,
}

impl Default for Config {
    fn default() -> Self {
        let app_dir = app_data_dir();
        Self {
            max_concurrent_exports: None,
            output_dir: None,
            credentials_path: app_dir.join("credentials.json"),
            token_path: app_dir.join("token.json"),
            registry_path: app_dir.join("sheets.json"),
            api_base_url: String::from("https://sheets.googleapis.com"),
            request_timeout_secs: 30,
            value_render_option: ValueRenderOption::default(),
            failure_report: true,
            interactive_auth: true,
        }
    }
}

impl Config {
    /// Loads settings from a JSON file, falling back to defaults if it is absent.
    ///
    /// # Errors
    /// * If the file exists but cannot be read
    /// * If the file is not valid JSON for [`Config`]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Default location of the settings file.
    pub fn default_path() -> PathBuf {
        app_data_dir().join("settings.json")
    }
}

/// Directory holding credentials, token and registry (`~/.gsheet_downloader`).
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Platform download directory, used when no output directory is configured.
pub fn default_output_dir() -> Option<PathBuf> {
    dirs::download_dir().or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.value_render_option, ValueRenderOption::UnformattedValue);
        assert!(config.failure_report);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"max_concurrent_exports": 4, "value_render_option": "FORMATTED_VALUE"}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_concurrent_exports, Some(4));
        assert_eq!(config.value_render_option.as_str(), "FORMATTED_VALUE");
        assert_eq!(config.api_base_url, "https://sheets.googleapis.com");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
