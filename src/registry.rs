//! Persistent list of known spreadsheets.
//!
//! The registry is a small JSON document holding the user's spreadsheets and
//! preferred output directory. Defaults are applied once at load time, and
//! every mutation is written back atomically. It is only touched from the
//! command layer, never from inside export jobs.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::default_output_dir;
use crate::error::{AppError, Result};
use crate::sheet_id::extract_sheet_id;

/// A spreadsheet the user has registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadsheetRef {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub name: String,
}

impl SpreadsheetRef {
    /// Builds an entry from a URL or bare id, deriving the id.
    pub fn from_url(url: &str, name: &str) -> Result<Self> {
        let id = extract_sheet_id(url)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::InvalidArgument(format!("not a spreadsheet URL: {}", url)))?;
        Ok(Self {
            id,
            url: url.to_string(),
            name: name.to_string(),
        })
    }

    /// Name to show the user; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// On-disk shape of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryDocument {
    pub recent_sheets: Vec<SpreadsheetRef>,
    pub output_dir: PathBuf,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            recent_sheets: Vec::new(),
            output_dir: default_output_dir().unwrap_or_default(),
        }
    }
}

/// File-backed registry of spreadsheets.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    document: RegistryDocument,
}

impl Registry {
    /// Loads the registry, substituting defaults for anything missing.
    ///
    /// A missing file is not an error. A malformed one is logged and
    /// replaced by defaults on the next save.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let document = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("registry {:?} is unreadable, starting fresh: {}", path, e);
                RegistryDocument::default()
            }),
            Err(_) => {
                debug!("no registry at {:?}", path);
                RegistryDocument::default()
            }
        };
        Self { path, document }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[SpreadsheetRef] {
        &self.document.recent_sheets
    }

    pub fn find(&self, id: &str) -> Option<&SpreadsheetRef> {
        self.document.recent_sheets.iter().find(|s| s.id == id)
    }

    pub fn output_dir(&self) -> &Path {
        &self.document.output_dir
    }

    /// Adds a spreadsheet by URL or id.
    ///
    /// Returns `false` without saving if an entry with the same id exists.
    pub fn add(&mut self, url: &str, name: &str) -> Result<bool> {
        let entry = SpreadsheetRef::from_url(url, name)?;
        if self.find(&entry.id).is_some() {
            debug!("spreadsheet {} already registered", entry.id);
            return Ok(false);
        }

        info!("registering spreadsheet {}", entry.id);
        self.document.recent_sheets.push(entry);
        self.save()?;
        Ok(true)
    }

    /// Edits an entry's URL and/or name, re-deriving its id from the URL.
    ///
    /// # Errors
    /// * [`AppError::NotFound`] if `id` is not registered
    /// * [`AppError::InvalidArgument`] if the new URL is not a spreadsheet URL
    ///   or its id belongs to a different entry
    pub fn edit(&mut self, id: &str, url: Option<&str>, name: Option<&str>) -> Result<SpreadsheetRef> {
        let index = self.index_of(id)?;
        let current = &self.document.recent_sheets[index];
        let updated = SpreadsheetRef::from_url(
            url.unwrap_or(&current.url),
            name.unwrap_or(&current.name),
        )?;

        if updated.id != id && self.find(&updated.id).is_some() {
            return Err(AppError::InvalidArgument(format!(
                "spreadsheet {} is already registered",
                updated.id
            )));
        }

        self.document.recent_sheets[index] = updated.clone();
        self.save()?;
        Ok(updated)
    }

    pub fn remove(&mut self, id: &str) -> Result<SpreadsheetRef> {
        let index = self.index_of(id)?;
        let removed = self.document.recent_sheets.remove(index);
        self.save()?;
        Ok(removed)
    }

    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        self.document.output_dir = dir.into();
        self.save()
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.document
            .recent_sheets
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| AppError::NotFound(format!("{} is not registered", id)))
    }

    fn save(&self) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let mut file = tempfile::NamedTempFile::new_in(&parent)?;
        file.write_all(serde_json::to_string_pretty(&self.document)?.as_bytes())?;
        file.persist(&self.path).map_err(|e| AppError::Io(e.error))?;
        Ok(())
    }
}
