//! Command-line interface definition and the export command's helpers.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::exporter::{BatchResult, JobOutcome};
use crate::registry::Registry;
use crate::sheet_id::extract_sheet_id;

/// gsheet-export - Export Google Sheets to Excel workbooks
#[derive(Debug, Parser)]
#[command(name = "gsheet-export")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a JSON settings file
    #[arg(long, env = "GSHEET_EXPORT_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Export spreadsheets to .xlsx files, one file per spreadsheet
    Export(ExportArgs),

    /// Manage the list of saved spreadsheets
    Sheets {
        #[command(subcommand)]
        action: SheetsAction,
    },

    /// Manage Google credentials
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Debug, clap::Args)]
pub struct ExportArgs {
    /// Spreadsheet ids or URLs
    #[arg(required_unless_present = "all")]
    pub sheets: Vec<String>,

    /// Export every saved spreadsheet
    #[arg(long, conflicts_with = "sheets")]
    pub all: bool,

    /// Directory for the .xlsx files (defaults to the saved output directory)
    #[arg(long, short = 'o')]
    pub output_dir: Option<PathBuf>,

    /// Fail exports still running after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Maximum number of spreadsheets exported at once
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Never open a browser; fail if no usable token is cached
    #[arg(long)]
    pub no_browser: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct CredentialArgs {
    /// OAuth client secret file
    #[arg(long, env = "GSHEET_EXPORT_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Cached token file
    #[arg(long, env = "GSHEET_EXPORT_TOKEN")]
    pub token: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum SheetsAction {
    /// List saved spreadsheets
    List,

    /// Save a spreadsheet URL or id
    Add {
        url: String,

        /// Display name
        #[arg(long, default_value = "")]
        name: String,
    },

    /// Change a saved spreadsheet's URL or name
    Edit {
        id: String,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        name: Option<String>,
    },

    /// Forget a saved spreadsheet
    Remove { id: String },

    /// Set the default output directory
    OutputDir { dir: PathBuf },
}

#[derive(Debug, Subcommand)]
pub enum AuthAction {
    /// Show whether credentials and a cached token are present
    Status {
        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Run the browser consent flow and cache the token
    Login {
        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Delete the cached token
    Logout {
        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Install an OAuth client secret file downloaded from Google Cloud Console
    Import {
        file: PathBuf,

        #[command(flatten)]
        credentials: CredentialArgs,
    },
}

/// Resolves ids or URLs, dropping repeats but keeping first-seen order.
///
/// # Errors
/// Returns [`AppError::InvalidArgument`] for any argument without an id.
pub fn resolve_ids(inputs: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(inputs.len());
    for input in inputs {
        let id = extract_sheet_id(input.trim())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AppError::InvalidArgument(format!("cannot find a spreadsheet id in {}", input))
            })?;
        if seen.insert(id.clone()) {
            ids.push(id);
        } else {
            warn!("ignoring repeated spreadsheet {}", id);
        }
    }
    Ok(ids)
}

/// Ids to export: every registry entry with `--all`, else the arguments.
///
/// # Errors
/// * [`AppError::InvalidArgument`] if an argument has no id, or nothing is
///   left to export
pub fn export_ids(args: &ExportArgs, registry: &Registry) -> Result<Vec<String>> {
    let ids = if args.all {
        registry
            .entries()
            .iter()
            .map(|entry| entry.id.clone())
            .collect()
    } else {
        resolve_ids(&args.sheets)?
    };
    if ids.is_empty() {
        return Err(AppError::InvalidArgument(
            "no spreadsheets to export; add some with `gsheet-export sheets add`".to_string(),
        ));
    }
    Ok(ids)
}

/// Output directory for an export: `--output-dir`, then the settings file,
/// then the registry. `None` leaves the choice to the exporter.
pub fn export_output_dir(
    requested: Option<PathBuf>,
    config: &Config,
    registry: &Registry,
) -> Option<PathBuf> {
    requested
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(|| config.output_dir.clone())
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(|| Some(registry.output_dir().to_path_buf()))
        .filter(|dir| !dir.as_os_str().is_empty())
}

/// Prints `id -> path` per export and the `N succeeded, M failed` summary to
/// `out`, and `id: message` per failure to `err`.
pub fn write_report(
    result: &BatchResult,
    out: &mut impl Write,
    err: &mut impl Write,
) -> io::Result<()> {
    for job in &result.jobs {
        if let JobOutcome::Succeeded(path) = &job.outcome {
            writeln!(out, "{} -> {}", job.spreadsheet_id, path.display())?;
        }
    }
    let succeeded = result.succeeded_count();
    writeln!(
        out,
        "{} succeeded, {} failed",
        succeeded,
        result.jobs.len() - succeeded
    )?;
    for job in result.failed_jobs() {
        writeln!(
            err,
            "{}: {}",
            job.spreadsheet_id,
            job.error_message().unwrap_or("unknown error")
        )?;
    }
    Ok(())
}

/// Process exit status for a finished batch.
pub fn exit_code(result: &BatchResult) -> ExitCode {
    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
