/// Batch export of Google Sheets into local Excel workbooks.
///
/// This library resolves spreadsheet ids from URLs, authenticates against
/// the Google Sheets API, and exports many spreadsheets concurrently, one
/// `.xlsx` file per spreadsheet, tolerating failures of individual exports.
///
/// # Architecture
///
/// The application is structured into several key components:
/// - `extract_sheet_id`: URL to spreadsheet id normalization
/// - `InstalledAppFlow` / `AuthContext`: credential resolution, done once per batch
/// - `SheetsClient`: Google Sheets API access behind the `SpreadsheetSource` trait
/// - `WorkbookWriter`: worksheet grids to `.xlsx` files
/// - `Exporter`: concurrent fan-out of export jobs and result collection
/// - `Registry`: the user's saved spreadsheets and output directory
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use gsheet_export::{AuthContext, Config, Exporter, InstalledAppFlow, SheetsClient};
///
/// async fn example() -> gsheet_export::error::Result<()> {
///     let config = Config::default();
///     let flow = InstalledAppFlow::new(&config.credentials_path, &config.token_path);
///     let auth = AuthContext::obtain(&flow).await?;
///     let client = SheetsClient::new(auth, &config)?;
///     let exporter = Exporter::new(Arc::new(client), config);
///     let ids = vec!["1BxiMVs0XRA5nFMdKvBdBZjgmUUqptlbs74OgvE2upms".to_string()];
///     let result = exporter.run_batch(&ids, None).await?;
///     println!("{} exported", result.succeeded_count());
///     Ok(())
/// }
/// ```
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod exporter;
pub mod progress;
pub mod registry;
pub mod sheet;
pub mod sheet_id;
pub mod workbook;

#[cfg(test)]
mod test_support;

// Re-export commonly used items
pub use auth::{AuthContext, Credential, CredentialProvider, InstalledAppFlow};
pub use config::Config;
pub use error::AppError;
pub use exporter::{BatchResult, ExportJob, Exporter, JobOutcome};
pub use progress::ExportProgress;
pub use registry::{Registry, SpreadsheetRef};
pub use sheet::{CellValue, SheetsClient, SpreadsheetSource};
pub use sheet_id::extract_sheet_id;
pub use workbook::{WorkbookWriter, WorksheetInput};
