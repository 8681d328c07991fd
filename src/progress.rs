//! Progress tracking and reporting for export batches.
//!
//! Tracks completion counts and elapsed time, logs a line per finished job,
//! and can append the batch's failures to a CSV report.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

/// File name of the failure report written into the output directory.
pub const FAILURE_REPORT_FILE: &str = "failed_exports.csv";

/// Tracks and reports progress for one export batch.
///
/// # Examples
///
/// ```
/// use gsheet_export::ExportProgress;
///
/// let mut progress = ExportProgress::new(2);
/// progress.record_success();
/// progress.record_failure("B", "Spreadsheet not found: B".to_string());
/// assert_eq!(progress.succeeded(), 1);
/// assert!(progress.is_done());
/// ```
pub struct ExportProgress {
    pub total_jobs: usize,
    pub completed: usize,
    pub errors: usize,
    pub start_time: Instant,
    failures: Vec<(String, String)>, // (spreadsheet id, error message)
}

impl ExportProgress {
    pub fn new(total_jobs: usize) -> Self {
        Self {
            total_jobs,
            completed: 0,
            errors: 0,
            start_time: Instant::now(),
            failures: Vec::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.completed += 1;
        self.log_progress();
    }

    pub fn record_failure(&mut self, spreadsheet_id: &str, error: String) {
        self.completed += 1;
        self.errors += 1;
        self.failures.push((spreadsheet_id.to_string(), error));
        self.log_progress();
    }

    pub fn succeeded(&self) -> usize {
        self.completed - self.errors
    }

    pub fn is_done(&self) -> bool {
        self.completed >= self.total_jobs
    }

    pub fn failures(&self) -> &[(String, String)] {
        &self.failures
    }

    /// Projects the remaining time from the average time per finished job.
    pub fn estimated_remaining(&self) -> Duration {
        if self.completed == 0 {
            return Duration::ZERO;
        }
        let per_job = self.start_time.elapsed().div_f64(self.completed as f64);
        per_job.mul_f64(self.total_jobs.saturating_sub(self.completed) as f64)
    }

    fn log_progress(&self) {
        info!(
            "progress: {}/{} exports finished ({} ok, {} failed), {:.1}s elapsed, ~{:.1}s remaining",
            self.completed,
            self.total_jobs,
            self.succeeded(),
            self.errors,
            self.start_time.elapsed().as_secs_f64(),
            self.estimated_remaining().as_secs_f64()
        );
    }

    /// Appends this batch's failures to `failed_exports.csv` in `dir`.
    ///
    /// The header row is only written when the file is created. Returns the
    /// report path, or `None` if there was nothing to report.
    pub fn export_failures(&self, dir: &Path) -> csv::Result<Option<PathBuf>> {
        if self.failures.is_empty() {
            return Ok(None);
        }

        let path = dir.join(FAILURE_REPORT_FILE);
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::Writer::from_writer(file);

        if is_new {
            writer.write_record(["timestamp", "spreadsheet_id", "error"])?;
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        for (id, error) in &self.failures {
            writer.write_record([timestamp.as_str(), id.as_str(), error.as_str()])?;
        }

        writer.flush()?;
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn counts_successes_and_failures() {
        let mut progress = ExportProgress::new(3);
        progress.record_success();
        progress.record_failure("B", "boom".into());
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.succeeded(), 1);
        assert!(!progress.is_done());

        progress.record_success();
        assert!(progress.is_done());
        assert_eq!(progress.failures(), &[("B".to_string(), "boom".to_string())]);
    }

    #[test]
    fn no_failures_writes_no_report() {
        let dir = tempdir().unwrap();
        let mut progress = ExportProgress::new(1);
        progress.record_success();
        assert!(progress.export_failures(dir.path()).unwrap().is_none());
        assert!(!dir.path().join(FAILURE_REPORT_FILE).exists());
    }

    #[test]
    fn report_appends_without_repeating_header() {
        let dir = tempdir().unwrap();
        for id in ["A", "B"] {
            let mut progress = ExportProgress::new(1);
            progress.record_failure(id, format!("failed, {}", id));
            progress.export_failures(dir.path()).unwrap();
        }

        let mut reader = csv::Reader::from_path(dir.path().join(FAILURE_REPORT_FILE)).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "A");
        assert_eq!(&rows[1][2], "failed, B");
    }
}
