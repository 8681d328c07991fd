use crate::config::{default_output_dir, Config};
use crate::error::{AppError, Result};
use crate::progress::ExportProgress;
use crate::sheet::{SpreadsheetSource, WorksheetData};
use crate::workbook::{sanitize_file_stem, workbook_file_name, WorkbookWriter, WorksheetInput};
use futures::stream::{self, StreamExt};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle state of one export job.
///
/// `Pending -> Running -> {Succeeded, Failed}`; terminal states are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Running,
    Succeeded(PathBuf),
    Failed(String),
}

impl JobOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobOutcome::Succeeded(_) | JobOutcome::Failed(_))
    }
}

/// Export of one spreadsheet into one workbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportJob {
    pub spreadsheet_id: String,
    pub output_dir: PathBuf,
    pub outcome: JobOutcome,
}

impl ExportJob {
    pub fn new(spreadsheet_id: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            output_dir: output_dir.into(),
            outcome: JobOutcome::Pending,
        }
    }

    fn start(&mut self) {
        debug_assert_eq!(self.outcome, JobOutcome::Pending);
        self.outcome = JobOutcome::Running;
    }

    /// Records the job's result. Only the first terminal state sticks.
    pub(crate) fn finish(&mut self, result: &Result<PathBuf>) {
        if self.outcome.is_terminal() {
            return;
        }
        self.outcome = match result {
            Ok(path) => JobOutcome::Succeeded(path.clone()),
            Err(e) => JobOutcome::Failed(e.to_string()),
        };
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            JobOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// Outcome of a batch, with jobs listed in the order their ids were given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub output_dir: PathBuf,
    pub jobs: Vec<ExportJob>,
    /// True iff every job succeeded.
    pub success: bool,
}

impl BatchResult {
    pub(crate) fn new(output_dir: PathBuf, jobs: Vec<ExportJob>) -> Self {
        let success = jobs.iter().all(ExportJob::succeeded);
        Self {
            output_dir,
            jobs,
            success,
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.jobs.iter().filter(|job| job.succeeded()).count()
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &ExportJob> {
        self.jobs.iter().filter(|job| !job.succeeded())
    }

    /// The first failing job in input order.
    pub fn first_failure(&self) -> Option<&ExportJob> {
        self.failed_jobs().next()
    }

    /// Converts an unsuccessful batch into [`AppError::BatchFailed`].
    pub fn into_result(self) -> Result<BatchResult> {
        match self.first_failure() {
            None => Ok(self),
            Some(job) => Err(AppError::BatchFailed {
                failed: self.failed_jobs().count(),
                total: self.jobs.len(),
                first_error: job.error_message().unwrap_or_default().to_string(),
            }),
        }
    }
}

/// Runs export jobs for many spreadsheets concurrently.
///
/// # Fields
/// * `source` - Shared spreadsheet API, authorized once before the batch
/// * `config` - Application configuration settings
/// * `active_jobs` - Counter for currently running jobs
pub struct Exporter {
    source: Arc<dyn SpreadsheetSource>,
    config: Arc<Config>,
    active_jobs: Arc<AtomicUsize>,
}

impl Exporter {
    /// Creates a new `Exporter` over the given spreadsheet source.
    ///
    /// # Arguments
    /// * `source` - Spreadsheet API, already carrying its credential
    /// * `config` - Configuration settings for the exporter
    pub fn new(source: Arc<dyn SpreadsheetSource>, config: Config) -> Self {
        Self {
            source,
            config: Arc::new(config),
            active_jobs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns a reference to the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of jobs currently between start and finish.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    /// Exports every spreadsheet in `ids` into `output_dir`.
    ///
    /// Equivalent to [`Exporter::run_batch_with_deadline`] without a deadline.
    pub async fn run_batch(&self, ids: &[String], output_dir: Option<&Path>) -> Result<BatchResult> {
        self.run_batch_with_deadline(ids, output_dir, None).await
    }

    /// Exports every spreadsheet in `ids`, one concurrent job per id.
    ///
    /// # Arguments
    /// * `ids` - Spreadsheet ids; the result lists jobs in this order
    /// * `output_dir` - Target directory; `None` or empty falls back to the
    ///   configured directory, then the platform download directory
    /// * `deadline` - Jobs still running after this long end as failed
    ///
    /// # Returns
    /// * `Result<BatchResult>` - Per-job outcomes, even when some failed
    ///
    /// # Errors
    /// * [`AppError::Io`] if the output directory cannot be created
    /// * [`AppError::InvalidArgument`] if `ids` is empty or no output
    ///   directory can be determined
    ///
    /// # Details
    /// * Jobs never cancel each other; a failure is recorded on its job
    /// * All jobs reach a terminal state, and every write has stopped,
    ///   before this returns
    /// * Spreadsheets sharing a title get distinct files, `<title> (2).xlsx` etc.
    /// * `Config::max_concurrent_exports` caps how many run at once
    #[instrument(skip(self, ids), fields(jobs = ids.len()))]
    pub async fn run_batch_with_deadline(
        &self,
        ids: &[String],
        output_dir: Option<&Path>,
        deadline: Option<Duration>,
    ) -> Result<BatchResult> {
        let output_dir = self.prepare_output_dir(output_dir).await?;

        if ids.is_empty() {
            return Err(AppError::InvalidArgument(
                "an export batch needs at least one spreadsheet".to_string(),
            ));
        }

        let total_jobs = ids.len();
        info!("exporting {} spreadsheet(s) to {:?}", total_jobs, output_dir);
        let progress = Arc::new(Mutex::new(ExportProgress::new(total_jobs)));
        let claims = Arc::new(PathClaims::default());
        let expires_at = deadline.map(|d| tokio::time::Instant::now() + d);
        let limit = self
            .config
            .max_concurrent_exports
            .filter(|limit| *limit > 0)
            .unwrap_or(total_jobs);

        let export_tasks = stream::iter(ids.iter())
            .map(|id| {
                let progress = Arc::clone(&progress);
                let claims = Arc::clone(&claims);
                let output_dir = output_dir.clone();

                async move {
                    let mut job = ExportJob::new(id.clone(), output_dir);
                    job.start();

                    let start = Instant::now();
                    let result = self
                        .export_spreadsheet(&job, &claims, expires_at.zip(deadline))
                        .await;
                    let duration = start.elapsed();

                    job.finish(&result);
                    let mut progress_guard = progress.lock().await;
                    match result {
                        Ok(path) => {
                            info!(
                                "exported {} to {:?} in {:.1}s",
                                id,
                                path,
                                duration.as_secs_f64()
                            );
                            progress_guard.record_success();
                        }
                        Err(e) => {
                            let error_msg = e.to_string();
                            error!("failed to export {}: {}", id, error_msg);
                            progress_guard.record_failure(id, error_msg);
                        }
                    }
                    job
                }
            })
            .buffered(limit);

        let jobs: Vec<ExportJob> = export_tasks.collect().await;

        let final_progress = progress.lock().await;
        info!(
            "batch finished in {:.1}s: {} succeeded, {} failed",
            final_progress.start_time.elapsed().as_secs_f64(),
            final_progress.succeeded(),
            final_progress.errors
        );

        if self.config.failure_report {
            match final_progress.export_failures(&output_dir) {
                Ok(Some(path)) => info!("failure report written to {:?}", path),
                Ok(None) => {}
                Err(e) => warn!("failed to write failure report: {}", e),
            }
        }

        Ok(BatchResult::new(output_dir, jobs))
    }

    /// Resolves, absolutizes and creates the batch output directory.
    async fn prepare_output_dir(&self, requested: Option<&Path>) -> Result<PathBuf> {
        let dir = requested
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .or_else(|| self.config.output_dir.clone())
            .filter(|dir| !dir.as_os_str().is_empty())
            .or_else(default_output_dir)
            .ok_or_else(|| {
                AppError::InvalidArgument("no output directory given and no default found".to_string())
            })?;

        let dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir()?.join(dir)
        };

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            AppError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot create output directory {}: {}", dir.display(), e),
            ))
        })?;
        debug!("output directory ready: {:?}", dir);
        Ok(dir)
    }

    /// Fetches one spreadsheet and writes it as a workbook
    ///
    /// # Details
    /// 1. Fetch metadata for the title and worksheet list
    /// 2. Fetch values for each visible worksheet
    /// 3. Claim an output path no other job of the batch holds
    /// 4. Write the workbook on the blocking pool
    ///
    /// A deadline that passes during the fetches drops them. One that passes
    /// during the write cancels the writer and waits for it to stop, so the
    /// outcome always matches what is on disk.
    #[instrument(skip(self, job, claims, deadline), fields(id = %job.spreadsheet_id))]
    async fn export_spreadsheet(
        &self,
        job: &ExportJob,
        claims: &PathClaims,
        deadline: Option<(tokio::time::Instant, Duration)>,
    ) -> Result<PathBuf> {
        let _active = ActiveJobGuard::new(&self.active_jobs);

        let fetch = self.fetch_spreadsheet(&job.spreadsheet_id);
        let (title, worksheets) = match deadline {
            Some((at, budget)) => tokio::time::timeout_at(at, fetch)
                .await
                .unwrap_or(Err(AppError::DeadlineExceeded(budget)))?,
            None => fetch.await?,
        };

        let path = claims.claim(&job.output_dir, &title).await;
        let cancel = Arc::new(AtomicBool::new(false));
        let writer = WorkbookWriter::cancellable(Arc::clone(&cancel));
        let mut handle =
            tokio::task::spawn_blocking(move || writer.write_to(&path, &title, &worksheets));

        let Some((at, budget)) = deadline else {
            return handle.await?;
        };
        match tokio::time::timeout_at(at, &mut handle).await {
            Ok(joined) => joined?,
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                debug!("deadline passed while writing, stopping the writer");
                match handle.await? {
                    // Published before the writer saw the flag
                    Ok(path) => Ok(path),
                    Err(_) => Err(AppError::DeadlineExceeded(budget)),
                }
            }
        }
    }

    /// Fetches the title and every worksheet, leaving hidden ones unfetched.
    async fn fetch_spreadsheet(&self, id: &str) -> Result<(String, Vec<WorksheetInput>)> {
        let metadata = self.source.get_metadata(id).await?;

        let mut worksheets: Vec<WorksheetInput> = Vec::with_capacity(metadata.worksheets.len());
        for worksheet in metadata.worksheets {
            if worksheet.hidden {
                debug!("not fetching hidden worksheet {}", worksheet.name);
                worksheets.push(WorksheetInput::hidden(worksheet.name));
                continue;
            }
            let rows = self.source.get_values(id, &worksheet.name).await?;
            worksheets.push(
                WorksheetData {
                    name: worksheet.name,
                    rows,
                }
                .into(),
            );
        }
        Ok((metadata.title, worksheets))
    }
}

/// Output paths handed out within one batch.
///
/// Spreadsheets can share a title. The first job to claim `<title>.xlsx`
/// gets it; later ones get `<title> (2).xlsx`, `<title> (3).xlsx` and so on.
/// Names are compared ignoring case.
#[derive(Debug, Default)]
struct PathClaims {
    claimed: Mutex<HashSet<String>>,
}

impl PathClaims {
    async fn claim(&self, output_dir: &Path, title: &str) -> PathBuf {
        let stem = sanitize_file_stem(title);
        let mut claimed = self.claimed.lock().await;

        let mut file_name = workbook_file_name(title);
        let mut n = 2;
        while !claimed.insert(file_name.to_lowercase()) {
            file_name = format!("{} ({}).xlsx", stem, n);
            n += 1;
        }
        if n > 2 {
            warn!(
                "another spreadsheet in this batch is titled {:?}; writing {}",
                title, file_name
            );
        }
        output_dir.join(file_name)
    }
}

/// RAII guard for tracking active jobs
///
/// Automatically increments counter on creation and
/// decrements it when dropped
struct ActiveJobGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ActiveJobGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl<'a> Drop for ActiveJobGuard<'a> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_records_first_terminal_state_only() {
        let mut job = ExportJob::new("A", "/tmp");
        assert_eq!(job.outcome, JobOutcome::Pending);
        job.start();
        assert_eq!(job.outcome, JobOutcome::Running);

        job.finish(&Ok(PathBuf::from("/tmp/A.xlsx")));
        job.finish(&Err(AppError::Transport("late".into())));
        assert_eq!(job.outcome, JobOutcome::Succeeded(PathBuf::from("/tmp/A.xlsx")));
    }

    #[test]
    fn batch_success_requires_every_job() {
        let mut ok = ExportJob::new("A", "/out");
        ok.finish(&Ok(PathBuf::from("/out/A.xlsx")));
        let mut bad = ExportJob::new("B", "/out");
        bad.finish(&Err(AppError::NotFound("B".into())));
        let mut worse = ExportJob::new("C", "/out");
        worse.finish(&Err(AppError::Transport("reset".into())));

        let all_ok = BatchResult::new(PathBuf::from("/out"), vec![ok.clone()]);
        assert!(all_ok.success);
        assert!(all_ok.into_result().is_ok());

        let mixed = BatchResult::new(PathBuf::from("/out"), vec![ok, bad, worse]);
        assert!(!mixed.success);
        assert_eq!(mixed.succeeded_count(), 1);
        assert_eq!(mixed.first_failure().unwrap().spreadsheet_id, "B");

        match mixed.into_result() {
            Err(AppError::BatchFailed {
                failed,
                total,
                first_error,
            }) => {
                assert_eq!((failed, total), (2, 3));
                assert!(first_error.contains("B"));
            }
            other => panic!("expected batch failure, got {:?}", other),
        }
    }

    #[test]
    fn active_guard_balances_counter() {
        let counter = AtomicUsize::new(0);
        {
            let _a = ActiveJobGuard::new(&counter);
            let _b = ActiveJobGuard::new(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shared_titles_claim_distinct_paths() {
        let claims = PathClaims::default();
        let dir = Path::new("/out");
        assert_eq!(claims.claim(dir, "Report").await, dir.join("Report.xlsx"));
        assert_eq!(claims.claim(dir, "report").await, dir.join("report (2).xlsx"));
        assert_eq!(claims.claim(dir, "Report").await, dir.join("Report (3).xlsx"));
        assert_eq!(claims.claim(dir, "Other").await, dir.join("Other.xlsx"));
    }
}
