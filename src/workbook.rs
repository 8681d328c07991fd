use crate::error::{AppError, Result};
use crate::sheet::{CellValue, Row, WorksheetData};
use rust_xlsxwriter::{Workbook, Worksheet};
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Excel sheet-size limits.
const MAX_ROWS: u32 = 1_048_576;
const MAX_COLS: u16 = 16_384;
/// Longest text Excel accepts in one cell. Google Sheets allows 50,000.
pub const MAX_CELL_CHARS: usize = 32_767;
/// Rows written between checks of the cancel flag.
const CANCEL_CHECK_ROWS: usize = 1024;
const MAX_SHEET_NAME_CHARS: usize = 31;
const INVALID_SHEET_NAME_CHARS: [char; 7] = ['[', ']', ':', '*', '?', '/', '\\'];
const INVALID_FILE_NAME_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Name of the blank sheet written when nothing else survives filtering.
pub const PLACEHOLDER_SHEET: &str = "Sheet1";

/// One worksheet handed to the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct WorksheetInput {
    pub name: String,
    pub rows: Vec<Row>,
    pub hidden: bool,
}

impl WorksheetInput {
    pub fn new(name: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            name: name.into(),
            rows,
            hidden: false,
        }
    }

    pub fn hidden(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
            hidden: true,
        }
    }
}

impl From<WorksheetData> for WorksheetInput {
    fn from(data: WorksheetData) -> Self {
        Self::new(data.name, data.rows)
    }
}

/// Writes one spreadsheet's worksheets into a local `.xlsx` file.
///
/// # Policy
/// * Hidden worksheets are skipped
/// * Worksheets with no rows are skipped
/// * If nothing remains, a single blank [`PLACEHOLDER_SHEET`] keeps the file valid
/// * The file appears under its final name only once fully written
/// * A cancelled write never publishes its file
#[derive(Debug, Default, Clone)]
pub struct WorkbookWriter {
    cancel: Option<Arc<AtomicBool>>,
}

impl WorkbookWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer that stops, leaving nothing behind, once `cancel` is set.
    pub fn cancellable(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }

    /// Writes `<title>.xlsx` into `output_dir` and returns its absolute path.
    ///
    /// # Arguments
    /// * `title` - Spreadsheet title, used as the file stem
    /// * `worksheets` - Worksheets in spreadsheet order
    /// * `output_dir` - Target directory, created if absent
    ///
    /// # Errors
    /// * [`AppError::Io`] if the directory cannot be created, a worksheet
    ///   exceeds Excel's size limits, or the file cannot be written
    pub fn write(
        &self,
        title: &str,
        worksheets: &[WorksheetInput],
        output_dir: &Path,
    ) -> Result<PathBuf> {
        self.write_to(&output_dir.join(workbook_file_name(title)), title, worksheets)
    }

    /// Writes the workbook to exactly `path`, creating its directory.
    ///
    /// # Errors
    /// Same as [`WorkbookWriter::write`]. A cancelled write fails with an
    /// `Io` error of kind [`io::ErrorKind::Interrupted`].
    pub fn write_to(
        &self,
        path: &Path,
        title: &str,
        worksheets: &[WorksheetInput],
    ) -> Result<PathBuf> {
        let path = absolute(path)?;
        let output_dir = match path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => {
                return Err(AppError::InvalidArgument(format!(
                    "{} has no parent directory",
                    path.display()
                )))
            }
        };
        std::fs::create_dir_all(&output_dir)?;

        let mut workbook = Workbook::new();
        let mut used_names = HashSet::new();
        let mut written = 0usize;

        for input in worksheets {
            if input.hidden {
                debug!("skipping hidden worksheet {}", input.name);
                continue;
            }
            if input.rows.is_empty() {
                info!("skipping empty worksheet {}", input.name);
                continue;
            }

            let name = unique_sheet_name(&input.name, &mut used_names);
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(&name)?;
            self.write_rows(worksheet, &input.rows)
                .map_err(|e| annotate(e, &format!("worksheet {}", input.name)))?;
            written += 1;
        }

        if written == 0 {
            warn!("{} has no visible data; writing a blank workbook", title);
            workbook.add_worksheet().set_name(PLACEHOLDER_SHEET)?;
        }

        self.check_cancelled()?;
        let buffer = workbook.save_to_buffer()?;
        let mut file = tempfile::NamedTempFile::new_in(&output_dir)?;
        file.write_all(&buffer)?;
        file.as_file().sync_all()?;

        // Last point at which the temp file is still dropped unpublished
        self.check_cancelled()?;
        file.persist(&path).map_err(|e| AppError::Io(e.error))?;

        info!("wrote {} sheet(s) to {:?}", written, path);
        Ok(path)
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(cancel) if cancel.load(Ordering::SeqCst) => Err(AppError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "workbook write cancelled",
            ))),
            _ => Ok(()),
        }
    }

    fn write_rows(&self, worksheet: &mut Worksheet, rows: &[Row]) -> Result<()> {
        for (r, row) in rows.iter().enumerate() {
            if r % CANCEL_CHECK_ROWS == 0 {
                self.check_cancelled()?;
            }
            let r = u32::try_from(r)
                .ok()
                .filter(|r| *r < MAX_ROWS)
                .ok_or_else(|| too_large(format!("more than {} rows", MAX_ROWS)))?;

            for (c, cell) in row.iter().enumerate() {
                let c = u16::try_from(c)
                    .ok()
                    .filter(|c| *c < MAX_COLS)
                    .ok_or_else(|| too_large(format!("more than {} columns", MAX_COLS)))?;

                match cell {
                    CellValue::Text(text) => {
                        let len = text.chars().count();
                        if len > MAX_CELL_CHARS {
                            return Err(too_large(format!(
                                "cell {} holds {} characters, more than {}",
                                cell_reference(r, c),
                                len,
                                MAX_CELL_CHARS
                            )));
                        }
                        worksheet.write_string(r, c, text)?;
                    }
                    CellValue::Number(number) => {
                        worksheet.write_number(r, c, *number)?;
                    }
                    CellValue::Bool(value) => {
                        worksheet.write_boolean(r, c, *value)?;
                    }
                    CellValue::Empty => {}
                }
            }
        }
        Ok(())
    }
}

/// File name a spreadsheet titled `title` is written under.
pub fn workbook_file_name(title: &str) -> String {
    format!("{}.xlsx", sanitize_file_stem(title))
}

/// A1-style reference of a zero-based cell position, e.g. `(0, 27)` is `AB1`.
fn cell_reference(row: u32, col: u16) -> String {
    let mut letters = Vec::new();
    let mut n = u32::from(col) + 1;
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push(char::from(b'A' + rem));
        n = (n - 1) / 26;
    }
    let column: String = letters.into_iter().rev().collect();
    format!("{}{}", column, u64::from(row) + 1)
}

fn too_large(detail: String) -> AppError {
    AppError::Io(io::Error::other(format!(
        "worksheet exceeds Excel limits: {}",
        detail
    )))
}

fn annotate(error: AppError, context: &str) -> AppError {
    match error {
        AppError::Io(e) => AppError::Io(io::Error::new(e.kind(), format!("{}: {}", context, e))),
        other => other,
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Makes a worksheet name acceptable to Excel.
///
/// # Examples
///
/// ```
/// use gsheet_export::workbook::sanitize_sheet_name;
///
/// assert_eq!(sanitize_sheet_name("Q1/Q2 [draft]"), "Q1_Q2 _draft_");
/// assert_eq!(sanitize_sheet_name(""), "Sheet");
/// ```
pub fn sanitize_sheet_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if INVALID_SHEET_NAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .take(MAX_SHEET_NAME_CHARS)
        .collect();

    let trimmed = replaced.trim_matches('\'');
    if trimmed.is_empty() {
        String::from("Sheet")
    } else if trimmed.eq_ignore_ascii_case("history") {
        // Reserved by Excel
        format!("{}_", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Sanitizes `name` and suffixes ` (n)` until it is unique, ignoring case.
fn unique_sheet_name(name: &str, used: &mut HashSet<String>) -> String {
    let base = sanitize_sheet_name(name);
    let mut candidate = base.clone();
    let mut n = 2;
    while used.contains(&candidate.to_lowercase()) {
        let suffix = format!(" ({})", n);
        let stem: String = base
            .chars()
            .take(MAX_SHEET_NAME_CHARS - suffix.chars().count())
            .collect();
        candidate = format!("{}{}", stem.trim_end_matches('\''), suffix);
        n += 1;
    }
    used.insert(candidate.to_lowercase());
    candidate
}

/// Turns a spreadsheet title into a portable file stem.
pub fn sanitize_file_stem(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| {
            if INVALID_FILE_NAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim().trim_end_matches('.');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        String::from("untitled")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{open_workbook, Data, Reader, Xlsx};
    use tempfile::tempdir;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn sheet_names(path: &Path) -> Vec<String> {
        let workbook: Xlsx<_> = open_workbook(path).unwrap();
        workbook.sheet_names()
    }

    #[test]
    fn hidden_worksheets_are_skipped() {
        let dir = tempdir().unwrap();
        let path = WorkbookWriter::new()
            .write(
                "Report",
                &[
                    WorksheetInput::new("Visible1", vec![vec![text("a")]]),
                    WorksheetInput {
                        name: "Hidden1".into(),
                        rows: vec![vec![text("secret")]],
                        hidden: true,
                    },
                ],
                dir.path(),
            )
            .unwrap();

        assert_eq!(path, dir.path().join("Report.xlsx"));
        assert_eq!(sheet_names(&path), vec!["Visible1".to_string()]);
    }

    #[test]
    fn empty_worksheets_are_skipped() {
        let dir = tempdir().unwrap();
        let path = WorkbookWriter::new()
            .write(
                "Mixed",
                &[
                    WorksheetInput::new("Empty", Vec::new()),
                    WorksheetInput::new("Data", vec![vec![text("x")]]),
                ],
                dir.path(),
            )
            .unwrap();
        assert_eq!(sheet_names(&path), vec!["Data".to_string()]);
    }

    #[test]
    fn nothing_visible_yields_blank_placeholder_workbook() {
        let dir = tempdir().unwrap();
        let path = WorkbookWriter::new()
            .write(
                "Nothing",
                &[
                    WorksheetInput::hidden("Hidden1"),
                    WorksheetInput::new("Empty", Vec::new()),
                ],
                dir.path(),
            )
            .unwrap();

        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        assert_eq!(workbook.sheet_names(), vec![PLACEHOLDER_SHEET.to_string()]);
        let range = workbook.worksheet_range(PLACEHOLDER_SHEET).unwrap();
        assert!(range.is_empty());
    }

    #[test]
    fn zero_worksheets_also_yield_placeholder() {
        let dir = tempdir().unwrap();
        let path = WorkbookWriter::new().write("Blank", &[], dir.path()).unwrap();
        assert_eq!(sheet_names(&path), vec![PLACEHOLDER_SHEET.to_string()]);
    }

    #[test]
    fn cells_keep_their_types_and_order() {
        let dir = tempdir().unwrap();
        let rows = vec![
            vec![text("name"), text("qty"), text("ok")],
            vec![text("apple"), CellValue::Number(3.0), CellValue::Bool(true)],
            vec![text("pear"), CellValue::Empty, CellValue::Bool(false)],
        ];
        let path = WorkbookWriter::new()
            .write("Typed", &[WorksheetInput::new("Stock", rows)], dir.path())
            .unwrap();

        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        let range = workbook.worksheet_range("Stock").unwrap();
        assert_eq!(range.get_value((0, 1)), Some(&Data::String("qty".into())));
        assert_eq!(range.get_value((1, 1)), Some(&Data::Float(3.0)));
        assert_eq!(range.get_value((1, 2)), Some(&Data::Bool(true)));
        assert_eq!(range.get_value((2, 0)), Some(&Data::String("pear".into())));
        assert_eq!(range.get_value((2, 2)), Some(&Data::Bool(false)));
    }

    #[test]
    fn creates_missing_directories_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let path = WorkbookWriter::new()
            .write("Deep", &[WorksheetInput::new("S", vec![vec![text("v")]])], &nested)
            .unwrap();

        assert!(path.exists());
        let entries: Vec<_> = std::fs::read_dir(&nested).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn rewriting_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let writer = WorkbookWriter::new();
        writer
            .write("Same", &[WorksheetInput::new("Old", vec![vec![text("1")]])], dir.path())
            .unwrap();
        let path = writer
            .write("Same", &[WorksheetInput::new("New", vec![vec![text("2")]])], dir.path())
            .unwrap();
        assert_eq!(sheet_names(&path), vec!["New".to_string()]);
    }

    #[test]
    fn awkward_names_are_made_legal() {
        let dir = tempdir().unwrap();
        let path = WorkbookWriter::new()
            .write(
                "Q1/Q2: plan",
                &[
                    WorksheetInput::new("Data?", vec![vec![text("1")]]),
                    WorksheetInput::new("data_", vec![vec![text("2")]]),
                    WorksheetInput::new("A very long worksheet name that Excel rejects", vec![vec![text("3")]]),
                ],
                dir.path(),
            )
            .unwrap();

        assert_eq!(path.file_name().unwrap(), "Q1_Q2_ plan.xlsx");
        let names = sheet_names(&path);
        assert_eq!(names[0], "Data_");
        assert_eq!(names[1], "data_ (2)");
        assert_eq!(names[2].chars().count(), 31);
    }

    #[test]
    fn sheet_name_rules() {
        assert_eq!(sanitize_sheet_name("'quoted'"), "quoted");
        assert_eq!(sanitize_sheet_name("History"), "History_");
        assert_eq!(sanitize_sheet_name("a:b"), "a_b");
    }

    #[test]
    fn file_stem_rules() {
        assert_eq!(sanitize_file_stem("  "), "untitled");
        assert_eq!(sanitize_file_stem("report."), "report");
        assert_eq!(sanitize_file_stem("a<b>|c"), "a_b__c");
    }

    #[test]
    fn write_to_uses_the_given_path() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out").join("Report (2).xlsx");
        let path = WorkbookWriter::new()
            .write_to(&target, "Report", &[WorksheetInput::new("S", vec![vec![text("v")]])])
            .unwrap();
        assert_eq!(path, target);
        assert_eq!(sheet_names(&path), vec!["S".to_string()]);
    }

    #[test]
    fn overlong_text_cell_is_named_in_the_error() {
        let dir = tempdir().unwrap();
        let long = "x".repeat(MAX_CELL_CHARS + 1);
        let err = WorkbookWriter::new()
            .write(
                "Notes",
                &[WorksheetInput::new(
                    "Comments",
                    vec![vec![text("id"), text("body")], vec![text("1"), text(&long)]],
                )],
                dir.path(),
            )
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        let message = err.to_string();
        assert!(message.contains("worksheet Comments"));
        assert!(message.contains("cell B2"));
        assert!(message.contains("32767"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn text_at_the_cell_limit_is_written() {
        let dir = tempdir().unwrap();
        let longest = "y".repeat(MAX_CELL_CHARS);
        let path = WorkbookWriter::new()
            .write("Edge", &[WorksheetInput::new("S", vec![vec![text(&longest)]])], dir.path())
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn cancelled_write_publishes_nothing() {
        let dir = tempdir().unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let err = WorkbookWriter::cancellable(cancel)
            .write("Gone", &[WorksheetInput::new("S", vec![vec![text("v")]])], dir.path())
            .unwrap_err();

        match err {
            AppError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::Interrupted),
            other => panic!("expected an interrupted write, got {:?}", other),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn uncancelled_flag_does_not_interfere() {
        let dir = tempdir().unwrap();
        let path = WorkbookWriter::cancellable(Arc::new(AtomicBool::new(false)))
            .write("Kept", &[WorksheetInput::new("S", vec![vec![text("v")]])], dir.path())
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn cell_references() {
        assert_eq!(cell_reference(0, 0), "A1");
        assert_eq!(cell_reference(9, 25), "Z10");
        assert_eq!(cell_reference(0, 26), "AA1");
        assert_eq!(cell_reference(1, 27), "AB2");
        assert_eq!(cell_reference(0, 16_383), "XFD1");
    }
}
