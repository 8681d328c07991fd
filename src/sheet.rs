use crate::auth::AuthContext;
use crate::config::{Config, ValueRenderOption};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// A single cell as returned by the Sheets API.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Empty,
}

impl CellValue {
    fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) if s.is_empty() => CellValue::Empty,
            serde_json::Value::String(s) => CellValue::Text(s),
            serde_json::Value::Number(n) => n.as_f64().map_or(CellValue::Empty, CellValue::Number),
            serde_json::Value::Bool(b) => CellValue::Bool(b),
            serde_json::Value::Null => CellValue::Empty,
            other => CellValue::Text(other.to_string()),
        }
    }
}

pub type Row = Vec<CellValue>;

/// One worksheet as listed in spreadsheet metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorksheetInfo {
    pub name: String,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadsheetMetadata {
    pub title: String,
    pub worksheets: Vec<WorksheetInfo>,
}

/// A worksheet's cell grid, fetched for one export job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorksheetData {
    pub name: String,
    pub rows: Vec<Row>,
}

/// Read access to remote spreadsheets.
///
/// Implementations return rows already passed through [`normalize_rows`].
#[async_trait]
pub trait SpreadsheetSource: Send + Sync {
    /// Fetches the title and worksheet list of a spreadsheet.
    ///
    /// # Errors
    /// * [`AppError::Auth`] if the credential is rejected
    /// * [`AppError::NotFound`] if the id does not resolve or is not permitted
    /// * [`AppError::Transport`] for other network or HTTP failures
    async fn get_metadata(&self, spreadsheet_id: &str) -> Result<SpreadsheetMetadata>;

    /// Fetches every row of one worksheet. Empty worksheets yield no rows.
    async fn get_values(&self, spreadsheet_id: &str, worksheet: &str) -> Result<Vec<Row>>;
}

/// Pads or truncates every row to the first row's length.
///
/// # Examples
///
/// ```
/// use gsheet_export::sheet::{normalize_rows, CellValue};
///
/// let rows = normalize_rows(vec![
///     vec![CellValue::Text("a".into()), CellValue::Text("b".into())],
///     vec![CellValue::Number(1.0)],
/// ]);
/// assert_eq!(rows[1], vec![CellValue::Number(1.0), CellValue::Empty]);
/// ```
pub fn normalize_rows(mut rows: Vec<Row>) -> Vec<Row> {
    let Some(width) = rows.first().map(Vec::len) else {
        return rows;
    };
    for row in rows.iter_mut().skip(1) {
        row.resize(width, CellValue::Empty);
    }
    rows
}

/// Quotes a worksheet name as an A1 range covering the whole sheet.
pub fn a1_range(worksheet: &str) -> String {
    format!("'{}'", worksheet.replace('\'', "''"))
}

#[derive(Debug, Deserialize)]
struct SpreadsheetResponse {
    #[serde(default)]
    properties: Option<SpreadsheetProperties>,
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetProperties {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
    #[serde(default)]
    hidden: bool,
}

#[derive(Debug, Deserialize)]
struct ValueRangeResponse {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Client for the Google Sheets v4 REST API.
///
/// Handles:
/// - URL construction and A1 range quoting
/// - Bearer authentication from a shared [`AuthContext`]
/// - Mapping HTTP statuses onto the error taxonomy
/// - Decoding cell values into [`CellValue`]
///
/// # Examples
///
/// ```no_run
/// use gsheet_export::{AuthContext, Config, Credential, SheetsClient, SpreadsheetSource};
///
/// async fn example() -> gsheet_export::error::Result<()> {
///     let auth = AuthContext::new(Credential::new("ya29..."));
///     let client = SheetsClient::new(auth, &Config::default())?;
///     let metadata = client.get_metadata("1BxiMVs0XRA5nFMdKvBdBZjgmUUqptlbs74OgvE2upms").await?;
///     println!("{}", metadata.title);
///     Ok(())
/// }
/// ```
pub struct SheetsClient {
    http: reqwest::Client,
    base_url: Url,
    auth: AuthContext,
    value_render: ValueRenderOption,
}

impl SheetsClient {
    pub fn new(auth: AuthContext, config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: Url::parse(&config.api_base_url)?,
            auth,
            value_render: config.value_render_option,
        })
    }

    fn endpoint(&self, spreadsheet_id: &str, tail: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                AppError::InvalidArgument(format!("API base URL {} cannot take a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", spreadsheet_id])
            .extend(tail);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
        spreadsheet_id: &str,
    ) -> Result<T> {
        debug!("GET {}", url);
        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(self.auth.access_token())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        check_status(status, &body, spreadsheet_id)?;

        Ok(serde_json::from_str(&body)?)
    }
}

/// Maps a non-success status onto the error taxonomy.
fn check_status(status: StatusCode, body: &str, spreadsheet_id: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }

    let detail = api_error_message(body).unwrap_or_else(|| status.to_string());
    Err(match status {
        StatusCode::UNAUTHORIZED => AppError::Auth(detail),
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            AppError::NotFound(format!("{} ({})", spreadsheet_id, detail))
        }
        _ => AppError::Transport(format!("HTTP {}: {}", status.as_u16(), detail)),
    })
}

/// Pulls `error.message` out of a Google API error body.
fn api_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl SpreadsheetSource for SheetsClient {
    #[instrument(skip(self))]
    async fn get_metadata(&self, spreadsheet_id: &str) -> Result<SpreadsheetMetadata> {
        let url = self.endpoint(spreadsheet_id, &[])?;
        let response: SpreadsheetResponse = self
            .get_json(
                url,
                &[("fields", "properties.title,sheets.properties(title,hidden)")],
                spreadsheet_id,
            )
            .await?;

        let title = response
            .properties
            .and_then(|p| p.title)
            .unwrap_or_else(|| "untitled".to_string());
        let worksheets = response
            .sheets
            .into_iter()
            .map(|sheet| WorksheetInfo {
                name: sheet.properties.title,
                hidden: sheet.properties.hidden,
            })
            .collect::<Vec<_>>();

        debug!("{} has {} worksheets", title, worksheets.len());
        Ok(SpreadsheetMetadata { title, worksheets })
    }

    #[instrument(skip(self))]
    async fn get_values(&self, spreadsheet_id: &str, worksheet: &str) -> Result<Vec<Row>> {
        let range = a1_range(worksheet);
        let url = self.endpoint(spreadsheet_id, &["values", &range])?;
        let response: ValueRangeResponse = self
            .get_json(
                url,
                &[
                    ("majorDimension", "ROWS"),
                    ("valueRenderOption", self.value_render.as_str()),
                ],
                spreadsheet_id,
            )
            .await?;

        let rows = response
            .values
            .into_iter()
            .map(|row| row.into_iter().map(CellValue::from_json).collect())
            .collect();
        Ok(normalize_rows(rows))
    }
}
