//! Spreadsheet identifier extraction.
//!
//! Users paste either a bare spreadsheet id or a full Google Sheets URL.
//! Both forms normalize to the same id, which is what the registry and the
//! exporter key on.

const DOCUMENT_MARKER: &str = "/spreadsheets/d/";
const SPREADSHEETS_MARKER: &str = "/spreadsheets/";

/// Extracts the canonical spreadsheet id from a raw id or URL.
///
/// # Rules
/// 1. A string without `/` is already an id and is returned unchanged.
/// 2. After `/spreadsheets/d/`, the id is the next segment up to `/` or `?`.
/// 3. After `/spreadsheets/`, the same truncation applies.
/// 4. Anything else does not name a spreadsheet.
///
/// # Examples
///
/// ```
/// use gsheet_export::extract_sheet_id;
///
/// assert_eq!(extract_sheet_id("abc123").as_deref(), Some("abc123"));
/// assert_eq!(
///     extract_sheet_id("https://docs.google.com/spreadsheets/d/XYZ/edit?gid=0").as_deref(),
///     Some("XYZ")
/// );
/// assert_eq!(extract_sheet_id("not-a-url-but/has-slash"), None);
/// ```
pub fn extract_sheet_id(input: &str) -> Option<String> {
    if !input.contains('/') {
        return Some(input.to_string());
    }

    let rest = segment_after(input, DOCUMENT_MARKER)
        .or_else(|| segment_after(input, SPREADSHEETS_MARKER))?;

    let end = rest.find(['/', '?']).unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

fn segment_after<'a>(input: &'a str, marker: &str) -> Option<&'a str> {
    input
        .find(marker)
        .map(|start| &input[start + marker.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_id_is_returned_unchanged() {
        assert_eq!(extract_sheet_id("abc123").as_deref(), Some("abc123"));
        assert_eq!(extract_sheet_id("").as_deref(), Some(""));
    }

    #[test]
    fn document_url_yields_segment_after_marker() {
        assert_eq!(
            extract_sheet_id("https://x/spreadsheets/d/XYZ/edit?gid=0").as_deref(),
            Some("XYZ")
        );
        assert_eq!(
            extract_sheet_id("https://docs.google.com/spreadsheets/d/160Obd-Z9nMz2_M").as_deref(),
            Some("160Obd-Z9nMz2_M")
        );
    }

    #[test]
    fn query_truncates_before_slash() {
        assert_eq!(
            extract_sheet_id("https://x/spreadsheets/d/XYZ?usp=sharing").as_deref(),
            Some("XYZ")
        );
    }

    #[test]
    fn short_spreadsheets_form_is_accepted() {
        assert_eq!(
            extract_sheet_id("https://x/spreadsheets/XYZ/edit").as_deref(),
            Some("XYZ")
        );
    }

    #[test]
    fn unrelated_paths_do_not_match() {
        assert_eq!(extract_sheet_id("not-a-url-but/has-slash"), None);
        assert_eq!(extract_sheet_id("https://example.com/docs/d/XYZ"), None);
    }

    #[test]
    fn same_sheet_different_urls_normalize_identically() {
        let a = extract_sheet_id("https://docs.google.com/spreadsheets/d/ID1/edit#gid=0");
        let b = extract_sheet_id("https://docs.google.com/spreadsheets/d/ID1/view");
        assert_eq!(a.as_deref(), Some("ID1"));
        assert_eq!(a, b);
    }
}
