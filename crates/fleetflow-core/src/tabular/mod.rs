//! Tabular cell normalization and type cleaning.
//!
//! Two number cleaners coexist deliberately. The adapter layer captures
//! the first numeric token as a string (sign and decimal point preserved,
//! scientific notation unsupported). The manual-recipe layer parses to
//! f64 and renders floats with a trailing `.0` for integral values, so
//! `"USD 3"` typed as number becomes `"3.0"`.

pub mod reader;

use std::sync::OnceLock;

use regex::Regex;

/// Trim, lowercase, spaces to underscores. Empty cells become
/// `unnamed_<idx>`.
pub fn normalize_header(value: &str, idx: usize) -> String {
    let text = value.trim().to_lowercase();
    if text.is_empty() {
        return format!("unnamed_{idx}");
    }
    text.replace(' ', "_")
}

/// Collapse internal whitespace and lowercase. Used for structural
/// hashing and header-name matching.
pub fn normalize_label(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Digits with at most one dot (e.g. `3`, `19.95`). Signs, exponents and
/// thousands separators do not count.
pub fn numeric_like(value: &str) -> bool {
    let text = value.trim();
    if text.is_empty() {
        return false;
    }
    let without_dot = text.replacen('.', "", 1);
    !without_dot.is_empty() && without_dot.chars().all(|c| c.is_ascii_digit())
}

/// Whether a candidate header row looks like a data row: at least half of
/// the cells are numeric. An empty row counts as data.
pub fn header_looks_like_data(headers: &[String]) -> bool {
    if headers.is_empty() {
        return true;
    }
    let numeric_count = headers.iter().filter(|h| numeric_like(h)).count();
    numeric_count >= std::cmp::max(1, headers.len() / 2)
}

fn number_capture_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number regex"))
}

/// Adapter-layer number cleaning: strip thousands separators, capture the
/// first numeric token. Empty when nothing numeric remains.
pub fn clean_number_capture(value: &str) -> String {
    let text = value.trim();
    if text.is_empty() {
        return String::new();
    }
    let normalized = text.replace(',', "");
    number_capture_re()
        .find(&normalized)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Manual-recipe number cleaning: drop everything but digits, `-` and
/// `.`, then parse as f64.
pub fn clean_number_float(value: &str) -> Option<f64> {
    let kept: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if kept.is_empty() {
        return None;
    }
    kept.parse().ok()
}

/// Render a float the way its decimal form reads: integral values keep a
/// trailing `.0` (`3` -> `"3.0"`, `19.95` -> `"19.95"`).
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%m/%d/%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Parse a date-ish value and emit an ISO date. Unparseable input passes
/// through unchanged.
pub fn clean_date(value: &str) -> String {
    let text = value.trim();
    if text.is_empty() {
        return String::new();
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return dt.date_naive().to_string();
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(text, fmt) {
            return date.to_string();
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, fmt) {
            return dt.date().to_string();
        }
    }
    text.to_string()
}

/// Force a single cell into the desired type (manual-recipe layer).
pub fn clean_value(value: &str, target_type: &str) -> String {
    match target_type {
        "number" => clean_number_float(value).map(format_float).unwrap_or_default(),
        "date" => clean_date(value),
        "string" => value.trim().to_string(),
        _ => value.to_string(),
    }
}

/// Infer a column dtype from its values: `number` when every non-empty
/// cell is numeric, else `string`.
pub fn infer_dtype<S: AsRef<str>>(values: &[S]) -> &'static str {
    let cleaned: Vec<&str> = values
        .iter()
        .map(|v| v.as_ref().trim())
        .filter(|v| !v.is_empty())
        .collect();
    if cleaned.is_empty() {
        return "string";
    }
    if cleaned.iter().all(|v| numeric_like(v)) {
        "number"
    } else {
        "string"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("Product Code", 0), "product_code");
        assert_eq!(normalize_header("  Qty ", 2), "qty");
        assert_eq!(normalize_header("", 3), "unnamed_3");
        assert_eq!(normalize_header("   ", 0), "unnamed_0");
        assert_eq!(normalize_header("Sales Report Q1", 0), "sales_report_q1");
    }

    #[test]
    fn test_normalize_label_collapses_whitespace() {
        assert_eq!(normalize_label("  Product   Code "), "product code");
        assert_eq!(normalize_label("QTY"), "qty");
    }

    #[test]
    fn test_numeric_like() {
        assert!(numeric_like("3"));
        assert!(numeric_like("19.95"));
        assert!(numeric_like(".5"));
        assert!(!numeric_like("1.2.3"));
        assert!(!numeric_like("-3"));
        assert!(!numeric_like("x100"));
        assert!(!numeric_like(""));
    }

    #[test]
    fn test_header_looks_like_data() {
        let data_row: Vec<String> = ["row1", "x100", "3", "19.95"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(header_looks_like_data(&data_row));

        let header_row: Vec<String> = ["unnamed_0", "product_code", "qty", "amount"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(!header_looks_like_data(&header_row));

        assert!(header_looks_like_data(&[]));
    }

    #[test]
    fn test_clean_number_capture() {
        assert_eq!(clean_number_capture("1,234.5"), "1234.5");
        assert_eq!(clean_number_capture("USD 3"), "3");
        assert_eq!(clean_number_capture("-19.95 EUR"), "-19.95");
        assert_eq!(clean_number_capture("n/a"), "");
        assert_eq!(clean_number_capture(""), "");
    }

    #[test]
    fn test_clean_number_float_renders_python_style() {
        assert_eq!(clean_value("USD 3", "number"), "3.0");
        assert_eq!(clean_value("1", "number"), "1.0");
        assert_eq!(clean_value("19.95", "number"), "19.95");
        assert_eq!(clean_value("no digits", "number"), "");
    }

    #[test]
    fn test_clean_date() {
        assert_eq!(clean_date("2025-01-01"), "2025-01-01");
        assert_eq!(clean_date("2025/01/02"), "2025-01-02");
        assert_eq!(clean_date("2026-01-01T01:00:00Z"), "2026-01-01");
        assert_eq!(clean_date("not a date"), "not a date");
    }

    #[test]
    fn test_infer_dtype() {
        assert_eq!(infer_dtype(&["3", "19.95", ""]), "number");
        assert_eq!(infer_dtype(&["x100", "3"]), "string");
        assert_eq!(infer_dtype(&["", ""]), "string");
    }
}
