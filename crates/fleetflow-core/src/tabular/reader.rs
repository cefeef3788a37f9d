//! Input readers for delimited text and spreadsheet workbooks.
//!
//! Workbooks use the first sheet, raw rows, no header inference; missing
//! cells come back as empty strings. Unsupported extensions fail before
//! any artifact is written.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};

use crate::error::{FlowError, Result};

/// Number of rows in an evidence-packet preview.
pub const PREVIEW_ROWS: usize = 5;

/// Supported input kinds, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Workbook,
    Delimited,
}

/// Classify an input path by extension. `.xlsx`/`.xls` are workbooks,
/// `.csv` is delimited text, anything else is unsupported.
pub fn input_kind(path: &Path) -> Result<InputKind> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "xlsx" | "xls" => Ok(InputKind::Workbook),
        "csv" => Ok(InputKind::Delimited),
        _ => Err(FlowError::UnsupportedInput(path.display().to_string())),
    }
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("{e:?}"),
    }
}

fn read_workbook_grid(path: &Path, sheet_name: Option<&str>) -> Result<(Vec<Vec<String>>, String)> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| FlowError::Workbook(e.to_string()))?;
    let sheet = match sheet_name {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| FlowError::Workbook(format!("no sheets in {}", path.display())))?,
    };
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| FlowError::Workbook(e.to_string()))?;

    // The used range may not start at A1; pad so row/column indices are
    // absolute, matching how the preview and recipes address cells.
    let (row_offset, col_offset) = range.start().unwrap_or((0, 0));
    let width = col_offset as usize + range.width();
    let mut grid = vec![vec![String::new(); width]; row_offset as usize];
    for row in range.rows() {
        let mut cells = vec![String::new(); col_offset as usize];
        cells.extend(row.iter().map(cell_to_string));
        while cells.len() < width {
            cells.push(String::new());
        }
        grid.push(cells);
    }
    Ok((grid, sheet))
}

fn read_csv_grid(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record?;
        grid.push(record.iter().map(|cell| cell.to_string()).collect());
    }
    Ok(grid)
}

/// First [`PREVIEW_ROWS`] raw rows plus the sheet name for workbooks.
pub fn read_preview(path: &Path) -> Result<(Vec<Vec<String>>, Option<String>)> {
    match input_kind(path)? {
        InputKind::Workbook => {
            let (grid, sheet) = read_workbook_grid(path, None)?;
            let preview = grid.into_iter().take(PREVIEW_ROWS).collect();
            Ok((preview, Some(sheet)))
        }
        InputKind::Delimited => {
            let grid = read_csv_grid(path)?;
            Ok((grid.into_iter().take(PREVIEW_ROWS).collect(), None))
        }
    }
}

/// The full raw grid of the input (first sheet unless `sheet_name` is
/// given).
pub fn read_grid(path: &Path, sheet_name: Option<&str>) -> Result<Vec<Vec<String>>> {
    match input_kind(path)? {
        InputKind::Workbook => Ok(read_workbook_grid(path, sheet_name)?.0),
        InputKind::Delimited => read_csv_grid(path),
    }
}
