// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of jiandu.
//
// jiandu is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// jiandu is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with jiandu.  If not,
// see <http://www.gnu.org/licenses/>.

//! # tabular
//!
//! The spreadsheet edge of the system. Workbook *parsing* happens in the browser — import
//! endpoints receive pre-extracted JSON rows — so the server side of the story is just two
//! things: generating blank template workbooks whose header row matches each collection's fixed
//! Chinese column set, and reading loosely-typed cells out of those uploaded rows (which may be
//! keyed by either the Chinese headers or the English field names, and whose values arrive as
//! strings or numbers as the spreadsheet saw fit).

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
};
use serde_json::Value;
use snafu::{prelude::*, Backtrace, OptionExt};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The template workbook has no sheet"))]
    NoSheet { backtrace: Backtrace },
    #[snafu(display("Failed to serialize the template workbook: {source}"))]
    WriteWorkbook {
        source: umya_spreadsheet::XlsxError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Build a one-row .xlsx holding `headers` — the blank import template for a collection.
pub fn template_workbook(headers: &[&str]) -> Result<Vec<u8>> {
    let mut book = umya_spreadsheet::new_file();
    let sheet = book.get_sheet_mut(&0).context(NoSheetSnafu)?;
    for (i, header) in headers.iter().enumerate() {
        sheet.get_cell_mut((i as u32 + 1, 1)).set_value(*header);
    }
    let mut cursor = std::io::Cursor::new(Vec::new());
    umya_spreadsheet::writer::xlsx::write_writer(&book, &mut cursor)
        .context(WriteWorkbookSnafu)?;
    Ok(cursor.into_inner())
}

/// The template as a download response.
pub fn template_response(headers: &[&str], filename: &str) -> Result<axum::response::Response> {
    let body = template_workbook(headers)?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        [(header::CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        loose row access                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A spreadsheet cell as a trimmed string, however the cell was typed. Whole numbers drop their
/// fractional zero, matching how the front-end stringifies them.
pub fn cell_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_owned(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                n.to_string()
            }
        }
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Fetch a cell by any of its aliases (English field name, Chinese header), first hit wins.
pub fn row_str(row: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(v) = row.get(key) {
            let s = cell_string(v);
            if !s.is_empty() {
                return s;
            }
        }
    }
    String::new()
}

/// Like [row_str], but reports whether *any* alias was present — partial updates need to tell
/// "absent" apart from "present and empty".
pub fn row_has(row: &Value, keys: &[&str]) -> bool {
    keys.iter().any(|k| row.get(k).is_some())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_has_xlsx_magic() {
        let bytes = template_workbook(&["年度", "项目名称"]).unwrap();
        // .xlsx is a zip archive; PK\x03\x04.
        assert_eq!(&bytes[..4], b"PK\x03\x04");
    }

    #[test]
    fn cells_stringify_like_the_front_end() {
        assert_eq!(cell_string(&json!("  文号 ")), "文号");
        assert_eq!(cell_string(&json!(2025)), "2025");
        assert_eq!(cell_string(&json!(2025.5)), "2025.5");
        assert_eq!(cell_string(&json!(null)), "");
    }

    #[test]
    fn aliased_lookup() {
        let row = json!({"年度": 2025, "name": "老旧小区改造"});
        assert_eq!(row_str(&row, &["year", "年度"]), "2025");
        assert_eq!(row_str(&row, &["name", "项目名称"]), "老旧小区改造");
        assert_eq!(row_str(&row, &["department", "监督部门"]), "");
        assert!(row_has(&row, &["name"]));
        assert!(!row_has(&row, &["department", "监督部门"]));
    }
}
