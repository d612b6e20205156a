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

//! # util
//!
//! Much as I loathe catch-all "utility" modules, these little conversions are shared by half the
//! API modules and belong to none of them: spreadsheet date handling, filename repair, and the
//! date stamps that the record metadata carries.

use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};

use crate::store::RecordId;

/// Parse a textual record id; the API reports a soft "ID无效" failure rather than a 400 on
/// garbage, so this is an Option, not a Result.
pub fn parse_id(text: &str) -> Option<RecordId> {
    text.trim().parse::<RecordId>().ok()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        spreadsheet dates                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Convert an Excel 1900-system serial number to `YYYY-MM-DD`.
///
/// Spreadsheets hand us dates as day counts since 1899-12-31, with the infamous phantom
/// 1900-02-29 (Lotus 1-2-3 compatibility) thrown in; serials ≥ 60 must be shifted down by one.
/// Out-of-range values are returned as None and the caller keeps the original cell text.
pub fn excel_serial_to_ymd(serial: f64) -> Option<String> {
    if !serial.is_finite() || serial < 1.0 || serial > 2_958_465.0 {
        return None;
    }
    let mut days = serial.trunc() as i64;
    if days >= 60 {
        days -= 1;
    }
    // Day 1 is 1900-01-01.
    let base = NaiveDate::from_ymd_opt(1899, 12, 31)?;
    let date = base.checked_add_days(chrono::Days::new(days as u64))?;
    Some(format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month(),
        date.day()
    ))
}

/// Normalize a date cell that may hold either `YYYY-MM-DD` text or a bare Excel serial.
pub fn normalize_date_cell(text: &str) -> String {
    let s = text.trim();
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = s.parse::<f64>() {
            if let Some(ymd) = excel_serial_to_ymd(n) {
                return ymd;
            }
        }
    }
    s.to_owned()
}

/// Extract a leading four-digit year from a month string like "2025-03"; fall back to the
/// input itself, mirroring how the records were keyed historically.
pub fn year_from_month(month: &str) -> String {
    let s = month.trim();
    if s.len() >= 4 && s.as_bytes()[..4].iter().all(|b| b.is_ascii_digit()) {
        s[..4].to_owned()
    } else {
        s.to_owned()
    }
}

/// Today's date, local time, as `YYYY-MM-DD`; the default `uploadDate` for attachments.
pub fn today_ymd() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Current instant in RFC 3339/ISO 8601, UTC; the `createdAt` stamp on attachment records.
pub fn now_iso() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         filename repair                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn has_cjk(s: &str) -> bool {
    s.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

/// Repair a filename that was decoded as latin-1 somewhere along the multipart path.
///
/// Browsers occasionally deliver UTF-8 filenames byte-for-byte as latin-1, turning 报告.pdf into
/// mojibake. If the name carries no CJK but its latin-1 bytes decode to UTF-8 that does, the
/// decoded form is the real name.
pub fn repair_filename(name: &str) -> String {
    if name.is_empty() || has_cjk(name) {
        return name.to_owned();
    }
    if name.chars().any(|c| c as u32 > 0xff) {
        // Not a latin-1 round-trip candidate.
        return name.to_owned();
    }
    let bytes: Vec<u8> = name.chars().map(|c| c as u8).collect();
    match String::from_utf8(bytes) {
        Ok(decoded) if has_cjk(&decoded) => decoded,
        _ => name.to_owned(),
    }
}

/// Sanitize a user-facing download name: path separators and the Windows-reserved set become
/// underscores. Empty results fall back to "document".
pub fn sanitize_download_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    let cleaned = cleaned.trim().to_owned();
    if cleaned.is_empty() {
        "document".to_owned()
    } else {
        cleaned
    }
}

/// The lower-cased extension of `name`, with the dot ("" when there is none).
pub fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

/// `fileType` as the records carry it: the extension without its dot, defaulting to "pdf".
pub fn file_type_of(name: &str) -> String {
    let ext = extension_of(name);
    let bare = ext.trim_start_matches('.');
    if bare.is_empty() {
        "pdf".to_owned()
    } else {
        bare.to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn excel_serials() {
        // 2023-06-15 is serial 45092 in the 1900 date system.
        assert_eq!(excel_serial_to_ymd(45092.0).unwrap(), "2023-06-15");
        // Serial 1 is the epoch itself.
        assert_eq!(excel_serial_to_ymd(1.0).unwrap(), "1900-01-01");
        // Serial 61 is 1900-03-01 (the phantom leap day sits at 60).
        assert_eq!(excel_serial_to_ymd(61.0).unwrap(), "1900-03-01");
        assert!(excel_serial_to_ymd(0.0).is_none());
        assert!(excel_serial_to_ymd(3_000_000.0).is_none());
    }

    #[test]
    fn date_cells() {
        assert_eq!(normalize_date_cell("2024-01-31"), "2024-01-31");
        assert_eq!(normalize_date_cell(" 45092 "), "2023-06-15");
        // Non-numeric text passes through untouched.
        assert_eq!(normalize_date_cell("第三期"), "第三期");
    }

    #[test]
    fn year_extraction() {
        assert_eq!(year_from_month("2025-03"), "2025");
        assert_eq!(year_from_month("2025"), "2025");
        assert_eq!(year_from_month("三月"), "三月");
        assert_eq!(year_from_month(""), "");
    }

    #[test]
    fn mojibake_repair() {
        // 报告.pdf, UTF-8 bytes re-read as latin-1.
        let mangled: String = "报告.pdf".bytes().map(|b| b as char).collect();
        assert_eq!(repair_filename(&mangled), "报告.pdf");
        // Already-correct names are left alone.
        assert_eq!(repair_filename("报告.pdf"), "报告.pdf");
        assert_eq!(repair_filename("plain.pdf"), "plain.pdf");
    }

    #[test]
    fn download_names() {
        assert_eq!(sanitize_download_name("a/b:c*d.pdf"), "a_b_c_d.pdf");
        assert_eq!(sanitize_download_name("   "), "document");
    }

    #[test]
    fn file_types() {
        assert_eq!(file_type_of("报告.DOCX"), "docx");
        assert_eq!(file_type_of("noext"), "pdf");
        assert_eq!(extension_of("x.PDF"), ".pdf");
    }
}
