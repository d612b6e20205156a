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

//! # preview
//!
//! In-browser preview of Word attachments: .docx in, styled HTML out. PDFs never come through
//! here (they stream inline); anything that isn't WordprocessingML is refused upstream. The
//! styling is the fixed SimSun sheet the office's operators expect — official-document
//! formatting, 2em first-line indents and all.

use axum::response::{Html, IntoResponse};
use docx_rs::{DocumentChild, Paragraph, ParagraphChild, RunChild};
use snafu::{prelude::*, Backtrace};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read the stored document: {source}"))]
    Read {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse the .docx document: {source}"))]
    Docx {
        source: docx_rs::ReaderError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

const PREVIEW_CSS: &str = "<style>body{font-family:SimSun,serif;font-size:16px;line-height:1.8;\
margin:0;padding:24px 48px}p{margin:0.5em 0;text-indent:2em}p:first-child{text-indent:0}\
h1,h2,h3{margin:1em 0 0.5em;font-weight:bold}table{border-collapse:collapse;width:100%;\
margin:1em 0}td,th{border:1px solid #333;padding:6px 10px;text-align:left}</style>";

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn paragraph_text(p: &Paragraph) -> String {
    p.children
        .iter()
        .filter_map(|child| match child {
            ParagraphChild::Run(run) => Some(
                run.children
                    .iter()
                    .filter_map(|rc| match rc {
                        RunChild::Text(t) => Some(t.text.as_str()),
                        _ => None,
                    })
                    .collect::<String>(),
            ),
            _ => None,
        })
        .collect()
}

/// The HTML tag for a paragraph, from its Word style name — the same mapping the original
/// service configured ("标题 1"/"Heading 1" families down to plain 正文).
fn tag_for_style(style: Option<&str>) -> &'static str {
    match style {
        Some("1") | Some("Heading1") | Some("heading 1") => "h1",
        Some("2") | Some("Heading2") | Some("heading 2") => "h2",
        Some("3") | Some("Heading3") | Some("heading 3") => "h3",
        _ => "p",
    }
}

/// Convert a .docx byte stream into a standalone preview page.
pub fn docx_to_html(bytes: &[u8]) -> Result<String> {
    let docx = docx_rs::read_docx(bytes).context(DocxSnafu)?;
    let mut body = String::new();
    for child in &docx.document.children {
        if let DocumentChild::Paragraph(p) = child {
            let text = paragraph_text(p);
            let tag = tag_for_style(p.property.style.as_ref().map(|s| s.val.as_str()));
            body.push_str(&format!("<{tag}>{}</{tag}>", escape(&text)));
        }
    }
    Ok(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">{PREVIEW_CSS}</head><body>{body}</body></html>"
    ))
}

/// Read the stored blob at `path` and return the preview page as a response.
pub fn docx_preview_response(path: &std::path::Path) -> Result<axum::response::Response> {
    let bytes = std::fs::read(path).context(ReadSnafu)?;
    Ok(Html(docx_to_html(&bytes)?).into_response())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn escaping() {
        assert_eq!(escape("a<b>&c"), "a&lt;b&gt;&amp;c");
    }

    #[test]
    fn style_mapping() {
        assert_eq!(tag_for_style(Some("1")), "h1");
        assert_eq!(tag_for_style(Some("Heading2")), "h2");
        assert_eq!(tag_for_style(Some("正文")), "p");
        assert_eq!(tag_for_style(None), "p");
    }

    #[test]
    fn renders_a_round_tripped_document() {
        // Build a document with docx-rs itself so the fixture can't rot.
        let mut buf = std::io::Cursor::new(Vec::new());
        docx_rs::Docx::new()
            .add_paragraph(
                docx_rs::Paragraph::new()
                    .add_run(docx_rs::Run::new().add_text("落实情况报告")),
            )
            .build()
            .pack(&mut buf)
            .unwrap();
        let html = docx_to_html(buf.get_ref()).unwrap();
        assert!(html.contains("落实情况报告"));
        assert!(html.contains("SimSun"));
    }
}
