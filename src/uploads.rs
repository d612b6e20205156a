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

//! # uploads
//!
//! Attachment storage. Each attachment-bearing collection owns one directory under
//! `<database>/uploads/`, created lazily, holding blobs under generated collision-resistant
//! names; the JSON records hold only the generated name plus the user's original filename. The
//! metadata is the record of truth: blob deletion is always best-effort, and a vanished blob is
//! a 404 at read time, never a crash.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    result::Result as StdResult,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::Multipart,
    http::{header, StatusCode},
    response::IntoResponse,
};
use lazy_static::lazy_static;
use rand::{distributions::Alphanumeric, Rng};
use snafu::{prelude::*, Backtrace};
use tracing::debug;

use crate::util::{extension_of, file_type_of, repair_filename};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create upload directory {}: {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to store uploaded file {}: {source}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read stored file {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read the multipart request body: {source}"))]
    Multipart {
        source: axum::extract::multipart::MultipartError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          upload areas                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

const PDF_ONLY: &[&str] = &[".pdf"];
const DOCUMENTS: &[&str] = &[".pdf", ".doc", ".docx"];

/// One collection's corner of the upload tree.
pub struct UploadArea {
    /// Directory name under `uploads/`.
    pub dir: &'static str,
    /// Prefix on generated blob names; keeps stray files attributable when inspecting the disk.
    pub prefix: &'static str,
    pub allowed: &'static [&'static str],
    pub reject_msg: &'static str,
}

pub const MONTHLY: UploadArea = UploadArea {
    dir: "meiyue",
    prefix: "meiyue",
    allowed: PDF_ONLY,
    reject_msg: "仅支持 PDF 格式",
};

pub const WEEKLY: UploadArea = UploadArea {
    dir: "meizhou",
    prefix: "meizhou",
    allowed: PDF_ONLY,
    reject_msg: "仅支持 PDF 格式",
};

pub const STATUTES: UploadArea = UploadArea {
    dir: "falv",
    prefix: "falv",
    allowed: DOCUMENTS,
    reject_msg: "仅支持 PDF、DOC、DOCX 格式",
};

pub const PROGRESS: UploadArea = UploadArea {
    dir: "minsheng",
    prefix: "minsheng",
    allowed: DOCUMENTS,
    reject_msg: "仅支持 PDF、DOC、DOCX 格式",
};

pub const REPORTS: UploadArea = UploadArea {
    dir: "pishi_report",
    prefix: "pishi",
    allowed: DOCUMENTS,
    reject_msg: "仅支持 PDF、DOC、DOCX 格式",
};

pub const TOPICS: UploadArea = UploadArea {
    dir: "jiandu_topics",
    prefix: "jiandu",
    allowed: DOCUMENTS,
    reject_msg: "仅支持 PDF、DOC、DOCX 格式",
};

/// What [UploadArea::store] recorded about a freshly-stored blob.
pub struct Stored {
    pub file_path: String,
    pub file_type: String,
}

impl UploadArea {
    pub fn dir_path(&self, root: &Path) -> PathBuf {
        root.join("uploads").join(self.dir)
    }

    pub fn blob_path(&self, root: &Path, name: &str) -> PathBuf {
        self.dir_path(root).join(name)
    }

    /// Enforce the extension whitelist; the message is the soft-failure text for the caller.
    pub fn check_name(&self, original_name: &str) -> StdResult<(), &'static str> {
        let ext = extension_of(original_name);
        if self.allowed.contains(&ext.as_str()) {
            Ok(())
        } else {
            Err(self.reject_msg)
        }
    }

    /// Store `bytes` under a generated name: `<prefix>_<millis>_<entropy><ext>`.
    pub fn store(&self, root: &Path, original_name: &str, bytes: &[u8]) -> Result<Stored> {
        let dir = self.dir_path(root);
        if !dir.exists() {
            std::fs::create_dir_all(&dir).context(CreateDirSnafu { path: dir.clone() })?;
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let entropy: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect();
        let mut ext = extension_of(original_name);
        if ext.is_empty() {
            ext = ".pdf".to_owned();
        }
        let file_path = format!("{}_{}_{}{}", self.prefix, millis, entropy, ext);
        let path = dir.join(&file_path);
        std::fs::write(&path, bytes).context(WriteSnafu { path })?;
        Ok(Stored {
            file_path,
            file_type: file_type_of(original_name),
        })
    }

    /// Best-effort blob removal. The metadata is authoritative, so a blob that's already gone —
    /// or undeletable — is logged and forgotten.
    pub fn remove(&self, root: &Path, name: &str) {
        if name.is_empty() {
            return;
        }
        let path = self.blob_path(root, name);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!("Couldn't remove {}: {}.", path.display(), err);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       multipart intake                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct IncomingFile {
    /// The browser-supplied name, after charset repair.
    pub name: String,
    pub bytes: axum::body::Bytes,
}

/// A parsed upload form: at most one `file` part plus the accompanying text fields.
pub struct Incoming {
    pub file: Option<IncomingFile>,
    pub fields: HashMap<String, String>,
}

impl Incoming {
    pub fn field(&self, name: &str) -> String {
        self.fields
            .get(name)
            .map(|s| s.trim().to_owned())
            .unwrap_or_default()
    }
    /// Was the field present at all? Present-but-empty and absent differ for partial updates.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

pub async fn receive(mut multipart: Multipart) -> Result<Incoming> {
    let mut file = None;
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.context(MultipartSnafu)? {
        let name = field.name().unwrap_or_default().to_owned();
        if name == "file" {
            let raw_name = field.file_name().unwrap_or_default().to_owned();
            let bytes = field.bytes().await.context(MultipartSnafu)?;
            file = Some(IncomingFile {
                name: repair_filename(&raw_name),
                bytes,
            });
        } else {
            let text = field.text().await.context(MultipartSnafu)?;
            fields.insert(name, text);
        }
    }
    Ok(Incoming { file, fields })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      file-backed responses                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref CONTENT_TYPES: HashMap<&'static str, &'static str> = HashMap::from([
        ("pdf", "application/pdf"),
        ("doc", "application/msword"),
        (
            "docx",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        ),
    ]);
}

pub fn content_type_for(file_type: &str) -> &'static str {
    CONTENT_TYPES
        .get(file_type)
        .copied()
        .unwrap_or("application/octet-stream")
}

/// Serve a stored blob inline (the PDF viewer path).
pub fn inline_response(path: &Path, file_type: &str) -> Result<axum::response::Response> {
    let body = std::fs::read(path).context(ReadSnafu { path })?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for(file_type).to_owned()),
            (header::CONTENT_DISPOSITION, "inline".to_owned()),
        ],
        body,
    )
        .into_response())
}

/// Serve a stored blob as a forced download.
///
/// `ascii_fallback` is the plain `filename=` value for clients that don't speak RFC 5987;
/// `display_name` — reconstructed from record metadata, never the generated blob name — rides in
/// `filename*` percent-encoded.
pub fn download_response(
    path: &Path,
    file_type: &str,
    ascii_fallback: &str,
    display_name: &str,
) -> Result<axum::response::Response> {
    let body = std::fs::read(path).context(ReadSnafu { path })?;
    let disposition = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_fallback,
        urlencoding::encode(display_name)
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for(file_type).to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extension_whitelists() {
        assert!(WEEKLY.check_name("周报.pdf").is_ok());
        assert_eq!(WEEKLY.check_name("周报.docx"), Err("仅支持 PDF 格式"));
        assert!(STATUTES.check_name("条例.DOCX").is_ok());
        assert!(STATUTES.check_name("条例.xlsx").is_err());
    }

    #[test]
    fn store_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let stored = STATUTES.store(root, "条例.pdf", b"%PDF-").unwrap();
        assert!(stored.file_path.starts_with("falv_"));
        assert!(stored.file_path.ends_with(".pdf"));
        assert_eq!(stored.file_type, "pdf");
        let blob = STATUTES.blob_path(root, &stored.file_path);
        assert!(blob.exists());

        STATUTES.remove(root, &stored.file_path);
        assert!(!blob.exists());
        // Removing again must be silent.
        STATUTES.remove(root, &stored.file_path);
    }

    #[test]
    fn generated_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = MONTHLY.store(dir.path(), "a.pdf", b"a").unwrap();
        let b = MONTHLY.store(dir.path(), "a.pdf", b"b").unwrap();
        assert_ne!(a.file_path, b.file_path);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("pdf"), "application/pdf");
        assert_eq!(content_type_for("zip"), "application/octet-stream");
    }
}
