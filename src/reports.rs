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

//! # Directive-report API (批示办理情况报告)
//!
//! Uploaded handling reports for the leadership directives. Structurally the little sibling of
//! [crate::progress] — attachment records with a title and an upload date, no department
//! linkage.

use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Redirect},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use snafu::prelude::*;

use crate::entities::DirectiveReport;
use crate::http::{
    body_has, body_str, fail, fail_with, json_body, ok, require_auth, Jiandu, Result, StoreSnafu,
    UploadSnafu,
};
use crate::preview::docx_preview_response;
use crate::store::Collection;
use crate::uploads::{self, download_response, inline_response, receive};
use crate::util::{file_type_of, now_iso, parse_id, today_ymd};

pub struct DirectiveReports;

impl Collection for DirectiveReports {
    type Record = DirectiveReport;
    const FILE: &'static str = "pishi_report.json";
}

fn stored_file(
    state: &Jiandu,
    raw_id: &str,
) -> Result<std::result::Result<(DirectiveReport, std::path::PathBuf), axum::response::Response>> {
    let Some(id) = parse_id(raw_id) else {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "Not found")));
    };
    let doc = state.store.load::<DirectiveReports>().context(StoreSnafu)?;
    let Some(record) = doc.get(id).cloned() else {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "Not found")));
    };
    let path = uploads::REPORTS.blob_path(state.store.root(), &record.file_path);
    if record.file_path.is_empty() || !path.exists() {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "文件不存在")));
    }
    Ok(Ok((record, path)))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let doc = state.store.load::<DirectiveReports>().context(StoreSnafu)?;
    Ok(ok(doc.items))
}

async fn get_one(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail_with(StatusCode::NOT_FOUND, "Not found"));
    };
    let doc = state.store.load::<DirectiveReports>().context(StoreSnafu)?;
    match doc.get(id) {
        Some(p) => Ok(ok(p.clone())),
        None => Ok(fail_with(StatusCode::NOT_FOUND, "Not found")),
    }
}

async fn upload(
    State(state): State<Arc<Jiandu>>,
    multipart: Multipart,
) -> Result<axum::response::Response> {
    let form = receive(multipart).await.context(UploadSnafu)?;
    let Some(ref file) = form.file else {
        return Ok(fail("请选择要上传的文件"));
    };
    if let Err(msg) = uploads::REPORTS.check_name(&file.name) {
        return Ok(fail(msg));
    }
    let title = {
        let t = form.field("title");
        if t.is_empty() {
            file.name.clone()
        } else {
            t
        }
    };
    let upload_date = {
        let d = form.field("uploadDate");
        if d.is_empty() {
            today_ymd()
        } else {
            d
        }
    };
    let stored = uploads::REPORTS
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let created = state
        .store
        .update::<DirectiveReports, _, &str>(|doc| {
            let id = doc.allocate();
            let item = DirectiveReport {
                id,
                title: title.clone(),
                file_path: stored.file_path.clone(),
                original_name: file.name.clone(),
                file_type: file_type_of(&file.name),
                upload_date: upload_date.clone(),
                created_at: now_iso(),
            };
            doc.items.push(item.clone());
            Ok(item)
        })
        .context(StoreSnafu)?;
    Ok(match created {
        Ok(item) => ok(item),
        Err(msg) => fail(msg),
    })
}

async fn update(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail("ID无效"));
    };
    let body = json_body(body);
    let outcome = state
        .store
        .update::<DirectiveReports, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("报告不存在");
            };
            if body_has(&body, "title") {
                let title = body_str(&body, "title");
                p.title = if title.is_empty() {
                    p.original_name.clone()
                } else {
                    title
                };
            }
            if body_has(&body, "uploadDate") {
                p.upload_date = body_str(&body, "uploadDate");
            }
            Ok(p.clone())
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(item) => ok(item),
        Err(msg) => fail(msg),
    })
}

async fn replace_file(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
    multipart: Multipart,
) -> Result<axum::response::Response> {
    let form = receive(multipart).await.context(UploadSnafu)?;
    let Some(ref file) = form.file else {
        return Ok(fail("请选择要上传的文件"));
    };
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail("ID无效"));
    };
    if let Err(msg) = uploads::REPORTS.check_name(&file.name) {
        return Ok(fail(msg));
    }
    let stored = uploads::REPORTS
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let outcome = state
        .store
        .update::<DirectiveReports, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("报告不存在");
            };
            let old = std::mem::take(&mut p.file_path);
            p.file_path = stored.file_path.clone();
            p.original_name = file.name.clone();
            p.file_type = file_type_of(&file.name);
            let title = form.field("title");
            p.title = if title.is_empty() {
                file.name.clone()
            } else {
                title
            };
            let upload_date = form.field("uploadDate");
            if !upload_date.is_empty() {
                p.upload_date = upload_date;
            }
            Ok((p.clone(), old))
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok((item, old)) => {
            if !old.is_empty() {
                uploads::REPORTS.remove(state.store.root(), &old);
            }
            ok(item)
        }
        Err(msg) => {
            uploads::REPORTS.remove(state.store.root(), &stored.file_path);
            fail(msg)
        }
    })
}

async fn remove(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail("ID无效"));
    };
    let outcome = state
        .store
        .update::<DirectiveReports, _, &str>(|doc| doc.remove(id).ok_or("报告不存在"))
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(removed) => {
            uploads::REPORTS.remove(state.store.root(), &removed.file_path);
            ok(json!({"deleted": id}))
        }
        Err(msg) => fail(msg),
    })
}

async fn file(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let (record, path) = match stored_file(&state, &raw_id)? {
        Ok(found) => found,
        Err(rsp) => return Ok(rsp),
    };
    inline_response(&path, &record.file_type).context(UploadSnafu)
}

async fn download(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let (record, path) = match stored_file(&state, &raw_id)? {
        Ok(found) => found,
        Err(rsp) => return Ok(rsp),
    };
    let name = if !record.original_name.is_empty() {
        record.original_name.clone()
    } else if !record.file_path.is_empty() {
        record.file_path.clone()
    } else {
        "download".to_owned()
    };
    download_response(&path, &record.file_type, "download", &name).context(UploadSnafu)
}

async fn preview(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let (record, path) = match stored_file(&state, &raw_id)? {
        Ok(found) => found,
        Err(rsp) => return Ok(rsp),
    };
    match record.file_type.as_str() {
        "pdf" => Ok(
            Redirect::to(&format!("/api/pishi/report/file/{}", record.id)).into_response(),
        ),
        "doc" | "docx" => Ok(docx_preview_response(&path).unwrap_or_else(|err| {
            fail_with(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Word 文档预览失败：{}", err),
            )
        })),
        _ => Ok(fail_with(StatusCode::BAD_REQUEST, "不支持预览")),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router(state: Arc<Jiandu>) -> Router<Arc<Jiandu>> {
    let protected = Router::new()
        .route("/api/pishi/report/upload", post(upload))
        .route("/api/pishi/report/{id}", put(update))
        .route("/api/pishi/report/{id}/replace-file", post(replace_file))
        .route("/api/pishi/report/{id}", delete(remove))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .route("/api/pishi/report", get(list))
        .route("/api/pishi/report/{id}", get(get_one))
        .route("/api/pishi/report/file/{id}", get(file))
        .route("/api/pishi/report/download/{id}", get(download))
        .route("/api/pishi/report/preview/{id}", get(preview))
        .merge(protected)
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sessions::SessionRegistry;
    use crate::store::Store;

    fn state() -> (tempfile::TempDir, Arc<Jiandu>) {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(Jiandu {
            store: Store::new(dir.path(), "jiandu"),
            sessions: SessionRegistry::new(),
            instance_id: uuid::Uuid::new_v4(),
        });
        (dir, state)
    }

    async fn body_json(rsp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn replace_swaps_the_blob() {
        let (_dir, state) = state();
        let first = uploads::REPORTS
            .store(state.store.root(), "报告.pdf", b"v1")
            .unwrap();
        let first_blob = uploads::REPORTS.blob_path(state.store.root(), &first.file_path);
        let id = state
            .store
            .update::<DirectiveReports, _, ()>(|doc| {
                let id = doc.allocate();
                doc.items.push(DirectiveReport {
                    id,
                    title: "一季度".to_owned(),
                    file_path: first.file_path.clone(),
                    original_name: "报告.pdf".to_owned(),
                    file_type: "pdf".to_owned(),
                    upload_date: "2025-04-01".to_owned(),
                    created_at: now_iso(),
                });
                Ok(id)
            })
            .unwrap()
            .unwrap();

        // Simulate what the replace handler does past the multipart edge.
        let second = uploads::REPORTS
            .store(state.store.root(), "报告v2.pdf", b"v2")
            .unwrap();
        let outcome = state
            .store
            .update::<DirectiveReports, _, &str>(|doc| {
                let p = doc.get_mut(id).ok_or("报告不存在")?;
                let old = std::mem::take(&mut p.file_path);
                p.file_path = second.file_path.clone();
                p.original_name = "报告v2.pdf".to_owned();
                Ok(old)
            })
            .unwrap()
            .unwrap();
        uploads::REPORTS.remove(state.store.root(), &outcome);
        assert!(!first_blob.exists());
        assert!(uploads::REPORTS
            .blob_path(state.store.root(), &second.file_path)
            .exists());
    }

    #[tokio::test]
    async fn missing_records_404_on_file_routes() {
        let (_dir, state) = state();
        let rsp = file(State(state), axum::extract::Path("99".to_owned()))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(rsp).await["msg"], "Not found");
    }
}
