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

//! # Progress-document API (民生实事进展资料)
//!
//! Per-department progress documents for the supervised projects. Pure attachment records:
//! every row exists because a file was uploaded. The `department` field is a by-name reference
//! into the department registry, which is what ties these records into the rename cascade.

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

use crate::entities::ProgressDoc;
use crate::http::{
    body_has, body_str, fail, fail_with, json_body, ok, require_auth, Jiandu, Result, StoreSnafu,
    UploadSnafu,
};
use crate::preview::docx_preview_response;
use crate::store::Collection;
use crate::uploads::{self, download_response, inline_response, receive};
use crate::util::{file_type_of, now_iso, parse_id, today_ymd};

pub struct ProgressDocs;

impl Collection for ProgressDocs {
    type Record = ProgressDoc;
    const FILE: &'static str = "minsheng_progress.json";
}

fn stored_file(
    state: &Jiandu,
    raw_id: &str,
) -> Result<std::result::Result<(ProgressDoc, std::path::PathBuf), axum::response::Response>> {
    let Some(id) = parse_id(raw_id) else {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "Not found")));
    };
    let doc = state.store.load::<ProgressDocs>().context(StoreSnafu)?;
    let Some(record) = doc.get(id).cloned() else {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "Not found")));
    };
    let path = uploads::PROGRESS.blob_path(state.store.root(), &record.file_path);
    if record.file_path.is_empty() || !path.exists() {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "文件不存在")));
    }
    Ok(Ok((record, path)))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let doc = state.store.load::<ProgressDocs>().context(StoreSnafu)?;
    Ok(ok(doc.items))
}

async fn get_one(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail_with(StatusCode::NOT_FOUND, "Not found"));
    };
    let doc = state.store.load::<ProgressDocs>().context(StoreSnafu)?;
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
    let department = form.field("department");
    if department.is_empty() {
        return Ok(fail("请填写监督部门"));
    }
    if let Err(msg) = uploads::PROGRESS.check_name(&file.name) {
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
    let stored = uploads::PROGRESS
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let created = state
        .store
        .update::<ProgressDocs, _, &str>(|doc| {
            let id = doc.allocate();
            let item = ProgressDoc {
                id,
                department: department.clone(),
                title: title.clone(),
                file_path: stored.file_path.clone(),
                original_name: file.name.clone(),
                file_type: file_type_of(&file.name),
                upload_date: upload_date.clone(),
                created_at: now_iso(),
                pinned: None,
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
        .update::<ProgressDocs, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("进展资料不存在");
            };
            if body_has(&body, "title") {
                let title = body_str(&body, "title");
                p.title = if title.is_empty() {
                    p.original_name.clone()
                } else {
                    title
                };
            }
            if body_has(&body, "department") {
                p.department = body_str(&body, "department");
            }
            if body_has(&body, "uploadDate") {
                p.upload_date = body_str(&body, "uploadDate");
            }
            if body_has(&body, "pinned") {
                p.pinned = Some(
                    body.get("pinned")
                        .map(|v| v.as_bool().unwrap_or(!v.is_null()))
                        .unwrap_or(false),
                );
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
    if let Err(msg) = uploads::PROGRESS.check_name(&file.name) {
        return Ok(fail(msg));
    }
    let stored = uploads::PROGRESS
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let outcome = state
        .store
        .update::<ProgressDocs, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("进展资料不存在");
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
            let department = form.field("department");
            if !department.is_empty() {
                p.department = department;
            }
            Ok((p.clone(), old))
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok((item, old)) => {
            if !old.is_empty() {
                uploads::PROGRESS.remove(state.store.root(), &old);
            }
            ok(item)
        }
        Err(msg) => {
            uploads::PROGRESS.remove(state.store.root(), &stored.file_path);
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
        .update::<ProgressDocs, _, &str>(|doc| doc.remove(id).ok_or("进展资料不存在"))
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(removed) => {
            uploads::PROGRESS.remove(state.store.root(), &removed.file_path);
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
        "pdf" => Ok(Redirect::to(&format!("/api/minsheng/progress/file/{}", record.id))
            .into_response()),
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
        .route("/api/minsheng/progress/upload", post(upload))
        .route("/api/minsheng/progress/{id}", put(update))
        .route("/api/minsheng/progress/{id}/replace-file", post(replace_file))
        .route("/api/minsheng/progress/{id}", delete(remove))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .route("/api/minsheng/progress", get(list))
        .route("/api/minsheng/progress/{id}", get(get_one))
        .route("/api/minsheng/progress/file/{id}", get(file))
        .route("/api/minsheng/progress/download/{id}", get(download))
        .route("/api/minsheng/progress/preview/{id}", get(preview))
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

    fn seed_record(state: &Jiandu, file_path: &str) -> u64 {
        state
            .store
            .update::<ProgressDocs, _, ()>(|doc| {
                let id = doc.allocate();
                doc.items.push(ProgressDoc {
                    id,
                    department: "住建局".to_owned(),
                    title: "进展".to_owned(),
                    file_path: file_path.to_owned(),
                    original_name: "进展.pdf".to_owned(),
                    file_type: "pdf".to_owned(),
                    upload_date: "2025-06-01".to_owned(),
                    created_at: now_iso(),
                    pinned: None,
                });
                Ok(id)
            })
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn delete_removes_metadata_and_blob() {
        let (_dir, state) = state();
        let stored = uploads::PROGRESS
            .store(state.store.root(), "进展.pdf", b"%PDF-")
            .unwrap();
        let blob = uploads::PROGRESS.blob_path(state.store.root(), &stored.file_path);
        let id = seed_record(&state, &stored.file_path);

        let rsp = remove(State(state.clone()), axum::extract::Path(id.to_string()))
            .await
            .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);
        assert!(state.store.load::<ProgressDocs>().unwrap().get(id).is_none());
        assert!(!blob.exists());
    }

    #[tokio::test]
    async fn update_backfills_title_from_original_name() {
        let (_dir, state) = state();
        let id = seed_record(&state, "minsheng_x.pdf");
        let rsp = update(
            State(state.clone()),
            axum::extract::Path(id.to_string()),
            Some(Json(json!({"title": "", "pinned": true}))),
        )
        .await
        .unwrap();
        let body = body_json(rsp).await;
        assert_eq!(body["data"]["title"], "进展.pdf");
        assert_eq!(body["data"]["pinned"], true);
    }
}
