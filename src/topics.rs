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

//! # Supervision-topic API (监督议题)
//!
//! The yearly supervision plan: topics carrying a form of supervision from a fixed five-entry
//! vocabulary, each with its own attached document collection. Two linked collections live
//! here — topics and topic files — and deleting a topic cascades into its files *and* their
//! blobs. The display order of the five supervision forms is itself persisted (the office
//! argues about it), as a singleton document.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Redirect},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snafu::prelude::*;
use tracing::warn;

use crate::entities::{Topic, TopicFile};
use crate::http::{
    body_has, body_str, fail, fail_with, json_body, ok, require_auth, Jiandu, Result, StoreSnafu,
    TemplateSnafu, UploadSnafu,
};
use crate::preview::docx_preview_response;
use crate::store::{self, Collection, Document, Singleton};
use crate::tabular::{row_str, template_response};
use crate::uploads::{self, download_response, inline_response, receive};
use crate::util::{file_type_of, now_iso, parse_id, today_ymd};

/// The five forms of supervision, in their statutory order.
pub const FORM_OPTIONS: [&str; 5] = [
    "听取审议报告",
    "财经工作监督",
    "执法检查",
    "专题询问",
    "视察",
];

pub const HEADERS: [&str; 5] = ["年度", "月份", "监督内容", "监督形式", "部门/处室"];

pub struct Topics;

impl Collection for Topics {
    type Record = Topic;
    const FILE: &'static str = "jiandu_topics.json";
}

pub struct TopicFiles;

impl Collection for TopicFiles {
    type Record = TopicFile;
    const FILE: &'static str = "jiandu_topic_files.json";
}

fn default_order() -> Vec<String> {
    FORM_OPTIONS.iter().map(|s| (*s).to_owned()).collect()
}

/// The persisted display order of the supervision forms.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FormOrder {
    #[serde(default = "default_order")]
    pub order: Vec<String>,
}

pub struct FormSort;

impl Singleton for FormSort {
    type Data = FormOrder;
    const FILE: &'static str = "form_sort.json";
    fn seed() -> FormOrder {
        FormOrder {
            order: default_order(),
        }
    }
}

fn clamp_month(text: &str) -> u32 {
    match text.trim().parse::<u32>() {
        Ok(m) if (1..=12).contains(&m) => m,
        _ => 0,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             topics                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list(
    State(state): State<Arc<Jiandu>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<axum::response::Response> {
    let doc = state.store.load::<Topics>().context(StoreSnafu)?;
    let mut listing = doc.items;
    if let Some(year) = params
        .get("year")
        .and_then(|s| s.trim().parse::<i32>().ok())
    {
        listing.retain(|t| t.year == year);
    }
    Ok(ok(listing))
}

async fn create(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let year: i32 = body_str(&body, "year").parse().unwrap_or(0);
    let month = clamp_month(&body_str(&body, "month"));
    let content = body_str(&body, "content");
    let form = body_str(&body, "form");
    let department = body_str(&body, "department");
    if year == 0 || content.is_empty() || form.is_empty() || department.is_empty() {
        return Ok(fail("年度、监督内容、监督形式、部门/处室不能为空"));
    }
    if !FORM_OPTIONS.contains(&form.as_str()) {
        return Ok(fail("监督形式无效"));
    }
    let created = state
        .store
        .update::<Topics, _, &str>(|doc| {
            let id = doc.allocate();
            let item = Topic {
                id,
                year,
                month,
                content: content.clone(),
                form: form.clone(),
                department: department.clone(),
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
        .update::<Topics, _, &str>(|doc| {
            let Some(t) = doc.get_mut(id) else {
                return Err("议题不存在");
            };
            if body_has(&body, "year") {
                if let Ok(year) = body_str(&body, "year").parse::<i32>() {
                    if year != 0 {
                        t.year = year;
                    }
                }
            }
            if body_has(&body, "month") {
                t.month = clamp_month(&body_str(&body, "month"));
            }
            if body_has(&body, "content") {
                t.content = body_str(&body, "content");
            }
            if body_has(&body, "form") {
                let form = body_str(&body, "form");
                if FORM_OPTIONS.contains(&form.as_str()) {
                    t.form = form;
                }
            }
            if body_has(&body, "department") {
                t.department = body_str(&body, "department");
            }
            Ok(t.clone())
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(item) => ok(item),
        Err(msg) => fail(msg),
    })
}

/// Delete a topic and cascade into its attached files (records and blobs alike).
async fn remove(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail("ID无效"));
    };
    let store = &state.store;
    let outcome: std::result::Result<std::result::Result<Vec<String>, &str>, store::Error> =
        store.with_locks(&[Topics::FILE, TopicFiles::FILE], || {
            let mut topics = store.load::<Topics>()?;
            if topics.remove(id).is_none() {
                return Ok(Err("议题不存在"));
            }
            let mut files = store.load::<TopicFiles>()?;
            let orphans: Vec<String> = files
                .items
                .iter()
                .filter(|f| f.topic_id == id)
                .map(|f| f.file_path.clone())
                .collect();
            files.items.retain(|f| f.topic_id != id);
            store.save::<Topics>(&topics)?;
            store.save::<TopicFiles>(&files)?;
            Ok(Ok(orphans))
        });
    Ok(match outcome.context(StoreSnafu)? {
        Ok(orphans) => {
            for orphan in orphans {
                uploads::TOPICS.remove(state.store.root(), &orphan);
            }
            ok(json!({"deleted": id}))
        }
        Err(msg) => fail(msg),
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          topic files                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list_files(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_topic_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(topic_id) = parse_id(&raw_topic_id) else {
        return Ok(ok(Vec::<TopicFile>::new()));
    };
    let doc = state.store.load::<TopicFiles>().context(StoreSnafu)?;
    let listing: Vec<TopicFile> = doc
        .items
        .into_iter()
        .filter(|f| f.topic_id == topic_id)
        .collect();
    Ok(ok(listing))
}

async fn upload_file(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_topic_id): axum::extract::Path<String>,
    multipart: Multipart,
) -> Result<axum::response::Response> {
    let form = receive(multipart).await.context(UploadSnafu)?;
    let Some(ref file) = form.file else {
        return Ok(fail("请选择要上传的文件"));
    };
    let Some(topic_id) = parse_id(&raw_topic_id) else {
        return Ok(fail("议题ID无效"));
    };
    let topics = state.store.load::<Topics>().context(StoreSnafu)?;
    if topics.get(topic_id).is_none() {
        return Ok(fail("议题不存在"));
    }
    if let Err(msg) = uploads::TOPICS.check_name(&file.name) {
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
    let stored = uploads::TOPICS
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let created = state
        .store
        .update::<TopicFiles, _, &str>(|doc| {
            let id = doc.allocate();
            let item = TopicFile {
                id,
                topic_id,
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

async fn remove_file(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail("ID无效"));
    };
    let outcome = state
        .store
        .update::<TopicFiles, _, &str>(|doc| doc.remove(id).ok_or("文件不存在"))
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(removed) => {
            uploads::TOPICS.remove(state.store.root(), &removed.file_path);
            ok(json!({"deleted": id}))
        }
        Err(msg) => fail(msg),
    })
}

fn stored_file(
    state: &Jiandu,
    raw_id: &str,
) -> Result<std::result::Result<(TopicFile, std::path::PathBuf), axum::response::Response>> {
    let Some(id) = parse_id(raw_id) else {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "Not found")));
    };
    let doc = state.store.load::<TopicFiles>().context(StoreSnafu)?;
    let Some(record) = doc.get(id).cloned() else {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "Not found")));
    };
    let path = uploads::TOPICS.blob_path(state.store.root(), &record.file_path);
    if record.file_path.is_empty() || !path.exists() {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "文件不存在")));
    }
    Ok(Ok((record, path)))
}

async fn get_file_record(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail_with(StatusCode::NOT_FOUND, "Not found"));
    };
    let doc = state.store.load::<TopicFiles>().context(StoreSnafu)?;
    match doc.get(id) {
        Some(f) => Ok(ok(f.clone())),
        None => Ok(fail_with(StatusCode::NOT_FOUND, "Not found")),
    }
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

async fn preview(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let (record, path) = match stored_file(&state, &raw_id)? {
        Ok(found) => found,
        Err(rsp) => return Ok(rsp),
    };
    let file_route = format!("/api/jiandu/topics/files/{}/file", record.id);
    match record.file_type.as_str() {
        "pdf" => Ok(Redirect::to(&file_route).into_response()),
        "doc" | "docx" => Ok(docx_preview_response(&path)
            .unwrap_or_else(|_| fail_with(StatusCode::INTERNAL_SERVER_ERROR, "Word 预览失败"))),
        // Anything else falls through to the raw file.
        _ => Ok(Redirect::to(&file_route).into_response()),
    }
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

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     form options & order                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The five forms in their persisted display order. Falls back to the statutory order rather
/// than failing — the front-end can't render its filters without it.
async fn form_options(State(state): State<Arc<Jiandu>>) -> axum::response::Response {
    match state.store.load_singleton::<FormSort>() {
        Ok(data) => ok(data.order),
        Err(err) => {
            warn!("Falling back to the default form order: {}.", err);
            ok(default_order())
        }
    }
}

async fn get_form_sort(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let data = state.store.load_singleton::<FormSort>().context(StoreSnafu)?;
    Ok(ok(data.order))
}

async fn put_form_sort(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let Some(order) = body.get("order").and_then(Value::as_array) else {
        return Ok(fail("排序数组必须包含5项"));
    };
    if order.len() != FORM_OPTIONS.len() {
        return Ok(fail("排序数组必须包含5项"));
    }
    let order: Vec<String> = order
        .iter()
        .map(|v| v.as_str().unwrap_or_default().to_owned())
        .collect();
    if order.iter().any(|o| !FORM_OPTIONS.contains(&o.as_str())) {
        return Ok(fail("包含无效的监督形式"));
    }
    state
        .store
        .update_singleton::<FormSort, _, &str>(|data| {
            data.order = order.clone();
            Ok(())
        })
        .context(StoreSnafu)?
        .ok();
    Ok(ok(json!({"order": order})))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                 backup / restore / import                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn backup(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let doc = state.store.load::<Topics>().context(StoreSnafu)?;
    Ok(ok(doc.items))
}

async fn restore(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let Some(items) = body.get("data").and_then(Value::as_array) else {
        return Ok(fail("备份数据格式错误"));
    };
    let current_year = chrono::Local::now().year();
    let restored: Vec<Topic> = items
        .iter()
        .map(|item| {
            let form = {
                let f = row_str(item, &["form"]);
                if FORM_OPTIONS.contains(&f.as_str()) {
                    f
                } else {
                    FORM_OPTIONS[0].to_owned()
                }
            };
            Topic {
                id: item.get("id").and_then(Value::as_u64).unwrap_or(0),
                year: row_str(item, &["year"]).parse().unwrap_or(current_year),
                month: clamp_month(&row_str(item, &["month"])),
                content: row_str(item, &["content"]),
                form,
                department: row_str(item, &["department"]),
            }
        })
        .collect();
    let count = restored.len();
    state
        .store
        .update::<Topics, _, &str>(|doc| {
            *doc = Document::restore(restored.clone());
            Ok(())
        })
        .context(StoreSnafu)?
        .ok();
    Ok(ok(json!({"restored": count})))
}

async fn import(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let Some(rows) = body.get("rows").and_then(Value::as_array).filter(|r| !r.is_empty())
    else {
        return Ok(fail("请上传有效数据"));
    };
    let rows = rows.clone();
    let added = state
        .store
        .update::<Topics, _, &str>(|doc| {
            let mut added = 0usize;
            for row in &rows {
                let year: i32 = row_str(row, &["year", "年度"]).parse().unwrap_or(0);
                let content = row_str(row, &["content", "监督内容"]);
                let mut form = row_str(row, &["form", "监督形式"]);
                let department = row_str(row, &["department", "部门/处室"]);
                if year == 0 || content.is_empty() || form.is_empty() || department.is_empty() {
                    continue;
                }
                // Imports forgive an off-vocabulary form; interactive creation rejects it.
                if !FORM_OPTIONS.contains(&form.as_str()) {
                    form = FORM_OPTIONS[0].to_owned();
                }
                let id = doc.allocate();
                doc.items.push(Topic {
                    id,
                    year,
                    month: clamp_month(&row_str(row, &["month", "月份"])),
                    content,
                    form,
                    department,
                });
                added += 1;
            }
            Ok(added)
        })
        .context(StoreSnafu)?
        .unwrap_or(0);
    Ok(ok(json!({"imported": added})))
}

async fn template() -> Result<axum::response::Response> {
    template_response(&HEADERS, "jiandu_topics_template.xlsx").context(TemplateSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router(state: Arc<Jiandu>) -> Router<Arc<Jiandu>> {
    let protected = Router::new()
        .route("/api/jiandu/topics", post(create))
        .route("/api/jiandu/topics/{id}", put(update))
        .route("/api/jiandu/topics/{id}", delete(remove))
        .route("/api/jiandu/topics/{topicId}/files/upload", post(upload_file))
        .route("/api/jiandu/topics/files/{id}", delete(remove_file))
        .route("/api/jiandu/backup", get(backup))
        .route("/api/jiandu/restore", post(restore))
        .route("/api/jiandu/topics/import", post(import))
        .route("/api/form-sort", put(put_form_sort))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .route("/api/jiandu/topics", get(list))
        .route("/api/jiandu/topics/{topicId}/files", get(list_files))
        .route("/api/jiandu/topics/files/{id}", get(get_file_record))
        .route("/api/jiandu/topics/files/{id}/file", get(file))
        .route("/api/jiandu/topics/files/{id}/preview", get(preview))
        .route("/api/jiandu/topics/files/{id}/download", get(download))
        .route("/api/jiandu/form-options", get(form_options))
        .route("/api/form-sort", get(get_form_sort))
        .route("/api/jiandu/template", get(template))
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
    async fn off_vocabulary_forms_are_rejected() {
        let (_dir, state) = state();
        let rsp = create(
            State(state),
            Some(Json(json!({
                "year": 2025, "month": 4, "content": "预算执行情况",
                "form": "暗访", "department": "财经处"
            }))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["msg"], "监督形式无效");
    }

    #[tokio::test]
    async fn deleting_a_topic_cascades_to_its_files() {
        let (_dir, state) = state();
        let rsp = create(
            State(state.clone()),
            Some(Json(json!({
                "year": 2025, "month": 4, "content": "预算执行情况",
                "form": "执法检查", "department": "财经处"
            }))),
        )
        .await
        .unwrap();
        let topic_id = body_json(rsp).await["data"]["id"].as_u64().unwrap();

        let stored = uploads::TOPICS
            .store(state.store.root(), "纪要.pdf", b"%PDF-")
            .unwrap();
        let blob = uploads::TOPICS.blob_path(state.store.root(), &stored.file_path);
        state
            .store
            .update::<TopicFiles, _, ()>(|doc| {
                let id = doc.allocate();
                doc.items.push(TopicFile {
                    id,
                    topic_id,
                    title: "纪要".to_owned(),
                    file_path: stored.file_path.clone(),
                    original_name: "纪要.pdf".to_owned(),
                    file_type: "pdf".to_owned(),
                    upload_date: today_ymd(),
                    created_at: now_iso(),
                });
                Ok(())
            })
            .unwrap()
            .unwrap();

        let rsp = remove(
            State(state.clone()),
            axum::extract::Path(topic_id.to_string()),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);
        assert!(state.store.load::<Topics>().unwrap().get(topic_id).is_none());
        assert!(state.store.load::<TopicFiles>().unwrap().items.is_empty());
        assert!(!blob.exists());
    }

    #[tokio::test]
    async fn form_order_round_trips_and_validates() {
        let (_dir, state) = state();
        let reordered = ["视察", "执法检查", "听取审议报告", "财经工作监督", "专题询问"];
        let rsp = put_form_sort(
            State(state.clone()),
            Some(Json(json!({"order": reordered}))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);
        let rsp = get_form_sort(State(state.clone())).await.unwrap();
        assert_eq!(body_json(rsp).await["data"], json!(reordered));

        let rsp = put_form_sort(
            State(state.clone()),
            Some(Json(json!({"order": ["视察"]}))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["msg"], "排序数组必须包含5项");

        let rsp = put_form_sort(
            State(state),
            Some(Json(
                json!({"order": ["视察", "执法检查", "听取审议报告", "财经工作监督", "微服私访"]}),
            )),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["msg"], "包含无效的监督形式");
    }

    #[test]
    fn month_clamping() {
        assert_eq!(clamp_month("4"), 4);
        assert_eq!(clamp_month("12"), 12);
        assert_eq!(clamp_month("13"), 0);
        assert_eq!(clamp_month(""), 0);
        assert_eq!(clamp_month("三月"), 0);
    }
}
