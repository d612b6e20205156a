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

//! # Monthly key-work API (每月重点工作)
//!
//! A hybrid collection: rows are either scheduled items entered by hand (times, location,
//! attendees) or uploaded PDF documents — both live in `meiyue.json`, distinguished by the
//! presence of the attachment fields. Records predating the explicit `year` field derive it
//! from the leading digits of `month`.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use snafu::prelude::*;

use crate::entities::MonthlyLog;
use crate::http::{
    body_has, body_str, fail, fail_with, json_body, ok, require_auth, Jiandu, Result, StoreSnafu,
    UploadSnafu,
};
use crate::store::{Collection, Document, RecordId};
use crate::tabular::row_str;
use crate::uploads::{self, download_response, inline_response, receive};
use crate::util::{extension_of, file_type_of, parse_id, sanitize_download_name, year_from_month};

pub struct MonthlyLogs;

impl Collection for MonthlyLogs {
    type Record = MonthlyLog;
    const FILE: &'static str = "meiyue.json";
}

/// The record's year, falling back to the one encoded in its month.
fn effective_year(log: &MonthlyLog) -> String {
    if log.year.is_empty() {
        year_from_month(&log.month)
    } else {
        log.year.clone()
    }
}

/// Strip the `.pdf` suffix from an uploaded name; the bare title is what the listing displays.
fn display_name(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.ends_with(".pdf") {
        raw[..raw.len() - 4].to_owned()
    } else {
        raw.to_owned()
    }
}

fn find(doc: &Document<MonthlyLog>, id: RecordId) -> Option<MonthlyLog> {
    doc.get(id).cloned()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          file serving                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn file(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail_with(StatusCode::NOT_FOUND, "Not found"));
    };
    let doc = state.store.load::<MonthlyLogs>().context(StoreSnafu)?;
    let Some(file_path) = find(&doc, id).and_then(|p| p.file_path) else {
        return Ok(fail_with(StatusCode::NOT_FOUND, "文件不存在"));
    };
    let path = uploads::MONTHLY.blob_path(state.store.root(), &file_path);
    if !path.exists() {
        return Ok(fail_with(StatusCode::NOT_FOUND, "文件不存在"));
    }
    inline_response(&path, "pdf").context(UploadSnafu)
}

async fn download(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail_with(StatusCode::NOT_FOUND, "Not found"));
    };
    let doc = state.store.load::<MonthlyLogs>().context(StoreSnafu)?;
    let Some(log) = find(&doc, id).filter(|p| p.file_path.is_some()) else {
        return Ok(fail_with(StatusCode::NOT_FOUND, "文件不存在"));
    };
    let file_path = log.file_path.clone().unwrap_or_default();
    let path = uploads::MONTHLY.blob_path(state.store.root(), &file_path);
    if !path.exists() {
        return Ok(fail_with(StatusCode::NOT_FOUND, "文件不存在"));
    }
    let base = sanitize_download_name(
        log.file_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(if log.content.is_empty() {
                "document"
            } else {
                &log.content
            }),
    );
    let mut ext = extension_of(&file_path);
    if ext.is_empty() {
        ext = ".pdf".to_owned();
    }
    download_response(
        &path,
        "pdf",
        &format!("download{ext}"),
        &format!("{base}{ext}"),
    )
    .context(UploadSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            uploads                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn upload(
    State(state): State<Arc<Jiandu>>,
    multipart: Multipart,
) -> Result<axum::response::Response> {
    let form = receive(multipart).await.context(UploadSnafu)?;
    let Some(ref file) = form.file else {
        return Ok(fail("请选择文件"));
    };
    if let Err(msg) = uploads::MONTHLY.check_name(&file.name) {
        return Ok(fail(msg));
    }
    let stored = uploads::MONTHLY
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let year = form.field("year");
    let month = form.field("month");
    let created = state
        .store
        .update::<MonthlyLogs, _, &str>(|doc| {
            let id = doc.allocate();
            let item = MonthlyLog {
                id,
                year: year.clone(),
                month: month.clone(),
                file_path: Some(stored.file_path.clone()),
                file_name: Some(display_name(&file.name)),
                file_type: Some(file_type_of(&file.name)),
                ..MonthlyLog::default()
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
    if let Err(msg) = uploads::MONTHLY.check_name(&file.name) {
        return Ok(fail(msg));
    }
    let stored = uploads::MONTHLY
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let outcome = state
        .store
        .update::<MonthlyLogs, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("记录不存在");
            };
            let old = p.file_path.take();
            p.file_path = Some(stored.file_path.clone());
            let submitted = form.field("fileName");
            p.file_name = Some(if !submitted.is_empty() {
                submitted
            } else {
                let derived = display_name(&file.name);
                if derived.is_empty() {
                    p.file_name.clone().unwrap_or_default()
                } else {
                    derived
                }
            });
            p.file_type = Some(file_type_of(&file.name));
            if form.has_field("year") {
                p.year = form.field("year");
            }
            if form.has_field("month") {
                p.month = form.field("month");
            }
            Ok((p.clone(), old))
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok((item, old)) => {
            if let Some(old) = old {
                uploads::MONTHLY.remove(state.store.root(), &old);
            }
            ok(item)
        }
        Err(msg) => {
            // The record vanished under us; don't leave the fresh blob orphaned.
            uploads::MONTHLY.remove(state.store.root(), &stored.file_path);
            fail(msg)
        }
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              CRUD                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list(
    State(state): State<Arc<Jiandu>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<axum::response::Response> {
    let doc = state.store.load::<MonthlyLogs>().context(StoreSnafu)?;
    let mut listing = doc.items;
    if let Some(year) = params.get("year").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        listing.retain(|p| effective_year(p) == year);
    }
    if let Some(month) = params.get("month").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        listing.retain(|p| p.month == month);
    }
    listing.sort_by(|a, b| {
        effective_year(b)
            .cmp(&effective_year(a))
            .then(b.month.cmp(&a.month))
            .then(b.id.cmp(&a.id))
    });
    Ok(ok(listing))
}

async fn create(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let month = body_str(&body, "month");
    let year = {
        let y = body_str(&body, "year");
        if y.is_empty() {
            year_from_month(&month)
        } else {
            y
        }
    };
    let created = state
        .store
        .update::<MonthlyLogs, _, &str>(|doc| {
            let id = doc.allocate();
            let item = MonthlyLog {
                id,
                year: year.clone(),
                month: month.clone(),
                time1: body_str(&body, "time1"),
                time2: body_str(&body, "time2"),
                location: body_str(&body, "location"),
                content: body_str(&body, "content"),
                leaders: body_str(&body, "leaders"),
                remark: body_str(&body, "remark"),
                ..MonthlyLog::default()
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
        .update::<MonthlyLogs, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("记录不存在");
            };
            if body_has(&body, "month") {
                p.month = body_str(&body, "month");
            }
            if body_has(&body, "year") {
                p.year = body_str(&body, "year");
            }
            if p.year.is_empty() {
                p.year = year_from_month(&p.month);
            }
            if body_has(&body, "fileName") {
                p.file_name = Some(body_str(&body, "fileName"));
            }
            for (field, slot) in [
                ("time1", &mut p.time1),
                ("time2", &mut p.time2),
                ("location", &mut p.location),
                ("content", &mut p.content),
                ("leaders", &mut p.leaders),
                ("remark", &mut p.remark),
            ] {
                if body_has(&body, field) {
                    *slot = body_str(&body, field);
                }
            }
            Ok(p.clone())
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(item) => ok(item),
        Err(msg) => fail(msg),
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
        .update::<MonthlyLogs, _, &str>(|doc| doc.remove(id).ok_or("记录不存在"))
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(removed) => {
            if let Some(file_path) = removed.file_path {
                uploads::MONTHLY.remove(state.store.root(), &file_path);
            }
            ok(json!({"deleted": id}))
        }
        Err(msg) => fail(msg),
    })
}

async fn batch_delete(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let ids: Vec<u64> = body
        .get("ids")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default();
    if ids.is_empty() {
        return Ok(fail("请选择要删除的记录"));
    }
    let count = ids.len();
    let orphans = state
        .store
        .update::<MonthlyLogs, _, &str>(|doc| {
            let mut orphans = Vec::new();
            doc.items.retain(|p| {
                if ids.contains(&p.id) {
                    if let Some(fp) = &p.file_path {
                        orphans.push(fp.clone());
                    }
                    false
                } else {
                    true
                }
            });
            Ok(orphans)
        })
        .context(StoreSnafu)?
        .unwrap_or_default();
    for orphan in orphans {
        uploads::MONTHLY.remove(state.store.root(), &orphan);
    }
    Ok(ok(json!({"deleted": count})))
}

async fn backup(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let doc = state.store.load::<MonthlyLogs>().context(StoreSnafu)?;
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
    let restored: Vec<MonthlyLog> = items
        .iter()
        .map(|item| {
            let month = row_str(item, &["month"]);
            let year = {
                let y = row_str(item, &["year"]);
                if y.is_empty() {
                    year_from_month(&month)
                } else {
                    y
                }
            };
            let mut log = MonthlyLog {
                id: item.get("id").and_then(Value::as_u64).unwrap_or(0),
                year,
                month,
                time1: row_str(item, &["time1"]),
                time2: row_str(item, &["time2"]),
                location: row_str(item, &["location"]),
                content: row_str(item, &["content"]),
                leaders: row_str(item, &["leaders"]),
                remark: row_str(item, &["remark"]),
                ..MonthlyLog::default()
            };
            let file_path = row_str(item, &["filePath"]);
            if !file_path.is_empty() {
                log.file_path = Some(file_path);
                log.file_name = Some(row_str(item, &["fileName"]));
                log.file_type = Some({
                    let t = row_str(item, &["fileType"]).to_lowercase();
                    if t.is_empty() {
                        "pdf".to_owned()
                    } else {
                        t
                    }
                });
            }
            log
        })
        .collect();
    let count = restored.len();
    state
        .store
        .update::<MonthlyLogs, _, &str>(|doc| {
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
        .update::<MonthlyLogs, _, &str>(|doc| {
            let mut added = 0usize;
            for row in &rows {
                let month = row_str(row, &["month", "月份"]);
                let year = {
                    let y = row_str(row, &["year", "年度"]);
                    if y.is_empty() {
                        year_from_month(&month)
                    } else {
                        y
                    }
                };
                if month.is_empty() && year.is_empty() {
                    continue;
                }
                let id = doc.allocate();
                doc.items.push(MonthlyLog {
                    id,
                    year,
                    month,
                    time1: row_str(row, &["time1", "时间1"]),
                    time2: row_str(row, &["time2", "时间2"]),
                    location: row_str(row, &["location", "地点"]),
                    content: row_str(row, &["content", "内容"]),
                    leaders: row_str(row, &["leaders", "出席领导"]),
                    remark: row_str(row, &["remark", "备注"]),
                    ..MonthlyLog::default()
                });
                added += 1;
            }
            Ok(added)
        })
        .context(StoreSnafu)?
        .unwrap_or(0);
    Ok(ok(json!({"imported": added})))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router(state: Arc<Jiandu>) -> Router<Arc<Jiandu>> {
    let protected = Router::new()
        .route("/api/meiyue/upload", post(upload))
        .route("/api/meiyue/{id}/replace-file", post(replace_file))
        .route("/api/meiyue", post(create))
        .route("/api/meiyue/{id}", put(update))
        .route("/api/meiyue/{id}", delete(remove))
        .route("/api/meiyue/batch-delete", post(batch_delete))
        .route("/api/meiyue/backup", get(backup))
        .route("/api/meiyue/restore", post(restore))
        .route("/api/meiyue/import", post(import))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .route("/api/meiyue", get(list))
        .route("/api/meiyue/file/{id}", get(file))
        .route("/api/meiyue/download/{id}", get(download))
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

    #[test]
    fn year_falls_back_to_month_prefix() {
        let log = MonthlyLog {
            month: "2024-11".to_owned(),
            ..MonthlyLog::default()
        };
        assert_eq!(effective_year(&log), "2024");
    }

    #[test]
    fn display_names_lose_their_pdf_suffix() {
        assert_eq!(display_name("十一月安排.PDF"), "十一月安排");
        assert_eq!(display_name("十一月安排"), "十一月安排");
    }

    #[tokio::test]
    async fn deleting_a_record_removes_its_blob() {
        let (_dir, state) = state();
        let stored = uploads::MONTHLY
            .store(state.store.root(), "安排.pdf", b"%PDF-")
            .unwrap();
        let blob = uploads::MONTHLY.blob_path(state.store.root(), &stored.file_path);
        let id = state
            .store
            .update::<MonthlyLogs, _, ()>(|doc| {
                let id = doc.allocate();
                doc.items.push(MonthlyLog {
                    id,
                    year: "2025".to_owned(),
                    month: "2025-01".to_owned(),
                    file_path: Some(stored.file_path.clone()),
                    file_name: Some("安排".to_owned()),
                    file_type: Some("pdf".to_owned()),
                    ..MonthlyLog::default()
                });
                Ok(id)
            })
            .unwrap()
            .unwrap();
        assert!(blob.exists());

        let rsp = remove(State(state.clone()), axum::extract::Path(id.to_string()))
            .await
            .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);
        assert!(!blob.exists());
        assert!(state.store.load::<MonthlyLogs>().unwrap().get(id).is_none());
    }

    #[tokio::test]
    async fn deleting_a_plain_record_touches_no_files() {
        let (_dir, state) = state();
        let rsp = create(
            State(state.clone()),
            Some(Json(json!({"month": "2025-02", "content": "例会"}))),
        )
        .await
        .unwrap();
        let id = body_json(rsp).await["data"]["id"].as_u64().unwrap();
        // No uploads directory exists yet, and deletion must not create (or trip over) one.
        let rsp = remove(State(state.clone()), axum::extract::Path(id.to_string()))
            .await
            .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);
        assert!(!state.store.root().join("uploads").exists());
    }

    #[tokio::test]
    async fn listing_sorts_newest_first() {
        let (_dir, state) = state();
        for month in ["2024-12", "2025-02", "2025-01"] {
            let _ = create(
                State(state.clone()),
                Some(Json(json!({"month": month}))),
            )
            .await
            .unwrap();
        }
        let rsp = list(State(state.clone()), Query(HashMap::new())).await.unwrap();
        let months: Vec<String> = body_json(rsp).await["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["month"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(months, ["2025-02", "2025-01", "2024-12"]);
    }
}
