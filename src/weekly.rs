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

//! # Weekly work-log API (每周工作)
//!
//! Like the monthly log, but filterable on several years/months/weeks at once — the query
//! string accepts repeated parameters or comma-joined lists. Uploaded filenames from the early
//! deployments are latin-1 mojibake, so every read path runs them through the repair in
//! [crate::util::repair_filename].

use std::sync::Arc;

use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use snafu::prelude::*;

use crate::entities::WeeklyLog;
use crate::http::{
    body_has, body_str, fail, fail_with, json_body, ok, require_auth, Jiandu, Result, StoreSnafu,
    UploadSnafu,
};
use crate::store::{Collection, Document};
use crate::tabular::row_str;
use crate::uploads::{self, download_response, inline_response, receive};
use crate::util::{
    extension_of, file_type_of, parse_id, repair_filename, sanitize_download_name,
};

pub struct WeeklyLogs;

impl Collection for WeeklyLogs {
    type Record = WeeklyLog;
    const FILE: &'static str = "meizhou.json";
}

/// Repair a possibly-mangled stored filename on the way out.
fn outbound(mut log: WeeklyLog) -> WeeklyLog {
    if let Some(name) = log.file_name.take() {
        log.file_name = Some(repair_filename(&name));
    }
    log
}

/// Values for `key`, accepting both repeated parameters and comma-joined lists.
fn multi_values(params: &[(String, String)], key: &str) -> Vec<String> {
    params
        .iter()
        .filter(|(k, _)| k == key)
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Strip the document suffix from an uploaded name.
fn strip_doc_suffix(raw: &str) -> String {
    let lower = raw.to_lowercase();
    for suffix in [".pdf", ".doc", ".docx"] {
        if lower.ends_with(suffix) {
            return raw[..raw.len() - suffix.len()].to_owned();
        }
    }
    raw.to_owned()
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
    let doc = state.store.load::<WeeklyLogs>().context(StoreSnafu)?;
    let Some(file_path) = doc.get(id).and_then(|p| p.file_path.clone()) else {
        return Ok(fail_with(StatusCode::NOT_FOUND, "文件不存在"));
    };
    let path = uploads::WEEKLY.blob_path(state.store.root(), &file_path);
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
    let doc = state.store.load::<WeeklyLogs>().context(StoreSnafu)?;
    let Some(log) = doc.get(id).cloned().filter(|p| p.file_path.is_some()) else {
        return Ok(fail_with(StatusCode::NOT_FOUND, "文件不存在"));
    };
    let file_path = log.file_path.clone().unwrap_or_default();
    let path = uploads::WEEKLY.blob_path(state.store.root(), &file_path);
    if !path.exists() {
        return Ok(fail_with(StatusCode::NOT_FOUND, "文件不存在"));
    }
    let log = outbound(log);
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
//                                              CRUD                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list(
    State(state): State<Arc<Jiandu>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<axum::response::Response> {
    let doc = state.store.load::<WeeklyLogs>().context(StoreSnafu)?;
    let mut listing = doc.items;
    let years = multi_values(&params, "year");
    let months = multi_values(&params, "month");
    let weeks = multi_values(&params, "week");
    if !years.is_empty() {
        listing.retain(|p| years.contains(&p.year));
    }
    if !months.is_empty() {
        listing.retain(|p| months.contains(&p.month));
    }
    if !weeks.is_empty() {
        listing.retain(|p| weeks.contains(&p.week));
    }
    listing.sort_by(|a, b| {
        b.year
            .cmp(&a.year)
            .then(b.month.cmp(&a.month))
            .then(b.week.cmp(&a.week))
            .then(b.id.cmp(&a.id))
    });
    Ok(ok(listing.into_iter().map(outbound).collect::<Vec<_>>()))
}

async fn get_one(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail("ID无效"));
    };
    let doc = state.store.load::<WeeklyLogs>().context(StoreSnafu)?;
    match doc.get(id) {
        Some(log) => Ok(ok(outbound(log.clone()))),
        None => Ok(fail_with(StatusCode::NOT_FOUND, "记录不存在")),
    }
}

async fn create(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let created = state
        .store
        .update::<WeeklyLogs, _, &str>(|doc| {
            let id = doc.allocate();
            let item = WeeklyLog {
                id,
                year: body_str(&body, "year"),
                month: body_str(&body, "month"),
                week: body_str(&body, "week"),
                department: body_str(&body, "department"),
                content: body_str(&body, "content"),
                remark: body_str(&body, "remark"),
                ..WeeklyLog::default()
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

async fn upload(
    State(state): State<Arc<Jiandu>>,
    multipart: Multipart,
) -> Result<axum::response::Response> {
    let form = receive(multipart).await.context(UploadSnafu)?;
    let Some(ref file) = form.file else {
        return Ok(fail("请选择 PDF 文件"));
    };
    if let Err(msg) = uploads::WEEKLY.check_name(&file.name) {
        return Ok(fail(msg));
    }
    let stored = uploads::WEEKLY
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let (year, month, week) = (form.field("year"), form.field("month"), form.field("week"));
    let created = state
        .store
        .update::<WeeklyLogs, _, &str>(|doc| {
            let id = doc.allocate();
            let item = WeeklyLog {
                id,
                year: year.clone(),
                month: month.clone(),
                week: week.clone(),
                file_path: Some(stored.file_path.clone()),
                file_name: Some(file.name.clone()),
                file_type: Some(file_type_of(&file.name)),
                ..WeeklyLog::default()
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
    if let Err(msg) = uploads::WEEKLY.check_name(&file.name) {
        return Ok(fail(msg));
    }
    let stored = uploads::WEEKLY
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let outcome = state
        .store
        .update::<WeeklyLogs, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("记录不存在");
            };
            let old = p.file_path.take();
            p.file_path = Some(stored.file_path.clone());
            let submitted = form.field("fileName");
            p.file_name = Some(if !submitted.is_empty() {
                submitted
            } else {
                let derived = strip_doc_suffix(&file.name);
                if derived.is_empty() {
                    p.file_name.clone().unwrap_or_default()
                } else {
                    derived
                }
            });
            p.file_type = Some(file_type_of(&file.name));
            for (field, slot) in [
                ("year", &mut p.year),
                ("month", &mut p.month),
                ("week", &mut p.week),
            ] {
                if form.has_field(field) {
                    *slot = form.field(field);
                }
            }
            Ok((p.clone(), old))
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok((item, old)) => {
            if let Some(old) = old {
                uploads::WEEKLY.remove(state.store.root(), &old);
            }
            ok(item)
        }
        Err(msg) => {
            uploads::WEEKLY.remove(state.store.root(), &stored.file_path);
            fail(msg)
        }
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
        .update::<WeeklyLogs, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("记录不存在");
            };
            if body_has(&body, "fileName") {
                p.file_name = Some(body_str(&body, "fileName"));
            }
            for (field, slot) in [
                ("year", &mut p.year),
                ("month", &mut p.month),
                ("week", &mut p.week),
                ("department", &mut p.department),
                ("content", &mut p.content),
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
        .update::<WeeklyLogs, _, &str>(|doc| doc.remove(id).ok_or("记录不存在"))
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(removed) => {
            if let Some(file_path) = removed.file_path {
                uploads::WEEKLY.remove(state.store.root(), &file_path);
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
        .update::<WeeklyLogs, _, &str>(|doc| {
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
        uploads::WEEKLY.remove(state.store.root(), &orphan);
    }
    Ok(ok(json!({"deleted": count})))
}

async fn backup(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let doc = state.store.load::<WeeklyLogs>().context(StoreSnafu)?;
    Ok(ok(doc
        .items
        .into_iter()
        .map(outbound)
        .collect::<Vec<_>>()))
}

async fn restore(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let Some(items) = body.get("data").and_then(Value::as_array) else {
        return Ok(fail("备份数据格式错误"));
    };
    let restored: Vec<WeeklyLog> = items
        .iter()
        .map(|item| {
            let mut log = WeeklyLog {
                id: item.get("id").and_then(Value::as_u64).unwrap_or(0),
                year: row_str(item, &["year"]),
                month: row_str(item, &["month"]),
                week: row_str(item, &["week"]),
                department: row_str(item, &["department"]),
                content: row_str(item, &["content"]),
                remark: row_str(item, &["remark"]),
                ..WeeklyLog::default()
            };
            let file_path = row_str(item, &["filePath"]);
            if !file_path.is_empty() {
                log.file_path = Some(file_path);
            }
            let file_name = row_str(item, &["fileName"]);
            if !file_name.is_empty() {
                log.file_name = Some(repair_filename(&file_name));
            }
            let file_type = row_str(item, &["fileType"]);
            if !file_type.is_empty() {
                log.file_type = Some(file_type);
            }
            log
        })
        .collect();
    let count = restored.len();
    state
        .store
        .update::<WeeklyLogs, _, &str>(|doc| {
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
        .update::<WeeklyLogs, _, &str>(|doc| {
            let mut added = 0usize;
            for row in &rows {
                let year = row_str(row, &["year", "年度"]);
                let month = row_str(row, &["month", "月份"]);
                let week = row_str(row, &["week", "周数"]);
                if year.is_empty() && month.is_empty() && week.is_empty() {
                    continue;
                }
                let id = doc.allocate();
                doc.items.push(WeeklyLog {
                    id,
                    year,
                    month,
                    week,
                    department: row_str(row, &["department", "部门"]),
                    content: row_str(row, &["content", "内容"]),
                    remark: row_str(row, &["remark", "备注"]),
                    ..WeeklyLog::default()
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
        .route("/api/meizhou", post(create))
        .route("/api/meizhou/upload", post(upload))
        .route("/api/meizhou/{id}/replace-file", post(replace_file))
        .route("/api/meizhou/{id}", put(update))
        .route("/api/meizhou/{id}", delete(remove))
        .route("/api/meizhou/batch-delete", post(batch_delete))
        .route("/api/meizhou/backup", get(backup))
        .route("/api/meizhou/restore", post(restore))
        .route("/api/meizhou/import", post(import))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .route("/api/meizhou", get(list))
        .route("/api/meizhou/file/{id}", get(file))
        .route("/api/meizhou/download/{id}", get(download))
        .route("/api/meizhou/{id}", get(get_one))
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
    fn multi_value_parameters() {
        let params = vec![
            ("year".to_owned(), "2024,2025".to_owned()),
            ("year".to_owned(), "2023".to_owned()),
            ("week".to_owned(), " ".to_owned()),
        ];
        assert_eq!(multi_values(&params, "year"), ["2024", "2025", "2023"]);
        assert!(multi_values(&params, "week").is_empty());
        assert!(multi_values(&params, "month").is_empty());
    }

    #[test]
    fn suffix_stripping() {
        assert_eq!(strip_doc_suffix("第三周.DOCX"), "第三周");
        assert_eq!(strip_doc_suffix("第三周.pdf"), "第三周");
        assert_eq!(strip_doc_suffix("第三周"), "第三周");
    }

    #[tokio::test]
    async fn filters_combine() {
        let (_dir, state) = state();
        for (year, month, week) in [
            ("2025", "3", "1"),
            ("2025", "3", "2"),
            ("2025", "4", "1"),
            ("2024", "3", "1"),
        ] {
            let _ = create(
                State(state.clone()),
                Some(Json(json!({"year": year, "month": month, "week": week}))),
            )
            .await
            .unwrap();
        }
        let rsp = list(
            State(state.clone()),
            Query(vec![
                ("year".to_owned(), "2025".to_owned()),
                ("month".to_owned(), "3".to_owned()),
            ]),
        )
        .await
        .unwrap();
        let data = body_json(rsp).await["data"].clone();
        let weeks: Vec<String> = data
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["week"].as_str().unwrap().to_owned())
            .collect();
        // Week descending within the filtered set.
        assert_eq!(weeks, ["2", "1"]);
    }

    #[tokio::test]
    async fn batch_delete_collects_orphaned_blobs() {
        let (_dir, state) = state();
        let stored = uploads::WEEKLY
            .store(state.store.root(), "周报.pdf", b"%PDF-")
            .unwrap();
        let blob = uploads::WEEKLY.blob_path(state.store.root(), &stored.file_path);
        let id = state
            .store
            .update::<WeeklyLogs, _, ()>(|doc| {
                let id = doc.allocate();
                doc.items.push(WeeklyLog {
                    id,
                    year: "2025".to_owned(),
                    file_path: Some(stored.file_path.clone()),
                    ..WeeklyLog::default()
                });
                Ok(id)
            })
            .unwrap()
            .unwrap();
        let rsp = batch_delete(
            State(state.clone()),
            Some(Json(json!({"ids": [id]}))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);
        assert!(!blob.exists());
    }
}
