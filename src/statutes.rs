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

//! # Statute API (法律法规)
//!
//! The office's reference library: statutes and regulations with their source documents
//! attached. Classification is closed-vocabulary (category and issuing authority), and each
//! record carries a derived `validity` — a statute whose effective date lies in the future is
//! 尚未生效, recomputed whenever the date changes and backfilled on the way out for documents
//! that predate the field.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Redirect},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use serde_json::{json, Value};
use snafu::prelude::*;

use crate::entities::{Statute, StatuteRevision};
use crate::http::{
    body_has, body_str, fail, fail_with, json_body, ok, require_auth, Jiandu, Result, StoreSnafu,
    UploadSnafu,
};
use crate::preview::docx_preview_response;
use crate::store::{Collection, Document};
use crate::tabular::row_str;
use crate::uploads::{self, download_response, inline_response, receive};
use crate::util::{extension_of, file_type_of, parse_id, sanitize_download_name};

pub const CATEGORIES: [&str; 6] = ["宪法", "法律", "行政法规", "监察法规", "地方法规", "司法解释"];

pub const AUTHORITIES: [&str; 6] = [
    "全国人大及其常委会",
    "国务院",
    "国家监察委员会",
    "最高人民法院",
    "最高人民检察院",
    "大连市人大及其常委会",
];

pub struct Statutes;

impl Collection for Statutes {
    type Record = Statute;
    const FILE: &'static str = "falv.json";
}

/// 有效 unless the effective date parses and lies in the future.
pub fn compute_validity(effective_date: &str) -> &'static str {
    let Ok(date) = NaiveDate::parse_from_str(effective_date.trim(), "%Y-%m-%d") else {
        return "有效";
    };
    if date > chrono::Local::now().date_naive() {
        "尚未生效"
    } else {
        "有效"
    }
}

fn with_validity(mut s: Statute) -> Statute {
    if s.validity.is_empty() {
        s.validity = compute_validity(&s.effective_date).to_owned();
    }
    s
}

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
//                                     vocabularies & listing                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn categories() -> axum::response::Response {
    ok(CATEGORIES)
}

async fn authorities() -> axum::response::Response {
    ok(AUTHORITIES)
}

async fn list(
    State(state): State<Arc<Jiandu>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<axum::response::Response> {
    let doc = state.store.load::<Statutes>().context(StoreSnafu)?;
    let mut listing: Vec<Statute> = doc.items.into_iter().map(with_validity).collect();
    if let Some(category) = params.get("category").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        listing.retain(|s| s.category == category);
    }
    if let Some(authority) = params
        .get("authority")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    {
        listing.retain(|s| s.issuing_authority == authority);
    }
    listing.sort_by(|a, b| {
        b.publication_date
            .cmp(&a.publication_date)
            .then(b.id.cmp(&a.id))
    });
    Ok(ok(listing))
}

async fn get_one(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail("ID无效"));
    };
    let doc = state.store.load::<Statutes>().context(StoreSnafu)?;
    match doc.get(id) {
        Some(s) => Ok(ok(with_validity(s.clone()))),
        None => Ok(fail_with(StatusCode::NOT_FOUND, "记录不存在")),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       uploads & edits                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn upload(
    State(state): State<Arc<Jiandu>>,
    multipart: Multipart,
) -> Result<axum::response::Response> {
    let form = receive(multipart).await.context(UploadSnafu)?;
    let Some(ref file) = form.file else {
        return Ok(fail("请选择文件"));
    };
    if let Err(msg) = uploads::STATUTES.check_name(&file.name) {
        return Ok(fail(msg));
    }
    let stored = uploads::STATUTES
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let name = {
        let n = form.field("name");
        if !n.is_empty() {
            n
        } else {
            let derived = strip_doc_suffix(&file.name);
            if derived.is_empty() {
                "未命名".to_owned()
            } else {
                derived
            }
        }
    };
    let category = {
        let c = form.field("category");
        if c.is_empty() {
            "法律".to_owned()
        } else {
            c
        }
    };
    let publication_date = form.field("publicationDate");
    let effective_date = form.field("effectiveDate");
    let created = state
        .store
        .update::<Statutes, _, &str>(|doc| {
            let id = doc.allocate();
            let item = Statute {
                id,
                name: name.clone(),
                category: category.clone(),
                issuing_authority: form.field("issuingAuthority"),
                publication_date: publication_date.clone(),
                effective_date: effective_date.clone(),
                validity: compute_validity(&effective_date).to_owned(),
                file_name: file.name.clone(),
                file_path: stored.file_path.clone(),
                file_type: file_type_of(&file.name),
                history: vec![StatuteRevision {
                    date: publication_date.clone(),
                    name: name.clone(),
                }],
                related_docs: Vec::new(),
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
    if let Err(msg) = uploads::STATUTES.check_name(&file.name) {
        return Ok(fail(msg));
    }
    let stored = uploads::STATUTES
        .store(state.store.root(), &file.name, &file.bytes)
        .context(UploadSnafu)?;
    let outcome = state
        .store
        .update::<Statutes, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("记录不存在");
            };
            let old = std::mem::take(&mut p.file_path);
            p.file_path = stored.file_path.clone();
            p.file_name = file.name.clone();
            p.file_type = file_type_of(&file.name);
            if form.has_field("name") {
                let name = form.field("name");
                if !name.is_empty() {
                    p.name = name;
                }
            }
            if form.has_field("category") {
                let c = form.field("category");
                p.category = if c.is_empty() { "法律".to_owned() } else { c };
            }
            if form.has_field("issuingAuthority") {
                p.issuing_authority = form.field("issuingAuthority");
            }
            if form.has_field("publicationDate") {
                p.publication_date = form.field("publicationDate");
            }
            if form.has_field("effectiveDate") {
                p.effective_date = form.field("effectiveDate");
                p.validity = compute_validity(&p.effective_date).to_owned();
            }
            Ok((p.clone(), old))
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok((item, old)) => {
            if !old.is_empty() {
                uploads::STATUTES.remove(state.store.root(), &old);
            }
            ok(item)
        }
        Err(msg) => {
            uploads::STATUTES.remove(state.store.root(), &stored.file_path);
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
        .update::<Statutes, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("记录不存在");
            };
            if body_has(&body, "name") {
                let name = body_str(&body, "name");
                if !name.is_empty() {
                    p.name = name;
                }
            }
            if body_has(&body, "category") {
                let c = body_str(&body, "category");
                p.category = if c.is_empty() { "法律".to_owned() } else { c };
            }
            if body_has(&body, "issuingAuthority") {
                p.issuing_authority = body_str(&body, "issuingAuthority");
            }
            if body_has(&body, "publicationDate") {
                p.publication_date = body_str(&body, "publicationDate");
            }
            if body_has(&body, "effectiveDate") {
                p.effective_date = body_str(&body, "effectiveDate");
                p.validity = compute_validity(&p.effective_date).to_owned();
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
        .update::<Statutes, _, &str>(|doc| doc.remove(id).ok_or("记录不存在"))
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(removed) => {
            uploads::STATUTES.remove(state.store.root(), &removed.file_path);
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
        .update::<Statutes, _, &str>(|doc| {
            let mut orphans = Vec::new();
            doc.items.retain(|p| {
                if ids.contains(&p.id) {
                    orphans.push(p.file_path.clone());
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
        uploads::STATUTES.remove(state.store.root(), &orphan);
    }
    Ok(ok(json!({"deleted": count})))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      backup & restore                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn backup(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let doc = state.store.load::<Statutes>().context(StoreSnafu)?;
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
    let restored: Vec<Statute> = items
        .iter()
        .map(|item| {
            let effective_date = row_str(item, &["effectiveDate"]);
            let validity = {
                let v = row_str(item, &["validity"]);
                if v.is_empty() {
                    compute_validity(&effective_date).to_owned()
                } else {
                    v
                }
            };
            Statute {
                id: item.get("id").and_then(Value::as_u64).unwrap_or(0),
                name: row_str(item, &["name"]),
                category: {
                    let c = row_str(item, &["category"]);
                    if c.is_empty() {
                        "法律".to_owned()
                    } else {
                        c
                    }
                },
                issuing_authority: row_str(item, &["issuingAuthority"]),
                publication_date: row_str(item, &["publicationDate"]),
                effective_date,
                validity,
                file_name: row_str(item, &["fileName"]),
                file_path: row_str(item, &["filePath"]),
                file_type: {
                    let t = row_str(item, &["fileType"]);
                    if t.is_empty() {
                        "pdf".to_owned()
                    } else {
                        t
                    }
                },
                history: item
                    .get("history")
                    .and_then(|h| serde_json::from_value(h.clone()).ok())
                    .unwrap_or_default(),
                related_docs: item
                    .get("relatedDocs")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            }
        })
        .collect();
    let count = restored.len();
    state
        .store
        .update::<Statutes, _, &str>(|doc| {
            *doc = Document::restore(restored.clone());
            Ok(())
        })
        .context(StoreSnafu)?
        .ok();
    Ok(ok(json!({"restored": count})))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                  file / download / preview                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn stored_file(state: &Jiandu, raw_id: &str) -> Result<std::result::Result<(Statute, std::path::PathBuf), axum::response::Response>> {
    let Some(id) = parse_id(raw_id) else {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "Not found")));
    };
    let doc = state.store.load::<Statutes>().context(StoreSnafu)?;
    let Some(statute) = doc.get(id).cloned() else {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "Not found")));
    };
    let path = uploads::STATUTES.blob_path(state.store.root(), &statute.file_path);
    if statute.file_path.is_empty() || !path.exists() {
        return Ok(Err(fail_with(StatusCode::NOT_FOUND, "文件不存在")));
    }
    Ok(Ok((statute, path)))
}

async fn file(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let (statute, path) = match stored_file(&state, &raw_id)? {
        Ok(found) => found,
        Err(rsp) => return Ok(rsp),
    };
    inline_response(&path, &statute.file_type).context(UploadSnafu)
}

async fn download(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let (statute, path) = match stored_file(&state, &raw_id)? {
        Ok(found) => found,
        Err(rsp) => return Ok(rsp),
    };
    let base = sanitize_download_name(if !statute.name.is_empty() {
        &statute.name
    } else if !statute.file_name.is_empty() {
        &statute.file_name
    } else {
        "document"
    });
    let mut ext = extension_of(&statute.file_path);
    if ext.is_empty() {
        ext = if statute.file_type == "pdf" { ".pdf" } else { ".docx" }.to_owned();
    }
    download_response(
        &path,
        &statute.file_type,
        &format!("download{ext}"),
        &format!("{base}{ext}"),
    )
    .context(UploadSnafu)
}

async fn preview(
    State(state): State<Arc<Jiandu>>,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    let (statute, path) = match stored_file(&state, &raw_id)? {
        Ok(found) => found,
        Err(rsp) => return Ok(rsp),
    };
    match statute.file_type.as_str() {
        "pdf" => Ok(Redirect::to(&format!("/api/falv/file/{}", statute.id)).into_response()),
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
        .route("/api/falv/upload", post(upload))
        .route("/api/falv/{id}/replace-file", post(replace_file))
        .route("/api/falv/{id}", put(update))
        .route("/api/falv/{id}", delete(remove))
        .route("/api/falv/batch-delete", post(batch_delete))
        .route("/api/falv/backup", get(backup))
        .route("/api/falv/restore", post(restore))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .route("/api/falv", get(list))
        .route("/api/falv/categories", get(categories))
        .route("/api/falv/authorities", get(authorities))
        .route("/api/falv/{id}", get(get_one))
        .route("/api/falv/file/{id}", get(file))
        .route("/api/falv/download/{id}", get(download))
        .route("/api/falv/preview/{id}", get(preview))
        .merge(protected)
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validity_computation() {
        assert_eq!(compute_validity("2000-01-01"), "有效");
        assert_eq!(compute_validity("2999-12-31"), "尚未生效");
        // Unparseable or absent dates default to in-force.
        assert_eq!(compute_validity(""), "有效");
        assert_eq!(compute_validity("二〇二五年"), "有效");
    }

    #[test]
    fn validity_backfill_respects_existing_values() {
        let s = with_validity(Statute {
            validity: "尚未生效".to_owned(),
            effective_date: "2000-01-01".to_owned(),
            ..Statute::default()
        });
        // A stored value wins over the derived one.
        assert_eq!(s.validity, "尚未生效");
        let s = with_validity(Statute {
            effective_date: "2999-01-01".to_owned(),
            ..Statute::default()
        });
        assert_eq!(s.validity, "尚未生效");
    }
}
