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

//! # Directive API (批示督办)
//!
//! Leadership directives and their follow-up status. The interesting wrinkle here is dates:
//! directives mostly arrive via spreadsheet import, where the 批示日期 column may be text or an
//! Excel serial number, so the date is normalized both when a row comes in and when a record
//! goes out (old documents may still hold raw serials).

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use snafu::prelude::*;

use crate::entities::Directive;
use crate::http::{
    fail, json_body, ok, require_auth, Jiandu, Result, StoreSnafu, TemplateSnafu,
};
use crate::store::{Collection, Document};
use crate::tabular::{row_str, template_response};
use crate::util::{normalize_date_cell, parse_id};

pub const HEADERS: [&str; 9] = [
    "期数",
    "来文单位",
    "文号",
    "批示内容",
    "批示日期",
    "领导和责任部门",
    "类别",
    "落实举措",
    "完成情况",
];

pub struct Directives;

impl Collection for Directives {
    type Record = Directive;
    const FILE: &'static str = "pishi.json";
}

/// Clamp 完成情况 to its two-value vocabulary.
fn clamp_status(status: String) -> String {
    if status == "已完成" {
        status
    } else {
        "推进中".to_owned()
    }
}

/// A request body or imported spreadsheet row — keyed by English field names or the Chinese
/// template headers — as a directive record (id unassigned).
fn normalize_row(row: &Value) -> Directive {
    Directive {
        id: 0,
        qishu: row_str(row, &["qishu", "期数"]),
        laiwen_unit: row_str(row, &["laiwenUnit", "来文单位"]),
        wenhao: row_str(row, &["wenhao", "文号"]),
        pishi_content: row_str(row, &["pishiContent", "批示内容"]),
        pishi_date: normalize_date_cell(&row_str(row, &["pishiDate", "批示日期"])),
        leader_dept: row_str(row, &["leaderDept", "领导和责任部门"]),
        category: row_str(row, &["category", "类别"]),
        luoshi_cuoshi: row_str(row, &["luoshiCuoshi", "落实举措"]),
        complete_status: clamp_status(row_str(row, &["completeStatus", "完成情况"])),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list(
    State(state): State<Arc<Jiandu>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<axum::response::Response> {
    let doc = state.store.load::<Directives>().context(StoreSnafu)?;
    let mut listing = doc.items;
    // Old documents may carry raw Excel serials; normalize on the way out.
    for d in listing.iter_mut() {
        d.pishi_date = normalize_date_cell(&d.pishi_date);
    }
    let param = |k: &str| params.get(k).map(|s| s.trim().to_owned()).unwrap_or_default();
    let (qishu, pishi_date, leader_dept, complete_status) = (
        param("qishu"),
        param("pishiDate"),
        param("leaderDept"),
        param("completeStatus"),
    );
    if !qishu.is_empty() {
        listing.retain(|d| d.qishu == qishu);
    }
    if !pishi_date.is_empty() {
        listing.retain(|d| d.pishi_date.contains(&pishi_date));
    }
    if !leader_dept.is_empty() {
        listing.retain(|d| d.leader_dept.contains(&leader_dept));
    }
    if !complete_status.is_empty() {
        listing.retain(|d| d.complete_status == complete_status);
    }
    listing.sort_by(|a, b| {
        b.pishi_date
            .cmp(&a.pishi_date)
            .then(b.id.cmp(&a.id))
    });
    Ok(ok(listing))
}

/// Directive counts per 领导和责任部门, for the overview chart.
async fn stats(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let doc = state.store.load::<Directives>().context(StoreSnafu)?;
    let mut counts = serde_json::Map::new();
    for d in &doc.items {
        let dept = {
            let t = d.leader_dept.trim();
            if t.is_empty() {
                "未分类"
            } else {
                t
            }
        };
        let slot = counts.entry(dept.to_owned()).or_insert(json!(0));
        let n = slot.as_u64().unwrap_or(0);
        *slot = json!(n + 1);
    }
    Ok(ok(Value::Object(counts)))
}

async fn create(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let row = normalize_row(&json_body(body));
    let created = state
        .store
        .update::<Directives, _, &str>(|doc| {
            let mut item = row.clone();
            item.id = doc.allocate();
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
    let row = normalize_row(&json_body(body));
    let outcome = state
        .store
        .update::<Directives, _, &str>(|doc| {
            let Some(d) = doc.get_mut(id) else {
                return Err("记录不存在");
            };
            // Directive edits are whole-row: the form always submits every column.
            let keep = d.id;
            *d = row.clone();
            d.id = keep;
            Ok(d.clone())
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(d) => ok(d),
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
        .update::<Directives, _, &str>(|doc| doc.remove(id).map(|_| ()).ok_or("记录不存在"))
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(()) => ok(json!({"deleted": id})),
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
    state
        .store
        .update::<Directives, _, &str>(|doc| {
            doc.items.retain(|d| !ids.contains(&d.id));
            Ok(())
        })
        .context(StoreSnafu)?
        .ok();
    Ok(ok(json!({"deleted": count})))
}

async fn backup(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let doc = state.store.load::<Directives>().context(StoreSnafu)?;
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
    let restored: Vec<Directive> = items
        .iter()
        .map(|item| {
            let mut d = normalize_row(item);
            d.id = item.get("id").and_then(Value::as_u64).unwrap_or(0);
            d
        })
        .collect();
    let count = restored.len();
    state
        .store
        .update::<Directives, _, &str>(|doc| {
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
        .update::<Directives, _, &str>(|doc| {
            let mut added = 0usize;
            for row in &rows {
                let mut item = normalize_row(row);
                // An effectively-blank row (no issue number, content or owner) is skipped and
                // consumes no id.
                if item.qishu.is_empty()
                    && item.pishi_content.is_empty()
                    && item.leader_dept.is_empty()
                {
                    continue;
                }
                item.id = doc.allocate();
                doc.items.push(item);
                added += 1;
            }
            Ok(added)
        })
        .context(StoreSnafu)?
        .unwrap_or(0);
    Ok(ok(json!({"imported": added})))
}

async fn template() -> Result<axum::response::Response> {
    template_response(&HEADERS, "pishi_template.xlsx").context(TemplateSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router(state: Arc<Jiandu>) -> Router<Arc<Jiandu>> {
    let protected = Router::new()
        .route("/api/pishi", post(create))
        .route("/api/pishi/{id}", put(update))
        .route("/api/pishi/{id}", delete(remove))
        .route("/api/pishi/batch-delete", post(batch_delete))
        .route("/api/pishi/backup", get(backup))
        .route("/api/pishi/restore", post(restore))
        .route("/api/pishi/import", post(import))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .route("/api/pishi", get(list))
        .route("/api/pishi/stats", get(stats))
        .route("/api/pishi/template", get(template))
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
    fn rows_normalize_from_chinese_headers() {
        let d = normalize_row(&json!({
            "期数": 3,
            "批示内容": " 加快推进 ",
            "批示日期": 45092,
            "领导和责任部门": "王市长、城建处",
            "完成情况": "办结"
        }));
        assert_eq!(d.qishu, "3");
        assert_eq!(d.pishi_content, "加快推进");
        assert_eq!(d.pishi_date, "2023-06-15");
        // Unknown statuses collapse to the in-progress default.
        assert_eq!(d.complete_status, "推进中");
    }

    #[tokio::test]
    async fn import_skips_blank_rows() {
        let (_dir, state) = state();
        let rsp = import(
            State(state.clone()),
            Some(Json(json!({"rows": [
                {"期数": "1", "批示内容": "落实", "领导和责任部门": "督查处"},
                {"文号": "只有文号，整行视为空白"},
            ]}))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["data"]["imported"], 1);
        let doc = state.store.load::<Directives>().unwrap();
        assert_eq!(doc.items.len(), 1);
        assert_eq!(doc.next_id, 2);
    }

    #[tokio::test]
    async fn list_filters_and_sorts_by_date_then_id() {
        let (_dir, state) = state();
        for (qishu, date, dept) in [
            ("1", "2025-01-05", "城建处"),
            ("2", "2025-03-01", "财经处"),
            ("3", "2025-03-01", "城建处"),
        ] {
            let _ = create(
                State(state.clone()),
                Some(Json(json!({
                    "qishu": qishu, "pishiDate": date, "leaderDept": dept,
                    "pishiContent": "x"
                }))),
            )
            .await
            .unwrap();
        }
        let rsp = list(State(state.clone()), Query(HashMap::new())).await.unwrap();
        let data = body_json(rsp).await["data"].clone();
        let ids: Vec<u64> = data
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["id"].as_u64().unwrap())
            .collect();
        // Newest date first; same-day ties broken by id, descending.
        assert_eq!(ids, [3, 2, 1]);

        let mut params = HashMap::new();
        params.insert("leaderDept".to_owned(), "城建".to_owned());
        let rsp = list(State(state.clone()), Query(params)).await.unwrap();
        assert_eq!(body_json(rsp).await["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stats_group_by_owner() {
        let (_dir, state) = state();
        for dept in ["城建处", "城建处", ""] {
            let _ = create(
                State(state.clone()),
                Some(Json(json!({"leaderDept": dept, "pishiContent": "x"}))),
            )
            .await
            .unwrap();
        }
        let rsp = stats(State(state)).await.unwrap();
        let data = body_json(rsp).await["data"].clone();
        assert_eq!(data["城建处"], 2);
        assert_eq!(data["未分类"], 1);
    }
}
