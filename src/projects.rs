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

//! # Project API
//!
//! CRUD over the supervised-project roster, plus the operations the yearly workflow needs:
//! drag-to-reorder, spreadsheet import with a blank-template download, and whole-collection
//! backup/restore.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Datelike;
use serde_json::{json, Value};
use snafu::prelude::*;

use crate::entities::Project;
use crate::http::{
    body_str, fail, json_body, ok, require_auth, Jiandu, Result, StoreSnafu, TemplateSnafu,
};
use crate::store::{Collection, Document};
use crate::tabular::{row_str, template_response};
use crate::util::parse_id;

pub const HEADERS: [&str; 6] = [
    "年度",
    "项目名称",
    "监督部门",
    "小组成员名单",
    "重点监督内容",
    "完成情况",
];

const STATUSES: [&str; 3] = ["未开始", "进行中", "已完成"];

pub struct Projects;

impl Collection for Projects {
    type Record = Project;
    const FILE: &'static str = "projects.json";
    const LIST_FIELD: &'static str = "projects";
    // Four demonstration rows so a fresh install has something on screen.
    fn seed() -> Document<Project> {
        let rows = [
            (2025, "老旧小区改造", "住建局", "张军、李红、王强", "改造进度、工程质量、居民满意度", "进行中"),
            (2025, "社区养老服务中心建设", "民政局", "刘芳、赵伟、孙丽", "场地建设、人员配置、服务落地", "已完成"),
            (2024, "农村饮水安全工程", "水利局", "陈明、周杰、吴丹", "水质检测、管网铺设、供水稳定性", "已完成"),
            (2023, "义务教育学校扩建", "教育局", "郑华、马涛、钱静", "施工进度、师资配套、招生计划", "已完成"),
        ];
        let items = rows
            .iter()
            .enumerate()
            .map(|(i, (year, name, department, members, supervise, status))| Project {
                id: i as u64 + 1,
                year: *year,
                name: (*name).to_owned(),
                department: (*department).to_owned(),
                members: (*members).to_owned(),
                supervise: (*supervise).to_owned(),
                status: (*status).to_owned(),
            })
            .collect();
        Document::seeded(items, 5)
    }
}

fn current_year() -> i32 {
    chrono::Local::now().year()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list(
    State(state): State<Arc<Jiandu>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<axum::response::Response> {
    let doc = state.store.load::<Projects>().context(StoreSnafu)?;
    let mut listing = doc.items;
    if let Some(year) = params.get("year").filter(|y| y.as_str() != "all") {
        if let Ok(y) = year.trim().parse::<i32>() {
            listing.retain(|p| p.year == y);
        }
    }
    listing.sort_by(|a, b| b.year.cmp(&a.year).then(a.id.cmp(&b.id)));
    Ok(ok(listing))
}

async fn create(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let year: i32 = body_str(&body, "year").parse().unwrap_or(0);
    let name = body_str(&body, "name");
    let department = body_str(&body, "department");
    let members = body_str(&body, "members");
    let supervise = body_str(&body, "supervise");
    let status = body_str(&body, "status");
    if year == 0
        || name.is_empty()
        || department.is_empty()
        || members.is_empty()
        || supervise.is_empty()
        || status.is_empty()
    {
        return Ok(fail("缺少必填字段"));
    }
    let created = state
        .store
        .update::<Projects, _, &str>(|doc| {
            let id = doc.allocate();
            let row = Project {
                id,
                year,
                name: name.clone(),
                department: department.clone(),
                members: members.clone(),
                supervise: supervise.clone(),
                status: status.clone(),
            };
            doc.items.push(row.clone());
            Ok(row)
        })
        .context(StoreSnafu)?;
    Ok(match created {
        Ok(row) => ok(row),
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
        .update::<Projects, _, &str>(|doc| {
            let Some(p) = doc.get_mut(id) else {
                return Err("项目不存在");
            };
            // Empty/absent fields keep their current values.
            if let Ok(year) = body_str(&body, "year").parse::<i32>() {
                if year != 0 {
                    p.year = year;
                }
            }
            for (field, slot) in [
                ("name", &mut p.name),
                ("department", &mut p.department),
                ("members", &mut p.members),
                ("supervise", &mut p.supervise),
                ("status", &mut p.status),
            ] {
                let value = body_str(&body, field);
                if !value.is_empty() {
                    *slot = value;
                }
            }
            Ok(p.clone())
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(p) => ok(p),
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
        .update::<Projects, _, &str>(|doc| {
            doc.remove(id).map(|_| ()).ok_or("项目不存在")
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(()) => ok(json!({"deleted": id})),
        Err(msg) => fail(msg),
    })
}

/// Persist a drag-to-reorder: the collection takes on the given id order; ids not present are
/// dropped, unknown ids ignored.
async fn reorder(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let Some(ordered_ids) = body.get("orderedIds").and_then(Value::as_array) else {
        return Ok(fail("排序数据无效"));
    };
    if ordered_ids.is_empty() {
        return Ok(fail("排序数据无效"));
    }
    let ids: Vec<u64> = ordered_ids.iter().filter_map(Value::as_u64).collect();
    state
        .store
        .update::<Projects, _, &str>(|doc| {
            let mut by_id: HashMap<u64, Project> =
                doc.items.drain(..).map(|p| (p.id, p)).collect();
            doc.items = ids.iter().filter_map(|id| by_id.remove(id)).collect();
            Ok(())
        })
        .context(StoreSnafu)?
        .ok();
    Ok(ok(json!({})))
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
        return Ok(fail("请选择要删除的项目"));
    }
    let count = ids.len();
    state
        .store
        .update::<Projects, _, &str>(|doc| {
            doc.items.retain(|p| !ids.contains(&p.id));
            Ok(())
        })
        .context(StoreSnafu)?
        .ok();
    Ok(ok(json!({"deleted": count})))
}

async fn backup(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let doc = state.store.load::<Projects>().context(StoreSnafu)?;
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
    let restored: Vec<Project> = items
        .iter()
        .map(|item| Project {
            id: item.get("id").and_then(Value::as_u64).unwrap_or(0),
            year: row_str(item, &["year"]).parse().unwrap_or(2025),
            name: row_str(item, &["name"]),
            department: row_str(item, &["department"]),
            members: row_str(item, &["members"]),
            supervise: row_str(item, &["supervise"]),
            status: {
                let s = row_str(item, &["status"]);
                if s.is_empty() {
                    "未开始".to_owned()
                } else {
                    s
                }
            },
        })
        .collect();
    let count = restored.len();
    state
        .store
        .update::<Projects, _, &str>(|doc| {
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
        .update::<Projects, _, &str>(|doc| {
            let mut added = 0usize;
            for row in &rows {
                let year = row_str(row, &["year", "年度"]);
                let name = row_str(row, &["name", "项目名称"]);
                let department = row_str(row, &["department", "监督部门"]);
                // A row without the required columns is skipped and consumes no id.
                if year.is_empty() || name.is_empty() || department.is_empty() {
                    continue;
                }
                let status = row_str(row, &["status", "完成情况"]);
                let id = doc.allocate();
                doc.items.push(Project {
                    id,
                    year: year.parse().unwrap_or_else(|_| current_year()),
                    name,
                    department,
                    members: row_str(row, &["members", "小组成员名单"]),
                    supervise: row_str(row, &["supervise", "重点监督内容"]),
                    status: if STATUSES.contains(&status.as_str()) {
                        status
                    } else {
                        "未开始".to_owned()
                    },
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
    template_response(&HEADERS, "minsheng_template.xlsx").context(TemplateSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router(state: Arc<Jiandu>) -> Router<Arc<Jiandu>> {
    let protected = Router::new()
        .route("/api/projects", post(create))
        .route("/api/projects/{id}", put(update))
        .route("/api/projects/{id}", delete(remove))
        .route("/api/projects/reorder", post(reorder))
        .route("/api/projects/batch-delete", post(batch_delete))
        .route("/api/projects/import", post(import))
        .route("/api/backup", get(backup))
        .route("/api/restore", post(restore))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .route("/api/projects", get(list))
        .route("/api/projects/template", get(template))
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
    async fn update_touches_only_the_named_fields() {
        let (_dir, state) = state();
        let rsp = update(
            State(state.clone()),
            axum::extract::Path("1".to_owned()),
            Some(Json(json!({"status": "已完成"}))),
        )
        .await
        .unwrap();
        let body = body_json(rsp).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["status"], "已完成");
        // Everything else on record 1 — and every other record — is untouched.
        let doc = state.store.load::<Projects>().unwrap();
        let p1 = doc.get(1).unwrap();
        assert_eq!(p1.name, "老旧小区改造");
        assert_eq!(p1.department, "住建局");
        assert_eq!(doc.get(2).unwrap().status, "已完成");
        assert_eq!(doc.get(4).unwrap().name, "义务教育学校扩建");
    }

    #[tokio::test]
    async fn import_skips_incomplete_rows_without_burning_ids() {
        let (_dir, state) = state();
        let before = state.store.load::<Projects>().unwrap().next_id;
        let rsp = import(
            State(state.clone()),
            Some(Json(json!({"rows": [
                {"年度": 2025, "项目名称": "河道治理", "监督部门": "水务局"},
                {"年度": 2025, "项目名称": "缺部门"},
            ]}))),
        )
        .await
        .unwrap();
        let body = body_json(rsp).await;
        assert_eq!(body["data"]["imported"], 1);
        let doc = state.store.load::<Projects>().unwrap();
        assert_eq!(doc.next_id, before + 1);
        let added = doc.get(before).unwrap();
        assert_eq!(added.name, "河道治理");
        assert_eq!(added.status, "未开始");
    }

    #[tokio::test]
    async fn restore_recomputes_next_id() {
        let (_dir, state) = state();
        let rsp = restore(
            State(state.clone()),
            Some(Json(json!({"data": [
                {"id": 5, "year": 2024, "name": "甲", "department": "乙"},
                {"id": 2, "year": 2023, "name": "丙", "department": "丁"},
            ]}))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["data"]["restored"], 2);
        let doc = state.store.load::<Projects>().unwrap();
        assert_eq!(doc.next_id, 6);
        // And a subsequent create allocates 6.
        let rsp = create(
            State(state.clone()),
            Some(Json(json!({
                "year": 2025, "name": "新", "department": "局", "members": "众",
                "supervise": "事", "status": "进行中"
            }))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["data"]["id"], 6);
    }

    #[tokio::test]
    async fn reorder_rewrites_the_listing_order() {
        let (_dir, state) = state();
        let rsp = reorder(
            State(state.clone()),
            Some(Json(json!({"orderedIds": [3, 1, 2, 4]}))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);
        let doc = state.store.load::<Projects>().unwrap();
        assert_eq!(doc.items.iter().map(|p| p.id).collect::<Vec<_>>(), [3, 1, 2, 4]);
    }
}
