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

//! # Department registry
//!
//! Departments are referenced *by name* from project, progress and topic records — a by-value
//! foreign key. That makes this the one place in the system where a write fans out: renaming a
//! department rewrites every referencing record across three other collections, and deleting
//! one is refused while any reference survives. The fan-out runs with all four collection locks
//! held (sorted acquisition, see [Store::with_locks]) and mutates every document before any
//! file is committed.

use std::sync::Arc;

use axum::{
    extract::State,
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use itertools::Itertools;
use serde_json::{json, Value};
use snafu::prelude::*;
use tracing::info;

use crate::entities::Department;
use crate::http::{
    body_str, fail, json_body, ok, require_auth, Jiandu, Result, StoreSnafu,
};
use crate::progress::ProgressDocs;
use crate::projects::Projects;
use crate::store::{self, Collection, Document, Store};
use crate::topics::Topics;
use crate::util::parse_id;

pub struct Departments;

impl Collection for Departments {
    type Record = Department;
    const FILE: &'static str = "departments.json";
}

/// Load the registry, deriving its first-run contents from the department names already present
/// on the project roster (the registry postdates the projects collection).
pub fn load_departments(store: &Store) -> std::result::Result<Document<Department>, store::Error> {
    store.with_locks(&[Departments::FILE, Projects::FILE], || {
        if store.root().join(Departments::FILE).exists() {
            return store.load::<Departments>();
        }
        let projects = store.load::<Projects>()?;
        let items: Vec<Department> = projects
            .items
            .iter()
            .map(|p| p.department.trim())
            .filter(|name| !name.is_empty())
            .unique()
            .enumerate()
            .map(|(i, name)| Department {
                id: i as u64 + 1,
                name: name.to_owned(),
            })
            .collect();
        let next_id = items.len() as u64 + 1;
        let doc = Document::seeded(items, next_id);
        store.save::<Departments>(&doc)?;
        Ok(doc)
    })
}

/// Rewrite `department` on every referencing record. Caller holds the collection locks.
///
/// Every collection is loaded and mutated before the first commit, so any load failure aborts
/// the cascade with nothing written.
fn cascade_rename(store: &Store, old: &str, new: &str) -> std::result::Result<(), store::Error> {
    let mut projects = store.load::<Projects>()?;
    let mut progress = store.load::<ProgressDocs>()?;
    let mut topics = store.load::<Topics>()?;
    for p in projects.items.iter_mut().filter(|p| p.department == old) {
        p.department = new.to_owned();
    }
    for p in progress.items.iter_mut().filter(|p| p.department == old) {
        p.department = new.to_owned();
    }
    for t in topics.items.iter_mut().filter(|t| t.department == old) {
        t.department = new.to_owned();
    }
    store.save::<Projects>(&projects)?;
    store.save::<ProgressDocs>(&progress)?;
    store.save::<Topics>(&topics)?;
    Ok(())
}

/// Does any record anywhere still reference this department name?
fn is_referenced(store: &Store, name: &str) -> std::result::Result<bool, store::Error> {
    Ok(store
        .load::<Projects>()?
        .items
        .iter()
        .any(|p| p.department == name)
        || store
            .load::<ProgressDocs>()?
            .items
            .iter()
            .any(|p| p.department == name)
        || store
            .load::<Topics>()?
            .items
            .iter()
            .any(|t| t.department == name))
}

const CASCADE_FILES: [&str; 4] = [
    Departments::FILE,
    Projects::FILE,
    ProgressDocs::FILE,
    Topics::FILE,
];

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list(State(state): State<Arc<Jiandu>>) -> Result<axum::response::Response> {
    let mut doc = load_departments(&state.store).context(StoreSnafu)?;
    doc.items.sort_by_key(|d| d.id);
    Ok(ok(doc.items))
}

async fn create(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let name = body_str(&body, "name");
    if name.is_empty() {
        return Ok(fail("部门名称不能为空"));
    }
    load_departments(&state.store).context(StoreSnafu)?;
    let requested_id = body_str(&body, "id").parse::<u64>().ok();
    let outcome = state
        .store
        .update::<Departments, _, &str>(|doc| {
            if doc.items.iter().any(|d| d.name == name) {
                return Err("部门名称已存在");
            }
            // An explicit, positive, unclaimed id is honored; anything else gets allocated.
            let id = match requested_id {
                Some(id) if id > 0 && doc.get(id).is_none() => id,
                _ => doc.allocate(),
            };
            doc.items.push(Department {
                id,
                name: name.clone(),
            });
            doc.items.sort_by_key(|d| d.id);
            if doc.next_id <= id {
                doc.next_id = id + 1;
            }
            Ok(id)
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(id) => ok(json!({"id": id, "name": name})),
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
    let new_name = body_str(&body, "name");
    let new_id = body_str(&body, "id").parse::<u64>().ok().filter(|n| *n > 0);
    load_departments(&state.store).context(StoreSnafu)?;
    let store = &state.store;
    let outcome: std::result::Result<std::result::Result<Department, &str>, store::Error> = store
        .with_locks(&CASCADE_FILES, || {
            let mut doc = store.load::<Departments>()?;
            let Some(dept) = doc.get_mut(id) else {
                return Ok(Err("部门不存在"));
            };
            let old_name = dept.name.clone();
            if !new_name.is_empty() {
                dept.name = new_name.clone();
            }
            if let Some(new_id) = new_id {
                if new_id != id {
                    dept.id = new_id;
                }
            }
            let updated = dept.clone();
            doc.items.sort_by_key(|d| d.id);
            // Every referencing document is loaded & mutated before anything is written back.
            if !new_name.is_empty() && new_name != old_name {
                cascade_rename(store, &old_name, &new_name)?;
                info!("Renamed department {} -> {}.", old_name, new_name);
            }
            store.save::<Departments>(&doc)?;
            Ok(Ok(updated))
        });
    Ok(match outcome.context(StoreSnafu)? {
        Ok(updated) => ok(updated),
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
    load_departments(&state.store).context(StoreSnafu)?;
    let store = &state.store;
    let outcome: std::result::Result<std::result::Result<(), &str>, store::Error> = store
        .with_locks(&CASCADE_FILES, || {
            let mut doc = store.load::<Departments>()?;
            let Some(dept) = doc.get(id) else {
                return Ok(Err("部门不存在"));
            };
            if is_referenced(store, &dept.name)? {
                return Ok(Err("该部门下存在项目、进展资料或监督议题，无法删除"));
            }
            doc.remove(id);
            store.save::<Departments>(&doc)?;
            Ok(Ok(()))
        });
    Ok(match outcome.context(StoreSnafu)? {
        Ok(()) => ok(json!({"deleted": id})),
        Err(msg) => fail(msg),
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router(state: Arc<Jiandu>) -> Router<Arc<Jiandu>> {
    let protected = Router::new()
        .route("/api/departments", post(create))
        .route("/api/departments/{id}", put(update))
        .route("/api/departments/{id}", delete(remove))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .route("/api/departments", get(list))
        .merge(protected)
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::{ProgressDoc, Topic};
    use crate::sessions::SessionRegistry;

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

    /// Seed progress & topic records referencing the seeded project departments.
    fn seed_references(store: &Store) {
        store
            .update::<ProgressDocs, _, ()>(|doc| {
                let id = doc.allocate();
                doc.items.push(ProgressDoc {
                    id,
                    department: "住建局".to_owned(),
                    title: "进展".to_owned(),
                    ..ProgressDoc::default()
                });
                Ok(())
            })
            .unwrap()
            .unwrap();
        store
            .update::<Topics, _, ()>(|doc| {
                let id = doc.allocate();
                doc.items.push(Topic {
                    id,
                    year: 2025,
                    month: 3,
                    content: "议题".to_owned(),
                    form: "视察".to_owned(),
                    department: "民政局".to_owned(),
                });
                Ok(())
            })
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn first_load_seeds_from_projects() {
        let (_dir, state) = state();
        let doc = load_departments(&state.store).unwrap();
        let names: Vec<&str> = doc.items.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["住建局", "民政局", "水利局", "教育局"]);
        assert_eq!(doc.next_id, 5);
    }

    #[tokio::test]
    async fn rename_cascades_to_every_referencing_collection() {
        let (_dir, state) = state();
        seed_references(&state.store);
        let _ = load_departments(&state.store).unwrap();

        let rsp = update(
            State(state.clone()),
            axum::extract::Path("1".to_owned()),
            Some(Json(json!({"name": "市住建局"}))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);

        let projects = state.store.load::<Projects>().unwrap();
        assert!(projects.items.iter().any(|p| p.department == "市住建局"));
        assert!(!projects.items.iter().any(|p| p.department == "住建局"));
        let progress = state.store.load::<ProgressDocs>().unwrap();
        assert_eq!(progress.items[0].department, "市住建局");
        // Records under other departments are left alone.
        let topics = state.store.load::<Topics>().unwrap();
        assert_eq!(topics.items[0].department, "民政局");
    }

    #[tokio::test]
    async fn referenced_departments_refuse_deletion() {
        let (_dir, state) = state();
        seed_references(&state.store);
        let before = load_departments(&state.store).unwrap();

        let rsp = remove(State(state.clone()), axum::extract::Path("1".to_owned()))
            .await
            .unwrap();
        let body = body_json(rsp).await;
        assert_eq!(body["code"], 1);
        assert_eq!(body["msg"], "该部门下存在项目、进展资料或监督议题，无法删除");
        let after = state.store.load::<Departments>().unwrap();
        assert_eq!(after.items.len(), before.items.len());
    }

    #[tokio::test]
    async fn unreferenced_departments_delete_cleanly() {
        let (_dir, state) = state();
        let _ = load_departments(&state.store).unwrap();
        let rsp = create(
            State(state.clone()),
            Some(Json(json!({"name": "司法局"}))),
        )
        .await
        .unwrap();
        let id = body_json(rsp).await["data"]["id"].as_u64().unwrap();
        let rsp = remove(
            State(state.clone()),
            axum::extract::Path(id.to_string()),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);
        assert!(state.store.load::<Departments>().unwrap().get(id).is_none());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let (_dir, state) = state();
        let _ = load_departments(&state.store).unwrap();
        let rsp = create(
            State(state.clone()),
            Some(Json(json!({"name": "住建局"}))),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["msg"], "部门名称已存在");
    }
}
