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

//! # Admin & session API
//!
//! Login/logout, session introspection, and the super-admin-only account management endpoints.
//! Authentication is deliberately primitive — exact-match credentials against the admins
//! collection, opaque in-memory tokens — because this service runs inside the office intranet;
//! see the README before getting ideas about exposing it further.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use snafu::prelude::*;
use tracing::info;

use crate::entities::{Admin, Role};
use crate::http::{
    bearer, body_str, current_user, fail, fail_with, json_body, ok, Jiandu, Result, StoreSnafu,
};
use crate::sessions::Principal;
use crate::store::{Collection, Document};
use crate::util::parse_id;

/// The administrator collection. Seeded with the two standing accounts so a fresh deployment is
/// immediately usable.
pub struct Admins;

impl Collection for Admins {
    type Record = Admin;
    const FILE: &'static str = "admins.json";
    const LIST_FIELD: &'static str = "admins";
    fn seed() -> Document<Admin> {
        Document::seeded(
            vec![
                Admin {
                    id: 1,
                    username: "1312".to_owned(),
                    password: "1312".to_owned(),
                    role: Role::SuperAdmin,
                },
                Admin {
                    id: 2,
                    username: "1645".to_owned(),
                    password: "4688633".to_owned(),
                    role: Role::Admin,
                },
            ],
            3,
        )
    }
}

/// The caller, provided they hold a live super-admin session.
fn super_only(state: &Jiandu, headers: &HeaderMap) -> std::result::Result<Principal, axum::response::Response> {
    match current_user(state, headers) {
        Some(principal) if principal.is_super() => Ok(principal),
        _ => Err(fail_with(StatusCode::FORBIDDEN, "仅超级管理员可操作")),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            sessions                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn login(
    State(state): State<Arc<Jiandu>>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let body = json_body(body);
    let username = body_str(&body, "username");
    let password = body_str(&body, "password");
    if username.is_empty() || password.is_empty() {
        return Ok(fail("请输入用户名和密码"));
    }
    let doc = state.store.load::<Admins>().context(StoreSnafu)?;
    let Some(admin) = doc
        .items
        .iter()
        .find(|a| a.username == username && a.password == password)
    else {
        return Ok(fail("用户名或密码错误"));
    };
    let token = state.sessions.open(Principal {
        username: admin.username.clone(),
        user_id: admin.id,
        role: admin.role,
    });
    info!("Logged-in {} ({}).", admin.username, admin.role);
    Ok(ok(json!({
        "token": token,
        "username": admin.username,
        "role": admin.role,
    })))
}

async fn logout(State(state): State<Arc<Jiandu>>, headers: HeaderMap) -> axum::response::Response {
    if let Some(token) = bearer(&headers) {
        state.sessions.remove(&token);
    }
    ok(json!({}))
}

/// Token introspection: is this session still live, and as whom?
async fn me(State(state): State<Arc<Jiandu>>, headers: HeaderMap) -> axum::response::Response {
    match current_user(&state, &headers) {
        Some(user) => ok(json!({"username": user.username, "role": user.role})),
        None => fail_with(StatusCode::UNAUTHORIZED, "未登录或已下线"),
    }
}

async fn force_logout(
    State(state): State<Arc<Jiandu>>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> axum::response::Response {
    let cur = match super_only(&state, &headers) {
        Ok(cur) => cur,
        Err(rsp) => return rsp,
    };
    let body = json_body(body);
    let target = body_str(&body, "username");
    if target.is_empty() {
        return fail("请指定要下线的用户名");
    }
    if target == cur.username {
        return fail("不能强制自己下线");
    }
    let count = state.sessions.remove_by_username(&target);
    info!("Forced {} offline ({} sessions).", target, count);
    ok(json!({"message": "已强制下线", "count": count}))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       account management                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn list(
    State(state): State<Arc<Jiandu>>,
    headers: HeaderMap,
) -> Result<axum::response::Response> {
    if let Err(rsp) = super_only(&state, &headers) {
        return Ok(rsp);
    }
    let doc = state.store.load::<Admins>().context(StoreSnafu)?;
    // Passwords never leave the process, even for the super admin.
    let listing: Vec<Value> = doc
        .items
        .iter()
        .map(|a| json!({"id": a.id, "username": a.username, "role": a.role}))
        .collect();
    Ok(ok(listing))
}

async fn add(
    State(state): State<Arc<Jiandu>>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    if let Err(rsp) = super_only(&state, &headers) {
        return Ok(rsp);
    }
    let body = json_body(body);
    let username = body_str(&body, "username");
    let password = body_str(&body, "password");
    let role = Role::parse_or_admin(&body_str(&body, "role"));
    if username.is_empty() || password.is_empty() {
        return Ok(fail("请输入用户名和密码"));
    }
    let outcome = state
        .store
        .update::<Admins, _, &str>(|doc| {
            if doc.items.iter().any(|a| a.username == username) {
                return Err("用户名已存在");
            }
            let id = doc.allocate();
            doc.items.push(Admin {
                id,
                username: username.clone(),
                password: password.clone(),
                role,
            });
            Ok(id)
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(id) => ok(json!({"id": id, "username": username, "role": role})),
        Err(msg) => fail(msg),
    })
}

async fn update(
    State(state): State<Arc<Jiandu>>,
    headers: HeaderMap,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
    body: Option<Json<Value>>,
) -> Result<axum::response::Response> {
    let cur = match super_only(&state, &headers) {
        Ok(cur) => cur,
        Err(rsp) => return Ok(rsp),
    };
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail("ID无效"));
    };
    let body = json_body(body);
    let outcome = state
        .store
        .update::<Admins, _, &str>(|doc| {
            let Some(admin) = doc.get_mut(id) else {
                return Err("管理员不存在");
            };
            if admin.role == Role::SuperAdmin && admin.username != cur.username {
                return Err("不可修改其他超级管理员");
            }
            let password = body_str(&body, "password");
            if !password.is_empty() {
                admin.password = password;
            }
            if body.get("role").is_some() {
                let role = body_str(&body, "role");
                if role == "admin" || role == "super_admin" {
                    admin.role = Role::parse_or_admin(&role);
                }
            }
            Ok(json!({"id": admin.id, "username": admin.username, "role": admin.role}))
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(updated) => ok(updated),
        Err(msg) => fail(msg),
    })
}

async fn remove(
    State(state): State<Arc<Jiandu>>,
    headers: HeaderMap,
    axum::extract::Path(raw_id): axum::extract::Path<String>,
) -> Result<axum::response::Response> {
    if let Err(rsp) = super_only(&state, &headers) {
        return Ok(rsp);
    }
    let Some(id) = parse_id(&raw_id) else {
        return Ok(fail("ID无效"));
    };
    let outcome = state
        .store
        .update::<Admins, _, &str>(|doc| {
            let Some(admin) = doc.get(id) else {
                return Err("管理员不存在");
            };
            if admin.role == Role::SuperAdmin {
                return Err("不可删除超级管理员");
            }
            let removed = doc.remove(id);
            Ok(removed.map(|a| a.username).unwrap_or_default())
        })
        .context(StoreSnafu)?;
    Ok(match outcome {
        Ok(username) => {
            // Deleting an account takes its live sessions with it.
            let dropped = state.sessions.remove_by_username(&username);
            info!("Deleted admin {} ({} sessions dropped).", username, dropped);
            ok(json!({"deleted": id}))
        }
        Err(msg) => fail(msg),
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Session + account-management routes. Role checks live in the handlers (the error texts
/// differ per route), so no middleware here.
pub fn make_router(state: Arc<Jiandu>) -> Router<Arc<Jiandu>> {
    Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/me", get(me))
        .route("/api/admin/force-logout", post(force_logout))
        .route("/api/admin/list", get(list))
        .route("/api/admin/add", post(add))
        .route("/api/admin/{id}", put(update))
        .route("/api/admin/{id}", delete(remove))
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

    fn auth_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn seeded_super_admin_can_login_and_out() {
        let (_dir, state) = state();
        let rsp = login(
            State(state.clone()),
            Some(Json(json!({"username": "1312", "password": "1312"}))),
        )
        .await
        .unwrap();
        let body = body_json(rsp).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["role"], "super_admin");
        let token = body["data"]["token"].as_str().unwrap().to_owned();

        let resolved = state.sessions.resolve(&token).unwrap();
        assert_eq!(resolved.username, "1312");

        let _ = logout(State(state.clone()), auth_headers(&token)).await;
        assert!(state.sessions.resolve(&token).is_none());
    }

    #[tokio::test]
    async fn bad_credentials_fail_softly() {
        let (_dir, state) = state();
        let rsp = login(
            State(state),
            Some(Json(json!({"username": "1312", "password": "wrong"}))),
        )
        .await
        .unwrap();
        let (status, body) = (rsp.status(), body_json(rsp).await);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 1);
        assert_eq!(body["msg"], "用户名或密码错误");
    }

    #[tokio::test]
    async fn force_logout_rules() {
        let (_dir, state) = state();
        let su = state.sessions.open(Principal {
            username: "1312".to_owned(),
            user_id: 1,
            role: Role::SuperAdmin,
        });
        let victim = state.sessions.open(Principal {
            username: "1645".to_owned(),
            user_id: 2,
            role: Role::Admin,
        });

        // A super admin may not force themself offline...
        let rsp = force_logout(
            State(state.clone()),
            auth_headers(&su),
            Some(Json(json!({"username": "1312"}))),
        )
        .await;
        assert_eq!(body_json(rsp).await["msg"], "不能强制自己下线");

        // ...but dropping another user removes every one of their sessions.
        let rsp = force_logout(
            State(state.clone()),
            auth_headers(&su),
            Some(Json(json!({"username": "1645"}))),
        )
        .await;
        let body = body_json(rsp).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["count"], 1);
        assert!(state.sessions.resolve(&victim).is_none());

        // Plain admins get a 403.
        let plain = state.sessions.open(Principal {
            username: "1645".to_owned(),
            user_id: 2,
            role: Role::Admin,
        });
        let rsp = force_logout(
            State(state.clone()),
            auth_headers(&plain),
            Some(Json(json!({"username": "1312"}))),
        )
        .await;
        assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn deleting_an_admin_cascades_to_sessions() {
        let (_dir, state) = state();
        // Prime the collection so ids exist.
        let _ = state.store.load::<Admins>().unwrap();
        let su = state.sessions.open(Principal {
            username: "1312".to_owned(),
            user_id: 1,
            role: Role::SuperAdmin,
        });
        let doomed = state.sessions.open(Principal {
            username: "1645".to_owned(),
            user_id: 2,
            role: Role::Admin,
        });

        let rsp = remove(
            State(state.clone()),
            auth_headers(&su),
            axum::extract::Path("2".to_owned()),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["code"], 0);
        assert!(state.sessions.resolve(&doomed).is_none());
        assert!(state
            .store
            .load::<Admins>()
            .unwrap()
            .get(2)
            .is_none());

        // The super admin itself is not deletable.
        let rsp = remove(
            State(state.clone()),
            auth_headers(&su),
            axum::extract::Path("1".to_owned()),
        )
        .await
        .unwrap();
        assert_eq!(body_json(rsp).await["msg"], "不可删除超级管理员");
    }
}
