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

//! # http
//!
//! Application state and the wire conventions shared by every API module.
//!
//! The response envelope is the one the front-end has always consumed: successes are
//! `{code: 0, msg: "成功", data}`, and *expected* failures — validation, unknown ids, blocked
//! cascades — are `{code: 1, msg}` carried with an HTTP 200 ("soft failures"). Only three things
//! escape that envelope's status: missing/invalid sessions (401), insufficient role (403), and
//! genuine I/O or parse faults (500). The [Error] type here is the request-boundary translator
//! for that last class.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::json;
use snafu::prelude::*;
use tracing::{debug, error};
use uuid::Uuid;

use crate::sessions::{Principal, SessionRegistry};
use crate::store::Store;
use crate::{store, tabular, uploads};

/// Application state available to all handlers.
pub struct Jiandu {
    pub store: Store,
    pub sessions: SessionRegistry,
    pub instance_id: Uuid,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       response envelope                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A successful reply: `{code: 0, msg: "成功", data}`.
pub fn ok<T: Serialize>(data: T) -> axum::response::Response {
    Json(json!({"code": 0, "msg": "成功", "data": data})).into_response()
}

/// A soft failure: `{code: 1, msg}` under HTTP 200. The transport succeeded; the operation
/// didn't.
pub fn fail(msg: impl Into<String>) -> axum::response::Response {
    Json(json!({"code": 1, "msg": msg.into()})).into_response()
}

/// The same failure body under an explicit status (401/403/404).
pub fn fail_with(status: StatusCode, msg: impl Into<String>) -> axum::response::Response {
    (status, Json(json!({"code": 1, "msg": msg.into()}))).into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Unexpected failures crossing the request boundary. Handlers return
/// `Result<Response, Error>`; anything landing here becomes a 500 in the standard envelope,
/// with the underlying message — these are operator-facing, not attacker-facing, so we don't
/// redact.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{source}"))]
    Store { source: store::Error },
    #[snafu(display("{source}"))]
    Upload { source: uploads::Error },
    #[snafu(display("{source}"))]
    Template { source: tabular::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", self))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        error!("{:?}", self);
        let (status, msg) = self.as_status_and_msg();
        fail_with(status, msg)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         authentication                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        request bodies                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The original accepted absent/empty JSON bodies everywhere (`req.body || {}`); handlers take
/// `Option<Json<Value>>` and funnel it through here.
pub fn json_body(body: Option<Json<serde_json::Value>>) -> serde_json::Value {
    body.map(|Json(v)| v).unwrap_or_else(|| json!({}))
}

/// A body field as a trimmed string, however it was typed (the front-end sends years as numbers
/// or strings depending on which form produced them).
pub fn body_str(body: &serde_json::Value, key: &str) -> String {
    body.get(key).map(tabular::cell_string).unwrap_or_default()
}

/// Field presence; partial updates only touch fields the client actually sent.
pub fn body_has(body: &serde_json::Value, key: &str) -> bool {
    body.get(key).is_some()
}

/// Pull the bearer token out of the `Authorization` header, if any.
pub fn bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?;
    let text = value.to_str().ok()?;
    text.strip_prefix("Bearer ").map(str::to_owned)
}

/// The principal behind this request's token, if the session is live.
pub fn current_user(state: &Jiandu, headers: &HeaderMap) -> Option<Principal> {
    bearer(headers).and_then(|token| state.sessions.resolve(&token))
}

/// Function middleware guarding the mutating routes: no live session, no entry.
///
/// On success the [Principal] is inserted into the request extensions, where handlers that care
/// about the caller's role pick it up via the `Extension` extractor. Apply with `route_layer` so
/// only the routes that opted in pay for it.
pub async fn require_auth(
    State(state): State<Arc<Jiandu>>,
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    match current_user(&state, request.headers()) {
        Some(principal) => {
            debug!("Authenticated {} ({}).", principal.username, principal.role);
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        None => fail_with(
            StatusCode::UNAUTHORIZED,
            "未登录或已被强制下线，请重新登录",
        ),
    }
}
