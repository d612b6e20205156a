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

//! # sessions
//!
//! The session registry: an in-memory map from opaque bearer token to authenticated principal.
//! Sessions live exactly as long as the process — that is a deliberate property of this system,
//! not an accident: restarting the service logs everyone out.
//!
//! The service of record kept this map in a module-level global; here it's an explicit value
//! owned by the application state and injected into the handlers, guarded by a mutex since the
//! runtime is multi-threaded.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::Engine;
use rand::RngCore;
use serde::Serialize;

use crate::entities::Role;
use crate::store::RecordId;

/// The authenticated identity behind a session token.
#[derive(Clone, Debug, Serialize)]
pub struct Principal {
    pub username: String,
    #[serde(rename = "userId")]
    pub user_id: RecordId,
    pub role: Role,
}

impl Principal {
    pub fn is_super(&self) -> bool {
        self.role == Role::SuperAdmin
    }
}

/// Process-lifetime token → principal map.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, Principal>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    /// Mint a token for `username` and register the session.
    ///
    /// The original derived tokens from username, wall-clock time and a PRNG float, with no
    /// uniqueness check; this keeps the same ingredients but swaps the float for sixteen bytes
    /// of OS entropy, making a collision a non-concern rather than a "probably fine".
    pub fn open(&self, principal: Principal) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let mut seed = format!("{}:{}:", principal.username, millis).into_bytes();
        seed.extend_from_slice(&nonce);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(seed);
        self.inner
            .lock()
            .expect("lock poisoned")
            .insert(token.clone(), principal);
        token
    }

    pub fn resolve(&self, token: &str) -> Option<Principal> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .get(token)
            .cloned()
    }

    /// Remove one session; absent tokens are a no-op, as logout must be idempotent.
    pub fn remove(&self, token: &str) {
        self.inner.lock().expect("lock poisoned").remove(token);
    }

    /// Remove every session belonging to `username`, returning how many were dropped. Used for
    /// forced logout and when an admin account is deleted.
    pub fn remove_by_username(&self, username: &str) -> usize {
        let mut map = self.inner.lock().expect("lock poisoned");
        let before = map.len();
        map.retain(|_, p| p.username != username);
        before - map.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn principal(username: &str, role: Role) -> Principal {
        Principal {
            username: username.to_owned(),
            user_id: 1,
            role,
        }
    }

    #[test]
    fn lifecycle() {
        let sessions = SessionRegistry::new();
        let token = sessions.open(principal("1312", Role::SuperAdmin));
        let resolved = sessions.resolve(&token).unwrap();
        assert_eq!(resolved.username, "1312");
        assert_eq!(resolved.role, Role::SuperAdmin);

        sessions.remove(&token);
        assert!(sessions.resolve(&token).is_none());
        // Logging out twice is fine.
        sessions.remove(&token);
    }

    #[test]
    fn force_logout_removes_all_of_a_username() {
        let sessions = SessionRegistry::new();
        let t1 = sessions.open(principal("1312", Role::SuperAdmin));
        let t2 = sessions.open(principal("1312", Role::SuperAdmin));
        let other = sessions.open(principal("1645", Role::Admin));
        assert_eq!(sessions.remove_by_username("1312"), 2);
        assert!(sessions.resolve(&t1).is_none());
        assert!(sessions.resolve(&t2).is_none());
        assert!(sessions.resolve(&other).is_some());
    }

    #[test]
    fn tokens_are_distinct() {
        let sessions = SessionRegistry::new();
        let t1 = sessions.open(principal("1312", Role::SuperAdmin));
        let t2 = sessions.open(principal("1312", Role::SuperAdmin));
        assert_ne!(t1, t2);
    }
}
