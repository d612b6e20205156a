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

//! # jiandu
//!
//! Record-keeping backend for a municipal supervisory office: projects under supervision,
//! leadership directives (批示), periodic work logs, statutes & regulations, and their attached
//! documents, served over a small JSON-over-HTTP API.
//!
//! There is no database server anywhere in this system: each collection of records is one
//! pretty-printed JSON document on local disk, fronted by a read-through cache and a per-collection
//! lock. See the [store] module for that core; everything else is a thin, uniform API layer
//! over it.

pub mod admins;
pub mod departments;
pub mod directives;
pub mod entities;
pub mod http;
pub mod monthly;
pub mod preview;
pub mod progress;
pub mod projects;
pub mod reports;
pub mod sessions;
pub mod statutes;
pub mod store;
pub mod tabular;
pub mod topics;
pub mod uploads;
pub mod util;
pub mod weekly;
