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

//! # jiandu models
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are
//! truly foundational: one struct per record kind, in the exact wire shape the JSON documents
//! (and the browser front-end) have always used. Field names are therefore the original
//! camel-cased pinyin — they are a persistence format, not a style choice.
//!
//! Every record implements [Identified], which is all the generic document store needs to know
//! about it.

use serde::{Deserialize, Serialize};

use crate::store::{Identified, RecordId};

/// Implement [Identified] for a record type carrying a `pub id: RecordId` field.
macro_rules! identified {
    ($type:ty) => {
        impl Identified for $type {
            fn id(&self) -> RecordId {
                self.id
            }
            fn set_id(&mut self, id: RecordId) {
                self.id = id;
            }
        }
    };
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       admins & principals                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Administrator role. Only two tiers exist; `super_admin` additionally manages accounts and may
/// force other sessions offline.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Role {
    #[serde(rename = "admin")]
    Admin,
    #[serde(rename = "super_admin")]
    SuperAdmin,
}

impl Role {
    /// Parse the wire form, falling back to plain admin on anything unrecognized (the historical
    /// behavior for hand-edited documents).
    pub fn parse_or_admin(text: &str) -> Role {
        match text.trim() {
            "super_admin" => Role::SuperAdmin,
            _ => Role::Admin,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::SuperAdmin => write!(f, "super_admin"),
        }
    }
}

fn default_role() -> Role {
    Role::Admin
}

/// An administrator account. Credentials are stored and compared in the clear; this service
/// trusts its deployment boundary (see the project README).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Admin {
    pub id: RecordId,
    pub username: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

identified!(Admin);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            projects                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A supervised project (民生实事项目).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Project {
    pub id: RecordId,
    pub year: i32,
    pub name: String,
    pub department: String,
    #[serde(default)]
    pub members: String,
    #[serde(default)]
    pub supervise: String,
    #[serde(default)]
    pub status: String,
}

identified!(Project);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     directives (领导批示)                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A leadership directive under supervision (批示督办). All fields are free text; `pishiDate` is
/// normalized to `YYYY-MM-DD` on the way in and out.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub qishu: String,
    #[serde(default)]
    pub laiwen_unit: String,
    #[serde(default)]
    pub wenhao: String,
    #[serde(default)]
    pub pishi_content: String,
    #[serde(default)]
    pub pishi_date: String,
    #[serde(default)]
    pub leader_dept: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub luoshi_cuoshi: String,
    #[serde(default)]
    pub complete_status: String,
}

identified!(Directive);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      periodic work logs                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One entry of the standing committee's monthly key-work schedule (每月重点工作). An entry is
/// either a scheduled item (times, location, attendees) or an uploaded document; both live in the
/// same collection, so the attachment fields are optional.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyLog {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub month: String,
    #[serde(default)]
    pub time1: String,
    #[serde(default)]
    pub time2: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub leaders: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

identified!(MonthlyLog);

/// One entry of the weekly work log (每周工作), optionally carrying an uploaded PDF.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyLog {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub month: String,
    #[serde(default)]
    pub week: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

identified!(WeeklyLog);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     statutes (法律法规)                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One revision in a statute's history.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StatuteRevision {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub name: String,
}

/// A statute or regulation, always backed by an uploaded document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statute {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub issuing_authority: String,
    #[serde(default)]
    pub publication_date: String,
    #[serde(default)]
    pub effective_date: String,
    /// 有效 / 尚未生效; recomputed from `effectiveDate` whenever that changes.
    #[serde(default)]
    pub validity: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub history: Vec<StatuteRevision>,
    #[serde(default)]
    pub related_docs: Vec<serde_json::Value>,
}

identified!(Statute);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      attachment records                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A progress document for the supervised projects (民生实事进展资料).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDoc {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub original_name: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub upload_date: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

identified!(ProgressDoc);

/// A directive-handling report (批示办理情况报告).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveReport {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub original_name: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub upload_date: String,
    #[serde(default)]
    pub created_at: String,
}

identified!(DirectiveReport);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    supervision topics (监督议题)                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A supervision topic on the yearly plan. `month` is 1–12, or 0 when unscheduled; `form` is
/// restricted to the five supervision forms (see [crate::topics::FORM_OPTIONS]).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Topic {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub month: u32,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub form: String,
    #[serde(default)]
    pub department: String,
}

identified!(Topic);

/// A document attached to a supervision topic.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicFile {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub topic_id: RecordId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub original_name: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub upload_date: String,
    #[serde(default)]
    pub created_at: String,
}

identified!(TopicFile);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          departments                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A supervising department. The name doubles as a by-value foreign key in project, progress and
/// topic records, which is why renames cascade (see [crate::departments]).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Department {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
}

identified!(Department);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn role_wire_form() {
        assert_eq!(
            serde_json::to_string(&Role::SuperAdmin).unwrap(),
            "\"super_admin\""
        );
        assert_eq!(Role::parse_or_admin("super_admin"), Role::SuperAdmin);
        assert_eq!(Role::parse_or_admin("root"), Role::Admin);
    }

    #[test]
    fn directive_field_names() {
        let d = Directive {
            id: 7,
            laiwen_unit: "市政府办".to_owned(),
            ..Directive::default()
        };
        let v = serde_json::to_value(&d).unwrap();
        // The persisted documents use camel-cased pinyin; make sure serde keeps that contract.
        assert_eq!(v["laiwenUnit"], "市政府办");
        assert!(v.get("laiwen_unit").is_none());
    }

    #[test]
    fn monthly_log_omits_absent_attachment() {
        let m = MonthlyLog {
            id: 1,
            month: "2025-01".to_owned(),
            ..MonthlyLog::default()
        };
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("filePath").is_none());
    }
}
