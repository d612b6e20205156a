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

//! # store
//!
//! ## Introduction
//!
//! The storage layer for jiandu. Every collection of records — projects, directives, work logs,
//! and so on — is one JSON document on local disk holding the record list plus a `nextId`
//! counter. This module is the *only* code that touches those files; everything above it works
//! in terms of two small traits:
//!
//! - [Collection]: describes one record collection (its file name, the name of the list field
//!   in the document, and the payload to materialize on first run);
//! - [Singleton]: describes a one-off document that isn't a record list (the supervision-form
//!   ordering, for instance).
//!
//! The original service hand-wrote a load/save pair per collection; collapsing that into one
//! generic [Store] parametrized by descriptors was an explicit goal of this rewrite.
//!
//! ## Caching
//!
//! Reads go through a process-lifetime cache of parsed documents. An entry is keyed by path and
//! stamped with the *write generation* of that path: a counter this store bumps on every save.
//! A cached entry is served only while its stamp matches the current generation, and every save
//! additionally drops the entry outright. The service of record keyed this cache on file mtime
//! instead, which can serve stale content when a write and a read land within the filesystem's
//! timestamp resolution; the generation counter closes that hole. The cache is unbounded and
//! never evicted — the set of backing paths is small and fixed.
//!
//! ## Locking
//!
//! The original ran on a single-threaded runtime and could interleave two load-mutate-save
//! sequences only between requests; under a multi-threaded runtime that becomes a lost-update
//! race. Each collection therefore gets a mutex, held across [Store::update]'s load-mutate-save.
//! Cross-collection writes (the department cascade) take every involved lock, in sorted order,
//! via [Store::with_locks]. Plain reads deliberately take no lock: they see either the previous
//! or the next committed document, both of which are consistent.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    result::Result as StdResult,
    sync::{Arc, Mutex},
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create directory {}: {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{} doesn't hold the expected document shape: {source}", path.display()))]
    Shape {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize the document for {}: {source}", path.display()))]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to write {}: {source}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to commit {}: {source}", path.display()))]
    Commit {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to copy legacy data {} to {}: {source}", from.display(), to.display()))]
    Migrate {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    documents & descriptors                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Record identifiers are small positive integers, allocated per collection, never reused.
pub type RecordId = u64;

/// The one thing the store needs to know about a record: how to read & write its id.
pub trait Identified {
    fn id(&self) -> RecordId;
    fn set_id(&mut self, id: RecordId);
}

/// One collection document: the records plus the next id to hand out.
///
/// Invariants: every record's id is unique and strictly less than `next_id`; `next_id` never
/// decreases; ids are not reused after deletion.
#[derive(Clone, Debug)]
pub struct Document<R> {
    pub items: Vec<R>,
    pub next_id: RecordId,
}

impl<R> Default for Document<R> {
    fn default() -> Self {
        Document {
            items: Vec::new(),
            next_id: 1,
        }
    }
}

impl<R: Identified> Document<R> {
    pub fn seeded(items: Vec<R>, next_id: RecordId) -> Document<R> {
        Document { items, next_id }
    }
    /// Hand out the next id. Call only while holding this collection's lock (i.e. from within
    /// [Store::update] or [Store::with_locks]).
    pub fn allocate(&mut self) -> RecordId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
    pub fn get(&self, id: RecordId) -> Option<&R> {
        self.items.iter().find(|r| r.id() == id)
    }
    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut R> {
        self.items.iter_mut().find(|r| r.id() == id)
    }
    /// Remove the record with the given id, returning it (the caller may need its attachment
    /// path for cleanup).
    pub fn remove(&mut self, id: RecordId) -> Option<R> {
        let idx = self.items.iter().position(|r| r.id() == id)?;
        Some(self.items.remove(idx))
    }
    /// Rebuild a document from backed-up records. Ids present in the backup are preserved;
    /// records without one are numbered from a running counter, and `next_id` ends up strictly
    /// greater than every id, so a subsequent create can never collide.
    pub fn restore(items: Vec<R>) -> Document<R> {
        let mut next: RecordId = 1;
        let mut restored = Vec::with_capacity(items.len());
        for mut item in items {
            let mut id = item.id();
            if id == 0 {
                id = next;
            }
            if id >= next {
                next = id + 1;
            }
            item.set_id(id);
            restored.push(item);
        }
        Document {
            items: restored,
            next_id: next,
        }
    }
}

/// Descriptor for one JSON-backed record collection.
pub trait Collection {
    type Record: Identified + Clone + Serialize + DeserializeOwned + Send;
    /// File name under the database directory, e.g. `pishi.json`.
    const FILE: &'static str;
    /// Name of the document field holding the record list. Two legacy collections predate the
    /// uniform `items` convention.
    const LIST_FIELD: &'static str = "items";
    /// The payload materialized on first load. Empty-plus-one for most collections.
    fn seed() -> Document<Self::Record> {
        Document::default()
    }
}

/// Descriptor for a one-off (non-record-list) document.
pub trait Singleton {
    type Data: Clone + Serialize + DeserializeOwned + Send;
    const FILE: &'static str;
    fn seed() -> Self::Data;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the store                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct CacheEntry {
    generation: u64,
    value: Value,
}

/// The document store: a database directory, a read-through cache, and the collection locks.
pub struct Store {
    root: PathBuf,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
    generations: Mutex<HashMap<PathBuf, u64>>,
    locks: Mutex<HashMap<&'static str, Arc<Mutex<()>>>>,
}

impl Store {
    /// `data_dir` is the service's data directory; `db_name` selects the database directory
    /// beneath it (historically "jiandu").
    pub fn new(data_dir: &Path, db_name: &str) -> Store {
        Store {
            root: data_dir.join(db_name),
            cache: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The database directory; upload subdirectories live beneath it.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    fn collection_lock(&self, file: &'static str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .expect("lock poisoned")
            .entry(file)
            .or_default()
            .clone()
    }

    fn generation(&self, path: &Path) -> u64 {
        self.generations
            .lock()
            .expect("lock poisoned")
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Drop any cached entry for `path` and advance its write generation. Invoked by every
    /// save, unconditionally.
    fn invalidate(&self, path: &Path) {
        *self
            .generations
            .lock()
            .expect("lock poisoned")
            .entry(path.to_path_buf())
            .or_insert(0) += 1;
        self.cache.lock().expect("lock poisoned").remove(path);
    }

    fn ensure_root(&self) -> Result<()> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).context(CreateDirSnafu {
                path: self.root.clone(),
            })?;
        }
        Ok(())
    }

    /// Read-through load of the raw document at `path`, materializing `seed` on first run.
    fn load_value(&self, path: &Path, seed: &dyn Fn() -> Result<Value>) -> Result<Value> {
        let generation = self.generation(path);
        if let Some(entry) = self.cache.lock().expect("lock poisoned").get(path) {
            if entry.generation == generation {
                return Ok(entry.value.clone());
            }
        }
        self.ensure_root()?;
        let value = if path.exists() {
            let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
            serde_json::from_str::<Value>(&text).context(ParseSnafu { path })?
        } else {
            // First run for this collection: persist the default payload before returning it,
            // so a second load sees the identical document.
            let value = seed()?;
            self.write_value(path, &value)?;
            debug!("Materialized {} with its default payload.", path.display());
            value
        };
        // The write generation may have moved (seeding bumps it); stamp the entry with the
        // current value so it stays servable.
        let generation = self.generation(path);
        self.cache.lock().expect("lock poisoned").insert(
            path.to_path_buf(),
            CacheEntry {
                generation,
                value: value.clone(),
            },
        );
        Ok(value)
    }

    /// Serialize `value` (stable key order, 2-space indent — the on-disk format the front-end's
    /// operators read and diff), write it beside `path` and rename into place, then invalidate.
    fn write_value(&self, path: &Path, value: &Value) -> Result<()> {
        self.ensure_root()?;
        let text = serde_json::to_string_pretty(value).context(SerializeSnafu { path })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text.as_bytes()).context(WriteSnafu { path: tmp.clone() })?;
        std::fs::rename(&tmp, path).context(CommitSnafu { path })?;
        self.invalidate(path);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        collections                                         //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Load a collection document, seeding the file on first run. Takes no collection lock; see
    /// the module docs for why that's sound.
    pub fn load<C: Collection>(&self) -> Result<Document<C::Record>> {
        let path = self.path_of(C::FILE);
        let value = self.load_value(&path, &|| doc_to_value::<C>(&C::seed(), &path))?;
        doc_from_value::<C>(&value).context(ShapeSnafu { path })
    }

    /// Persist a collection document.
    pub fn save<C: Collection>(&self, doc: &Document<C::Record>) -> Result<()> {
        let path = self.path_of(C::FILE);
        let value = doc_to_value::<C>(doc, &path)?;
        self.write_value(&path, &value)
    }

    /// The load-mutate-save primitive, run under this collection's lock.
    ///
    /// `f`'s error channel is for *domain* outcomes (record not found, validation failure): on
    /// `Err` the document is **not** written back. Store-level failures surface in the outer
    /// `Result`.
    pub fn update<C, T, E>(
        &self,
        f: impl FnOnce(&mut Document<C::Record>) -> StdResult<T, E>,
    ) -> Result<StdResult<T, E>>
    where
        C: Collection,
    {
        let lock = self.collection_lock(C::FILE);
        let _guard = lock.lock().expect("lock poisoned");
        let mut doc = self.load::<C>()?;
        match f(&mut doc) {
            Ok(out) => {
                self.save::<C>(&doc)?;
                Ok(Ok(out))
            }
            Err(err) => Ok(Err(err)),
        }
    }

    /// Run `f` while holding the locks of every named collection, acquired in sorted order so
    /// two overlapping cascades can't deadlock. Within `f`, use [Store::load]/[Store::save]
    /// directly — *not* [Store::update], whose lock is not re-entrant.
    pub fn with_locks<T>(&self, files: &[&'static str], f: impl FnOnce() -> T) -> T {
        let mut files = files.to_vec();
        files.sort_unstable();
        files.dedup();
        let mutexes: Vec<Arc<Mutex<()>>> = files
            .iter()
            .copied()
            .map(|file| self.collection_lock(file))
            .collect();
        let _guards: Vec<_> = mutexes
            .iter()
            .map(|m| m.lock().expect("lock poisoned"))
            .collect();
        f()
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                         singletons                                         //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    pub fn load_singleton<S: Singleton>(&self) -> Result<S::Data> {
        let path = self.path_of(S::FILE);
        let value = self.load_value(&path, &|| {
            serde_json::to_value(S::seed()).context(SerializeSnafu { path: path.clone() })
        })?;
        serde_json::from_value(value).context(ShapeSnafu { path })
    }

    pub fn update_singleton<S, T, E>(
        &self,
        f: impl FnOnce(&mut S::Data) -> StdResult<T, E>,
    ) -> Result<StdResult<T, E>>
    where
        S: Singleton,
    {
        let lock = self.collection_lock(S::FILE);
        let _guard = lock.lock().expect("lock poisoned");
        let mut data = self.load_singleton::<S>()?;
        match f(&mut data) {
            Ok(out) => {
                let path = self.path_of(S::FILE);
                let value =
                    serde_json::to_value(&data).context(SerializeSnafu { path: path.clone() })?;
                self.write_value(&path, &value)?;
                Ok(Ok(out))
            }
            Err(err) => Ok(Err(err)),
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                      legacy migration                                      //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// One-time migration from the two historical layouts (`data/*.json` flat files and the
    /// `data/minsheng/` directory) into the database directory. A destination file that already
    /// exists is never touched.
    pub fn migrate_legacy(&self, data_dir: &Path) -> Result<()> {
        self.ensure_root()?;
        let legacy_dir = data_dir.join("minsheng");
        for name in [
            "projects.json",
            "admins.json",
            "pishi.json",
            "meiyue.json",
            "meizhou.json",
            "falv.json",
        ] {
            let dest = self.root.join(name);
            if dest.exists() {
                continue;
            }
            let flat = data_dir.join(name);
            let nested = legacy_dir.join(name);
            let source = if matches!(name, "projects.json" | "admins.json") && flat.exists() {
                Some(flat)
            } else if nested.exists() {
                Some(nested)
            } else {
                None
            };
            if let Some(source) = source {
                std::fs::copy(&source, &dest).context(MigrateSnafu {
                    from: source.clone(),
                    to: dest.clone(),
                })?;
                info!("Migrated {} into {}.", source.display(), self.root.display());
            }
        }
        Ok(())
    }
}

fn doc_to_value<C: Collection>(doc: &Document<C::Record>, path: &Path) -> Result<Value> {
    let mut map = serde_json::Map::new();
    map.insert(
        C::LIST_FIELD.to_owned(),
        serde_json::to_value(&doc.items).context(SerializeSnafu { path })?,
    );
    map.insert("nextId".to_owned(), Value::from(doc.next_id));
    Ok(Value::Object(map))
}

fn doc_from_value<C: Collection>(
    value: &Value,
) -> StdResult<Document<C::Record>, serde_json::Error> {
    let seed = C::seed();
    let items = match value.get(C::LIST_FIELD) {
        Some(list) => serde_json::from_value(list.clone())?,
        // A hand-edited document missing its list field falls back to the seed records, as the
        // original service did.
        None => seed.items,
    };
    let next_id = value
        .get("nextId")
        .and_then(Value::as_u64)
        .unwrap_or(seed.next_id);
    Ok(Document { items, next_id })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    struct Widget {
        id: RecordId,
        name: String,
    }

    impl Identified for Widget {
        fn id(&self) -> RecordId {
            self.id
        }
        fn set_id(&mut self, id: RecordId) {
            self.id = id;
        }
    }

    struct Widgets;

    impl Collection for Widgets {
        type Record = Widget;
        const FILE: &'static str = "widgets.json";
    }

    struct SeededWidgets;

    impl Collection for SeededWidgets {
        type Record = Widget;
        const FILE: &'static str = "seeded.json";
        const LIST_FIELD: &'static str = "widgets";
        fn seed() -> Document<Widget> {
            Document::seeded(
                vec![Widget {
                    id: 1,
                    name: "预置".to_owned(),
                }],
                2,
            )
        }
    }

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), "jiandu");
        (dir, store)
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let (_dir, store) = store();
        let first = store.load::<SeededWidgets>().unwrap();
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.next_id, 2);
        // The file now exists with the seed payload, and a second load agrees with the first.
        let on_disk = std::fs::read_to_string(store.root().join("seeded.json")).unwrap();
        assert!(on_disk.contains("widgets"));
        assert!(on_disk.contains("nextId"));
        let second = store.load::<SeededWidgets>().unwrap();
        assert_eq!(second.items, first.items);
        assert_eq!(second.next_id, first.next_id);
    }

    #[test]
    fn ids_are_monotonic_across_deletion() {
        let (_dir, store) = store();
        let mut allocated = Vec::new();
        for name in ["a", "b", "c"] {
            let id = store
                .update::<Widgets, _, ()>(|doc| {
                    let id = doc.allocate();
                    doc.items.push(Widget {
                        id,
                        name: name.to_owned(),
                    });
                    Ok(id)
                })
                .unwrap()
                .unwrap();
            allocated.push(id);
        }
        assert_eq!(allocated, vec![1, 2, 3]);
        // Deleting the highest-numbered record must not cause id reuse.
        store
            .update::<Widgets, _, ()>(|doc| {
                doc.remove(3);
                Ok(())
            })
            .unwrap()
            .unwrap();
        let next = store
            .update::<Widgets, _, ()>(|doc| {
                let id = doc.allocate();
                doc.items.push(Widget {
                    id,
                    name: "d".to_owned(),
                });
                Ok(id)
            })
            .unwrap()
            .unwrap();
        assert_eq!(next, 4);
    }

    #[test]
    fn save_then_load_is_coherent() {
        let (_dir, store) = store();
        // Warm the cache...
        let _ = store.load::<Widgets>().unwrap();
        // ...then write through it.
        let doc = Document::seeded(
            vec![Widget {
                id: 9,
                name: "九".to_owned(),
            }],
            10,
        );
        store.save::<Widgets>(&doc).unwrap();
        let loaded = store.load::<Widgets>().unwrap();
        assert_eq!(loaded.items, doc.items);
        assert_eq!(loaded.next_id, 10);
    }

    #[test]
    fn restore_recomputes_next_id() {
        let items = vec![
            Widget {
                id: 5,
                name: "five".to_owned(),
            },
            Widget {
                id: 2,
                name: "two".to_owned(),
            },
        ];
        let doc = Document::restore(items);
        assert_eq!(doc.next_id, 6);
        assert_eq!(doc.items.iter().map(|w| w.id).collect::<Vec<_>>(), [5, 2]);

        let empty: Document<Widget> = Document::restore(Vec::new());
        assert_eq!(empty.next_id, 1);

        // Records without ids are numbered around the preserved ones.
        let mixed = Document::restore(vec![
            Widget {
                id: 0,
                name: "x".to_owned(),
            },
            Widget {
                id: 4,
                name: "y".to_owned(),
            },
            Widget {
                id: 0,
                name: "z".to_owned(),
            },
        ]);
        assert_eq!(
            mixed.items.iter().map(|w| w.id).collect::<Vec<_>>(),
            [1, 4, 5]
        );
        assert_eq!(mixed.next_id, 6);
    }

    #[test]
    fn domain_failure_leaves_file_untouched() {
        let (_dir, store) = store();
        store
            .update::<Widgets, _, ()>(|doc| {
                let id = doc.allocate();
                doc.items.push(Widget {
                    id,
                    name: "keep".to_owned(),
                });
                Ok(())
            })
            .unwrap()
            .unwrap();
        let before = std::fs::read_to_string(store.root().join("widgets.json")).unwrap();
        let outcome = store
            .update::<Widgets, (), &str>(|doc| {
                doc.items.clear();
                Err("记录不存在")
            })
            .unwrap();
        assert_eq!(outcome, Err("记录不存在"));
        let after = std::fs::read_to_string(store.root().join("widgets.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn malformed_document_is_a_load_error() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.root()).unwrap();
        std::fs::write(store.root().join("widgets.json"), b"{ not json").unwrap();
        assert!(matches!(store.load::<Widgets>(), Err(Error::Parse { .. })));
    }

    #[test]
    fn legacy_files_are_copied_once() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path();
        std::fs::create_dir_all(data_dir.join("minsheng")).unwrap();
        std::fs::write(
            data_dir.join("projects.json"),
            r#"{"projects":[],"nextId":7}"#,
        )
        .unwrap();
        std::fs::write(
            data_dir.join("minsheng").join("pishi.json"),
            r#"{"items":[],"nextId":3}"#,
        )
        .unwrap();
        let store = Store::new(data_dir, "jiandu");
        store.migrate_legacy(data_dir).unwrap();
        assert!(store.root().join("projects.json").exists());
        assert!(store.root().join("pishi.json").exists());
        // Re-running must not clobber migrated content.
        std::fs::write(store.root().join("pishi.json"), r#"{"items":[],"nextId":9}"#).unwrap();
        store.migrate_legacy(data_dir).unwrap();
        let kept = std::fs::read_to_string(store.root().join("pishi.json")).unwrap();
        assert!(kept.contains("9"));
    }
}
