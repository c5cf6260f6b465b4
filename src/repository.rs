use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::model::{DocType, Document};

/// Equality filters: every `(field, value)` pair must match.
pub type Filters<'a> = [(&'a str, Value)];

/// Persistence collaborator. Hosts plug in their own storage; the crate
/// ships [`MemoryStore`].
pub trait DocumentStore: Send + Sync {
    fn get(&self, doctype: &str, name: &str) -> AppResult<Option<Document>>;

    /// Documents of `doctype` matching `filters`, ordered by name. A
    /// non-empty `fields` projects the result onto those fields.
    fn list(&self, doctype: &str, filters: &Filters<'_>, fields: &[&str])
    -> AppResult<Vec<Document>>;

    /// Fails if a document with the same doctype and name exists.
    fn insert(&self, doc: Document) -> AppResult<()>;

    /// Fails if the document does not exist yet.
    fn save(&self, doc: Document) -> AppResult<()>;

    /// Returns whether a document was removed.
    fn delete(&self, doctype: &str, name: &str) -> AppResult<bool>;

    /// Run `work` atomically: either all of its writes become visible or none.
    /// Transactions on the same store are mutually exclusive.
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn DocumentStore) -> AppResult<()>,
    ) -> AppResult<()>;

    fn exists(&self, doctype: &str, name: &str) -> AppResult<bool> {
        Ok(self.get(doctype, name)?.is_some())
    }

    fn upsert(&self, doc: Document) -> AppResult<()> {
        if self.exists(&doc.doctype, &doc.name)? {
            self.save(doc)
        } else {
            self.insert(doc)
        }
    }
}

/// Typed helpers over any [`DocumentStore`].
pub trait DocumentStoreExt {
    fn get_doc<T: DocType>(&self, name: &str) -> AppResult<Option<T>>;
    fn list_docs<T: DocType>(&self, filters: &Filters<'_>) -> AppResult<Vec<T>>;
    fn insert_doc<T: DocType>(&self, value: &T) -> AppResult<()>;
    fn save_doc<T: DocType>(&self, value: &T) -> AppResult<()>;
    fn upsert_doc<T: DocType>(&self, value: &T) -> AppResult<()>;
}

impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {
    fn get_doc<T: DocType>(&self, name: &str) -> AppResult<Option<T>> {
        self.get(T::DOCTYPE, name)?
            .map(|doc| T::from_document(&doc))
            .transpose()
    }

    fn list_docs<T: DocType>(&self, filters: &Filters<'_>) -> AppResult<Vec<T>> {
        self.list(T::DOCTYPE, filters, &[])?
            .iter()
            .map(T::from_document)
            .collect()
    }

    fn insert_doc<T: DocType>(&self, value: &T) -> AppResult<()> {
        self.insert(value.to_document()?)
    }

    fn save_doc<T: DocType>(&self, value: &T) -> AppResult<()> {
        self.save(value.to_document()?)
    }

    fn upsert_doc<T: DocType>(&self, value: &T) -> AppResult<()> {
        self.upsert(value.to_document()?)
    }
}

type Tables = HashMap<String, BTreeMap<String, Document>>;

fn matches(doc: &Document, filters: &Filters<'_>) -> bool {
    filters
        .iter()
        .all(|(field, expected)| doc.get(field).unwrap_or(Value::Null) == *expected)
}

fn project(doc: &Document, fields: &[&str]) -> Document {
    if fields.is_empty() {
        return doc.clone();
    }
    let mut projected = Document::new(doc.doctype.clone(), doc.name.clone());
    for field in fields {
        if let Some(value) = doc.fields.get(*field) {
            projected.set(*field, value.clone());
        }
    }
    projected
}

fn table_get(tables: &Tables, doctype: &str, name: &str) -> Option<Document> {
    tables.get(doctype).and_then(|t| t.get(name)).cloned()
}

fn table_list(tables: &Tables, doctype: &str, filters: &Filters<'_>, fields: &[&str]) -> Vec<Document> {
    tables
        .get(doctype)
        .map(|table| {
            table
                .values()
                .filter(|doc| matches(doc, filters))
                .map(|doc| project(doc, fields))
                .collect()
        })
        .unwrap_or_default()
}

fn table_insert(tables: &mut Tables, doc: Document) -> AppResult<()> {
    let table = tables.entry(doc.doctype.clone()).or_default();
    if table.contains_key(&doc.name) {
        return Err(AppError::store(format!(
            "{} '{}' already exists",
            doc.doctype, doc.name
        )));
    }
    debug!(doctype = %doc.doctype, name = %doc.name, "Inserted document");
    table.insert(doc.name.clone(), doc);
    Ok(())
}

fn table_save(tables: &mut Tables, doc: Document) -> AppResult<()> {
    match tables.get_mut(&doc.doctype).and_then(|t| t.get_mut(&doc.name)) {
        Some(existing) => {
            debug!(doctype = %doc.doctype, name = %doc.name, "Saved document");
            *existing = doc;
            Ok(())
        }
        None => Err(AppError::not_found(format!(
            "{} '{}' does not exist",
            doc.doctype, doc.name
        ))),
    }
}

fn table_delete(tables: &mut Tables, doctype: &str, name: &str) -> bool {
    let removed = tables
        .get_mut(doctype)
        .map(|t| t.remove(name).is_some())
        .unwrap_or(false);
    if removed {
        debug!(doctype, name, "Deleted document");
    }
    removed
}

fn recover<T>(result: Result<T, std::sync::PoisonError<T>>, what: &str) -> T {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("{} lock poisoned; recovering", what);
            poisoned.into_inner()
        }
    }
}

/// In-memory document store.
///
/// Writes, including whole transactions, are serialized by one lock.
/// A transaction works on a private copy of the tables which replaces the
/// committed state only when the work returns `Ok`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        recover(self.write_lock.lock(), "store writer")
    }

    fn with_tables<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let guard = recover(self.tables.read(), "store tables");
        f(&guard)
    }

    fn with_tables_mut<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut guard = recover(self.tables.write(), "store tables");
        f(&mut guard)
    }

    /// Number of documents of `doctype`.
    pub fn count(&self, doctype: &str) -> usize {
        self.with_tables(|t| t.get(doctype).map(|t| t.len()).unwrap_or(0))
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, doctype: &str, name: &str) -> AppResult<Option<Document>> {
        Ok(self.with_tables(|t| table_get(t, doctype, name)))
    }

    fn list(
        &self,
        doctype: &str,
        filters: &Filters<'_>,
        fields: &[&str],
    ) -> AppResult<Vec<Document>> {
        Ok(self.with_tables(|t| table_list(t, doctype, filters, fields)))
    }

    fn insert(&self, doc: Document) -> AppResult<()> {
        let _writer = self.writer();
        self.with_tables_mut(|t| table_insert(t, doc))
    }

    fn save(&self, doc: Document) -> AppResult<()> {
        let _writer = self.writer();
        self.with_tables_mut(|t| table_save(t, doc))
    }

    fn delete(&self, doctype: &str, name: &str) -> AppResult<bool> {
        let _writer = self.writer();
        Ok(self.with_tables_mut(|t| table_delete(t, doctype, name)))
    }

    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn DocumentStore) -> AppResult<()>,
    ) -> AppResult<()> {
        let _writer = self.writer();
        let staged = StagedTables {
            tables: Mutex::new(self.with_tables(|t| t.clone())),
        };

        match work(&staged) {
            Ok(()) => {
                let committed = recover(staged.tables.into_inner(), "staged tables");
                self.with_tables_mut(|t| *t = committed);
                debug!("Committed store transaction");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Rolled back store transaction");
                Err(e)
            }
        }
    }
}

/// Private working copy used inside [`MemoryStore::transaction`].
struct StagedTables {
    tables: Mutex<Tables>,
}

impl StagedTables {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        recover(self.tables.lock(), "staged tables")
    }
}

impl DocumentStore for StagedTables {
    fn get(&self, doctype: &str, name: &str) -> AppResult<Option<Document>> {
        Ok(table_get(&self.lock(), doctype, name))
    }

    fn list(
        &self,
        doctype: &str,
        filters: &Filters<'_>,
        fields: &[&str],
    ) -> AppResult<Vec<Document>> {
        Ok(table_list(&self.lock(), doctype, filters, fields))
    }

    fn insert(&self, doc: Document) -> AppResult<()> {
        table_insert(&mut self.lock(), doc)
    }

    fn save(&self, doc: Document) -> AppResult<()> {
        table_save(&mut self.lock(), doc)
    }

    fn delete(&self, doctype: &str, name: &str) -> AppResult<bool> {
        Ok(table_delete(&mut self.lock(), doctype, name))
    }

    // Nested transactions join the enclosing one.
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn DocumentStore) -> AppResult<()>,
    ) -> AppResult<()> {
        work(self)
    }
}
