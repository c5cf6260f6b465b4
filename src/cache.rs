use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::json;
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::model::{DocEvent, ScriptRecord, ScriptType};
use crate::repository::{DocumentStore, DocumentStoreExt};

/// Hook the lifecycle calls after every script save or delete.
#[cfg_attr(test, mockall::automock)]
pub trait CacheInvalidation: Send + Sync {
    fn invalidate(&self);
}

/// Enabled scripts indexed by how they are triggered.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScriptMap {
    api: HashMap<String, String>,
    doc_events: HashMap<(String, DocEvent), Vec<String>>,
    permission_queries: HashMap<String, String>,
}

impl ScriptMap {
    pub fn build(store: &dyn DocumentStore) -> AppResult<Self> {
        let mut map = ScriptMap::default();
        let records: Vec<ScriptRecord> = store.list_docs(&[("disabled", json!(false))])?;

        for record in records {
            match record.script_type {
                ScriptType::Api => {
                    map.api.insert(record.api_route().to_string(), record.name.clone());
                }
                ScriptType::DocumentEvent => {
                    if let (Some(doctype), Some(event)) =
                        (record.reference_doctype.clone(), record.doctype_event)
                    {
                        map.doc_events
                            .entry((doctype, event))
                            .or_default()
                            .push(record.name.clone());
                    }
                }
                ScriptType::PermissionQuery => {
                    if let Some(doctype) = record.reference_doctype.clone() {
                        map.permission_queries.insert(doctype, record.name.clone());
                    }
                }
                ScriptType::SchedulerEvent => {}
            }
        }
        for names in map.doc_events.values_mut() {
            names.sort();
        }

        Ok(map)
    }

    pub fn api_script(&self, route: &str) -> Option<&str> {
        self.api.get(route).map(String::as_str)
    }

    /// Scripts hooked on `(doctype, event)`, in name order.
    pub fn doc_event_scripts(&self, doctype: &str, event: DocEvent) -> &[String] {
        self.doc_events
            .get(&(doctype.to_string(), event))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn permission_query_script(&self, doctype: &str) -> Option<&str> {
        self.permission_queries.get(doctype).map(String::as_str)
    }
}

/// Lazily rebuilt [`ScriptMap`].
///
/// `generation` moves on every invalidation. A rebuild that started before
/// an invalidation is returned to its caller but never cached.
pub struct ScriptCache {
    store: Arc<dyn DocumentStore>,
    map: RwLock<Option<Arc<ScriptMap>>>,
    generation: AtomicU64,
    builds: AtomicUsize,
}

impl ScriptCache {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            map: RwLock::new(None),
            generation: AtomicU64::new(0),
            builds: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> AppResult<Arc<ScriptMap>> {
        if let Ok(guard) = self.map.read() {
            if let Some(map) = guard.as_ref() {
                return Ok(Arc::clone(map));
            }
        }

        let generation = self.generation.load(Ordering::Acquire);
        let map = Arc::new(ScriptMap::build(self.store.as_ref())?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!(
            api = map.api.len(),
            doc_events = map.doc_events.len(),
            permission_queries = map.permission_queries.len(),
            "Rebuilt script map"
        );
        match self.map.write() {
            Ok(mut guard) => {
                if self.generation.load(Ordering::Acquire) == generation {
                    *guard = Some(Arc::clone(&map));
                } else {
                    debug!("Scripts changed during rebuild; not caching");
                }
            }
            Err(_) => warn!("Script map lock poisoned; serving uncached map"),
        }
        Ok(map)
    }

    /// How many times the map has been rebuilt.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

impl CacheInvalidation for ScriptCache {
    fn invalidate(&self) {
        let mut guard = match self.map.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
        self.generation.fetch_add(1, Ordering::Release);
        drop(guard);
        debug!("Script map invalidated");
    }
}
