use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::binder;
use crate::cache::CacheInvalidation;
use crate::error::{AppError, AppResult};
use crate::model::{DocType, ScriptRecord, ScriptType};
use crate::repository::{DocumentStore, DocumentStoreExt};
use crate::security::{Capability, SecurityAuditor, UserContext};
use crate::syntax::SyntaxValidator;

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveReport {
    pub record: ScriptRecord,
    pub created: bool,
    /// User-visible notifications raised while reconciling bindings.
    pub messages: Vec<String>,
}

/// Save and delete orchestration for script records.
pub struct ScriptLifecycle {
    store: Arc<dyn DocumentStore>,
    validator: SyntaxValidator,
    invalidation: Arc<dyn CacheInvalidation>,
    auditor: SecurityAuditor,
}

impl ScriptLifecycle {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        validator: SyntaxValidator,
        invalidation: Arc<dyn CacheInvalidation>,
    ) -> Self {
        Self {
            store,
            validator,
            invalidation,
            auditor: SecurityAuditor::new(),
        }
    }

    fn authorize(&self, user: &UserContext, capability: Capability, resource: &str, action: &str) -> AppResult<()> {
        user.require_capability(capability).inspect_err(|e| {
            self.auditor
                .log_authz_failure(user.user_id.clone(), resource, action, &e.to_string());
        })
    }

    fn validate(&self, record: &ScriptRecord) -> AppResult<()> {
        if record.name.trim().is_empty() {
            return Err(AppError::validation("script name is required"));
        }
        match record.script_type {
            ScriptType::SchedulerEvent if record.event_frequency.is_none() => {
                return Err(AppError::validation(format!(
                    "scheduler event script '{}' needs an event frequency",
                    record.name
                )));
            }
            ScriptType::DocumentEvent
                if record.reference_doctype.is_none() || record.doctype_event.is_none() =>
            {
                return Err(AppError::validation(format!(
                    "document event script '{}' needs a reference doctype and event",
                    record.name
                )));
            }
            ScriptType::PermissionQuery if record.reference_doctype.is_none() => {
                return Err(AppError::validation(format!(
                    "permission query script '{}' needs a reference doctype",
                    record.name
                )));
            }
            _ => {}
        }
        self.validator.validate(&record.name, &record.script)
    }

    /// Validate, persist and reconcile bindings in one transaction, then
    /// invalidate the lookup cache.
    pub fn save(&self, user: &UserContext, mut record: ScriptRecord) -> AppResult<SaveReport> {
        self.authorize(user, Capability::ManageScripts, &record.name, "save")?;
        if let Err(e) = self.validate(&record) {
            self.auditor
                .log_validation_failure(user.user_id.clone(), &record.name, &e.to_string());
            return Err(e);
        }

        record.modified = Some(Utc::now());
        let mut created = false;
        let mut messages = Vec::new();

        self.store.transaction(&mut |tx| {
            ensure_unique_trigger(tx, &record)?;
            let previous: Option<ScriptRecord> = tx.get_doc(&record.name)?;
            created = previous.is_none();
            tx.upsert_doc(&record)?;
            messages = binder::reconcile(tx, previous.as_ref(), &record)?;
            Ok(())
        })?;

        self.invalidation.invalidate();
        self.auditor
            .log_script_change(user.current_user(), &record.name, if created { "create" } else { "update" });
        for message in &messages {
            info!(script = %record.name, "{}", message);
        }

        Ok(SaveReport {
            record,
            created,
            messages,
        })
    }

    /// Delete a record and every binding it owns.
    pub fn delete(&self, user: &UserContext, name: &str) -> AppResult<()> {
        self.authorize(user, Capability::ManageScripts, name, "delete")?;

        self.store.transaction(&mut |tx| {
            let record: ScriptRecord = tx
                .get_doc(name)?
                .ok_or_else(|| AppError::not_found(format!("Server Script '{}' not found", name)))?;
            binder::cascade_delete_on_trash(tx, &record)?;
            tx.delete(ScriptRecord::DOCTYPE, name)?;
            Ok(())
        })?;

        self.invalidation.invalidate();
        self.auditor.log_script_change(user.current_user(), name, "delete");
        Ok(())
    }

    pub fn get(&self, user: &UserContext, name: &str) -> AppResult<ScriptRecord> {
        self.authorize(user, Capability::ReadScripts, name, "read")?;
        self.store
            .get_doc(name)?
            .ok_or_else(|| AppError::not_found(format!("Server Script '{}' not found", name)))
    }

    pub fn list(&self, user: &UserContext) -> AppResult<Vec<ScriptRecord>> {
        self.authorize(user, Capability::ReadScripts, ScriptRecord::DOCTYPE, "list")?;
        self.store.list_docs(&[])
    }
}

/// An enabled API script owns its route and an enabled permission query
/// owns its doctype. Disabled scripts never conflict.
fn ensure_unique_trigger(store: &dyn DocumentStore, record: &ScriptRecord) -> AppResult<()> {
    if record.disabled
        || !matches!(record.script_type, ScriptType::Api | ScriptType::PermissionQuery)
    {
        return Ok(());
    }
    let enabled: Vec<ScriptRecord> = store.list_docs(&[("disabled", json!(false))])?;
    let mut others = enabled
        .iter()
        .filter(|other| other.name != record.name && other.script_type == record.script_type);

    if record.script_type == ScriptType::Api {
        let route = record.api_route();
        if let Some(other) = others.find(|other| other.api_route() == route) {
            return Err(AppError::validation(format!(
                "API route '{}' is already served by script '{}'",
                route, other.name
            )));
        }
    } else if let Some(other) = others.find(|other| other.reference_doctype == record.reference_doctype) {
        return Err(AppError::validation(format!(
            "permission query for '{}' is already defined by script '{}'",
            record.reference_doctype.as_deref().unwrap_or_default(),
            other.name
        )));
    }
    Ok(())
}
