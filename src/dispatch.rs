use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::cache::ScriptCache;
use crate::error::{AppError, AppResult};
use crate::globals::Invocation;
use crate::model::{DocEvent, Document, ScheduledJobBinding, ScriptRecord, ScriptType};
use crate::repository::{DocumentStore, DocumentStoreExt};
use crate::sandbox::{ExecutionOutput, Sandbox};
use crate::security::{ADMINISTRATOR, SecurityAuditor, UserContext};

/// Result of a permission-query script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "conditions")]
pub enum PermissionQuery {
    NoRestriction,
    /// SQL-ish condition fragment the host appends to its list query.
    Conditions(String),
}

/// How each script type is run.
struct Preparation {
    entry_point: &'static str,
    /// The entry point refuses records of any other type.
    enforce_type: bool,
    /// Locals injected before the script runs, with their initial values.
    locals: fn(&LocalInputs<'_>) -> Map<String, Value>,
}

struct LocalInputs<'a> {
    user: &'a UserContext,
    doc: Option<&'a Document>,
}

fn no_locals(_: &LocalInputs<'_>) -> Map<String, Value> {
    Map::new()
}

fn doc_locals(inputs: &LocalInputs<'_>) -> Map<String, Value> {
    let mut locals = Map::new();
    if let Some(doc) = inputs.doc {
        locals.insert("doc".into(), doc.to_value());
    }
    locals
}

fn permission_locals(inputs: &LocalInputs<'_>) -> Map<String, Value> {
    let mut locals = Map::new();
    locals.insert("user".into(), json!(inputs.user.current_user()));
    locals.insert("conditions".into(), json!(""));
    locals
}

fn preparation(script_type: ScriptType) -> Preparation {
    match script_type {
        ScriptType::Api => Preparation {
            entry_point: "execute_api",
            enforce_type: true,
            locals: no_locals,
        },
        ScriptType::DocumentEvent => Preparation {
            entry_point: "execute_document_event",
            enforce_type: false,
            locals: doc_locals,
        },
        ScriptType::SchedulerEvent => Preparation {
            entry_point: "execute_scheduled_job",
            enforce_type: true,
            locals: no_locals,
        },
        ScriptType::PermissionQuery => Preparation {
            entry_point: "evaluate_permission_query",
            enforce_type: false,
            locals: permission_locals,
        },
    }
}

/// Typed entry points into the sandbox, plus lookups by trigger.
pub struct Dispatcher {
    sandbox: Sandbox,
    store: Arc<dyn DocumentStore>,
    cache: Arc<ScriptCache>,
    auditor: SecurityAuditor,
}

impl Dispatcher {
    pub fn new(sandbox: Sandbox, store: Arc<dyn DocumentStore>, cache: Arc<ScriptCache>) -> Self {
        Self {
            sandbox,
            store,
            cache,
            auditor: SecurityAuditor::new(),
        }
    }

    fn run(
        &self,
        kind: ScriptType,
        record: &ScriptRecord,
        invocation: Invocation,
        inputs: LocalInputs<'_>,
    ) -> AppResult<ExecutionOutput> {
        let prep = preparation(kind);
        if prep.enforce_type && record.script_type != kind {
            return Err(AppError::not_found(format!(
                "Server Script '{}' is a {} script, not {}",
                record.name, record.script_type, kind
            )));
        }

        let locals = (prep.locals)(&inputs);
        debug!(script = %record.name, entry_point = prep.entry_point, "Dispatching script");

        self.sandbox
            .execute(&record.script, &invocation, &locals)
            .inspect_err(|e| {
                self.auditor.log_script_failure(
                    &record.name,
                    prep.entry_point,
                    &e.to_string(),
                    matches!(e, AppError::Timeout { .. }),
                )
            })
    }

    /// Run an API script and return its `server.flags`.
    pub fn execute_api(
        &self,
        record: &ScriptRecord,
        user: &UserContext,
        form_dict: Map<String, Value>,
    ) -> AppResult<Map<String, Value>> {
        if record.script_type != ScriptType::Api {
            return Err(AppError::not_found(format!(
                "Server Script '{}' is not an API script",
                record.name
            )));
        }
        if user.is_guest() && !record.guest_allowed() {
            self.auditor.log_guest_denied(&record.name);
            return Err(AppError::permission(format!(
                "guests may not call {}",
                record.api_route()
            )));
        }

        let invocation =
            Invocation::new(&record.name, user.current_user()).with_form_dict(form_dict);
        let output = self.run(
            ScriptType::Api,
            record,
            invocation,
            LocalInputs { user, doc: None },
        )?;
        Ok(output.flags())
    }

    /// Run a document-event script against `doc`; the script's changes to
    /// `doc` are written back.
    pub fn execute_document_event(
        &self,
        record: &ScriptRecord,
        doc: &mut Document,
        user: &UserContext,
    ) -> AppResult<ExecutionOutput> {
        let invocation = Invocation::new(&record.name, user.current_user());
        let output = self.run(
            ScriptType::DocumentEvent,
            record,
            invocation,
            LocalInputs {
                user,
                doc: Some(&*doc),
            },
        )?;

        if let Some(updated) = output.local("doc") {
            doc.merge_from_value(updated.clone())?;
        }
        Ok(output)
    }

    /// Run a scheduler-event script as the administrator.
    pub fn execute_scheduled_job(&self, record: &ScriptRecord) -> AppResult<ExecutionOutput> {
        let admin = UserContext::administrator();
        let invocation = Invocation::new(&record.name, ADMINISTRATOR);
        self.run(
            ScriptType::SchedulerEvent,
            record,
            invocation,
            LocalInputs {
                user: &admin,
                doc: None,
            },
        )
    }

    /// Run a permission-query script and read back `conditions`.
    ///
    /// An empty or unset value means no restriction. A value that is not a
    /// string fails the query rather than widening access.
    pub fn evaluate_permission_query(
        &self,
        record: &ScriptRecord,
        user: &UserContext,
    ) -> AppResult<PermissionQuery> {
        let invocation = Invocation::new(&record.name, user.current_user());
        let output = self.run(
            ScriptType::PermissionQuery,
            record,
            invocation,
            LocalInputs { user, doc: None },
        )?;

        match output.local("conditions") {
            Some(Value::String(s)) if !s.trim().is_empty() => {
                Ok(PermissionQuery::Conditions(s.clone()))
            }
            Some(Value::String(_)) | Some(Value::Null) | None => Ok(PermissionQuery::NoRestriction),
            Some(other) => Err(AppError::execution(
                &record.name,
                format!("conditions must be a string, got {}", other),
            )),
        }
    }

    fn load(&self, name: &str) -> AppResult<ScriptRecord> {
        self.store
            .get_doc(name)?
            .ok_or_else(|| AppError::not_found(format!("Server Script '{}' not found", name)))
    }

    /// Resolve an API route and run its script.
    pub fn run_api_method(
        &self,
        method: &str,
        user: &UserContext,
        form_dict: Map<String, Value>,
    ) -> AppResult<Map<String, Value>> {
        let map = self.cache.get()?;
        let name = map
            .api_script(method)
            .ok_or_else(|| AppError::not_found(format!("no API script for method '{}'", method)))?;
        let record = self.load(name)?;
        self.execute_api(&record, user, form_dict)
    }

    /// Run every script hooked on `(doc.doctype, event)` in name order.
    /// Returns the collected `msgprint` output.
    pub fn run_doc_event(
        &self,
        event: DocEvent,
        doc: &mut Document,
        user: &UserContext,
    ) -> AppResult<Vec<String>> {
        let map = self.cache.get()?;
        let doctype = doc.doctype.clone();
        let mut messages = Vec::new();
        for name in map.doc_event_scripts(&doctype, event) {
            let record = self.load(name)?;
            let output = self.execute_document_event(&record, doc, user)?;
            messages.extend(output.messages);
        }
        Ok(messages)
    }

    /// Conditions from the permission-query script of `doctype`, if any.
    pub fn permission_query_conditions(
        &self,
        doctype: &str,
        user: &UserContext,
    ) -> AppResult<PermissionQuery> {
        let map = self.cache.get()?;
        match map.permission_query_script(doctype) {
            Some(name) => {
                let record = self.load(name)?;
                self.evaluate_permission_query(&record, user)
            }
            None => Ok(PermissionQuery::NoRestriction),
        }
    }

    /// Run the script behind a `Scheduled Job Type` method.
    pub fn run_scheduled_method(&self, method: &str) -> AppResult<ExecutionOutput> {
        let bindings: Vec<ScheduledJobBinding> =
            self.store.list_docs(&[("method", json!(method))])?;
        let script = bindings
            .into_iter()
            .find_map(|b| b.server_script)
            .ok_or_else(|| AppError::not_found(format!("no script bound to method '{}'", method)))?;

        let record = self.load(&script)?;
        if record.disabled {
            warn!(script = %record.name, method, "Skipping disabled scheduled script");
            return Err(AppError::not_found(format!(
                "Server Script '{}' is disabled",
                record.name
            )));
        }
        self.execute_scheduled_job(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preparation_table() {
        for script_type in ScriptType::ALL {
            let prep = preparation(script_type);
            assert!(prep.entry_point.starts_with("execute") || prep.entry_point.starts_with("evaluate"));
        }
        assert!(preparation(ScriptType::Api).enforce_type);
        assert!(preparation(ScriptType::SchedulerEvent).enforce_type);
        assert!(!preparation(ScriptType::DocumentEvent).enforce_type);
    }

    #[test]
    fn test_permission_locals() {
        let user = UserContext::authenticated("alice");
        let locals = permission_locals(&LocalInputs {
            user: &user,
            doc: None,
        });
        assert_eq!(locals.get("user"), Some(&json!("alice")));
        assert_eq!(locals.get("conditions"), Some(&json!("")));
    }

    #[test]
    fn test_doc_locals_carry_identity() {
        let user = UserContext::guest();
        let doc = Document::new("ToDo", "T-1").with("status", "Open");
        let locals = doc_locals(&LocalInputs {
            user: &user,
            doc: Some(&doc),
        });
        assert_eq!(
            locals.get("doc"),
            Some(&json!({"doctype": "ToDo", "name": "T-1", "status": "Open"}))
        );
    }
}
