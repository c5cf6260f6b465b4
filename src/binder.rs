//! Keeps `Scheduled Job Type` records in step with scheduler-event scripts.
//!
//! Every function takes the store it should write to, so the lifecycle can
//! run them inside the same transaction as the script save.

use serde_json::json;
use tracing::{debug, info};

use crate::error::AppResult;
use crate::model::{DocType, ScheduledJobBinding, ScriptRecord, ScriptType, binding_method};
use crate::repository::{DocumentStore, DocumentStoreExt};

pub fn enabled_message(script_name: &str) -> String {
    format!("Enabled scheduled execution for script {}", script_name)
}

pub fn updated_message(script_name: &str) -> String {
    format!("Scheduled execution for script {} has updated", script_name)
}

/// Bindings owned by `script_name`.
pub fn scheduled_jobs(
    store: &dyn DocumentStore,
    script_name: &str,
) -> AppResult<Vec<ScheduledJobBinding>> {
    store.list_docs(&[("server_script", json!(script_name))])
}

/// Mirror `disabled` onto `stopped` for every binding of `record`.
/// Returns how many bindings changed.
pub fn sync_disabled_state(store: &dyn DocumentStore, record: &ScriptRecord) -> AppResult<usize> {
    if record.script_type != ScriptType::SchedulerEvent {
        return Ok(0);
    }

    let mut changed = 0;
    for mut job in scheduled_jobs(store, &record.name)? {
        if job.stopped != record.disabled {
            job.stopped = record.disabled;
            store.save_doc(&job)?;
            changed += 1;
        }
    }
    if changed > 0 {
        debug!(script = %record.name, stopped = record.disabled, changed, "Synced binding state");
    }
    Ok(changed)
}

/// Make sure an enabled scheduler-event script has exactly its binding.
/// Returns the notification for the caller, if anything changed.
pub fn sync_schedule(store: &dyn DocumentStore, record: &ScriptRecord) -> AppResult<Option<String>> {
    let Some(frequency) = record.active_frequency() else {
        return Ok(None);
    };
    if record.disabled {
        return Ok(None);
    }

    let method = binding_method(&record.name, frequency);
    let existing: Vec<ScheduledJobBinding> = store.list_docs(&[("method", json!(method))])?;

    match existing.into_iter().next() {
        None => {
            let binding = ScheduledJobBinding::for_script(&record.name, frequency.clone());
            store.insert_doc(&binding)?;
            info!(script = %record.name, method = %binding.method, frequency = %frequency, "Created scheduled job");
            Ok(Some(enabled_message(&record.name)))
        }
        Some(job) if job.frequency == *frequency => Ok(None),
        Some(mut job) => {
            job.frequency = frequency.clone();
            store.save_doc(&job)?;
            info!(script = %record.name, method = %job.method, frequency = %frequency, "Updated scheduled job");
            Ok(Some(updated_message(&record.name)))
        }
    }
}

/// Delete every binding of `script_name`. Returns how many were removed.
pub fn clear_schedule(store: &dyn DocumentStore, script_name: &str) -> AppResult<usize> {
    let jobs = scheduled_jobs(store, script_name)?;
    for job in &jobs {
        store.delete(ScheduledJobBinding::DOCTYPE, &job.name)?;
        debug!(script = script_name, method = %job.method, "Deleted scheduled job");
    }
    Ok(jobs.len())
}

/// Drop bindings from the previous frequency before a new one is created.
///
/// Changing the script type away from `Scheduler Event` counts as a
/// frequency change, so no binding outlives the type it was made for.
pub fn clear_schedule_on_frequency_change(
    store: &dyn DocumentStore,
    previous: Option<&ScriptRecord>,
    record: &ScriptRecord,
) -> AppResult<usize> {
    let Some(previous) = previous else {
        return Ok(0);
    };
    let scheduler_involved = previous.script_type == ScriptType::SchedulerEvent
        || record.script_type == ScriptType::SchedulerEvent;
    if !scheduler_involved || previous.active_frequency() == record.active_frequency() {
        return Ok(0);
    }
    clear_schedule(store, &record.name)
}

/// Deleting a scheduler-event script deletes its bindings.
pub fn cascade_delete_on_trash(store: &dyn DocumentStore, record: &ScriptRecord) -> AppResult<usize> {
    if record.script_type != ScriptType::SchedulerEvent {
        return Ok(0);
    }
    clear_schedule(store, &record.name)
}

/// Run the save-time steps in order and collect user-visible notifications.
pub fn reconcile(
    store: &dyn DocumentStore,
    previous: Option<&ScriptRecord>,
    record: &ScriptRecord,
) -> AppResult<Vec<String>> {
    let disabled_changed = previous.is_some_and(|p| p.disabled != record.disabled);
    if disabled_changed {
        sync_disabled_state(store, record)?;
    }
    clear_schedule_on_frequency_change(store, previous, record)?;

    Ok(sync_schedule(store, record)?.into_iter().collect())
}
