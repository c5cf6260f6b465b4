use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{AppError, AppResult};
use crate::model::{JobStatus, ScheduledJobBinding, ScheduledJobLog};
use crate::repository::{DocumentStore, DocumentStoreExt};

/// Outcome of one scheduled execution.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub method: String,
    pub status: JobStatus,
    pub details: Option<String>,
}

/// Polls `Scheduled Job Type` records and runs the scripts that are due.
pub struct Scheduler {
    store: Arc<dyn DocumentStore>,
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    /// Reference point for bindings that never ran.
    baseline: DateTime<Utc>,
    wake_signal: Notify,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dispatcher: Arc<Dispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            baseline: Utc::now(),
            wake_signal: Notify::new(),
        }
    }

    pub fn with_baseline(mut self, baseline: DateTime<Utc>) -> Self {
        self.baseline = baseline;
        self
    }

    /// Poll immediately instead of waiting for the next interval.
    pub fn wake(&self) {
        self.wake_signal.notify_one();
    }

    /// Whether `job` has a scheduled time in `(last run, now]`.
    pub fn is_due(&self, job: &ScheduledJobBinding, now: DateTime<Utc>) -> AppResult<bool> {
        let schedule = job.frequency.schedule(self.config.all_interval_minutes)?;
        let since = job.last_execution.unwrap_or(self.baseline);
        Ok(schedule.after(&since).next().is_some_and(|next| next <= now))
    }

    pub fn collect_due_jobs(&self, now: DateTime<Utc>) -> AppResult<Vec<ScheduledJobBinding>> {
        let jobs: Vec<ScheduledJobBinding> =
            self.store.list_docs(&[("stopped", serde_json::json!(false))])?;

        let mut due = Vec::new();
        for job in jobs.into_iter().filter(|j| j.server_script.is_some()) {
            match self.is_due(&job, now) {
                Ok(true) => due.push(job),
                Ok(false) => {}
                Err(e) => warn!(method = %job.method, error = %e, "Skipping job with bad schedule"),
            }
        }
        Ok(due)
    }

    /// Run every due job in turn. `last_execution` is stamped before the
    /// script starts so a slow run is not picked up twice.
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> AppResult<Vec<JobRun>> {
        let due = self.collect_due_jobs(now)?;
        let mut runs = Vec::with_capacity(due.len());

        for job in due {
            let job = match self.claim(&job.name, now) {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!(method = %job.method, error = %e, "Could not claim scheduled job");
                    continue;
                }
            };

            let run = self.dispatch(&job).await;
            if job.create_log {
                let log = ScheduledJobLog::new(&job.method, run.status, run.details.clone());
                if let Err(e) = self.store.insert_doc(&log) {
                    warn!(method = %job.method, error = %e, "Could not write job log");
                }
            }
            runs.push(run);
        }
        Ok(runs)
    }

    /// Re-read the binding and stamp `last_execution` if it is still
    /// bound, running and due. Only `last_execution` changes, so a
    /// concurrent disable or rebind is never overwritten.
    fn claim(&self, name: &str, now: DateTime<Utc>) -> AppResult<Option<ScheduledJobBinding>> {
        let mut claimed = None;
        self.store.transaction(&mut |tx| {
            claimed = None;
            let Some(mut job) = tx.get_doc::<ScheduledJobBinding>(name)? else {
                debug!(binding = name, "Binding removed before it ran");
                return Ok(());
            };
            if job.stopped || job.server_script.is_none() || !self.is_due(&job, now)? {
                debug!(method = %job.method, "Binding no longer due");
                return Ok(());
            }
            job.last_execution = Some(now);
            tx.save_doc(&job)?;
            claimed = Some(job);
            Ok(())
        })?;
        Ok(claimed)
    }

    async fn dispatch(&self, job: &ScheduledJobBinding) -> JobRun {
        let dispatcher = Arc::clone(&self.dispatcher);
        let method = job.method.clone();
        let long = job.frequency.is_long();

        let execution =
            tokio::task::spawn_blocking(move || dispatcher.run_scheduled_method(&method)).await;

        let (status, details) = match execution {
            Ok(Ok(output)) => {
                if long {
                    info!(method = %job.method, elapsed_ms = output.execution_time_ms, "Long scheduler job completed");
                } else {
                    debug!(method = %job.method, elapsed_ms = output.execution_time_ms, "Scheduler job completed");
                }
                let details = (!output.messages.is_empty()).then(|| output.messages.join("\n"));
                (JobStatus::Complete, details)
            }
            Ok(Err(err)) => {
                warn!(method = %job.method, error = %err, "Scheduler job failed");
                (JobStatus::Failed, Some(err.to_string()))
            }
            Err(join_err) => {
                error!(method = %job.method, error = %join_err, "Scheduler job panicked");
                let err = AppError::internal(format!("job panicked: {}", join_err));
                (JobStatus::Failed, Some(err.to_string()))
            }
        };

        JobRun {
            method: job.method.clone(),
            status,
            details,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "Scheduler worker started"
        );
        loop {
            match self.run_due_jobs(Utc::now()).await {
                Ok(runs) if !runs.is_empty() => debug!(count = runs.len(), "Scheduler tick ran jobs"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Scheduler tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = self.wake_signal.notified() => {}
                _ = &mut shutdown => {
                    info!("Scheduler worker shutting down");
                    break;
                }
            }
        }
    }
}

/// Spawn the background worker. Send on the paired sender to stop it.
pub fn spawn_worker(scheduler: Arc<Scheduler>, shutdown: oneshot::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(scheduler.run(shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::cache::ScriptCache;
    use crate::config::SandboxConfig;
    use crate::globals::SafeGlobals;
    use crate::model::{DocType, Document, EventFrequency, ScriptRecord, ScriptType};
    use crate::repository::{Filters, MemoryStore};
    use crate::sandbox::{ExecutionLimits, Sandbox};

    fn scheduler(store: Arc<dyn DocumentStore>) -> Scheduler {
        let globals = SafeGlobals::new(SandboxConfig::default(), store.clone());
        let sandbox = Sandbox::new(ExecutionLimits::default(), globals);
        let cache = Arc::new(ScriptCache::new(store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(sandbox, store.clone(), cache));
        Scheduler::new(store, dispatcher, SchedulerConfig::default())
    }

    /// Changes `target` behind the scheduler's back once the first
    /// transaction has committed, as a concurrent save would.
    struct InterferingStore {
        inner: MemoryStore,
        target: &'static str,
        remove: bool,
        fired: AtomicBool,
    }

    impl InterferingStore {
        fn interfere(&self) -> AppResult<()> {
            if self.fired.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            if self.remove {
                self.inner.delete(ScheduledJobBinding::DOCTYPE, self.target)?;
            } else if let Some(mut job) = self.inner.get_doc::<ScheduledJobBinding>(self.target)? {
                job.stopped = true;
                self.inner.save_doc(&job)?;
            }
            Ok(())
        }
    }

    impl DocumentStore for InterferingStore {
        fn get(&self, doctype: &str, name: &str) -> AppResult<Option<Document>> {
            self.inner.get(doctype, name)
        }

        fn list(
            &self,
            doctype: &str,
            filters: &Filters<'_>,
            fields: &[&str],
        ) -> AppResult<Vec<Document>> {
            self.inner.list(doctype, filters, fields)
        }

        fn insert(&self, doc: Document) -> AppResult<()> {
            self.inner.insert(doc)
        }

        fn save(&self, doc: Document) -> AppResult<()> {
            self.inner.save(doc)
        }

        fn delete(&self, doctype: &str, name: &str) -> AppResult<bool> {
            self.inner.delete(doctype, name)
        }

        fn transaction(
            &self,
            work: &mut dyn FnMut(&dyn DocumentStore) -> AppResult<()>,
        ) -> AppResult<()> {
            self.inner.transaction(work)?;
            self.interfere()
        }
    }

    /// Two `All` jobs, `a_all` and `b_all`, both due at the returned time.
    fn interfering(remove: bool) -> (Arc<InterferingStore>, DateTime<Utc>) {
        let inner = MemoryStore::new();
        for name in ["A", "B"] {
            inner
                .insert_doc(
                    &ScriptRecord::new(name, ScriptType::SchedulerEvent, "")
                        .with_frequency(EventFrequency::All),
                )
                .unwrap();
            inner
                .insert_doc(&ScheduledJobBinding::for_script(name, EventFrequency::All))
                .unwrap();
        }
        let store = Arc::new(InterferingStore {
            inner,
            target: "b_all",
            remove,
            fired: AtomicBool::new(false),
        });
        (store, Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap())
    }

    #[test]
    fn test_is_due_uses_last_execution() {
        let store = Arc::new(MemoryStore::new());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        let scheduler = scheduler(store).with_baseline(start);
        let mut job = ScheduledJobBinding::for_script("Tick", EventFrequency::Hourly);

        assert!(!scheduler.is_due(&job, start + Duration::minutes(20)).unwrap());
        assert!(scheduler.is_due(&job, start + Duration::minutes(31)).unwrap());

        job.last_execution = Some(start + Duration::minutes(31));
        assert!(!scheduler.is_due(&job, start + Duration::minutes(45)).unwrap());
    }

    #[test]
    fn test_stopped_and_unbound_jobs_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let mut stopped = ScheduledJobBinding::for_script("A", EventFrequency::All);
        stopped.stopped = true;
        let mut unbound = ScheduledJobBinding::for_script("B", EventFrequency::All);
        unbound.server_script = None;
        store.insert_doc(&stopped).unwrap();
        store.insert_doc(&unbound).unwrap();

        let scheduler = scheduler(store).with_baseline(Utc::now() - Duration::days(1));
        assert!(scheduler.collect_due_jobs(Utc::now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_stop_is_not_overwritten() {
        let (store, now) = interfering(false);
        let baseline = now - Duration::minutes(10);
        let scheduler = scheduler(store.clone()).with_baseline(baseline);

        let runs = scheduler.run_due_jobs(now).await.unwrap();

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].method, "a_all");
        let b: ScheduledJobBinding = store.get_doc("b_all").unwrap().unwrap();
        assert!(b.stopped);
        assert_eq!(b.last_execution, None);
    }

    #[tokio::test]
    async fn test_binding_removed_mid_tick_is_skipped() {
        let (store, now) = interfering(true);
        let baseline = now - Duration::minutes(10);
        let scheduler = scheduler(store.clone()).with_baseline(baseline);

        let runs = scheduler.run_due_jobs(now).await.unwrap();

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, JobStatus::Complete);
        assert!(store.get_doc::<ScheduledJobBinding>("b_all").unwrap().is_none());
        let a: ScheduledJobBinding = store.get_doc("a_all").unwrap().unwrap();
        assert_eq!(a.last_execution, Some(now));
    }
}
