#![allow(dead_code)]

use std::sync::{Arc, Once};

use scripthost::model::DocType;
use scripthost::{
    Config, DocumentStore, DocumentStoreExt, SaveReport, ScheduledJobBinding, ScriptRecord, ScriptService,
    UserContext, binder,
};

static TRACING: Once = Once::new();

/// Route test logs through the test harness; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().compact().with_test_writer())
            .try_init();
    });
}

/// Short timeout, scheduler off.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.javascript.execution_timeout_ms = 1000;
    config.scheduler.enabled = false;
    config
}

/// A fresh in-memory service plus an administrator to drive it.
pub struct TestContext {
    pub service: Arc<ScriptService>,
    pub admin: UserContext,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        init_tracing();
        Self {
            service: Arc::new(ScriptService::in_memory(config)),
            admin: UserContext::script_manager("manager@example.com"),
        }
    }

    pub fn save(&self, record: ScriptRecord) -> SaveReport {
        let name = record.name.clone();
        self.service
            .lifecycle
            .save(&self.admin, record)
            .unwrap_or_else(|e| panic!("saving {name} failed: {e}"))
    }

    pub fn bindings(&self, script_name: &str) -> Vec<ScheduledJobBinding> {
        binder::scheduled_jobs(self.service.store.as_ref(), script_name)
            .expect("listing bindings")
    }

    pub fn binding_count(&self) -> usize {
        self.service
            .store
            .list(ScheduledJobBinding::DOCTYPE, &[], &[])
            .expect("listing bindings")
            .len()
    }

    pub fn record(&self, name: &str) -> Option<ScriptRecord> {
        self.service.store.get_doc(name).expect("reading record")
    }
}
