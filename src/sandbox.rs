use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use rquickjs::{CatchResultExt, Context, Ctx, Runtime};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::JavascriptConfig;
use crate::error::{AppError, AppResult};
use crate::globals::{Invocation, SafeGlobals};

/// Resource limits for JavaScript execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionLimits {
    pub timeout_ms: u64,
    pub max_memory_mb: usize,
    pub max_stack_kb: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        JavascriptConfig::default().into()
    }
}

impl From<JavascriptConfig> for ExecutionLimits {
    fn from(config: JavascriptConfig) -> Self {
        Self {
            timeout_ms: config.execution_timeout_ms,
            max_memory_mb: config.max_memory_mb,
            max_stack_kb: config.max_stack_kb,
        }
    }
}

impl ExecutionLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What a script left behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    /// Global-scope view; currently `{"flags": {...}}`.
    pub globals: Map<String, Value>,
    /// Final value of every injected local, `null` if the script removed it.
    pub locals: Map<String, Value>,
    /// `server.msgprint` output, in call order.
    pub messages: Vec<String>,
    pub execution_time_ms: u64,
}

impl ExecutionOutput {
    pub fn flags(&self) -> Map<String, Value> {
        match self.globals.get("flags") {
            Some(Value::Object(flags)) => flags.clone(),
            _ => Map::new(),
        }
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }
}

/// Closes the routes that compile strings into code: `Function` and the
/// `constructor` of every function prototype. `instanceof Function` keeps
/// working.
const LOCKDOWN: &str = r#"
(function () {
    "use strict";
    const functionPrototype = Function.prototype;
    const blocked = function () {
        throw new TypeError("code generation from strings is disabled");
    };
    blocked.prototype = functionPrototype;

    const prototypes = [
        functionPrototype,
        Object.getPrototypeOf(function* () {}),
        Object.getPrototypeOf(async function () {}),
        Object.getPrototypeOf(async function* () {}),
    ];
    for (const prototype of prototypes) {
        Object.defineProperty(prototype, "constructor", {
            value: blocked, writable: false, enumerable: false, configurable: false,
        });
    }
    Object.defineProperty(globalThis, "Function", {
        value: blocked, writable: false, enumerable: false, configurable: false,
    });
})();
"#;

fn local_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("Valid regex pattern for local names")
    })
}

fn validate_local_name(name: &str) -> AppResult<()> {
    if name == "server" || !local_name_pattern().is_match(name) {
        return Err(AppError::internal(format!("invalid local name '{}'", name)));
    }
    Ok(())
}

/// Runs script text against a fixed [`SafeGlobals`] under [`ExecutionLimits`].
///
/// Every call gets a fresh QuickJS runtime, so invocations share no state.
#[derive(Debug, Clone)]
pub struct Sandbox {
    limits: ExecutionLimits,
    globals: SafeGlobals,
}

impl Sandbox {
    pub fn new(limits: ExecutionLimits, globals: SafeGlobals) -> Self {
        Self { limits, globals }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Execute `script` with `locals` bound as globals, then read back the
    /// `server.flags` object and every local.
    pub fn execute(
        &self,
        script: &str,
        invocation: &Invocation,
        locals: &Map<String, Value>,
    ) -> AppResult<ExecutionOutput> {
        for name in locals.keys() {
            validate_local_name(name)?;
        }

        let started = Instant::now();
        let setup = |e: rquickjs::Error| AppError::internal(format!("QuickJS setup failed: {}", e));

        let rt = Runtime::new().map_err(setup)?;
        rt.set_memory_limit(self.limits.max_memory_mb * 1024 * 1024);
        rt.set_max_stack_size(self.limits.max_stack_kb * 1024);

        let interrupted = Arc::new(AtomicBool::new(false));
        let deadline = started + self.limits.timeout();
        let flag = Arc::clone(&interrupted);
        rt.set_interrupt_handler(Some(Box::new(move || {
            if Instant::now() >= deadline {
                flag.store(true, Ordering::Relaxed);
                true
            } else {
                false
            }
        })));

        let ctx = Context::full(&rt).map_err(setup)?;
        let messages = Arc::new(Mutex::new(Vec::new()));

        let result = ctx.with(|ctx| self.run(&ctx, script, invocation, locals, &messages));
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((globals, locals)) => {
                debug!(
                    script = %invocation.script_name,
                    execution_time_ms,
                    "Script executed"
                );
                let messages = match messages.lock() {
                    Ok(messages) => messages.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                Ok(ExecutionOutput {
                    globals,
                    locals,
                    messages,
                    execution_time_ms,
                })
            }
            Err(_) if interrupted.load(Ordering::Relaxed) => {
                warn!(
                    script = %invocation.script_name,
                    timeout_ms = self.limits.timeout_ms,
                    "Script interrupted"
                );
                Err(AppError::Timeout {
                    script: invocation.script_name.clone(),
                    timeout_ms: self.limits.timeout_ms,
                })
            }
            Err(e) => {
                debug!(script = %invocation.script_name, error = %e, "Script failed");
                Err(e)
            }
        }
    }

    fn run<'js>(
        &self,
        ctx: &Ctx<'js>,
        script: &str,
        invocation: &Invocation,
        locals: &Map<String, Value>,
        messages: &Arc<Mutex<Vec<String>>>,
    ) -> AppResult<(Map<String, Value>, Map<String, Value>)> {
        let name = invocation.script_name.as_str();
        let setup = |e: rquickjs::Error| AppError::internal(format!("sandbox setup failed: {}", e));

        let global = ctx.globals();
        global.remove("eval").map_err(setup)?;
        ctx.eval::<(), _>(LOCKDOWN)
            .catch(ctx)
            .map_err(|e| AppError::internal(format!("sandbox setup failed: {}", e)))?;
        let server = self
            .globals
            .install(ctx, invocation, Arc::clone(messages))
            .catch(ctx)
            .map_err(|e| AppError::internal(format!("sandbox setup failed: {}", e)))?;

        for (local, value) in locals {
            let value = ctx.json_parse(value.to_string()).map_err(setup)?;
            global.set(local.as_str(), value).map_err(setup)?;
        }

        ctx.eval::<(), _>(script)
            .catch(ctx)
            .map_err(|e| AppError::execution(name, e.to_string()))?;

        let flags: rquickjs::Value = server.get("flags").map_err(setup)?;
        let mut globals = Map::new();
        globals.insert("flags".to_string(), to_json(ctx, name, flags)?);

        let mut snapshot = Map::new();
        for local in locals.keys() {
            let value: rquickjs::Value = ctx
                .eval(format!("typeof {0} === 'undefined' ? undefined : {0}", local))
                .catch(ctx)
                .map_err(|e| AppError::execution(name, e.to_string()))?;
            snapshot.insert(local.clone(), to_json(ctx, name, value)?);
        }

        Ok((globals, snapshot))
    }
}

fn to_json<'js>(ctx: &Ctx<'js>, script: &str, value: rquickjs::Value<'js>) -> AppResult<Value> {
    let text = ctx
        .json_stringify(value)
        .catch(ctx)
        .map_err(|e| AppError::execution(script, format!("result is not serializable: {}", e)))?;
    let Some(text) = text else {
        return Ok(Value::Null);
    };
    let text = text
        .to_string()
        .map_err(|e| AppError::internal(format!("read JSON text: {}", e)))?;
    serde_json::from_str(&text).map_err(|e| AppError::internal(format!("parse JSON text: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::repository::MemoryStore;
    use serde_json::json;

    fn sandbox() -> Sandbox {
        let limits = ExecutionLimits {
            timeout_ms: 500,
            ..ExecutionLimits::default()
        };
        let globals = SafeGlobals::new(SandboxConfig::default(), Arc::new(MemoryStore::new()));
        Sandbox::new(limits, globals)
    }

    #[test]
    fn test_locals_are_read_back() {
        let mut locals = Map::new();
        locals.insert("conditions".into(), json!(""));
        let output = sandbox()
            .execute(
                "conditions = 'owner = ' + JSON.stringify(server.session.user);",
                &Invocation::new("pq", "alice"),
                &locals,
            )
            .unwrap();
        assert_eq!(output.local("conditions"), Some(&json!("owner = \"alice\"")));
    }

    #[test]
    fn test_flags_snapshot() {
        let output = sandbox()
            .execute(
                "server.flags.answer = 42; server.msgprint('hi');",
                &Invocation::new("api", "Guest"),
                &Map::new(),
            )
            .unwrap();
        assert_eq!(output.flags().get("answer"), Some(&json!(42)));
        assert_eq!(output.messages, vec!["hi".to_string()]);
    }

    #[test]
    fn test_invalid_local_name_rejected() {
        let mut locals = Map::new();
        locals.insert("not a name".into(), json!(1));
        assert!(
            sandbox()
                .execute("", &Invocation::new("x", "Guest"), &locals)
                .is_err()
        );
    }
}
