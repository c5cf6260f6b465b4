use std::sync::{Arc, Mutex};

use chrono::Utc;
use handlebars::Handlebars;
use rquickjs::{Ctx, Exception, Function, Object, Result as JsResult};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::SandboxConfig;
use crate::error::{AppError, AppResult};
use crate::model::{DocType, ScheduledJobBinding, ScheduledJobLog, ScriptRecord};
use crate::repository::DocumentStore;

/// Maximum size for template input (1MB)
const MAX_TEMPLATE_SIZE: usize = 1_000_000;

/// Longest `server.log` / `server.msgprint` message kept, in bytes.
const MAX_MESSAGE_LEN: usize = 1000;

/// Doctypes scripts may never read: their own definitions, their bindings
/// and the job run history.
pub const INTERNAL_DOCTYPES: [&str; 3] = [
    ScriptRecord::DOCTYPE,
    ScheduledJobBinding::DOCTYPE,
    ScheduledJobLog::DOCTYPE,
];

/// Builds the `server` object. `raw` holds the host functions and is only
/// reachable through the closures below; `JSON` is captured before any
/// user code runs.
const BOOTSTRAP: &str = r#"
(function (raw, user, formDict, groups) {
    "use strict";
    const parse = JSON.parse;
    const stringify = JSON.stringify;
    const toText = String;
    const freeze = Object.freeze;

    const server = {
        flags: {},
        session: freeze({ user: user }),
        formDict: formDict,
        msgprint: function (message) { raw.msgprint(toText(message)); },
        throw: function (message) { throw new Error(toText(message)); },
    };

    if (groups.db) {
        server.db = freeze({
            getValue: function (doctype, name, fieldname) {
                return parse(raw.getValue(toText(doctype), toText(name),
                    fieldname === undefined ? "name" : toText(fieldname)));
            },
            getAll: function (doctype, options) {
                const opts = options || {};
                return parse(raw.getAll(toText(doctype),
                    stringify(opts.filters || {}), stringify(opts.fields || [])));
            },
            exists: function (doctype, name) {
                return raw.exists(toText(doctype), toText(name));
            },
        });
        server.getDoc = function (doctype, name) {
            return parse(raw.getDoc(toText(doctype), toText(name)));
        };
    }
    if (groups.templates) {
        server.renderTemplate = function (template, data) {
            return raw.renderTemplate(toText(template), stringify(data === undefined ? {} : data));
        };
    }
    if (groups.logging) {
        server.log = function (message) {
            raw.log(typeof message === "string" ? message : stringify(message));
        };
    }
    if (groups.utils) {
        server.utils = freeze({
            now: function () { return raw.now(); },
            today: function () { return raw.today(); },
        });
    }

    freeze(server);
    Object.defineProperty(globalThis, "server", {
        value: server, writable: false, enumerable: false, configurable: false,
    });
    return server;
})
"#;

/// Per-invocation inputs visible to the script through `server`.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub script_name: String,
    pub user: String,
    pub form_dict: Map<String, Value>,
}

impl Invocation {
    pub fn new(script_name: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            user: user.into(),
            form_dict: Map::new(),
        }
    }

    pub fn with_form_dict(mut self, form_dict: Map<String, Value>) -> Self {
        self.form_dict = form_dict;
        self
    }
}

/// The capability set handed to every script.
///
/// Built once by the host from [`SandboxConfig`]; dispatch clones the
/// handle, it never changes which groups are installed.
#[derive(Clone)]
pub struct SafeGlobals {
    config: SandboxConfig,
    store: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for SafeGlobals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeGlobals")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SafeGlobals {
    pub fn new(config: SandboxConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn guard_doctype(doctype: &str) -> AppResult<()> {
        if INTERNAL_DOCTYPES.contains(&doctype) {
            return Err(AppError::permission(format!(
                "scripts may not access doctype '{}'",
                doctype
            )));
        }
        Ok(())
    }

    pub fn get_value(&self, doctype: &str, name: &str, field: &str) -> AppResult<Value> {
        Self::guard_doctype(doctype)?;
        Ok(self
            .store
            .get(doctype, name)?
            .and_then(|doc| doc.get(field))
            .unwrap_or(Value::Null))
    }

    pub fn get_all(&self, doctype: &str, filters: &Value, fields: &Value) -> AppResult<Value> {
        Self::guard_doctype(doctype)?;
        let filters: Vec<(&str, Value)> = match filters {
            Value::Object(map) => map.iter().map(|(k, v)| (k.as_str(), v.clone())).collect(),
            Value::Null => Vec::new(),
            _ => return Err(AppError::validation("filters must be an object")),
        };
        let fields: Vec<&str> = match fields {
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            Value::Null => Vec::new(),
            _ => return Err(AppError::validation("fields must be an array")),
        };
        let docs = self.store.list(doctype, &filters, &fields)?;
        Ok(Value::Array(docs.iter().map(|d| d.to_value()).collect()))
    }

    pub fn exists(&self, doctype: &str, name: &str) -> AppResult<bool> {
        Self::guard_doctype(doctype)?;
        self.store.exists(doctype, name)
    }

    pub fn get_doc(&self, doctype: &str, name: &str) -> AppResult<Value> {
        Self::guard_doctype(doctype)?;
        self.store
            .get(doctype, name)?
            .map(|doc| doc.to_value())
            .ok_or_else(|| AppError::not_found(format!("{} {} not found", doctype, name)))
    }

    pub fn render_template(&self, template: &str, data: &Value) -> AppResult<String> {
        if template.len() > MAX_TEMPLATE_SIZE {
            return Err(AppError::validation(format!(
                "template too large: {} bytes (max: {} bytes)",
                template.len(),
                MAX_TEMPLATE_SIZE
            )));
        }
        Handlebars::new()
            .render_template(template, data)
            .map_err(|e| AppError::validation(format!("template error: {}", e)))
    }

    /// Install `server` into `ctx` and return it.
    pub fn install<'js>(
        &self,
        ctx: &Ctx<'js>,
        invocation: &Invocation,
        messages: Arc<Mutex<Vec<String>>>,
    ) -> JsResult<Object<'js>> {
        let raw = Object::new(ctx.clone())?;
        let script = invocation.script_name.clone();

        let sink = Arc::clone(&messages);
        let msg_script = script.clone();
        raw.set(
            "msgprint",
            Function::new(ctx.clone(), move |message: String| -> JsResult<()> {
                let message = truncate(message);
                debug!(script = %msg_script, message = %message, "msgprint");
                if let Ok(mut sink) = sink.lock() {
                    sink.push(message);
                }
                Ok(())
            })?,
        )?;

        if self.config.enable_db_read {
            self.install_db(ctx, &raw)?;
        }

        if self.config.enable_templates {
            let globals = self.clone();
            raw.set(
                "renderTemplate",
                Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'js>, template: String, data: String| -> JsResult<String> {
                        let data = parse_arg(&ctx, &data)?;
                        globals
                            .render_template(&template, &data)
                            .map_err(|e| throw(&ctx, e))
                    },
                )?,
            )?;
        }

        if self.config.enable_logging {
            let log_script = script.clone();
            raw.set(
                "log",
                Function::new(ctx.clone(), move |message: String| -> JsResult<()> {
                    info!(script = %log_script, "{}", truncate(message));
                    Ok(())
                })?,
            )?;
        }

        if self.config.enable_utils {
            raw.set(
                "now",
                Function::new(ctx.clone(), || -> JsResult<String> {
                    Ok(Utc::now().to_rfc3339())
                })?,
            )?;
            raw.set(
                "today",
                Function::new(ctx.clone(), || -> JsResult<String> {
                    Ok(Utc::now().date_naive().to_string())
                })?,
            )?;
        }

        let groups = Object::new(ctx.clone())?;
        groups.set("db", self.config.enable_db_read)?;
        groups.set("templates", self.config.enable_templates)?;
        groups.set("logging", self.config.enable_logging)?;
        groups.set("utils", self.config.enable_utils)?;

        let form_dict = ctx.json_parse(Value::Object(invocation.form_dict.clone()).to_string())?;
        let bootstrap: Function = ctx.eval(BOOTSTRAP)?;
        bootstrap.call((raw, invocation.user.as_str(), form_dict, groups))
    }

    fn install_db<'js>(&self, ctx: &Ctx<'js>, raw: &Object<'js>) -> JsResult<()> {
        let globals = self.clone();
        raw.set(
            "getValue",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, doctype: String, name: String, field: String| -> JsResult<String> {
                    globals
                        .get_value(&doctype, &name, &field)
                        .map(|v| v.to_string())
                        .map_err(|e| throw(&ctx, e))
                },
            )?,
        )?;

        let globals = self.clone();
        raw.set(
            "getAll",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, doctype: String, filters: String, fields: String| -> JsResult<String> {
                    let filters = parse_arg(&ctx, &filters)?;
                    let fields = parse_arg(&ctx, &fields)?;
                    globals
                        .get_all(&doctype, &filters, &fields)
                        .map(|v| v.to_string())
                        .map_err(|e| throw(&ctx, e))
                },
            )?,
        )?;

        let globals = self.clone();
        raw.set(
            "exists",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, doctype: String, name: String| -> JsResult<bool> {
                    globals.exists(&doctype, &name).map_err(|e| throw(&ctx, e))
                },
            )?,
        )?;

        let globals = self.clone();
        raw.set(
            "getDoc",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, doctype: String, name: String| -> JsResult<String> {
                    globals
                        .get_doc(&doctype, &name)
                        .map(|v| v.to_string())
                        .map_err(|e| throw(&ctx, e))
                },
            )?,
        )?;

        Ok(())
    }
}

fn throw(ctx: &Ctx<'_>, error: AppError) -> rquickjs::Error {
    Exception::throw_message(ctx, &error.to_string())
}

fn parse_arg(ctx: &Ctx<'_>, text: &str) -> JsResult<Value> {
    serde_json::from_str(text)
        .map_err(|e| Exception::throw_message(ctx, &format!("invalid argument: {}", e)))
}

fn truncate(mut message: String) -> String {
    if message.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
        message.push_str("... (truncated)");
    }
    message
}
