use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};

/// Generic record as exchanged with the document store.
///
/// `doctype` and `name` identify the record; every other field lives in
/// `fields` and is flattened on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doctype: String,
    pub name: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(doctype: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            name: name.into(),
            fields: Map::new(),
        }
    }

    /// Field lookup that also answers for `name` and `doctype`.
    pub fn get(&self, field: &str) -> Option<Value> {
        match field {
            "name" => Some(Value::String(self.name.clone())),
            "doctype" => Some(Value::String(self.doctype.clone())),
            _ => self.fields.get(field).cloned(),
        }
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("doctype".into(), Value::String(self.doctype.clone()));
        object.insert("name".into(), Value::String(self.name.clone()));
        Value::Object(object)
    }

    /// Rebuild a document from a JSON object, keeping the identity of `self`.
    ///
    /// Scripts may mutate any field of a document they were handed, but not
    /// its `doctype` or `name`.
    pub fn merge_from_value(&mut self, value: Value) -> AppResult<()> {
        let Value::Object(mut object) = value else {
            return Err(AppError::validation(format!(
                "document {} {} must remain an object",
                self.doctype, self.name
            )));
        };
        object.remove("doctype");
        object.remove("name");
        self.fields = object;
        Ok(())
    }
}

/// Typed view over a [`Document`] of a fixed doctype.
pub trait DocType: Serialize + DeserializeOwned {
    const DOCTYPE: &'static str;

    fn name(&self) -> &str;

    fn to_document(&self) -> AppResult<Document> {
        let value = serde_json::to_value(self)
            .map_err(|e| AppError::internal(format!("serialize {}: {}", Self::DOCTYPE, e)))?;
        let Value::Object(mut fields) = value else {
            return Err(AppError::internal(format!(
                "{} did not serialize to an object",
                Self::DOCTYPE
            )));
        };
        fields.remove("name");
        Ok(Document {
            doctype: Self::DOCTYPE.to_string(),
            name: self.name().to_string(),
            fields,
        })
    }

    fn from_document(doc: &Document) -> AppResult<Self> {
        if doc.doctype != Self::DOCTYPE {
            return Err(AppError::internal(format!(
                "expected a {} document, got {}",
                Self::DOCTYPE,
                doc.doctype
            )));
        }
        let mut fields = doc.fields.clone();
        fields.insert("name".into(), Value::String(doc.name.clone()));
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| AppError::store(format!("malformed {} '{}': {}", Self::DOCTYPE, doc.name, e)))
    }
}

/// Trigger kind of a stored script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    #[serde(rename = "API")]
    Api,
    #[serde(rename = "DocType Event")]
    DocumentEvent,
    #[serde(rename = "Scheduler Event")]
    SchedulerEvent,
    #[serde(rename = "Permission Query")]
    PermissionQuery,
}

impl ScriptType {
    pub const ALL: [ScriptType; 4] = [
        ScriptType::Api,
        ScriptType::DocumentEvent,
        ScriptType::SchedulerEvent,
        ScriptType::PermissionQuery,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ScriptType::Api => "API",
            ScriptType::DocumentEvent => "DocType Event",
            ScriptType::SchedulerEvent => "Scheduler Event",
            ScriptType::PermissionQuery => "Permission Query",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Document lifecycle events a script can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocEvent {
    #[serde(rename = "Before Insert")]
    BeforeInsert,
    #[serde(rename = "After Insert")]
    AfterInsert,
    #[serde(rename = "Before Save")]
    BeforeSave,
    #[serde(rename = "After Save")]
    AfterSave,
    #[serde(rename = "Before Submit")]
    BeforeSubmit,
    #[serde(rename = "After Submit")]
    AfterSubmit,
    #[serde(rename = "Before Cancel")]
    BeforeCancel,
    #[serde(rename = "After Cancel")]
    AfterCancel,
    #[serde(rename = "Before Delete")]
    BeforeDelete,
    #[serde(rename = "After Delete")]
    AfterDelete,
}

/// Scheduler cadence of a `Scheduler Event` script.
///
/// Serialized as its label (`"Daily"`, `"Hourly Long"`, `"Cron:0/15 9-17 * * MON-FRI"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventFrequency {
    All,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    HourlyLong,
    DailyLong,
    WeeklyLong,
    MonthlyLong,
    /// Five-field cron expression (minute hour day-of-month month day-of-week).
    Cron(String),
}

const CRON_PREFIX: &str = "Cron:";

impl EventFrequency {
    /// Jobs on a long cadence are expected to run for a while; the
    /// scheduler logs them at a different level but runs them the same way.
    pub fn is_long(&self) -> bool {
        matches!(
            self,
            EventFrequency::HourlyLong
                | EventFrequency::DailyLong
                | EventFrequency::WeeklyLong
                | EventFrequency::MonthlyLong
        )
    }

    /// Five-field cron expression equivalent to this cadence.
    pub fn cron_expression(&self, all_interval_minutes: u32) -> String {
        match self {
            EventFrequency::All => format!("0/{} * * * *", all_interval_minutes.max(1)),
            EventFrequency::Hourly | EventFrequency::HourlyLong => "0 * * * *".to_string(),
            EventFrequency::Daily | EventFrequency::DailyLong => "0 0 * * *".to_string(),
            EventFrequency::Weekly | EventFrequency::WeeklyLong => "0 0 * * SUN".to_string(),
            EventFrequency::Monthly | EventFrequency::MonthlyLong => "0 0 1 * *".to_string(),
            EventFrequency::Yearly => "0 0 1 1 *".to_string(),
            EventFrequency::Cron(expr) => expr.clone(),
        }
    }

    /// Parsed schedule. The `cron` crate wants a leading seconds field.
    pub fn schedule(&self, all_interval_minutes: u32) -> AppResult<cron::Schedule> {
        parse_cron(&self.cron_expression(all_interval_minutes))
    }
}

fn parse_cron(expr: &str) -> AppResult<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(AppError::validation(format!(
            "cron expression '{}' must have 5 fields, found {}",
            expr, fields
        )));
    }
    let invalid = |detail: String| {
        AppError::validation(format!("invalid cron expression '{}': {}", expr, detail))
    };
    let parts: Vec<&str> = expr.split_whitespace().collect();
    let day_of_week = cron_day_of_week(parts[4]).map_err(invalid)?;
    let expression = format!("0 {} {}", parts[..4].join(" "), day_of_week);
    cron::Schedule::from_str(&expression).map_err(|e| invalid(e.to_string()))
}

/// Rewrite a standard day-of-week field (0-7, Sunday = 0 or 7) into the
/// `cron` crate's numbering (1-7, Sunday = 1). Names and `*` pass through.
fn cron_day_of_week(field: &str) -> Result<String, String> {
    fn day(text: &str) -> Result<u32, String> {
        match text.parse::<u32>() {
            Ok(n) if n <= 7 => Ok(n),
            Ok(n) => Err(format!("day of week {} is out of range 0-7", n)),
            Err(_) => Err(format!("bad day of week '{}'", text)),
        }
    }
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let with_step = |range: String| match step {
            Some(step) => format!("{}/{}", range, step),
            None => range,
        };

        match range.split_once('-') {
            Some((start, end)) if numeric(start) && numeric(end) => {
                let (first, last) = (day(start)?, day(end)?);
                if last == 7 && first > 0 && first < 7 {
                    // Runs past Saturday into Sunday.
                    items.push(with_step(format!("{}-7", first + 1)));
                    let step = step.and_then(|s| s.parse::<u32>().ok()).unwrap_or(1).max(1);
                    if (7 - first) % step == 0 {
                        items.push("1".to_string());
                    }
                } else {
                    let to = if last == 7 && first == 0 { 7 } else { last % 7 + 1 };
                    items.push(with_step(format!("{}-{}", first % 7 + 1, to)));
                }
            }
            None if numeric(range) => items.push(with_step((day(range)? % 7 + 1).to_string())),
            _ => items.push(item.to_string()),
        }
    }
    Ok(items.join(","))
}

impl fmt::Display for EventFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EventFrequency::All => "All",
            EventFrequency::Hourly => "Hourly",
            EventFrequency::Daily => "Daily",
            EventFrequency::Weekly => "Weekly",
            EventFrequency::Monthly => "Monthly",
            EventFrequency::Yearly => "Yearly",
            EventFrequency::HourlyLong => "Hourly Long",
            EventFrequency::DailyLong => "Daily Long",
            EventFrequency::WeeklyLong => "Weekly Long",
            EventFrequency::MonthlyLong => "Monthly Long",
            EventFrequency::Cron(expr) => return write!(f, "{}{}", CRON_PREFIX, expr),
        };
        f.write_str(label)
    }
}

impl FromStr for EventFrequency {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let frequency = match s.trim() {
            "All" => EventFrequency::All,
            "Hourly" => EventFrequency::Hourly,
            "Daily" => EventFrequency::Daily,
            "Weekly" => EventFrequency::Weekly,
            "Monthly" => EventFrequency::Monthly,
            "Yearly" | "Annual" => EventFrequency::Yearly,
            "Hourly Long" => EventFrequency::HourlyLong,
            "Daily Long" => EventFrequency::DailyLong,
            "Weekly Long" => EventFrequency::WeeklyLong,
            "Monthly Long" => EventFrequency::MonthlyLong,
            other => match other.strip_prefix(CRON_PREFIX) {
                Some(expr) => {
                    let expr = expr.trim().to_string();
                    parse_cron(&expr)?;
                    EventFrequency::Cron(expr)
                }
                None => {
                    return Err(AppError::validation(format!(
                        "unknown event frequency '{}'",
                        other
                    )));
                }
            },
        };
        Ok(frequency)
    }
}

impl TryFrom<String> for EventFrequency {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventFrequency> for String {
    fn from(value: EventFrequency) -> Self {
        value.to_string()
    }
}

/// A stored, user-authored script and its trigger metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRecord {
    /// Taken from the URL on `PUT /api/scripts/{name}`.
    #[serde(default)]
    pub name: String,
    pub script_type: ScriptType,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub allow_guest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_frequency: Option<EventFrequency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_doctype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctype_event: Option<DocEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl DocType for ScriptRecord {
    const DOCTYPE: &'static str = "Server Script";

    fn name(&self) -> &str {
        &self.name
    }
}

impl ScriptRecord {
    pub fn new(name: impl Into<String>, script_type: ScriptType, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script_type,
            script: script.into(),
            disabled: false,
            allow_guest: false,
            event_frequency: None,
            api_method: None,
            reference_doctype: None,
            doctype_event: None,
            modified: None,
        }
    }

    pub fn with_frequency(mut self, frequency: EventFrequency) -> Self {
        self.event_frequency = Some(frequency);
        self
    }

    pub fn with_guest_access(mut self, allow_guest: bool) -> Self {
        self.allow_guest = allow_guest;
        self
    }

    pub fn with_api_method(mut self, method: impl Into<String>) -> Self {
        self.api_method = Some(method.into());
        self
    }

    pub fn with_doctype(mut self, doctype: impl Into<String>, event: Option<DocEvent>) -> Self {
        self.reference_doctype = Some(doctype.into());
        self.doctype_event = event;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Frequency that actually drives scheduling; `None` for non-scheduler types.
    pub fn active_frequency(&self) -> Option<&EventFrequency> {
        match self.script_type {
            ScriptType::SchedulerEvent => self.event_frequency.as_ref(),
            _ => None,
        }
    }

    /// Guest access is only honoured for API scripts.
    pub fn guest_allowed(&self) -> bool {
        self.script_type == ScriptType::Api && self.allow_guest
    }

    /// Route under which an API script is reachable.
    pub fn api_route(&self) -> &str {
        self.api_method
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.name)
    }
}

/// Scheduler-facing job record, keyed by `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobBinding {
    pub name: String,
    pub method: String,
    pub frequency: EventFrequency,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(default)]
    pub create_log: bool,
}

impl DocType for ScheduledJobBinding {
    const DOCTYPE: &'static str = "Scheduled Job Type";

    fn name(&self) -> &str {
        &self.name
    }
}

impl ScheduledJobBinding {
    pub fn for_script(script_name: &str, frequency: EventFrequency) -> Self {
        let method = binding_method(script_name, &frequency);
        Self {
            name: method.clone(),
            method,
            frequency,
            stopped: false,
            server_script: Some(script_name.to_string()),
            last_execution: None,
            create_log: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Complete,
    Failed,
}

/// One execution of a scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobLog {
    pub name: String,
    pub scheduled_job: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DocType for ScheduledJobLog {
    const DOCTYPE: &'static str = "Scheduled Job Log";

    fn name(&self) -> &str {
        &self.name
    }
}

impl ScheduledJobLog {
    pub fn new(scheduled_job: &str, status: JobStatus, details: Option<String>) -> Self {
        Self {
            name: uuid::Uuid::new_v4().to_string(),
            scheduled_job: scheduled_job.to_string(),
            status,
            details,
            created_at: Utc::now(),
        }
    }
}

/// Lowercase `text`, turning spaces and hyphens into underscores.
pub fn slug(text: &str) -> String {
    text.trim().replace([' ', '-'], "_").to_lowercase()
}

/// Join key between a script and its scheduled job.
pub fn binding_method(script_name: &str, frequency: &EventFrequency) -> String {
    slug(&format!("{}-{}", script_name, frequency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slug() {
        assert_eq!(slug("Nightly Cleanup-Daily"), "nightly_cleanup_daily");
        assert_eq!(slug("  Sync-Hourly Long "), "sync_hourly_long");
    }

    #[test]
    fn test_binding_method_is_stable() {
        let a = binding_method("Invoice Reminder", &EventFrequency::Daily);
        let b = binding_method("Invoice Reminder", &EventFrequency::Daily);
        assert_eq!(a, b);
        assert_eq!(a, "invoice_reminder_daily");
        assert_ne!(a, binding_method("Invoice Reminder", &EventFrequency::Weekly));
    }

    #[test]
    fn test_frequency_labels() {
        for label in ["All", "Hourly", "Daily Long", "Monthly Long", "Cron:0/15 * * * *"] {
            let parsed: EventFrequency = label.parse().unwrap();
            assert_eq!(parsed.to_string(), label);
        }
        assert!(matches!(
            "Fortnightly".parse::<EventFrequency>(),
            Err(AppError::Validation { .. })
        ));
    }

    #[test]
    fn test_cron_frequency_requires_five_fields() {
        assert!("Cron:0 9 * * MON-FRI".parse::<EventFrequency>().is_ok());
        assert!("Cron:0 9 * *".parse::<EventFrequency>().is_err());
        assert!("Cron:not a cron at all".parse::<EventFrequency>().is_err());
    }

    fn next_run(label: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        let frequency: EventFrequency = label.parse().unwrap();
        frequency.schedule(4).unwrap().after(&after).next().unwrap()
    }

    #[test]
    fn test_cron_day_of_week_uses_standard_numbering() {
        use chrono::{Datelike, TimeZone, Weekday};

        // 2024-01-01 is a Monday.
        let monday = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap();

        let run = next_run("Cron:0 9 * * 1", monday);
        assert_eq!(run, Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());

        let run = next_run("Cron:0 0 * * 0", monday);
        assert_eq!(run.weekday(), Weekday::Sun);
        assert_eq!(next_run("Cron:0 0 * * 7", monday), run);

        let run = next_run("Cron:0 9 * * 1-5", saturday);
        assert_eq!(run, Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap());

        let run = next_run("Cron:0 9 * * 5-7", monday);
        assert_eq!(run.weekday(), Weekday::Fri);
        let run = next_run("Cron:0 9 * * 5-7", saturday + chrono::Duration::hours(12));
        assert_eq!(run.weekday(), Weekday::Sun);

        let run = next_run("Cron:0 9 * * 0,3", monday);
        assert_eq!(run.weekday(), Weekday::Wed);
        assert_eq!(next_run("Cron:0 9 * * MON", saturday).weekday(), Weekday::Mon);
    }

    #[test]
    fn test_cron_day_of_week_out_of_range() {
        assert!("Cron:0 9 * * 8".parse::<EventFrequency>().is_err());
    }

    #[test]
    fn test_builtin_frequencies_have_schedules() {
        for frequency in [
            EventFrequency::All,
            EventFrequency::Hourly,
            EventFrequency::Daily,
            EventFrequency::Weekly,
            EventFrequency::Monthly,
            EventFrequency::Yearly,
            EventFrequency::WeeklyLong,
        ] {
            assert!(frequency.schedule(4).is_ok(), "{} should parse", frequency);
        }
    }

    #[test]
    fn test_script_record_document_roundtrip() {
        let record = ScriptRecord::new("Nightly", ScriptType::SchedulerEvent, "server.log('x')")
            .with_frequency(EventFrequency::Daily);
        let doc = record.to_document().unwrap();

        assert_eq!(doc.doctype, "Server Script");
        assert_eq!(doc.name, "Nightly");
        assert_eq!(doc.get("script_type"), Some(json!("Scheduler Event")));
        assert_eq!(doc.get("event_frequency"), Some(json!("Daily")));
        assert_eq!(ScriptRecord::from_document(&doc).unwrap(), record);
    }

    #[test]
    fn test_inactive_fields_are_ignored() {
        let api = ScriptRecord::new("a", ScriptType::Api, "")
            .with_frequency(EventFrequency::Daily)
            .with_guest_access(true);
        assert!(api.active_frequency().is_none());
        assert!(api.guest_allowed());

        let job = ScriptRecord::new("b", ScriptType::SchedulerEvent, "").with_guest_access(true);
        assert!(!job.guest_allowed());
    }

    #[test]
    fn test_api_route_defaults_to_name() {
        let record = ScriptRecord::new("Ping", ScriptType::Api, "");
        assert_eq!(record.api_route(), "Ping");
        assert_eq!(record.with_api_method("ping").api_route(), "ping");
    }

    #[test]
    fn test_merge_keeps_identity() {
        let mut doc = Document::new("ToDo", "T-1").with("status", "Open");
        doc.merge_from_value(json!({"doctype": "Other", "name": "X", "status": "Closed"}))
            .unwrap();

        assert_eq!(doc.doctype, "ToDo");
        assert_eq!(doc.name, "T-1");
        assert_eq!(doc.get("status"), Some(json!("Closed")));
    }
}
