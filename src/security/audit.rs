use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum SecurityEventType {
    ScriptSaved,
    ScriptDeleted,
    AuthorizationFailure,
    GuestAccessDenied,
    InputValidationFailure,
    ScriptFailure,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum SecuritySeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub user_id: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub details: BTreeMap<String, String>,
    pub error_message: Option<String>,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: SecuritySeverity,
        user_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            severity,
            user_id,
            resource: None,
            action: None,
            details: BTreeMap::new(),
            error_message: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_detail<K: ToString, V: ToString>(mut self, key: K, value: V) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

/// Writes security-relevant events to the tracing pipeline.
#[derive(Debug, Clone, Default)]
pub struct SecurityAuditor;

impl SecurityAuditor {
    pub fn new() -> Self {
        Self
    }

    pub fn log_event(&self, event: &SecurityEvent) {
        match event.severity {
            SecuritySeverity::Low => {
                info!(
                    event_id = %event.id,
                    event_type = ?event.event_type,
                    user_id = ?event.user_id,
                    resource = ?event.resource,
                    action = ?event.action,
                    "Security event logged"
                );
            }
            SecuritySeverity::Medium => {
                warn!(
                    event_id = %event.id,
                    event_type = ?event.event_type,
                    user_id = ?event.user_id,
                    resource = ?event.resource,
                    action = ?event.action,
                    error = ?event.error_message,
                    "Security warning logged"
                );
            }
            SecuritySeverity::High => {
                error!(
                    event_id = %event.id,
                    event_type = ?event.event_type,
                    user_id = ?event.user_id,
                    resource = ?event.resource,
                    action = ?event.action,
                    details = ?event.details,
                    error = ?event.error_message,
                    "Security event requires attention"
                );
            }
        }
    }

    pub fn log_script_change(&self, user_id: &str, script: &str, action: &str) {
        let event_type = if action == "delete" {
            SecurityEventType::ScriptDeleted
        } else {
            SecurityEventType::ScriptSaved
        };
        let event = SecurityEvent::new(event_type, SecuritySeverity::Low, Some(user_id.to_string()))
            .with_resource(script)
            .with_action(action);
        self.log_event(&event);
    }

    pub fn log_authz_failure(
        &self,
        user_id: Option<String>,
        resource: &str,
        action: &str,
        reason: &str,
    ) {
        let event = SecurityEvent::new(
            SecurityEventType::AuthorizationFailure,
            SecuritySeverity::Medium,
            user_id,
        )
        .with_resource(resource)
        .with_action(action)
        .with_error(reason);
        self.log_event(&event);
    }

    pub fn log_guest_denied(&self, script: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::GuestAccessDenied,
            SecuritySeverity::Medium,
            None,
        )
        .with_resource(script)
        .with_action("api_call");
        self.log_event(&event);
    }

    pub fn log_validation_failure(&self, user_id: Option<String>, script: &str, reason: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::InputValidationFailure,
            SecuritySeverity::Medium,
            user_id,
        )
        .with_resource(script)
        .with_action("save")
        .with_error(reason);
        self.log_event(&event);
    }

    /// Runaway scripts are the one failure worth escalating.
    pub fn log_script_failure(&self, script: &str, entry_point: &str, error: &str, timed_out: bool) {
        let severity = if timed_out {
            SecuritySeverity::High
        } else {
            SecuritySeverity::Low
        };
        let event = SecurityEvent::new(SecurityEventType::ScriptFailure, severity, None)
            .with_resource(script)
            .with_action(entry_point)
            .with_detail("timed_out", timed_out)
            .with_error(error);
        self.log_event(&event);
    }
}
