pub mod audit;
pub mod capabilities;

pub use audit::{SecurityAuditor, SecurityEvent, SecurityEventType, SecuritySeverity};
pub use capabilities::{ADMINISTRATOR, Capability, GUEST, SCRIPT_MANAGER_ROLE, UserContext};
