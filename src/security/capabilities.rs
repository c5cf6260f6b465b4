use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Name the host uses for unauthenticated callers.
pub const GUEST: &str = "Guest";
pub const ADMINISTRATOR: &str = "Administrator";
pub const SCRIPT_MANAGER_ROLE: &str = "Script Manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// List and read stored scripts.
    ReadScripts,
    /// Create, modify and delete stored scripts.
    ManageScripts,
}

/// Identity of whoever triggered a save, delete or execution.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub capabilities: HashSet<Capability>,
}

impl UserContext {
    pub fn guest() -> Self {
        Self {
            user_id: None,
            roles: Vec::new(),
            capabilities: HashSet::new(),
        }
    }

    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self::with_roles(user_id, Vec::<String>::new())
    }

    pub fn script_manager(user_id: impl Into<String>) -> Self {
        Self::with_roles(user_id, [SCRIPT_MANAGER_ROLE])
    }

    pub fn administrator() -> Self {
        Self::with_roles(ADMINISTRATOR, [ADMINISTRATOR])
    }

    /// Capabilities follow from the roles. Only script managers and
    /// administrators may read or change scripts.
    pub fn with_roles<I, S>(user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let user_id = user_id.into();
        if user_id.is_empty() || user_id == GUEST {
            return Self::guest();
        }

        let roles: Vec<String> = roles.into_iter().map(Into::into).collect();
        let mut capabilities = HashSet::new();
        if roles
            .iter()
            .any(|r| r == SCRIPT_MANAGER_ROLE || r == ADMINISTRATOR)
        {
            capabilities.insert(Capability::ReadScripts);
            capabilities.insert(Capability::ManageScripts);
        }

        Self {
            user_id: Some(user_id),
            roles,
            capabilities,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.user_id.is_none()
    }

    /// User name as scripts see it in `server.session.user`.
    pub fn current_user(&self) -> &str {
        self.user_id.as_deref().unwrap_or(GUEST)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require_capability(&self, capability: Capability) -> AppResult<()> {
        if self.has_capability(capability) {
            Ok(())
        } else {
            Err(AppError::permission(format!(
                "{} lacks {:?}",
                self.current_user(),
                capability
            )))
        }
    }
}
