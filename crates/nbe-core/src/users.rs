//! User directory
//!
//! Account management lives outside the engine; it only needs to know which
//! users exist and who is an admin.

use std::collections::HashMap;

/// Injected user registry
pub trait UserDirectory: Send + Sync + 'static {
    /// Whether an account exists
    fn user_exists(&self, user: &str) -> bool;

    /// Admins may edit every worksheet
    fn is_admin(&self, user: &str) -> bool;
}

/// Fixed set of users
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: HashMap<String, bool>,
}

impl StaticUsers {
    /// Directory with no users
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a regular user
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.users.insert(user.into(), false);
        self
    }

    /// Add an administrator
    #[must_use]
    pub fn with_admin(mut self, user: impl Into<String>) -> Self {
        self.users.insert(user.into(), true);
        self
    }
}

impl UserDirectory for StaticUsers {
    fn user_exists(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }

    fn is_admin(&self, user: &str) -> bool {
        self.users.get(user).copied().unwrap_or(false)
    }
}
