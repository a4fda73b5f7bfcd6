//! Ambient request state threaded through every operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use plinth_sql::{Driver, Value};

/// Whether access rules apply to the current operation.
///
/// Engine-internal work (cascades, nested writes, version bookkeeping) runs
/// in [`AccessMode::System`], which bypasses every rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    System,
    User,
}

/// The acting user, as seen by access rules and hooks.
#[derive(Clone, Debug)]
pub struct RequestUser {
    pub id: Value,
    pub role: Option<String>,
    pub attributes: BTreeMap<String, Value>,
}

impl RequestUser {
    pub fn new(id: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            role: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// The kind of operation being performed, as recorded in version history
/// and reported to hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    Restore,
    Revert,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Restore => "restore",
            Operation::Revert => "revert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Operation::Read),
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            "restore" => Some(Operation::Restore),
            "revert" => Some(Operation::Revert),
            _ => None,
        }
    }
}

/// Per-operation context: acting user, locale pair, access mode, and an
/// optional driver override so callers can pin work to a transaction-scoped
/// connection.
///
/// The default context runs in system mode with the engine's default locale.
#[derive(Clone, Default)]
pub struct OperationContext {
    pub user: Option<RequestUser>,
    pub locale: Option<String>,
    pub default_locale: Option<String>,
    pub access_mode: AccessMode,
    pub include_deleted: bool,
    pub driver: Option<Arc<dyn Driver>>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context acting as the given user, with access rules enforced.
    pub fn as_user(user: RequestUser) -> Self {
        Self {
            user: Some(user),
            access_mode: AccessMode::User,
            ..Self::default()
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_default_locale(mut self, locale: impl Into<String>) -> Self {
        self.default_locale = Some(locale.into());
        self
    }

    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.access_mode = mode;
        self
    }

    pub fn with_include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn is_system(&self) -> bool {
        self.access_mode == AccessMode::System
    }

    /// The acting user's id, if any.
    pub fn user_id(&self) -> Option<&Value> {
        self.user.as_ref().map(|u| &u.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_round_trip() {
        for op in [
            Operation::Read,
            Operation::Create,
            Operation::Update,
            Operation::Delete,
            Operation::Restore,
            Operation::Revert,
        ] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("upsert"), None);
    }

    #[test]
    fn test_default_context_is_system() {
        let ctx = OperationContext::new();
        assert!(ctx.is_system());
        assert!(ctx.user.is_none());
        assert!(!ctx.include_deleted);
    }

    #[test]
    fn test_user_context() {
        let ctx = OperationContext::as_user(RequestUser::new("u1").with_role("editor"));
        assert!(!ctx.is_system());
        assert_eq!(ctx.user_id(), Some(&Value::from("u1")));
        assert_eq!(ctx.user.as_ref().unwrap().role.as_deref(), Some("editor"));
    }
}
