//! Access rules and their enforcement.
//!
//! Each collection carries an optional rule per operation class. A missing
//! rule allows the operation. Rules never run in system mode.

use std::fmt;
use std::sync::Arc;

use plinth_sql::{Driver, Filter, Row};

use crate::context::{Operation, OperationContext, RequestUser};
use crate::error::{Error, Result};

/// What an access rule decides for an operation.
#[derive(Clone, Debug, PartialEq)]
pub enum AccessDecision {
    Allow,
    Deny,
    /// Allow, but constrain visibility to rows matching the filter.
    Filter(Filter),
}

/// Inputs available to a predicate rule.
pub struct AccessArgs<'a> {
    pub user: Option<&'a RequestUser>,
    /// The existing row, for operations that target one.
    pub row: Option<&'a Row>,
    /// The incoming data, for writes.
    pub input: Option<&'a Row>,
    pub db: Option<&'a dyn Driver>,
    pub context: &'a OperationContext,
}

pub type AccessFn = Arc<dyn Fn(&AccessArgs<'_>) -> Result<AccessDecision> + Send + Sync>;

/// A single access rule.
#[derive(Clone)]
pub enum AccessRule {
    /// Unconditionally allow or deny.
    Allow(bool),
    /// Allow only users carrying this role.
    Role(String),
    /// Arbitrary predicate over the user, row, and input.
    Predicate(AccessFn),
}

impl AccessRule {
    /// Predicate rule from a closure.
    pub fn predicate(
        f: impl Fn(&AccessArgs<'_>) -> Result<AccessDecision> + Send + Sync + 'static,
    ) -> Self {
        AccessRule::Predicate(Arc::new(f))
    }

    /// Rule that scopes reads to rows where `column` equals the acting
    /// user's id, denying anonymous access.
    pub fn owner(column: impl Into<String>) -> Self {
        let column = column.into();
        AccessRule::predicate(move |args| match args.user {
            Some(user) => Ok(AccessDecision::Filter(Filter::eq(
                column.clone(),
                user.id.clone(),
            ))),
            None => Ok(AccessDecision::Deny),
        })
    }
}

impl fmt::Debug for AccessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessRule::Allow(b) => f.debug_tuple("Allow").field(b).finish(),
            AccessRule::Role(r) => f.debug_tuple("Role").field(r).finish(),
            AccessRule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Per-operation-class rules for one collection. Restore and revert fall
/// under `update`; count falls under `read`.
#[derive(Clone, Debug, Default)]
pub struct AccessRules {
    pub read: Option<AccessRule>,
    pub create: Option<AccessRule>,
    pub update: Option<AccessRule>,
    pub delete: Option<AccessRule>,
}

impl AccessRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(&self, operation: Operation) -> Option<&AccessRule> {
        match operation {
            Operation::Read => self.read.as_ref(),
            Operation::Create => self.create.as_ref(),
            Operation::Update | Operation::Restore | Operation::Revert => self.update.as_ref(),
            Operation::Delete => self.delete.as_ref(),
        }
    }

    /// Shallow merge: any rule set on `other` replaces this set's rule for
    /// that operation class.
    pub fn merge_from(&mut self, other: &AccessRules) {
        if let Some(r) = &other.read {
            self.read = Some(r.clone());
        }
        if let Some(r) = &other.create {
            self.create = Some(r.clone());
        }
        if let Some(r) = &other.update {
            self.update = Some(r.clone());
        }
        if let Some(r) = &other.delete {
            self.delete = Some(r.clone());
        }
    }
}

/// Evaluates access rules against an operation context.
pub struct AccessEnforcer;

impl AccessEnforcer {
    /// Resolves the rule for this operation to a decision. System mode and
    /// missing rules short-circuit to allow.
    pub fn evaluate(
        rules: &AccessRules,
        operation: Operation,
        ctx: &OperationContext,
        row: Option<&Row>,
        input: Option<&Row>,
        db: Option<&dyn Driver>,
    ) -> Result<AccessDecision> {
        if ctx.is_system() {
            return Ok(AccessDecision::Allow);
        }
        let Some(rule) = rules.rule(operation) else {
            return Ok(AccessDecision::Allow);
        };
        match rule {
            AccessRule::Allow(true) => Ok(AccessDecision::Allow),
            AccessRule::Allow(false) => Ok(AccessDecision::Deny),
            AccessRule::Role(role) => {
                let held = ctx
                    .user
                    .as_ref()
                    .and_then(|u| u.role.as_deref())
                    .is_some_and(|r| r == role);
                Ok(if held {
                    AccessDecision::Allow
                } else {
                    AccessDecision::Deny
                })
            }
            AccessRule::Predicate(f) => f(&AccessArgs {
                user: ctx.user.as_ref(),
                row,
                input,
                db,
                context: ctx,
            }),
        }
    }

    /// Converts a decision into an optional query constraint. Denial is an
    /// error at this point.
    pub fn query_filter(decision: AccessDecision) -> Result<Option<Filter>> {
        match decision {
            AccessDecision::Allow => Ok(None),
            AccessDecision::Deny => Err(Error::AccessDenied),
            AccessDecision::Filter(f) => Ok(Some(f)),
        }
    }

    /// Checks a decision against a concrete row, for single-record writes.
    pub fn check_row(decision: &AccessDecision, row: &Row) -> Result<()> {
        match decision {
            AccessDecision::Allow => Ok(()),
            AccessDecision::Deny => Err(Error::AccessDenied),
            AccessDecision::Filter(f) => {
                if f.matches_row(row) {
                    Ok(())
                } else {
                    Err(Error::AccessDenied)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AccessMode, RequestUser};
    use plinth_sql::{row, Value};

    fn user_ctx(role: Option<&str>) -> OperationContext {
        let mut user = RequestUser::new("u1");
        if let Some(r) = role {
            user = user.with_role(r);
        }
        OperationContext::as_user(user)
    }

    #[test]
    fn test_missing_rule_allows() {
        let rules = AccessRules::new();
        let d = AccessEnforcer::evaluate(
            &rules,
            Operation::Read,
            &user_ctx(None),
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(d, AccessDecision::Allow);
    }

    #[test]
    fn test_system_mode_bypasses_deny() {
        let rules = AccessRules {
            delete: Some(AccessRule::Allow(false)),
            ..AccessRules::new()
        };
        let ctx = OperationContext::new().with_access_mode(AccessMode::System);
        let d = AccessEnforcer::evaluate(&rules, Operation::Delete, &ctx, None, None, None)
            .unwrap();
        assert_eq!(d, AccessDecision::Allow);
    }

    #[test]
    fn test_role_rule() {
        let rules = AccessRules {
            update: Some(AccessRule::Role("editor".into())),
            ..AccessRules::new()
        };
        let allowed = AccessEnforcer::evaluate(
            &rules,
            Operation::Update,
            &user_ctx(Some("editor")),
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(allowed, AccessDecision::Allow);

        let denied = AccessEnforcer::evaluate(
            &rules,
            Operation::Update,
            &user_ctx(Some("viewer")),
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(denied, AccessDecision::Deny);
    }

    #[test]
    fn test_restore_uses_update_rule() {
        let rules = AccessRules {
            update: Some(AccessRule::Allow(false)),
            ..AccessRules::new()
        };
        let d = AccessEnforcer::evaluate(
            &rules,
            Operation::Restore,
            &user_ctx(None),
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(d, AccessDecision::Deny);
    }

    #[test]
    fn test_owner_rule_filters_by_user_id() {
        let rules = AccessRules {
            read: Some(AccessRule::owner("author_id")),
            ..AccessRules::new()
        };
        let d = AccessEnforcer::evaluate(&rules, Operation::Read, &user_ctx(None), None, None, None)
            .unwrap();
        assert_eq!(
            d,
            AccessDecision::Filter(Filter::eq("author_id", Value::from("u1")))
        );
    }

    #[test]
    fn test_check_row_with_filter() {
        let d = AccessDecision::Filter(Filter::eq("author_id", Value::from("u1")));
        assert!(AccessEnforcer::check_row(&d, &row! { "author_id" => "u1" }).is_ok());
        assert!(matches!(
            AccessEnforcer::check_row(&d, &row! { "author_id" => "u2" }),
            Err(Error::AccessDenied)
        ));
    }

    #[test]
    fn test_merge_from_overrides() {
        let mut base = AccessRules {
            read: Some(AccessRule::Allow(true)),
            delete: Some(AccessRule::Allow(false)),
            ..AccessRules::new()
        };
        base.merge_from(&AccessRules {
            read: Some(AccessRule::Allow(false)),
            ..AccessRules::new()
        });
        assert!(matches!(base.read, Some(AccessRule::Allow(false))));
        assert!(matches!(base.delete, Some(AccessRule::Allow(false))));
    }
}
