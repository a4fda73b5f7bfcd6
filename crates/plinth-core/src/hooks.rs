//! Lifecycle hooks attached to collection definitions.
//!
//! Hooks within a stage run in registration order. A hook error aborts the
//! operation (and rolls back its transaction when one is open), except for
//! post-commit stages where the write has already landed.

use std::fmt;
use std::sync::Arc;

use plinth_sql::{Row, Value};

use crate::context::{AccessMode, Operation, RequestUser};
use crate::error::{Error, Result};

/// The seven points in an operation's lifecycle where hooks can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookStage {
    BeforeOperation,
    BeforeValidate,
    BeforeChange,
    AfterChange,
    BeforeDelete,
    AfterDelete,
    AfterRead,
}

/// What a hook sees: the operation, the acting user, and the mutable data
/// row it may rewrite in the before-* stages.
pub struct HookArgs<'a> {
    pub operation: Operation,
    pub collection: &'a str,
    pub user: Option<&'a RequestUser>,
    pub locale: &'a str,
    pub access_mode: AccessMode,
    /// Incoming data for writes, the loaded row for reads and deletes.
    pub data: &'a mut Row,
    /// Pre-change state, present on update, delete, restore, and revert.
    pub original: Option<&'a Row>,
    /// Target record id, when the operation addresses a single record.
    pub record_id: Option<&'a Value>,
}

pub type HookFn = Arc<dyn Fn(&mut HookArgs<'_>) -> Result<()> + Send + Sync>;

/// Ordered hook lists, one per stage.
#[derive(Clone, Default)]
pub struct Hooks {
    before_operation: Vec<HookFn>,
    before_validate: Vec<HookFn>,
    before_change: Vec<HookFn>,
    after_change: Vec<HookFn>,
    before_delete: Vec<HookFn>,
    after_delete: Vec<HookFn>,
    after_read: Vec<HookFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stage: HookStage, hook: HookFn) {
        self.stage_mut(stage).push(hook);
    }

    /// Appends all of `other`'s hooks after this set's, stage by stage.
    pub fn extend_from(&mut self, other: &Hooks) {
        for stage in STAGES {
            let theirs: Vec<HookFn> = other.stage(stage).to_vec();
            self.stage_mut(stage).extend(theirs);
        }
    }

    pub fn is_empty(&self, stage: HookStage) -> bool {
        self.stage(stage).is_empty()
    }

    /// Runs every hook registered for the stage, in order. The first error
    /// stops the chain.
    pub fn run(&self, stage: HookStage, args: &mut HookArgs<'_>) -> Result<()> {
        for hook in self.stage(stage) {
            hook(args).map_err(|e| match e {
                Error::Hook(_) => e,
                other => Error::Hook(other.to_string()),
            })?;
        }
        Ok(())
    }

    fn stage(&self, stage: HookStage) -> &[HookFn] {
        match stage {
            HookStage::BeforeOperation => &self.before_operation,
            HookStage::BeforeValidate => &self.before_validate,
            HookStage::BeforeChange => &self.before_change,
            HookStage::AfterChange => &self.after_change,
            HookStage::BeforeDelete => &self.before_delete,
            HookStage::AfterDelete => &self.after_delete,
            HookStage::AfterRead => &self.after_read,
        }
    }

    fn stage_mut(&mut self, stage: HookStage) -> &mut Vec<HookFn> {
        match stage {
            HookStage::BeforeOperation => &mut self.before_operation,
            HookStage::BeforeValidate => &mut self.before_validate,
            HookStage::BeforeChange => &mut self.before_change,
            HookStage::AfterChange => &mut self.after_change,
            HookStage::BeforeDelete => &mut self.before_delete,
            HookStage::AfterDelete => &mut self.after_delete,
            HookStage::AfterRead => &mut self.after_read,
        }
    }
}

const STAGES: [HookStage; 7] = [
    HookStage::BeforeOperation,
    HookStage::BeforeValidate,
    HookStage::BeforeChange,
    HookStage::AfterChange,
    HookStage::BeforeDelete,
    HookStage::AfterDelete,
    HookStage::AfterRead,
];

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_operation", &self.before_operation.len())
            .field("before_validate", &self.before_validate.len())
            .field("before_change", &self.before_change.len())
            .field("after_change", &self.after_change.len())
            .field("before_delete", &self.before_delete.len())
            .field("after_delete", &self.after_delete.len())
            .field("after_read", &self.after_read.len())
            .finish()
    }
}
