//! Delete operations: soft or hard removal with referential actions.

use plinth_sql::{Delete, Filter, Select, SelectColumn, Update, Value};

use crate::access::AccessEnforcer;
use crate::context::{Operation, OperationContext};
use crate::error::{Error, Result};
use crate::hooks::HookStage;
use crate::record::DeleteResult;
use crate::relation::{ReferentialAction, Relation};
use crate::schema;
use crate::util;
use crate::version::VersionManager;

use super::{system_ctx, with_tx, Crud, MAX_WRITE_DEPTH};

use plinth_sql::DriverTransaction;

impl Crud {
    /// Deletes one record by id. Soft-deleting collections mark the row;
    /// others remove it (translations go with it, version history stays).
    pub fn delete_by_id(&self, id: &Value, ctx: &OperationContext) -> Result<DeleteResult> {
        let driver = self.driver(ctx);
        with_tx(driver.as_ref(), |tx| self.delete_in_tx(tx, id, ctx, 0))?;
        self.notify_search_remove(id);
        Ok(DeleteResult { success: true, count: 1 })
    }

    pub(crate) fn delete_in_tx(
        &self,
        tx: &mut dyn DriverTransaction,
        id: &Value,
        ctx: &OperationContext,
        depth: u32,
    ) -> Result<()> {
        if depth > MAX_WRITE_DEPTH {
            return Err(Error::Validation(format!(
                "cascade depth exceeded on collection {}",
                self.collection.name
            )));
        }
        let locale = self.locale(ctx).to_string();
        let original = self
            .load_plain_in_tx(tx, id, ctx)?
            .ok_or_else(|| Error::NotFound(format!("{} record {:?}", self.collection.name, id)))?;
        let decision = self.access_decision(Operation::Delete, ctx, Some(&original), None, None)?;
        AccessEnforcer::check_row(&decision, &original)?;

        let mut data = original.clone();
        for stage in [HookStage::BeforeOperation, HookStage::BeforeDelete] {
            self.run_hooks(stage, Operation::Delete, ctx, &locale, &mut data, Some(&original), Some(id))?;
        }

        // Snapshot the pre-delete state so history survives a hard delete.
        let translations = self.load_translations_in_tx(tx, id)?;
        let snapshot_translations: Vec<_> = translations
            .iter()
            .map(|(l, r)| (l.clone(), r.clone()))
            .collect();
        VersionManager::snapshot(
            tx,
            &self.collection,
            id,
            Operation::Delete,
            ctx.user_id(),
            &original,
            &snapshot_translations,
        )?;

        self.apply_referential_actions(tx, id, &original, ctx, depth)?;

        if self.collection.soft_delete() {
            let now = util::now();
            let mut stmt = Update::table(self.collection.table_name())
                .set(schema::DELETED_AT, now.clone())
                .with_filter(Filter::eq(schema::ID, id.clone()));
            if self.collection.timestamps() {
                stmt = stmt.set(schema::UPDATED_AT, now);
            }
            tx.update(&stmt)?;
        } else {
            tx.delete(
                &Delete::from(self.collection.table_name())
                    .with_filter(Filter::eq(schema::ID, id.clone())),
            )?;
        }

        let mut data = original.clone();
        self.run_hooks(
            HookStage::AfterDelete,
            Operation::Delete,
            ctx,
            &locale,
            &mut data,
            Some(&original),
            Some(id),
        )?;
        Ok(())
    }

    /// Bulk delete by constraint. Access checks, before-hooks, version
    /// snapshots, and referential actions run once per matched row inside
    /// the transaction; the removal itself is one batched statement over
    /// all matched ids. AfterDelete hooks and search removal run per row
    /// after commit, so a failing after-hook cannot roll back the write.
    pub fn delete(&self, filter: Option<Filter>, ctx: &OperationContext) -> Result<DeleteResult> {
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();

        let decision =
            self.access_decision(Operation::Delete, ctx, None, None, Some(driver.as_ref()))?;
        let access_filter = AccessEnforcer::query_filter(decision)?;
        let combined =
            Filter::merge(filter, Filter::merge(access_filter, self.visibility_filter(ctx)));

        let removed = with_tx(driver.as_ref(), |tx| {
            let matched = self.select_plain_rows_in_tx(tx, combined, &locale)?;
            if matched.is_empty() {
                return Ok(Vec::new());
            }
            for row in &matched {
                let decision =
                    self.access_decision(Operation::Delete, ctx, Some(row), None, None)?;
                AccessEnforcer::check_row(&decision, row)?;
            }
            let ids: Vec<Value> = matched.iter().map(|r| r.value(schema::ID)).collect();
            for row in &matched {
                let id = row.value(schema::ID);
                let mut data = row.clone();
                for stage in [HookStage::BeforeOperation, HookStage::BeforeDelete] {
                    self.run_hooks(stage, Operation::Delete, ctx, &locale, &mut data, Some(row), Some(&id))?;
                }
                let translations = self.load_translations_in_tx(tx, &id)?;
                let snapshot_translations: Vec<_> = translations
                    .iter()
                    .map(|(l, r)| (l.clone(), r.clone()))
                    .collect();
                VersionManager::snapshot(
                    tx,
                    &self.collection,
                    &id,
                    Operation::Delete,
                    ctx.user_id(),
                    row,
                    &snapshot_translations,
                )?;
                self.apply_referential_actions(tx, &id, row, ctx, 0)?;
            }
            if self.collection.soft_delete() {
                let now = util::now();
                let mut stmt = Update::table(self.collection.table_name())
                    .set(schema::DELETED_AT, now.clone())
                    .with_filter(Filter::is_in(schema::ID, ids));
                if self.collection.timestamps() {
                    stmt = stmt.set(schema::UPDATED_AT, now);
                }
                tx.update(&stmt)?;
            } else {
                tx.delete(
                    &Delete::from(self.collection.table_name())
                        .with_filter(Filter::is_in(schema::ID, ids)),
                )?;
            }
            Ok(matched)
        })?;

        for row in &removed {
            let id = row.value(schema::ID);
            let mut data = row.clone();
            self.run_hooks(
                HookStage::AfterDelete,
                Operation::Delete,
                ctx,
                &locale,
                &mut data,
                Some(row),
                Some(&id),
            )?;
            self.notify_search_remove(&id);
        }
        Ok(DeleteResult { success: true, count: removed.len() as u64 })
    }

    /// Walks this collection's outgoing relations and applies each one's
    /// on-delete action before the row itself goes away. Cascaded child
    /// deletes run the children's own hook pipelines; set-null does not.
    fn apply_referential_actions(
        &self,
        tx: &mut dyn DriverTransaction,
        id: &Value,
        original: &plinth_sql::Row,
        ctx: &OperationContext,
        depth: u32,
    ) -> Result<()> {
        let sys = system_ctx(ctx);
        for relation in self.collection.relations.values() {
            match relation {
                Relation::HasMany { target, via, on_delete } => {
                    let target_crud = self.target(target)?;
                    let inverse = target_crud.collection.relation(via)?.clone();
                    let Relation::BelongsTo { fk_column, references, .. } = inverse else {
                        return Err(Error::InvalidDefinition(format!(
                            "relation {via} on {target} must be a belongsTo back-reference"
                        )));
                    };
                    let parent_key = original.value(&references);
                    match on_delete {
                        Some(ReferentialAction::Cascade) => {
                            let child_ids = target_crud.collect_ids_in_tx(
                                tx,
                                Filter::eq(fk_column.clone(), parent_key.clone()),
                            )?;
                            for child_id in child_ids {
                                target_crud.delete_in_tx(tx, &child_id, &sys, depth + 1)?;
                                target_crud.notify_search_remove(&child_id);
                            }
                        }
                        Some(ReferentialAction::SetNull) => {
                            tx.update(
                                &Update::table(target_crud.collection.table_name())
                                    .set(fk_column.clone(), Value::Null)
                                    .with_filter(Filter::eq(fk_column.clone(), parent_key.clone())),
                            )?;
                        }
                        // Restrict and unset take no application-level
                        // action; the store's own constraints decide.
                        Some(ReferentialAction::Restrict) | None => {}
                    }
                }
                Relation::ManyToMany { junction, source_key, on_delete, .. } => {
                    if !matches!(on_delete, Some(ReferentialAction::Cascade)) {
                        continue;
                    }
                    let junction_crud = self.target(junction)?;
                    let link_filter = Filter::eq(source_key.clone(), id.clone());
                    let links = junction_crud.collect_ids_in_tx(tx, link_filter)?;
                    for link_id in links {
                        junction_crud.delete_in_tx(tx, &link_id, &sys, depth + 1)?;
                    }
                }
                Relation::BelongsTo { .. } | Relation::Polymorphic { .. } => {}
            }
        }
        Ok(())
    }

    /// Ids of all live rows matching a primary-table constraint.
    pub(crate) fn collect_ids_in_tx(
        &self,
        tx: &mut dyn DriverTransaction,
        filter: Filter,
    ) -> Result<Vec<Value>> {
        let visibility = (self.collection.soft_delete())
            .then(|| Filter::is_null(schema::DELETED_AT));
        let stmt = Select::from(self.collection.table_name())
            .column(SelectColumn::column(schema::ID))
            .with_filter_opt(Filter::merge(Some(filter), visibility));
        Ok(tx
            .select(&stmt)?
            .into_iter()
            .map(|r| r.value(schema::ID))
            .collect())
    }
}
