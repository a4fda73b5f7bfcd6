//! Version history surface: listing, fetching, and reverting snapshots.

use plinth_sql::{Driver, Filter, Row, Select, Value};

use crate::access::AccessEnforcer;
use crate::context::{Operation, OperationContext};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::schema;
use crate::version::{VersionEntry, VersionManager, VersionSelector};

use super::{with_tx, Crud, UpdateInput};

impl Crud {
    /// Lists a record's version history, oldest first.
    pub fn find_versions(
        &self,
        record_id: &Value,
        limit: Option<u64>,
        offset: Option<u64>,
        ctx: &OperationContext,
    ) -> Result<Vec<VersionEntry>> {
        let driver = self.driver(ctx);
        self.authorize_history(record_id, ctx, driver.as_ref())?;
        VersionManager::find_versions(driver.as_ref(), &self.collection, record_id, limit, offset)
    }

    /// Fetches one version by number or snapshot id.
    pub fn find_version(
        &self,
        record_id: &Value,
        selector: &VersionSelector,
        ctx: &OperationContext,
    ) -> Result<VersionEntry> {
        let driver = self.driver(ctx);
        self.authorize_history(record_id, ctx, driver.as_ref())?;
        VersionManager::find_version(driver.as_ref(), &self.collection, record_id, selector)
    }

    /// Rewrites the live record to a snapshot's state. The revert itself
    /// runs through the update pipeline, so it appends a new version
    /// rather than rewinding the history.
    pub fn revert_to_version(
        &self,
        record_id: &Value,
        selector: &VersionSelector,
        ctx: &OperationContext,
    ) -> Result<Record> {
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();
        self.authorize_history(record_id, ctx, driver.as_ref())?;
        let entry =
            VersionManager::find_version(driver.as_ref(), &self.collection, record_id, selector)?;

        let ctx_all = ctx.clone().with_include_deleted(true);
        let record = with_tx(driver.as_ref(), |tx| {
            // Restore every locale's state first; the update pipeline only
            // rewrites the requested locale.
            for (loc, values) in &entry.translations {
                if !values.is_empty() {
                    self.upsert_translation(tx, record_id, loc, values)?;
                }
            }
            let mut data = Row::new();
            for field in self.collection.plain_fields() {
                data.set(field.name.clone(), entry.snapshot.value(&field.name));
            }
            if self.collection.soft_delete() {
                data.set(schema::DELETED_AT, entry.snapshot.value(schema::DELETED_AT));
            }
            self.update_in_tx(tx, record_id, UpdateInput::new(data), Operation::Revert, &ctx_all, 0)
        })?;
        self.notify_search_index(&record, &locale);
        Ok(record)
    }

    /// History reads use the collection's read rule. A row-filter rule is
    /// checked against the record's current state; a record whose live row
    /// is gone (hard-deleted) stays readable only without such a rule.
    fn authorize_history(
        &self,
        record_id: &Value,
        ctx: &OperationContext,
        driver: &dyn Driver,
    ) -> Result<()> {
        let decision = self.access_decision(Operation::Read, ctx, None, None, Some(driver))?;
        let Some(filter) = AccessEnforcer::query_filter(decision)? else {
            return Ok(());
        };
        let stmt = Select::from(self.collection.table_name())
            .columns(self.plain_projection())
            .with_filter(Filter::eq(schema::ID, record_id.clone()))
            .with_limit(1);
        let row = driver
            .select(&stmt)?
            .into_iter()
            .next()
            .ok_or(Error::AccessDenied)?;
        if filter.matches_row(&row) {
            Ok(())
        } else {
            Err(Error::AccessDenied)
        }
    }
}
