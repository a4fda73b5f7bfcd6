//! Read operations: find, findOne, findById, count.

use plinth_sql::{Expr, Filter, OrderSpec, SelectColumn, Value};

use crate::access::AccessEnforcer;
use crate::context::{Operation, OperationContext};
use crate::error::Result;
use crate::expr::ExprScope;
use crate::hooks::HookStage;
use crate::record::{Paginated, Record};
use crate::relation::{resolver, WithMap};
use crate::schema;

use super::{Crud, FindOptions};

impl Crud {
    /// Lists records in a paged envelope. The total is counted with the
    /// same constraints before pagination applies.
    pub fn find(&self, options: FindOptions, ctx: &OperationContext) -> Result<Paginated<Record>> {
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();

        let decision = self.access_decision(Operation::Read, ctx, None, None, Some(driver.as_ref()))?;
        let access_filter = AccessEnforcer::query_filter(decision)?;
        let combined = Filter::merge(
            options.filter.clone(),
            Filter::merge(access_filter, self.visibility_filter(ctx)),
        );

        let count_stmt = self
            .base_select(&locale)
            .column(SelectColumn::new("total", Expr::count()))
            .with_filter_opt(combined.clone());
        let total = driver
            .select(&count_stmt)?
            .first()
            .and_then(|r| r.value("total").as_i64())
            .unwrap_or(0) as u64;

        let docs = self.query_docs(&options, combined, ctx)?;
        Ok(Paginated::new(
            docs,
            total,
            options.limit,
            options.offset.unwrap_or(0),
        ))
    }

    /// First matching record, if any.
    pub fn find_one(
        &self,
        mut options: FindOptions,
        ctx: &OperationContext,
    ) -> Result<Option<Record>> {
        options.limit = Some(1);
        options.offset = None;
        let driver = self.driver(ctx);
        let decision = self.access_decision(Operation::Read, ctx, None, None, Some(driver.as_ref()))?;
        let access_filter = AccessEnforcer::query_filter(decision)?;
        let combined = Filter::merge(
            options.filter.clone(),
            Filter::merge(access_filter, self.visibility_filter(ctx)),
        );
        Ok(self.query_docs(&options, combined, ctx)?.into_iter().next())
    }

    /// Record by id, observing access rules and soft-delete visibility.
    pub fn find_by_id(&self, id: &Value, ctx: &OperationContext) -> Result<Option<Record>> {
        self.find_one(
            FindOptions::new().with_filter(Filter::eq(schema::ID, id.clone())),
            ctx,
        )
    }

    /// Number of records matching the filter under this context.
    pub fn count(&self, filter: Option<Filter>, ctx: &OperationContext) -> Result<u64> {
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();
        let decision = self.access_decision(Operation::Read, ctx, None, None, Some(driver.as_ref()))?;
        let access_filter = AccessEnforcer::query_filter(decision)?;
        let combined = Filter::merge(filter, Filter::merge(access_filter, self.visibility_filter(ctx)));
        let stmt = self
            .base_select(&locale)
            .column(SelectColumn::new("total", Expr::count()))
            .with_filter_opt(combined);
        Ok(driver
            .select(&stmt)?
            .first()
            .and_then(|r| r.value("total").as_i64())
            .unwrap_or(0) as u64)
    }

    /// Runs the projected query and per-record post-processing (relation
    /// resolution and afterRead hooks). `combined` is the fully merged
    /// WHERE constraint.
    fn query_docs(
        &self,
        options: &FindOptions,
        combined: Option<Filter>,
        ctx: &OperationContext,
    ) -> Result<Vec<Record>> {
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();
        let default_locale = self.default_locale(ctx).to_string();
        let scope = ExprScope::query(&self.collection, &locale, &default_locale);

        let mut stmt = self
            .base_select(&locale)
            .columns(self.projection(&scope, options.select.as_ref()))
            .with_filter_opt(combined);
        if options.order.is_empty() {
            // Stable id order keeps pagination deterministic.
            stmt = stmt.order(OrderSpec::asc(schema::ID));
        } else {
            for spec in &options.order {
                stmt = stmt.order(spec.clone());
            }
        }
        if let Some(limit) = options.limit {
            stmt = stmt.with_limit(limit);
        }
        if let Some(offset) = options.offset {
            stmt = stmt.with_offset(offset);
        }

        let rows = driver.select(&stmt)?;
        let mut records: Vec<Record> = rows.into_iter().map(Record::new).collect();
        resolver::resolve(self, &mut records, &options.with, ctx, 0)?;
        self.after_read(&mut records, ctx, &locale)?;
        Ok(records)
    }

    /// Unchecked load used for relation resolution and internal reads:
    /// full locale-aware projection, no access rules, caller-controlled
    /// visibility.
    pub(crate) fn select_docs(
        &self,
        filter: Option<Filter>,
        with: &WithMap,
        ctx: &OperationContext,
        depth: u32,
    ) -> Result<Vec<Record>> {
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();
        let default_locale = self.default_locale(ctx).to_string();
        let scope = ExprScope::query(&self.collection, &locale, &default_locale);
        let combined = Filter::merge(filter, self.visibility_filter(ctx));
        let stmt = self
            .base_select(&locale)
            .columns(self.projection(&scope, None))
            .with_filter_opt(combined)
            .order(OrderSpec::asc(schema::ID));
        let rows = driver.select(&stmt)?;
        let mut records: Vec<Record> = rows.into_iter().map(Record::new).collect();
        resolver::resolve(self, &mut records, with, ctx, depth)?;
        self.after_read(&mut records, ctx, &locale)?;
        Ok(records)
    }

    fn after_read(
        &self,
        records: &mut [Record],
        ctx: &OperationContext,
        locale: &str,
    ) -> Result<()> {
        if self.collection.hooks.is_empty(HookStage::AfterRead) {
            return Ok(());
        }
        for record in records {
            let id = record.id();
            self.run_hooks(
                HookStage::AfterRead,
                Operation::Read,
                ctx,
                locale,
                &mut record.fields,
                None,
                Some(&id),
            )?;
        }
        Ok(())
    }
}
