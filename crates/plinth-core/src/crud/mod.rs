//! The generated CRUD surface over a compiled collection.
//!
//! A [`Crud`] handle is cheap to clone and borrow: it carries the compiled
//! collection plus the shared driver, registry, and search service. Every
//! operation takes an [`OperationContext`] for the acting user, locale
//! pair, and access mode.

mod delete;
mod read;
mod versions;
mod write;

use std::collections::BTreeMap;
use std::sync::Arc;

use plinth_sql::{
    ColumnRef, Driver, DriverTransaction, Expr, Filter, Insert, Join, JoinOn, OnConflict,
    ConflictAction, OrderSpec, Row, Select, SelectColumn, Value,
};

use crate::access::{AccessDecision, AccessEnforcer};
use crate::collection::{Collection, Registry};
use crate::context::{AccessMode, Operation, OperationContext};
use crate::error::{Error, Result};
use crate::expr::{ExprScope, TRANSLATION_ALIAS};
use crate::hooks::{HookArgs, HookStage};
use crate::record::Record;
use crate::schema;
use crate::search::{SearchIndexRequest, SearchRemoveRequest, SearchService};
use crate::util;

/// Depth budget shared by nested writes and cascade chains; relation
/// cycles bottom out here instead of recursing forever.
pub(crate) const MAX_WRITE_DEPTH: u32 = 8;

/// Input to a create: field data plus nested relation operations keyed by
/// relation name.
#[derive(Clone, Default)]
pub struct CreateInput {
    pub data: Row,
    pub relations: BTreeMap<String, RelationWrite>,
}

impl CreateInput {
    pub fn new(data: Row) -> Self {
        Self {
            data,
            relations: BTreeMap::new(),
        }
    }

    pub fn with_relation(mut self, name: impl Into<String>, write: RelationWrite) -> Self {
        self.relations.insert(name.into(), write);
        self
    }
}

/// Input to a single-record update.
#[derive(Clone, Default)]
pub struct UpdateInput {
    pub data: Row,
    pub relations: BTreeMap<String, RelationWrite>,
}

impl UpdateInput {
    pub fn new(data: Row) -> Self {
        Self {
            data,
            relations: BTreeMap::new(),
        }
    }

    pub fn with_relation(mut self, name: impl Into<String>, write: RelationWrite) -> Self {
        self.relations.insert(name.into(), write);
        self
    }
}

/// One nested relation operation. To-one relations accept exactly one
/// entry; to-many relations accept any number.
#[derive(Clone)]
pub enum RelationWrite {
    /// Link existing records by id.
    Connect(Vec<Value>),
    /// Create related records and link them.
    Create(Vec<CreateInput>),
    /// Link a record matching the filter, creating it if none matches.
    ConnectOrCreate(Vec<ConnectOrCreate>),
}

impl RelationWrite {
    pub fn connect(id: impl Into<Value>) -> Self {
        RelationWrite::Connect(vec![id.into()])
    }

    pub fn connect_many(ids: Vec<Value>) -> Self {
        RelationWrite::Connect(ids)
    }

    pub fn create(input: CreateInput) -> Self {
        RelationWrite::Create(vec![input])
    }

    pub fn create_many(inputs: Vec<CreateInput>) -> Self {
        RelationWrite::Create(inputs)
    }

    pub fn connect_or_create(filter: Filter, create: CreateInput) -> Self {
        RelationWrite::ConnectOrCreate(vec![ConnectOrCreate { filter, create }])
    }
}

/// Find-or-create arm of a nested relation write. The filter runs against
/// the target's primary table.
#[derive(Clone)]
pub struct ConnectOrCreate {
    pub filter: Filter,
    pub create: CreateInput,
}

/// Query options for list reads.
#[derive(Clone, Default)]
pub struct FindOptions {
    pub filter: Option<Filter>,
    pub order: Vec<OrderSpec>,
    /// Column selection: any `true` entry switches to allow-list mode,
    /// otherwise `false` entries are excluded. `id` is always projected.
    pub select: Option<BTreeMap<String, bool>>,
    pub with: crate::relation::WithMap,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order(mut self, spec: OrderSpec) -> Self {
        self.order.push(spec);
        self
    }

    pub fn select(mut self, column: impl Into<String>, include: bool) -> Self {
        self.select
            .get_or_insert_with(BTreeMap::new)
            .insert(column.into(), include);
        self
    }

    pub fn with(mut self, name: impl Into<String>, spec: crate::relation::WithSpec) -> Self {
        self.with.insert(name.into(), spec);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// CRUD operations for one collection.
#[derive(Clone)]
pub struct Crud {
    pub(crate) collection: Arc<Collection>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) search: Arc<dyn SearchService>,
    pub(crate) default_locale: String,
}

impl Crud {
    pub(crate) fn new(
        collection: Arc<Collection>,
        registry: Arc<Registry>,
        driver: Arc<dyn Driver>,
        search: Arc<dyn SearchService>,
        default_locale: String,
    ) -> Self {
        Self {
            collection,
            registry,
            driver,
            search,
            default_locale,
        }
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    /// Sibling handle for another registered collection.
    pub(crate) fn target(&self, name: &str) -> Result<Crud> {
        let collection = self.registry.expect(name)?;
        Ok(Crud::new(
            collection,
            self.registry.clone(),
            self.driver.clone(),
            self.search.clone(),
            self.default_locale.clone(),
        ))
    }

    pub(crate) fn driver(&self, ctx: &OperationContext) -> Arc<dyn Driver> {
        ctx.driver.clone().unwrap_or_else(|| self.driver.clone())
    }

    pub(crate) fn default_locale<'a>(&'a self, ctx: &'a OperationContext) -> &'a str {
        ctx.default_locale.as_deref().unwrap_or(&self.default_locale)
    }

    pub(crate) fn locale<'a>(&'a self, ctx: &'a OperationContext) -> &'a str {
        ctx.locale.as_deref().unwrap_or_else(|| self.default_locale(ctx))
    }

    /// Soft-delete visibility constraint for this context.
    pub(crate) fn visibility_filter(&self, ctx: &OperationContext) -> Option<Filter> {
        (self.collection.soft_delete() && !ctx.include_deleted)
            .then(|| Filter::is_null(schema::DELETED_AT))
    }

    pub(crate) fn access_decision(
        &self,
        operation: Operation,
        ctx: &OperationContext,
        row: Option<&Row>,
        input: Option<&Row>,
        driver: Option<&dyn Driver>,
    ) -> Result<AccessDecision> {
        AccessEnforcer::evaluate(&self.collection.access, operation, ctx, row, input, driver)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run_hooks(
        &self,
        stage: HookStage,
        operation: Operation,
        ctx: &OperationContext,
        locale: &str,
        data: &mut Row,
        original: Option<&Row>,
        record_id: Option<&Value>,
    ) -> Result<()> {
        if self.collection.hooks.is_empty(stage) {
            return Ok(());
        }
        let mut args = HookArgs {
            operation,
            collection: &self.collection.name,
            user: ctx.user.as_ref(),
            locale,
            access_mode: ctx.access_mode,
            data,
            original,
            record_id,
        };
        self.collection.hooks.run(stage, &mut args)
    }

    /// Base select with the requested-locale translation join when the
    /// collection has localized fields.
    pub(crate) fn base_select(&self, locale: &str) -> Select {
        let table = self.collection.table_name();
        let mut select = Select::from(table);
        if let Some(i18n) = self.collection.translation_table_name() {
            select = select.join(Join::left(
                i18n,
                TRANSLATION_ALIAS,
                vec![
                    JoinOn::Columns(
                        ColumnRef::qualified(TRANSLATION_ALIAS, schema::PARENT_ID),
                        ColumnRef::qualified(table, schema::ID),
                    ),
                    JoinOn::Literal(
                        ColumnRef::qualified(TRANSLATION_ALIAS, schema::LOCALE),
                        Value::from(locale),
                    ),
                ],
            ));
        }
        select
    }

    /// Read projection: id, declared fields through the scope's locale
    /// resolution, engine timestamps, virtuals, and the `_title` column.
    pub(crate) fn projection(
        &self,
        scope: &ExprScope<'_>,
        select: Option<&BTreeMap<String, bool>>,
    ) -> Vec<SelectColumn> {
        let table = self.collection.table_name();
        let include = |name: &str| -> bool {
            match select {
                None => true,
                Some(map) => {
                    let allow_list = map.values().any(|v| *v);
                    match map.get(name) {
                        Some(flag) => *flag,
                        None => !allow_list,
                    }
                }
            }
        };

        let mut columns = vec![SelectColumn::new(
            schema::ID,
            Expr::qualified(table, schema::ID),
        )];
        for field in &self.collection.fields {
            if include(&field.name) {
                columns.push(SelectColumn::new(field.name.clone(), scope.column(&field.name)));
            }
        }
        if self.collection.timestamps() {
            for meta in [schema::CREATED_AT, schema::UPDATED_AT] {
                if include(meta) {
                    columns.push(SelectColumn::new(meta, Expr::qualified(table, meta)));
                }
            }
        }
        if self.collection.soft_delete() && include(schema::DELETED_AT) {
            columns.push(SelectColumn::new(
                schema::DELETED_AT,
                Expr::qualified(table, schema::DELETED_AT),
            ));
        }
        for (name, expr_fn) in &self.collection.virtuals {
            if include(name) {
                columns.push(SelectColumn::new(name.clone(), expr_fn(scope)));
            }
        }
        if let Some(title) = &self.collection.title {
            if include(schema::TITLE) {
                columns.push(SelectColumn::new(schema::TITLE, title(scope)));
            }
        }
        columns
    }

    /// Raw projection of the primary table, used where physical state is
    /// needed instead of locale-resolved values.
    pub(crate) fn plain_projection(&self) -> Vec<SelectColumn> {
        let table = self.collection.table_name();
        self.collection
            .tables
            .primary
            .columns
            .iter()
            .map(|c| SelectColumn::new(c.name.clone(), Expr::qualified(table, &c.name)))
            .collect()
    }

    /// Loads the primary-table row for a record inside a transaction.
    pub(crate) fn load_plain_in_tx(
        &self,
        tx: &mut dyn DriverTransaction,
        id: &Value,
        ctx: &OperationContext,
    ) -> Result<Option<Row>> {
        let filter = Filter::merge(
            Some(Filter::eq(schema::ID, id.clone())),
            self.visibility_filter(ctx),
        );
        let stmt = Select::from(self.collection.table_name())
            .columns(self.plain_projection())
            .with_filter_opt(filter)
            .with_limit(1);
        Ok(tx.select(&stmt)?.into_iter().next())
    }

    /// Current translation rows for a record, keyed by locale.
    pub(crate) fn load_translations_in_tx(
        &self,
        tx: &mut dyn DriverTransaction,
        id: &Value,
    ) -> Result<BTreeMap<String, Row>> {
        let Some(def) = self.collection.tables.translation.as_ref() else {
            return Ok(BTreeMap::new());
        };
        let columns: Vec<SelectColumn> = def
            .columns
            .iter()
            .map(|c| SelectColumn::column(c.name.clone()))
            .collect();
        let stmt = Select::from(&def.name)
            .columns(columns)
            .with_filter(Filter::eq(schema::PARENT_ID, id.clone()));
        let mut out = BTreeMap::new();
        for row in tx.select(&stmt)? {
            let Value::String(locale) = row.value(schema::LOCALE) else {
                continue;
            };
            let mut values = Row::new();
            for field in self.collection.localized_fields() {
                values.set(field.name.clone(), row.value(&field.name));
            }
            out.insert(locale, values);
        }
        Ok(out)
    }

    /// Upserts one locale's translation row for a record.
    pub(crate) fn upsert_translation(
        &self,
        tx: &mut dyn DriverTransaction,
        id: &Value,
        locale: &str,
        values: &Row,
    ) -> Result<()> {
        let Some(table) = self.collection.translation_table_name() else {
            return Ok(());
        };
        let mut row = Row::new();
        row.set(schema::ID, util::new_id());
        row.set(schema::PARENT_ID, id.clone());
        row.set(schema::LOCALE, locale);
        for (column, value) in values.iter() {
            row.set(column.clone(), value.clone());
        }
        let update_columns: Vec<String> = values.columns().cloned().collect();
        let stmt = Insert::new(table, vec![row]).with_on_conflict(OnConflict {
            target: vec![schema::PARENT_ID.to_string(), schema::LOCALE.to_string()],
            action: ConflictAction::DoUpdate(update_columns),
        });
        tx.insert(&stmt)?;
        Ok(())
    }

    /// Per-field locale resolution over loaded translation rows, mirroring
    /// the query-time coalesce.
    pub(crate) fn merged_localized(
        &self,
        translations: &BTreeMap<String, Row>,
        locale: &str,
        default_locale: &str,
    ) -> Row {
        let mut out = Row::new();
        for field in self.collection.localized_fields() {
            let mut value = translations
                .get(locale)
                .map(|r| r.value(&field.name))
                .unwrap_or(Value::Null);
            if value.is_null() && locale != default_locale {
                value = translations
                    .get(default_locale)
                    .map(|r| r.value(&field.name))
                    .unwrap_or(Value::Null);
            }
            out.set(field.name.clone(), value);
        }
        out
    }

    /// Builds the outward record for a written row: physical state plus
    /// localized values, with virtuals and `_title` computed in raw mode.
    pub(crate) fn assemble(&self, plain: Row, localized: Row) -> Result<Record> {
        let mut fields = plain;
        fields.merge(&localized);
        let scope = ExprScope::raw(&self.collection);
        let mut computed: Vec<(String, Value)> = Vec::new();
        for (name, expr_fn) in &self.collection.virtuals {
            computed.push((name.clone(), expr_fn(&scope).evaluate(&fields)?));
        }
        if let Some(title) = &self.collection.title {
            computed.push((schema::TITLE.to_string(), title(&scope).evaluate(&fields)?));
        }
        for (name, value) in computed {
            fields.set(name, value);
        }
        Ok(Record::new(fields))
    }

    /// Checks write data against the declared fields. On create, defaults
    /// are applied and required fields enforced; on update only explicit
    /// nulls on required fields are rejected.
    pub(crate) fn validate_input(&self, data: &mut Row, creating: bool) -> Result<()> {
        let columns: Vec<String> = data.columns().cloned().collect();
        for column in &columns {
            if self.collection.field(column).is_some() {
                continue;
            }
            let restore_marker =
                column == schema::DELETED_AT && self.collection.soft_delete() && !creating;
            if !restore_marker {
                return Err(Error::Validation(format!(
                    "unknown field {} on collection {}",
                    column, self.collection.name
                )));
            }
        }
        for field in &self.collection.fields {
            if creating && !data.contains(&field.name) {
                if let Some(default) = &field.default {
                    data.set(field.name.clone(), default.clone());
                }
            }
            let violates = if creating {
                field.required && data.value(&field.name).is_null()
            } else {
                field.required && data.contains(&field.name) && data.value(&field.name).is_null()
            };
            if violates {
                return Err(Error::Validation(format!(
                    "field {} on collection {} is required",
                    field.name, self.collection.name
                )));
            }
        }
        Ok(())
    }

    /// Post-commit search indexing. Failures never surface to the caller.
    pub(crate) fn notify_search_index(&self, record: &Record, locale: &str) {
        let Some(searchable) = &self.collection.searchable else {
            return;
        };
        if searchable.manual {
            return;
        }
        let record_id = match record.id() {
            Value::String(s) => s,
            other => {
                tracing::warn!(collection = %self.collection.name, id = ?other, "skipping search indexing of record without string id");
                return;
            }
        };
        let title = match record.get(schema::TITLE) {
            Value::String(s) => Some(s),
            _ => None,
        };
        let request = SearchIndexRequest {
            collection: self.collection.name.clone(),
            record_id,
            locale: locale.to_string(),
            title,
            content: searchable.content.as_ref().and_then(|f| f(record)),
            metadata: searchable.metadata.as_ref().and_then(|f| f(record)),
            embedding: searchable.embedding.as_ref().and_then(|f| f(record)),
        };
        if let Err(error) = self.search.index(request) {
            tracing::warn!(
                collection = %self.collection.name,
                %error,
                "search indexing failed"
            );
        }
    }

    pub(crate) fn notify_search_remove(&self, id: &Value) {
        let Some(searchable) = &self.collection.searchable else {
            return;
        };
        if searchable.manual {
            return;
        }
        let Value::String(record_id) = id.clone() else {
            return;
        };
        let request = SearchRemoveRequest {
            collection: self.collection.name.clone(),
            record_id,
            locale: None,
        };
        if let Err(error) = self.search.remove(request) {
            tracing::warn!(
                collection = %self.collection.name,
                %error,
                "search removal failed"
            );
        }
    }
}

/// Context used for engine-internal work spawned by a user operation:
/// cascades, junction upkeep, and version reads.
pub(crate) fn system_ctx(ctx: &OperationContext) -> OperationContext {
    OperationContext {
        access_mode: AccessMode::System,
        include_deleted: true,
        ..ctx.clone()
    }
}

/// Runs `f` inside a transaction, committing on success and rolling back
/// on error.
pub(crate) fn with_tx<T>(
    driver: &dyn Driver,
    f: impl for<'t> FnOnce(&mut (dyn DriverTransaction + 't)) -> Result<T>,
) -> Result<T> {
    let mut tx = driver.begin()?;
    match f(tx.as_mut()) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(error) => {
            let _ = tx.rollback();
            Err(error)
        }
    }
}
