//! Write operations: create, update, bulk update, restore.

use std::collections::BTreeMap;

use plinth_sql::{Filter, Insert, Row, Select, SelectColumn, Update, Value};

use crate::access::AccessEnforcer;
use crate::context::{Operation, OperationContext};
use crate::error::{Error, Result};
use crate::hooks::HookStage;
use crate::record::Record;
use crate::relation::Relation;
use crate::schema;
use crate::util;
use crate::version::VersionManager;

use super::{
    system_ctx, with_tx, CreateInput, Crud, RelationWrite, UpdateInput, MAX_WRITE_DEPTH,
};

use plinth_sql::DriverTransaction;

impl Crud {
    /// Creates a record. Access check, before-hooks, validation, nested
    /// relation writes, version snapshot, and after-hooks run in one
    /// transaction; search indexing happens after commit.
    pub fn create(&self, input: CreateInput, ctx: &OperationContext) -> Result<Record> {
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();
        let record = with_tx(driver.as_ref(), |tx| self.create_in_tx(tx, input, ctx, 0))?;
        self.notify_search_index(&record, &locale);
        Ok(record)
    }

    pub(crate) fn create_in_tx(
        &self,
        tx: &mut dyn DriverTransaction,
        input: CreateInput,
        ctx: &OperationContext,
        depth: u32,
    ) -> Result<Record> {
        if depth > MAX_WRITE_DEPTH {
            return Err(Error::Validation(format!(
                "nested write depth exceeded on collection {}",
                self.collection.name
            )));
        }
        let locale = self.locale(ctx).to_string();
        let default_locale = self.default_locale(ctx).to_string();
        let mut data = input.data;

        let decision = self.access_decision(Operation::Create, ctx, None, Some(&data), None)?;
        AccessEnforcer::check_row(&decision, &data)?;

        let (to_one, to_many) = self.split_relation_writes(input.relations)?;

        for stage in [HookStage::BeforeOperation, HookStage::BeforeValidate] {
            self.run_hooks(stage, Operation::Create, ctx, &locale, &mut data, None, None)?;
        }
        self.validate_input(&mut data, true)?;
        self.run_hooks(
            HookStage::BeforeChange,
            Operation::Create,
            ctx,
            &locale,
            &mut data,
            None,
            None,
        )?;

        // To-one links resolve first so the foreign key lands in the insert.
        for (relation, write) in to_one {
            let key = self.resolve_to_one_write(tx, &relation, write, ctx, depth)?;
            if let Relation::BelongsTo { fk_column, .. } = &relation {
                data.set(fk_column.clone(), key);
            }
        }

        let id = Value::from(util::new_id());
        let (mut plain, localized) = self.collection.split_localized(&data);
        plain.set(schema::ID, id.clone());
        if self.collection.timestamps() {
            let now = util::now();
            plain.set(schema::CREATED_AT, now.clone());
            plain.set(schema::UPDATED_AT, now);
        }
        if self.collection.soft_delete() {
            plain.set(schema::DELETED_AT, Value::Null);
        }
        tx.insert(&Insert::new(self.collection.table_name(), vec![plain.clone()]))?;
        if !localized.is_empty() {
            self.upsert_translation(tx, &id, &locale, &localized)?;
        }

        for (_, relation, write) in to_many {
            self.apply_to_many_write(tx, &plain, &relation, write, ctx, depth)?;
        }

        VersionManager::snapshot(
            tx,
            &self.collection,
            &id,
            Operation::Create,
            ctx.user_id(),
            &plain,
            &[(locale.clone(), localized.clone())],
        )?;

        let mut translations = BTreeMap::new();
        translations.insert(locale.clone(), localized);
        let merged = self.merged_localized(&translations, &locale, &default_locale);
        let mut record = self.assemble(plain, merged)?;
        self.run_hooks(
            HookStage::AfterChange,
            Operation::Create,
            ctx,
            &locale,
            &mut record.fields,
            None,
            Some(&id),
        )?;
        self.run_hooks(
            HookStage::AfterRead,
            Operation::Create,
            ctx,
            &locale,
            &mut record.fields,
            None,
            Some(&id),
        )?;
        Ok(record)
    }

    /// Updates one record by id and returns its new state.
    pub fn update_by_id(
        &self,
        id: &Value,
        input: UpdateInput,
        ctx: &OperationContext,
    ) -> Result<Record> {
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();
        let record = with_tx(driver.as_ref(), |tx| {
            self.update_in_tx(tx, id, input, Operation::Update, ctx, 0)
        })?;
        self.notify_search_index(&record, &locale);
        Ok(record)
    }

    /// Single-record update pipeline, shared by updateById, restore, and
    /// revert (which differ in the recorded operation kind).
    pub(crate) fn update_in_tx(
        &self,
        tx: &mut dyn DriverTransaction,
        id: &Value,
        input: UpdateInput,
        operation: Operation,
        ctx: &OperationContext,
        depth: u32,
    ) -> Result<Record> {
        if depth > MAX_WRITE_DEPTH {
            return Err(Error::Validation(format!(
                "nested write depth exceeded on collection {}",
                self.collection.name
            )));
        }
        let locale = self.locale(ctx).to_string();
        let default_locale = self.default_locale(ctx).to_string();

        let original = self
            .load_plain_in_tx(tx, id, ctx)?
            .ok_or_else(|| Error::NotFound(format!("{} record {:?}", self.collection.name, id)))?;
        let decision = self.access_decision(operation, ctx, Some(&original), Some(&input.data), None)?;
        AccessEnforcer::check_row(&decision, &original)?;

        let mut data = input.data;
        let (to_one, to_many) = self.split_relation_writes(input.relations)?;

        for stage in [HookStage::BeforeOperation, HookStage::BeforeValidate] {
            self.run_hooks(stage, operation, ctx, &locale, &mut data, Some(&original), Some(id))?;
        }
        self.validate_input(&mut data, false)?;
        self.run_hooks(
            HookStage::BeforeChange,
            operation,
            ctx,
            &locale,
            &mut data,
            Some(&original),
            Some(id),
        )?;

        for (relation, write) in to_one {
            let key = self.resolve_to_one_write(tx, &relation, write, ctx, depth)?;
            if let Relation::BelongsTo { fk_column, .. } = &relation {
                data.set(fk_column.clone(), key);
            }
        }

        let (plain_changes, localized_changes) = self.collection.split_localized(&data);
        let mut new_plain = original.clone();
        new_plain.merge(&plain_changes);

        let mut stmt = Update::table(self.collection.table_name())
            .with_filter(Filter::eq(schema::ID, id.clone()));
        for (column, value) in plain_changes.iter() {
            stmt = stmt.set(column.clone(), value.clone());
        }
        if self.collection.timestamps() {
            let now = util::now();
            new_plain.set(schema::UPDATED_AT, now.clone());
            stmt = stmt.set(schema::UPDATED_AT, now);
        }
        if !stmt.set.is_empty() {
            tx.update(&stmt)?;
        }

        let mut translations = self.load_translations_in_tx(tx, id)?;
        if !localized_changes.is_empty() {
            self.upsert_translation(tx, id, &locale, &localized_changes)?;
            let entry = translations.entry(locale.clone()).or_default();
            entry.merge(&localized_changes);
        }

        for (_, relation, write) in to_many {
            self.apply_to_many_write(tx, &new_plain, &relation, write, ctx, depth)?;
        }

        let snapshot_translations: Vec<(String, Row)> = translations
            .iter()
            .map(|(l, r)| (l.clone(), r.clone()))
            .collect();
        VersionManager::snapshot(
            tx,
            &self.collection,
            id,
            operation,
            ctx.user_id(),
            &new_plain,
            &snapshot_translations,
        )?;

        let merged = self.merged_localized(&translations, &locale, &default_locale);
        let mut record = self.assemble(new_plain, merged)?;
        self.run_hooks(
            HookStage::AfterChange,
            operation,
            ctx,
            &locale,
            &mut record.fields,
            Some(&original),
            Some(id),
        )?;
        self.run_hooks(
            HookStage::AfterRead,
            operation,
            ctx,
            &locale,
            &mut record.fields,
            None,
            Some(id),
        )?;
        Ok(record)
    }

    /// Bulk update: before-hooks run once per matched row, then a single
    /// batched UPDATE covers all matched ids; version snapshots are still
    /// per row. After-hooks and search indexing run per row after commit.
    pub fn update(
        &self,
        filter: Option<Filter>,
        data: Row,
        ctx: &OperationContext,
    ) -> Result<Vec<Record>> {
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();
        let default_locale = self.default_locale(ctx).to_string();

        let decision = self.access_decision(Operation::Update, ctx, None, Some(&data), Some(driver.as_ref()))?;
        let access_filter = AccessEnforcer::query_filter(decision)?;
        let combined = Filter::merge(filter, Filter::merge(access_filter, self.visibility_filter(ctx)));

        let mut shared = data;
        let results = with_tx(driver.as_ref(), |tx| {
            let matched = self.select_plain_rows_in_tx(tx, combined, &locale)?;
            if matched.is_empty() {
                return Ok(Vec::new());
            }
            // Predicate rules see each matched row; the filter merge above
            // only narrows the match set.
            for row in &matched {
                let decision =
                    self.access_decision(Operation::Update, ctx, Some(row), Some(&shared), None)?;
                AccessEnforcer::check_row(&decision, row)?;
            }

            for row in &matched {
                let id = row.value(schema::ID);
                for stage in [
                    HookStage::BeforeOperation,
                    HookStage::BeforeValidate,
                    HookStage::BeforeChange,
                ] {
                    self.run_hooks(stage, Operation::Update, ctx, &locale, &mut shared, Some(row), Some(&id))?;
                }
            }
            self.validate_input(&mut shared, false)?;
            let (plain_changes, localized_changes) = self.collection.split_localized(&shared);
            let ids: Vec<Value> = matched.iter().map(|r| r.value(schema::ID)).collect();

            let now = util::now();
            let mut stmt = Update::table(self.collection.table_name())
                .with_filter(Filter::is_in(schema::ID, ids.clone()));
            for (column, value) in plain_changes.iter() {
                stmt = stmt.set(column.clone(), value.clone());
            }
            if self.collection.timestamps() {
                stmt = stmt.set(schema::UPDATED_AT, now.clone());
            }
            if !stmt.set.is_empty() {
                tx.update(&stmt)?;
            }

            if !localized_changes.is_empty() {
                for id in &ids {
                    self.upsert_translation(tx, id, &locale, &localized_changes)?;
                }
            }

            let mut out = Vec::with_capacity(matched.len());
            for row in &matched {
                let id = row.value(schema::ID);
                let mut new_plain = row.clone();
                new_plain.merge(&plain_changes);
                if self.collection.timestamps() {
                    new_plain.set(schema::UPDATED_AT, now.clone());
                }
                let translations = self.load_translations_in_tx(tx, &id)?;
                let snapshot_translations: Vec<(String, Row)> = translations
                    .iter()
                    .map(|(l, r)| (l.clone(), r.clone()))
                    .collect();
                VersionManager::snapshot(
                    tx,
                    &self.collection,
                    &id,
                    Operation::Update,
                    ctx.user_id(),
                    &new_plain,
                    &snapshot_translations,
                )?;
                let merged = self.merged_localized(&translations, &locale, &default_locale);
                out.push((self.assemble(new_plain, merged)?, row.clone()));
            }
            Ok(out)
        })?;

        let mut records = Vec::with_capacity(results.len());
        for (mut record, original) in results {
            let id = record.id();
            self.run_hooks(
                HookStage::AfterChange,
                Operation::Update,
                ctx,
                &locale,
                &mut record.fields,
                Some(&original),
                Some(&id),
            )?;
            self.run_hooks(
                HookStage::AfterRead,
                Operation::Update,
                ctx,
                &locale,
                &mut record.fields,
                None,
                Some(&id),
            )?;
            self.notify_search_index(&record, &locale);
            records.push(record);
        }
        Ok(records)
    }

    /// Clears the delete marker on a soft-deleted record through the
    /// update pipeline. Restoring a live record is a no-op.
    pub fn restore_by_id(&self, id: &Value, ctx: &OperationContext) -> Result<Record> {
        if !self.collection.soft_delete() {
            return Err(Error::Validation(format!(
                "collection {} does not soft-delete",
                self.collection.name
            )));
        }
        let driver = self.driver(ctx);
        let locale = self.locale(ctx).to_string();
        let default_locale = self.default_locale(ctx).to_string();
        let ctx_all = ctx.clone().with_include_deleted(true);

        let record = with_tx(driver.as_ref(), |tx| {
            let original = self
                .load_plain_in_tx(tx, id, &ctx_all)?
                .ok_or_else(|| Error::NotFound(format!("{} record {:?}", self.collection.name, id)))?;
            if original.value(schema::DELETED_AT).is_null() {
                let translations = self.load_translations_in_tx(tx, id)?;
                let merged = self.merged_localized(&translations, &locale, &default_locale);
                return self.assemble(original, merged);
            }
            let mut input = UpdateInput::new(Row::new());
            input.data.set(schema::DELETED_AT, Value::Null);
            self.update_in_tx(tx, id, input, Operation::Restore, &ctx_all, 0)
        })?;
        self.notify_search_index(&record, &locale);
        Ok(record)
    }

    /// Primary-table rows matching a constraint, with the translation
    /// join in place so the constraint may reference localized fields.
    pub(crate) fn select_plain_rows_in_tx(
        &self,
        tx: &mut dyn DriverTransaction,
        filter: Option<Filter>,
        locale: &str,
    ) -> Result<Vec<Row>> {
        let stmt = self
            .base_select(locale)
            .columns(self.plain_projection())
            .with_filter_opt(filter)
            .order(plinth_sql::OrderSpec::asc(schema::ID));
        Ok(tx.select(&stmt)?)
    }

    /// Splits nested relation writes into to-one resolutions (applied
    /// before the row write) and to-many applications (applied after).
    fn split_relation_writes(
        &self,
        relations: BTreeMap<String, RelationWrite>,
    ) -> Result<(
        Vec<(Relation, RelationWrite)>,
        Vec<(String, Relation, RelationWrite)>,
    )> {
        let mut to_one = Vec::new();
        let mut to_many = Vec::new();
        for (name, write) in relations {
            let relation = self.collection.relation(&name)?.clone();
            match &relation {
                Relation::BelongsTo { .. } => {
                    let entries = match &write {
                        RelationWrite::Connect(v) => v.len(),
                        RelationWrite::Create(v) => v.len(),
                        RelationWrite::ConnectOrCreate(v) => v.len(),
                    };
                    if entries != 1 {
                        return Err(Error::Validation(format!(
                            "relation {name} on {} takes exactly one nested entry",
                            self.collection.name
                        )));
                    }
                    to_one.push((relation, write));
                }
                Relation::HasMany { .. } | Relation::ManyToMany { .. } => {
                    to_many.push((name, relation, write));
                }
                Relation::Polymorphic { .. } => {
                    return Err(Error::Validation(format!(
                        "polymorphic relation {name} on {} cannot be written through nested operations",
                        self.collection.name
                    )));
                }
            }
        }
        Ok((to_one, to_many))
    }

    /// Resolves a to-one nested write to the foreign-key value.
    fn resolve_to_one_write(
        &self,
        tx: &mut dyn DriverTransaction,
        relation: &Relation,
        write: RelationWrite,
        ctx: &OperationContext,
        depth: u32,
    ) -> Result<Value> {
        let Relation::BelongsTo { target, references, .. } = relation else {
            return Err(Error::Validation(format!(
                "nested to-one write on a non-belongsTo relation of {}",
                self.collection.name
            )));
        };
        let target_crud = self.target(target)?;
        match write {
            RelationWrite::Connect(mut ids) => {
                let id = ids.pop().ok_or_else(|| {
                    Error::Validation(format!("empty connect on collection {target}"))
                })?;
                target_crud
                    .find_key_in_tx(tx, references, Filter::eq(schema::ID, id.clone()), ctx)?
                    .ok_or_else(|| Error::NotFound(format!("{target} record {id:?}")))
            }
            RelationWrite::Create(mut inputs) => {
                let input = inputs.pop().ok_or_else(|| {
                    Error::Validation(format!("empty nested create on collection {target}"))
                })?;
                let child = target_crud.create_in_tx(tx, input, ctx, depth + 1)?;
                Ok(child.get(references))
            }
            RelationWrite::ConnectOrCreate(mut items) => {
                let item = items.pop().ok_or_else(|| {
                    Error::Validation(format!("empty connectOrCreate on collection {target}"))
                })?;
                match target_crud.find_key_in_tx(tx, references, item.filter, ctx)? {
                    Some(key) => Ok(key),
                    None => {
                        let child = target_crud.create_in_tx(tx, item.create, ctx, depth + 1)?;
                        Ok(child.get(references))
                    }
                }
            }
        }
    }

    /// Applies a to-many nested write after the parent row exists.
    pub(crate) fn apply_to_many_write(
        &self,
        tx: &mut dyn DriverTransaction,
        parent: &Row,
        relation: &Relation,
        write: RelationWrite,
        ctx: &OperationContext,
        depth: u32,
    ) -> Result<()> {
        match relation {
            Relation::HasMany { target, via, .. } => {
                let target_crud = self.target(target)?;
                let inverse = target_crud.collection.relation(via)?.clone();
                let Relation::BelongsTo { fk_column, references, .. } = inverse else {
                    return Err(Error::InvalidDefinition(format!(
                        "relation {via} on {target} must be a belongsTo back-reference"
                    )));
                };
                let parent_key = parent.value(&references);
                match write {
                    RelationWrite::Connect(ids) => {
                        if ids.is_empty() {
                            return Ok(());
                        }
                        let expected = ids.len() as u64;
                        let affected = tx.update(
                            &Update::table(target_crud.collection.table_name())
                                .set(fk_column, parent_key)
                                .with_filter(Filter::is_in(schema::ID, ids)),
                        )?;
                        if affected != expected {
                            return Err(Error::NotFound(format!(
                                "{target} records to connect ({affected} of {expected} found)"
                            )));
                        }
                    }
                    RelationWrite::Create(inputs) => {
                        for mut input in inputs {
                            input.data.set(fk_column.clone(), parent_key.clone());
                            target_crud.create_in_tx(tx, input, ctx, depth + 1)?;
                        }
                    }
                    RelationWrite::ConnectOrCreate(items) => {
                        for item in items {
                            match target_crud.find_key_in_tx(tx, schema::ID, item.filter, ctx)? {
                                Some(child_id) => {
                                    tx.update(
                                        &Update::table(target_crud.collection.table_name())
                                            .set(fk_column.clone(), parent_key.clone())
                                            .with_filter(Filter::eq(schema::ID, child_id)),
                                    )?;
                                }
                                None => {
                                    let mut input = item.create;
                                    input.data.set(fk_column.clone(), parent_key.clone());
                                    target_crud.create_in_tx(tx, input, ctx, depth + 1)?;
                                }
                            }
                        }
                    }
                }
            }
            Relation::ManyToMany {
                target,
                junction,
                source_key,
                target_key,
                ..
            } => {
                let target_crud = self.target(target)?;
                let junction_crud = self.target(junction)?;
                let parent_id = parent.value(schema::ID);
                // Junction upkeep is engine-internal bookkeeping.
                let sys = system_ctx(ctx);
                let link = |tx: &mut dyn DriverTransaction, target_id: Value| -> Result<()> {
                    let mut row = Row::new();
                    row.set(source_key.clone(), parent_id.clone());
                    row.set(target_key.clone(), target_id);
                    junction_crud.create_in_tx(tx, CreateInput::new(row), &sys, depth + 1)?;
                    Ok(())
                };
                match write {
                    RelationWrite::Connect(ids) => {
                        for id in ids {
                            target_crud
                                .find_key_in_tx(tx, schema::ID, Filter::eq(schema::ID, id.clone()), ctx)?
                                .ok_or_else(|| Error::NotFound(format!("{target} record {id:?}")))?;
                            link(&mut *tx, id)?;
                        }
                    }
                    RelationWrite::Create(inputs) => {
                        for input in inputs {
                            let child = target_crud.create_in_tx(tx, input, ctx, depth + 1)?;
                            link(&mut *tx, child.id())?;
                        }
                    }
                    RelationWrite::ConnectOrCreate(items) => {
                        for item in items {
                            let id = match target_crud
                                .find_key_in_tx(tx, schema::ID, item.filter, ctx)?
                            {
                                Some(id) => id,
                                None => target_crud.create_in_tx(tx, item.create, ctx, depth + 1)?.id(),
                            };
                            link(&mut *tx, id)?;
                        }
                    }
                }
            }
            Relation::BelongsTo { .. } | Relation::Polymorphic { .. } => {
                return Err(Error::Validation(format!(
                    "to-many write applied to a to-one relation of {}",
                    self.collection.name
                )));
            }
        }
        Ok(())
    }

    /// First matching value of `column` on this collection's primary
    /// table, under the context's visibility.
    pub(crate) fn find_key_in_tx(
        &self,
        tx: &mut dyn DriverTransaction,
        column: &str,
        filter: Filter,
        ctx: &OperationContext,
    ) -> Result<Option<Value>> {
        let combined = Filter::merge(Some(filter), self.visibility_filter(ctx));
        let stmt = Select::from(self.collection.table_name())
            .column(SelectColumn::column(column))
            .with_filter_opt(combined)
            .with_limit(1);
        Ok(tx.select(&stmt)?.into_iter().next().map(|r| r.value(column)))
    }
}
