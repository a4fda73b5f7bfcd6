//! Version history bookkeeping.
//!
//! Every committed write on a versioned collection appends a snapshot row
//! inside the same transaction as the write. Version numbers are monotonic
//! per record starting at 1; reverting appends a new version rather than
//! rewinding the counter.

use std::collections::BTreeMap;

use plinth_sql::{
    AggregateFunc, Delete, Driver, DriverTransaction, Expr, Filter, Insert, Row, Select,
    SelectColumn, TableDef, Value,
};

use crate::collection::Collection;
use crate::context::Operation;
use crate::error::{Error, Result};
use crate::schema;
use crate::util;

/// Picks one version of a record.
#[derive(Clone, Debug, PartialEq)]
pub enum VersionSelector {
    /// By per-record version number.
    Number(i64),
    /// By version row id.
    Id(Value),
}

/// One entry of a record's history.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionEntry {
    pub id: Value,
    pub record_id: Value,
    pub version: i64,
    pub operation: Operation,
    pub created_by: Value,
    pub created_at: i64,
    /// Non-localized field state at snapshot time.
    pub snapshot: Row,
    /// Localized state per locale at snapshot time.
    pub translations: BTreeMap<String, Row>,
}

/// Writes and reads version history for versioned collections.
pub struct VersionManager;

impl VersionManager {
    /// Appends a snapshot of the record's current state. Returns the new
    /// version number, or 0 when the collection keeps no history.
    pub fn snapshot(
        tx: &mut dyn DriverTransaction,
        collection: &Collection,
        record_id: &Value,
        operation: Operation,
        created_by: Option<&Value>,
        state: &Row,
        translations: &[(String, Row)],
    ) -> Result<i64> {
        let Some(table) = collection.versions_table_name() else {
            return Ok(0);
        };
        let table = table.to_string();

        let next = Self::next_version(tx, &table, record_id)?;

        let mut row = Row::new();
        row.set(schema::ID, util::new_id());
        row.set(schema::RECORD_ID, record_id.clone());
        row.set(schema::VERSION, next);
        row.set(schema::OPERATION, operation.as_str());
        row.set(
            schema::CREATED_BY,
            created_by.cloned().unwrap_or(Value::Null),
        );
        row.set(schema::CREATED_AT, util::now());
        for field in collection.plain_fields() {
            row.set(field.name.clone(), state.value(&field.name));
        }
        if collection.soft_delete() {
            row.set(schema::DELETED_AT, state.value(schema::DELETED_AT));
        }
        tx.insert(&Insert::new(&table, vec![row]))?;

        if let Some(i18n_table) = collection.translation_versions_table_name() {
            let mut rows = Vec::new();
            for (locale, values) in translations {
                let mut row = Row::new();
                row.set(schema::ID, util::new_id());
                row.set(schema::RECORD_ID, record_id.clone());
                row.set(schema::VERSION, next);
                row.set(schema::LOCALE, locale.clone());
                for field in collection.localized_fields() {
                    row.set(field.name.clone(), values.value(&field.name));
                }
                rows.push(row);
            }
            if !rows.is_empty() {
                tx.insert(&Insert::new(i18n_table, rows))?;
            }
        }

        if let Some(max) = collection
            .options
            .versions
            .as_ref()
            .and_then(|v| v.max_versions)
        {
            Self::prune(tx, collection, &table, record_id, max as usize)?;
        }

        Ok(next)
    }

    fn next_version(
        tx: &mut dyn DriverTransaction,
        table: &str,
        record_id: &Value,
    ) -> Result<i64> {
        let stmt = Select::from(table)
            .column(SelectColumn::new(
                "max_version",
                Expr::aggregate(AggregateFunc::Max, schema::VERSION),
            ))
            .with_filter(Filter::eq(schema::RECORD_ID, record_id.clone()));
        let rows = tx.select(&stmt)?;
        let current = rows
            .first()
            .and_then(|r| r.value("max_version").as_i64())
            .unwrap_or(0);
        Ok(current + 1)
    }

    /// Drops the oldest versions past the retention cap.
    fn prune(
        tx: &mut dyn DriverTransaction,
        collection: &Collection,
        table: &str,
        record_id: &Value,
        max: usize,
    ) -> Result<()> {
        let stmt = Select::from(table)
            .column(SelectColumn::column(schema::VERSION))
            .with_filter(Filter::eq(schema::RECORD_ID, record_id.clone()))
            .order(plinth_sql::OrderSpec::asc(schema::VERSION));
        let versions: Vec<i64> = tx
            .select(&stmt)?
            .iter()
            .filter_map(|r| r.value(schema::VERSION).as_i64())
            .collect();
        let excess = versions.len().saturating_sub(max);
        if excess == 0 {
            return Ok(());
        }
        let cutoff = versions[excess];
        let filter = Filter::and(vec![
            Filter::eq(schema::RECORD_ID, record_id.clone()),
            Filter::lt(schema::VERSION, cutoff),
        ]);
        tx.delete(&Delete::from(table).with_filter(filter.clone()))?;
        if let Some(i18n_table) = collection.translation_versions_table_name() {
            tx.delete(&Delete::from(i18n_table).with_filter(filter))?;
        }
        Ok(())
    }

    /// Lists a record's history, oldest first.
    pub fn find_versions(
        driver: &dyn Driver,
        collection: &Collection,
        record_id: &Value,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<VersionEntry>> {
        let (table_def, _) = Self::tables(collection)?;
        let mut stmt = Select::from(&table_def.name)
            .columns(Self::projection(table_def))
            .with_filter(Filter::eq(schema::RECORD_ID, record_id.clone()))
            .order(plinth_sql::OrderSpec::asc(schema::VERSION));
        if let Some(limit) = limit {
            stmt = stmt.with_limit(limit);
        }
        if let Some(offset) = offset {
            stmt = stmt.with_offset(offset);
        }
        let rows = driver.select(&stmt)?;
        let translations = Self::load_translations(driver, collection, record_id, None)?;
        rows.into_iter()
            .map(|row| Self::entry_from_row(collection, row, &translations))
            .collect()
    }

    /// Loads one version of a record's history.
    pub fn find_version(
        driver: &dyn Driver,
        collection: &Collection,
        record_id: &Value,
        selector: &VersionSelector,
    ) -> Result<VersionEntry> {
        let (table_def, _) = Self::tables(collection)?;
        let select_filter = match selector {
            VersionSelector::Number(n) => Filter::eq(schema::VERSION, *n),
            VersionSelector::Id(id) => Filter::eq(schema::ID, id.clone()),
        };
        let stmt = Select::from(&table_def.name)
            .columns(Self::projection(table_def))
            .with_filter(Filter::and(vec![
                Filter::eq(schema::RECORD_ID, record_id.clone()),
                select_filter,
            ]))
            .with_limit(1);
        let row = driver
            .select(&stmt)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "version of {} record {:?}",
                    collection.name, record_id
                ))
            })?;
        let version = row.value(schema::VERSION).as_i64().unwrap_or(0);
        let translations =
            Self::load_translations(driver, collection, record_id, Some(version))?;
        Self::entry_from_row(collection, row, &translations)
    }

    fn tables(collection: &Collection) -> Result<(&TableDef, Option<&TableDef>)> {
        let versions = collection.tables.versions.as_ref().ok_or_else(|| {
            Error::Validation(format!(
                "collection {} does not keep version history",
                collection.name
            ))
        })?;
        Ok((versions, collection.tables.translation_versions.as_ref()))
    }

    fn projection(def: &TableDef) -> Vec<SelectColumn> {
        def.columns
            .iter()
            .map(|c| SelectColumn::column(c.name.clone()))
            .collect()
    }

    /// Translation snapshots keyed by (version, locale), optionally for a
    /// single version.
    fn load_translations(
        driver: &dyn Driver,
        collection: &Collection,
        record_id: &Value,
        version: Option<i64>,
    ) -> Result<BTreeMap<(i64, String), Row>> {
        let Some(def) = collection.tables.translation_versions.as_ref() else {
            return Ok(BTreeMap::new());
        };
        let mut filter = Filter::eq(schema::RECORD_ID, record_id.clone());
        if let Some(version) = version {
            filter = Filter::and(vec![filter, Filter::eq(schema::VERSION, version)]);
        }
        let stmt = Select::from(&def.name)
            .columns(Self::projection(def))
            .with_filter(filter);
        let mut out = BTreeMap::new();
        for row in driver.select(&stmt)? {
            let version = row.value(schema::VERSION).as_i64().unwrap_or(0);
            let locale = match row.value(schema::LOCALE) {
                Value::String(s) => s,
                _ => continue,
            };
            let mut values = Row::new();
            for field in collection.localized_fields() {
                values.set(field.name.clone(), row.value(&field.name));
            }
            out.insert((version, locale), values);
        }
        Ok(out)
    }

    fn entry_from_row(
        collection: &Collection,
        row: Row,
        translations: &BTreeMap<(i64, String), Row>,
    ) -> Result<VersionEntry> {
        let version = row.value(schema::VERSION).as_i64().unwrap_or(0);
        let operation_str = row.value(schema::OPERATION);
        let operation = operation_str
            .as_str()
            .and_then(Operation::parse)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "corrupt version row for {}: bad operation {:?}",
                    collection.name, operation_str
                ))
            })?;
        let mut snapshot = Row::new();
        for field in collection.plain_fields() {
            snapshot.set(field.name.clone(), row.value(&field.name));
        }
        if collection.soft_delete() {
            snapshot.set(schema::DELETED_AT, row.value(schema::DELETED_AT));
        }
        let entry_translations = translations
            .iter()
            .filter(|((v, _), _)| *v == version)
            .map(|((_, locale), values)| (locale.clone(), values.clone()))
            .collect();
        Ok(VersionEntry {
            id: row.value(schema::ID),
            record_id: row.value(schema::RECORD_ID),
            version,
            operation,
            created_by: row.value(schema::CREATED_BY),
            created_at: row.value(schema::CREATED_AT).as_timestamp().unwrap_or(0),
            snapshot,
            translations: entry_translations,
        })
    }
}
