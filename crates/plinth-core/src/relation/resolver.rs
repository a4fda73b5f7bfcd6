//! Batched relation loading for query results.
//!
//! Each requested relation costs a constant number of statements per
//! level regardless of how many parent records are in flight: keys are
//! collected across the batch, children load in one query, and the
//! results are stitched back onto the parents.

use std::collections::{HashMap, HashSet};

use plinth_sql::{
    AggregateFunc, ColumnRef, Expr, Filter, Row, Select, SelectColumn, Value,
};

use crate::context::OperationContext;
use crate::crud::Crud;
use crate::error::{Error, Result};
use crate::record::{Record, Related, RelationAggregate};
use crate::schema;

use super::{AggregateSpec, Relation, WithMap, WithSpec};

/// Nested `with` levels allowed before a query is rejected.
pub const MAX_RESOLVE_DEPTH: u32 = 8;

/// Resolves every requested relation onto `records`.
pub(crate) fn resolve(
    crud: &Crud,
    records: &mut [Record],
    with: &WithMap,
    ctx: &OperationContext,
    depth: u32,
) -> Result<()> {
    if with.is_empty() || records.is_empty() {
        return Ok(());
    }
    if depth >= MAX_RESOLVE_DEPTH {
        return Err(Error::Validation(format!(
            "relation depth exceeded on collection {}",
            crud.collection.name
        )));
    }
    for (name, spec) in with {
        let relation = crud.collection.relation(name)?.clone();
        match &relation {
            Relation::BelongsTo { target, fk_column, references, .. } => {
                resolve_belongs_to(crud, records, name, target, fk_column, references, spec, ctx, depth)?;
            }
            Relation::HasMany { target, via, .. } => {
                resolve_has_many(crud, records, name, target, via, spec, ctx, depth)?;
            }
            Relation::ManyToMany { target, junction, source_key, target_key, .. } => {
                resolve_many_to_many(
                    crud, records, name, target, junction, source_key, target_key, spec, ctx, depth,
                )?;
            }
            Relation::Polymorphic { type_column, id_column, targets } => {
                resolve_polymorphic(crud, records, name, type_column, id_column, targets, spec, ctx, depth)?;
            }
        }
    }
    Ok(())
}

fn distinct_keys(values: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in values {
        if !value.is_null() && seen.insert(value.clone()) {
            out.push(value);
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn resolve_belongs_to(
    crud: &Crud,
    records: &mut [Record],
    name: &str,
    target: &str,
    fk_column: &str,
    references: &str,
    spec: &WithSpec,
    ctx: &OperationContext,
    depth: u32,
) -> Result<()> {
    let keys = distinct_keys(records.iter().map(|r| r.get(fk_column)));
    if keys.is_empty() {
        for record in records.iter_mut() {
            record.relations.insert(name.to_string(), Related::One(None));
        }
        return Ok(());
    }
    let target_crud = crud.target(target)?;
    let loaded = target_crud.select_docs(
        Some(Filter::is_in(references, keys)),
        &spec.with,
        ctx,
        depth + 1,
    )?;
    let by_key: HashMap<Value, Record> =
        loaded.into_iter().map(|r| (r.get(references), r)).collect();
    for record in records.iter_mut() {
        let key = record.get(fk_column);
        let related = (!key.is_null())
            .then(|| by_key.get(&key).cloned().map(Box::new))
            .flatten();
        record.relations.insert(name.to_string(), Related::One(related));
    }
    Ok(())
}

/// Foreign-key and referenced columns of the belongs-to back-reference
/// a has-many points at.
fn inverse_columns(target_crud: &Crud, target: &str, via: &str) -> Result<(String, String)> {
    match target_crud.collection.relation(via)? {
        Relation::BelongsTo { fk_column, references, .. } => {
            Ok((fk_column.clone(), references.clone()))
        }
        _ => Err(Error::InvalidDefinition(format!(
            "relation {via} on {target} must be a belongsTo back-reference"
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_has_many(
    crud: &Crud,
    records: &mut [Record],
    name: &str,
    target: &str,
    via: &str,
    spec: &WithSpec,
    ctx: &OperationContext,
    depth: u32,
) -> Result<()> {
    let target_crud = crud.target(target)?;
    let (fk_column, references) = inverse_columns(&target_crud, target, via)?;
    let keys = distinct_keys(records.iter().map(|r| r.get(&references)));

    if spec.wants_aggregate() {
        let aggregate = spec.aggregate.clone().unwrap_or_default();
        let mut by_key = if keys.is_empty() {
            HashMap::new()
        } else {
            grouped_aggregates(&target_crud, &fk_column, keys, &aggregate, ctx)?
        };
        for record in records.iter_mut() {
            let rollup = by_key.remove(&record.get(&references)).unwrap_or_default();
            record
                .relations
                .insert(name.to_string(), Related::Aggregate(rollup));
        }
        return Ok(());
    }

    let loaded = if keys.is_empty() {
        Vec::new()
    } else {
        target_crud.select_docs(
            Some(Filter::is_in(&fk_column, keys)),
            &spec.with,
            ctx,
            depth + 1,
        )?
    };
    let mut grouped: HashMap<Value, Vec<Record>> = HashMap::new();
    for child in loaded {
        grouped.entry(child.get(&fk_column)).or_default().push(child);
    }
    for record in records.iter_mut() {
        let children = grouped
            .get(&record.get(&references))
            .cloned()
            .unwrap_or_default();
        record
            .relations
            .insert(name.to_string(), Related::Many(children));
    }
    Ok(())
}

/// One grouped statement computing count and rollups per parent key.
fn grouped_aggregates(
    target_crud: &Crud,
    fk_column: &str,
    keys: Vec<Value>,
    aggregate: &AggregateSpec,
    ctx: &OperationContext,
) -> Result<HashMap<Value, RelationAggregate>> {
    let mut projection = vec![
        SelectColumn::new("key", Expr::column(fk_column)),
        SelectColumn::new("count", Expr::count()),
    ];
    let specs = [
        (AggregateFunc::Sum, "sum", &aggregate.sum),
        (AggregateFunc::Avg, "avg", &aggregate.avg),
        (AggregateFunc::Min, "min", &aggregate.min),
        (AggregateFunc::Max, "max", &aggregate.max),
    ];
    for (func, prefix, columns) in &specs {
        for column in columns.iter() {
            projection.push(SelectColumn::new(
                format!("{prefix}_{column}"),
                Expr::aggregate(*func, column.clone()),
            ));
        }
    }
    let filter = Filter::merge(
        Some(Filter::is_in(fk_column, keys)),
        target_crud.visibility_filter(ctx),
    );
    let stmt = Select::from(target_crud.collection.table_name())
        .columns(projection)
        .with_filter_opt(filter)
        .group(vec![ColumnRef::bare(fk_column)]);
    let rows = target_crud.driver(ctx).select(&stmt)?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let mut rollup = RelationAggregate {
            count: row.value("count").as_i64().unwrap_or(0),
            ..RelationAggregate::default()
        };
        for (_, prefix, columns) in &specs {
            for column in columns.iter() {
                let value = row.value(&format!("{prefix}_{column}"));
                let bucket = match *prefix {
                    "sum" => &mut rollup.sum,
                    "avg" => &mut rollup.avg,
                    "min" => &mut rollup.min,
                    _ => &mut rollup.max,
                };
                bucket.insert(column.clone(), value);
            }
        }
        out.insert(row.value("key"), rollup);
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn resolve_many_to_many(
    crud: &Crud,
    records: &mut [Record],
    name: &str,
    target: &str,
    junction: &str,
    source_key: &str,
    target_key: &str,
    spec: &WithSpec,
    ctx: &OperationContext,
    depth: u32,
) -> Result<()> {
    let target_crud = crud.target(target)?;
    let junction_crud = crud.target(junction)?;
    let root_ids = distinct_keys(records.iter().map(Record::id));

    let links: Vec<Row> = if root_ids.is_empty() {
        Vec::new()
    } else {
        let filter = Filter::merge(
            Some(Filter::is_in(source_key, root_ids)),
            junction_crud.visibility_filter(ctx),
        );
        let stmt = Select::from(junction_crud.collection.table_name())
            .column(SelectColumn::column(source_key))
            .column(SelectColumn::column(target_key))
            .with_filter_opt(filter);
        crud.driver(ctx).select(&stmt)?
    };

    let target_ids = distinct_keys(links.iter().map(|l| l.value(target_key)));
    let nested = if spec.wants_aggregate() { WithMap::new() } else { spec.with.clone() };
    let loaded = if target_ids.is_empty() {
        Vec::new()
    } else {
        target_crud.select_docs(
            Some(Filter::is_in(schema::ID, target_ids)),
            &nested,
            ctx,
            depth + 1,
        )?
    };
    let by_id: HashMap<Value, Record> = loaded.into_iter().map(|r| (r.id(), r)).collect();

    let mut grouped: HashMap<Value, Vec<Record>> = HashMap::new();
    for link in &links {
        let source = link.value(source_key);
        if let Some(child) = by_id.get(&link.value(target_key)) {
            grouped.entry(source).or_default().push(child.clone());
        }
    }
    for record in records.iter_mut() {
        let children = grouped.remove(&record.id()).unwrap_or_default();
        let related = if spec.wants_aggregate() {
            let aggregate = spec.aggregate.clone().unwrap_or_default();
            Related::Aggregate(rollup_in_memory(&children, &aggregate))
        } else {
            Related::Many(children)
        };
        record.relations.insert(name.to_string(), related);
    }
    Ok(())
}

/// Rollups computed over already-loaded records. Matches the driver's
/// aggregate semantics: nulls are excluded, empty input yields null.
fn rollup_in_memory(records: &[Record], aggregate: &AggregateSpec) -> RelationAggregate {
    let mut rollup = RelationAggregate {
        count: records.len() as i64,
        ..RelationAggregate::default()
    };
    let values = |column: &str| -> Vec<Value> {
        records
            .iter()
            .map(|r| r.get(column))
            .filter(|v| !v.is_null())
            .collect()
    };
    for column in &aggregate.sum {
        let vals = values(column);
        let value = if vals.is_empty() {
            Value::Null
        } else {
            Value::Float(vals.iter().filter_map(Value::as_f64).sum())
        };
        rollup.sum.insert(column.clone(), value);
    }
    for column in &aggregate.avg {
        let vals = values(column);
        let value = if vals.is_empty() {
            Value::Null
        } else {
            let sum: f64 = vals.iter().filter_map(Value::as_f64).sum();
            Value::Float(sum / vals.len() as f64)
        };
        rollup.avg.insert(column.clone(), value);
    }
    for column in &aggregate.min {
        let value = values(column)
            .into_iter()
            .min_by(|a, b| a.compare(b))
            .unwrap_or(Value::Null);
        rollup.min.insert(column.clone(), value);
    }
    for column in &aggregate.max {
        let value = values(column)
            .into_iter()
            .max_by(|a, b| a.compare(b))
            .unwrap_or(Value::Null);
        rollup.max.insert(column.clone(), value);
    }
    rollup
}

#[allow(clippy::too_many_arguments)]
fn resolve_polymorphic(
    crud: &Crud,
    records: &mut [Record],
    name: &str,
    type_column: &str,
    id_column: &str,
    targets: &std::collections::BTreeMap<String, String>,
    spec: &WithSpec,
    ctx: &OperationContext,
    depth: u32,
) -> Result<()> {
    // One load per distinct target type present in the batch.
    let mut by_type: HashMap<String, Vec<Value>> = HashMap::new();
    for record in records.iter() {
        let Some(ty) = record.get(type_column).as_str().map(str::to_string) else {
            continue;
        };
        let id = record.get(id_column);
        if !id.is_null() && targets.contains_key(&ty) {
            by_type.entry(ty).or_default().push(id);
        }
    }

    let mut loaded: HashMap<(String, Value), Record> = HashMap::new();
    for (ty, ids) in by_type {
        let Some(target) = targets.get(&ty) else { continue };
        let target_crud = crud.target(target)?;
        let docs = target_crud.select_docs(
            Some(Filter::is_in(schema::ID, distinct_keys(ids.into_iter()))),
            &spec.with,
            ctx,
            depth + 1,
        )?;
        for doc in docs {
            loaded.insert((ty.clone(), doc.id()), doc);
        }
    }

    for record in records.iter_mut() {
        let related = record
            .get(type_column)
            .as_str()
            .and_then(|ty| {
                let id = record.get(id_column);
                loaded.get(&(ty.to_string(), id)).cloned()
            })
            .map(Box::new);
        record.relations.insert(name.to_string(), Related::One(related));
    }
    Ok(())
}
