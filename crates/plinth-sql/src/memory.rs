//! In-memory reference driver.
//!
//! Implements the driver seam over plain maps: transactions operate on a
//! cloned snapshot of all tables and swap it in on commit, so rollback is a
//! drop. Joins are nested-loop, correlated subqueries are evaluated against
//! an outer-row environment, and unique indexes are enforced on insert with
//! ON CONFLICT handling.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::statement::{
    AggregateFunc, ColumnRef, ConflictAction, Delete, Direction, Expr, Insert, Join, JoinKind,
    JoinOn, OrderSpec, Select, TableDef, Update,
};
use crate::value::{Row, Value};
use crate::{Driver, DriverTransaction};

#[derive(Debug, Clone)]
struct MemTable {
    def: TableDef,
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, MemTable>,
}

impl MemoryState {
    fn table(&self, name: &str) -> Result<&MemTable> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }
}

/// An in-memory relational backend.
#[derive(Default)]
pub struct MemoryDriver {
    state: RwLock<MemoryState>,
}

impl MemoryDriver {
    /// Create an empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rows in a table. Test/debug helper.
    pub fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.state.read().table(table)?.rows.len())
    }
}

impl Driver for MemoryDriver {
    fn create_table(&self, table: &TableDef) -> Result<()> {
        let mut state = self.state.write();
        // create-if-not-exists semantics
        state
            .tables
            .entry(table.name.clone())
            .or_insert_with(|| MemTable { def: table.clone(), rows: Vec::new() });
        Ok(())
    }

    fn begin(&self) -> Result<Box<dyn DriverTransaction + '_>> {
        let snapshot = self.state.read().clone();
        Ok(Box::new(MemoryTransaction { driver: self, state: snapshot }))
    }
}

/// A transaction over a cloned snapshot of the driver state.
pub struct MemoryTransaction<'a> {
    driver: &'a MemoryDriver,
    state: MemoryState,
}

impl DriverTransaction for MemoryTransaction<'_> {
    fn select(&mut self, stmt: &Select) -> Result<Vec<Row>> {
        execute_select(&self.state, stmt, None)
    }

    fn insert(&mut self, stmt: &Insert) -> Result<u64> {
        execute_insert(&mut self.state, stmt)
    }

    fn update(&mut self, stmt: &Update) -> Result<u64> {
        execute_update(&mut self.state, stmt)
    }

    fn delete(&mut self, stmt: &Delete) -> Result<u64> {
        execute_delete(&mut self.state, stmt)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        *this.driver.state.write() = this.state;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// One joined source: (alias, table name, row). Unmatched left joins
/// contribute an empty row, which reads as all-null.
type Frame = (String, String, Row);

struct Env<'a> {
    state: &'a MemoryState,
    frames: &'a [Frame],
    outer: Option<&'a Env<'a>>,
}

impl Env<'_> {
    fn resolve(&self, col: &ColumnRef) -> Result<Value> {
        if let Some(table) = &col.table {
            for (alias, _, row) in self.frames {
                if alias == table {
                    return Ok(row.value(&col.column));
                }
            }
            return Err(Error::UnknownColumn(format!("{}.{}", table, col.column)));
        }
        for (_, table, row) in self.frames {
            let def = &self.state.table(table)?.def;
            if def.has_column(&col.column) {
                return Ok(row.value(&col.column));
            }
        }
        Err(Error::UnknownColumn(col.column.clone()))
    }
}

fn eval_expr(env: &Env<'_>, expr: &Expr) -> Result<Value> {
    match expr {
        Expr::Column(col) => env.resolve(col),
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Coalesce(args) => {
            for arg in args {
                let v = eval_expr(env, arg)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Ok(Value::Null)
        }
        Expr::Concat(args) => {
            let mut out = String::new();
            for arg in args {
                if let Some(part) = eval_expr(env, arg)?.render() {
                    out.push_str(&part);
                }
            }
            Ok(Value::String(out))
        }
        Expr::Subquery(sub) => {
            let rows = execute_select(env.state, sub, Some(env))?;
            let alias = sub
                .projection
                .first()
                .map(|c| c.alias.clone())
                .ok_or_else(|| Error::InvalidStatement("scalar subquery with no projection".into()))?;
            Ok(rows.first().map(|r| r.value(&alias)).unwrap_or(Value::Null))
        }
        Expr::Aggregate { .. } => Err(Error::InvalidStatement(
            "aggregate outside grouped select".into(),
        )),
    }
}

fn eval_filter(env: &Env<'_>, filter: &Filter) -> Result<bool> {
    let bare = |column: &str| env.resolve(&ColumnRef::bare(column));
    Ok(match filter {
        Filter::Eq { column, value } => bare(column)?.loosely_equals(value),
        Filter::Ne { column, value } => {
            let v = bare(column)?;
            !v.is_null() && !v.loosely_equals(value)
        }
        Filter::Lt { column, value } => ordered(&bare(column)?, value, |o| o.is_lt()),
        Filter::Le { column, value } => ordered(&bare(column)?, value, |o| o.is_le()),
        Filter::Gt { column, value } => ordered(&bare(column)?, value, |o| o.is_gt()),
        Filter::Ge { column, value } => ordered(&bare(column)?, value, |o| o.is_ge()),
        Filter::In { column, values } => {
            let v = bare(column)?;
            values.iter().any(|candidate| v.loosely_equals(candidate))
        }
        Filter::NotIn { column, values } => {
            let v = bare(column)?;
            v.is_null() || !values.iter().any(|candidate| v.loosely_equals(candidate))
        }
        Filter::IsNull { column } => bare(column)?.is_null(),
        Filter::IsNotNull { column } => !bare(column)?.is_null(),
        Filter::Like { column, pattern } => match bare(column)? {
            Value::String(s) => crate::filter::like_match(pattern, &s),
            _ => false,
        },
        Filter::EqOuter { column, outer } => {
            let outer_env = env
                .outer
                .ok_or_else(|| Error::InvalidStatement("correlated filter with no outer query".into()))?;
            let v = bare(column)?;
            let outer_value = outer_env.resolve(outer)?;
            v.loosely_equals(&outer_value)
        }
        Filter::And(fs) => {
            for f in fs {
                if !eval_filter(env, f)? {
                    return Ok(false);
                }
            }
            true
        }
        Filter::Or(fs) => {
            for f in fs {
                if eval_filter(env, f)? {
                    return Ok(true);
                }
            }
            false
        }
        Filter::Not(f) => !eval_filter(env, f)?,
    })
}

fn ordered(v: &Value, value: &Value, check: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    if v.is_null() || value.is_null() {
        return false;
    }
    check(v.compare(value))
}

fn build_combos(
    state: &MemoryState,
    stmt: &Select,
    outer: Option<&Env<'_>>,
) -> Result<Vec<Vec<Frame>>> {
    let base = state.table(&stmt.table)?;
    let base_alias = stmt.effective_alias().to_string();

    let mut combos: Vec<Vec<Frame>> = base
        .rows
        .iter()
        .map(|row| vec![(base_alias.clone(), stmt.table.clone(), row.clone())])
        .collect();

    for join in &stmt.joins {
        let joined = state.table(&join.table)?;
        let alias = join.effective_alias().to_string();
        let mut next = Vec::new();

        for combo in combos {
            let mut matched = false;
            for candidate in &joined.rows {
                let mut tentative = combo.clone();
                tentative.push((alias.clone(), join.table.clone(), candidate.clone()));
                if join_matches(state, &tentative, join, outer)? {
                    next.push(tentative);
                    matched = true;
                }
            }
            if !matched && join.kind == JoinKind::Left {
                let mut tentative = combo;
                tentative.push((alias.clone(), join.table.clone(), Row::new()));
                next.push(tentative);
            }
        }
        combos = next;
    }

    Ok(combos)
}

fn join_matches(
    state: &MemoryState,
    frames: &[Frame],
    join: &Join,
    outer: Option<&Env<'_>>,
) -> Result<bool> {
    let env = Env { state, frames, outer };
    for term in &join.on {
        let ok = match term {
            JoinOn::Columns(a, b) => env.resolve(a)?.loosely_equals(&env.resolve(b)?),
            JoinOn::Literal(col, value) => env.resolve(col)?.loosely_equals(value),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn execute_select(
    state: &MemoryState,
    stmt: &Select,
    outer: Option<&Env<'_>>,
) -> Result<Vec<Row>> {
    if stmt.projection.is_empty() {
        return Err(Error::InvalidStatement("select with empty projection".into()));
    }

    let mut combos = build_combos(state, stmt, outer)?;

    if let Some(filter) = &stmt.filter {
        let mut kept = Vec::new();
        for combo in combos {
            let env = Env { state, frames: &combo, outer };
            if eval_filter(&env, filter)? {
                kept.push(combo);
            }
        }
        combos = kept;
    }

    if stmt.is_aggregate() {
        return project_grouped(state, stmt, combos, outer);
    }

    // Project rows and compute sort keys against the pre-projection frames.
    let mut projected: Vec<(Vec<Value>, Row)> = Vec::with_capacity(combos.len());
    for combo in &combos {
        let env = Env { state, frames: combo, outer };
        let mut row = Row::new();
        for col in &stmt.projection {
            row.set(col.alias.clone(), eval_expr(&env, &col.expr)?);
        }
        let mut keys = Vec::with_capacity(stmt.order_by.len());
        for spec in &stmt.order_by {
            keys.push(order_key(&env, &row, stmt, spec)?);
        }
        projected.push((keys, row));
    }

    if stmt.distinct {
        let mut seen: Vec<Row> = Vec::new();
        projected.retain(|(_, row)| {
            if seen.contains(row) {
                false
            } else {
                seen.push(row.clone());
                true
            }
        });
    }

    sort_projected(&mut projected, &stmt.order_by);
    let mut rows: Vec<Row> = projected.into_iter().map(|(_, row)| row).collect();
    apply_pagination(&mut rows, stmt.offset, stmt.limit);
    Ok(rows)
}

/// Resolve a sort key: projection aliases take precedence over source
/// columns, so `ORDER BY` can reference computed output columns.
fn order_key(env: &Env<'_>, projected: &Row, stmt: &Select, spec: &OrderSpec) -> Result<Value> {
    if let Expr::Column(col) = &spec.expr {
        if col.table.is_none() && stmt.projection.iter().any(|c| c.alias == col.column) {
            return Ok(projected.value(&col.column));
        }
    }
    eval_expr(env, &spec.expr)
}

fn sort_projected(rows: &mut [(Vec<Value>, Row)], order_by: &[OrderSpec]) {
    if order_by.is_empty() {
        return;
    }
    rows.sort_by(|(a_keys, _), (b_keys, _)| {
        for (i, spec) in order_by.iter().enumerate() {
            let cmp = a_keys[i].compare(&b_keys[i]);
            let cmp = match spec.direction {
                Direction::Asc => cmp,
                Direction::Desc => cmp.reverse(),
            };
            if cmp != std::cmp::Ordering::Equal {
                return cmp;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn apply_pagination(rows: &mut Vec<Row>, offset: Option<u64>, limit: Option<u64>) {
    if let Some(offset) = offset {
        let offset = offset as usize;
        if offset >= rows.len() {
            rows.clear();
        } else if offset > 0 {
            rows.drain(0..offset);
        }
    }
    if let Some(limit) = limit {
        rows.truncate(limit as usize);
    }
}

fn project_grouped(
    state: &MemoryState,
    stmt: &Select,
    combos: Vec<Vec<Frame>>,
    outer: Option<&Env<'_>>,
) -> Result<Vec<Row>> {
    // Group combos by their GROUP BY key values, preserving first-seen order.
    let mut order: Vec<Vec<Value>> = Vec::new();
    let mut groups: HashMap<Vec<Value>, Vec<Vec<Frame>>> = HashMap::new();

    if stmt.group_by.is_empty() {
        order.push(Vec::new());
        groups.insert(Vec::new(), combos);
    } else {
        for combo in combos {
            let env = Env { state, frames: &combo, outer };
            let mut key = Vec::with_capacity(stmt.group_by.len());
            for col in &stmt.group_by {
                key.push(env.resolve(col)?);
            }
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(combo);
        }
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        let members = groups.remove(&key).unwrap_or_default();
        let mut row = Row::new();
        for col in &stmt.projection {
            let value = match &col.expr {
                Expr::Aggregate { func, column } => {
                    eval_aggregate(state, &members, outer, *func, column.as_ref())?
                }
                expr if expr.has_aggregate() => {
                    return Err(Error::Unsupported(
                        "aggregate nested inside a compound expression".into(),
                    ));
                }
                expr => match members.first() {
                    Some(first) => {
                        let env = Env { state, frames: first, outer };
                        eval_expr(&env, expr)?
                    }
                    None => Value::Null,
                },
            };
            row.set(col.alias.clone(), value);
        }
        out.push(row);
    }
    Ok(out)
}

fn eval_aggregate(
    state: &MemoryState,
    members: &[Vec<Frame>],
    outer: Option<&Env<'_>>,
    func: AggregateFunc,
    column: Option<&ColumnRef>,
) -> Result<Value> {
    let mut values = Vec::new();
    if let Some(col) = column {
        for combo in members {
            let env = Env { state, frames: combo, outer };
            let v = env.resolve(col)?;
            if !v.is_null() {
                values.push(v);
            }
        }
    }

    Ok(match func {
        AggregateFunc::Count => {
            if column.is_some() {
                Value::Int(values.len() as i64)
            } else {
                Value::Int(members.len() as i64)
            }
        }
        AggregateFunc::Sum => {
            if values.is_empty() {
                Value::Null
            } else {
                Value::Float(values.iter().filter_map(Value::as_f64).sum())
            }
        }
        AggregateFunc::Avg => {
            if values.is_empty() {
                Value::Null
            } else {
                let sum: f64 = values.iter().filter_map(Value::as_f64).sum();
                Value::Float(sum / values.len() as f64)
            }
        }
        AggregateFunc::Min => values
            .into_iter()
            .min_by(|a, b| a.compare(b))
            .unwrap_or(Value::Null),
        AggregateFunc::Max => values
            .into_iter()
            .max_by(|a, b| a.compare(b))
            .unwrap_or(Value::Null),
    })
}

fn execute_insert(state: &mut MemoryState, stmt: &Insert) -> Result<u64> {
    let unique_indexes = state.table(&stmt.table)?.def.unique_indexes();
    let mut affected = 0u64;

    'rows: for new_row in &stmt.rows {
        {
            let def = &state.table(&stmt.table)?.def;
            for column in new_row.columns() {
                if !def.has_column(column) {
                    return Err(Error::UnknownColumn(format!("{}.{}", stmt.table, column)));
                }
            }
        }

        for index in &unique_indexes {
            let key: Vec<Value> = index.iter().map(|c| new_row.value(c)).collect();
            if key.iter().any(Value::is_null) {
                continue;
            }
            let existing = state
                .table(&stmt.table)?
                .rows
                .iter()
                .position(|row| {
                    index
                        .iter()
                        .zip(&key)
                        .all(|(col, v)| row.value(col).loosely_equals(v))
                });

            if let Some(pos) = existing {
                let on_conflict = stmt.on_conflict.as_ref().filter(|oc| {
                    let mut target = oc.target.clone();
                    let mut cols = index.clone();
                    target.sort();
                    cols.sort();
                    target == cols
                });
                match on_conflict.map(|oc| &oc.action) {
                    Some(ConflictAction::DoUpdate(columns)) => {
                        let table = state.table_mut(&stmt.table)?;
                        for col in columns {
                            table.rows[pos].set(col.clone(), new_row.value(col));
                        }
                        affected += 1;
                        continue 'rows;
                    }
                    Some(ConflictAction::DoNothing) => {
                        continue 'rows;
                    }
                    None => {
                        return Err(Error::UniqueViolation(format!(
                            "{}({})",
                            stmt.table,
                            index.join(", ")
                        )));
                    }
                }
            }
        }

        state.table_mut(&stmt.table)?.rows.push(new_row.clone());
        affected += 1;
    }

    Ok(affected)
}

fn execute_update(state: &mut MemoryState, stmt: &Update) -> Result<u64> {
    let matching = matching_positions(state, &stmt.table, stmt.filter.as_ref())?;
    let table = state.table_mut(&stmt.table)?;
    for &pos in &matching {
        for (col, value) in &stmt.set {
            table.rows[pos].set(col.clone(), value.clone());
        }
    }
    Ok(matching.len() as u64)
}

fn execute_delete(state: &mut MemoryState, stmt: &Delete) -> Result<u64> {
    delete_rows(state, &stmt.table, stmt.filter.as_ref())
}

fn delete_rows(state: &mut MemoryState, table: &str, filter: Option<&Filter>) -> Result<u64> {
    let matching = matching_positions(state, table, filter)?;
    if matching.is_empty() {
        return Ok(0);
    }

    let removed: Vec<Row> = {
        let mem = state.table_mut(table)?;
        let mut removed = Vec::with_capacity(matching.len());
        // Remove back to front so positions stay valid.
        for &pos in matching.iter().rev() {
            removed.push(mem.rows.remove(pos));
        }
        removed
    };

    // Store-level referential cascade: drop rows in tables whose FK columns
    // reference this table with on-delete-cascade.
    let cascade_specs: Vec<(String, String, String)> = state
        .tables
        .values()
        .flat_map(|t| {
            t.def.columns.iter().filter_map(|c| {
                c.references
                    .as_ref()
                    .filter(|r| r.table == table && r.on_delete_cascade)
                    .map(|r| (t.def.name.clone(), c.name.clone(), r.column.clone()))
            })
        })
        .collect();

    let count = removed.len() as u64;
    for (child_table, child_col, parent_col) in cascade_specs {
        let keys: Vec<Value> = removed
            .iter()
            .map(|row| row.value(&parent_col))
            .filter(|v| !v.is_null())
            .collect();
        if keys.is_empty() {
            continue;
        }
        let n = delete_rows(state, &child_table, Some(&Filter::is_in(child_col, keys)))?;
        if n > 0 {
            tracing::debug!(table = %child_table, rows = n, "cascaded delete");
        }
    }

    Ok(count)
}

fn matching_positions(
    state: &MemoryState,
    table: &str,
    filter: Option<&Filter>,
) -> Result<Vec<usize>> {
    let mem = state.table(table)?;
    let mut out = Vec::new();
    for (pos, row) in mem.rows.iter().enumerate() {
        let keep = match filter {
            Some(f) => {
                let frames = [(table.to_string(), table.to_string(), row.clone())];
                let env = Env { state, frames: &frames, outer: None };
                eval_filter(&env, f)?
            }
            None => true,
        };
        if keep {
            out.push(pos);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use crate::statement::{ColumnDef, ColumnType, IndexDef, OnConflict, OrderSpec, SelectColumn};

    fn driver_with_articles() -> MemoryDriver {
        let driver = MemoryDriver::new();
        driver
            .create_table(
                &TableDef::new("articles")
                    .with_column(ColumnDef::new("id", ColumnType::Text).primary())
                    .with_column(ColumnDef::new("status", ColumnType::Text))
                    .with_column(ColumnDef::nullable("rating", ColumnType::Integer)),
            )
            .unwrap();
        driver
            .create_table(
                &TableDef::new("articles_i18n")
                    .with_column(ColumnDef::new("id", ColumnType::Text).primary())
                    .with_column(
                        ColumnDef::new("parent_id", ColumnType::Text)
                            .references("articles", "id", true),
                    )
                    .with_column(ColumnDef::new("locale", ColumnType::Text))
                    .with_column(ColumnDef::nullable("title", ColumnType::Text))
                    .with_index(IndexDef::unique(
                        "articles_i18n_parent_locale",
                        vec!["parent_id".into(), "locale".into()],
                    )),
            )
            .unwrap();
        driver
    }

    fn seed(driver: &MemoryDriver) {
        driver
            .insert(&Insert::new(
                "articles",
                vec![
                    row! { "id" => "a1", "status" => "published", "rating" => 5i64 },
                    row! { "id" => "a2", "status" => "draft", "rating" => 3i64 },
                    row! { "id" => "a3", "status" => "published", "rating" => Value::Null },
                ],
            ))
            .unwrap();
        driver
            .insert(&Insert::new(
                "articles_i18n",
                vec![
                    row! { "id" => "t1", "parent_id" => "a1", "locale" => "en", "title" => "Hello" },
                    row! { "id" => "t2", "parent_id" => "a1", "locale" => "fr", "title" => "Bonjour" },
                    row! { "id" => "t3", "parent_id" => "a2", "locale" => "en", "title" => "Draft" },
                ],
            ))
            .unwrap();
    }

    #[test]
    fn test_select_filter_order_paginate() {
        let driver = driver_with_articles();
        seed(&driver);

        let stmt = Select::from("articles")
            .column(SelectColumn::column("id"))
            .with_filter(Filter::eq("status", "published"))
            .order(OrderSpec::desc("id"))
            .with_limit(1)
            .with_offset(1);

        let rows = driver.select(&stmt).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("id"), Value::String("a1".into()));
    }

    #[test]
    fn test_left_join_with_literal_condition() {
        let driver = driver_with_articles();
        seed(&driver);

        let stmt = Select::from("articles")
            .column(SelectColumn::column("id"))
            .column(SelectColumn::new("title", Expr::qualified("t", "title")))
            .join(Join::left(
                "articles_i18n",
                "t",
                vec![
                    JoinOn::Columns(
                        ColumnRef::qualified("t", "parent_id"),
                        ColumnRef::qualified("articles", "id"),
                    ),
                    JoinOn::Literal(ColumnRef::qualified("t", "locale"), Value::from("fr")),
                ],
            ))
            .order(OrderSpec::asc("id"));

        let rows = driver.select(&stmt).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value("title"), Value::String("Bonjour".into()));
        // a2 and a3 have no fr translation; left join yields null
        assert!(rows[1].value("title").is_null());
        assert!(rows[2].value("title").is_null());
    }

    #[test]
    fn test_correlated_subquery_fallback() {
        let driver = driver_with_articles();
        seed(&driver);

        // COALESCE(t.title, (SELECT title FROM articles_i18n
        //                    WHERE parent_id = articles.id AND locale = 'en'))
        let fallback = Select::from("articles_i18n")
            .with_alias("fb")
            .column(SelectColumn::column("title"))
            .with_filter(Filter::and(vec![
                Filter::eq_outer("parent_id", ColumnRef::qualified("articles", "id")),
                Filter::eq("locale", "en"),
            ]))
            .with_limit(1);

        let stmt = Select::from("articles")
            .column(SelectColumn::column("id"))
            .column(SelectColumn::new(
                "title",
                Expr::Coalesce(vec![
                    Expr::qualified("t", "title"),
                    Expr::Subquery(Box::new(fallback)),
                ]),
            ))
            .join(Join::left(
                "articles_i18n",
                "t",
                vec![
                    JoinOn::Columns(
                        ColumnRef::qualified("t", "parent_id"),
                        ColumnRef::qualified("articles", "id"),
                    ),
                    JoinOn::Literal(ColumnRef::qualified("t", "locale"), Value::from("fr")),
                ],
            ))
            .order(OrderSpec::asc("id"));

        let rows = driver.select(&stmt).unwrap();
        // a1 has fr; a2 falls back to en; a3 has neither
        assert_eq!(rows[0].value("title"), Value::String("Bonjour".into()));
        assert_eq!(rows[1].value("title"), Value::String("Draft".into()));
        assert!(rows[2].value("title").is_null());
    }

    #[test]
    fn test_grouped_aggregates() {
        let driver = driver_with_articles();
        seed(&driver);

        let stmt = Select::from("articles")
            .column(SelectColumn::new("status", Expr::column("status")))
            .column(SelectColumn::new("n", Expr::count()))
            .column(SelectColumn::new(
                "avg_rating",
                Expr::aggregate(AggregateFunc::Avg, "rating"),
            ))
            .group(vec![ColumnRef::bare("status")]);

        let rows = driver.select(&stmt).unwrap();
        assert_eq!(rows.len(), 2);
        let published = rows
            .iter()
            .find(|r| r.value("status") == Value::String("published".into()))
            .unwrap();
        // a3's null rating is excluded from AVG but not from COUNT(*)
        assert_eq!(published.value("n"), Value::Int(2));
        assert_eq!(published.value("avg_rating"), Value::Float(5.0));
    }

    #[test]
    fn test_count_on_empty_table() {
        let driver = driver_with_articles();
        let stmt = Select::from("articles").column(SelectColumn::new("n", Expr::count()));
        let rows = driver.select(&stmt).unwrap();
        assert_eq!(rows[0].value("n"), Value::Int(0));
    }

    #[test]
    fn test_unique_violation_and_upsert() {
        let driver = driver_with_articles();
        seed(&driver);

        let dup = Insert::new(
            "articles_i18n",
            vec![row! { "id" => "t9", "parent_id" => "a1", "locale" => "en", "title" => "Hi" }],
        );
        assert!(matches!(
            driver.insert(&dup),
            Err(Error::UniqueViolation(_))
        ));

        let upsert = dup.with_on_conflict(OnConflict {
            target: vec!["parent_id".into(), "locale".into()],
            action: ConflictAction::DoUpdate(vec!["title".into()]),
        });
        driver.insert(&upsert).unwrap();

        let rows = driver
            .select(
                &Select::from("articles_i18n")
                    .column(SelectColumn::column("title"))
                    .with_filter(Filter::and(vec![
                        Filter::eq("parent_id", "a1"),
                        Filter::eq("locale", "en"),
                    ])),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("title"), Value::String("Hi".into()));
    }

    #[test]
    fn test_transaction_rollback() {
        let driver = driver_with_articles();
        seed(&driver);

        let mut tx = driver.begin().unwrap();
        tx.update(
            &Update::table("articles")
                .set("status", "archived")
                .with_filter(Filter::eq("id", "a1")),
        )
        .unwrap();
        tx.rollback().unwrap();

        let rows = driver
            .select(
                &Select::from("articles")
                    .column(SelectColumn::column("status"))
                    .with_filter(Filter::eq("id", "a1")),
            )
            .unwrap();
        assert_eq!(rows[0].value("status"), Value::String("published".into()));
    }

    #[test]
    fn test_delete_cascades_to_referencing_tables() {
        let driver = driver_with_articles();
        seed(&driver);

        let n = driver
            .delete(&Delete::from("articles").with_filter(Filter::eq("id", "a1")))
            .unwrap();
        assert_eq!(n, 1);
        // both a1 translations are gone
        assert_eq!(driver.row_count("articles_i18n").unwrap(), 1);
    }

    #[test]
    fn test_update_returns_affected_count() {
        let driver = driver_with_articles();
        seed(&driver);

        let n = driver
            .update(
                &Update::table("articles")
                    .set("status", "archived")
                    .with_filter(Filter::eq("status", "published")),
            )
            .unwrap();
        assert_eq!(n, 2);
    }
}
