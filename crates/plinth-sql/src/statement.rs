//! Structured statement model: select/insert/update/delete plus DDL.
//!
//! Statements are plain data handed to a [`Driver`](crate::Driver); no SQL
//! text is built here. The projection expression language is deliberately
//! small: column references, literals, coalesce, concat, correlated scalar
//! subqueries, and the five aggregate functions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::value::{Row, Value};

/// A possibly table-qualified column reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Table name or alias; unqualified when `None`.
    pub table: Option<String>,
    /// Column name.
    pub column: String,
}

impl ColumnRef {
    /// Unqualified column reference.
    pub fn bare(column: impl Into<String>) -> Self {
        Self { table: None, column: column.into() }
    }

    /// Table-qualified column reference.
    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self { table: Some(table.into()), column: column.into() }
    }
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunc {
    /// Row count; counts non-null values when a column is given.
    Count,
    /// Numeric sum.
    Sum,
    /// Numeric average.
    Avg,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
}

/// A projection expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column reference.
    Column(ColumnRef),
    /// Literal value.
    Literal(Value),
    /// First non-null argument.
    Coalesce(Vec<Expr>),
    /// String concatenation; null arguments are skipped.
    Concat(Vec<Expr>),
    /// Scalar subquery: first column of the first result row, null if empty.
    Subquery(Box<Select>),
    /// Aggregate over the current group.
    Aggregate {
        /// Aggregate function.
        func: AggregateFunc,
        /// Column to aggregate; `None` is only valid for `Count`.
        column: Option<ColumnRef>,
    },
}

impl Expr {
    /// Unqualified column expression.
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(ColumnRef::bare(name))
    }

    /// Qualified column expression.
    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column(ColumnRef::qualified(table, name))
    }

    /// Literal expression.
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// `COUNT(*)` expression.
    pub fn count() -> Self {
        Expr::Aggregate { func: AggregateFunc::Count, column: None }
    }

    /// Aggregate over a column.
    pub fn aggregate(func: AggregateFunc, column: impl Into<String>) -> Self {
        Expr::Aggregate { func, column: Some(ColumnRef::bare(column)) }
    }

    /// Whether this expression contains an aggregate.
    pub fn has_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Coalesce(args) | Expr::Concat(args) => args.iter().any(Expr::has_aggregate),
            Expr::Column(_) | Expr::Literal(_) | Expr::Subquery(_) => false,
        }
    }

    /// Evaluate against a single flat row.
    ///
    /// Table qualifiers are ignored; subqueries and aggregates are not
    /// evaluable here (the driver handles those). Used at write time to
    /// compute title and virtual values from an in-memory document.
    pub fn evaluate(&self, row: &Row) -> Result<Value> {
        match self {
            Expr::Column(col) => Ok(row.value(&col.column)),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Coalesce(args) => {
                for arg in args {
                    let v = arg.evaluate(row)?;
                    if !v.is_null() {
                        return Ok(v);
                    }
                }
                Ok(Value::Null)
            }
            Expr::Concat(args) => {
                let mut out = String::new();
                for arg in args {
                    if let Some(part) = arg.evaluate(row)?.render() {
                        out.push_str(&part);
                    }
                }
                Ok(Value::String(out))
            }
            Expr::Subquery(_) => {
                Err(Error::Unsupported("subquery outside driver context".into()))
            }
            Expr::Aggregate { .. } => {
                Err(Error::Unsupported("aggregate outside driver context".into()))
            }
        }
    }
}

/// One projected column with its output alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectColumn {
    /// Output alias in the result row.
    pub alias: String,
    /// Projected expression.
    pub expr: Expr,
}

impl SelectColumn {
    /// Project an expression under an alias.
    pub fn new(alias: impl Into<String>, expr: Expr) -> Self {
        Self { alias: alias.into(), expr }
    }

    /// Project a column under its own name.
    pub fn column(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { alias: name.clone(), expr: Expr::column(name) }
    }
}

/// Join kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    /// Inner join.
    Inner,
    /// Left outer join.
    Left,
}

/// A join condition term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JoinOn {
    /// Column = column.
    Columns(ColumnRef, ColumnRef),
    /// Column = literal.
    Literal(ColumnRef, Value),
}

/// A join clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    /// Joined table.
    pub table: String,
    /// Alias for the joined table.
    pub alias: Option<String>,
    /// Join kind.
    pub kind: JoinKind,
    /// Conjunction of join conditions.
    pub on: Vec<JoinOn>,
}

impl Join {
    /// Left join with an alias.
    pub fn left(table: impl Into<String>, alias: impl Into<String>, on: Vec<JoinOn>) -> Self {
        Self { table: table.into(), alias: Some(alias.into()), kind: JoinKind::Left, on }
    }

    /// Inner join with an alias.
    pub fn inner(table: impl Into<String>, alias: impl Into<String>, on: Vec<JoinOn>) -> Self {
        Self { table: table.into(), alias: Some(alias.into()), kind: JoinKind::Inner, on }
    }

    /// Effective alias of the joined table.
    pub fn effective_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// An ORDER BY term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Expression to order by.
    pub expr: Expr,
    /// Sort direction.
    pub direction: Direction,
}

impl OrderSpec {
    /// Ascending order on a column.
    pub fn asc(column: impl Into<String>) -> Self {
        Self { expr: Expr::column(column), direction: Direction::Asc }
    }

    /// Descending order on a column.
    pub fn desc(column: impl Into<String>) -> Self {
        Self { expr: Expr::column(column), direction: Direction::Desc }
    }
}

/// A SELECT statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    /// Base table.
    pub table: String,
    /// Alias for the base table.
    pub alias: Option<String>,
    /// Projected columns.
    pub projection: Vec<SelectColumn>,
    /// Join clauses.
    pub joins: Vec<Join>,
    /// WHERE filter.
    pub filter: Option<Filter>,
    /// GROUP BY columns.
    pub group_by: Vec<ColumnRef>,
    /// ORDER BY terms.
    pub order_by: Vec<OrderSpec>,
    /// Row limit.
    pub limit: Option<u64>,
    /// Row offset.
    pub offset: Option<u64>,
    /// Deduplicate projected rows.
    pub distinct: bool,
}

impl Select {
    /// Select from a table with no projection yet.
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: None,
            projection: Vec::new(),
            joins: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
        }
    }

    /// Set the base table alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Add a projected column.
    pub fn column(mut self, column: SelectColumn) -> Self {
        self.projection.push(column);
        self
    }

    /// Add projected columns.
    pub fn columns(mut self, columns: impl IntoIterator<Item = SelectColumn>) -> Self {
        self.projection.extend(columns);
        self
    }

    /// Add a join.
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Set the WHERE filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set an optional WHERE filter.
    pub fn with_filter_opt(mut self, filter: Option<Filter>) -> Self {
        self.filter = filter;
        self
    }

    /// Add GROUP BY columns.
    pub fn group(mut self, columns: impl IntoIterator<Item = ColumnRef>) -> Self {
        self.group_by.extend(columns);
        self
    }

    /// Add an ORDER BY term.
    pub fn order(mut self, spec: OrderSpec) -> Self {
        self.order_by.push(spec);
        self
    }

    /// Set LIMIT.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set OFFSET.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Effective alias of the base table.
    pub fn effective_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    /// Whether any projected expression aggregates.
    pub fn is_aggregate(&self) -> bool {
        self.projection.iter().any(|c| c.expr.has_aggregate())
    }
}

/// Action taken when an insert hits a unique-index conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictAction {
    /// Overwrite the listed columns of the existing row with the new row's
    /// values.
    DoUpdate(Vec<String>),
    /// Keep the existing row, drop the new one.
    DoNothing,
}

/// ON CONFLICT clause for inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnConflict {
    /// Conflict target columns (must form a unique index).
    pub target: Vec<String>,
    /// Action on conflict.
    pub action: ConflictAction,
}

/// An INSERT statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insert {
    /// Target table.
    pub table: String,
    /// Rows to insert.
    pub rows: Vec<Row>,
    /// Optional upsert clause.
    pub on_conflict: Option<OnConflict>,
}

impl Insert {
    /// Insert rows into a table.
    pub fn new(table: impl Into<String>, rows: Vec<Row>) -> Self {
        Self { table: table.into(), rows, on_conflict: None }
    }

    /// Attach an ON CONFLICT clause.
    pub fn with_on_conflict(mut self, on_conflict: OnConflict) -> Self {
        self.on_conflict = Some(on_conflict);
        self
    }
}

/// An UPDATE statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Target table.
    pub table: String,
    /// Columns to set.
    pub set: BTreeMap<String, Value>,
    /// WHERE filter; all rows when `None`.
    pub filter: Option<Filter>,
}

impl Update {
    /// Update rows in a table.
    pub fn table(table: impl Into<String>) -> Self {
        Self { table: table.into(), set: BTreeMap::new(), filter: None }
    }

    /// Set a column.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(column.into(), value.into());
        self
    }

    /// Set the WHERE filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A DELETE statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    /// Target table.
    pub table: String,
    /// WHERE filter; all rows when `None`.
    pub filter: Option<Filter>,
}

impl Delete {
    /// Delete rows from a table.
    pub fn from(table: impl Into<String>) -> Self {
        Self { table: table.into(), filter: None }
    }

    /// Set the WHERE filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Physical column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// UTF-8 text.
    Text,
    /// 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Boolean.
    Boolean,
    /// Microsecond timestamp.
    Timestamp,
}

/// A foreign-key reference on a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Referenced table.
    pub table: String,
    /// Referenced column.
    pub column: String,
    /// Delete referencing rows when the referenced row is deleted.
    pub on_delete_cascade: bool,
}

/// A physical column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub ty: ColumnType,
    /// Whether null is allowed.
    pub nullable: bool,
    /// Whether this is the primary key.
    pub primary_key: bool,
    /// Optional foreign-key reference.
    pub references: Option<Reference>,
}

impl ColumnDef {
    /// Non-null column.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self { name: name.into(), ty, nullable: false, primary_key: false, references: None }
    }

    /// Nullable column.
    pub fn nullable(name: impl Into<String>, ty: ColumnType) -> Self {
        Self { name: name.into(), ty, nullable: true, primary_key: false, references: None }
    }

    /// Mark as primary key.
    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Add a foreign-key reference.
    pub fn references(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        on_delete_cascade: bool,
    ) -> Self {
        self.references = Some(Reference {
            table: table.into(),
            column: column.into(),
            on_delete_cascade,
        });
        self
    }
}

/// A physical index definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

impl IndexDef {
    /// Non-unique index.
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self { name: name.into(), columns, unique: false }
    }

    /// Unique index.
    pub fn unique(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self { name: name.into(), columns, unique: true }
    }
}

/// A physical table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Indexes.
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    /// Create a table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), columns: Vec::new(), indexes: Vec::new() }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether the table declares this column.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Unique indexes, including the implicit primary-key index.
    pub fn unique_indexes(&self) -> Vec<Vec<String>> {
        let mut out: Vec<Vec<String>> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| vec![c.name.clone()])
            .collect();
        out.extend(
            self.indexes
                .iter()
                .filter(|i| i.unique)
                .map(|i| i.columns.clone()),
        );
        out
    }
}
