//! Filter expressions and application-level row evaluation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::statement::ColumnRef;
use crate::value::{Row, Value};

/// A boolean filter tree over row columns.
///
/// `EqOuter` is a correlated equality against a column of the enclosing
/// query's current row; it only has meaning inside a subquery and never
/// matches during plain row evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Column equals value.
    Eq { column: String, value: Value },
    /// Column not equals value.
    Ne { column: String, value: Value },
    /// Column less than value.
    Lt { column: String, value: Value },
    /// Column less than or equal to value.
    Le { column: String, value: Value },
    /// Column greater than value.
    Gt { column: String, value: Value },
    /// Column greater than or equal to value.
    Ge { column: String, value: Value },
    /// Column is in a set of values.
    In { column: String, values: Vec<Value> },
    /// Column is not in a set of values.
    NotIn { column: String, values: Vec<Value> },
    /// Column is null.
    IsNull { column: String },
    /// Column is not null.
    IsNotNull { column: String },
    /// Column matches a LIKE pattern (`%` and `_` wildcards).
    Like { column: String, pattern: String },
    /// Column equals a column of the enclosing query's current row.
    EqOuter { column: String, outer: ColumnRef },
    /// All conditions must be true.
    And(Vec<Filter>),
    /// At least one condition must be true.
    Or(Vec<Filter>),
    /// Negation.
    Not(Box<Filter>),
}

impl Filter {
    /// Column equals value.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq { column: column.into(), value: value.into() }
    }

    /// Column not equals value.
    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne { column: column.into(), value: value.into() }
    }

    /// Column less than value.
    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt { column: column.into(), value: value.into() }
    }

    /// Column less than or equal to value.
    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Le { column: column.into(), value: value.into() }
    }

    /// Column greater than value.
    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt { column: column.into(), value: value.into() }
    }

    /// Column greater than or equal to value.
    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ge { column: column.into(), value: value.into() }
    }

    /// Column is in a set of values.
    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In { column: column.into(), values }
    }

    /// Column is not in a set of values.
    pub fn not_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::NotIn { column: column.into(), values }
    }

    /// Column is null.
    pub fn is_null(column: impl Into<String>) -> Self {
        Filter::IsNull { column: column.into() }
    }

    /// Column is not null.
    pub fn is_not_null(column: impl Into<String>) -> Self {
        Filter::IsNotNull { column: column.into() }
    }

    /// Column matches a LIKE pattern.
    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Filter::Like { column: column.into(), pattern: pattern.into() }
    }

    /// Correlated equality against an outer-row column.
    pub fn eq_outer(column: impl Into<String>, outer: ColumnRef) -> Self {
        Filter::EqOuter { column: column.into(), outer }
    }

    /// AND a list of filters, flattening singletons.
    pub fn and(mut filters: Vec<Filter>) -> Self {
        if filters.len() == 1 {
            return filters.remove(0);
        }
        Filter::And(filters)
    }

    /// OR a list of filters, flattening singletons.
    pub fn or(mut filters: Vec<Filter>) -> Self {
        if filters.len() == 1 {
            return filters.remove(0);
        }
        Filter::Or(filters)
    }

    /// Combine two optional filters with AND.
    pub fn merge(a: Option<Filter>, b: Option<Filter>) -> Option<Filter> {
        match (a, b) {
            (None, None) => None,
            (Some(f), None) | (None, Some(f)) => Some(f),
            (Some(a), Some(b)) => Some(Filter::and(vec![a, b])),
        }
    }

    /// All column names referenced by this filter.
    pub fn columns(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut HashSet<String>) {
        match self {
            Filter::Eq { column, .. }
            | Filter::Ne { column, .. }
            | Filter::Lt { column, .. }
            | Filter::Le { column, .. }
            | Filter::Gt { column, .. }
            | Filter::Ge { column, .. }
            | Filter::In { column, .. }
            | Filter::NotIn { column, .. }
            | Filter::IsNull { column }
            | Filter::IsNotNull { column }
            | Filter::Like { column, .. }
            | Filter::EqOuter { column, .. } => {
                out.insert(column.clone());
            }
            Filter::And(fs) | Filter::Or(fs) => {
                for f in fs {
                    f.collect_columns(out);
                }
            }
            Filter::Not(f) => f.collect_columns(out),
        }
    }

    /// Evaluate this filter against a single loaded row.
    ///
    /// Used for access checks on already-loaded rows; missing columns read
    /// as null, correlated predicates never match.
    pub fn matches_row(&self, row: &Row) -> bool {
        match self {
            Filter::Eq { column, value } => row.value(column).loosely_equals(value),
            Filter::Ne { column, value } => {
                let v = row.value(column);
                !v.is_null() && !v.loosely_equals(value)
            }
            Filter::Lt { column, value } => Self::ordered(row, column, value, |o| o.is_lt()),
            Filter::Le { column, value } => Self::ordered(row, column, value, |o| o.is_le()),
            Filter::Gt { column, value } => Self::ordered(row, column, value, |o| o.is_gt()),
            Filter::Ge { column, value } => Self::ordered(row, column, value, |o| o.is_ge()),
            Filter::In { column, values } => {
                let v = row.value(column);
                values.iter().any(|candidate| v.loosely_equals(candidate))
            }
            Filter::NotIn { column, values } => {
                let v = row.value(column);
                // NULL is not in any set
                v.is_null() || !values.iter().any(|candidate| v.loosely_equals(candidate))
            }
            Filter::IsNull { column } => row.value(column).is_null(),
            Filter::IsNotNull { column } => !row.value(column).is_null(),
            Filter::Like { column, pattern } => match row.value(column) {
                Value::String(s) => like_match(pattern, &s),
                _ => false,
            },
            Filter::EqOuter { .. } => false,
            Filter::And(fs) => fs.iter().all(|f| f.matches_row(row)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches_row(row)),
            Filter::Not(f) => !f.matches_row(row),
        }
    }

    fn ordered(
        row: &Row,
        column: &str,
        value: &Value,
        check: impl Fn(std::cmp::Ordering) -> bool,
    ) -> bool {
        let v = row.value(column);
        if v.is_null() || value.is_null() {
            return false;
        }
        check(v.compare(value))
    }
}

/// Match a SQL LIKE pattern (`%` = any run, `_` = any char) against a string.
pub fn like_match(pattern: &str, input: &str) -> bool {
    fn inner(pat: &[char], s: &[char]) -> bool {
        match pat.split_first() {
            None => s.is_empty(),
            Some(('%', rest)) => {
                (0..=s.len()).any(|skip| inner(rest, &s[skip..]))
            }
            Some(('_', rest)) => match s.split_first() {
                Some((_, s_rest)) => inner(rest, s_rest),
                None => false,
            },
            Some((c, rest)) => match s.split_first() {
                Some((sc, s_rest)) => sc == c && inner(rest, s_rest),
                None => false,
            },
        }
    }
    let pat: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = input.chars().collect();
    inner(&pat, &s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    fn sample() -> Row {
        row! {
            "name" => "Alice",
            "age" => 30i64,
            "email" => Value::Null,
        }
    }

    #[test]
    fn test_eq_and_ne() {
        assert!(Filter::eq("name", "Alice").matches_row(&sample()));
        assert!(!Filter::eq("name", "Bob").matches_row(&sample()));
        assert!(Filter::ne("name", "Bob").matches_row(&sample()));
        // NULL never satisfies Ne
        assert!(!Filter::ne("email", "x").matches_row(&sample()));
    }

    #[test]
    fn test_comparisons() {
        assert!(Filter::gt("age", 25i64).matches_row(&sample()));
        assert!(Filter::le("age", 30i64).matches_row(&sample()));
        assert!(!Filter::lt("age", 30i64).matches_row(&sample()));
        // NULL comparisons are always false
        assert!(!Filter::gt("email", 1i64).matches_row(&sample()));
    }

    #[test]
    fn test_in_and_null() {
        assert!(Filter::is_in("age", vec![Value::Int(30), Value::Int(40)]).matches_row(&sample()));
        assert!(Filter::not_in("email", vec![Value::Int(1)]).matches_row(&sample()));
        assert!(Filter::is_null("email").matches_row(&sample()));
        assert!(Filter::is_null("missing").matches_row(&sample()));
        assert!(Filter::is_not_null("name").matches_row(&sample()));
    }

    #[test]
    fn test_like() {
        assert!(like_match("A%", "Alice"));
        assert!(like_match("%ice", "Alice"));
        assert!(like_match("A_ice", "Alice"));
        assert!(!like_match("B%", "Alice"));
        assert!(like_match("%", ""));
        assert!(Filter::like("name", "Al%").matches_row(&sample()));
    }

    #[test]
    fn test_compound() {
        let f = Filter::and(vec![
            Filter::eq("name", "Alice"),
            Filter::or(vec![Filter::gt("age", 40i64), Filter::le("age", 30i64)]),
        ]);
        assert!(f.matches_row(&sample()));
        assert!(!Filter::Not(Box::new(f)).matches_row(&sample()));
    }

    #[test]
    fn test_and_flattens_singleton() {
        let f = Filter::and(vec![Filter::eq("a", 1i64)]);
        assert!(matches!(f, Filter::Eq { .. }));
    }

    #[test]
    fn test_merge_optionals() {
        assert!(Filter::merge(None, None).is_none());
        let merged = Filter::merge(Some(Filter::eq("a", 1i64)), Some(Filter::eq("b", 2i64)));
        assert!(matches!(merged, Some(Filter::And(ref fs)) if fs.len() == 2));
    }

    #[test]
    fn test_columns_extraction() {
        let f = Filter::and(vec![
            Filter::eq("a", 1i64),
            Filter::Not(Box::new(Filter::is_null("b"))),
        ]);
        let cols = f.columns();
        assert!(cols.contains("a") && cols.contains("b"));
    }
}
