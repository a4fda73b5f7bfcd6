//! Field accessor expressions.
//!
//! Virtual fields and title expressions are closures over an [`ExprScope`],
//! so the same definition works in two settings: query compilation, where a
//! localized field becomes a coalesce over the joined translation and a
//! correlated fallback subquery, and raw evaluation over an already-merged
//! row, where every field is a plain column.

use std::sync::Arc;

use plinth_sql::{ColumnRef, Expr, Filter, Select, SelectColumn, Value};

use crate::collection::Collection;
use crate::schema;

/// Alias for the requested-locale translation join.
pub const TRANSLATION_ALIAS: &str = "t";

pub type FieldExprFn = Arc<dyn Fn(&ExprScope<'_>) -> Expr + Send + Sync>;

enum ScopeMode<'a> {
    /// Building a SELECT against the physical tables.
    Query {
        locale: &'a str,
        default_locale: &'a str,
    },
    /// Evaluating against a flat row that already holds final values.
    Raw,
}

/// Resolves field names to expressions for the current setting.
pub struct ExprScope<'a> {
    collection: &'a Collection,
    mode: ScopeMode<'a>,
}

impl<'a> ExprScope<'a> {
    pub fn query(collection: &'a Collection, locale: &'a str, default_locale: &'a str) -> Self {
        Self {
            collection,
            mode: ScopeMode::Query {
                locale,
                default_locale,
            },
        }
    }

    pub fn raw(collection: &'a Collection) -> Self {
        Self {
            collection,
            mode: ScopeMode::Raw,
        }
    }

    pub fn collection(&self) -> &Collection {
        self.collection
    }

    /// Accessor for a declared field. Localized fields resolve through the
    /// requested locale with fallback to the default locale.
    pub fn column(&self, name: &str) -> Expr {
        match &self.mode {
            ScopeMode::Raw => Expr::column(name),
            ScopeMode::Query {
                locale,
                default_locale,
            } => {
                if self.collection.is_localized(name) {
                    self.localized_column(name, locale, default_locale)
                } else {
                    Expr::qualified(self.collection.table_name(), name)
                }
            }
        }
    }

    /// Literal convenience, so title closures read naturally.
    pub fn literal(&self, value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    fn localized_column(&self, name: &str, locale: &str, default_locale: &str) -> Expr {
        let direct = Expr::qualified(TRANSLATION_ALIAS, name);
        if locale == default_locale {
            return direct;
        }
        // The fallback subquery re-correlates per outer row, so it tracks
        // the default-locale translation at read time.
        let table = self
            .collection
            .translation_table_name()
            .unwrap_or_default()
            .to_string();
        let fallback = Select::from(&table)
            .with_alias("fb")
            .column(SelectColumn::column(name))
            .with_filter(Filter::and(vec![
                Filter::eq_outer(
                    schema::PARENT_ID,
                    ColumnRef::qualified(self.collection.table_name(), schema::ID),
                ),
                Filter::eq(schema::LOCALE, Value::from(default_locale)),
            ]))
            .with_limit(1);
        Expr::Coalesce(vec![direct, Expr::Subquery(Box::new(fallback))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionDefinition;
    use crate::collection::field::FieldSpec;
    use crate::collection::registry::Registry;

    fn collection() -> Arc<Collection> {
        let registry = Registry::new();
        CollectionDefinition::new("articles")
            .with_fields(vec![FieldSpec::text("title"), FieldSpec::text("slug")])
            .with_localized(["title"])
            .build(&registry)
            .unwrap()
    }

    #[test]
    fn test_plain_column_is_qualified() {
        let coll = collection();
        let scope = ExprScope::query(&coll, "de", "en");
        assert_eq!(scope.column("slug"), Expr::qualified("articles", "slug"));
    }

    #[test]
    fn test_localized_column_coalesces_to_default_locale() {
        let coll = collection();
        let scope = ExprScope::query(&coll, "de", "en");
        match scope.column("title") {
            Expr::Coalesce(parts) => {
                assert_eq!(parts[0], Expr::qualified(TRANSLATION_ALIAS, "title"));
                match &parts[1] {
                    Expr::Subquery(select) => {
                        assert_eq!(select.table, "articles_i18n");
                        assert_eq!(select.limit, Some(1));
                    }
                    other => panic!("expected subquery fallback, got {other:?}"),
                }
            }
            other => panic!("expected coalesce, got {other:?}"),
        }
    }

    #[test]
    fn test_default_locale_request_skips_fallback() {
        let coll = collection();
        let scope = ExprScope::query(&coll, "en", "en");
        assert_eq!(
            scope.column("title"),
            Expr::qualified(TRANSLATION_ALIAS, "title")
        );
    }

    #[test]
    fn test_raw_scope_uses_bare_columns() {
        let coll = collection();
        let scope = ExprScope::raw(&coll);
        assert_eq!(scope.column("title"), Expr::column("title"));
        assert_eq!(scope.column("slug"), Expr::column("slug"));
    }
}
