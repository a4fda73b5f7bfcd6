//! The compiled, immutable form of a collection.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use plinth_sql::Row;

use crate::access::AccessRules;
use crate::collection::field::FieldSpec;
use crate::collection::CollectionOptions;
use crate::error::Error;
use crate::expr::FieldExprFn;
use crate::hooks::Hooks;
use crate::relation::Relation;
use crate::schema::TableSet;
use crate::search::Searchable;

/// A validated collection with its physical schema attached. Built once
/// from a [`CollectionDefinition`](crate::collection::CollectionDefinition)
/// and shared behind an `Arc`.
pub struct Collection {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub localized: BTreeSet<String>,
    pub virtuals: Vec<(String, FieldExprFn)>,
    pub relations: BTreeMap<String, Relation>,
    pub title: Option<FieldExprFn>,
    pub options: CollectionOptions,
    pub hooks: Hooks,
    pub access: AccessRules,
    pub searchable: Option<Searchable>,
    pub tables: TableSet,
}

impl Collection {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_localized(&self, name: &str) -> bool {
        self.localized.contains(name)
    }

    pub fn has_localized(&self) -> bool {
        !self.localized.is_empty()
    }

    /// Fields stored on the primary table.
    pub fn plain_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| !self.localized.contains(&f.name))
    }

    /// Fields stored on the translation table.
    pub fn localized_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| self.localized.contains(&f.name))
    }

    pub fn relation(&self, name: &str) -> Result<&Relation, Error> {
        self.relations.get(name).ok_or_else(|| Error::UnknownRelation {
            collection: self.name.clone(),
            relation: name.to_string(),
        })
    }

    pub fn versioned(&self) -> bool {
        self.options.versions.is_some()
    }

    pub fn soft_delete(&self) -> bool {
        self.options.soft_delete
    }

    pub fn timestamps(&self) -> bool {
        self.options.timestamps
    }

    pub fn table_name(&self) -> &str {
        &self.tables.primary.name
    }

    pub fn translation_table_name(&self) -> Option<&str> {
        self.tables.translation.as_ref().map(|t| t.name.as_str())
    }

    pub fn versions_table_name(&self) -> Option<&str> {
        self.tables.versions.as_ref().map(|t| t.name.as_str())
    }

    pub fn translation_versions_table_name(&self) -> Option<&str> {
        self.tables
            .translation_versions
            .as_ref()
            .map(|t| t.name.as_str())
    }

    /// Splits an input row into its primary-table and translation-table
    /// slices.
    pub fn split_localized(&self, data: &Row) -> (Row, Row) {
        let mut plain = Row::new();
        let mut localized = Row::new();
        for (column, value) in data.iter() {
            if self.localized.contains(column) {
                localized.set(column.clone(), value.clone());
            } else {
                plain.set(column.clone(), value.clone());
            }
        }
        (plain, localized)
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("localized", &self.localized)
            .field("virtuals", &self.virtuals.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("relations", &self.relations)
            .field("options", &self.options)
            .field("hooks", &self.hooks)
            .field("access", &self.access)
            .field("searchable", &self.searchable)
            .finish()
    }
}
