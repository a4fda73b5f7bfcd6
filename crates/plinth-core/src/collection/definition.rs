//! The declarative collection builder.
//!
//! Definitions are cheap immutable values: every `with_*` call returns a
//! new definition, so a base definition can be branched and merged without
//! aliasing surprises. Compilation is memoized per definition value.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use plinth_sql::Expr;

use crate::access::{AccessRule, AccessRules};
use crate::collection::compiled::Collection;
use crate::collection::field::{FieldSpec, IndexSpec};
use crate::collection::registry::Registry;
use crate::collection::{CollectionOptions, VersionSettings};
use crate::error::{Error, Result};
use crate::expr::{ExprScope, FieldExprFn};
use crate::hooks::{HookArgs, HookFn, Hooks, HookStage};
use crate::relation::Relation;
use crate::schema::{self, SchemaCompiler};
use crate::search::Searchable;

/// A declarative description of one collection.
#[derive(Clone)]
pub struct CollectionDefinition {
    name: String,
    fields: Vec<FieldSpec>,
    localized: BTreeSet<String>,
    virtuals: Vec<(String, FieldExprFn)>,
    relations: BTreeMap<String, Relation>,
    indexes: BTreeMap<String, IndexSpec>,
    title: Option<FieldExprFn>,
    options: CollectionOptions,
    hooks: Hooks,
    access: AccessRules,
    searchable: Option<Searchable>,
    compiled: OnceCell<Arc<Collection>>,
}

impl CollectionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            localized: BTreeSet::new(),
            virtuals: Vec::new(),
            relations: BTreeMap::new(),
            indexes: BTreeMap::new(),
            title: None,
            options: CollectionOptions::default(),
            hooks: Hooks::new(),
            access: AccessRules::new(),
            searchable: None,
            compiled: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn next(&self) -> Self {
        let mut next = self.clone();
        next.compiled = OnceCell::new();
        next
    }

    /// Replaces the declared fields. Resets the localized set, since it
    /// must reference the new fields.
    pub fn with_fields(&self, fields: Vec<FieldSpec>) -> Self {
        let mut next = self.next();
        next.fields = fields;
        next.localized.clear();
        next
    }

    /// Adds one field, replacing any same-named declaration in place.
    pub fn with_field(&self, field: FieldSpec) -> Self {
        let mut next = self.next();
        match next.fields.iter_mut().find(|f| f.name == field.name) {
            Some(slot) => *slot = field,
            None => next.fields.push(field),
        }
        next
    }

    /// Marks fields as localized, in addition to any already marked.
    pub fn with_localized<I, S>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.next();
        next.localized.extend(names.into_iter().map(Into::into));
        next
    }

    /// Declares a virtual field computed from an accessor expression.
    pub fn with_virtual(
        &self,
        name: impl Into<String>,
        f: impl Fn(&ExprScope<'_>) -> Expr + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        let mut next = self.next();
        let f: FieldExprFn = Arc::new(f);
        match next.virtuals.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = f,
            None => next.virtuals.push((name, f)),
        }
        next
    }

    pub fn with_relation(&self, name: impl Into<String>, relation: Relation) -> Self {
        let mut next = self.next();
        next.relations.insert(name.into(), relation);
        next
    }

    pub fn with_index(&self, name: impl Into<String>, index: IndexSpec) -> Self {
        let mut next = self.next();
        next.indexes.insert(name.into(), index);
        next
    }

    /// Expression projected as the `_title` column on every read.
    pub fn with_title(
        &self,
        f: impl Fn(&ExprScope<'_>) -> Expr + Send + Sync + 'static,
    ) -> Self {
        let mut next = self.next();
        next.title = Some(Arc::new(f));
        next
    }

    pub fn with_timestamps(&self, enabled: bool) -> Self {
        let mut next = self.next();
        next.options.timestamps = enabled;
        next
    }

    pub fn with_soft_delete(&self) -> Self {
        let mut next = self.next();
        next.options.soft_delete = true;
        next
    }

    pub fn with_versions(&self, settings: VersionSettings) -> Self {
        let mut next = self.next();
        next.options.versions = Some(settings);
        next
    }

    pub fn with_hook(
        &self,
        stage: HookStage,
        f: impl Fn(&mut HookArgs<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        let mut next = self.next();
        let f: HookFn = Arc::new(f);
        next.hooks.add(stage, f);
        next
    }

    pub fn with_read_access(&self, rule: AccessRule) -> Self {
        let mut next = self.next();
        next.access.read = Some(rule);
        next
    }

    pub fn with_create_access(&self, rule: AccessRule) -> Self {
        let mut next = self.next();
        next.access.create = Some(rule);
        next
    }

    pub fn with_update_access(&self, rule: AccessRule) -> Self {
        let mut next = self.next();
        next.access.update = Some(rule);
        next
    }

    pub fn with_delete_access(&self, rule: AccessRule) -> Self {
        let mut next = self.next();
        next.access.delete = Some(rule);
        next
    }

    pub fn with_searchable(&self, searchable: Searchable) -> Self {
        let mut next = self.next();
        next.searchable = Some(searchable);
        next
    }

    /// Overlays `other` on this definition: fields, relations, virtuals,
    /// and indexes are unioned with `other` winning on name collisions;
    /// localized sets are unioned; hooks concatenate (own hooks first);
    /// access rules merge per operation class with `other` winning.
    /// Options are taken from `other` only when it changed them.
    pub fn merge(&self, other: &Self) -> Self {
        let mut next = self.next();
        for field in &other.fields {
            match next.fields.iter_mut().find(|f| f.name == field.name) {
                Some(slot) => *slot = field.clone(),
                None => next.fields.push(field.clone()),
            }
        }
        next.localized.extend(other.localized.iter().cloned());
        for (name, f) in &other.virtuals {
            match next.virtuals.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = f.clone(),
                None => next.virtuals.push((name.clone(), f.clone())),
            }
        }
        for (name, relation) in &other.relations {
            next.relations.insert(name.clone(), relation.clone());
        }
        for (name, index) in &other.indexes {
            next.indexes.insert(name.clone(), index.clone());
        }
        if other.title.is_some() {
            next.title = other.title.clone();
        }
        if other.searchable.is_some() {
            next.searchable = other.searchable.clone();
        }
        if other.options != CollectionOptions::default() {
            next.options = other.options.clone();
        }
        next.hooks.extend_from(&other.hooks);
        next.access.merge_from(&other.access);
        next
    }

    /// Validates, compiles the physical schema, and registers the result.
    /// Compilation is memoized, so repeated builds return the same
    /// `Arc<Collection>`.
    pub fn build(&self, registry: &Registry) -> Result<Arc<Collection>> {
        let collection = self.compiled.get_or_try_init(|| {
            self.validate()?;
            let tables = SchemaCompiler::compile(
                &self.name,
                &self.fields,
                &self.localized,
                &self.indexes,
                &self.options,
            );
            Ok::<_, Error>(Arc::new(Collection {
                name: self.name.clone(),
                fields: self.fields.clone(),
                localized: self.localized.clone(),
                virtuals: self.virtuals.clone(),
                relations: self.relations.clone(),
                title: self.title.clone(),
                options: self.options.clone(),
                hooks: self.hooks.clone(),
                access: self.access.clone(),
                searchable: self.searchable.clone(),
                tables,
            }))
        })?;
        registry.insert(collection.clone())?;
        Ok(collection.clone())
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidDefinition("collection name is empty".into()));
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(Error::InvalidDefinition(format!(
                    "{}: field name is empty",
                    self.name
                )));
            }
            if schema::is_reserved(&field.name) {
                return Err(Error::InvalidDefinition(format!(
                    "{}: field name {} is reserved",
                    self.name, field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidDefinition(format!(
                    "{}: duplicate field {}",
                    self.name, field.name
                )));
            }
        }
        for name in &self.localized {
            if !seen.contains(name.as_str()) {
                return Err(Error::InvalidDefinition(format!(
                    "{}: localized field {name} is not declared",
                    self.name
                )));
            }
        }
        for (name, _) in &self.virtuals {
            if seen.contains(name.as_str()) || schema::is_reserved(name) {
                return Err(Error::InvalidDefinition(format!(
                    "{}: virtual field {name} collides with a column",
                    self.name
                )));
            }
        }
        for (name, relation) in &self.relations {
            if seen.contains(name.as_str()) {
                return Err(Error::InvalidDefinition(format!(
                    "{}: relation {name} collides with a field",
                    self.name
                )));
            }
            let owned_columns: Vec<&str> = match relation {
                Relation::BelongsTo { fk_column, .. } => vec![fk_column.as_str()],
                Relation::Polymorphic {
                    type_column,
                    id_column,
                    ..
                } => vec![type_column.as_str(), id_column.as_str()],
                Relation::HasMany { .. } | Relation::ManyToMany { .. } => vec![],
            };
            for column in owned_columns {
                if !seen.contains(column) {
                    return Err(Error::InvalidDefinition(format!(
                        "{}: relation {name} references undeclared column {column}",
                        self.name
                    )));
                }
                if self.localized.contains(column) {
                    return Err(Error::InvalidDefinition(format!(
                        "{}: relation {name} cannot use localized column {column}",
                        self.name
                    )));
                }
            }
        }
        for (name, index) in &self.indexes {
            for column in &index.columns {
                if !seen.contains(column.as_str()) || self.localized.contains(column) {
                    return Err(Error::InvalidDefinition(format!(
                        "{}: index {name} references non-primary column {column}",
                        self.name
                    )));
                }
            }
        }
        if let Some(versions) = &self.options.versions {
            if versions.max_versions == Some(0) {
                return Err(Error::InvalidDefinition(format!(
                    "{}: max_versions must be at least 1",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Operation;
    use plinth_sql::Value;

    fn base() -> CollectionDefinition {
        CollectionDefinition::new("articles")
            .with_fields(vec![FieldSpec::text("title"), FieldSpec::text("slug")])
            .with_localized(["title"])
    }

    #[test]
    fn test_build_is_memoized() {
        let registry = Registry::new();
        let def = base();
        let a = def.build(&registry).unwrap();
        let b = def.build(&registry).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_with_fields_resets_localized() {
        let def = base().with_fields(vec![FieldSpec::text("name")]);
        let registry = Registry::new();
        let coll = def.build(&registry).unwrap();
        assert!(!coll.has_localized());
    }

    #[test]
    fn test_localized_must_be_declared() {
        let registry = Registry::new();
        let err = CollectionDefinition::new("bad")
            .with_fields(vec![FieldSpec::text("a")])
            .with_localized(["missing"])
            .build(&registry)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)));
    }

    #[test]
    fn test_reserved_field_names_rejected() {
        let registry = Registry::new();
        let err = CollectionDefinition::new("bad")
            .with_fields(vec![FieldSpec::text("id")])
            .build(&registry)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)));
    }

    #[test]
    fn test_belongs_to_requires_declared_column() {
        let registry = Registry::new();
        let err = CollectionDefinition::new("bad")
            .with_fields(vec![FieldSpec::text("a")])
            .with_relation("author", Relation::belongs_to("users", "author_id"))
            .build(&registry)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)));
    }

    #[test]
    fn test_merge_unions_and_overrides() {
        let base = base()
            .with_read_access(AccessRule::Allow(true))
            .with_hook(HookStage::BeforeChange, |_| Ok(()));
        let overlay = CollectionDefinition::new("articles")
            .with_field(FieldSpec::integer("rating"))
            .with_field(FieldSpec::text("slug").unique())
            .with_read_access(AccessRule::Allow(false))
            .with_hook(HookStage::BeforeChange, |_| Ok(()));
        let merged = base.merge(&overlay);
        let registry = Registry::new();
        let coll = merged.build(&registry).unwrap();

        assert!(coll.field("rating").is_some());
        assert!(coll.field("slug").is_some_and(|f| f.unique));
        // Localized markers survive a merge.
        assert!(coll.is_localized("title"));
        // Other's access rule wins.
        assert!(matches!(
            coll.access.rule(Operation::Read),
            Some(AccessRule::Allow(false))
        ));
    }

    #[test]
    fn test_merge_keeps_base_options_when_other_is_default() {
        let versioned = base().with_soft_delete().with_versions(VersionSettings::new());
        let merged = versioned.merge(&CollectionDefinition::new("articles"));
        assert_eq!(
            merged.options,
            CollectionOptions {
                timestamps: true,
                soft_delete: true,
                versions: Some(VersionSettings::new()),
            }
        );
    }

    #[test]
    fn test_definition_values_are_independent() {
        let a = base();
        let b = a.with_field(FieldSpec::integer("rating"));
        let registry = Registry::new();
        let built_a = a.build(&registry).unwrap();
        assert!(built_a.field("rating").is_none());
        let registry_b = Registry::new();
        let built_b = b.build(&registry_b).unwrap();
        assert!(built_b.field("rating").is_some());
    }

    #[test]
    fn test_virtual_with_default() {
        let registry = Registry::new();
        let coll = base()
            .with_virtual("display", |scope| {
                Expr::Concat(vec![scope.column("title"), scope.literal(Value::from("!"))])
            })
            .build(&registry)
            .unwrap();
        assert_eq!(coll.virtuals.len(), 1);
    }
}
