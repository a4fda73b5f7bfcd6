//! Compilation of a collection definition into physical table shapes.
//!
//! Every collection gets a primary table. Localized fields move to a
//! `<name>_i18n` side table keyed by `(parent_id, locale)`. Versioned
//! collections add `<name>_versions` and `<name>_versions_i18n`; the
//! version tables carry no foreign keys so history survives hard deletes.

use std::collections::{BTreeMap, BTreeSet};

use plinth_sql::{ColumnDef, ColumnType, IndexDef, TableDef};

use crate::collection::field::{FieldSpec, IndexSpec};
use crate::collection::CollectionOptions;

pub const ID: &str = "id";
pub const TITLE: &str = "_title";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const DELETED_AT: &str = "deleted_at";
pub const PARENT_ID: &str = "parent_id";
pub const LOCALE: &str = "locale";
pub const RECORD_ID: &str = "record_id";
pub const VERSION: &str = "version";
pub const OPERATION: &str = "operation";
pub const CREATED_BY: &str = "created_by";

/// Column names the engine claims for itself.
pub fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        ID | TITLE
            | CREATED_AT
            | UPDATED_AT
            | DELETED_AT
            | PARENT_ID
            | LOCALE
            | RECORD_ID
            | VERSION
            | OPERATION
            | CREATED_BY
    )
}

pub fn translation_table(collection: &str) -> String {
    format!("{collection}_i18n")
}

pub fn versions_table(collection: &str) -> String {
    format!("{collection}_versions")
}

pub fn translation_versions_table(collection: &str) -> String {
    format!("{collection}_versions_i18n")
}

/// The physical tables backing one collection.
#[derive(Clone, Debug, PartialEq)]
pub struct TableSet {
    pub primary: TableDef,
    pub translation: Option<TableDef>,
    pub versions: Option<TableDef>,
    pub translation_versions: Option<TableDef>,
}

impl TableSet {
    /// All tables in creation order (parents before dependents).
    pub fn all(&self) -> Vec<&TableDef> {
        let mut out = vec![&self.primary];
        out.extend(self.translation.as_ref());
        out.extend(self.versions.as_ref());
        out.extend(self.translation_versions.as_ref());
        out
    }
}

/// Derives the physical schema for a collection.
pub struct SchemaCompiler;

impl SchemaCompiler {
    pub fn compile(
        name: &str,
        fields: &[FieldSpec],
        localized: &BTreeSet<String>,
        indexes: &BTreeMap<String, IndexSpec>,
        options: &CollectionOptions,
    ) -> TableSet {
        let plain: Vec<&FieldSpec> = fields.iter().filter(|f| !localized.contains(&f.name)).collect();
        let loc: Vec<&FieldSpec> = fields.iter().filter(|f| localized.contains(&f.name)).collect();

        let mut primary = TableDef::new(name)
            .with_column(ColumnDef::new(ID, ColumnType::Text).primary());
        for field in &plain {
            primary = primary.with_column(Self::field_column(field));
            if field.unique {
                primary = primary.with_index(IndexDef::unique(
                    format!("{name}_{}_unique", field.name),
                    vec![field.name.clone()],
                ));
            } else if field.indexed {
                primary = primary.with_index(IndexDef::new(
                    format!("{name}_{}_idx", field.name),
                    vec![field.name.clone()],
                ));
            }
        }
        if options.timestamps {
            primary = primary
                .with_column(ColumnDef::new(CREATED_AT, ColumnType::Timestamp))
                .with_column(ColumnDef::new(UPDATED_AT, ColumnType::Timestamp));
        }
        if options.soft_delete {
            primary = primary
                .with_column(ColumnDef::nullable(DELETED_AT, ColumnType::Timestamp))
                .with_index(IndexDef::new(
                    format!("{name}_deleted_at_idx"),
                    vec![DELETED_AT.to_string()],
                ));
        }
        for (index_name, spec) in indexes {
            let def_name = format!("{name}_{index_name}");
            primary = primary.with_index(if spec.unique {
                IndexDef::unique(def_name, spec.columns.clone())
            } else {
                IndexDef::new(def_name, spec.columns.clone())
            });
        }

        let translation = (!loc.is_empty()).then(|| {
            let table = translation_table(name);
            let mut def = TableDef::new(&table)
                .with_column(ColumnDef::new(ID, ColumnType::Text).primary())
                .with_column(
                    ColumnDef::new(PARENT_ID, ColumnType::Text).references(name, ID, true),
                )
                .with_column(ColumnDef::new(LOCALE, ColumnType::Text));
            for field in &loc {
                // Translations are sparse; every localized column is nullable.
                def = def.with_column(ColumnDef::nullable(&field.name, field.ty));
            }
            def.with_index(IndexDef::unique(
                format!("{table}_parent_locale_unique"),
                vec![PARENT_ID.to_string(), LOCALE.to_string()],
            ))
            .with_index(IndexDef::new(
                format!("{table}_parent_idx"),
                vec![PARENT_ID.to_string()],
            ))
        });

        let versions = options.versions.is_some().then(|| {
            let table = versions_table(name);
            let mut def = TableDef::new(&table)
                .with_column(ColumnDef::new(ID, ColumnType::Text).primary())
                .with_column(ColumnDef::new(RECORD_ID, ColumnType::Text))
                .with_column(ColumnDef::new(VERSION, ColumnType::Integer))
                .with_column(ColumnDef::new(OPERATION, ColumnType::Text))
                .with_column(ColumnDef::nullable(CREATED_BY, ColumnType::Text))
                .with_column(ColumnDef::new(CREATED_AT, ColumnType::Timestamp));
            for field in &plain {
                def = def.with_column(ColumnDef::nullable(&field.name, field.ty));
            }
            if options.soft_delete {
                def = def.with_column(ColumnDef::nullable(DELETED_AT, ColumnType::Timestamp));
            }
            def.with_index(IndexDef::unique(
                format!("{table}_record_version_unique"),
                vec![RECORD_ID.to_string(), VERSION.to_string()],
            ))
            .with_index(IndexDef::new(
                format!("{table}_created_at_idx"),
                vec![CREATED_AT.to_string()],
            ))
        });

        let translation_versions = (options.versions.is_some() && !loc.is_empty()).then(|| {
            let table = translation_versions_table(name);
            let mut def = TableDef::new(&table)
                .with_column(ColumnDef::new(ID, ColumnType::Text).primary())
                .with_column(ColumnDef::new(RECORD_ID, ColumnType::Text))
                .with_column(ColumnDef::new(VERSION, ColumnType::Integer))
                .with_column(ColumnDef::new(LOCALE, ColumnType::Text));
            for field in &loc {
                def = def.with_column(ColumnDef::nullable(&field.name, field.ty));
            }
            def.with_index(IndexDef::unique(
                format!("{table}_record_version_locale_unique"),
                vec![RECORD_ID.to_string(), VERSION.to_string(), LOCALE.to_string()],
            ))
        });

        TableSet {
            primary,
            translation,
            versions,
            translation_versions,
        }
    }

    fn field_column(field: &FieldSpec) -> ColumnDef {
        if field.required && field.default.is_none() {
            ColumnDef::new(&field.name, field.ty)
        } else {
            ColumnDef::nullable(&field.name, field.ty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::field::FieldSpec;
    use crate::collection::{CollectionOptions, VersionSettings};

    fn options() -> CollectionOptions {
        CollectionOptions {
            timestamps: true,
            soft_delete: true,
            versions: Some(VersionSettings::default()),
        }
    }

    fn compile() -> TableSet {
        let fields = vec![
            FieldSpec::text("title").required(),
            FieldSpec::text("slug").unique(),
            FieldSpec::integer("view_count").with_default(0),
        ];
        let localized = BTreeSet::from(["title".to_string()]);
        SchemaCompiler::compile("articles", &fields, &localized, &BTreeMap::new(), &options())
    }

    #[test]
    fn test_primary_table_shape() {
        let tables = compile();
        let primary = &tables.primary;
        assert_eq!(primary.name, "articles");
        assert!(primary.column("id").is_some_and(|c| c.primary_key));
        // Localized fields live only in the side table.
        assert!(!primary.has_column("title"));
        assert!(primary.has_column("slug"));
        assert!(primary.has_column("created_at"));
        assert!(primary.has_column("deleted_at"));
        // Defaulted fields compile to nullable columns.
        assert!(primary.column("view_count").is_some_and(|c| c.nullable));
        assert!(primary
            .indexes
            .iter()
            .any(|i| i.unique && i.columns == vec!["slug".to_string()]));
    }

    #[test]
    fn test_translation_table_shape() {
        let tables = compile();
        let i18n = tables.translation.expect("translation table");
        assert_eq!(i18n.name, "articles_i18n");
        assert!(i18n.has_column("title"));
        assert!(i18n.column("title").is_some_and(|c| c.nullable));
        let parent = i18n.column("parent_id").expect("parent_id");
        let reference = parent.references.as_ref().expect("fk");
        assert_eq!(reference.table, "articles");
        assert!(reference.on_delete_cascade);
        assert!(i18n
            .indexes
            .iter()
            .any(|i| i.unique && i.columns == vec!["parent_id".to_string(), "locale".to_string()]));
    }

    #[test]
    fn test_version_tables_have_no_foreign_keys() {
        let tables = compile();
        let versions = tables.versions.expect("versions table");
        assert_eq!(versions.name, "articles_versions");
        assert!(versions.columns.iter().all(|c| c.references.is_none()));
        assert!(versions.has_column("slug"));
        assert!(!versions.has_column("title"));
        assert!(versions.has_column("deleted_at"));

        let i18n = tables.translation_versions.expect("versions i18n");
        assert_eq!(i18n.name, "articles_versions_i18n");
        assert!(i18n.has_column("title"));
        assert!(i18n.columns.iter().all(|c| c.references.is_none()));
    }

    #[test]
    fn test_unversioned_unlocalized_collection_is_one_table() {
        let fields = vec![FieldSpec::text("name")];
        let tables = SchemaCompiler::compile(
            "tags",
            &fields,
            &BTreeSet::new(),
            &BTreeMap::new(),
            &CollectionOptions::default(),
        );
        assert!(tables.translation.is_none());
        assert!(tables.versions.is_none());
        assert!(tables.translation_versions.is_none());
        assert_eq!(tables.all().len(), 1);
    }

    #[test]
    fn test_reserved_names() {
        for name in ["id", "_title", "parent_id", "locale", "version", "created_by"] {
            assert!(is_reserved(name), "{name} should be reserved");
        }
        assert!(!is_reserved("title"));
    }
}
