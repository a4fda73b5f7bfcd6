//! Engine facade: registers collection definitions and hands out their
//! CRUD surfaces.

use std::sync::Arc;

use plinth_sql::Driver;

use crate::collection::{Collection, CollectionDefinition, Registry};
use crate::crud::Crud;
use crate::error::Result;
use crate::search::{NoopSearch, SearchService};

/// The entry point for an embedding application: one engine per backing
/// store, holding the registry of compiled collections.
pub struct Engine {
    registry: Arc<Registry>,
    driver: Arc<dyn Driver>,
    search: Arc<dyn SearchService>,
    default_locale: String,
}

impl Engine {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            driver,
            search: Arc::new(NoopSearch),
            default_locale: "en".to_string(),
        }
    }

    /// Attaches a search service; searchable collections notify it after
    /// every committed write.
    pub fn with_search(mut self, search: Arc<dyn SearchService>) -> Self {
        self.search = search;
        self
    }

    pub fn with_default_locale(mut self, locale: impl Into<String>) -> Self {
        self.default_locale = locale.into();
        self
    }

    /// Compiles and registers a collection, creating its physical tables.
    pub fn register(&self, definition: &CollectionDefinition) -> Result<Arc<Collection>> {
        let collection = definition.build(&self.registry)?;
        for table in collection.tables.all() {
            self.driver.create_table(table)?;
        }
        tracing::debug!(
            collection = %collection.name,
            tables = collection.tables.all().len(),
            "registered collection"
        );
        Ok(collection)
    }

    /// The CRUD surface for a registered collection.
    pub fn collection(&self, name: &str) -> Result<Crud> {
        let collection = self.registry.expect(name)?;
        Ok(Crud::new(
            collection,
            self.registry.clone(),
            self.driver.clone(),
            self.search.clone(),
            self.default_locale.clone(),
        ))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registered collection names, sorted.
    pub fn collections(&self) -> Vec<String> {
        self.registry.names()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use plinth_sql::{row, Filter, MemoryDriver, Value};

    use super::*;
    use crate::access::{AccessDecision, AccessRule};
    use crate::collection::{FieldSpec, VersionSettings};
    use crate::context::{OperationContext, RequestUser};
    use crate::crud::{CreateInput, FindOptions, RelationWrite, UpdateInput};
    use crate::error::Error;
    use crate::hooks::HookStage;
    use crate::record::Related;
    use crate::relation::{ReferentialAction, Relation, WithSpec};
    use crate::version::VersionSelector;

    fn engine() -> Engine {
        Engine::new(Arc::new(MemoryDriver::new()))
    }

    fn users() -> CollectionDefinition {
        CollectionDefinition::new("users")
            .with_fields(vec![FieldSpec::text("name").required()])
            .with_relation(
                "articles",
                Relation::has_many("articles", "author").with_on_delete(ReferentialAction::Cascade),
            )
    }

    fn categories() -> CollectionDefinition {
        CollectionDefinition::new("categories")
            .with_fields(vec![FieldSpec::text("name").required()])
            .with_relation(
                "articles",
                Relation::has_many("articles", "category")
                    .with_on_delete(ReferentialAction::SetNull),
            )
    }

    fn articles() -> CollectionDefinition {
        CollectionDefinition::new("articles")
            .with_fields(vec![
                FieldSpec::text("title"),
                FieldSpec::text("body"),
                FieldSpec::text("slug").required(),
                FieldSpec::text("status").with_default("draft"),
                FieldSpec::text("author_id"),
                FieldSpec::text("category_id"),
            ])
            .with_localized(["title", "body"])
            .with_relation("author", Relation::belongs_to("users", "author_id"))
            .with_relation("category", Relation::belongs_to("categories", "category_id"))
            .with_soft_delete()
            .with_versions(VersionSettings::new())
    }

    fn content_engine() -> Engine {
        let engine = engine();
        engine.register(&users()).unwrap();
        engine.register(&categories()).unwrap();
        engine.register(&articles()).unwrap();
        engine
    }

    fn create_article(engine: &Engine, slug: &str, title: &str) -> Value {
        engine
            .collection("articles")
            .unwrap()
            .create(
                CreateInput::new(row! { "slug" => slug, "title" => title }),
                &OperationContext::new(),
            )
            .unwrap()
            .id()
    }

    #[test]
    fn test_register_creates_tables_and_lists_collections() {
        let engine = content_engine();
        assert_eq!(
            engine.collections(),
            vec!["articles".to_string(), "categories".into(), "users".into()]
        );
        assert!(matches!(
            engine.collection("missing"),
            Err(Error::UnknownCollection(_))
        ));
    }

    #[test]
    fn test_create_applies_defaults_and_requires_fields() {
        let engine = content_engine();
        let articles = engine.collection("articles").unwrap();
        let ctx = OperationContext::new();

        let record = articles
            .create(CreateInput::new(row! { "slug" => "intro", "title" => "Intro" }), &ctx)
            .unwrap();
        assert_eq!(record.get("status"), Value::from("draft"));
        assert!(!record.id().is_null());

        let err = articles
            .create(CreateInput::new(row! { "title" => "No slug" }), &ctx)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_locale_fallback_on_read() {
        let engine = content_engine();
        let articles = engine.collection("articles").unwrap();
        let id = create_article(&engine, "hello", "Hello");

        let de = OperationContext::new().with_locale("de");
        articles
            .update_by_id(&id, UpdateInput::new(row! { "title" => "Hallo" }), &de)
            .unwrap();

        let in_de = articles.find_by_id(&id, &de).unwrap().unwrap();
        assert_eq!(in_de.get("title"), Value::from("Hallo"));

        // No French translation exists, so reads fall back to the default
        // locale's value.
        let fr = OperationContext::new().with_locale("fr");
        let in_fr = articles.find_by_id(&id, &fr).unwrap().unwrap();
        assert_eq!(in_fr.get("title"), Value::from("Hello"));

        // Filters on localized fields respect the requested locale.
        let found = articles
            .find(
                FindOptions::new().with_filter(Filter::eq("title", "Hallo")),
                &de,
            )
            .unwrap();
        assert_eq!(found.total_docs, 1);
        assert_eq!(found.docs[0].id(), id);
    }

    #[test]
    fn test_update_in_one_locale_leaves_others_untouched() {
        let engine = content_engine();
        let articles = engine.collection("articles").unwrap();
        let id = create_article(&engine, "hello", "Hello");

        let de = OperationContext::new().with_locale("de");
        articles
            .update_by_id(&id, UpdateInput::new(row! { "title" => "Hallo" }), &de)
            .unwrap();

        let en = articles
            .find_by_id(&id, &OperationContext::new())
            .unwrap()
            .unwrap();
        assert_eq!(en.get("title"), Value::from("Hello"));
    }

    #[test]
    fn test_soft_delete_restore_round_trip() {
        let engine = content_engine();
        let articles = engine.collection("articles").unwrap();
        let ctx = OperationContext::new();
        let id = create_article(&engine, "gone", "Gone");

        let result = articles.delete_by_id(&id, &ctx).unwrap();
        assert_eq!(result.count, 1);
        assert!(articles.find_by_id(&id, &ctx).unwrap().is_none());

        // Visible again when the caller opts into deleted rows.
        let all = ctx.clone().with_include_deleted(true);
        let hidden = articles.find_by_id(&id, &all).unwrap().unwrap();
        assert!(!hidden.get("deleted_at").is_null());

        let restored = articles.restore_by_id(&id, &ctx).unwrap();
        assert!(restored.get("deleted_at").is_null());
        assert!(articles.find_by_id(&id, &ctx).unwrap().is_some());
    }

    #[test]
    fn test_cascade_fires_child_hooks_set_null_does_not() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let counter = deleted.clone();
        let engine = engine();
        engine.register(&users()).unwrap();
        engine.register(&categories()).unwrap();
        engine
            .register(&articles().with_hook(HookStage::AfterDelete, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        let ctx = OperationContext::new();

        let author = engine
            .collection("users")
            .unwrap()
            .create(CreateInput::new(row! { "name" => "Ada" }), &ctx)
            .unwrap();
        let category = engine
            .collection("categories")
            .unwrap()
            .create(CreateInput::new(row! { "name" => "News" }), &ctx)
            .unwrap();
        let articles = engine.collection("articles").unwrap();
        for slug in ["a", "b"] {
            articles
                .create(
                    CreateInput::new(row! {
                        "slug" => slug,
                        "title" => slug,
                        "author_id" => author.id(),
                        "category_id" => category.id(),
                    }),
                    &ctx,
                )
                .unwrap();
        }

        // Cascading delete goes through each child's pipeline.
        engine
            .collection("users")
            .unwrap()
            .delete_by_id(&author.id(), &ctx)
            .unwrap();
        assert_eq!(deleted.load(Ordering::SeqCst), 2);
        assert_eq!(articles.count(None, &ctx).unwrap(), 0);

        // Set-null is one batched update: no hooks, rows stay live.
        let orphan = articles
            .create(
                CreateInput::new(row! {
                    "slug" => "c",
                    "title" => "c",
                    "category_id" => category.id(),
                }),
                &ctx,
            )
            .unwrap();
        engine
            .collection("categories")
            .unwrap()
            .delete_by_id(&category.id(), &ctx)
            .unwrap();
        assert_eq!(deleted.load(Ordering::SeqCst), 2);
        let survivor = articles.find_by_id(&orphan.id(), &ctx).unwrap().unwrap();
        assert!(survivor.get("category_id").is_null());
    }

    #[test]
    fn test_ownership_rule_scopes_reads_and_writes() {
        let engine = engine();
        engine
            .register(
                &CollectionDefinition::new("notes")
                    .with_fields(vec![
                        FieldSpec::text("text").required(),
                        FieldSpec::text("owner_id"),
                    ])
                    .with_read_access(AccessRule::owner("owner_id"))
                    .with_update_access(AccessRule::owner("owner_id")),
            )
            .unwrap();
        let notes = engine.collection("notes").unwrap();
        let sys = OperationContext::new();
        let mine = notes
            .create(
                CreateInput::new(row! { "text" => "mine", "owner_id" => "alice" }),
                &sys,
            )
            .unwrap();
        let theirs = notes
            .create(
                CreateInput::new(row! { "text" => "theirs", "owner_id" => "bob" }),
                &sys,
            )
            .unwrap();

        let alice = OperationContext::as_user(RequestUser::new("alice"));
        let page = notes.find(FindOptions::new(), &alice).unwrap();
        assert_eq!(page.total_docs, 1);
        assert_eq!(page.docs[0].id(), mine.id());
        assert!(notes.find_by_id(&theirs.id(), &alice).unwrap().is_none());

        let err = notes
            .update_by_id(
                &theirs.id(),
                UpdateInput::new(row! { "text" => "hijacked" }),
                &alice,
            )
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied));

        // Anonymous reads are denied outright.
        let anon = OperationContext::new().with_access_mode(crate::context::AccessMode::User);
        assert!(matches!(
            notes.find(FindOptions::new(), &anon),
            Err(Error::AccessDenied)
        ));
    }

    #[test]
    fn test_role_rule_gates_creates() {
        let engine = engine();
        engine
            .register(
                &CollectionDefinition::new("posts")
                    .with_fields(vec![FieldSpec::text("title")])
                    .with_create_access(AccessRule::Role("editor".into())),
            )
            .unwrap();
        let posts = engine.collection("posts").unwrap();

        let reader = OperationContext::as_user(RequestUser::new("u1"));
        let err = posts
            .create(CreateInput::new(row! { "title" => "x" }), &reader)
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied));

        let editor = OperationContext::as_user(RequestUser::new("u2").with_role("editor"));
        assert!(posts
            .create(CreateInput::new(row! { "title" => "x" }), &editor)
            .is_ok());
    }

    #[test]
    fn test_failed_hook_rolls_back_the_write() {
        let engine = engine();
        engine
            .register(
                &CollectionDefinition::new("audited")
                    .with_fields(vec![FieldSpec::text("name")])
                    .with_hook(HookStage::BeforeChange, |args| {
                        if args.data.value("name") == Value::from("forbidden") {
                            return Err(Error::Validation("forbidden name".into()));
                        }
                        Ok(())
                    }),
            )
            .unwrap();
        let audited = engine.collection("audited").unwrap();
        let ctx = OperationContext::new();

        let err = audited
            .create(CreateInput::new(row! { "name" => "forbidden" }), &ctx)
            .unwrap_err();
        assert!(matches!(err, Error::Hook(_)));
        assert_eq!(audited.count(None, &ctx).unwrap(), 0);
    }

    #[test]
    fn test_version_history_and_revert() {
        let engine = content_engine();
        let articles = engine.collection("articles").unwrap();
        let ctx = OperationContext::new();
        let id = create_article(&engine, "v", "First");

        articles
            .update_by_id(&id, UpdateInput::new(row! { "title" => "Second" }), &ctx)
            .unwrap();
        articles
            .update_by_id(&id, UpdateInput::new(row! { "slug" => "v2" }), &ctx)
            .unwrap();

        let history = articles.find_versions(&id, None, None, &ctx).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].operation, crate::context::Operation::Create);
        assert_eq!(history[0].version, 1);
        assert_eq!(
            history[0].translations.get("en").map(|r| r.value("title")),
            Some(Value::from("First"))
        );

        let reverted = articles
            .revert_to_version(&id, &VersionSelector::Number(1), &ctx)
            .unwrap();
        assert_eq!(reverted.get("title"), Value::from("First"));
        assert_eq!(reverted.get("slug"), Value::from("v"));

        // The revert appends history instead of rewinding it.
        let history = articles.find_versions(&id, None, None, &ctx).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(
            history.last().map(|v| v.operation),
            Some(crate::context::Operation::Revert)
        );
    }

    #[test]
    fn test_version_history_survives_hard_delete() {
        let engine = engine();
        // Versioned but not soft-deleting: deletes are physical.
        engine
            .register(
                &CollectionDefinition::new("articles")
                    .with_fields(vec![FieldSpec::text("title")])
                    .with_versions(VersionSettings::new()),
            )
            .unwrap();
        let articles = engine.collection("articles").unwrap();
        let ctx = OperationContext::new();

        let id = articles
            .create(CreateInput::new(row! { "title" => "Doomed" }), &ctx)
            .unwrap()
            .id();
        articles.delete_by_id(&id, &ctx).unwrap();

        assert!(articles
            .find_by_id(&id, &ctx.clone().with_include_deleted(true))
            .unwrap()
            .is_none());
        let history = articles.find_versions(&id, None, None, &ctx).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history.last().map(|v| v.operation),
            Some(crate::context::Operation::Delete)
        );
    }

    #[test]
    fn test_belongs_to_and_has_many_resolution() {
        let engine = content_engine();
        let ctx = OperationContext::new();
        let author = engine
            .collection("users")
            .unwrap()
            .create(CreateInput::new(row! { "name" => "Ada" }), &ctx)
            .unwrap();
        let articles = engine.collection("articles").unwrap();
        for slug in ["one", "two"] {
            articles
                .create(
                    CreateInput::new(row! { "slug" => slug, "author_id" => author.id() }),
                    &ctx,
                )
                .unwrap();
        }

        let page = articles
            .find(FindOptions::new().with("author", WithSpec::new()), &ctx)
            .unwrap();
        for doc in &page.docs {
            match doc.related("author") {
                Some(Related::One(Some(related))) => {
                    assert_eq!(related.get("name"), Value::from("Ada"));
                }
                other => panic!("expected resolved author, got {other:?}"),
            }
        }

        let authors = engine
            .collection("users")
            .unwrap()
            .find(FindOptions::new().with("articles", WithSpec::counted()), &ctx)
            .unwrap();
        match authors.docs[0].related("articles") {
            Some(Related::Aggregate(rollup)) => assert_eq!(rollup.count, 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_many_to_many_nested_create_and_resolution() {
        let engine = engine();
        engine.register(&users()).unwrap();
        engine.register(&categories()).unwrap();
        engine
            .register(&articles().with_relation(
                "tags",
                Relation::many_to_many("tags", "article_tags", "article_id", "tag_id"),
            ))
            .unwrap();
        engine
            .register(
                &CollectionDefinition::new("tags")
                    .with_fields(vec![FieldSpec::text("name").required()]),
            )
            .unwrap();
        engine
            .register(&CollectionDefinition::new("article_tags").with_fields(vec![
                FieldSpec::text("article_id").required(),
                FieldSpec::text("tag_id").required(),
            ]))
            .unwrap();

        let ctx = OperationContext::new();
        let articles = engine.collection("articles").unwrap();
        let record = articles
            .create(
                CreateInput::new(row! { "slug" => "tagged", "title" => "Tagged" })
                    .with_relation(
                        "tags",
                        RelationWrite::create_many(vec![
                            CreateInput::new(row! { "name" => "rust" }),
                            CreateInput::new(row! { "name" => "cms" }),
                        ]),
                    ),
                &ctx,
            )
            .unwrap();

        let loaded = articles
            .find_one(
                FindOptions::new()
                    .with_filter(Filter::eq("id", record.id()))
                    .with("tags", WithSpec::new()),
                &ctx,
            )
            .unwrap()
            .unwrap();
        match loaded.related("tags") {
            Some(Related::Many(tags)) => {
                let mut names: Vec<Value> = tags.iter().map(|t| t.get("name")).collect();
                names.sort_by(|a, b| a.compare(b));
                assert_eq!(names, vec![Value::from("cms"), Value::from("rust")]);
            }
            other => panic!("expected tags, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_connect_rejects_missing_target() {
        let engine = content_engine();
        let ctx = OperationContext::new();
        let err = engine
            .collection("articles")
            .unwrap()
            .create(
                CreateInput::new(row! { "slug" => "x" })
                    .with_relation("author", RelationWrite::connect("no-such-user")),
                &ctx,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        // The whole create rolled back with it.
        assert_eq!(
            engine.collection("articles").unwrap().count(None, &ctx).unwrap(),
            0
        );
    }

    #[test]
    fn test_pagination_envelope() {
        let engine = content_engine();
        let users_crud = engine.collection("users").unwrap();
        let ctx = OperationContext::new();
        for i in 0..5 {
            users_crud
                .create(CreateInput::new(row! { "name" => format!("u{i}") }), &ctx)
                .unwrap();
        }

        let page = users_crud
            .find(FindOptions::new().with_limit(2).with_offset(2), &ctx)
            .unwrap();
        assert_eq!(page.total_docs, 5);
        assert_eq!(page.docs.len(), 2);
        assert_eq!(page.page, 2);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_prev_page);
        assert!(page.has_next_page);
        assert_eq!(page.prev_page, Some(1));
        assert_eq!(page.next_page, Some(3));
    }

    #[test]
    fn test_bulk_update_touches_only_matches() {
        let engine = content_engine();
        let articles = engine.collection("articles").unwrap();
        let ctx = OperationContext::new();
        create_article(&engine, "a", "A");
        create_article(&engine, "b", "B");

        let changed = articles
            .update(
                Some(Filter::eq("slug", "a")),
                row! { "status" => "published" },
                &ctx,
            )
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].get("status"), Value::from("published"));
        assert_eq!(
            articles
                .count(Some(Filter::eq("status", "draft")), &ctx)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_bulk_update_evaluates_predicate_rule_per_row() {
        let engine = engine();
        engine
            .register(
                &CollectionDefinition::new("pages")
                    .with_fields(vec![
                        FieldSpec::text("slug").required(),
                        FieldSpec::text("state").with_default("open"),
                    ])
                    .with_update_access(AccessRule::predicate(|args| match args.row {
                        Some(row) if row.value("state") == Value::from("locked") => {
                            Ok(AccessDecision::Deny)
                        }
                        _ => Ok(AccessDecision::Allow),
                    })),
            )
            .unwrap();
        let pages = engine.collection("pages").unwrap();
        let sys = OperationContext::new();
        pages
            .create(CreateInput::new(row! { "slug" => "notes" }), &sys)
            .unwrap();
        pages
            .create(
                CreateInput::new(row! { "slug" => "frozen", "state" => "locked" }),
                &sys,
            )
            .unwrap();

        // A locked row in the match set denies the whole batch and rolls
        // it back.
        let user = OperationContext::as_user(RequestUser::new("casey"));
        let err = pages
            .update(None, row! { "slug" => "renamed" }, &user)
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied));
        assert_eq!(
            pages.count(Some(Filter::eq("slug", "renamed")), &sys).unwrap(),
            0
        );

        let changed = pages
            .update(
                Some(Filter::eq("state", "open")),
                row! { "slug" => "renamed" },
                &user,
            )
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].get("slug"), Value::from("renamed"));
    }

    #[test]
    fn test_bulk_delete_commits_before_after_delete_hooks_run() {
        let engine = engine();
        engine
            .register(
                &CollectionDefinition::new("drafts")
                    .with_fields(vec![FieldSpec::text("slug").required()])
                    .with_hook(HookStage::AfterDelete, |args| {
                        if args.data.value("slug") == Value::from("b") {
                            return Err(Error::Validation("boom".into()));
                        }
                        Ok(())
                    }),
            )
            .unwrap();
        let drafts = engine.collection("drafts").unwrap();
        let ctx = OperationContext::new();
        drafts
            .create(CreateInput::new(row! { "slug" => "a" }), &ctx)
            .unwrap();
        drafts
            .create(CreateInput::new(row! { "slug" => "b" }), &ctx)
            .unwrap();

        // The batched removal commits before AfterDelete runs, so the
        // failing hook surfaces an error without restoring any row.
        let err = drafts.delete(None, &ctx).unwrap_err();
        assert!(matches!(err, Error::Hook(_)));
        assert_eq!(drafts.count(None, &ctx).unwrap(), 0);
    }
}
