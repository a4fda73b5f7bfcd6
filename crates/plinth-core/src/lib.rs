//! Plinth Core - Declarative collections compiled into a CRUD runtime.
//!
//! Collections are described once (fields, localization, relations, access
//! rules, hooks, versioning) and compiled into physical tables plus a
//! generated CRUD surface over any [`plinth_sql::Driver`].

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod access;
pub mod collection;
pub mod context;
pub mod crud;
pub mod engine;
pub mod error;
pub mod expr;
pub mod hooks;
pub mod record;
pub mod relation;
pub mod schema;
pub mod search;
pub mod util;
pub mod version;

pub use access::{AccessArgs, AccessDecision, AccessEnforcer, AccessRule, AccessRules};
pub use collection::{
    Collection, CollectionDefinition, CollectionOptions, FieldSpec, IndexSpec, Registry,
    VersionSettings,
};
pub use context::{AccessMode, Operation, OperationContext, RequestUser};
pub use crud::{
    ConnectOrCreate, CreateInput, Crud, FindOptions, RelationWrite, UpdateInput,
};
pub use engine::Engine;
pub use error::{Error, Result};
pub use expr::{ExprScope, FieldExprFn};
pub use hooks::{HookArgs, HookFn, HookStage, Hooks};
pub use record::{DeleteResult, Paginated, Record, Related, RelationAggregate};
pub use relation::{AggregateSpec, ReferentialAction, Relation, WithMap, WithSpec};
pub use search::{
    NoopSearch, SearchIndexRequest, SearchRemoveRequest, SearchService, Searchable,
};
pub use version::{VersionEntry, VersionManager, VersionSelector};
