//! Relation declarations between collections.

use std::collections::BTreeMap;

pub mod resolver;

/// What happens to dependents when the owning side is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferentialAction {
    /// Delete dependents through their own pipeline (hooks fire per row).
    Cascade,
    /// Null out the foreign key with one batched update (no hooks).
    SetNull,
    /// Take no application-level action; the store's constraints decide.
    Restrict,
}

/// A named relation declared on a collection.
#[derive(Clone, Debug, PartialEq)]
pub enum Relation {
    /// This collection owns a foreign key column pointing at `target`.
    BelongsTo {
        target: String,
        /// Local column holding the key.
        fk_column: String,
        /// Referenced column on the target, usually its id.
        references: String,
        on_delete: Option<ReferentialAction>,
    },
    /// Inverse of a belongs-to declared on the target; owns no columns.
    HasMany {
        target: String,
        /// Name of the belongs-to relation on the target that points back.
        via: String,
        on_delete: Option<ReferentialAction>,
    },
    /// Both directions go through a junction collection.
    ManyToMany {
        target: String,
        junction: String,
        /// Junction column holding this side's id.
        source_key: String,
        /// Junction column holding the target side's id.
        target_key: String,
        on_delete: Option<ReferentialAction>,
    },
    /// A type column picks the target collection per row.
    Polymorphic {
        type_column: String,
        id_column: String,
        /// Type discriminator value to target collection name.
        targets: BTreeMap<String, String>,
    },
}

impl Relation {
    pub fn belongs_to(target: impl Into<String>, fk_column: impl Into<String>) -> Self {
        Relation::BelongsTo {
            target: target.into(),
            fk_column: fk_column.into(),
            references: "id".to_string(),
            on_delete: None,
        }
    }

    pub fn has_many(target: impl Into<String>, via: impl Into<String>) -> Self {
        Relation::HasMany {
            target: target.into(),
            via: via.into(),
            on_delete: None,
        }
    }

    pub fn many_to_many(
        target: impl Into<String>,
        junction: impl Into<String>,
        source_key: impl Into<String>,
        target_key: impl Into<String>,
    ) -> Self {
        Relation::ManyToMany {
            target: target.into(),
            junction: junction.into(),
            source_key: source_key.into(),
            target_key: target_key.into(),
            on_delete: None,
        }
    }

    pub fn polymorphic(
        type_column: impl Into<String>,
        id_column: impl Into<String>,
        targets: BTreeMap<String, String>,
    ) -> Self {
        Relation::Polymorphic {
            type_column: type_column.into(),
            id_column: id_column.into(),
            targets,
        }
    }

    pub fn with_references(mut self, column: impl Into<String>) -> Self {
        if let Relation::BelongsTo { references, .. } = &mut self {
            *references = column.into();
        }
        self
    }

    pub fn with_on_delete(mut self, action: ReferentialAction) -> Self {
        match &mut self {
            Relation::BelongsTo { on_delete, .. }
            | Relation::HasMany { on_delete, .. }
            | Relation::ManyToMany { on_delete, .. } => *on_delete = Some(action),
            Relation::Polymorphic { .. } => {}
        }
        self
    }

    pub fn on_delete(&self) -> Option<ReferentialAction> {
        match self {
            Relation::BelongsTo { on_delete, .. }
            | Relation::HasMany { on_delete, .. }
            | Relation::ManyToMany { on_delete, .. } => *on_delete,
            Relation::Polymorphic { .. } => None,
        }
    }

    /// To-one relations resolve to a single record.
    pub fn is_to_one(&self) -> bool {
        matches!(
            self,
            Relation::BelongsTo { .. } | Relation::Polymorphic { .. }
        )
    }
}

/// Requested relation loads for a query, keyed by relation name.
pub type WithMap = BTreeMap<String, WithSpec>;

/// How a single relation should be loaded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WithSpec {
    /// Nested relations to resolve on the loaded records.
    pub with: WithMap,
    /// Return a count instead of the records (to-many only).
    pub count: bool,
    /// Return rollups instead of the records (to-many only).
    pub aggregate: Option<AggregateSpec>,
}

impl WithSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counted() -> Self {
        Self {
            count: true,
            ..Self::default()
        }
    }

    pub fn with_nested(mut self, name: impl Into<String>, spec: WithSpec) -> Self {
        self.with.insert(name.into(), spec);
        self
    }

    pub fn with_aggregate(mut self, aggregate: AggregateSpec) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub fn wants_aggregate(&self) -> bool {
        self.count || self.aggregate.is_some()
    }
}

/// Per-column rollups over a to-many relation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregateSpec {
    pub sum: Vec<String>,
    pub avg: Vec<String>,
    pub min: Vec<String>,
    pub max: Vec<String>,
}

impl AggregateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sum(mut self, column: impl Into<String>) -> Self {
        self.sum.push(column.into());
        self
    }

    pub fn with_avg(mut self, column: impl Into<String>) -> Self {
        self.avg.push(column.into());
        self
    }

    pub fn with_min(mut self, column: impl Into<String>) -> Self {
        self.min.push(column.into());
        self
    }

    pub fn with_max(mut self, column: impl Into<String>) -> Self {
        self.max.push(column.into());
        self
    }
}
