//! Collection definitions and their compiled form.

pub mod compiled;
pub mod definition;
pub mod field;
pub mod registry;

pub use compiled::Collection;
pub use definition::CollectionDefinition;
pub use field::{FieldSpec, IndexSpec};
pub use registry::Registry;

/// Behavior toggles for a collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionOptions {
    /// Maintain `created_at` / `updated_at` automatically.
    pub timestamps: bool,
    /// Deletes set `deleted_at` instead of removing the row.
    pub soft_delete: bool,
    /// Keep version history when set.
    pub versions: Option<VersionSettings>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            timestamps: true,
            soft_delete: false,
            versions: None,
        }
    }
}

/// Version-history settings.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct VersionSettings {
    /// Oldest versions are pruned past this count. Unset keeps everything.
    pub max_versions: Option<u32>,
}

impl VersionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_versions(mut self, max: u32) -> Self {
        self.max_versions = Some(max);
        self
    }
}
