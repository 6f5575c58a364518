//! Declared collections and schema version of the local store.

use serde::{Deserialize, Serialize};

/// Tasks collection.
pub const TASKS: &str = "tasks";
/// Routines collection (exclusive `active` flag).
pub const ROUTINES: &str = "routines";
/// Time slots nested under routines.
pub const ROUTINE_SLOTS: &str = "routine_slots";
/// Courses collection.
pub const COURSES: &str = "courses";
/// User profile collection.
pub const PROFILE: &str = "profile";
/// Study materials collection.
pub const MATERIALS: &str = "materials";
/// Teachers collection.
pub const TEACHERS: &str = "teachers";

/// Link from a child collection to its parent collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    /// Parent collection name.
    pub collection: String,
    /// Field of the child record holding the parent id.
    pub field: String,
}

/// Declaration of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Collection name.
    pub name: String,
    /// Critical collections get `last_updated` stamped on every write and
    /// survive [`crate::Replica::clear_non_critical`].
    pub critical: bool,
    /// Boolean field that at most one record of the collection may have set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_field: Option<String>,
    /// Parent collection for nested entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
}

impl CollectionSpec {
    /// Declare a collection.
    #[must_use]
    pub fn new(name: impl Into<String>, critical: bool) -> Self {
        Self {
            name: name.into(),
            critical,
            exclusive_field: None,
            parent: None,
        }
    }

    /// Builder: mark `field` as mutually exclusive across the collection.
    #[must_use]
    pub fn with_exclusive_field(mut self, field: impl Into<String>) -> Self {
        self.exclusive_field = Some(field.into());
        self
    }

    /// Builder: nest this collection under `parent` via `field`.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>, field: impl Into<String>) -> Self {
        self.parent = Some(ParentLink {
            collection: parent.into(),
            field: field.into(),
        });
        self
    }
}

/// Versioned set of collections.
///
/// Raising the version may only add collections; the store upgrade never
/// touches collections that already exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema version.
    pub version: u32,
    /// Declared collections.
    pub collections: Vec<CollectionSpec>,
}

impl Schema {
    /// Create a schema.
    #[must_use]
    pub fn new(version: u32, collections: Vec<CollectionSpec>) -> Self {
        Self {
            version,
            collections,
        }
    }

    /// The collections of the task and routine manager.
    #[must_use]
    pub fn routine_manager() -> Self {
        Self::new(
            3,
            vec![
                CollectionSpec::new(TASKS, true),
                CollectionSpec::new(ROUTINES, true).with_exclusive_field("active"),
                CollectionSpec::new(ROUTINE_SLOTS, true).with_parent(ROUTINES, "routineId"),
                CollectionSpec::new(COURSES, true),
                CollectionSpec::new(PROFILE, false),
                CollectionSpec::new(MATERIALS, false),
                CollectionSpec::new(TEACHERS, false),
            ],
        )
    }

    /// Look up a collection declaration.
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Returns true if `name` is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.collection(name).is_some()
    }

    /// Returns true if `name` is declared critical.
    #[must_use]
    pub fn is_critical(&self, name: &str) -> bool {
        self.collection(name).is_some_and(|c| c.critical)
    }

    /// Collections nested under `parent`.
    pub fn children_of<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a CollectionSpec> {
        self.collections
            .iter()
            .filter(move |c| c.parent.as_ref().is_some_and(|p| p.collection == parent))
    }

    /// Collections without a parent; each one owns a reconciliation pass.
    pub fn top_level(&self) -> impl Iterator<Item = &CollectionSpec> {
        self.collections.iter().filter(|c| c.parent.is_none())
    }

    /// Names of all declared collections.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.name.clone()).collect()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::routine_manager()
    }
}
