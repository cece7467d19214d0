//! Entity records and the registry that owns them.
//!
//! An [`Entity`] is identified by a caller-chosen string id that stays unique
//! for the lifetime of one engine. The [`EntityRegistry`] rejects duplicate
//! registrations instead of overwriting them, and keeps records in a
//! `BTreeMap` so that iteration, id listings, and serialized output are
//! ordered by id and therefore stable across runs.
//!
//! The registry is a plain store. Publishing `entity:*` events and updating
//! the `entities` gauge is the job of the engine layer that wraps it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Free-form entity attributes. Ordered for deterministic serialization.
pub type Attributes = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A registered simulation entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique, immutable identifier.
    pub id: String,
    /// Free-form classification, e.g. `"player"`, `"npc"`.
    pub kind: String,
    /// Attributes, replaced wholesale on update (never deep-merged).
    pub attributes: Attributes,
    /// Virtual-clock time (ms) at which the entity was registered.
    pub registered_at: u64,
}

impl Entity {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        attributes: Attributes,
        registered_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            attributes,
            registered_at,
        }
    }
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

/// Owns every entity record of one engine instance.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, Entity>,
}

impl EntityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }

    /// Store `entity` if its id is not taken.
    ///
    /// Returns `false` and leaves the registry untouched when an entity with
    /// the same id already exists.
    pub fn register(&mut self, entity: Entity) -> bool {
        if self.entities.contains_key(&entity.id) {
            return false;
        }
        self.entities.insert(entity.id.clone(), entity);
        true
    }

    /// Remove and return the entity with `id`, if present.
    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        self.entities.remove(id)
    }

    /// Replace the attributes of `id` wholesale.
    ///
    /// Returns the updated record, or `None` if the entity does not exist.
    pub fn replace_attributes(&mut self, id: &str, attributes: Attributes) -> Option<&Entity> {
        let entity = self.entities.get_mut(id)?;
        entity.attributes = attributes;
        Some(entity)
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Number of registered entities.
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    /// All entity ids, sorted.
    pub fn list_ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    /// All entities, sorted by id.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
