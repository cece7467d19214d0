//! Engine snapshots and BLAKE3 state hashing.
//!
//! [`EngineSnapshot`] is the small, stable summary returned by
//! [`Engine::snapshot`](crate::engine::Engine::snapshot) and the
//! `engine.snapshot` request. Two runs with the same seed and call sequence
//! serialize to byte-identical snapshots.
//!
//! [`state_hash`] goes further: it digests everything that affects future
//! behaviour (entities with their attributes, pending actions, the virtual
//! clock, the tick counter and the seed) so that determinism can be checked
//! with a single string comparison. The engine id is not hashed, so two
//! differently named engines running the same script compare equal.

use serde::{Deserialize, Serialize};

use kestrel_core::entity::Entity;

use crate::scheduler::{ActionScheduler, ScheduledAction};
use crate::world::SimWorld;

// ---------------------------------------------------------------------------
// EngineSnapshot
// ---------------------------------------------------------------------------

/// Summary of engine state at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub entity_count: usize,
    /// Entity ids, sorted.
    pub entities: Vec<String>,
    pub scheduled: ScheduledSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSummary {
    pub total: usize,
}

impl EngineSnapshot {
    pub(crate) fn capture(scheduler: &ActionScheduler, world: &SimWorld) -> Self {
        let entities = world.entities().list_ids();
        Self {
            entity_count: entities.len(),
            entities,
            scheduled: ScheduledSummary {
                total: scheduler.pending_count(),
            },
        }
    }

    /// Compact JSON encoding. Identical snapshots encode to identical bytes.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("EngineSnapshot should always be JSON-serializable")
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// BLAKE3 hex digest (64 lowercase hex chars) of the deterministic state.
pub(crate) fn state_hash(
    scheduler: &ActionScheduler,
    world: &SimWorld,
    seed: Option<&str>,
) -> String {
    // Field order is fixed by the struct; maps inside are ordered.
    #[derive(Serialize)]
    struct HashableState<'a> {
        entities: Vec<&'a Entity>,
        pending: Vec<&'a ScheduledAction>,
        virtual_time: u64,
        tick_count: u64,
        seed: Option<&'a str>,
    }

    let hashable = HashableState {
        entities: world.entities().iter().collect(),
        pending: scheduler.pending().collect(),
        virtual_time: world.now(),
        tick_count: world.tick_count(),
        seed,
    };

    let json_bytes =
        serde_json::to_vec(&hashable).expect("engine state should always be JSON-serializable");

    blake3::hash(&json_bytes).to_hex().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
