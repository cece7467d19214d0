//! Mutable simulation state shared by the scheduler and the request router.
//!
//! [`SimWorld`] owns the entity registry, the virtual clock, the metrics
//! collector, the error domain and the seeded RNG. Every mutation that other
//! parties may want to observe queues an [`EngineEvent`] in an outbox; the
//! engine drains the outbox and publishes it once its lock is released.

use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde_json::{json, Value};

use kestrel_core::entity::{Attributes, Entity, EntityRegistry};
use kestrel_core::error::ErrorDomain;
use kestrel_core::event::{names, EngineEvent};
use kestrel_core::metrics::MetricsCollector;
use kestrel_core::role::Role;

/// Gauge tracking the number of registered entities.
pub const ENTITIES_GAUGE: &str = "entities";

pub struct SimWorld {
    entities: EntityRegistry,
    metrics: MetricsCollector,
    errors: ErrorDomain,
    rng: Pcg64,
    /// Virtual time in milliseconds. Only ever moves forward.
    now: u64,
    tick_count: u64,
    outbox: Vec<EngineEvent>,
}

impl SimWorld {
    /// Create an empty world whose RNG is seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            entities: EntityRegistry::new(),
            metrics: MetricsCollector::new(),
            errors: ErrorDomain::new(),
            rng: Pcg64::seed_from_u64(seed),
            now: 0,
            tick_count: 0,
            outbox: Vec::new(),
        }
    }

    // ---- Clock ----

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Advance the clock by `advance_ms` and count one tick. Returns the new time.
    pub(crate) fn advance(&mut self, advance_ms: u64) -> u64 {
        self.now = self.now.saturating_add(advance_ms);
        self.tick_count += 1;
        self.now
    }

    // ---- Entities ----

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    /// Register an entity at the current virtual time.
    ///
    /// Returns `false` and leaves the existing record untouched if `id` is
    /// already taken.
    pub fn register_entity(
        &mut self,
        id: &str,
        kind: &str,
        role: Role,
        attributes: Attributes,
    ) -> bool {
        if self.entities.contains(id) {
            tracing::debug!(entity_id = id, "duplicate entity registration rejected");
            return false;
        }
        let entity = Entity::new(id, kind, attributes, self.now);
        let mut payload = entity_payload(&entity);
        self.entities.register(entity);
        payload["role"] = json!(role);
        self.sync_entity_gauge();
        self.emit(names::ENTITY_REGISTERED, payload);
        true
    }

    pub fn remove_entity(&mut self, id: &str) -> Option<Entity> {
        let removed = self.entities.remove(id)?;
        self.sync_entity_gauge();
        self.emit(names::ENTITY_REMOVED, entity_payload(&removed));
        Some(removed)
    }

    /// Replace the attribute map of `id` wholesale.
    pub fn replace_attributes(&mut self, id: &str, attributes: Attributes) -> Option<Entity> {
        let updated = self.entities.replace_attributes(id, attributes)?.clone();
        self.emit(names::ENTITY_UPDATED, entity_payload(&updated));
        Some(updated)
    }

    fn sync_entity_gauge(&mut self) {
        let count = self.entities.count() as f64;
        self.metrics.set_gauge(ENTITIES_GAUGE, count);
    }

    // ---- Instrumentation ----

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut MetricsCollector {
        &mut self.metrics
    }

    pub fn errors(&self) -> &ErrorDomain {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorDomain {
        &mut self.errors
    }

    pub fn rng_mut(&mut self) -> &mut Pcg64 {
        &mut self.rng
    }

    // ---- Events ----

    /// Queue an event stamped with the current virtual time.
    pub fn emit(&mut self, name: &str, payload: Value) {
        self.outbox.push(EngineEvent::new(name, payload, self.now));
    }

    pub(crate) fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.outbox)
    }
}

impl std::fmt::Debug for SimWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimWorld")
            .field("entities", &self.entities.count())
            .field("now", &self.now)
            .field("tick_count", &self.tick_count)
            .field("queued_events", &self.outbox.len())
            .finish()
    }
}

pub(crate) fn entity_payload(entity: &Entity) -> Value {
    serde_json::to_value(entity).expect("Entity should always be JSON-serializable")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
