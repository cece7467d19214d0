//! Kestrel Core -- value types and leaf components of the simulation kernel.
//!
//! This crate holds everything the engine is built from that does not need a
//! clock or a scheduler: the structured error domain, the metrics collector,
//! the string-keyed event bus, the entity store, the role/capability
//! permission model, and the request/response values that cross the engine
//! boundary.
//!
//! # Quick Start
//!
//! ```
//! use kestrel_core::prelude::*;
//!
//! let evaluator = PermissionEvaluator::new(CapabilityTable::default());
//! assert_eq!(
//!     evaluator.evaluate(Role::Human, Capability::ENTITY_REGISTER),
//!     Decision::Allow
//! );
//! assert_eq!(
//!     evaluator.evaluate(Role::Simulant, Capability::ENTITY_REMOVE),
//!     Decision::Deny
//! );
//!
//! let mut registry = EntityRegistry::new();
//! assert!(registry.register(Entity::new("e1", "player", Default::default(), 0)));
//! assert!(!registry.register(Entity::new("e1", "npc", Default::default(), 0)));
//! assert_eq!(registry.count(), 1);
//! ```

#![deny(unsafe_code)]

pub mod entity;
pub mod error;
pub mod event;
pub mod metrics;
pub mod request;
pub mod role;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced when parsing core value types from strings.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A role name did not match any known [`Role`](role::Role).
    #[error("unknown role '{name}'. Known roles: [{known}]")]
    UnknownRole {
        name: String,
        known: String,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::entity::{Attributes, Entity, EntityRegistry};
    pub use crate::error::{codes, ErrorDomain, ErrorStatistics, StructuredError};
    pub use crate::event::{names, EngineEvent, EventBus, Subscription};
    pub use crate::metrics::{HistogramSnapshot, MetricsCollector, MetricsSnapshot};
    pub use crate::request::{Request, Response};
    pub use crate::role::{Capability, CapabilityTable, Decision, PermissionEvaluator, Role};
    pub use crate::CoreError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn registry_events_and_metrics_compose() {
        let bus = std::sync::Arc::new(EventBus::new());
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus.subscribe(names::ENTITY_REGISTERED, move |event| {
            sink.lock().push(event.payload["id"].clone());
        });

        let mut registry = EntityRegistry::new();
        let mut metrics = MetricsCollector::new();
        let entity = Entity::new("e1", "player", Attributes::new(), 0);
        assert!(registry.register(entity.clone()));
        metrics.set_gauge("entities", registry.count() as f64);
        bus.publish(&EngineEvent::new(
            names::ENTITY_REGISTERED,
            serde_json::to_value(&entity).unwrap(),
            0,
        ));

        assert_eq!(seen.lock().as_slice(), &[serde_json::json!("e1")]);
        assert_eq!(metrics.snapshot().gauges.get("entities"), Some(&1.0));
    }

    #[test]
    fn role_parse_error_lists_known_roles() {
        let err = "ADMIN".parse::<Role>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ADMIN"));
        assert!(msg.contains("HUMAN"));
    }

    #[test]
    fn error_domain_counts_router_style_failures() {
        let mut domain = ErrorDomain::new();
        let err = domain.create_error(codes::PERMISSION_DENIED, "denied", None);
        let response = Response::failure(err);
        assert!(!response.ok);
        assert_eq!(domain.statistics().total_errors, 1);
    }
}
