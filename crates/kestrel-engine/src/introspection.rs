//! Read-only debug view of an engine.
//!
//! [`DebugIntrospection::debug_snapshot`] gathers everything a developer
//! would want when something looks wrong: engine identity and clock, all
//! entities, the pending queue in execution order, registered executors,
//! metrics, error statistics and listener counts. It works on stopped
//! engines too.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use kestrel_core::entity::Entity;
use kestrel_core::error::ErrorStatistics;
use kestrel_core::metrics::MetricsSnapshot;

use crate::config::LogLevel;
use crate::engine::{Engine, EngineState};
use crate::scheduler::ScheduledAction;
use crate::snapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSnapshot {
    /// Wall-clock capture time, ms since the Unix epoch.
    pub timestamp: u64,
    pub engine: EngineInfo,
    pub entities: Vec<Entity>,
    pub scheduled: ScheduledDebug,
    pub metrics: MetricsSnapshot,
    pub errors: ErrorStatistics,
    /// Listener count per event name.
    pub listeners: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineInfo {
    pub id: String,
    pub state: EngineState,
    pub virtual_time: u64,
    pub tick_count: u64,
    pub tick_interval_ms: u64,
    pub log_level: LogLevel,
    pub seeded: bool,
    pub state_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledDebug {
    pub total: usize,
    /// Pending actions in execution order.
    pub pending: Vec<ScheduledAction>,
    /// Action types with a registered executor.
    pub executors: Vec<String>,
}

pub struct DebugIntrospection<'a> {
    engine: &'a Engine,
}

/// Shorthand for [`DebugIntrospection::new`].
pub fn create_debug_introspection(engine: &Engine) -> DebugIntrospection<'_> {
    DebugIntrospection::new(engine)
}

impl<'a> DebugIntrospection<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Capture everything under a single lock acquisition, so the parts are
    /// mutually consistent.
    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let config = self.engine.config();
        let listeners = self.engine.listener_counts();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        self.engine.read_core(|core| {
            let world = &core.world;
            let pending: Vec<ScheduledAction> = core.scheduler.pending().cloned().collect();
            DebugSnapshot {
                timestamp,
                engine: EngineInfo {
                    id: config.id.clone(),
                    state: core.state,
                    virtual_time: world.now(),
                    tick_count: world.tick_count(),
                    tick_interval_ms: config.tick_interval_ms,
                    log_level: config.log_level,
                    seeded: config.deterministic_seed.is_some(),
                    state_hash: snapshot::state_hash(
                        &core.scheduler,
                        world,
                        config.deterministic_seed.as_deref(),
                    ),
                },
                entities: world.entities().iter().cloned().collect(),
                scheduled: ScheduledDebug {
                    total: pending.len(),
                    pending,
                    executors: core.scheduler.executor_types(),
                },
                metrics: world.metrics().snapshot(),
                errors: world.errors().statistics(),
                listeners,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineBuilder;
    use crate::scheduler::ActionSpec;
    use kestrel_core::entity::Attributes;
    use kestrel_core::event::names;
    use kestrel_core::role::Role;

    #[test]
    fn snapshot_reflects_engine() {
        let engine = EngineBuilder::new(EngineConfig::new("dbg").with_seed("s"))
            .executor("wave", |_, _| Ok(()))
            .build()
            .unwrap();
        engine
            .register_entity("e1", "player", Role::Human, Attributes::new())
            .unwrap();
        engine
            .schedule_action(ActionSpec::new("wave").with_run_at(10))
            .unwrap();
        let _sub = engine.on(names::ACTION_EXECUTED, |_| {});

        let snap = create_debug_introspection(&engine).debug_snapshot();
        assert_eq!(snap.engine.id, "dbg");
        assert_eq!(snap.engine.state, EngineState::Running);
        assert!(snap.engine.seeded);
        assert_eq!(snap.engine.state_hash, engine.state_hash());
        assert_eq!(snap.entities.len(), 1);
        assert_eq!(snap.scheduled.total, 1);
        assert_eq!(snap.scheduled.pending[0].id, "action-1");
        assert_eq!(snap.scheduled.executors, vec!["wave"]);
        assert_eq!(snap.listeners[names::ACTION_EXECUTED], 1);
        assert!(snap.timestamp > 0);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["engine"]["virtualTime"], 0);
        assert_eq!(json["engine"]["logLevel"], "info");
    }
}
