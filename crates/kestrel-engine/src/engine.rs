//! The engine façade.
//!
//! An [`Engine`] is a cheap, cloneable handle to one simulation instance.
//! All state lives behind a single `parking_lot::Mutex`, so the host and
//! the optional auto-tick driver serialize naturally; there is no internal
//! parallelism.
//!
//! # Lifecycle
//!
//! `Created → Running → Stopped`. [`create_engine`] (or
//! [`EngineBuilder::start`]) returns a running engine. [`Engine::stop`] is
//! idempotent: it discards pending actions, cancels and awaits the driver,
//! and emits `engine:stopped` exactly once. After that every mutating call
//! fails fast with [`EngineError::Stopped`] while read-only calls keep
//! working.
//!
//! # Events
//!
//! Events produced while the lock is held are queued and published after it
//! is released, so listeners may call straight back into the engine.
//! Executors must not: they already run under the lock and get an
//! [`ActionContext`](crate::scheduler::ActionContext) instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use kestrel_core::entity::{Attributes, Entity};
use kestrel_core::error::ErrorStatistics;
use kestrel_core::event::{names, EngineEvent, EventBus, Subscription};
use kestrel_core::metrics::MetricsSnapshot;
use kestrel_core::request::{Request, Response};
use kestrel_core::role::{CapabilityTable, PermissionEvaluator, Role};

use crate::config::EngineConfig;
use crate::logging;
use crate::router::RequestRouter;
use crate::scheduler::{
    ActionContext, ActionId, ActionScheduler, ActionSpec, Executor, ScheduledAction, TickReport,
};
use crate::snapshot::{self, EngineSnapshot};
use crate::world::SimWorld;
use crate::EngineError;

// ---------------------------------------------------------------------------
// EngineState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Created,
    Running,
    Stopped,
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

pub(crate) struct EngineCore {
    pub(crate) state: EngineState,
    pub(crate) scheduler: ActionScheduler,
    pub(crate) world: SimWorld,
    pub(crate) router: RequestRouter,
}

struct Shared {
    config: EngineConfig,
    core: Mutex<EngineCore>,
    bus: Arc<EventBus>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

// ---------------------------------------------------------------------------
// EngineBuilder
// ---------------------------------------------------------------------------

/// Construction-time wiring: config, capability table, executors and
/// listeners that must be in place before the first event.
pub struct EngineBuilder {
    config: EngineConfig,
    capabilities: CapabilityTable,
    executors: Vec<(String, Executor)>,
    listeners: Vec<(String, Arc<dyn Fn(&EngineEvent) + Send + Sync>)>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            capabilities: CapabilityTable::default(),
            executors: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Replace the default role → capability table.
    #[must_use]
    pub fn capabilities(mut self, table: CapabilityTable) -> Self {
        self.capabilities = table;
        self
    }

    #[must_use]
    pub fn executor<F>(mut self, action_type: &str, executor: F) -> Self
    where
        F: FnMut(&ScheduledAction, &mut ActionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.executors
            .push((action_type.to_owned(), Box::new(executor)));
        self
    }

    /// Subscribe before start, e.g. to observe `engine:started`.
    #[must_use]
    pub fn listener<F>(mut self, event: &str, handler: F) -> Self
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.listeners.push((event.to_owned(), Arc::new(handler)));
        self
    }

    /// Validate, wire and start the engine.
    pub async fn start(self) -> Result<Engine, EngineError> {
        self.build()
    }

    /// Synchronous form of [`start`](Self::start). Still needs a tokio
    /// runtime in scope when `tick_interval_ms > 0`.
    pub fn build(self) -> Result<Engine, EngineError> {
        let Self {
            config,
            capabilities,
            executors,
            listeners,
        } = self;
        config.validate()?;

        let runtime = match config.tick_interval_ms {
            0 => None,
            interval_ms => Some(
                Handle::try_current().map_err(|_| EngineError::NoRuntime { interval_ms })?,
            ),
        };

        let seed = config.seed_value().unwrap_or_else(rand::random);
        let world = SimWorld::new(seed);
        let mut scheduler = ActionScheduler::new();
        for (action_type, executor) in executors {
            scheduler.insert_executor(&action_type, executor);
        }

        let bus = Arc::new(EventBus::new());
        for (event, handler) in listeners {
            // Builder-registered listeners live as long as the bus.
            let _ = bus.subscribe(&event, move |e| handler(e));
        }

        let engine = Engine {
            shared: Arc::new(Shared {
                core: Mutex::new(EngineCore {
                    state: EngineState::Created,
                    scheduler,
                    world,
                    router: RequestRouter::new(PermissionEvaluator::new(capabilities)),
                }),
                bus,
                driver: Mutex::new(None),
                config,
            }),
        };

        let config = &engine.shared.config;
        engine.with_core(|core| {
            core.state = EngineState::Running;
            core.world.emit(
                names::ENGINE_STARTED,
                json!({
                    "id": config.id,
                    "tickIntervalMs": config.tick_interval_ms,
                    "seeded": config.deterministic_seed.is_some(),
                }),
            );
        });

        if let Some(handle) = runtime {
            let driver = spawn_driver(&handle, Arc::downgrade(&engine.shared), config.tick_interval_ms);
            *engine.shared.driver.lock() = Some(driver);
        }

        tracing::info!(
            engine = %config.id,
            tick_interval_ms = config.tick_interval_ms,
            seeded = config.deterministic_seed.is_some(),
            "engine started"
        );
        Ok(engine)
    }
}

/// Create and start an engine with the default capability table.
///
/// Also installs the crate's `tracing` subscriber at `config.log_level`
/// unless the host already installed one.
pub async fn create_engine(config: EngineConfig) -> Result<Engine, EngineError> {
    logging::init_tracing(config.log_level);
    EngineBuilder::new(config).start().await
}

fn spawn_driver(handle: &Handle, engine: Weak<Shared>, interval_ms: u64) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(shared) = engine.upgrade() else {
                break;
            };
            let engine = Engine { shared };
            match catch_unwind(AssertUnwindSafe(|| engine.tick(interval_ms))) {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    // Executors and listeners are isolated, so this is a bug
                    // in the engine itself. Keep the clock moving.
                    tracing::error!(engine = %engine.id(), "auto-tick panicked");
                }
            }
        }
        tracing::debug!("auto-tick driver exited");
    })
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Handle to a running (or stopped) engine. Clones share the same instance.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    // -- lock helpers -------------------------------------------------------

    /// Run `f` under the lock, then publish whatever it emitted.
    fn with_core<R>(&self, f: impl FnOnce(&mut EngineCore) -> R) -> R {
        let (result, events) = {
            let mut core = self.shared.core.lock();
            let result = f(&mut *core);
            (result, core.world.take_events())
        };
        for event in &events {
            self.shared.bus.publish(event);
        }
        result
    }

    fn with_running_core<R>(&self, f: impl FnOnce(&mut EngineCore) -> R) -> Result<R, EngineError> {
        self.with_core(|core| {
            if core.state == EngineState::Stopped {
                return Err(EngineError::Stopped {
                    id: self.shared.config.id.clone(),
                });
            }
            Ok(f(core))
        })
    }

    pub(crate) fn read_core<R>(&self, f: impl FnOnce(&EngineCore) -> R) -> R {
        f(&*self.shared.core.lock())
    }

    // -- identity -----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.shared.config.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> EngineState {
        self.read_core(|core| core.state)
    }

    // -- entities -----------------------------------------------------------

    /// Register an entity directly, bypassing the permission evaluator.
    /// `role` is recorded in the `entity:registered` event only.
    ///
    /// Returns `Ok(false)` if the id is already taken.
    pub fn register_entity(
        &self,
        id: &str,
        kind: &str,
        role: Role,
        attributes: Attributes,
    ) -> Result<bool, EngineError> {
        self.with_running_core(|core| core.world.register_entity(id, kind, role, attributes))
    }

    pub fn remove_entity(&self, id: &str) -> Result<Option<Entity>, EngineError> {
        self.with_running_core(|core| core.world.remove_entity(id))
    }

    /// Replace the attributes of `id` wholesale. Returns `Ok(false)` if the
    /// entity does not exist.
    pub fn replace_entity_attributes(
        &self,
        id: &str,
        attributes: Attributes,
    ) -> Result<bool, EngineError> {
        self.with_running_core(|core| core.world.replace_attributes(id, attributes).is_some())
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.read_core(|core| core.world.entities().get(id).cloned())
    }

    /// All entities, sorted by id.
    pub fn entities(&self) -> Vec<Entity> {
        self.read_core(|core| core.world.entities().iter().cloned().collect())
    }

    // -- scheduling ---------------------------------------------------------

    pub fn schedule_action(&self, spec: ActionSpec) -> Result<ActionId, EngineError> {
        self.with_running_core(|core| core.scheduler.schedule(spec, &mut core.world))
    }

    /// Advance virtual time by `advance_ms` and run every action now due.
    pub fn tick(&self, advance_ms: u64) -> Result<TickReport, EngineError> {
        self.with_running_core(|core| core.scheduler.tick(advance_ms, &mut core.world))
    }

    /// Handle for managing executors and inspecting the pending set.
    pub fn action_scheduler(&self) -> ActionSchedulerHandle {
        ActionSchedulerHandle {
            engine: self.clone(),
        }
    }

    pub fn virtual_time(&self) -> u64 {
        self.read_core(|core| core.world.now())
    }

    pub fn tick_count(&self) -> u64 {
        self.read_core(|core| core.world.tick_count())
    }

    // -- requests -----------------------------------------------------------

    /// Validate, permission-check and dispatch `request`.
    ///
    /// Every request-level failure comes back as a failed [`Response`];
    /// the only `Err` is [`EngineError::Stopped`].
    pub async fn request(&self, request: Request) -> Result<Response, EngineError> {
        self.handle_request(&request)
    }

    /// Synchronous core of [`request`](Self::request).
    pub fn handle_request(&self, request: &Request) -> Result<Response, EngineError> {
        self.with_running_core(|core| {
            let EngineCore {
                scheduler,
                world,
                router,
                ..
            } = core;
            router.route(request, scheduler, world)
        })
    }

    // -- events -------------------------------------------------------------

    /// Subscribe to events named `event`. Handlers run in registration order
    /// on the thread that triggered the event.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(event, handler)
    }

    pub fn listener_counts(&self) -> std::collections::BTreeMap<String, usize> {
        self.shared.bus.listener_counts()
    }

    // -- observation --------------------------------------------------------

    pub fn snapshot(&self) -> EngineSnapshot {
        self.read_core(|core| EngineSnapshot::capture(&core.scheduler, &core.world))
    }

    /// BLAKE3 hex digest of the full deterministic state. Excludes the id.
    pub fn state_hash(&self) -> String {
        let seed = self.shared.config.deterministic_seed.as_deref();
        self.read_core(|core| snapshot::state_hash(&core.scheduler, &core.world, seed))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.read_core(|core| core.world.metrics().snapshot())
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        self.read_core(|core| core.world.errors().statistics())
    }

    // -- shutdown -----------------------------------------------------------

    /// Stop the engine. Safe to call any number of times.
    ///
    /// When this resolves the auto-tick driver (if any) has finished and no
    /// further tick will fire.
    pub async fn stop(&self) {
        let id = &self.shared.config.id;
        let discarded = self.with_core(|core| {
            if core.state == EngineState::Stopped {
                return None;
            }
            core.state = EngineState::Stopped;
            let discarded = core.scheduler.clear(&mut core.world);
            core.world
                .metrics_mut()
                .increment_counter("actions.discarded", discarded as u64);
            core.world.emit(
                names::ENGINE_STOPPED,
                json!({ "id": id, "discardedActions": discarded }),
            );
            Some(discarded)
        });

        let driver = self.shared.driver.lock().take();
        if let Some(handle) = driver {
            handle.abort();
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    tracing::warn!(engine = %id, error = %err, "auto-tick driver ended abnormally");
                }
            }
        }

        if let Some(discarded) = discarded {
            tracing::info!(engine = %id, discarded_actions = discarded, "engine stopped");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.config.id)
            .field("state", &self.shared.core.try_lock().map(|core| core.state))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActionSchedulerHandle
// ---------------------------------------------------------------------------

/// Executor registration and pending-set inspection for one engine.
#[derive(Clone, Debug)]
pub struct ActionSchedulerHandle {
    engine: Engine,
}

impl ActionSchedulerHandle {
    /// Install the executor for `action_type`, replacing any previous one.
    /// Returns `Ok(true)` if one was replaced.
    pub fn register_executor<F>(&self, action_type: &str, executor: F) -> Result<bool, EngineError>
    where
        F: FnMut(&ScheduledAction, &mut ActionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.engine
            .with_running_core(|core| core.scheduler.register_executor(action_type, executor))
    }

    pub fn schedule(&self, spec: ActionSpec) -> Result<ActionId, EngineError> {
        self.engine.schedule_action(spec)
    }

    pub fn has_executor(&self, action_type: &str) -> bool {
        self.engine
            .read_core(|core| core.scheduler.has_executor(action_type))
    }

    pub fn executor_types(&self) -> Vec<String> {
        self.engine.read_core(|core| core.scheduler.executor_types())
    }

    pub fn pending_count(&self) -> usize {
        self.engine.read_core(|core| core.scheduler.pending_count())
    }

    /// Pending actions in execution order.
    pub fn pending_actions(&self) -> Vec<ScheduledAction> {
        self.engine
            .read_core(|core| core.scheduler.pending().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
