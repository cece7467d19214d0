//! Virtual-time action scheduler.
//!
//! Actions are queued with [`ActionScheduler::schedule`] and executed by
//! [`ActionScheduler::tick`], which advances the virtual clock and runs every
//! action whose `run_at` has been reached.
//!
//! # Ordering
//!
//! Due actions run in a total order: **priority descending**, then **`run_at`
//! ascending**, then **insertion sequence ascending**. The pending set is a
//! `BTreeMap` keyed on exactly that tuple, so iteration order is execution
//! order. A second index ordered by `run_at` finds the due actions without
//! walking the backlog, so a tick with nothing due costs one lookup.
//!
//! # Batches
//!
//! The set of due actions is fixed when a tick begins. Actions that an
//! executor schedules through its [`ActionContext`] are inserted after the
//! batch completes and become eligible on the next tick at the earliest, so
//! a single tick never runs more actions than were due when it started.
//!
//! # Failures
//!
//! An executor that returns `Err` or panics does not abort the batch. The
//! failure is recorded as `EXECUTOR_FAILED`, counted in `actions.failed`,
//! announced as `action:failed`, and the next action runs.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use kestrel_core::entity::{Attributes, Entity};
use kestrel_core::error::codes;
use kestrel_core::event::names;
use kestrel_core::metrics::MetricsCollector;
use kestrel_core::role::Role;

use crate::world::SimWorld;

/// Engine-assigned action identifier, `"action-<n>"`.
pub type ActionId = String;

/// Callback that performs one action type.
pub type Executor =
    Box<dyn FnMut(&ScheduledAction, &mut ActionContext<'_>) -> anyhow::Result<()> + Send>;

/// Gauge tracking the number of pending actions.
pub const PENDING_GAUGE: &str = "scheduler.pending";

// ---------------------------------------------------------------------------
// ActionSpec
// ---------------------------------------------------------------------------

/// What to schedule. The scheduler assigns the id and insertion sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub action_type: String,
    /// Virtual time (ms) at which the action becomes due. Values in the past
    /// are due on the next tick.
    #[serde(default)]
    pub run_at: u64,
    #[serde(default)]
    pub payload: Value,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
}

impl ActionSpec {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            run_at: 0,
            payload: Value::Null,
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_run_at(mut self, run_at: u64) -> Self {
        self.run_at = run_at;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// ScheduledAction
// ---------------------------------------------------------------------------

/// An action sitting in (or just taken from) the pending set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledAction {
    pub id: ActionId,
    pub run_at: u64,
    pub action_type: String,
    pub payload: Value,
    pub priority: i32,
    pub sequence: u64,
}

impl ScheduledAction {
    fn from_spec(spec: ActionSpec, sequence: u64) -> Self {
        Self {
            id: format!("action-{sequence}"),
            run_at: spec.run_at,
            action_type: spec.action_type,
            payload: spec.payload,
            priority: spec.priority,
            sequence,
        }
    }

    fn key(&self) -> ScheduleKey {
        ScheduleKey {
            priority: Reverse(self.priority),
            run_at: self.run_at,
            sequence: self.sequence,
        }
    }
}

/// Field order defines execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduleKey {
    priority: Reverse<i32>,
    run_at: u64,
    sequence: u64,
}

// ---------------------------------------------------------------------------
// TickReport
// ---------------------------------------------------------------------------

/// Outcome of one [`ActionScheduler::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    /// Actions taken from the pending set this tick, including failed ones
    /// and those without an executor.
    pub actions_executed: usize,
    pub virtual_time: u64,
}

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

/// The view of the engine an executor gets while it runs.
///
/// Entity changes and emitted events take effect immediately. Actions
/// scheduled here are held back until the current batch finishes.
pub struct ActionContext<'a> {
    world: &'a mut SimWorld,
    follow_ups: &'a mut Vec<ScheduledAction>,
    next_sequence: &'a mut u64,
}

impl<'a> ActionContext<'a> {
    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.world.now()
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.world.entities().get(id)
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.world.entities().list_ids()
    }

    /// Register an entity on behalf of the engine (`SYSTEM` role).
    pub fn register_entity(&mut self, id: &str, kind: &str, attributes: Attributes) -> bool {
        self.world.register_entity(id, kind, Role::System, attributes)
    }

    pub fn remove_entity(&mut self, id: &str) -> Option<Entity> {
        self.world.remove_entity(id)
    }

    pub fn replace_attributes(&mut self, id: &str, attributes: Attributes) -> Option<Entity> {
        self.world.replace_attributes(id, attributes)
    }

    /// Schedule a follow-up action. It is assigned an id now but joins the
    /// pending set only after the current batch completes.
    pub fn schedule(&mut self, spec: ActionSpec) -> ActionId {
        let action = ScheduledAction::from_spec(spec, *self.next_sequence);
        *self.next_sequence += 1;
        let id = action.id.clone();
        self.follow_ups.push(action);
        id
    }

    /// Emit a custom event, delivered to listeners after the tick returns.
    pub fn emit(&mut self, name: &str, payload: Value) {
        self.world.emit(name, payload);
    }

    /// The engine's seeded RNG. Draws advance the shared stream.
    pub fn rng(&mut self) -> &mut Pcg64 {
        self.world.rng_mut()
    }

    pub fn metrics(&mut self) -> &mut MetricsCollector {
        self.world.metrics_mut()
    }
}

// ---------------------------------------------------------------------------
// ActionScheduler
// ---------------------------------------------------------------------------

/// Pending actions plus the executor table.
pub struct ActionScheduler {
    pending: BTreeMap<ScheduleKey, ScheduledAction>,
    /// The keys of `pending`, ordered by `run_at` first.
    by_run_at: BTreeSet<(u64, ScheduleKey)>,
    executors: BTreeMap<String, Executor>,
    next_sequence: u64,
}

impl ActionScheduler {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            by_run_at: BTreeSet::new(),
            executors: BTreeMap::new(),
            next_sequence: 1,
        }
    }

    /// Install the executor for `action_type`. Returns `true` if it replaced
    /// an existing one.
    pub fn register_executor<F>(&mut self, action_type: &str, executor: F) -> bool
    where
        F: FnMut(&ScheduledAction, &mut ActionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.insert_executor(action_type, Box::new(executor))
    }

    pub(crate) fn insert_executor(&mut self, action_type: &str, executor: Executor) -> bool {
        self.executors
            .insert(action_type.to_owned(), executor)
            .is_some()
    }

    pub fn has_executor(&self, action_type: &str) -> bool {
        self.executors.contains_key(action_type)
    }

    /// Registered action types, sorted.
    pub fn executor_types(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }

    /// Queue an action. It never runs before the next [`tick`](Self::tick).
    pub fn schedule(&mut self, spec: ActionSpec, world: &mut SimWorld) -> ActionId {
        let action = ScheduledAction::from_spec(spec, self.next_sequence);
        self.next_sequence += 1;
        let id = action.id.clone();
        self.enqueue(action, world);
        id
    }

    fn enqueue(&mut self, action: ScheduledAction, world: &mut SimWorld) {
        tracing::trace!(action_id = %action.id, run_at = action.run_at, "action scheduled");
        let payload = json!({
            "actionId": action.id,
            "actionType": action.action_type,
            "runAt": action.run_at,
            "priority": action.priority,
        });
        let key = action.key();
        self.by_run_at.insert((action.run_at, key));
        self.pending.insert(key, action);
        world.metrics_mut().increment_counter("actions.scheduled", 1);
        world.emit(names::ACTION_SCHEDULED, payload);
        self.sync_pending_gauge(world);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending actions in execution order.
    pub fn pending(&self) -> impl Iterator<Item = &ScheduledAction> {
        self.pending.values()
    }

    /// Drop every pending action. Returns how many were discarded.
    pub fn clear(&mut self, world: &mut SimWorld) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        self.by_run_at.clear();
        self.sync_pending_gauge(world);
        discarded
    }

    /// Advance the clock by `advance_ms` and run everything now due.
    pub fn tick(&mut self, advance_ms: u64, world: &mut SimWorld) -> TickReport {
        let tick_start = Instant::now();
        let now = world.advance(advance_ms);
        world.metrics_mut().increment_counter("ticks", 1);

        // Phase 1: Fix the batch. Nothing scheduled from here on can join it.
        let due = self.take_due(now);
        if due.is_empty() {
            return TickReport {
                actions_executed: 0,
                virtual_time: now,
            };
        }

        // Phase 2: Run each due action, isolating failures.
        let mut follow_ups = Vec::new();
        for action in &due {
            let outcome = match self.executors.get_mut(&action.action_type) {
                Some(executor) => {
                    let mut ctx = ActionContext {
                        world: &mut *world,
                        follow_ups: &mut follow_ups,
                        next_sequence: &mut self.next_sequence,
                    };
                    run_executor(executor, action, &mut ctx)
                }
                None => Ok(()),
            };
            match outcome {
                Ok(()) => {
                    tracing::trace!(action_id = %action.id, action_type = %action.action_type, "action executed");
                    world.metrics_mut().increment_counter("actions.executed", 1);
                    world.emit(
                        names::ACTION_EXECUTED,
                        json!({ "actionId": action.id, "actionType": action.action_type }),
                    );
                }
                Err(reason) => record_failure(world, action, &reason),
            }
        }

        // Phase 3: Admit follow-ups for later ticks.
        for action in follow_ups {
            self.enqueue(action, world);
        }
        self.sync_pending_gauge(world);

        // Wall-clock time stays out of the metrics so seeded runs compare equal.
        world
            .metrics_mut()
            .record_histogram("tick.actions", due.len() as f64);
        tracing::debug!(
            virtual_time = now,
            actions = due.len(),
            elapsed_us = tick_start.elapsed().as_micros() as u64,
            "tick complete"
        );

        TickReport {
            actions_executed: due.len(),
            virtual_time: now,
        }
    }

    fn take_due(&mut self, now: u64) -> Vec<ScheduledAction> {
        let mut keys: Vec<ScheduleKey> = self
            .by_run_at
            .iter()
            .take_while(|(run_at, _)| *run_at <= now)
            .map(|(_, key)| *key)
            .collect();
        if keys.is_empty() {
            return Vec::new();
        }
        keys.sort_unstable();
        keys.iter()
            .filter_map(|key| {
                self.by_run_at.remove(&(key.run_at, *key));
                self.pending.remove(key)
            })
            .collect()
    }

    fn sync_pending_gauge(&self, world: &mut SimWorld) {
        world
            .metrics_mut()
            .set_gauge(PENDING_GAUGE, self.pending.len() as f64);
    }
}

impl Default for ActionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionScheduler")
            .field("pending", &self.pending.len())
            .field("executors", &self.executor_types())
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

fn run_executor(
    executor: &mut Executor,
    action: &ScheduledAction,
    ctx: &mut ActionContext<'_>,
) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| executor(action, ctx))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "executor panicked".to_owned());
            Err(format!("panic: {message}"))
        }
    }
}

fn record_failure(world: &mut SimWorld, action: &ScheduledAction, reason: &str) {
    tracing::warn!(
        action_id = %action.id,
        action_type = %action.action_type,
        code = codes::EXECUTOR_FAILED,
        reason,
        "action executor failed"
    );
    let context = json!({ "actionId": action.id, "actionType": action.action_type });
    let error = world.errors_mut().create_error(
        codes::EXECUTOR_FAILED,
        format!("executor for '{}' failed: {reason}", action.action_type),
        Some(context),
    );
    world.metrics_mut().increment_counter("actions.failed", 1);
    world.emit(
        names::ACTION_FAILED,
        json!({
            "actionId": action.id,
            "actionType": action.action_type,
            "error": error,
        }),
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
