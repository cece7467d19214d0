//! Deterministic replay with step recording and checkpoint verification.
//!
//! A run is described as a sequence of [`ScriptStep`]s. The
//! [`ReplayRecorder`] captures those steps together with periodic state hash
//! checkpoints, producing a [`ReplayLog`]. Replaying the log against a fresh
//! engine with the same seed and the same executors must reproduce every
//! checkpoint hash; the first mismatch is reported as a
//! [`ReplayDivergence`].
//!
//! # Recording
//!
//! ```
//! use kestrel_engine::prelude::*;
//!
//! let engine = EngineBuilder::new(EngineConfig::new("rec").with_seed("s")).build().unwrap();
//! let mut recorder = ReplayRecorder::for_engine(&engine, 2);
//!
//! recorder
//!     .apply(&engine, ScriptStep::RegisterEntity {
//!         id: "e1".into(),
//!         kind: "player".into(),
//!         role: Role::Human,
//!         attributes: Attributes::new(),
//!     })
//!     .unwrap();
//! recorder.apply(&engine, ScriptStep::Tick { advance_ms: 10 }).unwrap();
//!
//! let log = recorder.finish();
//! assert_eq!(log.total_steps, 2);
//! ```
//!
//! # Replaying
//!
//! ```
//! use kestrel_engine::prelude::*;
//! # let engine = EngineBuilder::new(EngineConfig::new("rec").with_seed("s")).build().unwrap();
//! # let mut recorder = ReplayRecorder::for_engine(&engine, 1);
//! # recorder.apply(&engine, ScriptStep::Tick { advance_ms: 10 }).unwrap();
//! # let log = recorder.finish();
//!
//! let fresh = EngineBuilder::new(EngineConfig::new("again").with_seed("s")).build().unwrap();
//! let result = replay(&fresh, &log).expect("log should be valid");
//! assert!(result.completed);
//! assert!(result.first_divergence.is_none());
//! ```

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use kestrel_core::entity::Attributes;
use kestrel_core::request::{Request, Response};
use kestrel_core::role::Role;

use crate::engine::{Engine, EngineState};
use crate::scheduler::ActionSpec;
use crate::EngineError;

// ---------------------------------------------------------------------------
// ScriptStep
// ---------------------------------------------------------------------------

/// One externally driven operation on an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ScriptStep {
    RegisterEntity {
        id: String,
        kind: String,
        role: Role,
        #[serde(default)]
        attributes: Attributes,
    },
    ScheduleAction {
        spec: ActionSpec,
    },
    Tick {
        advance_ms: u64,
    },
    Request {
        request: Request,
    },
}

/// Apply `step` to `engine`.
///
/// Returns the response for [`ScriptStep::Request`] steps and `None`
/// otherwise. Duplicate registrations and failed requests are not errors:
/// they are part of the recorded behaviour.
pub fn apply_step(engine: &Engine, step: &ScriptStep) -> Result<Option<Response>, EngineError> {
    match step {
        ScriptStep::RegisterEntity {
            id,
            kind,
            role,
            attributes,
        } => {
            engine.register_entity(id, kind, *role, attributes.clone())?;
            Ok(None)
        }
        ScriptStep::ScheduleAction { spec } => {
            engine.schedule_action(spec.clone())?;
            Ok(None)
        }
        ScriptStep::Tick { advance_ms } => {
            engine.tick(*advance_ms)?;
            Ok(None)
        }
        ScriptStep::Request { request } => engine.handle_request(request).map(Some),
    }
}

// ---------------------------------------------------------------------------
// ReplayLog
// ---------------------------------------------------------------------------

/// A complete replay log: the seed, the ordered steps and the checkpoints.
///
/// Fully serializable to JSON for storage or as a regression fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayLog {
    /// Seed the recording engine was configured with. Replay refuses to run
    /// against an engine with a different seed.
    pub deterministic_seed: Option<String>,
    /// Number of steps recorded.
    pub total_steps: u64,
    pub entries: Vec<ReplayEntry>,
}

// ---------------------------------------------------------------------------
// ReplayEntry
// ---------------------------------------------------------------------------

/// A single entry in a [`ReplayLog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all_fields = "camelCase")]
pub enum ReplayEntry {
    /// The step at position `index`.
    Step { index: u64, step: ScriptStep },
    /// State hash taken right after step `index` was applied.
    Checkpoint { index: u64, state_hash: String },
}

// ---------------------------------------------------------------------------
// ReplayResult
// ---------------------------------------------------------------------------

/// The outcome of replaying a [`ReplayLog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    /// Whether every step ran and every checkpoint matched.
    pub completed: bool,
    pub steps_replayed: u64,
    /// The first checkpoint whose hash did not match. `None` if all matched.
    pub first_divergence: Option<ReplayDivergence>,
}

/// Details about a determinism failure detected during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayDivergence {
    pub step: u64,
    pub expected_hash: String,
    pub actual_hash: String,
}

// ---------------------------------------------------------------------------
// ReplayRecorder
// ---------------------------------------------------------------------------

/// Records a scripted run into a [`ReplayLog`].
///
/// Either drive the engine yourself and call [`record`](Self::record) after
/// each step, or let [`apply`](Self::apply) do both.
#[derive(Debug)]
pub struct ReplayRecorder {
    log: ReplayLog,
    /// A checkpoint is taken after every `checkpoint_interval`-th step.
    /// `0` means "whenever a hash is supplied to `record`".
    checkpoint_interval: u64,
}

impl ReplayRecorder {
    pub fn new(deterministic_seed: Option<String>, checkpoint_interval: u64) -> Self {
        Self {
            log: ReplayLog {
                deterministic_seed,
                total_steps: 0,
                entries: Vec::new(),
            },
            checkpoint_interval,
        }
    }

    /// A recorder carrying `engine`'s seed.
    pub fn for_engine(engine: &Engine, checkpoint_interval: u64) -> Self {
        Self::new(engine.config().deterministic_seed.clone(), checkpoint_interval)
    }

    fn checkpoint_due(&self, index: u64) -> bool {
        self.checkpoint_interval == 0 || (index + 1) % self.checkpoint_interval == 0
    }

    /// Record a step that has just been applied. Returns its index.
    ///
    /// `state_hash` is the engine hash *after* the step. It becomes a
    /// checkpoint if the step falls on the interval; otherwise it is ignored.
    pub fn record(&mut self, step: ScriptStep, state_hash: Option<String>) -> u64 {
        let index = self.log.total_steps;
        self.log.total_steps += 1;
        self.log.entries.push(ReplayEntry::Step { index, step });

        if let Some(state_hash) = state_hash {
            if self.checkpoint_due(index) {
                self.log
                    .entries
                    .push(ReplayEntry::Checkpoint { index, state_hash });
            }
        }
        index
    }

    /// Apply `step` to `engine` and record it, hashing only when a
    /// checkpoint is due (after every step when the interval is `0`).
    pub fn apply(
        &mut self,
        engine: &Engine,
        step: ScriptStep,
    ) -> Result<Option<Response>, EngineError> {
        let response = apply_step(engine, &step)?;
        let index = self.log.total_steps;
        let hash = self.checkpoint_due(index).then(|| engine.state_hash());
        self.record(step, hash);
        Ok(response)
    }

    pub fn finish(self) -> ReplayLog {
        self.log
    }
}

// ---------------------------------------------------------------------------
// replay()
// ---------------------------------------------------------------------------

/// Replay `log` against `engine`, verifying determinism at each checkpoint.
///
/// # Errors
///
/// Returns an error if the log is malformed (gaps or duplicates in the step
/// sequence, checkpoints out of order or out of range), if its seed differs
/// from the engine's, or if the engine is not fresh. All of this is checked
/// *before* the engine is touched. An error while applying a step (the
/// engine was stopped mid-replay) is also returned.
pub fn replay(engine: &Engine, log: &ReplayLog) -> Result<ReplayResult, anyhow::Error> {
    // Step 1: Validate the log and the engine BEFORE mutating anything.
    let mut steps: Vec<&ScriptStep> = Vec::new();
    let mut checkpoints: BTreeMap<u64, &str> = BTreeMap::new();
    let mut last_checkpoint: Option<u64> = None;

    for entry in &log.entries {
        match entry {
            ReplayEntry::Step { index, step } => {
                let expected = steps.len() as u64;
                if *index != expected {
                    anyhow::bail!("replay log step {index} found where step {expected} was expected");
                }
                steps.push(step);
            }
            ReplayEntry::Checkpoint { index, state_hash } => {
                if let Some(prev) = last_checkpoint {
                    if *index <= prev {
                        anyhow::bail!(
                            "replay log checkpoint {index} is not after previous checkpoint {prev}"
                        );
                    }
                }
                last_checkpoint = Some(*index);
                checkpoints.insert(*index, state_hash.as_str());
            }
        }
    }

    if steps.len() as u64 != log.total_steps {
        anyhow::bail!(
            "replay log declares {} steps but contains {}",
            log.total_steps,
            steps.len()
        );
    }
    if let Some(index) = last_checkpoint.filter(|i| *i >= log.total_steps) {
        anyhow::bail!(
            "replay log checkpoint {index} is beyond the last step ({})",
            log.total_steps
        );
    }

    let engine_seed = engine.config().deterministic_seed.as_deref();
    if engine_seed != log.deterministic_seed.as_deref() {
        anyhow::bail!(
            "replay log was recorded with seed {:?} but engine '{}' uses {:?}",
            log.deterministic_seed,
            engine.id(),
            engine_seed
        );
    }

    if engine.state() != EngineState::Running {
        anyhow::bail!("engine '{}' is not running", engine.id());
    }
    if engine.tick_count() != 0
        || engine.virtual_time() != 0
        || engine.snapshot().entity_count != 0
        || engine.action_scheduler().pending_count() != 0
    {
        anyhow::bail!("engine '{}' is not fresh; replay needs an untouched engine", engine.id());
    }

    // Step 2: Apply steps, checking each checkpoint right after its step.
    let mut steps_replayed: u64 = 0;
    for (index, step) in (0u64..).zip(steps) {
        apply_step(engine, step).with_context(|| format!("replay step {index} failed"))?;
        steps_replayed += 1;

        if let Some(expected_hash) = checkpoints.get(&index) {
            let actual_hash = engine.state_hash();
            if actual_hash != *expected_hash {
                tracing::warn!(
                    engine = %engine.id(),
                    step = index,
                    expected = %expected_hash,
                    actual = %actual_hash,
                    "replay diverged"
                );
                return Ok(ReplayResult {
                    completed: false,
                    steps_replayed,
                    first_divergence: Some(ReplayDivergence {
                        step: index,
                        expected_hash: (*expected_hash).to_owned(),
                        actual_hash,
                    }),
                });
            }
        }
    }

    Ok(ReplayResult {
        completed: true,
        steps_replayed,
        first_divergence: None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineBuilder;

    fn engine(seed: &str) -> Engine {
        EngineBuilder::new(EngineConfig::new("t").with_seed(seed))
            .build()
            .unwrap()
    }

    fn register(id: &str) -> ScriptStep {
        ScriptStep::RegisterEntity {
            id: id.into(),
            kind: "npc".into(),
            role: Role::System,
            attributes: Attributes::new(),
        }
    }

    #[test]
    fn recorder_checkpoints_on_interval() {
        let mut recorder = ReplayRecorder::new(None, 2);
        for i in 0..5 {
            recorder.record(ScriptStep::Tick { advance_ms: 1 }, Some(format!("h{i}")));
        }
        let log = recorder.finish();
        let checkpoints: Vec<u64> = log
            .entries
            .iter()
            .filter_map(|e| match e {
                ReplayEntry::Checkpoint { index, .. } => Some(*index),
                ReplayEntry::Step { .. } => None,
            })
            .collect();
        assert_eq!(checkpoints, vec![1, 3]);
        assert_eq!(log.total_steps, 5);
    }

    #[test]
    fn interval_zero_checkpoints_every_supplied_hash() {
        let mut recorder = ReplayRecorder::new(None, 0);
        recorder.record(ScriptStep::Tick { advance_ms: 1 }, None);
        recorder.record(ScriptStep::Tick { advance_ms: 1 }, Some("h".into()));
        let log = recorder.finish();
        assert_eq!(log.entries.len(), 3);
    }

    #[test]
    fn script_step_wire_shape() {
        let json = serde_json::to_value(ScriptStep::Tick { advance_ms: 25 }).unwrap();
        assert_eq!(json, serde_json::json!({ "op": "tick", "advanceMs": 25 }));

        let back: ScriptStep =
            serde_json::from_str(r#"{ "op": "registerEntity", "id": "a", "kind": "npc", "role": "SYSTEM" }"#)
                .unwrap();
        assert_eq!(back, register("a"));
    }

    #[test]
    fn gap_in_steps_is_rejected_before_mutation() {
        let log = ReplayLog {
            deterministic_seed: Some("s".into()),
            total_steps: 2,
            entries: vec![
                ReplayEntry::Step { index: 0, step: register("a") },
                ReplayEntry::Step { index: 2, step: register("b") },
            ],
        };
        let target = engine("s");
        assert!(replay(&target, &log).is_err());
        assert_eq!(target.snapshot().entity_count, 0);
    }

    #[test]
    fn seed_mismatch_is_rejected() {
        let log = ReplayLog {
            deterministic_seed: Some("a".into()),
            total_steps: 0,
            entries: Vec::new(),
        };
        let err = replay(&engine("b"), &log).unwrap_err();
        assert!(err.to_string().contains("seed"));
    }

    #[test]
    fn stale_engine_is_rejected() {
        let log = ReplayLog {
            deterministic_seed: Some("s".into()),
            total_steps: 0,
            entries: Vec::new(),
        };
        let target = engine("s");
        target.tick(1).unwrap();
        assert!(replay(&target, &log).is_err());
    }

    #[test]
    fn out_of_order_checkpoints_are_rejected() {
        let log = ReplayLog {
            deterministic_seed: None,
            total_steps: 2,
            entries: vec![
                ReplayEntry::Step { index: 0, step: register("a") },
                ReplayEntry::Step { index: 1, step: register("b") },
                ReplayEntry::Checkpoint { index: 1, state_hash: "x".into() },
                ReplayEntry::Checkpoint { index: 0, state_hash: "y".into() },
            ],
        };
        let target = EngineBuilder::new(EngineConfig::new("t")).build().unwrap();
        assert!(replay(&target, &log).is_err());
    }
}
