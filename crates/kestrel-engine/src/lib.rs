//! Kestrel Engine -- deterministic simulation kernel with a virtual clock,
//! capability-checked requests, and a priority-ordered action scheduler.
//!
//! This crate builds on [`kestrel_core`] to provide the engine itself: the
//! [`Engine`](engine::Engine) façade that owns entities and the virtual
//! clock, the [`ActionScheduler`](scheduler::ActionScheduler) driven by
//! `tick`, the [`RequestRouter`](router::RequestRouter) that validates and
//! permission-checks requests, plus snapshotting, replay, and debug
//! introspection.
//!
//! # Quick Start
//!
//! ```
//! use kestrel_engine::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), EngineError> {
//! let engine = create_engine(EngineConfig::new("demo").with_seed("s1")).await?;
//!
//! assert!(engine.register_entity("e1", "player", Role::Human, Attributes::new())?);
//!
//! let reply = engine
//!     .request(Request::new("bogus.op", "e1", Role::Human, serde_json::json!({})))
//!     .await?;
//! assert_eq!(reply.error_code(), Some(codes::UNSUPPORTED_REQUEST));
//!
//! engine.schedule_action(ActionSpec::new("wave").with_run_at(50))?;
//! assert_eq!(engine.tick(25)?.actions_executed, 0);
//! assert_eq!(engine.tick(50)?.actions_executed, 1);
//!
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod introspection;
pub mod logging;
pub mod replay;
pub mod router;
pub mod scheduler;
pub mod snapshot;
pub mod world;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the core crate for convenience.
pub use kestrel_core;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that escape the engine boundary.
///
/// Everything reachable through [`Engine::request`](engine::Engine::request)
/// is recovered into a [`Response`](kestrel_core::request::Response); only
/// construction failures and use of a stopped engine surface here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine has been stopped; mutating calls are rejected.
    #[error("engine '{id}' is stopped")]
    Stopped {
        id: String,
    },

    /// The configuration failed validation or could not be parsed.
    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    /// Automatic ticking was requested outside a tokio runtime.
    #[error("tickIntervalMs = {interval_ms} requires a running tokio runtime for the auto-tick driver")]
    NoRuntime {
        interval_ms: u64,
    },
}

impl EngineError {
    /// The structured error code a host should report for this error.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Stopped { .. } => kestrel_core::error::codes::ENGINE_STOPPED,
            EngineError::InvalidConfig(_) | EngineError::NoRuntime { .. } => {
                kestrel_core::error::codes::VALIDATION_FAILED
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the core prelude.
    pub use kestrel_core::prelude::*;

    pub use crate::config::{EngineConfig, LogLevel};
    pub use crate::engine::{create_engine, ActionSchedulerHandle, Engine, EngineBuilder, EngineState};
    pub use crate::introspection::{create_debug_introspection, DebugIntrospection, DebugSnapshot};
    pub use crate::replay::{
        apply_step, replay, ReplayDivergence, ReplayEntry, ReplayLog, ReplayRecorder, ReplayResult,
        ScriptStep,
    };
    pub use crate::router::{RequestKind, RequestRouter};
    pub use crate::scheduler::{
        ActionContext, ActionId, ActionScheduler, ActionSpec, Executor, ScheduledAction, TickReport,
    };
    pub use crate::snapshot::{EngineSnapshot, ScheduledSummary};
    pub use crate::world::SimWorld;
    pub use crate::EngineError;
}
