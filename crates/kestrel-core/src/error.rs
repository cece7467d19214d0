//! Structured errors and the per-engine error domain.
//!
//! Failures that reach a caller through a [`Response`](crate::request::Response)
//! are [`StructuredError`] values, never panics. Every structured error is
//! minted through an [`ErrorDomain`], which keeps running totals per code for
//! diagnostics.
//!
//! Error codes are open strings so that hosts can add their own; the codes the
//! engine itself emits are listed in [`codes`].
//!
//! ```
//! use kestrel_core::error::{codes, ErrorDomain};
//!
//! let mut domain = ErrorDomain::new();
//! let err = domain.create_error(codes::NOT_FOUND, "no entity 'e9'", None);
//! assert_eq!(err.code, "NOT_FOUND");
//!
//! let stats = domain.statistics();
//! assert_eq!(stats.total_errors, 1);
//! assert_eq!(stats.by_code["NOT_FOUND"], 1);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Built-in error codes.
pub mod codes {
    /// The request's role lacks the capability its type requires.
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    /// The request type is known but its payload is malformed.
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    /// The request type is not recognized.
    pub const UNSUPPORTED_REQUEST: &str = "UNSUPPORTED_REQUEST";
    /// An entity with the requested id already exists.
    pub const DUPLICATE_ENTITY: &str = "DUPLICATE_ENTITY";
    /// The referenced entity does not exist.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// A scheduled action's executor failed.
    pub const EXECUTOR_FAILED: &str = "EXECUTOR_FAILED";
    /// The engine has been stopped.
    pub const ENGINE_STOPPED: &str = "ENGINE_STOPPED";

    /// Every built-in code.
    pub const ENGINE_ERROR_CODES: &[&str] = &[
        PERMISSION_DENIED,
        VALIDATION_FAILED,
        UNSUPPORTED_REQUEST,
        DUPLICATE_ENTITY,
        NOT_FOUND,
        EXECUTOR_FAILED,
        ENGINE_STOPPED,
    ];
}

// ---------------------------------------------------------------------------
// StructuredError
// ---------------------------------------------------------------------------

/// A typed, inspectable failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct StructuredError {
    /// Opaque code, e.g. [`codes::PERMISSION_DENIED`].
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured context (request type, entity id, ...).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// ErrorDomain
// ---------------------------------------------------------------------------

/// Running totals of errors created through an [`ErrorDomain`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub by_code: BTreeMap<String, u64>,
}

/// Creates structured errors and counts them.
#[derive(Debug, Clone, Default)]
pub struct ErrorDomain {
    stats: ErrorStatistics,
}

impl ErrorDomain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a structured error and record it in the running statistics.
    pub fn create_error(
        &mut self,
        code: &str,
        message: impl Into<String>,
        context: Option<serde_json::Value>,
    ) -> StructuredError {
        self.stats.total_errors += 1;
        *self.stats.by_code.entry(code.to_owned()).or_insert(0) += 1;
        let message = message.into();
        tracing::debug!(code, %message, "structured error");
        StructuredError {
            code: code.to_owned(),
            message,
            context,
        }
    }

    /// Snapshot of the running statistics.
    pub fn statistics(&self) -> ErrorStatistics {
        self.stats.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
