//! Request and response values exchanged with the engine.
//!
//! A [`Request`] is an immutable value: the engine reads it once and never
//! mutates it. A [`Response`] carries either `data` (on success) or a
//! [`StructuredError`] (on failure), never both.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::StructuredError;
use crate::role::Role;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// An inbound request from an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub actor_id: String,
    pub role: Role,
    /// Request type, e.g. `"entity.register"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Caller wall-clock time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

impl Request {
    /// Build a request stamped with the current wall-clock time.
    ///
    /// The id is `"req-"` plus a BLAKE3 digest of the type, actor, role and
    /// payload, so the same script yields the same ids in every run. Two
    /// requests with identical content share an id; use
    /// [`with_id`](Self::with_id) when they must be told apart.
    pub fn new(
        kind: impl Into<String>,
        actor_id: impl Into<String>,
        role: Role,
        payload: serde_json::Value,
    ) -> Self {
        let kind = kind.into();
        let actor_id = actor_id.into();
        let id = content_id(&kind, &actor_id, role, &payload);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id,
            actor_id,
            role,
            kind,
            timestamp,
            payload,
        }
    }

    /// Override the id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

fn content_id(kind: &str, actor_id: &str, role: Role, payload: &serde_json::Value) -> String {
    let payload = payload.to_string();
    let mut hasher = blake3::Hasher::new();
    for part in [kind, actor_id, role.as_str(), payload.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    let hex = hasher.finalize().to_hex();
    format!("req-{}", &hex.as_str()[..16])
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<StructuredError>,
}

impl Response {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: StructuredError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    /// The error code, if this is a failure.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
