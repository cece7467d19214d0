//! Roles, capabilities, and the permission evaluator.
//!
//! Every request carries a [`Role`]. Each request type requires exactly one
//! [`Capability`]; the [`PermissionEvaluator`] decides whether a role holds it
//! by consulting an immutable [`CapabilityTable`] supplied at engine
//! construction.
//!
//! Roles are actor classifications used only for permission lookup. They
//! are never stored on entities.
//!
//! # Default table
//!
//! | Role | Capabilities |
//! |------|--------------|
//! | `SYSTEM` | all |
//! | `HUMAN` | `ENTITY_READ`, `ENTITY_REGISTER`, `SCHEDULE_ACTION` |
//! | `SIMULANT` | `ENTITY_READ`, `SCHEDULE_ACTION` |
//! | `OBSERVER` | `ENTITY_READ`, `ENGINE_INTROSPECT` |
//!
//! # Example
//!
//! ```
//! use kestrel_core::role::{Capability, CapabilityTable, Decision, PermissionEvaluator, Role};
//!
//! let table = CapabilityTable::default()
//!     .with_role(Role::Simulant, Capability::ENTITY_READ);
//! let evaluator = PermissionEvaluator::new(table);
//!
//! assert_eq!(evaluator.evaluate(Role::Simulant, Capability::SCHEDULE_ACTION), Decision::Deny);
//! assert_eq!(evaluator.evaluate(Role::System, Capability::ENTITY_REMOVE), Decision::Allow);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::CoreError;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// The actor classification carried on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// The host application or the engine itself.
    System,
    /// A human operator.
    Human,
    /// A simulated agent.
    Simulant,
    /// A read-only observer (dashboards, debuggers).
    Observer,
}

impl Role {
    /// All roles, in declaration order.
    pub const ALL: [Role; 4] = [Role::System, Role::Human, Role::Simulant, Role::Observer];

    /// The wire name of this role (`"SYSTEM"`, `"HUMAN"`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "SYSTEM",
            Role::Human => "HUMAN",
            Role::Simulant => "SIMULANT",
            Role::Observer => "OBSERVER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| CoreError::UnknownRole {
                name: s.to_owned(),
                known: Role::ALL
                    .iter()
                    .map(|r| r.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

bitflags! {
    /// Named permission grants checked against a role before a request runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capability: u8 {
        /// Read engine-wide state: snapshots, metrics.
        const ENGINE_INTROSPECT = 0b0000_0001;
        /// Look up entities.
        const ENTITY_READ       = 0b0000_0010;
        /// Register entities and replace their attributes.
        const ENTITY_REGISTER   = 0b0000_0100;
        /// Remove entities.
        const ENTITY_REMOVE     = 0b0000_1000;
        /// Schedule deferred actions.
        const SCHEDULE_ACTION   = 0b0001_0000;
    }
}

impl Capability {
    /// Every capability.
    pub const ALL: Self = Self::ENGINE_INTROSPECT
        .union(Self::ENTITY_READ)
        .union(Self::ENTITY_REGISTER)
        .union(Self::ENTITY_REMOVE)
        .union(Self::SCHEDULE_ACTION);

    /// Human-readable names of the contained capabilities, in bit order.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

// ---------------------------------------------------------------------------
// CapabilityTable
// ---------------------------------------------------------------------------

/// Immutable mapping from [`Role`] to the capabilities it holds.
///
/// Roles absent from the table hold nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    grants: BTreeMap<Role, Capability>,
}

impl CapabilityTable {
    /// A table in which no role holds any capability.
    pub fn empty() -> Self {
        Self {
            grants: BTreeMap::new(),
        }
    }

    /// Replace the grant for `role`, consuming and returning the table.
    #[must_use]
    pub fn with_role(mut self, role: Role, capabilities: Capability) -> Self {
        self.grants.insert(role, capabilities);
        self
    }

    /// The capabilities held by `role`.
    pub fn capabilities(&self, role: Role) -> Capability {
        self.grants.get(&role).copied().unwrap_or(Capability::empty())
    }

    /// Iterate grants in role order.
    pub fn iter(&self) -> impl Iterator<Item = (Role, Capability)> + '_ {
        self.grants.iter().map(|(r, c)| (*r, *c))
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::empty()
            .with_role(Role::System, Capability::ALL)
            .with_role(
                Role::Human,
                Capability::ENTITY_READ | Capability::ENTITY_REGISTER | Capability::SCHEDULE_ACTION,
            )
            .with_role(
                Role::Simulant,
                Capability::ENTITY_READ | Capability::SCHEDULE_ACTION,
            )
            .with_role(
                Role::Observer,
                Capability::ENTITY_READ | Capability::ENGINE_INTROSPECT,
            )
    }
}

// ---------------------------------------------------------------------------
// PermissionEvaluator
// ---------------------------------------------------------------------------

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    /// `true` for [`Decision::Allow`].
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Pure `(role, capability) -> allow | deny` lookup over a [`CapabilityTable`].
#[derive(Debug, Clone)]
pub struct PermissionEvaluator {
    table: CapabilityTable,
}

impl PermissionEvaluator {
    pub fn new(table: CapabilityTable) -> Self {
        Self { table }
    }

    /// Decide whether `role` holds every bit of `required`.
    ///
    /// An empty `required` set is always allowed.
    #[inline]
    pub fn evaluate(&self, role: Role, required: Capability) -> Decision {
        if self.table.capabilities(role).contains(required) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    /// The table this evaluator consults.
    pub fn table(&self) -> &CapabilityTable {
        &self.table
    }
}

impl Default for PermissionEvaluator {
    fn default() -> Self {
        Self::new(CapabilityTable::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
