//! Request validation, permission checks and dispatch.
//!
//! Every request goes through the same pipeline:
//!
//! 1. **Type** -- the `type` string must name a [`RequestKind`], otherwise
//!    `UNSUPPORTED_REQUEST`.
//! 2. **Shape** -- `actor_id` must be non-empty and the payload must
//!    deserialize into the kind's payload struct, otherwise
//!    `VALIDATION_FAILED`.
//! 3. **Permission** -- the actor's role must hold the kind's required
//!    capability, otherwise `PERMISSION_DENIED`.
//! 4. **Dispatch** -- the handler runs; handler-level failures
//!    (`DUPLICATE_ENTITY`, `NOT_FOUND`) come back as failed responses too.
//!
//! Nothing in this pipeline returns `Err` or panics: every outcome is a
//! [`Response`].

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use kestrel_core::entity::Attributes;
use kestrel_core::error::{codes, StructuredError};
use kestrel_core::request::{Request, Response};
use kestrel_core::role::{Capability, Decision, PermissionEvaluator};

use crate::scheduler::{ActionScheduler, ActionSpec};
use crate::snapshot::EngineSnapshot;
use crate::world::{entity_payload, SimWorld};

// ---------------------------------------------------------------------------
// RequestKind
// ---------------------------------------------------------------------------

/// Request types the router understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    EntityRegister,
    EntityUpdate,
    EntityRemove,
    EntityGet,
    EntityList,
    ActionSchedule,
    EngineSnapshot,
    EngineMetrics,
}

impl RequestKind {
    pub const ALL: [RequestKind; 8] = [
        RequestKind::EntityRegister,
        RequestKind::EntityUpdate,
        RequestKind::EntityRemove,
        RequestKind::EntityGet,
        RequestKind::EntityList,
        RequestKind::ActionSchedule,
        RequestKind::EngineSnapshot,
        RequestKind::EngineMetrics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::EntityRegister => "entity.register",
            RequestKind::EntityUpdate => "entity.update",
            RequestKind::EntityRemove => "entity.remove",
            RequestKind::EntityGet => "entity.get",
            RequestKind::EntityList => "entity.list",
            RequestKind::ActionSchedule => "action.schedule",
            RequestKind::EngineSnapshot => "engine.snapshot",
            RequestKind::EngineMetrics => "engine.metrics",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// The capability an actor needs to issue this request.
    pub fn required_capability(self) -> Capability {
        match self {
            RequestKind::EntityRegister | RequestKind::EntityUpdate => Capability::ENTITY_REGISTER,
            RequestKind::EntityRemove => Capability::ENTITY_REMOVE,
            RequestKind::EntityGet | RequestKind::EntityList => Capability::ENTITY_READ,
            RequestKind::ActionSchedule => Capability::SCHEDULE_ACTION,
            RequestKind::EngineSnapshot | RequestKind::EngineMetrics => {
                Capability::ENGINE_INTROSPECT
            }
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    id: String,
    kind: String,
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct UpdatePayload {
    id: String,
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct IdPayload {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchedulePayload {
    action_type: String,
    run_at: Option<u64>,
    delay_ms: Option<u64>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    priority: i32,
}

/// A request that passed type and shape validation.
#[derive(Debug)]
enum Command {
    Register(RegisterPayload),
    Update(UpdatePayload),
    Remove(IdPayload),
    Get(IdPayload),
    List,
    Schedule(SchedulePayload),
    Snapshot,
    Metrics,
}

// ---------------------------------------------------------------------------
// RequestRouter
// ---------------------------------------------------------------------------

/// Turns [`Request`]s into [`Response`]s against one engine's state.
#[derive(Debug, Clone, Default)]
pub struct RequestRouter {
    evaluator: PermissionEvaluator,
}

impl RequestRouter {
    pub fn new(evaluator: PermissionEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &PermissionEvaluator {
        &self.evaluator
    }

    /// Run `request` through the full pipeline and account for the outcome.
    pub fn route(
        &self,
        request: &Request,
        scheduler: &mut ActionScheduler,
        world: &mut SimWorld,
    ) -> Response {
        world.metrics_mut().increment_counter("requests.total", 1);

        let response = match self.handle(request, scheduler, world) {
            Ok(data) => Response::success(data),
            Err(error) => Response::failure(error),
        };

        let metrics = world.metrics_mut();
        match response.error_code() {
            None => metrics.increment_counter("requests.ok", 1),
            Some(code) => {
                metrics.increment_counter("requests.failed", 1);
                if code == codes::PERMISSION_DENIED {
                    metrics.increment_counter("requests.denied", 1);
                }
            }
        }
        response
    }

    fn handle(
        &self,
        request: &Request,
        scheduler: &mut ActionScheduler,
        world: &mut SimWorld,
    ) -> Result<Value, StructuredError> {
        // Step 1: Known type?
        let Some(kind) = RequestKind::parse(&request.kind) else {
            tracing::debug!(request_id = %request.id, kind = %request.kind, "unsupported request type");
            return Err(world.errors_mut().create_error(
                codes::UNSUPPORTED_REQUEST,
                format!("unsupported request type '{}'", request.kind),
                Some(json!({ "type": request.kind })),
            ));
        };

        // Step 2: Structural validation.
        let command = validate(kind, request).map_err(|message| {
            tracing::debug!(request_id = %request.id, %kind, %message, "request failed validation");
            world.errors_mut().create_error(
                codes::VALIDATION_FAILED,
                message,
                Some(json!({ "type": kind.as_str() })),
            )
        })?;

        // Step 3: Permission.
        let required = kind.required_capability();
        if self.evaluator.evaluate(request.role, required) == Decision::Deny {
            tracing::warn!(
                request_id = %request.id,
                actor_id = %request.actor_id,
                role = %request.role,
                %kind,
                code = codes::PERMISSION_DENIED,
                "request denied"
            );
            return Err(world.errors_mut().create_error(
                codes::PERMISSION_DENIED,
                format!("role {} may not perform '{kind}'", request.role),
                Some(json!({
                    "role": request.role,
                    "required": required.names(),
                })),
            ));
        }

        // Step 4: Dispatch.
        tracing::debug!(request_id = %request.id, actor_id = %request.actor_id, %kind, "dispatching request");
        dispatch(command, request, scheduler, world)
    }
}

fn validate(kind: RequestKind, request: &Request) -> Result<Command, String> {
    if request.actor_id.trim().is_empty() {
        return Err("actorId must be a non-empty string".to_owned());
    }

    let command = match kind {
        RequestKind::EntityRegister => {
            let payload: RegisterPayload = parse_payload(&request.payload)?;
            require_non_empty("id", &payload.id)?;
            require_non_empty("kind", &payload.kind)?;
            Command::Register(payload)
        }
        RequestKind::EntityUpdate => {
            let payload: UpdatePayload = parse_payload(&request.payload)?;
            require_non_empty("id", &payload.id)?;
            Command::Update(payload)
        }
        RequestKind::EntityRemove => Command::Remove(parse_id(&request.payload)?),
        RequestKind::EntityGet => Command::Get(parse_id(&request.payload)?),
        RequestKind::ActionSchedule => {
            let payload: SchedulePayload = parse_payload(&request.payload)?;
            require_non_empty("actionType", &payload.action_type)?;
            if payload.run_at.is_some() && payload.delay_ms.is_some() {
                return Err("runAt and delayMs are mutually exclusive".to_owned());
            }
            Command::Schedule(payload)
        }
        RequestKind::EntityList | RequestKind::EngineSnapshot | RequestKind::EngineMetrics => {
            require_object_or_null(&request.payload)?;
            match kind {
                RequestKind::EntityList => Command::List,
                RequestKind::EngineSnapshot => Command::Snapshot,
                _ => Command::Metrics,
            }
        }
    };
    Ok(command)
}

fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, String> {
    T::deserialize(payload).map_err(|e| format!("invalid payload: {e}"))
}

fn parse_id(payload: &Value) -> Result<IdPayload, String> {
    let payload: IdPayload = parse_payload(payload)?;
    require_non_empty("id", &payload.id)?;
    Ok(payload)
}

fn require_non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} must be a non-empty string"));
    }
    Ok(())
}

fn require_object_or_null(payload: &Value) -> Result<(), String> {
    match payload {
        Value::Null | Value::Object(_) => Ok(()),
        other => Err(format!("payload must be an object, got {other}")),
    }
}

fn dispatch(
    command: Command,
    request: &Request,
    scheduler: &mut ActionScheduler,
    world: &mut SimWorld,
) -> Result<Value, StructuredError> {
    match command {
        Command::Register(p) => {
            if !world.register_entity(&p.id, &p.kind, request.role, p.attributes) {
                return Err(world.errors_mut().create_error(
                    codes::DUPLICATE_ENTITY,
                    format!("entity '{}' is already registered", p.id),
                    Some(json!({ "id": p.id })),
                ));
            }
            let entity = world.entities().get(&p.id).map(entity_payload);
            Ok(json!({ "entity": entity }))
        }
        Command::Update(p) => match world.replace_attributes(&p.id, p.attributes) {
            Some(entity) => Ok(json!({ "entity": entity })),
            None => Err(not_found(world, &p.id)),
        },
        Command::Remove(p) => match world.remove_entity(&p.id) {
            Some(entity) => Ok(json!({ "entity": entity })),
            None => Err(not_found(world, &p.id)),
        },
        Command::Get(p) => match world.entities().get(&p.id) {
            Some(entity) => Ok(json!({ "entity": entity })),
            None => Err(not_found(world, &p.id)),
        },
        Command::List => Ok(json!({ "ids": world.entities().list_ids() })),
        Command::Schedule(p) => {
            let run_at = match (p.run_at, p.delay_ms) {
                (Some(at), _) => at,
                (None, Some(delay)) => world.now().saturating_add(delay),
                (None, None) => world.now(),
            };
            let spec = ActionSpec {
                action_type: p.action_type,
                run_at,
                payload: p.payload,
                priority: p.priority,
            };
            let action_id = scheduler.schedule(spec, world);
            Ok(json!({ "actionId": action_id, "runAt": run_at }))
        }
        Command::Snapshot => Ok(json!(EngineSnapshot::capture(scheduler, world))),
        Command::Metrics => Ok(json!(world.metrics().snapshot())),
    }
}

fn not_found(world: &mut SimWorld, id: &str) -> StructuredError {
    world.errors_mut().create_error(
        codes::NOT_FOUND,
        format!("entity '{id}' does not exist"),
        Some(json!({ "id": id })),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
