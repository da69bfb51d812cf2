//! RPC router: dispatches JSON-RPC method calls to handlers
//!
//! Mutating `machine.*` methods go straight to the dispatcher and answer with
//! the actor id. Subscriptions (`events.subscribe`, `resources.watch`) answer
//! `{ok: true}` and then push events on the connection until it closes.

use futures::StreamExt;
use nodeplane_core::{
    ActorId, Error, EventMessage, MachineEvent, ResetRequest, ResetResponse, ResourceKind,
    ResourceRef, Result, RpcResponse, UpgradeRequest, UpgradeResponse,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::ResolvedAuth;
use crate::service::MachineService;

/// Connection context passed to RPC handlers.
pub struct ConnectionContext {
    pub authenticated: bool,
    pub service: Arc<MachineService>,
    /// Outgoing pushes for this connection.
    pub pushes: mpsc::Sender<EventMessage>,
    /// Cancelled when the connection goes away; stops its subscriptions.
    pub cancel: CancellationToken,
}

pub type RpcResult = Result<Value>;

/// Route an RPC method call to the appropriate handler.
pub async fn route_rpc(method: &str, params: Value, ctx: &ConnectionContext) -> RpcResult {
    if !ctx.authenticated && !ResolvedAuth::anonymous_allowed(ctx.service.mode()) {
        return Err(Error::auth_failed("not authenticated"));
    }

    match method {
        "machine.upgrade" => handle_upgrade(params, ctx),
        "machine.reset" => handle_reset(params, ctx),
        "machine.reboot" => {
            let actor_id = ctx.service.dispatcher().reboot()?;
            Ok(json!({ "messages": [{ "actor_id": actor_id }] }))
        }
        "machine.shutdown" => {
            let actor_id = ctx.service.dispatcher().shutdown()?;
            Ok(json!({ "messages": [{ "actor_id": actor_id }] }))
        }
        "machine.boot_id" => Ok(json!({ "boot_id": ctx.service.dispatcher().boot_id() })),
        "machine.version" => Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "platform": { "name": "nodeplane", "mode": ctx.service.mode() },
        })),
        "events.subscribe" => handle_events_subscribe(params, ctx),
        "resources.get" => handle_resources_get(params, ctx),
        "resources.list" => handle_resources_list(params, ctx),
        "resources.watch" => handle_resources_watch(params, ctx),
        "echo" => Ok(params),
        _ => Err(Error::MethodNotFound(method.to_string())),
    }
}

/// Convert an RPC result to an RpcResponse.
pub fn to_response(id: &str, result: RpcResult) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err(e) => {
            debug!(id, error = %e, "rpc failed");
            RpcResponse::from_error(id, &e)
        }
    }
}

fn parse_params<T: DeserializeOwned + Default>(params: Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|e| Error::validation(format!("invalid params: {}", e)))
}

fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str> {
    params[name]
        .as_str()
        .ok_or_else(|| Error::validation(format!("missing required param: {}", name)))
}

fn kind_param(params: &Value) -> Result<ResourceKind> {
    Ok(ResourceKind::new(
        str_param(params, "namespace")?,
        str_param(params, "type")?,
    ))
}

// ---------------------------------------------------------------------------
// machine.upgrade / machine.reset
// ---------------------------------------------------------------------------

fn handle_upgrade(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let request: UpgradeRequest = parse_params(params)?;
    info!(image = %request.image, preserve = request.preserve, stage = request.stage, force = request.force, "machine.upgrade");
    let ack = ctx.service.dispatcher().upgrade(request)?;
    Ok(serde_json::to_value(UpgradeResponse {
        messages: vec![ack],
    })?)
}

fn handle_reset(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let request: ResetRequest = parse_params(params)?;
    info!(mode = ?request.mode, graceful = request.graceful, reboot = request.reboot, "machine.reset");
    let ack = ctx.service.dispatcher().reset(request)?;
    Ok(serde_json::to_value(ResetResponse {
        messages: vec![ack],
    })?)
}

// ---------------------------------------------------------------------------
// events.subscribe
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubscribeParams {
    tail_events: Option<usize>,
    actor_id: Option<ActorId>,
}

/// Node-wide events (no actor) pass every filter.
fn visible_to(event: &MachineEvent, actor: Option<&ActorId>) -> bool {
    match (actor, &event.actor_id) {
        (Some(actor), Some(id)) => actor == id,
        _ => true,
    }
}

fn handle_events_subscribe(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let params: SubscribeParams = parse_params(params)?;
    let mut stream = Box::pin(ctx.service.events().stream(params.tail_events.unwrap_or(0)));
    let pushes = ctx.pushes.clone();
    let cancel = ctx.cancel.clone();
    let actor = params.actor_id;

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !visible_to(&event, actor.as_ref()) {
                continue;
            }
            if pushes.send(EventMessage::machine(&event)).await.is_err() {
                break;
            }
        }
        debug!("event subscription ended");
    });

    Ok(json!({ "ok": true }))
}

// ---------------------------------------------------------------------------
// resources.*
// ---------------------------------------------------------------------------

fn handle_resources_get(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let kind = kind_param(&params)?;
    let id = str_param(&params, "id")?;
    let reference = ResourceRef::new(kind.namespace, kind.resource_type, id);
    let resource = ctx.service.reads(ctx.authenticated).get(&reference)?;
    Ok(serde_json::to_value(resource)?)
}

fn handle_resources_list(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let kind = kind_param(&params)?;
    let items = ctx.service.reads(ctx.authenticated).list(&kind)?;
    Ok(json!({ "items": items }))
}

fn handle_resources_watch(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let kind = kind_param(&params)?;
    let reads = ctx.service.reads(ctx.authenticated);
    // subscribe before the first listing so no change slips in between
    let mut watch = reads.watch(&kind)?;
    let pushes = ctx.pushes.clone();
    let cancel = ctx.cancel.clone();

    tokio::spawn(async move {
        loop {
            match reads.list(&kind) {
                Ok(items) => {
                    if pushes.send(EventMessage::resources(&kind, &items)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%kind, error = %e, "watch listing failed");
                    break;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = watch.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(%kind, "resource watch ended");
    });

    Ok(json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeplane_core::{EventPayload, MachineStage};

    fn status_event(actor: Option<&str>) -> MachineEvent {
        MachineEvent {
            id: 1,
            actor_id: actor.map(ActorId::from),
            timestamp: Default::default(),
            payload: EventPayload::MachineStatus {
                stage: MachineStage::Running,
                ready: true,
            },
        }
    }

    #[test]
    fn actor_filter_keeps_node_wide_events() {
        let mine = ActorId::from("a-1");
        assert!(visible_to(&status_event(None), Some(&mine)));
        assert!(visible_to(&status_event(Some("a-1")), Some(&mine)));
        assert!(!visible_to(&status_event(Some("a-2")), Some(&mine)));
        assert!(visible_to(&status_event(Some("a-2")), None));
    }

    #[test]
    fn missing_params_are_validation_errors() {
        let err = kind_param(&json!({ "namespace": "config" })).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("type"));

        let err = parse_params::<UpgradeRequest>(json!({ "image": 7 })).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn null_params_take_defaults() {
        let request: ResetRequest = parse_params(Value::Null).unwrap();
        assert_eq!(request, ResetRequest::default());
    }
}
