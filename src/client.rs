//! WebSocket client for a node's control API.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, Stream, StreamExt};
use nodeplane_core::{
    ActorId, Error, EventMessage, MachineEvent, ResetAck, ResetRequest, ResetResponse, Resource,
    ResourceKind, Result, RpcRequest, ServerFrame, UpgradeAck, UpgradeRequest, UpgradeResponse,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::action::Node;

pub const DEFAULT_PORT: u16 = 50000;

/// Events replayed from the node's backlog when subscribing. The node caps
/// this at whatever it retains.
const REPLAY_ALL: usize = 1 << 16;

/// Endpoint of one node plus the credentials to reach it.
#[derive(Debug, Clone)]
pub struct NodeClient {
    name: String,
    url: String,
    token: Option<String>,
}

impl NodeClient {
    /// `endpoint` is `host`, `host:port` or a full `ws://` URL.
    pub fn new(endpoint: &str) -> Self {
        let url = if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            endpoint.to_string()
        } else if endpoint.contains(':') {
            format!("ws://{}/ws", endpoint)
        } else {
            format!("ws://{}:{}/ws", endpoint, DEFAULT_PORT)
        };
        Self {
            name: endpoint.to_string(),
            url,
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn connect(&self) -> Result<Connection> {
        Connection::open(&self.url, self.token.as_deref()).await
    }

    async fn call_once<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.connect().await?.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn upgrade(&self, request: &UpgradeRequest) -> Result<UpgradeAck> {
        let response: UpgradeResponse = self
            .call_once("machine.upgrade", serde_json::to_value(request)?)
            .await?;
        response
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidMessage("empty upgrade response".into()))
    }

    pub async fn reset(&self, request: &ResetRequest) -> Result<ResetAck> {
        let response: ResetResponse = self
            .call_once("machine.reset", serde_json::to_value(request)?)
            .await?;
        response
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidMessage("empty reset response".into()))
    }

    pub async fn version(&self) -> Result<Value> {
        self.call_once("machine.version", json!({})).await
    }

    /// One resource when `id` is given, otherwise the whole kind.
    pub async fn get(&self, kind: &ResourceKind, id: Option<&str>) -> Result<Vec<Resource>> {
        let mut params = json!({ "namespace": kind.namespace, "type": kind.resource_type });
        match id {
            Some(id) => {
                params["id"] = json!(id);
                let resource: Resource = self.call_once("resources.get", params).await?;
                Ok(vec![resource])
            }
            None => {
                let listing: Value = self.call_once("resources.list", params).await?;
                Ok(serde_json::from_value(listing["items"].clone())?)
            }
        }
    }
}

#[async_trait]
impl Node for NodeClient {
    async fn boot_id(&self) -> Result<String> {
        let value: Value = self.call_once("machine.boot_id", json!({})).await?;
        value["boot_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidMessage("boot_id missing from response".into()))
    }

    async fn watch_events(&self, actor: &ActorId) -> Result<BoxStream<'static, Result<MachineEvent>>> {
        let mut conn = self.connect().await?;
        conn.call(
            "events.subscribe",
            json!({ "tail_events": REPLAY_ALL, "actor_id": actor }),
        )
        .await?;
        Ok(conn.into_events().boxed())
    }
}

/// One open control connection.
pub struct Connection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    /// Pushes that arrived while waiting for a response.
    pushes: VecDeque<EventMessage>,
}

impl Connection {
    pub async fn open(url: &str, token: Option<&str>) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::ConnectionClosed(format!("failed to connect to {}: {}", url, e)))?;
        let mut conn = Self {
            ws,
            next_id: 0,
            pushes: VecDeque::new(),
        };
        if let Some(token) = token {
            conn.call("auth", json!({ "token": token }))
                .await
                .map_err(|e| Error::auth_failed(e.to_string()))?;
        }
        Ok(conn)
    }

    async fn next_frame(&mut self) -> Result<ServerFrame> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMsg::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| Error::InvalidMessage(e.to_string()));
                }
                Some(Ok(WsMsg::Close(_))) | None => {
                    return Err(Error::ConnectionClosed("node closed the connection".into()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::ConnectionClosed(e.to_string())),
            }
        }
    }

    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = format!("req-{}", self.next_id);
        let request = RpcRequest::new(id.clone(), method, params);
        self.ws
            .send(WsMsg::Text(serde_json::to_string(&request)?))
            .await
            .map_err(|e| Error::ConnectionClosed(e.to_string()))?;

        loop {
            match self.next_frame().await? {
                ServerFrame::Response(response) if response.id == id => {
                    return response.into_result();
                }
                ServerFrame::Response(response) => {
                    debug!(id = %response.id, "dropping stray response");
                }
                ServerFrame::Event(event) => self.pushes.push_back(event),
            }
        }
    }

    /// Machine events pushed on this connection. The stream yields one error
    /// and ends when the connection drops.
    pub fn into_events(self) -> impl Stream<Item = Result<MachineEvent>> + Send + 'static {
        async_stream::stream! {
            let mut conn = self;
            while let Some(push) = conn.pushes.pop_front() {
                if let Some(event) = push.as_machine_event() {
                    yield Ok(event);
                }
            }
            loop {
                match conn.next_frame().await {
                    Ok(ServerFrame::Event(push)) => {
                        if let Some(event) = push.as_machine_event() {
                            yield Ok(event);
                        }
                    }
                    Ok(ServerFrame::Response(_)) => {}
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}
