//! WebSocket proxy transport speaking rosbridge-style `call_service` frames.
//!
//! Each [`RosbridgeProxy`] owns one WebSocket connection to the robot's
//! bridge at `ws://<endpoint>`.  A remote call is one request/response
//! exchange:
//!
//! ```json
//! → {"op":"call_service","id":"<uuid>","service":"/ALMotion/getSummary","args":[]}
//! ← {"op":"service_response","id":"<uuid>","service":"/ALMotion/getSummary","values":…,"result":true}
//! ```
//!
//! Frames with a different `id` or `op` are skipped.  Calls on one handle
//! are serialised; the supervisor bounds every call with its own timeout,
//! so this module does not add one.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tether_types::{CapabilityName, TransportError};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::proxy::{ProxyFactory, ServiceProxy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds [`RosbridgeProxy`] handles, one WebSocket connection each.
#[derive(Debug, Clone)]
pub struct RosbridgeProxyFactory {
    endpoint: String,
}

impl RosbridgeProxyFactory {
    /// `endpoint` is `host:port` of the robot's bridge (e.g.
    /// `"192.168.8.204:9559"`).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// The WebSocket URL handles connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.endpoint)
    }
}

#[async_trait]
impl ProxyFactory for RosbridgeProxyFactory {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create(&self, capability: &CapabilityName) -> Result<Arc<dyn ServiceProxy>, TransportError> {
        let url = self.url();
        let (stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            TransportError::Unreachable {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(capability = %capability, url = %url, "rosbridge proxy connected");
        Ok(Arc::new(RosbridgeProxy {
            capability: capability.clone(),
            stream: Mutex::new(stream),
        }))
    }
}

/// One capability handle over a dedicated WebSocket connection.
pub struct RosbridgeProxy {
    capability: CapabilityName,
    stream: Mutex<WsStream>,
}

#[async_trait]
impl ServiceProxy for RosbridgeProxy {
    fn capability(&self) -> &CapabilityName {
        &self.capability
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, TransportError> {
        let id = Uuid::new_v4().to_string();
        let frame = call_frame(&id, &self.capability, method, args);

        let mut stream = self.stream.lock().await;
        stream
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| TransportError::Protocol(format!("send failed: {e}")))?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(result) = parse_response(text.as_str(), &id) {
                        return result;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(capability = %self.capability, error = %e, "rosbridge stream error");
                    return Err(TransportError::Protocol(e.to_string()));
                }
            }
        }
    }
}

/// Service path for `method` on `capability`.
pub fn service_path(capability: &CapabilityName, method: &str) -> String {
    format!("/{capability}/{method}")
}

/// Build the `call_service` request frame.
pub fn call_frame(id: &str, capability: &CapabilityName, method: &str, args: Vec<Value>) -> Value {
    json!({
        "op": "call_service",
        "id": id,
        "service": service_path(capability, method),
        "args": args,
    })
}

/// Interpret an inbound text frame as the response to request `id`.
///
/// Returns `None` for frames that belong to something else (other ids, other
/// ops, or text that is not JSON); such frames are skipped by the caller.
pub fn parse_response(text: &str, id: &str) -> Option<Result<Value, TransportError>> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("op").and_then(Value::as_str) != Some("service_response") {
        return None;
    }
    if frame.get("id").and_then(Value::as_str) != Some(id) {
        return None;
    }

    let values = frame.get("values").cloned().unwrap_or(Value::Null);
    match frame.get("result").and_then(Value::as_bool) {
        Some(true) => Some(Ok(values)),
        Some(false) => {
            let service = frame
                .get("service")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let message = match values {
                Value::String(s) => s,
                other => other.to_string(),
            };
            Some(Err(TransportError::Remote { service, message }))
        }
        None => Some(Err(TransportError::Protocol(
            "service_response without a boolean result".to_string(),
        ))),
    }
}
