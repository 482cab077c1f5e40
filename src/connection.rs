//! Host connection plumbing
//!
//! [`HostLink`] is the agent's handle on the host: every outbound envelope
//! goes through one unbounded queue drained by a single writer task, so
//! frames leave in the order they were queued. Requests the agent sends to
//! the host (approval round trips) are correlated by an atomic id counter.

use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use a3s_transport::{FrameSink, FrameSource, TransportError};

use crate::error::{AcpError, Result};
use crate::gate::{ApprovalRequest, HostAnswer, HostApprover};
use crate::multiplexer::{ChunkPayload, MuxEvent, Origin};
use crate::protocol::{
    methods, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, PermissionOption, PermissionRequestParams, PermissionResponse, RequestId,
    SessionUpdate, SessionUpdateParams, ToolCallNotice, ToolCallResult, ToolResultParams,
};

type Reply = std::result::Result<Value, JsonRpcError>;
type PendingRequests = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>>;

fn lock(pending: &PendingRequests) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outbound half of a host connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HostLink {
    outbound: mpsc::UnboundedSender<JsonRpcMessage>,
    pending: PendingRequests,
    next_id: Arc<AtomicU64>,
}

// Drops the pending entry when a request future is abandoned.
struct Outstanding<'a> {
    pending: &'a PendingRequests,
    id: RequestId,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

impl HostLink {
    /// Create a link and the receiver its writer task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JsonRpcMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let link = Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (link, rx)
    }

    pub fn send(&self, message: JsonRpcMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| AcpError::Transport(TransportError::Closed))
    }

    pub fn notify<P: Serialize>(&self, method: &str, params: &P) -> Result<()> {
        let params = serde_json::to_value(params)?;
        self.send(JsonRpcMessage::Notification(JsonRpcNotification::new(
            method,
            Some(params),
        )))
    }

    pub fn respond(&self, response: JsonRpcResponse) -> Result<()> {
        self.send(JsonRpcMessage::Response(response))
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a request to the host and wait for its response.
    pub async fn request<P: Serialize>(&self, method: &str, params: &P) -> Result<Value> {
        let id = self.next_request_id();
        self.request_as(id, method, params).await
    }

    async fn request_as<P: Serialize>(
        &self,
        id: RequestId,
        method: &str,
        params: &P,
    ) -> Result<Value> {
        let params = serde_json::to_value(params)?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        let _outstanding = Outstanding {
            pending: &self.pending,
            id: id.clone(),
        };

        self.send(JsonRpcMessage::Request(JsonRpcRequest::new(
            id.clone(),
            method,
            Some(params),
        )))?;
        tracing::debug!(%id, method, "Request sent to host");

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AcpError::Internal(format!(
                "Host rejected {} ({}): {}",
                method, e.code, e.message
            ))),
            Err(_) => Err(AcpError::Transport(TransportError::Closed)),
        }
    }

    /// Route a host response to the request waiting for it.
    /// False when nothing is waiting (unknown or already answered id).
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        let Some(tx) = lock(&self.pending).remove(&id) else {
            return false;
        };
        let reply = match response.error {
            Some(error) => Err(error),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(reply);
        true
    }

    /// Forget every outstanding request once the transport is gone. Each
    /// waiter sees its sender dropped and fails with `TransportError::Closed`.
    pub fn drop_pending(&self) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        drained.len()
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[async_trait::async_trait]
impl HostApprover for HostLink {
    async fn ask(&self, request: ApprovalRequest) -> anyhow::Result<HostAnswer> {
        let params = PermissionRequestParams {
            session_id: request.session_id,
            tool_call_id: request.call_id,
            name: request.tool_name,
            arguments: request.arguments,
            options: PermissionOption::standard(),
        };
        let id = self.next_request_id();
        let value = self
            .request_as(id.clone(), methods::TOOL_PERMISSION, &params)
            .await?;
        let response: PermissionResponse = serde_json::from_value(value)?;
        Ok(HostAnswer {
            outcome: response.outcome,
            correlation_id: Some(id.to_string()),
        })
    }
}

/// Decode inbound frames lazily. Undecodable units yield a protocol error
/// and the sequence continues; a transport error is yielded last.
pub fn inbound_messages(
    mut source: Box<dyn FrameSource>,
) -> impl Stream<Item = Result<JsonRpcMessage>> {
    async_stream::stream! {
        loop {
            match source.recv().await {
                Ok(Some(bytes)) => yield JsonRpcMessage::parse(&bytes).map_err(AcpError::from),
                Ok(None) => break,
                Err(e) => {
                    yield Err(AcpError::Transport(e));
                    break;
                }
            }
        }
    }
}

/// Single writer task: drains the outbound queue into the sink in order and
/// closes the sink once every `HostLink` clone is gone.
pub fn spawn_writer(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let bytes = message.to_bytes()?;
            if let Err(e) = sink.send(&bytes).await {
                tracing::error!(error = %e, "Failed to write to host");
                return Err(e.into());
            }
        }
        sink.close().await?;
        Ok(())
    })
}

/// Forward one session's merged output to the host as notifications.
///
/// The returned watch counts forwarded events; compare it with
/// [`crate::multiplexer::StreamMultiplexer::emitted`] to wait for a flush.
pub fn forward_session(
    session_id: String,
    mut events: mpsc::UnboundedReceiver<MuxEvent>,
    link: HostLink,
) -> watch::Receiver<u64> {
    let (progress_tx, progress_rx) = watch::channel(0u64);
    tokio::spawn(async move {
        let mut forwarded = 0u64;
        while let Some(event) = events.recv().await {
            if let Err(e) = forward_event(&session_id, event, &link) {
                tracing::debug!(session_id = %session_id, error = %e, "Dropping session output");
            }
            forwarded += 1;
            progress_tx.send_replace(forwarded);
        }
    });
    progress_rx
}

fn forward_event(session_id: &str, event: MuxEvent, link: &HostLink) -> Result<()> {
    let update = match event {
        MuxEvent::Cancelled => SessionUpdate::Cancelled,
        MuxEvent::End { origin } => SessionUpdate::StreamEnd {
            origin: origin.to_string(),
        },
        MuxEvent::Chunk {
            origin,
            seq,
            payload,
        } => match (origin, payload) {
            (Origin::Model { turn }, ChunkPayload::Text(text)) => {
                SessionUpdate::AgentMessageChunk { turn, seq, text }
            }
            (Origin::ToolCall(id), ChunkPayload::Status(status)) => SessionUpdate::ToolCallUpdate {
                tool_call_id: id,
                seq,
                status,
            },
            (Origin::ToolCall(id), ChunkPayload::Output(text) | ChunkPayload::Text(text)) => {
                SessionUpdate::ToolOutputChunk {
                    tool_call_id: id,
                    seq,
                    text,
                }
            }
            (Origin::ToolCall(id), ChunkPayload::CallStarted { name, arguments }) => {
                return link.notify(
                    methods::TOOL_CALL,
                    &ToolCallNotice {
                        session_id: session_id.to_string(),
                        tool_call_id: id,
                        name,
                        arguments,
                    },
                );
            }
            (
                Origin::ToolCall(id),
                ChunkPayload::Result {
                    status,
                    output,
                    error,
                },
            ) => {
                return link.notify(
                    methods::TOOL_RESULT,
                    &ToolResultParams {
                        session_id: session_id.to_string(),
                        result: ToolCallResult {
                            tool_call_id: id,
                            status,
                            output,
                            error,
                        },
                    },
                );
            }
            (origin, payload) => {
                tracing::debug!(%origin, ?payload, "No host mapping for chunk");
                return Ok(());
            }
        },
    };
    link.notify(
        methods::SESSION_UPDATE,
        &SessionUpdateParams {
            session_id: session_id.to_string(),
            update,
        },
    )
}
