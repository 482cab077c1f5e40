//! Agent server
//!
//! Reads JSON-RPC traffic from one host connection and routes it to the
//! session manager. Fast methods are answered inline, in arrival order;
//! `session/prompt` and `tool/call` are answered from their own tasks once
//! the work finishes, so the connection keeps serving in the meantime.

use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

use a3s_transport::Transport;

use crate::connection::{inbound_messages, spawn_writer, HostLink};
use crate::error::{AcpError, ProtocolError, Result, SessionError};
use crate::protocol::{
    error_codes, methods, parse_params, AgentCapabilities, AgentInfo, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, NewSessionParams, PermissionNotification, PromptParams, PromptResult,
    RequestId, SessionIdParams, SetModeParams, ToolCallParams, PROTOCOL_VERSION,
};
use crate::runtime::Runtime;
use crate::session::{check_protocol_version, SessionManager};

/// Why `serve` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The host closed its end of the transport
    HostClosed,
    /// The host sent `shutdown`
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct AgentServer {
    runtime: Arc<Runtime>,
}

impl AgentServer {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Serve one host connection until it closes, fails, or asks to shut down.
    pub async fn serve(&self, transport: Transport) -> Result<ServeOutcome> {
        let (source, sink) = transport.into_parts();
        let (link, outbound) = HostLink::new();
        let writer = spawn_writer(sink, outbound);
        let sessions = SessionManager::new(self.runtime.clone(), link.clone());
        let reaper = sessions.spawn_idle_reaper();
        let router = Router {
            runtime: self.runtime.clone(),
            sessions: sessions.clone(),
            link: link.clone(),
            initialized: Arc::new(AtomicBool::new(false)),
        };
        tracing::info!(name: "a3s.server.start", "Serving host connection");

        let mut inbound = Box::pin(inbound_messages(source));
        let mut tasks = JoinSet::new();
        let outcome = loop {
            tokio::select! {
                item = inbound.next() => match item {
                    None => break Ok(ServeOutcome::HostClosed),
                    Some(Ok(message)) => {
                        if router.handle(message, &mut tasks).await == Flow::Shutdown {
                            break Ok(ServeOutcome::Shutdown);
                        }
                    }
                    Some(Err(e)) if e.is_fatal() => {
                        tracing::error!(error = %e, "Transport failed");
                        let _ = link.respond(JsonRpcResponse::failure(
                            None,
                            JsonRpcError::new(error_codes::PARSE_ERROR, e.to_string()),
                        ));
                        break Err(e);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Rejected inbound message");
                        let _ = link.respond(JsonRpcResponse::failure(None, e.to_rpc_error()));
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        reaper.abort();
        sessions.close_all().await;
        let grace = self.runtime.config.cancel_grace() * 2;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tasks.abort_all();
        }
        link.drop_pending();
        drop(router);
        drop(sessions);
        drop(link);
        match tokio::time::timeout(grace, writer).await {
            Ok(Ok(Err(e))) => tracing::debug!(error = %e, "Writer stopped with error"),
            Ok(_) => {}
            Err(_) => tracing::warn!("Writer did not drain in time"),
        }

        tracing::info!(name: "a3s.server.stop", outcome = ?outcome, "Host connection finished");
        outcome
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

#[derive(Clone)]
struct Router {
    runtime: Arc<Runtime>,
    sessions: SessionManager,
    link: HostLink,
    initialized: Arc<AtomicBool>,
}

impl Router {
    async fn handle(&self, message: JsonRpcMessage, tasks: &mut JoinSet<()>) -> Flow {
        match message {
            JsonRpcMessage::Request(request) => self.request(request, tasks).await,
            JsonRpcMessage::Notification(notification) => {
                self.notification(notification).await;
                Flow::Continue
            }
            JsonRpcMessage::Response(response) => {
                let id = response.id.clone();
                if !self.link.complete(response) {
                    tracing::debug!(id = ?id, "Response for unknown or settled request");
                }
                Flow::Continue
            }
        }
    }

    async fn request(&self, request: JsonRpcRequest, tasks: &mut JoinSet<()>) -> Flow {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        let session_id = params
            .as_ref()
            .and_then(|p| p.get("sessionId"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let result = match method.as_str() {
            methods::INITIALIZE => self.initialize(params),
            methods::SHUTDOWN => {
                self.reply(id, Ok(json!({})));
                return Flow::Shutdown;
            }
            _ if !self.initialized.load(Ordering::Acquire) => Err(SessionError::Handshake(
                "initialize must be called first".to_string(),
            )
            .into()),
            methods::SESSION_NEW => match parse_params::<NewSessionParams>(params) {
                Ok(p) => to_value(self.sessions.open_session(p).await),
                Err(e) => Err(e.into()),
            },
            methods::SESSION_PROMPT => match self.prompt(id.clone(), params, tasks).await {
                Ok(()) => return Flow::Continue,
                Err(e) => Err(e),
            },
            methods::SESSION_CANCEL => match parse_params::<SessionIdParams>(params) {
                Ok(p) => self.sessions.cancel(&p.session_id).await.map(|_| json!({})),
                Err(e) => Err(e.into()),
            },
            methods::SESSION_SET_MODE => match parse_params::<SetModeParams>(params) {
                Ok(p) => self
                    .sessions
                    .set_mode(&p.session_id, &p.mode_id)
                    .await
                    .map(|_| json!({})),
                Err(e) => Err(e.into()),
            },
            methods::SESSION_CLOSE => match parse_params::<SessionIdParams>(params) {
                Ok(p) => self.sessions.close_session(&p.session_id).await.map(|_| json!({})),
                Err(e) => Err(e.into()),
            },
            methods::TOOL_CALL => match parse_params::<ToolCallParams>(params) {
                Ok(p) => {
                    let router = self.clone();
                    tasks.spawn(async move {
                        let result = to_value(router.sessions.invoke_tool(p).await);
                        router.reply(id, result);
                    });
                    return Flow::Continue;
                }
                Err(e) => Err(e.into()),
            },
            other => Err(ProtocolError::MethodNotFound(other.to_string()).into()),
        };

        if let (Err(AcpError::Protocol(_)), Some(session_id)) = (&result, &session_id) {
            self.sessions.record_protocol_error(session_id).await;
        }
        self.reply(id, result);
        Flow::Continue
    }

    fn initialize(&self, params: Option<Value>) -> Result<Value> {
        let params: InitializeParams = parse_params(params)?;
        check_protocol_version(params.protocol_version)?;
        self.initialized.store(true, Ordering::Release);
        tracing::info!(
            name: "a3s.session.handshake",
            protocol_version = params.protocol_version,
            "Host initialized"
        );
        to_value(Ok(InitializeResult {
            protocol_version: PROTOCOL_VERSION,
            agent_capabilities: AgentCapabilities {
                prompt_templates: self.runtime.templates.names(),
                tool_streaming: true,
                session_modes: true,
                binary_framing: true,
            },
            agent_info: AgentInfo::default(),
        }))
    }

    /// Start the turn inline so state errors are answered in order, then
    /// answer with the stop reason when the turn ends.
    async fn prompt(
        &self,
        id: RequestId,
        params: Option<Value>,
        tasks: &mut JoinSet<()>,
    ) -> Result<()> {
        let params: PromptParams = parse_params(params)?;
        let handle = self
            .sessions
            .submit_prompt(&params.session_id, params.prompt)
            .await?;
        let router = self.clone();
        tasks.spawn(async move {
            let result = handle
                .wait()
                .await
                .map(|stop_reason| PromptResult { stop_reason });
            router.reply(id, to_value(result));
        });
        Ok(())
    }

    async fn notification(&self, notification: JsonRpcNotification) {
        let JsonRpcNotification { method, params, .. } = notification;
        match method.as_str() {
            methods::SESSION_CANCEL => match parse_params::<SessionIdParams>(params) {
                Ok(p) => {
                    if let Err(e) = self.sessions.cancel(&p.session_id).await {
                        tracing::debug!(error = %e, "Ignored session/cancel");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Malformed session/cancel"),
            },
            methods::TOOL_PERMISSION => match parse_params::<PermissionNotification>(params) {
                Ok(p) => {
                    let gate = self.sessions.gate();
                    if !gate.resolve(&p.session_id, &p.tool_call_id, p.outcome) {
                        tracing::debug!(call_id = %p.tool_call_id, "No pending approval");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Malformed tool/permission"),
            },
            other => tracing::debug!(method = other, "Ignored notification"),
        }
    }

    fn reply(&self, id: RequestId, result: Result<Value>) {
        let response = match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                tracing::debug!(%id, error = %e, "Request failed");
                JsonRpcResponse::failure(Some(id), e.to_rpc_error())
            }
        };
        if self.link.respond(response).is_err() {
            tracing::debug!("Host link closed, response dropped");
        }
    }
}

fn to_value<T: Serialize>(result: Result<T>) -> Result<Value> {
    Ok(serde_json::to_value(result?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use a3s_transport::Framing;

    async fn call(host: &mut Transport, id: u64, method: &str, params: Value) -> Value {
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        host.send(&serde_json::to_vec(&request).unwrap()).await.unwrap();
        loop {
            let bytes = host.recv().await.unwrap().unwrap();
            let value: Value = serde_json::from_slice(&bytes).unwrap();
            if value["id"] == json!(id) {
                return value;
            }
        }
    }

    fn server() -> AgentServer {
        let runtime = Runtime::builder(RuntimeConfig::default())
            .with_builtins()
            .build()
            .unwrap();
        AgentServer::new(Arc::new(runtime))
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let (mut host, agent) = Transport::memory_pair(Framing::Lines);
        let serving = tokio::spawn(async move { server().serve(agent).await });

        let reply = call(&mut host, 1, "initialize", json!({"protocolVersion": 1})).await;
        assert_eq!(reply["result"]["protocolVersion"], 1);
        assert!(reply["result"]["agentCapabilities"]["promptTemplates"]
            .as_array()
            .unwrap()
            .contains(&json!("system")));

        let reply = call(&mut host, 2, "shutdown", json!({})).await;
        assert_eq!(reply["result"], json!({}));
        assert_eq!(serving.await.unwrap().unwrap(), ServeOutcome::Shutdown);
    }

    #[tokio::test]
    async fn test_requests_before_initialize_are_rejected() {
        let (mut host, agent) = Transport::memory_pair(Framing::Lines);
        let serving = tokio::spawn(async move { server().serve(agent).await });

        let reply = call(&mut host, 1, "session/new", json!({})).await;
        assert_eq!(reply["error"]["code"], -32001);

        let reply = call(&mut host, 2, "initialize", json!({"protocolVersion": 99})).await;
        assert_eq!(reply["error"]["code"], -32001);

        host.close().await.unwrap();
        assert_eq!(serving.await.unwrap().unwrap(), ServeOutcome::HostClosed);
    }

    #[tokio::test]
    async fn test_unknown_method_and_parse_error() {
        let (mut host, agent) = Transport::memory_pair(Framing::Lines);
        let serving = tokio::spawn(async move { server().serve(agent).await });
        call(&mut host, 1, "initialize", json!({"protocolVersion": 1})).await;

        let reply = call(&mut host, 2, "session/fly", json!({})).await;
        assert_eq!(reply["error"]["code"], -32601);

        host.send(b"{oops").await.unwrap();
        let bytes = host.recv().await.unwrap().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], -32700);
        assert!(value["id"].is_null());

        host.close().await.unwrap();
        serving.await.unwrap().unwrap();
    }
}
