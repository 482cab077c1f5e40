//! Session management
//!
//! One state machine per conversation with the host:
//!
//! ```text
//! Handshaking → Idle → Prompting → AwaitingResponse
//!                        ↑                │
//!                        │     (Streaming ↔ AwaitingToolResult)*
//!                        │                │
//!                        └── Completed ←──┘   (also from recoverable Errored)
//! any non-terminal state → Cancelled | Errored
//! ```
//!
//! A session is the unit of concurrency: each active turn runs in its own
//! task and only ever takes its own session's lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::connection::{forward_session, HostLink};
use crate::error::{AcpError, ProtocolError, Result, SessionError, ToolError};
use crate::gate::PermissionGate;
use crate::multiplexer::{ChunkSender, Origin, StreamMultiplexer};
use crate::permissions::PermissionPolicy;
use crate::prompts::SYSTEM_TEMPLATE;
use crate::protocol::{
    ContentBlock, ModeInfo, NewSessionParams, NewSessionResult, SessionModes, StopReason,
    ToolCallParams, ToolCallResult, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use crate::runtime::Runtime;
use crate::tools::{DispatchConfig, DispatchScope, ToolCall, ToolCallStatus, ToolDispatcher};
use crate::turn::TurnRunner;

// ============================================================================
// Modes and states
// ============================================================================

/// How AskHost tools are handled for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Ask the host before running AskHost tools
    #[default]
    ApprovalRequired,
    /// Treat AskHost tools as AutoAllow; Deny still applies
    AutoApprove,
}

impl SessionMode {
    pub fn id(self) -> &'static str {
        match self {
            SessionMode::ApprovalRequired => "approval_required",
            SessionMode::AutoApprove => "auto_approve",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionMode::ApprovalRequired => "Ask before acting",
            SessionMode::AutoApprove => "Auto-approve",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::all().into_iter().find(|mode| mode.id() == id)
    }

    pub fn all() -> [Self; 2] {
        [SessionMode::ApprovalRequired, SessionMode::AutoApprove]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Handshaking,
    Idle,
    Prompting,
    AwaitingResponse,
    Streaming,
    AwaitingToolResult,
    Completed,
    Cancelled,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Cancelled
    }

    /// A turn is running
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SessionState::Prompting
                | SessionState::AwaitingResponse
                | SessionState::Streaming
                | SessionState::AwaitingToolResult
        )
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (from, to) if from == to => false,
            (Handshaking, Idle) => true,
            (Idle | Completed | Errored, Prompting) => true,
            (Prompting, AwaitingResponse) => true,
            (AwaitingResponse, Streaming | AwaitingToolResult | Completed) => true,
            (Streaming, AwaitingToolResult | AwaitingResponse | Completed) => true,
            (AwaitingToolResult, Streaming | AwaitingResponse | Completed) => true,
            (from, Cancelled | Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Reject host protocol revisions this runtime cannot speak.
pub fn check_protocol_version(version: u32) -> std::result::Result<(), SessionError> {
    if (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(SessionError::Handshake(format!(
            "unsupported protocol version {} (supported {}..={})",
            version, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION
        )))
    }
}

/// Permission settings of one session; shared with its dispatcher
#[derive(Debug, Clone, Default)]
pub struct SessionPolicy {
    pub mode: SessionMode,
    pub rules: PermissionPolicy,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Host,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        id: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ToolError>,
    },
}

/// One entry of the session log. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, payload: Payload) -> Self {
        Self {
            role,
            payload,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub cwd: PathBuf,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    /// Calls whose result has not been delivered yet
    pub tool_calls: Vec<ToolCall>,
    pub created_at: DateTime<Utc>,
    pub turn: u64,
    last_activity: Instant,
    protocol_errors: u32,
    recoverable: bool,
    next_call: u64,
}

impl Session {
    fn new(id: String, cwd: PathBuf, system_prompt: String) -> Self {
        Self {
            id,
            state: SessionState::Handshaking,
            cwd,
            system_prompt,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            created_at: Utc::now(),
            turn: 0,
            last_activity: Instant::now(),
            protocol_errors: 0,
            recoverable: true,
            next_call: 0,
        }
    }

    /// Move to `to`, leaving the state unchanged on an illegal transition.
    pub fn transition(&mut self, to: SessionState) -> std::result::Result<(), SessionError> {
        let recovering = self.state == SessionState::Errored && to == SessionState::Prompting;
        if !self.state.can_transition_to(to) || (recovering && !self.recoverable) {
            return Err(SessionError::InvalidStateTransition {
                session_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        tracing::debug!(
            session_id = %self.id,
            from = ?self.state,
            to = ?to,
            "Session state change"
        );
        self.state = to;
        Ok(())
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn mark_errored(&mut self, recoverable: bool) {
        if self.transition(SessionState::Errored).is_ok() {
            self.recoverable = recoverable;
        }
    }

    /// Ids are never reused within a session.
    pub(crate) fn next_call_id(&mut self) -> String {
        self.next_call += 1;
        format!("call_{}", self.next_call)
    }

    pub(crate) fn track(&mut self, call: &ToolCall) {
        self.tool_calls.push(call.clone());
        self.messages.push(
            Message::new(
                Role::Agent,
                Payload::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            )
            .with_correlation(&call.id),
        );
    }

    /// Record the terminal outcome of an in-flight call. False if the call
    /// was not in flight, so a result is recorded at most once.
    pub(crate) fn settle(&mut self, call: &ToolCall) -> bool {
        let Some(index) = self.tool_calls.iter().position(|c| c.id == call.id) else {
            return false;
        };
        self.tool_calls.remove(index);
        self.messages.push(
            Message::new(
                Role::Tool,
                Payload::ToolResult {
                    id: call.id.clone(),
                    status: call.status,
                    output: call.output.clone(),
                    error: call.error.clone(),
                },
            )
            .with_correlation(&call.id),
        );
        true
    }

    /// Settle a call whose task vanished as Cancelled.
    pub(crate) fn abandon(&mut self, call_id: &str) -> bool {
        let Some(mut call) = self.tool_calls.iter().find(|c| c.id == call_id).cloned() else {
            return false;
        };
        call.fail(ToolError::cancelled());
        self.settle(&call)
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    pub mode: SessionMode,
    pub cwd: PathBuf,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCall>,
    pub protocol_errors: u32,
    pub created_at: DateTime<Utc>,
}

/// A live session and everything that works on its behalf
#[derive(Debug)]
pub(crate) struct SessionEntry {
    pub(crate) id: String,
    pub(crate) cwd: PathBuf,
    pub(crate) session: Mutex<Session>,
    pub(crate) policy: Arc<std::sync::RwLock<SessionPolicy>>,
    /// Parent of every turn and call token of the session
    pub(crate) cancel: CancellationToken,
    pub(crate) mux: StreamMultiplexer,
    pub(crate) dispatcher: ToolDispatcher,
    progress: watch::Receiver<u64>,
    turn_task: StdMutex<Option<AbortHandle>>,
}

impl SessionEntry {
    pub(crate) fn scope(
        &self,
        cancel: CancellationToken,
        output: Option<ChunkSender>,
    ) -> DispatchScope {
        DispatchScope {
            session_id: self.id.clone(),
            workspace: self.cwd.clone(),
            policy: self.policy.clone(),
            cancel,
            output,
        }
    }

    fn mode(&self) -> SessionMode {
        self.policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .mode
    }

    /// Wait until everything queued so far has been handed to the host link.
    pub(crate) async fn flush(&self) {
        let target = self.mux.emitted();
        let mut progress = self.progress.clone();
        let _ = progress.wait_for(|forwarded| *forwarded >= target).await;
    }

    fn set_turn_task(&self, handle: Option<AbortHandle>) -> Option<AbortHandle> {
        let mut slot = self
            .turn_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, handle)
    }
}

/// Resolves when the turn started by `submit_prompt` ends
#[derive(Debug)]
pub struct TurnHandle {
    turn: u64,
    task: JoinHandle<Result<StopReason>>,
}

impl TurnHandle {
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub async fn wait(self) -> Result<StopReason> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(StopReason::Cancelled),
            Err(e) => Err(AcpError::Internal(format!("turn task failed: {}", e))),
        }
    }
}

// ============================================================================
// Session manager
// ============================================================================

#[derive(Clone)]
pub struct SessionManager {
    runtime: Arc<Runtime>,
    gate: Arc<PermissionGate>,
    link: HostLink,
    sessions: Arc<RwLock<HashMap<String, Arc<SessionEntry>>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Approval requests go to the host through `link`.
    pub fn new(runtime: Arc<Runtime>, link: HostLink) -> Self {
        let gate = Arc::new(PermissionGate::new(
            Arc::new(link.clone()),
            runtime.config.approval_timeout(),
        ));
        Self {
            runtime,
            gate,
            link,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    async fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()).into())
    }

    /// Validate the handshake and create a session in Idle.
    pub async fn open_session(&self, params: NewSessionParams) -> Result<NewSessionResult> {
        if let Some(version) = params.protocol_version {
            check_protocol_version(version)?;
        }
        let config = &self.runtime.config;
        let cwd = match params.cwd.or_else(|| config.workspace.clone()) {
            Some(cwd) => cwd,
            None => std::env::current_dir().map_err(|e| {
                SessionError::Handshake(format!("no working directory available: {}", e))
            })?,
        };
        if !cwd.is_dir() {
            return Err(SessionError::Handshake(format!(
                "cwd {} is not a directory",
                cwd.display()
            ))
            .into());
        }
        let cwd = cwd.canonicalize().unwrap_or(cwd);
        let mode = params.mode.unwrap_or(config.default_mode);
        let system_prompt = self.system_prompt(&cwd, mode)?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut session = Session::new(id.clone(), cwd.clone(), system_prompt);
        session.transition(SessionState::Idle)?;

        let (mux, events) = StreamMultiplexer::new();
        let progress = forward_session(id.clone(), events, self.link.clone());
        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            cwd: cwd.clone(),
            session: Mutex::new(session),
            policy: Arc::new(std::sync::RwLock::new(SessionPolicy {
                mode,
                rules: config.policy.clone(),
            })),
            cancel: CancellationToken::new(),
            mux,
            dispatcher: ToolDispatcher::new(
                self.runtime.registry.clone(),
                self.gate.clone(),
                DispatchConfig::from(config),
            ),
            progress,
            turn_task: StdMutex::new(None),
        });
        self.sessions.write().await.insert(id.clone(), entry);

        tracing::info!(
            name: "a3s.session.create",
            session_id = %id,
            cwd = %cwd.display(),
            mode = mode.id(),
            "Session created"
        );
        Ok(NewSessionResult {
            session_id: id,
            modes: SessionModes {
                current_mode_id: mode,
                available_modes: SessionMode::all()
                    .into_iter()
                    .map(|m| ModeInfo {
                        id: m,
                        name: m.name().to_string(),
                    })
                    .collect(),
            },
        })
    }

    fn system_prompt(&self, cwd: &Path, mode: SessionMode) -> Result<String> {
        let values = HashMap::from([
            ("cwd".to_string(), cwd.display().to_string()),
            ("mode".to_string(), mode.id().to_string()),
            ("tools".to_string(), self.runtime.registry.names().join(", ")),
        ]);
        Ok(self.runtime.templates.render(SYSTEM_TEMPLATE, &values)?)
    }

    /// Render the prompt blocks into the text sent upstream.
    pub fn compose_prompt(&self, prompt: &[ContentBlock]) -> Result<String> {
        let mut parts = Vec::with_capacity(prompt.len());
        for block in prompt {
            match block {
                ContentBlock::Text { text } => parts.push(text.clone()),
                ContentBlock::Template { name, variables } => {
                    parts.push(self.runtime.templates.render(name, variables)?)
                }
                ContentBlock::Resource { resource } => parts.push(resource.prompt_text()),
                ContentBlock::ResourceLink(link) => parts.push(link.prompt_text()),
            }
        }
        Ok(parts.join("\n\n"))
    }

    /// Start a turn. Templates are rendered before the session changes, so a
    /// template failure leaves the session untouched.
    pub async fn submit_prompt(
        &self,
        session_id: &str,
        prompt: Vec<ContentBlock>,
    ) -> Result<TurnHandle> {
        let entry = self.entry(session_id).await?;
        let text = self.compose_prompt(&prompt)?;

        let turn = {
            let mut session = entry.session.lock().await;
            session.transition(SessionState::Prompting)?;
            session.turn += 1;
            session.touch();
            session
                .messages
                .push(Message::new(Role::Host, Payload::Text(text)));
            session.turn
        };

        let span = tracing::info_span!(
            "a3s.session.turn",
            "a3s.session.id" = %session_id,
            "a3s.session.turn" = turn,
            "a3s.session.stop_reason" = tracing::field::Empty,
        );
        let runner = TurnRunner::new(entry.clone(), self.runtime.clone(), turn);
        let task = tokio::spawn(runner.run().instrument(span));
        entry.set_turn_task(Some(task.abort_handle()));
        Ok(TurnHandle { turn, task })
    }

    /// Cancel everything the session is doing. In-flight calls get their
    /// abort signal, pending approvals are denied, and the host sees one
    /// final `cancelled` update.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id).await?;
        entry.session.lock().await.transition(SessionState::Cancelled)?;
        entry.cancel.cancel();
        let denied = self.gate.cancel_session(session_id);
        entry.mux.close_cancelled();
        entry.flush().await;
        tracing::info!(
            name: "a3s.session.cancel",
            session_id,
            pending_approvals = denied,
            "Session cancelled"
        );
        Ok(())
    }

    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<SessionMode> {
        let mode = SessionMode::from_id(mode_id)
            .ok_or_else(|| ProtocolError::InvalidParams(format!("unknown mode '{}'", mode_id)))?;
        let entry = self.entry(session_id).await?;
        entry
            .policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .mode = mode;
        entry.session.lock().await.touch();
        tracing::info!(session_id, mode = mode.id(), "Session mode changed");
        Ok(mode)
    }

    /// Run a host-initiated `tool/call`. The result is the response; no
    /// `tool/result` notification is sent for it.
    pub async fn invoke_tool(&self, params: ToolCallParams) -> Result<ToolCallResult> {
        let entry = self.entry(&params.session_id).await?;
        let call = {
            let mut session = entry.session.lock().await;
            if matches!(session.state, SessionState::Handshaking | SessionState::Cancelled) {
                return Err(SessionError::InvalidStateTransition {
                    session_id: session.id.clone(),
                    from: session.state,
                    to: SessionState::AwaitingToolResult,
                }
                .into());
            }
            let call = ToolCall::new(session.next_call_id(), params.name, params.arguments);
            session.track(&call);
            session.touch();
            call
        };

        let output = entry.mux.open(Origin::ToolCall(call.id.clone())).ok();
        let scope = entry.scope(entry.cancel.clone(), output.clone());
        let call = entry.dispatcher.dispatch(call, &scope).await;
        drop(scope);
        if let Some(output) = output {
            output.finish();
        }
        entry.session.lock().await.settle(&call);
        entry.flush().await;

        Ok(ToolCallResult {
            tool_call_id: call.id,
            status: call.status,
            output: call.output,
            error: call.error,
        })
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let entry = self.entry(session_id).await?;
        let mode = entry.mode();
        let session = entry.session.lock().await;
        Ok(SessionSnapshot {
            id: session.id.clone(),
            state: session.state,
            mode,
            cwd: session.cwd.clone(),
            messages: session.messages.clone(),
            tool_calls: session.tool_calls.clone(),
            protocol_errors: session.protocol_errors,
            created_at: session.created_at,
        })
    }

    /// Count a protocol error against a session. Returns true when the count
    /// went past the configured threshold and the session was torn down.
    pub async fn record_protocol_error(&self, session_id: &str) -> bool {
        let Ok(entry) = self.entry(session_id).await else {
            return false;
        };
        let exceeded = {
            let mut session = entry.session.lock().await;
            session.protocol_errors += 1;
            let exceeded = session.protocol_errors > self.runtime.config.protocol_error_threshold;
            if exceeded {
                session.mark_errored(false);
            }
            exceeded
        };
        if exceeded {
            tracing::warn!(session_id, "Too many protocol errors, tearing session down");
            let _ = self.close_session(session_id).await;
        }
        exceeded
    }

    /// Tear a session down and forget it.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        self.shutdown(&entry).await;
        tracing::info!(name: "a3s.session.destroy", session_id, "Session closed");
        Ok(())
    }

    async fn shutdown(&self, entry: &SessionEntry) {
        {
            let mut session = entry.session.lock().await;
            if !session.state.is_terminal() && session.state != SessionState::Errored {
                let _ = session.transition(SessionState::Cancelled);
            }
        }
        entry.cancel.cancel();
        self.gate.cancel_session(&entry.id);
        if let Some(turn) = entry.set_turn_task(None) {
            // the turn winds down on its own once cancelled; abort stragglers
            let grace = self.runtime.config.cancel_grace() * 2;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                turn.abort();
            });
        }
    }

    /// Close sessions idle for longer than `idle`. Busy sessions are kept.
    pub async fn reap_idle(&self, idle: Duration) -> Vec<String> {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for entry in entries {
            let session = entry.session.lock().await;
            if !session.state.is_busy() && session.idle_for() >= idle {
                expired.push(entry.id.clone());
            }
        }
        for id in &expired {
            tracing::info!(session_id = %id, "Closing idle session");
            let _ = self.close_session(id).await;
        }
        expired
    }

    /// Periodically reap sessions idle past the configured timeout.
    pub fn spawn_idle_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let idle = self.runtime.config.idle_timeout();
        let period = (idle / 4).clamp(Duration::from_millis(10), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reap_idle(idle).await;
            }
        })
    }

    /// Tear down every session; used when the transport is lost.
    pub async fn close_all(&self) -> usize {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.write().await.drain().map(|(_, e)| e).collect();
        for entry in &entries {
            self.shutdown(entry).await;
        }
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Closed all sessions");
        }
        entries.len()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
