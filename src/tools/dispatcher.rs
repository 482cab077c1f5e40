//! Tool dispatcher
//!
//! Runs one tool call end to end: registry lookup, argument check, the
//! permission gate, a concurrency slot, then the handler in its own task
//! under a timeout. Every call ends Completed, Failed or Cancelled.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::registry::ToolRegistry;
use super::types::{
    truncate_output, ToolCall, ToolCallStatus, ToolContext, ToolDescriptor, ToolOutput,
};
use crate::config::RuntimeConfig;
use crate::error::ToolError;
use crate::gate::PermissionGate;
use crate::multiplexer::ChunkSender;
use crate::permissions::Decision;
use crate::session::SessionPolicy;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrency ceiling; calls beyond it queue FIFO
    pub max_concurrent: usize,
    pub default_timeout: Duration,
    /// How long a cancelled handler may keep running before it is aborted
    pub cancel_grace: Duration,
    pub max_output_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for DispatchConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_tools.max(1),
            default_timeout: config.tool_timeout(),
            cancel_grace: config.cancel_grace(),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Everything a call needs from its session
#[derive(Debug, Clone)]
pub struct DispatchScope {
    pub session_id: String,
    pub workspace: PathBuf,
    pub policy: Arc<RwLock<SessionPolicy>>,
    /// Session token; each handler gets a child of it
    pub cancel: CancellationToken,
    /// Producer for this call's status and output chunks
    pub output: Option<ChunkSender>,
}

impl DispatchScope {
    fn policy_snapshot(&self) -> SessionPolicy {
        self.policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn report(&self, call: &mut ToolCall, status: ToolCallStatus) {
        call.status = status;
        if let Some(output) = &self.output {
            let _ = output.status(status);
        }
    }
}

/// One per session: the semaphore is the session's concurrency ceiling.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    slots: Arc<Semaphore>,
    config: DispatchConfig,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            gate,
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Slots not currently held by a running call
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Drive `call` to a terminal status.
    pub async fn dispatch(&self, call: ToolCall, scope: &DispatchScope) -> ToolCall {
        let span = tracing::info_span!(
            "a3s.tool.dispatch",
            "a3s.session.id" = %scope.session_id,
            "a3s.tool.name" = %call.name,
            "a3s.tool.call_id" = %call.id,
            "a3s.tool.status" = tracing::field::Empty,
        );
        async move {
            let call = self.run(call, scope).await;
            tracing::Span::current().record("a3s.tool.status", tracing::field::debug(call.status));
            tracing::debug!(status = ?call.status, "Tool call finished");
            call
        }
        .instrument(span)
        .await
    }

    async fn run(&self, mut call: ToolCall, scope: &DispatchScope) -> ToolCall {
        let Some(descriptor) = self.registry.get(&call.name) else {
            tracing::warn!("Unknown tool: {}", call.name);
            call.fail(ToolError::unknown_tool(&call.name));
            scope.report(&mut call, ToolCallStatus::Failed);
            return call;
        };

        if let Err(e) = descriptor.validate_args(&call.arguments) {
            call.fail(e);
            scope.report(&mut call, ToolCallStatus::Failed);
            return call;
        }

        let policy = scope.policy_snapshot();
        let decision = if self.gate.classify(&descriptor, &call, &policy) == Decision::Ask {
            scope.report(&mut call, ToolCallStatus::PendingApproval);
            let decision = self
                .gate
                .request_approval(&call, &scope.session_id, &scope.cancel)
                .await;
            if decision.remember {
                scope
                    .policy
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .rules
                    .allow_tool(&call.name);
            }
            decision
        } else {
            self.gate
                .evaluate(&descriptor, &call, &scope.session_id, &policy, &scope.cancel)
                .await
        };

        if scope.cancel.is_cancelled() {
            return self.cancelled(call, scope);
        }
        if !decision.is_allowed() {
            scope.report(&mut call, ToolCallStatus::Denied);
            let reason = decision.reason.unwrap_or_else(|| "denied".to_string());
            call.fail(ToolError::permission_denied(format!(
                "{} was not permitted: {}",
                call.name, reason
            )));
            scope.report(&mut call, ToolCallStatus::Failed);
            return call;
        }
        scope.report(&mut call, ToolCallStatus::Approved);

        let _permit = tokio::select! {
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    call.fail(ToolError::execution_failed("dispatcher is shut down"));
                    scope.report(&mut call, ToolCallStatus::Failed);
                    return call;
                }
            },
            _ = scope.cancel.cancelled() => return self.cancelled(call, scope),
        };

        scope.report(&mut call, ToolCallStatus::Running);
        match self.run_handler(&descriptor, &call, scope).await {
            Ok(output) => {
                call.complete(truncate_output(output.content, self.config.max_output_bytes));
                scope.report(&mut call, ToolCallStatus::Completed);
            }
            Err(e) => {
                let status = if e.kind == crate::error::ToolErrorKind::Cancelled {
                    ToolCallStatus::Cancelled
                } else {
                    ToolCallStatus::Failed
                };
                call.fail(e);
                scope.report(&mut call, status);
            }
        }
        call
    }

    fn cancelled(&self, mut call: ToolCall, scope: &DispatchScope) -> ToolCall {
        call.fail(ToolError::cancelled());
        scope.report(&mut call, ToolCallStatus::Cancelled);
        call
    }

    async fn run_handler(
        &self,
        descriptor: &ToolDescriptor,
        call: &ToolCall,
        scope: &DispatchScope,
    ) -> Result<ToolOutput, ToolError> {
        let abort = scope.cancel.child_token();
        let ctx = ToolContext::new(scope.workspace.clone(), &scope.session_id, &call.id)
            .with_abort(abort.clone())
            .with_output(scope.output.clone());
        let handler = descriptor.handler();
        let args = call.arguments.clone();
        let mut task = tokio::spawn(async move { handler.invoke(args, ctx).await });

        let timeout = descriptor.timeout.unwrap_or(self.config.default_timeout);
        let grace = self.config.cancel_grace;

        tokio::select! {
            joined = &mut task => join_outcome(&call.name, joined),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Tool timed out: {}",
                    call.name
                );
                abort.cancel();
                let handle = task.abort_handle();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    handle.abort();
                });
                Err(ToolError::timeout(&call.name, timeout))
            }
            _ = scope.cancel.cancelled() => {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    tracing::warn!("Tool ignored cancellation, aborting: {}", call.name);
                    task.abort();
                }
                Err(ToolError::cancelled())
            }
        }
    }
}

fn join_outcome(
    name: &str,
    joined: Result<anyhow::Result<ToolOutput>, JoinError>,
) -> Result<ToolOutput, ToolError> {
    match joined {
        Ok(Ok(output)) if output.success => Ok(output),
        Ok(Ok(output)) => Err(ToolError::execution_failed(output.content)),
        Ok(Err(e)) => Err(ToolError::execution_failed(format!("{:#}", e))),
        Err(e) if e.is_panic() => {
            tracing::error!("Tool handler panicked: {}", name);
            Err(ToolError::execution_failed(format!("tool '{}' panicked", name)))
        }
        Err(_) => Err(ToolError::cancelled()),
    }
}
