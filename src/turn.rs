//! Turn execution
//!
//! A turn relays one host prompt to the model and runs the tool calls the
//! model asks for, round after round, until the model finishes without
//! requesting tools, the session is cancelled, or the round limit is hit.
//! Tool calls of a round fan out as tasks; their results are delivered in
//! completion order while the model stream is still being read.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{AcpError, Result};
use crate::model::{ModelEvent, TurnRequest};
use crate::multiplexer::{ChunkPayload, ChunkSender, MuxError, Origin};
use crate::protocol::StopReason;
use crate::runtime::Runtime;
use crate::session::{Message, Payload, Role, SessionEntry, SessionState};
use crate::tools::ToolCall;

type Finished = (ToolCall, Option<ChunkSender>);
type InFlight = JoinSet<Finished>;

pub(crate) struct TurnRunner {
    entry: Arc<SessionEntry>,
    runtime: Arc<Runtime>,
    turn: u64,
    /// Child of the session token; also fired when the turn fails
    cancel: CancellationToken,
    started: HashSet<String>,
}

impl TurnRunner {
    pub(crate) fn new(entry: Arc<SessionEntry>, runtime: Arc<Runtime>, turn: u64) -> Self {
        let cancel = entry.cancel.child_token();
        Self {
            entry,
            runtime,
            turn,
            cancel,
            started: HashSet::new(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<StopReason> {
        let outcome = self.drive().await;
        self.sweep().await;

        let outcome = match outcome {
            Ok(stop) => {
                if stop != StopReason::Cancelled {
                    self.advance(SessionState::Completed).await;
                }
                Ok(stop)
            }
            Err(_) if self.entry.cancel.is_cancelled() => Ok(StopReason::Cancelled),
            Err(e) => {
                tracing::warn!(
                    session_id = %self.entry.id,
                    turn = self.turn,
                    error = %e,
                    "Turn failed"
                );
                self.entry.session.lock().await.mark_errored(true);
                Err(e)
            }
        };
        self.entry.flush().await;

        if let Ok(stop) = &outcome {
            tracing::Span::current()
                .record("a3s.session.stop_reason", tracing::field::debug(stop));
            tracing::info!(
                session_id = %self.entry.id,
                turn = self.turn,
                stop_reason = ?stop,
                "Turn finished"
            );
        }
        outcome
    }

    async fn drive(&mut self) -> Result<StopReason> {
        let model_out = match self.entry.mux.open(Origin::Model { turn: self.turn }) {
            Ok(sender) => sender,
            Err(MuxError::Closed) => return Ok(StopReason::Cancelled),
            Err(e) => return Err(AcpError::Internal(e.to_string())),
        };
        self.advance(SessionState::AwaitingResponse).await;

        let tools = self.runtime.registry.specs();
        for round in 1..=self.runtime.config.max_model_rounds {
            if self.cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            let request = {
                let session = self.entry.session.lock().await;
                TurnRequest {
                    session_id: self.entry.id.clone(),
                    turn: self.turn,
                    round,
                    system_prompt: session.system_prompt.clone(),
                    messages: session.messages.clone(),
                    tools: tools.clone(),
                }
            };

            let mut in_flight = InFlight::new();
            let streamed = self.stream_round(request, &model_out, &mut in_flight).await;
            if streamed.is_err() {
                // the round is void; wind down whatever it started
                self.cancel.cancel();
            }
            while let Some(joined) = in_flight.join_next().await {
                self.deliver(joined).await;
            }
            let requested_tools = streamed?;

            if self.cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            if !requested_tools {
                model_out.finish();
                return Ok(StopReason::EndTurn);
            }
            self.advance(SessionState::AwaitingResponse).await;
        }

        tracing::warn!(
            session_id = %self.entry.id,
            max_rounds = self.runtime.config.max_model_rounds,
            "Model round limit reached"
        );
        model_out.finish();
        Ok(StopReason::MaxTurnRequests)
    }

    /// Read one model round. Returns whether the model requested tools.
    async fn stream_round(
        &mut self,
        request: TurnRequest,
        model_out: &ChunkSender,
        in_flight: &mut InFlight,
    ) -> Result<bool> {
        let mut events = self
            .runtime
            .model
            .stream(request)
            .await
            .map_err(|e| AcpError::Model(format!("{:#}", e)))?;

        let cancel = self.cancel.clone();
        let mut text = String::new();
        let mut requested_tools = false;
        let result = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ModelEvent::TextDelta(delta)) => {
                        self.advance(SessionState::Streaming).await;
                        let _ = model_out.text(delta.as_str());
                        text.push_str(&delta);
                    }
                    Some(ModelEvent::ToolUse { name, arguments }) => {
                        requested_tools = true;
                        self.start_call(name, arguments, in_flight).await;
                    }
                    Some(ModelEvent::Done) => break Ok(requested_tools),
                    Some(ModelEvent::Error(e)) => break Err(AcpError::Model(e)),
                    None => break Err(AcpError::Model(
                        "model stream ended without completion".to_string(),
                    )),
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.deliver(joined).await;
                }
                _ = cancel.cancelled() => break Ok(requested_tools),
            }
        };

        if !text.is_empty() {
            self.entry
                .session
                .lock()
                .await
                .messages
                .push(Message::new(Role::Agent, Payload::Text(text)));
        }
        result
    }

    async fn start_call(
        &mut self,
        name: String,
        arguments: serde_json::Value,
        in_flight: &mut InFlight,
    ) {
        let call = {
            let mut session = self.entry.session.lock().await;
            let call = ToolCall::new(session.next_call_id(), name, arguments);
            session.track(&call);
            session.touch();
            call
        };
        self.advance(SessionState::AwaitingToolResult).await;
        tracing::debug!(
            session_id = %self.entry.id,
            call_id = %call.id,
            tool = %call.name,
            "Tool call requested"
        );
        self.started.insert(call.id.clone());

        let output = self.entry.mux.open(Origin::ToolCall(call.id.clone())).ok();
        if let Some(output) = &output {
            let _ = output.send(ChunkPayload::CallStarted {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }
        let dispatcher = self.entry.dispatcher.clone();
        let scope = self.entry.scope(self.cancel.clone(), output.clone());
        in_flight.spawn(async move {
            let call = dispatcher.dispatch(call, &scope).await;
            (call, output)
        });
    }

    /// Hand a finished call's result to the host, exactly once.
    async fn deliver(&mut self, joined: std::result::Result<Finished, JoinError>) {
        let (call, output) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.entry.id,
                    error = %e,
                    "Tool call task ended abnormally"
                );
                return;
            }
        };
        self.started.remove(&call.id);
        if !self.entry.session.lock().await.settle(&call) {
            return;
        }
        if let Some(output) = output {
            let _ = output.send(ChunkPayload::Result {
                status: call.status,
                output: call.output.clone(),
                error: call.error.clone(),
            });
            output.finish();
        }
    }

    /// Settle calls whose tasks never reported back.
    async fn sweep(&mut self) {
        if self.started.is_empty() {
            return;
        }
        let mut session = self.entry.session.lock().await;
        for call_id in self.started.drain() {
            if session.abandon(&call_id) {
                tracing::warn!(
                    session_id = %self.entry.id,
                    call_id = %call_id,
                    "Swept dangling tool call"
                );
            }
        }
    }

    /// Best-effort state change; a cancelled session stays cancelled.
    async fn advance(&self, to: SessionState) {
        let mut session = self.entry.session.lock().await;
        if session.state == to || session.state.is_terminal() {
            return;
        }
        if let Err(e) = session.transition(to) {
            tracing::debug!(error = %e, "Skipping state change");
        }
    }
}
