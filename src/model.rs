//! Upstream model client
//!
//! The runtime does not reason; it relays. A [`ModelClient`] receives the
//! conversation of a turn and streams back text and tool-use requests.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::session::{Message, Payload, Role};
use crate::tools::ToolSpec;

/// Everything the model sees for one round of a turn
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub turn: u64,
    /// 1-based round within the turn; each tool fan-out starts a new round
    pub round: usize,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

impl TurnRequest {
    /// Text of the most recent host message
    pub fn last_host_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match (&m.role, &m.payload) {
            (Role::Host, Payload::Text(text)) => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Streaming event from the model
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    /// Request to invoke a tool
    ToolUse { name: String, arguments: Value },
    /// Round complete
    Done,
    Error(String),
}

/// Model client trait
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start one round. The stream must end with `Done` or `Error`.
    async fn stream(&self, request: TurnRequest) -> Result<mpsc::Receiver<ModelEvent>>;
}

fn replay(events: Vec<ModelEvent>) -> mpsc::Receiver<ModelEvent> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        for event in events {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Answers every prompt by echoing the host's text. The binary's default
/// when no model is wired in.
#[derive(Debug, Default, Clone)]
pub struct EchoModel;

#[async_trait]
impl ModelClient for EchoModel {
    async fn stream(&self, request: TurnRequest) -> Result<mpsc::Receiver<ModelEvent>> {
        let mut events = Vec::new();
        if let Some(text) = request.last_host_text() {
            events.push(ModelEvent::TextDelta(text.to_string()));
        }
        events.push(ModelEvent::Done);
        Ok(replay(events))
    }
}

/// Replays a fixed script, one entry per round. Once the script runs out
/// every round is an empty `Done`.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    rounds: Mutex<VecDeque<Vec<ModelEvent>>>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedModel {
    pub fn new(rounds: Vec<Vec<ModelEvent>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A round that requests one tool call
    pub fn tool_round(name: &str, arguments: Value) -> Vec<ModelEvent> {
        vec![
            ModelEvent::ToolUse {
                name: name.to_string(),
                arguments,
            },
            ModelEvent::Done,
        ]
    }

    /// A round that says `text` and finishes
    pub fn text_round(text: &str) -> Vec<ModelEvent> {
        vec![ModelEvent::TextDelta(text.to_string()), ModelEvent::Done]
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn stream(&self, request: TurnRequest) -> Result<mpsc::Receiver<ModelEvent>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);
        let events = self
            .rounds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| vec![ModelEvent::Done]);
        Ok(replay(events))
    }
}
