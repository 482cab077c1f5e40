//! Streaming multiplexer
//!
//! Merges chunks from concurrent producers (the model stream of a turn and
//! every running tool call) into one ordered event sequence per session.
//!
//! - Chunks from one origin arrive in production order with gapless `seq`.
//! - Each origin gets exactly one `End` marker, on [`ChunkSender::finish`] or
//!   when its last sender is dropped. Finished origins cannot be reopened.
//! - After [`StreamMultiplexer::close_cancelled`] one `Cancelled` event is
//!   emitted and everything later is suppressed.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::ToolError;
use crate::tools::ToolCallStatus;

/// Producer identity within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Model output of one turn
    Model { turn: u64 },
    /// Status and output of one tool call
    ToolCall(String),
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Model { turn } => write!(f, "turn_{}", turn),
            Origin::ToolCall(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    /// Model text delta
    Text(String),
    /// A tool call was started
    CallStarted { name: String, arguments: Value },
    Status(ToolCallStatus),
    /// Partial output of a running handler
    Output(String),
    /// Terminal outcome of a tool call
    Result {
        status: ToolCallStatus,
        output: Option<String>,
        error: Option<ToolError>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MuxEvent {
    Chunk {
        origin: Origin,
        seq: u64,
        payload: ChunkPayload,
    },
    End {
        origin: Origin,
    },
    Cancelled,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MuxError {
    #[error("Origin {0} was already opened")]
    AlreadyOpened(Origin),
    #[error("Origin {0} is finished")]
    Finished(Origin),
    #[error("Session output is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct OriginState {
    next_seq: u64,
    finished: bool,
}

#[derive(Debug, Default)]
struct MuxState {
    origins: HashMap<Origin, OriginState>,
    closed: bool,
    /// Events queued so far, across all origins
    emitted: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MuxState>,
    tx: mpsc::UnboundedSender<MuxEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Sequence numbers are assigned and the event is queued under one lock,
    // so channel order equals seq order.
    fn send(&self, origin: &Origin, payload: ChunkPayload) -> Result<u64, MuxError> {
        let mut state = self.lock();
        if state.closed {
            return Err(MuxError::Closed);
        }
        let entry = state
            .origins
            .get_mut(origin)
            .ok_or_else(|| MuxError::Finished(origin.clone()))?;
        if entry.finished {
            return Err(MuxError::Finished(origin.clone()));
        }
        let seq = entry.next_seq;
        entry.next_seq += 1;
        state.emitted += 1;
        let _ = self.tx.send(MuxEvent::Chunk {
            origin: origin.clone(),
            seq,
            payload,
        });
        Ok(seq)
    }

    fn finish(&self, origin: &Origin) -> bool {
        let mut state = self.lock();
        let closed = state.closed;
        match state.origins.get_mut(origin) {
            Some(entry) if !entry.finished => {
                entry.finished = true;
                if !closed {
                    state.emitted += 1;
                    let _ = self.tx.send(MuxEvent::End {
                        origin: origin.clone(),
                    });
                }
                true
            }
            _ => false,
        }
    }
}

/// Per-session merge point. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    shared: Arc<Shared>,
}

impl StreamMultiplexer {
    /// Create a multiplexer and the receiver of its merged sequence.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MuxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MuxState::default()),
                tx,
            }),
        };
        (mux, rx)
    }

    /// Register a producer for `origin`. Each origin can be opened once.
    pub fn open(&self, origin: Origin) -> Result<ChunkSender, MuxError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(MuxError::Closed);
        }
        if state.origins.contains_key(&origin) {
            return Err(MuxError::AlreadyOpened(origin));
        }
        state.origins.insert(origin.clone(), OriginState::default());
        Ok(ChunkSender {
            inner: Arc::new(SenderInner {
                origin,
                shared: self.shared.clone(),
            }),
        })
    }

    /// Emit the final `Cancelled` event and suppress all later output.
    /// Returns false if the session output was already closed.
    pub fn close_cancelled(&self) -> bool {
        let mut state = self.shared.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.emitted += 1;
        let _ = self.shared.tx.send(MuxEvent::Cancelled);
        true
    }

    /// Number of events queued so far. A consumer that has taken this many
    /// events from the receiver has seen everything produced up to now.
    pub fn emitted(&self) -> u64 {
        self.shared.lock().emitted
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Origins opened but not yet finished
    pub fn open_origins(&self) -> Vec<Origin> {
        self.shared
            .lock()
            .origins
            .iter()
            .filter(|(_, s)| !s.finished)
            .map(|(o, _)| o.clone())
            .collect()
    }
}

#[derive(Debug)]
struct SenderInner {
    origin: Origin,
    shared: Arc<Shared>,
}

impl Drop for SenderInner {
    fn drop(&mut self) {
        self.shared.finish(&self.origin);
    }
}

/// Producer handle for one origin. Clones share the origin; the terminal
/// marker is emitted on `finish` or when the last clone drops.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    inner: Arc<SenderInner>,
}

impl ChunkSender {
    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// Queue one chunk; returns its sequence number within the origin.
    pub fn send(&self, payload: ChunkPayload) -> Result<u64, MuxError> {
        self.inner.shared.send(&self.inner.origin, payload)
    }

    pub fn text(&self, text: impl Into<String>) -> Result<u64, MuxError> {
        self.send(ChunkPayload::Text(text.into()))
    }

    pub fn status(&self, status: ToolCallStatus) -> Result<u64, MuxError> {
        self.send(ChunkPayload::Status(status))
    }

    pub fn output(&self, text: impl Into<String>) -> Result<u64, MuxError> {
        self.send(ChunkPayload::Output(text.into()))
    }

    /// Emit the terminal marker now. True if this call emitted it.
    pub fn finish(&self) -> bool {
        self.inner.shared.finish(&self.inner.origin)
    }

    pub fn is_finished(&self) -> bool {
        self.inner
            .shared
            .lock()
            .origins
            .get(&self.inner.origin)
            .map_or(true, |s| s.finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<MuxEvent>) -> Vec<MuxEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn call(id: &str) -> Origin {
        Origin::ToolCall(id.to_string())
    }

    // ========================================================================
    // Ordering
    // ========================================================================

    #[test]
    fn test_per_origin_order_with_interleaving() {
        let (mux, mut rx) = StreamMultiplexer::new();
        let model = mux.open(Origin::Model { turn: 1 }).unwrap();
        let tool = mux.open(call("call_1")).unwrap();

        model.text("a").unwrap();
        tool.output("x").unwrap();
        model.text("b").unwrap();
        tool.output("y").unwrap();
        model.text("c").unwrap();

        let events = drain(&mut rx);
        let model_seqs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                MuxEvent::Chunk { origin: Origin::Model { .. }, seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(model_seqs, vec![0, 1, 2]);

        let tool_texts: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                MuxEvent::Chunk { payload: ChunkPayload::Output(t), .. } => Some(t.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tool_texts, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_order() {
        let (mux, mut rx) = StreamMultiplexer::new();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let sender = mux.open(call(&format!("call_{}", i))).unwrap();
            tasks.push(tokio::spawn(async move {
                for n in 0..50 {
                    sender.output(n.to_string()).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut last: HashMap<Origin, i64> = HashMap::new();
        let mut ends = 0;
        for event in drain(&mut rx) {
            match event {
                MuxEvent::Chunk { origin, seq, payload: ChunkPayload::Output(text) } => {
                    let prev = last.insert(origin, seq as i64).unwrap_or(-1);
                    assert_eq!(seq as i64, prev + 1);
                    assert_eq!(text, seq.to_string());
                }
                MuxEvent::End { origin } => {
                    assert_eq!(last[&origin], 49);
                    ends += 1;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(ends, 8);
    }

    // ========================================================================
    // Terminal markers
    // ========================================================================

    #[test]
    fn test_end_exactly_once() {
        let (mux, mut rx) = StreamMultiplexer::new();
        let sender = mux.open(call("call_1")).unwrap();
        let clone = sender.clone();

        sender.status(ToolCallStatus::Running).unwrap();
        assert!(sender.finish());
        assert!(!clone.finish());
        assert!(clone.is_finished());
        assert_eq!(
            clone.output("late").unwrap_err(),
            MuxError::Finished(call("call_1"))
        );
        drop(sender);
        drop(clone);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], MuxEvent::End { origin: call("call_1") });
    }

    #[test]
    fn test_drop_of_last_clone_emits_end() {
        let (mux, mut rx) = StreamMultiplexer::new();
        let sender = mux.open(call("call_9")).unwrap();
        let clone = sender.clone();
        drop(sender);
        assert!(drain(&mut rx).is_empty());
        drop(clone);
        assert_eq!(drain(&mut rx), vec![MuxEvent::End { origin: call("call_9") }]);
        assert!(mux.open_origins().is_empty());
    }

    #[test]
    fn test_origin_cannot_be_reopened() {
        let (mux, _rx) = StreamMultiplexer::new();
        let sender = mux.open(call("call_1")).unwrap();
        sender.finish();
        assert_eq!(
            mux.open(call("call_1")).unwrap_err(),
            MuxError::AlreadyOpened(call("call_1"))
        );
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    #[test]
    fn test_close_cancelled_suppresses_everything_after() {
        let (mux, mut rx) = StreamMultiplexer::new();
        let model = mux.open(Origin::Model { turn: 1 }).unwrap();
        let tool = mux.open(call("call_1")).unwrap();
        model.text("before").unwrap();

        assert!(mux.close_cancelled());
        assert!(!mux.close_cancelled());
        assert!(mux.is_closed());

        assert_eq!(model.text("after").unwrap_err(), MuxError::Closed);
        assert_eq!(mux.open(call("call_2")).unwrap_err(), MuxError::Closed);
        drop(tool);
        drop(model);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], MuxEvent::Cancelled);
    }

    #[test]
    fn test_emitted_counts_queued_events() {
        let (mux, mut rx) = StreamMultiplexer::new();
        let sender = mux.open(call("call_1")).unwrap();
        sender.output("a").unwrap();
        sender.finish();
        assert_eq!(mux.emitted(), 2);

        mux.close_cancelled();
        assert_eq!(mux.emitted(), 3);
        assert_eq!(drain(&mut rx).len() as u64, mux.emitted());
    }
}
