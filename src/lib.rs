//! # a3s-acp
//!
//! Agent side of a JSON-RPC 2.0 agent-host protocol for A3S coding agents.
//!
//! ## Overview
//!
//! A host (editor, IDE, CLI) connects over stdio or a Unix socket, opens
//! sessions, and sends prompts. For each prompt the runtime relays the
//! conversation to a [`ModelClient`], dispatches the tool calls the model
//! asks for, negotiates permission with the host for sensitive tools, and
//! streams text and tool output back as `session/update` notifications.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use a3s_acp::{AgentServer, Runtime, RuntimeConfig};
//! use a3s_transport::{Framing, Transport};
//!
//! # async fn example() -> a3s_acp::Result<()> {
//! let runtime = Runtime::builder(RuntimeConfig::default())
//!     .with_builtins()
//!     .build()?;
//! let server = AgentServer::new(Arc::new(runtime));
//! let outcome = server.serve(Transport::stdio(Framing::Lines)).await?;
//! println!("stopped: {:?}", outcome);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **AgentServer**: reads inbound messages and routes them by method
//! - **SessionManager**: session table, state machine, cancellation
//! - **PermissionGate**: policy tiers and host approval round-trips
//! - **ToolDispatcher**: bounded, timed, abortable tool execution
//! - **StreamMultiplexer**: merges per-origin output into one ordered stream
//! - **TemplateStore**: named prompt templates with `{placeholder}` variables

pub mod config;
pub mod connection;
pub mod error;
pub mod gate;
pub mod model;
pub mod multiplexer;
pub mod permissions;
pub mod prompts;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod session;
pub mod tools;
mod turn;

pub use config::{FramingKind, RuntimeConfig};
pub use connection::HostLink;
pub use error::{AcpError, Result};
pub use gate::{HostApprover, PermissionGate, PolicyDecision};
pub use model::{EchoModel, ModelClient, ModelEvent, ScriptedModel, TurnRequest};
pub use multiplexer::{ChunkPayload, ChunkSender, MuxEvent, Origin, StreamMultiplexer};
pub use permissions::{Decision, PermissionPolicy, PermissionRule, PermissionTier};
pub use prompts::{PromptTemplate, TemplateStore};
pub use protocol::{
    ContentBlock, EmbeddedResource, ResourceLink, StopReason, PROTOCOL_VERSION,
};
pub use runtime::{Runtime, RuntimeBuilder};
pub use server::{AgentServer, ServeOutcome};
pub use session::{
    Message, Payload, Role, Session, SessionManager, SessionMode, SessionSnapshot, SessionState,
    TurnHandle,
};
pub use tools::{
    handler_fn, ToolCall, ToolCallStatus, ToolContext, ToolDescriptor, ToolHandler, ToolOutput,
    ToolRegistry,
};
