//! Dynamic tool system
//!
//! ```text
//! ToolRegistry (name → ToolDescriptor, read-only after startup)
//!   └── ToolDescriptor { schema, tier, timeout, Arc<dyn ToolHandler> }
//!
//! ToolDispatcher::dispatch(call)
//!   lookup → argument check → PermissionGate → slot → handler task
//! ```

mod builtin;
mod dispatcher;
mod registry;
mod types;

pub use builtin::{builtin_tools, read_file, run_cmd, write_file};
pub use dispatcher::{DispatchConfig, DispatchScope, ToolDispatcher};
pub use registry::{load_overrides, ToolOverride, ToolRegistry};
pub use types::{
    handler_fn, truncate_output, ToolCall, ToolCallStatus, ToolContext, ToolDescriptor,
    ToolHandler, ToolOutput, ToolSpec,
};
