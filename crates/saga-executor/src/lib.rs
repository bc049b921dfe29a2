// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod chain;
mod error;
mod executor;
pub mod mcp;
mod registry;
mod tools;

pub use chain::{
    ToolCallChain, ToolStep, execution_request_from_tool_chain, tool_chain_from_execution_request,
};
pub use error::ExecutorError;
pub use executor::{ApplyReport, Executor, Preview, PreviewItem, StepFailure};
pub use registry::{EventShape, ToolContext, ToolHandler, ToolOutcome, ToolRegistry, ToolSpec};
pub use tools::{core_registry, register_core_tools};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
