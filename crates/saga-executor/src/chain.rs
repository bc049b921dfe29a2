// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tool call chains and their execution-request representation.

use saga_canonical::JsonMap;
use saga_plan::{ExecutionContext, ExecutionRequest, ExecutionStep, Visibility};
use serde::{Deserialize, Serialize};

/// One tool invocation within a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    /// Registered tool name.
    pub tool: String,
    /// Tool arguments.
    #[serde(default)]
    pub args: JsonMap,
    /// Whether a human must confirm before this step applies.
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Output visibility.
    #[serde(default)]
    pub visibility: Visibility,
}

impl ToolStep {
    /// A public, unconfirmed step.
    #[must_use]
    pub fn new(tool: impl Into<String>, args: JsonMap) -> Self {
        Self {
            tool: tool.into(),
            args,
            requires_confirmation: false,
            visibility: Visibility::Public,
        }
    }
}

/// An ordered sequence of tool steps executed for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChain {
    /// Caller-chosen idempotency scope; retries reuse it.
    pub request_id: String,
    /// Scene the chain executes in.
    pub scene_id: i64,
    /// Acting entity, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<ToolStep>,
}

impl ToolCallChain {
    /// Whether any step needs human confirmation before applying.
    #[must_use]
    pub fn needs_confirmation(&self) -> bool {
        self.steps.iter().any(|s| s.requires_confirmation)
    }
}

/// Lower a tool chain into the executor-facing request contract.
#[must_use]
pub fn execution_request_from_tool_chain(
    chain: &ToolCallChain,
    plan_id: &str,
) -> ExecutionRequest {
    ExecutionRequest {
        plan_id: plan_id.to_string(),
        context: ExecutionContext {
            scene_id: chain.scene_id,
            actor_id: chain.actor_id.clone(),
            request_id: Some(chain.request_id.clone()),
        },
        steps: chain
            .steps
            .iter()
            .map(|s| ExecutionStep {
                op: s.tool.clone(),
                args: s.args.clone(),
                requires_confirmation: s.requires_confirmation,
                visibility: s.visibility,
            })
            .collect(),
    }
}

/// Recover the tool chain from an execution request.
///
/// Lossless up to `plan_id`:
/// `tool_chain_from_execution_request(execution_request_from_tool_chain(c, p)) == c`.
#[must_use]
pub fn tool_chain_from_execution_request(request: &ExecutionRequest) -> ToolCallChain {
    ToolCallChain {
        request_id: request.context.request_id.clone().unwrap_or_default(),
        scene_id: request.context.scene_id,
        actor_id: request.context.actor_id.clone(),
        steps: request
            .steps
            .iter()
            .map(|s| ToolStep {
                tool: s.op.clone(),
                args: s.args.clone(),
                requires_confirmation: s.requires_confirmation,
                visibility: s.visibility,
            })
            .collect(),
    }
}
