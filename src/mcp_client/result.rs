//! Tool reply normalization.
//!
//! Servers answer `tools/call` with a list of content fragments. The calling
//! layer only cares whether the call worked and what text came back, so every
//! reply is folded into an `InvocationResult`.

use serde::Serialize;

use super::types::{ContentBlock, ToolReply};

/// Sole-fragment text a server sends to report success with nothing to say.
pub const SUCCESS_MARKER: &str = "tool_call_success";

/// Sole-fragment text a server sends to report failure with nothing to say.
pub const FAILURE_MARKER: &str = "tool_call_failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Normalized result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationResult {
    pub outcome: Outcome,
    pub payload: Option<String>,
}

impl InvocationResult {
    pub fn success(payload: Option<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            payload,
        }
    }

    pub fn failure(payload: Option<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            payload,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Fold a raw reply into an `InvocationResult`.
///
/// - no content → failure, no payload
/// - a lone `tool_call_failure` / `tool_call_success` text → failure / success, no payload
/// - otherwise every fragment is rendered and the lines joined with `\n`;
///   replies flagged `isError` carry that text as a failure payload
pub fn adapt(reply: ToolReply) -> InvocationResult {
    if reply.content.is_empty() {
        return InvocationResult::failure(None);
    }

    if let [ContentBlock::Text { text }] = reply.content.as_slice() {
        match text.as_str() {
            FAILURE_MARKER => return InvocationResult::failure(None),
            SUCCESS_MARKER => return InvocationResult::success(None),
            _ => {}
        }
    }

    let payload = reply
        .content
        .iter()
        .filter_map(render_block)
        .collect::<Vec<_>>()
        .join("\n");

    if reply.is_error {
        InvocationResult::failure(Some(payload).filter(|p| !p.is_empty()))
    } else {
        InvocationResult::success(Some(payload))
    }
}

fn render_block(block: &ContentBlock) -> Option<String> {
    match block {
        ContentBlock::Text { text } => Some(text.clone()),
        ContentBlock::Image { mime_type, .. } => Some(format!("[image: {mime_type}]")),
        ContentBlock::Resource { resource } => Some(
            resource
                .get("text")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| resource.to_string()),
        ),
        ContentBlock::Unsupported => None,
    }
}
