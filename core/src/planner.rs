//! The model-runtime seam and the planner output contract.
//!
//! The core does not know how the model runs; it requires only that the
//! runtime respects deadlines and cancellation and eventually yields one
//! buffer of text. Parsing is deliberately lenient about framing — models
//! wrap JSON in prose and code fences — but strict about semantics: at most
//! one tool proposal is honored per step, unknown tools are dropped, and
//! thinking content is discarded before anything can be persisted.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// One claim in an answer document. Claims either cite visible-text
/// segments of the current observation or declare themselves unsupported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    #[serde(default)]
    pub cites: Vec<u32>,
    #[serde(default)]
    pub unsupported: bool,
}

/// The rendered answer for the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerDocument {
    pub markdown: String,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

/// A proposed tool call, not yet gated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProposal {
    pub tool: String,
    pub arguments: Value,
    /// One-line preview shown in approval prompts and `ui.state`.
    #[serde(default)]
    pub summary: Option<String>,
}

/// Parsed planner output for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlannerOutput {
    pub document: AnswerDocument,
    /// All structured proposals found; the orchestrator honors the first.
    pub proposals: Vec<ToolProposal>,
}

/// Input for one planner call: the rendered context pack.
#[derive(Debug, Clone)]
pub struct PlanInput {
    pub text: String,
    pub estimated_tokens: u32,
}

/// The model runtime contract.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce one structured output buffer. Must return promptly once
    /// `cancel` fires or `deadline` passes.
    async fn plan(
        &self,
        input: PlanInput,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<String>;

    /// Optional cheap labeling primitive.
    async fn classify(&self, _input: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Wire shape the planner is asked to emit. Lenient: unknown fields are
/// ignored, everything is optional.
#[derive(Debug, Deserialize)]
struct PlannerWire {
    #[serde(default)]
    document: Option<AnswerDocument>,
    #[serde(default)]
    tool_calls: Vec<ToolProposal>,
}

/// Drop `<think>…</think>` blocks. Anything the model "thought" is never
/// parsed, logged, or persisted.
fn strip_thinking(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                // Unterminated block: everything after the tag is thinking.
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Scan for the first balanced `{…}` region and return it, string-aware.
fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[start..=start + i]);
                    }
                }
                _ => {}
            }
        }
        // Unbalanced from this brace; try the next one.
        search_from = start + 1;
    }
    None
}

/// Parse raw model output into a [`PlannerOutput`].
///
/// Tolerates incidental framing (prose, code fences) around the first
/// well-formed object. Anything that fails to parse degrades to a
/// document-only result carrying the stripped text, with no tool calls —
/// a malformed plan must never turn into an action.
pub fn parse_planner_output(raw: &str) -> PlannerOutput {
    let stripped = strip_thinking(raw);

    let mut search_space = stripped.as_str();
    while let Some(candidate) = first_json_object(search_space) {
        match serde_json::from_str::<PlannerWire>(candidate) {
            Ok(wire) => {
                let document = wire.document.unwrap_or_default();
                return PlannerOutput {
                    document,
                    proposals: wire.tool_calls,
                };
            }
            Err(_) => {
                // Well-formed JSON that is not our shape (or not JSON at
                // all): move past this brace and keep looking.
                let consumed = candidate.as_ptr() as usize - search_space.as_ptr() as usize;
                search_space = &search_space[consumed + 1..];
            }
        }
    }

    PlannerOutput {
        document: AnswerDocument {
            markdown: stripped.trim().to_string(),
            claims: Vec::new(),
        },
        proposals: Vec::new(),
    }
}
