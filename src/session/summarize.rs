//! Session summarization.
//!
//! Short sessions are rendered verbatim. Past the soft threshold, everything
//! older than the most recent N steps collapses into a stored digest (task
//! outcomes, tools used, notable errors) that is reused until enough new
//! steps accumulate to invalidate it. The step list itself is never
//! rewritten; the digest lives alongside it.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::SessionError;
use crate::session::store::SessionStore;
use crate::session::Digest;
use crate::task::{Step, StepKind};

/// Maximum characters a single rendered step may take in the preamble.
const STEP_RENDER_CAP: usize = 200;

/// Summarize a session within a token budget.
pub async fn summarize(
    store: &SessionStore,
    session_id: &str,
    budget_tokens: usize,
) -> Result<String, SessionError> {
    let session = store.load_session(session_id).await?;
    let threshold = store.config().summarize_threshold;
    let keep_recent = store.config().summarize_keep_recent;

    let rendered = if session.steps.len() <= threshold {
        session
            .steps
            .iter()
            .map(render_step)
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        let cut = session.steps.len() - keep_recent.min(session.steps.len());
        let digest = current_digest(store, session_id, &session.steps, cut, threshold).await?;
        let tail = session.steps[cut..]
            .iter()
            .map(render_step)
            .collect::<Vec<_>>()
            .join("\n");
        format!("{}\nRecent steps:\n{}", digest.text, tail)
    };

    Ok(fit_budget(&rendered, budget_tokens))
}

/// Reuse the stored digest while it still covers enough of the prefix;
/// rebuild once the uncovered stretch exceeds half the threshold.
async fn current_digest(
    store: &SessionStore,
    session_id: &str,
    steps: &[Step],
    cut: usize,
    threshold: usize,
) -> Result<Digest, SessionError> {
    if let Some(stored) = store.read_digest(session_id).await? {
        let uncovered = cut.saturating_sub(stored.covers_steps);
        if uncovered <= threshold / 2 {
            return Ok(stored);
        }
    }

    let digest = Digest {
        text: build_digest(&steps[..cut]),
        covers_steps: cut,
        created_at: Utc::now(),
    };
    store.write_digest(session_id, &digest).await?;
    Ok(digest)
}

/// Heuristic digest of a step prefix: outcomes, tool usage, errors.
fn build_digest(steps: &[Step]) -> String {
    let mut tools: BTreeMap<String, usize> = BTreeMap::new();
    let mut answers: Vec<&str> = Vec::new();
    let mut errors: Vec<&str> = Vec::new();

    for step in steps {
        match step.kind {
            StepKind::ToolCall => {
                if let Some(name) = &step.tool_name {
                    *tools.entry(name.clone()).or_default() += 1;
                }
            }
            StepKind::Answer => answers.push(step.output.as_str()),
            StepKind::Error => errors.push(step.output.as_str()),
            _ => {}
        }
    }

    let mut out = format!("Earlier in this session ({} steps):", steps.len());
    if !answers.is_empty() {
        out.push_str("\nAnswers produced:");
        for answer in answers.iter().rev().take(5).rev() {
            out.push_str(&format!("\n- {}", truncate(answer, STEP_RENDER_CAP)));
        }
    }
    if !tools.is_empty() {
        let usage: Vec<String> = tools
            .iter()
            .map(|(name, count)| format!("{name} ({count}x)"))
            .collect();
        out.push_str(&format!("\nTools used: {}", usage.join(", ")));
    }
    if !errors.is_empty() {
        out.push_str(&format!(
            "\nErrors encountered: {}",
            truncate(errors.last().unwrap_or(&""), STEP_RENDER_CAP)
        ));
    }
    out
}

fn render_step(step: &Step) -> String {
    let label = match step.kind {
        StepKind::Think => "think",
        StepKind::ToolCall => "tool_call",
        StepKind::ToolResult => "tool_result",
        StepKind::Answer => "answer",
        StepKind::Error => "error",
    };
    let detail = match (step.kind, &step.tool_name, &step.tool_action) {
        (StepKind::ToolCall, Some(server), Some(action)) => {
            format!("{server}.{action}")
        }
        _ => truncate(&step.output, STEP_RENDER_CAP),
    };
    format!("[{label}] {detail}")
}

/// Fit text into a token budget, keeping the tail (most recent context).
fn fit_budget(text: &str, budget_tokens: usize) -> String {
    let budget_chars = budget_tokens.saturating_mul(4);
    if text.chars().count() <= budget_chars {
        return text.to_string();
    }
    let tail: String = text
        .chars()
        .rev()
        .take(budget_chars.saturating_sub(1))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{tail}")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_chars).collect();
        format!("{kept}…")
    }
}
