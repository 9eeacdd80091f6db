//! Prompt & response codec.
//!
//! [`prompt`] builds the initial message set (contract, live capability
//! catalog, session preamble, task). [`parser`] is the incremental tag
//! parser that turns the model's streamed output into typed events the
//! reasoning engine can act on mid-generation.

pub mod parser;
pub mod prompt;

pub use parser::{ResponseEvent, StreamParser};
pub use prompt::PromptBuilder;

/// Scratch-pad tag; echoed into the trajectory, never trusted for control.
pub const TAG_THINK: &str = "think";
/// Terminal answer tag.
pub const TAG_ANSWER: &str = "answer";
/// Result tag. Only the engine may produce it; in model output it marks a
/// fabricated result.
pub const TAG_RESULT: &str = "result";
/// Optional marker flushing the preceding tool call.
pub const TAG_EXECUTE_TOOLS: &str = "execute_tools";
/// Wrapper for concurrent tool calls.
pub const TAG_PARALLEL: &str = "parallel";

/// Stop sequences handed to the provider on every completion. These are the
/// only in-band way to force the model to yield after the first tool block:
/// the tool terminator, the answer terminator, and, defensively, the
/// opening of a fabricated result.
pub fn stop_sequences() -> Vec<String> {
    vec![
        format!("</{TAG_EXECUTE_TOOLS}>"),
        format!("</{TAG_ANSWER}>"),
        format!("<{TAG_RESULT}"),
    ]
}
