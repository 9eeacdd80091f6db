//! Prompt construction.
//!
//! Builds the initial message set for a reasoning task: the tool-use
//! contract, the live capability catalog, an optional session preamble, and
//! the task description verbatim. Pure and deterministic: the same inputs
//! always produce the same messages, and the catalog is whatever snapshot
//! the registry handed over, never a hard-coded list.

use crate::llm::ChatMessage;
use crate::orchestrator::{CatalogEntry, ParamType, ParameterSpec};

/// Builds the initial conversation for a task.
pub struct PromptBuilder;

impl PromptBuilder {
    /// Produce the initial message set.
    pub fn build(
        task_description: &str,
        catalog: &[CatalogEntry],
        preamble: Option<&str>,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(3);
        messages.push(ChatMessage::system(Self::system_message(catalog)));
        if let Some(context) = preamble {
            if !context.trim().is_empty() {
                messages.push(ChatMessage::system(format!(
                    "Context from earlier tasks in this session:\n{context}"
                )));
            }
        }
        messages.push(ChatMessage::user(task_description));
        messages
    }

    fn system_message(catalog: &[CatalogEntry]) -> String {
        let mut out = String::with_capacity(2048);
        out.push_str(
            "You are a task-solving agent. You work in rounds: reason, then either \
             call exactly one tool or give your final answer.\n\n\
             Output grammar, per round:\n\
             - <think>your reasoning</think>, an optional scratch pad.\n\
             - A tool call: <SERVER><ACTION>{\"param\": \"value\"}</ACTION></SERVER> \
             followed by <execute_tools/>. Stop immediately after the tool call; the \
             real result will be appended to your message as a <result>...</result> \
             block before your next round.\n\
             - A final answer: <answer>your answer</answer>.\n\n\
             Rules:\n\
             - Call at most one tool per round, then stop and wait for its result.\n\
             - Never write a <result> block yourself. Results come only from real \
             tool execution; a fabricated result will be discarded.\n\
             - To run two independent tool calls concurrently, wrap exactly two tool \
             blocks in <parallel>...</parallel>.\n\
             - Parameters are one JSON object. Plain text instead of JSON is accepted \
             only for actions with exactly one required parameter.\n\n",
        );

        out.push_str("Available tools:\n");
        if catalog.is_empty() {
            out.push_str("(no tool servers are currently available)\n");
        }
        for entry in catalog {
            out.push_str(&format!("## {}\n", entry.server_id));
            for cap in &entry.capabilities {
                out.push_str(&format!("- {}: {}\n", cap.action, cap.description));
                for param in &cap.parameters {
                    out.push_str(&format!(
                        "    {}{} ({}): {}{}\n",
                        param.name,
                        if param.required { "*" } else { "" },
                        param.param_type.as_str(),
                        param.description,
                        param
                            .default
                            .as_ref()
                            .map(|d| format!(" [default: {d}]"))
                            .unwrap_or_default(),
                    ));
                }
            }
        }

        out.push_str("\nExamples:\n");
        let (first, second) = Self::example_pair(catalog);
        out.push_str(&format!("Example 1, calling a tool:\n{first}\n"));
        out.push_str(&format!("Example 2, calling a tool and then answering:\n{second}\n"));

        out
    }

    /// Exactly two worked examples. Drawn from the live catalog when it has
    /// capabilities, falling back to a neutral placeholder otherwise.
    fn example_pair(catalog: &[CatalogEntry]) -> (String, String) {
        let mut flattened = catalog.iter().flat_map(|entry| {
            entry
                .capabilities
                .iter()
                .map(move |cap| (entry.server_id.as_str(), cap))
        });

        let first = flattened
            .next()
            .map(|(server, cap)| Self::render_call_example(server, &cap.action, &cap.parameters))
            .unwrap_or_else(|| {
                Self::render_call_example(
                    "calculator",
                    "evaluate",
                    &[ParameterSpec {
                        name: "expression".to_string(),
                        param_type: ParamType::String,
                        required: true,
                        description: String::new(),
                        default: None,
                    }],
                )
            });

        let second = format!(
            "{}\n<result>(tool output appears here)</result>\n<answer>final answer based on the result</answer>",
            flattened
                .next()
                .map(|(server, cap)| Self::render_call_example(
                    server,
                    &cap.action,
                    &cap.parameters
                ))
                .unwrap_or_else(|| first.clone()),
        );

        (first, second)
    }

    fn render_call_example(server: &str, action: &str, params: &[ParameterSpec]) -> String {
        let mut object = serde_json::Map::new();
        for param in params.iter().filter(|p| p.required) {
            object.insert(param.name.clone(), sample_value(param));
        }
        let body = serde_json::Value::Object(object).to_string();
        format!(
            "<think>I should use {server}.</think>\n<{server}><{action}>{body}</{action}></{server}>\n<execute_tools/>"
        )
    }
}

fn sample_value(param: &ParameterSpec) -> serde_json::Value {
    if let Some(default) = &param.default {
        return default.clone();
    }
    match param.param_type {
        ParamType::String => serde_json::Value::String("...".to_string()),
        ParamType::Integer => serde_json::json!(1),
        ParamType::Number => serde_json::json!(1.0),
        ParamType::Boolean => serde_json::json!(true),
        ParamType::Array => serde_json::json!([]),
        ParamType::Object => serde_json::json!({}),
    }
}
