//! Incremental parser for the model's tagged output.
//!
//! Consumes token fragments as they arrive and emits typed events. The
//! grammar is deliberately shallow: three reserved top-level tag families
//! (`<think>`, `<answer>`, `<parallel>`) plus `<SERVER><ACTION>…</ACTION>
//! </SERVER>` tool calls. Anything else is normalized by best-effort
//! repair: unknown tags demote to think text and missing close tags
//! auto-close at stream end, with a repair counter the engine uses to
//! abandon turns that degrade into tag soup.
//!
//! A `<result>` tag in model output is always illegal (results are injected
//! by the engine, never generated) and short-circuits the parse.

use crate::codec::{TAG_ANSWER, TAG_EXECUTE_TOOLS, TAG_PARALLEL, TAG_RESULT, TAG_THINK};
use crate::llm::StopReason;

/// Longest tag we are willing to buffer before deciding `<` was literal text.
const MAX_TAG_LEN: usize = 96;

/// Typed event emitted by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    ThinkOpen,
    ThinkClose { text: String },
    AnswerOpen,
    AnswerClose { text: String },
    ToolCallOpen { server_id: String },
    ActionOpen { action: String },
    ToolCallParams { raw: String },
    ToolCallClose,
    ParallelOpen,
    ParallelClose,
    /// The model emitted `<result>` itself. Everything from here on is
    /// untrustworthy; the engine aborts generation.
    FabricatedResult,
    StreamEnd,
    StreamStopped { reason: StopReason },
}

#[derive(Debug)]
enum State {
    Top,
    Think { text: String },
    Answer { text: String },
    /// Server tag open, no action yet.
    Server { server_id: String, inner: String },
    /// Inside an action tag, accumulating raw parameters.
    Action {
        server_id: String,
        action: String,
        raw: String,
    },
    /// Action closed, awaiting the server close tag.
    ServerTail { server_id: String },
}

#[derive(Debug)]
struct Tag {
    name: String,
    closing: bool,
    self_closing: bool,
}

enum TagParse {
    /// A complete tag occupying `len` bytes of input.
    Complete(Tag, usize),
    /// Input ends mid-tag; wait for more.
    Partial,
    /// Not a tag; the `<` is literal text.
    Literal,
}

/// Incremental tag parser. Feed fragments with [`push`](Self::push), then
/// call [`finish`](Self::finish) exactly once when the stream ends.
pub struct StreamParser {
    state: State,
    in_parallel: bool,
    /// Unconsumed input tail (possibly a split tag).
    buf: String,
    /// Top-level prose pending demotion to think text.
    loose: String,
    repairs: u32,
    fabricated: bool,
    finished: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            state: State::Top,
            in_parallel: false,
            buf: String::new(),
            loose: String::new(),
            repairs: 0,
            fabricated: false,
            finished: false,
        }
    }

    /// Number of repairs applied so far in this turn.
    pub fn repairs(&self) -> u32 {
        self.repairs
    }

    /// Whether a fabricated `<result>` was seen.
    pub fn fabricated(&self) -> bool {
        self.fabricated
    }

    /// Feed a fragment of model output.
    pub fn push(&mut self, chunk: &str) -> Vec<ResponseEvent> {
        if self.fabricated || self.finished {
            return Vec::new();
        }

        self.buf.push_str(chunk);
        let input = std::mem::take(&mut self.buf);
        let mut events = Vec::new();
        let mut i = 0;

        while i < input.len() {
            let rest = &input[i..];
            match rest.find('<') {
                None => {
                    self.feed_text(rest);
                    i = input.len();
                }
                Some(j) => {
                    if j > 0 {
                        self.feed_text(&rest[..j]);
                        i += j;
                    }
                    let tag_input = &input[i..];
                    match parse_tag(tag_input) {
                        TagParse::Complete(tag, len) => {
                            let raw_slice = &tag_input[..len];
                            self.handle_tag(tag, raw_slice, &mut events);
                            i += len;
                            if self.fabricated {
                                return events;
                            }
                        }
                        TagParse::Partial => {
                            // Keep the split tag for the next push.
                            self.buf = tag_input.to_string();
                            return events;
                        }
                        TagParse::Literal => {
                            self.feed_text("<");
                            i += 1;
                        }
                    }
                }
            }
        }

        events
    }

    /// Close out the stream, auto-closing any open structure.
    ///
    /// Pass the provider's stop reason when it reported one; `None` yields a
    /// plain `StreamEnd`. Missing close tags for `<think>`/`<answer>` are
    /// not counted as repairs: the stop sequences cut exactly those tags
    /// off on every well-behaved turn.
    pub fn finish(&mut self, reason: Option<StopReason>) -> Vec<ResponseEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();

        // A dangling partial tag is literal text after all.
        if !self.buf.is_empty() && !self.fabricated {
            let tail = std::mem::take(&mut self.buf);
            self.feed_text(&tail);
        }

        if !self.fabricated {
            match std::mem::replace(&mut self.state, State::Top) {
                State::Top => {}
                State::Think { text } => events.push(ResponseEvent::ThinkClose { text }),
                State::Answer { text } => events.push(ResponseEvent::AnswerClose { text }),
                State::Server { inner, .. } => {
                    // Opened like a tool call but never produced an action.
                    self.repairs += 1;
                    self.loose.push_str(&inner);
                }
                State::Action {
                    raw, ..
                } => {
                    // Truncated mid-parameters; close it and let parameter
                    // validation sort out what is left.
                    self.repairs += 1;
                    events.push(ResponseEvent::ToolCallParams { raw });
                    events.push(ResponseEvent::ToolCallClose);
                }
                State::ServerTail { .. } => {
                    events.push(ResponseEvent::ToolCallClose);
                }
            }

            if self.in_parallel {
                self.in_parallel = false;
                events.push(ResponseEvent::ParallelClose);
            }

            self.flush_loose(&mut events);
        }

        match reason {
            Some(reason) => events.push(ResponseEvent::StreamStopped { reason }),
            None => events.push(ResponseEvent::StreamEnd),
        }
        events
    }

    fn feed_text(&mut self, text: &str) {
        match &mut self.state {
            State::Top => self.loose.push_str(text),
            State::Think { text: t } | State::Answer { text: t } => t.push_str(text),
            State::Server { inner, .. } => inner.push_str(text),
            State::Action { raw, .. } => raw.push_str(text),
            State::ServerTail { .. } => {
                if !text.trim().is_empty() {
                    self.loose.push_str(text);
                }
            }
        }
    }

    fn flush_loose(&mut self, events: &mut Vec<ResponseEvent>) {
        if !self.loose.trim().is_empty() {
            let text = std::mem::take(&mut self.loose).trim().to_string();
            events.push(ResponseEvent::ThinkOpen);
            events.push(ResponseEvent::ThinkClose { text });
        } else {
            self.loose.clear();
        }
    }

    fn handle_tag(&mut self, tag: Tag, raw_slice: &str, events: &mut Vec<ResponseEvent>) {
        // A result tag is illegal in every state.
        if tag.name == TAG_RESULT && !tag.closing {
            // Salvage whatever structure completed before the fabrication.
            match std::mem::replace(&mut self.state, State::Top) {
                State::Think { text } => events.push(ResponseEvent::ThinkClose { text }),
                State::Answer { text } => events.push(ResponseEvent::AnswerClose { text }),
                State::ServerTail { .. } => events.push(ResponseEvent::ToolCallClose),
                _ => {}
            }
            self.flush_loose(events);
            self.fabricated = true;
            events.push(ResponseEvent::FabricatedResult);
            return;
        }

        match &mut self.state {
            State::Top => self.handle_tag_top(tag, events),
            State::Think { text } => {
                if tag.closing && tag.name == TAG_THINK {
                    let text = std::mem::take(text);
                    self.state = State::Top;
                    events.push(ResponseEvent::ThinkClose { text });
                } else {
                    // Tags inside the scratch pad are literal text.
                    text.push_str(raw_slice);
                }
            }
            State::Answer { text } => {
                if tag.closing && tag.name == TAG_ANSWER {
                    let text = std::mem::take(text);
                    self.state = State::Top;
                    events.push(ResponseEvent::AnswerClose { text });
                } else {
                    text.push_str(raw_slice);
                }
            }
            State::Server { server_id, inner } => {
                if tag.closing && tag.name == *server_id {
                    // No action inside: demote the whole block to think text.
                    self.repairs += 1;
                    let inner = std::mem::take(inner);
                    self.loose.push_str(&inner);
                    self.state = State::Top;
                } else if !tag.closing && !tag.self_closing {
                    let server_id = server_id.clone();
                    let action = tag.name;
                    events.push(ResponseEvent::ToolCallOpen {
                        server_id: server_id.clone(),
                    });
                    events.push(ResponseEvent::ActionOpen {
                        action: action.clone(),
                    });
                    self.state = State::Action {
                        server_id,
                        action,
                        raw: String::new(),
                    };
                } else {
                    self.repairs += 1;
                }
            }
            State::Action {
                server_id,
                action,
                raw,
            } => {
                if tag.closing && tag.name == *action {
                    let server_id = server_id.clone();
                    let raw = std::mem::take(raw);
                    events.push(ResponseEvent::ToolCallParams { raw });
                    self.state = State::ServerTail { server_id };
                } else {
                    // Parameters may legitimately contain angle brackets.
                    raw.push_str(raw_slice);
                }
            }
            State::ServerTail { server_id } => {
                if tag.closing && tag.name == *server_id {
                    self.state = State::Top;
                    events.push(ResponseEvent::ToolCallClose);
                } else if !tag.closing && !tag.self_closing {
                    // A second action in the same server block: close the
                    // finished call and open another.
                    let server_id = server_id.clone();
                    events.push(ResponseEvent::ToolCallClose);
                    events.push(ResponseEvent::ToolCallOpen {
                        server_id: server_id.clone(),
                    });
                    events.push(ResponseEvent::ActionOpen {
                        action: tag.name.clone(),
                    });
                    self.state = State::Action {
                        server_id,
                        action: tag.name,
                        raw: String::new(),
                    };
                } else {
                    self.repairs += 1;
                }
            }
        }
    }

    fn handle_tag_top(&mut self, tag: Tag, events: &mut Vec<ResponseEvent>) {
        if tag.closing {
            match tag.name.as_str() {
                TAG_PARALLEL if self.in_parallel => {
                    self.in_parallel = false;
                    events.push(ResponseEvent::ParallelClose);
                }
                TAG_EXECUTE_TOOLS => {}
                _ => {
                    // Orphan close tag.
                    self.repairs += 1;
                }
            }
            return;
        }

        match tag.name.as_str() {
            TAG_THINK => {
                self.flush_loose(events);
                events.push(ResponseEvent::ThinkOpen);
                self.state = State::Think { text: String::new() };
            }
            TAG_ANSWER => {
                self.flush_loose(events);
                events.push(ResponseEvent::AnswerOpen);
                self.state = State::Answer { text: String::new() };
            }
            TAG_PARALLEL => {
                if self.in_parallel || tag.self_closing {
                    self.repairs += 1;
                } else {
                    self.flush_loose(events);
                    self.in_parallel = true;
                    events.push(ResponseEvent::ParallelOpen);
                }
            }
            TAG_EXECUTE_TOOLS => {
                // Legal terminator, present or absent; nothing to flush that
                // the tool-call close did not already flush.
            }
            _ => {
                if tag.self_closing {
                    self.repairs += 1;
                } else {
                    self.flush_loose(events);
                    self.state = State::Server {
                        server_id: tag.name,
                        inner: String::new(),
                    };
                }
            }
        }
    }
}

/// Try to parse a tag at the start of `s` (which begins with `<`).
fn parse_tag(s: &str) -> TagParse {
    let bytes = s.as_bytes();
    debug_assert_eq!(bytes[0], b'<');

    let mut i = 1;
    let closing = if bytes.len() > 1 && bytes[1] == b'/' {
        i += 1;
        true
    } else {
        false
    };

    let name_start = i;
    while i < bytes.len() && is_tag_name_byte(bytes[i], i == name_start) {
        i += 1;
    }
    if i == name_start {
        // `<` followed by something that cannot start a tag name.
        return if i >= bytes.len() {
            TagParse::Partial
        } else {
            TagParse::Literal
        };
    }
    let name = &s[name_start..i];

    // Optional whitespace, optional self-close, then `>`.
    while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
        i += 1;
    }
    let mut self_closing = false;
    if i < bytes.len() && bytes[i] == b'/' && !closing {
        self_closing = true;
        i += 1;
    }

    if i >= bytes.len() {
        return if i > MAX_TAG_LEN {
            TagParse::Literal
        } else {
            TagParse::Partial
        };
    }
    if bytes[i] != b'>' {
        return TagParse::Literal;
    }

    TagParse::Complete(
        Tag {
            name: name.to_string(),
            closing,
            self_closing,
        },
        i + 1,
    )
}

fn is_tag_name_byte(b: u8, first: bool) -> bool {
    match b {
        b'a'..=b'z' | b'A'..=b'Z' | b'_' => true,
        b'0'..=b'9' | b'-' => !first,
        _ => false,
    }
}
