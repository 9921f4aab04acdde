//! Chat prompt construction
//!
//! The system message enumerates the schema and the output contract; the user
//! message carries the free-text request plus a random tag so repeated
//! identical prompts do not collide.

use crate::schema::{Schema, SocketSpec, SocketType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// At most this many schema entries are described to the model
pub const MAX_SPEC_LINES: usize = 25;

/// A message in the chat sent to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// The role of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

const SYSTEM_PREAMBLE: &str = "You estimate parameters for a procedural generator.
Return ALL of the following keys as a single JSON object.
Respect each type (float/integer/bool) and its range. Do not add other keys.

# Parameters
";

const OUTPUT_RULES: &str = "
# Output rules
- Exactly one pure JSON object (first character '{', last character '}')
- Values are numbers or booleans only; no arrays, objects or strings
- No comments, explanations or code fences
- If you cannot follow these rules, return the empty object {}
";

/// One line per schema entry, in schema order, capped at [`MAX_SPEC_LINES`].
pub fn build_spec_block(schema: &Schema) -> String {
    let mut block = String::new();
    for (key, spec) in schema.iter().take(MAX_SPEC_LINES) {
        block.push_str(&spec_line(key, spec));
        block.push('\n');
    }
    block
}

fn spec_line(key: &str, spec: &SocketSpec) -> String {
    let default = format_value(spec.ty, &spec.default);
    match (spec.ty.is_numeric(), spec.min, spec.max) {
        (true, Some(lo), Some(hi)) => format!(
            "{key}: {} {}–{}  # {}, e.g. {} (default: {default})",
            spec.ty.as_str(),
            format_number(spec.ty, lo),
            format_number(spec.ty, hi),
            spec.description,
            format_number(spec.ty, (lo + hi) / 2.0),
        ),
        _ => format!(
            "{key}: {}  # {} (default: {default})",
            spec.ty.as_str(),
            spec.description
        ),
    }
}

fn format_number(ty: SocketType, x: f64) -> String {
    match ty {
        SocketType::Integer => format!("{}", x.round() as i64),
        _ => format!("{x:.2}"),
    }
}

fn format_value(ty: SocketType, value: &Value) -> String {
    match value.as_f64() {
        Some(x) if ty.is_numeric() => format_number(ty, x),
        _ => value.to_string(),
    }
}

/// Build the system + user messages for one request.
pub fn build_messages(schema: &Schema, prompt: &str, tag: u32) -> Vec<ChatMessage> {
    let mut system = String::from(SYSTEM_PREAMBLE);
    system.push_str(&build_spec_block(schema));
    system.push_str(OUTPUT_RULES);

    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("Generate parameters for: {prompt} | id:{tag}")),
    ]
}
