//! GBNF grammar compilation
//!
//! The grammar restricts generation to a flat JSON object whose keys come
//! from the schema: numeric keys take number literals, bool keys take
//! `true`/`false`. Keys are sorted so the same schema always yields the same
//! text. The grammar is advisory; the validator still checks everything.

use crate::schema::{Schema, SocketType};
use serde_json::Value;

const PRIMITIVES: &str = r#"boolean ::= "true" | "false"
number  ::= integer frac? exp?
integer ::= "-"? ("0" | [1-9] [0-9]*)
frac    ::= "." [0-9]+
exp     ::= ("e" | "E") ("+" | "-")? [0-9]+
ws ::= [ \t\n\r]*
"#;

const OBJECT_ROOT: &str = r#"root ::= ws "{" ws members? ws "}" ws"#;
const EMPTY_ROOT: &str = r#"root ::= ws "{" ws "}" ws"#;

/// Compile a schema into a GBNF grammar with `root` as the start rule.
pub fn compile_grammar(schema: &Schema) -> String {
    let mut number_keys = keys_where(schema, SocketType::is_numeric);
    let mut bool_keys = keys_where(schema, |ty| *ty == SocketType::Bool);
    number_keys.sort_unstable();
    bool_keys.sort_unstable();

    let mut lines: Vec<String> = Vec::new();
    match (number_keys.is_empty(), bool_keys.is_empty()) {
        (false, false) => {
            lines.push(OBJECT_ROOT.to_string());
            lines.push(r#"members ::= pair (ws "," ws pair)*"#.to_string());
            lines.push("pair ::= number_pair | bool_pair".to_string());
            lines.extend(number_rules(&number_keys));
            lines.extend(bool_rules(&bool_keys));
        }
        (false, true) => {
            lines.push(OBJECT_ROOT.to_string());
            lines.push(r#"members ::= number_pair (ws "," ws number_pair)*"#.to_string());
            lines.extend(number_rules(&number_keys));
        }
        (true, false) => {
            lines.push(OBJECT_ROOT.to_string());
            lines.push(r#"members ::= bool_pair (ws "," ws bool_pair)*"#.to_string());
            lines.extend(bool_rules(&bool_keys));
        }
        (true, true) => lines.push(EMPTY_ROOT.to_string()),
    }

    lines.push(String::new());
    lines.push(PRIMITIVES.to_string());
    lines.join("\n")
}

fn keys_where(schema: &Schema, keep: impl Fn(&SocketType) -> bool) -> Vec<&str> {
    schema
        .iter()
        .filter(|(_, spec)| keep(&spec.ty))
        .map(|(key, _)| key)
        .collect()
}

fn number_rules(keys: &[&str]) -> [String; 2] {
    [
        r#"number_pair ::= number_key ws ":" ws number"#.to_string(),
        format!("number_key ::= {}", alternatives(keys)),
    ]
}

fn bool_rules(keys: &[&str]) -> [String; 2] {
    [
        r#"bool_pair ::= bool_key ws ":" ws boolean"#.to_string(),
        format!("bool_key ::= {}", alternatives(keys)),
    ]
}

fn alternatives(keys: &[&str]) -> String {
    keys.iter()
        .map(|key| key_literal(key))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// GBNF literal matching the JSON-encoded key, quotes included.
fn key_literal(key: &str) -> String {
    let json_key = Value::String(key.to_string()).to_string();
    let mut literal = String::with_capacity(json_key.len() + 8);
    literal.push('"');
    for ch in json_key.chars() {
        match ch {
            '"' => literal.push_str("\\\""),
            '\\' => literal.push_str("\\\\"),
            '\n' => literal.push_str("\\n"),
            '\r' => literal.push_str("\\r"),
            '\t' => literal.push_str("\\t"),
            other => literal.push(other),
        }
    }
    literal.push('"');
    literal
}
