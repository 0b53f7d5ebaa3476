//! Bounded output formatting
//!
//! Sandboxed code can return arbitrarily deep or large values. Rendering
//! them naively would let a single pathological output burn unbounded CPU
//! and log space, so formatting is depth- and length-capped with explicit
//! elision markers. The caps are deliberately small: the formatted string
//! is a human-readable preview, not a faithful serialization. The raw
//! value travels separately in `ExecutionResult::output`.

use crate::core_types::OutputType;
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub max_depth: usize,
    pub max_items: usize,
    pub max_string_len: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_items: 50,
            max_string_len: 2_000,
        }
    }
}

/// Classify a JSON value into the output-type tag carried on results.
pub fn output_type_of(value: &Value) -> OutputType {
    match value {
        Value::Null => OutputType::Null,
        Value::Bool(_) => OutputType::Boolean,
        Value::Number(_) => OutputType::Number,
        Value::String(_) => OutputType::String,
        Value::Array(_) => OutputType::Array,
        Value::Object(_) => OutputType::Object,
    }
}

/// Render a value with bounded recursion and item/string caps.
pub fn format_value(value: &Value, options: &FormatOptions) -> String {
    let mut out = String::new();
    write_value(&mut out, value, options, 0);
    out
}

fn write_value(out: &mut String, value: &Value, options: &FormatOptions, depth: usize) {
    if depth > options.max_depth {
        out.push_str("...");
        return;
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            if s.len() > options.max_string_len {
                let mut end = options.max_string_len;
                while !s.is_char_boundary(end) {
                    end -= 1;
                }
                out.push_str(&s[..end]);
                out.push_str("...(truncated)");
            } else {
                out.push_str(s);
            }
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().take(options.max_items).enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item, options, depth + 1);
            }
            if items.len() > options.max_items {
                out.push_str(&format!(", ...({} more)", items.len() - options.max_items));
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().take(options.max_items).enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(key);
                out.push_str(": ");
                write_value(out, item, options, depth + 1);
            }
            if map.len() > options.max_items {
                out.push_str(&format!(", ...({} more)", map.len() - options.max_items));
            }
            out.push('}');
        }
    }
}
