//! Detection of XML tool invocations in assistant text.
//!
//! Two shapes are accepted:
//!
//! ```text
//! <function_calls>
//! <invoke name="search_web">
//! <parameter name="query">rust</parameter>
//! </invoke>
//! </function_calls>
//! ```
//!
//! and, for registered tool names only, the compact forms
//! `<search_web query="rust"/>` and `<ask>Which file?</ask>`.

use std::collections::HashMap;

use agentcore_traits::ToolSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::tools::coerce_arguments;

const FUNCTION_CALLS_OPEN: &str = "<function_calls";
const FUNCTION_CALLS_CLOSE: &str = "</function_calls>";
const BODY_PARAMETER_NAMES: [&str; 4] = ["text", "content", "body", "message"];

static INVOKE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<invoke\s+name\s*=\s*["']([^"']+)["']\s*>(.*?)</invoke>"#).expect("Invalid invoke regex")
});

static PARAMETER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<parameter\s+name\s*=\s*["']([^"']+)["']\s*>(.*?)</parameter>"#).expect("Invalid parameter regex")
});

static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_][\w\-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("Invalid attribute regex")
});

/// One parsed invocation with schema-coerced arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlToolCall {
    pub name: String,
    pub arguments: Value,
    pub raw: String,
}

/// A closed block and the byte range it occupies.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlBlock {
    pub start: usize,
    pub end: usize,
    pub calls: Vec<XmlToolCall>,
}

enum Attempt {
    Complete(XmlBlock),
    Incomplete,
}

#[derive(Debug, Clone, Default)]
pub struct XmlToolParser {
    schemas: HashMap<String, Value>,
}

impl XmlToolParser {
    pub fn new(schemas: &[ToolSchema]) -> Self {
        Self {
            schemas: schemas
                .iter()
                .map(|schema| (schema.name.clone(), schema.parameters.clone()))
                .collect(),
        }
    }

    /// First closed block starting at or after byte `from`.
    ///
    /// While streaming (`finished == false`) an unclosed candidate stops
    /// the scan, so blocks are reported in text order. Once the stream has
    /// ended, unclosed candidates are skipped.
    pub fn next_block(&self, text: &str, from: usize, finished: bool) -> Option<XmlBlock> {
        let mut cursor = from;
        while let Some(offset) = text.get(cursor..).and_then(|rest| rest.find('<')) {
            let start = cursor + offset;
            let attempt = if is_function_calls_open(&text[start..]) {
                Some(self.parse_function_calls(text, start))
            } else {
                self.compact_name(&text[start..])
                    .map(|name| self.parse_compact(text, start, name))
            };
            match attempt {
                Some(Attempt::Complete(block)) => return Some(block),
                Some(Attempt::Incomplete) if !finished => return None,
                _ => cursor = start + 1,
            }
        }
        None
    }

    /// Every call in a complete text, in order.
    pub fn parse_all(&self, text: &str) -> Vec<XmlToolCall> {
        let mut calls = Vec::new();
        let mut cursor = 0;
        while let Some(block) = self.next_block(text, cursor, true) {
            cursor = block.end;
            calls.extend(block.calls);
        }
        calls
    }

    fn parse_function_calls(&self, text: &str, start: usize) -> Attempt {
        let Some(close) = text[start..].find(FUNCTION_CALLS_CLOSE) else {
            return Attempt::Incomplete;
        };
        let end = start + close + FUNCTION_CALLS_CLOSE.len();
        let inner = &text[start..start + close];

        let calls = INVOKE_RE
            .captures_iter(inner)
            .map(|invoke| {
                let name = invoke[1].trim().to_string();
                let raw_parameters = PARAMETER_RE
                    .captures_iter(&invoke[2])
                    .map(|param| (param[1].trim().to_string(), unescape(param[2].trim())))
                    .collect();
                XmlToolCall {
                    arguments: coerce_arguments(self.schema_of(&name), raw_parameters),
                    raw: invoke[0].to_string(),
                    name,
                }
            })
            .collect();

        Attempt::Complete(XmlBlock { start, end, calls })
    }

    fn parse_compact(&self, text: &str, start: usize, name: &str) -> Attempt {
        let attributes_start = start + 1 + name.len();
        let Some(tag_end) = find_tag_end(text, attributes_start) else {
            return Attempt::Incomplete;
        };
        let opening = &text[attributes_start..tag_end];
        let self_closing = opening.trim_end().ends_with('/');
        let attributes = opening.trim_end().trim_end_matches('/');

        let mut raw_parameters: Vec<(String, String)> = ATTRIBUTE_RE
            .captures_iter(attributes)
            .map(|attr| {
                let value = attr.get(2).or_else(|| attr.get(3)).map_or("", |m| m.as_str());
                (attr[1].to_string(), unescape(value))
            })
            .collect();

        let end = if self_closing {
            tag_end + 1
        } else {
            let closing = format!("</{name}>");
            let Some(close) = text[tag_end + 1..].find(&closing) else {
                return Attempt::Incomplete;
            };
            let body = &text[tag_end + 1..tag_end + 1 + close];
            if PARAMETER_RE.is_match(body) {
                raw_parameters.extend(
                    PARAMETER_RE
                        .captures_iter(body)
                        .map(|param| (param[1].trim().to_string(), unescape(param[2].trim()))),
                );
            } else if !body.trim().is_empty() {
                let target = body_parameter(self.schema_of(name), &raw_parameters);
                raw_parameters.push((target, unescape(body.trim())));
            }
            tag_end + 1 + close + closing.len()
        };

        Attempt::Complete(XmlBlock {
            start,
            end,
            calls: vec![XmlToolCall {
                name: name.to_string(),
                arguments: coerce_arguments(self.schema_of(name), raw_parameters),
                raw: text[start..end].to_string(),
            }],
        })
    }

    /// Registered tool name opening a compact tag at the head of `rest`.
    fn compact_name<'a>(&self, rest: &'a str) -> Option<&'a str> {
        let after = &rest[1..];
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(after.len());
        let name = &after[..len];
        let delimiter = after[len..].chars().next()?;
        if !(delimiter.is_whitespace() || delimiter == '/' || delimiter == '>') {
            return None;
        }
        self.schemas.contains_key(name).then_some(name)
    }

    fn schema_of(&self, name: &str) -> &Value {
        static EMPTY: Value = Value::Null;
        self.schemas.get(name).unwrap_or(&EMPTY)
    }
}

fn is_function_calls_open(rest: &str) -> bool {
    rest.strip_prefix(FUNCTION_CALLS_OPEN)
        .and_then(|tail| tail.chars().next())
        .is_some_and(|c| c == '>' || c.is_whitespace())
}

/// Index of the `>` closing an opening tag, ignoring quoted attribute values.
fn find_tag_end(text: &str, from: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (offset, c) in text[from..].char_indices() {
        match (quote, c) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(from + offset),
            (None, '<') => return None,
            _ => {}
        }
    }
    None
}

/// Parameter receiving the element body of a compact call.
fn body_parameter(schema: &Value, given: &[(String, String)]) -> String {
    let is_given = |name: &str| given.iter().any(|(key, _)| key == name);
    let properties = schema.get("properties").and_then(Value::as_object);
    let is_string = |name: &str| {
        properties
            .and_then(|props| props.get(name))
            .and_then(|prop| prop.get("type"))
            .is_some_and(|kind| kind == "string")
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let candidate = required
            .iter()
            .filter_map(Value::as_str)
            .find(|name| !is_given(name) && is_string(name));
        if let Some(name) = candidate {
            return name.to_string();
        }
    }
    if let Some(name) = BODY_PARAMETER_NAMES
        .iter()
        .find(|name| !is_given(name) && properties.is_some_and(|props| props.contains_key(**name)))
    {
        return name.to_string();
    }
    properties
        .and_then(|props| props.keys().find(|name| !is_given(name) && is_string(name)))
        .cloned()
        .unwrap_or_else(|| "content".to_string())
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
