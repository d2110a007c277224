#![forbid(unsafe_code)]

//! YAML front-matter codec for task files.
//!
//! A task file is an optional header block delimited by `---` lines followed by a
//! free-form Markdown body:
//!
//! ```text
//! ---
//! title: Implement login
//! status: todo
//! tags: [auth]
//! ---
//!
//! Body text.
//! ```
//!
//! Header keys keep their order and unknown keys are carried through untouched, so an
//! operator's own fields survive a rewrite.

use serde_yaml::{Mapping, Value};
use thiserror::Error;

const DELIMITER: &str = "---";

#[derive(Debug, Error)]
pub enum FrontMatterError {
    #[error("front matter is not valid YAML: {0}")]
    InvalidYaml(String),
    #[error("front matter must be a mapping of keys to values")]
    NotAMapping,
    #[error("failed to serialize front matter: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub metadata: Mapping,
    pub body: String,
}

impl Document {
    #[must_use]
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            metadata: Mapping::new(),
            body: normalize_body(&body.into()),
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(value_to_string)
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        parse_list_value(self.metadata.get(key))
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.metadata
            .insert(Value::String(key.to_owned()), Value::String(value.into()));
    }

    pub fn set_list(&mut self, key: &str, values: &[String]) {
        let seq = values.iter().cloned().map(Value::String).collect();
        self.metadata
            .insert(Value::String(key.to_owned()), Value::Sequence(seq));
    }
}

/// Splits `text` into header and body. Text without a leading `---` line, or whose
/// opening `---` is never closed, is all body.
pub fn decode(text: &str) -> Result<Document, FrontMatterError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let lines: Vec<&str> = text.lines().collect();
    if lines.first().map(|l| l.trim_end()) != Some(DELIMITER) {
        return Ok(Document::new(text));
    }

    // An unclosed opening line is a Markdown horizontal rule.
    let Some(end_idx) = lines
        .iter()
        .skip(1)
        .position(|line| line.trim_end() == DELIMITER)
        .map(|idx| idx + 1)
    else {
        return Ok(Document::new(text));
    };

    let front = lines[1..end_idx].join("\n");
    let body = lines[end_idx + 1..].join("\n");

    Ok(Document {
        metadata: parse_header(&front)?,
        body: normalize_body(&body),
    })
}

pub fn encode(doc: &Document) -> Result<String, FrontMatterError> {
    let mut out = String::from(DELIMITER);
    out.push('\n');
    if !doc.metadata.is_empty() {
        let header = serde_yaml::to_string(&doc.metadata)
            .map_err(|e| FrontMatterError::Serialize(e.to_string()))?;
        out.push_str(&header);
        if !header.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str(DELIMITER);
    out.push('\n');

    let body = normalize_body(&doc.body);
    if !body.is_empty() {
        out.push('\n');
        out.push_str(&body);
        out.push('\n');
    }
    Ok(out)
}

fn parse_header(front: &str) -> Result<Mapping, FrontMatterError> {
    if front.trim().is_empty() {
        return Ok(Mapping::new());
    }
    match serde_yaml::from_str::<Value>(front) {
        Ok(Value::Mapping(map)) => Ok(map),
        Ok(Value::Null) => Ok(Mapping::new()),
        Ok(_) => Err(FrontMatterError::NotAMapping),
        Err(e) => Err(FrontMatterError::InvalidYaml(e.to_string())),
    }
}

fn normalize_body(body: &str) -> String {
    body.trim().to_owned()
}

/// Accepts a YAML sequence, a `[a, b]` string, or a scalar.
#[must_use]
pub fn parse_list_value(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(value_to_string)
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => parse_list_string(s),
        Some(other) => value_to_string(other)
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .map(|s| vec![s])
            .unwrap_or_default(),
    }
}

fn parse_list_string(value: &str) -> Vec<String> {
    let raw = value.trim();
    let inner = raw
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .unwrap_or(raw)
        .trim();
    if inner.is_empty() {
        return Vec::new();
    }
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(['"', '\'']).trim().to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        _ => serde_yaml::to_string(value)
            .ok()
            .map(|s| s.trim().to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_header_and_body() {
        let text = "---\ntitle: Example\nstatus: review\ntags: [ops, api]\nowner_note: keep me\n---\n\n# Heading\n\nBody.\n";
        let doc = decode(text).unwrap();
        assert_eq!(doc.get_str("title").as_deref(), Some("Example"));
        assert_eq!(doc.get_str("status").as_deref(), Some("review"));
        assert_eq!(doc.get_list("tags"), vec!["ops", "api"]);
        assert_eq!(doc.get_str("owner_note").as_deref(), Some("keep me"));
        assert_eq!(doc.body, "# Heading\n\nBody.");
    }

    #[test]
    fn text_without_header_is_all_body() {
        let doc = decode("Just notes\nStatus: done\n").unwrap();
        assert!(doc.metadata.is_empty());
        assert_eq!(doc.body, "Just notes\nStatus: done");
    }

    #[test]
    fn unclosed_opening_rule_is_body() {
        let text = "---\nMeeting notes\n\nStatus: review\n";
        let doc = decode(text).unwrap();
        assert!(doc.metadata.is_empty());
        assert_eq!(doc.body, "---\nMeeting notes\n\nStatus: review");
    }

    #[test]
    fn malformed_headers_are_errors() {
        assert!(matches!(
            decode("---\ntitle: [unclosed\n---\nbody\n"),
            Err(FrontMatterError::InvalidYaml(_))
        ));
        assert!(matches!(
            decode("---\n- a\n- b\n---\nbody\n"),
            Err(FrontMatterError::NotAMapping)
        ));
    }

    #[test]
    fn empty_header_decodes_to_empty_mapping() {
        let doc = decode("---\n---\nbody").unwrap();
        assert!(doc.metadata.is_empty());
        assert_eq!(doc.body, "body");
    }

    #[test]
    fn round_trip_preserves_metadata_order_and_body() {
        let text = "---\nzeta: last-added-first\ntitle: Round trip\nstatus: todo\ncreated_at: 2025-06-22 10:00:00.123456\nartifacts:\n- a.txt\n- b.txt\nestimate: 3\n---\n\n  Body with `code`\n\n- item\n\n";
        let doc = decode(text).unwrap();
        let encoded = encode(&doc).unwrap();
        let again = decode(&encoded).unwrap();
        assert_eq!(again, doc);

        let keys: Vec<String> = again
            .metadata
            .keys()
            .filter_map(|k| k.as_str().map(str::to_owned))
            .collect();
        assert_eq!(
            keys,
            vec!["zeta", "title", "status", "created_at", "artifacts", "estimate"]
        );
        assert_eq!(encode(&again).unwrap(), encoded);
    }

    #[test]
    fn encode_of_empty_body_has_no_trailing_section() {
        let mut doc = Document::new("");
        doc.set_str("status", "done");
        assert_eq!(encode(&doc).unwrap(), "---\nstatus: done\n---\n");
    }

    #[test]
    fn list_values_accept_strings_and_sequences() {
        let v = Value::String("[a, 'b', \"c\"]".to_owned());
        assert_eq!(parse_list_value(Some(&v)), vec!["a", "b", "c"]);
        let v = Value::String("solo".to_owned());
        assert_eq!(parse_list_value(Some(&v)), vec!["solo"]);
        assert!(parse_list_value(None).is_empty());
    }
}
