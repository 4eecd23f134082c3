//! The `KEY: value` output grammar spoken by agents.
//!
//! An agent reports its result as a sequence of `KEY: value` records. A key
//! matches `^[A-Z][A-Z0-9_]*$` (case-sensitive ASCII). A value starts after
//! the first `: ` and continues across subsequent lines until the next line
//! matching `^[A-Z][A-Z0-9_]*: ` (or a bare `KEY:`) or end of input. There is
//! no escaping: a continuation line that looks like a key line terminates the
//! previous value. A value may be a JSON blob on a single line, which is how
//! the `STORIES_JSON` loop-source contract is carried.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Output key carrying the loop-source story array.
pub const STORIES_JSON_KEY: &str = "STORIES_JSON";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("missing required outputs: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
    #[error("invalid {STORIES_JSON_KEY} array: {0}")]
    InvalidStories(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OutputError>;

/// One story record declared by an upstream planner step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorySeed {
    pub story_id: String,
    pub title: String,
    pub input: String,
}

/// Check whether `s` is a valid output key.
pub fn is_output_key(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Split a line into `(key, first value fragment)` if it starts a record.
fn split_key_line(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    let key = &line[..colon];
    if !is_output_key(key) {
        return None;
    }
    let rest = &line[colon + 1..];
    // Accept `KEY: value` and bare `KEY:`; reject `KEY:value` (not a record).
    if rest.is_empty() {
        Some((key, ""))
    } else {
        rest.strip_prefix(' ').map(|value| (key, value))
    }
}

/// Parsed agent output. Preserves declaration order; on duplicate keys the
/// last record wins for lookups.
#[derive(Debug, Clone, Default)]
pub struct ParsedOutputs {
    entries: Vec<(String, String)>,
}

impl ParsedOutputs {
    /// Parse a raw output block.
    ///
    /// Text before the first key line is ignored. Unknown keys are preserved.
    pub fn parse(raw: &str) -> Self {
        let mut entries: Vec<(String, String)> = Vec::new();
        let mut current: Option<(String, Vec<String>)> = None;

        for line in raw.lines() {
            if let Some((key, first)) = split_key_line(line) {
                if let Some((k, fragments)) = current.take() {
                    entries.push((k, join_value(fragments)));
                }
                current = Some((key.to_string(), vec![first.to_string()]));
            } else if let Some((_, fragments)) = current.as_mut() {
                fragments.push(line.to_string());
            }
        }
        if let Some((k, fragments)) = current {
            entries.push((k, join_value(fragments)));
        }

        Self { entries }
    }

    /// Look up a key; the last declaration wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Required keys that are absent or empty.
    pub fn missing_required(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|key| self.get(key).map_or(true, |v| v.trim().is_empty()))
            .cloned()
            .collect()
    }

    /// Validate the declared output contract.
    pub fn require(&self, required: &[String]) -> Result<()> {
        let missing = self.missing_required(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OutputError::MissingRequired(missing))
        }
    }

    /// Extract the `STORIES_JSON` array, if declared.
    ///
    /// Returns `Ok(None)` when the key is absent and an error when the value
    /// is not a valid story array.
    pub fn stories(&self) -> Result<Option<Vec<StorySeed>>> {
        match self.get(STORIES_JSON_KEY) {
            None => Ok(None),
            Some(value) => {
                let seeds: Vec<StorySeed> = serde_json::from_str(value)?;
                Ok(Some(seeds))
            }
        }
    }

    /// Fold this record set into a substitution map (last declaration wins).
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn join_value(fragments: Vec<String>) -> String {
    let joined = fragments.join("\n");
    joined.trim_end().to_string()
}

/// Resolve `{{KEY}}` placeholders in an input template.
///
/// Unresolvable placeholders render as the literal token `[missing: KEY]` so
/// the agent fails cleanly instead of papering over absent inputs. Braces that
/// do not wrap a valid key pass through untouched.
pub fn resolve_template(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let key = after[..close].trim();
                if is_output_key(key) {
                    match vars.get(key) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("[missing: ");
                            out.push_str(key);
                            out.push(']');
                        }
                    }
                } else {
                    out.push_str(&rest[open..open + 2 + close + 2]);
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
