//! Turning raw model output into fully populated result types.
//!
//! Nothing in here fails: anything that cannot be extracted falls back to the
//! field's default and is reported through [`Normalized::Degraded`].

use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;

static LIST_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[*•+\-]\s+|\d{1,3}[.)]\s+)").expect("Valid regex pattern")
});

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?(?:\d+(?:\.\d+)?|\.\d+))\s*(%)?").expect("Valid regex pattern")
});

static RATIO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?(?:\d+(?:\.\d+)?|\.\d+))\s*/\s*(\d+(?:\.\d+)?)").expect("Valid regex pattern")
});

/// Name of a result field that had to be defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MissingField(pub &'static str);

impl MissingField {
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Serialize for MissingField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0)
    }
}

/// Outcome of normalizing a completion.
///
/// Both variants carry a result whose every field is populated; `Degraded`
/// additionally lists the fields that were filled with defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized<T> {
    Complete(T),
    Degraded { result: T, missing: Vec<MissingField> },
}

impl<T> Normalized<T> {
    pub fn from_parts(result: T, missing: Vec<MissingField>) -> Self {
        if missing.is_empty() {
            Normalized::Complete(result)
        } else {
            Normalized::Degraded { result, missing }
        }
    }

    pub fn result(&self) -> &T {
        match self {
            Normalized::Complete(result) => result,
            Normalized::Degraded { result, .. } => result,
        }
    }

    pub fn into_result(self) -> T {
        match self {
            Normalized::Complete(result) => result,
            Normalized::Degraded { result, .. } => result,
        }
    }

    pub fn missing(&self) -> &[MissingField] {
        match self {
            Normalized::Complete(_) => &[],
            Normalized::Degraded { missing, .. } => missing,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Normalized::Degraded { .. })
    }
}

/// Labelled sections of a free-text completion.
///
/// Labels are matched at the start of a line, ASCII case-insensitively, with
/// optional markdown decoration (`## Answer:`, `**Answer:**`). They are searched
/// in the given order and never overlap: each label is looked for after the
/// previous match. A section body runs until the next matched label. Wording
/// variants of a label do not match.
#[derive(Debug)]
pub struct Sections<'a> {
    bodies: Vec<(&'static str, &'a str)>,
}

impl<'a> Sections<'a> {
    pub fn extract(text: &'a str, labels: &[&'static str]) -> Self {
        let mut matches: Vec<(&'static str, usize, usize)> = Vec::new();
        let mut cursor = 0;

        for label in labels {
            // Emphasis after the colon is consumed only when it closes
            // emphasis opened before the label.
            let l = regex::escape(label);
            let pattern = format!(
                r"(?mi)^[ \t>#]*(?:[-*+][ \t]+)?(?:(?:\*\*|__){l}(?:\*\*|__)?[ \t]*:(?:\*\*|__)?|[*_]{l}[*_]?[ \t]*:[*_]?|{l}[ \t]*:)[ \t]*"
            );
            let Ok(re) = Regex::new(&pattern) else {
                continue;
            };
            if let Some(m) = re.find_at(text, cursor) {
                matches.push((label, m.start(), m.end()));
                cursor = m.end();
            }
        }

        let bodies = matches
            .iter()
            .enumerate()
            .map(|(i, (label, _, body_start))| {
                let body_end = matches.get(i + 1).map_or(text.len(), |next| next.1);
                (*label, text[*body_start..body_end].trim())
            })
            .collect();

        Self { bodies }
    }

    /// Trimmed body of a matched label.
    pub fn get(&self, label: &str) -> Option<&'a str> {
        self.bodies
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, body)| *body)
    }

    pub fn text(&self, label: &str) -> Option<String> {
        self.get(label).map(str::to_string)
    }

    pub fn list(&self, label: &str) -> Option<Vec<String>> {
        self.get(label).map(list_items)
    }
}

/// One entry per non-blank line, with bullet or numbering markers removed.
pub fn list_items(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| LIST_MARKER.replace(line, "").trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// First number in `text`. A trailing `%` scales it to a fraction and an
/// `a/b` ratio is divided out.
pub fn parse_number(text: &str) -> Option<f64> {
    let caps = NUMBER.captures(text)?;
    let first = caps.get(1)?;
    let value: f64 = first.as_str().parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    if let Some(ratio) = RATIO.captures(text) {
        let denominator: f64 = ratio.get(2)?.as_str().parse().ok()?;
        if ratio.get(1)?.start() == first.start() && denominator != 0.0 {
            return Some(value / denominator);
        }
    }

    if caps.get(2).is_some() {
        Some(value / 100.0)
    } else {
        Some(value)
    }
}

/// Parse a JSON object out of a completion, tolerating code fences and chatter
/// around the object.
pub fn parse_json_object(raw: &str) -> Option<Map<String, Value>> {
    let text = raw.trim();

    if let Ok(Value::Object(map)) = serde_json::from_str(strip_code_fence(text)) {
        return Some(map);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Reads typed fields out of a JSON object, recording the ones that are absent
/// or ill-typed.
///
/// Keys are looked up as given (camelCase) and then in snake_case.
pub struct JsonFields<'a> {
    object: Option<&'a Map<String, Value>>,
    missing: Vec<MissingField>,
}

impl<'a> JsonFields<'a> {
    pub fn new(object: Option<&'a Map<String, Value>>) -> Self {
        Self {
            object,
            missing: Vec::new(),
        }
    }

    fn lookup(&self, key: &str) -> Option<&'a Value> {
        lookup(self.object?, key)
    }

    pub fn string(&mut self, key: &'static str) -> String {
        self.string_or(key, "")
    }

    pub fn string_or(&mut self, key: &'static str, default: &str) -> String {
        match self.lookup(key).and_then(value_to_string) {
            Some(s) => s,
            None => {
                self.missing.push(MissingField(key));
                default.to_string()
            }
        }
    }

    pub fn string_list(&mut self, key: &'static str) -> Vec<String> {
        match self.lookup(key) {
            Some(Value::Array(items)) => items.iter().filter_map(value_to_string).collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => list_items(s),
            _ => {
                self.missing.push(MissingField(key));
                Vec::new()
            }
        }
    }

    /// Array of objects, mapped with `f`; elements `f` rejects are dropped.
    pub fn list_of<T>(
        &mut self,
        key: &'static str,
        f: impl Fn(&'a Map<String, Value>) -> Option<T>,
    ) -> Vec<T> {
        match self.lookup(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_object)
                .filter_map(f)
                .collect(),
            _ => {
                self.missing.push(MissingField(key));
                Vec::new()
            }
        }
    }

    /// Raw value of a field; the caller reports it with [`Self::mark_missing`]
    /// if it turns out to be unusable.
    pub fn value(&self, key: &'static str) -> Option<&'a Value> {
        self.lookup(key)
    }

    pub fn mark_missing(&mut self, key: &'static str) {
        self.missing.push(MissingField(key));
    }

    pub fn finish<T>(self, result: T) -> Normalized<T> {
        Normalized::from_parts(result, self.missing)
    }
}

fn lookup<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object
        .get(key)
        .or_else(|| object.get(&snake_case(key)))
        .filter(|v| !v.is_null())
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// String field of a nested object.
pub fn str_of(object: &Map<String, Value>, key: &str) -> Option<String> {
    lookup(object, key).and_then(value_to_string)
}

/// Numeric field of a nested object.
pub fn num_of(object: &Map<String, Value>, key: &str) -> Option<f64> {
    lookup(object, key).and_then(value_to_number)
}

/// String-list field of a nested object, empty when absent.
pub fn strings_of(object: &Map<String, Value>, key: &str) -> Vec<String> {
    match lookup(object, key) {
        Some(Value::Array(items)) => items.iter().filter_map(value_to_string).collect(),
        Some(Value::String(s)) => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}
