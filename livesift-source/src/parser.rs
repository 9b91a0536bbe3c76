//! Normalizes raw listing output into [`Entity`] records.
//!
//! Parsing never fails. Lines that cannot be read are dropped, and the
//! remaining ones are deduplicated by id so that the last occurrence wins.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::{Entity, EntityState};

/// How a source's output is laid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LineFormat {
    /// One entity per line, fields split on `separator`. A backslash escapes
    /// the separator or itself, as in terse `nmcli -t` output.
    Delimited {
        #[serde(default = "default_separator")]
        separator: char,
        id: usize,
        name: usize,
        #[serde(default)]
        state: Option<usize>,
        #[serde(default)]
        require: Vec<FieldFilter<usize>>,
        #[serde(default)]
        state_rule: StateRule,
    },
    /// A JSON array of objects, or one object per line. Fields are JSON
    /// pointers; a bare key `foo` means `/foo`. A malformed array element
    /// is dropped like a malformed line.
    Json {
        id: String,
        name: String,
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        require: Vec<FieldFilter<String>>,
        #[serde(default)]
        state_rule: StateRule,
    },
}

fn default_separator() -> char {
    ':'
}

/// Keeps only records whose `field` is one of `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter<F> {
    pub field: F,
    pub values: Vec<String>,
}

/// Maps the raw state field onto an [`EntityState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRule {
    #[serde(default = "default_active")]
    pub active: EntityState,
    #[serde(default = "default_inactive")]
    pub inactive: EntityState,
    #[serde(default)]
    pub active_when: ActiveWhen,
}

impl Default for StateRule {
    fn default() -> Self {
        Self {
            active: default_active(),
            inactive: default_inactive(),
            active_when: ActiveWhen::default(),
        }
    }
}

fn default_active() -> EntityState {
    EntityState::Connected
}

fn default_inactive() -> EntityState {
    EntityState::Disconnected
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActiveWhen {
    /// The field has any non-blank value (e.g. the device a connection is up on).
    #[default]
    NonEmpty,
    OneOf(Vec<String>),
}

impl StateRule {
    pub fn resolve(&self, value: Option<&str>) -> EntityState {
        let Some(value) = value else {
            return EntityState::Unknown;
        };
        let active = match &self.active_when {
            ActiveWhen::NonEmpty => !value.trim().is_empty(),
            ActiveWhen::OneOf(values) => values.iter().any(|v| v == value),
        };
        if active { self.active } else { self.inactive }
    }
}

impl LineFormat {
    pub fn parse<S: AsRef<str>>(&self, lines: &[S]) -> Vec<Entity> {
        parse(self, lines)
    }
}

/// Parses one listing. Never fails; see the module docs.
pub fn parse<S: AsRef<str>>(format: &LineFormat, lines: &[S]) -> Vec<Entity> {
    let mut listing = Listing::default();
    let mut skipped = 0usize;

    match format {
        LineFormat::Delimited {
            separator,
            id,
            name,
            state,
            require,
            state_rule,
        } => {
            for line in lines {
                let line = line.as_ref().trim_end_matches('\r');
                if line.trim().is_empty() {
                    continue;
                }
                let fields = split_escaped(line, *separator);
                let field = |index: usize| fields.get(index).map(String::as_str);

                let Some(entity_id) = field(*id).filter(|v| !v.is_empty()) else {
                    skipped += 1;
                    continue;
                };
                let Some(entity_name) = field(*name) else {
                    skipped += 1;
                    continue;
                };
                if state.is_some_and(|index| index >= fields.len()) {
                    skipped += 1;
                    continue;
                }
                let required = require
                    .iter()
                    .all(|f| field(f.field).is_some_and(|v| f.values.iter().any(|w| w == v)));
                if !required {
                    continue;
                }

                listing.insert(Entity {
                    id: entity_id.to_string(),
                    display_name: name_or_id(entity_name, entity_id),
                    state: state_rule.resolve(state.and_then(field)),
                    raw: line.to_string(),
                });
            }
        }
        LineFormat::Json {
            id,
            name,
            state,
            require,
            state_rule,
        } => {
            for value in json_records(lines, &mut skipped) {
                let Some(entity_id) = scalar(&value, id).filter(|v| !v.is_empty()) else {
                    skipped += 1;
                    continue;
                };
                let Some(entity_name) = scalar(&value, name) else {
                    skipped += 1;
                    continue;
                };
                if !require.iter().all(|f| {
                    scalar(&value, &f.field).is_some_and(|v| f.values.iter().any(|w| *w == v))
                }) {
                    continue;
                }
                let state_value = state.as_deref().and_then(|s| scalar(&value, s));

                listing.insert(Entity {
                    display_name: name_or_id(&entity_name, &entity_id),
                    state: state_rule.resolve(state_value.as_deref()),
                    raw: value.to_string(),
                    id: entity_id,
                });
            }
        }
    }

    if skipped > 0 {
        trace!(skipped, kept = listing.entities.len(), "dropped malformed records");
    }
    listing.entities
}

/// Insertion-ordered, id-unique entity list. A repeated id replaces the
/// earlier record in place.
#[derive(Default)]
struct Listing {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
}

impl Listing {
    fn insert(&mut self, entity: Entity) {
        match self.index.get(&entity.id) {
            Some(&slot) => self.entities[slot] = entity,
            None => {
                self.index.insert(entity.id.clone(), self.entities.len());
                self.entities.push(entity);
            }
        }
    }
}

fn name_or_id(name: &str, id: &str) -> String {
    if name.trim().is_empty() {
        id.to_string()
    } else {
        name.to_string()
    }
}

fn split_escaped(line: &str, separator: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) if next == separator || next == '\\' => current.push(next),
                Some(next) => {
                    current.push('\\');
                    current.push(next);
                }
                None => current.push('\\'),
            }
        } else if c == separator {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}

fn json_records<S: AsRef<str>>(lines: &[S], skipped: &mut usize) -> Vec<Value> {
    let joined = lines.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('[') {
        if let Ok(values) = serde_json::from_str::<Vec<Value>>(trimmed) {
            return values.into_iter().filter(Value::is_object).collect();
        }
        // Keep whatever elements still parse on their own.
        let mut records = Vec::new();
        for element in array_elements(trimmed) {
            match serde_json::from_str::<Value>(element) {
                Ok(value) if value.is_object() => records.push(value),
                _ => *skipped += 1,
            }
        }
        return records;
    }

    // JSON Lines
    let mut records = Vec::new();
    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => records.push(value),
            _ => *skipped += 1,
        }
    }
    records
}

/// Splits a top-level JSON array into the text of its elements. Only
/// nesting and string literals are tracked; each element is validated by
/// the caller.
fn array_elements(array: &str) -> Vec<&str> {
    let body = array.strip_prefix('[').unwrap_or(array);
    let body = body.strip_suffix(']').unwrap_or(body);

    let mut elements = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
    for (index, c) in body.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                elements.push(&body[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    elements.push(&body[start..]);
    elements
        .into_iter()
        .map(str::trim)
        .filter(|element| !element.is_empty())
        .collect()
}

fn scalar(value: &Value, selector: &str) -> Option<String> {
    let field = if selector.starts_with('/') {
        value.pointer(selector)
    } else {
        value.get(selector)
    }?;
    match field {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
