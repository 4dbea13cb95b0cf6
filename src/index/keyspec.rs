//! Turning item metadata into composite index keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::storage::key::{Direction, Key, KeyComponent};
use crate::types::{FolioError, Result};

/// How a metadata value is converted into a key component.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Keep the JSON type: booleans, integers, floats and strings.
    #[default]
    Auto,
    /// RFC 3339 strings or epoch seconds, stored as milliseconds.
    Timestamp,
}

impl ValueKind {
    fn is_auto(&self) -> bool {
        *self == ValueKind::Auto
    }
}

/// One position of an index key: a metadata field and its sort direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Metadata field name.
    pub field: String,
    /// Sort direction of this position.
    #[serde(default)]
    pub order: Direction,
    /// Value conversion.
    #[serde(default, skip_serializing_if = "ValueKind::is_auto")]
    pub kind: ValueKind,
}

impl KeySpec {
    /// Ascending spec over `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: Direction::Asc,
            kind: ValueKind::Auto,
        }
    }

    /// Descending spec over `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            order: Direction::Desc,
            ..Self::asc(field)
        }
    }

    /// Same spec with a different value conversion.
    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = kind;
        self
    }

    fn components(&self, metadata: &Map<String, Value>) -> Result<Vec<KeyComponent>> {
        match metadata.get(&self.field) {
            None | Some(Value::Null) => Ok(vec![KeyComponent::Null]),
            Some(Value::Array(values)) if values.is_empty() => Ok(vec![KeyComponent::Null]),
            Some(Value::Array(values)) => values.iter().map(|v| self.convert(v)).collect(),
            Some(value) => Ok(vec![self.convert(value)?]),
        }
    }

    fn convert(&self, value: &Value) -> Result<KeyComponent> {
        match (self.kind, value) {
            (_, Value::Null) => Ok(KeyComponent::Null),
            (ValueKind::Auto, Value::Bool(b)) => Ok(KeyComponent::Bool(*b)),
            (ValueKind::Auto, Value::Number(n)) => Ok(match n.as_i64() {
                Some(i) => KeyComponent::Int(i),
                None => KeyComponent::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            (ValueKind::Auto, Value::String(s)) => Ok(KeyComponent::Str(s.clone())),
            (ValueKind::Timestamp, Value::String(s)) => {
                let parsed = OffsetDateTime::parse(s, &Rfc3339).map_err(|err| {
                    FolioError::config(format!("field {}: bad timestamp {s:?}: {err}", self.field))
                })?;
                let millis = parsed.unix_timestamp_nanos() / 1_000_000;
                i64::try_from(millis)
                    .map(KeyComponent::Timestamp)
                    .map_err(|_| {
                        FolioError::config(format!("field {}: timestamp out of range", self.field))
                    })
            }
            (ValueKind::Timestamp, Value::Number(n)) => match n.as_i64() {
                Some(secs) => secs
                    .checked_mul(1000)
                    .map(KeyComponent::Timestamp)
                    .ok_or_else(|| {
                        FolioError::config(format!("field {}: timestamp out of range", self.field))
                    }),
                None => {
                    let secs = n.as_f64().unwrap_or(f64::NAN);
                    if !secs.is_finite() {
                        return Err(FolioError::config(format!(
                            "field {}: timestamp out of range",
                            self.field
                        )));
                    }
                    Ok(KeyComponent::Timestamp((secs * 1000.0).round() as i64))
                }
            },
            (_, other) => Err(FolioError::config(format!(
                "field {}: cannot index value {other}",
                self.field
            ))),
        }
    }
}

/// Computes every index key of an item.
///
/// Multi-valued fields fan out into the cross product of their values. Each
/// key ends with the item id so that keys of different items never collide.
/// The result is sorted and free of duplicates.
pub fn derive_keys(specs: &[KeySpec], metadata: &Map<String, Value>, item_id: &str) -> Result<Vec<Key>> {
    let mut keys = vec![Key::default()];
    for spec in specs {
        let components = spec.components(metadata)?;
        let mut next = Vec::with_capacity(keys.len() * components.len());
        for key in &keys {
            for component in &components {
                next.push(key.clone().with(component.clone(), spec.order));
            }
        }
        keys = next;
    }
    let mut keys: Vec<Key> = keys
        .into_iter()
        .map(|key| key.with(KeyComponent::Str(item_id.to_owned()), Direction::Asc))
        .collect();
    keys.sort();
    keys.dedup();
    Ok(keys)
}
