#![forbid(unsafe_code)]

//! Composite ordered keys.
//!
//! A [`Key`] is a sequence of typed [`KeyComponent`]s, each carrying its own
//! sort [`Direction`]. Components of different types order by a fixed type
//! precedence (`null < bool < int < float < string < timestamp`).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Sort direction of one key position.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest values first.
    #[default]
    Asc,
    /// Largest values first.
    Desc,
}

impl Direction {
    fn apply(self, ord: Ordering) -> Ordering {
        match self {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }

    fn is_asc(&self) -> bool {
        *self == Direction::Asc
    }
}

/// One typed value inside a composite key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum KeyComponent {
    /// Absent value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number, ordered with `f64::total_cmp`.
    Float(f64),
    /// UTF-8 string, ordered bytewise.
    #[serde(rename = "string")]
    Str(String),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
}

impl KeyComponent {
    fn type_rank(&self) -> u8 {
        match self {
            KeyComponent::Null => 0,
            KeyComponent::Bool(_) => 1,
            KeyComponent::Int(_) => 2,
            KeyComponent::Float(_) => 3,
            KeyComponent::Str(_) => 4,
            KeyComponent::Timestamp(_) => 5,
        }
    }

    /// Returns the string payload, if this is a string component.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyComponent::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Ord for KeyComponent {
    fn cmp(&self, other: &Self) -> Ordering {
        use KeyComponent::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for KeyComponent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyComponent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyComponent {}

impl fmt::Display for KeyComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyComponent::Null => f.write_str("null"),
            KeyComponent::Bool(b) => write!(f, "{b}"),
            KeyComponent::Int(i) => write!(f, "{i}"),
            KeyComponent::Float(x) => write!(f, "{x}"),
            KeyComponent::Str(s) => write!(f, "{s:?}"),
            KeyComponent::Timestamp(ms) => write!(f, "@{ms}"),
        }
    }
}

/// A component together with the direction it sorts in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyPart {
    /// The component value.
    pub value: KeyComponent,
    /// Sort direction for this position.
    #[serde(default, skip_serializing_if = "Direction::is_asc")]
    pub order: Direction,
}

/// Composite key stored in a [`crate::storage::btree::BTree`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key {
    parts: Vec<KeyPart>,
}

impl Key {
    /// Builds a key from explicit parts.
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self { parts }
    }

    /// Single ascending component key.
    pub fn single(value: KeyComponent) -> Self {
        Self {
            parts: vec![KeyPart {
                value,
                order: Direction::Asc,
            }],
        }
    }

    /// Appends a component.
    pub fn push(&mut self, value: KeyComponent, order: Direction) {
        self.parts.push(KeyPart { value, order });
    }

    /// Returns a copy of `self` extended by one component.
    pub fn with(mut self, value: KeyComponent, order: Direction) -> Self {
        self.push(value, order);
        self
    }

    /// The key's parts in order.
    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// True for the zero-component key.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The last component, which for index keys is the item id.
    pub fn last(&self) -> Option<&KeyComponent> {
        self.parts.last().map(|p| &p.value)
    }
}

impl Ord for Key {
    /// Compares position by position; the left key's direction decides each
    /// position, and a strict prefix sorts first.
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.parts.iter().zip(other.parts.iter()) {
            let ord = a.order.apply(a.value.cmp(&b.value));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.parts.len().cmp(&other.parts.len())
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, part) in self.parts.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", part.value)?;
            if part.order == Direction::Desc {
                f.write_str("↓")?;
            }
        }
        f.write_str(")")
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::single(KeyComponent::Int(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::single(KeyComponent::Str(value.to_owned()))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::single(KeyComponent::Str(value))
    }
}
