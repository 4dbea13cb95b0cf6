use std::fmt;

use serde::{Deserialize, Serialize};

/// A change notification waiting in a [`super::DurableEventQueue`].
///
/// Serialized with a `type` tag naming the variant, which is how events are
/// stored in the `pendingEvents` list of a state file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PendingEvent {
    /// The content of an item changed (or the item was created).
    ItemChanged {
        /// Identifier of the item.
        item_id: String,
        /// Source-relative path of the changed file.
        path: String,
    },
    /// An item was deleted upstream.
    ItemRemoved {
        /// Identifier of the item.
        item_id: String,
    },
    /// Source-wide metadata changed.
    MetaChanged {
        /// Source-relative path of the metadata file.
        path: String,
    },
}

impl PendingEvent {
    /// Shorthand for an [`PendingEvent::ItemChanged`] event.
    pub fn changed(item_id: impl Into<String>, path: impl Into<String>) -> Self {
        PendingEvent::ItemChanged {
            item_id: item_id.into(),
            path: path.into(),
        }
    }

    /// Shorthand for an [`PendingEvent::ItemRemoved`] event.
    pub fn removed(item_id: impl Into<String>) -> Self {
        PendingEvent::ItemRemoved {
            item_id: item_id.into(),
        }
    }

    /// Item the event refers to, if any.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            PendingEvent::ItemChanged { item_id, .. } | PendingEvent::ItemRemoved { item_id } => {
                Some(item_id)
            }
            PendingEvent::MetaChanged { .. } => None,
        }
    }
}

impl fmt::Display for PendingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingEvent::ItemChanged { item_id, .. } => write!(f, "<ItemChanged {item_id}>"),
            PendingEvent::ItemRemoved { item_id } => write!(f, "<ItemRemoved {item_id}>"),
            PendingEvent::MetaChanged { path } => write!(f, "<MetaChanged {path}>"),
        }
    }
}
