//! Channel addressing.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identifies a channel: an exact event type plus an optional topic.
///
/// Type matching is exact: `Vec<i32>` and `Vec<String>` address different
/// channels, as do `i32` and `Box<i32>`. A `None` topic and an empty topic
/// are the same "no topic" channel.
///
/// Keys compare by value (type id and topic), never by identity.
#[derive(Clone)]
pub struct ChannelKey {
    type_id: TypeId,
    type_name: &'static str,
    topic: Option<Arc<str>>,
}

impl ChannelKey {
    /// Build the key for events of type `T` on the given topic.
    pub fn of<T: 'static>(topic: Option<&str>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            topic: normalize_topic(topic),
        }
    }

    /// The event type's id.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Human-readable event type name, for diagnostics only.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The normalized topic; `None` for the "no topic" channel.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }
}

impl PartialEq for ChannelKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.topic == other.topic
    }
}

impl Eq for ChannelKey {}

impl Hash for ChannelKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.topic.hash(state);
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelKey")
            .field("type", &self.type_name)
            .field("topic", &self.topic())
            .finish()
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.topic() {
            Some(topic) => write!(f, "{}#{}", self.type_name, topic),
            None => f.write_str(self.type_name),
        }
    }
}

fn normalize_topic(topic: Option<&str>) -> Option<Arc<str>> {
    topic.filter(|t| !t.is_empty()).map(Arc::from)
}
