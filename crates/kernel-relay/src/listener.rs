//! Listener registration and message-type filtering.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kernel_wire::MessageParts;

use crate::channel::Channel;

/// Receives messages fanned out by a [`SharedKernelClient`](crate::client::SharedKernelClient).
#[async_trait]
pub trait KernelListener: Send + Sync {
    /// Deliver one kernel message as `[header, parent_header, metadata, content, buffers…]`.
    async fn handle_outgoing_message(
        &self,
        channel: Channel,
        parts: MessageParts,
    ) -> anyhow::Result<()>;
}

/// Opaque handle returned when a listener is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A `(msg_type, channel)` pair, e.g. `("status", Channel::IOPub)`.
pub type MsgTypeChannel = (String, Channel);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot specify both msg_types and exclude_msg_types")]
pub struct ConflictingFilters;

/// Which messages a listener wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MessageFilter {
    #[default]
    All,
    Include(HashSet<MsgTypeChannel>),
    Exclude(HashSet<MsgTypeChannel>),
}

impl MessageFilter {
    /// Build a filter from optional inclusion and exclusion lists.
    pub fn from_lists(
        msg_types: Option<Vec<MsgTypeChannel>>,
        exclude_msg_types: Option<Vec<MsgTypeChannel>>,
    ) -> Result<Self, ConflictingFilters> {
        match (msg_types, exclude_msg_types) {
            (Some(_), Some(_)) => Err(ConflictingFilters),
            (Some(include), None) => Ok(MessageFilter::Include(include.into_iter().collect())),
            (None, Some(exclude)) => Ok(MessageFilter::Exclude(exclude.into_iter().collect())),
            (None, None) => Ok(MessageFilter::All),
        }
    }

    pub fn matches(&self, msg_type: &str, channel: Channel) -> bool {
        let key = || (msg_type.to_string(), channel);
        match self {
            MessageFilter::All => true,
            MessageFilter::Include(set) => set.contains(&key()),
            MessageFilter::Exclude(set) => !set.contains(&key()),
        }
    }
}

struct Registration {
    listener: Arc<dyn KernelListener>,
    filter: MessageFilter,
}

/// Registered listeners keyed by id.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: HashMap<ListenerId, Registration>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, listener: Arc<dyn KernelListener>, filter: MessageFilter) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.insert(id, Registration { listener, filter });
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Snapshot of the listeners whose filter accepts this message.
    pub fn matching(&self, msg_type: &str, channel: Channel) -> Vec<(ListenerId, Arc<dyn KernelListener>)> {
        self.listeners
            .iter()
            .filter(|(_, reg)| reg.filter.matches(msg_type, channel))
            .map(|(id, reg)| (*id, reg.listener.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl KernelListener for Noop {
        async fn handle_outgoing_message(&self, _: Channel, _: MessageParts) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn pair(msg_type: &str, channel: Channel) -> MsgTypeChannel {
        (msg_type.to_string(), channel)
    }

    #[test]
    fn test_conflicting_filters() {
        let result = MessageFilter::from_lists(
            Some(vec![pair("status", Channel::IOPub)]),
            Some(vec![pair("stream", Channel::IOPub)]),
        );
        assert_eq!(result, Err(ConflictingFilters));
        assert_eq!(MessageFilter::from_lists(None, None), Ok(MessageFilter::All));
    }

    #[test]
    fn test_include_filter() {
        let filter =
            MessageFilter::from_lists(Some(vec![pair("status", Channel::IOPub)]), None).unwrap();
        assert!(filter.matches("status", Channel::IOPub));
        assert!(!filter.matches("stream", Channel::IOPub));
        assert!(!filter.matches("status", Channel::Shell));
    }

    #[test]
    fn test_exclude_filter() {
        let filter =
            MessageFilter::from_lists(None, Some(vec![pair("status", Channel::IOPub)])).unwrap();
        assert!(!filter.matches("status", Channel::IOPub));
        assert!(filter.matches("stream", Channel::IOPub));
        assert!(filter.matches("status", Channel::Control));
    }

    #[test]
    fn test_filter_lookup_among_many_pairs() {
        let pairs: Vec<MsgTypeChannel> = (0..500)
            .map(|i| pair(&format!("custom_{}", i), Channel::IOPub))
            .chain([pair("status", Channel::IOPub)])
            .collect();
        let include = MessageFilter::from_lists(Some(pairs.clone()), None).unwrap();
        let exclude = MessageFilter::from_lists(None, Some(pairs)).unwrap();

        assert!(include.matches("custom_499", Channel::IOPub));
        assert!(include.matches("status", Channel::IOPub));
        assert!(!include.matches("custom_499", Channel::Shell));
        assert!(!include.matches("custom_500", Channel::IOPub));

        assert!(!exclude.matches("custom_0", Channel::IOPub));
        assert!(exclude.matches("custom_0", Channel::Control));
    }

    #[test]
    fn test_registry_add_remove() {
        let mut registry = ListenerRegistry::new();
        let a = registry.insert(Arc::new(Noop), MessageFilter::All);
        let b = registry.insert(
            Arc::new(Noop),
            MessageFilter::Include([pair("status", Channel::IOPub)].into_iter().collect()),
        );
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.matching("stream", Channel::IOPub).len(), 1);
        assert_eq!(registry.matching("status", Channel::IOPub).len(), 2);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.matching("stream", Channel::IOPub).len(), 0);

        registry.clear();
        assert!(registry.is_empty());
    }
}
