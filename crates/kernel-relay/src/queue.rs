use std::collections::VecDeque;

use kernel_wire::MessageParts;
use log::warn;

use crate::channel::Channel;

/// Messages accepted from frontends before the kernel connection is ready.
///
/// Bounded; when full, the oldest message is dropped to make room.
#[derive(Debug)]
pub struct MessageQueue {
    messages: VecDeque<(Channel, MessageParts)>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a message. Returns `true` if an older message was dropped.
    pub fn push(&mut self, channel: Channel, parts: MessageParts) -> bool {
        let mut dropped = false;
        if self.messages.len() >= self.capacity {
            if let Some((dropped_channel, _)) = self.messages.pop_front() {
                warn!(
                    "[kernel-client] Message queue full ({}), dropping oldest {} message",
                    self.capacity, dropped_channel
                );
                dropped = true;
            }
        }
        self.messages.push_back((channel, parts));
        dropped
    }

    /// Take every queued message in FIFO order.
    pub fn drain(&mut self) -> Vec<(Channel, MessageParts)> {
        self.messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(n: u8) -> MessageParts {
        vec![Bytes::from(vec![n])]
    }

    #[test]
    fn test_fifo_drain() {
        let mut queue = MessageQueue::new(10);
        queue.push(Channel::Shell, msg(1));
        queue.push(Channel::Control, msg(2));
        let drained = queue.drain();
        assert_eq!(drained, vec![(Channel::Shell, msg(1)), (Channel::Control, msg(2))]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let mut queue = MessageQueue::new(3);
        for n in 0..3 {
            assert!(!queue.push(Channel::Shell, msg(n)));
        }
        assert!(queue.push(Channel::Shell, msg(3)));
        assert_eq!(queue.len(), 3);

        let kept: Vec<u8> = queue.drain().into_iter().map(|(_, p)| p[0][0]).collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }
}
