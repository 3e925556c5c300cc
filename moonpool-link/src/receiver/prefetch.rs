//! Prefetch buffer of a receiver.

use std::collections::VecDeque;

use crate::message::ReceivedMessage;

/// Received messages waiting for a receive call, in arrival order.
#[derive(Debug, Default)]
pub(crate) struct PrefetchBuffer {
    messages: VecDeque<ReceivedMessage>,
}

impl PrefetchBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, message: ReceivedMessage) {
        self.messages.push_back(message);
    }

    /// Take up to `max` messages from the front.
    pub(crate) fn pop_up_to(&mut self, max: u32) -> Vec<ReceivedMessage> {
        let count = self.messages.len().min(max as usize);
        self.messages.drain(..count).collect()
    }

    /// Put messages a caller did not take back at the front, keeping
    /// their order.
    pub(crate) fn restore(&mut self, messages: Vec<ReceivedMessage>) {
        for message in messages.into_iter().rev() {
            self.messages.push_front(message);
        }
    }

    /// Drop messages whose lock died with the link. Returns how many.
    pub(crate) fn drop_unsettled(&mut self) -> usize {
        let before = self.messages.len();
        self.messages.retain(|message| message.settled);
        before - self.messages.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.messages.len();
        self.messages.clear();
        count
    }

    pub(crate) fn len(&self) -> u32 {
        u32::try_from(self.messages.len()).unwrap_or(u32::MAX)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeliveryTag, Message};

    fn received(id: &str, settled: bool) -> ReceivedMessage {
        ReceivedMessage {
            message: Message::new(Vec::new()).with_message_id(id),
            delivery_tag: Some(DeliveryTag::new(id.as_bytes().to_vec())),
            lock_token: None,
            settled,
        }
    }

    fn ids(messages: &[ReceivedMessage]) -> Vec<&str> {
        messages
            .iter()
            .filter_map(|m| m.message.message_id.as_deref())
            .collect()
    }

    #[test]
    fn test_fifo_and_restore() {
        let mut buffer = PrefetchBuffer::new();
        for id in ["a", "b", "c"] {
            buffer.push(received(id, false));
        }
        let taken = buffer.pop_up_to(2);
        assert_eq!(ids(&taken), vec!["a", "b"]);
        buffer.restore(taken);
        assert_eq!(buffer.len(), 3);
        assert_eq!(ids(&buffer.pop_up_to(10)), vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drop_unsettled_keeps_presettled() {
        let mut buffer = PrefetchBuffer::new();
        buffer.push(received("locked", false));
        buffer.push(received("deleted", true));
        assert_eq!(buffer.drop_unsettled(), 1);
        assert_eq!(ids(&buffer.pop_up_to(10)), vec!["deleted"]);
    }
}
