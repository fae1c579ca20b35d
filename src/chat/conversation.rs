//! Conversation store
//!
//! Ordered, append-only record of chat turns. Insertion order is the order
//! the turns appear in the prompt context.

use crate::types::message::Message;

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message at the tail
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Copy of the history as it is now
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }
}
