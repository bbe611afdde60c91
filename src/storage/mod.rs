//! Persistence contracts.
//!
//! The actual database (SQLCipher on mobile, etc.) is implemented by the
//! application; the core defines the traits it needs and ships in-memory
//! implementations for tests and embedding.
//!
//! Persisting the updated ratchet state is the atomicity boundary of every
//! send/receive: a store failure after a successful crypto step makes the
//! whole operation fail.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::conversation::Conversation;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),
    #[error("Record not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Conversation persistence contract, keyed by contact id.
pub trait ConversationStore {
    fn get(&self, contact_id: Uuid) -> Result<Option<Conversation>>;
    fn put(&mut self, conversation: Conversation) -> Result<()>;
    fn delete(&mut self, contact_id: Uuid) -> Result<()>;
}

/// In-memory [`ConversationStore`].
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: HashMap<Uuid, Conversation>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryConversationStore {
    fn get(&self, contact_id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.conversations.get(&contact_id).cloned())
    }

    fn put(&mut self, conversation: Conversation) -> Result<()> {
        self.conversations.insert(conversation.contact_id, conversation);
        Ok(())
    }

    fn delete(&mut self, contact_id: Uuid) -> Result<()> {
        self.conversations.remove(&contact_id);
        Ok(())
    }
}
