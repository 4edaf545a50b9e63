//! Sender handle and size-bounded message batches.

use crate::connection::ConnectionInner;
use crate::entity::EntityPath;
use crate::error::ClientError;
use crate::message::{Message, MessageId, Timestamp};
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Acknowledgement for an accepted send.
///
/// `message_ids` includes broker-assigned ids and ids of messages the broker
/// dropped as duplicates.
#[derive(Debug, Clone)]
pub struct SendAck {
    pub message_ids: Vec<MessageId>,
    pub sent_at: Timestamp,
}

/// Messages packed for a single atomic send, bounded by encoded size
#[derive(Debug, Clone)]
pub struct MessageBatch {
    messages: Vec<Message>,
    size_in_bytes: usize,
    max_size_in_bytes: usize,
    max_message_size: usize,
}

impl MessageBatch {
    fn new(max_size_in_bytes: usize, max_message_size: usize) -> Self {
        Self {
            messages: Vec::new(),
            size_in_bytes: 0,
            max_size_in_bytes,
            max_message_size,
        }
    }

    /// Add a message if it fits.
    ///
    /// A message that would overflow the batch is handed back so it can be
    /// placed in a new batch.
    pub fn try_add(&mut self, message: Message) -> Result<(), Message> {
        let size = message.encoded_size();
        if size > self.max_message_size || self.size_in_bytes + size > self.max_size_in_bytes {
            return Err(message);
        }

        self.size_in_bytes += size;
        self.messages.push(message);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn max_size_in_bytes(&self) -> usize {
        self.max_size_in_bytes
    }
}

/// Sends messages to a queue or topic
pub struct Sender {
    connection: Arc<ConnectionInner>,
    entity: EntityPath,
    closed: bool,
}

impl Sender {
    pub(crate) fn new(connection: Arc<ConnectionInner>, entity: EntityPath) -> Self {
        Self {
            connection,
            entity,
            closed: false,
        }
    }

    pub fn entity(&self) -> &EntityPath {
        &self.entity
    }

    /// Send a single message
    pub async fn send(&mut self, message: Message) -> Result<SendAck, ClientError> {
        self.ensure_open()?;

        let size = message.encoded_size();
        let max_size = self.connection.config.max_message_size;
        if size > max_size {
            return Err(ClientError::SizeExceeded { size, max_size });
        }

        self.transmit(vec![message]).await
    }

    /// Empty batch bounded by the connection's maximum batch size
    pub fn create_batch(&self) -> MessageBatch {
        let config = &self.connection.config;
        MessageBatch::new(config.max_batch_size, config.max_message_size)
    }

    /// Empty batch with a smaller size limit
    pub fn create_batch_with_limit(&self, max_size_in_bytes: usize) -> Result<MessageBatch, ClientError> {
        let config = &self.connection.config;
        if max_size_in_bytes == 0 || max_size_in_bytes > config.max_batch_size {
            return Err(ClientError::InvalidOperation {
                message: format!(
                    "batch limit must be between 1 and {} bytes",
                    config.max_batch_size
                ),
            });
        }

        Ok(MessageBatch::new(
            max_size_in_bytes,
            config.max_message_size.min(max_size_in_bytes),
        ))
    }

    /// Send every message of `batch` atomically
    pub async fn send_batch(&mut self, batch: MessageBatch) -> Result<SendAck, ClientError> {
        self.ensure_open()?;

        if batch.is_empty() {
            return Ok(SendAck {
                message_ids: Vec::new(),
                sent_at: Timestamp::now(),
            });
        }

        self.transmit(batch.messages).await
    }

    /// Pack `messages` into one batch and send it.
    ///
    /// Fails with `SizeExceeded` if they do not fit in a single batch.
    pub async fn send_messages(&mut self, messages: Vec<Message>) -> Result<SendAck, ClientError> {
        let mut batch = self.create_batch();
        let total: usize = messages.iter().map(Message::encoded_size).sum();

        for message in messages {
            if batch.try_add(message).is_err() {
                return Err(ClientError::SizeExceeded {
                    size: total,
                    max_size: batch.max_size_in_bytes(),
                });
            }
        }

        self.send_batch(batch).await
    }

    /// Close the sender; later sends fail with `ConnectionClosed`
    pub fn close(&mut self) {
        if !self.closed {
            debug!(entity = %self.entity, "Closed sender");
        }
        self.closed = true;
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::ConnectionClosed);
        }
        self.connection.ensure_open()
    }

    async fn transmit(&mut self, messages: Vec<Message>) -> Result<SendAck, ClientError> {
        let count = messages.len();
        let message_ids = self
            .connection
            .round_trip("send", self.connection.transport.send(&self.entity, messages))
            .await?;

        debug!(entity = %self.entity, count = count, "Sent messages");

        Ok(SendAck {
            message_ids,
            sent_at: Timestamp::now(),
        })
    }
}
