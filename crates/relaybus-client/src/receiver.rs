//! Peek-lock receiver with local lease tracking and settlement.
//!
//! Every received message carries a lease identified by its lock token. The
//! receiver keeps its own `lock_token -> lease` table so settlement of an
//! unknown or locally expired lease fails with `LockLost` without a round
//! trip. Settlement calls are retried on transient transmission failures
//! using the connection's [`RetryPolicy`](crate::retry::RetryPolicy).

use crate::config::{EntityProperties, ReceiverOptions};
use crate::connection::ConnectionInner;
use crate::entity::EntityPath;
use crate::error::ClientError;
use crate::message::{LockToken, ReceivedMessage, SessionId};
use crate::transport::{ReceiveRequest, Settlement, SettlementOutcome};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// Result of abandoning a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonOutcome {
    /// Message is available again with the incremented delivery count
    Redelivered { delivery_count: u32 },
    /// Delivery count exceeded the entity's limit
    DeadLettered { delivery_count: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    sequence_number: u64,
    locked_until: Instant,
}

/// Receives messages from a queue, subscription or dead-letter sub-queue
pub struct Receiver {
    connection: Arc<ConnectionInner>,
    entity: EntityPath,
    session_id: Option<SessionId>,
    session_locked_until: Option<Instant>,
    owner: String,
    properties: EntityProperties,
    options: ReceiverOptions,
    leases: HashMap<LockToken, Lease>,
    prefetched: VecDeque<ReceivedMessage>,
    next_peek_sequence: u64,
    closed: bool,
}

impl Receiver {
    pub(crate) fn new(
        connection: Arc<ConnectionInner>,
        entity: EntityPath,
        session_id: Option<SessionId>,
        owner: String,
        properties: EntityProperties,
        options: ReceiverOptions,
    ) -> Self {
        Self {
            connection,
            entity,
            session_id,
            session_locked_until: None,
            owner,
            properties,
            options,
            leases: HashMap::new(),
            prefetched: VecDeque::new(),
            next_peek_sequence: 0,
            closed: false,
        }
    }

    pub fn entity(&self) -> &EntityPath {
        &self.entity
    }

    /// Name recorded as the owner of this receiver's leases
    pub fn identifier(&self) -> &str {
        &self.owner
    }

    /// Entity properties read when the receiver was created
    pub fn properties(&self) -> &EntityProperties {
        &self.properties
    }

    /// Messages held in the local prefetch buffer
    pub fn prefetched_count(&self) -> usize {
        self.prefetched.len()
    }

    pub(crate) fn session_locked_until(&self) -> Option<Instant> {
        self.session_locked_until
    }

    pub(crate) fn set_session_locked_until(&mut self, locked_until: Instant) {
        self.session_locked_until = Some(locked_until);
    }

    pub(crate) fn connection(&self) -> &Arc<ConnectionInner> {
        &self.connection
    }

    // ------------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------------

    /// Lease up to `max_count` messages, waiting up to `max_wait` for the first.
    ///
    /// Returns an empty vector when the wait elapses without messages.
    pub async fn receive(
        &mut self,
        max_count: u32,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.ensure_open()?;
        if max_count == 0 {
            return Err(ClientError::InvalidOperation {
                message: "max_count must be at least 1".to_string(),
            });
        }

        self.discard_expired_prefetched();
        if !self.prefetched.is_empty() {
            let take = (max_count as usize).min(self.prefetched.len());
            return Ok(self.prefetched.drain(..take).collect());
        }

        let request = ReceiveRequest {
            entity: self.entity.clone(),
            session_id: self.session_id.clone(),
            owner: self.owner.clone(),
            max_count: max_count.max(self.options.prefetch_count),
            max_wait,
        };

        let mut messages = self
            .connection
            .until_closed(self.connection.transport.receive(request))
            .await?;

        for message in &messages {
            self.track(message);
        }

        if messages.len() > max_count as usize {
            self.prefetched.extend(messages.drain(max_count as usize..));
        }

        debug!(
            entity = %self.entity,
            received = messages.len(),
            prefetched = self.prefetched.len(),
            "Received messages"
        );
        Ok(messages)
    }

    /// Receive a single message using the configured `max_wait`
    pub async fn receive_message(&mut self) -> Result<Option<ReceivedMessage>, ClientError> {
        let max_wait = self.options.max_wait;
        Ok(self.receive(1, max_wait).await?.into_iter().next())
    }

    /// Lease deferred messages by sequence number
    pub async fn receive_deferred(
        &mut self,
        sequence_numbers: &[u64],
    ) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.ensure_open()?;

        let messages = self
            .connection
            .round_trip(
                "receive_deferred",
                self.connection.transport.receive_deferred(
                    &self.entity,
                    self.session_id.as_ref(),
                    &self.owner,
                    sequence_numbers,
                ),
            )
            .await?;

        for message in &messages {
            self.track(message);
        }
        Ok(messages)
    }

    /// Browse messages without locking them, continuing after the last peek
    pub async fn peek_messages(&mut self, max_count: u32) -> Result<Vec<ReceivedMessage>, ClientError> {
        let from = self.next_peek_sequence;
        self.peek_messages_from(from, max_count).await
    }

    /// Browse messages starting at `sequence_number`
    pub async fn peek_messages_from(
        &mut self,
        sequence_number: u64,
        max_count: u32,
    ) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.ensure_open()?;

        let messages = self
            .connection
            .round_trip(
                "peek",
                self.connection.transport.peek(
                    &self.entity,
                    self.session_id.as_ref(),
                    sequence_number,
                    max_count,
                ),
            )
            .await?;

        if let Some(last) = messages.last() {
            self.next_peek_sequence = last.sequence_number + 1;
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------------

    /// Remove the message permanently
    pub async fn complete(&mut self, message: &ReceivedMessage) -> Result<(), ClientError> {
        self.settle(message, Settlement::Complete).await?;
        debug!(entity = %self.entity, sequence_number = message.sequence_number, "Completed message");
        Ok(())
    }

    /// Release the lease so the message can be redelivered.
    ///
    /// The delivery count is incremented; the message is dead-lettered
    /// instead if that takes it above the entity's `max_delivery_count`.
    pub async fn abandon(&mut self, message: &ReceivedMessage) -> Result<AbandonOutcome, ClientError> {
        match self.settle(message, Settlement::Abandon).await? {
            SettlementOutcome::Abandoned { delivery_count } => {
                debug!(
                    entity = %self.entity,
                    sequence_number = message.sequence_number,
                    delivery_count = delivery_count,
                    "Abandoned message"
                );
                Ok(AbandonOutcome::Redelivered { delivery_count })
            }
            SettlementOutcome::DeadLettered { delivery_count } => {
                warn!(
                    entity = %self.entity,
                    sequence_number = message.sequence_number,
                    delivery_count = delivery_count,
                    "Abandoned message exceeded max delivery count and was dead-lettered"
                );
                Ok(AbandonOutcome::DeadLettered { delivery_count })
            }
            other => Err(unexpected_outcome("abandon", other)),
        }
    }

    /// Move the message to the dead-letter sub-queue
    pub async fn dead_letter(
        &mut self,
        message: &ReceivedMessage,
        reason: impl Into<String>,
        description: Option<String>,
    ) -> Result<(), ClientError> {
        let reason = reason.into();
        self.settle(
            message,
            Settlement::DeadLetter {
                reason: reason.clone(),
                description,
            },
        )
        .await?;

        info!(
            entity = %self.entity,
            sequence_number = message.sequence_number,
            reason = %reason,
            "Dead-lettered message"
        );
        Ok(())
    }

    /// Set the message aside; it can only be fetched again with
    /// [`receive_deferred`](Self::receive_deferred) and the returned sequence number.
    pub async fn defer(&mut self, message: &ReceivedMessage) -> Result<u64, ClientError> {
        match self.settle(message, Settlement::Defer).await? {
            SettlementOutcome::Deferred { sequence_number } => {
                debug!(entity = %self.entity, sequence_number = sequence_number, "Deferred message");
                Ok(sequence_number)
            }
            other => Err(unexpected_outcome("defer", other)),
        }
    }

    /// Extend the lease on `message` by the entity's lock duration
    pub async fn renew_message_lock(
        &mut self,
        message: &mut ReceivedMessage,
    ) -> Result<Instant, ClientError> {
        let token = self.active_lease(message)?;

        let result = self
            .connection
            .round_trip(
                "renew_message_lock",
                self.connection
                    .transport
                    .renew_message_lock(&self.entity, &self.owner, &token),
            )
            .await;

        let locked_until = match result {
            Ok(locked_until) => locked_until,
            Err(e) => {
                if e.requires_receive() {
                    self.leases.remove(&token);
                }
                return Err(e);
            }
        };

        if let Some(lease) = self.leases.get_mut(&token) {
            lease.locked_until = locked_until;
        }
        message.locked_until = Some(locked_until);

        debug!(entity = %self.entity, sequence_number = message.sequence_number, "Renewed message lock");
        Ok(locked_until)
    }

    /// Abandon prefetched messages and close the receiver.
    ///
    /// Messages already handed to the caller keep their leases until they
    /// expire.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Ok(());
        }

        let prefetched: Vec<ReceivedMessage> = self.prefetched.drain(..).collect();
        if !self.connection.is_closed() {
            for message in &prefetched {
                if let Err(e) = self.settle(message, Settlement::Abandon).await {
                    debug!(
                        entity = %self.entity,
                        sequence_number = message.sequence_number,
                        error = %e,
                        "Could not return prefetched message"
                    );
                }
            }
        }

        self.leases.clear();
        self.closed = true;
        debug!(entity = %self.entity, returned = prefetched.len(), "Closed receiver");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    pub(crate) fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::ConnectionClosed);
        }
        self.connection.ensure_open()?;
        self.check_session_lock()
    }

    pub(crate) fn check_session_lock(&self) -> Result<(), ClientError> {
        match (&self.session_id, self.session_locked_until) {
            (Some(session_id), Some(locked_until)) if Instant::now() >= locked_until => {
                Err(ClientError::SessionLockLost {
                    session_id: session_id.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn track(&mut self, message: &ReceivedMessage) {
        if let (Some(token), Some(locked_until)) = (&message.lock_token, message.locked_until) {
            self.leases.insert(
                token.clone(),
                Lease {
                    sequence_number: message.sequence_number,
                    locked_until,
                },
            );
        }
    }

    /// Drop buffered messages whose lease ran out while they waited
    fn discard_expired_prefetched(&mut self) {
        let now = Instant::now();
        let before = self.prefetched.len();

        let leases = &mut self.leases;
        self.prefetched.retain(|message| {
            let expired = message.locked_until.map_or(true, |until| until <= now);
            if expired {
                if let Some(token) = &message.lock_token {
                    leases.remove(token);
                }
            }
            !expired
        });

        let discarded = before - self.prefetched.len();
        if discarded > 0 {
            debug!(entity = %self.entity, discarded = discarded, "Discarded expired prefetched messages");
        }
    }

    /// Lock token of `message` if its lease is still held locally
    fn active_lease(&mut self, message: &ReceivedMessage) -> Result<LockToken, ClientError> {
        self.ensure_open()?;

        let token = message
            .lock_token
            .clone()
            .ok_or_else(|| ClientError::InvalidOperation {
                message: "peeked messages cannot be settled".to_string(),
            })?;

        let lease = self
            .leases
            .get(&token)
            .copied()
            .ok_or_else(|| ClientError::LockLost {
                lock_token: token.to_string(),
            })?;

        if lease.locked_until <= Instant::now() {
            self.leases.remove(&token);
            warn!(
                entity = %self.entity,
                sequence_number = lease.sequence_number,
                "Message lock expired before settlement"
            );
            return Err(ClientError::LockLost {
                lock_token: token.to_string(),
            });
        }

        Ok(token)
    }

    async fn settle(
        &mut self,
        message: &ReceivedMessage,
        settlement: Settlement,
    ) -> Result<SettlementOutcome, ClientError> {
        let token = self.active_lease(message)?;
        let connection = Arc::clone(&self.connection);
        let entity = &self.entity;
        let owner = self.owner.as_str();
        let operation = settlement.name();

        let result = connection
            .config
            .retry
            .run(operation, || {
                let settlement = settlement.clone();
                let connection = &connection;
                let token = &token;
                async move {
                    connection
                        .round_trip(
                            operation,
                            connection.transport.settle(entity, owner, token, settlement),
                        )
                        .await
                }
            })
            .await;

        match result {
            Ok(outcome) => {
                self.leases.remove(&token);
                Ok(outcome)
            }
            Err(e) => {
                if e.requires_receive() {
                    self.leases.remove(&token);
                    warn!(
                        entity = %self.entity,
                        sequence_number = message.sequence_number,
                        operation = operation,
                        "Lost message lock during settlement"
                    );
                }
                Err(e)
            }
        }
    }
}

fn unexpected_outcome(operation: &str, outcome: SettlementOutcome) -> ClientError {
    ClientError::InvalidOperation {
        message: format!("unexpected {} outcome: {:?}", operation, outcome),
    }
}
