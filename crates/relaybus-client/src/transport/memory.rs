//! In-memory broker transport for testing and development.
//!
//! [`InMemoryTransport`] behaves like a peek-lock broker:
//! - per-entity sequence numbers and FIFO order
//! - message leases that expire and count as failed deliveries
//! - dead-letter sub-queues driven by [`DeadLetterPolicy`]
//! - duplicate detection over a time window
//! - topics fanning out to filtered subscriptions
//! - exclusive session locks with session state
//!
//! Provisioning methods (`create_queue`, `create_topic`, ...) stand in for
//! broker administration.

use super::{ReceiveRequest, SessionLease, Settlement, SettlementOutcome, Transport};
use crate::config::{Credential, EntityProperties};
use crate::dead_letter::{DeadLetterPolicy, DeadLetterReason, DeliveryDisposition};
use crate::entity::{EntityKind, EntityName, EntityPath, SubQueue};
use crate::error::ClientError;
use crate::filter::SubscriptionFilter;
use crate::message::{
    LockToken, Message, MessageId, MessageState, ReceivedMessage, SessionId, Timestamp,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Lease held by a receiver on a stored message
struct Lease {
    token: LockToken,
    owner: String,
    locked_until: Instant,
}

/// A message stored in an entity with broker metadata
struct StoredMessage {
    message_id: MessageId,
    message: Message,
    sequence_number: u64,
    enqueued_at: Timestamp,
    expires_at: Option<Instant>,
    delivery_count: u32,
    state: MessageState,
    /// Deferred messages return to the deferred set when a lease ends
    deferred: bool,
    lease: Option<Lease>,
    dead_letter_reason: Option<String>,
    dead_letter_description: Option<String>,
}

impl StoredMessage {
    fn to_received(&self) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            session_id: self.message.session_id.clone(),
            body: self.message.body.clone(),
            properties: self.message.properties.clone(),
            correlation_id: self.message.correlation_id.clone(),
            content_type: self.message.content_type.clone(),
            subject: self.message.subject.clone(),
            sequence_number: self.sequence_number,
            enqueued_at: self.enqueued_at,
            delivery_count: self.delivery_count,
            state: self.state,
            lock_token: self.lease.as_ref().map(|lease| lease.token.clone()),
            locked_until: self.lease.as_ref().map(|lease| lease.locked_until),
            dead_letter_reason: self.dead_letter_reason.clone(),
            dead_letter_description: self.dead_letter_description.clone(),
        }
    }

    fn in_session(&self, session_id: Option<&SessionId>) -> bool {
        match session_id {
            Some(id) => self.message.session_id.as_ref() == Some(id),
            None => true,
        }
    }
}

/// Messages of one sub-queue keyed by sequence number, plus the lease index
#[derive(Default)]
struct SubQueueStore {
    messages: BTreeMap<u64, StoredMessage>,
    leases: HashMap<LockToken, u64>,
}

impl SubQueueStore {
    /// Lock a message for `owner`. Returns `None` if it is gone or already leased.
    fn lease(
        &mut self,
        sequence_number: u64,
        owner: &str,
        locked_until: Instant,
    ) -> Option<ReceivedMessage> {
        let message = self.messages.get_mut(&sequence_number)?;
        if message.lease.is_some() {
            return None;
        }

        let token = LockToken::new();
        message.state = MessageState::Locked;
        message.lease = Some(Lease {
            token: token.clone(),
            owner: owner.to_string(),
            locked_until,
        });
        self.leases.insert(token, sequence_number);

        Some(message.to_received())
    }

    /// Drop the lease on a message, leaving its state for the caller to set
    fn release_lease(&mut self, sequence_number: u64) -> Option<&mut StoredMessage> {
        let message = self.messages.get_mut(&sequence_number)?;
        let lease = message.lease.take()?;
        self.leases.remove(&lease.token);
        Some(message)
    }

    /// Sequence number behind `token` if the lease belongs to `owner`
    fn leased_by(&self, token: &LockToken, owner: &str) -> Option<u64> {
        let sequence_number = *self.leases.get(token)?;
        let held = self
            .messages
            .get(&sequence_number)
            .and_then(|m| m.lease.as_ref())
            .is_some_and(|lease| lease.owner == owner);
        held.then_some(sequence_number)
    }

    fn expired_leases(&self, now: Instant) -> Vec<u64> {
        self.messages
            .values()
            .filter(|m| m.lease.as_ref().is_some_and(|l| l.locked_until <= now))
            .map(|m| m.sequence_number)
            .collect()
    }

    fn available(&self, session_id: Option<&SessionId>, max_count: usize) -> Vec<u64> {
        self.messages
            .values()
            .filter(|m| m.state == MessageState::Active && m.in_session(session_id))
            .take(max_count)
            .map(|m| m.sequence_number)
            .collect()
    }

    fn next_lease_expiry(&self) -> Option<Instant> {
        self.messages
            .values()
            .filter_map(|m| m.lease.as_ref().map(|l| l.locked_until))
            .min()
    }
}

/// Sliding record of recently seen message ids
struct DuplicateDetector {
    window: Option<Duration>,
    seen: HashMap<MessageId, Instant>,
}

impl DuplicateDetector {
    fn new(window: Option<Duration>) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Record `message_id`; true if it was already seen inside the window
    fn is_duplicate(&mut self, message_id: &MessageId, now: Instant) -> bool {
        let Some(window) = self.window else {
            return false;
        };

        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);

        if self.seen.contains_key(message_id) {
            return true;
        }

        self.seen.insert(message_id.clone(), now);
        false
    }
}

struct SessionLock {
    owner: String,
    locked_until: Instant,
}

#[derive(Default)]
struct SessionEntry {
    state: Option<Bytes>,
    lock: Option<SessionLock>,
}

/// A queue or subscription
struct EntityStore {
    properties: EntityProperties,
    next_sequence_number: u64,
    main: SubQueueStore,
    dead_letter: SubQueueStore,
    duplicates: DuplicateDetector,
    sessions: HashMap<SessionId, SessionEntry>,
}

impl EntityStore {
    fn new(properties: EntityProperties) -> Self {
        Self {
            duplicates: DuplicateDetector::new(properties.duplicate_detection_window),
            properties,
            next_sequence_number: 1,
            main: SubQueueStore::default(),
            dead_letter: SubQueueStore::default(),
            sessions: HashMap::new(),
        }
    }

    fn policy(&self) -> DeadLetterPolicy {
        DeadLetterPolicy::new(self.properties.max_delivery_count)
    }

    fn sub_queue(&self, sub_queue: SubQueue) -> &SubQueueStore {
        match sub_queue {
            SubQueue::Main => &self.main,
            SubQueue::DeadLetter => &self.dead_letter,
        }
    }

    fn sub_queue_mut(&mut self, sub_queue: SubQueue) -> &mut SubQueueStore {
        match sub_queue {
            SubQueue::Main => &mut self.main,
            SubQueue::DeadLetter => &mut self.dead_letter,
        }
    }

    /// A session id must be present iff the entity requires sessions
    fn check_session_id(&self, entity: &EntityPath, message: &Message) -> Result<(), ClientError> {
        match (self.properties.requires_session, &message.session_id) {
            (true, None) => Err(ClientError::InvalidOperation {
                message: format!("entity '{}' requires a session_id on every message", entity),
            }),
            (false, Some(_)) => Err(ClientError::InvalidOperation {
                message: format!("entity '{}' is not session-enabled", entity),
            }),
            _ => Ok(()),
        }
    }

    /// Session receivers for session entities, plain receivers otherwise.
    /// Dead-letter sub-queues are never session-enabled.
    fn check_receive_mode(
        &self,
        entity: &EntityPath,
        session_id: Option<&SessionId>,
    ) -> Result<(), ClientError> {
        let requires_session = self.properties.requires_session && !entity.is_dead_letter();
        match (requires_session, session_id) {
            (true, None) => Err(ClientError::InvalidOperation {
                message: format!("entity '{}' requires a session receiver", entity),
            }),
            (false, Some(_)) => Err(ClientError::InvalidOperation {
                message: format!("entity '{}' is not session-enabled", entity),
            }),
            _ => Ok(()),
        }
    }

    fn require_sessions(&self, entity: &EntityPath) -> Result<(), ClientError> {
        if self.properties.requires_session && !entity.is_dead_letter() {
            return Ok(());
        }
        Err(ClientError::InvalidOperation {
            message: format!("entity '{}' is not session-enabled", entity),
        })
    }

    fn require_session_lock(&self, session_id: &SessionId, owner: &str) -> Result<(), ClientError> {
        match self.sessions.get(session_id).and_then(|e| e.lock.as_ref()) {
            Some(lock) if lock.owner == owner => Ok(()),
            _ => Err(ClientError::SessionLockLost {
                session_id: session_id.to_string(),
            }),
        }
    }

    fn enqueue(&mut self, message_id: MessageId, message: Message, now: Instant) -> u64 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;

        let ttl = message.time_to_live.or(self.properties.default_message_ttl);
        let stored = StoredMessage {
            message_id,
            message,
            sequence_number,
            enqueued_at: Timestamp::now(),
            expires_at: ttl.map(|ttl| now + ttl),
            delivery_count: 0,
            state: MessageState::Active,
            deferred: false,
            lease: None,
            dead_letter_reason: None,
            dead_letter_description: None,
        };
        self.main.messages.insert(sequence_number, stored);

        sequence_number
    }

    /// End a lease on the main sub-queue without completion
    fn fail_delivery(&mut self, sequence_number: u64) -> Option<DeliveryDisposition> {
        let policy = self.policy();
        let message = self.main.release_lease(sequence_number)?;
        let disposition = policy.on_delivery_failure(message.delivery_count);
        message.delivery_count = disposition.delivery_count();

        match disposition {
            DeliveryDisposition::Redeliver { .. } => {
                message.state = if message.deferred {
                    MessageState::Deferred
                } else {
                    MessageState::Active
                };
            }
            DeliveryDisposition::DeadLetter { delivery_count } => {
                warn!(
                    sequence_number = sequence_number,
                    delivery_count = delivery_count,
                    max_delivery_count = policy.max_delivery_count(),
                    "Delivery count exceeded, moving message to dead-letter sub-queue"
                );
                self.move_to_dead_letter(
                    sequence_number,
                    DeadLetterReason::MaxDeliveryCountExceeded.to_string(),
                    Some(format!(
                        "delivery count {} exceeded the limit of {}",
                        delivery_count,
                        policy.max_delivery_count()
                    )),
                );
            }
        }

        Some(disposition)
    }

    /// End a lease on the dead-letter sub-queue without completion
    fn fail_dead_letter_delivery(&mut self, sequence_number: u64) -> Option<u32> {
        let message = self.dead_letter.release_lease(sequence_number)?;
        message.delivery_count = message.delivery_count.saturating_add(1);
        message.state = if message.deferred {
            MessageState::Deferred
        } else {
            MessageState::Active
        };
        Some(message.delivery_count)
    }

    fn move_to_dead_letter(
        &mut self,
        sequence_number: u64,
        reason: String,
        description: Option<String>,
    ) {
        let Some(mut message) = self.main.messages.remove(&sequence_number) else {
            return;
        };

        if let Some(lease) = message.lease.take() {
            self.main.leases.remove(&lease.token);
        }
        message.state = MessageState::Active;
        message.deferred = false;
        message.expires_at = None;
        message.dead_letter_reason = Some(reason);
        message.dead_letter_description = description;

        self.dead_letter.messages.insert(sequence_number, message);
    }

    /// Release a session lock, failing the deliveries it still holds
    fn release_session_lock(&mut self, session_id: &SessionId) -> bool {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if entry.lock.take().is_none() {
            return false;
        }

        let leased: Vec<u64> = self
            .main
            .messages
            .values()
            .filter(|m| m.lease.is_some() && m.in_session(Some(session_id)))
            .map(|m| m.sequence_number)
            .collect();

        for sequence_number in leased {
            self.fail_delivery(sequence_number);
        }

        true
    }

    fn lock_session(
        &mut self,
        session_id: SessionId,
        owner: &str,
        now: Instant,
    ) -> Result<SessionLease, ClientError> {
        let locked_until = now + self.properties.lock_duration;
        let entry = self.sessions.entry(session_id.clone()).or_default();

        if entry.lock.is_some() {
            return Err(ClientError::SessionLocked {
                session_id: session_id.to_string(),
            });
        }

        entry.lock = Some(SessionLock {
            owner: owner.to_string(),
            locked_until,
        });

        Ok(SessionLease {
            session_id,
            locked_until,
        })
    }

    /// Unlocked session whose oldest active message has the lowest sequence
    /// number, not counting sessions in `skip`
    fn next_available_session(&self, skip: &[SessionId]) -> Option<SessionId> {
        self.main
            .messages
            .values()
            .filter(|m| m.state == MessageState::Active)
            .find_map(|m| {
                let session_id = m.message.session_id.as_ref()?;
                let locked = self
                    .sessions
                    .get(session_id)
                    .is_some_and(|entry| entry.lock.is_some());
                (!locked && !skip.contains(session_id)).then(|| session_id.clone())
            })
    }

    /// Apply lease, session lock and time-to-live expiry. Returns true if
    /// anything changed.
    fn sweep(&mut self, now: Instant) -> bool {
        let mut changed = false;

        let expired_sessions: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.lock.as_ref().is_some_and(|l| l.locked_until <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in expired_sessions {
            debug!(session_id = %session_id, "Session lock expired");
            changed |= self.release_session_lock(&session_id);
        }

        for sequence_number in self.main.expired_leases(now) {
            debug!(sequence_number = sequence_number, "Message lease expired");
            changed |= self.fail_delivery(sequence_number).is_some();
        }

        for sequence_number in self.dead_letter.expired_leases(now) {
            changed |= self.fail_dead_letter_delivery(sequence_number).is_some();
        }

        let expired: Vec<u64> = self
            .main
            .messages
            .values()
            .filter(|m| m.state == MessageState::Active)
            .filter(|m| m.expires_at.is_some_and(|at| at <= now))
            .map(|m| m.sequence_number)
            .collect();
        for sequence_number in expired {
            if self.properties.dead_lettering_on_message_expiration {
                self.move_to_dead_letter(
                    sequence_number,
                    DeadLetterReason::TtlExpired.to_string(),
                    None,
                );
            } else {
                self.main.messages.remove(&sequence_number);
            }
            changed = true;
        }

        changed
    }

    /// Earliest future instant at which `sweep` would change something
    fn next_wake(&self) -> Option<Instant> {
        let sessions = self
            .sessions
            .values()
            .filter_map(|e| e.lock.as_ref().map(|l| l.locked_until));

        let ttl = self
            .main
            .messages
            .values()
            .filter(|m| m.state == MessageState::Active)
            .filter_map(|m| m.expires_at);

        sessions
            .chain(ttl)
            .chain(self.main.next_lease_expiry())
            .chain(self.dead_letter.next_lease_expiry())
            .min()
    }

    fn settle(
        &mut self,
        sub_queue: SubQueue,
        owner: &str,
        lock_token: &LockToken,
        settlement: Settlement,
    ) -> Result<SettlementOutcome, ClientError> {
        let lost = || ClientError::LockLost {
            lock_token: lock_token.to_string(),
        };

        let sequence_number = self
            .sub_queue(sub_queue)
            .leased_by(lock_token, owner)
            .ok_or_else(lost)?;

        match (sub_queue, settlement) {
            (_, Settlement::Complete) => {
                let queue = self.sub_queue_mut(sub_queue);
                queue.release_lease(sequence_number);
                queue.messages.remove(&sequence_number);
                Ok(SettlementOutcome::Completed)
            }
            (SubQueue::Main, Settlement::Abandon) => {
                let disposition = self.fail_delivery(sequence_number).ok_or_else(lost)?;
                Ok(match disposition {
                    DeliveryDisposition::Redeliver { delivery_count } => {
                        SettlementOutcome::Abandoned { delivery_count }
                    }
                    DeliveryDisposition::DeadLetter { delivery_count } => {
                        SettlementOutcome::DeadLettered { delivery_count }
                    }
                })
            }
            (SubQueue::DeadLetter, Settlement::Abandon) => {
                let delivery_count = self
                    .fail_dead_letter_delivery(sequence_number)
                    .ok_or_else(lost)?;
                Ok(SettlementOutcome::Abandoned { delivery_count })
            }
            (
                SubQueue::Main,
                Settlement::DeadLetter {
                    reason,
                    description,
                },
            ) => {
                let delivery_count = self
                    .main
                    .messages
                    .get(&sequence_number)
                    .map(|m| m.delivery_count)
                    .ok_or_else(lost)?;
                self.move_to_dead_letter(sequence_number, reason, description);
                Ok(SettlementOutcome::DeadLettered { delivery_count })
            }
            (SubQueue::DeadLetter, Settlement::DeadLetter { .. }) => {
                Err(ClientError::InvalidOperation {
                    message: "message is already in the dead-letter sub-queue".to_string(),
                })
            }
            (_, Settlement::Defer) => {
                let message = self
                    .sub_queue_mut(sub_queue)
                    .release_lease(sequence_number)
                    .ok_or_else(lost)?;
                message.state = MessageState::Deferred;
                message.deferred = true;
                Ok(SettlementOutcome::Deferred { sequence_number })
            }
        }
    }
}

struct Subscription {
    filter: SubscriptionFilter,
    store: EntityStore,
}

struct TopicStore {
    properties: EntityProperties,
    duplicates: DuplicateDetector,
    subscriptions: BTreeMap<EntityName, Subscription>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<EntityName, EntityStore>,
    topics: HashMap<EntityName, TopicStore>,
}

fn not_found(entity: &EntityPath) -> ClientError {
    ClientError::EntityNotFound {
        entity: entity.to_string(),
    }
}

impl BrokerState {
    /// Store backing a receivable path
    fn store_mut(&mut self, entity: &EntityPath) -> Result<&mut EntityStore, ClientError> {
        match entity.kind() {
            EntityKind::Queue(name) => self.queues.get_mut(name).ok_or_else(|| not_found(entity)),
            EntityKind::Subscription {
                topic,
                subscription,
            } => self
                .topics
                .get_mut(topic)
                .and_then(|t| t.subscriptions.get_mut(subscription))
                .map(|s| &mut s.store)
                .ok_or_else(|| not_found(entity)),
            EntityKind::Topic(_) => Err(ClientError::InvalidOperation {
                message: format!("cannot receive from topic '{}'", entity),
            }),
        }
    }

    fn properties(&self, entity: &EntityPath) -> Option<EntityProperties> {
        match entity.kind() {
            EntityKind::Queue(name) => self.queues.get(name).map(|q| q.properties.clone()),
            EntityKind::Topic(name) => self.topics.get(name).map(|t| t.properties.clone()),
            EntityKind::Subscription {
                topic,
                subscription,
            } => self
                .topics
                .get(topic)
                .and_then(|t| t.subscriptions.get(subscription))
                .map(|s| s.store.properties.clone()),
        }
    }

    /// Enqueue atomically: every message is validated before any is stored
    fn send(
        &mut self,
        entity: &EntityPath,
        messages: Vec<Message>,
        now: Instant,
    ) -> Result<Vec<MessageId>, ClientError> {
        let ids: Vec<MessageId> = messages
            .iter()
            .map(|m| m.message_id.clone().unwrap_or_default())
            .collect();

        match entity.kind() {
            EntityKind::Queue(name) => {
                let store = self.queues.get_mut(name).ok_or_else(|| not_found(entity))?;
                for message in &messages {
                    store.check_session_id(entity, message)?;
                }

                for (id, message) in ids.iter().cloned().zip(messages) {
                    if store.duplicates.is_duplicate(&id, now) {
                        debug!(entity = %entity, message_id = %id, "Dropping duplicate message");
                        continue;
                    }
                    store.enqueue(id, message, now);
                }
            }
            EntityKind::Topic(name) => {
                let topic = self.topics.get_mut(name).ok_or_else(|| not_found(entity))?;
                for message in &messages {
                    for subscription in topic.subscriptions.values() {
                        if subscription.filter.matches(message) {
                            subscription.store.check_session_id(entity, message)?;
                        }
                    }
                }

                for (id, message) in ids.iter().cloned().zip(messages) {
                    if topic.duplicates.is_duplicate(&id, now) {
                        debug!(entity = %entity, message_id = %id, "Dropping duplicate message");
                        continue;
                    }
                    for subscription in topic.subscriptions.values_mut() {
                        if subscription.filter.matches(&message) {
                            subscription.store.enqueue(id.clone(), message.clone(), now);
                        }
                    }
                }
            }
            EntityKind::Subscription { .. } => {
                return Err(ClientError::InvalidOperation {
                    message: format!("cannot send to subscription '{}'", entity),
                })
            }
        }

        Ok(ids)
    }
}

// ============================================================================
// InMemoryTransport
// ============================================================================

/// Call counters recorded by [`InMemoryTransport`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub send_calls: u64,
    pub receive_calls: u64,
    pub settle_calls: u64,
}

/// In-memory broker implementing [`Transport`]
///
/// # Example
///
/// ```rust
/// use relaybus_client::{Connection, ConnectionConfig, EntityProperties, InMemoryTransport, Message};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let transport = Arc::new(InMemoryTransport::new());
/// let queue = transport.create_queue("orders", EntityProperties::default())?;
///
/// let connection = Connection::open(transport.clone(), ConnectionConfig::default()).await?;
/// let mut sender = connection.create_sender(queue.clone())?;
/// sender.send(Message::new("hello")).await?;
///
/// let mut receiver = connection.create_receiver(queue, Default::default()).await?;
/// let messages = receiver.receive(1, Duration::from_secs(1)).await?;
/// receiver.complete(&messages[0]).await?;
/// # Ok::<(), relaybus_client::ClientError>(())
/// # }).unwrap();
/// ```
pub struct InMemoryTransport {
    state: Mutex<BrokerState>,
    notify: Notify,
    credential: Option<Credential>,
    failures_remaining: AtomicU32,
    send_calls: AtomicU64,
    receive_calls: AtomicU64,
    settle_calls: AtomicU64,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Create a broker with no entities that accepts any credential
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            credential: None,
            failures_remaining: AtomicU32::new(0),
            send_calls: AtomicU64::new(0),
            receive_calls: AtomicU64::new(0),
            settle_calls: AtomicU64::new(0),
        }
    }

    /// Only accept connections presenting `credential`
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    // ------------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------------

    pub fn create_queue(
        &self,
        name: &str,
        properties: EntityProperties,
    ) -> Result<EntityPath, ClientError> {
        let name: EntityName = name.parse()?;
        properties.validate()?;

        let mut state = self.state.lock();
        if state.queues.contains_key(&name) || state.topics.contains_key(&name) {
            return Err(ClientError::InvalidOperation {
                message: format!("entity '{}' already exists", name),
            });
        }

        info!(queue = %name, max_delivery_count = properties.max_delivery_count, "Created queue");
        state.queues.insert(name.clone(), EntityStore::new(properties));

        Ok(EntityPath::queue(name))
    }

    /// Replace a queue's properties, keeping its messages
    pub fn update_queue(&self, name: &str, properties: EntityProperties) -> Result<(), ClientError> {
        let name: EntityName = name.parse()?;
        properties.validate()?;

        let mut state = self.state.lock();
        let store = state
            .queues
            .get_mut(&name)
            .ok_or_else(|| not_found(&EntityPath::queue(name.clone())))?;

        store.duplicates.window = properties.duplicate_detection_window;
        store.properties = properties;
        Ok(())
    }

    pub fn delete_queue(&self, name: &str) -> Result<(), ClientError> {
        let name: EntityName = name.parse()?;
        let removed = self.state.lock().queues.remove(&name);

        match removed {
            Some(_) => {
                self.notify.notify_waiters();
                Ok(())
            }
            None => Err(not_found(&EntityPath::queue(name))),
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        name.parse::<EntityName>()
            .map(|name| self.state.lock().queues.contains_key(&name))
            .unwrap_or(false)
    }

    /// Create a topic; only `duplicate_detection_window` applies to topics
    pub fn create_topic(
        &self,
        name: &str,
        properties: EntityProperties,
    ) -> Result<EntityPath, ClientError> {
        let name: EntityName = name.parse()?;
        properties.validate()?;

        let mut state = self.state.lock();
        if state.queues.contains_key(&name) || state.topics.contains_key(&name) {
            return Err(ClientError::InvalidOperation {
                message: format!("entity '{}' already exists", name),
            });
        }

        info!(topic = %name, "Created topic");
        state.topics.insert(
            name.clone(),
            TopicStore {
                duplicates: DuplicateDetector::new(properties.duplicate_detection_window),
                properties,
                subscriptions: BTreeMap::new(),
            },
        );

        Ok(EntityPath::topic(name))
    }

    pub fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        properties: EntityProperties,
        filter: SubscriptionFilter,
    ) -> Result<EntityPath, ClientError> {
        let topic: EntityName = topic.parse()?;
        let name: EntityName = name.parse()?;
        properties.validate()?;

        let mut state = self.state.lock();
        let topic_store = state
            .topics
            .get_mut(&topic)
            .ok_or_else(|| not_found(&EntityPath::topic(topic.clone())))?;

        if topic_store.subscriptions.contains_key(&name) {
            return Err(ClientError::InvalidOperation {
                message: format!("subscription '{}' already exists on '{}'", name, topic),
            });
        }

        info!(topic = %topic, subscription = %name, filter = ?filter, "Created subscription");
        topic_store.subscriptions.insert(
            name.clone(),
            Subscription {
                filter,
                store: EntityStore::new(properties),
            },
        );

        Ok(EntityPath::subscription(topic, name))
    }

    /// Messages held by a receivable path in any state other than completed
    pub fn message_count(&self, entity: &EntityPath) -> Result<usize, ClientError> {
        self.with_store(entity, |store, _| {
            Ok(store.sub_queue(entity.sub_queue()).messages.len())
        })
    }

    // ------------------------------------------------------------------------
    // Test aids
    // ------------------------------------------------------------------------

    /// Make the next `count` send, settle or lock renewal calls fail with `Transient`
    pub fn fail_next_operations(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            send_calls: self.send_calls.load(Ordering::SeqCst),
            receive_calls: self.receive_calls.load(Ordering::SeqCst),
            settle_calls: self.settle_calls.load(Ordering::SeqCst),
        }
    }

    fn inject_failure(&self, operation: &str) -> Result<(), ClientError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if injected {
            return Err(ClientError::Transient {
                message: format!("injected failure in {}", operation),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------------

    /// Run `f` on the swept store behind `entity`; the lock is released on return
    fn with_store<T>(
        &self,
        entity: &EntityPath,
        f: impl FnOnce(&mut EntityStore, Instant) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let (result, swept) = {
            let mut state = self.state.lock();
            let store = state.store_mut(entity)?;
            let now = Instant::now();
            let swept = store.sweep(now);
            (f(store, now), swept)
        };

        if swept {
            self.notify.notify_waiters();
        }
        result
    }

    /// Retry `attempt` until it yields a value or `max_wait` elapses.
    ///
    /// Sleeps until the next broker-side expiry or a notification, whichever
    /// comes first.
    async fn wait_until_ready<T, F>(
        &self,
        entity: &EntityPath,
        max_wait: Duration,
        mut attempt: F,
    ) -> Result<Option<T>, ClientError>
    where
        T: Send,
        F: FnMut(&mut EntityStore, Instant) -> Result<Option<T>, ClientError> + Send,
    {
        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (ready, wake_at) = self.with_store(entity, |store, now| {
                let ready = attempt(store, now)?;
                let wake_at = store
                    .next_wake()
                    .map_or(deadline, |wake| wake.min(deadline));
                Ok((ready, wake_at))
            })?;

            if ready.is_some() {
                return Ok(ready);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open(&self, credential: &Credential) -> Result<(), ClientError> {
        match &self.credential {
            Some(expected) if expected != credential => Err(ClientError::Unauthorized {
                message: "credential rejected by broker".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn entity_properties(&self, entity: &EntityPath) -> Result<EntityProperties, ClientError> {
        self.state
            .lock()
            .properties(entity)
            .ok_or_else(|| not_found(entity))
    }

    async fn send(
        &self,
        entity: &EntityPath,
        messages: Vec<Message>,
    ) -> Result<Vec<MessageId>, ClientError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.inject_failure("send")?;

        let ids = self.state.lock().send(entity, messages, Instant::now())?;
        self.notify.notify_waiters();

        debug!(entity = %entity, count = ids.len(), "Accepted messages");
        Ok(ids)
    }

    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);

        let sub_queue = request.entity.sub_queue();
        let max_count = request.max_count.max(1) as usize;
        let session_id = request.session_id.as_ref();

        let leased = self
            .wait_until_ready(&request.entity, request.max_wait, |store, now| {
                store.check_receive_mode(&request.entity, session_id)?;
                if let Some(session_id) = session_id {
                    store.require_session_lock(session_id, &request.owner)?;
                }

                let available = store.sub_queue(sub_queue).available(session_id, max_count);
                if available.is_empty() {
                    return Ok(None);
                }

                let locked_until = now + store.properties.lock_duration;
                let queue = store.sub_queue_mut(sub_queue);
                let messages: Vec<ReceivedMessage> = available
                    .into_iter()
                    .filter_map(|seq| queue.lease(seq, &request.owner, locked_until))
                    .collect();
                Ok(Some(messages))
            })
            .await?;

        Ok(leased.unwrap_or_default())
    }

    async fn peek(
        &self,
        entity: &EntityPath,
        session_id: Option<&SessionId>,
        from_sequence_number: u64,
        max_count: u32,
    ) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.with_store(entity, |store, _| {
            let dead_letter = entity.is_dead_letter();
            let messages = store
                .sub_queue(entity.sub_queue())
                .messages
                .range(from_sequence_number..)
                .map(|(_, m)| m)
                .filter(|m| m.in_session(session_id))
                .take(max_count as usize)
                .map(|m| {
                    let mut peeked = m.to_received();
                    peeked.lock_token = None;
                    peeked.locked_until = None;
                    if dead_letter && peeked.state == MessageState::Active {
                        peeked.state = MessageState::DeadLettered;
                    }
                    peeked
                })
                .collect();
            Ok(messages)
        })
    }

    async fn receive_deferred(
        &self,
        entity: &EntityPath,
        session_id: Option<&SessionId>,
        owner: &str,
        sequence_numbers: &[u64],
    ) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.with_store(entity, |store, now| {
            store.check_receive_mode(entity, session_id)?;
            if let Some(session_id) = session_id {
                store.require_session_lock(session_id, owner)?;
            }

            let locked_until = now + store.properties.lock_duration;
            let queue = store.sub_queue_mut(entity.sub_queue());

            for &sequence_number in sequence_numbers {
                match queue.messages.get(&sequence_number) {
                    Some(m) if m.state == MessageState::Deferred && m.in_session(session_id) => {}
                    _ => return Err(ClientError::MessageNotFound { sequence_number }),
                }
            }

            Ok(sequence_numbers
                .iter()
                .filter_map(|&seq| queue.lease(seq, owner, locked_until))
                .collect())
        })
    }

    async fn settle(
        &self,
        entity: &EntityPath,
        owner: &str,
        lock_token: &LockToken,
        settlement: Settlement,
    ) -> Result<SettlementOutcome, ClientError> {
        self.settle_calls.fetch_add(1, Ordering::SeqCst);
        self.inject_failure(settlement.name())?;

        let outcome = self.with_store(entity, |store, _| {
            store.settle(entity.sub_queue(), owner, lock_token, settlement)
        })?;
        self.notify.notify_waiters();

        Ok(outcome)
    }

    async fn renew_message_lock(
        &self,
        entity: &EntityPath,
        owner: &str,
        lock_token: &LockToken,
    ) -> Result<Instant, ClientError> {
        self.inject_failure("renew_message_lock")?;

        self.with_store(entity, |store, now| {
            let lost = || ClientError::LockLost {
                lock_token: lock_token.to_string(),
            };
            let locked_until = now + store.properties.lock_duration;
            let queue = store.sub_queue_mut(entity.sub_queue());
            let sequence_number = queue.leased_by(lock_token, owner).ok_or_else(lost)?;
            let lease = queue
                .messages
                .get_mut(&sequence_number)
                .and_then(|m| m.lease.as_mut())
                .ok_or_else(lost)?;

            lease.locked_until = locked_until;
            Ok(locked_until)
        })
    }

    async fn accept_session(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
    ) -> Result<SessionLease, ClientError> {
        self.with_store(entity, |store, now| {
            store.require_sessions(entity)?;
            store.lock_session(session_id.clone(), owner, now)
        })
    }

    async fn accept_next_session(
        &self,
        entity: &EntityPath,
        owner: &str,
        skip: &[SessionId],
        max_wait: Duration,
    ) -> Result<Option<SessionLease>, ClientError> {
        self.wait_until_ready(entity, max_wait, |store, now| {
            store.require_sessions(entity)?;
            store
                .next_available_session(skip)
                .map(|id| store.lock_session(id, owner, now))
                .transpose()
        })
        .await
    }

    async fn renew_session_lock(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
    ) -> Result<Instant, ClientError> {
        self.with_store(entity, |store, now| {
            store.require_session_lock(session_id, owner)?;
            let locked_until = now + store.properties.lock_duration;
            if let Some(lock) = store
                .sessions
                .get_mut(session_id)
                .and_then(|entry| entry.lock.as_mut())
            {
                lock.locked_until = locked_until;
            }
            Ok(locked_until)
        })
    }

    async fn release_session(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
    ) -> Result<(), ClientError> {
        let released = self.with_store(entity, |store, _| {
            if store.require_session_lock(session_id, owner).is_err() {
                return Ok(false);
            }
            Ok(store.release_session_lock(session_id))
        })?;

        if released {
            debug!(entity = %entity, session_id = %session_id, "Released session lock");
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn get_session_state(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
    ) -> Result<Option<Bytes>, ClientError> {
        self.with_store(entity, |store, _| {
            store.require_session_lock(session_id, owner)?;
            Ok(store
                .sessions
                .get(session_id)
                .and_then(|entry| entry.state.clone()))
        })
    }

    async fn set_session_state(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
        state: Option<Bytes>,
    ) -> Result<(), ClientError> {
        self.with_store(entity, |store, _| {
            store.require_session_lock(session_id, owner)?;
            store.sessions.entry(session_id.clone()).or_default().state = state;
            Ok(())
        })
    }
}
