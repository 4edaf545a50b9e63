//! Session-affinity receive.
//!
//! A session groups messages sharing a `session_id`. The [`SessionRouter`]
//! locks one session at a time to a [`SessionReceiver`]; the holder sees the
//! session's messages in FIFO order and can checkpoint progress in the
//! session state.
//!
//! Exclusivity is enforced twice: the broker grants one lock per session,
//! and the connection keeps a registry of sessions held by handles created
//! from it, so a second local accept fails with `SessionLocked` without a
//! round trip.
//!
//! # Example
//!
//! ```rust,no_run
//! use relaybus_client::{Connection, ReceiverOptions, SessionId};
//! use std::time::Duration;
//!
//! # async fn example(connection: Connection, entity: relaybus_client::EntityPath)
//! #     -> Result<(), relaybus_client::ClientError> {
//! let router = connection
//!     .create_session_router(entity, ReceiverOptions::default())
//!     .await?;
//!
//! if let Some(mut session) = router.accept_next_session(Duration::from_secs(5)).await? {
//!     while let Some(message) = session.receive_message().await? {
//!         session.complete(&message).await?;
//!     }
//!     session.close().await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::{EntityProperties, ReceiverOptions};
use crate::connection::{owner_name, ConnectionInner};
use crate::entity::EntityPath;
use crate::error::ClientError;
use crate::message::{ReceivedMessage, SessionId};
use crate::receiver::{AbandonOutcome, Receiver};
use crate::transport::SessionLease;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

/// Sessions currently held by handles of one connection
#[derive(Default)]
pub(crate) struct SessionRegistry {
    held: Mutex<HashSet<(EntityPath, SessionId)>>,
}

impl SessionRegistry {
    /// Record the session as held; false if it already is
    pub(crate) fn try_acquire(&self, entity: &EntityPath, session_id: &SessionId) -> bool {
        self.held.lock().insert((entity.clone(), session_id.clone()))
    }

    pub(crate) fn release(&self, entity: &EntityPath, session_id: &SessionId) {
        self.held.lock().remove(&(entity.clone(), session_id.clone()));
    }

    /// Sessions of `entity` currently held
    pub(crate) fn held_in(&self, entity: &EntityPath) -> Vec<SessionId> {
        self.held
            .lock()
            .iter()
            .filter(|(held_entity, _)| held_entity == entity)
            .map(|(_, session_id)| session_id.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, entity: &EntityPath, session_id: &SessionId) -> bool {
        self.held.lock().contains(&(entity.clone(), session_id.clone()))
    }
}

/// Accepts sessions of a session-enabled queue or subscription
pub struct SessionRouter {
    connection: Arc<ConnectionInner>,
    entity: EntityPath,
    properties: EntityProperties,
    options: ReceiverOptions,
}

impl SessionRouter {
    pub(crate) fn new(
        connection: Arc<ConnectionInner>,
        entity: EntityPath,
        properties: EntityProperties,
        options: ReceiverOptions,
    ) -> Self {
        Self {
            connection,
            entity,
            properties,
            options,
        }
    }

    pub fn entity(&self) -> &EntityPath {
        &self.entity
    }

    /// Lock a specific session.
    ///
    /// Fails with `SessionLocked` while another handle holds the session.
    pub async fn accept_session(&self, session_id: SessionId) -> Result<SessionReceiver, ClientError> {
        self.connection.ensure_open()?;

        if !self.connection.sessions.try_acquire(&self.entity, &session_id) {
            return Err(ClientError::SessionLocked {
                session_id: session_id.to_string(),
            });
        }

        let owner = owner_name(&self.options, "session");
        let result = self
            .connection
            .round_trip(
                "accept_session",
                self.connection
                    .transport
                    .accept_session(&self.entity, &session_id, &owner),
            )
            .await;

        match result {
            Ok(lease) => Ok(self.session_receiver(lease, owner)),
            Err(e) => {
                self.connection.sessions.release(&self.entity, &session_id);
                Err(e)
            }
        }
    }

    /// Lock the next session with at least one active message.
    ///
    /// Sessions are offered in the order of their oldest active message.
    /// Sessions already held through this connection are passed over, even
    /// when their broker lock has lapsed, so they cannot hide the rest.
    /// Returns `None` if no session becomes available within `max_wait`.
    pub async fn accept_next_session(
        &self,
        max_wait: Duration,
    ) -> Result<Option<SessionReceiver>, ClientError> {
        let owner = owner_name(&self.options, "session");
        let deadline = Instant::now() + max_wait;

        loop {
            let skip = self.connection.sessions.held_in(&self.entity);
            let remaining = deadline.saturating_duration_since(Instant::now());

            let lease = self
                .connection
                .until_closed(self.connection.transport.accept_next_session(
                    &self.entity,
                    &owner,
                    &skip,
                    remaining,
                ))
                .await?;

            let Some(lease) = lease else {
                debug!(entity = %self.entity, "No session available");
                return Ok(None);
            };

            if self
                .connection
                .sessions
                .try_acquire(&self.entity, &lease.session_id)
            {
                return Ok(Some(self.session_receiver(lease, owner)));
            }

            // Another local handle took the session after `skip` was read
            debug!(
                entity = %self.entity,
                session_id = %lease.session_id,
                "Session claimed locally during accept, selecting again"
            );
            if let Err(e) = self
                .connection
                .transport
                .release_session(&self.entity, &lease.session_id, &owner)
                .await
            {
                warn!(
                    entity = %self.entity,
                    session_id = %lease.session_id,
                    error = %e,
                    "Failed to release session lock granted twice"
                );
            }
        }
    }

    fn session_receiver(&self, lease: SessionLease, owner: String) -> SessionReceiver {
        info!(
            entity = %self.entity,
            session_id = %lease.session_id,
            owner = %owner,
            "Accepted session"
        );

        let mut receiver = Receiver::new(
            Arc::clone(&self.connection),
            self.entity.clone(),
            Some(lease.session_id.clone()),
            owner,
            self.properties.clone(),
            self.options.clone(),
        );
        receiver.set_session_locked_until(lease.locked_until);

        SessionReceiver {
            receiver,
            session_id: lease.session_id,
            released: false,
        }
    }
}

/// Receiver restricted to one locked session.
///
/// Dropping the handle releases the session; [`close`](Self::close) does the
/// same and also returns prefetched messages.
pub struct SessionReceiver {
    receiver: Receiver,
    session_id: SessionId,
    released: bool,
}

impl SessionReceiver {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn entity(&self) -> &EntityPath {
        self.receiver.entity()
    }

    /// When the session lock expires unless renewed
    pub fn session_locked_until(&self) -> Instant {
        self.receiver
            .session_locked_until()
            .unwrap_or_else(Instant::now)
    }

    pub async fn receive(
        &mut self,
        max_count: u32,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.receiver.receive(max_count, max_wait).await
    }

    pub async fn receive_message(&mut self) -> Result<Option<ReceivedMessage>, ClientError> {
        self.receiver.receive_message().await
    }

    pub async fn receive_deferred(
        &mut self,
        sequence_numbers: &[u64],
    ) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.receiver.receive_deferred(sequence_numbers).await
    }

    pub async fn peek_messages(&mut self, max_count: u32) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.receiver.peek_messages(max_count).await
    }

    pub async fn complete(&mut self, message: &ReceivedMessage) -> Result<(), ClientError> {
        self.receiver.complete(message).await
    }

    pub async fn abandon(&mut self, message: &ReceivedMessage) -> Result<AbandonOutcome, ClientError> {
        self.receiver.abandon(message).await
    }

    pub async fn dead_letter(
        &mut self,
        message: &ReceivedMessage,
        reason: impl Into<String>,
        description: Option<String>,
    ) -> Result<(), ClientError> {
        self.receiver.dead_letter(message, reason, description).await
    }

    pub async fn defer(&mut self, message: &ReceivedMessage) -> Result<u64, ClientError> {
        self.receiver.defer(message).await
    }

    pub async fn renew_message_lock(
        &mut self,
        message: &mut ReceivedMessage,
    ) -> Result<Instant, ClientError> {
        self.receiver.renew_message_lock(message).await
    }

    /// Extend the session lock by the entity's lock duration
    pub async fn renew_session_lock(&mut self) -> Result<Instant, ClientError> {
        self.receiver.ensure_open()?;

        let connection = Arc::clone(self.receiver.connection());
        let locked_until = connection
            .round_trip(
                "renew_session_lock",
                connection.transport.renew_session_lock(
                    self.receiver.entity(),
                    &self.session_id,
                    self.receiver.identifier(),
                ),
            )
            .await?;

        self.receiver.set_session_locked_until(locked_until);
        debug!(session_id = %self.session_id, "Renewed session lock");
        Ok(locked_until)
    }

    /// Read the session state checkpoint
    pub async fn get_state(&mut self) -> Result<Option<Bytes>, ClientError> {
        self.receiver.ensure_open()?;

        let connection = Arc::clone(self.receiver.connection());
        connection
            .round_trip(
                "get_session_state",
                connection.transport.get_session_state(
                    self.receiver.entity(),
                    &self.session_id,
                    self.receiver.identifier(),
                ),
            )
            .await
    }

    /// Replace the session state checkpoint; `None` clears it
    pub async fn set_state(&mut self, state: Option<Bytes>) -> Result<(), ClientError> {
        self.receiver.ensure_open()?;

        let connection = Arc::clone(self.receiver.connection());
        connection
            .round_trip(
                "set_session_state",
                connection.transport.set_session_state(
                    self.receiver.entity(),
                    &self.session_id,
                    self.receiver.identifier(),
                    state,
                ),
            )
            .await
    }

    /// Return prefetched messages and release the session lock
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.receiver.close().await?;
        self.released = true;

        let connection = Arc::clone(self.receiver.connection());
        connection
            .sessions
            .release(self.receiver.entity(), &self.session_id);

        if connection.is_closed() {
            return Ok(());
        }

        connection
            .round_trip(
                "release_session",
                connection.transport.release_session(
                    self.receiver.entity(),
                    &self.session_id,
                    self.receiver.identifier(),
                ),
            )
            .await?;

        info!(session_id = %self.session_id, "Closed session");
        Ok(())
    }
}

impl Drop for SessionReceiver {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let connection = Arc::clone(self.receiver.connection());
        let entity = self.receiver.entity().clone();
        let session_id = self.session_id.clone();
        let owner = self.receiver.identifier().to_string();

        connection.sessions.release(&entity, &session_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = connection
                        .transport
                        .release_session(&entity, &session_id, &owner)
                        .await
                    {
                        debug!(session_id = %session_id, error = %e, "Session release after drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    "Session dropped outside a runtime; lock is held until it expires"
                );
            }
        }
    }
}
