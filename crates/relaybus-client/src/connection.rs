//! Connection manager: one logical connection to a broker shared by every
//! sender, receiver and session router created from it.

use crate::config::{ClientSettings, ConnectionConfig, EntityProperties, ReceiverOptions};
use crate::entity::EntityPath;
use crate::error::ClientError;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::session::{SessionRegistry, SessionRouter};
use crate::transport::Transport;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// State shared between a connection and the handles derived from it
pub(crate) struct ConnectionInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: ConnectionConfig,
    pub(crate) sessions: SessionRegistry,
    closed: watch::Sender<bool>,
}

impl ConnectionInner {
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(())
    }

    /// Run `future` until it finishes or the connection closes
    pub(crate) async fn until_closed<T, F>(&self, future: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        self.ensure_open()?;
        let closed = self.closed.subscribe();

        tokio::select! {
            result = future => result,
            _ = wait_for_close(closed) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Run a send or settlement round trip bounded by the operation timeout
    pub(crate) async fn round_trip<T, F>(&self, operation: &str, future: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let timeout = self.config.operation_timeout;
        self.until_closed(async move {
            match tokio::time::timeout(timeout, future).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::timed_out(operation, timeout)),
            }
        })
        .await
    }

    pub(crate) async fn entity_properties(
        &self,
        entity: &EntityPath,
    ) -> Result<EntityProperties, ClientError> {
        self.round_trip(
            "entity_properties",
            self.transport.entity_properties(&entity.main()),
        )
        .await
    }
}

async fn wait_for_close(mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Generate a lease owner name for a receiver
pub(crate) fn owner_name(options: &ReceiverOptions, kind: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    match &options.identifier {
        Some(identifier) => format!("{}-{}", identifier, &suffix[..8]),
        None => format!("{}-{}", kind, &suffix[..8]),
    }
}

/// A logical connection to a broker endpoint.
///
/// Cloning is cheap; clones share the same connection. Closing any clone
/// closes the connection and every handle derived from it.
///
/// # Examples
///
/// ```rust,no_run
/// use relaybus_client::{Connection, ConnectionConfig, InMemoryTransport, Message};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), relaybus_client::ClientError> {
/// let transport = Arc::new(InMemoryTransport::new());
/// let queue = transport.create_queue("orders", Default::default())?;
///
/// let connection = Connection::open(transport, ConnectionConfig::default()).await?;
/// let mut sender = connection.create_sender(queue)?;
/// sender.send(Message::new("hello")).await?;
/// connection.close();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Authenticate with the transport and open a connection
    pub async fn open(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let timeout = config.operation_timeout;
        match tokio::time::timeout(timeout, transport.open(&config.credential)).await {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::timed_out("open", timeout)),
        }

        info!(endpoint = %config.endpoint, "Opened connection");

        let (closed, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                transport,
                config,
                sessions: SessionRegistry::default(),
                closed,
            }),
        })
    }

    /// Open a connection using loaded [`ClientSettings`]
    pub async fn from_settings(
        transport: Arc<dyn Transport>,
        settings: &ClientSettings,
    ) -> Result<Self, ClientError> {
        Self::open(transport, settings.connection.clone()).await
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Create a sender for a queue or topic
    pub fn create_sender(&self, entity: EntityPath) -> Result<Sender, ClientError> {
        self.inner.ensure_open()?;

        if !entity.is_sendable() {
            return Err(ClientError::InvalidOperation {
                message: format!("cannot send to '{}'", entity),
            });
        }

        debug!(entity = %entity, "Created sender");
        Ok(Sender::new(Arc::clone(&self.inner), entity))
    }

    /// Create a receiver for a queue, a subscription or a dead-letter sub-queue.
    ///
    /// Session-enabled entities need a [`SessionRouter`] instead; their
    /// dead-letter sub-queues are plain.
    pub async fn create_receiver(
        &self,
        entity: EntityPath,
        options: ReceiverOptions,
    ) -> Result<Receiver, ClientError> {
        self.inner.ensure_open()?;

        if !entity.is_receivable() {
            return Err(ClientError::InvalidOperation {
                message: format!("cannot receive from '{}'", entity),
            });
        }

        let properties = self.inner.entity_properties(&entity).await?;
        if properties.requires_session && !entity.is_dead_letter() {
            return Err(ClientError::InvalidOperation {
                message: format!(
                    "entity '{}' is session-enabled; use a session router",
                    entity
                ),
            });
        }

        let owner = owner_name(&options, "receiver");
        debug!(entity = %entity, owner = %owner, "Created receiver");

        Ok(Receiver::new(
            Arc::clone(&self.inner),
            entity,
            None,
            owner,
            properties,
            options,
        ))
    }

    /// Create a session router for a session-enabled queue or subscription
    pub async fn create_session_router(
        &self,
        entity: EntityPath,
        options: ReceiverOptions,
    ) -> Result<SessionRouter, ClientError> {
        self.inner.ensure_open()?;

        if !entity.is_receivable() || entity.is_dead_letter() {
            return Err(ClientError::InvalidOperation {
                message: format!("cannot accept sessions on '{}'", entity),
            });
        }

        let properties = self.inner.entity_properties(&entity).await?;
        if !properties.requires_session {
            return Err(ClientError::InvalidOperation {
                message: format!("entity '{}' is not session-enabled", entity),
            });
        }

        Ok(SessionRouter::new(
            Arc::clone(&self.inner),
            entity,
            properties,
            options,
        ))
    }

    /// Close the connection.
    ///
    /// Every derived handle fails later operations with `ConnectionClosed`
    /// and blocked receives return immediately.
    pub fn close(&self) {
        let was_closed = self.inner.closed.send_replace(true);
        if !was_closed {
            info!(endpoint = %self.inner.config.endpoint, "Closed connection");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
