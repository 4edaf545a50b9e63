//! Background message pump.
//!
//! A [`MessageProcessor`] owns a [`Receiver`] on a spawned task, hands every
//! message to an async handler and settles it according to the returned
//! [`MessageAction`]. Handler errors abandon the message so the dead-letter
//! policy bounds poison messages.

use crate::error::ClientError;
use crate::message::ReceivedMessage;
use crate::receiver::{AbandonOutcome, Receiver};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;

/// Settlement chosen by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageAction {
    Complete,
    Abandon,
    DeadLetter {
        reason: String,
        description: Option<String>,
    },
    Defer,
}

impl MessageAction {
    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Self::DeadLetter {
            reason: reason.into(),
            description: None,
        }
    }
}

/// Processor tuning
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Messages requested per receive call
    pub max_messages: u32,
    /// Long-poll wait per receive call
    pub max_wait: Duration,
    /// Pause after a transient receive failure
    pub error_backoff: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_messages: 1,
            max_wait: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Counters reported when a processor stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub handler_errors: u64,
    pub settlement_errors: u64,
}

/// Handle to a running message pump
pub struct MessageProcessor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<(Receiver, ProcessorStats)>,
}

impl MessageProcessor {
    /// Spawn the pump on the current runtime
    pub fn start<H, Fut>(receiver: Receiver, options: ProcessorOptions, handler: H) -> Self
    where
        H: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<MessageAction>> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        info!(entity = %receiver.entity(), "Starting message processor");

        let task = tokio::spawn(run(receiver, options, handler, shutdown_rx));
        Self { shutdown, task }
    }

    /// Signal shutdown, wait for the in-flight message and close the receiver
    pub async fn stop(self) -> Result<ProcessorStats, ClientError> {
        let _ = self.shutdown.send(true);

        let (mut receiver, stats) = self.task.await.map_err(|e| ClientError::InvalidOperation {
            message: format!("message processor task failed: {}", e),
        })?;

        receiver.close().await?;
        info!(entity = %receiver.entity(), received = stats.received, "Stopped message processor");
        Ok(stats)
    }
}

async fn run<H, Fut>(
    mut receiver: Receiver,
    options: ProcessorOptions,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) -> (Receiver, ProcessorStats)
where
    H: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<MessageAction>> + Send + 'static,
{
    let mut stats = ProcessorStats::default();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            _ = shutdown.changed() => break,
            result = receiver.receive(options.max_messages, options.max_wait) => result,
        };

        let messages = match received {
            Ok(messages) => messages,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Receive failed, backing off");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(options.error_backoff) => continue,
                }
            }
            Err(e) => {
                error!(error = %e, "Receive failed, stopping message processor");
                break;
            }
        };

        for message in messages {
            stats.received += 1;
            if let Err(e) = process(&mut receiver, &handler, message, &mut stats).await {
                if matches!(e, ClientError::ConnectionClosed) {
                    return (receiver, stats);
                }
                stats.settlement_errors += 1;
                warn!(error = %e, "Settlement failed");
            }
        }
    }

    debug!(entity = %receiver.entity(), "Message processor loop finished");
    (receiver, stats)
}

async fn process<H, Fut>(
    receiver: &mut Receiver,
    handler: &H,
    message: ReceivedMessage,
    stats: &mut ProcessorStats,
) -> Result<(), ClientError>
where
    H: Fn(ReceivedMessage) -> Fut,
    Fut: Future<Output = anyhow::Result<MessageAction>>,
{
    let action = match handler(message.clone()).await {
        Ok(action) => action,
        Err(e) => {
            stats.handler_errors += 1;
            warn!(
                sequence_number = message.sequence_number,
                error = %e,
                "Handler failed, abandoning message"
            );
            MessageAction::Abandon
        }
    };

    match action {
        MessageAction::Complete => {
            receiver.complete(&message).await?;
            stats.completed += 1;
        }
        MessageAction::Abandon => match receiver.abandon(&message).await? {
            AbandonOutcome::Redelivered { .. } => stats.abandoned += 1,
            AbandonOutcome::DeadLettered { .. } => stats.dead_lettered += 1,
        },
        MessageAction::DeadLetter {
            reason,
            description,
        } => {
            receiver.dead_letter(&message, reason, description).await?;
            stats.dead_lettered += 1;
        }
        MessageAction::Defer => {
            receiver.defer(&message).await?;
            stats.deferred += 1;
        }
    }

    Ok(())
}
