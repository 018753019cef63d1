use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consumer::poller::{DispatchItem, Resolution};
use crate::source::{Batch, Connection};
use crate::telemetry::ConsumerMetrics;

/// The verdict of a [`BatchHandler`] on one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fully and durably processed; acknowledge it.
    Commit,
    /// Processing failed; roll back so the source redelivers it.
    Retry,
}

impl From<bool> for Outcome {
    fn from(processed: bool) -> Self {
        if processed {
            Outcome::Commit
        } else {
            Outcome::Retry
        }
    }
}

/// Caller logic invoked once per non-empty batch.
///
/// Calls never overlap: the next batch is handed out only after the previous
/// one has been resolved, so a handler can keep downstream state in `self`
/// without locking.
pub trait BatchHandler<M> {
    fn handle(&mut self, batch: &Batch<M>) -> impl Future<Output = Outcome>;
}

impl<M, F> BatchHandler<M> for F
where
    F: FnMut(&Batch<M>) -> Outcome,
{
    fn handle(&mut self, batch: &Batch<M>) -> impl Future<Output = Outcome> {
        std::future::ready(self(batch))
    }
}

pub(crate) struct Dispatcher<'h, C: Connection, H> {
    receiver: mpsc::Receiver<DispatchItem<C>>,
    shutdown: CancellationToken,
    handler: &'h mut H,
    metrics: Arc<ConsumerMetrics>,
}

impl<'h, C, H> Dispatcher<'h, C, H>
where
    C: Connection,
    H: BatchHandler<C::Message>,
{
    pub fn new(
        receiver: mpsc::Receiver<DispatchItem<C>>,
        shutdown: CancellationToken,
        handler: &'h mut H,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            receiver,
            shutdown,
            handler,
            metrics,
        }
    }

    /// Processes items one at a time until shutdown is signalled or every
    /// poller has stopped.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, no longer accepting batches");
                    break;
                }
                item = self.receiver.recv() => match item {
                    Some(item) => self.dispatch(item).await,
                    None => {
                        info!("All pollers stopped");
                        break;
                    }
                },
            }
        }
    }

    async fn dispatch(&mut self, item: DispatchItem<C>) {
        let DispatchItem {
            destination,
            batch,
            mut connection,
            return_to,
        } = item;

        self.metrics.record_dispatch(batch.len());
        let outcome = self.handler.handle(&batch).await;

        let resolved = match outcome {
            Outcome::Commit => {
                self.metrics.record_commit();
                connection.acknowledge(batch.id).await
            }
            Outcome::Retry => {
                self.metrics.record_retry();
                connection.rollback(batch.id).await
            }
        };

        match &resolved {
            Ok(()) => debug!(%destination, batch_id = batch.id, ?outcome, "Batch resolved"),
            Err(err) => {
                self.metrics.record_resolve_failure();
                warn!(%destination, batch_id = batch.id, ?outcome, error = %err, "Failed to resolve batch");
            }
        }

        give_back(
            &destination,
            return_to,
            Resolution {
                connection,
                batch_id: batch.id,
                outcome,
                result: resolved,
            },
        );
    }

    /// Stops the channel and rolls back whatever was queued but never
    /// handled, returning each connection to its poller.
    pub async fn drain(&mut self) {
        self.receiver.close();
        while let Some(item) = self.receiver.recv().await {
            let DispatchItem {
                destination,
                batch,
                mut connection,
                return_to,
            } = item;

            self.metrics.record_shutdown_rollback();
            let result = connection.rollback(batch.id).await;
            match &result {
                Ok(()) => debug!(%destination, batch_id = batch.id, "Rolled back queued batch"),
                Err(err) => {
                    self.metrics.record_resolve_failure();
                    warn!(%destination, batch_id = batch.id, error = %err, "Rollback of queued batch failed");
                }
            }

            give_back(
                &destination,
                return_to,
                Resolution {
                    connection,
                    batch_id: batch.id,
                    outcome: Outcome::Retry,
                    result,
                },
            );
        }
    }
}

fn give_back<C>(
    destination: &str,
    return_to: tokio::sync::oneshot::Sender<Resolution<C>>,
    resolution: Resolution<C>,
) {
    if return_to.send(resolution).is_err() {
        warn!(destination, "Poller is gone, dropping its connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_bool() {
        assert_eq!(Outcome::from(true), Outcome::Commit);
        assert_eq!(Outcome::from(false), Outcome::Retry);
    }

    #[tokio::test]
    async fn test_closure_is_a_handler() {
        let mut seen = Vec::new();
        let mut handler = |batch: &Batch<u32>| {
            seen.push(batch.id);
            Outcome::from(batch.id % 2 == 0)
        };

        assert_eq!(handler.handle(&Batch::new(2, vec![1])).await, Outcome::Commit);
        assert_eq!(handler.handle(&Batch::new(3, vec![1])).await, Outcome::Retry);
        drop(handler);
        assert_eq!(seen, vec![2, 3]);
    }
}
