use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::consumer::backoff::Backoff;
use crate::consumer::{ConsumerOptions, Outcome};
use crate::errors::SourceError;
use crate::source::{Batch, Connection};
use crate::telemetry::ConsumerMetrics;

/// A fetched batch on its way to the dispatcher, together with the
/// connection it came from. The dispatcher resolves the batch on that
/// connection and hands the connection back through `return_to`.
pub(crate) struct DispatchItem<C: Connection> {
    pub destination: Arc<str>,
    pub batch: Batch<C::Message>,
    pub connection: C,
    pub return_to: oneshot::Sender<Resolution<C>>,
}

/// A lent connection coming back, with how its batch was resolved.
pub(crate) struct Resolution<C> {
    pub connection: C,
    pub batch_id: i64,
    pub outcome: Outcome,
    pub result: Result<(), SourceError>,
}

/// What a poller leaves behind when it stops.
pub(crate) struct PollerExit<C> {
    pub destination: Arc<str>,
    /// `None` only if the dispatcher dropped a lent connection.
    pub connection: Option<C>,
    pub result: Result<(), SourceError>,
}

pub(crate) struct Poller<C: Connection> {
    destination: Arc<str>,
    connection: C,
    options: ConsumerOptions,
    sender: mpsc::Sender<DispatchItem<C>>,
    cancel: CancellationToken,
    metrics: Arc<ConsumerMetrics>,
}

impl<C: Connection> Poller<C> {
    pub fn new(
        destination: Arc<str>,
        connection: C,
        options: ConsumerOptions,
        sender: mpsc::Sender<DispatchItem<C>>,
        cancel: CancellationToken,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            destination,
            connection,
            options,
            sender,
            cancel,
            metrics,
        }
    }

    /// Fetches and forwards batches until cancelled or the source fails for
    /// good.
    pub async fn run(self) -> PollerExit<C> {
        let Poller {
            destination,
            mut connection,
            options,
            sender,
            cancel,
            metrics,
        } = self;
        let mut backoff = options.error_backoff;

        let result = loop {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                fetched = connection.fetch(options.batch_size) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => {
                    backoff.reset();
                    batch
                }
                Err(err) if err.is_transient() => {
                    metrics.record_fetch_error();
                    let delay = backoff.next_delay();
                    warn!(%destination, error = %err, ?delay, "Fetch failed, retrying");
                    if sleep_or_cancelled(&cancel, delay).await {
                        break Ok(());
                    }
                    continue;
                }
                Err(err) => {
                    metrics.record_fetch_error();
                    error!(%destination, error = %err, "Fetch failed, stopping destination");
                    break Err(err);
                }
            };

            if batch.is_empty() {
                let cancelled = sleep_or_cancelled(&cancel, options.idle_backoff).await;
                match connection.acknowledge(batch.id).await {
                    Ok(()) => metrics.record_empty_ack(),
                    Err(err) if err.is_transient() => {
                        metrics.record_resolve_failure();
                        warn!(%destination, batch_id = batch.id, error = %err, "Empty batch ack failed");
                    }
                    Err(err) => {
                        error!(%destination, batch_id = batch.id, error = %err, "Empty batch ack failed, stopping destination");
                        break Err(err);
                    }
                }
                if cancelled {
                    break Ok(());
                }
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    rollback_unsent(&destination, &mut connection, batch.id, &metrics).await;
                    break Ok(());
                }
                permit = sender.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        rollback_unsent(&destination, &mut connection, batch.id, &metrics).await;
                        break Ok(());
                    }
                },
            };

            debug!(%destination, batch_id = batch.id, messages = batch.len(), "Forwarding batch");
            let (return_to, returned) = oneshot::channel();
            permit.send(DispatchItem {
                destination: destination.clone(),
                batch,
                connection,
                return_to,
            });

            let resolution = match returned.await {
                Ok(resolution) => resolution,
                Err(_) => {
                    error!(%destination, "Dispatcher dropped the connection");
                    return PollerExit {
                        destination,
                        connection: None,
                        result: Err(SourceError::Unrecoverable(
                            "connection was not returned by the dispatcher".into(),
                        )),
                    };
                }
            };
            connection = resolution.connection;

            // Fetching on past an unresolved batch could commit over it.
            if let Err(err) = resolution.result {
                let retried = retry_resolution(
                    &destination,
                    &mut connection,
                    resolution.batch_id,
                    resolution.outcome,
                    err,
                    &mut backoff,
                    &cancel,
                    &metrics,
                )
                .await;
                match retried {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(err) => break Err(err),
                }
            }
        };

        PollerExit {
            destination,
            connection: Some(connection),
            result,
        }
    }
}

/// Sleeps for `delay`, returning early with `true` once `cancel` fires.
async fn sleep_or_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Repeats a failed acknowledge or rollback with backoff until it succeeds.
///
/// Returns `Ok(false)` if cancelled first, leaving the batch unresolved on the
/// source, and the error once it is no longer transient.
#[allow(clippy::too_many_arguments)]
async fn retry_resolution<C: Connection>(
    destination: &str,
    connection: &mut C,
    batch_id: i64,
    outcome: Outcome,
    mut err: SourceError,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
    metrics: &ConsumerMetrics,
) -> Result<bool, SourceError> {
    loop {
        if !err.is_transient() {
            error!(destination, batch_id, ?outcome, error = %err, "Batch cannot be resolved, stopping destination");
            return Err(err);
        }

        let delay = backoff.next_delay();
        warn!(destination, batch_id, ?outcome, error = %err, ?delay, "Retrying batch resolution");
        if sleep_or_cancelled(cancel, delay).await {
            return Ok(false);
        }

        let result = match outcome {
            Outcome::Commit => connection.acknowledge(batch_id).await,
            Outcome::Retry => connection.rollback(batch_id).await,
        };
        match result {
            Ok(()) => {
                backoff.reset();
                debug!(destination, batch_id, ?outcome, "Batch resolved after retry");
                return Ok(true);
            }
            Err(next) => {
                metrics.record_resolve_failure();
                err = next;
            }
        }
    }
}

/// A batch fetched but never dispatched must be redelivered later.
async fn rollback_unsent<C: Connection>(
    destination: &str,
    connection: &mut C,
    batch_id: i64,
    metrics: &ConsumerMetrics,
) {
    metrics.record_shutdown_rollback();
    if let Err(err) = connection.rollback(batch_id).await {
        metrics.record_resolve_failure();
        warn!(destination, batch_id, error = %err, "Rollback of undispatched batch failed");
    }
}
