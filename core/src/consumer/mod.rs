//! Multi-destination consumer.
//!
//! One poller task per destination fetches batches from its own connection
//! and forwards them over a single-slot channel. One dispatcher, running on
//! the caller's task, hands each batch to the [`BatchHandler`] and then
//! acknowledges or rolls it back on the connection it came from. The
//! connection travels with the batch and goes back to its poller once the
//! batch is resolved, so a poller never fetches while its previous batch is
//! still open.
//!
//! Cancelling the shutdown token stops the dispatcher from taking new
//! batches. Teardown then cancels every poller, rolls back batches still
//! queued, joins the poller tasks and closes every connection.

pub mod backoff;
mod dispatcher;
mod poller;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{ConfigError, NotifyError};
use crate::source::{Connection, Connector};
use crate::telemetry::{ConsumerMetrics, MetricsSnapshot};

pub use backoff::Backoff;
pub use dispatcher::{BatchHandler, Outcome};

use dispatcher::Dispatcher;
use poller::{Poller, PollerExit};

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Upper bound on messages per fetch.
    pub batch_size: usize,
    /// Pause before acknowledging an empty fetch and fetching again.
    pub idle_backoff: Duration,
    /// Delays between retries of transient fetch failures.
    pub error_backoff: Backoff,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            idle_backoff: Duration::from_millis(300),
            error_backoff: Backoff::default(),
        }
    }
}

impl ConsumerOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                message: "batch_size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// A poller that ended with an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollerFailure {
    pub destination: String,
    pub error: String,
}

/// Summary of one [`Consumer::run`].
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerReport {
    pub metrics: MetricsSnapshot,
    pub failures: Vec<PollerFailure>,
    /// Connections closed during teardown.
    pub closed_connections: usize,
}

pub struct Consumer<C: Connection> {
    connections: Vec<(String, C)>,
    options: ConsumerOptions,
    shutdown: CancellationToken,
    metrics: Arc<ConsumerMetrics>,
}

impl<C: Connection> Consumer<C> {
    pub fn new(options: ConsumerOptions, shutdown: CancellationToken) -> Self {
        Self {
            connections: Vec::new(),
            options,
            shutdown,
            metrics: Arc::new(ConsumerMetrics::default()),
        }
    }

    /// Adds an already open connection for `destination`.
    pub fn with_connection(mut self, destination: impl Into<String>, connection: C) -> Self {
        self.connections.push((destination.into(), connection));
        self
    }

    /// Opens one connection per destination.
    ///
    /// If any destination fails to connect, the connections opened so far are
    /// closed and the error is returned.
    pub async fn connect<K>(
        destinations: &[String],
        connector: &K,
        options: ConsumerOptions,
        shutdown: CancellationToken,
    ) -> Result<Self, NotifyError>
    where
        K: Connector<Connection = C>,
    {
        options.validate()?;

        let mut consumer = Self::new(options, shutdown);
        for destination in destinations {
            match connector.connect(destination).await {
                Ok(connection) => {
                    info!(destination = %destination, "Connected");
                    consumer.connections.push((destination.clone(), connection));
                }
                Err(err) => {
                    error!(destination = %destination, error = %err, "Failed to connect");
                    consumer.close_all().await;
                    return Err(err.into());
                }
            }
        }
        Ok(consumer)
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.connections.iter().map(|(destination, _)| destination.as_str())
    }

    /// Runs until the shutdown token is cancelled or every poller has
    /// stopped, then tears down deterministically.
    pub async fn run<H>(mut self, handler: &mut H) -> Result<ConsumerReport, NotifyError>
    where
        H: BatchHandler<C::Message>,
    {
        if let Err(err) = self.options.validate() {
            self.close_all().await;
            return Err(err.into());
        }

        let Consumer {
            connections,
            options,
            shutdown,
            metrics,
        } = self;

        let (sender, receiver) = mpsc::channel(1);
        let pollers_cancel = shutdown.child_token();

        let mut destinations = Vec::with_capacity(connections.len());
        let mut handles = Vec::with_capacity(connections.len());
        for (destination, connection) in connections {
            let destination: Arc<str> = destination.into();
            let poller = Poller::new(
                destination.clone(),
                connection,
                options.clone(),
                sender.clone(),
                pollers_cancel.child_token(),
                metrics.clone(),
            );
            destinations.push(destination);
            handles.push(tokio::spawn(poller.run()));
        }
        drop(sender);

        info!(destinations = destinations.len(), "Consumer started");

        let mut dispatcher = Dispatcher::new(receiver, shutdown, handler, metrics.clone());
        dispatcher.run().await;

        pollers_cancel.cancel();
        dispatcher.drain().await;

        let mut failures = Vec::new();
        let mut returned = Vec::with_capacity(handles.len());
        for (destination, joined) in destinations.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(PollerExit {
                    destination,
                    connection,
                    result,
                }) => {
                    if let Err(err) = result {
                        failures.push(PollerFailure {
                            destination: destination.to_string(),
                            error: err.to_string(),
                        });
                    }
                    if let Some(connection) = connection {
                        returned.push((destination, connection));
                    }
                }
                Err(join_err) => {
                    error!(%destination, error = %join_err, "Poller task failed");
                    failures.push(PollerFailure {
                        destination: destination.to_string(),
                        error: join_err.to_string(),
                    });
                }
            }
        }

        let mut closed_connections = 0;
        for (destination, mut connection) in returned {
            match connection.close().await {
                Ok(()) => closed_connections += 1,
                Err(err) => warn!(%destination, error = %err, "Failed to close connection"),
            }
        }

        let report = ConsumerReport {
            metrics: metrics.snapshot(),
            failures,
            closed_connections,
        };
        info!(
            closed = report.closed_connections,
            failed = report.failures.len(),
            metrics = ?report.metrics,
            "Consumer stopped"
        );
        Ok(report)
    }

    async fn close_all(&mut self) {
        for (destination, connection) in &mut self.connections {
            if let Err(err) = connection.close().await {
                warn!(destination = %destination, error = %err, "Failed to close connection");
            }
        }
        self.connections.clear();
    }
}
