pub mod kafka;

use std::collections::HashMap;
use std::future::Future;

use serde::Serialize;

use crate::errors::SourceError;

/// Batch id a source returns when a fetch produced nothing to process.
pub const EMPTY_BATCH_ID: i64 = -1;

/// A message received from a destination, payload left undecoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMessage {
    /// raw payload of message e.g. a canal entry encoded as JSON
    pub payload: Vec<u8>,
    /// Topic or stream name of this message
    pub topic: String,
    /// partition or shard ID
    pub partition: i32,
    /// Position of the message inside its partition.
    pub offset: i64,
    /// Optional key/value headers for metadata.
    pub headers: HashMap<String, Vec<u8>>,
}

/// An identified group of messages fetched atomically from one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<M> {
    pub id: i64,
    pub messages: Vec<M>,
}

impl<M> Batch<M> {
    pub fn new(id: i64, messages: Vec<M>) -> Self {
        Self { id, messages }
    }

    pub fn empty() -> Self {
        Self {
            id: EMPTY_BATCH_ID,
            messages: Vec::new(),
        }
    }

    /// True for the sentinel id or a batch without messages. Such batches are
    /// acknowledged by the poller and never reach the handler.
    pub fn is_empty(&self) -> bool {
        self.id == EMPTY_BATCH_ID || self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

/// One open, subscribed link to a destination.
///
/// A connection is used by one task at a time: its poller fetches, and the
/// dispatcher acknowledges or rolls back while the poller waits for it.
pub trait Connection: Send + 'static {
    type Message: Send + 'static;

    /// Fetches up to `max_size` messages without acknowledging them.
    ///
    /// May block until messages arrive or a source-side timeout elapses. A
    /// fetch that found nothing returns [`Batch::empty`].
    fn fetch(
        &mut self,
        max_size: usize,
    ) -> impl Future<Output = Result<Batch<Self::Message>, SourceError>> + Send;

    /// Commits consumption up to and including `batch_id`.
    fn acknowledge(&mut self, batch_id: i64)
    -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Asks the source to redeliver `batch_id` on a later fetch.
    fn rollback(&mut self, batch_id: i64) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Releases the connection. Called once during consumer teardown.
    fn close(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;
}

/// Opens connections, one per destination.
pub trait Connector {
    type Connection: Connection;

    fn connect(
        &self,
        destination: &str,
    ) -> impl Future<Output = Result<Self::Connection, SourceError>> + Send;
}
