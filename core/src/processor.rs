use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::consumer::{BatchHandler, Outcome};
use crate::errors::NotifyError;
use crate::notice::build_notices;
use crate::sink::{ArchiveRecord, ArchiveWriter, Publisher};
use crate::source::{Batch, SourceMessage};

/// Handles change batches: publishes one notification document per batch and
/// archives it together with the raw batch.
///
/// A batch is retried when the notice cannot be encoded or published. Archive
/// failures are logged and the batch still commits, since the notice has
/// already gone out.
pub struct NotifyProcessor<P, W> {
    table_name: String,
    publisher: P,
    archive: W,
}

impl<P, W> NotifyProcessor<P, W>
where
    P: Publisher,
    W: ArchiveWriter,
{
    pub fn new(table_name: impl Into<String>, publisher: P, archive: W) -> Self {
        Self {
            table_name: table_name.into(),
            publisher,
            archive,
        }
    }

    pub fn into_parts(self) -> (P, W) {
        (self.publisher, self.archive)
    }

    async fn process(&mut self, batch: &Batch<SourceMessage>) -> Result<(), NotifyError> {
        let notice = serde_json::to_string(&build_notices(&batch.messages))?;
        let message = encode_batch(batch)?;

        let delivery = self.publisher.publish(&self.table_name, &notice).await?;
        let record = ArchiveRecord::new(&self.table_name, delivery, notice, message);

        if let Err(err) = self.archive.put(&record).await {
            warn!(
                key = %record.key,
                notice = %record.notice,
                message = %record.message,
                error = %err,
                "Failed to archive batch"
            );
        }

        info!(
            batch_id = batch.id,
            messages = batch.len(),
            key = %record.key,
            "Published notice"
        );
        Ok(())
    }
}

impl<P, W> BatchHandler<SourceMessage> for NotifyProcessor<P, W>
where
    P: Publisher,
    W: ArchiveWriter,
{
    async fn handle(&mut self, batch: &Batch<SourceMessage>) -> Outcome {
        match self.process(batch).await {
            Ok(()) => Outcome::Commit,
            Err(err) => {
                warn!(batch_id = batch.id, error = %err, "Batch processing failed");
                Outcome::Retry
            }
        }
    }
}

#[derive(Serialize)]
struct BatchDocument<'a> {
    id: i64,
    entries: Vec<EntryDocument<'a>>,
}

#[derive(Serialize)]
struct EntryDocument<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<String>,
}

/// JSON form of a batch for the archive. Payloads that are valid JSON are
/// embedded as-is, anything else is kept as a lossy string.
pub fn encode_batch(batch: &Batch<SourceMessage>) -> serde_json::Result<String> {
    let entries = batch
        .messages
        .iter()
        .map(|message| {
            let entry = serde_json::from_slice::<Value>(&message.payload).ok();
            let raw = match entry {
                Some(_) => None,
                None => Some(String::from_utf8_lossy(&message.payload).into_owned()),
            };
            EntryDocument {
                topic: &message.topic,
                partition: message.partition,
                offset: message.offset,
                entry,
                raw,
            }
        })
        .collect();

    serde_json::to_string(&BatchDocument {
        id: batch.id,
        entries,
    })
}
