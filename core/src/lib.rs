pub mod config;
pub mod consumer;
pub mod errors;
pub mod notice;
pub mod processor;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use config::NotifyConfig;
pub use consumer::{BatchHandler, Consumer, ConsumerOptions, ConsumerReport, Outcome};
pub use errors::{NotifyError, Result, SourceError};
pub use processor::NotifyProcessor;
pub use source::{Batch, Connection, Connector, EMPTY_BATCH_ID, SourceMessage};
