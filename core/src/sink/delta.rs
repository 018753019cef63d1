use std::sync::Arc;

use arrow::array::{ArrayRef, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use deltalake::kernel::{DataType as DeltaDataType, PrimitiveType, StructField};
use deltalake::protocol::SaveMode;
use deltalake::{DeltaOps, DeltaTable};
use tracing::{debug, info};

use crate::errors::ArchiveError;
use crate::sink::{ArchiveRecord, ArchiveWriter};

const TABLE_NAME: &str = "notify_archive";

/// Archive columns, in order. All but `partition` and `offset` are strings.
const COLUMNS: [(&str, ArrowDataType); 7] = [
    ("row_key", ArrowDataType::Utf8),
    ("topic", ArrowDataType::Utf8),
    ("partition", ArrowDataType::Int32),
    ("offset", ArrowDataType::Int64),
    ("notice", ArrowDataType::Utf8),
    ("message", ArrowDataType::Utf8),
    ("archived_at", ArrowDataType::Utf8),
];

/// Appends archived batches to a Delta table.
pub struct DeltaArchive {
    table_uri: String,
    table: DeltaTable,
    schema: Arc<ArrowSchema>,
}

impl DeltaArchive {
    pub async fn new(table_uri: impl Into<String>) -> Result<Self, ArchiveError> {
        let table_uri = table_uri.into();
        let table = ensure_table_exists(&table_uri).await?;

        Ok(Self {
            table_uri,
            table,
            schema: Arc::new(arrow_schema()),
        })
    }

    fn to_record_batch(&self, record: &ArchiveRecord) -> Result<RecordBatch, ArchiveError> {
        let archived_at = chrono::Utc::now().to_rfc3339();
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec![record.key.as_str()])),
            Arc::new(StringArray::from(vec![record.topic.as_str()])),
            Arc::new(Int32Array::from(vec![record.partition])),
            Arc::new(Int64Array::from(vec![record.offset])),
            Arc::new(StringArray::from(vec![record.notice.as_str()])),
            Arc::new(StringArray::from(vec![record.message.as_str()])),
            Arc::new(StringArray::from(vec![archived_at])),
        ];

        RecordBatch::try_new(self.schema.clone(), columns).map_err(|e| {
            ArchiveError::RecordBatch {
                reason: e.to_string(),
            }
        })
    }
}

impl ArchiveWriter for DeltaArchive {
    async fn put(&mut self, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        let batch = self.to_record_batch(record)?;

        let table = DeltaOps(self.table.clone())
            .write(vec![batch])
            .with_save_mode(SaveMode::Append)
            .await
            .map_err(|e| ArchiveError::Write {
                key: record.key.clone(),
                reason: e.to_string(),
            })?;
        self.table = table;

        debug!(key = %record.key, table_uri = %self.table_uri, "Archived batch");
        Ok(())
    }
}

fn arrow_schema() -> ArrowSchema {
    ArrowSchema::new(
        COLUMNS
            .iter()
            .map(|(name, data_type)| Field::new(*name, data_type.clone(), false))
            .collect::<Vec<_>>(),
    )
}

fn delta_columns() -> Vec<StructField> {
    COLUMNS
        .iter()
        .map(|(name, data_type)| {
            let primitive = match data_type {
                ArrowDataType::Int32 => PrimitiveType::Integer,
                ArrowDataType::Int64 => PrimitiveType::Long,
                _ => PrimitiveType::String,
            };
            StructField::new(name.to_string(), DeltaDataType::Primitive(primitive), false)
        })
        .collect()
}

async fn ensure_table_exists(table_uri: &str) -> Result<DeltaTable, ArchiveError> {
    match deltalake::open_table(table_uri).await {
        Ok(table) => {
            info!("Archive table exists at: {}", table_uri);
            Ok(table)
        }
        Err(_) => {
            info!("Creating new archive table at: {}", table_uri);
            create_table(table_uri).await
        }
    }
}

async fn create_table(table_uri: &str) -> Result<DeltaTable, ArchiveError> {
    let ops = DeltaOps::try_from_uri(table_uri)
        .await
        .map_err(|e| ArchiveError::TableLoad {
            uri: table_uri.to_string(),
            reason: e.to_string(),
        })?;

    ops.create()
        .with_table_name(TABLE_NAME)
        .with_columns(delta_columns())
        .await
        .map_err(|e| ArchiveError::TableCreation {
            uri: table_uri.to_string(),
            reason: e.to_string(),
        })
}
