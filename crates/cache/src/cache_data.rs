//! Cache entries: eager batches and deferred Arrow-IPC payloads.

use std::io::Cursor;

use arrow::array::Array;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use gfq_common::{GfqError, Result};

/// One entry in a [`crate::CacheMachine`] queue.
///
/// Batches produced locally stay eager; batches arriving over the transport
/// stay serialized until a task actually consumes them, so queued remote data
/// does not hold decoded columns alive.
#[derive(Debug, Clone)]
pub enum CacheData {
    Batch(RecordBatch),
    Ipc {
        schema: SchemaRef,
        bytes: Vec<u8>,
        num_rows: usize,
    },
}

impl CacheData {
    pub fn from_ipc(bytes: Vec<u8>) -> Result<Self> {
        let batches = decode_batches_ipc(&bytes)?;
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| GfqError::Execution("ipc payload holds no batches".to_string()))?;
        let num_rows = batches.iter().map(RecordBatch::num_rows).sum();
        Ok(Self::Ipc {
            schema,
            bytes,
            num_rows,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        match self {
            Self::Batch(batch) => batch.schema(),
            Self::Ipc { schema, .. } => schema.clone(),
        }
    }

    pub fn num_rows(&self) -> usize {
        match self {
            Self::Batch(batch) => batch.num_rows(),
            Self::Ipc { num_rows, .. } => *num_rows,
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Batch(batch) => batch
                .columns()
                .iter()
                .map(|a| a.get_array_memory_size())
                .sum(),
            Self::Ipc { bytes, .. } => bytes.len(),
        }
    }

    /// Turn this entry into a single decoded batch, consuming it.
    pub fn materialize(self) -> Result<RecordBatch> {
        match self {
            Self::Batch(batch) => Ok(batch),
            Self::Ipc { schema, bytes, .. } => {
                let batches = decode_batches_ipc(&bytes)?;
                concat_batches(&schema, batches.iter())
                    .map_err(|e| GfqError::Execution(format!("ipc concat failed: {e}")))
            }
        }
    }
}

/// Encode one batch as an Arrow IPC stream payload.
pub fn encode_batch_ipc(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut buf, &batch.schema())
            .map_err(|e| GfqError::Execution(format!("ipc writer init failed: {e}")))?;
        writer
            .write(batch)
            .map_err(|e| GfqError::Execution(format!("ipc write failed: {e}")))?;
        writer
            .finish()
            .map_err(|e| GfqError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(buf)
}

/// Decode an Arrow IPC stream payload back into batches.
pub fn decode_batches_ipc(bytes: &[u8]) -> Result<Vec<RecordBatch>> {
    let cur = Cursor::new(bytes.to_vec());
    let reader = arrow::ipc::reader::StreamReader::try_new(cur, None)
        .map_err(|e| GfqError::Execution(format!("ipc reader init failed: {e}")))?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GfqError::Execution(format!("ipc read failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn ipc_entries_round_trip_through_materialize() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1_i64, 2, 3]))],
        )
        .expect("batch");

        let bytes = encode_batch_ipc(&batch).expect("encode");
        let data = CacheData::from_ipc(bytes).expect("wrap");
        assert_eq!(data.num_rows(), 3);
        assert_eq!(data.schema(), schema);

        let decoded = data.materialize().expect("materialize");
        assert_eq!(decoded, batch);
    }
}
