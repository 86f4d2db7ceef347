//! Table-level primitives: hash partitioning, split, concatenation, empty tables.

use arrow::array::{Array, StringArray, UInt32Array};
use arrow::compute;
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use gfq_common::{GfqError, Result};

use crate::scalar::{hash_group_key, scalar_from_array, ScalarValue};

/// Reorder `batch` so rows with equal hashed key columns become contiguous.
///
/// Returns the reordered batch plus partition start offsets. The offsets
/// always begin with 0; callers slicing with [`split`] must drop that leading
/// entry. Identical keys land in the same partition index on every node.
pub fn hash_partition(
    batch: &RecordBatch,
    key_indices: &[usize],
    num_partitions: usize,
) -> Result<(RecordBatch, Vec<usize>)> {
    if num_partitions == 0 {
        return Err(GfqError::InvalidConfig(
            "hash_partition requires at least one partition".to_string(),
        ));
    }
    for &idx in key_indices {
        if idx >= batch.num_columns() {
            return Err(GfqError::Execution(format!(
                "hash key column index {idx} out of bounds for {} columns",
                batch.num_columns()
            )));
        }
    }

    let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); num_partitions];
    for row in 0..batch.num_rows() {
        let key = key_indices
            .iter()
            .map(|i| scalar_from_array(batch.column(*i), row))
            .collect::<Result<Vec<ScalarValue>>>()?;
        let part = (hash_group_key(&key) % num_partitions as u64) as usize;
        buckets[part].push(row as u32);
    }

    let mut offsets = Vec::with_capacity(num_partitions);
    let mut take_indices = Vec::with_capacity(batch.num_rows());
    let mut acc = 0_usize;
    for bucket in &buckets {
        offsets.push(acc);
        acc += bucket.len();
        take_indices.extend_from_slice(bucket);
    }

    let indices = UInt32Array::from(take_indices);
    let columns = batch
        .columns()
        .iter()
        .map(|c| {
            compute::take(c.as_ref(), &indices, None)
                .map_err(|e| GfqError::Execution(format!("hash partition take failed: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let reordered = RecordBatch::try_new(batch.schema(), columns)
        .map_err(|e| GfqError::Execution(format!("hash partition batch build failed: {e}")))?;
    Ok((reordered, offsets))
}

/// Slice `batch` at `split_indices` into `split_indices.len() + 1` views.
/// Indices must exclude the leading 0 produced by [`hash_partition`].
pub fn split(batch: &RecordBatch, split_indices: &[usize]) -> Vec<RecordBatch> {
    let mut out = Vec::with_capacity(split_indices.len() + 1);
    let mut start = 0_usize;
    for &end in split_indices {
        let end = end.min(batch.num_rows());
        out.push(batch.slice(start, end.saturating_sub(start)));
        start = end;
    }
    out.push(batch.slice(start, batch.num_rows().saturating_sub(start)));
    out
}

/// Concatenate batches sharing one schema into a single batch.
pub fn concatenate(batches: &[RecordBatch]) -> Result<RecordBatch> {
    let schema = batches
        .first()
        .map(|b| b.schema())
        .ok_or_else(|| GfqError::Execution("cannot concatenate zero batches".to_string()))?;
    compute::concat_batches(&schema, batches.iter())
        .map_err(|e| GfqError::Execution(format!("concat failed: {e}")))
}

/// Whether concatenating these batches would overflow the i32 value-offset
/// capacity of any Utf8 column.
pub fn concat_strings_will_overflow(batches: &[RecordBatch]) -> bool {
    let Some(first) = batches.first() else {
        return false;
    };
    for (idx, field) in first.schema().fields().iter().enumerate() {
        if field.data_type() != &DataType::Utf8 {
            continue;
        }
        let mut total: u64 = 0;
        for batch in batches {
            let Some(a) = batch.column(idx).as_any().downcast_ref::<StringArray>() else {
                continue;
            };
            let offsets = a.value_offsets();
            total += (offsets[a.len()] - offsets[0]) as u64;
        }
        if total > i32::MAX as u64 {
            return true;
        }
    }
    false
}

/// Zero-row batch preserving the schema of `batch`.
pub fn empty_like(batch: &RecordBatch) -> RecordBatch {
    RecordBatch::new_empty(batch.schema())
}

/// In-memory footprint of a batch's columns.
pub fn batch_bytes(batch: &RecordBatch) -> usize {
    batch
        .columns()
        .iter()
        .map(|a| a.get_array_memory_size())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{Field, Schema};
    use std::sync::Arc;

    fn keyed_batch(keys: &[i64], values: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(keys.to_vec())),
                Arc::new(Int64Array::from(values.to_vec())),
            ],
        )
        .expect("batch")
    }

    fn partition_of_key(batch: &RecordBatch, key: i64, num_partitions: usize) -> Option<usize> {
        let (reordered, offsets) = hash_partition(batch, &[0], num_partitions).expect("partition");
        let keys = reordered
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("keys");
        for row in 0..keys.len() {
            if keys.value(row) == key {
                let part = offsets
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(_, &off)| off <= row)
                    .map(|(i, _)| i)
                    .expect("offset");
                return Some(part);
            }
        }
        None
    }

    #[test]
    fn equal_keys_route_to_the_same_partition_across_batches() {
        let a = keyed_batch(&[1, 2, 3, 1], &[10, 20, 30, 40]);
        let b = keyed_batch(&[3, 1, 2], &[7, 8, 9]);
        for key in [1_i64, 2, 3] {
            let pa = partition_of_key(&a, key, 3).expect("key in a");
            let pb = partition_of_key(&b, key, 3).expect("key in b");
            assert_eq!(pa, pb, "key {key} routed to different partitions");
        }
    }

    #[test]
    fn partition_offsets_start_at_zero_and_cover_all_rows() {
        let batch = keyed_batch(&[5, 6, 7, 8, 9], &[1, 2, 3, 4, 5]);
        let (reordered, offsets) = hash_partition(&batch, &[0], 4).expect("partition");
        assert_eq!(offsets.len(), 4);
        assert_eq!(offsets[0], 0);
        assert_eq!(reordered.num_rows(), batch.num_rows());

        let parts = split(&reordered, &offsets[1..]);
        assert_eq!(parts.len(), 4);
        let total: usize = parts.iter().map(|p| p.num_rows()).sum();
        assert_eq!(total, batch.num_rows());
    }

    #[test]
    fn zero_row_batch_partitions_into_empty_schema_preserving_views() {
        let batch = keyed_batch(&[], &[]);
        let (reordered, offsets) = hash_partition(&batch, &[0], 3).expect("partition");
        assert_eq!(offsets, vec![0, 0, 0]);
        let parts = split(&reordered, &offsets[1..]);
        assert_eq!(parts.len(), 3);
        for part in parts {
            assert_eq!(part.num_rows(), 0);
            assert_eq!(part.schema(), batch.schema());
        }
    }

    #[test]
    fn concatenates_batches_and_reports_no_overflow_for_small_strings() {
        let a = keyed_batch(&[1, 2], &[10, 20]);
        let b = keyed_batch(&[3], &[30]);
        let merged = concatenate(&[a.clone(), b]).expect("concat");
        assert_eq!(merged.num_rows(), 3);
        assert!(!concat_strings_will_overflow(&[a]));
    }

    #[test]
    fn empty_like_preserves_schema() {
        let batch = keyed_batch(&[1], &[2]);
        let empty = empty_like(&batch);
        assert_eq!(empty.num_rows(), 0);
        assert_eq!(empty.schema(), batch.schema());
    }
}
