//! Hash aggregation over record batches in partial and merge modes.
//!
//! Partial mode consumes raw rows and emits one partially-aggregated row per
//! distinct group key seen in the batch. Merge mode consumes batches that are
//! already partial aggregates (group columns first, aggregate columns after)
//! and combines them into the final values. AVG carries its row count through
//! a hidden companion column so merge can recombine weighted sums.

use std::collections::HashMap;

use arrow::array::{Array, Int64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use gfq_common::{GfqError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::scalar::{
    as_f64, encode_group_key, scalar_from_array, scalar_gt, scalar_lt, scalars_to_array,
    ScalarValue,
};

/// Aggregate function selector carried by parsed group-by expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateKind {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

/// Whether inputs are raw rows or already-aggregated partial results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    Partial,
    Merge,
}

/// Name of the hidden row-count column emitted next to a partial AVG.
pub fn avg_count_col_name(alias: &str) -> String {
    format!("__gfq_avg_count_{alias}")
}

#[derive(Debug, Clone)]
struct AggSpec {
    kind: AggregateKind,
    alias: String,
    input: Option<usize>,
    avg_count_input: Option<usize>,
    out_type: DataType,
}

#[derive(Debug, Clone)]
enum AggState {
    Count(i64),
    SumInt(i64),
    SumFloat(f64),
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: i64 },
}

struct GroupEntry {
    key: Vec<ScalarValue>,
    states: Vec<AggState>,
}

type GroupMap = HashMap<Vec<u8>, GroupEntry>;

/// Distinct projection of the group columns (GROUP BY with no aggregates).
pub fn groupby_without_aggregations(
    batch: &RecordBatch,
    group_indices: &[usize],
) -> Result<RecordBatch> {
    let mut groups = GroupMap::new();
    accumulate(batch, group_indices, &[], AggregateMode::Partial, &mut groups)?;
    build_output(&batch.schema(), group_indices, &[], AggregateMode::Partial, groups)
}

/// Whole-batch aggregation with no group columns; always emits exactly one row.
pub fn aggregate_without_groupby(
    batch: &RecordBatch,
    inputs: &[String],
    kinds: &[AggregateKind],
    aliases: &[String],
    mode: AggregateMode,
) -> Result<RecordBatch> {
    let specs = build_specs(&batch.schema(), inputs, kinds, aliases, mode)?;
    let mut groups = GroupMap::new();
    accumulate(batch, &[], &specs, mode, &mut groups)?;
    if groups.is_empty() {
        groups.insert(
            encode_group_key(&[]),
            GroupEntry {
                key: vec![],
                states: specs.iter().map(init_state).collect(),
            },
        );
    }
    build_output(&batch.schema(), &[], &specs, mode, groups)
}

/// Grouped aggregation; one output row per distinct group key in the batch.
pub fn aggregate_with_groupby(
    batch: &RecordBatch,
    inputs: &[String],
    kinds: &[AggregateKind],
    aliases: &[String],
    group_indices: &[usize],
    mode: AggregateMode,
) -> Result<RecordBatch> {
    let specs = build_specs(&batch.schema(), inputs, kinds, aliases, mode)?;
    let mut groups = GroupMap::new();
    accumulate(batch, group_indices, &specs, mode, &mut groups)?;
    build_output(&batch.schema(), group_indices, &specs, mode, groups)
}

/// Resolve an aggregation input expression against a schema.
///
/// `$N` refers to column N, a bare name is looked up, and the empty string is
/// COUNT(*)'s "no input column".
fn resolve_input_index(schema: &SchemaRef, expr: &str) -> Result<Option<usize>> {
    if expr.is_empty() {
        return Ok(None);
    }
    if let Some(rest) = expr.strip_prefix('$') {
        let idx = rest.parse::<usize>().map_err(|e| {
            GfqError::Expression(format!("invalid column reference '{expr}': {e}"))
        })?;
        if idx >= schema.fields().len() {
            return Err(GfqError::Execution(format!(
                "column reference '{expr}' out of bounds for {} columns",
                schema.fields().len()
            )));
        }
        return Ok(Some(idx));
    }
    schema
        .index_of(expr)
        .map(Some)
        .map_err(|e| GfqError::Execution(format!("unknown aggregation input column: {e}")))
}

fn build_specs(
    schema: &SchemaRef,
    inputs: &[String],
    kinds: &[AggregateKind],
    aliases: &[String],
    mode: AggregateMode,
) -> Result<Vec<AggSpec>> {
    if inputs.len() != kinds.len() || kinds.len() != aliases.len() {
        return Err(GfqError::Execution(format!(
            "aggregation shape mismatch: {} inputs, {} kinds, {} aliases",
            inputs.len(),
            kinds.len(),
            aliases.len()
        )));
    }
    let mut specs = Vec::with_capacity(kinds.len());
    for ((expr, &kind), alias) in inputs.iter().zip(kinds.iter()).zip(aliases.iter()) {
        let input = resolve_input_index(schema, expr)?;
        let input_type = input.map(|i| schema.field(i).data_type().clone());
        let out_type = match kind {
            AggregateKind::Count => DataType::Int64,
            AggregateKind::Avg => DataType::Float64,
            AggregateKind::Sum | AggregateKind::Min | AggregateKind::Max => {
                input_type.clone().ok_or_else(|| {
                    GfqError::Execution(format!("{kind:?} requires an input column"))
                })?
            }
        };
        let avg_count_input = if kind == AggregateKind::Avg && mode == AggregateMode::Merge {
            schema.index_of(&avg_count_col_name(alias)).ok()
        } else {
            None
        };
        specs.push(AggSpec {
            kind,
            alias: alias.clone(),
            input,
            avg_count_input,
            out_type,
        });
    }
    Ok(specs)
}

fn init_state(spec: &AggSpec) -> AggState {
    match spec.kind {
        AggregateKind::Count => AggState::Count(0),
        AggregateKind::Sum => match spec.out_type {
            DataType::Int64 => AggState::SumInt(0),
            _ => AggState::SumFloat(0.0),
        },
        AggregateKind::Min => AggState::Min(None),
        AggregateKind::Max => AggState::Max(None),
        AggregateKind::Avg => AggState::Avg { sum: 0.0, count: 0 },
    }
}

fn accumulate(
    batch: &RecordBatch,
    group_indices: &[usize],
    specs: &[AggSpec],
    mode: AggregateMode,
    groups: &mut GroupMap,
) -> Result<()> {
    for &idx in group_indices {
        if idx >= batch.num_columns() {
            return Err(GfqError::Execution(format!(
                "group column index {idx} out of bounds for {} columns",
                batch.num_columns()
            )));
        }
    }

    for row in 0..batch.num_rows() {
        let key = group_indices
            .iter()
            .map(|i| scalar_from_array(batch.column(*i), row))
            .collect::<Result<Vec<_>>>()?;
        let encoded = encode_group_key(&key);
        let states = &mut groups
            .entry(encoded)
            .or_insert_with(|| GroupEntry {
                key,
                states: specs.iter().map(init_state).collect(),
            })
            .states;
        for (idx, spec) in specs.iter().enumerate() {
            let value = match spec.input {
                Some(col) => Some(scalar_from_array(batch.column(col), row)?),
                None => None,
            };
            let avg_count = match spec.avg_count_input {
                Some(col) => avg_count_at(batch, col, row)?,
                None => None,
            };
            update_state(&mut states[idx], value, mode, avg_count)?;
        }
    }
    Ok(())
}

fn avg_count_at(batch: &RecordBatch, col: usize, row: usize) -> Result<Option<i64>> {
    let a = batch
        .column(col)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| {
            GfqError::Execution("avg companion count column must be Int64".to_string())
        })?;
    if a.is_null(row) {
        Ok(Some(0))
    } else {
        Ok(Some(a.value(row)))
    }
}

fn update_state(
    state: &mut AggState,
    value: Option<ScalarValue>,
    mode: AggregateMode,
    avg_count: Option<i64>,
) -> Result<()> {
    match state {
        AggState::Count(acc) => match &value {
            None => *acc += 1,
            Some(v) if *v != ScalarValue::Null => *acc += 1,
            Some(_) => {}
        },
        AggState::SumInt(acc) => {
            if let Some(ScalarValue::Int64(v)) = value {
                *acc += v;
            }
        }
        AggState::SumFloat(acc) => {
            if let Some(v) = value.as_ref().and_then(as_f64) {
                *acc += v;
            }
        }
        AggState::Min(cur) => {
            if let Some(v) = value {
                if v != ScalarValue::Null {
                    match cur {
                        None => *cur = Some(v),
                        Some(existing) => {
                            if scalar_lt(&v, existing)? {
                                *cur = Some(v);
                            }
                        }
                    }
                }
            }
        }
        AggState::Max(cur) => {
            if let Some(v) = value {
                if v != ScalarValue::Null {
                    match cur {
                        None => *cur = Some(v),
                        Some(existing) => {
                            if scalar_gt(&v, existing)? {
                                *cur = Some(v);
                            }
                        }
                    }
                }
            }
        }
        AggState::Avg { sum, count } => match mode {
            AggregateMode::Partial => {
                if let Some(v) = value.as_ref().and_then(as_f64) {
                    *sum += v;
                    *count += 1;
                }
            }
            AggregateMode::Merge => {
                let non_null = value.as_ref().and_then(as_f64);
                if let Some(v) = non_null {
                    *sum += v;
                }
                *count += match avg_count {
                    Some(c) => c,
                    None => i64::from(non_null.is_some()),
                };
            }
        },
    }
    Ok(())
}

fn state_to_scalar(state: &AggState, mode: AggregateMode) -> ScalarValue {
    match state {
        AggState::Count(v) => ScalarValue::Int64(*v),
        AggState::SumInt(v) => ScalarValue::Int64(*v),
        AggState::SumFloat(v) => ScalarValue::Float64Bits(v.to_bits()),
        AggState::Min(Some(v)) | AggState::Max(Some(v)) => v.clone(),
        AggState::Min(None) | AggState::Max(None) => ScalarValue::Null,
        AggState::Avg { sum, count } => {
            if mode == AggregateMode::Partial {
                ScalarValue::Float64Bits(sum.to_bits())
            } else if *count == 0 {
                ScalarValue::Null
            } else {
                ScalarValue::Float64Bits((sum / (*count as f64)).to_bits())
            }
        }
    }
}

fn build_output(
    input_schema: &SchemaRef,
    group_indices: &[usize],
    specs: &[AggSpec],
    mode: AggregateMode,
    groups: GroupMap,
) -> Result<RecordBatch> {
    let mut keys: Vec<Vec<ScalarValue>> = groups.values().map(|e| e.key.clone()).collect();
    keys.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));

    let mut fields = Vec::<Field>::new();
    let mut cols = Vec::<Vec<ScalarValue>>::new();

    for (gpos, &gidx) in group_indices.iter().enumerate() {
        let field = input_schema.field(gidx);
        fields.push(Field::new(field.name(), field.data_type().clone(), true));
        let mut values = Vec::with_capacity(keys.len());
        for key in &keys {
            values.push(key[gpos].clone());
        }
        cols.push(values);
    }

    let mut avg_hidden_counts: Vec<(String, Vec<ScalarValue>)> = Vec::new();
    for (aidx, spec) in specs.iter().enumerate() {
        fields.push(Field::new(&spec.alias, spec.out_type.clone(), true));
        let mut values = Vec::with_capacity(keys.len());
        let mut hidden_counts = Vec::new();
        for key in &keys {
            let states = groups
                .get(&encode_group_key(key))
                .map(|e| &e.states)
                .ok_or_else(|| GfqError::Execution("missing aggregate state".to_string()))?;
            let state = &states[aidx];
            values.push(state_to_scalar(state, mode));
            if spec.kind == AggregateKind::Avg {
                let c = match state {
                    AggState::Avg { count, .. } => *count,
                    _ => 0,
                };
                hidden_counts.push(ScalarValue::Int64(c));
            }
        }
        cols.push(values);
        if mode == AggregateMode::Partial && spec.kind == AggregateKind::Avg {
            avg_hidden_counts.push((avg_count_col_name(&spec.alias), hidden_counts));
        }
    }

    for (name, values) in avg_hidden_counts {
        fields.push(Field::new(&name, DataType::Int64, true));
        cols.push(values);
    }

    let schema = Arc::new(Schema::new(fields));
    let arrays = cols
        .iter()
        .enumerate()
        .map(|(idx, col)| scalars_to_array(col, schema.field(idx).data_type()))
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(schema, arrays)
        .map_err(|e| GfqError::Execution(format!("aggregate output batch failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int64Array};
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    fn raw_batch(keys: &[i64], values: &[i64]) -> RecordBatch {
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

    fn int_col(batch: &RecordBatch, idx: usize) -> Vec<i64> {
        batch
            .column(idx)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int col")
            .values()
            .to_vec()
    }

    #[test]
    fn partial_grouped_sum_emits_one_row_per_key() {
        let batch = raw_batch(&[1, 1, 2], &[10, 20, 5]);
        let out = aggregate_with_groupby(
            &batch,
            &["$1".to_string()],
            &[AggregateKind::Sum],
            &["s".to_string()],
            &[0],
            AggregateMode::Partial,
        )
        .expect("aggregate");
        assert_eq!(out.num_rows(), 2);
        assert_eq!(int_col(&out, 0), vec![1, 2]);
        assert_eq!(int_col(&out, 1), vec![30, 5]);
    }

    #[test]
    fn merge_combines_partial_sums_by_column_name() {
        let partial_schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("s", DataType::Int64, true),
        ]));
        let partials = RecordBatch::try_new(
            partial_schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 1])),
                Arc::new(Int64Array::from(vec![30, 5, 12])),
            ],
        )
        .expect("partials");
        let out = aggregate_with_groupby(
            &partials,
            &["s".to_string()],
            &[AggregateKind::Sum],
            &["s".to_string()],
            &[0],
            AggregateMode::Merge,
        )
        .expect("merge");
        assert_eq!(out.num_rows(), 2);
        assert_eq!(int_col(&out, 0), vec![1, 2]);
        assert_eq!(int_col(&out, 1), vec![42, 5]);
    }

    #[test]
    fn groupless_count_star_counts_every_row() {
        let batch = raw_batch(&[1, 2, 3], &[0, 0, 0]);
        let out = aggregate_without_groupby(
            &batch,
            &[String::new()],
            &[AggregateKind::Count],
            &["cnt".to_string()],
            AggregateMode::Partial,
        )
        .expect("count");
        assert_eq!(out.num_rows(), 1);
        assert_eq!(int_col(&out, 0), vec![3]);
    }

    #[test]
    fn groupless_zero_row_batch_still_emits_one_row() {
        let batch = raw_batch(&[], &[]);
        let out = aggregate_without_groupby(
            &batch,
            &[String::new()],
            &[AggregateKind::Count],
            &["cnt".to_string()],
            AggregateMode::Partial,
        )
        .expect("count");
        assert_eq!(out.num_rows(), 1);
        assert_eq!(int_col(&out, 0), vec![0]);
    }

    #[test]
    fn avg_round_trips_through_partial_and_merge() {
        let batch = raw_batch(&[1, 1, 1], &[2, 4, 12]);
        let partial = aggregate_with_groupby(
            &batch,
            &["$1".to_string()],
            &[AggregateKind::Avg],
            &["a".to_string()],
            &[0],
            AggregateMode::Partial,
        )
        .expect("partial");
        assert_eq!(
            partial.schema().field(2).name(),
            &avg_count_col_name("a")
        );

        let merged = aggregate_with_groupby(
            &partial,
            &["a".to_string()],
            &[AggregateKind::Avg],
            &["a".to_string()],
            &[0],
            AggregateMode::Merge,
        )
        .expect("merge");
        let avg = merged
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .expect("avg col");
        assert_eq!(avg.value(0), 6.0);
    }

    #[test]
    fn distinct_projection_deduplicates_group_keys() {
        let batch = raw_batch(&[1, 1, 2, 2, 2], &[0, 0, 0, 0, 0]);
        let out = groupby_without_aggregations(&batch, &[0]).expect("distinct");
        assert_eq!(out.num_rows(), 2);
        assert_eq!(int_col(&out, 0), vec![1, 2]);
    }
}
