//! Parsing of aggregation plan expressions.
//!
//! The engine receives each aggregation operator as a plan string of the
//! shape `LogicalAggregate(group=[{0, 1}], total=[SUM($2)], cnt=[COUNT()])`:
//! a set of group column indices followed by `alias=[KIND(input)]` pairs
//! where the input is a `$N` column reference or empty for COUNT(*).

use gfq_common::{GfqError, Result};
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateKind;

/// Parsed shape of one aggregation operator, immutable for a kernel's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupByParams {
    /// Group column indices into the input schema, in declaration order.
    pub group_indices: Vec<usize>,
    /// Aggregate input expressions: `$N` refs, column names, or empty for COUNT(*).
    pub inputs: Vec<String>,
    /// Aggregate function per output column.
    pub kinds: Vec<AggregateKind>,
    /// Output column aliases, index-aligned with `kinds`.
    pub aliases: Vec<String>,
}

impl GroupByParams {
    /// True when the expression is a plain distinct projection.
    pub fn is_distinct_only(&self) -> bool {
        self.kinds.is_empty()
    }

    /// True when the aggregation has no group columns (single global result).
    pub fn is_groupless(&self) -> bool {
        self.group_indices.is_empty()
    }
}

/// Parse a `LogicalAggregate(...)` plan string into [`GroupByParams`].
pub fn parse_group_by_expression(expr: &str) -> Result<GroupByParams> {
    let trimmed = expr.trim();
    let open = trimmed
        .find('(')
        .ok_or_else(|| GfqError::Expression(format!("missing '(' in '{trimmed}'")))?;
    let close = trimmed
        .rfind(')')
        .filter(|&c| c > open)
        .ok_or_else(|| GfqError::Expression(format!("missing ')' in '{trimmed}'")))?;
    let inner = &trimmed[open + 1..close];

    let group_open = inner
        .find("group=[{")
        .ok_or_else(|| GfqError::Expression(format!("missing group clause in '{trimmed}'")))?;
    let group_body_start = group_open + "group=[{".len();
    let group_close = inner[group_body_start..]
        .find("}]")
        .map(|off| group_body_start + off)
        .ok_or_else(|| GfqError::Expression(format!("unterminated group clause in '{trimmed}'")))?;

    let group_indices = inner[group_body_start..group_close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| GfqError::Expression(format!("invalid group index '{s}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut inputs = Vec::new();
    let mut kinds = Vec::new();
    let mut aliases = Vec::new();

    let mut rest = inner[group_close + 2..].trim_start_matches(|c| c == ',' || c == ' ');
    while !rest.is_empty() {
        let eq = rest
            .find("=[")
            .ok_or_else(|| GfqError::Expression(format!("malformed aggregate clause '{rest}'")))?;
        let alias = rest[..eq].trim().to_string();
        let body_start = eq + 2;
        let body_end = rest[body_start..]
            .find(']')
            .map(|off| body_start + off)
            .ok_or_else(|| {
                GfqError::Expression(format!("unterminated aggregate clause '{rest}'"))
            })?;
        let body = &rest[body_start..body_end];

        let (kind, input) = parse_aggregate_call(body)?;
        aliases.push(alias);
        kinds.push(kind);
        inputs.push(input);

        rest = rest[body_end + 1..].trim_start_matches(|c| c == ',' || c == ' ');
    }

    Ok(GroupByParams {
        group_indices,
        inputs,
        kinds,
        aliases,
    })
}

fn parse_aggregate_call(body: &str) -> Result<(AggregateKind, String)> {
    let open = body
        .find('(')
        .ok_or_else(|| GfqError::Expression(format!("malformed aggregate call '{body}'")))?;
    let close = body
        .rfind(')')
        .filter(|&c| c > open)
        .ok_or_else(|| GfqError::Expression(format!("malformed aggregate call '{body}'")))?;
    let name = body[..open].trim();
    let arg = body[open + 1..close].trim();

    let kind = match name {
        "SUM" => AggregateKind::Sum,
        "COUNT" => AggregateKind::Count,
        "MIN" => AggregateKind::Min,
        "MAX" => AggregateKind::Max,
        "AVG" => AggregateKind::Avg,
        other => {
            return Err(GfqError::Unsupported(format!(
                "aggregate function '{other}' is not supported"
            )));
        }
    };
    if arg.starts_with("DISTINCT") {
        return Err(GfqError::Unsupported(
            "DISTINCT aggregate inputs are not supported".to_string(),
        ));
    }
    if kind != AggregateKind::Count && arg.is_empty() {
        return Err(GfqError::Expression(format!(
            "{name} requires an input column"
        )));
    }
    Ok((kind, arg.to_string()))
}

/// Rewrite parsed parameters so they apply to a batch that is already a
/// partial aggregate (group columns first, aggregate columns after).
///
/// Group columns remap positionally onto the merged schema; aggregate inputs
/// and aliases become the already-aggregated column names; COUNT-of-COUNTs
/// becomes SUM because the inputs already hold per-subset counts.
pub fn group_by_parameters_for_merge(
    params: &GroupByParams,
    merged_names: &[String],
) -> Result<GroupByParams> {
    let group_len = params.group_indices.len();
    if merged_names.len() < group_len + params.kinds.len() {
        return Err(GfqError::Execution(format!(
            "merged schema has {} columns but the aggregation needs {}",
            merged_names.len(),
            group_len + params.kinds.len()
        )));
    }

    let group_indices = (0..group_len).collect();
    let mut inputs = Vec::with_capacity(params.kinds.len());
    let mut kinds = Vec::with_capacity(params.kinds.len());
    let mut aliases = Vec::with_capacity(params.kinds.len());
    for (idx, &kind) in params.kinds.iter().enumerate() {
        let name = merged_names[group_len + idx].clone();
        inputs.push(name.clone());
        aliases.push(name);
        kinds.push(match kind {
            AggregateKind::Count => AggregateKind::Sum,
            other => other,
        });
    }

    Ok(GroupByParams {
        group_indices,
        inputs,
        kinds,
        aliases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grouped_aggregates() {
        let params = parse_group_by_expression(
            "LogicalAggregate(group=[{0, 1}], total=[SUM($2)], cnt=[COUNT($2)], a=[AVG($3)])",
        )
        .expect("parse");
        assert_eq!(params.group_indices, vec![0, 1]);
        assert_eq!(params.inputs, vec!["$2", "$2", "$3"]);
        assert_eq!(
            params.kinds,
            vec![AggregateKind::Sum, AggregateKind::Count, AggregateKind::Avg]
        );
        assert_eq!(params.aliases, vec!["total", "cnt", "a"]);
    }

    #[test]
    fn parses_groupless_count_star() {
        let params =
            parse_group_by_expression("LogicalAggregate(group=[{}], cnt=[COUNT()])").expect("parse");
        assert!(params.is_groupless());
        assert_eq!(params.inputs, vec![""]);
        assert_eq!(params.kinds, vec![AggregateKind::Count]);
    }

    #[test]
    fn parses_distinct_only_projection() {
        let params =
            parse_group_by_expression("LogicalAggregate(group=[{0, 2}])").expect("parse");
        assert!(params.is_distinct_only());
        assert_eq!(params.group_indices, vec![0, 2]);
    }

    #[test]
    fn rejects_unknown_aggregate_functions() {
        let err = parse_group_by_expression("LogicalAggregate(group=[{0}], m=[MEDIAN($1)])")
            .expect_err("must fail");
        assert!(matches!(err, GfqError::Unsupported(_)));
    }

    #[test]
    fn merge_parameters_remap_names_and_turn_count_into_sum() {
        let params = parse_group_by_expression(
            "LogicalAggregate(group=[{1}], s=[SUM($0)], cnt=[COUNT()])",
        )
        .expect("parse");
        let merged_names = vec!["k".to_string(), "s".to_string(), "cnt".to_string()];
        let merge = group_by_parameters_for_merge(&params, &merged_names).expect("merge params");
        assert_eq!(merge.group_indices, vec![0]);
        assert_eq!(merge.inputs, vec!["s", "cnt"]);
        assert_eq!(merge.kinds, vec![AggregateKind::Sum, AggregateKind::Sum]);
        assert_eq!(merge.aliases, vec!["s", "cnt"]);
    }
}
