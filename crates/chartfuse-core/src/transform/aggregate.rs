use chartfuse_data::{Aggregate, AggregateOp};

/// Whether `fields`/`ops`/`as` line up the way the client runtime accepts.
pub(super) fn is_well_formed(
    fields: &[Option<String>],
    ops: &[AggregateOp],
    as_: &[Option<String>],
) -> bool {
    if ops.is_empty() {
        return fields.is_empty() && as_.len() <= 1;
    }
    if fields.len() > ops.len() || as_.len() > ops.len() {
        return false;
    }
    ops.iter().enumerate().all(|(i, op)| {
        *op == AggregateOp::Count || fields.get(i).is_some_and(Option::is_some)
    })
}

/// Output columns, named `as[i]`, else `op` for field-less ops, else `op_field`.
pub(super) fn aggregates(
    fields: &[Option<String>],
    ops: &[AggregateOp],
    as_: &[Option<String>],
) -> Vec<Aggregate> {
    if ops.is_empty() {
        let alias = as_
            .first()
            .cloned()
            .flatten()
            .unwrap_or_else(|| AggregateOp::Count.name().to_string());
        return vec![Aggregate {
            op: AggregateOp::Count,
            field: None,
            alias,
        }];
    }
    ops.iter()
        .enumerate()
        .map(|(i, op)| {
            let field = fields.get(i).cloned().flatten();
            let alias = as_
                .get(i)
                .cloned()
                .flatten()
                .unwrap_or_else(|| match &field {
                    Some(f) => format!("{}_{}", op.name(), f),
                    None => op.name().to_string(),
                });
            Aggregate {
                op: *op,
                field,
                alias,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_a_single_count() {
        let aggs = aggregates(&[], &[], &[]);
        assert_eq!(aggs.len(), 1);
        assert_eq!(aggs[0].alias, "count");
        assert_eq!(aggs[0].op, AggregateOp::Count);
    }

    #[test]
    fn names_follow_op_and_field() {
        let aggs = aggregates(
            &[Some("price".into()), None, Some("price".into())],
            &[AggregateOp::Mean, AggregateOp::Count, AggregateOp::Max],
            &[None, None, Some("top".into())],
        );
        let names: Vec<_> = aggs.iter().map(|a| a.alias.as_str()).collect();
        assert_eq!(names, vec!["mean_price", "count", "top"]);
    }

    #[test]
    fn field_less_ops_other_than_count_are_rejected() {
        assert!(is_well_formed(&[None], &[AggregateOp::Count], &[]));
        assert!(!is_well_formed(&[None], &[AggregateOp::Sum], &[]));
        assert!(!is_well_formed(
            &[Some("a".into()), Some("b".into())],
            &[AggregateOp::Sum],
            &[]
        ));
    }
}
