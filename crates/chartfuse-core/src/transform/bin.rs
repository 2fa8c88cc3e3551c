//! Bin boundaries and the row expressions that assign rows to bins.

use chartfuse_data::value::integral_number;
use chartfuse_data::{BinaryOp, QueryOp, ScalarExpr, ScalarFn};
use serde_json::{json, Value};

use crate::error::{ChartError, Result};

/// Added before flooring so values sitting on a boundary land in the upper bin.
const EPSILON: f64 = 1e-14;

#[derive(Debug, Clone, PartialEq)]
pub struct BinOptions {
    pub maxbins: f64,
    pub base: f64,
    pub divide: Vec<f64>,
    pub minstep: f64,
    pub step: Option<f64>,
    pub nice: bool,
}

impl Default for BinOptions {
    fn default() -> Self {
        Self {
            maxbins: 20.0,
            base: 10.0,
            divide: vec![5.0, 2.0],
            minstep: 0.0,
            step: None,
            nice: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bins {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl Bins {
    /// Choose a step that is a power of `base` (optionally divided) giving at
    /// most `maxbins` bins, then snap the extent outward to whole steps.
    pub fn compute(extent: [f64; 2], opts: &BinOptions) -> Result<Self> {
        let [mut min, mut max] = extent;
        if !min.is_finite() || !max.is_finite() {
            return Err(ChartError::expression("bin extent must be two finite numbers"));
        }
        if !opts.maxbins.is_finite() || opts.maxbins <= 0.0 {
            return Err(ChartError::expression(format!(
                "bin maxbins must be a positive number, got {}",
                opts.maxbins
            )));
        }
        if !opts.base.is_finite() || opts.base <= 1.0 {
            return Err(ChartError::expression(format!(
                "bin base must be a number greater than 1, got {}",
                opts.base
            )));
        }
        if !opts.minstep.is_finite() || opts.divide.iter().any(|d| !d.is_finite() || *d <= 0.0) {
            return Err(ChartError::expression(
                "bin minstep must be finite and divide entries positive",
            ));
        }
        let logb = opts.base.ln();
        let span = match max - min {
            s if s != 0.0 => s,
            _ if min != 0.0 => min.abs(),
            _ => 1.0,
        };

        let step = match opts.step {
            Some(step) if step > 0.0 && step.is_finite() => step,
            Some(_) => return Err(ChartError::expression("bin step must be positive")),
            None => {
                let level = (opts.maxbins.ln() / logb).ceil();
                let mut step = opts
                    .minstep
                    .max(opts.base.powf((span.ln() / logb).round() - level));
                if !step.is_finite() || step <= 0.0 {
                    return Err(ChartError::expression(
                        "bin step could not be derived from the extent",
                    ));
                }
                while (span / step).ceil() > opts.maxbins {
                    step *= opts.base;
                }
                for div in &opts.divide {
                    let v = step / div;
                    if v >= opts.minstep && span / v <= opts.maxbins {
                        step = v;
                    }
                }
                step
            }
        };

        let v = step.ln();
        let precision = if v >= 0.0 { 0.0 } else { (-v / logb).trunc() + 1.0 };
        let eps = opts.base.powf(-precision - 1.0);
        if opts.nice {
            let v = (min / step + eps).floor() * step;
            min = if min < v { v - step } else { v };
            max = (max / step).ceil() * step;
        }
        Ok(Self {
            start: min,
            stop: if max == min { min + step } else { max },
            step,
        })
    }

    /// Value published on the transform's `signal`.
    pub fn signal_value(&self, field: &str) -> Value {
        json!({
            "fields": [field],
            "fname": format!("bin_{field}"),
            "start": integral_number(self.start),
            "stop": integral_number(self.stop),
            "step": integral_number(self.step),
        })
    }

    /// Formula ops writing the bin start (and end, for intervals).
    ///
    /// Values outside `[start, stop]` and non-numeric values bin to null.
    pub fn formulas(&self, field: &str, bin0: &str, bin1: Option<&str>) -> Vec<QueryOp> {
        let lit = |x: f64| ScalarExpr::Literal(integral_number(x));
        let v = ScalarExpr::column(field);
        let clamped = ScalarExpr::Call {
            func: ScalarFn::Max,
            args: vec![
                lit(self.start),
                ScalarExpr::Call {
                    func: ScalarFn::Min,
                    args: vec![v.clone(), lit(self.stop - self.step)],
                },
            ],
        };
        let index = ScalarExpr::Call {
            func: ScalarFn::Floor,
            args: vec![ScalarExpr::binary(
                BinaryOp::Add,
                ScalarExpr::Literal(json!(EPSILON)),
                ScalarExpr::binary(
                    BinaryOp::Div,
                    ScalarExpr::binary(BinaryOp::Sub, clamped, lit(self.start)),
                    lit(self.step),
                ),
            )],
        };
        let in_range = ScalarExpr::binary(
            BinaryOp::Add,
            lit(self.start),
            ScalarExpr::binary(BinaryOp::Mul, lit(self.step), index),
        );
        let expr = ScalarExpr::Conditional {
            test: Box::new(ScalarExpr::binary(BinaryOp::Lt, v.clone(), lit(self.start))),
            consequent: Box::new(ScalarExpr::Literal(Value::Null)),
            alternate: Box::new(ScalarExpr::Conditional {
                test: Box::new(ScalarExpr::binary(BinaryOp::Gt, v, lit(self.stop))),
                consequent: Box::new(ScalarExpr::Literal(Value::Null)),
                alternate: Box::new(in_range),
            }),
        };

        let mut ops = vec![QueryOp::Formula {
            expr,
            alias: bin0.to_string(),
        }];
        if let Some(bin1) = bin1 {
            ops.push(QueryOp::Formula {
                expr: ScalarExpr::binary(
                    BinaryOp::Add,
                    ScalarExpr::column(bin0),
                    lit(self.step),
                ),
                alias: bin1.to_string(),
            });
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartfuse_data::{exec, Table};

    fn bins(extent: [f64; 2], maxbins: f64) -> Bins {
        Bins::compute(
            extent,
            &BinOptions {
                maxbins,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn nice_steps() {
        assert_eq!(
            bins([0.0, 100.0], 20.0),
            Bins { start: 0.0, stop: 100.0, step: 5.0 }
        );
        assert_eq!(
            bins([1.4, 9.2], 10.0),
            Bins { start: 1.0, stop: 10.0, step: 1.0 }
        );
        assert_eq!(
            bins([0.0, 10.0], 10.0),
            Bins { start: 0.0, stop: 10.0, step: 1.0 }
        );
    }

    #[test]
    fn degenerate_extent_still_has_one_bin() {
        let b = bins([5.0, 5.0], 10.0);
        assert!(b.stop > b.start);
    }

    #[test]
    fn explicit_step_wins() {
        let b = Bins::compute(
            [0.0, 9.0],
            &BinOptions {
                step: Some(3.0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(b, Bins { start: 0.0, stop: 9.0, step: 3.0 });
        assert!(Bins::compute([f64::NAN, 1.0], &BinOptions::default()).is_err());
    }

    #[test]
    fn invalid_maxbins_or_base_is_an_error() {
        let with = |maxbins: f64, base: f64| {
            Bins::compute(
                [0.0, 100.0],
                &BinOptions {
                    maxbins,
                    base,
                    ..Default::default()
                },
            )
        };
        let invalid = [
            (-1.0, 10.0),
            (0.0, 10.0),
            (f64::NAN, 10.0),
            (20.0, -2.0),
            (20.0, 1.0),
            (20.0, f64::INFINITY),
        ];
        for (maxbins, base) in invalid {
            let err = with(maxbins, base).unwrap_err();
            assert!(matches!(err, ChartError::Expression(_)), "{maxbins} {base}: {err}");
        }
        assert!(with(20.0, 2.0).is_ok());
    }

    #[test]
    fn formulas_assign_rows_to_bins() {
        let b = Bins { start: 0.0, stop: 10.0, step: 5.0 };
        let table = Table::from_json(&serde_json::json!([
            {"x": 0}, {"x": 4.9}, {"x": 5}, {"x": 10}, {"x": 11}, {"x": null}
        ]))
        .unwrap();
        let out = exec::execute(&table, &b.formulas("x", "bin0", Some("bin1"))).unwrap();
        let bin0: Vec<Value> = out.column("bin0").cloned().collect();
        assert_eq!(
            bin0,
            vec![json!(0), json!(0), json!(5), json!(5), Value::Null, Value::Null]
        );
        assert_eq!(out.rows()[2]["bin1"], json!(10));
    }
}
