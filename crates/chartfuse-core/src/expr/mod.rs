//! The chart expression language.
//!
//! Only the subset the server can evaluate is understood here. Expressions
//! that use anything else (event handlers, scale lookups, selection helpers)
//! still parse, report their input variables, and are classified as
//! unsupported so the planner keeps them on the client.

mod ast;
mod lexer;
mod parser;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chartfuse_data::{ScalarExpr, ScalarFn, Table};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

pub use ast::Expr;

use crate::error::{ChartError, Result};
use crate::graph::Variable;

/// Identifiers that are never signal references.
const IMPLICIT_VARS: &[&str] = &["datum", "event", "item", "parent"];

const CONSTANTS: &[(&str, f64)] = &[
    ("PI", std::f64::consts::PI),
    ("E", std::f64::consts::E),
    ("LN2", std::f64::consts::LN_2),
    ("LN10", std::f64::consts::LN_10),
    ("SQRT2", std::f64::consts::SQRT_2),
];

/// Functions whose first argument names a dataset.
const DATA_FNS: &[&str] = &[
    "data",
    "indata",
    "vlSelectionTest",
    "vlSelectionResolve",
    "vlSelectionIdTest",
];

/// Map a callee to its scalar function and whether it reads in UTC.
fn scalar_fn(callee: &str) -> Option<(ScalarFn, bool)> {
    use ScalarFn::*;
    let local = match callee {
        "isValid" => IsValid,
        "isFinite" => IsFinite,
        "isNaN" => IsNaN,
        "abs" => Abs,
        "ceil" => Ceil,
        "floor" => Floor,
        "round" => Round,
        "sqrt" => Sqrt,
        "log" => Log,
        "exp" => Exp,
        "pow" => Pow,
        "min" => Min,
        "max" => Max,
        "length" => Length,
        "lower" => Lower,
        "upper" => Upper,
        "toDate" => ToDate,
        "year" => Year,
        "month" => Month,
        "date" => Date,
        "day" => Day,
        "hours" => Hours,
        "minutes" => Minutes,
        "seconds" => Seconds,
        other => {
            let utc = other.strip_prefix("utc")?;
            let (f, _) = scalar_fn(utc)?;
            return f.is_date_part().then_some((f, true));
        }
    };
    Some((local, false))
}

/// Values an expression may read while being compiled.
#[derive(Debug, Clone, Copy)]
pub struct ExprEnv<'a> {
    pub signals: &'a HashMap<String, Value>,
    pub datasets: &'a HashMap<String, Table>,
    pub local_tz: &'a str,
    pub default_input_tz: &'a str,
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        Ok(Self {
            source: source.to_string(),
            ast: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Signals and datasets this expression reads, sorted and deduplicated.
    pub fn input_vars(&self) -> Vec<Variable> {
        let mut vars = BTreeSet::new();
        collect_input_vars(&self.ast, &mut vars);
        vars.into_iter().collect()
    }

    /// Whether the server can evaluate this expression.
    pub fn is_supported(&self) -> bool {
        is_supported(&self.ast)
    }

    /// Whether the expression reads row fields (`datum`).
    pub fn uses_datum(&self) -> bool {
        let mut found = false;
        self.ast.walk(&mut |e| {
            if matches!(e, Expr::Identifier(name) if name == "datum") {
                found = true;
            }
        });
        found
    }

    /// Compile to a row expression, substituting signal values and folding
    /// constant sub-expressions.
    pub fn compile(&self, env: &ExprEnv<'_>) -> Result<ScalarExpr> {
        compile(&self.ast, env)
    }

    /// Evaluate an expression that does not depend on row fields.
    pub fn eval(&self, env: &ExprEnv<'_>) -> Result<Value> {
        match self.compile(env)? {
            ScalarExpr::Literal(v) => Ok(v),
            _ => Err(ChartError::expression(format!(
                "'{}' depends on row fields and cannot be evaluated as a signal",
                self.source
            ))),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

fn collect_input_vars(expr: &Expr, vars: &mut BTreeSet<Variable>) {
    match expr {
        Expr::Identifier(name) => {
            let implicit = IMPLICIT_VARS.contains(&name.as_str())
                || CONSTANTS.iter().any(|(c, _)| c == name);
            if !implicit {
                vars.insert(Variable::signal(name.clone()));
            }
        }
        Expr::Member { object, property } => {
            collect_input_vars(object, vars);
            // `a.b` stores `b` as a literal; only computed keys can read signals
            collect_input_vars(property, vars);
        }
        Expr::Call { callee, args } => {
            if DATA_FNS.contains(&callee.as_str()) {
                if let Some(Expr::Literal(Value::String(name))) = args.first() {
                    vars.insert(Variable::data(name.clone()));
                }
                args.iter()
                    .skip(1)
                    .for_each(|a| collect_input_vars(a, vars));
            } else {
                args.iter().for_each(|a| collect_input_vars(a, vars));
            }
        }
        Expr::Literal(_) => {}
        Expr::Unary { arg, .. } => collect_input_vars(arg, vars),
        Expr::Binary { left, right, .. } => {
            collect_input_vars(left, vars);
            collect_input_vars(right, vars);
        }
        Expr::Conditional {
            test,
            consequent,
            alternate,
        } => {
            collect_input_vars(test, vars);
            collect_input_vars(consequent, vars);
            collect_input_vars(alternate, vars);
        }
        Expr::Array(items) => items.iter().for_each(|a| collect_input_vars(a, vars)),
        Expr::Object(props) => props.iter().for_each(|(_, v)| collect_input_vars(v, vars)),
    }
}

fn is_supported(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(_) => true,
        Expr::Identifier(name) => !IMPLICIT_VARS.contains(&name.as_str()),
        Expr::Member { object, property } => {
            if expr.as_datum_field().is_some() {
                return true;
            }
            // nested row access is not row-representable
            if object.as_datum_field().is_some()
                || matches!(object.as_ref(), Expr::Identifier(n) if n == "datum")
            {
                return false;
            }
            is_supported(object) && is_supported(property)
        }
        Expr::Call { callee, args } => {
            let known = match callee.as_str() {
                "if" => args.len() == 3,
                "data" => matches!(args.as_slice(), [Expr::Literal(Value::String(_))]),
                other => scalar_fn(other).is_some(),
            };
            known && args.iter().all(is_supported)
        }
        Expr::Unary { arg, .. } => is_supported(arg),
        Expr::Binary { left, right, .. } => is_supported(left) && is_supported(right),
        Expr::Conditional {
            test,
            consequent,
            alternate,
        } => is_supported(test) && is_supported(consequent) && is_supported(alternate),
        Expr::Array(items) => items.iter().all(is_supported),
        Expr::Object(props) => props.iter().all(|(_, v)| is_supported(v)),
    }
}

fn literal(expr: &ScalarExpr) -> Option<&Value> {
    match expr {
        ScalarExpr::Literal(v) => Some(v),
        _ => None,
    }
}

/// Evaluate eagerly when every operand is constant.
fn fold(expr: ScalarExpr) -> ScalarExpr {
    if expr.columns().is_empty() {
        ScalarExpr::Literal(expr.eval(&Map::new()))
    } else {
        expr
    }
}

fn compile(expr: &Expr, env: &ExprEnv<'_>) -> Result<ScalarExpr> {
    Ok(match expr {
        Expr::Literal(v) => ScalarExpr::Literal(v.clone()),
        Expr::Identifier(name) => {
            if let Some((_, value)) = CONSTANTS.iter().find(|(c, _)| c == name) {
                return Ok(ScalarExpr::Literal(chartfuse_data::value::number(*value)));
            }
            if IMPLICIT_VARS.contains(&name.as_str()) {
                return Err(ChartError::expression(format!(
                    "'{name}' cannot be used on its own"
                )));
            }
            let value = env
                .signals
                .get(name)
                .ok_or_else(|| ChartError::expression(format!("unknown signal '{name}'")))?;
            ScalarExpr::Literal(value.clone())
        }
        Expr::Member { object, property } => {
            if let Some(field) = expr.as_datum_field() {
                return Ok(ScalarExpr::Column(field.to_string()));
            }
            let object = compile(object, env)?;
            let property = compile(property, env)?;
            match (literal(&object), literal(&property)) {
                (Some(obj), Some(key)) => ScalarExpr::Literal(member(obj, key)),
                _ => {
                    return Err(ChartError::expression(
                        "member access is only supported on constants and datum fields",
                    ))
                }
            }
        }
        Expr::Unary { op, arg } => fold(ScalarExpr::Unary {
            op: *op,
            expr: Box::new(compile(arg, env)?),
        }),
        Expr::Binary { op, left, right } => fold(ScalarExpr::binary(
            *op,
            compile(left, env)?,
            compile(right, env)?,
        )),
        Expr::Conditional {
            test,
            consequent,
            alternate,
        } => fold(ScalarExpr::Conditional {
            test: Box::new(compile(test, env)?),
            consequent: Box::new(compile(consequent, env)?),
            alternate: Box::new(compile(alternate, env)?),
        }),
        Expr::Call { callee, args } => compile_call(callee, args, env)?,
        Expr::Array(items) => {
            let items = items
                .iter()
                .map(|i| compile(i, env))
                .collect::<Result<Vec<_>>>()?;
            let values: Option<Vec<Value>> = items.iter().map(|i| literal(i).cloned()).collect();
            match values {
                Some(values) => ScalarExpr::Literal(Value::Array(values)),
                None => {
                    return Err(ChartError::expression(
                        "array literals may not contain row fields",
                    ))
                }
            }
        }
        Expr::Object(props) => {
            let mut out = Map::new();
            for (key, value) in props {
                match compile(value, env)? {
                    ScalarExpr::Literal(v) => {
                        out.insert(key.clone(), v);
                    }
                    _ => {
                        return Err(ChartError::expression(
                            "object literals may not contain row fields",
                        ))
                    }
                }
            }
            ScalarExpr::Literal(Value::Object(out))
        }
    })
}

fn member(object: &Value, key: &Value) -> Value {
    match (object, key) {
        (Value::Array(items), Value::String(k)) if k == "length" => Value::from(items.len() as i64),
        (Value::String(s), Value::String(k)) if k == "length" => {
            Value::from(s.chars().count() as i64)
        }
        (Value::Array(items), k) => k
            .as_f64()
            .filter(|i| *i >= 0.0 && i.fract() == 0.0)
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn compile_call(callee: &str, args: &[Expr], env: &ExprEnv<'_>) -> Result<ScalarExpr> {
    if callee == "data" {
        let Some(Expr::Literal(Value::String(name))) = args.first() else {
            return Err(ChartError::expression("data() requires a dataset name"));
        };
        let table = env
            .datasets
            .get(name)
            .ok_or_else(|| ChartError::expression(format!("unknown dataset '{name}'")))?;
        return Ok(ScalarExpr::Literal(table.to_json()));
    }
    let compiled = args
        .iter()
        .map(|a| compile(a, env))
        .collect::<Result<Vec<_>>>()?;
    if callee == "if" {
        let [test, consequent, alternate]: [ScalarExpr; 3] = compiled
            .try_into()
            .map_err(|_| ChartError::expression("if() takes three arguments"))?;
        return Ok(fold(ScalarExpr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        }));
    }
    let (func, utc) = scalar_fn(callee)
        .ok_or_else(|| ChartError::expression(format!("unsupported function '{callee}'")))?;
    let mut args = compiled;
    if func.is_date_part() {
        let tz = if utc { "UTC" } else { env.local_tz };
        args.truncate(1);
        args.push(ScalarExpr::Literal(Value::String(tz.to_string())));
    } else if func == ScalarFn::ToDate {
        args.truncate(1);
        args.push(ScalarExpr::Literal(Value::String(
            env.default_input_tz.to_string(),
        )));
    }
    Ok(fold(ScalarExpr::Call { func, args }))
}
