use chartfuse_data::{BinaryOp, UnaryOp};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Identifier(String),
    Member {
        object: Box<Expr>,
        property: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

impl Expr {
    /// Visit this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Identifier(_) => {}
            Expr::Member { object, property } => {
                object.walk(f);
                property.walk(f);
            }
            Expr::Unary { arg, .. } => arg.walk(f),
            Expr::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                test.walk(f);
                consequent.walk(f);
                alternate.walk(f);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.walk(f)),
            Expr::Array(items) => items.iter().for_each(|a| a.walk(f)),
            Expr::Object(props) => props.iter().for_each(|(_, v)| v.walk(f)),
        }
    }

    /// Field name for `datum.field` / `datum['field']`.
    pub fn as_datum_field(&self) -> Option<&str> {
        match self {
            Expr::Member { object, property } => match (object.as_ref(), property.as_ref()) {
                (Expr::Identifier(obj), Expr::Literal(Value::String(field))) if obj == "datum" => {
                    Some(field)
                }
                _ => None,
            },
            _ => None,
        }
    }
}
