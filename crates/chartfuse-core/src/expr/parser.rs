//! Precedence-climbing parser for the chart expression language.

use chartfuse_data::{BinaryOp, UnaryOp};
use serde_json::Value;

use super::ast::Expr;
use super::lexer::{tokenize, Token};
use crate::error::{ChartError, Result};

pub fn parse(src: &str) -> Result<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
    };
    let expr = parser.expression()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

fn binary_precedence(punct: &str) -> Option<(u8, BinaryOp)> {
    Some(match punct {
        "||" => (1, BinaryOp::Or),
        "&&" => (2, BinaryOp::And),
        "==" | "===" => (3, BinaryOp::Eq),
        "!=" | "!==" => (3, BinaryOp::NotEq),
        "<" => (4, BinaryOp::Lt),
        "<=" => (4, BinaryOp::LtEq),
        ">" => (4, BinaryOp::Gt),
        ">=" => (4, BinaryOp::GtEq),
        "+" => (5, BinaryOp::Add),
        "-" => (5, BinaryOp::Sub),
        "*" => (6, BinaryOp::Mul),
        "/" => (6, BinaryOp::Div),
        "%" => (6, BinaryOp::Mod),
        _ => return None,
    })
}

impl<'a> Parser<'a> {
    fn error(&self, msg: &str) -> ChartError {
        ChartError::expression(format!("{msg} at token {} in '{}'", self.pos, self.src))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(q)) if *q == p)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, p: &str) -> Result<()> {
        if self.peek_punct(p) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{p}'")))
        }
    }

    fn expression(&mut self) -> Result<Expr> {
        let test = self.binary(1)?;
        if self.peek_punct("?") {
            self.pos += 1;
            let consequent = self.expression()?;
            self.expect(":")?;
            let alternate = self.expression()?;
            return Ok(Expr::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            });
        }
        Ok(test)
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let Some(Token::Punct(p)) = self.peek() else {
                break;
            };
            let Some((prec, op)) = binary_precedence(p) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let right = self.binary(prec + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Some(Token::Punct("!")) => UnaryOp::Not,
            Some(Token::Punct("-")) => UnaryOp::Neg,
            Some(Token::Punct("+")) => UnaryOp::Plus,
            _ => return self.postfix(),
        };
        self.pos += 1;
        let arg = self.unary()?;
        Ok(Expr::Unary {
            op,
            arg: Box::new(arg),
        })
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.peek_punct(".") {
                self.pos += 1;
                match self.next() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Member {
                            object: Box::new(expr),
                            property: Box::new(Expr::Literal(Value::String(name))),
                        }
                    }
                    _ => return Err(self.error("expected property name")),
                }
            } else if self.peek_punct("[") {
                self.pos += 1;
                let property = self.expression()?;
                self.expect("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: Box::new(property),
                };
            } else if self.peek_punct("(") {
                let Expr::Identifier(callee) = expr else {
                    return Err(self.error("only named functions can be called"));
                };
                self.pos += 1;
                let args = self.list(")")?;
                expr = Expr::Call { callee, args };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn list(&mut self, close: &str) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        if self.peek_punct(close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            if self.peek_punct(",") {
                self.pos += 1;
            } else {
                self.expect(close)?;
                return Ok(items);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(n)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Identifier(name),
            }),
            Some(Token::Punct("(")) => {
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => Ok(Expr::Array(self.list("]")?)),
            Some(Token::Punct("{")) => {
                let mut props = Vec::new();
                if self.peek_punct("}") {
                    self.pos += 1;
                    return Ok(Expr::Object(props));
                }
                loop {
                    let key = match self.next() {
                        Some(Token::Ident(k)) | Some(Token::Str(k)) => k,
                        _ => return Err(self.error("expected object key")),
                    };
                    self.expect(":")?;
                    props.push((key, self.expression()?));
                    if self.peek_punct(",") {
                        self.pos += 1;
                    } else {
                        self.expect("}")?;
                        return Ok(Expr::Object(props));
                    }
                }
            }
            _ => {
                self.pos -= 1;
                Err(self.error("unexpected token"))
            }
        }
    }
}
