use serde_json::Value;

use crate::error::{ChartError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(Value),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

// longest first so that `===` wins over `==` and `=`
const PUNCTUATION: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "(", ")", "[", "]", "{", "}", ",", ".",
    "?", ":", "!", "+", "-", "*", "/", "%", "<", ">",
];

pub fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            let mut is_float = false;
            while i < chars.len() {
                let d = chars[i];
                if d.is_ascii_digit() {
                    i += 1;
                } else if d == '.' && !is_float {
                    is_float = true;
                    i += 1;
                } else if (d == 'e' || d == 'E') && i > start {
                    is_float = true;
                    i += 1;
                    if matches!(chars.get(i), Some('+') | Some('-')) {
                        i += 1;
                    }
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Number(parse_number(&text)?));
        } else if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            loop {
                let Some(&d) = chars.get(i) else {
                    return Err(ChartError::expression(format!(
                        "unterminated string in '{src}'"
                    )));
                };
                i += 1;
                match d {
                    d if d == quote => break,
                    '\\' => {
                        let escaped = chars.get(i).copied().unwrap_or('\\');
                        i += 1;
                        s.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                    }
                    other => s.push(other),
                }
            }
            tokens.push(Token::Str(s));
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
            let Some(punct) = PUNCTUATION.iter().find(|p| rest.starts_with(**p)) else {
                return Err(ChartError::expression(format!(
                    "unexpected character '{c}' in '{src}'"
                )));
            };
            i += punct.chars().count();
            tokens.push(Token::Punct(punct));
        }
    }
    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| ChartError::expression(format!("invalid number literal '{text}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tokenizes_operators_and_literals() {
        let tokens = tokenize("datum.a >= 1.5 && name !== 'x\\'y'").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("datum".into()),
                Token::Punct("."),
                Token::Ident("a".into()),
                Token::Punct(">="),
                Token::Number(json!(1.5)),
                Token::Punct("&&"),
                Token::Ident("name".into()),
                Token::Punct("!=="),
                Token::Str("x'y".into()),
            ]
        );
    }

    #[test]
    fn integers_stay_integers() {
        assert_eq!(tokenize("42").unwrap(), vec![Token::Number(json!(42))]);
        assert_eq!(tokenize("1e3").unwrap(), vec![Token::Number(json!(1000.0))]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(tokenize("'open").is_err());
        assert!(tokenize("a # b").is_err());
    }
}
