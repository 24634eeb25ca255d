//! Boolean expressions for `condition` and `loop` steps.
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | compare
//! compare := operand (("=="|"!="|">"|">="|"<"|"<="|"contains") operand)?
//! operand := number | 'str' | "str" | true | false | null | ${name} | name | "(" expr ")"
//! ```
//!
//! A bare `name` that is unset reads as `null`; an unset `${name}` is an error.

use crate::domain::VariableMap;
use crate::engine::assertion::{numeric, value_contains, values_equal};
use crate::engine::env::is_identifier;
use crate::error::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Placeholder(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Placeholder(String),
    Variable(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

/// A parsed condition, reusable across loop iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    root: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(Error::malformed("Empty condition expression"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            source,
        };
        let root = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self { root })
    }

    pub fn evaluate(&self, variables: &VariableMap) -> Result<bool> {
        eval(&self.root, variables).map(|value| truthy(&value))
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;
    let malformed =
        |what: &str| Error::malformed(format!("Invalid condition `{source}`: {what}"));

    while pos < chars.len() {
        let ch = chars[pos];
        let next = chars.get(pos + 1).copied();
        match ch {
            c if c.is_whitespace() => pos += 1,
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                pos += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                pos += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                pos += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                pos += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                pos += 1;
            }
            '>' | '<' => {
                let inclusive = next == Some('=');
                let op = match (ch, inclusive) {
                    ('>', false) => CompareOp::Gt,
                    ('>', true) => CompareOp::Ge,
                    ('<', false) => CompareOp::Lt,
                    _ => CompareOp::Le,
                };
                tokens.push(Token::Op(op));
                pos += if inclusive { 2 } else { 1 };
            }
            '\'' | '"' => {
                let close = chars[pos + 1..]
                    .iter()
                    .position(|c| *c == ch)
                    .ok_or_else(|| malformed("unterminated string"))?;
                let text: String = chars[pos + 1..pos + 1 + close].iter().collect();
                tokens.push(Token::Str(text));
                pos += close + 2;
            }
            '$' if next == Some('{') => {
                let close = chars[pos + 2..]
                    .iter()
                    .position(|c| *c == '}')
                    .ok_or_else(|| malformed("unterminated placeholder"))?;
                let name: String = chars[pos + 2..pos + 2 + close].iter().collect();
                if !is_identifier(&name) {
                    return Err(malformed(&format!("`{name}` is not a variable name")));
                }
                tokens.push(Token::Placeholder(name));
                pos += close + 3;
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = pos;
                pos += 1;
                while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| malformed(&format!("bad number `{text}`")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_')
                {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                if word == "contains" {
                    tokens.push(Token::Op(CompareOp::Contains));
                } else {
                    tokens.push(Token::Ident(word));
                }
            }
            other => return Err(malformed(&format!("unexpected `{other}`"))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, what: &str) -> Error {
        Error::malformed(format!("Invalid condition `{}`: {what}", self.source))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr> {
        let left = self.operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn operand(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(number)) => Ok(Expr::Literal(Value::from(number))),
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Placeholder(name)) => Ok(Expr::Placeholder(name)),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Variable(word),
            }),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("missing `)`")),
                }
            }
            Some(other) => Err(self.error(&format!("unexpected {other:?}"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

fn eval(expr: &Expr, variables: &VariableMap) -> Result<Value> {
    Ok(match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Placeholder(name) => {
            variables
                .get(name)
                .cloned()
                .ok_or_else(|| Error::MissingVariable { name: name.clone() })?
        }
        Expr::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, variables)?)),
        Expr::And(left, right) => {
            Value::Bool(truthy(&eval(left, variables)?) && truthy(&eval(right, variables)?))
        }
        Expr::Or(left, right) => {
            Value::Bool(truthy(&eval(left, variables)?) || truthy(&eval(right, variables)?))
        }
        Expr::Compare(left, op, right) => {
            let left = eval(left, variables)?;
            let right = eval(right, variables)?;
            Value::Bool(compare(&left, *op, &right))
        }
    })
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Contains => !left.is_null() && value_contains(left, right),
        ordering => match (numeric(left), numeric(right)) {
            (Some(l), Some(r)) => match ordering {
                CompareOp::Gt => l > r,
                CompareOp::Ge => l >= r,
                CompareOp::Lt => l < r,
                _ => l <= r,
            },
            _ => false,
        },
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> VariableMap {
        let mut vars = VariableMap::new();
        vars.insert("status".to_string(), json!(200));
        vars.insert("role".to_string(), json!("admin"));
        vars.insert("tags".to_string(), json!(["beta", "internal"]));
        vars.insert("empty".to_string(), json!(""));
        vars.insert("count".to_string(), json!("3"));
        vars
    }

    fn eval_str(source: &str) -> bool {
        Condition::parse(source)
            .and_then(|condition| condition.evaluate(&vars()))
            .expect("valid condition")
    }

    #[test]
    fn comparisons() {
        assert!(eval_str("status == 200"));
        assert!(eval_str("${status} != 404"));
        assert!(eval_str("count >= 3 && count < 3.5"));
        assert!(eval_str("role == 'admin'"));
        assert!(eval_str(r#"tags contains "beta""#));
        assert!(eval_str("role contains 'adm'"));
        assert!(!eval_str("role > 1"));
        assert!(eval_str("-1 < 0"));
    }

    #[test]
    fn boolean_logic_and_precedence() {
        assert!(eval_str("status == 500 || role == 'admin' && count == 3"));
        assert!(!eval_str("(status == 500 || role == 'admin') && count == 4"));
        assert!(eval_str("!(status == 500)"));
        assert!(eval_str("!!role"));
    }

    #[test]
    fn truthiness_of_lone_operands() {
        assert!(eval_str("role"));
        assert!(!eval_str("empty"));
        assert!(!eval_str("unset_name"));
        assert!(eval_str("tags"));
        assert!(!eval_str("0"));
        assert!(eval_str("true"));
        assert!(!eval_str("null"));
    }

    #[test]
    fn unset_names() {
        assert!(eval_str("unset_name == null"));
        let err = Condition::parse("${unset_name} == 1")
            .and_then(|condition| condition.evaluate(&vars()))
            .unwrap_err();
        assert!(matches!(err, Error::MissingVariable { ref name } if name == "unset_name"));
    }

    #[test]
    fn malformed_expressions() {
        for source in ["", "status ==", "(status == 1", "status = 1", "'open", "${1x}", "a b", "#"] {
            assert!(
                matches!(Condition::parse(source), Err(Error::MalformedRule(_))),
                "`{source}` should be rejected"
            );
        }
    }

    #[test]
    fn parsed_condition_is_reusable() {
        let condition = Condition::parse("loop_index < 2").expect("valid");
        let mut vars = VariableMap::new();
        vars.insert("loop_index".to_string(), json!(1));
        assert!(condition.evaluate(&vars).expect("eval"));
        vars.insert("loop_index".to_string(), json!(2));
        assert!(!condition.evaluate(&vars).expect("eval"));
    }
}
