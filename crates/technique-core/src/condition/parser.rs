//! Recursive-descent parser producing the condition AST.
//!
//! ```text
//! expr       := or
//! or         := and ( ("OR" | "||") and )*
//! and        := not ( ("AND" | "&&") not )*
//! not        := ("NOT" | "!") not | primary
//! primary    := "(" expr ")" | comparison
//! comparison := operand ( op operand )?
//! operand    := path [".exists"] | number | string | true | false | null
//! ```

use serde_json::Value;

use super::ConditionError;
use super::lexer::{Lexer, MAX_EXPRESSION_LEN, Token};
use crate::sanitize::is_disallowed_key;

/// Maximum nesting of parentheses and negations.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    /// A lone operand, evaluated for truthiness.
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path(Vec<String>),
    /// `path.exists`
    Exists(Vec<String>),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parse a condition expression.
pub fn parse(input: &str) -> Result<Expr, ConditionError> {
    if input.len() > MAX_EXPRESSION_LEN {
        return Err(ConditionError::TooLong(input.len()));
    }
    if input.trim().is_empty() {
        return Err(ConditionError::Empty);
    }
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or(0)?;
    if let Some(extra) = parser.peek() {
        return Err(ConditionError::Syntax {
            position: parser.pos,
            message: format!("unexpected token '{extra}'"),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self, depth: usize) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.parse_and(depth)?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and(depth)?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::Or(terms) })
    }

    fn parse_and(&mut self, depth: usize) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.parse_not(depth)?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_not(depth)?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::And(terms) })
    }

    fn parse_not(&mut self, depth: usize) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            if depth >= MAX_DEPTH {
                return Err(ConditionError::TooDeep);
            }
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not(depth + 1)?)));
        }
        self.parse_primary(depth)
    }

    fn parse_primary(&mut self, depth: usize) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::LParen) {
            if depth >= MAX_DEPTH {
                return Err(ConditionError::TooDeep);
            }
            self.pos += 1;
            let inner = self.parse_or(depth + 1)?;
            match self.next() {
                Some(Token::RParen) => return Ok(inner),
                _ => {
                    return Err(ConditionError::Syntax {
                        position: self.pos,
                        message: "expected ')'".to_string(),
                    });
                }
            }
        }

        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Ok(Expr::Truthy(left)),
        };
        self.pos += 1;
        let right = self.parse_operand()?;
        Ok(Expr::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        let position = self.pos;
        match self.next() {
            Some(Token::Number(n)) => Ok(Operand::Literal(
                serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::True) => Ok(Operand::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Operand::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Operand::Literal(Value::Null)),
            Some(Token::Path(mut segments)) => {
                if let Some(bad) = segments.iter().find(|s| is_disallowed_key(s)) {
                    return Err(ConditionError::ForbiddenPath(bad.clone()));
                }
                if segments.len() > 1 && segments.last().is_some_and(|s| s == "exists") {
                    segments.pop();
                    Ok(Operand::Exists(segments))
                } else {
                    Ok(Operand::Path(segments))
                }
            }
            Some(other) => Err(ConditionError::Syntax {
                position,
                message: format!("expected operand, found '{other}'"),
            }),
            None => Err(ConditionError::Syntax {
                position,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}
