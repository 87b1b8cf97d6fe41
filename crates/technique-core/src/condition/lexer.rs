//! Tokenizer for condition expressions.

use std::fmt;

use super::ConditionError;

/// Maximum accepted expression length in bytes.
pub const MAX_EXPRESSION_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Null,
    True,
    False,
    Number(f64),
    Str(String),
    /// Dotted path, split into segments.
    Path(Vec<String>),

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,

    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Path(p) => write!(f, "{}", p.join(".")),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ConditionError> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Option<Token>, ConditionError> {
        while self.chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            self.chars.next();
        }
        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(None);
        };

        let token = match ch {
            '(' => {
                self.chars.next();
                Token::LParen
            }
            ')' => {
                self.chars.next();
                Token::RParen
            }
            '=' => {
                self.chars.next();
                self.expect('=', pos, "expected '=='")?;
                Token::Eq
            }
            '!' => {
                self.chars.next();
                if self.eat('=') { Token::Ne } else { Token::Not }
            }
            '<' => {
                self.chars.next();
                if self.eat('=') { Token::Le } else { Token::Lt }
            }
            '>' => {
                self.chars.next();
                if self.eat('=') { Token::Ge } else { Token::Gt }
            }
            '&' => {
                self.chars.next();
                self.expect('&', pos, "expected '&&'")?;
                Token::And
            }
            '|' => {
                self.chars.next();
                self.expect('|', pos, "expected '||'")?;
                Token::Or
            }
            '\'' | '"' => self.read_string(ch, pos)?,
            '-' | '0'..='9' => self.read_number(pos)?,
            c if c.is_ascii_alphabetic() || c == '_' => self.read_word(pos)?,
            other => {
                return Err(ConditionError::Syntax {
                    position: pos,
                    message: format!("unexpected character {other:?}"),
                });
            }
        };
        Ok(Some(token))
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek().is_some_and(|(_, c)| *c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char, pos: usize, message: &str) -> Result<(), ConditionError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(ConditionError::Syntax {
                position: pos,
                message: message.to_string(),
            })
        }
    }

    fn read_string(&mut self, quote: char, start: usize) -> Result<Token, ConditionError> {
        self.chars.next();
        let mut out = String::new();
        loop {
            let Some((pos, c)) = self.chars.next() else {
                return Err(ConditionError::Syntax {
                    position: start,
                    message: "unterminated string literal".to_string(),
                });
            };
            match c {
                c if c == quote => return Ok(Token::Str(out)),
                '\\' => {
                    let escaped = match self.chars.next() {
                        Some((_, '\\')) => '\\',
                        Some((_, '\'')) => '\'',
                        Some((_, '"')) => '"',
                        Some((_, 'n')) => '\n',
                        Some((_, 't')) => '\t',
                        Some((_, other)) => {
                            return Err(ConditionError::Syntax {
                                position: pos,
                                message: format!("unsupported escape '\\{other}'"),
                            });
                        }
                        None => {
                            return Err(ConditionError::Syntax {
                                position: pos,
                                message: "unterminated escape".to_string(),
                            });
                        }
                    };
                    out.push(escaped);
                }
                c if c.is_control() => {
                    return Err(ConditionError::Syntax {
                        position: pos,
                        message: "control character in string literal".to_string(),
                    });
                }
                c => out.push(c),
            }
        }
    }

    fn read_number(&mut self, start: usize) -> Result<Token, ConditionError> {
        let mut text = String::new();
        if self.eat('-') {
            text.push('-');
        }
        while let Some(&(_, c)) = self.chars.peek() {
            let sign_after_exponent =
                (c == '+' || c == '-') && matches!(text.chars().last(), Some('e' | 'E'));
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || sign_after_exponent {
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Token::Number(n)),
            _ => Err(ConditionError::Syntax {
                position: start,
                message: format!("invalid number '{text}'"),
            }),
        }
    }

    fn read_word(&mut self, start: usize) -> Result<Token, ConditionError> {
        let mut text = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }

        let token = match text.as_str() {
            "AND" | "and" => Token::And,
            "OR" | "or" => Token::Or,
            "NOT" | "not" => Token::Not,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            _ => {
                let segments: Vec<String> = text.split('.').map(str::to_string).collect();
                if segments.iter().any(String::is_empty) {
                    return Err(ConditionError::Syntax {
                        position: start,
                        message: format!("malformed path '{text}'"),
                    });
                }
                Token::Path(segments)
            }
        };
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn lexes_comparison() {
        assert_eq!(
            lex("state.score >= 5"),
            vec![
                Token::Path(vec!["state".into(), "score".into()]),
                Token::Ge,
                Token::Number(5.0)
            ]
        );
    }

    #[test]
    fn lexes_keywords_and_symbols() {
        assert_eq!(
            lex("NOT a && (b || c) AND d OR e"),
            vec![
                Token::Not,
                Token::Path(vec!["a".into()]),
                Token::And,
                Token::LParen,
                Token::Path(vec!["b".into()]),
                Token::Or,
                Token::Path(vec!["c".into()]),
                Token::RParen,
                Token::And,
                Token::Path(vec!["d".into()]),
                Token::Or,
                Token::Path(vec!["e".into()]),
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(lex(r#"'it\'s' "a\tb\n""#), vec![
            Token::Str("it's".into()),
            Token::Str("a\tb\n".into())
        ]);
        assert!(Lexer::new(r"'\x41'").tokenize().is_err());
        assert!(Lexer::new("'unterminated").tokenize().is_err());
        assert!(Lexer::new("'bell\u{7}'").tokenize().is_err());
    }

    #[test]
    fn numbers() {
        assert_eq!(lex("-2.5"), vec![Token::Number(-2.5)]);
        assert_eq!(lex("1e3"), vec![Token::Number(1000.0)]);
        assert!(Lexer::new("1e999").tokenize().is_err());
        assert!(Lexer::new("1.2.3").tokenize().is_err());
    }

    #[test]
    fn rejects_single_equals_and_stray_chars() {
        assert!(Lexer::new("a = 1").tokenize().is_err());
        assert!(Lexer::new("a & b").tokenize().is_err());
        assert!(Lexer::new("a # b").tokenize().is_err());
        assert!(Lexer::new("a..b").tokenize().is_err());
    }
}
