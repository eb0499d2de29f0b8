//! Tokenizer and parser for the extended libpcap filter syntax.
//!
//! Byte-predicate terms are not interpreted here; their text is collected
//! verbatim into [`Expr::Generic`] leaves and handed to the program
//! builder. Only the logical structure and the extension terms are
//! parsed.

use crate::Error;
use crate::ast::{BinaryOp, Expr, StreamIdRange, ValidTerms};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Compare(&'static str),
    Word(String),
    Valid,
    Signature,
}

/// Characters that may appear inside a word besides alphanumerics
/// (array offsets, IPv4/IPv6 literals, MAC bytes, ranges).
fn is_word_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '[' | ']' | '.' | ':' | '-' | '_')
}

fn keyword(word: &str) -> Option<Token> {
    match word {
        "and" => Some(Token::And),
        "or" => Some(Token::Or),
        "not" => Some(Token::Not),
        "valid" => Some(Token::Valid),
        "signature" => Some(Token::Signature),
        _ => None,
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        if is_word_char(ch) {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if !is_word_char(ch) {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            tokens.push(keyword(&word).unwrap_or(Token::Word(word)));
            continue;
        }

        chars.next();
        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                Token::And
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                Token::Or
            }
            '!' if chars.peek() == Some(&'=') => {
                chars.next();
                Token::Compare("!=")
            }
            '!' => Token::Not,
            '=' if chars.peek() == Some(&'=') => {
                chars.next();
                Token::Compare("==")
            }
            '=' => Token::Compare("=="),
            '<' if chars.peek() == Some(&'=') => {
                chars.next();
                Token::Compare("<=")
            }
            '<' => Token::Compare("<"),
            '>' if chars.peek() == Some(&'=') => {
                chars.next();
                Token::Compare(">=")
            }
            '>' => Token::Compare(">"),
            other => return Err(Error::Parse(format!("unexpected character '{other}'"))),
        };
        tokens.push(token);
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
    paren_level: i32,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).cloned();
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn accumulate(
        accum: &mut Option<Expr>,
        expr: Expr,
        op: &mut Option<BinaryOp>,
    ) -> Result<(), Error> {
        match accum.take() {
            None => *accum = Some(expr),
            Some(lhs) => {
                let op = op
                    .take()
                    .ok_or_else(|| Error::Parse("missing logical operator".to_string()))?;
                *accum = Some(Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(expr),
                });
            }
        }
        Ok(())
    }

    fn parse_logical_expr(&mut self, unary: bool) -> Result<Option<Expr>, Error> {
        let mut logical_op: Option<BinaryOp> = None;
        let mut accum: Option<Expr> = None;

        while let Some(token) = self.peek() {
            match token {
                Token::LParen => {
                    self.paren_level += 1;
                    self.consume();
                    let sub = self
                        .parse_logical_expr(false)?
                        .ok_or_else(|| Error::Parse("empty parenthesized expression".to_string()))?;
                    if self.peek() != Some(&Token::RParen) {
                        return Err(Error::Parse("missing ')'".to_string()));
                    }
                    self.paren_level -= 1;
                    self.consume();
                    Self::accumulate(&mut accum, sub, &mut logical_op)?;
                }
                Token::RParen => {
                    // The caller consumes the closing parenthesis.
                    if self.paren_level <= 0 {
                        return Err(Error::Parse("mismatched parenthesis".to_string()));
                    }
                    return Ok(accum);
                }
                Token::Not => {
                    self.consume();
                    let sub = self
                        .parse_logical_expr(true)?
                        .ok_or_else(|| Error::Parse("missing expression after not".to_string()))?;
                    Self::accumulate(&mut accum, Expr::not(sub), &mut logical_op)?;
                }
                Token::And | Token::Or => {
                    if logical_op.is_some() {
                        return Err(Error::Parse("incorrect logical operator usage".to_string()));
                    }
                    if unary {
                        // A unary operator does not associate across a
                        // conjunction; leave the token for the caller.
                        return Ok(accum);
                    }
                    logical_op = Some(match token {
                        Token::And => BinaryOp::And,
                        _ => BinaryOp::Or,
                    });
                    self.consume();
                }
                Token::Valid => {
                    let sub = self.parse_valid_expr()?;
                    Self::accumulate(&mut accum, sub, &mut logical_op)?;
                }
                Token::Signature => {
                    let sub = self.parse_signature_expr()?;
                    Self::accumulate(&mut accum, sub, &mut logical_op)?;
                }
                Token::Word(_) => {
                    let sub = self.parse_match_expr()?;
                    Self::accumulate(&mut accum, sub, &mut logical_op)?;
                }
                Token::Compare(op) => {
                    return Err(Error::Parse(format!("unexpected token '{op}'")));
                }
            }
        }

        if logical_op.is_some() {
            return Err(Error::Parse("trailing logical operator".to_string()));
        }

        Ok(accum)
    }

    fn parse_valid_expr(&mut self) -> Result<Expr, Error> {
        self.consume();

        let mut terms = ValidTerms::empty();
        while let Some(Token::Word(word)) = self.peek() {
            match word.as_str() {
                "fcs" => terms |= ValidTerms::ETH_FCS,
                "chksum" => terms |= ValidTerms::CHKSUM,
                "prbs" => terms |= ValidTerms::PRBS,
                other => {
                    return Err(Error::Parse(format!("unexpected valid field '{other}'")));
                }
            }
            self.consume();
        }

        if terms.is_empty() {
            return Err(Error::Parse("valid expression missing fields".to_string()));
        }

        Ok(Expr::Valid(terms))
    }

    fn parse_number(text: &str) -> Result<u32, Error> {
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
        {
            u32::from_str_radix(hex, 16)
        } else {
            text.parse()
        };

        parsed.map_err(|_| Error::Parse(format!("error parsing integer value '{text}'")))
    }

    fn parse_range(text: &str) -> Result<StreamIdRange, Error> {
        match text.split_once('-') {
            None => {
                let value = Self::parse_number(text)?;
                Ok(StreamIdRange {
                    start: value,
                    end: value,
                })
            }
            Some((start, end)) => Ok(StreamIdRange {
                start: Self::parse_number(start)?,
                end: Self::parse_number(end)?,
            }),
        }
    }

    fn parse_signature_expr(&mut self) -> Result<Expr, Error> {
        self.consume();

        let mut stream_id = None;
        while let Some(Token::Word(word)) = self.peek() {
            if word != "streamid" {
                return Err(Error::Parse(format!("unexpected signature match '{word}'")));
            }
            if stream_id.is_some() {
                return Err(Error::Parse("duplicate streamid".to_string()));
            }
            self.consume();

            let Some(Token::Word(range)) = self.consume() else {
                return Err(Error::Parse("streamid missing value".to_string()));
            };
            stream_id = Some(Self::parse_range(&range)?);
        }

        Ok(Expr::Signature(stream_id))
    }

    fn parse_match_term(&mut self) -> Result<String, Error> {
        let mut term = String::new();

        while let Some(token) = self.peek() {
            match token {
                Token::Word(word) => {
                    if !term.is_empty() {
                        term.push(' ');
                    }
                    term.push_str(word);
                    self.consume();
                }
                Token::LParen => {
                    self.paren_level += 1;
                    self.consume();
                    let sub = self.parse_match_term()?;
                    if self.peek() != Some(&Token::RParen) {
                        return Err(Error::Parse("missing ')'".to_string()));
                    }
                    self.paren_level -= 1;
                    self.consume();
                    term.push('(');
                    term.push_str(&sub);
                    term.push(')');
                }
                Token::RParen => {
                    if self.paren_level <= 0 {
                        return Err(Error::Parse("mismatched parenthesis".to_string()));
                    }
                    break;
                }
                Token::And | Token::Or | Token::Not | Token::Compare(_) => break,
                Token::Valid | Token::Signature => break,
            }
        }

        if term.is_empty() {
            return Err(Error::Parse("error parsing match expression".to_string()));
        }

        Ok(term)
    }

    fn parse_match_expr(&mut self) -> Result<Expr, Error> {
        let lhs = self.parse_match_term()?;

        if let Some(Token::Compare(op)) = self.peek() {
            let op = *op;
            self.consume();
            let rhs = self.parse_match_term()?;
            return Ok(Expr::Generic(format!("{lhs} {op} {rhs}")));
        }

        Ok(Expr::Generic(lhs))
    }
}

/// Parses a filter string into an expression tree.
pub fn parse(input: &str) -> Result<Expr, Error> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        cursor: 0,
        paren_level: 0,
    };

    parser
        .parse_logical_expr(false)?
        .ok_or_else(|| Error::Parse("empty filter expression".to_string()))
}
