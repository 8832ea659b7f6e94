//! Constrained arithmetic evaluator for computed export columns.
//!
//! This is deliberately not a general expression engine: the input has
//! already had field references substituted with numeric literals, and the
//! only accepted characters are digits, `+ - * / ( ) .` and whitespace.
//! Anything outside that whitelist is rejected before parsing begins, so a
//! template formula can never execute anything. Grammar, with standard
//! precedence:
//!
//! ```text
//! expression := term (('+' | '-') term)*
//! term       := factor (('*' | '/') factor)*
//! factor     := number | '(' expression ')' | ('-' | '+') factor
//! number     := digit+ ('.' digit+)?
//! ```

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("Expression is empty")]
    Empty,
    #[error("Expression contains no operands")]
    NoOperands,
    #[error("Forbidden character '{0}' in expression")]
    ForbiddenCharacter(char),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedCharacter(char, usize),
    #[error("Unexpected end of expression")]
    UnexpectedEnd,
    #[error("Expected ')' at position {0}")]
    MissingClosingParen(usize),
    #[error("Malformed number at position {0}")]
    MalformedNumber(usize),
}

/// Evaluates a pure arithmetic expression.
///
/// Rejects, never coerces: malformed input is an error, not a guess.
pub fn evaluate(expression: &str) -> Result<f64, FormulaError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(FormulaError::Empty);
    }
    for ch in trimmed.chars() {
        if !matches!(ch, '0'..='9' | '+' | '-' | '*' | '/' | '(' | ')' | '.' | ' ') {
            return Err(FormulaError::ForbiddenCharacter(ch));
        }
    }
    if !trimmed.chars().any(|ch| ch.is_ascii_digit()) {
        return Err(FormulaError::NoOperands);
    }

    let mut parser = Parser {
        chars: trimmed.chars().collect(),
        pos: 0,
    };
    let value = parser.expression()?;
    parser.skip_whitespace();
    match parser.peek() {
        Some(ch) => Err(FormulaError::UnexpectedCharacter(ch, parser.pos)),
        None => Ok(value),
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn expression(&mut self) -> Result<f64, FormulaError> {
        let mut value = self.term()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('+') => {
                    self.bump();
                    value += self.term()?;
                }
                Some('-') => {
                    self.bump();
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, FormulaError> {
        let mut value = self.factor()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('*') => {
                    self.bump();
                    value *= self.factor()?;
                }
                Some('/') => {
                    self.bump();
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    value /= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, FormulaError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(FormulaError::UnexpectedEnd),
            Some('(') => {
                self.bump();
                let value = self.expression()?;
                self.skip_whitespace();
                if self.peek() == Some(')') {
                    self.bump();
                    Ok(value)
                } else {
                    Err(FormulaError::MissingClosingParen(self.pos))
                }
            }
            Some('-') => {
                self.bump();
                Ok(-self.factor()?)
            }
            Some('+') => {
                self.bump();
                self.factor()
            }
            Some(ch) if ch.is_ascii_digit() => self.number(),
            Some(ch) => Err(FormulaError::UnexpectedCharacter(ch, self.pos)),
        }
    }

    fn number(&mut self) -> Result<f64, FormulaError> {
        let start = self.pos;
        while self.peek().is_some_and(|ch| ch.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some('.') {
            self.pos += 1;
            let fraction_start = self.pos;
            while self.peek().is_some_and(|ch| ch.is_ascii_digit()) {
                self.pos += 1;
            }
            if self.pos == fraction_start {
                return Err(FormulaError::MalformedNumber(start));
            }
        }
        let literal: String = self.chars[start..self.pos].iter().collect();
        literal
            .parse()
            .map_err(|_| FormulaError::MalformedNumber(start))
    }
}
