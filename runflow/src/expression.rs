//! Condition expressions for the `when` middleware.
//!
//! Supports:
//! - Literals: numbers, `"strings"` or `'strings'`, `true`, `false`, `null`
//! - Comparison: `==`, `!=`, `<`, `<=`, `>`, `>=`
//! - Logic: `&&`, `||`, `!`
//! - Arithmetic: `+`, `-`, `*`, `/`, `%` (`+` also joins strings)
//! - Parentheses for grouping
//!
//! There are no variables; interpolation has already substituted argument
//! values into the expression text by the time it is evaluated.

use crate::errors::PipelineError;
use anyhow::{anyhow, bail, Result};
use std::fmt;

/// A value produced while evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    /// Numeric literal or arithmetic result.
    Number(f64),
    /// String literal.
    Str(String),
    /// Boolean.
    Bool(bool),
    /// `null`.
    Null,
}

impl ExprValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Bool(_) => "bool",
            Self::Null => "null",
        }
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// Evaluates an expression.
pub fn evaluate(expression: &str) -> Result<ExprValue, PipelineError> {
    let mut parser = ExprParser::new(expression);
    parser
        .parse_or()
        .and_then(|value| parser.expect_end().map(|()| value))
        .map_err(|e| PipelineError::Expression {
            expression: expression.to_string(),
            reason: format!("{e:#}"),
        })
}

/// Evaluates an expression that must produce a boolean.
pub fn evaluate_condition(expression: &str) -> Result<bool, PipelineError> {
    match evaluate(expression)? {
        ExprValue::Bool(b) => Ok(b),
        other => Err(PipelineError::Expression {
            expression: expression.to_string(),
            reason: format!("expected a bool, got {} {other}", other.kind()),
        }),
    }
}

struct ExprParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn skip_whitespace(&mut self) {
        let input = self.input;
        while let Some(ch) = input[self.pos..].chars().next() {
            if ch.is_whitespace() {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
    }

    fn rest(&mut self) -> &'a str {
        self.skip_whitespace();
        let input = self.input;
        &input[self.pos..]
    }

    /// Consumes `token` if the input continues with it.
    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        let rest = self.rest();
        if !rest.is_empty() {
            bail!("unexpected trailing input {rest:?}");
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<ExprValue> {
        let mut left = self.parse_and()?;
        while self.eat("||") {
            let right = self.parse_and()?;
            left = ExprValue::Bool(truthy(&left, "||")? || truthy(&right, "||")?);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<ExprValue> {
        let mut left = self.parse_comparison()?;
        while self.eat("&&") {
            let right = self.parse_comparison()?;
            left = ExprValue::Bool(truthy(&left, "&&")? && truthy(&right, "&&")?);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<ExprValue> {
        let left = self.parse_sum()?;
        // Two-character operators first so `<=` is not read as `<`.
        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if self.eat(op) {
                let right = self.parse_sum()?;
                return compare(op, &left, &right).map(ExprValue::Bool);
            }
        }
        Ok(left)
    }

    fn parse_sum(&mut self) -> Result<ExprValue> {
        let mut left = self.parse_product()?;
        loop {
            if self.eat("+") {
                let right = self.parse_product()?;
                left = match (left, right) {
                    (ExprValue::Number(a), ExprValue::Number(b)) => ExprValue::Number(a + b),
                    (ExprValue::Str(a), ExprValue::Str(b)) => ExprValue::Str(a + &b),
                    (a, b) => bail!("cannot add {} and {}", a.kind(), b.kind()),
                };
            } else if self.eat("-") {
                let right = self.parse_product()?;
                left = ExprValue::Number(number(&left, "-")? - number(&right, "-")?);
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_product(&mut self) -> Result<ExprValue> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat("*") {
                '*'
            } else if self.eat("/") {
                '/'
            } else if self.eat("%") {
                '%'
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            let (a, b) = (number(&left, "arithmetic")?, number(&right, "arithmetic")?);
            left = ExprValue::Number(match op {
                '*' => a * b,
                '/' if b == 0.0 => bail!("division by zero"),
                '/' => a / b,
                _ if b == 0.0 => bail!("modulo by zero"),
                _ => a % b,
            });
        }
    }

    fn parse_unary(&mut self) -> Result<ExprValue> {
        // `!=` is handled by the comparison level; a lone `!` negates.
        if !self.rest().starts_with("!=") && self.eat("!") {
            let value = self.parse_unary()?;
            return Ok(ExprValue::Bool(!truthy(&value, "!")?));
        }
        if self.eat("-") {
            let value = self.parse_unary()?;
            return Ok(ExprValue::Number(-number(&value, "negation")?));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<ExprValue> {
        let rest = self.rest();
        let Some(first) = rest.chars().next() else {
            bail!("unexpected end of expression");
        };

        match first {
            '(' => {
                self.pos += 1;
                let value = self.parse_or()?;
                if !self.eat(")") {
                    bail!("expected ')'");
                }
                Ok(value)
            }
            '"' | '\'' => self.parse_string(first),
            c if c.is_ascii_digit() || c == '.' => {
                let len = rest
                    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                    .unwrap_or(rest.len());
                let literal = &rest[..len];
                self.pos += len;
                literal
                    .parse()
                    .map(ExprValue::Number)
                    .map_err(|_| anyhow!("invalid number {literal:?}"))
            }
            c if c.is_alphabetic() => {
                let len = rest
                    .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                let word = &rest[..len];
                self.pos += len;
                match word {
                    "true" => Ok(ExprValue::Bool(true)),
                    "false" => Ok(ExprValue::Bool(false)),
                    "null" => Ok(ExprValue::Null),
                    other => bail!("unknown identifier {other:?}"),
                }
            }
            other => bail!("unexpected character {other:?}"),
        }
    }

    fn parse_string(&mut self, quote: char) -> Result<ExprValue> {
        self.pos += quote.len_utf8();
        let input = self.input;
        let mut out = String::new();
        let mut chars = input[self.pos..].char_indices();
        while let Some((offset, ch)) = chars.next() {
            match ch {
                '\\' => {
                    let Some((_, escaped)) = chars.next() else {
                        break;
                    };
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                c if c == quote => {
                    self.pos += offset + c.len_utf8();
                    return Ok(ExprValue::Str(out));
                }
                c => out.push(c),
            }
        }
        bail!("unterminated string literal")
    }
}

fn truthy(value: &ExprValue, op: &str) -> Result<bool> {
    match value {
        ExprValue::Bool(b) => Ok(*b),
        other => bail!("operator {op} expects bool, got {}", other.kind()),
    }
}

fn number(value: &ExprValue, op: &str) -> Result<f64> {
    match value {
        ExprValue::Number(n) => Ok(*n),
        other => bail!("{op} expects number, got {}", other.kind()),
    }
}

fn compare(op: &str, left: &ExprValue, right: &ExprValue) -> Result<bool> {
    use std::cmp::Ordering;

    match op {
        // Values of different kinds are simply unequal.
        "==" => return Ok(left == right),
        "!=" => return Ok(left != right),
        _ => {}
    }

    let ordering = match (left, right) {
        (ExprValue::Number(a), ExprValue::Number(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| anyhow!("cannot order {a} and {b}"))?,
        (ExprValue::Str(a), ExprValue::Str(b)) => a.cmp(b),
        (a, b) => bail!("cannot order {} and {}", a.kind(), b.kind()),
    };

    Ok(match op {
        "<" => ordering == Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(expr: &str) -> bool {
        evaluate_condition(expr).unwrap()
    }

    #[test]
    fn test_literals() {
        assert!(cond("true"));
        assert!(!cond("false"));
        assert_eq!(evaluate("42").unwrap(), ExprValue::Number(42.0));
        let err = evaluate("'it''s'").unwrap_err();
        assert!(err.to_string().contains("trailing"));
        assert_eq!(evaluate("null").unwrap(), ExprValue::Null);
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(!cond("1 == 2"));
        assert!(cond("1 != 2"));
        assert!(cond("2 >= 2"));
        assert!(cond("1.5 < 2"));
        assert!(cond("3 > 2 && 2 > 1"));
        assert!(cond("(1 + 2) * 3 == 9"));
        assert!(cond("10 % 4 == 2"));
        assert!(cond("-1 < 0"));
    }

    #[test]
    fn test_string_comparison() {
        assert!(cond("\"main\" == 'main'"));
        assert!(cond("'abc' < 'abd'"));
        assert!(cond("'a' + 'b' == 'ab'"));
        assert!(!cond("'1' == 1"));
        assert!(cond("\"say \\\"hi\\\"\" == 'say \"hi\"'"));
    }

    #[test]
    fn test_logic() {
        assert!(cond("!false"));
        assert!(cond("false || true"));
        assert!(!cond("true && !(1 == 1)"));
        assert!(cond("!(1 != 1)"));
    }

    #[test]
    fn test_errors() {
        for expr in ["", "1 +", "(1 == 1", "'open", "foo == 1", "1 / 0", "true + 1", "'a' < 1"] {
            let err = evaluate(expr).unwrap_err();
            assert!(
                matches!(err, PipelineError::Expression { .. }),
                "{expr:?} gave {err}"
            );
        }
    }

    #[test]
    fn test_condition_must_be_bool() {
        let err = evaluate_condition("1 + 1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid expression \"1 + 1\": expected a bool, got number 2"
        );
    }
}
