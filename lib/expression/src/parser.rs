//! Recursive descent parser producing [`Expr`] trees.
//!
//! Precedence, loosest first: ternary, `||`, `&&`, equality, comparison,
//! additive, multiplicative, unary, postfix (member, index, call).

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::ExpressionErrorKind;
use crate::lexer::{Token, TokenKind, tokenize};
use serde_json::Value;

/// Parses a bare expression (no `{{ }}` delimiters).
pub(crate) fn parse(source: &str) -> Result<Expr, ExpressionErrorKind> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        pos: 0,
    };
    let expr = parser.ternary()?;
    match parser.peek() {
        TokenKind::Eof => Ok(expr),
        other => Err(parser.error(format!("unexpected {other:?} after expression"))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].position
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn eat(&mut self, expected: &TokenKind) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &TokenKind, what: &str) -> Result<(), ExpressionErrorKind> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, message: String) -> ExpressionErrorKind {
        ExpressionErrorKind::Syntax {
            position: self.position(),
            message,
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionErrorKind> {
        let test = self.binary(0)?;
        if !self.eat(&TokenKind::Question) {
            return Ok(test);
        }
        let consequent = self.ternary()?;
        self.expect(&TokenKind::Colon, "':' in conditional expression")?;
        let alternate = self.ternary()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    /// Precedence climbing over the binary operator levels.
    fn binary(&mut self, level: usize) -> Result<Expr, ExpressionErrorKind> {
        if level == LEVELS {
            return self.unary();
        }
        let mut left = self.binary(level + 1)?;
        while let Some(op) = operator_at(level, self.peek()) {
            self.advance();
            let right = self.binary(level + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionErrorKind> {
        let op = match self.peek() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Negate,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionErrorKind> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let TokenKind::Ident(name) = self.advance() else {
                        return Err(self.error("expected property name after '.'".to_string()));
                    };
                    if self.eat(&TokenKind::LParen) {
                        let args = self.arguments()?;
                        expr = Expr::MethodCall {
                            receiver: Box::new(expr),
                            method: name,
                            args,
                        };
                    } else {
                        expr = Expr::Member {
                            object: Box::new(expr),
                            property: name,
                        };
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.ternary()?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                TokenKind::LParen => {
                    let Expr::Identifier(function) = expr else {
                        return Err(self.error("only named functions can be called".to_string()));
                    };
                    self.advance();
                    let args = self.arguments()?;
                    expr = Expr::Call { function, args };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Parses a comma separated list up to the closing `)`; the opening
    /// parenthesis has already been consumed.
    fn arguments(&mut self) -> Result<Vec<Expr>, ExpressionErrorKind> {
        self.list(&TokenKind::RParen, "')'")
    }

    fn list(
        &mut self,
        close: &TokenKind,
        what: &str,
    ) -> Result<Vec<Expr>, ExpressionErrorKind> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.ternary()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(&TokenKind::Comma, &format!("',' or {what}"))?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionErrorKind> {
        let position = self.position();
        match self.advance() {
            TokenKind::Integer(n) => Ok(Expr::Literal(Value::from(n))),
            TokenKind::Float(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Ident(name) => Ok(Expr::Identifier(name)),
            TokenKind::LParen => {
                let inner = self.ternary()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => Ok(Expr::Array(self.list(&TokenKind::RBracket, "']'")?)),
            TokenKind::Eof => Err(ExpressionErrorKind::Syntax {
                position,
                message: "unexpected end of expression".to_string(),
            }),
            other => Err(ExpressionErrorKind::Syntax {
                position,
                message: format!("unexpected {other:?}"),
            }),
        }
    }
}

const LEVELS: usize = 6;

fn operator_at(level: usize, token: &TokenKind) -> Option<BinaryOp> {
    let op = match (level, token) {
        (0, TokenKind::OrOr) => BinaryOp::Or,
        (1, TokenKind::AndAnd) => BinaryOp::And,
        (2, TokenKind::EqEq) => BinaryOp::Equal,
        (2, TokenKind::NotEq) => BinaryOp::NotEqual,
        (2, TokenKind::StrictEq) => BinaryOp::StrictEqual,
        (2, TokenKind::StrictNotEq) => BinaryOp::StrictNotEqual,
        (3, TokenKind::Lt) => BinaryOp::Less,
        (3, TokenKind::Le) => BinaryOp::LessEqual,
        (3, TokenKind::Gt) => BinaryOp::Greater,
        (3, TokenKind::Ge) => BinaryOp::GreaterEqual,
        (4, TokenKind::Plus) => BinaryOp::Add,
        (4, TokenKind::Minus) => BinaryOp::Subtract,
        (5, TokenKind::Star) => BinaryOp::Multiply,
        (5, TokenKind::Slash) => BinaryOp::Divide,
        (5, TokenKind::Percent) => BinaryOp::Remainder,
        _ => return None,
    };
    Some(op)
}
