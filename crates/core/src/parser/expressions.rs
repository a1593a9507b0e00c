use rust_decimal::Decimal;

use super::Parser;
use crate::ast::{BinaryOp, Builtin, Expr, Literal, UnaryOp};
use crate::error::{ValidationError, ValidationErrorKind};
use crate::lexer::Token;

/// Words that can never name a variable or an output.
pub(crate) const KEYWORDS: &[&str] = &["true", "false", "and", "or", "not"];

pub(crate) fn is_keyword(w: &str) -> bool {
    KEYWORDS.contains(&w)
}

impl<'a> Parser<'a> {
    // -- Expression parsing (lowest precedence first) -------------

    pub(super) fn parse_expr(&mut self) -> Result<Expr, ValidationError> {
        let cond = self.parse_or_expr()?;
        if self.peek() != &Token::Question {
            return Ok(cond);
        }
        self.advance();
        let then = self.parse_expr()?;
        self.expect(Token::Colon)?;
        let otherwise = self.parse_expr()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn parse_or_expr(&mut self) -> Result<Expr, ValidationError> {
        let mut left = self.parse_and_expr()?;
        while self.peek() == &Token::OrOr || self.is_word("or") {
            self.advance();
            let right = self.parse_and_expr()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr, ValidationError> {
        let mut left = self.parse_equality()?;
        while self.peek() == &Token::AndAnd || self.is_word("and") {
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ValidationError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::Neq => BinaryOp::Neq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ValidationError> {
        let left = self.parse_additive()?;
        let op = match comparison_op(self.peek()) {
            Some(op) => op,
            None => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        // a < b < c is ambiguous; refuse rather than guess.
        if comparison_op(self.peek()).is_some() {
            return Err(ValidationError::syntax(
                self.cur_pos(),
                "chained comparison is ambiguous; combine comparisons with 'and'",
            )
            .with_token(self.peek().describe()));
        }
        Ok(binary(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<Expr, ValidationError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ValidationError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ValidationError> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Bang => UnaryOp::Not,
            Token::Ident(w) if w == "not" => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ValidationError> {
        let pos = self.cur_pos();
        match self.peek().clone() {
            Token::Number(text) => {
                self.advance();
                let d = Decimal::from_str_exact(&text).map_err(|_| {
                    ValidationError::syntax(pos, format!("numeric literal '{}' out of range", text))
                        .with_token(text.clone())
                })?;
                Ok(Expr::Literal(Literal::Number(d)))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Literal::Str(s)))
            }
            Token::Ident(w) if w == "true" => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(true)))
            }
            Token::Ident(w) if w == "false" => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(false)))
            }
            Token::Ident(w) if is_keyword(&w) => Err(ValidationError::syntax(
                pos,
                format!("unexpected keyword '{}'", w),
            )
            .with_token(w)),
            Token::Ident(name) => {
                self.advance();
                if self.peek() == &Token::LParen {
                    return self.parse_call(name, pos);
                }
                Ok(Expr::Var { name, pos })
            }
            Token::LParen => {
                self.advance();
                let e = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(e)
            }
            _ => Err(self.unexpected("expected a value")),
        }
    }

    fn parse_call(&mut self, name: String, pos: usize) -> Result<Expr, ValidationError> {
        let func = Builtin::from_name(&name).ok_or_else(|| {
            ValidationError::new(
                ValidationErrorKind::UnknownFunction,
                format!("unknown function '{}'; available: min, max, clamp, abs", name),
            )
            .with_token(name.clone())
            .at(pos)
        })?;
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != &Token::RParen {
            loop {
                args.push(self.parse_expr()?);
                if self.peek() == &Token::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect(Token::RParen)?;
        Ok(Expr::Call { func, args, pos })
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn comparison_op(tok: &Token) -> Option<BinaryOp> {
    match tok {
        Token::Lt => Some(BinaryOp::Lt),
        Token::Lte => Some(BinaryOp::Lte),
        Token::Gt => Some(BinaryOp::Gt),
        Token::Gte => Some(BinaryOp::Gte),
        _ => None,
    }
}
