/// Step-program parser.
///
/// Produces the typed AST in `crate::ast`. Scope resolution and output
/// binding are the validator's job; the parser only rejects malformed text
/// and calls to functions outside the builtin set.
use crate::ast::{Expr, Statement};
use crate::error::ValidationError;
use crate::lexer::{lex, Spanned, Token};

mod expressions;

pub(crate) use expressions::is_keyword;

// ──────────────────────────────────────────────
// Parser
// ──────────────────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Spanned]) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn cur(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.cur().token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn cur_pos(&self) -> usize {
        self.cur().pos
    }

    fn advance(&mut self) -> &Spanned {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn is_word(&self, w: &str) -> bool {
        matches!(self.peek(), Token::Ident(x) if x == w)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ValidationError> {
        if self.peek() == &expected {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}'", expected.describe())))
        }
    }

    fn unexpected(&self, context: &str) -> ValidationError {
        let found = self.peek().describe();
        ValidationError::syntax(self.cur_pos(), format!("{}, got '{}'", context, found))
            .with_token(found)
    }

    fn skip_separators(&mut self) {
        while self.peek() == &Token::Separator {
            self.advance();
        }
    }

    // -- Statements ----------------------------------------------

    fn parse_program(&mut self) -> Result<Vec<Statement>, ValidationError> {
        let mut statements = Vec::new();
        self.skip_separators();
        while self.peek() != &Token::Eof {
            statements.push(self.parse_statement()?);
            match self.peek() {
                Token::Separator => self.skip_separators(),
                Token::Eof => {}
                _ => return Err(self.unexpected("expected end of statement")),
            }
        }
        if statements.is_empty() {
            return Err(ValidationError::syntax(0, "expression is empty"));
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Statement, ValidationError> {
        let pos = self.cur_pos();
        let assigns = self.peek_at(1) == &Token::Assign;
        if let (Token::Ident(name), true) = (self.peek().clone(), assigns) {
            if expressions::is_keyword(&name) {
                return Err(ValidationError::syntax(
                    pos,
                    format!("'{}' is reserved and cannot be assigned", name),
                )
                .with_token(name));
            }
            self.advance();
            self.advance();
            let expr = self.parse_expr()?;
            return Ok(Statement {
                target: Some(name),
                expr,
                pos,
            });
        }
        let expr = self.parse_expr()?;
        if self.peek() == &Token::Assign {
            return Err(ValidationError::syntax(
                self.cur_pos(),
                "assignment target must be a plain identifier; use '==' to compare",
            )
            .with_token("="));
        }
        Ok(Statement {
            target: None,
            expr,
            pos,
        })
    }
}

/// Parse a full step program (one or more statements).
pub fn parse_program(src: &str) -> Result<Vec<Statement>, ValidationError> {
    let tokens = lex(src)?;
    Parser::new(&tokens).parse_program()
}

/// Parse a single expression with no assignment or separators.
pub fn parse_expression(src: &str) -> Result<Expr, ValidationError> {
    let tokens = lex(src)?;
    let mut p = Parser::new(&tokens);
    let expr = p.parse_expr()?;
    if p.peek() != &Token::Eof {
        return Err(p.unexpected("expected end of expression"));
    }
    Ok(expr)
}
