// landscape-expr/src/parser.rs
// ============================================================================
// Module: Expression Parser
// Description: Recursive-descent parser over the lexer's token stream,
//              producing a whitelisted AST.
// Purpose: Reject anything the grammar does not explicitly allow at parse
//          time, before the evaluator ever sees it.
// Dependencies: crate::ast, crate::error, crate::lexer
// ============================================================================

use crate::ast::ArithOp;
use crate::ast::CompareOp;
use crate::ast::Expr;
use crate::ast::Literal;
use crate::ast::Subscript;
use crate::error::ExpressionError;
use crate::lexer::Lexer;
use crate::lexer::SpannedToken;
use crate::lexer::Token;

/// Maximum supported nesting depth for parenthesized groups, list literals,
/// unary operators, and `row` subscript chains.
pub const MAX_EXPR_NESTING: usize = 32;

/// Parses `input` into a whitelisted [`Expr`].
///
/// # Errors
/// Returns [`ExpressionError`] for any lexical, syntactic, or whitelist
/// violation, including identifiers other than `row`, trailing input, and
/// nesting beyond [`MAX_EXPR_NESTING`].
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ExpressionError::EmptyInput);
    }

    let mut lexer = Lexer::new(input);
    let tokens = lexer.lex()?;

    let mut parser = Parser::new(tokens);
    let expr = parser.parse_or()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser<'a> {
    /// Token stream with source positions.
    tokens: Vec<SpannedToken<'a>>,
    /// Current token index.
    index: usize,
    /// Current nesting depth for parens, lists, unary ops, and subscripts.
    nesting: usize,
}

impl<'a> Parser<'a> {
    const fn new(tokens: Vec<SpannedToken<'a>>) -> Self {
        Self {
            tokens,
            index: 0,
            nesting: 0,
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_and()?;
        while self.matches(Token::Or) {
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_not()?;
        while self.matches(Token::And) {
            let rhs = self.parse_not()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.matches(Token::Not) {
            let position = self.current().position;
            let inner = self.with_nesting(position, Self::parse_not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ExpressionError> {
        let lhs = self.parse_additive()?;
        let op = match self.current().token {
            Token::EqEq => Some(CompareOp::Eq),
            Token::NotEq => Some(CompareOp::NotEq),
            Token::Lt => Some(CompareOp::Lt),
            Token::LtEq => Some(CompareOp::LtEq),
            Token::Gt => Some(CompareOp::Gt),
            Token::GtEq => Some(CompareOp::GtEq),
            Token::In => Some(CompareOp::In),
            Token::Not if self.peek_is(1, &Token::In) => {
                self.advance();
                self.advance();
                let rhs = self.parse_additive()?;
                return Ok(Expr::Compare(CompareOp::NotIn, Box::new(lhs), Box::new(rhs)));
            }
            _ => None,
        };

        let Some(op) = op else {
            return Ok(lhs);
        };
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.current().token {
                Token::Plus => ArithOp::Add,
                Token::Minus => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            expr = Expr::Arith(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.current().token {
                Token::Star => ArithOp::Mul,
                Token::Slash => ArithOp::Div,
                Token::Percent => ArithOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            expr = Expr::Arith(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.matches(Token::Minus) {
            let position = self.current().position;
            let inner = self.with_nesting(position, Self::parse_unary)?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let SpannedToken { token, position } = *self.current();
        match token {
            Token::Ident("row") => {
                self.advance();
                self.with_nesting(position, Self::parse_row_subscripts)
            }
            Token::Ident(name) => Err(ExpressionError::DisallowedIdentifier {
                name: name.to_string(),
                position,
            }),
            Token::Number(raw) => {
                self.advance();
                Ok(Expr::Literal(Self::parse_number(raw, position)?))
            }
            Token::StringLit(raw) => {
                self.advance();
                Ok(Expr::Literal(Literal::Str(Self::unescape(raw))))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Literal(Literal::Null))
            }
            Token::LBracket => self.with_nesting(position, Self::parse_list),
            Token::LParen => {
                self.advance();
                let expr = self.with_nesting(position, Self::parse_or)?;
                self.expect(Token::RParen, "`)`")?;
                Ok(expr)
            }
            _ => Err(ExpressionError::UnexpectedToken {
                expected: "a literal, `row`, `[`, or `(`",
                found: Self::describe(&token),
                position,
            }),
        }
    }

    fn parse_row_subscripts(&mut self) -> Result<Expr, ExpressionError> {
        let mut subscripts = Vec::new();
        while matches!(self.current().token, Token::LBracket) {
            self.advance();
            let SpannedToken { token, position } = *self.current();
            let subscript = match token {
                Token::StringLit(raw) => {
                    self.advance();
                    Subscript::Key(Self::unescape(raw))
                }
                Token::Number(raw) => {
                    self.advance();
                    match Self::parse_number(raw, position)? {
                        Literal::Int(i) => Subscript::Index(i),
                        _ => {
                            return Err(ExpressionError::UnexpectedToken {
                                expected: "an integer index",
                                found: raw.to_string(),
                                position,
                            });
                        }
                    }
                }
                _ => {
                    return Err(ExpressionError::UnexpectedToken {
                        expected: "a string key or integer index",
                        found: Self::describe(&token),
                        position,
                    });
                }
            };
            self.expect(Token::RBracket, "`]`")?;
            subscripts.push(subscript);
        }
        if subscripts.is_empty() {
            return Err(ExpressionError::UnexpectedToken {
                expected: "`[` to subscript `row`",
                found: Self::describe(&self.current().token),
                position: self.current().position,
            });
        }
        Ok(Expr::Row(subscripts))
    }

    fn parse_list(&mut self) -> Result<Expr, ExpressionError> {
        self.advance(); // '['
        let mut items = Vec::new();
        if !matches!(self.current().token, Token::RBracket) {
            loop {
                items.push(self.parse_or()?);
                if self.matches(Token::Comma) {
                    if matches!(self.current().token, Token::RBracket) {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        self.expect(Token::RBracket, "`]`")?;
        Ok(Expr::List(items))
    }

    fn parse_number(raw: &str, position: usize) -> Result<Literal, ExpressionError> {
        if raw.contains(['.', 'e', 'E']) {
            raw.parse::<f64>()
                .map(Literal::Float)
                .map_err(|_| ExpressionError::InvalidNumber {
                    raw: raw.to_string(),
                    position,
                })
        } else {
            raw.parse::<i64>()
                .map(Literal::Int)
                .map_err(|_| ExpressionError::InvalidNumber {
                    raw: raw.to_string(),
                    position,
                })
        }
    }

    fn unescape(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                    None => {}
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    fn with_nesting<T>(
        &mut self,
        position: usize,
        f: impl FnOnce(&mut Self) -> Result<T, ExpressionError>,
    ) -> Result<T, ExpressionError> {
        let next_depth = self.nesting + 1;
        if next_depth > MAX_EXPR_NESTING {
            return Err(ExpressionError::NestingTooDeep {
                max_depth: MAX_EXPR_NESTING,
                actual_depth: next_depth,
                position,
            });
        }
        self.nesting = next_depth;
        let result = f(self);
        self.nesting = self.nesting.saturating_sub(1);
        result
    }

    fn expect(&mut self, token: Token<'_>, expected: &'static str) -> Result<(), ExpressionError> {
        if std::mem::discriminant(&self.current().token) == std::mem::discriminant(&token) {
            self.advance();
            Ok(())
        } else {
            Err(ExpressionError::UnexpectedToken {
                expected,
                found: Self::describe(&self.current().token),
                position: self.current().position,
            })
        }
    }

    fn expect_eof(&self) -> Result<(), ExpressionError> {
        if matches!(self.current().token, Token::Eof) {
            Ok(())
        } else {
            Err(ExpressionError::TrailingInput {
                position: self.current().position,
            })
        }
    }

    fn matches(&mut self, kind: Token<'_>) -> bool {
        if std::mem::discriminant(&self.current().token) == std::mem::discriminant(&kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn peek_is(&self, ahead: usize, kind: &Token<'_>) -> bool {
        self.tokens
            .get(self.index + ahead)
            .is_some_and(|t| std::mem::discriminant(&t.token) == std::mem::discriminant(kind))
    }

    fn current(&self) -> &SpannedToken<'a> {
        debug_assert!(self.index < self.tokens.len(), "parser index out of bounds");
        &self.tokens[self.index]
    }

    fn advance(&mut self) {
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
    }

    fn describe(token: &Token<'_>) -> String {
        match token {
            Token::Ident(name) => (*name).to_string(),
            Token::Number(raw) | Token::StringLit(raw) => (*raw).to_string(),
            Token::True => "true".to_string(),
            Token::False => "false".to_string(),
            Token::Null => "null".to_string(),
            Token::And => "and".to_string(),
            Token::Or => "or".to_string(),
            Token::Not => "not".to_string(),
            Token::In => "in".to_string(),
            Token::EqEq => "==".to_string(),
            Token::NotEq => "!=".to_string(),
            Token::LtEq => "<=".to_string(),
            Token::Lt => "<".to_string(),
            Token::GtEq => ">=".to_string(),
            Token::Gt => ">".to_string(),
            Token::Plus => "+".to_string(),
            Token::Minus => "-".to_string(),
            Token::Star => "*".to_string(),
            Token::Slash => "/".to_string(),
            Token::Percent => "%".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::LBracket => "[".to_string(),
            Token::RBracket => "]".to_string(),
            Token::Comma => ",".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}
