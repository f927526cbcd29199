//! The parser: recursive descent with Pratt operator precedence.
//!
//! Statement parsing dispatches on the leading token; expressions are built
//! from per-token prefix and infix parsers driven by a precedence ladder.
//! Errors accumulate in the shared engine error list; a batch that produced
//! any error yields no statements.

use std::rc::Rc;

use crate::{
    ast::{Block, Expr, ExprKind, FnLit, Ident, IfCase, Operator, Stmt, StmtKind},
    error::Errors,
    lexer::Lexer,
    position::{CompiledFile, Position},
    token::{Token, TokenKind},
};

/// Binding strength, low to high. Derived ordering drives the Pratt loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Assign,
    LogicalOr,
    LogicalAnd,
    BitOr,
    BitXor,
    BitAnd,
    Equals,
    LessGreater,
    Shift,
    Sum,
    Product,
    Prefix,
    Call,
    Index,
    Dot,
}

fn precedence_of(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Eq | TokenKind::NotEq => Precedence::Equals,
        TokenKind::Lt | TokenKind::Lte | TokenKind::Gt | TokenKind::Gte => Precedence::LessGreater,
        TokenKind::Plus | TokenKind::Minus => Precedence::Sum,
        TokenKind::Slash | TokenKind::Asterisk | TokenKind::Percent => Precedence::Product,
        TokenKind::Lparen => Precedence::Call,
        TokenKind::Lbracket => Precedence::Index,
        TokenKind::Assign
        | TokenKind::PlusAssign
        | TokenKind::MinusAssign
        | TokenKind::AsteriskAssign
        | TokenKind::SlashAssign
        | TokenKind::PercentAssign
        | TokenKind::BitAndAssign
        | TokenKind::BitOrAssign
        | TokenKind::BitXorAssign
        | TokenKind::LshiftAssign
        | TokenKind::RshiftAssign => Precedence::Assign,
        TokenKind::Dot => Precedence::Dot,
        TokenKind::And => Precedence::LogicalAnd,
        TokenKind::Or => Precedence::LogicalOr,
        TokenKind::BitOr => Precedence::BitOr,
        TokenKind::BitXor => Precedence::BitXor,
        TokenKind::BitAnd => Precedence::BitAnd,
        TokenKind::Lshift | TokenKind::Rshift => Precedence::Shift,
        _ => Precedence::Lowest,
    }
}

fn token_operator(kind: TokenKind) -> Option<Operator> {
    let op = match kind {
        TokenKind::Plus | TokenKind::PlusAssign => Operator::Plus,
        TokenKind::Minus | TokenKind::MinusAssign => Operator::Minus,
        TokenKind::Bang => Operator::Bang,
        TokenKind::Asterisk | TokenKind::AsteriskAssign => Operator::Asterisk,
        TokenKind::Slash | TokenKind::SlashAssign => Operator::Slash,
        TokenKind::Percent | TokenKind::PercentAssign => Operator::Modulus,
        TokenKind::Lt => Operator::Lt,
        TokenKind::Lte => Operator::Lte,
        TokenKind::Gt => Operator::Gt,
        TokenKind::Gte => Operator::Gte,
        TokenKind::Eq => Operator::Eq,
        TokenKind::NotEq => Operator::NotEq,
        TokenKind::And => Operator::LogicalAnd,
        TokenKind::Or => Operator::LogicalOr,
        TokenKind::BitAnd | TokenKind::BitAndAssign => Operator::BitAnd,
        TokenKind::BitOr | TokenKind::BitOrAssign => Operator::BitOr,
        TokenKind::BitXor | TokenKind::BitXorAssign => Operator::BitXor,
        TokenKind::Lshift | TokenKind::LshiftAssign => Operator::Lshift,
        TokenKind::Rshift | TokenKind::RshiftAssign => Operator::Rshift,
        _ => return None,
    };
    Some(op)
}

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    cur: Token<'src>,
    peek: Token<'src>,
    errors: Errors,
    repl_mode: bool,
    depth: u32,
}

impl<'src> Parser<'src> {
    pub fn new(
        input: &'src str,
        file: Option<Rc<CompiledFile>>,
        repl_mode: bool,
        errors: Errors,
    ) -> Self {
        let mut lexer = Lexer::new(input, file);
        let cur = lexer.next_token();
        let peek = lexer.next_token();
        Self {
            lexer,
            cur,
            peek,
            errors,
            repl_mode,
            depth: 0,
        }
    }

    /// Parses the whole input. Returns `None` if any error was emitted;
    /// the errors themselves are in the shared list.
    pub fn parse_all(mut self) -> Option<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.cur_is(TokenKind::Eof) {
            if self.cur_is(TokenKind::Semicolon) {
                self.next_token();
                continue;
            }
            let stmt = self.parse_statement()?;
            statements.push(stmt);
        }
        if self.errors.is_empty() {
            Some(statements)
        } else {
            None
        }
    }

    fn next_token(&mut self) {
        self.cur = std::mem::replace(&mut self.peek, self.lexer.next_token());
    }

    fn cur_is(&self, kind: TokenKind) -> bool {
        self.cur.kind == kind
    }

    fn peek_is(&self, kind: TokenKind) -> bool {
        self.peek.kind == kind
    }

    fn expect_current(&mut self, kind: TokenKind) -> bool {
        if self.cur_is(kind) {
            return true;
        }
        self.errors.add_parsing(
            self.cur.position.clone(),
            format!(
                "Expected current token to be \"{}\", got \"{}\" instead",
                kind.name(),
                self.cur.kind.name()
            ),
        );
        false
    }

    // ----- statements -----

    fn parse_statement(&mut self) -> Option<Stmt> {
        let position = self.cur.position.clone();
        let kind = match self.cur.kind {
            TokenKind::Var | TokenKind::Const => self.parse_define_statement()?,
            TokenKind::If => self.parse_if_statement()?,
            TokenKind::Return => self.parse_return_statement()?,
            TokenKind::While => self.parse_while_statement()?,
            TokenKind::Break => {
                self.next_token();
                StmtKind::Break
            }
            TokenKind::Continue => {
                self.next_token();
                StmtKind::Continue
            }
            TokenKind::For => self.parse_for_statement()?,
            TokenKind::Function if self.peek_is(TokenKind::Ident) => {
                self.parse_function_statement()?
            }
            TokenKind::Lbrace if !self.repl_mode || self.depth > 0 => {
                StmtKind::Block(self.parse_code_block()?)
            }
            TokenKind::Import => self.parse_import_statement()?,
            TokenKind::Recover => self.parse_recover_statement()?,
            _ => self.parse_expression_statement()?,
        };
        Some(Stmt::new(kind, position))
    }

    fn parse_define_statement(&mut self) -> Option<StmtKind> {
        let assignable = self.cur_is(TokenKind::Var);
        self.next_token();

        if !self.expect_current(TokenKind::Ident) {
            return None;
        }
        let name = Ident::new(self.cur.literal, self.cur.position.clone());
        self.next_token();

        if !self.expect_current(TokenKind::Assign) {
            return None;
        }
        self.next_token();

        let mut value = self.parse_expression(Precedence::Lowest)?;
        if let ExprKind::FnLit(fn_lit) = &mut value.kind {
            fn_lit.name = Some(name.name.clone());
        }
        Some(StmtKind::Define {
            name,
            value,
            assignable,
        })
    }

    fn parse_if_statement(&mut self) -> Option<StmtKind> {
        self.next_token();
        let mut cases = Vec::new();
        let mut alternative = None;

        if !self.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.next_token();

        let test = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.next_token();
        let consequence = self.parse_code_block()?;
        cases.push(IfCase { test, consequence });

        while self.cur_is(TokenKind::Else) {
            self.next_token();
            if self.cur_is(TokenKind::If) {
                self.next_token();
                if !self.expect_current(TokenKind::Lparen) {
                    return None;
                }
                self.next_token();
                let test = self.parse_expression(Precedence::Lowest)?;
                if !self.expect_current(TokenKind::Rparen) {
                    return None;
                }
                self.next_token();
                let consequence = self.parse_code_block()?;
                cases.push(IfCase { test, consequence });
            } else {
                alternative = Some(self.parse_code_block()?);
            }
        }

        Some(StmtKind::If { cases, alternative })
    }

    fn parse_return_statement(&mut self) -> Option<StmtKind> {
        self.next_token();
        let expr = if self.cur_is(TokenKind::Semicolon)
            || self.cur_is(TokenKind::Rbrace)
            || self.cur_is(TokenKind::Eof)
        {
            None
        } else {
            Some(self.parse_expression(Precedence::Lowest)?)
        };
        Some(StmtKind::Return(expr))
    }

    fn parse_expression_statement(&mut self) -> Option<StmtKind> {
        let expr = self.parse_expression(Precedence::Lowest)?;
        let repl_top_level = self.repl_mode && self.depth == 0;
        if !repl_top_level
            && !matches!(expr.kind, ExprKind::Assign { .. } | ExprKind::Call { .. })
        {
            self.errors.add_parsing(
                expr.position.clone(),
                "Only assignments and function calls can be expression statements",
            );
            return None;
        }
        Some(StmtKind::Expression(expr))
    }

    fn parse_while_statement(&mut self) -> Option<StmtKind> {
        self.next_token();
        if !self.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.next_token();
        let test = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.next_token();
        let body = self.parse_code_block()?;
        Some(StmtKind::While { test, body })
    }

    fn parse_for_statement(&mut self) -> Option<StmtKind> {
        self.next_token();
        if !self.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.next_token();
        if self.cur_is(TokenKind::Ident) && self.peek_is(TokenKind::In) {
            self.parse_foreach()
        } else {
            self.parse_classic_for()
        }
    }

    fn parse_foreach(&mut self) -> Option<StmtKind> {
        let iterator = Ident::new(self.cur.literal, self.cur.position.clone());
        self.next_token();

        if !self.expect_current(TokenKind::In) {
            return None;
        }
        self.next_token();

        let source = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.next_token();

        let body = self.parse_code_block()?;
        Some(StmtKind::Foreach {
            iterator,
            source,
            body,
        })
    }

    fn parse_classic_for(&mut self) -> Option<StmtKind> {
        let init = if self.cur_is(TokenKind::Semicolon) {
            None
        } else {
            let stmt = self.parse_statement()?;
            if !matches!(
                stmt.kind,
                StmtKind::Define { .. } | StmtKind::Expression(_)
            ) {
                self.errors.add_parsing(
                    stmt.position.clone(),
                    "for loop's init clause should be a define statement or an expression",
                );
                return None;
            }
            if !self.expect_current(TokenKind::Semicolon) {
                return None;
            }
            Some(Box::new(stmt))
        };
        self.next_token();

        let test = if self.cur_is(TokenKind::Semicolon) {
            None
        } else {
            let test = self.parse_expression(Precedence::Lowest)?;
            if !self.expect_current(TokenKind::Semicolon) {
                return None;
            }
            Some(test)
        };
        self.next_token();

        let update = if self.cur_is(TokenKind::Rparen) {
            None
        } else {
            let update = self.parse_expression(Precedence::Lowest)?;
            if !self.expect_current(TokenKind::Rparen) {
                return None;
            }
            Some(update)
        };
        self.next_token();

        let body = self.parse_code_block()?;
        Some(StmtKind::ForLoop {
            init,
            test,
            update,
            body,
        })
    }

    fn parse_function_statement(&mut self) -> Option<StmtKind> {
        let position = self.cur.position.clone();
        self.next_token();

        if !self.expect_current(TokenKind::Ident) {
            return None;
        }
        let name = Ident::new(self.cur.literal, self.cur.position.clone());
        self.next_token();

        let mut value = self.parse_function_literal(position)?;
        if let ExprKind::FnLit(fn_lit) = &mut value.kind {
            fn_lit.name = Some(name.name.clone());
        }
        Some(StmtKind::Define {
            name,
            value,
            assignable: false,
        })
    }

    fn parse_import_statement(&mut self) -> Option<StmtKind> {
        self.next_token();
        if !self.expect_current(TokenKind::String) {
            return None;
        }
        let Some(path) = process_string(self.cur.literal) else {
            self.errors.add_parsing(
                self.cur.position.clone(),
                "Error when parsing module name",
            );
            return None;
        };
        self.next_token();
        Some(StmtKind::Import { path })
    }

    fn parse_recover_statement(&mut self) -> Option<StmtKind> {
        self.next_token();
        if !self.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.next_token();

        if !self.expect_current(TokenKind::Ident) {
            return None;
        }
        let error_ident = Ident::new(self.cur.literal, self.cur.position.clone());
        self.next_token();

        if !self.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.next_token();

        let body = self.parse_code_block()?;
        Some(StmtKind::Recover { error_ident, body })
    }

    fn parse_code_block(&mut self) -> Option<Block> {
        if !self.expect_current(TokenKind::Lbrace) {
            return None;
        }
        self.next_token();
        self.depth += 1;

        let mut statements = Vec::new();
        while !self.cur_is(TokenKind::Rbrace) {
            if self.cur_is(TokenKind::Eof) {
                self.errors
                    .add_parsing(self.cur.position.clone(), "Unexpected EOF");
                self.depth -= 1;
                return None;
            }
            if self.cur_is(TokenKind::Semicolon) {
                self.next_token();
                continue;
            }
            let Some(stmt) = self.parse_statement() else {
                self.depth -= 1;
                return None;
            };
            statements.push(stmt);
        }
        self.next_token();
        self.depth -= 1;
        Some(Block { statements })
    }

    // ----- expressions -----

    fn parse_expression(&mut self, precedence: Precedence) -> Option<Expr> {
        let position = self.cur.position.clone();

        if self.cur_is(TokenKind::Illegal) {
            self.errors
                .add_parsing(self.cur.position.clone(), "Illegal token");
            return None;
        }

        let mut left = self.parse_prefix()?;
        left.position = position;

        while !self.cur_is(TokenKind::Semicolon) && precedence < precedence_of(self.cur.kind) {
            let position = self.cur.position.clone();
            let Some(mut new_left) = self.parse_infix(left) else {
                return None;
            };
            new_left.position = position;
            left = new_left;
        }

        Some(left)
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        let position = self.cur.position.clone();
        match self.cur.kind {
            TokenKind::Ident => {
                let expr = Expr::new(ExprKind::Ident(self.cur.literal.to_owned()), position);
                self.next_token();
                Some(expr)
            }
            TokenKind::Number => self.parse_number_literal(),
            TokenKind::True | TokenKind::False => {
                let expr = Expr::new(
                    ExprKind::BoolLit(self.cur_is(TokenKind::True)),
                    position,
                );
                self.next_token();
                Some(expr)
            }
            TokenKind::String => self.parse_string_literal(),
            TokenKind::Null => {
                self.next_token();
                Some(Expr::new(ExprKind::NullLit, position))
            }
            TokenKind::Bang | TokenKind::Minus => self.parse_prefix_expression(),
            TokenKind::Lparen => self.parse_grouped_expression(),
            TokenKind::Function => self.parse_function_literal(position),
            TokenKind::Lbracket => self.parse_array_literal(),
            TokenKind::Lbrace => self.parse_map_literal(),
            _ => {
                self.errors.add_parsing(
                    position,
                    format!(
                        "No prefix parse function for \"{}\" found",
                        self.cur.literal
                    ),
                );
                None
            }
        }
    }

    fn parse_infix(&mut self, left: Expr) -> Option<Expr> {
        match self.cur.kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Slash
            | TokenKind::Asterisk
            | TokenKind::Percent
            | TokenKind::Eq
            | TokenKind::NotEq
            | TokenKind::Lt
            | TokenKind::Lte
            | TokenKind::Gt
            | TokenKind::Gte
            | TokenKind::BitAnd
            | TokenKind::BitOr
            | TokenKind::BitXor
            | TokenKind::Lshift
            | TokenKind::Rshift => self.parse_infix_expression(left),
            TokenKind::Lparen => self.parse_call_expression(left),
            TokenKind::Lbracket => self.parse_index_expression(left),
            TokenKind::Assign
            | TokenKind::PlusAssign
            | TokenKind::MinusAssign
            | TokenKind::AsteriskAssign
            | TokenKind::SlashAssign
            | TokenKind::PercentAssign
            | TokenKind::BitAndAssign
            | TokenKind::BitOrAssign
            | TokenKind::BitXorAssign
            | TokenKind::LshiftAssign
            | TokenKind::RshiftAssign => self.parse_assign_expression(left),
            TokenKind::Dot => self.parse_dot_expression(left),
            TokenKind::And | TokenKind::Or => self.parse_logical_expression(left),
            // no infix parser for this token; the Pratt loop stops
            _ => Some(left),
        }
    }

    fn parse_number_literal(&mut self) -> Option<Expr> {
        let literal = self.cur.literal;
        let position = self.cur.position.clone();
        let number = parse_number(literal);
        let Some(number) = number else {
            self.errors.add_parsing(
                position,
                format!("Parsing number literal \"{literal}\" failed"),
            );
            return None;
        };
        self.next_token();
        Some(Expr::new(ExprKind::NumberLit(number), position))
    }

    fn parse_string_literal(&mut self) -> Option<Expr> {
        let position = self.cur.position.clone();
        let Some(processed) = process_string(self.cur.literal) else {
            self.errors
                .add_parsing(position, "Error when parsing string literal");
            return None;
        };
        self.next_token();
        Some(Expr::new(ExprKind::StringLit(processed), position))
    }

    fn parse_array_literal(&mut self) -> Option<Expr> {
        let position = self.cur.position.clone();
        let items =
            self.parse_expression_list(TokenKind::Lbracket, TokenKind::Rbracket, true)?;
        Some(Expr::new(ExprKind::ArrayLit(items), position))
    }

    fn parse_map_literal(&mut self) -> Option<Expr> {
        let position = self.cur.position.clone();
        let mut keys = Vec::new();
        let mut values = Vec::new();

        self.next_token();
        while !self.cur_is(TokenKind::Rbrace) {
            let key = if self.cur_is(TokenKind::Ident) {
                // bare identifiers are string keys
                let key = Expr::new(
                    ExprKind::StringLit(self.cur.literal.to_owned()),
                    self.cur.position.clone(),
                );
                self.next_token();
                key
            } else {
                let key = self.parse_expression(Precedence::Lowest)?;
                match key.kind {
                    ExprKind::StringLit(_) | ExprKind::NumberLit(_) | ExprKind::BoolLit(_) => {}
                    _ => {
                        self.errors.add_parsing(
                            key.position.clone(),
                            "Invalid map literal key type",
                        );
                        return None;
                    }
                }
                key
            };
            keys.push(key);

            if !self.expect_current(TokenKind::Colon) {
                return None;
            }
            self.next_token();

            let value = self.parse_expression(Precedence::Lowest)?;
            values.push(value);

            if self.cur_is(TokenKind::Rbrace) {
                break;
            }
            if !self.expect_current(TokenKind::Comma) {
                return None;
            }
            self.next_token();
        }
        self.next_token();

        Some(Expr::new(ExprKind::MapLit { keys, values }, position))
    }

    fn parse_prefix_expression(&mut self) -> Option<Expr> {
        let position = self.cur.position.clone();
        let op = token_operator(self.cur.kind)?;
        self.next_token();
        let right = self.parse_expression(Precedence::Prefix)?;
        Some(Expr::new(
            ExprKind::Prefix {
                op,
                right: Box::new(right),
            },
            position,
        ))
    }

    fn parse_infix_expression(&mut self, left: Expr) -> Option<Expr> {
        let position = self.cur.position.clone();
        let op = token_operator(self.cur.kind)?;
        let precedence = precedence_of(self.cur.kind);
        self.next_token();
        let right = self.parse_expression(precedence)?;
        Some(Expr::new(
            ExprKind::Infix {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            position,
        ))
    }

    fn parse_logical_expression(&mut self, left: Expr) -> Option<Expr> {
        let position = self.cur.position.clone();
        let op = token_operator(self.cur.kind)?;
        let precedence = precedence_of(self.cur.kind);
        self.next_token();
        let right = self.parse_expression(precedence)?;
        Some(Expr::new(
            ExprKind::Logical {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            position,
        ))
    }

    fn parse_grouped_expression(&mut self) -> Option<Expr> {
        self.next_token();
        let expr = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.next_token();
        Some(expr)
    }

    fn parse_function_literal(&mut self, position: Position) -> Option<Expr> {
        self.depth += 1;
        if self.cur_is(TokenKind::Function) {
            self.next_token();
        }
        let result = self.parse_function_literal_inner(position);
        self.depth -= 1;
        result
    }

    fn parse_function_literal_inner(&mut self, position: Position) -> Option<Expr> {
        let params = self.parse_function_parameters()?;
        let body = self.parse_code_block()?;
        Some(Expr::new(
            ExprKind::FnLit(FnLit {
                name: None,
                params,
                body,
            }),
            position,
        ))
    }

    fn parse_function_parameters(&mut self) -> Option<Vec<Ident>> {
        if !self.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.next_token();

        let mut params = Vec::new();
        if self.cur_is(TokenKind::Rparen) {
            self.next_token();
            return Some(params);
        }

        if !self.expect_current(TokenKind::Ident) {
            return None;
        }
        params.push(Ident::new(self.cur.literal, self.cur.position.clone()));
        self.next_token();

        while self.cur_is(TokenKind::Comma) {
            self.next_token();
            if !self.expect_current(TokenKind::Ident) {
                return None;
            }
            params.push(Ident::new(self.cur.literal, self.cur.position.clone()));
            self.next_token();
        }

        if !self.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.next_token();
        Some(params)
    }

    fn parse_call_expression(&mut self, function: Expr) -> Option<Expr> {
        let position = function.position.clone();
        let args = self.parse_expression_list(TokenKind::Lparen, TokenKind::Rparen, false)?;
        Some(Expr::new(
            ExprKind::Call {
                function: Box::new(function),
                args,
            },
            position,
        ))
    }

    fn parse_expression_list(
        &mut self,
        start: TokenKind,
        end: TokenKind,
        trailing_comma_allowed: bool,
    ) -> Option<Vec<Expr>> {
        if !self.expect_current(start) {
            return None;
        }
        self.next_token();

        let mut items = Vec::new();
        if self.cur_is(end) {
            self.next_token();
            return Some(items);
        }

        items.push(self.parse_expression(Precedence::Lowest)?);

        while self.cur_is(TokenKind::Comma) {
            self.next_token();
            if trailing_comma_allowed && self.cur_is(end) {
                break;
            }
            items.push(self.parse_expression(Precedence::Lowest)?);
        }

        if !self.expect_current(end) {
            return None;
        }
        self.next_token();
        Some(items)
    }

    fn parse_index_expression(&mut self, left: Expr) -> Option<Expr> {
        let position = left.position.clone();
        self.next_token();
        let index = self.parse_expression(Precedence::Lowest)?;
        if !self.expect_current(TokenKind::Rbracket) {
            return None;
        }
        self.next_token();
        Some(Expr::new(
            ExprKind::Index {
                left: Box::new(left),
                index: Box::new(index),
            },
            position,
        ))
    }

    fn parse_dot_expression(&mut self, left: Expr) -> Option<Expr> {
        let position = left.position.clone();
        self.next_token();
        if !self.expect_current(TokenKind::Ident) {
            return None;
        }
        // `a.b` is `a["b"]`
        let index = Expr::new(
            ExprKind::StringLit(self.cur.literal.to_owned()),
            self.cur.position.clone(),
        );
        self.next_token();
        Some(Expr::new(
            ExprKind::Index {
                left: Box::new(left),
                index: Box::new(index),
            },
            position,
        ))
    }

    fn parse_assign_expression(&mut self, dest: Expr) -> Option<Expr> {
        let assign_kind = self.cur.kind;
        let position = dest.position.clone();
        self.next_token();

        let mut source = self.parse_expression(Precedence::Lowest)?;
        if assign_kind != TokenKind::Assign {
            // `x op= y` becomes `x = x op y`
            let op = token_operator(assign_kind)?;
            let source_position = source.position.clone();
            source = Expr::new(
                ExprKind::Infix {
                    op,
                    left: Box::new(dest.clone()),
                    right: Box::new(source),
                },
                source_position,
            );
        }

        Some(Expr::new(
            ExprKind::Assign {
                dest: Box::new(dest),
                source: Box::new(source),
            },
            position,
        ))
    }
}

/// Parses a number literal: decimal, float, exponent or `0x` hex form.
fn parse_number(literal: &str) -> Option<f64> {
    if let Some(hex) = literal.strip_prefix("0x").or_else(|| literal.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    literal.parse::<f64>().ok()
}

fn escape_char(c: char) -> Option<char> {
    let escaped = match c {
        '"' => '"',
        '\'' => '\'',
        '\\' => '\\',
        '/' => '/',
        'b' => '\u{8}',
        'f' => '\u{c}',
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        '0' => '\0',
        _ => return None,
    };
    Some(escaped)
}

/// Resolves backslash escapes in a raw string-literal body. Returns `None`
/// on an unknown escape or a trailing backslash.
fn process_string(input: &str) -> Option<String> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            output.push(escape_char(chars.next()?)?);
        } else {
            output.push(c);
        }
    }
    Some(output)
}
