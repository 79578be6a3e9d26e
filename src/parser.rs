use std::iter::Peekable;
use std::path::Path;

use crate::ast::{BinaryOp, Expr, FunctionDecl, Program, Stmt, UnaryOp};
use crate::error::GemError;
use crate::scanner::{Token, TokenType};

// Parser takes a source of tokens and builds a Program.
// The first lexical or syntax error stops parsing; the public API is the parse() function.
#[derive(Debug)]
struct Parser<'a, T>
where
    T: Iterator<Item = Token<'a>>,
{
    tokens: Peekable<T>,
    current_token: Token<'a>,
    file: String,
}

type ParseResult<T> = Result<T, GemError>;

impl<'a, T> Parser<'a, T>
where
    T: Iterator<Item = Token<'a>>,
{
    fn program(&mut self) -> ParseResult<Program> {
        let mut body = Vec::new();
        loop {
            self.skip_semicolons()?;
            if self.check(TokenType::Eof) {
                break;
            }
            body.push(self.statement()?);
        }
        Ok(Program { body })
    }

    // Moves to the next token and hands back the one we were on.
    fn advance(&mut self) -> ParseResult<Token<'a>> {
        let next = match self.tokens.next() {
            Some(token) => token,
            None => Token {
                typ: TokenType::Eof,
                raw: "".into(),
                line: self.current_token.line,
                column: self.current_token.column,
            },
        };
        self.lexical_check(&next)?;
        Ok(std::mem::replace(&mut self.current_token, next))
    }

    fn lexical_check(&self, token: &Token<'a>) -> ParseResult<()> {
        if token.typ == TokenType::Error {
            Err(GemError::Lexical {
                file: self.file.clone(),
                line: token.line,
                column: token.column,
                message: token.raw.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current_token.typ == typ
    }

    fn peek_typ(&mut self) -> Option<TokenType> {
        self.tokens.peek().map(|t| t.typ)
    }

    fn take_if(&mut self, typ: TokenType) -> ParseResult<bool> {
        if self.check(typ) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, expected_type: TokenType, what: &str) -> ParseResult<Token<'a>> {
        if self.check(expected_type) {
            self.advance()
        } else {
            Err(self.expected(what))
        }
    }

    fn identifier(&mut self) -> ParseResult<String> {
        Ok(self
            .consume(TokenType::Identifier, "identifier")?
            .raw
            .into_owned())
    }

    fn skip_semicolons(&mut self) -> ParseResult<()> {
        while self.take_if(TokenType::Semicolon)? {}
        Ok(())
    }

    fn expected(&self, what: &str) -> GemError {
        let got = match self.current_token.typ {
            TokenType::Eof => "end of file".to_string(),
            _ => format!("'{}'", self.current_token.raw),
        };
        self.error(&format!("Expected {}, got {}!", what, got))
    }

    fn error(&self, message: &str) -> GemError {
        GemError::Parse {
            file: self.file.clone(),
            line: self.current_token.line,
            column: self.current_token.column,
            message: message.to_string(),
        }
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        let typ = self.current_token.typ;
        let stmt = match typ {
            TokenType::Var => self.var_declaration()?,
            TokenType::Fn if self.peek_typ() == Some(TokenType::Identifier) => {
                Stmt::Function(self.function()?)
            }
            TokenType::If => self.if_statement()?,
            TokenType::While => {
                self.advance()?;
                let condition = self.expression()?;
                let body = self.block()?;
                Stmt::While { condition, body }
            }
            TokenType::For => self.for_statement()?,
            TokenType::Return => self.return_statement()?,
            TokenType::Break => {
                self.advance()?;
                Stmt::Break
            }
            TokenType::Continue => {
                self.advance()?;
                Stmt::Continue
            }
            TokenType::Reflect => self.reflect_statement()?,
            TokenType::Shine => {
                self.advance()?;
                if !matches!(
                    self.current_token.typ,
                    TokenType::Var | TokenType::Fn | TokenType::Extern
                ) {
                    return Err(self.expected("declaration after 'shine'"));
                }
                Stmt::Shine(Box::new(self.statement()?))
            }
            TokenType::Extern => self.extern_statement()?,
            TokenType::Delete => {
                self.advance()?;
                Stmt::Delete(self.identifier()?)
            }
            _ => self.expression_statement()?,
        };
        self.skip_semicolons()?;
        Ok(stmt)
    }

    // A braced list of statements, or a single statement.
    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        if !self.take_if(TokenType::LeftBrace)? {
            return Ok(vec![self.statement()?]);
        }
        let mut body = Vec::new();
        loop {
            self.skip_semicolons()?;
            if self.take_if(TokenType::RightBrace)? {
                return Ok(body);
            }
            if self.check(TokenType::Eof) {
                return Err(self.expected("'}'"));
            }
            body.push(self.statement()?);
        }
    }

    fn var_declaration(&mut self) -> ParseResult<Stmt> {
        self.advance()?;
        let name = self.identifier()?;
        let value = if self.take_if(TokenType::Equal)? {
            self.expression()?
        } else {
            Expr::Number(0.0)
        };
        Ok(Stmt::Var { name, value })
    }

    // `fn [name](params) body`, starting at the `fn` token.
    fn function(&mut self) -> ParseResult<FunctionDecl> {
        self.consume(TokenType::Fn, "'fn'")?;
        let name = if self.check(TokenType::Identifier) {
            self.identifier()?
        } else {
            "_".to_string()
        };
        self.consume(TokenType::LeftParen, "'('")?;
        let params = self.name_list(TokenType::RightParen)?;
        let body = self.block()?;
        Ok(FunctionDecl { name, params, body })
    }

    // Comma separated identifiers up to and including `close`.
    fn name_list(&mut self, close: TokenType) -> ParseResult<Vec<String>> {
        let mut names = Vec::new();
        if self.take_if(close)? {
            return Ok(names);
        }
        loop {
            names.push(self.identifier()?);
            if self.take_if(close)? {
                return Ok(names);
            }
            self.consume(TokenType::Comma, "','")?;
        }
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        self.advance()?;
        let mut branches = vec![(self.expression()?, self.block()?)];
        let mut otherwise = None;
        loop {
            self.skip_semicolons()?;
            if self.take_if(TokenType::Elif)? {
                branches.push((self.expression()?, self.block()?));
            } else if self.take_if(TokenType::Else)? {
                otherwise = Some(self.block()?);
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If {
            branches,
            otherwise,
        })
    }

    fn for_statement(&mut self) -> ParseResult<Stmt> {
        self.advance()?;
        let names = if self.take_if(TokenType::LeftParen)? {
            self.name_list(TokenType::RightParen)?
        } else {
            vec![self.identifier()?]
        };
        self.consume(TokenType::In, "'in'")?;
        match names.len() {
            1 => {
                self.consume(TokenType::LeftParen, "'(' before the loop range")?;
                let mut bounds = self.expression_list(TokenType::RightParen)?;
                if !(2..=3).contains(&bounds.len()) {
                    return Err(self.error("A loop range takes a start, an end and an optional step!"));
                }
                let step = if bounds.len() == 3 { bounds.pop() } else { None };
                let end = bounds.pop().unwrap_or(Expr::Number(0.0));
                let start = bounds.pop().unwrap_or(Expr::Number(0.0));
                let body = self.block()?;
                Ok(Stmt::ForRange {
                    counter: names.into_iter().next().unwrap_or_default(),
                    start,
                    end,
                    step,
                    body,
                })
            }
            2 => {
                let iterator = self.expression()?;
                let body = self.block()?;
                let mut names = names.into_iter();
                Ok(Stmt::ForEach {
                    key: names.next().unwrap_or_default(),
                    value: names.next().unwrap_or_default(),
                    iterator,
                    body,
                })
            }
            _ => Err(self.error("A for loop binds one counter or a key and a value!")),
        }
    }

    fn return_statement(&mut self) -> ParseResult<Stmt> {
        let keyword = self.advance()?;
        let bare = matches!(
            self.current_token.typ,
            TokenType::RightBrace | TokenType::Semicolon | TokenType::Eof
        ) || self.current_token.line > keyword.line;
        if bare {
            Ok(Stmt::Return(None))
        } else {
            Ok(Stmt::Return(Some(self.expression()?)))
        }
    }

    fn reflect_statement(&mut self) -> ParseResult<Stmt> {
        self.advance()?;
        let path = self.string_literal()?;
        let names = if self.take_if(TokenType::DoubleColon)? {
            self.consume(TokenType::LeftBrace, "'{'")?;
            self.name_list(TokenType::RightBrace)?
        } else {
            Vec::new()
        };
        Ok(Stmt::Reflect { path, names })
    }

    fn extern_statement(&mut self) -> ParseResult<Stmt> {
        self.advance()?;
        let name = self.identifier()?;
        self.consume(TokenType::DoubleColon, "'::'")?;
        let path = self.string_literal()?;
        self.consume(TokenType::DoubleColon, "'::'")?;
        self.consume(TokenType::LeftParen, "'('")?;
        let arg_types = self.name_list(TokenType::RightParen)?;
        self.consume(TokenType::Arrow, "'->'")?;
        let return_type = self.identifier()?;
        Ok(Stmt::Extern {
            name,
            path,
            arg_types,
            return_type,
        })
    }

    fn string_literal(&mut self) -> ParseResult<String> {
        let token = self.consume(TokenType::String, "string")?;
        Ok(unescape(&token.raw))
    }

    fn expression_statement(&mut self) -> ParseResult<Stmt> {
        let target = self.expression()?;
        let compound = match self.current_token.typ {
            TokenType::Equal => None,
            TokenType::PlusEqual => Some(BinaryOp::Add),
            TokenType::MinusEqual => Some(BinaryOp::Sub),
            TokenType::StarEqual => Some(BinaryOp::Mul),
            TokenType::SlashEqual => Some(BinaryOp::Div),
            TokenType::CaretEqual => Some(BinaryOp::Pow),
            TokenType::PercentEqual => Some(BinaryOp::Mod),
            _ => return Ok(Stmt::Expr(target)),
        };
        if !is_assignable(&target) {
            return Err(self.error("Invalid assignment target!"));
        }
        self.advance()?;
        let value = self.expression()?;
        let value = match compound {
            None => value,
            Some(op) => Expr::Binary {
                op,
                left: Box::new(target.clone()),
                right: Box::new(value),
            },
        };
        Ok(Stmt::Assign { target, value })
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        self.or()
    }

    // Parses `next (op next)*` left-associatively, where `operator` maps a token to its op.
    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> ParseResult<Expr>,
        operator: fn(TokenType) -> Option<BinaryOp>,
    ) -> ParseResult<Expr> {
        let mut left = next(self)?;
        while let Some(op) = operator(self.current_token.typ) {
            self.advance()?;
            let right = next(self)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn or(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::and, |typ| match typ {
            TokenType::Or => Some(BinaryOp::Or),
            _ => None,
        })
    }

    fn and(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::comparison, |typ| match typ {
            TokenType::And => Some(BinaryOp::And),
            _ => None,
        })
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::additive, |typ| match typ {
            TokenType::EqualEqual => Some(BinaryOp::Eq),
            TokenType::BangEqual => Some(BinaryOp::NotEq),
            TokenType::Greater => Some(BinaryOp::Greater),
            TokenType::Less => Some(BinaryOp::Less),
            TokenType::GreaterEqual => Some(BinaryOp::GreaterEq),
            TokenType::LessEqual => Some(BinaryOp::LessEq),
            _ => None,
        })
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::multiplicative, |typ| match typ {
            TokenType::Plus => Some(BinaryOp::Add),
            TokenType::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::unary, |typ| match typ {
            TokenType::Star => Some(BinaryOp::Mul),
            TokenType::Slash => Some(BinaryOp::Div),
            TokenType::Percent => Some(BinaryOp::Mod),
            _ => None,
        })
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = match self.current_token.typ {
            TokenType::Minus => UnaryOp::Negate,
            TokenType::Bang => UnaryOp::Not,
            _ => return self.power(),
        };
        self.advance()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(self.unary()?),
        })
    }

    // `^` binds tighter than unary minus and groups to the right.
    fn power(&mut self) -> ParseResult<Expr> {
        let base = self.postfix()?;
        if self.take_if(TokenType::Caret)? {
            let exponent = self.unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.current_token.typ {
                TokenType::Dot => {
                    self.advance()?;
                    let name = self.identifier()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: Box::new(Expr::Str(name)),
                        computed: false,
                    };
                }
                TokenType::LeftBracket => {
                    self.advance()?;
                    let property = self.expression()?;
                    self.consume(TokenType::RightBracket, "']'")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: Box::new(property),
                        computed: true,
                    };
                }
                TokenType::LeftParen => {
                    self.advance()?;
                    let args = self.expression_list(TokenType::RightParen)?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    // Comma separated expressions up to and including `close`.
    fn expression_list(&mut self, close: TokenType) -> ParseResult<Vec<Expr>> {
        let mut exprs = Vec::new();
        if self.take_if(close)? {
            return Ok(exprs);
        }
        loop {
            exprs.push(self.expression()?);
            if self.take_if(close)? {
                return Ok(exprs);
            }
            self.consume(TokenType::Comma, "','")?;
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        match self.current_token.typ {
            TokenType::Number => {
                let number = parse_number(&self.current_token.raw)
                    .ok_or_else(|| self.error("Invalid number literal!"))?;
                self.advance()?;
                Ok(Expr::Number(number))
            }
            TokenType::String => Ok(Expr::Str(self.string_literal()?)),
            TokenType::True => {
                self.advance()?;
                Ok(Expr::Bool(true))
            }
            TokenType::False => {
                self.advance()?;
                Ok(Expr::Bool(false))
            }
            TokenType::Identifier => Ok(Expr::Identifier(self.identifier()?)),
            TokenType::LeftParen => {
                self.advance()?;
                let expr = self.expression()?; // parens reset the precedence
                self.consume(TokenType::RightParen, "')' after expression")?;
                Ok(expr)
            }
            TokenType::LeftBrace => self.table_literal(),
            TokenType::Fn => Ok(Expr::Function(Box::new(self.function()?))),
            _ => Err(self.expected("expression")),
        }
    }

    // `{ name: v, "key": v, 3: v, v }`. Entries without a key are numbered from 0.
    fn table_literal(&mut self) -> ParseResult<Expr> {
        self.consume(TokenType::LeftBrace, "'{'")?;
        let mut entries = Vec::new();
        let mut position = 0.0;
        loop {
            if self.take_if(TokenType::RightBrace)? {
                return Ok(Expr::Table(entries));
            }
            let keyed = matches!(
                self.current_token.typ,
                TokenType::Identifier | TokenType::String | TokenType::Number
            ) && self.peek_typ() == Some(TokenType::Colon);
            if keyed {
                let key = match self.current_token.typ {
                    TokenType::Identifier => Expr::Str(self.identifier()?),
                    _ => self.primary()?,
                };
                self.consume(TokenType::Colon, "':'")?;
                entries.push((key, self.expression()?));
            } else {
                entries.push((Expr::Number(position), self.expression()?));
                position += 1.0;
            }
            if !self.check(TokenType::RightBrace) {
                self.consume(TokenType::Comma, "',' or '}'")?;
            }
        }
    }
}

fn is_assignable(expr: &Expr) -> bool {
    match expr {
        Expr::Identifier(_) => true,
        Expr::Member { object, .. } => is_assignable(object),
        _ => false,
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace('_', "").parse().ok()
}

// Drops the delimiters of a raw string token and decodes backslash escapes.
fn unescape(raw: &str) -> String {
    let inner = if raw.len() >= 2 { &raw[1..raw.len() - 1] } else { "" };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Take a source of tokens and parse it into a program.
/// `origin` names the file in error messages.
pub fn parse<'a, T>(tokens: T, origin: &Path) -> Result<Program, GemError>
where
    T: Iterator<Item = Token<'a>>,
{
    let mut tokens = tokens.peekable();
    let first_token = tokens.next().unwrap_or(Token {
        typ: TokenType::Eof,
        raw: "".into(),
        line: 1,
        column: 1,
    });
    let mut parser = Parser {
        tokens,
        current_token: first_token,
        file: origin.display().to_string(),
    };
    let first = parser.current_token.clone();
    parser.lexical_check(&first)?;
    parser.program()
}
