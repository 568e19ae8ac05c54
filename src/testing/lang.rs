//! A miniature script language standing in for the external parser and
//! transform collaborators.
//!
//! Statements are semicolon-separated: `let` bindings, assignments,
//! expression statements, and `loop { ... }`. Expressions cover literals,
//! identifiers, `+`, member access, and calls. Small on purpose: just
//! enough surface to exercise every pipeline stage and the execution
//! contract.

use crate::error::{Diagnostic, StageFailure};
use crate::sandbox::pipeline::{Ast, AstPass, Parser, RestrictionPass, Violations};

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Number literal.
    Num(f64),
    /// String literal.
    Str(String),
    /// Identifier read.
    Ident(String),
    /// `left + right`.
    Add(Box<Expr>, Box<Expr>),
    /// `object.name`.
    Member {
        /// The object expression.
        object: Box<Expr>,
        /// The member name.
        name: String,
    },
    /// `callee(args...)`.
    Call {
        /// The callee expression.
        callee: Box<Expr>,
        /// The arguments, in order.
        args: Vec<Expr>,
    },
}

/// A statement node. Statements carry the 1-based line they start on.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let name = value`.
    Let {
        /// Bound name.
        name: String,
        /// Initializer.
        value: Expr,
        /// Source line.
        line: u32,
    },
    /// `name = value`.
    Assign {
        /// Target name.
        name: String,
        /// Assigned value.
        value: Expr,
        /// Source line.
        line: u32,
    },
    /// A bare expression; its value becomes the program's result if it is
    /// the last one executed.
    Expr {
        /// The expression.
        value: Expr,
        /// Source line.
        line: u32,
    },
    /// `loop { body }`, repeating forever.
    Loop {
        /// The loop body.
        body: Vec<Stmt>,
        /// Source line.
        line: u32,
    },
    /// A safe point inserted by the instrumentation pass; the engine
    /// honors pending pause requests here.
    Checkpoint,
}

/// A parsed program plus the pipeline bookkeeping flags the rewrite passes
/// set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Script {
    /// The statements, in order.
    pub body: Vec<Stmt>,
    /// Set by the lowering pass.
    pub lowered: bool,
    /// Set by the instrumentation pass.
    pub instrumented: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Plus,
    Eq,
    Semi,
    Dot,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Num(n) => n.to_string(),
            Tok::Str(s) => format!("\"{s}\""),
            Tok::Ident(name) => name.clone(),
            Tok::Plus => "+".to_string(),
            Tok::Eq => "=".to_string(),
            Tok::Semi => ";".to_string(),
            Tok::Dot => ".".to_string(),
            Tok::Comma => ",".to_string(),
            Tok::LParen => "(".to_string(),
            Tok::RParen => ")".to_string(),
            Tok::LBrace => "{".to_string(),
            Tok::RBrace => "}".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: u32,
    col: u32,
}

fn lex(source: &str) -> Result<(Vec<Token>, (u32, u32)), StageFailure> {
    let mut tokens = Vec::new();
    let mut line: u32 = 1;
    let mut col: u32 = 1;
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        let (tok_line, tok_col) = (line, col);
        match c {
            '\n' => {
                chars.next();
                line += 1;
                col = 1;
            }
            c if c.is_whitespace() => {
                chars.next();
                col += 1;
            }
            '0'..='9' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }
                let value: f64 = text.parse().map_err(|_| {
                    StageFailure::new(format!("Invalid number ({tok_line}:{tok_col})"))
                })?;
                tokens.push(Token {
                    tok: Tok::Num(value),
                    line: tok_line,
                    col: tok_col,
                });
            }
            '"' => {
                chars.next();
                col += 1;
                let mut text = String::new();
                let mut closed = false;
                while let Some(d) = chars.next() {
                    col += 1;
                    match d {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => {
                                text.push('\n');
                                col += 1;
                            }
                            Some(esc) => {
                                text.push(esc);
                                col += 1;
                            }
                            None => break,
                        },
                        '\n' => break,
                        other => text.push(other),
                    }
                }
                if !closed {
                    return Err(StageFailure::new(format!(
                        "Unterminated string ({tok_line}:{tok_col})"
                    )));
                }
                tokens.push(Token {
                    tok: Tok::Str(text),
                    line: tok_line,
                    col: tok_col,
                });
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        name.push(d);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    tok: Tok::Ident(name),
                    line: tok_line,
                    col: tok_col,
                });
            }
            _ => {
                let tok = match c {
                    '+' => Tok::Plus,
                    '=' => Tok::Eq,
                    ';' => Tok::Semi,
                    '.' => Tok::Dot,
                    ',' => Tok::Comma,
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    other => {
                        return Err(StageFailure::new(format!(
                            "Unexpected character '{other}' ({line}:{col})"
                        )))
                    }
                };
                chars.next();
                col += 1;
                tokens.push(Token {
                    tok,
                    line: tok_line,
                    col: tok_col,
                });
            }
        }
    }

    Ok((tokens, (line, col)))
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
    eof: (u32, u32),
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self) -> StageFailure {
        match self.peek() {
            Some(token) => StageFailure::new(format!(
                "Unexpected token '{}' ({}:{})",
                token.tok.describe(),
                token.line,
                token.col
            )),
            None => StageFailure::new(format!(
                "Unexpected end of input ({}:{})",
                self.eof.0, self.eof.1
            )),
        }
    }

    fn expect(&mut self, tok: &Tok) -> Result<Token, StageFailure> {
        match self.peek() {
            Some(token) if token.tok == *tok => Ok(self.advance().unwrap()),
            _ => Err(self.unexpected()),
        }
    }

    fn expect_ident(&mut self) -> Result<(String, u32), StageFailure> {
        match self.peek() {
            Some(Token {
                tok: Tok::Ident(_), ..
            }) => {
                let token = self.advance().unwrap();
                let Tok::Ident(name) = token.tok else {
                    unreachable!()
                };
                Ok((name, token.line))
            }
            _ => Err(self.unexpected()),
        }
    }
}

/// The reference parser. Parse failures carry a `(line:col)` suffix in
/// their message text, the shape the normalizer extracts.
pub struct ScriptParser;

impl Parser for ScriptParser {
    fn parse(&self, source: &str) -> Result<Ast, StageFailure> {
        let (tokens, eof) = lex(source)?;
        let mut cursor = Cursor {
            tokens,
            pos: 0,
            eof,
        };
        let body = parse_block(&mut cursor, false)?;
        if cursor.peek().is_some() {
            return Err(cursor.unexpected());
        }
        Ok(Ast::new(Script {
            body,
            ..Script::default()
        }))
    }
}

fn parse_block(cursor: &mut Cursor, braced: bool) -> Result<Vec<Stmt>, StageFailure> {
    let mut body = Vec::new();
    loop {
        while matches!(cursor.peek().map(|t| &t.tok), Some(Tok::Semi)) {
            cursor.advance();
        }
        match cursor.peek().map(|t| &t.tok) {
            None => break,
            Some(Tok::RBrace) if braced => break,
            _ => {}
        }
        body.push(parse_stmt(cursor)?);
        match cursor.peek().map(|t| &t.tok) {
            Some(Tok::Semi) => {
                cursor.advance();
            }
            Some(Tok::RBrace) if braced => {}
            None => {}
            _ => return Err(cursor.unexpected()),
        }
    }
    Ok(body)
}

fn parse_stmt(cursor: &mut Cursor) -> Result<Stmt, StageFailure> {
    let token = cursor.peek().ok_or_else(|| cursor.unexpected())?;
    let line = token.line;

    if let Tok::Ident(name) = &token.tok {
        match name.as_str() {
            "let" => {
                cursor.advance();
                let (name, _) = cursor.expect_ident()?;
                cursor.expect(&Tok::Eq)?;
                let value = parse_expr(cursor)?;
                return Ok(Stmt::Let { name, value, line });
            }
            "loop" => {
                cursor.advance();
                cursor.expect(&Tok::LBrace)?;
                let body = parse_block(cursor, true)?;
                cursor.expect(&Tok::RBrace)?;
                return Ok(Stmt::Loop { body, line });
            }
            _ => {
                // Assignment needs two tokens of lookahead.
                if matches!(
                    cursor.tokens.get(cursor.pos + 1).map(|t| &t.tok),
                    Some(Tok::Eq)
                ) {
                    let (name, _) = cursor.expect_ident()?;
                    cursor.expect(&Tok::Eq)?;
                    let value = parse_expr(cursor)?;
                    return Ok(Stmt::Assign { name, value, line });
                }
            }
        }
    }

    let value = parse_expr(cursor)?;
    Ok(Stmt::Expr { value, line })
}

fn parse_expr(cursor: &mut Cursor) -> Result<Expr, StageFailure> {
    let mut lhs = parse_postfix(cursor)?;
    while matches!(cursor.peek().map(|t| &t.tok), Some(Tok::Plus)) {
        cursor.advance();
        let rhs = parse_postfix(cursor)?;
        lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_postfix(cursor: &mut Cursor) -> Result<Expr, StageFailure> {
    let mut expr = parse_primary(cursor)?;
    loop {
        match cursor.peek().map(|t| &t.tok) {
            Some(Tok::Dot) => {
                cursor.advance();
                let (name, _) = cursor.expect_ident()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    name,
                };
            }
            Some(Tok::LParen) => {
                cursor.advance();
                let mut args = Vec::new();
                if !matches!(cursor.peek().map(|t| &t.tok), Some(Tok::RParen)) {
                    loop {
                        args.push(parse_expr(cursor)?);
                        match cursor.peek().map(|t| &t.tok) {
                            Some(Tok::Comma) => {
                                cursor.advance();
                            }
                            _ => break,
                        }
                    }
                }
                cursor.expect(&Tok::RParen)?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            }
            _ => break,
        }
    }
    Ok(expr)
}

fn parse_primary(cursor: &mut Cursor) -> Result<Expr, StageFailure> {
    match cursor.peek().map(|t| t.tok.clone()) {
        Some(Tok::Num(n)) => {
            cursor.advance();
            Ok(Expr::Num(n))
        }
        Some(Tok::Str(s)) => {
            cursor.advance();
            Ok(Expr::Str(s))
        }
        Some(Tok::Ident(name)) => {
            cursor.advance();
            Ok(Expr::Ident(name))
        }
        Some(Tok::LParen) => {
            cursor.advance();
            let expr = parse_expr(cursor)?;
            cursor.expect(&Tok::RParen)?;
            Ok(expr)
        }
        _ => Err(cursor.unexpected()),
    }
}

/// The reference restriction pass: rejects every `loop` statement, each
/// with the line it starts on.
pub struct DenyLoops;

impl RestrictionPass for DenyLoops {
    fn enforce(&self, ast: Ast) -> Result<Ast, Violations> {
        let mut violations = Vec::new();
        if let Some(script) = ast.downcast_ref::<Script>() {
            collect_loops(&script.body, &mut violations);
        }
        if violations.is_empty() {
            Ok(ast)
        } else {
            Err(Violations(violations))
        }
    }
}

fn collect_loops(body: &[Stmt], out: &mut Vec<Diagnostic>) {
    for stmt in body {
        if let Stmt::Loop { body, line } = stmt {
            out.push(Diagnostic::new(*line, "loop statements are not permitted"));
            collect_loops(body, out);
        }
    }
}

/// The reference lowering pass: folds constant additions so the engine
/// only ever sees simple operands.
pub struct FoldConstants;

impl AstPass for FoldConstants {
    fn apply(&self, ast: Ast) -> Result<Ast, StageFailure> {
        let mut script = ast
            .downcast::<Script>()
            .map_err(|_| StageFailure::new("lowering pass received a foreign syntax tree"))?;
        script.body = script.body.drain(..).map(fold_stmt).collect();
        script.lowered = true;
        Ok(Ast::new(*script))
    }
}

fn fold_stmt(stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::Let { name, value, line } => Stmt::Let {
            name,
            value: fold_expr(value),
            line,
        },
        Stmt::Assign { name, value, line } => Stmt::Assign {
            name,
            value: fold_expr(value),
            line,
        },
        Stmt::Expr { value, line } => Stmt::Expr {
            value: fold_expr(value),
            line,
        },
        Stmt::Loop { body, line } => Stmt::Loop {
            body: body.into_iter().map(fold_stmt).collect(),
            line,
        },
        Stmt::Checkpoint => Stmt::Checkpoint,
    }
}

fn fold_expr(expr: Expr) -> Expr {
    match expr {
        Expr::Add(lhs, rhs) => {
            let lhs = fold_expr(*lhs);
            let rhs = fold_expr(*rhs);
            if let (Expr::Num(a), Expr::Num(b)) = (&lhs, &rhs) {
                Expr::Num(a + b)
            } else {
                Expr::Add(Box::new(lhs), Box::new(rhs))
            }
        }
        Expr::Member { object, name } => Expr::Member {
            object: Box::new(fold_expr(*object)),
            name,
        },
        Expr::Call { callee, args } => Expr::Call {
            callee: Box::new(fold_expr(*callee)),
            args: args.into_iter().map(fold_expr).collect(),
        },
        leaf => leaf,
    }
}

/// The reference instrumentation pass: inserts a [`Stmt::Checkpoint`] at
/// the head of every loop body, so pause requests stay honorable inside
/// otherwise-unbounded iteration.
pub struct InsertCheckpoints;

impl AstPass for InsertCheckpoints {
    fn apply(&self, ast: Ast) -> Result<Ast, StageFailure> {
        let mut script = ast.downcast::<Script>().map_err(|_| {
            StageFailure::new("instrumentation pass received a foreign syntax tree")
        })?;
        script.body = script.body.drain(..).map(instrument_stmt).collect();
        script.instrumented = true;
        Ok(Ast::new(*script))
    }
}

fn instrument_stmt(stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::Loop { body, line } => {
            let mut instrumented = vec![Stmt::Checkpoint];
            instrumented.extend(body.into_iter().map(instrument_stmt));
            Stmt::Loop {
                body: instrumented,
                line,
            }
        }
        other => other,
    }
}
