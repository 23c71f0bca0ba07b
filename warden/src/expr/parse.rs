//! Matcher-text tokenizer and recursive-descent parser.
//!
//! Grammar (loosest binding first):
//!   expr    = and ( '||' and )*
//!   and     = rel ( '&&' rel )*
//!   rel     = add ( ('==' | '!=' | '<' | '<=' | '>' | '>=' | 'in') add )*
//!   add     = mul ( ('+' | '-') mul )*
//!   mul     = unary ( ('*' | '/' | '%') unary )*
//!   unary   = '!' unary | '-' NUMBER | postfix
//!   postfix = primary ( '.' IDENT [ '(' args ')' ] )*
//!   primary = literal | IDENT [ '(' args ')' ] | '(' expr ')' | '[' args ']'
//!
//! Attribute access produces transient `Select` nodes; `a.b(args)` produces a
//! call with a receiver, which the flattener rejects.

use std::fmt;

use super::ast::{ops, Expr, ExprKind, Value};

/// A parse error with position information.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
    /// Line number (1-based).
    pub line: usize,
    /// Column number (1-based).
    pub col: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    Uint(u64),
    Double(f64),
    Bool(bool),
    Null,
    // punctuation and operators
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

#[derive(Debug, Clone)]
struct Spanned {
    tok: Tok,
    offset: usize,
}

fn error_at(input: &str, offset: usize, message: impl Into<String>) -> ParseError {
    let mut line = 1;
    let mut col = 1;
    for b in input.as_bytes().iter().take(offset) {
        if *b == b'\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    ParseError {
        message: message.into(),
        offset,
        line,
        col,
    }
}

fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let b = bytes[i];
        let tok = match b {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                Tok::LParen
            }
            b')' => {
                i += 1;
                Tok::RParen
            }
            b'[' => {
                i += 1;
                Tok::LBracket
            }
            b']' => {
                i += 1;
                Tok::RBracket
            }
            b',' => {
                i += 1;
                Tok::Comma
            }
            b'.' => {
                i += 1;
                Tok::Dot
            }
            b'+' => {
                i += 1;
                Tok::Plus
            }
            b'-' => {
                i += 1;
                Tok::Minus
            }
            b'*' => {
                i += 1;
                Tok::Star
            }
            b'/' => {
                i += 1;
                Tok::Slash
            }
            b'%' => {
                i += 1;
                Tok::Percent
            }
            b'&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    i += 2;
                    Tok::And
                } else {
                    return Err(error_at(input, i, "expected '&&'"));
                }
            }
            b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    i += 2;
                    Tok::Or
                } else {
                    return Err(error_at(input, i, "expected '||'"));
                }
            }
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    Tok::Eq
                } else {
                    return Err(error_at(input, i, "expected '=='"));
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    Tok::Ne
                } else {
                    i += 1;
                    Tok::Not
                }
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    Tok::Le
                } else {
                    i += 1;
                    Tok::Lt
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    Tok::Ge
                } else {
                    i += 1;
                    Tok::Gt
                }
            }
            b'"' | b'\'' => {
                let (s, next) = lex_string(input, i)?;
                i = next;
                Tok::Str(s)
            }
            b'0'..=b'9' => {
                let (tok, next) = lex_number(input, i)?;
                i = next;
                tok
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                match &input[start..i] {
                    "true" => Tok::Bool(true),
                    "false" => Tok::Bool(false),
                    "null" => Tok::Null,
                    "in" => Tok::In,
                    word => Tok::Ident(word.to_string()),
                }
            }
            other => {
                return Err(error_at(
                    input,
                    i,
                    format!("unexpected character '{}'", other as char),
                ));
            }
        };
        tokens.push(Spanned { tok, offset: start });
    }

    Ok(tokens)
}

fn lex_string(input: &str, start: usize) -> Result<(String, usize), ParseError> {
    let bytes = input.as_bytes();
    let quote = bytes[start];
    let mut out = String::new();
    let mut i = start + 1;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let esc = bytes
                    .get(i + 1)
                    .ok_or_else(|| error_at(input, i, "unterminated escape"))?;
                out.push(match esc {
                    b'n' => '\n',
                    b't' => '\t',
                    b'r' => '\r',
                    b'\\' => '\\',
                    b'"' => '"',
                    b'\'' => '\'',
                    other => {
                        return Err(error_at(
                            input,
                            i,
                            format!("unknown escape '\\{}'", *other as char),
                        ));
                    }
                });
                i += 2;
            }
            b if b == quote => return Ok((out, i + 1)),
            _ => {
                // multi-byte chars pass through untouched
                let ch = input[i..].chars().next().unwrap_or('\u{fffd}');
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    Err(error_at(input, start, "unterminated string literal"))
}

fn lex_number(input: &str, start: usize) -> Result<(Tok, usize), ParseError> {
    let bytes = input.as_bytes();
    let mut i = start;
    let mut is_double = false;

    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    // a '.' only belongs to the number when followed by a digit; otherwise it
    // is attribute access on a literal, which the parser rejects later
    if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
        is_double = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        is_double = true;
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }

    let text = &input[start..i];
    if is_double {
        let v: f64 = text
            .parse()
            .map_err(|_| error_at(input, start, format!("invalid number '{text}'")))?;
        return Ok((Tok::Double(v), i));
    }
    // unsuffixed integers are int64; values past that range fall back to uint64
    if let Ok(v) = text.parse::<i64>() {
        return Ok((Tok::Int(v), i));
    }
    let v: u64 = text
        .parse()
        .map_err(|_| error_at(input, start, format!("integer '{text}' out of range")))?;
    Ok((Tok::Uint(v), i))
}

/// Parse matcher text into an expression tree.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
        next_id: 0,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        let off = parser.tokens[parser.pos].offset;
        return Err(error_at(input, off, "unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    next_id: u32,
}

impl<'a> Parser<'a> {
    fn node(&mut self, kind: ExprKind) -> Expr {
        let id = self.next_id;
        self.next_id += 1;
        Expr::new(id, kind)
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|s| &s.tok)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).map(|s| s.tok.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn err_here(&self, message: impl Into<String>) -> ParseError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|s| s.offset)
            .unwrap_or(self.input.len());
        error_at(self.input, offset, message)
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), ParseError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected {what}")))
        }
    }

    fn binary(&mut self, function: &str, lhs: Expr, rhs: Expr) -> Expr {
        self.node(ExprKind::Call {
            function: function.to_string(),
            target: None,
            args: vec![lhs, rhs],
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Tok::Or) {
            let right = self.parse_and()?;
            left = self.binary(ops::OR, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_rel()?;
        while self.eat(&Tok::And) {
            let right = self.parse_rel()?;
            left = self.binary(ops::AND, left, right);
        }
        Ok(left)
    }

    fn parse_rel(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Eq) => ops::EQ,
                Some(Tok::Ne) => ops::NE,
                Some(Tok::Lt) => ops::LT,
                Some(Tok::Le) => ops::LE,
                Some(Tok::Gt) => ops::GT,
                Some(Tok::Ge) => ops::GE,
                Some(Tok::In) => ops::IN,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_add()?;
            left = self.binary(op, left, right);
        }
    }

    fn parse_add(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => ops::ADD,
                Some(Tok::Minus) => ops::SUB,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            left = self.binary(op, left, right);
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => ops::MUL,
                Some(Tok::Slash) => ops::DIV,
                Some(Tok::Percent) => ops::REM,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = self.binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Tok::Not) {
            let inner = self.parse_unary()?;
            return Ok(self.node(ExprKind::Call {
                function: ops::NOT.to_string(),
                target: None,
                args: vec![inner],
            }));
        }
        // unary minus is only recognized on numeric literals, folded into the
        // constant
        if self.peek() == Some(&Tok::Minus) {
            self.pos += 1;
            return match self.bump() {
                Some(Tok::Int(v)) => Ok(self.node(ExprKind::Const(Value::Int(-v)))),
                Some(Tok::Double(v)) => Ok(self.node(ExprKind::Const(Value::Double(-v)))),
                _ => Err(self.err_here("'-' is only supported before a numeric literal")),
            };
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        while self.eat(&Tok::Dot) {
            let field = match self.bump() {
                Some(Tok::Ident(name)) => name,
                _ => return Err(self.err_here("expected field name after '.'")),
            };
            if self.eat(&Tok::LParen) {
                // method-call syntax parses, but flattening rejects it
                let args = self.parse_args(Tok::RParen)?;
                expr = self.node(ExprKind::Call {
                    function: field,
                    target: Some(Box::new(expr)),
                    args,
                });
            } else {
                expr = self.node(ExprKind::Select {
                    operand: Box::new(expr),
                    field,
                });
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Some(Tok::Bool(b)) => Ok(self.node(ExprKind::Const(Value::Bool(b)))),
            Some(Tok::Int(v)) => Ok(self.node(ExprKind::Const(Value::Int(v)))),
            Some(Tok::Uint(v)) => Ok(self.node(ExprKind::Const(Value::Uint(v)))),
            Some(Tok::Double(v)) => Ok(self.node(ExprKind::Const(Value::Double(v)))),
            Some(Tok::Str(s)) => Ok(self.node(ExprKind::Const(Value::Str(s)))),
            Some(Tok::Null) => Ok(self.node(ExprKind::Const(Value::Null))),
            Some(Tok::Ident(name)) => {
                if self.eat(&Tok::LParen) {
                    let args = self.parse_args(Tok::RParen)?;
                    Ok(self.node(ExprKind::Call {
                        function: name,
                        target: None,
                        args,
                    }))
                } else {
                    Ok(self.node(ExprKind::Ident(name)))
                }
            }
            Some(Tok::LParen) => {
                let expr = self.parse_or()?;
                self.expect(&Tok::RParen, "closing ')'")?;
                Ok(expr)
            }
            Some(Tok::LBracket) => {
                let elems = self.parse_args(Tok::RBracket)?;
                Ok(self.node(ExprKind::List(elems)))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.err_here("expected an expression"))
            }
        }
    }

    fn parse_args(&mut self, close: Tok) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            let what = if close == Tok::RParen {
                "closing ')'"
            } else {
                "closing ']'"
            };
            self.expect(&close, what)?;
            return Ok(args);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &str) -> Expr {
        parse(input).unwrap()
    }

    #[test]
    fn precedence_and_over_or() {
        let e = parse_ok("a || b && c");
        assert_eq!(e.to_string(), "(a || (b && c))");
    }

    #[test]
    fn equality_binds_tighter_than_and() {
        let e = parse_ok("r.sub == p.sub && r.act == p.act");
        assert_eq!(e.to_string(), "((r.sub == p.sub) && (r.act == p.act))");
    }

    #[test]
    fn select_chain() {
        let e = parse_ok("r.obj.Owner.Name");
        match &e.kind {
            ExprKind::Select { operand, field } => {
                assert_eq!(field, "Name");
                assert!(matches!(operand.kind, ExprKind::Select { .. }));
            }
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn call_with_args() {
        let e = parse_ok("keyMatch(r.obj, \"/foo/*\")");
        match &e.kind {
            ExprKind::Call {
                function,
                target,
                args,
            } => {
                assert_eq!(function, "keyMatch");
                assert!(target.is_none());
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn method_call_keeps_receiver() {
        let e = parse_ok("r.obj.startsWith(\"/x\")");
        match &e.kind {
            ExprKind::Call { target, .. } => assert!(target.is_some()),
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn list_and_in() {
        let e = parse_ok("r.act in [\"read\", \"write\"]");
        assert_eq!(e.to_string(), "(r.act in [\"read\", \"write\"])");
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_ok("42").to_string(), "42");
        assert_eq!(parse_ok("-7").to_string(), "-7");
        assert_eq!(parse_ok("1.5").to_string(), "1.5");
        assert!(matches!(
            parse_ok("18446744073709551615").kind,
            ExprKind::Const(Value::Uint(u64::MAX))
        ));
    }

    #[test]
    fn string_escapes() {
        let e = parse_ok(r#""a\"b\\c""#);
        assert!(matches!(e.kind, ExprKind::Const(Value::Str(ref s)) if s == "a\"b\\c"));
        let e = parse_ok("'single'");
        assert!(matches!(e.kind, ExprKind::Const(Value::Str(ref s)) if s == "single"));
    }

    #[test]
    fn error_carries_position() {
        let err = parse("a &&\n  ==").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.col > 1);
    }

    #[test]
    fn trailing_input_rejected() {
        assert!(parse("a b").is_err());
        assert!(parse("(a").is_err());
    }

    #[test]
    fn node_ids_are_unique() {
        let e = parse_ok("a == b && c");
        let mut ids = Vec::new();
        fn walk(e: &Expr, ids: &mut Vec<u32>) {
            ids.push(e.id);
            match &e.kind {
                ExprKind::Select { operand, .. } => walk(operand, ids),
                ExprKind::Call { target, args, .. } => {
                    if let Some(t) = target {
                        walk(t, ids);
                    }
                    args.iter().for_each(|a| walk(a, ids));
                }
                ExprKind::List(elems) => elems.iter().for_each(|a| walk(a, ids)),
                _ => {}
            }
        }
        walk(&e, &mut ids);
        let len = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), len);
    }
}
