//! Sandboxed expression evaluator.
//!
//! Evaluates a restricted JavaScript-like expression grammar over an
//! identifier-rooted scope. Supported: literals, identifiers, member access
//! (dotted and computed), unary `! + -`, logical `&& || ??`, the usual
//! binary comparisons and arithmetic, the conditional operator, array and
//! object literals, and template literals.
//!
//! Function calls, constructor calls, assignment, and update operators are
//! rejected at parse time. Identifiers resolve exclusively against the
//! provided scope; there is no global namespace. Member access on null or
//! undefined yields undefined rather than throwing, so optional chains work
//! without special syntax.

use std::collections::HashMap;

use serde_json::{Map, Number, Value};

use crate::domain::errors::{DomainError, DomainResult};

/// Evaluate `source` against `scope`, returning a JSON value.
///
/// `undefined` results collapse to JSON null at this boundary.
pub fn evaluate(source: &str, scope: &HashMap<String, Value>) -> DomainResult<Value> {
    let expr = parse(source)?;
    let out = eval(&expr, scope)?;
    Ok(out.into_json())
}

/// Evaluate and report truthiness under JavaScript rules.
pub fn evaluate_truthy(source: &str, scope: &HashMap<String, Value>) -> DomainResult<bool> {
    let expr = parse(source)?;
    Ok(eval(&expr, scope)?.truthy())
}

/// Parse-only validation, used by the DAG parser to reject bad expressions
/// before a run exists.
pub fn check(source: &str) -> DomainResult<()> {
    parse(source).map(|_| ())
}

fn err(msg: impl Into<String>) -> DomainError {
    DomainError::Expression(msg.into())
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Template(Vec<RawPart>),
    Punct(&'static str),
}

/// Template literal segment before the embedded expressions are parsed.
#[derive(Debug, Clone, PartialEq)]
enum RawPart {
    Text(String),
    Expr(String),
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            source,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn tokenize(mut self) -> DomainResult<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
            {
                tokens.push(self.number()?);
                continue;
            }
            if c == '"' || c == '\'' {
                tokens.push(Token::Str(self.quoted_string(c)?));
                continue;
            }
            if c == '`' {
                tokens.push(self.template()?);
                continue;
            }
            if c.is_alphabetic() || c == '_' || c == '$' {
                tokens.push(self.identifier());
                continue;
            }
            tokens.push(self.punct()?);
        }
        Ok(tokens)
    }

    fn number(&mut self) -> DomainResult<Token> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E')
        {
            let c = self.bump();
            // Exponent sign: 1e-5, 2E+3.
            if matches!(c, Some('e' | 'E')) && matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Token::Num)
            .map_err(|_| err(format!("invalid number literal '{text}'")))
    }

    fn quoted_string(&mut self, quote: char) -> DomainResult<String> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(err("unterminated string literal")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                    None => return Err(err("unterminated escape sequence")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn template(&mut self) -> DomainResult<Token> {
        self.bump(); // opening backtick
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(err("unterminated template literal")),
                Some('`') => {
                    if !text.is_empty() {
                        parts.push(RawPart::Text(std::mem::take(&mut text)));
                    }
                    return Ok(Token::Template(parts));
                }
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(other) => text.push(other),
                    None => return Err(err("unterminated escape sequence")),
                },
                Some('$') if self.peek() == Some('{') => {
                    self.bump(); // '{'
                    if !text.is_empty() {
                        parts.push(RawPart::Text(std::mem::take(&mut text)));
                    }
                    parts.push(RawPart::Expr(self.template_expr()?));
                }
                Some(c) => text.push(c),
            }
        }
    }

    /// Collect a `${...}` body, balancing braces and skipping quoted strings.
    fn template_expr(&mut self) -> DomainResult<String> {
        let mut depth = 1usize;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(err("unterminated template expression")),
                Some('{') => {
                    depth += 1;
                    out.push('{');
                }
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                    out.push('}');
                }
                Some(q @ ('"' | '\'')) => {
                    out.push(q);
                    loop {
                        match self.bump() {
                            None => return Err(err("unterminated string literal")),
                            Some('\\') => {
                                out.push('\\');
                                if let Some(c) = self.bump() {
                                    out.push(c);
                                }
                            }
                            Some(c) => {
                                out.push(c);
                                if c == q {
                                    break;
                                }
                            }
                        }
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn identifier(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
        {
            self.bump();
        }
        Token::Ident(self.chars[start..self.pos].iter().collect())
    }

    fn punct(&mut self) -> DomainResult<Token> {
        let rest: String = self.chars[self.pos..].iter().take(3).collect();
        // Longest match first. Assignment and update operators are rejected
        // here so they can never reach the parser.
        const THREE: &[&str] = &["===", "!=="];
        const TWO: &[&str] = &["&&", "||", "??", "==", "!=", "<=", ">="];
        const FORBIDDEN: &[&str] = &["++", "--", "=>", "+=", "-=", "*=", "/=", "%="];

        for op in FORBIDDEN {
            if rest.starts_with(op) {
                return Err(err(format!("operator '{op}' is not allowed")));
            }
        }
        for op in THREE {
            if rest.starts_with(op) {
                self.pos += 3;
                return Ok(Token::Punct(op));
            }
        }
        for op in TWO {
            if rest.starts_with(op) {
                self.pos += 2;
                return Ok(Token::Punct(op));
            }
        }
        let Some(single) = self.bump() else {
            return Err(err("unexpected end of expression"));
        };
        let op: &'static str = match single {
            '(' => "(",
            ')' => ")",
            '[' => "[",
            ']' => "]",
            '{' => "{",
            '}' => "}",
            ',' => ",",
            ':' => ":",
            '.' => ".",
            '?' => "?",
            '!' => "!",
            '<' => "<",
            '>' => ">",
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '%' => "%",
            '=' => return Err(err("assignment is not allowed")),
            other => {
                return Err(err(format!(
                    "unexpected character '{other}' in expression '{}'",
                    self.source
                )))
            }
        };
        Ok(Token::Punct(op))
    }
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Undefined,
    Identifier(String),
    Member {
        object: Box<Expr>,
        property: MemberProp,
    },
    Unary {
        op: &'static str,
        operand: Box<Expr>,
    },
    Logical {
        op: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Binary {
        op: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Template(Vec<TemplatePart>),
}

#[derive(Debug, Clone, PartialEq)]
enum MemberProp {
    Named(String),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum TemplatePart {
    Text(String),
    Expr(Box<Expr>),
}

fn parse(source: &str) -> DomainResult<Expr> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.conditional()?;
    if parser.pos != parser.tokens.len() {
        return Err(err(format!(
            "unexpected trailing input in expression '{source}'"
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, punct: &str) -> bool {
        if self.peek() == Some(&Token::Punct(lookup_punct(punct))) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> DomainResult<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(err(format!("expected '{punct}'")))
        }
    }

    fn conditional(&mut self) -> DomainResult<Expr> {
        let cond = self.nullish()?;
        if self.eat("?") {
            let then = self.conditional()?;
            self.expect(":")?;
            let otherwise = self.conditional()?;
            return Ok(Expr::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn nullish(&mut self) -> DomainResult<Expr> {
        let mut left = self.logical_or()?;
        while self.eat("??") {
            let right = self.logical_or()?;
            left = Expr::Logical {
                op: "??",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn logical_or(&mut self) -> DomainResult<Expr> {
        let mut left = self.logical_and()?;
        while self.eat("||") {
            let right = self.logical_and()?;
            left = Expr::Logical {
                op: "||",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn logical_and(&mut self) -> DomainResult<Expr> {
        let mut left = self.equality()?;
        while self.eat("&&") {
            let right = self.equality()?;
            left = Expr::Logical {
                op: "&&",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> DomainResult<Expr> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct(op @ ("==" | "!=" | "===" | "!=="))) => *op,
                _ => break,
            };
            self.pos += 1;
            let right = self.relational()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn relational(&mut self) -> DomainResult<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct(op @ ("<" | "<=" | ">" | ">="))) => *op,
                _ => break,
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn additive(&mut self) -> DomainResult<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct(op @ ("+" | "-"))) => *op,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> DomainResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct(op @ ("*" | "/" | "%"))) => *op,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> DomainResult<Expr> {
        let op = match self.peek() {
            Some(Token::Punct(op @ ("!" | "+" | "-"))) => *op,
            _ => return self.postfix(),
        };
        self.pos += 1;
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> DomainResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(".") {
                match self.bump() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Member {
                            object: Box::new(expr),
                            property: MemberProp::Named(name),
                        };
                    }
                    _ => return Err(err("expected property name after '.'")),
                }
            } else if self.eat("[") {
                let index = self.conditional()?;
                self.expect("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberProp::Computed(Box::new(index)),
                };
            } else if self.peek() == Some(&Token::Punct("(")) {
                return Err(err("function calls are not allowed"));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> DomainResult<Expr> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Template(parts)) => {
                let mut out = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        RawPart::Text(t) => out.push(TemplatePart::Text(t)),
                        RawPart::Expr(src) => out.push(TemplatePart::Expr(Box::new(parse(&src)?))),
                    }
                }
                Ok(Expr::Template(out))
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "undefined" => Ok(Expr::Undefined),
                "new" => Err(err("constructor calls are not allowed")),
                "function" => Err(err("function expressions are not allowed")),
                _ => Ok(Expr::Identifier(name)),
            },
            Some(Token::Punct("(")) => {
                let inner = self.conditional()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => {
                let mut items = Vec::new();
                if !self.eat("]") {
                    loop {
                        items.push(self.conditional()?);
                        if self.eat("]") {
                            break;
                        }
                        self.expect(",")?;
                        // Trailing comma.
                        if self.eat("]") {
                            break;
                        }
                    }
                }
                Ok(Expr::Array(items))
            }
            Some(Token::Punct("{")) => {
                let mut entries = Vec::new();
                if !self.eat("}") {
                    loop {
                        let key = match self.bump() {
                            Some(Token::Ident(name)) => name,
                            Some(Token::Str(s)) => s,
                            _ => return Err(err("expected object key")),
                        };
                        self.expect(":")?;
                        entries.push((key, self.conditional()?));
                        if self.eat("}") {
                            break;
                        }
                        self.expect(",")?;
                        if self.eat("}") {
                            break;
                        }
                    }
                }
                Ok(Expr::Object(entries))
            }
            Some(other) => Err(err(format!("unexpected token {other:?}"))),
            None => Err(err("empty expression")),
        }
    }
}

fn lookup_punct(p: &str) -> &'static str {
    const ALL: &[&str] = &[
        "(", ")", "[", "]", "{", "}", ",", ":", ".", "?", "!", "<", ">", "+", "-", "*", "/", "%",
        "&&", "||", "??", "==", "!=", "<=", ">=", "===", "!==",
    ];
    ALL.iter().find(|s| **s == p).copied().unwrap_or("")
}

/// Whole-valued results render as integers (`3`, not `3.0`), matching how
/// the expressions read in configuration files.
#[allow(clippy::cast_possible_truncation)]
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

// ============================================================================
// Evaluation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum EvalValue {
    Undefined,
    Json(Value),
}

impl EvalValue {
    fn into_json(self) -> Value {
        match self {
            Self::Undefined => Value::Null,
            Self::Json(v) => v,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Self::Undefined => false,
            Self::Json(Value::Null) => false,
            Self::Json(Value::Bool(b)) => *b,
            Self::Json(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
            Self::Json(Value::String(s)) => !s.is_empty(),
            Self::Json(Value::Array(_) | Value::Object(_)) => true,
        }
    }

    fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Json(Value::Null))
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Undefined => None,
            Self::Json(Value::Number(n)) => n.as_f64(),
            Self::Json(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Json(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Self::Json(Value::Null) => Some(0.0),
            _ => None,
        }
    }

    fn display_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Json(Value::String(s)) => s.clone(),
            Self::Json(other) => other.to_string(),
        }
    }
}

fn eval(expr: &Expr, scope: &HashMap<String, Value>) -> DomainResult<EvalValue> {
    match expr {
        Expr::Literal(v) => Ok(EvalValue::Json(v.clone())),
        Expr::Undefined => Ok(EvalValue::Undefined),
        Expr::Identifier(name) => scope
            .get(name)
            .cloned()
            .map(EvalValue::Json)
            .ok_or_else(|| err(format!("unknown identifier '{name}'"))),
        Expr::Member { object, property } => {
            let obj = eval(object, scope)?;
            if obj.is_nullish() {
                return Ok(EvalValue::Undefined);
            }
            let key = match property {
                MemberProp::Named(name) => EvalValue::Json(Value::String(name.clone())),
                MemberProp::Computed(index) => eval(index, scope)?,
            };
            Ok(member(&obj, &key))
        }
        Expr::Unary { op, operand } => {
            let value = eval(operand, scope)?;
            match *op {
                "!" => Ok(EvalValue::Json(Value::Bool(!value.truthy()))),
                "+" => value
                    .as_number()
                    .map(|n| EvalValue::Json(number_value(n)))
                    .ok_or_else(|| err("unary '+' on non-numeric value")),
                "-" => value
                    .as_number()
                    .map(|n| EvalValue::Json(number_value(-n)))
                    .ok_or_else(|| err("unary '-' on non-numeric value")),
                _ => Err(err(format!("unknown unary operator '{op}'"))),
            }
        }
        Expr::Logical { op, left, right } => {
            let lhs = eval(left, scope)?;
            match *op {
                "&&" => {
                    if lhs.truthy() {
                        eval(right, scope)
                    } else {
                        Ok(lhs)
                    }
                }
                "||" => {
                    if lhs.truthy() {
                        Ok(lhs)
                    } else {
                        eval(right, scope)
                    }
                }
                "??" => {
                    if lhs.is_nullish() {
                        eval(right, scope)
                    } else {
                        Ok(lhs)
                    }
                }
                _ => Err(err(format!("unknown logical operator '{op}'"))),
            }
        }
        Expr::Binary { op, left, right } => {
            let lhs = eval(left, scope)?;
            let rhs = eval(right, scope)?;
            binary(op, &lhs, &rhs)
        }
        Expr::Conditional {
            cond,
            then,
            otherwise,
        } => {
            if eval(cond, scope)?.truthy() {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, scope)?.into_json());
            }
            Ok(EvalValue::Json(Value::Array(out)))
        }
        Expr::Object(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), eval(value, scope)?.into_json());
            }
            Ok(EvalValue::Json(Value::Object(map)))
        }
        Expr::Template(parts) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    TemplatePart::Text(t) => out.push_str(t),
                    TemplatePart::Expr(e) => {
                        let v = eval(e, scope)?;
                        if !v.is_nullish() {
                            out.push_str(&v.display_string());
                        }
                    }
                }
            }
            Ok(EvalValue::Json(Value::String(out)))
        }
    }
}

fn member(obj: &EvalValue, key: &EvalValue) -> EvalValue {
    let EvalValue::Json(obj) = obj else {
        return EvalValue::Undefined;
    };
    match obj {
        Value::Object(map) => {
            let key = key.display_string();
            map.get(&key)
                .cloned()
                .map_or(EvalValue::Undefined, EvalValue::Json)
        }
        Value::Array(items) => {
            if let EvalValue::Json(Value::String(s)) = key {
                if s == "length" {
                    return EvalValue::Json(Value::Number(items.len().into()));
                }
            }
            key.as_number()
                .and_then(|n| {
                    if n.fract() == 0.0 && n >= 0.0 {
                        items.get(n as usize)
                    } else {
                        None
                    }
                })
                .cloned()
                .map_or(EvalValue::Undefined, EvalValue::Json)
        }
        Value::String(s) => {
            if key.display_string() == "length" {
                EvalValue::Json(Value::Number(s.chars().count().into()))
            } else {
                EvalValue::Undefined
            }
        }
        _ => EvalValue::Undefined,
    }
}

fn binary(op: &str, lhs: &EvalValue, rhs: &EvalValue) -> DomainResult<EvalValue> {
    let bool_val = |b: bool| Ok(EvalValue::Json(Value::Bool(b)));
    match op {
        "===" => bool_val(strict_eq(lhs, rhs)),
        "!==" => bool_val(!strict_eq(lhs, rhs)),
        "==" => bool_val(loose_eq(lhs, rhs)),
        "!=" => bool_val(!loose_eq(lhs, rhs)),
        "<" | "<=" | ">" | ">=" => {
            let ord = compare(lhs, rhs)
                .ok_or_else(|| err(format!("cannot compare values with '{op}'")))?;
            let result = match op {
                "<" => ord.is_lt(),
                "<=" => ord.is_le(),
                ">" => ord.is_gt(),
                _ => ord.is_ge(),
            };
            bool_val(result)
        }
        "+" => {
            // Numeric addition when both sides are numbers, string
            // concatenation otherwise.
            if let (EvalValue::Json(Value::Number(a)), EvalValue::Json(Value::Number(b))) =
                (lhs, rhs)
            {
                let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
                return Ok(EvalValue::Json(number_value(sum)));
            }
            Ok(EvalValue::Json(Value::String(format!(
                "{}{}",
                lhs.display_string(),
                rhs.display_string()
            ))))
        }
        "-" | "*" | "/" | "%" => {
            let a = lhs
                .as_number()
                .ok_or_else(|| err(format!("left operand of '{op}' is not numeric")))?;
            let b = rhs
                .as_number()
                .ok_or_else(|| err(format!("right operand of '{op}' is not numeric")))?;
            let out = match op {
                "-" => a - b,
                "*" => a * b,
                "/" => a / b,
                _ => a % b,
            };
            Ok(EvalValue::Json(number_value(out)))
        }
        _ => Err(err(format!("unknown binary operator '{op}'"))),
    }
}

fn strict_eq(lhs: &EvalValue, rhs: &EvalValue) -> bool {
    match (lhs, rhs) {
        (EvalValue::Undefined, EvalValue::Undefined) => true,
        (EvalValue::Json(a), EvalValue::Json(b)) => {
            if let (Value::Number(x), Value::Number(y)) = (a, b) {
                // 8 and 8.0 are the same number regardless of representation.
                return x.as_f64() == y.as_f64();
            }
            same_kind(a, b) && a == b
        }
        _ => false,
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

fn loose_eq(lhs: &EvalValue, rhs: &EvalValue) -> bool {
    if lhs.is_nullish() && rhs.is_nullish() {
        return true;
    }
    if lhs.is_nullish() || rhs.is_nullish() {
        return false;
    }
    if strict_eq(lhs, rhs) {
        return true;
    }
    // Mixed-kind numeric coercion (number vs string/boolean).
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        let both_strings = matches!(
            (lhs, rhs),
            (
                EvalValue::Json(Value::String(_)),
                EvalValue::Json(Value::String(_))
            )
        );
        if !both_strings {
            return a == b;
        }
    }
    false
}

fn compare(lhs: &EvalValue, rhs: &EvalValue) -> Option<std::cmp::Ordering> {
    if let (EvalValue::Json(Value::String(a)), EvalValue::Json(Value::String(b))) = (lhs, rhs) {
        return Some(a.cmp(b));
    }
    let a = lhs.as_number()?;
    let b = rhs.as_number()?;
    a.partial_cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_literals_and_arithmetic() {
        let s = scope(&[]);
        assert_eq!(evaluate("1 + 2 * 3", &s).unwrap(), json!(7));
        assert_eq!(evaluate("(1 + 2) * 3", &s).unwrap(), json!(9));
        assert_eq!(evaluate("10 % 3", &s).unwrap(), json!(1));
        assert_eq!(evaluate("7 / 2", &s).unwrap(), json!(3.5));
        assert_eq!(evaluate("-4", &s).unwrap(), json!(-4));
        assert_eq!(evaluate("'a' + 'b'", &s).unwrap(), json!("ab"));
        assert_eq!(evaluate("'n=' + 3", &s).unwrap(), json!("n=3"));
    }

    #[test]
    fn test_identifiers_resolve_only_from_scope() {
        let s = scope(&[("value", json!(5))]);
        assert_eq!(evaluate("value + 1", &s).unwrap(), json!(6));
        assert!(evaluate("process", &s).is_err());
        assert!(evaluate("globalThis", &s).is_err());
        assert!(evaluate("Math", &s).is_err());
    }

    #[test]
    fn test_member_access() {
        let s = scope(&[(
            "outputs",
            json!({"report": {"score": 8}, "tags": ["a", "b"]}),
        )]);
        assert_eq!(evaluate("outputs.report.score", &s).unwrap(), json!(8));
        assert_eq!(evaluate("outputs.tags[1]", &s).unwrap(), json!("b"));
        assert_eq!(evaluate("outputs.tags.length", &s).unwrap(), json!(2));
        assert_eq!(evaluate("outputs['report']['score']", &s).unwrap(), json!(8));
    }

    #[test]
    fn test_member_access_on_nullish_yields_undefined() {
        let s = scope(&[("inputs", json!({"a": null}))]);
        // Chains through null/undefined do not throw.
        assert_eq!(evaluate("inputs.a.b.c", &s).unwrap(), Value::Null);
        assert_eq!(evaluate("inputs.missing.deep", &s).unwrap(), Value::Null);
        assert_eq!(
            evaluate("inputs.missing ?? 'fallback'", &s).unwrap(),
            json!("fallback")
        );
    }

    #[test]
    fn test_logical_operators_return_values() {
        let s = scope(&[("x", json!(0)), ("y", json!("hit"))]);
        assert_eq!(evaluate("x || y", &s).unwrap(), json!("hit"));
        assert_eq!(evaluate("y && x", &s).unwrap(), json!(0));
        assert_eq!(evaluate("x ?? y", &s).unwrap(), json!(0));
        assert_eq!(evaluate("null ?? y", &s).unwrap(), json!("hit"));
    }

    #[test]
    fn test_equality() {
        let s = scope(&[]);
        assert_eq!(evaluate("1 == '1'", &s).unwrap(), json!(true));
        assert_eq!(evaluate("1 === '1'", &s).unwrap(), json!(false));
        assert_eq!(evaluate("null == undefined", &s).unwrap(), json!(true));
        assert_eq!(evaluate("null === undefined", &s).unwrap(), json!(false));
        assert_eq!(evaluate("'a' != 'b'", &s).unwrap(), json!(true));
    }

    #[test]
    fn test_conditional() {
        let s = scope(&[("n", json!(3))]);
        assert_eq!(evaluate("n > 2 ? 'big' : 'small'", &s).unwrap(), json!("big"));
        assert_eq!(
            evaluate("n > 5 ? 'big' : n > 1 ? 'mid' : 'small'", &s).unwrap(),
            json!("mid")
        );
    }

    #[test]
    fn test_array_and_object_literals() {
        let s = scope(&[("v", json!(2))]);
        assert_eq!(evaluate("[1, v, v * 2]", &s).unwrap(), json!([1, 2, 4]));
        assert_eq!(
            evaluate("{a: 1, 'b': v}", &s).unwrap(),
            json!({"a": 1, "b": 2})
        );
    }

    #[test]
    fn test_template_literals() {
        let s = scope(&[("value", json!({"name": "skelo", "n": 2}))]);
        assert_eq!(
            evaluate("`hello ${value.name} x${value.n}`", &s).unwrap(),
            json!("hello skelo x2")
        );
        assert_eq!(
            evaluate("`${value.n > 1 ? 'many' : 'one'}`", &s).unwrap(),
            json!("many")
        );
    }

    #[test]
    fn test_forbidden_constructs_fail_closed() {
        let s = scope(&[("f", json!(1)), ("x", json!(1))]);
        assert!(evaluate("f()", &s).is_err());
        assert!(evaluate("x.toString()", &s).is_err());
        assert!(evaluate("new Date", &s).is_err());
        assert!(evaluate("x = 2", &s).is_err());
        assert!(evaluate("x += 2", &s).is_err());
        assert!(evaluate("x++", &s).is_err());
        assert!(evaluate("--x", &s).is_err());
        assert!(evaluate("() => 1", &s).is_err());
        assert!(evaluate("function f() {}", &s).is_err());
    }

    #[test]
    fn test_truthiness() {
        let s = scope(&[("empty", json!("")), ("obj", json!({}))]);
        assert!(!evaluate_truthy("empty", &s).unwrap());
        assert!(!evaluate_truthy("0", &s).unwrap());
        assert!(!evaluate_truthy("null", &s).unwrap());
        assert!(!evaluate_truthy("undefined", &s).unwrap());
        assert!(evaluate_truthy("obj", &s).unwrap());
        assert!(evaluate_truthy("'x'", &s).unwrap());
        assert!(evaluate_truthy("!0", &s).unwrap());
    }
}
