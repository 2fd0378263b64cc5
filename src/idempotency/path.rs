//! A small JMESPath-style expression language used to pick the parts of a
//! payload that identify a request.
//!
//! Supported forms:
//!
//! - field access: `body.order.id`, quoted: `headers."X-Idempotency-Key"`
//! - indices: `items[0]`, `items[-1]`
//! - list projection: `items[*].sku`
//! - multi-select list: `[user_id, order.id]`, also after a dot
//! - multi-select hash: `{user: user_id, order: order.id}`
//! - the current node: `@`
//! - `powertools_json(expr)`: decodes a string holding JSON, so
//!   `powertools_json(body).order_id` reads into an API Gateway body.

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path expression")]
    Empty,

    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated quoted identifier starting at position {pos}")]
    UnterminatedQuote { pos: usize },

    #[error("unexpected {found} at position {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown function {0}()")]
    UnknownFunction(String),

    #[error("{name}() takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("{name}() {reason}")]
    InvalidArgument { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Quoted(String),
    Number(i64),
    Dot,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Colon,
    Star,
    At,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier '{}'", s),
            Token::Quoted(s) => write!(f, "identifier \"{}\"", s),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Dot => f.write_str("'.'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::LBrace => f.write_str("'{'"),
            Token::RBrace => f.write_str("'}'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::Colon => f.write_str("':'"),
            Token::Star => f.write_str("'*'"),
            Token::At => f.write_str("'@'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, PathError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' | '[' | ']' | '{' | '}' | '(' | ')' | ',' | ':' | '*' | '@' => {
                chars.next();
                let token = match ch {
                    '.' => Token::Dot,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    ':' => Token::Colon,
                    '*' => Token::Star,
                    _ => Token::At,
                };
                tokens.push((token, pos));
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(PathError::UnterminatedQuote { pos });
                }
                tokens.push((Token::Quoted(value), pos));
            }
            c if c == '-' || c.is_ascii_digit() => {
                let mut literal = String::new();
                literal.push(c);
                chars.next();
                while let Some(&(_, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    literal.push(d);
                    chars.next();
                }
                let number = literal
                    .parse::<i64>()
                    .map_err(|_| PathError::UnexpectedChar { ch: c, pos })?;
                tokens.push((Token::Number(number), pos));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !(d.is_alphanumeric() || d == '_') {
                        break;
                    }
                    ident.push(d);
                    chars.next();
                }
                tokens.push((Token::Ident(ident), pos));
            }
            other => return Err(PathError::UnexpectedChar { ch: other, pos }),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    PowertoolsJson,
}

impl Function {
    fn lookup(name: &str) -> Result<Self, PathError> {
        match name {
            "powertools_json" => Ok(Function::PowertoolsJson),
            other => Err(PathError::UnknownFunction(other.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Function::PowertoolsJson => "powertools_json",
        }
    }

    fn arity(&self) -> usize {
        match self {
            Function::PowertoolsJson => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Index(i64),
    Project,
    MultiList(Vec<Vec<Step>>),
    MultiHash(Vec<(String, Vec<Step>)>),
    Call(Function, Vec<Vec<Step>>),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<(Token, usize), PathError> {
        let token = self
            .tokens
            .get(self.cursor)
            .cloned()
            .ok_or(PathError::UnexpectedEnd)?;
        self.cursor += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), PathError> {
        let (token, pos) = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(PathError::UnexpectedToken {
                found: token.to_string(),
                pos,
            })
        }
    }

    fn chain(&mut self) -> Result<Vec<Step>, PathError> {
        let mut steps = Vec::new();
        self.head(&mut steps)?;

        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.cursor += 1;
                    self.after_dot(&mut steps)?;
                }
                Some(Token::LBracket) => {
                    self.cursor += 1;
                    self.bracket(&mut steps)?;
                }
                _ => break,
            }
        }

        Ok(steps)
    }

    fn head(&mut self, steps: &mut Vec<Step>) -> Result<(), PathError> {
        let (token, pos) = self.next()?;
        match token {
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.cursor += 1;
                    steps.push(self.call(&name)?);
                } else {
                    steps.push(Step::Field(name));
                }
            }
            Token::Quoted(name) => steps.push(Step::Field(name)),
            Token::At => {}
            Token::LBracket => self.bracket(steps)?,
            Token::LBrace => steps.push(self.multi_hash()?),
            other => {
                return Err(PathError::UnexpectedToken {
                    found: other.to_string(),
                    pos,
                })
            }
        }
        Ok(())
    }

    fn after_dot(&mut self, steps: &mut Vec<Step>) -> Result<(), PathError> {
        let (token, pos) = self.next()?;
        match token {
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.cursor += 1;
                    steps.push(self.call(&name)?);
                } else {
                    steps.push(Step::Field(name));
                }
            }
            Token::Quoted(name) => steps.push(Step::Field(name)),
            Token::LBracket => steps.push(self.multi_list()?),
            Token::LBrace => steps.push(self.multi_hash()?),
            other => {
                return Err(PathError::UnexpectedToken {
                    found: other.to_string(),
                    pos,
                })
            }
        }
        Ok(())
    }

    // Called with the opening '[' already consumed.
    fn bracket(&mut self, steps: &mut Vec<Step>) -> Result<(), PathError> {
        match self.peek() {
            Some(Token::Number(n)) => {
                let index = *n;
                self.cursor += 1;
                self.expect(Token::RBracket)?;
                steps.push(Step::Index(index));
            }
            Some(Token::Star) => {
                self.cursor += 1;
                self.expect(Token::RBracket)?;
                steps.push(Step::Project);
            }
            _ => steps.push(self.multi_list()?),
        }
        Ok(())
    }

    fn multi_list(&mut self) -> Result<Step, PathError> {
        let mut items = vec![self.chain()?];
        while self.peek() == Some(&Token::Comma) {
            self.cursor += 1;
            items.push(self.chain()?);
        }
        self.expect(Token::RBracket)?;
        Ok(Step::MultiList(items))
    }

    fn multi_hash(&mut self) -> Result<Step, PathError> {
        let mut entries = Vec::new();
        loop {
            let (token, pos) = self.next()?;
            let key = match token {
                Token::Ident(k) | Token::Quoted(k) => k,
                other => {
                    return Err(PathError::UnexpectedToken {
                        found: other.to_string(),
                        pos,
                    })
                }
            };
            self.expect(Token::Colon)?;
            entries.push((key, self.chain()?));

            let (token, pos) = self.next()?;
            match token {
                Token::Comma => continue,
                Token::RBrace => break,
                other => {
                    return Err(PathError::UnexpectedToken {
                        found: other.to_string(),
                        pos,
                    })
                }
            }
        }
        Ok(Step::MultiHash(entries))
    }

    // Called with the opening '(' already consumed.
    fn call(&mut self, name: &str) -> Result<Step, PathError> {
        let function = Function::lookup(name)?;
        let mut args = Vec::new();

        if self.peek() != Some(&Token::RParen) {
            args.push(self.chain()?);
            while self.peek() == Some(&Token::Comma) {
                self.cursor += 1;
                args.push(self.chain()?);
            }
        }
        self.expect(Token::RParen)?;

        if args.len() != function.arity() {
            return Err(PathError::Arity {
                name: function.name().to_string(),
                expected: function.arity(),
                got: args.len(),
            });
        }

        Ok(Step::Call(function, args))
    }
}

/// A parsed path expression, ready to be applied to any number of payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpression {
    source: String,
    steps: Vec<Step>,
}

impl PathExpression {
    pub fn parse(source: &str) -> Result<Self, PathError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(PathError::Empty);
        }

        let mut parser = Parser { tokens, cursor: 0 };
        let steps = parser.chain()?;

        if let Some((token, pos)) = parser.tokens.get(parser.cursor) {
            return Err(PathError::UnexpectedToken {
                found: token.to_string(),
                pos: *pos,
            });
        }

        Ok(Self {
            source: source.to_string(),
            steps,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Applies the expression to `payload`. Missing fields yield `Value::Null`.
    pub fn search(&self, payload: &Value) -> Result<Value, PathError> {
        evaluate(&self.steps, payload)
    }
}

impl FromStr for PathExpression {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathExpression::parse(s)
    }
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn evaluate(steps: &[Step], current: &Value) -> Result<Value, PathError> {
    let Some((step, rest)) = steps.split_first() else {
        return Ok(current.clone());
    };

    match step {
        Step::Field(name) => match current.as_object().and_then(|m| m.get(name)) {
            Some(child) => evaluate(rest, child),
            None => Ok(Value::Null),
        },
        Step::Index(index) => {
            let Some(items) = current.as_array() else {
                return Ok(Value::Null);
            };
            let resolved = if *index < 0 {
                items.len().checked_sub(index.unsigned_abs() as usize)
            } else {
                Some(*index as usize)
            };
            match resolved.and_then(|i| items.get(i)) {
                Some(child) => evaluate(rest, child),
                None => Ok(Value::Null),
            }
        }
        Step::Project => {
            let Some(items) = current.as_array() else {
                return Ok(Value::Null);
            };
            let mut projected = Vec::with_capacity(items.len());
            for item in items {
                let value = evaluate(rest, item)?;
                if !value.is_null() {
                    projected.push(value);
                }
            }
            Ok(Value::Array(projected))
        }
        Step::MultiList(exprs) => {
            if current.is_null() {
                return Ok(Value::Null);
            }
            let values = exprs
                .iter()
                .map(|e| evaluate(e, current))
                .collect::<Result<Vec<_>, _>>()?;
            evaluate(rest, &Value::Array(values))
        }
        Step::MultiHash(entries) => {
            if current.is_null() {
                return Ok(Value::Null);
            }
            let mut object = Map::new();
            for (key, expr) in entries {
                object.insert(key.clone(), evaluate(expr, current)?);
            }
            evaluate(rest, &Value::Object(object))
        }
        Step::Call(function, args) => {
            let arguments = args
                .iter()
                .map(|a| evaluate(a, current))
                .collect::<Result<Vec<_>, _>>()?;
            let result = apply(*function, &arguments)?;
            evaluate(rest, &result)
        }
    }
}

fn apply(function: Function, arguments: &[Value]) -> Result<Value, PathError> {
    match function {
        Function::PowertoolsJson => match arguments.first() {
            Some(Value::String(encoded)) => {
                serde_json::from_str(encoded).map_err(|e| PathError::InvalidArgument {
                    name: function.name().to_string(),
                    reason: format!("received a string that is not valid JSON: {}", e),
                })
            }
            Some(other) => Err(PathError::InvalidArgument {
                name: function.name().to_string(),
                reason: format!("expects a string, got {}", json_type(other)),
            }),
            None => Err(PathError::Arity {
                name: function.name().to_string(),
                expected: 1,
                got: 0,
            }),
        },
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
