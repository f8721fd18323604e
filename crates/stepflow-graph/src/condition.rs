//! Restricted boolean expressions for decision nodes.
//!
//! Condition text comes from user-authored workflow files, so it is parsed
//! into a small AST and interpreted over the run context. There are no
//! function calls, attribute access, or host capabilities of any kind.
//!
//! Supported:
//! - literals: `42`, `3.5`, `'text'`, `"text"`, `true`/`True`, `false`/`False`, `null`/`None`
//! - variables: bare identifiers, looked up in the context
//! - arithmetic: `+ - * / %` and unary `-` (`+` also concatenates strings)
//! - comparison: `== != < <= > >=`
//! - membership: `in`, `not in` (substring or array element)
//! - boolean: `and`/`&&`, `or`/`||`, `not`/`!`

use serde_json::{Number, Value};
use thiserror::Error;

use stepflow_core::types::ContextMap;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("condition produced {0}, expected a boolean")]
    NotBoolean(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// A compiled condition, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Compile condition text.
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let tokens = tokenize(source)?;
        if tokens.len() > MAX_TOKENS {
            return Err(EvalError::Syntax {
                position: 0,
                message: format!("condition is too long (more than {} tokens)", MAX_TOKENS),
            });
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        match parser.peek() {
            Token::Eof => Ok(Self {
                source: source.to_string(),
                expr,
            }),
            other => Err(EvalError::Syntax {
                position: parser.position(),
                message: format!("unexpected {}", other.describe()),
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate against a context; the result must be a boolean.
    pub fn evaluate(&self, context: &ContextMap) -> Result<bool, EvalError> {
        match eval(&self.expr, context)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::NotBoolean(type_name(&other).to_string())),
        }
    }
}

/// Parse and evaluate `condition` against `context` in one go.
pub fn evaluate(condition: &str, context: &ContextMap) -> Result<bool, EvalError> {
    Condition::parse(condition)?.evaluate(context)
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Number(n) => format!("number {}", n),
            Self::Str(s) => format!("string '{}'", s),
            Self::Ident(s) => format!("'{}'", s),
            Self::Op(op) => format!("'{}'", op),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::Eof => "end of input".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push((start, Token::Number(parse_number(&text, start)?)));
            continue;
        }

        if c == '\'' || c == '"' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => {
                        return Err(EvalError::Syntax {
                            position: start,
                            message: "unterminated string".to_string(),
                        })
                    }
                    Some(&q) if q == c => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars.get(i + 1).copied().ok_or(EvalError::Syntax {
                            position: i,
                            message: "dangling escape".to_string(),
                        })?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push((start, Token::Str(text)));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push((start, Token::Ident(word)));
            continue;
        }

        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let op = match two.as_str() {
            "==" => Some("=="),
            "!=" => Some("!="),
            "<=" => Some("<="),
            ">=" => Some(">="),
            "&&" => Some("&&"),
            "||" => Some("||"),
            _ => None,
        };
        if let Some(op) = op {
            tokens.push((start, Token::Op(op)));
            i += 2;
            continue;
        }

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '<' => Token::Op("<"),
            '>' => Token::Op(">"),
            '+' => Token::Op("+"),
            '-' => Token::Op("-"),
            '*' => Token::Op("*"),
            '/' => Token::Op("/"),
            '%' => Token::Op("%"),
            '!' => Token::Op("!"),
            '=' => {
                return Err(EvalError::Syntax {
                    position: start,
                    message: "single '=' is not a comparison; use '=='".to_string(),
                })
            }
            other => {
                return Err(EvalError::Syntax {
                    position: start,
                    message: format!("unexpected character '{}'", other),
                })
            }
        };
        tokens.push((start, token));
        i += 1;
    }

    tokens.push((chars.len(), Token::Eof));
    Ok(tokens)
}

fn parse_number(text: &str, position: usize) -> Result<Number, EvalError> {
    if !text.contains('.') {
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Number::from(n));
        }
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| EvalError::Syntax {
            position,
            message: format!("invalid number '{}'", text),
        })
}

// ---------------------------------------------------------------------------
// Parser (precedence climbing: or < and < not < comparison < additive <
// multiplicative < unary < primary)
// ---------------------------------------------------------------------------

/// Deepest allowed nesting of parentheses and prefix operators.
const MAX_NESTING: usize = 64;
/// Longest allowed condition; bounds the depth of operator chains too.
const MAX_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, EvalError>,
    ) -> Result<T, EvalError> {
        if self.depth >= MAX_NESTING {
            return Err(self.syntax(format!("expression nested deeper than {} levels", MAX_NESTING)));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].1
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(w) if w == word)
    }

    fn syntax(&self, message: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            position: self.position(),
            message: message.into(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.is_keyword("or") || self.peek() == &Token::Op("||") {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_not()?;
        while self.is_keyword("and") || self.peek() == &Token::Op("&&") {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if self.is_keyword("not") || self.peek() == &Token::Op("!") {
            self.advance();
            let inner = self.nested(Self::parse_not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Token::Op("==") => Some(BinaryOp::Eq),
            Token::Op("!=") => Some(BinaryOp::Ne),
            Token::Op("<") => Some(BinaryOp::Lt),
            Token::Op("<=") => Some(BinaryOp::Le),
            Token::Op(">") => Some(BinaryOp::Gt),
            Token::Op(">=") => Some(BinaryOp::Ge),
            Token::Ident(w) if w == "in" => Some(BinaryOp::In),
            Token::Ident(w) if w == "not" && matches!(self.peek_at(1), Token::Ident(n) if n == "in") => {
                Some(BinaryOp::NotIn)
            }
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.advance();
        if op == BinaryOp::NotIn {
            self.advance();
        }
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Op("+") => BinaryOp::Add,
                Token::Op("-") => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Op("*") => BinaryOp::Mul,
                Token::Op("/") => BinaryOp::Div,
                Token::Op("%") => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == &Token::Op("-") {
            self.advance();
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.nested(Self::parse_or)?;
                match self.advance() {
                    Token::RParen => Ok(inner),
                    other => Err(self.syntax(format!("expected ')', found {}", other.describe()))),
                }
            }
            Token::Ident(word) => match word.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" | "in" => {
                    Err(self.syntax(format!("unexpected keyword '{}'", word)))
                }
                _ => {
                    if self.peek() == &Token::LParen {
                        return Err(self.syntax(format!("function calls are not allowed ('{}')", word)));
                    }
                    Ok(Expr::Variable(word))
                }
            },
            other => Err(self.syntax(format!("unexpected {}", other.describe()))),
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, context: &ContextMap) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Variable(name) => context
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UndefinedVariable(name.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!expect_bool(&eval(inner, context)?, "not")?)),
        Expr::Neg(inner) => {
            let v = eval(inner, context)?;
            match &v {
                Value::Number(n) => Ok(match n.as_i64() {
                    Some(i) if i != i64::MIN => Value::from(-i),
                    _ => float(-as_f64(n)),
                }),
                other => Err(EvalError::Type(format!(
                    "cannot negate {}",
                    type_name(other)
                ))),
            }
        }
        Expr::And(l, r) => {
            if !expect_bool(&eval(l, context)?, "and")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(expect_bool(&eval(r, context)?, "and")?))
        }
        Expr::Or(l, r) => {
            if expect_bool(&eval(l, context)?, "or")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(expect_bool(&eval(r, context)?, "or")?))
        }
        Expr::Binary(op, l, r) => {
            let left = eval(l, context)?;
            let right = eval(r, context)?;
            binary(*op, &left, &right)
        }
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => as_f64(a).partial_cmp(&as_f64(b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| mismatch(op, left, right))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::In | BinaryOp::NotIn => {
            let found = match (left, right) {
                (Value::String(needle), Value::String(haystack)) => haystack.contains(needle.as_str()),
                (needle, Value::Array(items)) => items.iter().any(|item| loose_eq(needle, item)),
                (Value::String(key), Value::Object(map)) => map.contains_key(key),
                _ => return Err(mismatch(op, left, right)),
            };
            Ok(Value::Bool(if op == BinaryOp::In { found } else { !found }))
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Number(a), Value::Number(b)) => {
                Ok(int_op(a, b, i64::checked_add).unwrap_or_else(|| float(as_f64(a) + as_f64(b))))
            }
            _ => Err(mismatch(op, left, right)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Value::Number(a), Value::Number(b)) = (left, right) else {
                return Err(mismatch(op, left, right));
            };
            match op {
                BinaryOp::Sub => {
                    Ok(int_op(a, b, i64::checked_sub).unwrap_or_else(|| float(as_f64(a) - as_f64(b))))
                }
                BinaryOp::Mul => {
                    Ok(int_op(a, b, i64::checked_mul).unwrap_or_else(|| float(as_f64(a) * as_f64(b))))
                }
                _ => {
                    if as_f64(b) == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    if op == BinaryOp::Rem {
                        Ok(int_op(a, b, i64::checked_rem).unwrap_or_else(|| float(as_f64(a) % as_f64(b))))
                    } else {
                        Ok(float(as_f64(a) / as_f64(b)))
                    }
                }
            }
        }
    }
}

fn int_op(a: &Number, b: &Number, f: fn(i64, i64) -> Option<i64>) -> Option<Value> {
    f(a.as_i64()?, b.as_i64()?).map(Value::from)
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Equality across JSON types: numbers compare numerically, everything
/// else structurally. Values of different types are never equal.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => as_f64(a) == as_f64(b),
        _ => left == right,
    }
}

fn expect_bool(value: &Value, op: &str) -> Result<bool, EvalError> {
    value.as_bool().ok_or_else(|| {
        EvalError::Type(format!(
            "'{}' needs boolean operands, got {}",
            op,
            type_name(value)
        ))
    })
}

fn mismatch(op: BinaryOp, left: &Value, right: &Value) -> EvalError {
    EvalError::Type(format!(
        "unsupported operand types for '{}': {} and {}",
        op.symbol(),
        type_name(left),
        type_name(right)
    ))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
