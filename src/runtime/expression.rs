/// Sandboxed expression language for conditional nodes
///
/// Expressions are tokenized, parsed into an AST and evaluated directly over
/// JSON values. Nothing is ever compiled or executed dynamically. Supported:
/// - literals: numbers, 'single' / "double" quoted strings, true, false, null
/// - `{{node.path}}` placeholders, resolved as values against the run context
/// - bare identifiers: named variables (set_variable outputs) or node ids
/// - member access `a.b`, indexing `a[0]` / `a["key"]`, `.length`
/// - `!` / `not`, unary `-`, `* / %`, `+ -` (string concatenation when either
///   side is a string), `< <= > >= contains`, `== != === !==`, `&& and`, `|| or`

use crate::error::ExpressionError;
use crate::runtime::context::{resolve_path, stringify};
use crate::workflow::types::RunContext;
use serde_json::{Map, Number, Value};

const MAX_DEPTH: usize = 64;

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `{{path}}` placeholder resolved against the raw context
    Template(String),
    /// Bare identifier resolved against the flattened variable view
    Identifier(String),
    Member { object: Box<Expr>, property: String },
    Index { object: Box<Expr>, index: Box<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Template(String),
    Op(&'static str),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {n}"),
            Token::Str(s) => write!(f, "string '{s}'"),
            Token::Ident(name) => write!(f, "identifier '{name}'"),
            Token::Template(path) => write!(f, "placeholder '{{{{{path}}}}}'"),
            Token::Op(op) => write!(f, "'{op}'"),
        }
    }
}

// Longest operators first so `===` wins over `==`
const OPERATORS: [&str; 21] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%", "(", ")", ".", "[",
    "]",
];

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < source.len() {
        let rest = &source[pos..];
        let Some(c) = rest.chars().next() else { break };

        if c.is_whitespace() {
            pos += c.len_utf8();
            continue;
        }

        if rest.starts_with("{{") {
            let close = rest[2..].find("}}").ok_or(ExpressionError::UnterminatedTemplate(pos))?;
            tokens.push(Token::Template(rest[2..2 + close].trim().to_string()));
            pos += close + 4;
            continue;
        }

        if c.is_ascii_digit() {
            let len = number_len(rest);
            let number = rest[..len]
                .parse::<f64>()
                .map_err(|_| ExpressionError::UnexpectedChar { found: c, offset: pos })?;
            tokens.push(Token::Number(number));
            pos += len;
            continue;
        }

        if c == '\'' || c == '"' {
            let (text, consumed) = read_string(rest, c).ok_or(ExpressionError::UnterminatedString(pos))?;
            tokens.push(Token::Str(text));
            pos += consumed;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let len = rest
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'))
                .unwrap_or(rest.len());
            tokens.push(Token::Ident(rest[..len].to_string()));
            pos += len;
            continue;
        }

        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(*op));
                pos += op.len();
            }
            None => return Err(ExpressionError::UnexpectedChar { found: c, offset: pos }),
        }
    }

    Ok(tokens)
}

/// Digits with at most one fractional part; `items.0.name` keeps its dots
fn number_len(input: &str) -> usize {
    let bytes = input.as_bytes();
    let mut len = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if bytes.get(len) == Some(&b'.') && bytes.get(len + 1).is_some_and(u8::is_ascii_digit) {
        len += 1;
        len += bytes[len..].iter().take_while(|b| b.is_ascii_digit()).count();
    }
    len
}

/// Read a quoted string starting at `input[0] == quote`; returns text and bytes consumed
fn read_string(input: &str, quote: char) -> Option<(String, usize)> {
    let mut text = String::new();
    let mut chars = input.char_indices().skip(1);

    while let Some((index, ch)) = chars.next() {
        match ch {
            '\\' => {
                let (_, escaped) = chars.next()?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
            }
            ch if ch == quote => return Some((text, index + 1)),
            ch => text.push(ch),
        }
    }

    None
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(found)) if *found == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(found)) if found == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &'static str) -> Result<(), ExpressionError> {
        match self.next() {
            Some(Token::Op(found)) if found == op => Ok(()),
            Some(other) => Err(ExpressionError::UnexpectedToken {
                found: other.to_string(),
                expected: format!("'{op}'"),
            }),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.eat_op("||") || self.eat_word("or") {
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right)?;
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.equality()?;
        while self.eat_op("&&") || self.eat_word("and") {
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right)?;
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.comparison()?;
        loop {
            let op = if self.eat_op("===") {
                BinaryOp::StrictEq
            } else if self.eat_op("!==") {
                BinaryOp::StrictNotEq
            } else if self.eat_op("==") {
                BinaryOp::Eq
            } else if self.eat_op("!=") {
                BinaryOp::NotEq
            } else {
                return Ok(left);
            };
            let right = self.comparison()?;
            left = binary(op, left, right)?;
        }
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.additive()?;
        loop {
            let op = if self.eat_op("<=") {
                BinaryOp::Lte
            } else if self.eat_op(">=") {
                BinaryOp::Gte
            } else if self.eat_op("<") {
                BinaryOp::Lt
            } else if self.eat_op(">") {
                BinaryOp::Gt
            } else if self.eat_word("contains") {
                BinaryOp::Contains
            } else {
                return Ok(left);
            };
            let right = self.additive()?;
            left = binary(op, left, right)?;
        }
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_op("+") {
                BinaryOp::Add
            } else if self.eat_op("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = binary(op, left, right)?;
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinaryOp::Mul
            } else if self.eat_op("/") {
                BinaryOp::Div
            } else if self.eat_op("%") {
                BinaryOp::Rem
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = binary(op, left, right)?;
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = if self.eat_op("!") || self.eat_word("not") {
            UnaryOp::Not
        } else if self.eat_op("-") {
            UnaryOp::Negate
        } else {
            return self.postfix();
        };

        self.descend()?;
        let operand = self.unary()?;
        self.depth -= 1;
        bounded(Expr::Unary { op, operand: Box::new(operand) })
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_op(".") {
                match self.next() {
                    Some(Token::Ident(property)) => {
                        expr = bounded(Expr::Member { object: Box::new(expr), property })?;
                    }
                    Some(Token::Number(index)) if index.fract() == 0.0 => {
                        expr = bounded(Expr::Index {
                            object: Box::new(expr),
                            index: Box::new(Expr::Literal(number_value(index))),
                        })?;
                    }
                    Some(other) => {
                        return Err(ExpressionError::UnexpectedToken {
                            found: other.to_string(),
                            expected: "property name".to_string(),
                        })
                    }
                    None => return Err(ExpressionError::UnexpectedEnd),
                }
            } else if self.eat_op("[") {
                self.descend()?;
                let index = self.or()?;
                self.depth -= 1;
                self.expect_op("]")?;
                expr = bounded(Expr::Index { object: Box::new(expr), index: Box::new(index) })?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Template(path)) => Ok(Expr::Template(path)),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Identifier(name),
            }),
            Some(Token::Op("(")) => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                self.expect_op(")")?;
                Ok(inner)
            }
            Some(other) => Err(ExpressionError::UnexpectedToken {
                found: other.to_string(),
                expected: "value".to_string(),
            }),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Result<Expr, ExpressionError> {
    bounded(Expr::Binary { op, left: Box::new(left), right: Box::new(right) })
}

/// Reject trees taller than `MAX_DEPTH`. Operator chains are built iteratively
/// but evaluated (and dropped) recursively, so height is checked per node.
fn bounded(expr: Expr) -> Result<Expr, ExpressionError> {
    if height(&expr) > MAX_DEPTH {
        Err(ExpressionError::TooDeep(MAX_DEPTH))
    } else {
        Ok(expr)
    }
}

/// Children are already bounded, so this recursion is too
fn height(expr: &Expr) -> usize {
    match expr {
        Expr::Literal(_) | Expr::Template(_) | Expr::Identifier(_) => 1,
        Expr::Member { object, .. } => 1 + height(object),
        Expr::Unary { operand, .. } => 1 + height(operand),
        Expr::Index { object, index } => 1 + height(object).max(height(index)),
        Expr::Binary { left, right, .. } => 1 + height(left).max(height(right)),
    }
}

/// Parse an expression into its AST
pub fn parse_expression(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }

    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let expr = parser.or()?;

    match parser.next() {
        None => Ok(expr),
        Some(extra) => Err(ExpressionError::UnexpectedToken {
            found: extra.to_string(),
            expected: "end of expression".to_string(),
        }),
    }
}

/// Evaluate an expression against a run context
pub fn evaluate_expression(source: &str, context: &RunContext) -> Result<Value, ExpressionError> {
    let expr = parse_expression(source)?;
    let scope = Scope::new(context);
    Ok(scope.eval(&expr))
}

/// Evaluate an expression and coerce the result to a boolean
pub fn evaluate_condition(source: &str, context: &RunContext) -> Result<bool, ExpressionError> {
    evaluate_expression(source, context).map(|value| is_truthy(&value))
}

/// Variables exposed as bare identifiers: every context entry shaped like a
/// single-variable assignment `{"variable": name, "value": v}` contributes `name = v`.
pub fn flatten_variables(context: &RunContext) -> Map<String, Value> {
    let mut variables = Map::new();
    for output in context.values() {
        if let Some(Value::String(name)) = output.get("variable") {
            if let Some(value) = output.get("value") {
                variables.insert(name.clone(), value.clone());
            }
        }
    }
    variables
}

/// Evaluation scope: raw context plus the flattened variable view
struct Scope<'a> {
    context: &'a RunContext,
    variables: Map<String, Value>,
}

impl<'a> Scope<'a> {
    fn new(context: &'a RunContext) -> Self {
        Self { context, variables: flatten_variables(context) }
    }

    fn eval(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Literal(value) => value.clone(),
            Expr::Template(path) => resolve_path(path, self.context).cloned().unwrap_or(Value::Null),
            Expr::Identifier(name) => self
                .variables
                .get(name)
                .or_else(|| self.context.get(name))
                .cloned()
                .unwrap_or(Value::Null),
            Expr::Member { object, property } => member(&self.eval(object), property),
            Expr::Index { object, index } => {
                let target = self.eval(object);
                match self.eval(index) {
                    Value::String(key) => member(&target, &key),
                    Value::Number(n) => n
                        .as_u64()
                        .and_then(|i| target.as_array().and_then(|items| items.get(i as usize)))
                        .cloned()
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                }
            }
            Expr::Unary { op: UnaryOp::Not, operand } => Value::Bool(!is_truthy(&self.eval(operand))),
            Expr::Unary { op: UnaryOp::Negate, operand } => number_value(-to_number(&self.eval(operand))),
            Expr::Binary { op: BinaryOp::And, left, right } => {
                let left = self.eval(left);
                if is_truthy(&left) {
                    self.eval(right)
                } else {
                    left
                }
            }
            Expr::Binary { op: BinaryOp::Or, left, right } => {
                let left = self.eval(left);
                if is_truthy(&left) {
                    left
                } else {
                    self.eval(right)
                }
            }
            Expr::Binary { op, left, right } => apply_binary(*op, &self.eval(left), &self.eval(right)),
        }
    }
}

fn member(target: &Value, property: &str) -> Value {
    match (target, property) {
        (Value::Array(items), "length") => Value::from(items.len()),
        (Value::String(text), "length") => Value::from(text.chars().count()),
        (Value::Object(fields), key) => fields.get(key).cloned().unwrap_or(Value::Null),
        (Value::Array(items), key) => key
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Eq => Value::Bool(loose_eq(left, right)),
        BinaryOp::NotEq => Value::Bool(!loose_eq(left, right)),
        BinaryOp::StrictEq => Value::Bool(strict_eq(left, right)),
        BinaryOp::StrictNotEq => Value::Bool(!strict_eq(left, right)),
        BinaryOp::Lt => Value::Bool(compare(left, right, |o| o.is_lt())),
        BinaryOp::Lte => Value::Bool(compare(left, right, |o| o.is_le())),
        BinaryOp::Gt => Value::Bool(compare(left, right, |o| o.is_gt())),
        BinaryOp::Gte => Value::Bool(compare(left, right, |o| o.is_ge())),
        BinaryOp::Contains => Value::Bool(contains(left, right)),
        BinaryOp::Add => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                Value::String(format!("{}{}", concat_text(left), concat_text(right)))
            }
            _ => number_value(to_number(left) + to_number(right)),
        },
        BinaryOp::Sub => number_value(to_number(left) - to_number(right)),
        BinaryOp::Mul => number_value(to_number(left) * to_number(right)),
        BinaryOp::Div => number_value(to_number(left) / to_number(right)),
        BinaryOp::Rem => number_value(to_number(left) % to_number(right)),
        // Short-circuit operators are handled by the scope
        BinaryOp::And | BinaryOp::Or => Value::Null,
    }
}

/// JavaScript-style truthiness over JSON values
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(flag) => f64::from(u8::from(*flag)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(text) if text.trim().is_empty() => 0.0,
        Value::String(text) => text.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Integral results stay integers so `{{a.count}} + 1` serializes as `6`, not `6.0`
fn number_value(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Value::from(n as i64);
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn concat_text(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        other => stringify(other),
    }
}

fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            to_number(left) == to_number(right)
        }
        (Value::Bool(_), _) | (_, Value::Bool(_)) if std::mem::discriminant(left) != std::mem::discriminant(right) => {
            to_number(left) == to_number(right)
        }
        _ => strict_eq(left, right),
    }
}

fn compare(left: &Value, right: &Value, accept: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return accept(a.cmp(b));
    }
    to_number(left)
        .partial_cmp(&to_number(right))
        .map(accept)
        .unwrap_or(false)
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(text) => text.contains(&stringify(needle)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(fields) => needle.as_str().map(|key| fields.contains_key(key)).unwrap_or(false),
        _ => false,
    }
}
