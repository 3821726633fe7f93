//! `{{ ... }}` expressions inside node parameters.
//!
//! Resolution is a pure function of the parameters and an
//! [`ExpressionContext`]; nothing is read from outside the context.

use crate::static_data::StaticDataSnapshot;
use crate::value::ValueExt;
use crate::ExpressionError;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

static NULL: Value = Value::Null;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Everything an expression may observe while resolving one node.
#[derive(Debug, Clone, Copy)]
pub struct ExpressionContext<'a> {
    /// Node whose parameters are being resolved.
    pub node: &'a str,
    /// Value bound to `$json` / `$input`.
    pub json: &'a Value,
    /// Main output of every node that already produced one in this run.
    pub outputs: &'a HashMap<String, Value>,
    /// Data ancestors of `node`; only these may be referenced.
    pub ancestors: &'a HashSet<String>,
    pub static_data: &'a StaticDataSnapshot,
    /// Pinned outputs, preferred over live outputs.
    pub pin_data: &'a HashMap<String, Value>,
}

impl ExpressionContext<'_> {
    fn node_output(&self, name: &str, expression: &str) -> Result<&Value, ExpressionError> {
        let unresolved = || ExpressionError::UnresolvedReference {
            node: name.to_string(),
            reference: expression.trim().to_string(),
        };
        if !self.ancestors.contains(name) {
            return Err(unresolved());
        }
        self.pin_data
            .get(name)
            .or_else(|| self.outputs.get(name))
            .ok_or_else(unresolved)
    }

    fn static_value(&self) -> Value {
        Value::Object(
            self.static_data
                .iter()
                .map(|(namespace, values)| (namespace.clone(), Value::Object(values.clone())))
                .collect(),
        )
    }
}

/// True when `text` holds at least one expression block.
pub fn contains_expression(text: &str) -> bool {
    text.contains(OPEN)
}

/// Resolve every expression in a parameter tree, recursing through arrays
/// and objects. Values without expressions are returned unchanged.
pub fn resolve_parameters(parameters: &Value, ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
    match parameters {
        Value::String(text) if contains_expression(text) => resolve_string(text, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_parameters(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Ok((key.clone(), resolve_parameters(value, ctx)?)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve one string.
///
/// A string that is exactly one block yields the raw value, so
/// `"{{ $json.count }}"` stays a number. Anything else is interpolated.
pub fn resolve_string(text: &str, ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
    let blocks = split_blocks(text)?;

    if let [Segment::Block(expression)] = blocks.as_slice() {
        return evaluate(expression, ctx);
    }

    let mut rendered = String::with_capacity(text.len());
    for segment in blocks {
        match segment {
            Segment::Literal(literal) => rendered.push_str(literal),
            Segment::Block(expression) => {
                rendered.push_str(&evaluate(expression, ctx)?.to_display_string())
            }
        }
    }
    Ok(Value::String(rendered))
}

enum Segment<'t> {
    Literal(&'t str),
    Block(&'t str),
}

fn split_blocks(text: &str) -> Result<Vec<Segment<'_>>, ExpressionError> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let body = &rest[start + OPEN.len()..];
        let end = body
            .find(CLOSE)
            .ok_or_else(|| ExpressionError::evaluation(text, "unclosed expression block"))?;
        segments.push(Segment::Block(&body[..end]));
        rest = &body[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }

    Ok(segments)
}

/// Evaluate the body of one block (without the braces).
pub fn evaluate(expression: &str, ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
    let path = Parser::new(expression).parse()?;

    let root: Cow<'_, Value> = match &path.root {
        Root::Json => Cow::Borrowed(ctx.json),
        Root::Node(name) => Cow::Borrowed(ctx.node_output(name, expression)?),
        Root::Static => Cow::Owned(ctx.static_value()),
    };

    let mut current: &Value = root.as_ref();
    for accessor in &path.accessors {
        current = step(current, accessor, expression)?;
    }
    Ok(current.clone())
}

fn step<'v>(value: &'v Value, accessor: &Accessor, expression: &str) -> Result<&'v Value, ExpressionError> {
    match (value, accessor) {
        (Value::Null, _) => Ok(&NULL),
        (Value::Object(map), Accessor::Key(key)) => Ok(map.get(key).unwrap_or(&NULL)),
        (Value::Array(items), Accessor::Index(index)) => Ok(items.get(*index).unwrap_or(&NULL)),
        (other, Accessor::Key(key)) => Err(ExpressionError::evaluation(
            expression,
            format!("cannot read key '{}' of {}", key, other.type_name()),
        )),
        (other, Accessor::Index(index)) => Err(ExpressionError::evaluation(
            expression,
            format!("cannot index {} with [{}]", other.type_name(), index),
        )),
    }
}

#[derive(Debug, PartialEq)]
enum Root {
    Json,
    Node(String),
    Static,
}

#[derive(Debug, PartialEq)]
enum Accessor {
    Key(String),
    Index(usize),
}

#[derive(Debug)]
struct Path {
    root: Root,
    accessors: Vec<Accessor>,
}

struct Parser<'e> {
    source: &'e str,
    chars: Vec<char>,
    pos: usize,
}

impl<'e> Parser<'e> {
    fn new(source: &'e str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Path, ExpressionError> {
        self.skip_whitespace();
        if self.at_end() {
            return Err(self.error("empty expression"));
        }

        let root = self.root()?;
        if matches!(root, Root::Node(_)) {
            self.skip_whitespace();
            self.skip_json_selector();
        }

        let mut accessors = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => break,
                Some('.') => {
                    self.pos += 1;
                    let key = self.identifier()?;
                    accessors.push(Accessor::Key(key));
                }
                Some('[') => {
                    self.pos += 1;
                    accessors.push(self.bracket()?);
                }
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            }
        }

        Ok(Path { root, accessors })
    }

    fn root(&mut self) -> Result<Root, ExpressionError> {
        self.expect('$')?;
        if self.peek() == Some('(') {
            self.pos += 1;
            self.skip_whitespace();
            let name = self.string_literal()?;
            self.skip_whitespace();
            self.expect(')')?;
            return Ok(Root::Node(name));
        }

        match self.identifier()?.as_str() {
            "json" | "input" => Ok(Root::Json),
            "static" => Ok(Root::Static),
            "node" => match self.peek() {
                Some('[') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    let name = self.string_literal()?;
                    self.skip_whitespace();
                    self.expect(']')?;
                    Ok(Root::Node(name))
                }
                Some('.') => {
                    self.pos += 1;
                    Ok(Root::Node(self.identifier()?))
                }
                _ => Err(self.error("expected a node name after $node")),
            },
            other => Err(self.error(format!("unknown variable ${}", other))),
        }
    }

    /// `.json` right after a node reference selects its main output, which
    /// is what the bare reference already yields.
    fn skip_json_selector(&mut self) {
        let selector: Vec<char> = ".json".chars().collect();
        let end = self.pos + selector.len();
        let matches = self.chars.get(self.pos..end) == Some(selector.as_slice());
        let boundary = self
            .chars
            .get(end)
            .map_or(true, |c| !is_identifier_char(*c));
        if matches && boundary {
            self.pos = end;
        }
    }

    fn bracket(&mut self) -> Result<Accessor, ExpressionError> {
        self.skip_whitespace();
        let accessor = match self.peek() {
            Some('"') | Some('\'') => Accessor::Key(self.string_literal()?),
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                let index = digits
                    .parse()
                    .map_err(|_| self.error(format!("index {} out of range", digits)))?;
                Accessor::Index(index)
            }
            Some(c) => return Err(self.error(format!("unexpected '{}' in brackets", c))),
            None => return Err(self.error("unclosed '['")),
        };
        self.skip_whitespace();
        self.expect(']')?;
        Ok(accessor)
    }

    fn string_literal(&mut self) -> Result<String, ExpressionError> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected a quoted string")),
        };
        self.pos += 1;

        let mut literal = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(escaped) => literal.push(escaped),
                        None => return Err(self.error("unterminated string")),
                    }
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(literal);
                }
                Some(c) => literal.push(c),
            }
            self.pos += 1;
        }
    }

    fn identifier(&mut self) -> Result<String, ExpressionError> {
        let start = self.pos;
        while self.peek().is_some_and(is_identifier_char) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected an identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn expect(&mut self, expected: char) -> Result<(), ExpressionError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(format!("expected '{}'", expected))),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::evaluation(self.source.trim(), message)
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
