//! Reference expressions and their resolution against a value context.
//!
//! # Syntax
//!
//! - `${name}` binds a top-level name (initial param, batch item, node id
//!   or node output key)
//! - `${node.field}` walks into a mapping
//! - `${node.items[0].name}` indexes into a sequence
//!
//! A string that is exactly one `${...}` is a *simple* reference and keeps
//! the native type of what it points at. Any other string containing
//! references is *composite*: each reference is stringified in place.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::coerce::{self, DEFAULT_COERCION_LIMIT};
use crate::{stringify, Map, ReferenceError, Value, ValueKind};

const OPEN: &str = "${";
const CLOSE: char = '}';

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    /// Container kind this segment needs to step into.
    fn container_kind(&self) -> ValueKind {
        match self {
            PathSegment::Key(_) => ValueKind::Object,
            PathSegment::Index(_) => ValueKind::Array,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => f.write_str(key),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// A parsed reference path such as `fetch.body.items[2].id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    raw: String,
    root: String,
    segments: Vec<PathSegment>,
}

impl Reference {
    pub fn parse(expression: &str) -> Result<Self, ReferenceError> {
        let raw = expression.trim();
        let syntax = |reason: &str| ReferenceError::Syntax {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let mut chars = raw.char_indices().peekable();
        let root_end = loop {
            match chars.peek() {
                Some(&(i, c)) if !is_name_char(c) => break i,
                Some(_) => {
                    chars.next();
                }
                None => break raw.len(),
            }
        };
        if root_end == 0 {
            return Err(syntax("expected a name"));
        }

        let mut segments = Vec::new();
        while let Some((start, c)) = chars.next() {
            match c {
                '.' => {
                    let mut end = raw.len();
                    while let Some(&(i, c)) = chars.peek() {
                        if !is_name_char(c) {
                            end = i;
                            break;
                        }
                        chars.next();
                    }
                    let key = &raw[start + 1..end];
                    if key.is_empty() {
                        return Err(syntax("empty key after '.'"));
                    }
                    segments.push(PathSegment::Key(key.to_string()));
                }
                '[' => {
                    let mut digits = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        digits.push(c);
                    }
                    if !closed {
                        return Err(syntax("unclosed '['"));
                    }
                    let index = digits
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| syntax("index must be a non-negative integer"))?;
                    segments.push(PathSegment::Index(index));
                }
                other => {
                    return Err(syntax(&format!("unexpected character '{}'", other)));
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            root: raw[..root_end].to_string(),
            segments,
        })
    }

    /// Top-level name the path starts from.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// First key segment after the root, if any.
    pub fn first_key(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Key(key)) => Some(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// A string split into literal text and references.
#[derive(Debug, Clone, PartialEq)]
enum TemplatePart {
    Literal(String),
    Reference(Reference),
}

fn parse_template(text: &str) -> Result<Vec<TemplatePart>, ReferenceError> {
    let mut parts = Vec::new();
    let mut remaining = text;

    while let Some(start) = remaining.find(OPEN) {
        let Some(len) = remaining[start + OPEN.len()..].find(CLOSE) else {
            // unclosed `${` is literal text
            break;
        };
        if start > 0 {
            parts.push(TemplatePart::Literal(remaining[..start].to_string()));
        }
        let inner = &remaining[start + OPEN.len()..start + OPEN.len() + len];
        parts.push(TemplatePart::Reference(Reference::parse(inner)?));
        remaining = &remaining[start + OPEN.len() + len + 1..];
    }
    if !remaining.is_empty() {
        parts.push(TemplatePart::Literal(remaining.to_string()));
    }

    Ok(parts)
}

/// Split a bare path expression (no `${}`) into its root name and segments.
pub fn parse_path(expression: &str) -> Result<(String, Vec<PathSegment>), ReferenceError> {
    let reference = Reference::parse(expression)?;
    Ok((reference.root, reference.segments))
}

/// Whether `value` contains at least one `${...}` anywhere in its tree.
pub fn has_references(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains(OPEN),
        Value::Array(items) => items.iter().any(has_references),
        Value::Object(map) => map.values().any(has_references),
        _ => false,
    }
}

/// Collect every reference in a parameter tree, in document order.
///
/// Malformed references are returned as errors alongside the good ones so
/// a validator can report all of them.
pub fn extract_references(value: &Value) -> Vec<Result<Reference, ReferenceError>> {
    let mut found = Vec::new();
    collect_references(value, &mut found);
    found
}

fn collect_references(value: &Value, found: &mut Vec<Result<Reference, ReferenceError>>) {
    match value {
        Value::String(s) if s.contains(OPEN) => match parse_template(s) {
            Ok(parts) => found.extend(parts.into_iter().filter_map(|part| match part {
                TemplatePart::Reference(r) => Some(Ok(r)),
                TemplatePart::Literal(_) => None,
            })),
            Err(e) => found.push(Err(e)),
        },
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, found)),
        _ => {}
    }
}

/// Top-level name lookup used by the resolver.
pub trait ValueLookup {
    fn lookup(&self, name: &str) -> Option<Cow<'_, Value>>;

    /// A mapping bound to `name` that the resolver can step into by
    /// reference instead of materialising it through [`lookup`].
    ///
    /// Must agree with `lookup`: return `Some` only when `lookup(name)`
    /// would yield this mapping as an object.
    ///
    /// [`lookup`]: ValueLookup::lookup
    fn lookup_mapping(&self, _name: &str) -> Option<&Map<String, Value>> {
        None
    }
}

impl ValueLookup for Map<String, Value> {
    fn lookup(&self, name: &str) -> Option<Cow<'_, Value>> {
        self.get(name).map(Cow::Borrowed)
    }
}

impl ValueLookup for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Cow<'_, Value>> {
        self.get(name).map(Cow::Borrowed)
    }
}

/// Resolves reference expressions against a [`ValueLookup`].
///
/// Resolution never mutates the lookup, so resolving the same expression
/// twice against an unchanged context yields the same value.
pub struct ReferenceResolver<'a, L: ValueLookup + ?Sized> {
    lookup: &'a L,
    coercion_limit: usize,
}

impl<'a, L: ValueLookup + ?Sized> ReferenceResolver<'a, L> {
    pub fn new(lookup: &'a L) -> Self {
        Self {
            lookup,
            coercion_limit: DEFAULT_COERCION_LIMIT,
        }
    }

    pub fn with_coercion_limit(mut self, limit: usize) -> Self {
        self.coercion_limit = limit;
        self
    }

    /// Parse and resolve a bare path expression (no `${}` delimiters).
    pub fn resolve(&self, expression: &str) -> Result<Value, ReferenceError> {
        self.resolve_reference(&Reference::parse(expression)?)
    }

    pub fn resolve_reference(&self, reference: &Reference) -> Result<Value, ReferenceError> {
        let (mut current, rest) = self.root(reference)?;

        for segment in rest {
            // Dot/bracket access on a string asks for structured access.
            let parsed = match current.as_ref() {
                Value::String(text) => Some(
                    coerce::parse_container(text, segment.container_kind(), self.coercion_limit)
                        .ok_or_else(|| ReferenceError::NotTraversable {
                            path: reference.to_string(),
                            segment: segment.to_string(),
                            kind: ValueKind::String,
                        })?,
                ),
                _ => None,
            };
            if let Some(parsed) = parsed {
                debug!(reference = %reference, "Parsed string value for traversal");
                current = Cow::Owned(parsed);
            }

            current = match current {
                Cow::Borrowed(value) => Cow::Borrowed(navigate(value, segment, reference)?),
                Cow::Owned(value) => Cow::Owned(navigate(&value, segment, reference)?.clone()),
            };
        }

        Ok(current.into_owned())
    }

    /// Bind the root name, stepping straight into a borrowed mapping when
    /// the lookup offers one, and return the segments still to walk.
    fn root<'r>(
        &self,
        reference: &'r Reference,
    ) -> Result<(Cow<'a, Value>, &'r [PathSegment]), ReferenceError> {
        let lookup: &'a L = self.lookup;
        if let (Some(map), Some((first, rest))) = (
            lookup.lookup_mapping(reference.root()),
            reference.segments().split_first(),
        ) {
            let value = match first {
                PathSegment::Key(key) => map.get(key),
                PathSegment::Index(_) => None,
            };
            let value = value.ok_or_else(|| ReferenceError::MissingSegment {
                path: reference.to_string(),
                segment: first.to_string(),
                kind: ValueKind::Object,
            })?;
            return Ok((Cow::Borrowed(value), rest));
        }

        let value = lookup
            .lookup(reference.root())
            .ok_or_else(|| ReferenceError::Undefined {
                name: reference.root().to_string(),
            })?;
        Ok((value, reference.segments()))
    }

    /// Resolve every reference in a string.
    ///
    /// A simple reference keeps the referenced value's type; a composite
    /// string is always returned as a string.
    pub fn resolve_string(&self, text: &str) -> Result<Value, ReferenceError> {
        if !text.contains(OPEN) {
            return Ok(Value::String(text.to_string()));
        }

        let parts = parse_template(text)?;
        if let [TemplatePart::Reference(reference)] = parts.as_slice() {
            return self.resolve_reference(reference);
        }

        let mut out = String::with_capacity(text.len());
        for part in &parts {
            match part {
                TemplatePart::Literal(s) => out.push_str(s),
                TemplatePart::Reference(r) => out.push_str(&stringify(&self.resolve_reference(r)?)),
            }
        }
        Ok(Value::String(out))
    }

    /// Resolve all references in a value tree, recursing into mappings and
    /// sequences. Non-string scalars are returned unchanged.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, ReferenceError> {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (k, v) in map {
                    resolved.insert(k.clone(), self.resolve_value(v)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }
}

fn navigate<'v>(
    value: &'v Value,
    segment: &PathSegment,
    reference: &Reference,
) -> Result<&'v Value, ReferenceError> {
    let missing = || ReferenceError::MissingSegment {
        path: reference.to_string(),
        segment: segment.to_string(),
        kind: ValueKind::of(value),
    };

    match (segment, value) {
        (PathSegment::Key(key), Value::Object(map)) => map.get(key).ok_or_else(missing),
        (PathSegment::Index(i), Value::Array(items)) => items.get(*i).ok_or_else(missing),
        (_, Value::Object(_) | Value::Array(_)) => Err(missing()),
        (_, other) => Err(ReferenceError::NotTraversable {
            path: reference.to_string(),
            segment: segment.to_string(),
            kind: ValueKind::of(other),
        }),
    }
}
