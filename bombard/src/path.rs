use std::fmt;

use serde_json::Value;

use crate::error::PathError;

/// One step of a [`ValuePath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => write!(f, "{key}"),
            Segment::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// A dotted/bracketed path into a JSON document.
///
/// Accepted forms: `token`, `data.user.id`, `items[0].id`, `[0]['id']`,
/// `headers["x-request-id"]`. A plain key applied to an array is treated as an
/// index when it is numeric, so `items.0` and `items[0]` are the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePath {
    segments: Vec<Segment>,
}

impl ValuePath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        let syntax = |at| PathError::Syntax {
            path: raw.to_string(),
            at,
        };

        let bytes = raw.as_bytes();
        let mut segments = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            let end = if bytes[i] == b'[' {
                let close = raw[i..].find(']').map(|p| i + p).ok_or_else(|| syntax(i))?;
                let segment = parse_bracket(raw[i + 1..close].trim()).ok_or_else(|| syntax(i))?;
                segments.push(segment);
                close + 1
            } else {
                let end = raw[i..]
                    .find(|c: char| matches!(c, '.' | '[' | ']'))
                    .map_or(raw.len(), |p| i + p);
                if end == i {
                    return Err(syntax(i));
                }
                segments.push(Segment::Key(raw[i..end].to_string()));
                end
            };

            // a segment is followed by the end, a bracket, or a dot and another segment
            i = match bytes.get(end) {
                None => end,
                Some(b'[') => end,
                Some(b'.') if end + 1 < bytes.len() => end + 1,
                Some(_) => return Err(syntax(end)),
            };
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Walk the path from `root`, failing on the first missing step.
    pub fn resolve<'v>(&self, root: &'v Value) -> Result<&'v Value, PathError> {
        walk(&self.segments, root)
    }

    /// Leading key of the path, if the path starts with one.
    pub fn head(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(key)) => Some(key),
            _ => None,
        }
    }

    /// Walk every segment after the head, starting at the value the head named.
    pub fn resolve_tail<'v>(&self, head: &'v Value) -> Result<&'v Value, PathError> {
        walk(self.segments.get(1..).unwrap_or_default(), head)
    }
}

fn walk<'v>(segments: &[Segment], root: &'v Value) -> Result<&'v Value, PathError> {
    segments.iter().try_fold(root, |value, segment| {
        let next = match (segment, value) {
            (Segment::Key(key), Value::Object(map)) => map.get(key),
            (Segment::Key(key), Value::Array(items)) => {
                key.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            (Segment::Index(index), Value::Array(items)) => items.get(*index),
            _ => None,
        };
        next.ok_or_else(|| PathError::Missing {
            segment: segment.to_string(),
        })
    })
}

fn parse_bracket(inner: &str) -> Option<Segment> {
    let quoted = inner.len() >= 2
        && ((inner.starts_with('\'') && inner.ends_with('\''))
            || (inner.starts_with('"') && inner.ends_with('"')));
    if quoted {
        return Some(Segment::Key(inner[1..inner.len() - 1].to_string()));
    }
    inner.parse::<usize>().ok().map(Segment::Index)
}
