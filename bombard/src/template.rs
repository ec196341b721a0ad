use std::{collections::BTreeMap, fmt, sync::Arc, sync::OnceLock};

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, MapAccess, Visitor},
    ser::SerializeMap,
};
use serde_json::Value;
use typed_builder::TypedBuilder;

use crate::{error::AmmoError, path::ValuePath, script::CompiledScript, supply::Supply};

/// Header presets usable either as the whole `headers` value or as a header name.
const HEADER_PRESETS: &[(&str, &[(&str, &str)])] =
    &[("json", &[("Content-Type", "application/json")])];

/// A value that may be written either as a single item or as a list.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(value: T) -> Self {
        OneOrMany::One(value)
    }
}

/// Request headers as declared in a campaign.
#[derive(Debug, Clone, PartialEq)]
pub enum Headers {
    /// A preset name such as `json`.
    Preset(String),
    /// Name/value pairs in declaration order.
    List(Vec<(String, String)>),
}

impl Default for Headers {
    fn default() -> Self {
        Headers::List(Vec::new())
    }
}

impl Headers {
    pub fn is_empty(&self) -> bool {
        matches!(self, Headers::List(list) if list.is_empty())
    }

    /// Expand presets and collapse duplicates, the last occurrence of a name
    /// (compared case-insensitively) winning.
    pub fn resolve(&self) -> Vec<(String, String)> {
        let declared = match self {
            Headers::Preset(name) => match preset(name) {
                Some(headers) => return owned(headers),
                None => {
                    tracing::warn!("Unknown headers preset `{name}`, sending no headers");
                    return Vec::new();
                }
            },
            Headers::List(list) => list,
        };

        let mut resolved: Vec<(String, String)> = Vec::with_capacity(declared.len());
        for (name, value) in declared {
            let entries = match preset(name) {
                Some(headers) => owned(headers),
                None => vec![(name.clone(), value.clone())],
            };
            for (name, value) in entries {
                resolved.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
                resolved.push((name, value));
            }
        }
        resolved
    }
}

fn preset(name: &str) -> Option<&'static [(&'static str, &'static str)]> {
    HEADER_PRESETS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name))
        .map(|(_, headers)| *headers)
}

fn owned(headers: &[(&str, &str)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a header preset name or a mapping of header names to values")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Headers, E> {
                Ok(Headers::Preset(v.to_string()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Headers, E> {
                Ok(Headers::default())
            }

            fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<Headers, M::Error> {
                let mut list = Vec::new();
                while let Some((name, value)) = map.next_entry::<String, Value>()? {
                    let value = match value {
                        Value::String(s) => s,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    list.push((name, value));
                }
                Ok(Headers::List(list))
            }
        }

        deserializer.deserialize_any(HeadersVisitor)
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Headers::Preset(name) => serializer.serialize_str(name),
            Headers::List(list) => {
                let mut map = serializer.serialize_map(Some(list.len()))?;
                for (name, value) in list {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
        }
    }
}

/// What to pull out of a successful JSON response into the supply.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Extract {
    /// `extract: id` stores `response.id` under `id`.
    Single(String),
    /// `extract: {token: data.id, user: }`; an empty path means "same as the name".
    Map(BTreeMap<String, Option<String>>),
}

impl Extract {
    /// `(supply name, path)` pairs to extract.
    pub fn pairs(&self) -> Vec<(String, String)> {
        match self {
            Extract::Single(path) => vec![(path.clone(), path.clone())],
            Extract::Map(map) => map
                .iter()
                .map(|(name, path)| {
                    let path = match path.as_deref() {
                        Some(p) if !p.is_empty() => p.to_string(),
                        _ => name.clone(),
                    };
                    (name.clone(), path)
                })
                .collect(),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_repeat() -> usize {
    1
}

fn is_default_method(method: &str) -> bool {
    method == "GET"
}

fn is_one(repeat: &usize) -> bool {
    *repeat == 1
}

/// One request descriptor from a campaign.
///
/// Templates are shared between every ammo built from them and are never
/// modified after loading, except for the write-once compiled script slot.
#[derive(Debug, Clone, Deserialize, Serialize, TypedBuilder)]
pub struct RequestTemplate {
    #[builder(setter(into))]
    pub url: String,
    #[serde(default = "default_method", skip_serializing_if = "is_default_method")]
    #[builder(default = default_method(), setter(into))]
    pub method: String,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    #[builder(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub body: Option<Value>,
    /// Label used in logs and in the report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub extract: Option<Extract>,
    /// Names of campaign ammo to fire after a successful extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub reload: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub script: Option<String>,
    #[serde(default = "default_repeat", skip_serializing_if = "is_one")]
    #[builder(default = 1)]
    pub repeat: usize,
    /// Canned response body used instead of the network in dry runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub dry: Option<Value>,
    #[serde(skip)]
    #[builder(default, setter(skip))]
    compiled: OnceLock<CompiledScript>,
}

impl RequestTemplate {
    /// The wrapped source of `script`, built on first use and reused after.
    pub fn compiled_script(&self) -> Option<&CompiledScript> {
        let source = self.script.as_deref()?;
        Some(self.compiled.get_or_init(|| CompiledScript::compile(source)))
    }

    /// Produce the concrete request by filling every placeholder from `supply`.
    pub fn substitute(&self, supply: &Supply) -> Result<Request, AmmoError> {
        let headers = self
            .headers
            .resolve()
            .into_iter()
            .map(|(name, value)| {
                let value = substitute_str(&value, supply, &format!("header {name}"))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, AmmoError>>()?;

        Ok(Request {
            url: substitute_str(&self.url, supply, "url")?,
            method: substitute_str(&self.method, supply, "method")?,
            headers,
            body: self
                .body
                .as_ref()
                .map(|b| substitute_value(b, supply, "body"))
                .transpose()?,
            label: self
                .name
                .as_ref()
                .map(|n| substitute_str(n, supply, "name"))
                .transpose()?,
            dry: self
                .dry
                .as_ref()
                .map(|d| substitute_value(d, supply, "dry"))
                .transpose()?,
        })
    }
}

/// A request with every placeholder resolved, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub label: Option<String>,
    pub dry: Option<Value>,
}

impl Request {
    /// Body serialized the way it goes on the wire.
    pub fn body_text(&self) -> Option<String> {
        self.body.as_ref().map(Value::to_string)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A queued unit of work.
#[derive(Debug, Clone)]
pub struct Ammo {
    pub id: u64,
    pub request: Arc<RequestTemplate>,
    /// Per-job overrides layered over the global supply.
    pub local_supply: Supply,
}

impl Ammo {
    pub fn label(&self) -> &str {
        self.request.name.as_deref().unwrap_or("-")
    }
}

/// Replace `{name}` placeholders in `template`.
///
/// `{{` and `}}` produce literal braces. A placeholder may continue with a
/// path (`{user.id}`, `{items[0]}`) resolved inside the named supply value.
/// Strings are inserted verbatim, every other value as its JSON text.
pub fn substitute_str(template: &str, supply: &Supply, field: &str) -> Result<String, AmmoError> {
    let fail = |placeholder: &str, reason: String| AmmoError::Substitution {
        field: field.to_string(),
        placeholder: placeholder.to_string(),
        reason,
    };

    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((at, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &template[at + 1..];
                let close = rest
                    .find('}')
                    .ok_or_else(|| fail(&template[at..], "unclosed placeholder".into()))?;
                let expr = &rest[..close];
                let path = ValuePath::parse(expr.trim()).map_err(|e| fail(expr, e.to_string()))?;
                let name = path
                    .head()
                    .ok_or_else(|| fail(expr, "placeholder must start with a name".into()))?;
                let head = supply
                    .get(name)
                    .ok_or_else(|| fail(expr, format!("`{name}` is not in supply")))?;
                match path.resolve_tail(head).map_err(|e| fail(expr, e.to_string()))? {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
                // skip the placeholder body and the closing brace
                while let Some((i, _)) = chars.peek() {
                    if *i > at + 1 + close {
                        break;
                    }
                    chars.next();
                }
            }
            '}' => return Err(fail("}", "single `}` in template".into())),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Substitute every string inside `value`, recursing into arrays and objects.
pub fn substitute_value(value: &Value, supply: &Supply, field: &str) -> Result<Value, AmmoError> {
    Ok(match value {
        Value::String(s) => Value::String(substitute_str(s, supply, field)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_value(v, supply, field))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), substitute_value(v, supply, field)?)))
                .collect::<Result<_, AmmoError>>()?,
        ),
        other => other.clone(),
    })
}
