use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::ast::{Node, Pattern};
use super::error::EvalError;

/// Printable-length cap applied when summarizing a value for prompts and
/// telemetry.
pub const SAMPLE_MAX_CHARS: usize = 80;
/// Element cap applied when summarizing collections.
pub const SAMPLE_MAX_ITEMS: usize = 3;

/// A runtime value of the expression language.
///
/// Maps and sets compare by value regardless of insertion order; closures
/// compare by identity.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Keyword(String),
    Vector(Vec<Value>),
    Map(ValueMap),
    Set(ValueSet),
    Closure(Arc<Closure>),
    /// A named builtin from the runtime library.
    Native(&'static str),
    /// A host-provided predicate or projection (`where`, `juxt`, …).
    NativeClosure(NativeClosure),
    /// Var handle returned by `def`.
    Var(String),
}

/// A user-defined closure: captured environment, captured turn-history
/// snapshot, and metadata.
#[derive(Debug)]
pub struct Closure {
    pub name: Option<String>,
    pub params: Vec<Pattern>,
    pub body: Vec<Node>,
    pub env: HashMap<String, Value>,
    pub history: Vec<Value>,
    pub doc: Option<String>,
}

#[derive(Clone)]
pub struct NativeClosure {
    pub name: String,
    pub func: Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>,
}

impl fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#fn[{}]", self.name)
    }
}

/// Insertion-ordered map keyed by arbitrary values, with value equality.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Inserts or replaces, preserving the position of an existing key.
    pub fn insert(&mut self, key: Value, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl FromIterator<(Value, Value)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (Value, Value)>>(iter: T) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|ov| ov == v))
    }
}

/// A set with recursive value equality; duplicates are dropped on insert.
#[derive(Debug, Clone, Default)]
pub struct ValueSet {
    items: Vec<Value>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: Value) {
        if !self.contains(&value) {
            self.items.push(value);
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.items.iter().any(|v| v == value)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }
}

impl FromIterator<Value> for ValueSet {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        let mut set = ValueSet::new();
        for v in iter {
            set.insert(v);
        }
        set
    }
}

impl PartialEq for ValueSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.items.iter().all(|v| other.contains(v))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a == b,
            (Value::NativeClosure(a), Value::NativeClosure(b)) => Arc::ptr_eq(&a.func, &b.func),
            (Value::Var(a), Value::Var(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Type label used in definition tables, data inventories, and telemetry.
    pub fn type_label(&self) -> String {
        match self {
            Value::Nil => "nil".into(),
            Value::Bool(_) => "boolean".into(),
            Value::Int(_) => "integer".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "string".into(),
            Value::Keyword(_) => "keyword".into(),
            Value::Vector(items) => format!("list[{}]", items.len()),
            Value::Map(map) => format!("map[{}]", map.len()),
            Value::Set(set) => format!("set[{}]", set.len()),
            Value::Closure(closure) => match &closure.name {
                Some(name) => format!("#fn[{name}]"),
                None => "#fn[anonymous]".into(),
            },
            Value::Native(name) => format!("#fn[{name}]"),
            Value::NativeClosure(nc) => format!("#fn[{}]", nc.name),
            Value::Var(_) => "unknown".into(),
        }
    }

    /// Short printable sample, capped by [`SAMPLE_MAX_CHARS`] and
    /// [`SAMPLE_MAX_ITEMS`]. Oversized values collapse to `List(N)` /
    /// `Map(N)` / `String(N bytes)`.
    pub fn summarize(&self) -> String {
        match self {
            Value::Str(s) if s.chars().count() > SAMPLE_MAX_CHARS => {
                format!("String({} bytes)", s.len())
            }
            Value::Vector(items) if items.len() > SAMPLE_MAX_ITEMS => {
                format!("List({})", items.len())
            }
            Value::Map(map) if map.len() > SAMPLE_MAX_ITEMS => format!("Map({})", map.len()),
            Value::Set(set) if set.len() > SAMPLE_MAX_ITEMS => format!("Set({})", set.len()),
            other => {
                let printed = other.pr();
                if printed.chars().count() > SAMPLE_MAX_CHARS {
                    match other {
                        Value::Vector(items) => format!("List({})", items.len()),
                        Value::Map(map) => format!("Map({})", map.len()),
                        Value::Set(set) => format!("Set({})", set.len()),
                        _ => {
                            let cut: String = printed.chars().take(SAMPLE_MAX_CHARS).collect();
                            format!("{cut}...")
                        }
                    }
                } else {
                    printed
                }
            }
        }
    }

    /// Literal (reader) form: strings quoted, keywords with a leading colon.
    pub fn pr(&self) -> String {
        match self {
            Value::Nil => "nil".into(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Str(s) => format!("{s:?}"),
            Value::Keyword(k) => format!(":{k}"),
            Value::Vector(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.pr()).collect();
                format!("[{}]", inner.join(" "))
            }
            Value::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{} {}", k.pr(), v.pr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Set(set) => {
                let inner: Vec<String> = set.iter().map(|v| v.pr()).collect();
                format!("#{{{}}}", inner.join(" "))
            }
            Value::Closure(closure) => match &closure.name {
                Some(name) => format!("#fn[{name}]"),
                None => "#fn[anonymous]".into(),
            },
            Value::Native(name) => format!("#fn[{name}]"),
            Value::NativeClosure(nc) => format!("#fn[{}]", nc.name),
            Value::Var(name) => format!("#'user/{name}"),
        }
    }

    /// Converts to JSON. Keywords lose their colon; sets become arrays; map
    /// keys are stringified.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Nil => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number)
            }
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::Keyword(k) => JsonValue::String(k.clone()),
            Value::Vector(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Set(set) => JsonValue::Array(set.iter().map(Value::to_json).collect()),
            Value::Map(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in map.iter() {
                    obj.insert(k.as_json_key(), v.to_json());
                }
                JsonValue::Object(obj)
            }
            other => JsonValue::String(other.pr()),
        }
    }

    /// String form used for JSON object keys; recursive stringification at
    /// the tool boundary goes through this.
    pub fn as_json_key(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Keyword(k) => k.clone(),
            Value::Int(i) => i.to_string(),
            other => other.pr(),
        }
    }

    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Nil,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Value::Str(s.clone()),
            JsonValue::Array(items) => Value::Vector(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(obj) => Value::Map(
                obj.iter()
                    .map(|(k, v)| (Value::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn callable(&self) -> bool {
        matches!(
            self,
            Value::Closure(_)
                | Value::Native(_)
                | Value::NativeClosure(_)
                | Value::Keyword(_)
                | Value::Map(_)
                | Value::Set(_)
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.pr()),
        }
    }
}

// Serialization goes through the JSON bridge: data round-trips, function
// values degrade to their printed form.
impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_equality_ignores_order() {
        let a: ValueMap = [
            (Value::Keyword("a".into()), Value::Int(1)),
            (Value::Keyword("b".into()), Value::Int(2)),
        ]
        .into_iter()
        .collect();
        let b: ValueMap = [
            (Value::Keyword("b".into()), Value::Int(2)),
            (Value::Keyword("a".into()), Value::Int(1)),
        ]
        .into_iter()
        .collect();
        assert_eq!(Value::Map(a), Value::Map(b));
    }

    #[test]
    fn set_dedups_by_value() {
        let set: ValueSet = [
            Value::Vector(vec![Value::Int(1), Value::Int(2)]),
            Value::Vector(vec![Value::Int(1), Value::Int(2)]),
            Value::Int(1),
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn summarize_collapses_large_values() {
        let long = Value::Str("x".repeat(200));
        assert_eq!(long.summarize(), "String(200 bytes)");

        let list = Value::Vector((0..10).map(Value::Int).collect());
        assert_eq!(list.summarize(), "List(10)");
        assert_eq!(list.type_label(), "list[10]");
    }

    #[test]
    fn json_round_trip_stringifies_keyword_keys() {
        let map: ValueMap = [(Value::Keyword("count".into()), Value::Int(3))]
            .into_iter()
            .collect();
        let json = Value::Map(map).to_json();
        assert_eq!(json, serde_json::json!({"count": 3}));
    }
}
