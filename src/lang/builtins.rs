use std::sync::Arc;

use regex::Regex;

use super::error::EvalError;
use super::value::{NativeClosure, Value, ValueMap, ValueSet};

/// Builtins whose implementations live in the evaluator because they apply
/// user closures (or, for `println`, record output).
pub const EVALUATOR_BUILTINS: &[&str] = &[
    "map",
    "mapv",
    "filter",
    "remove",
    "reduce",
    "take-while",
    "drop-while",
    "sort-by",
    "group-by",
    "update",
    "update-vals",
    "update-in",
    "sum-by",
    "avg-by",
    "min-by",
    "max-by",
    "pluck",
    "println",
];

const PURE_BUILTINS: &[&str] = &[
    "+",
    "-",
    "*",
    "/",
    "=",
    "not=",
    "<",
    "<=",
    ">",
    ">=",
    "not",
    "first",
    "last",
    "nth",
    "count",
    "empty?",
    "concat",
    "take",
    "drop",
    "distinct",
    "reverse",
    "flatten",
    "into",
    "pairs",
    "get",
    "get-in",
    "assoc",
    "dissoc",
    "merge",
    "keys",
    "vals",
    "contains?",
    "split",
    "split-lines",
    "join",
    "subs",
    "includes?",
    "starts-with?",
    "ends-with?",
    "grep",
    "grep-n",
    "re-find",
    "re-pattern",
    "parse-long",
    "parse-double",
    "in",
    "includes",
    "where",
    "all-of",
    "any-of",
    "none-of",
    "juxt",
];

pub fn is_builtin(name: &str) -> bool {
    PURE_BUILTINS.contains(&name) || EVALUATOR_BUILTINS.contains(&name)
}

/// Returns the static name a symbol resolves to, if it names a builtin.
pub fn interned(name: &str) -> Option<&'static str> {
    PURE_BUILTINS
        .iter()
        .chain(EVALUATOR_BUILTINS.iter())
        .find(|n| **n == name)
        .copied()
}

pub fn is_pure(name: &str) -> bool {
    PURE_BUILTINS.contains(&name)
}

/// Applies a value in function position without evaluator support: builtins,
/// host predicates, keywords, maps, and sets. User closures need the
/// evaluator and are rejected here.
pub fn apply_pure(func: &Value, args: &[Value]) -> Result<Value, EvalError> {
    match func {
        Value::Native(name) => call_pure(name, args.to_vec()),
        Value::NativeClosure(nc) => (nc.func)(args),
        Value::Keyword(k) => {
            let [m, rest @ ..] = args else {
                return Err(EvalError::Arity(format!(
                    ":{k} expects a map argument"
                )));
            };
            let found = lookup(m, &Value::Keyword(k.clone()));
            match (found, rest.first()) {
                (Some(v), _) => Ok(v),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Ok(Value::Nil),
            }
        }
        Value::Map(map) => {
            let [k, rest @ ..] = args else {
                return Err(EvalError::Arity("map lookup expects a key".into()));
            };
            match (map.get(k), rest.first()) {
                (Some(v), _) => Ok(v.clone()),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Ok(Value::Nil),
            }
        }
        // A set is a membership predicate: returns the element or nil.
        Value::Set(set) => {
            let [x] = args else {
                return Err(EvalError::Arity("set membership expects one argument".into()));
            };
            Ok(if set.contains(x) { x.clone() } else { Value::Nil })
        }
        Value::Closure(_) => Err(EvalError::Type(
            "user-defined functions are not supported inside this builtin".into(),
        )),
        other => Err(EvalError::NotCallable(other.type_label())),
    }
}

pub fn call_pure(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match name {
        "+" => arith(name, args, 0, |a, b| a.checked_add(b), |a, b| a + b),
        "*" => arith(name, args, 1, |a, b| a.checked_mul(b), |a, b| a * b),
        "-" => subtract(args),
        "/" => divide(args),
        "=" => Ok(Value::Bool(all_equal(&args))),
        "not=" => Ok(Value::Bool(!all_equal(&args))),
        "<" => compare(name, args, |o| o == std::cmp::Ordering::Less),
        "<=" => compare(name, args, |o| o != std::cmp::Ordering::Greater),
        ">" => compare(name, args, |o| o == std::cmp::Ordering::Greater),
        ">=" => compare(name, args, |o| o != std::cmp::Ordering::Less),
        "not" => {
            let [x] = one(name, args)?;
            Ok(Value::Bool(!x.truthy()))
        }
        "first" => {
            let [coll] = one(name, args)?;
            Ok(as_items(&coll, name)?.first().cloned().unwrap_or(Value::Nil))
        }
        "last" => {
            let [coll] = one(name, args)?;
            Ok(as_items(&coll, name)?.last().cloned().unwrap_or(Value::Nil))
        }
        "nth" => nth(args),
        "count" => {
            let [coll] = one(name, args)?;
            let n = match &coll {
                Value::Nil => 0,
                Value::Str(s) => s.chars().count(),
                Value::Vector(items) => items.len(),
                Value::Map(map) => map.len(),
                Value::Set(set) => set.len(),
                other => {
                    return Err(EvalError::Type(format!(
                        "count expects a collection, got {}",
                        other.type_label()
                    )))
                }
            };
            Ok(Value::Int(n as i64))
        }
        "empty?" => {
            let [coll] = one(name, args)?;
            let empty = match &coll {
                Value::Nil => true,
                Value::Str(s) => s.is_empty(),
                Value::Vector(items) => items.is_empty(),
                Value::Map(map) => map.is_empty(),
                Value::Set(set) => set.is_empty(),
                other => {
                    return Err(EvalError::Type(format!(
                        "empty? expects a collection, got {}",
                        other.type_label()
                    )))
                }
            };
            Ok(Value::Bool(empty))
        }
        "concat" => {
            let mut out = Vec::new();
            for coll in &args {
                out.extend(as_items(coll, name)?);
            }
            Ok(Value::Vector(out))
        }
        "take" => {
            let (n, items) = int_and_coll(name, args)?;
            Ok(Value::Vector(items.into_iter().take(n.max(0) as usize).collect()))
        }
        "drop" => {
            let (n, items) = int_and_coll(name, args)?;
            Ok(Value::Vector(items.into_iter().skip(n.max(0) as usize).collect()))
        }
        "distinct" => {
            let [coll] = one(name, args)?;
            let mut out: Vec<Value> = Vec::new();
            for item in as_items(&coll, name)? {
                if !out.contains(&item) {
                    out.push(item);
                }
            }
            Ok(Value::Vector(out))
        }
        "reverse" => {
            let [coll] = one(name, args)?;
            let mut items = as_items(&coll, name)?;
            items.reverse();
            Ok(Value::Vector(items))
        }
        "flatten" => {
            let [coll] = one(name, args)?;
            let mut out = Vec::new();
            flatten_into(&coll, &mut out);
            Ok(Value::Vector(out))
        }
        "into" => into(args),
        "pairs" => {
            let [coll] = one(name, args)?;
            let Value::Map(map) = coll else {
                return Err(EvalError::Type(format!(
                    "pairs expects a map, got {}",
                    coll.type_label()
                )));
            };
            Ok(Value::Vector(
                map.iter()
                    .map(|(k, v)| Value::Vector(vec![k.clone(), v.clone()]))
                    .collect(),
            ))
        }
        "get" => {
            let (coll, key, default) = two_plus_default(name, args)?;
            Ok(lookup(&coll, &key).unwrap_or(default))
        }
        "get-in" => get_in(args),
        "assoc" => assoc(args),
        "dissoc" => dissoc(args),
        "merge" => {
            let mut out = ValueMap::new();
            for arg in args {
                match arg {
                    Value::Nil => {}
                    Value::Map(map) => {
                        for (k, v) in map.iter() {
                            out.insert(k.clone(), v.clone());
                        }
                    }
                    other => {
                        return Err(EvalError::Type(format!(
                            "merge expects maps, got {}",
                            other.type_label()
                        )))
                    }
                }
            }
            Ok(Value::Map(out))
        }
        "keys" => {
            let [coll] = one(name, args)?;
            let Value::Map(map) = coll else {
                return Err(EvalError::Type(format!(
                    "keys expects a map, got {}",
                    coll.type_label()
                )));
            };
            Ok(Value::Vector(map.keys().cloned().collect()))
        }
        "vals" => {
            let [coll] = one(name, args)?;
            let Value::Map(map) = coll else {
                return Err(EvalError::Type(format!(
                    "vals expects a map, got {}",
                    coll.type_label()
                )));
            };
            Ok(Value::Vector(map.values().cloned().collect()))
        }
        "contains?" => {
            let [coll, key] = two(name, args)?;
            let contained = match &coll {
                Value::Map(map) => map.contains_key(&key),
                Value::Set(set) => set.contains(&key),
                Value::Vector(items) => match key {
                    Value::Int(i) => i >= 0 && (i as usize) < items.len(),
                    _ => false,
                },
                Value::Nil => false,
                other => {
                    return Err(EvalError::Type(format!(
                        "contains? expects a collection, got {}",
                        other.type_label()
                    )))
                }
            };
            Ok(Value::Bool(contained))
        }
        "split" => {
            let [s, sep] = two(name, args)?;
            let (s, sep) = (want_str(&s, name)?, want_str(&sep, name)?);
            Ok(Value::Vector(
                s.split(sep.as_str()).map(|p| Value::Str(p.into())).collect(),
            ))
        }
        "split-lines" => {
            let [s] = one(name, args)?;
            let s = want_str(&s, name)?;
            Ok(Value::Vector(s.lines().map(|l| Value::Str(l.into())).collect()))
        }
        "join" => join(args),
        "subs" => subs(args),
        "includes?" => {
            let [s, sub] = two(name, args)?;
            Ok(Value::Bool(
                want_str(&s, name)?.contains(want_str(&sub, name)?.as_str()),
            ))
        }
        "starts-with?" => {
            let [s, prefix] = two(name, args)?;
            Ok(Value::Bool(
                want_str(&s, name)?.starts_with(want_str(&prefix, name)?.as_str()),
            ))
        }
        "ends-with?" => {
            let [s, suffix] = two(name, args)?;
            Ok(Value::Bool(
                want_str(&s, name)?.ends_with(want_str(&suffix, name)?.as_str()),
            ))
        }
        "grep" => grep(args, false),
        "grep-n" => grep(args, true),
        "re-find" => {
            let [pattern, s] = two(name, args)?;
            let re = compile(&pattern)?;
            Ok(re
                .find(&want_str(&s, name)?)
                .map(|m| Value::Str(m.as_str().into()))
                .unwrap_or(Value::Nil))
        }
        "re-pattern" => {
            let [pattern] = one(name, args)?;
            compile(&pattern)?;
            Ok(pattern)
        }
        "parse-long" => {
            let [s] = one(name, args)?;
            Ok(want_str(&s, name)?
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or(Value::Nil))
        }
        "parse-double" => {
            let [s] = one(name, args)?;
            Ok(want_str(&s, name)?
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .unwrap_or(Value::Nil))
        }
        "in" => {
            let [x, coll] = two(name, args)?;
            let found = match &coll {
                Value::Vector(items) => items.contains(&x),
                Value::Set(set) => set.contains(&x),
                Value::Map(map) => map.contains_key(&x),
                other => {
                    return Err(EvalError::Type(format!(
                        "in expects a collection, got {}",
                        other.type_label()
                    )))
                }
            };
            Ok(Value::Bool(found))
        }
        "includes" => {
            let [coll, x] = two(name, args)?;
            let found = match &coll {
                Value::Vector(items) => items.contains(&x),
                Value::Set(set) => set.contains(&x),
                Value::Str(s) => s.contains(want_str(&x, name)?.as_str()),
                other => {
                    return Err(EvalError::Type(format!(
                        "includes expects a collection or string, got {}",
                        other.type_label()
                    )))
                }
            };
            Ok(Value::Bool(found))
        }
        "where" => where_predicate(args),
        "all-of" => combine(args, "all-of"),
        "any-of" => combine(args, "any-of"),
        "none-of" => combine(args, "none-of"),
        "juxt" => juxt(args),
        _ => Err(EvalError::Unbound(name.to_string())),
    }
}

// ---- numeric helpers ----

enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(v: &Value, op: &str) -> Result<Num, EvalError> {
    match v {
        Value::Int(i) => Ok(Num::Int(*i)),
        Value::Float(f) => Ok(Num::Float(*f)),
        other => Err(EvalError::Type(format!(
            "{op} expects numbers, got {}",
            other.type_label()
        ))),
    }
}

fn arith(
    op: &str,
    args: Vec<Value>,
    identity: i64,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    let mut acc = Num::Int(identity);
    for arg in &args {
        acc = match (acc, as_num(arg, op)?) {
            (Num::Int(a), Num::Int(b)) => match int_op(a, b) {
                Some(v) => Num::Int(v),
                None => return Err(EvalError::Arithmetic(format!("{op} overflowed"))),
            },
            (a, b) => Num::Float(float_op(to_f64(a), to_f64(b))),
        };
    }
    Ok(num_value(acc))
}

fn subtract(args: Vec<Value>) -> Result<Value, EvalError> {
    let [first, rest @ ..] = args.as_slice() else {
        return Err(EvalError::Arity("- requires at least one argument".into()));
    };
    if rest.is_empty() {
        return match as_num(first, "-")? {
            Num::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| EvalError::Arithmetic("- overflowed".into())),
            Num::Float(f) => Ok(Value::Float(-f)),
        };
    }
    let mut acc = as_num(first, "-")?;
    for arg in rest {
        acc = match (acc, as_num(arg, "-")?) {
            (Num::Int(a), Num::Int(b)) => match a.checked_sub(b) {
                Some(v) => Num::Int(v),
                None => return Err(EvalError::Arithmetic("- overflowed".into())),
            },
            (a, b) => Num::Float(to_f64(a) - to_f64(b)),
        };
    }
    Ok(num_value(acc))
}

fn divide(args: Vec<Value>) -> Result<Value, EvalError> {
    let [first, rest @ ..] = args.as_slice() else {
        return Err(EvalError::Arity("/ requires at least one argument".into()));
    };
    if rest.is_empty() {
        return divide(vec![Value::Int(1), first.clone()]);
    }
    let mut acc = as_num(first, "/")?;
    for arg in rest {
        let divisor = as_num(arg, "/")?;
        if matches!(divisor, Num::Int(0)) || matches!(divisor, Num::Float(f) if f == 0.0) {
            return Err(EvalError::Arithmetic("division by zero".into()));
        }
        acc = match (acc, divisor) {
            // Integer division stays exact or widens to float.
            (Num::Int(a), Num::Int(b)) if a % b == 0 => Num::Int(a / b),
            (a, b) => Num::Float(to_f64(a) / to_f64(b)),
        };
    }
    Ok(num_value(acc))
}

fn to_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

fn num_value(n: Num) -> Value {
    match n {
        Num::Int(i) => Value::Int(i),
        Num::Float(f) => Value::Float(f),
    }
}

fn all_equal(args: &[Value]) -> bool {
    args.windows(2).all(|w| w[0] == w[1])
}

fn compare(
    op: &str,
    args: Vec<Value>,
    accept: fn(std::cmp::Ordering) -> bool,
) -> Result<Value, EvalError> {
    if args.len() < 2 {
        return Err(EvalError::Arity(format!("{op} requires at least two arguments")));
    }
    for pair in args.windows(2) {
        let (a, b) = (to_f64(as_num(&pair[0], op)?), to_f64(as_num(&pair[1], op)?));
        let Some(ordering) = a.partial_cmp(&b) else {
            return Err(EvalError::Arithmetic(format!("{op} cannot order NaN")));
        };
        if !accept(ordering) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

// ---- collection helpers ----

fn as_items(coll: &Value, op: &str) -> Result<Vec<Value>, EvalError> {
    match coll {
        Value::Nil => Ok(vec![]),
        Value::Vector(items) => Ok(items.clone()),
        Value::Set(set) => Ok(set.iter().cloned().collect()),
        Value::Map(map) => Ok(map
            .iter()
            .map(|(k, v)| Value::Vector(vec![k.clone(), v.clone()]))
            .collect()),
        other => Err(EvalError::Type(format!(
            "{op} expects a collection, got {}",
            other.type_label()
        ))),
    }
}

fn lookup(coll: &Value, key: &Value) -> Option<Value> {
    match coll {
        Value::Map(map) => map.get(key).cloned(),
        Value::Vector(items) => match key {
            Value::Int(i) if *i >= 0 => items.get(*i as usize).cloned(),
            _ => None,
        },
        Value::Set(set) => set.contains(key).then(|| key.clone()),
        _ => None,
    }
}

fn nth(args: Vec<Value>) -> Result<Value, EvalError> {
    let (coll, idx, default) = match args.as_slice() {
        [coll, idx] => (coll.clone(), idx.clone(), None),
        [coll, idx, default] => (coll.clone(), idx.clone(), Some(default.clone())),
        _ => return Err(EvalError::Arity("nth expects (nth coll index default?)".into())),
    };
    let Value::Int(i) = idx else {
        return Err(EvalError::Type(format!(
            "nth index must be an integer, got {}",
            idx.type_label()
        )));
    };
    let items = as_items(&coll, "nth")?;
    match items.get(i.max(0) as usize) {
        Some(v) if i >= 0 => Ok(v.clone()),
        _ => default.ok_or_else(|| {
            EvalError::Type(format!("nth index {i} out of bounds for {} items", items.len()))
        }),
    }
}

fn int_and_coll(op: &str, args: Vec<Value>) -> Result<(i64, Vec<Value>), EvalError> {
    let [n, coll] = two(op, args)?;
    let Value::Int(n) = n else {
        return Err(EvalError::Type(format!(
            "{op} expects an integer count, got {}",
            n.type_label()
        )));
    };
    Ok((n, as_items(&coll, op)?))
}

fn flatten_into(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Vector(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        other => out.push(other.clone()),
    }
}

fn into(args: Vec<Value>) -> Result<Value, EvalError> {
    let [target, source] = two("into", args)?;
    let items = as_items(&source, "into")?;
    match target {
        Value::Vector(mut base) => {
            base.extend(items);
            Ok(Value::Vector(base))
        }
        Value::Set(mut base) => {
            for item in items {
                base.insert(item);
            }
            Ok(Value::Set(base))
        }
        Value::Map(mut base) => {
            for item in items {
                let Value::Vector(pair) = &item else {
                    return Err(EvalError::Type(
                        "into a map expects [key value] pairs".into(),
                    ));
                };
                let [k, v] = pair.as_slice() else {
                    return Err(EvalError::Type(
                        "into a map expects [key value] pairs".into(),
                    ));
                };
                base.insert(k.clone(), v.clone());
            }
            Ok(Value::Map(base))
        }
        other => Err(EvalError::Type(format!(
            "into expects a vector, set, or map target, got {}",
            other.type_label()
        ))),
    }
}

fn get_in(args: Vec<Value>) -> Result<Value, EvalError> {
    let (coll, path, default) = match args.as_slice() {
        [coll, path] => (coll.clone(), path.clone(), Value::Nil),
        [coll, path, default] => (coll.clone(), path.clone(), default.clone()),
        _ => {
            return Err(EvalError::Arity(
                "get-in expects (get-in coll [keys] default?)".into(),
            ))
        }
    };
    let Value::Vector(path) = path else {
        return Err(EvalError::Type(format!(
            "get-in path must be a vector, got {}",
            path.type_label()
        )));
    };
    let mut current = coll;
    for key in &path {
        match lookup(&current, key) {
            Some(next) => current = next,
            None => return Ok(default),
        }
    }
    Ok(current)
}

fn assoc(args: Vec<Value>) -> Result<Value, EvalError> {
    let [target, kvs @ ..] = args.as_slice() else {
        return Err(EvalError::Arity("assoc expects (assoc coll key value ...)".into()));
    };
    if kvs.is_empty() || kvs.len() % 2 != 0 {
        return Err(EvalError::Arity(
            "assoc expects an even number of key/value arguments".into(),
        ));
    }
    match target.clone() {
        Value::Map(mut map) => {
            for pair in kvs.chunks(2) {
                map.insert(pair[0].clone(), pair[1].clone());
            }
            Ok(Value::Map(map))
        }
        Value::Nil => {
            let mut map = ValueMap::new();
            for pair in kvs.chunks(2) {
                map.insert(pair[0].clone(), pair[1].clone());
            }
            Ok(Value::Map(map))
        }
        Value::Vector(mut items) => {
            for pair in kvs.chunks(2) {
                let Value::Int(i) = pair[0] else {
                    return Err(EvalError::Type("assoc on a vector requires integer keys".into()));
                };
                let i = i.max(0) as usize;
                if i > items.len() {
                    return Err(EvalError::Type(format!(
                        "assoc index {i} out of bounds for {} items",
                        items.len()
                    )));
                }
                if i == items.len() {
                    items.push(pair[1].clone());
                } else {
                    items[i] = pair[1].clone();
                }
            }
            Ok(Value::Vector(items))
        }
        other => Err(EvalError::Type(format!(
            "assoc expects a map or vector, got {}",
            other.type_label()
        ))),
    }
}

fn dissoc(args: Vec<Value>) -> Result<Value, EvalError> {
    let [target, keys @ ..] = args.as_slice() else {
        return Err(EvalError::Arity("dissoc expects (dissoc map key ...)".into()));
    };
    let Value::Map(mut map) = target.clone() else {
        return Err(EvalError::Type(format!(
            "dissoc expects a map, got {}",
            target.type_label()
        )));
    };
    for key in keys {
        map.remove(key);
    }
    Ok(Value::Map(map))
}

// ---- string helpers ----

fn want_str(v: &Value, op: &str) -> Result<String, EvalError> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(EvalError::Type(format!(
            "{op} expects a string, got {}",
            other.type_label()
        ))),
    }
}

fn join(args: Vec<Value>) -> Result<Value, EvalError> {
    let (sep, coll) = match args.as_slice() {
        [coll] => (String::new(), coll.clone()),
        [sep, coll] => (want_str(sep, "join")?, coll.clone()),
        _ => return Err(EvalError::Arity("join expects (join sep? coll)".into())),
    };
    let parts: Vec<String> = as_items(&coll, "join")?
        .iter()
        .map(|v| v.to_string())
        .collect();
    Ok(Value::Str(parts.join(&sep)))
}

fn subs(args: Vec<Value>) -> Result<Value, EvalError> {
    let (s, start, end) = match args.as_slice() {
        [s, start] => (want_str(s, "subs")?, start.clone(), None),
        [s, start, end] => (want_str(s, "subs")?, start.clone(), Some(end.clone())),
        _ => return Err(EvalError::Arity("subs expects (subs s start end?)".into())),
    };
    let Value::Int(start) = start else {
        return Err(EvalError::Type("subs start must be an integer".into()));
    };
    let chars: Vec<char> = s.chars().collect();
    let start = start.max(0) as usize;
    let end = match end {
        Some(Value::Int(e)) => (e.max(0) as usize).min(chars.len()),
        Some(other) => {
            return Err(EvalError::Type(format!(
                "subs end must be an integer, got {}",
                other.type_label()
            )))
        }
        None => chars.len(),
    };
    if start > end || start > chars.len() {
        return Err(EvalError::Type(format!(
            "subs range {start}..{end} out of bounds for length {}",
            chars.len()
        )));
    }
    Ok(Value::Str(chars[start..end].iter().collect()))
}

fn compile(pattern: &Value) -> Result<Regex, EvalError> {
    let Value::Str(pattern) = pattern else {
        return Err(EvalError::Type(format!(
            "expected a pattern string, got {}",
            pattern.type_label()
        )));
    };
    Regex::new(pattern).map_err(|e| EvalError::Type(format!("invalid regex: {e}")))
}

/// `grep` over a string (split into lines) or a collection of strings.
/// `grep-n` prefixes each hit with its 1-based line number.
fn grep(args: Vec<Value>, numbered: bool) -> Result<Value, EvalError> {
    let op = if numbered { "grep-n" } else { "grep" };
    let [pattern, source] = two(op, args)?;
    let re = compile(&pattern)?;
    let lines: Vec<String> = match &source {
        Value::Str(s) => s.lines().map(str::to_string).collect(),
        Value::Vector(items) => items
            .iter()
            .map(|v| want_str(v, op))
            .collect::<Result<Vec<_>, _>>()?,
        other => {
            return Err(EvalError::Type(format!(
                "{op} expects a string or list of strings, got {}",
                other.type_label()
            )))
        }
    };
    let hits = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| re.is_match(line))
        .map(|(i, line)| {
            Value::Str(if numbered {
                format!("{}: {line}", i + 1)
            } else {
                line.clone()
            })
        })
        .collect();
    Ok(Value::Vector(hits))
}

// ---- predicate builders ----

fn where_predicate(args: Vec<Value>) -> Result<Value, EvalError> {
    let [field, op, expected] = args.as_slice() else {
        return Err(EvalError::Arity("where expects (where field op value)".into()));
    };
    let (field, op, expected) = (field.clone(), op.clone(), expected.clone());
    let name = format!("where {}", field.pr());
    Ok(Value::NativeClosure(NativeClosure {
        name,
        func: Arc::new(move |xs: &[Value]| {
            let [x] = xs else {
                return Err(EvalError::Arity("where predicate expects one argument".into()));
            };
            let actual = apply_pure(&field, std::slice::from_ref(x))?;
            apply_pure(&op, &[actual, expected.clone()])
        }),
    }))
}

fn combine(preds: Vec<Value>, mode: &'static str) -> Result<Value, EvalError> {
    Ok(Value::NativeClosure(NativeClosure {
        name: mode.to_string(),
        func: Arc::new(move |xs: &[Value]| {
            let mut matched = 0usize;
            for pred in &preds {
                if apply_pure(pred, xs)?.truthy() {
                    matched += 1;
                } else if mode == "all-of" {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(match mode {
                "all-of" => true,
                "any-of" => matched > 0,
                _ => matched == 0,
            }))
        }),
    }))
}

fn juxt(funcs: Vec<Value>) -> Result<Value, EvalError> {
    if funcs.is_empty() {
        return Err(EvalError::Arity("juxt expects at least one function".into()));
    }
    Ok(Value::NativeClosure(NativeClosure {
        name: "juxt".to_string(),
        func: Arc::new(move |xs: &[Value]| {
            funcs
                .iter()
                .map(|f| apply_pure(f, xs))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Vector)
        }),
    }))
}

// ---- arity helpers ----

fn one(op: &str, args: Vec<Value>) -> Result<[Value; 1], EvalError> {
    <[Value; 1]>::try_from(args)
        .map_err(|got| EvalError::Arity(format!("{op} expects 1 argument, got {}", got.len())))
}

fn two(op: &str, args: Vec<Value>) -> Result<[Value; 2], EvalError> {
    <[Value; 2]>::try_from(args)
        .map_err(|got| EvalError::Arity(format!("{op} expects 2 arguments, got {}", got.len())))
}

fn two_plus_default(op: &str, args: Vec<Value>) -> Result<(Value, Value, Value), EvalError> {
    match args.as_slice() {
        [a, b] => Ok((a.clone(), b.clone(), Value::Nil)),
        [a, b, d] => Ok((a.clone(), b.clone(), d.clone())),
        _ => Err(EvalError::Arity(format!("{op} expects 2 or 3 arguments"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_vec(items: &[i64]) -> Value {
        Value::Vector(items.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn arithmetic_promotes_to_float() {
        assert_eq!(
            call_pure("+", vec![Value::Int(1), Value::Float(2.5)]).unwrap(),
            Value::Float(3.5)
        );
        assert_eq!(
            call_pure("+", vec![Value::Int(1), Value::Int(2)]).unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn division_by_zero_fails() {
        let err = call_pure("/", vec![Value::Int(1), Value::Int(0)]).unwrap_err();
        assert_eq!(err.reason(), "arithmetic_error");
    }

    #[test]
    fn integer_division_stays_exact_or_widens() {
        assert_eq!(
            call_pure("/", vec![Value::Int(6), Value::Int(3)]).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            call_pure("/", vec![Value::Int(7), Value::Int(2)]).unwrap(),
            Value::Float(3.5)
        );
    }

    #[test]
    fn comparison_chains() {
        assert_eq!(
            call_pure("<", vec![Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call_pure("<", vec![Value::Int(1), Value::Int(3), Value::Int(2)]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn get_in_walks_nested_structures() {
        let inner: ValueMap = [(Value::Keyword("b".into()), int_vec(&[10, 20]))]
            .into_iter()
            .collect();
        let outer: ValueMap = [(Value::Keyword("a".into()), Value::Map(inner))]
            .into_iter()
            .collect();
        let path = Value::Vector(vec![
            Value::Keyword("a".into()),
            Value::Keyword("b".into()),
            Value::Int(1),
        ]);
        assert_eq!(
            get_in(vec![Value::Map(outer), path]).unwrap(),
            Value::Int(20)
        );
    }

    #[test]
    fn where_builds_a_predicate() {
        let pred = call_pure(
            "where",
            vec![
                Value::Keyword("price".into()),
                Value::Native(">"),
                Value::Int(100),
            ],
        )
        .unwrap();
        let cheap: ValueMap = [(Value::Keyword("price".into()), Value::Int(10))]
            .into_iter()
            .collect();
        let pricey: ValueMap = [(Value::Keyword("price".into()), Value::Int(500))]
            .into_iter()
            .collect();
        assert_eq!(
            apply_pure(&pred, &[Value::Map(pricey)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            apply_pure(&pred, &[Value::Map(cheap)]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn combinators_compose_predicates() {
        let gt = call_pure(
            "where",
            vec![Value::Keyword("n".into()), Value::Native(">"), Value::Int(1)],
        )
        .unwrap();
        let lt = call_pure(
            "where",
            vec![Value::Keyword("n".into()), Value::Native("<"), Value::Int(5)],
        )
        .unwrap();
        let both = call_pure("all-of", vec![gt, lt]).unwrap();
        let three: ValueMap = [(Value::Keyword("n".into()), Value::Int(3))]
            .into_iter()
            .collect();
        assert_eq!(
            apply_pure(&both, &[Value::Map(three)]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn grep_n_prefixes_line_numbers() {
        let text = Value::Str("alpha\nbeta\nalphabet".into());
        let hits = call_pure("grep-n", vec![Value::Str("alpha".into()), text]).unwrap();
        assert_eq!(
            hits,
            Value::Vector(vec![
                Value::Str("1: alpha".into()),
                Value::Str("3: alphabet".into()),
            ])
        );
    }

    #[test]
    fn sets_act_as_membership_predicates() {
        let set = Value::Set([Value::Int(1), Value::Int(2)].into_iter().collect());
        assert_eq!(apply_pure(&set, &[Value::Int(2)]).unwrap(), Value::Int(2));
        assert_eq!(apply_pure(&set, &[Value::Int(9)]).unwrap(), Value::Nil);
    }

    #[test]
    fn keyword_lookup_with_default() {
        let map: ValueMap = [(Value::Keyword("a".into()), Value::Int(1))]
            .into_iter()
            .collect();
        let kw = Value::Keyword("missing".into());
        assert_eq!(
            apply_pure(&kw, &[Value::Map(map), Value::Int(42)]).unwrap(),
            Value::Int(42)
        );
    }
}
