use std::fmt;

use crate::lang::Value;

use super::{Prim, SigType};

/// One mismatch found while validating a value against a type.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// Dotted path into the value, e.g. `a.b.0.c`; empty at the root.
    pub path: String,
    pub expected: String,
    pub got: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "expected {}, got {}", self.expected, self.got)
        } else {
            write!(f, "[{}] expected {}, got {}", self.path, self.expected, self.got)
        }
    }
}

/// Validates `value` against `ty`, collecting every mismatch rather than
/// stopping at the first.
pub fn validate(ty: &SigType, value: &Value) -> Vec<Violation> {
    let mut violations = Vec::new();
    check(ty, value, &mut Vec::new(), &mut violations);
    violations
}

fn check(ty: &SigType, value: &Value, path: &mut Vec<String>, out: &mut Vec<Violation>) {
    if ty.optional() && matches!(value, Value::Nil) {
        return;
    }
    match ty {
        SigType::Primitive { prim, .. } => check_prim(*prim, value, path, out),
        SigType::List { elem, .. } => match value {
            Value::Vector(items) => {
                for (i, item) in items.iter().enumerate() {
                    path.push(i.to_string());
                    check(elem, item, path, out);
                    path.pop();
                }
            }
            other => push(out, path, ty.to_string(), other),
        },
        SigType::Struct { fields, .. } => match value {
            Value::Map(map) => {
                for field in fields {
                    let found = map
                        .get(&Value::Keyword(field.name.clone()))
                        .or_else(|| map.get(&Value::Str(field.name.clone())));
                    path.push(field.name.clone());
                    match found {
                        Some(inner) => check(&field.ty, inner, path, out),
                        None if field.ty.optional() => {}
                        None => out.push(Violation {
                            path: path.join("."),
                            expected: field.ty.to_string(),
                            got: "missing".into(),
                        }),
                    }
                    path.pop();
                }
            }
            other => push(out, path, ty.to_string(), other),
        },
    }
}

fn check_prim(prim: Prim, value: &Value, path: &mut Vec<String>, out: &mut Vec<Violation>) {
    let ok = match prim {
        Prim::Any => true,
        Prim::Str => matches!(value, Value::Str(_)),
        Prim::Int => matches!(value, Value::Int(_)),
        // Integers widen to float.
        Prim::Float => matches!(value, Value::Float(_) | Value::Int(_)),
        Prim::Bool => matches!(value, Value::Bool(_)),
        Prim::Keyword => matches!(value, Value::Keyword(_)),
        Prim::Map => matches!(value, Value::Map(_)),
        Prim::Fn => matches!(
            value,
            Value::Closure(_) | Value::Native(_) | Value::NativeClosure(_)
        ),
    };
    if !ok {
        push(out, path, prim.name().to_string(), value);
    }
}

fn push(out: &mut Vec<Violation>, path: &[String], expected: String, got: &Value) {
    out.push(Violation {
        path: path.join("."),
        expected,
        got: got.type_label(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::parse_type_expr;
    use crate::lang::ValueMap;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Keyword(k.into()), v))
                .collect::<ValueMap>(),
        )
    }

    #[test]
    fn accepts_matching_struct() {
        let ty = parse_type_expr("{result :int, note :string?}").unwrap();
        let value = map(vec![("result", Value::Int(4))]);
        assert!(validate(&ty, &value).is_empty());
    }

    #[test]
    fn reports_every_mismatch_with_paths() {
        let ty = parse_type_expr("{items [{n :int}], name :string}").unwrap();
        let value = map(vec![(
            "items",
            Value::Vector(vec![
                map(vec![("n", Value::Int(1))]),
                map(vec![("n", Value::Str("two".into()))]),
            ]),
        )]);
        let violations = validate(&ty, &value);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].path, "items.1.n");
        assert_eq!(violations[0].got, "string");
        assert_eq!(violations[1].path, "name");
        assert_eq!(violations[1].got, "missing");
    }

    #[test]
    fn int_widens_to_float_but_not_bool() {
        let ty = parse_type_expr("{value :float}").unwrap();
        assert!(validate(&ty, &map(vec![("value", Value::Int(1))])).is_empty());
        assert!(validate(&ty, &map(vec![("value", Value::Float(1.0))])).is_empty());
        assert_eq!(validate(&ty, &map(vec![("value", Value::Bool(true))])).len(), 1);
        assert_eq!(
            validate(&ty, &map(vec![("value", Value::Str("bad".into()))])).len(),
            1
        );
    }

    #[test]
    fn optional_accepts_nil() {
        let ty = parse_type_expr(":int?").unwrap();
        assert!(validate(&ty, &Value::Nil).is_empty());
        assert!(validate(&ty, &Value::Int(3)).is_empty());
        assert_eq!(validate(&ty, &Value::Str("x".into())).len(), 1);
    }
}
