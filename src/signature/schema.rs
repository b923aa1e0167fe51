use std::collections::HashMap;

use serde_json::{json, Value as JsonValue};

use super::{Prim, Signature, SigType};

/// Projects a type to JSON Schema. Optionals become nullable; struct
/// optionals additionally drop out of `required`.
pub fn type_to_schema(ty: &SigType) -> JsonValue {
    let schema = match ty {
        SigType::Primitive { prim, .. } => match prim {
            Prim::Any => json!({}),
            Prim::Str | Prim::Keyword => json!({"type": "string"}),
            Prim::Int => json!({"type": "integer"}),
            Prim::Float => json!({"type": "number"}),
            Prim::Bool => json!({"type": "boolean"}),
            Prim::Map => json!({"type": "object"}),
            // Functions have no JSON projection; accept anything.
            Prim::Fn => json!({}),
        },
        SigType::List { elem, .. } => json!({
            "type": "array",
            "items": type_to_schema(elem),
        }),
        SigType::Struct { fields, .. } => {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for field in fields {
                properties.insert(field.name.clone(), type_to_schema(&field.ty));
                if !field.ty.optional() {
                    required.push(JsonValue::String(field.name.clone()));
                }
            }
            json!({
                "type": "object",
                "properties": properties,
                "required": required,
            })
        }
    };
    if ty.optional() {
        nullable(schema)
    } else {
        schema
    }
}

/// Schema of the signature's return half (the contract JSON mode enforces).
pub fn return_schema(signature: &Signature) -> JsonValue {
    type_to_schema(&signature.ret)
}

/// Schema of the input parameters as one object; used for native tool-call
/// function schemas.
pub fn params_schema(signature: &Signature) -> JsonValue {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in &signature.params {
        properties.insert(param.name.clone(), type_to_schema(&param.ty));
        if !param.ty.optional() {
            required.push(JsonValue::String(param.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Injects per-field descriptions into an object schema's properties.
pub fn apply_descriptions(schema: &mut JsonValue, descriptions: &HashMap<String, String>) {
    if descriptions.is_empty() {
        return;
    }
    let Some(properties) = schema
        .get_mut("properties")
        .and_then(JsonValue::as_object_mut)
    else {
        return;
    };
    for (name, description) in descriptions {
        if let Some(JsonValue::Object(prop)) = properties.get_mut(name) {
            prop.insert("description".into(), json!(description));
        }
    }
}

fn nullable(schema: JsonValue) -> JsonValue {
    match schema {
        JsonValue::Object(mut obj) => {
            match obj.get("type").cloned() {
                Some(JsonValue::String(t)) => {
                    obj.insert("type".into(), json!([t, "null"]));
                }
                _ => {
                    return json!({"anyOf": [JsonValue::Object(obj), {"type": "null"}]});
                }
            }
            JsonValue::Object(obj)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::parse_signature;

    #[test]
    fn struct_schema_tracks_required() {
        let sig = parse_signature("{result :int, note :string?}").unwrap();
        let schema = return_schema(&sig);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["result"]["type"], "integer");
        assert_eq!(schema["required"], json!(["result"]));
        assert_eq!(schema["properties"]["note"]["type"], json!(["string", "null"]));
    }

    #[test]
    fn list_schema_nests_items() {
        let sig = parse_signature("[{id :int}]").unwrap();
        let schema = return_schema(&sig);
        assert_eq!(schema["type"], "array");
        assert_eq!(schema["items"]["properties"]["id"]["type"], "integer");
    }

    #[test]
    fn descriptions_are_injected() {
        let sig = parse_signature("{result :int}").unwrap();
        let mut schema = return_schema(&sig);
        let descriptions =
            HashMap::from([("result".to_string(), "the computed value".to_string())]);
        apply_descriptions(&mut schema, &descriptions);
        assert_eq!(
            schema["properties"]["result"]["description"],
            "the computed value"
        );
    }
}
