use std::collections::{HashMap, HashSet};

use crate::lang::Value;
use crate::signature::{Prim, Signature, SigType};

use super::TemplateError;

/// Mustache-style template: `{{var}}`, `{{#section}}...{{/section}}`,
/// inverted `{{^section}}`, dotted paths, and `{{.}}` for the scalar element
/// inside a section.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Var(Vec<String>),
    Section {
        path: Vec<String>,
        inverted: bool,
        body: Vec<Segment>,
    },
}

impl Template {
    pub fn parse(source: &str) -> Result<Template, TemplateError> {
        let mut tokens = tokenize(source)?;
        let segments = parse_segments(&mut tokens, None)?;
        Ok(Template { segments })
    }

    /// Root names referenced anywhere in the template (variables and
    /// sections).
    pub fn variables(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        collect_roots(&self.segments, &mut out);
        out
    }

    pub fn render(&self, ctx: &HashMap<String, Value>) -> Result<String, TemplateError> {
        let root = Value::Map(
            ctx.iter()
                .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
                .collect(),
        );
        let mut out = String::new();
        render_segments(&self.segments, &[root], &mut out)?;
        Ok(out)
    }

    /// Construction-time consistency with a signature: every input parameter
    /// must appear, section bodies must match element shapes, and `{{.}}` is
    /// only valid for scalar element lists.
    pub fn validate(&self, signature: &Signature) -> Result<(), TemplateError> {
        let used = self.variables();
        for param in &signature.params {
            if !used.contains(&param.name) {
                return Err(TemplateError::Validation(format!(
                    "input parameter '{}' does not appear in the prompt",
                    param.name
                )));
            }
        }
        for segment in &self.segments {
            validate_segment(segment, signature)?;
        }
        Ok(())
    }
}

fn validate_segment(segment: &Segment, signature: &Signature) -> Result<(), TemplateError> {
    let Segment::Section {
        path,
        inverted,
        body,
    } = segment
    else {
        return Ok(());
    };
    if *inverted {
        return Ok(());
    }
    let Some(param) = path.first().and_then(|root| signature.param(root)) else {
        return Ok(());
    };
    if let SigType::List { elem, .. } = &param.ty {
        let scalar_elem = matches!(
            elem.as_ref(),
            SigType::Primitive { prim, .. } if !matches!(prim, Prim::Map)
        );
        for inner in body {
            match inner {
                Segment::Var(p) if p == &vec![".".to_string()] => {
                    if !scalar_elem {
                        return Err(TemplateError::Validation(format!(
                            "{{{{.}}}} inside '{}' requires a list of scalars",
                            param.name
                        )));
                    }
                }
                Segment::Var(p) => {
                    if let SigType::Struct { fields, .. } = elem.as_ref() {
                        let Some(root) = p.first() else { continue };
                        if !fields.iter().any(|f| &f.name == root) {
                            return Err(TemplateError::Validation(format!(
                                "field '{root}' is not part of the '{}' elements",
                                param.name
                            )));
                        }
                    }
                }
                _ => validate_segment(inner, signature)?,
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
enum Token {
    Text(String),
    Var(Vec<String>),
    Open(Vec<String>, bool),
    Close(Vec<String>),
}

fn tokenize(source: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            tokens.push(Token::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Parse("unclosed '{{'".into()));
        };
        let tag = after[..end].trim();
        if tag.is_empty() {
            return Err(TemplateError::Parse("empty '{{}}' tag".into()));
        }
        tokens.push(match tag.chars().next() {
            Some('#') => Token::Open(split_path(tag[1..].trim())?, false),
            Some('^') => Token::Open(split_path(tag[1..].trim())?, true),
            Some('/') => Token::Close(split_path(tag[1..].trim())?),
            _ => Token::Var(split_path(tag)?),
        });
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest.to_string()));
    }
    tokens.reverse();
    Ok(tokens)
}

fn split_path(tag: &str) -> Result<Vec<String>, TemplateError> {
    if tag == "." {
        return Ok(vec![".".to_string()]);
    }
    if tag.is_empty() || tag.contains(char::is_whitespace) {
        return Err(TemplateError::Parse(format!("malformed tag '{tag}'")));
    }
    Ok(tag.split('.').map(str::to_string).collect())
}

fn parse_segments(
    tokens: &mut Vec<Token>,
    open: Option<&[String]>,
) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    while let Some(token) = tokens.pop() {
        match token {
            Token::Text(text) => segments.push(Segment::Text(text)),
            Token::Var(path) => segments.push(Segment::Var(path)),
            Token::Open(path, inverted) => {
                let body = parse_segments(tokens, Some(&path))?;
                segments.push(Segment::Section {
                    path,
                    inverted,
                    body,
                });
            }
            Token::Close(path) => {
                return match open {
                    Some(open) if open == path.as_slice() => Ok(segments),
                    _ => Err(TemplateError::Parse(format!(
                        "unexpected closing tag '{{{{/{}}}}}'",
                        path.join(".")
                    ))),
                };
            }
        }
    }
    match open {
        Some(open) => Err(TemplateError::Parse(format!(
            "unclosed section '{{{{#{}}}}}'",
            open.join(".")
        ))),
        None => Ok(segments),
    }
}

fn collect_roots(segments: &[Segment], out: &mut HashSet<String>) {
    for segment in segments {
        match segment {
            Segment::Text(_) => {}
            Segment::Var(path) => {
                if let Some(root) = path.first() {
                    if root != "." {
                        out.insert(root.clone());
                    }
                }
            }
            Segment::Section { path, body, .. } => {
                if let Some(root) = path.first() {
                    out.insert(root.clone());
                }
                collect_roots(body, out);
            }
        }
    }
}

fn render_segments(
    segments: &[Segment],
    scopes: &[Value],
    out: &mut String,
) -> Result<(), TemplateError> {
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Var(path) => {
                let value = resolve(path, scopes)
                    .ok_or_else(|| TemplateError::MissingVariable(path.join(".")))?;
                out.push_str(&value.to_string());
            }
            Segment::Section {
                path,
                inverted,
                body,
            } => {
                let value = resolve(path, scopes).unwrap_or(Value::Nil);
                let present = match &value {
                    Value::Nil | Value::Bool(false) => false,
                    Value::Vector(items) => !items.is_empty(),
                    _ => true,
                };
                if *inverted {
                    if !present {
                        render_segments(body, scopes, out)?;
                    }
                    continue;
                }
                if !present {
                    continue;
                }
                match value {
                    Value::Vector(items) => {
                        for item in items {
                            let mut inner = scopes.to_vec();
                            inner.push(item);
                            render_segments(body, &inner, out)?;
                        }
                    }
                    other => {
                        let mut inner = scopes.to_vec();
                        inner.push(other);
                        render_segments(body, &inner, out)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Innermost scope wins; `.` is the current element.
fn resolve(path: &[String], scopes: &[Value]) -> Option<Value> {
    if path == ["."] {
        return scopes.last().cloned();
    }
    let root = path.first()?;
    for scope in scopes.iter().rev() {
        if let Some(mut current) = field_of(scope, root) {
            for key in &path[1..] {
                current = field_of(&current, key)?;
            }
            return Some(current);
        }
    }
    None
}

fn field_of(value: &Value, key: &str) -> Option<Value> {
    let Value::Map(map) = value else {
        return None;
    };
    map.get(&Value::Str(key.to_string()))
        .or_else(|| map.get(&Value::Keyword(key.to_string())))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ValueMap;
    use crate::signature::parse_signature;

    fn ctx(entries: Vec<(&str, Value)>) -> HashMap<String, Value> {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn item(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Keyword(k.to_string()), v))
                .collect::<ValueMap>(),
        )
    }

    #[test]
    fn renders_variables_and_dot_paths() {
        let template = Template::parse("Hello {{name}}, {{user.city}}!").unwrap();
        let rendered = template
            .render(&ctx(vec![
                ("name", Value::Str("Alice".into())),
                ("user", item(vec![("city", Value::Str("Oslo".into()))])),
            ]))
            .unwrap();
        assert_eq!(rendered, "Hello Alice, Oslo!");
    }

    #[test]
    fn missing_variable_errors() {
        let template = Template::parse("{{name}}").unwrap();
        let err = template.render(&ctx(vec![])).unwrap_err();
        assert_eq!(err, TemplateError::MissingVariable("name".into()));
    }

    #[test]
    fn sections_iterate_lists() {
        let template = Template::parse("{{#items}}{{label}}: {{n}}; {{/items}}").unwrap();
        let rendered = template
            .render(&ctx(vec![(
                "items",
                Value::Vector(vec![
                    item(vec![("label", Value::Str("a".into())), ("n", Value::Int(1))]),
                    item(vec![("label", Value::Str("b".into())), ("n", Value::Int(2))]),
                ]),
            )]))
            .unwrap();
        assert_eq!(rendered, "a: 1; b: 2; ");
    }

    #[test]
    fn dot_renders_scalar_elements() {
        let template = Template::parse("{{#tags}}[{{.}}]{{/tags}}").unwrap();
        let rendered = template
            .render(&ctx(vec![(
                "tags",
                Value::Vector(vec![Value::Str("x".into()), Value::Str("y".into())]),
            )]))
            .unwrap();
        assert_eq!(rendered, "[x][y]");
    }

    #[test]
    fn inverted_sections_render_on_empty() {
        let template = Template::parse("{{^items}}none{{/items}}{{#items}}some{{/items}}").unwrap();
        assert_eq!(
            template
                .render(&ctx(vec![("items", Value::Vector(vec![]))]))
                .unwrap(),
            "none"
        );
        assert_eq!(
            template
                .render(&ctx(vec![("items", Value::Vector(vec![Value::Int(1)]))]))
                .unwrap(),
            "some"
        );
    }

    #[test]
    fn unclosed_section_is_a_parse_error() {
        assert!(Template::parse("{{#items}}x").is_err());
        assert!(Template::parse("x{{/items}}").is_err());
    }

    #[test]
    fn validate_requires_all_signature_inputs() {
        let template = Template::parse("only {{a}}").unwrap();
        let signature = parse_signature("(a :string, b :int) -> :string").unwrap();
        let err = template.validate(&signature).unwrap_err();
        assert!(matches!(err, TemplateError::Validation(_)));
    }

    #[test]
    fn validate_checks_section_fields() {
        let signature =
            parse_signature("(items [{label :string}]) -> :string").unwrap();
        let good = Template::parse("{{#items}}{{label}}{{/items}}").unwrap();
        assert!(good.validate(&signature).is_ok());
        let bad = Template::parse("{{#items}}{{missing}}{{/items}}").unwrap();
        assert!(bad.validate(&signature).is_err());

        let scalar_sig = parse_signature("(items [:string]) -> :string").unwrap();
        let dotted = Template::parse("{{#items}}{{.}}{{/items}}").unwrap();
        assert!(dotted.validate(&scalar_sig).is_ok());
        let struct_dot = Template::parse("{{#items}}{{.}}{{/items}}").unwrap();
        assert!(struct_dot.validate(&signature).is_err());
    }
}
