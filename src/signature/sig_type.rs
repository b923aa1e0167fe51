use std::fmt;

/// Primitive type atoms of the signature grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prim {
    Str,
    Int,
    Float,
    Bool,
    Keyword,
    Map,
    Fn,
    Any,
}

impl Prim {
    pub fn name(&self) -> &'static str {
        match self {
            Prim::Str => ":string",
            Prim::Int => ":int",
            Prim::Float => ":float",
            Prim::Bool => ":bool",
            Prim::Keyword => ":keyword",
            Prim::Map => ":map",
            Prim::Fn => ":fn",
            Prim::Any => ":any",
        }
    }

    pub fn from_name(name: &str) -> Option<Prim> {
        Some(match name {
            "string" => Prim::Str,
            "int" => Prim::Int,
            "float" => Prim::Float,
            "bool" => Prim::Bool,
            "keyword" => Prim::Keyword,
            "map" => Prim::Map,
            "fn" => Prim::Fn,
            "any" => Prim::Any,
            _ => return None,
        })
    }
}

/// A type expression: primitive, list, or struct, each optionally nilable.
#[derive(Debug, Clone, PartialEq)]
pub enum SigType {
    Primitive { prim: Prim, optional: bool },
    List { elem: Box<SigType>, optional: bool },
    Struct { fields: Vec<Field>, optional: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: SigType,
}

impl SigType {
    pub fn optional(&self) -> bool {
        match self {
            SigType::Primitive { optional, .. }
            | SigType::List { optional, .. }
            | SigType::Struct { optional, .. } => *optional,
        }
    }

    pub fn any() -> SigType {
        SigType::Primitive {
            prim: Prim::Any,
            optional: false,
        }
    }
}

impl fmt::Display for SigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.optional() { "?" } else { "" };
        match self {
            SigType::Primitive { prim, .. } => write!(f, "{}{suffix}", prim.name()),
            SigType::List { elem, .. } => write!(f, "[{elem}]{suffix}"),
            SigType::Struct { fields, .. } => {
                let inner: Vec<String> = fields
                    .iter()
                    .map(|field| format!("{} {}", field.name, field.ty))
                    .collect();
                write!(f, "{{{}}}{suffix}", inner.join(", "))
            }
        }
    }
}

/// A typed contract: named input parameters and a return type.
///
/// Shorthand signatures (`":int"`, `"{value :float}"`) have no parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: SigType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: SigType,
}

impl Signature {
    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Canonical source form; parsing the result yields an equal signature.
    pub fn render(&self) -> String {
        if self.params.is_empty() {
            return self.ret.to_string();
        }
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{} {}", p.name, p.ty))
            .collect();
        format!("({}) -> {}", params.join(", "), self.ret)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}
