use std::sync::Arc;

/// Caller adjustments to the composed system prompt, applied in order:
/// `replace` wins outright, otherwise `transform`, otherwise
/// prefix/suffix concatenation.
#[derive(Clone, Default)]
pub struct Customize {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub transform: Option<Arc<dyn Fn(String) -> String + Send + Sync>>,
    pub replace: Option<String>,
}

impl Customize {
    pub fn prefix(text: impl Into<String>) -> Self {
        Self {
            prefix: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn suffix(text: impl Into<String>) -> Self {
        Self {
            suffix: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn replace(text: impl Into<String>) -> Self {
        Self {
            replace: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn transform(f: impl Fn(String) -> String + Send + Sync + 'static) -> Self {
        Self {
            transform: Some(Arc::new(f)),
            ..Default::default()
        }
    }

    pub fn apply(&self, composed: String) -> String {
        if let Some(replacement) = &self.replace {
            return replacement.clone();
        }
        let composed = match &self.transform {
            Some(f) => f(composed),
            None => composed,
        };
        let mut out = String::new();
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push_str("\n\n");
        }
        out.push_str(&composed);
        if let Some(suffix) = &self.suffix {
            out.push_str("\n\n");
            out.push_str(suffix);
        }
        out
    }
}

impl std::fmt::Debug for Customize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Customize")
            .field("prefix", &self.prefix)
            .field("suffix", &self.suffix)
            .field("transform", &self.transform.is_some())
            .field("replace", &self.replace.is_some())
            .finish()
    }
}
