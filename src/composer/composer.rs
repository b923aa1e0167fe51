use std::collections::HashMap;

use indoc::formatdoc;

use crate::lang::Value;
use crate::render::{firewalled, FIREWALLED_LABEL};
use crate::signature::{Signature, SigType};
use crate::tools::Toolset;

use super::{
    Customize, JOURNAL_REFERENCE, LANGUAGE_REFERENCE, LANGUAGE_REFERENCE_SINGLE_TURN,
    OUTPUT_CONTRACT, ROLE,
};

/// Builds the static SYSTEM prompt and the per-turn USER context block
/// (data inventory + tool schemas).
pub struct Composer<'a> {
    pub signature: Option<&'a Signature>,
    pub toolset: &'a Toolset,
    pub multi_turn: bool,
    pub journaling: bool,
    pub customize: &'a Customize,
    pub max_chars: Option<usize>,
}

impl Composer<'_> {
    pub fn system_prompt(&self) -> String {
        let reference = if self.multi_turn {
            LANGUAGE_REFERENCE
        } else {
            LANGUAGE_REFERENCE_SINGLE_TURN
        };
        let mut composed = formatdoc! {"
            {ROLE}

            {OUTPUT_CONTRACT}

            {reference}"};
        if self.journaling {
            composed.push_str("\n\n");
            composed.push_str(JOURNAL_REFERENCE);
        }
        self.truncate(self.customize.apply(composed))
    }

    /// The dynamic half: what data exists and what tools can be called.
    /// `tools_enabled` is false on must-return and retry turns.
    pub fn context_block(&self, ctx: &HashMap<String, Value>, tools_enabled: bool) -> String {
        let mut out = String::new();

        if !ctx.is_empty() {
            out.push_str("## Data inventory\n");
            let mut keys: Vec<&String> = ctx.keys().collect();
            keys.sort();
            for key in keys {
                let Some(value) = ctx.get(key) else { continue };
                if firewalled(key) {
                    out.push_str(&format!("- data/{key}: {FIREWALLED_LABEL}\n"));
                    continue;
                }
                let ty = self
                    .signature
                    .and_then(|s| s.param(key))
                    .map(|p| p.ty.to_string())
                    .unwrap_or_else(|| value.type_label());
                out.push_str(&format!("- data/{key}: {ty} = {}\n", value.summarize()));
            }
        }

        if tools_enabled && self.toolset.has_callable() {
            out.push_str("\n## Tools\n");
            for name in self.toolset.names() {
                let Some(entry) = self.toolset.get(name) else {
                    continue;
                };
                let signature = entry.effective_signature();
                let contract = signature
                    .as_ref()
                    .map(|s| format!("Signature: {s}\n"))
                    .unwrap_or_default();
                let description = match entry.effective_description() {
                    d if d.is_empty() => d,
                    d => format!("{d}\n"),
                };
                out.push_str(&formatdoc! {"
                    ### tool/{name}
                    {contract}{description}Example: {example}
                ", example = usage_example(name, &signature)});
            }
        }

        if tools_enabled && !self.toolset.catalog_names().is_empty() {
            out.push_str("\n## Planning catalog (not callable)\n");
            for name in self.toolset.catalog_names() {
                let Some(entry) = self.toolset.catalog_entry(name) else {
                    continue;
                };
                match (&entry.signature, &entry.description) {
                    (Some(sig), Some(desc)) => {
                        out.push_str(&format!("- {name}: {sig} — {desc}\n"))
                    }
                    (Some(sig), None) => out.push_str(&format!("- {name}: {sig}\n")),
                    (None, Some(desc)) => out.push_str(&format!("- {name} — {desc}\n")),
                    (None, None) => out.push_str(&format!("- {name}\n")),
                }
            }
        }

        self.truncate(out.trim_end().to_string())
    }

    fn truncate(&self, text: String) -> String {
        match self.max_chars {
            Some(max) if text.chars().count() > max => {
                let kept: String = text.chars().take(max).collect();
                format!("{kept}\n[truncated]")
            }
            _ => text,
        }
    }
}

/// One-line invocation example derived from a tool's signature.
fn usage_example(name: &str, signature: &Option<Signature>) -> String {
    let Some(signature) = signature else {
        return format!("(tool/{name} {{:key \"value\"}})");
    };
    if signature.params.is_empty() {
        return format!("(tool/{name})");
    }
    let args: Vec<String> = signature
        .params
        .iter()
        .map(|p| format!(":{} {}", p.name, placeholder(&p.ty)))
        .collect();
    format!("(tool/{name} {})", args.join(" "))
}

fn placeholder(ty: &SigType) -> &'static str {
    match ty {
        SigType::Primitive { prim, .. } => match prim {
            crate::signature::Prim::Str => "\"...\"",
            crate::signature::Prim::Int => "1",
            crate::signature::Prim::Float => "1.0",
            crate::signature::Prim::Bool => "true",
            crate::signature::Prim::Keyword => ":key",
            _ => "{}",
        },
        SigType::List { .. } => "[...]",
        SigType::Struct { .. } => "{...}",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::parse_signature;
    use crate::tools::{FnTool, ToolEntry};

    fn toolset() -> Toolset {
        let mut toolset = Toolset::new();
        toolset.register(
            "search",
            ToolEntry::func(
                FnTool::new("search", |_| async { Ok(serde_json::json!([])) })
                    .with_description("Searches the corpus."),
            )
            .with_signature(parse_signature("(query :string) -> [:string]").unwrap()),
        );
        toolset
    }

    #[test]
    fn system_prompt_selects_reference_variant() {
        let toolset = Toolset::new();
        let customize = Customize::default();
        let multi = Composer {
            signature: None,
            toolset: &toolset,
            multi_turn: true,
            journaling: false,
            customize: &customize,
            max_chars: None,
        };
        assert!(multi.system_prompt().contains("memory/name"));

        let single = Composer {
            multi_turn: false,
            ..multi
        };
        assert!(!single.system_prompt().contains("memory/name"));
        assert!(single.system_prompt().contains("(return value)"));
    }

    #[test]
    fn context_block_lists_data_and_tools() {
        let toolset = toolset();
        let customize = Customize::default();
        let signature = parse_signature("(n :int) -> :int").unwrap();
        let composer = Composer {
            signature: Some(&signature),
            toolset: &toolset,
            multi_turn: true,
            journaling: false,
            customize: &customize,
            max_chars: None,
        };
        let ctx = HashMap::from([
            ("n".to_string(), Value::Int(5)),
            ("_token".to_string(), Value::Str("secret".into())),
        ]);
        let block = composer.context_block(&ctx, true);
        assert!(block.contains("- data/n: :int = 5"));
        assert!(block.contains("- data/_token: [Firewalled] [Hidden]"));
        assert!(!block.contains("secret"));
        assert!(block.contains("### tool/search"));
        assert!(block.contains("Example: (tool/search :query \"...\")"));

        let stripped = composer.context_block(&ctx, false);
        assert!(!stripped.contains("tool/search"));
    }

    #[test]
    fn max_chars_truncates_visibly() {
        let toolset = Toolset::new();
        let customize = Customize::default();
        let composer = Composer {
            signature: None,
            toolset: &toolset,
            multi_turn: true,
            journaling: false,
            customize: &customize,
            max_chars: Some(50),
        };
        let prompt = composer.system_prompt();
        assert!(prompt.ends_with("[truncated]"));
        assert!(prompt.chars().count() <= 50 + "\n[truncated]".len());
    }

    #[test]
    fn customize_prefix_and_suffix() {
        let toolset = Toolset::new();
        let customize = Customize {
            prefix: Some("PREFIX".into()),
            suffix: Some("SUFFIX".into()),
            ..Default::default()
        };
        let composer = Composer {
            signature: None,
            toolset: &toolset,
            multi_turn: true,
            journaling: false,
            customize: &customize,
            max_chars: None,
        };
        let prompt = composer.system_prompt();
        assert!(prompt.starts_with("PREFIX"));
        assert!(prompt.ends_with("SUFFIX"));
    }
}
