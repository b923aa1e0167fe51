use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::Agent;
use crate::lang::Value;
use crate::schemas::{Fail, Step, Usage};

use super::{run, RunOptions};

/// Pipes one step into the next agent: the upstream `return` becomes the
/// downstream context. An upstream failure short-circuits without calling
/// the LLM, producing `chained_failure` with the upstream step in
/// `details`.
pub async fn then(step: Step, agent: impl Into<Arc<Agent>>, mut opts: RunOptions) -> Step {
    if let Some(fail) = &step.fail {
        let details = serde_json::to_value(&step)
            .map(|json| Value::from_json(&json))
            .unwrap_or(Value::Nil);
        return Step {
            return_value: None,
            fail: Some(
                Fail::new(
                    "chained_failure",
                    format!("upstream step failed: {} ({})", fail.message, fail.reason),
                )
                .with_details(details),
            ),
            memory: HashMap::new(),
            turns: None,
            messages: None,
            usage: Usage::default(),
        };
    }

    for (key, value) in piped_context(&step.return_value) {
        opts.context.insert(key, value);
    }
    run(agent, opts).await
}

/// A map return spreads into named context keys; anything else lands under
/// `input`.
fn piped_context(return_value: &Option<Value>) -> HashMap<String, Value> {
    match return_value {
        Some(Value::Map(map)) => map
            .iter()
            .map(|(k, v)| (k.as_json_key(), v.clone()))
            .collect(),
        Some(other) => HashMap::from([("input".to_string(), other.clone())]),
        None => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_returns_spread_into_context() {
        let mut map = crate::lang::ValueMap::new();
        map.insert(Value::Keyword("total".into()), Value::Int(7));
        let piped = piped_context(&Some(Value::Map(map)));
        assert_eq!(piped.get("total"), Some(&Value::Int(7)));

        let scalar = piped_context(&Some(Value::Int(3)));
        assert_eq!(scalar.get("input"), Some(&Value::Int(3)));
    }
}
