//! A multi-turn SubAgent runtime: an LLM drives a task by emitting small
//! programs in a Clojure-flavored expression language, which are parsed,
//! analyzed, sandboxed, and executed against an ambient data context and a
//! registry of host tools. A compressed summary of each outcome feeds the
//! next turn until the program returns, fails, or a budget runs out.
//!
//! ```rust,no_run
//! use subagent::agent::Agent;
//! use subagent::executor::{run, RunOptions};
//! use subagent::llm::ScriptedLlm;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = Agent::builder()
//!     .prompt("What is 2+2?")
//!     .signature("() -> :int")?
//!     .max_turns(1)
//!     .build()?;
//!
//! let llm = ScriptedLlm::new().reply("```clojure\n(return (+ 2 2))\n```");
//! let step = run(agent, RunOptions::new().with_llm(llm)).await;
//! assert_eq!(step.return_value, Some(subagent::lang::Value::Int(4)));
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod composer;
pub mod executor;
pub mod lang;
pub mod llm;
pub mod render;
pub mod schemas;
pub mod signature;
pub mod telemetry;
pub mod template;
pub mod tools;
