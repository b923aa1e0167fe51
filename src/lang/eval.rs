use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_recursion::async_recursion;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::ast::{Literal, Node, Pattern};
use super::builtins;
use super::error::EvalError;
use super::value::{Closure, Value, ValueMap, ValueSet};

/// Control-flow result of evaluating one node. `Recur` and `Signal` travel
/// up to their handlers (`loop` and the agent loop respectively) without
/// being errors.
#[derive(Debug, Clone)]
pub enum Ctl {
    Value(Value),
    Recur(Vec<Value>),
    Signal(Signal),
}

/// Non-local terminal signals. Caught only at the loop boundary; they never
/// cross a tool-handler boundary.
#[derive(Debug, Clone)]
pub enum Signal {
    Return(Value),
    Fail(Value),
}

pub type Flow = Result<Ctl, EvalError>;

/// Shorthand: unwrap a `Ctl::Value`, short-circuiting `Recur`/`Signal`
/// upward.
macro_rules! value {
    ($flow:expr) => {
        match $flow {
            Ctl::Value(v) => v,
            other => return Ok(other),
        }
    };
}

/// Error-or-flow escape hatch used by `apply_value` call sites.
enum Ctl2 {
    Flow(Ctl),
    Error(EvalError),
}

macro_rules! ctl2 {
    ($result:expr) => {
        match $result {
            Ok(v) => v,
            Err(Ctl2::Flow(flow)) => return Ok(flow),
            Err(Ctl2::Error(e)) => return Err(e),
        }
    };
}

/// Hook the evaluator uses to run `(tool/name ...)`. Implemented by the
/// dispatcher; the evaluator itself knows nothing about registries or
/// caching.
#[async_trait]
pub trait ToolExec: Send + Sync {
    async fn dispatch(
        &self,
        name: &str,
        args: JsonValue,
        caller: CallerInfo,
    ) -> Result<Value, EvalError>;
}

/// Context about the calling program handed to the dispatcher per call.
#[derive(Debug, Clone, Default)]
pub struct CallerInfo {
    /// Closure-valued memory bindings, for `:self` inheritance. Names
    /// beginning with `_` are excluded before this is built.
    pub closures: HashMap<String, Value>,
}

/// Task journal shared across turns of one run. Commits happen only on
/// success.
pub type Journal = Arc<Mutex<HashMap<String, Value>>>;

type Env = HashMap<String, Value>;

/// The interpreter state for one agent run. Lives across turns: memory and
/// the journal persist, prints are drained per turn by the loop.
pub struct Interp {
    /// Read-only ambient data (`data/` namespace).
    pub ctx: Arc<HashMap<String, Value>>,
    /// User namespace (`def` / `memory/`). Accumulative within a run.
    pub memory: HashMap<String, Value>,
    /// Most-recent-first turn results backing `*1 *2 *3`.
    pub history: Vec<Value>,
    /// Captured `println` lines for the current turn.
    pub prints: Vec<String>,
    pub journal: Journal,
    pub tools: Option<Arc<dyn ToolExec>>,
    /// `(budget/remaining)` snapshot; empty outside a loop.
    pub budget: ValueMap,
    pub pmap_timeout: Duration,
    pub loop_limit: usize,
}

impl Interp {
    pub fn new(ctx: HashMap<String, Value>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            memory: HashMap::new(),
            history: Vec::new(),
            prints: Vec::new(),
            journal: Arc::new(Mutex::new(HashMap::new())),
            tools: None,
            budget: ValueMap::new(),
            pmap_timeout: Duration::from_secs(60),
            loop_limit: 10_000,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExec>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Immutable snapshot for a parallel worker: fresh prints (side effects
    /// inside workers are lost), shared journal and tools, cloned memory.
    fn worker(&self) -> Interp {
        Interp {
            ctx: self.ctx.clone(),
            memory: self.memory.clone(),
            history: self.history.clone(),
            prints: Vec::new(),
            journal: self.journal.clone(),
            tools: self.tools.clone(),
            budget: self.budget.clone(),
            pmap_timeout: self.pmap_timeout,
            loop_limit: self.loop_limit,
        }
    }

    /// Evaluates a whole program (already analyzed).
    pub async fn run(&mut self, node: &Node) -> Flow {
        self.eval(node, &Env::new()).await
    }

    #[async_recursion]
    async fn eval(&mut self, node: &Node, env: &Env) -> Flow {
        match node {
            Node::Literal(lit) => Ok(Ctl::Value(literal_value(lit))),
            Node::Vector(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(value!(self.eval(item, env).await?));
                }
                Ok(Ctl::Value(Value::Vector(out)))
            }
            Node::MapLit(pairs) => {
                let mut map = ValueMap::new();
                for (k, v) in pairs {
                    let key = value!(self.eval(k, env).await?);
                    let val = value!(self.eval(v, env).await?);
                    map.insert(key, val);
                }
                Ok(Ctl::Value(Value::Map(map)))
            }
            Node::SetLit(items) => {
                let mut set = ValueSet::new();
                for item in items {
                    set.insert(value!(self.eval(item, env).await?));
                }
                Ok(Ctl::Value(Value::Set(set)))
            }
            Node::Symbol(name) => self.resolve(name, env).map(Ctl::Value),
            Node::DataRef(name) => match self.ctx.get(name) {
                Some(v) => Ok(Ctl::Value(v.clone())),
                None => Err(EvalError::Unbound(format!("data/{name}"))),
            },
            Node::MemoryRef(name) => match self.memory.get(name) {
                Some(v) => Ok(Ctl::Value(v.clone())),
                None => Err(EvalError::Unbound(format!("memory/{name}"))),
            },
            Node::BudgetRemaining => Ok(Ctl::Value(Value::Map(self.budget.clone()))),
            Node::HistoryRef(i) => {
                Ok(Ctl::Value(self.history.get(*i).cloned().unwrap_or(Value::Nil)))
            }
            Node::Def { name, expr, once } => {
                if *once && self.memory.contains_key(name) {
                    return Ok(Ctl::Value(Value::Var(name.clone())));
                }
                let val = value!(self.eval(expr, env).await?);
                self.memory.insert(name.clone(), val);
                Ok(Ctl::Value(Value::Var(name.clone())))
            }
            Node::Fn {
                name,
                params,
                body,
                doc,
            } => Ok(Ctl::Value(Value::Closure(Arc::new(Closure {
                name: name.clone(),
                params: params.clone(),
                body: body.clone(),
                env: env.clone(),
                history: self.history.clone(),
                doc: doc.clone(),
            })))),
            Node::Let { bindings, body } => {
                let mut scope = env.clone();
                for (pattern, expr) in bindings {
                    let val = value!(self.eval(expr, &scope).await?);
                    bind_pattern(pattern, val, &mut scope)?;
                }
                self.eval_body(body, &scope).await
            }
            Node::If { cond, then, els } => {
                let test = value!(self.eval(cond, env).await?);
                if test.truthy() {
                    self.eval(then, env).await
                } else if let Some(els) = els {
                    self.eval(els, env).await
                } else {
                    Ok(Ctl::Value(Value::Nil))
                }
            }
            Node::Do(body) => {
                if body.is_empty() {
                    return Ok(Ctl::Value(Value::Nil));
                }
                self.eval_body(body, env).await
            }
            Node::And(arms) => {
                let mut last = Value::Bool(true);
                for arm in arms {
                    last = value!(self.eval(arm, env).await?);
                    if !last.truthy() {
                        return Ok(Ctl::Value(last));
                    }
                }
                Ok(Ctl::Value(last))
            }
            Node::Or(arms) => {
                let mut last = Value::Nil;
                for (i, arm) in arms.iter().enumerate() {
                    // A missing memory/ reference in a fallback arm reads as
                    // nil instead of failing.
                    last = match arm {
                        Node::MemoryRef(name) if i > 0 && !self.memory.contains_key(name) => {
                            Value::Nil
                        }
                        _ => value!(self.eval(arm, env).await?),
                    };
                    if last.truthy() {
                        return Ok(Ctl::Value(last));
                    }
                }
                Ok(Ctl::Value(last))
            }
            Node::Loop { bindings, body } => self.eval_loop(bindings, body, env).await,
            Node::Recur(args) => {
                let mut out = Vec::with_capacity(args.len());
                for arg in args {
                    out.push(value!(self.eval(arg, env).await?));
                }
                Ok(Ctl::Recur(out))
            }
            Node::Return(expr) => {
                let val = match expr {
                    Some(expr) => value!(self.eval(expr, env).await?),
                    None => Value::Nil,
                };
                Ok(Ctl::Signal(Signal::Return(val)))
            }
            Node::Fail(expr) => {
                let val = value!(self.eval(expr, env).await?);
                Ok(Ctl::Signal(Signal::Fail(val)))
            }
            Node::Task { id, body } => {
                let id = value!(self.eval(id, env).await?);
                let Value::Str(id) = id else {
                    return Err(EvalError::Type(format!(
                        "task id must be a string, got {}",
                        id.type_label()
                    )));
                };
                if let Some(hit) = self.journal_get(&id) {
                    return Ok(Ctl::Value(hit));
                }
                let result = value!(self.eval_body(body, env).await?);
                self.journal_put(&id, result.clone());
                Ok(Ctl::Value(result))
            }
            Node::TaskReset(id) => {
                let id = value!(self.eval(id, env).await?);
                let Value::Str(id) = id else {
                    return Err(EvalError::Type(format!(
                        "task-reset id must be a string, got {}",
                        id.type_label()
                    )));
                };
                if let Ok(mut journal) = self.journal.lock() {
                    journal.remove(&id);
                }
                Ok(Ctl::Value(Value::Nil))
            }
            Node::StepDone(note) => {
                if let Some(note) = note {
                    let note = value!(self.eval(note, env).await?);
                    self.prints.push(format!("step done: {note}"));
                }
                Ok(Ctl::Value(Value::Keyword("done".into())))
            }
            Node::Pmap { func, coll } => {
                let func = value!(self.eval(func, env).await?);
                let coll = value!(self.eval(coll, env).await?);
                self.eval_pmap(func, coll).await
            }
            Node::Pcalls(thunks) => {
                let mut funcs = Vec::with_capacity(thunks.len());
                for thunk in thunks {
                    funcs.push(value!(self.eval(thunk, env).await?));
                }
                self.eval_pcalls(funcs).await
            }
            Node::ToolCall { name, args } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(value!(self.eval(arg, env).await?));
                }
                self.call_tool(name, evaluated).await.map(Ctl::Value)
            }
            Node::Call { target, args } => {
                let func = value!(self.eval(target, env).await?);
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(value!(self.eval(arg, env).await?));
                }
                self.apply(func, evaluated).await
            }
        }
    }

    async fn eval_body(&mut self, body: &[Node], env: &Env) -> Flow {
        let Some((last, init)) = body.split_last() else {
            return Ok(Ctl::Value(Value::Nil));
        };
        for node in init {
            value!(self.eval(node, env).await?);
        }
        self.eval(last, env).await
    }

    async fn eval_loop(
        &mut self,
        bindings: &[(Pattern, Node)],
        body: &[Node],
        env: &Env,
    ) -> Flow {
        let mut scope = env.clone();
        for (pattern, expr) in bindings {
            let val = value!(self.eval(expr, &scope).await?);
            bind_pattern(pattern, val, &mut scope)?;
        }
        let mut iterations = 0usize;
        loop {
            match self.eval_body(body, &scope).await? {
                Ctl::Recur(args) => {
                    iterations += 1;
                    if iterations >= self.loop_limit {
                        return Err(EvalError::LoopLimit(format!(
                            "loop exceeded {} iterations",
                            self.loop_limit
                        )));
                    }
                    if args.len() != bindings.len() {
                        return Err(EvalError::Arity(format!(
                            "recur expects {} values, got {}",
                            bindings.len(),
                            args.len()
                        )));
                    }
                    scope = env.clone();
                    for ((pattern, _), val) in bindings.iter().zip(args) {
                        bind_pattern(pattern, val, &mut scope)?;
                    }
                }
                other => return Ok(other),
            }
        }
    }

    /// Applies a value in function position. Closures re-enter the
    /// evaluator; builtins that take functions are routed back here so they
    /// can apply user closures.
    #[async_recursion]
    pub async fn apply(&mut self, func: Value, args: Vec<Value>) -> Flow {
        match func {
            Value::Closure(closure) => {
                // The closure sees the turn history from its creation time;
                // a `recur` in tail position re-invokes the closure.
                let saved = std::mem::replace(&mut self.history, closure.history.clone());
                let result = self.apply_closure(&closure, args).await;
                self.history = saved;
                result
            }
            Value::Native(name) if builtins::EVALUATOR_BUILTINS.contains(&name) => {
                self.call_evaluator_builtin(name, args).await
            }
            Value::Native(name) => builtins::call_pure(name, args).map(Ctl::Value),
            other => builtins::apply_pure(&other, &args).map(Ctl::Value),
        }
    }

    async fn apply_closure(&mut self, closure: &Closure, mut args: Vec<Value>) -> Flow {
        let mut iterations = 0usize;
        loop {
            if closure.params.len() != args.len() {
                return Err(EvalError::Arity(format!(
                    "{} expects {} arguments, got {}",
                    closure
                        .name
                        .as_deref()
                        .map(|n| format!("fn {n}"))
                        .unwrap_or_else(|| "anonymous fn".into()),
                    closure.params.len(),
                    args.len()
                )));
            }
            let mut scope = closure.env.clone();
            for (pattern, val) in closure.params.iter().zip(std::mem::take(&mut args)) {
                bind_pattern(pattern, val, &mut scope)?;
            }
            match self.eval_body(&closure.body, &scope).await {
                Ok(Ctl::Recur(new_args)) => {
                    iterations += 1;
                    if iterations >= self.loop_limit {
                        return Err(EvalError::LoopLimit(format!(
                            "fn recursion exceeded {} iterations",
                            self.loop_limit
                        )));
                    }
                    args = new_args;
                }
                other => return other,
            }
        }
    }

    /// `apply` for contexts that need a plain value (collection pipelines).
    /// Signals raised inside are propagated as-is.
    async fn apply_value(&mut self, func: Value, args: Vec<Value>) -> Result<Value, Ctl2> {
        match self.apply(func, args).await {
            Ok(Ctl::Value(v)) => Ok(v),
            Ok(other) => Err(Ctl2::Flow(other)),
            Err(e) => Err(Ctl2::Error(e)),
        }
    }

    async fn call_evaluator_builtin(&mut self, name: &'static str, args: Vec<Value>) -> Flow {
        match name {
            "println" => {
                let line = args
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                log::debug!("(println) {line}");
                self.prints.push(line);
                Ok(Ctl::Value(Value::Nil))
            }
            "map" | "mapv" => {
                let (f, items) = fn_and_items(name, args)?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(ctl2!(self.apply_value(f.clone(), vec![item]).await));
                }
                Ok(Ctl::Value(Value::Vector(out)))
            }
            "filter" | "remove" => {
                let keep_on = name == "filter";
                let (f, items) = fn_and_items(name, args)?;
                let mut out = Vec::new();
                for item in items {
                    let keep = ctl2!(self.apply_value(f.clone(), vec![item.clone()]).await);
                    if keep.truthy() == keep_on {
                        out.push(item);
                    }
                }
                Ok(Ctl::Value(Value::Vector(out)))
            }
            "reduce" => self.reduce(args).await,
            "take-while" | "drop-while" => {
                let taking = name == "take-while";
                let (f, items) = fn_and_items(name, args)?;
                let mut boundary = items.len();
                for (i, item) in items.iter().enumerate() {
                    let keep = ctl2!(self.apply_value(f.clone(), vec![item.clone()]).await);
                    if !keep.truthy() {
                        boundary = i;
                        break;
                    }
                }
                let out: Vec<Value> = if taking {
                    items[..boundary].to_vec()
                } else {
                    items[boundary..].to_vec()
                };
                Ok(Ctl::Value(Value::Vector(out)))
            }
            "sort-by" => {
                let (f, items) = fn_and_items(name, args)?;
                let mut keyed = Vec::with_capacity(items.len());
                for item in items {
                    let key = ctl2!(self.apply_value(f.clone(), vec![item.clone()]).await);
                    keyed.push((key, item));
                }
                sort_keyed(&mut keyed)?;
                Ok(Ctl::Value(Value::Vector(
                    keyed.into_iter().map(|(_, v)| v).collect(),
                )))
            }
            "group-by" => {
                let (f, items) = fn_and_items(name, args)?;
                let mut groups = ValueMap::new();
                for item in items {
                    let key = ctl2!(self.apply_value(f.clone(), vec![item.clone()]).await);
                    match groups.get(&key).cloned() {
                        Some(Value::Vector(mut group)) => {
                            group.push(item);
                            groups.insert(key, Value::Vector(group));
                        }
                        _ => {
                            groups.insert(key, Value::Vector(vec![item]));
                        }
                    }
                }
                Ok(Ctl::Value(Value::Map(groups)))
            }
            "update" => {
                let [target, key, f, extra @ ..] = args.as_slice() else {
                    return Err(EvalError::Arity(
                        "update expects (update coll key fn args...)".into(),
                    ));
                };
                let current = builtins::call_pure("get", vec![target.clone(), key.clone()])?;
                let mut fargs = vec![current];
                fargs.extend(extra.iter().cloned());
                let updated = ctl2!(self.apply_value(f.clone(), fargs).await);
                builtins::call_pure("assoc", vec![target.clone(), key.clone(), updated])
                    .map(Ctl::Value)
            }
            "update-vals" => {
                let [target, f] = args.as_slice() else {
                    return Err(EvalError::Arity("update-vals expects (update-vals map fn)".into()));
                };
                let Value::Map(map) = target else {
                    return Err(EvalError::Type(format!(
                        "update-vals expects a map, got {}",
                        target.type_label()
                    )));
                };
                let mut out = ValueMap::new();
                for (k, v) in map.iter() {
                    let updated = ctl2!(self.apply_value(f.clone(), vec![v.clone()]).await);
                    out.insert(k.clone(), updated);
                }
                Ok(Ctl::Value(Value::Map(out)))
            }
            "update-in" => {
                let [target, path, f, extra @ ..] = args.as_slice() else {
                    return Err(EvalError::Arity(
                        "update-in expects (update-in coll [keys] fn args...)".into(),
                    ));
                };
                let Value::Vector(path) = path else {
                    return Err(EvalError::Type("update-in path must be a vector".into()));
                };
                self.update_in(target.clone(), path, f.clone(), extra.to_vec())
                    .await
            }
            "sum-by" | "avg-by" => {
                let (f, items) = fn_and_items(name, args)?;
                let count = items.len();
                let mut sum = 0.0;
                let mut all_int = true;
                for item in items {
                    let keyed = ctl2!(self.apply_value(f.clone(), vec![item]).await);
                    match keyed {
                        Value::Int(i) => sum += i as f64,
                        Value::Float(x) => {
                            all_int = false;
                            sum += x;
                        }
                        other => {
                            return Err(EvalError::Type(format!(
                                "{name} expects numeric projections, got {}",
                                other.type_label()
                            )))
                        }
                    }
                }
                Ok(Ctl::Value(if name == "avg-by" {
                    if count == 0 {
                        Value::Nil
                    } else {
                        Value::Float(sum / count as f64)
                    }
                } else if all_int {
                    Value::Int(sum as i64)
                } else {
                    Value::Float(sum)
                }))
            }
            "min-by" | "max-by" => {
                let want_max = name == "max-by";
                let (f, items) = fn_and_items(name, args)?;
                let mut best: Option<(f64, Value)> = None;
                for item in items {
                    let keyed = ctl2!(self.apply_value(f.clone(), vec![item.clone()]).await);
                    let key = match keyed {
                        Value::Int(i) => i as f64,
                        Value::Float(x) => x,
                        other => {
                            return Err(EvalError::Type(format!(
                                "{name} expects numeric projections, got {}",
                                other.type_label()
                            )))
                        }
                    };
                    let better = match &best {
                        None => true,
                        Some((current, _)) => {
                            if want_max {
                                key > *current
                            } else {
                                key < *current
                            }
                        }
                    };
                    if better {
                        best = Some((key, item));
                    }
                }
                Ok(Ctl::Value(best.map(|(_, v)| v).unwrap_or(Value::Nil)))
            }
            "pluck" => {
                let [key, coll] = args.as_slice() else {
                    return Err(EvalError::Arity("pluck expects (pluck key coll)".into()));
                };
                let (f, items) = fn_and_items(name, vec![key.clone(), coll.clone()])?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(ctl2!(self.apply_value(f.clone(), vec![item]).await));
                }
                Ok(Ctl::Value(Value::Vector(out)))
            }
            _ => Err(EvalError::Unbound(name.to_string())),
        }
    }

    async fn reduce(&mut self, args: Vec<Value>) -> Flow {
        let (f, init, items) = match args.as_slice() {
            [f, coll] => {
                let items = items_of(coll, "reduce")?;
                let mut iter = items.into_iter();
                let Some(init) = iter.next() else {
                    return Err(EvalError::Type(
                        "reduce of an empty collection requires an initial value".into(),
                    ));
                };
                (f.clone(), init, iter.collect::<Vec<_>>())
            }
            [f, init, coll] => (f.clone(), init.clone(), items_of(coll, "reduce")?),
            _ => {
                return Err(EvalError::Arity(
                    "reduce expects (reduce fn init? coll)".into(),
                ))
            }
        };
        let mut acc = init;
        for item in items {
            acc = ctl2!(self.apply_value(f.clone(), vec![acc, item]).await);
        }
        Ok(Ctl::Value(acc))
    }

    #[async_recursion]
    async fn update_in(
        &mut self,
        target: Value,
        path: &[Value],
        f: Value,
        extra: Vec<Value>,
    ) -> Flow {
        let [key, rest @ ..] = path else {
            return Err(EvalError::Type("update-in path must not be empty".into()));
        };
        let current = builtins::call_pure("get", vec![target.clone(), key.clone()])?;
        let updated = if rest.is_empty() {
            let mut fargs = vec![current];
            fargs.extend(extra);
            ctl2!(self.apply_value(f, fargs).await)
        } else {
            value!(self.update_in(current, rest, f, extra).await?)
        };
        builtins::call_pure("assoc", vec![target, key.clone(), updated]).map(Ctl::Value)
    }

    async fn call_tool(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let Some(tools) = self.tools.clone() else {
            return Err(EvalError::Tool {
                reason: "tool_not_found",
                message: format!("tool/{name} is not available in this context"),
            });
        };
        let args_map = tool_args_map(name, args)?;
        let caller = CallerInfo {
            closures: self
                .memory
                .iter()
                .filter(|(k, v)| !k.starts_with('_') && matches!(v, Value::Closure(_)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        // Keys are stringified recursively at the boundary.
        tools.dispatch(name, Value::Map(args_map).to_json(), caller).await
    }

    async fn eval_pmap(&mut self, func: Value, coll: Value) -> Flow {
        let items = items_of(&coll, "pmap")?;
        let handles = self.spawn_workers(
            items
                .into_iter()
                .map(|item| (func.clone(), vec![item]))
                .collect(),
        );
        self.join_workers(handles, "pmap").await
    }

    async fn eval_pcalls(&mut self, funcs: Vec<Value>) -> Flow {
        for f in &funcs {
            if !f.callable() {
                return Err(EvalError::Type(format!(
                    "pcalls expects functions, got {}",
                    f.type_label()
                )));
            }
        }
        let handles = self.spawn_workers(funcs.into_iter().map(|f| (f, vec![])).collect());
        self.join_workers(handles, "pcalls").await
    }

    /// Spawns one bounded worker per call. Each worker gets an immutable
    /// snapshot of the interpreter; its prints are discarded.
    fn spawn_workers(
        &self,
        calls: Vec<(Value, Vec<Value>)>,
    ) -> Vec<JoinHandle<Result<Value, String>>> {
        let permits = Arc::new(Semaphore::new(parallelism_cap()));
        calls
            .into_iter()
            .map(|(func, args)| {
                let permits = permits.clone();
                let mut worker = self.worker();
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    match worker.apply(func, args).await {
                        Ok(Ctl::Value(v)) => Ok(v),
                        Ok(Ctl::Signal(_)) => {
                            Err("return/fail cannot cross a parallel boundary".to_string())
                        }
                        Ok(Ctl::Recur(_)) => {
                            Err("recur cannot cross a parallel boundary".to_string())
                        }
                        Err(e) => Err(e.to_string()),
                    }
                })
            })
            .collect()
    }

    async fn join_workers(
        &mut self,
        handles: Vec<JoinHandle<Result<Value, String>>>,
        op: &'static str,
    ) -> Flow {
        let join = futures::future::join_all(handles);
        let results = match tokio::time::timeout(self.pmap_timeout, join).await {
            Ok(results) => results,
            Err(_) => {
                return Err(wrap_parallel_error(
                    op,
                    format!("timed out after {}ms", self.pmap_timeout.as_millis()),
                ))
            }
        };

        let mut values = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(v)) => values.push(v),
                Ok(Err(msg)) => errors.push(format!("element {i}: {msg}")),
                Err(join_err) => errors.push(format!("element {i}: worker panicked: {join_err}")),
            }
        }
        if errors.is_empty() {
            Ok(Ctl::Value(Value::Vector(values)))
        } else {
            Err(wrap_parallel_error(op, errors.join("; ")))
        }
    }

    fn resolve(&self, name: &str, env: &Env) -> Result<Value, EvalError> {
        if let Some(v) = env.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.memory.get(name) {
            return Ok(v.clone());
        }
        if let Some(interned) = builtins::interned(name) {
            return Ok(Value::Native(interned));
        }
        Err(EvalError::Unbound(name.to_string()))
    }

    fn journal_get(&self, id: &str) -> Option<Value> {
        self.journal.lock().ok()?.get(id).cloned()
    }

    fn journal_put(&self, id: &str, value: Value) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.insert(id.to_string(), value);
        }
    }
}

fn wrap_parallel_error(op: &str, message: String) -> EvalError {
    if op == "pmap" {
        EvalError::Pmap(message)
    } else {
        EvalError::Pcalls(message)
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Nil => Value::Nil,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::Keyword(k) => Value::Keyword(k.clone()),
    }
}

fn bind_pattern(pattern: &Pattern, value: Value, scope: &mut Env) -> Result<(), EvalError> {
    match pattern {
        Pattern::Sym(name) => {
            if name != "_" {
                scope.insert(name.clone(), value);
            }
            Ok(())
        }
        Pattern::Vector(patterns) => {
            let items = match value {
                Value::Vector(items) => items,
                Value::Nil => vec![],
                other => {
                    return Err(EvalError::Destructure(format!(
                        "cannot destructure {} as a vector",
                        other.type_label()
                    )))
                }
            };
            for (i, inner) in patterns.iter().enumerate() {
                bind_pattern(inner, items.get(i).cloned().unwrap_or(Value::Nil), scope)?;
            }
            Ok(())
        }
        Pattern::MapKeys(keys) => {
            let map = match value {
                Value::Map(map) => map,
                Value::Nil => ValueMap::new(),
                other => {
                    return Err(EvalError::Destructure(format!(
                        "cannot destructure {} as a map",
                        other.type_label()
                    )))
                }
            };
            for key in keys {
                let val = map
                    .get(&Value::Keyword(key.clone()))
                    .or_else(|| map.get(&Value::Str(key.clone())))
                    .cloned()
                    .unwrap_or(Value::Nil);
                scope.insert(key.clone(), val);
            }
            Ok(())
        }
    }
}

fn items_of(coll: &Value, op: &str) -> Result<Vec<Value>, EvalError> {
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

fn fn_and_items(op: &str, args: Vec<Value>) -> Result<(Value, Vec<Value>), EvalError> {
    let [f, coll] = args.as_slice() else {
        return Err(EvalError::Arity(format!(
            "{op} expects a function and a collection"
        )));
    };
    Ok((f.clone(), items_of(coll, op)?))
}

fn sort_keyed(keyed: &mut [(Value, Value)]) -> Result<(), EvalError> {
    let mut error = None;
    keyed.sort_by(|(a, _), (b, _)| {
        compare_values(a, b).unwrap_or_else(|| {
            if error.is_none() {
                error = Some(EvalError::Type(format!(
                    "sort-by keys must be mutually comparable ({} vs {})",
                    a.type_label(),
                    b.type_label()
                )));
            }
            std::cmp::Ordering::Equal
        })
    });
    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Keyword(a), Value::Keyword(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn parallelism_cap() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    cores * 2
}

/// Collects keyword-style arguments (`:k v :k v`) or a single map into the
/// canonical tool-argument map.
pub(crate) fn tool_args_map(tool: &str, args: Vec<Value>) -> Result<ValueMap, EvalError> {
    match args.as_slice() {
        [] => Ok(ValueMap::new()),
        [Value::Map(map)] => Ok(map.clone()),
        _ => {
            if args.len() % 2 != 0 {
                return Err(EvalError::InvalidToolArgs(format!(
                    "tool/{tool} expects a single map or keyword pairs, e.g. (tool/{tool} :key \"value\")"
                )));
            }
            let mut map = ValueMap::new();
            for pair in args.chunks(2) {
                let Value::Keyword(_) = &pair[0] else {
                    return Err(EvalError::InvalidToolArgs(format!(
                        "tool/{tool} argument names must be keywords, got {}; e.g. (tool/{tool} :key \"value\")",
                        pair[0].type_label()
                    )));
                };
                map.insert(pair[0].clone(), pair[1].clone());
            }
            Ok(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::{analyze, parse};

    async fn run(interp: &mut Interp, source: &str) -> Flow {
        let node = analyze(&parse(source).unwrap()).unwrap();
        interp.run(&node).await
    }

    async fn run_value(interp: &mut Interp, source: &str) -> Value {
        match run(interp, source).await.unwrap() {
            Ctl::Value(v) => v,
            other => panic!("expected a value, got {other:?}"),
        }
    }

    fn fresh() -> Interp {
        Interp::new(HashMap::new())
    }

    #[tokio::test]
    async fn arithmetic_pipeline() {
        let mut interp = fresh();
        assert_eq!(run_value(&mut interp, "(+ 2 2)").await, Value::Int(4));
        assert_eq!(
            run_value(&mut interp, "(->> [1 2 3 4] (filter (fn [x] (> x 1))) (map (fn [x] (* x 10))) (reduce +))").await,
            Value::Int(90)
        );
    }

    #[tokio::test]
    async fn def_returns_var_and_binds_memory() {
        let mut interp = fresh();
        let var = run_value(&mut interp, "(def x 41)").await;
        assert_eq!(var, Value::Var("x".into()));
        assert_eq!(run_value(&mut interp, "(+ x 1)").await, Value::Int(42));
        assert_eq!(run_value(&mut interp, "memory/x").await, Value::Int(41));
    }

    #[tokio::test]
    async fn defonce_skips_reevaluation() {
        let mut interp = fresh();
        run_value(&mut interp, "(defonce x 1)").await;
        run_value(&mut interp, "(defonce x (fail \"never evaluated\"))").await;
        assert_eq!(run_value(&mut interp, "x").await, Value::Int(1));
    }

    #[tokio::test]
    async fn or_treats_unbound_memory_fallback_as_nil() {
        let mut interp = fresh();
        assert_eq!(
            run_value(&mut interp, "(or nil memory/missing 7)").await,
            Value::Int(7)
        );
        let err = run(&mut interp, "memory/missing").await.unwrap_err();
        assert_eq!(err.reason(), "unbound_var");
    }

    #[tokio::test]
    async fn loop_recur_terminates() {
        let mut interp = fresh();
        assert_eq!(
            run_value(
                &mut interp,
                "(loop [n 0 acc 1] (if (< n 5) (recur (+ n 1) (* acc 2)) acc))"
            )
            .await,
            Value::Int(32)
        );
    }

    #[tokio::test]
    async fn loop_limit_is_enforced() {
        let mut interp = fresh();
        interp.loop_limit = 10;
        let err = run(&mut interp, "(loop [n 0] (recur (+ n 1)))")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "loop_limit_exceeded");
    }

    #[tokio::test]
    async fn return_and_fail_are_signals() {
        let mut interp = fresh();
        let Ctl::Signal(Signal::Return(v)) = run(&mut interp, "(do (def x 1) (return (+ x 1)))")
            .await
            .unwrap()
        else {
            panic!("expected return signal");
        };
        assert_eq!(v, Value::Int(2));

        let Ctl::Signal(Signal::Fail(v)) = run(&mut interp, "(fail \"boom\")").await.unwrap()
        else {
            panic!("expected fail signal");
        };
        assert_eq!(v, Value::Str("boom".into()));
    }

    #[tokio::test]
    async fn set_literal_dedup_and_membership() {
        let mut interp = fresh();
        let result = run_value(
            &mut interp,
            "(let [s #{1 1 2}] [(count s) (contains? s 2) (contains? s 3)])",
        )
        .await;
        assert_eq!(
            result,
            Value::Vector(vec![Value::Int(2), Value::Bool(true), Value::Bool(false)])
        );
    }

    #[tokio::test]
    async fn pmap_preserves_order_and_drops_prints() {
        let mut interp = fresh();
        let result = run_value(
            &mut interp,
            "(pmap (fn [x] (do (println x) (* x x))) [1 2 3 4])",
        )
        .await;
        assert_eq!(
            result,
            Value::Vector(vec![
                Value::Int(1),
                Value::Int(4),
                Value::Int(9),
                Value::Int(16)
            ])
        );
        assert!(interp.prints.is_empty());
    }

    #[tokio::test]
    async fn pmap_element_error_fails_whole_batch() {
        let mut interp = fresh();
        let err = run(&mut interp, "(pmap (fn [x] (/ 1 x)) [1 0 2])")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "pmap_error");
        assert!(err.to_string().contains("element 1"));
    }

    #[tokio::test]
    async fn pcalls_runs_thunks_in_source_order() {
        let mut interp = fresh();
        let result = run_value(&mut interp, "(pcalls (fn [] 1) (fn [] (+ 1 1)) (fn [] 3))").await;
        assert_eq!(
            result,
            Value::Vector(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[tokio::test]
    async fn task_caches_on_success_only() {
        let mut interp = fresh();
        run_value(&mut interp, "(def hits 0)").await;
        assert_eq!(
            run_value(&mut interp, "(task \"t1\" (do (def hits (+ hits 1)) 42))").await,
            Value::Int(42)
        );
        assert_eq!(
            run_value(&mut interp, "(task \"t1\" (do (def hits (+ hits 1)) 43))").await,
            Value::Int(42)
        );
        assert_eq!(run_value(&mut interp, "hits").await, Value::Int(1));

        run_value(&mut interp, "(task-reset \"t1\")").await;
        assert_eq!(
            run_value(&mut interp, "(task \"t1\" 99)").await,
            Value::Int(99)
        );

        let err = run(&mut interp, "(task \"t2\" (/ 1 0))").await.unwrap_err();
        assert_eq!(err.reason(), "arithmetic_error");
        assert_eq!(
            run_value(&mut interp, "(task \"t2\" 7)").await,
            Value::Int(7)
        );
    }

    #[tokio::test]
    async fn closures_capture_env_and_history() {
        let mut interp = fresh();
        interp.history = vec![Value::Int(10)];
        run_value(&mut interp, "(def f (let [base 5] (fn [x] (+ base x *1))))").await;
        interp.history = vec![Value::Int(999)];
        assert_eq!(run_value(&mut interp, "(f 1)").await, Value::Int(16));
    }

    #[tokio::test]
    async fn recur_in_fn_tail_reinvokes_the_closure() {
        let mut interp = fresh();
        run_value(
            &mut interp,
            "(defn fact [n acc] (if (< n 2) acc (recur (- n 1) (* acc n))))",
        )
        .await;
        assert_eq!(run_value(&mut interp, "(fact 5 1)").await, Value::Int(120));
    }

    #[tokio::test]
    async fn closure_arity_is_checked() {
        let mut interp = fresh();
        run_value(&mut interp, "(defn f [a b] (+ a b))").await;
        let err = run(&mut interp, "(f 1)").await.unwrap_err();
        assert_eq!(err.reason(), "arity_mismatch");
    }

    #[tokio::test]
    async fn destructuring_in_let_and_fn() {
        let mut interp = fresh();
        assert_eq!(
            run_value(&mut interp, "(let [[a b] [1 2] {:keys [c]} {:c 3}] (+ a b c))").await,
            Value::Int(6)
        );
        let err = run(&mut interp, "(let [[a] 5] a)").await.unwrap_err();
        assert_eq!(err.reason(), "destructure_error");
    }

    #[tokio::test]
    async fn println_accumulates_prints() {
        let mut interp = fresh();
        run_value(&mut interp, "(do (println \"a\" 1) (println :b))").await;
        assert_eq!(interp.prints, vec!["a 1".to_string(), ":b".to_string()]);
    }

    #[tokio::test]
    async fn data_refs_read_context() {
        let mut interp = Interp::new(HashMap::from([("n".to_string(), Value::Int(5))]));
        assert_eq!(run_value(&mut interp, "(* 2 data/n)").await, Value::Int(10));
        let err = run(&mut interp, "data/other").await.unwrap_err();
        assert_eq!(err.reason(), "unbound_var");
    }

    #[tokio::test]
    async fn budget_remaining_reflects_snapshot() {
        let mut interp = fresh();
        assert_eq!(
            run_value(&mut interp, "(budget/remaining)").await,
            Value::Map(ValueMap::new())
        );
        interp.budget.insert(Value::Keyword("turns_left".into()), Value::Int(3));
        assert_eq!(
            run_value(&mut interp, "(:turns_left (budget/remaining))").await,
            Value::Int(3)
        );
    }

    #[tokio::test]
    async fn group_and_aggregate() {
        let mut interp = fresh();
        let avg = run_value(
            &mut interp,
            "(avg-by :price [{:price 10} {:price 20} {:price 30}])",
        )
        .await;
        assert_eq!(avg, Value::Float(20.0));
        let best = run_value(
            &mut interp,
            "(:name (max-by :price [{:name \"a\" :price 1} {:name \"b\" :price 9}]))",
        )
        .await;
        assert_eq!(best, Value::Str("b".into()));
    }

    #[tokio::test]
    async fn keyword_pairs_build_tool_args() {
        let args = tool_args_map(
            "search",
            vec![Value::Keyword("q".into()), Value::Str("rust".into())],
        )
        .unwrap();
        assert_eq!(
            Value::Map(args).to_json(),
            serde_json::json!({"q": "rust"})
        );

        let err = tool_args_map("search", vec![Value::Str("q".into()), Value::Int(1)])
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_tool_args");
    }
}
