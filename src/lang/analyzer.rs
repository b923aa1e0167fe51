use super::ast::{Literal, Node, Pattern};
use super::builtins;
use super::error::AnalyzeError;
use super::parser::Sexp;

/// Lowers the raw syntax tree to the core form.
pub fn analyze(sexp: &Sexp) -> Result<Node, AnalyzeError> {
    analyze_in(sexp, false)
}

/// `recur_ok` is true only in tail position of a `loop` or `fn` body.
fn analyze_in(sexp: &Sexp, recur_ok: bool) -> Result<Node, AnalyzeError> {
    match sexp {
        Sexp::Nil => Ok(Node::Literal(Literal::Nil)),
        Sexp::Bool(b) => Ok(Node::Literal(Literal::Bool(*b))),
        Sexp::Int(i) => Ok(Node::Literal(Literal::Int(*i))),
        Sexp::Float(f) => Ok(Node::Literal(Literal::Float(*f))),
        Sexp::Str(s) => Ok(Node::Literal(Literal::Str(s.clone()))),
        Sexp::Keyword(k) => Ok(Node::Literal(Literal::Keyword(k.clone()))),
        Sexp::Symbol(name) => analyze_symbol(name),
        Sexp::Vector(items) => Ok(Node::Vector(analyze_all(items)?)),
        Sexp::Set(items) => Ok(Node::SetLit(analyze_all(items)?)),
        Sexp::Map(pairs) => {
            let analyzed = pairs
                .iter()
                .map(|(k, v)| Ok((analyze_in(k, false)?, analyze_in(v, false)?)))
                .collect::<Result<Vec<_>, AnalyzeError>>()?;
            Ok(Node::MapLit(analyzed))
        }
        Sexp::List(items) => analyze_list(sexp, items, recur_ok),
    }
}

fn analyze_all(items: &[Sexp]) -> Result<Vec<Node>, AnalyzeError> {
    items.iter().map(|s| analyze_in(s, false)).collect()
}

fn analyze_symbol(name: &str) -> Result<Node, AnalyzeError> {
    match name {
        "*1" => return Ok(Node::HistoryRef(0)),
        "*2" => return Ok(Node::HistoryRef(1)),
        "*3" => return Ok(Node::HistoryRef(2)),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("data/") {
        return Ok(Node::DataRef(rest.to_string()));
    }
    if let Some(rest) = name.strip_prefix("memory/") {
        return Ok(Node::MemoryRef(rest.to_string()));
    }
    if name.starts_with("tool/") {
        return Err(AnalyzeError::new(
            name,
            "tool/ references must be invoked, e.g. (tool/search :query \"...\")",
        ));
    }
    if name.starts_with("budget/") {
        if name == "budget/remaining" {
            return Ok(Node::BudgetRemaining);
        }
        return Err(AnalyzeError::new(
            name,
            "unknown budget/ reference; only (budget/remaining) is available",
        ));
    }
    Ok(Node::Symbol(name.to_string()))
}

fn analyze_list(whole: &Sexp, items: &[Sexp], recur_ok: bool) -> Result<Node, AnalyzeError> {
    let Some(head) = items.first() else {
        return Err(AnalyzeError::new("()", "empty call form"));
    };
    let args = &items[1..];

    if let Sexp::Symbol(name) = head {
        match name.as_str() {
            "def" => return analyze_def(whole, args, false),
            "defonce" => return analyze_def(whole, args, true),
            "defn" => return analyze_defn(whole, args),
            "fn" => return analyze_fn(whole, args),
            "let" => return analyze_let(whole, args, recur_ok),
            "if" => return analyze_if(whole, args, recur_ok),
            "if-let" => return analyze_if_let(whole, args),
            "when" => return analyze_when(whole, args, recur_ok),
            "cond" => return analyze_cond(whole, args, recur_ok),
            "do" => return analyze_do(args, recur_ok),
            "and" => return Ok(Node::And(analyze_all(args)?)),
            "or" => return Ok(Node::Or(analyze_all(args)?)),
            "loop" => return analyze_loop(whole, args),
            "recur" => {
                if !recur_ok {
                    return Err(AnalyzeError::new(
                        whole.describe(),
                        "recur is only allowed in tail position of loop or fn",
                    ));
                }
                return Ok(Node::Recur(analyze_all(args)?));
            }
            "return" => {
                return match args {
                    [] => Ok(Node::Return(None)),
                    [value] => Ok(Node::Return(Some(Box::new(analyze_in(value, false)?)))),
                    _ => Err(AnalyzeError::new(
                        whole.describe(),
                        "return takes at most one value",
                    )),
                };
            }
            "fail" => {
                return match args {
                    [value] => Ok(Node::Fail(Box::new(analyze_in(value, false)?))),
                    _ => Err(AnalyzeError::new(
                        whole.describe(),
                        "fail takes exactly one value",
                    )),
                };
            }
            "task" => return analyze_task(whole, args),
            "task-reset" => {
                return match args {
                    [id] => Ok(Node::TaskReset(Box::new(analyze_in(id, false)?))),
                    _ => Err(AnalyzeError::new(
                        whole.describe(),
                        "task-reset takes exactly one task id",
                    )),
                };
            }
            "step-done" => {
                return match args {
                    [] => Ok(Node::StepDone(None)),
                    [note] => Ok(Node::StepDone(Some(Box::new(analyze_in(note, false)?)))),
                    _ => Err(AnalyzeError::new(
                        whole.describe(),
                        "step-done takes at most one note",
                    )),
                };
            }
            "pmap" => {
                return match args {
                    [func, coll] => Ok(Node::Pmap {
                        func: Box::new(analyze_in(func, false)?),
                        coll: Box::new(analyze_in(coll, false)?),
                    }),
                    _ => Err(AnalyzeError::new(
                        whole.describe(),
                        "pmap takes a function and a collection",
                    )),
                };
            }
            "pcalls" => return Ok(Node::Pcalls(analyze_all(args)?)),
            "->" => return analyze_thread(whole, args, false, recur_ok),
            "->>" => return analyze_thread(whole, args, true, recur_ok),
            _ => {}
        }

        if let Some(tool) = name.strip_prefix("tool/") {
            return Ok(Node::ToolCall {
                name: tool.to_string(),
                args: analyze_all(args)?,
            });
        }
        if name == "budget/remaining" {
            if !args.is_empty() {
                return Err(AnalyzeError::new(
                    whole.describe(),
                    "(budget/remaining) takes no arguments",
                ));
            }
            return Ok(Node::BudgetRemaining);
        }
    }

    Ok(Node::Call {
        target: Box::new(analyze_in(head, false)?),
        args: analyze_all(args)?,
    })
}

fn analyze_def(whole: &Sexp, args: &[Sexp], once: bool) -> Result<Node, AnalyzeError> {
    let [Sexp::Symbol(name), expr] = args else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "expected (def name expr)",
        ));
    };
    check_bindable(whole, name)?;
    Ok(Node::Def {
        name: name.clone(),
        expr: Box::new(analyze_in(expr, false)?),
        once,
    })
}

fn analyze_defn(whole: &Sexp, args: &[Sexp]) -> Result<Node, AnalyzeError> {
    let Some(Sexp::Symbol(name)) = args.first() else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "expected (defn name [params] body)",
        ));
    };
    check_bindable(whole, name)?;
    let func = analyze_fn_tail(whole, Some(name.clone()), &args[1..])?;
    Ok(Node::Def {
        name: name.clone(),
        expr: Box::new(func),
        once: false,
    })
}

fn analyze_fn(whole: &Sexp, args: &[Sexp]) -> Result<Node, AnalyzeError> {
    match args.first() {
        Some(Sexp::Symbol(name)) => analyze_fn_tail(whole, Some(name.clone()), &args[1..]),
        _ => analyze_fn_tail(whole, None, args),
    }
}

/// Parses `docstring? [params] body+`.
fn analyze_fn_tail(
    whole: &Sexp,
    name: Option<String>,
    args: &[Sexp],
) -> Result<Node, AnalyzeError> {
    let (doc, rest) = match args {
        [Sexp::Str(doc), rest @ ..] if !rest.is_empty() => (Some(doc.clone()), rest),
        _ => (None, args),
    };
    let [Sexp::Vector(params), body @ ..] = rest else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "expected a parameter vector",
        ));
    };
    if body.is_empty() {
        return Err(AnalyzeError::new(whole.describe(), "fn body is empty"));
    }
    let params = params
        .iter()
        .map(|p| analyze_pattern(whole, p))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Node::Fn {
        name,
        params,
        body: analyze_body(body)?,
        doc,
    })
}

fn analyze_let(whole: &Sexp, args: &[Sexp], recur_ok: bool) -> Result<Node, AnalyzeError> {
    let [Sexp::Vector(bindings), body @ ..] = args else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "expected (let [name expr ...] body)",
        ));
    };
    if bindings.len() % 2 != 0 {
        return Err(AnalyzeError::new(
            whole.describe(),
            "let bindings require an even number of forms",
        ));
    }
    if body.is_empty() {
        return Err(AnalyzeError::new(whole.describe(), "let body is empty"));
    }
    let bindings = analyze_bindings(whole, bindings)?;
    let mut analyzed_body = Vec::with_capacity(body.len());
    for (i, form) in body.iter().enumerate() {
        let tail = recur_ok && i == body.len() - 1;
        analyzed_body.push(analyze_in(form, tail)?);
    }
    Ok(Node::Let {
        bindings,
        body: analyzed_body,
    })
}

fn analyze_bindings(
    whole: &Sexp,
    bindings: &[Sexp],
) -> Result<Vec<(Pattern, Node)>, AnalyzeError> {
    let mut out = Vec::with_capacity(bindings.len() / 2);
    let mut iter = bindings.iter();
    while let (Some(pattern), Some(expr)) = (iter.next(), iter.next()) {
        out.push((analyze_pattern(whole, pattern)?, analyze_in(expr, false)?));
    }
    Ok(out)
}

fn analyze_if(whole: &Sexp, args: &[Sexp], recur_ok: bool) -> Result<Node, AnalyzeError> {
    match args {
        [cond, then] => Ok(Node::If {
            cond: Box::new(analyze_in(cond, false)?),
            then: Box::new(analyze_in(then, recur_ok)?),
            els: None,
        }),
        [cond, then, els] => Ok(Node::If {
            cond: Box::new(analyze_in(cond, false)?),
            then: Box::new(analyze_in(then, recur_ok)?),
            els: Some(Box::new(analyze_in(els, recur_ok)?)),
        }),
        _ => Err(AnalyzeError::new(
            whole.describe(),
            "expected (if cond then else?)",
        )),
    }
}

fn analyze_if_let(whole: &Sexp, args: &[Sexp]) -> Result<Node, AnalyzeError> {
    let [Sexp::Vector(binding), rest @ ..] = args else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "expected (if-let [name expr] then else?)",
        ));
    };
    let [pattern, expr] = binding.as_slice() else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "if-let takes exactly one binding pair",
        ));
    };
    let (then, els) = match rest {
        [then] => (then, None),
        [then, els] => (then, Some(els)),
        _ => {
            return Err(AnalyzeError::new(
                whole.describe(),
                "expected (if-let [name expr] then else?)",
            ))
        }
    };
    let pattern = analyze_pattern(whole, pattern)?;
    let probe = "__if-let".to_string();
    Ok(Node::Let {
        bindings: vec![(Pattern::Sym(probe.clone()), analyze_in(expr, false)?)],
        body: vec![Node::If {
            cond: Box::new(Node::Symbol(probe.clone())),
            then: Box::new(Node::Let {
                bindings: vec![(pattern, Node::Symbol(probe))],
                body: vec![analyze_in(then, false)?],
            }),
            els: els.map(|e| analyze_in(e, false)).transpose()?.map(Box::new),
        }],
    })
}

fn analyze_when(whole: &Sexp, args: &[Sexp], recur_ok: bool) -> Result<Node, AnalyzeError> {
    let [cond, body @ ..] = args else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "expected (when cond body)",
        ));
    };
    if body.is_empty() {
        return Err(AnalyzeError::new(whole.describe(), "when body is empty"));
    }
    let mut analyzed = Vec::with_capacity(body.len());
    for (i, form) in body.iter().enumerate() {
        analyzed.push(analyze_in(form, recur_ok && i == body.len() - 1)?);
    }
    Ok(Node::If {
        cond: Box::new(analyze_in(cond, false)?),
        then: Box::new(Node::Do(analyzed)),
        els: None,
    })
}

fn analyze_cond(whole: &Sexp, args: &[Sexp], recur_ok: bool) -> Result<Node, AnalyzeError> {
    if args.len() % 2 != 0 {
        return Err(AnalyzeError::new(
            whole.describe(),
            "cond requires an even number of forms",
        ));
    }
    let mut node = None;
    for pair in args.chunks(2).rev() {
        let [test, expr] = pair else { unreachable!() };
        let then = analyze_in(expr, recur_ok)?;
        node = Some(match test {
            // :else arms always match.
            Sexp::Keyword(k) if k == "else" => then,
            _ => Node::If {
                cond: Box::new(analyze_in(test, false)?),
                then: Box::new(then),
                els: node.map(Box::new),
            },
        });
    }
    Ok(node.unwrap_or(Node::Literal(Literal::Nil)))
}

fn analyze_do(args: &[Sexp], recur_ok: bool) -> Result<Node, AnalyzeError> {
    let mut analyzed = Vec::with_capacity(args.len());
    for (i, form) in args.iter().enumerate() {
        analyzed.push(analyze_in(form, recur_ok && i == args.len() - 1)?);
    }
    Ok(Node::Do(analyzed))
}

fn analyze_loop(whole: &Sexp, args: &[Sexp]) -> Result<Node, AnalyzeError> {
    let [Sexp::Vector(bindings), body @ ..] = args else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "expected (loop [name init ...] body)",
        ));
    };
    if bindings.len() % 2 != 0 {
        return Err(AnalyzeError::new(
            whole.describe(),
            "loop bindings require an even number of forms",
        ));
    }
    if body.is_empty() {
        return Err(AnalyzeError::new(whole.describe(), "loop body is empty"));
    }
    Ok(Node::Loop {
        bindings: analyze_bindings(whole, bindings)?,
        body: analyze_body(body)?,
    })
}

/// Body of a recur target: only the final form may contain `recur`.
fn analyze_body(body: &[Sexp]) -> Result<Vec<Node>, AnalyzeError> {
    let mut analyzed = Vec::with_capacity(body.len());
    for (i, form) in body.iter().enumerate() {
        analyzed.push(analyze_in(form, i == body.len() - 1)?);
    }
    Ok(analyzed)
}

fn analyze_thread(
    whole: &Sexp,
    args: &[Sexp],
    thread_last: bool,
    recur_ok: bool,
) -> Result<Node, AnalyzeError> {
    let [seed, steps @ ..] = args else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "threading requires an initial value",
        ));
    };
    let mut current = seed.clone();
    for step in steps {
        current = match step {
            Sexp::List(call) if !call.is_empty() => {
                let mut rewritten = call.clone();
                if thread_last {
                    rewritten.push(current);
                } else {
                    rewritten.insert(1, current);
                }
                Sexp::List(rewritten)
            }
            // Bare symbol or keyword step becomes a unary call.
            _ => Sexp::List(vec![step.clone(), current]),
        };
    }
    analyze_in(&current, recur_ok)
}

fn analyze_task(whole: &Sexp, args: &[Sexp]) -> Result<Node, AnalyzeError> {
    let [id, body @ ..] = args else {
        return Err(AnalyzeError::new(
            whole.describe(),
            "expected (task \"id\" expr)",
        ));
    };
    if body.is_empty() {
        return Err(AnalyzeError::new(whole.describe(), "task body is empty"));
    }
    Ok(Node::Task {
        id: Box::new(analyze_in(id, false)?),
        body: analyze_all(body)?,
    })
}

fn analyze_pattern(whole: &Sexp, sexp: &Sexp) -> Result<Pattern, AnalyzeError> {
    match sexp {
        Sexp::Symbol(name) => {
            if name.contains('/') {
                return Err(AnalyzeError::new(
                    whole.describe(),
                    format!("cannot bind namespaced name {name}"),
                ));
            }
            Ok(Pattern::Sym(name.clone()))
        }
        Sexp::Vector(items) => Ok(Pattern::Vector(
            items
                .iter()
                .map(|p| analyze_pattern(whole, p))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Sexp::Map(pairs) => {
            let [(Sexp::Keyword(kind), Sexp::Vector(names))] = pairs.as_slice() else {
                return Err(AnalyzeError::new(
                    whole.describe(),
                    "map destructuring supports only {:keys [a b]}",
                ));
            };
            if kind != "keys" {
                return Err(AnalyzeError::new(
                    whole.describe(),
                    "map destructuring supports only {:keys [a b]}",
                ));
            }
            let keys = names
                .iter()
                .map(|n| match n {
                    Sexp::Symbol(s) => Ok(s.clone()),
                    other => Err(AnalyzeError::new(
                        whole.describe(),
                        format!("expected symbol in :keys vector, got {}", other.describe()),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Pattern::MapKeys(keys))
        }
        other => Err(AnalyzeError::new(
            whole.describe(),
            format!("cannot destructure {}", other.describe()),
        )),
    }
}

fn check_bindable(whole: &Sexp, name: &str) -> Result<(), AnalyzeError> {
    if builtins::is_builtin(name) || is_special_form(name) {
        return Err(AnalyzeError::new(
            whole.describe(),
            format!("cannot shadow builtin {name}"),
        ));
    }
    if name.contains('/') {
        return Err(AnalyzeError::new(
            whole.describe(),
            format!("cannot define namespaced name {name}"),
        ));
    }
    Ok(())
}

fn is_special_form(name: &str) -> bool {
    matches!(
        name,
        "def"
            | "defonce"
            | "defn"
            | "let"
            | "fn"
            | "if"
            | "if-let"
            | "when"
            | "cond"
            | "do"
            | "and"
            | "or"
            | "loop"
            | "recur"
            | "return"
            | "fail"
            | "task"
            | "task-reset"
            | "step-done"
            | "pmap"
            | "pcalls"
            | "->"
            | "->>"
    )
}
