//! Static prompt text: role statement, output contract, and the language
//! reference shown to the model.

pub const ROLE: &str = r#"You are an agent that completes a mission by writing small programs in a Clojure-flavored expression language. Each turn you inspect the data and prior results, then respond with exactly one program."#;

pub const OUTPUT_CONTRACT: &str = r#"Respond with exactly one code block containing a single program:

```clojure
(your program here)
```

No prose outside the code block."#;

pub const LANGUAGE_REFERENCE: &str = r#"## Language reference

Literals: nil, true/false, integers, floats, "strings", :keywords.
Collections: vectors [1 2 3], maps {:k v}, sets #{1 2}.

Namespaces:
- data/name          read an input value
- memory/name        read a value you defined earlier
- (tool/name :k v)   invoke a tool; arguments are keyword pairs or one map
- (budget/remaining) map of remaining budgets, e.g. {:turns_left 3}

Definitions and control flow:
- (def name expr), (defonce name expr), (defn name [args] body)
- (let [x 1, [a b] pair, {:keys [c]} m] body)
- (if c then else), (when c body), (cond c1 e1 c2 e2 :else e)
- (do e1 e2), (and ...), (or ...)
- (loop [x 0] (if (< x 5) (recur (+ x 1)) x))
- (-> x f (g 1)) threads first, (->> xs (map f) (filter g)) threads last
- *1 *2 *3 are the results of the last three turns

Finishing:
- (return value)   finish successfully with value
- (fail reason)    give up with reason

Parallelism:
- (pmap f coll)       parallel map, result order matches input order
- (pcalls f1 f2 ...)  run zero-argument functions in parallel
Note: println output inside pmap/pcalls is lost.

Functions: + - * / = not= < <= > >= not, first last nth count empty?,
map mapv filter remove reduce concat take drop take-while drop-while
sort-by group-by distinct reverse flatten into pairs, get get-in assoc
dissoc merge keys vals contains? update update-vals update-in, split
split-lines join subs includes? starts-with? ends-with? grep grep-n
re-find re-pattern parse-long parse-double, sum-by avg-by min-by max-by
pluck, println.

Predicates: (where :field op value) with ops = not= > < >= <= in includes,
combined with (all-of p1 p2), (any-of ...), (none-of ...); (juxt f g)
applies several projections at once. Keywords act as getters: (:k m).
Sets act as membership tests: (s x) returns x or nil."#;

/// Shorter variant for single-shot agents: no memory, no multi-turn
/// machinery.
pub const LANGUAGE_REFERENCE_SINGLE_TURN: &str = r#"## Language reference

Literals: nil, true/false, integers, floats, "strings", :keywords.
Collections: vectors [1 2 3], maps {:k v}, sets #{1 2}.

- data/name          read an input value
- (let [x 1] body), (if c then else), (cond c1 e1 :else e)
- (-> x f (g 1)) threads first, (->> xs (map f) (filter g)) threads last
- (return value)   finish successfully with value
- (fail reason)    give up with reason

Functions: + - * / = not= < <= > >= not, first last nth count empty?,
map mapv filter remove reduce concat take drop sort-by group-by distinct
reverse flatten into, get get-in assoc dissoc merge keys vals contains?,
split split-lines join subs includes? starts-with? ends-with? grep
re-find parse-long parse-double, sum-by avg-by min-by max-by pluck,
(where :field op value) with all-of/any-of/none-of. Keywords act as
getters: (:k m)."#;

pub const JOURNAL_REFERENCE: &str = r#"## Task journal

Wrap expensive work in (task "id" expr): on later turns the cached value is
returned without re-evaluating. (task-reset "id") clears one entry.
(step-done) marks the current plan step finished."#;
