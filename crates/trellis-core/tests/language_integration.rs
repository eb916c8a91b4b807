//! End-to-end language tests: source text in, globals and logs out.

mod common;

use common::{run_failing, run_script};
use trellis_core::error::{ExecutionErrorKind, RuleCode, TrellisError};
use trellis_core::lexer::{tokenize, TokenKind};
use trellis_core::value::Value;

fn list(items: &[i64]) -> Value {
    Value::from(items.to_vec())
}

fn parse_rule(result: Result<trellis_core::ExecutionReport, TrellisError>) -> (RuleCode, usize, String) {
    match result {
        Err(TrellisError::Parse(e)) => (e.rule, e.line, e.message),
        Err(other) => panic!("Expected a parse error, got {}", other),
        Ok(_) => panic!("Expected a parse error, script ran"),
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_undefined_reference_is_rejected_before_running() {
    let (rule, line, message) = parse_rule(run_script("let x = 10\nlet y = x + undefined_var").await);
    assert_eq!(rule, RuleCode::UndefinedReference);
    assert_eq!(line, 2);
    assert!(message.contains("undefined_var"));
}

#[tokio::test]
async fn test_constant_reassignment_reports_declaration_line() {
    let (rule, line, message) = parse_rule(run_script("const MAX = 100\nMAX = 200").await);
    assert_eq!(rule, RuleCode::ImmutableRebinding);
    assert_eq!(line, 2);
    assert!(message.contains("MAX"));
    assert!(message.contains("line 1"));
}

#[tokio::test]
async fn test_function_call() {
    let report = run_script("function add(a, b):\n    return a + b\nlet r = add(10, 20)")
        .await
        .unwrap();
    assert_eq!(report.global("r"), Some(&Value::Integer(30)));
}

#[tokio::test]
async fn test_filter_with_lambda() {
    let report = run_script("let numbers = [1,2,3,4,5,6]\nlet evens = numbers.filter(x => x % 2 == 0)")
        .await
        .unwrap();
    assert_eq!(report.global("evens"), Some(&list(&[2, 4, 6])));
}

#[tokio::test]
async fn test_direct_recursion() {
    let err = run_failing("function f(n):\n    return f(n-1)\nf(3)").await;
    assert_eq!(err.kind, ExecutionErrorKind::Recursion);
    assert!(err.message.contains("recursion not supported"));
}

#[tokio::test]
async fn test_closures_from_one_site_can_call_each_other() {
    let source = "\
function wrap(g):
    return x => g(x) + 1
let a = wrap(x => x)
let b = wrap(a)
let r = b(1)
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("r"), Some(&Value::Integer(3)));
}

#[tokio::test]
async fn test_nested_function_may_reuse_outer_name() {
    let source = "\
function f(n):
    function f(m):
        return m * 2
    return f(n) + 1
let r = f(5)
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("r"), Some(&Value::Integer(11)));
}

#[tokio::test]
async fn test_recursion_through_a_lambda_is_still_caught() {
    let source = "\
let holder = {}
holder = {run: n => holder.run(n)}
holder.run(1)
";
    let err = run_failing(source).await;
    assert_eq!(err.kind, ExecutionErrorKind::Recursion);
    assert!(err.message.contains("<lambda@2:"));
}

#[tokio::test]
async fn test_parameter_mutation_does_not_leak() {
    let report = run_script("let num = 5\nfunction double(n):\n    n = n * 2\n    return n\nlet result = double(num)")
        .await
        .unwrap();
    assert_eq!(report.global("num"), Some(&Value::Integer(5)));
    assert_eq!(report.global("result"), Some(&Value::Integer(10)));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn test_indent_dedent_balance() {
    let sources = [
        "if true:\n    log 1",
        "function f(a):\n    if a:\n        for x in [1]:\n            log x\n    return a\nlog f(1)",
        "step \"s\":\n    while false:\n        break\n\n\nlog 2",
        "when 1:\n    1:\n        log \"one\"\n    else:\n        log \"other\"",
    ];
    for source in sources {
        let tokens = tokenize(source).unwrap();
        let indents = tokens.iter().filter(|t| t.kind == TokenKind::Indent).count();
        let dedents = tokens.iter().filter(|t| t.kind == TokenKind::Dedent).count();
        assert_eq!(indents, dedents, "unbalanced blocks in {:?}", source);
        assert!(indents > 0);
    }
}

#[tokio::test]
async fn test_declared_before_use_is_accepted() {
    let report = run_script("let a = 1\nlet b = a + 1").await.unwrap();
    assert_eq!(report.global("b"), Some(&Value::Integer(2)));
}

#[tokio::test]
async fn test_forward_reference_is_rejected() {
    let (rule, _, _) = parse_rule(run_script("let b = a + 1\nlet a = 1").await);
    assert_eq!(rule, RuleCode::UndefinedReference);
}

#[tokio::test]
async fn test_mutable_reassignment_is_allowed() {
    let report = run_script("let count = 1\ncount = 2\ncount += 3").await.unwrap();
    assert_eq!(report.global("count"), Some(&Value::Integer(5)));
}

#[tokio::test]
async fn test_duplicate_declarations() {
    let (rule, _, _) = parse_rule(run_script("let a = 1\nconst a = 2").await);
    assert_eq!(rule, RuleCode::DuplicateDeclaration);

    let report = run_script("let a = 1\nif true:\n    let a = 2\n    log a\nlog a").await.unwrap();
    assert_eq!(report.logs, vec!["2", "1"]);
}

#[tokio::test]
async fn test_local_colliding_with_parameter_is_duplicate() {
    let (rule, line, _) = parse_rule(run_script("function f(a):\n    let a = 2\n    return a").await);
    assert_eq!(rule, RuleCode::DuplicateDeclaration);
    assert_eq!(line, 2);
}

#[tokio::test]
async fn test_system_variables_are_read_only() {
    for name in ["page", "env", "response", "browser", "context", "config"] {
        let (rule, _, _) = parse_rule(run_script(&format!("{} = 1", name)).await);
        assert_eq!(rule, RuleCode::ReservedBinding, "assigning {}", name);
    }
    let report = run_script("let url = page.url\nlet headless = browser.headless").await.unwrap();
    assert_eq!(report.global("url"), Some(&Value::string("")));
    assert_eq!(report.global("headless"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_indirect_recursion() {
    let source = "\
function ping(n):
    return pong(n)
function pong(n):
    return ping(n)
";
    // `pong` is declared after `ping`, so the call is a forward reference.
    let (rule, _, _) = parse_rule(run_script(source).await);
    assert_eq!(rule, RuleCode::UndefinedReference);

    let source = "\
let handlers = {}
function outer(n):
    return handlers.next(n)
handlers = {next: n => outer(n)}
outer(1)
";
    let err = run_failing(source).await;
    assert_eq!(err.kind, ExecutionErrorKind::Recursion);
    assert!(err.message.contains("'outer'"));
}

#[tokio::test]
async fn test_list_arguments_are_deep_copied() {
    let source = "\
let items = [1, 2]
function grow(list):
    list.push(3)
    return list.length
let n = grow(items)
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("n"), Some(&Value::Integer(3)));
    assert_eq!(report.global("items"), Some(&list(&[1, 2])));
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_operator_precedence() {
    let report = run_script(
        "let a = 1 + 2 * 3\nlet b = (1 + 2) * 3\nlet c = -2 * 3\nlet d = not 1 > 2 and 3 >= 3\nlet e = 10 - 4 - 3",
    )
    .await
    .unwrap();
    assert_eq!(report.global("a"), Some(&Value::Integer(7)));
    assert_eq!(report.global("b"), Some(&Value::Integer(9)));
    assert_eq!(report.global("c"), Some(&Value::Integer(-6)));
    assert_eq!(report.global("d"), Some(&Value::Bool(true)));
    assert_eq!(report.global("e"), Some(&Value::Integer(3)));
}

#[tokio::test]
async fn test_push_receiver_index_is_evaluated_once() {
    let source = "\
let calls = []
function first():
    calls.push(1)
    return 0
let handlers = [{push: x => x + 1}]
let r = handlers[first()].push(2)
let rows = [[]]
rows[first()].push(9)
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("r"), Some(&Value::Integer(3)));
    assert_eq!(report.global("calls"), Some(&list(&[1, 1])));
    assert_eq!(report.global("rows"), Some(&Value::List(vec![list(&[9])])));
}

#[tokio::test]
async fn test_short_circuit_skips_right_operand() {
    let source = "\
let calls = []
function touch():
    calls.push(1)
    return true
let a = false and touch()
let b = true or touch()
let c = true and touch()
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("calls"), Some(&list(&[1])));
    assert_eq!(report.global("a"), Some(&Value::Bool(false)));
    assert_eq!(report.global("c"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_string_interpolation() {
    let source = "\
let name = \"Rex\"
let pets = [\"a\", \"b\"]
let text = \"{name} has {pets.length} toys, first {pets[0]}, sum {1 + 2}\"
let literal = 'no {name} here'
let escaped = \"\\{name}\"
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("text"), Some(&Value::string("Rex has 2 toys, first a, sum 3")));
    assert_eq!(report.global("literal"), Some(&Value::string("no {name} here")));
    assert_eq!(report.global("escaped"), Some(&Value::string("{name}")));
}

#[tokio::test]
async fn test_null_comparison_for_any_type() {
    let report = run_script("let a = [1] == null\nlet b = null == null\nlet c = {x: 1}.y == null")
        .await
        .unwrap();
    assert_eq!(report.global("a"), Some(&Value::Bool(false)));
    assert_eq!(report.global("b"), Some(&Value::Bool(true)));
    assert_eq!(report.global("c"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_structural_equality() {
    let report = run_script("let a = [1, {k: [2]}] == [1, {k: [2]}]\nlet b = 2 == 2.0").await.unwrap();
    assert_eq!(report.global("a"), Some(&Value::Bool(true)));
    assert_eq!(report.global("b"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_collection_methods() {
    let source = "\
let nums = [3, 1, 2]
let doubled = nums.map(n => n * 2)
let total = nums.reduce((acc, n) => acc + n, 0)
let product = nums.reduce((acc, n) => acc * n)
let sorted = nums.sort()
let desc = nums.sort((a, b) => b - a)
let found = nums.find(n => n > 1)
let any = nums.some(n => n > 2)
let all = nums.every(n => n > 2)
let indexed = nums.map((n, i) => i)
let joined = nums.join(\"-\")
let seen = []
nums.forEach(n => seen.push(n))
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("doubled"), Some(&list(&[6, 2, 4])));
    assert_eq!(report.global("total"), Some(&Value::Integer(6)));
    assert_eq!(report.global("product"), Some(&Value::Integer(6)));
    assert_eq!(report.global("sorted"), Some(&list(&[1, 2, 3])));
    assert_eq!(report.global("desc"), Some(&list(&[3, 2, 1])));
    assert_eq!(report.global("found"), Some(&Value::Integer(3)));
    assert_eq!(report.global("any"), Some(&Value::Bool(true)));
    assert_eq!(report.global("all"), Some(&Value::Bool(false)));
    assert_eq!(report.global("indexed"), Some(&list(&[0, 1, 2])));
    assert_eq!(report.global("joined"), Some(&Value::string("3-1-2")));
    assert_eq!(report.global("seen"), Some(&list(&[3, 1, 2])));
    assert_eq!(report.global("nums"), Some(&list(&[3, 1, 2])));
}

#[tokio::test]
async fn test_reduce_of_empty_list_without_initial() {
    let err = run_failing("let r = [].reduce((a, b) => a + b)").await;
    assert_eq!(err.kind, ExecutionErrorKind::Type);
}

#[tokio::test]
async fn test_string_and_object_methods() {
    let source = "\
let s = \"  Hello World  \".trim()
let parts = \"a,b,c\".split(\",\")
let shout = s.upper()
let user = {name: \"ann\", age: 30}
let keys = user.keys()
let has = user.has(\"age\")
let size = user.length
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("s"), Some(&Value::string("Hello World")));
    assert_eq!(report.global("parts"), Some(&Value::from(vec!["a", "b", "c"])));
    assert_eq!(report.global("shout"), Some(&Value::string("HELLO WORLD")));
    assert_eq!(report.global("keys"), Some(&Value::from(vec!["age", "name"])));
    assert_eq!(report.global("has"), Some(&Value::Bool(true)));
    assert_eq!(report.global("size"), Some(&Value::Integer(2)));
}

#[tokio::test]
async fn test_nested_assignment() {
    let source = "\
let user = {name: \"ann\", tags: [\"a\", \"b\"]}
user.name = \"bob\"
user.tags[1] = \"z\"
user.age = 4
user.age += 1
";
    let report = run_script(source).await.unwrap();
    match report.global("user") {
        Some(Value::Object(map)) => {
            assert_eq!(map.get("name"), Some(&Value::string("bob")));
            assert_eq!(map.get("tags"), Some(&Value::from(vec!["a", "z"])));
            assert_eq!(map.get("age"), Some(&Value::Integer(5)));
        }
        other => panic!("Expected Object, got {:?}", other),
    }
}

#[tokio::test]
async fn test_builtin_namespaces() {
    let source = "\
let big = math.max(3, 9, 4)
let root = math.sqrt(16)
let pi = math.PI
let data = json.parse('{\"a\": [1, 2]}')
let text = json.stringify({b: true})
let size = len(data.a)
let kind = typeof(data)
let r = range(3)
let day = date.addDays(\"2024-02-28\", 2)
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("big"), Some(&Value::Integer(9)));
    assert_eq!(report.global("root"), Some(&Value::Float(4.0)));
    assert_eq!(report.global("pi"), Some(&Value::Float(std::f64::consts::PI)));
    assert_eq!(report.global("text"), Some(&Value::string(r#"{"b":true}"#)));
    assert_eq!(report.global("size"), Some(&Value::Integer(2)));
    assert_eq!(report.global("kind"), Some(&Value::string("object")));
    assert_eq!(report.global("r"), Some(&list(&[0, 1, 2])));
    assert_eq!(report.global("day"), Some(&Value::string("2024-03-01")));
}

#[tokio::test]
async fn test_imported_members() {
    let source = "\
import { max, PI as pi } from math
let m = max(1, 5)
let twice = pi * 2
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("m"), Some(&Value::Integer(5)));
    assert_eq!(report.global("twice"), Some(&Value::Float(std::f64::consts::PI * 2.0)));
}

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_runtime_error_codes_and_lines() {
    let cases: [(&str, ExecutionErrorKind, usize); 6] = [
        ("let x = 1\nlet y = x()", ExecutionErrorKind::NotCallable, 2),
        ("function f(a):\n    return a\nf(1, 2)", ExecutionErrorKind::Arity, 3),
        ("let xs = [1]\nlet y = xs[5]", ExecutionErrorKind::IndexOutOfRange, 2),
        ("let y = 1 / 0", ExecutionErrorKind::Type, 1),
        ("let y = \"a\" < 1", ExecutionErrorKind::Type, 1),
        ("let y = math.nope(1)", ExecutionErrorKind::UndefinedName, 1),
    ];
    for (source, kind, line) in cases {
        let err = run_failing(source).await;
        assert_eq!(err.kind, kind, "{}", source);
        assert_eq!(err.line, line, "{}", source);
    }
}

#[tokio::test]
async fn test_error_stops_the_script() {
    let source = "log \"before\"\nlet x = [1][3]\nlog \"after\"";
    let result = run_script(source).await;
    match result {
        Err(e) => {
            assert_eq!(e.exit_code(), 1);
            assert_eq!(e.code(), "RT-012");
            assert_eq!(e.line(), Some(2));
        }
        Ok(_) => panic!("Expected failure"),
    }
}

#[tokio::test]
async fn test_lexical_error_exit_code() {
    let err = run_script("let s = \"open").await.unwrap_err();
    assert_eq!(err.code(), "LEX-002");
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_for_over_objects_and_strings() {
    let source = "\
let keys = []
let pairs = []
for k in {b: 2, a: 1}:
    keys.push(k)
for k, v in {b: 2, a: 1}:
    pairs.push(\"{k}={v}\")
let letters = []
for c in \"hi\":
    letters.push(c)
";
    let report = run_script(source).await.unwrap();
    assert_eq!(report.global("keys"), Some(&Value::from(vec!["a", "b"])));
    assert_eq!(report.global("pairs"), Some(&Value::from(vec!["a=1", "b=2"])));
    assert_eq!(report.global("letters"), Some(&Value::from(vec!["h", "i"])));
}

#[tokio::test]
async fn test_for_over_number_is_type_error() {
    let err = run_failing("for x in 5:\n    log x").await;
    assert_eq!(err.kind, ExecutionErrorKind::Type);
    assert_eq!(err.line, 1);
}
