//! Property tests for the sandboxed expression evaluator: arbitrary input
//! must fail closed, never panic, and never resolve names outside the scope.

use std::collections::HashMap;

use proptest::prelude::*;
use serde_json::{json, Value};

use openskelo::services::expr;

proptest! {
    /// Arbitrary ASCII input never panics the parser; it either parses or
    /// errors.
    #[test]
    fn parse_never_panics(input in "[ -~]{0,64}") {
        let _ = expr::check(&input);
    }

    /// Arbitrary input evaluated against an empty scope never panics.
    #[test]
    fn eval_never_panics(input in "[ -~]{0,64}") {
        let scope = HashMap::new();
        let _ = expr::evaluate(&input, &scope);
    }

    /// Identifiers outside the scope always fail, whatever the name.
    #[test]
    fn unknown_identifiers_fail_closed(name in "[a-zA-Z_][a-zA-Z0-9_]{0,16}") {
        prop_assume!(!matches!(name.as_str(), "true" | "false" | "null" | "undefined" | "new" | "function"));
        let scope = HashMap::new();
        prop_assert!(expr::evaluate(&name, &scope).is_err());
    }

    /// Numeric comparisons agree with Rust's own ordering.
    #[test]
    fn comparisons_match_rust(a in -1000i64..1000, b in -1000i64..1000) {
        let scope: HashMap<String, Value> =
            [("a".to_string(), json!(a)), ("b".to_string(), json!(b))].into();
        let lt = expr::evaluate("a < b", &scope).unwrap();
        prop_assert_eq!(lt, json!(a < b));
        let ge = expr::evaluate("a >= b", &scope).unwrap();
        prop_assert_eq!(ge, json!(a >= b));
    }
}

#[test]
fn assignment_like_inputs_are_rejected() {
    let scope: HashMap<String, Value> = [("x".to_string(), json!(1))].into();
    for source in ["x = 1", "x += 1", "x++", "x--", "x => x", "delete x"] {
        assert!(
            expr::evaluate(source, &scope).is_err(),
            "'{source}' should fail closed"
        );
    }
}
