//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code propagates failures as typed errors.
//! `.unwrap()` and `.expect(..)` are only allowed in test code.

use architectural_enforcement::{report, scan};

fn panicking_call(code: &str) -> Option<&'static str> {
    if code.contains(".unwrap()") {
        Some("unwrap() in production code")
    } else if code.contains(".expect(") {
        Some("expect() in production code")
    } else {
        None
    }
}

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan(panicking_call);

    report(
        "CRITICAL: Panicking calls found in production code!",
        &violations,
        &[
            "Return the error with `?` and a thiserror variant",
            "Use unwrap_or / unwrap_or_else / unwrap_or_default for real fallbacks",
            "Keep unwrap()/expect() inside #[cfg(test)] modules",
        ],
    );
}

#[test]
fn test_panic_detection() {
    assert!(panicking_call("let x = y.unwrap();").is_some());
    assert!(panicking_call("let x = y.expect(\"set\");").is_some());
    assert!(panicking_call("let x = y.unwrap_or_else(|_| 0);").is_none());
    assert!(panicking_call("let x = y.unwrap_or_default();").is_none());
}
