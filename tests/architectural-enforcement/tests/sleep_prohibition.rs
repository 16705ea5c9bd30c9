//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code runs on the tokio runtime and MUST NOT block
//! a worker thread with `std::thread::sleep`.
//! **Allowed**: `tokio::time::sleep` / `timeout` for deadlines and backoff.

use architectural_enforcement::{report, scan};

fn blocking_sleep(code: &str) -> Option<&'static str> {
    if code.contains("thread::sleep") {
        Some("Blocking sleep")
    } else {
        None
    }
}

#[test]
fn test_no_blocking_sleep_in_production_code() {
    let violations = scan(blocking_sleep);

    report(
        "CRITICAL: Blocking sleep calls found in production code!",
        &violations,
        &[
            "Use tokio::time::sleep(..).await for backoff",
            "Use tokio::time::timeout for deadlines",
            "Wait on the socket or a CancellationToken instead of polling with sleeps",
        ],
    );
}

#[test]
fn test_sleep_detection() {
    assert!(blocking_sleep("    std::thread::sleep(Duration::from_millis(5));").is_some());
    assert!(blocking_sleep("    thread::sleep(d);").is_some());
    assert!(blocking_sleep("    tokio::time::sleep(d).await;").is_none());
}
