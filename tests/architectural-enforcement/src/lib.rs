//! Architectural Enforcement Integration Tests
//!
//! Static checks over the relay sources, run as ordinary tests:
//! - No thread-blocking sleeps in production code
//! - No `.unwrap()` / `.expect(` in production code
//!
//! This library holds the shared scanning helpers; the checks themselves
//! live under `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// A rule violation at a specific source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the violation was found in
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What was found
    pub rule: &'static str,
    /// The offending source line, trimmed
    pub source: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.source
        )
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Every `.rs` file under `dir`
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Production lines of a source file as `(line_number, code)` pairs
///
/// Everything from the first `#[cfg(test)]` on is test code and skipped.
/// Comment lines and trailing comments are dropped.
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    let mut lines = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }

        let code = line.split("//").next().unwrap_or(line);
        lines.push((idx + 1, code));
    }

    lines
}

/// Scan all production directories with `check`
///
/// `check` returns the rule name when a line violates it.
pub fn scan<F>(check: F) -> Vec<Violation>
where
    F: Fn(&str) -> Option<&'static str>,
{
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        let dir = root.join(dir);
        assert!(dir.exists(), "missing source directory {}", dir.display());

        for path in rust_files(&dir) {
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };

            for (line, code) in production_lines(&content) {
                if let Some(rule) = check(code) {
                    violations.push(Violation {
                        path: path.clone(),
                        line,
                        rule,
                        source: code.trim().to_string(),
                    });
                }
            }
        }
    }

    violations
}

/// Print violations and fail the calling test if there are any
pub fn report(title: &str, violations: &[Violation], hints: &[&str]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }

    eprintln!();
    for hint in hints {
        eprintln!("  - {hint}");
    }

    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n// note\nfn b() {} // tail\n#[cfg(test)]\nmod tests {}\n";
        let lines = production_lines(source);

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (1, "fn a() {}"));
        assert_eq!(lines[1], (3, "fn b() {} "));
    }

    #[test]
    fn test_production_dirs_exist() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(root.join(dir).is_dir(), "{dir} should exist");
        }
    }
}
