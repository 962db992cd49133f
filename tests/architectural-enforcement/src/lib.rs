//! Architectural Enforcement Integration Tests
//!
//! Source-level checks over the bridgehub crates:
//! - No module-level mutable registries (state lives in owned tables)
//! - No `unwrap()`/`expect()` outside test code
//! - No blocking sleeps in the async crates
//! - No declared dependency that the sources never name
//!
//! Test code is everything from a file's first `#[cfg(test)]` line on,
//! which is where every module keeps its tests.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("../.."))
}

/// The crate source directories under check
#[must_use]
pub fn crate_dirs() -> Vec<PathBuf> {
    let root = workspace_root();
    vec![root.join("bridgehub/core/src"), root.join("bridgehub/daemon/src")]
}

/// Every `.rs` file under `dir`
#[must_use]
pub fn rust_sources(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| p.extension().is_some_and(|ext| ext == "rs"))
        .collect();
    files.sort();
    files
}

/// Lines of `source` before its test module, numbered from 1
#[must_use]
pub fn production_lines(source: &str) -> Vec<(usize, &str)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(i, line)| (i + 1, line))
        .collect()
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//")
}

/// Production lines under `dir` for which `offends` holds
#[must_use]
pub fn scan(dir: &Path, offends: impl Fn(&str) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in rust_sources(dir) {
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        for (line, text) in production_lines(&source) {
            if !is_comment(text) && offends(text) {
                violations.push(Violation {
                    path: path.clone(),
                    line,
                    text: text.trim().to_string(),
                });
            }
        }
    }
    violations
}

/// A `static` declared at module level holding shared mutable state
#[must_use]
pub fn is_global_registry(line: &str) -> bool {
    const MUTABLE: [&str; 8] = [
        "Mutex", "RwLock", "DashMap", "OnceLock", "OnceCell", "Lazy", "HashMap", "static mut",
    ];
    let at_module_level = line.starts_with("static ")
        || line.starts_with("pub static ")
        || line.starts_with("pub(crate) static ");
    at_module_level && MUTABLE.iter().any(|m| line.contains(m))
}

/// `.unwrap()` or `.expect(` on a production line
#[must_use]
pub fn is_panicking_unwrap(line: &str) -> bool {
    line.contains(".unwrap()") || line.contains(".expect(")
}

/// A thread-blocking sleep
#[must_use]
pub fn is_blocking_sleep(line: &str) -> bool {
    line.contains("thread::sleep(")
}

/// Names under `[dependencies]` in a Cargo manifest
#[must_use]
pub fn declared_dependencies(manifest: &str) -> Vec<String> {
    manifest
        .lines()
        .map(str::trim)
        .skip_while(|line| *line != "[dependencies]")
        .skip(1)
        .take_while(|line| !line.starts_with('['))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split('=').next())
        .map(|name| name.trim().to_string())
        .collect()
}

/// Dependencies of the crate whose sources live in `src_dir` that no source file names
#[must_use]
pub fn unreferenced_dependencies(src_dir: &Path) -> Vec<String> {
    let Some(manifest) = src_dir
        .parent()
        .and_then(|root| fs::read_to_string(root.join("Cargo.toml")).ok())
    else {
        return Vec::new();
    };
    let sources: String = rust_sources(src_dir)
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .collect();
    declared_dependencies(&manifest)
        .into_iter()
        .filter(|name| !sources.contains(&format!("{}::", name.replace('-', "_"))))
        .collect()
}

/// Print `violations` under `title` and fail the calling test if there are any
///
/// # Panics
///
/// When `violations` is non-empty.
pub fn enforce(title: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
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
    fn test_sources_found() {
        for dir in crate_dirs() {
            assert!(!rust_sources(&dir).is_empty(), "no sources in {dir:?}");
        }
    }

    #[test]
    fn test_detectors() {
        assert!(is_global_registry("static PEERS: Mutex<Vec<u8>> = Mutex::new(Vec::new());"));
        assert!(is_global_registry("pub static mut COUNT: u32 = 0;"));
        // Function-local counters are fine.
        assert!(!is_global_registry("    static NEXT_CONN: AtomicU64 = AtomicU64::new(1);"));
        assert!(!is_global_registry("static NAMES: &[&str] = &[];"));

        assert!(is_panicking_unwrap("let x = y.unwrap();"));
        assert!(!is_panicking_unwrap("let x = y.unwrap_or_default();"));

        assert!(is_blocking_sleep("std::thread::sleep(Duration::from_millis(5));"));
        assert!(!is_blocking_sleep("tokio::time::sleep(POLL_INTERVAL).await;"));

        let manifest = "[package]\nname = \"x\"\n\n[dependencies]\n# Async\ntokio = { version = \"1\" }\naes-gcm = \"0.10\"\n\n[dev-dependencies]\ntempfile = \"3\"\n";
        assert_eq!(declared_dependencies(manifest), vec!["tokio", "aes-gcm"]);

        let source = "fn a() {}\n#[cfg(test)]\nmod tests { fn b() { x.unwrap(); } }\n";
        assert_eq!(production_lines(source), vec![(1, "fn a() {}")]);
    }
}
