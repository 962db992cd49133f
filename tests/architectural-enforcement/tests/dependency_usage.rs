//! Integration Test: Declared Dependencies Are Used
//!
//! **Policy**: every crate under `[dependencies]` is named somewhere in the
//! crate's sources.

use architectural_enforcement::{crate_dirs, unreferenced_dependencies};

#[test]
fn test_no_unreferenced_dependencies() {
    let unused: Vec<String> = crate_dirs()
        .iter()
        .flat_map(|dir| {
            unreferenced_dependencies(dir)
                .into_iter()
                .map(move |name| format!("{}: {name}", dir.display()))
        })
        .collect();

    if !unused.is_empty() {
        eprintln!("\n❌ Dependencies declared but never referenced\n");
        for entry in &unused {
            eprintln!("  ❌ {entry}");
        }
    }
    assert!(unused.is_empty(), "remove the unused dependencies listed above");
}
