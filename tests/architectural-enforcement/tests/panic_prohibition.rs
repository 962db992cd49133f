//! Integration Test: Panic and Blocking Prohibition
//!
//! **Policy**: production code propagates errors (`?`, `Option`, logged
//! `null` replies) instead of panicking, and never parks a runtime thread.
//!
//! ✅ ACCEPTABLE:
//!   - Test code
//!   - `unwrap_or`, `unwrap_or_else`, `unwrap_or_default`

use architectural_enforcement::{
    crate_dirs, enforce, is_blocking_sleep, is_panicking_unwrap, scan,
};

#[test]
fn test_no_unwrap_in_production_code() {
    let violations: Vec<_> = crate_dirs()
        .iter()
        .flat_map(|dir| scan(dir, is_panicking_unwrap))
        .collect();
    enforce("unwrap()/expect() found in production code!", &violations);
}

#[test]
fn test_no_blocking_sleep_in_production_code() {
    let violations: Vec<_> = crate_dirs()
        .iter()
        .flat_map(|dir| scan(dir, is_blocking_sleep))
        .collect();
    enforce("std::thread::sleep found in async production code!", &violations);
}
