//! Integration Test: Shared State Prohibition
//!
//! Every table (routes, pooled connections, workers, cache entries) is owned
//! by a value that is passed around by `Arc`. A module-level `static`
//! holding a lock or map would make two hubs in one test process share
//! state.
//!
//! Function-local atomics (connection counters) are allowed.

use architectural_enforcement::{crate_dirs, enforce, is_global_registry, scan};

#[test]
fn test_no_module_level_registries() {
    let violations: Vec<_> = crate_dirs()
        .iter()
        .flat_map(|dir| scan(dir, is_global_registry))
        .collect();
    enforce("Module-level mutable statics found in production code!", &violations);
}
