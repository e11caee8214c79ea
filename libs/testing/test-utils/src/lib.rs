//! Shared test utilities for broker testing
//!
//! - [`TestRedis`]: a throwaway coordination store per test, already
//!   wrapped in the adapter the workers use
//! - [`task_id`]: unique, readable task ids for tests that don't assert
//!   on the exact id
//! - [`seeded_task_ids`]: deterministic, lexicographically ordered ids for
//!   tests that depend on tie-break ordering

use uuid::Uuid;

mod redis;

pub use redis::TestRedis;

/// Unique task id with a readable prefix.
///
/// For tests where submissions must not collide across cases but the
/// exact id carries no meaning.
pub fn task_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Deterministic task ids derived from the test name.
///
/// Ids are zero-padded so they sort lexicographically in generation
/// order; scheduled-set tie-breaks (equal due times resolve by id) can
/// therefore be asserted without hand-picking id strings. Stable across
/// runs for reproducible failures.
pub fn seeded_task_ids(test_name: &str, count: usize) -> Vec<String> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let seed = hasher.finish();

    (0..count)
        .map(|index| format!("task-{:016x}-{:04}", seed, index))
        .collect()
}
