//! Pure functions over the slice dependency graph.
//!
//! Keys are plain strings and every map is a `BTreeMap`/`BTreeSet`, so the
//! results are deterministic regardless of registration order.

use std::collections::{BTreeMap, BTreeSet};

use crate::slice::AnySlice;

/// Adjacency map keyed by slice key.
pub type DependencyMap = BTreeMap<String, BTreeSet<String>>;

/// Map every slice key to the set of keys it directly depends on.
pub fn calc_dependencies(slices: &[AnySlice]) -> DependencyMap {
    slices
        .iter()
        .map(|slice| {
            let deps = slice
                .slice_key()
                .dependencies()
                .iter()
                .map(|dep| dep.key().to_owned())
                .collect();
            (slice.key().to_owned(), deps)
        })
        .collect()
}

/// Invert a dependency map: if `X` depends on `Y`, then `X` is in `reverse[Y]`.
///
/// Every key of `deps` (and every dependency it names) is present in the
/// result, mapped to an empty set when nothing depends on it.
pub fn calc_reverse_dependencies(deps: &DependencyMap) -> DependencyMap {
    let mut reverse = DependencyMap::new();
    for (key, direct) in deps {
        reverse.entry(key.clone()).or_default();
        for dep in direct {
            reverse.entry(dep.clone()).or_default().insert(key.clone());
        }
    }
    reverse
}

/// Compute the transitive closure of a reverse-dependency map.
///
/// For every key the result holds all keys that depend on it directly or
/// through any chain of dependencies. Diamonds collapse into a single entry
/// per key, and keys nobody depends on map to an empty set.
pub fn flatten_reverse_dependencies(reverse: &DependencyMap) -> DependencyMap {
    reverse
        .keys()
        .map(|key| {
            let mut seen = BTreeSet::new();
            let mut stack: Vec<&String> = reverse
                .get(key)
                .map(|direct| direct.iter().collect())
                .unwrap_or_default();

            while let Some(next) = stack.pop() {
                if !seen.insert(next.clone()) {
                    continue;
                }
                if let Some(direct) = reverse.get(next) {
                    stack.extend(direct.iter().filter(|k| !seen.contains(*k)));
                }
            }
            // A malformed cyclic map would otherwise list a key as its own dependent.
            seen.remove(key);
            (key.clone(), seen)
        })
        .collect()
}
