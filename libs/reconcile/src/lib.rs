//! Reconciliation primitives.
//!
//! This library computes the work needed to converge a set of running
//! resources (current state) onto a requested set (desired state). Key
//! concepts:
//!
//! - **Desired state**: what should be running (from config file or API).
//! - **Current state**: what is running right now (keys of the live maps).
//! - **Diff**: the resources to tear down and the resources to bring up.
//!
//! # Invariants
//!
//! - `need_close = current \ desired`, `need_create = desired \ current`
//! - Resources present on both sides never appear in the diff
//! - Diffing a set against itself yields no work (idempotence)
//! - Duplicate desired entries produce at most one create

use std::collections::HashSet;
use std::hash::Hash;

/// Work required to converge current state onto desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<K> {
    /// Running resources absent from the desired set.
    pub need_close: Vec<K>,

    /// Desired resources that are not running.
    pub need_create: Vec<K>,
}

impl<K> Diff<K> {
    /// Returns true if current already matches desired.
    pub fn is_converged(&self) -> bool {
        self.need_close.is_empty() && self.need_create.is_empty()
    }

    /// Total number of close and create operations.
    pub fn len(&self) -> usize {
        self.need_close.len() + self.need_create.len()
    }

    /// Alias for [`Diff::is_converged`].
    pub fn is_empty(&self) -> bool {
        self.is_converged()
    }
}

impl<K> Default for Diff<K> {
    fn default() -> Self {
        Self {
            need_close: Vec::new(),
            need_create: Vec::new(),
        }
    }
}

/// Compute the diff between current and desired state.
///
/// Ordering follows the input iterators: `need_close` in the order the
/// current keys were yielded, `need_create` in desired order with
/// duplicates removed.
pub fn diff<K, C, D>(current: C, desired: D) -> Diff<K>
where
    K: Hash + Eq + Clone,
    C: IntoIterator<Item = K>,
    D: IntoIterator<Item = K>,
{
    let current: Vec<K> = current.into_iter().collect();
    let current_set: HashSet<&K> = current.iter().collect();

    let mut desired_set: HashSet<K> = HashSet::new();
    let mut need_create = Vec::new();

    for key in desired {
        if !desired_set.insert(key.clone()) {
            continue;
        }
        if !current_set.contains(&key) {
            need_create.push(key);
        }
    }

    let need_close = current
        .iter()
        .filter(|key| !desired_set.contains(*key))
        .cloned()
        .collect();

    Diff {
        need_close,
        need_create,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_diff_from_empty() {
        let d = diff(Vec::<u32>::new(), vec![1, 2]);
        assert!(d.need_close.is_empty());
        assert_eq!(d.need_create, vec![1, 2]);
    }

    #[test]
    fn test_diff_to_empty() {
        let d = diff(vec!["a", "b"], Vec::<&str>::new());
        assert_eq!(d.need_close, vec!["a", "b"]);
        assert!(d.need_create.is_empty());
    }

    #[test]
    fn test_diff_keeps_intersection() {
        let d = diff(vec![1, 2, 3], vec![2, 3, 4]);
        assert_eq!(d.need_close, vec![1]);
        assert_eq!(d.need_create, vec![4]);
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_diff_dedupes_desired() {
        let d = diff(Vec::<u32>::new(), vec![7, 7, 7]);
        assert_eq!(d.need_create, vec![7]);
    }

    #[test]
    fn test_diff_converged() {
        let d = diff(vec![1, 2], vec![2, 1]);
        assert!(d.is_converged());
        assert!(d.is_empty());
    }

    proptest! {
        #[test]
        fn prop_diff_is_set_difference(
            current in proptest::collection::hash_set(0u8..32, 0..16),
            desired in proptest::collection::vec(0u8..32, 0..24),
        ) {
            let d = diff(current.iter().copied(), desired.iter().copied());
            let desired_set: HashSet<u8> = desired.iter().copied().collect();

            for k in &d.need_close {
                prop_assert!(current.contains(k));
                prop_assert!(!desired_set.contains(k));
            }
            for k in &d.need_create {
                prop_assert!(desired_set.contains(k));
                prop_assert!(!current.contains(k));
            }

            let expected_close = current.difference(&desired_set).count();
            let expected_create = desired_set.difference(&current).count();
            prop_assert_eq!(d.need_close.len(), expected_close);
            prop_assert_eq!(d.need_create.len(), expected_create);
        }

        #[test]
        fn prop_applying_diff_converges(
            current in proptest::collection::hash_set(0u8..32, 0..16),
            desired in proptest::collection::vec(0u8..32, 0..24),
        ) {
            let d = diff(current.iter().copied(), desired.iter().copied());

            let mut after: HashSet<u8> = current.clone();
            for k in &d.need_close {
                after.remove(k);
            }
            for k in &d.need_create {
                after.insert(*k);
            }

            let second = diff(after.iter().copied(), desired.iter().copied());
            prop_assert!(second.is_converged());
        }
    }
}
