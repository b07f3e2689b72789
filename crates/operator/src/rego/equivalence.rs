//! Decides whether decoded policy state matches the desired state

use std::collections::BTreeSet;

use super::{LabelSet, Selector, Selectors};

/// Labels are equal when both sides have the same keys with the same values.
#[must_use]
pub fn labels_equal(desired: &LabelSet, current: &LabelSet) -> bool {
    desired.len() == current.len()
        && desired
            .iter()
            .all(|(key, value)| current.get(key) == Some(value))
}

/// Selectors are equal when both sides have the same keys and, per key, the
/// same members. Order and duplicates do not matter, but a key with no values
/// differs from a missing key.
#[must_use]
pub fn selector_equal(desired: &Selector, current: &Selector) -> bool {
    desired.len() == current.len()
        && desired.iter().all(|(key, values)| {
            current
                .get(key)
                .is_some_and(|current| same_members(values, current))
        })
}

/// Both groups must match independently.
#[must_use]
pub fn selectors_equal(desired: &Selectors, current: &Selectors) -> bool {
    selector_equal(&desired.include, &current.include)
        && selector_equal(&desired.exclude, &current.exclude)
}

fn same_members(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn selector(pairs: &[(&str, &[&str])]) -> Selector {
        pairs
            .iter()
            .map(|(k, vs)| {
                (
                    (*k).to_string(),
                    vs.iter().map(|v| (*v).to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn labels_differing_by_one_key_are_not_equal() {
        let desired = labels(&[("env", "prod"), ("system-type", "custom")]);
        assert!(labels_equal(&desired, &desired.clone()));

        let added = labels(&[("env", "prod"), ("system-type", "custom"), ("x", "y")]);
        let removed = labels(&[("env", "prod")]);
        let changed = labels(&[("env", "dev"), ("system-type", "custom")]);
        for current in [added, removed, changed] {
            assert!(!labels_equal(&desired, &current));
        }
    }

    #[test]
    fn selector_values_are_sets() {
        let desired = selector(&[("team", &["a", "b"])]);
        assert!(selector_equal(&desired, &selector(&[("team", &["b", "a"])])));
        assert!(selector_equal(&desired, &selector(&[("team", &["a", "b", "a"])])));
        assert!(!selector_equal(&desired, &selector(&[("team", &["a"])])));
        assert!(!selector_equal(&desired, &selector(&[("team", &["a", "c"])])));
    }

    #[test]
    fn empty_values_differ_from_missing_key() {
        let desired = selector(&[("team", &[])]);
        assert!(!selector_equal(&desired, &Selector::new()));
        assert!(!selector_equal(&Selector::new(), &desired));
        assert!(selector_equal(&desired, &selector(&[("team", &[])])));
    }

    #[test]
    fn both_groups_must_match() {
        let desired = Selectors {
            include: selector(&[("team", &["a"])]),
            exclude: selector(&[("zone", &["eu"])]),
        };
        let mut current = desired.clone();
        assert!(selectors_equal(&desired, &current));

        current.exclude.clear();
        assert!(!selectors_equal(&desired, &current));
    }
}
