//! Membership reconciliation primitives.
//!
//! This library provides the set arithmetic behind polling reconciliation
//! loops that track which members of a remote collection are present:
//!
//! - **Baseline**: what the loop last believed was present.
//! - **Found**: what the authoritative source reports right now.
//! - **Diff**: members that appeared (added) and disappeared (removed).
//!
//! # Invariants
//!
//! - Membership is decided by key only; every other field is ignored
//! - Each key appears at most once in `added` and at most once in `removed`
//! - `added` follows the iteration order of the found sequence, `removed`
//!   follows the iteration order of the baseline

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Result of comparing a baseline against a freshly found sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipDiff<T> {
    /// Members present in the found sequence but not in the baseline.
    pub added: Vec<T>,

    /// Members present in the baseline but not in the found sequence.
    pub removed: Vec<T>,
}

impl<T> MembershipDiff<T> {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Total number of changes.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

impl<T> Default for MembershipDiff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Compute which members were added and removed.
///
/// Members are cloned out of the input slices; the snapshot carried by an
/// added member comes from `found`, the one carried by a removed member
/// comes from `baseline`.
pub fn diff_membership<T, K, F>(baseline: &[T], found: &[T], key: F) -> MembershipDiff<T>
where
    T: Clone,
    K: Eq + Hash + ?Sized,
    F: Fn(&T) -> &K,
{
    let mut diff = MembershipDiff::default();

    let known: HashSet<&K> = baseline.iter().map(&key).collect();
    let mut emitted: HashSet<&K> = HashSet::new();
    for member in found {
        let k = key(member);
        if !known.contains(k) && emitted.insert(k) {
            diff.added.push(member.clone());
        }
    }

    if baseline.is_empty() {
        return diff;
    }

    let present: HashSet<&K> = found.iter().map(&key).collect();
    let mut emitted: HashSet<&K> = HashSet::new();
    for member in baseline {
        let k = key(member);
        if !present.contains(k) && emitted.insert(k) {
            diff.removed.push(member.clone());
        }
    }

    diff
}

/// Drop members whose key already appeared earlier in the sequence.
///
/// The first occurrence wins and relative order is preserved.
pub fn dedupe_by_key<T, K, F>(members: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash + Clone,
    F: Fn(&T) -> &K,
{
    let mut seen = HashSet::new();
    members
        .into_iter()
        .filter(|m| seen.insert(key(m).clone()))
        .collect()
}
