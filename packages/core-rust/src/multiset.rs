//! Signed-multiplicity entries and their normalization.
//!
//! A multiset entry is a value with a signed multiplicity: `+1` for an added
//! occurrence, `-1` for a removed one. Normalizing a collection keyed by some
//! identity sums multiplicities per key and drops keys whose sum is zero, which
//! is how redundant add/remove pairs are reconciled before they reach a
//! consumer.

use std::collections::BTreeMap;

use crate::change::Change;
use crate::data::Node;

/// A value with a signed multiplicity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub value: T,
    pub multiplicity: i64,
}

impl<T> Entry<T> {
    #[must_use]
    pub fn new(value: T, multiplicity: i64) -> Self {
        Self {
            value,
            multiplicity,
        }
    }

    /// Flips the sign of the multiplicity.
    #[must_use]
    pub fn negate(self) -> Self {
        Self {
            value: self.value,
            multiplicity: -self.multiplicity,
        }
    }
}

/// Collapses entries with equal keys by summing multiplicities and removes
/// zero-sum results.
///
/// Output order follows the first occurrence of each key. The value kept for a
/// key is the last one seen, so a later add carries the freshest contents.
pub fn normalize<T, K, F>(entries: impl IntoIterator<Item = Entry<T>>, key_fn: F) -> Vec<Entry<T>>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut slots: Vec<Entry<T>> = Vec::new();
    let mut by_key: BTreeMap<K, usize> = BTreeMap::new();

    for entry in entries {
        let key = key_fn(&entry.value);
        match by_key.get(&key) {
            Some(&slot) => {
                let existing = &mut slots[slot];
                existing.multiplicity += entry.multiplicity;
                existing.value = entry.value;
            }
            None => {
                by_key.insert(key, slots.len());
                slots.push(entry);
            }
        }
    }

    slots.retain(|e| e.multiplicity != 0);
    slots
}

/// Expresses a change as multiset entries over nodes. Child changes carry no
/// multiplicity of their own and produce no entries.
#[must_use]
pub fn change_entries(change: &Change) -> Vec<Entry<Node>> {
    match change {
        Change::Add(node) => vec![Entry::new(node.clone(), 1)],
        Change::Remove(node) => vec![Entry::new(node.clone(), -1)],
        Change::Edit { old, new } => vec![Entry::new(old.clone(), -1), Entry::new(new.clone(), 1)],
        Change::Child { .. } => Vec::new(),
    }
}
