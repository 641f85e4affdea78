//! Success/Failure Class Sets
//!
//! The two mutually exclusive persisted collections of class outcomes, keyed
//! by volume group name. All membership changes go through [`ClassSets::put`]
//! or [`ClassSets::remove`], so a class can never appear in both sets — the
//! exclusivity invariant is enforced structurally instead of at call sites.

use crate::state::status::{ClassState, NodeStorageState};
use indexmap::IndexMap;

/// Which collection a class outcome belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Keyed success/failure bookkeeping for one node
#[derive(Debug, Clone, Default)]
pub struct ClassSets {
    success: IndexMap<String, ClassState>,
    failure: IndexMap<String, ClassState>,
}

impl ClassSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the sets from a previously persisted status document
    pub fn from_state(state: &NodeStorageState) -> Self {
        let mut sets = Self::new();
        for class in &state.success_classes {
            sets.put(Outcome::Success, class.clone());
        }
        for class in &state.fail_classes {
            sets.put(Outcome::Failure, class.clone());
        }
        sets
    }

    /// Insert or move a class into the given set.
    ///
    /// The vg name is removed from the other set first; this is the single
    /// move-between-sets operation.
    pub fn put(&mut self, outcome: Outcome, class: ClassState) {
        match outcome {
            Outcome::Success => {
                self.failure.shift_remove(&class.vg_name);
                self.success.insert(class.vg_name.clone(), class);
            }
            Outcome::Failure => {
                self.success.shift_remove(&class.vg_name);
                self.failure.insert(class.vg_name.clone(), class);
            }
        }
    }

    /// Drop a class from whichever set holds it
    pub fn remove(&mut self, vg_name: &str) -> Option<ClassState> {
        self.success
            .shift_remove(vg_name)
            .or_else(|| self.failure.shift_remove(vg_name))
    }

    /// Where this vg name currently lives, if anywhere
    pub fn outcome_of(&self, vg_name: &str) -> Option<Outcome> {
        if self.success.contains_key(vg_name) {
            Some(Outcome::Success)
        } else if self.failure.contains_key(vg_name) {
            Some(Outcome::Failure)
        } else {
            None
        }
    }

    pub fn get(&self, vg_name: &str) -> Option<&ClassState> {
        self.success
            .get(vg_name)
            .or_else(|| self.failure.get(vg_name))
    }

    pub fn get_mut(&mut self, vg_name: &str) -> Option<&mut ClassState> {
        if let Some(class) = self.success.get_mut(vg_name) {
            return Some(class);
        }
        self.failure.get_mut(vg_name)
    }

    /// All vg names across both sets, in insertion order
    pub fn vg_names(&self) -> Vec<String> {
        self.success
            .keys()
            .chain(self.failure.keys())
            .cloned()
            .collect()
    }

    pub fn successes(&self) -> impl Iterator<Item = &ClassState> {
        self.success.values()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ClassState> {
        self.failure.values()
    }

    pub fn failure_count(&self) -> usize {
        self.failure.len()
    }

    /// Write both collections back into a status document
    pub fn apply_to(&self, state: &mut NodeStorageState) {
        state.success_classes = self.success.values().cloned().collect();
        state.fail_classes = self.failure.values().cloned().collect();
    }
}
