//! Reference-counted finalization.
//!
//! A holder may not be finalized while anything still depends on it. The pool
//! registers every avatar as depending on itself when it is created and
//! removes that dependency when the avatar is closed; the removal that empties
//! the set hands finalization back to the caller, which runs it after
//! releasing the pool lock.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

/// Outcome of [`DependencyTracker::remove_dep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a final removal obliges the caller to finalize the holder"]
pub enum Removal {
    /// Other dependencies remain; the holder stays alive.
    Pending,
    /// That was the last dependency: the caller must finalize the holder.
    Final,
}

/// Tracks which dependencies each holder is waiting on.
#[derive(Debug)]
pub struct DependencyTracker<H, D> {
    deps: HashMap<H, HashSet<D>>,
}

impl<H, D> Default for DependencyTracker<H, D> {
    fn default() -> Self {
        Self {
            deps: HashMap::new(),
        }
    }
}

impl<H, D> DependencyTracker<H, D>
where
    H: Eq + Hash + Debug,
    D: Eq + Hash + Debug,
{
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `holder` now depends on `dep`.
    pub fn add_dep(&mut self, holder: H, dep: D) {
        self.deps.entry(holder).or_default().insert(dep);
    }

    /// Note that `holder` no longer depends on `dep`.
    ///
    /// # Panics
    ///
    /// Panics if the removal is not paired with an earlier
    /// [`add_dep`](Self::add_dep).
    pub fn remove_dep(&mut self, holder: &H, dep: &D) -> Removal {
        let Some(set) = self.deps.get_mut(holder) else {
            panic!("unpaired remove_dep: no dependencies for {holder:?}");
        };
        assert!(
            set.remove(dep),
            "unpaired remove_dep: {holder:?} does not depend on {dep:?}"
        );
        if set.is_empty() {
            self.deps.remove(holder);
            Removal::Final
        } else {
            Removal::Pending
        }
    }

    /// Number of holders with outstanding dependencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    /// Whether no holder has outstanding dependencies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}
