//! Resume keys: the full structural description of a resume point.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    bytecode::{ConstArgs, Constant},
    reenter::ReenterWith,
};

/// Structural description of a resume point, used as-is as a cache key.
///
/// Keys are immutable values built with the `with_*` methods:
///
/// ```
/// use resumption::{ReenterWith, ResumeKey};
///
/// let key = ResumeKey::new(24, 2)
///     .with_live_locals(["x"])
///     .with_reentry(ReenterWith::new(1), 40);
/// assert_eq!(key.nstack(), 2);
/// assert_eq!(key.resource_targets(), &[40]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeKey {
    offset: u32,
    nstack: usize,
    live_locals: Vec<String>,
    unbound_locals: Vec<String>,
    reentries: Vec<ReenterWith>,
    /// Handler offset of each re-entered resource, parallel to `reentries`. Only
    /// meaningful on eras with structural exception regions.
    resource_targets: Vec<u32>,
    stack_rebuilds: BTreeMap<usize, ConstArgs>,
    local_rebuilds: BTreeMap<String, ConstArgs>,
    null_slots: BTreeSet<usize>,
}

impl ResumeKey {
    /// Key resuming at byte `offset` with `nstack` stack slots to rehydrate.
    #[must_use]
    pub fn new(offset: u32, nstack: usize) -> Self {
        Self {
            offset,
            nstack,
            live_locals: Vec::new(),
            unbound_locals: Vec::new(),
            reentries: Vec::new(),
            resource_targets: Vec::new(),
            stack_rebuilds: BTreeMap::new(),
            local_rebuilds: BTreeMap::new(),
            null_slots: BTreeSet::new(),
        }
    }

    /// Locals that must be passed in, in parameter order.
    #[must_use]
    pub fn with_live_locals<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.live_locals.extend(names.into_iter().map(Into::into));
        self
    }

    /// Locals that must be explicitly unbound when the continuation starts.
    #[must_use]
    pub fn with_unbound_locals<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unbound_locals.extend(names.into_iter().map(Into::into));
        self
    }

    /// Adds a resource to re-enter whose original handler sits at `target_offset`.
    #[must_use]
    pub fn with_reentry(mut self, reentry: ReenterWith, target_offset: u32) -> Self {
        self.reentries.push(reentry);
        self.resource_targets.push(target_offset);
        self
    }

    /// Adds a resource to re-enter on an era without structural regions, where no
    /// handler offset is tracked.
    #[must_use]
    pub fn with_block_reentry(mut self, reentry: ReenterWith) -> Self {
        self.reentries.push(reentry);
        self
    }

    /// Rebuilds the class at stack position `index` (null sentinels counted) from
    /// literal arguments.
    #[must_use]
    pub fn with_stack_rebuild(mut self, index: usize, args: impl IntoIterator<Item = Constant>) -> Self {
        self.stack_rebuilds.insert(index, args.into_iter().collect());
        self
    }

    /// Rebuilds the class held by local `name` from literal arguments.
    #[must_use]
    pub fn with_local_rebuild(mut self, name: impl Into<String>, args: impl IntoIterator<Item = Constant>) -> Self {
        self.local_rebuilds.insert(name.into(), args.into_iter().collect());
        self
    }

    /// Stack positions (null sentinels counted) that held the null sentinel.
    #[must_use]
    pub fn with_null_slots(mut self, slots: impl IntoIterator<Item = usize>) -> Self {
        self.null_slots.extend(slots);
        self
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    pub fn nstack(&self) -> usize {
        self.nstack
    }

    #[must_use]
    pub fn live_locals(&self) -> &[String] {
        &self.live_locals
    }

    #[must_use]
    pub fn unbound_locals(&self) -> &[String] {
        &self.unbound_locals
    }

    #[must_use]
    pub fn reentries(&self) -> &[ReenterWith] {
        &self.reentries
    }

    #[must_use]
    pub fn resource_targets(&self) -> &[u32] {
        &self.resource_targets
    }

    #[must_use]
    pub fn stack_rebuilds(&self) -> &BTreeMap<usize, ConstArgs> {
        &self.stack_rebuilds
    }

    #[must_use]
    pub fn local_rebuilds(&self) -> &BTreeMap<String, ConstArgs> {
        &self.local_rebuilds
    }

    #[must_use]
    pub fn null_slots(&self) -> &BTreeSet<usize> {
        &self.null_slots
    }

    /// The same key expressed in another unit's offsets.
    pub(crate) fn relocated(&self, offset: u32, resource_targets: Vec<u32>) -> Self {
        Self {
            offset,
            resource_targets,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn keys_compare_structurally() {
        let a = ResumeKey::new(10, 1).with_live_locals(["x"]).with_null_slots([0]);
        let b = ResumeKey::new(10, 1).with_null_slots([0]).with_live_locals(["x"]);
        assert_eq!(a, b);
        let set: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(a, ResumeKey::new(12, 1).with_live_locals(["x"]).with_null_slots([0]));
    }

    #[test]
    fn relocation_keeps_everything_else() {
        let key = ResumeKey::new(10, 2)
            .with_live_locals(["y"])
            .with_reentry(ReenterWith::new(0), 30);
        let moved = key.relocated(4, vec![18]);
        assert_eq!(moved.offset(), 4);
        assert_eq!(moved.resource_targets(), &[18]);
        assert_eq!(moved.live_locals(), key.live_locals());
        assert_eq!(moved.reentries(), key.reentries());
    }
}
