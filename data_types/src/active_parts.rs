//! An ordered set of non-overlapping parts with covering-part resolution.

use crate::{PartName, PartNameError};
use std::collections::BTreeSet;
use std::ops::Bound;

/// A canonical set of parts in which no two members overlap.
///
/// Adding a part erases every member it covers; adding a part that is itself
/// covered by a member is a no-op. The same structure backs both the concrete
/// on-disk part set and the virtual set (present parts plus parts whose
/// creation is planned by the queue).
#[derive(Debug, Default, Clone)]
pub struct ActivePartSet {
    parts: BTreeSet<PartName>,
}

impl ActivePartSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the part named `name`.
    pub fn add(&mut self, name: &str) -> Result<(), PartNameError> {
        self.add_part(name.parse()?);
        Ok(())
    }

    /// Insert `part`, erasing members it supersedes. No-op if a member
    /// already covers `part`.
    pub fn add_part(&mut self, part: PartName) {
        if self.containing_member(&part).is_some() {
            return;
        }

        // Members covered by `part` all have min_block within its range, so
        // a single forward scan from the lower bound finds them.
        let scan_from = PartName {
            partition_id: part.partition_id.clone(),
            min_block: part.min_block,
            max_block: i64::MIN,
            level: 0,
        };
        let superseded: Vec<PartName> = self
            .parts
            .range((Bound::Included(&scan_from), Bound::Unbounded))
            .take_while(|m| {
                m.partition_id == part.partition_id && m.min_block <= part.max_block
            })
            .filter(|m| part.contains(m))
            .cloned()
            .collect();

        for m in &superseded {
            self.parts.remove(m);
        }
        self.parts.insert(part);
    }

    /// The name of the member covering `name`, or `name` itself if no member
    /// does.
    pub fn get_containing_part(&self, name: &str) -> Result<String, PartNameError> {
        let probe: PartName = name.parse()?;
        Ok(self
            .containing_member(&probe)
            .map(|m| m.to_string())
            .unwrap_or_else(|| name.to_owned()))
    }

    /// Pure containment predicate on part names.
    pub fn contains(outer: &str, inner: &str) -> Result<bool, PartNameError> {
        let outer: PartName = outer.parse()?;
        let inner: PartName = inner.parse()?;
        Ok(outer.contains(&inner))
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Because members never overlap, the only candidates that can cover
    /// `probe` are its two order-neighbors.
    fn containing_member(&self, probe: &PartName) -> Option<&PartName> {
        if let Some(m) = self
            .parts
            .range((Bound::Included(probe), Bound::Unbounded))
            .next()
        {
            if m.contains(probe) {
                return Some(m);
            }
        }
        if let Some(m) = self
            .parts
            .range((Bound::Unbounded, Bound::Excluded(probe)))
            .next_back()
        {
            if m.contains(probe) {
                return Some(m);
            }
        }
        None
    }
}
