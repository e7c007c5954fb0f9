//! Spectrum-to-group assignment.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Detector group identifier. Ids need not be contiguous.
pub type GroupId = i32;

/// Mapping from spectrum number to group id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grouping {
    assignment: BTreeMap<i32, GroupId>,
}

impl Grouping {
    /// Creates an empty grouping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a grouping from `(spectrum number, group id)` pairs.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] if a spectrum is assigned to two
    /// different groups.
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (i32, GroupId)>,
    {
        let mut grouping = Self::new();
        for (spectrum, group) in pairs {
            grouping.assign(spectrum, group)?;
        }
        Ok(grouping)
    }

    /// Assigns one spectrum. Re-assigning to the same group is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] on a conflicting assignment.
    pub fn assign(&mut self, spectrum_number: i32, group: GroupId) -> Result<()> {
        match self.assignment.insert(spectrum_number, group) {
            Some(previous) if previous != group => Err(Error::ConfigError(format!(
                "spectrum {spectrum_number} assigned to groups {previous} and {group}"
            ))),
            _ => Ok(()),
        }
    }

    /// Group of a spectrum.
    #[must_use]
    pub fn group_of(&self, spectrum_number: i32) -> Option<GroupId> {
        self.assignment.get(&spectrum_number).copied()
    }

    /// Distinct group ids in ascending order.
    #[must_use]
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.assignment
            .values()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Spectrum numbers of one group, ascending.
    #[must_use]
    pub fn members(&self, group: GroupId) -> Vec<i32> {
        self.assignment
            .iter()
            .filter(|(_, &g)| g == group)
            .map(|(&s, _)| s)
            .collect()
    }

    /// Number of assigned spectra.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assignment.len()
    }

    /// Returns true if nothing is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignment.is_empty()
    }

    /// `(spectrum number, group id)` pairs in spectrum order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, GroupId)> + '_ {
        self.assignment.iter().map(|(&s, &g)| (s, g))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouping_queries() {
        let grouping = Grouping::from_pairs([(4, 7), (1, 3), (2, 7), (3, 3), (5, 7)]).unwrap();

        assert_eq!(grouping.len(), 5);
        assert_eq!(grouping.group_ids(), vec![3, 7]);
        assert_eq!(grouping.members(7), vec![2, 4, 5]);
        assert_eq!(grouping.members(3), vec![1, 3]);
        assert_eq!(grouping.group_of(4), Some(7));
        assert_eq!(grouping.group_of(9), None);
        assert!(grouping.members(99).is_empty());
    }

    #[test]
    fn test_conflicting_assignment() {
        assert!(Grouping::from_pairs([(1, 1), (1, 1)]).is_ok());
        assert!(Grouping::from_pairs([(1, 1), (1, 2)]).is_err());
    }
}
