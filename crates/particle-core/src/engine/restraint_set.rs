use slotmap::SlotMap;
use thiserror::Error;

use crate::core::ids::{RestraintId, RestraintSetId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RestraintSetError {
    #[error("Restraint set {0:?} does not exist")]
    UnknownSet(RestraintSetId),

    #[error("Restraint {restraint:?} is already a member of set '{set}'")]
    AlreadyMember { set: String, restraint: RestraintId },

    #[error("Restraint {restraint:?} is not a member of set '{set}'")]
    NotAMember { set: String, restraint: RestraintId },

    #[error("The root restraint set cannot be removed")]
    RootRemoval,

    #[error("Restraint set weight must be finite and non-negative, got {0}")]
    InvalidWeight(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMember {
    Restraint(RestraintId),
    Set(RestraintSetId),
}

/// A named, weighted group of restraints and nested sets.
#[derive(Debug, Clone)]
pub struct RestraintSet {
    name: String,
    weight: f64,
    parent: Option<RestraintSetId>,
    members: Vec<SetMember>,
}

impl RestraintSet {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn parent(&self) -> Option<RestraintSetId> {
        self.parent
    }

    pub fn members(&self) -> &[SetMember] {
        &self.members
    }
}

/// The tree of restraint sets hanging off a model's root set.
///
/// Sets are only ever created as children of an existing set, so the structure is always a
/// tree. A restraint may belong to several sets; it is scored once per membership.
#[derive(Debug, Clone)]
pub(crate) struct RestraintTree {
    sets: SlotMap<RestraintSetId, RestraintSet>,
    root: RestraintSetId,
}

impl RestraintTree {
    pub fn new() -> Self {
        let mut sets = SlotMap::with_key();
        let root = sets.insert(RestraintSet {
            name: "root".to_string(),
            weight: 1.0,
            parent: None,
            members: Vec::new(),
        });
        Self { sets, root }
    }

    pub fn root(&self) -> RestraintSetId {
        self.root
    }

    pub fn get(&self, set: RestraintSetId) -> Result<&RestraintSet, RestraintSetError> {
        self.sets.get(set).ok_or(RestraintSetError::UnknownSet(set))
    }

    fn get_mut(&mut self, set: RestraintSetId) -> Result<&mut RestraintSet, RestraintSetError> {
        self.sets.get_mut(set).ok_or(RestraintSetError::UnknownSet(set))
    }

    pub fn create(
        &mut self,
        parent: RestraintSetId,
        name: String,
        weight: f64,
    ) -> Result<RestraintSetId, RestraintSetError> {
        check_weight(weight)?;
        self.get(parent)?;
        let set = self.sets.insert(RestraintSet {
            name,
            weight,
            parent: Some(parent),
            members: Vec::new(),
        });
        self.get_mut(parent)?.members.push(SetMember::Set(set));
        Ok(set)
    }

    pub fn set_weight(&mut self, set: RestraintSetId, weight: f64) -> Result<(), RestraintSetError> {
        check_weight(weight)?;
        self.get_mut(set)?.weight = weight;
        Ok(())
    }

    pub fn add_restraint(
        &mut self,
        set: RestraintSetId,
        restraint: RestraintId,
    ) -> Result<(), RestraintSetError> {
        let entry = self.get_mut(set)?;
        if entry.members.contains(&SetMember::Restraint(restraint)) {
            return Err(RestraintSetError::AlreadyMember {
                set: entry.name.clone(),
                restraint,
            });
        }
        entry.members.push(SetMember::Restraint(restraint));
        Ok(())
    }

    /// Appends a restraint that is not yet a member of any set to the root.
    pub fn push_to_root(&mut self, restraint: RestraintId) {
        if let Some(root) = self.sets.get_mut(self.root) {
            root.members.push(SetMember::Restraint(restraint));
        }
    }

    pub fn remove_restraint(
        &mut self,
        set: RestraintSetId,
        restraint: RestraintId,
    ) -> Result<(), RestraintSetError> {
        let entry = self.get_mut(set)?;
        let before = entry.members.len();
        entry
            .members
            .retain(|member| *member != SetMember::Restraint(restraint));
        if entry.members.len() == before {
            return Err(RestraintSetError::NotAMember {
                set: entry.name.clone(),
                restraint,
            });
        }
        Ok(())
    }

    /// Sets that directly contain `restraint`.
    pub fn sets_containing(&self, restraint: RestraintId) -> Vec<RestraintSetId> {
        self.sets
            .iter()
            .filter(|(_, set)| set.members.contains(&SetMember::Restraint(restraint)))
            .map(|(id, _)| id)
            .collect()
    }

    /// Detaches a set and its whole subtree, returning every restraint membership dropped.
    pub fn remove_set(&mut self, set: RestraintSetId) -> Result<Vec<RestraintId>, RestraintSetError> {
        if set == self.root {
            return Err(RestraintSetError::RootRemoval);
        }
        let parent = self.get(set)?.parent;
        if let Some(parent) = parent {
            self.get_mut(parent)?
                .members
                .retain(|member| *member != SetMember::Set(set));
        }

        let mut released = Vec::new();
        let mut pending = vec![set];
        while let Some(current) = pending.pop() {
            if let Some(removed) = self.sets.remove(current) {
                for member in removed.members {
                    match member {
                        SetMember::Restraint(restraint) => released.push(restraint),
                        SetMember::Set(child) => pending.push(child),
                    }
                }
            }
        }
        Ok(released)
    }

    /// Every restraint reachable from the root with the product of the weights on its path,
    /// in depth-first member order. Zero-weight entries are left out.
    pub fn flatten(&self) -> Vec<(RestraintId, f64)> {
        let mut flat = Vec::new();
        self.flatten_into(self.root, 1.0, &mut flat);
        flat
    }

    fn flatten_into(&self, set: RestraintSetId, weight: f64, flat: &mut Vec<(RestraintId, f64)>) {
        let Some(entry) = self.sets.get(set) else {
            return;
        };
        let weight = weight * entry.weight;
        if weight == 0.0 {
            return;
        }
        for member in &entry.members {
            match *member {
                SetMember::Restraint(restraint) => flat.push((restraint, weight)),
                SetMember::Set(child) => self.flatten_into(child, weight, flat),
            }
        }
    }
}

fn check_weight(weight: f64) -> Result<(), RestraintSetError> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(RestraintSetError::InvalidWeight(weight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restraint_ids(n: usize) -> Vec<RestraintId> {
        let mut ids: SlotMap<RestraintId, ()> = SlotMap::with_key();
        (0..n).map(|_| ids.insert(())).collect()
    }

    #[test]
    fn weights_multiply_down_the_tree() {
        let r = restraint_ids(3);
        let mut tree = RestraintTree::new();
        let root = tree.root();
        tree.add_restraint(root, r[0]).unwrap();
        let outer = tree.create(root, "outer".into(), 2.0).unwrap();
        tree.add_restraint(outer, r[1]).unwrap();
        let inner = tree.create(outer, "inner".into(), 0.25).unwrap();
        tree.add_restraint(inner, r[2]).unwrap();

        assert_eq!(tree.flatten(), vec![(r[0], 1.0), (r[1], 2.0), (r[2], 0.5)]);
    }

    #[test]
    fn zero_weight_sets_are_skipped() {
        let r = restraint_ids(2);
        let mut tree = RestraintTree::new();
        let root = tree.root();
        tree.add_restraint(root, r[0]).unwrap();
        let muted = tree.create(root, "muted".into(), 1.0).unwrap();
        tree.add_restraint(muted, r[1]).unwrap();
        tree.set_weight(muted, 0.0).unwrap();
        assert_eq!(tree.flatten(), vec![(r[0], 1.0)]);
    }

    #[test]
    fn membership_is_checked() {
        let r = restraint_ids(1);
        let mut tree = RestraintTree::new();
        let root = tree.root();
        tree.add_restraint(root, r[0]).unwrap();
        assert!(matches!(
            tree.add_restraint(root, r[0]),
            Err(RestraintSetError::AlreadyMember { .. })
        ));
        tree.remove_restraint(root, r[0]).unwrap();
        assert!(matches!(
            tree.remove_restraint(root, r[0]),
            Err(RestraintSetError::NotAMember { .. })
        ));
    }

    #[test]
    fn removing_a_set_releases_its_subtree() {
        let r = restraint_ids(2);
        let mut tree = RestraintTree::new();
        let root = tree.root();
        let outer = tree.create(root, "outer".into(), 1.0).unwrap();
        let inner = tree.create(outer, "inner".into(), 1.0).unwrap();
        tree.add_restraint(outer, r[0]).unwrap();
        tree.add_restraint(inner, r[1]).unwrap();

        let mut released = tree.remove_set(outer).unwrap();
        released.sort();
        let mut expected = r.clone();
        expected.sort();
        assert_eq!(released, expected);
        assert!(tree.flatten().is_empty());
        assert!(tree.get(inner).is_err());
        assert_eq!(tree.remove_set(root), Err(RestraintSetError::RootRemoval));
    }

    #[test]
    fn invalid_weights_are_rejected() {
        let mut tree = RestraintTree::new();
        let root = tree.root();
        assert!(tree.create(root, "bad".into(), -1.0).is_err());
        assert!(tree.set_weight(root, f64::NAN).is_err());
    }

    #[test]
    fn sets_containing_finds_every_membership() {
        let r = restraint_ids(1);
        let mut tree = RestraintTree::new();
        let root = tree.root();
        let other = tree.create(root, "other".into(), 1.0).unwrap();
        tree.add_restraint(root, r[0]).unwrap();
        tree.add_restraint(other, r[0]).unwrap();
        let sets = tree.sets_containing(r[0]);
        assert_eq!(sets.len(), 2);
        assert!(sets.contains(&root) && sets.contains(&other));
    }
}
