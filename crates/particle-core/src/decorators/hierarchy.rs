use super::{Decorator, DecoratorError};
use crate::core::attributes::{AttributeError, AttributeStore};
use crate::core::ids::ParticleIndex;
use crate::core::keys::{ParticleKey, ParticlesKey};
use crate::static_key;

/// A node of a particle tree.
///
/// Children are stored on the parent as a particle list. The parent link on each child is a
/// weak back-reference: it is only followed after checking that the parent is still alive
/// and still a hierarchy node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hierarchy(ParticleIndex);

impl Hierarchy {
    pub fn parent_key() -> ParticleKey {
        static_key!(ParticleKey, "hierarchy_parent")
    }

    pub fn children_key() -> ParticlesKey {
        static_key!(ParticlesKey, "hierarchy_children")
    }

    pub fn setup_particle(
        store: &mut AttributeStore,
        particle: ParticleIndex,
    ) -> Result<Self, DecoratorError> {
        if !store.has_attribute(Self::children_key(), particle) {
            store.add_attribute(Self::children_key(), particle, Vec::new())?;
        }
        Ok(Self(particle))
    }

    /// Appends `child` to this node's children.
    ///
    /// # Errors
    ///
    /// Fails with [`DecoratorError::WouldCreateCycle`] if `child` is this node or one of its
    /// ancestors, and with [`DecoratorError::AlreadyHasParent`] if `child` is attached to
    /// another live node. A link to a removed parent is replaced.
    pub fn add_child(&self, store: &mut AttributeStore, child: Hierarchy) -> Result<(), DecoratorError> {
        let mut ancestor = Some(*self);
        while let Some(node) = ancestor {
            if node == child {
                return Err(DecoratorError::WouldCreateCycle {
                    parent: self.0,
                    child: child.0,
                });
            }
            ancestor = node.parent(store)?;
        }
        if child.parent(store)?.is_some() {
            return Err(DecoratorError::AlreadyHasParent(child.0));
        }
        let mut children = store.get_attribute(Self::children_key(), self.0)?;
        children.push(child.0);
        store.set_attribute(Self::children_key(), self.0, children)?;

        let parent_key = Self::parent_key();
        if store.has_attribute(parent_key, child.0) {
            store.set_attribute(parent_key, child.0, self.0)?;
        } else {
            store.add_attribute(parent_key, child.0, self.0)?;
        }
        Ok(())
    }

    pub fn remove_child(&self, store: &mut AttributeStore, child: Hierarchy) -> Result<(), DecoratorError> {
        let mut children = store.get_attribute(Self::children_key(), self.0)?;
        let Some(position) = children.iter().position(|&p| p == child.0) else {
            return Err(DecoratorError::NotAChild {
                parent: self.0,
                child: child.0,
            });
        };
        children.remove(position);
        store.set_attribute(Self::children_key(), self.0, children)?;
        if store.has_attribute(Self::parent_key(), child.0) {
            store.remove_attribute(Self::parent_key(), child.0)?;
        }
        Ok(())
    }

    /// Live children in insertion order.
    pub fn children(&self, store: &AttributeStore) -> Result<Vec<Hierarchy>, AttributeError> {
        Ok(store
            .attribute_ref(Self::children_key(), self.0)?
            .iter()
            .filter(|&&child| store.is_live(child))
            .map(|&child| Hierarchy(child))
            .collect())
    }

    pub fn number_of_children(&self, store: &AttributeStore) -> Result<usize, AttributeError> {
        Ok(self.children(store)?.len())
    }

    /// The parent node, or `None` for a root or when the recorded parent no longer exists.
    pub fn parent(&self, store: &AttributeStore) -> Result<Option<Hierarchy>, AttributeError> {
        if !store.has_attribute(Self::parent_key(), self.0) {
            return Ok(None);
        }
        let parent = store.get_attribute(Self::parent_key(), self.0)?;
        if Self::particle_is_instance(store, parent) {
            Ok(Some(Hierarchy(parent)))
        } else {
            Ok(None)
        }
    }

    /// Every leaf below this node in depth-first order; a childless node is its own leaf.
    pub fn leaves(&self, store: &AttributeStore) -> Result<Vec<ParticleIndex>, AttributeError> {
        let mut leaves = Vec::new();
        let mut pending = vec![*self];
        while let Some(node) = pending.pop() {
            let children = node.children(store)?;
            if children.is_empty() {
                leaves.push(node.0);
            } else {
                pending.extend(children.into_iter().rev());
            }
        }
        Ok(leaves)
    }
}

impl Decorator for Hierarchy {
    const NAME: &'static str = "Hierarchy";

    fn particle_is_instance(store: &AttributeStore, particle: ParticleIndex) -> bool {
        store.has_attribute(Self::children_key(), particle)
    }

    fn particle_index(&self) -> ParticleIndex {
        self.0
    }

    fn wrap(particle: ParticleIndex) -> Self {
        Self(particle)
    }
}
