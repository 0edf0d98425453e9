use slotmap::{SecondaryMap, SlotMap};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use thiserror::Error;

use super::ids::{ContainerId, ParticleIndex};
use super::keys::{
    AnyKey, AttributeType, FloatKey, FloatType, FloatsType, IntType, IntsType, Key, ObjectType,
    ObjectsType, ParticleType, ParticlesType, StringType, StringsType,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AttributeError {
    #[error("Particle {particle:?} has no {key}")]
    MissingAttribute { key: AnyKey, particle: ParticleIndex },

    #[error("Particle {particle:?} already has {key}")]
    DuplicateAttribute { key: AnyKey, particle: ParticleIndex },

    #[error("Particle index {0:?} does not refer to a live particle")]
    InvalidParticle(ParticleIndex),

    #[error("Container {0:?} does not exist")]
    UnknownContainer(ContainerId),

    #[error("Read of {key} on particle {particle:?} is outside the declared dependencies")]
    ReadLocked { key: AnyKey, particle: ParticleIndex },

    #[error("Write of {key} on particle {particle:?} is outside the declared outputs")]
    WriteLocked { key: AnyKey, particle: ParticleIndex },

    #[error("Container {0:?} is not a declared output")]
    ContainerLocked(ContainerId),
}

/// A shared, type-erased reference to an arbitrary object stored as an attribute.
///
/// Cloning shares the referent. Two references are equal when they point to the same object.
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn Any + Send + Sync>);

impl ObjectRef {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Columnar storage for one value category: one column per key index.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeTable<V> {
    columns: Vec<SecondaryMap<ParticleIndex, V>>,
}

impl<V> Default for AttributeTable<V> {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
        }
    }
}

impl<V> AttributeTable<V> {
    pub fn get(&self, key: usize, particle: ParticleIndex) -> Option<&V> {
        self.columns.get(key).and_then(|column| column.get(particle))
    }

    pub fn get_mut(&mut self, key: usize, particle: ParticleIndex) -> Option<&mut V> {
        self.columns
            .get_mut(key)
            .and_then(|column| column.get_mut(particle))
    }

    pub fn contains(&self, key: usize, particle: ParticleIndex) -> bool {
        self.get(key, particle).is_some()
    }

    /// Inserts or replaces a value, growing the column list if this key was never used.
    pub fn insert(&mut self, key: usize, particle: ParticleIndex, value: V) -> Option<V> {
        if key >= self.columns.len() {
            self.columns.resize_with(key + 1, SecondaryMap::new);
        }
        self.columns[key].insert(particle, value)
    }

    pub fn remove(&mut self, key: usize, particle: ParticleIndex) -> Option<V> {
        self.columns
            .get_mut(key)
            .and_then(|column| column.remove(particle))
    }

    /// Key indices with a value for `particle`, in ascending order.
    pub fn keys_of(&self, particle: ParticleIndex) -> impl Iterator<Item = usize> + '_ {
        self.columns
            .iter()
            .enumerate()
            .filter(move |(_, column)| column.contains_key(particle))
            .map(|(key, _)| key)
    }

    pub fn column(&self, key: usize) -> impl Iterator<Item = (ParticleIndex, &V)> + '_ {
        self.columns.get(key).into_iter().flat_map(|column| column.iter())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, ParticleIndex, &V)> + '_ {
        self.columns
            .iter()
            .enumerate()
            .flat_map(|(key, column)| column.iter().map(move |(p, v)| (key, p, v)))
    }

    pub fn clear_particle(&mut self, particle: ParticleIndex) {
        for column in &mut self.columns {
            column.remove(particle);
        }
    }

    pub fn retain_particles(&mut self, mut keep: impl FnMut(ParticleIndex) -> bool) {
        for column in &mut self.columns {
            column.retain(|particle, _| keep(particle));
        }
    }

    pub fn clear(&mut self) {
        self.columns.clear();
    }

    /// Copies every value `source` holds for `particle` into this table.
    pub fn copy_particle(&mut self, source: &Self, particle: ParticleIndex)
    where
        V: Clone,
    {
        for (key, column) in source.columns.iter().enumerate() {
            if let Some(value) = column.get(particle) {
                self.insert(key, particle, value.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.columns.iter().map(|column| column.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Explicit bounds for a float attribute, used by optimizers that need a search interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatRange {
    pub lower: f64,
    pub upper: f64,
}

/// Every attribute column of a store, across all categories.
///
/// This is the unit that a [`Configuration`](crate::engine::Configuration) snapshots: cloning
/// it is a value-level deep copy (object attributes keep pointing at the same shared objects).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeColumns {
    pub(crate) floats: AttributeTable<f64>,
    pub(crate) ints: AttributeTable<i64>,
    pub(crate) strings: AttributeTable<String>,
    pub(crate) particles: AttributeTable<ParticleIndex>,
    pub(crate) objects: AttributeTable<ObjectRef>,
    pub(crate) float_lists: AttributeTable<Vec<f64>>,
    pub(crate) int_lists: AttributeTable<Vec<i64>>,
    pub(crate) string_lists: AttributeTable<Vec<String>>,
    pub(crate) particle_lists: AttributeTable<Vec<ParticleIndex>>,
    pub(crate) object_lists: AttributeTable<Vec<ObjectRef>>,
    pub(crate) optimized: AttributeTable<bool>,
    pub(crate) ranges: BTreeMap<usize, FloatRange>,
}

impl AttributeColumns {
    /// Number of stored values across every category.
    pub(crate) fn len(&self) -> usize {
        self.floats.len()
            + self.ints.len()
            + self.strings.len()
            + self.particles.len()
            + self.objects.len()
            + self.float_lists.len()
            + self.int_lists.len()
            + self.string_lists.len()
            + self.particle_lists.len()
            + self.object_lists.len()
    }

    pub(crate) fn clear_particle(&mut self, particle: ParticleIndex) {
        self.retain_particles(|p| p != particle);
    }

    pub(crate) fn copy_particle(&mut self, source: &Self, particle: ParticleIndex) {
        self.floats.copy_particle(&source.floats, particle);
        self.ints.copy_particle(&source.ints, particle);
        self.strings.copy_particle(&source.strings, particle);
        self.particles.copy_particle(&source.particles, particle);
        self.objects.copy_particle(&source.objects, particle);
        self.float_lists.copy_particle(&source.float_lists, particle);
        self.int_lists.copy_particle(&source.int_lists, particle);
        self.string_lists.copy_particle(&source.string_lists, particle);
        self.particle_lists.copy_particle(&source.particle_lists, particle);
        self.object_lists.copy_particle(&source.object_lists, particle);
        self.optimized.copy_particle(&source.optimized, particle);
    }

    pub(crate) fn retain_particles(&mut self, mut keep: impl FnMut(ParticleIndex) -> bool) {
        self.floats.retain_particles(&mut keep);
        self.ints.retain_particles(&mut keep);
        self.strings.retain_particles(&mut keep);
        self.particles.retain_particles(&mut keep);
        self.objects.retain_particles(&mut keep);
        self.float_lists.retain_particles(&mut keep);
        self.int_lists.retain_particles(&mut keep);
        self.string_lists.retain_particles(&mut keep);
        self.particle_lists.retain_particles(&mut keep);
        self.object_lists.retain_particles(&mut keep);
        self.optimized.retain_particles(&mut keep);
    }
}

/// The particles whose attributes changed since the last incremental evaluation, with a copy
/// of each one's attributes as they were before its first change.
///
/// A full change set stands for "everything may have changed": incremental restraints must
/// rescore from scratch and no earlier values are available.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    full: bool,
    changed: Vec<ParticleIndex>,
    seen: HashSet<ParticleIndex>,
    prechange: AttributeColumns,
}

impl ChangeSet {
    pub(crate) fn full() -> Self {
        Self {
            full: true,
            ..Self::default()
        }
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Changed particles in the order of their first change.
    pub fn particles(&self) -> &[ParticleIndex] {
        &self.changed
    }

    pub fn is_changed(&self, particle: ParticleIndex) -> bool {
        self.full || self.seen.contains(&particle)
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.changed.is_empty()
    }

    /// The value `particle` carried for `key` at the last incremental evaluation.
    ///
    /// Unchanged particles, and every particle of a full change set, read the current value
    /// from `store`.
    ///
    /// # Errors
    ///
    /// Fails with [`AttributeError::MissingAttribute`] if a changed particle did not carry
    /// `key` back then.
    pub fn get_prechange_attribute<T: AttributeType>(
        &self,
        store: &AttributeStore,
        key: Key<T>,
        particle: ParticleIndex,
    ) -> Result<T::Value, AttributeError> {
        if self.full || !self.seen.contains(&particle) {
            return store.get_attribute(key, particle);
        }
        T::table(&self.prechange)
            .get(key.index(), particle)
            .cloned()
            .ok_or(AttributeError::MissingAttribute {
                key: key.erase(),
                particle,
            })
    }

    fn record(&mut self, columns: &AttributeColumns, particle: ParticleIndex) {
        if self.seen.insert(particle) {
            self.changed.push(particle);
            self.prechange.copy_particle(columns, particle);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticleInfo {
    pub name: String,
}

/// A named, ordered group of particles that objects can declare as a single dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub particles: Vec<ParticleIndex>,
}

/// The particles and containers one model object may touch during its scheduled turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessLocks {
    pub readable: HashSet<ParticleIndex>,
    pub writable: HashSet<ParticleIndex>,
    pub writable_containers: HashSet<ContainerId>,
}

/// The single home of simulation state.
///
/// Owns the set of live particles, every attribute column, and the particle containers.
/// Plugins read and write attributes exclusively through this type. While an object is being
/// validated, the store carries its [`AccessLocks`] and rejects accesses outside them.
#[derive(Debug, Default)]
pub struct AttributeStore {
    particles: SlotMap<ParticleIndex, ParticleInfo>,
    containers: SlotMap<ContainerId, Container>,
    columns: AttributeColumns,
    locks: Option<AccessLocks>,
    /// Bumped whenever container membership changes.
    container_generation: u64,
    changes: Option<ChangeSet>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Particles ---

    pub(crate) fn add_particle(&mut self, name: String) -> ParticleIndex {
        self.particles.insert(ParticleInfo { name })
    }

    pub(crate) fn remove_particle(
        &mut self,
        particle: ParticleIndex,
    ) -> Result<ParticleInfo, AttributeError> {
        let info = self
            .particles
            .remove(particle)
            .ok_or(AttributeError::InvalidParticle(particle))?;
        self.columns.clear_particle(particle);
        for container in self.containers.values_mut() {
            container.particles.retain(|&p| p != particle);
        }
        self.container_generation += 1;
        Ok(info)
    }

    pub fn is_live(&self, particle: ParticleIndex) -> bool {
        self.particles.contains_key(particle)
    }

    pub fn particle_name(&self, particle: ParticleIndex) -> Result<&str, AttributeError> {
        self.particles
            .get(particle)
            .map(|info| info.name.as_str())
            .ok_or(AttributeError::InvalidParticle(particle))
    }

    pub fn set_particle_name(
        &mut self,
        particle: ParticleIndex,
        name: impl Into<String>,
    ) -> Result<(), AttributeError> {
        let info = self
            .particles
            .get_mut(particle)
            .ok_or(AttributeError::InvalidParticle(particle))?;
        info.name = name.into();
        Ok(())
    }

    /// Live particles in slot order.
    pub fn particles(&self) -> impl Iterator<Item = ParticleIndex> + '_ {
        self.particles.keys()
    }

    pub fn number_of_particles(&self) -> usize {
        self.particles.len()
    }

    fn check_live(&self, particle: ParticleIndex) -> Result<(), AttributeError> {
        if self.particles.contains_key(particle) {
            Ok(())
        } else {
            Err(AttributeError::InvalidParticle(particle))
        }
    }

    fn check_read(&self, key: AnyKey, particle: ParticleIndex) -> Result<(), AttributeError> {
        self.check_live(particle)?;
        match &self.locks {
            Some(locks) if !locks.readable.contains(&particle) => {
                Err(AttributeError::ReadLocked { key, particle })
            }
            _ => Ok(()),
        }
    }

    fn check_write(&self, key: AnyKey, particle: ParticleIndex) -> Result<(), AttributeError> {
        self.check_live(particle)?;
        match &self.locks {
            Some(locks) if !locks.writable.contains(&particle) => {
                Err(AttributeError::WriteLocked { key, particle })
            }
            _ => Ok(()),
        }
    }

    // --- Typed attribute access ---

    /// Adds a new attribute value.
    ///
    /// # Errors
    ///
    /// Returns [`AttributeError::DuplicateAttribute`] if the particle already carries `key`;
    /// use [`set_attribute`](Self::set_attribute) to change an existing value.
    pub fn add_attribute<T: AttributeType>(
        &mut self,
        key: Key<T>,
        particle: ParticleIndex,
        value: T::Value,
    ) -> Result<(), AttributeError> {
        self.check_write(key.erase(), particle)?;
        if T::table(&self.columns).contains(key.index(), particle) {
            return Err(AttributeError::DuplicateAttribute {
                key: key.erase(),
                particle,
            });
        }
        self.note_change(particle);
        T::table_mut(&mut self.columns).insert(key.index(), particle, value);
        Ok(())
    }

    pub fn get_attribute<T: AttributeType>(
        &self,
        key: Key<T>,
        particle: ParticleIndex,
    ) -> Result<T::Value, AttributeError> {
        self.attribute_ref(key, particle).cloned()
    }

    /// Borrows an attribute value without cloning it.
    pub fn attribute_ref<T: AttributeType>(
        &self,
        key: Key<T>,
        particle: ParticleIndex,
    ) -> Result<&T::Value, AttributeError> {
        self.check_read(key.erase(), particle)?;
        T::table(&self.columns)
            .get(key.index(), particle)
            .ok_or(AttributeError::MissingAttribute {
                key: key.erase(),
                particle,
            })
    }

    pub fn set_attribute<T: AttributeType>(
        &mut self,
        key: Key<T>,
        particle: ParticleIndex,
        value: T::Value,
    ) -> Result<(), AttributeError> {
        self.check_write(key.erase(), particle)?;
        if !T::table(&self.columns).contains(key.index(), particle) {
            return Err(AttributeError::MissingAttribute {
                key: key.erase(),
                particle,
            });
        }
        self.note_change(particle);
        let slot = T::table_mut(&mut self.columns)
            .get_mut(key.index(), particle)
            .ok_or(AttributeError::MissingAttribute {
                key: key.erase(),
                particle,
            })?;
        *slot = value;
        Ok(())
    }

    pub fn remove_attribute<T: AttributeType>(
        &mut self,
        key: Key<T>,
        particle: ParticleIndex,
    ) -> Result<T::Value, AttributeError> {
        self.check_write(key.erase(), particle)?;
        if !T::table(&self.columns).contains(key.index(), particle) {
            return Err(AttributeError::MissingAttribute {
                key: key.erase(),
                particle,
            });
        }
        self.note_change(particle);
        let removed = T::table_mut(&mut self.columns)
            .remove(key.index(), particle)
            .ok_or(AttributeError::MissingAttribute {
                key: key.erase(),
                particle,
            })?;
        if T::CATEGORY == FloatType::CATEGORY {
            self.columns.optimized.remove(key.index(), particle);
        }
        Ok(removed)
    }

    /// `false` for dead particles as well as for particles lacking the attribute.
    pub fn has_attribute<T: AttributeType>(&self, key: Key<T>, particle: ParticleIndex) -> bool {
        self.is_live(particle) && T::table(&self.columns).contains(key.index(), particle)
    }

    /// Keys of this category that `particle` carries, in key index order.
    pub fn attribute_keys<T: AttributeType>(&self, particle: ParticleIndex) -> Vec<Key<T>> {
        T::table(&self.columns)
            .keys_of(particle)
            .map(|index| Key::from_raw(index as u32))
            .collect()
    }

    /// Live particles carrying `key`, in slot order.
    pub fn particles_with<T: AttributeType>(&self, key: Key<T>) -> Vec<ParticleIndex> {
        T::table(&self.columns)
            .column(key.index())
            .map(|(particle, _)| particle)
            .collect()
    }

    // --- Float extras: optimization flags and ranges ---

    pub fn set_is_optimized(
        &mut self,
        key: FloatKey,
        particle: ParticleIndex,
        optimized: bool,
    ) -> Result<(), AttributeError> {
        self.check_write(key.erase(), particle)?;
        if !self.columns.floats.contains(key.index(), particle) {
            return Err(AttributeError::MissingAttribute {
                key: key.erase(),
                particle,
            });
        }
        if optimized {
            self.columns.optimized.insert(key.index(), particle, true);
        } else {
            self.columns.optimized.remove(key.index(), particle);
        }
        Ok(())
    }

    pub fn get_is_optimized(&self, key: FloatKey, particle: ParticleIndex) -> bool {
        self.columns.optimized.contains(key.index(), particle)
    }

    /// Every optimized float attribute as `(key, particle)`, ordered by key then slot.
    pub fn optimized_attributes(&self) -> Vec<(FloatKey, ParticleIndex)> {
        self.columns
            .optimized
            .iter()
            .map(|(key, particle, _)| (Key::from_raw(key as u32), particle))
            .collect()
    }

    /// The explicit range of `key`, or the span of its current values if none was set.
    ///
    /// Returns `None` when no range was set and no particle carries the attribute.
    pub fn get_range(&self, key: FloatKey) -> Option<FloatRange> {
        if let Some(range) = self.columns.ranges.get(&key.index()) {
            return Some(*range);
        }
        self.columns
            .floats
            .column(key.index())
            .map(|(_, &value)| value)
            .fold(None, |range: Option<FloatRange>, value| {
                Some(match range {
                    None => FloatRange {
                        lower: value,
                        upper: value,
                    },
                    Some(r) => FloatRange {
                        lower: r.lower.min(value),
                        upper: r.upper.max(value),
                    },
                })
            })
    }

    pub fn set_range(&mut self, key: FloatKey, range: FloatRange) {
        self.columns.ranges.insert(key.index(), range);
    }

    // --- Containers ---

    pub(crate) fn add_container(
        &mut self,
        name: String,
        particles: Vec<ParticleIndex>,
    ) -> Result<ContainerId, AttributeError> {
        for &particle in &particles {
            self.check_live(particle)?;
        }
        Ok(self.containers.insert(Container { name, particles }))
    }

    pub(crate) fn remove_container(
        &mut self,
        container: ContainerId,
    ) -> Result<Container, AttributeError> {
        let removed = self
            .containers
            .remove(container)
            .ok_or(AttributeError::UnknownContainer(container))?;
        self.container_generation += 1;
        Ok(removed)
    }

    pub fn has_container(&self, container: ContainerId) -> bool {
        self.containers.contains_key(container)
    }

    pub fn container(&self, container: ContainerId) -> Result<&Container, AttributeError> {
        self.containers
            .get(container)
            .ok_or(AttributeError::UnknownContainer(container))
    }

    pub fn container_particles(
        &self,
        container: ContainerId,
    ) -> Result<&[ParticleIndex], AttributeError> {
        self.container(container).map(|c| c.particles.as_slice())
    }

    /// Replaces the contents of a container. Score states that list the container as an
    /// output may call this from `before_evaluate`.
    ///
    /// Any dependency schedule built over the old membership is rebuilt before the next
    /// evaluation.
    pub fn set_container_particles(
        &mut self,
        container: ContainerId,
        particles: Vec<ParticleIndex>,
    ) -> Result<(), AttributeError> {
        if let Some(locks) = &self.locks {
            if !locks.writable_containers.contains(&container) {
                return Err(AttributeError::ContainerLocked(container));
            }
        }
        for &particle in &particles {
            self.check_live(particle)?;
        }
        let entry = self
            .containers
            .get_mut(container)
            .ok_or(AttributeError::UnknownContainer(container))?;
        entry.particles = particles;
        self.container_generation += 1;
        Ok(())
    }

    /// Changes with every membership update or container removal.
    pub(crate) fn container_generation(&self) -> u64 {
        self.container_generation
    }

    // --- Change tracking ---

    /// Particles changed since the last incremental evaluation, when tracking is on.
    pub fn changes(&self) -> Option<&ChangeSet> {
        self.changes.as_ref()
    }

    pub(crate) fn set_tracking_changes(&mut self, enabled: bool) {
        match (enabled, self.changes.is_some()) {
            (true, false) => self.changes = Some(ChangeSet::default()),
            (false, true) => self.changes = None,
            _ => {}
        }
    }

    /// Hands out the changes recorded so far and starts a fresh record.
    pub(crate) fn take_changes(&mut self) -> Option<ChangeSet> {
        self.changes.as_mut().map(std::mem::take)
    }

    fn note_change(&mut self, particle: ParticleIndex) {
        if let Some(changes) = &mut self.changes {
            changes.record(&self.columns, particle);
        }
    }

    // --- Crate-internal plumbing ---

    pub(crate) fn set_locks(&mut self, locks: Option<AccessLocks>) {
        self.locks = locks;
    }

    pub(crate) fn columns(&self) -> &AttributeColumns {
        &self.columns
    }

    pub(crate) fn replace_columns(&mut self, columns: AttributeColumns) {
        self.columns = columns;
    }

    /// A human-readable dump of every attribute on `particle`.
    pub fn show_particle(&self, particle: ParticleIndex) -> Result<String, AttributeError> {
        let name = self.particle_name(particle)?;
        let mut out = format!("Particle '{name}' ({particle:?})\n");
        self.describe::<FloatType>(particle, &mut out);
        self.describe::<IntType>(particle, &mut out);
        self.describe::<StringType>(particle, &mut out);
        self.describe::<ParticleType>(particle, &mut out);
        self.describe::<ObjectType>(particle, &mut out);
        self.describe::<FloatsType>(particle, &mut out);
        self.describe::<IntsType>(particle, &mut out);
        self.describe::<StringsType>(particle, &mut out);
        self.describe::<ParticlesType>(particle, &mut out);
        self.describe::<ObjectsType>(particle, &mut out);
        Ok(out)
    }

    fn describe<T: AttributeType>(&self, particle: ParticleIndex, out: &mut String) {
        let table = T::table(&self.columns);
        for index in table.keys_of(particle) {
            if let Some(value) = table.get(index, particle) {
                let key: Key<T> = Key::from_raw(index as u32);
                let _ = writeln!(out, "  {} {}: {:?}", T::CATEGORY, key.name(), value);
            }
        }
    }
}

/// Companion derivative columns for float attributes.
///
/// Kept apart from the values so that restraints can read values and write derivatives in
/// the same pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivativeTable {
    columns: AttributeTable<f64>,
}

impl DerivativeTable {
    /// The accumulated derivative, zero when nothing was added.
    pub fn get(&self, key: FloatKey, particle: ParticleIndex) -> f64 {
        self.columns
            .get(key.index(), particle)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FloatKey, ParticleIndex, f64)> + '_ {
        self.columns
            .iter()
            .map(|(key, particle, &value)| (Key::from_raw(key as u32), particle, value))
    }

    pub(crate) fn add(&mut self, key: FloatKey, particle: ParticleIndex, delta: f64) {
        match self.columns.get_mut(key.index(), particle) {
            Some(value) => *value += delta,
            None => {
                self.columns.insert(key.index(), particle, delta);
            }
        }
    }

    pub(crate) fn zero(&mut self) {
        self.columns.clear();
    }

    pub(crate) fn clear_particle(&mut self, particle: ParticleIndex) {
        self.columns.clear_particle(particle);
    }

    pub(crate) fn remove(&mut self, key: FloatKey, particle: ParticleIndex) {
        self.columns.remove(key.index(), particle);
    }

    /// Adds `weight` times every entry of `other`.
    pub(crate) fn add_scaled(&mut self, other: &DerivativeTable, weight: f64) {
        for (key, particle, value) in other.iter() {
            self.add(key, particle, weight * value);
        }
    }
}

/// A restraint's own derivative table, kept between incremental evaluations.
///
/// The table holds unweighted contributions. An incremental restraint corrects it for the
/// particles that moved instead of recomputing it.
pub struct IncrementalDerivatives<'a> {
    store: &'a AttributeStore,
    table: &'a mut DerivativeTable,
}

impl<'a> IncrementalDerivatives<'a> {
    pub(crate) fn new(store: &'a AttributeStore, table: &'a mut DerivativeTable) -> Self {
        Self { store, table }
    }

    /// Write access to the kept table, with unit weight.
    pub fn accumulator(&mut self) -> DerivativeAccumulator<'_> {
        DerivativeAccumulator::new(self.store, &mut *self.table, 1.0)
    }

    pub fn derivative(&self, key: FloatKey, particle: ParticleIndex) -> f64 {
        self.table.get(key, particle)
    }

    pub fn clear(&mut self) {
        self.table.zero();
    }
}

/// Weighted write access to the derivative columns during one scoring pass.
pub struct DerivativeAccumulator<'a> {
    store: &'a AttributeStore,
    derivatives: &'a mut DerivativeTable,
    weight: f64,
}

impl<'a> DerivativeAccumulator<'a> {
    pub(crate) fn new(
        store: &'a AttributeStore,
        derivatives: &'a mut DerivativeTable,
        weight: f64,
    ) -> Self {
        Self {
            store,
            derivatives,
            weight,
        }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Adds `weight * delta` to the derivative of a float attribute.
    ///
    /// # Errors
    ///
    /// Fails with [`AttributeError::MissingAttribute`] if the particle has no such value, and
    /// with [`AttributeError::WriteLocked`] if the particle is outside the caller's outputs.
    pub fn add_to_derivative(
        &mut self,
        key: FloatKey,
        particle: ParticleIndex,
        delta: f64,
    ) -> Result<(), AttributeError> {
        self.store.check_write(key.erase(), particle)?;
        if !self.store.columns.floats.contains(key.index(), particle) {
            return Err(AttributeError::MissingAttribute {
                key: key.erase(),
                particle,
            });
        }
        self.derivatives.add(key, particle, self.weight * delta);
        Ok(())
    }

    /// The derivative accumulated so far for an attribute.
    pub fn derivative(&self, key: FloatKey, particle: ParticleIndex) -> f64 {
        self.derivatives.get(key, particle)
    }

    /// A nested accumulator whose weight is multiplied into this one's.
    pub fn with_weight(&mut self, weight: f64) -> DerivativeAccumulator<'_> {
        DerivativeAccumulator {
            store: self.store,
            derivatives: &mut *self.derivatives,
            weight: self.weight * weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys::{IntKey, ObjectKey, ParticlesKey, StringKey};
    use proptest::prelude::*;

    fn store_with_particles(n: usize) -> (AttributeStore, Vec<ParticleIndex>) {
        let mut store = AttributeStore::new();
        let particles = (0..n)
            .map(|i| store.add_particle(format!("p{i}")))
            .collect();
        (store, particles)
    }

    #[test]
    fn add_then_get_returns_the_value() {
        let (mut store, p) = store_with_particles(1);
        let key = FloatKey::new("attr_test_value");
        store.add_attribute(key, p[0], 1.5).unwrap();
        assert_eq!(store.get_attribute(key, p[0]).unwrap(), 1.5);
        assert!(store.has_attribute(key, p[0]));
    }

    #[test]
    fn set_overwrites_existing_value() {
        let (mut store, p) = store_with_particles(1);
        let key = StringKey::new("attr_test_label");
        store.add_attribute(key, p[0], "a".to_string()).unwrap();
        store.set_attribute(key, p[0], "b".to_string()).unwrap();
        assert_eq!(store.get_attribute(key, p[0]).unwrap(), "b");
    }

    #[test]
    fn duplicate_add_fails() {
        let (mut store, p) = store_with_particles(1);
        let key = IntKey::new("attr_test_dup");
        store.add_attribute(key, p[0], 1).unwrap();
        let err = store.add_attribute(key, p[0], 2).unwrap_err();
        assert_eq!(
            err,
            AttributeError::DuplicateAttribute {
                key: key.erase(),
                particle: p[0]
            }
        );
        assert_eq!(store.get_attribute(key, p[0]).unwrap(), 1);
    }

    #[test]
    fn get_and_set_on_missing_attribute_fail() {
        let (mut store, p) = store_with_particles(2);
        let key = FloatKey::new("attr_test_missing");
        store.add_attribute(key, p[0], 0.0).unwrap();
        let expected = AttributeError::MissingAttribute {
            key: key.erase(),
            particle: p[1],
        };
        assert_eq!(store.get_attribute(key, p[1]).unwrap_err(), expected);
        assert_eq!(store.set_attribute(key, p[1], 1.0).unwrap_err(), expected);
        assert_eq!(store.remove_attribute(key, p[1]).unwrap_err(), expected);
    }

    #[test]
    fn remove_returns_old_value_and_clears_it() {
        let (mut store, p) = store_with_particles(1);
        let key = FloatKey::new("attr_test_remove");
        store.add_attribute(key, p[0], 4.0).unwrap();
        store.set_is_optimized(key, p[0], true).unwrap();
        assert_eq!(store.remove_attribute(key, p[0]).unwrap(), 4.0);
        assert!(!store.has_attribute(key, p[0]));
        assert!(!store.get_is_optimized(key, p[0]));
    }

    #[test]
    fn removed_particle_is_rejected_everywhere() {
        let (mut store, p) = store_with_particles(2);
        let key = FloatKey::new("attr_test_removed");
        store.add_attribute(key, p[0], 1.0).unwrap();
        store.remove_particle(p[0]).unwrap();

        assert!(!store.is_live(p[0]));
        assert!(!store.has_attribute(key, p[0]));
        assert_eq!(
            store.get_attribute(key, p[0]).unwrap_err(),
            AttributeError::InvalidParticle(p[0])
        );
        assert_eq!(
            store.add_attribute(key, p[0], 2.0).unwrap_err(),
            AttributeError::InvalidParticle(p[0])
        );

        // A new particle never aliases the removed index.
        let fresh = store.add_particle("fresh".into());
        assert_ne!(fresh, p[0]);
    }

    #[test]
    fn growth_of_one_column_leaves_others_intact() {
        let (mut store, p) = store_with_particles(3);
        let first = FloatKey::new("attr_test_growth_a");
        store.add_attribute(first, p[0], 7.0).unwrap();
        for i in 0..64 {
            let key = FloatKey::new(&format!("attr_test_growth_{i}"));
            for &particle in &p {
                let _ = store.add_attribute(key, particle, i as f64);
            }
        }
        assert_eq!(store.get_attribute(first, p[0]).unwrap(), 7.0);
    }

    #[test]
    fn list_and_reference_categories_round_trip() {
        let (mut store, p) = store_with_particles(3);
        let members = ParticlesKey::new("attr_test_members");
        store
            .add_attribute(members, p[0], vec![p[1], p[2]])
            .unwrap();
        assert_eq!(store.get_attribute(members, p[0]).unwrap(), vec![p[1], p[2]]);

        let object = ObjectKey::new("attr_test_object");
        let shared = ObjectRef::new(42_u32);
        store.add_attribute(object, p[1], shared.clone()).unwrap();
        let fetched = store.get_attribute(object, p[1]).unwrap();
        assert_eq!(fetched, shared);
        assert_eq!(fetched.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn attribute_keys_lists_present_keys() {
        let (mut store, p) = store_with_particles(1);
        let a = IntKey::new("attr_test_keys_a");
        let b = IntKey::new("attr_test_keys_b");
        store.add_attribute(a, p[0], 1).unwrap();
        store.add_attribute(b, p[0], 2).unwrap();
        let keys = store.attribute_keys::<IntType>(p[0]);
        assert!(keys.contains(&a) && keys.contains(&b));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn range_defaults_to_value_span_and_can_be_overridden() {
        let (mut store, p) = store_with_particles(3);
        let key = FloatKey::new("attr_test_range");
        assert_eq!(store.get_range(key), None);
        for (i, &particle) in p.iter().enumerate() {
            store.add_attribute(key, particle, i as f64 * 2.0 - 1.0).unwrap();
        }
        assert_eq!(
            store.get_range(key),
            Some(FloatRange {
                lower: -1.0,
                upper: 3.0
            })
        );
        let explicit = FloatRange {
            lower: -10.0,
            upper: 10.0,
        };
        store.set_range(key, explicit);
        assert_eq!(store.get_range(key), Some(explicit));
    }

    #[test]
    fn optimized_flags_require_the_attribute() {
        let (mut store, p) = store_with_particles(2);
        let key = FloatKey::new("attr_test_opt");
        store.add_attribute(key, p[0], 0.0).unwrap();
        store.set_is_optimized(key, p[0], true).unwrap();
        assert!(store.set_is_optimized(key, p[1], true).is_err());
        assert_eq!(store.optimized_attributes(), vec![(key, p[0])]);
    }

    #[test]
    fn locks_restrict_reads_and_writes() {
        let (mut store, p) = store_with_particles(2);
        let key = FloatKey::new("attr_test_locks");
        store.add_attribute(key, p[0], 1.0).unwrap();
        store.add_attribute(key, p[1], 2.0).unwrap();

        store.set_locks(Some(AccessLocks {
            readable: [p[0]].into_iter().collect(),
            writable: HashSet::new(),
            writable_containers: HashSet::new(),
        }));
        assert_eq!(store.get_attribute(key, p[0]).unwrap(), 1.0);
        assert!(matches!(
            store.get_attribute(key, p[1]),
            Err(AttributeError::ReadLocked { .. })
        ));
        assert!(matches!(
            store.set_attribute(key, p[0], 3.0),
            Err(AttributeError::WriteLocked { .. })
        ));

        store.set_locks(None);
        assert_eq!(store.get_attribute(key, p[1]).unwrap(), 2.0);
    }

    #[test]
    fn containers_track_particle_removal() {
        let (mut store, p) = store_with_particles(3);
        let c = store.add_container("all".into(), p.clone()).unwrap();
        store.remove_particle(p[1]).unwrap();
        assert_eq!(store.container_particles(c).unwrap(), &[p[0], p[2]]);
        assert!(store.set_container_particles(c, vec![p[1]]).is_err());
    }

    #[test]
    fn accumulator_applies_weights_and_checks_existence() {
        let (mut store, p) = store_with_particles(2);
        let key = FloatKey::new("attr_test_deriv");
        store.add_attribute(key, p[0], 1.0).unwrap();
        let mut derivatives = DerivativeTable::default();
        {
            let mut accumulator = DerivativeAccumulator::new(&store, &mut derivatives, 2.0);
            accumulator.add_to_derivative(key, p[0], 1.5).unwrap();
            accumulator
                .with_weight(0.5)
                .add_to_derivative(key, p[0], 1.0)
                .unwrap();
            assert!(matches!(
                accumulator.add_to_derivative(key, p[1], 1.0),
                Err(AttributeError::MissingAttribute { .. })
            ));
        }
        assert_eq!(derivatives.get(key, p[0]), 4.0);
        assert_eq!(derivatives.get(key, p[1]), 0.0);
    }

    #[test]
    fn show_particle_lists_attributes() {
        let (mut store, p) = store_with_particles(1);
        store
            .add_attribute(FloatKey::new("attr_test_show"), p[0], 0.25)
            .unwrap();
        let text = store.show_particle(p[0]).unwrap();
        assert!(text.starts_with("Particle 'p0'"));
        assert!(text.contains("float attr_test_show: 0.25"));
    }

    #[test]
    fn membership_changes_advance_the_container_generation() {
        let (mut store, p) = store_with_particles(2);
        let c = store.add_container("c".into(), vec![p[0]]).unwrap();
        let start = store.container_generation();

        store.set_container_particles(c, vec![p[1]]).unwrap();
        assert!(store.container_generation() > start);

        let before_removal = store.container_generation();
        store.remove_container(c).unwrap();
        assert!(store.container_generation() > before_removal);
    }

    #[test]
    fn change_tracking_records_each_particle_once() {
        let (mut store, p) = store_with_particles(3);
        let key = FloatKey::new("attr_test_tracked");
        store.add_attribute(key, p[0], 1.0).unwrap();
        store.add_attribute(key, p[1], 2.0).unwrap();
        assert!(store.changes().is_none());

        store.set_tracking_changes(true);
        store.set_attribute(key, p[1], 3.0).unwrap();
        store.set_attribute(key, p[1], 4.0).unwrap();
        store.add_attribute(key, p[2], 5.0).unwrap();
        assert!(store.set_attribute(key, p[0], 0.0).is_ok());

        let changes = store.changes().unwrap();
        assert_eq!(changes.particles(), &[p[1], p[2], p[0]]);
        assert_eq!(changes.get_prechange_attribute(&store, key, p[1]).unwrap(), 2.0);
        assert!(matches!(
            changes.get_prechange_attribute(&store, key, p[2]),
            Err(AttributeError::MissingAttribute { .. })
        ));
        assert!(!changes.is_full());

        store.set_tracking_changes(false);
        assert!(store.changes().is_none());
    }

    proptest! {
        #[test]
        fn float_attributes_round_trip(first in -1.0e6..1.0e6f64, second in -1.0e6..1.0e6f64) {
            let (mut store, p) = store_with_particles(2);
            let key = FloatKey::new("attr_prop_float");
            store.add_attribute(key, p[0], first).unwrap();
            prop_assert_eq!(store.get_attribute(key, p[0]).unwrap(), first);

            store.set_attribute(key, p[0], second).unwrap();
            prop_assert_eq!(store.get_attribute(key, p[0]).unwrap(), second);

            let missing = matches!(
                store.get_attribute(key, p[1]),
                Err(AttributeError::MissingAttribute { .. })
            );
            prop_assert!(missing);
        }

        #[test]
        fn int_and_string_attributes_round_trip(value in any::<i64>(), label in "[a-z]{0,12}") {
            let (mut store, p) = store_with_particles(2);
            let int_key = IntKey::new("attr_prop_int");
            let string_key = StringKey::new("attr_prop_string");
            store.add_attribute(int_key, p[1], value).unwrap();
            store.add_attribute(string_key, p[1], label.clone()).unwrap();
            prop_assert_eq!(store.get_attribute(int_key, p[1]).unwrap(), value);
            prop_assert_eq!(store.get_attribute(string_key, p[1]).unwrap(), label);

            store.set_attribute(int_key, p[1], value.wrapping_add(1)).unwrap();
            prop_assert_eq!(store.get_attribute(int_key, p[1]).unwrap(), value.wrapping_add(1));

            let missing = matches!(
                store.get_attribute(int_key, p[0]),
                Err(AttributeError::MissingAttribute { .. })
            );
            prop_assert!(missing);
        }
    }
}
