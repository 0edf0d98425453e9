use nalgebra::Vector3;

use super::{Decorator, DecoratorError};
use crate::core::attributes::{
    AttributeError, AttributeStore, DerivativeAccumulator, DerivativeTable,
};
use crate::core::ids::ParticleIndex;
use crate::core::keys::FloatKey;
use crate::static_key;

/// Cartesian coordinates stored in the float attributes `x`, `y` and `z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XYZ(ParticleIndex);

impl XYZ {
    pub fn keys() -> [FloatKey; 3] {
        [
            static_key!(FloatKey, "x"),
            static_key!(FloatKey, "y"),
            static_key!(FloatKey, "z"),
        ]
    }

    /// Gives `particle` coordinates, overwriting any it already had.
    pub fn setup_particle(
        store: &mut AttributeStore,
        particle: ParticleIndex,
        coordinates: Vector3<f64>,
    ) -> Result<Self, DecoratorError> {
        for (key, value) in Self::keys().into_iter().zip(coordinates.iter()) {
            if store.has_attribute(key, particle) {
                store.set_attribute(key, particle, *value)?;
            } else {
                store.add_attribute(key, particle, *value)?;
            }
        }
        Ok(Self(particle))
    }

    pub fn coordinates(&self, store: &AttributeStore) -> Result<Vector3<f64>, AttributeError> {
        let [x, y, z] = Self::keys();
        Ok(Vector3::new(
            store.get_attribute(x, self.0)?,
            store.get_attribute(y, self.0)?,
            store.get_attribute(z, self.0)?,
        ))
    }

    pub fn set_coordinates(
        &self,
        store: &mut AttributeStore,
        coordinates: Vector3<f64>,
    ) -> Result<(), AttributeError> {
        for (key, value) in Self::keys().into_iter().zip(coordinates.iter()) {
            store.set_attribute(key, self.0, *value)?;
        }
        Ok(())
    }

    pub fn set_coordinates_are_optimized(
        &self,
        store: &mut AttributeStore,
        optimized: bool,
    ) -> Result<(), AttributeError> {
        for key in Self::keys() {
            store.set_is_optimized(key, self.0, optimized)?;
        }
        Ok(())
    }

    pub fn coordinates_are_optimized(&self, store: &AttributeStore) -> bool {
        Self::keys()
            .into_iter()
            .all(|key| store.get_is_optimized(key, self.0))
    }

    /// Adds a Cartesian gradient to the coordinate derivatives.
    pub fn add_to_derivatives(
        &self,
        accumulator: &mut DerivativeAccumulator<'_>,
        derivative: Vector3<f64>,
    ) -> Result<(), AttributeError> {
        for (key, value) in Self::keys().into_iter().zip(derivative.iter()) {
            accumulator.add_to_derivative(key, self.0, *value)?;
        }
        Ok(())
    }

    pub fn derivatives(&self, derivatives: &DerivativeTable) -> Vector3<f64> {
        let [x, y, z] = Self::keys();
        Vector3::new(
            derivatives.get(x, self.0),
            derivatives.get(y, self.0),
            derivatives.get(z, self.0),
        )
    }

    pub fn distance(&self, store: &AttributeStore, other: XYZ) -> Result<f64, AttributeError> {
        Ok((self.coordinates(store)? - other.coordinates(store)?).norm())
    }
}

impl Decorator for XYZ {
    const NAME: &'static str = "XYZ";

    fn particle_is_instance(store: &AttributeStore, particle: ParticleIndex) -> bool {
        Self::keys()
            .into_iter()
            .all(|key| store.has_attribute(key, particle))
    }

    fn particle_index(&self) -> ParticleIndex {
        self.0
    }

    fn wrap(particle: ParticleIndex) -> Self {
        Self(particle)
    }
}

/// A sphere: [`XYZ`] coordinates plus the float attribute `radius`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XYZR(ParticleIndex);

impl XYZR {
    pub fn radius_key() -> FloatKey {
        static_key!(FloatKey, "radius")
    }

    pub fn setup_particle(
        store: &mut AttributeStore,
        particle: ParticleIndex,
        center: Vector3<f64>,
        radius: f64,
    ) -> Result<Self, DecoratorError> {
        XYZ::setup_particle(store, particle, center)?;
        let key = Self::radius_key();
        if store.has_attribute(key, particle) {
            store.set_attribute(key, particle, radius)?;
        } else {
            store.add_attribute(key, particle, radius)?;
        }
        Ok(Self(particle))
    }

    pub fn radius(&self, store: &AttributeStore) -> Result<f64, AttributeError> {
        store.get_attribute(Self::radius_key(), self.0)
    }

    pub fn set_radius(&self, store: &mut AttributeStore, radius: f64) -> Result<(), AttributeError> {
        store.set_attribute(Self::radius_key(), self.0, radius)
    }

    pub fn as_xyz(&self) -> XYZ {
        XYZ(self.0)
    }

    /// Distance between the surfaces of two spheres; negative when they overlap.
    pub fn sphere_distance(&self, store: &AttributeStore, other: XYZR) -> Result<f64, AttributeError> {
        let center = self.as_xyz().distance(store, other.as_xyz())?;
        Ok(center - self.radius(store)? - other.radius(store)?)
    }
}

impl Decorator for XYZR {
    const NAME: &'static str = "XYZR";

    fn particle_is_instance(store: &AttributeStore, particle: ParticleIndex) -> bool {
        XYZ::particle_is_instance(store, particle)
            && store.has_attribute(Self::radius_key(), particle)
    }

    fn particle_index(&self) -> ParticleIndex {
        self.0
    }

    fn wrap(particle: ParticleIndex) -> Self {
        Self(particle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_then_decorate_round_trips_coordinates() {
        let mut store = AttributeStore::new();
        let p = store.add_particle("atom".into());
        XYZ::setup_particle(&mut store, p, Vector3::new(1.0, 2.0, 3.0)).unwrap();

        let xyz = XYZ::decorate(&store, p).unwrap();
        assert_eq!(xyz.particle_index(), p);
        assert_eq!(xyz.coordinates(&store).unwrap(), Vector3::new(1.0, 2.0, 3.0));

        xyz.set_coordinates(&mut store, Vector3::new(0.0, 0.0, -1.0))
            .unwrap();
        assert_eq!(store.get_attribute(XYZ::keys()[2], p).unwrap(), -1.0);
    }

    #[test]
    fn decorate_rejects_particles_without_the_keys() {
        let mut store = AttributeStore::new();
        let p = store.add_particle("bare".into());
        assert_eq!(
            XYZ::decorate(&store, p),
            Err(DecoratorError::NotInstance {
                decorator: "XYZ",
                particle: p
            })
        );
        store.remove_particle(p).unwrap();
        assert!(matches!(
            XYZ::decorate(&store, p),
            Err(DecoratorError::Attribute(AttributeError::InvalidParticle(_)))
        ));
    }

    #[test]
    fn setup_is_idempotent() {
        let mut store = AttributeStore::new();
        let p = store.add_particle("atom".into());
        XYZ::setup_particle(&mut store, p, Vector3::zeros()).unwrap();
        let xyz = XYZ::setup_particle(&mut store, p, Vector3::new(4.0, 0.0, 0.0)).unwrap();
        assert_eq!(xyz.coordinates(&store).unwrap().x, 4.0);
    }

    #[test]
    fn optimization_flags_cover_all_coordinates() {
        let mut store = AttributeStore::new();
        let p = store.add_particle("atom".into());
        let xyz = XYZ::setup_particle(&mut store, p, Vector3::zeros()).unwrap();
        assert!(!xyz.coordinates_are_optimized(&store));
        xyz.set_coordinates_are_optimized(&mut store, true).unwrap();
        assert!(xyz.coordinates_are_optimized(&store));
    }

    #[test]
    fn derivatives_are_weighted_per_axis() {
        let mut store = AttributeStore::new();
        let p = store.add_particle("atom".into());
        let xyz = XYZ::setup_particle(&mut store, p, Vector3::zeros()).unwrap();
        let mut derivatives = DerivativeTable::default();
        {
            let mut accumulator = DerivativeAccumulator::new(&store, &mut derivatives, 2.0);
            xyz.add_to_derivatives(&mut accumulator, Vector3::new(1.0, -1.0, 0.5))
                .unwrap();
        }
        assert_eq!(xyz.derivatives(&derivatives), Vector3::new(2.0, -2.0, 1.0));
    }

    #[test]
    fn sphere_distance_subtracts_radii() {
        let mut store = AttributeStore::new();
        let a = store.add_particle("a".into());
        let b = store.add_particle("b".into());
        let a = XYZR::setup_particle(&mut store, a, Vector3::zeros(), 1.0).unwrap();
        let b = XYZR::setup_particle(&mut store, b, Vector3::new(5.0, 0.0, 0.0), 1.5).unwrap();

        assert_eq!(a.as_xyz().distance(&store, b.as_xyz()).unwrap(), 5.0);
        assert_eq!(a.sphere_distance(&store, b).unwrap(), 2.5);
        assert!(XYZ::particle_is_instance(&store, a.particle_index()));

        b.set_radius(&mut store, 4.5).unwrap();
        assert_eq!(a.sphere_distance(&store, b).unwrap(), -0.5);
    }
}
