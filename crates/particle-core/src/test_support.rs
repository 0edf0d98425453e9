//! Small plugin objects shared by the engine tests.

use nalgebra::Vector3;
use std::sync::{Arc, Mutex};

use crate::core::attributes::{
    AttributeStore, ChangeSet, DerivativeAccumulator, IncrementalDerivatives,
};
use crate::core::check::FailurePolicy;
use crate::core::ids::ParticleIndex;
use crate::core::keys::{FloatKey, IntKey};
use crate::decorators::XYZ;
use crate::engine::{
    Constraint, Dependency, Model, ModelConfigBuilder, ModelObject, OptimizerState, Restraint,
    ScoreError, ScoreState,
};

pub(crate) fn z() -> FloatKey {
    XYZ::keys()[2]
}

/// A model whose invariant violations come back as errors instead of panics.
pub(crate) fn report_model(name: &str) -> Model {
    Model::with_config(
        ModelConfigBuilder::new()
            .name(name)
            .failure_policy(FailurePolicy::Report)
            .build()
            .unwrap(),
    )
}

/// Adds a particle on the z axis.
pub(crate) fn add_point(model: &mut Model, name: &str, height: f64) -> ParticleIndex {
    let particle = model.add_particle(name);
    XYZ::setup_particle(model.store_mut(), particle, Vector3::new(0.0, 0.0, height)).unwrap();
    particle
}

/// `0.5 * k * z^2` on one particle.
pub(crate) struct HarmonicZ {
    pub particle: ParticleIndex,
    pub k: f64,
}

impl ModelObject for HarmonicZ {
    fn name(&self) -> &str {
        "harmonic z"
    }

    fn inputs(&self) -> Vec<Dependency> {
        vec![Dependency::attribute(z(), self.particle)]
    }
}

impl Restraint for HarmonicZ {
    fn unprotected_evaluate(
        &self,
        store: &AttributeStore,
        accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoreError> {
        let height = store.get_attribute(z(), self.particle)?;
        if let Some(accumulator) = accumulator {
            accumulator.add_to_derivative(z(), self.particle, self.k * height)?;
        }
        Ok(0.5 * self.k * height * height)
    }
}

/// Keeps the z of `centroid` at the mean z of `members`.
pub(crate) struct CentroidZ {
    pub members: Vec<ParticleIndex>,
    pub centroid: ParticleIndex,
}

impl ModelObject for CentroidZ {
    fn name(&self) -> &str {
        "centroid z"
    }

    fn inputs(&self) -> Vec<Dependency> {
        self.members.iter().map(|&p| p.into()).collect()
    }

    fn outputs(&self) -> Vec<Dependency> {
        vec![self.centroid.into()]
    }
}

impl Constraint for CentroidZ {
    fn update_attributes(&mut self, store: &mut AttributeStore) -> Result<(), ScoreError> {
        let mut sum = 0.0;
        for &member in &self.members {
            sum += store.get_attribute(z(), member)?;
        }
        store.set_attribute(z(), self.centroid, sum / self.members.len() as f64)?;
        Ok(())
    }

    fn update_derivatives(
        &mut self,
        _store: &AttributeStore,
        accumulator: &mut DerivativeAccumulator<'_>,
    ) -> Result<(), ScoreError> {
        let share = accumulator.derivative(z(), self.centroid) / self.members.len() as f64;
        for &member in &self.members {
            accumulator.add_to_derivative(z(), member, share)?;
        }
        Ok(())
    }
}

/// Records its `before_evaluate` and `after_evaluate` calls in a shared log.
pub(crate) struct Recorder {
    pub name: String,
    pub inputs: Vec<Dependency>,
    pub outputs: Vec<Dependency>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(
        name: &str,
        inputs: &[ParticleIndex],
        outputs: &[ParticleIndex],
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Self {
        Self::with_dependencies(
            name,
            inputs.iter().map(|&p| p.into()).collect(),
            outputs.iter().map(|&p| p.into()).collect(),
            log,
        )
    }

    pub fn with_dependencies(
        name: &str,
        inputs: Vec<Dependency>,
        outputs: Vec<Dependency>,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            inputs,
            outputs,
            log: Arc::clone(log),
        }
    }
}

impl ModelObject for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<Dependency> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<Dependency> {
        self.outputs.clone()
    }
}

impl ScoreState for Recorder {
    fn before_evaluate(&mut self, _store: &mut AttributeStore) -> Result<(), ScoreError> {
        self.log.lock().unwrap().push(format!("before:{}", self.name));
        Ok(())
    }

    fn after_evaluate(
        &mut self,
        _store: &AttributeStore,
        _accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<(), ScoreError> {
        self.log.lock().unwrap().push(format!("after:{}", self.name));
        Ok(())
    }
}

/// `0.5 * k * z^2` summed over several particles, updated from the particles that moved.
///
/// Every incremental call logs `None` for a full rescore or the particle it corrected.
pub(crate) struct IncrementalHarmonicZ {
    pub particles: Vec<ParticleIndex>,
    pub k: f64,
    pub total: f64,
    pub rescored: Arc<Mutex<Vec<Option<ParticleIndex>>>>,
}

impl IncrementalHarmonicZ {
    pub fn new(particles: &[ParticleIndex], k: f64) -> Self {
        Self {
            particles: particles.to_vec(),
            k,
            total: 0.0,
            rescored: Arc::default(),
        }
    }
}

impl ModelObject for IncrementalHarmonicZ {
    fn name(&self) -> &str {
        "incremental harmonic z"
    }

    fn inputs(&self) -> Vec<Dependency> {
        self.particles.iter().map(|&p| Dependency::attribute(z(), p)).collect()
    }
}

impl Restraint for IncrementalHarmonicZ {
    fn unprotected_evaluate(
        &self,
        store: &AttributeStore,
        mut accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoreError> {
        let mut total = 0.0;
        for &particle in &self.particles {
            let height = store.get_attribute(z(), particle)?;
            if let Some(accumulator) = accumulator.as_deref_mut() {
                accumulator.add_to_derivative(z(), particle, self.k * height)?;
            }
            total += 0.5 * self.k * height * height;
        }
        Ok(total)
    }

    fn is_incremental(&self) -> bool {
        true
    }

    fn unprotected_incremental_evaluate(
        &mut self,
        store: &AttributeStore,
        changes: &ChangeSet,
        mut derivatives: Option<&mut IncrementalDerivatives<'_>>,
    ) -> Result<f64, ScoreError> {
        let rescored = Arc::clone(&self.rescored);
        let mut rescored = rescored.lock().unwrap();
        if changes.is_full() {
            rescored.push(None);
            self.total = match derivatives {
                Some(derivatives) => {
                    derivatives.clear();
                    self.unprotected_evaluate(store, Some(&mut derivatives.accumulator()))?
                }
                None => self.unprotected_evaluate(store, None)?,
            };
            return Ok(self.total);
        }
        for &particle in &self.particles {
            if !changes.is_changed(particle) {
                continue;
            }
            rescored.push(Some(particle));
            let old = changes.get_prechange_attribute(store, z(), particle)?;
            let new = store.get_attribute(z(), particle)?;
            self.total += 0.5 * self.k * (new * new - old * old);
            if let Some(derivatives) = derivatives.as_deref_mut() {
                derivatives
                    .accumulator()
                    .add_to_derivative(z(), particle, self.k * (new - old))?;
            }
        }
        Ok(self.total)
    }
}

/// The z of one particle, but its incremental score never moves after the first full rescore.
pub(crate) struct FrozenIncremental {
    pub particle: ParticleIndex,
    pub cached: f64,
}

impl ModelObject for FrozenIncremental {
    fn name(&self) -> &str {
        "frozen"
    }

    fn inputs(&self) -> Vec<Dependency> {
        vec![self.particle.into()]
    }
}

impl Restraint for FrozenIncremental {
    fn unprotected_evaluate(
        &self,
        store: &AttributeStore,
        _accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoreError> {
        Ok(store.get_attribute(z(), self.particle)?)
    }

    fn is_incremental(&self) -> bool {
        true
    }

    fn unprotected_incremental_evaluate(
        &mut self,
        store: &AttributeStore,
        changes: &ChangeSet,
        _derivatives: Option<&mut IncrementalDerivatives<'_>>,
    ) -> Result<f64, ScoreError> {
        if changes.is_full() {
            self.cached = self.unprotected_evaluate(store, None)?;
        }
        Ok(self.cached)
    }
}

/// Returns a fixed score.
pub(crate) struct Constant {
    pub value: f64,
    pub inputs: Vec<ParticleIndex>,
}

impl ModelObject for Constant {
    fn name(&self) -> &str {
        "constant"
    }

    fn inputs(&self) -> Vec<Dependency> {
        self.inputs.iter().map(|&p| p.into()).collect()
    }
}

impl Restraint for Constant {
    fn unprotected_evaluate(
        &self,
        _store: &AttributeStore,
        _accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoreError> {
        Ok(self.value)
    }
}

/// Always fails.
pub(crate) struct Failing;

impl ModelObject for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn inputs(&self) -> Vec<Dependency> {
        Vec::new()
    }
}

impl Restraint for Failing {
    fn unprotected_evaluate(
        &self,
        _store: &AttributeStore,
        _accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoreError> {
        Err(ScoreError::Failed("no score available".to_string()))
    }
}

/// Declares one particle but reads another.
pub(crate) struct Undeclared {
    pub declared: ParticleIndex,
    pub read: ParticleIndex,
}

impl ModelObject for Undeclared {
    fn name(&self) -> &str {
        "undeclared"
    }

    fn inputs(&self) -> Vec<Dependency> {
        vec![self.declared.into()]
    }
}

impl Restraint for Undeclared {
    fn unprotected_evaluate(
        &self,
        store: &AttributeStore,
        _accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoreError> {
        Ok(store.get_attribute(z(), self.read)?)
    }
}

/// Increments an integer attribute on every update.
pub(crate) struct StepCounter {
    pub particle: ParticleIndex,
    pub key: IntKey,
}

impl ModelObject for StepCounter {
    fn name(&self) -> &str {
        "step counter"
    }

    fn inputs(&self) -> Vec<Dependency> {
        vec![Dependency::attribute(self.key, self.particle)]
    }
}

impl OptimizerState for StepCounter {
    fn update(&mut self, store: &mut AttributeStore) -> Result<(), ScoreError> {
        let steps = store.get_attribute(self.key, self.particle)?;
        store.set_attribute(self.key, self.particle, steps + 1)?;
        Ok(())
    }
}
