use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::config::ModelConfig;
use super::error::ModelError;
use super::evaluate::IncrementalState;
use super::graph::{Declaration, DependencyGraph, GraphNode};
use super::objects::{Dependency, OptimizerState, Restraint, ScoreState};
use super::restraint_set::{RestraintSet, RestraintTree};
use super::statistics::Statistics;
use crate::core::attributes::{AttributeColumns, AttributeStore, Container, DerivativeTable};
use crate::core::check::{self, CheckLevel, FailureHandler, InvariantViolation};
use crate::core::ids::{
    ContainerId, ModelId, OptimizerStateId, ParticleIndex, RestraintId, RestraintSetId,
    ScoreStateId,
};
use crate::core::keys::{AttributeType, FloatKey, FloatType, Key};
use crate::core::object::ObjectArena;

/// Where a model is within an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    NotEvaluating,
    BeforeEvaluate,
    Evaluate,
    AfterEvaluate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::NotEvaluating => "not_evaluating",
            Stage::BeforeEvaluate => "before_evaluate",
            Stage::Evaluate => "evaluate",
            Stage::AfterEvaluate => "after_evaluate",
        })
    }
}

/// The cached outcome of dependency analysis.
#[derive(Debug)]
pub(crate) struct Schedule {
    pub graph: DependencyGraph,
    /// Active score states in dependency order.
    pub score_states: Vec<ScoreStateId>,
    /// Restraints in scoring order with their flattened weights.
    pub restraints: Vec<(RestraintId, f64)>,
    /// Per restraint entry, which positions of `score_states` it transitively needs.
    pub required: Vec<Vec<bool>>,
    pub declarations: HashMap<GraphNode, Declaration>,
    /// Store container generation the graph was built against.
    pub container_generation: u64,
}

/// Owner of all simulation state and the objects that constrain and score it.
///
/// A model holds the attribute store, the derivative columns, every score state, restraint
/// and optimizer state, and the tree of restraint sets. The dependency schedule is derived
/// lazily from what those objects declare and is dropped whenever the set of objects or
/// their declarations may have changed.
pub struct Model {
    id: ModelId,
    pub(super) config: ModelConfig,
    failure_handler: Option<Arc<dyn FailureHandler>>,
    pub(super) store: AttributeStore,
    pub(super) derivatives: DerivativeTable,
    pub(super) score_states: ObjectArena<ScoreStateId, Box<dyn ScoreState>>,
    active_score_states: Vec<ScoreStateId>,
    pub(super) restraints: ObjectArena<RestraintId, Box<dyn Restraint>>,
    restraint_sets: RestraintTree,
    pub(super) optimizer_states: ObjectArena<OptimizerStateId, Box<dyn OptimizerState>>,
    pub(super) active_optimizer_states: Vec<OptimizerStateId>,
    ordering: Vec<(ScoreStateId, ScoreStateId)>,
    pub(super) maximum_scores: HashMap<RestraintId, f64>,
    pub(super) schedule: Option<Schedule>,
    pub(super) incremental: Option<IncrementalState>,
    pub(super) access_validated: bool,
    pub(super) stage: Stage,
    pub(super) evaluation_count: u64,
    pub(super) last_score: Option<f64>,
    pub(super) good_score: bool,
    pub(super) statistics: Statistics,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(ModelConfig {
            name: name.into(),
            ..ModelConfig::default()
        })
    }

    pub fn with_config(config: ModelConfig) -> Self {
        let id = ModelId::next();
        debug!(model = %config.name, %id, "Created model");
        let mut store = AttributeStore::new();
        store.set_tracking_changes(config.incremental);
        Self {
            id,
            failure_handler: config.failure_policy.map(|policy| policy.handler()),
            incremental: config.incremental.then(IncrementalState::default),
            config,
            store,
            derivatives: DerivativeTable::default(),
            score_states: ObjectArena::new("score state"),
            active_score_states: Vec::new(),
            restraints: ObjectArena::new("restraint"),
            restraint_sets: RestraintTree::new(),
            optimizer_states: ObjectArena::new("optimizer state"),
            active_optimizer_states: Vec::new(),
            ordering: Vec::new(),
            maximum_scores: HashMap::new(),
            schedule: None,
            access_validated: false,
            stage: Stage::NotEvaluating,
            evaluation_count: 0,
            last_score: None,
            good_score: true,
            statistics: Statistics::default(),
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn set_check_level(&mut self, level: CheckLevel) {
        self.config.check_level = level;
        self.access_validated = false;
    }

    pub fn set_gather_statistics(&mut self, enabled: bool) {
        self.config.gather_statistics = enabled;
    }

    /// Switches incremental scoring on or off.
    ///
    /// While on, the store records which particles change between evaluations and full
    /// evaluations hand that record to incremental restraints. The first evaluation after
    /// switching on rescores everything.
    pub fn set_is_incremental(&mut self, enabled: bool) {
        if enabled == self.incremental.is_some() {
            return;
        }
        self.config.incremental = enabled;
        self.store.set_tracking_changes(enabled);
        self.incremental = enabled.then(IncrementalState::default);
        debug!(model = %self.config.name, enabled, "Incremental scoring toggled");
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental.is_some()
    }

    /// Makes the next incremental evaluation rescore every restraint from scratch.
    pub(super) fn reset_incremental(&mut self) {
        if let Some(state) = &mut self.incremental {
            state.reset();
        }
    }

    /// Overrides the process-wide failure handler for this model only.
    pub fn set_failure_handler(&mut self, handler: Arc<dyn FailureHandler>) {
        self.failure_handler = Some(handler);
    }

    pub(super) fn failure_handler(&self) -> Arc<dyn FailureHandler> {
        self.failure_handler
            .clone()
            .unwrap_or_else(check::failure_handler)
    }

    /// Routes a violation through the failure handler; only returns if it chose to report.
    pub(super) fn raise(&self, violation: InvariantViolation) -> ModelError {
        ModelError::Invariant(check::raise(self.failure_handler().as_ref(), violation))
    }

    // --- Store and derivatives ---

    pub fn store(&self) -> &AttributeStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut AttributeStore {
        &mut self.store
    }

    pub fn derivatives(&self) -> &DerivativeTable {
        &self.derivatives
    }

    pub fn get_derivative(&self, key: FloatKey, particle: ParticleIndex) -> f64 {
        self.derivatives.get(key, particle)
    }

    // --- Particles ---

    pub fn add_particle(&mut self, name: impl Into<String>) -> ParticleIndex {
        self.store.add_particle(name.into())
    }

    /// Removes a particle and all of its attributes. Its index is never handed out again.
    pub fn remove_particle(&mut self, particle: ParticleIndex) -> Result<(), ModelError> {
        let info = self.store.remove_particle(particle)?;
        self.derivatives.clear_particle(particle);
        debug!(particle = %info.name, "Removed particle");
        self.invalidate_dependencies();
        Ok(())
    }

    pub fn get_has_particle(&self, particle: ParticleIndex) -> bool {
        self.store.is_live(particle)
    }

    pub fn particles(&self) -> impl Iterator<Item = ParticleIndex> + '_ {
        self.store.particles()
    }

    pub fn number_of_particles(&self) -> usize {
        self.store.number_of_particles()
    }

    pub fn particle_name(&self, particle: ParticleIndex) -> Result<&str, ModelError> {
        Ok(self.store.particle_name(particle)?)
    }

    // --- Attributes ---

    pub fn add_attribute<T: AttributeType>(
        &mut self,
        key: Key<T>,
        particle: ParticleIndex,
        value: T::Value,
    ) -> Result<(), ModelError> {
        Ok(self.store.add_attribute(key, particle, value)?)
    }

    pub fn get_attribute<T: AttributeType>(
        &self,
        key: Key<T>,
        particle: ParticleIndex,
    ) -> Result<T::Value, ModelError> {
        Ok(self.store.get_attribute(key, particle)?)
    }

    pub fn set_attribute<T: AttributeType>(
        &mut self,
        key: Key<T>,
        particle: ParticleIndex,
        value: T::Value,
    ) -> Result<(), ModelError> {
        Ok(self.store.set_attribute(key, particle, value)?)
    }

    pub fn remove_attribute<T: AttributeType>(
        &mut self,
        key: Key<T>,
        particle: ParticleIndex,
    ) -> Result<T::Value, ModelError> {
        let removed = self.store.remove_attribute(key, particle)?;
        if T::CATEGORY == FloatType::CATEGORY {
            let key = FloatKey::from_raw(key.index() as u32);
            self.derivatives.remove(key, particle);
            if let Some(state) = &mut self.incremental {
                state.remove_derivative(key, particle);
            }
        }
        Ok(removed)
    }

    pub fn has_attribute<T: AttributeType>(&self, key: Key<T>, particle: ParticleIndex) -> bool {
        self.store.has_attribute(key, particle)
    }

    // --- Containers ---

    pub fn add_container(
        &mut self,
        name: impl Into<String>,
        particles: Vec<ParticleIndex>,
    ) -> Result<ContainerId, ModelError> {
        Ok(self.store.add_container(name.into(), particles)?)
    }

    pub fn remove_container(&mut self, container: ContainerId) -> Result<Container, ModelError> {
        let removed = self.store.remove_container(container)?;
        self.invalidate_dependencies();
        Ok(removed)
    }

    pub fn container_particles(&self, container: ContainerId) -> Result<&[ParticleIndex], ModelError> {
        Ok(self.store.container_particles(container)?)
    }

    pub fn set_container_particles(
        &mut self,
        container: ContainerId,
        particles: Vec<ParticleIndex>,
    ) -> Result<(), ModelError> {
        self.store.set_container_particles(container, particles)?;
        self.invalidate_dependencies();
        Ok(())
    }

    // --- Score states ---

    pub fn add_score_state<S: ScoreState + 'static>(&mut self, state: S) -> ScoreStateId {
        let name = state.name().to_string();
        let id = self.score_states.insert(Box::new(state));
        self.active_score_states.push(id);
        debug!(score_state = %name, "Added score state");
        self.invalidate_dependencies();
        id
    }

    /// Deactivates a score state and drops the model's reference to it.
    pub fn remove_score_state(&mut self, id: ScoreStateId) -> Result<(), ModelError> {
        self.score_state(id)?;
        let before = self.active_score_states.len();
        self.active_score_states.retain(|&active| active != id);
        if self.active_score_states.len() == before {
            return Err(ModelError::ScoreStateNotActive(id));
        }
        self.ordering
            .retain(|&(before, after)| before != id && after != id);
        if let Err(e) = self.score_states.release(id) {
            return Err(self.raise(e.into()));
        }
        self.invalidate_dependencies();
        Ok(())
    }

    pub fn score_state(&self, id: ScoreStateId) -> Result<&dyn ScoreState, ModelError> {
        self.score_states
            .get(id)
            .map(|state| &**state)
            .map_err(|e| self.raise(e.into()))
    }

    /// Mutable access for reconfiguration. The dependency schedule is rebuilt afterwards.
    pub fn score_state_mut(&mut self, id: ScoreStateId) -> Result<&mut dyn ScoreState, ModelError> {
        if let Err(e) = self.score_states.get(id) {
            return Err(self.raise(e.into()));
        }
        self.invalidate_dependencies();
        match self.score_states.get_mut(id) {
            Ok(state) => Ok(&mut **state),
            Err(e) => Err(ModelError::Invariant(e.into())),
        }
    }

    pub fn acquire_score_state(&mut self, id: ScoreStateId) -> Result<u32, ModelError> {
        match self.score_states.acquire(id) {
            Ok(count) => Ok(count),
            Err(e) => Err(self.raise(e.into())),
        }
    }

    pub fn release_score_state(&mut self, id: ScoreStateId) -> Result<(), ModelError> {
        match self.score_states.release(id) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.raise(e.into())),
        }
    }

    /// Active score states in insertion order.
    pub fn score_states(&self) -> &[ScoreStateId] {
        &self.active_score_states
    }

    /// Forces `before` to be updated before `after` even without a data dependency.
    pub fn add_ordering_constraint(
        &mut self,
        before: ScoreStateId,
        after: ScoreStateId,
    ) -> Result<(), ModelError> {
        let name = self.score_state(before)?.name().to_string();
        self.score_state(after)?;
        if before == after {
            return Err(ModelError::SelfOrdering(name));
        }
        self.ordering.push((before, after));
        self.invalidate_dependencies();
        Ok(())
    }

    // --- Restraints and restraint sets ---

    pub fn root_restraint_set(&self) -> RestraintSetId {
        self.restraint_sets.root()
    }

    /// Adds a restraint to the root set.
    pub fn add_restraint<R: Restraint + 'static>(&mut self, restraint: R) -> RestraintId {
        let name = restraint.name().to_string();
        let id = self.restraints.insert(Box::new(restraint));
        self.restraint_sets.push_to_root(id);
        debug!(restraint = %name, "Added restraint");
        self.invalidate_dependencies();
        id
    }

    /// Adds a new restraint directly to `set`.
    pub fn add_restraint_to_set<R: Restraint + 'static>(
        &mut self,
        set: RestraintSetId,
        restraint: R,
    ) -> Result<RestraintId, ModelError> {
        self.restraint_sets.get(set)?;
        let id = self.restraints.insert(Box::new(restraint));
        self.restraint_sets.add_restraint(set, id)?;
        self.invalidate_dependencies();
        Ok(id)
    }

    /// Adds an existing restraint to another set, taking a reference for the membership.
    pub fn add_to_restraint_set(
        &mut self,
        set: RestraintSetId,
        restraint: RestraintId,
    ) -> Result<(), ModelError> {
        self.restraint(restraint)?;
        self.restraint_sets.add_restraint(set, restraint)?;
        self.acquire_restraint(restraint)?;
        self.invalidate_dependencies();
        Ok(())
    }

    pub fn remove_restraint_from_set(
        &mut self,
        set: RestraintSetId,
        restraint: RestraintId,
    ) -> Result<(), ModelError> {
        self.restraint_sets.remove_restraint(set, restraint)?;
        self.release_membership(restraint)?;
        self.invalidate_dependencies();
        Ok(())
    }

    /// Removes a restraint from every set holding it.
    pub fn remove_restraint(&mut self, restraint: RestraintId) -> Result<(), ModelError> {
        self.restraint(restraint)?;
        let sets = self.restraint_sets.sets_containing(restraint);
        if sets.is_empty() {
            return Err(ModelError::RestraintNotActive(restraint));
        }
        for set in sets {
            self.restraint_sets.remove_restraint(set, restraint)?;
            self.release_membership(restraint)?;
        }
        self.invalidate_dependencies();
        Ok(())
    }

    fn release_membership(&mut self, restraint: RestraintId) -> Result<(), ModelError> {
        match self.restraints.release(restraint) {
            Ok(Some(destroyed)) => {
                self.maximum_scores.remove(&restraint);
                debug!(restraint = destroyed.name(), "Destroyed restraint");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(self.raise(e.into())),
        }
    }

    pub fn restraint(&self, id: RestraintId) -> Result<&dyn Restraint, ModelError> {
        self.restraints
            .get(id)
            .map(|restraint| &**restraint)
            .map_err(|e| self.raise(e.into()))
    }

    /// Mutable access for reconfiguration. The dependency schedule is rebuilt afterwards.
    pub fn restraint_mut(&mut self, id: RestraintId) -> Result<&mut dyn Restraint, ModelError> {
        if let Err(e) = self.restraints.get(id) {
            return Err(self.raise(e.into()));
        }
        self.invalidate_dependencies();
        match self.restraints.get_mut(id) {
            Ok(restraint) => Ok(&mut **restraint),
            Err(e) => Err(ModelError::Invariant(e.into())),
        }
    }

    pub fn acquire_restraint(&mut self, id: RestraintId) -> Result<u32, ModelError> {
        match self.restraints.acquire(id) {
            Ok(count) => Ok(count),
            Err(e) => Err(self.raise(e.into())),
        }
    }

    /// Drops one reference. Releasing references the model holds through set membership
    /// destroys the restraint while still scheduled, which the next evaluation reports.
    pub fn release_restraint(&mut self, id: RestraintId) -> Result<(), ModelError> {
        self.release_membership(id)
    }

    pub fn restraint_ref_count(&self, id: RestraintId) -> Option<u32> {
        self.restraints.ref_count(id)
    }

    pub fn create_restraint_set(
        &mut self,
        parent: RestraintSetId,
        name: impl Into<String>,
        weight: f64,
    ) -> Result<RestraintSetId, ModelError> {
        let set = self.restraint_sets.create(parent, name.into(), weight)?;
        self.invalidate_dependencies();
        Ok(set)
    }

    pub fn restraint_set(&self, set: RestraintSetId) -> Result<&RestraintSet, ModelError> {
        Ok(self.restraint_sets.get(set)?)
    }

    pub fn set_restraint_set_weight(
        &mut self,
        set: RestraintSetId,
        weight: f64,
    ) -> Result<(), ModelError> {
        self.restraint_sets.set_weight(set, weight)?;
        self.invalidate_dependencies();
        Ok(())
    }

    /// Removes a set with its subtree, dropping the references its memberships held.
    pub fn remove_restraint_set(&mut self, set: RestraintSetId) -> Result<(), ModelError> {
        let released = self.restraint_sets.remove_set(set)?;
        for restraint in released {
            self.release_membership(restraint)?;
        }
        self.invalidate_dependencies();
        Ok(())
    }

    /// Every scored restraint with the product of set weights above it.
    pub fn restraints_and_weights(&self) -> Vec<(RestraintId, f64)> {
        self.restraint_sets.flatten()
    }

    /// Sets a threshold above which the restraint's weighted score is considered bad.
    pub fn set_maximum_score(&mut self, id: RestraintId, maximum: f64) -> Result<(), ModelError> {
        self.restraint(id)?;
        self.maximum_scores.insert(id, maximum);
        Ok(())
    }

    pub fn maximum_score(&self, id: RestraintId) -> Option<f64> {
        self.maximum_scores.get(&id).copied()
    }

    /// Whether every restraint scored in the last evaluation stayed within its maximum.
    pub fn has_good_score(&self) -> bool {
        self.good_score
    }

    // --- Optimizer states ---

    pub fn add_optimizer_state<O: OptimizerState + 'static>(&mut self, state: O) -> OptimizerStateId {
        let id = self.optimizer_states.insert(Box::new(state));
        self.active_optimizer_states.push(id);
        id
    }

    pub fn remove_optimizer_state(&mut self, id: OptimizerStateId) -> Result<(), ModelError> {
        self.optimizer_state(id)?;
        self.active_optimizer_states.retain(|&active| active != id);
        match self.optimizer_states.release(id) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.raise(e.into())),
        }
    }

    pub fn optimizer_state(&self, id: OptimizerStateId) -> Result<&dyn OptimizerState, ModelError> {
        self.optimizer_states
            .get(id)
            .map(|state| &**state)
            .map_err(|e| self.raise(e.into()))
    }

    pub fn optimizer_states(&self) -> &[OptimizerStateId] {
        &self.active_optimizer_states
    }

    // --- Dependencies ---

    /// Drops the cached schedule. Call after changing what an object declares.
    pub fn invalidate_dependencies(&mut self) {
        if self.schedule.take().is_some() {
            debug!(model = %self.config.name, "Dependency schedule invalidated");
        }
    }

    pub fn dependency_graph(&mut self) -> Result<&DependencyGraph, ModelError> {
        Ok(&self.schedule()?.graph)
    }

    /// Active score states in the order `before_evaluate` runs them.
    pub fn score_state_order(&mut self) -> Result<Vec<ScoreStateId>, ModelError> {
        Ok(self.schedule()?.score_states.clone())
    }

    /// The score states that must be updated before `restraint` can be evaluated.
    pub fn required_score_states(
        &mut self,
        restraint: RestraintId,
    ) -> Result<Vec<ScoreStateId>, ModelError> {
        let position = self.restraint_position(restraint)?;
        let schedule = self.schedule()?;
        Ok(schedule
            .score_states
            .iter()
            .zip(&schedule.required[position])
            .filter(|(_, needed)| **needed)
            .map(|(id, _)| *id)
            .collect())
    }

    pub fn dependent_particles(
        &mut self,
        particle: ParticleIndex,
    ) -> Result<Vec<ParticleIndex>, ModelError> {
        Ok(self
            .schedule()?
            .graph
            .dependent_particles(particle, &HashSet::new()))
    }

    pub fn dependent_restraints(
        &mut self,
        particle: ParticleIndex,
    ) -> Result<Vec<RestraintId>, ModelError> {
        Ok(self
            .schedule()?
            .graph
            .dependent_restraints(particle, &HashSet::new()))
    }

    pub fn dependent_score_states(
        &mut self,
        particle: ParticleIndex,
    ) -> Result<Vec<ScoreStateId>, ModelError> {
        Ok(self
            .schedule()?
            .graph
            .dependent_score_states(particle, &HashSet::new()))
    }

    /// Position of the first scheduled entry for `restraint`.
    pub(super) fn restraint_position(&mut self, restraint: RestraintId) -> Result<usize, ModelError> {
        self.restraint(restraint)?;
        self.schedule()?
            .restraints
            .iter()
            .position(|&(id, _)| id == restraint)
            .ok_or(ModelError::RestraintNotActive(restraint))
    }

    pub(super) fn schedule(&mut self) -> Result<&Schedule, ModelError> {
        self.ensure_schedule()?;
        match &self.schedule {
            Some(schedule) => Ok(schedule),
            None => Err(self.raise(InvariantViolation::Corrupted(
                "dependency schedule missing after rebuild".to_string(),
            ))),
        }
    }

    pub(super) fn ensure_schedule(&mut self) -> Result<(), ModelError> {
        let generation = self.store.container_generation();
        if let Some(schedule) = &self.schedule {
            if schedule.container_generation == generation {
                return Ok(());
            }
            debug!(model = %self.config.name, "Container membership changed, rebuilding schedule");
        }
        let schedule = self.build_schedule()?;
        self.schedule = Some(schedule);
        self.access_validated = false;
        self.reset_incremental();
        Ok(())
    }

    fn build_schedule(&self) -> Result<Schedule, ModelError> {
        let restraints = self.restraint_sets.flatten();

        let mut state_declarations = Vec::with_capacity(self.active_score_states.len());
        for &id in &self.active_score_states {
            let state = self.score_state(id)?;
            state_declarations.push(Declaration {
                node: GraphNode::ScoreState(id),
                name: state.name().to_string(),
                inputs: state.inputs(),
                outputs: state.outputs(),
            });
        }

        let mut restraint_declarations = Vec::with_capacity(restraints.len());
        let mut seen = HashSet::new();
        for &(id, _) in &restraints {
            if !seen.insert(id) {
                continue;
            }
            let restraint = self.restraint(id)?;
            restraint_declarations.push(Declaration {
                node: GraphNode::Restraint(id),
                name: restraint.name().to_string(),
                inputs: restraint.inputs(),
                outputs: Vec::new(),
            });
        }

        if self.config.check_level >= CheckLevel::Usage {
            for declaration in state_declarations.iter().chain(&restraint_declarations) {
                self.check_declaration(declaration)?;
            }
        }

        let graph = DependencyGraph::build(
            &state_declarations,
            &restraint_declarations,
            &self.ordering,
            &self.store,
        );
        let score_states = match graph.score_state_order() {
            Ok(order) => order,
            Err(violation) => {
                error!(graph = %graph.to_graphviz(), "Dependency graph contains a cycle");
                return Err(self.raise(violation));
            }
        };

        let position: HashMap<ScoreStateId, usize> = score_states
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        let required = restraints
            .iter()
            .map(|&(id, _)| {
                let mut needed = vec![false; score_states.len()];
                for state in graph.upstream_score_states(GraphNode::Restraint(id)) {
                    if let Some(&i) = position.get(&state) {
                        needed[i] = true;
                    }
                }
                needed
            })
            .collect();

        info!(
            model = %self.config.name,
            score_states = score_states.len(),
            restraints = restraints.len(),
            edges = graph.number_of_edges(),
            "Built dependency schedule"
        );

        let declarations = state_declarations
            .into_iter()
            .chain(restraint_declarations)
            .map(|declaration| (declaration.node, declaration))
            .collect();
        Ok(Schedule {
            graph,
            score_states,
            restraints,
            required,
            declarations,
            container_generation: self.store.container_generation(),
        })
    }

    fn check_declaration(&self, declaration: &Declaration) -> Result<(), ModelError> {
        for dependency in declaration.inputs.iter().chain(&declaration.outputs) {
            let exists = match *dependency {
                Dependency::Particle(particle) | Dependency::Attribute { particle, .. } => {
                    self.store.is_live(particle)
                }
                Dependency::Container(container) => self.store.has_container(container),
            };
            if !exists {
                return Err(ModelError::StaleDependency {
                    object: declaration.name.clone(),
                    dependency: format!("{dependency:?}"),
                });
            }
        }
        Ok(())
    }

    // --- Snapshots ---

    pub(super) fn attribute_columns(&self) -> &AttributeColumns {
        self.store.columns()
    }

    /// Replaces every attribute column with `snapshot`, skipping particles that no longer
    /// exist. Particles created after the snapshot lose all of their attributes.
    pub(super) fn restore_columns(&mut self, snapshot: &AttributeColumns) {
        let mut columns = snapshot.clone();
        let captured = columns.len();
        columns.retain_particles(|particle| self.store.is_live(particle));
        let skipped = captured - columns.len();
        if skipped > 0 {
            warn!(
                model = %self.config.name,
                skipped,
                "Snapshot entries for removed particles were not restored"
            );
        }
        self.store.replace_columns(columns);
        self.derivatives.zero();
        self.reset_incremental();
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("particles", &self.store.number_of_particles())
            .field("score_states", &self.active_score_states.len())
            .field("restraints", &self.restraints.len())
            .field("stage", &self.stage)
            .field("evaluations", &self.evaluation_count)
            .finish()
    }
}
