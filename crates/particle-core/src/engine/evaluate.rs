//! The evaluation pass: score states forward, restraints, score states backward.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, trace};

use super::config::ModelConfig;
use super::error::ModelError;
use super::graph::GraphNode;
use super::model::{Model, Schedule, Stage};
use super::objects::{Dependency, Restraint, ScoreError, ScoreState};
use super::statistics::Statistics;
use crate::core::attributes::{
    AccessLocks, AttributeStore, ChangeSet, DerivativeAccumulator, DerivativeTable,
    IncrementalDerivatives,
};
use crate::core::check::{self, CheckLevel, FailureHandler, InvariantViolation, NumericalPolicy};
use crate::core::ids::{ParticleIndex, RestraintId, ScoreStateId};
use crate::core::keys::FloatKey;
use crate::core::object::ObjectArena;

/// What incremental scoring keeps between full evaluations.
#[derive(Debug, Default)]
pub(crate) struct IncrementalState {
    /// Unweighted derivatives of each incremental restraint.
    tables: HashMap<RestraintId, DerivativeTable>,
    /// False until a full rescore has filled `tables`.
    primed: bool,
    /// Whether the last incremental evaluation kept `tables` current.
    had_derivatives: bool,
}

impl IncrementalState {
    pub(crate) fn reset(&mut self) {
        self.primed = false;
    }

    pub(crate) fn remove_derivative(&mut self, key: FloatKey, particle: ParticleIndex) {
        for table in self.tables.values_mut() {
            table.remove(key, particle);
        }
    }

    /// The change set for the coming evaluation. Anything that left `tables` stale turns it
    /// into a full rescore.
    fn begin(&mut self, recorded: Option<ChangeSet>, compute_derivatives: bool) -> ChangeSet {
        let stale = !self.primed || (compute_derivatives && !self.had_derivatives);
        match recorded {
            Some(changes) if !stale => changes,
            _ => {
                self.tables.clear();
                ChangeSet::full()
            }
        }
    }

    fn finish(&mut self, compute_derivatives: bool) {
        self.primed = true;
        self.had_derivatives = compute_derivatives;
    }
}

impl Model {
    /// Brings every score state up to date, then sums the weighted restraint scores.
    ///
    /// # Arguments
    ///
    /// * `compute_derivatives` - Whether restraints and score states accumulate derivatives.
    ///   Derivatives are zeroed at the start of scoring either way they are requested.
    ///
    /// # Errors
    ///
    /// Returns the first failure of a plugin object, a [`ModelError::Numerical`] for
    /// non-finite values under the `error` policy, and invariant violations the failure
    /// handler chose to report. The model leaves the evaluating stage in every case.
    #[instrument(skip_all, name = "evaluate", fields(model = %self.config.name))]
    pub fn evaluate(&mut self, compute_derivatives: bool) -> Result<f64, ModelError> {
        let scores = self.run_pass(None, compute_derivatives)?;
        let total: f64 = scores.iter().map(|(_, score)| score).sum();
        self.last_score = Some(total);
        debug!(total, restraints = scores.len(), "Evaluation finished");
        Ok(total)
    }

    /// Evaluates only `restraints`, updating just the score states they depend on.
    ///
    /// Returns one weighted score per requested restraint, in request order. A restraint
    /// that belongs to several sets is scored with the weight of its first membership.
    #[instrument(skip_all, name = "evaluate_restraints", fields(model = %self.config.name))]
    pub fn evaluate_restraints(
        &mut self,
        restraints: &[RestraintId],
        compute_derivatives: bool,
    ) -> Result<Vec<f64>, ModelError> {
        let scores = self.run_pass(Some(restraints), compute_derivatives)?;
        Ok(scores.into_iter().map(|(_, score)| score).collect())
    }

    /// Runs `before_evaluate` on every score state without scoring.
    pub fn update(&mut self) -> Result<(), ModelError> {
        self.ensure_schedule()?;
        let required = self.selection_mask(None)?;
        let outcome = match self.begin_pass(false, false) {
            Ok(mut pass) => pass.before_evaluate(&required),
            Err(e) => Err(e),
        };
        self.end_pass();
        outcome
    }

    /// Calls `update` on every optimizer state in insertion order.
    pub fn update_optimizer_states(&mut self) -> Result<(), ModelError> {
        for &id in &self.active_optimizer_states {
            let state = match self.optimizer_states.get_mut(id) {
                Ok(state) => state,
                Err(e) => return Err(self.raise(e.into())),
            };
            state
                .update(&mut self.store)
                .map_err(|source| ModelError::OptimizerState {
                    name: state.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Number of completed evaluations.
    pub fn evaluation_count(&self) -> u64 {
        self.evaluation_count
    }

    /// Total of the last successful full evaluation.
    pub fn last_score(&self) -> Option<f64> {
        self.last_score
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn clear_statistics(&mut self) {
        self.statistics.clear();
    }

    fn run_pass(
        &mut self,
        selection: Option<&[RestraintId]>,
        compute_derivatives: bool,
    ) -> Result<Vec<(RestraintId, f64)>, ModelError> {
        self.ensure_schedule()?;
        let positions = self.selection_positions(selection)?;
        let required = self.selection_mask(selection)?;
        let validating =
            !self.access_validated && self.config.check_level == CheckLevel::UsageAndInternal;

        let started = Instant::now();
        let outcome = match self.begin_pass(validating, selection.is_none()) {
            Ok(mut pass) => pass.run(&positions, &required, compute_derivatives),
            Err(e) => Err(e),
        };
        self.end_pass();
        if outcome.is_err() {
            self.reset_incremental();
        }
        let scores = outcome?;

        if validating {
            self.access_validated = true;
        }
        self.evaluation_count += 1;
        self.good_score = scores.iter().all(|(id, score)| {
            self.maximum_scores
                .get(id)
                .is_none_or(|&maximum| *score <= maximum)
        });
        if self.config.gather_statistics {
            self.statistics.record_evaluation(started.elapsed());
        }
        Ok(scores)
    }

    fn end_pass(&mut self) {
        self.stage = Stage::NotEvaluating;
        self.store.set_locks(None);
    }

    fn current_schedule(&self) -> Result<&Schedule, ModelError> {
        match &self.schedule {
            Some(schedule) => Ok(schedule),
            None => Err(self.raise(InvariantViolation::Corrupted(
                "evaluation started without a dependency schedule".to_string(),
            ))),
        }
    }

    fn selection_positions(
        &self,
        selection: Option<&[RestraintId]>,
    ) -> Result<Vec<usize>, ModelError> {
        let schedule = self.current_schedule()?;
        let Some(selection) = selection else {
            return Ok((0..schedule.restraints.len()).collect());
        };
        selection
            .iter()
            .map(|&restraint| {
                self.restraint(restraint)?;
                schedule
                    .restraints
                    .iter()
                    .position(|&(id, _)| id == restraint)
                    .ok_or(ModelError::RestraintNotActive(restraint))
            })
            .collect()
    }

    /// Which scheduled score states the selection needs, by schedule position.
    fn selection_mask(&self, selection: Option<&[RestraintId]>) -> Result<Vec<bool>, ModelError> {
        let schedule = self.current_schedule()?;
        if selection.is_none() {
            return Ok(vec![true; schedule.score_states.len()]);
        }
        let mut mask = vec![false; schedule.score_states.len()];
        for position in self.selection_positions(selection)? {
            for (needed, &required) in mask.iter_mut().zip(&schedule.required[position]) {
                *needed |= required;
            }
        }
        Ok(mask)
    }

    /// Splits the model into a pass. `full` passes score every restraint and may use
    /// incremental scoring.
    fn begin_pass(&mut self, validate_access: bool, full: bool) -> Result<Pass<'_>, ModelError> {
        let handler = self.failure_handler();
        let Model {
            store,
            derivatives,
            score_states,
            restraints,
            schedule,
            incremental,
            statistics,
            stage,
            config,
            ..
        } = self;
        let Some(schedule) = schedule.as_ref() else {
            return Err(ModelError::Invariant(check::raise(
                handler.as_ref(),
                InvariantViolation::Corrupted(
                    "evaluation started without a dependency schedule".to_string(),
                ),
            )));
        };
        Ok(Pass {
            store,
            derivatives,
            score_states,
            restraints,
            schedule,
            incremental: incremental.as_mut().filter(|_| full),
            statistics,
            stage,
            config,
            handler,
            validate_access,
        })
    }
}

/// Split borrows of a model for the duration of one pass.
struct Pass<'m> {
    store: &'m mut AttributeStore,
    derivatives: &'m mut DerivativeTable,
    score_states: &'m mut ObjectArena<ScoreStateId, Box<dyn ScoreState>>,
    restraints: &'m mut ObjectArena<RestraintId, Box<dyn Restraint>>,
    schedule: &'m Schedule,
    incremental: Option<&'m mut IncrementalState>,
    statistics: &'m mut Statistics,
    stage: &'m mut Stage,
    config: &'m ModelConfig,
    handler: Arc<dyn FailureHandler>,
    validate_access: bool,
}

impl Pass<'_> {
    fn run(
        &mut self,
        positions: &[usize],
        required: &[bool],
        compute_derivatives: bool,
    ) -> Result<Vec<(RestraintId, f64)>, ModelError> {
        self.before_evaluate(required)?;
        let scores = self.score(positions, compute_derivatives)?;
        self.after_evaluate(required, compute_derivatives)?;
        if compute_derivatives {
            self.check_derivatives()?;
        }
        Ok(scores)
    }

    fn before_evaluate(&mut self, required: &[bool]) -> Result<(), ModelError> {
        *self.stage = Stage::BeforeEvaluate;
        let schedule = self.schedule;
        for (position, &id) in schedule.score_states.iter().enumerate() {
            if !required[position] {
                continue;
            }
            let state = self
                .score_states
                .get_mut(id)
                .map_err(|e| ModelError::Invariant(check::raise(self.handler.as_ref(), e.into())))?;
            if self.validate_access {
                let locks = declared_locks(&*self.store, schedule, GraphNode::ScoreState(id), false);
                self.store.set_locks(locks);
            }

            let started = Instant::now();
            let result = state.before_evaluate(&mut *self.store);
            self.store.set_locks(None);
            result.map_err(|source| ModelError::ScoreState {
                name: state.name().to_string(),
                phase: Stage::BeforeEvaluate,
                source,
            })?;
            if self.config.gather_statistics {
                self.statistics
                    .record_before(id, state.name(), started.elapsed());
            }
            trace!(score_state = state.name(), "Updated score state");
        }
        Ok(())
    }

    fn score(
        &mut self,
        positions: &[usize],
        compute_derivatives: bool,
    ) -> Result<Vec<(RestraintId, f64)>, ModelError> {
        *self.stage = Stage::Evaluate;
        if compute_derivatives {
            self.derivatives.zero();
        }
        let changes = self
            .incremental
            .as_deref_mut()
            .map(|state| state.begin(self.store.take_changes(), compute_derivatives));
        let schedule = self.schedule;
        // Incremental restraints run once per evaluation, whatever their memberships.
        let mut incremental_scores: HashMap<RestraintId, f64> = HashMap::new();
        let mut scores = Vec::with_capacity(positions.len());
        for &position in positions {
            let (id, weight) = schedule.restraints[position];
            let restraint = self
                .restraints
                .get_mut(id)
                .map_err(|e| ModelError::Invariant(check::raise(self.handler.as_ref(), e.into())))?;
            if self.validate_access {
                let locks = declared_locks(&*self.store, schedule, GraphNode::Restraint(id), true);
                self.store.set_locks(locks);
            }

            let started = Instant::now();
            let result = match (&changes, self.incremental.as_deref_mut()) {
                (Some(changes), Some(state)) if restraint.is_incremental() => {
                    match incremental_scores.get(&id) {
                        Some(&score) => Ok(score),
                        None => {
                            let table = state.tables.entry(id).or_default();
                            let outcome = evaluate_incremental(
                                &mut **restraint,
                                &*self.store,
                                changes,
                                table,
                                compute_derivatives,
                            );
                            if let Ok(score) = outcome {
                                incremental_scores.insert(id, score);
                            }
                            outcome
                        }
                    }
                }
                _ if compute_derivatives => {
                    let mut accumulator =
                        DerivativeAccumulator::new(&*self.store, &mut *self.derivatives, weight);
                    restraint.unprotected_evaluate(&*self.store, Some(&mut accumulator))
                }
                _ => restraint.unprotected_evaluate(&*self.store, None),
            };
            let checked = self.config.check_level == CheckLevel::UsageAndInternal
                && restraint.is_incremental()
                && changes.as_ref().is_some_and(|changes| !changes.is_full());
            let result = match result {
                Ok(score) if checked => {
                    let kept = self
                        .incremental
                        .as_deref()
                        .and_then(|state| state.tables.get(&id));
                    check_incremental(
                        &**restraint,
                        &*self.store,
                        kept,
                        score,
                        compute_derivatives,
                        self.handler.as_ref(),
                    )
                }
                other => other.map(Ok),
            };
            self.store.set_locks(None);
            let score = result.map_err(|source| ModelError::Restraint {
                name: restraint.name().to_string(),
                source,
            })??;
            self.config
                .numerical_policy
                .apply(|| format!("score of restraint '{}'", restraint.name()), score)?;

            let weighted = weight * score;
            if self.config.gather_statistics {
                self.statistics
                    .record_restraint(id, restraint.name(), weighted, started.elapsed());
            }
            trace!(restraint = restraint.name(), score, weight, "Scored restraint");
            scores.push((id, weighted));
        }

        if let Some(state) = self.incremental.as_deref_mut() {
            if compute_derivatives {
                for &position in positions {
                    let (id, weight) = schedule.restraints[position];
                    if let Some(table) = state.tables.get(&id) {
                        self.derivatives.add_scaled(table, weight);
                    }
                }
            }
            state.finish(compute_derivatives);
        }
        Ok(scores)
    }

    fn after_evaluate(&mut self, required: &[bool], compute_derivatives: bool) -> Result<(), ModelError> {
        *self.stage = Stage::AfterEvaluate;
        let schedule = self.schedule;
        for (position, &id) in schedule.score_states.iter().enumerate().rev() {
            if !required[position] {
                continue;
            }
            let state = self
                .score_states
                .get_mut(id)
                .map_err(|e| ModelError::Invariant(check::raise(self.handler.as_ref(), e.into())))?;
            if self.validate_access {
                let locks = declared_locks(&*self.store, schedule, GraphNode::ScoreState(id), true);
                self.store.set_locks(locks);
            }

            let started = Instant::now();
            let result = if compute_derivatives {
                let mut accumulator =
                    DerivativeAccumulator::new(&*self.store, &mut *self.derivatives, 1.0);
                state.after_evaluate(&*self.store, Some(&mut accumulator))
            } else {
                state.after_evaluate(&*self.store, None)
            };
            self.store.set_locks(None);
            result.map_err(|source| ModelError::ScoreState {
                name: state.name().to_string(),
                phase: Stage::AfterEvaluate,
                source,
            })?;
            if self.config.gather_statistics {
                self.statistics
                    .record_after(id, state.name(), started.elapsed());
            }
        }
        Ok(())
    }

    fn check_derivatives(&self) -> Result<(), ModelError> {
        let policy = self.config.numerical_policy;
        if policy == NumericalPolicy::Ignore {
            return Ok(());
        }
        for (key, particle, value) in self.derivatives.iter() {
            policy.apply(
                || format!("derivative of {} on particle {particle:?}", key.name()),
                value,
            )?;
        }
        Ok(())
    }
}

fn evaluate_incremental(
    restraint: &mut dyn Restraint,
    store: &AttributeStore,
    changes: &ChangeSet,
    table: &mut DerivativeTable,
    compute_derivatives: bool,
) -> Result<f64, ScoreError> {
    if compute_derivatives {
        let mut derivatives = IncrementalDerivatives::new(store, table);
        restraint.unprotected_incremental_evaluate(store, changes, Some(&mut derivatives))
    } else {
        restraint.unprotected_incremental_evaluate(store, changes, None)
    }
}

/// Recomputes an incrementally scored restraint from scratch and raises
/// [`InvariantViolation::IncrementalMismatch`] if the two disagree.
///
/// The outer result carries the restraint's own failures, the inner one the violation.
fn check_incremental(
    restraint: &dyn Restraint,
    store: &AttributeStore,
    kept: Option<&DerivativeTable>,
    score: f64,
    compute_derivatives: bool,
    handler: &dyn FailureHandler,
) -> Result<Result<f64, ModelError>, ScoreError> {
    let mut reference = DerivativeTable::default();
    let expected = if compute_derivatives {
        let mut accumulator = DerivativeAccumulator::new(store, &mut reference, 1.0);
        restraint.unprotected_evaluate(store, Some(&mut accumulator))?
    } else {
        restraint.unprotected_evaluate(store, None)?
    };

    let mut mismatch = None;
    if (score - expected).abs() > 0.001 + 0.1 * (score + expected).abs() {
        mismatch = Some(format!("score {score} against {expected}"));
    } else if compute_derivatives {
        let incremental = |key: FloatKey, particle: ParticleIndex| kept.map_or(0.0, |table| table.get(key, particle));
        let entries = reference
            .iter()
            .chain(kept.into_iter().flat_map(|table| table.iter()))
            .map(|(key, particle, _)| (key, particle));
        for (key, particle) in entries {
            let (a, b) = (incremental(key, particle), reference.get(key, particle));
            if (a - b).abs() >= 0.01 + 0.01 * (a + b).abs() {
                mismatch = Some(format!(
                    "derivative of {} on particle {particle:?} is {a} against {b}",
                    key.name()
                ));
                break;
            }
        }
    }

    Ok(match mismatch {
        Some(detail) => Err(ModelError::Invariant(check::raise(
            handler,
            InvariantViolation::IncrementalMismatch {
                restraint: restraint.name().to_string(),
                detail,
            },
        ))),
        None => Ok(score),
    })
}

/// The access window of one scheduled object.
///
/// Everything declared is readable. Outputs are writable; with `inputs_writable` the inputs
/// are too, which is what restraints and `after_evaluate` need to add derivatives.
fn declared_locks(
    store: &AttributeStore,
    schedule: &Schedule,
    node: GraphNode,
    inputs_writable: bool,
) -> Option<AccessLocks> {
    let declaration = schedule.declarations.get(&node)?;
    let mut locks = AccessLocks::default();
    for dependency in declaration.inputs.iter().chain(&declaration.outputs) {
        collect_particles(store, dependency, &mut locks.readable);
    }
    let writable = declaration
        .outputs
        .iter()
        .chain(declaration.inputs.iter().filter(|_| inputs_writable));
    for dependency in writable {
        collect_particles(store, dependency, &mut locks.writable);
        if let Dependency::Container(container) = *dependency {
            locks.writable_containers.insert(container);
        }
    }
    Some(locks)
}

fn collect_particles(
    store: &AttributeStore,
    dependency: &Dependency,
    into: &mut HashSet<ParticleIndex>,
) {
    match *dependency {
        Dependency::Particle(particle) | Dependency::Attribute { particle, .. } => {
            into.insert(particle);
        }
        Dependency::Container(container) => {
            if let Ok(members) = store.container_particles(container) {
                into.extend(members.iter().copied());
            }
        }
    }
}
