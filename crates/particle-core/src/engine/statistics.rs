use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use tracing::info;

use crate::core::ids::{RestraintId, ScoreStateId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreStateStatistics {
    pub name: String,
    pub before_calls: u64,
    pub before_time: Duration,
    pub after_calls: u64,
    pub after_time: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestraintStatistics {
    pub name: String,
    pub calls: u64,
    pub total_time: Duration,
    pub min_score: f64,
    pub max_score: f64,
    pub last_score: f64,
}

/// Timing and score summaries gathered while `gather_statistics` is enabled.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    evaluations: u64,
    total_time: Duration,
    score_states: BTreeMap<ScoreStateId, ScoreStateStatistics>,
    restraints: BTreeMap<RestraintId, RestraintStatistics>,
}

#[derive(Serialize)]
struct StatisticsRow<'a> {
    kind: &'static str,
    name: &'a str,
    phase: &'static str,
    calls: u64,
    total_seconds: f64,
    average_seconds: f64,
    min_score: Option<f64>,
    max_score: Option<f64>,
    last_score: Option<f64>,
}

impl Statistics {
    pub(crate) fn record_evaluation(&mut self, elapsed: Duration) {
        self.evaluations += 1;
        self.total_time += elapsed;
    }

    pub(crate) fn record_before(&mut self, id: ScoreStateId, name: &str, elapsed: Duration) {
        let entry = self.score_state_entry(id, name);
        entry.before_calls += 1;
        entry.before_time += elapsed;
    }

    pub(crate) fn record_after(&mut self, id: ScoreStateId, name: &str, elapsed: Duration) {
        let entry = self.score_state_entry(id, name);
        entry.after_calls += 1;
        entry.after_time += elapsed;
    }

    pub(crate) fn record_restraint(
        &mut self,
        id: RestraintId,
        name: &str,
        score: f64,
        elapsed: Duration,
    ) {
        let entry = self
            .restraints
            .entry(id)
            .or_insert_with(|| RestraintStatistics {
                name: name.to_string(),
                calls: 0,
                total_time: Duration::ZERO,
                min_score: f64::INFINITY,
                max_score: f64::NEG_INFINITY,
                last_score: 0.0,
            });
        entry.calls += 1;
        entry.total_time += elapsed;
        entry.min_score = entry.min_score.min(score);
        entry.max_score = entry.max_score.max(score);
        entry.last_score = score;
    }

    fn score_state_entry(&mut self, id: ScoreStateId, name: &str) -> &mut ScoreStateStatistics {
        self.score_states
            .entry(id)
            .or_insert_with(|| ScoreStateStatistics {
                name: name.to_string(),
                ..Default::default()
            })
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn score_state(&self, id: ScoreStateId) -> Option<&ScoreStateStatistics> {
        self.score_states.get(&id)
    }

    pub fn restraint(&self, id: RestraintId) -> Option<&RestraintStatistics> {
        self.restraints.get(&id)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Logs one line per object at `info` level.
    pub fn log_summary(&self) {
        info!(
            evaluations = self.evaluations,
            total_ms = self.total_time.as_secs_f64() * 1e3,
            "Evaluation statistics"
        );
        for stats in self.score_states.values() {
            info!(
                name = %stats.name,
                before_calls = stats.before_calls,
                before_ms = stats.before_time.as_secs_f64() * 1e3,
                after_calls = stats.after_calls,
                after_ms = stats.after_time.as_secs_f64() * 1e3,
                "Score state"
            );
        }
        for stats in self.restraints.values() {
            info!(
                name = %stats.name,
                calls = stats.calls,
                total_ms = stats.total_time.as_secs_f64() * 1e3,
                min_score = stats.min_score,
                max_score = stats.max_score,
                last_score = stats.last_score,
                "Restraint"
            );
        }
    }

    /// Writes every recorded object as one CSV row, score states first.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_writer(writer);
        for stats in self.score_states.values() {
            for (phase, calls, time) in [
                ("before_evaluate", stats.before_calls, stats.before_time),
                ("after_evaluate", stats.after_calls, stats.after_time),
            ] {
                writer.serialize(StatisticsRow {
                    kind: "score_state",
                    name: &stats.name,
                    phase,
                    calls,
                    total_seconds: time.as_secs_f64(),
                    average_seconds: average(time, calls),
                    min_score: None,
                    max_score: None,
                    last_score: None,
                })?;
            }
        }
        for stats in self.restraints.values() {
            writer.serialize(StatisticsRow {
                kind: "restraint",
                name: &stats.name,
                phase: "evaluate",
                calls: stats.calls,
                total_seconds: stats.total_time.as_secs_f64(),
                average_seconds: average(stats.total_time, stats.calls),
                min_score: Some(stats.min_score),
                max_score: Some(stats.max_score),
                last_score: Some(stats.last_score),
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn average(total: Duration, calls: u64) -> f64 {
    if calls == 0 {
        0.0
    } else {
        total.as_secs_f64() / calls as f64
    }
}
