use crate::config::{self, EngineConfig};
use crate::db::HistoryStore;
use crate::errors::AppResult;
use crate::merge::{MergeEngine, MergeReport, Normalizer};
use crate::metrics::MetricEngine;
use crate::models::{Aggregation, DailyRecord, Goal, MetricReport, PartialFact, RunWarning};
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub merge: MergeReport,
    pub metrics: MetricReport,
    pub records: Vec<DailyRecord>,
}

impl RunReport {
    pub fn warnings(&self) -> &[RunWarning] {
        &self.merge.warnings
    }
}

#[derive(Debug, Clone)]
pub struct DailyPipeline {
    config: EngineConfig,
    goals: Vec<Goal>,
}

impl DailyPipeline {
    pub fn open(config: EngineConfig, goals: Vec<Goal>) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config, goals })
    }

    pub fn from_config(config: EngineConfig) -> AppResult<Self> {
        let goals = config::load_goals(&config.goals_path)?;
        Self::open(config, goals)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    pub fn run(&self, run_date: NaiveDate, normalizers: &[Box<dyn Normalizer>]) -> AppResult<RunReport> {
        self.execute(run_date, |engine, targets| engine.run(normalizers, targets))
    }

    pub fn run_facts(&self, run_date: NaiveDate, facts: &[PartialFact]) -> AppResult<RunReport> {
        self.execute(run_date, |engine, targets| engine.apply(facts, targets))
    }

    fn execute<F>(&self, run_date: NaiveDate, merge: F) -> AppResult<RunReport>
    where
        F: FnOnce(&MergeEngine<'_>, &[NaiveDate]) -> AppResult<MergeReport>,
    {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("daily_run", run_id = %run_id, run_date = %run_date);
        let _entered = span.enter();

        let bounds = self.config.date_bounds(run_date)?;
        let store = HistoryStore::open(&self.config.store_path, bounds, self.config.priority())?;

        let targets = [run_date];
        let engine = MergeEngine::new(&store, &self.config.expected_domains);
        let merge_report = merge(&engine, &targets)?;

        let metric_engine = MetricEngine::new(self.config.week_alignment);
        let metrics = metric_engine.evaluate(&store, &self.goals, run_date)?;
        let start = records_start(&metric_engine, &self.goals, &metrics, run_date, bounds.earliest);
        let records = store.range(start, run_date)?;

        tracing::info!(
            applied = merge_report.applied.len(),
            warnings = merge_report.warnings.len(),
            goals = metrics.results.len(),
            unresolved = metrics.unresolved.len(),
            "daily run finished"
        );

        Ok(RunReport {
            run_id,
            run_date,
            merge: merge_report,
            metrics,
            records,
        })
    }
}

// Streak goals report only the days of the streak they found.
fn records_start(
    engine: &MetricEngine,
    goals: &[Goal],
    metrics: &MetricReport,
    run_date: NaiveDate,
    earliest: NaiveDate,
) -> NaiveDate {
    let windowed: Vec<Goal> = goals
        .iter()
        .filter(|goal| goal.aggregation != Aggregation::Streak)
        .cloned()
        .collect();
    let streak_start = metrics
        .results
        .iter()
        .filter(|result| result.goal.aggregation == Aggregation::Streak)
        .map(|result| result.window_start)
        .min()
        .unwrap_or(run_date);
    engine
        .history_start(&windowed, run_date, earliest)
        .min(streak_start)
        .max(earliest)
}

#[cfg(test)]
mod tests {
    use super::DailyPipeline;
    use crate::config::EngineConfig;
    use crate::models::{Aggregation, ComparisonMode, Domain, Goal, GoalStatus, PartialFact, Period};
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn run_merges_then_evaluates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            store_path: dir.path().join("history.db"),
            expected_domains: vec![Domain::Listening],
            ..EngineConfig::default()
        };
        let goal = Goal::new(Domain::Listening, "minutes", 60.0, Period::Daily, ComparisonMode::Min);
        let pipeline = DailyPipeline::open(config, vec![goal]).expect("pipeline");

        let run_date = NaiveDate::from_ymd_opt(2026, 1, 3).expect("date");
        let at = Utc.with_ymd_and_hms(2026, 1, 3, 22, 0, 0).single().expect("timestamp");
        let facts = vec![PartialFact::new(run_date, Domain::Listening, "spotify", at).with_slot("minutes", 75)];

        let report = pipeline.run_facts(run_date, &facts).expect("run");
        assert!(report.warnings().is_empty());
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.metrics.results[0].status, GoalStatus::Exceeded);

        let again = pipeline.run_facts(run_date, &facts).expect("rerun");
        assert_ne!(again.run_id, report.run_id);
        assert_eq!(again.records, report.records);
        assert_eq!(again.metrics, report.metrics);
    }

    #[test]
    fn streak_goal_records_stop_at_the_streak_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            store_path: dir.path().join("history.db"),
            expected_domains: vec![Domain::Fitness],
            ..EngineConfig::default()
        };
        let goal = Goal {
            aggregation: Aggregation::Streak,
            ..Goal::new(Domain::Fitness, "sessions", 3.0, Period::Daily, ComparisonMode::Min)
        };
        let pipeline = DailyPipeline::open(config, vec![goal]).expect("pipeline");

        let day = |d: u32| NaiveDate::from_ymd_opt(2026, 1, d).expect("date");
        let at = Utc.with_ymd_and_hms(2026, 1, 10, 22, 0, 0).single().expect("timestamp");
        let facts: Vec<PartialFact> = [1, 2, 8, 9, 10]
            .into_iter()
            .map(|d| PartialFact::new(day(d), Domain::Fitness, "sugarwod", at).with_slot("sessions", 1))
            .collect();
        pipeline.run_facts(day(9), &facts[..4]).expect("backfill");

        let report = pipeline.run_facts(day(10), &facts[4..]).expect("run");
        assert_eq!(report.metrics.results[0].actual_value, Some(3.0));
        assert_eq!(report.metrics.results[0].window_start, day(8));
        let dates: Vec<NaiveDate> = report.records.iter().map(|record| record.date).collect();
        assert_eq!(dates, vec![day(8), day(9), day(10)]);
    }
}
