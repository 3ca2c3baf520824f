pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod merge;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod priority;
pub mod report;
pub mod schema;

pub use config::{load_goals, EngineConfig, GoalSet};
pub use db::{DateBounds, HistoryStore};
pub use errors::{AppError, AppResult};
pub use logging::init_tracing;
pub use merge::{validate_fact, MergeEngine, MergeReport, Normalizer};
pub use metrics::{MetricEngine, WeekAlignment};
pub use models::{
    Aggregation, AbsencePolicy, ComparisonMode, DailyRecord, Domain, Goal, GoalStatus, MetricReport, MetricResult,
    PartialFact, Period, Progress, RunWarning, SlotValue, WeekTally,
};
pub use pipeline::{DailyPipeline, RunReport};
pub use priority::SourcePriority;
pub use report::{export_history_csv, write_run_summary};
