use crate::db::DateBounds;
use crate::errors::{AppError, AppResult};
use crate::metrics::WeekAlignment;
use crate::models::{Domain, Goal};
use crate::priority::SourcePriority;
use crate::schema;
use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

fn default_store_path() -> PathBuf {
    PathBuf::from("data/daily/history.db")
}

fn default_home_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_expected_domains() -> Vec<Domain> {
    Domain::ALL.to_vec()
}

fn default_earliest_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn default_max_future_days() -> u32 {
    1
}

fn default_goals_path() -> PathBuf {
    PathBuf::from("goals/goals.yaml")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("data/daily")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_home_utc_offset")]
    pub home_utc_offset: String,
    #[serde(default)]
    pub source_priority: Vec<String>,
    #[serde(default = "default_expected_domains")]
    pub expected_domains: Vec<Domain>,
    #[serde(default = "default_earliest_date")]
    pub earliest_date: NaiveDate,
    #[serde(default = "default_max_future_days")]
    pub max_future_days: u32,
    #[serde(default)]
    pub week_alignment: WeekAlignment,
    #[serde(default = "default_goals_path")]
    pub goals_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            home_utc_offset: default_home_utc_offset(),
            source_priority: Vec::new(),
            expected_domains: default_expected_domains(),
            earliest_date: default_earliest_date(),
            max_future_days: default_max_future_days(),
            week_alignment: WeekAlignment::default(),
            goals_path: default_goals_path(),
            log_dir: default_log_dir(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|error| AppError::Config(format!("cannot read {}: {}", path.display(), error)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.home_offset()?;
        let mut seen = BTreeSet::new();
        for source in &self.source_priority {
            schema::validate_source(source).map_err(|error| AppError::Config(error.to_string()))?;
            if !seen.insert(source.as_str()) {
                return Err(AppError::Config(format!(
                    "source '{}' listed twice in sourcePriority",
                    source
                )));
            }
        }
        Ok(())
    }

    pub fn home_offset(&self) -> AppResult<FixedOffset> {
        self.home_utc_offset.trim().parse::<FixedOffset>().map_err(|error| {
            AppError::Config(format!(
                "homeUtcOffset '{}' is not a UTC offset: {}",
                self.home_utc_offset, error
            ))
        })
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> AppResult<NaiveDate> {
        Ok(instant.with_timezone(&self.home_offset()?).date_naive())
    }

    pub fn today(&self) -> AppResult<NaiveDate> {
        self.local_date(Utc::now())
    }

    pub fn priority(&self) -> SourcePriority {
        SourcePriority::new(self.source_priority.iter().cloned())
    }

    pub fn date_bounds(&self, run_date: NaiveDate) -> AppResult<DateBounds> {
        let latest = run_date
            .checked_add_days(Days::new(u64::from(self.max_future_days)))
            .unwrap_or(NaiveDate::MAX);
        if self.earliest_date > run_date {
            return Err(AppError::Config(format!(
                "earliestDate {} is after run date {}",
                self.earliest_date, run_date
            )));
        }
        Ok(DateBounds::new(self.earliest_date, latest))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalSet {
    #[serde(default)]
    pub goals: Vec<Goal>,
}

pub fn load_goals(path: &Path) -> AppResult<Vec<Goal>> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "goal file not found; evaluating no goals");
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .map_err(|error| AppError::Config(format!("cannot read {}: {}", path.display(), error)))?;
    let set: GoalSet = serde_yaml::from_str(&raw)?;
    Ok(set.goals)
}

#[cfg(test)]
mod tests {
    use super::{load_goals, EngineConfig};
    use crate::metrics::WeekAlignment;
    use crate::models::{Aggregation, Domain, Period};
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn empty_yaml_uses_defaults() {
        let config = EngineConfig::from_yaml("{}").expect("defaults");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.expected_domains.len(), 5);
        assert_eq!(config.week_alignment, WeekAlignment::Iso);
    }

    #[test]
    fn parses_camel_case_fields() {
        let config = EngineConfig::from_yaml(
            "storePath: /tmp/history.db\nhomeUtcOffset: \"-05:00\"\nsourcePriority: [sugarwod, manual]\nexpectedDomains: [fitness, listening]\nmaxFutureDays: 0\nweekAlignment: trailing\n",
        )
        .expect("config");
        assert_eq!(config.source_priority, vec!["sugarwod", "manual"]);
        assert_eq!(config.expected_domains, vec![Domain::Fitness, Domain::Listening]);
        assert_eq!(config.week_alignment, WeekAlignment::Trailing);
        assert_eq!(config.priority().rank("manual"), Some(1));

        let late_evening = Utc.with_ymd_and_hms(2026, 1, 4, 3, 30, 0).single().expect("timestamp");
        assert_eq!(
            config.local_date(late_evening).expect("local date"),
            NaiveDate::from_ymd_opt(2026, 1, 3).expect("date")
        );
    }

    #[test]
    fn rejects_duplicate_priority_and_bad_offset() {
        let duplicate = EngineConfig::from_yaml("sourcePriority: [sugarwod, sugarwod]\n").expect_err("duplicate");
        assert!(duplicate.to_string().starts_with("CONFIG_INVALID"));
        assert!(EngineConfig::from_yaml("homeUtcOffset: Mountain\n").is_err());
        assert!(EngineConfig::from_yaml("weekAlignment: fortnight\n").is_err());
    }

    #[test]
    fn date_bounds_follow_run_date() {
        let config = EngineConfig::default();
        let run_date = NaiveDate::from_ymd_opt(2026, 1, 3).expect("date");
        let bounds = config.date_bounds(run_date).expect("bounds");
        assert_eq!(bounds.latest, NaiveDate::from_ymd_opt(2026, 1, 4).expect("date"));
        assert!(bounds.contains(NaiveDate::from_ymd_opt(2000, 1, 1).expect("date")));
        assert!(!bounds.contains(NaiveDate::from_ymd_opt(2026, 1, 5).expect("date")));

        let ancient = NaiveDate::from_ymd_opt(1999, 12, 31).expect("date");
        assert!(config.date_bounds(ancient).is_err());
    }

    #[test]
    fn goal_file_loads_and_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("goals.yaml");
        assert!(load_goals(&path).expect("missing file").is_empty());

        std::fs::write(
            &path,
            "goals:\n  - domain: reading\n    metric: booksFinished\n    target: 40\n    period: yearly\n    comparisonMode: min\n  - name: Workout streak\n    domain: fitness\n    metric: sessions\n    target: 5\n    period: daily\n    comparisonMode: min\n    aggregation: streak\n",
        )
        .expect("write goals");
        let goals = load_goals(&path).expect("goals");
        assert_eq!(goals.len(), 2);
        assert_eq!(goals[0].period, Period::Yearly);
        assert_eq!(goals[1].aggregation, Aggregation::Streak);
    }
}
