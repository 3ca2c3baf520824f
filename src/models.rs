use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    Fitness,
    Listening,
    Reading,
    Calendar,
    Finance,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Fitness,
        Domain::Listening,
        Domain::Reading,
        Domain::Calendar,
        Domain::Finance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fitness => "fitness",
            Self::Listening => "listening",
            Self::Reading => "reading",
            Self::Calendar => "calendar",
            Self::Finance => "finance",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fitness" => Some(Self::Fitness),
            "listening" => Some(Self::Listening),
            "reading" => Some(Self::Reading),
            "calendar" => Some(Self::Calendar),
            "finance" => Some(Self::Finance),
            _ => None,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotKind {
    Count,
    Quantity,
    Flag,
    Text,
}

impl SlotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Quantity => "quantity",
            Self::Flag => "flag",
            Self::Text => "text",
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SlotValue {
    Count(u64),
    Quantity(f64),
    Flag(bool),
    Text(String),
}

impl SlotValue {
    pub fn kind(&self) -> SlotKind {
        match self {
            Self::Count(_) => SlotKind::Count,
            Self::Quantity(_) => SlotKind::Quantity,
            Self::Flag(_) => SlotKind::Flag,
            Self::Text(_) => SlotKind::Text,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Count(value) => Some(*value as f64),
            Self::Quantity(value) => Some(*value),
            Self::Flag(value) => Some(if *value { 1.0 } else { 0.0 }),
            Self::Text(_) => None,
        }
    }

    pub fn qualifies(&self) -> bool {
        match self {
            Self::Count(value) => *value > 0,
            Self::Quantity(value) => *value > 0.0,
            Self::Flag(value) => *value,
            Self::Text(value) => !value.trim().is_empty(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Count(value) => serde_json::Value::from(*value),
            Self::Quantity(value) => serde_json::Value::from(*value),
            Self::Flag(value) => serde_json::Value::Bool(*value),
            Self::Text(value) => serde_json::Value::String(value.clone()),
        }
    }
}

impl fmt::Display for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(value) => write!(f, "{}", value),
            Self::Quantity(value) => write!(f, "{}", value),
            Self::Flag(value) => write!(f, "{}", value),
            Self::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotEntry {
    pub value: SlotValue,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
}

// A missing domain means nothing was ingested, not zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub schema_version: u32,
    pub slots: BTreeMap<Domain, BTreeMap<String, SlotEntry>>,
}

impl DailyRecord {
    pub fn new(date: NaiveDate, schema_version: u32) -> Self {
        Self {
            date,
            schema_version,
            slots: BTreeMap::new(),
        }
    }

    pub fn slot(&self, domain: Domain, slot: &str) -> Option<&SlotEntry> {
        self.slots.get(&domain).and_then(|slots| slots.get(slot))
    }

    pub fn value(&self, domain: Domain, slot: &str) -> Option<&SlotValue> {
        self.slot(domain, slot).map(|entry| &entry.value)
    }

    pub fn has_domain(&self, domain: Domain) -> bool {
        self.slots.get(&domain).map(|slots| !slots.is_empty()).unwrap_or(false)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.values().map(BTreeMap::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFact {
    pub date: String,
    pub domain: String,
    pub source: String,
    pub ingested_at: String,
    #[serde(default)]
    pub slots: serde_json::Map<String, serde_json::Value>,
}

impl PartialFact {
    pub fn new(date: NaiveDate, domain: Domain, source: &str, ingested_at: DateTime<Utc>) -> Self {
        Self {
            date: date.format(DATE_FORMAT).to_string(),
            domain: domain.as_str().to_string(),
            source: source.to_string(),
            ingested_at: ingested_at.to_rfc3339(),
            slots: serde_json::Map::new(),
        }
    }

    pub fn with_slot(mut self, slot: &str, value: impl Into<serde_json::Value>) -> Self {
        self.slots.insert(slot.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedFact {
    pub date: NaiveDate,
    pub domain: Domain,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub slots: BTreeMap<String, SlotValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Period {
    Daily,
    Weekly,
    Yearly,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Yearly => "yearly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonMode {
    Min,
    Max,
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregation {
    #[default]
    Sum,
    Count,
    Mean,
    Streak,
    RateOfChange,
    WeeksMet,
}

impl Aggregation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Mean => "mean",
            Self::Streak => "streak",
            Self::RateOfChange => "rate-of-change",
            Self::WeeksMet => "weeks-met",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbsencePolicy {
    #[default]
    Excluded,
    Zero,
}

fn default_trailing_periods() -> u32 {
    1
}

fn default_weekly_threshold() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub domain: String,
    pub metric: String,
    pub target: f64,
    pub period: Period,
    pub comparison_mode: ComparisonMode,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default = "default_trailing_periods")]
    pub trailing_periods: u32,
    #[serde(default)]
    pub absence: AbsencePolicy,
    #[serde(default = "default_weekly_threshold")]
    pub weekly_threshold: f64,
}

impl Goal {
    pub fn new(domain: Domain, metric: &str, target: f64, period: Period, comparison_mode: ComparisonMode) -> Self {
        Self {
            name: None,
            domain: domain.as_str().to_string(),
            metric: metric.to_string(),
            target,
            period,
            comparison_mode,
            aggregation: Aggregation::Sum,
            trailing_periods: default_trailing_periods(),
            absence: AbsencePolicy::Excluded,
            weekly_threshold: default_weekly_threshold(),
        }
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_absence(mut self, absence: AbsencePolicy) -> Self {
        self.absence = absence;
        self
    }

    pub fn label(&self) -> String {
        match self.name.as_deref().map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("{}.{}/{}", self.domain, self.metric, self.period.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", content = "value", rename_all = "kebab-case")]
pub enum Progress {
    Ratio(f64),
    Deviation(f64),
    Undefined,
}

impl Progress {
    pub fn ratio(&self) -> Option<f64> {
        match self {
            Self::Ratio(value) => Some(*value),
            _ => None,
        }
    }

    pub fn deviation(&self) -> Option<f64> {
        match self {
            Self::Deviation(value) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GoalStatus {
    Behind,
    Met,
    Exceeded,
    NoData,
}

impl GoalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Behind => "behind",
            Self::Met => "met",
            Self::Exceeded => "exceeded",
            Self::NoData => "no-data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trend {
    pub direction: TrendDirection,
    pub previous_value: Option<f64>,
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pace {
    pub expected_to_date: f64,
    pub elapsed_days: u32,
    pub period_days: u32,
    pub on_pace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekTally {
    pub met: u32,
    pub observed: u32,
    pub completion_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricResult {
    pub goal: Goal,
    pub period: Period,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub actual_value: Option<f64>,
    pub target_value: f64,
    pub progress: Progress,
    pub status: GoalStatus,
    pub achieved: bool,
    pub days_with_data: u32,
    pub trend: Trend,
    pub pace: Option<Pace>,
    pub weeks: Option<WeekTally>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedGoal {
    pub goal: Goal,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricReport {
    pub results: Vec<MetricResult>,
    pub unresolved: Vec<UnresolvedGoal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictingValue {
    pub source: String,
    pub value: SlotValue,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotConflict {
    pub date: NaiveDate,
    pub domain: Domain,
    pub slot: String,
    pub winner: ConflictingValue,
    pub overridden: Vec<ConflictingValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunWarning {
    SourceMissing {
        date: NaiveDate,
        domain: Domain,
        source: Option<String>,
        reason: String,
    },
    ConflictOverride(SlotConflict),
    RejectedFact {
        date: String,
        domain: String,
        source: String,
        reason: String,
    },
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceMissing {
                date,
                domain,
                source,
                reason,
            } => match source {
                Some(source) => write!(f, "SOURCE_MISSING {} {} ({}): {}", date, domain, source, reason),
                None => write!(f, "SOURCE_MISSING {} {}: {}", date, domain, reason),
            },
            Self::ConflictOverride(conflict) => {
                let overridden = conflict
                    .overridden
                    .iter()
                    .map(|value| format!("{}={}", value.source, value.value))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(
                    f,
                    "CONFLICT_OVERRIDE {} {}.{}: kept {}={} over {}",
                    conflict.date,
                    conflict.domain,
                    conflict.slot,
                    conflict.winner.source,
                    conflict.winner.value,
                    overridden
                )
            }
            Self::RejectedFact {
                date,
                domain,
                source,
                reason,
            } => write!(f, "REJECTED_FACT {} {} ({}): {}", date, domain, source, reason),
        }
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_round_trips_through_its_name() {
        for domain in Domain::ALL {
            assert_eq!(Domain::parse(domain.as_str()), Some(domain));
        }
        assert_eq!(Domain::parse(" Fitness "), Some(Domain::Fitness));
        assert_eq!(Domain::parse("shows"), None);
    }

    #[test]
    fn zero_is_present_but_not_qualifying() {
        let zero = SlotValue::Count(0);
        assert_eq!(zero.as_number(), Some(0.0));
        assert!(!zero.qualifies());
        assert!(SlotValue::Flag(true).qualifies());
        assert_eq!(SlotValue::Text("Gojira".to_string()).as_number(), None);
    }

    #[test]
    fn goal_deserializes_with_defaults() {
        let goal: Goal = serde_yaml::from_str(
            "domain: listening\nmetric: minutes\ntarget: 300\nperiod: weekly\ncomparisonMode: min\n",
        )
        .expect("goal yaml");
        assert_eq!(goal.aggregation, Aggregation::Sum);
        assert_eq!(goal.absence, AbsencePolicy::Excluded);
        assert_eq!(goal.trailing_periods, 1);
        assert_eq!(goal.label(), "listening.minutes/weekly");
    }

    #[test]
    fn rate_of_change_aggregation_uses_kebab_case() {
        let goal: Goal = serde_yaml::from_str(
            "name: Miles trend\ndomain: fitness\nmetric: runningMiles\ntarget: 1\nperiod: weekly\ncomparisonMode: min\naggregation: rate-of-change\ntrailingPeriods: 4\n",
        )
        .expect("goal yaml");
        assert_eq!(goal.aggregation, Aggregation::RateOfChange);
        assert_eq!(goal.trailing_periods, 4);
        assert_eq!(goal.label(), "Miles trend");
    }

    #[test]
    fn partial_fact_builder_uses_wire_formats() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 3).expect("date");
        let at = DateTime::parse_from_rfc3339("2026-01-03T12:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let fact = PartialFact::new(date, Domain::Fitness, "sugarwod", at).with_slot("sessions", 1);
        assert_eq!(fact.date, "2026-01-03");
        assert_eq!(fact.domain, "fitness");
        assert_eq!(fact.slots.get("sessions"), Some(&serde_json::json!(1)));
    }
}
