use crate::db::HistoryStore;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AbsencePolicy, Aggregation, ComparisonMode, DailyRecord, Domain, Goal, GoalStatus, MetricReport, MetricResult,
    Pace, Period, Progress, Trend, TrendDirection, UnresolvedGoal, WeekTally,
};
use crate::schema::{self, SlotSpec};
use chrono::{Datelike, Days, IsoWeek, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WeekAlignment {
    #[default]
    Iso,
    Trailing,
}

type History<'a> = BTreeMap<NaiveDate, &'a DailyRecord>;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Aggregate {
    value: Option<f64>,
    days_with_data: u32,
    window_start: NaiveDate,
    weeks: Option<WeekTally>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricEngine {
    week_alignment: WeekAlignment,
}

impl MetricEngine {
    pub fn new(week_alignment: WeekAlignment) -> Self {
        Self { week_alignment }
    }

    pub fn week_alignment(&self) -> WeekAlignment {
        self.week_alignment
    }

    pub fn evaluate(&self, store: &HistoryStore, goals: &[Goal], run_date: NaiveDate) -> AppResult<MetricReport> {
        let start = self.history_start(goals, run_date, store.bounds().earliest);
        let records = if start <= run_date {
            store.range(start, run_date)?
        } else {
            Vec::new()
        };
        Ok(self.evaluate_records(&records, goals, run_date))
    }

    pub fn history_start(&self, goals: &[Goal], run_date: NaiveDate, earliest: NaiveDate) -> NaiveDate {
        goals
            .iter()
            .map(|goal| match goal.aggregation {
                Aggregation::Streak => earliest,
                aggregation => {
                    // Trend evaluates the same aggregation one period back.
                    let lookback = match aggregation {
                        Aggregation::RateOfChange => goal.trailing_periods.max(1) + 1,
                        _ => 1,
                    };
                    let anchor = shift_back(goal.period, run_date, lookback);
                    self.window(goal.period, anchor).0
                }
            })
            .min()
            .unwrap_or(run_date)
            .max(earliest)
    }

    pub fn evaluate_records(&self, records: &[DailyRecord], goals: &[Goal], run_date: NaiveDate) -> MetricReport {
        let history = index(records, run_date);
        let mut report = MetricReport::default();
        for goal in goals {
            match self.compute(&history, goal, run_date) {
                Ok(result) => {
                    tracing::debug!(
                        goal = %goal.label(),
                        actual = ?result.actual_value,
                        status = result.status.as_str(),
                        "goal evaluated"
                    );
                    report.results.push(result);
                }
                Err(error) => {
                    tracing::warn!(goal = %goal.label(), error = %error, "goal unresolvable; skipping");
                    report.unresolved.push(UnresolvedGoal {
                        goal: goal.clone(),
                        reason: error.to_string(),
                    });
                }
            }
        }
        report
    }

    pub fn evaluate_goal(&self, records: &[DailyRecord], goal: &Goal, run_date: NaiveDate) -> AppResult<MetricResult> {
        self.compute(&index(records, run_date), goal, run_date)
    }

    pub fn window(&self, period: Period, anchor: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = match period {
            Period::Daily => anchor,
            Period::Weekly => match self.week_alignment {
                WeekAlignment::Iso => sub_days(anchor, u64::from(anchor.weekday().num_days_from_monday())),
                WeekAlignment::Trailing => sub_days(anchor, 6),
            },
            Period::Yearly => NaiveDate::from_ymd_opt(anchor.year(), 1, 1).unwrap_or(anchor),
        };
        (start, anchor)
    }

    fn compute(&self, history: &History<'_>, goal: &Goal, run_date: NaiveDate) -> AppResult<MetricResult> {
        let (domain, spec) = resolve(goal)?;
        let current = self.aggregate(history, goal, domain, spec, run_date);
        let previous = self.aggregate(history, goal, domain, spec, shift_back(goal.period, run_date, 1));
        let (window_start, window_end) = match goal.aggregation {
            Aggregation::Streak => (current.window_start, run_date),
            _ => self.window(goal.period, run_date),
        };

        let (progress, status, achieved) = score(goal.comparison_mode, current.value, goal.target);
        let pace = self.pace(goal, current.value, window_start, run_date);

        Ok(MetricResult {
            goal: goal.clone(),
            period: goal.period,
            window_start,
            window_end,
            actual_value: current.value,
            target_value: goal.target,
            progress,
            status,
            achieved,
            days_with_data: current.days_with_data,
            trend: trend(current.value, previous.value),
            pace,
            weeks: current.weeks,
        })
    }

    fn aggregate(&self, history: &History<'_>, goal: &Goal, domain: Domain, spec: SlotSpec, anchor: NaiveDate) -> Aggregate {
        match goal.aggregation {
            Aggregation::Streak => streak(history, domain, spec.name, anchor),
            Aggregation::WeeksMet => self.weeks_met(history, goal, domain, spec, anchor),
            Aggregation::RateOfChange => {
                let now = self.aggregate_window(history, goal, domain, spec, anchor);
                let past_anchor = shift_back(goal.period, anchor, goal.trailing_periods);
                let past = self.aggregate_window(history, goal, domain, spec, past_anchor);
                let value = match (now.value, past.value) {
                    (Some(now), Some(past)) => Some((now - past) / f64::from(goal.trailing_periods)),
                    _ => None,
                };
                Aggregate { value, ..now }
            }
            _ => self.aggregate_window(history, goal, domain, spec, anchor),
        }
    }

    fn aggregate_window(&self, history: &History<'_>, goal: &Goal, domain: Domain, spec: SlotSpec, anchor: NaiveDate) -> Aggregate {
        let (start, end) = self.window(goal.period, anchor);
        let mut present: Vec<f64> = Vec::new();
        let mut days_with_data = 0u32;
        let mut window_days = 0u32;
        for date in start.iter_days().take_while(|date| *date <= end) {
            window_days += 1;
            if let Some(value) = history.get(&date).and_then(|record| record.value(domain, spec.name)) {
                days_with_data += 1;
                if let Some(number) = value.as_number() {
                    present.push(number);
                }
            }
        }

        let zero_filled = goal.absence == AbsencePolicy::Zero;
        let sum: f64 = present.iter().sum();
        let value = match goal.aggregation {
            Aggregation::Count => Some(f64::from(days_with_data)),
            Aggregation::Mean if zero_filled => Some(sum / f64::from(window_days.max(1))),
            Aggregation::Mean if present.is_empty() => None,
            Aggregation::Mean => Some(sum / present.len() as f64),
            _ if present.is_empty() && !zero_filled => None,
            _ => Some(sum),
        };
        Aggregate {
            value,
            days_with_data,
            window_start: start,
            weeks: None,
        }
    }

    fn weeks_met(
        &self,
        history: &History<'_>,
        goal: &Goal,
        domain: Domain,
        spec: SlotSpec,
        anchor: NaiveDate,
    ) -> Aggregate {
        let (start, end) = self.window(goal.period, anchor);
        let mut weeks: BTreeMap<IsoWeek, f64> = BTreeMap::new();
        let mut days_with_data = 0u32;
        for date in start.iter_days().take_while(|date| *date <= end) {
            if let Some(number) = history
                .get(&date)
                .and_then(|record| record.value(domain, spec.name))
                .and_then(|value| value.as_number())
            {
                days_with_data += 1;
                *weeks.entry(date.iso_week()).or_insert(0.0) += number;
            }
        }

        let observed = weeks.len() as u32;
        let met = weeks
            .values()
            .filter(|total| **total >= goal.weekly_threshold - EPSILON)
            .count() as u32;
        let tally = WeekTally {
            met,
            observed,
            completion_rate: (observed > 0).then(|| f64::from(met) / f64::from(observed)),
        };
        Aggregate {
            value: (observed > 0).then_some(f64::from(met)),
            days_with_data,
            window_start: start,
            weeks: Some(tally),
        }
    }

    fn pace(&self, goal: &Goal, actual: Option<f64>, window_start: NaiveDate, run_date: NaiveDate) -> Option<Pace> {
        if !matches!(goal.aggregation, Aggregation::Sum | Aggregation::Count) {
            return None;
        }
        if goal.comparison_mode == ComparisonMode::Exact {
            return None;
        }
        let period_days = match goal.period {
            Period::Daily => return None,
            Period::Weekly => 7,
            Period::Yearly => days_in_year(run_date.year()),
        };
        let actual = actual?;
        let elapsed_days = (run_date - window_start).num_days() as u32 + 1;
        let expected_to_date = goal.target * f64::from(elapsed_days) / f64::from(period_days);
        let on_pace = match goal.comparison_mode {
            ComparisonMode::Max => actual <= expected_to_date + EPSILON,
            _ => actual >= expected_to_date - EPSILON,
        };
        Some(Pace {
            expected_to_date,
            elapsed_days,
            period_days,
            on_pace,
        })
    }
}

fn index(records: &[DailyRecord], run_date: NaiveDate) -> History<'_> {
    records
        .iter()
        .filter(|record| record.date <= run_date)
        .map(|record| (record.date, record))
        .collect()
}

fn resolve(goal: &Goal) -> AppResult<(Domain, SlotSpec)> {
    let domain = Domain::parse(&goal.domain)
        .ok_or_else(|| AppError::GoalUnresolvable(format!("{}: unknown domain '{}'", goal.label(), goal.domain)))?;
    let spec = schema::lookup(domain, goal.metric.trim()).ok_or_else(|| {
        AppError::GoalUnresolvable(format!(
            "{}: unknown slot {}",
            goal.label(),
            schema::column_name(domain, &goal.metric)
        ))
    })?;
    if !goal.target.is_finite() {
        return Err(AppError::GoalUnresolvable(format!("{}: target must be finite", goal.label())));
    }
    if !spec.kind.is_numeric() && !matches!(goal.aggregation, Aggregation::Count | Aggregation::Streak) {
        return Err(AppError::GoalUnresolvable(format!(
            "{}: {} is a text slot and cannot be aggregated with {}",
            goal.label(),
            schema::column_name(domain, spec.name),
            goal.aggregation.as_str()
        )));
    }
    if goal.aggregation == Aggregation::WeeksMet {
        if goal.period == Period::Daily {
            return Err(AppError::GoalUnresolvable(format!(
                "{}: weeks-met needs a weekly or yearly period",
                goal.label()
            )));
        }
        if !goal.weekly_threshold.is_finite() || goal.weekly_threshold <= 0.0 {
            return Err(AppError::GoalUnresolvable(format!(
                "{}: weeklyThreshold must be a positive number",
                goal.label()
            )));
        }
    }
    if goal.aggregation == Aggregation::RateOfChange && goal.trailing_periods == 0 {
        return Err(AppError::GoalUnresolvable(format!(
            "{}: trailingPeriods must be at least 1",
            goal.label()
        )));
    }
    Ok((domain, spec))
}

fn streak(history: &History<'_>, domain: Domain, slot: &str, anchor: NaiveDate) -> Aggregate {
    let mut length = 0u32;
    let mut start = anchor;
    let mut cursor = Some(anchor);
    while let Some(date) = cursor {
        let qualifies = history
            .get(&date)
            .and_then(|record| record.value(domain, slot))
            .map(|value| value.qualifies())
            .unwrap_or(false);
        if !qualifies {
            break;
        }
        length += 1;
        start = date;
        cursor = date.pred_opt();
    }
    Aggregate {
        value: Some(f64::from(length)),
        days_with_data: length,
        window_start: start,
        weeks: None,
    }
}

fn score(mode: ComparisonMode, actual: Option<f64>, target: f64) -> (Progress, GoalStatus, bool) {
    let Some(actual) = actual else {
        return (Progress::Undefined, GoalStatus::NoData, false);
    };
    let deviation = actual - target;
    let status = if deviation.abs() <= EPSILON {
        GoalStatus::Met
    } else if deviation > 0.0 {
        GoalStatus::Exceeded
    } else {
        GoalStatus::Behind
    };
    let achieved = match mode {
        ComparisonMode::Min => deviation >= -EPSILON,
        ComparisonMode::Max => deviation <= EPSILON,
        ComparisonMode::Exact => deviation.abs() <= EPSILON,
    };
    let progress = match mode {
        ComparisonMode::Exact => Progress::Deviation(deviation),
        _ if target.abs() <= EPSILON => Progress::Undefined,
        _ => Progress::Ratio(actual / target),
    };
    (progress, status, achieved)
}

fn trend(current: Option<f64>, previous: Option<f64>) -> Trend {
    match (current, previous) {
        (Some(current), Some(previous)) => {
            let delta = current - previous;
            let direction = if delta.abs() <= EPSILON {
                TrendDirection::Flat
            } else if delta > 0.0 {
                TrendDirection::Up
            } else {
                TrendDirection::Down
            };
            Trend {
                direction,
                previous_value: Some(previous),
                delta: Some(delta),
            }
        }
        (_, previous) => Trend {
            direction: TrendDirection::Unknown,
            previous_value: previous,
            delta: None,
        },
    }
}

// Feb 29 maps to Feb 28 in non-leap years.
fn shift_back(period: Period, anchor: NaiveDate, periods: u32) -> NaiveDate {
    match period {
        Period::Daily => sub_days(anchor, u64::from(periods)),
        Period::Weekly => sub_days(anchor, 7 * u64::from(periods)),
        Period::Yearly => {
            let year = anchor.year() - periods as i32;
            anchor
                .with_year(year)
                .or_else(|| NaiveDate::from_ymd_opt(year, anchor.month(), 28))
                .unwrap_or(NaiveDate::MIN)
        }
    }
}

fn sub_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN)
}

fn days_in_year(year: i32) -> u32 {
    NaiveDate::from_ymd_opt(year, 12, 31)
        .map(|date| date.ordinal())
        .unwrap_or(365)
}
