use crate::db::{DateBounds, HistoryStore};
use crate::errors::{AppError, AppResult};
use crate::models::{parse_date, Domain, PartialFact, RunWarning, SlotValue, ValidatedFact};
use crate::schema;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub trait Normalizer {
    fn source(&self) -> &str;
    fn domain(&self) -> Domain;
    fn collect(&self, dates: &[NaiveDate]) -> anyhow::Result<Vec<PartialFact>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedGroup {
    pub date: NaiveDate,
    pub domain: Domain,
    pub source: String,
    pub slots: usize,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub applied: Vec<AppliedGroup>,
    pub warnings: Vec<RunWarning>,
    pub dates: BTreeSet<NaiveDate>,
}

impl MergeReport {
    pub fn conflict_count(&self) -> usize {
        self.warnings
            .iter()
            .filter(|warning| matches!(warning, RunWarning::ConflictOverride(_)))
            .count()
    }

    pub fn missing(&self) -> Vec<(NaiveDate, Domain)> {
        self.warnings
            .iter()
            .filter_map(|warning| match warning {
                RunWarning::SourceMissing { date, domain, .. } => Some((*date, *domain)),
                _ => None,
            })
            .collect()
    }

    pub fn rejected_count(&self) -> usize {
        self.warnings
            .iter()
            .filter(|warning| matches!(warning, RunWarning::RejectedFact { .. }))
            .count()
    }
}

struct MergedGroup {
    date: NaiveDate,
    domain: Domain,
    source: String,
    slots: BTreeMap<String, SlotValue>,
    ingested_at: DateTime<Utc>,
}

pub struct MergeEngine<'a> {
    store: &'a HistoryStore,
    expected_domains: Vec<Domain>,
}

impl<'a> MergeEngine<'a> {
    pub fn new(store: &'a HistoryStore, expected_domains: &[Domain]) -> Self {
        let mut expected_domains = expected_domains.to_vec();
        expected_domains.sort();
        expected_domains.dedup();
        Self {
            store,
            expected_domains,
        }
    }

    pub fn apply(&self, facts: &[PartialFact], target_dates: &[NaiveDate]) -> AppResult<MergeReport> {
        self.apply_with(facts, target_dates, &self.expected_domains, MergeReport::default())
    }

    pub fn run(&self, normalizers: &[Box<dyn Normalizer>], target_dates: &[NaiveDate]) -> AppResult<MergeReport> {
        let mut report = MergeReport::default();
        let mut facts = Vec::new();
        let mut expected = self.expected_domains.clone();

        for normalizer in normalizers {
            let source = normalizer.source().to_string();
            let domain = normalizer.domain();
            if !expected.contains(&domain) {
                expected.push(domain);
            }
            match normalizer.collect(target_dates) {
                Ok(mut collected) => {
                    tracing::debug!(source = %source, domain = %domain, facts = collected.len(), "normalizer collected");
                    facts.append(&mut collected);
                }
                Err(error) => {
                    tracing::warn!(
                        source = %source,
                        domain = %domain,
                        error = %format!("{:#}", error),
                        "normalizer failed; continuing without it"
                    );
                    for date in target_dates {
                        report.warnings.push(RunWarning::SourceMissing {
                            date: *date,
                            domain,
                            source: Some(source.clone()),
                            reason: format!("{:#}", error),
                        });
                    }
                }
            }
        }

        expected.sort();
        self.apply_with(&facts, target_dates, &expected, report)
    }

    fn apply_with(
        &self,
        facts: &[PartialFact],
        target_dates: &[NaiveDate],
        expected: &[Domain],
        mut report: MergeReport,
    ) -> AppResult<MergeReport> {
        let by_date = self.group(facts, &mut report);
        let priority = self.store.priority();
        let mut covered: BTreeSet<(NaiveDate, Domain)> = BTreeSet::new();

        for (date, mut groups) in by_date {
            groups.sort_by(|a, b| {
                priority
                    .compare((a.source.as_str(), a.ingested_at), (b.source.as_str(), b.ingested_at))
                    .then_with(|| a.domain.cmp(&b.domain))
            });

            let mut touched: BTreeSet<Domain> = BTreeSet::new();
            for group in groups {
                match self
                    .store
                    .upsert_slots(group.date, group.domain, &group.slots, &group.source, group.ingested_at)
                {
                    Ok(_) => {
                        touched.insert(group.domain);
                        covered.insert((group.date, group.domain));
                        report.dates.insert(group.date);
                        report.applied.push(AppliedGroup {
                            date: group.date,
                            domain: group.domain,
                            source: group.source,
                            slots: group.slots.len(),
                            ingested_at: group.ingested_at,
                        });
                    }
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(error) => {
                        tracing::warn!(
                            date = %group.date,
                            domain = %group.domain,
                            source = %group.source,
                            error = %error,
                            "group rejected by history store"
                        );
                        report.warnings.push(RunWarning::RejectedFact {
                            date: group.date.to_string(),
                            domain: group.domain.to_string(),
                            source: group.source,
                            reason: error.to_string(),
                        });
                    }
                }
            }

            for domain in touched {
                for conflict in self.store.conflicts(date, domain)? {
                    tracing::warn!(
                        date = %conflict.date,
                        domain = %conflict.domain,
                        slot = %conflict.slot,
                        winner = %conflict.winner.source,
                        kept = %conflict.winner.value,
                        overridden = conflict.overridden.len(),
                        "conflicting sources; higher priority value kept"
                    );
                    report.warnings.push(RunWarning::ConflictOverride(conflict));
                }
            }
        }

        let already_missing: BTreeSet<(NaiveDate, Domain)> = report.missing().into_iter().collect();
        let targets: BTreeSet<NaiveDate> = target_dates.iter().copied().collect();
        for date in targets {
            for domain in expected {
                if covered.contains(&(date, *domain)) || already_missing.contains(&(date, *domain)) {
                    continue;
                }
                tracing::info!(date = %date, domain = %domain, "no facts ingested; slots stay absent");
                report.warnings.push(RunWarning::SourceMissing {
                    date,
                    domain: *domain,
                    source: None,
                    reason: "no facts ingested".to_string(),
                });
            }
        }

        tracing::info!(
            applied = report.applied.len(),
            dates = report.dates.len(),
            warnings = report.warnings.len(),
            "merge finished"
        );
        Ok(report)
    }

    fn group(&self, facts: &[PartialFact], report: &mut MergeReport) -> BTreeMap<NaiveDate, Vec<MergedGroup>> {
        let mut groups: BTreeMap<(NaiveDate, Domain, String), Vec<(usize, ValidatedFact)>> = BTreeMap::new();
        for (index, fact) in facts.iter().enumerate() {
            match validate_fact(fact, self.store.bounds()) {
                Ok(valid) => groups
                    .entry((valid.date, valid.domain, valid.source.clone()))
                    .or_default()
                    .push((index, valid)),
                Err(error) => {
                    tracing::warn!(
                        date = %fact.date,
                        domain = %fact.domain,
                        source = %fact.source,
                        error = %error,
                        "partial fact rejected"
                    );
                    report.warnings.push(RunWarning::RejectedFact {
                        date: fact.date.clone(),
                        domain: fact.domain.clone(),
                        source: fact.source.clone(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        let mut by_date: BTreeMap<NaiveDate, Vec<MergedGroup>> = BTreeMap::new();
        for ((date, domain, source), mut members) in groups {
            members.sort_by(|(left_index, left), (right_index, right)| {
                left.ingested_at
                    .cmp(&right.ingested_at)
                    .then_with(|| left_index.cmp(right_index))
            });
            let mut slots = BTreeMap::new();
            let mut ingested_at = members[0].1.ingested_at;
            for (_, fact) in members {
                ingested_at = ingested_at.max(fact.ingested_at);
                slots.extend(fact.slots);
            }
            by_date.entry(date).or_default().push(MergedGroup {
                date,
                domain,
                source,
                slots,
                ingested_at,
            });
        }
        by_date
    }
}

pub fn validate_fact(fact: &PartialFact, bounds: DateBounds) -> AppResult<ValidatedFact> {
    let date = parse_date(&fact.date)
        .ok_or_else(|| AppError::InvalidDate(format!("'{}' is not an ISO-8601 calendar date", fact.date)))?;
    bounds.check(date)?;
    let domain = Domain::parse(&fact.domain)
        .ok_or_else(|| AppError::SchemaViolation(format!("unknown domain '{}'", fact.domain)))?;
    schema::validate_source(&fact.source)?;
    let ingested_at = DateTime::parse_from_rfc3339(fact.ingested_at.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            AppError::SchemaViolation(format!("ingestedAt '{}' is not a timestamp: {}", fact.ingested_at, error))
        })?;
    if fact.slots.is_empty() {
        return Err(AppError::SchemaViolation(format!(
            "{} fact from {} carries no slots",
            domain, fact.source
        )));
    }

    let mut slots = BTreeMap::new();
    for (name, raw) in &fact.slots {
        slots.insert(name.clone(), schema::coerce_value(domain, name, raw)?);
    }

    Ok(ValidatedFact {
        date,
        domain,
        source: fact.source.clone(),
        ingested_at,
        slots,
    })
}

#[cfg(test)]
mod tests {
    use super::{MergeEngine, Normalizer};
    use crate::db::{DateBounds, HistoryStore};
    use crate::models::{Domain, PartialFact, RunWarning, SlotValue};
    use crate::priority::SourcePriority;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).expect("valid date")
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 3, hour, 0, 0).single().expect("valid timestamp")
    }

    fn open(dir: &tempfile::TempDir, priority: &[&str]) -> HistoryStore {
        let bounds = DateBounds::new(
            NaiveDate::from_ymd_opt(2020, 1, 1).expect("earliest"),
            NaiveDate::from_ymd_opt(2026, 1, 31).expect("latest"),
        );
        HistoryStore::open(
            &dir.path().join("history.db"),
            bounds,
            SourcePriority::new(priority.iter().copied()),
        )
        .expect("store")
    }

    struct StaticNormalizer {
        source: &'static str,
        domain: Domain,
        facts: Vec<PartialFact>,
    }

    impl Normalizer for StaticNormalizer {
        fn source(&self) -> &str {
            self.source
        }

        fn domain(&self) -> Domain {
            self.domain
        }

        fn collect(&self, _dates: &[NaiveDate]) -> anyhow::Result<Vec<PartialFact>> {
            Ok(self.facts.clone())
        }
    }

    struct MissingExport;

    impl Normalizer for MissingExport {
        fn source(&self) -> &str {
            "hardcover"
        }

        fn domain(&self) -> Domain {
            Domain::Reading
        }

        fn collect(&self, _dates: &[NaiveDate]) -> anyhow::Result<Vec<PartialFact>> {
            anyhow::bail!("books_read_clean.csv not found")
        }
    }

    #[test]
    fn later_ingestion_wins_within_a_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir, &[]);
        let engine = MergeEngine::new(&store, &[]);

        let facts = vec![
            PartialFact::new(day(3), Domain::Listening, "spotify", at(12)).with_slot("minutes", 50),
            PartialFact::new(day(3), Domain::Listening, "spotify", at(8))
                .with_slot("minutes", 10)
                .with_slot("tracksPlayed", 4),
        ];
        let report = engine.apply(&facts, &[day(3)]).expect("apply");

        assert_eq!(report.applied.len(), 1);
        let record = store.get(day(3)).expect("get").expect("record");
        assert_eq!(record.value(Domain::Listening, "minutes"), Some(&SlotValue::Quantity(50.0)));
        assert_eq!(record.value(Domain::Listening, "tracksPlayed"), Some(&SlotValue::Count(4)));
        assert_eq!(record.slot(Domain::Listening, "minutes").map(|s| s.ingested_at), Some(at(12)));
    }

    #[test]
    fn malformed_fact_does_not_block_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir, &[]);
        let engine = MergeEngine::new(&store, &[]);

        let facts = vec![
            PartialFact::new(day(3), Domain::Fitness, "sugarwod", at(9)).with_slot("sessions", "one"),
            PartialFact::new(day(3), Domain::Listening, "spotify", at(9)).with_slot("minutes", 42),
            PartialFact {
                date: "2026-13-40".to_string(),
                ..PartialFact::new(day(3), Domain::Reading, "hardcover", at(9)).with_slot("pages", 12)
            },
            PartialFact::new(NaiveDate::from_ymd_opt(2027, 6, 1).expect("date"), Domain::Reading, "hardcover", at(9))
                .with_slot("pages", 12),
        ];
        let report = engine.apply(&facts, &[day(3)]).expect("apply");

        assert_eq!(report.rejected_count(), 3);
        let record = store.get(day(3)).expect("get").expect("record");
        assert!(!record.has_domain(Domain::Fitness));
        assert_eq!(record.value(Domain::Listening, "minutes"), Some(&SlotValue::Quantity(42.0)));
        assert_eq!(store.len().expect("len"), 1);
    }

    #[test]
    fn failing_normalizer_is_reported_as_missing_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir, &[]);
        let engine = MergeEngine::new(&store, &[Domain::Fitness]);

        let normalizers: Vec<Box<dyn Normalizer>> = vec![
            Box::new(StaticNormalizer {
                source: "sugarwod",
                domain: Domain::Fitness,
                facts: vec![PartialFact::new(day(3), Domain::Fitness, "sugarwod", at(9)).with_slot("sessions", 1)],
            }),
            Box::new(MissingExport),
        ];
        let report = engine.run(&normalizers, &[day(3)]).expect("run");

        assert_eq!(report.missing(), vec![(day(3), Domain::Reading)]);
        match &report.warnings[0] {
            RunWarning::SourceMissing { source, reason, .. } => {
                assert_eq!(source.as_deref(), Some("hardcover"));
                assert!(reason.contains("books_read_clean.csv"));
            }
            other => panic!("unexpected warning {:?}", other),
        }
        let record = store.get(day(3)).expect("get").expect("record");
        assert!(!record.has_domain(Domain::Reading));
        assert_eq!(record.value(Domain::Fitness, "sessions"), Some(&SlotValue::Count(1)));
    }

    #[test]
    fn expected_domain_without_facts_is_missing_not_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir, &[]);
        let engine = MergeEngine::new(&store, &[Domain::Fitness, Domain::Listening]);

        let facts = vec![PartialFact::new(day(3), Domain::Listening, "spotify", at(9)).with_slot("minutes", 0)];
        let report = engine.apply(&facts, &[day(3)]).expect("apply");

        assert_eq!(report.missing(), vec![(day(3), Domain::Fitness)]);
        let record = store.get(day(3)).expect("get").expect("record");
        assert_eq!(record.value(Domain::Listening, "minutes"), Some(&SlotValue::Quantity(0.0)));
        assert!(record.value(Domain::Fitness, "sessions").is_none());
    }

    #[test]
    fn conflicting_sources_are_logged_and_priority_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir, &["sugarwod", "manual"]);
        let engine = MergeEngine::new(&store, &[]);

        let facts = vec![
            PartialFact::new(day(3), Domain::Fitness, "sugarwod", at(9)).with_slot("sessions", 1),
            PartialFact::new(day(3), Domain::Fitness, "manual", at(18)).with_slot("sessions", 2),
        ];
        let report = engine.apply(&facts, &[day(3)]).expect("apply");

        assert_eq!(report.conflict_count(), 1);
        assert_eq!(report.applied.last().map(|group| group.source.as_str()), Some("sugarwod"));
        let record = store.get(day(3)).expect("get").expect("record");
        assert_eq!(record.value(Domain::Fitness, "sessions"), Some(&SlotValue::Count(1)));
    }

    #[test]
    fn facts_without_slots_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir, &[]);
        let engine = MergeEngine::new(&store, &[]);

        let report = engine
            .apply(&[PartialFact::new(day(3), Domain::Finance, "ynab", at(9))], &[])
            .expect("apply");
        assert_eq!(report.rejected_count(), 1);
        assert!(store.is_empty().expect("is_empty"));
    }
}
