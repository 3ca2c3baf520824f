use crate::errors::{AppError, AppResult};
use crate::models::{
    format_date, parse_date, ConflictingValue, DailyRecord, Domain, SlotConflict, SlotEntry, SlotValue,
};
use crate::priority::SourcePriority;
use crate::schema::{self, SCHEMA_VERSION};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateBounds {
    pub earliest: NaiveDate,
    pub latest: NaiveDate,
}

impl DateBounds {
    pub fn new(earliest: NaiveDate, latest: NaiveDate) -> Self {
        Self { earliest, latest }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.earliest && date <= self.latest
    }

    pub fn check(&self, date: NaiveDate) -> AppResult<()> {
        if self.contains(date) {
            Ok(())
        } else {
            Err(AppError::InvalidDate(format!(
                "{} is outside {}..={}",
                format_date(date),
                format_date(self.earliest),
                format_date(self.latest)
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Contribution {
    date: NaiveDate,
    domain: Domain,
    source: String,
    slot: String,
    value: SlotValue,
    ingested_at: DateTime<Utc>,
}

impl Contribution {
    fn as_conflicting(&self) -> ConflictingValue {
        ConflictingValue {
            source: self.source.clone(),
            value: self.value.clone(),
            ingested_at: self.ingested_at,
        }
    }
}

struct RawContribution {
    date: String,
    domain: String,
    source: String,
    slot: String,
    kind: String,
    value_json: String,
    ingested_at: String,
}

#[derive(Debug)]
pub struct HistoryStore {
    conn: Connection,
    db_path: PathBuf,
    bounds: DateBounds,
    priority: SourcePriority,
}

impl HistoryStore {
    pub fn open(path: &Path, bounds: DateBounds, priority: SourcePriority) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        tracing::info!(path = %path.to_string_lossy(), "history store opened");
        Ok(Self {
            conn,
            db_path: path.to_path_buf(),
            bounds,
            priority,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn bounds(&self) -> DateBounds {
        self.bounds
    }

    pub fn priority(&self) -> &SourcePriority {
        &self.priority
    }

    pub fn get(&self, date: NaiveDate) -> AppResult<Option<DailyRecord>> {
        Ok(self.range(date, date)?.into_iter().next())
    }

    pub fn upsert_slots(
        &self,
        date: NaiveDate,
        domain: Domain,
        slots: &BTreeMap<String, SlotValue>,
        source: &str,
        ingested_at: DateTime<Utc>,
    ) -> AppResult<DailyRecord> {
        self.bounds.check(date)?;
        schema::validate_source(source)?;
        for (slot, value) in slots {
            schema::check_value(domain, slot, value)?;
        }

        let ingested = ingested_at.to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO daily_records (date, schema_version) VALUES (?1, ?2)
             ON CONFLICT(date) DO UPDATE SET schema_version = MAX(schema_version, excluded.schema_version)",
            params![date, SCHEMA_VERSION],
        )?;
        let replaced = tx.execute(
            "DELETE FROM slot_values WHERE date = ?1 AND domain = ?2 AND source = ?3",
            params![date, domain.as_str(), source],
        )?;
        for (slot, value) in slots {
            tx.execute(
                "INSERT INTO slot_values (date, domain, source, slot, kind, value_json, ingested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    date,
                    domain.as_str(),
                    source,
                    slot,
                    value.kind().as_str(),
                    serde_json::to_string(&value.to_json())?,
                    ingested,
                ],
            )?;
        }
        tx.commit()?;

        tracing::debug!(
            date = %date,
            domain = %domain,
            source,
            written = slots.len(),
            replaced,
            "slots upserted"
        );

        self.get(date)?
            .ok_or_else(|| AppError::Storage(format!("record for {} missing after upsert", format_date(date))))
    }

    pub fn range(&self, start: NaiveDate, end: NaiveDate) -> AppResult<Vec<DailyRecord>> {
        if start > end {
            return Err(AppError::InvalidDate(format!(
                "range start {} is after end {}",
                format_date(start),
                format_date(end)
            )));
        }

        let mut records: BTreeMap<NaiveDate, DailyRecord> = BTreeMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT date, schema_version FROM daily_records WHERE date BETWEEN ?1 AND ?2 ORDER BY date ASC",
            )?;
            let rows = stmt.query_map(params![start, end], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (raw_date, version) = row?;
                match parse_date(&raw_date) {
                    Some(date) => {
                        records.insert(date, DailyRecord::new(date, version));
                    }
                    None => {
                        tracing::warn!(date = %raw_date, "skipping daily record with malformed date key");
                    }
                }
            }
        }

        let mut grouped: BTreeMap<(NaiveDate, Domain, String), Vec<Contribution>> = BTreeMap::new();
        for contribution in self.load_contributions(start, end, None)? {
            grouped
                .entry((contribution.date, contribution.domain, contribution.slot.clone()))
                .or_default()
                .push(contribution);
        }

        for ((date, domain, slot), contributions) in grouped {
            let Some(record) = records.get_mut(&date) else {
                continue;
            };
            if let Some(winner) = self.winner(&contributions) {
                record.slots.entry(domain).or_default().insert(
                    slot,
                    SlotEntry {
                        value: winner.value.clone(),
                        source: winner.source.clone(),
                        ingested_at: winner.ingested_at,
                    },
                );
            }
        }

        Ok(records.into_values().collect())
    }

    pub fn conflicts(&self, date: NaiveDate, domain: Domain) -> AppResult<Vec<SlotConflict>> {
        let mut by_slot: BTreeMap<String, Vec<Contribution>> = BTreeMap::new();
        for contribution in self.load_contributions(date, date, Some(domain))? {
            by_slot.entry(contribution.slot.clone()).or_default().push(contribution);
        }

        let mut conflicts = Vec::new();
        for (slot, mut contributions) in by_slot {
            if contributions.len() < 2 {
                continue;
            }
            contributions.sort_by(|a, b| self.rank(b, a));
            let winner = &contributions[0];
            let overridden: Vec<ConflictingValue> = contributions[1..]
                .iter()
                .filter(|other| other.value != winner.value)
                .map(Contribution::as_conflicting)
                .collect();
            if overridden.is_empty() {
                continue;
            }
            conflicts.push(SlotConflict {
                date,
                domain,
                slot,
                winner: winner.as_conflicting(),
                overridden,
            });
        }
        Ok(conflicts)
    }

    pub fn dates(&self) -> AppResult<Vec<NaiveDate>> {
        let mut stmt = self.conn.prepare("SELECT date FROM daily_records ORDER BY date ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut dates = Vec::new();
        for row in rows {
            let raw = row?;
            match parse_date(&raw) {
                Some(date) => dates.push(date),
                None => tracing::warn!(date = %raw, "skipping daily record with malformed date key"),
            }
        }
        Ok(dates)
    }

    pub fn len(&self) -> AppResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(1) FROM daily_records", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    pub fn is_empty(&self) -> AppResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn latest_date(&self) -> AppResult<Option<NaiveDate>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT MAX(date) FROM daily_records", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(raw.as_deref().and_then(parse_date))
    }

    fn winner<'a>(&self, contributions: &'a [Contribution]) -> Option<&'a Contribution> {
        contributions.iter().max_by(|a, b| self.rank(a, b))
    }

    fn rank(&self, a: &Contribution, b: &Contribution) -> Ordering {
        self.priority
            .compare((a.source.as_str(), a.ingested_at), (b.source.as_str(), b.ingested_at))
    }

    fn load_contributions(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        domain: Option<Domain>,
    ) -> AppResult<Vec<Contribution>> {
        let mut stmt = self.conn.prepare(
            "SELECT date, domain, source, slot, kind, value_json, ingested_at
             FROM slot_values
             WHERE date BETWEEN ?1 AND ?2 AND (?3 IS NULL OR domain = ?3)
             ORDER BY date ASC, domain ASC, slot ASC, source ASC",
        )?;
        let rows = stmt.query_map(
            params![start, end, domain.map(Domain::as_str)],
            parse_contribution_row,
        )?;

        let mut contributions = Vec::new();
        for row in rows {
            let raw = row?;
            match decode_contribution(&raw) {
                Ok(contribution) => contributions.push(contribution),
                Err(error) => {
                    tracing::warn!(
                        date = %raw.date,
                        domain = %raw.domain,
                        source = %raw.source,
                        slot = %raw.slot,
                        error = %error,
                        "skipping stored slot that no longer matches the schema"
                    );
                }
            }
        }
        Ok(contributions)
    }
}

fn parse_contribution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawContribution> {
    Ok(RawContribution {
        date: row.get(0)?,
        domain: row.get(1)?,
        source: row.get(2)?,
        slot: row.get(3)?,
        kind: row.get(4)?,
        value_json: row.get(5)?,
        ingested_at: row.get(6)?,
    })
}

fn decode_contribution(raw: &RawContribution) -> AppResult<Contribution> {
    let date = parse_date(&raw.date)
        .ok_or_else(|| AppError::SchemaViolation(format!("malformed date key '{}'", raw.date)))?;
    let domain = Domain::parse(&raw.domain)
        .ok_or_else(|| AppError::SchemaViolation(format!("unknown domain '{}'", raw.domain)))?;
    let spec = schema::lookup(domain, &raw.slot)
        .ok_or_else(|| AppError::SchemaViolation(format!("unknown slot {}", schema::column_name(domain, &raw.slot))))?;
    if spec.kind.as_str() != raw.kind {
        return Err(AppError::SchemaViolation(format!(
            "{} stored as {} but declared {}",
            schema::column_name(domain, &raw.slot),
            raw.kind,
            spec.kind.as_str()
        )));
    }
    let json: serde_json::Value = serde_json::from_str(&raw.value_json)
        .map_err(|error| AppError::SchemaViolation(error.to_string()))?;
    let value = schema::coerce_value(domain, &raw.slot, &json)?;
    let ingested_at = parse_time(&raw.ingested_at)?;

    Ok(Contribution {
        date,
        domain,
        source: raw.source.clone(),
        slot: raw.slot.clone(),
        value,
        ingested_at,
    })
}

fn parse_time(raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| AppError::SchemaViolation(format!("malformed timestamp '{}': {}", raw, error)))
}
