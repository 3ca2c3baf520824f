use crate::errors::{AppError, AppResult};
use crate::models::{Domain, SlotKind, SlotValue};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSpec {
    pub domain: Domain,
    pub name: &'static str,
    pub kind: SlotKind,
}

const fn spec(domain: Domain, name: &'static str, kind: SlotKind) -> SlotSpec {
    SlotSpec { domain, name, kind }
}

pub const SLOTS: &[SlotSpec] = &[
    spec(Domain::Fitness, "sessions", SlotKind::Count),
    spec(Domain::Fitness, "rxSessions", SlotKind::Count),
    spec(Domain::Fitness, "prs", SlotKind::Count),
    spec(Domain::Fitness, "runs", SlotKind::Count),
    spec(Domain::Fitness, "runningMiles", SlotKind::Quantity),
    spec(Domain::Fitness, "movingMinutes", SlotKind::Quantity),
    spec(Domain::Fitness, "longRunMiles", SlotKind::Quantity),
    spec(Domain::Listening, "minutes", SlotKind::Quantity),
    spec(Domain::Listening, "tracksPlayed", SlotKind::Count),
    spec(Domain::Listening, "uniqueArtists", SlotKind::Count),
    spec(Domain::Listening, "uniqueTracks", SlotKind::Count),
    spec(Domain::Listening, "topArtist", SlotKind::Text),
    spec(Domain::Listening, "topTrack", SlotKind::Text),
    spec(Domain::Reading, "pages", SlotKind::Count),
    spec(Domain::Reading, "booksFinished", SlotKind::Count),
    spec(Domain::Reading, "fictionFinished", SlotKind::Count),
    spec(Domain::Reading, "nonfictionFinished", SlotKind::Count),
    spec(Domain::Calendar, "dateNightFlag", SlotKind::Flag),
    spec(Domain::Calendar, "events", SlotKind::Count),
    spec(Domain::Calendar, "showsAttended", SlotKind::Count),
    spec(Domain::Finance, "savingsDelta", SlotKind::Quantity),
    spec(Domain::Finance, "spend", SlotKind::Quantity),
    spec(Domain::Finance, "income", SlotKind::Quantity),
];

static SLOT_INDEX: Lazy<BTreeMap<Domain, BTreeMap<&'static str, SlotSpec>>> = Lazy::new(|| {
    let mut index: BTreeMap<Domain, BTreeMap<&'static str, SlotSpec>> = BTreeMap::new();
    for slot in SLOTS {
        index.entry(slot.domain).or_default().insert(slot.name, *slot);
    }
    index
});

static SOURCE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").expect("valid regex"));

pub fn lookup(domain: Domain, slot: &str) -> Option<SlotSpec> {
    SLOT_INDEX.get(&domain).and_then(|slots| slots.get(slot)).copied()
}

pub fn slots_for(domain: Domain) -> impl Iterator<Item = &'static SlotSpec> {
    SLOTS.iter().filter(move |slot| slot.domain == domain)
}

pub fn column_name(domain: Domain, slot: &str) -> String {
    format!("{}.{}", domain.as_str(), slot)
}

pub fn validate_source(source: &str) -> AppResult<()> {
    if SOURCE_ID.is_match(source) {
        Ok(())
    } else {
        Err(AppError::SchemaViolation(format!(
            "source identifier '{}' must match {}",
            source,
            SOURCE_ID.as_str()
        )))
    }
}

pub fn check_value(domain: Domain, slot: &str, value: &SlotValue) -> AppResult<SlotSpec> {
    let spec = lookup(domain, slot).ok_or_else(|| unknown_slot(domain, slot))?;
    if spec.kind != value.kind() {
        return Err(AppError::SchemaViolation(format!(
            "{} expects {} but received {}",
            column_name(domain, slot),
            spec.kind.as_str(),
            value.kind().as_str()
        )));
    }
    if let SlotValue::Quantity(number) = value {
        if !number.is_finite() {
            return Err(AppError::SchemaViolation(format!(
                "{} must be a finite number",
                column_name(domain, slot)
            )));
        }
    }
    Ok(spec)
}

pub fn coerce_value(domain: Domain, slot: &str, raw: &serde_json::Value) -> AppResult<SlotValue> {
    let spec = lookup(domain, slot).ok_or_else(|| unknown_slot(domain, slot))?;
    let mismatch = || {
        AppError::SchemaViolation(format!(
            "{} expects {} but received {}",
            column_name(domain, slot),
            spec.kind.as_str(),
            raw
        ))
    };

    let value = match spec.kind {
        SlotKind::Count => match raw.as_u64() {
            Some(value) => SlotValue::Count(value),
            None => match raw.as_f64() {
                Some(value) if value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64 => {
                    SlotValue::Count(value as u64)
                }
                _ => return Err(mismatch()),
            },
        },
        SlotKind::Quantity => match raw.as_f64() {
            Some(value) if value.is_finite() => SlotValue::Quantity(value),
            _ => return Err(mismatch()),
        },
        SlotKind::Flag => match raw.as_bool() {
            Some(value) => SlotValue::Flag(value),
            None => return Err(mismatch()),
        },
        SlotKind::Text => match raw.as_str() {
            Some(value) => SlotValue::Text(value.to_string()),
            None => return Err(mismatch()),
        },
    };
    Ok(value)
}

fn unknown_slot(domain: Domain, slot: &str) -> AppError {
    AppError::SchemaViolation(format!("unknown slot {}", column_name(domain, slot)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_domain_declares_slots() {
        for domain in Domain::ALL {
            assert!(slots_for(domain).count() > 0, "{} has no slots", domain);
        }
        assert_eq!(lookup(Domain::Fitness, "sessions").map(|s| s.kind), Some(SlotKind::Count));
        assert!(lookup(Domain::Fitness, "minutes").is_none());
    }

    #[test]
    fn coerces_declared_kinds() {
        assert_eq!(
            coerce_value(Domain::Fitness, "sessions", &json!(2)).expect("count"),
            SlotValue::Count(2)
        );
        assert_eq!(
            coerce_value(Domain::Fitness, "sessions", &json!(3.0)).expect("integral float"),
            SlotValue::Count(3)
        );
        assert_eq!(
            coerce_value(Domain::Listening, "minutes", &json!(42)).expect("quantity"),
            SlotValue::Quantity(42.0)
        );
        assert_eq!(
            coerce_value(Domain::Calendar, "dateNightFlag", &json!(true)).expect("flag"),
            SlotValue::Flag(true)
        );
    }

    #[test]
    fn rejects_mismatched_and_unknown_slots() {
        let text_in_count = coerce_value(Domain::Fitness, "sessions", &json!("one")).expect_err("text into count");
        assert!(text_in_count.to_string().contains("SCHEMA_VIOLATION"));
        assert!(coerce_value(Domain::Fitness, "sessions", &json!(-1)).is_err());
        assert!(coerce_value(Domain::Fitness, "sessions", &json!(1.5)).is_err());
        assert!(coerce_value(Domain::Fitness, "sessions", &serde_json::Value::Null).is_err());
        assert!(coerce_value(Domain::Reading, "minutes", &json!(10)).is_err());
        assert!(check_value(Domain::Listening, "minutes", &SlotValue::Count(3)).is_err());
        assert!(check_value(Domain::Finance, "spend", &SlotValue::Quantity(f64::NAN)).is_err());
    }

    #[test]
    fn source_ids_are_restricted() {
        assert!(validate_source("sugarwod").is_ok());
        assert!(validate_source("apple-health.v2").is_ok());
        assert!(validate_source("").is_err());
        assert!(validate_source("Sugar WOD").is_err());
    }
}
