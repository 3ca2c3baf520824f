use chrono::{DateTime, Utc};
use std::cmp::Ordering;

// Listed sources rank by position, then unlisted ones, then latest ingestion, then source id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePriority {
    order: Vec<String>,
}

impl SourcePriority {
    pub fn new<I, S>(order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            order: order.into_iter().map(Into::into).collect(),
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.order
    }

    pub fn rank(&self, source: &str) -> Option<usize> {
        self.order.iter().position(|candidate| candidate == source)
    }

    // Greater means `a` beats `b`.
    pub fn compare(&self, a: (&str, DateTime<Utc>), b: (&str, DateTime<Utc>)) -> Ordering {
        let by_rank = match (self.rank(a.0), self.rank(b.0)) {
            (Some(left), Some(right)) => right.cmp(&left),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        by_rank.then_with(|| a.1.cmp(&b.1)).then_with(|| a.0.cmp(b.0))
    }
}

#[cfg(test)]
mod tests {
    use super::SourcePriority;
    use chrono::{TimeZone, Utc};
    use std::cmp::Ordering;

    #[test]
    fn listed_sources_beat_unlisted_ones() {
        let priority = SourcePriority::new(["sugarwod", "manual"]);
        let early = Utc.with_ymd_and_hms(2026, 1, 3, 8, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 3, 20, 0, 0).unwrap();

        assert_eq!(priority.compare(("sugarwod", early), ("manual", late)), Ordering::Greater);
        assert_eq!(priority.compare(("manual", early), ("strava", late)), Ordering::Greater);
        assert_eq!(priority.compare(("strava", late), ("sugarwod", early)), Ordering::Less);
    }

    #[test]
    fn unlisted_sources_fall_back_to_ingestion_then_name() {
        let priority = SourcePriority::default();
        let early = Utc.with_ymd_and_hms(2026, 1, 3, 8, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 3, 20, 0, 0).unwrap();

        assert_eq!(priority.compare(("alpha", late), ("beta", early)), Ordering::Greater);
        assert_eq!(priority.compare(("alpha", early), ("beta", early)), Ordering::Less);
    }
}
