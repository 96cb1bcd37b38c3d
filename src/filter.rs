use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::TrackedObject;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
)]
pub enum LastUpdated {
    #[serde(rename = "today")]
    #[value(name = "today")]
    #[strum(serialize = "today")]
    Today,
    #[serde(rename = "3days")]
    #[value(name = "3days")]
    #[strum(serialize = "3days")]
    ThreeDays,
    #[serde(rename = "week")]
    #[value(name = "week")]
    #[strum(serialize = "week")]
    Week,
    #[serde(rename = "month")]
    #[value(name = "month")]
    #[strum(serialize = "month")]
    Month,
    #[default]
    #[serde(rename = "all")]
    #[value(name = "all")]
    #[strum(serialize = "all")]
    All,
}

impl LastUpdated {
    /// Earliest `updated_at` still admitted. `today` means local midnight
    /// in `now`'s time zone.
    pub fn cutoff<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
        let now_utc = now.with_timezone(&Utc);
        match self {
            LastUpdated::Today => {
                let midnight = now.date_naive().and_time(NaiveTime::MIN);
                let tz = now.timezone();
                // midnight may be skipped by a DST jump: take the first
                // local minute that exists
                let start = (0..=24 * 60)
                    .map(|m| midnight + Duration::minutes(m))
                    .find_map(|t| tz.from_local_datetime(&t).earliest());
                Some(start.map_or(now_utc, |m| m.with_timezone(&Utc)))
            }
            LastUpdated::ThreeDays => Some(now_utc - Duration::days(3)),
            LastUpdated::Week => Some(now_utc - Duration::days(7)),
            LastUpdated::Month => Some(now_utc - Duration::days(30)),
            LastUpdated::All => None,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortBy {
    Name,
    Type,
    Created,
    #[default]
    Updated,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// View criteria. An absent field is no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    /// Case-insensitive substring on the object name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_updated: LastUpdated,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_direction: SortDirection,
}

impl Filter {
    pub fn matches(&self, object: &TrackedObject, cutoff: Option<DateTime<Utc>>) -> bool {
        if let Some(kind) = &self.kind {
            if &object.kind != kind {
                return false;
            }
        }
        if let Some(source) = &self.source_id {
            if &object.source_id != source {
                return false;
            }
        }
        if let Some(needle) = &self.name {
            let needle = needle.to_lowercase();
            let name = object.name.as_deref().unwrap_or("").to_lowercase();
            if !name.contains(&needle) {
                return false;
            }
        }
        match cutoff {
            Some(cutoff) => object.updated_at >= cutoff,
            None => true,
        }
    }

    pub fn compare(&self, a: &TrackedObject, b: &TrackedObject) -> Ordering {
        let ordering = match self.sort_by {
            SortBy::Name => {
                let a = a.name.as_deref().unwrap_or("").to_lowercase();
                let b = b.name.as_deref().unwrap_or("").to_lowercase();
                a.cmp(&b)
            }
            SortBy::Type => a.kind.cmp(&b.kind),
            SortBy::Created => a.created_at.cmp(&b.created_at),
            SortBy::Updated => a.updated_at.cmp(&b.updated_at),
        };
        match self.sort_direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }

    /// Query pairs for `GET /objects`. Name search has no server-side
    /// counterpart and is applied locally only.
    pub fn query_pairs<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(kind) = &self.kind {
            pairs.push(("type", kind.clone()));
        }
        if let Some(source) = &self.source_id {
            pairs.push(("source_id", source.clone()));
        }
        if let Some(cutoff) = self.last_updated.cutoff(now) {
            pairs.push(("updated_after", cutoff.to_rfc3339()));
        }
        pairs.push(("sort_by", self.sort_by.to_string()));
        pairs.push(("sort_direction", self.sort_direction.to_string()));
        pairs
    }
}

/// Anything the pipeline can sort and filter.
pub trait AsTracked {
    fn tracked(&self) -> &TrackedObject;
}

impl AsTracked for TrackedObject {
    fn tracked(&self) -> &TrackedObject {
        self
    }
}

impl<T: AsTracked> AsTracked for std::sync::Arc<T> {
    fn tracked(&self) -> &TrackedObject {
        (**self).tracked()
    }
}

/// Filters then stably sorts. Items are cloned, so `Arc` inputs keep their
/// identity in the output.
pub fn apply<T, Tz>(items: &[T], filter: &Filter, now: &DateTime<Tz>) -> Vec<T>
where
    T: AsTracked + Clone,
    Tz: TimeZone,
{
    let cutoff = filter.last_updated.cutoff(now);
    let mut out: Vec<T> = items
        .iter()
        .filter(|item| filter.matches(item.tracked(), cutoff))
        .cloned()
        .collect();
    out.sort_by(|a, b| filter.compare(a.tracked(), b.tracked()));
    out
}

/// Number of objects per type tag.
pub fn type_counts<T: AsTracked>(items: &[T]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(item.tracked().kind.clone()).or_insert(0) += 1;
    }
    counts
}
