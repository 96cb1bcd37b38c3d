use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::filter::{self, AsTracked, Filter};
use crate::model::{ObjectType, TrackedObject};
use crate::path::PathPoint;
use crate::resolve::ResolvedPosition;

/// An object together with its last resolved position.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntry {
    pub object: Arc<TrackedObject>,
    pub position: Option<ResolvedPosition>,
}

impl AsTracked for TrackedEntry {
    fn tracked(&self) -> &TrackedObject {
        &self.object
    }
}

pub type EntryList = Arc<Vec<Arc<TrackedEntry>>>;

/// Immutable view of the scheduler state. Every change produces a new
/// snapshot; parts that did not change are shared by reference with the
/// previous one.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Full set from the last list refresh, in server order.
    pub objects: EntryList,
    /// `objects` after the filter/sort pipeline.
    pub view: EntryList,
    pub filter: Arc<Filter>,
    pub followed: Option<String>,
    pub details: Option<Arc<TrackedEntry>>,
    /// History polyline of the followed object.
    pub path: Arc<Vec<PathPoint>>,
    pub hidden_types: Arc<BTreeSet<String>>,
    pub types: Arc<Vec<ObjectType>>,
    /// Bumped whenever the user changes what a refresh should fetch.
    pub epoch: u64,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Followed(String),
    Cleared,
    /// Not in the current object list; nothing changed.
    Unknown,
}

impl Snapshot {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter: Arc::new(filter),
            ..Self::default()
        }
    }

    pub fn entry(&self, id: &str) -> Option<&Arc<TrackedEntry>> {
        self.objects.iter().find(|e| e.object.id == id)
    }

    pub fn is_hidden(&self, kind: &str) -> bool {
        self.hidden_types.contains(kind)
    }

    /// Replaces the object list with a fresh fetch. An entry equal to the
    /// one already held keeps its old allocation; `None` positions fall
    /// back to the previously known one.
    pub fn with_full_refresh<Tz: TimeZone>(
        &self,
        fetched: Vec<(TrackedObject, Option<ResolvedPosition>)>,
        now: &DateTime<Tz>,
    ) -> Snapshot {
        let previous: HashMap<&str, &Arc<TrackedEntry>> = self
            .objects
            .iter()
            .map(|e| (e.object.id.as_str(), e))
            .collect();

        let objects: Vec<Arc<TrackedEntry>> = fetched
            .into_iter()
            .map(|(object, position)| {
                let old = previous.get(object.id.as_str()).copied();
                let position = position.or_else(|| old.and_then(|e| e.position.clone()));
                match old {
                    Some(old) if *old.object == object && old.position == position => old.clone(),
                    Some(old) if *old.object == object => Arc::new(TrackedEntry {
                        object: old.object.clone(),
                        position,
                    }),
                    _ => Arc::new(TrackedEntry {
                        object: Arc::new(object),
                        position,
                    }),
                }
            })
            .collect();

        let view = filter::apply(&objects, &self.filter, now);
        let details = self
            .details
            .as_ref()
            .map(|d| {
                objects
                    .iter()
                    .find(|e| e.object.id == d.object.id)
                    .unwrap_or(d)
                    .clone()
            });

        Snapshot {
            objects: Arc::new(objects),
            view: Arc::new(view),
            details,
            ..self.clone()
        }
    }

    /// Swaps in a new position for one object without touching any other
    /// entry and without re-sorting the view.
    pub fn with_followed_update(
        &self,
        id: &str,
        position: Option<ResolvedPosition>,
        path: Option<Vec<PathPoint>>,
    ) -> Snapshot {
        let mut next = self.clone();
        if let Some(path) = path {
            next.path = Arc::new(path);
        }

        let current = match self.entry(id) {
            Some(entry) => entry,
            None => return next,
        };
        let position = match position {
            Some(p) if current.position.as_ref() != Some(&p) => p,
            _ => return next,
        };

        let updated = Arc::new(TrackedEntry {
            object: current.object.clone(),
            position: Some(position),
        });
        next.objects = Arc::new(replace_entry(&self.objects, &updated));
        next.view = Arc::new(replace_entry(&self.view, &updated));
        if next.details.as_ref().is_some_and(|d| d.object.id == id) {
            next.details = Some(updated);
        }
        next
    }

    pub fn with_filter<Tz: TimeZone>(&self, filter: Filter, now: &DateTime<Tz>) -> Snapshot {
        let view = filter::apply(&self.objects, &filter, now);
        Snapshot {
            filter: Arc::new(filter),
            view: Arc::new(view),
            epoch: self.epoch + 1,
            ..self.clone()
        }
    }

    /// Clicking the followed object clears following; clicking another one
    /// follows it and opens its details, unless its type is hidden.
    pub fn with_toggled_follow(&self, id: &str) -> (Snapshot, Selection) {
        if self.followed.as_deref() == Some(id) {
            return (self.cleared_selection(), Selection::Cleared);
        }
        let entry = match self.entry(id) {
            Some(entry) => entry.clone(),
            None => return (self.clone(), Selection::Unknown),
        };
        if self.is_hidden(&entry.object.kind) {
            return (self.cleared_selection(), Selection::Cleared);
        }

        let next = Snapshot {
            followed: Some(id.to_string()),
            details: Some(entry),
            path: Arc::new(Vec::new()),
            epoch: self.epoch + 1,
            ..self.clone()
        };
        (next, Selection::Followed(id.to_string()))
    }

    /// Flips visibility of `kind`. Hiding the type of the followed object
    /// (or of the open details) drops that selection as well.
    pub fn with_toggled_type(&self, kind: &str) -> Snapshot {
        let mut hidden = (*self.hidden_types).clone();
        let now_hidden = if hidden.remove(kind) {
            false
        } else {
            hidden.insert(kind.to_string());
            true
        };

        let mut next = Snapshot {
            hidden_types: Arc::new(hidden),
            ..self.clone()
        };
        if !now_hidden {
            return next;
        }

        let followed_hidden = self
            .followed
            .as_deref()
            .and_then(|id| self.entry(id))
            .is_some_and(|e| e.object.kind == kind);
        if followed_hidden {
            next = next.cleared_selection();
        }
        if next.details.as_ref().is_some_and(|d| d.object.kind == kind) {
            next.details = None;
        }
        next
    }

    pub fn with_details(&self, id: Option<&str>) -> Snapshot {
        Snapshot {
            details: id.and_then(|id| self.entry(id)).cloned(),
            ..self.clone()
        }
    }

    fn cleared_selection(&self) -> Snapshot {
        Snapshot {
            followed: None,
            details: None,
            path: Arc::new(Vec::new()),
            epoch: self.epoch + 1,
            ..self.clone()
        }
    }
}

fn replace_entry(list: &[Arc<TrackedEntry>], updated: &Arc<TrackedEntry>) -> Vec<Arc<TrackedEntry>> {
    list.iter()
        .map(|e| {
            if e.object.id == updated.object.id {
                updated.clone()
            } else {
                e.clone()
            }
        })
        .collect()
}
