use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::event::{ClassifiedEvent, EventId, EventKindTag, SpreeEvent};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "camelCase")]
pub enum TimelineRecord {
    Event(ClassifiedEvent),
    Spree(SpreeEvent),
}

impl TimelineRecord {
    pub fn id(&self) -> EventId {
        match self {
            TimelineRecord::Event(event) => event.id,
            TimelineRecord::Spree(spree) => spree.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TimelineRecord::Event(event) => event.timestamp,
            TimelineRecord::Spree(spree) => spree.timestamp,
        }
    }

    pub fn kind_tag(&self) -> EventKindTag {
        match self {
            TimelineRecord::Event(event) => event.kind_tag(),
            TimelineRecord::Spree(_) => EventKindTag::Spree,
        }
    }
}

/// Incremental change for the display layer. Records are snapshots taken when
/// the updates are drained, so consumers never need to call back in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum TimelineUpdate {
    Inserted {
        position: usize,
        record: TimelineRecord,
    },
    Updated {
        record: TimelineRecord,
    },
    Removed {
        id: EventId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingChange {
    Inserted(EventId, usize),
    Updated(EventId),
    Removed(EventId),
}

/// Arena of every event by id plus the top-level display order. Spree
/// children stay in the arena but leave the order once attached.
#[derive(Debug, Default)]
pub struct Timeline {
    records: HashMap<EventId, TimelineRecord>,
    order: Vec<EventId>,
    parents: HashMap<EventId, EventId>,
    kind_counts: BTreeMap<EventKindTag, u64>,
    pending: Vec<PendingChange>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn get(&self, id: EventId) -> Option<&TimelineRecord> {
        self.records.get(&id)
    }

    pub fn event(&self, id: EventId) -> Option<&ClassifiedEvent> {
        match self.records.get(&id)? {
            TimelineRecord::Event(event) => Some(event),
            TimelineRecord::Spree(_) => None,
        }
    }

    pub fn parent_of(&self, id: EventId) -> Option<EventId> {
        self.parents.get(&id).copied()
    }

    pub fn position_of(&self, id: EventId) -> Option<usize> {
        self.order.iter().position(|candidate| *candidate == id)
    }

    /// Top-level records in display order.
    pub fn iter(&self) -> impl Iterator<Item = &TimelineRecord> + '_ {
        self.order.iter().filter_map(move |id| self.records.get(id))
    }

    pub fn children_of(&self, spree_id: EventId) -> Vec<&ClassifiedEvent> {
        let Some(TimelineRecord::Spree(spree)) = self.records.get(&spree_id) else {
            return Vec::new();
        };

        spree
            .children
            .iter()
            .filter_map(|child_id| self.event(*child_id))
            .collect()
    }

    /// Every classified event in display order, with spree parents expanded
    /// into their children.
    pub fn classified_events(&self) -> impl Iterator<Item = &ClassifiedEvent> + '_ {
        self.iter().flat_map(move |record| match record {
            TimelineRecord::Event(event) => vec![event],
            TimelineRecord::Spree(spree) => spree
                .children
                .iter()
                .filter_map(|child_id| self.event(*child_id))
                .collect(),
        })
    }

    pub fn kind_counts(&self) -> &BTreeMap<EventKindTag, u64> {
        &self.kind_counts
    }

    /// Appends a new top-level event and returns its position.
    pub fn push(&mut self, event: ClassifiedEvent) -> usize {
        let id = event.id;
        *self.kind_counts.entry(event.kind_tag()).or_insert(0) += 1;
        self.records.insert(id, TimelineRecord::Event(event));
        self.order.push(id);

        let position = self.order.len() - 1;
        self.pending.push(PendingChange::Inserted(id, position));
        position
    }

    /// Mutates an event in place. A change to a spree child is reported as an
    /// update of its parent, since only the parent is visible at top level.
    pub fn modify_event<F>(&mut self, id: EventId, apply: F) -> bool
    where
        F: FnOnce(&mut ClassifiedEvent),
    {
        let Some(TimelineRecord::Event(event)) = self.records.get_mut(&id) else {
            return false;
        };

        apply(event);
        let visible_id = self.parents.get(&id).copied().unwrap_or(id);
        self.pending.push(PendingChange::Updated(visible_id));
        true
    }

    /// Puts a spree parent in the slot of its first child and detaches every
    /// child from the top-level order.
    pub(crate) fn promote_spree(&mut self, spree: SpreeEvent) -> Option<usize> {
        let first_child = *spree.children.first()?;
        let position = self.position_of(first_child)?;
        let spree_id = spree.id;

        self.order[position] = spree_id;
        self.pending.push(PendingChange::Removed(first_child));
        for child_id in &spree.children {
            self.parents.insert(*child_id, spree_id);
            if *child_id != first_child && self.detach_from_order(*child_id) {
                self.pending.push(PendingChange::Removed(*child_id));
            }
        }

        *self.kind_counts.entry(EventKindTag::Spree).or_insert(0) += 1;
        self.records.insert(spree_id, TimelineRecord::Spree(spree));
        self.pending.push(PendingChange::Inserted(spree_id, position));
        Some(position)
    }

    pub(crate) fn attach_child(
        &mut self,
        spree_id: EventId,
        child_id: EventId,
        child_timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(TimelineRecord::Spree(spree)) = self.records.get_mut(&spree_id) else {
            return false;
        };

        spree.children.push(child_id);
        spree.kill_count = spree.children.len();
        if child_timestamp > spree.timestamp {
            spree.timestamp = child_timestamp;
        }

        self.parents.insert(child_id, spree_id);
        if self.detach_from_order(child_id) {
            self.pending.push(PendingChange::Removed(child_id));
        }
        self.pending.push(PendingChange::Updated(spree_id));
        true
    }

    pub(crate) fn finalize_spree(&mut self, spree_id: EventId) {
        if let Some(TimelineRecord::Spree(spree)) = self.records.get_mut(&spree_id) {
            spree.finalized = true;
            self.pending.push(PendingChange::Updated(spree_id));
        }
    }

    fn detach_from_order(&mut self, id: EventId) -> bool {
        let Some(position) = self.position_of(id) else {
            return false;
        };

        self.order.remove(position);
        true
    }

    /// Drains pending changes, snapshotting the current state of each record.
    pub fn take_updates(&mut self) -> Vec<TimelineUpdate> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter_map(|change| match change {
                PendingChange::Inserted(id, position) => {
                    self.records.get(&id).map(|record| TimelineUpdate::Inserted {
                        position,
                        record: record.clone(),
                    })
                }
                PendingChange::Updated(id) => self.records.get(&id).map(|record| {
                    TimelineUpdate::Updated {
                        record: record.clone(),
                    }
                }),
                PendingChange::Removed(id) => Some(TimelineUpdate::Removed { id }),
            })
            .collect()
    }
}
