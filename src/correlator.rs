use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;

use crate::event::{ClassifiedEvent, CorrelationKey, EventId};
use crate::settings::{DedupWindows, PipelineSettings};
use crate::timeline::Timeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// A new occurrence, appended to the timeline.
    Inserted(EventId),
    /// Folded into an existing record. `upgraded` is set when the incoming
    /// report carried a higher severity and replaced the displayed fields.
    Merged { id: EventId, upgraded: bool },
}

impl Correlation {
    pub fn id(&self) -> EventId {
        match self {
            Correlation::Inserted(id) => *id,
            Correlation::Merged { id, .. } => *id,
        }
    }
}

/// Where a report came from. Only local lines move the reference clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOrigin {
    Local,
    Peer,
}

#[derive(Debug, Clone)]
struct DedupWindowEntry {
    event_id: EventId,
    timestamp: DateTime<Utc>,
}

/// Collapses independent reports of the same occurrence. Index entries hold
/// event ids only; the records themselves live in the timeline.
#[derive(Debug)]
pub struct Correlator {
    windows: DedupWindows,
    retention: TimeDelta,
    skew_tolerance: TimeDelta,
    entries: HashMap<CorrelationKey, Vec<DedupWindowEntry>>,
    newest_timestamp: Option<DateTime<Utc>>,
}

impl Correlator {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            windows: settings.dedup_windows.clone(),
            retention: settings.dedup_retention(),
            skew_tolerance: settings.clock_skew_tolerance(),
            entries: HashMap::new(),
            newest_timestamp: None,
        }
    }

    pub fn tracked_entries(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn correlate(&mut self, event: ClassifiedEvent, timeline: &mut Timeline) -> Correlation {
        self.correlate_from(event, ReportOrigin::Local, timeline)
    }

    pub fn correlate_from(
        &mut self,
        event: ClassifiedEvent,
        origin: ReportOrigin,
        timeline: &mut Timeline,
    ) -> Correlation {
        let event_timestamp = event.timestamp;
        let correlation = self.merge_or_insert(event, origin, timeline);
        match origin {
            ReportOrigin::Local => self.observe_timestamp(event_timestamp),
            ReportOrigin::Peer if self.within_peer_skew(event_timestamp) => {
                self.observe_timestamp(event_timestamp)
            }
            ReportOrigin::Peer => {}
        }
        correlation
    }

    fn merge_or_insert(
        &mut self,
        event: ClassifiedEvent,
        origin: ReportOrigin,
        timeline: &mut Timeline,
    ) -> Correlation {
        // Same observation delivered twice, e.g. echoed back by a peer.
        if timeline.contains(event.id) {
            let id = event.id;
            timeline.modify_event(id, |existing| existing.merge_reporters(&event.reported_by));
            return Correlation::Merged { id, upgraded: false };
        }

        if origin == ReportOrigin::Peer && self.beyond_peer_bound(event.timestamp) {
            tracing::debug!(
                event_id = %event.id,
                timestamp = %event.timestamp,
                "Peer report far ahead of the local clock, inserting without dedup"
            );
            return Correlation::Inserted(insert(event, timeline));
        }

        let Some(key) = event.correlation_key() else {
            return Correlation::Inserted(insert(event, timeline));
        };
        let Some(window) = self.windows.window_for(event.kind_tag()) else {
            return Correlation::Inserted(insert(event, timeline));
        };

        if let Some(existing_id) = self.find_match(&key, event.timestamp, window) {
            let mut upgraded = false;
            let merged = timeline.modify_event(existing_id, |existing| {
                upgraded = merge_into(existing, &event);
            });
            if merged {
                tracing::debug!(
                    event_id = %existing_id,
                    kind = event.kind_tag().as_str(),
                    upgraded,
                    "Merged duplicate report"
                );
                return Correlation::Merged {
                    id: existing_id,
                    upgraded,
                };
            }
        }

        let timestamp = event.timestamp;
        let id = insert(event, timeline);
        self.entries.entry(key).or_default().push(DedupWindowEntry {
            event_id: id,
            timestamp,
        });
        Correlation::Inserted(id)
    }

    /// Closest indexed report strictly inside the window. The absolute delta
    /// absorbs small negative offsets from peers with skewed clocks.
    fn find_match(
        &self,
        key: &CorrelationKey,
        timestamp: DateTime<Utc>,
        window: TimeDelta,
    ) -> Option<EventId> {
        self.entries
            .get(key)?
            .iter()
            .map(|entry| (entry, (timestamp - entry.timestamp).abs()))
            .filter(|(_, delta)| *delta < window)
            .min_by_key(|(_, delta)| *delta)
            .map(|(entry, _)| entry.event_id)
    }

    /// A peer may nudge the reference clock forward by at most the skew
    /// tolerance per report.
    fn within_peer_skew(&self, timestamp: DateTime<Utc>) -> bool {
        self.newest_timestamp
            .map(|newest| timestamp - newest <= self.skew_tolerance)
            .unwrap_or(false)
    }

    /// A peer report further ahead than any window could match is a new
    /// occurrence and never enters the index.
    fn beyond_peer_bound(&self, timestamp: DateTime<Utc>) -> bool {
        self.newest_timestamp
            .map(|newest| timestamp - newest > self.retention)
            .unwrap_or(false)
    }

    fn observe_timestamp(&mut self, timestamp: DateTime<Utc>) {
        let newest = match self.newest_timestamp {
            Some(current) if current >= timestamp => return,
            _ => timestamp,
        };
        self.newest_timestamp = Some(newest);

        let retention = self.retention;
        let before = self.tracked_entries();
        self.entries.retain(|_, entries| {
            entries.retain(|entry| (newest - entry.timestamp).abs() <= retention);
            !entries.is_empty()
        });

        let evicted = before - self.tracked_entries();
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted stale dedup window entries");
        }
    }
}

fn insert(event: ClassifiedEvent, timeline: &mut Timeline) -> EventId {
    let id = event.id;
    timeline.push(event);
    id
}

/// Folds `incoming` into `existing`, returning whether severity was upgraded.
/// Reporters accumulate either way; a lower severity never overwrites.
fn merge_into(existing: &mut ClassifiedEvent, incoming: &ClassifiedEvent) -> bool {
    existing.merge_reporters(&incoming.reported_by);

    let upgraded = match (existing.severity(), incoming.severity()) {
        (Some(current), Some(candidate)) => candidate > current,
        _ => false,
    };

    if upgraded {
        existing.kind = incoming.kind.clone();
        existing.source_text = incoming.source_text.clone();
    }

    upgraded
}

#[cfg(test)]
mod tests {
    use super::{Correlation, Correlator, ReportOrigin};
    use crate::event::{
        ActorDeath, ClassifiedEvent, DeathManner, DestroyLevel, Entity, EventId, EventKind,
        Identity, Vehicle, VehicleDestruction,
    };
    use crate::settings::PipelineSettings;
    use crate::timeline::{Timeline, TimelineRecord};
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    fn at(offset_seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + TimeDelta::seconds(offset_seconds)
    }

    fn entity(name: &str, id: u64) -> Entity {
        Entity {
            name: name.to_string(),
            id: Some(id),
            is_player: true,
        }
    }

    fn build_death(offset_seconds: i64, reporter: &str) -> ClassifiedEvent {
        let timestamp = at(offset_seconds);
        let source_text = format!("death reported by {reporter}");
        ClassifiedEvent {
            id: EventId::for_observation(timestamp, &source_text),
            timestamp,
            player: None,
            source_text,
            reported_by: Vec::new(),
            kind: EventKind::ActorDeath(ActorDeath {
                victim: entity("Bob", 1),
                zone: "Stanton_X".to_string(),
                killer: Some(entity("Alice", 2)),
                weapon_instance: None,
                weapon_class: None,
                damage_type: Some("bullet".to_string()),
                direction: None,
                manner: DeathManner::Killed,
            }),
        }
        .with_reporter(Some(Identity::new(reporter)))
    }

    fn build_destruction(offset_seconds: i64, reporter: &str, level: DestroyLevel) -> ClassifiedEvent {
        let timestamp = at(offset_seconds);
        let source_text = format!("destruction {level:?} reported by {reporter}");
        ClassifiedEvent {
            id: EventId::for_observation(timestamp, &source_text),
            timestamp,
            player: None,
            source_text,
            reported_by: Vec::new(),
            kind: EventKind::VehicleDestruction(VehicleDestruction {
                vehicle: Vehicle {
                    name: "AEGS_Gladius".to_string(),
                    raw_name: "AEGS_Gladius_42".to_string(),
                    id: 42,
                },
                zone: None,
                driver: None,
                cause: None,
                destroy_level_from: DestroyLevel::None,
                destroy_level_to: level,
                damage_type: None,
            }),
        }
        .with_reporter(Some(Identity::new(reporter)))
    }

    fn only_event(timeline: &Timeline) -> &ClassifiedEvent {
        assert_eq!(timeline.len(), 1, "expected exactly one top-level record");
        match timeline.iter().next() {
            Some(TimelineRecord::Event(event)) => event,
            other => panic!("expected a plain event, got {other:?}"),
        }
    }

    #[test]
    fn merges_reports_inside_window() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        let first = correlator.correlate(build_death(0, "R1"), &mut timeline);
        let second = correlator.correlate(build_death(3, "R2"), &mut timeline);

        assert!(matches!(first, Correlation::Inserted(_)));
        assert_eq!(second, Correlation::Merged { id: first.id(), upgraded: false });
        assert_eq!(
            only_event(&timeline).reported_by,
            vec![Identity::new("R1"), Identity::new("R2")]
        );
    }

    #[test]
    fn tolerates_reports_that_arrive_out_of_order() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        correlator.correlate(build_death(5, "R1"), &mut timeline);
        let late = correlator.correlate(build_death(2, "R2"), &mut timeline);

        assert!(matches!(late, Correlation::Merged { .. }));
        assert_eq!(only_event(&timeline).timestamp, at(5));
    }

    #[test]
    fn keeps_separate_occurrences_outside_window() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        correlator.correlate(build_death(0, "R1"), &mut timeline);
        let later = correlator.correlate(build_death(11, "R2"), &mut timeline);

        assert!(matches!(later, Correlation::Inserted(_)));
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn severity_upgrades_but_never_downgrades() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        correlator.correlate(build_destruction(0, "R1", DestroyLevel::Soft), &mut timeline);
        let upgrade =
            correlator.correlate(build_destruction(2, "R2", DestroyLevel::Hard), &mut timeline);
        let downgrade =
            correlator.correlate(build_destruction(4, "R3", DestroyLevel::Soft), &mut timeline);

        assert!(matches!(upgrade, Correlation::Merged { upgraded: true, .. }));
        assert!(matches!(downgrade, Correlation::Merged { upgraded: false, .. }));

        let event = only_event(&timeline);
        assert_eq!(event.severity(), Some(DestroyLevel::Hard));
        assert_eq!(
            event.reported_by,
            vec![Identity::new("R1"), Identity::new("R2"), Identity::new("R3")]
        );
    }

    #[test]
    fn hard_then_soft_keeps_hard_record() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        correlator.correlate(build_destruction(0, "R1", DestroyLevel::Hard), &mut timeline);
        correlator.correlate(build_destruction(1, "R2", DestroyLevel::Soft), &mut timeline);

        let event = only_event(&timeline);
        assert_eq!(event.severity(), Some(DestroyLevel::Hard));
        assert!(event.source_text.contains("Hard"));
    }

    #[test]
    fn merged_event_keeps_first_position() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        let first = correlator.correlate(build_death(0, "R1"), &mut timeline);
        correlator.correlate(build_destruction(1, "R1", DestroyLevel::Soft), &mut timeline);
        correlator.correlate(build_death(2, "R2"), &mut timeline);

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.position_of(first.id()), Some(0));
    }

    #[test]
    fn keyless_events_bypass_dedup() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        for offset in 0..2 {
            let mut event = build_death(offset, "R1");
            if let EventKind::ActorDeath(death) = &mut event.kind {
                death.victim.id = None;
            }
            correlator.correlate(event, &mut timeline);
        }

        assert_eq!(timeline.len(), 2);
        assert_eq!(correlator.tracked_entries(), 0);
    }

    #[test]
    fn redelivered_event_only_gains_reporters() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        let event = build_death(0, "R1");
        let mut echoed = event.clone();
        echoed.add_reporter(&Identity::new("R2"));

        correlator.correlate(event, &mut timeline);
        correlator.correlate(echoed, &mut timeline);

        assert_eq!(
            only_event(&timeline).reported_by,
            vec![Identity::new("R1"), Identity::new("R2")]
        );
    }

    #[test]
    fn evicts_entries_past_retention() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        correlator.correlate(build_death(0, "R1"), &mut timeline);
        correlator.correlate(build_destruction(30, "R1", DestroyLevel::Soft), &mut timeline);
        assert_eq!(correlator.tracked_entries(), 2);

        correlator.correlate(build_destruction(100, "R1", DestroyLevel::Soft), &mut timeline);
        assert_eq!(correlator.tracked_entries(), 1);
    }

    #[test]
    fn skewed_peer_clock_does_not_disable_dedup() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        let first = correlator.correlate(build_death(0, "R1"), &mut timeline);

        let mut skewed = build_death(3600, "Skewed");
        if let EventKind::ActorDeath(death) = &mut skewed.kind {
            death.victim = entity("Mallory", 9);
        }
        let skewed = correlator.correlate_from(skewed, ReportOrigin::Peer, &mut timeline);
        assert!(matches!(skewed, Correlation::Inserted(_)));
        assert_eq!(correlator.tracked_entries(), 1);

        let duplicate = correlator.correlate_from(build_death(2, "R2"), ReportOrigin::Peer, &mut timeline);
        assert_eq!(duplicate, Correlation::Merged { id: first.id(), upgraded: false });
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn peers_advance_reference_clock_only_within_skew_tolerance() {
        let mut correlator = Correlator::new(&PipelineSettings::default());
        let mut timeline = Timeline::new();

        correlator.correlate(build_death(0, "R1"), &mut timeline);
        correlator.correlate_from(
            build_destruction(4, "R2", DestroyLevel::Soft),
            ReportOrigin::Peer,
            &mut timeline,
        );
        // 64s past the reference clock the peer moved to 4s: still indexed,
        // but too far ahead to move the clock again.
        correlator.correlate_from(
            build_destruction(68, "R2", DestroyLevel::Soft),
            ReportOrigin::Peer,
            &mut timeline,
        );
        assert_eq!(correlator.tracked_entries(), 3, "peer reports never evict");

        correlator.correlate_from(
            build_destruction(140, "R2", DestroyLevel::Hard),
            ReportOrigin::Peer,
            &mut timeline,
        );
        assert_eq!(correlator.tracked_entries(), 3);
        assert_eq!(timeline.len(), 4);
    }
}
