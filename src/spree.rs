use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, VecDeque};

use crate::event::{DeathManner, EventId, Identity, SpreeEvent};
use crate::settings::PipelineSettings;
use crate::timeline::Timeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Not a kill by its reporter; left untouched.
    Ignored,
    /// Buffered, but still below the spree minimum.
    Standalone,
    Started { spree_id: EventId },
    Extended { spree_id: EventId },
}

#[derive(Debug, Clone, Copy)]
struct BufferedKill {
    event_id: EventId,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SpreeGroup {
    buffer: VecDeque<BufferedKill>,
    active_spree: Option<EventId>,
}

impl SpreeGroup {
    fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.buffer.iter().map(|kill| kill.timestamp).max()
    }
}

/// Groups each killer's consecutive kills into a spree parent. Groups are keyed
/// by killer identity only, so two killers never share a spree.
#[derive(Debug)]
pub struct SpreeAggregator {
    window: TimeDelta,
    min_kills: usize,
    groups: HashMap<Identity, SpreeGroup>,
}

impl SpreeAggregator {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            window: settings.spree_window(),
            min_kills: settings.spree_min_kills.max(2),
            groups: HashMap::new(),
        }
    }

    pub fn active_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn aggregate(&mut self, event_id: EventId, timeline: &mut Timeline) -> Aggregation {
        let Some((killer, timestamp)) = qualifying_kill(event_id, timeline) else {
            return Aggregation::Ignored;
        };
        if timeline.parent_of(event_id).is_some() {
            return Aggregation::Ignored;
        }

        self.evict_idle_groups(&killer, timestamp, timeline);

        let window = self.window;
        let group = self.groups.entry(killer.clone()).or_default();

        // Only an idle gap since the killer's latest kill closes the spree. A
        // steady killing rate keeps extending it past one window length.
        let idle = group
            .latest_timestamp()
            .map(|latest| timestamp - latest > window)
            .unwrap_or(false);
        if idle {
            group.buffer.clear();
            if let Some(spree_id) = group.active_spree.take() {
                timeline.finalize_spree(spree_id);
                tracing::debug!(killer = %killer, spree_id = %spree_id, "Finalized kill spree");
            }
        }

        while let Some(oldest) = group.buffer.front() {
            if timestamp - oldest.timestamp <= window {
                break;
            }
            group.buffer.pop_front();
        }

        group.buffer.push_back(BufferedKill {
            event_id,
            timestamp,
        });

        if let Some(spree_id) = group.active_spree {
            timeline.attach_child(spree_id, event_id, timestamp);
            return Aggregation::Extended { spree_id };
        }

        if group.buffer.len() < self.min_kills {
            return Aggregation::Standalone;
        }

        let children: Vec<EventId> = group.buffer.iter().map(|kill| kill.event_id).collect();
        let spree_timestamp = group.latest_timestamp().unwrap_or(timestamp);
        let spree_id = EventId::for_spree(&killer, children[0]);
        let spree = SpreeEvent {
            id: spree_id,
            killer: killer.clone(),
            kill_count: children.len(),
            timestamp: spree_timestamp,
            children,
            finalized: false,
        };

        if timeline.promote_spree(spree).is_none() {
            tracing::debug!(killer = %killer, "Spree children missing from timeline, kill left standalone");
            return Aggregation::Standalone;
        }

        group.active_spree = Some(spree_id);
        tracing::debug!(killer = %killer, spree_id = %spree_id, "Started kill spree");
        Aggregation::Started { spree_id }
    }

    /// Drops other killers' groups that went idle, finalizing their sprees.
    fn evict_idle_groups(&mut self, current: &Identity, now: DateTime<Utc>, timeline: &mut Timeline) {
        let window = self.window;
        self.groups.retain(|killer, group| {
            if killer == current {
                return true;
            }

            let idle = group
                .latest_timestamp()
                .map(|latest| now - latest > window)
                .unwrap_or(true);
            if idle {
                if let Some(spree_id) = group.active_spree.take() {
                    timeline.finalize_spree(spree_id);
                }
            }
            !idle
        });
    }
}

/// The killer identity and timestamp when the event is a kill credited to its
/// own reporter. Suicides never count.
fn qualifying_kill(event_id: EventId, timeline: &Timeline) -> Option<(Identity, DateTime<Utc>)> {
    let event = timeline.event(event_id)?;
    let death = event.as_actor_death()?;
    if death.manner == DeathManner::Suicide {
        return None;
    }

    let killer = death.killer_identity()?;
    if event.player.as_ref() != Some(&killer) {
        return None;
    }

    Some((killer, event.timestamp))
}
