use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::classifier::Classifier;
use crate::correlator::{Correlation, Correlator, ReportOrigin};
use crate::error::Result;
use crate::event::{ClassifiedEvent, EventKind, Identity, RawLogLine};
use crate::settings::PipelineSettings;
use crate::spree::SpreeAggregator;
use crate::timeline::{Timeline, TimelineUpdate};

/// An already-classified event received from another player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEvent {
    pub sender: Identity,
    pub sender_display_name: String,
    pub event: ClassifiedEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineInput {
    Line(RawLogLine),
    Peer(PeerEvent),
}

/// Serialized classify → correlate → aggregate path. Every input runs to
/// completion before the next one is admitted.
#[derive(Debug)]
pub struct EventPipeline {
    classifier: Classifier,
    correlator: Correlator,
    sprees: SpreeAggregator,
    timeline: Timeline,
    local_player: Option<Identity>,
    local_player_pinned: bool,
    max_reporters_per_event: usize,
    max_source_text_bytes: usize,
}

impl EventPipeline {
    pub fn new(settings: PipelineSettings) -> Result<Self> {
        settings.validate()?;

        Ok(Self {
            classifier: Classifier::new(&settings),
            correlator: Correlator::new(&settings),
            sprees: SpreeAggregator::new(&settings),
            timeline: Timeline::new(),
            local_player_pinned: settings.local_player.is_some(),
            local_player: settings.local_player,
            max_reporters_per_event: settings.max_reporters_per_event,
            max_source_text_bytes: settings.max_source_text_bytes,
        })
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn local_player(&self) -> Option<&Identity> {
        self.local_player.as_ref()
    }

    pub fn process(&mut self, input: PipelineInput) -> Vec<TimelineUpdate> {
        match input {
            PipelineInput::Line(line) => self.ingest_line(&line),
            PipelineInput::Peer(peer_event) => self.ingest_peer_event(peer_event),
        }
    }

    /// Classifies a local log line and stamps it with the local player as
    /// reporter. The character login line identifies the local player unless
    /// the settings pin one.
    pub fn ingest_line(&mut self, line: &RawLogLine) -> Vec<TimelineUpdate> {
        let Some(event) = self.classifier.classify(line) else {
            return Vec::new();
        };

        if let EventKind::Connection(connection) = &event.kind {
            if !self.local_player_pinned && self.local_player.as_ref() != Some(&connection.player) {
                tracing::info!(player = %connection.player, "Local player identified");
                self.local_player = Some(connection.player.clone());
            }
        }

        let event = event.with_reporter(self.local_player.clone());
        self.admit(event, ReportOrigin::Local)
    }

    /// Admits a peer's event at the correlation stage, after basic bounds
    /// checks. The sender is always recorded as a reporter.
    pub fn ingest_peer_event(&mut self, peer_event: PeerEvent) -> Vec<TimelineUpdate> {
        let PeerEvent {
            sender,
            sender_display_name,
            mut event,
        } = peer_event;

        if event.source_text.len() > self.max_source_text_bytes {
            tracing::debug!(
                sender = %sender,
                sender_display_name = %sender_display_name,
                source_text_bytes = event.source_text.len(),
                "Dropping peer event with oversized source text"
            );
            return Vec::new();
        }

        let claimed_reporters = std::mem::take(&mut event.reported_by);
        for reporter in claimed_reporters
            .iter()
            .take(self.max_reporters_per_event.saturating_sub(1))
        {
            event.add_reporter(reporter);
        }
        event.add_reporter(&sender);
        if event.player.is_none() {
            event.player = Some(sender.clone());
        }

        tracing::debug!(
            sender = %sender,
            sender_display_name = %sender_display_name,
            event_id = %event.id,
            kind = event.kind_tag().as_str(),
            "Received peer event"
        );
        self.admit(event, ReportOrigin::Peer)
    }

    fn admit(&mut self, event: ClassifiedEvent, origin: ReportOrigin) -> Vec<TimelineUpdate> {
        let correlation = self
            .correlator
            .correlate_from(event, origin, &mut self.timeline);
        if let Correlation::Inserted(event_id) = correlation {
            self.sprees.aggregate(event_id, &mut self.timeline);
        }

        self.timeline.take_updates()
    }
}

/// Drives `pipeline` from a single ordered queue so that the file tail and
/// any number of peer connections share one writer. Resolves to the
/// pipeline once every input sender is dropped.
pub fn spawn_pipeline_worker(
    mut pipeline: EventPipeline,
    mut input_receiver: mpsc::Receiver<PipelineInput>,
    update_sender: mpsc::UnboundedSender<Vec<TimelineUpdate>>,
) -> JoinHandle<EventPipeline> {
    tokio::spawn(async move {
        while let Some(input) = input_receiver.recv().await {
            let updates = pipeline.process(input);
            if updates.is_empty() {
                continue;
            }

            if update_sender.send(updates).is_err() {
                tracing::warn!("Timeline update receiver dropped, continuing without display updates");
            }
        }

        tracing::debug!("Pipeline input queue closed");
        pipeline
    })
}

#[cfg(test)]
mod tests {
    use super::{spawn_pipeline_worker, EventPipeline, PeerEvent, PipelineInput};
    use crate::classifier::classify;
    use crate::display::describe_record;
    use crate::event::{Identity, RawLogLine};
    use crate::settings::PipelineSettings;
    use crate::sync::SyncTracker;
    use crate::timeline::{TimelineRecord, TimelineUpdate};
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use tokio::sync::mpsc;

    fn at(offset_seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + TimeDelta::seconds(offset_seconds)
    }

    fn stamp(offset_seconds: i64) -> String {
        at(offset_seconds).format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    fn login_line(name: &str, offset_seconds: i64) -> RawLogLine {
        RawLogLine::new(
            format!(
                "<{}> [Notice] <AccountLoginCharacterStatus_Character> Character: createdAt 1 - \
                 updatedAt 2 - geid 300000000001 - accountId 7 - name {name} - state STATE_CURRENT",
                stamp(offset_seconds)
            ),
            at(offset_seconds),
        )
    }

    fn kill_line(victim: &str, victim_id: u64, killer: &str, offset_seconds: i64) -> RawLogLine {
        RawLogLine::new(
            format!(
                "<{}> [Notice] <Actor Death> CActor::Kill: '{victim}' [{victim_id}] in zone 'Stanton_X' \
                 killed by '{killer}' [300000000001] using 'KLWE_LaserRepeater_S3_1' \
                 [Class KLWE_LaserRepeater_S3] with damage type 'Bullet' [Team_ActorTech][Actor]",
                stamp(offset_seconds)
            ),
            at(offset_seconds),
        )
    }

    fn peer_copy(line: &RawLogLine, sender: &str) -> PeerEvent {
        let event = classify(line)
            .expect("peer line should classify")
            .with_reporter(Some(Identity::new(sender)));
        PeerEvent {
            sender: Identity::new(sender),
            sender_display_name: format!("{sender} (peer)"),
            event,
        }
    }

    fn pipeline(window_secs: u64, min_kills: usize) -> EventPipeline {
        EventPipeline::new(PipelineSettings {
            spree_window_secs: window_secs,
            spree_min_kills: min_kills,
            ..PipelineSettings::default()
        })
        .expect("valid settings")
    }

    #[test]
    fn independent_reports_of_one_death_merge() {
        let mut pipeline = EventPipeline::new(PipelineSettings {
            local_player: Some(Identity::new("R1")),
            ..PipelineSettings::default()
        })
        .expect("valid settings");

        pipeline.ingest_line(&kill_line("Bob", 11, "Alice", 0));
        let updates = pipeline.ingest_peer_event(peer_copy(&kill_line("Bob", 11, "Alice", 3), "R2"));

        assert_eq!(pipeline.timeline().len(), 1);
        let Some(TimelineRecord::Event(event)) = pipeline.timeline().iter().next() else {
            panic!("expected a single event");
        };
        assert_eq!(event.reported_by, vec![Identity::new("R1"), Identity::new("R2")]);
        assert!(matches!(updates.as_slice(), [TimelineUpdate::Updated { .. }]));
    }

    #[test]
    fn peer_with_clock_far_ahead_leaves_dedup_intact() {
        let mut pipeline = EventPipeline::new(PipelineSettings {
            local_player: Some(Identity::new("R1")),
            ..PipelineSettings::default()
        })
        .expect("valid settings");

        pipeline.ingest_line(&kill_line("Bob", 11, "Alice", 0));
        pipeline.ingest_peer_event(peer_copy(&kill_line("Mallory", 12, "Eve", 3600), "Skewed"));
        pipeline.ingest_peer_event(peer_copy(&kill_line("Bob", 11, "Alice", 2), "R2"));

        assert_eq!(pipeline.timeline().len(), 2);
        let Some(TimelineRecord::Event(event)) = pipeline.timeline().iter().next() else {
            panic!("expected the local report first");
        };
        assert_eq!(event.reported_by, vec![Identity::new("R1"), Identity::new("R2")]);
    }

    #[test]
    fn five_kills_form_spree_and_sixth_starts_over() {
        let mut pipeline = pipeline(120, 3);
        pipeline.ingest_line(&login_line("Alice", -10));
        assert_eq!(pipeline.local_player(), Some(&Identity::new("Alice")));

        for (index, offset) in [0, 20, 45, 70, 90].into_iter().enumerate() {
            pipeline.ingest_line(&kill_line(&format!("victim-{index}"), 100 + index as u64, "Alice", offset));
        }

        let sprees: Vec<String> = pipeline
            .timeline()
            .iter()
            .filter(|record| matches!(record, TimelineRecord::Spree(_)))
            .map(describe_record)
            .collect();
        assert_eq!(sprees, vec!["Alice killing spree ×5".to_string()]);

        pipeline.ingest_line(&kill_line("late", 200, "Alice", 290));
        let records: Vec<&TimelineRecord> = pipeline.timeline().iter().collect();
        // login, finalized spree, fresh standalone kill
        assert_eq!(records.len(), 3);
        assert!(matches!(records[1], TimelineRecord::Spree(spree) if spree.finalized));
        assert!(matches!(records[2], TimelineRecord::Event(_)));
    }

    #[test]
    fn kills_before_login_have_no_reporter_and_no_spree() {
        let mut pipeline = pipeline(120, 2);
        pipeline.ingest_line(&kill_line("Bob", 1, "Alice", 0));
        pipeline.ingest_line(&kill_line("Carol", 2, "Alice", 5));

        assert_eq!(pipeline.timeline().len(), 2);
        assert!(pipeline
            .timeline()
            .classified_events()
            .all(|event| event.reported_by.is_empty()));
    }

    #[test]
    fn peer_input_is_bounds_checked() {
        let mut pipeline = EventPipeline::new(PipelineSettings {
            max_reporters_per_event: 3,
            max_source_text_bytes: 600,
            ..PipelineSettings::default()
        })
        .expect("valid settings");

        let mut crowded = peer_copy(&kill_line("Bob", 1, "Alice", 0), "Sender");
        crowded.event.reported_by = (0..10).map(|index| Identity::new(format!("claimed-{index}"))).collect();
        crowded.event.reported_by.push(Identity::new("claimed-0"));
        pipeline.ingest_peer_event(crowded);

        let event = pipeline.timeline().classified_events().next().expect("event admitted");
        assert_eq!(
            event.reported_by,
            vec![
                Identity::new("claimed-0"),
                Identity::new("claimed-1"),
                Identity::new("Sender")
            ]
        );

        let mut oversized = peer_copy(&kill_line("Carol", 2, "Alice", 60), "Sender");
        oversized.event.source_text = "x".repeat(601);
        assert!(pipeline.ingest_peer_event(oversized).is_empty());
        assert_eq!(pipeline.timeline().len(), 1);
    }

    #[test]
    fn sync_batches_follow_pipeline_output() {
        let mut pipeline = pipeline(120, 2);
        pipeline.ingest_line(&login_line("Alice", 0));
        pipeline.ingest_line(&kill_line("Bob", 1, "Alice", 10));
        pipeline.ingest_line(&kill_line("Carol", 2, "Alice", 20));

        let peer = Identity::new("peer-1");
        let mut tracker = SyncTracker::new();
        let batch = tracker.events_since(&peer, pipeline.timeline());
        assert_eq!(batch.len(), 3, "spree children are sent individually");

        let last_sent = batch.last().map(|event| event.timestamp).expect("non-empty batch");
        tracker.advance(&peer, last_sent);
        assert!(tracker.events_since(&peer, pipeline.timeline()).is_empty());
    }

    #[tokio::test]
    async fn worker_processes_queue_in_order() {
        let (input_sender, input_receiver) = mpsc::channel(16);
        let (update_sender, mut update_receiver) = mpsc::unbounded_channel();
        let handle = spawn_pipeline_worker(pipeline(120, 2), input_receiver, update_sender);

        input_sender
            .send(PipelineInput::Line(login_line("Alice", 0)))
            .await
            .expect("queue open");
        input_sender
            .send(PipelineInput::Line(RawLogLine::new("unrelated noise", at(1))))
            .await
            .expect("queue open");
        input_sender
            .send(PipelineInput::Line(kill_line("Bob", 1, "Alice", 2)))
            .await
            .expect("queue open");
        drop(input_sender);

        let pipeline = handle.await.expect("worker should finish");
        assert_eq!(pipeline.timeline().len(), 2);

        let mut batches = Vec::new();
        while let Ok(batch) = update_receiver.try_recv() {
            batches.push(batch);
        }
        assert_eq!(batches.len(), 2, "unmatched lines produce no update batch");
    }
}
