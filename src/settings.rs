use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{KillfeedError, Result};
use crate::event::{EventKindTag, Identity};

const DEFAULT_SPREE_WINDOW_SECS: u64 = 120;
const DEFAULT_SPREE_MIN_KILLS: usize = 2;
const DEFAULT_CLOCK_SKEW_TOLERANCE_SECS: u64 = 5;
const DEFAULT_PATTERN_BUDGET_MICROS: u64 = 50_000;
const DEFAULT_MAX_LINE_BYTES: usize = 4_096;
const DEFAULT_MAX_REPORTERS_PER_EVENT: usize = 64;
const DEFAULT_MAX_SOURCE_TEXT_BYTES: usize = 8_192;

/// Dedup windows per event kind, in seconds. Zero opts a kind out of dedup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupWindows {
    pub connection: u64,
    pub actor_death: u64,
    pub vehicle_destruction: u64,
    pub vehicle_control_flow: u64,
    pub location_change: u64,
}

impl Default for DedupWindows {
    fn default() -> Self {
        Self {
            connection: 60,
            actor_death: 10,
            vehicle_destruction: 10,
            vehicle_control_flow: 5,
            location_change: 5,
        }
    }
}

impl DedupWindows {
    pub fn window_for(&self, kind: EventKindTag) -> Option<TimeDelta> {
        let seconds = match kind {
            EventKindTag::Connection => self.connection,
            EventKindTag::ActorDeath => self.actor_death,
            EventKindTag::VehicleDestruction => self.vehicle_destruction,
            EventKindTag::VehicleControlFlow => self.vehicle_control_flow,
            EventKindTag::LocationChange => self.location_change,
            EventKindTag::SystemQuit | EventKindTag::Other | EventKindTag::Spree => 0,
        };

        if seconds == 0 {
            return None;
        }

        Some(TimeDelta::seconds(seconds as i64))
    }

    fn longest(&self) -> u64 {
        [
            self.connection,
            self.actor_death,
            self.vehicle_destruction,
            self.vehicle_control_flow,
            self.location_change,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub dedup_windows: DedupWindows,
    pub clock_skew_tolerance_secs: u64,
    pub spree_window_secs: u64,
    pub spree_min_kills: usize,
    pub pattern_budget_micros: u64,
    pub max_line_bytes: usize,
    pub max_reporters_per_event: usize,
    pub max_source_text_bytes: usize,
    pub local_player: Option<Identity>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dedup_windows: DedupWindows::default(),
            clock_skew_tolerance_secs: DEFAULT_CLOCK_SKEW_TOLERANCE_SECS,
            spree_window_secs: DEFAULT_SPREE_WINDOW_SECS,
            spree_min_kills: DEFAULT_SPREE_MIN_KILLS,
            pattern_budget_micros: DEFAULT_PATTERN_BUDGET_MICROS,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_reporters_per_event: DEFAULT_MAX_REPORTERS_PER_EVENT,
            max_source_text_bytes: DEFAULT_MAX_SOURCE_TEXT_BYTES,
            local_player: None,
        }
    }
}

impl PipelineSettings {
    pub fn from_json_str(raw_json: &str) -> Result<Self> {
        let settings = serde_json::from_str::<PipelineSettings>(raw_json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw_json = std::fs::read_to_string(path).map_err(|source| KillfeedError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw_json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.spree_min_kills < 2 {
            return Err(KillfeedError::InvalidSettings(format!(
                "spreeMinKills must be at least 2, got {}",
                self.spree_min_kills
            )));
        }

        if self.spree_window_secs == 0 {
            return Err(KillfeedError::InvalidSettings(
                "spreeWindowSecs must be greater than zero".to_string(),
            ));
        }

        if self.pattern_budget_micros == 0 {
            return Err(KillfeedError::InvalidSettings(
                "patternBudgetMicros must be greater than zero".to_string(),
            ));
        }

        if self.max_line_bytes == 0 || self.max_source_text_bytes == 0 {
            return Err(KillfeedError::InvalidSettings(
                "line and source text bounds must be greater than zero".to_string(),
            ));
        }

        if self.max_reporters_per_event == 0 {
            return Err(KillfeedError::InvalidSettings(
                "maxReportersPerEvent must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn spree_window(&self) -> TimeDelta {
        TimeDelta::seconds(self.spree_window_secs as i64)
    }

    pub fn clock_skew_tolerance(&self) -> TimeDelta {
        TimeDelta::seconds(self.clock_skew_tolerance_secs as i64)
    }

    pub fn pattern_budget(&self) -> Duration {
        Duration::from_micros(self.pattern_budget_micros)
    }

    /// How long a dedup entry may stay indexed before it can no longer match.
    pub fn dedup_retention(&self) -> TimeDelta {
        TimeDelta::seconds((self.dedup_windows.longest() + self.clock_skew_tolerance_secs) as i64)
    }
}
