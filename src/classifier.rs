use chrono::{DateTime, Utc};
use regex::{Captures, Regex, RegexBuilder};
use std::time::{Duration, Instant};

use crate::event::{
    ActorDeath, ClassifiedEvent, Connection, DeathManner, DestroyLevel, Direction, Entity,
    EventId, EventKind, Identity, LocationChange, RawLogLine, Vehicle, VehicleControlFlow,
    VehicleDestruction,
};
use crate::settings::PipelineSettings;

const UNKNOWN_VALUE: &str = "unknown";
const DAMAGE_SUICIDE: &str = "Suicide";
const DAMAGE_SELF_DESTRUCT: &str = "SelfDestruct";
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

const NON_PLAYER_PREFIXES: &[&str] = &["PU_", "NPC_", "AIModule_", "Kopion_", "Quasigrazer_"];
const NON_PLAYER_INFIXES: &[&str] = &["_NPC_", "_pet_"];

struct LinePattern {
    name: &'static str,
    marker: &'static str,
    regex: Regex,
}

impl LinePattern {
    fn new(name: &'static str, marker: &'static str, pattern: &str) -> Self {
        let regex = RegexBuilder::new(pattern)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .unwrap_or_else(|error| panic!("invalid {name} pattern: {error}"));
        Self {
            name,
            marker,
            regex,
        }
    }

    /// Matching is bounded by the regex engine's linear-time guarantee over
    /// lines no longer than `max_line_bytes`, so an attempt is never cut off
    /// midway. The elapsed-time check is a fallback: an attempt observed to
    /// run past `budget` is reported as no match.
    fn captures_within<'t>(&self, text: &'t str, budget: Duration) -> Option<Captures<'t>> {
        if !text.contains(self.marker) {
            return None;
        }

        let started_at = Instant::now();
        let captures = self.regex.captures(text);
        let elapsed = started_at.elapsed();
        if elapsed >= budget {
            tracing::debug!(
                pattern = self.name,
                elapsed_micros = elapsed.as_micros() as u64,
                "Pattern attempt exceeded its budget, treating line as unmatched"
            );
            return None;
        }

        captures
    }
}

lazy_static::lazy_static! {
    static ref LOG_TIMESTAMP: Regex =
        Regex::new(r"^<(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z)>").expect("valid timestamp pattern");

    static ref CONNECTION: LinePattern = LinePattern::new(
        "connection",
        "<AccountLoginCharacterStatus_Character>",
        r"<AccountLoginCharacterStatus_Character> Character: .*?geid (?P<id>\d+) .*?name (?P<name>[^\s]+)",
    );

    static ref ACTOR_DEATH: LinePattern = LinePattern::new(
        "actorDeath",
        "<Actor Death>",
        concat!(
            r"<Actor Death> CActor::Kill: '(?P<victim>[^']+)' \[(?P<victim_id>[^\]]*)\]",
            r" in zone '(?P<zone>[^']*)'",
            r" killed by '(?P<killer>[^']+)' \[(?P<killer_id>[^\]]*)\]",
            r" using '(?P<weapon>[^']+)' \[Class (?P<weapon_class>[^\]]+)\]",
            r" with damage type '(?P<damage>[^']+)'",
            r"(?: from direction x: (?P<dx>-?[\d.]+(?:[eE][-+]?\d+)?), y: (?P<dy>-?[\d.]+(?:[eE][-+]?\d+)?), z: (?P<dz>-?[\d.]+(?:[eE][-+]?\d+)?))?",
        ),
    );

    static ref VEHICLE_DESTRUCTION: LinePattern = LinePattern::new(
        "vehicleDestruction",
        "<Vehicle Destruction>",
        concat!(
            r"<Vehicle Destruction> .*?Vehicle '(?P<vehicle>[^']+)' \[(?P<vehicle_id>\d+)\]",
            r" in zone '(?P<zone>[^']*)'",
            r".*? driven by '(?P<driver>[^']+)' \[(?P<driver_id>[^\]]*)\]",
            r" advanced from destroy level (?P<from>\d+) to (?P<to>\d+)",
            r" caused by '(?P<cause>[^']+)' \[(?P<cause_id>[^\]]*)\]",
            r"(?: with '(?P<damage>[^']+)')?",
        ),
    );

    static ref VEHICLE_CONTROL_FLOW: LinePattern = LinePattern::new(
        "vehicleControlFlow",
        "<Vehicle Control Flow>",
        concat!(
            r"<Vehicle Control Flow> .*?(?:\[(?P<controller>\d+)\] )?",
            r"(?:requesting|granted) control token for '(?P<vehicle>[^']+)' \[(?P<vehicle_id>\d+)\]",
        ),
    );

    static ref LOCATION_CHANGE: LinePattern = LinePattern::new(
        "locationChange",
        "<RequestLocationInventory>",
        r"<RequestLocationInventory> Player\[(?P<player>[^\]]+)\] requested inventory for Location\[(?P<location>[^\]]+)\]",
    );

    static ref SYSTEM_QUIT: LinePattern = LinePattern::new(
        "systemQuit",
        "<SystemQuit>",
        r"<SystemQuit>",
    );
}

/// Turns raw log lines into typed events. Holds only immutable limits, so a
/// single instance can be shared freely.
#[derive(Debug, Clone)]
pub struct Classifier {
    pattern_budget: Duration,
    max_line_bytes: usize,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(&PipelineSettings::default())
    }
}

impl Classifier {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            pattern_budget: settings.pattern_budget(),
            max_line_bytes: settings.max_line_bytes,
        }
    }

    pub fn with_budget(pattern_budget: Duration) -> Self {
        Self {
            pattern_budget,
            ..Self::default()
        }
    }

    pub fn classify(&self, line: &RawLogLine) -> Option<ClassifiedEvent> {
        let text = line.text.trim();
        if text.is_empty() {
            return None;
        }

        if text.len() > self.max_line_bytes {
            tracing::debug!(
                line_bytes = text.len(),
                max_line_bytes = self.max_line_bytes,
                "Skipping oversized log line"
            );
            return None;
        }

        let kind = self.classify_kind(text)?;

        Some(ClassifiedEvent {
            id: EventId::for_observation(line.arrival_time, text),
            timestamp: extract_log_timestamp(text).unwrap_or(line.arrival_time),
            player: None,
            source_text: text.to_string(),
            reported_by: Vec::new(),
            kind,
        })
    }

    fn classify_kind(&self, text: &str) -> Option<EventKind> {
        let budget = self.pattern_budget;

        if let Some(captures) = ACTOR_DEATH.captures_within(text, budget) {
            return Some(EventKind::ActorDeath(parse_actor_death(&captures)));
        }
        if let Some(captures) = VEHICLE_DESTRUCTION.captures_within(text, budget) {
            return parse_vehicle_destruction(&captures).map(EventKind::VehicleDestruction);
        }
        if let Some(captures) = VEHICLE_CONTROL_FLOW.captures_within(text, budget) {
            return parse_vehicle_control_flow(&captures).map(EventKind::VehicleControlFlow);
        }
        if let Some(captures) = CONNECTION.captures_within(text, budget) {
            return parse_connection(&captures).map(EventKind::Connection);
        }
        if let Some(captures) = LOCATION_CHANGE.captures_within(text, budget) {
            return Some(EventKind::LocationChange(LocationChange {
                player: Identity::new(capture(&captures, "player")?),
                location: capture(&captures, "location")?.to_string(),
            }));
        }
        if SYSTEM_QUIT.captures_within(text, budget).is_some() {
            return Some(EventKind::SystemQuit);
        }

        None
    }
}

/// Classifies with default limits.
pub fn classify(line: &RawLogLine) -> Option<ClassifiedEvent> {
    Classifier::default().classify(line)
}

fn capture<'t>(captures: &Captures<'t>, name: &str) -> Option<&'t str> {
    captures
        .name(name)
        .map(|value| value.as_str().trim())
        .filter(|value| !value.is_empty())
}

fn attributed<'t>(captures: &Captures<'t>, name: &str) -> Option<&'t str> {
    capture(captures, name).filter(|value| !value.eq_ignore_ascii_case(UNKNOWN_VALUE))
}

fn parse_entity(captures: &Captures<'_>, name_group: &str, id_group: &str) -> Option<Entity> {
    let name = attributed(captures, name_group)?;
    Some(Entity {
        name: name.to_string(),
        id: capture(captures, id_group).and_then(|value| value.parse::<u64>().ok()),
        is_player: !is_non_player_name(name),
    })
}

fn parse_actor_death(captures: &Captures<'_>) -> ActorDeath {
    let victim = parse_entity(captures, "victim", "victim_id").unwrap_or_else(|| Entity {
        name: UNKNOWN_VALUE.to_string(),
        id: None,
        is_player: false,
    });
    let raw_damage = attributed(captures, "damage");
    let killer = parse_entity(captures, "killer", "killer_id");

    let (manner, killer) = match raw_damage {
        Some(DAMAGE_SUICIDE) => (DeathManner::Suicide, Some(victim.clone())),
        Some(DAMAGE_SELF_DESTRUCT) => {
            let external_killer = killer.filter(|entity| entity.name != victim.name);
            (DeathManner::SelfDestruct, external_killer)
        }
        _ if killer.is_none() => (DeathManner::Unattributed, None),
        _ => (DeathManner::Killed, killer),
    };

    ActorDeath {
        zone: capture(captures, "zone").unwrap_or_default().to_string(),
        weapon_instance: attributed(captures, "weapon").map(str::to_string),
        weapon_class: attributed(captures, "weapon_class").map(str::to_string),
        damage_type: raw_damage.map(humanize_damage_type),
        direction: parse_direction(captures),
        victim,
        killer,
        manner,
    }
}

fn parse_direction(captures: &Captures<'_>) -> Option<Direction> {
    let component = |name: &str| capture(captures, name)?.parse::<f64>().ok();
    Some(Direction {
        x: component("dx")?,
        y: component("dy")?,
        z: component("dz")?,
    })
}

fn parse_vehicle(captures: &Captures<'_>) -> Option<Vehicle> {
    let raw_name = capture(captures, "vehicle")?;
    Some(Vehicle {
        name: strip_instance_suffix(raw_name).to_string(),
        raw_name: raw_name.to_string(),
        id: capture(captures, "vehicle_id")?.parse::<u64>().ok()?,
    })
}

fn parse_vehicle_destruction(captures: &Captures<'_>) -> Option<VehicleDestruction> {
    let level = |name: &str| {
        capture(captures, name)
            .and_then(|value| value.parse::<u8>().ok())
            .map(DestroyLevel::from_level)
    };

    Some(VehicleDestruction {
        vehicle: parse_vehicle(captures)?,
        zone: attributed(captures, "zone").map(str::to_string),
        driver: parse_entity(captures, "driver", "driver_id"),
        cause: parse_entity(captures, "cause", "cause_id"),
        destroy_level_from: level("from")?,
        destroy_level_to: level("to")?,
        damage_type: attributed(captures, "damage").map(humanize_damage_type),
    })
}

fn parse_vehicle_control_flow(captures: &Captures<'_>) -> Option<VehicleControlFlow> {
    Some(VehicleControlFlow {
        vehicle: parse_vehicle(captures)?,
        controller_id: capture(captures, "controller").and_then(|value| value.parse().ok()),
    })
}

fn parse_connection(captures: &Captures<'_>) -> Option<Connection> {
    Some(Connection {
        player: Identity::new(capture(captures, "name")?),
        entity_id: capture(captures, "id")?.parse::<u64>().ok()?,
    })
}

fn extract_log_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let raw_timestamp = LOG_TIMESTAMP.captures(text)?.get(1)?.as_str();
    DateTime::parse_from_rfc3339(raw_timestamp)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

/// `ANVL_Hornet_F7A_Mk2_1234567` becomes `ANVL_Hornet_F7A_Mk2`.
pub fn strip_instance_suffix(name: &str) -> &str {
    let Some((without_suffix, suffix)) = name.rsplit_once('_') else {
        return name;
    };

    if without_suffix.is_empty()
        || suffix.is_empty()
        || !suffix.chars().all(|character| character.is_ascii_digit())
    {
        return name;
    }

    without_suffix
}

/// `VehicleDestruction` becomes `vehicle destruction`, `EMPBurst` becomes `emp burst`.
pub fn humanize_damage_type(raw: &str) -> String {
    let characters: Vec<char> = raw.chars().collect();
    let mut words = String::with_capacity(raw.len() + 4);

    for (index, &character) in characters.iter().enumerate() {
        if character == '_' || character == ' ' {
            if !words.ends_with(' ') && !words.is_empty() {
                words.push(' ');
            }
            continue;
        }

        if character.is_uppercase() && index > 0 && !words.ends_with(' ') {
            let previous = characters[index - 1];
            let next_is_lower = characters
                .get(index + 1)
                .map(|next| next.is_lowercase())
                .unwrap_or(false);
            if previous.is_lowercase()
                || previous.is_ascii_digit()
                || (previous.is_uppercase() && next_is_lower)
            {
                words.push(' ');
            }
        }

        words.extend(character.to_lowercase());
    }

    words.trim_end().to_string()
}

pub fn is_non_player_name(name: &str) -> bool {
    NON_PLAYER_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
        || NON_PLAYER_INFIXES.iter().any(|infix| name.contains(infix))
}
