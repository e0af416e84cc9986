use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5b1f_77c2_94a0_4a8e_b6f3_2c1d_0e9a_4d17);

/// Player or peer identity, compared by exact name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Derived from the observation itself so that classifying the same line
    /// twice yields the same id.
    pub fn for_observation(arrival_time: DateTime<Utc>, text: &str) -> Self {
        let seed = format!("{}|{}", arrival_time.timestamp_micros(), text);
        Self(Uuid::new_v5(&EVENT_ID_NAMESPACE, seed.as_bytes()))
    }

    pub fn for_spree(killer: &Identity, first_kill: EventId) -> Self {
        let seed = format!("spree|{}|{}", killer, first_kill.0);
        Self(Uuid::new_v5(&EVENT_ID_NAMESPACE, seed.as_bytes()))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, formatter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogLine {
    pub text: String,
    pub arrival_time: DateTime<Utc>,
}

impl RawLogLine {
    pub fn new(text: impl Into<String>, arrival_time: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            arrival_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub is_player: bool,
}

impl Entity {
    pub fn identity(&self) -> Identity {
        Identity::new(self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    /// Name with the trailing instance suffix removed.
    pub name: String,
    pub raw_name: String,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeathManner {
    Killed,
    Suicide,
    SelfDestruct,
    Unattributed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DestroyLevel {
    None,
    Soft,
    Hard,
}

impl DestroyLevel {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => DestroyLevel::None,
            1 => DestroyLevel::Soft,
            _ => DestroyLevel::Hard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub player: Identity,
    pub entity_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDeath {
    pub victim: Entity,
    pub zone: String,
    /// `None` when the log reports the killer as unknown.
    pub killer: Option<Entity>,
    pub weapon_instance: Option<String>,
    pub weapon_class: Option<String>,
    /// Lower-case words, e.g. `vehicle destruction`.
    pub damage_type: Option<String>,
    pub direction: Option<Direction>,
    pub manner: DeathManner,
}

impl ActorDeath {
    pub fn killer_identity(&self) -> Option<Identity> {
        self.killer.as_ref().map(Entity::identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleDestruction {
    pub vehicle: Vehicle,
    pub zone: Option<String>,
    pub driver: Option<Entity>,
    pub cause: Option<Entity>,
    pub destroy_level_from: DestroyLevel,
    pub destroy_level_to: DestroyLevel,
    pub damage_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleControlFlow {
    pub vehicle: Vehicle,
    pub controller_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationChange {
    pub player: Identity,
    pub location: String,
}

impl LocationChange {
    pub fn display_location(&self) -> String {
        self.location.replace('_', " ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    Connection(Connection),
    ActorDeath(ActorDeath),
    VehicleDestruction(VehicleDestruction),
    VehicleControlFlow(VehicleControlFlow),
    LocationChange(LocationChange),
    SystemQuit,
    Other { label: String },
}

/// Field-less discriminant, used for counts and per-kind policy lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKindTag {
    Connection,
    ActorDeath,
    VehicleDestruction,
    VehicleControlFlow,
    LocationChange,
    SystemQuit,
    Other,
    Spree,
}

impl EventKindTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKindTag::Connection => "connection",
            EventKindTag::ActorDeath => "actorDeath",
            EventKindTag::VehicleDestruction => "vehicleDestruction",
            EventKindTag::VehicleControlFlow => "vehicleControlFlow",
            EventKindTag::LocationChange => "locationChange",
            EventKindTag::SystemQuit => "systemQuit",
            EventKindTag::Other => "other",
            EventKindTag::Spree => "spree",
        }
    }
}

/// What makes two reports "the same occurrence". The kind is part of the key,
/// so a boarding and a destruction of one vehicle never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Connection(Identity),
    ActorDeath(u64),
    VehicleDestruction(u64),
    VehicleControlFlow(u64),
    LocationChange(Identity),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub player: Option<Identity>,
    pub source_text: String,
    pub reported_by: Vec<Identity>,
    pub kind: EventKind,
}

impl ClassifiedEvent {
    pub fn kind_tag(&self) -> EventKindTag {
        match &self.kind {
            EventKind::Connection(_) => EventKindTag::Connection,
            EventKind::ActorDeath(_) => EventKindTag::ActorDeath,
            EventKind::VehicleDestruction(_) => EventKindTag::VehicleDestruction,
            EventKind::VehicleControlFlow(_) => EventKindTag::VehicleControlFlow,
            EventKind::LocationChange(_) => EventKindTag::LocationChange,
            EventKind::SystemQuit => EventKindTag::SystemQuit,
            EventKind::Other { .. } => EventKindTag::Other,
        }
    }

    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        match &self.kind {
            EventKind::Connection(connection) => {
                Some(CorrelationKey::Connection(connection.player.clone()))
            }
            EventKind::ActorDeath(death) => death.victim.id.map(CorrelationKey::ActorDeath),
            EventKind::VehicleDestruction(destruction) => Some(
                CorrelationKey::VehicleDestruction(destruction.vehicle.id),
            ),
            EventKind::VehicleControlFlow(control) => {
                Some(CorrelationKey::VehicleControlFlow(control.vehicle.id))
            }
            EventKind::LocationChange(location) => {
                Some(CorrelationKey::LocationChange(location.player.clone()))
            }
            EventKind::SystemQuit | EventKind::Other { .. } => None,
        }
    }

    /// Ordered severity, only defined for kinds that escalate.
    pub fn severity(&self) -> Option<DestroyLevel> {
        match &self.kind {
            EventKind::VehicleDestruction(destruction) => Some(destruction.destroy_level_to),
            _ => None,
        }
    }

    pub fn as_actor_death(&self) -> Option<&ActorDeath> {
        match &self.kind {
            EventKind::ActorDeath(death) => Some(death),
            _ => None,
        }
    }

    /// Sets the reporting player and seeds `reported_by` with it.
    pub fn with_reporter(mut self, reporter: Option<Identity>) -> Self {
        if let Some(reporter) = reporter.as_ref() {
            self.add_reporter(reporter);
        }
        self.player = reporter;
        self
    }

    /// Returns `false` when the identity was already listed.
    pub fn add_reporter(&mut self, reporter: &Identity) -> bool {
        if self.reported_by.contains(reporter) {
            return false;
        }

        self.reported_by.push(reporter.clone());
        true
    }

    pub fn merge_reporters<'a>(&mut self, reporters: impl IntoIterator<Item = &'a Identity>) {
        for reporter in reporters {
            self.add_reporter(reporter);
        }
    }
}

/// Synthesized parent for a killer's consecutive kills. Children live in the
/// timeline arena and are referenced by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreeEvent {
    pub id: EventId,
    pub killer: Identity,
    pub kill_count: usize,
    pub timestamp: DateTime<Utc>,
    pub children: Vec<EventId>,
    pub finalized: bool,
}
