use crate::event::{
    ActorDeath, ClassifiedEvent, DeathManner, DestroyLevel, EventKind, SpreeEvent,
    VehicleDestruction,
};
use crate::timeline::TimelineRecord;

pub fn describe_record(record: &TimelineRecord) -> String {
    match record {
        TimelineRecord::Event(event) => describe_event(event),
        TimelineRecord::Spree(spree) => describe_spree(spree),
    }
}

pub fn describe_spree(spree: &SpreeEvent) -> String {
    format!("{} killing spree ×{}", spree.killer, spree.kill_count)
}

pub fn describe_event(event: &ClassifiedEvent) -> String {
    let reporter = event
        .player
        .as_ref()
        .map(|player| player.as_str())
        .unwrap_or("Someone");

    match &event.kind {
        EventKind::Connection(connection) => format!("{} connected", connection.player),
        EventKind::ActorDeath(death) => describe_death(death),
        EventKind::VehicleDestruction(destruction) => describe_destruction(destruction),
        EventKind::VehicleControlFlow(control) => {
            format!("{reporter} boarded {}", control.vehicle.name)
        }
        EventKind::LocationChange(location) => {
            format!("{} is at {}", location.player, location.display_location())
        }
        EventKind::SystemQuit => format!("{reporter} quit the game"),
        EventKind::Other { label } => label.clone(),
    }
}

fn describe_death(death: &ActorDeath) -> String {
    let victim = &death.victim.name;
    let summary = match (death.manner, death.killer.as_ref()) {
        (DeathManner::Suicide, _) => format!("{victim} committed suicide"),
        (DeathManner::SelfDestruct, Some(killer)) => format!(
            "{victim} died when the owner triggered self-destruct (attacked by {})",
            killer.name
        ),
        (DeathManner::SelfDestruct, None) => {
            format!("{victim} died when the owner triggered self-destruct")
        }
        (_, Some(killer)) => match death.weapon_class.as_deref() {
            Some(weapon) => format!("{} killed {victim} with {weapon}", killer.name),
            None => format!("{} killed {victim}", killer.name),
        },
        (_, None) => format!("{victim} was killed"),
    };

    match death.damage_type.as_deref() {
        Some(damage_type) if death.manner == DeathManner::Killed => {
            format!("{summary} ({damage_type})")
        }
        _ => summary,
    }
}

fn describe_destruction(destruction: &VehicleDestruction) -> String {
    let vehicle = &destruction.vehicle.name;
    let outcome = match destruction.destroy_level_to {
        DestroyLevel::None => "was restored",
        DestroyLevel::Soft => "was disabled",
        DestroyLevel::Hard => "was destroyed",
    };

    match destruction.cause.as_ref() {
        Some(cause) => format!("{vehicle} {outcome} by {}", cause.name),
        None => format!("{vehicle} {outcome}"),
    }
}
