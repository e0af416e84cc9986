use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{KillfeedError, Result};
use crate::event::{ClassifiedEvent, Identity};
use crate::timeline::Timeline;

/// Key-value collaborator that keeps sync cursors across restarts.
pub trait CursorStore {
    fn get(&self, peer: &Identity) -> Result<Option<DateTime<Utc>>>;
    fn set(&mut self, peer: &Identity, timestamp: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: HashMap<Identity, DateTime<Utc>>,
}

impl CursorStore for MemoryCursorStore {
    fn get(&self, peer: &Identity) -> Result<Option<DateTime<Utc>>> {
        Ok(self.cursors.get(peer).copied())
    }

    fn set(&mut self, peer: &Identity, timestamp: DateTime<Utc>) -> Result<()> {
        self.cursors.insert(peer.clone(), timestamp);
        Ok(())
    }
}

/// Cursor map persisted as a JSON document, replaced through a temporary file
/// on every write.
#[derive(Debug)]
pub struct JsonFileCursorStore {
    path: PathBuf,
    cursors: BTreeMap<Identity, DateTime<Utc>>,
}

impl JsonFileCursorStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cursors = match std::fs::read_to_string(&path) {
            Ok(raw_json) => serde_json::from_str(&raw_json)?,
            Err(error) if error.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(KillfeedError::Read { path, source }),
        };

        Ok(Self { path, cursors })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self) -> Result<()> {
        if let Some(parent_directory) = self.path.parent() {
            std::fs::create_dir_all(parent_directory).map_err(|source| KillfeedError::Write {
                path: parent_directory.to_path_buf(),
                source,
            })?;
        }

        let serialized = serde_json::to_string_pretty(&self.cursors)?;
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, serialized).map_err(|source| KillfeedError::Write {
            path: temp_path.clone(),
            source,
        })?;
        std::fs::rename(&temp_path, &self.path).map_err(|source| KillfeedError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl CursorStore for JsonFileCursorStore {
    fn get(&self, peer: &Identity) -> Result<Option<DateTime<Utc>>> {
        Ok(self.cursors.get(peer).copied())
    }

    fn set(&mut self, peer: &Identity, timestamp: DateTime<Utc>) -> Result<()> {
        self.cursors.insert(peer.clone(), timestamp);
        self.write()
    }
}

/// Per-peer delivery cursors. Holds no transport knowledge: callers send the
/// batch from `events_since` and call `advance` once delivery is confirmed.
#[derive(Debug, Default)]
pub struct SyncTracker {
    cursors: HashMap<Identity, DateTime<Utc>>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor_for(&self, peer: &Identity) -> Option<DateTime<Utc>> {
        self.cursors.get(peer).copied()
    }

    /// Moves the cursor forward only. Returns whether it moved.
    pub fn advance(&mut self, peer: &Identity, timestamp: DateTime<Utc>) -> bool {
        match self.cursors.get(peer) {
            Some(current) if *current >= timestamp => false,
            _ => {
                self.cursors.insert(peer.clone(), timestamp);
                true
            }
        }
    }

    /// Advances and writes through to `store` when the cursor moved. A store
    /// failure leaves the in-memory cursor advanced.
    pub fn advance_and_persist<S: CursorStore>(
        &mut self,
        peer: &Identity,
        timestamp: DateTime<Utc>,
        store: &mut S,
    ) -> Result<bool> {
        if !self.advance(peer, timestamp) {
            return Ok(false);
        }

        store.set(peer, timestamp)?;
        Ok(true)
    }

    /// Loads a persisted cursor for `peer`, never moving an existing one back.
    pub fn restore<S: CursorStore>(
        &mut self,
        peer: &Identity,
        store: &S,
    ) -> Result<Option<DateTime<Utc>>> {
        if let Some(timestamp) = store.get(peer)? {
            self.advance(peer, timestamp);
        }

        Ok(self.cursor_for(peer))
    }

    /// Classified events newer than the peer's cursor, oldest first. Spree
    /// parents are local aggregates, so their children are sent instead.
    pub fn events_since<'a>(&self, peer: &Identity, timeline: &'a Timeline) -> Vec<&'a ClassifiedEvent> {
        let cursor = self.cursor_for(peer);
        let mut events: Vec<&ClassifiedEvent> = timeline
            .classified_events()
            .filter(|event| cursor.map(|cursor| event.timestamp > cursor).unwrap_or(true))
            .collect();
        events.sort_by_key(|event| event.timestamp);
        events
    }
}
