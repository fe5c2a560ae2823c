// last-writer-wins register over the aggregate, keyed by entity id
// logical time decides first, then the writer's source id as raw bytes. the
// source id order carries no meaning, it only has to be the same everywhere so
// that concurrent equal-time writes converge to the same winner
use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

use derive_more::{Deref, DerefMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::LogicalTime;

pub const ENTITY_ID_KEY: &str = "id";

/// Opaque payload of one write. Only the entity id field is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, DerefMut, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reading(pub Map<String, Value>);

impl Reading {
    /// The key the reading is stored under. Strings are taken exactly as
    /// written, so the key always matches the `id` a reader gets back. Numbers
    /// and booleans use their JSON text.
    pub fn entity_id(&self) -> Option<String> {
        match self.get(ENTITY_ID_KEY)? {
            Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            Value::Bool(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub payload: Reading,
    pub source_id: String,
    pub lamport: LogicalTime,
    // unix millis
    pub applied_at: u64,
}

/// Whether an incoming `(lamport, source_id)` replaces `existing`.
pub fn incoming_wins(
    existing: Option<&StoredRecord>,
    lamport: LogicalTime,
    source_id: &str,
) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    match lamport.cmp(&existing.lamport) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => source_id.as_bytes() > existing.source_id.as_bytes(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Created,
    Replaced,
    Discarded,
}

/// The whole aggregate state. Records are never mutated in place: a winning
/// write swaps in a new `Arc`, so a cloned `Aggregate` is a consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    records: BTreeMap<String, Arc<StoredRecord>>,
    // unix millis of the last winning apply, 0 if nothing was ever applied
    last_applied_at: u64,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, entity_id: String, record: StoredRecord) -> Resolution {
        let existing = self.records.get(&entity_id);
        if !incoming_wins(existing.map(|r| &**r), record.lamport, &record.source_id) {
            return Resolution::Discarded;
        }
        let resolution = if existing.is_some() {
            Resolution::Replaced
        } else {
            Resolution::Created
        };
        self.last_applied_at = self.last_applied_at.max(record.applied_at);
        self.records.insert(entity_id, Arc::new(record));
        resolution
    }

    pub fn get(&self, entity_id: &str) -> Option<&StoredRecord> {
        self.records.get(entity_id).map(|record| &**record)
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &StoredRecord)> {
        self.records.iter().map(|(id, record)| (id, &**record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_applied_at(&self) -> u64 {
        self.last_applied_at
    }

    // highest logical time of any stored record, the floor for a restarted clock
    pub fn max_lamport(&self) -> LogicalTime {
        self.records
            .values()
            .map(|record| record.lamport)
            .max()
            .unwrap_or_default()
    }

    /// Entity id -> payload, the body served to readers.
    pub fn payloads(&self) -> Map<String, Value> {
        self.records()
            .map(|(id, record)| (id.clone(), Value::Object(record.payload.0.clone())))
            .collect()
    }
}
