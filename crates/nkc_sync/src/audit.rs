//! Offline audit of a persisted log's hash chain.
//!
//! Each stored event carries the hash it was committed with and the `prev`
//! link its author claimed. The audit recomputes every hash from the stored
//! envelope, then checks that each link resolves to another event of the
//! same log. Exactly one unflagged event may start the chain. Events flagged
//! as conflicts are exempt from the link check (concurrent writers fork the
//! chain); their hashes must still match.

use std::collections::HashSet;

use nkc_proto::WireEnvelope;
use nkc_store::models::EventRecord;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Stored hash of event {event_id} (position {index}) does not match its envelope")]
    HashMismatch { index: usize, event_id: String },

    #[error("Event {event_id} (position {index}) links to unknown hash {found:?}")]
    BrokenLink {
        index: usize,
        event_id: String,
        found: Option<String>,
    },

    #[error("Stored envelope of event {event_id} is unreadable")]
    Unreadable { event_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainReport {
    pub events: usize,
    pub conflicts: usize,
}

pub fn verify_log_chain(events: &[EventRecord]) -> Result<ChainReport, ChainError> {
    let mut known = HashSet::with_capacity(events.len());
    for (index, event) in events.iter().enumerate() {
        let unreadable = || ChainError::Unreadable {
            event_id: event.event_id.clone(),
        };
        let envelope = WireEnvelope::from_json(&event.envelope).map_err(|_| unreadable())?;
        let computed = envelope.event_hash().map_err(|_| unreadable())?;
        if computed != event.event_hash || envelope.header.prev != event.prev_hash {
            return Err(ChainError::HashMismatch {
                index,
                event_id: event.event_id.clone(),
            });
        }
        known.insert(computed);
    }

    let mut genesis_seen = false;
    let mut conflicts = 0;
    for (index, event) in events.iter().enumerate() {
        if event.conflict {
            conflicts += 1;
            continue;
        }
        let ok = match &event.prev_hash {
            Some(prev) => known.contains(prev),
            None => !std::mem::replace(&mut genesis_seen, true),
        };
        if !ok {
            return Err(ChainError::BrokenLink {
                index,
                event_id: event.event_id.clone(),
                found: event.prev_hash.clone(),
            });
        }
    }
    Ok(ChainReport {
        events: events.len(),
        conflicts,
    })
}
