//! Wire shapes shared by the HTTP frontend and the layers: the raw
//! Application Service transaction body and the individual room events
//! inside it. Layer-owned domain types (`Account`, `Room`, `ServiceRoom`,
//! `OfflineMessage`, ...) live in their owning `layers::*` module instead of
//! here, since each is meaningful only in the context of the layer that
//! manages it.

use serde::{Deserialize, Serialize};

/// One event inside a `PUT /transactions/<txn_id>` body.
///
/// Kept deliberately loose (`content` stays a raw `Value`) because each
/// layer only cares about a handful of keys for the event types it
/// subscribes to; a fully-typed enum over every Matrix event type would
/// duplicate the home server's own schema for no benefit here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "event_id")]
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub room_id: String,
    pub sender: String,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub origin_server_ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub events: Vec<RoomEvent>,
}

/// Events the bridge is not interested in processing — these never reach
/// a subscriber.
pub const IGNORED_EVENTS: &[&str] = &["m.room.power_levels"];
