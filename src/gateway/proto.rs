//! Gateway wire protocol: packet envelope, opcodes, payload builders, and the
//! close-code policy.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::Snowflake;

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RESUME: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_REQUEST_GUILD_MEMBERS: u8 = 8;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;
pub const OP_GUILD_SYNC: u8 = 12;

/// Envelope for every gateway packet in either direction.
///
/// `s` and `t` are only present on dispatch packets; `d` defaults to null so
/// payload-less packets (heartbeat ack) still decode.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Packet {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl Packet {
    pub fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }
}

/// HELLO payload carrying the server-chosen heartbeat cadence.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// Builds the IDENTIFY packet opening a fresh session.
pub fn identify(token: &SecretString, shard: [u16; 2]) -> Packet {
    Packet::new(
        OP_IDENTIFY,
        json!({
            "token": token.expose_secret(),
            "properties": {
                "os": std::env::consts::OS,
                "browser": "quill-sdk",
                "device": "quill-sdk",
            },
            "compress": true,
            "large_threshold": 250,
            "shard": shard,
        }),
    )
}

/// Builds the RESUME packet replaying a surviving session.
pub fn resume(token: &SecretString, session_id: &str, sequence: u64) -> Packet {
    Packet::new(
        OP_RESUME,
        json!({
            "token": token.expose_secret(),
            "session_id": session_id,
            "seq": sequence,
        }),
    )
}

/// Builds a heartbeat carrying the last seen sequence, or null before the
/// first dispatch.
pub fn heartbeat(sequence: Option<u64>) -> Packet {
    Packet::new(OP_HEARTBEAT, sequence.map_or(Value::Null, Into::into))
}

/// Requests member chunks for a large guild.
pub fn request_guild_members(guild_id: Snowflake) -> Packet {
    Packet::new(
        OP_REQUEST_GUILD_MEMBERS,
        json!({
            "guild_id": guild_id,
            "query": "",
            "limit": 0,
        }),
    )
}

/// Requests a full state sync for the given guilds (non-bot sessions).
pub fn guild_sync(guild_ids: &[Snowflake]) -> Packet {
    Packet::new(OP_GUILD_SYNC, json!(guild_ids))
}

/// What a close code permits on the next connection attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseAction {
    /// The session may survive; try RESUME.
    Resume,
    /// The session is gone; reconnect and IDENTIFY fresh.
    Identify,
    /// Credentials or configuration are wrong; retrying cannot help.
    Fatal,
}

/// Classifies a gateway close code.
pub fn classify_close(code: u16) -> CloseAction {
    match code {
        // Authentication failed, invalid shard, sharding required, bad
        // version/intent configuration.
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseAction::Fatal,
        // Invalid sequence on resume, session timed out.
        4007 | 4009 => CloseAction::Identify,
        _ => CloseAction::Resume,
    }
}
