//! Command names and typed data payloads.
//!
//! Payload structs map to the `data` member of the envelope. Missing fields
//! decode to their zero values so a bare `{}` (or an absent `data`) is a
//! valid payload for every command that has all-optional fields.

use serde::{Deserialize, Serialize};

/// Process-local connection identifier.
///
/// Monotonically increasing, never reused, never zero (zero is the reserved
/// "unassigned" value). Not stable across process restarts; must not be
/// persisted as a durable identifier.
pub type ConnectionId = i64;

/// Externally supplied user identity. One user may hold several
/// simultaneous connections.
pub type UserId = i64;

pub const CMD_LOGIN: &str = "login";
pub const CMD_ENTER: &str = "enter";
pub const CMD_EXIT: &str = "exit";
pub const CMD_SEND_TO_CONNECTION: &str = "snd2cli";
pub const CMD_SEND_TO_USER: &str = "snd2usr";
pub const CMD_SEND_TO_CHANNEL: &str = "snd2chan";
pub const CMD_RECV_DATA: &str = "rcvdata";
pub const CMD_PING: &str = "ping";

/// `login` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub uid: UserId,
}

/// `login` response payload: the connection id assigned at accept time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub id: ConnectionId,
}

/// `enter` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnterRequest {
    #[serde(default)]
    pub chans: Vec<String>,
}

/// `exit` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRequest {
    #[serde(default)]
    pub chans: Vec<String>,
}

/// `snd2cli` request payload: deliver to explicit connection ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendToConnectionRequest {
    #[serde(default)]
    pub ids: Vec<ConnectionId>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// `snd2usr` request payload: deliver to every connection of the users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendToUserRequest {
    #[serde(default)]
    pub uids: Vec<UserId>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// `snd2chan` request payload: deliver to every member of the channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendToChannelRequest {
    #[serde(default)]
    pub chans: Vec<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// `rcvdata` push payload delivered to recipients of any send command.
///
/// `chan` is the originating channel for channel broadcasts and empty for
/// direct connection/user sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushData {
    pub id: ConnectionId,
    pub uid: UserId,
    #[serde(default)]
    pub chan: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}
