//! The wire format: decoding inbound frames into a tagged union (§4.7, §6,
//! §9 design note on "dynamic union type at the wire edge"), and building the
//! server's outbound frames as [`serde_json::Value`]s.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::Features;
use crate::error::ServerError;

/// The exact 32-byte refusal sent in reply to any `TLS` upgrade request (§6).
/// Written as a byte literal, not built through serde, so the wire contract's
/// "byte-for-byte" requirement can never drift from a struct's field order.
pub const TLS_REFUSAL: &[u8] = b"{\"TLS\": {\"startTLS\": \"false\"}}\r\n";

#[derive(Debug, Deserialize)]
pub struct RoomRef {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct HelloFrame {
    pub username: String,
    pub version: String,
    pub room: RoomRef,
}

fn default_paused() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct PingFrame {
    #[serde(default, rename = "latencyCalculation")]
    pub latency_calculation: f64,
    #[serde(default, rename = "clientLatencyCalculation")]
    pub client_latency_calculation: f64,
    #[serde(default, rename = "clientRtt")]
    pub client_rtt: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlaystateFrame {
    #[serde(default)]
    pub position: f64,
    #[serde(default = "default_paused")]
    pub paused: bool,
    #[serde(default, rename = "doSeek")]
    pub do_seek: bool,
    #[serde(default, rename = "setBy")]
    pub set_by: Option<String>,
}

impl Default for PlaystateFrame {
    fn default() -> Self {
        Self {
            position: 0.0,
            paused: true,
            do_seek: false,
            set_by: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct IgnoringOnTheFlyFrame {
    #[serde(default)]
    pub client: Option<u64>,
    #[serde(default)]
    pub server: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StateFrame {
    #[serde(default)]
    pub ping: PingFrame,
    #[serde(default)]
    pub playstate: PlaystateFrame,
    #[serde(default, rename = "ignoringOnTheFly")]
    pub ignoring_on_the_fly: Option<IgnoringOnTheFlyFrame>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub size: Value,
}

#[derive(Debug)]
pub enum SetFrame {
    /// `Set.user` — join-as-move: the client announces itself joining/moving.
    User {
        username: String,
        room_name: String,
        joined: bool,
        left: bool,
    },
    Ready {
        is_ready: bool,
        manually_initiated: bool,
    },
    PlaylistChange {
        files: Vec<FileEntry>,
    },
    PlaylistIndex {
        index: Option<usize>,
    },
    File {
        entry: FileEntry,
    },
    Room {
        name: String,
    },
}

#[derive(Debug)]
pub enum WireMessage {
    Tls,
    Hello(HelloFrame),
    State(StateFrame),
    Chat(String),
    Set(SetFrame),
    List,
}

/// Decodes one JSON line into a [`WireMessage`].
///
/// A frame must have exactly one recognized top-level key (§4.1, §9); zero or
/// more than one is a protocol error, and the caller (the dispatcher) decides
/// whether to discard the single frame or close the stream.
pub fn parse_frame(line: &str) -> Result<WireMessage, ServerError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ServerError::Protocol(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ServerError::Protocol("frame is not a JSON object".into()))?;

    const RECOGNIZED: [&str; 6] = ["TLS", "Hello", "State", "Chat", "Set", "List"];
    let mut present = RECOGNIZED.iter().filter(|k| obj.contains_key(**k));
    let key = present
        .next()
        .ok_or_else(|| ServerError::Protocol("no recognized top-level key".into()))?;
    if present.next().is_some() {
        return Err(ServerError::Protocol(
            "more than one recognized top-level key".into(),
        ));
    }

    match *key {
        "TLS" => Ok(WireMessage::Tls),
        "Hello" => {
            let v = obj.get("Hello").cloned().unwrap();
            Ok(WireMessage::Hello(serde_json::from_value(v)?))
        }
        "State" => {
            let v = obj.get("State").cloned().unwrap();
            Ok(WireMessage::State(serde_json::from_value(v)?))
        }
        "Chat" => {
            let v = obj.get("Chat").unwrap();
            let message = v
                .as_str()
                .ok_or_else(|| ServerError::Protocol("Chat payload is not a string".into()))?;
            Ok(WireMessage::Chat(message.to_string()))
        }
        "Set" => {
            let v = obj.get("Set").unwrap();
            Ok(WireMessage::Set(parse_set(v)?))
        }
        "List" => Ok(WireMessage::List),
        _ => unreachable!("RECOGNIZED is exhaustively matched above"),
    }
}

fn parse_set(value: &Value) -> Result<SetFrame, ServerError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ServerError::Protocol("Set payload is not an object".into()))?;

    if let Some(user) = obj.get("user") {
        let user_obj = user
            .as_object()
            .ok_or_else(|| ServerError::Protocol("Set.user is not an object".into()))?;
        let (username, inner) = user_obj
            .iter()
            .next()
            .ok_or_else(|| ServerError::Protocol("Set.user has no username key".into()))?;
        let room_name = inner
            .get("room")
            .and_then(|r| r.get("name"))
            .and_then(|n| n.as_str())
            .ok_or_else(|| ServerError::Protocol("Set.user missing room.name".into()))?
            .to_string();
        let event = inner.get("event");
        let joined = event
            .and_then(|e| e.get("joined"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let left = event
            .and_then(|e| e.get("left"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        return Ok(SetFrame::User {
            username: username.clone(),
            room_name,
            joined,
            left,
        });
    }

    if let Some(ready) = obj.get("ready") {
        let is_ready = ready
            .get("isReady")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let manually_initiated = ready
            .get("manuallyInitiated")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        return Ok(SetFrame::Ready {
            is_ready,
            manually_initiated,
        });
    }

    if let Some(change) = obj.get("playlistChange") {
        let files = change
            .get("files")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        return Ok(SetFrame::PlaylistChange { files });
    }

    if let Some(index) = obj.get("playlistIndex") {
        let index = index
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        return Ok(SetFrame::PlaylistIndex { index });
    }

    if let Some(file) = obj.get("file") {
        let entry: FileEntry = serde_json::from_value(file.clone())?;
        return Ok(SetFrame::File { entry });
    }

    if let Some(room) = obj.get("room") {
        let name = room
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServerError::Protocol("Set.room missing name".into()))?
            .to_string();
        return Ok(SetFrame::Room { name });
    }

    Err(ServerError::Protocol("unrecognized Set subkey".into()))
}

/// Trims per-entry whitespace, per §4.10's PlaylistChange rule.
pub fn sanitize_files(files: Vec<FileEntry>) -> Vec<FileEntry> {
    files
        .into_iter()
        .map(|mut f| {
            f.name = f.name.trim().to_string();
            f
        })
        .collect()
}

pub fn features_object(features: &Features) -> Value {
    json!({
        "isolateRooms": features.isolate_rooms,
        "readiness": features.readiness,
        "managedRooms": features.managed_rooms,
        "persistentRooms": features.persistent_rooms,
        "chat": features.chat,
        "sharedPlaylists": features.shared_playlists,
        "maxChatMessageLength": features.max_chat_message_length,
        "maxUsernameLength": features.max_username_length,
        "maxRoomNameLength": features.max_room_name_length,
        "maxFilenameLength": features.max_filename_length,
    })
}

pub fn hello_response(username: &str, version: &str, room_name: &str, features: &Features) -> Value {
    json!({
        "Hello": {
            "username": username,
            "room": {"name": room_name},
            "version": version,
            "realversion": "1.7.3",
            "features": features_object(features),
            "motd": "",
        }
    })
}

pub fn joined_announcement(username: &str, room_name: &str) -> Value {
    json!({
        "Set": {
            "user": {
                username: {
                    "room": {"name": room_name},
                    "event": {"joined": true},
                }
            }
        }
    })
}

pub fn left_announcement(username: &str, room_name: &str) -> Value {
    json!({
        "Set": {
            "user": {
                username: {
                    "room": {"name": room_name},
                    "event": {"left": true},
                }
            }
        }
    })
}

pub fn file_announcement(username: &str, room_name: &str, entry: &FileEntry) -> Value {
    json!({
        "Set": {
            "user": {
                username: {
                    "room": {"name": room_name},
                    "file": {
                        "name": entry.name,
                        "duration": entry.duration,
                        "size": entry.size,
                    },
                }
            }
        }
    })
}

pub fn ready_init(username: &str) -> Value {
    json!({
        "Set": {
            "ready": {
                "username": username,
                "isReady": false,
                "manuallyInitiated": false,
            }
        }
    })
}

pub fn ready_update(username: &str, is_ready: bool, manually_initiated: bool) -> Value {
    json!({
        "Set": {
            "ready": {
                "username": username,
                "isReady": is_ready,
                "manuallyInitiated": manually_initiated,
            }
        }
    })
}

pub fn playlist_change(files: &[crate::playlist::File], user: Option<&str>) -> Value {
    let files: Vec<Value> = files
        .iter()
        .map(|f| {
            json!({"name": f.name, "duration": f.duration, "size": f.size})
        })
        .collect();
    json!({
        "Set": {
            "playlistChange": {
                "files": files,
                "user": user,
            }
        }
    })
}

pub fn playlist_index(index: Option<usize>, user: Option<&str>) -> Value {
    json!({
        "Set": {
            "playlistIndex": {
                "index": index,
                "user": user,
            }
        }
    })
}

/// Builds an outbound `State` frame (§4.4 emission rules).
pub fn state_message(
    position: f64,
    paused: bool,
    do_seek: bool,
    set_by: &str,
    now: f64,
    client_latency_calculation: f64,
    ignoring_on_the_fly: Option<u64>,
) -> Value {
    let mut state = json!({
        "ping": {
            "latencyCalculation": now,
            "clientLatencyCalculation": client_latency_calculation,
            "serverRtt": 0.0,
        },
        "playstate": {
            "position": position,
            "paused": paused,
            "doSeek": do_seek,
            "setBy": set_by,
        }
    });
    if let Some(token) = ignoring_on_the_fly {
        state["ignoringOnTheFly"] = json!({"client": token, "server": token});
    }
    json!({ "State": state })
}

pub fn chat_echo(message: &str, username: &str) -> Value {
    json!({
        "Chat": {
            "message": message,
            "username": username,
        }
    })
}

/// A chat-style diagnostic, e.g. the "already in the room" rejection (§4.8, §7).
pub fn chat_diagnostic(message: &str) -> Value {
    json!({
        "Chat": {
            "message": message,
            "username": "Server",
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_refusal_is_exactly_32_bytes() {
        assert_eq!(TLS_REFUSAL.len(), 32);
        assert_eq!(TLS_REFUSAL, b"{\"TLS\": {\"startTLS\": \"false\"}}\r\n");
    }

    #[test]
    fn parses_hello_frame() {
        let line = r#"{"Hello":{"username":"alice","version":"1.2.7","room":{"name":"r"}}}"#;
        match parse_frame(line).unwrap() {
            WireMessage::Hello(h) => {
                assert_eq!(h.username, "alice");
                assert_eq!(h.room.name, "r");
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn rejects_frame_with_two_recognized_keys() {
        let line = r#"{"Hello":{"username":"a","version":"1","room":{"name":"r"}},"Chat":"hi"}"#;
        assert!(parse_frame(line).is_err());
    }

    #[test]
    fn rejects_frame_with_no_recognized_keys() {
        let line = r#"{"Bogus": true}"#;
        assert!(parse_frame(line).is_err());
    }

    #[test]
    fn state_frame_defaults_missing_fields() {
        let line = r#"{"State":{"ping":{},"playstate":{}}}"#;
        match parse_frame(line).unwrap() {
            WireMessage::State(s) => {
                assert_eq!(s.playstate.position, 0.0);
                assert!(s.playstate.paused);
                assert!(!s.playstate.do_seek);
                assert_eq!(s.playstate.set_by, None);
            }
            other => panic!("expected State, got {other:?}"),
        }
    }

    #[test]
    fn parses_set_user_join() {
        let line = r#"{"Set":{"user":{"Bob":{"room":{"name":"r"},"event":{"joined":true}}}}}"#;
        match parse_frame(line).unwrap() {
            WireMessage::Set(SetFrame::User {
                username,
                room_name,
                joined,
                left,
            }) => {
                assert_eq!(username, "Bob");
                assert_eq!(room_name, "r");
                assert!(joined);
                assert!(!left);
            }
            other => panic!("expected Set::User, got {other:?}"),
        }
    }

    #[test]
    fn list_value_may_be_null() {
        let line = r#"{"List": null}"#;
        assert!(matches!(parse_frame(line).unwrap(), WireMessage::List));
    }
}
