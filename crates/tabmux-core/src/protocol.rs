//! Protocol types for client-daemon communication.
//!
//! Each line on the wire is one JSON document. Clients send [`Request`]s;
//! the daemon answers every request with a `response` and additionally
//! pushes `replay`, `output`, `panel_closed` and `ping` messages on its own.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::layout::{Branch, LayoutTree, SplitSpec};

/// Binary payloads travel as standard base64 strings.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A request from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Commands the daemon can execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Identify the connection's user. The identity is trusted as given.
    Hello { user_id: String },
    /// List the caller's sessions.
    ListSessions,
    /// Create an empty session.
    CreateSession {
        #[serde(default)]
        name: Option<String>,
    },
    /// Destroy a session and all of its panels.
    DestroySession { session_id: String },
    /// Fetch the persisted layout of a session.
    GetLayout { session_id: String },
    /// Open a new panel (and shell) in a session.
    CreatePanel {
        session_id: String,
        #[serde(default)]
        split: Option<SplitSpec>,
    },
    /// Close a panel and end its shell.
    ClosePanel { panel_id: String },
    /// Attach this connection to a panel's output.
    AttachPanel {
        panel_id: String,
        /// Last sequence the client has rendered; omit for a fresh terminal.
        #[serde(default)]
        last_acked: Option<u64>,
    },
    /// Stop receiving a panel's output on this connection.
    DetachPanel { panel_id: String },
    /// Keyboard input for a panel.
    Input {
        panel_id: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// Resize a panel's terminal.
    Resize { panel_id: String, rows: u16, cols: u16 },
    /// Move the divider of the split at `path`.
    SetSplitRatio {
        session_id: String,
        path: Vec<Branch>,
        ratio: f32,
    },
    /// The client has rendered output up to `sequence`.
    Ack { panel_id: String, sequence: u64 },
    /// Heartbeat reply.
    Pong,
    /// Shutdown the daemon gracefully.
    Shutdown,
}

impl Command {
    /// Whether this command is high-frequency traffic (logged at trace level).
    pub fn is_chatty(&self) -> bool {
        matches!(self, Command::Input { .. } | Command::Ack { .. } | Command::Pong)
    }
}

/// A response from daemon to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Response payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Connection identified.
    Welcome { user_id: String },
    SessionCreated { session_id: String },
    Sessions { sessions: Vec<SessionInfo> },
    Layout { session_id: String, layout: LayoutTree },
    PanelCreated { panel_id: String, layout: LayoutTree },
    /// Attachment established. The replay follows as a separate message.
    Attached {
        panel_id: String,
        replay_start: u64,
        head: u64,
        truncated: bool,
        resync: bool,
    },
    /// Generic success message.
    Ok { message: String },
}

/// Information about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: Option<String>,
    pub created_at: String,
    pub panels: Vec<PanelInfo>,
}

/// Information about a panel and its shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelInfo {
    pub id: String,
    pub pty_id: String,
    /// Total bytes the shell has produced.
    pub head: u64,
    /// Oldest sequence still held in scrollback.
    pub tail: u64,
    pub cols: u16,
    pub rows: u16,
    /// Connections currently attached.
    pub attachments: usize,
    pub last_activity: String,
    pub alive: bool,
}

/// Everything the daemon writes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response(Response),
    /// History for a freshly (re)attached panel: bytes `[start, head)`.
    Replay {
        panel_id: String,
        start: u64,
        head: u64,
        #[serde(with = "b64")]
        data: Vec<u8>,
        truncated: bool,
        /// The client's acknowledged position was unknown to this PTY; it
        /// must clear its screen before applying `data`.
        #[serde(default)]
        resync: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notice: Option<String>,
    },
    /// Live output starting at `sequence`.
    Output {
        panel_id: String,
        sequence: u64,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    PanelClosed { panel_id: String, reason: String },
    /// Heartbeat probe; answer with `pong`.
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let json = r#"{"id":"1","command":{"action":"attach_panel","panel_id":"p1","last_acked":42}}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            request.command,
            Command::AttachPanel {
                panel_id: "p1".to_string(),
                last_acked: Some(42),
            }
        );
    }

    #[test]
    fn test_optional_fields_may_be_omitted() {
        let json = r#"{"id":"2","command":{"action":"attach_panel","panel_id":"p1"}}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(
            request.command,
            Command::AttachPanel { last_acked: None, .. }
        ));

        let json = r#"{"id":"3","command":{"action":"create_session"}}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request.command, Command::CreateSession { name: None });
    }

    #[test]
    fn test_input_payload_is_base64() {
        let command = Command::Input {
            panel_id: "p1".to_string(),
            data: b"ls -la\r".to_vec(),
        };
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains(r#""data":"bHMgLWxhDQ==""#), "got {}", json);

        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, command);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let json = r#"{"action":"input","panel_id":"p1","data":"not base64!"}"#;
        assert!(serde_json::from_str::<Command>(json).is_err());
    }

    #[test]
    fn test_server_message_tags() {
        let output = ServerMessage::Output {
            panel_id: "p1".to_string(),
            sequence: 120,
            data: vec![0xff, 0x00],
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["sequence"], 120);

        let response = ServerMessage::Response(Response::success(
            "7",
            ResponseData::Ok {
                message: "done".to_string(),
            },
        ));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["id"], "7");
        assert_eq!(value["data"]["type"], "ok");

        let ping = serde_json::to_string(&ServerMessage::Ping).unwrap();
        assert_eq!(ping, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_replay_notice_skipped_when_absent() {
        let replay = ServerMessage::Replay {
            panel_id: "p1".to_string(),
            start: 0,
            head: 3,
            data: b"abc".to_vec(),
            truncated: false,
            resync: false,
            notice: None,
        };
        let json = serde_json::to_string(&replay).unwrap();
        assert!(!json.contains("notice"));

        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, replay);
    }

    #[test]
    fn test_chatty_commands() {
        assert!(Command::Pong.is_chatty());
        assert!(!Command::ListSessions.is_chatty());
    }
}
