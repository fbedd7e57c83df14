//! JSON protocol spoken with the Baileys sidecar over its local WebSocket.
//!
//! Every frame is a JSON object tagged by `type`. Requests that expect an
//! answer carry a `request_id` the sidecar echoes back.

use serde::{Deserialize, Serialize};

/// Frames sent to the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Start (or resume) the WhatsApp Web session.
    Login {
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_dir: Option<String>,
    },
    SendText {
        request_id: String,
        to: String,
        text: String,
    },
    /// Upload a local audio file as a push-to-talk note.
    SendVoice {
        request_id: String,
        to: String,
        path: String,
        mime_type: String,
    },
    Presence {
        to: String,
        state: PresenceState,
    },
    Read {
        to: String,
        message_id: String,
    },
    DownloadMedia {
        request_id: String,
        chat_jid: String,
        message_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Composing,
    Paused,
}

/// Frames received from the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarMessage {
    Connecting,
    Qr {
        qr: String,
    },
    Connected {
        #[serde(default)]
        phone_number: Option<String>,
    },
    Disconnected {
        reason: String,
        #[serde(default)]
        status_code: Option<u16>,
    },
    LoggedOut,
    InboundMessage {
        message_id: String,
        chat_jid: String,
        #[serde(default)]
        from_me: bool,
        #[serde(default)]
        is_group: bool,
        /// Seconds since the epoch, as reported by WhatsApp.
        timestamp: i64,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        audio: Option<InboundAudio>,
    },
    /// Answer to [`GatewayMessage::DownloadMedia`]; `data` is base64.
    Media {
        request_id: String,
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    SendResult {
        request_id: String,
        success: bool,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        error: String,
    },
}

impl SidecarMessage {
    /// Correlation id for answers to a request.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Media { request_id, .. } | Self::SendResult { request_id, .. } => {
                Some(request_id)
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAudio {
    #[serde(default)]
    pub ptt: bool,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub seconds: u32,
    #[serde(default)]
    pub file_length: Option<u64>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_type() {
        let json = serde_json::to_value(GatewayMessage::Presence {
            to: "1@s.whatsapp.net".into(),
            state: PresenceState::Composing,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "presence", "to": "1@s.whatsapp.net", "state": "composing"})
        );

        let login = serde_json::to_string(&GatewayMessage::Login { auth_dir: None }).unwrap();
        assert_eq!(login, r#"{"type":"login"}"#);
    }

    #[test]
    fn inbound_frame_with_missing_optionals() {
        let msg: SidecarMessage = serde_json::from_str(
            r#"{"type":"inbound_message","message_id":"ABC","chat_jid":"1@s.whatsapp.net","timestamp":1700000000,"body":"hi"}"#,
        )
        .unwrap();
        assert_eq!(msg, SidecarMessage::InboundMessage {
            message_id: "ABC".into(),
            chat_jid: "1@s.whatsapp.net".into(),
            from_me: false,
            is_group: false,
            timestamp: 1_700_000_000,
            body: Some("hi".into()),
            audio: None,
        });
        assert_eq!(msg.request_id(), None);
    }

    #[test]
    fn answers_expose_request_id() {
        let msg: SidecarMessage =
            serde_json::from_str(r#"{"type":"send_result","request_id":"r1","success":true}"#)
                .unwrap();
        assert_eq!(msg.request_id(), Some("r1"));
    }
}
