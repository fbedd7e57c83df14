//! [`Transport`] implementation backed by the Baileys sidecar.

use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    base64::Engine as _,
    bytes::Bytes,
    parley_channels::{
        AudioAttachment, CloseReason, ConnectionUpdate, Error, EventReceiver, EventSender,
        InboundMessage, MessageContent, Result, SendError, Transport, TransportEvent,
    },
    parley_common::{ConversationId, OutboundPayload, Presence},
    parley_config::WhatsAppConfig,
    tokio::sync::{Mutex, RwLock, mpsc},
    tracing::{debug, info, warn},
};

use crate::{
    process::{SidecarConfig, SidecarProcess, find_sidecar_dir, start_sidecar},
    sidecar::{SidecarEvent, SidecarHandle, connect_with_retry, new_request_id},
    types::{GatewayMessage, InboundAudio, PresenceState, SidecarMessage},
};

const CONNECT_ATTEMPTS: u32 = 10;

pub struct WhatsAppTransport {
    config: WhatsAppConfig,
    auth_dir: PathBuf,
    events: EventSender,
    handle: RwLock<Option<SidecarHandle>>,
    process: Mutex<Option<SidecarProcess>>,
}

impl WhatsAppTransport {
    pub fn new(config: &WhatsAppConfig, auth_dir: PathBuf) -> (Arc<Self>, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            config: config.clone(),
            auth_dir,
            events,
            handle: RwLock::new(None),
            process: Mutex::new(None),
        });
        (transport, rx)
    }

    async fn live_handle(&self) -> Option<SidecarHandle> {
        self.handle
            .read()
            .await
            .as_ref()
            .filter(|h| h.is_connected())
            .cloned()
    }

    async fn ensure_process(&self) -> anyhow::Result<()> {
        let mut process = self.process.lock().await;
        if let Some(running) = process.as_mut() {
            if running.is_running() {
                return Ok(());
            }
            warn!("whatsapp sidecar died, restarting");
        }

        let config = SidecarConfig {
            sidecar_dir: find_sidecar_dir(self.config.sidecar_dir.as_deref())?,
            port: self.config.sidecar_port,
            auth_dir: Some(self.auth_dir.clone()),
        };
        *process = Some(start_sidecar(&config).await?);
        Ok(())
    }

    async fn ensure_handle(&self) -> anyhow::Result<SidecarHandle> {
        if let Some(handle) = self.live_handle().await {
            return Ok(handle);
        }

        let mut slot = self.handle.write().await;
        if let Some(handle) = slot.as_ref().filter(|h| h.is_connected()) {
            return Ok(handle.clone());
        }

        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let handle = connect_with_retry(self.config.sidecar_port, link_tx, CONNECT_ATTEMPTS).await?;

        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                if let Some(event) = map_event(event) {
                    let _ = events.send(event);
                }
            }
        });

        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Drop the link and stop a sidecar this transport started.
    pub async fn shutdown(&self) {
        self.handle.write().await.take();
        if let Some(mut process) = self.process.lock().await.take() {
            process.stop().await;
        }
    }

    fn fire(&self, handle: &SidecarHandle, message: &GatewayMessage) -> Result<()> {
        handle
            .send(message)
            .map_err(|e| Error::unavailable(format!("{e:#}")))
    }
}

#[async_trait]
impl Transport for WhatsAppTransport {
    async fn connect(&self) -> Result<()> {
        if self.config.auto_start_sidecar {
            self.ensure_process()
                .await
                .map_err(|e| Error::unavailable(format!("{e:#}")))?;
        }
        let handle = self
            .ensure_handle()
            .await
            .map_err(|e| Error::unavailable(format!("{e:#}")))?;

        info!(auth_dir = %self.auth_dir.display(), "requesting whatsapp login");
        self.fire(&handle, &GatewayMessage::Login {
            auth_dir: Some(self.auth_dir.display().to_string()),
        })
    }

    async fn send(
        &self,
        to: &ConversationId,
        payload: &OutboundPayload,
    ) -> std::result::Result<(), SendError> {
        let handle = self.live_handle().await.ok_or(SendError::NotConnected)?;
        let request_id = new_request_id();
        let message = match payload {
            OutboundPayload::Text(text) => GatewayMessage::SendText {
                request_id: request_id.clone(),
                to: to.to_string(),
                text: text.clone(),
            },
            OutboundPayload::Voice { path, mime_type } => GatewayMessage::SendVoice {
                request_id: request_id.clone(),
                to: to.to_string(),
                path: path.display().to_string(),
                mime_type: mime_type.clone(),
            },
        };

        let answer = handle
            .request(&request_id, &message)
            .await
            .map_err(|e| Error::unavailable(format!("{e:#}")))?;
        match answer {
            SidecarMessage::SendResult { success: true, .. } => {
                debug!(to = %to, kind = payload.kind(), "sidecar accepted message");
                Ok(())
            },
            SidecarMessage::SendResult { error, .. } => Err(Error::rejected(
                error.unwrap_or_else(|| "send failed".to_string()),
            )
            .into()),
            other => Err(Error::rejected(format!("unexpected sidecar answer: {other:?}")).into()),
        }
    }

    async fn send_presence(&self, to: &ConversationId, presence: Presence) -> Result<()> {
        let handle = self.live_handle().await.ok_or(Error::NotConnected)?;
        let state = match presence {
            Presence::Composing => PresenceState::Composing,
            Presence::Paused => PresenceState::Paused,
        };
        self.fire(&handle, &GatewayMessage::Presence {
            to: to.to_string(),
            state,
        })
    }

    async fn mark_read(&self, to: &ConversationId, message_id: &str) -> Result<()> {
        let handle = self.live_handle().await.ok_or(Error::NotConnected)?;
        self.fire(&handle, &GatewayMessage::Read {
            to: to.to_string(),
            message_id: message_id.to_string(),
        })
    }

    async fn download_audio(&self, to: &ConversationId, message_id: &str) -> Result<Bytes> {
        let handle = self.live_handle().await.ok_or(Error::NotConnected)?;
        let request_id = new_request_id();
        let answer = handle
            .request(&request_id, &GatewayMessage::DownloadMedia {
                request_id: request_id.clone(),
                chat_jid: to.to_string(),
                message_id: message_id.to_string(),
            })
            .await
            .map_err(|e| Error::unavailable(format!("{e:#}")))?;

        match answer {
            SidecarMessage::Media {
                data: Some(data), ..
            } => base64::engine::general_purpose::STANDARD
                .decode(data.as_bytes())
                .map(Bytes::from)
                .map_err(|e| Error::external("decoding media", e)),
            SidecarMessage::Media { error, .. } => Err(Error::rejected(
                error.unwrap_or_else(|| "media unavailable".to_string()),
            )),
            other => Err(Error::rejected(format!(
                "unexpected sidecar answer: {other:?}"
            ))),
        }
    }
}

/// Translate a sidecar frame into what the relay consumes.
fn map_event(event: SidecarEvent) -> Option<TransportEvent> {
    let message = match event {
        SidecarEvent::Closed { reason } => {
            return Some(TransportEvent::Connection(ConnectionUpdate::Closed {
                reason: CloseReason::recoverable(reason),
            }));
        },
        SidecarEvent::Message(message) => message,
    };

    let update = match message {
        SidecarMessage::Connecting => ConnectionUpdate::Connecting,
        SidecarMessage::Qr { qr } => ConnectionUpdate::PairingRequired { token: qr },
        SidecarMessage::Connected { phone_number } => ConnectionUpdate::Open { user: phone_number },
        SidecarMessage::Disconnected {
            reason,
            status_code,
        } => ConnectionUpdate::Closed {
            reason: CloseReason::Recoverable {
                message: reason,
                status: status_code,
            },
        },
        SidecarMessage::LoggedOut => ConnectionUpdate::Closed {
            reason: CloseReason::LoggedOut,
        },
        SidecarMessage::InboundMessage {
            message_id,
            chat_jid,
            from_me,
            is_group,
            timestamp,
            body,
            audio,
        } => {
            let content = match (audio, body) {
                (Some(audio), _) => MessageContent::Audio(attachment(audio)),
                (None, Some(body)) => MessageContent::Text(body),
                (None, None) => MessageContent::Unsupported,
            };
            return Some(TransportEvent::Inbound(InboundMessage {
                conversation: ConversationId::new(chat_jid),
                message_id,
                timestamp,
                from_self: from_me,
                is_group,
                content,
            }));
        },
        SidecarMessage::Media { request_id, .. } | SidecarMessage::SendResult { request_id, .. } => {
            debug!(request_id, "late sidecar answer ignored");
            return None;
        },
        SidecarMessage::Error { error } => {
            warn!(error = %error, "whatsapp sidecar error");
            return None;
        },
    };
    Some(TransportEvent::Connection(update))
}

fn attachment(audio: InboundAudio) -> AudioAttachment {
    AudioAttachment {
        ptt: audio.ptt,
        mime_type: audio.mime_type,
        seconds: audio.seconds,
        file_length: audio.file_length,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        futures::{SinkExt, StreamExt},
        serde_json::{Value, json},
        tokio::net::TcpListener,
        tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message},
    };

    fn frame(raw: &str) -> SidecarEvent {
        SidecarEvent::Message(serde_json::from_str(raw).unwrap())
    }

    #[test]
    fn connection_frames_map_to_updates() {
        assert!(matches!(
            map_event(frame(r#"{"type":"qr","qr":"2@xyz"}"#)),
            Some(TransportEvent::Connection(ConnectionUpdate::PairingRequired { token })) if token == "2@xyz"
        ));
        assert!(matches!(
            map_event(frame(r#"{"type":"disconnected","reason":"stream errored","status_code":515}"#)),
            Some(TransportEvent::Connection(ConnectionUpdate::Closed {
                reason: CloseReason::Recoverable { status: Some(515), .. }
            }))
        ));
        assert!(matches!(
            map_event(frame(r#"{"type":"logged_out"}"#)),
            Some(TransportEvent::Connection(ConnectionUpdate::Closed {
                reason: CloseReason::LoggedOut
            }))
        ));
        assert!(matches!(
            map_event(SidecarEvent::Closed { reason: "eof".into() }),
            Some(TransportEvent::Connection(ConnectionUpdate::Closed {
                reason: CloseReason::Recoverable { status: None, .. }
            }))
        ));
        assert!(map_event(frame(r#"{"type":"error","error":"boom"}"#)).is_none());
    }

    #[test]
    fn voice_note_takes_precedence_over_caption() {
        let event = map_event(frame(
            r#"{"type":"inbound_message","message_id":"V","chat_jid":"1@s.whatsapp.net","timestamp":5,
                "body":"caption","audio":{"ptt":true,"mime_type":"audio/ogg; codecs=opus","seconds":4}}"#,
        ));
        let Some(TransportEvent::Inbound(message)) = event else {
            panic!("expected inbound message");
        };
        assert_eq!(
            message.content,
            MessageContent::Audio(AudioAttachment {
                ptt: true,
                mime_type: Some("audio/ogg; codecs=opus".into()),
                seconds: 4,
                file_length: None,
            })
        );
    }

    #[test]
    fn bodyless_message_is_unsupported() {
        let event = map_event(frame(
            r#"{"type":"inbound_message","message_id":"S","chat_jid":"1@s.whatsapp.net","timestamp":5,"from_me":true}"#,
        ));
        let Some(TransportEvent::Inbound(message)) = event else {
            panic!("expected inbound message");
        };
        assert!(message.from_self);
        assert_eq!(message.content, MessageContent::Unsupported);
    }

    async fn next_json(ws: &mut WebSocketStream<tokio::net::TcpStream>) -> Value {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn reply(ws: &mut WebSocketStream<tokio::net::TcpStream>, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    #[tokio::test]
    async fn talks_to_sidecar_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let auth = tempfile::tempdir().unwrap();

        let sidecar = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let login = next_json(&mut ws).await;
            assert_eq!(login["type"], "login");
            reply(&mut ws, json!({"type": "connected", "phone_number": "15550000000"})).await;

            let send = next_json(&mut ws).await;
            assert_eq!(send["type"], "send_text");
            assert_eq!(send["text"], "hello");
            reply(&mut ws, json!({"type": "send_result", "request_id": send["request_id"], "success": true})).await;

            let media = next_json(&mut ws).await;
            assert_eq!(media["type"], "download_media");
            reply(&mut ws, json!({"type": "media", "request_id": media["request_id"], "data": "AQID"})).await;

            ws.close(None).await.unwrap();
        });

        let config = WhatsAppConfig {
            sidecar_port: port,
            auto_start_sidecar: false,
            ..Default::default()
        };
        let (transport, mut events) = WhatsAppTransport::new(&config, auth.path().to_path_buf());
        let to = ConversationId::new("15551234567@s.whatsapp.net");

        let err = transport.send(&to, &OutboundPayload::text("early")).await.unwrap_err();
        assert!(err.is_disconnected());

        transport.connect().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Connection(ConnectionUpdate::Open { user: Some(ref u) }) if u == "15550000000"
        ));

        transport.send(&to, &OutboundPayload::text("hello")).await.unwrap();
        let audio = transport.download_audio(&to, "V1").await.unwrap();
        assert_eq!(audio[..], [1u8, 2, 3]);

        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Connection(ConnectionUpdate::Closed {
                reason: CloseReason::Recoverable { .. }
            })
        ));
        sidecar.await.unwrap();

        let err = transport.send(&to, &OutboundPayload::text("late")).await.unwrap_err();
        assert!(err.is_disconnected());
    }
}
