//! In-memory [`Transport`] that records every call.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    bytes::Bytes,
    parley_common::{ConversationId, OutboundPayload, Presence},
    tokio::sync::mpsc,
};

use crate::{
    error::{Error, Result, SendError},
    transport::{ConnectionUpdate, EventReceiver, EventSender, Transport, TransportEvent},
};

/// A payload captured by [`MockTransport::send`]. Voice files are read
/// eagerly because the relay deletes them shortly after sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Voice { bytes: Vec<u8>, mime_type: String },
}

#[derive(Default)]
struct Recorded {
    sends: Vec<(ConversationId, Sent)>,
    presences: Vec<(ConversationId, Presence)>,
    reads: Vec<(ConversationId, String)>,
    audio: HashMap<String, Bytes>,
    /// Remaining successful sends; `None` means unlimited.
    send_budget: Option<usize>,
    fail_voice: bool,
}

pub struct MockTransport {
    events: EventSender,
    recorded: Mutex<Recorded>,
    connects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            events,
            recorded: Mutex::new(Recorded::default()),
            connects: AtomicUsize::new(0),
        });
        (transport, rx)
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push an event as if the transport had produced it.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_connection(&self, update: ConnectionUpdate) {
        self.emit(TransportEvent::Connection(update));
    }

    /// Let `n` more sends succeed, then fail every following one.
    pub fn fail_sends_after(&self, n: usize) {
        self.recorded().send_budget = Some(n);
    }

    pub fn allow_all_sends(&self) {
        self.recorded().send_budget = None;
    }

    pub fn fail_voice_sends(&self, fail: bool) {
        self.recorded().fail_voice = fail;
    }

    pub fn set_audio(&self, message_id: &str, bytes: impl Into<Bytes>) {
        self.recorded()
            .audio
            .insert(message_id.to_string(), bytes.into());
    }

    pub fn sent(&self) -> Vec<(ConversationId, Sent)> {
        self.recorded().sends.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.recorded()
            .sends
            .iter()
            .filter_map(|(_, sent)| match sent {
                Sent::Text(text) => Some(text.clone()),
                Sent::Voice { .. } => None,
            })
            .collect()
    }

    pub fn presences(&self) -> Vec<(ConversationId, Presence)> {
        self.recorded().presences.clone()
    }

    pub fn reads(&self) -> Vec<(ConversationId, String)> {
        self.recorded().reads.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        to: &ConversationId,
        payload: &OutboundPayload,
    ) -> std::result::Result<(), SendError> {
        let sent = match payload {
            OutboundPayload::Text(text) => Sent::Text(text.clone()),
            OutboundPayload::Voice { path, mime_type } => {
                if self.recorded().fail_voice {
                    return Err(Error::rejected("voice upload refused").into());
                }
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| Error::external("reading voice file", e))?;
                Sent::Voice {
                    bytes,
                    mime_type: mime_type.clone(),
                }
            },
        };

        let mut recorded = self.recorded();
        if let Some(budget) = recorded.send_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::rejected("send budget exhausted").into());
            }
            *budget -= 1;
        }
        recorded.sends.push((to.clone(), sent));
        Ok(())
    }

    async fn send_presence(&self, to: &ConversationId, presence: Presence) -> Result<()> {
        self.recorded().presences.push((to.clone(), presence));
        Ok(())
    }

    async fn mark_read(&self, to: &ConversationId, message_id: &str) -> Result<()> {
        self.recorded()
            .reads
            .push((to.clone(), message_id.to_string()));
        Ok(())
    }

    async fn download_audio(&self, _to: &ConversationId, message_id: &str) -> Result<Bytes> {
        self.recorded()
            .audio
            .get(message_id)
            .cloned()
            .ok_or_else(|| Error::unavailable(format!("no media for {message_id}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_budget_fails_after_limit() {
        let (transport, _rx) = MockTransport::new();
        let to = ConversationId::new("1@s.whatsapp.net");
        transport.fail_sends_after(1);

        assert!(transport.send(&to, &OutboundPayload::text("a")).await.is_ok());
        assert!(transport.send(&to, &OutboundPayload::text("b")).await.is_err());
        assert_eq!(transport.sent_texts(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn emitted_events_reach_receiver() {
        let (transport, mut rx) = MockTransport::new();
        transport.emit_connection(ConnectionUpdate::Connecting);
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Connection(ConnectionUpdate::Connecting))
        ));
    }
}
