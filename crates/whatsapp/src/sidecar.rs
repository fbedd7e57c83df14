//! WebSocket link to the sidecar with request/answer correlation.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Context, Result, anyhow, bail},
    futures::{SinkExt, StreamExt},
    tokio::sync::{mpsc, oneshot},
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, info, warn},
};

use crate::types::{GatewayMessage, SidecarMessage};

pub const DEFAULT_SIDECAR_PORT: u16 = 3100;

/// Upper bound for a request the sidecar has to answer (uploads included).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// What the link reports besides answers to requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarEvent {
    Message(SidecarMessage),
    /// The WebSocket is gone; pending requests were abandoned.
    Closed { reason: String },
}

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<SidecarMessage>>>>;

/// Cheap handle to a live sidecar connection.
#[derive(Clone)]
pub struct SidecarHandle {
    write_tx: mpsc::UnboundedSender<String>,
    waiters: Waiters,
    connected: Arc<AtomicBool>,
}

impl SidecarHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fire-and-forget frame.
    pub fn send(&self, message: &GatewayMessage) -> Result<()> {
        if !self.is_connected() {
            bail!("sidecar connection closed");
        }
        let json = serde_json::to_string(message)?;
        self.write_tx
            .send(json)
            .map_err(|_| anyhow!("sidecar connection closed"))
    }

    /// Send a frame and wait for the answer carrying `request_id`.
    pub async fn request(
        &self,
        request_id: &str,
        message: &GatewayMessage,
    ) -> Result<SidecarMessage> {
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(request_id.to_string(), tx);
        if let Err(e) = self.send(message) {
            lock(&self.waiters).remove(request_id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => bail!("sidecar connection closed before answering"),
            Err(_) => {
                lock(&self.waiters).remove(request_id);
                bail!(
                    "sidecar did not answer within {}s",
                    REQUEST_TIMEOUT.as_secs()
                )
            },
        }
    }
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn lock(waiters: &Waiters) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<SidecarMessage>>> {
    waiters.lock().unwrap_or_else(|e| e.into_inner())
}

/// Open the WebSocket and spawn the task that owns it.
pub async fn connect(port: u16, events: mpsc::UnboundedSender<SidecarEvent>) -> Result<SidecarHandle> {
    let url = format!("ws://127.0.0.1:{port}");
    let (ws, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to sidecar at {url}"))?;
    info!(port, "connected to whatsapp sidecar");

    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let handle = SidecarHandle {
        write_tx,
        waiters: Arc::new(Mutex::new(HashMap::new())),
        connected: Arc::new(AtomicBool::new(true)),
    };
    tokio::spawn(run_link(
        ws,
        write_rx,
        Arc::clone(&handle.waiters),
        Arc::clone(&handle.connected),
        events,
    ));
    Ok(handle)
}

/// [`connect`], retried while the sidecar process is still starting.
pub async fn connect_with_retry(
    port: u16,
    events: mpsc::UnboundedSender<SidecarEvent>,
    attempts: u32,
) -> Result<SidecarHandle> {
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match connect(port, events.clone()).await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                debug!(attempt, error = %e, "sidecar not reachable yet");
                last = Some(e);
                tokio::time::sleep(RETRY_DELAY).await;
            },
        }
    }
    Err(last.unwrap_or_else(|| anyhow!("sidecar not reachable")))
}

async fn run_link<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut write_rx: mpsc::UnboundedReceiver<String>,
    waiters: Waiters,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SidecarEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(text.as_str(), &waiters, &events),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        break e.to_string();
                    }
                },
                Some(Ok(Message::Close(_))) | None => break "sidecar closed the connection".to_string(),
                Some(Ok(_)) => {},
                Some(Err(e)) => break e.to_string(),
            },
            outgoing = write_rx.recv() => match outgoing {
                Some(json) => {
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        break e.to_string();
                    }
                },
                None => {
                    // Every handle was dropped: close quietly.
                    connected.store(false, Ordering::SeqCst);
                    let _ = sink.close().await;
                    return;
                },
            },
        }
    };

    warn!(reason = %reason, "whatsapp sidecar link lost");
    connected.store(false, Ordering::SeqCst);
    lock(&waiters).clear();
    let _ = events.send(SidecarEvent::Closed { reason });
}

fn dispatch(text: &str, waiters: &Waiters, events: &mpsc::UnboundedSender<SidecarEvent>) {
    let message: SidecarMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "unparseable sidecar frame");
            return;
        },
    };

    let waiter = message
        .request_id()
        .and_then(|id| lock(waiters).remove(id));
    match waiter {
        Some(waiter) => {
            let _ = waiter.send(message);
        },
        None => {
            let _ = events.send(SidecarEvent::Message(message));
        },
    }
}
