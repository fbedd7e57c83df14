//! Engine facade: ingestion, dedup, batching, answering, delivery.
//!
//! Component state sits behind short-lived std mutexes that are never held
//! across an await. Timers and transport callbacks report back through one
//! internal channel consumed by [`Engine::run`], so every state transition
//! of the supervisor and the batch map happens on the run loop.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    bytes::Bytes,
    parley_channels::{
        AudioAttachment, EventReceiver, InboundMessage, MessageContent, SendError, Transport,
        TransportEvent,
    },
    parley_common::{ConversationId, DedupKey, OutboundPayload, Presence, now_ms},
    parley_config::ParleyConfig,
    serde::Serialize,
    tokio::sync::{mpsc, oneshot},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    batch::{Batch, BatchAggregator, FlushTicket},
    dedup::{DedupLedger, Release},
    error::{Context, Error, Result},
    pending::PendingQueue,
    snapshot::{Snapshot, SnapshotStore},
    supervisor::{ConnectionStatus, ConnectionSupervisor, Directive, Fatal, ReconnectRequest},
    text::{AiClient, Responder},
    voice::{VoiceBackend, VoiceClient, VoiceContext, VoicePipeline},
};

/// Reply used when the AI backend cannot be reached.
pub const APOLOGY: &str =
    "Sorry, I'm having trouble processing your messages right now. Please try again in a moment.";

/// Events fed back into the run loop by timers and spawned tasks.
#[derive(Debug)]
enum Internal {
    BatchDue {
        conversation: ConversationId,
        generation: u64,
    },
    ReconnectDue {
        epoch: u64,
    },
    PairingExpired {
        token: String,
    },
    ConnectFailed {
        message: String,
    },
    SettleElapsed {
        epoch: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub delivered: usize,
    /// Records still queued after the pass.
    pub remaining: usize,
    pub interrupted_conversations: usize,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    filtered: AtomicU64,
    duplicates: AtomicU64,
    voice_notes: AtomicU64,
    batches_answered: AtomicU64,
    ai_failures: AtomicU64,
    replies_sent: AtomicU64,
    replies_queued: AtomicU64,
    flushed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub received: u64,
    pub filtered: u64,
    pub duplicates: u64,
    pub voice_notes: u64,
    pub batches_answered: u64,
    pub ai_failures: u64,
    pub replies_sent: u64,
    pub replies_queued: u64,
    pub flushed: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub connection: ConnectionStatus,
    pub ai_backend: String,
    pub voice_backend: String,
    /// Result of the last voice backend probe, if one ran.
    pub voice_backend_healthy: Option<bool>,
    /// Conversations with queued replies.
    pub pending_messages: usize,
    pub pending_records: usize,
    pub active_batches: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    #[serde(flatten)]
    pub status: EngineStatus,
    /// Keys remembered by the dedup ledger.
    pub processed_messages: usize,
    pub in_progress: usize,
    pub uptime_secs: u64,
    pub counters: CounterSnapshot,
}

struct Inner {
    config: ParleyConfig,
    supervisor: ConnectionSupervisor,
    ledger: Mutex<DedupLedger>,
    batches: Mutex<BatchAggregator>,
    pending: Mutex<PendingQueue>,
    store: SnapshotStore,
    responder: Arc<dyn Responder>,
    voice: VoicePipeline,
    events_tx: mpsc::UnboundedSender<Internal>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Internal>>>,
    flush_gate: tokio::sync::Mutex<()>,
    persist_gate: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    voice_healthy: Mutex<Option<bool>>,
    /// Per conversation, the completion signal of the latest answer in
    /// flight. A new answer waits on it so replies leave in batch order.
    answer_tails: Mutex<HashMap<ConversationId, (u64, oneshot::Receiver<()>)>>,
    answer_seq: AtomicU64,
    counters: Counters,
    started: std::time::Instant,
}

/// Cloneable handle to the relay core.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        config: ParleyConfig,
        transport: Arc<dyn Transport>,
        responder: Arc<dyn Responder>,
        voice_backend: Arc<dyn VoiceBackend>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let voice = VoicePipeline::new(
            voice_backend,
            config.voice.clone(),
            config.voice_temp_dir(),
        );
        Self {
            inner: Arc::new(Inner {
                supervisor: ConnectionSupervisor::new(transport, &config.connection),
                ledger: Mutex::new(DedupLedger::new(config.dedup.capacity)),
                batches: Mutex::new(BatchAggregator::new(
                    config.batching.quiet_period(),
                    shutdown.clone(),
                )),
                pending: Mutex::new(PendingQueue::new()),
                store: SnapshotStore::new(&config.data_dir),
                responder,
                voice,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                flush_gate: tokio::sync::Mutex::new(()),
                persist_gate: tokio::sync::Mutex::new(()),
                shutdown,
                voice_healthy: Mutex::new(None),
                answer_tails: Mutex::new(HashMap::new()),
                answer_seq: AtomicU64::new(0),
                counters: Counters::default(),
                started: std::time::Instant::now(),
                config,
            }),
        }
    }

    /// Build an engine talking to the configured HTTP backends.
    pub fn from_config(config: ParleyConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let ai = AiClient::new(&config.backend).context("failed to build ai client")?;
        let voice = VoiceClient::new(&config.backend).context("failed to build voice client")?;
        Ok(Self::new(config, transport, Arc::new(ai), Arc::new(voice)))
    }

    fn ledger(&self) -> MutexGuard<'_, DedupLedger> {
        self.inner.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn batches(&self) -> MutexGuard<'_, BatchAggregator> {
        self.inner.batches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, PendingQueue> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &ParleyConfig {
        &self.inner.config
    }

    /// Drive the relay until shutdown or a fatal transport condition.
    ///
    /// Loads the snapshot before the first event is accepted and saves it
    /// again on the way out, whatever the exit reason.
    pub async fn run(&self, mut transport_events: EventReceiver) -> Result<()> {
        let mut internal = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("engine is already running")?;

        self.restore().await;

        self.execute(self.inner.supervisor.start());

        let period = self.inner.config.delivery.snapshot_interval();
        let mut snapshots = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        snapshots.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    info!("engine shutting down");
                    break Ok(());
                },
                event = transport_events.recv() => {
                    let Some(event) = event else {
                        break Err(Error::message("transport event stream closed"));
                    };
                    if let Some(fatal) = self.on_transport_event(event) {
                        break Err(fatal);
                    }
                },
                Some(event) = internal.recv() => {
                    if let Some(fatal) = self.on_internal(event) {
                        break Err(fatal);
                    }
                },
                _ = snapshots.tick() => self.persist_logged().await,
            }
        };

        self.inner.shutdown.cancel();
        self.persist_logged().await;
        result
    }

    /// Stop [`Engine::run`] and cancel every armed timer.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn on_transport_event(&self, event: TransportEvent) -> Option<Error> {
        match event {
            TransportEvent::Connection(update) => {
                let directive = self.inner.supervisor.on_update(&update);
                self.execute(directive)
            },
            TransportEvent::Inbound(message) => {
                match self.handle_inbound(message) {
                    Ok(()) => {},
                    Err(Error::DuplicateEvent { key }) => debug!(key, "duplicate event dropped"),
                    Err(e) => warn!(error = %e, "failed to handle inbound message"),
                }
                None
            },
        }
    }

    fn on_internal(&self, event: Internal) -> Option<Error> {
        match event {
            Internal::BatchDue {
                conversation,
                generation,
            } => {
                let batch = self.batches().take_due(&conversation, generation);
                if let Some(batch) = batch {
                    self.spawn_answer(batch);
                }
                None
            },
            Internal::ReconnectDue { epoch } => {
                let directive = self.inner.supervisor.on_reconnect_due(epoch);
                self.execute(directive)
            },
            Internal::PairingExpired { token } => {
                let directive = self.inner.supervisor.on_pairing_expired(&token);
                self.execute(directive)
            },
            Internal::ConnectFailed { message } => {
                warn!(error = %message, "connection attempt failed");
                let directive = self.inner.supervisor.on_connect_failed(&message);
                self.execute(directive)
            },
            Internal::SettleElapsed { epoch } => {
                if self.inner.supervisor.is_current_session(epoch) {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        match engine.flush_pending().await {
                            Ok(report) if report.delivered > 0 || report.remaining > 0 => {
                                info!(
                                    delivered = report.delivered,
                                    remaining = report.remaining,
                                    "pending flush finished"
                                );
                            },
                            Ok(_) => {},
                            Err(e) => warn!(error = %e, "pending flush skipped"),
                        }
                    });
                }
                None
            },
        }
    }

    /// Carry out a supervisor directive. Returns the error to stop with on
    /// a fatal one.
    fn execute(&self, directive: Directive) -> Option<Error> {
        match directive {
            Directive::None => None,
            Directive::Connect => {
                let transport = Arc::clone(self.inner.supervisor.transport());
                let events = self.inner.events_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.connect().await {
                        let _ = events.send(Internal::ConnectFailed {
                            message: e.to_string(),
                        });
                    }
                });
                None
            },
            Directive::ScheduleReconnect { after, epoch } => {
                self.schedule(after, self.inner.shutdown.clone(), Internal::ReconnectDue {
                    epoch,
                });
                None
            },
            Directive::ArmPairingExpiry { token, after } => {
                self.schedule(after, self.inner.shutdown.clone(), Internal::PairingExpired {
                    token,
                });
                None
            },
            Directive::Connected { epoch } => {
                self.schedule(
                    self.inner.config.delivery.settle_delay(),
                    self.inner.shutdown.clone(),
                    Internal::SettleElapsed { epoch },
                );
                if self.inner.config.backend.probe_voice_on_connect {
                    self.spawn_voice_probe();
                }
                None
            },
            Directive::Fatal(Fatal::LoggedOut) => Some(Error::LoggedOut),
            Directive::Fatal(Fatal::AttemptsExhausted { attempts }) => {
                Some(Error::ReconnectExhausted { attempts })
            },
        }
    }

    fn schedule(&self, delay: Duration, cancel: CancellationToken, event: Internal) {
        let events = self.inner.events_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(event);
                },
            }
        });
    }

    fn arm(&self, ticket: FlushTicket) {
        self.schedule(ticket.delay, ticket.cancel, Internal::BatchDue {
            conversation: ticket.conversation,
            generation: ticket.generation,
        });
    }

    fn spawn_voice_probe(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            let healthy = engine.inner.voice.backend().probe().await;
            *engine
                .inner
                .voice_healthy
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(healthy);
        });
    }

    /// Admit one inbound message: dedup, filter, then batch text or start
    /// the voice path.
    pub fn handle_inbound(&self, message: InboundMessage) -> Result<()> {
        let key = DedupKey::new(&message.conversation, message.timestamp, &message.message_id);
        if !self.ledger().try_acquire(&key) {
            Counters::bump(&self.inner.counters.duplicates);
            return Err(Error::DuplicateEvent {
                key: key.to_string(),
            });
        }

        if message.from_self || message.is_group || message.conversation.is_group() {
            self.skip(&key);
            return Ok(());
        }

        let conversation = message.conversation;
        match message.content {
            MessageContent::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    self.skip(&key);
                    return Ok(());
                }
                Counters::bump(&self.inner.counters.received);
                info!(conversation = %conversation, chars = text.len(), "message received");
                let ticket =
                    self.batches()
                        .push(&conversation, text.to_string(), Some(key), now_ms());
                self.arm(ticket);
            },
            MessageContent::Audio(attachment) => {
                Counters::bump(&self.inner.counters.voice_notes);
                info!(conversation = %conversation, seconds = attachment.seconds, "audio message received");
                let engine = self.clone();
                let message_id = message.message_id;
                tokio::spawn(async move {
                    engine
                        .answer_voice(conversation, message_id, attachment, key)
                        .await
                });
            },
            MessageContent::Unsupported => self.skip(&key),
        }
        Ok(())
    }

    fn skip(&self, key: &DedupKey) {
        Counters::bump(&self.inner.counters.filtered);
        self.ledger().release(key, Release::Completed);
    }

    /// Answer `batch` after every earlier answer for the same conversation
    /// has been sent or queued.
    fn spawn_answer(&self, batch: Batch) {
        let seq = self.inner.answer_seq.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        let previous = self
            .inner
            .answer_tails
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(batch.conversation.clone(), (seq, done_rx))
            .map(|(_, rx)| rx);

        let engine = self.clone();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                // Resolves on completion, or with an error if that task died.
                let _ = previous.await;
            }
            let conversation = batch.conversation.clone();
            engine.answer_batch(batch).await;
            let _ = done_tx.send(());

            let mut tails = engine
                .inner
                .answer_tails
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if tails.get(&conversation).is_some_and(|(tail, _)| *tail == seq) {
                tails.remove(&conversation);
            }
        });
    }

    async fn answer_batch(&self, batch: Batch) {
        let conversation = &batch.conversation;
        info!(conversation = %conversation, messages = batch.texts.len(), "answering batch");

        self.show_typing(conversation).await;

        let reply = match self.inner.responder.respond(conversation, &batch.texts).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(conversation = %conversation, error = %e, "ai backend failed, sending apology");
                Counters::bump(&self.inner.counters.ai_failures);
                APOLOGY.to_string()
            },
        };
        self.deliver_or_queue(conversation, reply).await;
        Counters::bump(&self.inner.counters.batches_answered);

        let mut ledger = self.ledger();
        for key in &batch.keys {
            ledger.release(key, Release::Completed);
        }
    }

    async fn answer_voice(
        &self,
        conversation: ConversationId,
        message_id: String,
        attachment: AudioAttachment,
        key: DedupKey,
    ) {
        let engine = self.clone();
        let task = tokio::spawn(async move {
            let ctx: Arc<dyn VoiceContext> = Arc::new(engine.clone());
            engine
                .inner
                .voice
                .handle(ctx, &conversation, &message_id, &attachment)
                .await
        });
        let release = match task.await {
            Ok(outcome) => {
                debug!(outcome = ?outcome, "voice note handled");
                Release::Completed
            },
            Err(e) => {
                error!(error = %e, "voice handler crashed");
                Release::Abandoned
            },
        };
        self.ledger().release(&key, release);
    }

    /// Composing for the configured typing time, then paused.
    async fn show_typing(&self, conversation: &ConversationId) {
        if !self.is_connected() {
            return;
        }
        let transport = self.inner.supervisor.transport();
        if let Err(e) = transport
            .send_presence(conversation, Presence::Composing)
            .await
        {
            debug!(conversation = %conversation, error = %e, "failed to show typing");
            return;
        }
        tokio::time::sleep(self.inner.config.batching.typing()).await;
        if self.is_connected()
            && let Err(e) = transport.send_presence(conversation, Presence::Paused).await
        {
            debug!(conversation = %conversation, error = %e, "failed to clear typing");
        }
    }

    /// Send now if possible, otherwise queue durably.
    pub async fn deliver_or_queue(&self, conversation: &ConversationId, text: String) -> Delivery {
        let payload = OutboundPayload::text(text);
        match self.inner.supervisor.send(conversation, &payload).await {
            Ok(()) => {
                Counters::bump(&self.inner.counters.replies_sent);
                info!(conversation = %conversation, "reply sent");
                Delivery::Sent
            },
            Err(e) => {
                if e.is_disconnected() {
                    info!(conversation = %conversation, "transport disconnected, queueing reply");
                } else {
                    warn!(conversation = %conversation, error = %e, "send failed, queueing reply");
                }
                let OutboundPayload::Text(text) = payload else {
                    return Delivery::Queued;
                };
                self.enqueue(conversation, text).await;
                Delivery::Queued
            },
        }
    }

    async fn enqueue(&self, conversation: &ConversationId, text: String) {
        self.pending().enqueue(conversation, text, now_ms());
        Counters::bump(&self.inner.counters.replies_queued);
        self.persist_logged().await;
    }

    /// Send every queued reply, in order, with pacing between messages.
    ///
    /// A failure stops the current conversation only; its undelivered
    /// records stay queued for the next pass.
    pub async fn flush_pending(&self) -> Result<FlushReport> {
        if !self.is_connected() {
            return Err(Error::TransportDisconnected);
        }
        let _gate = self.inner.flush_gate.lock().await;

        let plan = self.pending().plan();
        if plan.is_empty() {
            return Ok(FlushReport::default());
        }
        info!(conversations = plan.len(), "flushing pending replies");

        let pacing = self.inner.config.delivery.pacing();
        let mut report = FlushReport::default();
        for (conversation, records) in plan {
            let mut delivered = 0;
            for record in &records {
                let payload = OutboundPayload::text(record.message.clone());
                match self.inner.supervisor.send(&conversation, &payload).await {
                    Ok(()) => {
                        delivered += 1;
                        tokio::time::sleep(pacing).await;
                    },
                    Err(e) => {
                        warn!(
                            conversation = %conversation,
                            delivered,
                            remaining = records.len() - delivered,
                            error = %e,
                            "flush interrupted"
                        );
                        report.interrupted_conversations += 1;
                        break;
                    },
                }
            }
            self.pending().acknowledge(&conversation, delivered);
            report.delivered += delivered;
        }

        report.remaining = self.pending().len();
        self.inner
            .counters
            .flushed
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.persist_logged().await;
        Ok(report)
    }

    /// Operator-triggered reconnect.
    pub fn request_reconnect(&self) -> ReconnectRequest {
        let request = self.inner.supervisor.request_reconnect();
        if let ReconnectRequest::Initiated(directive) = &request {
            self.execute(directive.clone());
        }
        request
    }

    /// Write the queue and batch state to disk.
    pub async fn persist(&self) -> Result<()> {
        let _gate = self.inner.persist_gate.lock().await;
        let snapshot = Snapshot {
            pending: self.pending().snapshot(),
            batches: self.batches().snapshot(),
        };
        self.inner.store.save(&snapshot).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to persist snapshot");
        }
    }

    /// Load the snapshot and re-arm restored batches.
    pub async fn restore(&self) {
        let snapshot = self.inner.store.load().await;
        let records: usize = snapshot.pending.iter().map(|(_, r)| r.len()).sum();
        self.pending().restore(snapshot.pending);
        let tickets = self.batches().restore(snapshot.batches, now_ms());
        if records > 0 || !tickets.is_empty() {
            info!(pending = records, batches = tickets.len(), "snapshot restored");
        }
        for ticket in tickets {
            self.arm(ticket);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.supervisor.is_connected()
    }

    pub fn pairing_token(&self) -> Option<String> {
        self.inner.supervisor.pairing_token()
    }

    pub fn status(&self) -> EngineStatus {
        let (pending_messages, pending_records) = {
            let pending = self.pending();
            (pending.conversation_count(), pending.len())
        };
        EngineStatus {
            connection: self.inner.supervisor.status(),
            ai_backend: self.inner.config.backend.ai_endpoint(),
            voice_backend: self.inner.config.backend.voice_endpoint(),
            voice_backend_healthy: *self
                .inner
                .voice_healthy
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            pending_messages,
            pending_records,
            active_batches: self.batches().active_count(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let (processed_messages, in_progress) = {
            let ledger = self.ledger();
            (ledger.seen_len(), ledger.in_progress_len())
        };
        let c = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        EngineStats {
            status: self.status(),
            processed_messages,
            in_progress,
            uptime_secs: self.inner.started.elapsed().as_secs(),
            counters: CounterSnapshot {
                received: load(&c.received),
                filtered: load(&c.filtered),
                duplicates: load(&c.duplicates),
                voice_notes: load(&c.voice_notes),
                batches_answered: load(&c.batches_answered),
                ai_failures: load(&c.ai_failures),
                replies_sent: load(&c.replies_sent),
                replies_queued: load(&c.replies_queued),
                flushed: load(&c.flushed),
            },
        }
    }
}

#[async_trait]
impl VoiceContext for Engine {
    async fn mark_read(
        &self,
        conversation: &ConversationId,
        message_id: &str,
    ) -> parley_channels::Result<()> {
        if !self.is_connected() {
            return Err(parley_channels::Error::NotConnected);
        }
        self.inner
            .supervisor
            .transport()
            .mark_read(conversation, message_id)
            .await
    }

    async fn set_presence(
        &self,
        conversation: &ConversationId,
        presence: Presence,
    ) -> parley_channels::Result<()> {
        if !self.is_connected() {
            return Err(parley_channels::Error::NotConnected);
        }
        self.inner
            .supervisor
            .transport()
            .send_presence(conversation, presence)
            .await
    }

    async fn download_audio(
        &self,
        conversation: &ConversationId,
        message_id: &str,
    ) -> parley_channels::Result<Bytes> {
        self.inner
            .supervisor
            .transport()
            .download_audio(conversation, message_id)
            .await
    }

    async fn send(
        &self,
        conversation: &ConversationId,
        payload: &OutboundPayload,
    ) -> std::result::Result<(), SendError> {
        self.inner.supervisor.send(conversation, payload).await
    }

    async fn deliver_text(&self, conversation: &ConversationId, text: String) {
        self.deliver_or_queue(conversation, text).await;
    }
}
