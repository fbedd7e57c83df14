use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    async_trait::async_trait,
    bytes::Bytes,
    parley_channels::{AudioAttachment, SendError},
    parley_common::{ConversationId, OutboundPayload, Presence},
    parley_config::VoiceConfig,
    tracing::{debug, info, warn},
};

use {
    super::{BackendReply, VoiceBackend, VoiceJob, VoiceResponse, messages},
    crate::error::Error,
};

/// Transport-side operations the voice path needs.
#[async_trait]
pub trait VoiceContext: Send + Sync {
    async fn mark_read(
        &self,
        conversation: &ConversationId,
        message_id: &str,
    ) -> parley_channels::Result<()>;

    async fn set_presence(
        &self,
        conversation: &ConversationId,
        presence: Presence,
    ) -> parley_channels::Result<()>;

    async fn download_audio(
        &self,
        conversation: &ConversationId,
        message_id: &str,
    ) -> parley_channels::Result<Bytes>;

    async fn send(
        &self,
        conversation: &ConversationId,
        payload: &OutboundPayload,
    ) -> Result<(), SendError>;

    /// Send a text reply, queueing it when the transport is down.
    async fn deliver_text(&self, conversation: &ConversationId, text: String);
}

/// How a voice note was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceOutcome {
    /// Generic audio attachment, not a voice note. Nothing is sent.
    Ignored,
    VoiceReply,
    TextReply,
    /// The voice reply could not be sent; a text apology went instead.
    VoiceFallback,
    ErrorReply,
}

/// A voice reply on disk. Dropping it schedules deletion of the file.
pub struct TempVoiceFile {
    path: PathBuf,
    cleanup_after: Duration,
}

impl TempVoiceFile {
    pub async fn create(dir: &Path, audio: &[u8], cleanup_after: Duration) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("response_{}.ogg", uuid::Uuid::new_v4()));
        // Constructed before writing so a failed write is cleaned up too.
        let file = Self {
            path,
            cleanup_after,
        };
        tokio::fs::write(&file.path, audio).await?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempVoiceFile {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        let delay = self.cleanup_after;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    log_removal(&path, tokio::fs::remove_file(&path).await);
                });
            },
            Err(_) => log_removal(&path, std::fs::remove_file(&path)),
        }
    }
}

fn log_removal(path: &Path, result: std::io::Result<()>) {
    if let Err(e) = result
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove temp voice file");
    }
}

pub struct VoicePipeline {
    backend: Arc<dyn VoiceBackend>,
    config: VoiceConfig,
    temp_dir: PathBuf,
}

impl VoicePipeline {
    pub fn new(backend: Arc<dyn VoiceBackend>, config: VoiceConfig, temp_dir: PathBuf) -> Self {
        Self {
            backend,
            config,
            temp_dir,
        }
    }

    pub fn backend(&self) -> &Arc<dyn VoiceBackend> {
        &self.backend
    }

    /// Answer one audio message. Every step degrades on its own; once
    /// composing is shown it is always cleared at the end.
    pub async fn handle(
        &self,
        ctx: Arc<dyn VoiceContext>,
        conversation: &ConversationId,
        message_id: &str,
        attachment: &AudioAttachment,
    ) -> VoiceOutcome {
        if let Err(e) = ctx.mark_read(conversation, message_id).await {
            warn!(conversation = %conversation, error = %e, "failed to send read receipt");
        }

        if !attachment.ptt {
            info!(conversation = %conversation, "audio attachment is not a voice note, ignoring");
            return VoiceOutcome::Ignored;
        }

        tokio::time::sleep(self.config.pre_typing()).await;
        if let Err(e) = ctx.set_presence(conversation, Presence::Composing).await {
            debug!(conversation = %conversation, error = %e, "failed to show typing");
        }

        let outcome = self
            .respond(&ctx, conversation, message_id, attachment)
            .await;

        if let Err(e) = ctx.set_presence(conversation, Presence::Paused).await {
            debug!(conversation = %conversation, error = %e, "failed to clear typing");
        }
        outcome
    }

    async fn respond(
        &self,
        ctx: &Arc<dyn VoiceContext>,
        conversation: &ConversationId,
        message_id: &str,
        attachment: &AudioAttachment,
    ) -> VoiceOutcome {
        let audio = match ctx.download_audio(conversation, message_id).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!(conversation = %conversation, message_id, error = %e, "voice note download failed");
                ctx.deliver_text(conversation, messages::HANDLER_ERROR.to_string())
                    .await;
                return VoiceOutcome::ErrorReply;
            },
        };

        let job = VoiceJob {
            message_id: message_id.to_string(),
            conversation: conversation.clone(),
            audio,
            mime_type: attachment
                .mime_type
                .clone()
                .unwrap_or_else(|| "audio/ogg".to_string()),
            duration_seconds: attachment.seconds,
        };

        let response = match self.process(&job).await {
            Ok(response) => response,
            Err(e) => {
                warn!(conversation = %conversation, error = %e, "voice processing failed");
                ctx.deliver_text(conversation, messages::friendly_message(&e).to_string())
                    .await;
                return VoiceOutcome::ErrorReply;
            },
        };

        let outcome = match response.reply {
            BackendReply::Voice { audio, mime_type } => {
                self.send_voice(ctx, conversation, &audio, mime_type).await
            },
            BackendReply::Text(text) => {
                ctx.deliver_text(conversation, text).await;
                VoiceOutcome::TextReply
            },
        };

        if let Some(transcription) = response.transcription
            && self.config.send_transcription
        {
            self.schedule_transcription(Arc::clone(ctx), conversation.clone(), transcription);
        }
        outcome
    }

    /// Size gate, then the backend call.
    pub async fn process(&self, job: &VoiceJob) -> Result<VoiceResponse, Error> {
        if job.audio.len() < self.config.min_audio_bytes {
            return Err(Error::PayloadTooSmall {
                size: job.audio.len(),
                min: self.config.min_audio_bytes,
            });
        }
        self.backend
            .submit(job)
            .await
            .map_err(|exhausted| Error::from(exhausted.last))
    }

    async fn send_voice(
        &self,
        ctx: &Arc<dyn VoiceContext>,
        conversation: &ConversationId,
        audio: &[u8],
        mime_type: String,
    ) -> VoiceOutcome {
        let sent = match TempVoiceFile::create(&self.temp_dir, audio, self.config.temp_cleanup()).await
        {
            Ok(file) => {
                let payload = OutboundPayload::Voice {
                    path: file.path().to_path_buf(),
                    mime_type,
                };
                ctx.send(conversation, &payload).await.map_err(|e| e.to_string())
            },
            Err(e) => Err(format!("writing temp voice file: {e}")),
        };

        match sent {
            Ok(()) => {
                info!(conversation = %conversation, bytes = audio.len(), "voice reply sent");
                VoiceOutcome::VoiceReply
            },
            Err(e) => {
                warn!(conversation = %conversation, error = %e, "voice reply failed, falling back to text");
                ctx.deliver_text(conversation, messages::VOICE_SEND_FALLBACK.to_string())
                    .await;
                VoiceOutcome::VoiceFallback
            },
        }
    }

    /// Follow the primary reply with the transcription, out of band.
    fn schedule_transcription(
        &self,
        ctx: Arc<dyn VoiceContext>,
        conversation: ConversationId,
        transcription: String,
    ) {
        let delay = self.config.transcript_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let payload = OutboundPayload::text(messages::transcription_followup(&transcription));
            if let Err(e) = ctx.send(&conversation, &payload).await {
                warn!(conversation = %conversation, error = %e, "failed to send transcription");
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::retry::{FailureKind, RetryExhausted},
        std::sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    #[derive(Default)]
    struct FakeContext {
        events: Mutex<Vec<String>>,
        audio: Mutex<Option<Bytes>>,
        fail_voice: bool,
        voice_paths: Mutex<Vec<PathBuf>>,
    }

    impl FakeContext {
        fn with_audio(len: usize) -> Self {
            Self {
                audio: Mutex::new(Some(Bytes::from(vec![1u8; len]))),
                ..Default::default()
            }
        }

        fn log(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VoiceContext for FakeContext {
        async fn mark_read(&self, _: &ConversationId, id: &str) -> parley_channels::Result<()> {
            self.log(format!("read:{id}"));
            Ok(())
        }

        async fn set_presence(
            &self,
            _: &ConversationId,
            presence: Presence,
        ) -> parley_channels::Result<()> {
            self.log(format!("presence:{presence:?}"));
            Ok(())
        }

        async fn download_audio(&self, _: &ConversationId, _: &str) -> parley_channels::Result<Bytes> {
            self.audio
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| parley_channels::Error::unavailable("media expired"))
        }

        async fn send(
            &self,
            _: &ConversationId,
            payload: &OutboundPayload,
        ) -> Result<(), SendError> {
            match payload {
                OutboundPayload::Text(text) => self.log(format!("send:{text}")),
                OutboundPayload::Voice { path, .. } => {
                    if self.fail_voice {
                        return Err(SendError::NotConnected);
                    }
                    assert!(path.exists());
                    self.voice_paths.lock().unwrap().push(path.clone());
                    self.log("send:<voice>".into());
                },
            }
            Ok(())
        }

        async fn deliver_text(&self, _: &ConversationId, text: String) {
            self.log(format!("deliver:{text}"));
        }
    }

    struct FakeBackend {
        response: Result<VoiceResponse, FailureKind>,
        calls: AtomicUsize,
    }

    impl FakeBackend {
        fn new(response: Result<VoiceResponse, FailureKind>) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VoiceBackend for FakeBackend {
        async fn submit(&self, _: &VoiceJob) -> Result<VoiceResponse, RetryExhausted> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone().map_err(|last| RetryExhausted { attempts: 3, last })
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    fn config() -> VoiceConfig {
        VoiceConfig {
            pre_typing_ms: 0,
            transcript_delay_ms: 20,
            temp_cleanup_ms: 50,
            ..Default::default()
        }
    }

    fn pipeline(backend: Arc<FakeBackend>, dir: &Path) -> VoicePipeline {
        VoicePipeline::new(backend, config(), dir.to_path_buf())
    }

    fn voice_note() -> AudioAttachment {
        AudioAttachment {
            ptt: true,
            mime_type: Some("audio/ogg; codecs=opus".into()),
            seconds: 4,
            file_length: None,
        }
    }

    fn conv() -> ConversationId {
        ConversationId::new("15551234567@s.whatsapp.net")
    }

    fn text_reply(text: &str, transcription: Option<&str>) -> Result<VoiceResponse, FailureKind> {
        Ok(VoiceResponse {
            reply: BackendReply::Text(text.into()),
            transcription: transcription.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn text_reply_is_delivered_between_typing_states() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(FakeContext::with_audio(2048));
        let voice = pipeline(FakeBackend::new(text_reply("sunny", None)), dir.path());

        let outcome = voice.handle(ctx.clone(), &conv(), "M1", &voice_note()).await;

        assert_eq!(outcome, VoiceOutcome::TextReply);
        assert_eq!(ctx.events(), vec![
            "read:M1",
            "presence:Composing",
            "deliver:sunny",
            "presence:Paused",
        ]);
    }

    #[tokio::test]
    async fn audio_below_minimum_never_reaches_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(text_reply("unused", None));
        let ctx = Arc::new(FakeContext::with_audio(1023));
        let voice = pipeline(backend.clone(), dir.path());

        let outcome = voice.handle(ctx.clone(), &conv(), "M1", &voice_note()).await;

        assert_eq!(outcome, VoiceOutcome::ErrorReply);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(ctx.events().contains(&format!("deliver:{}", messages::TOO_SHORT)));
    }

    #[tokio::test]
    async fn audio_at_minimum_is_submitted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(text_reply("ok", None));
        let ctx = Arc::new(FakeContext::with_audio(1024));
        let voice = pipeline(backend.clone(), dir.path());

        voice.handle(ctx, &conv(), "M1", &voice_note()).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generic_audio_is_ignored_without_typing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(text_reply("unused", None));
        let ctx = Arc::new(FakeContext::with_audio(4096));
        let voice = pipeline(backend.clone(), dir.path());
        let attachment = AudioAttachment {
            ptt: false,
            ..voice_note()
        };

        let outcome = voice.handle(ctx.clone(), &conv(), "M1", &attachment).await;

        assert_eq!(outcome, VoiceOutcome::Ignored);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.events(), vec!["read:M1"]);
    }

    #[tokio::test]
    async fn backend_failure_sends_friendly_message() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(Err(FailureKind::Network {
            message: "connection refused".into(),
        }));
        let ctx = Arc::new(FakeContext::with_audio(2048));

        let outcome = pipeline(backend, dir.path())
            .handle(ctx.clone(), &conv(), "M1", &voice_note())
            .await;

        assert_eq!(outcome, VoiceOutcome::ErrorReply);
        assert!(ctx.events().contains(&format!("deliver:{}", messages::NETWORK)));
        assert_eq!(ctx.events().last().unwrap(), "presence:Paused");
    }

    #[tokio::test]
    async fn failed_download_still_replies() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(FakeContext::default());
        let outcome = pipeline(FakeBackend::new(text_reply("unused", None)), dir.path())
            .handle(ctx.clone(), &conv(), "M1", &voice_note())
            .await;

        assert_eq!(outcome, VoiceOutcome::ErrorReply);
        assert!(ctx.events().contains(&format!("deliver:{}", messages::HANDLER_ERROR)));
    }

    #[tokio::test]
    async fn voice_reply_then_delayed_transcription() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(Ok(VoiceResponse {
            reply: BackendReply::Voice {
                audio: Bytes::from_static(b"OggS"),
                mime_type: "audio/ogg; codecs=opus".into(),
            },
            transcription: Some("what's the weather".into()),
        }));
        let ctx = Arc::new(FakeContext::with_audio(2048));

        let outcome = pipeline(backend, dir.path())
            .handle(ctx.clone(), &conv(), "M1", &voice_note())
            .await;
        assert_eq!(outcome, VoiceOutcome::VoiceReply);
        assert!(!ctx.events().iter().any(|e| e.contains("transcription")));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = ctx.events();
        let voice_at = events.iter().position(|e| e == "send:<voice>").unwrap();
        let transcript_at = events
            .iter()
            .position(|e| e == "send:🎤 *Voice transcription:* what's the weather")
            .unwrap();
        assert!(voice_at < transcript_at);

        let path = ctx.voice_paths.lock().unwrap()[0].clone();
        assert!(!path.exists(), "temp voice file should be cleaned up");
    }

    #[tokio::test]
    async fn failed_voice_send_falls_back_to_text() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(Ok(VoiceResponse {
            reply: BackendReply::Voice {
                audio: Bytes::from_static(b"OggS"),
                mime_type: "audio/ogg".into(),
            },
            transcription: None,
        }));
        let ctx = Arc::new(FakeContext {
            audio: Mutex::new(Some(Bytes::from(vec![0u8; 2048]))),
            fail_voice: true,
            ..Default::default()
        });

        let outcome = pipeline(backend, dir.path())
            .handle(ctx.clone(), &conv(), "M1", &voice_note())
            .await;

        assert_eq!(outcome, VoiceOutcome::VoiceFallback);
        assert!(ctx.events().contains(&format!("deliver:{}", messages::VOICE_SEND_FALLBACK)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_temp_file_is_removed_after_cleanup_delay() {
        let dir = tempfile::tempdir().unwrap();
        let file = TempVoiceFile::create(dir.path(), b"x", Duration::from_secs(5))
            .await
            .unwrap();
        let path = file.path().to_path_buf();
        drop(file);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(path.exists());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropping_temp_file_outside_runtime_removes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let file = TempVoiceFile::create(dir.path(), b"x", Duration::from_secs(60))
            .await
            .unwrap();
        let path = file.path().to_path_buf();
        std::thread::spawn(move || drop(file)).join().unwrap();
        assert!(!path.exists());
    }
}
