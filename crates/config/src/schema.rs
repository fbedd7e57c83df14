/// Config schema types (server, backends, batching, delivery, connection,
/// voice, whatsapp sidecar).
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Default text backend. Scheme-less values get `https://` prefixed.
pub const DEFAULT_AI_URL: &str = "admin-dash.webvantic.studio/api/whatsapp";

/// Default voice backend base; `/voice` is appended per request.
pub const DEFAULT_VOICE_URL: &str = "http://localhost:3000/api/whatsapp";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub batching: BatchingConfig,
    pub dedup: DedupConfig,
    pub delivery: DeliveryConfig,
    pub connection: ConnectionConfig,
    pub voice: VoiceConfig,
    pub whatsapp: WhatsAppConfig,
    /// Directory holding snapshots, sidecar auth state and temp voice files.
    pub data_dir: PathBuf,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backend: BackendConfig::default(),
            batching: BatchingConfig::default(),
            dedup: DedupConfig::default(),
            delivery: DeliveryConfig::default(),
            connection: ConnectionConfig::default(),
            voice: VoiceConfig::default(),
            whatsapp: WhatsAppConfig::default(),
            data_dir: PathBuf::from("./bot_data"),
        }
    }
}

impl ParleyConfig {
    /// Directory for temporary voice replies.
    pub fn voice_temp_dir(&self) -> PathBuf {
        self.voice
            .temp_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("voice_tmp"))
    }

    /// Directory for the sidecar's multi-file auth state.
    pub fn whatsapp_auth_dir(&self) -> PathBuf {
        self.whatsapp
            .auth_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("auth"))
    }
}

/// Operational HTTP façade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3002,
        }
    }
}

/// Remote AI text and voice services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub ai_url: String,
    pub voice_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub user_agent: String,
    /// Probe `GET <voice_url>/voice` whenever the transport connects.
    pub probe_voice_on_connect: bool,
    pub probe_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            ai_url: DEFAULT_AI_URL.into(),
            voice_url: DEFAULT_VOICE_URL.into(),
            timeout_secs: 30,
            max_attempts: 3,
            retry_delay_ms: 1000,
            user_agent: concat!("parley/", env!("CARGO_PKG_VERSION")).into(),
            probe_voice_on_connect: true,
            probe_timeout_secs: 5,
        }
    }
}

impl BackendConfig {
    /// The text endpoint with a scheme, defaulting to https.
    pub fn ai_endpoint(&self) -> String {
        with_scheme(&self.ai_url)
    }

    /// The voice submission endpoint (`<voice_url>/voice`).
    pub fn voice_endpoint(&self) -> String {
        format!("{}/voice", with_scheme(&self.voice_url).trim_end_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn with_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Per-conversation debounce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Quiet period after the last message before a batch is answered.
    pub quiet_period_ms: u64,
    /// How long the composing indicator is shown before the AI call.
    pub typing_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: 5000,
            typing_ms: 2000,
        }
    }
}

impl BatchingConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn typing(&self) -> Duration {
        Duration::from_millis(self.typing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum number of remembered message keys.
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { capacity: 200 }
    }
}

/// Pending-delivery queue behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Wait after connecting before the queue is flushed.
    pub settle_delay_ms: u64,
    /// Gap between two queued messages during a flush.
    pub pacing_ms: u64,
    pub snapshot_interval_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            pacing_ms: 1000,
            snapshot_interval_secs: 30,
        }
    }
}

impl DeliveryConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

/// Transport reconnection and pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Lifetime of a pairing (QR) token before it is re-issued.
    pub pairing_ttl_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: 10,
            pairing_ttl_secs: 60,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn pairing_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_ttl_secs)
    }
}

/// Push-to-talk handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Smaller downloads are rejected without calling the backend.
    pub min_audio_bytes: usize,
    pub pre_typing_ms: u64,
    pub transcript_delay_ms: u64,
    pub temp_cleanup_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    /// Follow a reply with the backend's transcription when one is supplied.
    pub send_transcription: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            min_audio_bytes: 1024,
            pre_typing_ms: 2000,
            transcript_delay_ms: 1000,
            temp_cleanup_ms: 5000,
            temp_dir: None,
            send_transcription: true,
        }
    }
}

impl VoiceConfig {
    pub fn pre_typing(&self) -> Duration {
        Duration::from_millis(self.pre_typing_ms)
    }

    pub fn transcript_delay(&self) -> Duration {
        Duration::from_millis(self.transcript_delay_ms)
    }

    pub fn temp_cleanup(&self) -> Duration {
        Duration::from_millis(self.temp_cleanup_ms)
    }
}

/// WhatsApp Web sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub sidecar_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecar_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_dir: Option<PathBuf>,
    /// Spawn and supervise the Node.js sidecar; disable to run it by hand.
    pub auto_start_sidecar: bool,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            sidecar_port: 3100,
            sidecar_dir: None,
            auth_dir: None,
            auto_start_sidecar: true,
        }
    }
}
