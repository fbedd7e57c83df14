//! Text response pipeline: one consolidated AI call per batch.

use {
    async_trait::async_trait,
    parley_common::{ConversationId, now_ms},
    parley_config::BackendConfig,
    serde::Serialize,
    tracing::{debug, info},
};

use crate::{
    error::AiServiceError,
    retry::{FailureKind, Outcome, RetryPolicy, run_with_retry},
};

/// Sent when the backend answered but produced no text.
pub const FALLBACK_REPLY: &str = "I'm here to help! Please ask me anything.";

/// Longest error body kept for logs and error messages.
const MAX_ERROR_BODY: usize = 512;

/// Produces one reply for an ordered batch of user texts.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        conversation: &ConversationId,
        texts: &[String],
    ) -> Result<String, AiServiceError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    id: String,
    #[serde(rename = "phoneNumber")]
    phone_number: String,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// HTTP client for the AI completion backend.
pub struct AiClient {
    http: reqwest::Client,
    endpoint: String,
    policy: RetryPolicy,
}

impl AiClient {
    pub fn new(config: &BackendConfig) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            endpoint: config.ai_endpoint(),
            policy: RetryPolicy::from_backend(config),
        })
    }

    async fn post(&self, request: &ChatRequest<'_>) -> Outcome<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| FailureKind::from_reqwest(&e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FailureKind::from_reqwest(&e))?;
        if !status.is_success() {
            return Err(FailureKind::Api {
                status: status.as_u16(),
                body: truncate(body, MAX_ERROR_BODY),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Responder for AiClient {
    async fn respond(
        &self,
        conversation: &ConversationId,
        texts: &[String],
    ) -> Result<String, AiServiceError> {
        let digits = conversation.phone_digits();
        let content = consolidate(texts);
        let request = ChatRequest {
            id: request_id(&digits),
            phone_number: digits,
            messages: [ChatMessage {
                role: "user",
                content: &content,
            }],
        };
        debug!(conversation = %conversation, id = %request.id, messages = texts.len(), "calling ai backend");

        let body = run_with_retry(self.policy, "ai request", FailureKind::is_transient, |_| {
            self.post(&request)
        })
        .await
        .map_err(|e| AiServiceError {
            attempts: e.attempts,
            cause: e.last.to_string(),
        })?;

        let reply = parse_stream_text(&body);
        info!(conversation = %conversation, chars = reply.len(), "ai reply received");
        if reply.is_empty() {
            return Ok(FALLBACK_REPLY.to_string());
        }
        Ok(reply)
    }
}

/// Correlation id for one backend request.
pub fn request_id(digits: &str) -> String {
    format!("whatsapp_{digits}_{}", now_ms())
}

/// Merge a batch into a single prompt. A single text is sent as is.
pub fn consolidate(texts: &[String]) -> String {
    match texts {
        [] => String::new(),
        [single] => single.clone(),
        many => {
            let numbered = many
                .iter()
                .enumerate()
                .map(|(i, text)| format!("Message {}: {text}", i + 1))
                .collect::<Vec<_>>()
                .join("\n\n");
            format!(
                "User sent {} messages in sequence:\n\n{numbered}\n\nPlease provide one comprehensive response addressing all the messages above.",
                many.len()
            )
        },
    }
}

/// Extract the text frames (`<n>:"..."`) of a streamed reply and join them.
/// Other frames are ignored. Whitespace runs collapse to one space.
pub fn parse_stream_text(body: &str) -> String {
    let mut text = String::new();
    for line in body.lines() {
        if let Some(frame) = text_frame(line.trim()) {
            text.push_str(&frame);
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether `body` contains at least one text frame.
pub fn has_text_frames(body: &str) -> bool {
    body.lines().any(|line| text_frame(line.trim()).is_some())
}

fn text_frame(line: &str) -> Option<String> {
    let colon = line.find(':')?;
    let (index, rest) = (&line[..colon], &line[colon + 1..]);
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let rest = rest.strip_prefix('"')?;
    let end = rest.rfind('"')?;
    let quoted = &line[colon + 1..colon + 1 + end + 2];
    match serde_json::from_str::<String>(quoted) {
        Ok(text) => Some(text),
        Err(_) => Some(unescape_lenient(&rest[..end])),
    }
}

fn unescape_lenient(raw: &str) -> String {
    raw.replace("\\\"", "\"")
        .replace("\\n", "\n")
        .replace("\\'", "'")
        .replace("\\\\", "\\")
}

pub(crate) fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
