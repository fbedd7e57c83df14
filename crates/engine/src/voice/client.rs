use std::time::Duration;

use {
    async_trait::async_trait,
    bytes::Bytes,
    parley_config::BackendConfig,
    reqwest::{
        header::{CONTENT_TYPE, HeaderMap},
        multipart::{Form, Part},
    },
    tracing::{debug, info, warn},
};

use {
    super::{BackendReply, DEFAULT_VOICE_MIME, VoiceBackend, VoiceJob, VoiceResponse, messages},
    crate::{
        retry::{FailureKind, Outcome, RetryExhausted, RetryPolicy, run_with_retry},
        text::{has_text_frames, parse_stream_text, truncate},
    },
};

const RESPONSE_TYPE_HEADER: &str = "x-response-type";
const TRANSCRIPTION_HEADER: &str = "x-transcription";
const MAX_ERROR_BODY: usize = 512;

/// HTTP client for the voice transcription/synthesis backend.
pub struct VoiceClient {
    http: reqwest::Client,
    endpoint: String,
    policy: RetryPolicy,
    probe_timeout: Duration,
}

impl VoiceClient {
    pub fn new(config: &BackendConfig) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            endpoint: config.voice_endpoint(),
            policy: RetryPolicy::from_backend(config),
            probe_timeout: config.probe_timeout(),
        })
    }

    async fn post(&self, job: &VoiceJob) -> Outcome<VoiceResponse> {
        let audio = Part::bytes(job.audio.to_vec())
            .file_name(format!("voice_{}.ogg", job.message_id))
            .mime_str(&job.mime_type)
            .map_err(|e| FailureKind::Other {
                message: format!("invalid audio mime type: {e}"),
            })?;
        let form = Form::new()
            .part("audio", audio)
            .text("phoneNumber", job.conversation.phone_digits())
            .text("messageId", job.message_id.clone())
            .text("responseAsVoice", "true");

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| FailureKind::from_reqwest(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| FailureKind::from_reqwest(&e))?;

        if !status.is_success() {
            return Err(FailureKind::Api {
                status: status.as_u16(),
                body: api_error_message(&body),
            });
        }
        Ok(classify_reply(&headers, body))
    }
}

#[async_trait]
impl VoiceBackend for VoiceClient {
    async fn submit(&self, job: &VoiceJob) -> Result<VoiceResponse, RetryExhausted> {
        info!(
            conversation = %job.conversation,
            message_id = %job.message_id,
            bytes = job.audio.len(),
            seconds = job.duration_seconds,
            mime_type = %job.mime_type,
            "submitting voice note"
        );
        // Every failure is retried; classification only shapes the final message.
        run_with_retry(self.policy, "voice request", |_| true, |_| self.post(job)).await
    }

    async fn probe(&self) -> bool {
        match self
            .http
            .get(&self.endpoint)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(endpoint = %self.endpoint, "voice backend healthy");
                true
            },
            Ok(response) => {
                warn!(endpoint = %self.endpoint, status = %response.status(), "voice backend probe failed");
                false
            },
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "voice backend unreachable");
                false
            },
        }
    }
}

/// Decide the reply modality from the response headers, then decode the
/// body accordingly.
pub fn classify_reply(headers: &HeaderMap, body: Bytes) -> VoiceResponse {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let content_type = header(CONTENT_TYPE.as_str()).unwrap_or_default();
    let declared_voice = header(RESPONSE_TYPE_HEADER) == Some("voice");

    let transcription = header(TRANSCRIPTION_HEADER)
        .map(|raw| {
            urlencoding::decode(raw)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| raw.to_string())
        })
        .filter(|t| !t.trim().is_empty());

    let reply = if declared_voice || content_type.contains("audio/") {
        let mime_type = if content_type.starts_with("audio/") {
            content_type.to_string()
        } else {
            DEFAULT_VOICE_MIME.to_string()
        };
        BackendReply::Voice {
            audio: body,
            mime_type,
        }
    } else {
        BackendReply::Text(extract_text(&String::from_utf8_lossy(&body)))
    };

    VoiceResponse {
        reply,
        transcription,
    }
}

/// Reduce a text-modality body to the reply text.
fn extract_text(body: &str) -> String {
    let mut text = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(value @ serde_json::Value::Object(_)) => ["response", "message"]
            .iter()
            .find_map(|field| value.get(field).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        _ => body.to_string(),
    };

    if text.contains("data:") {
        let events = sse_text(&text);
        if !events.is_empty() {
            text = events;
        }
    }
    if has_text_frames(&text) {
        text = parse_stream_text(&text);
    }

    if text.trim().is_empty() {
        return messages::TEXT_FALLBACK.to_string();
    }
    text
}

/// Concatenate the `value` of every `data: {"type":"text"}` event.
fn sse_text(body: &str) -> String {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str::<serde_json::Value>(data).ok())
        .filter(|event| event.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|event| event.get("value").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}

/// The most useful part of an error body: a JSON `message` or `error`
/// field, else the raw text.
fn api_error_message(body: &[u8]) -> String {
    let raw = String::from_utf8_lossy(body);
    let field = serde_json::from_str::<serde_json::Value>(&raw).ok().and_then(|v| {
        ["message", "error"]
            .iter()
            .find_map(|f| v.get(f).and_then(|m| m.as_str()).map(str::to_string))
    });
    truncate(field.unwrap_or_else(|| raw.into_owned()), MAX_ERROR_BODY)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        parley_common::ConversationId,
        reqwest::header::HeaderValue,
        rstest::rstest,
        wiremock::{
            Mock, MockServer, ResponseTemplate,
            matchers::{body_string_contains, method, path},
        },
    };

    fn client(server: &MockServer) -> VoiceClient {
        VoiceClient::new(&BackendConfig {
            voice_url: format!("{}/api/whatsapp", server.uri()),
            retry_delay_ms: 10,
            ..Default::default()
        })
        .unwrap()
    }

    fn job() -> VoiceJob {
        VoiceJob {
            message_id: "MSG1".into(),
            conversation: ConversationId::new("15551234567@s.whatsapp.net"),
            audio: Bytes::from(vec![7u8; 2048]),
            mime_type: "audio/ogg; codecs=opus".into(),
            duration_seconds: 3,
        }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn declared_voice_is_binary_audio() {
        let response = classify_reply(
            &headers(&[
                ("x-response-type", "voice"),
                ("content-type", "application/octet-stream"),
                ("x-transcription", "what%27s%20the%20weather"),
            ]),
            Bytes::from_static(b"OggS..."),
        );
        assert_eq!(response.reply, BackendReply::Voice {
            audio: Bytes::from_static(b"OggS..."),
            mime_type: DEFAULT_VOICE_MIME.into(),
        });
        assert_eq!(response.transcription.as_deref(), Some("what's the weather"));
    }

    #[test]
    fn audio_content_type_is_voice() {
        let response = classify_reply(&headers(&[("content-type", "audio/mpeg")]), Bytes::new());
        assert!(matches!(response.reply, BackendReply::Voice { ref mime_type, .. } if mime_type == "audio/mpeg"));
        assert_eq!(response.transcription, None);
    }

    #[rstest]
    #[case(r#"{"response":"from response"}"#, "from response")]
    #[case(r#"{"message":"from message"}"#, "from message")]
    #[case(r#"{"other":1}"#, r#"{"other":1}"#)]
    #[case("plain words", "plain words")]
    #[case("data: {\"type\":\"text\",\"value\":\"Hel\"}\ndata: {\"type\":\"text\",\"value\":\"lo\"}\ndata: [DONE]", "Hello")]
    #[case("0:\"framed\"\n1:\" reply\"", "framed reply")]
    #[case(r#"{"response":"0:\"nested\""}"#, "nested")]
    #[case("", "Voice message processed successfully")]
    fn text_envelopes(#[case] body: &'static str, #[case] expected: &str) {
        let response = classify_reply(
            &headers(&[("content-type", "application/json")]),
            Bytes::from_static(body.as_bytes()),
        );
        assert_eq!(response.reply, BackendReply::Text(expected.into()));
    }

    #[test]
    fn error_body_prefers_json_message() {
        assert_eq!(api_error_message(br#"{"error":"Unsupported audio format"}"#), "Unsupported audio format");
        assert_eq!(api_error_message(b"gateway timeout"), "gateway timeout");
    }

    #[tokio::test]
    async fn submits_multipart_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/whatsapp/voice"))
            .and(body_string_contains("name=\"responseAsVoice\""))
            .and(body_string_contains("15551234567"))
            .and(body_string_contains("name=\"messageId\""))
            .and(body_string_contains("filename=\"voice_MSG1.ogg\""))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-response-type", "voice")
                    .insert_header("x-transcription", "hello%20there")
                    .set_body_bytes(vec![1u8, 2, 3]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = client(&server).submit(&job()).await.unwrap();
        assert!(matches!(response.reply, BackendReply::Voice { ref audio, .. } if audio[..] == [1u8, 2, 3]));
        assert_eq!(response.transcription.as_deref(), Some("hello there"));
    }

    #[tokio::test]
    async fn retries_every_failure_and_keeps_last_cause() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(serde_json::json!({"message": "Could not transcribe audio"})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server).submit(&job()).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, FailureKind::Api {
            status: 422,
            body: "Could not transcribe audio".into(),
        });
    }

    #[tokio::test]
    async fn probe_reports_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/whatsapp/voice"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
        assert!(client(&server).probe().await);

        let down = VoiceClient::new(&BackendConfig {
            voice_url: "http://127.0.0.1:9".into(),
            ..Default::default()
        })
        .unwrap();
        assert!(!down.probe().await);
    }
}
