//! User-facing texts of the voice path.

use crate::error::Error;

pub const TOO_SHORT: &str =
    "🎤 Your voice message was too short. Please record for at least 2 seconds and try again.";
pub const NETWORK: &str = "🌐 I'm having trouble connecting to my voice processing service. Please try again in a moment.";
pub const UNSUPPORTED_FORMAT: &str =
    "🔧 Your audio format isn't supported. Please try recording again.";
pub const NOT_UNDERSTOOD: &str = "🎧 I couldn't understand your voice message clearly. Please try speaking more clearly or check your audio quality.";
pub const GENERIC_FAILURE: &str =
    "Sorry, I couldn't process your voice message. Please try again.";
pub const HANDLER_ERROR: &str =
    "Sorry, I encountered an error processing your voice message. Please try again later.";
pub const VOICE_SEND_FALLBACK: &str =
    "I processed your voice message but couldn't send a voice response. Please try again.";
pub const TEXT_FALLBACK: &str = "Voice message processed successfully";

pub fn transcription_followup(transcription: &str) -> String {
    format!("🎤 *Voice transcription:* {transcription}")
}

/// Map the final failure of a voice job to what the user is told.
pub fn friendly_message(err: &Error) -> &'static str {
    match err {
        Error::PayloadTooSmall { .. } => TOO_SHORT,
        Error::BackendUnreachable { .. } => NETWORK,
        Error::BackendError { body, .. } => by_cause(body),
        Error::Message { message } => by_cause(message),
        _ => GENERIC_FAILURE,
    }
}

fn by_cause(cause: &str) -> &'static str {
    let cause = cause.to_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|n| cause.contains(n));
    if mentions(&["too short", "2 seconds"]) {
        TOO_SHORT
    } else if mentions(&["network", "connect"]) {
        NETWORK
    } else if mentions(&["audio format", "unsupported"]) {
        UNSUPPORTED_FORMAT
    } else if mentions(&["transcribe", "understand"]) {
        NOT_UNDERSTOOD
    } else {
        GENERIC_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(Error::PayloadTooSmall { size: 1023, min: 1024 }, TOO_SHORT)]
    #[case(Error::BackendUnreachable { message: "connection refused".into() }, NETWORK)]
    #[case(Error::BackendError { status: 415, body: "Unsupported audio format".into() }, UNSUPPORTED_FORMAT)]
    #[case(Error::BackendError { status: 422, body: "Could not transcribe audio".into() }, NOT_UNDERSTOOD)]
    #[case(Error::BackendError { status: 400, body: "Recording too short".into() }, TOO_SHORT)]
    #[case(Error::BackendError { status: 500, body: "internal".into() }, GENERIC_FAILURE)]
    #[case(Error::LoggedOut, GENERIC_FAILURE)]
    fn maps_causes(#[case] err: Error, #[case] expected: &str) {
        assert_eq!(friendly_message(&err), expected);
    }

    #[test]
    fn followup_format() {
        assert_eq!(
            transcription_followup("hello"),
            "🎤 *Voice transcription:* hello"
        );
    }
}
