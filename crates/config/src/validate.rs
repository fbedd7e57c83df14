//! Semantic validation of a loaded configuration.
//!
//! Catches values that parse fine but would make the relay misbehave:
//! zero timers, zero retry bounds, and backend URLs that cannot be used.

use crate::schema::ParleyConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "backend.ai_url"
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.path, self.message)
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Validate a configuration.
pub fn validate(config: &ParleyConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    check_url(&mut result, "backend.ai_url", &config.backend.ai_endpoint());
    check_url(&mut result, "backend.voice_url", &config.backend.voice_endpoint());

    let must_be_positive: [(&str, u64); 6] = [
        ("backend.timeout_secs", config.backend.timeout_secs),
        ("backend.max_attempts", u64::from(config.backend.max_attempts)),
        ("batching.quiet_period_ms", config.batching.quiet_period_ms),
        ("delivery.snapshot_interval_secs", config.delivery.snapshot_interval_secs),
        ("connection.pairing_ttl_secs", config.connection.pairing_ttl_secs),
        ("dedup.capacity", config.dedup.capacity as u64),
    ];
    for (path, value) in must_be_positive {
        if value == 0 {
            result.push(Severity::Error, path, "must be greater than zero");
        }
    }

    if config.connection.max_reconnect_attempts == 0 {
        result.push(
            Severity::Warning,
            "connection.max_reconnect_attempts",
            "any dropped connection will stop the relay",
        );
    }
    if config.delivery.pacing_ms == 0 {
        result.push(
            Severity::Warning,
            "delivery.pacing_ms",
            "queued replies will be sent without pacing and may hit transport rate limits",
        );
    }
    if config.backend.probe_timeout_secs > config.backend.timeout_secs {
        result.push(
            Severity::Warning,
            "backend.probe_timeout_secs",
            "probe timeout is longer than the request timeout",
        );
    }

    result
}

fn check_url(result: &mut ValidationResult, path: &str, value: &str) {
    match url::Url::parse(value) {
        Ok(url) if url.host_str().is_some_and(|h| !h.is_empty()) => {},
        Ok(_) => result.push(Severity::Error, path, format!("no host in {value:?}")),
        Err(e) => result.push(Severity::Error, path, format!("invalid url {value:?}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn defaults_are_valid() {
        let result = validate(&ParleyConfig::default());
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
        assert!(result.diagnostics.is_empty());
    }

    #[rstest]
    #[case::quiet_period("batching.quiet_period_ms")]
    #[case::attempts("backend.max_attempts")]
    #[case::capacity("dedup.capacity")]
    fn zero_values_are_errors(#[case] path: &str) {
        let mut cfg = ParleyConfig::default();
        match path {
            "batching.quiet_period_ms" => cfg.batching.quiet_period_ms = 0,
            "backend.max_attempts" => cfg.backend.max_attempts = 0,
            _ => cfg.dedup.capacity = 0,
        }
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert!(result.diagnostics.iter().any(|d| d.path == path));
    }

    #[test]
    fn empty_ai_url_is_an_error() {
        let mut cfg = ParleyConfig::default();
        cfg.backend.ai_url = String::new();
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "backend.ai_url");
    }

    #[test]
    fn zero_reconnects_is_only_a_warning() {
        let mut cfg = ParleyConfig::default();
        cfg.connection.max_reconnect_attempts = 0;
        let result = validate(&cfg);
        assert!(!result.has_errors());
        assert_eq!(result.diagnostics[0].severity, Severity::Warning);
    }
}
