use std::sync::OnceLock;

use regex::Regex;

use weft_core::error::WeftError;
use weft_core::types::{ClassifiedError, ErrorCategory};

const RATE_LIMIT_DELAY_SECS: f64 = 60.0;
const TIMEOUT_DELAY_SECS: f64 = 5.0;
const NETWORK_DELAY_SECS: f64 = 2.0;
const UNKNOWN_DELAY_SECS: f64 = 1.0;

/// Patterns checked in priority order; the first category with a match wins.
const PATTERNS: &[(ErrorCategory, &[&str])] = &[
    (ErrorCategory::RateLimit, &["429", "rate limit", "too many requests"]),
    (ErrorCategory::Timeout, &["timeout", "timed out", "deadline exceeded"]),
    (
        ErrorCategory::Network,
        &["connection", "network", "unreachable", "broken pipe"],
    ),
    (
        ErrorCategory::UserError,
        &["invalid input", "validation", "bad request"],
    ),
    (ErrorCategory::Permanent, &["not found", "404"]),
];

fn retry_after_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)retry[- _]after[:=\s]+(\d+(?:\.\d+)?)").ok())
        .as_ref()
}

/// Map a failure message onto the error taxonomy.
///
/// Matching is case-insensitive. A rate-limit message carrying an explicit
/// `retry-after` hint larger than the default delay raises the delay.
pub fn classify(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();
    let category = PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown);

    let (retryable, retry_after_secs) = match category {
        ErrorCategory::RateLimit => {
            let hinted = retry_after_re()
                .and_then(|re| re.captures(message))
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(0.0);
            (true, hinted.max(RATE_LIMIT_DELAY_SECS))
        }
        ErrorCategory::Timeout => (true, TIMEOUT_DELAY_SECS),
        ErrorCategory::Network => (true, NETWORK_DELAY_SECS),
        ErrorCategory::UserError | ErrorCategory::Permanent => (false, 0.0),
        ErrorCategory::Unknown => (true, UNKNOWN_DELAY_SECS),
    };

    ClassifiedError {
        category,
        retryable,
        retry_after_secs,
        message: message.to_string(),
    }
}

/// Classify a typed error.
///
/// Step timeouts map straight to TIMEOUT and configuration errors are
/// PERMANENT. Agent, script and step failures are matched on the failure
/// text alone so an agent id or script path never decides the category.
/// The returned message is the full error display.
pub fn classify_error(error: &WeftError) -> ClassifiedError {
    match error {
        WeftError::StepTimeout { .. } => ClassifiedError {
            category: ErrorCategory::Timeout,
            retryable: true,
            retry_after_secs: TIMEOUT_DELAY_SECS,
            message: error.to_string(),
        },
        WeftError::Config(_) | WeftError::ConfigNotFound(_) => ClassifiedError {
            category: ErrorCategory::Permanent,
            retryable: false,
            retry_after_secs: 0.0,
            message: error.to_string(),
        },
        WeftError::Agent { message, .. } | WeftError::StepFailed { message, .. } => ClassifiedError {
            message: error.to_string(),
            ..classify(message)
        },
        WeftError::Script { stderr, .. } => ClassifiedError {
            message: error.to_string(),
            ..classify(stderr)
        },
        _ => classify(&error.to_string()),
    }
}
