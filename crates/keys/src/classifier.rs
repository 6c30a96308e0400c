//! Maps an upstream failure's textual form to an
//! [`ErrorCategory`], mutates the registry accordingly, and selects the
//! next key to try. A structured error with an explicit status field is
//! the right long-term shape; the substring scan here is the
//! last-resort extractor for wrapped transport errors that only carry a
//! stringified status in their message.

use crate::key::Key;
use crate::registry::KeyRegistry;
use crate::upstream::{ErrorLogRecord, ErrorLogSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    RateLimit429,
    Auth401_403,
    ClientError400_404_422,
    ServerError500_502_504,
    ServiceUnavailable503,
    Timeout408,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit429 => "rate_limit",
            ErrorCategory::Auth401_403 => "auth",
            ErrorCategory::ClientError400_404_422 => "client_error",
            ErrorCategory::ServerError500_502_504 => "server_error",
            ErrorCategory::ServiceUnavailable503 => "service_unavailable",
            ErrorCategory::Timeout408 => "timeout",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Codes probed in priority order when `"status code <digits>"` isn't
/// present verbatim in the error text.
const BARE_CODE_PROBE_ORDER: &[u16] = &[429, 401, 403, 400, 404, 422, 500, 502, 504, 503, 408];

/// Extracts an HTTP-style numeric status code from an error's textual
/// form. Looks for `"status code <digits>"` first, then bare substrings
/// for the known codes in priority order.
pub fn extract_status_code(raw_error: &str) -> Option<u16> {
    if let Some(idx) = raw_error.find("status code ") {
        let rest = &raw_error[idx + "status code ".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(code) = digits.parse::<u16>() {
            return Some(code);
        }
    }
    for &code in BARE_CODE_PROBE_ORDER {
        if raw_error.contains(&code.to_string()) {
            return Some(code);
        }
    }
    None
}

pub fn categorize(code: Option<u16>) -> ErrorCategory {
    match code {
        Some(429) => ErrorCategory::RateLimit429,
        Some(401) | Some(403) => ErrorCategory::Auth401_403,
        Some(400) | Some(404) | Some(422) => ErrorCategory::ClientError400_404_422,
        Some(500) | Some(502) | Some(504) => ErrorCategory::ServerError500_502_504,
        Some(503) => ErrorCategory::ServiceUnavailable503,
        Some(408) => ErrorCategory::Timeout408,
        _ => ErrorCategory::Unknown,
    }
}

/// The full classify-and-act pipeline: mutates the registry,
/// emits a best-effort log record, and returns the next key to try (`None`
/// once retry budget or the key ring is exhausted).
pub struct ErrorClassifier<'a> {
    pub registry: &'a KeyRegistry,
    pub log: &'a dyn ErrorLogSink,
    pub max_retries: u32,
}

impl<'a> ErrorClassifier<'a> {
    pub fn new(registry: &'a KeyRegistry, log: &'a dyn ErrorLogSink, max_retries: u32) -> Self {
        Self {
            registry,
            log,
            max_retries,
        }
    }

    pub fn apply(
        &self,
        raw_error: &str,
        key: &Key,
        model: Option<&str>,
        attempt_index: u32,
    ) -> Option<Key> {
        let code = extract_status_code(raw_error);
        let category = categorize(code);

        let next = match category {
            ErrorCategory::RateLimit429 => match model {
                Some(m) => {
                    self.registry.mark_model_cooling(key, m);
                    self.registry.get_next_working(Some(m))
                }
                None => {
                    self.registry.mark_failed(key);
                    self.registry.get_next_working(None)
                }
            },
            ErrorCategory::Auth401_403
            | ErrorCategory::ClientError400_404_422
            | ErrorCategory::ServerError500_502_504 => {
                self.registry.mark_failed(key);
                self.registry.get_next_working(model)
            }
            ErrorCategory::ServiceUnavailable503 | ErrorCategory::Timeout408 => {
                self.registry.get_next_working(model)
            }
            ErrorCategory::Unknown => {
                self.registry
                    .handle_api_failure(key, attempt_index, self.max_retries, model)
            }
        };

        self.log.record(ErrorLogRecord {
            key: Some(key.clone()),
            model: model.map(|m| m.to_string()),
            category: category.as_str().to_string(),
            code,
            raw_error: raw_error.to_string(),
            attempt_index,
        });

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::NullLogSink;
    use keygate_domain::clock::SystemClock;
    use std::sync::Arc;

    fn registry(keys: &[&str]) -> KeyRegistry {
        KeyRegistry::new(
            keys.iter().map(|s| Key::new(*s)).collect(),
            3,
            Arc::new(SystemClock),
            chrono_tz::UTC,
            0,
        )
    }

    #[test]
    fn status_code_phrase_takes_priority() {
        assert_eq!(extract_status_code("upstream error: status code 429 received"), Some(429));
        assert_eq!(extract_status_code("status code 999 and also 401 mentioned"), Some(999));
    }

    #[test]
    fn bare_substring_probe_order_prefers_earlier_entries() {
        // 429 is probed before 401 per BARE_CODE_PROBE_ORDER.
        assert_eq!(extract_status_code("got 401 then 429"), Some(429));
    }

    #[test]
    fn no_recognizable_code_is_unknown() {
        assert_eq!(extract_status_code("connection reset by peer"), None);
        assert_eq!(categorize(None), ErrorCategory::Unknown);
    }

    #[test]
    fn scenario_rate_limit_rotation_with_model_context() {
        let r = registry(&["A", "B", "C"]);
        let log = NullLogSink;
        let classifier = ErrorClassifier::new(&r, &log, 3);

        let a = Key::new("A");
        let next = classifier
            .apply("status code 429", &a, Some("gemini-x"), 1)
            .unwrap();
        assert!(["B", "C"].contains(&next.as_str()));
        assert!(r.is_valid(&a), "rate limit must not touch failCount");
        assert!(!r.is_model_available(&a, "gemini-x"));

        let b = Key::new("B");
        let next2 = classifier.apply("status code 429", &b, Some("gemini-x"), 1).unwrap();
        assert_eq!(next2.as_str(), "C");
    }

    #[test]
    fn scenario_auth_error_fails_key_permanently() {
        let r = registry(&["A", "B"]);
        let log = NullLogSink;
        let classifier = ErrorClassifier::new(&r, &log, 3);
        let a = Key::new("A");

        let next = classifier.apply("status code 403", &a, None, 1).unwrap();
        assert_eq!(next.as_str(), "B");
        assert!(!r.is_valid(&a));
        assert_eq!(r.get_next_working(None).unwrap().as_str(), "B");
    }

    #[test]
    fn scenario_unknown_error_counts_up_to_ceiling() {
        let r = registry(&["A", "B"]);
        let log = NullLogSink;
        let classifier = ErrorClassifier::new(&r, &log, 10);
        let a = Key::new("A");

        classifier.apply("connection reset", &a, None, 1);
        classifier.apply("connection reset", &a, None, 2);
        assert!(r.is_valid(&a));
        classifier.apply("connection reset", &a, None, 3);
        assert!(!r.is_valid(&a));
    }

    #[test]
    fn service_unavailable_and_timeout_do_not_touch_fail_count() {
        let r = registry(&["A", "B"]);
        let log = NullLogSink;
        let classifier = ErrorClassifier::new(&r, &log, 3);
        let a = Key::new("A");

        classifier.apply("status code 503", &a, None, 1);
        classifier.apply("status code 408", &a, None, 1);
        assert_eq!(r.fail_counts_snapshot().get(&a).copied().unwrap_or(0), 0);
    }
}
