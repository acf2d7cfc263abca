// Failure classification: transient (retry in a later run) vs real

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// How a task failure should be treated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "category", rename_all = "snake_case")]
pub enum FailureKind {
    /// Environmental; the task itself may be fine
    Transient(String),
    Real,
}

impl FailureKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Transient(_))
    }
}

/// Decides whether a failure is worth a durable record
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, text: &str) -> FailureKind;
}

struct CompiledPattern {
    regex: Regex,
    category: &'static str,
}

static PATTERNS: OnceLock<Vec<CompiledPattern>> = OnceLock::new();

const PATTERN_SOURCES: &[(&str, &str)] = &[
    // Word boundary keeps ids like "ses_429f..." from matching
    (r"(?i)\b429\b", "rate_limit"),
    (r"(?i)rate[_\-\s]?limit(ed|ing)?", "rate_limit"),
    (r"(?i)too\s+many\s+requests", "rate_limit"),
    (r"(?i)quota\s*(exceeded|limit)", "quota"),
    (r"(?i)usage\s+limit\s+(exceeded|reached)", "quota"),
    (r"(?i)\boverloaded\b", "overloaded"),
    (r"(?i)\b(503|529)\b|service\s+unavailable", "overloaded"),
    (r"(?i)connection\s+(reset|refused|closed|aborted)", "network"),
    (r"(?i)\bECONN(RESET|REFUSED|ABORTED)\b|\bEPIPE\b", "network"),
    (r"(?i)(dns|name)\s+resolution|could\s+not\s+resolve\s+host|getaddrinfo", "network"),
    (r"(?i)network\s+(is\s+)?unreachable|\bETIMEDOUT\b", "network"),
    (r"(?i)timed?\s*out|deadline\s+exceeded", "timeout"),
    (r"(?i)out\s+of\s+memory|cannot\s+allocate\s+memory|\bENOMEM\b", "resource"),
    (r"(?i)no\s+space\s+left\s+on\s+device|\bENOSPC\b", "resource"),
    (r"(?i)too\s+many\s+open\s+files|\bEMFILE\b", "resource"),
];

fn get_patterns() -> &'static Vec<CompiledPattern> {
    PATTERNS.get_or_init(|| {
        PATTERN_SOURCES
            .iter()
            .filter_map(|&(source, category)| match Regex::new(source) {
                Ok(regex) => Some(CompiledPattern { regex, category }),
                Err(e) => {
                    log::error!("[Classifier] Invalid pattern {}: {}", source, e);
                    None
                }
            })
            .collect()
    })
}

/// Regex-based classifier for runner error output
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternClassifier;

impl PatternClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, text: &str) -> FailureKind {
        get_patterns()
            .iter()
            .find(|p| p.regex.is_match(text))
            .map(|p| FailureKind::Transient(p.category.to_string()))
            .unwrap_or(FailureKind::Real)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> FailureKind {
        PatternClassifier::new().classify(text)
    }

    #[test]
    fn test_rate_limits_are_transient() {
        assert_eq!(
            classify("Error: 429 Too Many Requests"),
            FailureKind::Transient("rate_limit".to_string())
        );
        assert_eq!(
            classify("API rate-limited, retry later"),
            FailureKind::Transient("rate_limit".to_string())
        );
    }

    #[test]
    fn test_id_containing_429_is_not_rate_limit() {
        assert_eq!(classify("session ses_429f18024ffe failed"), FailureKind::Real);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            classify("monthly quota exceeded"),
            FailureKind::Transient("quota".to_string())
        );
        assert_eq!(
            classify("the API is Overloaded"),
            FailureKind::Transient("overloaded".to_string())
        );
        assert_eq!(
            classify("read: connection reset by peer"),
            FailureKind::Transient("network".to_string())
        );
        assert_eq!(
            classify("request timed out"),
            FailureKind::Transient("timeout".to_string())
        );
        assert_eq!(
            classify("write failed: No space left on device"),
            FailureKind::Transient("resource".to_string())
        );
    }

    #[test]
    fn test_real_failures() {
        assert_eq!(classify("assertion `left == right` failed"), FailureKind::Real);
        assert_eq!(classify(""), FailureKind::Real);
        assert!(!FailureKind::Real.is_transient());
    }
}
