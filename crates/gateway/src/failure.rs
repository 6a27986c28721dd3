//! Candidate failure taxonomy and classification.

use proto::LlmError;

/// Substrings that mark a provider error as an authentication problem.
const AUTH_KEYWORDS: &[&str] = &["api key", "authentication", "unauthorized", "auth"];

/// Finish reasons that signal provider-side filtering.
const FILTER_FINISH_REASONS: &[&str] = &["content_filter", "safety"];

/// Whether a raised error may be retried against the same candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    NonRetryable,
}

/// Classifies a provider error.
pub fn classify_error(err: &LlmError) -> FailureClass {
    if let LlmError::Auth(_) = err {
        return FailureClass::NonRetryable;
    }
    let message = err.to_string().to_lowercase();
    if AUTH_KEYWORDS.iter().any(|kw| message.contains(kw)) {
        FailureClass::NonRetryable
    } else {
        FailureClass::Retryable
    }
}

/// Why a single candidate did not produce usable text.
///
/// The `Display` form is the reason string recorded on the outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandidateFailure {
    #[error("missing credential for provider {provider}")]
    CredentialMissing { provider: String },

    #[error("authentication failed for provider {provider}")]
    AuthFailure { provider: String },

    #[error("model call failed after {attempts} attempts: {message}")]
    TransientFailure { attempts: u32, message: String },

    #[error("content filtered by provider (reason: {finish_reason})")]
    ContentFiltered { finish_reason: String },

    #[error("empty response despite {completion_tokens} completion tokens (possible content filter)")]
    FilteredDespiteTokens { completion_tokens: u32 },

    #[error("empty response from model")]
    EmptyResponse,
}

/// Inspects a structurally successful completion whose text may still be unusable.
///
/// Returns the failure when the text is missing or blank.
pub fn inspect_empty_text(
    text: Option<&str>,
    finish_reason: Option<&str>,
    completion_tokens: u32,
) -> Option<CandidateFailure> {
    if text.is_some_and(|t| !t.trim().is_empty()) {
        return None;
    }
    if let Some(reason) = finish_reason.filter(|r| FILTER_FINISH_REASONS.contains(r)) {
        return Some(CandidateFailure::ContentFiltered {
            finish_reason: reason.to_string(),
        });
    }
    if completion_tokens > 0 {
        return Some(CandidateFailure::FilteredDespiteTokens { completion_tokens });
    }
    Some(CandidateFailure::EmptyResponse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_auth_variant_is_non_retryable() {
        let err = LlmError::Auth("bad key".to_string());
        assert_eq!(classify_error(&err), FailureClass::NonRetryable);
    }

    #[test]
    fn auth_keywords_in_message_are_non_retryable() {
        for message in [
            "Invalid API key provided",
            "HTTP 401: Unauthorized",
            "authentication_error: invalid x-api-key",
            "OAuth token expired",
        ] {
            let err = LlmError::Api(message.to_string());
            assert_eq!(
                classify_error(&err),
                FailureClass::NonRetryable,
                "expected non-retryable for {message}"
            );
        }
    }

    #[test]
    fn other_errors_are_retryable() {
        assert_eq!(
            classify_error(&LlmError::Api("connection reset by peer".into())),
            FailureClass::Retryable
        );
        assert_eq!(classify_error(&LlmError::RateLimit), FailureClass::Retryable);
    }

    #[test]
    fn non_empty_text_passes_inspection() {
        assert_eq!(inspect_empty_text(Some("hello"), Some("stop"), 3), None);
    }

    #[test]
    fn content_filter_reason_wins_over_token_count() {
        let failure = inspect_empty_text(Some("  "), Some("content_filter"), 12).expect("failure");
        assert_eq!(
            failure,
            CandidateFailure::ContentFiltered {
                finish_reason: "content_filter".into()
            }
        );
        assert!(failure.to_string().contains("content_filter"));
    }

    #[test]
    fn safety_reason_is_content_filtered() {
        let failure = inspect_empty_text(None, Some("safety"), 0).expect("failure");
        assert!(matches!(failure, CandidateFailure::ContentFiltered { .. }));
    }

    #[test]
    fn empty_text_with_tokens_is_filtered_despite_tokens() {
        let failure = inspect_empty_text(Some(""), Some("stop"), 40).expect("failure");
        assert_eq!(
            failure,
            CandidateFailure::FilteredDespiteTokens {
                completion_tokens: 40
            }
        );
    }

    #[test]
    fn empty_text_without_tokens_is_generic_empty() {
        let failure = inspect_empty_text(None, None, 0).expect("failure");
        assert_eq!(failure, CandidateFailure::EmptyResponse);
        assert_eq!(failure.to_string(), "empty response from model");
    }

    #[test]
    fn credential_missing_reason_names_provider() {
        let failure = CandidateFailure::CredentialMissing {
            provider: "google".into(),
        };
        assert_eq!(failure.to_string(), "missing credential for provider google");
    }
}
