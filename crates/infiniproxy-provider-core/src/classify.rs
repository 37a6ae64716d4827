//! The one place that decides whether a backend failure means "this model is
//! not usable here". Substring matching is fuzzy; tighten it here, not at call
//! sites.

use crate::upstream::UpstreamFailure;

const STRICT_VOCABULARY: &[&str] = &["not found", "does not exist", "invalid", "no access"];

/// Streaming transports tend to surface model problems as generic client errors.
const STREAMING_VOCABULARY: &[&str] = &["bad request", "400", "unknown model", "model_not_found"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionHeuristic {
    Strict,
    Streaming,
}

impl RejectionHeuristic {
    fn vocabulary(self) -> impl Iterator<Item = &'static str> {
        let extra: &[&str] = match self {
            RejectionHeuristic::Strict => &[],
            RejectionHeuristic::Streaming => STREAMING_VOCABULARY,
        };
        STRICT_VOCABULARY.iter().chain(extra.iter()).copied()
    }
}

/// Case-insensitive vocabulary match over failure text.
pub fn is_model_rejection(text: &str, heuristic: RejectionHeuristic) -> bool {
    let text = text.to_ascii_lowercase();
    heuristic.vocabulary().any(|needle| text.contains(needle))
}

impl UpstreamFailure {
    /// Transport failures and backend auth failures are never model errors.
    pub fn is_model_rejection(&self, heuristic: RejectionHeuristic) -> bool {
        match self {
            UpstreamFailure::Transport { .. } => false,
            UpstreamFailure::Http { status: 401, .. } => false,
            UpstreamFailure::Http { .. } => is_model_rejection(&self.to_string(), heuristic),
        }
    }
}
