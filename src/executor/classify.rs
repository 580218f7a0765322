//! Success classification for service replies.

use regex::Regex;

use crate::service::ServiceReply;

/// Classifies replies as success or failure.
///
/// Structured replies are judged on status alone. Text replies also have
/// their trimmed output checked against a deny-list of failure phrases,
/// since the text transport does not report status uniformly.
#[derive(Debug, Clone)]
pub struct Classifier {
    deny: Vec<Regex>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// Classifier with the built-in deny-list.
    pub fn new() -> Self {
        Self {
            deny: default_patterns(),
        }
    }

    /// Whether `reply` counts as a success.
    ///
    /// `payload` marks replies whose text is data (rule lists, contexts), which
    /// are never checked against the deny-list.
    pub fn is_success(&self, reply: &ServiceReply, payload: bool) -> bool {
        if reply.structured {
            return reply.status >= 0;
        }
        reply.status == 0 && (payload || !self.denied(&reply.text))
    }

    /// Whether text output matches a known failure phrase.
    pub fn denied(&self, text: &str) -> bool {
        let trimmed = text.trim();
        self.deny.iter().any(|pattern| pattern.is_match(trimmed))
    }
}

fn default_patterns() -> Vec<Regex> {
    let patterns = [r"(?i)^error\b", r"(?i)^fail(ed|ure)?\b"];

    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}
