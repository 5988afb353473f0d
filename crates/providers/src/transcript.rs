//! Conversation history for backends that keep no server-side state.
//!
//! Ollama and TGI only ever see the messages in the current request. To
//! honour `previous_response_id` the adapter records the full transcript of
//! each response it produced and replays it on the next request.

use std::collections::VecDeque;
use std::sync::Mutex;

use termpilot_core::ConversationItem;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug)]
pub struct TranscriptCache {
    entries: Mutex<VecDeque<(String, Vec<ConversationItem>)>>,
    capacity: usize,
}

impl TranscriptCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// History leading up to `previous_response_id`, followed by `input`.
    pub fn resolve(
        &self,
        previous_response_id: Option<&str>,
        input: &[ConversationItem],
    ) -> Vec<ConversationItem> {
        let mut transcript = match previous_response_id {
            Some(id) => {
                let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                match entries.iter().find(|(key, _)| key == id) {
                    Some((_, items)) => items.clone(),
                    None => {
                        warn!(response_id = %id, "No transcript recorded for previous response; starting fresh");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };
        transcript.extend_from_slice(input);
        transcript
    }

    /// Remember the full transcript ending with `response_id`. The oldest
    /// entry is evicted once the cache is full.
    pub fn record(&self, response_id: &str, transcript: Vec<ConversationItem>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|(key, _)| key != response_id);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back((response_id.to_string(), transcript));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TranscriptCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prepends_recorded_history() {
        let cache = TranscriptCache::default();
        let first = vec![
            ConversationItem::user_text("Hello"),
            ConversationItem::assistant_text("Hi"),
        ];
        cache.record("r1", first.clone());

        let next = ConversationItem::user_text("And now?");
        let transcript = cache.resolve(Some("r1"), std::slice::from_ref(&next));
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[..2], first[..]);
        assert_eq!(transcript[2], next);
    }

    #[test]
    fn unknown_previous_id_starts_fresh() {
        let cache = TranscriptCache::default();
        let input = vec![ConversationItem::user_text("x")];
        assert_eq!(cache.resolve(Some("missing"), &input), input);
        assert_eq!(cache.resolve(None, &input), input);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache = TranscriptCache::new(2);
        cache.record("a", vec![]);
        cache.record("b", vec![]);
        cache.record("c", vec![ConversationItem::user_text("c")]);
        assert_eq!(cache.len(), 2);
        assert!(cache.resolve(Some("a"), &[]).is_empty());
        assert_eq!(cache.resolve(Some("c"), &[]).len(), 1);
    }
}
