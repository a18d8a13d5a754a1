use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Message;

/// Counts reported by a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Ids that were not present before.
    pub inserted: usize,
    /// Ids that already existed and were overwritten.
    pub updated: usize,
}

impl MergeStats {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated > 0
    }
}

/// Normalized per-conversation projection of loaded messages.
///
/// `ids` is always the key set of `by_id`, sorted ascending by
/// `(timestamp_ms, id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSlice {
    ids: Vec<String>,
    by_id: HashMap<String, Message>,
    oldest_ms: Option<u64>,
    newest_ms: Option<u64>,
}

impl ConversationSlice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message ids in display order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Messages in display order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> + '_ {
        self.ids.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Timestamp of the oldest loaded message.
    pub fn oldest_ms(&self) -> Option<u64> {
        self.oldest_ms
    }

    /// Timestamp of the newest loaded message.
    pub fn newest_ms(&self) -> Option<u64> {
        self.newest_ms
    }

    /// Pure form of [`ConversationSlice::merge`].
    pub fn merged(&self, incoming: &[Message], prepend: bool) -> Self {
        let mut next = self.clone();
        next.merge(incoming, prepend);
        next
    }

    /// Upsert `incoming` and recompute order and bounds.
    ///
    /// Incoming fields win for existing ids. The result does not depend on the
    /// order of calls or of messages within a call; `prepend` only describes
    /// where the caller got the page from.
    pub fn merge(&mut self, incoming: &[Message], prepend: bool) -> MergeStats {
        let mut stats = MergeStats::default();
        for message in incoming {
            match self.by_id.insert(message.id.clone(), message.clone()) {
                Some(_) => stats.updated += 1,
                None => stats.inserted += 1,
            }
        }

        if stats.changed() {
            self.reorder();
        }

        tracing::trace!(
            prepend,
            inserted = stats.inserted,
            updated = stats.updated,
            len = self.ids.len(),
            "slice merged"
        );
        stats
    }

    /// Remove one message by id. Returns the removed message, if any.
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let removed = self.by_id.remove(id)?;
        self.ids.retain(|existing| existing != id);
        self.refresh_bounds();
        Some(removed)
    }

    /// Replace `placeholder_id` with `canonical`.
    ///
    /// Returns `true` when the placeholder was still present. An absent
    /// placeholder degrades to a plain merge.
    pub fn reconcile(&mut self, canonical: Message, placeholder_id: &str) -> bool {
        let removed = if placeholder_id != canonical.id {
            self.remove(placeholder_id).is_some()
        } else {
            self.contains(placeholder_id)
        };
        self.merge(std::slice::from_ref(&canonical), false);
        removed
    }

    fn reorder(&mut self) {
        let mut keyed: Vec<(u64, &String)> = self
            .by_id
            .iter()
            .map(|(id, message)| (message.timestamp_ms, id))
            .collect();
        keyed.sort_unstable();
        self.ids = keyed.into_iter().map(|(_, id)| id.clone()).collect();
        self.refresh_bounds();
    }

    fn refresh_bounds(&mut self) {
        let timestamp = |id: Option<&String>| {
            id.and_then(|id| self.by_id.get(id))
                .map(|message| message.timestamp_ms)
        };
        self.oldest_ms = timestamp(self.ids.first());
        self.newest_ms = timestamp(self.ids.last());
    }
}
