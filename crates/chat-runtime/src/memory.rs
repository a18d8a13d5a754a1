//! In-process chat backend used by tests and the smoke binary.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chat_core::{
    BootstrapPayload, ChatError, ChatErrorCategory, ChatUser, Conversation, DirectConversation,
    MessageKind, MessageQuery, MessageRecord, PostMessageRequest,
};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::backend::{ChatBackend, FeedItem, LiveFeed};

const FEED_BUFFER: usize = 64;

/// Number of calls each backend operation has received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub bootstrap: usize,
    pub ensure_direct: usize,
    pub post: usize,
    pub subscribe: usize,
    pub fetch_page: usize,
}

#[derive(Debug, Default)]
struct Faults {
    post: Option<ChatError>,
    fetch_page: Option<ChatError>,
    subscribe: Option<ChatError>,
}

#[derive(Debug)]
struct MemoryState {
    user: ChatUser,
    shared: Conversation,
    directs: Vec<Conversation>,
    direct_by_target: HashMap<String, String>,
    records: HashMap<String, Vec<MessageRecord>>,
    feeds: HashMap<String, Vec<mpsc::Sender<FeedItem>>>,
    clock_ms: u64,
    next_message: u64,
    next_chat: u64,
    faults: Faults,
    calls: CallCounts,
    bootstrap_gate: Option<Arc<Notify>>,
    page_gate: Option<Arc<Notify>>,
}

impl MemoryState {
    fn newest_first(&self, chat_id: &str) -> Vec<MessageRecord> {
        let mut records = self.records.get(chat_id).cloned().unwrap_or_default();
        records.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        records
    }

    fn fan_out(&mut self, chat_id: &str, item: FeedItem) {
        let Some(feeds) = self.feeds.get_mut(chat_id) else {
            return;
        };
        feeds.retain(|tx| !tx.is_closed());
        for tx in feeds.iter() {
            if let Err(err) = tx.try_send(item.clone()) {
                warn!(%chat_id, error = %err, "dropping live batch for a full feed");
            }
        }
    }
}

/// Chat backend kept entirely in memory.
///
/// Assigns `msg-N` ids and monotonically increasing timestamps to posted
/// messages and fans every new record out to the live feeds of its
/// conversation. Faults can be injected per operation.
#[derive(Clone, Debug)]
pub struct InMemoryChatBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryChatBackend {
    pub fn new(user: ChatUser, shared: Conversation) -> Self {
        let clock_ms = shared.created_at_ms;
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                user,
                shared,
                directs: Vec::new(),
                direct_by_target: HashMap::new(),
                records: HashMap::new(),
                feeds: HashMap::new(),
                clock_ms,
                next_message: 0,
                next_chat: 0,
                faults: Faults::default(),
                calls: CallCounts::default(),
                bootstrap_gate: None,
                page_gate: None,
            })),
        }
    }

    /// Register an existing direct conversation with `target_user_id`.
    pub fn add_direct(&self, target_user_id: &str, conversation: Conversation) {
        let mut state = self.lock();
        state
            .direct_by_target
            .insert(target_user_id.to_owned(), conversation.id.clone());
        state.directs.push(conversation);
    }

    /// Store records without notifying live feeds.
    pub fn seed(&self, chat_id: &str, records: Vec<MessageRecord>) {
        let mut state = self.lock();
        if let Some(newest) = records.iter().map(|r| r.created_at).max() {
            state.clock_ms = state.clock_ms.max(newest);
        }
        state
            .records
            .entry(chat_id.to_owned())
            .or_default()
            .extend(records);
    }

    /// Store records and push them to live feeds as one newest-first batch.
    pub fn push_live(&self, chat_id: &str, mut records: Vec<MessageRecord>) {
        records.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        self.seed(chat_id, records.clone());
        self.lock().fan_out(chat_id, Ok(records));
    }

    /// Push a transport fault to every live feed of `chat_id` and close them.
    pub fn break_feeds(&self, chat_id: &str, error: ChatError) {
        let mut state = self.lock();
        state.fan_out(chat_id, Err(error));
        state.feeds.remove(chat_id);
    }

    /// Make every following post fail with `error` (`None` restores success).
    pub fn fail_posts(&self, error: Option<ChatError>) {
        self.lock().faults.post = error;
    }

    pub fn fail_pages(&self, error: Option<ChatError>) {
        self.lock().faults.fetch_page = error;
    }

    pub fn fail_subscribe(&self, error: Option<ChatError>) {
        self.lock().faults.subscribe = error;
    }

    /// Hold the next bootstrap call until the returned gate is notified.
    pub fn hold_bootstrap(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().bootstrap_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Hold the next page fetch until the returned gate is notified.
    pub fn hold_pages(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().page_gate = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Number of open live feeds for `chat_id`.
    pub fn open_feeds(&self, chat_id: &str) -> usize {
        self.lock()
            .feeds
            .get(chat_id)
            .map(|feeds| feeds.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Text record with the given id, conversation and timestamp.
pub fn text_record(chat_id: &str, id: &str, created_at: u64, content: &str) -> MessageRecord {
    MessageRecord {
        id: id.to_owned(),
        chat_id: chat_id.to_owned(),
        content: content.to_owned(),
        sender_user_id: "seed-user".to_owned(),
        created_at,
        kind: MessageKind::Text,
        sample: false,
    }
}

#[async_trait]
impl ChatBackend for InMemoryChatBackend {
    async fn bootstrap(&self) -> Result<BootstrapPayload, ChatError> {
        let gate = {
            let mut state = self.lock();
            state.calls.bootstrap += 1;
            state.bootstrap_gate.take()
        };
        if let Some(gate) = gate {
            debug!("bootstrap held until released");
            gate.notified().await;
        }

        let state = self.lock();
        Ok(BootstrapPayload {
            user: state.user.clone(),
            shared_conversation: state.shared.clone(),
            direct_conversations: state.directs.clone(),
        })
    }

    async fn ensure_direct_chat(
        &self,
        target_user_id: &str,
    ) -> Result<DirectConversation, ChatError> {
        let mut state = self.lock();
        state.calls.ensure_direct += 1;

        if let Some(chat_id) = state.direct_by_target.get(target_user_id) {
            return Ok(DirectConversation {
                chat_id: chat_id.clone(),
                created: false,
            });
        }

        state.next_chat += 1;
        state.clock_ms += 1;
        let chat_id = format!("dm-{}", state.next_chat);
        let conversation = Conversation {
            member_count: Some(2),
            ..Conversation::direct_placeholder(chat_id.clone(), state.clock_ms)
        };
        state.directs.push(conversation);
        state
            .direct_by_target
            .insert(target_user_id.to_owned(), chat_id.clone());

        Ok(DirectConversation {
            chat_id,
            created: true,
        })
    }

    async fn post_message(&self, request: PostMessageRequest) -> Result<MessageRecord, ChatError> {
        let mut state = self.lock();
        state.calls.post += 1;
        if let Some(error) = state.faults.post.clone() {
            return Err(error);
        }
        if request.chat_id != state.shared.id
            && !state.directs.iter().any(|c| c.id == request.chat_id)
        {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "chat_not_found",
                format!("unknown chat '{}'", request.chat_id),
            ));
        }

        state.next_message += 1;
        state.clock_ms += 1;
        let record = MessageRecord {
            id: format!("msg-{}", state.next_message),
            chat_id: request.chat_id.clone(),
            content: request.content,
            sender_user_id: state.user.id.clone(),
            created_at: state.clock_ms,
            kind: request.kind,
            sample: false,
        };
        state
            .records
            .entry(request.chat_id.clone())
            .or_default()
            .push(record.clone());
        state.fan_out(&request.chat_id, Ok(vec![record.clone()]));
        Ok(record)
    }

    async fn subscribe(&self, query: MessageQuery) -> Result<LiveFeed, ChatError> {
        let mut state = self.lock();
        state.calls.subscribe += 1;
        if let Some(error) = state.faults.subscribe.clone() {
            return Err(error);
        }

        let initial: Vec<MessageRecord> = state
            .newest_first(&query.chat_id)
            .into_iter()
            .take(usize::from(query.limit))
            .collect();

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        if tx.try_send(Ok(initial)).is_err() {
            return Err(ChatError::new(
                ChatErrorCategory::Internal,
                "feed_open_failed",
                "could not deliver the initial page",
            ));
        }
        state.feeds.entry(query.chat_id).or_default().push(tx);
        Ok(rx)
    }

    async fn fetch_page(&self, query: MessageQuery) -> Result<Vec<MessageRecord>, ChatError> {
        let gate = {
            let mut state = self.lock();
            state.calls.fetch_page += 1;
            state.page_gate.take()
        };
        if let Some(gate) = gate {
            debug!(chat_id = %query.chat_id, "page fetch held until released");
            gate.notified().await;
        }

        let state = self.lock();
        if let Some(error) = state.faults.fetch_page.clone() {
            return Err(error);
        }

        let page = state
            .newest_first(&query.chat_id)
            .into_iter()
            .filter(|record| {
                query
                    .start_after
                    .as_ref()
                    .is_none_or(|cursor| cursor.is_newer_than(record))
            })
            .take(usize::from(query.limit))
            .collect();
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use chat_core::{ConversationKind, PageCursor};

    use super::*;

    fn backend() -> InMemoryChatBackend {
        InMemoryChatBackend::new(
            ChatUser {
                id: "u1".into(),
                display_name: None,
            },
            Conversation {
                id: "fam1".into(),
                kind: ConversationKind::Shared,
                title: Some("Family".into()),
                created_at_ms: 1,
                updated_at_ms: None,
                member_count: Some(4),
            },
        )
    }

    #[tokio::test]
    async fn pages_are_newest_first_and_exclusive() {
        let backend = backend();
        backend.seed(
            "fam1",
            (1..=5)
                .map(|n| text_record("fam1", &format!("m{n}"), n * 10, "x"))
                .collect(),
        );

        let page = backend
            .fetch_page(MessageQuery::older_than(
                "fam1",
                PageCursor {
                    created_at: 40,
                    id: "m4".into(),
                },
                2,
            ))
            .await
            .expect("page");

        let ids: Vec<_> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["m3", "m2"]);
    }

    #[tokio::test]
    async fn posts_fan_out_to_live_feeds() {
        let backend = backend();
        let mut feed = backend
            .subscribe(MessageQuery::live("fam1", 30))
            .await
            .expect("subscribe");
        let initial = feed.recv().await.expect("initial item").expect("initial page");
        assert!(initial.is_empty());

        let posted = backend
            .post_message(PostMessageRequest {
                chat_id: "fam1".into(),
                content: "hi".into(),
                kind: MessageKind::Text,
            })
            .await
            .expect("post");

        let batch = feed.recv().await.expect("batch").expect("records");
        assert_eq!(batch, vec![posted]);
    }

    #[tokio::test]
    async fn ensure_direct_is_idempotent() {
        let backend = backend();
        let first = backend.ensure_direct_chat("u9").await.expect("first");
        let second = backend.ensure_direct_chat("u9").await.expect("second");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.chat_id, second.chat_id);
    }
}
