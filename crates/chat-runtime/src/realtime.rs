use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chat_core::{
    ChatError, ChatStore, MessageQuery, MessageRecord, PageCursor, RetryPolicy, RuntimeConfig,
    normalize_page,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::{ChatBackend, LiveFeed};

/// Opens live feeds and merges their batches into the store.
pub struct RealtimeSubscription {
    backend: Arc<dyn ChatBackend>,
    store: Arc<ChatStore>,
    config: RuntimeConfig,
}

impl RealtimeSubscription {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<ChatStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            backend,
            store,
            config,
        }
    }

    /// Start a live feed for `conversation_id`.
    ///
    /// Must be called from within a tokio runtime. The returned handle owns
    /// the feed; cancel it (or drop it) to detach.
    pub fn attach(&self, conversation_id: &str) -> SubscriptionHandle {
        let epoch = self.store.begin_attach(conversation_id);
        let stop = CancellationToken::new();
        let feed = FeedTask {
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            conversation_id: conversation_id.to_owned(),
            epoch,
            config: self.config.clone(),
        };
        let task = tokio::spawn(feed.run(stop.child_token()));
        info!(%conversation_id, epoch, "live subscription attaching");

        SubscriptionHandle {
            conversation_id: conversation_id.to_owned(),
            epoch,
            store: Arc::clone(&self.store),
            stop,
            task: Some(task),
            cancelled: AtomicBool::new(false),
        }
    }
}

/// Cancel handle for one attached live feed.
#[derive(Debug)]
pub struct SubscriptionHandle {
    conversation_id: String,
    epoch: u64,
    store: Arc<ChatStore>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    cancelled: AtomicBool,
}

impl SubscriptionHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the feed task has stopped, either cancelled or after a fault
    /// it does not reattach from.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel the feed. Returns `false` when it was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            debug!(conversation_id = %self.conversation_id, "subscription already cancelled");
            return false;
        }
        self.stop.cancel();
        self.store.detach(&self.conversation_id, self.epoch);
        info!(
            conversation_id = %self.conversation_id,
            epoch = self.epoch,
            "live subscription detached"
        );
        true
    }

    /// Cancel and wait for the feed task to finish.
    pub async fn join(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

enum FeedEnd {
    Cancelled,
    Fault(ChatError),
}

struct FeedTask {
    backend: Arc<dyn ChatBackend>,
    store: Arc<ChatStore>,
    conversation_id: String,
    epoch: u64,
    config: RuntimeConfig,
}

impl FeedTask {
    async fn run(self, stop: CancellationToken) {
        let retry_policy = RetryPolicy::from_config(&self.config);
        let mut attempt: u32 = 0;

        loop {
            let query = MessageQuery::live(&self.conversation_id, self.config.page_size);
            let fault = tokio::select! {
                _ = stop.cancelled() => break,
                opened = self.backend.subscribe(query) => match opened {
                    Ok(feed) => match self.pump(feed, &stop, &mut attempt).await {
                        FeedEnd::Cancelled => break,
                        FeedEnd::Fault(err) => err,
                    },
                    Err(err) => err,
                },
            };

            warn!(
                conversation_id = %self.conversation_id,
                error = %fault,
                attempt,
                "live feed fault"
            );
            let recoverable = fault.is_recoverable();
            let delay = retry_policy.delay_after(attempt, &fault);
            if !self
                .store
                .subscription_fault(&self.conversation_id, self.epoch, fault)
            {
                break;
            }
            if !self.config.auto_reattach || !recoverable {
                break;
            }

            attempt = attempt.saturating_add(1);
            debug!(
                conversation_id = %self.conversation_id,
                delay_ms = delay.as_millis() as u64,
                "reattaching live feed after delay"
            );
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.store.reattach(&self.conversation_id, self.epoch) {
                break;
            }
        }

        debug!(
            conversation_id = %self.conversation_id,
            epoch = self.epoch,
            "live feed task finished"
        );
    }

    async fn pump(
        &self,
        mut feed: LiveFeed,
        stop: &CancellationToken,
        attempt: &mut u32,
    ) -> FeedEnd {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return FeedEnd::Cancelled,
                item = feed.recv() => match item {
                    Some(Ok(records)) => {
                        self.apply_batch(records);
                        *attempt = 0;
                    }
                    Some(Err(err)) => return FeedEnd::Fault(err),
                    None => {
                        return FeedEnd::Fault(ChatError::network(
                            "live_feed_closed",
                            "live feed closed by backend",
                        ));
                    }
                },
            }
        }
    }

    fn apply_batch(&self, records: Vec<MessageRecord>) {
        let (records, foreign): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| record.chat_id == self.conversation_id);
        if !foreign.is_empty() {
            warn!(
                conversation_id = %self.conversation_id,
                dropped = foreign.len(),
                "live batch contained records of another conversation"
            );
        }

        let oldest = records
            .iter()
            .map(PageCursor::from_record)
            .reduce(PageCursor::older_of);
        let messages = normalize_page(records);
        let stats = self
            .store
            .apply_live_batch(&self.conversation_id, self.epoch, &messages, oldest);
        trace!(
            conversation_id = %self.conversation_id,
            inserted = stats.inserted,
            updated = stats.updated,
            "live batch merged"
        );
    }
}

#[cfg(test)]
mod tests {
    use chat_core::{ChatErrorCategory, ChatEvents, SubscriptionState};

    use super::*;
    use crate::{
        memory::{InMemoryChatBackend, text_record},
        test_support::{backend, eventually},
    };

    fn setup(config: RuntimeConfig) -> (InMemoryChatBackend, Arc<ChatStore>, RealtimeSubscription) {
        let backend = backend();
        let store = Arc::new(ChatStore::new(ChatEvents::default()));
        let realtime =
            RealtimeSubscription::new(Arc::new(backend.clone()), Arc::clone(&store), config);
        (backend, store, realtime)
    }

    fn ids(store: &ChatStore, conversation_id: &str) -> Vec<String> {
        store.slice(conversation_id).ids().to_vec()
    }

    #[tokio::test]
    async fn first_batch_goes_live_and_seeds_cursor() {
        let (backend, store, realtime) = setup(RuntimeConfig::default());
        backend.seed(
            "fam1",
            vec![
                text_record("fam1", "m5", 50, "a"),
                text_record("fam1", "m6", 60, "b"),
                text_record("fam1", "m7", 70, "c"),
            ],
        );

        let handle = realtime.attach("fam1");
        eventually("live state", || {
            store.subscription_state("fam1") == SubscriptionState::Live
        })
        .await;

        assert_eq!(ids(&store, "fam1"), ["m5", "m6", "m7"]);
        assert_eq!(store.cursor("fam1").map(|c| c.id), Some("m5".to_owned()));
        handle.join().await;
    }

    #[tokio::test]
    async fn incremental_batches_are_merged_in_order() {
        let (backend, store, realtime) = setup(RuntimeConfig::default());
        let _handle = realtime.attach("fam1");
        eventually("live state", || {
            store.subscription_state("fam1") == SubscriptionState::Live
        })
        .await;

        backend.push_live("fam1", vec![text_record("fam1", "m2", 20, "late")]);
        backend.push_live("fam1", vec![text_record("fam1", "m1", 10, "early")]);

        eventually("both batches", || store.slice("fam1").len() == 2).await;
        assert_eq!(ids(&store, "fam1"), ["m1", "m2"]);
    }

    #[tokio::test]
    async fn double_cancel_is_a_no_op() {
        let (backend, store, realtime) = setup(RuntimeConfig::default());
        let handle = realtime.attach("fam1");
        eventually("feed open", || backend.open_feeds("fam1") == 1).await;

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(store.subscription_state("fam1"), SubscriptionState::Detached);

        handle.join().await;
        eventually("feed closed", || backend.open_feeds("fam1") == 0).await;
    }

    #[tokio::test]
    async fn unrecoverable_fault_leaves_history_and_stops() {
        let (backend, store, realtime) = setup(RuntimeConfig::default());
        backend.seed("fam1", vec![text_record("fam1", "m1", 10, "kept")]);
        let _handle = realtime.attach("fam1");
        eventually("live state", || {
            store.subscription_state("fam1") == SubscriptionState::Live
        })
        .await;

        backend.break_feeds(
            "fam1",
            ChatError::new(ChatErrorCategory::Auth, "permission_denied", "revoked"),
        );

        eventually("error state", || {
            store.subscription_state("fam1") == SubscriptionState::Error
        })
        .await;
        assert_eq!(ids(&store, "fam1"), ["m1"]);
        assert_eq!(
            store.error("fam1").map(|e| e.code),
            Some("permission_denied".to_owned())
        );
        assert_eq!(backend.calls().subscribe, 1);
    }

    #[tokio::test]
    async fn recoverable_fault_reattaches_with_backoff() {
        let config = RuntimeConfig {
            reattach_base_delay_ms: 5,
            reattach_max_delay_ms: 20,
            ..RuntimeConfig::default()
        };
        let (backend, store, realtime) = setup(config);
        let _handle = realtime.attach("fam1");
        eventually("live state", || {
            store.subscription_state("fam1") == SubscriptionState::Live
        })
        .await;

        backend.break_feeds(
            "fam1",
            ChatError::new(ChatErrorCategory::Network, "unavailable", "socket reset"),
        );

        eventually("second subscribe", || backend.calls().subscribe == 2).await;
        eventually("live again", || {
            store.subscription_state("fam1") == SubscriptionState::Live
        })
        .await;
        assert_eq!(store.error("fam1"), None);
    }

    #[tokio::test]
    async fn failing_to_open_is_an_error_state() {
        let config = RuntimeConfig {
            auto_reattach: false,
            ..RuntimeConfig::default()
        };
        let (backend, store, realtime) = setup(config);
        backend.fail_subscribe(Some(ChatError::new(
            ChatErrorCategory::Network,
            "unavailable",
            "down",
        )));

        let _handle = realtime.attach("fam1");
        eventually("error state", || {
            store.subscription_state("fam1") == SubscriptionState::Error
        })
        .await;
        assert_eq!(backend.calls().subscribe, 1);
    }
}
