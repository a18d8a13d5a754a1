use std::sync::Arc;

use chat_core::{ChatError, ChatStore, MessageQuery, PageCursor, PageStart, normalize_page};
use tracing::{debug, info, warn};

use crate::backend::ChatBackend;

/// Result of one [`PaginationCursor::load_older`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// The live feed has not delivered a page yet; nothing was fetched.
    NoCursor,
    /// An earlier page came back short; nothing was fetched.
    Exhausted,
    /// Another page for the conversation is still outstanding.
    InFlight,
    Loaded { fetched: usize, exhausted: bool },
    /// The fetch failed. Already merged history is untouched.
    Failed(ChatError),
}

/// Loads history backward from the oldest record the store has seen.
pub struct PaginationCursor {
    backend: Arc<dyn ChatBackend>,
    store: Arc<ChatStore>,
    page_size: u16,
}

impl PaginationCursor {
    pub fn new(backend: Arc<dyn ChatBackend>, store: Arc<ChatStore>, page_size: u16) -> Self {
        Self {
            backend,
            store,
            page_size: page_size.max(1),
        }
    }

    /// Fetch the next older page of `conversation_id` and prepend it.
    ///
    /// The result always lands in `conversation_id`, even if the caller has
    /// moved on to another conversation in the meantime.
    pub async fn load_older(&self, conversation_id: &str) -> PageOutcome {
        let cursor = match self.store.begin_page(conversation_id) {
            PageStart::Ready(cursor) => cursor,
            PageStart::NoCursor => {
                debug!(%conversation_id, "no cursor yet; skipping page fetch");
                return PageOutcome::NoCursor;
            }
            PageStart::Exhausted => return PageOutcome::Exhausted,
            PageStart::InFlight => {
                debug!(%conversation_id, "page fetch already in flight");
                return PageOutcome::InFlight;
            }
        };

        let mut claim = PageClaim {
            store: &self.store,
            conversation_id,
            settled: false,
        };
        let query = MessageQuery::older_than(conversation_id, cursor, self.page_size);
        let fetched = self.backend.fetch_page(query).await;
        claim.settled = true;

        match fetched {
            Ok(records) => {
                let fetched = records.len();
                let exhausted = fetched < usize::from(self.page_size);
                let oldest = records
                    .iter()
                    .map(PageCursor::from_record)
                    .reduce(PageCursor::older_of);
                let messages = normalize_page(records);
                self.store
                    .complete_page(conversation_id, &messages, oldest, exhausted);
                info!(%conversation_id, fetched, exhausted, "older page loaded");
                PageOutcome::Loaded { fetched, exhausted }
            }
            Err(err) => {
                warn!(%conversation_id, error = %err, "older page fetch failed");
                self.store.fail_page(conversation_id, err.clone());
                PageOutcome::Failed(err)
            }
        }
    }
}

/// Releases the store's in-flight claim if the fetch future is dropped.
struct PageClaim<'a> {
    store: &'a ChatStore,
    conversation_id: &'a str,
    settled: bool,
}

impl Drop for PageClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(conversation_id = %self.conversation_id, "page fetch abandoned");
            self.store.abandon_page(self.conversation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_core::{ChatErrorCategory, ChatEvents};
    use tokio::time::timeout;

    use super::*;
    use crate::{
        memory::{InMemoryChatBackend, text_record},
        test_support::{backend, eventually},
    };

    fn setup(page_size: u16) -> (InMemoryChatBackend, Arc<ChatStore>, PaginationCursor) {
        let backend = backend();
        let store = Arc::new(ChatStore::new(ChatEvents::default()));
        let cursor =
            PaginationCursor::new(Arc::new(backend.clone()), Arc::clone(&store), page_size);
        (backend, store, cursor)
    }

    fn seed_live(store: &ChatStore, conversation_id: &str, ids: &[(&str, u64)]) {
        let records: Vec<_> = ids
            .iter()
            .rev()
            .map(|(id, ts)| text_record(conversation_id, id, *ts, "live"))
            .collect();
        let oldest = records
            .iter()
            .map(PageCursor::from_record)
            .reduce(PageCursor::older_of);
        let epoch = store.begin_attach(conversation_id);
        store.apply_live_batch(conversation_id, epoch, &normalize_page(records), oldest);
    }

    fn ids(store: &ChatStore, conversation_id: &str) -> Vec<String> {
        store.slice(conversation_id).ids().to_vec()
    }

    #[tokio::test]
    async fn without_cursor_no_fetch_is_issued() {
        let (backend, store, cursor) = setup(3);

        assert_eq!(cursor.load_older("fam1").await, PageOutcome::NoCursor);
        assert_eq!(backend.calls().fetch_page, 0);
        assert!(store.slice("fam1").is_empty());
    }

    #[tokio::test]
    async fn older_page_is_prepended_in_order() {
        let (backend, store, cursor) = setup(3);
        backend.seed(
            "fam1",
            (1..=7)
                .map(|n| text_record("fam1", &format!("m{n}"), n * 10, "x"))
                .collect(),
        );
        seed_live(&store, "fam1", &[("m5", 50), ("m6", 60), ("m7", 70)]);

        let outcome = cursor.load_older("fam1").await;

        assert_eq!(
            outcome,
            PageOutcome::Loaded {
                fetched: 3,
                exhausted: false
            }
        );
        assert_eq!(ids(&store, "fam1"), ["m2", "m3", "m4", "m5", "m6", "m7"]);
        assert_eq!(store.cursor("fam1").map(|c| c.id), Some("m2".to_owned()));
        assert!(store.has_more_history("fam1"));
    }

    #[tokio::test]
    async fn short_page_exhausts_history() {
        let (backend, store, cursor) = setup(3);
        backend.seed(
            "fam1",
            (1..=4)
                .map(|n| text_record("fam1", &format!("m{n}"), n * 10, "x"))
                .collect(),
        );
        seed_live(&store, "fam1", &[("m3", 30), ("m4", 40)]);

        assert_eq!(
            cursor.load_older("fam1").await,
            PageOutcome::Loaded {
                fetched: 2,
                exhausted: true
            }
        );
        assert!(!store.has_more_history("fam1"));
        assert_eq!(cursor.load_older("fam1").await, PageOutcome::Exhausted);
        assert_eq!(backend.calls().fetch_page, 1);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_history_and_allows_retry() {
        let (backend, store, cursor) = setup(3);
        backend.seed("fam1", vec![text_record("fam1", "m1", 10, "x")]);
        seed_live(&store, "fam1", &[("m5", 50)]);
        backend.fail_pages(Some(ChatError::new(
            ChatErrorCategory::Network,
            "unavailable",
            "offline",
        )));

        let outcome = cursor.load_older("fam1").await;

        assert!(matches!(outcome, PageOutcome::Failed(ref err) if err.code == "unavailable"));
        assert_eq!(ids(&store, "fam1"), ["m5"]);
        assert_eq!(store.error("fam1").map(|e| e.code), Some("unavailable".to_owned()));

        backend.fail_pages(None);
        assert!(matches!(
            cursor.load_older("fam1").await,
            PageOutcome::Loaded { fetched: 1, .. }
        ));
        assert_eq!(ids(&store, "fam1"), ["m1", "m5"]);
    }

    #[tokio::test]
    async fn outstanding_fetch_suppresses_a_second_one() {
        let (backend, store, cursor) = setup(3);
        seed_live(&store, "fam1", &[("m5", 50)]);
        assert!(matches!(store.begin_page("fam1"), PageStart::Ready(_)));

        assert_eq!(cursor.load_older("fam1").await, PageOutcome::InFlight);
        assert_eq!(backend.calls().fetch_page, 0);
    }

    #[tokio::test]
    async fn dropped_fetch_releases_its_claim() {
        let (backend, store, cursor) = setup(3);
        seed_live(&store, "fam1", &[("m5", 50)]);
        let _gate = backend.hold_pages();

        let abandoned = timeout(Duration::from_millis(20), cursor.load_older("fam1")).await;

        assert!(abandoned.is_err(), "held fetch should not finish");
        assert_eq!(backend.calls().fetch_page, 1);
        assert!(matches!(store.begin_page("fam1"), PageStart::Ready(_)));
    }

    #[tokio::test]
    async fn held_fetch_suppresses_concurrent_requests() {
        let (backend, store, cursor) = setup(3);
        backend.seed("fam1", vec![text_record("fam1", "m1", 10, "x")]);
        seed_live(&store, "fam1", &[("m5", 50)]);
        let gate = backend.hold_pages();
        let cursor = Arc::new(cursor);

        let first = tokio::spawn({
            let cursor = Arc::clone(&cursor);
            async move { cursor.load_older("fam1").await }
        });
        eventually("first fetch to reach the backend", || {
            backend.calls().fetch_page == 1
        })
        .await;

        assert_eq!(cursor.load_older("fam1").await, PageOutcome::InFlight);
        gate.notify_one();
        assert!(matches!(
            first.await.expect("join"),
            PageOutcome::Loaded { fetched: 1, .. }
        ));
        assert_eq!(backend.calls().fetch_page, 1);
    }

    #[tokio::test]
    async fn pages_land_in_their_own_conversation() {
        let (backend, store, cursor) = setup(3);
        backend.seed("fam1", vec![text_record("fam1", "m1", 10, "x")]);
        seed_live(&store, "fam1", &[("m5", 50)]);
        seed_live(&store, "dm-1", &[("d1", 15)]);

        cursor.load_older("fam1").await;

        assert_eq!(ids(&store, "fam1"), ["m1", "m5"]);
        assert_eq!(ids(&store, "dm-1"), ["d1"]);
    }
}
