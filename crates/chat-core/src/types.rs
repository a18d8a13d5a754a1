use serde::{Deserialize, Serialize};

/// Default number of records requested per live or historical page.
pub const DEFAULT_PAGE_SIZE: u16 = 30;

/// Prefix reserved for client-generated message ids.
///
/// Backend ids never start with this prefix, so a temporary id can not collide
/// with a server-issued one.
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Conversation kind as reported by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    /// The one conversation every user belongs to.
    Shared,
    /// A one-to-one conversation.
    Direct,
}

/// Conversation metadata record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Backend conversation id.
    pub id: String,
    /// Shared or direct.
    pub kind: ConversationKind,
    /// Optional display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Creation time in milliseconds since Unix epoch.
    #[serde(rename = "createdAt")]
    pub created_at_ms: u64,
    /// Last update time in milliseconds since Unix epoch.
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at_ms: Option<u64>,
    /// Member count when the backend reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u32>,
}

impl Conversation {
    /// Minimal direct conversation record used before full metadata is known.
    pub fn direct_placeholder(id: impl Into<String>, created_at_ms: u64) -> Self {
        Self {
            id: id.into(),
            kind: ConversationKind::Direct,
            title: None,
            created_at_ms,
            updated_at_ms: None,
            member_count: None,
        }
    }
}

/// Current user identity returned by bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    /// Backend user id.
    pub id: String,
    /// Best-effort display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Bootstrap response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapPayload {
    pub user: ChatUser,
    pub shared_conversation: Conversation,
    #[serde(default)]
    pub direct_conversations: Vec<Conversation>,
}

/// Response of the ensure-direct-conversation call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectConversation {
    /// Conversation id shared by the current user and the target.
    pub chat_id: String,
    /// `true` only when this call created the conversation.
    pub created: bool,
}

/// Message kind. Only text is modeled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
}

/// Message record exactly as the backend stores and returns it.
///
/// Also the response body of a post request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub sender_user_id: String,
    /// Logical timestamp in milliseconds.
    pub created_at: u64,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Seed content inserted by the backend.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sample: bool,
}

/// Create-message request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    pub chat_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

/// Normalized message held by conversation slices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    /// Ordering key in milliseconds.
    pub timestamp_ms: u64,
    /// Locally created, awaiting server confirmation.
    #[serde(default)]
    pub pending: bool,
    /// Send failed; content is kept for retry.
    #[serde(default)]
    pub error: bool,
    /// Backend seed content, not user-authored.
    #[serde(default)]
    pub sample: bool,
}

impl Message {
    /// Whether the id was generated locally rather than by the backend.
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// Sort direction of a message query. The backend convention is newest first.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Desc,
}

/// Exclusive lower bound for historical queries: the oldest record loaded so far.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageCursor {
    pub created_at: u64,
    pub id: String,
}

impl PageCursor {
    /// Cursor pointing at a record.
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            created_at: record.created_at,
            id: record.id.clone(),
        }
    }

    /// Whether the cursor sorts strictly after `record`, so a page of older
    /// history starting at the cursor includes it.
    pub fn is_newer_than(&self, record: &MessageRecord) -> bool {
        (record.created_at, record.id.as_str()) < (self.created_at, self.id.as_str())
    }

    /// Keep whichever of `self` and `other` points at the older record.
    pub fn older_of(self, other: Self) -> Self {
        if (other.created_at, other.id.as_str()) < (self.created_at, self.id.as_str()) {
            other
        } else {
            self
        }
    }
}

/// Live feed or historical page query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    /// Conversation equality filter.
    pub chat_id: String,
    pub order: SortOrder,
    pub limit: u16,
    /// Present only for historical pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<PageCursor>,
}

impl MessageQuery {
    /// Query for the newest `limit` records of a conversation.
    pub fn live(chat_id: impl Into<String>, limit: u16) -> Self {
        Self {
            chat_id: chat_id.into(),
            order: SortOrder::Desc,
            limit: limit.max(1),
            start_after: None,
        }
    }

    /// Query for up to `limit` records strictly older than `cursor`.
    pub fn older_than(chat_id: impl Into<String>, cursor: PageCursor, limit: u16) -> Self {
        Self {
            start_after: Some(cursor),
            ..Self::live(chat_id, limit)
        }
    }
}

/// Lifecycle of the live subscription of one conversation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Never attached.
    #[default]
    Unattached,
    /// Subscription requested, no batch received yet.
    Attaching,
    /// At least one batch merged since the last attach.
    Live,
    /// Transport fault; error value is stored on the conversation.
    Error,
    /// Handle cancelled by a conversation switch or teardown.
    Detached,
}

/// Runtime tuning shared by all producers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Records per live or historical page.
    pub page_size: u16,
    /// Reopen a live feed after a recoverable transport fault.
    pub auto_reattach: bool,
    /// Base delay for reattach backoff.
    pub reattach_base_delay_ms: u64,
    /// Cap for reattach backoff.
    pub reattach_max_delay_ms: u64,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            auto_reattach: true,
            reattach_base_delay_ms: 500,
            reattach_max_delay_ms: 30_000,
            event_buffer: 256,
        }
    }
}

/// Acknowledgement of one send attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    pub conversation_id: String,
    /// Temporary id of the placeholder the attempt belongs to.
    pub temp_id: String,
    /// Server id on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_record_uses_backend_field_names() {
        let record = MessageRecord {
            id: "m1".into(),
            chat_id: "fam1".into(),
            content: "Hello".into(),
            sender_user_id: "u1".into(),
            created_at: 42,
            kind: MessageKind::Text,
            sample: false,
        };

        let value = serde_json::to_value(&record).expect("record should serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "id": "m1",
                "chatId": "fam1",
                "content": "Hello",
                "senderUserId": "u1",
                "createdAt": 42,
                "type": "text",
            })
        );
    }

    #[test]
    fn historical_query_carries_exclusive_cursor() {
        let query = MessageQuery::older_than(
            "fam1",
            PageCursor {
                created_at: 50,
                id: "m5".into(),
            },
            30,
        );

        let value = serde_json::to_value(&query).expect("query should serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "chatId": "fam1",
                "order": "desc",
                "limit": 30,
                "startAfter": { "createdAt": 50, "id": "m5" },
            })
        );
    }

    #[test]
    fn parses_bootstrap_payload_with_optional_fields_missing() {
        let payload: BootstrapPayload = serde_json::from_value(serde_json::json!({
            "user": { "id": "u1" },
            "sharedConversation": { "id": "fam1", "kind": "SHARED", "createdAt": 1 },
            "directConversations": [
                { "id": "d1", "kind": "DIRECT", "createdAt": 2, "memberCount": 2 }
            ],
        }))
        .expect("payload should parse");

        assert_eq!(payload.shared_conversation.kind, ConversationKind::Shared);
        assert_eq!(payload.shared_conversation.title, None);
        assert_eq!(payload.direct_conversations[0].member_count, Some(2));
        assert_eq!(payload.direct_conversations[0].updated_at_ms, None);
    }

    #[test]
    fn cursor_keeps_the_older_record() {
        let a = PageCursor {
            created_at: 20,
            id: "b".into(),
        };
        let b = PageCursor {
            created_at: 20,
            id: "a".into(),
        };
        assert_eq!(a.clone().older_of(b.clone()), b);
        assert_eq!(b.clone().older_of(a), b);
    }

    #[test]
    fn cursor_is_newer_than_strictly_older_records_only() {
        let record = |id: &str, created_at| MessageRecord {
            id: id.into(),
            chat_id: "fam1".into(),
            content: String::new(),
            sender_user_id: "u1".into(),
            created_at,
            kind: MessageKind::Text,
            sample: false,
        };
        let cursor = PageCursor {
            created_at: 50,
            id: "m5".into(),
        };

        assert!(cursor.is_newer_than(&record("m9", 40)));
        assert!(cursor.is_newer_than(&record("m4", 50)));
        assert!(!cursor.is_newer_than(&record("m5", 50)));
        assert!(!cursor.is_newer_than(&record("m6", 50)));
        assert!(!cursor.is_newer_than(&record("m1", 60)));
    }
}
