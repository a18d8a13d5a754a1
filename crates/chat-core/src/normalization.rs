use crate::{
    channel::ChatEvent,
    error::ChatError,
    types::{Message, MessageRecord, SendAck},
};

/// Convert one backend record into a store message.
pub fn normalize_record(record: MessageRecord) -> Message {
    Message {
        id: record.id,
        conversation_id: record.chat_id,
        sender_id: record.sender_user_id,
        content: record.content,
        kind: record.kind,
        timestamp_ms: record.created_at,
        pending: false,
        error: false,
        sample: record.sample,
    }
}

/// Convert a newest-first page into messages in ascending order.
pub fn normalize_page(records: Vec<MessageRecord>) -> Vec<Message> {
    records.into_iter().rev().map(normalize_record).collect()
}

/// Helper describing send success/failure before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Server confirmed the message.
    Success { message_id: String },
    /// Send failed; the placeholder is now a failed record.
    Failure { error: ChatError },
}

/// Convert a send outcome to a stable `ChatEvent::SendAck`.
pub fn normalize_send_outcome(
    conversation_id: impl Into<String>,
    temp_id: impl Into<String>,
    outcome: &SendOutcome,
) -> ChatEvent {
    let conversation_id = conversation_id.into();
    let temp_id = temp_id.into();
    match outcome {
        SendOutcome::Success { message_id } => ChatEvent::SendAck(SendAck {
            conversation_id,
            temp_id,
            message_id: Some(message_id.clone()),
            error_code: None,
        }),
        SendOutcome::Failure { error } => ChatEvent::SendAck(SendAck {
            conversation_id,
            temp_id,
            message_id: None,
            error_code: Some(error.code.clone()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageKind;

    fn record(id: &str, created_at: u64) -> MessageRecord {
        MessageRecord {
            id: id.to_owned(),
            chat_id: "fam1".to_owned(),
            content: format!("body {id}"),
            sender_user_id: "u2".to_owned(),
            created_at,
            kind: MessageKind::Text,
            sample: id == "seed",
        }
    }

    #[test]
    fn reverses_newest_first_pages() {
        let messages = normalize_page(vec![record("m3", 30), record("m2", 20), record("seed", 10)]);

        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["seed", "m2", "m3"]);
        assert!(messages[0].sample);
        assert!(!messages[0].pending);
        assert_eq!(messages[2].conversation_id, "fam1");
        assert_eq!(messages[2].sender_id, "u2");
        assert_eq!(messages[2].timestamp_ms, 30);
    }

    #[test]
    fn maps_success_to_send_ack() {
        let event = normalize_send_outcome(
            "fam1",
            "tmp_1",
            &SendOutcome::Success {
                message_id: "m1".into(),
            },
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.temp_id, "tmp_1");
                assert_eq!(ack.message_id.as_deref(), Some("m1"));
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_send_ack_with_stable_error_code() {
        let event = normalize_send_outcome(
            "fam1",
            "tmp_2",
            &SendOutcome::Failure {
                error: ChatError::network("send_failed", "connection reset"),
            },
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.conversation_id, "fam1");
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("send_failed"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
