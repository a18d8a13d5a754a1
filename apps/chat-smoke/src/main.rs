mod config;
mod logging;

use std::{error::Error, sync::Arc, time::Duration};

use chat_core::{
    ChatEvent, ChatUser, Conversation, ConversationKind, EventStream, SendOutcome,
    SubscriptionState, next_event,
};
use chat_runtime::{ChatSession, InMemoryChatBackend, text_record};
use tracing::{info, warn};

use crate::config::SmokeConfig;

const LIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        eprintln!("Smoke run failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: SmokeConfig) -> Result<(), Box<dyn Error>> {
    let backend = seeded_backend(config.seed_messages);
    let session = ChatSession::new(Arc::new(backend.clone()), config.runtime.clone());
    let mut events = session.subscribe();

    session.bootstrap(false).await?;
    let registry = session.registry();
    let user = registry.current_user().ok_or("bootstrap returned no user")?;
    let shared_id = registry
        .shared_conversation_id()
        .ok_or("bootstrap returned no shared conversation")?;
    info!(user_id = %user.id, display_name = ?user.display_name, "signed in");

    if let Some(target) = &config.direct_target {
        let direct = session.ensure_direct_conversation(target).await?;
        info!(chat_id = %direct.chat_id, created = direct.created, "direct conversation ready");
    }

    session.select_conversation(&shared_id);
    tokio::time::timeout(LIVE_TIMEOUT, wait_for_live(&mut events, &shared_id))
        .await
        .map_err(|_| "timed out waiting for the live feed")??;
    info!(
        conversation_id = %shared_id,
        loaded = session.slice(&shared_id).len(),
        "shared conversation live"
    );

    if let Some(ticket) = session.send(&shared_id, &config.message) {
        match ticket.outcome().await {
            SendOutcome::Success { message_id } => info!(%message_id, "message confirmed"),
            SendOutcome::Failure { error } => warn!(%error, "message failed"),
        }
    }

    let page = session.load_older(&shared_id).await;
    info!(?page, more = session.has_more_history(&shared_id), "older page requested");

    session.detach();
    println!("{}", serde_json::to_string_pretty(&session.slice(&shared_id))?);
    Ok(())
}

fn seeded_backend(seed_messages: usize) -> InMemoryChatBackend {
    let backend = InMemoryChatBackend::new(
        ChatUser {
            id: "smoke-user".to_owned(),
            display_name: Some("Smoke Tester".to_owned()),
        },
        Conversation {
            id: "shared".to_owned(),
            kind: ConversationKind::Shared,
            title: Some("Everyone".to_owned()),
            created_at_ms: 1_000,
            updated_at_ms: None,
            member_count: Some(3),
        },
    );
    backend.seed(
        "shared",
        (1..=seed_messages as u64)
            .map(|n| {
                let content = format!("seeded message {n}");
                text_record("shared", &format!("seed-{n}"), 1_000 + n * 1_000, &content)
            })
            .collect(),
    );
    backend
}

async fn wait_for_live(
    events: &mut EventStream,
    conversation_id: &str,
) -> Result<(), Box<dyn Error>> {
    loop {
        match next_event(events).await? {
            ChatEvent::SubscriptionStateChanged {
                conversation_id: changed,
                state,
            } if changed == conversation_id => match state {
                SubscriptionState::Live => return Ok(()),
                SubscriptionState::Error | SubscriptionState::Detached => {
                    return Err(format!("live feed ended in state {state:?}").into());
                }
                _ => {}
            },
            ChatEvent::ConversationError { error, .. } => warn!(%error, "conversation error"),
            _ => {}
        }
    }
}
