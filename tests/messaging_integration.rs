//! Message bus semantics: acknowledgement idempotence, broadcast
//! visibility, threading, and priority ordering.
//!
//! Run with: DATABASE_URL=postgresql://... cargo test --test messaging_integration

mod common;

use railyard::messaging::SendMessage;
use railyard::models::{MessagePriority, BROADCAST};

fn message(from: &str, to: &str, subject: &str, priority: MessagePriority) -> SendMessage {
    SendMessage {
        from_agent: from.to_string(),
        to_agent: to.to_string(),
        subject: subject.to_string(),
        body: String::new(),
        car_id: None,
        thread_id: None,
        priority,
    }
}

#[tokio::test]
async fn ack_is_idempotent() {
    let fixture = require_db!();
    let messages = fixture.messages();
    let (from, to) = (fixture.agent("sup"), fixture.agent("eng"));

    let id = messages
        .send(message(&from, &to, "guidance", MessagePriority::Normal))
        .await
        .unwrap();
    assert_eq!(messages.inbox(&to).await.unwrap().len(), 1);

    messages.ack(&id, &to).await.unwrap();
    messages.ack(&id, &to).await.unwrap();
    assert!(messages.inbox(&to).await.unwrap().is_empty());
    assert!(messages.fetch(&id).await.unwrap().acknowledged);
}

#[tokio::test]
async fn broadcast_ack_is_per_recipient() {
    let fixture = require_db!();
    let messages = fixture.messages();
    let (e1, e2) = (fixture.agent("e1"), fixture.agent("e2"));

    let id = messages
        .send(message(
            &fixture.agent("orch"),
            BROADCAST,
            "drain",
            MessagePriority::Urgent,
        ))
        .await
        .unwrap();

    assert!(messages.inbox(&e1).await.unwrap().iter().any(|m| m.id == id));
    assert!(messages.inbox(&e2).await.unwrap().iter().any(|m| m.id == id));

    messages.ack(&id, &e1).await.unwrap();
    assert!(!messages.inbox(&e1).await.unwrap().iter().any(|m| m.id == id));
    // e2 still sees it; one agent's ack never hides a broadcast from another.
    assert!(messages.inbox(&e2).await.unwrap().iter().any(|m| m.id == id));
    // The broadcast row itself stays unacknowledged.
    assert!(!messages.fetch(&id).await.unwrap().acknowledged);
}

#[tokio::test]
async fn replies_share_a_thread_and_reach_the_sender() {
    let fixture = require_db!();
    let messages = fixture.messages();
    let (sup, eng) = (fixture.agent("sup"), fixture.agent("eng"));

    let root = messages
        .send(message(&sup, &eng, "merge-failed: car-00001", MessagePriority::High))
        .await
        .unwrap();
    let reply = messages.reply(&root, &eng, "looking into it").await.unwrap();
    let reply_to_reply = messages.reply(&reply, &sup, "thanks").await.unwrap();

    let thread = messages.thread(&root).await.unwrap();
    let ids: Vec<&str> = thread.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec![root.as_str(), reply.as_str(), reply_to_reply.as_str()]);

    let reply_row = messages.fetch(&reply).await.unwrap();
    assert_eq!(reply_row.to_agent, sup);
    assert_eq!(reply_row.subject, "Re: merge-failed: car-00001");
    assert_eq!(reply_row.thread_id.as_deref(), Some(root.as_str()));

    // Replying to a reply does not double the prefix.
    let second = messages.fetch(&reply_to_reply).await.unwrap();
    assert_eq!(second.subject, "Re: merge-failed: car-00001");
    assert_eq!(second.thread_id.as_deref(), Some(root.as_str()));
}

#[tokio::test]
async fn inbox_orders_by_priority_then_age() {
    let fixture = require_db!();
    let messages = fixture.messages();
    let to = fixture.agent("eng");
    let from = fixture.agent("sup");

    let low = messages
        .send(message(&from, &to, "low first by age", MessagePriority::Low))
        .await
        .unwrap();
    let normal = messages
        .send(message(&from, &to, "normal", MessagePriority::Normal))
        .await
        .unwrap();
    let urgent = messages
        .send(message(&from, &to, "urgent last by age", MessagePriority::Urgent))
        .await
        .unwrap();

    let inbox = messages.inbox(&to).await.unwrap();
    let ids: Vec<&str> = inbox.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec![urgent.as_str(), normal.as_str(), low.as_str()]);
}

#[tokio::test]
async fn unknown_message_is_not_found() {
    let fixture = require_db!();
    let messages = fixture.messages();
    let err = messages.ack("msg-zzzzz", &fixture.agent("eng")).await.unwrap_err();
    assert!(matches!(err, railyard::RailyardError::NotFound { .. }));
}
