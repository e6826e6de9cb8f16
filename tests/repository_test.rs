//! Integration tests for the typed repositories and conversation cascade

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

use highlight_store::config::DatabaseConfig;
use highlight_store::models::{
    AttachmentKind, AttachmentSource, CaptureMethod, Conversation, HighlightedContext, MessageStore,
    MultimodalAttachment, PageContext, PageMetadata, Role, UserData,
};
use highlight_store::repository::{
    AttachmentRepository, ConversationRepository, HighlightRepository, MessageRepository, PageContextRepository,
    UserRepository,
};
use highlight_store::{ConversationScoped, Database, DbOperations, Repository, SchemaRegistry};

struct Fixture {
    _dir: TempDir,
    ops: DbOperations,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::new(DatabaseConfig::at(dir.path()), SchemaRegistry::default());
        Self {
            _dir: dir,
            ops: DbOperations::new(Arc::new(db)),
        }
    }
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(seconds)
}

fn page_context(id: &str, conversation_id: &str, active: bool, seconds: i64) -> PageContext {
    PageContext {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        context: "page text".to_string(),
        metadata: PageMetadata {
            url: "https://example.com".to_string(),
            title: "Example".to_string(),
            ..PageMetadata::default()
        },
        time_created: at(seconds),
        capture_method: CaptureMethod::ManualButton,
        is_active: active,
        token_count: None,
        last_page_url: "https://example.com".to_string(),
        page_version: None,
    }
}

fn attachment(id: &str, conversation_id: &str, message_id: Option<&str>) -> MultimodalAttachment {
    MultimodalAttachment {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        message_id: message_id.map(str::to_string),
        time_created: at(0),
        kind: AttachmentKind::Screenshot,
        data: "aGVsbG8=".to_string(),
        mime_type: "image/png".to_string(),
        size: 5,
        file_name: None,
        source: AttachmentSource::Screenshot,
        thumbnail: None,
        is_active: true,
        metadata: None,
    }
}

async fn populate(ops: &DbOperations, conversation_id: &str, size: usize) {
    let conversations = ConversationRepository::new(ops.clone());
    let messages = MessageRepository::new(ops.clone());
    let highlights = HighlightRepository::new(ops.clone());
    let page_contexts = PageContextRepository::new(ops.clone());
    let attachments = AttachmentRepository::new(ops.clone());

    conversations
        .save(&Conversation::new(conversation_id, "https://example.com", "Example", at(0)))
        .await
        .unwrap();
    for i in 0..size {
        let id = format!("{conversation_id}-{i}");
        let offset = i64::try_from(i).unwrap();
        messages
            .save(&MessageStore::new(format!("m-{id}"), conversation_id, Role::User, "hi", at(offset)))
            .await
            .unwrap();
        highlights
            .save(&HighlightedContext::new(format!("h-{id}"), conversation_id, "quote", at(offset)))
            .await
            .unwrap();
        page_contexts
            .save(&page_context(&format!("p-{id}"), conversation_id, true, offset))
            .await
            .unwrap();
        attachments
            .save(&attachment(&format!("a-{id}"), conversation_id, None))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_conversation_delete_cascades() {
    let fixture = Fixture::new();
    let ops = &fixture.ops;
    populate(ops, "c1", 3).await;
    populate(ops, "c2", 2).await;

    let conversations = ConversationRepository::new(ops.clone());
    conversations.delete("c1").await.unwrap();

    assert!(conversations.get("c1").await.unwrap().is_none());
    assert!(MessageRepository::new(ops.clone()).get_by_conversation("c1").await.unwrap().is_empty());
    assert!(HighlightRepository::new(ops.clone()).get_by_conversation("c1").await.unwrap().is_empty());
    assert!(PageContextRepository::new(ops.clone()).get_by_conversation("c1").await.unwrap().is_empty());
    assert!(AttachmentRepository::new(ops.clone()).get_by_conversation("c1").await.unwrap().is_empty());

    // Other conversations are untouched
    assert!(conversations.get("c2").await.unwrap().is_some());
    assert_eq!(MessageRepository::new(ops.clone()).count_in(Some("c2")).await.unwrap(), 2);
    assert_eq!(HighlightRepository::new(ops.clone()).count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_deleting_missing_conversation_succeeds() {
    let fixture = Fixture::new();
    let conversations = ConversationRepository::new(fixture.ops.clone());
    conversations.delete("missing").await.unwrap();
}

#[tokio::test]
async fn test_delete_by_conversation_reports_count() {
    let fixture = Fixture::new();
    populate(&fixture.ops, "c1", 4).await;

    let highlights = HighlightRepository::new(fixture.ops.clone());
    assert_eq!(highlights.delete_by_conversation("c1").await.unwrap(), 4);
    assert_eq!(highlights.delete_by_conversation("c1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_highlights_newest_first() {
    let fixture = Fixture::new();
    let highlights = HighlightRepository::new(fixture.ops.clone());
    for (id, seconds) in [("t2", 20), ("t1", 10), ("t3", 30)] {
        highlights
            .save(&HighlightedContext::new(id, "c1", "quote", at(seconds)))
            .await
            .unwrap();
    }

    let ids: Vec<String> = highlights.get_all().await.unwrap().into_iter().map(|h| h.id).collect();
    assert_eq!(ids, ["t3", "t2", "t1"]);
}

#[tokio::test]
async fn test_conversations_most_recent_first() {
    let fixture = Fixture::new();
    let conversations = ConversationRepository::new(fixture.ops.clone());
    for (id, seconds) in [("old", 0), ("newest", 200), ("middle", 100)] {
        let mut conversation = Conversation::new(id, "https://example.com", "Example", at(0));
        conversation.last_updated = at(seconds);
        conversations.save(&conversation).await.unwrap();
    }

    let ids: Vec<String> = conversations.get_all().await.unwrap().into_iter().map(|c| c.id).collect();
    assert_eq!(ids, ["newest", "middle", "old"]);

    assert!(conversations.touch("old", at(500)).await.unwrap());
    let ids: Vec<String> = conversations.get_all().await.unwrap().into_iter().map(|c| c.id).collect();
    assert_eq!(ids, ["old", "newest", "middle"]);
    assert_eq!(conversations.get_by_page_url("https://example.com").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_messages_chronological() {
    let fixture = Fixture::new();
    let messages = MessageRepository::new(fixture.ops.clone());
    for (id, seconds) in [("b", 2), ("c", 3), ("a", 1)] {
        messages
            .save(&MessageStore::new(id, "c1", Role::Assistant, "reply", at(seconds)))
            .await
            .unwrap();
    }

    let ids: Vec<String> = messages.get_by_conversation("c1").await.unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, ["a", "b", "c"]);
}

#[tokio::test]
async fn test_user_lookup_by_email() {
    let fixture = Fixture::new();
    let users = UserRepository::new(fixture.ops.clone());
    let ada = UserData {
        id: "sub-1".to_string(),
        email: "ada@example.com".to_string(),
        name: "Ada".to_string(),
        profile_picture: None,
        preferences: None,
    };
    users.add(&ada).await.unwrap();

    assert_eq!(users.get_by_email("ada@example.com").await.unwrap(), Some(ada.clone()));
    assert!(users.get_by_email("bob@example.com").await.unwrap().is_none());
    assert!(users.exists("sub-1").await.unwrap());

    let impostor = UserData { id: "sub-2".to_string(), ..ada };
    assert!(users.add(&impostor).await.unwrap_err().is_duplicate_key());
}

#[tokio::test]
async fn test_active_page_context_and_attachments_by_message() {
    let fixture = Fixture::new();
    let page_contexts = PageContextRepository::new(fixture.ops.clone());
    page_contexts.save(&page_context("p1", "c1", true, 10)).await.unwrap();
    page_contexts.save(&page_context("p2", "c1", true, 20)).await.unwrap();
    page_contexts.save(&page_context("p3", "c1", false, 30)).await.unwrap();

    let active = page_contexts.get_active("c1").await.unwrap().unwrap();
    assert_eq!(active.id, "p2");
    assert!(page_contexts.get_active("c2").await.unwrap().is_none());

    let attachments = AttachmentRepository::new(fixture.ops.clone());
    attachments.save(&attachment("a1", "c1", Some("m1"))).await.unwrap();
    attachments.save(&attachment("a2", "c1", None)).await.unwrap();
    let sent: Vec<String> = attachments.get_by_message("m1").await.unwrap().into_iter().map(|a| a.id).collect();
    assert_eq!(sent, ["a1"]);
}

#[tokio::test]
async fn test_conversation_with_context() {
    let fixture = Fixture::new();
    populate(&fixture.ops, "c1", 2).await;

    let conversations = ConversationRepository::new(fixture.ops.clone());
    let full = conversations.get_with_context("c1").await.unwrap().unwrap();
    assert_eq!(full.conversation.id, "c1");
    assert_eq!(full.messages.len(), 2);
    assert_eq!(full.messages[0].id, "m-c1-0");
    assert_eq!(full.highlighted_contexts[0].id, "h-c1-1");
    assert_eq!(full.multimodal_attachments.len(), 2);
    assert_eq!(full.page_context.map(|p| p.id), Some("p-c1-1".to_string()));

    assert!(conversations.get_with_context("missing").await.unwrap().is_none());
}
