//! Typed repositories, one per collection
//!
//! Each repository binds a collection name and a record type to the
//! operation layer. [`ConversationRepository::delete`] is the cascade
//! coordinator: it clears every child collection before removing the
//! conversation itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics;
use crate::models::{
    Conversation, ConversationWithContext, HighlightedContext, MessageStore, MultimodalAttachment, PageContext, Record,
    UserData,
};
use crate::operations::DbOperations;
use crate::schema::{attachments, conversations, highlights, messages, page_context, users};

/// Save, load and delete records of one collection by primary key.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Record type stored in the collection
    type Entity: Record + Serialize + DeserializeOwned + Send + Sync;

    /// Collection name
    const COLLECTION: &'static str;

    /// Operation layer the repository writes through
    fn ops(&self) -> &DbOperations;

    /// Upserts `entity`.
    async fn save(&self, entity: &Self::Entity) -> Result<()> {
        self.ops().put(Self::COLLECTION, entity).await.map(|_| ())
    }

    /// Record with `id`, if stored.
    async fn get(&self, id: &str) -> Result<Option<Self::Entity>> {
        self.ops().get(Self::COLLECTION, id).await
    }

    /// Every record, in storage order.
    async fn get_all(&self) -> Result<Vec<Self::Entity>> {
        self.ops().get_all(Self::COLLECTION, None).await
    }

    /// Number of records.
    async fn count(&self) -> Result<usize> {
        self.ops().count(Self::COLLECTION, None).await
    }

    /// Removes the record with `id`. Succeeds when it does not exist.
    async fn delete(&self, id: &str) -> Result<()> {
        self.ops().delete(Self::COLLECTION, id).await
    }
}

/// Records that belong to a conversation through a `conversationId` index.
#[async_trait]
pub trait ConversationScoped: Repository {
    /// Index over the owning conversation id
    const CONVERSATION_INDEX: &'static str;

    /// Every record owned by `conversation_id`.
    async fn get_by_conversation(&self, conversation_id: &str) -> Result<Vec<Self::Entity>> {
        self.ops().get_all_by_index(Self::COLLECTION, Self::CONVERSATION_INDEX, conversation_id).await
    }

    /// Deletes every record owned by `conversation_id`, concurrently.
    ///
    /// All deletes are awaited; the first failure in record order is
    /// returned. On success returns the number of records removed.
    async fn delete_by_conversation(&self, conversation_id: &str) -> Result<usize> {
        let rows = self.get_by_conversation(conversation_id).await?;
        let ops = self.ops();
        let results = join_all(rows.iter().map(|row| ops.delete(Self::COLLECTION, row.id()))).await;

        let deleted = results.len();
        results.into_iter().collect::<Result<Vec<()>>>()?;
        debug!(collection = Self::COLLECTION, conversation_id, deleted, "Deleted conversation records");
        Ok(deleted)
    }
}

/// A child collection cleared when its conversation is deleted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CascadeTarget: Send + Sync {
    /// Collection name, for logging
    fn collection(&self) -> &'static str;

    /// Deletes every record owned by `conversation_id`.
    async fn clear_conversation(&self, conversation_id: &str) -> Result<usize>;
}

macro_rules! cascade_target {
    ($($repo:ty),+ $(,)?) => {
        $(#[async_trait]
        impl CascadeTarget for $repo {
            fn collection(&self) -> &'static str {
                <Self as Repository>::COLLECTION
            }

            async fn clear_conversation(&self, conversation_id: &str) -> Result<usize> {
                self.delete_by_conversation(conversation_id).await
            }
        })+
    };
}

/// Signed-in users
#[derive(Debug, Clone)]
pub struct UserRepository {
    ops: DbOperations,
}

impl UserRepository {
    /// Binds the `users` collection.
    pub const fn new(ops: DbOperations) -> Self {
        Self { ops }
    }

    /// Inserts a new user; fails with `DuplicateKey` if the id or email is taken.
    pub async fn add(&self, user: &UserData) -> Result<()> {
        self.ops.add(users::COLLECTION, user).await.map(|_| ())
    }

    /// User registered with `email`.
    pub async fn get_by_email(&self, email: &str) -> Result<Option<UserData>> {
        self.ops.get_by_index(users::COLLECTION, users::EMAIL, email).await
    }

    /// Whether a user with `id` is stored.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }
}

#[async_trait]
impl Repository for UserRepository {
    type Entity = UserData;

    const COLLECTION: &'static str = users::COLLECTION;

    fn ops(&self) -> &DbOperations {
        &self.ops
    }
}

/// Chat messages
#[derive(Debug, Clone)]
pub struct MessageRepository {
    ops: DbOperations,
}

impl MessageRepository {
    /// Binds the `messages` collection.
    pub const fn new(ops: DbOperations) -> Self {
        Self { ops }
    }

    /// Number of messages, overall or within one conversation.
    pub async fn count_in(&self, conversation_id: Option<&str>) -> Result<usize> {
        match conversation_id {
            Some(id) => self.ops.count_by_index(messages::COLLECTION, messages::CONVERSATION_ID, id).await,
            None => self.count().await,
        }
    }
}

#[async_trait]
impl Repository for MessageRepository {
    type Entity = MessageStore;

    const COLLECTION: &'static str = messages::COLLECTION;

    fn ops(&self) -> &DbOperations {
        &self.ops
    }
}

#[async_trait]
impl ConversationScoped for MessageRepository {
    const CONVERSATION_INDEX: &'static str = messages::CONVERSATION_ID;

    /// Messages of `conversation_id`, oldest first.
    async fn get_by_conversation(&self, conversation_id: &str) -> Result<Vec<MessageStore>> {
        let mut rows: Vec<MessageStore> = self
            .ops
            .get_all_by_index(messages::COLLECTION, messages::CONVERSATION_ID, conversation_id)
            .await?;
        rows.sort_by_key(|message| message.time_created);
        Ok(rows)
    }
}

/// Highlighted page text
#[derive(Debug, Clone)]
pub struct HighlightRepository {
    ops: DbOperations,
}

impl HighlightRepository {
    /// Binds the `highlights` collection.
    pub const fn new(ops: DbOperations) -> Self {
        Self { ops }
    }
}

#[async_trait]
impl Repository for HighlightRepository {
    type Entity = HighlightedContext;

    const COLLECTION: &'static str = highlights::COLLECTION;

    fn ops(&self) -> &DbOperations {
        &self.ops
    }

    /// Every highlight, newest first.
    async fn get_all(&self) -> Result<Vec<HighlightedContext>> {
        let mut rows: Vec<HighlightedContext> = self.ops.get_all(highlights::COLLECTION, None).await?;
        rows.sort_by(|a, b| b.time_created.cmp(&a.time_created));
        Ok(rows)
    }
}

#[async_trait]
impl ConversationScoped for HighlightRepository {
    const CONVERSATION_INDEX: &'static str = highlights::CONVERSATION_ID;
}

/// Captured page text
#[derive(Debug, Clone)]
pub struct PageContextRepository {
    ops: DbOperations,
}

impl PageContextRepository {
    /// Binds the `pageContext` collection.
    pub const fn new(ops: DbOperations) -> Self {
        Self { ops }
    }

    /// Most recent active capture for `conversation_id`.
    pub async fn get_active(&self, conversation_id: &str) -> Result<Option<PageContext>> {
        let contexts = self.get_by_conversation(conversation_id).await?;
        Ok(contexts
            .into_iter()
            .filter(|context| context.is_active)
            .max_by_key(|context| context.time_created))
    }
}

#[async_trait]
impl Repository for PageContextRepository {
    type Entity = PageContext;

    const COLLECTION: &'static str = page_context::COLLECTION;

    fn ops(&self) -> &DbOperations {
        &self.ops
    }
}

#[async_trait]
impl ConversationScoped for PageContextRepository {
    const CONVERSATION_INDEX: &'static str = page_context::CONVERSATION_ID;
}

/// Images and pasted content
#[derive(Debug, Clone)]
pub struct AttachmentRepository {
    ops: DbOperations,
}

impl AttachmentRepository {
    /// Binds the `attachments` collection.
    pub const fn new(ops: DbOperations) -> Self {
        Self { ops }
    }

    /// Attachments sent with `message_id`.
    pub async fn get_by_message(&self, message_id: &str) -> Result<Vec<MultimodalAttachment>> {
        self.ops.get_all_by_index(attachments::COLLECTION, attachments::MESSAGE_ID, message_id).await
    }
}

#[async_trait]
impl Repository for AttachmentRepository {
    type Entity = MultimodalAttachment;

    const COLLECTION: &'static str = attachments::COLLECTION;

    fn ops(&self) -> &DbOperations {
        &self.ops
    }
}

#[async_trait]
impl ConversationScoped for AttachmentRepository {
    const CONVERSATION_INDEX: &'static str = attachments::CONVERSATION_ID;
}

cascade_target!(MessageRepository, HighlightRepository, PageContextRepository, AttachmentRepository);

/// Conversations and the cascade over everything they own
#[derive(Clone)]
pub struct ConversationRepository {
    ops: DbOperations,
    messages: MessageRepository,
    highlights: HighlightRepository,
    page_contexts: PageContextRepository,
    attachments: AttachmentRepository,
    cascade: Vec<Arc<dyn CascadeTarget>>,
}

impl std::fmt::Debug for ConversationRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationRepository")
            .field("cascade", &self.cascade.iter().map(|target| target.collection()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ConversationRepository {
    /// Binds `conversations` and cascades into messages, highlights, page
    /// contexts and attachments, in that order.
    pub fn new(ops: DbOperations) -> Self {
        let messages = MessageRepository::new(ops.clone());
        let highlights = HighlightRepository::new(ops.clone());
        let page_contexts = PageContextRepository::new(ops.clone());
        let attachments = AttachmentRepository::new(ops.clone());
        let cascade: Vec<Arc<dyn CascadeTarget>> = vec![
            Arc::new(messages.clone()),
            Arc::new(highlights.clone()),
            Arc::new(page_contexts.clone()),
            Arc::new(attachments.clone()),
        ];
        Self { ops, messages, highlights, page_contexts, attachments, cascade }
    }

    /// Replaces the cascade targets.
    #[must_use]
    pub fn with_cascade(mut self, cascade: Vec<Arc<dyn CascadeTarget>>) -> Self {
        self.cascade = cascade;
        self
    }

    /// Conversations about `page_url`.
    pub async fn get_by_page_url(&self, page_url: &str) -> Result<Vec<Conversation>> {
        self.ops.get_all_by_index(conversations::COLLECTION, conversations::PAGE_URL, page_url).await
    }

    /// Sets `lastUpdated` to `at`. Returns false when the conversation does not exist.
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let Some(mut conversation) = self.get(id).await? else {
            return Ok(false);
        };
        conversation.last_updated = at;
        self.save(&conversation).await?;
        Ok(true)
    }

    /// The conversation with its active page context, highlights (newest
    /// first), attachments and messages (oldest first).
    pub async fn get_with_context(&self, id: &str) -> Result<Option<ConversationWithContext>> {
        let Some(conversation) = self.get(id).await? else {
            return Ok(None);
        };

        let (page_context, mut highlighted_contexts, multimodal_attachments, messages) = futures::try_join!(
            self.page_contexts.get_active(id),
            self.highlights.get_by_conversation(id),
            self.attachments.get_by_conversation(id),
            self.messages.get_by_conversation(id),
        )?;
        highlighted_contexts.sort_by(|a, b| b.time_created.cmp(&a.time_created));

        Ok(Some(ConversationWithContext {
            conversation,
            page_context,
            highlighted_contexts,
            multimodal_attachments,
            messages,
        }))
    }
}

#[async_trait]
impl Repository for ConversationRepository {
    type Entity = Conversation;

    const COLLECTION: &'static str = conversations::COLLECTION;

    fn ops(&self) -> &DbOperations {
        &self.ops
    }

    /// Every conversation, most recently updated first.
    async fn get_all(&self) -> Result<Vec<Conversation>> {
        let mut rows: Vec<Conversation> = self.ops.get_all(conversations::COLLECTION, None).await?;
        rows.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(rows)
    }

    /// Deletes the conversation and everything it owns.
    ///
    /// Child collections are cleared concurrently and every delete runs to
    /// completion. If any of them fails the conversation is kept and the
    /// first failure, in cascade order, is returned; calling again finishes
    /// the job.
    async fn delete(&self, id: &str) -> Result<()> {
        let results = join_all(self.cascade.iter().map(|target| target.clear_conversation(id))).await;

        let mut failure = None;
        for (target, result) in self.cascade.iter().zip(results) {
            match result {
                Ok(deleted) => debug!(collection = target.collection(), conversation_id = id, deleted, "Cascade step done"),
                Err(err) => {
                    warn!(collection = target.collection(), conversation_id = id, error = %err, "Cascade step failed");
                    failure.get_or_insert(err);
                },
            }
        }
        if let Some(err) = failure {
            metrics::record_cascade(false);
            return Err(err);
        }

        let result = self.ops.delete(conversations::COLLECTION, id).await;
        metrics::record_cascade(result.is_ok());
        if result.is_ok() {
            info!(conversation_id = id, "Deleted conversation");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::Database;
    use crate::error::StoreError;
    use crate::models::Role;
    use crate::schema::SchemaRegistry;
    use chrono::Duration;

    fn operations() -> DbOperations {
        DbOperations::new(Arc::new(Database::new(DatabaseConfig::temporary(), SchemaRegistry::default())))
    }

    fn succeeding(collection: &'static str) -> Arc<dyn CascadeTarget> {
        let mut target = MockCascadeTarget::new();
        target.expect_collection().return_const(collection);
        target.expect_clear_conversation().times(1).returning(|_| Ok(0));
        Arc::new(target)
    }

    #[tokio::test]
    async fn test_failed_cascade_keeps_conversation() {
        let ops = operations();
        let repo = ConversationRepository::new(ops.clone());
        repo.save(&Conversation::new("c1", "https://example.com", "Example", Utc::now())).await.unwrap();

        let mut failing = MockCascadeTarget::new();
        failing.expect_collection().return_const("highlights");
        failing
            .expect_clear_conversation()
            .times(1)
            .returning(|_| Err(StoreError::Other("disk full".to_string())));

        let repo = repo.with_cascade(vec![
            succeeding("messages"),
            Arc::new(failing),
            succeeding("pageContext"),
            succeeding("attachments"),
        ]);

        let err = repo.delete("c1").await.unwrap_err();
        assert!(matches!(err, StoreError::Other(ref reason) if reason == "disk full"));
        assert!(repo.get("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_first_failure_in_cascade_order_wins() {
        let repo = ConversationRepository::new(operations());

        let mut messages = MockCascadeTarget::new();
        messages.expect_collection().return_const("messages");
        messages
            .expect_clear_conversation()
            .returning(|_| Err(StoreError::Other("messages".to_string())));
        let mut attachments = MockCascadeTarget::new();
        attachments.expect_collection().return_const("attachments");
        attachments
            .expect_clear_conversation()
            .returning(|_| Err(StoreError::Other("attachments".to_string())));

        let repo = repo.with_cascade(vec![
            Arc::new(messages),
            succeeding("highlights"),
            succeeding("pageContext"),
            Arc::new(attachments),
        ]);

        let err = repo.delete("c1").await.unwrap_err();
        assert!(matches!(err, StoreError::Other(ref reason) if reason == "messages"));
    }

    #[tokio::test]
    async fn test_messages_sorted_oldest_first() {
        let ops = operations();
        let repo = MessageRepository::new(ops);
        let start = Utc::now();
        for (id, offset) in [("m2", 2), ("m0", 0), ("m1", 1)] {
            let message = MessageStore::new(id, "c1", Role::User, "hi", start + Duration::seconds(offset));
            repo.save(&message).await.unwrap();
        }
        repo.save(&MessageStore::new("other", "c2", Role::User, "hi", start)).await.unwrap();

        let ids: Vec<_> = repo.get_by_conversation("c1").await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["m0", "m1", "m2"]);
        assert_eq!(repo.count_in(Some("c1")).await.unwrap(), 3);
        assert_eq!(repo.count_in(None).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_touch_missing_conversation() {
        let repo = ConversationRepository::new(operations());
        assert!(!repo.touch("missing", Utc::now()).await.unwrap());
    }
}
