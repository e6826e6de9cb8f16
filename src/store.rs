//! Store facade
//!
//! One [`HighlightStore`] owns the database and every repository. Nothing is
//! opened until the first call; concurrent first calls share one open.

use chrono::Utc;
use rand::Rng;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::db::Database;
use crate::error::Result;
use crate::models::{AuthEvent, CaptureEvent, HighlightedContext, UserData};
use crate::operations::DbOperations;
use crate::repository::{
    AttachmentRepository, ConversationRepository, ConversationScoped, HighlightRepository, MessageRepository,
    PageContextRepository, Repository, UserRepository,
};
use crate::schema::SchemaRegistry;
use crate::validation::InputValidator;

/// Conversation captures are filed under when the event names none
pub const DEFAULT_CONVERSATION_ID: &str = "default";

/// Marker colour given to captured highlights
pub const DEFAULT_HIGHLIGHT_COLOR: &str = "#ffeb3b";

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

static GLOBAL: OnceLock<HighlightStore> = OnceLock::new();

/// `highlight_<unix millis>_<9 base36 chars>`
fn highlight_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
        .collect();
    format!("highlight_{}_{suffix}", Utc::now().timestamp_millis())
}

/// Database plus the six repositories
#[derive(Debug, Clone)]
pub struct HighlightStore {
    db: Arc<Database>,
    users: UserRepository,
    conversations: ConversationRepository,
    messages: MessageRepository,
    highlights: HighlightRepository,
    page_contexts: PageContextRepository,
    attachments: AttachmentRepository,
}

impl HighlightStore {
    /// A store at the latest built-in schema.
    pub fn new(config: DatabaseConfig) -> Self {
        Self::with_registry(config, SchemaRegistry::default())
    }

    /// A store migrating to `registry`.
    pub fn with_registry(config: DatabaseConfig, registry: SchemaRegistry) -> Self {
        let db = Arc::new(Database::new(config, registry));
        let ops = DbOperations::new(Arc::clone(&db));
        Self {
            users: UserRepository::new(ops.clone()),
            conversations: ConversationRepository::new(ops.clone()),
            messages: MessageRepository::new(ops.clone()),
            highlights: HighlightRepository::new(ops.clone()),
            page_contexts: PageContextRepository::new(ops.clone()),
            attachments: AttachmentRepository::new(ops),
            db,
        }
    }

    /// Process-wide store with the default configuration.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| Self::new(DatabaseConfig::default()))
    }

    /// Opens the store now rather than on first use.
    pub async fn init(&self) -> Result<()> {
        self.db.init().await
    }

    /// Releases the store; the next call reopens it.
    pub async fn close(&self) -> Result<()> {
        self.db.close().await
    }

    /// Underlying database
    pub const fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Users
    pub const fn users(&self) -> &UserRepository {
        &self.users
    }

    /// Conversations
    pub const fn conversations(&self) -> &ConversationRepository {
        &self.conversations
    }

    /// Messages
    pub const fn messages(&self) -> &MessageRepository {
        &self.messages
    }

    /// Highlights
    pub const fn highlights(&self) -> &HighlightRepository {
        &self.highlights
    }

    /// Page contexts
    pub const fn page_contexts(&self) -> &PageContextRepository {
        &self.page_contexts
    }

    /// Attachments
    pub const fn attachments(&self) -> &AttachmentRepository {
        &self.attachments
    }

    /// Upserts `user`.
    pub async fn save_user(&self, user: &UserData) -> Result<()> {
        InputValidator::validate_user(user)?;
        self.users.save(user).await
    }

    /// User with `id`.
    pub async fn get_user(&self, id: &str) -> Result<Option<UserData>> {
        self.users.get(id).await
    }

    /// Every user.
    pub async fn get_all_users(&self) -> Result<Vec<UserData>> {
        self.users.get_all().await
    }

    /// Removes the user with `id`.
    pub async fn delete_user(&self, id: &str) -> Result<()> {
        self.users.delete(id).await
    }

    /// Records the profile from a completed sign-in, replacing any stored copy.
    pub async fn sign_in(&self, event: AuthEvent) -> Result<UserData> {
        let user = UserData::from(event);
        self.save_user(&user).await?;
        info!(user_id = %user.id, "User signed in");
        Ok(user)
    }

    /// The stored user for `event`, created from the event on first sight.
    pub async fn current_user(&self, event: AuthEvent) -> Result<UserData> {
        if let Some(user) = self.users.get(&event.id).await? {
            return Ok(user);
        }
        self.sign_in(event).await
    }

    /// Stores a captured selection as a highlight.
    pub async fn capture_highlight(&self, event: CaptureEvent) -> Result<HighlightedContext> {
        let text = InputValidator::validate_capture(&event)?;

        let conversation_id = event
            .conversation_id
            .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string());
        let highlight = HighlightedContext {
            id: highlight_id(),
            conversation_id,
            highlighted_text: text,
            time_created: event.timestamp,
            color: Some(DEFAULT_HIGHLIGHT_COLOR.to_string()),
            position: Some(event.position),
            note: None,
        };
        self.highlights.save(&highlight).await?;

        let touched = self.conversations.touch(&highlight.conversation_id, Utc::now()).await?;
        debug!(
            highlight_id = %highlight.id,
            conversation_id = %highlight.conversation_id,
            page_url = %event.page_url,
            touched,
            "Highlight captured"
        );
        Ok(highlight)
    }

    /// Highlights of one conversation, or all of them newest first.
    pub async fn get_highlights(&self, conversation_id: Option<&str>) -> Result<Vec<HighlightedContext>> {
        match conversation_id {
            Some(id) => self.highlights.get_by_conversation(id).await,
            None => self.highlights.get_all().await,
        }
    }
}
