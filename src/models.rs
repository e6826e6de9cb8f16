//! Data models for highlights, conversations and their attachments
//!
//! Records serialize with camelCase field names; those names are the key
//! paths the schema indexes on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored record with a string primary key
pub trait Record {
    /// Primary key
    fn id(&self) -> &str;
}

macro_rules! impl_record {
    ($($ty:ty),+ $(,)?) => {
        $(impl Record for $ty {
            fn id(&self) -> &str {
                &self.id
            }
        })+
    };
}

/// Colour theme preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    /// Light UI
    Light,
    /// Dark UI
    Dark,
}

/// Per-user preferences
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Preferred theme
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
}

/// A signed-in user, keyed by the OAuth subject id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    /// OAuth subject id
    pub id: String,
    /// Email address, unique across users
    pub email: String,
    /// Display name
    pub name: String,
    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    /// Stored preferences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<UserPreferences>,
}

/// A conversation about one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Primary key
    pub id: String,
    /// Page the conversation is about
    pub page_url: String,
    /// Page title at creation
    pub page_title: String,
    /// Creation time
    pub date_created: DateTime<Utc>,
    /// Last activity
    pub last_updated: DateTime<Utc>,
    /// True once the page content has been captured
    pub has_page_context: bool,
    /// Number of messages
    pub message_count: u32,
}

impl Conversation {
    /// A fresh conversation created at `now`.
    pub fn new(id: impl Into<String>, page_url: impl Into<String>, page_title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            page_url: page_url.into(),
            page_title: page_title.into(),
            date_created: now,
            last_updated: now,
            has_page_context: false,
            message_count: 0,
        }
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human
    User,
    /// The model
    Assistant,
    /// System prompt
    System,
}

/// Marker for multimodal message content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultimodalTag {
    /// The only value
    Multimodal,
}

/// Kind of a content part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartKind {
    /// Plain text
    Text,
    /// Base64 image
    Image,
}

/// Optional details about a content part
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartMetadata {
    /// Original file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Alt text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

/// One part of a multimodal message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPart {
    /// Text or image
    #[serde(rename = "type")]
    pub kind: PartKind,
    /// Text, or base64 for images
    pub content: String,
    /// MIME type of image parts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Optional details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PartMetadata>,
}

/// Text-and-image message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultimodalContent {
    /// Always `multimodal`
    #[serde(rename = "type")]
    pub kind: MultimodalTag,
    /// Ordered parts
    pub parts: Vec<ContentPart>,
}

/// Message body: plain text or multimodal parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text
    Text(String),
    /// Text and images
    Multimodal(MultimodalContent),
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// A chat message within a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStore {
    /// Primary key
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Author
    pub role: Role,
    /// Body
    pub content: MessageContent,
    /// Creation time
    pub time_created: DateTime<Utc>,
    /// Whether page context was sent with this message
    pub used_page_context: bool,
    /// Highlights active for this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_highlight_ids: Option<Vec<String>>,
    /// Attachments sent with this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_attachment_ids: Option<Vec<String>>,
    /// Token count, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    /// Error text for failed responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageStore {
    /// A message with no context attached.
    pub fn new(
        id: impl Into<String>, conversation_id: impl Into<String>, role: Role, content: impl Into<MessageContent>,
        time_created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            time_created,
            used_page_context: false,
            used_highlight_ids: None,
            used_attachment_ids: None,
            token_count: None,
            error: None,
        }
    }
}

/// Best-effort anchor for re-finding a selection on its page. It may no
/// longer resolve once the page changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionData {
    /// DOM path of the selection start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
    /// Text preceding the selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_before: Option<String>,
    /// Text following the selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_after: Option<String>,
    /// Offset into the start node
    pub start_offset: u32,
    /// Offset into the end node
    pub end_offset: u32,
}

/// Text the user highlighted on a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightedContext {
    /// Primary key
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// The selected text
    pub highlighted_text: String,
    /// Capture time
    pub time_created: DateTime<Utc>,
    /// Marker colour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Where the text was on the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionData>,
    /// User note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl HighlightedContext {
    /// A plain highlight without colour, position or note.
    pub fn new(
        id: impl Into<String>, conversation_id: impl Into<String>, highlighted_text: impl Into<String>,
        time_created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            highlighted_text: highlighted_text.into(),
            time_created,
            color: None,
            position: None,
            note: None,
        }
    }
}

/// How page content was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMethod {
    /// The user pressed "Capture Page"
    ManualButton,
    /// Re-captured automatically
    AutoRefresh,
}

/// Which page regions were captured
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSelectors {
    /// Page header
    pub include_header: bool,
    /// Main content
    pub include_main_content: bool,
    /// Sidebar
    pub include_sidebar: bool,
    /// Footer
    pub include_footer: bool,
    /// Extra CSS selectors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_selectors: Option<Vec<String>>,
}

/// Descriptive page metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    /// Page URL
    pub url: String,
    /// Page title
    pub title: String,
    /// Meta description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Meta author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Document language
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Captured regions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<CaptureSelectors>,
}

/// Extracted page text attached to a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    /// Primary key
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Extracted text
    pub context: String,
    /// Page metadata
    pub metadata: PageMetadata,
    /// Capture time
    pub time_created: DateTime<Utc>,
    /// Capture trigger
    pub capture_method: CaptureMethod,
    /// Whether the context is sent with new messages
    pub is_active: bool,
    /// Token count, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    /// URL at capture time
    pub last_page_url: String,
    /// Content hash for change detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_version: Option<String>,
}

/// Attachment kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// Uploaded image
    Image,
    /// Page screenshot
    Screenshot,
    /// Pasted content
    Paste,
}

/// Where an attachment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentSource {
    /// File picker
    Upload,
    /// Screenshot tool
    Screenshot,
    /// Clipboard
    Paste,
    /// Drag and drop
    DragDrop,
}

/// Optional attachment details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    /// Pixel width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Pixel height
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// User caption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An image or pasted blob attached to a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultimodalAttachment {
    /// Primary key
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Message the attachment was sent with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Creation time
    pub time_created: DateTime<Utc>,
    /// Kind
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    /// Base64 payload
    pub data: String,
    /// MIME type
    pub mime_type: String,
    /// Payload size in bytes
    pub size: u64,
    /// Original file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Origin
    pub source: AttachmentSource,
    /// Small preview
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// Can be toggled off without deleting
    pub is_active: bool,
    /// Optional details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AttachmentMetadata>,
}

impl_record!(UserData, Conversation, MessageStore, HighlightedContext, PageContext, MultimodalAttachment);

/// A conversation with everything it owns, for rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationWithContext {
    /// The conversation itself
    #[serde(flatten)]
    pub conversation: Conversation,
    /// The active page capture, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_context: Option<PageContext>,
    /// Highlights, newest first
    pub highlighted_contexts: Vec<HighlightedContext>,
    /// Attachments
    pub multimodal_attachments: Vec<MultimodalAttachment>,
    /// Messages, oldest first
    pub messages: Vec<MessageStore>,
}

/// A text selection captured on a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    /// Selected text
    pub text: String,
    /// Anchor for the selection
    pub position: PositionData,
    /// Page URL
    pub page_url: String,
    /// Page title
    pub page_title: String,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Conversation to attach to; the default conversation when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Profile delivered by a completed sign-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthEvent {
    /// OAuth subject id
    pub id: String,
    /// Email address
    pub email: String,
    /// Display name
    pub name: String,
    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

impl From<AuthEvent> for UserData {
    fn from(event: AuthEvent) -> Self {
        Self {
            id: event.id,
            email: event.email,
            name: event.name,
            profile_picture: event.profile_picture,
            preferences: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_records_use_indexed_field_names() {
        let now = Utc::now();
        let message = MessageStore::new("m1", "c1", Role::User, "hello", now);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["role"], "user");
        assert!(value.get("usedHighlightIds").is_none());
    }

    #[test]
    fn test_multimodal_content_round_trip() {
        let value = json!({
            "type": "multimodal",
            "parts": [{"type": "text", "content": "look"}, {"type": "image", "content": "aGk=", "mimeType": "image/png"}]
        });
        let content: MessageContent = serde_json::from_value(value).unwrap();
        match content {
            MessageContent::Multimodal(body) => assert_eq!(body.parts.len(), 2),
            MessageContent::Text(_) => panic!("expected multimodal content"),
        }
    }

    #[test]
    fn test_attachment_enums_serialize_like_the_extension() {
        assert_eq!(serde_json::to_value(AttachmentSource::DragDrop).unwrap(), json!("drag-drop"));
        assert_eq!(serde_json::to_value(CaptureMethod::ManualButton).unwrap(), json!("manual-button"));
    }

    #[test]
    fn test_unset_message_id_is_omitted() {
        let attachment = MultimodalAttachment {
            id: "a1".to_string(),
            conversation_id: "c1".to_string(),
            message_id: None,
            time_created: Utc::now(),
            kind: AttachmentKind::Image,
            data: String::new(),
            mime_type: "image/png".to_string(),
            size: 0,
            file_name: None,
            source: AttachmentSource::Upload,
            thumbnail: None,
            is_active: true,
            metadata: None,
        };
        let value = serde_json::to_value(&attachment).unwrap();
        assert!(value.get("messageId").is_none());
        assert_eq!(value["type"], "image");
    }
}
