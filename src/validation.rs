use crate::error::{Result, StoreError};
use crate::models::{CaptureEvent, UserData};

/// Longest highlight accepted, in characters
pub const MAX_HIGHLIGHT_CHARS: usize = 100_000;

/// Longest URL accepted
pub const MAX_URL_LEN: usize = 8192;

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::Validation(message.into())
}

/// Validation utilities for records arriving from the extension
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate a record id
    pub fn validate_id(id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(invalid("Id cannot be empty"));
        }

        if id.len() > 256 {
            return Err(invalid("Id too long (max 256 characters)"));
        }

        if id.chars().any(char::is_control) {
            return Err(invalid("Id contains control characters"));
        }

        Ok(())
    }

    /// Validate email format
    pub fn validate_email(email: &str) -> Result<()> {
        if email.trim().is_empty() {
            return Err(invalid("Email cannot be empty"));
        }

        if email.len() > 254 {
            return Err(invalid("Email too long (max 254 characters)"));
        }

        let Some((local_part, domain_part)) = email.split_once('@') else {
            return Err(invalid("Email must contain @ symbol"));
        };

        if domain_part.contains('@') {
            return Err(invalid("Email must have exactly one @ symbol"));
        }

        if local_part.is_empty() || local_part.len() > 64 {
            return Err(invalid("Email local part invalid"));
        }

        if domain_part.is_empty() || !domain_part.contains('.') {
            return Err(invalid("Email domain invalid"));
        }

        Ok(())
    }

    /// Validate the URL of a captured page
    pub fn validate_page_url(url: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Err(invalid("Page URL cannot be empty"));
        }

        if url.len() > MAX_URL_LEN {
            return Err(invalid(format!("Page URL too long (max {MAX_URL_LEN} characters)")));
        }

        if !url.contains(':') {
            return Err(invalid("Page URL must include a scheme"));
        }

        Ok(())
    }

    /// Validate selected text
    pub fn validate_highlight_text(text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(invalid("Highlighted text cannot be empty"));
        }

        if text.chars().count() > MAX_HIGHLIGHT_CHARS {
            return Err(invalid(format!("Highlighted text too long (max {MAX_HIGHLIGHT_CHARS} characters)")));
        }

        Ok(())
    }

    /// Validate a capture event before it is stored. Returns the sanitized
    /// text, which is what gets checked and saved.
    pub fn validate_capture(event: &CaptureEvent) -> Result<String> {
        let text = Self::sanitize_text(&event.text);
        Self::validate_highlight_text(&text)?;
        Self::validate_page_url(&event.page_url)?;
        if let Some(conversation_id) = &event.conversation_id {
            Self::validate_id(conversation_id)?;
        }
        Ok(text)
    }

    /// Validate a user profile
    pub fn validate_user(user: &UserData) -> Result<()> {
        Self::validate_id(&user.id)?;
        Self::validate_email(&user.email)?;
        if user.name.len() > 256 {
            return Err(invalid("Name too long (max 256 characters)"));
        }
        Ok(())
    }

    /// Sanitize text input
    #[must_use]
    pub fn sanitize_text(text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
            .collect::<String>()
            .trim()
            .to_string()
    }
}
