use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Characters of body text shown in list views.
pub const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub full_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub user_id: i64,
    pub email_address: String,
    pub account_type: String, // 'imap' is the only type that syncs
    pub imap_server: String,
    pub imap_port: i64,
    pub imap_username: String,
    #[serde(skip_serializing)]
    pub imap_password_encrypted: String,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<i64>,
    pub smtp_username: Option<String>,
    #[serde(skip_serializing)]
    pub smtp_password_encrypted: Option<String>,
    /// Comma-separated sender domains to import from, e.g. "example.com,company.com"
    pub domain_filter: Option<String>,
    pub uid_validity: Option<i64>,
    pub last_seen_uid: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn is_imap(&self) -> bool {
        self.account_type.eq_ignore_ascii_case("imap")
    }

    /// An outgoing server with stored credentials.
    pub fn has_smtp(&self) -> bool {
        self.smtp_server.is_some() && self.smtp_password_encrypted.is_some()
    }
}

/// Account fields as supplied by the user; passwords are already encrypted.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user_id: i64,
    pub email_address: String,
    pub imap_server: String,
    pub imap_port: u16,
    pub imap_username: String,
    pub imap_password_encrypted: String,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_password_encrypted: Option<String>,
    pub domain_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailRecord {
    pub id: i64,
    pub user_id: i64,
    pub account_id: Option<i64>,
    pub message_id: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_address: Option<String>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub ai_summary: Option<String>,
    pub ai_category: Option<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_archived: bool,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A freshly ingested message, before it has a row id.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub user_id: i64,
    pub account_id: i64,
    pub message_id: String,
    pub from_address: String,
    pub from_name: String,
    pub subject: String,
    pub body_text: String,
    pub received_at: DateTime<Utc>,
    pub ai_category: String,
}

/// List-view projection of an [`EmailRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct EmailSummary {
    pub id: i64,
    pub message_id: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub subject: String,
    pub ai_summary: Option<String>,
    pub ai_category: Option<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub received_at: DateTime<Utc>,
    pub preview: String,
}

impl From<&EmailRecord> for EmailSummary {
    fn from(email: &EmailRecord) -> Self {
        let preview = email
            .body_text
            .as_deref()
            .map(|body| body.chars().take(PREVIEW_CHARS).collect())
            .unwrap_or_default();

        Self {
            id: email.id,
            message_id: email.message_id.clone(),
            from_address: email.from_address.clone(),
            from_name: email.from_name.clone(),
            subject: email.subject.clone(),
            ai_summary: email.ai_summary.clone(),
            ai_category: email.ai_category.clone(),
            is_read: email.is_read,
            is_starred: email.is_starred,
            received_at: email.received_at,
            preview,
        }
    }
}

/// Filters for listing cached emails.
#[derive(Debug, Clone)]
pub struct EmailQuery {
    pub category: Option<String>,
    pub search: Option<String>,
    pub include_archived: bool,
    pub limit: i64,
}

impl Default for EmailQuery {
    fn default() -> Self {
        Self {
            category: None,
            search: None,
            include_archived: false,
            limit: 50,
        }
    }
}
