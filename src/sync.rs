//! Mailbox ingestion: pull the newest messages of an IMAP account into the local cache.
//!
//! One run opens one session, walks the selected messages serially and closes the
//! session again. Failures on a single message are logged and counted; transport and
//! login failures end the run. Duplicates are detected by the storage layer's
//! `(user, message id)` uniqueness, so concurrent runs on one account cannot
//! double-insert.

use crate::config::SyncConfig;
use crate::crypto::{CredentialCipher, CryptoError};
use crate::db::Database;
use crate::imap::{Connector, ImapCredentials, ImapError, MailSource, MessageRef};
use crate::message::{self, DomainFilter, NormalizeError};
use crate::models::{Account, NewEmail};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Per-message events go to INFO when `log_messages` is set, DEBUG otherwise.
macro_rules! message_event {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub fetch_limit: usize,
    pub body_limit: usize,
    pub mailbox: String,
    pub default_category: String,
    pub incremental: bool,
    pub log_messages: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            fetch_limit: config.fetch_limit,
            body_limit: config.body_limit,
            mailbox: config.mailbox.clone(),
            default_category: config.default_category.clone(),
            incremental: config.incremental,
            log_messages: config.log_messages,
        }
    }
}

/// Counts for one run. `skipped` is `filtered + duplicates`;
/// `synced + skipped + failed == total_processed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub skipped: usize,
    pub filtered: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub total_processed: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Synced => self.synced += 1,
            Outcome::Filtered => {
                self.filtered += 1;
                self.skipped += 1;
            }
            Outcome::Duplicate => {
                self.duplicates += 1;
                self.skipped += 1;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Account {0} not found")]
    AccountNotFound(i64),
    #[error("Account {0} is not an IMAP account")]
    NotImap(i64),
    #[error("Account {account_id} has invalid IMAP port {port}")]
    InvalidPort { account_id: i64, port: i64 },
    #[error("Could not decrypt mailbox password: {0}")]
    Credential(#[from] CryptoError),
    #[error(transparent)]
    Imap(#[from] ImapError),
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug)]
enum Outcome {
    Synced,
    Filtered,
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
enum MessageError {
    #[error(transparent)]
    Imap(#[from] ImapError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("store write failed: {0}")]
    Store(#[from] anyhow::Error),
}

impl MessageError {
    /// Whether a later run may succeed on the same message. Unparseable input never will.
    fn is_retryable(&self) -> bool {
        !matches!(self, MessageError::Normalize(_))
    }
}

/// Result of syncing one account as part of [`sync_user`].
#[derive(Debug, Serialize)]
pub struct AccountSyncOutcome {
    pub account_id: i64,
    pub email_address: String,
    #[serde(flatten)]
    pub report: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn credentials_for(
    account: &Account,
    cipher: &CredentialCipher,
) -> Result<ImapCredentials, SyncError> {
    let port = u16::try_from(account.imap_port).map_err(|_| SyncError::InvalidPort {
        account_id: account.id,
        port: account.imap_port,
    })?;
    Ok(ImapCredentials {
        host: account.imap_server.clone(),
        port,
        username: account.imap_username.clone(),
        password: cipher.decrypt(&account.imap_password_encrypted)?,
    })
}

pub async fn sync_account<C: Connector>(
    db: &Database,
    cipher: &CredentialCipher,
    connector: &C,
    account_id: i64,
    options: &SyncOptions,
) -> Result<SyncReport, SyncError> {
    let account = db
        .get_account(account_id)
        .await?
        .ok_or(SyncError::AccountNotFound(account_id))?;
    if !account.is_imap() {
        return Err(SyncError::NotImap(account_id));
    }

    let credentials = credentials_for(&account, cipher)?;
    let mut source = connector.connect(&credentials).await?;

    let result = ingest(db, &account, &mut source, options).await;

    if let Err(e) = source.logout().await {
        warn!(account_id, "Logout failed: {}", e);
    }

    let (report, checkpoint) = result?;
    db.record_sync_state(account.id, checkpoint.uid_validity, checkpoint.last_seen_uid)
        .await?;

    info!(
        account_id,
        synced = report.synced,
        skipped = report.skipped,
        failed = report.failed,
        total_processed = report.total_processed,
        "Sync complete"
    );
    Ok(report)
}

/// Syncs every IMAP account of a user. A failing account is reported and the rest still run.
pub async fn sync_user<C: Connector>(
    db: &Database,
    cipher: &CredentialCipher,
    connector: &C,
    user_id: i64,
    options: &SyncOptions,
) -> Result<Vec<AccountSyncOutcome>, SyncError> {
    let accounts = db.list_accounts(user_id).await?;
    let mut outcomes = Vec::with_capacity(accounts.len());

    for account in accounts.iter().filter(|a| a.is_imap()) {
        let outcome = match sync_account(db, cipher, connector, account.id, options).await {
            Ok(report) => AccountSyncOutcome {
                account_id: account.id,
                email_address: account.email_address.clone(),
                report: Some(report),
                error: None,
            },
            Err(e) => {
                error!(account_id = account.id, "Sync failed: {}", e);
                AccountSyncOutcome {
                    account_id: account.id,
                    email_address: account.email_address.clone(),
                    report: None,
                    error: Some(e.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    uid_validity: Option<u32>,
    last_seen_uid: u32,
}

async fn ingest<S: MailSource>(
    db: &Database,
    account: &Account,
    source: &mut S,
    options: &SyncOptions,
) -> Result<(SyncReport, Checkpoint), SyncError> {
    let status = source.select(&options.mailbox).await?;
    let messages = source.list_messages().await?;

    // A stored mark is only meaningful while UIDVALIDITY is unchanged.
    let stored_mark = match (account.uid_validity, status.uid_validity) {
        (Some(stored), Some(current)) if stored == i64::from(current) => {
            u32::try_from(account.last_seen_uid).ok().filter(|uid| *uid > 0)
        }
        _ => None,
    };
    let resume_after = stored_mark.filter(|_| options.incremental);

    let selected = select_messages(&messages, resume_after, options.fetch_limit);
    info!(
        account_id = account.id,
        listed = messages.len(),
        selected = selected.len(),
        incremental = resume_after.is_some(),
        "Found messages to process"
    );

    let filter = DomainFilter::parse(account.domain_filter.as_deref());
    let mut report = SyncReport {
        total_processed: selected.len(),
        ..SyncReport::default()
    };

    // first retryable failure; the mark must stay below it
    let mut first_retry: Option<u32> = None;

    for message in &selected {
        match ingest_one(db, account, source, *message, &filter, options).await {
            Ok(outcome) => report.record(&outcome),
            Err(MessageError::Imap(e)) if e.is_fatal() => {
                error!(account_id = account.id, uid = message.uid, "Aborting sync: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                warn!(
                    account_id = account.id,
                    sequence = message.sequence,
                    uid = message.uid,
                    "Failed to process message: {}",
                    e
                );
                report.failed += 1;
                if e.is_retryable() {
                    first_retry.get_or_insert(message.uid);
                }
            }
        }
    }

    let mut last_seen_uid = selected.iter().map(|m| m.uid).max().unwrap_or(0);
    if let Some(uid) = first_retry {
        last_seen_uid = last_seen_uid.min(uid.saturating_sub(1));
    }
    let checkpoint = Checkpoint {
        uid_validity: status.uid_validity,
        last_seen_uid: last_seen_uid.max(stored_mark.unwrap_or(0)),
    };
    Ok((report, checkpoint))
}

/// Without a resume point: the last `limit` messages. With one: the oldest `limit`
/// messages above it, so a backlog drains over successive runs.
fn select_messages(
    messages: &[MessageRef],
    resume_after: Option<u32>,
    limit: usize,
) -> Vec<MessageRef> {
    match resume_after {
        Some(last_seen) => messages
            .iter()
            .filter(|m| m.uid > last_seen)
            .take(limit)
            .copied()
            .collect(),
        None => messages[messages.len().saturating_sub(limit)..].to_vec(),
    }
}

async fn ingest_one<S: MailSource>(
    db: &Database,
    account: &Account,
    source: &mut S,
    message: MessageRef,
    filter: &DomainFilter,
    options: &SyncOptions,
) -> Result<Outcome, MessageError> {
    let raw = source.fetch_raw(message).await?;
    let parsed = message::normalize(&raw, message.sequence, options.body_limit)?;

    if parsed.date_fallback {
        debug!(message_id = %parsed.message_id, "Unreadable Date header, using current time");
    }

    if filter.is_active() {
        let domain = parsed.sender_domain();
        if !filter.allows(&domain) {
            message_event!(options.log_messages, domain = %domain, "[SKIP] Domain not in allow-list");
            return Ok(Outcome::Filtered);
        }
    }

    let email = NewEmail {
        user_id: account.user_id,
        account_id: account.id,
        message_id: parsed.message_id,
        from_address: parsed.from_address,
        from_name: parsed.from_name,
        subject: parsed.subject,
        body_text: parsed.body_text,
        received_at: parsed.received_at,
        ai_category: options.default_category.clone(),
    };

    let subject_preview = message::truncate_chars(&email.subject, 50);
    if db.insert_email_if_absent(&email).await? {
        message_event!(options.log_messages, subject = %subject_preview, "[SYNCED]");
        Ok(Outcome::Synced)
    } else {
        message_event!(options.log_messages, subject = %subject_preview, "[EXISTS]");
        Ok(Outcome::Duplicate)
    }
}
