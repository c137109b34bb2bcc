use crate::models::{self, Account, EmailQuery, EmailRecord, NewAccount, NewEmail, User};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use tracing::debug;

const EMAIL_COLUMNS: &str = "id, user_id, account_id, message_id, from_address, from_name, to_address, subject, \
     body_text, body_html, ai_summary, ai_category, is_read, is_starred, is_archived, \
     received_at, created_at, updated_at";

const ACCOUNT_COLUMNS: &str = "id, user_id, email_address, account_type, imap_server, imap_port, imap_username, \
     imap_password_encrypted, smtp_server, smtp_port, smtp_username, smtp_password_encrypted, \
     domain_filter, uid_validity, last_seen_uid, last_synced_at, created_at, updated_at";

/// Constraint violations callers are expected to handle.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Email already registered")]
    UserExists,
    #[error("Account already exists")]
    AccountExists,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url {}", database_url))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection keeps every query on the same store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        email: &str,
        hashed_password: &str,
        full_name: Option<&str>,
    ) -> Result<User> {
        let result = sqlx::query(
            "INSERT INTO users (email, hashed_password, full_name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(email)
        .bind(hashed_password)
        .bind(full_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::UserExists.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.get_user(id)
            .await?
            .context("User vanished right after insert")
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, hashed_password, full_name, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, hashed_password, full_name, created_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn add_account(&self, account: &NewAccount) -> Result<Account> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO email_accounts (user_id, email_address, account_type, imap_server, imap_port,
             imap_username, imap_password_encrypted, smtp_server, smtp_port, smtp_username,
             smtp_password_encrypted, domain_filter, created_at, updated_at)
             VALUES (?, ?, 'imap', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account.user_id)
        .bind(&account.email_address)
        .bind(&account.imap_server)
        .bind(i64::from(account.imap_port))
        .bind(&account.imap_username)
        .bind(&account.imap_password_encrypted)
        .bind(&account.smtp_server)
        .bind(account.smtp_port.map(i64::from))
        .bind(account.smtp_server.as_ref().map(|_| &account.email_address))
        .bind(&account.smtp_password_encrypted)
        .bind(&account.domain_filter)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::AccountExists.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.get_account(id)
            .await?
            .context("Account vanished right after insert")
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let sql = format!("SELECT {} FROM email_accounts WHERE id = ?", ACCOUNT_COLUMNS);
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    pub async fn list_accounts(&self, user_id: i64) -> Result<Vec<Account>> {
        let sql = format!(
            "SELECT {} FROM email_accounts WHERE user_id = ? ORDER BY id ASC",
            ACCOUNT_COLUMNS
        );
        let accounts = sqlx::query_as::<_, Account>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(accounts)
    }

    pub async fn delete_account(&self, user_id: i64, account_id: i64) -> Result<bool> {
        let done = sqlx::query("DELETE FROM email_accounts WHERE id = ? AND user_id = ?")
            .bind(account_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Stores the high-water mark reached by a successful sync run.
    pub async fn record_sync_state(
        &self,
        account_id: i64,
        uid_validity: Option<u32>,
        last_seen_uid: u32,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE email_accounts SET uid_validity = ?, last_seen_uid = ?, last_synced_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(uid_validity.map(i64::from))
        .bind(i64::from(last_seen_uid))
        .bind(now)
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts unless (user, message id) is already stored. Returns whether a row was written.
    pub async fn insert_email_if_absent(&self, email: &NewEmail) -> Result<bool> {
        let now = Utc::now();
        let done = sqlx::query(
            "INSERT INTO emails (user_id, account_id, message_id, from_address, from_name, to_address,
             subject, body_text, body_html, ai_category, is_read, is_starred, is_archived,
             received_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, '', ?, ?, '', ?, 0, 0, 0, ?, ?, ?)
             ON CONFLICT(user_id, message_id) DO NOTHING",
        )
        .bind(email.user_id)
        .bind(email.account_id)
        .bind(&email.message_id)
        .bind(&email.from_address)
        .bind(&email.from_name)
        .bind(&email.subject)
        .bind(&email.body_text)
        .bind(&email.ai_category)
        .bind(email.received_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let inserted = done.rows_affected() == 1;
        if !inserted {
            debug!(message_id = %email.message_id, "Email already stored");
        }
        Ok(inserted)
    }

    pub async fn list_emails(&self, user_id: i64, query: &EmailQuery) -> Result<Vec<EmailRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM emails WHERE user_id = ", EMAIL_COLUMNS));
        builder.push_bind(user_id);

        if !query.include_archived {
            builder.push(" AND is_archived = 0");
        }
        if let Some(category) = &query.category {
            builder.push(" AND ai_category = ").push_bind(category.clone());
        }
        if let Some(search) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
            // LIKE is case-insensitive for ASCII in SQLite
            let pattern = format!("%{}%", search.trim());
            builder
                .push(" AND (subject LIKE ")
                .push_bind(pattern.clone())
                .push(" OR from_address LIKE ")
                .push_bind(pattern.clone())
                .push(" OR body_text LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        builder
            .push(" ORDER BY received_at DESC, id DESC LIMIT ")
            .push_bind(query.limit);

        let emails = builder
            .build_query_as::<EmailRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(emails)
    }

    pub async fn get_email(&self, user_id: i64, id: i64) -> Result<Option<EmailRecord>> {
        let sql = format!("SELECT {} FROM emails WHERE id = ? AND user_id = ?", EMAIL_COLUMNS);
        let email = sqlx::query_as::<_, EmailRecord>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(email)
    }

    pub async fn find_email_by_message_id(
        &self,
        user_id: i64,
        message_id: &str,
    ) -> Result<Option<EmailRecord>> {
        let sql = format!(
            "SELECT {} FROM emails WHERE user_id = ? AND message_id = ?",
            EMAIL_COLUMNS
        );
        let email = sqlx::query_as::<_, EmailRecord>(&sql)
            .bind(user_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(email)
    }

    pub async fn set_starred(&self, user_id: i64, id: i64, starred: bool) -> Result<bool> {
        self.set_flag(user_id, id, EmailFlag::Starred, starred).await
    }

    pub async fn set_read(&self, user_id: i64, id: i64, read: bool) -> Result<bool> {
        self.set_flag(user_id, id, EmailFlag::Read, read).await
    }

    pub async fn set_archived(&self, user_id: i64, id: i64, archived: bool) -> Result<bool> {
        self.set_flag(user_id, id, EmailFlag::Archived, archived).await
    }

    async fn set_flag(&self, user_id: i64, id: i64, flag: EmailFlag, value: bool) -> Result<bool> {
        let sql = format!(
            "UPDATE emails SET {} = ?, updated_at = ? WHERE id = ? AND user_id = ?",
            flag.column()
        );
        let done = sqlx::query(&sql)
            .bind(value)
            .bind(Utc::now())
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn delete_email(&self, user_id: i64, id: i64) -> Result<bool> {
        let done = sqlx::query("DELETE FROM emails WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn count_emails(&self, user_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM emails WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }
}

#[derive(Debug, Clone, Copy)]
enum EmailFlag {
    Read,
    Starred,
    Archived,
}

impl EmailFlag {
    fn column(self) -> &'static str {
        match self {
            EmailFlag::Read => "is_read",
            EmailFlag::Starred => "is_starred",
            EmailFlag::Archived => "is_archived",
        }
    }
}

/// Convenience for summaries in CLI output.
pub fn summarize(emails: &[EmailRecord]) -> Vec<models::EmailSummary> {
    emails.iter().map(models::EmailSummary::from).collect()
}
