mod ai;
mod auth;
mod config;
mod crypto;
mod db;
mod imap;
mod message;
mod models;
mod sync;

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::crypto::CredentialCipher;
use crate::db::{Database, StoreError};
use crate::imap::{ImapCredentials, TlsConnector};
use crate::models::{EmailQuery, NewAccount, User};
use crate::sync::SyncOptions;
use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailsync", version, about = "Cache IMAP mailboxes in a local database")]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a user
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "MAILSYNC_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Check a user's credentials
    Login(UserArgs),
    /// Manage mailbox accounts
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    /// Pull recent messages from the user's IMAP accounts
    Sync {
        #[command(flatten)]
        user: UserArgs,
        /// Only this account
        #[arg(long)]
        account: Option<i64>,
        /// Messages per account (overrides settings)
        #[arg(long)]
        limit: Option<usize>,
        /// Resume from the last seen UID
        #[arg(long)]
        incremental: bool,
    },
    /// Read and update cached emails
    Emails {
        #[command(subcommand)]
        command: EmailCommand,
    },
    /// Assistant helpers
    Ai {
        #[command(subcommand)]
        command: AiCommand,
    },
    /// Print a fresh base64 master key
    Keygen,
}

#[derive(Args)]
struct UserArgs {
    #[arg(long = "user")]
    email: String,
    #[arg(long, env = "MAILSYNC_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Subcommand)]
enum AccountCommand {
    Add {
        #[command(flatten)]
        user: UserArgs,
        /// Address of the mailbox
        #[arg(long)]
        address: String,
        #[arg(long)]
        imap_server: String,
        #[arg(long, default_value_t = 993)]
        imap_port: u16,
        /// Defaults to the mailbox address
        #[arg(long)]
        imap_username: Option<String>,
        #[arg(long, env = "MAILSYNC_IMAP_PASSWORD", hide_env_values = true)]
        imap_password: String,
        #[arg(long)]
        smtp_server: Option<String>,
        #[arg(long)]
        smtp_port: Option<u16>,
        /// Comma-separated sender domains to keep
        #[arg(long)]
        domain_filter: Option<String>,
        /// Log in once before saving
        #[arg(long)]
        verify: bool,
    },
    List(UserArgs),
    Remove {
        #[command(flatten)]
        user: UserArgs,
        id: i64,
    },
    /// Log in to a saved account and out again
    Test {
        #[command(flatten)]
        user: UserArgs,
        id: i64,
    },
}

#[derive(Subcommand)]
enum EmailCommand {
    List {
        #[command(flatten)]
        user: UserArgs,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        archived: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    Show(EmailTarget),
    /// Look up by Message-ID header, angle brackets included
    Find {
        #[command(flatten)]
        user: UserArgs,
        message_id: String,
    },
    Star(EmailTarget),
    Unstar(EmailTarget),
    Read(EmailTarget),
    Unread(EmailTarget),
    Archive(EmailTarget),
    Delete(EmailTarget),
}

#[derive(Args)]
struct EmailTarget {
    #[command(flatten)]
    user: UserArgs,
    id: i64,
}

#[derive(Subcommand)]
enum AiCommand {
    /// Suggested replies to a cached email
    Replies(EmailTarget),
    /// Draft an email from a prompt
    Compose {
        #[command(flatten)]
        user: UserArgs,
        #[arg(long)]
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Config::load(&cli.config);
    debug!(config = %cli.config.display(), "Settings loaded");

    if let Command::Keygen = cli.command {
        return print_json(&json!({ "encryption_key": crypto::generate_key()? }));
    }

    let db = Database::new(&config.database.url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;
    db.run_migrations().await?;

    let app = App { config, db };
    match cli.command {
        Command::Register {
            email,
            password,
            name,
        } => {
            let user = auth::register(&app.db, &email, &password, name.as_deref()).await?;
            print_json(&user)
        }
        Command::Login(user) => {
            let user = app.authenticate(&user).await?;
            let cached_emails = app.db.count_emails(user.id).await?;
            print_json(&json!({ "user": user, "cached_emails": cached_emails }))
        }
        Command::Account { command } => app.account(command).await,
        Command::Sync {
            user,
            account,
            limit,
            incremental,
        } => app.sync(&user, account, limit, incremental).await,
        Command::Emails { command } => app.emails(command).await,
        Command::Ai { command } => app.ai(command).await,
        Command::Keygen => Ok(()),
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("mailsync=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct App {
    config: Config,
    db: Database,
}

impl App {
    async fn authenticate(&self, args: &UserArgs) -> anyhow::Result<User> {
        Ok(auth::login(&self.db, &args.email, &args.password).await?)
    }

    fn cipher(&self) -> anyhow::Result<CredentialCipher> {
        crypto::resolve_master_key(self.config.security.encryption_key.as_deref())
            .context("Failed to load the master key")
    }

    fn connector(&self) -> TlsConnector {
        TlsConnector::new(Duration::from_secs(self.config.sync.connect_timeout_secs))
    }

    async fn account(&self, command: AccountCommand) -> anyhow::Result<()> {
        match command {
            AccountCommand::Add {
                user,
                address,
                imap_server,
                imap_port,
                imap_username,
                imap_password,
                smtp_server,
                smtp_port,
                domain_filter,
                verify,
            } => {
                let user = self.authenticate(&user).await?;
                let imap_username = imap_username.unwrap_or_else(|| address.clone());

                if verify {
                    let credentials = ImapCredentials {
                        host: imap_server.clone(),
                        port: imap_port,
                        username: imap_username.clone(),
                        password: imap_password.clone(),
                    };
                    imap::test_connection(&self.connector(), &credentials).await?;
                }

                let cipher = self.cipher()?;
                // SMTP shares the IMAP password
                let smtp_password_encrypted = match smtp_server {
                    Some(_) => Some(cipher.encrypt(&imap_password)?),
                    None => None,
                };
                let new_account = NewAccount {
                    user_id: user.id,
                    email_address: address,
                    imap_server,
                    imap_port,
                    imap_username,
                    imap_password_encrypted: cipher.encrypt(&imap_password)?,
                    smtp_server,
                    smtp_port,
                    smtp_password_encrypted,
                    domain_filter,
                };

                match self.db.add_account(&new_account).await {
                    Ok(account) => {
                        info!(account_id = account.id, "Account added");
                        print_json(&account)
                    }
                    Err(e) if matches!(
                        e.downcast_ref::<StoreError>(),
                        Some(StoreError::AccountExists)
                    ) =>
                    {
                        bail!("Account {} already exists", new_account.email_address)
                    }
                    Err(e) => Err(e),
                }
            }
            AccountCommand::List(user) => {
                let user = self.authenticate(&user).await?;
                print_json(&self.db.list_accounts(user.id).await?)
            }
            AccountCommand::Remove { user, id } => {
                let user = self.authenticate(&user).await?;
                if !self.db.delete_account(user.id, id).await? {
                    bail!("Account {} not found", id);
                }
                print_json(&json!({ "id": id, "deleted": true }))
            }
            AccountCommand::Test { user, id } => {
                let user = self.authenticate(&user).await?;
                let account = self
                    .db
                    .get_account(id)
                    .await?
                    .filter(|a| a.user_id == user.id)
                    .with_context(|| format!("Account {} not found", id))?;
                let credentials = sync::credentials_for(&account, &self.cipher()?)?;
                imap::test_connection(&self.connector(), &credentials).await?;
                print_json(&json!({
                    "id": id,
                    "status": "success",
                    "smtp_configured": account.has_smtp()
                }))
            }
        }
    }

    async fn sync(
        &self,
        user: &UserArgs,
        account: Option<i64>,
        limit: Option<usize>,
        incremental: bool,
    ) -> anyhow::Result<()> {
        let user = self.authenticate(user).await?;
        let cipher = self.cipher()?;
        let connector = self.connector();

        let mut options = SyncOptions::from_config(&self.config.sync);
        if let Some(limit) = limit {
            options.fetch_limit = limit;
        }
        options.incremental |= incremental;

        match account {
            Some(id) => {
                let owned = self
                    .db
                    .get_account(id)
                    .await?
                    .is_some_and(|a| a.user_id == user.id);
                if !owned {
                    bail!("Account {} not found", id);
                }
                let report = sync::sync_account(&self.db, &cipher, &connector, id, &options).await?;
                print_json(&report)
            }
            None => {
                let outcomes =
                    sync::sync_user(&self.db, &cipher, &connector, user.id, &options).await?;
                print_json(&outcomes)
            }
        }
    }

    async fn emails(&self, command: EmailCommand) -> anyhow::Result<()> {
        let (target, change) = match command {
            EmailCommand::List {
                user,
                category,
                search,
                archived,
                limit,
            } => {
                let user = self.authenticate(&user).await?;
                let query = EmailQuery {
                    category,
                    search,
                    include_archived: archived,
                    limit,
                };
                let emails = self.db.list_emails(user.id, &query).await?;
                return print_json(&db::summarize(&emails));
            }
            EmailCommand::Show(target) => {
                let user = self.authenticate(&target.user).await?;
                let email = self
                    .db
                    .get_email(user.id, target.id)
                    .await?
                    .with_context(|| format!("Email {} not found", target.id))?;
                return print_json(&email);
            }
            EmailCommand::Find { user, message_id } => {
                let user = self.authenticate(&user).await?;
                let email = self
                    .db
                    .find_email_by_message_id(user.id, &message_id)
                    .await?
                    .with_context(|| format!("No email with Message-ID {}", message_id))?;
                return print_json(&email);
            }
            EmailCommand::Star(target) => (target, Change::Starred(true)),
            EmailCommand::Unstar(target) => (target, Change::Starred(false)),
            EmailCommand::Read(target) => (target, Change::Read(true)),
            EmailCommand::Unread(target) => (target, Change::Read(false)),
            EmailCommand::Archive(target) => (target, Change::Archived(true)),
            EmailCommand::Delete(target) => (target, Change::Deleted),
        };

        let user = self.authenticate(&target.user).await?;
        let (id, db) = (target.id, &self.db);
        let (changed, message) = match change {
            Change::Starred(on) => (db.set_starred(user.id, id, on).await?, "Email updated"),
            Change::Read(on) => (db.set_read(user.id, id, on).await?, "Email updated"),
            Change::Archived(on) => (db.set_archived(user.id, id, on).await?, "Email archived"),
            Change::Deleted => (db.delete_email(user.id, id).await?, "Email deleted"),
        };
        if !changed {
            bail!("Email {} not found", target.id);
        }
        print_json(&json!({ "id": target.id, "message": message }))
    }

    async fn ai(&self, command: AiCommand) -> anyhow::Result<()> {
        match command {
            AiCommand::Replies(target) => {
                let user = self.authenticate(&target.user).await?;
                let email = self
                    .db
                    .get_email(user.id, target.id)
                    .await?
                    .with_context(|| format!("Email {} not found", target.id))?;
                print_json(&json!({ "replies": ai::quick_replies(&email) }))
            }
            AiCommand::Compose { user, prompt } => {
                let user = self.authenticate(&user).await?;
                let signature = user.full_name.as_deref().unwrap_or(&user.email);
                print_json(&ai::compose(&prompt, signature))
            }
        }
    }
}

enum Change {
    Starred(bool),
    Read(bool),
    Archived(bool),
    Deleted,
}
