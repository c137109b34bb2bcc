use async_imap::Session;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

type TlsStream = async_native_tls::TlsStream<Compat<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ImapError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Authentication error: {0}")]
    Authentication(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("IMAP error: {0}")]
    Protocol(String),
    #[error("No body returned for UID {0}")]
    MissingBody(u32),
}

impl ImapError {
    /// Transport and login failures end the whole session; anything else is scoped to one command.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ImapError::Connection(_) | ImapError::Authentication(_) | ImapError::Timeout(_)
        )
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(e: async_imap::error::Error) -> Self {
        match e {
            async_imap::error::Error::Io(e) => ImapError::Connection(e.to_string()),
            async_imap::error::Error::ConnectionLost => {
                ImapError::Connection("connection lost".to_string())
            }
            other => ImapError::Protocol(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ImapCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ImapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
}

/// A message as addressed by the server: its sequence number and its UID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageRef {
    pub sequence: u32,
    pub uid: u32,
}

/// An authenticated mailbox session.
#[async_trait]
pub trait MailSource: Send {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, ImapError>;

    /// Every message in the selected mailbox, ascending by sequence number.
    async fn list_messages(&mut self) -> Result<Vec<MessageRef>, ImapError>;

    async fn fetch_raw(&mut self, message: MessageRef) -> Result<Vec<u8>, ImapError>;

    async fn logout(&mut self) -> Result<(), ImapError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Source: MailSource;

    async fn connect(&self, credentials: &ImapCredentials) -> Result<Self::Source, ImapError>;
}

/// Opens implicit-TLS IMAP sessions (port 993 style) and logs in with a password.
#[derive(Debug, Clone)]
pub struct TlsConnector {
    timeout: Duration,
}

impl TlsConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn open(&self, credentials: &ImapCredentials) -> Result<ImapSession, ImapError> {
        let tcp = TcpStream::connect((credentials.host.as_str(), credentials.port))
            .await
            .map_err(|e| ImapError::Connection(e.to_string()))?;

        let tls = async_native_tls::TlsConnector::new()
            .connect(credentials.host.as_str(), tcp.compat())
            .await
            .map_err(|e| ImapError::Connection(e.to_string()))?;

        let client = async_imap::Client::new(tls);
        let session = client
            .login(&credentials.username, &credentials.password)
            .await
            .map_err(|(e, _client)| ImapError::Authentication(e.to_string()))?;

        Ok(ImapSession {
            session,
            status: None,
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Source = ImapSession;

    async fn connect(&self, credentials: &ImapCredentials) -> Result<ImapSession, ImapError> {
        info!(host = %credentials.host, port = credentials.port, "Connecting to IMAP server");
        let session = tokio::time::timeout(self.timeout, self.open(credentials))
            .await
            .map_err(|_| ImapError::Timeout(self.timeout))??;
        debug!(username = %credentials.username, "IMAP login succeeded");
        Ok(session)
    }
}

pub struct ImapSession {
    session: Session<TlsStream>,
    status: Option<MailboxStatus>,
}

#[async_trait]
impl MailSource for ImapSession {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, ImapError> {
        let selected = self.session.select(mailbox).await?;
        let status = MailboxStatus {
            exists: selected.exists,
            uid_validity: selected.uid_validity,
        };
        debug!(mailbox, exists = status.exists, uid_validity = ?status.uid_validity, "Mailbox selected");
        self.status = Some(status);
        Ok(status)
    }

    async fn list_messages(&mut self) -> Result<Vec<MessageRef>, ImapError> {
        let status = self
            .status
            .ok_or_else(|| ImapError::Protocol("no mailbox selected".to_string()))?;
        // "1:*" is an error on an empty mailbox
        if status.exists == 0 {
            return Ok(Vec::new());
        }

        let fetches: Vec<_> = self.session.fetch("1:*", "(UID)").await?.try_collect().await?;

        let mut refs: Vec<MessageRef> = fetches
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid;
                if uid.is_none() {
                    warn!(sequence = fetch.message, "Server returned no UID, skipping");
                }
                uid.map(|uid| MessageRef {
                    sequence: fetch.message,
                    uid,
                })
            })
            .collect();
        refs.sort_unstable();
        Ok(refs)
    }

    async fn fetch_raw(&mut self, message: MessageRef) -> Result<Vec<u8>, ImapError> {
        let fetches: Vec<_> = self
            .session
            .uid_fetch(message.uid.to_string(), "RFC822")
            .await?
            .try_collect()
            .await?;

        fetches
            .iter()
            .find_map(|fetch| fetch.body().map(<[u8]>::to_vec))
            .ok_or(ImapError::MissingBody(message.uid))
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        let selected = self.status.take().is_some();
        end_session(&mut self.session, selected).await
    }
}

/// The two commands that end a session.
#[async_trait]
trait SessionEnd: Send {
    async fn close_mailbox(&mut self) -> Result<(), ImapError>;
    async fn send_logout(&mut self) -> Result<(), ImapError>;
}

#[async_trait]
impl SessionEnd for Session<TlsStream> {
    async fn close_mailbox(&mut self) -> Result<(), ImapError> {
        Ok(self.close().await?)
    }

    async fn send_logout(&mut self) -> Result<(), ImapError> {
        Ok(self.logout().await?)
    }
}

/// CLOSE the selected mailbox, then LOGOUT. LOGOUT is sent even when CLOSE fails.
async fn end_session<S: SessionEnd>(session: &mut S, selected: bool) -> Result<(), ImapError> {
    if selected {
        if let Err(e) = session.close_mailbox().await {
            warn!("CLOSE failed, logging out anyway: {}", e);
        }
    }
    session.send_logout().await
}

/// Logs in and out again; used to validate account settings before saving them.
pub async fn test_connection<C: Connector>(
    connector: &C,
    credentials: &ImapCredentials,
) -> Result<(), ImapError> {
    let mut source = connector.connect(credentials).await?;
    if let Err(e) = source.logout().await {
        warn!("Logout after connection test failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_password() {
        let creds = ImapCredentials {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "me".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("imap.example.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn fatality_follows_error_kind() {
        assert!(ImapError::Connection("reset".into()).is_fatal());
        assert!(ImapError::Authentication("bad".into()).is_fatal());
        assert!(ImapError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!ImapError::Protocol("NO".into()).is_fatal());
        assert!(!ImapError::MissingBody(3).is_fatal());
    }

    #[test]
    fn message_refs_order_by_sequence() {
        let mut refs = vec![
            MessageRef { sequence: 3, uid: 30 },
            MessageRef { sequence: 1, uid: 12 },
            MessageRef { sequence: 2, uid: 20 },
        ];
        refs.sort_unstable();
        assert_eq!(refs.iter().map(|r| r.uid).collect::<Vec<_>>(), vec![12, 20, 30]);
    }

    #[derive(Default)]
    struct ScriptedEnd {
        close_fails: bool,
        commands: Vec<&'static str>,
    }

    #[async_trait]
    impl SessionEnd for ScriptedEnd {
        async fn close_mailbox(&mut self) -> Result<(), ImapError> {
            self.commands.push("CLOSE");
            if self.close_fails {
                return Err(ImapError::Protocol("NO close failed".to_string()));
            }
            Ok(())
        }

        async fn send_logout(&mut self) -> Result<(), ImapError> {
            self.commands.push("LOGOUT");
            Ok(())
        }
    }

    #[tokio::test]
    async fn logout_is_sent_even_if_close_fails() {
        let mut session = ScriptedEnd {
            close_fails: true,
            ..ScriptedEnd::default()
        };
        end_session(&mut session, true).await.unwrap();
        assert_eq!(session.commands, vec!["CLOSE", "LOGOUT"]);

        let mut unselected = ScriptedEnd::default();
        end_session(&mut unselected, false).await.unwrap();
        assert_eq!(unselected.commands, vec!["LOGOUT"]);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let connector = TlsConnector::new(Duration::from_secs(5));
        let creds = ImapCredentials {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "me".to_string(),
            password: "pw".to_string(),
        };
        let err = test_connection(&connector, &creds).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
