use crate::db::{Database, StoreError};
use crate::models::User;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::num::NonZeroU32;
use tracing::{info, warn};

const SCHEME: &str = "pbkdf2-sha256";
const ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Email already registered")]
    AlreadyRegistered,
    #[error("Invalid password")]
    InvalidPassword,
    #[error("Incorrect email or password")]
    InvalidCredentials,
    #[error("Random number generator failure")]
    Rng,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| AuthError::Rng)?;

    let mut hash = [0u8; HASH_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations(ITERATIONS),
        &salt,
        password.as_bytes(),
        &mut hash,
    );

    Ok(format!(
        "{}${}${}${}",
        SCHEME,
        ITERATIONS,
        STANDARD.encode(salt),
        STANDARD.encode(hash)
    ))
}

/// Checks `password` against a stored `scheme$iterations$salt$hash` string.
/// Malformed stored values never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(rounds), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    if scheme != SCHEME {
        return false;
    }
    let Some(rounds) = rounds.parse::<u32>().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (STANDARD.decode(salt), STANDARD.decode(hash)) else {
        return false;
    };

    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        rounds,
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}

fn iterations(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

pub async fn register(
    db: &Database,
    email: &str,
    password: &str,
    full_name: Option<&str>,
) -> Result<User, AuthError> {
    if password.is_empty() {
        return Err(AuthError::InvalidPassword);
    }

    if db.find_user_by_email(email).await?.is_some() {
        return Err(AuthError::AlreadyRegistered);
    }

    let hashed = hash_password(password)?;
    match db.create_user(email, &hashed, full_name).await {
        Ok(user) => {
            info!(user_id = user.id, "Registered user");
            Ok(user)
        }
        Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::UserExists)) => {
            Err(AuthError::AlreadyRegistered)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn login(db: &Database, email: &str, password: &str) -> Result<User, AuthError> {
    match db.find_user_by_email(email).await? {
        Some(user) if verify_password(password, &user.hashed_password) => Ok(user),
        _ => {
            warn!("Failed login attempt");
            Err(AuthError::InvalidCredentials)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_only_the_right_password() {
        let stored = hash_password("correct horse").unwrap();
        assert!(stored.starts_with("pbkdf2-sha256$100000$"));
        assert!(verify_password("correct horse", &stored));
        assert!(!verify_password("battery staple", &stored));
    }

    #[test]
    fn malformed_hashes_never_verify() {
        for stored in ["", "plain", "md5$1$c2FsdA==$aGFzaA==", "pbkdf2-sha256$0$c2FsdA==$aGFzaA=="] {
            assert!(!verify_password("anything", stored));
        }
    }

    #[tokio::test]
    async fn register_then_login() {
        let db = Database::in_memory().await.unwrap();
        let user = register(&db, "jane@example.com", "s3cret", Some("Jane"))
            .await
            .unwrap();
        assert_eq!(user.full_name.as_deref(), Some("Jane"));

        let logged_in = login(&db, "jane@example.com", "s3cret").await.unwrap();
        assert_eq!(logged_in.id, user.id);

        assert!(matches!(
            login(&db, "jane@example.com", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            login(&db, "nobody@example.com", "s3cret").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_empty_passwords() {
        let db = Database::in_memory().await.unwrap();
        register(&db, "jane@example.com", "pw", None).await.unwrap();

        assert!(matches!(
            register(&db, "jane@example.com", "pw2", None).await,
            Err(AuthError::AlreadyRegistered)
        ));
        assert!(matches!(
            register(&db, "joe@example.com", "", None).await,
            Err(AuthError::InvalidPassword)
        ));
    }
}
