#![forbid(unsafe_code)]

//! Accounts and bearer tokens.
//!
//! Passwords are stored as argon2 PHC strings. Tokens are
//! `base64url(claims).base64url(mac)` where the MAC is a keyed blake3 hash of
//! the encoded claims, keyed by a value derived from the configured secret.

use std::time::Duration;

use argon2::Argon2;
use argon2::password_hash::{
    Error as PasswordHashError, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::library::{Library, LibraryError, UserRecord};

const KEY_CONTEXT: &str = "meme-audio 2024 bearer token v1";
const MIN_PASSWORD_CHARS: usize = 8;
const BAD_CREDENTIALS: &str = "invalid email or password";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("password hashing failed: {0}")]
    Hashing(String),
    #[error(transparent)]
    Library(#[from] LibraryError),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Hashing(_) => ErrorKind::Internal,
            Self::Library(err) => err.kind(),
        }
    }
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| AuthError::Hashing(err.to_string()))?;
    Ok(hash.to_string())
}

pub fn verify_password(stored_hash: &str, candidate: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|err| AuthError::Hashing(format!("invalid stored hash: {err}")))?;
    match Argon2::default().verify_password(candidate.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(PasswordHashError::Password) => Ok(false),
        Err(err) => Err(AuthError::Hashing(err.to_string())),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    exp: i64,
}

/// Issues and checks bearer tokens.
#[derive(Clone)]
pub struct TokenSigner {
    key: [u8; 32],
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, user_id: i64) -> String {
        self.issue_at(user_id, Utc::now().timestamp())
    }

    fn issue_at(&self, user_id: i64, now: i64) -> String {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: user_id,
            exp: now.saturating_add(ttl),
        };
        // Serializing two integers cannot fail.
        let json = serde_json::to_vec(&claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mac = blake3::keyed_hash(&self.key, payload.as_bytes());
        format!("{payload}.{}", URL_SAFE_NO_PAD.encode(mac.as_bytes()))
    }

    /// Returns the user id the token was issued for.
    pub fn verify(&self, token: &str) -> Result<i64, AuthError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    fn verify_at(&self, token: &str, now: i64) -> Result<i64, AuthError> {
        const INVALID: AuthError = AuthError::Unauthorized("invalid token");

        let (payload, signature) = token.trim().split_once('.').ok_or(INVALID)?;
        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| INVALID)?;
        let signature: [u8; 32] = signature.try_into().map_err(|_| INVALID)?;
        let expected = blake3::keyed_hash(&self.key, payload.as_bytes());
        // `Hash` equality is constant time.
        if expected != blake3::Hash::from(signature) {
            return Err(INVALID);
        }

        let json = URL_SAFE_NO_PAD.decode(payload).map_err(|_| INVALID)?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| INVALID)?;
        if claims.exp <= now {
            return Err(AuthError::Unauthorized("token expired"));
        }
        Ok(claims.sub)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignupRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// The part of an account that is safe to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicUser {
    pub id: i64,
    pub username: String,
}

impl From<&UserRecord> for PublicUser {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: PublicUser,
}

/// Signup, login and bearer-token resolution on top of the library.
#[derive(Clone)]
pub struct Accounts {
    library: Library,
    signer: TokenSigner,
}

impl Accounts {
    pub fn new(library: Library, signer: TokenSigner) -> Self {
        Self { library, signer }
    }

    pub async fn signup(&self, request: SignupRequest) -> Result<PublicUser, AuthError> {
        let username = request.username.trim();
        let email = request.email.trim();
        if username.is_empty() {
            return Err(AuthError::InvalidInput("username is required".into()));
        }
        if !is_plausible_email(email) {
            return Err(AuthError::InvalidInput("a valid email is required".into()));
        }
        if request.password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(AuthError::InvalidInput(format!(
                "password must be at least {MIN_PASSWORD_CHARS} characters"
            )));
        }

        let password = request.password;
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|err| AuthError::Hashing(err.to_string()))??;
        let user = self.library.create_user(username, email, &hash).await?;
        info!(user_id = user.id, "account created");
        Ok(PublicUser::from(&user))
    }

    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse, AuthError> {
        let Some(user) = self.library.find_user_by_email(&request.email).await? else {
            return Err(AuthError::Unauthorized(BAD_CREDENTIALS));
        };

        let stored = user.password_hash.clone();
        let password = request.password;
        let matches = tokio::task::spawn_blocking(move || verify_password(&stored, &password))
            .await
            .map_err(|err| AuthError::Hashing(err.to_string()))??;
        if !matches {
            warn!(user_id = user.id, "rejected login");
            return Err(AuthError::Unauthorized(BAD_CREDENTIALS));
        }

        Ok(LoginResponse {
            token: self.signer.issue(user.id),
            user: PublicUser::from(&user),
        })
    }

    /// Resolves a bearer token to a live account.
    pub async fn authenticate(&self, token: &str) -> Result<UserRecord, AuthError> {
        let user_id = self.signer.verify(token)?;
        self.library
            .find_user_by_id(user_id)
            .await?
            .ok_or(AuthError::Unauthorized("account no longer exists"))
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::{TempDir, tempdir};

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret", Duration::from_secs(3600))
    }

    async fn accounts() -> Result<(TempDir, Accounts)> {
        let dir = tempdir()?;
        let library = Library::open(&dir.path().join("library.db")).await?;
        Ok((dir, Accounts::new(library, signer())))
    }

    fn signup_request(email: &str, password: &str) -> SignupRequest {
        SignupRequest {
            username: "meme lord".into(),
            email: email.into(),
            password: password.into(),
        }
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(&hash, "correct horse").unwrap());
        assert!(!verify_password(&hash, "wrong horse").unwrap());
        assert!(verify_password("not a hash", "x").is_err());
    }

    #[test]
    fn tokens_verify_until_expiry() {
        let signer = signer();
        let token = signer.issue_at(7, 1_000);
        assert_eq!(signer.verify_at(&token, 1_001).unwrap(), 7);
        assert_eq!(signer.verify_at(&token, 4_599).unwrap(), 7);
        let err = signer.verify_at(&token, 4_600).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.to_string(), "token expired");
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let signer = signer();
        let token = signer.issue(7);
        let (payload, signature) = token.split_once('.').unwrap();

        let forged_claims = URL_SAFE_NO_PAD.encode(br#"{"sub":1,"exp":99999999999}"#);
        for bad in [
            String::new(),
            "garbage".to_string(),
            format!("{forged_claims}.{signature}"),
            format!("{payload}.AAAA"),
            format!("{payload}.{}", URL_SAFE_NO_PAD.encode([0u8; 32])),
        ] {
            let err = signer.verify(&bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unauthorized, "{bad:?}");
        }

        let other = TokenSigner::new("another-secret", Duration::from_secs(3600));
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn email_shape_check() {
        assert!(is_plausible_email("a@b"));
        assert!(is_plausible_email("first.last@example.com"));
        assert!(!is_plausible_email("nope"));
        assert!(!is_plausible_email("@example.com"));
        assert!(!is_plausible_email("a@"));
        assert!(!is_plausible_email("a b@example.com"));
        assert!(!is_plausible_email("a@b@c"));
    }

    #[tokio::test]
    async fn signup_then_login_then_authenticate() -> Result<()> {
        let (_dir, accounts) = accounts().await?;
        let user = accounts
            .signup(signup_request("Meme@Example.com", "hunter22"))
            .await?;
        assert_eq!(user.username, "meme lord");

        let login = accounts
            .login(LoginRequest {
                email: "meme@example.com".into(),
                password: "hunter22".into(),
            })
            .await?;
        assert_eq!(login.user, user);

        let resolved = accounts.authenticate(&login.token).await?;
        assert_eq!(resolved.id, user.id);
        assert_eq!(resolved.email, "meme@example.com");
        Ok(())
    }

    #[tokio::test]
    async fn signup_validation_and_conflict() -> Result<()> {
        let (_dir, accounts) = accounts().await?;

        let mut blank_name = signup_request("a@example.com", "longenough");
        blank_name.username = "  ".into();
        for bad in [
            blank_name,
            signup_request("not-an-email", "longenough"),
            signup_request("a@example.com", "short"),
        ] {
            let err = accounts.signup(bad).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }

        accounts
            .signup(signup_request("a@example.com", "longenough"))
            .await?;
        let err = accounts
            .signup(signup_request("A@EXAMPLE.COM", "longenough"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        Ok(())
    }

    #[tokio::test]
    async fn login_failures_share_one_message() -> Result<()> {
        let (_dir, accounts) = accounts().await?;
        accounts
            .signup(signup_request("a@example.com", "longenough"))
            .await?;

        let unknown = accounts
            .login(LoginRequest {
                email: "ghost@example.com".into(),
                password: "longenough".into(),
            })
            .await
            .unwrap_err();
        let wrong = accounts
            .login(LoginRequest {
                email: "a@example.com".into(),
                password: "not the password".into(),
            })
            .await
            .unwrap_err();

        assert_eq!(unknown.kind(), ErrorKind::Unauthorized);
        assert_eq!(unknown.to_string(), wrong.to_string());
        Ok(())
    }
}
