#![forbid(unsafe_code)]

//! Library database: accounts and the audio catalogue.
//!
//! Backed by a local libsql (SQLite) file. Titles and emails are unique at
//! the schema level; the typed errors below surface those violations so the
//! HTTP layer can answer with 409 instead of a generic 500.

use std::{io, path::Path};

use chrono::{SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("an audio titled {0:?} already exists")]
    DuplicateTitle(String),
    #[error("an account with email {0} already exists")]
    EmailTaken(String),
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: libsql::Error,
    },
    #[error("insert into {0} returned no id")]
    MissingId(&'static str),
    #[error("creating library directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl LibraryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateTitle(_) => ErrorKind::DuplicateTitle,
            Self::EmailTaken(_) => ErrorKind::Conflict,
            Self::Database { .. } | Self::MissingId(_) | Self::Io { .. } => {
                ErrorKind::PersistenceFailure
            }
        }
    }
}

fn db_err(context: &'static str) -> impl FnOnce(libsql::Error) -> LibraryError {
    move |source| LibraryError::Database { context, source }
}

fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string().contains("UNIQUE constraint failed")
}

/// A row of the `audios` table as the API returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioRecord {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub source_url: String,
    pub uploader_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewAudio<'a> {
    pub title: &'a str,
    pub url: &'a str,
    pub source_url: &'a str,
    pub uploader_id: Option<i64>,
}

/// Stored account. Deliberately not `Serialize`: the hash stays in here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: String,
}

async fn configure_connection(conn: &Connection) -> Result<(), LibraryError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await
    .map_err(db_err("configuring connection"))?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<(), LibraryError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audios (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL UNIQUE,
            url TEXT NOT NULL,
            source_url TEXT NOT NULL DEFAULT '',
            uploader_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audios_created ON audios(created_at);
        "#,
    )
    .await
    .map_err(db_err("creating schema"))?;
    Ok(())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Escapes `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'`.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

/// Shared handle to the library database. Cloning shares the connection.
#[derive(Clone)]
pub struct Library {
    conn: Connection,
}

impl Library {
    /// Opens (creating if needed) the database file and its schema.
    pub async fn open(path: &Path) -> Result<Self, LibraryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LibraryError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(db_err("opening library database"))?;
        let conn = db.connect().map_err(db_err("connecting to library database"))?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        debug!(path = %path.display(), "library database ready");
        Ok(Self { conn })
    }

    /// Creates an account. `email` is stored lowercased.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserRecord, LibraryError> {
        let email = email.trim().to_lowercase();
        let created_at = now_rfc3339();
        let inserted = self
            .conn
            .query(
                r#"
                INSERT INTO users (username, email, password_hash, created_at)
                VALUES (?1, ?2, ?3, ?4)
                RETURNING id
                "#,
                params![username, email.as_str(), password_hash, created_at.as_str()],
            )
            .await;
        let id = match inserted {
            Ok(mut rows) => returned_id(&mut rows).await,
            Err(err) => Err(err),
        };
        let id = match id {
            Ok(Some(id)) => id,
            Ok(None) => return Err(LibraryError::MissingId("users")),
            Err(err) if is_unique_violation(&err) => return Err(LibraryError::EmailTaken(email)),
            Err(err) => return Err(db_err("inserting user")(err)),
        };

        Ok(UserRecord {
            id,
            username: username.to_string(),
            email,
            password_hash: password_hash.to_string(),
            created_at,
        })
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, LibraryError> {
        let email = email.trim().to_lowercase();
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, username, email, password_hash, created_at
                FROM users
                WHERE email = ?1
                "#,
            )
            .await
            .map_err(db_err("preparing user lookup"))?;
        let mut rows = stmt
            .query([email.as_str()])
            .await
            .map_err(db_err("looking up user"))?;
        match rows.next().await.map_err(db_err("reading user row"))? {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn find_user_by_id(&self, id: i64) -> Result<Option<UserRecord>, LibraryError> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, username, email, password_hash, created_at
                FROM users
                WHERE id = ?1
                "#,
            )
            .await
            .map_err(db_err("preparing user lookup"))?;
        let mut rows = stmt
            .query([id])
            .await
            .map_err(db_err("looking up user"))?;
        match rows.next().await.map_err(db_err("reading user row"))? {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn title_exists(&self, title: &str) -> Result<bool, LibraryError> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM audios WHERE title = ?1 LIMIT 1", [title])
            .await
            .map_err(db_err("checking title"))?;
        Ok(rows
            .next()
            .await
            .map_err(db_err("reading title check"))?
            .is_some())
    }

    /// Inserts a catalogue entry stamped with the current time.
    pub async fn insert_audio(&self, audio: &NewAudio<'_>) -> Result<AudioRecord, LibraryError> {
        let created_at = now_rfc3339();
        let inserted = self
            .conn
            .query(
                r#"
                INSERT INTO audios (title, url, source_url, uploader_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                RETURNING id
                "#,
                params![
                    audio.title,
                    audio.url,
                    audio.source_url,
                    audio.uploader_id,
                    created_at.as_str(),
                ],
            )
            .await;
        let id = match inserted {
            Ok(mut rows) => returned_id(&mut rows).await,
            Err(err) => Err(err),
        };
        let id = match id {
            Ok(Some(id)) => id,
            Ok(None) => return Err(LibraryError::MissingId("audios")),
            Err(err) if is_unique_violation(&err) => {
                return Err(LibraryError::DuplicateTitle(audio.title.to_string()));
            }
            Err(err) => return Err(db_err("inserting audio")(err)),
        };

        Ok(AudioRecord {
            id,
            title: audio.title.to_string(),
            url: audio.url.to_string(),
            source_url: audio.source_url.to_string(),
            uploader_id: audio.uploader_id,
            created_at,
        })
    }

    /// Every audio, newest first.
    pub async fn list_audios(&self) -> Result<Vec<AudioRecord>, LibraryError> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, url, source_url, uploader_id, created_at
                FROM audios
                ORDER BY created_at DESC, id DESC
                "#,
            )
            .await
            .map_err(db_err("preparing audio listing"))?;
        let mut rows = stmt
            .query(params![])
            .await
            .map_err(db_err("listing audios"))?;
        collect_audios(&mut rows).await
    }

    /// Case-insensitive substring match on titles. A blank query lists all.
    pub async fn search_audios(&self, query: &str) -> Result<Vec<AudioRecord>, LibraryError> {
        let query = query.trim();
        if query.is_empty() {
            return self.list_audios().await;
        }
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, url, source_url, uploader_id, created_at
                FROM audios
                WHERE title LIKE ?1 ESCAPE '\'
                ORDER BY created_at DESC, id DESC
                "#,
            )
            .await
            .map_err(db_err("preparing audio search"))?;
        let mut rows = stmt
            .query([like_pattern(query)])
            .await
            .map_err(db_err("searching audios"))?;
        collect_audios(&mut rows).await
    }

    pub async fn count_audios(&self) -> Result<i64, LibraryError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM audios", params![])
            .await
            .map_err(db_err("counting audios"))?;
        match rows.next().await.map_err(db_err("reading audio count"))? {
            Some(row) => row.get(0).map_err(db_err("reading audio count")),
            None => Ok(0),
        }
    }
}

/// Reads the single `RETURNING id` row of an insert.
async fn returned_id(rows: &mut libsql::Rows) -> Result<Option<i64>, libsql::Error> {
    match rows.next().await? {
        Some(row) => row.get(0).map(Some),
        None => Ok(None),
    }
}

async fn collect_audios(rows: &mut libsql::Rows) -> Result<Vec<AudioRecord>, LibraryError> {
    let mut records = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err("reading audio row"))? {
        records.push(row_to_audio(&row)?);
    }
    Ok(records)
}

// Column order matches the SELECTs above.
fn row_to_audio(row: &Row) -> Result<AudioRecord, LibraryError> {
    let decode = || db_err("decoding audio row");
    Ok(AudioRecord {
        id: row.get(0).map_err(decode())?,
        title: row.get(1).map_err(decode())?,
        url: row.get(2).map_err(decode())?,
        source_url: row.get(3).map_err(decode())?,
        uploader_id: row.get(4).map_err(decode())?,
        created_at: row.get(5).map_err(decode())?,
    })
}

fn row_to_user(row: &Row) -> Result<UserRecord, LibraryError> {
    let decode = || db_err("decoding user row");
    Ok(UserRecord {
        id: row.get(0).map_err(decode())?,
        username: row.get(1).map_err(decode())?,
        email: row.get(2).map_err(decode())?,
        password_hash: row.get(3).map_err(decode())?,
        created_at: row.get(4).map_err(decode())?,
    })
}
