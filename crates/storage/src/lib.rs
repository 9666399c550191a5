use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use uuid::Uuid;

use shared::domain::{DeviceId, UserId};

const KEY_REFRESH_TOKEN: &str = "refresh_token";
const KEY_USER_ID: &str = "user_id";
const KEY_DEVICE_ID: &str = "device_id";

/// Session subset that survives restarts. The access token is deliberately
/// absent; it is re-derived from the refresh token on bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSession {
    pub refresh_token: String,
    pub user_id: UserId,
    pub device_id: Option<DeviceId>,
}

/// Sqlite-backed key-value store for the persisted session subset.
#[derive(Clone)]
pub struct SessionDb {
    pool: Pool<Sqlite>,
}

impl SessionDb {
    pub async fn open(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;

        let db = Self { pool };
        db.ensure_session_table().await?;
        Ok(db)
    }

    async fn ensure_session_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_store (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure session_store table exists")?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM session_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read session key '{key}'"))?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_store (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write session key '{key}'"))?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete session key '{key}'"))?;
        Ok(())
    }

    /// Load the persisted session, or `None` when no refresh token is stored.
    ///
    /// A stored user id that fails to parse is treated as an absent session
    /// rather than an error; the caller falls back to re-authentication.
    pub async fn load_session(&self) -> Result<Option<PersistedSession>> {
        let Some(refresh_token) = self.get(KEY_REFRESH_TOKEN).await? else {
            return Ok(None);
        };

        let Some(user_id) = self
            .get(KEY_USER_ID)
            .await?
            .and_then(|raw| Uuid::parse_str(&raw).ok())
        else {
            return Ok(None);
        };

        let device_id = self
            .get(KEY_DEVICE_ID)
            .await?
            .and_then(|raw| Uuid::parse_str(&raw).ok())
            .map(DeviceId);

        Ok(Some(PersistedSession {
            refresh_token,
            user_id: UserId(user_id),
            device_id,
        }))
    }

    pub async fn store_session(&self, session: &PersistedSession) -> Result<()> {
        self.put(KEY_REFRESH_TOKEN, &session.refresh_token).await?;
        self.put(KEY_USER_ID, &session.user_id.0.to_string())
            .await?;
        match &session.device_id {
            Some(device_id) => self.put(KEY_DEVICE_ID, &device_id.0.to_string()).await?,
            None => self.delete(KEY_DEVICE_ID).await?,
        }
        Ok(())
    }

    pub async fn clear_session(&self) -> Result<()> {
        self.delete(KEY_REFRESH_TOKEN).await?;
        self.delete(KEY_USER_ID).await?;
        self.delete(KEY_DEVICE_ID).await?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return Ok(());
    }

    let Some(parent) = Path::new(path).parent() else {
        return Ok(());
    };

    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
