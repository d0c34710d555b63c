use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tracing::info;

use crate::config::DatabaseConfig;

/// SQL flavour behind a database URL. Queries are written to run on both;
/// only the DDL differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else {
            anyhow::bail!(
                "Unsupported database URL {:?}: expected sqlite:// or postgres://",
                url.split_once("://").map_or(url, |(scheme, _)| scheme)
            )
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }

    fn serial_key(self) -> &'static str {
        match self {
            Self::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Self::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pub pool: AnyPool,
    pub dialect: Dialect,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let dialect = Dialect::from_url(&config.url)?;
        info!("Connecting to {} database", dialect.name());

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(1)
            .connect(&config.url)
            .await
            .with_context(|| format!("Failed to connect to {} database", dialect.name()))?;

        info!("Running database migrations...");
        self::run_migrations(&pool, dialect).await?;

        if dialect == Dialect::Sqlite {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await?;
            sqlx::query("PRAGMA synchronous = NORMAL")
                .execute(&pool)
                .await?;
            sqlx::query("PRAGMA busy_timeout = 5000")
                .execute(&pool)
                .await?;
            sqlx::query("PRAGMA foreign_keys = ON")
                .execute(&pool)
                .await?;
        }

        info!("Database initialized successfully");

        Ok(Self { pool, dialect })
    }

    pub async fn get_stats(&self) -> Result<DbStats> {
        let (users, connections, chat_windows, messages, instances): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
            SELECT
                (SELECT COUNT(*) FROM users),
                (SELECT COUNT(*) FROM connections),
                (SELECT COUNT(*) FROM chat_windows),
                (SELECT COUNT(*) FROM chat_messages),
                (SELECT COUNT(*) FROM instances)
            "#,
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(DbStats {
            backend: self.dialect.name(),
            users: users as u64,
            connections: connections as u64,
            chat_windows: chat_windows as u64,
            messages: messages as u64,
            instances: instances as u64,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub backend: &'static str,
    pub users: u64,
    pub connections: u64,
    pub chat_windows: u64,
    pub messages: u64,
    /// Relay processes that have registered with the store
    pub instances: u64,
}

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 2;

pub(crate) async fn run_migrations(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version BIGINT PRIMARY KEY,
            applied_at BIGINT NOT NULL,
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}. Please upgrade the application.",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version == SCHEMA_VERSION {
        info!(
            "Database schema is up to date (version {})",
            current_version
        );
        return Ok(());
    }

    info!(
        "Migrating database from version {} to {}",
        current_version, SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool, dialect).await?;
        record_version(pool, 1, "users, connections, chat windows, messages").await?;
    }
    if current_version < 2 {
        migrate_v2(pool, dialect).await?;
        record_version(pool, 2, "instance liveness, portable row ordering").await?;
    }

    info!("Database migrated to version {}", SCHEMA_VERSION);

    Ok(())
}

async fn record_version(pool: &AnyPool, version: i64, description: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_version (version, applied_at, description) VALUES ($1, $2, $3)")
        .bind(version)
        .bind(Utc::now().timestamp())
        .bind(description)
        .execute(pool)
        .await?;
    Ok(())
}

async fn migrate_v1(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    let serial = dialect.serial_key();

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id {serial},
            user_id BIGINT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            user_type TEXT NOT NULL,
            email TEXT,
            phone_no TEXT,
            profile_picture TEXT,
            last_auth_token TEXT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_type ON users(user_type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_token ON users(last_auth_token)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            session_id TEXT PRIMARY KEY,
            user_id BIGINT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            instance_id TEXT NOT NULL,
            created_at BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS chat_windows (
            id {serial},
            uid TEXT NOT NULL UNIQUE,
            participants_key TEXT NOT NULL UNIQUE,
            last_message TEXT NOT NULL DEFAULT '',
            last_message_at BIGINT,
            last_message_sender TEXT NOT NULL DEFAULT '',
            last_message_sender_user_id BIGINT NOT NULL DEFAULT 0,
            last_message_seen_by_recipient BIGINT NOT NULL DEFAULT 0,
            created_at BIGINT NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_windows_last_message ON chat_windows(last_message_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_window_participants (
            chat_window_id BIGINT NOT NULL REFERENCES chat_windows(id) ON DELETE CASCADE,
            user_id BIGINT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            PRIMARY KEY (chat_window_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_participants_user ON chat_window_participants(user_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS chat_messages (
            id {serial},
            message_type TEXT NOT NULL,
            message TEXT NOT NULL,
            image_url TEXT,
            sender BIGINT NOT NULL,
            chat_window_uid TEXT NOT NULL REFERENCES chat_windows(uid) ON DELETE CASCADE,
            created_at BIGINT NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_messages_window ON chat_messages(chat_window_uid, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn migrate_v2(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    let serial = dialect.serial_key();

    // Connection rows only describe live sockets, so the table is rebuilt
    // rather than copied. The serial id gives attach order on every backend.
    sqlx::query("DROP TABLE IF EXISTS connections")
        .execute(pool)
        .await?;
    sqlx::query(&format!(
        r#"
        CREATE TABLE connections (
            id {serial},
            session_id TEXT NOT NULL UNIQUE,
            user_id BIGINT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            instance_id TEXT NOT NULL,
            created_at BIGINT NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_connections_user ON connections(user_id, id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_connections_instance ON connections(instance_id)")
        .execute(pool)
        .await?;

    // Initiator first
    sqlx::query(
        "ALTER TABLE chat_window_participants ADD COLUMN ordinal BIGINT NOT NULL DEFAULT 0",
    )
    .execute(pool)
    .await?;

    // One row per relay process sharing this store, refreshed while it runs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS instances (
            instance_id TEXT PRIMARY KEY,
            started_at BIGINT NOT NULL,
            last_seen BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
