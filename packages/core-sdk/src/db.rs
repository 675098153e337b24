use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, sync::Mutex, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::{Credential, UserProfile};
use crate::ports::{CredentialStore, ProfileSource};

/** \brief 默认数据库文件名。 */
pub const DEFAULT_DB_FILE: &str = "askmebuddy.db";

/**
 * \brief 打开指定路径的数据库。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS buddy_settings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            api_key TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            alias TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    Ok(get_config(conn, "telemetry_enabled")?
        .map(|s| s == "1")
        .unwrap_or(false))
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_config(conn, "telemetry_enabled", if enabled { "1" } else { "0" })
}

pub fn get_model(conn: &Connection) -> Result<Option<String>> {
    get_config(conn, "model")
}

pub fn set_model(conn: &Connection, model: &str) -> Result<()> {
    set_config(conn, "model", model)
}

pub fn get_current_user_id(conn: &Connection) -> Result<Option<String>> {
    get_config(conn, "current_user_id")
}

pub fn set_current_user_id(conn: &Connection, user_id: &str) -> Result<()> {
    set_config(conn, "current_user_id", user_id)
}

/**
 * \brief 新增一条 API Key 配置记录，返回记录 ID。
 */
pub fn insert_api_key(conn: &Connection, api_key: &str) -> Result<i64> {
    if api_key.is_empty() {
        return Err(anyhow!("api key must not be empty"));
    }
    let created_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO buddy_settings (api_key, created_at) VALUES (?1, ?2)",
            params![api_key, created_at],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 读取最近一次保存的 API Key。
 */
pub fn latest_api_key(conn: &Connection) -> Result<Option<String>> {
    conn.query_row(
        "SELECT api_key FROM buddy_settings ORDER BY id DESC LIMIT 1",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn count_api_keys(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM buddy_settings", [], |row| row.get(0))
        .map_err(Into::into)
}

/**
 * \brief 写入或更新用户记录。
 */
pub fn upsert_user(conn: &Connection, user_id: &str, name: &str, alias: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO users (id, name, alias) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name=excluded.name, alias=excluded.alias",
            params![user_id, name, alias],
        )
    })?;
    Ok(())
}

pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<UserProfile>> {
    conn.query_row(
        "SELECT name, alias FROM users WHERE id=?1",
        params![user_id],
        |row| {
            Ok(UserProfile {
                name: row.get(0)?,
                alias: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 基于 SQLite 的平台记录存储，同时提供 Key 与用户资料。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 包装一个已迁移的连接。
     */
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection poisoned"))?;
        f(&conn)
    }
}

impl CredentialStore for SqliteStore {
    fn load_key(&self) -> Result<Option<Credential>> {
        self.with_conn(|conn| Ok(latest_api_key(conn)?.map(Credential::new)))
    }

    fn save_key(&self, key: &Credential) -> Result<()> {
        self.with_conn(|conn| insert_api_key(conn, key.expose()).map(|_| ()))
    }
}

impl ProfileSource for SqliteStore {
    fn current_user(&self) -> Result<Option<UserProfile>> {
        self.with_conn(|conn| match get_current_user_id(conn)? {
            Some(id) => get_user(conn, &id),
            None => Ok(None),
        })
    }
}

fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(anyhow!("database still locked after {} retries", MAX_RETRIES))
}
