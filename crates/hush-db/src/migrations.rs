use anyhow::{Result, bail};
use rusqlite::Connection;
use tracing::{debug, info};

use hush_types::models::UserId;

/// Global tables: identity records, session key vault, per-user message keys.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL,
            surname     TEXT NOT NULL,
            handle      TEXT NOT NULL UNIQUE,
            login       TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS session_keys (
            session_id  TEXT PRIMARY KEY,
            private_key TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS user_keys (
            user_id     INTEGER PRIMARY KEY,
            public_key  TEXT NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

pub fn chats_table(owner: UserId) -> Result<String> {
    Ok(format!("chats_u{}", partition_suffix(owner)?))
}

pub fn messages_table(owner: UserId) -> Result<String> {
    Ok(format!("messages_u{}", partition_suffix(owner)?))
}

fn partition_suffix(owner: UserId) -> Result<UserId> {
    if owner <= 0 {
        bail!("Invalid partition owner {}", owner);
    }
    Ok(owner)
}

/// Create the owner's partition: a summary family clustered by last activity
/// and a message family clustered by creation time. Idempotent.
pub fn provision(conn: &Connection, owner: UserId) -> Result<()> {
    let chats = chats_table(owner)?;
    let messages = messages_table(owner)?;

    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {chats} (
            owner_id        INTEGER NOT NULL,
            last_updated    INTEGER NOT NULL,
            companion_id    INTEGER NOT NULL,
            chat_id         TEXT NOT NULL,
            chat_type       TEXT NOT NULL,
            secured         INTEGER NOT NULL,
            muted           INTEGER NOT NULL,
            new_msg_count   INTEGER NOT NULL,
            last_msg_time   INTEGER,
            session_key     TEXT,
            PRIMARY KEY (owner_id, last_updated, companion_id, chat_id)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_{chats}_chat ON {chats}(chat_id);
        CREATE INDEX IF NOT EXISTS idx_{chats}_companion ON {chats}(companion_id);

        CREATE TABLE IF NOT EXISTS {messages} (
            chat_id         TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            message_id      TEXT NOT NULL,
            sender_id       INTEGER NOT NULL,
            body            TEXT NOT NULL,
            reply_to        TEXT,
            fwd_chat_id     TEXT,
            fwd_message_id  TEXT,
            read            INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (chat_id, created_at, message_id)
        ) WITHOUT ROWID;
        "
    ))?;

    debug!("Partition for user {} provisioned", owner);
    Ok(())
}
