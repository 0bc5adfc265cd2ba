use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use tracing::debug;
use uuid::Uuid;

use hush_crypto::KeyVault;
use hush_types::models::{ConversationSummary, Message, NewUser, SummaryKey, User, UserId};

use crate::Database;
use crate::migrations::{self, chats_table, messages_table};
use crate::models::{MessageRow, SummaryRow, UserRow, to_micros};
use crate::store::{ConversationStore, IdentityStore, PageCursor, SummaryPage};

const SUMMARY_COLUMNS: &str = "owner_id, last_updated, companion_id, chat_id, chat_type, secured, muted, \
     new_msg_count, last_msg_time, session_key";

const MESSAGE_COLUMNS: &str = "chat_id, created_at, message_id, sender_id, body, reply_to, fwd_chat_id, \
     fwd_message_id, read";

impl ConversationStore for Database {
    fn provision(&self, owner: UserId) -> Result<()> {
        self.with_conn(|conn| migrations::provision(conn, owner))
    }

    fn find_summary_by_chat(&self, owner: UserId, conversation_id: Uuid) -> Result<Option<ConversationSummary>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM {} WHERE chat_id = ?1 ORDER BY last_updated DESC LIMIT 1",
                SUMMARY_COLUMNS,
                chats_table(owner)?
            );
            query_summary(conn, &sql, rusqlite::params![conversation_id.to_string()])
        })
    }

    fn find_summary_by_companion(&self, owner: UserId, companion: UserId) -> Result<Option<ConversationSummary>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM {} WHERE companion_id = ?1 ORDER BY last_updated DESC LIMIT 1",
                SUMMARY_COLUMNS,
                chats_table(owner)?
            );
            query_summary(conn, &sql, rusqlite::params![companion])
        })
    }

    fn upsert_summary(&self, owner: UserId, prior: Option<&SummaryKey>, summary: &ConversationSummary) -> Result<()> {
        if summary.owner_id != owner {
            bail!("Summary owned by {} written to partition {}", summary.owner_id, owner);
        }

        self.with_conn(|conn| {
            let table = chats_table(owner)?;

            if let Some(prior) = prior {
                let removed = conn.execute(
                    &format!(
                        "DELETE FROM {} WHERE owner_id = ?1 AND last_updated = ?2 AND companion_id = ?3 AND chat_id = ?4",
                        table
                    ),
                    rusqlite::params![
                        owner,
                        to_micros(prior.last_updated),
                        prior.companion_id,
                        prior.conversation_id.to_string()
                    ],
                )?;
                debug!(
                    "Partition {}: removed {} summary row(s) for chat {}",
                    owner, removed, prior.conversation_id
                );
            }

            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    table, SUMMARY_COLUMNS
                ),
                rusqlite::params![
                    owner,
                    to_micros(summary.last_updated),
                    summary.companion_id,
                    summary.conversation_id.to_string(),
                    summary.kind.as_str(),
                    summary.secured,
                    summary.muted,
                    summary.unread_count as i64,
                    summary.last_message_at.map(to_micros),
                    summary.session_key,
                ],
            )?;
            Ok(())
        })
    }

    fn list_summaries(
        &self,
        owner: UserId,
        page_size: u32,
        after: Option<&PageCursor>,
        secured: Option<bool>,
    ) -> Result<SummaryPage> {
        let summaries = self.with_conn(|conn| {
            let table = chats_table(owner)?;
            // Keyset pagination in clustering order: last_updated DESC, then companion/chat ASC.
            let sql = format!(
                "SELECT {} FROM {}
                 WHERE (?1 IS NULL OR secured = ?1)
                   AND (?2 IS NULL
                        OR last_updated < ?2
                        OR (last_updated = ?2 AND (companion_id > ?3
                            OR (companion_id = ?3 AND chat_id > ?4))))
                 ORDER BY last_updated DESC, companion_id ASC, chat_id ASC
                 LIMIT ?5",
                SUMMARY_COLUMNS, table
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![
                        secured,
                        after.map(|c| c.last_updated),
                        after.map(|c| c.companion_id),
                        after.map(|c| c.conversation_id.to_string()),
                        page_size as i64,
                    ],
                    summary_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(SummaryRow::into_summary).collect::<Result<Vec<_>>>()
        })?;

        let next = summaries.last().map(PageCursor::after);
        Ok(SummaryPage { summaries, next })
    }

    fn append_message(&self, owner: UserId, message: &Message) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    messages_table(owner)?,
                    MESSAGE_COLUMNS
                ),
                rusqlite::params![
                    message.conversation_id.to_string(),
                    to_micros(message.created_at),
                    message.message_id.to_string(),
                    message.sender_id,
                    message.body,
                    message.reply_to.map(|id| id.to_string()),
                    message.forwarded_from.map(|f| f.conversation_id.to_string()),
                    message.forwarded_from.map(|f| f.message_id.to_string()),
                    message.read,
                ],
            )?;
            Ok(())
        })
    }

    fn list_messages(&self, owner: UserId, conversation_id: Uuid) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM {} WHERE chat_id = ?1 ORDER BY created_at DESC, message_id DESC",
                MESSAGE_COLUMNS,
                messages_table(owner)?
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([conversation_id.to_string()], |row| {
                    Ok(MessageRow {
                        chat_id: row.get(0)?,
                        created_at: row.get(1)?,
                        message_id: row.get(2)?,
                        sender_id: row.get(3)?,
                        body: row.get(4)?,
                        reply_to: row.get(5)?,
                        fwd_chat_id: row.get(6)?,
                        fwd_message_id: row.get(7)?,
                        read: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(MessageRow::into_message).collect()
        })
    }

    fn mark_read(
        &self,
        owner: UserId,
        conversation_id: Uuid,
        message_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Option<UserId>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "UPDATE {} SET read = 1 WHERE chat_id = ?1 AND created_at = ?2 AND message_id = ?3
                     RETURNING sender_id",
                    messages_table(owner)?
                ),
                rusqlite::params![conversation_id.to_string(), to_micros(created_at), message_id.to_string()],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn set_user_key(&self, user: UserId, public_key_pem: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_keys (user_id, public_key) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET public_key = excluded.public_key, updated_at = datetime('now')",
                rusqlite::params![user, public_key_pem],
            )?;
            Ok(())
        })
    }

    fn user_key(&self, user: UserId) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT public_key FROM user_keys WHERE user_id = ?1", [user], |row| row.get(0))
                .optional()
        })
    }
}

impl IdentityStore for Database {
    fn find_by_login(&self, login: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, surname, handle, login, password FROM users WHERE login = ?1",
            )?;
            let row = stmt.query_row([login], user_row).optional()?;
            Ok(row.map(User::from))
        })
    }

    /// Batch fetch. Unknown ids are simply absent from the result.
    fn find_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, name, surname, handle, login, password FROM users WHERE id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

            let rows = stmt
                .query_map(params.as_slice(), user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows.into_iter().map(User::from).collect())
        })
    }

    fn count_by_handle_or_login(&self, handle: &str, login: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE handle = ?1 OR login = ?2",
                (handle, login),
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    fn create(&self, user: NewUser) -> Result<User> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (name, surname, handle, login, password) VALUES (?1, ?2, ?3, ?4, ?5)",
                (&user.name, &user.surname, &user.handle, &user.login, &user.password_hash),
            )?;
            let id = conn.last_insert_rowid();

            Ok(User {
                id,
                name: user.name,
                surname: user.surname,
                handle: user.handle,
                login: user.login,
                password_hash: user.password_hash,
            })
        })
    }
}

impl KeyVault for Database {
    fn put(&self, session_id: &str, private_key_pem: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO session_keys (session_id, private_key) VALUES (?1, ?2)",
                (session_id, private_key_pem),
            )?;
            Ok(())
        })
    }

    fn get(&self, session_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT private_key FROM session_keys WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

fn summary_row(row: &Row<'_>) -> rusqlite::Result<SummaryRow> {
    Ok(SummaryRow {
        owner_id: row.get(0)?,
        last_updated: row.get(1)?,
        companion_id: row.get(2)?,
        chat_id: row.get(3)?,
        chat_type: row.get(4)?,
        secured: row.get(5)?,
        muted: row.get(6)?,
        new_msg_count: row.get(7)?,
        last_msg_time: row.get(8)?,
        session_key: row.get(9)?,
    })
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        surname: row.get(2)?,
        handle: row.get(3)?,
        login: row.get(4)?,
        password: row.get(5)?,
    })
}

fn query_summary<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Option<ConversationSummary>> {
    let mut stmt = conn.prepare(sql)?;
    let row = stmt.query_row(params, summary_row).optional()?;
    row.map(SummaryRow::into_summary).transpose()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use hush_types::models::{ConversationKind, ForwardRef};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn summary(owner: UserId, companion: UserId, last_updated: DateTime<Utc>) -> ConversationSummary {
        ConversationSummary {
            owner_id: owner,
            companion_id: companion,
            conversation_id: Uuid::new_v4(),
            kind: ConversationKind::Chat,
            secured: false,
            muted: false,
            unread_count: 0,
            last_message_at: None,
            last_updated,
            session_key: None,
        }
    }

    fn message(conversation_id: Uuid, sender: UserId, created_at: DateTime<Utc>) -> Message {
        Message {
            conversation_id,
            message_id: Uuid::now_v7(),
            sender_id: sender,
            body: "Y2lwaGVydGV4dA==".into(),
            created_at,
            reply_to: None,
            forwarded_from: None,
            read: false,
        }
    }

    fn count_rows(db: &Database, table: &str) -> i64 {
        db.with_conn(|conn| Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn provision_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.provision(1).unwrap();
        db.upsert_summary(1, None, &summary(1, 2, at(0))).unwrap();
        db.provision(1).unwrap();

        let families: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('chats_u1', 'messages_u1')",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(families, 2);
        assert_eq!(count_rows(&db, "chats_u1"), 1);
    }

    #[test]
    fn unprovisioned_partition_errors() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.list_messages(5, Uuid::new_v4()).is_err());
        assert!(db.provision(0).is_err());
    }

    #[test]
    fn upsert_replaces_row_under_prior_key() {
        let db = Database::open_in_memory().unwrap();
        db.provision(1).unwrap();

        let first = summary(1, 2, at(0));
        db.upsert_summary(1, None, &first).unwrap();

        let mut moved = first.clone();
        moved.last_updated = at(10);
        moved.unread_count = 3;
        db.upsert_summary(1, Some(&first.key()), &moved).unwrap();

        assert_eq!(count_rows(&db, "chats_u1"), 1);
        let found = db.find_summary_by_chat(1, first.conversation_id).unwrap().unwrap();
        assert_eq!(found, moved);
        assert_eq!(db.find_summary_by_companion(1, 2).unwrap().unwrap(), moved);
        assert!(db.find_summary_by_companion(1, 3).unwrap().is_none());
    }

    #[test]
    fn upsert_with_stale_prior_leaves_both_rows() {
        let db = Database::open_in_memory().unwrap();
        db.provision(1).unwrap();

        let first = summary(1, 2, at(0));
        db.upsert_summary(1, None, &first).unwrap();

        let mut stale = first.key();
        stale.last_updated = at(-5);
        let mut moved = first.clone();
        moved.last_updated = at(10);
        db.upsert_summary(1, Some(&stale), &moved).unwrap();

        assert_eq!(count_rows(&db, "chats_u1"), 2);
        // Natural-key lookup still resolves to the most recent copy.
        assert_eq!(db.find_summary_by_chat(1, first.conversation_id).unwrap().unwrap(), moved);
    }

    #[test]
    fn upsert_rejects_foreign_owner() {
        let db = Database::open_in_memory().unwrap();
        db.provision(1).unwrap();
        assert!(db.upsert_summary(1, None, &summary(2, 1, at(0))).is_err());
    }

    #[test]
    fn pages_cover_every_summary_once_in_activity_order() {
        let db = Database::open_in_memory().unwrap();
        db.provision(1).unwrap();

        let mut all = Vec::new();
        for companion in 2..=24 {
            // Several rows share a timestamp to exercise the tie-break.
            let s = summary(1, companion, at(companion / 3));
            db.upsert_summary(1, None, &s).unwrap();
            all.push(s);
        }

        let mut seen = Vec::new();
        let mut cursor: Option<PageCursor> = None;
        loop {
            let page = db.list_summaries(1, 5, cursor.as_ref(), None).unwrap();
            if page.summaries.is_empty() {
                assert!(page.next.is_none());
                break;
            }
            seen.extend(page.summaries);
            cursor = page.next;
        }

        assert_eq!(seen.len(), all.len());
        assert!(seen.windows(2).all(|w| w[0].last_updated >= w[1].last_updated));
        let mut ids: Vec<Uuid> = seen.iter().map(|s| s.conversation_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), all.len());
    }

    #[test]
    fn secured_filter() {
        let db = Database::open_in_memory().unwrap();
        db.provision(1).unwrap();

        let open = summary(1, 2, at(0));
        let mut secret = summary(1, 3, at(1));
        secret.secured = true;
        db.upsert_summary(1, None, &open).unwrap();
        db.upsert_summary(1, None, &secret).unwrap();

        let page = db.list_summaries(1, 10, None, Some(true)).unwrap();
        assert_eq!(page.summaries, vec![secret]);
        let page = db.list_summaries(1, 10, None, Some(false)).unwrap();
        assert_eq!(page.summaries, vec![open]);
        assert_eq!(db.list_summaries(1, 10, None, None).unwrap().summaries.len(), 2);
    }

    #[test]
    fn messages_newest_first_deduped_and_markable() {
        let db = Database::open_in_memory().unwrap();
        db.provision(1).unwrap();
        let chat = Uuid::new_v4();

        let older = message(chat, 1, at(0));
        let mut newer = message(chat, 2, at(0) + Duration::milliseconds(5));
        newer.reply_to = Some(older.message_id);
        newer.forwarded_from = Some(ForwardRef {
            conversation_id: Uuid::new_v4(),
            message_id: Uuid::now_v7(),
        });

        db.append_message(1, &older).unwrap();
        db.append_message(1, &newer).unwrap();
        db.append_message(1, &newer).unwrap();
        db.append_message(1, &message(Uuid::new_v4(), 1, at(1))).unwrap();

        let listed = db.list_messages(1, chat).unwrap();
        assert_eq!(listed, vec![newer.clone(), older.clone()]);

        assert_eq!(
            db.mark_read(1, chat, older.message_id, older.created_at).unwrap(),
            Some(older.sender_id)
        );
        assert_eq!(db.mark_read(1, chat, Uuid::now_v7(), older.created_at).unwrap(), None);

        let listed = db.list_messages(1, chat).unwrap();
        assert!(listed[1].read);
        assert!(!listed[0].read);
    }

    #[test]
    fn identity_lookups() {
        let db = Database::open_in_memory().unwrap();
        let alice = db
            .create(NewUser {
                name: "Alice".into(),
                surname: "Liddell".into(),
                handle: "alice".into(),
                login: "alice@example.com".into(),
                password_hash: "hash".into(),
            })
            .unwrap();

        assert_eq!(db.find_by_login("alice@example.com").unwrap().unwrap().id, alice.id);
        assert!(db.find_by_login("bob@example.com").unwrap().is_none());
        assert_eq!(db.count_by_handle_or_login("alice", "other").unwrap(), 1);
        assert_eq!(db.count_by_handle_or_login("other", "other").unwrap(), 0);

        let found = db.find_by_ids(&[alice.id, 999]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handle, "alice");
        assert!(db.find_by_ids(&[]).unwrap().is_empty());
    }

    #[test]
    fn vault_and_user_keys() {
        let db = Database::open_in_memory().unwrap();
        db.put("session-1", "PRIVATE").unwrap();
        assert_eq!(KeyVault::get(&db, "session-1").unwrap().as_deref(), Some("PRIVATE"));
        assert!(KeyVault::get(&db, "session-2").unwrap().is_none());

        assert!(db.user_key(1).unwrap().is_none());
        db.set_user_key(1, "PEM-A").unwrap();
        db.set_user_key(1, "PEM-B").unwrap();
        assert_eq!(db.user_key(1).unwrap().as_deref(), Some("PEM-B"));
    }
}
