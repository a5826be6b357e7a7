use crate::models::{ConversationListRow, ConversationRow, MessageRow, UserRow};
use crate::Database;
use anyhow::{anyhow, bail, Result};
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, email: &str, name: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, name, password, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, email, name, password_hash, now_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// Directory listing for starting chats — everyone except the caller.
    pub fn list_users_except(&self, user_id: &str) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, email, name, password, created_at FROM users
                 WHERE id != ?1 ORDER BY name",
            )?;
            let rows = stmt
                .query_map([user_id], map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Conversations --

    /// Find or create the unique conversation for an unordered user pair.
    /// The pair is normalized to sorted order before lookup and insert so
    /// the UNIQUE(user_a_id, user_b_id) constraint covers both orderings.
    pub fn find_or_create_conversation(&self, user_x: &str, user_y: &str) -> Result<ConversationRow> {
        let (a, b) = if user_x <= user_y {
            (user_x, user_y)
        } else {
            (user_y, user_x)
        };

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if let Some(existing) = query_conversation_by_pair(&tx, a, b)? {
                tx.commit()?;
                return Ok(existing);
            }

            let id = uuid::Uuid::new_v4().to_string();
            let now = now_rfc3339();
            tx.execute(
                "INSERT INTO conversations (id, user_a_id, user_b_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![id, a, b, now],
            )?;
            let row = query_conversation(&tx, &id)?
                .ok_or_else(|| anyhow!("conversation vanished after insert"))?;
            tx.commit()?;
            Ok(row)
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// All conversations the user participates in, newest activity first,
    /// joined with the other participant and the latest message in one query.
    pub fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationListRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.user_a_id, c.user_b_id, c.last_read_at_a, c.last_read_at_b,
                        c.created_at, c.updated_at,
                        u.id, u.email, u.name,
                        (SELECT m.content FROM messages m
                          WHERE m.conversation_id = c.id
                          ORDER BY m.created_at DESC LIMIT 1),
                        (SELECT m.created_at FROM messages m
                          WHERE m.conversation_id = c.id
                          ORDER BY m.created_at DESC LIMIT 1)
                 FROM conversations c
                 JOIN users u ON u.id = CASE WHEN c.user_a_id = ?1
                                             THEN c.user_b_id ELSE c.user_a_id END
                 WHERE c.user_a_id = ?1 OR c.user_b_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationListRow {
                        conversation: ConversationRow {
                            id: row.get(0)?,
                            user_a_id: row.get(1)?,
                            user_b_id: row.get(2)?,
                            last_read_at_a: row.get(3)?,
                            last_read_at_b: row.get(4)?,
                            created_at: row.get(5)?,
                            updated_at: row.get(6)?,
                        },
                        other_user_id: row.get(7)?,
                        other_user_email: row.get(8)?,
                        other_user_name: row.get(9)?,
                        last_message: row.get(10)?,
                        last_message_at: row.get(11)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Set the acting user's read cursor on a conversation. Touches only the
    /// column belonging to that user, never the other participant's.
    pub fn update_last_read(&self, conversation_id: &str, user_id: &str, at: &str) -> Result<()> {
        self.with_conn(|conn| {
            let row = query_conversation(conn, conversation_id)?
                .ok_or_else(|| anyhow!("conversation {} not found", conversation_id))?;

            let column = if row.user_a_id == user_id {
                "last_read_at_a"
            } else if row.user_b_id == user_id {
                "last_read_at_b"
            } else {
                bail!("user {} is not a participant of {}", user_id, conversation_id);
            };

            conn.execute(
                &format!("UPDATE conversations SET {} = ?1 WHERE id = ?2", column),
                rusqlite::params![at, conversation_id],
            )?;
            Ok(())
        })
    }

    // -- Messages --

    /// Persist a message in a single transaction that also bumps the
    /// conversation's ordering timestamp and sets the sender's own read
    /// cursor (sending implies having read up to that point).
    pub fn create_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let convo = query_conversation(&tx, conversation_id)?
                .ok_or_else(|| anyhow!("conversation {} not found", conversation_id))?;
            let read_column = if convo.user_a_id == sender_id {
                "last_read_at_a"
            } else if convo.user_b_id == sender_id {
                "last_read_at_b"
            } else {
                bail!("user {} is not a participant of {}", sender_id, conversation_id);
            };

            let now = now_rfc3339();
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, conversation_id, sender_id, content, now],
            )?;
            tx.execute(
                &format!(
                    "UPDATE conversations SET updated_at = ?1, {} = ?1 WHERE id = ?2",
                    read_column
                ),
                rusqlite::params![now, conversation_id],
            )?;

            let sender_name: String = tx
                .query_row("SELECT name FROM users WHERE id = ?1", [sender_id], |row| {
                    row.get(0)
                })
                .map_err(|_| anyhow!("sender {} not found", sender_id))?;

            tx.commit()?;

            Ok(MessageRow {
                id: id.to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: sender_id.to_string(),
                sender_name,
                content: content.to_string(),
                created_at: now,
            })
        })
    }

    /// Message history, newest first. `before` is a created_at cursor — pass
    /// the timestamp of the oldest message from the previous page.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            // JOIN users to fetch sender_name in a single query
            let (sql, params): (&str, Vec<&dyn rusqlite::types::ToSql>) = match before {
                Some(ref cursor) => (
                    "SELECT m.id, m.conversation_id, m.sender_id, u.name, m.content, m.created_at
                     FROM messages m
                     LEFT JOIN users u ON m.sender_id = u.id
                     WHERE m.conversation_id = ?1 AND m.created_at < ?2
                     ORDER BY m.created_at DESC
                     LIMIT ?3",
                    vec![&conversation_id, cursor, &limit],
                ),
                None => (
                    "SELECT m.id, m.conversation_id, m.sender_id, u.name, m.content, m.created_at
                     FROM messages m
                     LEFT JOIN users u ON m.sender_id = u.id
                     WHERE m.conversation_id = ?1
                     ORDER BY m.created_at DESC
                     LIMIT ?2",
                    vec![&conversation_id, &limit],
                ),
            };

            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        sender_name: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        content: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        password: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, email, name, password, created_at FROM users WHERE {} = ?1",
        column
    ))?;
    let row = stmt.query_row([value], map_user_row).optional()?;
    Ok(row)
}

fn query_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_a_id, user_b_id, last_read_at_a, last_read_at_b, created_at, updated_at
         FROM conversations WHERE id = ?1",
    )?;
    let row = stmt.query_row([id], map_conversation_row).optional()?;
    Ok(row)
}

fn query_conversation_by_pair(conn: &Connection, a: &str, b: &str) -> Result<Option<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_a_id, user_b_id, last_read_at_a, last_read_at_b, created_at, updated_at
         FROM conversations WHERE user_a_id = ?1 AND user_b_id = ?2",
    )?;
    let row = stmt.query_row([a, b], map_conversation_row).optional()?;
    Ok(row)
}

fn map_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user_a_id: row.get(1)?,
        user_b_id: row.get(2)?,
        last_read_at_a: row.get(3)?,
        last_read_at_b: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
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
