use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};

use crate::core::error::StoreError;
use crate::core::models::{CachedThread, DeliveryStatus, Message, MessageKind, OutboxEntry, Thread};

/// Schema DDL run on open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    viewer_id TEXT,
    property_id TEXT,
    status TEXT NOT NULL,
    last_message_at INTEGER,
    updated_at INTEGER NOT NULL,
    snapshot TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    local_key TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    client_id TEXT,
    server_id TEXT,
    tenant_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    body TEXT,
    kind TEXT NOT NULL,
    client_created_at INTEGER NOT NULL,
    server_created_at INTEGER,
    order_key INTEGER NOT NULL,
    status TEXT NOT NULL,
    attachment TEXT,
    UNIQUE (thread_id, client_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_thread
    ON messages(thread_id, order_key DESC);

CREATE INDEX IF NOT EXISTS idx_messages_status
    ON messages(status, order_key);

CREATE TABLE IF NOT EXISTS outbox (
    client_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    body TEXT NOT NULL,
    composed_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_ready
    ON outbox(next_retry_at);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const MESSAGE_COLUMNS: &str = "server_id, thread_id, tenant_id, sender_id, body, kind, client_id,
     client_created_at, server_created_at, status, attachment";

const OUTBOX_COLUMNS: &str =
    "client_id, thread_id, body, composed_at, attempts, next_retry_at, last_error";

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

// ---------------------------------------------------------------------------
// Commands sent from async world → background thread
// ---------------------------------------------------------------------------

enum CacheCmd {
    SaveThreads {
        viewer_id: Option<String>,
        threads: Vec<Thread>,
        reply: Reply<()>,
    },
    LoadThreads {
        reply: Reply<Vec<CachedThread>>,
    },
    ClearThreads {
        reply: Reply<usize>,
    },
    PutMessages {
        messages: Vec<Message>,
        reply: Reply<()>,
    },
    LoadMessages {
        thread_id: String,
        limit: u32,
        before: Option<PageCursor>,
        reply: Reply<Vec<Message>>,
    },
    GetMessage {
        thread_id: String,
        client_id: String,
        reply: Reply<Option<Message>>,
    },
    MessageCount {
        thread_id: String,
        reply: Reply<u32>,
    },
    PurgeSentBefore {
        cutoff: i64,
        reply: Reply<usize>,
    },
    InsertOutbox {
        entry: OutboxEntry,
        reply: Reply<bool>,
    },
    GetOutbox {
        client_id: String,
        reply: Reply<Option<OutboxEntry>>,
    },
    ListOutboxReady {
        now: i64,
        limit: u32,
        reply: Reply<Vec<OutboxEntry>>,
    },
    RecordOutboxFailure {
        client_id: String,
        attempts: u32,
        next_retry_at: i64,
        error: String,
        reply: Reply<bool>,
    },
    RemoveOutbox {
        client_id: String,
        reply: Reply<bool>,
    },
    GetMeta {
        key: String,
        reply: Reply<Option<String>>,
    },
    SetMeta {
        key: String,
        value: String,
        reply: Reply<()>,
    },
}

// ---------------------------------------------------------------------------
// CacheHandle: Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

/// Paging position in a thread: the oldest row already shown, keyed the
/// way the cache orders rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageCursor {
    pub order_key: i64,
    pub local_key: String,
}

impl PageCursor {
    pub fn of(message: &Message) -> Self {
        PageCursor {
            order_key: message.order_key(),
            local_key: message.local_key(),
        }
    }
}

#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::UnboundedSender<CacheCmd>,
}

impl CacheHandle {
    /// Open (or create) the cache database under the platform data dir and
    /// spawn the background thread.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(&Self::resolve_path())
    }

    /// Open (or create) `cache.db` inside `dir`.
    pub fn open_at(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;

        let conn = Connection::open(dir.join("cache.db"))?;
        // Acknowledged writes must survive a crash.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        Self::spawn(conn)
    }

    /// Throwaway database, used by tests and when no data dir is writable.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::spawn(Connection::open_in_memory()?)
    }

    fn spawn(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("turnover-cache".into())
            .spawn(move || Self::run_loop(conn, rx))?;

        Ok(CacheHandle { tx })
    }

    fn resolve_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("turnover-chat")
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> CacheCmd) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| StoreError::Unavailable)?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    // -- threads -------------------------------------------------------------

    /// Upsert whole thread records, stamped with the viewer they were
    /// fetched for.
    pub async fn save_threads(
        &self,
        viewer_id: Option<String>,
        threads: Vec<Thread>,
    ) -> Result<(), StoreError> {
        self.request(|reply| CacheCmd::SaveThreads {
            viewer_id,
            threads,
            reply,
        })
        .await
    }

    pub async fn load_threads(&self) -> Result<Vec<CachedThread>, StoreError> {
        self.request(|reply| CacheCmd::LoadThreads { reply }).await
    }

    /// Drop every cached thread. Returns the number removed.
    pub async fn clear_threads(&self) -> Result<usize, StoreError> {
        self.request(|reply| CacheCmd::ClearThreads { reply }).await
    }

    // -- messages ------------------------------------------------------------

    /// Full-record replace. A row sharing the local key or the
    /// `(thread_id, client_id)` pair is replaced, so an optimistic row
    /// re-keyed by its server id never leaves a twin behind.
    pub async fn put_messages(&self, messages: Vec<Message>) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Ok(());
        }
        self.request(|reply| CacheCmd::PutMessages { messages, reply })
            .await
    }

    /// Newest `limit` messages of a thread strictly older than `before` in
    /// `(order_key, local_key)` order, returned oldest first.
    pub async fn load_messages(
        &self,
        thread_id: &str,
        limit: u32,
        before: Option<PageCursor>,
    ) -> Result<Vec<Message>, StoreError> {
        let thread_id = thread_id.to_string();
        self.request(|reply| CacheCmd::LoadMessages {
            thread_id,
            limit,
            before,
            reply,
        })
        .await
    }

    pub async fn get_message(
        &self,
        thread_id: &str,
        client_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let thread_id = thread_id.to_string();
        let client_id = client_id.to_string();
        self.request(|reply| CacheCmd::GetMessage {
            thread_id,
            client_id,
            reply,
        })
        .await
    }

    pub async fn message_count(&self, thread_id: &str) -> Result<u32, StoreError> {
        let thread_id = thread_id.to_string();
        self.request(|reply| CacheCmd::MessageCount { thread_id, reply })
            .await
    }

    /// Delete `sent` messages ordered before `cutoff`. Other statuses are
    /// never touched.
    pub async fn purge_sent_before(&self, cutoff: i64) -> Result<usize, StoreError> {
        self.request(|reply| CacheCmd::PurgeSentBefore { cutoff, reply })
            .await
    }

    // -- outbox --------------------------------------------------------------

    /// Insert unless an entry with the same client id exists. Returns whether
    /// a row was written.
    pub async fn insert_outbox(&self, entry: OutboxEntry) -> Result<bool, StoreError> {
        self.request(|reply| CacheCmd::InsertOutbox { entry, reply })
            .await
    }

    pub async fn get_outbox(&self, client_id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        let client_id = client_id.to_string();
        self.request(|reply| CacheCmd::GetOutbox { client_id, reply })
            .await
    }

    pub async fn list_outbox_ready(
        &self,
        now: i64,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        self.request(|reply| CacheCmd::ListOutboxReady { now, limit, reply })
            .await
    }

    pub async fn record_outbox_failure(
        &self,
        client_id: &str,
        attempts: u32,
        next_retry_at: i64,
        error: String,
    ) -> Result<bool, StoreError> {
        let client_id = client_id.to_string();
        self.request(|reply| CacheCmd::RecordOutboxFailure {
            client_id,
            attempts,
            next_retry_at,
            error,
            reply,
        })
        .await
    }

    pub async fn remove_outbox(&self, client_id: &str) -> Result<bool, StoreError> {
        let client_id = client_id.to_string();
        self.request(|reply| CacheCmd::RemoveOutbox { client_id, reply })
            .await
    }

    // -- meta ----------------------------------------------------------------

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.request(|reply| CacheCmd::GetMeta { key, reply }).await
    }

    pub async fn set_meta(&self, key: &str, value: String) -> Result<(), StoreError> {
        let key = key.to_string();
        self.request(|reply| CacheCmd::SetMeta { key, value, reply })
            .await
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<CacheCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                CacheCmd::SaveThreads {
                    viewer_id,
                    threads,
                    reply,
                } => {
                    let _ = reply.send(Self::do_save_threads(&conn, viewer_id.as_deref(), &threads));
                }
                CacheCmd::LoadThreads { reply } => {
                    let _ = reply.send(Self::do_load_threads(&conn));
                }
                CacheCmd::ClearThreads { reply } => {
                    let _ = reply.send(
                        conn.execute("DELETE FROM threads", [])
                            .map_err(StoreError::from),
                    );
                }
                CacheCmd::PutMessages { messages, reply } => {
                    let _ = reply.send(Self::do_put_messages(&conn, &messages));
                }
                CacheCmd::LoadMessages {
                    thread_id,
                    limit,
                    before,
                    reply,
                } => {
                    let _ = reply.send(Self::do_load_messages(&conn, &thread_id, limit, before));
                }
                CacheCmd::GetMessage {
                    thread_id,
                    client_id,
                    reply,
                } => {
                    let _ = reply.send(Self::do_get_message(&conn, &thread_id, &client_id));
                }
                CacheCmd::MessageCount { thread_id, reply } => {
                    let _ = reply.send(
                        conn.query_row(
                            "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
                            [&thread_id],
                            |row| row.get(0),
                        )
                        .map_err(StoreError::from),
                    );
                }
                CacheCmd::PurgeSentBefore { cutoff, reply } => {
                    let _ = reply.send(
                        conn.execute(
                            "DELETE FROM messages WHERE status = 'sent' AND order_key < ?1",
                            [cutoff],
                        )
                        .map_err(StoreError::from),
                    );
                }
                CacheCmd::InsertOutbox { entry, reply } => {
                    let _ = reply.send(Self::do_insert_outbox(&conn, &entry));
                }
                CacheCmd::GetOutbox { client_id, reply } => {
                    let _ = reply.send(Self::do_get_outbox(&conn, &client_id));
                }
                CacheCmd::ListOutboxReady { now, limit, reply } => {
                    let _ = reply.send(Self::do_list_outbox_ready(&conn, now, limit));
                }
                CacheCmd::RecordOutboxFailure {
                    client_id,
                    attempts,
                    next_retry_at,
                    error,
                    reply,
                } => {
                    let _ = reply.send(
                        conn.execute(
                            "UPDATE outbox SET attempts = ?1, next_retry_at = ?2, last_error = ?3
                             WHERE client_id = ?4",
                            params![attempts, next_retry_at, error, client_id],
                        )
                        .map(|n| n > 0)
                        .map_err(StoreError::from),
                    );
                }
                CacheCmd::RemoveOutbox { client_id, reply } => {
                    let _ = reply.send(
                        conn.execute("DELETE FROM outbox WHERE client_id = ?1", [&client_id])
                            .map(|n| n > 0)
                            .map_err(StoreError::from),
                    );
                }
                CacheCmd::GetMeta { key, reply } => {
                    let _ = reply.send(
                        conn.query_row("SELECT value FROM meta WHERE key = ?1", [&key], |row| {
                            row.get(0)
                        })
                        .optional()
                        .map_err(StoreError::from),
                    );
                }
                CacheCmd::SetMeta { key, value, reply } => {
                    let _ = reply.send(
                        conn.execute(
                            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                            params![key, value],
                        )
                        .map(|_| ())
                        .map_err(StoreError::from),
                    );
                }
            }
        }
        log::debug!("Cache thread exiting");
    }

    // -- synchronous DB operations -------------------------------------------

    fn do_save_threads(
        conn: &Connection,
        viewer_id: Option<&str>,
        threads: &[Thread],
    ) -> Result<(), StoreError> {
        let tx = conn.unchecked_transaction()?;

        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO threads
                (id, tenant_id, viewer_id, property_id, status, last_message_at, updated_at, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;

        for t in threads {
            stmt.execute(params![
                t.id,
                t.tenant_id,
                viewer_id,
                t.property_id,
                t.status,
                t.last_message_at,
                t.updated_at,
                serde_json::to_string(&t.snapshot)?,
            ])?;
        }
        drop(stmt);

        tx.commit()?;
        Ok(())
    }

    fn do_load_threads(conn: &Connection) -> Result<Vec<CachedThread>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, viewer_id, property_id, status, last_message_at, updated_at, snapshot
             FROM threads
             ORDER BY COALESCE(last_message_at, updated_at) DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut threads = Vec::new();
        for row in rows {
            let (id, tenant_id, viewer_id, property_id, status, last_message_at, updated_at, snapshot) =
                row?;
            threads.push(CachedThread {
                thread: Thread {
                    id,
                    tenant_id,
                    property_id,
                    status,
                    last_message_at,
                    updated_at,
                    snapshot: serde_json::from_str(&snapshot)?,
                },
                viewer_id,
            });
        }
        Ok(threads)
    }

    fn do_put_messages(conn: &Connection, messages: &[Message]) -> Result<(), StoreError> {
        let tx = conn.unchecked_transaction()?;

        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO messages
                (local_key, thread_id, client_id, server_id, tenant_id, sender_id, body, kind,
                 client_created_at, server_created_at, order_key, status, attachment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;

        for m in messages {
            stmt.execute(params![
                m.local_key(),
                m.thread_id,
                m.client_id,
                m.server_id,
                m.tenant_id,
                m.sender_id,
                m.body,
                m.kind.as_str(),
                m.client_created_at,
                m.server_created_at,
                m.order_key(),
                m.status.as_str(),
                m.attachment,
            ])?;
        }
        drop(stmt);

        tx.commit()?;
        Ok(())
    }

    fn do_load_messages(
        conn: &Connection,
        thread_id: &str,
        limit: u32,
        before: Option<PageCursor>,
    ) -> Result<Vec<Message>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE thread_id = ?1
               AND (?2 IS NULL OR order_key < ?2 OR (order_key = ?2 AND local_key < ?3))
             ORDER BY order_key DESC, local_key DESC
             LIMIT ?4"
        ))?;

        let (order_key, local_key) = match before {
            Some(c) => (Some(c.order_key), Some(c.local_key)),
            None => (None, None),
        };
        let rows = stmt.query_map(params![thread_id, order_key, local_key, limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    fn do_get_message(
        conn: &Connection,
        thread_id: &str,
        client_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let result = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 AND client_id = ?2"
                ),
                params![thread_id, client_id],
                row_to_message,
            )
            .optional()?;
        Ok(result)
    }

    fn do_insert_outbox(conn: &Connection, entry: &OutboxEntry) -> Result<bool, StoreError> {
        let affected = conn.execute(
            "INSERT OR IGNORE INTO outbox
                (client_id, thread_id, body, composed_at, attempts, next_retry_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.client_id,
                entry.thread_id,
                entry.body,
                entry.composed_at,
                entry.attempts,
                entry.next_retry_at,
                entry.last_error,
            ],
        )?;
        Ok(affected > 0)
    }

    fn do_get_outbox(conn: &Connection, client_id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        let result = conn
            .query_row(
                &format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE client_id = ?1"),
                [client_id],
                row_to_outbox,
            )
            .optional()?;
        Ok(result)
    }

    fn do_list_outbox_ready(
        conn: &Connection,
        now: i64,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS}
             FROM outbox
             WHERE next_retry_at <= ?1
             ORDER BY composed_at ASC, client_id ASC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![now, limit], row_to_outbox)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(5)?;
    let status: String = row.get(9)?;
    Ok(Message {
        server_id: row.get(0)?,
        thread_id: row.get(1)?,
        tenant_id: row.get(2)?,
        sender_id: row.get(3)?,
        body: row.get(4)?,
        kind: MessageKind::parse(&kind),
        client_id: row.get(6)?,
        client_created_at: row.get(7)?,
        server_created_at: row.get(8)?,
        status: DeliveryStatus::parse(&status).unwrap_or(DeliveryStatus::Pending),
        attachment: row.get(10)?,
        superseded_server_ids: Default::default(),
    })
}

fn row_to_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        client_id: row.get(0)?,
        thread_id: row.get(1)?,
        body: row.get(2)?,
        composed_at: row.get(3)?,
        attempts: row.get(4)?,
        next_retry_at: row.get(5)?,
        last_error: row.get(6)?,
    })
}
