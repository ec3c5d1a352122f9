use tracing::instrument;

use robust_core::command::{Channel, MessageRecord};
use robust_core::deferred::DeferredIterable;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Persistent, indexed message cache keyed by message id.
/// Re-delivery of an id overwrites; nothing is ever deleted here.
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Idempotent overwrite by id.
    #[instrument(skip(self, msg), fields(id = %msg.id, target = %msg.target))]
    pub fn upsert(&self, msg: &MessageRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO messages (id, body, ts, target, sender)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    msg.id,
                    msg.body,
                    msg.ts,
                    msg.target.as_str(),
                    serde_json::to_string(&msg.from)?,
                ],
            )?;
            Ok(())
        })
    }

    /// Upsert a whole batch inside one transaction. All-or-nothing: either
    /// every record becomes durable, or the transaction rolls back and the
    /// storage error propagates with no partially-visible state.
    #[instrument(skip(self, msgs), fields(count = msgs.len()))]
    pub fn upsert_many(&self, msgs: &[MessageRecord]) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO messages (id, body, ts, target, sender)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for msg in msgs {
                stmt.execute(rusqlite::params![
                    msg.id,
                    msg.body,
                    msg.ts,
                    msg.target.as_str(),
                    serde_json::to_string(&msg.from)?,
                ])?;
            }
            Ok(())
        })
    }

    /// Get a single message by id.
    #[instrument(skip(self))]
    pub fn get(&self, id: &str) -> Result<MessageRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, body, ts, target, sender FROM messages WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// Count all cached messages.
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
        })
    }

    /// Drive a chronological cursor over one channel's records through the
    /// supplied iterable. Rows are read one at a time and pushed via
    /// `progress`; end-of-data resolves, a row error rejects. The caller
    /// must have chosen a consumption mode first.
    #[instrument(skip(self, iter), fields(target = %target))]
    pub fn scan_channel<R>(
        &self,
        target: &Channel,
        iter: &DeferredIterable<MessageRecord, R>,
    ) -> Result<(), StoreError> {
        let result = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, body, ts, target, sender FROM messages
                 WHERE target = ?1
                 ORDER BY ts ASC, target ASC",
            )?;
            let mut rows = stmt.query([target.as_str()])?;
            while let Some(row) = rows.next()? {
                let msg = row_to_message(row)?;
                iter.progress(msg)
                    .map_err(|e| StoreError::Cursor(e.to_string()))?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                iter.resolve();
                Ok(())
            }
            Err(e) => {
                iter.reject(e.to_string());
                Err(e)
            }
        }
    }

    /// Convenience built on the map mode of the iterable.
    pub async fn channel_messages(
        &self,
        target: &Channel,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let iter: DeferredIterable<MessageRecord, MessageRecord> = DeferredIterable::new();
        let completion = iter
            .map(|msg| msg)
            .map_err(|e| StoreError::Cursor(e.to_string()))?;
        self.scan_channel(target, &iter)?;
        completion
            .wait()
            .await
            .map_err(|e| StoreError::Cursor(e.to_string()))
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRecord, StoreError> {
    let sender_raw: String = row_helpers::get(row, 4, "messages", "sender")?;
    Ok(MessageRecord {
        id: row_helpers::get(row, 0, "messages", "id")?,
        body: row_helpers::get(row, 1, "messages", "body")?,
        ts: row_helpers::get(row, 2, "messages", "ts")?,
        target: Channel::new(row_helpers::get::<String>(row, 3, "messages", "target")?),
        from: row_helpers::parse_json(&sender_raw, "messages", "sender")?,
    })
}
