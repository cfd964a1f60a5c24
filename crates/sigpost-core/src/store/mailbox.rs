//! Mailbox: per-client queues of commands and file transfers.
//!
//! Reads are destructive. A row handed out by a `take_*` call is deleted in
//! the same transaction, so every queued item is delivered at most once.

use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info};

use super::{Store, StoreError};
use crate::wire::StreamId;

/// The three per-client queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Commands,
    /// Files the server pushes to the client.
    Outbound,
    /// Files the server pulls from the client.
    Inbound,
}

impl Queue {
    const fn table(self) -> &'static str {
        match self {
            Queue::Commands => "command_pool",
            Queue::Outbound => "outbound_files",
            Queue::Inbound => "inbound_files",
        }
    }

    const fn column(self) -> &'static str {
        match self {
            Queue::Commands => "cmd",
            Queue::Outbound | Queue::Inbound => "filename",
        }
    }
}

/// Number of queued items per kind for one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Pending {
    pub commands: usize,
    pub outbound_files: usize,
    pub inbound_files: usize,
}

impl Pending {
    pub fn is_empty(&self) -> bool {
        self.commands == 0 && self.outbound_files == 0 && self.inbound_files == 0
    }
}

impl Store {
    /// Queue a command (stock name, stock code, or free-form text).
    pub fn enqueue_command(&self, id: StreamId, text: &str) -> Result<(), StoreError> {
        self.enqueue(Queue::Commands, id, text)
    }

    /// Queue a local file to be pushed to the client.
    pub fn enqueue_outbound_file(&self, id: StreamId, filename: &str) -> Result<(), StoreError> {
        self.enqueue(Queue::Outbound, id, filename)
    }

    /// Queue a request for the client to upload one of its files.
    pub fn enqueue_inbound_file(&self, id: StreamId, filename: &str) -> Result<(), StoreError> {
        self.enqueue(Queue::Inbound, id, filename)
    }

    fn enqueue(&self, queue: Queue, id: StreamId, value: &str) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (stream_id, {}) VALUES (?1, ?2)",
                queue.table(),
                queue.column()
            ),
            params![id, value],
        )?;
        debug!(stream_id = id, queue = queue.table(), "Queued mailbox entry");
        Ok(())
    }

    /// Remove and return every queued command for `id`, oldest first.
    pub fn take_commands(&self, id: StreamId) -> Result<Vec<String>, StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let commands = {
            let mut stmt =
                tx.prepare("SELECT cmd FROM command_pool WHERE stream_id = ?1 ORDER BY rowid")?;
            let rows = stmt.query_map(params![id], |row| row.get(0))?;
            rows.collect::<Result<Vec<String>, _>>()?
        };
        tx.execute("DELETE FROM command_pool WHERE stream_id = ?1", params![id])?;
        tx.commit()?;
        Ok(commands)
    }

    /// Remove and return the oldest queued outbound file for `id`.
    ///
    /// Later entries stay queued for later interactions.
    pub fn take_outbound_file(&self, id: StreamId) -> Result<Option<String>, StoreError> {
        self.take_oldest(Queue::Outbound, id)
    }

    /// Remove and return the oldest queued inbound file request for `id`.
    pub fn take_inbound_file(&self, id: StreamId) -> Result<Option<String>, StoreError> {
        self.take_oldest(Queue::Inbound, id)
    }

    fn take_oldest(&self, queue: Queue, id: StreamId) -> Result<Option<String>, StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let oldest: Option<(i64, String)> = tx
            .query_row(
                &format!(
                    "SELECT rowid, {} FROM {} WHERE stream_id = ?1 ORDER BY rowid LIMIT 1",
                    queue.column(),
                    queue.table()
                ),
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((rowid, value)) = oldest else {
            return Ok(None);
        };
        tx.execute(
            &format!("DELETE FROM {} WHERE rowid = ?1", queue.table()),
            params![rowid],
        )?;
        tx.commit()?;
        Ok(Some(value))
    }

    /// Count queued items for `id` without consuming them.
    pub fn pending(&self, id: StreamId) -> Result<Pending, StoreError> {
        let conn = self.lock_conn()?;
        let count = |queue: Queue| -> Result<usize, StoreError> {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE stream_id = ?1", queue.table()),
                params![id],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(n).unwrap_or_default())
        };
        Ok(Pending {
            commands: count(Queue::Commands)?,
            outbound_files: count(Queue::Outbound)?,
            inbound_files: count(Queue::Inbound)?,
        })
    }

    /// Clear every queue and the registry, then compact the database.
    pub fn purge_all(&self) -> Result<(), StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        for table in [
            "alive_clients",
            Queue::Commands.table(),
            Queue::Outbound.table(),
            Queue::Inbound.table(),
        ] {
            tx.execute(&format!("DELETE FROM {table}"), [])?;
        }
        tx.commit()?;
        conn.execute_batch("VACUUM;")?;
        info!("Store purged");
        Ok(())
    }
}
