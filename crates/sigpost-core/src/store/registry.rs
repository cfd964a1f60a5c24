//! Client registry: who is alive and when we last heard from them.

use std::time::Duration;

use rusqlite::params;
use serde::Serialize;
use tracing::debug;

use super::{Store, StoreError, unix_now};
use crate::wire::StreamId;

/// One live client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientRecord {
    pub stream_id: StreamId,
    /// Seconds since the Unix epoch.
    pub last_seen: f64,
}

impl Store {
    /// Insert `id` with the current time.
    ///
    /// Returns `false` without touching the existing record if `id` is
    /// already registered.
    pub fn register(&self, id: StreamId) -> Result<bool, StoreError> {
        self.register_at(id, unix_now())
    }

    /// [`Store::register`] with an explicit timestamp.
    pub fn register_at(&self, id: StreamId, last_seen: f64) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO alive_clients (stream_id, last_seen) VALUES (?1, ?2)",
            params![id, last_seen],
        )?;
        if inserted == 1 {
            debug!(stream_id = id, "Registered client");
        }
        Ok(inserted == 1)
    }

    /// Refresh `last_seen` for a known client. Returns `false` if unknown.
    pub fn touch(&self, id: StreamId) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE alive_clients SET last_seen = ?1 WHERE stream_id = ?2",
            params![unix_now(), id],
        )?;
        Ok(updated == 1)
    }

    /// Whether `id` is currently registered.
    pub fn is_alive(&self, id: StreamId) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alive_clients WHERE stream_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Every registered client, ordered by id. Empty is a valid answer.
    pub fn list_alive(&self) -> Result<Vec<ClientRecord>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT stream_id, last_seen FROM alive_clients ORDER BY stream_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(ClientRecord {
                stream_id: row.get(0)?,
                last_seen: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Just the ids from [`Store::list_alive`].
    pub fn alive_ids(&self) -> Result<Vec<StreamId>, StoreError> {
        Ok(self
            .list_alive()?
            .into_iter()
            .map(|record| record.stream_id)
            .collect())
    }

    /// Remove `id`. Returns `true` if a record existed.
    pub fn remove(&self, id: StreamId) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM alive_clients WHERE stream_id = ?1",
            params![id],
        )?;
        Ok(removed > 0)
    }

    /// Evict every client silent for longer than `threshold`; returns their ids.
    pub fn sweep_stale(&self, threshold: Duration) -> Result<Vec<StreamId>, StoreError> {
        self.sweep_stale_at(threshold.as_secs_f64(), unix_now())
    }

    /// [`Store::sweep_stale`] against an explicit clock.
    ///
    /// A record is stale when `now - last_seen > threshold_secs`.
    pub fn sweep_stale_at(
        &self,
        threshold_secs: f64,
        now: f64,
    ) -> Result<Vec<StreamId>, StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let evicted = {
            let mut stmt = tx.prepare(
                "SELECT stream_id FROM alive_clients WHERE ?1 - last_seen > ?2 ORDER BY stream_id",
            )?;
            let ids = stmt.query_map(params![now, threshold_secs], |row| row.get(0))?;
            ids.collect::<Result<Vec<StreamId>, _>>()?
        };
        for id in &evicted {
            tx.execute(
                "DELETE FROM alive_clients WHERE stream_id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let store = store();
        assert!(store.register(12_344).unwrap());
        assert!(!store.register(12_344).unwrap());
        assert_eq!(store.list_alive().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_register_keeps_timestamp() {
        let store = store();
        store.register_at(8, 100.0).unwrap();
        assert!(!store.register_at(8, 200.0).unwrap());
        assert_eq!(store.list_alive().unwrap()[0].last_seen, 100.0);
    }

    #[test]
    fn test_touch_refreshes() {
        let store = store();
        store.register_at(8, 100.0).unwrap();
        assert!(store.touch(8).unwrap());
        assert!(store.list_alive().unwrap()[0].last_seen > 100.0);
        assert!(!store.touch(12).unwrap());
    }

    #[test]
    fn test_list_alive_empty_is_ok() {
        assert_eq!(store().list_alive().unwrap(), Vec::new());
    }

    #[test]
    fn test_remove() {
        let store = store();
        store.register(4).unwrap();
        assert!(store.is_alive(4).unwrap());
        assert!(store.remove(4).unwrap());
        assert!(!store.remove(4).unwrap());
        assert!(!store.is_alive(4).unwrap());
    }

    #[test]
    fn test_sweep_threshold_boundary() {
        let store = store();
        let now = 1_000_000.0;
        store.register_at(4, now - 61.0).unwrap();
        store.register_at(8, now - 59.0).unwrap();

        assert_eq!(store.sweep_stale_at(60.0, now).unwrap(), vec![4]);
        assert_eq!(store.alive_ids().unwrap(), vec![8]);

        // Sweeping again is a no-op.
        assert!(store.sweep_stale_at(60.0, now).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_with_wall_clock() {
        let store = store();
        store.register_at(4, unix_now() - 120.0).unwrap();
        store.register(8).unwrap();
        assert_eq!(store.sweep_stale(Duration::from_secs(60)).unwrap(), vec![4]);
    }
}
