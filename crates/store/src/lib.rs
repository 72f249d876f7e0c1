//! Durable reservation cache: id → {reservation, result?} pairs that survive
//! process restart. This store is the authority for "has this reservation
//! already been handled"; the provisioning chain leans on it for dedup.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use gridnode_core::types::{Reservation, ReservationResult};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::info;

/// A cached reservation paired with its result, if an attempt was made.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub reservation: Reservation,
    pub result: Option<ReservationResult>,
}

impl CacheEntry {
    /// True if the reservation was provisioned successfully and is still live.
    pub fn is_ok(&self) -> bool {
        self.result.as_ref().map(|r| r.is_ok()).unwrap_or(false)
    }
}

/// Sqlite-backed reservation store.
#[derive(Clone)]
pub struct ReservationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ReservationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open reservation store at {}", path.display()))?;
        Self::init_schema(&conn)?;

        info!("reservation store opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Ephemeral store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS reservations (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                workload_type TEXT NOT NULL,
                persistent INTEGER NOT NULL,
                reservation TEXT NOT NULL,
                result TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_workload_type ON reservations(workload_type)",
            [],
        )?;

        Ok(())
    }

    /// Record a reservation. A duplicate put is a no-op: the stored
    /// reservation and any result it already carries are left untouched.
    pub async fn put(&self, reservation: &Reservation) -> Result<()> {
        let conn = self.conn.lock().await;
        let json = serde_json::to_string(reservation)?;

        conn.execute(
            "INSERT INTO reservations (id, node_id, workload_type, persistent, reservation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO NOTHING",
            params![
                reservation.id,
                reservation.node_id,
                reservation.reservation_type.as_str(),
                reservation.persistent() as i64,
                json,
                reservation.created.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock().await;

        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT reservation, result FROM reservations WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(decode_entry).transpose()
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reservations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Attach a result to a cached reservation.
    pub async fn set_result(&self, result: &ReservationResult) -> Result<()> {
        let conn = self.conn.lock().await;
        let json = serde_json::to_string(result)?;

        let updated = conn.execute(
            "UPDATE reservations SET result = ?1 WHERE id = ?2",
            params![json, result.id],
        )?;
        if updated == 0 {
            bail!("no cached reservation for id '{}'", result.id);
        }

        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM reservations WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<CacheEntry>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare("SELECT reservation, result FROM reservations")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(decode_entry(row?)?);
        }
        Ok(entries)
    }

    /// Delete entries matching the predicate; returns how many were dropped.
    /// Used at first boot after an upgrade to shed non-persistent entries.
    pub async fn purge<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare("SELECT reservation, result FROM reservations")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut doomed = Vec::new();
        for row in rows {
            let entry = decode_entry(row?)?;
            if predicate(&entry) {
                doomed.push(entry.reservation.id);
            }
        }
        drop(stmt);

        for id in &doomed {
            conn.execute("DELETE FROM reservations WHERE id = ?1", params![id])?;
        }

        if !doomed.is_empty() {
            info!("purged {} reservation cache entries", doomed.len());
        }
        Ok(doomed.len())
    }
}

fn decode_entry((reservation, result): (String, Option<String>)) -> Result<CacheEntry> {
    let reservation: Reservation =
        serde_json::from_str(&reservation).context("corrupt cached reservation")?;
    let result = result
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("corrupt cached result")?;
    Ok(CacheEntry {
        reservation,
        result,
    })
}
