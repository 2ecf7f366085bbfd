//! SQLite persistence for the rendezvous tables.
//!
//! Dead drops exist so an offline peer's counterpart can pick up routing
//! hints later — losing them on restart would defeat that, so the daily
//! and hourly tables are mirrored to disk. Writes are best-effort: a
//! failed write is logged by the caller and the in-memory table stays
//! authoritative for the life of the process.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};

use super::{DailyEntry, HourlyEntry};

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS rendezvous_daily (
    point      TEXT NOT NULL,
    peer_id    TEXT NOT NULL,
    relay_id   TEXT,
    dead_drop  BLOB,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (point, peer_id)
);
CREATE INDEX IF NOT EXISTS idx_daily_expires ON rendezvous_daily (expires_at);

CREATE TABLE IF NOT EXISTS rendezvous_hourly (
    token      TEXT NOT NULL,
    peer_id    TEXT NOT NULL,
    relay_id   TEXT,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (token, peer_id)
);
CREATE INDEX IF NOT EXISTS idx_hourly_expires ON rendezvous_hourly (expires_at);
";

/// SQLite-backed mirror of the rendezvous tables.
pub struct RendezvousStore {
    conn: Mutex<Connection>,
}

impl RendezvousStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_daily(
        &self,
        point: &str,
        peer_id: &str,
        relay_id: Option<&str>,
        dead_drop: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO rendezvous_daily (point, peer_id, relay_id, dead_drop, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (point, peer_id) DO UPDATE SET
                 relay_id = excluded.relay_id,
                 dead_drop = excluded.dead_drop,
                 expires_at = excluded.expires_at",
            params![
                point,
                peer_id,
                relay_id,
                dead_drop.map(str::as_bytes),
                expires_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn upsert_hourly(
        &self,
        token: &str,
        peer_id: &str,
        relay_id: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO rendezvous_hourly (token, peer_id, relay_id, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (token, peer_id) DO UPDATE SET
                 relay_id = excluded.relay_id,
                 expires_at = excluded.expires_at",
            params![token, peer_id, relay_id, expires_at.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Delete every row for `peer_id` in both tables.
    pub fn remove_peer(&self, peer_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM rendezvous_daily WHERE peer_id = ?1",
            params![peer_id],
        )?;
        conn.execute(
            "DELETE FROM rendezvous_hourly WHERE peer_id = ?1",
            params![peer_id],
        )?;
        Ok(())
    }

    /// Delete a peer's hourly rows only (disconnect path).
    pub fn remove_peer_hourly(&self, peer_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM rendezvous_hourly WHERE peer_id = ?1",
            params![peer_id],
        )?;
        Ok(())
    }

    /// Delete rows past their expiry. Uses the `expires_at` indexes.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> rusqlite::Result<usize> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let millis = now.timestamp_millis();
        let daily = conn.execute(
            "DELETE FROM rendezvous_daily WHERE expires_at < ?1",
            params![millis],
        )?;
        let hourly = conn.execute(
            "DELETE FROM rendezvous_hourly WHERE expires_at < ?1",
            params![millis],
        )?;
        Ok(daily + hourly)
    }

    /// Load every unexpired row, for startup restore.
    #[allow(clippy::type_complexity)]
    pub fn load_unexpired(
        &self,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<(Vec<(String, DailyEntry)>, Vec<(String, HourlyEntry)>)> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let millis = now.timestamp_millis();

        let mut daily_stmt = conn.prepare(
            "SELECT point, peer_id, relay_id, dead_drop, expires_at
             FROM rendezvous_daily WHERE expires_at >= ?1",
        )?;
        let daily = daily_stmt
            .query_map(params![millis], |row| {
                let point: String = row.get(0)?;
                let dead_drop: Option<Vec<u8>> = row.get(3)?;
                let expires_millis: i64 = row.get(4)?;
                Ok((
                    point,
                    DailyEntry {
                        peer_id: row.get(1)?,
                        relay_id: row.get(2)?,
                        dead_drop: dead_drop.map(|b| String::from_utf8_lossy(&b).into_owned()),
                        expires_at: millis_to_datetime(expires_millis),
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut hourly_stmt = conn.prepare(
            "SELECT token, peer_id, relay_id, expires_at
             FROM rendezvous_hourly WHERE expires_at >= ?1",
        )?;
        let hourly = hourly_stmt
            .query_map(params![millis], |row| {
                let token: String = row.get(0)?;
                let expires_millis: i64 = row.get(3)?;
                Ok((
                    token,
                    HourlyEntry {
                        peer_id: row.get(1)?,
                        relay_id: row.get(2)?,
                        expires_at: millis_to_datetime(expires_millis),
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((daily, hourly))
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}
