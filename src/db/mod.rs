mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::lease::{LeaseStore, StoreError};
use crate::models::Lease;

/// SQLite-backed [`LeaseStore`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(default_path()?)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database lock poisoned".into()))
    }

    // ============================================================
    // Lease operations
    // ============================================================

    pub fn insert_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();

        conn.execute(
            "INSERT INTO leases (id, subject_id, start_at, end_at, created_at)
             VALUES (?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &lease.subject_id,
                lease.start.to_rfc3339(),
                lease.end.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ),
        )?;

        Ok(lease.clone().with_id(id))
    }

    pub fn get_all_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, subject_id, start_at, end_at
             FROM leases ORDER BY end_at",
        )?;

        let leases = stmt
            .query_map([], lease_from_row)?
            .filter_map(Result::transpose)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(leases)
    }

    pub fn get_leases_for_subject(&self, subject_id: &str) -> Result<Vec<Lease>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, subject_id, start_at, end_at
             FROM leases WHERE subject_id = ? ORDER BY end_at",
        )?;

        let leases = stmt
            .query_map([subject_id], lease_from_row)?
            .filter_map(Result::transpose)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(leases)
    }

    /// Delete a lease by id. Returns whether a row was removed.
    pub fn delete_lease(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM leases WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    /// Delete every lease held by a subject. Used when a lease has no id.
    pub fn delete_leases_for_subject(&self, subject_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM leases WHERE subject_id = ?", [subject_id])?;
        Ok(rows)
    }
}

impl LeaseStore for Database {
    fn add(&self, lease: &Lease) -> Result<Lease, StoreError> {
        self.insert_lease(lease)
    }

    fn list(&self) -> Result<Vec<Lease>, StoreError> {
        self.get_all_leases()
    }

    fn remove(&self, lease: &Lease) -> Result<(), StoreError> {
        let removed = match lease.id {
            Some(id) => self.delete_lease(id)?,
            None => self.delete_leases_for_subject(&lease.subject_id)? > 0,
        };
        if !removed {
            tracing::debug!(subject_id = %lease.subject_id, "lease already absent from store");
        }
        Ok(())
    }
}

fn default_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "sadako")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    Ok(dirs.data_dir().join("sadako.db"))
}

/// Decode a lease row. Rows whose id or timestamps cannot be read are
/// skipped rather than guessed at.
fn lease_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Lease>> {
    let id: String = row.get(0)?;
    let subject_id: String = row.get(1)?;
    let start: String = row.get(2)?;
    let end: String = row.get(3)?;

    match (Uuid::parse_str(&id), parse_datetime(&start), parse_datetime(&end)) {
        (Ok(id), Ok(start), Ok(end)) => Ok(Some(Lease {
            id: Some(id),
            subject_id,
            start,
            end,
        })),
        _ => {
            tracing::warn!(
                row_id = %id,
                subject_id = %subject_id,
                "skipping stored lease with unreadable id or timestamps"
            );
            Ok(None)
        }
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
