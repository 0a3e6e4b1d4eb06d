//! Job, bridge, and key persistence
//!
//! The monitor reads three things from storage: the set of persisted jobs at
//! startup, bridge URLs during feed resolution, and the oracle's own signing
//! address. Each is a trait so the surrounding node can bring its own
//! storage; [`SqliteStore`] is the bundled implementation.

use std::path::Path;
use std::sync::Mutex;

use ethers_core::types::Address;
use rusqlite::{params, Connection, OptionalExtension};
use url::Url;

use crate::models::{Bridge, BridgeName, InitiatorType, JobId, JobSpec};

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Conflict(String),
    InvalidJob(String),
    Database(String),
    Serialization(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "{} not found", what),
            StoreError::Conflict(msg) => write!(f, "conflict: {}", msg),
            StoreError::InvalidJob(msg) => write!(f, "invalid job: {}", msg),
            StoreError::Database(msg) => write!(f, "database error: {}", msg),
            StoreError::Serialization(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

/// Read-only bridge lookup used during feed resolution.
pub trait BridgeStore: Send + Sync {
    fn find_bridge(&self, name: &BridgeName) -> Result<Bridge, StoreError>;
}

/// Source of persisted jobs at service startup.
pub trait JobStore: Send + Sync {
    /// All unarchived jobs carrying at least one flux-monitor initiator.
    fn flux_monitor_jobs(&self) -> Result<Vec<JobSpec>, StoreError>;
}

/// Access to the oracle identity this node submits as.
pub trait KeyStore: Send + Sync {
    fn oracle_address(&self) -> Result<Address, StoreError>;
}

/// Keystore backed by a single fixed address.
#[derive(Debug, Clone)]
pub struct LocalKeyStore {
    address: Address,
}

impl LocalKeyStore {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

impl KeyStore for LocalKeyStore {
    fn oracle_address(&self) -> Result<Address, StoreError> {
        Ok(self.address)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bridges (
    name          TEXT PRIMARY KEY,
    url           TEXT NOT NULL,
    confirmations INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS jobs (
    id       TEXT PRIMARY KEY,
    spec     TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0
);
";

/// SQLite-backed job and bridge store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Register a new bridge. Names are unique; re-creating an existing
    /// bridge is a conflict, not an upsert.
    pub fn create_bridge(&self, bridge: &Bridge) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM bridges WHERE name = ?1",
                params![bridge.name.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Conflict(format!(
                "bridge {} already exists",
                bridge.name
            )));
        }

        conn.execute(
            "INSERT INTO bridges (name, url, confirmations) VALUES (?1, ?2, ?3)",
            params![bridge.name.as_str(), bridge.url.as_str(), bridge.confirmations],
        )?;
        Ok(())
    }

    /// Update the mutable attributes of an existing bridge.
    pub fn update_bridge(&self, bridge: &Bridge) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE bridges SET url = ?2, confirmations = ?3 WHERE name = ?1",
            params![bridge.name.as_str(), bridge.url.as_str(), bridge.confirmations],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("bridge {}", bridge.name)));
        }
        Ok(())
    }

    /// Remove a bridge. Refused while any persisted job still references it
    /// from a feed list.
    pub fn delete_bridge(&self, name: &BridgeName) -> Result<(), StoreError> {
        if self.any_job_references_bridge(name)? {
            return Err(StoreError::Conflict(format!(
                "bridge {} is referenced by existing jobs",
                name
            )));
        }

        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM bridges WHERE name = ?1", params![name.as_str()])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("bridge {}", name)));
        }
        Ok(())
    }

    /// Persist a job spec. The id is required.
    pub fn create_job(&self, job: &JobSpec) -> Result<(), StoreError> {
        let id = job
            .id
            .as_ref()
            .ok_or_else(|| StoreError::InvalidJob("job has no id".to_string()))?;
        let spec = serde_json::to_string(job)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (id, spec, archived) VALUES (?1, ?2, 0)",
            params![id.0, spec],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(format!("job {} already exists", id))
            }
            other => StoreError::from(other),
        })?;
        Ok(())
    }

    /// Mark a job archived; it no longer appears in startup listings.
    pub fn archive_job(&self, id: &JobId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute("UPDATE jobs SET archived = 1 WHERE id = ?1", params![id.0])?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    fn all_jobs(&self) -> Result<Vec<JobSpec>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT spec FROM jobs WHERE archived = 0")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut jobs = Vec::new();
        for row in rows {
            let spec = row?;
            match serde_json::from_str::<JobSpec>(&spec) {
                Ok(job) => jobs.push(job),
                Err(e) => log::warn!("skipping unparseable job spec: {}", e),
            }
        }
        Ok(jobs)
    }

    fn any_job_references_bridge(&self, name: &BridgeName) -> Result<bool, StoreError> {
        for job in self.all_jobs()? {
            for initr in &job.initiators {
                let feeds = match initr.params.feeds.as_array() {
                    Some(feeds) => feeds,
                    None => continue,
                };
                for feed in feeds {
                    let referenced = feed
                        .get("bridge")
                        .and_then(|b| b.as_str())
                        .map(|b| b.eq_ignore_ascii_case(name.as_str()))
                        .unwrap_or(false);
                    if referenced {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

impl BridgeStore for SqliteStore {
    fn find_bridge(&self, name: &BridgeName) -> Result<Bridge, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String, u32)> = conn
            .query_row(
                "SELECT name, url, confirmations FROM bridges WHERE name = ?1",
                params![name.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (name, url, confirmations) =
            row.ok_or_else(|| StoreError::NotFound(format!("bridge {}", name)))?;

        let name = BridgeName::new(&name)
            .map_err(|e| StoreError::Database(format!("stored bridge name invalid: {}", e)))?;
        let url = Url::parse(&url)
            .map_err(|e| StoreError::Database(format!("stored bridge URL invalid: {}", e)))?;

        Ok(Bridge {
            name,
            url,
            confirmations,
        })
    }
}

impl JobStore for SqliteStore {
    fn flux_monitor_jobs(&self) -> Result<Vec<JobSpec>, StoreError> {
        Ok(self
            .all_jobs()?
            .into_iter()
            .filter(|job| !job.initiators_for(InitiatorType::FluxMonitor).is_empty())
            .collect())
    }
}
