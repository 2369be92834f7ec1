// 🗄️ SQLite Snapshot Store
// Every upload is an immutable run; download returns the latest one.
// An append-only events table keeps the audit trail (uploads, imports,
// run reports).

use crate::cluster::{CancelledItem, Cluster};
use crate::sources::SnapshotStore;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

const ACTOR: &str = "shipment-recon";

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// One stored upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub uploaded_at: DateTime<Utc>,
    pub cluster_count: i64,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT UNIQUE NOT NULL,
            uploaded_at TEXT NOT NULL,
            cluster_count INTEGER NOT NULL
        )",
        [],
    )?;

    // Set-valued columns hold JSON arrays
    conn.execute(
        "CREATE TABLE IF NOT EXISTS clusters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL REFERENCES runs(run_id),
            position INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            buying_group TEXT NOT NULL,
            trackings TEXT NOT NULL,
            orders TEXT NOT NULL,
            purchase_orders TEXT NOT NULL,
            email_ids TEXT NOT NULL,
            non_reimbursed_trackings TEXT NOT NULL,
            cancelled_items TEXT NOT NULL,
            expected_cost REAL NOT NULL,
            tracked_cost REAL NOT NULL,
            adjustment REAL NOT NULL,
            manual_override INTEGER NOT NULL,
            verified INTEGER NOT NULL,
            below_cost INTEGER NOT NULL,
            notes TEXT NOT NULL,
            last_ship_date TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clusters_run ON clusters(run_id, position)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clusters_fingerprint ON clusters(fingerprint)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// EVENT LOG
// ============================================================================

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

fn parse_timestamp(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn parse_json<T: DeserializeOwned>(row: &Row<'_>, column: usize) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(column, e))
}

pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: parse_json(row, 5)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// RUNS
// ============================================================================

/// Most recent uploads first
pub fn get_run_history(conn: &Connection, limit: usize) -> Result<Vec<RunInfo>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, uploaded_at, cluster_count
         FROM runs
         ORDER BY id DESC
         LIMIT ?1",
    )?;

    let runs = stmt
        .query_map(params![limit as i64], |row| {
            Ok(RunInfo {
                run_id: row.get(0)?,
                uploaded_at: parse_timestamp(row, 1)?,
                cluster_count: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(runs)
}

pub fn get_latest_run(conn: &Connection) -> Result<Option<RunInfo>> {
    Ok(get_run_history(conn, 1)?.into_iter().next())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode column")
}

fn insert_cluster(conn: &Connection, run_id: &str, position: usize, cluster: &Cluster) -> Result<()> {
    conn.execute(
        "INSERT INTO clusters (
            run_id, position, fingerprint, buying_group,
            trackings, orders, purchase_orders, email_ids,
            non_reimbursed_trackings, cancelled_items,
            expected_cost, tracked_cost, adjustment,
            manual_override, verified, below_cost, notes, last_ship_date
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            run_id,
            position as i64,
            cluster.fingerprint(),
            cluster.group,
            to_json(&cluster.trackings)?,
            to_json(&cluster.orders)?,
            to_json(&cluster.purchase_orders)?,
            to_json(&cluster.email_ids)?,
            to_json(&cluster.non_reimbursed_trackings)?,
            to_json(&cluster.cancelled_items)?,
            cluster.expected_cost,
            cluster.tracked_cost,
            cluster.adjustment,
            cluster.manual_override,
            cluster.verified,
            cluster.below_cost,
            cluster.notes,
            cluster.last_ship_date.map(|d| d.format("%Y-%m-%d").to_string()),
        ],
    )?;

    Ok(())
}

pub fn get_run_clusters(conn: &Connection, run_id: &str) -> Result<Vec<Cluster>> {
    let mut stmt = conn.prepare(
        "SELECT buying_group, trackings, orders, purchase_orders, email_ids,
                non_reimbursed_trackings, cancelled_items,
                expected_cost, tracked_cost, adjustment,
                manual_override, verified, below_cost, notes, last_ship_date
         FROM clusters
         WHERE run_id = ?1
         ORDER BY position",
    )?;

    let clusters = stmt
        .query_map(params![run_id], |row| {
            let last_ship_date: Option<String> = row.get(14)?;
            let last_ship_date = last_ship_date
                .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
                .transpose()
                .map_err(|e| conversion_error(14, e))?;

            Ok(Cluster {
                group: row.get(0)?,
                trackings: parse_json::<BTreeSet<String>>(row, 1)?,
                orders: parse_json(row, 2)?,
                purchase_orders: parse_json(row, 3)?,
                email_ids: parse_json(row, 4)?,
                non_reimbursed_trackings: parse_json(row, 5)?,
                cancelled_items: parse_json::<Vec<CancelledItem>>(row, 6)?,
                expected_cost: row.get(7)?,
                tracked_cost: row.get(8)?,
                adjustment: row.get(9)?,
                manual_override: row.get(10)?,
                verified: row.get(11)?,
                below_cost: row.get(12)?,
                notes: row.get(13)?,
                last_ship_date,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(clusters)
}

// ============================================================================
// STORE
// ============================================================================

pub struct SqliteSnapshotStore {
    conn: Connection,
}

impl SqliteSnapshotStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn).context("Failed to initialize snapshot schema")?;
        Ok(SqliteSnapshotStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn history(&self, limit: usize) -> Result<Vec<RunInfo>> {
        get_run_history(&self.conn, limit)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn download(&self) -> Result<Vec<Cluster>> {
        match get_latest_run(&self.conn)? {
            Some(run) => {
                debug!(run_id = %run.run_id, clusters = run.cluster_count, "loading latest run");
                get_run_clusters(&self.conn, &run.run_id)
            }
            None => Ok(Vec::new()),
        }
    }

    /// All-or-nothing: a failed upload leaves the previous run as latest
    fn upload(&mut self, clusters: &[Cluster]) -> Result<()> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO runs (run_id, uploaded_at, cluster_count) VALUES (?1, ?2, ?3)",
            params![run_id, Utc::now().to_rfc3339(), clusters.len() as i64],
        )?;

        for (position, cluster) in clusters.iter().enumerate() {
            insert_cluster(&tx, &run_id, position, cluster)?;
        }

        let event = Event::new(
            "snapshot_uploaded",
            "run",
            &run_id,
            serde_json::json!({ "cluster_count": clusters.len() }),
            ACTOR,
        );
        insert_event(&tx, &event)?;

        tx.commit().context("Failed to commit snapshot upload")?;
        debug!(run_id = %run_id, clusters = clusters.len(), "stored run");
        Ok(())
    }

    fn record_event(&mut self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let entity_id = get_latest_run(&self.conn)?
            .map(|run| run.run_id)
            .unwrap_or_default();
        insert_event(&self.conn, &Event::new(event_type, "run", &entity_id, data, ACTOR))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_cluster(tracking: &str, order: &str) -> Cluster {
        let mut cluster = Cluster::new("usa");
        cluster.trackings.insert(tracking.to_string());
        cluster.orders.insert(order.to_string());
        cluster.expected_cost = 10.0;
        cluster.tracked_cost = 9.5;
        cluster
    }

    #[test]
    fn test_empty_store_downloads_nothing() {
        let store = SqliteSnapshotStore::in_memory().unwrap();

        assert!(store.download().unwrap().is_empty());
        assert!(store.history(10).unwrap().is_empty());
    }

    #[test]
    fn test_upload_then_download_keeps_order_and_fields() {
        let mut store = SqliteSnapshotStore::in_memory().unwrap();
        let mut second = create_test_cluster("1Z2", "O2");
        second.verified = true;
        second.notes = "ok".to_string();
        second.last_ship_date = NaiveDate::from_ymd_opt(2024, 5, 1);
        second.cancelled_items.push(CancelledItem {
            order_id: "O2".to_string(),
            description: "Widget".to_string(),
            quantity: 1,
        });
        let clusters = vec![create_test_cluster("1Z9", "O9"), second];

        store.upload(&clusters).unwrap();
        let downloaded = store.download().unwrap();

        assert_eq!(downloaded, clusters);
    }

    #[test]
    fn test_download_returns_latest_run() {
        let mut store = SqliteSnapshotStore::in_memory().unwrap();

        store.upload(&[create_test_cluster("1Z1", "O1")]).unwrap();
        store
            .upload(&[create_test_cluster("1Z2", "O2"), create_test_cluster("1Z3", "O3")])
            .unwrap();

        let downloaded = store.download().unwrap();
        assert_eq!(downloaded.len(), 2);
        assert!(downloaded[0].trackings.contains("1Z2"));

        let history = store.history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].cluster_count, 2);
    }

    #[test]
    fn test_upload_writes_audit_event() {
        let mut store = SqliteSnapshotStore::in_memory().unwrap();
        store.upload(&[create_test_cluster("1Z1", "O1")]).unwrap();
        store
            .record_event("reconciliation_run", serde_json::json!({ "clusters": 1 }))
            .unwrap();

        let run = get_latest_run(store.connection()).unwrap().unwrap();
        let events = get_events_for_entity(store.connection(), "run", &run.run_id).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "reconciliation_run");
        assert_eq!(events[1].event_type, "snapshot_uploaded");
        assert_eq!(events[1].data["cluster_count"], 1);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.db");

        {
            let mut store = SqliteSnapshotStore::open(&path).unwrap();
            store.upload(&[create_test_cluster("1Z1", "O1")]).unwrap();
        }

        let store = SqliteSnapshotStore::open(&path).unwrap();
        assert_eq!(store.download().unwrap().len(), 1);
    }
}
