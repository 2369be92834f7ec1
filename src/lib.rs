// Shipment Reconciliation - Core Library
// Exposes all modules for use in the CLI and tests

pub mod cluster;  // Cluster identity, tracking groups, group filter
pub mod sources;  // Collaborator traits + in-memory implementations
pub mod merge;    // Cluster arena and merge passes
pub mod costs;    // Expected / tracked cost attribution, review status
pub mod snapshot; // Human-edit import from the previous export
pub mod ranking;  // Presentation order
pub mod pipeline; // End-to-end run
pub mod config;
pub mod loader;   // CSV-backed sources
pub mod sheet;    // Review sheet CSV + CSV snapshot store
pub mod db;       // SQLite snapshot store + audit events
pub mod logging;

// Re-export commonly used types
pub use cluster::{CancelledItem, Cluster, GroupFilter, TrackingGroup};
pub use sources::{
    CancellationSource, CarrierCosts, CarrierDataSource, MemorySnapshotStore, OrderInfo,
    OrderInfoSource, PurchaseOrderSource, SnapshotStore, TrackingTuple,
};
pub use merge::{ClusterArena, ClusterId, MergeReport};
pub use costs::{CostReconciler, ReviewStatus, StatusThresholds};
pub use snapshot::{ImportReport, SnapshotImporter};
pub use ranking::{compare, rank};
pub use pipeline::{reconcile, ReconcileInputs, Reconciler, Reconciliation, RunReport, Sources};
pub use config::{Config, SnapshotBackend};
pub use sheet::{CsvSnapshotStore, SheetRow};
pub use db::{Event, RunInfo, SqliteSnapshotStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
