//! redb table definitions for the Switchyard state store.
//!
//! String-keyed tables hold JSON-serialized domain types. Revision and
//! history tables use `u64` keys so range scans come back in order.

use redb::TableDefinition;

/// Environment records keyed by environment id (`primary`, `replica-2`).
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

/// The singleton TrafficState under [`CURRENT_TRAFFIC_KEY`].
pub const TRAFFIC: TableDefinition<&str, &[u8]> = TableDefinition::new("traffic");

/// Every applied TrafficState keyed by revision.
pub const TRAFFIC_REVISIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("traffic_revisions");

/// Migration plans keyed by plan id.
pub const PLANS: TableDefinition<&str, &[u8]> = TableDefinition::new("plans");

/// Append-only deployment history keyed by sequence number.
pub const HISTORY: TableDefinition<u64, &[u8]> = TableDefinition::new("history");

/// Latest health verdict keyed by environment id.
pub const VERDICTS: TableDefinition<&str, &[u8]> = TableDefinition::new("verdicts");

/// Named leases (the global migration lock).
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

pub const CURRENT_TRAFFIC_KEY: &str = "current";
