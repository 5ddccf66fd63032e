//! StateStore: redb-backed state persistence for Switchyard.
//!
//! Provides typed operations over environments, the traffic singleton,
//! plans, verdicts, history, and leases. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Result of trying to take a lease.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Acquired(Lease),
    /// Someone else holds an unexpired lease.
    Busy(Lease),
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        txn.open_table(TRAFFIC).map_err(map_err!(Table))?;
        txn.open_table(TRAFFIC_REVISIONS).map_err(map_err!(Table))?;
        txn.open_table(PLANS).map_err(map_err!(Table))?;
        txn.open_table(HISTORY).map_err(map_err!(Table))?;
        txn.open_table(VERDICTS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    // ── Environments ───────────────────────────────────────────────

    /// Insert or update an environment record.
    pub fn put_environment(&self, env: &Environment) -> StateResult<()> {
        let key = env.id.to_string();
        self.put_json(ENVIRONMENTS, &key, env)?;
        debug!(%key, "environment stored");
        Ok(())
    }

    pub fn get_environment(&self, id: EnvironmentId) -> StateResult<Option<Environment>> {
        self.get_json(ENVIRONMENTS, &id.to_string())
    }

    pub fn list_environments(&self) -> StateResult<Vec<Environment>> {
        self.list_json(ENVIRONMENTS)
    }

    /// Ids of every registered environment.
    pub fn environment_ids(&self) -> StateResult<Vec<EnvironmentId>> {
        Ok(self.list_environments()?.into_iter().map(|e| e.id).collect())
    }

    /// Register an environment from static configuration.
    ///
    /// A fresh id is inserted as given. A known id keeps its deployed
    /// version, role, and health; only its endpoints are refreshed.
    pub fn register_environment(&self, env: &Environment) -> StateResult<Environment> {
        let key = env.id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let mut table = txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
            let existing: Option<Environment> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            let stored = match existing {
                Some(mut current) => {
                    current.endpoints = env.endpoints.clone();
                    current
                }
                None => env.clone(),
            };
            let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            stored
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// Atomically read-modify-write an environment record.
    pub fn update_environment(
        &self,
        id: EnvironmentId,
        update: impl FnOnce(&mut Environment),
    ) -> StateResult<Environment> {
        let key = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let env = {
            let mut table = txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
            let mut env: Environment = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("environment {key}"))),
            };
            update(&mut env);
            let bytes = serde_json::to_vec(&env).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            env
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(env)
    }

    // ── Traffic ────────────────────────────────────────────────────

    /// Read the committed TrafficState, if one was ever written.
    pub fn current_traffic(&self) -> StateResult<Option<TrafficState>> {
        self.get_json(TRAFFIC, CURRENT_TRAFFIC_KEY)
    }

    /// Write revision 1 if no TrafficState exists; otherwise return the
    /// existing one untouched.
    pub fn init_traffic(&self, weights: Weights, mode: TrafficMode, now: u64) -> StateResult<TrafficState> {
        check_weights(&weights)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let state = {
            let mut table = txn.open_table(TRAFFIC).map_err(map_err!(Table))?;
            let existing: Option<TrafficState> =
                match table.get(CURRENT_TRAFFIC_KEY).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            if let Some(existing) = existing {
                existing
            } else {
                let state = TrafficState {
                    weights,
                    mode,
                    revision: 1,
                    last_updated: now,
                };
                let bytes = serde_json::to_vec(&state).map_err(map_err!(Serialize))?;
                table
                    .insert(CURRENT_TRAFFIC_KEY, bytes.as_slice())
                    .map_err(map_err!(Write))?;
                let mut revisions = txn.open_table(TRAFFIC_REVISIONS).map_err(map_err!(Table))?;
                revisions
                    .insert(state.revision, bytes.as_slice())
                    .map_err(map_err!(Write))?;
                debug!(revision = state.revision, "traffic state initialized");
                state
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(state)
    }

    /// Compare-and-swap the TrafficState.
    ///
    /// Commits `weights` as revision `expected + 1` only if the stored
    /// revision is still `expected`. The singleton and the revision log
    /// are written in the same transaction.
    pub fn replace_traffic(
        &self,
        expected: Revision,
        weights: Weights,
        mode: TrafficMode,
        now: u64,
    ) -> StateResult<TrafficState> {
        check_weights(&weights)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let state = {
            let mut table = txn.open_table(TRAFFIC).map_err(map_err!(Table))?;
            let current: TrafficState = match table.get(CURRENT_TRAFFIC_KEY).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound("traffic state".to_string())),
            };
            if current.revision != expected {
                return Err(StateError::RevisionConflict {
                    expected,
                    actual: current.revision,
                });
            }
            let state = TrafficState {
                weights,
                mode,
                revision: current.revision + 1,
                last_updated: now,
            };
            let bytes = serde_json::to_vec(&state).map_err(map_err!(Serialize))?;
            table
                .insert(CURRENT_TRAFFIC_KEY, bytes.as_slice())
                .map_err(map_err!(Write))?;
            let mut revisions = txn.open_table(TRAFFIC_REVISIONS).map_err(map_err!(Table))?;
            revisions
                .insert(state.revision, bytes.as_slice())
                .map_err(map_err!(Write))?;
            state
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(revision = state.revision, "traffic state replaced");
        Ok(state)
    }

    /// Look up a previously applied revision.
    pub fn traffic_revision(&self, revision: Revision) -> StateResult<Option<TrafficState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRAFFIC_REVISIONS).map_err(map_err!(Table))?;
        match table.get(revision).map_err(map_err!(Read))? {
            Some(guard) => {
                let state: TrafficState =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Most recent revisions, newest first.
    pub fn list_traffic_revisions(&self, limit: usize) -> StateResult<Vec<TrafficState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRAFFIC_REVISIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let state: TrafficState =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(state);
        }
        Ok(results)
    }

    // ── Plans ──────────────────────────────────────────────────────

    /// Insert or update a migration plan.
    pub fn put_plan(&self, plan: &MigrationPlan) -> StateResult<()> {
        self.put_json(PLANS, &plan.id, plan)?;
        debug!(plan = %plan.id, status = ?plan.status, "plan stored");
        Ok(())
    }

    pub fn get_plan(&self, id: &str) -> StateResult<Option<MigrationPlan>> {
        self.get_json(PLANS, id)
    }

    /// All plans, oldest first.
    pub fn list_plans(&self) -> StateResult<Vec<MigrationPlan>> {
        let mut plans: Vec<MigrationPlan> = self.list_json(PLANS)?;
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    /// The most recently created plan.
    pub fn latest_plan(&self) -> StateResult<Option<MigrationPlan>> {
        Ok(self.list_plans()?.pop())
    }

    /// Plans persisted as Running.
    pub fn running_plans(&self) -> StateResult<Vec<MigrationPlan>> {
        Ok(self
            .list_plans()?
            .into_iter()
            .filter(|p| p.status == PlanStatus::Running)
            .collect())
    }

    // ── Verdicts ───────────────────────────────────────────────────

    /// Record the latest verdict for an environment.
    pub fn put_verdict(&self, verdict: &HealthVerdict) -> StateResult<()> {
        self.put_json(VERDICTS, &verdict.environment_id.to_string(), verdict)
    }

    /// Record a verdict and fold it into the environment's health and role.
    ///
    /// An unhealthy Active environment is demoted to Draining. A healthy
    /// environment carrying the largest share is promoted to Active when no
    /// plan is running; while a plan runs, roles belong to the planner.
    pub fn record_verdict(&self, verdict: &HealthVerdict) -> StateResult<Environment> {
        self.put_verdict(verdict)?;
        let id = verdict.environment_id;
        let promote = verdict.healthy
            && self
                .current_traffic()?
                .is_some_and(|t| t.heaviest_except(None) == Some(id))
            && self.running_plans()?.is_empty();

        let status = verdict.status();
        let at = verdict.evaluated_at;
        self.update_environment(id, |env| {
            env.health = status;
            env.updated_at = at;
            match env.role {
                EnvironmentRole::Active if !verdict.healthy => {
                    warn!(environment = %id, "active environment probed unhealthy, demoted to draining");
                    env.role = EnvironmentRole::Draining;
                }
                EnvironmentRole::Standby | EnvironmentRole::Draining if promote => {
                    info!(environment = %id, "serving environment probed healthy, now active");
                    env.role = EnvironmentRole::Active;
                }
                _ => {}
            }
        })
    }

    pub fn latest_verdict(&self, id: EnvironmentId) -> StateResult<Option<HealthVerdict>> {
        self.get_json(VERDICTS, &id.to_string())
    }

    pub fn list_verdicts(&self) -> StateResult<Vec<HealthVerdict>> {
        self.list_json(VERDICTS)
    }

    // ── History ────────────────────────────────────────────────────

    /// Append an entry; the store assigns the next sequence number.
    pub fn append_history(&self, mut entry: HistoryEntry) -> StateResult<HistoryEntry> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let next = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value() + 1)
                .unwrap_or(1);
            entry.sequence = next;
            let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
            table
                .insert(next, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(sequence = entry.sequence, operation = ?entry.operation, "history appended");
        Ok(entry)
    }

    /// The latest `limit` history entries in time order (oldest first).
    pub fn list_history(&self, limit: usize) -> StateResult<Vec<HistoryEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: HistoryEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        results.reverse();
        Ok(results)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Take the named lease if it is free, expired, or already ours.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: u64,
        ttl_ms: u64,
    ) -> StateResult<LeaseOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let existing: Option<Lease> = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            match existing {
                Some(lease) if lease.holder != holder && !lease.is_expired(now) => {
                    LeaseOutcome::Busy(lease)
                }
                previous => {
                    if let Some(stale) = previous.filter(|l| l.holder != holder) {
                        debug!(%name, holder = %stale.holder, "taking over expired lease");
                    }
                    let lease = Lease {
                        name: name.to_string(),
                        holder: holder.to_string(),
                        acquired_at: now,
                        expires_at: now.saturating_add(ttl_ms),
                    };
                    let bytes = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                    table
                        .insert(name, bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    LeaseOutcome::Acquired(lease)
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    /// Extend a lease we hold. Returns false if it is no longer ours.
    pub fn renew_lease(&self, name: &str, holder: &str, now: u64, ttl_ms: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let renewed = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let existing: Option<Lease> = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            match existing {
                Some(mut lease) if lease.holder == holder => {
                    lease.expires_at = now.saturating_add(ttl_ms);
                    let bytes = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                    table
                        .insert(name, bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(renewed)
    }

    /// Drop a lease we hold. Returns true if it was removed.
    pub fn release_lease(&self, name: &str, holder: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let ours = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    let lease: Lease =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    lease.holder == holder
                }
                None => false,
            };
            if ours {
                table.remove(name).map_err(map_err!(Write))?;
            }
            ours
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    pub fn get_lease(&self, name: &str) -> StateResult<Option<Lease>> {
        self.get_json(LEASES, name)
    }
}
