//! Storage contracts and the JSON-file implementation.
//!
//! Everything durable on the server goes through these three traits so the
//! backend can be swapped at boot (tests use small in-memory impls). The
//! shipped implementation is [`JsonStore`]: one JSON file per collection,
//! written temp-file + atomic rename.

mod json;

pub use json::JsonStore;

use chrono::{DateTime, Utc};
use cueproto::{
    DeployableContext, DeployableRecord, DeployableStatus, GlobalState, Hello, Rule,
    ShowLogicPackage, SignalDefinition,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable deployable records.
pub trait RegistryStore: Send + Sync {
    /// Create-or-refresh a record from a hello. First hello creates the
    /// record with status NEW; later hellos only refresh the mutable fields.
    fn upsert_from_hello(&self, hello: &Hello) -> StoreResult<DeployableRecord>;
    fn get_deployable(&self, id: &str) -> StoreResult<Option<DeployableRecord>>;
    fn list_deployables(&self) -> StoreResult<Vec<DeployableRecord>>;
    fn update_status(&self, id: &str, status: DeployableStatus) -> StoreResult<()>;
    fn update_assigned_logic(&self, id: &str, logic_id: &str) -> StoreResult<()>;
    fn update_logic_version(&self, id: &str, version: u32) -> StoreResult<()>;
    fn update_name_location(&self, id: &str, name: &str, location: &str) -> StoreResult<()>;
}

/// Append-only show-logic packages.
pub trait PackageStore: Send + Sync {
    fn save_package(&self, package: &ShowLogicPackage) -> StoreResult<()>;
    fn get_package(&self, package_id: &str) -> StoreResult<Option<ShowLogicPackage>>;
    /// Newest package for a logic id, resolved by max `created_at`.
    fn latest_for_logic(&self, logic_id: &str) -> StoreResult<Option<ShowLogicPackage>>;
    fn list_packages(&self) -> StoreResult<Vec<ShowLogicPackage>>;
}

/// Rules, cooldown journal, state snapshot, and routing catalogs.
pub trait RulesStore: Send + Sync {
    fn list_rules(&self) -> StoreResult<Vec<Rule>>;
    fn save_rules(&self, rules: &[Rule]) -> StoreResult<()>;

    fn load_state_snapshot(&self) -> StoreResult<Option<GlobalState>>;
    fn save_state_snapshot(&self, state: &GlobalState) -> StoreResult<()>;

    fn rule_last_fired(&self, rule_id: &str) -> StoreResult<Option<DateTime<Utc>>>;
    fn set_rule_last_fired(&self, rule_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    fn deployable_context(&self, id: &str) -> StoreResult<Option<DeployableContext>>;
    fn save_deployable_context(&self, context: &DeployableContext) -> StoreResult<()>;

    fn signal_definitions(&self, logic_id: &str) -> StoreResult<Option<Vec<SignalDefinition>>>;
    fn save_signal_definitions(
        &self,
        logic_id: &str,
        definitions: &[SignalDefinition],
    ) -> StoreResult<()>;
}
