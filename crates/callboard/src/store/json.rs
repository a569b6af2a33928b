//! JSON-file store: one file per collection under the data directory.
//!
//! Writes are temp-file + atomic rename so a crash mid-write never leaves a
//! torn collection. Reads go back to disk each time; the collections are
//! small and the simplicity buys read-after-write consistency for any
//! process that restarts and re-reads the snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use cueproto::{
    DeployableContext, DeployableRecord, DeployableStatus, GlobalState, Hello, Rule,
    ShowLogicPackage, SignalDefinition,
};
use serde::{de::DeserializeOwned, Serialize};

use super::{PackageStore, RegistryStore, RulesStore, StoreError, StoreResult};

pub struct JsonStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Open (and create) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn read<T: DeserializeOwned + Default>(&self, file: &str) -> StoreResult<T> {
        read_json_or_default(&self.path(file))
    }

    fn write<T: Serialize>(&self, file: &str, value: &T) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        write_json_atomic(&self.path(file), value)
    }

    fn mutate_deployable(
        &self,
        id: &str,
        apply: impl FnOnce(&mut DeployableRecord),
    ) -> StoreResult<()> {
        let mut records: HashMap<String, DeployableRecord> = self.read(DEPLOYABLES)?;
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| DeployableRecord::new(id));
        apply(record);
        self.write(DEPLOYABLES, &records)
    }
}

const DEPLOYABLES: &str = "deployables.json";
const PACKAGES: &str = "packages.json";
const RULES: &str = "rules.json";
const STATE: &str = "state.json";
const COOLDOWNS: &str = "cooldowns.json";
const CONTEXTS: &str = "contexts.json";
const SIGNAL_DEFS: &str = "signal_defs.json";

impl RegistryStore for JsonStore {
    fn upsert_from_hello(&self, hello: &Hello) -> StoreResult<DeployableRecord> {
        let mut records: HashMap<String, DeployableRecord> = self.read(DEPLOYABLES)?;
        let record = records
            .entry(hello.device_id.clone())
            .or_insert_with(|| DeployableRecord::new(&hello.device_id));
        record.last_seen = Utc::now();
        record.capabilities = hello.capabilities.clone();
        record.agent_version = hello.agent_version.clone();
        if !hello.assigned_logic_id.is_empty() && record.assigned_logic_id.is_empty() {
            record.assigned_logic_id = hello.assigned_logic_id.clone();
            record.status = DeployableStatus::Assigned;
        }
        let snapshot = record.clone();
        self.write(DEPLOYABLES, &records)?;
        Ok(snapshot)
    }

    fn get_deployable(&self, id: &str) -> StoreResult<Option<DeployableRecord>> {
        let records: HashMap<String, DeployableRecord> = self.read(DEPLOYABLES)?;
        Ok(records.get(id).cloned())
    }

    fn list_deployables(&self) -> StoreResult<Vec<DeployableRecord>> {
        let records: HashMap<String, DeployableRecord> = self.read(DEPLOYABLES)?;
        let mut list: Vec<DeployableRecord> = records.into_values().collect();
        list.sort_by(|a, b| a.deployable_id.cmp(&b.deployable_id));
        Ok(list)
    }

    fn update_status(&self, id: &str, status: DeployableStatus) -> StoreResult<()> {
        self.mutate_deployable(id, |record| record.status = status)
    }

    fn update_assigned_logic(&self, id: &str, logic_id: &str) -> StoreResult<()> {
        self.mutate_deployable(id, |record| {
            record.assigned_logic_id = logic_id.to_string()
        })
    }

    fn update_logic_version(&self, id: &str, version: u32) -> StoreResult<()> {
        self.mutate_deployable(id, |record| record.logic_version = version)
    }

    fn update_name_location(&self, id: &str, name: &str, location: &str) -> StoreResult<()> {
        self.mutate_deployable(id, |record| {
            if !name.is_empty() {
                record.name = name.to_string();
            }
            if !location.is_empty() {
                record.location = location.to_string();
            }
        })
    }
}

impl PackageStore for JsonStore {
    fn save_package(&self, package: &ShowLogicPackage) -> StoreResult<()> {
        let mut packages: Vec<ShowLogicPackage> = self.read(PACKAGES)?;
        packages.push(package.clone());
        self.write(PACKAGES, &packages)
    }

    fn get_package(&self, package_id: &str) -> StoreResult<Option<ShowLogicPackage>> {
        let packages: Vec<ShowLogicPackage> = self.read(PACKAGES)?;
        Ok(packages.into_iter().find(|p| p.package_id == package_id))
    }

    fn latest_for_logic(&self, logic_id: &str) -> StoreResult<Option<ShowLogicPackage>> {
        let packages: Vec<ShowLogicPackage> = self.read(PACKAGES)?;
        Ok(packages
            .into_iter()
            .filter(|p| p.logic_id == logic_id)
            .max_by_key(|p| p.created_at))
    }

    fn list_packages(&self) -> StoreResult<Vec<ShowLogicPackage>> {
        self.read(PACKAGES)
    }
}

impl RulesStore for JsonStore {
    fn list_rules(&self) -> StoreResult<Vec<Rule>> {
        let mut rules: Vec<Rule> = self.read(RULES)?;
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    fn save_rules(&self, rules: &[Rule]) -> StoreResult<()> {
        self.write(RULES, &rules.to_vec())
    }

    fn load_state_snapshot(&self) -> StoreResult<Option<GlobalState>> {
        let path = self.path(STATE);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn save_state_snapshot(&self, state: &GlobalState) -> StoreResult<()> {
        self.write(STATE, state)
    }

    fn rule_last_fired(&self, rule_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let cooldowns: HashMap<String, DateTime<Utc>> = self.read(COOLDOWNS)?;
        Ok(cooldowns.get(rule_id).copied())
    }

    fn set_rule_last_fired(&self, rule_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut cooldowns: HashMap<String, DateTime<Utc>> = self.read(COOLDOWNS)?;
        cooldowns.insert(rule_id.to_string(), at);
        self.write(COOLDOWNS, &cooldowns)
    }

    fn deployable_context(&self, id: &str) -> StoreResult<Option<DeployableContext>> {
        let contexts: HashMap<String, DeployableContext> = self.read(CONTEXTS)?;
        Ok(contexts.get(id).cloned())
    }

    fn save_deployable_context(&self, context: &DeployableContext) -> StoreResult<()> {
        let mut contexts: HashMap<String, DeployableContext> = self.read(CONTEXTS)?;
        contexts.insert(context.deployable_id.clone(), context.clone());
        self.write(CONTEXTS, &contexts)
    }

    fn signal_definitions(&self, logic_id: &str) -> StoreResult<Option<Vec<SignalDefinition>>> {
        let catalogs: HashMap<String, Vec<SignalDefinition>> = self.read(SIGNAL_DEFS)?;
        Ok(catalogs.get(logic_id).cloned())
    }

    fn save_signal_definitions(
        &self,
        logic_id: &str,
        definitions: &[SignalDefinition],
    ) -> StoreResult<()> {
        let mut catalogs: HashMap<String, Vec<SignalDefinition>> = self.read(SIGNAL_DEFS)?;
        catalogs.insert(logic_id.to_string(), definitions.to_vec());
        self.write(SIGNAL_DEFS, &catalogs)
    }
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> StoreResult<T> {
    match std::fs::read(path) {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(StoreError::Io(err)),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cueproto::ShowLogicDefinition;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, JsonStore) {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn hello(id: &str) -> Hello {
        Hello {
            device_id: id.to_string(),
            hostname: "box".to_string(),
            agent_version: "0.3.0".to_string(),
            ..Hello::default()
        }
    }

    #[test]
    fn test_first_hello_creates_new_record() {
        let (_dir, store) = store();
        let record = store.upsert_from_hello(&hello("dep-1")).unwrap();
        assert_eq!(record.status, DeployableStatus::New);
        assert_eq!(record.agent_version, "0.3.0");

        let listed = store.list_deployables().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].deployable_id, "dep-1");
    }

    #[test]
    fn test_status_survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonStore::open(dir.path()).unwrap();
            store.upsert_from_hello(&hello("dep-1")).unwrap();
            store
                .update_status("dep-1", DeployableStatus::Active)
                .unwrap();
        }
        let store = JsonStore::open(dir.path()).unwrap();
        let record = store.get_deployable("dep-1").unwrap().unwrap();
        assert_eq!(record.status, DeployableStatus::Active);
    }

    #[test]
    fn test_latest_package_by_created_at() {
        let (_dir, store) = store();
        let def: ShowLogicDefinition = serde_json::from_value(json!({
            "logic_id": "lobby", "version": 1, "states": [{"name": "idle"}]
        }))
        .unwrap();
        let mut first = ShowLogicPackage::wrap(&def, "1.0.0");
        first.created_at = Utc::now() - Duration::minutes(5);
        let mut second = ShowLogicPackage::wrap(&def, "1.0.0");
        second.logic_version = 2;
        store.save_package(&first).unwrap();
        store.save_package(&second).unwrap();

        let latest = store.latest_for_logic("lobby").unwrap().unwrap();
        assert_eq!(latest.package_id, second.package_id);
        assert_eq!(latest.logic_version, 2);
        assert!(store.latest_for_logic("other").unwrap().is_none());
    }

    #[test]
    fn test_packages_append_only() {
        let (_dir, store) = store();
        let def: ShowLogicDefinition = serde_json::from_value(json!({
            "logic_id": "lobby", "version": 1, "states": [{"name": "idle"}]
        }))
        .unwrap();
        let pkg = ShowLogicPackage::wrap(&def, "1.0.0");
        store.save_package(&pkg).unwrap();
        store.save_package(&pkg).unwrap();
        assert_eq!(store.list_packages().unwrap().len(), 2);
    }

    #[test]
    fn test_rules_round_trip_sorted() {
        let (_dir, store) = store();
        let rules: Vec<Rule> = serde_json::from_value(json!([
            {"id": "r2", "enabled": true, "when": {}, "then": {"set_state": "b"}},
            {"id": "r1", "enabled": true, "when": {}, "then": {"set_state": "a"}}
        ]))
        .unwrap();
        store.save_rules(&rules).unwrap();
        let listed = store.list_rules().unwrap();
        assert_eq!(listed[0].id, "r1");
        assert_eq!(listed[1].id, "r2");
    }

    #[test]
    fn test_state_snapshot_round_trip() {
        let (_dir, store) = store();
        assert!(store.load_state_snapshot().unwrap().is_none());
        let state = GlobalState::new("idle");
        store.save_state_snapshot(&state).unwrap();
        assert_eq!(store.load_state_snapshot().unwrap().unwrap(), state);
    }

    #[test]
    fn test_cooldown_journal() {
        let (_dir, store) = store();
        assert!(store.rule_last_fired("r1").unwrap().is_none());
        let at = Utc::now();
        store.set_rule_last_fired("r1", at).unwrap();
        assert_eq!(store.rule_last_fired("r1").unwrap(), Some(at));
    }

    #[test]
    fn test_context_and_signal_defs() {
        let (_dir, store) = store();
        let ctx = DeployableContext {
            deployable_id: "dep-1".to_string(),
            logic_id: "lobby".to_string(),
            tags: vec!["east".to_string()],
        };
        store.save_deployable_context(&ctx).unwrap();
        assert_eq!(store.deployable_context("dep-1").unwrap(), Some(ctx));

        let defs: Vec<SignalDefinition> = serde_json::from_value(json!([
            {"name": "button", "type": "bool"}
        ]))
        .unwrap();
        store.save_signal_definitions("lobby", &defs).unwrap();
        assert_eq!(store.signal_definitions("lobby").unwrap(), Some(defs));
        assert!(store.signal_definitions("other").unwrap().is_none());
    }
}
