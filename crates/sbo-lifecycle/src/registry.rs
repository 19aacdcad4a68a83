//! Durable instance registry. The registry is the sole source of truth for
//! which instances exist; the Runtime Driver is the source of truth for
//! whether their containers are actually up.

use sbo_persist::JsonStore;
use sbo_proto::Instance;
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub struct Registry {
    records: HashMap<String, Instance>,
    store: JsonStore,
}

impl Registry {
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "instances");
        let records = store.load();
        Self { records, store }
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.records.get(id)
    }

    pub fn list(&self) -> Vec<&Instance> {
        let mut all: Vec<&Instance> = self.records.values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn upsert(&mut self, instance: Instance) {
        self.records.insert(instance.id.clone(), instance);
        self.snapshot();
    }

    pub fn remove(&mut self, id: &str) -> Option<Instance> {
        let removed = self.records.remove(id);
        self.snapshot();
        removed
    }

    pub fn existing_ids(&self) -> HashSet<String> {
        self.records.keys().cloned().collect()
    }

    pub fn used_ports(&self) -> HashSet<u16> {
        self.records
            .values()
            .flat_map(|i| i.ports.entries().into_iter().map(|(_, port)| port))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.records) {
            tracing::warn!(error = %e, "failed to snapshot instance registry");
        }
    }
}
