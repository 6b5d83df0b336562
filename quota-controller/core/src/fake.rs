//! An in-memory cluster with resource-version checked updates.

use crate::{ClusterAccessor, QuotaRecord, StorageClassView, UpdateError, Volume};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<State>>,
    yielding: bool,
}

#[derive(Default)]
pub(crate) struct State {
    classes: BTreeMap<String, StorageClassView>,
    volumes: Vec<Volume>,
    next_resource_version: u64,
    updates: usize,
    before_update: Option<Box<dyn FnOnce(&mut State) + Send>>,
    conflict_always: bool,
    fail_reads: bool,
    fail_writes: bool,
}

pub(crate) fn class(
    name: &str,
    record: QuotaRecord,
    allow_volume_expansion: bool,
) -> StorageClassView {
    StorageClassView {
        name: name.to_string(),
        annotations: record.encode(&BTreeMap::new()),
        allow_volume_expansion,
        resource_version: String::new(),
    }
}

// === impl FakeCluster ===

impl FakeCluster {
    /// Yields to the scheduler on every read so that concurrent callers
    /// interleave between reading a class and writing it back.
    pub(crate) fn yielding(mut self) -> Self {
        self.yielding = true;
        self
    }

    pub(crate) fn add_class(&self, class: StorageClassView) {
        self.state.lock().insert_class(class);
    }

    pub(crate) fn add_unmanaged_class(&self, name: &str, allow_volume_expansion: bool) {
        self.add_class(StorageClassView {
            name: name.to_string(),
            annotations: BTreeMap::new(),
            allow_volume_expansion,
            resource_version: String::new(),
        });
    }

    pub(crate) fn add_volume(&self, storage_class: Option<&str>, capacity_bytes: i64) {
        self.state.lock().volumes.push(Volume {
            storage_class_name: storage_class.map(Into::into),
            capacity_bytes,
        });
    }

    pub(crate) fn set_annotation(&self, name: &str, key: &str, value: &str) {
        let mut state = self.state.lock();
        let mut class = state.classes[name].clone();
        class.annotations.insert(key.to_string(), value.to_string());
        state.insert_class(class);
    }

    pub(crate) fn record(&self, name: &str) -> QuotaRecord {
        QuotaRecord::decode(&self.state.lock().classes[name].annotations)
            .expect("fake class must carry a valid quota record")
    }

    pub(crate) fn resource_version(&self, name: &str) -> String {
        self.state.lock().classes[name].resource_version.clone()
    }

    /// The number of updates that have been accepted.
    pub(crate) fn updates(&self) -> usize {
        self.state.lock().updates
    }

    /// Runs `f` against the cluster state immediately before the next update
    /// is checked, simulating a concurrent writer.
    pub(crate) fn before_next_update(&self, f: impl FnOnce(&mut State) + Send + 'static) {
        self.state.lock().before_update = Some(Box::new(f));
    }

    pub(crate) fn conflict_always(&self) {
        self.state.lock().conflict_always = true;
    }

    pub(crate) fn fail_reads(&self) {
        self.state.lock().fail_reads = true;
    }

    pub(crate) fn fail_writes(&self) {
        self.state.lock().fail_writes = true;
    }

    async fn pause(&self) {
        if self.yielding {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait::async_trait]
impl ClusterAccessor for FakeCluster {
    async fn get_storage_class(&self, name: &str) -> anyhow::Result<Option<StorageClassView>> {
        let class = {
            let state = self.state.lock();
            if state.fail_reads {
                return Err(anyhow!("the server is currently unable to handle the request"));
            }
            state.classes.get(name).cloned()
        };
        self.pause().await;
        Ok(class)
    }

    async fn list_storage_classes(&self) -> anyhow::Result<Vec<StorageClassView>> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(anyhow!("the server is currently unable to handle the request"));
        }
        Ok(state.classes.values().cloned().collect())
    }

    async fn update_storage_class(
        &self,
        name: &str,
        resource_version: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), UpdateError> {
        let mut state = self.state.lock();
        if let Some(f) = state.before_update.take() {
            f(&mut *state);
        }
        if state.fail_writes {
            return Err(anyhow!("admission webhook denied the request").into());
        }

        let mut class = state
            .classes
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("storageclasses.storage.k8s.io \"{name}\" not found"))?;
        if state.conflict_always || class.resource_version != resource_version {
            return Err(UpdateError::Conflict(name.to_string()));
        }

        class.annotations = annotations;
        state.insert_class(class);
        state.updates += 1;
        Ok(())
    }

    async fn list_volumes(&self) -> anyhow::Result<Vec<Volume>> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(anyhow!("the server is currently unable to handle the request"));
        }
        Ok(state.volumes.clone())
    }
}

// === impl State ===

impl State {
    /// Overwrites a class's quota record as another writer would.
    pub(crate) fn write_record(&mut self, name: &str, record: QuotaRecord) {
        let mut class = self.classes[name].clone();
        class.annotations = record.encode(&class.annotations);
        self.insert_class(class);
    }

    fn insert_class(&mut self, mut class: StorageClassView) {
        self.next_resource_version += 1;
        class.resource_version = self.next_resource_version.to_string();
        self.classes.insert(class.name.clone(), class);
    }
}
