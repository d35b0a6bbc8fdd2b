//! In-process substrate
//!
//! Keeps workloads and exposures in memory and mimics the orchestrator's
//! behavior where it matters to the lifecycle: name conflicts, external port
//! conflicts and not-found deletes. Faults can be injected per operation.

use super::{
    Deletion, ExposureRef, ExposureSpec, ResourceMeta, Substrate, WorkloadHealth, WorkloadRef,
    WorkloadSpec,
};
use crate::error::{SubstrateError, SubstrateResult};
use crate::naming::{selector_matches, Labels};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// Operations that should fail on their next call(s)
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub fail_workload_create: bool,
    pub fail_exposure_create: bool,
    pub fail_workload_delete: bool,
    pub fail_exposure_delete: bool,
    pub fail_list: bool,
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeSet<String>,
    workloads: BTreeMap<(String, String), WorkloadSpec>,
    exposures: BTreeMap<(String, String), ExposureSpec>,
    health: BTreeMap<(String, String), WorkloadHealth>,
    faults: FaultPlan,
    workload_deletes: usize,
    exposure_deletes: usize,
}

#[derive(Debug, Default)]
pub struct MemorySubstrate {
    state: Mutex<State>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active fault plan
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }

    pub fn clear_faults(&self) {
        self.set_faults(FaultPlan::default());
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains(name)
    }

    pub fn workload_count(&self) -> usize {
        self.state.lock().workloads.len()
    }

    pub fn exposure_count(&self) -> usize {
        self.state.lock().exposures.len()
    }

    /// Number of deletes that actually removed a workload
    pub fn workload_deletes(&self) -> usize {
        self.state.lock().workload_deletes
    }

    /// Number of deletes that actually removed an exposure
    pub fn exposure_deletes(&self) -> usize {
        self.state.lock().exposure_deletes
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<WorkloadSpec> {
        self.state
            .lock()
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn exposure(&self, namespace: &str, name: &str) -> Option<ExposureSpec> {
        self.state
            .lock()
            .exposures
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Override the health reported for a workload (defaults to `Starting`)
    pub fn set_health(&self, namespace: &str, name: &str, health: WorkloadHealth) {
        self.state
            .lock()
            .health
            .insert((namespace.to_string(), name.to_string()), health);
    }

    /// Insert a workload without going through the lifecycle (orphan setup)
    pub fn inject_workload(&self, spec: WorkloadSpec) {
        let key = (spec.namespace.clone(), spec.name.clone());
        self.state.lock().workloads.insert(key, spec);
    }

    /// Drop a workload behind the manager's back (lost resource setup)
    pub fn remove_workload_silently(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .workloads
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

fn list_matching<T>(
    items: &BTreeMap<(String, String), T>,
    namespace: &str,
    selector: &Labels,
    labels_of: impl Fn(&T) -> &Labels,
) -> Vec<ResourceMeta> {
    items
        .iter()
        .filter(|((ns, _), item)| ns == namespace && selector_matches(selector, labels_of(item)))
        .map(|((_, name), item)| ResourceMeta {
            name: name.clone(),
            labels: labels_of(item).clone(),
        })
        .collect()
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn ensure_namespace(&self, name: &str) -> SubstrateResult<()> {
        self.state.lock().namespaces.insert(name.to_string());
        Ok(())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> SubstrateResult<WorkloadRef> {
        let mut state = self.state.lock();
        if state.faults.fail_workload_create {
            return Err(SubstrateError::Api("injected workload create failure".into()));
        }
        if !state.namespaces.contains(&spec.namespace) {
            return Err(SubstrateError::NotFound(format!(
                "namespace {}",
                spec.namespace
            )));
        }
        let key = (spec.namespace.clone(), spec.name.clone());
        if state.workloads.contains_key(&key) {
            return Err(SubstrateError::AlreadyExists(spec.name.clone()));
        }
        state.workloads.insert(key, spec.clone());
        Ok(WorkloadRef {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
        })
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> SubstrateResult<Deletion> {
        let mut state = self.state.lock();
        if state.faults.fail_workload_delete {
            return Err(SubstrateError::Api("injected workload delete failure".into()));
        }
        let key = (namespace.to_string(), name.to_string());
        state.health.remove(&key);
        match state.workloads.remove(&key) {
            Some(_) => {
                state.workload_deletes += 1;
                Ok(Deletion::Removed)
            }
            None => Ok(Deletion::AlreadyAbsent),
        }
    }

    async fn create_exposure(&self, spec: &ExposureSpec) -> SubstrateResult<ExposureRef> {
        let mut state = self.state.lock();
        if state.faults.fail_exposure_create {
            return Err(SubstrateError::Api("injected exposure create failure".into()));
        }
        let key = (spec.namespace.clone(), spec.name.clone());
        if state.exposures.contains_key(&key) {
            return Err(SubstrateError::AlreadyExists(spec.name.clone()));
        }
        if state
            .exposures
            .values()
            .any(|e| e.external_port == spec.external_port)
        {
            return Err(SubstrateError::AlreadyExists(format!(
                "port {} is already allocated",
                spec.external_port
            )));
        }
        state.exposures.insert(key, spec.clone());
        Ok(ExposureRef {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
        })
    }

    async fn delete_exposure(&self, namespace: &str, name: &str) -> SubstrateResult<Deletion> {
        let mut state = self.state.lock();
        if state.faults.fail_exposure_delete {
            return Err(SubstrateError::Api("injected exposure delete failure".into()));
        }
        match state
            .exposures
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => {
                state.exposure_deletes += 1;
                Ok(Deletion::Removed)
            }
            None => Ok(Deletion::AlreadyAbsent),
        }
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> SubstrateResult<Vec<ResourceMeta>> {
        let state = self.state.lock();
        if state.faults.fail_list {
            return Err(SubstrateError::Api("injected list failure".into()));
        }
        Ok(list_matching(&state.workloads, namespace, selector, |w| {
            &w.labels
        }))
    }

    async fn list_exposures(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> SubstrateResult<Vec<ResourceMeta>> {
        let state = self.state.lock();
        if state.faults.fail_list {
            return Err(SubstrateError::Api("injected list failure".into()));
        }
        Ok(list_matching(&state.exposures, namespace, selector, |e| {
            &e.labels
        }))
    }

    async fn workload_health(&self, namespace: &str, name: &str) -> SubstrateResult<WorkloadHealth> {
        let state = self.state.lock();
        let key = (namespace.to_string(), name.to_string());
        if !state.workloads.contains_key(&key) {
            return Ok(WorkloadHealth::Missing);
        }
        Ok(state
            .health
            .get(&key)
            .copied()
            .unwrap_or(WorkloadHealth::Starting))
    }
}
