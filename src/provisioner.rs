//! Provisioner
//!
//! Turns an instance record and its challenge into substrate resources: one
//! workload running the challenge image and one exposure publishing it on the
//! instance's external port.

use crate::config::ManagerConfig;
use crate::error::{InstanceError, SubstrateError};
use crate::models::{Challenge, Instance};
use crate::naming::{instance_labels, instance_selector, COMPONENT_EXPOSURE, COMPONENT_WORKLOAD};
use crate::quantity::{parse_cpu_millis, parse_memory_bytes};
use crate::saga::Saga;
use crate::substrate::{
    Deletion, ExposureRef, ExposureSpec, ResourceList, ResourceRequirements, SecurityContext,
    Substrate, WorkloadRef, WorkloadSpec,
};
use futures::FutureExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Failure of one provisioning step
///
/// Resources created by earlier steps have already been removed when this
/// is returned.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("namespace {namespace}: {source}")]
    Namespace {
        namespace: String,
        source: SubstrateError,
    },

    #[error("workload {name}: {source}")]
    Workload { name: String, source: SubstrateError },

    #[error("exposure {name}: {source}")]
    Exposure { name: String, source: SubstrateError },
}

impl From<ProvisionError> for InstanceError {
    fn from(err: ProvisionError) -> Self {
        InstanceError::Provisioning(err.to_string())
    }
}

/// Resources backing a provisioned instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub workload: WorkloadRef,
    pub exposure: ExposureRef,
    pub access_url: String,
}

/// Outcome of deleting an instance's resources
#[derive(Debug, Default)]
pub struct DeprovisionReport {
    pub exposure: Option<Deletion>,
    pub workload: Option<Deletion>,
    pub failures: Vec<String>,
}

impl DeprovisionReport {
    /// Both resources are gone
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of resources this call actually removed
    pub fn removed(&self) -> usize {
        [self.exposure, self.workload]
            .iter()
            .filter(|d| matches!(d, Some(Deletion::Removed)))
            .count()
    }
}

/// Compose the URL a user connects to
pub fn access_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

pub struct Provisioner {
    substrate: Arc<dyn Substrate>,
    config: Arc<ManagerConfig>,
    namespace_ready: OnceCell<()>,
}

impl Provisioner {
    pub fn new(substrate: Arc<dyn Substrate>, config: Arc<ManagerConfig>) -> Self {
        Self {
            substrate,
            config,
            namespace_ready: OnceCell::new(),
        }
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Create the namespace on first use; a failed attempt is retried on the
    /// next call
    async fn ensure_namespace(&self) -> Result<(), ProvisionError> {
        let namespace = &self.config.namespace;
        self.namespace_ready
            .get_or_try_init(|| async {
                self.substrate.ensure_namespace(namespace).await?;
                info!("Namespace {} ready", namespace);
                Ok::<(), SubstrateError>(())
            })
            .await
            .map(|_| ())
            .map_err(|source| ProvisionError::Namespace {
                namespace: namespace.clone(),
                source,
            })
    }

    /// Resources for a challenge, with configured fallbacks for values that
    /// do not parse
    ///
    /// The challenge's CPU and memory figures set both the limit and the
    /// request. Fallback requests are capped at the resolved limits.
    pub fn resources(&self, challenge: &Challenge) -> ResourceRequirements {
        let defaults = &self.config.resources;

        let default_cpu_limit = parse_cpu_millis(&defaults.cpu_limit).unwrap_or(500);
        let default_mem_limit = parse_memory_bytes(&defaults.memory_limit).unwrap_or(512 << 20);
        let default_cpu_request = parse_cpu_millis(&defaults.cpu_request).unwrap_or(100);
        let default_mem_request =
            parse_memory_bytes(&defaults.memory_request).unwrap_or(256 << 20);

        let cpu = parse_cpu_millis(&challenge.cpu_limit);
        let memory = parse_memory_bytes(&challenge.memory_limit);

        let limits = ResourceList {
            cpu_millis: cpu.unwrap_or(default_cpu_limit),
            memory_bytes: memory.unwrap_or(default_mem_limit),
        };
        let requests = ResourceList {
            cpu_millis: cpu.unwrap_or_else(|| default_cpu_request.min(limits.cpu_millis)),
            memory_bytes: memory
                .unwrap_or_else(|| default_mem_request.min(limits.memory_bytes)),
        };
        ResourceRequirements { limits, requests }
    }

    pub fn workload_spec(&self, instance: &Instance, challenge: &Challenge) -> WorkloadSpec {
        WorkloadSpec {
            name: instance.workload_name.clone(),
            namespace: instance.namespace.clone(),
            image: challenge.image.clone(),
            replicas: 1,
            container_port: challenge.port,
            resources: self.resources(challenge),
            security: SecurityContext {
                run_as_user: self.config.security.run_as_user,
                run_as_non_root: true,
                allow_privilege_escalation: false,
                read_only_root_filesystem: self.config.security.read_only_root_filesystem,
            },
            labels: instance_labels(
                instance.user_id,
                instance.challenge_id,
                &instance.id,
                COMPONENT_WORKLOAD,
            ),
            selector: instance_selector(&instance.id),
        }
    }

    pub fn exposure_spec(&self, instance: &Instance) -> ExposureSpec {
        ExposureSpec {
            name: instance.exposure_name.clone(),
            namespace: instance.namespace.clone(),
            external_port: instance.external_port,
            target_port: instance.internal_port,
            selector: instance_selector(&instance.id),
            labels: instance_labels(
                instance.user_id,
                instance.challenge_id,
                &instance.id,
                COMPONENT_EXPOSURE,
            ),
        }
    }

    /// Create the workload, then the exposure
    ///
    /// If the exposure cannot be created the workload is deleted before the
    /// error is returned.
    pub async fn provision(
        &self,
        instance: &Instance,
        challenge: &Challenge,
    ) -> Result<Provisioned, ProvisionError> {
        self.ensure_namespace().await?;

        let workload_spec = self.workload_spec(instance, challenge);
        let workload = self
            .substrate
            .create_workload(&workload_spec)
            .await
            .map_err(|source| ProvisionError::Workload {
                name: workload_spec.name.clone(),
                source,
            })?;
        debug!("Created workload {} for instance {}", workload.name, instance.id);

        let mut saga = Saga::new(format!("provision {}", instance.id));
        {
            let substrate = self.substrate.clone();
            let namespace = workload.namespace.clone();
            let name = workload.name.clone();
            saga.register("create workload", move || {
                async move {
                    substrate.delete_workload(&namespace, &name).await?;
                    Ok(())
                }
                .boxed()
            });
        }

        let exposure_spec = self.exposure_spec(instance);
        let exposure = match self.substrate.create_exposure(&exposure_spec).await {
            Ok(exposure) => exposure,
            Err(source) => {
                warn!(
                    "Exposure {} failed for instance {}, removing workload: {}",
                    exposure_spec.name, instance.id, source
                );
                saga.compensate().await;
                return Err(ProvisionError::Exposure {
                    name: exposure_spec.name,
                    source,
                });
            }
        };
        saga.commit();

        info!(
            "Provisioned instance {} ({} on port {})",
            instance.id, workload.name, instance.external_port
        );
        Ok(Provisioned {
            workload,
            exposure,
            access_url: access_url(&self.config.public_host, instance.external_port),
        })
    }

    /// Delete exposure then workload, tolerating resources that are already
    /// gone; both deletions are attempted even if the first fails
    pub async fn deprovision(&self, instance: &Instance) -> DeprovisionReport {
        let mut report = DeprovisionReport::default();

        match self
            .substrate
            .delete_exposure(&instance.namespace, &instance.exposure_name)
            .await
        {
            Ok(deletion) => report.exposure = Some(deletion),
            Err(e) => report
                .failures
                .push(format!("exposure {}: {}", instance.exposure_name, e)),
        }

        match self
            .substrate
            .delete_workload(&instance.namespace, &instance.workload_name)
            .await
        {
            Ok(deletion) => report.workload = Some(deletion),
            Err(e) => report
                .failures
                .push(format!("workload {}: {}", instance.workload_name, e)),
        }

        report
    }
}
