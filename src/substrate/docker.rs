//! Docker substrate
//!
//! Maps the substrate model onto a single Docker host:
//! - namespace -> user-defined bridge network
//! - workload  -> challenge container attached to the network, reachable
//!   under the instance selector as a network alias
//! - exposure  -> small forwarding container publishing the external port
//!   on the host and relaying to `selector:container_port`
//!
//! Every container carries the instance labels so reconciliation can list
//! them with label filters.

use super::{
    Deletion, ExposureRef, ExposureSpec, ResourceMeta, Substrate, WorkloadHealth, WorkloadRef,
    WorkloadSpec,
};
use crate::config::DockerSettings;
use crate::error::{SubstrateError, SubstrateResult};
use crate::naming::{Labels, LABEL_MANAGED_BY, MANAGER_NAME};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, EndpointSettings, HealthStatusEnum, HostConfig, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// CPU shares Docker assigns to one full core
const SHARES_PER_CORE: u64 = 1024;

pub struct DockerSubstrate {
    docker: Docker,
    settings: DockerSettings,
}

impl DockerSubstrate {
    /// Connect to the Docker daemon and verify it answers
    pub async fn connect(settings: DockerSettings) -> SubstrateResult<Self> {
        let docker = match &settings.socket_path {
            Some(path) => Docker::connect_with_unix(
                path,
                settings.timeout_secs,
                bollard::API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_local_defaults()?,
        };

        docker.ping().await?;
        info!("Connected to Docker daemon");

        Ok(Self { docker, settings })
    }

    /// Pull an image if not present
    async fn ensure_image(&self, image: &str) -> SubstrateResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image {} already exists", image);
            return Ok(());
        }
        if !self.settings.pull_missing_images {
            return Err(SubstrateError::NotFound(format!("image {}", image)));
        }

        info!("Pulling image: {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(SubstrateError::Api(format!(
                        "Failed to pull image {}: {}",
                        image, e
                    )));
                }
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }

    /// Create then start a container, removing it again if start fails
    async fn create_and_start(&self, name: &str, config: Config<String>) -> SubstrateResult<()> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        self.docker.create_container(Some(options), config).await?;

        if let Err(e) = self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            warn!("Failed to start container {}: {}, removing it", name, e);
            if let Err(remove_err) = self.remove(name).await {
                warn!("Failed to remove unstarted container {}: {}", name, remove_err);
            }
            return Err(e.into());
        }

        Ok(())
    }

    async fn remove(&self, name: &str) -> SubstrateResult<Deletion> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(Deletion::Removed),
            Err(e) => match SubstrateError::from(e) {
                SubstrateError::NotFound(_) => Ok(Deletion::AlreadyAbsent),
                other => Err(other),
            },
        }
    }

    async fn list(&self, namespace: &str, selector: &Labels) -> SubstrateResult<Vec<ResourceMeta>> {
        let mut label_filters: Vec<String> = selector
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        label_filters.push(format!("{}={}", LABEL_MANAGED_BY, MANAGER_NAME));

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);
        filters.insert("network".to_string(), vec![namespace.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                let labels: Labels = c.labels.unwrap_or_default().into_iter().collect();
                Some(ResourceMeta { name, labels })
            })
            .collect())
    }
}

fn to_map(labels: &Labels) -> HashMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn security_opts() -> Vec<String> {
    vec!["no-new-privileges:true".to_string()]
}

fn checked_i64(value: Option<u64>, what: &str) -> SubstrateResult<i64> {
    value
        .and_then(|v| i64::try_from(v).ok())
        .ok_or_else(|| SubstrateError::Api(format!("{} out of range", what)))
}

/// Container config for a challenge workload
fn workload_config(spec: &WorkloadSpec) -> SubstrateResult<Config<String>> {
    let port_key = format!("{}/tcp", spec.container_port);
    let limits = spec.resources.limits;
    let requests = spec.resources.requests;

    let mut security_opt = Vec::new();
    if !spec.security.allow_privilege_escalation {
        security_opt.extend(security_opts());
    }

    let nano_cpus = checked_i64(limits.cpu_millis.checked_mul(1_000_000), "cpu limit")?;
    let cpu_shares = checked_i64(
        requests
            .cpu_millis
            .checked_mul(SHARES_PER_CORE)
            .map(|shares| (shares / 1000).max(2)),
        "cpu request",
    )?;
    let memory = checked_i64(Some(limits.memory_bytes), "memory limit")?;
    let memory_reservation = checked_i64(Some(requests.memory_bytes), "memory request")?;

    let host_config = HostConfig {
        nano_cpus: Some(nano_cpus),
        cpu_shares: Some(cpu_shares),
        memory: Some(memory),
        memory_reservation: Some(memory_reservation),
        security_opt: Some(security_opt),
        readonly_rootfs: Some(spec.security.read_only_root_filesystem),
        network_mode: Some(spec.namespace.clone()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    let mut endpoints = HashMap::new();
    endpoints.insert(
        spec.namespace.clone(),
        EndpointSettings {
            aliases: Some(vec![spec.selector.clone()]),
            ..Default::default()
        },
    );

    Ok(Config {
        image: Some(spec.image.clone()),
        labels: Some(to_map(&spec.labels)),
        user: Some(format!(
            "{}:{}",
            spec.security.run_as_user, spec.security.run_as_user
        )),
        exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
        host_config: Some(host_config),
        networking_config: Some(NetworkingConfig {
            endpoints_config: endpoints,
        }),
        ..Default::default()
    })
}

/// Container config for the forwarder backing an exposure
///
/// The forwarder listens on the external port inside its own network
/// namespace too, so it never needs a privileged port.
fn exposure_config(spec: &ExposureSpec, image: &str, run_as_user: u32) -> Config<String> {
    let port_key = format!("{}/tcp", spec.external_port);

    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(spec.external_port.to_string()),
        }]),
    );

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        network_mode: Some(spec.namespace.clone()),
        security_opt: Some(security_opts()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    Config {
        image: Some(image.to_string()),
        labels: Some(to_map(&spec.labels)),
        user: Some(format!("{}:{}", run_as_user, run_as_user)),
        cmd: Some(vec![
            format!("TCP-LISTEN:{},fork,reuseaddr", spec.external_port),
            format!("TCP:{}:{}", spec.selector, spec.target_port),
        ]),
        exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl Substrate for DockerSubstrate {
    async fn ensure_namespace(&self, name: &str) -> SubstrateResult<()> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!("Docker network {} already exists", name);
                return Ok(());
            }
            Err(e) => match SubstrateError::from(e) {
                SubstrateError::NotFound(_) => {}
                other => return Err(other),
            },
        }

        let mut labels = HashMap::new();
        labels.insert("purpose".to_string(), "ctf-challenges".to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());

        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            labels,
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => {
                info!("Created namespace network: {}", name);
                Ok(())
            }
            // lost a creation race with another manager process
            Err(e) => match SubstrateError::from(e) {
                SubstrateError::AlreadyExists(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> SubstrateResult<WorkloadRef> {
        if spec.replicas != 1 {
            return Err(SubstrateError::Api(format!(
                "Docker substrate runs exactly one replica, got {}",
                spec.replicas
            )));
        }

        let config = workload_config(spec)?;
        self.ensure_image(&spec.image).await?;
        self.create_and_start(&spec.name, config).await?;

        info!(
            "Created workload {} ({}) in {}",
            spec.name, spec.image, spec.namespace
        );
        Ok(WorkloadRef {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
        })
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> SubstrateResult<Deletion> {
        let deletion = self.remove(name).await?;
        debug!("Deleted workload {}/{}: {:?}", namespace, name, deletion);
        Ok(deletion)
    }

    async fn create_exposure(&self, spec: &ExposureSpec) -> SubstrateResult<ExposureRef> {
        self.ensure_image(&self.settings.exposure_image).await?;

        let config = exposure_config(
            spec,
            &self.settings.exposure_image,
            self.settings.forwarder_user,
        );
        self.create_and_start(&spec.name, config).await?;

        info!(
            "Created exposure {} ({} -> {}:{})",
            spec.name, spec.external_port, spec.selector, spec.target_port
        );
        Ok(ExposureRef {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
        })
    }

    async fn delete_exposure(&self, namespace: &str, name: &str) -> SubstrateResult<Deletion> {
        let deletion = self.remove(name).await?;
        debug!("Deleted exposure {}/{}: {:?}", namespace, name, deletion);
        Ok(deletion)
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> SubstrateResult<Vec<ResourceMeta>> {
        self.list(namespace, selector).await
    }

    async fn list_exposures(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> SubstrateResult<Vec<ResourceMeta>> {
        self.list(namespace, selector).await
    }

    async fn workload_health(&self, _namespace: &str, name: &str) -> SubstrateResult<WorkloadHealth> {
        let inspected = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspected) => inspected,
            Err(e) => {
                return match SubstrateError::from(e) {
                    SubstrateError::NotFound(_) => Ok(WorkloadHealth::Missing),
                    other => Err(other),
                }
            }
        };

        let Some(state) = inspected.state else {
            return Ok(WorkloadHealth::Starting);
        };

        let health = match state.status {
            Some(ContainerStateStatusEnum::RUNNING) => {
                match state.health.and_then(|h| h.status) {
                    Some(HealthStatusEnum::HEALTHY) => WorkloadHealth::Ready,
                    Some(HealthStatusEnum::UNHEALTHY) => WorkloadHealth::Failed,
                    Some(HealthStatusEnum::STARTING) => WorkloadHealth::Starting,
                    // no healthcheck defined in the image: running is ready
                    _ => WorkloadHealth::Ready,
                }
            }
            Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
                WorkloadHealth::Failed
            }
            _ => WorkloadHealth::Starting,
        };

        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceId;
    use crate::naming::{instance_labels, COMPONENT_EXPOSURE, COMPONENT_WORKLOAD};
    use crate::substrate::{ResourceList, ResourceRequirements, SecurityContext};

    fn spec() -> WorkloadSpec {
        let id = InstanceId::new();
        WorkloadSpec {
            name: "ctf-7-5-abc".to_string(),
            namespace: "ctf-instances".to_string(),
            image: "xss-vuln".to_string(),
            replicas: 1,
            container_port: 80,
            resources: ResourceRequirements {
                limits: ResourceList {
                    cpu_millis: 500,
                    memory_bytes: 512 * 1024 * 1024,
                },
                requests: ResourceList {
                    cpu_millis: 100,
                    memory_bytes: 256 * 1024 * 1024,
                },
            },
            security: SecurityContext {
                run_as_user: 1000,
                run_as_non_root: true,
                allow_privilege_escalation: false,
                read_only_root_filesystem: false,
            },
            labels: instance_labels(7, 5, &id, COMPONENT_WORKLOAD),
            selector: "inst-abc".to_string(),
        }
    }

    #[test]
    fn test_workload_config_limits() {
        let config = workload_config(&spec()).unwrap();
        let host = config.host_config.unwrap();

        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.memory_reservation, Some(256 * 1024 * 1024));
        assert_eq!(host.cpu_shares, Some(102));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
        assert_eq!(host.network_mode.as_deref(), Some("ctf-instances"));
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));
    }

    #[test]
    fn test_workload_config_rejects_oversize_limits() {
        let mut oversize = spec();
        oversize.resources.limits.cpu_millis = 20_000_000_000_000;
        assert!(matches!(
            workload_config(&oversize),
            Err(SubstrateError::Api(_))
        ));

        let mut oversize = spec();
        oversize.resources.limits.memory_bytes = 10_000_000_000_000_000_000;
        assert!(matches!(
            workload_config(&oversize),
            Err(SubstrateError::Api(_))
        ));
    }

    #[test]
    fn test_workload_config_alias_is_selector() {
        let config = workload_config(&spec()).unwrap();
        let endpoints = config.networking_config.unwrap().endpoints_config;
        let aliases = endpoints["ctf-instances"].aliases.clone().unwrap();
        assert_eq!(aliases, vec!["inst-abc".to_string()]);
    }

    #[test]
    fn test_exposure_config_binds_external_port() {
        let id = InstanceId::new();
        let exposure = ExposureSpec {
            name: "svc-ctf-7-5-abc".to_string(),
            namespace: "ctf-instances".to_string(),
            external_port: 30042,
            target_port: 80,
            selector: "inst-abc".to_string(),
            labels: instance_labels(7, 5, &id, COMPONENT_EXPOSURE),
        };
        let config = exposure_config(&exposure, "alpine/socat:latest", 1000);

        let bindings = config.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings["30042/tcp"].clone().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("30042"));
        assert_eq!(
            config.cmd.unwrap(),
            vec![
                "TCP-LISTEN:30042,fork,reuseaddr".to_string(),
                "TCP:inst-abc:80".to_string()
            ]
        );
    }
}
