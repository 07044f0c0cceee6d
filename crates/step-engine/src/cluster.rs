//! Kubernetes lifecycle client
//!
//! [`ClusterApi`] is the single seam between the engine and the cluster. The
//! production implementation, [`KubeCluster`], owns one authenticated client
//! and scopes every verb to the namespace it was built with.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::logs::{self, LogStream};
use crate::status::WorkloadStatus;

/// State change of a single watched pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    Applied(WorkloadStatus),
    Deleted(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<()>;

    async fn delete_claim(&self, name: &str) -> Result<()>;

    async fn create_workload(&self, pod: &Pod) -> Result<()>;

    async fn get_workload(&self, name: &str) -> Result<WorkloadStatus>;

    async fn delete_workload(&self, name: &str, grace_period_seconds: u32) -> Result<()>;

    /// Events for one pod. Implementations should deliver the current state
    /// before incremental changes.
    fn watch_workload(&self, name: &str) -> BoxStream<'static, Result<WorkloadEvent>>;

    async fn open_log_stream(&self, name: &str, container: &str) -> Result<LogStream>;
}

#[derive(Clone)]
pub struct KubeCluster {
    namespace: String,
    pods: Api<Pod>,
    claims: Api<PersistentVolumeClaim>,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            pods: Api::namespaced(client.clone(), namespace),
            claims: Api::namespaced(client, namespace),
        }
    }

    /// Build the client from the configured kubeconfig and endpoint.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let client = build_client(config).await?;
        info!(namespace = %config.namespace, "Connected to Kubernetes cluster");
        Ok(Self::new(client, &config.namespace))
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

async fn build_client(config: &EngineConfig) -> Result<Client> {
    let mut kube_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await?
        }
        None => kube::Config::infer().await?,
    };

    if let Some(endpoint) = &config.endpoint {
        kube_config.cluster_url = endpoint
            .parse()
            .map_err(|e| Error::Config(format!("Invalid endpoint {endpoint}: {e}")))?;
    }

    Client::try_from(kube_config)
        .map_err(|e| Error::Config(format!("Failed to build Kubernetes client: {e}")))
}

/// Watch scoped to a single pod by name
fn name_selector(name: &str) -> watcher::Config {
    watcher::Config::default().fields(&format!("metadata.name={name}"))
}

fn workload_event(event: watcher::Event<Pod>) -> Option<WorkloadEvent> {
    match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
            Some(WorkloadEvent::Applied(WorkloadStatus::from(&pod)))
        }
        watcher::Event::Delete(pod) => Some(WorkloadEvent::Deleted(pod.name_any())),
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

fn background_delete(grace_period_seconds: Option<u32>) -> DeleteParams {
    DeleteParams {
        grace_period_seconds,
        propagation_policy: Some(PropagationPolicy::Background),
        ..DeleteParams::default()
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        let created = self.claims.create(&PostParams::default(), claim).await?;
        info!(
            claim = %created.name_any(),
            namespace = %self.namespace,
            "Created PVC"
        );
        Ok(())
    }

    async fn delete_claim(&self, name: &str) -> Result<()> {
        self.claims.delete(name, &background_delete(None)).await?;
        info!(claim = %name, namespace = %self.namespace, "Deleted PVC");
        Ok(())
    }

    async fn create_workload(&self, pod: &Pod) -> Result<()> {
        let created = self.pods.create(&PostParams::default(), pod).await?;
        info!(
            workload = %created.name_any(),
            namespace = %self.namespace,
            "Created step pod"
        );
        Ok(())
    }

    async fn get_workload(&self, name: &str) -> Result<WorkloadStatus> {
        let pod = self.pods.get(name).await?;
        Ok(WorkloadStatus::from(&pod))
    }

    async fn delete_workload(&self, name: &str, grace_period_seconds: u32) -> Result<()> {
        self.pods
            .delete(name, &background_delete(Some(grace_period_seconds)))
            .await?;
        info!(
            workload = %name,
            namespace = %self.namespace,
            grace_period_seconds,
            "Deleted step pod"
        );
        Ok(())
    }

    fn watch_workload(&self, name: &str) -> BoxStream<'static, Result<WorkloadEvent>> {
        debug!(workload = %name, namespace = %self.namespace, "Starting pod watch");
        watcher(self.pods.clone(), name_selector(name))
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(event) => workload_event(event).map(Ok),
                    Err(e) => Some(Err(Error::Watch(e))),
                }
            })
            .boxed()
    }

    async fn open_log_stream(&self, name: &str, container: &str) -> Result<LogStream> {
        logs::open_log_stream(self.pods.clone(), name, container).await
    }
}
