//! In-memory cluster used by the integration tests
//!
//! Pods never run on their own; tests drive them with [`FakeCluster::set_phase`]
//! and [`FakeCluster::terminate`]. Every change is broadcast to open watches.

#![allow(dead_code)] // Not every test binary uses every helper

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::core::ErrorResponse;
use kube::ResourceExt;
use step_engine::status::ContainerTermination;
use step_engine::{
    ClusterApi, Error, LogStream, PipelineConfig, Result, Stage, Step, VolumeDecl, WorkloadEvent,
    WorkloadPhase, WorkloadStatus,
};
use tokio::sync::{broadcast, Notify};

#[derive(Default)]
struct State {
    claims: BTreeMap<String, PersistentVolumeClaim>,
    deleted_claims: Vec<String>,
    pods: BTreeMap<String, Pod>,
    statuses: BTreeMap<String, WorkloadStatus>,
    delete_attempts: Vec<String>,
    failing_pod_deletes: HashSet<String>,
    fail_claim_delete: bool,
    logs: HashMap<String, Vec<u8>>,
}

pub struct FakeCluster {
    state: Mutex<State>,
    events: broadcast::Sender<WorkloadEvent>,
    list_first: bool,
    open_watches: Arc<AtomicUsize>,
    watches_started: AtomicUsize,
}

struct WatchGuard(Arc<AtomicUsize>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

impl FakeCluster {
    /// Watches list current state before streaming changes, like the real watcher.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    /// Watches only deliver changes made after they were opened.
    pub fn delta_only() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    fn build(list_first: bool) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            events,
            list_first,
            open_watches: Arc::new(AtomicUsize::new(0)),
            watches_started: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn publish(&self, status: WorkloadStatus) {
        self.state().statuses.insert(status.name.clone(), status.clone());
        let _ = self.events.send(WorkloadEvent::Applied(status));
    }

    pub fn set_phase(&self, name: &str, phase: WorkloadPhase) {
        let mut status = self
            .state()
            .statuses
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("no pod named {name}"));
        status.phase = phase;
        self.publish(status);
    }

    pub fn terminate(&self, name: &str, phase: WorkloadPhase, exit_code: i32, reason: Option<&str>) {
        let (container, mut status) = {
            let state = self.state();
            let pod = state.pods.get(name).unwrap_or_else(|| panic!("no pod named {name}"));
            let container = pod.spec.as_ref().unwrap().containers[0].name.clone();
            (container, state.statuses[name].clone())
        };
        status.phase = phase;
        status.terminations = vec![ContainerTermination {
            container,
            exit_code,
            reason: reason.map(ToString::to_string),
        }];
        self.publish(status);
    }

    /// Remove a pod behind the engine's back.
    pub fn remove_pod(&self, name: &str) {
        {
            let mut state = self.state();
            state.pods.remove(name);
            state.statuses.remove(name);
        }
        let _ = self.events.send(WorkloadEvent::Deleted(name.to_string()));
    }

    pub fn fail_pod_delete(&self, name: &str) {
        self.state().failing_pod_deletes.insert(name.to_string());
    }

    pub fn fail_claim_delete(&self) {
        self.state().fail_claim_delete = true;
    }

    pub fn set_logs(&self, name: &str, logs: &str) {
        self.state().logs.insert(name.to_string(), logs.as_bytes().to_vec());
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state().pods.get(name).cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state().pods.keys().cloned().collect()
    }

    pub fn claim(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.state().claims.get(name).cloned()
    }

    pub fn claim_names(&self) -> BTreeSet<String> {
        self.state().claims.keys().cloned().collect()
    }

    pub fn deleted_claims(&self) -> Vec<String> {
        self.state().deleted_claims.clone()
    }

    pub fn delete_attempts(&self) -> Vec<String> {
        self.state().delete_attempts.clone()
    }

    pub fn open_watches(&self) -> usize {
        self.open_watches.load(Ordering::SeqCst)
    }

    pub fn watches_started(&self) -> usize {
        self.watches_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        let name = claim.name_any();
        let mut state = self.state();
        if state.claims.contains_key(&name) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("persistentvolumeclaims \"{name}\" already exists"),
            ));
        }
        state.claims.insert(name, claim.clone());
        Ok(())
    }

    async fn delete_claim(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_claim_delete {
            return Err(api_error(500, "InternalError", "etcd unavailable".to_string()));
        }
        if state.claims.remove(name).is_none() {
            return Err(api_error(
                404,
                "NotFound",
                format!("persistentvolumeclaims \"{name}\" not found"),
            ));
        }
        state.deleted_claims.push(name.to_string());
        Ok(())
    }

    async fn create_workload(&self, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        {
            let mut state = self.state();
            if state.pods.contains_key(&name) {
                return Err(api_error(
                    409,
                    "AlreadyExists",
                    format!("pods \"{name}\" already exists"),
                ));
            }
            state.pods.insert(name.clone(), pod.clone());
        }
        self.publish(WorkloadStatus::pending(&name));
        Ok(())
    }

    async fn get_workload(&self, name: &str) -> Result<WorkloadStatus> {
        self.state()
            .statuses
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("pods \"{name}\" not found")))
    }

    async fn delete_workload(&self, name: &str, _grace_period_seconds: u32) -> Result<()> {
        {
            let mut state = self.state();
            state.delete_attempts.push(name.to_string());
            if state.failing_pod_deletes.contains(name) {
                return Err(api_error(500, "InternalError", "injected failure".to_string()));
            }
            if state.pods.remove(name).is_none() {
                return Err(api_error(404, "NotFound", format!("pods \"{name}\" not found")));
            }
            state.statuses.remove(name);
        }
        let _ = self.events.send(WorkloadEvent::Deleted(name.to_string()));
        Ok(())
    }

    fn watch_workload(&self, name: &str) -> BoxStream<'static, Result<WorkloadEvent>> {
        self.watches_started.fetch_add(1, Ordering::SeqCst);
        self.open_watches.fetch_add(1, Ordering::SeqCst);
        let guard = WatchGuard(self.open_watches.clone());

        let rx = self.events.subscribe();
        let initial: Vec<Result<WorkloadEvent>> = if self.list_first {
            self.state()
                .statuses
                .get(name)
                .cloned()
                .map(|status| Ok(WorkloadEvent::Applied(status)))
                .into_iter()
                .collect()
        } else {
            Vec::new()
        };

        let changes = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), (rx, guard))),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(initial).chain(changes).boxed()
    }

    async fn open_log_stream(&self, name: &str, _container: &str) -> Result<LogStream> {
        let state = self.state();
        if !state.pods.contains_key(name) {
            return Err(api_error(404, "NotFound", format!("pods \"{name}\" not found")));
        }
        let logs = state.logs.get(name).cloned().unwrap_or_default();
        Ok(Box::pin(Cursor::new(logs)))
    }
}

/// Holds every pod creation until released, delegating the rest.
pub struct GatedCreate {
    inner: Arc<FakeCluster>,
    /// Signalled when a creation reaches the gate
    pub entered: Notify,
    pub release: Notify,
}

impl GatedCreate {
    pub fn new(inner: Arc<FakeCluster>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl ClusterApi for GatedCreate {
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        self.inner.create_claim(claim).await
    }

    async fn delete_claim(&self, name: &str) -> Result<()> {
        self.inner.delete_claim(name).await
    }

    async fn create_workload(&self, pod: &Pod) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.create_workload(pod).await
    }

    async fn get_workload(&self, name: &str) -> Result<WorkloadStatus> {
        self.inner.get_workload(name).await
    }

    async fn delete_workload(&self, name: &str, grace_period_seconds: u32) -> Result<()> {
        self.inner.delete_workload(name, grace_period_seconds).await
    }

    fn watch_workload(&self, name: &str) -> BoxStream<'static, Result<WorkloadEvent>> {
        self.inner.watch_workload(name)
    }

    async fn open_log_stream(&self, name: &str, container: &str) -> Result<LogStream> {
        self.inner.open_log_stream(name, container).await
    }
}

pub fn step(name: &str, alias: &str, volume: &str) -> Step {
    Step {
        name: name.to_string(),
        alias: alias.to_string(),
        image: "alpine:3.20".to_string(),
        entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
        args: vec!["echo hello".to_string()],
        working_dir: "/pipeline/src".to_string(),
        volumes: vec![volume.to_string()],
        ..Step::default()
    }
}

pub fn pipeline(steps: Vec<Step>) -> PipelineConfig {
    PipelineConfig {
        stages: vec![Stage {
            name: "pipeline".to_string(),
            steps,
            ..Stage::default()
        }],
        volumes: vec![VolumeDecl {
            name: "pipeline_default".to_string(),
            driver: None,
        }],
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fail instead of hanging when a wait never resolves.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation blocked for too long")
}
