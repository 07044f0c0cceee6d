//! # Watch/Wait Coordinator
//!
//! Turns pod state-change events into blocking "return when pod X reaches
//! condition C" calls.
//!
//! One watch runs per pod no matter how many callers are waiting on it.
//! Callers hold an `Arc<Subscription>`; the first subscriber starts the
//! watch, and dropping the last one stops it. State is fanned out through a
//! `tokio::sync::watch` channel, so waiters suspend rather than poll.
//!
//! Before blocking, every wait reads the pod directly. A transition that
//! completed before the watch delivered anything is therefore still seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::{ClusterApi, WorkloadEvent};
use crate::error::{Error, Result};
use crate::status::WorkloadPhase;

/// What a waiter is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Running or finished
    Started,
    /// Succeeded or failed
    Terminated,
}

impl Condition {
    #[must_use]
    pub fn is_met(self, phase: WorkloadPhase) -> bool {
        match self {
            Self::Started => phase.has_started(),
            Self::Terminated => phase.is_terminal(),
        }
    }
}

/// Latest knowledge about a watched pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Unobserved,
    Phase(WorkloadPhase),
    Deleted,
    Closed,
}

impl Observed {
    /// Terminal phases are sticky so a late waiter still sees how the pod
    /// ended even if it was deleted right after.
    fn advance(self, next: Observed) -> Observed {
        match self {
            Observed::Phase(phase) if phase.is_terminal() => self,
            _ => next,
        }
    }
}

type Registry = Mutex<HashMap<String, Weak<Subscription>>>;

pub struct Subscription {
    workload: String,
    state: watch::Receiver<Observed>,
    pump: JoinHandle<()>,
    registry: Weak<Registry>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pump.abort();
        debug!(workload = %self.workload, "Stopped pod watch");

        if let Some(registry) = self.registry.upgrade() {
            let mut subscriptions = registry.lock().unwrap_or_else(PoisonError::into_inner);
            let dead = subscriptions
                .get(&self.workload)
                .is_some_and(|weak| weak.strong_count() == 0);
            if dead {
                subscriptions.remove(&self.workload);
            }
        }
    }
}

impl Subscription {
    #[must_use]
    pub fn workload(&self) -> &str {
        &self.workload
    }
}

pub struct WatchHub {
    cluster: Arc<dyn ClusterApi>,
    registry: Arc<Registry>,
}

impl WatchHub {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the watch for `workload`, starting it if nobody holds one.
    #[must_use]
    pub fn subscribe(&self, workload: &str) -> Arc<Subscription> {
        let mut subscriptions = self.registry.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = subscriptions.get(workload).and_then(Weak::upgrade) {
            return existing;
        }

        let (tx, rx) = watch::channel(Observed::Unobserved);
        let events = self.cluster.watch_workload(workload);
        let pump = tokio::spawn(pump_events(workload.to_string(), events, tx));

        let subscription = Arc::new(Subscription {
            workload: workload.to_string(),
            state: rx,
            pump,
            registry: Arc::downgrade(&self.registry),
        });
        subscriptions.insert(workload.to_string(), Arc::downgrade(&subscription));
        debug!(workload = %workload, "Started pod watch");
        subscription
    }

    /// Number of pods currently being watched
    #[must_use]
    pub fn active_watches(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Block until `workload` satisfies `condition`, the token is cancelled,
    /// or `deadline` elapses.
    pub async fn await_condition(
        &self,
        workload: &str,
        condition: Condition,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<WorkloadPhase> {
        let subscription = self.subscribe(workload);

        let wait = self.wait_on(&subscription, condition);
        let result = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled {
                workload: workload.to_string(),
            }),
            () = sleep_or_forever(deadline) => Err(Error::DeadlineExceeded {
                workload: workload.to_string(),
                timeout: deadline.unwrap_or_default(),
            }),
            result = wait => result,
        };

        drop(subscription);
        result
    }

    async fn wait_on(
        &self,
        subscription: &Subscription,
        condition: Condition,
    ) -> Result<WorkloadPhase> {
        let workload = subscription.workload();

        // Subscribed first, so anything after this read reaches the channel.
        let current = self.cluster.get_workload(workload).await.map_err(|e| {
            if e.is_not_found() {
                lost(workload, "pod does not exist")
            } else {
                e
            }
        })?;
        if condition.is_met(current.phase) {
            debug!(workload = %workload, phase = %current.phase, "Condition already met");
            return Ok(current.phase);
        }

        let mut state = subscription.state.clone();
        let observed = state
            .wait_for(|observed| match observed {
                Observed::Phase(phase) => condition.is_met(*phase),
                Observed::Unobserved => false,
                Observed::Deleted | Observed::Closed => true,
            })
            .await
            .map(|observed| *observed)
            .map_err(|_| lost(workload, "watch ended"))?;

        match observed {
            Observed::Phase(phase) => Ok(phase),
            Observed::Deleted => Err(lost(workload, "pod was deleted")),
            Observed::Closed | Observed::Unobserved => Err(lost(workload, "watch ended")),
        }
    }
}

async fn pump_events(
    workload: String,
    mut events: BoxStream<'static, Result<WorkloadEvent>>,
    tx: watch::Sender<Observed>,
) {
    while let Some(event) = events.next().await {
        let next = match event {
            Ok(WorkloadEvent::Applied(status)) if status.name == workload => {
                debug!(workload = %workload, phase = %status.phase, "Pod updated");
                Observed::Phase(status.phase)
            }
            Ok(WorkloadEvent::Deleted(name)) if name == workload => {
                debug!(workload = %workload, "Pod deleted");
                Observed::Deleted
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(workload = %workload, error = %e, "Pod watch error");
                continue;
            }
        };
        tx.send_modify(|observed| *observed = observed.advance(next));
    }

    debug!(workload = %workload, "Pod watch stream ended");
    tx.send_modify(|observed| *observed = observed.advance(Observed::Closed));
}

async fn sleep_or_forever(deadline: Option<Duration>) {
    match deadline {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

fn lost(workload: &str, reason: &str) -> Error {
    Error::Observation {
        workload: workload.to_string(),
        reason: reason.to_string(),
    }
}
