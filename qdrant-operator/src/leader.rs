//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! Exactly one operator instance may reconcile at a time. The elector task
//! keeps trying to acquire (and then renew) the named lease, and publishes
//! its view of leadership through a watch channel. The run loop blocks on
//! `Leading` before starting any watches, and treats a later transition to
//! `Following` as the signal to drain and exit.
//!
//! Timestamps in the lease are only compared against durations measured
//! locally; clock offsets between instances merely shift takeover timing.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use prometheus::IntGauge;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Name of the lease object coordinating operator instances.
pub const LEASE_NAME: &str = "qdrant-operator";
/// How long leadership is valid without renewal.
pub const LEASE_DURATION: Duration = Duration::from_secs(30);
/// How often the holder renews.
pub const RENEW_PERIOD: Duration = Duration::from_secs(5);
/// How often every instance re-reads the lease and reports leadership.
pub const OBSERVE_PERIOD: Duration = Duration::from_secs(10);

/// Leadership as last observed from the lease.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// This instance holds the lease.
    Leading,
    /// Another live instance holds the lease.
    Following {
        holder: String,
    },
    /// The lease is absent, unheld, or not yet observed. During startup this
    /// means "not yet elected" and must not trigger a shutdown.
    Standby,
}

impl LeaderState {
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, LeaderState::Leading)
    }
}

/// How a lease spec relates to this instance's identity at a point in time.
#[derive(Debug, PartialEq, Eq)]
enum ObservedLease {
    Unheld,
    HeldBySelf,
    HeldByOther { holder: String, expired: bool },
}

fn classify(identity: &str, spec: &LeaseSpec, now: DateTime<Utc>) -> ObservedLease {
    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() {
        return ObservedLease::Unheld;
    }
    if holder == identity {
        return ObservedLease::HeldBySelf;
    }
    let duration =
        Duration::from_secs(u64::try_from(spec.lease_duration_seconds.unwrap_or(0)).unwrap_or(0));
    let expired = spec
        .renew_time
        .as_ref()
        .map_or(true, |renewed| {
            now.signed_duration_since(renewed.0).to_std().map_or(false, |age| age > duration)
        });
    ObservedLease::HeldByOther {
        holder: holder.to_string(),
        expired,
    }
}

/// The task that acquires and maintains the operator lease.
pub struct LeaseElector {
    api: Api<Lease>,
    identity: String,
    state_tx: watch::Sender<LeaderState>,
    shutdown: oneshot::Receiver<()>,
    leader_gauge: IntGauge,
}

/// Handle to a spawned [`LeaseElector`].
pub struct LeaderHandle {
    shutdown: oneshot::Sender<()>,
    state: watch::Receiver<LeaderState>,
    handle: JoinHandle<()>,
}

impl LeaderHandle {
    /// A receiver over the observed leadership state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    /// Blocks until this instance holds the lease.
    ///
    /// Acquisition retries indefinitely; terminal misconfiguration is caught
    /// before the elector is spawned.
    pub async fn wait_leading(&self) {
        let mut state = self.state.clone();
        // Errors only when the elector task is gone, in which case the
        // process is shutting down anyway.
        let _ = state.wait_for(LeaderState::is_leader).await;
    }

    /// Stops the elector, releasing the lease if held.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

impl LeaseElector {
    /// Spawns the elector onto the runtime.
    #[must_use = "the handle is the only way to observe leadership"]
    pub fn spawn(
        client: Client,
        namespace: &str,
        identity: &str,
        leader_gauge: IntGauge,
    ) -> LeaderHandle {
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let elector = LeaseElector {
            api: Api::namespaced(client, namespace),
            identity: identity.to_string(),
            state_tx,
            shutdown: shutdown_rx,
            leader_gauge,
        };
        let handle = tokio::spawn(elector.run());
        LeaderHandle {
            shutdown: shutdown_tx,
            state: state_rx,
            handle,
        }
    }

    async fn run(mut self) {
        info!(identity = %self.identity, lease = LEASE_NAME, "lease elector started");
        let mut renew = tokio::time::interval(RENEW_PERIOD);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut observe = tokio::time::interval(OBSERVE_PERIOD);
        observe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    if self.state_tx.borrow().is_leader() {
                        self.release().await;
                    }
                    break;
                }
                _ = renew.tick() => {
                    if let Err(err) = self.try_acquire_or_renew().await {
                        // Not safe to assume leadership while the apiserver
                        // is unreachable; keep retrying on the next tick.
                        error!(error = %err, "lease acquire/renew failed");
                    }
                }
                _ = observe.tick() => {
                    self.observe().await;
                }
            }
        }
        info!("lease elector stopped");
    }

    /// Re-reads the lease and publishes the observed leadership.
    async fn observe(&self) {
        match self.api.get_opt(LEASE_NAME).await {
            Ok(lease) => {
                let spec = lease.and_then(|lease| lease.spec).unwrap_or_default();
                let state = match classify(&self.identity, &spec, Utc::now()) {
                    ObservedLease::HeldBySelf => LeaderState::Leading,
                    ObservedLease::Unheld => LeaderState::Standby,
                    // An expired foreign holder is still reported: takeover
                    // happens on the renew tick, observation only reports.
                    ObservedLease::HeldByOther { holder, .. } => LeaderState::Following { holder },
                };
                self.publish(state);
            }
            Err(err) => warn!(error = %err, "failed to observe lease"),
        }
    }

    async fn try_acquire_or_renew(&self) -> kube::Result<()> {
        let now = Utc::now();
        let Some(mut lease) = self.api.get_opt(LEASE_NAME).await? else {
            return self.create(now).await;
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        match classify(&self.identity, spec, now) {
            ObservedLease::HeldBySelf => {
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(lease_duration_seconds());
            }
            ObservedLease::Unheld | ObservedLease::HeldByOther { expired: true, .. } => {
                spec.holder_identity = Some(self.identity.clone());
                spec.acquire_time = Some(MicroTime(now));
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(lease_duration_seconds());
                *spec.lease_transitions.get_or_insert(0) += 1;
            }
            ObservedLease::HeldByOther { holder, expired: false } => {
                self.publish(LeaderState::Following { holder });
                return Ok(());
            }
        }

        // Replace keeps the read resourceVersion, so a concurrent writer
        // turns this into a 409 instead of a silent overwrite.
        match self.api.replace(LEASE_NAME, &PostParams::default(), &lease).await {
            Ok(_) => {
                self.publish(LeaderState::Leading);
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!("lost lease update race");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Creates the lease with ourselves as holder. A conflict means another
    /// instance created it first, which is a success for liveness.
    async fn create(&self, now: DateTime<Utc>) -> kube::Result<()> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(lease_duration_seconds()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..LeaseSpec::default()
            }),
        };
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                self.publish(LeaderState::Leading);
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!("lease created concurrently by another instance");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Clears the holder so a successor does not wait out the full duration.
    async fn release(&self) {
        let Ok(Some(mut lease)) = self.api.get_opt(LEASE_NAME).await else {
            return;
        };
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return;
        }
        spec.holder_identity = None;
        spec.acquire_time = None;
        spec.renew_time = None;
        *spec.lease_transitions.get_or_insert(0) += 1;
        if let Err(err) = self.api.replace(LEASE_NAME, &PostParams::default(), &lease).await {
            warn!(error = %err, "failed to release lease on shutdown");
        } else {
            info!("released lease");
        }
        self.publish(LeaderState::Standby);
    }

    fn publish(&self, state: LeaderState) {
        self.leader_gauge.set(i64::from(state.is_leader()));
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                info!(from = ?current, to = ?state, "leadership changed");
                *current = state;
                true
            }
        });
    }
}

fn lease_duration_seconds() -> i32 {
    i32::try_from(LEASE_DURATION.as_secs()).unwrap_or(i32::MAX)
}
