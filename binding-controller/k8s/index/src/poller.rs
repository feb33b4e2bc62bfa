//! Periodically reconciles the BoundEndpoints in the operator namespace with
//! the endpoints reported by the remote API.
//!
//! Each pass takes one snapshot of both sides, rebuilds the port allocator
//! from the live records, and then applies creates, updates and deletes in
//! three independent retry loops. Starting a pass cancels the previous
//! pass's loops and waits for their in-flight requests to finish, so two
//! passes never mutate records concurrently.

use crate::{
    metrics::PollerMetrics,
    store::{BindingStore, StoreError},
};
use binding_controller_core::{
    aggregate, aggregate::endpoints_summary, diff, Actions, AggregateError, AllocError,
    AllowPolicy, EndpointSource, PortAllocator, Update,
};
use binding_controller_k8s_api::{
    BindingEndpoint, BoundEndpoint, BoundEndpointSpec, BoundEndpointStatus, ResourceExt,
};
use kubert::lease::Claim;
use std::{future::Future, sync::Arc};
use tokio::{sync::watch, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};


pub struct Poller<S, E> {
    source: Arc<E>,
    applier: Applier<S>,
    allow: AllowPolicy,
    interval: time::Duration,
    lease: Option<LeaseGate>,
    metrics: PollerMetrics,
}

/// Restricts polling to the current holder of the write lease.
pub struct LeaseGate {
    claims: watch::Receiver<Arc<Claim>>,
    identity: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("failed to list remote endpoints: {0:#}")]
    Source(anyhow::Error),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("failed to list BoundEndpoints: {0}")]
    Store(#[source] StoreError),

    #[error("BoundEndpoint ports are inconsistent: {0}")]
    Corrupt(#[source] AllocError),
}

/// The apply loops started by one pass.
#[must_use]
pub struct Pass {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Applies individual actions against the store.
struct Applier<S> {
    store: Arc<S>,
    ports: Arc<PortAllocator>,
    retry_interval: time::Duration,
}

// === impl Poller ===

impl<S, E> Poller<S, E>
where
    S: BindingStore,
    E: EndpointSource + 'static,
{
    pub fn new(
        store: Arc<S>,
        source: Arc<E>,
        ports: Arc<PortAllocator>,
        allow: AllowPolicy,
        interval: time::Duration,
        retry_interval: time::Duration,
        metrics: PollerMetrics,
    ) -> Self {
        Self {
            source,
            applier: Applier {
                store,
                ports,
                retry_interval,
            },
            allow,
            interval,
            lease: None,
            metrics,
        }
    }

    pub fn with_lease(mut self, claims: watch::Receiver<Arc<Claim>>, identity: impl ToString) -> Self {
        self.lease = Some(LeaseGate {
            claims,
            identity: identity.to_string(),
        });
        self
    }

    /// Polls immediately and then every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut current: Option<Pass> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Some(pass) = current.take() {
                pass.cancel().await;
            }

            if !self.is_leader() {
                tracing::debug!("Not the lease holder; skipping poll");
                self.metrics.pass("skipped");
                continue;
            }

            match self.poll(shutdown.child_token()).await {
                Ok(pass) => {
                    self.metrics.pass("ok");
                    current = Some(pass);
                }
                Err(error) => {
                    tracing::error!(%error, "Poll failed");
                    self.metrics.pass("error");
                }
            }
            self.metrics.allocated(&self.applier.ports);
        }

        if let Some(pass) = current.take() {
            pass.cancel().await;
        }
        tracing::debug!("Poller stopped");
    }

    fn is_leader(&self) -> bool {
        match &self.lease {
            Some(LeaseGate { claims, identity }) => claims.borrow().is_current_for(identity),
            None => true,
        }
    }

    /// Runs one pass and returns its apply loops.
    ///
    /// Nothing in the cluster is modified if fetching, aggregating, listing or
    /// rebuilding the allocator fails.
    pub async fn poll(&self, token: CancellationToken) -> Result<Pass, PollError> {
        let remote = self
            .source
            .list_endpoints()
            .await
            .map_err(PollError::Source)?;
        let mut desired = aggregate(&remote)?;
        for binding in desired.values_mut() {
            binding.spec.allowed = self.allow.permits(&binding.spec.endpoint_uri);
        }

        // Records that are being torn down no longer own their URI or port.
        let existing = self
            .applier
            .store
            .list()
            .await
            .map_err(PollError::Store)?
            .into_iter()
            .filter(|b| b.metadata.deletion_timestamp.is_none())
            .collect::<Vec<_>>();

        self.applier
            .ports
            .rebuild(existing.iter().filter_map(BoundEndpoint::local_port))
            .map_err(PollError::Corrupt)?;

        let Actions {
            create,
            update,
            delete,
        } = diff(existing, &mut desired);
        tracing::info!(
            endpoints = remote.len(),
            create = create.len(),
            update = update.len(),
            delete = delete.len(),
            "Applying changes"
        );

        let applier = &self.applier;
        let tasks = vec![
            applier.spawn("create", create, token.clone(), |a, b| async move {
                a.create(b).await
            }),
            applier.spawn("update", update, token.clone(), |a, u| async move {
                a.update(u).await
            }),
            applier.spawn("delete", delete, token.clone(), |a, b| async move {
                a.delete(b).await
            }),
        ];
        Ok(Pass { token, tasks })
    }
}

// === impl Pass ===

impl Pass {
    /// Waits for every apply loop to succeed or be cancelled.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Stops retrying and waits for in-flight requests to complete.
    pub async fn cancel(self) {
        self.token.cancel();
        self.join().await;
    }
}

// === impl Applier ===

impl<S> Clone for Applier<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ports: self.ports.clone(),
            retry_interval: self.retry_interval,
        }
    }
}

impl<S: BindingStore> Applier<S> {
    /// Spawns a loop that applies each item, retrying only the failed ones
    /// every retry interval until all succeed or `token` is cancelled. An
    /// item is never interrupted mid-request.
    fn spawn<T, F, Fut>(
        &self,
        kind: &'static str,
        mut pending: Vec<T>,
        token: CancellationToken,
        apply: F,
    ) -> JoinHandle<()>
    where
        T: Send + 'static,
        F: Fn(Self, T) -> Fut + Send + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        let applier = self.clone();
        tokio::spawn(
            async move {
                let mut attempt = 1usize;
                while !pending.is_empty() {
                    let mut failed = Vec::new();
                    for item in pending {
                        if token.is_cancelled() {
                            return;
                        }
                        if let Some(item) = apply(applier.clone(), item).await {
                            failed.push(item);
                        }
                    }
                    if failed.is_empty() {
                        break;
                    }

                    tracing::debug!(failed = failed.len(), attempt, "Retrying");
                    pending = failed;
                    attempt += 1;
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = time::sleep(applier.retry_interval) => {}
                    }
                }
            }
            .instrument(info_span!("apply", kind)),
        )
    }

    /// Allocates a port and creates the record. Returns the binding if it
    /// should be retried.
    async fn create(self, binding: BoundEndpoint) -> Option<BoundEndpoint> {
        let name = binding.name_any();
        let port = match self.ports.set_any() {
            Ok(port) => port,
            Err(error) => {
                tracing::warn!(%name, %error, "Failed to allocate port");
                return Some(binding);
            }
        };

        let mut record = binding.clone();
        record.spec.port = port;
        record.status = None;

        let current = match self.store.create(&record).await {
            Ok(created) => {
                tracing::info!(%name, uri = %binding.spec.endpoint_uri, port, "Created BoundEndpoint");
                created
            }
            Err(StoreError::AlreadyExists(_)) => {
                // The record was created elsewhere and keeps its own port.
                self.ports.unset(port);
                match self.store.get(&name).await {
                    Ok(existing) => {
                        if let Some(port) = existing.local_port() {
                            if let Err(error) = self.ports.set(port) {
                                tracing::warn!(
                                    %name,
                                    port,
                                    %error,
                                    "Existing BoundEndpoint holds a conflicting port",
                                );
                            }
                        }
                        existing
                    }
                    Err(error) => {
                        tracing::warn!(%name, %error, "Failed to fetch existing BoundEndpoint");
                        return Some(binding);
                    }
                }
            }
            Err(error) => {
                self.ports.unset(port);
                tracing::warn!(%name, %error, "Failed to create BoundEndpoint");
                return Some(binding);
            }
        };

        match self.write_status(current, binding.status.as_ref()).await {
            Ok(()) => None,
            Err(error) => {
                tracing::warn!(%name, %error, "Failed to update BoundEndpoint status");
                Some(binding)
            }
        }
    }

    /// Brings an existing record's spec and endpoint refs up to date. The
    /// record keeps the port it already holds.
    async fn update(self, update: Update) -> Option<Update> {
        let name = update.existing.name_any();

        // Work from the freshest copy; the reconciler may have written
        // status since the pass listed it.
        let mut current = match self.store.get(&name).await {
            Ok(current) => current,
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(%name, "BoundEndpoint deleted before update");
                return None;
            }
            Err(error) => {
                tracing::warn!(%name, %error, "Failed to fetch BoundEndpoint");
                return Some(update);
            }
        };

        let mut allocated = None;
        let port = match current.local_port() {
            Some(port) => port,
            None => match self.ports.set_any() {
                Ok(port) => {
                    allocated = Some(port);
                    port
                }
                Err(error) => {
                    tracing::warn!(%name, %error, "Failed to allocate port");
                    return Some(update);
                }
            },
        };
        let spec = BoundEndpointSpec {
            port,
            ..update.desired.spec.clone()
        };

        if current.spec != spec {
            current.spec = spec;
            current = match self.store.replace(&current).await {
                Ok(replaced) => {
                    tracing::info!(%name, "Updated BoundEndpoint");
                    replaced
                }
                Err(error) => {
                    if let Some(port) = allocated {
                        self.ports.unset(port);
                    }
                    tracing::warn!(%name, %error, "Failed to update BoundEndpoint");
                    return Some(update);
                }
            };
        }

        match self.write_status(current, update.desired.status.as_ref()).await {
            Ok(()) => None,
            Err(error) => {
                tracing::warn!(%name, %error, "Failed to update BoundEndpoint status");
                Some(update)
            }
        }
    }

    /// Deletes the record and releases its port.
    async fn delete(self, binding: BoundEndpoint) -> Option<BoundEndpoint> {
        let name = binding.name_any();
        match self.store.delete(&name).await {
            Ok(()) => tracing::info!(%name, uri = %binding.spec.endpoint_uri, "Deleted BoundEndpoint"),
            Err(StoreError::NotFound(_)) => tracing::debug!(%name, "BoundEndpoint already deleted"),
            Err(error) => {
                tracing::warn!(%name, %error, "Failed to delete BoundEndpoint");
                return Some(binding);
            }
        }
        if let Some(port) = binding.local_port() {
            self.ports.unset(port);
        }
        None
    }

    /// Replaces the endpoint refs in `current`'s status with `desired`'s.
    ///
    /// All refs share one status, so new refs inherit whatever the existing
    /// refs currently report.
    async fn write_status(
        &self,
        mut current: BoundEndpoint,
        desired: Option<&BoundEndpointStatus>,
    ) -> Result<(), StoreError> {
        let Some(desired) = desired else {
            return Ok(());
        };
        let status = current.status.get_or_insert_with(Default::default);

        let shared = status.endpoints.first().cloned();
        let endpoints = desired
            .endpoints
            .iter()
            .map(|ep| match &shared {
                Some(shared) => BindingEndpoint {
                    id: ep.id.clone(),
                    uri: ep.uri.clone(),
                    status: shared.status,
                    error_code: shared.error_code.clone(),
                    error_message: shared.error_message.clone(),
                },
                None => ep.clone(),
            })
            .collect::<Vec<_>>();

        let summary = Some(endpoints_summary(endpoints.len()));
        if status.endpoints == endpoints
            && status.hashed_name == desired.hashed_name
            && status.endpoints_summary == summary
        {
            return Ok(());
        }

        status.endpoints = endpoints;
        status.hashed_name = desired.hashed_name.clone();
        status.endpoints_summary = summary;
        self.store.replace_status(&current).await.map(|_| ())
    }
}
