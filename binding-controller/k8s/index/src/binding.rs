//! Projects each BoundEndpoint into a pair of Services and tracks whether
//! the binding is reachable.
//!
//! Each reconciliation drives the record through:
//!
//! ```text
//! Denied                                   (allowed = false; terminal)
//! ServicesNotCreated -> ServicesCreated -> ConnectivityVerified | ConnectivityFailed
//! ```
//!
//! `Ready` is derived from the two sub-conditions after every step. Status
//! writes always start from a freshly fetched copy of the record.

use crate::{
    metrics::ReconcileMetrics,
    owners::SharedOwnerIndex,
    store::{ServiceStore, StoreError},
};
use binding_controller_core::conditions::{self, error_code, reason};
use binding_controller_k8s_api::{
    self as k8s, labels, BoundEndpoint, BoundEndpointStatus, Condition, EndpointStatus,
    ResourceExt, Service, ServiceRef,
};
use futures::StreamExt;
use kube::runtime::{
    controller::{Action, Controller},
    reflector::ObjectRef,
    watcher,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

mod probe;
pub mod services;

pub use self::probe::{ProbeError, Prober, TcpProber};

pub const FINALIZER: &str = "bindings.k8s.ngrok.com/finalizer";

#[derive(Clone, Debug)]
pub struct Config {
    pub operator_namespace: String,
    pub cluster_domain: String,

    /// How long to wait before reconciling a binding that failed.
    pub retry_interval: Duration,

    /// How often a healthy binding is re-verified.
    pub resync_interval: Duration,
}

pub struct Context<S, P> {
    pub store: Arc<S>,
    pub prober: Arc<P>,
    pub config: Config,
    pub metrics: ReconcileMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("BoundEndpoint {0} has no namespace")]
    MissingNamespace(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
enum ServiceError {
    #[error("namespace {0} does not exist")]
    MissingNamespace(String),

    #[error("Service {namespace}/{name} already exists and is not owned by this binding")]
    NotOwned { namespace: String, name: String },

    #[error("target port {0} is not a valid port")]
    InvalidPort(i32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The outcome of one reconciliation, applied to the record's status.
struct Outcome {
    services: Option<Condition>,
    connectivity: Option<Condition>,
    ready: Option<Condition>,
    endpoints: EndpointStatus,
    error: Option<(&'static str, String)>,
    refs: Option<(ServiceRef, ServiceRef)>,
}

/// Runs the reconciler until `shutdown` fires.
///
/// BoundEndpoints are watched in the operator namespace. Changes to owned
/// Services are mapped back through their owner labels, and Namespace
/// changes through the owner index.
pub async fn run<S, P>(
    client: k8s::Client,
    ctx: Arc<Context<S, P>>,
    owners: SharedOwnerIndex,
    shutdown: CancellationToken,
) where
    S: ServiceStore,
    P: Prober,
{
    let bindings =
        k8s::Api::<BoundEndpoint>::namespaced(client.clone(), &ctx.config.operator_namespace);
    let services = k8s::Api::<Service>::all(client.clone());
    let namespaces = k8s::Api::<k8s::Namespace>::all(client);

    Controller::new(bindings, watcher::Config::default())
        .watches(
            services,
            watcher::Config::default().labels(&labels::owned_selector()),
            |svc| {
                labels::owner_of(svc.labels())
                    .map(|(name, namespace)| ObjectRef::new(name).within(namespace))
            },
        )
        .watches(namespaces, watcher::Config::default(), move |ns| {
            owners
                .read()
                .owners_of(&ns.name_any())
                .into_iter()
                .map(|owner| ObjectRef::new(&owner.name).within(&owner.namespace))
                .collect::<Vec<_>>()
        })
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => tracing::trace!(name = %obj.name, "Reconciled"),
                Err(error) => tracing::debug!(%error, "Reconcile failed"),
            }
        })
        .await;
    tracing::debug!("Binding reconciler stopped");
}

fn error_policy<S, P>(
    binding: Arc<BoundEndpoint>,
    error: &ReconcileError,
    ctx: Arc<Context<S, P>>,
) -> Action {
    tracing::warn!(name = %binding.name_any(), %error, "Failed to reconcile BoundEndpoint");
    Action::requeue(ctx.config.retry_interval)
}

pub async fn reconcile<S, P>(
    binding: Arc<BoundEndpoint>,
    ctx: Arc<Context<S, P>>,
) -> Result<Action, ReconcileError>
where
    S: ServiceStore,
    P: Prober,
{
    let name = binding.name_any();
    let namespace = binding
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;

    if binding.metadata.deletion_timestamp.is_some() {
        return finalize(&binding, &namespace, &ctx).await;
    }

    let finalizers = binding.finalizers();
    if !finalizers.iter().any(|f| f == FINALIZER) {
        let mut finalizers = finalizers.to_vec();
        finalizers.push(FINALIZER.to_string());
        ctx.store
            .set_finalizers(&namespace, &name, finalizers)
            .await?;
    }

    let generation = binding.metadata.generation;
    let cfg = &ctx.config;

    if !binding.spec.allowed {
        tracing::info!(%name, uri = %binding.spec.endpoint_uri, "Binding denied");
        if let Err(error) = remove_services(&binding, &ctx).await {
            tracing::warn!(%name, %error, "Failed to remove Services of denied binding");
        }
        let message = format!(
            "{} is not permitted by the operator's allowed URLs",
            binding.spec.endpoint_uri
        );
        let outcome = Outcome {
            services: None,
            connectivity: None,
            ready: Some(conditions::new(
                conditions::READY,
                false,
                reason::DENIED,
                message.clone(),
                generation,
            )),
            endpoints: EndpointStatus::Denied,
            error: Some((error_code::DENIED, message)),
            refs: None,
        };
        write_status(&ctx, &namespace, &name, outcome).await?;
        return Ok(Action::await_change());
    }

    let Some(local_port) = binding.local_port() else {
        let services = conditions::new(
            conditions::SERVICES_CREATED,
            false,
            reason::SERVICES_NOT_CREATED,
            "Waiting for a local port to be allocated",
            generation,
        );
        let outcome = Outcome {
            services: Some(services),
            connectivity: None,
            ready: None,
            endpoints: EndpointStatus::Provisioning,
            error: None,
            refs: None,
        };
        write_status(&ctx, &namespace, &name, outcome).await?;
        return Ok(Action::await_change());
    };

    let refs = match apply_services(&binding, local_port, &ctx).await {
        Ok(refs) => refs,
        Err(ServiceError::Store(StoreError::Conflict(_))) => {
            // Another writer got there first; reconcile against its result.
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        Err(error) => {
            tracing::warn!(%name, %error, "Failed to apply Services");
            let message = conditions::normalize_message(&error.to_string());
            let outcome = Outcome {
                services: Some(conditions::new(
                    conditions::SERVICES_CREATED,
                    false,
                    reason::SERVICE_CREATION_FAILED,
                    message.clone(),
                    generation,
                )),
                connectivity: None,
                ready: None,
                endpoints: EndpointStatus::Error,
                error: Some((error_code::SERVICE_CREATION_FAILED, message)),
                refs: None,
            };
            write_status(&ctx, &namespace, &name, outcome).await?;
            return Ok(Action::requeue(cfg.retry_interval));
        }
    };

    let services = conditions::new(
        conditions::SERVICES_CREATED,
        true,
        reason::SERVICES_CREATED,
        "Services created",
        generation,
    );

    let target = &binding.spec.target;
    let host = format!("{}.{}.{}", target.service, target.namespace, cfg.cluster_domain);
    // apply_services has already rejected out-of-range target ports.
    let port = u16::try_from(target.port).unwrap_or_default();
    let (connectivity, endpoints, error, action) = match ctx.prober.probe(&host, port).await {
        Ok(()) => {
            tracing::info!(%name, %host, port, "Connectivity verified");
            let cond = conditions::new(
                conditions::CONNECTIVITY_VERIFIED,
                true,
                reason::CONNECTIVITY_VERIFIED,
                "Connectivity verified",
                generation,
            );
            (
                cond,
                EndpointStatus::Bound,
                None,
                Action::requeue(cfg.resync_interval),
            )
        }
        Err(error) => {
            tracing::info!(%name, %error, "Connectivity check failed");
            let message = conditions::normalize_message(&error.to_string());
            let cond = conditions::new(
                conditions::CONNECTIVITY_VERIFIED,
                false,
                reason::CONNECTIVITY_FAILED,
                message.clone(),
                generation,
            );
            (
                cond,
                EndpointStatus::Error,
                Some((error_code::CONNECTIVITY_FAILED, message)),
                Action::requeue(cfg.retry_interval),
            )
        }
    };

    let outcome = Outcome {
        services: Some(services),
        connectivity: Some(connectivity),
        ready: None,
        endpoints,
        error,
        refs: Some(refs),
    };
    write_status(&ctx, &namespace, &name, outcome).await?;
    Ok(action)
}

/// Creates or updates both Services, returning references to them.
async fn apply_services<S, P>(
    binding: &BoundEndpoint,
    local_port: u16,
    ctx: &Context<S, P>,
) -> Result<(ServiceRef, ServiceRef), ServiceError>
where
    S: ServiceStore,
{
    let cfg = &ctx.config;
    let target = &binding.spec.target;
    if !(1..=i32::from(u16::MAX)).contains(&target.port) {
        return Err(ServiceError::InvalidPort(target.port));
    }
    if !ctx.store.namespace_exists(&target.namespace).await? {
        return Err(ServiceError::MissingNamespace(target.namespace.clone()));
    }

    let name = binding.name_any();
    let target_svc = services::target(binding, &cfg.operator_namespace, &cfg.cluster_domain);
    apply_service(&*ctx.store, &target_svc, &name, &cfg.operator_namespace).await?;

    let upstream_svc = services::upstream(binding, &cfg.operator_namespace, local_port);
    apply_service(&*ctx.store, &upstream_svc, &name, &cfg.operator_namespace).await?;

    Ok((
        ServiceRef {
            name: target.service.clone(),
            namespace: Some(target.namespace.clone()),
        },
        ServiceRef {
            name,
            namespace: Some(cfg.operator_namespace.clone()),
        },
    ))
}

async fn apply_service<S: ServiceStore>(
    store: &S,
    desired: &Service,
    owner: &str,
    owner_ns: &str,
) -> Result<(), ServiceError> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    match store.get_service(&namespace, &name).await? {
        None => {
            store.create_service(desired).await?;
            tracing::info!(%namespace, %name, "Created Service");
        }
        Some(existing) => {
            if !services::is_owned_by(&existing, owner, owner_ns) {
                return Err(ServiceError::NotOwned { namespace, name });
            }
            if let Some(updated) = services::merge(&existing, desired) {
                store.replace_service(&updated).await?;
                tracing::info!(%namespace, %name, "Updated Service");
            }
        }
    }
    Ok(())
}

/// Deletes both Services. The target namespace may already be gone, and a
/// target Service that this binding does not own is left alone.
async fn remove_services<S, P>(binding: &BoundEndpoint, ctx: &Context<S, P>) -> Result<(), StoreError>
where
    S: ServiceStore,
{
    let cfg = &ctx.config;
    let name = binding.name_any();
    ctx.store
        .delete_service(&cfg.operator_namespace, &name)
        .await?;

    let target = &binding.spec.target;
    if ctx.store.namespace_exists(&target.namespace).await? {
        if let Some(svc) = ctx
            .store
            .get_service(&target.namespace, &target.service)
            .await?
        {
            if services::is_owned_by(&svc, &name, &cfg.operator_namespace) {
                ctx.store
                    .delete_service(&target.namespace, &target.service)
                    .await?;
            }
        }
    }
    Ok(())
}

async fn finalize<S, P>(
    binding: &BoundEndpoint,
    namespace: &str,
    ctx: &Context<S, P>,
) -> Result<Action, ReconcileError>
where
    S: ServiceStore,
{
    let finalizers = binding.finalizers();
    if !finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(Action::await_change());
    }

    let name = binding.name_any();
    remove_services(binding, ctx).await?;
    tracing::info!(%name, "Removed Services");

    let remaining = finalizers
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    match ctx.store.set_finalizers(namespace, &name, remaining).await {
        Ok(()) | Err(StoreError::NotFound(_)) => Ok(Action::await_change()),
        Err(error) => Err(error.into()),
    }
}

/// Applies `outcome` to the freshest copy of the record and writes it if
/// anything changed.
async fn write_status<S, P>(
    ctx: &Context<S, P>,
    namespace: &str,
    name: &str,
    outcome: Outcome,
) -> Result<(), StoreError>
where
    S: ServiceStore,
{
    let mut current = ctx.store.get_binding(namespace, name).await?;
    let generation = current.metadata.generation;
    let before = current.status.clone();
    let status = current.status.get_or_insert_with(Default::default);

    apply_outcome(status, outcome, generation);
    let ready = conditions::find(&status.conditions, conditions::READY)
        .map(|c| c.status == k8s::ConditionStatus::True);
    ctx.metrics.reconciled(ready);

    if current.status == before {
        return Ok(());
    }
    ctx.store.update_binding_status(&current).await
}

fn apply_outcome(status: &mut BoundEndpointStatus, outcome: Outcome, generation: Option<i64>) {
    let Outcome {
        services,
        connectivity,
        ready,
        endpoints,
        error,
        refs,
    } = outcome;

    if endpoints == EndpointStatus::Denied {
        status.conditions.retain(|c| c.typ == conditions::READY);
    }
    for cond in [services, connectivity].into_iter().flatten() {
        conditions::set(&mut status.conditions, cond);
    }
    let ready = ready.unwrap_or_else(|| {
        conditions::derive_ready(
            conditions::find(&status.conditions, conditions::SERVICES_CREATED),
            conditions::find(&status.conditions, conditions::CONNECTIVITY_VERIFIED),
            generation,
        )
    });
    conditions::set(&mut status.conditions, ready);

    let (code, message) = match error {
        Some((code, message)) => (Some(code.to_string()), Some(message)),
        None => (None, None),
    };
    for ep in &mut status.endpoints {
        ep.status = endpoints;
        ep.error_code = code.clone();
        ep.error_message = message.clone();
    }

    match refs {
        Some((target, upstream)) => {
            status.target_service_ref = Some(target);
            status.upstream_service_ref = Some(upstream);
        }
        None if endpoints == EndpointStatus::Denied => {
            status.target_service_ref = None;
            status.upstream_service_ref = None;
        }
        None => {}
    }
}
