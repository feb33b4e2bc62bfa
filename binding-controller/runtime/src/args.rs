use crate::{
    core::{parse_port_range, AllowPolicy, PortAllocator},
    forwarder::{self, ListenerSet, TunnelDialer},
    index::{
        binding, KubeBindingStore, KubeServiceStore, OwnerIndex, Poller, PollerMetrics,
        ReconcileMetrics,
    },
    index_list::IndexList,
    k8s, lease, HttpEndpointSource,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::future;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::IpAddr, sync::Arc};
use tokio::{task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

pub(crate) const FIELD_MANAGER: &str = "binding-controller";

const API_TIMEOUT: Duration = Duration::from_secs(30);
const RECONCILE_RETRY: Duration = Duration::from_secs(30);
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[clap(name = "binding", about = "Binds remote endpoints into the cluster")]
pub struct Args {
    #[clap(
        long,
        default_value = "binding=info,warn",
        env = "BINDING_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace holding BoundEndpoints and the upstream Services.
    #[clap(long, default_value = "binding-system", env = "POD_NAMESPACE")]
    operator_namespace: String,

    /// Name of the KubernetesOperator that describes this installation.
    #[clap(long, default_value = "binding-operator")]
    operator_name: String,

    /// Deployment that owns the write Lease.
    #[clap(long, default_value = "binding-operator")]
    deployment_name: String,

    #[clap(long, default_value = "svc.cluster.local")]
    cluster_domain: String,

    /// Inclusive range of local ports handed out to bindings.
    #[clap(long, default_value = "10000-65535")]
    port_range: String,

    #[clap(long, default_value = "10")]
    poll_interval_secs: u64,

    /// How often failed creates, updates and deletes are retried within a
    /// poll.
    #[clap(long, default_value = "5")]
    retry_interval_secs: u64,

    /// Comma-separated endpoint URI globs that may be bound.
    #[clap(long, default_value = "*")]
    allowed_urls: AllowPolicy,

    #[clap(long, default_value = "https://api.ngrok.com")]
    api_url: String,

    #[clap(long, env = "BINDING_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Address the forwarder's listeners bind to.
    #[clap(long, default_value = "0.0.0.0")]
    forwarder_bind_addr: IpAddr,

    /// Disables the endpoint poller, e.g. on forwarder-only replicas.
    #[clap(long)]
    disable_poller: bool,

    #[clap(long)]
    disable_forwarder: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            operator_namespace,
            operator_name,
            deployment_name,
            cluster_domain,
            port_range,
            poll_interval_secs,
            retry_interval_secs,
            allowed_urls,
            api_url,
            api_key,
            forwarder_bind_addr,
            disable_poller,
            disable_forwarder,
        } = self;

        let port_range = parse_port_range(&port_range)?;
        forwarder::ensure_crypto_provider();

        let mut prom = <Registry>::default();
        let binding_reg = prom.sub_registry_with_prefix("binding");
        let poller_metrics = PollerMetrics::register(binding_reg);
        let reconcile_metrics = ReconcileMetrics::register(binding_reg);
        let forwarder_metrics =
            forwarder::ForwarderMetrics::register(prom.sub_registry_with_prefix("forwarder"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let client = runtime.client();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        // One watch on BoundEndpoints feeds both the owner index and, unless
        // disabled, the forwarder's listeners.
        let owners = OwnerIndex::shared();
        let bindings = runtime.watch_namespaced::<k8s::BoundEndpoint>(
            operator_namespace.clone(),
            watcher::Config::default(),
        );
        if disable_forwarder {
            tokio::spawn(
                kubert::index::namespaced(owners.clone(), bindings)
                    .instrument(info_span!("boundendpoints")),
            );
        } else {
            let dialer = Arc::new(TunnelDialer::new(
                client.clone(),
                &operator_namespace,
                &operator_name,
            ));
            let listeners = forwarder::Index::shared(
                ListenerSet::new(forwarder_bind_addr),
                dialer,
                forwarder_metrics,
            );
            let indexes = IndexList::new(owners.clone()).push(listeners).shared();
            tokio::spawn(
                kubert::index::namespaced(indexes, bindings)
                    .instrument(info_span!("boundendpoints")),
            );
        }

        let ctx = Arc::new(binding::Context {
            store: Arc::new(KubeServiceStore::new(client.clone(), FIELD_MANAGER)),
            prober: Arc::new(binding::TcpProber::default()),
            config: binding::Config {
                operator_namespace: operator_namespace.clone(),
                cluster_domain,
                retry_interval: RECONCILE_RETRY,
                resync_interval: RESYNC_INTERVAL,
            },
            metrics: reconcile_metrics,
        });
        tasks.push(tokio::spawn(
            binding::run(client.clone(), ctx, owners, shutdown.clone())
                .instrument(info_span!("reconciler")),
        ));

        if disable_poller {
            tracing::info!("Endpoint poller disabled");
        } else {
            let hostname =
                std::env::var("HOSTNAME").context("Failed to fetch `HOSTNAME` environment variable")?;
            let claims = lease::init(&runtime, &operator_namespace, &deployment_name, &hostname)
                .await?;

            let source = HttpEndpointSource::new(&api_url, api_key, API_TIMEOUT)?;
            let poller = Poller::new(
                Arc::new(KubeBindingStore::new(client, &operator_namespace)),
                Arc::new(source),
                Arc::new(PortAllocator::new(port_range)?),
                allowed_urls,
                Duration::from_secs(poll_interval_secs),
                Duration::from_secs(retry_interval_secs),
                poller_metrics,
            )
            .with_lease(claims, hostname);
            tasks.push(tokio::spawn(
                poller.run(shutdown.clone()).instrument(info_span!("poller")),
            ));
        }

        tokio::spawn(release_on_shutdown(
            runtime.shutdown_handle(),
            shutdown,
            tasks,
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Stops the poller and reconciler when the runtime begins shutting down,
/// holding shutdown open until their in-flight work completes.
async fn release_on_shutdown(
    drain: drain::Watch,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
) {
    let release = drain.signaled().await;
    token.cancel();
    release.release_after(future::join_all(tasks)).await;
}
