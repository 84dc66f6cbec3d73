use anyhow::Context as _;
use domain_operator::calls::{KubeTransport, RequestBuilder};
use domain_operator::config::OperatorConfig;
use domain_operator::controller::events::KubeEventSinkProvider;
use domain_operator::controller::watcher::watch_pods;
use domain_operator::controller::{error_policy, reconcile, Context, DomainPresenceRegistry};
use domain_operator::crd::Domain;
use domain_operator::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use domain_operator::work::Engine;
use futures::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = OperatorConfig::from_env();
    config.validate().context("invalid operator configuration")?;

    build_runtime(&config)
        .context("failed to build tokio runtime")?
        .block_on(run(config))
}

/// Multi-threaded runtime, sized by `worker_threads` when configured
fn build_runtime(config: &OperatorConfig) -> std::io::Result<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = config.worker_threads {
        builder.worker_threads(threads);
    }
    builder.enable_all().build()
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    info!(
        namespace = ?config.namespace,
        worker_threads = ?config.worker_threads,
        "Starting domain operator"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics().context("failed to create metrics registry")?;

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let requests = RequestBuilder::new(Arc::new(KubeTransport::new(client.clone())))
        .with_retry_tuning(config.retry.clone())
        .with_call_timeout(config.call_timeout)
        .with_page_size(config.list_page_size)
        .with_metrics(metrics.clone());
    let engine = Engine::new(shutdown_signal.clone(), Some(metrics.clone()));
    let registry = Arc::new(DomainPresenceRegistry::new());

    let watcher_handle = tokio::spawn(watch_pods(
        client.clone(),
        config.namespace.clone(),
        registry.clone(),
        shutdown_signal.clone(),
    ));

    let ctx = Arc::new(Context::new(
        engine,
        requests,
        registry,
        Arc::new(KubeEventSinkProvider::new(client.clone())),
        shutdown_signal,
        &config,
        Some(metrics),
    ));

    let domains: Api<Domain> = match &config.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    readiness.set_ready();
    info!("Operator ready, starting reconciliation loop");

    // error_policy logs failures
    let controller = Controller::new(domains, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok((domain, action)) = res {
                debug!(domain = %domain.name, action = ?action, "Reconciled");
            }
        });

    let reason = tokio::select! {
        _ = controller => "controller stream ended",
        signal = wait_for_signal() => match signal {
            Ok(name) => name,
            Err(e) => {
                error!(error = %e, "Cannot listen for termination signals");
                "signal handler failure"
            }
        },
    };
    readiness.set_not_ready();

    // wakes fibers sleeping in delays; they end as cancelled
    shutdown_controller.stop(reason);

    info!("Stopping components...");
    watcher_handle.abort();
    health_handle.abort();

    info!("Domain operator shut down");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
